use crate::error::Error;
use crate::net::UdpSocket;
use crate::types::{FirmwareVersion, ScanSyncDiscovered, ScanSyncFlags, ScanSyncStatus};
use crate::Result;
use byteorder::{BigEndian, ByteOrder};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

/// UDP port ScanSync devices broadcast their state on, roughly every 1 ms.
pub const SCANSYNC_UDP_PORT: u16 = 11234;

pub const SCANSYNC_PACKET_V1_SIZE: usize = 32;
pub const SCANSYNC_PACKET_V3_SIZE: usize = 76;
pub const SCANSYNC_PACKET_MAX_SIZE: usize = 76;

/// Magic value of the first reserved word in v2 packets; v2 predates the
/// explicit version field so this sentinel disambiguates it from v3.
const V2_RESERVED_0: u32 = 0xAAAA_AAAA;

/// ScanSyncs unheard from for longer than this are evicted.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

fn timestamp_ns(buf: &[u8], offset: usize) -> u64 {
    let seconds = BigEndian::read_u32(&buf[offset..offset + 4]) as u64;
    let nanos = BigEndian::read_u32(&buf[offset + 4..offset + 8]) as u64;
    seconds * 1_000_000_000 + nanos
}

/// Parse one ScanSync broadcast packet.
///
/// The packet version arrived with v3; older versions are recovered from
/// the packet size, and v2 from the reserved-word magic pattern. Fields
/// defined at or below the detected version are populated; later fields
/// stay zero.
pub(crate) fn parse_packet(buf: &[u8]) -> Option<(ScanSyncDiscovered, ScanSyncStatus)> {
    let len = buf.len();

    let version = if len < SCANSYNC_PACKET_V1_SIZE {
        return None;
    } else if len == SCANSYNC_PACKET_V1_SIZE {
        1
    } else if len < SCANSYNC_PACKET_V3_SIZE {
        if len >= 62 {
            BigEndian::read_u16(&buf[60..62]) as u32
        } else {
            0
        }
    } else if BigEndian::read_u32(&buf[60..64]) == V2_RESERVED_0 {
        2
    } else {
        BigEndian::read_u16(&buf[60..62]) as u32
    };

    if version == 0 {
        return None;
    }

    let mut discovered = ScanSyncDiscovered::default();
    let mut status = ScanSyncStatus::default();

    status.serial_number = BigEndian::read_u32(&buf[0..4]);
    status.sequence = BigEndian::read_u32(&buf[4..8]);
    status.timestamp_ns = timestamp_ns(buf, 8);
    status.encoder = {
        let high = BigEndian::read_u32(&buf[24..28]) as i64;
        let low = BigEndian::read_u32(&buf[28..32]) as i64;
        (high << 32) | low
    };
    discovered.serial_number = status.serial_number;

    if version >= 2 && len >= 60 {
        status.flags = ScanSyncFlags::from_bits_truncate(BigEndian::read_u32(&buf[32..36]));
        status.aux_y_timestamp_ns = timestamp_ns(buf, 36);
        status.index_z_timestamp_ns = timestamp_ns(buf, 44);
        status.sync_timestamp_ns = timestamp_ns(buf, 52);
    }

    if version >= 3 && len >= 68 {
        discovered.firmware_version = FirmwareVersion::new(
            BigEndian::read_u16(&buf[62..64]) as u32,
            BigEndian::read_u16(&buf[64..66]) as u32,
            BigEndian::read_u16(&buf[66..68]) as u32,
        );
    }

    if version >= 4 && len >= 76 {
        status.laser_disable_timestamp_ns = timestamp_ns(buf, 68);
    }

    Some((discovered, status))
}

struct SyncEntry {
    discovered: ScanSyncDiscovered,
    status: ScanSyncStatus,
    last_seen: Instant,
}

struct MonitorShared {
    map: Mutex<BTreeMap<u32, SyncEntry>>,
    is_active: AtomicBool,
}

/// Long-running listener for ScanSync timing/encoder broadcasts.
///
/// One monitor exists per process; orchestrators share it through
/// [`shared_monitor`] and the listener thread stops when the last strong
/// handle drops.
pub struct ScanSyncMonitor {
    shared: Arc<MonitorShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ScanSyncMonitor {
    fn start() -> Result<Self> {
        let socket = UdpSocket::bind(
            Ipv4Addr::UNSPECIFIED,
            SCANSYNC_UDP_PORT,
            Duration::from_secs(1),
        )?;

        let shared = Arc::new(MonitorShared {
            map: Mutex::new(BTreeMap::new()),
            is_active: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("linescan-scansync".into())
            .spawn(move || monitor_loop(socket, thread_shared))
            .map_err(|e| Error::Internal(format!("failed to spawn ScanSync monitor: {}", e)))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// ScanSyncs currently heard on the network, in ascending serial order.
    pub fn discovered(&self) -> Vec<ScanSyncDiscovered> {
        match self.shared.map.lock() {
            Ok(map) => map.values().map(|e| e.discovered).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn discovered_count(&self) -> usize {
        self.shared.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Latest broadcast state of one ScanSync.
    pub fn status(&self, serial_number: u32) -> Result<ScanSyncStatus> {
        let map = self
            .shared
            .map
            .lock()
            .map_err(|_| Error::Internal("ScanSync map poisoned".into()))?;
        map.get(&serial_number)
            .map(|e| e.status)
            .ok_or_else(|| Error::InvalidArgument(format!("ScanSync {} not seen", serial_number)))
    }
}

impl Drop for ScanSyncMonitor {
    fn drop(&mut self) {
        self.shared.is_active.store(false, Ordering::Relaxed);
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(thread) = guard.take() {
                let _ = thread.join();
            }
        }
    }
}

fn monitor_loop(socket: UdpSocket, shared: Arc<MonitorShared>) {
    let mut buf = [0u8; SCANSYNC_PACKET_MAX_SIZE];
    let mut previous_sweep = Instant::now();

    log::info!("ScanSync monitor listening on port {}", SCANSYNC_UDP_PORT);

    loop {
        if !shared.is_active.load(Ordering::Relaxed) {
            return;
        }

        let now = Instant::now();
        if now.duration_since(previous_sweep) > HOUSEKEEPING_PERIOD {
            if let Ok(mut map) = shared.map.lock() {
                map.retain(|serial, entry| {
                    let alive = now.duration_since(entry.last_seen) <= LIVENESS_TIMEOUT;
                    if !alive {
                        log::info!("ScanSync {} disappeared from network", serial);
                    }
                    alive
                });
            }
            previous_sweep = now;
        }

        // UDP frames the packet; unread trailing bytes are discarded by the
        // OS, which is fine since we only parse known fields.
        let (n, addr) = match socket.read(&mut buf) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("ScanSync read error: {}", e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }

        if let Some((mut discovered, status)) = parse_packet(&buf[..n]) {
            if let Some(SocketAddr::V4(v4)) = addr {
                discovered.ip_addr = Some(*v4.ip());
            }

            if let Ok(mut map) = shared.map.lock() {
                map.insert(
                    status.serial_number,
                    SyncEntry {
                        discovered,
                        status,
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }
}

/// Process-wide monitor handle: started on first use, torn down when the
/// last orchestrator drops its handle.
pub(crate) fn shared_monitor() -> Result<Arc<ScanSyncMonitor>> {
    static MONITOR: OnceLock<Mutex<Weak<ScanSyncMonitor>>> = OnceLock::new();

    let registry = MONITOR.get_or_init(|| Mutex::new(Weak::new()));
    let mut weak = registry
        .lock()
        .map_err(|_| Error::Internal("ScanSync monitor registry poisoned".into()))?;

    if let Some(monitor) = weak.upgrade() {
        return Ok(monitor);
    }

    let monitor = Arc::new(ScanSyncMonitor::start()?);
    *weak = Arc::downgrade(&monitor);
    Ok(monitor)
}


#[cfg(test)]
mod tests {
    use super::test_support::PacketBuilder;
    use super::*;

    #[test]
    fn undersized_packet_is_dropped() {
        assert!(parse_packet(&[0u8; 16]).is_none());
    }

    #[test]
    fn v1_packet_by_size() {
        let mut builder = PacketBuilder::v2(777);
        builder.size = SCANSYNC_PACKET_V1_SIZE;
        builder.encoder = -123_456;
        let bytes = builder.build();

        let (discovered, status) = parse_packet(&bytes).unwrap();
        assert_eq!(discovered.serial_number, 777);
        assert_eq!(status.encoder, -123_456);
        assert_eq!(status.timestamp_ns, 10_000_000_500);
        // Fields past v1 stay zero.
        assert!(status.flags.is_empty());
        assert_eq!(status.sync_timestamp_ns, 0);
        assert_eq!(discovered.firmware_version, FirmwareVersion::default());
    }

    #[test]
    fn v2_detected_by_reserved_magic() {
        let mut builder = PacketBuilder::v2(100);
        builder.flags = (ScanSyncFlags::SYNC | ScanSyncFlags::AUX_Y).bits();
        builder.aux_y_timestamp_s = 3;
        builder.index_z_timestamp_s = 4;
        builder.sync_timestamp_s = 5;
        let bytes = builder.build();
        assert_eq!(bytes.len(), 76);

        let (discovered, status) = parse_packet(&bytes).unwrap();
        assert!(status.is_sync());
        assert!(status.is_aux_y());
        assert_eq!(status.aux_y_timestamp_ns, 3_000_000_000);
        assert_eq!(status.index_z_timestamp_ns, 4_000_000_000);
        assert_eq!(status.sync_timestamp_ns, 5_000_000_000);
        // v3 and v4 fields stay zero on a v2 packet.
        assert_eq!(discovered.firmware_version, FirmwareVersion::default());
        assert_eq!(status.laser_disable_timestamp_ns, 0);
    }

    #[test]
    fn v3_detected_by_version_field() {
        let mut builder = PacketBuilder::v2(100);
        builder.reserved_magic = false;
        builder.packet_version = 3;
        builder.firmware = (16, 3, 1);
        builder.flags = ScanSyncFlags::SYNC.bits();
        let bytes = builder.build();

        let (discovered, status) = parse_packet(&bytes).unwrap();
        assert!(status.is_sync());
        assert_eq!(discovered.firmware_version, FirmwareVersion::new(16, 3, 1));
        assert_eq!(status.laser_disable_timestamp_ns, 0);
    }

    #[test]
    fn v4_populates_laser_disable() {
        let mut builder = PacketBuilder::v2(100);
        builder.reserved_magic = false;
        builder.packet_version = 4;
        builder.firmware = (16, 3, 1);
        builder.flags = ScanSyncFlags::LASER_DISABLE.bits();
        builder.laser_disable_timestamp_s = 9;
        let bytes = builder.build();

        let (_, status) = parse_packet(&bytes).unwrap();
        assert!(status.is_laser_disable());
        assert_eq!(status.laser_disable_timestamp_ns, 9_000_000_000);
    }

    #[test]
    fn version_zero_is_invalid() {
        let mut builder = PacketBuilder::v2(100);
        builder.reserved_magic = false;
        builder.packet_version = 0;
        assert!(parse_packet(&builder.build()).is_none());
    }
}
