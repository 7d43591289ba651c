use crate::discover::broadcast_discover;
use crate::error::Error;
use crate::phase::PhaseTable;
use crate::profile::{Profile, RawProfile};
use crate::queue::QueueMode;
use crate::scan_head::ScanHead;
use crate::scansync::{shared_monitor, ScanSyncMonitor};
use crate::types::{
    Camera, DataFormat, Discovered, FirmwareVersion, Laser, ScanHeadConfiguration,
    ScanSyncDiscovered, Units, API_VERSION, ENCODER_MAX, SCANSYNC_INVALID_SERIAL,
};
use crate::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Ready-queue backlog at which a partial frame is emitted rather than
/// falling further behind a stalled stream.
const FRAME_SIZE_THRESHOLD: u32 = 50;

/// Scheduling epoch offset added to the main ScanSync timestamp at scan
/// start; shorter offsets cause skipped sequences.
const START_TIME_OFFSET_NS: u64 = 20_000_000;

const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);
const HEART_BEAT_PERIOD: Duration = Duration::from_millis(250);

/// Heart-beat support is wired up but stays off by default.
const HEART_BEAT_ENABLED: bool = false;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemState {
    Disconnected,
    Connected,
    Scanning,
    Closing,
}

struct StateSync {
    state: Mutex<SystemState>,
    condvar: Condvar,
}

/// Orchestrator over a set of scan head sessions: lifecycle, phase table,
/// encoder assignment, keep-alive, and frame assembly.
pub struct ScanSystem {
    units: Units,
    scansync: Arc<ScanSyncMonitor>,
    heads: BTreeMap<u32, Arc<ScanHead>>,
    id_to_serial: BTreeMap<u32, u32>,
    discovered: BTreeMap<u32, Discovered>,
    phase_table: PhaseTable,
    state_sync: Arc<StateSync>,
    keepalive_heads: Arc<Mutex<Vec<Arc<ScanHead>>>>,
    keep_alive_thread: Option<std::thread::JoinHandle<()>>,
    heart_beat_thread: Option<std::thread::JoinHandle<()>>,
    version_lowest: FirmwareVersion,
    version_highest: FirmwareVersion,
    min_scan_period_us: u32,
    scan_period_us: u32,
    idle_scan_period_us: u32,
    is_idle_scan_enabled: bool,
    frame_current_sequence: u32,
    is_frame_scanning: bool,
    is_frame_ready: bool,
    encoder_to_serial: [u32; ENCODER_MAX],
    is_user_encoder_map: bool,
    is_encoder_dirty: bool,
}

impl ScanSystem {
    /// Create an orchestrator; joins the process-wide ScanSync monitor and
    /// performs an initial discovery sweep.
    pub fn new(units: Units) -> Result<Self> {
        let scansync = shared_monitor()?;

        let mut system = Self {
            units,
            scansync,
            heads: BTreeMap::new(),
            id_to_serial: BTreeMap::new(),
            discovered: BTreeMap::new(),
            phase_table: PhaseTable::new(),
            state_sync: Arc::new(StateSync {
                state: Mutex::new(SystemState::Disconnected),
                condvar: Condvar::new(),
            }),
            keepalive_heads: Arc::new(Mutex::new(Vec::new())),
            keep_alive_thread: None,
            heart_beat_thread: None,
            version_lowest: FirmwareVersion::default(),
            version_highest: FirmwareVersion::default(),
            min_scan_period_us: 0,
            scan_period_us: 0,
            idle_scan_period_us: 0,
            is_idle_scan_enabled: false,
            frame_current_sequence: 0,
            is_frame_scanning: false,
            is_frame_ready: false,
            encoder_to_serial: [SCANSYNC_INVALID_SERIAL; ENCODER_MAX],
            is_user_encoder_map: false,
            is_encoder_dirty: true,
        };

        // Best effort; the caller re-discovers explicitly before creating
        // heads anyway.
        if let Ok(found) = broadcast_discover() {
            system.discovered = found;
        }

        Ok(system)
    }

    fn state(&self) -> SystemState {
        self.state_sync
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SystemState::Disconnected)
    }

    fn set_state(&self, state: SystemState) {
        if let Ok(mut guard) = self.state_sync.state.lock() {
            *guard = state;
        }
        self.state_sync.condvar.notify_all();
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SystemState::Connected | SystemState::Scanning)
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == SystemState::Scanning
    }

    pub fn is_frame_scanning(&self) -> bool {
        self.is_frame_scanning
    }

    // -- discovery --

    /// Probe every interface for scan heads. Not allowed while connected.
    pub fn discover(&mut self) -> Result<u32> {
        if self.is_connected() {
            return Err(Error::Connected);
        }

        self.discovered = broadcast_discover()?;
        Ok(self.discovered.len() as u32)
    }

    /// Results of the most recent discovery, in ascending serial order.
    pub fn scan_heads_discovered(&self) -> Vec<Discovered> {
        self.discovered.values().cloned().collect()
    }

    // -- head management --

    pub fn create_scan_head(&mut self, serial_number: u32, id: u32) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        if self.heads.contains_key(&serial_number) {
            return Err(Error::AlreadyExists(format!("serial {}", serial_number)));
        }
        if self.id_to_serial.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("id {}", id)));
        }

        if !self.discovered.contains_key(&serial_number) {
            // One implicit retry; the head may have joined the network
            // since the last sweep.
            if let Ok(found) = broadcast_discover() {
                self.discovered = found;
            }
            if !self.discovered.contains_key(&serial_number) {
                return Err(Error::NotDiscovered(format!(
                    "scan head {} not found on network",
                    serial_number
                )));
            }
        }

        let discovered = self.discovered[&serial_number].clone();
        if discovered.firmware_version.major != API_VERSION.major {
            return Err(Error::VersionCompatibility(format!(
                "API v{} not compatible with firmware v{}",
                API_VERSION, discovered.firmware_version
            )));
        }

        if self.heads.is_empty() {
            self.version_lowest = discovered.firmware_version;
            self.version_highest = discovered.firmware_version;
        } else {
            if discovered.firmware_version > self.version_highest {
                self.version_highest = discovered.firmware_version;
            }
            if discovered.firmware_version < self.version_lowest {
                self.version_lowest = discovered.firmware_version;
            }
        }

        let head = Arc::new(ScanHead::new(&discovered, id, self.units)?);
        self.heads.insert(serial_number, head);
        self.id_to_serial.insert(id, serial_number);
        self.refresh_keepalive_heads();

        Ok(())
    }

    pub fn remove_scan_head(&mut self, serial_number: u32) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        let head = self
            .heads
            .remove(&serial_number)
            .ok_or_else(|| Error::InvalidArgument(format!("serial {} not managed", serial_number)))?;
        self.id_to_serial.remove(&head.id());
        self.refresh_keepalive_heads();
        Ok(())
    }

    pub fn remove_all_scan_heads(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        self.heads.clear();
        self.id_to_serial.clear();
        self.refresh_keepalive_heads();
        Ok(())
    }

    pub fn number_of_scan_heads(&self) -> u32 {
        self.heads.len() as u32
    }

    /// Lowest and highest firmware versions across the managed heads.
    pub fn firmware_versions(&self) -> (FirmwareVersion, FirmwareVersion) {
        (self.version_lowest, self.version_highest)
    }

    pub fn scan_head_by_serial(&self, serial_number: u32) -> Result<&ScanHead> {
        self.heads
            .get(&serial_number)
            .map(|h| h.as_ref())
            .ok_or(Error::InvalidScanHead)
    }

    pub fn scan_head_by_id(&self, id: u32) -> Result<&ScanHead> {
        let serial = self.id_to_serial.get(&id).ok_or(Error::InvalidScanHead)?;
        self.scan_head_by_serial(*serial)
    }

    fn refresh_keepalive_heads(&self) {
        if let Ok(mut heads) = self.keepalive_heads.lock() {
            *heads = self.heads.values().cloned().collect();
        }
    }

    // -- connection lifecycle --

    /// Connect every head in parallel. Returns the number of heads that
    /// connected; only a full success transitions the system to connected
    /// and pushes configuration.
    pub fn connect(&mut self, timeout: Duration) -> Result<u32> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        if self.is_connected() {
            return Err(Error::Connected);
        }
        if self.heads.is_empty() {
            return Err(Error::NotConnected);
        }

        let results: Vec<(u32, Result<()>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .heads
                .values()
                .map(|head| {
                    let head = head.clone();
                    scope.spawn(move || (head.serial_number(), head.connect(timeout)))
                })
                .collect();

            workers
                .into_iter()
                .map(|w| match w.join() {
                    Ok(result) => result,
                    Err(_) => (0, Err(Error::Internal("connect worker panicked".into()))),
                })
                .collect()
        });

        let mut connected = 0;
        for (serial, result) in results {
            match result {
                Ok(()) => connected += 1,
                Err(e) => log::warn!("scan head {} failed to connect: {}", serial, e),
            }
        }

        if connected as usize == self.heads.len() {
            self.set_state(SystemState::Connected);
            // The scan server clears its ScanSync mapping on a new
            // connection.
            self.is_encoder_dirty = true;
            self.configure()?;
        }

        self.spawn_background_tasks();

        Ok(connected)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        if self.is_scanning() {
            self.stop_scanning()?;
        }

        std::thread::scope(|scope| {
            for head in self.heads.values() {
                let head = head.clone();
                scope.spawn(move || {
                    if let Err(e) = head.disconnect() {
                        log::warn!("scan head {} disconnect: {}", head.serial_number(), e);
                    }
                });
            }
        });

        self.set_state(SystemState::Disconnected);
        self.is_encoder_dirty = true;
        Ok(())
    }

    fn spawn_background_tasks(&mut self) {
        if self.keep_alive_thread.is_none() {
            let sync = self.state_sync.clone();
            let heads = self.keepalive_heads.clone();
            self.keep_alive_thread = std::thread::Builder::new()
                .name("linescan-keepalive".into())
                .spawn(move || keep_alive_main(sync, heads))
                .ok();
        }

        if self.heart_beat_thread.is_none() {
            let sync = self.state_sync.clone();
            let heads = self.keepalive_heads.clone();
            let version_lowest = self.version_lowest;
            self.heart_beat_thread = std::thread::Builder::new()
                .name("linescan-heartbeat".into())
                .spawn(move || heart_beat_main(sync, heads, version_lowest))
                .ok();
        }
    }

    // -- configuration --

    fn is_configured(&self) -> bool {
        self.heads.values().all(|h| !h.is_dirty())
    }

    /// Push dynamic data and compile the phase table. Skips work that is
    /// already in place.
    pub fn configure(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let is_config_dirty = !self.is_configured();
        let is_phase_table_dirty = self.phase_table.is_dirty();

        if self.encoder_to_serial[0] == SCANSYNC_INVALID_SERIAL {
            let _ = self.set_default_scansync_encoder();
        }

        if self.is_encoder_dirty && self.encoder_to_serial[0] != SCANSYNC_INVALID_SERIAL {
            for head in self.heads.values() {
                let result = head.send_encoders(
                    self.encoder_to_serial[0],
                    self.encoder_to_serial[1],
                    self.encoder_to_serial[2],
                );
                match result {
                    Ok(()) => {}
                    Err(Error::VersionCompatibility(_)) if !self.is_user_encoder_map => {
                        // The head predates encoder mapping and will use its
                        // default assignment.
                    }
                    Err(e) => return Err(e),
                }
            }
            self.is_encoder_dirty = false;
        }

        if is_config_dirty {
            let results: Vec<(u32, Result<()>)> = std::thread::scope(|scope| {
                let workers: Vec<_> = self
                    .heads
                    .values()
                    .map(|head| {
                        let head = head.clone();
                        scope.spawn(move || {
                            let serial = head.serial_number();
                            let result = configure_head(&head);
                            (serial, result)
                        })
                    })
                    .collect();

                workers
                    .into_iter()
                    .map(|w| match w.join() {
                        Ok(result) => result,
                        Err(_) => (0, Err(Error::Internal("configure worker panicked".into()))),
                    })
                    .collect()
            });

            for (serial, result) in results {
                if let Err(e) = result {
                    log::warn!("scan head {} configure failed: {}", serial, e);
                    return Err(e);
                }
            }
        }

        // Configuration affects timing, so the phase table is recalculated
        // whenever either it or the dynamic data changed.
        if is_config_dirty || is_phase_table_dirty {
            let heads_by_id: BTreeMap<u32, &ScanHead> = self
                .id_to_serial
                .iter()
                .filter_map(|(&id, serial)| self.heads.get(serial).map(|h| (id, h.as_ref())))
                .collect();

            let table = self.phase_table.calculate(&heads_by_id)?;
            self.min_scan_period_us = table.total_duration_us + table.camera_early_offset_us;

            for head in self.heads.values() {
                head.reset_scan_pairs();
            }

            // Scan pairs define what fires and when its window closes
            // within the cycle.
            let mut end_offset_us = table.camera_early_offset_us;
            for phase in &table.phases {
                end_offset_us += phase.duration_us;
                for el in &phase.elements {
                    let head = heads_by_id
                        .get(&el.head_id)
                        .ok_or_else(|| Error::Internal(format!("unknown head id {}", el.head_id)))?;
                    head.add_scan_pair(el.camera, el.laser, el.cfg, end_offset_us)?;
                }
            }

            for head in self.heads.values() {
                if head.scan_pairs_count() != 0 {
                    head.send_scan_alignment()?;
                }
            }

            self.phase_table.clear_dirty();
        }

        Ok(())
    }

    /// Minimum commandable scan period for the current phase table.
    pub fn min_scan_period(&mut self) -> u32 {
        if !self.is_connected() {
            return 0;
        }
        let _ = self.configure();
        self.min_scan_period_us
    }

    // -- phase table --

    pub fn phase_clear_all(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        self.phase_table.reset();
        Ok(())
    }

    pub fn phase_create(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        self.phase_table.create_phase();
        Ok(())
    }

    pub fn phase_insert_camera(
        &mut self,
        serial_number: u32,
        camera: Camera,
        config: Option<ScanHeadConfiguration>,
    ) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        let head = self
            .heads
            .get(&serial_number)
            .ok_or(Error::InvalidScanHead)?
            .clone();
        let laser = head.paired_laser(camera);
        if laser == Laser::Invalid {
            return Err(Error::InvalidArgument(format!(
                "camera {:?} has no paired laser on head {}",
                camera, serial_number
            )));
        }

        self.phase_table.add_to_last_phase(&head, camera, laser, config)
    }

    pub fn phase_insert_laser(
        &mut self,
        serial_number: u32,
        laser: Laser,
        config: Option<ScanHeadConfiguration>,
    ) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }

        let head = self
            .heads
            .get(&serial_number)
            .ok_or(Error::InvalidScanHead)?
            .clone();
        let camera = head.paired_camera(laser);
        if camera == Camera::Invalid {
            return Err(Error::InvalidArgument(format!(
                "laser {:?} has no paired camera on head {}",
                laser, serial_number
            )));
        }

        self.phase_table.add_to_last_phase(&head, camera, laser, config)
    }

    // -- idle scanning --

    pub fn set_idle_scan_period(&mut self, period_us: u32) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        self.idle_scan_period_us = period_us;
        self.is_idle_scan_enabled = true;
        Ok(())
    }

    pub fn disable_idle_scanning(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        self.idle_scan_period_us = 0;
        self.is_idle_scan_enabled = false;
        Ok(())
    }

    pub fn idle_scan_period(&self) -> u32 {
        self.idle_scan_period_us
    }

    pub fn is_idle_scanning_enabled(&self) -> bool {
        self.is_idle_scan_enabled
    }

    // -- encoder assignment --

    /// ScanSyncs visible both to this process and to every connected head.
    pub fn discover_scansyncs(&self) -> Result<Vec<ScanSyncDiscovered>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut common = self.scansync.discovered();

        for head in self.heads.values() {
            let serials = match head.request_scansync_serials() {
                Ok(serials) => serials,
                // A head too old to report visibility does not shrink the
                // intersection.
                Err(Error::VersionCompatibility(_)) => continue,
                Err(e) => return Err(e),
            };
            common.retain(|sync| serials.contains(&sync.serial_number));
        }

        Ok(common)
    }

    /// Map ScanSync serials onto the main/aux1/aux2 encoder slots of every
    /// head.
    pub fn set_scansync_encoder(
        &mut self,
        serial_main: u32,
        serial_aux1: u32,
        serial_aux2: u32,
    ) -> Result<()> {
        if !self.version_lowest.is_compatible(16, 3, 0) {
            return Err(Error::VersionCompatibility(
                "encoder assignment requires firmware v16.3.0 on all heads".into(),
            ));
        }

        if serial_main == SCANSYNC_INVALID_SERIAL {
            return Err(Error::InvalidArgument(
                "invalid serial number for main encoder".into(),
            ));
        }
        if serial_aux1 == SCANSYNC_INVALID_SERIAL && serial_aux2 != SCANSYNC_INVALID_SERIAL {
            return Err(Error::InvalidArgument(
                "invalid serial number for aux1 encoder".into(),
            ));
        }

        if serial_main == serial_aux1 || serial_main == serial_aux2 {
            return Err(Error::InvalidArgument(format!(
                "duplicate encoder assignment for serial {}",
                serial_main
            )));
        }
        if serial_aux1 != SCANSYNC_INVALID_SERIAL && serial_aux1 == serial_aux2 {
            return Err(Error::InvalidArgument(format!(
                "duplicate encoder assignment for serial {}",
                serial_aux1
            )));
        }

        let discovered = self.discover_scansyncs()?;
        if discovered.is_empty() {
            return Err(Error::NotDiscovered("no ScanSync seen by all heads".into()));
        }

        let serials: Vec<u32> = discovered.iter().map(|d| d.serial_number).collect();
        for serial in [serial_main, serial_aux1, serial_aux2] {
            if serial != SCANSYNC_INVALID_SERIAL && !serials.contains(&serial) {
                return Err(Error::NotDiscovered(format!(
                    "ScanSync {} not discovered",
                    serial
                )));
            }
        }

        self.encoder_to_serial = [serial_main, serial_aux1, serial_aux2];
        self.is_user_encoder_map = true;
        self.is_encoder_dirty = true;
        Ok(())
    }

    pub fn scansync_encoder(&self) -> (u32, u32, u32) {
        (
            self.encoder_to_serial[0],
            self.encoder_to_serial[1],
            self.encoder_to_serial[2],
        )
    }

    /// Assign detected ScanSyncs to main/aux1/aux2 in ascending serial
    /// order.
    pub fn set_default_scansync_encoder(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        self.is_user_encoder_map = false;
        self.is_encoder_dirty = true;
        self.encoder_to_serial = [SCANSYNC_INVALID_SERIAL; ENCODER_MAX];

        let discovered = self.discover_scansyncs().unwrap_or_default();
        for (n, sync) in discovered.iter().take(ENCODER_MAX).enumerate() {
            self.encoder_to_serial[n] = sync.serial_number;
        }

        Ok(())
    }

    // -- scanning --

    pub fn start_scanning(
        &mut self,
        period_us: u32,
        format: DataFormat,
        is_frame_scanning: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.is_scanning() {
            return Err(Error::Scanning);
        }
        if self.phase_table.number_of_phases() == 0 {
            return Err(Error::PhaseTableEmpty);
        }
        if self.phase_table.has_duplicate_elements() && is_frame_scanning {
            return Err(Error::FrameScanningInvalidPhaseTable);
        }
        if self.is_idle_scan_enabled
            && self.idle_scan_period_us != 0
            && self.idle_scan_period_us <= period_us
        {
            return Err(Error::InvalidArgument(
                "idle scan period must be greater than the scan period".into(),
            ));
        }

        self.configure()?;

        if self.min_scan_period_us > period_us {
            return Err(Error::InvalidArgument(format!(
                "requested scan period {}us is less than minimum {}us",
                period_us, self.min_scan_period_us
            )));
        }

        for head in self.heads.values() {
            head.send_scan_configuration(period_us, format, is_frame_scanning)?;
        }

        // Anchor all heads to one scheduling epoch taken from the main
        // ScanSync; zero lets each device pick its own start.
        let mut start_time_ns = 0;
        if self.encoder_to_serial[0] != SCANSYNC_INVALID_SERIAL {
            if let Ok(status) = self.scansync.status(self.encoder_to_serial[0]) {
                start_time_ns = status.timestamp_ns + START_TIME_OFFSET_NS;
            }
        }

        if is_frame_scanning {
            let scheduled = self.phase_table.scheduled_pairs_per_head();
            for (id, pairs) in scheduled {
                if let Some(head) = self
                    .id_to_serial
                    .get(&id)
                    .and_then(|serial| self.heads.get(serial))
                {
                    head.queue().set_valid_pairs(pairs);
                }
            }
        }

        for head in self.heads.values() {
            head.start_scanning(start_time_ns, is_frame_scanning)?;
        }

        self.set_state(SystemState::Scanning);
        self.is_frame_scanning = is_frame_scanning;
        self.is_frame_ready = false;
        self.frame_current_sequence = 1;
        self.scan_period_us = period_us;

        Ok(())
    }

    pub fn stop_scanning(&mut self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.is_scanning() {
            return Err(Error::NotScanning);
        }

        for head in self.heads.values() {
            if let Err(e) = head.stop_scanning() {
                log::warn!("scan head {} stop: {}", head.serial_number(), e);
            }
        }

        self.set_state(SystemState::Connected);
        Ok(())
    }

    // -- frame assembly --

    /// Slots per frame: one per scheduled pair across all heads.
    pub fn profiles_per_frame(&self) -> u32 {
        self.heads.values().map(|h| h.pair_count()).sum()
    }

    /// Poll until a frame can be assembled. Returns `true` once either
    /// every stream has data for the current sequence or some stream's
    /// backlog crosses the partial-frame threshold.
    pub fn wait_until_frame_available(&mut self, timeout: Duration) -> Result<bool> {
        if !self.is_scanning() {
            return Err(Error::NotScanning);
        }
        if !self.is_frame_scanning {
            return Err(Error::NotFrameScanning);
        }

        let sleep_us = (self.scan_period_us / 4).max(1) as u64;
        let mut time_remaining_us = timeout.as_micros() as i64;

        loop {
            let mut seq_min: i64 = -1;
            let mut size_max: i64 = -1;

            for head in self.heads.values() {
                let report = head.queue().report();
                if seq_min == -1 || seq_min > report.sequence_min as i64 {
                    seq_min = report.sequence_min as i64;
                }
                if size_max == -1 || size_max < report.size_max as i64 {
                    size_max = report.size_max as i64;
                }
            }

            if seq_min >= self.frame_current_sequence as i64
                || size_max >= FRAME_SIZE_THRESHOLD as i64
            {
                // Arm the flag so `get_frame` can skip re-checking.
                self.is_frame_ready = true;
                return Ok(true);
            }

            if time_remaining_us > 0 {
                std::thread::sleep(Duration::from_micros(sleep_us));
                time_remaining_us -= sleep_us as i64;
            } else {
                return Ok(false);
            }
        }
    }

    /// Assemble the next frame of filtered profiles. Returns the number of
    /// populated (non-placeholder) slots.
    pub fn get_frame(&mut self, profiles: &mut [Profile]) -> Result<u32> {
        if !self.is_scanning() {
            return Err(Error::NotScanning);
        }
        if !self.is_frame_scanning {
            return Err(Error::NotFrameScanning);
        }

        if !self.is_frame_ready && !self.wait_until_frame_available(Duration::ZERO)? {
            return Ok(0);
        }

        let sequence = self.frame_current_sequence;
        let mut offset = 0;
        let mut count = 0;

        for serial in self.id_to_serial.values() {
            if let Some(head) = self.heads.get(serial) {
                let (written, present) = head.fill_frame_slots(&mut profiles[offset..], sequence);
                offset += written;
                count += present;
            }
        }

        self.frame_current_sequence += 1;
        self.is_frame_ready = false;
        Ok(count as u32)
    }

    /// Raw-profile variant of [`get_frame`].
    pub fn get_frame_raw(&mut self, profiles: &mut [RawProfile]) -> Result<u32> {
        if !self.is_scanning() {
            return Err(Error::NotScanning);
        }
        if !self.is_frame_scanning {
            return Err(Error::NotFrameScanning);
        }

        if !self.is_frame_ready && !self.wait_until_frame_available(Duration::ZERO)? {
            return Ok(0);
        }

        let sequence = self.frame_current_sequence;
        let mut offset = 0;
        let mut count = 0;

        for serial in self.id_to_serial.values() {
            if let Some(head) = self.heads.get(serial) {
                let (written, present) =
                    head.fill_frame_slots_raw(&mut profiles[offset..], sequence);
                offset += written;
                count += present;
            }
        }

        self.frame_current_sequence += 1;
        self.is_frame_ready = false;
        Ok(count as u32)
    }

    /// Drop all buffered frames and re-sync to the most recent sequence;
    /// used when the caller has fallen far behind.
    pub fn clear_frames(&mut self) -> Result<()> {
        if !self.is_scanning() {
            return Err(Error::NotScanning);
        }
        if !self.is_frame_scanning {
            return Err(Error::NotFrameScanning);
        }

        let mut sequence_max = 0;
        for head in self.heads.values() {
            sequence_max = sequence_max.max(head.last_sequence_number());
        }

        // The next frame to build is one in the future.
        self.frame_current_sequence = sequence_max + 1;

        for head in self.heads.values() {
            head.queue().reset(QueueMode::Multi);
        }

        Ok(())
    }
}

impl Drop for ScanSystem {
    fn drop(&mut self) {
        self.set_state(SystemState::Closing);

        if let Some(thread) = self.keep_alive_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.heart_beat_thread.take() {
            let _ = thread.join();
        }

        // Sessions stop and disconnect themselves as they drop.
        self.heads.clear();
    }
}

fn configure_head(head: &ScanHead) -> Result<()> {
    head.send_window()?;

    match head.send_brightness_correction() {
        Ok(()) => {}
        // The only tolerated failure: the device simply does not support
        // the message.
        Err(Error::VersionCompatibility(_)) => {}
        Err(e) => return Err(e),
    }

    match head.send_exclusion_mask() {
        Ok(()) => {}
        Err(Error::VersionCompatibility(_)) => {}
        Err(e) => return Err(e),
    }

    head.request_status()?;
    head.clear_dirty();
    Ok(())
}

/// Keep-alive loop: nudge every head once a second while scanning so heads
/// that stopped sending recover from idle.
fn keep_alive_main(sync: Arc<StateSync>, heads: Arc<Mutex<Vec<Arc<ScanHead>>>>) {
    loop {
        let state = {
            let guard = match sync.state.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match sync.condvar.wait_timeout(guard, KEEP_ALIVE_PERIOD) {
                Ok((guard, _)) => *guard,
                Err(_) => return,
            }
        };

        match state {
            SystemState::Closing => return,
            SystemState::Scanning => {
                let heads = match heads.lock() {
                    Ok(h) => h.clone(),
                    Err(_) => continue,
                };
                for head in heads {
                    if let Err(e) = head.send_keep_alive() {
                        log::warn!("scan head {} keep-alive: {}", head.serial_number(), e);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Heart-beat loop; compiled in but gated off.
fn heart_beat_main(
    sync: Arc<StateSync>,
    heads: Arc<Mutex<Vec<Arc<ScanHead>>>>,
    version_lowest: FirmwareVersion,
) {
    if !HEART_BEAT_ENABLED {
        return;
    }

    if !version_lowest.is_compatible(16, 3, 0) {
        return;
    }

    loop {
        let state = {
            let guard = match sync.state.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            match sync.condvar.wait_timeout(guard, HEART_BEAT_PERIOD) {
                Ok((guard, _)) => *guard,
                Err(_) => return,
            }
        };

        match state {
            SystemState::Closing => return,
            SystemState::Disconnected => continue,
            _ => {
                let heads = match heads.lock() {
                    Ok(h) => h.clone(),
                    Err(_) => continue,
                };
                for head in heads {
                    let _ = head.send_heart_beat();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan_head::test_support::{feed_profile, offline_discovered};
    use crate::types::ScanHeadType;

    fn offline_system() -> ScanSystem {
        let mut system = ScanSystem::new(Units::Inches).expect("monitor start");
        system.discovered.clear();
        system
    }

    fn register_head(
        system: &mut ScanSystem,
        head_type: ScanHeadType,
        serial: u32,
        id: u32,
        firmware: FirmwareVersion,
    ) {
        let mut discovered = offline_discovered(head_type, serial);
        discovered.firmware_version = firmware;
        system.discovered.insert(serial, discovered);
        system.create_scan_head(serial, id).unwrap();
    }

    #[test]
    fn create_rejects_duplicates_and_unknown() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            100,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        let err = system.create_scan_head(100, 1).unwrap_err();
        assert_eq!(err.code(), -9);

        system
            .discovered
            .insert(101, offline_discovered(ScanHeadType::Js50Wsc, 101));
        let err = system.create_scan_head(101, 0).unwrap_err();
        assert_eq!(err.code(), -9);

        let err = system.create_scan_head(999_999, 2).unwrap_err();
        assert_eq!(err.code(), -12);
    }

    #[test]
    fn create_rejects_firmware_major_mismatch() {
        let mut system = offline_system();
        let mut discovered = offline_discovered(ScanHeadType::Js50Wsc, 200);
        discovered.firmware_version = FirmwareVersion::new(15, 9, 0);
        system.discovered.insert(200, discovered);

        let err = system.create_scan_head(200, 0).unwrap_err();
        assert_eq!(err.code(), -8);
    }

    #[test]
    fn firmware_watermarks_track_extremes() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            1,
            0,
            FirmwareVersion::new(16, 3, 0),
        );
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            2,
            1,
            FirmwareVersion::new(16, 1, 2),
        );
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            3,
            2,
            FirmwareVersion::new(16, 3, 1),
        );

        assert_eq!(system.version_lowest, FirmwareVersion::new(16, 1, 2));
        assert_eq!(system.version_highest, FirmwareVersion::new(16, 3, 1));
    }

    #[test]
    fn encoder_assignment_gating() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            10,
            0,
            FirmwareVersion::new(16, 2, 0),
        );

        // Firmware too old across the set.
        let err = system.set_scansync_encoder(1, 2, 3).unwrap_err();
        assert_eq!(err.code(), -8);

        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            11,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        // Invalid main sentinel.
        let err = system
            .set_scansync_encoder(SCANSYNC_INVALID_SERIAL, 2, 3)
            .unwrap_err();
        assert_eq!(err.code(), -3);

        // Aux2 without aux1.
        let err = system
            .set_scansync_encoder(1, SCANSYNC_INVALID_SERIAL, 3)
            .unwrap_err();
        assert_eq!(err.code(), -3);

        // Duplicates across slots.
        let err = system.set_scansync_encoder(1, 2, 1).unwrap_err();
        assert_eq!(err.code(), -3);
        let err = system.set_scansync_encoder(1, 2, 2).unwrap_err();
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn start_scanning_requires_connection_and_phases() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            20,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        let err = system
            .start_scanning(5000, DataFormat::XyBrightnessFull, false)
            .unwrap_err();
        assert_eq!(err.code(), -4);

        system.set_state(SystemState::Connected);
        let err = system
            .start_scanning(5000, DataFormat::XyBrightnessFull, false)
            .unwrap_err();
        assert_eq!(err.code(), -18);
    }

    #[test]
    fn frame_mode_rejects_duplicate_phase_tables() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            30,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        system.phase_create().unwrap();
        system
            .phase_insert_camera(30, Camera::A, None)
            .unwrap();
        system.phase_create().unwrap();
        system
            .phase_insert_camera(30, Camera::A, None)
            .unwrap();

        system.set_state(SystemState::Connected);
        let err = system
            .start_scanning(5000, DataFormat::XyBrightnessFull, true)
            .unwrap_err();
        assert_eq!(err.code(), -17);
    }

    #[test]
    fn frame_assembly_with_loss() {
        let mut system = offline_system();
        for (serial, id) in [(1u32, 0u32), (2, 1), (3, 2)] {
            register_head(
                &mut system,
                ScanHeadType::Js50Wsc,
                serial,
                id,
                FirmwareVersion::new(16, 3, 0),
            );
        }
        assert_eq!(system.profiles_per_frame(), 3);

        for head in system.heads.values() {
            head.queue().reset(QueueMode::Multi);
            head.queue()
                .set_valid_pairs(vec![(Camera::A, Laser::L1)]);
        }

        // Head 2 loses sequence 2.
        for seq in [1u32, 2, 3] {
            feed_profile(system.scan_head_by_serial(1).unwrap(), Camera::A, Laser::L1, seq);
            feed_profile(system.scan_head_by_serial(3).unwrap(), Camera::A, Laser::L1, seq);
        }
        for seq in [1u32, 3] {
            feed_profile(system.scan_head_by_serial(2).unwrap(), Camera::A, Laser::L1, seq);
        }

        system.set_state(SystemState::Scanning);
        system.is_frame_scanning = true;
        system.frame_current_sequence = 1;
        system.scan_period_us = 1000;

        let mut frame = vec![Profile::new(); 3];

        assert_eq!(system.get_frame(&mut frame).unwrap(), 3);
        assert_eq!(system.get_frame(&mut frame).unwrap(), 2);
        assert_eq!(frame[1].format, DataFormat::Invalid);
        assert_eq!(frame[1].scan_head_id, 1);
        assert_eq!(frame[1].sequence_number, 2);
        assert_eq!(system.get_frame(&mut frame).unwrap(), 3);
    }

    #[test]
    fn clear_frames_resets_queues_and_sequence() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            40,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        let head = system.scan_head_by_serial(40).unwrap();
        head.queue().reset(QueueMode::Multi);
        head.queue().set_valid_pairs(vec![(Camera::A, Laser::L1)]);
        for seq in 1..=5 {
            feed_profile(head, Camera::A, Laser::L1, seq);
        }

        system.set_state(SystemState::Scanning);
        system.is_frame_scanning = true;
        system.scan_period_us = 1000;

        system.clear_frames().unwrap();
        assert_eq!(system.frame_current_sequence, 6);

        let head = system.scan_head_by_serial(40).unwrap();
        assert_eq!(head.queue().size_ready_pair(Camera::A, Laser::L1), 0);

        // Idempotent: a second clear leaves the queues empty.
        system.clear_frames().unwrap();
        let head = system.scan_head_by_serial(40).unwrap();
        assert_eq!(head.queue().size_ready_pair(Camera::A, Laser::L1), 0);
    }

    #[test]
    fn frame_calls_rejected_outside_frame_mode() {
        let mut system = offline_system();
        register_head(
            &mut system,
            ScanHeadType::Js50Wsc,
            50,
            0,
            FirmwareVersion::new(16, 3, 0),
        );

        let mut frame = vec![Profile::new(); 1];
        let err = system.get_frame(&mut frame).unwrap_err();
        assert_eq!(err.code(), -6);

        system.set_state(SystemState::Scanning);
        system.is_frame_scanning = false;
        let err = system.get_frame(&mut frame).unwrap_err();
        assert_eq!(err.code(), -16);
    }
}
