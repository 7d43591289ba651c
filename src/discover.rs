use crate::error::Error;
use crate::net::{client_interfaces, TcpFramedSocket, UdpBroadcastSocket};
use crate::protocol::{
    self, ClientDiscovery, ClientMessage, ServerDiscovery, BROADCAST_DISCOVER_PORT,
    SCAN_SERVER_UPDATE_PORT,
};
use crate::types::{
    Discovered, FirmwareVersion, ScanHeadState, ScanHeadType, API_VERSION,
};
use crate::Result;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, ToSocketAddrs};
use std::time::Duration;

/// How long scan heads get to answer a discovery probe.
const DISCOVER_WAIT: Duration = Duration::from_millis(200);

fn head_type_from_code(code: u32) -> ScanHeadType {
    match code {
        1 => ScanHeadType::Js50Wx,
        2 => ScanHeadType::Js50Wsc,
        3 => ScanHeadType::Js50X6b20,
        4 => ScanHeadType::Js50X6b30,
        5 => ScanHeadType::Js50Mx,
        6 => ScanHeadType::Js50Z820,
        7 => ScanHeadType::Js50Z830,
        _ => ScanHeadType::Invalid,
    }
}

fn head_state_from_code(code: u32) -> ScanHeadState {
    match code {
        1 => ScanHeadState::Standby,
        2 => ScanHeadState::Connected,
        3 => ScanHeadState::Scanning,
        _ => ScanHeadState::Invalid,
    }
}

/// Broadcast a discovery probe on every usable interface and collect the
/// responses, keyed by serial number.
pub(crate) fn broadcast_discover() -> Result<BTreeMap<u32, Discovered>> {
    let interfaces = client_interfaces();
    let mut sockets = Vec::new();
    let mut socket_interfaces = Vec::new();

    for iface in &interfaces {
        // Interfaces that refuse a broadcast socket are skipped silently.
        match UdpBroadcastSocket::bind(iface.ip_addr) {
            Ok(sock) => {
                sockets.push(sock);
                socket_interfaces.push(iface.clone());
            }
            Err(e) => {
                log::trace!("skipping interface {}: {}", iface.name, e);
            }
        }
    }

    if sockets.is_empty() {
        return Err(Error::Network("no network interfaces found".into()));
    }

    let probe = protocol::encode(&ClientDiscovery {
        api_version_major: API_VERSION.major,
        api_version_minor: API_VERSION.minor,
        api_version_patch: API_VERSION.patch,
    })?;

    let mut sendto_count = 0;
    for socket in &sockets {
        if socket.send(BROADCAST_DISCOVER_PORT, &probe).is_ok() {
            sendto_count += 1;
        }
    }

    if sendto_count == 0 {
        return Err(Error::Network("UDP broadcast failed on all interfaces".into()));
    }

    std::thread::sleep(DISCOVER_WAIT);

    let mut discovered = BTreeMap::new();
    let mut buf = [0u8; 256];

    for (socket, iface) in sockets.iter().zip(socket_interfaces.iter()) {
        loop {
            let n = match socket.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let reply: ServerDiscovery = match protocol::decode(&buf[..n]) {
                Ok(r) => r,
                // Not a discovery response; keep draining.
                Err(_) => continue,
            };

            let record = record_from_reply(reply, iface);

            log::info!(
                "discovered scan head {} ({}) at {} via {}",
                record.serial_number,
                record.type_str,
                record.ip_addr,
                record.client_name
            );
            discovered.insert(record.serial_number, record);
        }
    }

    Ok(discovered)
}

/// Build a discovery record from a device reply, attributing the client
/// interface that heard it.
fn record_from_reply(reply: ServerDiscovery, iface: &crate::net::ClientInterface) -> Discovered {
    Discovered {
        serial_number: reply.serial_number,
        head_type: head_type_from_code(reply.type_code),
        firmware_version: FirmwareVersion::new(
            reply.version_major,
            reply.version_minor,
            reply.version_patch,
        ),
        ip_addr: Ipv4Addr::from(reply.ip_server),
        client_name: iface.name.clone(),
        client_ip_addr: iface.ip_addr,
        client_netmask: iface.netmask,
        type_str: reply.type_str,
        link_speed_mbps: reply.link_speed_mbps,
        state: head_state_from_code(reply.state),
    }
}

/// Resolve a scan head IP through its mDNS hostname. Fallback for commands
/// that do not need a broadcast response.
pub(crate) fn resolve_ip_mdns(serial_number: u32) -> Result<Ipv4Addr> {
    let host = format!(
        "JS-50-{}.local:{}",
        serial_number,
        crate::protocol::SCAN_SERVER_CTRL_PORT
    );

    let addrs = host
        .to_socket_addrs()
        .map_err(|e| Error::NotDiscovered(format!("mDNS lookup for {}: {}", host, e)))?;

    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }

    Err(Error::NotDiscovered(format!(
        "scan head {} has no IPv4 mDNS record",
        serial_number
    )))
}

/// Reboot a scan head by serial number. The device is located by broadcast
/// discovery, falling back to mDNS, and sent one reboot request on the
/// update port.
pub fn power_cycle_scan_head(serial_number: u32) -> Result<()> {
    let ip = match broadcast_discover() {
        Ok(found) => match found.get(&serial_number) {
            Some(record) => record.ip_addr,
            None => resolve_ip_mdns(serial_number)?,
        },
        Err(_) => resolve_ip_mdns(serial_number)?,
    };

    let sock = TcpFramedSocket::connect(None, ip, SCAN_SERVER_UPDATE_PORT, Duration::from_secs(5))?;
    let msg = protocol::encode(&ClientMessage::RebootRequest)?;
    sock.send(&msg)?;

    // Give the socket time to flush before closing; the device drops the
    // connection once it begins rebooting.
    std::thread::sleep(Duration::from_millis(500));

    log::info!("sent reboot request to scan head {} at {}", serial_number, ip);
    Ok(())
}
