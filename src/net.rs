use crate::error::Error;
use crate::Result;
use byteorder::{ByteOrder, LittleEndian};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Poll slice for blocking reads; the cancellation flag is checked at this
/// granularity.
const READ_POLL: Duration = Duration::from_secs(1);

/// A usable IPv4 interface on the client machine.
#[derive(Debug, Clone)]
pub struct ClientInterface {
    pub name: String,
    pub ip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Enumerate client network interfaces, excluding loopback and zero-address
/// entries.
pub fn client_interfaces() -> Vec<ClientInterface> {
    let mut interfaces = Vec::new();

    for iface in pnet::datalink::interfaces() {
        for network in &iface.ips {
            let ip = match network {
                pnet::ipnetwork::IpNetwork::V4(v4) => v4,
                _ => continue,
            };
            let addr = ip.ip();
            if addr.is_loopback() || addr.is_unspecified() {
                continue;
            }
            interfaces.push(ClientInterface {
                name: iface.name.clone(),
                ip_addr: addr,
                netmask: ip.mask(),
            });
        }
    }

    interfaces
}

fn net_err(context: &str, e: std::io::Error) -> Error {
    Error::Network(format!("{}: {}", context, e))
}

/// TCP stream socket carrying length-framed messages: every send and every
/// read is a little-endian `u32` length prefix followed by exactly that
/// many payload bytes.
///
/// Reads poll in one-second slices so a blocked call observes the optional
/// cancellation flag; a cleared flag or a quiet socket yields `Ok(0)`
/// rather than an error. EOF and OS-level failures close the socket and
/// report `Error::Network`.
pub struct TcpFramedSocket {
    stream: Option<TcpStream>,
}

impl TcpFramedSocket {
    /// Connect to `ip:port`, optionally pinned to a specific client
    /// interface so multi-homed hosts route deterministically. On Linux the
    /// pin also binds to the device by name, since the address alone does
    /// not constrain routing there.
    pub fn connect(
        client: Option<(&str, Ipv4Addr)>,
        ip: Ipv4Addr,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| net_err("socket", e))?;

        if let Some((name, client_ip)) = client {
            let bind_addr = SocketAddrV4::new(client_ip, 0);
            socket
                .bind(&bind_addr.into())
                .map_err(|e| net_err("bind", e))?;

            #[cfg(target_os = "linux")]
            if !name.is_empty() {
                socket
                    .bind_device(Some(name.as_bytes()))
                    .map_err(|e| net_err("bind device", e))?;
            }
            #[cfg(not(target_os = "linux"))]
            let _ = name;
        }

        socket.set_nodelay(true).map_err(|e| net_err("nodelay", e))?;

        let addr = SocketAddrV4::new(ip, port);
        let connect_timeout = if timeout.is_zero() {
            Duration::from_secs(5)
        } else {
            timeout
        };
        socket
            .connect_timeout(&addr.into(), connect_timeout)
            .map_err(|e| net_err("connect", e))?;

        let stream: TcpStream = socket.into();
        stream
            .set_read_timeout(Some(READ_POLL))
            .map_err(|e| net_err("read timeout", e))?;
        stream
            .set_write_timeout(Some(connect_timeout))
            .map_err(|e| net_err("write timeout", e))?;

        Ok(Self {
            stream: Some(stream),
        })
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Send one length-framed message, fully delivered before returning.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut stream = self.stream.as_ref().ok_or_else(|| {
            Error::Network("send on closed socket".into())
        })?;

        let mut prefix = [0u8; 4];
        LittleEndian::write_u32(&mut prefix, payload.len() as u32);

        stream
            .write_all(&prefix)
            .and_then(|_| stream.write_all(payload))
            .map_err(|e| net_err("send", e))
    }

    /// Read one framed message into `buf`, returning the payload length.
    ///
    /// Returns `Ok(0)` when the length prefix has not arrived within one
    /// poll slice (soft timeout) or when `cancel` is cleared while blocked.
    /// Once the prefix has arrived, the call keeps polling until the whole
    /// payload is in. A frame larger than `buf` is a caller bug and reports
    /// `Error::Internal`.
    pub fn read(&mut self, buf: &mut [u8], cancel: Option<&AtomicBool>) -> Result<usize> {
        let mut prefix = [0u8; 4];
        if self.read_bytes(&mut prefix, cancel, true)? == 0 {
            return Ok(0);
        }

        let msg_len = LittleEndian::read_u32(&prefix) as usize;
        if msg_len > buf.len() {
            return Err(Error::Internal(format!(
                "framed message of {} bytes exceeds read buffer of {}",
                msg_len,
                buf.len()
            )));
        }

        if msg_len == 0 {
            return Ok(0);
        }

        self.read_bytes(&mut buf[..msg_len], cancel, false)
    }

    /// Fill `dst` from the stream. Returns the byte count on completion and
    /// 0 on soft timeout (only if `timeout_returns` and nothing was read
    /// yet) or cancellation.
    fn read_bytes(
        &mut self,
        dst: &mut [u8],
        cancel: Option<&AtomicBool>,
        timeout_returns: bool,
    ) -> Result<usize> {
        let mut n = 0;
        while n < dst.len() {
            let result = {
                let mut stream = match self.stream.as_ref() {
                    Some(s) => s,
                    None => return Err(Error::Network("read on closed socket".into())),
                };
                stream.read(&mut dst[n..])
            };

            match result {
                Ok(0) => {
                    // Peer closed the connection.
                    self.close();
                    return Err(Error::Network("connection closed".into()));
                }
                Ok(r) => n += r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    if let Some(flag) = cancel {
                        if !flag.load(Ordering::Relaxed) {
                            return Ok(0);
                        }
                    }
                    if timeout_returns && n == 0 {
                        return Ok(0);
                    }
                }
                Err(e) => {
                    self.close();
                    return Err(net_err("read", e));
                }
            }
        }

        Ok(n)
    }
}

impl Drop for TcpFramedSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// UDP socket bound to a chosen interface and port (port 0 = ephemeral),
/// reading with an internal poll.
pub struct UdpSocket {
    sock: std::net::UdpSocket,
    local_port: u16,
}

impl UdpSocket {
    pub fn bind(ip: Ipv4Addr, port: u16, timeout: Duration) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| net_err("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| net_err("reuse address", e))?;
        socket
            .bind(&SocketAddrV4::new(ip, port).into())
            .map_err(|e| net_err("bind", e))?;

        let sock: std::net::UdpSocket = socket.into();
        sock.set_read_timeout(Some(if timeout.is_zero() {
            READ_POLL
        } else {
            timeout
        }))
        .map_err(|e| net_err("read timeout", e))?;

        let local_port = sock
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| net_err("local addr", e))?;

        Ok(Self { sock, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send_to(&self, ip: Ipv4Addr, port: u16, buf: &[u8]) -> Result<()> {
        self.sock
            .send_to(buf, SocketAddrV4::new(ip, port))
            .map(|_| ())
            .map_err(|e| net_err("send_to", e))
    }

    /// Read one datagram. Returns `Ok((0, None))` when nothing arrives
    /// within the poll window.
    pub fn read(&self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)> {
        match self.sock.recv_from(buf) {
            Ok((n, addr)) => Ok((n, Some(addr))),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok((0, None))
            }
            Err(e) => Err(net_err("recv", e)),
        }
    }
}

/// Non-blocking UDP socket for broadcast probes on one interface.
pub struct UdpBroadcastSocket {
    sock: std::net::UdpSocket,
}

impl UdpBroadcastSocket {
    pub fn bind(interface_ip: Ipv4Addr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| net_err("socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| net_err("reuse address", e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| net_err("broadcast", e))?;
        socket
            .bind(&SocketAddrV4::new(interface_ip, 0).into())
            .map_err(|e| net_err("bind", e))?;

        let sock: std::net::UdpSocket = socket.into();
        sock.set_nonblocking(true)
            .map_err(|e| net_err("nonblocking", e))?;

        Ok(Self { sock })
    }

    /// Broadcast `buf` to the all-ones address on `port`.
    pub fn send(&self, port: u16, buf: &[u8]) -> Result<()> {
        self.sock
            .send_to(buf, SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
            .map(|_| ())
            .map_err(|e| net_err("broadcast send", e))
    }

    /// Drain one pending datagram; `Ok(0)` when the queue is empty.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.sock.recv(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(net_err("recv", e)),
        }
    }
}
