use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::dns::PingTarget;
use crate::error::PingError;

/// How long a blocking receive waits before re-checking whether the socket was closed.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RECV_BUFFER_SIZE: usize = 2048;

/// Anything that can carry ICMP echo traffic for a session.
///
/// `receive_loop` blocks its thread until `close` is called (returning `Ok`)
/// or the underlying channel fails (returning the fatal error).
pub trait EchoTransport: Send + Sync {
    fn send(&self, packet: &[u8]) -> Result<(), PingError>;

    fn receive_loop(&self, on_datagram: &mut dyn FnMut(&[u8], IpAddr)) -> Result<(), PingError>;

    fn close(&self);

    /// Datagram ICMP sockets replace our identifier with their own port number.
    fn rewrites_identifier(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Requires administrator / CAP_NET_RAW
    Raw,
    /// Unprivileged ICMP sockets (Linux ping_group_range, macOS)
    Dgram,
}

#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub ttl: Option<u32>,
    pub source: Option<IpAddr>,
}

pub struct IcmpSocket {
    socket: Socket,
    destination: SockAddr,
    mode: SocketMode,
    closed: AtomicBool,
}

impl IcmpSocket {
    pub fn open(target: &PingTarget, options: &SocketOptions) -> Result<Self, PingError> {
        let is_ipv6 = target.address.is_ipv6();
        let (socket, mode) = Self::create(is_ipv6)?;

        let setup = |e: std::io::Error| PingError::SocketSetup(e.to_string());
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL)).map_err(setup)?;

        if let Some(ttl) = options.ttl {
            if is_ipv6 {
                socket.set_unicast_hops_v6(ttl).map_err(setup)?;
            } else {
                socket.set_ttl(ttl).map_err(setup)?;
            }
        }

        if let Some(source) = options.source {
            socket.bind(&SocketAddr::new(source, 0).into()).map_err(|e| {
                PingError::SocketSetup(format!("cannot bind to source address {}: {}", source, e))
            })?;
        }

        log::debug!("Opened {:?} ICMP socket for {}", mode, target.address);

        Ok(Self {
            socket,
            destination: SocketAddr::new(target.address, 0).into(),
            mode,
            closed: AtomicBool::new(false),
        })
    }

    fn create(is_ipv6: bool) -> Result<(Socket, SocketMode), PingError> {
        let domain = if is_ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let protocol = if is_ipv6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 };

        let raw_error = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(socket) => return Ok((socket, SocketMode::Raw)),
            Err(e) => e,
        };
        log::debug!("Raw ICMP socket unavailable ({}), trying datagram socket", raw_error);

        match Socket::new(domain, Type::DGRAM, Some(protocol)) {
            Ok(socket) => Ok((socket, SocketMode::Dgram)),
            Err(e) if raw_error.kind() == ErrorKind::PermissionDenied || e.kind() == ErrorKind::PermissionDenied => {
                Err(PingError::PermissionDenied(raw_error.to_string()))
            }
            Err(e) => Err(PingError::SocketSetup(e.to_string())),
        }
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EchoTransport for IcmpSocket {
    fn send(&self, packet: &[u8]) -> Result<(), PingError> {
        log::debug!("Sending ICMP packet: {} bytes", packet.len());
        self.socket
            .send_to(packet, &self.destination)
            .map(|_| ())
            .map_err(|e| PingError::SendFailed(e.to_string()))
    }

    fn receive_loop(&self, on_datagram: &mut dyn FnMut(&[u8], IpAddr)) -> Result<(), PingError> {
        let mut buffer = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];

        while !self.is_closed() {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, source)) => {
                    // recv_from initialised the first `len` bytes
                    let data = unsafe { std::slice::from_raw_parts(buffer.as_ptr().cast::<u8>(), len) };
                    match source.as_socket() {
                        Some(addr) => on_datagram(data, addr.ip()),
                        None => log::debug!("Dropping {} bytes from non-IP source", len),
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(_) if self.is_closed() => break,
                Err(e) => return Err(PingError::SessionTerminated(e.to_string())),
            }
        }

        log::debug!("Receive loop exiting");
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Closing ICMP socket");
            // Not connected for raw sockets; the poll interval bounds how long the reader lingers.
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }

    fn rewrites_identifier(&self) -> bool {
        self.mode == SocketMode::Dgram
    }
}
