//! Raw ICMP socket I/O.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::PingError;
use crate::packet::{Family, PseudoHeader};
use crate::resolver::ResolvedAddress;

const RECV_BUFFER_LEN: usize = 65536;

#[derive(Debug)]
pub enum TransportEvent {
    Datagram { bytes: Vec<u8>, source: IpAddr },
    /// The read loop hit an unrecoverable error and has exited.
    Failed(io::Error),
}

pub type DatagramCallback = Box<dyn FnMut(TransportEvent) + Send + 'static>;

/// A socket able to carry ICMP echo traffic for one address family.
pub trait IcmpTransport: Send + 'static {
    fn family(&self) -> Family;

    /// Addresses for ICMPv6 checksums, when the local source is known.
    fn pseudo_header(&self) -> Option<PseudoHeader> {
        None
    }

    /// Non-blocking send of one complete ICMP message.
    fn send(&self, packet: &[u8]) -> Result<usize, PingError>;

    /// Delivers every datagram arriving on the socket, unfiltered.
    fn start_receiving(&mut self, on_datagram: DatagramCallback);

    /// Stops the read loop and releases the socket before returning. Idempotent.
    fn close(&mut self);
}

pub struct RawSocketTransport {
    family: Family,
    destination: SockAddr,
    pseudo: Option<PseudoHeader>,
    socket: Option<Arc<AsyncFd<Socket>>>,
    receiver: Option<JoinHandle<()>>,
}

impl RawSocketTransport {
    /// Opens a non-blocking raw socket for the target's family.
    /// Must be called from within a tokio runtime.
    pub fn open(target: &ResolvedAddress) -> Result<Self, PingError> {
        let family = target.family();
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let socket = Socket::new_raw(domain, Type::RAW, Some(protocol))
            .map_err(PingError::SocketOpenFailed)?;
        socket
            .set_nonblocking(true)
            .map_err(PingError::SocketOpenFailed)?;
        let socket = AsyncFd::new(socket).map_err(PingError::SocketOpenFailed)?;

        let pseudo = match target.ip() {
            IpAddr::V6(dest) => match local_source_for(dest) {
                Ok(source) => Some(PseudoHeader::new(source, dest)),
                Err(e) => {
                    debug!("no local source for {}, kernel will checksum: {}", dest, e);
                    None
                }
            },
            IpAddr::V4(_) => None,
        };

        info!("opened raw {:?} socket for {}", family, target);
        Ok(Self {
            family,
            destination: SockAddr::from(SocketAddr::new(target.ip(), 0)),
            pseudo,
            socket: Some(Arc::new(socket)),
            receiver: None,
        })
    }
}

/// Source address the routing table would pick for `dest`. Connecting a UDP
/// socket sends nothing.
fn local_source_for(dest: Ipv6Addr) -> io::Result<Ipv6Addr> {
    let udp = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?;
    udp.connect((dest, 9))?;
    match udp.local_addr()?.ip() {
        IpAddr::V6(source) => Ok(source),
        IpAddr::V4(_) => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "routed over IPv4",
        )),
    }
}

fn unspecified(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

async fn recv_datagram(
    socket: &AsyncFd<Socket>,
    buf: &mut [u8],
) -> io::Result<(usize, Option<IpAddr>)> {
    loop {
        let mut guard = socket.readable().await?;
        // SAFETY: `buf` is already initialised; recv_from only writes into it.
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), buf.len())
        };
        match guard.try_io(|inner| inner.get_ref().recv_from(uninit)) {
            Ok(Ok((len, addr))) => return Ok((len, addr.as_socket().map(|sa| sa.ip()))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
}

impl IcmpTransport for RawSocketTransport {
    fn family(&self) -> Family {
        self.family
    }

    fn pseudo_header(&self) -> Option<PseudoHeader> {
        self.pseudo
    }

    fn send(&self, packet: &[u8]) -> Result<usize, PingError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| PingError::SendFailed(io::ErrorKind::NotConnected.into()))?;
        socket
            .get_ref()
            .send_to(packet, &self.destination)
            .map_err(PingError::SendFailed)
    }

    fn start_receiving(&mut self, mut on_datagram: DatagramCallback) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        if let Some(previous) = self.receiver.take() {
            previous.abort();
        }
        let family = self.family;
        self.receiver = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_LEN];
            loop {
                match recv_datagram(&socket, &mut buf).await {
                    Ok((len, source)) => on_datagram(TransportEvent::Datagram {
                        bytes: buf[..len].to_vec(),
                        source: source.unwrap_or_else(|| unspecified(family)),
                    }),
                    Err(e) => {
                        on_datagram(TransportEvent::Failed(e));
                        break;
                    }
                }
            }
        }));
    }

    fn close(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        if let Some(socket) = self.socket.take() {
            // Unconnected raw sockets answer ENOTCONN but are shut down all the
            // same; the descriptor goes once the aborted read loop drops.
            let _ = socket.get_ref().shutdown(Shutdown::Both);
            debug!("closed raw {:?} socket", self.family);
        }
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}
