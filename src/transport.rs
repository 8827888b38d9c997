use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket};
use tracing::{instrument, trace};

use crate::error::{NetError, NetResult};

const RECV_BUFFER_LEN: usize = 4096;

/// A datagram read off the wire, IP header included.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub source: IpAddr,
    pub received_at: Instant,
}

/// Outcome of waiting for a datagram. Running out the deadline is an
/// expected outcome, not an error.
#[derive(Debug)]
pub enum Receive {
    Datagram(Datagram),
    Timeout,
}

/// Where the engines send probes and read replies from.
///
/// Implementations own their socket; dropping the transport releases it.
pub trait Transport {
    /// Send `packet` to `dest`, first setting the outgoing TTL when one is
    /// given. Returns the instant the packet left.
    fn send(&mut self, dest: IpAddr, packet: &[u8], ttl: Option<u32>) -> NetResult<Instant>;

    /// Wait for the next datagram, giving up at `deadline`.
    fn receive(&mut self, deadline: Instant) -> NetResult<Receive>;
}

/// A raw ICMPv4 socket.
pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    /// Open a raw ICMP socket. Needs root, CAP_NET_RAW or the platform
    /// equivalent; without it this fails with `NetError::Permission`.
    pub fn open() -> NetResult<Self> {
        let stype = socket2::Type::raw().cloexec();
        let socket = Socket::new(Domain::ipv4(), stype, Some(Protocol::icmpv4()))
            .map_err(NetError::from_open)?;
        Ok(RawSocket { socket })
    }
}

impl Transport for RawSocket {
    #[instrument(level = "trace", skip(self, packet))]
    fn send(&mut self, dest: IpAddr, packet: &[u8], ttl: Option<u32>) -> NetResult<Instant> {
        if let Some(ttl) = ttl {
            self.socket.set_ttl(ttl).map_err(NetError::Send)?;
        }

        let sock_addr = SockAddr::from(SocketAddr::new(dest, 0));
        let sent_at = Instant::now();
        self.socket.send_to(packet, &sock_addr).map_err(NetError::Send)?;
        Ok(sent_at)
    }

    fn receive(&mut self, deadline: Instant) -> NetResult<Receive> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Receive::Timeout);
            }

            // A zero timeout means "block forever" to the socket layer
            let relative_timeout = std::cmp::max(deadline - now, Duration::from_millis(1));
            self.socket
                .set_read_timeout(Some(relative_timeout))
                .map_err(NetError::Receive)?;

            let mut buf = [0; RECV_BUFFER_LEN]; // We want the buffer to be fresh every time
            let (len, from) = match self.socket.recv_from(&mut buf[..]) {
                Ok(received) => received,
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock | ErrorKind::TimedOut => return Ok(Receive::Timeout),
                    ErrorKind::Interrupted => continue,
                    _ => return Err(NetError::Receive(e)),
                },
            };
            let received_at = Instant::now();

            let source = match from.as_std() {
                Some(addr) => addr.ip(),
                None => {
                    trace!(len, "dropping datagram without an inet source address");
                    continue;
                }
            };

            return Ok(Receive::Datagram(Datagram {
                bytes: buf[..len].to_vec(),
                source,
                received_at,
            }));
        }
    }
}
