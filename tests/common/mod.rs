//! A scripted transport: every send is answered from a closure, replies are
//! stamped with synthetic arrival times, and nothing touches the network.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use netdiag::packet::{self, IcmpMessage};
use netdiag::util;
use netdiag::{NetResult, Datagram, Receive, Transport};

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const DEST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

pub fn router(n: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, n, 1)
}

#[derive(Debug, Clone)]
pub struct SentProbe {
    pub dest: IpAddr,
    pub ttl: Option<u32>,
    pub identifier: u16,
    pub sequence: u16,
    pub packet: Vec<u8>,
}

/// A datagram to deliver `delay` after the probe went out.
pub struct Scripted {
    pub bytes: Vec<u8>,
    pub source: Ipv4Addr,
    pub delay: Duration,
}

type Responder = Box<dyn FnMut(&SentProbe) -> Vec<Scripted>>;

pub struct ScriptedTransport {
    responder: Responder,
    pending: VecDeque<(Instant, Scripted)>,
    sent: Rc<RefCell<Vec<SentProbe>>>,
    dropped: Rc<Cell<bool>>,
}

/// What a test can still look at after the transport moved into an engine.
#[derive(Clone)]
pub struct Probe {
    pub sent: Rc<RefCell<Vec<SentProbe>>>,
    pub dropped: Rc<Cell<bool>>,
}

impl Probe {
    pub fn sent(&self) -> Vec<SentProbe> {
        self.sent.borrow().clone()
    }

    pub fn released(&self) -> bool {
        self.dropped.get()
    }
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> (Self, Probe)
    where
        F: FnMut(&SentProbe) -> Vec<Scripted> + 'static,
    {
        let probe = Probe {
            sent: Rc::new(RefCell::new(Vec::new())),
            dropped: Rc::new(Cell::new(false)),
        };
        let transport = ScriptedTransport {
            responder: Box::new(responder),
            pending: VecDeque::new(),
            sent: probe.sent.clone(),
            dropped: probe.dropped.clone(),
        };
        (transport, probe)
    }
}

impl Transport for ScriptedTransport {
    fn send(&mut self, dest: IpAddr, packet: &[u8], ttl: Option<u32>) -> NetResult<Instant> {
        let echo = match packet::decode(packet) {
            Ok(IcmpMessage::EchoRequest(echo)) => echo,
            other => panic!("engine sent something other than an echo request: {:?}", other),
        };
        let probe = SentProbe {
            dest,
            ttl,
            identifier: echo.identifier,
            sequence: echo.sequence,
            packet: packet.to_vec(),
        };

        let sent_at = Instant::now();
        self.pending.clear();
        for scripted in (self.responder)(&probe) {
            self.pending.push_back((sent_at + scripted.delay, scripted));
        }
        self.sent.borrow_mut().push(probe);
        Ok(sent_at)
    }

    fn receive(&mut self, deadline: Instant) -> NetResult<Receive> {
        match self.pending.pop_front() {
            Some((at, scripted)) if at <= deadline => Ok(Receive::Datagram(Datagram {
                bytes: scripted.bytes,
                source: IpAddr::V4(scripted.source),
                received_at: at,
            })),
            _ => {
                self.pending.clear();
                Ok(Receive::Timeout)
            }
        }
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Wrap an ICMP message in a minimal IPv4 header.
pub fn ipv4(source: Ipv4Addr, destination: Ipv4Addr, ttl: u8, payload: &[u8]) -> Vec<u8> {
    let total = (20 + payload.len()) as u16;
    let mut bytes = vec![0x45, 0];
    bytes.extend_from_slice(&total.to_be_bytes());
    bytes.extend_from_slice(&[0, 0, 0, 0, ttl, 1, 0, 0]);
    bytes.extend_from_slice(&source.octets());
    bytes.extend_from_slice(&destination.octets());
    bytes.extend_from_slice(payload);
    bytes
}

pub fn echo_reply_from(source: Ipv4Addr, identifier: u16, sequence: u16, delay: Duration) -> Scripted {
    let icmp = packet::encode_echo(packet::ECHO_REPLY, identifier, sequence, &[0; 56]).unwrap();
    Scripted {
        bytes: ipv4(source, LOCAL, 57, &icmp),
        source,
        delay,
    }
}

/// The echo reply the probe's destination would send.
pub fn reply(probe: &SentProbe, delay: Duration) -> Scripted {
    let source = match probe.dest {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => panic!("IPv4 only"),
    };
    echo_reply_from(source, probe.identifier, probe.sequence, delay)
}

/// An ICMP error of `message_type` from `source`, quoting the first
/// `quote_len` bytes of the probe's ICMP message.
pub fn icmp_error(message_type: u8, code: u8, source: Ipv4Addr, probe: &SentProbe, quote_len: usize, delay: Duration) -> Scripted {
    let dest = match probe.dest {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => panic!("IPv4 only"),
    };
    let quoted = ipv4(LOCAL, dest, 1, &probe.packet[..quote_len]);
    let mut icmp = vec![message_type, code, 0, 0, 0, 0, 0, 0];
    icmp.extend_from_slice(&quoted);
    util::set_checksum(&mut icmp, 1);
    Scripted {
        bytes: ipv4(source, LOCAL, 250, &icmp),
        source,
        delay,
    }
}

pub fn time_exceeded(router: Ipv4Addr, probe: &SentProbe, delay: Duration) -> Scripted {
    icmp_error(packet::TIME_EXCEEDED, 0, router, probe, 8, delay)
}

/// Garbage that is not a valid ICMP message.
pub fn corrupt(source: Ipv4Addr, probe: &SentProbe, delay: Duration) -> Scripted {
    let mut scripted = reply(probe, delay);
    let last = scripted.bytes.len() - 1;
    scripted.bytes[last] ^= 0x01;
    scripted.source = source;
    scripted
}
