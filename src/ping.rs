use std::fmt;
use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, instrument, trace, warn};

use crate::error::{DecodeError, NetError, NetResult};
use crate::packet::{self, IcmpMessage, OriginalDatagram};
use crate::transport::{RawSocket, Receive, Transport};
use crate::util::{self, HostnameCache};

#[derive(Debug, Clone)]
pub struct PingConfig {
    /// Number of echo requests, sequence numbered `0..count`.
    pub count: u16,
    /// How long to wait for each reply.
    pub timeout: Duration,
    /// Minimum spacing between consecutive sends.
    pub interval: Duration,
    /// ICMP identifier that marks replies as ours.
    pub identifier: u16,
    pub payload_size: usize,
    /// Outgoing TTL, when not the system default.
    pub ttl: Option<u32>,
    pub resolve_hostnames: bool,
}

impl Default for PingConfig {
    fn default() -> Self {
        PingConfig {
            count: 4,
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(1),
            identifier: util::default_identifier(),
            payload_size: 56,
            ttl: None,
            resolve_hostnames: true,
        }
    }
}

/// Outcome of a whole ping run. RTTs are in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    pub host: String,
    pub is_reachable: bool,
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packet_loss: f64,
    pub min_rtt: Option<f64>,
    pub avg_rtt: Option<f64>,
    pub max_rtt: Option<f64>,
    /// Set only when the run could not happen at all.
    pub error: Option<String>,
}

impl PingResult {
    pub(crate) fn failed(host: &str, err: &NetError) -> Self {
        PingResult {
            error: Some(err.to_string()),
            ..PingResult::from_samples(host, 0, &[])
        }
    }

    pub(crate) fn from_samples(host: &str, sent: u32, rtts: &[f64]) -> Self {
        let received = rtts.len() as u32;
        let packet_loss = if sent == 0 {
            0.0
        } else {
            100.0 * f64::from(sent - received) / f64::from(sent)
        };

        let (min_rtt, avg_rtt, max_rtt) = if rtts.is_empty() {
            (None, None, None)
        } else {
            let min = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            // rounding in the sum must not push the mean outside the samples
            let avg = (rtts.iter().sum::<f64>() / rtts.len() as f64).max(min).min(max);
            (Some(min), Some(avg), Some(max))
        };

        PingResult {
            host: host.to_string(),
            is_reachable: received > 0,
            packets_sent: sent,
            packets_received: received,
            packet_loss,
            min_rtt,
            avg_rtt,
            max_rtt,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    Reply,
    TimeLimitExceeded,
    Unreachable(u8),
}

/// A response that answered one of our probes.
#[derive(Debug, Clone)]
pub struct PongResult {
    pub address: IpAddr,
    pub hostname: Option<String>,

    pub sequence: u16,
    pub ttl: u8,
    /// ICMP message size, header included.
    pub size: usize,
    pub rtt: Duration,
    pub mtype: ReplyType,
}

/// One item of a ping stream. Each renders as a single display line except
/// the summary, which spans the statistics block.
#[derive(Debug, Clone)]
pub enum PingEvent {
    Pong(PongResult),
    Timeout { sequence: u16 },
    Failed { sequence: u16, error: String },
    Summary(PingResult),
}

pub(crate) fn millis(rtt: Duration) -> f64 {
    rtt.as_micros() as f64 / 1000f64
}

fn unreachable_reason(code: u8) -> String {
    match code {
        0 => "Destination Net Unreachable".to_string(),
        1 => "Destination Host Unreachable".to_string(),
        2 => "Destination Protocol Unreachable".to_string(),
        3 => "Destination Port Unreachable".to_string(),
        4 => "Frag needed and DF set".to_string(),
        9 | 10 | 13 => "Packet filtered".to_string(),
        other => format!("Destination unreachable, code {}", other),
    }
}

impl fmt::Display for PingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingEvent::Pong(pong) => {
                let from = util::host_label(pong.address, pong.hostname.as_deref());
                match pong.mtype {
                    ReplyType::Reply => write!(
                        f,
                        "{} bytes from {}: icmp_seq={} ttl={} time={:.1} ms",
                        pong.size,
                        from,
                        pong.sequence,
                        pong.ttl,
                        millis(pong.rtt)
                    ),
                    ReplyType::TimeLimitExceeded => {
                        write!(f, "From {} icmp_seq={} Time to live exceeded", from, pong.sequence)
                    }
                    ReplyType::Unreachable(code) => write!(
                        f,
                        "From {} icmp_seq={} {}",
                        from,
                        pong.sequence,
                        unreachable_reason(code)
                    ),
                }
            }
            PingEvent::Timeout { sequence } => write!(f, "Request timeout for icmp_seq {}", sequence),
            PingEvent::Failed { sequence, error } => write!(f, "icmp_seq {}: {}", sequence, error),
            PingEvent::Summary(result) => {
                writeln!(f, "--- {} ping statistics ---", result.host)?;
                write!(
                    f,
                    "{} packets transmitted, {} packets received, {:.1}% packet loss",
                    result.packets_sent, result.packets_received, result.packet_loss
                )?;
                if let (Some(min), Some(avg), Some(max)) = (result.min_rtt, result.avg_rtt, result.max_rtt) {
                    write!(f, "\nrtt min/avg/max = {:.3}/{:.3}/{:.3} ms", min, avg, max)?;
                }
                Ok(())
            }
        }
    }
}

/// Sends sequenced echo requests to one address and matches the replies.
pub struct Pinger<T> {
    address: IpAddr,
    transport: T,
    config: PingConfig,
    hostnames: HostnameCache,

    last_sent: Option<Instant>,
    sent: u32,
    rtts: Vec<f64>,
}

impl<T: Transport> Pinger<T> {
    pub fn new(transport: T, address: IpAddr, config: PingConfig) -> Self {
        debug!(%address, ?config, "new ping session");
        Pinger {
            address,
            transport,
            hostnames: HostnameCache::new(config.resolve_hostnames),
            config,
            last_sent: None,
            sent: 0,
            rtts: Vec::new(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn config(&self) -> &PingConfig {
        &self.config
    }

    /// Run one probe to completion and fold its outcome into the statistics.
    pub fn probe(&mut self, sequence: u16) -> PingEvent {
        self.pace();
        self.sent += 1;

        match self.exchange(sequence) {
            Ok(Some(pong)) => {
                if pong.mtype == ReplyType::Reply {
                    self.rtts.push(millis(pong.rtt));
                }
                PingEvent::Pong(pong)
            }
            Ok(None) => PingEvent::Timeout { sequence },
            Err(e) => {
                warn!(sequence, error = %e, "probe failed");
                PingEvent::Failed {
                    sequence,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Statistics over the probes run so far.
    pub fn result(&self, host: &str) -> PingResult {
        PingResult::from_samples(host, self.sent, &self.rtts)
    }

    /// Run every probe and return the statistics. The transport is dropped
    /// before this returns.
    pub fn run(mut self, host: &str) -> PingResult {
        for sequence in 0..self.config.count {
            self.probe(sequence);
        }
        self.result(host)
    }

    fn pace(&self) {
        if let Some(last) = self.last_sent {
            let next = util::deadline(last, self.config.interval);
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn exchange(&mut self, sequence: u16) -> NetResult<Option<PongResult>> {
        let payload = packet::timestamped_payload(self.config.payload_size, SystemTime::now());
        let request = packet::encode_echo_request(self.config.identifier, sequence, &payload)?;
        let sent_at = self.transport.send(self.address, &request, self.config.ttl)?;
        self.last_sent = Some(sent_at);
        self.receive_pong(sequence, sent_at)
    }

    fn receive_pong(&mut self, sequence: u16, sent_at: Instant) -> NetResult<Option<PongResult>> {
        let deadline = util::deadline(sent_at, self.config.timeout);

        loop {
            let datagram = match self.transport.receive(deadline)? {
                Receive::Datagram(d) => d,
                Receive::Timeout => return Ok(None),
            };

            let ip = match packet::parse_ipv4(&datagram.bytes) {
                Ok(ip) => ip,
                Err(e) => {
                    debug!(source = %datagram.source, error = %e, "ignoring datagram");
                    continue;
                }
            };

            let message = match packet::decode(ip.payload) {
                Ok(message) => message,
                Err(DecodeError::UnsupportedType(t)) => {
                    trace!(source = %datagram.source, message_type = t, "ignoring ICMP message");
                    continue;
                }
                Err(e) => {
                    debug!(source = %datagram.source, error = %e, "ignoring datagram");
                    continue;
                }
            };

            // Make sure that this is the right type of packet, and ours
            let mtype = match message {
                IcmpMessage::EchoReply(echo)
                    if echo.identifier == self.config.identifier && echo.sequence == sequence =>
                {
                    ReplyType::Reply
                }
                IcmpMessage::TimeExceeded { original, .. } if self.quotes_probe(&original, sequence) => {
                    ReplyType::TimeLimitExceeded
                }
                IcmpMessage::DestinationUnreachable { code, original } if self.quotes_probe(&original, sequence) => {
                    ReplyType::Unreachable(code)
                }
                other => {
                    trace!(source = %datagram.source, ?other, "not a reply to this probe");
                    continue;
                }
            };

            // It was! Construct a Pong Result
            return Ok(Some(PongResult {
                address: datagram.source,
                hostname: self.hostnames.lookup(datagram.source),
                sequence,
                ttl: ip.ttl,
                size: ip.payload.len(),
                rtt: datagram.received_at.saturating_duration_since(sent_at),
                mtype,
            }));
        }
    }

    fn quotes_probe(&self, original: &OriginalDatagram, sequence: u16) -> bool {
        original.identifier == Some(self.config.identifier)
            && original.sequence.map_or(true, |s| s == sequence)
            && original.destination.map_or(true, |d| IpAddr::V4(d) == self.address)
    }
}

/// Lazily runs a ping, yielding one event per probe and then the summary.
///
/// The transport is released as soon as the last probe completes, or when
/// the stream is dropped early.
pub struct PingStream<T> {
    host: String,
    banner: String,
    pinger: Option<Pinger<T>>,
    next_sequence: u32,
    finished: Option<PingResult>,
}

impl<T: Transport> PingStream<T> {
    pub fn new(host: &str, pinger: Pinger<T>) -> Self {
        let payload = pinger.config.payload_size;
        let banner = format!(
            "PING {} ({}) {}({}) bytes of data.",
            host,
            pinger.address,
            payload,
            payload + packet::IPV4_HEADER_LEN + packet::ICMP_HEADER_LEN
        );
        PingStream {
            host: host.to_string(),
            banner,
            pinger: Some(pinger),
            next_sequence: 0,
            finished: None,
        }
    }

    /// Header line describing the run. Not one of the stream's items.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    /// Statistics so far, or the final ones once the stream is exhausted.
    pub fn result(&self) -> PingResult {
        match (&self.finished, &self.pinger) {
            (Some(result), _) => result.clone(),
            (None, Some(pinger)) => pinger.result(&self.host),
            (None, None) => PingResult::from_samples(&self.host, 0, &[]),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.result().is_reachable
    }
}

impl<T: Transport> Iterator for PingStream<T> {
    type Item = PingEvent;

    fn next(&mut self) -> Option<PingEvent> {
        let pinger = self.pinger.as_mut()?;
        if self.next_sequence < u32::from(pinger.config.count) {
            let event = pinger.probe(self.next_sequence as u16);
            self.next_sequence += 1;
            return Some(event);
        }

        // Dropping the pinger closes the socket before the summary goes out
        let pinger = self.pinger.take()?;
        let result = pinger.result(&self.host);
        self.finished = Some(result.clone());
        Some(PingEvent::Summary(result))
    }
}

fn open_session<T, F>(host: &str, config: PingConfig, open: F) -> NetResult<Pinger<T>>
where
    T: Transport,
    F: FnOnce() -> NetResult<T>,
{
    let address = util::resolve_dest(host)?;
    let transport = open()?;
    Ok(Pinger::new(transport, address, config))
}

/// Run a whole session, folding a failure to start it into the result.
fn run_session<T, F>(host: &str, config: PingConfig, open: F) -> PingResult
where
    T: Transport,
    F: FnOnce() -> NetResult<T>,
{
    match open_session(host, config, open) {
        Ok(pinger) => pinger.run(host),
        Err(e) => {
            // the result alone reads as "unreachable"
            if e.is_permission() {
                warn!(host, error = %e, "ping aborted");
            } else {
                debug!(host, error = %e, "ping aborted");
            }
            PingResult::failed(host, &e)
        }
    }
}

/// Ping `host` `count` times and summarize.
pub fn ping(host: &str, count: u16, timeout: Duration) -> PingResult {
    let config = PingConfig {
        count,
        timeout,
        resolve_hostnames: false,
        ..PingConfig::default()
    };
    ping_with_config(host, config)
}

/// Like [`ping`], with every knob exposed. Resolution and socket failures
/// land in the result's `error` field.
pub fn ping_with_config(host: &str, config: PingConfig) -> PingResult {
    run_session(host, config, RawSocket::open)
}

/// Ping `host` lazily, one event per probe followed by the summary.
pub fn ping_stream(host: &str, count: u16, timeout: Duration) -> NetResult<PingStream<RawSocket>> {
    let config = PingConfig {
        count,
        timeout,
        ..PingConfig::default()
    };
    ping_stream_with_config(host, config)
}

pub fn ping_stream_with_config(host: &str, config: PingConfig) -> NetResult<PingStream<RawSocket>> {
    let pinger = open_session(host, config, RawSocket::open)?;
    Ok(PingStream::new(host, pinger))
}

pub fn is_host_reachable(host: &str, timeout: Duration) -> bool {
    ping(host, 1, timeout).is_reachable
}

/// Ping each host in turn, results in input order.
pub fn ping_multiple<I, S>(hosts: I, count: u16, timeout: Duration) -> Vec<PingResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    hosts
        .into_iter()
        .map(|host| ping(host.as_ref(), count, timeout))
        .collect()
}
