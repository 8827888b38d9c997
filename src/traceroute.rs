use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, instrument, trace, warn};

use crate::error::{DecodeError, NetResult};
use crate::packet::{self, IcmpMessage, OriginalDatagram};
use crate::ping::millis;
use crate::transport::{RawSocket, Receive, Transport};
use crate::util::{self, HostnameCache};

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_hops: u8,
    /// How long to wait for each probe.
    pub timeout: Duration,
    /// Probes sent at each TTL.
    pub probes: u16,
    pub identifier: u16,
    pub payload_size: usize,
    pub resolve_hostnames: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            max_hops: 30,
            timeout: Duration::from_secs(3),
            probes: 3,
            identifier: util::default_identifier(),
            payload_size: 56,
            resolve_hostnames: true,
        }
    }
}

/// The address that answered one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Responder {
    pub ip: IpAddr,
    pub hostname: Option<String>,
}

/// Everything learned at one TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct HopResult {
    /// The TTL, starting at 1.
    pub hop: u8,
    /// First address to answer at this hop.
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    /// One slot per probe in send order, `None` where the probe timed out.
    pub rtts: Vec<Option<f64>>,
    /// Who answered each probe, slot for slot with `rtts`. Differs within a
    /// hop when the path is load balanced.
    pub responders: Vec<Option<Responder>>,
    pub is_timeout: bool,
}

impl fmt::Display for HopResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:2} ", self.hop)?;
        let mut last: Option<IpAddr> = None;
        for (i, rtt) in self.rtts.iter().enumerate() {
            let responder = self.responders.get(i).and_then(Option::as_ref);
            if let (Some(_), Some(responder)) = (rtt, responder) {
                if last != Some(responder.ip) {
                    let gap = if i == 0 { " " } else { "   " };
                    write!(f, "{}{}", gap, util::host_label(responder.ip, responder.hostname.as_deref()))?;
                    last = Some(responder.ip);
                }
            }
            match rtt {
                Some(ms) => write!(f, "  {:.3} ms", ms)?,
                None => write!(f, "  *")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TracerouteResult {
    pub host: String,
    pub destination: Option<IpAddr>,
    pub hops: Vec<HopResult>,
    /// The last hop was answered by the destination itself.
    pub reached: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopReply {
    TimeExceeded,
    EchoReply,
    Unreachable,
}

/// A response that answered one probe.
#[derive(Debug)]
struct ProbeReply {
    source: IpAddr,
    rtt: Duration,
    kind: HopReply,
}

/// Walks the path to one address, one TTL at a time.
pub struct Tracer<T> {
    destination: IpAddr,
    transport: T,
    config: TraceConfig,
    hostnames: HostnameCache,

    sequence: u16,
    hops_done: u8,
    reached: bool,
}

impl<T: Transport> Tracer<T> {
    pub fn new(transport: T, destination: IpAddr, config: TraceConfig) -> Self {
        debug!(%destination, ?config, "new traceroute session");
        Tracer {
            destination,
            transport,
            hostnames: HostnameCache::new(config.resolve_hostnames),
            config,
            sequence: 0,
            hops_done: 0,
            reached: false,
        }
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn reached(&self) -> bool {
        self.reached
    }

    /// True once the destination answered or the hop budget is spent.
    pub fn finished(&self) -> bool {
        self.reached || self.hops_done >= self.config.max_hops
    }

    /// Probe the next TTL, or `None` when the trace is over.
    pub fn next_hop(&mut self) -> Option<HopResult> {
        if self.finished() {
            return None;
        }
        self.hops_done += 1;
        let hop = self.trace_hop(self.hops_done);
        self.reached = hop.ip == Some(self.destination);
        Some(hop)
    }

    /// Trace to completion. The transport is dropped before this returns.
    pub fn run(mut self, host: &str) -> TracerouteResult {
        let mut hops = Vec::new();
        while let Some(hop) = self.next_hop() {
            hops.push(hop);
        }
        TracerouteResult {
            host: host.to_string(),
            destination: Some(self.destination),
            hops,
            reached: self.reached,
            error: None,
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn trace_hop(&mut self, ttl: u8) -> HopResult {
        let mut sources = Vec::with_capacity(self.config.probes as usize);
        let mut rtts = Vec::with_capacity(self.config.probes as usize);

        for _ in 0..self.config.probes {
            match self.probe(ttl) {
                Ok(Some(reply)) => {
                    trace!(ttl, source = %reply.source, kind = ?reply.kind, "hop replied");
                    sources.push(Some(reply.source));
                    rtts.push(Some(millis(reply.rtt)));
                }
                Ok(None) => {
                    sources.push(None);
                    rtts.push(None);
                }
                Err(e) => {
                    warn!(ttl, error = %e, "probe failed");
                    sources.push(None);
                    rtts.push(None);
                }
            }
        }

        let responders: Vec<Option<Responder>> = sources
            .into_iter()
            .map(|source| {
                source.map(|ip| Responder {
                    ip,
                    hostname: self.hostnames.lookup(ip),
                })
            })
            .collect();
        let first = responders.iter().flatten().next().cloned();

        HopResult {
            hop: ttl,
            ip: first.as_ref().map(|r| r.ip),
            hostname: first.and_then(|r| r.hostname),
            rtts,
            is_timeout: responders.iter().all(Option::is_none),
            responders,
        }
    }

    fn probe(&mut self, ttl: u8) -> NetResult<Option<ProbeReply>> {
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;

        let payload = packet::timestamped_payload(self.config.payload_size, SystemTime::now());
        let request = packet::encode_echo_request(self.config.identifier, sequence, &payload)?;
        let sent_at = self.transport.send(self.destination, &request, Some(u32::from(ttl)))?;
        self.await_reply(sequence, sent_at)
    }

    fn await_reply(&mut self, sequence: u16, sent_at: Instant) -> NetResult<Option<ProbeReply>> {
        let deadline = util::deadline(sent_at, self.config.timeout);

        loop {
            let datagram = match self.transport.receive(deadline)? {
                Receive::Datagram(d) => d,
                Receive::Timeout => return Ok(None),
            };

            let message = match packet::parse_ipv4(&datagram.bytes).and_then(|ip| packet::decode(ip.payload)) {
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

            if let Some(kind) = self.correlate(&message, sequence) {
                return Ok(Some(ProbeReply {
                    source: datagram.source,
                    rtt: datagram.received_at.saturating_duration_since(sent_at),
                    kind,
                }));
            }
            trace!(source = %datagram.source, ?message, "not a reply to this probe");
        }
    }

    /// Match a message against the probe in flight.
    ///
    /// Echo replies must carry our identifier and sequence. Errors must quote
    /// our identifier; a quote cut short before the sequence counts as a
    /// match, since only one probe is ever in flight.
    fn correlate(&self, message: &IcmpMessage, sequence: u16) -> Option<HopReply> {
        match message {
            IcmpMessage::EchoReply(echo)
                if echo.identifier == self.config.identifier && echo.sequence == sequence =>
            {
                Some(HopReply::EchoReply)
            }
            IcmpMessage::TimeExceeded { original, .. } if self.quotes_probe(original, sequence) => {
                Some(HopReply::TimeExceeded)
            }
            IcmpMessage::DestinationUnreachable { original, .. } if self.quotes_probe(original, sequence) => {
                Some(HopReply::Unreachable)
            }
            _ => None,
        }
    }

    fn quotes_probe(&self, original: &OriginalDatagram, sequence: u16) -> bool {
        original.identifier == Some(self.config.identifier)
            && original.sequence.map_or(true, |s| s == sequence)
            && original.destination.map_or(true, |d| IpAddr::V4(d) == self.destination)
    }
}

/// Lazily runs a traceroute, yielding each hop as soon as its probes finish.
///
/// The transport is released once the trace ends, or when the stream is
/// dropped early.
pub struct TracerouteStream<T> {
    banner: String,
    tracer: Option<Tracer<T>>,
    reached: bool,
}

impl<T: Transport> TracerouteStream<T> {
    pub fn new(host: &str, tracer: Tracer<T>) -> Self {
        let banner = format!(
            "traceroute to {} ({}), {} hops max, {} probes per hop",
            host, tracer.destination, tracer.config.max_hops, tracer.config.probes
        );
        TracerouteStream {
            banner,
            tracer: Some(tracer),
            reached: false,
        }
    }

    /// Header line describing the trace. Not one of the stream's items.
    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn reached(&self) -> bool {
        self.reached
    }
}

impl<T: Transport> Iterator for TracerouteStream<T> {
    type Item = HopResult;

    fn next(&mut self) -> Option<HopResult> {
        let tracer = self.tracer.as_mut()?;
        let hop = tracer.next_hop();
        self.reached = tracer.reached();
        if tracer.finished() || hop.is_none() {
            self.tracer = None;
        }
        hop
    }
}

fn open_session(host: &str, config: TraceConfig) -> NetResult<Tracer<RawSocket>> {
    let destination = util::resolve_dest(host)?;
    let transport = RawSocket::open()?;
    Ok(Tracer::new(transport, destination, config))
}

/// Trace the path to `host` and return every hop.
pub fn traceroute(host: &str, max_hops: u8, timeout: Duration, probes: u16) -> TracerouteResult {
    let config = TraceConfig {
        max_hops,
        timeout,
        probes,
        ..TraceConfig::default()
    };
    traceroute_with_config(host, config)
}

pub fn traceroute_with_config(host: &str, config: TraceConfig) -> TracerouteResult {
    match open_session(host, config) {
        Ok(tracer) => tracer.run(host),
        Err(e) => {
            if e.is_permission() {
                warn!(host, error = %e, "traceroute aborted");
            } else {
                debug!(host, error = %e, "traceroute aborted");
            }
            TracerouteResult {
                host: host.to_string(),
                destination: None,
                hops: Vec::new(),
                reached: false,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Trace the path to `host` lazily, one hop per item.
pub fn traceroute_stream(
    host: &str,
    max_hops: u8,
    timeout: Duration,
    probes: u16,
) -> NetResult<TracerouteStream<RawSocket>> {
    let config = TraceConfig {
        max_hops,
        timeout,
        probes,
        ..TraceConfig::default()
    };
    traceroute_stream_with_config(host, config)
}

pub fn traceroute_stream_with_config(host: &str, config: TraceConfig) -> NetResult<TracerouteStream<RawSocket>> {
    let tracer = open_session(host, config)?;
    Ok(TracerouteStream::new(host, tracer))
}
