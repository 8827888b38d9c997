mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::*;
use netdiag::packet;
use netdiag::NetError;
use netdiag::traceroute::{TraceConfig, Tracer, TracerouteResult, TracerouteStream};

const IDENT: u16 = 0x7472;

fn config(max_hops: u8, probes: u16) -> TraceConfig {
    TraceConfig {
        max_hops,
        timeout: ms(100),
        probes,
        identifier: IDENT,
        resolve_hostnames: false,
        ..TraceConfig::default()
    }
}

/// Routers answer with Time-Exceeded until the TTL reaches the destination.
fn path(routers: usize) -> impl FnMut(&SentProbe) -> Vec<Scripted> {
    move |p| {
        let ttl = p.ttl.expect("traceroute always sets a TTL") as usize;
        if ttl <= routers {
            vec![time_exceeded(router(ttl as u8), p, ms(ttl as u64))]
        } else {
            vec![reply(p, ms(ttl as u64))]
        }
    }
}

fn trace<F>(responder: F, max_hops: u8, probes: u16) -> TracerouteResult
where
    F: FnMut(&SentProbe) -> Vec<Scripted> + 'static,
{
    let (transport, _) = ScriptedTransport::new(responder);
    Tracer::new(transport, IpAddr::V4(DEST), config(max_hops, probes)).run("example.com")
}

fn assert_invariants(result: &TracerouteResult, max_hops: u8) {
    assert!(result.hops.len() <= max_hops as usize);
    for (i, hop) in result.hops.iter().enumerate() {
        assert_eq!(hop.hop as usize, i + 1);
        assert_eq!(hop.responders.len(), hop.rtts.len());
        if hop.is_timeout {
            assert_eq!(hop.ip, None);
            assert!(hop.rtts.iter().all(Option::is_none));
            assert!(hop.responders.iter().all(Option::is_none));
        }
    }
    if result.reached {
        assert_eq!(result.hops.last().and_then(|h| h.ip), Some(IpAddr::V4(DEST)));
    }
}

#[test]
fn stops_at_the_destination() {
    let (transport, probe) = ScriptedTransport::new(path(2));

    let result = Tracer::new(transport, IpAddr::V4(DEST), config(5, 3)).run("example.com");

    assert_eq!(result.hops.len(), 3);
    assert!(result.reached);
    assert_eq!(result.destination, Some(IpAddr::V4(DEST)));
    assert_eq!(result.hops[0].ip, Some(IpAddr::V4(router(1))));
    assert_eq!(result.hops[1].ip, Some(IpAddr::V4(router(2))));
    assert_eq!(result.hops[2].ip, Some(IpAddr::V4(DEST)));
    assert_eq!(result.hops[2].rtts, vec![Some(3.0); 3]);
    assert_invariants(&result, 5);

    let ttls: Vec<Option<u32>> = probe.sent().iter().map(|p| p.ttl).collect();
    let expected: Vec<Option<u32>> = [1, 1, 1, 2, 2, 2, 3, 3, 3].iter().map(|&t| Some(t)).collect();
    assert_eq!(ttls, expected);
    assert!(probe.released());
}

#[test]
fn every_probe_gets_a_fresh_sequence() {
    let (transport, probe) = ScriptedTransport::new(path(1));

    Tracer::new(transport, IpAddr::V4(DEST), config(5, 3)).run("h");

    let sent = probe.sent();
    let mut sequences: Vec<u16> = sent.iter().map(|p| p.sequence).collect();
    sequences.dedup();
    assert_eq!(sequences.len(), sent.len());
    assert!(sent.iter().all(|p| p.identifier == IDENT));
}

#[test]
fn silent_path_exhausts_the_hop_budget() {
    let result = trace(|_| vec![], 4, 2);

    assert_eq!(result.hops.len(), 4);
    assert!(!result.reached);
    assert!(result.hops.iter().all(|h| h.is_timeout && h.rtts == vec![None, None]));
    assert_invariants(&result, 4);
}

#[test]
fn partial_answers_fill_their_slots() {
    let result = trace(
        |p| match p.sequence % 3 {
            1 => vec![],
            _ => vec![time_exceeded(router(9), p, ms(2))],
        },
        2,
        3,
    );

    for hop in &result.hops {
        assert_eq!(hop.ip, Some(IpAddr::V4(router(9))));
        assert_eq!(hop.rtts, vec![None, Some(2.0), Some(2.0)]);
        assert!(!hop.is_timeout);
    }
    assert!(!result.reached);
}

#[test]
fn first_responder_names_the_hop() {
    let result = trace(
        |p| {
            let source = if p.sequence % 2 == 1 { router(1) } else { router(2) };
            vec![time_exceeded(source, p, ms(1))]
        },
        1,
        3,
    );

    let hop = &result.hops[0];
    assert_eq!(hop.ip, Some(IpAddr::V4(router(1))));
    assert_eq!(hop.rtts.len(), 3);

    // every answer is kept, so a load-balanced hop shows each router
    let responders: Vec<Option<IpAddr>> = hop.responders.iter().map(|r| r.as_ref().map(|r| r.ip)).collect();
    let expected: Vec<Option<IpAddr>> = [1, 2, 1].iter().map(|&n| Some(IpAddr::V4(router(n)))).collect();
    assert_eq!(responders, expected);
    assert_eq!(
        hop.to_string(),
        " 1  10.0.1.1  1.000 ms   10.0.2.1  1.000 ms   10.0.1.1  1.000 ms"
    );
    assert_invariants(&result, 1);
}

#[test]
fn truncated_quote_counts_as_a_match() {
    // identifier recoverable, sequence cut off
    let result = trace(|p| vec![icmp_error(packet::TIME_EXCEEDED, 0, router(1), p, 6, ms(1))], 1, 1);

    assert_eq!(result.hops[0].ip, Some(IpAddr::V4(router(1))));
}

#[test]
fn errors_quoting_other_probes_are_ignored() {
    let result = trace(
        |p| {
            let mut foreign = p.clone();
            foreign.packet = packet::encode_echo_request(IDENT ^ 0xffff, p.sequence, &[]).unwrap();
            let mut stale = p.clone();
            stale.packet = packet::encode_echo_request(IDENT, p.sequence.wrapping_sub(1), &[]).unwrap();
            vec![time_exceeded(router(1), &foreign, ms(1)), time_exceeded(router(2), &stale, ms(2))]
        },
        1,
        2,
    );

    assert!(result.hops[0].is_timeout);
}

#[test]
fn errors_for_other_destinations_are_ignored() {
    let result = trace(
        |p| {
            let mut elsewhere = p.clone();
            elsewhere.dest = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
            vec![time_exceeded(router(1), &elsewhere, ms(1))]
        },
        1,
        1,
    );

    assert!(result.hops[0].is_timeout);
}

#[test]
fn unreachable_from_the_destination_ends_the_trace() {
    let result = trace(
        |p| match p.ttl {
            Some(1) => vec![time_exceeded(router(1), p, ms(1))],
            _ => vec![icmp_error(packet::DESTINATION_UNREACHABLE, 3, DEST, p, 8, ms(2))],
        },
        10,
        1,
    );

    assert_eq!(result.hops.len(), 2);
    assert!(result.reached);
    assert_invariants(&result, 10);
}

#[test]
fn corrupt_replies_are_skipped() {
    let result = trace(|p| vec![corrupt(DEST, p, ms(1)), reply(p, ms(2))], 3, 1);

    assert_eq!(result.hops.len(), 1);
    assert_eq!(result.hops[0].rtts, vec![Some(2.0)]);
    assert!(result.reached);
}

#[test]
fn zero_hop_budget_probes_nothing() {
    let (transport, probe) = ScriptedTransport::new(path(0));

    let result = Tracer::new(transport, IpAddr::V4(DEST), config(0, 3)).run("h");

    assert!(result.hops.is_empty());
    assert!(!result.reached);
    assert!(probe.sent().is_empty());
}

#[test]
fn stream_yields_hops_as_they_complete() {
    let (transport, probe) = ScriptedTransport::new(path(1));
    let mut stream = TracerouteStream::new("example.com", Tracer::new(transport, IpAddr::V4(DEST), config(30, 2)));

    assert_eq!(
        stream.banner(),
        "traceroute to example.com (192.0.2.10), 30 hops max, 2 probes per hop"
    );

    let first = stream.next().unwrap();
    assert_eq!(first.to_string(), " 1  10.0.1.1  1.000 ms  1.000 ms");
    assert!(!stream.reached());
    assert!(!probe.released());

    let second = stream.next().unwrap();
    assert_eq!(second.to_string(), " 2  192.0.2.10  2.000 ms  2.000 ms");
    assert!(stream.reached());
    assert!(probe.released());

    assert!(stream.next().is_none());
}

#[test]
fn dropping_the_stream_stops_probing() {
    let (transport, probe) = ScriptedTransport::new(|_| vec![]);
    let mut stream = TracerouteStream::new("h", Tracer::new(transport, IpAddr::V4(DEST), config(30, 3)));

    stream.next();
    drop(stream);

    assert!(probe.released());
    assert_eq!(probe.sent().len(), 3);
}

#[test]
fn unbounded_timeout_does_not_overflow_the_deadline() {
    let (transport, _) = ScriptedTransport::new(path(1));
    let config = TraceConfig { timeout: Duration::MAX, ..config(5, 1) };

    let result = Tracer::new(transport, IpAddr::V4(DEST), config).run("h");

    assert!(result.reached);
    assert_eq!(result.hops.len(), 2);
}

#[test]
fn stream_for_unresolvable_host_is_a_resolution_error() {
    match netdiag::traceroute_stream("no-such-host.invalid", 5, ms(100), 1) {
        Err(NetError::Resolution { host, .. }) => assert_eq!(host, "no-such-host.invalid"),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("resolved a reserved name"),
    }
}

#[test]
fn unresolvable_host_fails_before_probing() {
    let result = netdiag::traceroute("no-such-host.invalid", 5, ms(100), 1);

    assert!(result.hops.is_empty());
    assert!(!result.reached);
    assert_eq!(result.destination, None);
    assert!(result.error.is_some());
}
