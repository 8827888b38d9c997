//! ICMP (RFC 792) message encoding and decoding, plus just enough IPv4 to find
//! the ICMP message inside what a raw socket hands back.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::util;

pub const ECHO_REPLY: u8 = 0;
pub const DESTINATION_UNREACHABLE: u8 = 3;
pub const ECHO_REQUEST: u8 = 8;
pub const TIME_EXCEEDED: u8 = 11;

pub const ICMP_HEADER_LEN: usize = 8;
pub const IPV4_HEADER_LEN: usize = 20;
const IPPROTO_ICMP: u8 = 1;

/// Largest echo payload that still fits a single IPv4 datagram.
pub const MAX_PAYLOAD: usize = 65_535 - IPV4_HEADER_LEN - ICMP_HEADER_LEN;

/// The fixed 8 byte ICMP header. For error messages the last four bytes are
/// unused and the identifier/sequence fields carry no meaning.
#[derive(Serialize, Deserialize, Debug)]
pub struct IcmpHeader {
    pub message_type: u8,
    pub message_code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence_num: u16,
}

#[derive(Serialize, Deserialize)]
pub struct IPv4Header {
    pub version_and_header_len: u8,
    pub type_of_service: u8,
    pub datagram_length: u16,
    pub ip_identifier: u16,
    pub flags_and_5frag_offset: u8, // flags are u3
    pub rest_of_frag_offset: u8,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source_ip: u32,
    pub destination_ip: u32,
}

// ICMP and IP headers are big endian with fixed width fields
fn coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// What a Time-Exceeded or Destination-Unreachable message quotes of the
/// datagram that triggered it: the IP header plus the first 8 bytes of its
/// payload. Fields are `None` when the router quoted too little to recover
/// them, or when the quoted datagram was not an ICMP echo request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OriginalDatagram {
    pub destination: Option<Ipv4Addr>,
    pub identifier: Option<u16>,
    pub sequence: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoRequest(Echo),
    EchoReply(Echo),
    TimeExceeded { code: u8, original: OriginalDatagram },
    DestinationUnreachable { code: u8, original: OriginalDatagram },
}

/// An IPv4 datagram as delivered by a raw IPv4 socket.
#[derive(Debug)]
pub struct Ipv4Datagram<'a> {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub ttl: u8,
    pub protocol: u8,
    pub payload: &'a [u8],
}

/// Build an echo request, checksum computed last over the assembled buffer.
pub fn encode_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    encode_echo(ECHO_REQUEST, identifier, sequence, payload)
}

/// Build an echo message of the given type (request or reply).
pub fn encode_echo(message_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Result<Vec<u8>, EncodeError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge { size: payload.len(), max: MAX_PAYLOAD });
    }

    let header = IcmpHeader {
        message_type,
        message_code: 0,
        checksum: 0,
        identifier,
        sequence_num: sequence,
    };

    let mut packet = coder().serialize(&header)?;
    packet.extend_from_slice(payload);
    util::set_checksum(&mut packet, 1);
    Ok(packet)
}

/// Echo payload of `size` bytes: the send time in microseconds since the
/// epoch (when there is room for it) followed by an incrementing byte pattern.
pub fn timestamped_payload(size: usize, sent: SystemTime) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
    if size >= 8 {
        let micros = sent.duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0);
        payload[..8].copy_from_slice(&micros.to_be_bytes());
    }
    payload
}

/// Decode an ICMP message, validating its checksum.
pub fn decode(bytes: &[u8]) -> Result<IcmpMessage, DecodeError> {
    if bytes.len() < ICMP_HEADER_LEN {
        return Err(DecodeError::Malformed(format!(
            "{} bytes is shorter than an ICMP header",
            bytes.len()
        )));
    }

    let header: IcmpHeader = coder()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let expected = util::get_checksum(bytes, 1);
    if header.checksum != expected {
        return Err(DecodeError::Malformed(format!(
            "checksum {:#06x} does not match computed {:#06x}",
            header.checksum, expected
        )));
    }

    let body = &bytes[ICMP_HEADER_LEN..];
    let echo = || Echo {
        identifier: header.identifier,
        sequence: header.sequence_num,
        payload: body.to_vec(),
    };

    match header.message_type {
        ECHO_REPLY => Ok(IcmpMessage::EchoReply(echo())),
        ECHO_REQUEST => Ok(IcmpMessage::EchoRequest(echo())),
        TIME_EXCEEDED => Ok(IcmpMessage::TimeExceeded {
            code: header.message_code,
            original: parse_original(body),
        }),
        DESTINATION_UNREACHABLE => Ok(IcmpMessage::DestinationUnreachable {
            code: header.message_code,
            original: parse_original(body),
        }),
        other => Err(DecodeError::UnsupportedType(other)),
    }
}

/// Recover what we can of the quoted datagram. Routers are only required to
/// quote the IP header and 8 bytes, and some quote less.
fn parse_original(body: &[u8]) -> OriginalDatagram {
    let datagram = match parse_ipv4(body) {
        Ok(d) => d,
        Err(_) => return OriginalDatagram::default(),
    };

    let mut original = OriginalDatagram {
        destination: Some(datagram.destination),
        ..OriginalDatagram::default()
    };

    let quoted = datagram.payload;
    if datagram.protocol != IPPROTO_ICMP || quoted.first() != Some(&ECHO_REQUEST) {
        return original;
    }
    if quoted.len() >= 6 {
        original.identifier = Some(u16::from_be_bytes([quoted[4], quoted[5]]));
    }
    if quoted.len() >= 8 {
        original.sequence = Some(u16::from_be_bytes([quoted[6], quoted[7]]));
    }
    original
}

/// Split an IPv4 datagram into header fields and payload.
///
/// The payload ends at the header's total length when that is consistent,
/// otherwise at the end of the buffer (quoted datagrams are truncated).
pub fn parse_ipv4(bytes: &[u8]) -> Result<Ipv4Datagram<'_>, DecodeError> {
    if bytes.len() < IPV4_HEADER_LEN {
        return Err(DecodeError::Malformed(format!(
            "{} bytes is shorter than an IPv4 header",
            bytes.len()
        )));
    }

    let header: IPv4Header = coder()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if header.version_and_header_len >> 4 != 4 {
        return Err(DecodeError::Malformed(format!(
            "IP version {} is not 4",
            header.version_and_header_len >> 4
        )));
    }

    // Get the 'header length' portion of the u8, which is encoded as u8/4 (bits/32)
    let data_offset = 4 * (header.version_and_header_len & 0x0F) as usize;
    if data_offset < IPV4_HEADER_LEN || data_offset > bytes.len() {
        return Err(DecodeError::Malformed(format!("bad IPv4 header length {}", data_offset)));
    }

    let total = header.datagram_length as usize;
    let end = if total >= data_offset && total <= bytes.len() { total } else { bytes.len() };

    Ok(Ipv4Datagram {
        source: Ipv4Addr::from(header.source_ip),
        destination: Ipv4Addr::from(header.destination_ip),
        ttl: header.ttl,
        protocol: header.protocol,
        payload: &bytes[data_offset..end],
    })
}
