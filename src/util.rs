use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use dns_lookup::lookup_addr;

use crate::error::{NetError, NetResult};

/// Resolve a hostname or address literal to the first IPv4 address it maps to.
pub fn resolve_dest(dest: &str) -> NetResult<IpAddr> {
    let resolution = |source| NetError::Resolution {
        host: dest.to_string(),
        source,
    };

    let mut addrs = (dest, 0).to_socket_addrs().map_err(resolution)?;
    match addrs.find(|addr| addr.is_ipv4()) {
        Some(addr) => Ok(addr.ip()),
        None => Err(resolution(Error::new(
            ErrorKind::AddrNotAvailable,
            "no IPv4 address",
        ))),
    }
}

/// Best-effort reverse lookup. `None` when the address has no name.
pub fn reverse_lookup(addr: IpAddr) -> Option<String> {
    // getnameinfo hands back the numeric form when there is no PTR record
    lookup_addr(&addr)
        .ok()
        .filter(|name| *name != addr.to_string())
}

/// `name (addr)` when a name is known, the bare address otherwise.
pub fn host_label(addr: IpAddr, hostname: Option<&str>) -> String {
    match hostname {
        Some(name) => format!("{} ({})", name, addr),
        None => addr.to_string(),
    }
}

/// Reverse lookups for one invocation, each responder looked up at most once.
#[derive(Debug, Default)]
pub struct HostnameCache {
    enabled: bool,
    names: HashMap<IpAddr, Option<String>>,
}

impl HostnameCache {
    pub fn new(enabled: bool) -> Self {
        HostnameCache {
            enabled,
            names: HashMap::new(),
        }
    }

    pub fn lookup(&mut self, addr: IpAddr) -> Option<String> {
        if !self.enabled {
            return None;
        }
        self.names
            .entry(addr)
            .or_insert_with(|| reverse_lookup(addr))
            .clone()
    }
}

static SESSIONS: AtomicU16 = AtomicU16::new(0);

/// Identifier for a new diagnostic session.
///
/// Derived from the process id so replies to other processes are ignored, and
/// offset per session so concurrent sessions within this process do not
/// claim each other's replies.
pub fn default_identifier() -> u16 {
    let pid = std::process::id() as u16;
    pid.wrapping_add(SESSIONS.fetch_add(1, Ordering::Relaxed))
}

/// Longest wait the engines will schedule, whatever timeout they are given.
pub const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `start + wait`, capped at [`MAX_WAIT`] when the sum does not fit in an
/// `Instant`.
pub fn deadline(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .or_else(|| start.checked_add(MAX_WAIT))
        .unwrap_or(start)
}

/// Internet checksum over `data` with nothing skipped.
pub fn checksum(data: &[u8]) -> u16 {
    get_checksum(data, usize::MAX)
}

/// Compute the checksum and store it big endian at word offset `location`.
#[allow(clippy::double_parens)] // For stylistic reasons
pub fn set_checksum(data: &mut [u8], location: usize) {
    let sum = get_checksum(data, location);
    data[location*2    ] = ((sum & 0xFF00) >> 8) as u8;
    data[location*2 + 1] = ((sum & 0x00FF)     ) as u8;
}

/// Checksum of `data` as if the word at offset `location` were zero.
pub fn get_checksum(data: &[u8], location: usize) -> u16 {
    let mut sum = sum_be_words(data, location);
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// Sum all words (16 bit chunks) in the given data. The word at word offset
/// `skipword` will be skipped. Each word is treated as big endian, and an odd
/// trailing byte is padded with a zero low byte.
fn sum_be_words(data: &[u8], skipword: usize) -> u32 {
    data.chunks(2)
        .map(|word| match *word {
            [w] => u16::from_be_bytes([w, 0]),
            [wh, wl] => u16::from_be_bytes([wh, wl]),
            _ => unreachable!(),
        })
        .enumerate()
        .filter_map(|(i, w)| if i == skipword { None } else { Some(w as u32) })
        .fold(0, u32::wrapping_add)
}
