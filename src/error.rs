use std::io;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

/// Failures that abort a whole ping or traceroute invocation.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("cannot resolve host {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied opening raw ICMP socket, run with root/administrator privileges")]
    Permission(#[source] io::Error),

    #[error("failed to open raw socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to send probe: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive: {0}")]
    Receive(#[source] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl NetError {
    /// Classify a socket creation failure.
    pub fn from_open(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => NetError::Permission(err),
            _ => NetError::Socket(err),
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, NetError::Permission(_))
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("failed to serialize ICMP header: {0}")]
    Serialize(#[from] bincode::Error),
}

/// Why a received datagram could not be used.
///
/// Neither variant is fatal: the engines log and skip the datagram and keep
/// waiting for the probe's own deadline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("unsupported ICMP type {0}")]
    UnsupportedType(u8),
}
