//! Ping and traceroute built on ICMP echo over raw sockets.
//!
//! Opening a raw socket needs elevated privileges. Without them every entry
//! point fails with [`NetError::Permission`] (or carries its message in the
//! result's `error` field) instead of reporting the host as unreachable.

pub mod cli;
pub mod error;
pub mod packet;
pub mod ping;
pub mod traceroute;
pub mod transport;
pub mod util;

pub use error::{DecodeError, EncodeError, NetError, NetResult};
pub use ping::{
    is_host_reachable, ping, ping_multiple, ping_stream, PingConfig, PingEvent, PingResult, PingStream, Pinger,
};
pub use traceroute::{
    traceroute, traceroute_stream, HopResult, Responder, TraceConfig, Tracer, TracerouteResult, TracerouteStream,
};
pub use transport::{Datagram, RawSocket, Receive, Transport};
