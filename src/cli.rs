//! Pieces shared by the `netping` and `nettraceroute` binaries.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `NETDIAG_LOG=debug`.
pub const LOG_ENV: &str = "NETDIAG_LOG";

/// Send diagnostics to stderr so stdout carries only the report.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A duration given as plain seconds (`5`, `0.5`) or in humantime form
/// (`400ms`, `2s`, `1m`).
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if let Ok(secs) = value.parse::<f64>() {
        // 2^64 seconds and up do not fit in a Duration
        return if secs.is_finite() && secs >= 0.0 && secs < u64::MAX as f64 {
            Ok(Duration::from_secs_f64(secs))
        } else {
            Err(format!("invalid duration {:?}", value))
        };
    }
    humantime::parse_duration(value)
        .map_err(|e| format!("invalid duration {:?} (ex: 5, 1s, 400ms): {}", value, e))
}

pub fn validate_duration(value: String) -> Result<(), String> {
    parse_duration(&value).map(|_| ())
}

pub fn validate_number<T>(value: String) -> Result<(), String>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map(|_| ())
        .map_err(|e| format!("invalid number {:?}: {}", value, e))
}

/// Cleared when the user hits Ctrl-C.
pub fn interrupt_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    Ok(running)
}
