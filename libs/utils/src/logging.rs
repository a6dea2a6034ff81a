//! Tracing setup for the storage object binaries and tests.

use std::str::FromStr;

use anyhow::Context;
use strum::VariantNames;
use strum_macros::{Display, EnumString};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(EnumString, Display, strum_macros::VariantNames, Eq, PartialEq, Debug, Clone, Copy)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    Plain,
    Json,
    /// Plain text through the libtest output capture.
    Test,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        LogFormat::from_str(s)
            .with_context(|| format!("unknown log format {s:?}, expected one of {:?}", LogFormat::VARIANTS))
    }
}

/// `RUST_LOG`, or `info` when unset.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber writing to stdout, with a `tracing_error`
/// layer so errors can capture span traces. Fails if a subscriber is already
/// installed.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false);
    let fmt = match format {
        LogFormat::Plain => fmt.boxed(),
        LogFormat::Json => fmt.json().boxed(),
        LogFormat::Test => fmt.with_test_writer().boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt.with_filter(env_filter()))
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .context("install global tracing subscriber")
}

/// Safe to call from every test; only the first call installs anything.
pub fn init_for_tests() {
    let _ = init(LogFormat::Test);
}

/// Report panics through tracing until the guard is dropped.
#[must_use]
pub fn replace_panic_hook_with_tracing_panic_hook() -> TracingPanicHookGuard {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("panic with a non-string payload");
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        match info.location() {
            Some(at) => tracing::error!(%thread, location = %at, "panic: {msg}"),
            None => tracing::error!(%thread, "panic: {msg}"),
        }
    }));
    TracingPanicHookGuard(())
}

/// Restores the default panic hook on drop.
pub struct TracingPanicHookGuard(());

impl Drop for TracingPanicHookGuard {
    fn drop(&mut self) {
        let _ = std::panic::take_hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        for format in [LogFormat::Plain, LogFormat::Json, LogFormat::Test] {
            assert_eq!(LogFormat::from_config(&format.to_string()).unwrap(), format);
        }
        let err = LogFormat::from_config("yaml").unwrap_err();
        assert!(format!("{err:#}").contains("plain"));
    }
}
