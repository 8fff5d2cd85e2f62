//! Logging initialization using `tracing` and `tracing-subscriber`.

use std::str::FromStr;

use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::{Error, Result};

/// Logger threshold, settable via the `debuglevel=NAME` mount option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const ALL_NAMES: &'static str = "error, warn, info, debug, trace";

    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(Error::Cli(format!(
                "no such log level: {other} (expected one of {})",
                LogLevel::ALL_NAMES
            ))
            .into()),
        }
    }
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// `level` is the explicit `debuglevel` option if given; otherwise the
/// threshold defaults to `info` in foreground mode and `warn` once
/// daemonized. Safe to call multiple times; subsequent calls no-op.
pub fn init_logging(level: Option<LogLevel>, foreground: bool) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = match level {
        Some(lvl) => EnvFilter::new(lvl.as_filter()),
        None => {
            let fallback = if foreground { "info" } else { "warn" };
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
        }
    };

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
        .try_init();

    Ok(())
}
