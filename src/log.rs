//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime logs through the `log` facade. [StderrLogger](struct.StderrLogger.html)
//! is a minimal backend for binaries that do not bring their own: one line per
//! record on stderr, prefixed with the realtime clock and the record level.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//! use fibrio::log::StderrLogger;
//!
//! log::set_logger(&StderrLogger).unwrap();
//! log::set_max_level(LevelFilter::Debug);
//! info!("runtime up");
//! ```

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use num_traits::FromPrimitive;

use crate::clock;

/// Severity scale of the stderr backend. Numeric values follow syslog order so
/// a level can be selected numerically via `FIBRIO_LOG`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, ToPrimitive, FromPrimitive)]
pub enum SeverityLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl From<Level> for SeverityLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => SeverityLevel::Error,
            Level::Warn => SeverityLevel::Warn,
            Level::Info => SeverityLevel::Info,
            Level::Debug => SeverityLevel::Debug,
            Level::Trace => SeverityLevel::Trace,
        }
    }
}

impl SeverityLevel {
    fn to_filter(self) -> LevelFilter {
        match self {
            SeverityLevel::Error => LevelFilter::Error,
            SeverityLevel::Warn => LevelFilter::Warn,
            SeverityLevel::Info => LevelFilter::Info,
            SeverityLevel::Debug => LevelFilter::Debug,
            SeverityLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing to stderr.
pub struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "[{}] {:5} {}:{} {}",
            clock::realtime_ms(),
            record.level(),
            record.file().unwrap_or_default(),
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install [StderrLogger](struct.StderrLogger.html) as the global logger.
///
/// The maximum level is taken from the `FIBRIO_LOG` environment variable,
/// either by name (`error` .. `trace`) or by syslog number; unset means `Info`.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&StderrLogger)?;
    log::set_max_level(level_from_env().to_filter());
    Ok(())
}

fn level_from_env() -> SeverityLevel {
    let raw = match std::env::var("FIBRIO_LOG") {
        Ok(v) => v,
        Err(_) => return SeverityLevel::Info,
    };
    if let Ok(n) = raw.parse::<u32>() {
        if let Some(level) = SeverityLevel::from_u32(n) {
            return level;
        }
    }
    match raw.to_ascii_lowercase().as_str() {
        "error" => SeverityLevel::Error,
        "warn" => SeverityLevel::Warn,
        "info" => SeverityLevel::Info,
        "debug" => SeverityLevel::Debug,
        "trace" => SeverityLevel::Trace,
        _ => SeverityLevel::Info,
    }
}
