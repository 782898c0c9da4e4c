//! Kernel logging subsystem.
//!
//! Output goes through a pluggable [`Sink`] registered once at boot, so the
//! core crates stay independent of any particular console driver.  Logging
//! before [`init`] is a no-op.  Formatting is allocation-free: messages are
//! streamed to the sink through `core::fmt`.
#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Once;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }
}

/// Destination for log output.
///
/// Implementations must tolerate being called from any core and from
/// interrupt context; a serial writer behind a spinlock is the usual choice.
pub trait Sink: Send + Sync {
    fn write_str(&self, s: &str);
}

static SINK: Once<&'static dyn Sink> = Once::new();

/// Minimum level that gets emitted (as a `Level` discriminant).
static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Register the output sink.  Later calls are ignored.
pub fn init(sink: &'static dyn Sink) {
    SINK.call_once(|| sink);
}

/// Set the minimum level that gets emitted.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Adapter streaming `core::fmt` output into a sink.
struct SinkWriter<'a>(&'a dyn Sink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Log a message with a specific level
pub fn log(level: Level, args: fmt::Arguments) {
    if (level as u8) < MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let Some(sink) = SINK.get() else { return };
    sink.write_str(level.color());
    sink.write_str("[");
    sink.write_str(level.as_str());
    sink.write_str("]\x1b[0m ");
    let _ = fmt::write(&mut SinkWriter(*sink), args);
    sink.write_str("\n");
}

/// Print to the sink without level prefix or newline
pub fn print(args: fmt::Arguments) {
    if let Some(sink) = SINK.get() {
        let _ = fmt::write(&mut SinkWriter(*sink), args);
    }
}

/// Log at TRACE level
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Trace, format_args!($($arg)*))
    };
}

/// Log at DEBUG level
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, format_args!($($arg)*))
    };
}

/// Log at INFO level
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, format_args!($($arg)*))
    };
}

/// Log at WARN level
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warn, format_args!($($arg)*))
    };
}

/// Log at ERROR level
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, format_args!($($arg)*))
    };
}

// ── `log` facade bridge ───────────────────────────────────────────

/// Forwards records from the `log` facade into the klog sink, so
/// dependencies written against `log` share the kernel console.
struct Facade;

static FACADE: Facade = Facade;

impl log::Log for Facade {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        SINK.get().is_some()
    }

    fn log(&self, record: &log::Record) {
        let level = match record.level() {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        };
        crate::log(level, *record.args());
    }

    fn flush(&self) {}
}

/// Install the bridge as the global `log` logger.
pub fn init_log_facade() {
    let _ = log::set_logger(&FACADE);
    log::set_max_level(log::LevelFilter::Trace);
}
