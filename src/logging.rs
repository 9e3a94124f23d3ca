//! Kernel logging facility
//!
//! Provides thread-safe logging functionality for the kernel using the `log`
//! crate. Output goes through a pluggable [`ConsoleSink`] because the serial
//! and terminal drivers live outside this crate.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Where formatted log lines end up. The serial console driver installs an
/// implementation at boot; until then records are dropped.
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, line: core::fmt::Arguments);
}

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    sink: Mutex<Option<&'static dyn ConsoleSink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: &'static dyn ConsoleSink) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let sink = self.sink.lock();
            if let Some(sink) = *sink {
                sink.write_line(format_args!("[{}] {}", record.level(), record.args()));
            }
        }
    }

    fn flush(&self) {}
}

/// Initializes the logging system
///
/// Sets different log levels for debug/release builds:
/// - Debug builds: LevelFilter::Debug
/// - Release builds: LevelFilter::Info
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        );
    }
}
