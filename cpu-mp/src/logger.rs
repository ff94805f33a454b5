// SPDX-License-Identifier: MPL-2.0

//! Logging support.
//!
//! The logger writes to a [`LogSink`] provided by the platform, usually a
//! serial port.
//!
//! This module guarantees _atomicity_ under concurrency: messages are always
//! printed in their entirety without being mixed with messages generated
//! concurrently on other processors. So do not print long log messages.

use alloc::{format, string::String};

use log::{LevelFilter, Metadata, Record};
use spin::{Mutex, Once};

use crate::{error::Errno, prelude::Result, return_errno_with_message};

/// The output of the logger.
pub trait LogSink: Send + Sync {
    /// Writes one formatted line.
    fn write_line(&self, line: &str);
}

struct Logger {
    sink: Once<&'static dyn LogSink>,
}

static LOGGER: Logger = Logger { sink: Once::new() };

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(sink) = self.sink.get() else {
            return;
        };

        let line = format_record(record);

        // Use a global lock to prevent interleaving of log messages.
        static RECORD_LOCK: Mutex<()> = Mutex::new(());
        let _lock = RECORD_LOCK.lock();

        sink.write_line(&line);
    }

    fn flush(&self) {}
}

fn format_record(record: &Record) -> String {
    let level = format!("{:<5}", record.level());
    let record_str = format!("{}", record.args());

    #[cfg(feature = "log_color")]
    let (level, record_str) = {
        use alloc::string::ToString;

        use owo_colors::OwoColorize;

        let level = match record.level() {
            log::Level::Error => level.red().to_string(),
            log::Level::Warn => level.bright_yellow().to_string(),
            log::Level::Info => level.blue().to_string(),
            log::Level::Debug => level.bright_green().to_string(),
            log::Level::Trace => level.bright_black().to_string(),
        };
        let record_str = record_str.default_color().to_string();
        (level, record_str)
    };

    format!("{}: {}", level, record_str)
}

/// Initializes the logger. Users should avoid using the log macros before
/// this function is called.
///
/// Fails with `Unsupported` if a logger is already installed.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) -> Result<()> {
    LOGGER.sink.call_once(|| sink);
    if log::set_logger(&LOGGER).is_err() {
        return_errno_with_message!(Errno::Unsupported, "a logger is already installed");
    }
    log::set_max_level(level);
    Ok(())
}
