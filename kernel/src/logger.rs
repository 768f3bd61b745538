//! Kernel logger
//!
//! Backs the `log` crate facade with the serial console. The runtime
//! threshold mirrors the original `loglevel=` command-line semantics:
//! 0 is the most verbose, larger values progressively quieter.

use core::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

/// Numeric command-line log levels, most verbose first.
///
/// `loglevel=0` shows everything including `trace!`; `loglevel=4` shows
/// errors only.
const LEVEL_MAP: [LevelFilter; 5] = [
    LevelFilter::Trace,
    LevelFilter::Debug,
    LevelFilter::Info,
    LevelFilter::Warn,
    LevelFilter::Error,
];

/// Default threshold before the command line is parsed.
const DEFAULT_LOGLEVEL: u8 = 2;

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(DEFAULT_LOGLEVEL);

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level_for(CURRENT_LEVEL.load(Ordering::Relaxed))
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let tag = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN ",
                Level::Info => "INFO ",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            crate::println!("[ {} ] {}", tag, record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

fn max_level_for(numeric: u8) -> Level {
    match LEVEL_MAP[(numeric as usize).min(LEVEL_MAP.len() - 1)].to_level() {
        Some(level) => level,
        None => Level::Error,
    }
}

/// Install the serial logger. Safe to call once during early boot.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Set the numeric severity threshold (the `loglevel=` key).
pub fn set_loglevel(level: u8) {
    CURRENT_LEVEL.store(level, Ordering::Relaxed);
}

/// Current numeric severity threshold.
pub fn loglevel() -> u8 {
    CURRENT_LEVEL.load(Ordering::Relaxed)
}
