//! Leveled logging for the accelerator core.
//!
//! The crate is freestanding, so log output goes through a pluggable sink the
//! embedding kernel installs at init. Without a sink, messages are dropped.
//! The maximum level can be raised or lowered at runtime.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

/// A log sink: receives the level and the already-formatted message body.
pub type LogSink = fn(LogLevel, fmt::Arguments);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
static LOG_SINK: Mutex<Option<LogSink>> = Mutex::new(None);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::ERROR => 0,
            LogLevel::WARN => 1,
            LogLevel::INFO => 2,
            LogLevel::DEBUG => 3,
            LogLevel::TRACE => 4,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::ERROR,
            1 => LogLevel::WARN,
            2 => LogLevel::INFO,
            3 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

/// Install the output sink. Passing `None` silences the crate.
pub fn set_sink(sink: Option<LogSink>) {
    *LOG_SINK.lock() = sink;
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Filter and forward one message. Used by the `alog!` macro family.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if level.priority() > LOG_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    if let Some(sink) = *LOG_SINK.lock() {
        sink(level, args);
    }
}
