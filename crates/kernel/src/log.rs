//! Leveled logging over the kernel console.
//!
//! Every line carries a colored level prefix. The floor is a build-time
//! constant; the kernel has no runtime log configuration.

use core::fmt;

/// Lowest level that reaches the console.
const LEVEL_FLOOR: LogLevel = LogLevel::Debug;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*));
    };
}

#[expect(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*);
    };
}

#[expect(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*);
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*);
    };
}

#[expect(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*);
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*);
    };
}

pub fn log(level: LogLevel, message: fmt::Arguments) {
    if level >= LEVEL_FLOOR {
        println!("{} {}", LevelFormat(level), message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

struct LevelFormat(LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (color, label) = match self.0 {
            LogLevel::Trace => (35, "TRACE"),
            LogLevel::Debug => (34, "DEBUG"),
            LogLevel::Info => (32, " INFO"),
            LogLevel::Warn => (33, " WARN"),
            LogLevel::Error => (31, "ERROR"),
        };
        write!(f, "\x1B[{color};1m{label}\x1B[0m")
    }
}
