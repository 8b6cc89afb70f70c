// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Logging front-end used by every layer above this crate, plus the
//! [`fail!`] and [`fatal_panic!`] macros that combine error propagation
//! with a log message at the point an error is created, instead of only
//! at the point it is finally reported.

use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, Ordering};
use std::sync::Once;

mod fail;
mod level;

pub use level::LogLevel;

/// Implemented by a logging backend. The default backend writes to
/// stderr; a test harness can install its own to capture log output.
pub trait Log: Send + Sync {
    fn log(&self, log_level: LogLevel, origin: Arguments, message: Arguments);
}

struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn log(&self, log_level: LogLevel, origin: Arguments, message: Arguments) {
        let origin = origin.to_string();
        if origin.is_empty() {
            eprintln!("{log_level}: {message}");
        } else {
            eprintln!("{log_level} [{origin}]: {message}");
        }
    }
}

static CONSOLE_LOGGER: ConsoleLogger = ConsoleLogger;
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static INIT: Once = Once::new();
static mut LOGGER: Option<&'static dyn Log> = None;

/// Sets the process-wide log level. Messages below this level are
/// discarded without reaching the logger.
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> u8 {
    LOG_LEVEL.load(Ordering::Relaxed)
}

/// Installs a custom logger. Can only succeed once; subsequent calls
/// return `false` and leave the existing logger in place.
pub fn set_logger(logger: &'static dyn Log) -> bool {
    let mut success = false;
    INIT.call_once(|| {
        unsafe { LOGGER = Some(logger) };
        success = true;
    });
    success
}

fn logger() -> &'static dyn Log {
    INIT.call_once(|| unsafe {
        if LOGGER.is_none() {
            LOGGER = Some(&CONSOLE_LOGGER);
        }
    });
    unsafe { LOGGER.unwrap() }
}

#[doc(hidden)]
pub fn __internal_print_log_msg(log_level: LogLevel, origin: Arguments, message: Arguments) {
    if get_log_level() <= log_level as u8 {
        logger().log(log_level, origin, message)
    }
}

/// Logs a trace message: `trace!("msg")`, `trace!(from self, "msg {}", x)`,
/// `trace!(from "origin", "msg")`.
#[macro_export(local_inner_macros)]
macro_rules! trace {
    ($($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Trace, core::format_args!(""), core::format_args!($($e),*))
    };
    (from $o:expr, $($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Trace, core::format_args!("{:?}", $o), core::format_args!($($e),*))
    };
}

/// Logs a debug message. See [`trace!`] for call syntax.
#[macro_export(local_inner_macros)]
macro_rules! debug {
    ($($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Debug, core::format_args!(""), core::format_args!($($e),*))
    };
    (from $o:expr, $($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Debug, core::format_args!("{:?}", $o), core::format_args!($($e),*))
    };
}

/// Logs an info message. See [`trace!`] for call syntax.
#[macro_export(local_inner_macros)]
macro_rules! info {
    ($($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Info, core::format_args!(""), core::format_args!($($e),*))
    };
    (from $o:expr, $($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Info, core::format_args!("{:?}", $o), core::format_args!($($e),*))
    };
}

/// Logs a warn message. See [`trace!`] for call syntax.
#[macro_export(local_inner_macros)]
macro_rules! warn {
    ($($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Warn, core::format_args!(""), core::format_args!($($e),*))
    };
    (from $o:expr, $($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Warn, core::format_args!("{:?}", $o), core::format_args!($($e),*))
    };
}

/// Logs an error message. See [`trace!`] for call syntax.
#[macro_export(local_inner_macros)]
macro_rules! error {
    ($($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Error, core::format_args!(""), core::format_args!($($e),*))
    };
    (from $o:expr, $($e:expr),*) => {
        $crate::log::__internal_print_log_msg($crate::log::LogLevel::Error, core::format_args!("{:?}", $o), core::format_args!($($e),*))
    };
}

/// Logs at [`LogLevel::Fatal`] and then panics.
///
/// ```ignore
/// fatal_panic!(from self, "value is {}", value);
/// fatal_panic!(from self, when self.might_fail(), "operation failed");
/// ```
#[macro_export(local_inner_macros)]
macro_rules! fatal_panic {
    ($($e:expr),*) => {
        {
            $crate::log::__internal_print_log_msg($crate::log::LogLevel::Fatal, core::format_args!(""), core::format_args!($($e),*));
            core::panic!($($e),*);
        }
    };
    (from $o:expr, $($e:expr),*) => {
        {
            $crate::log::__internal_print_log_msg($crate::log::LogLevel::Fatal, core::format_args!("{:?}", $o), core::format_args!($($e),*));
            core::panic!("From: {:?} ::: {}", $o, core::format_args!($($e),*));
        }
    };
    (from $o:expr, when $call:expr, $($e:expr),*) => {
        {
            let result = $call;
            if result.is_err() {
                $crate::log::__internal_print_log_msg($crate::log::LogLevel::Fatal, core::format_args!("{:?}", $o), core::format_args!($($e),*));
                core::panic!("From: {:?} ::: {}", $o, core::format_args!($($e),*));
            }
            result.ok().unwrap()
        }
    };
}

pub use crate::{debug, error, fail, fatal_panic, info, trace, warn};
