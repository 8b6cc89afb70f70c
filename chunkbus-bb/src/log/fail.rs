// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Combines error handling with logging: a debug message is emitted at the
//! point an error is raised, before it is converted into a `Result::Err`
//! and propagated. This means a failure is logged once, close to its
//! cause, rather than only where it is eventually handled or ignored.

/// ```ignore
/// fail!(with MyError::SomeVariant, "could not do the thing");
/// fail!(from self, with MyError::SomeVariant, "could not do the thing");
/// fail!(from self, when self.do_thing(), with MyError::SomeVariant, "wrapped failure");
/// fail!(from self, when self.do_thing(), "propagate via From");
/// ```
#[macro_export(local_inner_macros)]
macro_rules! fail {
    (with $error_value:expr, $($message:expr),*) => {
        {
            debug!($($message),*);
            return Err($error_value);
        }
    };
    (from $origin:expr, with $error_value:expr, $($message:expr),*) => {
        {
            debug!(from $origin, $($message),*);
            return Err($error_value);
        }
    };
    (from $origin:expr, when $call:expr, with $error_value:expr, $($message:expr),*) => {
        {
            let result = $call;
            match result.is_err() {
                true => {
                    debug!(from $origin, $($message),*);
                    return Err($error_value);
                }
                false => result.ok().unwrap(),
            }
        }
    };
    (from $origin:expr, when $call:expr, $($message:expr),*) => {
        {
            let result = $call;
            match result.is_err() {
                true => {
                    debug!(from $origin, $($message),*);
                    result?
                }
                false => result.ok().unwrap(),
            }
        }
    };
    (when $call:expr, $($message:expr),*) => {
        {
            let result = $call;
            match result.is_err() {
                true => {
                    debug!($($message),*);
                    result?
                }
                false => result.ok().unwrap(),
            }
        }
    };
}
