// Copyright (c) 2025 Contributors to this project
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A small assertion macro used throughout this workspace's test modules in
//! place of bare `assert_eq!`/`assert!`, so failures read as a sentence
//! instead of a diff.

/// ```ignore
/// assert_that!(value, eq 42);
/// assert_that!(value, ne 42);
/// assert_that!(value, lt 42);
/// assert_that!(value, le 42);
/// assert_that!(value, gt 42);
/// assert_that!(value, ge 42);
/// assert_that!(result, is_ok);
/// assert_that!(result, is_err);
/// assert_that!(option, is_some);
/// assert_that!(option, is_none);
/// assert_that!(condition, is_true);
/// assert_that!(condition, is_false);
/// ```
#[macro_export]
macro_rules! assert_that {
    ($value:expr, eq $expected:expr) => {
        match (&$value, &$expected) {
            (value, expected) => assert!(
                value == expected,
                "assert_that failed: expected {:?} to equal {:?}",
                value,
                expected
            ),
        }
    };
    ($value:expr, ne $expected:expr) => {
        match (&$value, &$expected) {
            (value, expected) => assert!(
                value != expected,
                "assert_that failed: expected {:?} to not equal {:?}",
                value,
                expected
            ),
        }
    };
    ($value:expr, lt $expected:expr) => {
        assert!(
            $value < $expected,
            "assert_that failed: expected {:?} to be less than {:?}",
            $value,
            $expected
        );
    };
    ($value:expr, le $expected:expr) => {
        assert!(
            $value <= $expected,
            "assert_that failed: expected {:?} to be less than or equal to {:?}",
            $value,
            $expected
        );
    };
    ($value:expr, gt $expected:expr) => {
        assert!(
            $value > $expected,
            "assert_that failed: expected {:?} to be greater than {:?}",
            $value,
            $expected
        );
    };
    ($value:expr, ge $expected:expr) => {
        assert!(
            $value >= $expected,
            "assert_that failed: expected {:?} to be greater than or equal to {:?}",
            $value,
            $expected
        );
    };
    ($value:expr, is_ok) => {
        assert!($value.is_ok(), "assert_that failed: expected Ok, got Err");
    };
    ($value:expr, is_err) => {
        assert!($value.is_err(), "assert_that failed: expected Err, got Ok");
    };
    ($value:expr, is_some) => {
        assert!($value.is_some(), "assert_that failed: expected Some, got None");
    };
    ($value:expr, is_none) => {
        assert!($value.is_none(), "assert_that failed: expected None, got Some");
    };
    ($value:expr, is_true) => {
        assert!($value, "assert_that failed: expected true");
    };
    ($value:expr, is_false) => {
        assert!(!$value, "assert_that failed: expected false");
    };
}

pub use assert_that;
