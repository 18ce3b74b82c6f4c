//! Core Macros
//!
//! This module defines utility macros used throughout the crate.

/// `map_err` macro.
///
/// Converts the error of a result into its string representation, for outcomes that are
/// stored or sent across tasks rather than propagated.
#[macro_export]
macro_rules! map_err {
    ($result:expr) => {
        $result.map_err(|e| e.to_string())
    };
}
