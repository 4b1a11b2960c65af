//! Utilities for working with panic payloads.
//!
//! Worker tasks wrap handler invocations in a trap boundary; these helpers
//! turn the captured payload into a loggable message.

use std::any::Any;

/// Format a panic payload into a human-readable message.
///
/// The payload is downcast to `String` or `&'static str` if possible and
/// falls back to a placeholder otherwise.
#[must_use]
pub fn format_panic(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(s) => *s,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "<opaque panic payload>".to_string(),
        },
    }
}
