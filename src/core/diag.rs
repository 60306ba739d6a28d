//! Purpose: Drain the engine's process-wide error buffer into structured errors.
//! Exports: `drain_error`, `clear_error`.
//! Role: Called only after a detected failure; success paths never read the buffer.
//! Invariants: One drain is one engine call that copies and clears together.
use std::ffi::CStr;

use super::error::{Error, ErrorKind};
use super::sys;

/// Copy and clear the engine's error buffer. Empty when nothing failed since the last drain.
pub fn drain_error() -> String {
    let raw = sys::vx_error_buffer_copy();
    if raw.is_null() {
        return String::new();
    }
    let text = unsafe { CStr::from_ptr(raw) }
        .to_string_lossy()
        .into_owned();
    unsafe { sys::vx_free_string(raw) };
    text
}

pub fn clear_error() {
    sys::vx_error_clear();
}

/// Error of `kind` carrying whatever the engine reported.
pub(crate) fn failure(kind: ErrorKind, fallback: &str) -> Error {
    let drained = drain_error();
    let message = drained.trim_end();
    let message = if message.is_empty() { fallback } else { message };
    Error::new(kind).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn failure_prefers_engine_text() {
        clear_error();
        let err = failure(ErrorKind::OperationFailed, "unknown failure");
        assert_eq!(err.message(), Some("unknown failure"));

        let missing = unsafe { sys::vx_operation_new(c"nonesuch".as_ptr()) };
        assert!(missing.is_null());
        let err = failure(ErrorKind::UnknownOperation, "unknown failure");
        assert_eq!(
            err.message(),
            Some("VipsOperation: class \"nonesuch\" not found")
        );
        assert!(drain_error().is_empty());
    }

    #[test]
    #[serial]
    fn drain_returns_text_once() {
        clear_error();
        let missing = unsafe { sys::vx_operation_new(c"nonesuch".as_ptr()) };
        assert!(missing.is_null());
        let first = drain_error();
        let second = drain_error();
        assert!(first.contains("class \"nonesuch\" not found"));
        assert!(second.is_empty());
    }
}
