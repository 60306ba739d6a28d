//! Purpose: Process-wide error buffer and log routing for the engine.
//! Exports: `vx_error_buffer_copy`, `vx_error_clear`, `vx_log_set_handler`, helpers.
//! Role: Only channel through which engine failures and log records leave the engine.
//! Invariants: `vx_error_buffer_copy` copies and clears under one lock.
//! Invariants: Log handler swaps wait for in-flight log deliveries.
use std::ffi::{CString, c_char, c_void};
use std::fmt::Display;
use std::ptr;
use std::sync::{Mutex, PoisonError, RwLock};

use super::abi::{
    VX_LOG_LEVEL_CRITICAL, VX_LOG_LEVEL_DEBUG, VX_LOG_LEVEL_ERROR, VX_LOG_LEVEL_INFO,
    VX_LOG_LEVEL_MESSAGE, VX_LOG_LEVEL_WARNING, VxBuf, VxLogFn,
};

const LOG_DOMAIN: &std::ffi::CStr = c"VIPS";

static ERROR_BUFFER: Mutex<String> = Mutex::new(String::new());
static LOG_HANDLER: RwLock<Option<LogHandler>> = RwLock::new(None);

struct LogHandler {
    func: VxLogFn,
    user: *mut c_void,
}

// The handler's user pointer is owned by whoever installed it and must be thread safe.
unsafe impl Send for LogHandler {}
unsafe impl Sync for LogHandler {}

/// Append one `domain: message` line to the error buffer.
pub(crate) fn error(domain: &str, message: impl Display) {
    let mut buffer = ERROR_BUFFER.lock().unwrap_or_else(PoisonError::into_inner);
    buffer.push_str(domain);
    buffer.push_str(": ");
    buffer.push_str(&message.to_string());
    buffer.push('\n');
}

pub(crate) fn critical(message: impl Display) {
    log(VX_LOG_LEVEL_CRITICAL, message);
}

pub(crate) fn warning(message: impl Display) {
    log(VX_LOG_LEVEL_WARNING, message);
}

pub(crate) fn info(message: impl Display) {
    log(VX_LOG_LEVEL_INFO, message);
}

pub(crate) fn debug(message: impl Display) {
    log(VX_LOG_LEVEL_DEBUG, message);
}

pub(crate) fn log(level: u32, message: impl Display) {
    let text = message.to_string();
    let handler = LOG_HANDLER.read().unwrap_or_else(PoisonError::into_inner);
    match handler.as_ref() {
        Some(handler) => {
            let Ok(text) = CString::new(text.replace('\0', " ")) else {
                return;
            };
            unsafe { (handler.func)(LOG_DOMAIN.as_ptr(), level, text.as_ptr(), handler.user) };
        }
        None => default_log(level, &text),
    }
}

fn default_log(level: u32, text: &str) {
    match level {
        VX_LOG_LEVEL_ERROR | VX_LOG_LEVEL_CRITICAL => {
            tracing::error!(target: "vips::engine", "{text}")
        }
        VX_LOG_LEVEL_WARNING => tracing::warn!(target: "vips::engine", "{text}"),
        VX_LOG_LEVEL_MESSAGE | VX_LOG_LEVEL_INFO => {
            tracing::info!(target: "vips::engine", "{text}")
        }
        _ => tracing::debug!(target: "vips::engine", "{text}"),
    }
}

/// Copy the error buffer into a fresh string and clear it.
///
/// Never returns null; an empty buffer yields an empty string.
pub extern "C" fn vx_error_buffer_copy() -> *mut c_char {
    let text = {
        let mut buffer = ERROR_BUFFER.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    };
    match CString::new(text.replace('\0', " ")) {
        Ok(text) => text.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

pub extern "C" fn vx_error_clear() {
    ERROR_BUFFER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// # Safety
/// `text` must be null or a string returned by this engine.
pub unsafe extern "C" fn vx_free_string(text: *mut c_char) {
    if text.is_null() {
        return;
    }
    drop(unsafe { CString::from_raw(text) });
}

/// # Safety
/// `buf` must be null-data or a buffer returned by this engine.
pub unsafe extern "C" fn vx_buf_free(buf: VxBuf) {
    if buf.data.is_null() {
        return;
    }
    let slice = ptr::slice_from_raw_parts_mut(buf.data, buf.len);
    drop(unsafe { Box::from_raw(slice) });
}

/// Route every log record to `func`. Passing `None` restores the default sink.
///
/// Returns once no delivery to the previous handler is in flight.
///
/// # Safety
/// `user` must stay valid until the handler is replaced or removed.
pub unsafe extern "C" fn vx_log_set_handler(func: Option<VxLogFn>, user: *mut c_void) {
    let mut handler = LOG_HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    *handler = func.map(|func| LogHandler { func, user });
}

pub extern "C" fn vx_log_remove_handler() {
    let mut handler = LOG_HANDLER.write().unwrap_or_else(PoisonError::into_inner);
    *handler = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn copy_clears_buffer() {
        vx_error_clear();
        error("demo", "first failure");
        error("demo", "second failure");

        let raw = vx_error_buffer_copy();
        let text = unsafe { std::ffi::CStr::from_ptr(raw) }
            .to_string_lossy()
            .into_owned();
        unsafe { vx_free_string(raw) };
        assert_eq!(text, "demo: first failure\ndemo: second failure\n");

        let raw = vx_error_buffer_copy();
        let text = unsafe { std::ffi::CStr::from_ptr(raw) }.to_bytes().len();
        unsafe { vx_free_string(raw) };
        assert_eq!(text, 0);
    }
}
