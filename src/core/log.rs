//! Purpose: Route engine log records to a host delegate.
//! Exports: `LoggingDelegate`, `TracingDelegate`, `install`, `remove`.
//! Role: The logging half of the diagnostic channel; installed by `runtime::start`.
//! Invariants: At most one delegate is installed; a replaced delegate is dropped only
//! after the engine has stopped delivering to it.
use std::ffi::{CStr, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};

use super::sys;

/// Receives engine log records. Called from any engine thread.
pub trait LoggingDelegate: Send + Sync {
    fn debug(&self, domain: &str, message: &str);
    fn info(&self, domain: &str, message: &str);
    fn warning(&self, domain: &str, message: &str);
    fn error(&self, domain: &str, message: &str);
}

/// Forwards records to `tracing` under the `vips` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDelegate;

impl LoggingDelegate for TracingDelegate {
    fn debug(&self, domain: &str, message: &str) {
        tracing::debug!(target: "vips", domain, "{message}");
    }

    fn info(&self, domain: &str, message: &str) {
        tracing::info!(target: "vips", domain, "{message}");
    }

    fn warning(&self, domain: &str, message: &str) {
        tracing::warn!(target: "vips", domain, "{message}");
    }

    fn error(&self, domain: &str, message: &str) {
        tracing::error!(target: "vips", domain, "{message}");
    }
}

type Delegate = Box<dyn LoggingDelegate>;

struct Installed(*mut Delegate);

// The pointer is a leaked `Box<Delegate>`; delegates are `Send + Sync`.
unsafe impl Send for Installed {}

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

fn text<'a>(ptr: *const c_char) -> std::borrow::Cow<'a, str> {
    if ptr.is_null() {
        return "".into();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
}

unsafe extern "C" fn log_trampoline(
    domain: *const c_char,
    level: u32,
    message: *const c_char,
    user: *mut c_void,
) {
    if user.is_null() {
        return;
    }
    let delegate = unsafe { &*user.cast_const().cast::<Delegate>() };
    let (domain, message) = (text(domain), text(message));
    let delivered = catch_unwind(AssertUnwindSafe(|| match level {
        sys::VX_LOG_LEVEL_ERROR | sys::VX_LOG_LEVEL_CRITICAL => delegate.error(&domain, &message),
        sys::VX_LOG_LEVEL_WARNING => delegate.warning(&domain, &message),
        sys::VX_LOG_LEVEL_MESSAGE | sys::VX_LOG_LEVEL_INFO => delegate.info(&domain, &message),
        _ => delegate.debug(&domain, &message),
    }));
    if delivered.is_err() {
        tracing::error!("logging delegate panicked; record dropped");
    }
}

fn swap(next: Option<Delegate>) {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    match next {
        Some(delegate) => {
            let token = Box::into_raw(Box::new(delegate));
            unsafe { sys::vx_log_set_handler(Some(log_trampoline), token.cast()) };
            if let Some(Installed(previous)) = installed.replace(Installed(token)) {
                drop(unsafe { Box::from_raw(previous) });
            }
        }
        None => {
            sys::vx_log_remove_handler();
            if let Some(Installed(previous)) = installed.take() {
                drop(unsafe { Box::from_raw(previous) });
            }
        }
    }
}

/// Replace the current delegate, if any, with `delegate`.
pub fn install(delegate: Box<dyn LoggingDelegate>) {
    swap(Some(delegate));
}

/// Restore the engine's default sink and drop the installed delegate.
pub fn remove() {
    swap(None);
}

pub fn is_installed() -> bool {
    INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<(String, String)>>,
    }

    struct Shared(Arc<Recorder>);

    impl Shared {
        fn push(&self, level: &str, message: &str) {
            self.0
                .records
                .lock()
                .expect("lock")
                .push((level.to_string(), message.to_string()));
        }
    }

    impl LoggingDelegate for Shared {
        fn debug(&self, _: &str, message: &str) {
            self.push("debug", message);
        }

        fn info(&self, _: &str, message: &str) {
            self.push("info", message);
        }

        fn warning(&self, _: &str, message: &str) {
            self.push("warning", message);
        }

        fn error(&self, _: &str, message: &str) {
            self.push("error", message);
        }
    }

    #[test]
    fn levels_map_onto_delegate_methods() {
        let recorder = Arc::new(Recorder::default());
        let delegate: Delegate = Box::new(Shared(Arc::clone(&recorder)));
        let user = (&delegate as *const Delegate).cast_mut().cast();
        for (level, message) in [
            (sys::VX_LOG_LEVEL_CRITICAL, c"bad"),
            (sys::VX_LOG_LEVEL_WARNING, c"odd"),
            (sys::VX_LOG_LEVEL_MESSAGE, c"note"),
            (sys::VX_LOG_LEVEL_DEBUG, c"trace"),
        ] {
            unsafe { log_trampoline(c"VIPS".as_ptr(), level, message.as_ptr(), user) };
        }
        let records = recorder.records.lock().expect("lock").clone();
        let levels: Vec<&str> = records.iter().map(|(level, _)| level.as_str()).collect();
        assert_eq!(levels, ["error", "warning", "info", "debug"]);
    }

    #[test]
    #[serial]
    fn installed_delegate_sees_engine_criticals() {
        let recorder = Arc::new(Recorder::default());
        install(Box::new(Shared(Arc::clone(&recorder))));
        assert!(is_installed());
        assert_eq!(unsafe { sys::vx_image_get_width(std::ptr::null()) }, 0);
        remove();
        assert!(!is_installed());
        let records = recorder.records.lock().expect("lock").clone();
        assert!(
            records
                .iter()
                .any(|(level, message)| level == "error" && message.contains("VIPS_IS_IMAGE"))
        );
        assert_eq!(Arc::strong_count(&recorder), 1);
    }
}
