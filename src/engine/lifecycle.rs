//! Purpose: Engine start-up, shut-down, worker pool sizing and leak accounting.
//! Exports: `vx_init`, `vx_shutdown`, `vx_concurrency_set/get`, `vx_leak_set`, `vx_version_string`.
//! Role: Process-level state shared by every engine object.
//! Invariants: `vx_init` is idempotent; `vx_shutdown` reports leaks only when enabled.
use std::ffi::{CStr, c_char, c_int};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use super::diag;

const VERSION: &CStr = c"8.15.0-vx";

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static LEAK_CHECK: AtomicBool = AtomicBool::new(false);
static CONCURRENCY: AtomicUsize = AtomicUsize::new(0);
static LIVE_OBJECTS: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn object_created() {
    LIVE_OBJECTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn object_finalized() {
    LIVE_OBJECTS.fetch_sub(1, Ordering::Relaxed);
}

/// Worker threads used when encoding pixels; zero means "pick from the host".
pub(crate) fn concurrency() -> usize {
    match CONCURRENCY.load(Ordering::Relaxed) {
        0 => thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1),
        count => count,
    }
}

/// Returns 0 on success. Repeated calls are no-ops.
///
/// # Safety
/// `program_name` must be null or a valid C string.
pub unsafe extern "C" fn vx_init(program_name: *const c_char) -> c_int {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return 0;
    }
    let name = if program_name.is_null() {
        "vips".to_string()
    } else {
        unsafe { CStr::from_ptr(program_name) }
            .to_string_lossy()
            .into_owned()
    };
    diag::info(format_args!(
        "{name}: engine {} started",
        VERSION.to_string_lossy()
    ));
    0
}

pub extern "C" fn vx_shutdown() {
    if !INITIALIZED.swap(false, Ordering::AcqRel) {
        return;
    }
    let live = LIVE_OBJECTS.load(Ordering::Acquire);
    if LEAK_CHECK.load(Ordering::Relaxed) && live > 0 {
        diag::warning(format_args!("{live} objects alive at shutdown"));
    }
    diag::debug("engine shut down");
}

/// Zero restores the default (one worker per host CPU).
pub extern "C" fn vx_concurrency_set(concurrency: c_int) {
    CONCURRENCY.store(concurrency.max(0) as usize, Ordering::Relaxed);
}

pub extern "C" fn vx_concurrency_get() -> c_int {
    c_int::try_from(concurrency()).unwrap_or(c_int::MAX)
}

pub extern "C" fn vx_leak_set(leak: c_int) {
    LEAK_CHECK.store(leak != 0, Ordering::Relaxed);
}

pub extern "C" fn vx_version_string() -> *const c_char {
    VERSION.as_ptr()
}

pub extern "C" fn vx_object_live_count() -> usize {
    LIVE_OBJECTS.load(Ordering::Acquire)
}
