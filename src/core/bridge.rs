//! Purpose: Expose host closures as engine stream callbacks.
//! Exports: `Whence`, `Bridge`, `StreamCallbacks`, trampolines.
//! Role: Backing for `SourceCustom` and `TargetCustom`.
//! Invariants: One token per bridge, allocated at creation and released once on drop,
//! after every handler is disconnected; disconnect waits for in-flight callbacks.
//! Invariants: Closures run under the token's mutex; panics never cross into the engine.
use std::cell::Cell;
use std::ffi::{c_int, c_ulong, c_void};
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use super::object::ObjectRef;
use super::sys::{self, VxObject};

/// Origin of a stream seek.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    pub(crate) fn to_raw(self) -> c_int {
        match self {
            Whence::Set => libc::SEEK_SET,
            Whence::Current => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        }
    }

    pub(crate) fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            libc::SEEK_SET => Some(Whence::Set),
            libc::SEEK_CUR => Some(Whence::Current),
            libc::SEEK_END => Some(Whence::End),
            _ => None,
        }
    }
}

pub(crate) type ReadFn = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
pub(crate) type SeekFn = Box<dyn FnMut(i64, Whence) -> io::Result<u64> + Send>;
pub(crate) type WriteFn = Box<dyn FnMut(&[u8]) -> io::Result<usize> + Send>;
pub(crate) type EndFn = Box<dyn FnOnce() -> io::Result<()> + Send>;
pub(crate) type FinishFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct StreamCallbacks {
    pub(crate) read: Option<ReadFn>,
    pub(crate) seek: Option<SeekFn>,
    pub(crate) write: Option<WriteFn>,
    pub(crate) end: Option<EndFn>,
    pub(crate) finish: Option<FinishFn>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Slot {
    Read,
    Seek,
    Write,
    End,
    Finish,
}

thread_local! {
    /// Token whose closures are running on this thread, if any.
    static RUNNING: Cell<*const c_void> = const { Cell::new(ptr::null()) };
}

/// Marks a token as running on this thread until dropped.
struct Running(*const c_void);

impl Running {
    fn enter(token: *const c_void) -> Self {
        Running(RUNNING.replace(token))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        RUNNING.set(self.0);
    }
}

/// Callback context shared with the engine through one raw token.
pub(crate) struct Bridge<C> {
    object: *mut VxObject,
    token: *const Mutex<C>,
    handlers: Mutex<Vec<(Slot, c_ulong)>>,
}

// The token is only dereferenced under its mutex; the object pointer is kept
// alive by the owner, which drops the bridge before its object reference.
unsafe impl<C: Send> Send for Bridge<C> {}
unsafe impl<C: Send> Sync for Bridge<C> {}

impl<C: Send + 'static> Bridge<C> {
    pub(crate) fn new(object: &ObjectRef, callbacks: C) -> Self {
        Bridge {
            object: object.as_ptr(),
            token: Arc::into_raw(Arc::new(Mutex::new(callbacks))),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Change the callbacks; waits for a callback that is running right now.
    ///
    /// # Panics
    /// When called from inside one of this bridge's own callbacks, which hold
    /// the token's mutex. The panic is contained and fails that callback.
    pub(crate) fn update(&self, f: impl FnOnce(&mut C)) {
        if RUNNING.get() == self.token.cast::<c_void>() {
            panic!("stream callbacks cannot be replaced from inside their own callback");
        }
        let callbacks = unsafe { &*self.token };
        let mut guard = callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Connect `slot` once; later calls only swap the closure via `update`.
    pub(crate) fn connect(
        &self,
        slot: Slot,
        connect: impl FnOnce(*mut VxObject, *mut c_void) -> c_ulong,
    ) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|(connected, _)| *connected == slot) {
            return;
        }
        let id = connect(self.object, self.token.cast_mut().cast());
        if id != 0 {
            handlers.push((slot, id));
        }
    }

    /// Run `f` on the callbacks behind a token, containing any panic.
    ///
    /// # Safety
    /// `user` must be the token of a live bridge with callbacks of type `C`.
    pub(crate) unsafe fn with<R>(user: *mut c_void, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        if user.is_null() {
            return None;
        }
        let callbacks = unsafe { &*user.cast_const().cast::<Mutex<C>>() };
        let mut guard = callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let _running = Running::enter(user.cast_const());
        match catch_unwind(AssertUnwindSafe(|| f(&mut guard))) {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::error!("stream callback panicked; reporting failure to the engine");
                None
            }
        }
    }
}

impl<C> Drop for Bridge<C> {
    fn drop(&mut self) {
        let handlers = std::mem::take(
            &mut *self.handlers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (_, id) in handlers {
            unsafe { sys::vx_signal_handler_disconnect(self.object, id) };
        }
        drop(unsafe { Arc::from_raw(self.token) });
    }
}

fn failed(what: &str, err: io::Error) -> i64 {
    tracing::debug!(error = %err, "{what} callback failed");
    -1
}

pub(crate) unsafe extern "C" fn read_trampoline(
    _object: *mut VxObject,
    buf: *mut c_void,
    len: i64,
    user: *mut c_void,
) -> i64 {
    if buf.is_null() || len <= 0 {
        return 0;
    }
    let buf = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len as usize) };
    let result = unsafe {
        Bridge::<StreamCallbacks>::with(user, |callbacks| match callbacks.read.as_mut() {
            Some(read) => match read(buf) {
                Ok(n) => n.min(len as usize) as i64,
                Err(err) => failed("read", err),
            },
            None => -1,
        })
    };
    result.unwrap_or(-1)
}

pub(crate) unsafe extern "C" fn seek_trampoline(
    _object: *mut VxObject,
    offset: i64,
    whence: c_int,
    user: *mut c_void,
) -> i64 {
    let Some(whence) = Whence::from_raw(whence) else {
        return -1;
    };
    let result = unsafe {
        Bridge::<StreamCallbacks>::with(user, |callbacks| match callbacks.seek.as_mut() {
            Some(seek) => match seek(offset, whence) {
                Ok(position) => i64::try_from(position).unwrap_or(-1),
                Err(err) => failed("seek", err),
            },
            None => -1,
        })
    };
    result.unwrap_or(-1)
}

pub(crate) unsafe extern "C" fn write_trampoline(
    _object: *mut VxObject,
    data: *const c_void,
    len: i64,
    user: *mut c_void,
) -> i64 {
    if data.is_null() || len <= 0 {
        return 0;
    }
    let data = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
    let result = unsafe {
        Bridge::<StreamCallbacks>::with(user, |callbacks| match callbacks.write.as_mut() {
            Some(write) => match write(data) {
                Ok(n) => n.min(data.len()) as i64,
                Err(err) => failed("write", err),
            },
            None => -1,
        })
    };
    result.unwrap_or(-1)
}

/// Runs the end closure, then the finish closure if one is still pending.
pub(crate) unsafe extern "C" fn end_trampoline(_object: *mut VxObject, user: *mut c_void) -> c_int {
    let result = unsafe {
        Bridge::<StreamCallbacks>::with(user, |callbacks| {
            let ended = match callbacks.end.take() {
                Some(end) => end(),
                None => Ok(()),
            };
            if let Some(finish) = callbacks.finish.take() {
                finish();
            }
            match ended {
                Ok(()) => 0,
                Err(err) => failed("end", err) as c_int,
            }
        })
    };
    result.unwrap_or(-1)
}

pub(crate) unsafe extern "C" fn finish_trampoline(_object: *mut VxObject, user: *mut c_void) {
    let _ = unsafe {
        Bridge::<StreamCallbacks>::with(user, |callbacks| {
            if let Some(finish) = callbacks.finish.take() {
                finish();
            }
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn whence_matches_libc_constants() {
        for whence in [Whence::Set, Whence::Current, Whence::End] {
            assert_eq!(Whence::from_raw(whence.to_raw()), Some(whence));
        }
        assert_eq!(Whence::from_raw(99), None);
    }

    #[test]
    #[serial]
    fn panicking_closure_reports_failure() {
        let raw = sys::vx_source_custom_new();
        let object = unsafe { ObjectRef::from_raw(raw) }.expect("source");
        let bridge = Bridge::new(&object, StreamCallbacks::default());
        bridge.update(|callbacks| {
            callbacks.read = Some(Box::new(|_buf: &mut [u8]| -> io::Result<usize> {
                panic!("reader exploded")
            }));
        });
        bridge.connect(Slot::Read, |object, user| unsafe {
            sys::vx_source_custom_connect_read(object, Some(read_trampoline), user, None)
        });
        let mut buf = [0u8; 8];
        let n = unsafe { sys::vx_source_read(object.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, -1);
        drop(bridge);
        crate::core::diag::clear_error();
    }
}
