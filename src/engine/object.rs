//! Purpose: Refcounted engine objects and per-object signal handlers.
//! Exports: `VxObject`, `ObjRef`, `Body`, `Signal`, `Callback`, ref/unref/disconnect ABI.
//! Role: Shared lifetime machinery for images, blobs, sources, targets, operations.
//! Invariants: Finalization runs once, when the count drops from one to zero.
//! Invariants: Handlers are invoked under a read lock; disconnect takes the write lock,
//! so it returns only after every in-flight invocation of that object has finished.
use std::ffi::{CStr, c_char, c_ulong, c_void};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use super::abi::{VxDestroyNotify, VxEndFn, VxFinishFn, VxReadFn, VxSeekFn, VxWriteFn};
use super::blob::BlobData;
use super::diag;
use super::image::ImageData;
use super::lifecycle;
use super::registry::OperationData;
use super::source::SourceData;
use super::target::TargetData;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

pub struct VxObject {
    refcount: AtomicUsize,
    handlers: RwLock<Vec<Handler>>,
    pub(crate) body: Body,
}

pub(crate) enum Body {
    Image(ImageData),
    Blob(BlobData),
    Source(SourceData),
    Target(TargetData),
    Operation(OperationData),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Signal {
    Read,
    Seek,
    Write,
    End,
    Finish,
}

#[derive(Clone, Copy)]
pub(crate) enum Callback {
    Read(VxReadFn),
    Seek(VxSeekFn),
    Write(VxWriteFn),
    End(VxEndFn),
    Finish(VxFinishFn),
}

impl Callback {
    fn signal(&self) -> Signal {
        match self {
            Callback::Read(_) => Signal::Read,
            Callback::Seek(_) => Signal::Seek,
            Callback::Write(_) => Signal::Write,
            Callback::End(_) => Signal::End,
            Callback::Finish(_) => Signal::Finish,
        }
    }
}

struct Handler {
    id: c_ulong,
    callback: Callback,
    user: *mut c_void,
    destroy: Option<VxDestroyNotify>,
}

impl Handler {
    fn release(self) {
        if let Some(destroy) = self.destroy {
            unsafe { destroy(self.user) };
        }
    }
}

// Handler user data is owned by the connecting caller, who guarantees thread safety.
unsafe impl Send for Handler {}
unsafe impl Sync for Handler {}

impl VxObject {
    /// Allocate an object holding one reference for the caller.
    pub(crate) fn create(body: Body) -> ObjRef {
        lifecycle::object_created();
        let boxed = Box::new(VxObject {
            refcount: AtomicUsize::new(1),
            handlers: RwLock::new(Vec::new()),
            body,
        });
        ObjRef(NonNull::from(Box::leak(boxed)))
    }

    pub(crate) fn type_name(&self) -> &'static CStr {
        match &self.body {
            Body::Image(_) => c"VipsImage",
            Body::Blob(_) => c"VipsBlob",
            Body::Source(_) => c"VipsSource",
            Body::Target(_) => c"VipsTarget",
            Body::Operation(data) => data.class.nickname,
        }
    }

    pub(crate) fn image(&self) -> Option<&ImageData> {
        match &self.body {
            Body::Image(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn blob(&self) -> Option<&BlobData> {
        match &self.body {
            Body::Blob(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn source(&self) -> Option<&SourceData> {
        match &self.body {
            Body::Source(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn target(&self) -> Option<&TargetData> {
        match &self.body {
            Body::Target(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn operation(&self) -> Option<&OperationData> {
        match &self.body {
            Body::Operation(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn connect(
        &self,
        callback: Callback,
        user: *mut c_void,
        destroy: Option<VxDestroyNotify>,
    ) -> c_ulong {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed) as c_ulong;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Handler {
                id,
                callback,
                user,
                destroy,
            });
        id
    }

    fn disconnect(&self, id: c_ulong) -> bool {
        let removed = {
            let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
            handlers
                .iter()
                .position(|handler| handler.id == id)
                .map(|index| handlers.remove(index))
        };
        match removed {
            Some(handler) => {
                handler.release();
                true
            }
            None => false,
        }
    }

    /// Hold the handler list for one emission; the first handler for `signal` wins.
    pub(crate) fn emission(&self, signal: Signal) -> Option<Emission<'_>> {
        let guard = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let index = guard
            .iter()
            .position(|handler| handler.callback.signal() == signal)?;
        Some(Emission { guard, index })
    }

    fn finalize(&self) {
        let handlers = std::mem::take(
            &mut *self.handlers.write().unwrap_or_else(PoisonError::into_inner),
        );
        for handler in handlers {
            handler.release();
        }
    }
}

pub(crate) struct Emission<'a> {
    guard: RwLockReadGuard<'a, Vec<Handler>>,
    index: usize,
}

impl Emission<'_> {
    pub(crate) fn callback(&self) -> Callback {
        self.guard[self.index].callback
    }

    pub(crate) fn user(&self) -> *mut c_void {
        self.guard[self.index].user
    }
}

/// Owned reference used inside the engine. Clone refs, drop unrefs.
pub(crate) struct ObjRef(NonNull<VxObject>);

// Objects synchronize their own mutable state.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    /// Take a new reference to a borrowed pointer.
    ///
    /// # Safety
    /// `object` must be null or point at a live engine object.
    pub(crate) unsafe fn borrow(object: *mut VxObject) -> Option<ObjRef> {
        let object = NonNull::new(object)?;
        unsafe { object.as_ref() }
            .refcount
            .fetch_add(1, Ordering::Relaxed);
        Some(ObjRef(object))
    }

    /// Adopt the reference `object` already carries.
    ///
    /// # Safety
    /// `object` must be null or point at a live engine object with a reference to spare.
    pub(crate) unsafe fn adopt(object: *mut VxObject) -> Option<ObjRef> {
        NonNull::new(object).map(ObjRef)
    }

    /// Hand the reference to the caller.
    pub(crate) fn into_raw(self) -> *mut VxObject {
        let ptr = self.0.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        ObjRef(self.0)
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        unsafe { release(self.0) };
    }
}

impl Deref for ObjRef {
    type Target = VxObject;

    fn deref(&self) -> &VxObject {
        unsafe { self.0.as_ref() }
    }
}

unsafe fn release(object: NonNull<VxObject>) {
    let previous = unsafe { object.as_ref() }
        .refcount
        .fetch_sub(1, Ordering::Release);
    if previous != 1 {
        return;
    }
    fence(Ordering::Acquire);
    unsafe { object.as_ref() }.finalize();
    drop(unsafe { Box::from_raw(object.as_ptr()) });
    lifecycle::object_finalized();
}

/// Returns `object` for call chaining.
///
/// # Safety
/// `object` must be null or point at a live engine object.
pub unsafe extern "C" fn vx_object_ref(object: *mut VxObject) -> *mut VxObject {
    match unsafe { ObjRef::borrow(object) } {
        Some(reference) => reference.into_raw(),
        None => {
            diag::critical("vx_object_ref: assertion 'object != NULL' failed");
            object
        }
    }
}

/// # Safety
/// `object` must be null or point at a live engine object the caller holds a reference on.
pub unsafe extern "C" fn vx_object_unref(object: *mut VxObject) {
    match NonNull::new(object) {
        Some(object) => unsafe { release(object) },
        None => diag::critical("vx_object_unref: assertion 'object != NULL' failed"),
    }
}

/// # Safety
/// `object` must be null or point at a live engine object.
pub unsafe extern "C" fn vx_object_refcount(object: *const VxObject) -> usize {
    match unsafe { object.as_ref() } {
        Some(object) => object.refcount.load(Ordering::Acquire),
        None => 0,
    }
}

/// # Safety
/// `object` must be null or point at a live engine object.
pub unsafe extern "C" fn vx_object_type_name(object: *const VxObject) -> *const c_char {
    match unsafe { object.as_ref() } {
        Some(object) => object.type_name().as_ptr(),
        None => c"(null)".as_ptr(),
    }
}

/// Disconnect one handler and run its destroy notify. Returns 0 if `id` was unknown.
///
/// # Safety
/// `object` must be null or point at a live engine object.
pub unsafe extern "C" fn vx_signal_handler_disconnect(object: *mut VxObject, id: c_ulong) -> i32 {
    let Some(object) = (unsafe { object.as_ref() }) else {
        return 0;
    };
    if object.disconnect(id) {
        1
    } else {
        diag::warning(format_args!("instance has no handler with id '{id}'"));
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::blob::BlobData;
    use std::sync::atomic::AtomicUsize;

    static DESTROYED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_destroy(_user: *mut c_void) {
        DESTROYED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn finish(_object: *mut VxObject, _user: *mut c_void) {}

    #[test]
    fn clone_and_drop_balance() {
        let object = VxObject::create(Body::Blob(BlobData::copied(b"abc")));
        let raw = std::ptr::from_ref::<VxObject>(&object).cast_mut();
        assert_eq!(unsafe { vx_object_refcount(raw) }, 1);
        let second = object.clone();
        assert_eq!(unsafe { vx_object_refcount(raw) }, 2);
        drop(second);
        assert_eq!(unsafe { vx_object_refcount(raw) }, 1);
    }

    #[test]
    fn finalize_runs_destroy_notify_once() {
        let before = DESTROYED.load(Ordering::SeqCst);
        let object = VxObject::create(Body::Blob(BlobData::copied(b"abc")));
        let first = object.connect(
            Callback::Finish(finish),
            std::ptr::null_mut(),
            Some(count_destroy),
        );
        object.connect(
            Callback::Finish(finish),
            std::ptr::null_mut(),
            Some(count_destroy),
        );
        let raw = std::ptr::from_ref::<VxObject>(&object).cast_mut();
        assert_eq!(unsafe { vx_signal_handler_disconnect(raw, first) }, 1);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 1);
        assert!(object.emission(Signal::Finish).is_some());
        drop(object);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), before + 2);
    }
}
