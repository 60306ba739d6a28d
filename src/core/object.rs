//! Purpose: Owned native references and keep-alive edges.
//! Exports: `ObjectRef`, `KeepAlive`.
//! Role: Ownership primitive under every managed handle (image, blob, source, target).
//! Invariants: An `ObjectRef` owns exactly one native reference; drop releases it once.
//! Invariants: `Clone` takes one more native reference; the count never goes through the host.
use std::any::Any;
use std::ffi::CStr;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use super::sys::{self, VxObject};

/// Shared reference to anything that must outlive a derived native object.
pub type KeepAlive = Arc<dyn Any + Send + Sync>;

pub struct ObjectRef {
    ptr: NonNull<VxObject>,
}

// The engine synchronizes object state internally; handles may cross threads.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Take ownership of the reference `ptr` already carries.
    ///
    /// # Safety
    /// `ptr` must be null or a live object with a reference the caller gives up.
    pub(crate) unsafe fn from_raw(ptr: *mut VxObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| ObjectRef { ptr })
    }

    /// Take a new reference to a borrowed pointer.
    ///
    /// # Safety
    /// `ptr` must be null or a live object.
    pub(crate) unsafe fn from_borrowed(ptr: *mut VxObject) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        unsafe { sys::vx_object_ref(ptr.as_ptr()) };
        Some(ObjectRef { ptr })
    }

    pub(crate) fn as_ptr(&self) -> *mut VxObject {
        self.ptr.as_ptr()
    }

    /// Current native reference count.
    pub fn ref_count(&self) -> usize {
        unsafe { sys::vx_object_refcount(self.ptr.as_ptr()) }
    }

    pub fn type_name(&self) -> String {
        let name = unsafe { sys::vx_object_type_name(self.ptr.as_ptr()) };
        unsafe { CStr::from_ptr(name) }
            .to_string_lossy()
            .into_owned()
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        unsafe { sys::vx_object_ref(self.ptr.as_ptr()) };
        ObjectRef { ptr: self.ptr }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        unsafe { sys::vx_object_unref(self.ptr.as_ptr()) };
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type", &self.type_name())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_move_the_native_count() {
        let raw = unsafe { sys::vx_blob_copy(b"abc".as_ptr().cast(), 3) };
        let object = unsafe { ObjectRef::from_raw(raw) }.expect("blob");
        assert_eq!(object.ref_count(), 1);
        let second = object.clone();
        assert_eq!(object.ref_count(), 2);
        drop(second);
        assert_eq!(object.ref_count(), 1);
        assert_eq!(object.type_name(), "VipsBlob");
    }
}
