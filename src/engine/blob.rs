//! Purpose: Immutable byte areas shared between the engine and its callers.
//! Exports: `BlobData`, `vx_blob_new`, `vx_blob_copy`, `vx_blob_get`.
//! Invariants: A foreign blob's free callback runs exactly once, at finalize.
use std::ffi::c_void;
use std::ptr;

use super::abi::VxFreeFn;
use super::diag;
use super::object::{Body, VxObject};

pub(crate) enum BlobData {
    Owned(Box<[u8]>),
    Foreign {
        data: *const u8,
        len: usize,
        free: Option<VxFreeFn>,
        user: *mut c_void,
    },
}

// Foreign areas are read-only for their whole lifetime.
unsafe impl Send for BlobData {}
unsafe impl Sync for BlobData {}

impl BlobData {
    pub(crate) fn copied(bytes: &[u8]) -> Self {
        BlobData::Owned(bytes.into())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            BlobData::Owned(bytes) => bytes,
            BlobData::Foreign { data, len, .. } => {
                if data.is_null() || *len == 0 {
                    &[]
                } else {
                    unsafe { std::slice::from_raw_parts(*data, *len) }
                }
            }
        }
    }
}

impl Drop for BlobData {
    fn drop(&mut self) {
        if let BlobData::Foreign {
            data, free, user, ..
        } = self
        {
            if let Some(free) = free.take() {
                unsafe { free(data.cast_mut().cast(), *user) };
            }
        }
    }
}

/// Wrap `len` bytes at `data` without copying. `free(data, user)` runs at finalize.
///
/// # Safety
/// `data` must stay valid and unmodified until `free` is called.
pub unsafe extern "C" fn vx_blob_new(
    data: *const c_void,
    len: usize,
    free: Option<VxFreeFn>,
    user: *mut c_void,
) -> *mut VxObject {
    if data.is_null() && len > 0 {
        diag::error("VipsBlob", "null data with non-zero length");
        return ptr::null_mut();
    }
    VxObject::create(Body::Blob(BlobData::Foreign {
        data: data.cast(),
        len,
        free,
        user,
    }))
    .into_raw()
}

/// # Safety
/// `data` must point at `len` readable bytes.
pub unsafe extern "C" fn vx_blob_copy(data: *const c_void, len: usize) -> *mut VxObject {
    let bytes = if data.is_null() || len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }
    };
    VxObject::create(Body::Blob(BlobData::copied(bytes))).into_raw()
}

/// Borrowed view; valid while the blob is alive.
///
/// # Safety
/// `blob` must be null or a live object; `len` must be null or writable.
pub unsafe extern "C" fn vx_blob_get(blob: *mut VxObject, len: *mut usize) -> *const c_void {
    let bytes = match unsafe { blob.as_ref() }.and_then(VxObject::blob) {
        Some(data) => data.as_slice(),
        None => {
            diag::critical("vx_blob_get: assertion 'VIPS_IS_BLOB (blob)' failed");
            &[]
        }
    };
    if let Some(len) = unsafe { len.as_mut() } {
        *len = bytes.len();
    }
    bytes.as_ptr().cast()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::object::vx_object_unref;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe extern "C" fn count_free(_data: *mut c_void, user: *mut c_void) {
        let counter = unsafe { &*user.cast::<AtomicUsize>() };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn foreign_blob_frees_once() {
        let counter = AtomicUsize::new(0);
        let bytes = b"payload".to_vec();
        let blob = unsafe {
            vx_blob_new(
                bytes.as_ptr().cast(),
                bytes.len(),
                Some(count_free),
                (&counter as *const AtomicUsize).cast_mut().cast(),
            )
        };
        let mut len = 0;
        let data = unsafe { vx_blob_get(blob, &mut len) };
        assert_eq!(len, 7);
        assert_eq!(data.cast::<u8>(), bytes.as_ptr());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        unsafe { vx_object_unref(blob) };
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
