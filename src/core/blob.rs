//! Purpose: Managed byte buffers shared with the engine.
//! Exports: `Blob`.
//! Role: Buffer-handle variant; loader input and saver output.
//! Invariants: Zero-copy blobs hand their storage to the engine, which releases it exactly once.
use std::ffi::{CStr, c_void};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::diag;
use super::error::{ErrorKind, Result};
use super::object::{KeepAlive, ObjectRef};
use super::sys;

#[derive(Clone)]
pub struct Blob {
    inner: Arc<BlobInner>,
}

struct BlobInner {
    object: ObjectRef,
    _keep_alive: Vec<KeepAlive>,
}

unsafe extern "C" fn release_boxed<B>(_data: *mut c_void, user: *mut c_void) {
    drop(unsafe { Box::from_raw(user.cast::<B>()) });
}

impl Blob {
    pub(crate) fn wrap(object: ObjectRef, keep_alive: Vec<KeepAlive>) -> Self {
        Blob {
            inner: Arc::new(BlobInner {
                object,
                _keep_alive: keep_alive,
            }),
        }
    }

    /// Copy `bytes` into a new engine-owned buffer.
    pub fn copy_from(bytes: &[u8]) -> Result<Self> {
        let raw = unsafe { sys::vx_blob_copy(bytes.as_ptr().cast(), bytes.len()) };
        let object = unsafe { ObjectRef::from_raw(raw) }
            .ok_or_else(|| diag::failure(ErrorKind::OperationFailed, "unable to copy blob"))?;
        Ok(Blob::wrap(object, Vec::new()))
    }

    /// Hand `bytes` to the engine without copying; dropped when the engine releases it.
    pub fn from_owned<B>(bytes: B) -> Result<Self>
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let boxed = Box::new(bytes);
        let (data, len) = {
            let slice = (*boxed).as_ref();
            (slice.as_ptr(), slice.len())
        };
        let user = Box::into_raw(boxed);
        let raw = unsafe {
            sys::vx_blob_new(data.cast(), len, Some(release_boxed::<B>), user.cast())
        };
        match unsafe { ObjectRef::from_raw(raw) } {
            Some(object) => Ok(Blob::wrap(object, Vec::new())),
            None => {
                drop(unsafe { Box::from_raw(user) });
                Err(diag::failure(ErrorKind::OperationFailed, "unable to wrap blob"))
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        let mut len = 0usize;
        let data = unsafe { sys::vx_blob_get(self.inner.object.as_ptr(), &mut len) };
        if data.is_null() || len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    /// View the engine's bytes as `Bytes` without copying; the view keeps the blob alive.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from_owner(self.clone())
    }

    /// Nickname of the loader that recognizes these bytes.
    pub fn find_loader(&self) -> Result<String> {
        let bytes = self.as_bytes();
        let name = unsafe { sys::vx_foreign_find_load_buffer(bytes.as_ptr().cast(), bytes.len()) };
        if name.is_null() {
            return Err(diag::failure(ErrorKind::OperationFailed, "no loader for buffer"));
        }
        Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    pub fn object(&self) -> &ObjectRef {
        &self.inner.object
    }

    pub(crate) fn keep_alive_handle(&self) -> KeepAlive {
        self.inner.clone()
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Blob {}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tracked {
        bytes: Vec<u8>,
        drops: Arc<AtomicUsize>,
    }

    impl AsRef<[u8]> for Tracked {
        fn as_ref(&self) -> &[u8] {
            &self.bytes
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn zero_copy_storage_is_released_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let blob = Blob::from_owned(Tracked {
            bytes: b"P5 1 1 255\n\x07".to_vec(),
            drops: Arc::clone(&drops),
        })
        .expect("blob");
        let copy = blob.clone();
        drop(blob);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(copy.find_loader().expect("loader"), "ppmload_buffer");
        drop(copy);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equality_compares_contents() {
        let copied = Blob::copy_from(b"abc").expect("copy");
        let shared = Blob::from_owned(Bytes::from_static(b"abc")).expect("bytes");
        assert_eq!(copied, shared);
        assert_eq!(shared.to_vec(), b"abc");
        assert!(!copied.is_empty());

        let view = copied.to_bytes();
        drop(copied);
        assert_eq!(&view[..], b"abc");
    }
}
