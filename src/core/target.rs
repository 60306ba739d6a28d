//! Purpose: Managed output streams, including caller-supplied ones.
//! Exports: `Target`, `TargetCustom`.
//! Role: Stream-handle variant consumed by `*save_target` operations.
//! Invariants: A custom target's bridge is dropped before its native reference.
//! Invariants: `finish` runs at most once, whether the engine emits `end` or `finish`.
use std::ffi::CString;
use std::fmt;
use std::io::{self, Write};
use std::ops::Deref;
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use super::bridge::{self, Bridge, Slot, StreamCallbacks, Whence};
use super::diag;
use super::error::{Error, ErrorKind, Result};
use super::object::{KeepAlive, ObjectRef};
use super::source::path_arg;
use super::sys;

#[derive(Clone)]
pub struct Target {
    inner: Arc<TargetInner>,
}

// Field order is drop order: the bridge disconnects while the object is still alive.
struct TargetInner {
    _bridge: Option<KeepAlive>,
    object: ObjectRef,
    _keep_alive: Vec<KeepAlive>,
}

fn adopt(raw: *mut sys::VxObject, what: &str) -> Result<ObjectRef> {
    unsafe { ObjectRef::from_raw(raw) }.ok_or_else(|| diag::failure(ErrorKind::Io, what))
}

impl Target {
    pub(crate) fn wrap(
        bridge: Option<KeepAlive>,
        object: ObjectRef,
        keep_alive: Vec<KeepAlive>,
    ) -> Self {
        Target {
            inner: Arc::new(TargetInner {
                _bridge: bridge,
                object,
                _keep_alive: keep_alive,
            }),
        }
    }

    /// Collect output in memory; take it with `steal`.
    pub fn to_memory() -> Result<Self> {
        let object = adopt(sys::vx_target_new_to_memory(), "unable to create target")?;
        Ok(Target::wrap(None, object, Vec::new()))
    }

    pub fn to_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path_arg(path.as_ref())?;
        let raw = unsafe { sys::vx_target_new_to_file(path.as_ptr()) };
        Ok(Target::wrap(None, adopt(raw, "unable to open file")?, Vec::new()))
    }

    /// Write to a duplicate of `descriptor`; the caller still owns the original.
    pub fn to_descriptor(descriptor: RawFd) -> Result<Self> {
        let raw = sys::vx_target_new_to_descriptor(descriptor);
        Ok(Target::wrap(None, adopt(raw, "unable to open descriptor")?, Vec::new()))
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if unsafe { sys::vx_target_write(self.ptr(), bytes.as_ptr().cast(), bytes.len()) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "write failed"));
        }
        Ok(())
    }

    pub fn writes(&self, text: &str) -> Result<()> {
        let text = CString::new(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("text contains a NUL byte")
                .with_source(err)
        })?;
        if unsafe { sys::vx_target_writes(self.ptr(), text.as_ptr()) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "write failed"));
        }
        Ok(())
    }

    pub fn putc(&self, byte: u8) -> Result<()> {
        if unsafe { sys::vx_target_putc(self.ptr(), i32::from(byte)) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "write failed"));
        }
        Ok(())
    }

    /// Flush and close. Later calls do nothing.
    pub fn end(&self) -> Result<()> {
        if unsafe { sys::vx_target_end(self.ptr()) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "end failed"));
        }
        Ok(())
    }

    /// End a memory target and take everything written to it.
    pub fn steal(&self) -> Result<Vec<u8>> {
        let mut buf = sys::VxBuf {
            data: ptr::null_mut(),
            len: 0,
        };
        if unsafe { sys::vx_target_steal(self.ptr(), &mut buf) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "steal failed"));
        }
        let bytes = if buf.data.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(buf.data, buf.len) }.to_vec()
        };
        unsafe { sys::vx_buf_free(buf) };
        Ok(bytes)
    }

    pub fn steal_text(&self) -> Result<String> {
        String::from_utf8(self.steal()?).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("target output is not UTF-8")
                .with_source(err)
        })
    }

    /// Read back already-written bytes; custom targets forward to `on_read`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { sys::vx_target_read(self.ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        usize::try_from(n).map_err(|_| diag::failure(ErrorKind::Io, "read failed"))
    }

    pub fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let position = unsafe { sys::vx_target_seek(self.ptr(), offset, whence.to_raw()) };
        u64::try_from(position).map_err(|_| diag::failure(ErrorKind::Io, "seek failed"))
    }

    pub fn is_memory(&self) -> bool {
        unsafe { sys::vx_target_is_memory(self.ptr()) != 0 }
    }

    pub fn is_ended(&self) -> bool {
        unsafe { sys::vx_target_is_ended(self.ptr()) != 0 }
    }

    pub fn object(&self) -> &ObjectRef {
        &self.inner.object
    }

    fn ptr(&self) -> *mut sys::VxObject {
        self.inner.object.as_ptr()
    }

    pub(crate) fn keep_alive_handle(&self) -> KeepAlive {
        self.inner.clone()
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("memory", &self.is_memory())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A target whose bytes go to host closures.
///
/// Closures run on engine threads under the bridge's lock, so none of them may
/// register callbacks on the same target. Such a call fails the running callback.
pub struct TargetCustom {
    bridge: Arc<Bridge<StreamCallbacks>>,
    target: Target,
}

impl TargetCustom {
    pub fn new() -> Result<Self> {
        let object = adopt(sys::vx_target_custom_new(), "unable to create custom target")?;
        let bridge = Arc::new(Bridge::new(&object, StreamCallbacks::default()));
        let target = Target::wrap(Some(bridge.clone() as KeepAlive), object, Vec::new());
        Ok(TargetCustom { bridge, target })
    }

    /// Send every write to `writer`; `end` flushes it.
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Result<Self> {
        let target = TargetCustom::new()?;
        let writer = Arc::new(Mutex::new(writer));
        let flushed = Arc::clone(&writer);
        target
            .on_write(move |bytes| {
                writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write(bytes)
            })
            .on_end(move || {
                flushed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .flush()
            });
        Ok(target)
    }

    /// `f` consumes a prefix of the bytes and returns its length; the rest is offered again.
    pub fn on_write<F>(&self, f: F) -> &Self
    where
        F: FnMut(&[u8]) -> io::Result<usize> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.write = Some(Box::new(f)));
        self.bridge.connect(Slot::Write, |object, user| unsafe {
            sys::vx_target_custom_connect_write(object, Some(bridge::write_trampoline), user, None)
        });
        self
    }

    pub fn on_read<F>(&self, f: F) -> &Self
    where
        F: FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.read = Some(Box::new(f)));
        self.bridge.connect(Slot::Read, |object, user| unsafe {
            sys::vx_target_custom_connect_read(object, Some(bridge::read_trampoline), user, None)
        });
        self
    }

    pub fn on_seek<F>(&self, f: F) -> &Self
    where
        F: FnMut(i64, Whence) -> io::Result<u64> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.seek = Some(Box::new(f)));
        self.bridge.connect(Slot::Seek, |object, user| unsafe {
            sys::vx_target_custom_connect_seek(object, Some(bridge::seek_trampoline), user, None)
        });
        self
    }

    /// Runs once when the target ends; an error fails the save.
    pub fn on_end<F>(&self, f: F) -> &Self
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.end = Some(Box::new(f)));
        self.bridge.connect(Slot::End, |object, user| unsafe {
            sys::vx_target_custom_connect_end(object, Some(bridge::end_trampoline), user, None)
        });
        self
    }

    /// Runs at most once, after the last byte has been written.
    pub fn on_finish<F>(&self, f: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.finish = Some(Box::new(f)));
        self.bridge.connect(Slot::Finish, |object, user| unsafe {
            sys::vx_target_custom_connect_finish(object, Some(bridge::finish_trampoline), user, None)
        });
        self
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn into_target(self) -> Target {
        self.target.clone()
    }
}

impl Deref for TargetCustom {
    type Target = Target;

    fn deref(&self) -> &Target {
        &self.target
    }
}

impl fmt::Debug for TargetCustom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TargetCustom").field(&self.target).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn memory_target_collects_text() {
        let target = Target::to_memory().expect("target");
        assert!(target.is_memory());
        target.writes("P2\n").expect("writes");
        target.putc(b'1').expect("putc");
        target.end().expect("end");
        assert!(target.is_ended());
        assert_eq!(target.steal_text().expect("steal"), "P2\n1");
    }

    #[test]
    fn finish_fires_once_even_with_end() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::clone(&sink);
        let custom = TargetCustom::new().expect("custom");
        custom
            .on_write(move |bytes| {
                written.lock().expect("lock").extend_from_slice(bytes);
                Ok(bytes.len())
            })
            .on_end(|| Ok(()))
            .on_finish(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        custom.writes("abc").expect("write");
        custom.end().expect("end");
        custom.end().expect("second end");
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(&*sink.lock().expect("lock"), b"abc");
    }
}
