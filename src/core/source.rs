//! Purpose: Managed input streams, including caller-supplied ones.
//! Exports: `Source`, `SourceCustom`.
//! Role: Stream-handle variant consumed by `*load_source` operations.
//! Invariants: Memory sources keep the caller's bytes alive for the life of the handle.
//! Invariants: A custom source's bridge is dropped before its native reference.
use std::ffi::{CStr, CString};
use std::fmt;
use std::io::{self, Read};
use std::ops::Deref;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use super::blob::Blob;
use super::bridge::{self, Bridge, Slot, StreamCallbacks, Whence};
use super::diag;
use super::error::{Error, ErrorKind, Result};
use super::object::{KeepAlive, ObjectRef};
use super::sys;

#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

// Field order is drop order: the bridge disconnects while the object is still alive.
struct SourceInner {
    _bridge: Option<KeepAlive>,
    object: ObjectRef,
    _keep_alive: Vec<KeepAlive>,
}

pub(crate) fn path_arg(path: &Path) -> Result<CString> {
    let text = path.to_str().ok_or_else(|| {
        Error::new(ErrorKind::Usage).with_message(format!("path {} is not UTF-8", path.display()))
    })?;
    CString::new(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("path {text:?} contains a NUL byte"))
            .with_source(err)
    })
}

fn adopt(raw: *mut sys::VxObject, what: &str) -> Result<ObjectRef> {
    unsafe { ObjectRef::from_raw(raw) }.ok_or_else(|| diag::failure(ErrorKind::Io, what))
}

impl Source {
    pub(crate) fn wrap(bridge: Option<KeepAlive>, object: ObjectRef, keep_alive: Vec<KeepAlive>) -> Self {
        Source {
            inner: Arc::new(SourceInner {
                _bridge: bridge,
                object,
                _keep_alive: keep_alive,
            }),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path_arg(path.as_ref())?;
        let raw = unsafe { sys::vx_source_new_from_file(path.as_ptr()) };
        Ok(Source::wrap(None, adopt(raw, "unable to open file")?, Vec::new()))
    }

    /// Read from a duplicate of `descriptor`; the caller still owns the original.
    pub fn from_descriptor(descriptor: RawFd) -> Result<Self> {
        let raw = sys::vx_source_new_from_descriptor(descriptor);
        Ok(Source::wrap(None, adopt(raw, "unable to open descriptor")?, Vec::new()))
    }

    /// Read from `bytes` in place; the bytes live as long as the source.
    pub fn from_memory<B>(bytes: B) -> Result<Self>
    where
        B: AsRef<[u8]> + Send + Sync + 'static,
    {
        let bytes = Arc::new(bytes);
        let slice = (*bytes).as_ref();
        let raw = unsafe { sys::vx_source_new_from_memory(slice.as_ptr().cast(), slice.len()) };
        let object = adopt(raw, "unable to wrap memory")?;
        Ok(Source::wrap(None, object, vec![bytes as KeepAlive]))
    }

    pub fn from_blob(blob: &Blob) -> Result<Self> {
        let raw = unsafe { sys::vx_source_new_from_blob(blob.object().as_ptr()) };
        let object = adopt(raw, "unable to wrap blob")?;
        Ok(Source::wrap(None, object, vec![blob.keep_alive_handle()]))
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { sys::vx_source_read(self.ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        usize::try_from(n).map_err(|_| diag::failure(ErrorKind::Io, "read failed"))
    }

    /// Read until end of stream.
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.read(&mut chunk)? {
                0 => return Ok(out),
                n => out.extend_from_slice(&chunk[..n]),
            }
        }
    }

    pub fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let position = unsafe { sys::vx_source_seek(self.ptr(), offset, whence.to_raw()) };
        u64::try_from(position).map_err(|_| diag::failure(ErrorKind::Io, "seek failed"))
    }

    pub fn rewind(&self) -> Result<()> {
        if unsafe { sys::vx_source_rewind(self.ptr()) } != 0 {
            return Err(diag::failure(ErrorKind::Io, "rewind failed"));
        }
        Ok(())
    }

    /// Up to `len` bytes from the start, left in place for the next reader.
    pub fn sniff(&self, len: usize) -> Result<Vec<u8>> {
        let mut got = 0usize;
        let data = unsafe { sys::vx_source_sniff(self.ptr(), len, &mut got) };
        if data.is_null() {
            return Err(diag::failure(ErrorKind::Io, "sniff failed"));
        }
        Ok(unsafe { std::slice::from_raw_parts(data, got) }.to_vec())
    }

    /// The whole stream as one slice, valid as long as the source.
    pub fn map(&self) -> Result<&[u8]> {
        let mut len = 0usize;
        let data = unsafe { sys::vx_source_map(self.ptr(), &mut len) };
        if data.is_null() {
            return Err(diag::failure(ErrorKind::Io, "map failed"));
        }
        Ok(unsafe { std::slice::from_raw_parts(data, len) })
    }

    pub fn length(&self) -> Result<u64> {
        let len = unsafe { sys::vx_source_length(self.ptr()) };
        u64::try_from(len).map_err(|_| diag::failure(ErrorKind::Io, "length unavailable"))
    }

    pub fn is_mappable(&self) -> bool {
        unsafe { sys::vx_source_is_mappable(self.ptr()) != 0 }
    }

    pub fn is_file(&self) -> bool {
        unsafe { sys::vx_source_is_file(self.ptr()) != 0 }
    }

    pub fn filename(&self) -> Option<String> {
        let name = unsafe { sys::vx_source_filename(self.ptr()) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    /// Nickname of the loader that recognizes this stream. Sniffed bytes stay readable.
    pub fn find_loader(&self) -> Result<String> {
        let name = unsafe { sys::vx_foreign_find_load_source(self.ptr()) };
        if name.is_null() {
            return Err(diag::failure(ErrorKind::OperationFailed, "no loader for source"));
        }
        Ok(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
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

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("filename", &self.filename())
            .field("custom", &self.inner._bridge.is_some())
            .finish()
    }
}

/// A source whose bytes come from host closures.
///
/// Closures run on engine threads under the bridge's lock. A closure must not
/// call `on_read` or `on_seek` on its own source: that fails the running
/// callback instead of replacing anything.
pub struct SourceCustom {
    bridge: Arc<Bridge<StreamCallbacks>>,
    source: Source,
}

impl SourceCustom {
    pub fn new() -> Result<Self> {
        let object = adopt(sys::vx_source_custom_new(), "unable to create custom source")?;
        let bridge = Arc::new(Bridge::new(&object, StreamCallbacks::default()));
        let source = Source::wrap(Some(bridge.clone() as KeepAlive), object, Vec::new());
        Ok(SourceCustom { bridge, source })
    }

    /// Serve reads from `reader`. Seeking is unsupported, so the engine treats it as a pipe.
    pub fn from_reader<R: Read + Send + 'static>(mut reader: R) -> Result<Self> {
        let source = SourceCustom::new()?;
        source.on_read(move |buf| reader.read(buf));
        Ok(source)
    }

    /// `f` fills the buffer and returns the byte count; zero means end of stream.
    pub fn on_read<F>(&self, f: F) -> &Self
    where
        F: FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.read = Some(Box::new(f)));
        self.bridge.connect(Slot::Read, |object, user| unsafe {
            sys::vx_source_custom_connect_read(object, Some(bridge::read_trampoline), user, None)
        });
        self
    }

    /// `f` moves the stream and returns the new absolute position.
    pub fn on_seek<F>(&self, f: F) -> &Self
    where
        F: FnMut(i64, Whence) -> io::Result<u64> + Send + 'static,
    {
        self.bridge.update(|callbacks| callbacks.seek = Some(Box::new(f)));
        self.bridge.connect(Slot::Seek, |object, user| unsafe {
            sys::vx_source_custom_connect_seek(object, Some(bridge::seek_trampoline), user, None)
        });
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn into_source(self) -> Source {
        self.source.clone()
    }
}

impl Deref for SourceCustom {
    type Target = Source;

    fn deref(&self) -> &Source {
        &self.source
    }
}

impl fmt::Debug for SourceCustom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceCustom").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn memory_source_reads_sniffs_and_rewinds() {
        let source = Source::from_memory(b"P5 2 1 255\n\x01\x02".to_vec()).expect("source");
        assert_eq!(source.sniff(2).expect("sniff"), b"P5");
        assert_eq!(source.length().expect("length"), 13);
        assert!(source.is_mappable());
        assert!(!source.is_file());
        assert_eq!(source.find_loader().expect("loader"), "ppmload_source");
        let all = source.read_to_end().expect("read");
        assert_eq!(all.len(), 13);
        source.rewind().expect("rewind");
        assert_eq!(source.seek(-2, Whence::End).expect("seek"), 11);
        assert_eq!(source.read_to_end().expect("tail"), b"\x01\x02");
    }

    #[test]
    fn reader_backed_source_streams_bytes() {
        let custom = SourceCustom::from_reader(Cursor::new(b"hello stream".to_vec())).expect("custom");
        assert_eq!(custom.read_to_end().expect("read"), b"hello stream");
    }
}
