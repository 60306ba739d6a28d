//! Purpose: Input byte streams the loaders read from.
//! Exports: `SourceData`, internal read/decode helpers, `vx_source_*` ABI.
//! Role: Uniform sequential reader over memory, files, descriptors and callbacks.
//! Invariants: Before decode, bytes read from a pipe are kept so the pipe can be rewound.
//! Invariants: After decode a pipe can no longer be rewound or mapped.
//! Invariants: Once mapped, a source is memory-backed for the rest of its life.
use std::ffi::{CStr, CString, c_char, c_int, c_ulong, c_void};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::fd::FromRawFd;
use std::ptr;
use std::sync::{Mutex, PoisonError};

use memmap2::Mmap;

use super::abi::{VxDestroyNotify, VxReadFn, VxSeekFn};
use super::diag;
use super::object::{Body, Callback, ObjRef, Signal, VxObject};

const DOMAIN: &str = "VipsSource";

pub(crate) struct SourceData {
    state: Mutex<SourceState>,
}

struct SourceState {
    backend: Backend,
    filename: Option<CString>,
    /// `None` until a custom source has been probed for seekability.
    is_pipe: Option<bool>,
    header: Vec<u8>,
    read_position: usize,
    decoded: bool,
    sniff: Vec<u8>,
}

enum Backend {
    Memory { area: Area, position: usize },
    Descriptor(File),
    Custom,
}

enum Area {
    Borrowed { data: *const u8, len: usize },
    Blob(ObjRef),
    Mapped(Mmap),
    Owned(Vec<u8>),
}

// Borrowed areas are read-only and kept alive by the caller.
unsafe impl Send for Area {}

impl Area {
    fn bytes(&self) -> &[u8] {
        match self {
            Area::Borrowed { data, len } => {
                if data.is_null() {
                    &[]
                } else {
                    unsafe { std::slice::from_raw_parts(*data, *len) }
                }
            }
            Area::Blob(blob) => blob.blob().map(|data| data.as_slice()).unwrap_or(&[]),
            Area::Mapped(map) => map,
            Area::Owned(bytes) => bytes,
        }
    }
}

impl SourceData {
    fn new(backend: Backend, filename: Option<CString>, is_pipe: Option<bool>) -> Self {
        SourceData {
            state: Mutex::new(SourceState {
                backend,
                filename,
                is_pipe,
                header: Vec::new(),
                read_position: 0,
                decoded: false,
                sniff: Vec::new(),
            }),
        }
    }

    fn memory(area: Area, filename: Option<CString>) -> Self {
        Self::new(Backend::Memory { area, position: 0 }, filename, Some(false))
    }
}

fn object_ptr(object: &VxObject) -> *mut VxObject {
    (object as *const VxObject).cast_mut()
}

fn emit_read(object: &VxObject, buf: &mut [u8]) -> i64 {
    let Some(emission) = object.emission(Signal::Read) else {
        return 0;
    };
    match emission.callback() {
        Callback::Read(read) => unsafe {
            read(
                object_ptr(object),
                buf.as_mut_ptr().cast(),
                buf.len() as i64,
                emission.user(),
            )
        },
        _ => -1,
    }
}

fn emit_seek(object: &VxObject, offset: i64, whence: c_int) -> i64 {
    let Some(emission) = object.emission(Signal::Seek) else {
        return -1;
    };
    match emission.callback() {
        Callback::Seek(seek) => unsafe { seek(object_ptr(object), offset, whence, emission.user()) },
        _ => -1,
    }
}

fn seek_from(offset: i64, whence: c_int) -> Result<SeekFrom, String> {
    match whence {
        libc::SEEK_SET => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| format!("bad seek to {offset}")),
        libc::SEEK_CUR => Ok(SeekFrom::Current(offset)),
        libc::SEEK_END => Ok(SeekFrom::End(offset)),
        other => Err(format!("bad whence {other}")),
    }
}

impl SourceState {
    fn is_pipe(&mut self, object: &VxObject) -> bool {
        if let Some(is_pipe) = self.is_pipe {
            return is_pipe;
        }
        let is_pipe = emit_seek(object, 0, libc::SEEK_CUR) < 0;
        self.is_pipe = Some(is_pipe);
        is_pipe
    }

    /// Read from the underlying device, ignoring the header buffer.
    fn raw_read(&mut self, object: &VxObject, buf: &mut [u8]) -> Result<usize, String> {
        match &mut self.backend {
            Backend::Memory { area, position } => {
                let bytes = area.bytes();
                let available = bytes.len().saturating_sub(*position);
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&bytes[*position..*position + n]);
                *position += n;
                Ok(n)
            }
            Backend::Descriptor(file) => loop {
                match file.read(buf) {
                    Ok(n) => break Ok(n),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => break Err(format!("read error ({err})")),
                }
            },
            Backend::Custom => {
                let n = emit_read(object, buf);
                usize::try_from(n).map_err(|_| "read error".to_string())
            }
        }
    }

    fn read(&mut self, object: &VxObject, buf: &mut [u8]) -> Result<usize, String> {
        if matches!(self.backend, Backend::Memory { .. }) || !self.is_pipe(object) {
            return self.raw_read(object, buf);
        }
        if self.read_position < self.header.len() {
            let pending = &self.header[self.read_position..];
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            self.read_position += n;
            return Ok(n);
        }
        let n = self.raw_read(object, buf)?;
        if !self.decoded {
            self.header.extend_from_slice(&buf[..n]);
            self.read_position += n;
        }
        Ok(n)
    }

    fn seek(&mut self, object: &VxObject, offset: i64, whence: c_int) -> Result<i64, String> {
        if matches!(self.backend, Backend::Custom) {
            if self.is_pipe(object) {
                return Err("not seekable".to_string());
            }
            let position = emit_seek(object, offset, whence);
            if position < 0 {
                return Err("seek error".to_string());
            }
            return Ok(position);
        }
        let seekable = self.is_pipe == Some(false);
        match &mut self.backend {
            Backend::Memory { area, position } => {
                let len = area.bytes().len() as i64;
                let base = match whence {
                    libc::SEEK_SET => 0,
                    libc::SEEK_CUR => *position as i64,
                    libc::SEEK_END => len,
                    other => return Err(format!("bad whence {other}")),
                };
                let target = base + offset;
                if target < 0 || target > len {
                    return Err(format!("bad seek to {target}"));
                }
                *position = target as usize;
                Ok(target)
            }
            Backend::Descriptor(file) if seekable => {
                let position = file
                    .seek(seek_from(offset, whence)?)
                    .map_err(|err| format!("seek error ({err})"))?;
                Ok(position as i64)
            }
            _ => Err("not seekable".to_string()),
        }
    }

    fn rewind(&mut self, object: &VxObject) -> Result<(), String> {
        let memory = matches!(self.backend, Backend::Memory { .. });
        if !memory && self.is_pipe(object) {
            if self.decoded {
                return Err("pipe has been decoded, cannot rewind".to_string());
            }
            self.read_position = 0;
            return Ok(());
        }
        self.seek(object, 0, libc::SEEK_SET).map(|_| ())
    }

    fn sniff(&mut self, object: &VxObject, length: usize) -> Result<&[u8], String> {
        self.rewind(object)?;
        let mut sniff = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = self.read(object, &mut sniff[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        sniff.truncate(filled);
        self.rewind(object)?;
        self.sniff = sniff;
        Ok(&self.sniff)
    }

    fn is_mappable(&self) -> bool {
        match &self.backend {
            Backend::Memory { .. } => true,
            Backend::Descriptor(file) => file.metadata().map(|meta| meta.is_file()).unwrap_or(false),
            Backend::Custom => false,
        }
    }

    /// Switch to a memory backend holding the whole stream.
    fn map(&mut self, object: &VxObject) -> Result<&[u8], String> {
        if !matches!(self.backend, Backend::Memory { .. }) {
            let mapped = match &self.backend {
                Backend::Descriptor(file) if self.is_mappable() => Some(
                    unsafe { Mmap::map(file) }.map_err(|err| format!("unable to map ({err})"))?,
                ),
                _ => None,
            };
            let area = match mapped {
                Some(map) => Area::Mapped(map),
                None => {
                    self.rewind(object)?;
                    let mut bytes = Vec::new();
                    let mut chunk = vec![0u8; 64 * 1024];
                    loop {
                        let n = self.read(object, &mut chunk)?;
                        if n == 0 {
                            break;
                        }
                        bytes.extend_from_slice(&chunk[..n]);
                    }
                    Area::Owned(bytes)
                }
            };
            self.backend = Backend::Memory { area, position: 0 };
            self.is_pipe = Some(false);
            self.header = Vec::new();
            self.read_position = 0;
        }
        match &self.backend {
            Backend::Memory { area, .. } => Ok(area.bytes()),
            _ => Err("unable to map".to_string()),
        }
    }

    fn length(&mut self, object: &VxObject) -> Result<i64, String> {
        match &self.backend {
            Backend::Memory { area, .. } => return Ok(area.bytes().len() as i64),
            Backend::Descriptor(file) if self.is_mappable() => {
                return file
                    .metadata()
                    .map(|meta| meta.len() as i64)
                    .map_err(|err| format!("unable to stat ({err})"));
            }
            _ => {}
        }
        if !self.is_pipe(object) {
            let current = self.seek(object, 0, libc::SEEK_CUR)?;
            let end = self.seek(object, 0, libc::SEEK_END)?;
            self.seek(object, current, libc::SEEK_SET)?;
            return Ok(end);
        }
        self.map(object).map(|bytes| bytes.len() as i64)
    }
}

fn with_state<R>(
    object: &VxObject,
    f: impl FnOnce(&mut SourceState) -> Result<R, String>,
) -> Result<R, String> {
    let Some(data) = object.source() else {
        return Err("object is not a source".to_string());
    };
    let mut state = data.state.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut state)
}

pub(crate) fn read(object: &VxObject, buf: &mut [u8]) -> Result<usize, String> {
    with_state(object, |state| state.read(object, buf))
}

/// Mark the header as consumed; a pipe stops keeping its bytes.
pub(crate) fn decode(object: &VxObject) {
    let _ = with_state(object, |state| {
        state.decoded = true;
        Ok(())
    });
}

pub(crate) fn sniff(object: &VxObject, length: usize) -> Result<Vec<u8>, String> {
    with_state(object, |state| state.sniff(object, length).map(<[u8]>::to_vec))
}

pub(crate) fn filename(object: &VxObject) -> Option<String> {
    with_state(object, |state| {
        Ok(state
            .filename
            .as_ref()
            .map(|name| name.to_string_lossy().into_owned()))
    })
    .ok()
    .flatten()
}

pub(crate) fn open_file(path: &str) -> Result<ObjRef, String> {
    let file = File::open(path).map_err(|err| format!("unable to open \"{path}\" ({err})"))?;
    let len = file
        .metadata()
        .map_err(|err| format!("unable to stat \"{path}\" ({err})"))?
        .len();
    let area = if len == 0 {
        Area::Owned(Vec::new())
    } else {
        let map = unsafe { Mmap::map(&file) }
            .map_err(|err| format!("unable to map \"{path}\" ({err})"))?;
        Area::Mapped(map)
    };
    let filename = CString::new(path).ok();
    Ok(VxObject::create(Body::Source(SourceData::memory(area, filename))))
}

pub(crate) fn from_blob(blob: ObjRef) -> ObjRef {
    VxObject::create(Body::Source(SourceData::memory(Area::Blob(blob), None)))
}

fn source_ref<'a>(object: *mut VxObject, caller: &str) -> Option<&'a VxObject> {
    let object = unsafe { object.as_ref() }.filter(|object| object.source().is_some());
    if object.is_none() {
        diag::critical(format_args!(
            "{caller}: assertion 'VIPS_IS_SOURCE (source)' failed"
        ));
    }
    object
}

fn report<R>(result: Result<R, String>, fallback: R) -> R {
    result.unwrap_or_else(|message| {
        diag::error(DOMAIN, message);
        fallback
    })
}

/// # Safety
/// `filename` must be a valid C string.
pub unsafe extern "C" fn vx_source_new_from_file(filename: *const c_char) -> *mut VxObject {
    if filename.is_null() {
        diag::error(DOMAIN, "no filename");
        return ptr::null_mut();
    }
    let path = unsafe { CStr::from_ptr(filename) }.to_string_lossy();
    report(open_file(&path).map(ObjRef::into_raw), ptr::null_mut())
}

/// Reads from a duplicate of `descriptor`; the caller keeps ownership of the original.
pub extern "C" fn vx_source_new_from_descriptor(descriptor: c_int) -> *mut VxObject {
    let duplicate = unsafe { libc::dup(descriptor) };
    if duplicate < 0 {
        diag::error(
            DOMAIN,
            format_args!(
                "unable to dup descriptor {descriptor} ({})",
                std::io::Error::last_os_error()
            ),
        );
        return ptr::null_mut();
    }
    let mut file = unsafe { File::from_raw_fd(duplicate) };
    let seekable = file.stream_position().is_ok();
    let data = SourceData::new(Backend::Descriptor(file), None, Some(!seekable));
    VxObject::create(Body::Source(data)).into_raw()
}

/// Reads `len` bytes at `data` in place. The caller keeps them alive.
///
/// # Safety
/// `data` must point at `len` readable bytes for the life of the source.
pub unsafe extern "C" fn vx_source_new_from_memory(data: *const c_void, len: usize) -> *mut VxObject {
    let area = Area::Borrowed {
        data: data.cast(),
        len: if data.is_null() { 0 } else { len },
    };
    VxObject::create(Body::Source(SourceData::memory(area, None))).into_raw()
}

/// # Safety
/// `blob` must be a live blob.
pub unsafe extern "C" fn vx_source_new_from_blob(blob: *mut VxObject) -> *mut VxObject {
    match unsafe { ObjRef::borrow(blob) }.filter(|blob| blob.blob().is_some()) {
        Some(blob) => from_blob(blob).into_raw(),
        None => {
            diag::error(DOMAIN, "not a blob");
            ptr::null_mut()
        }
    }
}

/// A source whose bytes come from connected `read` and `seek` handlers.
pub extern "C" fn vx_source_custom_new() -> *mut VxObject {
    VxObject::create(Body::Source(SourceData::new(Backend::Custom, None, None))).into_raw()
}

/// # Safety
/// `source` must be a live source; `user` must stay valid until `destroy` runs.
pub unsafe extern "C" fn vx_source_custom_connect_read(
    source: *mut VxObject,
    func: Option<VxReadFn>,
    user: *mut c_void,
    destroy: Option<VxDestroyNotify>,
) -> c_ulong {
    match (source_ref(source, "vx_source_custom_connect_read"), func) {
        (Some(object), Some(func)) => object.connect(Callback::Read(func), user, destroy),
        _ => 0,
    }
}

/// # Safety
/// `source` must be a live source; `user` must stay valid until `destroy` runs.
pub unsafe extern "C" fn vx_source_custom_connect_seek(
    source: *mut VxObject,
    func: Option<VxSeekFn>,
    user: *mut c_void,
    destroy: Option<VxDestroyNotify>,
) -> c_ulong {
    match (source_ref(source, "vx_source_custom_connect_seek"), func) {
        (Some(object), Some(func)) => object.connect(Callback::Seek(func), user, destroy),
        _ => 0,
    }
}

/// Bytes read, 0 at end of stream, -1 on error.
///
/// # Safety
/// `source` must be a live source; `buf` must hold `len` writable bytes.
pub unsafe extern "C" fn vx_source_read(source: *mut VxObject, buf: *mut c_void, len: usize) -> i64 {
    let Some(object) = source_ref(source, "vx_source_read") else {
        return -1;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    let buf = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len) };
    report(read(object, buf).map(|n| n as i64), -1)
}

/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_rewind(source: *mut VxObject) -> c_int {
    let Some(object) = source_ref(source, "vx_source_rewind") else {
        return -1;
    };
    report(with_state(object, |state| state.rewind(object)).map(|_| 0), -1)
}

/// New absolute position, or -1.
///
/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_seek(source: *mut VxObject, offset: i64, whence: c_int) -> i64 {
    let Some(object) = source_ref(source, "vx_source_seek") else {
        return -1;
    };
    report(with_state(object, |state| state.seek(object, offset, whence)), -1)
}

/// Up to `length` bytes from the start without consuming them.
/// Valid until the next call on this source.
///
/// # Safety
/// `source` must be a live source; `out_len` must be null or writable.
pub unsafe extern "C" fn vx_source_sniff(
    source: *mut VxObject,
    length: usize,
    out_len: *mut usize,
) -> *const u8 {
    let Some(object) = source_ref(source, "vx_source_sniff") else {
        return ptr::null();
    };
    let result = with_state(object, |state| {
        state
            .sniff(object, length)
            .map(|bytes| (bytes.as_ptr(), bytes.len()))
    });
    let (data, len) = report(result, (ptr::null(), 0));
    if let Some(out_len) = unsafe { out_len.as_mut() } {
        *out_len = len;
    }
    data
}

/// Whole stream as one area, valid for the life of the source.
///
/// # Safety
/// `source` must be a live source; `out_len` must be null or writable.
pub unsafe extern "C" fn vx_source_map(source: *mut VxObject, out_len: *mut usize) -> *const u8 {
    let Some(object) = source_ref(source, "vx_source_map") else {
        return ptr::null();
    };
    let result = with_state(object, |state| {
        state
            .map(object)
            .map(|bytes| (bytes.as_ptr(), bytes.len()))
    });
    let (data, len) = report(result, (ptr::null(), 0));
    if let Some(out_len) = unsafe { out_len.as_mut() } {
        *out_len = len;
    }
    data
}

/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_length(source: *mut VxObject) -> i64 {
    let Some(object) = source_ref(source, "vx_source_length") else {
        return -1;
    };
    report(with_state(object, |state| state.length(object)), -1)
}

/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_is_mappable(source: *mut VxObject) -> c_int {
    source_ref(source, "vx_source_is_mappable")
        .and_then(|object| with_state(object, |state| Ok(state.is_mappable())).ok())
        .map(c_int::from)
        .unwrap_or(0)
}

/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_is_file(source: *mut VxObject) -> c_int {
    source_ref(source, "vx_source_is_file")
        .map(|object| c_int::from(filename(object).is_some()))
        .unwrap_or(0)
}

/// Borrowed; null when the source has no filename.
///
/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_filename(source: *mut VxObject) -> *const c_char {
    source_ref(source, "vx_source_filename")
        .and_then(|object| {
            with_state(object, |state| {
                Ok(state
                    .filename
                    .as_deref()
                    .map(CStr::as_ptr)
                    .unwrap_or(ptr::null()))
            })
            .ok()
        })
        .unwrap_or(ptr::null())
}

/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_source_decode(source: *mut VxObject) -> c_int {
    match source_ref(source, "vx_source_decode") {
        Some(object) => {
            decode(object);
            0
        }
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::object::vx_object_unref;
    use serial_test::serial;
    use std::io::Write;

    fn pipe_with(bytes: &[u8]) -> *mut VxObject {
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut writer = unsafe { File::from_raw_fd(fds[1]) };
        writer.write_all(bytes).expect("write pipe");
        drop(writer);
        let source = vx_source_new_from_descriptor(fds[0]);
        unsafe { libc::close(fds[0]) };
        source
    }

    fn read_all(source: *mut VxObject) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = unsafe { vx_source_read(source, chunk.as_mut_ptr().cast(), chunk.len()) };
            assert!(n >= 0);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n as usize]);
        }
        out
    }

    #[test]
    fn pipe_rewinds_before_decode() {
        let source = pipe_with(b"P5 header and data");
        let mut len = 0;
        let sniffed = unsafe { vx_source_sniff(source, 2, &mut len) };
        assert_eq!(unsafe { std::slice::from_raw_parts(sniffed, len) }, b"P5");
        assert_eq!(read_all(source), b"P5 header and data");
        assert_eq!(unsafe { vx_source_rewind(source) }, 0);
        assert_eq!(read_all(source), b"P5 header and data");
        unsafe { vx_object_unref(source) };
    }

    #[test]
    #[serial]
    fn pipe_refuses_rewind_after_decode() {
        let source = pipe_with(b"abcdef");
        let mut chunk = [0u8; 2];
        unsafe { vx_source_read(source, chunk.as_mut_ptr().cast(), 2) };
        assert_eq!(unsafe { vx_source_decode(source) }, 0);
        assert_eq!(unsafe { vx_source_rewind(source) }, -1);
        assert_eq!(read_all(source), b"cdef");
        unsafe { vx_object_unref(source) };
        crate::engine::abi::vx_error_clear();
    }

    #[test]
    fn pipe_map_reads_everything() {
        let source = pipe_with(b"0123456789");
        assert_eq!(unsafe { vx_source_is_mappable(source) }, 0);
        let mut len = 0;
        let data = unsafe { vx_source_map(source, &mut len) };
        assert_eq!(unsafe { std::slice::from_raw_parts(data, len) }, b"0123456789");
        assert_eq!(unsafe { vx_source_length(source) }, 10);
        assert_eq!(unsafe { vx_source_seek(source, 4, libc::SEEK_SET) }, 4);
        assert_eq!(read_all(source), b"456789");
        unsafe { vx_object_unref(source) };
    }

    #[test]
    fn memory_source_seeks() {
        let bytes = b"hello world".to_vec();
        let source = unsafe { vx_source_new_from_memory(bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(unsafe { vx_source_seek(source, -5, libc::SEEK_END) }, 6);
        assert_eq!(read_all(source), b"world");
        assert_eq!(unsafe { vx_source_is_file(source) }, 0);
        unsafe { vx_object_unref(source) };
    }
}
