//! Purpose: Output byte streams the savers write to.
//! Exports: `TargetData`, internal write/end helpers, `vx_target_*` ABI.
//! Role: Buffered writer over memory, files, descriptors and callbacks.
//! Invariants: Buffered bytes are flushed in a loop; a device that accepts zero bytes fails.
//! Invariants: `end` runs once; custom targets emit `end`, or `finish` when `end` is unhandled.
use std::ffi::{CStr, c_char, c_int, c_ulong, c_void};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::fd::FromRawFd;
use std::ptr;
use std::sync::{Mutex, PoisonError};

use super::abi::{VxBuf, VxDestroyNotify, VxEndFn, VxFinishFn, VxReadFn, VxSeekFn, VxWriteFn};
use super::diag;
use super::object::{Body, Callback, ObjRef, Signal, VxObject};

const DOMAIN: &str = "VipsTarget";
const BUFFER_SIZE: usize = 8192;

pub(crate) struct TargetData {
    state: Mutex<TargetState>,
}

struct TargetState {
    backend: Backend,
    buffer: Vec<u8>,
    ended: bool,
}

enum Backend {
    Memory { bytes: Vec<u8>, position: usize },
    File(File),
    Custom,
}

impl TargetData {
    fn new(backend: Backend) -> Self {
        TargetData {
            state: Mutex::new(TargetState {
                backend,
                buffer: Vec::with_capacity(BUFFER_SIZE),
                ended: false,
            }),
        }
    }
}

fn object_ptr(object: &VxObject) -> *mut VxObject {
    (object as *const VxObject).cast_mut()
}

fn emit_write(object: &VxObject, data: &[u8]) -> i64 {
    let Some(emission) = object.emission(Signal::Write) else {
        return 0;
    };
    match emission.callback() {
        Callback::Write(write) => unsafe {
            write(
                object_ptr(object),
                data.as_ptr().cast(),
                data.len() as i64,
                emission.user(),
            )
        },
        _ => -1,
    }
}

fn emit_read(object: &VxObject, buf: &mut [u8]) -> i64 {
    let Some(emission) = object.emission(Signal::Read) else {
        return -1;
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

/// Emit `end`, falling back to `finish`. Returns the `end` result, or 0.
fn emit_end(object: &VxObject) -> c_int {
    if let Some(emission) = object.emission(Signal::End) {
        if let Callback::End(end) = emission.callback() {
            return unsafe { end(object_ptr(object), emission.user()) };
        }
    }
    if let Some(emission) = object.emission(Signal::Finish) {
        if let Callback::Finish(finish) = emission.callback() {
            unsafe { finish(object_ptr(object), emission.user()) };
        }
    }
    0
}

impl TargetState {
    fn raw_write(&mut self, object: &VxObject, data: &[u8]) -> Result<usize, String> {
        match &mut self.backend {
            Backend::Memory { bytes, position } => {
                let end = *position + data.len();
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[*position..end].copy_from_slice(data);
                *position = end;
                Ok(data.len())
            }
            Backend::File(file) => loop {
                match file.write(data) {
                    Ok(n) => break Ok(n),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => break Err(format!("write error ({err})")),
                }
            },
            Backend::Custom => {
                let n = emit_write(object, data);
                Ok(usize::try_from(n).unwrap_or(0))
            }
        }
    }

    /// Offer every buffered byte to the device, retrying short writes.
    fn flush(&mut self, object: &VxObject) -> Result<(), String> {
        let pending = std::mem::take(&mut self.buffer);
        let mut offset = 0;
        let result = loop {
            if offset >= pending.len() {
                break Ok(());
            }
            match self.raw_write(object, &pending[offset..]) {
                Ok(0) => break Err("write failed".to_string()),
                Ok(n) => offset += n.min(pending.len() - offset),
                Err(message) => break Err(message),
            }
        };
        self.buffer = pending;
        self.buffer.clear();
        result
    }

    fn write(&mut self, object: &VxObject, data: &[u8]) -> Result<(), String> {
        if self.ended {
            return Err("write after end".to_string());
        }
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= BUFFER_SIZE {
            self.flush(object)?;
        }
        Ok(())
    }

    fn end(&mut self, object: &VxObject) -> Result<(), String> {
        if self.ended {
            return Ok(());
        }
        let flushed = self.flush(object);
        self.ended = true;
        match &mut self.backend {
            Backend::Memory { .. } => {}
            Backend::File(file) => file
                .flush()
                .map_err(|err| format!("unable to flush ({err})"))?,
            Backend::Custom => {
                if emit_end(object) != 0 {
                    return Err("end failed".to_string());
                }
            }
        }
        flushed
    }

    fn read(&mut self, object: &VxObject, buf: &mut [u8]) -> Result<usize, String> {
        self.flush(object)?;
        match &mut self.backend {
            Backend::Memory { bytes, position } => {
                let available = bytes.len().saturating_sub(*position);
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&bytes[*position..*position + n]);
                *position += n;
                Ok(n)
            }
            Backend::File(file) => file
                .read(buf)
                .map_err(|err| format!("read error ({err})")),
            Backend::Custom => {
                usize::try_from(emit_read(object, buf)).map_err(|_| "read error".to_string())
            }
        }
    }

    fn seek(&mut self, object: &VxObject, offset: i64, whence: c_int) -> Result<i64, String> {
        self.flush(object)?;
        match &mut self.backend {
            Backend::Memory { bytes, position } => {
                let base = match whence {
                    libc::SEEK_SET => 0,
                    libc::SEEK_CUR => *position as i64,
                    libc::SEEK_END => bytes.len() as i64,
                    other => return Err(format!("bad whence {other}")),
                };
                let target = base + offset;
                if target < 0 {
                    return Err(format!("bad seek to {target}"));
                }
                *position = target as usize;
                Ok(target)
            }
            Backend::File(file) => {
                let from = match whence {
                    libc::SEEK_SET => SeekFrom::Start(offset.max(0) as u64),
                    libc::SEEK_CUR => SeekFrom::Current(offset),
                    libc::SEEK_END => SeekFrom::End(offset),
                    other => return Err(format!("bad whence {other}")),
                };
                file.seek(from)
                    .map(|position| position as i64)
                    .map_err(|err| format!("seek error ({err})"))
            }
            Backend::Custom => {
                let position = emit_seek(object, offset, whence);
                if position < 0 {
                    return Err("seek error".to_string());
                }
                Ok(position)
            }
        }
    }

    fn steal(&mut self, object: &VxObject) -> Result<Vec<u8>, String> {
        if !matches!(self.backend, Backend::Memory { .. }) {
            return Err("not a memory target".to_string());
        }
        self.end(object)?;
        match &mut self.backend {
            Backend::Memory { bytes, position } => {
                *position = 0;
                Ok(std::mem::take(bytes))
            }
            _ => Err("not a memory target".to_string()),
        }
    }
}

fn with_state<R>(
    object: &VxObject,
    f: impl FnOnce(&mut TargetState) -> Result<R, String>,
) -> Result<R, String> {
    let Some(data) = object.target() else {
        return Err("object is not a target".to_string());
    };
    let mut state = data.state.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut state)
}

pub(crate) fn write(object: &VxObject, data: &[u8]) -> Result<(), String> {
    with_state(object, |state| state.write(object, data))
}

pub(crate) fn end(object: &VxObject) -> Result<(), String> {
    with_state(object, |state| state.end(object))
}

pub(crate) fn steal(object: &VxObject) -> Result<Vec<u8>, String> {
    with_state(object, |state| state.steal(object))
}

pub(crate) fn to_memory() -> ObjRef {
    VxObject::create(Body::Target(TargetData::new(Backend::Memory {
        bytes: Vec::new(),
        position: 0,
    })))
}

pub(crate) fn to_file(path: &str) -> Result<ObjRef, String> {
    let file = File::create(path).map_err(|err| format!("unable to open \"{path}\" ({err})"))?;
    Ok(VxObject::create(Body::Target(TargetData::new(Backend::File(file)))))
}

fn target_ref<'a>(object: *mut VxObject, caller: &str) -> Option<&'a VxObject> {
    let object = unsafe { object.as_ref() }.filter(|object| object.target().is_some());
    if object.is_none() {
        diag::critical(format_args!(
            "{caller}: assertion 'VIPS_IS_TARGET (target)' failed"
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

pub extern "C" fn vx_target_new_to_memory() -> *mut VxObject {
    to_memory().into_raw()
}

/// # Safety
/// `filename` must be a valid C string.
pub unsafe extern "C" fn vx_target_new_to_file(filename: *const c_char) -> *mut VxObject {
    if filename.is_null() {
        diag::error(DOMAIN, "no filename");
        return ptr::null_mut();
    }
    let path = unsafe { CStr::from_ptr(filename) }.to_string_lossy();
    report(to_file(&path).map(ObjRef::into_raw), ptr::null_mut())
}

/// Writes to a duplicate of `descriptor`; the caller keeps ownership of the original.
pub extern "C" fn vx_target_new_to_descriptor(descriptor: c_int) -> *mut VxObject {
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
    let file = unsafe { File::from_raw_fd(duplicate) };
    VxObject::create(Body::Target(TargetData::new(Backend::File(file)))).into_raw()
}

pub extern "C" fn vx_target_custom_new() -> *mut VxObject {
    VxObject::create(Body::Target(TargetData::new(Backend::Custom))).into_raw()
}

macro_rules! connect_fn {
    ($name:ident, $fn_ty:ty, $variant:ident) => {
        /// # Safety
        /// `target` must be a live target; `user` must stay valid until `destroy` runs.
                pub unsafe extern "C" fn $name(
            target: *mut VxObject,
            func: Option<$fn_ty>,
            user: *mut c_void,
            destroy: Option<VxDestroyNotify>,
        ) -> c_ulong {
            match (target_ref(target, stringify!($name)), func) {
                (Some(object), Some(func)) => object.connect(Callback::$variant(func), user, destroy),
                _ => 0,
            }
        }
    };
}

connect_fn!(vx_target_custom_connect_write, VxWriteFn, Write);
connect_fn!(vx_target_custom_connect_read, VxReadFn, Read);
connect_fn!(vx_target_custom_connect_seek, VxSeekFn, Seek);
connect_fn!(vx_target_custom_connect_end, VxEndFn, End);
connect_fn!(vx_target_custom_connect_finish, VxFinishFn, Finish);

/// Returns 0 on success.
///
/// # Safety
/// `target` must be a live target; `data` must hold `len` readable bytes.
pub unsafe extern "C" fn vx_target_write(target: *mut VxObject, data: *const c_void, len: usize) -> c_int {
    let Some(object) = target_ref(target, "vx_target_write") else {
        return -1;
    };
    let data = if data.is_null() || len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }
    };
    report(write(object, data).map(|_| 0), -1)
}

/// # Safety
/// `target` must be a live target; `text` must be a C string.
pub unsafe extern "C" fn vx_target_writes(target: *mut VxObject, text: *const c_char) -> c_int {
    if text.is_null() {
        return -1;
    }
    let bytes = unsafe { CStr::from_ptr(text) }.to_bytes();
    unsafe { vx_target_write(target, bytes.as_ptr().cast(), bytes.len()) }
}

/// # Safety
/// `target` must be a live target.
pub unsafe extern "C" fn vx_target_putc(target: *mut VxObject, ch: c_int) -> c_int {
    let byte = ch as u8;
    unsafe { vx_target_write(target, (&byte as *const u8).cast(), 1) }
}

/// Flush and close the target. Later calls are no-ops. Returns 0 on success.
///
/// # Safety
/// `target` must be a live target.
pub unsafe extern "C" fn vx_target_end(target: *mut VxObject) -> c_int {
    let Some(object) = target_ref(target, "vx_target_end") else {
        return -1;
    };
    report(end(object).map(|_| 0), -1)
}

/// End a memory target and move its bytes into `out` (free with `vx_buf_free`).
///
/// # Safety
/// `target` must be a live target; `out` must be writable.
pub unsafe extern "C" fn vx_target_steal(target: *mut VxObject, out: *mut VxBuf) -> c_int {
    let (Some(object), Some(out)) = (target_ref(target, "vx_target_steal"), unsafe { out.as_mut() })
    else {
        return -1;
    };
    match steal(object) {
        Ok(bytes) => {
            let bytes = bytes.into_boxed_slice();
            out.len = bytes.len();
            out.data = Box::into_raw(bytes).cast();
            0
        }
        Err(message) => {
            diag::error(DOMAIN, message);
            -1
        }
    }
}

/// Bytes read back from the target, or -1.
///
/// # Safety
/// `target` must be a live target; `buf` must hold `len` writable bytes.
pub unsafe extern "C" fn vx_target_read(target: *mut VxObject, buf: *mut c_void, len: usize) -> i64 {
    let Some(object) = target_ref(target, "vx_target_read") else {
        return -1;
    };
    if buf.is_null() || len == 0 {
        return 0;
    }
    let buf = unsafe { std::slice::from_raw_parts_mut(buf.cast::<u8>(), len) };
    report(
        with_state(object, |state| state.read(object, buf)).map(|n| n as i64),
        -1,
    )
}

/// # Safety
/// `target` must be a live target.
pub unsafe extern "C" fn vx_target_seek(target: *mut VxObject, offset: i64, whence: c_int) -> i64 {
    let Some(object) = target_ref(target, "vx_target_seek") else {
        return -1;
    };
    report(with_state(object, |state| state.seek(object, offset, whence)), -1)
}

/// # Safety
/// `target` must be a live target.
pub unsafe extern "C" fn vx_target_is_memory(target: *mut VxObject) -> c_int {
    target_ref(target, "vx_target_is_memory")
        .and_then(|object| {
            with_state(object, |state| {
                Ok(matches!(state.backend, Backend::Memory { .. }))
            })
            .ok()
        })
        .map(c_int::from)
        .unwrap_or(0)
}

/// # Safety
/// `target` must be a live target.
pub unsafe extern "C" fn vx_target_is_ended(target: *mut VxObject) -> c_int {
    target_ref(target, "vx_target_is_ended")
        .and_then(|object| with_state(object, |state| Ok(state.ended)).ok())
        .map(c_int::from)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::diag::vx_buf_free;
    use crate::engine::object::vx_object_unref;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn memory_target_collects_writes() {
        let target = vx_target_new_to_memory();
        let big = vec![7u8; BUFFER_SIZE + 10];
        unsafe {
            assert_eq!(vx_target_writes(target, c"P5\n".as_ptr()), 0);
            assert_eq!(vx_target_putc(target, b'x' as c_int), 0);
            assert_eq!(vx_target_write(target, big.as_ptr().cast(), big.len()), 0);
        }
        let mut out = VxBuf {
            data: ptr::null_mut(),
            len: 0,
        };
        assert_eq!(unsafe { vx_target_steal(target, &mut out) }, 0);
        let bytes = unsafe { std::slice::from_raw_parts(out.data, out.len) }.to_vec();
        unsafe { vx_buf_free(out) };
        assert_eq!(&bytes[..4], b"P5\nx");
        assert_eq!(bytes.len(), 4 + big.len());
        assert_eq!(unsafe { vx_target_is_ended(target) }, 1);
        unsafe { vx_object_unref(target) };
    }

    struct Sink {
        bytes: Mutex<Vec<u8>>,
        finished: AtomicUsize,
    }

    unsafe extern "C" fn short_write(
        _object: *mut VxObject,
        data: *const c_void,
        len: i64,
        user: *mut c_void,
    ) -> i64 {
        let sink = unsafe { &*user.cast::<Sink>() };
        let take = len.min(5) as usize;
        let data = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), take) };
        sink.bytes.lock().expect("lock").extend_from_slice(data);
        take as i64
    }

    unsafe extern "C" fn finish(_object: *mut VxObject, user: *mut c_void) {
        let sink = unsafe { &*user.cast::<Sink>() };
        sink.finished.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn custom_target_retries_short_writes_and_finishes_once() {
        let sink = Sink {
            bytes: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        };
        let user = (&sink as *const Sink).cast_mut().cast();
        let target = vx_target_custom_new();
        unsafe {
            vx_target_custom_connect_write(target, Some(short_write), user, None);
            vx_target_custom_connect_finish(target, Some(finish), user, None);
            assert_eq!(vx_target_writes(target, c"hello custom target".as_ptr()), 0);
            assert_eq!(vx_target_end(target), 0);
            assert_eq!(vx_target_end(target), 0);
            vx_object_unref(target);
        }
        assert_eq!(&*sink.bytes.lock().expect("lock"), b"hello custom target");
        assert_eq!(sink.finished.load(Ordering::SeqCst), 1);
    }
}
