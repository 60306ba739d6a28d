//! Purpose: Image objects with lazily evaluated pixel data.
//! Exports: `ImageData`, `BandFormat`, `Pixels`, `checked_samples`, `vx_image_*`.
//! Role: Headers are fixed at construction; samples are pulled on demand.
//! Invariants: Derived pixels are computed at most once per successful pull.
//! Invariants: Borrowed memory is never written and never freed by the engine.
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use super::abi::VxBuf;
use super::diag;
use super::lifecycle;
use super::object::{Body, ObjRef, VxObject};

/// Below this many samples encoding stays on the calling thread.
const PARALLEL_THRESHOLD: usize = 1 << 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(i32)]
pub(crate) enum BandFormat {
    Uchar = 0,
    Char = 1,
    Ushort = 2,
    Short = 3,
    Uint = 4,
    Int = 5,
    Float = 6,
    Double = 8,
}

impl BandFormat {
    pub(crate) const ALL: [BandFormat; 8] = [
        BandFormat::Uchar,
        BandFormat::Char,
        BandFormat::Ushort,
        BandFormat::Short,
        BandFormat::Uint,
        BandFormat::Int,
        BandFormat::Float,
        BandFormat::Double,
    ];

    pub(crate) fn from_raw(raw: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|format| *format as i32 == raw)
    }

    pub(crate) fn nick(self) -> &'static str {
        match self {
            BandFormat::Uchar => "uchar",
            BandFormat::Char => "char",
            BandFormat::Ushort => "ushort",
            BandFormat::Short => "short",
            BandFormat::Uint => "uint",
            BandFormat::Int => "int",
            BandFormat::Float => "float",
            BandFormat::Double => "double",
        }
    }

    pub(crate) fn size(self) -> usize {
        match self {
            BandFormat::Uchar | BandFormat::Char => 1,
            BandFormat::Ushort | BandFormat::Short => 2,
            BandFormat::Uint | BandFormat::Int | BandFormat::Float => 4,
            BandFormat::Double => 8,
        }
    }

    /// Largest value of an unsigned format.
    pub(crate) fn unsigned_max(self) -> Option<f64> {
        match self {
            BandFormat::Uchar => Some(f64::from(u8::MAX)),
            BandFormat::Ushort => Some(f64::from(u16::MAX)),
            BandFormat::Uint => Some(f64::from(u32::MAX)),
            _ => None,
        }
    }

    /// Round and clamp into the range this format can hold.
    pub(crate) fn clip(self, value: f64) -> f64 {
        match self {
            BandFormat::Uchar => clamp_round(value, 0.0, 255.0),
            BandFormat::Char => clamp_round(value, -128.0, 127.0),
            BandFormat::Ushort => clamp_round(value, 0.0, 65535.0),
            BandFormat::Short => clamp_round(value, -32768.0, 32767.0),
            BandFormat::Uint => clamp_round(value, 0.0, f64::from(u32::MAX)),
            BandFormat::Int => clamp_round(value, f64::from(i32::MIN), f64::from(i32::MAX)),
            BandFormat::Float => f64::from(value as f32),
            BandFormat::Double => value,
        }
    }

    fn encode_into(self, value: f64, out: &mut [u8]) {
        match self {
            BandFormat::Uchar => out.copy_from_slice(&[clamp_round(value, 0.0, 255.0) as u8]),
            BandFormat::Char => {
                out.copy_from_slice(&(clamp_round(value, -128.0, 127.0) as i8).to_ne_bytes())
            }
            BandFormat::Ushort => {
                out.copy_from_slice(&(clamp_round(value, 0.0, 65535.0) as u16).to_ne_bytes())
            }
            BandFormat::Short => out
                .copy_from_slice(&(clamp_round(value, -32768.0, 32767.0) as i16).to_ne_bytes()),
            BandFormat::Uint => out.copy_from_slice(
                &(clamp_round(value, 0.0, f64::from(u32::MAX)) as u32).to_ne_bytes(),
            ),
            BandFormat::Int => out.copy_from_slice(
                &(clamp_round(value, f64::from(i32::MIN), f64::from(i32::MAX)) as i32)
                    .to_ne_bytes(),
            ),
            BandFormat::Float => out.copy_from_slice(&(value as f32).to_ne_bytes()),
            BandFormat::Double => out.copy_from_slice(&value.to_ne_bytes()),
        }
    }

    fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            BandFormat::Uchar => f64::from(bytes[0]),
            BandFormat::Char => f64::from(bytes[0] as i8),
            BandFormat::Ushort => f64::from(u16::from_ne_bytes([bytes[0], bytes[1]])),
            BandFormat::Short => f64::from(i16::from_ne_bytes([bytes[0], bytes[1]])),
            BandFormat::Uint => {
                f64::from(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            BandFormat::Int => {
                f64::from(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            BandFormat::Float => {
                f64::from(f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            BandFormat::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_ne_bytes(raw)
            }
        }
    }
}

fn clamp_round(value: f64, low: f64, high: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.round().clamp(low, high)
}

pub(crate) type Eval = Box<dyn Fn() -> Result<Vec<f64>, String> + Send + Sync>;

pub(crate) enum Pixels {
    Memory(Vec<u8>),
    Borrowed { data: *const u8, len: usize },
    Derived(Eval),
}

// Borrowed areas are read-only and kept alive by the caller.
unsafe impl Send for Pixels {}
unsafe impl Sync for Pixels {}

pub(crate) struct ImageData {
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) bands: usize,
    pub(crate) format: BandFormat,
    pub(crate) xres: f64,
    pub(crate) yres: f64,
    pub(crate) filename: Option<CString>,
    pixels: Pixels,
    cache: Mutex<Option<Arc<Vec<f64>>>>,
}

impl ImageData {
    pub(crate) fn new(
        width: usize,
        height: usize,
        bands: usize,
        format: BandFormat,
        pixels: Pixels,
    ) -> Self {
        ImageData {
            width,
            height,
            bands,
            format,
            xres: 1.0,
            yres: 1.0,
            filename: None,
            pixels,
            cache: Mutex::new(None),
        }
    }

    /// A header copied from `self` with new pixels.
    pub(crate) fn derive(&self, format: BandFormat, bands: usize, pixels: Pixels) -> Self {
        let mut data = ImageData::new(self.width, self.height, bands, format, pixels);
        data.xres = self.xres;
        data.yres = self.yres;
        data
    }

    pub(crate) fn with_filename(mut self, filename: &str) -> Self {
        self.filename = CString::new(filename).ok();
        self
    }

    pub(crate) fn sample_count(&self) -> usize {
        self.width * self.height * self.bands
    }

    pub(crate) fn byte_size(&self) -> usize {
        self.sample_count() * self.format.size()
    }

    pub(crate) fn index(&self, x: usize, y: usize, band: usize) -> usize {
        (y * self.width + x) * self.bands + band
    }

    /// Pull every sample, evaluating upstream images as needed.
    pub(crate) fn samples(&self) -> Result<Arc<Vec<f64>>, String> {
        match &self.pixels {
            Pixels::Memory(bytes) => Ok(Arc::new(self.decode_all(bytes))),
            Pixels::Borrowed { data, len } => {
                let bytes = unsafe { std::slice::from_raw_parts(*data, *len) };
                Ok(Arc::new(self.decode_all(bytes)))
            }
            Pixels::Derived(eval) => {
                let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(samples) = cache.as_ref() {
                    return Ok(Arc::clone(samples));
                }
                let samples = eval()?;
                if samples.len() != self.sample_count() {
                    return Err(format!(
                        "evaluation produced {} samples, expected {}",
                        samples.len(),
                        self.sample_count()
                    ));
                }
                let samples = Arc::new(samples);
                *cache = Some(Arc::clone(&samples));
                Ok(samples)
            }
        }
    }

    fn decode_all(&self, bytes: &[u8]) -> Vec<f64> {
        let size = self.format.size();
        bytes[..self.byte_size()]
            .chunks_exact(size)
            .map(|chunk| self.format.decode(chunk))
            .collect()
    }

    /// Evaluate and pack the pixels in this image's band format.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, String> {
        if let Pixels::Memory(bytes) = &self.pixels {
            return Ok(bytes[..self.byte_size()].to_vec());
        }
        let samples = self.samples()?;
        Ok(encode_samples(&samples, self.format))
    }
}

pub(crate) fn encode_samples(samples: &[f64], format: BandFormat) -> Vec<u8> {
    let size = format.size();
    let mut out = vec![0u8; samples.len() * size];
    let workers = lifecycle::concurrency();
    if workers <= 1 || samples.len() < PARALLEL_THRESHOLD {
        encode_chunk(samples, &mut out, format);
        return out;
    }
    let per_worker = samples.len().div_ceil(workers);
    thread::scope(|scope| {
        for (input, output) in samples
            .chunks(per_worker)
            .zip(out.chunks_mut(per_worker * size))
        {
            scope.spawn(move || encode_chunk(input, output, format));
        }
    });
    out
}

fn encode_chunk(samples: &[f64], out: &mut [u8], format: BandFormat) {
    let size = format.size();
    for (value, slot) in samples.iter().zip(out.chunks_exact_mut(size)) {
        format.encode_into(*value, slot);
    }
}

/// Samples in a `width` x `height` x `bands` image, when every band format can address it.
pub(crate) fn checked_samples(width: usize, height: usize, bands: usize) -> Option<usize> {
    let samples = width.checked_mul(height)?.checked_mul(bands)?;
    let bytes = samples.checked_mul(BandFormat::Double.size())?;
    (bytes <= isize::MAX as usize).then_some(samples)
}

pub(crate) fn create(data: ImageData) -> ObjRef {
    VxObject::create(Body::Image(data))
}

fn check_header(
    caller: &str,
    width: c_int,
    height: c_int,
    bands: c_int,
    format: c_int,
) -> Option<(usize, usize, usize, BandFormat)> {
    if width <= 0 || height <= 0 || bands <= 0 {
        diag::error(caller, format_args!("bad dimensions {width}x{height}x{bands}"));
        return None;
    }
    let Some(format) = BandFormat::from_raw(format) else {
        diag::error(caller, format_args!("unsupported band format {format}"));
        return None;
    };
    Some((width as usize, height as usize, bands as usize, format))
}

fn check_size(caller: &str, need: usize, size: usize) -> bool {
    if size < need {
        diag::error(
            caller,
            format_args!("memory area too small --- should be {need} bytes, you passed {size}"),
        );
        return false;
    }
    true
}

/// Wrap caller memory without copying. The caller keeps `data` alive and unchanged.
///
/// # Safety
/// `data` must point at `size` readable bytes for the life of the image.
pub unsafe extern "C" fn vx_image_new_from_memory(
    data: *const c_void,
    size: usize,
    width: c_int,
    height: c_int,
    bands: c_int,
    format: c_int,
) -> *mut VxObject {
    let caller = "vips_image_new_from_memory";
    let Some((width, height, bands, format)) = check_header(caller, width, height, bands, format)
    else {
        return ptr::null_mut();
    };
    let Some(need) = checked_samples(width, height, bands).map(|samples| samples * format.size())
    else {
        diag::error(caller, "image too large");
        return ptr::null_mut();
    };
    if data.is_null() || !check_size(caller, need, size) {
        return ptr::null_mut();
    }
    let pixels = Pixels::Borrowed {
        data: data.cast(),
        len: need,
    };
    create(ImageData::new(width, height, bands, format, pixels)).into_raw()
}

/// # Safety
/// `data` must point at `size` readable bytes.
pub unsafe extern "C" fn vx_image_new_from_memory_copy(
    data: *const c_void,
    size: usize,
    width: c_int,
    height: c_int,
    bands: c_int,
    format: c_int,
) -> *mut VxObject {
    let caller = "vips_image_new_from_memory_copy";
    let Some((width, height, bands, format)) = check_header(caller, width, height, bands, format)
    else {
        return ptr::null_mut();
    };
    let Some(need) = checked_samples(width, height, bands).map(|samples| samples * format.size())
    else {
        diag::error(caller, "image too large");
        return ptr::null_mut();
    };
    if data.is_null() || !check_size(caller, need, size) {
        return ptr::null_mut();
    }
    let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), need) }.to_vec();
    create(ImageData::new(width, height, bands, format, Pixels::Memory(bytes))).into_raw()
}

/// One-band double image from `n` row-major values.
///
/// # Safety
/// `items` must point at `n` doubles.
pub unsafe extern "C" fn vx_image_new_matrix_from_array(
    width: c_int,
    height: c_int,
    items: *const f64,
    n: c_int,
) -> *mut VxObject {
    let caller = "vips_image_new_matrix_from_array";
    let expected = i64::from(width) * i64::from(height);
    if width <= 0 || height <= 0 || items.is_null() || expected != i64::from(n) {
        diag::error(
            caller,
            format_args!("bad array length --- should be {expected}, you passed {n}"),
        );
        return ptr::null_mut();
    }
    let items = unsafe { std::slice::from_raw_parts(items, n as usize) };
    let bytes = encode_samples(items, BandFormat::Double);
    let data = ImageData::new(
        width as usize,
        height as usize,
        1,
        BandFormat::Double,
        Pixels::Memory(bytes),
    );
    create(data).into_raw()
}

fn image_ref<'a>(image: *const VxObject, caller: &str) -> Option<&'a ImageData> {
    let data = unsafe { image.as_ref() }.and_then(VxObject::image);
    if data.is_none() {
        diag::critical(format_args!(
            "{caller}: assertion 'VIPS_IS_IMAGE (image)' failed"
        ));
    }
    data
}

/// Evaluate the image into a fresh buffer freed with `vx_buf_free`. Returns 0 on success.
///
/// # Safety
/// `image` must be a live image; `out` must be writable.
pub unsafe extern "C" fn vx_image_write_to_memory(image: *mut VxObject, out: *mut VxBuf) -> c_int {
    let Some(out) = (unsafe { out.as_mut() }) else {
        return -1;
    };
    let Some(data) = image_ref(image, "vx_image_write_to_memory") else {
        return -1;
    };
    match data.encode() {
        Ok(bytes) => {
            let bytes = bytes.into_boxed_slice();
            out.len = bytes.len();
            out.data = Box::into_raw(bytes).cast();
            0
        }
        Err(message) => {
            diag::error("vips_image_write_to_memory", message);
            -1
        }
    }
}

/// Evaluate into a new memory image with the same header.
///
/// # Safety
/// `image` must be a live image.
pub unsafe extern "C" fn vx_image_copy_memory(image: *mut VxObject) -> *mut VxObject {
    let Some(data) = image_ref(image, "vx_image_copy_memory") else {
        return ptr::null_mut();
    };
    match data.encode() {
        Ok(bytes) => {
            let mut copy = data.derive(data.format, data.bands, Pixels::Memory(bytes));
            copy.filename = data.filename.clone();
            create(copy).into_raw()
        }
        Err(message) => {
            diag::error("vips_image_copy_memory", message);
            ptr::null_mut()
        }
    }
}

macro_rules! header_getter {
    ($name:ident, $ty:ty, $fallback:expr, |$data:ident| $body:expr) => {
        /// # Safety
        /// `image` must be null or a live object.
                pub unsafe extern "C" fn $name(image: *const VxObject) -> $ty {
            match image_ref(image, stringify!($name)) {
                Some($data) => $body,
                None => $fallback,
            }
        }
    };
}

header_getter!(vx_image_get_width, c_int, 0, |data| data.width as c_int);
header_getter!(vx_image_get_height, c_int, 0, |data| data.height as c_int);
header_getter!(vx_image_get_bands, c_int, 0, |data| data.bands as c_int);
header_getter!(vx_image_get_format, c_int, -1, |data| data.format as c_int);
header_getter!(vx_image_get_xres, f64, 0.0, |data| data.xres);
header_getter!(vx_image_get_yres, f64, 0.0, |data| data.yres);
header_getter!(vx_image_get_filename, *const c_char, ptr::null(), |data| data
    .filename
    .as_deref()
    .map(CStr::as_ptr)
    .unwrap_or(ptr::null()));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::diag::vx_buf_free;

    #[test]
    fn encode_clamps_and_rounds() {
        let bytes = encode_samples(&[-3.0, 1.4, 1.6, 300.0], BandFormat::Uchar);
        assert_eq!(bytes, vec![0, 1, 2, 255]);
    }

    #[test]
    fn parallel_encode_matches_serial() {
        let samples: Vec<f64> = (0..PARALLEL_THRESHOLD * 3 + 17)
            .map(|index| (index % 70_000) as f64)
            .collect();
        let parallel = encode_samples(&samples, BandFormat::Ushort);
        let mut serial = vec![0u8; samples.len() * 2];
        encode_chunk(&samples, &mut serial, BandFormat::Ushort);
        assert_eq!(parallel, serial);
    }

    #[test]
    fn borrowed_memory_round_trips() {
        let pixels: Vec<u8> = (0..12).collect();
        let image = unsafe {
            vx_image_new_from_memory(pixels.as_ptr().cast(), pixels.len(), 2, 2, 3, 0)
        };
        assert!(!image.is_null());
        let mut buf = VxBuf {
            data: ptr::null_mut(),
            len: 0,
        };
        assert_eq!(unsafe { vx_image_write_to_memory(image, &mut buf) }, 0);
        let copy = unsafe { std::slice::from_raw_parts(buf.data, buf.len) }.to_vec();
        unsafe {
            vx_buf_free(buf);
            crate::engine::object::vx_object_unref(image);
        }
        assert_eq!(copy, pixels);
    }

    #[test]
    fn derived_pixels_evaluate_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let data = ImageData::new(
            2,
            1,
            1,
            BandFormat::Uchar,
            Pixels::Derived(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1.0, 2.0])
            })),
        );
        assert_eq!(data.encode().expect("encode"), vec![1, 2]);
        assert_eq!(data.encode().expect("encode"), vec![1, 2]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
