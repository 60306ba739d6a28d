//! Purpose: Managed images and the typed operation wrappers over them.
//! Exports: `Image`, `Pixel`, `Extremum`.
//! Role: Primary object handle; every derived image keeps its inputs alive.
//! Invariants: Zero-copy images hold the caller's buffer until the last derived image drops.
//! Invariants: Loaders and savers pick their operation by sniffing, then call it like any other.
use std::ffi::{CStr, CString, c_int};
use std::fmt;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use super::blob::Blob;
use super::diag;
use super::enums::{BandFormat, Direction, EnumType};
use super::error::{Error, ErrorKind, Result};
use super::object::{KeepAlive, ObjectRef};
use super::operation;
use super::options::Options;
use super::source::{Source, path_arg};
use super::sys;
use super::target::Target;

#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

struct ImageInner {
    object: ObjectRef,
    keep_alive: Vec<KeepAlive>,
}

/// Sample types that map onto a band format.
pub trait Pixel: Copy + Send + Sync + 'static {
    const FORMAT: BandFormat;
}

macro_rules! pixel {
    ($($ty:ty => $format:ident),* $(,)?) => {
        $(impl Pixel for $ty {
            const FORMAT: BandFormat = BandFormat::$format;
        })*
    };
}

pixel! {
    u8 => Uchar,
    i8 => Char,
    u16 => Ushort,
    i16 => Short,
    u32 => Uint,
    i32 => Int,
    f32 => Float,
    f64 => Double,
}

/// Value and position of an image minimum or maximum.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct Extremum {
    pub value: f64,
    pub x: i32,
    pub y: i32,
}

/// Split `name[options]` into the name and the bracketed option string.
fn split_options(text: &str) -> (&str, Option<&str>) {
    match text.find('[') {
        Some(open) if text.ends_with(']') => (&text[..open], Some(&text[open..])),
        _ => (text, None),
    }
}

fn dimension(value: usize, what: &str) -> Result<c_int> {
    c_int::try_from(value).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what} {value} is out of range"))
            .with_source(err)
    })
}

fn nickname(found: *const std::ffi::c_char, fallback: &str) -> Result<String> {
    if found.is_null() {
        return Err(diag::failure(ErrorKind::OperationFailed, fallback));
    }
    Ok(unsafe { CStr::from_ptr(found) }.to_string_lossy().into_owned())
}

fn text_arg(text: &str) -> Result<CString> {
    CString::new(text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{text:?} contains a NUL byte"))
            .with_source(err)
    })
}

impl Image {
    pub(crate) fn wrap(object: ObjectRef, keep_alive: Vec<KeepAlive>) -> Self {
        Image {
            inner: Arc::new(ImageInner { object, keep_alive }),
        }
    }

    pub(crate) fn keep_alive_handle(&self) -> KeepAlive {
        self.inner.clone()
    }

    pub fn object(&self) -> &ObjectRef {
        &self.inner.object
    }

    /// Number of handles this image keeps alive.
    pub fn predecessor_count(&self) -> usize {
        self.inner.keep_alive.len()
    }

    /// Wrap `data` without copying. The buffer lives as long as this image and anything derived from it.
    pub fn from_memory<P, B>(data: B, width: usize, height: usize, bands: usize) -> Result<Self>
    where
        P: Pixel,
        B: AsRef<[P]> + Send + Sync + 'static,
    {
        let data = Arc::new(data);
        let samples = (*data).as_ref();
        let raw = unsafe {
            sys::vx_image_new_from_memory(
                samples.as_ptr().cast(),
                mem::size_of_val(samples),
                dimension(width, "width")?,
                dimension(height, "height")?,
                dimension(bands, "bands")?,
                P::FORMAT.to_raw(),
            )
        };
        let object = unsafe { ObjectRef::from_raw(raw) }
            .ok_or_else(|| diag::failure(ErrorKind::Usage, "unable to wrap memory"))?;
        Ok(Image::wrap(object, vec![data as KeepAlive]))
    }

    pub fn from_memory_copy<P: Pixel>(
        data: &[P],
        width: usize,
        height: usize,
        bands: usize,
    ) -> Result<Self> {
        let raw = unsafe {
            sys::vx_image_new_from_memory_copy(
                data.as_ptr().cast(),
                mem::size_of_val(data),
                dimension(width, "width")?,
                dimension(height, "height")?,
                dimension(bands, "bands")?,
                P::FORMAT.to_raw(),
            )
        };
        let object = unsafe { ObjectRef::from_raw(raw) }
            .ok_or_else(|| diag::failure(ErrorKind::Usage, "unable to copy memory"))?;
        Ok(Image::wrap(object, Vec::new()))
    }

    /// One-band double image from row-major `values`.
    pub fn matrix_from_array(width: usize, height: usize, values: &[f64]) -> Result<Self> {
        let raw = unsafe {
            sys::vx_image_new_matrix_from_array(
                dimension(width, "width")?,
                dimension(height, "height")?,
                values.as_ptr(),
                dimension(values.len(), "array length")?,
            )
        };
        let object = unsafe { ObjectRef::from_raw(raw) }
            .ok_or_else(|| diag::failure(ErrorKind::Usage, "bad matrix"))?;
        Ok(Image::wrap(object, Vec::new()))
    }

    pub fn black(width: i32, height: i32) -> Result<Self> {
        let mut options = Options::new();
        options.set("width", width).set("height", height);
        let out = options.output::<Image>("out");
        operation::call("black", None, &mut options)?;
        options.take(out)
    }

    /// Load `path`, which may carry a `[name=value,...]` suffix.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path_arg(path.as_ref())?;
        let (filename, option_string) = split_options(path.to_str().unwrap_or_default());
        Image::from_file_with(filename, None, option_string)
    }

    /// Load with an explicit loader nickname, or sniff one when `loader` is `None`.
    pub fn from_file_with(
        filename: &str,
        loader: Option<&str>,
        option_string: Option<&str>,
    ) -> Result<Self> {
        let loader = match loader {
            Some(loader) => loader.to_string(),
            None => {
                let c_filename = text_arg(filename)?;
                nickname(
                    unsafe { sys::vx_foreign_find_load(c_filename.as_ptr()) },
                    "no loader for file",
                )?
            }
        };
        let mut options = Options::new();
        options.set("filename", filename);
        let out = options.output::<Image>("out");
        operation::call(&loader, option_string, &mut options)?;
        options.take(out)
    }

    /// Load from bytes; the bytes are copied into a blob first.
    pub fn from_buffer(bytes: &[u8], option_string: Option<&str>) -> Result<Self> {
        Image::from_blob(&Blob::copy_from(bytes)?, option_string)
    }

    pub fn from_blob(blob: &Blob, option_string: Option<&str>) -> Result<Self> {
        let loader = blob.find_loader()?;
        let mut options = Options::new();
        options.set("buffer", blob);
        let out = options.output::<Image>("out");
        operation::call(&loader, option_string, &mut options)?;
        options.take(out)
    }

    /// Load from a stream. Pixels are read lazily, so the source stays alive with the image.
    pub fn from_source(source: &Source, option_string: Option<&str>) -> Result<Self> {
        let loader = source.find_loader()?;
        let mut options = Options::new();
        options.set("source", source);
        let out = options.output::<Image>("out");
        operation::call(&loader, option_string, &mut options)?;
        options.take(out)
    }

    /// Save to `path`; the saver is picked from the suffix, and a `[...]` suffix passes options.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path_arg(path.as_ref())?;
        let (filename, option_string) = split_options(path.to_str().unwrap_or_default());
        let c_filename = text_arg(filename)?;
        let saver = nickname(
            unsafe { sys::vx_foreign_find_save(c_filename.as_ptr()) },
            "no saver for file",
        )?;
        let mut options = Options::new();
        options.set("in", self).set("filename", filename);
        operation::call(&saver, option_string, &mut options)
    }

    /// Encode in the format named by `suffix`, such as ".ppm" or ".pgm[ascii]".
    pub fn write_to_buffer(&self, suffix: &str) -> Result<Vec<u8>> {
        let (suffix, option_string) = split_options(suffix);
        let c_suffix = text_arg(suffix)?;
        let saver = nickname(
            unsafe { sys::vx_foreign_find_save_buffer(c_suffix.as_ptr()) },
            "no saver for suffix",
        )?;
        let mut options = Options::new();
        options.set("in", self);
        let out = options.output::<Blob>("buffer");
        operation::call(&saver, option_string, &mut options)?;
        Ok(options.take(out)?.to_vec())
    }

    /// Encode into `target`, which is ended afterwards.
    pub fn write_to_target(&self, target: &Target, suffix: &str) -> Result<()> {
        let (suffix, option_string) = split_options(suffix);
        let c_suffix = text_arg(suffix)?;
        let saver = nickname(
            unsafe { sys::vx_foreign_find_save_target(c_suffix.as_ptr()) },
            "no saver for suffix",
        )?;
        let mut options = Options::new();
        options.set("in", self).set("target", target);
        operation::call(&saver, option_string, &mut options)
    }

    /// Evaluate every pixel into a packed buffer in this image's band format.
    pub fn write_to_memory(&self) -> Result<Vec<u8>> {
        let mut buf = sys::VxBuf {
            data: ptr::null_mut(),
            len: 0,
        };
        if unsafe { sys::vx_image_write_to_memory(self.ptr(), &mut buf) } != 0 {
            return Err(diag::failure(ErrorKind::OperationFailed, "unable to evaluate image"));
        }
        let bytes = if buf.data.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(buf.data, buf.len) }.to_vec()
        };
        unsafe { sys::vx_buf_free(buf) };
        Ok(bytes)
    }

    /// Evaluate into a new memory image. Upstream handles are no longer needed.
    pub fn copy_memory(&self) -> Result<Self> {
        let raw = unsafe { sys::vx_image_copy_memory(self.ptr()) };
        let object = unsafe { ObjectRef::from_raw(raw) }
            .ok_or_else(|| diag::failure(ErrorKind::OperationFailed, "unable to evaluate image"))?;
        Ok(Image::wrap(object, Vec::new()))
    }

    pub fn width(&self) -> i32 {
        unsafe { sys::vx_image_get_width(self.ptr()) }
    }

    pub fn height(&self) -> i32 {
        unsafe { sys::vx_image_get_height(self.ptr()) }
    }

    pub fn bands(&self) -> i32 {
        unsafe { sys::vx_image_get_bands(self.ptr()) }
    }

    pub fn format(&self) -> Option<BandFormat> {
        BandFormat::from_raw(unsafe { sys::vx_image_get_format(self.ptr()) })
    }

    /// Horizontal resolution in pixels per millimetre.
    pub fn xres(&self) -> f64 {
        unsafe { sys::vx_image_get_xres(self.ptr()) }
    }

    pub fn yres(&self) -> f64 {
        unsafe { sys::vx_image_get_yres(self.ptr()) }
    }

    pub fn filename(&self) -> Option<String> {
        let name = unsafe { sys::vx_image_get_filename(self.ptr()) };
        if name.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    }

    fn ptr(&self) -> *mut sys::VxObject {
        self.inner.object.as_ptr()
    }

    fn unary(&self, name: &str, configure: impl FnOnce(&mut Options)) -> Result<Image> {
        let mut options = Options::new();
        options.set("in", self);
        configure(&mut options);
        let out = options.output::<Image>("out");
        operation::call(name, None, &mut options)?;
        options.take(out)
    }

    pub fn invert(&self) -> Result<Image> {
        self.unary("invert", |_| {})
    }

    /// `out = in * a + b`, per band when `a` and `b` have one entry per band.
    pub fn linear(&self, a: &[f64], b: &[f64]) -> Result<Image> {
        self.unary("linear", |options| {
            options.set("a", a).set("b", b);
        })
    }

    pub fn add(&self, right: &Image) -> Result<Image> {
        let mut options = Options::new();
        options.set("left", self).set("right", right);
        let out = options.output::<Image>("out");
        operation::call("add", None, &mut options)?;
        options.take(out)
    }

    pub fn extract_area(&self, left: i32, top: i32, width: i32, height: i32) -> Result<Image> {
        let mut options = Options::new();
        options
            .set("input", self)
            .set("left", left)
            .set("top", top)
            .set("width", width)
            .set("height", height);
        let out = options.output::<Image>("out");
        operation::call("extract_area", None, &mut options)?;
        options.take(out)
    }

    pub fn flip(&self, direction: Direction) -> Result<Image> {
        self.unary("flip", |options| {
            options.set("direction", direction);
        })
    }

    pub fn cast(&self, format: BandFormat) -> Result<Image> {
        self.unary("cast", |options| {
            options.set("format", format);
        })
    }

    /// Join `images` band-wise, in order, into one image.
    pub fn bandjoin(images: &[Image]) -> Result<Image> {
        let mut options = Options::new();
        options.set("in", images);
        let out = options.output::<Image>("out");
        operation::call("bandjoin", None, &mut options)?;
        options.take(out)
    }

    /// Copy with a changed resolution; `None` keeps the current value.
    pub fn copy_with(&self, xres: Option<f64>, yres: Option<f64>) -> Result<Image> {
        self.unary("copy", |options| {
            options.set_opt("xres", xres).set_opt("yres", yres);
        })
    }

    /// Mean of every sample in every band.
    pub fn avg(&self) -> Result<f64> {
        let mut options = Options::new();
        options.set("in", self);
        let out = options.output::<f64>("out");
        operation::call("avg", None, &mut options)?;
        options.take(out)
    }

    fn extremum(&self, name: &str) -> Result<Extremum> {
        let mut options = Options::new();
        options.set("in", self);
        let value = options.output::<f64>("out");
        let x = options.optional_output::<i32>("x");
        let y = options.optional_output::<i32>("y");
        operation::call(name, None, &mut options)?;
        Ok(Extremum {
            value: options.take(value)?,
            x: options.take_opt(x).unwrap_or_default(),
            y: options.take_opt(y).unwrap_or_default(),
        })
    }

    pub fn min(&self) -> Result<Extremum> {
        self.extremum("min")
    }

    pub fn max(&self) -> Result<Extremum> {
        self.extremum("max")
    }

    /// Every band of the pixel at (`x`, `y`).
    pub fn getpoint(&self, x: i32, y: i32) -> Result<Vec<f64>> {
        let mut options = Options::new();
        options.set("in", self).set("x", x).set("y", y);
        let out = options.output::<Vec<f64>>("out_array");
        operation::call("getpoint", None, &mut options)?;
        options.take(out)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("bands", &self.bands())
            .field("format", &self.format())
            .field("predecessors", &self.predecessor_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_suffix_is_split_off() {
        assert_eq!(split_options("a.ppm[ascii]"), ("a.ppm", Some("[ascii]")));
        assert_eq!(split_options("a.ppm"), ("a.ppm", None));
        assert_eq!(split_options("a[b.ppm"), ("a[b.ppm", None));
    }

    #[test]
    fn zero_copy_image_keeps_its_buffer() {
        let image = Image::from_memory(vec![1u8, 2, 3, 4], 2, 2, 1).expect("image");
        assert_eq!(image.predecessor_count(), 1);
        let inverted = image.invert().expect("invert");
        drop(image);
        assert_eq!(inverted.write_to_memory().expect("pixels"), vec![254, 253, 252, 251]);
    }

    #[test]
    fn header_accessors_forward_to_engine() {
        let image = Image::from_memory_copy(&[0.5f32; 12], 3, 2, 2).expect("image");
        assert_eq!((image.width(), image.height(), image.bands()), (3, 2, 2));
        assert_eq!(image.format(), Some(BandFormat::Float));
        assert_eq!(image.filename(), None);
        let copy = image.copy_with(Some(4.0), None).expect("copy");
        assert_eq!(copy.xres(), 4.0);
        assert_eq!(copy.yres(), image.yres());
    }

    #[test]
    fn statistics_report_positions() {
        let image = Image::matrix_from_array(3, 1, &[4.0, -1.0, 9.0]).expect("matrix");
        assert_eq!(image.avg().expect("avg"), 4.0);
        assert_eq!(image.min().expect("min"), Extremum { value: -1.0, x: 1, y: 0 });
        assert_eq!(image.max().expect("max"), Extremum { value: 9.0, x: 2, y: 0 });
        assert_eq!(image.getpoint(2, 0).expect("point"), vec![9.0]);
    }

    #[test]
    fn bandjoin_flip_and_cast_compose() {
        let left = Image::from_memory_copy(&[1u8, 2], 2, 1, 1).expect("left");
        let right = Image::from_memory_copy(&[10u8, 20], 2, 1, 1).expect("right");
        let joined = Image::bandjoin(&[left, right]).expect("bandjoin");
        assert_eq!(joined.bands(), 2);
        let flipped = joined.flip(Direction::Horizontal).expect("flip");
        assert_eq!(flipped.getpoint(0, 0).expect("point"), vec![2.0, 20.0]);
        let wide = flipped.cast(BandFormat::Ushort).expect("cast");
        assert_eq!(wide.write_to_memory().expect("pixels").len(), 8);
    }

    #[test]
    fn buffer_save_and_load_agree() {
        let image = Image::from_memory_copy(&[0u8, 64, 128, 255], 2, 2, 1).expect("image");
        let encoded = image.write_to_buffer(".pgm").expect("save");
        assert!(encoded.starts_with(b"P5"));
        let decoded = Image::from_buffer(&encoded, None).expect("load");
        assert_eq!(decoded.write_to_memory().expect("pixels"), vec![0, 64, 128, 255]);
        let extract = decoded.extract_area(1, 1, 1, 1).expect("extract");
        assert_eq!(extract.avg().expect("avg"), 255.0);
    }
}
