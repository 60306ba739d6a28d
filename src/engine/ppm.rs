//! Purpose: Netpbm (PGM/PPM) loaders, savers and format finders.
//! Exports: `CLASSES`, `vx_foreign_find_load*`, `vx_foreign_find_save*`.
//! Role: The foreign-format family; exercises blob, source and target arguments.
//! Invariants: Binary pixel data is read from the source only when the image is evaluated.
//! Invariants: Savers always end their target, so custom targets see `end`/`finish`.
use std::ffi::{CStr, c_char, c_void};
use std::io::Read;
use std::ptr;

use super::abi::{
    VX_TYPE_BLOB, VX_TYPE_BOOLEAN, VX_TYPE_IMAGE, VX_TYPE_SOURCE, VX_TYPE_STRING, VX_TYPE_TARGET,
};
use super::blob::BlobData;
use super::diag;
use super::image::{self, BandFormat, ImageData, Pixels};
use super::object::{Body, ObjRef, VxObject};
use super::ops::header;
use super::registry::{ArgSpec, Args, OpClass};
use super::source;
use super::target;
use super::value::Prop;

const CHUNK: usize = 4096;

pub(crate) static CLASSES: &[&OpClass] = &[
    &PPMLOAD,
    &PPMLOAD_BUFFER,
    &PPMLOAD_SOURCE,
    &PPMSAVE,
    &PPMSAVE_BUFFER,
    &PPMSAVE_TARGET,
];

static PPMLOAD: OpClass = OpClass {
    nickname: c"ppmload",
    description: c"load ppm from file",
    args: &[
        ArgSpec::input(c"filename", c"Filename to load from", VX_TYPE_STRING, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::optional_output(c"comment", c"First header comment", VX_TYPE_STRING, 3),
    ],
    build: build_load_file,
};

static PPMLOAD_BUFFER: OpClass = OpClass {
    nickname: c"ppmload_buffer",
    description: c"load ppm from buffer",
    args: &[
        ArgSpec::input(c"buffer", c"Buffer to load from", VX_TYPE_BLOB, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::optional_output(c"comment", c"First header comment", VX_TYPE_STRING, 3),
    ],
    build: build_load_buffer,
};

static PPMLOAD_SOURCE: OpClass = OpClass {
    nickname: c"ppmload_source",
    description: c"load ppm from source",
    args: &[
        ArgSpec::input(c"source", c"Source to load from", VX_TYPE_SOURCE, 1),
        ArgSpec::output(c"out", c"Output image", VX_TYPE_IMAGE, 2),
        ArgSpec::optional_output(c"comment", c"First header comment", VX_TYPE_STRING, 3),
    ],
    build: build_load_source,
};

static PPMSAVE: OpClass = OpClass {
    nickname: c"ppmsave",
    description: c"save image to ppm file",
    args: &[
        ArgSpec::input(c"in", c"Image to save", VX_TYPE_IMAGE, 1),
        ArgSpec::input(c"filename", c"Filename to save to", VX_TYPE_STRING, 2),
        ArgSpec::optional_input(c"ascii", c"Save as ascii", VX_TYPE_BOOLEAN, 3),
    ],
    build: build_save_file,
};

static PPMSAVE_BUFFER: OpClass = OpClass {
    nickname: c"ppmsave_buffer",
    description: c"save image to ppm buffer",
    args: &[
        ArgSpec::input(c"in", c"Image to save", VX_TYPE_IMAGE, 1),
        ArgSpec::output(c"buffer", c"Buffer to save to", VX_TYPE_BLOB, 2),
        ArgSpec::optional_input(c"ascii", c"Save as ascii", VX_TYPE_BOOLEAN, 3),
    ],
    build: build_save_buffer,
};

static PPMSAVE_TARGET: OpClass = OpClass {
    nickname: c"ppmsave_target",
    description: c"save image to ppm target",
    args: &[
        ArgSpec::input(c"in", c"Image to save", VX_TYPE_IMAGE, 1),
        ArgSpec::input(c"target", c"Target to save to", VX_TYPE_TARGET, 2),
        ArgSpec::optional_input(c"ascii", c"Save as ascii", VX_TYPE_BOOLEAN, 3),
    ],
    build: build_save_target,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Encoding {
    Ascii,
    Binary,
}

struct Header {
    width: usize,
    height: usize,
    bands: usize,
    maxval: u32,
    encoding: Encoding,
    comment: Option<String>,
}

impl Header {
    fn format(&self) -> BandFormat {
        if self.maxval > 255 {
            BandFormat::Ushort
        } else {
            BandFormat::Uchar
        }
    }

    fn sample_count(&self) -> usize {
        self.width * self.height * self.bands
    }

    fn sample_size(&self) -> usize {
        self.format().size()
    }
}

fn magic(bytes: &[u8]) -> Option<(usize, Encoding)> {
    match bytes {
        [b'P', b'2', ..] => Some((1, Encoding::Ascii)),
        [b'P', b'3', ..] => Some((3, Encoding::Ascii)),
        [b'P', b'5', ..] => Some((1, Encoding::Binary)),
        [b'P', b'6', ..] => Some((3, Encoding::Binary)),
        _ => None,
    }
}

/// Byte reader over a source, refilled in chunks.
struct Scanner<'a> {
    source: &'a VxObject,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a VxObject) -> Self {
        Scanner {
            source,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, String> {
        if self.pos == self.buf.len() {
            let mut chunk = vec![0u8; CHUNK];
            let n = source::read(self.source, &mut chunk)?;
            chunk.truncate(n);
            self.buf = chunk;
            self.pos = 0;
        }
        Ok(self.buf.get(self.pos).copied())
    }

    fn next(&mut self) -> Result<Option<u8>, String> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.pos += 1;
        }
        Ok(byte)
    }

    /// Skip whitespace and `#` comments, keeping the first comment seen.
    fn skip_space(&mut self, comment: &mut Option<String>) -> Result<(), String> {
        while let Some(byte) = self.peek()? {
            if byte == b'#' {
                self.pos += 1;
                let mut text = Vec::new();
                while let Some(byte) = self.next()? {
                    if byte == b'\n' || byte == b'\r' {
                        break;
                    }
                    text.push(byte);
                }
                if comment.is_none() {
                    *comment = Some(String::from_utf8_lossy(&text).trim().to_string());
                }
            } else if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn number(&mut self, comment: &mut Option<String>) -> Result<u32, String> {
        self.skip_space(comment)?;
        let mut value: u32 = 0;
        let mut digits = 0;
        while let Some(byte) = self.peek()? {
            if !byte.is_ascii_digit() {
                break;
            }
            value = value
                .checked_mul(10)
                .and_then(|value| value.checked_add(u32::from(byte - b'0')))
                .ok_or_else(|| "number too large".to_string())?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            return match self.peek()? {
                Some(_) => Err("bad number in header".to_string()),
                None => Err("premature end of file".to_string()),
            };
        }
        Ok(value)
    }

    /// Bytes already pulled from the source but not yet consumed.
    fn remainder(self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}

fn read_header(scanner: &mut Scanner<'_>) -> Result<Header, String> {
    let first = [scanner.next()?, scanner.next()?];
    let (bands, encoding) = match first {
        [Some(a), Some(b)] => magic(&[a, b]),
        _ => None,
    }
    .ok_or_else(|| "not a ppm file".to_string())?;
    let mut comment = None;
    let width = scanner.number(&mut comment)? as usize;
    let height = scanner.number(&mut comment)? as usize;
    let maxval = scanner.number(&mut comment)?;
    if width == 0 || height == 0 {
        return Err(format!("bad image dimensions {width}x{height}"));
    }
    if maxval == 0 || maxval > 65535 {
        return Err(format!("bad maxval {maxval}"));
    }
    if image::checked_samples(width, height, bands).is_none() {
        return Err("image too large".to_string());
    }
    // Exactly one whitespace byte separates the header from binary data.
    match scanner.next()? {
        Some(byte) if byte.is_ascii_whitespace() => {}
        Some(_) => return Err("bad header terminator".to_string()),
        None if encoding == Encoding::Binary => {
            return Err("premature end of file".to_string());
        }
        None => {}
    }
    Ok(Header {
        width,
        height,
        bands,
        maxval,
        encoding,
        comment,
    })
}

fn decode_binary(bytes: &[u8], format: BandFormat) -> Vec<f64> {
    match format {
        BandFormat::Ushort => bytes
            .chunks_exact(2)
            .map(|pair| f64::from(u16::from_be_bytes([pair[0], pair[1]])))
            .collect(),
        _ => bytes.iter().map(|byte| f64::from(*byte)).collect(),
    }
}

/// Lazy pixels: `prefix` plus whatever the source still holds.
fn binary_pixels(source: ObjRef, prefix: Vec<u8>, header: &Header) -> Pixels {
    let need = header.sample_count() * header.sample_size();
    let format = header.format();
    Pixels::Derived(Box::new(move || {
        let mut bytes = prefix.clone();
        bytes.truncate(need);
        let mut chunk = vec![0u8; CHUNK];
        while bytes.len() < need {
            let n = source::read(&source, &mut chunk)?;
            if n == 0 {
                return Err("premature end of file".to_string());
            }
            let take = n.min(need - bytes.len());
            bytes.extend_from_slice(&chunk[..take]);
        }
        Ok(decode_binary(&bytes, format))
    }))
}

fn ascii_pixels(scanner: &mut Scanner<'_>, header: &Header) -> Result<Pixels, String> {
    let mut samples = Vec::with_capacity(header.sample_count().min(CHUNK));
    let mut ignored = None;
    for _ in 0..header.sample_count() {
        let value = scanner.number(&mut ignored)?;
        samples.push(f64::from(value.min(header.maxval)));
    }
    Ok(Pixels::Memory(image::encode_samples(
        &samples,
        header.format(),
    )))
}

fn load(source: ObjRef) -> Result<(ImageData, Option<String>), String> {
    let mut scanner = Scanner::new(&source);
    let header = read_header(&mut scanner)?;
    let pixels = match header.encoding {
        Encoding::Ascii => {
            let pixels = ascii_pixels(&mut scanner, &header)?;
            source::decode(&source);
            pixels
        }
        Encoding::Binary => {
            let prefix = scanner.remainder();
            source::decode(&source);
            binary_pixels(source.clone(), prefix, &header)
        }
    };
    let data = ImageData::new(
        header.width,
        header.height,
        header.bands,
        header.format(),
        pixels,
    );
    diag::debug(format_args!(
        "ppmload: {}x{} bands={} maxval={}",
        header.width, header.height, header.bands, header.maxval
    ));
    Ok((data, header.comment))
}

fn finish_load(args: &mut Args<'_>, data: ImageData, comment: Option<String>) {
    args.set("out", Prop::Object(image::create(data)));
    if let Some(comment) = comment.and_then(|text| std::ffi::CString::new(text).ok()) {
        args.set("comment", Prop::String(comment));
    }
}

fn build_load_file(args: &mut Args<'_>) -> Result<(), String> {
    let filename = args.string("filename")?;
    let source = source::open_file(&filename)?;
    let (data, comment) = load(source)?;
    finish_load(args, data.with_filename(&filename), comment);
    Ok(())
}

fn build_load_buffer(args: &mut Args<'_>) -> Result<(), String> {
    let blob = args.object("buffer")?;
    if blob.blob().is_none() {
        return Err("buffer is not a blob".to_string());
    }
    let (data, comment) = load(source::from_blob(blob))?;
    finish_load(args, data, comment);
    Ok(())
}

fn build_load_source(args: &mut Args<'_>) -> Result<(), String> {
    let source = args.object("source")?;
    if source.source().is_none() {
        return Err("source is not a source".to_string());
    }
    let filename = source::filename(&source);
    let (data, comment) = load(source)?;
    let data = match filename {
        Some(filename) => data.with_filename(&filename),
        None => data,
    };
    finish_load(args, data, comment);
    Ok(())
}

/// Serialize `image` as netpbm.
fn encode(image: &ImageData, ascii: bool) -> Result<Vec<u8>, String> {
    let magic = match (image.bands, ascii) {
        (1, true) => "P2",
        (1, false) => "P5",
        (3, true) => "P3",
        (3, false) => "P6",
        (bands, _) => return Err(format!("can't save {bands}-band image")),
    };
    let wide = image.format == BandFormat::Ushort;
    let maxval = if wide { 65535 } else { 255 };
    let format = if wide { BandFormat::Ushort } else { BandFormat::Uchar };
    let samples = image.samples()?;
    let mut out = format!("{magic}\n{} {}\n{maxval}\n", image.width, image.height).into_bytes();
    if ascii {
        let row = image.width * image.bands;
        for line in samples.chunks(row.max(1)) {
            let text = line
                .iter()
                .map(|value| (format.clip(*value) as u32).to_string())
                .collect::<Vec<_>>()
                .join(" ");
            out.extend_from_slice(text.as_bytes());
            out.push(b'\n');
        }
    } else if wide {
        for value in samples.iter() {
            out.extend_from_slice(&(format.clip(*value) as u16).to_be_bytes());
        }
    } else {
        out.extend(samples.iter().map(|value| format.clip(*value) as u8));
    }
    Ok(out)
}

fn save(args: &Args<'_>, target_object: &VxObject) -> Result<(), String> {
    let input = args.image("in")?;
    let bytes = encode(header(&input)?, args.bool_or("ascii", false));
    // End even after a failure so the target is released in a final state.
    let written = bytes.and_then(|bytes| target::write(target_object, &bytes));
    let ended = target::end(target_object);
    written.and(ended)
}

fn build_save_file(args: &mut Args<'_>) -> Result<(), String> {
    let filename = args.string("filename")?;
    let target = target::to_file(&filename)?;
    save(args, &target)
}

fn build_save_buffer(args: &mut Args<'_>) -> Result<(), String> {
    let target = target::to_memory();
    save(args, &target)?;
    let bytes = target::steal(&target)?;
    let blob = VxObject::create(Body::Blob(BlobData::Owned(bytes.into_boxed_slice())));
    args.set("buffer", Prop::Object(blob));
    Ok(())
}

fn build_save_target(args: &mut Args<'_>) -> Result<(), String> {
    let target = args.object("target")?;
    if target.target().is_none() {
        return Err("target is not a target".to_string());
    }
    save(args, &target)
}

fn loader_for(bytes: &[u8], nickname: &'static CStr) -> *const c_char {
    if magic(bytes).is_some() {
        nickname.as_ptr()
    } else {
        ptr::null()
    }
}

fn is_netpbm_name(name: &str) -> bool {
    let name = match name.find('[') {
        Some(index) => &name[..index],
        None => name,
    };
    let lower = name.to_ascii_lowercase();
    [".ppm", ".pgm", ".pnm"]
        .iter()
        .any(|suffix| lower.ends_with(suffix))
}

fn text_arg(text: *const c_char) -> Option<String> {
    if text.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
}

/// Nickname of a loader for `filename`, or null with the error buffer set.
///
/// # Safety
/// `filename` must be a valid C string.
pub unsafe extern "C" fn vx_foreign_find_load(filename: *const c_char) -> *const c_char {
    let Some(path) = text_arg(filename) else {
        diag::error("VipsForeignLoad", "no filename");
        return ptr::null();
    };
    let mut head = [0u8; 2];
    let read = std::fs::File::open(&path).and_then(|mut file| file.read_exact(&mut head));
    if let Err(err) = read {
        diag::error(
            "VipsForeignLoad",
            format_args!("file \"{path}\" not readable ({err})"),
        );
        return ptr::null();
    }
    let found = loader_for(&head, c"ppmload");
    if found.is_null() {
        diag::error(
            "VipsForeignLoad",
            format_args!("\"{path}\" is not a known file format"),
        );
    }
    found
}

/// # Safety
/// `data` must hold `len` readable bytes.
pub unsafe extern "C" fn vx_foreign_find_load_buffer(data: *const c_void, len: usize) -> *const c_char {
    let bytes = if data.is_null() || len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }
    };
    let found = loader_for(bytes, c"ppmload_buffer");
    if found.is_null() {
        diag::error("VipsForeignLoad", "buffer is not in a known format");
    }
    found
}

/// Sniffs the source; the bytes stay available to the loader.
///
/// # Safety
/// `source` must be a live source.
pub unsafe extern "C" fn vx_foreign_find_load_source(source: *mut VxObject) -> *const c_char {
    let Some(object) = (unsafe { source.as_ref() }).filter(|object| object.source().is_some())
    else {
        diag::critical("vx_foreign_find_load_source: assertion 'VIPS_IS_SOURCE (source)' failed");
        return ptr::null();
    };
    let found = match source::sniff(object, 2) {
        Ok(bytes) => loader_for(&bytes, c"ppmload_source"),
        Err(message) => {
            diag::error("VipsSource", message);
            return ptr::null();
        }
    };
    if found.is_null() {
        diag::error("VipsForeignLoad", "source is not in a known format");
    }
    found
}

fn find_saver(name: Option<String>, nickname: &'static CStr) -> *const c_char {
    let name = name.unwrap_or_default();
    if is_netpbm_name(&name) {
        return nickname.as_ptr();
    }
    diag::error(
        "VipsForeignSave",
        format_args!("\"{name}\" is not a known file format"),
    );
    ptr::null()
}

/// # Safety
/// `filename` must be a valid C string.
pub unsafe extern "C" fn vx_foreign_find_save(filename: *const c_char) -> *const c_char {
    find_saver(text_arg(filename), c"ppmsave")
}

/// # Safety
/// `suffix` must be a valid C string, such as ".ppm".
pub unsafe extern "C" fn vx_foreign_find_save_buffer(suffix: *const c_char) -> *const c_char {
    find_saver(text_arg(suffix), c"ppmsave_buffer")
}

/// # Safety
/// `suffix` must be a valid C string, such as ".ppm".
pub unsafe extern "C" fn vx_foreign_find_save_target(suffix: *const c_char) -> *const c_char {
    find_saver(text_arg(suffix), c"ppmsave_target")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::object::vx_object_unref;
    use crate::engine::source::vx_source_new_from_memory;
    use serial_test::serial;

    fn load_bytes(bytes: &[u8]) -> Result<(ImageData, Option<String>), String> {
        load(source::from_blob(VxObject::create(Body::Blob(BlobData::copied(bytes)))))
    }

    #[test]
    fn loads_binary_graymap_with_comment() {
        let (image, comment) = load_bytes(b"P5\n# made by hand\n3 2\n255\n\x00\x01\x02\x03\x04\xff")
            .expect("load");
        assert_eq!((image.width, image.height, image.bands), (3, 2, 1));
        assert_eq!(image.format, BandFormat::Uchar);
        assert_eq!(comment.as_deref(), Some("made by hand"));
        assert_eq!(*image.samples().expect("samples"), vec![0.0, 1.0, 2.0, 3.0, 4.0, 255.0]);
    }

    #[test]
    fn loads_ascii_sixteen_bit_pixmap() {
        let (image, _) = load_bytes(b"P3 1 1 65535\n1 300 65535\n").expect("load");
        assert_eq!(image.format, BandFormat::Ushort);
        assert_eq!(*image.samples().expect("samples"), vec![1.0, 300.0, 65535.0]);
    }

    #[test]
    fn truncated_binary_data_fails_on_evaluation() {
        let (image, _) = load_bytes(b"P5 4 4 255\nabc").expect("header parses");
        let err = image.samples().expect_err("short data");
        assert!(err.contains("premature end of file"));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let err = load_bytes(b"P6\n4294967295 4294967295\n255\n").err().expect("too large");
        assert_eq!(err, "image too large");
        assert!(load_bytes(b"P5 2147483648 2147483648 255\n").is_err());
    }

    #[test]
    fn encode_round_trips_through_loader() {
        let data = ImageData::new(2, 1, 3, BandFormat::Ushort, Pixels::Memory(vec![0; 12]));
        let bytes = encode(&data, false).expect("encode");
        assert!(bytes.starts_with(b"P6\n2 1\n65535\n"));
        let (back, _) = load_bytes(&bytes).expect("load");
        assert_eq!(back.format, BandFormat::Ushort);
        assert_eq!(back.bands, 3);
    }

    #[test]
    fn two_band_images_are_rejected() {
        let data = ImageData::new(1, 1, 2, BandFormat::Uchar, Pixels::Memory(vec![0; 2]));
        assert!(encode(&data, true).is_err());
    }

    #[test]
    #[serial]
    fn finders_match_names_and_magic() {
        unsafe {
            assert_eq!(
                CStr::from_ptr(vx_foreign_find_save(c"out.PGM[ascii]".as_ptr())),
                c"ppmsave"
            );
            assert_eq!(
                CStr::from_ptr(vx_foreign_find_save_buffer(c".ppm".as_ptr())),
                c"ppmsave_buffer"
            );
            assert!(vx_foreign_find_save_target(c".png".as_ptr()).is_null());

            let bytes = b"P6 1 1 255\n\x01\x02\x03";
            let source = vx_source_new_from_memory(bytes.as_ptr().cast(), bytes.len());
            assert_eq!(
                CStr::from_ptr(vx_foreign_find_load_source(source)),
                c"ppmload_source"
            );
            vx_object_unref(source);
        }
        crate::engine::diag::vx_error_clear();
    }
}
