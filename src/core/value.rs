//! Purpose: Closed set of marshalable values and their native containers.
//! Exports: `Value`, `ValueKind`, `EnumValue`, `NativeValue`, `FromOutput`.
//! Role: Converts host values into engine property values and output containers back.
//! Invariants: Encoding an array of images takes one native reference per element;
//! the container owns those references and releases them when it is dropped.
//! Invariants: A container is either fully written by the engine or left zeroed.
use std::any::Any;
use std::ffi::{CStr, CString, c_int};
use std::fmt;

use serde::Serialize;

use super::blob::Blob;
use super::enums::{BandFormat, Direction, EnumType};
use super::error::{Error, ErrorKind, Result};
use super::image::Image;
use super::object::{KeepAlive, ObjectRef};
use super::source::Source;
use super::sys::{self, VxValue};
use super::target::Target;

/// Raw enumerated constant tagged with its engine enum type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnumValue {
    pub type_id: u32,
    pub value: i32,
}

impl EnumValue {
    pub fn of<E: EnumType>(value: E) -> Self {
        EnumValue {
            type_id: E::TYPE_ID,
            value: value.to_raw(),
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Double(f64),
    String(String),
    Enum(EnumValue),
    ArrayDouble(Vec<f64>),
    ArrayInt(Vec<i32>),
    ArrayImage(Vec<Image>),
    Image(Image),
    Blob(Blob),
    Source(Source),
    Target(Target),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Int,
    Double,
    String,
    Enum,
    ArrayDouble,
    ArrayInt,
    ArrayImage,
    Image,
    Blob,
    Source,
    Target,
}

impl ValueKind {
    /// Kind carried by native containers of type `type_id`.
    pub fn of(type_id: u32) -> Option<ValueKind> {
        Some(match type_id {
            sys::VX_TYPE_BOOLEAN => ValueKind::Bool,
            sys::VX_TYPE_INT => ValueKind::Int,
            sys::VX_TYPE_DOUBLE => ValueKind::Double,
            sys::VX_TYPE_STRING => ValueKind::String,
            sys::VX_TYPE_ARRAY_DOUBLE => ValueKind::ArrayDouble,
            sys::VX_TYPE_ARRAY_INT => ValueKind::ArrayInt,
            sys::VX_TYPE_ARRAY_IMAGE => ValueKind::ArrayImage,
            sys::VX_TYPE_IMAGE => ValueKind::Image,
            sys::VX_TYPE_BLOB => ValueKind::Blob,
            sys::VX_TYPE_SOURCE => ValueKind::Source,
            sys::VX_TYPE_TARGET => ValueKind::Target,
            id if id >= sys::VX_TYPE_ENUM_BASE => ValueKind::Enum,
            _ => return None,
        })
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Double(_) => ValueKind::Double,
            Value::String(_) => ValueKind::String,
            Value::Enum(_) => ValueKind::Enum,
            Value::ArrayDouble(_) => ValueKind::ArrayDouble,
            Value::ArrayInt(_) => ValueKind::ArrayInt,
            Value::ArrayImage(_) => ValueKind::ArrayImage,
            Value::Image(_) => ValueKind::Image,
            Value::Blob(_) => ValueKind::Blob,
            Value::Source(_) => ValueKind::Source,
            Value::Target(_) => ValueKind::Target,
        }
    }

    /// Native container type this value encodes into.
    pub fn type_id(&self) -> u32 {
        match self {
            Value::Bool(_) => sys::VX_TYPE_BOOLEAN,
            Value::Int(_) => sys::VX_TYPE_INT,
            Value::Double(_) => sys::VX_TYPE_DOUBLE,
            Value::String(_) => sys::VX_TYPE_STRING,
            Value::Enum(constant) => constant.type_id,
            Value::ArrayDouble(_) => sys::VX_TYPE_ARRAY_DOUBLE,
            Value::ArrayInt(_) => sys::VX_TYPE_ARRAY_INT,
            Value::ArrayImage(_) => sys::VX_TYPE_ARRAY_IMAGE,
            Value::Image(_) => sys::VX_TYPE_IMAGE,
            Value::Blob(_) => sys::VX_TYPE_BLOB,
            Value::Source(_) => sys::VX_TYPE_SOURCE,
            Value::Target(_) => sys::VX_TYPE_TARGET,
        }
    }

    /// Host handles that anything derived from this value must keep alive.
    pub(crate) fn keep_alive(&self) -> Vec<KeepAlive> {
        match self {
            Value::Image(image) => vec![image.keep_alive_handle()],
            Value::ArrayImage(images) => images.iter().map(Image::keep_alive_handle).collect(),
            Value::Blob(blob) => vec![blob.keep_alive_handle()],
            Value::Source(source) => vec![source.keep_alive_handle()],
            Value::Target(target) => vec![target.keep_alive_handle()],
            _ => Vec::new(),
        }
    }

    fn object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Image(image) => Some(image.object()),
            Value::Blob(blob) => Some(blob.object()),
            Value::Source(source) => Some(source.object()),
            Value::Target(target) => Some(target.object()),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(flag) => write!(f, "Bool({flag})"),
            Value::Int(number) => write!(f, "Int({number})"),
            Value::Double(number) => write!(f, "Double({number})"),
            Value::String(text) => write!(f, "String({text:?})"),
            Value::Enum(constant) => write!(f, "Enum({}:{})", constant.type_id, constant.value),
            Value::ArrayDouble(items) => write!(f, "ArrayDouble({items:?})"),
            Value::ArrayInt(items) => write!(f, "ArrayInt({items:?})"),
            Value::ArrayImage(images) => write!(f, "ArrayImage(len={})", images.len()),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from($v: $ty) -> Self {
                $body
            }
        })*
    };
}

value_from! {
    bool => |v| Value::Bool(v),
    i32 => |v| Value::Int(v),
    f64 => |v| Value::Double(v),
    &str => |v| Value::String(v.to_string()),
    String => |v| Value::String(v),
    Vec<f64> => |v| Value::ArrayDouble(v),
    &[f64] => |v| Value::ArrayDouble(v.to_vec()),
    Vec<i32> => |v| Value::ArrayInt(v),
    &[i32] => |v| Value::ArrayInt(v.to_vec()),
    Vec<Image> => |v| Value::ArrayImage(v),
    &[Image] => |v| Value::ArrayImage(v.to_vec()),
    Image => |v| Value::Image(v),
    &Image => |v| Value::Image(v.clone()),
    Blob => |v| Value::Blob(v),
    &Blob => |v| Value::Blob(v.clone()),
    Source => |v| Value::Source(v),
    &Source => |v| Value::Source(v.clone()),
    Target => |v| Value::Target(v),
    &Target => |v| Value::Target(v.clone()),
    EnumValue => |v| Value::Enum(v),
    Direction => |v| Value::Enum(EnumValue::of(v)),
    BandFormat => |v| Value::Enum(EnumValue::of(v)),
}

/// Owned engine value container; unset on drop.
pub struct NativeValue {
    raw: VxValue,
}

// Payloads are owned engine allocations and refcounted objects.
unsafe impl Send for NativeValue {}

impl NativeValue {
    pub(crate) fn new(type_id: u32) -> Self {
        let mut raw = VxValue::zeroed();
        unsafe { sys::vx_value_init(&mut raw, type_id) };
        NativeValue { raw }
    }

    pub(crate) fn type_id(&self) -> u32 {
        self.raw.ty
    }

    pub(crate) fn as_ptr(&self) -> *const VxValue {
        &self.raw
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut VxValue {
        &mut self.raw
    }

    /// Borrowed object held by the container, with a fresh reference.
    fn object(&self) -> Option<ObjectRef> {
        let raw = unsafe { sys::vx_value_get_object(self.as_ptr()) };
        unsafe { ObjectRef::from_borrowed(raw) }
    }
}

impl Drop for NativeValue {
    fn drop(&mut self) {
        unsafe { sys::vx_value_unset(&mut self.raw) };
    }
}

fn length(len: usize) -> Result<c_int> {
    c_int::try_from(len)
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("array of {len} items is too long")))
}

/// Encode `value` into a fresh native container.
pub(crate) fn encode(value: &Value) -> Result<NativeValue> {
    let mut native = NativeValue::new(value.type_id());
    let ptr = native.as_mut_ptr();
    match value {
        Value::Bool(flag) => unsafe { sys::vx_value_set_boolean(ptr, c_int::from(*flag)) },
        Value::Int(number) => unsafe { sys::vx_value_set_int(ptr, *number) },
        Value::Double(number) => unsafe { sys::vx_value_set_double(ptr, *number) },
        Value::String(text) => {
            let text = CString::new(text.as_str()).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("string contains an interior NUL byte")
                    .with_source(err)
            })?;
            unsafe { sys::vx_value_set_string(ptr, text.as_ptr()) };
        }
        Value::Enum(constant) => unsafe { sys::vx_value_set_enum(ptr, constant.value) },
        Value::ArrayDouble(items) => unsafe {
            sys::vx_value_set_array_double(ptr, items.as_ptr(), length(items.len())?)
        },
        Value::ArrayInt(items) => unsafe {
            sys::vx_value_set_array_int(ptr, items.as_ptr(), length(items.len())?)
        },
        Value::ArrayImage(images) => {
            unsafe { sys::vx_value_set_array_image(ptr, length(images.len())?) };
            let mut n: c_int = 0;
            let slots = unsafe { sys::vx_value_get_array_image(ptr, &mut n) };
            for (index, image) in images.iter().enumerate().take(n.max(0) as usize) {
                // Each slot owns the reference taken here.
                let reference = unsafe { sys::vx_object_ref(image.object().as_ptr()) };
                unsafe { *slots.add(index) = reference };
            }
        }
        Value::Image(_) | Value::Blob(_) | Value::Source(_) | Value::Target(_) => {
            if let Some(object) = value.object() {
                unsafe { sys::vx_value_set_object(ptr, object.as_ptr()) };
            }
        }
    }
    Ok(native)
}

/// A Rust type an operation output can be decoded into.
///
/// `TYPE_ID` picks the native container handed to the engine; `from_native`
/// runs only once the engine has filled a container of exactly that type.
pub trait FromOutput: Sized + Send + 'static {
    const TYPE_ID: u32;
    /// Accept whichever enum type the operation declares for this output.
    const ANY_ENUM: bool = false;

    #[doc(hidden)]
    fn from_native(value: &NativeValue, keep_alive: &[KeepAlive]) -> Option<Self>;
}

impl FromOutput for bool {
    const TYPE_ID: u32 = sys::VX_TYPE_BOOLEAN;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        Some(unsafe { sys::vx_value_get_boolean(value.as_ptr()) } != 0)
    }
}

impl FromOutput for i32 {
    const TYPE_ID: u32 = sys::VX_TYPE_INT;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        Some(unsafe { sys::vx_value_get_int(value.as_ptr()) })
    }
}

impl FromOutput for f64 {
    const TYPE_ID: u32 = sys::VX_TYPE_DOUBLE;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        Some(unsafe { sys::vx_value_get_double(value.as_ptr()) })
    }
}

impl FromOutput for String {
    const TYPE_ID: u32 = sys::VX_TYPE_STRING;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        let text = unsafe { sys::vx_value_get_string(value.as_ptr()) };
        if text.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned())
    }
}

fn array<T: Copy>(items: *const T, n: c_int) -> Vec<T> {
    if items.is_null() || n <= 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(items, n as usize) }.to_vec()
}

impl FromOutput for Vec<f64> {
    const TYPE_ID: u32 = sys::VX_TYPE_ARRAY_DOUBLE;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        let mut n: c_int = 0;
        let items = unsafe { sys::vx_value_get_array_double(value.as_ptr(), &mut n) };
        Some(array(items, n))
    }
}

impl FromOutput for Vec<i32> {
    const TYPE_ID: u32 = sys::VX_TYPE_ARRAY_INT;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        let mut n: c_int = 0;
        let items = unsafe { sys::vx_value_get_array_int(value.as_ptr(), &mut n) };
        Some(array(items, n))
    }
}

impl FromOutput for Image {
    const TYPE_ID: u32 = sys::VX_TYPE_IMAGE;

    fn from_native(value: &NativeValue, keep_alive: &[KeepAlive]) -> Option<Self> {
        value
            .object()
            .map(|object| Image::wrap(object, keep_alive.to_vec()))
    }
}

impl FromOutput for Vec<Image> {
    const TYPE_ID: u32 = sys::VX_TYPE_ARRAY_IMAGE;

    fn from_native(value: &NativeValue, keep_alive: &[KeepAlive]) -> Option<Self> {
        let mut n: c_int = 0;
        let slots = unsafe { sys::vx_value_get_array_image(value.as_ptr().cast_mut(), &mut n) };
        if slots.is_null() || n <= 0 {
            return Some(Vec::new());
        }
        unsafe { std::slice::from_raw_parts(slots, n as usize) }
            .iter()
            .map(|raw| {
                unsafe { ObjectRef::from_borrowed(*raw) }
                    .map(|object| Image::wrap(object, keep_alive.to_vec()))
            })
            .collect()
    }
}

impl FromOutput for Source {
    const TYPE_ID: u32 = sys::VX_TYPE_SOURCE;

    fn from_native(value: &NativeValue, keep_alive: &[KeepAlive]) -> Option<Self> {
        value
            .object()
            .map(|object| Source::wrap(None, object, keep_alive.to_vec()))
    }
}

impl FromOutput for Target {
    const TYPE_ID: u32 = sys::VX_TYPE_TARGET;

    fn from_native(value: &NativeValue, keep_alive: &[KeepAlive]) -> Option<Self> {
        value
            .object()
            .map(|object| Target::wrap(None, object, keep_alive.to_vec()))
    }
}

impl FromOutput for EnumValue {
    const TYPE_ID: u32 = sys::VX_TYPE_ENUM_BASE;
    const ANY_ENUM: bool = true;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        Some(EnumValue {
            type_id: value.type_id(),
            value: unsafe { sys::vx_value_get_enum(value.as_ptr()) },
        })
    }
}

impl FromOutput for Blob {
    const TYPE_ID: u32 = sys::VX_TYPE_BLOB;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        value.object().map(|object| Blob::wrap(object, Vec::new()))
    }
}

impl FromOutput for Direction {
    const TYPE_ID: u32 = <Direction as EnumType>::TYPE_ID;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        Direction::from_raw(unsafe { sys::vx_value_get_enum(value.as_ptr()) })
    }
}

impl FromOutput for BandFormat {
    const TYPE_ID: u32 = <BandFormat as EnumType>::TYPE_ID;

    fn from_native(value: &NativeValue, _: &[KeepAlive]) -> Option<Self> {
        BandFormat::from_raw(unsafe { sys::vx_value_get_enum(value.as_ptr()) })
    }
}

/// Type-erased decode used by output slots.
pub(crate) fn decode_erased<T: FromOutput>(
    value: &NativeValue,
    keep_alive: &[KeepAlive],
) -> Option<Box<dyn Any + Send>> {
    T::from_native(value, keep_alive).map(|decoded| Box::new(decoded) as Box<dyn Any + Send>)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn array_image_encoding_takes_one_reference_per_element() {
        let first = Image::black(2, 2).expect("black");
        let second = Image::black(2, 2).expect("black");
        let before = (first.object().ref_count(), second.object().ref_count());

        let value = Value::from(vec![first.clone(), second.clone()]);
        let native = encode(&value).expect("encode");
        drop(value);
        assert_eq!(first.object().ref_count(), before.0 + 1);
        assert_eq!(second.object().ref_count(), before.1 + 1);

        drop(native);
        assert_eq!(first.object().ref_count(), before.0);
        assert_eq!(second.object().ref_count(), before.1);
    }

    #[test]
    fn image_arrays_decode_with_a_reference_per_element() {
        let first = Image::black(1, 1).expect("black");
        let second = Image::black(2, 1).expect("black");
        let native = encode(&Value::from(vec![first.clone(), second.clone()])).expect("encode");
        let before = first.object().ref_count();

        let anchor: KeepAlive = Arc::new(7u8);
        let decoded = Vec::<Image>::from_native(&native, &[Arc::clone(&anchor)]).expect("decode");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].width(), 2);
        assert_eq!(first.object().ref_count(), before + 1);
        assert_eq!(decoded[0].predecessor_count(), 1);
        assert_eq!(Arc::strong_count(&anchor), 3);

        drop(decoded);
        assert_eq!(first.object().ref_count(), before);
        assert_eq!(Arc::strong_count(&anchor), 1);
    }

    #[test]
    fn stream_handles_decode_sharing_the_engine_object() {
        let source = Source::from_memory(b"P5 1 1 255\n\x07".to_vec()).expect("source");
        let native = encode(&Value::from(&source)).expect("encode");
        let decoded = Source::from_native(&native, &[]).expect("decode");
        assert_eq!(decoded.object().as_ptr(), source.object().as_ptr());
        assert_eq!(decoded.length().expect("length"), 12);

        let target = Target::to_memory().expect("target");
        let native = encode(&Value::from(&target)).expect("encode");
        let anchor: KeepAlive = Arc::new(());
        let decoded = Target::from_native(&native, &[Arc::clone(&anchor)]).expect("decode");
        assert_eq!(decoded.object().as_ptr(), target.object().as_ptr());
        assert!(decoded.is_memory());
        assert_eq!(Arc::strong_count(&anchor), 2);
    }

    #[test]
    fn enum_values_keep_their_declared_type() {
        let native = encode(&Value::from(BandFormat::Ushort)).expect("encode");
        let decoded = EnumValue::from_native(&native, &[]).expect("decode");
        assert_eq!(decoded, EnumValue::of(BandFormat::Ushort));
        let native = encode(&Value::from(Direction::Vertical)).expect("encode");
        assert_eq!(
            EnumValue::from_native(&native, &[]),
            Some(EnumValue::of(Direction::Vertical))
        );
    }

    #[test]
    fn kinds_follow_native_type_ids() {
        assert_eq!(ValueKind::of(sys::VX_TYPE_DIRECTION), Some(ValueKind::Enum));
        assert_eq!(ValueKind::of(sys::VX_TYPE_NONE), None);
        assert_eq!(Value::from(Direction::Vertical).type_id(), sys::VX_TYPE_DIRECTION);
        assert_eq!(Value::from("x").kind(), ValueKind::String);
    }

    #[test]
    fn strings_with_nul_are_rejected() {
        let err = encode(&Value::from("bad\0text")).err().expect("nul rejected");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn scalar_containers_decode_back() {
        let native = encode(&Value::from(vec![1.5, 2.5])).expect("encode");
        assert_eq!(Vec::<f64>::from_native(&native, &[]), Some(vec![1.5, 2.5]));
        let native = encode(&Value::from(BandFormat::Float)).expect("encode");
        assert_eq!(BandFormat::from_native(&native, &[]), Some(BandFormat::Float));
    }
}
