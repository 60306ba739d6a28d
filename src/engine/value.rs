//! Purpose: Untyped value container exchanged across the ABI, plus its internal mirror.
//! Exports: `VxValue`, `VxValueData`, `vx_value_*`, `vx_type_name`, `Prop`.
//! Role: Carrier for operation properties in both directions.
//! Invariants: A value owns its payload (string, array, object ref) until unset.
//! Invariants: Setters never change the value's type; a mismatch logs a critical and is ignored.
//! Invariants: Array-of-image slots own one reference each; unset releases them.
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;

use super::abi::{
    VX_TYPE_ARRAY_DOUBLE, VX_TYPE_ARRAY_IMAGE, VX_TYPE_ARRAY_INT, VX_TYPE_BAND_FORMAT,
    VX_TYPE_BLOB, VX_TYPE_BOOLEAN, VX_TYPE_DIRECTION, VX_TYPE_DOUBLE, VX_TYPE_ENUM_BASE,
    VX_TYPE_IMAGE, VX_TYPE_INT, VX_TYPE_NONE, VX_TYPE_SOURCE, VX_TYPE_STRING, VX_TYPE_TARGET,
    VxType,
};
use super::diag;
use super::object::{Body, ObjRef, VxObject};

#[repr(C)]
pub struct VxValue {
    pub ty: VxType,
    pub data: VxValueData,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union VxValueData {
    pub v_int: i64,
    pub v_double: f64,
    pub v_pointer: *mut c_void,
}

impl VxValue {
    pub const fn zeroed() -> Self {
        VxValue {
            ty: VX_TYPE_NONE,
            data: VxValueData { v_int: 0 },
        }
    }

    fn pointer(&self) -> *mut c_void {
        unsafe { self.data.v_pointer }
    }

    fn holds(&self, ty: VxType, caller: &str) -> bool {
        if self.ty == ty {
            return true;
        }
        diag::critical(format_args!(
            "{caller}: assertion 'value holds {}' failed (holds {})",
            type_name(ty).to_string_lossy(),
            type_name(self.ty).to_string_lossy()
        ));
        false
    }

    /// Release the payload and zero the data, keeping the type.
    fn clear_payload(&mut self) {
        let pointer = self.pointer();
        match self.ty {
            VX_TYPE_STRING if !pointer.is_null() => {
                drop(unsafe { CString::from_raw(pointer.cast()) });
            }
            VX_TYPE_ARRAY_DOUBLE if !pointer.is_null() => {
                drop(unsafe { Box::from_raw(pointer.cast::<Vec<f64>>()) });
            }
            VX_TYPE_ARRAY_INT if !pointer.is_null() => {
                drop(unsafe { Box::from_raw(pointer.cast::<Vec<i32>>()) });
            }
            VX_TYPE_ARRAY_IMAGE if !pointer.is_null() => {
                let slots = unsafe { Box::from_raw(pointer.cast::<Vec<*mut VxObject>>()) };
                for slot in *slots {
                    drop(unsafe { ObjRef::adopt(slot) });
                }
            }
            ty if is_object_type(ty) && !pointer.is_null() => {
                drop(unsafe { ObjRef::adopt(pointer.cast()) });
            }
            _ => {}
        }
        self.data = VxValueData { v_int: 0 };
    }
}

pub(crate) fn is_object_type(ty: VxType) -> bool {
    matches!(
        ty,
        VX_TYPE_IMAGE | VX_TYPE_BLOB | VX_TYPE_SOURCE | VX_TYPE_TARGET
    )
}

pub(crate) fn is_enum_type(ty: VxType) -> bool {
    ty >= VX_TYPE_ENUM_BASE
}

pub(crate) fn object_type(object: &VxObject) -> VxType {
    match object.body {
        Body::Image(_) => VX_TYPE_IMAGE,
        Body::Blob(_) => VX_TYPE_BLOB,
        Body::Source(_) => VX_TYPE_SOURCE,
        Body::Target(_) => VX_TYPE_TARGET,
        Body::Operation(_) => VX_TYPE_NONE,
    }
}

pub(crate) fn type_name(ty: VxType) -> &'static CStr {
    match ty {
        VX_TYPE_BOOLEAN => c"gboolean",
        VX_TYPE_INT => c"gint",
        VX_TYPE_DOUBLE => c"gdouble",
        VX_TYPE_STRING => c"gchararray",
        VX_TYPE_ARRAY_DOUBLE => c"VipsArrayDouble",
        VX_TYPE_ARRAY_INT => c"VipsArrayInt",
        VX_TYPE_ARRAY_IMAGE => c"VipsArrayImage",
        VX_TYPE_IMAGE => c"VipsImage",
        VX_TYPE_BLOB => c"VipsBlob",
        VX_TYPE_SOURCE => c"VipsSource",
        VX_TYPE_TARGET => c"VipsTarget",
        VX_TYPE_DIRECTION => c"VipsDirection",
        VX_TYPE_BAND_FORMAT => c"VipsBandFormat",
        _ => c"void",
    }
}

/// Engine-side copy of a property value.
pub(crate) enum Prop {
    Bool(bool),
    Int(i32),
    Double(f64),
    String(CString),
    Enum(i32),
    ArrayDouble(Vec<f64>),
    ArrayInt(Vec<i32>),
    ArrayImage(Vec<ObjRef>),
    Object(ObjRef),
}

impl Prop {
    /// Copy out of `value`. Object payloads gain a reference.
    pub(crate) fn read(value: &VxValue) -> Result<Prop, String> {
        let pointer = value.pointer();
        let prop = match value.ty {
            VX_TYPE_BOOLEAN => Prop::Bool(unsafe { value.data.v_int } != 0),
            VX_TYPE_INT => Prop::Int(unsafe { value.data.v_int } as i32),
            VX_TYPE_DOUBLE => Prop::Double(unsafe { value.data.v_double }),
            VX_TYPE_STRING if !pointer.is_null() => {
                Prop::String(unsafe { CStr::from_ptr(pointer.cast()) }.to_owned())
            }
            VX_TYPE_ARRAY_DOUBLE if !pointer.is_null() => {
                Prop::ArrayDouble(unsafe { &*pointer.cast::<Vec<f64>>() }.clone())
            }
            VX_TYPE_ARRAY_INT if !pointer.is_null() => {
                Prop::ArrayInt(unsafe { &*pointer.cast::<Vec<i32>>() }.clone())
            }
            VX_TYPE_ARRAY_IMAGE if !pointer.is_null() => {
                let slots = unsafe { &*pointer.cast::<Vec<*mut VxObject>>() };
                let mut images = Vec::with_capacity(slots.len());
                for (index, slot) in slots.iter().enumerate() {
                    match unsafe { ObjRef::borrow(*slot) } {
                        Some(image) if image.image().is_some() => images.push(image),
                        _ => return Err(format!("array element {index} is not an image")),
                    }
                }
                Prop::ArrayImage(images)
            }
            ty if is_object_type(ty) && !pointer.is_null() => {
                let object = unsafe { ObjRef::borrow(pointer.cast()) }
                    .ok_or_else(|| "null object".to_string())?;
                Prop::Object(object)
            }
            ty if is_enum_type(ty) => Prop::Enum(unsafe { value.data.v_int } as i32),
            ty => {
                return Err(format!(
                    "no value of type {} to read",
                    type_name(ty).to_string_lossy()
                ));
            }
        };
        Ok(prop)
    }

    /// Store a copy into `value`, which already holds the property's type.
    pub(crate) fn write(&self, value: &mut VxValue) {
        value.clear_payload();
        value.data = match self {
            Prop::Bool(flag) => VxValueData {
                v_int: i64::from(*flag),
            },
            Prop::Int(number) | Prop::Enum(number) => VxValueData {
                v_int: i64::from(*number),
            },
            Prop::Double(number) => VxValueData { v_double: *number },
            Prop::String(text) => VxValueData {
                v_pointer: text.clone().into_raw().cast(),
            },
            Prop::ArrayDouble(items) => VxValueData {
                v_pointer: Box::into_raw(Box::new(items.clone())).cast(),
            },
            Prop::ArrayInt(items) => VxValueData {
                v_pointer: Box::into_raw(Box::new(items.clone())).cast(),
            },
            Prop::ArrayImage(images) => {
                let slots: Vec<*mut VxObject> =
                    images.iter().map(|image| image.clone().into_raw()).collect();
                VxValueData {
                    v_pointer: Box::into_raw(Box::new(slots)).cast(),
                }
            }
            Prop::Object(object) => VxValueData {
                v_pointer: object.clone().into_raw().cast(),
            },
        };
    }
}

macro_rules! value_mut {
    ($value:expr, $ty:expr, $caller:literal) => {
        match unsafe { $value.as_mut() } {
            Some(value) if value.holds($ty, $caller) => value,
            Some(_) => return,
            None => {
                diag::critical(concat!($caller, ": assertion 'value != NULL' failed"));
                return;
            }
        }
    };
}

macro_rules! value_ref {
    ($value:expr, $ty:expr, $caller:literal, $fallback:expr) => {
        match unsafe { $value.as_ref() } {
            Some(value) if value.holds($ty, $caller) => value,
            _ => return $fallback,
        }
    };
}

/// # Safety
/// `value` must point at a zeroed or unset `VxValue`.
pub unsafe extern "C" fn vx_value_init(value: *mut VxValue, ty: VxType) {
    if let Some(value) = unsafe { value.as_mut() } {
        value.ty = ty;
        value.data = VxValueData { v_int: 0 };
    }
}

/// # Safety
/// `value` must be null or point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_unset(value: *mut VxValue) {
    if let Some(value) = unsafe { value.as_mut() } {
        value.clear_payload();
        value.ty = VX_TYPE_NONE;
    }
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_set_boolean(value: *mut VxValue, flag: c_int) {
    let value = value_mut!(value, VX_TYPE_BOOLEAN, "vx_value_set_boolean");
    value.data = VxValueData {
        v_int: i64::from(flag != 0),
    };
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_boolean(value: *const VxValue) -> c_int {
    let value = value_ref!(value, VX_TYPE_BOOLEAN, "vx_value_get_boolean", 0);
    c_int::from(unsafe { value.data.v_int } != 0)
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_set_int(value: *mut VxValue, number: c_int) {
    let value = value_mut!(value, VX_TYPE_INT, "vx_value_set_int");
    value.data = VxValueData {
        v_int: i64::from(number),
    };
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_int(value: *const VxValue) -> c_int {
    let value = value_ref!(value, VX_TYPE_INT, "vx_value_get_int", 0);
    unsafe { value.data.v_int as c_int }
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_set_double(value: *mut VxValue, number: f64) {
    let value = value_mut!(value, VX_TYPE_DOUBLE, "vx_value_set_double");
    value.data = VxValueData { v_double: number };
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_double(value: *const VxValue) -> f64 {
    let value = value_ref!(value, VX_TYPE_DOUBLE, "vx_value_get_double", 0.0);
    unsafe { value.data.v_double }
}

/// Copies `text`.
///
/// # Safety
/// `value` must point at an initialized `VxValue`; `text` must be null or a C string.
pub unsafe extern "C" fn vx_value_set_string(value: *mut VxValue, text: *const c_char) {
    let value = value_mut!(value, VX_TYPE_STRING, "vx_value_set_string");
    value.clear_payload();
    if !text.is_null() {
        let owned = unsafe { CStr::from_ptr(text) }.to_owned();
        value.data = VxValueData {
            v_pointer: owned.into_raw().cast(),
        };
    }
}

/// Borrowed; valid until the value is changed or unset.
///
/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_string(value: *const VxValue) -> *const c_char {
    let value = value_ref!(value, VX_TYPE_STRING, "vx_value_get_string", ptr::null());
    value.pointer().cast_const().cast()
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_set_enum(value: *mut VxValue, constant: c_int) {
    let Some(target) = (unsafe { value.as_mut() }) else {
        return;
    };
    if !is_enum_type(target.ty) {
        diag::critical("vx_value_set_enum: assertion 'value holds an enum' failed");
        return;
    }
    target.data = VxValueData {
        v_int: i64::from(constant),
    };
}

/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_enum(value: *const VxValue) -> c_int {
    match unsafe { value.as_ref() } {
        Some(value) if is_enum_type(value.ty) => unsafe { value.data.v_int as c_int },
        _ => {
            diag::critical("vx_value_get_enum: assertion 'value holds an enum' failed");
            0
        }
    }
}

/// Copies `n` doubles from `items`.
///
/// # Safety
/// `value` must point at an initialized `VxValue`; `items` must hold `n` doubles.
pub unsafe extern "C" fn vx_value_set_array_double(
    value: *mut VxValue,
    items: *const f64,
    n: c_int,
) {
    let value = value_mut!(value, VX_TYPE_ARRAY_DOUBLE, "vx_value_set_array_double");
    let items = copy_array(items, n);
    value.clear_payload();
    value.data = VxValueData {
        v_pointer: Box::into_raw(Box::new(items)).cast(),
    };
}

/// # Safety
/// `value` must point at an initialized `VxValue`; `n` must be null or writable.
pub unsafe extern "C" fn vx_value_get_array_double(
    value: *const VxValue,
    n: *mut c_int,
) -> *const f64 {
    let value = value_ref!(
        value,
        VX_TYPE_ARRAY_DOUBLE,
        "vx_value_get_array_double",
        ptr::null()
    );
    unsafe { array_parts::<f64>(value.pointer(), n) }
}

/// Copies `n` ints from `items`.
///
/// # Safety
/// `value` must point at an initialized `VxValue`; `items` must hold `n` ints.
pub unsafe extern "C" fn vx_value_set_array_int(value: *mut VxValue, items: *const c_int, n: c_int) {
    let value = value_mut!(value, VX_TYPE_ARRAY_INT, "vx_value_set_array_int");
    let items = copy_array(items, n);
    value.clear_payload();
    value.data = VxValueData {
        v_pointer: Box::into_raw(Box::new(items)).cast(),
    };
}

/// # Safety
/// `value` must point at an initialized `VxValue`; `n` must be null or writable.
pub unsafe extern "C" fn vx_value_get_array_int(value: *const VxValue, n: *mut c_int) -> *const c_int {
    let value = value_ref!(value, VX_TYPE_ARRAY_INT, "vx_value_get_array_int", ptr::null());
    unsafe { array_parts::<c_int>(value.pointer(), n) }
}

/// Allocate `n` empty image slots. The caller fills them through
/// `vx_value_get_array_image`, giving each slot one reference.
///
/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_set_array_image(value: *mut VxValue, n: c_int) {
    let value = value_mut!(value, VX_TYPE_ARRAY_IMAGE, "vx_value_set_array_image");
    value.clear_payload();
    let slots: Vec<*mut VxObject> = vec![ptr::null_mut(); n.max(0) as usize];
    value.data = VxValueData {
        v_pointer: Box::into_raw(Box::new(slots)).cast(),
    };
}

/// Slot array owned by the value; writes transfer references into it.
///
/// # Safety
/// `value` must point at an initialized `VxValue`; `n` must be null or writable.
pub unsafe extern "C" fn vx_value_get_array_image(
    value: *mut VxValue,
    n: *mut c_int,
) -> *mut *mut VxObject {
    let value = value_ref!(
        value.cast_const(),
        VX_TYPE_ARRAY_IMAGE,
        "vx_value_get_array_image",
        ptr::null_mut()
    );
    let pointer = value.pointer();
    if pointer.is_null() {
        if let Some(n) = unsafe { n.as_mut() } {
            *n = 0;
        }
        return ptr::null_mut();
    }
    let slots = unsafe { &mut *pointer.cast::<Vec<*mut VxObject>>() };
    if let Some(n) = unsafe { n.as_mut() } {
        *n = slots.len() as c_int;
    }
    slots.as_mut_ptr()
}

/// Takes a new reference to `object`.
///
/// # Safety
/// `value` must point at an initialized `VxValue`; `object` must be null or live.
pub unsafe extern "C" fn vx_value_set_object(value: *mut VxValue, object: *mut VxObject) {
    let Some(target) = (unsafe { value.as_mut() }) else {
        return;
    };
    if !is_object_type(target.ty) {
        diag::critical("vx_value_set_object: assertion 'value holds an object' failed");
        return;
    }
    let reference = unsafe { ObjRef::borrow(object) };
    if let Some(reference) = &reference {
        if object_type(reference) != target.ty {
            diag::critical(format_args!(
                "vx_value_set_object: cannot store {} in a {} value",
                reference.type_name().to_string_lossy(),
                type_name(target.ty).to_string_lossy()
            ));
            return;
        }
    }
    target.clear_payload();
    target.data = VxValueData {
        v_pointer: reference
            .map(|reference| reference.into_raw().cast())
            .unwrap_or(ptr::null_mut()),
    };
}

/// Borrowed; the value keeps its reference.
///
/// # Safety
/// `value` must point at an initialized `VxValue`.
pub unsafe extern "C" fn vx_value_get_object(value: *const VxValue) -> *mut VxObject {
    match unsafe { value.as_ref() } {
        Some(value) if is_object_type(value.ty) => value.pointer().cast(),
        _ => ptr::null_mut(),
    }
}

pub extern "C" fn vx_type_name(ty: VxType) -> *const c_char {
    type_name(ty).as_ptr()
}

fn copy_array<T: Copy>(items: *const T, n: c_int) -> Vec<T> {
    if items.is_null() || n <= 0 {
        return Vec::new();
    }
    unsafe { std::slice::from_raw_parts(items, n as usize) }.to_vec()
}

unsafe fn array_parts<T>(pointer: *mut c_void, n: *mut c_int) -> *const T {
    let (data, len) = if pointer.is_null() {
        (ptr::null(), 0)
    } else {
        let items = unsafe { &*pointer.cast::<Vec<T>>() };
        (items.as_ptr(), items.len())
    };
    if let Some(n) = unsafe { n.as_mut() } {
        *n = len as c_int;
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::blob::BlobData;
    use crate::engine::object::vx_object_refcount;

    #[test]
    fn string_value_owns_a_copy() {
        let mut value = VxValue::zeroed();
        let text = CString::new("hello").expect("cstring");
        unsafe {
            vx_value_init(&mut value, VX_TYPE_STRING);
            vx_value_set_string(&mut value, text.as_ptr());
        }
        drop(text);
        let read = unsafe { CStr::from_ptr(vx_value_get_string(&value)) };
        assert_eq!(read.to_str().expect("utf8"), "hello");
        unsafe { vx_value_unset(&mut value) };
        assert_eq!(value.ty, VX_TYPE_NONE);
    }

    #[test]
    fn mismatched_setter_is_ignored() {
        let mut value = VxValue::zeroed();
        unsafe {
            vx_value_init(&mut value, VX_TYPE_INT);
            vx_value_set_int(&mut value, 7);
            vx_value_set_double(&mut value, 2.5);
        }
        assert_eq!(value.ty, VX_TYPE_INT);
        assert_eq!(unsafe { vx_value_get_int(&value) }, 7);
    }

    #[test]
    fn object_slot_holds_one_reference() {
        let blob = VxObject::create(Body::Blob(BlobData::copied(b"xyz")));
        let raw = std::ptr::from_ref::<VxObject>(&blob).cast_mut();
        let mut value = VxValue::zeroed();
        unsafe {
            vx_value_init(&mut value, VX_TYPE_BLOB);
            vx_value_set_object(&mut value, raw);
        }
        assert_eq!(unsafe { vx_object_refcount(raw) }, 2);
        unsafe { vx_value_unset(&mut value) };
        assert_eq!(unsafe { vx_object_refcount(raw) }, 1);
    }

    #[test]
    fn object_of_wrong_kind_is_rejected() {
        let blob = VxObject::create(Body::Blob(BlobData::copied(b"xyz")));
        let raw = std::ptr::from_ref::<VxObject>(&blob).cast_mut();
        let mut value = VxValue::zeroed();
        unsafe {
            vx_value_init(&mut value, VX_TYPE_IMAGE);
            vx_value_set_object(&mut value, raw);
        }
        assert!(unsafe { vx_value_get_object(&value) }.is_null());
        assert_eq!(unsafe { vx_object_refcount(raw) }, 1);
    }
}
