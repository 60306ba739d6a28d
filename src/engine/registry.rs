//! Purpose: Operation classes, instances, and their named property slots.
//! Exports: `OpClass`, `ArgSpec`, `Args`, `OperationData`, property/build/introspection ABI.
//! Role: Dynamic lookup-by-name layer every engine operation goes through.
//! Invariants: Properties may be set only before build; outputs are filled only by build.
//! Invariants: Property type checks are exact; an engine-side transform is never applied.
use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr;
use std::sync::{Mutex, PoisonError};

use super::abi::{
    VX_ARGUMENT_INPUT, VX_ARGUMENT_OUTPUT, VX_ARGUMENT_REQUIRED, VX_PROPERTY_OK,
    VX_PROPERTY_TYPE_MISMATCH, VX_PROPERTY_UNKNOWN, VX_PROPERTY_UNSET, VX_TYPE_ARRAY_DOUBLE,
    VX_TYPE_ARRAY_INT, VX_TYPE_BAND_FORMAT, VX_TYPE_BOOLEAN, VX_TYPE_DIRECTION, VX_TYPE_DOUBLE,
    VX_TYPE_INT, VX_TYPE_STRING, VxArgumentInfo, VxType, VxValue,
};
use super::diag;
use super::image::BandFormat;
use super::object::{Body, ObjRef, VxObject};
use super::value::{Prop, is_enum_type, type_name};
use super::{ops, ppm};

pub(crate) struct ArgSpec {
    pub(crate) name: &'static CStr,
    pub(crate) description: &'static CStr,
    pub(crate) ty: VxType,
    pub(crate) flags: u32,
    pub(crate) priority: i32,
}

impl ArgSpec {
    pub(crate) const fn input(
        name: &'static CStr,
        description: &'static CStr,
        ty: VxType,
        priority: i32,
    ) -> Self {
        ArgSpec {
            name,
            description,
            ty,
            flags: VX_ARGUMENT_REQUIRED | VX_ARGUMENT_INPUT,
            priority,
        }
    }

    pub(crate) const fn optional_input(
        name: &'static CStr,
        description: &'static CStr,
        ty: VxType,
        priority: i32,
    ) -> Self {
        ArgSpec {
            name,
            description,
            ty,
            flags: VX_ARGUMENT_INPUT,
            priority,
        }
    }

    pub(crate) const fn output(
        name: &'static CStr,
        description: &'static CStr,
        ty: VxType,
        priority: i32,
    ) -> Self {
        ArgSpec {
            name,
            description,
            ty,
            flags: VX_ARGUMENT_REQUIRED | VX_ARGUMENT_OUTPUT,
            priority,
        }
    }

    pub(crate) const fn optional_output(
        name: &'static CStr,
        description: &'static CStr,
        ty: VxType,
        priority: i32,
    ) -> Self {
        ArgSpec {
            name,
            description,
            ty,
            flags: VX_ARGUMENT_OUTPUT,
            priority,
        }
    }

    fn is_input(&self) -> bool {
        self.flags & VX_ARGUMENT_INPUT != 0
    }

    fn is_output(&self) -> bool {
        self.flags & VX_ARGUMENT_OUTPUT != 0
    }

    fn is_required(&self) -> bool {
        self.flags & VX_ARGUMENT_REQUIRED != 0
    }

    fn label(&self) -> std::borrow::Cow<'static, str> {
        self.name.to_string_lossy()
    }
}

pub(crate) type BuildFn = fn(&mut Args<'_>) -> Result<(), String>;

pub(crate) struct OpClass {
    pub(crate) nickname: &'static CStr,
    pub(crate) description: &'static CStr,
    pub(crate) args: &'static [ArgSpec],
    pub(crate) build: BuildFn,
}

impl OpClass {
    fn label(&self) -> std::borrow::Cow<'static, str> {
        self.nickname.to_string_lossy()
    }

    fn find(&self, name: &[u8]) -> Option<usize> {
        self.args
            .iter()
            .position(|arg| arg.name.to_bytes() == name)
    }
}

fn classes() -> impl Iterator<Item = &'static OpClass> {
    ops::CLASSES.iter().chain(ppm::CLASSES.iter()).copied()
}

pub(crate) fn lookup(nickname: &str) -> Option<&'static OpClass> {
    classes().find(|class| class.nickname.to_bytes() == nickname.as_bytes())
}

pub(crate) struct OperationData {
    pub(crate) class: &'static OpClass,
    state: Mutex<OpState>,
}

struct OpState {
    slots: Vec<Option<Prop>>,
    built: bool,
}

/// Property slots handed to a build function.
pub(crate) struct Args<'a> {
    class: &'static OpClass,
    slots: &'a mut [Option<Prop>],
}

impl Args<'_> {
    fn slot(&self, name: &str) -> Option<&Prop> {
        let index = self.class.find(name.as_bytes())?;
        self.slots[index].as_ref()
    }

    fn missing(name: &str) -> String {
        format!("parameter {name} not set")
    }

    pub(crate) fn image(&self, name: &str) -> Result<ObjRef, String> {
        match self.slot(name) {
            Some(Prop::Object(object)) if object.image().is_some() => Ok(object.clone()),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn images(&self, name: &str) -> Result<Vec<ObjRef>, String> {
        match self.slot(name) {
            Some(Prop::ArrayImage(images)) => Ok(images.clone()),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn object(&self, name: &str) -> Result<ObjRef, String> {
        match self.slot(name) {
            Some(Prop::Object(object)) => Ok(object.clone()),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn opt_int(&self, name: &str) -> Option<i32> {
        match self.slot(name) {
            Some(Prop::Int(number)) => Some(*number),
            _ => None,
        }
    }

    pub(crate) fn int(&self, name: &str) -> Result<i32, String> {
        self.opt_int(name).ok_or_else(|| Self::missing(name))
    }

    pub(crate) fn opt_double(&self, name: &str) -> Option<f64> {
        match self.slot(name) {
            Some(Prop::Double(number)) => Some(*number),
            _ => None,
        }
    }

    pub(crate) fn bool_or(&self, name: &str, default: bool) -> bool {
        match self.slot(name) {
            Some(Prop::Bool(flag)) => *flag,
            _ => default,
        }
    }

    pub(crate) fn enum_value(&self, name: &str) -> Result<i32, String> {
        match self.slot(name) {
            Some(Prop::Enum(constant)) => Ok(*constant),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn string(&self, name: &str) -> Result<String, String> {
        match self.slot(name) {
            Some(Prop::String(text)) => Ok(text.to_string_lossy().into_owned()),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn array_double(&self, name: &str) -> Result<Vec<f64>, String> {
        match self.slot(name) {
            Some(Prop::ArrayDouble(items)) => Ok(items.clone()),
            _ => Err(Self::missing(name)),
        }
    }

    pub(crate) fn set(&mut self, name: &str, prop: Prop) {
        match self.class.find(name.as_bytes()) {
            Some(index) => self.slots[index] = Some(prop),
            None => diag::critical(format_args!(
                "{}: build wrote unknown property \"{name}\"",
                self.class.label()
            )),
        }
    }
}

pub(crate) const DIRECTION_NICKS: &[(&str, i32)] = &[("horizontal", 0), ("vertical", 1)];

fn enum_from_text(ty: VxType, text: &str) -> Option<i32> {
    if let Ok(number) = text.parse::<i32>() {
        return Some(number);
    }
    match ty {
        VX_TYPE_DIRECTION => DIRECTION_NICKS
            .iter()
            .find(|(nick, _)| nick.eq_ignore_ascii_case(text))
            .map(|(_, value)| *value),
        VX_TYPE_BAND_FORMAT => BandFormat::ALL
            .into_iter()
            .find(|format| format.nick().eq_ignore_ascii_case(text))
            .map(|format| format as i32),
        _ => None,
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_list<T: std::str::FromStr>(text: &str) -> Option<Vec<T>> {
    text.split_whitespace()
        .map(|item| item.parse::<T>().ok())
        .collect()
}

fn prop_from_text(ty: VxType, text: Option<&str>) -> Option<Prop> {
    let Some(text) = text else {
        return (ty == VX_TYPE_BOOLEAN).then_some(Prop::Bool(true));
    };
    match ty {
        VX_TYPE_BOOLEAN => parse_bool(text).map(Prop::Bool),
        VX_TYPE_INT => text.parse().ok().map(Prop::Int),
        VX_TYPE_DOUBLE => text.parse().ok().map(Prop::Double),
        VX_TYPE_STRING => CString::new(text).ok().map(Prop::String),
        VX_TYPE_ARRAY_DOUBLE => parse_list(text).map(Prop::ArrayDouble),
        VX_TYPE_ARRAY_INT => parse_list(text).map(Prop::ArrayInt),
        ty if is_enum_type(ty) => enum_from_text(ty, text).map(Prop::Enum),
        _ => None,
    }
}

fn operation_ref<'a>(object: *const VxObject, caller: &str) -> Option<&'a OperationData> {
    let data = unsafe { object.as_ref() }.and_then(VxObject::operation);
    if data.is_none() {
        diag::critical(format_args!(
            "{caller}: assertion 'VIPS_IS_OPERATION (operation)' failed"
        ));
    }
    data
}

fn name_bytes<'a>(name: *const c_char) -> Option<&'a [u8]> {
    if name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(name) }.to_bytes())
}

/// New instance of the class called `name`, or null with the error buffer set.
///
/// # Safety
/// `name` must be null or a valid C string.
pub unsafe extern "C" fn vx_operation_new(name: *const c_char) -> *mut VxObject {
    let name = name_bytes(name)
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    let Some(class) = lookup(&name) else {
        diag::error("VipsOperation", format_args!("class \"{name}\" not found"));
        return ptr::null_mut();
    };
    let slots = class.args.iter().map(|_| None).collect();
    let data = OperationData {
        class,
        state: Mutex::new(OpState {
            slots,
            built: false,
        }),
    };
    VxObject::create(Body::Operation(data)).into_raw()
}

/// Copy `value` into the input called `name`.
///
/// Returns `VX_PROPERTY_OK`, `VX_PROPERTY_UNKNOWN` (no such input, or already built),
/// or `VX_PROPERTY_TYPE_MISMATCH`; failures set the error buffer.
///
/// # Safety
/// `object` must be a live operation, `name` a C string, `value` an initialized value.
pub unsafe extern "C" fn vx_object_set_property(
    object: *mut VxObject,
    name: *const c_char,
    value: *const VxValue,
) -> c_int {
    let Some(operation) = operation_ref(object, "vx_object_set_property") else {
        return VX_PROPERTY_UNKNOWN;
    };
    let (Some(name), Some(value)) = (name_bytes(name), unsafe { value.as_ref() }) else {
        return VX_PROPERTY_UNKNOWN;
    };
    let class = operation.class;
    let label = String::from_utf8_lossy(name);
    let mut state = operation.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.built {
        diag::error(
            &class.label(),
            format_args!("cannot set \"{label}\" on a built operation"),
        );
        return VX_PROPERTY_UNKNOWN;
    }
    let Some(index) = class.find(name).filter(|index| class.args[*index].is_input()) else {
        diag::error(&class.label(), format_args!("no input property named \"{label}\""));
        return VX_PROPERTY_UNKNOWN;
    };
    let arg = &class.args[index];
    if value.ty != arg.ty {
        diag::error(
            &class.label(),
            format_args!(
                "property \"{label}\" expects {} but was given {}",
                type_name(arg.ty).to_string_lossy(),
                type_name(value.ty).to_string_lossy()
            ),
        );
        return VX_PROPERTY_TYPE_MISMATCH;
    }
    match Prop::read(value) {
        Ok(prop) => {
            state.slots[index] = Some(prop);
            VX_PROPERTY_OK
        }
        Err(message) => {
            diag::error(&class.label(), format_args!("property \"{label}\": {message}"));
            VX_PROPERTY_TYPE_MISMATCH
        }
    }
}

/// Copy the property called `name` into `value`, which must already hold the property's type.
///
/// Returns `VX_PROPERTY_OK`, `VX_PROPERTY_UNKNOWN`, `VX_PROPERTY_TYPE_MISMATCH`
/// (nothing written), or `VX_PROPERTY_UNSET`.
///
/// # Safety
/// `object` must be a live operation, `name` a C string, `value` an initialized value.
pub unsafe extern "C" fn vx_object_get_property(
    object: *mut VxObject,
    name: *const c_char,
    value: *mut VxValue,
) -> c_int {
    let Some(operation) = operation_ref(object, "vx_object_get_property") else {
        return VX_PROPERTY_UNKNOWN;
    };
    let (Some(name), Some(value)) = (name_bytes(name), unsafe { value.as_mut() }) else {
        return VX_PROPERTY_UNKNOWN;
    };
    let class = operation.class;
    let label = String::from_utf8_lossy(name);
    let Some(index) = class.find(name) else {
        diag::error(&class.label(), format_args!("no property named \"{label}\""));
        return VX_PROPERTY_UNKNOWN;
    };
    let arg = &class.args[index];
    if value.ty != arg.ty {
        diag::critical(format_args!(
            "{}: unable to read property \"{label}\" of type {} into a {} value",
            class.label(),
            type_name(arg.ty).to_string_lossy(),
            type_name(value.ty).to_string_lossy()
        ));
        return VX_PROPERTY_TYPE_MISMATCH;
    }
    let state = operation.state.lock().unwrap_or_else(PoisonError::into_inner);
    match &state.slots[index] {
        Some(prop) => {
            prop.write(value);
            VX_PROPERTY_OK
        }
        None => VX_PROPERTY_UNSET,
    }
}

/// Apply `[name=value,flag,...]` to the operation's inputs. Returns 0 on success.
///
/// # Safety
/// `object` must be a live operation and `text` a C string.
pub unsafe extern "C" fn vx_object_set_from_string(object: *mut VxObject, text: *const c_char) -> c_int {
    let Some(operation) = operation_ref(object, "vx_object_set_from_string") else {
        return -1;
    };
    let Some(text) = name_bytes(text) else {
        return -1;
    };
    let class = operation.class;
    let text = String::from_utf8_lossy(text);
    let body = text.trim();
    let body = body
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(body);

    let mut parsed = Vec::new();
    for item in body.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (key, raw) = match item.split_once('=') {
            Some((key, raw)) => (key.trim(), Some(raw.trim())),
            None => (item, None),
        };
        let Some(index) = class
            .find(key.as_bytes())
            .filter(|index| class.args[*index].is_input())
        else {
            diag::error(&class.label(), format_args!("no input property named \"{key}\""));
            return -1;
        };
        let arg = &class.args[index];
        let Some(prop) = prop_from_text(arg.ty, raw) else {
            diag::error(
                &class.label(),
                format_args!(
                    "bad value \"{}\" for {} property \"{key}\"",
                    raw.unwrap_or(""),
                    type_name(arg.ty).to_string_lossy()
                ),
            );
            return -1;
        };
        parsed.push((index, prop));
    }

    let mut state = operation.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.built {
        diag::error(&class.label(), "cannot set options on a built operation");
        return -1;
    }
    for (index, prop) in parsed {
        state.slots[index] = Some(prop);
    }
    0
}

/// Run the operation. Returns 0 on success; -1 with the error buffer set otherwise.
///
/// # Safety
/// `object` must be a live operation.
pub unsafe extern "C" fn vx_operation_build(object: *mut VxObject) -> c_int {
    let Some(operation) = operation_ref(object, "vx_operation_build") else {
        return -1;
    };
    let class = operation.class;
    let mut state = operation.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.built {
        diag::error(&class.label(), "operation has already been built");
        return -1;
    }
    for (arg, slot) in class.args.iter().zip(state.slots.iter()) {
        if arg.is_input() && arg.is_required() && slot.is_none() {
            diag::error(&class.label(), format_args!("parameter {} not set", arg.label()));
            return -1;
        }
    }
    diag::debug(format_args!("building {}", class.label()));
    let mut args = Args {
        class,
        slots: &mut state.slots,
    };
    if let Err(message) = (class.build)(&mut args) {
        diag::error(&class.label(), message);
        return -1;
    }
    state.built = true;
    0
}

/// Drop the operation's own references to its outputs.
///
/// # Safety
/// `object` must be a live operation.
pub unsafe extern "C" fn vx_object_unref_outputs(object: *mut VxObject) {
    let Some(operation) = operation_ref(object, "vx_object_unref_outputs") else {
        return;
    };
    let mut state = operation.state.lock().unwrap_or_else(PoisonError::into_inner);
    for (arg, slot) in operation.class.args.iter().zip(state.slots.iter_mut()) {
        if arg.is_output() {
            *slot = None;
        }
    }
}

pub extern "C" fn vx_operation_class_count() -> c_int {
    classes().count() as c_int
}

/// Nickname of the class at `index`, or null past the end.
pub extern "C" fn vx_operation_class_nickname(index: c_int) -> *const c_char {
    usize::try_from(index)
        .ok()
        .and_then(|index| classes().nth(index))
        .map(|class| class.nickname.as_ptr())
        .unwrap_or(ptr::null())
}

/// # Safety
/// `object` must be a live operation.
pub unsafe extern "C" fn vx_operation_get_description(object: *mut VxObject) -> *const c_char {
    operation_ref(object, "vx_operation_get_description")
        .map(|operation| operation.class.description.as_ptr())
        .unwrap_or(ptr::null())
}

/// # Safety
/// `object` must be a live operation.
pub unsafe extern "C" fn vx_operation_n_args(object: *mut VxObject) -> c_int {
    operation_ref(object, "vx_operation_n_args")
        .map(|operation| operation.class.args.len() as c_int)
        .unwrap_or(0)
}

/// Fill `out` with the argument at `index`. Returns 0 on success.
///
/// # Safety
/// `object` must be a live operation; `out` must be writable.
pub unsafe extern "C" fn vx_operation_get_arg(
    object: *mut VxObject,
    index: c_int,
    out: *mut VxArgumentInfo,
) -> c_int {
    let Some(operation) = operation_ref(object, "vx_operation_get_arg") else {
        return -1;
    };
    let (Some(arg), Some(out)) = (
        usize::try_from(index)
            .ok()
            .and_then(|index| operation.class.args.get(index)),
        unsafe { out.as_mut() },
    ) else {
        return -1;
    };
    *out = VxArgumentInfo {
        name: arg.name.as_ptr(),
        description: arg.description.as_ptr(),
        ty: arg.ty,
        flags: arg.flags,
        priority: arg.priority,
    };
    0
}
