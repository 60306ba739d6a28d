//! Purpose: Describe the operations the engine registry offers.
//! Exports: `operations`, `describe`, `OperationInfo`, `ArgumentInfo`, `ArgumentDirection`.
//! Role: Backing for the CLI `list` and `describe` commands and for generic callers.
use std::ffi::{CStr, CString, c_char};
use std::ptr;

use serde::Serialize;

use super::diag;
use super::error::{Error, ErrorKind, Result};
use super::object::ObjectRef;
use super::sys;
use super::value::ValueKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentDirection {
    Input,
    Output,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ArgumentInfo {
    pub name: String,
    pub description: String,
    pub kind: Option<ValueKind>,
    pub type_name: String,
    pub direction: ArgumentDirection,
    pub required: bool,
    pub priority: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OperationInfo {
    pub nickname: String,
    pub description: String,
    pub arguments: Vec<ArgumentInfo>,
}

impl OperationInfo {
    pub fn inputs(&self) -> impl Iterator<Item = &ArgumentInfo> {
        self.arguments
            .iter()
            .filter(|argument| argument.direction == ArgumentDirection::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ArgumentInfo> {
        self.arguments
            .iter()
            .filter(|argument| argument.direction == ArgumentDirection::Output)
    }
}

fn owned(text: *const c_char) -> String {
    if text.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
}

/// Nicknames of every registered operation, in registry order.
pub fn operations() -> Vec<String> {
    (0..sys::vx_operation_class_count())
        .map(|index| owned(sys::vx_operation_class_nickname(index)))
        .collect()
}

/// Arguments of `name`, sorted by priority.
pub fn describe(name: &str) -> Result<OperationInfo> {
    let c_name = CString::new(name).map_err(|err| {
        Error::new(ErrorKind::UnknownOperation)
            .with_message(format!("operation name {name:?} contains a NUL byte"))
            .with_source(err)
    })?;
    let raw = unsafe { sys::vx_operation_new(c_name.as_ptr()) };
    let operation = unsafe { ObjectRef::from_raw(raw) }.ok_or_else(|| {
        diag::failure(ErrorKind::UnknownOperation, "operation not found").with_operation(name)
    })?;

    let mut arguments = Vec::new();
    for index in 0..unsafe { sys::vx_operation_n_args(operation.as_ptr()) } {
        let mut raw = sys::VxArgumentInfo {
            name: ptr::null(),
            description: ptr::null(),
            ty: sys::VX_TYPE_NONE,
            flags: 0,
            priority: 0,
        };
        if unsafe { sys::vx_operation_get_arg(operation.as_ptr(), index, &mut raw) } != 0 {
            continue;
        }
        let direction = if raw.flags & sys::VX_ARGUMENT_OUTPUT != 0 {
            ArgumentDirection::Output
        } else {
            ArgumentDirection::Input
        };
        arguments.push(ArgumentInfo {
            name: owned(raw.name),
            description: owned(raw.description),
            kind: ValueKind::of(raw.ty),
            type_name: owned(sys::vx_type_name(raw.ty)),
            direction,
            required: raw.flags & sys::VX_ARGUMENT_REQUIRED != 0,
            priority: raw.priority,
        });
    }
    arguments.sort_by_key(|argument| argument.priority);

    Ok(OperationInfo {
        nickname: name.to_string(),
        description: owned(unsafe { sys::vx_operation_get_description(operation.as_ptr()) }),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn registry_lists_builtin_operations() {
        let names = operations();
        for expected in ["black", "invert", "linear", "getpoint", "ppmload", "ppmsave_target"] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }

    #[test]
    fn describe_reports_directions_and_kinds() {
        let info = describe("linear").expect("linear");
        assert_eq!(info.description, "calculate (a * in + b)");
        let input = info.inputs().next().expect("first input");
        assert_eq!(input.name, "in");
        assert_eq!(input.kind, Some(ValueKind::Image));
        let out = info.outputs().next().expect("output");
        assert_eq!(out.name, "out");
        let uchar = info
            .arguments
            .iter()
            .find(|argument| argument.name == "uchar")
            .expect("uchar");
        assert!(!uchar.required);

        let json = serde_json::to_value(&info).expect("json");
        assert_eq!(json["arguments"][0]["direction"], "input");
    }

    #[test]
    #[serial]
    fn describe_unknown_operation_fails() {
        let err = describe("nonesuch").expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
        assert!(diag::drain_error().is_empty());
    }
}
