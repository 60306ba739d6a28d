//! Purpose: Drive one operation call against the engine registry.
//! Exports: `call`.
//! Role: Lookup, options, inputs, build, output extraction, teardown.
//! Invariants: Teardown (`unref_outputs`, then release) runs once on every path.
//! Invariants: Outputs are decoded into temporaries first; slots change only on full success.
//! Invariants: The engine error buffer is drained only after a detected failure.
use std::any::Any;
use std::ffi::{CStr, CString};
use std::ptr;

use super::diag;
use super::error::{Error, ErrorKind, Result};
use super::object::ObjectRef;
use super::options::Options;
use super::sys;
use super::value::{NativeValue, ValueKind};

/// Owns the operation instance for the length of one call.
struct OperationGuard {
    object: ObjectRef,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        unsafe { sys::vx_object_unref_outputs(self.object.as_ptr()) };
    }
}

/// Type the operation declares for its argument `name`.
fn declared_type(operation: *mut sys::VxObject, name: &CStr) -> Option<u32> {
    let count = unsafe { sys::vx_operation_n_args(operation) };
    (0..count).find_map(|index| {
        let mut info = sys::VxArgumentInfo {
            name: ptr::null(),
            description: ptr::null(),
            ty: sys::VX_TYPE_NONE,
            flags: 0,
            priority: 0,
        };
        if unsafe { sys::vx_operation_get_arg(operation, index, &mut info) } != 0 || info.name.is_null() {
            return None;
        }
        (unsafe { CStr::from_ptr(info.name) } == name).then_some(info.ty)
    })
}

/// Run the operation `name` with `options`, filling its output slots.
///
/// `option_string` is the legacy `[name=value,...]` form. It is applied before
/// the structured inputs, so a structured input of the same name wins.
pub fn call(name: &str, option_string: Option<&str>, options: &mut Options) -> Result<()> {
    if let Some(err) = options.deferred() {
        return Err(err.with_operation(name));
    }
    let c_name = CString::new(name).map_err(|err| {
        Error::new(ErrorKind::UnknownOperation)
            .with_message(format!("operation name {name:?} contains a NUL byte"))
            .with_operation(name)
            .with_source(err)
    })?;

    let raw = unsafe { sys::vx_operation_new(c_name.as_ptr()) };
    let Some(object) = (unsafe { ObjectRef::from_raw(raw) }) else {
        return Err(diag::failure(ErrorKind::UnknownOperation, "operation not found")
            .with_operation(name));
    };
    let guard = OperationGuard { object };
    let operation = guard.object.as_ptr();

    if let Some(text) = option_string.map(str::trim).filter(|text| !text.is_empty()) {
        let text = CString::new(text).map_err(|err| {
            Error::new(ErrorKind::InvalidOptionString)
                .with_message("option string contains a NUL byte")
                .with_operation(name)
                .with_source(err)
        })?;
        if unsafe { sys::vx_object_set_from_string(operation, text.as_ptr()) } != 0 {
            return Err(diag::failure(ErrorKind::InvalidOptionString, "bad option string")
                .with_operation(name));
        }
    }

    for input in options.inputs() {
        let status =
            unsafe { sys::vx_object_set_property(operation, input.name.as_ptr(), input.native.as_ptr()) };
        match status {
            sys::VX_PROPERTY_OK => {}
            sys::VX_PROPERTY_TYPE_MISMATCH => {
                return Err(diag::failure(ErrorKind::TypeMismatch, "input type mismatch")
                    .with_operation(name));
            }
            _ => {
                return Err(diag::failure(ErrorKind::OperationFailed, "unable to set input")
                    .with_operation(name));
            }
        }
    }

    tracing::debug!(operation = name, inputs = options.inputs().len(), "building operation");
    if unsafe { sys::vx_operation_build(operation) } != 0 {
        return Err(diag::failure(ErrorKind::OperationFailed, "build failed").with_operation(name));
    }

    let keep_alive = options.keep_alive();
    let mut decoded: Vec<Option<Box<dyn Any + Send>>> = Vec::with_capacity(options.outputs().len());
    for output in options.outputs() {
        let label = output.name.to_string_lossy();
        let type_id = if output.any_enum {
            declared_type(operation, &output.name)
                .filter(|declared| *declared >= sys::VX_TYPE_ENUM_BASE)
                .unwrap_or(output.type_id)
        } else {
            output.type_id
        };
        let mut native = NativeValue::new(type_id);
        let status =
            unsafe { sys::vx_object_get_property(operation, output.name.as_ptr(), native.as_mut_ptr()) };
        let value = match status {
            sys::VX_PROPERTY_OK => (output.decode)(&native, &keep_alive),
            sys::VX_PROPERTY_UNSET => None,
            sys::VX_PROPERTY_TYPE_MISMATCH => {
                // Output slots are declared by typed wrappers; a mismatch is a wrapper bug.
                let kind = ValueKind::of(native.type_id());
                panic!("TypeMismatch: output \"{label}\" of \"{name}\" cannot be read as {kind:?}");
            }
            _ => {
                return Err(diag::failure(ErrorKind::OperationFailed, "unable to read output")
                    .with_operation(name));
            }
        };
        if value.is_none() && output.required {
            return Err(Error::new(ErrorKind::OperationFailed)
                .with_message(format!("output \"{label}\" was not produced"))
                .with_operation(name));
        }
        decoded.push(value);
    }

    options.commit(decoded);
    tracing::debug!(operation = name, outputs = options.populated_outputs(), "operation complete");
    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::Image;
    use serial_test::serial;

    #[test]
    #[serial]
    fn unknown_operation_is_reported_by_name() {
        diag::clear_error();
        let mut options = Options::new();
        let err = call("nonesuch", None, &mut options).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownOperation);
        assert_eq!(err.operation(), Some("nonesuch"));
        assert!(err.message().unwrap_or_default().contains("class \"nonesuch\" not found"));
        assert!(diag::drain_error().is_empty());
    }

    #[test]
    #[serial]
    fn option_string_is_overridden_by_structured_inputs() {
        let mut options = Options::new();
        options.set("width", 3).set("height", 2);
        let out = options.output::<Image>("out");
        call("black", Some("[width=9,bands=2]"), &mut options).expect("black");
        let image = options.take(out).expect("out");
        assert_eq!((image.width(), image.height(), image.bands()), (3, 2, 2));
    }

    #[test]
    #[serial]
    fn malformed_option_strings_fail_before_build() {
        let mut options = Options::new();
        options.set("width", 3).set("height", 2);
        let out = options.output::<Image>("out");
        let err = call("black", Some("[colour=red]"), &mut options).expect_err("bad options");
        assert_eq!(err.kind(), ErrorKind::InvalidOptionString);
        assert_eq!(options.populated_outputs(), 0);
        assert!(options.take_opt(out).is_none());
    }

    #[test]
    #[serial]
    fn input_type_rejection_maps_to_type_mismatch() {
        let mut options = Options::new();
        options.set("width", "three").set("height", 2);
        options.output::<Image>("out");
        let err = call("black", None, &mut options).expect_err("string width");
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn declared_types_resolve_by_argument_name() {
        let raw = unsafe { sys::vx_operation_new(c"flip".as_ptr()) };
        let operation = unsafe { ObjectRef::from_raw(raw) }.expect("flip");
        assert_eq!(
            declared_type(operation.as_ptr(), c"direction"),
            Some(sys::VX_TYPE_DIRECTION)
        );
        assert_eq!(declared_type(operation.as_ptr(), c"out"), Some(sys::VX_TYPE_IMAGE));
        assert_eq!(declared_type(operation.as_ptr(), c"nonesuch"), None);
    }

    #[test]
    #[serial]
    #[should_panic(expected = "TypeMismatch")]
    fn output_decode_mismatch_panics() {
        let image = Image::black(2, 2).expect("black");
        let mut options = Options::new();
        options.set("in", &image);
        options.output::<Image>("out");
        let _ = call("avg", None, &mut options);
    }
}
