// Operation invocation: lookup, option strings, inputs, output slots, failures.
use serial_test::serial;
use vipsrs::api::{ErrorKind, Image, Options, drain_error, operation};

fn gradient() -> Image {
    Image::from_memory_copy(&[0u8, 10, 20, 30, 40, 250], 3, 2, 1).expect("image")
}

#[test]
#[serial]
fn success_populates_every_declared_output() {
    let image = gradient();
    let mut options = Options::new();
    options.set("in", &image);
    let value = options.output::<f64>("out");
    let x = options.optional_output::<i32>("x");
    let y = options.optional_output::<i32>("y");
    operation::call("max", None, &mut options).expect("max");
    assert_eq!(options.populated_outputs(), 3);
    assert_eq!(options.take(value).expect("out"), 250.0);
    assert_eq!(options.take(x).expect("x"), 2);
    assert_eq!(options.take(y).expect("y"), 1);
    assert_eq!(options.populated_outputs(), 0);
}

#[test]
#[serial]
fn failure_leaves_every_output_untouched() {
    let image = gradient();
    let mut options = Options::new();
    options.set("in", &image).set("x", 7).set("y", 0);
    let out = options.output::<Vec<f64>>("out_array");
    let err = operation::call("getpoint", None, &mut options).expect_err("out of range");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert_eq!(err.operation(), Some("getpoint"));
    assert!(err.message().unwrap_or_default().contains("out of range"));
    assert_eq!(options.populated_outputs(), 0);
    assert!(options.take_opt(out).is_none());
    assert!(drain_error().is_empty());
}

#[test]
#[serial]
fn missing_required_input_names_the_parameter() {
    let mut options = Options::new();
    options.set("width", 4);
    let _out = options.output::<Image>("out");
    let err = operation::call("black", None, &mut options).expect_err("height missing");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().unwrap_or_default().contains("parameter height not set"));
}

#[test]
#[serial]
fn option_string_supplies_inputs_structured_values_win() {
    let image = gradient();
    let mut options = Options::new();
    options.set("in", &image).set("b", vec![1.0]);
    let out = options.output::<Image>("out");
    operation::call("linear", Some("[a=2,b=100]"), &mut options).expect("linear");
    let scaled = options.take(out).expect("out");
    assert_eq!(scaled.getpoint(1, 0).expect("point"), vec![21.0]);
}

#[test]
#[serial]
fn malformed_option_string_is_reported() {
    let image = gradient();
    let mut options = Options::new();
    options.set("in", &image);
    let _out = options.output::<Image>("out");
    let err = operation::call("invert", Some("[nonesuch=1]"), &mut options).expect_err("bad key");
    assert_eq!(err.kind(), ErrorKind::InvalidOptionString);
    assert!(err.message().unwrap_or_default().contains("nonesuch"));
}

#[test]
#[serial]
fn engine_type_rejection_is_a_type_mismatch() {
    let mut options = Options::new();
    options.set("width", "wide").set("height", 2);
    let _out = options.output::<Image>("out");
    let err = operation::call("black", None, &mut options).expect_err("mismatch");
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert!(drain_error().is_empty());
}

#[test]
#[serial]
fn unknown_property_is_an_operation_failure() {
    let mut options = Options::new();
    options.set("colour", 3);
    let err = operation::call("black", None, &mut options).expect_err("unknown property");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().unwrap_or_default().contains("colour"));
}

#[test]
#[serial]
fn unknown_operation_is_reported() {
    let mut options = Options::new();
    let err = operation::call("sharpen_everything", None, &mut options).expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::UnknownOperation);
    assert_eq!(options.populated_outputs(), 0);
}

#[test]
#[serial]
fn rejected_input_fails_every_call_on_the_set() {
    let mut options = Options::new();
    options.set("width", 3).set("height", 2).set("ban\0ds", 2);
    let _out = options.output::<Image>("out");
    for _ in 0..2 {
        let err = operation::call("black", None, &mut options).expect_err("bad name");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.operation(), Some("black"));
        assert_eq!(options.populated_outputs(), 0);
    }
}

#[test]
#[serial]
fn oversized_dimensions_are_rejected() {
    let err = Image::from_buffer(b"P6\n4294967295 4294967295\n255\n", None)
        .expect_err("header overflows");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().unwrap_or_default().contains("image too large"));

    let err = Image::from_memory(vec![0u8; 16], 1 << 21, 1 << 21, 1 << 22)
        .expect_err("size overflows");
    assert_eq!(err.kind(), ErrorKind::Usage);
    assert!(err.message().unwrap_or_default().contains("image too large"));

    let err = Image::black(i32::MAX, i32::MAX).expect_err("too many samples");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().unwrap_or_default().contains("image too large"));
    assert!(drain_error().is_empty());
}
