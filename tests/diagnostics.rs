// Diagnostic channel: error buffer draining and engine log delivery.
use std::sync::{Arc, Mutex};

use serial_test::serial;
use vipsrs::api::{
    ErrorKind, Image, LoggingDelegate, Options, clear_error, drain_error, log, operation,
};

#[test]
#[serial]
fn failed_load_message_comes_from_the_engine() {
    clear_error();
    let err = Image::from_buffer(b"P5\n2 2\n255\n\x01", None)
        .and_then(|image| image.write_to_memory())
        .expect_err("truncated");
    assert_eq!(err.kind(), ErrorKind::OperationFailed);
    assert!(err.message().unwrap_or_default().contains("premature end of file"));
    assert!(drain_error().is_empty());
}

#[test]
#[serial]
fn failed_calls_leave_the_buffer_empty() {
    clear_error();
    let unknown = Image::from_buffer(b"GIF89a", None).expect_err("unknown format");
    assert_eq!(unknown.kind(), ErrorKind::OperationFailed);
    assert!(drain_error().is_empty());

    let mut options = Options::new();
    let err = operation::call("nonesuch", None, &mut options).expect_err("unknown");
    assert!(err.message().unwrap_or_default().contains("class \"nonesuch\" not found"));
    assert!(drain_error().is_empty());
    assert!(drain_error().is_empty());
}

#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
}

struct Forward(Arc<Recorder>);

impl Forward {
    fn record(&self, level: &str, message: &str) {
        self.0
            .lines
            .lock()
            .expect("lock")
            .push(format!("{level}: {message}"));
    }
}

impl LoggingDelegate for Forward {
    fn debug(&self, _domain: &str, message: &str) {
        self.record("debug", message);
    }

    fn info(&self, _domain: &str, message: &str) {
        self.record("info", message);
    }

    fn warning(&self, _domain: &str, message: &str) {
        self.record("warning", message);
    }

    fn error(&self, _domain: &str, message: &str) {
        self.record("error", message);
    }
}

#[test]
#[serial]
fn delegate_receives_engine_records_until_removed() {
    let recorder = Arc::new(Recorder::default());
    log::install(Box::new(Forward(Arc::clone(&recorder))));
    Image::black(2, 2).expect("black");
    log::remove();
    let delivered = recorder.lines.lock().expect("lock").len();
    Image::black(2, 2).expect("black");

    let lines = recorder.lines.lock().expect("lock").clone();
    assert_eq!(lines.len(), delivered);
    assert!(lines.iter().any(|line| line == "debug: building black"));
    assert_eq!(Arc::strong_count(&recorder), 1);
}
