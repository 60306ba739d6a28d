// Engine start-up and shut-down; kept alone so no other test shares the process.
use std::sync::{Arc, Mutex};

use vipsrs::api::{Config, Image, LoggingDelegate, runtime};

#[derive(Default)]
struct Warnings(Mutex<Vec<String>>);

struct Collect(Arc<Warnings>);

impl LoggingDelegate for Collect {
    fn debug(&self, _: &str, _: &str) {}

    fn info(&self, _: &str, _: &str) {}

    fn warning(&self, _: &str, message: &str) {
        self.0.0.lock().expect("lock").push(message.to_string());
    }

    fn error(&self, _: &str, _: &str) {}
}

#[test]
fn start_run_and_shutdown() {
    let baseline = runtime::live_objects();
    let warnings = Arc::new(Warnings::default());
    let config = Config {
        concurrency: 2,
        leak_check: true,
        program_name: "lifecycle".to_string(),
    };
    runtime::start_with(&config, Some(Box::new(Collect(Arc::clone(&warnings))))).expect("start");
    runtime::start(2, None).expect("second start is a no-op");
    assert!(runtime::version().starts_with("8."));

    let image = Image::black(64, 64).expect("black");
    let inverted = image.invert().expect("invert");
    assert_eq!(inverted.avg().expect("avg"), 255.0);
    drop((image, inverted));
    assert_eq!(runtime::live_objects(), baseline);

    let leaked = Image::black(1, 1).expect("black");
    runtime::shutdown();
    let reported = warnings.0.lock().expect("lock").clone();
    assert_eq!(reported, vec![format!("{} objects alive at shutdown", baseline + 1)]);
    assert_eq!(Arc::strong_count(&warnings), 1);
    drop(leaked);
    assert_eq!(runtime::live_objects(), baseline);
}
