// Streaming bridges: custom sources and targets driven by host closures.
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serial_test::serial;
use vipsrs::api::{ErrorKind, Image, Source, SourceCustom, Target, TargetCustom, Whence};

fn encoded_gradient() -> Vec<u8> {
    let samples: Vec<u8> = (0..48).map(|value| (value * 5) as u8).collect();
    Image::from_memory_copy(&samples, 4, 4, 3)
        .expect("image")
        .write_to_buffer(".ppm")
        .expect("encode")
}

#[test]
fn custom_source_to_short_writing_target_round_trips() {
    let original = encoded_gradient();

    let mut reader = Cursor::new(original.clone());
    let source = SourceCustom::new().expect("source");
    source.on_read(move |buf| reader.read(buf));
    let image = Image::from_source(&source, None).expect("load");
    assert_eq!((image.width(), image.height(), image.bands()), (4, 4, 3));

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let finished = Arc::new(AtomicUsize::new(0));
    let finish_count = Arc::clone(&finished);
    let target = TargetCustom::new().expect("target");
    target
        .on_write(move |bytes| {
            let n = bytes.len().min(5);
            sink.lock().expect("lock").extend_from_slice(&bytes[..n]);
            Ok(n)
        })
        .on_finish(move || {
            finish_count.fetch_add(1, Ordering::SeqCst);
        });

    image.write_to_target(&target, ".ppm").expect("save");
    assert!(target.is_ended());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(*collected.lock().expect("lock"), original);
}

#[test]
fn image_keeps_custom_source_alive_after_handle_drop() {
    let original = encoded_gradient();
    let image = {
        let source = SourceCustom::from_reader(Cursor::new(original)).expect("source");
        Image::from_source(&source, None).expect("load")
    };
    assert_eq!(image.getpoint(3, 3).expect("point"), vec![225.0, 230.0, 235.0]);
}

#[test]
fn writer_target_receives_every_byte() {
    let image = Image::from_memory_copy(&[7u8, 8, 9, 10], 2, 2, 1).expect("image");
    let shared = Arc::new(Mutex::new(Vec::new()));
    struct Shared(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    let target = TargetCustom::from_writer(Shared(Arc::clone(&shared))).expect("target");
    image.write_to_target(&target, ".pgm").expect("save");
    assert_eq!(*shared.lock().expect("lock"), b"P5\n2 2\n255\n\x07\x08\x09\x0a");
}

#[test]
fn file_target_and_source_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.pgm");
    let image = Image::from_memory_copy(&[1u8, 2, 3, 4, 5, 6], 3, 2, 1).expect("image");
    let target = Target::to_file(&path).expect("target");
    image.write_to_target(&target, ".pgm").expect("save");
    drop(target);

    let source = Source::from_file(&path).expect("source");
    assert!(source.is_file());
    assert_eq!(source.filename().as_deref(), path.to_str());
    assert_eq!(source.find_loader().expect("loader"), "ppmload_source");
    let length = source.length().expect("length");
    assert_eq!(source.seek(-6, Whence::End).expect("seek"), length - 6);
    let mut pixels = [0u8; 6];
    assert_eq!(source.read(&mut pixels).expect("read"), 6);
    assert_eq!(pixels, [1, 2, 3, 4, 5, 6]);
}

#[test]
fn memory_target_collects_saved_bytes() {
    let image = Image::from_memory_copy(&[200u8], 1, 1, 1).expect("image");
    let target = Target::to_memory().expect("target");
    image.write_to_target(&target, ".pgm[ascii]").expect("save");
    assert_eq!(target.steal_text().expect("text"), "P2\n1 1\n255\n200\n");
}

#[test]
fn bridge_cycles_release_every_context() {
    let probe = Arc::new(Vec::<u8>::new());
    for _ in 0..10_000 {
        let held = Arc::clone(&probe);
        let source = SourceCustom::new().expect("source");
        source.on_read(move |buf| held.as_slice().read(buf));
        drop(source);
    }
    for _ in 0..10_000 {
        let held = Arc::clone(&probe);
        let target = TargetCustom::new().expect("target");
        target.on_finish(move || drop(held));
        drop(target);
    }
    assert_eq!(Arc::strong_count(&probe), 1);
}

#[test]
#[serial]
fn reregistering_from_inside_a_callback_fails_only_that_read() {
    let shared: Arc<Mutex<Option<SourceCustom>>> = Arc::new(Mutex::new(None));
    let custom = SourceCustom::new().expect("custom");
    let inner = Arc::clone(&shared);
    custom.on_read(move |_buf| {
        let guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(custom) = guard.as_ref() {
            custom.on_read(|_buf| Ok(0));
        }
        Ok(0)
    });
    let source = custom.source().clone();
    *shared.lock().unwrap_or_else(PoisonError::into_inner) = Some(custom);

    let mut buf = [0u8; 4];
    let err = source.read(&mut buf).expect_err("callback replaced itself");
    assert_eq!(err.kind(), ErrorKind::Io);

    let custom = shared
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .expect("custom");
    custom.on_read(|buf| {
        buf[0] = b'x';
        Ok(1)
    });
    assert_eq!(source.read(&mut buf).expect("read"), 1);
    assert_eq!(buf[0], b'x');
}
