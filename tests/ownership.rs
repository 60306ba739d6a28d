// Ownership graph: keep-alive edges, reference counts, repeated calls.
use std::io::Write;

use serial_test::serial;
use vipsrs::api::{Image, Options, operation};

const PGM: &[u8] = b"P5\n3 1\n255\n\x01\x02\x03";

#[test]
fn derived_image_outlives_file_backed_input() {
    let mut file = tempfile::Builder::new().suffix(".pgm").tempfile().expect("tempfile");
    file.write_all(PGM).expect("write");
    let loaded = Image::from_file(file.path()).expect("load");
    let inverted = loaded.invert().expect("invert");
    drop(loaded);
    assert_eq!(inverted.write_to_memory().expect("pixels"), vec![254, 253, 252]);
}

#[test]
fn derived_image_outlives_caller_memory() {
    let image = Image::from_memory(vec![5u16, 6, 7, 8], 2, 2, 1).expect("image");
    let flipped = image
        .flip(vipsrs::api::Direction::Vertical)
        .expect("flip");
    let doubled = flipped.linear(&[2.0], &[0.0]).expect("linear");
    drop(image);
    drop(flipped);
    assert_eq!(doubled.getpoint(0, 0).expect("point"), vec![14.0]);
    assert_eq!(doubled.getpoint(1, 1).expect("point"), vec![12.0]);
}

#[test]
#[serial]
fn array_inputs_are_net_zero_after_a_call() {
    let red = Image::from_memory_copy(&[1u8, 2], 2, 1, 1).expect("red");
    let green = Image::from_memory_copy(&[3u8, 4], 2, 1, 1).expect("green");
    let before = (red.object().ref_count(), green.object().ref_count());

    let mut options = Options::new();
    options.set("in", vec![red.clone(), green.clone()]);
    let out = options.output::<Image>("out");
    operation::call("bandjoin", None, &mut options).expect("bandjoin");
    let joined = options.take(out).expect("out");
    drop(options);
    assert_eq!(joined.getpoint(1, 0).expect("point"), vec![2.0, 4.0]);
    drop(joined);

    assert_eq!((red.object().ref_count(), green.object().ref_count()), before);
}

#[test]
fn repeated_calls_are_independent() {
    let image = Image::matrix_from_array(2, 2, &[1.0, 2.0, 3.0, 4.0]).expect("matrix");
    let count = image.object().ref_count();
    let first = image.add(&image).expect("add");
    let second = image.add(&image).expect("add");
    assert_eq!(
        first.write_to_memory().expect("first"),
        second.write_to_memory().expect("second")
    );
    assert_eq!(first.avg().expect("avg"), 5.0);
    drop((first, second));
    assert_eq!(image.object().ref_count(), count);
}

#[test]
fn copy_memory_detaches_from_predecessors() {
    let image = Image::from_memory(vec![9u8; 4], 2, 2, 1).expect("image");
    let derived = image.invert().expect("invert");
    assert!(derived.predecessor_count() > 0);
    let detached = derived.copy_memory().expect("copy");
    assert_eq!(detached.predecessor_count(), 0);
    drop((image, derived));
    assert_eq!(detached.write_to_memory().expect("pixels"), vec![246; 4]);
}
