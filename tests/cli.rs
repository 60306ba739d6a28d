// CLI integration tests: list, describe, header, call, and error reporting.
use std::path::Path;
use std::process::Command;

use serde_json::Value;

const PGM: &[u8] = b"P5\n3 2\n255\n\x00\x10\x20\x30\x40\xff";

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_vipsrs");
    let mut command = Command::new(exe);
    command.env("RUST_LOG", "off");
    command
}

fn parse_json(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().last().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn write_pgm(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("in.pgm");
    std::fs::write(&path, PGM).expect("write");
    path
}

#[test]
fn list_and_describe() {
    let list = cmd().arg("list").output().expect("list");
    assert!(list.status.success());
    let names = parse_json(&list.stdout);
    let names = names["operations"].as_array().expect("operations");
    assert!(names.iter().any(|name| name == "invert"));

    let describe = cmd().args(["describe", "extract_area"]).output().expect("describe");
    assert!(describe.status.success());
    let info = parse_json(&describe.stdout);
    assert_eq!(info["nickname"], "extract_area");
    assert_eq!(info["arguments"][0]["name"], "input");
    assert_eq!(info["arguments"][0]["kind"], "image");
}

#[test]
fn header_reports_dimensions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = write_pgm(temp.path());
    let header = cmd()
        .args(["header", input.to_str().expect("utf8")])
        .output()
        .expect("header");
    assert!(header.status.success());
    let value = parse_json(&header.stdout);
    assert_eq!(value["width"], 3);
    assert_eq!(value["height"], 2);
    assert_eq!(value["bands"], 1);
    assert_eq!(value["format"], "uchar");
}

#[test]
fn call_runs_operation_and_saves() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = write_pgm(temp.path());
    let output = temp.path().join("out.pgm");
    let call = cmd()
        .args([
            "--concurrency",
            "1",
            "call",
            "linear",
            input.to_str().expect("utf8"),
            output.to_str().expect("utf8"),
            "--options",
            "[a=1,b=1,uchar]",
        ])
        .output()
        .expect("call");
    assert!(call.status.success(), "{}", String::from_utf8_lossy(&call.stderr));
    let value = parse_json(&call.stdout);
    assert_eq!(value["operation"], "linear");
    assert_eq!(value["width"], 3);
    let saved = std::fs::read(&output).expect("saved");
    assert_eq!(saved, b"P5\n3 2\n255\n\x01\x11\x21\x31\x41\xff");
}

#[test]
fn unknown_operation_exits_with_json_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = write_pgm(temp.path());
    let output = temp.path().join("out.pgm");
    let call = cmd()
        .args([
            "call",
            "nonesuch",
            input.to_str().expect("utf8"),
            output.to_str().expect("utf8"),
        ])
        .output()
        .expect("call");
    assert_eq!(call.status.code(), Some(3));
    let err = parse_json(&call.stderr);
    assert_eq!(err["error"]["kind"], "UnknownOperation");
    assert_eq!(err["error"]["operation"], "nonesuch");
}

#[test]
fn bad_option_string_exits_with_code_four() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = write_pgm(temp.path());
    let output = temp.path().join("out.pgm");
    let call = cmd()
        .args([
            "call",
            "invert",
            input.to_str().expect("utf8"),
            output.to_str().expect("utf8"),
            "--options",
            "[bogus=1]",
        ])
        .output()
        .expect("call");
    assert_eq!(call.status.code(), Some(4));
    let err = parse_json(&call.stderr);
    assert_eq!(err["error"]["kind"], "InvalidOptionString");
    assert!(!output.exists());
}

#[test]
fn usage_errors_exit_with_code_two() {
    let call = cmd().args(["header"]).output().expect("header");
    assert_eq!(call.status.code(), Some(2));
}
