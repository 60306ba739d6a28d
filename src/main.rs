//! Purpose: `vipsrs` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, drives the engine, emits JSON on stdout.
//! Invariants: Errors are emitted as JSON on stderr when stderr is not a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The engine is started before and shut down after every command.
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;
use vipsrs::api::{
    Config, Error, ErrorKind, Image, Options, TracingDelegate, ValueKind, describe, operation,
    operations, runtime, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    init_tracing();

    let mut config = Config::from_env()?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if cli.leak {
        config.leak_check = true;
    }
    runtime::start_with(&config, Some(Box::new(TracingDelegate)))?;
    let result = dispatch(cli.command);
    runtime::shutdown();
    result
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "vipsrs",
    version,
    about = "Run image engine operations from the command line",
    after_help = r#"EXAMPLES
  $ vipsrs list
  $ vipsrs describe linear
  $ vipsrs header photo.ppm
  $ vipsrs call invert photo.ppm inverted.ppm
  $ vipsrs call linear photo.ppm brighter.pgm --options "[a=1.5,b=10]"

NOTES
  - RUST_LOG controls log output (default: info)
  - VIPS_CONCURRENCY and VIPS_LEAK configure the engine; flags override them"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, help = "Worker threads for pixel encoding (0 = one per CPU)")]
    concurrency: Option<usize>,
    #[arg(long, help = "Report engine objects still alive at shutdown")]
    leak: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List every registered operation")]
    List,
    #[command(arg_required_else_help = true, about = "Describe an operation's arguments as JSON")]
    Describe { name: String },
    #[command(arg_required_else_help = true, about = "Print an image header as JSON")]
    Header {
        #[arg(value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Run an image-to-image operation on a file",
        long_about = r#"Load INPUT, pass it as the operation's first image argument, and save
the first image output to OUTPUT. Other arguments come from --options."#
    )]
    Call {
        name: String,
        #[arg(value_hint = ValueHint::FilePath)]
        input: PathBuf,
        #[arg(value_hint = ValueHint::FilePath)]
        output: PathBuf,
        #[arg(long, help = "Extra arguments as [name=value,...]")]
        options: Option<String>,
    },
}

fn dispatch(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::List => {
            emit_json(json!({ "operations": operations() }));
        }
        Command::Describe { name } => {
            let info = describe(&name)?;
            emit_json(serde_json::to_value(&info).map_err(json_error)?);
        }
        Command::Header { file } => {
            let image = Image::from_file(&file)?;
            emit_json(header_json(&image));
        }
        Command::Call {
            name,
            input,
            output,
            options,
        } => {
            let info = describe(&name)?;
            let input_name = info
                .inputs()
                .find(|argument| argument.required && argument.kind == Some(ValueKind::Image))
                .map(|argument| argument.name.clone())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message("operation takes no image input")
                        .with_operation(&name)
                })?;
            let output_name = info
                .outputs()
                .find(|argument| argument.kind == Some(ValueKind::Image))
                .map(|argument| argument.name.clone())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message("operation produces no image output")
                        .with_operation(&name)
                })?;

            let image = Image::from_file(&input)?;
            let mut call = Options::new();
            call.set(&input_name, &image);
            let out = call.output::<Image>(&output_name);
            operation::call(&name, options.as_deref(), &mut call)?;
            let result = call.take(out)?;
            result.write_to_file(&output)?;

            let mut value = header_json(&result);
            if let Value::Object(map) = &mut value {
                map.insert("operation".to_string(), json!(name));
                map.insert("output".to_string(), json!(output.display().to_string()));
            }
            emit_json(value);
        }
    }
    Ok(RunOutcome::ok())
}

fn json_error(err: serde_json::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("json encode failed")
        .with_source(err)
}

fn header_json(image: &Image) -> Value {
    json!({
        "width": image.width(),
        "height": image.height(),
        "bands": image.bands(),
        "format": image.format(),
        "xres": image.xres(),
        "yres": image.yres(),
        "filename": image.filename(),
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("error: {}", error_message(err));
        if let Some(operation) = err.operation() {
            eprintln!("operation: {operation}");
        }
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Io\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::OperationFailed => "operation failed".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::UnknownOperation => "unknown operation".to_string(),
        ErrorKind::InvalidOptionString => "invalid option string".to_string(),
        ErrorKind::TypeMismatch => "type mismatch".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = std::error::Error::source(err);
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(operation) = err.operation() {
        inner.insert("operation".to_string(), json!(operation));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_json_carries_kind_operation_and_causes() {
        let err = Error::new(ErrorKind::OperationFailed)
            .with_message("ppmload: bad header")
            .with_operation("ppmload")
            .with_source(io::Error::other("short read"));
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "OperationFailed");
        assert_eq!(value["error"]["operation"], "ppmload");
        assert_eq!(value["error"]["causes"][0], "short read");
    }

    #[test]
    fn missing_message_falls_back_to_kind() {
        assert_eq!(error_message(&Error::new(ErrorKind::TypeMismatch)), "type mismatch");
    }
}
