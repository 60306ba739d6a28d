//! Purpose: Engine start-up and shut-down with process configuration.
//! Exports: `Config`, `start`, `start_with`, `shutdown`, `version`, `live_objects`.
//! Role: Applies worker-pool size, leak checking and the logging delegate.
//! Invariants: `start` is safe to repeat; the delegate is removed only after the engine stops.
use std::env;
use std::ffi::{CStr, CString};

use super::diag;
use super::error::{Error, ErrorKind, Result};
use super::log::{self, LoggingDelegate};
use super::sys;

pub const CONCURRENCY_ENV: &str = "VIPS_CONCURRENCY";
pub const LEAK_ENV: &str = "VIPS_LEAK";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Worker threads for pixel encoding; zero picks one per host CPU.
    pub concurrency: usize,
    pub leak_check: bool,
    pub program_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 0,
            leak_check: false,
            program_name: "vipsrs".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by `VIPS_CONCURRENCY` and `VIPS_LEAK`.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(value) = env::var(CONCURRENCY_ENV) {
            config.concurrency = value.trim().parse().map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("{CONCURRENCY_ENV}={value:?} is not a count"))
                    .with_source(err)
            })?;
        }
        if let Ok(value) = env::var(LEAK_ENV) {
            config.leak_check = !matches!(value.trim(), "" | "0" | "false" | "no");
        }
        Ok(config)
    }
}

/// Start the engine with `concurrency` workers and an optional logging delegate.
pub fn start(concurrency: usize, delegate: Option<Box<dyn LoggingDelegate>>) -> Result<()> {
    let config = Config {
        concurrency,
        ..Config::default()
    };
    start_with(&config, delegate)
}

/// Start the engine from `config`. The delegate sees start-up records; on failure
/// it is removed again before the error is returned.
pub fn start_with(config: &Config, delegate: Option<Box<dyn LoggingDelegate>>) -> Result<()> {
    let name = CString::new(config.program_name.as_str()).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("program name contains a NUL byte")
            .with_source(err)
    })?;
    let installed = delegate.is_some();
    if let Some(delegate) = delegate {
        log::install(delegate);
    }
    if unsafe { sys::vx_init(name.as_ptr()) } != 0 {
        if installed {
            log::remove();
        }
        return Err(diag::failure(ErrorKind::OperationFailed, "unable to start engine"));
    }
    sys::vx_concurrency_set(i32::try_from(config.concurrency).unwrap_or(i32::MAX));
    sys::vx_leak_set(i32::from(config.leak_check));
    tracing::info!(
        version = %version(),
        concurrency = sys::vx_concurrency_get(),
        leak_check = config.leak_check,
        "engine started"
    );
    Ok(())
}

/// Stop the engine. Leak reports, if enabled, still reach the delegate.
pub fn shutdown() {
    sys::vx_shutdown();
    log::remove();
    tracing::debug!("engine stopped");
}

pub fn version() -> String {
    unsafe { CStr::from_ptr(sys::vx_version_string()) }
        .to_string_lossy()
        .into_owned()
}

/// Engine objects not yet finalized, across the whole process.
pub fn live_objects() -> usize {
    sys::vx_object_live_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn config_reads_environment() {
        unsafe {
            env::set_var(CONCURRENCY_ENV, "3");
            env::set_var(LEAK_ENV, "1");
        }
        let config = Config::from_env().expect("config");
        assert_eq!(config.concurrency, 3);
        assert!(config.leak_check);

        unsafe { env::set_var(CONCURRENCY_ENV, "many") };
        let err = Config::from_env().expect_err("bad count");
        assert_eq!(err.kind(), ErrorKind::Usage);

        unsafe {
            env::remove_var(CONCURRENCY_ENV);
            env::remove_var(LEAK_ENV);
        }
        assert_eq!(Config::from_env().expect("config"), Config::default());
    }

    #[test]
    #[serial]
    fn rejected_config_leaves_no_delegate_installed() {
        let config = Config {
            program_name: "vips\0rs".to_string(),
            ..Config::default()
        };
        let err = start_with(&config, Some(Box::new(log::TracingDelegate))).expect_err("bad name");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(!log::is_installed());
    }

    #[test]
    fn version_is_reported() {
        assert!(version().starts_with("8."));
    }
}
