//! Purpose: Define the stable public Rust API boundary for vipsrs.
//! Exports: Handles, values, invocation, streaming, diagnostics, runtime.
//! Role: Public, additive-only surface; hides the engine ABI and marshalling internals.
//! Invariants: Nothing re-exported here exposes a raw engine pointer.

pub use crate::core::blob::Blob;
pub use crate::core::bridge::Whence;
pub use crate::core::diag::{clear_error, drain_error};
pub use crate::core::enums::{BandFormat, Direction, EnumType};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::image::{Extremum, Image, Pixel};
pub use crate::core::introspect::{ArgumentDirection, ArgumentInfo, OperationInfo, describe, operations};
pub use crate::core::log::{LoggingDelegate, TracingDelegate};
pub use crate::core::object::{KeepAlive, ObjectRef};
pub use crate::core::options::{Options, Out};
pub use crate::core::runtime::{self, Config, shutdown, start, start_with, version};
pub use crate::core::source::{Source, SourceCustom};
pub use crate::core::target::{Target, TargetCustom};
pub use crate::core::value::{EnumValue, FromOutput, Value, ValueKind};
pub use crate::core::{log, operation};
