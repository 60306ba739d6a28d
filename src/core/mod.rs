//! Purpose: Typed binding over the engine's dynamic, refcounted object model.
//! Exports: Values, property sets, invocation, managed objects, streaming bridges, diagnostics.
//! Role: The only layer that touches `sys`; everything above it is safe Rust.
//! Invariants: Every native reference taken here is released exactly once.
//! Invariants: Failures are drained from the engine's error buffer into `Error`.
pub mod blob;
pub mod bridge;
pub mod diag;
pub mod enums;
pub mod error;
pub mod image;
pub mod introspect;
pub mod log;
pub mod object;
pub mod operation;
pub mod options;
pub mod runtime;
pub mod source;
pub mod target;
pub mod value;

pub(crate) mod sys;
