//! Purpose: Typed Rust bindings over the in-process image engine.
//! Exports: `api` (public surface), `core` (binding layer).
//! Role: Library crate backing the `vipsrs` CLI and the integration tests.
//! Role: `engine` is the crate-private native side, reached through its C-shaped ABI.
//! Invariants: Only `core` calls into `engine::abi`; `api` re-exports safe types.
//! Invariants: Engine objects are owned through handles that release each reference once.
pub mod api;
pub mod core;
mod engine;
