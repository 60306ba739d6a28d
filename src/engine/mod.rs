//! Purpose: Crate-private native image engine consumed through a C-shaped ABI.
//! Exports: `abi` (repr(C) types, constants, `vx_*` functions).
//! Role: The reference-counted, lazily evaluated engine the binding drives.
//! Invariants: Callers outside this module only touch the engine through `abi`.
//! Invariants: Objects are refcounted; the last `vx_object_unref` finalizes.
//! Invariants: Failures append to the process-wide error buffer, never unwind.
pub(crate) mod abi;

mod blob;
mod diag;
mod image;
mod lifecycle;
mod object;
mod ops;
mod ppm;
mod registry;
mod source;
mod target;
mod value;
