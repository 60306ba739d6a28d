//! Purpose: Raw engine ABI as seen from the binding core.
//! Role: Single import point so the core never names `engine` internals directly.
pub(crate) use crate::engine::abi::*;
