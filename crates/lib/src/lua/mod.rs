//! Lua runtime integration.
//!
//! Extension modules are plain Lua files evaluated in isolated per-module
//! environments. This module owns runtime creation, conversion between Lua
//! values and attribute values, and the `target{}` declaration global; the
//! loader in `crate::loader` drives which files are evaluated and when.

pub mod convert;
pub mod globals;
pub mod runtime;
