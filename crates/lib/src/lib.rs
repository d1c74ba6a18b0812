//! girder-lib: Core types and logic for Girder
//!
//! This crate is the evaluation core of the Girder build orchestrator:
//! - `loader`: resolves, evaluates, and caches Lua extension modules
//! - `analysis`: turns target declarations into an explicit step graph
//! - `tset`: transitive sets with O(1) union and deterministic traversal
//! - `sched`: demand-driven, cache-aware step execution
//! - `invocation`: one build invocation scoping all of the above

pub mod analysis;
pub mod cache;
pub mod consts;
pub mod graph;
pub mod invocation;
pub mod label;
pub mod loader;
pub mod lua;
pub mod profile;
pub mod provider;
pub mod query;
pub mod rule;
pub mod sched;
pub mod step;
pub mod target;
pub mod tset;
pub mod util;
