//! Crate-wide constants.

/// Truncation length for definition-identifying hashes.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Module exports whose names start with this prefix cannot be imported
/// from other modules.
pub const PRIVATE_PREFIX: char = '_';

/// File extension for extension modules; labels ending in this name a
/// module file rather than a target.
pub const MODULE_EXT: &str = ".lua";

/// Names injected into every module environment by the engine. Never
/// collected as exports.
pub const ENV_BUILTINS: &[&str] = &["load", "target"];

/// Workspace-relative directory where step outputs land.
pub const OUT_DIR: &str = "girder-out";

/// Workspace-relative directory for persisted engine state (step records).
pub const STATE_DIR: &str = ".girder/state";
