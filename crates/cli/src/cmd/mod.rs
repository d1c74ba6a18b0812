mod build;
mod query;
mod trace;

pub use build::cmd_build;
pub use query::{QueryWhat, cmd_query};
pub use trace::cmd_trace;
