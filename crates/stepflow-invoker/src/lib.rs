//! Step invocation backed by child processes.

pub mod output;
pub mod process;

pub use output::parse_output;
pub use process::{ProcessInvoker, CONTEXT_ENV, NODE_ID_ENV};
