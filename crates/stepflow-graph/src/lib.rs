//! Static analysis and condition evaluation for workflow graphs.

pub mod condition;
pub mod validator;

pub use condition::{evaluate, Condition, EvalError};
pub use validator::{ensure_valid, has_errors, resolve_entry, validate, Entry, ValidateOptions};
