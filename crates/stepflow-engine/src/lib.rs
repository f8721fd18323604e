pub mod executor;
pub mod handle;
pub mod sinks;

pub use executor::{Executor, RunResult};
pub use handle::RunHandle;
pub use sinks::{format_event, spawn_sink, ConsoleSink, JsonlSink, MemorySink};
