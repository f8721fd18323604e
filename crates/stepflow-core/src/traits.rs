use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{RunEvent, StepOutput, StepRequest};

/// Runs one node's external action.
///
/// `ProcessInvoker` runs steps as child processes.
pub trait StepInvoker: Send + Sync + 'static {
    /// Invoker name (used in logs).
    fn name(&self) -> &str;

    /// Run the step described by `request`.
    ///
    /// Failures of the external unit are reported as
    /// `FlowError::Execution`. When `cancel` fires mid-step the invoker
    /// must terminate whatever it started and then return
    /// `FlowError::Cancelled`.
    fn invoke(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Observer of run events, such as a console, a log file or a UI buffer.
pub trait EventSink: Send + Sync + 'static {
    /// Sink name (used in logs).
    fn name(&self) -> &str;

    /// Handle one event. Called in event order.
    fn handle(&self, event: RunEvent) -> BoxFuture<'_, Result<()>>;

    /// Flush buffered output. Called once the run's terminal event was handled.
    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
