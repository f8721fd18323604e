use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use stepflow_core::error::{FlowError, Result};
use stepflow_core::types::{RunId, RunStatus};

use crate::executor::RunResult;

/// Control surface for a run started with [`Executor::start`](crate::Executor::start).
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<RunResult>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: RunId,
        cancel: CancellationToken,
        status: watch::Receiver<RunStatus>,
        task: JoinHandle<RunResult>,
    ) -> Self {
        Self {
            run_id,
            cancel,
            status,
            task,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Request cancellation. The run stops at its next suspension point
    /// after terminating any step in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the run's cancellation token (e.g. for a Ctrl-C handler).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// A receiver that is notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end and return its result.
    pub async fn wait(self) -> Result<RunResult> {
        self.task
            .await
            .map_err(|e| FlowError::Workflow(format!("run task failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use stepflow_core::config::ExecutorConfig;
    use stepflow_test_utils::{branching_workflow, ScriptedInvoker};

    use crate::Executor;

    #[tokio::test]
    async fn test_status_transitions_to_completed() {
        let invoker = Arc::new(ScriptedInvoker::new().respond("echo_ok", json!({"result": "ok"})));
        let exec = Arc::new(Executor::new(ExecutorConfig::default(), invoker));

        let handle = exec.start(branching_workflow());
        let mut status = handle.watch_status();
        let run_id = handle.run_id().clone();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !status.borrow_and_update().is_terminal() {
                status.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(handle.status(), RunStatus::Completed);
        let result = handle.wait().await.unwrap();
        assert_eq!(result.run_id, run_id);
        assert!(result.is_completed());
    }

    #[tokio::test]
    async fn test_cancel_through_token_clone() {
        let invoker = Arc::new(ScriptedInvoker::new().with_delay(Duration::from_secs(30)));
        let exec = Arc::new(Executor::new(ExecutorConfig::default(), invoker));

        let handle = exec.start(branching_workflow());
        let token = handle.cancellation_token();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, RunStatus::Stopped);
    }
}
