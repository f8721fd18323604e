//! Observers of run events.
//!
//! A sink is attached to one run on an [`EventBus`] with [`spawn_sink`],
//! which pumps that run's events into it on a background task until the
//! run's terminal event.

mod console;
mod jsonl;
mod memory;

pub use console::{format_event, ConsoleSink};
pub use jsonl::JsonlSink;
pub use memory::MemorySink;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use stepflow_core::event::EventBus;
use stepflow_core::traits::EventSink;
use stepflow_core::types::RunId;

/// Feed the events of run `run_id` published on `event_bus` to `sink`.
///
/// The subscription is taken before this returns, so no event published
/// afterwards is missed. Events of other runs sharing the bus are
/// skipped. The task ends after the run's terminal event (flushing the
/// sink) or when the bus is dropped. A sink that falls behind loses
/// events rather than slowing the run.
pub fn spawn_sink(event_bus: &EventBus, run_id: RunId, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) if event.run_id != run_id => continue,
                Ok(event) => {
                    let terminal = event.is_terminal();
                    if let Err(e) = sink.handle(event).await {
                        warn!(sink = sink.name(), error = %e, "Event sink failed");
                    }
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!(sink = sink.name(), skipped = n, "Event sink lagged, skipped events");
                }
                Err(RecvError::Closed) => {
                    debug!(sink = sink.name(), "EventBus closed, sink stopping");
                    break;
                }
            }
        }

        if let Err(e) = sink.flush().await {
            warn!(sink = sink.name(), error = %e, "Event sink flush failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use stepflow_core::config::ExecutorConfig;
    use stepflow_core::types::RunStatus;
    use stepflow_test_utils::{branching_workflow, loop_workflow, ScriptedInvoker};
    use tokio_util::sync::CancellationToken;

    use crate::Executor;

    #[tokio::test]
    async fn test_pump_delivers_whole_run_then_stops() {
        let invoker = Arc::new(ScriptedInvoker::new().respond("echo_ok", json!({"result": "ok"})));
        let exec = Executor::new(ExecutorConfig::default(), invoker);

        let memory = Arc::new(MemorySink::new(100));
        let run_id = RunId::new();
        let pump = spawn_sink(exec.event_bus(), run_id.clone(), memory.clone());

        let result = exec
            .execute_as(run_id, &branching_workflow(), CancellationToken::new())
            .await;
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(memory.snapshot(), result.events);
        assert_eq!(memory.recent(1)[0].status, Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_pump_stops_when_bus_dropped() {
        let bus = EventBus::default();
        let memory = Arc::new(MemorySink::new(10));
        let pump = spawn_sink(&bus, RunId::new(), memory.clone());
        drop(bus);

        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_each_sink_sees_only_its_run() {
        let invoker = Arc::new(
            ScriptedInvoker::new()
                .with_delay(Duration::from_millis(20))
                .respond("echo_ok", json!({"result": "ok"})),
        );
        let exec = Arc::new(Executor::new(ExecutorConfig::default(), invoker));

        let (fast_id, slow_id) = (RunId::new(), RunId::new());
        let fast_sink = Arc::new(MemorySink::new(100));
        let slow_sink = Arc::new(MemorySink::new(100));
        let fast_pump = spawn_sink(exec.event_bus(), fast_id.clone(), fast_sink.clone());
        let slow_pump = spawn_sink(exec.event_bus(), slow_id.clone(), slow_sink.clone());

        let fast = exec.start_as(fast_id.clone(), branching_workflow());
        let slow = exec.start_as(slow_id.clone(), loop_workflow());
        let fast = fast.wait().await.unwrap();
        let slow = slow.wait().await.unwrap();
        for pump in [fast_pump, slow_pump] {
            tokio::time::timeout(Duration::from_secs(5), pump)
                .await
                .unwrap()
                .unwrap();
        }

        assert!(fast.is_completed() && slow.is_completed());
        assert_eq!(fast_sink.snapshot(), fast.events);
        assert_eq!(slow_sink.snapshot(), slow.events);
        assert!(slow_sink.snapshot().iter().all(|e| e.run_id == slow_id));
        assert_eq!(slow_sink.recent(1)[0].status, Some(RunStatus::Completed));
    }
}
