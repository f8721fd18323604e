//! Shared test utilities for stepflow crates: a scripted in-process
//! invoker and a few ready-made workflows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use stepflow_core::error::{FlowError, Result, StepFailure};
use stepflow_core::traits::StepInvoker;
use stepflow_core::types::{ContextMap, StepOutput, StepRequest};
use stepflow_core::workflow::{Iterations, Node, Workflow};

type Handler = Arc<dyn Fn(&StepRequest) -> Result<StepOutput> + Send + Sync>;

/// A [`StepInvoker`] that answers from a table keyed by script name.
///
/// Scripts without an entry succeed with an empty update. Every request
/// is recorded so tests can inspect what each step was given.
#[derive(Default)]
pub struct ScriptedInvoker {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<StepRequest>>,
    delay: Option<Duration>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every step take `delay`, honouring cancellation while waiting.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reply to `script` with a fixed update.
    pub fn respond(self, script: &str, update: Value) -> Self {
        let update = to_map(update);
        self.on(script, move |_| Ok(StepOutput::with_update(update.clone())))
    }

    /// Fail `script` with a nonzero exit.
    pub fn fail(self, script: &str, code: i32, stderr: &str) -> Self {
        let stderr = stderr.to_string();
        self.on(script, move |req| {
            Err(FlowError::Execution {
                node_id: req.node_id.clone(),
                failure: StepFailure::Exit {
                    code: Some(code),
                    stderr: stderr.clone(),
                },
            })
        })
    }

    /// Answer `script` with an arbitrary function of the request.
    pub fn on<F>(self, script: &str, handler: F) -> Self
    where
        F: Fn(&StepRequest) -> Result<StepOutput> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(script.to_string(), Arc::new(handler));
        self
    }

    /// All requests received so far, in order.
    pub fn calls(&self) -> Vec<StepRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Requests received for one script.
    pub fn calls_for(&self, script: &str) -> Vec<StepRequest> {
        self.calls()
            .into_iter()
            .filter(|r| r.script == script)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl StepInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    fn invoke(
        &self,
        request: StepRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());

            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                }
            }

            let handler = self.handlers.lock().unwrap().get(&request.script).cloned();
            match handler {
                Some(handler) => handler(&request),
                None => Ok(StepOutput::default()),
            }
        })
    }
}

/// Convert a JSON object literal into a context map.
pub fn to_map(value: Value) -> ContextMap {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => ContextMap::new(),
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// start → n1 (action `echo_ok`) → n2 (decision `result=='ok'`) → n3 | n4
pub fn branching_workflow() -> Workflow {
    Workflow::new("wf-branch", "Branching")
        .with_node(Node::start("start"))
        .with_node(Node::action("n1", "echo_ok").with_label("Echo"))
        .with_node(Node::decision("n2", "result=='ok'", "n3", "n4"))
        .with_node(Node::end("n3").with_label("Happy"))
        .with_node(Node::end("n4").with_label("Sad"))
        .with_edge("start", "n1")
        .with_edge("n1", "n2")
}

/// start → check (decision `x > 5`) → big | small
pub fn threshold_workflow(x: Value) -> Workflow {
    Workflow::new("wf-threshold", "Threshold")
        .with_node(Node::start("start"))
        .with_node(Node::decision("check", "x > 5", "big", "small"))
        .with_node(Node::end("big"))
        .with_node(Node::end("small"))
        .with_edge("start", "check")
        .with_variable("x", x)
}

/// start → each (loop over `step`, 3 times, var `i`) → done
pub fn loop_workflow() -> Workflow {
    Workflow::new("wf-loop", "Loop")
        .with_node(Node::start("start"))
        .with_node(Node::looping("each", "step", Iterations::Count(3), "i"))
        .with_node(Node::end("done"))
        .with_edge("start", "each")
        .with_edge("each", "done")
        .with_variable("total", json!(0))
}

/// start → a → b → a (an action cycle with no loop node)
pub fn cyclic_workflow() -> Workflow {
    Workflow::new("wf-cycle", "Cycle")
        .with_node(Node::start("start"))
        .with_node(Node::action("a", "a"))
        .with_node(Node::action("b", "b"))
        .with_edge("start", "a")
        .with_edge("a", "b")
        .with_edge("b", "a")
}
