use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepflow_core::config::ExecutorConfig;
use stepflow_core::context::ExecutionContext;
use stepflow_core::error::{FlowError, Result};
use stepflow_core::event::EventBus;
use stepflow_core::traits::StepInvoker;
use stepflow_core::types::{
    ContextMap, EventKind, RunEvent, RunId, RunStatus, Severity, StepOutput, StepRequest,
};
use stepflow_core::workflow::{IterationSource, Node, NodeType, OnError, Workflow};
use stepflow_graph::condition::Condition;
use stepflow_graph::validator::{self, ValidateOptions};

use crate::handle::RunHandle;

/// Outcome of one workflow run.
#[derive(Debug)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    /// The context as it stood when the run ended.
    pub context: ContextMap,
    /// Every event emitted by the run, in order.
    pub events: Vec<RunEvent>,
    /// Node ids in the order they were dispatched.
    pub path: Vec<String>,
    /// Set when the run failed.
    pub error: Option<FlowError>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Whether the run dispatched `node_id` at least once.
    pub fn reached(&self, node_id: &str) -> bool {
        self.path.iter().any(|id| id == node_id)
    }
}

/// Drives workflow runs.
///
/// Each run is a single sequential control loop: pick the next node,
/// dispatch it by type, merge step output into the context, repeat. The
/// only suspension points are step invocations and delays, and both
/// observe the run's cancellation token.
pub struct Executor {
    config: ExecutorConfig,
    invoker: Arc<dyn StepInvoker>,
    event_bus: Arc<EventBus>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, invoker: Arc<dyn StepInvoker>) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_capacity));
        Self {
            config,
            invoker,
            event_bus,
        }
    }

    /// Publish events on a shared bus instead of a private one.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `workflow` to completion on the current task.
    pub async fn execute(&self, workflow: &Workflow, cancel: CancellationToken) -> RunResult {
        self.execute_as(RunId::new(), workflow, cancel).await
    }

    /// [`execute`](Self::execute) under a caller-chosen run id, so sinks
    /// can be attached for it beforehand.
    pub async fn execute_as(
        &self,
        run_id: RunId,
        workflow: &Workflow,
        cancel: CancellationToken,
    ) -> RunResult {
        self.run(workflow, run_id, cancel, None).await
    }

    /// Run `workflow` on its own task and return a handle to control it.
    pub fn start(self: &Arc<Self>, workflow: Workflow) -> RunHandle {
        self.start_as(RunId::new(), workflow)
    }

    /// [`start`](Self::start) under a caller-chosen run id.
    pub fn start_as(self: &Arc<Self>, run_id: RunId, workflow: Workflow) -> RunHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunStatus::Idle);

        let executor = Arc::clone(self);
        let task = {
            let run_id = run_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .run(&workflow, run_id, cancel, Some(status_tx))
                    .await
            })
        };

        RunHandle::new(run_id, cancel, status_rx, task)
    }

    async fn run(
        &self,
        workflow: &Workflow,
        run_id: RunId,
        cancel: CancellationToken,
        status_tx: Option<watch::Sender<RunStatus>>,
    ) -> RunResult {
        let started = Instant::now();
        let mut run = Run::new(run_id, workflow, &self.event_bus);

        if let Some(tx) = &status_tx {
            tx.send_replace(RunStatus::Running);
        }
        info!(
            run_id = %run.run_id,
            workflow_id = %workflow.id,
            invoker = self.invoker.name(),
            "Run started"
        );

        let outcome = self.drive(&mut run, &cancel).await;

        let (status, error) = match outcome {
            Ok(()) => (RunStatus::Completed, None),
            Err(FlowError::Cancelled) => (RunStatus::Stopped, None),
            Err(e) => (RunStatus::Failed, Some(e)),
        };

        let message = match (&status, &error) {
            (RunStatus::Completed, _) => format!("Workflow '{}' completed", workflow.name),
            (RunStatus::Stopped, _) => format!("Workflow '{}' stopped", workflow.name),
            (_, Some(e)) => format!("Workflow '{}' failed: {}", workflow.name, e),
            (_, None) => format!("Workflow '{}' failed", workflow.name),
        };
        let kind = match status {
            RunStatus::Completed => EventKind::Info,
            RunStatus::Stopped => EventKind::Warning,
            _ => EventKind::Failure,
        };
        let node_id = error.as_ref().and_then(|e| e.node_id()).map(str::to_string);
        run.finish(node_id, kind, message, status);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &error {
            Some(e) => error!(
                run_id = %run.run_id,
                kind = e.kind(),
                node_id = e.node_id().unwrap_or("-"),
                error = %e,
                elapsed_ms,
                "Run failed"
            ),
            None => info!(run_id = %run.run_id, status = %status, elapsed_ms, "Run finished"),
        }

        if let Some(tx) = &status_tx {
            tx.send_replace(status);
        }

        RunResult {
            run_id: run.run_id,
            status,
            context: run.context.into_inner(),
            events: run.events,
            path: run.path,
            error,
            elapsed_ms,
        }
    }

    /// Validate, resolve the entry node and walk the graph.
    async fn drive(&self, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<()> {
        let workflow = run.workflow;
        let options = ValidateOptions {
            allow_implicit_entry: self.config.allow_implicit_entry,
        };

        let findings = validator::validate(workflow, &options);
        for finding in findings.iter().filter(|f| f.severity == Severity::Warning) {
            run.emit(
                finding.node_id.clone(),
                EventKind::Warning,
                finding.message.clone(),
            );
        }
        if validator::has_errors(&findings) {
            return Err(FlowError::Validation(findings));
        }

        let entry = validator::resolve_entry(workflow, &options)
            .map_err(|finding| FlowError::Validation(vec![finding]))?
            .node();

        run.emit(
            None,
            EventKind::Info,
            format!("Starting workflow '{}' at '{}'", workflow.name, entry.id),
        );

        let mut current = Some(entry.id.clone());
        let mut steps = 0usize;

        while let Some(node_id) = current {
            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }

            steps += 1;
            if steps > self.config.max_steps {
                warn!(node_id = %node_id, max_steps = self.config.max_steps, "Step limit reached");
                return Err(FlowError::InfiniteLoop { node_id });
            }

            let node = workflow.node(&node_id).ok_or_else(|| {
                FlowError::Workflow(format!("node '{}' not found in workflow", node_id))
            })?;
            run.path.push(node.id.clone());

            if node.kind != NodeType::Loop {
                run.enter(node)?;
            }

            debug!(node_id = %node.id, kind = %node.kind, "Dispatching node");
            current = self.dispatch(node, run, cancel).await?;
        }

        Ok(())
    }

    /// Execute one node and return the id of the next, or `None` when the
    /// run is finished.
    async fn dispatch(
        &self,
        node: &Node,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let skippable = matches!(node.kind, NodeType::Action | NodeType::Loop | NodeType::Delay);
        if skippable && !node.is_enabled() {
            run.emit(
                Some(node.id.clone()),
                EventKind::Info,
                format!("Skipping disabled node '{}'", node.display_name()),
            );
            if node.kind == NodeType::Loop {
                run.enter_loop(node, 1)?;
            }
            return Ok(run.continuation(node));
        }

        match node.kind {
            NodeType::Start | NodeType::Annotation => Ok(run.continuation(node)),

            NodeType::End => {
                run.emit(
                    Some(node.id.clone()),
                    EventKind::Info,
                    format!("Reached end node '{}'", node.display_name()),
                );
                Ok(None)
            }

            NodeType::Action => {
                self.step(node, run, cancel).await?;
                Ok(run.continuation(node))
            }

            NodeType::Decision => {
                let target = self.decide(node, run)?;
                Ok(Some(target))
            }

            NodeType::Loop => {
                let count = run.resolve_iterations(node);
                run.enter_loop(node, count)?;

                let loop_var = node.loop_var().to_string();
                let result = self.iterate(node, run, cancel, count, &loop_var).await;
                run.context.remove(&loop_var);
                result?;

                run.emit(
                    Some(node.id.clone()),
                    EventKind::Info,
                    format!("Loop '{}' finished after {} iteration(s)", node.display_name(), count),
                );
                Ok(run.continuation(node))
            }

            NodeType::Delay => {
                let seconds = node.delay_seconds().max(0.0);
                run.emit(
                    Some(node.id.clone()),
                    EventKind::Info,
                    format!("Waiting {} second(s)", seconds),
                );
                let duration = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = cancel.cancelled() => return Err(FlowError::Cancelled),
                }
                Ok(run.continuation(node))
            }
        }
    }

    async fn iterate(
        &self,
        node: &Node,
        run: &mut Run<'_>,
        cancel: &CancellationToken,
        count: u64,
        loop_var: &str,
    ) -> Result<()> {
        for i in 0..count {
            if cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            run.context.set(loop_var, Value::from(i));
            debug!(node_id = %node.id, iteration = i, count, "Loop iteration");
            self.step(node, run, cancel).await?;
        }
        Ok(())
    }

    fn decide(&self, node: &Node, run: &mut Run<'_>) -> Result<String> {
        let text = node.condition().unwrap_or_default();
        let evaluation = Condition::parse(text).and_then(|c| c.evaluate(run.context.data()));
        let outcome = evaluation.map_err(|e| FlowError::Evaluation {
            node_id: node.id.clone(),
            message: e.to_string(),
        })?;

        let target = if outcome { node.true_path() } else { node.false_path() };
        let target = target.ok_or_else(|| {
            FlowError::Workflow(format!(
                "decision '{}' has no {} branch",
                node.id,
                if outcome { "true" } else { "false" }
            ))
        })?;

        run.emit(
            Some(node.id.clone()),
            EventKind::Info,
            format!("Condition '{}' is {}; going to '{}'", text, outcome, target),
        );
        Ok(target.to_string())
    }

    /// Invoke the node's script once and merge its output.
    ///
    /// With `on_error = continue` on an action node, an execution failure
    /// is reported and swallowed. A failed loop iteration always fails the
    /// run.
    async fn step(&self, node: &Node, run: &mut Run<'_>, cancel: &CancellationToken) -> Result<()> {
        let script = node.script().unwrap_or_default().to_string();
        let request = StepRequest {
            node_id: node.id.clone(),
            label: node.display_name().to_string(),
            script: script.clone(),
            context: run.context.snapshot(),
            timeout: node.timeout_secs.map(Duration::from_secs),
        };

        run.emit(
            Some(node.id.clone()),
            EventKind::Start,
            format!("Running '{}' ({})", node.display_name(), script),
        );

        let started = Instant::now();
        let result = self.invoker.invoke(request, cancel.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.apply_output(node, run, output);
                debug!(node_id = %node.id, elapsed_ms, "Step succeeded");
                run.emit_with_snapshot(
                    Some(node.id.clone()),
                    EventKind::Success,
                    format!("Step '{}' completed in {} ms", node.display_name(), elapsed_ms),
                );
                Ok(())
            }
            Err(FlowError::Cancelled) => {
                run.emit(
                    Some(node.id.clone()),
                    EventKind::Failure,
                    format!("Step '{}' cancelled", node.display_name()),
                );
                Err(FlowError::Cancelled)
            }
            Err(e) => {
                warn!(node_id = %node.id, error = %e, elapsed_ms, "Step failed");
                run.emit(Some(node.id.clone()), EventKind::Failure, e.to_string());
                if node.kind == NodeType::Action
                    && node.on_error() == OnError::Continue
                    && matches!(e, FlowError::Execution { .. })
                {
                    run.emit(
                        Some(node.id.clone()),
                        EventKind::Info,
                        format!("Continuing past failed step '{}'", node.display_name()),
                    );
                    return Ok(());
                }
                Err(e)
            }
        }
    }

    fn apply_output(&self, node: &Node, run: &mut Run<'_>, output: StepOutput) {
        if let Some(message) = output.warning {
            let warning = FlowError::Parse {
                node_id: node.id.clone(),
                message,
            };
            run.emit(Some(node.id.clone()), EventKind::Warning, warning.to_string());
        }

        run.context.merge(&output.update);

        if let Some(var) = node.output_variable.as_deref().filter(|v| !v.trim().is_empty()) {
            run.context.set(var, Value::String(output.stdout));
        }
    }
}

/// Mutable state of a single run.
struct Run<'a> {
    run_id: RunId,
    workflow: &'a Workflow,
    event_bus: &'a EventBus,
    context: ExecutionContext,
    events: Vec<RunEvent>,
    next_seq: u64,
    path: Vec<String>,
    /// Nodes entered since the innermost active loop entry, in order.
    trail: Vec<String>,
    visited: HashSet<String>,
    /// Loop node id → (times entered, its position in `trail`).
    loop_entries: HashMap<String, (u64, usize)>,
}

impl<'a> Run<'a> {
    fn new(run_id: RunId, workflow: &'a Workflow, event_bus: &'a EventBus) -> Self {
        Self {
            run_id,
            workflow,
            event_bus,
            context: ExecutionContext::from_map(workflow.variables.clone()),
            events: Vec::new(),
            next_seq: 0,
            path: Vec::new(),
            trail: Vec::new(),
            visited: HashSet::new(),
            loop_entries: HashMap::new(),
        }
    }

    fn event(
        &mut self,
        node_id: Option<String>,
        kind: EventKind,
        message: String,
        snapshot: bool,
        status: Option<RunStatus>,
    ) {
        let event = RunEvent {
            run_id: self.run_id.clone(),
            seq: self.next_seq,
            timestamp: Utc::now(),
            node_id,
            kind,
            message,
            context_snapshot: snapshot.then(|| self.context.snapshot()),
            status,
        };
        self.next_seq += 1;
        self.event_bus.publish(event.clone());
        self.events.push(event);
    }

    fn emit(&mut self, node_id: Option<String>, kind: EventKind, message: String) {
        self.event(node_id, kind, message, false, None);
    }

    fn emit_with_snapshot(&mut self, node_id: Option<String>, kind: EventKind, message: String) {
        self.event(node_id, kind, message, true, None);
    }

    fn finish(&mut self, node_id: Option<String>, kind: EventKind, message: String, status: RunStatus) {
        self.event(node_id, kind, message, true, Some(status));
    }

    /// Record entry into a non-loop node; a second entry is an infinite loop.
    fn enter(&mut self, node: &Node) -> Result<()> {
        if !self.visited.insert(node.id.clone()) {
            warn!(node_id = %node.id, "Node revisited");
            return Err(FlowError::InfiniteLoop {
                node_id: node.id.clone(),
            });
        }
        self.trail.push(node.id.clone());
        Ok(())
    }

    /// Record entry into a loop node. Re-entry is allowed while the entry
    /// count is below `budget`; it forgets everything visited since the
    /// previous entry so the loop body may run again.
    fn enter_loop(&mut self, node: &Node, budget: u64) -> Result<()> {
        let budget = budget.max(1);
        match self.loop_entries.get(&node.id).copied() {
            None => {
                self.loop_entries
                    .insert(node.id.clone(), (1, self.trail.len()));
                self.trail.push(node.id.clone());
                Ok(())
            }
            Some((entries, _)) if entries >= budget => {
                warn!(node_id = %node.id, entries, budget, "Loop re-entry budget exhausted");
                Err(FlowError::InfiniteLoop {
                    node_id: node.id.clone(),
                })
            }
            Some((entries, position)) => {
                for id in self.trail.drain(position + 1..) {
                    self.visited.remove(&id);
                    self.loop_entries.remove(&id);
                }
                self.loop_entries
                    .insert(node.id.clone(), (entries + 1, position));
                debug!(node_id = %node.id, entry = entries + 1, "Loop re-entered");
                Ok(())
            }
        }
    }

    /// Work out how many times a loop node runs its script.
    fn resolve_iterations(&mut self, node: &Node) -> u64 {
        let resolved = match node.iterations.as_ref().map(|i| i.source()) {
            Some(IterationSource::Literal(n)) => Some(n),
            Some(IterationSource::Variable(name)) => self.context.get(name).and_then(as_count),
            None => None,
        };
        match resolved {
            Some(n) => n.max(0) as u64,
            None => {
                self.emit(
                    Some(node.id.clone()),
                    EventKind::Warning,
                    format!(
                        "Loop '{}' has no usable iteration count; running once",
                        node.display_name()
                    ),
                );
                1
            }
        }
    }

    /// The linear successor of `node`, or `None` (with an info event) when
    /// it has none and the run should end.
    fn continuation(&mut self, node: &Node) -> Option<String> {
        let next = self.workflow.next_node(&node.id).map(str::to_string);
        if next.is_none() {
            self.emit(
                Some(node.id.clone()),
                EventKind::Info,
                format!("Node '{}' has no continuation; finishing run", node.display_name()),
            );
        }
        next
    }
}

/// Interpret a context value as an iteration count.
fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
