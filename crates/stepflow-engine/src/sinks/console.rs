use std::io::Write;

use futures::future::BoxFuture;

use stepflow_core::error::Result;
use stepflow_core::traits::EventSink;
use stepflow_core::types::RunEvent;

/// Prints events to stderr as `[timestamp] [KIND] node: message`.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    show_context: bool,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also print the context snapshot carried by success and terminal events.
    pub fn with_context(mut self, show: bool) -> Self {
        self.show_context = show;
        self
    }
}

/// Render one event as a console line (no trailing newline).
pub fn format_event(event: &RunEvent) -> String {
    let timestamp = event
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S");
    match &event.node_id {
        Some(node) => format!(
            "[{}] [{}] {}: {}",
            timestamp,
            event.kind.as_str(),
            node,
            event.message
        ),
        None => format!("[{}] [{}] {}", timestamp, event.kind.as_str(), event.message),
    }
}

impl ConsoleSink {
    fn write(&self, event: &RunEvent) -> Result<()> {
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{}", format_event(event))?;
        if self.show_context {
            if let Some(snapshot) = &event.context_snapshot {
                writeln!(stderr, "    context: {}", serde_json::to_string(snapshot)?)?;
            }
        }
        Ok(())
    }
}

impl EventSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn handle(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        let written = self.write(&event);
        Box::pin(async move { written })
    }
}
