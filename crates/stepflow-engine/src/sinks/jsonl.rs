use std::path::{Path, PathBuf};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use stepflow_core::error::Result;
use stepflow_core::traits::EventSink;
use stepflow_core::types::RunEvent;

/// JSONL run log.
///
/// One event per line, flushed after every line, so a crash mid-run
/// leaves every earlier line intact. Files are named
/// `{log_dir}/{workflow_id}_{YYYYmmdd_HHMMSS}.jsonl`.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    /// Create the log directory if needed and open a fresh log file.
    pub async fn create(log_dir: &Path, workflow_id: &str) -> Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("{}_{}.jsonl", sanitize(workflow_id), timestamp));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Run log opened");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Keep workflow ids usable as file name components.
fn sanitize(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "workflow".to_string()
    } else {
        cleaned
    }
}

impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn handle(&self, event: RunEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');

            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer.lock().await.flush().await?;
            debug!(path = %self.path.display(), "Run log finished");
            Ok(())
        })
    }
}
