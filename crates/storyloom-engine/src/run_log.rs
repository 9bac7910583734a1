use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use storyloom_core::types::ExecutionEvent;

/// JSONL execution logger.
///
/// Consumes events from the EventBus and writes one JSON object per line to
/// `{log_dir}/{execution_id}.jsonl`. The file is append-only and flushed after
/// every entry, so lines written before a crash survive it.
pub struct RunLogger {
    log_dir: PathBuf,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    execution_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Write events for `execution_id` until its terminal status event
    /// arrives or the bus closes.
    ///
    /// Takes an already-subscribed receiver so the caller can subscribe
    /// before the execution starts publishing.
    pub async fn run(self, mut rx: broadcast::Receiver<ExecutionEvent>, execution_id: String) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&execution_id);
        let file = match open_append(&log_path).await {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.execution_id() != execution_id {
                        continue;
                    }

                    if let Ok(json) = serde_json::to_string(&event_to_entry(&event)) {
                        let line = format!("{}\n", json);
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }

                    if event.is_terminal() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "RunLogger lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventBus closed, RunLogger stopping");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

fn event_to_entry(event: &ExecutionEvent) -> LogEntry {
    let (node_id, detail) = match event {
        ExecutionEvent::StatusChanged { status, .. } => {
            (None, Some(serde_json::json!({ "status": status })))
        }
        ExecutionEvent::NodeStarted { node_id, .. } => (Some(node_id.clone()), None),
        ExecutionEvent::NodeCompleted {
            node_id,
            elapsed_ms,
            ..
        } => (
            Some(node_id.clone()),
            Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
        ),
        ExecutionEvent::NodeFailed { node_id, error, .. } => (
            Some(node_id.clone()),
            Some(serde_json::json!({ "error": error })),
        ),
        ExecutionEvent::NodeProgress {
            node_id,
            index,
            item,
            ..
        } => (
            Some(node_id.clone()),
            Some(serde_json::json!({
                "index": index,
                "item_preview": truncate_json(item, 200),
            })),
        ),
    };

    LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        execution_id: event.execution_id().to_string(),
        event_type: event.name().to_string(),
        node_id,
        detail,
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
