use anyhow::Result;
use ciflow_core::RecordedEvent;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Appends recorded events to a JSONL file from a background task.
///
/// Cloning is cheap; all clones feed the same writer.
#[derive(Clone)]
pub struct RecordingLogger {
    sender: mpsc::UnboundedSender<RecordedEvent>,
}

impl RecordingLogger {
    /// Start the writer task. Must be called from within a Tokio runtime.
    pub fn spawn(log_file_path: PathBuf) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = Self::writer_task(log_file_path, receiver).await {
                error!("Recording logger failed: {:#}", e);
            }
        });

        Self { sender }
    }

    pub fn record(&self, event: RecordedEvent) {
        if self.sender.send(event).is_err() {
            error!("Failed to send event to recording logger: writer stopped");
        }
    }

    async fn writer_task(
        log_file_path: PathBuf,
        mut receiver: mpsc::UnboundedReceiver<RecordedEvent>,
    ) -> Result<()> {
        if let Some(parent) = log_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .await?;

        info!("Recording events to: {}", log_file_path.display());

        while let Some(event) = receiver.recv().await {
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                error!("Failed to write event to log: {}", e);
                continue;
            }
            if let Err(e) = file.flush().await {
                error!("Failed to flush log file: {}", e);
            }
        }

        info!("Recording writer task shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciflow_core::{CorrelationId, Direction, EventType};
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recordings").join("events.jsonl");
        let logger = RecordingLogger::spawn(path.clone());

        for operation in ["pull_request.labeled", "pull_request.closed"] {
            logger.record(RecordedEvent::new(
                "2024-01-01T00:00:00Z",
                &CorrelationId("abc".to_string()),
                EventType::WebhookReceived,
                Direction::Request,
                operation,
                serde_json::json!({}),
            ));
        }

        let mut contents = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
        }

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: RecordedEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.operation, "pull_request.closed");
    }
}
