use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use weft_core::event::EventBus;
use weft_core::types::{EventType, WorkflowEvent};

/// JSONL event mirror.
///
/// Subscribes to the EventBus and appends every event as one JSON line to
/// `{dir}/{correlation_id}.jsonl`. Each line is flushed as it is written,
/// so a crash never leaves a partial record behind earlier ones. A file is
/// closed once its execution ends or pauses; a resumed run reopens it in
/// append mode.
pub struct JsonlMirror {
    dir: PathBuf,
}

impl JsonlMirror {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Run the mirror until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!(error = %e, dir = %self.dir.display(), "Failed to create JSONL directory");
            return;
        }

        info!(dir = %self.dir.display(), "JSONL mirror started");
        let mut rx = event_bus.subscribe();
        let mut files: HashMap<String, tokio::io::BufWriter<tokio::fs::File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("JSONL mirror cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if let Err(e) = self.write_event(&mut files, &event).await {
                                error!(error = %e, correlation_id = %event.correlation_id, "Failed to mirror event");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "JSONL mirror lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, JSONL mirror stopping");
                            break;
                        }
                    }
                }
            }
        }

        for writer in files.values_mut() {
            writer.flush().await.ok();
        }
        debug!("JSONL mirror finished");
    }

    async fn write_event(
        &self,
        files: &mut HashMap<String, tokio::io::BufWriter<tokio::fs::File>>,
        event: &WorkflowEvent,
    ) -> std::io::Result<()> {
        if !files.contains_key(&event.correlation_id) {
            let path = self.path_for(&event.correlation_id);
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            files.insert(event.correlation_id.clone(), tokio::io::BufWriter::new(file));
        }

        let Some(writer) = files.get_mut(&event.correlation_id) else {
            return Ok(());
        };

        let json = serde_json::to_string(event)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        if closes_file(event.event_type) {
            files.remove(&event.correlation_id);
            trace!(correlation_id = %event.correlation_id, open = files.len(), "Closed JSONL file");
        }
        Ok(())
    }

    /// File that holds the events of `correlation_id`.
    pub fn path_for(&self, correlation_id: &str) -> PathBuf {
        let safe: String = correlation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }
}

fn closes_file(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::WorkflowCompleted
            | EventType::WorkflowFailed
            | EventType::WorkflowCancelled
            | EventType::WorkflowPaused
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mirror_writes_one_line_per_event() {
        let dir = std::env::temp_dir().join(format!("weft_jsonl_test_{}", uuid::Uuid::new_v4()));
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let mirror = JsonlMirror::new(dir.clone());
        let path = mirror.path_for("exec-1");

        let handle = tokio::spawn(mirror.run(bus.clone(), cancel.clone()));
        // Let the mirror subscribe before publishing
        for _ in 0..50 {
            if bus.receiver_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        bus.publish(WorkflowEvent::new(EventType::WorkflowStarted, "exec-1"));
        bus.publish(WorkflowEvent::new(EventType::StepStarted, "exec-1").with_step("a"));
        bus.publish(WorkflowEvent::new(EventType::WorkflowStarted, "exec-2"));

        let mut lines = Vec::new();
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                lines = content.lines().map(String::from).collect();
                if lines.len() == 2 && dir.join("exec-2.jsonl").exists() {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(lines.len(), 2);
        let second: WorkflowEvent = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(second.step_id.as_deref(), Some("a"));
        assert!(dir.join("exec-2.jsonl").exists());
    }

    #[tokio::test]
    async fn test_file_closed_on_terminal_event_and_reopened() {
        let dir = std::env::temp_dir().join(format!("weft_jsonl_test_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let mirror = JsonlMirror::new(dir.clone());
        let mut files = HashMap::new();

        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowStarted, "exec-1"))
            .await
            .unwrap();
        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowStarted, "exec-2"))
            .await
            .unwrap();
        assert_eq!(files.len(), 2);

        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowPaused, "exec-1"))
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(!files.contains_key("exec-1"));

        // Resuming appends to the same file
        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowResumed, "exec-1"))
            .await
            .unwrap();
        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowCompleted, "exec-1"))
            .await
            .unwrap();
        mirror
            .write_event(&mut files, &WorkflowEvent::new(EventType::WorkflowFailed, "exec-2"))
            .await
            .unwrap();
        assert!(files.is_empty());

        let content = tokio::fs::read_to_string(mirror.path_for("exec-1")).await.unwrap();
        assert_eq!(content.lines().count(), 4);
    }

    #[test]
    fn test_path_is_sanitized() {
        let mirror = JsonlMirror::new(PathBuf::from("/tmp/weft"));
        assert_eq!(mirror.path_for("a/b"), PathBuf::from("/tmp/weft/a_b.jsonl"));
    }
}
