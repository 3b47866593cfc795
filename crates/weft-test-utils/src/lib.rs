//! Shared mocks and fixtures for weft tests.

pub mod mocks;

pub use mocks::{AgentCall, MockAgentExecutor, MockApprovalGate, MockResponse, MockScriptRunner};

use std::path::Path;

use tempfile::TempDir;

use weft_core::config::WeftConfig;
use weft_core::definition::{HandoffKind, WorkflowDefinition, WorkflowPhase, WorkflowStep};
use weft_core::traits::StaticAgentDirectory;

/// Agents known to [`agent_directory`].
pub const KNOWN_AGENTS: [&str; 3] = ["researcher", "writer", "reviewer"];

pub fn agent_directory() -> StaticAgentDirectory {
    StaticAgentDirectory::new(KNOWN_AGENTS)
}

pub fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Config rooted at `data_dir` with fast, deterministic retries.
pub fn test_config(data_dir: &Path) -> WeftConfig {
    let raw = format!(
        r#"
[storage]
data_dir = "{}"

[retry]
max_attempts = 3
initial_delay_secs = 0.01
backoff_base = 2.0
max_delay_secs = 0.05
jitter = false
respect_retry_after = false

[circuit_breaker]
failure_threshold = 5
cool_down_secs = 60

[executor]
step_timeout_secs = 5

[agents]
known = ["researcher", "writer", "reviewer"]
"#,
        data_dir.display().to_string().replace('\\', "/")
    );
    toml::from_str(&raw).unwrap()
}

/// research → draft (handoff) → review, all mandatory, one phase each.
pub fn research_pipeline() -> WorkflowDefinition {
    WorkflowDefinition::new("research-pipeline", "Research pipeline", "Research, draft, review")
        .with_phase(
            WorkflowPhase::new("gather", 1).with_step(
                WorkflowStep::agent("research", 1, "researcher")
                    .with_handoff("draft", HandoffKind::Always),
            ),
        )
        .with_phase(
            WorkflowPhase::new("write", 2)
                .with_step(WorkflowStep::agent("draft", 1, "writer"))
                .with_step(WorkflowStep::agent("review", 2, "reviewer")),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::traits::{AgentDiscovery, AgentExecutor};

    #[test]
    fn test_config_fixture_parses() {
        let dir = temp_dir();
        let config = test_config(dir.path());
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.retry.jitter);
        assert_eq!(config.data_dir(), dir.path());
        assert!(agent_directory().agent_exists("writer"));
    }

    #[tokio::test]
    async fn test_mock_agent_queue_then_fallback() {
        let mock = MockAgentExecutor::new().with_output("writer", serde_json::json!({ "draft": 1 }));
        mock.push_error("writer", "connection reset");

        let first = mock
            .execute_agent("writer", "r1", "wf", serde_json::Value::Null)
            .await;
        assert!(first.is_err());
        let second = mock
            .execute_agent("writer", "r2", "wf", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(second["draft"], 1);
        assert_eq!(mock.call_count("writer"), 2);

        let other = mock
            .execute_agent("reviewer", "r3", "wf", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(other["status"], "ok");
    }
}
