use std::collections::BTreeMap;

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::config::AgentsConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::AgentExecutor;

use super::script::run_child;

/// Agent executor backed by shell commands from `[agents.commands]`.
///
/// The step input is written to stdin as JSON. Stdout is parsed as JSON
/// when it can be, otherwise wrapped as `{"output": "<stdout>"}`. A
/// non-zero exit is an agent failure carrying stderr.
#[derive(Debug, Clone, Default)]
pub struct CommandAgentExecutor {
    commands: BTreeMap<String, String>,
}

impl CommandAgentExecutor {
    pub fn new(commands: BTreeMap<String, String>) -> Self {
        Self { commands }
    }

    pub fn from_config(agents: &AgentsConfig) -> Self {
        Self::new(agents.commands.clone())
    }

    pub fn has_command(&self, agent_id: &str) -> bool {
        self.commands.contains_key(agent_id)
    }
}

impl AgentExecutor for CommandAgentExecutor {
    fn execute_agent(
        &self,
        agent_id: &str,
        request_id: &str,
        workflow_id: &str,
        input_data: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let agent_id = agent_id.to_string();
        let request_id = request_id.to_string();
        let workflow_id = workflow_id.to_string();
        let input = serde_json::to_vec(&input_data).unwrap_or_default();

        Box::pin(async move {
            let command = self.commands.get(&agent_id).ok_or_else(|| {
                WeftError::Config(format!("no command configured for agent {}", agent_id))
            })?;

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .env("WEFT_AGENT_ID", &agent_id)
                .env("WEFT_REQUEST_ID", &request_id)
                .env("WEFT_WORKFLOW_ID", &workflow_id);

            debug!(agent = %agent_id, request_id = %request_id, "Running agent command");
            let output = run_child(cmd, &agent_id, input).await?;

            if !output.success() {
                let stderr = output.stderr.trim();
                return Err(WeftError::Agent {
                    agent: agent_id,
                    message: if stderr.is_empty() {
                        format!("command exited with code {}", output.exit_code)
                    } else {
                        stderr.to_string()
                    },
                });
            }

            let stdout = output.stdout.trim();
            Ok(serde_json::from_str(stdout)
                .unwrap_or_else(|_| serde_json::json!({ "output": stdout })))
        })
    }
}
