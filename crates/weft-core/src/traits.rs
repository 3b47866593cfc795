use std::collections::HashSet;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::definition::WorkflowStep;
use crate::error::Result;

/// Agent executor: performs the actual agent work for AGENT steps.
pub trait AgentExecutor: Send + Sync + 'static {
    /// Run `agent_id` on `input_data` and return its output payload.
    ///
    /// Errors are caught and classified by the step executor.
    fn execute_agent(
        &self,
        agent_id: &str,
        request_id: &str,
        workflow_id: &str,
        input_data: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Agent directory: answers which agent ids exist.
pub trait AgentDiscovery: Send + Sync + 'static {
    fn get_agent_ids(&self) -> HashSet<String>;

    fn agent_exists(&self, agent_id: &str) -> bool {
        self.get_agent_ids().contains(agent_id)
    }
}

/// Captured result of an external script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Script runner: launches SCRIPT steps as external processes.
pub trait ScriptRunner: Send + Sync + 'static {
    /// Run `path` with `args`, feeding `input` (JSON) on stdin.
    ///
    /// A non-zero exit is reported through `ScriptOutput::exit_code`, not as
    /// an error; errors mean the process could not be run at all.
    fn run(
        &self,
        path: &str,
        args: &[String],
        input: serde_json::Value,
    ) -> BoxFuture<'_, Result<ScriptOutput>>;
}

/// Outcome of a MANUAL step approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved {
        #[serde(default)]
        output: serde_json::Value,
    },
    Rejected {
        reason: String,
    },
    /// No decision yet; the execution pauses at this step.
    Deferred,
}

/// Approval gate: the human-in-the-loop collaborator behind MANUAL steps.
pub trait ApprovalGate: Send + Sync + 'static {
    fn request_approval(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
    ) -> BoxFuture<'_, Result<ApprovalDecision>>;
}

/// Fixed agent directory, typically built from `[agents] known = [...]`.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentDirectory {
    agents: HashSet<String>,
}

impl StaticAgentDirectory {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }

    pub fn register(&mut self, agent_id: impl Into<String>) {
        self.agents.insert(agent_id.into());
    }
}

impl AgentDiscovery for StaticAgentDirectory {
    fn get_agent_ids(&self) -> HashSet<String> {
        self.agents.clone()
    }

    fn agent_exists(&self, agent_id: &str) -> bool {
        self.agents.contains(agent_id)
    }
}
