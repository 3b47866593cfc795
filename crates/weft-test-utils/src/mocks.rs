use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::definition::WorkflowStep;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{
    AgentExecutor, ApprovalDecision, ApprovalGate, ScriptOutput, ScriptRunner,
};

/// A canned result for one agent or script invocation.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(Value),
    Error(String),
}

/// One recorded call to [`MockAgentExecutor`].
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub agent_id: String,
    pub request_id: String,
    pub workflow_id: String,
    pub input: Value,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct AgentScript {
    queued: VecDeque<MockResponse>,
    fallback: Option<MockResponse>,
    delay: Option<Duration>,
}

/// Mock agent executor for testing.
///
/// Each agent answers from its queue of one-shot responses first, then from
/// its fallback response. Unconfigured agents succeed with
/// `{"agent": <id>, "status": "ok"}`.
#[derive(Default)]
pub struct MockAgentExecutor {
    agents: Mutex<HashMap<String, AgentScript>>,
    calls: Mutex<Vec<AgentCall>>,
}

impl MockAgentExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `agent_id` with `output`.
    pub fn with_output(self, agent_id: &str, output: Value) -> Self {
        self.script(agent_id, |s| s.fallback = Some(MockResponse::Output(output)));
        self
    }

    /// Always fail `agent_id` with `message`.
    pub fn with_error(self, agent_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        self.script(agent_id, |s| s.fallback = Some(MockResponse::Error(message)));
        self
    }

    /// Sleep before every answer from `agent_id`.
    pub fn with_delay(self, agent_id: &str, delay: Duration) -> Self {
        self.script(agent_id, |s| s.delay = Some(delay));
        self
    }

    /// Queue a one-shot response for the next call to `agent_id`.
    pub fn push(&self, agent_id: &str, response: MockResponse) {
        self.script(agent_id, |s| s.queued.push_back(response));
    }

    pub fn push_error(&self, agent_id: &str, message: impl Into<String>) {
        self.push(agent_id, MockResponse::Error(message.into()));
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, agent_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .count()
    }

    fn script(&self, agent_id: &str, f: impl FnOnce(&mut AgentScript)) {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        f(agents.entry(agent_id.to_string()).or_default());
    }

    fn next_response(&self, agent_id: &str) -> (MockResponse, Option<Duration>) {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        let default = || MockResponse::Output(json!({ "agent": agent_id, "status": "ok" }));
        match agents.get_mut(agent_id) {
            Some(script) => {
                let response = script
                    .queued
                    .pop_front()
                    .or_else(|| script.fallback.clone())
                    .unwrap_or_else(default);
                (response, script.delay)
            }
            None => (default(), None),
        }
    }
}

impl AgentExecutor for MockAgentExecutor {
    fn execute_agent(
        &self,
        agent_id: &str,
        request_id: &str,
        workflow_id: &str,
        input_data: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AgentCall {
                agent_id: agent_id.to_string(),
                request_id: request_id.to_string(),
                workflow_id: workflow_id.to_string(),
                input: input_data,
                at: Utc::now(),
            });
        let (response, delay) = self.next_response(agent_id);
        let agent = agent_id.to_string();

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match response {
                MockResponse::Output(v) => Ok(v),
                MockResponse::Error(message) => Err(WeftError::Agent { agent, message }),
            }
        })
    }
}

/// Mock script runner keyed by script path.
///
/// Unknown paths exit 0 with an empty stdout.
#[derive(Default)]
pub struct MockScriptRunner {
    outputs: Mutex<HashMap<String, ScriptOutput>>,
    runs: Mutex<Vec<(String, Vec<String>, Value)>>,
}

impl MockScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit(self, path: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                path.to_string(),
                ScriptOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code,
                },
            );
        self
    }

    /// Recorded `(path, args, input)` triples.
    pub fn runs(&self) -> Vec<(String, Vec<String>, Value)> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ScriptRunner for MockScriptRunner {
    fn run(&self, path: &str, args: &[String], input: Value) -> BoxFuture<'_, Result<ScriptOutput>> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((path.to_string(), args.to_vec(), input));
        let output = self
            .outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .unwrap_or(ScriptOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            });
        Box::pin(async move { Ok(output) })
    }
}

/// Mock approval gate answering every request with a fixed decision.
pub struct MockApprovalGate {
    decision: ApprovalDecision,
    requests: Mutex<Vec<(String, String)>>,
}

impl MockApprovalGate {
    pub fn approve_all(output: Value) -> Self {
        Self::with_decision(ApprovalDecision::Approved { output })
    }

    pub fn reject_all(reason: impl Into<String>) -> Self {
        Self::with_decision(ApprovalDecision::Rejected {
            reason: reason.into(),
        })
    }

    pub fn defer_all() -> Self {
        Self::with_decision(ApprovalDecision::Deferred)
    }

    pub fn with_decision(decision: ApprovalDecision) -> Self {
        Self {
            decision,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Recorded `(execution_id, step_id)` pairs.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ApprovalGate for MockApprovalGate {
    fn request_approval(
        &self,
        execution_id: &str,
        step: &WorkflowStep,
    ) -> BoxFuture<'_, Result<ApprovalDecision>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((execution_id.to_string(), step.id.clone()));
        let decision = self.decision.clone();
        Box::pin(async move { Ok(decision) })
    }
}
