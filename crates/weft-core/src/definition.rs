use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::{Result, WeftError};

/// Kind of work a step performs. The set is closed; the executor has one
/// handler per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[serde(alias = "AGENT")]
    Agent,
    #[serde(alias = "CONDITION")]
    Condition,
    #[serde(alias = "PARALLEL")]
    Parallel,
    #[serde(alias = "MANUAL")]
    Manual,
    #[serde(alias = "SCRIPT")]
    Script,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Agent => write!(f, "agent"),
            StepKind::Condition => write!(f, "condition"),
            StepKind::Parallel => write!(f, "parallel"),
            StepKind::Manual => write!(f, "manual"),
            StepKind::Script => write!(f, "script"),
        }
    }
}

/// When a step hands its work to the next agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffKind {
    /// Hand off whenever the step completes.
    #[default]
    #[serde(alias = "ALWAYS")]
    Always,
    /// Hand off on completion when the handoff condition holds.
    #[serde(alias = "CONDITIONAL")]
    Conditional,
    /// Hand off only when the step fails.
    #[serde(alias = "ON_ERROR")]
    OnError,
    #[serde(alias = "NEVER")]
    Never,
}

impl HandoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffKind::Always => "always",
            HandoffKind::Conditional => "conditional",
            HandoffKind::OnError => "on_error",
            HandoffKind::Never => "never",
        }
    }
}

impl std::fmt::Display for HandoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HandoffKind {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(HandoffKind::Always),
            "conditional" => Ok(HandoffKind::Conditional),
            "on_error" => Ok(HandoffKind::OnError),
            "never" => Ok(HandoffKind::Never),
            other => Err(WeftError::InvalidStatus(format!("unknown handoff kind '{}'", other))),
        }
    }
}

/// A single step inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique identifier across the whole definition.
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 1-based position inside the owning phase.
    pub number: u32,
    pub kind: StepKind,
    /// Agent id for AGENT steps, script path for SCRIPT steps.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    /// Expression for CONDITION steps.
    #[serde(default)]
    pub condition: Option<String>,
    /// Extra arguments for SCRIPT steps.
    #[serde(default)]
    pub args: Vec<String>,
    /// Sub-steps for PARALLEL steps, run concurrently.
    #[serde(default)]
    pub branches: Vec<WorkflowStep>,
    /// Per-step timeout override.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Step id or agent id receiving this step's handoff.
    #[serde(default)]
    pub handoff_to: Option<String>,
    #[serde(default)]
    pub handoff_kind: HandoffKind,
    /// Expression gating CONDITIONAL handoffs.
    #[serde(default)]
    pub handoff_condition: Option<String>,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
}

fn default_mandatory() -> bool { true }

impl WorkflowStep {
    fn new(id: impl Into<String>, number: u32, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            number,
            kind,
            target: None,
            input: serde_json::Map::new(),
            condition: None,
            args: vec![],
            branches: vec![],
            timeout_secs: None,
            handoff_to: None,
            handoff_kind: HandoffKind::default(),
            handoff_condition: None,
            mandatory: true,
        }
    }

    /// An AGENT step dispatched to `agent_id`.
    pub fn agent(id: impl Into<String>, number: u32, agent_id: impl Into<String>) -> Self {
        let mut step = Self::new(id, number, StepKind::Agent);
        step.target = Some(agent_id.into());
        step
    }

    /// A SCRIPT step running the executable at `path`.
    pub fn script(id: impl Into<String>, number: u32, path: impl Into<String>) -> Self {
        let mut step = Self::new(id, number, StepKind::Script);
        step.target = Some(path.into());
        step
    }

    /// A CONDITION step evaluating `expr`.
    pub fn condition(id: impl Into<String>, number: u32, expr: impl Into<String>) -> Self {
        let mut step = Self::new(id, number, StepKind::Condition);
        step.condition = Some(expr.into());
        step
    }

    /// A MANUAL step waiting on an approval.
    pub fn manual(id: impl Into<String>, number: u32) -> Self {
        Self::new(id, number, StepKind::Manual)
    }

    /// A PARALLEL step running `branches` concurrently.
    pub fn parallel(id: impl Into<String>, number: u32, branches: Vec<WorkflowStep>) -> Self {
        let mut step = Self::new(id, number, StepKind::Parallel);
        step.branches = branches;
        step
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_handoff(mut self, to: impl Into<String>, kind: HandoffKind) -> Self {
        self.handoff_to = Some(to.into());
        self.handoff_kind = kind;
        self
    }

    pub fn with_handoff_condition(mut self, expr: impl Into<String>) -> Self {
        self.handoff_condition = Some(expr.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Mark the step as optional: its failure does not halt the workflow
    /// under the default failure policy.
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    /// The agent id for AGENT steps.
    pub fn agent_id(&self) -> Option<&str> {
        match self.kind {
            StepKind::Agent => self.target.as_deref(),
            _ => None,
        }
    }

    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// An ordered group of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 1-based position inside the definition.
    pub number: u32,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowPhase {
    pub fn new(id: impl Into<String>, number: u32) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            number,
            steps: vec![],
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            status: default_status(),
            priority: default_priority(),
            author: None,
            tags: vec![],
        }
    }
}

fn default_version() -> String { "1.0.0".to_string() }
fn default_status() -> String { "active".to_string() }
fn default_priority() -> String { "medium".to_string() }

/// What the workflow executor does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt only when a mandatory step fails; optional failures are skipped over.
    #[default]
    HaltOnMandatory,
    /// Halt on any step failure.
    HaltOnAny,
}

/// Per-definition overrides of the global retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_secs: Option<f64>,
    #[serde(default)]
    pub backoff_base: Option<f64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

impl RetryPolicy {
    /// Overlay these overrides on a base configuration.
    pub fn apply_to(&self, base: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay_secs: self.initial_delay_secs.unwrap_or(base.initial_delay_secs),
            backoff_base: self.backoff_base.unwrap_or(base.backoff_base),
            jitter: self.jitter.unwrap_or(base.jitter),
            ..base.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

/// Immutable description of a workflow, identified by `(id, metadata.version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub phases: Vec<WorkflowPhase>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

impl WorkflowDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            metadata: WorkflowMetadata::default(),
            phases: vec![],
            rules: vec![],
            error_handling: ErrorHandlingPolicy::default(),
            success_criteria: vec![],
        }
    }

    pub fn with_phase(mut self, phase: WorkflowPhase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.error_handling.on_failure = policy;
        self
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    /// Every step in the definition, including parallel branches, in
    /// declaration order.
    pub fn all_steps(&self) -> Vec<&WorkflowStep> {
        fn collect<'a>(steps: &'a [WorkflowStep], out: &mut Vec<&'a WorkflowStep>) {
            for step in steps {
                out.push(step);
                collect(&step.branches, out);
            }
        }

        let mut out = Vec::new();
        for phase in &self.phases {
            collect(&phase.steps, &mut out);
        }
        out
    }

    pub fn find_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.all_steps().into_iter().find(|s| s.id == step_id)
    }

    pub fn find_phase(&self, phase_id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    pub fn step_ids(&self) -> HashSet<String> {
        self.all_steps().into_iter().map(|s| s.id.clone()).collect()
    }

    /// Parse a definition from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::DefinitionParse(e.to_string()))
    }

    /// Parse a definition from JSON text.
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| WeftError::DefinitionParse(e.to_string()))
    }

    /// Load a definition file; `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::NotFound(path.display().to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }
}
