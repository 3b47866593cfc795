use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Definition errors
    #[error("Workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failed to parse workflow definition: {0}")]
    DefinitionParse(String),

    // State repository errors
    #[error("Version conflict for state {state_id}: expected version {expected}, stored version is {actual}")]
    VersionConflict {
        state_id: String,
        expected: u64,
        actual: u64,
    },

    // Handoff errors
    #[error("No handoff target specified for step: {0}")]
    NoHandoffTarget(String),

    #[error("Handoff validation failed: {}", .0.join("; "))]
    HandoffValidation(Vec<String>),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    // Execution errors
    #[error("Agent {agent} failed: {message}")]
    Agent { agent: String, message: String },

    #[error("Script {path} exited with code {code}: {stderr}")]
    Script {
        path: String,
        code: i32,
        stderr: String,
    },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Step {step} failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Whether this is an optimistic-locking conflict the caller should
    /// resolve by reloading and retrying its own operation.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, WeftError::VersionConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
