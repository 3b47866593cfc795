//! Workflow validation, error handling, handoffs, and execution.

pub mod circuit_breaker;
pub mod classifier;
pub mod condition;
pub mod executor;
pub mod handoff;
pub mod retry;
pub mod validator;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
pub use classifier::{classify, classify_error};
pub use condition::{evaluate_condition, ConditionContext};
pub use executor::{
    CommandAgentExecutor, ExecutionControl, ProcessScriptRunner, Services, StepExecutor,
    StepOutcome, StepPolicy, WorkflowExecutor,
};
pub use handoff::{handoff_due, HandoffGenerator};
pub use retry::{RetryError, RetryHandler};
pub use validator::WorkflowValidator;
