use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use weft_core::definition::{StepKind, WorkflowStep};
use weft_core::error::{Result, WeftError};
use weft_core::traits::ApprovalDecision;
use weft_core::types::{
    EventStatus, EventType, HandoffStatus, StepExecution, WorkflowEvent, WorkflowExecution,
};

use super::{Services, StepPolicy};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::condition::{evaluate_condition, ConditionContext};
use crate::retry::{RetryError, RetryHandler};

/// What became of a dispatched step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The step completed or failed.
    Finished(StepExecution),
    /// A MANUAL step is waiting for a decision. The record is back to pending.
    Paused(StepExecution),
}

enum Dispatched {
    Done { output: Value, retries: u32 },
    Failed { error: WeftError, retries: u32 },
    Paused,
}

impl Dispatched {
    fn failed(error: WeftError) -> Self {
        Dispatched::Failed { error, retries: 0 }
    }
}

/// Runs a single step: events, timeout, and dispatch by kind.
///
/// Step errors never escape; they end up in the returned [`StepExecution`].
pub struct StepExecutor {
    services: Arc<Services>,
}

impl StepExecutor {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Execute `step` in the context of `execution`.
    ///
    /// `decision` answers a MANUAL step directly instead of asking the gate.
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        policy: &StepPolicy,
        decision: Option<ApprovalDecision>,
    ) -> StepOutcome {
        let mut record = StepExecution::new(step);
        record.start();
        self.services.emit(
            step_event(execution, step, EventType::StepStarted).with_status(EventStatus::Started),
        );
        debug!(step_id = %step.id, kind = %step.kind, "Step started");

        let timeout_secs = policy.timeout_secs(step);
        let dispatched = match tokio::time::timeout(
            policy.timeout(step),
            self.dispatch(step, execution, policy, decision),
        )
        .await
        {
            Ok(d) => d,
            Err(_) => {
                warn!(step_id = %step.id, timeout_secs, "Step timed out");
                Dispatched::failed(WeftError::StepTimeout {
                    step: step.id.clone(),
                    timeout_secs,
                })
            }
        };

        match dispatched {
            Dispatched::Done { output, retries } => {
                record.retry_count = retries;
                record.complete(output);
                info!(
                    step_id = %step.id,
                    duration_ms = record.duration_ms.unwrap_or(0),
                    retries,
                    "Step completed"
                );
                self.services.emit(
                    step_event(execution, step, EventType::StepCompleted)
                        .with_status(EventStatus::Success)
                        .with_payload(json!({
                            "duration_ms": record.duration_ms,
                            "retry_count": retries,
                        })),
                );
                StepOutcome::Finished(record)
            }
            Dispatched::Failed { error, retries } => {
                record.retry_count = retries;
                record.fail(error.to_string());
                error!(step_id = %step.id, error = %error, retries, "Step failed");
                self.services.emit(
                    step_event(execution, step, EventType::StepFailed)
                        .with_status(EventStatus::Failure)
                        .with_payload(json!({
                            "error": error.to_string(),
                            "duration_ms": record.duration_ms,
                            "retry_count": retries,
                        })),
                );
                StepOutcome::Finished(record)
            }
            Dispatched::Paused => {
                info!(step_id = %step.id, "Step awaiting approval");
                StepOutcome::Paused(StepExecution::new(step))
            }
        }
    }

    fn dispatch<'a>(
        &'a self,
        step: &'a WorkflowStep,
        execution: &'a WorkflowExecution,
        policy: &'a StepPolicy,
        decision: Option<ApprovalDecision>,
    ) -> BoxFuture<'a, Dispatched> {
        Box::pin(async move {
            match step.kind {
                StepKind::Agent => self.run_agent(step, execution, policy).await,
                StepKind::Script => self.run_script(step, execution, policy).await,
                StepKind::Condition => run_condition(step, execution),
                StepKind::Parallel => self.run_parallel(step, execution, policy).await,
                StepKind::Manual => self.run_manual(step, execution, decision).await,
            }
        })
    }

    async fn run_agent(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        policy: &StepPolicy,
    ) -> Dispatched {
        let Some(agent_id) = step.agent_id() else {
            return Dispatched::failed(WeftError::StepFailed {
                step: step.id.clone(),
                message: "agent step has no target agent".into(),
            });
        };
        let input = self.step_input(step, execution);
        let agents = self.services.agents.clone();
        let workflow_id = execution.workflow_id.as_str();

        self.protected(
            &CircuitBreakerRegistry::agent_key(agent_id),
            agent_id,
            step,
            execution,
            policy,
            |attempt| {
                let request_id = Uuid::new_v4().to_string();
                debug!(agent_id, request_id = %request_id, attempt, "Dispatching to agent");
                agents.execute_agent(agent_id, &request_id, workflow_id, input.clone())
            },
        )
        .await
    }

    async fn run_script(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        policy: &StepPolicy,
    ) -> Dispatched {
        let Some(path) = step.target.as_deref() else {
            return Dispatched::failed(WeftError::StepFailed {
                step: step.id.clone(),
                message: "script step has no script path".into(),
            });
        };
        let input = self.step_input(step, execution);
        let scripts = self.services.scripts.clone();
        let key = CircuitBreakerRegistry::script_key(path);

        self.protected(&key, &key, step, execution, policy, |_| {
            let run = scripts.run(path, &step.args, input.clone());
            async move {
                let out = run.await?;
                if !out.success() {
                    return Err(WeftError::Script {
                        path: path.to_string(),
                        code: out.exit_code,
                        stderr: out.stderr.trim().to_string(),
                    });
                }
                Ok(json!({
                    "stdout": out.stdout,
                    "stderr": out.stderr,
                    "exit_code": out.exit_code,
                }))
            }
        })
        .await
    }

    async fn run_parallel(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        policy: &StepPolicy,
    ) -> Dispatched {
        let branches = step.branches.iter().map(|branch| async move {
            let secs = policy.timeout_secs(branch);
            match tokio::time::timeout(
                policy.timeout(branch),
                self.dispatch(branch, execution, policy, None),
            )
            .await
            {
                Ok(d) => d,
                Err(_) => Dispatched::failed(WeftError::StepTimeout {
                    step: branch.id.clone(),
                    timeout_secs: secs,
                }),
            }
        });
        let results = futures::future::join_all(branches).await;

        let mut outputs = Map::new();
        let mut failures = Vec::new();
        let mut retries = 0;
        for (branch, result) in step.branches.iter().zip(results) {
            let failure = match result {
                Dispatched::Done {
                    output,
                    retries: r,
                } => {
                    retries += r;
                    outputs.insert(branch.id.clone(), output);
                    continue;
                }
                Dispatched::Failed { error, retries: r } => {
                    retries += r;
                    error.to_string()
                }
                // Branches cannot suspend the execution on their own.
                Dispatched::Paused => "branch requires approval".to_string(),
            };
            debug!(step_id = %step.id, branch = %branch.id, error = %failure, "Branch failed");
            outputs.insert(branch.id.clone(), json!({ "error": failure }));
            if branch.mandatory {
                failures.push(format!("{}: {}", branch.id, failure));
            }
        }

        if failures.is_empty() {
            Dispatched::Done {
                output: Value::Object(outputs),
                retries,
            }
        } else {
            Dispatched::Failed {
                error: WeftError::StepFailed {
                    step: step.id.clone(),
                    message: format!("mandatory branches failed: {}", failures.join("; ")),
                },
                retries,
            }
        }
    }

    async fn run_manual(
        &self,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        decision: Option<ApprovalDecision>,
    ) -> Dispatched {
        let decision = match (decision, &self.services.approvals) {
            (Some(d), _) => d,
            (None, Some(gate)) => {
                match gate
                    .request_approval(&execution.execution_id.to_string(), step)
                    .await
                {
                    Ok(d) => d,
                    Err(e) => return Dispatched::failed(e),
                }
            }
            (None, None) => ApprovalDecision::Deferred,
        };

        match decision {
            ApprovalDecision::Approved { output } => Dispatched::Done { output, retries: 0 },
            ApprovalDecision::Rejected { reason } => Dispatched::failed(WeftError::StepFailed {
                step: step.id.clone(),
                message: format!("approval rejected: {}", reason),
            }),
            ApprovalDecision::Deferred => Dispatched::Paused,
        }
    }

    /// Run `operation` through the circuit breaker for `breaker_key`, with
    /// retries inside the breaker call. A sequence the retry handler gives
    /// up on goes to the dead-letter queue under `owner`.
    async fn protected<F, Fut>(
        &self,
        breaker_key: &str,
        owner: &str,
        step: &WorkflowStep,
        execution: &WorkflowExecution,
        policy: &StepPolicy,
        mut operation: F,
    ) -> Dispatched
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<Value>> + Send,
    {
        let breaker = self.services.breakers.get(breaker_key);
        let retry = RetryHandler::new(policy.retry.clone());
        let task_id = task_id(execution, step);
        let attempts = AtomicU32::new(0);
        let mut gave_up: Option<RetryError> = None;

        let result = {
            let attempts = &attempts;
            let slot = &mut gave_up;
            let task_id = task_id.as_str();
            breaker
                .call(move || async move {
                    retry
                        .execute_with_retry(
                            |attempt| {
                                attempts.store(attempt, Ordering::Relaxed);
                                operation(attempt)
                            },
                            task_id,
                            owner,
                        )
                        .await
                        .map_err(|failure| {
                            let err = WeftError::StepFailed {
                                step: failure.task_id.clone(),
                                message: failure.error.to_string(),
                            };
                            *slot = Some(failure);
                            err
                        })
                })
                .await
        };

        match (result, gave_up) {
            (Ok(output), _) => Dispatched::Done {
                output,
                retries: attempts.load(Ordering::Relaxed).saturating_sub(1),
            },
            (Err(_), Some(failure)) => {
                let retries = failure.attempts.saturating_sub(1);
                self.dead_letter(&task_id, owner, execution, step, &failure);
                Dispatched::Failed {
                    error: failure.into_error(),
                    retries,
                }
            }
            // Rejected by an open circuit; nothing was attempted.
            (Err(e), None) => Dispatched::failed(e),
        }
    }

    fn dead_letter(
        &self,
        task_id: &str,
        owner: &str,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
        failure: &RetryError,
    ) {
        match self.services.dead_letters.add_failed_task_with_history(
            task_id,
            owner,
            &failure.classified,
            failure.attempts,
            Some(&execution.workflow_id),
            failure.history.clone(),
        ) {
            Ok(task) => {
                warn!(
                    task_id,
                    agent_id = owner,
                    category = %task.error.category,
                    attempts = task.attempts,
                    "Task dead-lettered"
                );
                self.services.emit(
                    step_event(execution, step, EventType::TaskDeadLettered)
                        .with_agent(Some(owner))
                        .with_status(EventStatus::Failure)
                        .with_payload(json!({
                            "task_id": task_id,
                            "category": task.error.category,
                            "attempts": task.attempts,
                            "exhausted": failure.exhausted,
                            "can_retry": task.can_retry,
                            "error": failure.error.to_string(),
                        })),
                );
            }
            Err(e) => {
                error!(task_id, error = %e, "Failed to write dead letter");
                self.services.audit.log_error(
                    "dead_letter_write_failed",
                    &json!({ "task_id": task_id, "error": e.to_string() }),
                );
            }
        }
    }

    /// Input for AGENT and SCRIPT steps: the execution input, overlaid with
    /// the step's own input, plus earlier outputs and incoming handoffs.
    fn step_input(&self, step: &WorkflowStep, execution: &WorkflowExecution) -> Value {
        let mut input = match &execution.input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other.clone());
                map
            }
        };
        for (k, v) in &step.input {
            input.insert(k.clone(), v.clone());
        }

        let previous: Map<String, Value> = execution
            .step_outputs()
            .into_iter()
            .filter(|(_, s)| s.succeeded())
            .map(|(id, s)| (id.to_string(), s.output.clone()))
            .collect();
        if !previous.is_empty() {
            input.insert("previous_outputs".into(), Value::Object(previous));
        }

        let incoming = self.incoming_handoffs(execution, step);
        if !incoming.is_empty() {
            input.insert("handoffs".into(), Value::Array(incoming));
        }
        Value::Object(input)
    }

    fn incoming_handoffs(&self, execution: &WorkflowExecution, step: &WorkflowStep) -> Vec<Value> {
        let records = match self
            .services
            .handoffs
            .get_handoffs(Some(execution.execution_id.as_str()), None)
        {
            Ok(records) => records,
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Could not load incoming handoffs");
                return Vec::new();
            }
        };
        records
            .into_iter()
            .filter(|h| h.to_step.as_deref() == Some(step.id.as_str()))
            .filter(|h| !matches!(h.status, HandoffStatus::Rejected | HandoffStatus::Failed))
            .map(|h| {
                json!({
                    "handoff_id": h.handoff_id,
                    "from_agent": h.from_agent,
                    "from_step": h.step_id,
                    "work_summary": h.work_summary,
                    "deliverables": h.deliverables,
                })
            })
            .collect()
    }
}

fn run_condition(step: &WorkflowStep, execution: &WorkflowExecution) -> Dispatched {
    let expr = step.condition.as_deref().unwrap_or("false");
    let ctx = ConditionContext::for_step(execution, step);
    let result = evaluate_condition(expr, &ctx);
    debug!(step_id = %step.id, expr, result, "Condition evaluated");
    Dispatched::Done {
        output: json!({ "condition_result": result, "expression": expr }),
        retries: 0,
    }
}

fn task_id(execution: &WorkflowExecution, step: &WorkflowStep) -> String {
    format!("{}:{}", execution.execution_id, step.id)
}

fn step_event(
    execution: &WorkflowExecution,
    step: &WorkflowStep,
    event_type: EventType,
) -> WorkflowEvent {
    WorkflowEvent::new(event_type, execution.execution_id.to_string())
        .with_workflow(&execution.workflow_id)
        .with_step(&step.id)
        .with_agent(step.agent_id())
}
