use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use weft_core::definition::{FailurePolicy, StepKind, WorkflowDefinition, WorkflowPhase, WorkflowStep};
use weft_core::error::{Result, WeftError};
use weft_core::traits::ApprovalDecision;
use weft_core::types::{
    AgentState, EventStatus, EventType, ExecutionStatus, HandoffStatus, StateData, StepExecution,
    StepStatus, WorkflowEvent, WorkflowExecution,
};
use weft_store::SaveOptions;

use super::{ExecutionControl, Services, StepExecutor, StepOutcome, StepPolicy};
use crate::condition::ConditionContext;
use crate::handoff::{handoff_due, HandoffGenerator};
use crate::validator::WorkflowValidator;

/// How the step loop ended.
enum RunEnd {
    Completed,
    Failed(String),
    Paused(String),
    Cancelled,
}

/// Drives a workflow definition through its phases and steps.
///
/// The execution snapshot is saved under `workflow:<execution_id>` after
/// every transition, so an interrupted or paused execution can be picked
/// up again with [`resume`](Self::resume).
pub struct WorkflowExecutor {
    services: Arc<Services>,
    validator: WorkflowValidator,
    steps: StepExecutor,
    handoffs: HandoffGenerator,
}

impl WorkflowExecutor {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            validator: WorkflowValidator::new(services.discovery.clone()),
            steps: StepExecutor::new(services.clone()),
            handoffs: HandoffGenerator::new(services.discovery.clone(), services.handoffs.clone()),
            services,
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
    ) -> Result<WorkflowExecution> {
        self.execute_with_control(definition, input, ExecutionControl::new())
            .await
    }

    /// Run `definition` to completion, failure, pause, or cancellation.
    ///
    /// Step failures are reported through the returned execution's status;
    /// `Err` means the definition was invalid or a snapshot could not be saved.
    pub async fn execute_with_control(
        &self,
        definition: &WorkflowDefinition,
        input: serde_json::Value,
        control: ExecutionControl,
    ) -> Result<WorkflowExecution> {
        self.ensure_valid(definition)?;

        let mut execution = WorkflowExecution::new(definition, input);
        let mut state = AgentState::for_execution(&execution);
        execution.transition_to(ExecutionStatus::Running)?;
        self.persist(&mut state, &execution)?;

        info!(
            execution_id = %execution.execution_id,
            workflow_id = %definition.id,
            version = %definition.version(),
            "Workflow started"
        );
        self.services.audit.log_info(
            "workflow_started",
            &json!({
                "execution_id": execution.execution_id.as_str(),
                "workflow_id": definition.id,
            }),
        );
        self.services.emit(
            workflow_event(&execution, EventType::WorkflowStarted)
                .with_status(EventStatus::Started)
                .with_payload(json!({ "version": definition.version() })),
        );

        self.drive(definition, &mut execution, &mut state, &control, None)
            .await?;
        Ok(execution)
    }

    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
    ) -> Result<WorkflowExecution> {
        self.resume_with_decision(definition, execution_id, None, ExecutionControl::new())
            .await
    }

    /// Continue a paused or interrupted execution from its latest snapshot.
    ///
    /// `decision` answers the MANUAL step the execution is waiting on.
    pub async fn resume_with_decision(
        &self,
        definition: &WorkflowDefinition,
        execution_id: &str,
        decision: Option<ApprovalDecision>,
        control: ExecutionControl,
    ) -> Result<WorkflowExecution> {
        self.ensure_valid(definition)?;

        let state_id = format!("workflow:{}", execution_id);
        let mut state = self
            .services
            .state
            .load_state(&state_id, None)?
            .ok_or_else(|| WeftError::NotFound(state_id.clone()))?;
        let mut execution = state.execution().cloned().ok_or_else(|| {
            WeftError::InvalidStatus(format!("state {} does not hold a workflow execution", state_id))
        })?;

        if execution.workflow_id != definition.id {
            return Err(WeftError::InvalidStatus(format!(
                "execution {} belongs to workflow '{}', not '{}'",
                execution_id, execution.workflow_id, definition.id
            )));
        }
        if execution.status.is_terminal() {
            return Err(WeftError::InvalidStatus(format!(
                "execution {} is already {}",
                execution_id, execution.status
            )));
        }

        match execution.status {
            ExecutionStatus::Paused => {
                execution.transition_to(ExecutionStatus::Running)?;
                self.persist(&mut state, &execution)?;
                info!(execution_id, "Workflow resumed");
                self.services.emit(
                    workflow_event(&execution, EventType::WorkflowResumed)
                        .with_status(EventStatus::Started),
                );
            }
            ExecutionStatus::Pending => {
                execution.transition_to(ExecutionStatus::Running)?;
                self.persist(&mut state, &execution)?;
                self.services.emit(
                    workflow_event(&execution, EventType::WorkflowStarted)
                        .with_status(EventStatus::Started),
                );
            }
            _ => {
                warn!(execution_id, "Resuming an execution that was interrupted while running");
            }
        }

        self.drive(definition, &mut execution, &mut state, &control, decision)
            .await?;
        Ok(execution)
    }

    /// Latest snapshot of an execution.
    pub fn load_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        let state = self
            .services
            .state
            .load_state(&format!("workflow:{}", execution_id), None)?;
        Ok(state.and_then(|s| s.execution().cloned()))
    }

    fn ensure_valid(&self, definition: &WorkflowDefinition) -> Result<()> {
        let errors = self.validator.validate(definition);
        if errors.is_empty() {
            return Ok(());
        }
        warn!(workflow_id = %definition.id, errors = errors.len(), "Workflow definition rejected");
        self.services.audit.log_warning(
            "workflow_rejected",
            &json!({ "workflow_id": definition.id, "errors": errors }),
        );
        Err(WeftError::Validation(errors))
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        state: &mut AgentState,
        control: &ExecutionControl,
        decision: Option<ApprovalDecision>,
    ) -> Result<()> {
        let end = self
            .run_phases(definition, execution, state, control, decision)
            .await?;
        self.finish(execution, state, end)
    }

    async fn run_phases(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        state: &mut AgentState,
        control: &ExecutionControl,
        mut decision: Option<ApprovalDecision>,
    ) -> Result<RunEnd> {
        let policy = StepPolicy::for_definition(
            definition,
            &self.services.retry,
            &self.services.executor,
        );

        for phase in &definition.phases {
            let status = phase_status(execution, &phase.id)?;
            if status == StepStatus::Completed {
                continue;
            }

            execution.current_phase_id = Some(phase.id.clone());
            if status == StepStatus::Pending {
                if let Some(p) = execution.phase_mut(&phase.id) {
                    p.start();
                }
                self.persist(state, execution)?;
                debug!(phase_id = %phase.id, "Phase started");
                self.services.emit(
                    workflow_event(execution, EventType::PhaseStarted)
                        .with_status(EventStatus::Started)
                        .with_payload(json!({ "phase_id": phase.id })),
                );
            }

            for step in &phase.steps {
                let step_status = execution
                    .step(&step.id)
                    .map(|s| s.status)
                    .ok_or_else(|| missing_step(execution, &step.id))?;
                if matches!(step_status, StepStatus::Completed | StepStatus::Failed) {
                    continue;
                }

                if control.is_cancelled() {
                    return Ok(RunEnd::Cancelled);
                }
                if control.take_pause() {
                    return Ok(RunEnd::Paused(step.id.clone()));
                }

                execution.current_step_id = Some(step.id.clone());
                if let Some(s) = execution.step_mut(&step.id) {
                    s.start();
                }
                self.update_incoming(execution, step, HandoffStatus::InProgress);
                self.persist(state, execution)?;

                let step_decision = if step.kind == StepKind::Manual {
                    decision.take()
                } else {
                    None
                };
                let record = match self
                    .steps
                    .execute_step(step, execution, &policy, step_decision)
                    .await
                {
                    StepOutcome::Finished(record) => record,
                    StepOutcome::Paused(record) => {
                        store_step(execution, record)?;
                        return Ok(RunEnd::Paused(step.id.clone()));
                    }
                };

                let succeeded = record.succeeded();
                let error = record.error.clone();
                store_step(execution, record)?;
                self.update_incoming(
                    execution,
                    step,
                    if succeeded {
                        HandoffStatus::Complete
                    } else {
                        HandoffStatus::Failed
                    },
                );
                self.persist(state, execution)?;
                self.create_handoff(definition, execution, step);

                if succeeded {
                    continue;
                }
                let halt = step.mandatory
                    || definition.error_handling.on_failure == FailurePolicy::HaltOnAny;
                if halt {
                    let message = format!(
                        "Step '{}' failed: {}",
                        step.id,
                        error.unwrap_or_else(|| "unknown error".into())
                    );
                    self.finish_phase(execution, state, phase, StepStatus::Failed)?;
                    return Ok(RunEnd::Failed(message));
                }
                warn!(step_id = %step.id, "Optional step failed, continuing");
            }

            self.finish_phase(execution, state, phase, StepStatus::Completed)?;
        }

        Ok(RunEnd::Completed)
    }

    fn finish_phase(
        &self,
        execution: &mut WorkflowExecution,
        state: &mut AgentState,
        phase: &WorkflowPhase,
        status: StepStatus,
    ) -> Result<()> {
        if let Some(p) = execution.phase_mut(&phase.id) {
            p.finish(status);
        }
        self.persist(state, execution)?;

        let (event_type, event_status) = if status == StepStatus::Completed {
            (EventType::PhaseCompleted, EventStatus::Success)
        } else {
            (EventType::PhaseFailed, EventStatus::Failure)
        };
        debug!(phase_id = %phase.id, status = %status, "Phase finished");
        self.services.emit(
            workflow_event(execution, event_type)
                .with_status(event_status)
                .with_payload(json!({ "phase_id": phase.id })),
        );
        Ok(())
    }

    fn finish(
        &self,
        execution: &mut WorkflowExecution,
        state: &mut AgentState,
        end: RunEnd,
    ) -> Result<()> {
        let id = execution.execution_id.to_string();
        match end {
            RunEnd::Completed => {
                execution.current_step_id = None;
                execution.transition_to(ExecutionStatus::Completed)?;
                self.persist(state, execution)?;
                info!(
                    execution_id = %id,
                    duration_ms = execution.duration_ms().unwrap_or(0),
                    "Workflow completed"
                );
                self.services.audit.log_info(
                    "workflow_completed",
                    &json!({ "execution_id": id, "workflow_id": execution.workflow_id }),
                );
                self.services.emit(
                    workflow_event(execution, EventType::WorkflowCompleted)
                        .with_status(EventStatus::Success)
                        .with_payload(json!({ "duration_ms": execution.duration_ms() })),
                );
            }
            RunEnd::Failed(message) => {
                execution.error = Some(message.clone());
                execution.transition_to(ExecutionStatus::Failed)?;
                self.persist(state, execution)?;
                error!(execution_id = %id, error = %message, "Workflow failed");
                self.services.audit.log_error(
                    "workflow_failed",
                    &json!({
                        "execution_id": id,
                        "workflow_id": execution.workflow_id,
                        "error": message,
                    }),
                );
                self.services.emit(
                    workflow_event(execution, EventType::WorkflowFailed)
                        .with_status(EventStatus::Failure)
                        .with_payload(json!({ "error": message })),
                );
            }
            RunEnd::Paused(step_id) => {
                execution.transition_to(ExecutionStatus::Paused)?;
                self.persist(state, execution)?;
                info!(execution_id = %id, step_id = %step_id, "Workflow paused");
                self.services.emit(
                    workflow_event(execution, EventType::WorkflowPaused)
                        .with_step(&step_id)
                        .with_status(EventStatus::Info),
                );
            }
            RunEnd::Cancelled => {
                execution.error = Some(WeftError::Cancelled.to_string());
                execution.transition_to(ExecutionStatus::Cancelled)?;
                self.persist(state, execution)?;
                warn!(execution_id = %id, "Workflow cancelled");
                self.services.audit.log_warning(
                    "workflow_cancelled",
                    &json!({ "execution_id": id, "workflow_id": execution.workflow_id }),
                );
                self.services.emit(
                    workflow_event(execution, EventType::WorkflowCancelled)
                        .with_status(EventStatus::Info),
                );
            }
        }
        Ok(())
    }

    fn persist(&self, state: &mut AgentState, execution: &WorkflowExecution) -> Result<()> {
        state.data = StateData::Workflow(execution.clone());
        self.services.state.save_state(state, SaveOptions::default())?;
        Ok(())
    }

    fn create_handoff(
        &self,
        definition: &WorkflowDefinition,
        execution: &WorkflowExecution,
        step: &WorkflowStep,
    ) {
        let Some(record) = execution.step(&step.id) else {
            return;
        };
        let ctx = ConditionContext::for_step(execution, step);
        if !handoff_due(step, record, &ctx) {
            return;
        }

        let saved = self
            .handoffs
            .generate_handoff(record, step, execution)
            .and_then(|mut handoff| {
                self.handoffs.resolve_step_target(&mut handoff, definition);
                self.handoffs.save_handoff(&handoff)?;
                Ok(handoff)
            });

        match saved {
            Ok(handoff) => {
                self.services.emit(
                    workflow_event(execution, EventType::HandoffCreated)
                        .with_step(&step.id)
                        .with_agent(Some(handoff.to_agent.as_str()))
                        .with_status(EventStatus::Info)
                        .with_payload(json!({
                            "handoff_id": handoff.handoff_id,
                            "from_agent": handoff.from_agent,
                            "to_agent": handoff.to_agent,
                            "to_step": handoff.to_step,
                            "kind": handoff.kind,
                        })),
                );
            }
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Handoff not created");
                self.services.audit.log_warning(
                    "handoff_failed",
                    &json!({
                        "execution_id": execution.execution_id.as_str(),
                        "step_id": step.id,
                        "error": e.to_string(),
                    }),
                );
            }
        }
    }

    /// Move handoffs addressed to `step` in this execution to `status`.
    fn update_incoming(&self, execution: &WorkflowExecution, step: &WorkflowStep, status: HandoffStatus) {
        let registry = self.handoffs.registry();
        let records = match registry.get_handoffs(Some(execution.execution_id.as_str()), None) {
            Ok(records) => records,
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Could not load incoming handoffs");
                return;
            }
        };

        for record in records
            .iter()
            .filter(|h| h.to_step.as_deref() == Some(step.id.as_str()))
        {
            let applies = match status {
                HandoffStatus::InProgress => {
                    matches!(record.status, HandoffStatus::Pending | HandoffStatus::Accepted)
                }
                _ => record.status == HandoffStatus::InProgress,
            };
            if !applies {
                continue;
            }
            if let Err(e) = registry.update_handoff_status(&record.handoff_id, status.as_str()) {
                warn!(handoff_id = %record.handoff_id, error = %e, "Handoff status update failed");
            }
        }
    }
}

fn workflow_event(execution: &WorkflowExecution, event_type: EventType) -> WorkflowEvent {
    WorkflowEvent::new(event_type, execution.execution_id.to_string())
        .with_workflow(&execution.workflow_id)
}

fn phase_status(execution: &WorkflowExecution, phase_id: &str) -> Result<StepStatus> {
    execution
        .phases
        .iter()
        .find(|p| p.phase_id == phase_id)
        .map(|p| p.status)
        .ok_or_else(|| {
            WeftError::InvalidStatus(format!(
                "phase '{}' is not part of execution {}",
                phase_id, execution.execution_id
            ))
        })
}

fn missing_step(execution: &WorkflowExecution, step_id: &str) -> WeftError {
    WeftError::InvalidStatus(format!(
        "step '{}' is not part of execution {}",
        step_id, execution.execution_id
    ))
}

fn store_step(execution: &mut WorkflowExecution, record: StepExecution) -> Result<()> {
    let err = missing_step(execution, &record.step_id);
    match execution.step_mut(&record.step_id) {
        Some(slot) => {
            *slot = record;
            Ok(())
        }
        None => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use weft_core::definition::HandoffKind;
    use weft_core::traits::StaticAgentDirectory;
    use weft_store::EventQuery;
    use weft_test_utils::{
        agent_directory, research_pipeline, test_config, MockAgentExecutor, MockApprovalGate,
    };

    fn executor_with(
        agents: Arc<MockAgentExecutor>,
        configure: impl FnOnce(Services) -> Services,
    ) -> WorkflowExecutor {
        let dir = std::env::temp_dir().join(format!("weft_wf_{}", uuid::Uuid::new_v4()));
        let config = test_config(&dir);
        let services =
            Services::in_memory(&config, agents, Arc::new(agent_directory())).unwrap();
        WorkflowExecutor::new(Arc::new(configure(services)))
    }

    fn executor(agents: Arc<MockAgentExecutor>) -> WorkflowExecutor {
        executor_with(agents, |s| s)
    }

    fn event_types(executor: &WorkflowExecutor, execution: &WorkflowExecution) -> Vec<EventType> {
        executor
            .services()
            .events
            .events_for(execution.execution_id.as_str())
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_pipeline_completes_with_handoff() {
        let agents = Arc::new(
            MockAgentExecutor::new()
                .with_output("researcher", json!({ "summary": "three sources", "files": ["notes.md"] })),
        );
        let ex = executor(agents.clone());

        let execution = ex.execute(&research_pipeline(), json!({ "topic": "rust" })).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.completed_at.is_some());
        assert!(execution.phases.iter().all(|p| p.status == StepStatus::Completed));

        // The draft step received the research handoff
        let draft_call = agents.calls().into_iter().find(|c| c.agent_id == "writer").unwrap();
        assert_eq!(draft_call.input["handoffs"][0]["work_summary"], "three sources");
        assert_eq!(draft_call.input["previous_outputs"]["research"]["summary"], "three sources");

        let handoffs = ex
            .services()
            .handoffs
            .get_handoffs(Some(execution.execution_id.as_str()), None)
            .unwrap();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].to_agent, "writer");
        assert_eq!(handoffs[0].to_step.as_deref(), Some("draft"));
        assert_eq!(handoffs[0].deliverables, vec!["notes.md"]);
        assert_eq!(handoffs[0].status, HandoffStatus::Complete);

        let types = event_types(&ex, &execution);
        assert_eq!(types.first(), Some(&EventType::WorkflowStarted));
        assert_eq!(types.last(), Some(&EventType::WorkflowCompleted));
        assert!(types.contains(&EventType::HandoffCreated));
        assert_eq!(types.iter().filter(|t| **t == EventType::StepCompleted).count(), 3);

        let loaded = ex.load_execution(execution.execution_id.as_str()).unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_mandatory_failure_halts() {
        let agents = Arc::new(MockAgentExecutor::new().with_error("writer", "invalid input"));
        let ex = executor(agents.clone());

        let execution = ex.execute(&research_pipeline(), json!({})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("draft"));
        assert_eq!(execution.step("review").unwrap().status, StepStatus::Pending);
        assert_eq!(agents.call_count("reviewer"), 0);
        assert_eq!(execution.phases[1].status, StepStatus::Failed);

        let types = event_types(&ex, &execution);
        assert!(types.contains(&EventType::PhaseFailed));
        assert_eq!(types.last(), Some(&EventType::WorkflowFailed));

        let replay = ex
            .services()
            .events
            .replay(execution.execution_id.as_str())
            .unwrap();
        assert_eq!(replay.status, Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn test_optional_failure_continues_unless_halt_on_any() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("lint", 1, "reviewer").optional())
                .with_step(WorkflowStep::agent("draft", 2, "writer")),
        );
        let agents = Arc::new(MockAgentExecutor::new().with_error("reviewer", "bad request"));
        let ex = executor(agents.clone());

        let execution = ex.execute(&def, json!({})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step("lint").unwrap().status, StepStatus::Failed);
        assert_eq!(execution.step("draft").unwrap().status, StepStatus::Completed);

        let strict = def.with_failure_policy(FailurePolicy::HaltOnAny);
        let execution = ex.execute(&strict, json!({})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step("draft").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let ex = executor(Arc::new(MockAgentExecutor::new()));
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(WorkflowStep::agent("s", 1, "ghost")),
        );
        let err = ex.execute(&def, json!({})).await.unwrap_err();
        assert!(matches!(err, WeftError::Validation(ref e) if e[0].contains("ghost")));
        assert!(ex.services().state.list_states(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_error_handoff() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(
                WorkflowStep::agent("draft", 1, "writer")
                    .optional()
                    .with_handoff("reviewer", HandoffKind::OnError),
            ),
        );
        let ex = executor(Arc::new(MockAgentExecutor::new().with_error("writer", "not found")));
        let execution = ex.execute(&def, json!({})).await.unwrap();

        let handoffs = ex.services().handoffs.get_handoffs(None, None).unwrap();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(handoffs[0].to_agent, "reviewer");
        assert_eq!(handoffs[0].to_step, None);
        assert_eq!(handoffs[0].execution_id, execution.execution_id.as_str());
        assert!(handoffs[0].work_summary.contains("not found"));
    }

    #[tokio::test]
    async fn test_conditional_handoff_follows_condition_step() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(
                    WorkflowStep::condition("gate", 1, r#"priority == "high""#)
                        .with_handoff("writer", HandoffKind::Conditional),
                )
                .with_step(WorkflowStep::agent("draft", 2, "writer")),
        );
        let ex = executor(Arc::new(MockAgentExecutor::new()));

        ex.execute(&def, json!({ "priority": "low" })).await.unwrap();
        assert!(ex.services().handoffs.get_handoffs(None, None).unwrap().is_empty());

        ex.execute(&def, json!({ "priority": "high" })).await.unwrap();
        assert_eq!(ex.services().handoffs.get_handoffs(None, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_step_pauses_and_resumes() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("draft", 1, "writer"))
                .with_step(WorkflowStep::manual("signoff", 2))
                .with_step(WorkflowStep::agent("publish", 3, "reviewer")),
        );
        let agents = Arc::new(MockAgentExecutor::new());
        let ex = executor(agents.clone());

        let paused = ex.execute(&def, json!({})).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.current_step_id.as_deref(), Some("signoff"));
        assert_eq!(paused.step("signoff").unwrap().status, StepStatus::Pending);
        assert_eq!(agents.call_count("reviewer"), 0);

        let id = paused.execution_id.to_string();
        let stored = ex.load_execution(&id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Paused);
        let replay = ex.services().events.replay(&id).unwrap();
        assert_eq!(replay.status, Some(ExecutionStatus::Paused));
        let signoff = replay.steps.iter().find(|s| s.step_id == "signoff").unwrap();
        assert_eq!(signoff.status, StepStatus::Pending);

        let resumed = ex
            .resume_with_decision(
                &def,
                &id,
                Some(ApprovalDecision::Approved { output: json!({ "approved_by": "ops" }) }),
                ExecutionControl::new(),
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.step("signoff").unwrap().output["approved_by"], "ops");
        assert_eq!(agents.call_count("writer"), 1);
        assert_eq!(agents.call_count("reviewer"), 1);

        let types = event_types(&ex, &resumed);
        assert!(types.contains(&EventType::WorkflowPaused));
        assert!(types.contains(&EventType::WorkflowResumed));

        let err = ex.resume(&def, &id).await.unwrap_err();
        assert!(matches!(err, WeftError::InvalidStatus(_)));
    }

    #[tokio::test]
    async fn test_gate_approval_runs_through() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(WorkflowStep::manual("signoff", 1)),
        );
        let gate = Arc::new(MockApprovalGate::approve_all(json!({ "ok": true })));
        let g = gate.clone();
        let ex = executor_with(Arc::new(MockAgentExecutor::new()), move |s| s.with_approvals(g));

        let execution = ex.execute(&def, json!({})).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(gate.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_first_step() {
        let ex = executor(Arc::new(MockAgentExecutor::new()));
        let control = ExecutionControl::new();
        control.cancel();

        let execution = ex
            .execute_with_control(&research_pipeline(), json!({}), control)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.step("research").unwrap().status, StepStatus::Pending);
        assert_eq!(
            event_types(&ex, &execution).last(),
            Some(&EventType::WorkflowCancelled)
        );
    }

    #[tokio::test]
    async fn test_pause_request_then_resume() {
        let ex = executor(Arc::new(MockAgentExecutor::new()));
        let control = ExecutionControl::new();
        control.pause();

        let paused = ex
            .execute_with_control(&research_pipeline(), json!({}), control)
            .await
            .unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);

        let resumed = ex
            .resume(&research_pipeline(), paused.execution_id.as_str())
            .await
            .unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_after_interruption_skips_finished_steps() {
        let agents = Arc::new(MockAgentExecutor::new());
        let ex = executor(agents.clone());
        let def = research_pipeline();

        // Simulate a crash after "research" finished: a running snapshot.
        let mut execution = WorkflowExecution::new(&def, json!({}));
        execution.transition_to(ExecutionStatus::Running).unwrap();
        let step = execution.step_mut("research").unwrap();
        step.start();
        step.complete(json!({ "summary": "done earlier" }));
        execution.phases[0].finish(StepStatus::Completed);
        let mut state = AgentState::for_execution(&execution);
        ex.services().state.save_state(&mut state, SaveOptions::default()).unwrap();

        let resumed = ex.resume(&def, execution.execution_id.as_str()).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(agents.call_count("researcher"), 0);
        assert_eq!(agents.call_count("writer"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_saved_after_every_transition() {
        let ex = executor(Arc::new(MockAgentExecutor::new()));
        let execution = ex.execute(&research_pipeline(), json!({})).await.unwrap();

        let versions = ex.services().state.list_versions(&execution.state_id()).unwrap();
        // running, 2 phase starts, 3 step starts, 3 step ends, 2 phase ends, completed
        assert_eq!(versions.len(), 12);
        let first = ex
            .services()
            .state
            .load_state(&execution.state_id(), Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(first.execution().unwrap().status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_resume_rejects_other_workflow() {
        let ex = executor(Arc::new(MockAgentExecutor::new()));
        let control = ExecutionControl::new();
        control.pause();
        let paused = ex
            .execute_with_control(&research_pipeline(), json!({}), control)
            .await
            .unwrap();

        let other = WorkflowDefinition::new("other", "O", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(WorkflowStep::manual("m", 1)),
        );
        let err = ex.resume(&other, paused.execution_id.as_str()).await.unwrap_err();
        assert!(matches!(err, WeftError::InvalidStatus(_)));

        let err = ex.resume(&research_pipeline(), "missing").await.unwrap_err();
        assert!(matches!(err, WeftError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_step_events_replay() {
        let agents = Arc::new(MockAgentExecutor::new());
        agents.push_error("writer", "timed out waiting for model");
        let ex = executor(agents);
        let execution = ex.execute(&research_pipeline(), json!({})).await.unwrap();

        let mut query = EventQuery::for_correlation(execution.execution_id.to_string());
        query.event_type = Some(EventType::StepCompleted);
        let completed = ex.services().events.query(&query).unwrap();
        assert_eq!(completed.len(), 3);
        let draft = completed.iter().find(|e| e.step_id.as_deref() == Some("draft")).unwrap();
        assert_eq!(draft.payload["retry_count"], Value::from(1));

        let replay = ex.services().events.replay(execution.execution_id.as_str()).unwrap();
        assert_eq!(replay.status, Some(ExecutionStatus::Completed));
        assert_eq!(replay.steps.len(), 3);
        assert!(replay.steps.iter().all(|s| s.status == StepStatus::Completed));
    }

    #[test]
    fn test_discovery_shared_with_validator() {
        let dir = std::env::temp_dir().join(format!("weft_wf_{}", uuid::Uuid::new_v4()));
        let config = test_config(&dir);
        let services = Services::in_memory(
            &config,
            Arc::new(MockAgentExecutor::new()),
            Arc::new(StaticAgentDirectory::new(["solo"])),
        )
        .unwrap();
        let ex = WorkflowExecutor::new(Arc::new(services));
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(WorkflowStep::agent("s", 1, "solo")),
        );
        assert!(ex.ensure_valid(&def).is_ok());
    }
}
