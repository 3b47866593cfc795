use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use weft_core::definition::{HandoffKind, WorkflowDefinition, WorkflowStep};
use weft_core::error::{Result, WeftError};
use weft_core::traits::AgentDiscovery;
use weft_core::types::{HandoffRecord, HandoffStatus, StepExecution, WorkflowExecution};
use weft_store::HandoffRegistry;

const MAX_SUMMARY_CHARS: usize = 500;

const SUMMARY_KEYS: &[&str] = &["summary", "work_summary", "output", "result"];
const DELIVERABLE_KEYS: &[&str] = &["deliverables", "artifacts", "files"];

/// Builds handoff records from finished steps and persists the valid ones.
pub struct HandoffGenerator {
    agents: Arc<dyn AgentDiscovery>,
    registry: Arc<HandoffRegistry>,
}

impl HandoffGenerator {
    pub fn new(agents: Arc<dyn AgentDiscovery>, registry: Arc<HandoffRegistry>) -> Self {
        Self { agents, registry }
    }

    pub fn registry(&self) -> &Arc<HandoffRegistry> {
        &self.registry
    }

    /// Build a pending handoff for a finished step.
    pub fn generate_handoff(
        &self,
        step_exec: &StepExecution,
        step_def: &WorkflowStep,
        execution: &WorkflowExecution,
    ) -> Result<HandoffRecord> {
        let to = step_def
            .handoff_to
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| WeftError::NoHandoffTarget(step_def.id.clone()))?;

        let from_agent = step_exec
            .agent_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", step_def.kind, step_def.id));

        let record = HandoffRecord {
            handoff_id: Uuid::new_v4().to_string(),
            from_agent,
            to_agent: to.to_string(),
            to_step: None,
            execution_id: execution.execution_id.to_string(),
            workflow_id: execution.workflow_id.clone(),
            step_id: step_def.id.clone(),
            timestamp: Utc::now(),
            kind: step_def.handoff_kind,
            status: HandoffStatus::Pending,
            work_summary: extract_summary(step_exec),
            deliverables: extract_deliverables(&step_exec.output),
            context: json!({
                "step_status": step_exec.status,
                "step_output": step_exec.output,
                "error": step_exec.error,
                "duration_ms": step_exec.duration_ms,
                "retry_count": step_exec.retry_count,
            }),
        };

        debug!(
            handoff_id = %record.handoff_id,
            step_id = %record.step_id,
            to = %record.to_agent,
            "Handoff generated"
        );
        Ok(record)
    }

    /// When the target names a step, point the handoff at that step's agent.
    ///
    /// Targets that are not step ids are left untouched. A target step
    /// without an agent (script, manual, ...) keeps its id as `to_agent`.
    pub fn resolve_step_target(&self, record: &mut HandoffRecord, definition: &WorkflowDefinition) {
        let Some(step) = definition.find_step(&record.to_agent) else {
            return;
        };
        record.to_step = Some(step.id.clone());
        if let Some(agent) = step.agent_id() {
            record.to_agent = agent.to_string();
        }
    }

    /// Problems with `record`. Empty means the handoff can be saved.
    pub fn validate_handoff(&self, record: &HandoffRecord) -> Vec<String> {
        let mut errors = Vec::new();

        if record.handoff_id.trim().is_empty() {
            errors.push("Handoff id is required".to_string());
        }
        if record.from_agent.trim().is_empty() {
            errors.push("Handoff source is required".to_string());
        }

        let targets_plain_step = record.to_step.as_deref() == Some(record.to_agent.as_str());
        if record.to_agent.trim().is_empty() {
            errors.push("Handoff target is required".to_string());
        } else if !targets_plain_step && !self.agents.agent_exists(&record.to_agent) {
            errors.push(format!("Target agent '{}' does not exist", record.to_agent));
        }

        if record.kind == HandoffKind::Never {
            errors.push(format!(
                "Handoff kind '{}' does not produce handoffs",
                record.kind
            ));
        }
        errors
    }

    /// Validate and register `record`. Returns the handoff id.
    pub fn save_handoff(&self, record: &HandoffRecord) -> Result<String> {
        let errors = self.validate_handoff(record);
        if !errors.is_empty() {
            return Err(WeftError::HandoffValidation(errors));
        }
        self.registry
            .register_handoff(record, &record.execution_id, &record.workflow_id)?;
        info!(
            handoff_id = %record.handoff_id,
            from = %record.from_agent,
            to = %record.to_agent,
            "Handoff saved"
        );
        Ok(record.handoff_id.clone())
    }
}

fn extract_summary(step_exec: &StepExecution) -> String {
    let output = &step_exec.output;
    let picked = SUMMARY_KEYS.iter().find_map(|k| output.get(*k));

    let text = match picked {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match output {
            Value::Null => step_exec
                .error
                .clone()
                .unwrap_or_else(|| format!("Step {} {}", step_exec.step_id, step_exec.status)),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    };
    truncate(&text, MAX_SUMMARY_CHARS)
}

fn extract_deliverables(output: &Value) -> Vec<String> {
    let Some(found) = DELIVERABLE_KEYS.iter().find_map(|k| output.get(*k)) else {
        return Vec::new();
    };

    let items: Vec<&Value> = match found {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj
                .get("name")
                .or_else(|| obj.get("path"))
                .and_then(|v| v.as_str())
                .map(String::from),
            _ => None,
        })
        .collect()
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::definition::WorkflowPhase;
    use weft_core::traits::StaticAgentDirectory;

    fn generator() -> HandoffGenerator {
        HandoffGenerator::new(
            Arc::new(StaticAgentDirectory::new(["researcher", "writer"])),
            Arc::new(HandoffRegistry::in_memory().unwrap()),
        )
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("research", 1, "researcher").with_handoff("draft", HandoffKind::Always))
                .with_step(WorkflowStep::agent("draft", 2, "writer"))
                .with_step(WorkflowStep::script("publish", 3, "./publish.sh")),
        )
    }

    fn completed(def: &WorkflowDefinition, id: &str, output: Value) -> StepExecution {
        let mut exec = StepExecution::new(def.find_step(id).unwrap());
        exec.start();
        exec.complete(output);
        exec
    }

    #[test]
    fn test_generate_extracts_summary_and_deliverables() {
        let def = definition();
        let execution = WorkflowExecution::new(&def, json!({}));
        let step_exec = completed(
            &def,
            "research",
            json!({
                "summary": "Found three sources",
                "deliverables": ["notes.md", { "name": "sources.json" }, { "path": "/tmp/raw.txt" }, 7],
            }),
        );

        let record = generator()
            .generate_handoff(&step_exec, def.find_step("research").unwrap(), &execution)
            .unwrap();
        assert_eq!(record.from_agent, "researcher");
        assert_eq!(record.to_agent, "draft");
        assert_eq!(record.status, HandoffStatus::Pending);
        assert_eq!(record.work_summary, "Found three sources");
        assert_eq!(record.deliverables, vec!["notes.md", "sources.json", "/tmp/raw.txt"]);
        assert_eq!(record.execution_id, execution.execution_id.to_string());
        assert!(Uuid::parse_str(&record.handoff_id).is_ok());
    }

    #[test]
    fn test_summary_falls_back_to_compact_json_and_truncates() {
        let def = definition();
        let execution = WorkflowExecution::new(&def, json!({}));
        let long = "x".repeat(2000);
        let step_exec = completed(&def, "research", json!({ "notes": long }));

        let record = generator()
            .generate_handoff(&step_exec, def.find_step("research").unwrap(), &execution)
            .unwrap();
        assert_eq!(record.work_summary.chars().count(), 500);
        assert!(record.work_summary.starts_with("{\"notes\":\"xxx"));
    }

    #[test]
    fn test_no_target_is_an_error() {
        let def = definition();
        let execution = WorkflowExecution::new(&def, json!({}));
        let step_exec = completed(&def, "draft", json!({}));
        let err = generator()
            .generate_handoff(&step_exec, def.find_step("draft").unwrap(), &execution)
            .unwrap_err();
        assert!(matches!(err, WeftError::NoHandoffTarget(ref s) if s == "draft"));
    }

    #[test]
    fn test_resolve_and_save() {
        let def = definition();
        let gen = generator();
        let execution = WorkflowExecution::new(&def, json!({}));
        let step_exec = completed(&def, "research", json!({ "result": "ok" }));

        let mut record = gen
            .generate_handoff(&step_exec, def.find_step("research").unwrap(), &execution)
            .unwrap();
        // "draft" is a step id, not an agent
        assert!(!gen.validate_handoff(&record).is_empty());

        gen.resolve_step_target(&mut record, &def);
        assert_eq!(record.to_agent, "writer");
        assert_eq!(record.to_step.as_deref(), Some("draft"));
        assert!(gen.validate_handoff(&record).is_empty());

        let id = gen.save_handoff(&record).unwrap();
        let stored = gen.registry().get_handoff(&id).unwrap().unwrap();
        assert_eq!(stored.to_agent, "writer");
    }

    #[test]
    fn test_handoff_to_script_step_is_valid() {
        let def = definition();
        let gen = generator();
        let mut record = HandoffRecord {
            handoff_id: Uuid::new_v4().to_string(),
            from_agent: "writer".into(),
            to_agent: "publish".into(),
            to_step: None,
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
            step_id: "draft".into(),
            timestamp: Utc::now(),
            kind: HandoffKind::Always,
            status: HandoffStatus::Pending,
            work_summary: "drafted".into(),
            deliverables: vec![],
            context: Value::Null,
        };
        gen.resolve_step_target(&mut record, &def);
        assert_eq!(record.to_agent, "publish");
        assert!(gen.validate_handoff(&record).is_empty());
    }

    #[test]
    fn test_invalid_handoff_is_not_saved() {
        let gen = generator();
        let record = HandoffRecord {
            handoff_id: "h1".into(),
            from_agent: "writer".into(),
            to_agent: "ghost".into(),
            to_step: None,
            execution_id: "e1".into(),
            workflow_id: "wf".into(),
            step_id: "draft".into(),
            timestamp: Utc::now(),
            kind: HandoffKind::Always,
            status: HandoffStatus::Pending,
            work_summary: String::new(),
            deliverables: vec![],
            context: Value::Null,
        };
        let err = gen.save_handoff(&record).unwrap_err();
        assert!(matches!(err, WeftError::HandoffValidation(ref e) if e[0].contains("ghost")));
        assert!(gen.registry().get_handoff("h1").unwrap().is_none());
    }

    #[test]
    fn test_failed_step_summary_uses_error() {
        let def = definition();
        let mut exec = StepExecution::new(def.find_step("research").unwrap());
        exec.start();
        exec.fail("agent crashed");
        assert_eq!(extract_summary(&exec), "agent crashed");
    }
}
