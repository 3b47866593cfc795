//! Static checks over workflow definitions.
//!
//! Every check runs independently and all problems are reported together,
//! so one pass over a definition shows everything that needs fixing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use weft_core::definition::{StepKind, WorkflowDefinition, WorkflowPhase, WorkflowStep};
use weft_core::traits::AgentDiscovery;

pub struct WorkflowValidator {
    agents: Arc<dyn AgentDiscovery>,
}

impl WorkflowValidator {
    pub fn new(agents: Arc<dyn AgentDiscovery>) -> Self {
        Self { agents }
    }

    /// All problems found in `definition`. Empty means valid.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Vec<String> {
        let mut errors = Vec::new();
        let known_agents = self.agents.get_agent_ids();

        check_required_fields(definition, &mut errors);
        check_unique_step_ids(definition, &mut errors);
        check_phase_numbering(&definition.phases, &mut errors);
        for phase in &definition.phases {
            check_step_numbering(phase, &mut errors);
        }
        for step in definition.all_steps() {
            check_step_shape(step, &known_agents, &mut errors);
        }
        check_handoff_targets(definition, &known_agents, &mut errors);
        check_handoff_cycles(definition, &mut errors);

        debug!(
            workflow_id = %definition.id,
            errors = errors.len(),
            "Workflow validated"
        );
        errors
    }

    pub fn validate_execution_ready(&self, definition: &WorkflowDefinition) -> bool {
        self.validate(definition).is_empty()
    }
}

fn check_required_fields(def: &WorkflowDefinition, errors: &mut Vec<String>) {
    if def.id.trim().is_empty() {
        errors.push("Workflow id is required".to_string());
    }
    if def.name.trim().is_empty() {
        errors.push("Workflow name is required".to_string());
    }
    if def.description.trim().is_empty() {
        errors.push("Workflow description is required".to_string());
    }
    if def.phases.is_empty() {
        errors.push("Workflow must have at least one phase".to_string());
    }
}

fn check_unique_step_ids(def: &WorkflowDefinition, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for step in def.all_steps() {
        if !seen.insert(step.id.as_str()) && reported.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step id '{}'", step.id));
        }
    }
}

fn check_phase_numbering(phases: &[WorkflowPhase], errors: &mut Vec<String>) {
    for (i, phase) in phases.iter().enumerate() {
        let expected = i as u32 + 1;
        if phase.number != expected {
            errors.push(format!(
                "Phase '{}' has number {}, expected {} (phases must be numbered 1..{} in order)",
                phase.id,
                phase.number,
                expected,
                phases.len()
            ));
        }
        if phase.steps.is_empty() {
            errors.push(format!("Phase '{}' has no steps", phase.id));
        }
    }
}

fn check_step_numbering(phase: &WorkflowPhase, errors: &mut Vec<String>) {
    for (i, step) in phase.steps.iter().enumerate() {
        let expected = i as u32 + 1;
        if step.number != expected {
            errors.push(format!(
                "Step '{}' in phase '{}' has number {}, expected {}",
                step.id, phase.id, step.number, expected
            ));
        }
    }
}

fn check_step_shape(step: &WorkflowStep, known_agents: &HashSet<String>, errors: &mut Vec<String>) {
    match step.kind {
        StepKind::Agent => match step.target.as_deref().filter(|t| !t.trim().is_empty()) {
            None => errors.push(format!("Agent step '{}' has no target agent", step.id)),
            Some(agent) if !known_agents.contains(agent) => {
                errors.push(format!(
                    "Step '{}' references unknown agent '{}'. Known agents: {}",
                    step.id,
                    agent,
                    sorted_list(known_agents)
                ));
            }
            Some(_) => {}
        },
        StepKind::Script => {
            if step.target.as_deref().map_or(true, |t| t.trim().is_empty()) {
                errors.push(format!("Script step '{}' has no script path", step.id));
            }
        }
        StepKind::Condition => {
            if step.condition.as_deref().map_or(true, |c| c.trim().is_empty()) {
                errors.push(format!("Condition step '{}' has no condition", step.id));
            }
        }
        StepKind::Parallel => {
            if step.branches.is_empty() {
                errors.push(format!("Parallel step '{}' has no branches", step.id));
            }
        }
        StepKind::Manual => {}
    }
}

fn check_handoff_targets(
    def: &WorkflowDefinition,
    known_agents: &HashSet<String>,
    errors: &mut Vec<String>,
) {
    let step_ids = def.step_ids();
    for step in def.all_steps() {
        if let Some(target) = &step.handoff_to {
            if !step_ids.contains(target) && !known_agents.contains(target) {
                errors.push(format!(
                    "Step '{}' hands off to '{}', which is neither a step nor a known agent",
                    step.id, target
                ));
            }
        }
    }
}

/// Depth-first search over `step -> handoff_to` edges between steps,
/// reporting every back-edge.
fn check_handoff_cycles(def: &WorkflowDefinition, errors: &mut Vec<String>) {
    let steps = def.all_steps();
    let edges: HashMap<&str, &str> = steps
        .iter()
        .filter_map(|s| s.handoff_to.as_deref().map(|to| (s.id.as_str(), to)))
        .filter(|(_, to)| steps.iter().any(|s| s.id == *to))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();

    for step in &steps {
        if visited.contains(step.id.as_str()) {
            continue;
        }
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut current = Some(step.id.as_str());

        // Each node has at most one outgoing edge, so the DFS is a walk.
        while let Some(node) = current {
            if on_stack.contains(node) {
                if let Some(&from) = stack.last() {
                    if reported.insert(from) {
                        errors.push(format!(
                            "Handoff cycle detected: step '{}' hands off back to '{}'",
                            from, node
                        ));
                    }
                }
                break;
            }
            if !visited.insert(node) {
                break;
            }
            stack.push(node);
            on_stack.insert(node);
            current = edges.get(node).copied();
        }
    }
}

fn sorted_list(set: &HashSet<String>) -> String {
    let mut items: Vec<&str> = set.iter().map(String::as_str).collect();
    items.sort_unstable();
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::definition::HandoffKind;
    use weft_core::traits::StaticAgentDirectory;

    fn validator() -> WorkflowValidator {
        WorkflowValidator::new(Arc::new(StaticAgentDirectory::new([
            "writer",
            "researcher",
        ])))
    }

    fn valid() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Workflow", "Does things").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("research", 1, "researcher").with_handoff("write", HandoffKind::Always))
                .with_step(WorkflowStep::agent("write", 2, "writer")),
        )
    }

    #[test]
    fn test_valid_definition() {
        let v = validator();
        assert!(v.validate(&valid()).is_empty());
        assert!(v.validate_execution_ready(&valid()));
    }

    #[test]
    fn test_missing_fields_all_reported() {
        let def = WorkflowDefinition::new("", "", "");
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_unknown_agent_lists_known_sorted() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1).with_step(WorkflowStep::agent("s1", 1, "ghost")),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("s1"));
        assert!(errors[0].contains("ghost"));
        assert!(errors[0].contains("researcher, writer"));
    }

    #[test]
    fn test_unknown_handoff_target() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("s1", 1, "writer").with_handoff("nowhere", HandoffKind::Always)),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("nowhere"));

        // Handing off to a known agent is fine
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("s1", 1, "writer").with_handoff("researcher", HandoffKind::Always)),
        );
        assert!(validator().validate(&def).is_empty());
    }

    #[test]
    fn test_handoff_cycle_detected() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("a", 1, "writer").with_handoff("b", HandoffKind::Always))
                .with_step(WorkflowStep::agent("b", 2, "writer").with_handoff("c", HandoffKind::Always))
                .with_step(WorkflowStep::agent("c", 3, "writer").with_handoff("a", HandoffKind::Always)),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cycle"));
        assert!(errors[0].contains("'c'"));
    }

    #[test]
    fn test_two_step_handoff_cycle_detected() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("a", 1, "writer").with_handoff("b", HandoffKind::Always))
                .with_step(WorkflowStep::agent("b", 2, "researcher").with_handoff("a", HandoffKind::Always)),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cycle"));
    }

    #[test]
    fn test_self_handoff_is_a_cycle() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::agent("a", 1, "writer").with_handoff("a", HandoffKind::Always)),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cycle"));
    }

    #[test]
    fn test_numbering_gaps() {
        let def = WorkflowDefinition::new("wf", "W", "d")
            .with_phase(WorkflowPhase::new("p1", 1).with_step(WorkflowStep::manual("m1", 2)))
            .with_phase(WorkflowPhase::new("p2", 3).with_step(WorkflowStep::manual("m2", 1)));
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("Step 'm1'")));
        assert!(errors.iter().any(|e| e.contains("Phase 'p2'")));
    }

    #[test]
    fn test_empty_phase_and_step_shapes() {
        let def = WorkflowDefinition::new("wf", "W", "d")
            .with_phase(
                WorkflowPhase::new("p1", 1)
                    .with_step(WorkflowStep::script("s1", 1, ""))
                    .with_step(WorkflowStep::condition("s2", 2, " "))
                    .with_step(WorkflowStep::parallel("s3", 3, vec![])),
            )
            .with_phase(WorkflowPhase::new("p2", 2));
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn test_branches_and_duplicates() {
        let def = WorkflowDefinition::new("wf", "W", "d").with_phase(
            WorkflowPhase::new("p1", 1)
                .with_step(WorkflowStep::parallel(
                    "fan",
                    1,
                    vec![
                        WorkflowStep::agent("b1", 1, "ghost"),
                        WorkflowStep::agent("b2", 2, "writer"),
                    ],
                ))
                .with_step(WorkflowStep::agent("b2", 2, "writer")),
        );
        let errors = validator().validate(&def);
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("Duplicate step id 'b2'")));
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let v = validator();
        let def = WorkflowDefinition::new("", "W", "d");
        assert_eq!(v.validate(&def), v.validate(&def));
    }
}
