pub mod generator;

pub use generator::HandoffGenerator;

use weft_core::definition::{HandoffKind, WorkflowStep};
use weft_core::types::StepExecution;

use crate::condition::{evaluate_condition, ConditionContext};

/// Whether `step` should produce a handoff after finishing as `result`.
///
/// CONDITIONAL handoffs use the step's `handoff_condition`; without one they
/// follow the step's own `condition_result` output (CONDITION steps).
pub fn handoff_due(step: &WorkflowStep, result: &StepExecution, ctx: &ConditionContext) -> bool {
    if step.handoff_to.is_none() {
        return false;
    }
    let succeeded = result.succeeded();
    match step.handoff_kind {
        HandoffKind::Always => succeeded,
        HandoffKind::OnError => !succeeded,
        HandoffKind::Never => false,
        HandoffKind::Conditional => {
            if !succeeded {
                return false;
            }
            match step.handoff_condition.as_deref() {
                Some(expr) => evaluate_condition(expr, ctx),
                None => result
                    .output
                    .get("condition_result")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished(step: &WorkflowStep, ok: bool, output: serde_json::Value) -> StepExecution {
        let mut exec = StepExecution::new(step);
        exec.start();
        if ok {
            exec.complete(output);
        } else {
            exec.fail("boom");
        }
        exec
    }

    #[test]
    fn test_kinds() {
        let ctx = ConditionContext::new();
        let always = WorkflowStep::agent("a", 1, "w").with_handoff("b", HandoffKind::Always);
        assert!(handoff_due(&always, &finished(&always, true, json!({})), &ctx));
        assert!(!handoff_due(&always, &finished(&always, false, json!({})), &ctx));

        let on_error = WorkflowStep::agent("a", 1, "w").with_handoff("b", HandoffKind::OnError);
        assert!(!handoff_due(&on_error, &finished(&on_error, true, json!({})), &ctx));
        assert!(handoff_due(&on_error, &finished(&on_error, false, json!({})), &ctx));

        let never = WorkflowStep::agent("a", 1, "w").with_handoff("b", HandoffKind::Never);
        assert!(!handoff_due(&never, &finished(&never, true, json!({})), &ctx));

        let none = WorkflowStep::agent("a", 1, "w");
        assert!(!handoff_due(&none, &finished(&none, true, json!({})), &ctx));
    }

    #[test]
    fn test_conditional() {
        let mut ctx = ConditionContext::new();
        ctx.set("verdict", json!("approve"));

        let step = WorkflowStep::agent("a", 1, "w")
            .with_handoff("b", HandoffKind::Conditional)
            .with_handoff_condition(r#"verdict == "approve""#);
        assert!(handoff_due(&step, &finished(&step, true, json!({})), &ctx));

        let step = WorkflowStep::condition("c", 1, "true").with_handoff("b", HandoffKind::Conditional);
        assert!(handoff_due(&step, &finished(&step, true, json!({ "condition_result": true })), &ctx));
        assert!(!handoff_due(&step, &finished(&step, true, json!({ "condition_result": false })), &ctx));
    }
}
