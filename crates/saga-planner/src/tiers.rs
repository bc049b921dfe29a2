// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tiered planning expansion.
//!
//! Level 1 is the single-step baseline. Level 2 prepends a deterministic
//! preparation step ahead of a single-step plan, exercising multi-step
//! serialization without new domain behavior. Higher levels are reserved.

use saga_canonical::JsonMap;
use saga_plan::PlanStep;
use tracing::info;

/// Guard attached to every step when planning tiers are enabled.
pub const BASELINE_GUARD: &str = "capability:basic_action";

/// Expand a step list to the requested level.
///
/// Level 2 turns a single step `op` into `[prepare.<domain>, op]` where
/// `<domain>` is the op's first dotted segment; multi-step inputs pass
/// through unchanged.
#[must_use]
pub fn expand_steps(mut steps: Vec<PlanStep>, level: u8) -> Vec<PlanStep> {
    if level <= 1 {
        return steps;
    }
    if steps.len() == 1 {
        let domain = steps[0].op.split('.').next().unwrap_or("action").to_string();
        steps.insert(
            0,
            PlanStep {
                op: format!("prepare.{domain}"),
                args: JsonMap::new(),
                guards: Vec::new(),
            },
        );
        info!(
            target: "saga",
            requested_level = level,
            new_steps = steps.len(),
            "planner.tier.expansion.level2_applied"
        );
    } else {
        info!(
            target: "saga",
            requested_level = level,
            steps = steps.len(),
            "planner.tier.expansion.noop"
        );
    }
    steps
}

/// Attach the baseline capability guard to each step when tiers are
/// enabled; disabled tiers leave guards untouched for rollback parity.
pub fn attach_guards(steps: &mut [PlanStep], tiers_enabled: bool) {
    if !tiers_enabled {
        return;
    }
    for step in steps {
        if !step.guards.iter().any(|g| g == BASELINE_GUARD) {
            step.guards.push(BASELINE_GUARD.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(op: &str) -> PlanStep {
        PlanStep {
            op: op.to_string(),
            args: JsonMap::new(),
            guards: Vec::new(),
        }
    }

    #[test]
    fn level_one_is_identity() {
        let steps = expand_steps(vec![step("check")], 1);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].op, "check");
    }

    #[test]
    fn level_two_prepends_preparation() {
        let steps = expand_steps(vec![step("check")], 2);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].op, "prepare.check");
        assert_eq!(steps[1].op, "check");
    }

    #[test]
    fn domain_is_first_dotted_segment() {
        let steps = expand_steps(vec![step("sheet.create")], 2);
        assert_eq!(steps[0].op, "prepare.sheet");
    }

    #[test]
    fn multi_step_input_is_noop() {
        let steps = expand_steps(vec![step("a"), step("b")], 2);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].op, "a");
    }

    #[test]
    fn guards_only_attach_when_tiers_enabled() {
        let mut steps = vec![step("check")];
        attach_guards(&mut steps, false);
        assert!(steps[0].guards.is_empty());
        attach_guards(&mut steps, true);
        assert_eq!(steps[0].guards, vec![BASELINE_GUARD.to_string()]);
        // Idempotent.
        attach_guards(&mut steps, true);
        assert_eq!(steps[0].guards.len(), 1);
    }
}
