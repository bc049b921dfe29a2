// SPDX-License-Identifier: MIT OR Apache-2.0

//! The LLM proposal contract and its execution-request conversions.

use saga_canonical::JsonMap;
use saga_plan::{
    ExecutionContext, ExecutionRequest, ExecutionStep, PlanStep, Visibility, compute_plan_id,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actions the orchestrator accepts from the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    /// Resolve an ability check.
    AbilityCheck,
    /// Resolve an attack roll.
    Attack,
    /// Apply a condition to a target.
    ApplyCondition,
    /// Remove one stack of a condition.
    RemoveCondition,
    /// Clear all stacks of a condition.
    ClearCondition,
}

impl ProposalAction {
    /// The executor tool realizing this action.
    #[must_use]
    pub fn tool(self) -> &'static str {
        match self {
            ProposalAction::AbilityCheck => "check",
            ProposalAction::Attack => "attack",
            ProposalAction::ApplyCondition => "apply_condition",
            ProposalAction::RemoveCondition => "remove_condition",
            ProposalAction::ClearCondition => "clear_condition",
        }
    }

    fn from_tool(tool: &str) -> Option<Self> {
        match tool {
            "check" => Some(ProposalAction::AbilityCheck),
            "attack" => Some(ProposalAction::Attack),
            "apply_condition" => Some(ProposalAction::ApplyCondition),
            "remove_condition" => Some(ProposalAction::RemoveCondition),
            "clear_condition" => Some(ProposalAction::ClearCondition),
            _ => None,
        }
    }

    /// Whether applying this action mutates world state (and therefore
    /// needs confirmation when the confirm flow is enabled).
    #[must_use]
    pub fn mutates_state(self) -> bool {
        !matches!(self, ProposalAction::AbilityCheck)
    }
}

/// The structured half of the LLM's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Proposal {
    /// What the LLM wants the game to do.
    pub action: ProposalAction,
    /// Ability for checks (`STR` … `CHA`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability: Option<String>,
    /// Suggested difficulty class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_dc: Option<i64>,
    /// Acting character.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Targeted character.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Condition name for condition actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// LLM justification; scanned by the defenses, never executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The complete LLM answer: a proposal plus player-facing narration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmOutput {
    /// The structured action proposal.
    pub proposal: Proposal,
    /// Player-visible narration.
    pub narration: String,
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn set_opt(args: &mut JsonMap, key: &str, value: Option<&String>) {
    if let Some(v) = value {
        args.insert(key.to_string(), Value::String(v.clone()));
    }
}

/// Lower an accepted proposal into an execution request.
///
/// Only proposal-owned fields land in the step args; executor-side
/// enrichment (scores, armor class) happens on the chain the executor
/// actually runs, so the request stays losslessly convertible back to
/// the proposal.
///
/// # Errors
///
/// Propagates `plan_id` hashing failures as their contract error string.
pub fn execution_request_from_llm_output(
    output: &LlmOutput,
    scene_id: i64,
    request_id: &str,
    requires_confirmation: bool,
) -> Result<ExecutionRequest, saga_plan::ContractError> {
    let proposal = &output.proposal;
    let mut args = JsonMap::new();
    set_opt(&mut args, "ability", proposal.ability.as_ref());
    if let Some(dc) = proposal.suggested_dc {
        args.insert("dc".to_string(), Value::Number(dc.into()));
    }
    set_opt(&mut args, "actor", proposal.actor.as_ref());
    set_opt(&mut args, "target", proposal.target.as_ref());
    set_opt(&mut args, "condition", proposal.condition.as_ref());

    let step = ExecutionStep {
        op: proposal.action.tool().to_string(),
        args,
        requires_confirmation,
        visibility: Visibility::Public,
    };
    let plan_steps = [PlanStep {
        op: step.op.clone(),
        args: step.args.clone(),
        guards: Vec::new(),
    }];
    let plan_id = compute_plan_id("do", None, &plan_steps)?;

    Ok(ExecutionRequest {
        plan_id,
        context: ExecutionContext {
            scene_id,
            actor_id: proposal.actor.clone(),
            request_id: Some(request_id.to_string()),
        },
        steps: vec![step],
    })
}

/// Recover the LLM-output view of a single-step execution request.
///
/// Inverse of [`execution_request_from_llm_output`] for the structural
/// fields; `narration` and `reason` ride outside the request and are
/// supplied by the caller.
#[must_use]
pub fn llm_output_from_execution_request(
    request: &ExecutionRequest,
    narration: &str,
    reason: Option<&str>,
) -> Option<LlmOutput> {
    let step = match request.steps.as_slice() {
        [single] => single,
        _ => return None,
    };
    let action = ProposalAction::from_tool(&step.op)?;
    let get = |key: &str| {
        step.args
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Some(LlmOutput {
        proposal: Proposal {
            action,
            ability: get("ability"),
            suggested_dc: step.args.get("dc").and_then(Value::as_i64),
            actor: get("actor"),
            target: get("target"),
            condition: get("condition"),
            reason: reason.map(str::to_string),
        },
        narration: narration.to_string(),
    })
}
