// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saga_canonical::{CanonicalError, JsonMap, canonical_hash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Contract violations raised at parse/validation boundaries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractError {
    /// `command` was empty.
    #[error("planner output command must not be empty")]
    EmptyCommand,

    /// `confidence` was outside `0.0..=1.0`.
    #[error("confidence {value} outside 0..=1")]
    InvalidConfidence {
        /// The rejected value.
        value: f64,
    },

    /// The payload could not be canonically encoded for `plan_id`.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

// ---------------------------------------------------------------------------
// Planner output
// ---------------------------------------------------------------------------

/// Validated output of the planner LLM.
///
/// Unknown fields are rejected at the parse boundary; `confidence` and
/// `rationale` are observability-only and never influence dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlannerOutput {
    /// Top-level command name (e.g. `check`).
    pub command: String,
    /// Optional subcommand (e.g. `create` for `sheet.create`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
    /// Arguments for the command's option model.
    #[serde(default)]
    pub args: JsonMap,
    /// Planner self-reported confidence in `0..=1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Planner rationale, free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl PlannerOutput {
    /// Enforce field constraints the serde derive cannot express.
    ///
    /// # Errors
    ///
    /// [`ContractError`] on an empty command or out-of-range confidence.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.command.trim().is_empty() {
            return Err(ContractError::EmptyCommand);
        }
        if let Some(c) = self.confidence
            && !(0.0..=1.0).contains(&c)
        {
            return Err(ContractError::InvalidConfidence { value: c });
        }
        Ok(())
    }

    /// The dotted routing name: `command` or `command.subcommand`.
    #[must_use]
    pub fn routing_name(&self) -> String {
        match &self.subcommand {
            Some(sub) => format!("{}.{}", self.command, sub),
            None => self.command.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One step of a validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Dotted operation identifier (e.g. `roll.d20`, `check`).
    pub op: String,
    /// Operation arguments.
    #[serde(default)]
    pub args: JsonMap,
    /// Guard strings of the form `<category>:<name>[:k=v,…]`.
    #[serde(default)]
    pub guards: Vec<String>,
}

/// A feasibility-checked predicate failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPredicate {
    /// Stable predicate code (e.g. `known_ability`).
    pub code: String,
    /// Human-readable detail for the caller.
    pub detail: String,
}

/// A validated, optionally multi-step intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Deterministic 16-hex identifier.
    pub plan_id: String,
    /// Whether the predicate gate judged the plan feasible.
    pub feasible: bool,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
    /// Accumulated predicate failures when infeasible.
    #[serde(default)]
    pub failed_predicates: Vec<FailedPredicate>,
}

impl Plan {
    /// Build a single-step feasible plan from planner output.
    ///
    /// # Errors
    ///
    /// Propagates canonical-encoding failures from `plan_id` hashing.
    pub fn from_planner_output(out: &PlannerOutput) -> Result<Self, ContractError> {
        let steps = vec![PlanStep {
            op: out.routing_name(),
            args: out.args.clone(),
            guards: Vec::new(),
        }];
        let plan_id = compute_plan_id(&out.command, out.subcommand.as_deref(), &steps)?;
        Ok(Self {
            plan_id,
            feasible: true,
            steps,
            failed_predicates: Vec::new(),
        })
    }

    /// Recover the planner-output view of a single-step plan.
    ///
    /// Only the routable fields survive the round trip; observability
    /// fields (`confidence`, `rationale`) live solely on [`PlannerOutput`].
    /// Multi-step plans (tier-expanded) have no planner-output form.
    #[must_use]
    pub fn to_planner_output(&self) -> Option<PlannerOutput> {
        if self.steps.len() != 1 {
            return None;
        }
        let step = &self.steps[0];
        let (command, subcommand) = match step.op.split_once('.') {
            Some((cmd, sub)) => (cmd.to_string(), Some(sub.to_string())),
            None => (step.op.clone(), None),
        };
        Some(PlannerOutput {
            command,
            subcommand,
            args: step.args.clone(),
            confidence: None,
            rationale: None,
        })
    }
}

/// Compute the deterministic plan identifier.
///
/// 16-hex truncation of SHA-256 over the canonical serialization of
/// `{command, subcommand, steps}`.
///
/// # Errors
///
/// Propagates [`CanonicalError`] when step args violate the canonical
/// policy.
pub fn compute_plan_id(
    command: &str,
    subcommand: Option<&str>,
    steps: &[PlanStep],
) -> Result<String, ContractError> {
    let mut material = JsonMap::new();
    material.insert("command".to_string(), Value::String(command.to_string()));
    if let Some(sub) = subcommand {
        material.insert("subcommand".to_string(), Value::String(sub.to_string()));
    }
    let steps_value: Vec<Value> = steps
        .iter()
        .map(|s| {
            let mut m = JsonMap::new();
            m.insert("op".to_string(), Value::String(s.op.clone()));
            m.insert("args".to_string(), Value::Object(s.args.clone()));
            m.insert(
                "guards".to_string(),
                Value::Array(s.guards.iter().cloned().map(Value::String).collect()),
            );
            Value::Object(m)
        })
        .collect();
    material.insert("steps".to_string(), Value::Array(steps_value));

    let digest = canonical_hash(&material)?;
    Ok(hex::encode(&digest[..8]))
}

// ---------------------------------------------------------------------------
// Execution request
// ---------------------------------------------------------------------------

/// Who may see a step's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible to the whole channel.
    #[default]
    Public,
    /// Visible only to the requesting user.
    Ephemeral,
}

/// Scene context carried by an execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Scene the request executes in.
    pub scene_id: i64,
    /// Acting entity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// Idempotency scope for retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One executor-facing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Tool operation to invoke.
    pub op: String,
    /// Tool arguments.
    #[serde(default)]
    pub args: JsonMap,
    /// Whether this step must be confirmed by a human before applying.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Output visibility.
    #[serde(default)]
    pub visibility: Visibility,
}

/// The executor-facing representation of a validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Plan this request realizes.
    pub plan_id: String,
    /// Scene context.
    pub context: ExecutionContext,
    /// Ordered steps.
    pub steps: Vec<ExecutionStep>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().expect("object literal")
    }

    fn sample_output() -> PlannerOutput {
        PlannerOutput {
            command: "check".to_string(),
            subcommand: None,
            args: args(json!({"ability": "DEX", "dc": 12})),
            confidence: Some(0.9),
            rationale: Some("player asked for a dexterity check".to_string()),
        }
    }

    #[test]
    fn planner_output_rejects_unknown_fields() {
        let err = serde_json::from_str::<PlannerOutput>(
            r#"{"command": "roll", "sneaky": true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sneaky"));
    }

    #[test]
    fn planner_output_validate_bounds_confidence() {
        let mut out = sample_output();
        out.confidence = Some(1.5);
        assert!(matches!(
            out.validate(),
            Err(ContractError::InvalidConfidence { .. })
        ));
        out.confidence = Some(1.0);
        out.validate().unwrap();
    }

    #[test]
    fn planner_output_validate_rejects_empty_command() {
        let mut out = sample_output();
        out.command = "  ".to_string();
        assert_eq!(out.validate(), Err(ContractError::EmptyCommand));
    }

    #[test]
    fn routing_name_joins_subcommand() {
        let mut out = sample_output();
        assert_eq!(out.routing_name(), "check");
        out.command = "sheet".to_string();
        out.subcommand = Some("create".to_string());
        assert_eq!(out.routing_name(), "sheet.create");
    }

    #[test]
    fn plan_round_trips_routable_fields() {
        let out = sample_output();
        let plan = Plan::from_planner_output(&out).unwrap();
        let back = plan.to_planner_output().unwrap();
        assert_eq!(back.command, out.command);
        assert_eq!(back.subcommand, out.subcommand);
        assert_eq!(back.args, out.args);
    }

    #[test]
    fn plan_round_trip_preserves_subcommand_split() {
        let out = PlannerOutput {
            command: "sheet".to_string(),
            subcommand: Some("create".to_string()),
            args: JsonMap::new(),
            confidence: None,
            rationale: None,
        };
        let plan = Plan::from_planner_output(&out).unwrap();
        assert_eq!(plan.steps[0].op, "sheet.create");
        let back = plan.to_planner_output().unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn multi_step_plan_has_no_planner_output_form() {
        let out = sample_output();
        let mut plan = Plan::from_planner_output(&out).unwrap();
        plan.steps.insert(
            0,
            PlanStep {
                op: "prepare.check".to_string(),
                args: JsonMap::new(),
                guards: Vec::new(),
            },
        );
        assert!(plan.to_planner_output().is_none());
    }

    #[test]
    fn plan_id_is_16_hex() {
        let plan = Plan::from_planner_output(&sample_output()).unwrap();
        assert_eq!(plan.plan_id.len(), 16);
        assert!(plan.plan_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn plan_id_is_deterministic() {
        let a = Plan::from_planner_output(&sample_output()).unwrap();
        let b = Plan::from_planner_output(&sample_output()).unwrap();
        assert_eq!(a.plan_id, b.plan_id);
    }

    #[test]
    fn plan_id_ignores_observability_fields() {
        let mut out = sample_output();
        let a = Plan::from_planner_output(&out).unwrap();
        out.confidence = None;
        out.rationale = None;
        let b = Plan::from_planner_output(&out).unwrap();
        assert_eq!(a.plan_id, b.plan_id);
    }

    #[test]
    fn plan_id_sensitive_to_args_and_command() {
        let base = Plan::from_planner_output(&sample_output()).unwrap();

        let mut out = sample_output();
        out.args = args(json!({"ability": "STR", "dc": 12}));
        assert_ne!(Plan::from_planner_output(&out).unwrap().plan_id, base.plan_id);

        let mut out = sample_output();
        out.command = "roll".to_string();
        assert_ne!(Plan::from_planner_output(&out).unwrap().plan_id, base.plan_id);
    }

    #[test]
    fn visibility_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Visibility::Ephemeral).unwrap(),
            "\"ephemeral\""
        );
        assert_eq!(
            serde_json::from_str::<Visibility>("\"public\"").unwrap(),
            Visibility::Public
        );
    }

    #[test]
    fn execution_request_serde_roundtrip() {
        let req = ExecutionRequest {
            plan_id: "deadbeefdeadbeef".to_string(),
            context: ExecutionContext {
                scene_id: 10,
                actor_id: Some("Alice".to_string()),
                request_id: Some("req-1".to_string()),
            },
            steps: vec![ExecutionStep {
                op: "check".to_string(),
                args: args(json!({"ability": "DEX", "dc": 12})),
                requires_confirmation: false,
                visibility: Visibility::Public,
            }],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ExecutionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn execution_step_defaults() {
        let step: ExecutionStep = serde_json::from_str(r#"{"op": "roll"}"#).unwrap();
        assert!(!step.requires_confirmation);
        assert_eq!(step.visibility, Visibility::Public);
        assert!(step.args.is_empty());
    }
}
