// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catalog;
mod prompts;
mod tiers;

pub use catalog::{CommandCatalog, CommandSpec, default_catalog};
pub use prompts::SYSTEM_PLANNER;
pub use tiers::{BASELINE_GUARD, attach_guards, expand_steps};

use saga_config::Settings;
use saga_llm::{ChatMessage, LlmClient, LlmError, extract_first_json};
use saga_plan::{Plan, PlannerOutput, compute_plan_id};
use saga_telemetry::{Metrics, field};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default time-to-live of the plan cache.
pub const PLAN_CACHE_TTL: Duration = Duration::from_secs(30);

/// Injectable clock for deterministic cache tests.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Planner failure modes. Callers treat every variant as "undecided" and
/// fall back to asking the player for an explicit command.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// The LLM could not be reached or returned nothing usable.
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// No balanced JSON object was found in the response.
    #[error("planner response contained no JSON object")]
    ParseFailed,

    /// The JSON object failed contract validation.
    #[error("planner output invalid: {reason}")]
    ValidationFailed {
        /// What the validator rejected.
        reason: String,
    },

    /// The proposed command is not in the routable catalog.
    #[error("command '{command}' is not routable")]
    AllowlistRejected {
        /// The rejected dotted command name.
        command: String,
    },
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

struct CacheEntry {
    at: Instant,
    plan: Plan,
}

/// Free-text → validated [`Plan`] translation with a short-lived cache.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    catalog: CommandCatalog,
    settings: Settings,
    metrics: Metrics,
    cache: Mutex<HashMap<(i64, String), CacheEntry>>,
    cache_ttl: Duration,
    clock: Clock,
}

impl Planner {
    /// Wire a planner to its LLM, catalog, and settings.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        catalog: CommandCatalog,
        settings: Settings,
        metrics: Metrics,
    ) -> Self {
        Self {
            llm,
            catalog,
            settings,
            metrics,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: PLAN_CACHE_TTL,
            clock: Arc::new(Instant::now),
        }
    }

    /// Override cache TTL and clock (tests).
    #[must_use]
    pub fn with_cache(mut self, ttl: Duration, clock: Clock) -> Self {
        self.cache_ttl = ttl;
        self.clock = clock;
        self
    }

    /// Build the two-message planner prompt.
    #[must_use]
    pub fn build_messages(&self, user_msg: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(SYSTEM_PLANNER),
            ChatMessage::user(format!(
                "TOOLS:\n{}\n\nUSER:\n{user_msg}",
                self.catalog.to_prompt_json()
            )),
        ]
    }

    fn cache_get(&self, scene_id: i64, msg: &str) -> Option<Plan> {
        let now = (self.clock)();
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(&(scene_id, msg.trim().to_string()))?;
        (now.duration_since(entry.at) <= self.cache_ttl).then(|| entry.plan.clone())
    }

    fn cache_put(&self, scene_id: i64, msg: &str, plan: &Plan) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            (scene_id, msg.trim().to_string()),
            CacheEntry {
                at: (self.clock)(),
                plan: plan.clone(),
            },
        );
    }

    /// Clear the plan cache (tests and flag flips).
    pub fn reset_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Translate a player message into a validated plan.
    ///
    /// Identical `(scene_id, trimmed message)` invocations within the
    /// cache TTL return the cached plan without calling the LLM.
    ///
    /// # Errors
    ///
    /// [`PlannerError`] on LLM failure, unparsable or invalid output, or
    /// a command outside the routable catalog.
    pub async fn plan(&self, scene_id: i64, user_msg: &str) -> Result<Plan, PlannerError> {
        if let Some(cached) = self.cache_get(scene_id, user_msg) {
            self.metrics.inc_counter("planner.cache.hit", 1);
            return Ok(cached);
        }

        let started = (self.clock)();
        self.metrics.log_event(
            "planner",
            "request.initiated",
            [field("scene_id", scene_id), field("user_msg", user_msg)],
        );

        let result = self.plan_uncached(user_msg).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(plan) => {
                self.metrics.log_event(
                    "planner",
                    "decision.accepted",
                    [field("plan_id", plan.plan_id.clone())],
                );
                self.metrics.log_event(
                    "planner",
                    "request.completed",
                    [
                        field("status", "success"),
                        field("duration_ms", duration_ms),
                    ],
                );
                self.cache_put(scene_id, user_msg, plan);
            }
            Err(e) => {
                self.metrics.log_event(
                    "planner",
                    "decision.rejected",
                    [field("reason", e.to_string())],
                );
                self.metrics.log_event(
                    "planner",
                    "request.completed",
                    [
                        field("status", failure_status(e)),
                        field("duration_ms", duration_ms),
                    ],
                );
            }
        }
        result
    }

    async fn plan_uncached(&self, user_msg: &str) -> Result<Plan, PlannerError> {
        let messages = self.build_messages(user_msg);
        let text = self.llm.generate_response(&messages).await?;

        let Some(value) = extract_first_json(&text) else {
            self.metrics.inc_counter("planner.parse.failed", 1);
            return Err(PlannerError::ParseFailed);
        };

        let output: PlannerOutput =
            serde_json::from_value(value).map_err(|e| PlannerError::ValidationFailed {
                reason: e.to_string(),
            })?;
        output
            .validate()
            .map_err(|e| PlannerError::ValidationFailed {
                reason: e.to_string(),
            })?;

        let routing = output.routing_name();
        let Some(command) = self.catalog.get(&routing) else {
            self.metrics.inc_counter("planner.allowlist.rejected", 1);
            return Err(PlannerError::AllowlistRejected { command: routing });
        };

        // Args must fit the catalog schema the LLM was shown.
        let validator = jsonschema::validator_for(&command.options_schema).map_err(|e| {
            PlannerError::ValidationFailed {
                reason: format!("catalog schema invalid: {e}"),
            }
        })?;
        let args_value = serde_json::Value::Object(output.args.clone());
        if let Err(violation) = validator.validate(&args_value) {
            return Err(PlannerError::ValidationFailed {
                reason: violation.to_string(),
            });
        }

        let plan = Plan::from_planner_output(&output).map_err(|e| {
            PlannerError::ValidationFailed {
                reason: e.to_string(),
            }
        })?;

        let tiers_enabled = self.settings.features.planning_tiers;
        let level = self.settings.planning_level();
        let mut steps = expand_steps(plan.steps, level);
        attach_guards(&mut steps, tiers_enabled);
        let plan_id = compute_plan_id(&output.command, output.subcommand.as_deref(), &steps)
            .map_err(|e| PlannerError::ValidationFailed {
                reason: e.to_string(),
            })?;

        Ok(Plan {
            plan_id,
            feasible: true,
            steps,
            failed_predicates: Vec::new(),
        })
    }
}

fn failure_status(error: &PlannerError) -> &'static str {
    match error {
        PlannerError::Llm(_) => "llm_failed",
        PlannerError::ParseFailed => "parse_failed",
        PlannerError::ValidationFailed { .. } => "validation_failed",
        PlannerError::AllowlistRejected { .. } => "allowlist_rejected",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use saga_llm::ScriptedLlm;

    fn settings() -> Settings {
        Settings::default()
    }

    fn planner_with(responses: &[&str], settings: Settings) -> (Planner, Arc<ScriptedLlm>) {
        let llm = Arc::new(ScriptedLlm::new(responses.iter().copied()));
        let planner = Planner::new(
            llm.clone(),
            default_catalog(),
            settings,
            Metrics::new(),
        );
        (planner, llm)
    }

    #[tokio::test]
    async fn valid_response_becomes_a_plan() {
        let (planner, _) = planner_with(
            &[r#"{"command": "check", "args": {"ability": "DEX", "dc": 12}}"#],
            settings(),
        );
        let plan = planner.plan(10, "try to dodge the trap").await.unwrap();
        assert!(plan.feasible);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].op, "check");
        assert_eq!(plan.plan_id.len(), 16);
    }

    #[tokio::test]
    async fn prose_wrapped_json_is_extracted() {
        let (planner, _) = planner_with(
            &[r#"Sure! Here's my plan: {"command": "roll", "args": {"expr": "2d6"}} Enjoy."#],
            settings(),
        );
        let plan = planner.plan(10, "roll me some dice").await.unwrap();
        assert_eq!(plan.steps[0].op, "roll");
    }

    #[tokio::test]
    async fn cache_suppresses_duplicate_llm_calls() {
        let (planner, llm) = planner_with(
            &[r#"{"command": "roll", "args": {"expr": "1d20"}}"#],
            settings(),
        );
        let first = planner.plan(10, "roll a d20").await.unwrap();
        let second = planner.plan(10, "  roll a d20  ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn cache_hit_metric_increments() {
        let (planner, _) = planner_with(
            &[r#"{"command": "roll", "args": {"expr": "1d20"}}"#],
            settings(),
        );
        planner.plan(10, "roll").await.unwrap();
        planner.plan(10, "roll").await.unwrap();
        assert_eq!(planner.metrics.get_counter("planner.cache.hit"), 1);
    }

    #[tokio::test]
    async fn cache_is_scene_scoped() {
        let (planner, llm) = planner_with(
            &[
                r#"{"command": "roll", "args": {"expr": "1d20"}}"#,
                r#"{"command": "roll", "args": {"expr": "1d20"}}"#,
            ],
            settings(),
        );
        planner.plan(10, "roll").await.unwrap();
        planner.plan(11, "roll").await.unwrap();
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_ignored() {
        let (planner, llm) = planner_with(
            &[
                r#"{"command": "roll", "args": {"expr": "1d20"}}"#,
                r#"{"command": "roll", "args": {"expr": "1d20"}}"#,
            ],
            settings(),
        );
        let planner = planner.with_cache(Duration::ZERO, Arc::new(Instant::now));
        planner.plan(10, "roll").await.unwrap();
        planner.plan(10, "roll").await.unwrap();
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn no_json_is_a_parse_failure() {
        let (planner, _) = planner_with(&["I would roll a d20 for that."], settings());
        let err = planner.plan(10, "roll").await.unwrap_err();
        assert!(matches!(err, PlannerError::ParseFailed));
        assert_eq!(planner.metrics.get_counter("planner.parse.failed"), 1);
    }

    #[tokio::test]
    async fn unknown_fields_fail_validation() {
        let (planner, _) = planner_with(
            &[r#"{"command": "roll", "args": {"expr": "1d20"}, "mood": "excited"}"#],
            settings(),
        );
        let err = planner.plan(10, "roll").await.unwrap_err();
        assert!(matches!(err, PlannerError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn unlisted_command_is_allowlist_rejected() {
        let (planner, _) = planner_with(
            &[r#"{"command": "shutdown", "args": {}}"#],
            settings(),
        );
        let err = planner.plan(10, "shut the server down").await.unwrap_err();
        assert!(matches!(err, PlannerError::AllowlistRejected { .. }));
        assert_eq!(
            planner.metrics.get_counter("planner.allowlist.rejected"),
            1
        );
    }

    #[tokio::test]
    async fn args_violating_catalog_schema_are_rejected() {
        let (planner, _) = planner_with(
            &[r#"{"command": "roll", "args": {"expr": 42}}"#],
            settings(),
        );
        let err = planner.plan(10, "roll").await.unwrap_err();
        assert!(matches!(err, PlannerError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn llm_failure_surfaces_as_undecided() {
        let (planner, _) = planner_with(&[], settings());
        let err = planner.plan(10, "roll").await.unwrap_err();
        assert!(matches!(err, PlannerError::Llm(_)));
    }

    #[tokio::test]
    async fn tier_expansion_prepends_prepare_step() {
        let mut s = settings();
        s.features.planning_tiers = true;
        s.planner.max_level = 2;
        let (planner, _) = planner_with(
            &[r#"{"command": "check", "args": {"ability": "STR", "dc": 10}}"#],
            s,
        );
        let plan = planner.plan(10, "force the door").await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].op, "prepare.check");
        assert_eq!(plan.steps[1].op, "check");
        for step in &plan.steps {
            assert!(step.guards.contains(&BASELINE_GUARD.to_string()));
        }
    }

    #[tokio::test]
    async fn tiers_disabled_leave_single_step_and_no_guards() {
        let mut s = settings();
        s.planner.max_level = 2; // ignored without the feature flag
        let (planner, _) = planner_with(
            &[r#"{"command": "check", "args": {"ability": "STR"}}"#],
            s,
        );
        let plan = planner.plan(10, "force the door").await.unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].guards.is_empty());
    }

    #[tokio::test]
    async fn plan_id_reflects_expanded_steps() {
        let response = r#"{"command": "check", "args": {"ability": "STR"}}"#;
        let (flat, _) = planner_with(&[response], settings());
        let mut s = settings();
        s.features.planning_tiers = true;
        s.planner.max_level = 2;
        let (tiered, _) = planner_with(&[response], s);

        let flat_plan = flat.plan(10, "force the door").await.unwrap();
        let tiered_plan = tiered.plan(10, "force the door").await.unwrap();
        assert_ne!(flat_plan.plan_id, tiered_plan.plan_id);
    }

    #[tokio::test]
    async fn prompt_carries_catalog_and_user_message() {
        let (planner, llm) = planner_with(
            &[r#"{"command": "roll", "args": {"expr": "1d20"}}"#],
            settings(),
        );
        planner.plan(10, "roll one").await.unwrap();
        let prompts = llm.prompts();
        assert_eq!(prompts[0][0].content, SYSTEM_PLANNER);
        assert!(prompts[0][1].content.contains("TOOLS:"));
        assert!(prompts[0][1].content.contains("sheet.create"));
        assert!(prompts[0][1].content.contains("USER:\nroll one"));
    }
}
