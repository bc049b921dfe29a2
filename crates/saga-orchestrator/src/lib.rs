// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod proposal;

pub use proposal::{
    LlmOutput, Proposal, ProposalAction, execution_request_from_llm_output,
    llm_output_from_execution_request,
};

use async_trait::async_trait;
use saga_config::Features;
use saga_executor::{Executor, ToolCallChain, tool_chain_from_execution_request};
use saga_ledger::LedgerError;
use saga_llm::{ChatMessage, LlmClient};
use saga_plan::ExecutionRequest;
use saga_telemetry::{Metrics, field};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default time-to-live of the orchestrator result cache.
pub const RESULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Transcript lines folded into the prompt as context facts.
const FACTS_LIMIT: i64 = 15;

/// Retrieved lore snippets folded into the prompt.
const SNIPPET_LIMIT: usize = 3;

/// Phrasings that mutate state directly; a proposal may only change the
/// world through its structured action, never through prose.
const UNSAFE_VERBS: &[&str] = &[
    "takes damage",
    "take damage",
    "deals damage",
    "deal damage",
    "loses hp",
    "lose hp",
    "gains hp",
    "restores hp",
    "set hp",
    "drops to 0",
    "is dead",
    "dies instantly",
    "kills",
    "is killed",
];

/// System prompt constraining the LLM to the proposal contract.
pub const ORCHESTRATOR_SYSTEM: &str = "You are the game master's adjudicator. Read the FACTS \
and the PLAYER message, then answer with ONLY a single JSON object of the form \
{\"proposal\": {\"action\": ..., ...}, \"narration\": \"...\"}. The action must be one of \
ability_check, attack, apply_condition, remove_condition, clear_condition. Never state \
mechanical outcomes (damage dealt, hit points lost, death) in the narration; the engine \
computes outcomes.";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Hard failures of the orchestration pipeline. Soft failures (bad LLM
/// output, defense rejections) surface inside [`OrchestratorResult`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The scene does not exist.
    #[error("unknown scene: {scene_id}")]
    UnknownScene {
        /// The missing scene id.
        scene_id: i64,
    },

    /// The sheet provider failed.
    #[error("sheet lookup failed: {reason}")]
    Sheets {
        /// Backend failure description.
        reason: String,
    },

    /// The world store failed.
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

// ---------------------------------------------------------------------------
// Sheet seam
// ---------------------------------------------------------------------------

/// A character's block for one ability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbilityBlock {
    /// Ability score (not modifier).
    pub score: i64,
    /// Whether the character is proficient in this check.
    pub proficient: bool,
    /// Whether proficiency is doubled.
    pub expertise: bool,
    /// Proficiency bonus.
    pub prof_bonus: i64,
}

/// A character's attack numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttackProfile {
    /// To-hit bonus.
    pub attack_bonus: i64,
    /// Damage dice expression.
    pub damage: String,
}

/// Read-only character-sheet capability consumed by the orchestrator.
#[async_trait]
pub trait SheetInfoProvider: Send + Sync {
    /// Ability block for an actor, when a sheet exists.
    async fn ability_block(
        &self,
        campaign_id: i64,
        actor: &str,
        ability: &str,
    ) -> Result<Option<AbilityBlock>, OrchestratorError>;

    /// Armor class of a named creature, when known.
    async fn armor_class(
        &self,
        campaign_id: i64,
        name: &str,
    ) -> Result<Option<i64>, OrchestratorError>;

    /// Attack profile of an actor, when a sheet exists.
    async fn attack_profile(
        &self,
        campaign_id: i64,
        actor: &str,
    ) -> Result<Option<AttackProfile>, OrchestratorError>;
}

// ---------------------------------------------------------------------------
// Retrieval seam
// ---------------------------------------------------------------------------

/// A retrieved lore snippet. Retrieval implementations must only ever
/// return player-visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    /// The snippet body.
    pub text: String,
}

/// Knowledge-base retrieval capability consumed by the orchestrator.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Top-`k` snippets relevant to `query` within a campaign.
    async fn retrieve(
        &self,
        campaign_id: i64,
        query: &str,
        k: usize,
    ) -> Result<Vec<Snippet>, OrchestratorError>;
}

/// Provider with no sheets; every lookup falls back to table defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSheets;

#[async_trait]
impl SheetInfoProvider for NoSheets {
    async fn ability_block(
        &self,
        _campaign_id: i64,
        _actor: &str,
        _ability: &str,
    ) -> Result<Option<AbilityBlock>, OrchestratorError> {
        Ok(None)
    }

    async fn armor_class(
        &self,
        _campaign_id: i64,
        _name: &str,
    ) -> Result<Option<i64>, OrchestratorError> {
        Ok(None)
    }

    async fn attack_profile(
        &self,
        _campaign_id: i64,
        _actor: &str,
    ) -> Result<Option<AttackProfile>, OrchestratorError> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// What the orchestrator hands back to the command surface.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorResult {
    /// Whether a defense rejected the proposal.
    pub rejected: bool,
    /// Rejection reason (`unsafe_verb`, `unknown_actor`,
    /// `invalid_schema`, `llm_unavailable`, `preview_failed`).
    pub reason: Option<String>,
    /// Human-readable mechanics preview.
    pub mechanics: String,
    /// Player-visible narration.
    pub narration: String,
    /// The validated request, when action validation is enabled.
    pub execution_request: Option<ExecutionRequest>,
    /// Serialized chain for the pending store.
    pub chain_json: Option<Value>,
}

impl OrchestratorResult {
    fn rejection(reason: &str) -> Self {
        Self {
            rejected: true,
            reason: Some(reason.to_string()),
            mechanics: String::new(),
            narration: String::new(),
            execution_request: None,
            chain_json: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct CacheEntry {
    at: Instant,
    result: OrchestratorResult,
}

/// The proposal orchestration pipeline.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    sheets: Arc<dyn SheetInfoProvider>,
    retriever: Option<Arc<dyn Retriever>>,
    features: Features,
    metrics: Metrics,
    cache: Mutex<HashMap<(i64, String), CacheEntry>>,
    cache_ttl: Duration,
}

impl Orchestrator {
    /// Wire the orchestrator to its LLM, sheets, and flags.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        sheets: Arc<dyn SheetInfoProvider>,
        features: Features,
        metrics: Metrics,
    ) -> Self {
        Self {
            llm,
            sheets,
            retriever: None,
            features,
            metrics,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: RESULT_CACHE_TTL,
        }
    }

    /// Attach a knowledge-base retriever; its snippets join the prompt
    /// facts.
    #[must_use]
    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Override the cache TTL (tests).
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn cache_get(&self, scene_id: i64, message: &str) -> Option<OrchestratorResult> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(&(scene_id, message.trim().to_string()))?;
        (entry.at.elapsed() <= self.cache_ttl).then(|| entry.result.clone())
    }

    fn cache_put(&self, scene_id: i64, message: &str, result: &OrchestratorResult) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            (scene_id, message.trim().to_string()),
            CacheEntry {
                at: Instant::now(),
                result: result.clone(),
            },
        );
    }

    /// Run the full pipeline for one player message.
    ///
    /// Identical `(scene, trimmed message)` invocations within the cache
    /// TTL return the cached result (and therefore reuse its
    /// `request_id`, so an impatient double-send stages the same
    /// intent).
    ///
    /// # Errors
    ///
    /// [`OrchestratorError`] only on infrastructure failures; LLM and
    /// defense rejections come back as a rejected result.
    pub async fn run(
        &self,
        executor: &Executor,
        scene_id: i64,
        user_id: &str,
        message: &str,
        allowed_actors: &[String],
    ) -> Result<OrchestratorResult, OrchestratorError> {
        let campaign_id = executor
            .ledger()
            .db()
            .campaign_for_scene(scene_id)
            .await?
            .ok_or(OrchestratorError::UnknownScene { scene_id })?;

        if let Some(cached) = self.cache_get(scene_id, message) {
            self.metrics.inc_counter("orchestrator.cache.hit", 1);
            return Ok(cached);
        }

        let result = self
            .run_uncached(executor, campaign_id, scene_id, user_id, message, allowed_actors)
            .await?;
        self.cache_put(scene_id, message, &result);
        Ok(result)
    }

    async fn run_uncached(
        &self,
        executor: &Executor,
        campaign_id: i64,
        scene_id: i64,
        user_id: &str,
        message: &str,
        allowed_actors: &[String],
    ) -> Result<OrchestratorResult, OrchestratorError> {
        let facts = self
            .gather_facts(executor, campaign_id, scene_id, message)
            .await?;
        let messages = build_messages(&facts, message);

        self.metrics.inc_counter("llm.request.enqueued", 1);
        self.metrics.log_event(
            "orchestrator",
            "request.initiated",
            [field("user_id", user_id), field("scene_id", scene_id)],
        );

        let value = match self.llm.generate_json(&messages, Some(ORCHESTRATOR_SYSTEM)).await {
            Ok(value) => value,
            Err(e) => {
                self.metrics.log_event(
                    "orchestrator",
                    "llm.failed",
                    [field("reason", e.to_string())],
                );
                return Ok(OrchestratorResult::rejection("llm_unavailable"));
            }
        };
        self.metrics.inc_counter("llm.response.received", 1);

        let output: LlmOutput = match serde_json::from_value(value) {
            Ok(output) => output,
            Err(_) => return Ok(self.reject("invalid_schema")),
        };

        // Defenses, in order. Unsafe phrasing is checked first so a
        // dangerous narration never reaches the preview or the player.
        if let Some(phrase) = find_unsafe_verb(&output) {
            self.metrics.log_event(
                "orchestrator",
                "defense.unsafe_verb",
                [field("phrase", phrase)],
            );
            return Ok(self.reject("unsafe_verb"));
        }
        for name in [&output.proposal.actor, &output.proposal.target]
            .into_iter()
            .flatten()
        {
            let known = allowed_actors.iter().any(|a| a == name)
                || executor
                    .ledger()
                    .db()
                    .character_exists(campaign_id, name)
                    .await?;
            if !known {
                return Ok(self.reject("unknown_actor"));
            }
        }

        // Lower to an execution request, then enrich the step args with
        // sheet-derived numbers the executor tools need.
        let request_id = format!("do-{}", Uuid::new_v4());
        let requires_confirmation =
            output.proposal.action.mutates_state() && self.features.executor_confirm;
        let mut request = match execution_request_from_llm_output(
            &output,
            scene_id,
            &request_id,
            requires_confirmation,
        ) {
            Ok(request) => request,
            Err(_) => return Ok(self.reject("invalid_schema")),
        };
        self.enrich(campaign_id, &output, &mut request).await?;

        let chain: ToolCallChain = tool_chain_from_execution_request(&request);
        let preview = match executor.execute_chain(&chain).await {
            Ok(preview) => preview,
            Err(e) => {
                self.metrics.log_event(
                    "orchestrator",
                    "preview.failed",
                    [field("reason", e.to_string())],
                );
                return Ok(self.reject("preview_failed"));
            }
        };

        self.metrics.inc_counter("orchestrator.format.sent", 1);
        let chain_json = serde_json::to_value(&chain).ok();
        Ok(OrchestratorResult {
            rejected: false,
            reason: None,
            mechanics: preview.mechanics_text(),
            narration: output.narration,
            execution_request: self.features.action_validation.then_some(request),
            chain_json,
        })
    }

    fn reject(&self, reason: &str) -> OrchestratorResult {
        self.metrics.inc_counter("llm.defense.rejected", 1);
        OrchestratorResult::rejection(reason)
    }

    async fn gather_facts(
        &self,
        executor: &Executor,
        campaign_id: i64,
        scene_id: i64,
        message: &str,
    ) -> Result<Vec<String>, OrchestratorError> {
        let mut transcripts = executor
            .ledger()
            .db()
            .recent_transcripts(scene_id, FACTS_LIMIT)
            .await?;
        transcripts.reverse(); // chronological order for the prompt
        let mut facts: Vec<String> = transcripts
            .into_iter()
            .map(|t| format!("{}: {}", t.author, t.content))
            .collect();
        if let Some(retriever) = &self.retriever {
            for snippet in retriever.retrieve(campaign_id, message, SNIPPET_LIMIT).await? {
                facts.push(format!("lore: {}", snippet.text));
            }
        }
        Ok(facts)
    }

    async fn enrich(
        &self,
        campaign_id: i64,
        output: &LlmOutput,
        request: &mut ExecutionRequest,
    ) -> Result<(), OrchestratorError> {
        let Some(step) = request.steps.first_mut() else {
            return Ok(());
        };
        match output.proposal.action {
            ProposalAction::AbilityCheck => {
                let actor = output.proposal.actor.as_deref().unwrap_or("");
                let ability = output.proposal.ability.as_deref().unwrap_or("STR");
                let block = self
                    .sheets
                    .ability_block(campaign_id, actor, ability)
                    .await?
                    .unwrap_or(AbilityBlock {
                        score: 10,
                        proficient: false,
                        expertise: false,
                        prof_bonus: 2,
                    });
                step.args.insert("score".to_string(), block.score.into());
                step.args
                    .insert("proficient".to_string(), block.proficient.into());
                step.args
                    .insert("expertise".to_string(), block.expertise.into());
                step.args
                    .insert("prof_bonus".to_string(), block.prof_bonus.into());
            }
            ProposalAction::Attack => {
                let actor = output.proposal.actor.as_deref().unwrap_or("");
                let target = output.proposal.target.as_deref().unwrap_or("");
                let profile = self
                    .sheets
                    .attack_profile(campaign_id, actor)
                    .await?
                    .unwrap_or(AttackProfile {
                        attack_bonus: 2,
                        damage: "1d6".to_string(),
                    });
                let ac = self
                    .sheets
                    .armor_class(campaign_id, target)
                    .await?
                    .unwrap_or(10);
                step.args
                    .insert("attack_bonus".to_string(), profile.attack_bonus.into());
                step.args
                    .insert("damage".to_string(), profile.damage.into());
                step.args.insert("target_ac".to_string(), ac.into());
            }
            ProposalAction::ApplyCondition
            | ProposalAction::RemoveCondition
            | ProposalAction::ClearCondition => {}
        }
        Ok(())
    }
}

fn build_messages(facts: &[String], message: &str) -> Vec<ChatMessage> {
    let facts_block = if facts.is_empty() {
        "(no prior context)".to_string()
    } else {
        facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    vec![ChatMessage::user(format!(
        "FACTS:\n{facts_block}\n\nPLAYER:\n{message}"
    ))]
}

fn find_unsafe_verb(output: &LlmOutput) -> Option<&'static str> {
    let mut haystack = output.narration.to_lowercase();
    if let Some(reason) = &output.proposal.reason {
        haystack.push('\n');
        haystack.push_str(&reason.to_lowercase());
    }
    UNSAFE_VERBS.iter().copied().find(|v| haystack.contains(v))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
