// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found or unreadable.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// An override value could not be coerced to the field type.
    #[error("invalid override {key}={value}")]
    InvalidOverride {
        /// Variable name.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Feature flags gating each pipeline stage. All default to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Features {
    pub llm: bool,
    pub llm_visible: bool,
    pub executor: bool,
    pub executor_confirm: bool,
    pub events: bool,
    pub activity_log: bool,
    pub combat: bool,
    pub map: bool,
    pub action_validation: bool,
    pub predicate_gate: bool,
    pub planning_tiers: bool,
    pub mcp: bool,
    pub ask: bool,
    pub ask_nlu_rule_based: bool,
    pub ask_kb_lookup: bool,
    pub improbability_drive: bool,
    pub importer: bool,
}

/// Planner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlannerSettings {
    /// Maximum planning tier; clamped to at least 1.
    pub max_level: u8,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self { max_level: 1 }
    }
}

/// Encounter lock settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LockSettings {
    /// Advisory lock acquisition timeout in seconds.
    pub timeout_seconds: f64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { timeout_seconds: 3.0 }
    }
}

/// Top-level runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Settings {
    /// Database connection URL (SQLite for development, Postgres in
    /// production).
    pub database_url: String,
    /// Feature flags.
    pub features: Features,
    /// Planner tier settings.
    pub planner: PlannerSettings,
    /// Encounter lock settings.
    pub lock: LockSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            features: Features::default(),
            planner: PlannerSettings::default(),
            lock: LockSettings::default(),
        }
    }
}

impl Settings {
    /// Effective planning level: 1 unless planning tiers are enabled, in
    /// which case `planner.max_level` clamped to at least 1.
    #[must_use]
    pub fn planning_level(&self) -> u8 {
        if !self.features.planning_tiers {
            return 1;
        }
        self.planner.max_level.max(1)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Environment variable prefix for overrides (`SAGA_FEATURES_LLM`, …).
const ENV_PREFIX: &str = "SAGA_";

/// Load settings with fixed precedence: process environment > `.env`
/// file > TOML file > defaults.
///
/// Either path may be absent: a `None` TOML path starts from defaults; a
/// missing `.env` file is skipped silently (its presence is optional by
/// design, unlike an explicitly named TOML file).
///
/// # Errors
///
/// [`ConfigError`] on unreadable/unparsable files or invalid override
/// values.
pub fn load_settings(
    toml_path: Option<&Path>,
    dotenv_path: Option<&Path>,
) -> Result<Settings, ConfigError> {
    let mut settings = match toml_path {
        Some(p) => {
            let content =
                std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                    path: p.display().to_string(),
                })?;
            parse_toml(&content)?
        }
        None => Settings::default(),
    };

    if let Some(p) = dotenv_path
        && p.exists()
    {
        let mut dotenv_vars = BTreeMap::new();
        for item in dotenvy::from_path_iter(p).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })? {
            let (k, v) = item.map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })?;
            dotenv_vars.insert(k, v);
        }
        apply_overrides(&mut settings, |key| dotenv_vars.get(key).cloned())?;
    }

    apply_overrides(&mut settings, |key| std::env::var(key).ok())?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Parse a TOML string into [`Settings`].
///
/// # Errors
///
/// [`ConfigError::ParseError`] on malformed TOML or mistyped fields.
pub fn parse_toml(content: &str) -> Result<Settings, ConfigError> {
    toml::from_str::<Settings>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Apply `SAGA_*` overrides from an arbitrary key→value source.
///
/// # Errors
///
/// [`ConfigError::InvalidOverride`] when a value cannot be coerced.
pub fn apply_overrides(
    settings: &mut Settings,
    get: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = get(&format!("{ENV_PREFIX}DATABASE_URL")) {
        settings.database_url = v;
    }

    let flags: [(&str, &mut bool); 17] = [
        ("FEATURES_LLM", &mut settings.features.llm),
        ("FEATURES_LLM_VISIBLE", &mut settings.features.llm_visible),
        ("FEATURES_EXECUTOR", &mut settings.features.executor),
        (
            "FEATURES_EXECUTOR_CONFIRM",
            &mut settings.features.executor_confirm,
        ),
        ("FEATURES_EVENTS", &mut settings.features.events),
        ("FEATURES_ACTIVITY_LOG", &mut settings.features.activity_log),
        ("FEATURES_COMBAT", &mut settings.features.combat),
        ("FEATURES_MAP", &mut settings.features.map),
        (
            "FEATURES_ACTION_VALIDATION",
            &mut settings.features.action_validation,
        ),
        (
            "FEATURES_PREDICATE_GATE",
            &mut settings.features.predicate_gate,
        ),
        (
            "FEATURES_PLANNING_TIERS",
            &mut settings.features.planning_tiers,
        ),
        ("FEATURES_MCP", &mut settings.features.mcp),
        ("FEATURES_ASK", &mut settings.features.ask),
        (
            "FEATURES_ASK_NLU_RULE_BASED",
            &mut settings.features.ask_nlu_rule_based,
        ),
        (
            "FEATURES_ASK_KB_LOOKUP",
            &mut settings.features.ask_kb_lookup,
        ),
        (
            "FEATURES_IMPROBABILITY_DRIVE",
            &mut settings.features.improbability_drive,
        ),
        ("FEATURES_IMPORTER", &mut settings.features.importer),
    ];
    for (suffix, slot) in flags {
        let key = format!("{ENV_PREFIX}{suffix}");
        if let Some(v) = get(&key) {
            *slot = parse_bool(&key, &v)?;
        }
    }

    let key = format!("{ENV_PREFIX}PLANNER_MAX_LEVEL");
    if let Some(v) = get(&key) {
        settings.planner.max_level = v.parse().map_err(|_| ConfigError::InvalidOverride {
            key: key.clone(),
            value: v,
        })?;
    }

    let key = format!("{ENV_PREFIX}LOCK_TIMEOUT_SECONDS");
    if let Some(v) = get(&key) {
        settings.lock.timeout_seconds =
            v.parse().map_err(|_| ConfigError::InvalidOverride {
                key: key.clone(),
                value: v,
            })?;
    }

    Ok(())
}

/// Validate semantic constraints.
///
/// # Errors
///
/// [`ConfigError::ValidationError`] listing every violated constraint.
pub fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    let mut reasons = Vec::new();
    if settings.database_url.trim().is_empty() {
        reasons.push("database_url must not be empty".to_string());
    }
    if settings.planner.max_level < 1 {
        reasons.push("planner.max_level must be >= 1".to_string());
    }
    if settings.lock.timeout_seconds <= 0.0 {
        reasons.push("lock.timeout_seconds must be positive".to_string());
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
