// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool specifications and the registry dispatching to them.

use crate::error::ExecutorError;
use saga_canonical::JsonMap;
use saga_envelope::Event;
use saga_rules::Ruleset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The shape of an event a tool predicts it will emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventShape {
    /// Event type to append.
    pub event_type: String,
    /// Event payload (restricted JSON).
    pub payload: JsonMap,
}

/// Result of evaluating one tool step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Human-readable mechanics line.
    pub mechanics: String,
    /// Events this step will append when applied.
    pub predicted_events: Vec<EventShape>,
}

/// Read-only context a tool handler evaluates against.
///
/// `scene_events` already includes the predicted events of earlier steps
/// in the same chain, so encounter tools observe intra-chain effects.
pub struct ToolContext<'a> {
    /// The rule-system capability.
    pub ruleset: &'a dyn Ruleset,
    /// Scene history plus intra-chain predictions.
    pub scene_events: &'a [Event],
    /// Scene being executed in.
    pub scene_id: i64,
    /// Acting entity, when known.
    pub actor_id: Option<&'a str>,
}

/// Handler signature: pure with respect to the context; `dry_run` is
/// advisory (predictions must be identical either way).
pub type ToolHandler =
    Box<dyn Fn(&ToolContext<'_>, &JsonMap, bool) -> Result<ToolOutcome, ExecutorError> + Send + Sync>;

/// A registered tool.
pub struct ToolSpec {
    /// Registered name.
    pub name: &'static str,
    /// One-line description for catalogs.
    pub description: &'static str,
    /// JSON schema of the accepted arguments.
    pub args_schema: serde_json::Value,
    /// The handler.
    pub handler: ToolHandler,
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Name-keyed tool registry. Built once at wiring time and passed by
/// reference through the pipeline; lookups are O(log n) over a handful
/// of entries.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolSpec>,
}

impl ToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous spec of the same name.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name, spec);
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// All registered tools in name order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    /// Registered tool names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }
}
