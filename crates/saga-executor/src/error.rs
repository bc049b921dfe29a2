// SPDX-License-Identifier: MIT OR Apache-2.0

//! Executor failure taxonomy.

use saga_canonical::CanonicalError;
use saga_ledger::LedgerError;
use saga_rules::RulesError;

/// Failures from chain preview or application.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The chain references a tool missing from the registry.
    #[error("unknown tool: {name}")]
    UnknownTool {
        /// The unregistered name.
        name: String,
    },

    /// The chain's scene does not exist.
    #[error("unknown scene: {scene_id}")]
    UnknownScene {
        /// The missing scene id.
        scene_id: i64,
    },

    /// A tool's arguments failed validation.
    #[error("invalid args for {tool}: {reason}")]
    InvalidArgs {
        /// The tool being invoked.
        tool: String,
        /// What was wrong.
        reason: String,
    },

    /// A tool needs encounter state that the scene does not have yet.
    #[error("no encounter in scene {scene_id}: {reason}")]
    NoEncounter {
        /// Scene missing the encounter.
        scene_id: i64,
        /// What the tool needed.
        reason: String,
    },

    /// Rule evaluation failed (bad dice expression, unknown ability).
    #[error(transparent)]
    Rules(#[from] RulesError),

    /// Payload construction failed canonical validation.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// The ledger rejected or could not commit the append.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
