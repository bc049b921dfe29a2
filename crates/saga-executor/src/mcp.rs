// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature-flagged MCP adapter path.
//!
//! When `features.mcp` is on, tool dispatch routes through this mapping
//! layer instead of calling registry handlers directly. The adapter owns
//! its own tool-name vocabulary (the wire names an MCP server would
//! expose) but must produce results byte-identical to the legacy path;
//! parity tests pin that equivalence.

use crate::error::ExecutorError;
use crate::registry::{ToolContext, ToolOutcome, ToolSpec};
use saga_canonical::JsonMap;

/// Registry name → MCP wire name.
const MCP_TOOL_NAMES: &[(&str, &str)] = &[
    ("roll", "roll_dice"),
    ("check", "compute_check"),
    ("attack", "resolve_attack"),
    ("apply_damage", "apply_damage"),
    ("heal", "heal"),
    ("apply_condition", "apply_condition"),
    ("remove_condition", "remove_condition"),
    ("clear_condition", "clear_condition"),
    ("start_encounter", "start_encounter"),
    ("add_combatant", "add_combatant"),
    ("set_initiative", "set_initiative"),
    ("next_turn", "next_turn"),
];

/// The MCP wire name for a registry tool, when the adapter exposes it.
#[must_use]
pub fn wire_name(registry_name: &str) -> Option<&'static str> {
    MCP_TOOL_NAMES
        .iter()
        .find(|(name, _)| *name == registry_name)
        .map(|(_, wire)| *wire)
}

/// Invoke a tool through the adapter mapping.
///
/// # Errors
///
/// [`ExecutorError::UnknownTool`] when the adapter does not expose the
/// tool; otherwise whatever the underlying handler reports.
pub fn invoke(
    spec: &ToolSpec,
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    // Resolution goes through the wire vocabulary so a tool missing from
    // the adapter surface fails loudly rather than silently diverging.
    let _wire = wire_name(spec.name).ok_or_else(|| ExecutorError::UnknownTool {
        name: format!("mcp:{}", spec.name),
    })?;
    (spec.handler)(ctx, args, dry_run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_core_tool_has_a_wire_name() {
        let registry = crate::tools::core_registry();
        for name in registry.names() {
            assert!(wire_name(name).is_some(), "no MCP mapping for {name}");
        }
    }

    #[test]
    fn dice_tools_use_mcp_vocabulary() {
        assert_eq!(wire_name("roll"), Some("roll_dice"));
        assert_eq!(wire_name("check"), Some("compute_check"));
        assert_eq!(wire_name("nope"), None);
    }
}
