// SPDX-License-Identifier: MIT OR Apache-2.0

//! The core tool handlers and their registration.

use crate::error::ExecutorError;
use crate::registry::{EventShape, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};
use saga_canonical::JsonMap;
use saga_folds::{EncounterStatus, fold_encounter_view};
use saga_rules::CheckInput;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

fn invalid(tool: &str, reason: impl Into<String>) -> ExecutorError {
    ExecutorError::InvalidArgs {
        tool: tool.to_string(),
        reason: reason.into(),
    }
}

fn require_str<'a>(tool: &str, args: &'a JsonMap, key: &str) -> Result<&'a str, ExecutorError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(tool, format!("'{key}' is required and must be a string")))
}

fn require_i64(tool: &str, args: &JsonMap, key: &str) -> Result<i64, ExecutorError> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(tool, format!("'{key}' is required and must be an integer")))
}

fn opt_i64(args: &JsonMap, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

fn opt_bool(args: &JsonMap, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn opt_seed(args: &JsonMap) -> Option<u64> {
    args.get("seed").and_then(Value::as_u64)
}

fn shape(event_type: &str, payload: JsonMap) -> EventShape {
    EventShape {
        event_type: event_type.to_string(),
        payload,
    }
}

fn entries(pairs: Vec<(&str, Value)>) -> JsonMap {
    pairs
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

// ---------------------------------------------------------------------------
// Dice and checks
// ---------------------------------------------------------------------------

fn roll_tool(
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let expr = require_str("roll", args, "expr")?;
    let roll = ctx.ruleset.roll_dice(
        expr,
        opt_bool(args, "advantage"),
        opt_bool(args, "disadvantage"),
        opt_seed(args),
    )?;
    Ok(ToolOutcome {
        mechanics: format!("Roll {} = {:?} total={}", roll.expr, roll.rolls, roll.total),
        predicted_events: Vec::new(),
    })
}

fn check_tool(
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let ability = require_str("check", args, "ability")?.parse()?;
    let input = CheckInput {
        ability,
        score: require_i64("check", args, "score")?,
        proficient: opt_bool(args, "proficient"),
        expertise: opt_bool(args, "expertise"),
        proficiency_bonus: opt_i64(args, "prof_bonus").unwrap_or(2),
        dc: opt_i64(args, "dc"),
        advantage: opt_bool(args, "advantage"),
        disadvantage: opt_bool(args, "disadvantage"),
    };
    let result = ctx.ruleset.compute_check(&input, opt_seed(args))?;

    let mechanics = match (input.dc, result.success) {
        (Some(dc), Some(ok)) => format!(
            "Check: {ability} vs DC {dc} total: {} ({})",
            result.total,
            if ok { "success" } else { "fail" }
        ),
        _ => format!("Check: {ability} total: {}", result.total),
    };

    let payload = entries(vec![
        ("ability", json!(ability.as_str())),
        ("score", json!(input.score)),
        ("dc", input.dc.map_or(Value::Null, |d| json!(d))),
        ("d20", json!(result.d20)),
        ("pick", json!(result.pick)),
        ("mod", json!(result.modifier)),
        ("total", json!(result.total)),
        ("success", result.success.map_or(Value::Null, |s| json!(s))),
    ]);
    Ok(ToolOutcome {
        mechanics,
        predicted_events: vec![shape("check.performed", payload)],
    })
}

fn attack_tool(
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("attack", args, "target")?;
    let target_ac = require_i64("attack", args, "target_ac")?;
    let damage_expr = require_str("attack", args, "damage")?;
    let attack_bonus = opt_i64(args, "attack_bonus").unwrap_or(0);
    let seed = opt_seed(args);

    let d20 = ctx.ruleset.roll_dice(
        "1d20",
        opt_bool(args, "advantage"),
        opt_bool(args, "disadvantage"),
        seed,
    )?;
    let natural = d20.total; // 1d20 carries no modifier
    let crit = d20.crit;
    let total = natural + attack_bonus;
    let hit = crit || (natural != 1 && total >= target_ac);

    if !hit {
        return Ok(ToolOutcome {
            mechanics: format!(
                "Attack vs AC {target_ac}: d20={natural}{attack_bonus:+} = {total} (miss)"
            ),
            predicted_events: vec![shape(
                "attack.missed",
                entries(vec![("target", json!(target))]),
            )],
        });
    }

    // Decouple the damage stream from the attack die while staying
    // deterministic under a caller-supplied seed.
    let damage = ctx
        .ruleset
        .damage_roll(damage_expr, crit, seed.map(|s| s.wrapping_add(1)))?;
    let amount = damage.total.max(1);
    let outcome = if crit { "crit" } else { "hit" };
    Ok(ToolOutcome {
        mechanics: format!(
            "Attack vs AC {target_ac}: d20={natural}{attack_bonus:+} = {total} ({outcome}); \
             damage {} = {:?} total={amount}",
            damage.expr, damage.rolls
        ),
        predicted_events: vec![shape(
            "apply_damage",
            entries(vec![("target", json!(target)), ("amount", json!(amount))]),
        )],
    })
}

// ---------------------------------------------------------------------------
// Direct state tools
// ---------------------------------------------------------------------------

fn apply_damage_tool(
    _ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("apply_damage", args, "target")?;
    let amount = require_i64("apply_damage", args, "amount")?;
    Ok(ToolOutcome {
        mechanics: format!("{target} takes {amount} damage"),
        predicted_events: vec![shape(
            "apply_damage",
            entries(vec![("target", json!(target)), ("amount", json!(amount))]),
        )],
    })
}

fn heal_tool(
    _ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("heal", args, "target")?;
    let amount = require_i64("heal", args, "amount")?;
    Ok(ToolOutcome {
        mechanics: format!("{target} heals {amount}"),
        predicted_events: vec![shape(
            "heal",
            entries(vec![("target", json!(target)), ("amount", json!(amount))]),
        )],
    })
}

fn apply_condition_tool(
    _ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("apply_condition", args, "target")?;
    let condition = require_str("apply_condition", args, "condition")?;
    let duration = opt_i64(args, "duration");
    let mechanics = match duration {
        Some(d) => format!("{target} gains {condition} for {d} ticks"),
        None => format!("{target} gains {condition}"),
    };
    Ok(ToolOutcome {
        mechanics,
        predicted_events: vec![shape(
            "condition.applied",
            entries(vec![
                ("target", json!(target)),
                ("condition", json!(condition)),
                ("duration", duration.map_or(Value::Null, |d| json!(d))),
            ]),
        )],
    })
}

fn remove_condition_tool(
    _ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("remove_condition", args, "target")?;
    let condition = require_str("remove_condition", args, "condition")?;
    Ok(ToolOutcome {
        mechanics: format!("{target} sheds one stack of {condition}"),
        predicted_events: vec![shape(
            "condition.removed",
            entries(vec![
                ("target", json!(target)),
                ("condition", json!(condition)),
            ]),
        )],
    })
}

fn clear_condition_tool(
    _ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let target = require_str("clear_condition", args, "target")?;
    let condition = require_str("clear_condition", args, "condition")?;
    Ok(ToolOutcome {
        mechanics: format!("{condition} cleared from {target}"),
        predicted_events: vec![shape(
            "condition.cleared",
            entries(vec![
                ("target", json!(target)),
                ("condition", json!(condition)),
            ]),
        )],
    })
}

// ---------------------------------------------------------------------------
// Encounter lifecycle
// ---------------------------------------------------------------------------

fn start_encounter_tool(
    _ctx: &ToolContext<'_>,
    _args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    Ok(ToolOutcome {
        mechanics: "Encounter started".to_string(),
        predicted_events: vec![shape("encounter.started", JsonMap::new())],
    })
}

fn add_combatant_tool(
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let name = require_str("add_combatant", args, "name")?;
    let hp = opt_i64(args, "hp").unwrap_or(0);
    let state = fold_encounter_view(ctx.scene_events).ok_or(ExecutorError::NoEncounter {
        scene_id: ctx.scene_id,
        reason: "start_encounter must run first".to_string(),
    })?;
    let combatant_id = state.combatants.len() as i64 + 1;
    Ok(ToolOutcome {
        mechanics: format!("Added {name} (combatant {combatant_id})"),
        predicted_events: vec![shape(
            "combatant.added",
            entries(vec![
                ("combatant_id", json!(combatant_id)),
                ("name", json!(name)),
                ("hp", json!(hp)),
            ]),
        )],
    })
}

fn set_initiative_tool(
    ctx: &ToolContext<'_>,
    args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let combatant_id = require_i64("set_initiative", args, "combatant_id")?;
    let initiative = require_i64("set_initiative", args, "initiative")?;
    let mut state = fold_encounter_view(ctx.scene_events).ok_or(ExecutorError::NoEncounter {
        scene_id: ctx.scene_id,
        reason: "start_encounter must run first".to_string(),
    })?;
    let combatant = state
        .combatants
        .iter_mut()
        .find(|c| c.id == combatant_id)
        .ok_or_else(|| {
            invalid(
                "set_initiative",
                format!("combatant {combatant_id} not in encounter"),
            )
        })?;
    combatant.initiative = Some(initiative);
    let name = combatant.name.clone();

    let mut predicted = vec![shape(
        "combatant.initiative_set",
        entries(vec![
            ("combatant_id", json!(combatant_id)),
            ("initiative", json!(initiative)),
        ]),
    )];
    // The last initiative completes setup and starts the first turn.
    let begins = state.status == EncounterStatus::Setup && state.initiative_complete();
    if begins {
        predicted.push(shape(
            "encounter.advanced",
            entries(vec![("round", json!(1)), ("turn_index", json!(0))]),
        ));
    }
    Ok(ToolOutcome {
        mechanics: if begins {
            format!("Initiative {initiative} for {name}; encounter begins")
        } else {
            format!("Initiative {initiative} for {name}")
        },
        predicted_events: predicted,
    })
}

fn next_turn_tool(
    ctx: &ToolContext<'_>,
    _args: &JsonMap,
    _dry_run: bool,
) -> Result<ToolOutcome, ExecutorError> {
    let state = fold_encounter_view(ctx.scene_events).ok_or(ExecutorError::NoEncounter {
        scene_id: ctx.scene_id,
        reason: "start_encounter must run first".to_string(),
    })?;
    if state.status != EncounterStatus::Active {
        return Err(ExecutorError::NoEncounter {
            scene_id: ctx.scene_id,
            reason: "encounter has not begun".to_string(),
        });
    }
    let count = state.combatants.len() as i64;
    let current = state.turn_index.unwrap_or(0);
    let (round, turn_index) = if current + 1 >= count {
        (state.round + 1, 0)
    } else {
        (state.round, current + 1)
    };
    let order = state.turn_order();
    let up_next = order
        .get(turn_index as usize)
        .and_then(|id| state.combatants.iter().find(|c| c.id == *id))
        .map_or_else(String::new, |c| c.name.clone());
    Ok(ToolOutcome {
        mechanics: format!("Round {round}, turn {turn_index}: {up_next}"),
        predicted_events: vec![shape(
            "encounter.advanced",
            entries(vec![
                ("round", json!(round)),
                ("turn_index", json!(turn_index)),
            ]),
        )],
    })
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register all core tools on a registry.
pub fn register_core_tools(registry: &mut ToolRegistry) {
    registry.register(ToolSpec {
        name: "roll",
        description: "Roll a dice expression like 2d6+3",
        args_schema: json!({
            "type": "object",
            "properties": {
                "expr": {"type": "string"},
                "advantage": {"type": "boolean"},
                "disadvantage": {"type": "boolean"},
                "seed": {"type": "integer"}
            },
            "required": ["expr"]
        }),
        handler: Box::new(roll_tool),
    });
    registry.register(ToolSpec {
        name: "check",
        description: "Resolve an ability check against a DC",
        args_schema: json!({
            "type": "object",
            "properties": {
                "ability": {"type": "string"},
                "score": {"type": "integer"},
                "dc": {"type": "integer"},
                "proficient": {"type": "boolean"},
                "expertise": {"type": "boolean"},
                "prof_bonus": {"type": "integer"},
                "advantage": {"type": "boolean"},
                "disadvantage": {"type": "boolean"},
                "seed": {"type": "integer"}
            },
            "required": ["ability", "score"]
        }),
        handler: Box::new(check_tool),
    });
    registry.register(ToolSpec {
        name: "attack",
        description: "Resolve an attack roll and damage against a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "target_ac": {"type": "integer"},
                "attack_bonus": {"type": "integer"},
                "damage": {"type": "string"},
                "advantage": {"type": "boolean"},
                "disadvantage": {"type": "boolean"},
                "seed": {"type": "integer"}
            },
            "required": ["target", "target_ac", "damage"]
        }),
        handler: Box::new(attack_tool),
    });
    registry.register(ToolSpec {
        name: "apply_damage",
        description: "Apply damage to a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "amount": {"type": "integer"}
            },
            "required": ["target", "amount"]
        }),
        handler: Box::new(apply_damage_tool),
    });
    registry.register(ToolSpec {
        name: "heal",
        description: "Heal a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "amount": {"type": "integer"}
            },
            "required": ["target", "amount"]
        }),
        handler: Box::new(heal_tool),
    });
    registry.register(ToolSpec {
        name: "apply_condition",
        description: "Apply a condition to a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "condition": {"type": "string"},
                "duration": {"type": "integer"}
            },
            "required": ["target", "condition"]
        }),
        handler: Box::new(apply_condition_tool),
    });
    registry.register(ToolSpec {
        name: "remove_condition",
        description: "Remove one stack of a condition from a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "condition": {"type": "string"}
            },
            "required": ["target", "condition"]
        }),
        handler: Box::new(remove_condition_tool),
    });
    registry.register(ToolSpec {
        name: "clear_condition",
        description: "Clear all stacks of a condition from a target",
        args_schema: json!({
            "type": "object",
            "properties": {
                "target": {"type": "string"},
                "condition": {"type": "string"}
            },
            "required": ["target", "condition"]
        }),
        handler: Box::new(clear_condition_tool),
    });
    registry.register(ToolSpec {
        name: "start_encounter",
        description: "Open a new encounter in the scene",
        args_schema: json!({"type": "object", "properties": {}}),
        handler: Box::new(start_encounter_tool),
    });
    registry.register(ToolSpec {
        name: "add_combatant",
        description: "Add a combatant to the encounter",
        args_schema: json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "hp": {"type": "integer"}
            },
            "required": ["name"]
        }),
        handler: Box::new(add_combatant_tool),
    });
    registry.register(ToolSpec {
        name: "set_initiative",
        description: "Record a combatant's initiative roll",
        args_schema: json!({
            "type": "object",
            "properties": {
                "combatant_id": {"type": "integer"},
                "initiative": {"type": "integer"}
            },
            "required": ["combatant_id", "initiative"]
        }),
        handler: Box::new(set_initiative_tool),
    });
    registry.register(ToolSpec {
        name: "next_turn",
        description: "Advance the encounter to the next turn",
        args_schema: json!({"type": "object", "properties": {}}),
        handler: Box::new(next_turn_tool),
    });
}

/// A registry pre-populated with the core tools.
#[must_use]
pub fn core_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_core_tools(&mut registry);
    registry
}
