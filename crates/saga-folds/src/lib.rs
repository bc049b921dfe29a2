// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use saga_envelope::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn str_field<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event.payload.get(key).and_then(Value::as_str)
}

fn int_field(event: &Event, key: &str) -> Option<i64> {
    event.payload.get(key).and_then(Value::as_i64)
}

// ---------------------------------------------------------------------------
// HP view
// ---------------------------------------------------------------------------

/// Net hit-point deltas per target, starting from zero.
///
/// `apply_damage` subtracts `amount`, `heal` adds it; events missing
/// either field are skipped, and unknown event types are ignored.
#[must_use]
pub fn fold_hp_view(events: &[Event]) -> BTreeMap<String, i64> {
    let mut hp: BTreeMap<String, i64> = BTreeMap::new();
    for event in events {
        let delta = match event.event_type.as_str() {
            "apply_damage" => -1,
            "heal" => 1,
            _ => continue,
        };
        let (Some(target), Some(amount)) = (str_field(event, "target"), int_field(event, "amount"))
        else {
            continue;
        };
        *hp.entry(target.to_string()).or_insert(0) += delta * amount;
    }
    hp
}

// ---------------------------------------------------------------------------
// Conditions view
// ---------------------------------------------------------------------------

/// Stack count and optional remaining duration for one condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSlot {
    /// Times the condition has been applied, net of removals.
    pub stacks: u32,
    /// Duration recorded on the most recent application carrying one.
    pub duration: Option<i64>,
}

/// Condition stacks per target.
///
/// `condition.applied` increments the stack (and records `duration` when
/// present); `condition.removed` decrements, never below zero;
/// `condition.cleared` resets stacks to zero and duration to none.
#[must_use]
pub fn fold_conditions_view(
    events: &[Event],
) -> BTreeMap<String, BTreeMap<String, ConditionSlot>> {
    let mut view: BTreeMap<String, BTreeMap<String, ConditionSlot>> = BTreeMap::new();
    for event in events {
        let action = match event.event_type.as_str() {
            "condition.applied" | "condition.removed" | "condition.cleared" => {
                event.event_type.as_str()
            }
            _ => continue,
        };
        let (Some(target), Some(condition)) =
            (str_field(event, "target"), str_field(event, "condition"))
        else {
            continue;
        };
        let slot = view
            .entry(target.to_string())
            .or_default()
            .entry(condition.to_string())
            .or_default();
        match action {
            "condition.applied" => {
                slot.stacks += 1;
                if let Some(duration) = int_field(event, "duration") {
                    slot.duration = Some(duration);
                }
            }
            "condition.removed" => slot.stacks = slot.stacks.saturating_sub(1),
            _ => {
                slot.stacks = 0;
                slot.duration = None;
            }
        }
    }
    view
}

// ---------------------------------------------------------------------------
// Initiative view
// ---------------------------------------------------------------------------

/// Ordered initiative list.
///
/// `initiative.set` replaces the whole order (the re-sort event);
/// `initiative.update` rewrites one entry in place; `initiative.remove`
/// drops one. Insertion order is otherwise preserved.
#[must_use]
pub fn fold_initiative_view(events: &[Event]) -> Vec<(String, i64)> {
    let mut order: Vec<(String, i64)> = Vec::new();
    for event in events {
        match event.event_type.as_str() {
            "initiative.set" => {
                let Some(entries) = event.payload.get("order").and_then(Value::as_array) else {
                    continue;
                };
                order = entries
                    .iter()
                    .filter_map(|entry| {
                        let id = entry.get("id")?.as_str()?;
                        let init = entry.get("init")?.as_i64()?;
                        Some((id.to_string(), init))
                    })
                    .collect();
            }
            "initiative.update" => {
                let (Some(id), Some(init)) = (str_field(event, "id"), int_field(event, "init"))
                else {
                    continue;
                };
                if let Some(entry) = order.iter_mut().find(|(eid, _)| eid == id) {
                    entry.1 = init;
                }
            }
            "initiative.remove" => {
                let Some(id) = str_field(event, "id") else {
                    continue;
                };
                order.retain(|(eid, _)| eid != id);
            }
            _ => {}
        }
    }
    order
}

// ---------------------------------------------------------------------------
// Encounter view
// ---------------------------------------------------------------------------

/// Encounter lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterStatus {
    /// Started, waiting for combatants and initiative.
    Setup,
    /// All initiative set; turns advance.
    Active,
}

/// One combatant in the encounter read-model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatantState {
    /// Per-encounter id, assigned in insertion order starting at 1.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Starting hit points as declared at add time.
    pub hp: i64,
    /// Rolled initiative, once set.
    pub initiative: Option<i64>,
}

/// Encounter state derived purely from the event stream. The event
/// stream is the source of truth; there is no mutable encounter table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncounterState {
    /// Lifecycle phase.
    pub status: EncounterStatus,
    /// Combatants in insertion order.
    pub combatants: Vec<CombatantState>,
    /// Current round, starting at 1 on activation.
    pub round: i64,
    /// Index into the initiative-sorted turn order, once active.
    pub turn_index: Option<i64>,
}

impl EncounterState {
    /// Whether every combatant has an initiative value.
    #[must_use]
    pub fn initiative_complete(&self) -> bool {
        !self.combatants.is_empty() && self.combatants.iter().all(|c| c.initiative.is_some())
    }

    /// Combatant ids sorted by initiative, highest first; ties keep
    /// insertion order.
    #[must_use]
    pub fn turn_order(&self) -> Vec<i64> {
        let mut ranked: Vec<&CombatantState> = self.combatants.iter().collect();
        ranked.sort_by_key(|c| std::cmp::Reverse(c.initiative.unwrap_or(i64::MIN)));
        ranked.iter().map(|c| c.id).collect()
    }
}

/// Latest encounter state for a scene's event stream, if any encounter
/// was started.
#[must_use]
pub fn fold_encounter_view(events: &[Event]) -> Option<EncounterState> {
    let mut state: Option<EncounterState> = None;
    for event in events {
        match event.event_type.as_str() {
            "encounter.started" => {
                state = Some(EncounterState {
                    status: EncounterStatus::Setup,
                    combatants: Vec::new(),
                    round: 1,
                    turn_index: None,
                });
            }
            "combatant.added" => {
                let Some(enc) = state.as_mut() else { continue };
                let (Some(id), Some(name)) =
                    (int_field(event, "combatant_id"), str_field(event, "name"))
                else {
                    continue;
                };
                enc.combatants.push(CombatantState {
                    id,
                    name: name.to_string(),
                    hp: int_field(event, "hp").unwrap_or(0),
                    initiative: None,
                });
            }
            "combatant.initiative_set" => {
                let Some(enc) = state.as_mut() else { continue };
                let (Some(id), Some(initiative)) =
                    (int_field(event, "combatant_id"), int_field(event, "initiative"))
                else {
                    continue;
                };
                if let Some(combatant) = enc.combatants.iter_mut().find(|c| c.id == id) {
                    combatant.initiative = Some(initiative);
                }
            }
            "encounter.advanced" => {
                let Some(enc) = state.as_mut() else { continue };
                enc.status = EncounterStatus::Active;
                if let Some(round) = int_field(event, "round") {
                    enc.round = round;
                }
                enc.turn_index = int_field(event, "turn_index");
            }
            _ => {}
        }
    }
    state
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        let mut e = Event::genesis(1, Utc::now());
        e.event_type = event_type.to_string();
        e.payload = payload.as_object().cloned().unwrap_or_default();
        e
    }

    #[test]
    fn hp_fold_damage_and_heal() {
        let events = vec![
            event("apply_damage", json!({"target": "char-a", "amount": 8})),
            event("heal", json!({"target": "char-a", "amount": 3})),
            event("apply_damage", json!({"target": "char-b", "amount": 5})),
        ];
        let hp = fold_hp_view(&events);
        assert_eq!(hp["char-a"], -5);
        assert_eq!(hp["char-b"], -5);
    }

    #[test]
    fn hp_fold_ignores_unknown_types_and_malformed_payloads() {
        let events = vec![
            event("apply_damage", json!({"target": "a", "amount": 4})),
            event("future.event", json!({"target": "a", "amount": 100})),
            event("heal", json!({"amount": 2})), // no target
        ];
        let hp = fold_hp_view(&events);
        assert_eq!(hp["a"], -4);
        assert_eq!(hp.len(), 1);
    }

    #[test]
    fn conditions_fold_apply_and_remove() {
        let events = vec![
            event(
                "condition.applied",
                json!({"target": "char-a", "condition": "poisoned", "duration": 10}),
            ),
            event(
                "condition.applied",
                json!({"target": "char-a", "condition": "poisoned"}),
            ),
            event(
                "condition.removed",
                json!({"target": "char-a", "condition": "poisoned"}),
            ),
        ];
        let conds = fold_conditions_view(&events);
        let slot = conds["char-a"]["poisoned"];
        assert_eq!(slot.stacks, 1);
        assert_eq!(slot.duration, Some(10));
    }

    #[test]
    fn conditions_fold_clear_resets() {
        let events = vec![
            event(
                "condition.applied",
                json!({"target": "char-a", "condition": "blinded", "duration": 5}),
            ),
            event(
                "condition.cleared",
                json!({"target": "char-a", "condition": "blinded"}),
            ),
        ];
        let conds = fold_conditions_view(&events);
        let slot = conds["char-a"]["blinded"];
        assert_eq!(slot.stacks, 0);
        assert_eq!(slot.duration, None);
    }

    #[test]
    fn conditions_fold_never_goes_below_zero() {
        let events = vec![
            event(
                "condition.removed",
                json!({"target": "x", "condition": "stunned"}),
            ),
            event(
                "condition.removed",
                json!({"target": "x", "condition": "stunned"}),
            ),
        ];
        let conds = fold_conditions_view(&events);
        assert_eq!(conds["x"]["stunned"].stacks, 0);
    }

    #[test]
    fn initiative_fold_replay() {
        let events = vec![
            event(
                "initiative.set",
                json!({"order": [{"id": "char-a", "init": 12}, {"id": "char-b", "init": 15}]}),
            ),
            event("initiative.update", json!({"id": "char-a", "init": 18})),
            event("initiative.remove", json!({"id": "char-b"})),
        ];
        let order = fold_initiative_view(&events);
        assert_eq!(order, vec![("char-a".to_string(), 18)]);
    }

    #[test]
    fn initiative_set_replaces_order() {
        let events = vec![
            event("initiative.set", json!({"order": [{"id": "a", "init": 1}]})),
            event(
                "initiative.set",
                json!({"order": [{"id": "b", "init": 9}, {"id": "c", "init": 3}]}),
            ),
        ];
        let order = fold_initiative_view(&events);
        assert_eq!(
            order,
            vec![("b".to_string(), 9), ("c".to_string(), 3)]
        );
    }

    #[test]
    fn initiative_update_for_unknown_id_is_ignored() {
        let events = vec![
            event("initiative.set", json!({"order": [{"id": "a", "init": 1}]})),
            event("initiative.update", json!({"id": "ghost", "init": 20})),
        ];
        let order = fold_initiative_view(&events);
        assert_eq!(order, vec![("a".to_string(), 1)]);
    }

    #[test]
    fn encounter_fold_lifecycle() {
        let events = vec![
            event("encounter.started", json!({})),
            event("combatant.added", json!({"combatant_id": 1, "name": "A", "hp": 10})),
            event("combatant.added", json!({"combatant_id": 2, "name": "B", "hp": 7})),
            event(
                "combatant.initiative_set",
                json!({"combatant_id": 1, "initiative": 15}),
            ),
            event(
                "combatant.initiative_set",
                json!({"combatant_id": 2, "initiative": 12}),
            ),
            event("encounter.advanced", json!({"round": 1, "turn_index": 0})),
        ];
        let enc = fold_encounter_view(&events).expect("encounter exists");
        assert_eq!(enc.status, EncounterStatus::Active);
        assert_eq!(enc.combatants.len(), 2);
        assert!(enc.initiative_complete());
        assert_eq!(enc.turn_order(), vec![1, 2]);
        assert_eq!(enc.round, 1);
        assert_eq!(enc.turn_index, Some(0));
    }

    #[test]
    fn encounter_fold_before_start_is_none() {
        let events = vec![event("combatant.added", json!({"combatant_id": 1, "name": "A"}))];
        assert!(fold_encounter_view(&events).is_none());
    }

    #[test]
    fn encounter_turn_order_breaks_ties_by_insertion() {
        let events = vec![
            event("encounter.started", json!({})),
            event("combatant.added", json!({"combatant_id": 1, "name": "A", "hp": 0})),
            event("combatant.added", json!({"combatant_id": 2, "name": "B", "hp": 0})),
            event(
                "combatant.initiative_set",
                json!({"combatant_id": 1, "initiative": 10}),
            ),
            event(
                "combatant.initiative_set",
                json!({"combatant_id": 2, "initiative": 10}),
            ),
        ];
        let enc = fold_encounter_view(&events).expect("encounter exists");
        assert_eq!(enc.turn_order(), vec![1, 2]);
    }

    #[test]
    fn folds_compose_over_subsequences() {
        // A fold over the full stream equals folding a prefix and then
        // replaying the tail on top.
        let events = vec![
            event("apply_damage", json!({"target": "a", "amount": 2})),
            event("heal", json!({"target": "a", "amount": 1})),
            event("apply_damage", json!({"target": "a", "amount": 4})),
        ];
        let full = fold_hp_view(&events);
        let prefix = fold_hp_view(&events[..2]);
        let mut resumed = prefix;
        for event in &events[2..] {
            let tail = fold_hp_view(std::slice::from_ref(event));
            for (target, delta) in tail {
                *resumed.entry(target).or_insert(0) += delta;
            }
        }
        assert_eq!(full, resumed);
    }
}
