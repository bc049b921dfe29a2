// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures from dice and check evaluation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    /// The dice expression could not be parsed.
    #[error("invalid dice expression: {expr}")]
    InvalidExpression {
        /// The rejected expression.
        expr: String,
    },

    /// Dice count or sides outside the supported range.
    #[error("dice expression out of range: {expr}")]
    ExpressionOutOfRange {
        /// The rejected expression.
        expr: String,
    },

    /// The ability string is not one of the six known abilities.
    #[error("unknown ability: {name}")]
    UnknownAbility {
        /// The rejected ability name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Abilities
// ---------------------------------------------------------------------------

/// The six abilities the predicate gate and check tool accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum Ability {
    Str,
    Dex,
    Con,
    Int,
    Wis,
    Cha,
}

impl Ability {
    /// All abilities in canonical order.
    pub const ALL: [Ability; 6] = [
        Ability::Str,
        Ability::Dex,
        Ability::Con,
        Ability::Int,
        Ability::Wis,
        Ability::Cha,
    ];

    /// Uppercase short name (`STR`, `DEX`, …).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Ability::Str => "STR",
            Ability::Dex => "DEX",
            Ability::Con => "CON",
            Ability::Int => "INT",
            Ability::Wis => "WIS",
            Ability::Cha => "CHA",
        }
    }
}

impl FromStr for Ability {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STR" => Ok(Ability::Str),
            "DEX" => Ok(Ability::Dex),
            "CON" => Ok(Ability::Con),
            "INT" => Ok(Ability::Int),
            "WIS" => Ok(Ability::Wis),
            "CHA" => Ok(Ability::Cha),
            other => Err(RulesError::UnknownAbility {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Ability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ability modifier: `floor((score - 10) / 2)`.
#[must_use]
pub fn ability_modifier(score: i64) -> i64 {
    (score - 10).div_euclid(2)
}

// ---------------------------------------------------------------------------
// Dice
// ---------------------------------------------------------------------------

/// Result of evaluating a dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    /// The normalized expression that was rolled.
    pub expr: String,
    /// Individual die results. For advantage/disadvantage both d20s appear.
    pub rolls: Vec<i64>,
    /// Chosen die (or sum of dice) plus modifier.
    pub total: i64,
    /// Flat modifier from the expression.
    pub modifier: i64,
    /// Die size.
    pub sides: u32,
    /// Number of dice rolled by the expression (before advantage doubling).
    pub count: u32,
    /// Natural 20 on a single-d20 roll.
    pub crit: bool,
}

const MAX_DICE: u32 = 100;
const MAX_SIDES: u32 = 1000;

/// Parse `NdM`, `NdM+K`, or `NdM-K` (N defaults to 1).
fn parse_expr(expr: &str) -> Result<(u32, u32, i64), RulesError> {
    let s = expr.trim().to_ascii_lowercase();
    let invalid = || RulesError::InvalidExpression {
        expr: expr.to_string(),
    };

    let (dice_part, modifier) = match s.find(['+', '-']) {
        Some(pos) => {
            let m: i64 = s[pos..].parse().map_err(|_| invalid())?;
            (&s[..pos], m)
        }
        None => (s.as_str(), 0),
    };

    let d = dice_part.find('d').ok_or_else(invalid)?;
    let count: u32 = if dice_part[..d].is_empty() {
        1
    } else {
        dice_part[..d].parse().map_err(|_| invalid())?
    };
    let sides: u32 = dice_part[d + 1..].parse().map_err(|_| invalid())?;

    if count == 0 || sides < 2 || count > MAX_DICE || sides > MAX_SIDES {
        return Err(RulesError::ExpressionOutOfRange {
            expr: expr.to_string(),
        });
    }
    Ok((count, sides, modifier))
}

/// Deterministic-when-seeded dice roller.
#[derive(Debug)]
pub struct DiceRng {
    rng: StdRng,
}

impl DiceRng {
    /// Seeded for determinism, or entropy-seeded when `seed` is `None`.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    fn die(&mut self, sides: u32) -> i64 {
        self.rng.gen_range(1..=i64::from(sides))
    }

    /// Roll a dice expression.
    ///
    /// Advantage/disadvantage only applies to single-d20 expressions: two
    /// dice are rolled, both reported, and the max (advantage) or min
    /// (disadvantage) feeds the total. Both flags together cancel out.
    ///
    /// # Errors
    ///
    /// [`RulesError`] when the expression is malformed or out of range.
    pub fn roll(
        &mut self,
        expr: &str,
        advantage: bool,
        disadvantage: bool,
    ) -> Result<DiceRoll, RulesError> {
        let (count, sides, modifier) = parse_expr(expr)?;
        let adv_applies = count == 1 && sides == 20 && (advantage ^ disadvantage);

        let (rolls, picked) = if adv_applies {
            let a = self.die(sides);
            let b = self.die(sides);
            let pick = if advantage { a.max(b) } else { a.min(b) };
            (vec![a, b], pick)
        } else {
            let rolls: Vec<i64> = (0..count).map(|_| self.die(sides)).collect();
            let sum = rolls.iter().sum();
            (rolls, sum)
        };

        let crit = count == 1 && sides == 20 && picked == 20;
        Ok(DiceRoll {
            expr: expr.trim().to_ascii_lowercase(),
            total: picked + modifier,
            rolls,
            modifier,
            sides,
            count,
            crit,
        })
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Inputs to an ability check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInput {
    /// Ability being tested.
    pub ability: Ability,
    /// Ability score (not modifier).
    pub score: i64,
    /// Whether the actor is proficient.
    #[serde(default)]
    pub proficient: bool,
    /// Whether proficiency is doubled.
    #[serde(default)]
    pub expertise: bool,
    /// Proficiency bonus to apply when proficient.
    #[serde(default = "default_prof_bonus")]
    pub proficiency_bonus: i64,
    /// Difficulty class; `None` computes totals without a verdict.
    pub dc: Option<i64>,
    /// Roll two d20 and keep the higher.
    #[serde(default)]
    pub advantage: bool,
    /// Roll two d20 and keep the lower.
    #[serde(default)]
    pub disadvantage: bool,
}

fn default_prof_bonus() -> i64 {
    2
}

/// Outcome of an ability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// `picked d20 + mod (+ proficiency)`.
    pub total: i64,
    /// The d20 results that were rolled.
    pub d20: Vec<i64>,
    /// The d20 result that counted.
    pub pick: i64,
    /// Ability modifier plus any proficiency contribution.
    pub modifier: i64,
    /// `total >= dc`, when a DC was supplied.
    pub success: Option<bool>,
}

/// Resolve a check from pre-rolled d20s.
///
/// `d20_rolls` carries one die, or two when advantage or disadvantage
/// applied; the pick is the max/min accordingly.
#[must_use]
pub fn compute_check(input: &CheckInput, d20_rolls: &[i64]) -> CheckResult {
    let pick = if input.advantage && !input.disadvantage {
        d20_rolls.iter().copied().max().unwrap_or(1)
    } else if input.disadvantage && !input.advantage {
        d20_rolls.iter().copied().min().unwrap_or(1)
    } else {
        d20_rolls.first().copied().unwrap_or(1)
    };

    let mut modifier = ability_modifier(input.score);
    if input.proficient {
        let mult = if input.expertise { 2 } else { 1 };
        modifier += input.proficiency_bonus * mult;
    }

    let total = pick + modifier;
    CheckResult {
        total,
        d20: d20_rolls.to_vec(),
        pick,
        modifier,
        success: input.dc.map(|dc| total >= dc),
    }
}

// ---------------------------------------------------------------------------
// Ruleset capability
// ---------------------------------------------------------------------------

/// The rule-system capability consumed by the executor and orchestrator.
///
/// Implementations must be deterministic for a given `seed`.
pub trait Ruleset: Send + Sync {
    /// Evaluate a dice expression.
    fn roll_dice(
        &self,
        expr: &str,
        advantage: bool,
        disadvantage: bool,
        seed: Option<u64>,
    ) -> Result<DiceRoll, RulesError>;

    /// Roll the d20s and resolve an ability check.
    fn compute_check(&self, input: &CheckInput, seed: Option<u64>)
    -> Result<CheckResult, RulesError>;

    /// Roll damage for an attack. A crit doubles the number of dice
    /// rolled; the flat modifier is applied once.
    fn damage_roll(&self, expr: &str, crit: bool, seed: Option<u64>)
    -> Result<DiceRoll, RulesError>;
}

/// The shipped d20 ruleset.
#[derive(Debug, Clone, Copy, Default)]
pub struct D20Ruleset;

impl Ruleset for D20Ruleset {
    fn roll_dice(
        &self,
        expr: &str,
        advantage: bool,
        disadvantage: bool,
        seed: Option<u64>,
    ) -> Result<DiceRoll, RulesError> {
        DiceRng::new(seed).roll(expr, advantage, disadvantage)
    }

    fn compute_check(
        &self,
        input: &CheckInput,
        seed: Option<u64>,
    ) -> Result<CheckResult, RulesError> {
        let mut rng = DiceRng::new(seed);
        let n = if input.advantage ^ input.disadvantage {
            2
        } else {
            1
        };
        let d20_rolls: Vec<i64> = (0..n)
            .map(|_| rng.roll("1d20", false, false).map(|r| r.rolls[0]))
            .collect::<Result<_, _>>()?;
        Ok(compute_check(input, &d20_rolls))
    }

    fn damage_roll(
        &self,
        expr: &str,
        crit: bool,
        seed: Option<u64>,
    ) -> Result<DiceRoll, RulesError> {
        let (count, sides, modifier) = parse_expr(expr)?;
        let rolled_count = if crit { count * 2 } else { count };
        let mut rng = DiceRng::new(seed);
        let rolls: Vec<i64> = (0..rolled_count).map(|_| rng.die(sides)).collect();
        let sum: i64 = rolls.iter().sum();
        Ok(DiceRoll {
            expr: expr.trim().to_ascii_lowercase(),
            total: sum + modifier,
            rolls,
            modifier,
            sides,
            count: rolled_count,
            crit,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_expressions() {
        assert_eq!(parse_expr("1d20").unwrap(), (1, 20, 0));
        assert_eq!(parse_expr("2d6+3").unwrap(), (2, 6, 3));
        assert_eq!(parse_expr("1d8-1").unwrap(), (1, 8, -1));
        assert_eq!(parse_expr("d20").unwrap(), (1, 20, 0));
        assert_eq!(parse_expr(" 4D6 ").unwrap(), (4, 6, 0));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "20", "d", "xdy", "1d", "1d6+", "1d6++2"] {
            assert!(parse_expr(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(matches!(
            parse_expr("0d6"),
            Err(RulesError::ExpressionOutOfRange { .. })
        ));
        assert!(matches!(
            parse_expr("1d1"),
            Err(RulesError::ExpressionOutOfRange { .. })
        ));
        assert!(matches!(
            parse_expr("101d6"),
            Err(RulesError::ExpressionOutOfRange { .. })
        ));
    }

    #[test]
    fn seeded_rolls_are_deterministic() {
        let a = DiceRng::new(Some(42)).roll("3d6+2", false, false).unwrap();
        let b = DiceRng::new(Some(42)).roll("3d6+2", false, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rolls.len(), 3);
        assert_eq!(a.total, a.rolls.iter().sum::<i64>() + 2);
    }

    #[test]
    fn rolls_stay_in_die_range() {
        let mut rng = DiceRng::new(Some(7));
        for _ in 0..200 {
            let r = rng.roll("1d6", false, false).unwrap();
            assert!((1..=6).contains(&r.rolls[0]));
        }
    }

    #[test]
    fn advantage_picks_max_of_two() {
        let r = DiceRng::new(Some(3)).roll("1d20", true, false).unwrap();
        assert_eq!(r.rolls.len(), 2);
        assert_eq!(r.total, *r.rolls.iter().max().unwrap());
    }

    #[test]
    fn disadvantage_picks_min_of_two() {
        let r = DiceRng::new(Some(3)).roll("1d20", false, true).unwrap();
        assert_eq!(r.rolls.len(), 2);
        assert_eq!(r.total, *r.rolls.iter().min().unwrap());
    }

    #[test]
    fn advantage_and_disadvantage_cancel() {
        let r = DiceRng::new(Some(3)).roll("1d20", true, true).unwrap();
        assert_eq!(r.rolls.len(), 1);
    }

    #[test]
    fn advantage_ignored_for_non_d20() {
        let r = DiceRng::new(Some(3)).roll("2d6", true, false).unwrap();
        assert_eq!(r.rolls.len(), 2);
        assert_eq!(r.total, r.rolls.iter().sum::<i64>());
    }

    #[test]
    fn ability_modifier_table() {
        assert_eq!(ability_modifier(10), 0);
        assert_eq!(ability_modifier(11), 0);
        assert_eq!(ability_modifier(12), 1);
        assert_eq!(ability_modifier(15), 2);
        assert_eq!(ability_modifier(20), 5);
        assert_eq!(ability_modifier(8), -1);
        assert_eq!(ability_modifier(7), -2);
        assert_eq!(ability_modifier(1), -5);
    }

    #[test]
    fn ability_parsing() {
        assert_eq!("dex".parse::<Ability>().unwrap(), Ability::Dex);
        assert_eq!("STR".parse::<Ability>().unwrap(), Ability::Str);
        assert!(matches!(
            "LCK".parse::<Ability>(),
            Err(RulesError::UnknownAbility { .. })
        ));
    }

    #[test]
    fn check_math_with_proficiency() {
        let input = CheckInput {
            ability: Ability::Dex,
            score: 14,
            proficient: true,
            expertise: false,
            proficiency_bonus: 2,
            dc: Some(15),
            advantage: false,
            disadvantage: false,
        };
        let res = compute_check(&input, &[11]);
        // 11 + 2 (mod) + 2 (prof) = 15, meets the DC.
        assert_eq!(res.total, 15);
        assert_eq!(res.modifier, 4);
        assert_eq!(res.success, Some(true));
    }

    #[test]
    fn expertise_doubles_proficiency_only() {
        let input = CheckInput {
            ability: Ability::Int,
            score: 12,
            proficient: true,
            expertise: true,
            proficiency_bonus: 3,
            dc: None,
            advantage: false,
            disadvantage: false,
        };
        let res = compute_check(&input, &[10]);
        assert_eq!(res.modifier, 1 + 6);
        assert_eq!(res.success, None);
    }

    #[test]
    fn check_advantage_uses_higher_die() {
        let input = CheckInput {
            ability: Ability::Str,
            score: 10,
            proficient: false,
            expertise: false,
            proficiency_bonus: 2,
            dc: Some(10),
            advantage: true,
            disadvantage: false,
        };
        let res = compute_check(&input, &[4, 16]);
        assert_eq!(res.pick, 16);
        assert_eq!(res.success, Some(true));
    }

    #[test]
    fn ruleset_check_is_seed_deterministic() {
        let rs = D20Ruleset;
        let input = CheckInput {
            ability: Ability::Wis,
            score: 13,
            proficient: false,
            expertise: false,
            proficiency_bonus: 2,
            dc: Some(12),
            advantage: false,
            disadvantage: false,
        };
        let a = rs.compute_check(&input, Some(99)).unwrap();
        let b = rs.compute_check(&input, Some(99)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.d20.len(), 1);
    }

    #[test]
    fn crit_damage_doubles_dice_not_modifier() {
        let rs = D20Ruleset;
        let normal = rs.damage_roll("2d6+3", false, Some(5)).unwrap();
        let crit = rs.damage_roll("2d6+3", true, Some(5)).unwrap();
        assert_eq!(normal.rolls.len(), 2);
        assert_eq!(crit.rolls.len(), 4);
        assert_eq!(normal.modifier, 3);
        assert_eq!(crit.modifier, 3);
        assert_eq!(crit.total, crit.rolls.iter().sum::<i64>() + 3);
    }

    #[test]
    fn natural_twenty_flags_crit() {
        // Scan seeds until a natural 20 appears; determinism makes the
        // found seed stable across runs.
        let mut found = false;
        for seed in 0..500 {
            let r = DiceRng::new(Some(seed)).roll("1d20", false, false).unwrap();
            if r.rolls[0] == 20 {
                assert!(r.crit);
                found = true;
                break;
            }
        }
        assert!(found, "no natural 20 in 500 seeds");
    }

    #[test]
    fn check_input_serde_defaults() {
        let input: CheckInput =
            serde_json::from_str(r#"{"ability":"DEX","score":14,"dc":12}"#).unwrap();
        assert!(!input.proficient);
        assert_eq!(input.proficiency_bonus, 2);
        assert_eq!(input.ability, Ability::Dex);
    }
}
