//! Fate rolls for chosen actions.
//!
//! Every action option carries a chance of a good and a bad side effect.
//! A single uniform draw in [0, 100) decides which band it lands in:
//!
//! ```text
//! 0 ........ bad ........ bad+good ........ 100
//! [   bad    )[    good    )[    neutral     )
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound for either chance on an option.
pub const MAX_CHANCE: u8 = 50;

/// An action the player may choose, with its side-effect odds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOption {
    pub text: String,
    pub good_chance: u8,
    pub bad_chance: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub good_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bad_hint: Option<String>,
}

impl ActionOption {
    /// Create an option, clamping both chances into [0, 50].
    pub fn new(text: impl Into<String>, good_chance: i64, bad_chance: i64) -> Self {
        Self {
            text: text.into(),
            good_chance: clamp_chance(good_chance),
            bad_chance: clamp_chance(bad_chance),
            good_hint: None,
            bad_hint: None,
        }
    }

    pub fn with_hints(mut self, good: Option<String>, bad: Option<String>) -> Self {
        self.good_hint = good;
        self.bad_hint = bad;
        self
    }
}

/// Clamp an arbitrary chance value into the allowed range.
pub fn clamp_chance(value: i64) -> u8 {
    value.clamp(0, MAX_CHANCE as i64) as u8
}

/// Which band a fate roll landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FateOutcome {
    Good,
    Bad,
    Neutral,
}

/// Outcome of a fate roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FateResult {
    pub outcome: FateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl FateResult {
    pub fn is_neutral(&self) -> bool {
        self.outcome == FateOutcome::Neutral
    }
}

/// Resolve an option against a draw in [0, 100).
///
/// Both band edges are exclusive: a draw equal to `bad_chance` is good, and
/// a draw equal to `bad_chance + good_chance` is neutral.
pub fn resolve_fate(option: &ActionOption, draw: f64) -> FateResult {
    let bad = f64::from(option.bad_chance);
    let good = f64::from(option.good_chance);

    if draw < bad {
        FateResult {
            outcome: FateOutcome::Bad,
            hint: option.bad_hint.clone(),
        }
    } else if draw < bad + good {
        FateResult {
            outcome: FateOutcome::Good,
            hint: option.good_hint.clone(),
        }
    } else {
        FateResult {
            outcome: FateOutcome::Neutral,
            hint: None,
        }
    }
}

/// Roll fate for an option with the thread RNG.
pub fn roll_fate(option: &ActionOption) -> FateResult {
    roll_fate_with_rng(option, &mut rand::thread_rng())
}

/// Roll fate with a specific RNG (useful for testing).
pub fn roll_fate_with_rng<R: Rng>(option: &ActionOption, rng: &mut R) -> FateResult {
    resolve_fate(option, rng.gen_range(0.0..100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn option() -> ActionOption {
        ActionOption::new("Pick the lock", 30, 20).with_hints(
            Some("The door swings open quietly".to_string()),
            Some("The pick snaps".to_string()),
        )
    }

    #[test]
    fn test_band_boundaries() {
        let opt = option();
        assert_eq!(resolve_fate(&opt, 19.9).outcome, FateOutcome::Bad);
        assert_eq!(resolve_fate(&opt, 20.0).outcome, FateOutcome::Good);
        assert_eq!(resolve_fate(&opt, 49.9).outcome, FateOutcome::Good);
        assert_eq!(resolve_fate(&opt, 50.0).outcome, FateOutcome::Neutral);
        assert_eq!(resolve_fate(&opt, 99.99).outcome, FateOutcome::Neutral);
    }

    #[test]
    fn test_hints_follow_outcome() {
        let opt = option();
        assert_eq!(resolve_fate(&opt, 0.0).hint.as_deref(), Some("The pick snaps"));
        assert_eq!(
            resolve_fate(&opt, 25.0).hint.as_deref(),
            Some("The door swings open quietly")
        );
        assert!(resolve_fate(&opt, 75.0).hint.is_none());
    }

    #[test]
    fn test_zero_chances_always_neutral() {
        let opt = ActionOption::new("Wait", 0, 0);
        assert!(resolve_fate(&opt, 0.0).is_neutral());
    }

    #[test]
    fn test_chances_are_clamped() {
        let opt = ActionOption::new("Leap the chasm", 80, -5);
        assert_eq!(opt.good_chance, 50);
        assert_eq!(opt.bad_chance, 0);
    }

    #[test]
    fn test_band_membership_for_all_integer_draws() {
        let opt = option();
        for draw in 0..100 {
            let outcome = resolve_fate(&opt, draw as f64).outcome;
            let expected = if draw < 20 {
                FateOutcome::Bad
            } else if draw < 50 {
                FateOutcome::Good
            } else {
                FateOutcome::Neutral
            };
            assert_eq!(outcome, expected, "draw {draw}");
        }
    }

    #[test]
    fn test_seeded_roll_is_deterministic() {
        let opt = option();
        let a = roll_fate_with_rng(&opt, &mut StdRng::seed_from_u64(7));
        let b = roll_fate_with_rng(&opt, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
