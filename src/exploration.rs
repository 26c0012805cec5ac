//! Choosing among mutually indifferent operators.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;
use crate::memory::{PrefId, PreferenceType, SlotId};

/// How the decider picks one of several indifferent candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExplorationPolicy {
    /// The first candidate in candidate order. Deterministic.
    #[default]
    First,
    /// Uniformly at random.
    Random,
    /// Highest numeric value, ties broken at random.
    Greedy,
}

impl std::str::FromStr for ExplorationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Self::First),
            "random" => Ok(Self::Random),
            "greedy" => Ok(Self::Greedy),
            other => Err(format!("unknown exploration policy '{other}'")),
        }
    }
}

impl Kernel {
    /// Sum of the numeric-indifferent and binary-indifferent referents
    /// attached to the candidate's value. Stored on the candidate.
    pub(crate) fn compute_value_of_candidate(&mut self, s: SlotId, cand: PrefId) -> f64 {
        let value = self.prefs[cand].value;
        let slot = &self.slots[s];
        let total: f64 = [
            PreferenceType::NumericIndifferent,
            PreferenceType::BinaryIndifferent,
        ]
        .into_iter()
        .flat_map(|ty| slot.preferences_of(ty).iter().copied())
        .filter_map(|p| self.prefs.get(p))
        .filter(|p| p.value == value)
        .filter_map(|p| p.referent.and_then(|r| self.symbols.as_f64(r)))
        .sum();
        self.prefs[cand].numeric_value = total;
        total
    }

    /// Pick one of `candidates` (non-empty) according to the configured policy.
    pub(crate) fn choose_according_to_policy(
        &mut self,
        s: SlotId,
        candidates: &[PrefId],
    ) -> PrefId {
        let values: Vec<f64> = candidates
            .iter()
            .map(|&c| self.compute_value_of_candidate(s, c))
            .collect();
        let chosen = match self.config.exploration {
            ExplorationPolicy::First => candidates[0],
            ExplorationPolicy::Random => candidates[self.rng.gen_range(0..candidates.len())],
            ExplorationPolicy::Greedy => {
                let best = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let top: Vec<PrefId> = candidates
                    .iter()
                    .zip(&values)
                    .filter(|&(_, &v)| v == best)
                    .map(|(&c, _)| c)
                    .collect();
                top[self.rng.gen_range(0..top.len())]
            }
        };
        tracing::debug!(
            policy = ?self.config.exploration,
            candidates = candidates.len(),
            chosen = %self.symbols.display(self.prefs[chosen].value),
            "indifferent selection"
        );
        chosen
    }
}
