//! Preference semantics: from a slot's preferences to its winners.
//!
//! Candidates are filtered in a fixed order (requires, acceptables minus
//! prohibits and rejects, better/worse, best, worst, indifferent) and the
//! procedure stops as soon as at most one candidate is left. Non-context
//! slots stop after the acceptable filter and may keep several values.
//!
//! For context slots below the top state the preferences that shaped the
//! outcome are collected in the slot's context-dependent preference set, so
//! learning can backtrace through the selection.

use std::collections::HashMap;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::memory::{ImpasseType, PrefId, PreferenceType, SlotId};
use crate::symbol::{SymbolId, TOP_GOAL_LEVEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Candidate,
    Conflicted,
}

/// Outcome of running preference semantics on a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotDecision {
    pub impasse: ImpasseType,
    /// Winners when `impasse` is `None`; the impasse items otherwise.
    pub candidates: Vec<PrefId>,
}

impl SlotDecision {
    fn new(impasse: ImpasseType, candidates: Vec<PrefId>) -> Self {
        Self {
            impasse,
            candidates,
        }
    }

    fn winners(candidates: Vec<PrefId>) -> Self {
        Self::new(ImpasseType::None, candidates)
    }
}

impl Kernel {
    fn add_to_cdps(&mut self, s: SlotId, p: PrefId, unique_value: bool) {
        if self.slots[s].add_to_cdps(&self.prefs, p, unique_value) {
            self.preference_add_ref(p);
        }
    }

    /// Empty a slot's CDPS and release the references it held.
    pub(crate) fn clear_cdps(&mut self, s: SlotId) -> KernelResult<()> {
        let Some(slot) = self.slots.get_mut(s) else {
            return Ok(());
        };
        for p in slot.take_cdps() {
            self.preference_remove_ref(p)?;
        }
        Ok(())
    }

    fn prefs_of(&self, s: SlotId, ty: PreferenceType) -> Vec<PrefId> {
        self.slots[s].preferences_of(ty).to_vec()
    }

    /// Preferences of `ty` whose value is `value`.
    fn prefs_with_value(&self, s: SlotId, ty: PreferenceType, value: SymbolId) -> Vec<PrefId> {
        self.slots[s]
            .preferences_of(ty)
            .iter()
            .copied()
            .filter(|&p| self.prefs[p].value == value)
            .collect()
    }

    /// Decide what a slot's preferences select.
    ///
    /// With `consistency` set the call has no side effects on the CDPS and
    /// an all-indifferent candidate set is returned whole instead of being
    /// narrowed by the exploration policy.
    pub(crate) fn run_preference_semantics(
        &mut self,
        s: SlotId,
        consistency: bool,
    ) -> KernelResult<SlotDecision> {
        let (is_context, id) = {
            let slot = &self.slots[s];
            (slot.isa_context_slot, slot.id)
        };
        let do_cdps = is_context
            && !consistency
            && self.symbols.level(id) > TOP_GOAL_LEVEL
            && self.learning.chunk_through_evaluation_rules();

        if do_cdps {
            self.clear_cdps(s)?;
        }

        if self.slots[s].has_no_preferences() {
            if !is_context {
                self.mark_slot_for_possible_removal(s);
            }
            return Ok(SlotDecision::winners(Vec::new()));
        }

        // Requires
        let requires = self.prefs_of(s, PreferenceType::Require);
        if !requires.is_empty() {
            let mut candidates: Vec<PrefId> = Vec::new();
            for p in requires {
                let value = self.prefs[p].value;
                if !candidates.iter().any(|&c| self.prefs[c].value == value) {
                    candidates.insert(0, p);
                }
            }
            if candidates.len() > 1 {
                return Ok(SlotDecision::new(ImpasseType::ConstraintFailure, candidates));
            }
            let value = self.prefs[candidates[0]].value;
            if !self
                .prefs_with_value(s, PreferenceType::Prohibit, value)
                .is_empty()
            {
                return Ok(SlotDecision::new(ImpasseType::ConstraintFailure, candidates));
            }
            return Ok(SlotDecision::winners(candidates));
        }

        // Acceptables, prohibits, rejects
        let prohibits = self.prefs_of(s, PreferenceType::Prohibit);
        let rejects = self.prefs_of(s, PreferenceType::Reject);
        let excluded: Vec<SymbolId> = prohibits
            .iter()
            .chain(&rejects)
            .map(|&p| self.prefs[p].value)
            .collect();
        let mut candidates: Vec<PrefId> = Vec::new();
        for p in self.prefs_of(s, PreferenceType::Acceptable) {
            let value = self.prefs[p].value;
            if excluded.contains(&value)
                || candidates.iter().any(|&c| self.prefs[c].value == value)
            {
                continue;
            }
            candidates.insert(0, p);
        }

        if !is_context {
            return Ok(SlotDecision::winners(candidates));
        }

        if do_cdps {
            for &p in prohibits.iter().chain(&rejects) {
                self.add_to_cdps(s, p, true);
            }
        }

        if let Some(done) = self.settled(s, &candidates, do_cdps)? {
            return Ok(done);
        }

        // Better / worse
        let betters = self.prefs_of(s, PreferenceType::Better);
        let worses = self.prefs_of(s, PreferenceType::Worse);
        if !betters.is_empty() || !worses.is_empty() {
            let mut marks: HashMap<SymbolId, Mark> = candidates
                .iter()
                .map(|&c| (self.prefs[c].value, Mark::Candidate))
                .collect();
            let pairs = |list: &[PrefId], loser_is_referent: bool| -> Vec<(SymbolId, SymbolId)> {
                list.iter()
                    .filter_map(|&p| {
                        let pref = &self.prefs[p];
                        let referent = pref.referent?;
                        Some(if loser_is_referent {
                            (pref.value, referent)
                        } else {
                            (referent, pref.value)
                        })
                    })
                    .collect()
            };
            // (winner, loser)
            let orderings: Vec<_> = pairs(&betters, true)
                .into_iter()
                .chain(pairs(&worses, false))
                .collect();
            for (winner, loser) in orderings {
                if winner == loser {
                    continue;
                }
                let (Some(&w), Some(&l)) = (marks.get(&winner), marks.get(&loser)) else {
                    continue;
                };
                if w == Mark::Candidate || l == Mark::Candidate {
                    marks.insert(loser, Mark::Conflicted);
                }
            }

            let mark_of = |k: &Kernel, c: PrefId| marks.get(&k.prefs[c].value).copied();
            if !candidates
                .iter()
                .any(|&c| mark_of(self, c) == Some(Mark::Candidate))
            {
                candidates.retain(|&c| mark_of(self, c) == Some(Mark::Conflicted));
                if do_cdps {
                    self.clear_cdps(s)?;
                }
                return Ok(SlotDecision::new(ImpasseType::Conflict, candidates));
            }

            candidates.retain(|&c| mark_of(self, c) != Some(Mark::Conflicted));
            if do_cdps {
                for &c in &candidates {
                    let value = self.prefs[c].value;
                    let supporting: Vec<PrefId> = betters
                        .iter()
                        .copied()
                        .filter(|&p| self.prefs[p].value == value)
                        .chain(
                            worses
                                .iter()
                                .copied()
                                .filter(|&p| self.prefs[p].referent == Some(value)),
                        )
                        .collect();
                    for p in supporting {
                        self.add_to_cdps(s, p, true);
                    }
                }
            }
        }

        if let Some(done) = self.settled(s, &candidates, do_cdps)? {
            return Ok(done);
        }

        // Bests
        let bests = self.prefs_of(s, PreferenceType::Best);
        if !bests.is_empty() {
            let best_values: Vec<SymbolId> = bests.iter().map(|&p| self.prefs[p].value).collect();
            let kept: Vec<PrefId> = candidates
                .iter()
                .copied()
                .filter(|&c| best_values.contains(&self.prefs[c].value))
                .collect();
            if !kept.is_empty() {
                if do_cdps {
                    for &c in &kept {
                        let value = self.prefs[c].value;
                        for p in self.prefs_with_value(s, PreferenceType::Best, value) {
                            self.add_to_cdps(s, p, true);
                        }
                    }
                }
                candidates = kept;
            }
        }

        if let Some(done) = self.settled(s, &candidates, do_cdps)? {
            return Ok(done);
        }

        // Worsts
        let worsts = self.prefs_of(s, PreferenceType::Worst);
        if !worsts.is_empty() {
            let worst_values: Vec<SymbolId> =
                worsts.iter().map(|&p| self.prefs[p].value).collect();
            let (rest, worst): (Vec<PrefId>, Vec<PrefId>) = candidates
                .iter()
                .partition(|&&c| !worst_values.contains(&self.prefs[c].value));
            if !rest.is_empty() {
                if do_cdps {
                    for c in worst {
                        let value = self.prefs[c].value;
                        for p in self.prefs_with_value(s, PreferenceType::Worst, value) {
                            self.add_to_cdps(s, p, true);
                        }
                    }
                }
                candidates = rest;
            }
        }

        if let Some(done) = self.settled(s, &candidates, do_cdps)? {
            return Ok(done);
        }

        // Indifferents
        let unary: Vec<SymbolId> = self
            .prefs_of(s, PreferenceType::UnaryIndifferent)
            .iter()
            .map(|&p| self.prefs[p].value)
            .collect();
        let numeric: Vec<SymbolId> = self
            .prefs_of(s, PreferenceType::NumericIndifferent)
            .iter()
            .map(|&p| self.prefs[p].value)
            .collect();
        let binary: Vec<(SymbolId, Option<SymbolId>)> = self
            .prefs_of(s, PreferenceType::BinaryIndifferent)
            .iter()
            .map(|&p| (self.prefs[p].value, self.prefs[p].referent))
            .collect();
        let values: Vec<SymbolId> = candidates.iter().map(|&c| self.prefs[c].value).collect();

        let mut some_numeric = false;
        let mut all_indifferent = true;
        for &v in &values {
            // Numeric indifference implies unary indifference.
            if numeric.contains(&v) {
                some_numeric = true;
                continue;
            }
            if unary.contains(&v) {
                continue;
            }
            let indifferent_to_all = values.iter().filter(|&&o| o != v).all(|&o| {
                binary
                    .iter()
                    .any(|&(a, b)| (a == v && b == Some(o)) || (a == o && b == Some(v)))
            });
            if !indifferent_to_all {
                all_indifferent = false;
                break;
            }
        }

        if !all_indifferent {
            if do_cdps {
                self.clear_cdps(s)?;
            }
            return Ok(SlotDecision::new(ImpasseType::Tie, candidates));
        }
        if consistency {
            return Ok(SlotDecision::winners(candidates));
        }

        let chosen = self.choose_according_to_policy(s, &candidates);
        if do_cdps {
            let value = self.prefs[chosen].value;
            let binary_touching: Vec<PrefId> = self
                .prefs_of(s, PreferenceType::BinaryIndifferent)
                .into_iter()
                .filter(|&p| {
                    self.prefs[p].value == value || self.prefs[p].referent == Some(value)
                })
                .collect();
            if some_numeric {
                for p in self.prefs_with_value(s, PreferenceType::NumericIndifferent, value) {
                    self.add_to_cdps(s, p, false);
                }
                for p in binary_touching {
                    let pref = &self.prefs[p];
                    let both_numeric = numeric.contains(&pref.value)
                        && pref.referent.is_some_and(|r| numeric.contains(&r));
                    if !both_numeric {
                        self.add_to_cdps(s, p, true);
                    }
                }
            } else {
                for p in self.prefs_with_value(s, PreferenceType::UnaryIndifferent, value) {
                    self.add_to_cdps(s, p, true);
                }
                for p in binary_touching {
                    self.add_to_cdps(s, p, true);
                }
            }
        }
        Ok(SlotDecision::winners(vec![chosen]))
    }

    /// Early exit once at most one candidate is left.
    fn settled(
        &mut self,
        s: SlotId,
        candidates: &[PrefId],
        do_cdps: bool,
    ) -> KernelResult<Option<SlotDecision>> {
        if candidates.len() > 1 {
            return Ok(None);
        }
        if candidates.is_empty() && do_cdps {
            self.clear_cdps(s)?;
        }
        Ok(Some(SlotDecision::winners(candidates.to_vec())))
    }
}
