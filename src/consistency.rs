//! Where elaboration continues, and whether earlier decisions still hold.
//!
//! Between elaboration cycles the kernel looks for the shallowest goal with
//! pending matches. Moving up the stack, or reaching minor quiescence at a
//! level, is the moment to re-check the context decisions above: if the
//! installed operator is no longer what the preferences would select, it is
//! retracted and the phase ends early.

use crate::cycle::Phase;
use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::match_set::FiringType;
use crate::memory::{ImpasseType, SlotId};
use crate::symbol::{Level, SymbolId};

/// How the active goal moved since the previous elaboration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelChange {
    /// Only retractions for removed goals are pending.
    NilGoalRetractions,
    NewDecision,
    Lower,
    Same,
    Higher,
}

impl Kernel {
    /// Whether the selection in `s` is still what its preferences support.
    fn decision_consistent_with_current_preferences(
        &mut self,
        goal: SymbolId,
        s: SlotId,
    ) -> KernelResult<bool> {
        let current_operator = self.slots[s].wmes.first().map(|&w| self.wm[w].value);
        let has_lower = self.symbols.lower_goal(goal).is_some();

        let mut current_impasse = if has_lower {
            self.type_of_existing_impasse(goal)?
        } else {
            ImpasseType::None
        };
        // A selected operator under a no-change impasse still counts as a selection.
        if current_impasse == ImpasseType::NoChange && current_operator.is_some() {
            current_impasse = ImpasseType::None;
        }

        let decision = self.run_preference_semantics(s, true)?;
        if decision.impasse != current_impasse {
            tracing::debug!(
                goal = %self.symbols.display(goal),
                was = ?current_impasse,
                now = ?decision.impasse,
                "impasse type changed"
            );
            return Ok(false);
        }
        if current_impasse != ImpasseType::None {
            return Ok(true);
        }
        match current_operator {
            Some(op) => Ok(decision
                .candidates
                .iter()
                .any(|&c| self.prefs[c].value == op)),
            // No selection but a substate: the no-change must be re-decided.
            None => Ok(!has_lower),
        }
    }

    fn remove_current_decision(&mut self, s: SlotId) -> KernelResult<()> {
        let goal = self.slots[s].id;
        if let Some(&w) = self.slots[s].wmes.first() {
            tracing::info!(
                goal = %self.symbols.display(goal),
                operator = %self.symbols.display(self.wm[w].value),
                "retracting operator: selection no longer supported"
            );
        }
        self.remove_wmes_for_context_slot(s)?;
        if let Some(lower) = self.symbols.lower_goal(goal) {
            self.remove_existing_context_and_descendents(lower)?;
        }
        self.do_buffered_wm_and_ownership_changes()
    }

    /// Re-check changed context slots from the highest changed goal down to
    /// `level`. Returns `false` after retracting an inconsistent decision.
    fn check_context_slot_decisions(&mut self, level: Level) -> KernelResult<bool> {
        let mut next = self.tempmem.highest_goal_whose_context_changed;
        while let Some(goal) = next {
            if self.symbols.level(goal) > level {
                break;
            }
            if let Some(s) = self.symbols.operator_slot(goal).filter(|&s| self.slots.contains(s)) {
                let slot = &self.slots[s];
                let decided = self.symbols.lower_goal(goal).is_some() || !slot.wmes.is_empty();
                if decided
                    && slot.changed
                    && !self.decision_consistent_with_current_preferences(goal, s)?
                {
                    self.remove_current_decision(s)?;
                    return Ok(false);
                }
            }
            next = self.symbols.lower_goal(goal);
        }
        Ok(true)
    }

    fn goal_stack_consistent_through_goal(&mut self, goal: SymbolId) -> KernelResult<bool> {
        let level = self.symbols.level(goal);
        self.check_context_slot_decisions(level)
    }

    fn i_activity_at_goal(&self, goal: SymbolId) -> bool {
        self.symbols
            .goal(goal)
            .is_some_and(|g| !g.ms_i_assertions.is_empty() || !g.ms_retractions.is_empty())
    }

    /// Firing instantiation elaborations with none left to fire.
    fn minor_quiescence_at_goal(&self, goal: Option<SymbolId>) -> bool {
        self.recmem.firing_type == FiringType::Ie
            && !goal.is_some_and(|g| self.i_activity_at_goal(g))
    }

    fn active_production_type_at_goal(&self, goal: SymbolId) -> FiringType {
        if self.i_activity_at_goal(goal) {
            FiringType::Ie
        } else {
            FiringType::Pe
        }
    }

    /// Pending i-assertions or retractions anywhere, nil-goal ones included.
    fn any_i_activity(&self) -> bool {
        self.match_set.has_nil_goal_retractions()
            || self.goal_stack().into_iter().any(|g| self.i_activity_at_goal(g))
    }

    /// Shallowest goal at or below `start` with i-assertions or retractions.
    pub(crate) fn highest_active_goal_propose(&self, start: Option<SymbolId>) -> Option<SymbolId> {
        let mut next = start;
        while let Some(goal) = next {
            if self.i_activity_at_goal(goal) {
                return Some(goal);
            }
            next = self.symbols.lower_goal(goal);
        }
        None
    }

    /// Shallowest goal at or below `start` with any pending match change.
    pub(crate) fn highest_active_goal_apply(&self, start: Option<SymbolId>) -> Option<SymbolId> {
        let mut next = start;
        while let Some(goal) = next {
            let info = self.symbols.goal(goal)?;
            if !info.ms_i_assertions.is_empty()
                || !info.ms_o_assertions.is_empty()
                || !info.ms_retractions.is_empty()
            {
                return Some(goal);
            }
            next = info.lower_goal;
        }
        None
    }

    /// Reset the active-level cursor before a proposal or application phase.
    pub(crate) fn initialize_consistency_calculations_for_new_decision(&mut self) {
        self.decider.active_level = 0;
        self.decider.active_goal = None;
        for goal in self.goal_stack() {
            if let Some(info) = self.symbols.goal_mut(goal) {
                info.saved_firing_type = None;
            }
        }
    }

    /// Move the active-goal cursor and report how it moved.
    fn advance_active_goal(&mut self, active: Option<SymbolId>) -> LevelChange {
        self.decider.previous_active_goal = self.decider.active_goal;
        self.decider.previous_active_level = self.decider.active_level;
        self.decider.active_goal = active;
        self.decider.active_level = active.map_or(0, |g| self.symbols.level(g));

        let change = if active.is_none() {
            LevelChange::NilGoalRetractions
        } else if self.decider.previous_active_level == 0 {
            LevelChange::NewDecision
        } else {
            match self
                .decider
                .active_level
                .cmp(&self.decider.previous_active_level)
            {
                std::cmp::Ordering::Equal => LevelChange::Same,
                std::cmp::Ordering::Greater => LevelChange::Lower,
                std::cmp::Ordering::Less => LevelChange::Higher,
            }
        };
        tracing::trace!(
            ?change,
            level = self.decider.active_level,
            previous = self.decider.previous_active_level,
            "active level"
        );
        change
    }

    fn save_firing_type_on_previous_goal(&mut self) {
        let firing_type = self.recmem.firing_type;
        if let Some(info) = self
            .decider
            .previous_active_goal
            .and_then(|g| self.symbols.goal_mut(g))
        {
            info.saved_firing_type = Some(firing_type);
        }
    }

    /// Decide the next elaboration of an application phase, or end it.
    pub(crate) fn determine_highest_active_production_level_in_stack_apply(
        &mut self,
    ) -> KernelResult<()> {
        if !self.any_assertions_or_retractions_ready() {
            if self.minor_quiescence_at_goal(self.decider.bottom_goal) {
                if let Some(bottom) = self.decider.bottom_goal {
                    self.goal_stack_consistent_through_goal(bottom)?;
                }
            }
            self.cycle.current_phase = Phase::Output;
            return Ok(());
        }
        if self.check_for_max_elaborations(Phase::Output) {
            return Ok(());
        }

        let active = self.highest_active_goal_apply(self.decider.top_goal);
        match self.advance_active_goal(active) {
            LevelChange::NilGoalRetractions => self.recmem.firing_type = FiringType::Ie,
            LevelChange::NewDecision => {
                if let Some(goal) = active {
                    self.recmem.firing_type = self.active_production_type_at_goal(goal);
                }
            }
            LevelChange::Lower => {
                if let Some(previous) = self.decider.previous_active_goal {
                    if self.minor_quiescence_at_goal(Some(previous))
                        && !self.goal_stack_consistent_through_goal(previous)?
                    {
                        self.cycle.current_phase = Phase::Output;
                        return Ok(());
                    }
                }
                let Some(goal) = active else {
                    return Ok(());
                };
                // Returning to a level interrupted by higher activity.
                if let Some(saved) = self.symbols.goal(goal).and_then(|g| g.saved_firing_type) {
                    self.recmem.firing_type = saved;
                    return self.determine_highest_active_production_level_in_stack_apply();
                }
                self.recmem.firing_type = self.active_production_type_at_goal(goal);
            }
            LevelChange::Same => {
                let Some(goal) = active else {
                    return Ok(());
                };
                if self.minor_quiescence_at_goal(Some(goal))
                    && !self.goal_stack_consistent_through_goal(goal)?
                {
                    self.cycle.current_phase = Phase::Output;
                    return Ok(());
                }
                self.recmem.firing_type = self.active_production_type_at_goal(goal);
            }
            LevelChange::Higher => {
                self.save_firing_type_on_previous_goal();
                let Some(goal) = active else {
                    return Ok(());
                };
                if !self.goal_stack_consistent_through_goal(goal)? {
                    self.cycle.current_phase = Phase::Output;
                    return Ok(());
                }
                self.recmem.firing_type = self.active_production_type_at_goal(goal);
            }
        }
        Ok(())
    }

    /// Decide the next elaboration of a proposal phase, or end it.
    pub(crate) fn determine_highest_active_production_level_in_stack_propose(
        &mut self,
    ) -> KernelResult<()> {
        if !self.any_i_activity() && self.minor_quiescence_at_goal(self.decider.bottom_goal) {
            if let Some(bottom) = self.decider.bottom_goal {
                self.goal_stack_consistent_through_goal(bottom)?;
            }
            self.cycle.current_phase = Phase::Decision;
            return Ok(());
        }
        if self.check_for_max_elaborations(Phase::Decision) {
            return Ok(());
        }

        let active = self.highest_active_goal_propose(self.decider.top_goal);
        match self.advance_active_goal(active) {
            LevelChange::NilGoalRetractions | LevelChange::NewDecision | LevelChange::Same => {}
            LevelChange::Lower => {
                if let Some(previous) = self.decider.previous_active_goal {
                    if !self.goal_stack_consistent_through_goal(previous)? {
                        self.cycle.current_phase = Phase::Decision;
                        return Ok(());
                    }
                }
            }
            LevelChange::Higher => {
                self.save_firing_type_on_previous_goal();
                if let Some(goal) = active {
                    if !self.goal_stack_consistent_through_goal(goal)? {
                        self.cycle.current_phase = Phase::Decision;
                        return Ok(());
                    }
                }
            }
        }
        self.recmem.firing_type = FiringType::Ie;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::memory::{Preference, PreferenceType};
    use crate::production::{DeclaredSupport, ProductionBuilder};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    fn select(k: &mut Kernel, op: SymbolId) -> crate::memory::PrefId {
        let top = k.top_goal().unwrap();
        let operator = k.predefined.operator;
        let pref = Preference::new(PreferenceType::Acceptable, top, operator, op, None);
        let p = k.prefs.insert(pref);
        k.add_preference_to_tm(p);
        k.do_buffered_wm_and_ownership_changes().unwrap();
        k.do_decision_phase().unwrap();
        p
    }

    #[test]
    fn quiet_stack_goes_straight_to_decision() {
        let mut k = kernel();
        k.cycle.current_phase = Phase::Propose;
        k.initialize_consistency_calculations_for_new_decision();
        k.recmem.firing_type = FiringType::Ie;
        k.determine_highest_active_production_level_in_stack_propose().unwrap();
        assert_eq!(k.cycle.current_phase, Phase::Decision);
    }

    #[test]
    fn pending_proposal_activates_top_goal() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("propose")
                .state("<s>", "superstate", "nil")
                .make("<s>", "operator", "<o>", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        k.cycle.current_phase = Phase::Propose;
        k.initialize_consistency_calculations_for_new_decision();
        k.determine_highest_active_production_level_in_stack_propose().unwrap();
        assert_eq!(k.cycle.current_phase, Phase::Propose);
        assert_eq!(k.decider.active_goal, k.top_goal());
        assert_eq!(k.decider.active_level, 1);
        assert_eq!(k.recmem.firing_type, FiringType::Ie);
    }

    #[test]
    fn apply_phase_fires_o_assertions_as_pe() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("apply")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "superstate", "nil")
                .make("<s>", "done", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        k.cycle.current_phase = Phase::Apply;
        k.initialize_consistency_calculations_for_new_decision();
        k.recmem.firing_type = FiringType::Pe;
        k.determine_highest_active_production_level_in_stack_apply().unwrap();
        assert_eq!(k.cycle.current_phase, Phase::Apply);
        assert_eq!(k.recmem.firing_type, FiringType::Pe);
        assert_eq!(k.highest_active_goal_propose(k.top_goal()), None);
        assert_eq!(k.highest_active_goal_apply(k.top_goal()), k.top_goal());
    }

    #[test]
    fn selection_stays_while_supported() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let op = k.symbols.new_identifier('O', 1);
        select(&mut k, op);
        let s = k.symbols.operator_slot(top).unwrap();
        assert_eq!(k.slots[s].wmes.len(), 1);
        assert!(k.decision_consistent_with_current_preferences(top, s).unwrap());
    }

    #[test]
    fn unsupported_selection_is_retracted() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let op = k.symbols.new_identifier('O', 1);
        let p = select(&mut k, op);
        let s = k.symbols.operator_slot(top).unwrap();

        k.remove_preference_from_tm(p).unwrap();
        k.tempmem.highest_goal_whose_context_changed = Some(top);
        k.slots[s].changed = true;
        assert!(!k.goal_stack_consistent_through_goal(top).unwrap());
        assert!(k.slots[s].wmes.is_empty());
        assert!(k.wm.find(top, k.predefined.operator, op).is_none());
    }
}
