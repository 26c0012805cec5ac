//! Match-set bookkeeping between the match feed and recognition memory.
//!
//! Every assertion or retraction reported by the [`crate::matcher::MatchFeed`]
//! becomes a [`MatchSetChange`]. In `Operand2` mode assertions are filed on
//! the o-list or i-list of the deepest goal their token tested and
//! retractions on their instantiation's match goal, so the preference phase
//! can work one goal level at a time. Retractions whose goal is gone go to
//! the nil-goal list. `Legacy` mode keeps one flat list of each.

use serde::{Deserialize, Serialize};

use crate::kernel::{CycleMode, Kernel};
use crate::matcher::{MatchEvent, MatchToken};
use crate::memory::{Arena, InstId, MscId, ProdId};
use crate::production::{DeclaredSupport, ProductionKind};
use crate::symbol::{Level, SymbolId};

/// Which kind of productions an elaboration cycle fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FiringType {
    /// Instantiation elaborations: i-supported firings.
    #[default]
    Ie,
    /// Persistent elaborations: operator applications, o-supported firings.
    Pe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Assertion(FiringType),
    Retraction,
}

/// A pending change to the match set.
#[derive(Debug, Clone)]
pub struct MatchSetChange {
    pub kind: ChangeKind,
    pub prod: ProdId,
    pub token: MatchToken,
    /// The instantiation being retracted.
    pub inst: Option<InstId>,
    /// Goal the change is filed under; `None` for nil-goal retractions.
    pub goal: Option<SymbolId>,
    pub level: Level,
}

/// Pending match-set changes.
#[derive(Debug, Default)]
pub struct MatchSet {
    pub(crate) changes: Arena<MscId, MatchSetChange>,
    pub(crate) nil_goal_retractions: Vec<MscId>,
    pub(crate) postponed: Vec<MscId>,
    legacy_assertions: Vec<MscId>,
    legacy_retractions: Vec<MscId>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.changes.clear();
        self.nil_goal_retractions.clear();
        self.postponed.clear();
        self.legacy_assertions.clear();
        self.legacy_retractions.clear();
    }

    pub fn has_nil_goal_retractions(&self) -> bool {
        !self.nil_goal_retractions.is_empty()
    }

    /// All pending assertions as (production, goal, firing type).
    pub fn assertions(&self) -> Vec<(ProdId, Option<SymbolId>, FiringType)> {
        self.changes
            .iter()
            .filter_map(|(_, c)| match c.kind {
                ChangeKind::Assertion(ft) => Some((c.prod, c.goal, ft)),
                ChangeKind::Retraction => None,
            })
            .collect()
    }

    /// Instantiations waiting to be retracted.
    pub fn retractions(&self) -> Vec<InstId> {
        self.changes
            .iter()
            .filter(|(_, c)| c.kind == ChangeKind::Retraction)
            .filter_map(|(_, c)| c.inst)
            .collect()
    }
}

impl Kernel {
    fn operand2(&self) -> bool {
        self.config.cycle_mode == CycleMode::Operand2
    }

    /// Pull pending events from the match feed into the match set.
    pub(crate) fn process_match_events(&mut self) {
        let events = self.matcher.take_events(&self.symbols);
        for event in events {
            match event {
                MatchEvent::Assert { prod, token } => self.add_match(prod, token),
                MatchEvent::Retract { prod, token } => self.remove_match(prod, token),
            }
        }
    }

    fn goal_lists_mut(&mut self, goal: SymbolId) -> Option<&mut crate::symbol::GoalInfo> {
        self.symbols.goal_mut(goal)
    }

    /// Take a change out of whatever list holds it and free it.
    fn unlink_msc(&mut self, m: MscId) -> Option<MatchSetChange> {
        let change = self.match_set.changes.remove(m)?;
        if let Some(info) = change.goal.and_then(|g| self.goal_lists_mut(g)) {
            info.ms_o_assertions.retain(|&x| x != m);
            info.ms_i_assertions.retain(|&x| x != m);
            info.ms_retractions.retain(|&x| x != m);
        }
        let ms = &mut self.match_set;
        ms.nil_goal_retractions.retain(|&x| x != m);
        ms.postponed.retain(|&x| x != m);
        ms.legacy_assertions.retain(|&x| x != m);
        ms.legacy_retractions.retain(|&x| x != m);
        Some(change)
    }

    fn add_match(&mut self, prod: ProdId, token: MatchToken) {
        // Refraction: the same WMEs matching again cancel a pending retraction.
        let pending = self.match_set.changes.iter().find_map(|(m, c)| {
            let same = c.kind == ChangeKind::Retraction
                && c.prod == prod
                && c.inst
                    .and_then(|i| self.insts.get(i))
                    .is_some_and(|inst| inst.token.wmes == token.wmes);
            same.then_some(m)
        });
        if let Some(m) = pending {
            tracing::trace!(msc = %m, "removing tentative retraction");
            self.unlink_msc(m);
            return;
        }

        let Some(record) = self.productions.get(prod) else {
            return;
        };
        // A justification is built together with its first instantiation.
        if record.kind == ProductionKind::Justification
            && record
                .instantiations
                .iter()
                .any(|&i| self.insts.get(i).is_some_and(|x| x.token.wmes == token.wmes))
        {
            return;
        }
        let (name, interrupt) = (record.name.clone(), record.interrupt);

        let goal = token
            .matched_wmes()
            .filter_map(|w| self.wm.get(w))
            .map(|w| w.id)
            .filter(|&id| self.symbols.is_goal(id))
            .max_by_key(|&id| self.symbols.level(id))
            .or(self.decider.top_goal);
        let Some(goal) = goal else {
            tracing::warn!(production = %name, "match with no goal ignored");
            return;
        };
        let firing_type = self.classify_match(prod, &token);
        let level = self.symbols.level(goal);
        let m = self.match_set.changes.insert(MatchSetChange {
            kind: ChangeKind::Assertion(firing_type),
            prod,
            token,
            inst: None,
            goal: Some(goal),
            level,
        });
        if self.operand2() {
            if let Some(info) = self.goal_lists_mut(goal) {
                match firing_type {
                    FiringType::Pe => info.ms_o_assertions.push(m),
                    FiringType::Ie => info.ms_i_assertions.push(m),
                }
            }
        } else {
            self.match_set.legacy_assertions.push(m);
        }
        tracing::trace!(
            production = %name,
            ?firing_type,
            goal = %self.symbols.display(goal),
            "tentative assertion"
        );

        if interrupt {
            self.interrupt(&name);
        }
    }

    fn remove_match(&mut self, prod: ProdId, token: MatchToken) {
        let pending = self.match_set.changes.iter().find_map(|(m, c)| {
            (matches!(c.kind, ChangeKind::Assertion(_)) && c.prod == prod && c.token == token)
                .then_some(m)
        });
        if let Some(m) = pending {
            tracing::trace!(msc = %m, "removing tentative assertion");
            self.unlink_msc(m);
            return;
        }

        let Some(record) = self.productions.get(prod) else {
            return;
        };
        let inst = record
            .instantiations
            .iter()
            .copied()
            .find(|&i| self.insts.get(i).is_some_and(|x| x.token == token));
        let Some(inst) = inst else {
            if record.kind != ProductionKind::Justification {
                tracing::trace!(production = %record.name, "no instantiation to retract");
            }
            return;
        };

        self.file_retraction(prod, inst, token);
    }

    /// File a retraction of `inst` on its match goal, or on the nil-goal
    /// list when that goal has been removed.
    pub(crate) fn file_retraction(&mut self, prod: ProdId, inst: InstId, token: MatchToken) {
        let Some(record) = self.insts.get(inst) else {
            return;
        };
        let goal = record
            .match_goal
            .filter(|&g| self.symbols.ident(g).is_some_and(|i| i.link_count > 0));
        let level = goal.map(|g| self.symbols.level(g)).unwrap_or(0);
        let m = self.match_set.changes.insert(MatchSetChange {
            kind: ChangeKind::Retraction,
            prod,
            token,
            inst: Some(inst),
            goal,
            level,
        });
        if !self.operand2() {
            self.match_set.legacy_retractions.push(m);
        } else if let Some(info) = goal.and_then(|g| self.goal_lists_mut(g)) {
            info.ms_retractions.push(m);
        } else {
            self.match_set.nil_goal_retractions.push(m);
        }
    }

    /// Drop every pending change that belongs to `prod`.
    pub(crate) fn withdraw_production_matches(&mut self, prod: ProdId) {
        let mine: Vec<MscId> = self
            .match_set
            .changes
            .iter()
            .filter(|(_, c)| c.prod == prod)
            .map(|(m, _)| m)
            .collect();
        for m in mine {
            self.unlink_msc(m);
        }
    }

    /// Move the next assertion for the active goal and firing type onto the
    /// postponed list and return it.
    pub(crate) fn postpone_assertion(&mut self) -> Option<(ProdId, MatchToken)> {
        let m = if self.operand2() {
            let goal = self.decider.active_goal?;
            let firing_type = self.recmem.firing_type;
            let info = self.goal_lists_mut(goal)?;
            match firing_type {
                FiringType::Pe => info.ms_o_assertions.pop()?,
                FiringType::Ie => info.ms_i_assertions.pop()?,
            }
        } else {
            self.match_set.legacy_assertions.pop()?
        };
        self.match_set.postponed.push(m);
        let change = self.match_set.changes.get(m)?;
        Some((change.prod, change.token.clone()))
    }

    /// Forget the most recently postponed assertion; it fired or was skipped.
    pub(crate) fn consume_last_postponed_assertion(&mut self) {
        if let Some(m) = self.match_set.postponed.pop() {
            self.match_set.changes.remove(m);
        }
    }

    /// Put every postponed assertion back on the active goal's list.
    pub(crate) fn restore_postponed_assertions(&mut self) {
        let firing_type = self.recmem.firing_type;
        while let Some(m) = self.match_set.postponed.pop() {
            if !self.operand2() {
                self.match_set.legacy_assertions.push(m);
                continue;
            }
            let Some(goal) = self.decider.active_goal else {
                self.match_set.changes.remove(m);
                continue;
            };
            if let Some(change) = self.match_set.changes.get_mut(m) {
                change.goal = Some(goal);
            }
            if let Some(info) = self.goal_lists_mut(goal) {
                match firing_type {
                    FiringType::Pe => info.ms_o_assertions.push(m),
                    FiringType::Ie => info.ms_i_assertions.push(m),
                }
            }
        }
    }

    /// Next retraction for the active goal.
    pub(crate) fn get_next_retraction(&mut self) -> Option<InstId> {
        let m = if self.operand2() {
            if self.decider.active_level == 0 {
                return None;
            }
            let goal = self.decider.active_goal?;
            self.goal_lists_mut(goal)?.ms_retractions.pop()?
        } else {
            self.match_set.legacy_retractions.pop()?
        };
        self.match_set.changes.remove(m).and_then(|c| c.inst)
    }

    /// Next retraction whose goal has been removed.
    pub(crate) fn get_next_nil_goal_retraction(&mut self) -> Option<InstId> {
        let m = self.match_set.nil_goal_retractions.pop()?;
        self.match_set.changes.remove(m).and_then(|c| c.inst)
    }

    /// Whether any goal has pending assertions or retractions.
    pub fn any_assertions_or_retractions_ready(&self) -> bool {
        if !self.operand2() {
            return !self.match_set.legacy_assertions.is_empty()
                || !self.match_set.legacy_retractions.is_empty();
        }
        if self.match_set.has_nil_goal_retractions() {
            return true;
        }
        let mut goal = self.decider.bottom_goal;
        while let Some(g) = goal {
            let Some(info) = self.symbols.goal(g) else {
                break;
            };
            if !info.ms_o_assertions.is_empty()
                || !info.ms_i_assertions.is_empty()
                || !info.ms_retractions.is_empty()
            {
                return true;
            }
            goal = info.higher_goal;
        }
        false
    }

    /// Move a removed goal's pending retractions to the nil-goal list.
    pub(crate) fn transfer_retractions_to_nil_goal(&mut self, goal: SymbolId) {
        let Some(info) = self.goal_lists_mut(goal) else {
            return;
        };
        let moved = std::mem::take(&mut info.ms_retractions);
        for &m in &moved {
            if let Some(change) = self.match_set.changes.get_mut(m) {
                change.goal = None;
            }
        }
        // The goal's list goes in front (at the popping end).
        self.match_set.nil_goal_retractions.extend(moved);
    }

    /// Firing type an undeclared production's match would get.
    pub(crate) fn declared_firing_type(&self, prod: ProdId) -> Option<FiringType> {
        match self.productions.get(prod)?.declared_support {
            DeclaredSupport::OSupport => Some(FiringType::Pe),
            DeclaredSupport::ISupport => Some(FiringType::Ie),
            DeclaredSupport::Undeclared => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::RunType;
    use crate::kernel::KernelConfig;
    use crate::memory::PreferenceType;
    use crate::production::ProductionBuilder;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn proposal_is_filed_as_ie_on_top_goal() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("propose")
                .state("<s>", "superstate", "nil")
                .make("<s>", "operator", "<o>", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        let top = k.top_goal().unwrap();
        let pending = k.match_set.assertions();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, Some(top));
        assert_eq!(pending[0].2, FiringType::Ie);
        assert!(k.any_assertions_or_retractions_ready());
    }

    #[test]
    fn declared_o_support_is_filed_as_pe() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("apply")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "superstate", "nil")
                .make("<s>", "done", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        let pending = k.match_set.assertions();
        assert_eq!(pending[0].2, FiringType::Pe);
    }

    #[test]
    fn postpone_and_restore_round_trip() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("elab")
                .state("<s>", "superstate", "nil")
                .make("<s>", "x", "1", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        k.decider.active_goal = k.top_goal();
        k.decider.active_level = 1;
        k.recmem.firing_type = FiringType::Ie;
        let (prod, _) = k.postpone_assertion().unwrap();
        assert_eq!(k.production_by_id(prod).unwrap().name, "elab");
        assert!(k.postpone_assertion().is_none());
        k.restore_postponed_assertions();
        assert!(k.postpone_assertion().is_some());
        k.consume_last_postponed_assertion();
        assert!(k.match_set.is_empty());
        assert!(!k.any_assertions_or_retractions_ready());
    }

    #[test]
    fn excise_withdraws_pending_assertions() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("elab")
                .state("<s>", "superstate", "nil")
                .make("<s>", "x", "1", PreferenceType::Acceptable),
        )
        .unwrap();
        k.do_buffered_wm_changes().unwrap();
        assert_eq!(k.match_set.len(), 1);
        k.excise_production("elab").unwrap();
        assert!(k.match_set.is_empty());
        assert!(k.production("elab").is_none());
    }

    #[test]
    fn excising_a_fired_production_files_its_retraction() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("elab")
                .state("<s>", "superstate", "nil")
                .make("<s>", "x", "1", PreferenceType::Acceptable),
        )
        .unwrap();
        k.run(1, RunType::Decisions).unwrap();
        let inst = k.production("elab").unwrap().instantiations[0];

        k.excise_production("elab").unwrap();
        assert!(k.any_assertions_or_retractions_ready());
        let top = k.top_goal().unwrap();
        let pending = &k.symbols.goal(top).unwrap().ms_retractions;
        assert_eq!(pending.len(), 1);
        assert_eq!(k.match_set.changes[pending[0]].inst, Some(inst));
    }
}
