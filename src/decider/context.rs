//! Context decisions: installing winners, creating and removing substates.

use std::collections::{HashMap, HashSet};

use crate::cycle::DiagnosticKind;
use crate::error::{DeciderError, KernelResult};
use crate::kernel::Kernel;
use crate::memory::{
    BacktraceInfo, ImpasseType, Instantiation, PrefId, Preference, PreferenceType, SlotId, WmeId,
};
use crate::symbol::{GoalInfo, SymbolId, TOP_GOAL_LEVEL};

impl Kernel {
    fn add_impasse_wme(
        &mut self,
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
        preference: Option<PrefId>,
    ) -> WmeId {
        let w = self.wm.make_wme(id, attr, value, false);
        if let Some(goal) = self.symbols.goal_mut(id) {
            goal.impasse_wmes.push(w);
        }
        self.wm[w].preference = preference;
        self.add_wme_to_wm(w);
        w
    }

    /// Create a new state identifier with its architectural WMEs.
    fn create_new_impasse(
        &mut self,
        object: SymbolId,
        attr: Option<SymbolId>,
        impasse_type: ImpasseType,
        level: crate::symbol::Level,
    ) -> SymbolId {
        let id = self.symbols.new_identifier('S', level);
        if let Some(info) = self.symbols.ident_mut(id) {
            info.goal = Some(Box::new(GoalInfo::default()));
        }
        self.post_link_addition(None, id);

        let p = self.predefined;
        self.add_impasse_wme(id, p.type_, p.state, None);
        self.add_impasse_wme(id, p.superstate, object, None);
        if let Some(attr) = attr {
            self.add_impasse_wme(id, p.attribute, attr, None);
        }
        let impasse_and_choices = match impasse_type {
            ImpasseType::None => None,
            ImpasseType::ConstraintFailure => Some((p.constraint_failure, p.none)),
            ImpasseType::Conflict => Some((p.conflict, p.multiple)),
            ImpasseType::Tie => Some((p.tie, p.multiple)),
            ImpasseType::NoChange => Some((p.no_change, p.none)),
        };
        if let Some((impasse, choices)) = impasse_and_choices {
            self.add_impasse_wme(id, p.impasse, impasse, None);
            self.add_impasse_wme(id, p.choices, choices, None);
        }
        self.make_slot(id, p.operator);
        id
    }

    /// Build the preference backing a `(goal ^item value)` WME: an acceptable
    /// preference from an architectural instantiation whose one condition is
    /// the supercontext's acceptable-preference WME for that value.
    fn make_fake_preference_for_goal_item(
        &mut self,
        goal: SymbolId,
        cand: PrefId,
    ) -> KernelResult<PrefId> {
        let (slot, value) = {
            let c = &self.prefs[cand];
            (c.slot, c.value)
        };
        let ap_wme = slot
            .and_then(|s| self.slots.get(s))
            .and_then(|s| {
                s.acceptable_preference_wmes
                    .iter()
                    .copied()
                    .find(|&w| self.wm.get(w).is_some_and(|x| x.value == value))
            })
            .ok_or_else(|| DeciderError::MissingAcceptableWme {
                preference: self.preference_to_string(cand),
            })?;

        let item = self.predefined.item;
        let pref = self.prefs.insert(Preference::new(
            PreferenceType::Acceptable,
            goal,
            item,
            value,
            None,
        ));
        let level = self.symbols.level(goal);
        let condition = BacktraceInfo {
            wme: ap_wme,
            level: self.symbols.level(self.wm[ap_wme].id),
            trace: None,
            prohibits: Vec::new(),
        };
        let mut inst = Instantiation::architectural(goal, level, condition);
        inst.insert_generated_preference(pref);
        let inst = self.insts.insert(inst);
        self.wm.add_ref(ap_wme);

        self.prefs[pref].inst = Some(inst);
        self.prefs[pref].on_goal_list = true;
        if let Some(info) = self.symbols.goal_mut(goal) {
            info.preferences_from_goal.push(pref);
        }
        self.preference_add_ref(pref);
        Ok(pref)
    }

    fn remove_fake_preference_for_goal_item(&mut self, pref: Option<PrefId>) -> KernelResult<()> {
        match pref {
            Some(p) if self.prefs.contains(p) => self.preference_remove_ref(p),
            _ => Ok(()),
        }
    }

    /// Make the goal's `^item` WMEs match `items` and refresh `^item-count`.
    fn update_impasse_items(&mut self, goal: SymbolId, items: &[PrefId]) -> KernelResult<()> {
        let (item, item_count) = (self.predefined.item, self.predefined.item_count);
        let wanted: HashSet<SymbolId> = items.iter().map(|&p| self.prefs[p].value).collect();
        let current = self
            .symbols
            .goal(goal)
            .map(|g| g.impasse_wmes.clone())
            .unwrap_or_default();

        let mut existing: HashMap<SymbolId, WmeId> = HashMap::new();
        for w in current {
            let (attr, value, preference) = {
                let wme = &self.wm[w];
                (wme.attr, wme.value, wme.preference)
            };
            let stale = if attr == item {
                if wanted.contains(&value) && !existing.contains_key(&value) {
                    existing.insert(value, w);
                    false
                } else {
                    self.remove_fake_preference_for_goal_item(preference)?;
                    true
                }
            } else {
                attr == item_count
            };
            if stale {
                if let Some(info) = self.symbols.goal_mut(goal) {
                    info.impasse_wmes.retain(|&x| x != w);
                }
                self.remove_wme_from_wm(w);
            }
        }

        for &cand in items {
            let bt_pref = self.make_fake_preference_for_goal_item(goal, cand)?;
            let value = self.prefs[cand].value;
            match existing.get(&value) {
                Some(&w) => {
                    let old = self.wm[w].preference.replace(bt_pref);
                    self.remove_fake_preference_for_goal_item(old)?;
                }
                None => {
                    self.add_impasse_wme(goal, item, value, Some(bt_pref));
                }
            }
        }

        if !items.is_empty() {
            let count = self.symbols.intern_int(items.len() as i64);
            self.add_impasse_wme(goal, item_count, count, None);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Non-context slots
    // -----------------------------------------------------------------------

    fn decide_non_context_slot(&mut self, s: SlotId) -> KernelResult<()> {
        let decision = self.run_preference_semantics(s, false)?;

        if decision.impasse == ImpasseType::ConstraintFailure {
            let (id, attr) = (self.slots[s].id, self.slots[s].attr);
            let message = format!(
                "constraint failure on ({} ^{}): {} required values",
                self.symbols.display(id),
                self.symbols.display(attr),
                decision.candidates.len()
            );
            tracing::warn!("{message}");
            self.record_diagnostic(DiagnosticKind::ConstraintFailure, None, message);
            let wmes = std::mem::take(&mut self.slots[s].wmes);
            self.remove_wme_list_from_wm(&wmes);
            return Ok(());
        }

        let wanted: HashSet<SymbolId> = decision
            .candidates
            .iter()
            .map(|&p| self.prefs[p].value)
            .collect();
        let mut existing: HashMap<SymbolId, WmeId> = HashMap::new();
        for w in self.slots[s].wmes.clone() {
            let value = self.wm[w].value;
            if wanted.contains(&value) && !existing.contains_key(&value) {
                existing.insert(value, w);
                continue;
            }
            if let Some(slot) = self.slots.get_mut(s) {
                slot.wmes.retain(|&x| x != w);
            }
            let in_live_gds = self
                .wm[w]
                .gds
                .and_then(|g| self.gds.get(g))
                .is_some_and(|g| g.goal.is_some());
            if in_live_gds {
                self.gds_invalid_so_remove_goal(w)?;
            }
            self.remove_wme_from_wm(w);
        }

        for cand in decision.candidates {
            // Removing a goal above may have released this preference.
            let Some(pref) = self.prefs.get(cand).filter(|p| p.in_tm()) else {
                continue;
            };
            let (id, attr, value) = (pref.id, pref.attr, pref.value);
            if let Some(&w) = existing.get(&value) {
                self.wm[w].preference = Some(cand);
                continue;
            }
            let w = self.wm.make_wme(id, attr, value, false);
            if let Some(slot) = self.slots.get_mut(s) {
                slot.wmes.insert(0, w);
            }
            self.wm[w].preference = Some(cand);
            self.update_gds_for_new_wme(w)?;
            self.add_wme_to_wm(w);
        }
        Ok(())
    }

    pub(crate) fn decide_non_context_slots(&mut self) -> KernelResult<()> {
        while !self.tempmem.changed_slots.is_empty() {
            let s = self.tempmem.changed_slots.remove(0);
            if !self.slots.contains(s) {
                continue;
            }
            self.decide_non_context_slot(s)?;
            if let Some(slot) = self.slots.get_mut(s) {
                slot.changed = false;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Context slots
    // -----------------------------------------------------------------------

    /// A context slot is decidable when it has no installed value and its
    /// preferences changed, or when the installed value has a reconsider
    /// preference.
    fn context_slot_is_decidable(&self, s: SlotId) -> bool {
        let Some(slot) = self.slots.get(s) else {
            return false;
        };
        let Some(installed) = slot.wmes.first().and_then(|&w| self.wm.get(w)) else {
            return slot.changed;
        };
        slot.preferences_of(PreferenceType::Reconsider)
            .iter()
            .filter_map(|&p| self.prefs.get(p))
            .any(|p| p.value == installed.value)
    }

    fn goal_operator_slot(&mut self, goal: SymbolId) -> SlotId {
        match self.symbols.operator_slot(goal) {
            Some(s) if self.slots.contains(s) => s,
            _ => self.make_slot(goal, self.predefined.operator),
        }
    }

    /// Remove the installed operator WME (a context slot holds at most one).
    pub(crate) fn remove_wmes_for_context_slot(&mut self, s: SlotId) -> KernelResult<()> {
        let Some(slot) = self.slots.get_mut(s) else {
            return Ok(());
        };
        let wmes = std::mem::take(&mut slot.wmes);
        debug_assert!(wmes.len() <= 1);
        for w in wmes {
            if let Some(p) = self.wm[w].preference {
                self.preference_remove_ref(p)?;
            }
            self.remove_wme_from_wm(w);
        }
        Ok(())
    }

    /// Remove `goal` and every goal below it.
    pub(crate) fn remove_existing_context_and_descendents(
        &mut self,
        goal: SymbolId,
    ) -> KernelResult<()> {
        if let Some(lower) = self.symbols.lower_goal(goal) {
            self.remove_existing_context_and_descendents(lower)?;
        }

        let level = self.symbols.level(goal);
        if Some(goal) != self.decider.top_goal {
            self.learning.on_goal_update(goal, level, 0.0, true);
        }

        if Some(goal) == self.decider.top_goal {
            self.decider.top_goal = None;
            self.decider.bottom_goal = None;
        } else {
            let higher = self.symbols.higher_goal(goal);
            self.decider.bottom_goal = higher;
            if let Some(info) = higher.and_then(|h| self.symbols.goal_mut(h)) {
                info.lower_goal = None;
            }
        }

        // Oldest first, so chains of support unwind in creation order.
        let from_goal = self
            .symbols
            .goal_mut(goal)
            .map(|g| std::mem::take(&mut g.preferences_from_goal))
            .unwrap_or_default();
        for p in from_goal {
            let Some(pref) = self.prefs.get_mut(p) else {
                continue;
            };
            pref.on_goal_list = false;
            if !self.remove_preference_from_clones(p)?
                && self.prefs.get(p).is_some_and(|x| x.in_tm())
            {
                self.remove_preference_from_tm(p)?;
            }
        }

        if let Some(s) = self.symbols.operator_slot(goal) {
            self.clear_cdps(s)?;
            self.remove_wmes_for_context_slot(s)?;
        }
        self.update_impasse_items(goal, &[])?;

        let impasse_wmes = self
            .symbols
            .goal_mut(goal)
            .map(|g| std::mem::take(&mut g.impasse_wmes))
            .unwrap_or_default();
        self.remove_wme_list_from_wm(&impasse_wmes);

        if let Some(gds) = self.symbols.goal(goal).and_then(|g| g.gds) {
            if let Some(set) = self.gds.get_mut(gds) {
                set.goal = None;
            }
        }
        self.transfer_retractions_to_nil_goal(goal);
        self.post_link_removal(None, goal);
        tracing::info!(goal = %self.symbols.display(goal), level, "removed state");
        Ok(())
    }

    /// Push a new goal below the bottom of the stack, or create the top
    /// state when the stack is empty.
    pub(crate) fn create_new_context(&mut self, attr: Option<SymbolId>, impasse_type: ImpasseType) {
        let id = match self.decider.bottom_goal {
            Some(bottom) => {
                let level = self.symbols.level(bottom) + 1;
                let id = self.create_new_impasse(bottom, attr, impasse_type, level);
                if let Some(info) = self.symbols.goal_mut(id) {
                    info.higher_goal = Some(bottom);
                }
                if let Some(info) = self.symbols.goal_mut(bottom) {
                    info.lower_goal = Some(id);
                }
                self.decider.bottom_goal = Some(id);
                let (quiescence, t) = (self.predefined.quiescence, self.predefined.t);
                self.add_impasse_wme(id, quiescence, t, None);

                let max_depth = self.config.max_goal_depth;
                if impasse_type == ImpasseType::NoChange && level > max_depth {
                    tracing::warn!(
                        max_depth,
                        "goal stack depth exceeded on a no-change impasse; the agent appears to be in an infinite loop"
                    );
                    self.halt(format!("Max Goal Depth ({max_depth}) exceeded"));
                }
                tracing::info!(
                    goal = %self.symbols.display(id),
                    level,
                    impasse = ?impasse_type,
                    "created substate"
                );
                id
            }
            None => {
                let nil = self.predefined.nil;
                let id = self.create_new_impasse(nil, None, ImpasseType::None, TOP_GOAL_LEVEL);
                self.decider.top_goal = Some(id);
                self.decider.bottom_goal = Some(id);
                id
            }
        };
        tracing::trace!(goal = %self.symbols.display(id), "goal stack extended");
    }

    /// Impasse type of the substate below `goal`, `None` without one.
    pub fn type_of_existing_impasse(&self, goal: SymbolId) -> KernelResult<ImpasseType> {
        let Some(lower) = self.symbols.lower_goal(goal) else {
            return Ok(ImpasseType::None);
        };
        let p = &self.predefined;
        let value = self
            .symbols
            .goal(lower)
            .into_iter()
            .flat_map(|g| g.impasse_wmes.iter())
            .filter_map(|&w| self.wm.get(w))
            .find(|w| w.attr == p.impasse)
            .map(|w| w.value);
        match value {
            Some(v) if v == p.no_change => Ok(ImpasseType::NoChange),
            Some(v) if v == p.tie => Ok(ImpasseType::Tie),
            Some(v) if v == p.constraint_failure => Ok(ImpasseType::ConstraintFailure),
            Some(v) if v == p.conflict => Ok(ImpasseType::Conflict),
            Some(v) if v == p.none => Ok(ImpasseType::None),
            _ => Err(DeciderError::MissingImpasseType {
                goal: self.symbols.display(lower),
            }
            .into()),
        }
    }

    /// The `^attribute` of the substate below `goal`.
    pub fn attribute_of_existing_impasse(&self, goal: SymbolId) -> KernelResult<Option<SymbolId>> {
        let Some(lower) = self.symbols.lower_goal(goal) else {
            return Ok(None);
        };
        self.symbols
            .goal(lower)
            .into_iter()
            .flat_map(|g| g.impasse_wmes.iter())
            .filter_map(|&w| self.wm.get(w))
            .find(|w| w.attr == self.predefined.attribute)
            .map(|w| Some(w.value))
            .ok_or_else(|| {
                DeciderError::MissingImpasseType {
                    goal: self.symbols.display(lower),
                }
                .into()
            })
    }

    /// Decide one context slot. Returns `false` when the only change was to
    /// the `^item` set of an existing impasse, in which case the caller keeps
    /// scanning down the stack.
    fn decide_context_slot(&mut self, goal: SymbolId, s: SlotId) -> KernelResult<bool> {
        let (impasse, candidates) = if !self.context_slot_is_decidable(s) {
            // Only the bottom slot is decided when undecidable: a no-change.
            (ImpasseType::NoChange, Vec::new())
        } else {
            let decision = self.run_preference_semantics(s, false)?;
            self.remove_wmes_for_context_slot(s)?;
            let mut impasse = decision.impasse;
            if impasse == ImpasseType::None {
                if decision.candidates.is_empty() {
                    impasse = ImpasseType::NoChange;
                } else if decision.candidates.len() > 1 {
                    return Err(DeciderError::MultipleWinners {
                        id: self.symbols.display(self.slots[s].id),
                        attr: self.symbols.display(self.slots[s].attr),
                    }
                    .into());
                }
            }
            (impasse, decision.candidates)
        };
        let (slot_id, slot_attr, has_wmes) = {
            let slot = &mut self.slots[s];
            slot.changed = false;
            (slot.id, slot.attr, !slot.wmes.is_empty())
        };

        let attribute_of_impasse = if impasse == ImpasseType::NoChange && !has_wmes {
            self.predefined.state
        } else {
            slot_attr
        };
        if attribute_of_impasse == self.predefined.state {
            let op_slot = self.goal_operator_slot(goal);
            self.remove_wmes_for_context_slot(op_slot)?;
        }

        if impasse == ImpasseType::None {
            let winner = candidates[0];
            self.preference_add_ref(winner);
            if let Some(lower) = self.symbols.lower_goal(goal) {
                tracing::debug!(
                    goal = %self.symbols.display(lower),
                    "removing state because of a decision"
                );
                self.remove_existing_context_and_descendents(lower)?;
            }
            let value = self.prefs[winner].value;
            let w = self.wm.make_wme(slot_id, slot_attr, value, false);
            self.slots[s].wmes.push(w);
            self.wm[w].preference = Some(winner);
            self.preference_add_ref(winner);
            self.add_wme_to_wm(w);
            self.preference_remove_ref(winner)?;
            tracing::info!(
                goal = %self.symbols.display(goal),
                operator = %self.symbols.display(value),
                "selected operator"
            );
            return Ok(true);
        }

        if impasse == self.type_of_existing_impasse(goal)?
            && Some(attribute_of_impasse) == self.attribute_of_existing_impasse(goal)?
        {
            if let Some(lower) = self.symbols.lower_goal(goal) {
                self.update_impasse_items(lower, &candidates)?;
            }
            return Ok(false);
        }

        for &c in &candidates {
            self.preference_add_ref(c);
        }
        if let Some(lower) = self.symbols.lower_goal(goal) {
            tracing::debug!(
                goal = %self.symbols.display(lower),
                "removing state because it is the wrong type of impasse"
            );
            self.remove_existing_context_and_descendents(lower)?;
        }
        let waiting = self.config.wait_on_state_no_change
            && impasse == ImpasseType::NoChange
            && attribute_of_impasse == self.predefined.state;
        if !waiting {
            self.create_new_context(Some(attribute_of_impasse), impasse);
            if let Some(lower) = self.symbols.lower_goal(goal) {
                self.update_impasse_items(lower, &candidates)?;
            }
        }
        for c in candidates {
            self.preference_remove_ref(c)?;
        }
        Ok(true)
    }

    /// Scan down the goal stack from the shallowest changed context and
    /// decide the first decidable slot (or the bottom one).
    pub(crate) fn decide_context_slots(&mut self) -> KernelResult<()> {
        let Some(mut goal) = self
            .tempmem
            .highest_goal_whose_context_changed
            .or(self.decider.bottom_goal)
        else {
            return Ok(());
        };
        let mut s = self.goal_operator_slot(goal);
        loop {
            while !self.context_slot_is_decidable(s) {
                let Some(lower) = self.symbols.lower_goal(goal) else {
                    break;
                };
                goal = lower;
                s = self.goal_operator_slot(goal);
            }
            if self.decide_context_slot(goal, s)? {
                break;
            }
        }
        self.tempmem.highest_goal_whose_context_changed = None;
        Ok(())
    }
}
