//! Reference counting and cascading release.
//!
//! Every decrement that reaches zero triggers the next release in the chain
//! synchronously: a preference (and its clones) is deallocated, which removes
//! it from its instantiation, which may deallocate the instantiation, which
//! releases the production and the WMEs and preferences it was holding.
//! Temporary-memory bookkeeping (slot creation, change marking, garbage slot
//! removal) lives here as well since it is driven by the same add/remove
//! operations.

use super::arena::{Arena, ArenaKey, InstId, PrefId, SlotId};
use super::instantiation::{InstCondition, Instantiation};
use super::preference::{Preference, PreferenceType};
use super::slot::Slot;
use crate::error::{KernelResult, MemoryError};
use crate::kernel::Kernel;
use crate::symbol::{Level, SymbolId, TOP_GOAL_LEVEL};

/// Slots whose contents changed since the decider last looked at them.
#[derive(Debug, Default)]
pub struct TemporaryMemory {
    /// Shallowest goal whose operator slot changed.
    pub highest_goal_whose_context_changed: Option<SymbolId>,
    /// Non-context slots awaiting `decide_non_context_slots`.
    pub changed_slots: Vec<SlotId>,
    pub slots_for_possible_removal: Vec<SlotId>,
}

impl TemporaryMemory {
    pub fn clear(&mut self) {
        self.highest_goal_whose_context_changed = None;
        self.changed_slots.clear();
        self.slots_for_possible_removal.clear();
    }
}

/// Match-goal level of the instantiation that generated a preference.
pub(crate) fn match_level(
    prefs: &Arena<PrefId, Preference>,
    insts: &Arena<InstId, Instantiation>,
    pref: PrefId,
) -> Option<Level> {
    prefs
        .get(pref)
        .and_then(|p| p.inst)
        .and_then(|i| insts.get(i))
        .map(|i| i.match_goal_level)
}

impl Kernel {
    // -----------------------------------------------------------------------
    // Preferences
    // -----------------------------------------------------------------------

    pub(crate) fn preference_add_ref(&mut self, p: PrefId) {
        if let Some(pref) = self.prefs.get_mut(p) {
            pref.reference_count += 1;
        }
    }

    /// Release one reference; at zero the preference and its clones are
    /// deallocated unless some clone is still held.
    pub(crate) fn preference_remove_ref(&mut self, p: PrefId) -> KernelResult<()> {
        let count = match self.prefs.get(p) {
            Some(pref) => pref.reference_count,
            None => {
                return Err(MemoryError::StaleHandle {
                    kind: PrefId::KIND,
                    index: p.index(),
                }
                .into());
            }
        };
        if count == 0 {
            return Err(MemoryError::RefcountUnderflow {
                preference: self.preference_to_string(p),
            }
            .into());
        }
        self.prefs[p].reference_count = count - 1;
        if count == 1 {
            self.possibly_deallocate_preference_and_clones(p)?;
        }
        Ok(())
    }

    /// Match-goal level of the preference's instantiation.
    pub(crate) fn preference_level(&self, p: PrefId) -> Option<Level> {
        match_level(&self.prefs, &self.insts, p)
    }

    fn clones_of(&self, p: PrefId) -> Vec<PrefId> {
        let mut clones = Vec::new();
        let mut next = self.prefs.get(p).and_then(|x| x.next_clone);
        while let Some(c) = next {
            clones.push(c);
            next = self.prefs.get(c).and_then(|x| x.next_clone);
        }
        let mut prev = self.prefs.get(p).and_then(|x| x.prev_clone);
        while let Some(c) = prev {
            clones.push(c);
            prev = self.prefs.get(c).and_then(|x| x.prev_clone);
        }
        clones
    }

    /// Find the copy of `p` whose instantiation matched at `level`.
    pub fn find_clone_for_level(&self, p: PrefId, level: Level) -> Option<PrefId> {
        if self.preference_level(p) == Some(level) {
            return Some(p);
        }
        self.clones_of(p)
            .into_iter()
            .find(|&c| self.preference_level(c) == Some(level))
    }

    pub(crate) fn possibly_deallocate_preference_and_clones(
        &mut self,
        p: PrefId,
    ) -> KernelResult<bool> {
        let held = |k: &Kernel, q: PrefId| k.prefs.get(q).is_some_and(|x| x.reference_count > 0);
        if held(self, p) {
            return Ok(false);
        }
        let clones = self.clones_of(p);
        if clones.iter().any(|&c| held(self, c)) {
            return Ok(false);
        }
        for c in clones {
            self.deallocate_preference(c)?;
        }
        self.deallocate_preference(p)?;
        Ok(true)
    }

    fn deallocate_preference(&mut self, p: PrefId) -> KernelResult<()> {
        let Some(pref) = self.prefs.remove(p) else {
            return Ok(());
        };
        tracing::trace!(preference = %p, "deallocating preference");
        if let Some(inst) = pref.inst {
            if pref.on_goal_list {
                let goal = self.insts.get(inst).and_then(|i| i.match_goal);
                if let Some(info) = goal.and_then(|g| self.symbols.goal_mut(g)) {
                    info.preferences_from_goal.retain(|&q| q != p);
                }
            }
            if let Some(record) = self.insts.get_mut(inst) {
                record.remove_generated_preference(p);
            }
            self.possibly_deallocate_instantiation(inst)?;
        }
        Ok(())
    }

    /// Splice `p` out of its clone chain. Returns `true` if `p` itself was
    /// deallocated as a result.
    pub(crate) fn remove_preference_from_clones(&mut self, p: PrefId) -> KernelResult<bool> {
        let (next, prev) = match self.prefs.get(p) {
            Some(x) => (x.next_clone, x.prev_clone),
            None => return Ok(true),
        };
        let mut any_clone = None;
        if let Some(n) = next {
            if let Some(x) = self.prefs.get_mut(n) {
                x.prev_clone = prev;
            }
            any_clone = Some(n);
        }
        if let Some(pv) = prev {
            if let Some(x) = self.prefs.get_mut(pv) {
                x.next_clone = next;
            }
            any_clone = Some(pv);
        }
        if let Some(x) = self.prefs.get_mut(p) {
            x.next_clone = None;
            x.prev_clone = None;
        }
        if let Some(c) = any_clone {
            self.possibly_deallocate_preference_and_clones(c)?;
        }
        if self.prefs.get(p).is_some_and(|x| x.reference_count == 0) {
            self.deallocate_preference(p)?;
            return Ok(true);
        }
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Instantiations
    // -----------------------------------------------------------------------

    /// Deallocate `inst` if it generated no live preferences and has left the
    /// match set.
    pub fn possibly_deallocate_instantiation(&mut self, inst: InstId) -> KernelResult<()> {
        if self
            .insts
            .get(inst)
            .is_some_and(Instantiation::is_deallocatable)
        {
            self.deallocate_instantiation(inst)?;
        }
        Ok(())
    }

    fn deallocate_instantiation(&mut self, inst: InstId) -> KernelResult<()> {
        let Some(record) = self.insts.remove(inst) else {
            return Ok(());
        };
        tracing::trace!(production = %record.prod_name, "deallocating instantiation");
        let level = record.match_goal_level;
        for cond in &record.conditions {
            if let InstCondition::Positive(bt) = cond {
                if level > TOP_GOAL_LEVEL {
                    for &p in &bt.prohibits {
                        self.preference_remove_ref(p)?;
                    }
                    if let Some(trace) = bt.trace {
                        self.preference_remove_ref(trace)?;
                    }
                }
                self.wm.remove_ref(bt.wme);
            }
        }
        if let Some(prod) = record.prod {
            self.productions.remove_ref(prod);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    pub fn find_slot(&self, id: SymbolId, attr: SymbolId) -> Option<SlotId> {
        self.symbols
            .ident(id)?
            .slots
            .iter()
            .copied()
            .find(|&s| self.slots.get(s).is_some_and(|x| x.attr == attr))
    }

    /// Find or create the slot for (`id`, `attr`).
    pub(crate) fn make_slot(&mut self, id: SymbolId, attr: SymbolId) -> SlotId {
        if let Some(s) = self.find_slot(id, attr) {
            return s;
        }
        let context = self.symbols.is_goal(id) && attr == self.predefined.operator;
        let s = self.slots.insert(Slot::new(id, attr, context));
        if let Some(info) = self.symbols.ident_mut(id) {
            info.slots.insert(0, s);
            if let Some(goal) = info.goal.as_deref_mut().filter(|_| context) {
                goal.operator_slot = Some(s);
            }
        }
        s
    }

    pub(crate) fn mark_slot_as_changed(&mut self, s: SlotId) {
        let Some(slot) = self.slots.get_mut(s) else {
            return;
        };
        if slot.isa_context_slot {
            let id = slot.id;
            slot.changed = true;
            let shallower = match self.tempmem.highest_goal_whose_context_changed {
                Some(g) => self.symbols.level(id) < self.symbols.level(g),
                None => true,
            };
            if shallower {
                self.tempmem.highest_goal_whose_context_changed = Some(id);
            }
        } else if !slot.changed {
            slot.changed = true;
            self.tempmem.changed_slots.insert(0, s);
        }
    }

    pub(crate) fn mark_context_slot_as_acceptable_preference_changed(&mut self, s: SlotId) {
        let Some(slot) = self.slots.get_mut(s) else {
            return;
        };
        if slot.acceptable_preference_changed {
            return;
        }
        slot.acceptable_preference_changed = true;
        self.decider
            .context_slots_with_changed_acceptable_preferences
            .insert(0, s);
    }

    pub(crate) fn mark_slot_for_possible_removal(&mut self, s: SlotId) {
        let Some(slot) = self.slots.get_mut(s) else {
            return;
        };
        if slot.marked_for_possible_removal {
            return;
        }
        slot.marked_for_possible_removal = true;
        self.tempmem.slots_for_possible_removal.insert(0, s);
    }

    /// Drop marked slots that no longer hold WMEs or preferences.
    pub(crate) fn remove_garbage_slots(&mut self) {
        while !self.tempmem.slots_for_possible_removal.is_empty() {
            let s = self.tempmem.slots_for_possible_removal.remove(0);
            let Some(slot) = self.slots.get_mut(s) else {
                continue;
            };
            if !slot.wmes.is_empty() || !slot.all_preferences.is_empty() {
                slot.marked_for_possible_removal = false;
                continue;
            }
            let id = slot.id;
            self.tempmem.changed_slots.retain(|&c| c != s);
            self.decider
                .context_slots_with_changed_acceptable_preferences
                .retain(|&c| c != s);
            if let Some(info) = self.symbols.ident_mut(id) {
                info.slots.retain(|&x| x != s);
                if let Some(goal) = info.goal.as_deref_mut() {
                    if goal.operator_slot == Some(s) {
                        goal.operator_slot = None;
                    }
                }
            }
            self.slots.remove(s);
        }
    }

    // -----------------------------------------------------------------------
    // Temporary memory
    // -----------------------------------------------------------------------

    /// Commit a preference to its slot, creating the slot if needed.
    pub(crate) fn add_preference_to_tm(&mut self, p: PrefId) {
        let (ty, id, attr, value, referent) = {
            let x = &self.prefs[p];
            (x.pref_type, x.id, x.attr, x.value, x.referent)
        };
        let s = self.make_slot(id, attr);
        let level = self.preference_level(p).unwrap_or(TOP_GOAL_LEVEL);
        {
            let (prefs, insts) = (&self.prefs, &self.insts);
            self.slots[s].add_preference(p, ty, level, |q| {
                match_level(prefs, insts, q).unwrap_or(TOP_GOAL_LEVEL)
            });
        }
        self.prefs[p].slot = Some(s);
        self.preference_add_ref(p);
        self.mark_slot_as_changed(s);
        if self.symbols.is_identifier(value) {
            self.post_link_addition(Some(id), value);
        }
        if let Some(r) = referent.filter(|&r| ty.is_binary() && self.symbols.is_identifier(r)) {
            self.post_link_addition(Some(id), r);
        }
        if self.slots[s].isa_context_slot
            && matches!(ty, PreferenceType::Acceptable | PreferenceType::Require)
        {
            self.mark_context_slot_as_acceptable_preference_changed(s);
        }
    }

    /// Remove a preference from its slot and release the slot's reference.
    pub(crate) fn remove_preference_from_tm(&mut self, p: PrefId) -> KernelResult<()> {
        let Some((ty, id, value, referent, Some(s))) = self
            .prefs
            .get(p)
            .map(|x| (x.pref_type, x.id, x.value, x.referent, x.slot))
        else {
            return Ok(());
        };
        self.prefs[p].slot = None;
        if let Some(slot) = self.slots.get_mut(s) {
            slot.remove_preference(p, ty);
        }
        self.mark_slot_as_changed(s);
        if self.slots.get(s).is_some_and(|x| x.isa_context_slot)
            && matches!(ty, PreferenceType::Acceptable | PreferenceType::Require)
        {
            self.mark_context_slot_as_acceptable_preference_changed(s);
        }
        if self.symbols.is_identifier(value) {
            self.post_link_removal(Some(id), value);
        }
        if let Some(r) = referent.filter(|&r| ty.is_binary() && self.symbols.is_identifier(r)) {
            self.post_link_removal(Some(id), r);
        }
        self.preference_remove_ref(p)
    }

    /// Render a preference as `(S1 ^attr value +)`.
    pub fn preference_to_string(&self, p: PrefId) -> String {
        let Some(x) = self.prefs.get(p) else {
            return format!("<stale {p}>");
        };
        let mut out = format!(
            "({} ^{} {} {}",
            self.symbols.display(x.id),
            self.symbols.display(x.attr),
            self.symbols.display(x.value),
            x.pref_type.symbol()
        );
        if let Some(r) = x.referent.filter(|_| x.pref_type.is_binary()) {
            out.push(' ');
            out.push_str(&self.symbols.display(r));
        }
        out.push(')');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, KernelConfig};
    use crate::matcher::MatchToken;
    use crate::memory::{ProdId, Preference};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    fn make_pref(k: &mut Kernel, ty: PreferenceType, value: SymbolId) -> PrefId {
        let top = k.top_goal().unwrap();
        let attr = k.symbols.intern_str("color");
        k.prefs.insert(Preference::new(ty, top, attr, value, None))
    }

    fn make_inst(k: &mut Kernel, level: Level) -> InstId {
        let prod = ProdId::from_parts(999, 0);
        let mut inst = Instantiation::new(prod, "test", MatchToken::default());
        inst.match_goal_level = level;
        inst.in_ms = false;
        k.insts.insert(inst)
    }

    #[test]
    fn tm_add_and_remove_balance_references() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let p = make_pref(&mut k, PreferenceType::Acceptable, red);
        k.preference_add_ref(p);
        k.add_preference_to_tm(p);
        assert!(k.prefs[p].in_tm());
        assert_eq!(k.prefs[p].reference_count, 2);
        let s = k.prefs[p].slot.unwrap();
        assert!(k.tempmem.changed_slots.contains(&s));

        k.remove_preference_from_tm(p).unwrap();
        assert_eq!(k.prefs[p].reference_count, 1);
        k.preference_remove_ref(p).unwrap();
        assert!(k.prefs.get(p).is_none());
    }

    #[test]
    fn underflow_is_fatal() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let p = make_pref(&mut k, PreferenceType::Acceptable, red);
        let err = k.preference_remove_ref(p).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn clone_chain_keeps_preferences_alive_until_all_released() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let a = make_pref(&mut k, PreferenceType::Acceptable, red);
        let b = make_pref(&mut k, PreferenceType::Acceptable, red);
        k.prefs[a].next_clone = Some(b);
        k.prefs[b].prev_clone = Some(a);
        k.preference_add_ref(a);
        k.preference_add_ref(b);

        k.preference_remove_ref(a).unwrap();
        assert!(k.prefs.get(a).is_some(), "clone b still held");
        k.preference_remove_ref(b).unwrap();
        assert!(k.prefs.get(a).is_none());
        assert!(k.prefs.get(b).is_none());
    }

    #[test]
    fn find_clone_walks_both_directions() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let (a, b, c) = (
            make_pref(&mut k, PreferenceType::Acceptable, red),
            make_pref(&mut k, PreferenceType::Acceptable, red),
            make_pref(&mut k, PreferenceType::Acceptable, red),
        );
        for (p, level) in [(a, 1), (b, 2), (c, 3)] {
            let inst = make_inst(&mut k, level);
            k.prefs[p].inst = Some(inst);
            k.insts[inst].insert_generated_preference(p);
        }
        k.prefs[a].next_clone = Some(b);
        k.prefs[b].prev_clone = Some(a);
        k.prefs[b].next_clone = Some(c);
        k.prefs[c].prev_clone = Some(b);

        assert_eq!(k.find_clone_for_level(b, 1), Some(a));
        assert_eq!(k.find_clone_for_level(b, 3), Some(c));
        assert_eq!(k.find_clone_for_level(a, 2), Some(b));
        assert_eq!(k.find_clone_for_level(a, 7), None);
    }

    #[test]
    fn releasing_last_preference_deallocates_instantiation() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let p = make_pref(&mut k, PreferenceType::Acceptable, red);
        let inst = make_inst(&mut k, 1);
        k.prefs[p].inst = Some(inst);
        k.insts[inst].insert_generated_preference(p);
        k.preference_add_ref(p);
        k.preference_remove_ref(p).unwrap();
        assert!(k.insts.get(inst).is_none());
    }

    #[test]
    fn empty_marked_slot_is_collected() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let attr = k.symbols.intern_str("scratch");
        let s = k.make_slot(top, attr);
        assert_eq!(k.find_slot(top, attr), Some(s));
        k.mark_slot_for_possible_removal(s);
        k.remove_garbage_slots();
        assert!(k.slots.get(s).is_none());
        assert_eq!(k.find_slot(top, attr), None);
    }

    #[test]
    fn preference_renders_with_type_indicator() {
        let mut k = kernel();
        let red = k.symbols.intern_str("red");
        let p = make_pref(&mut k, PreferenceType::Reject, red);
        assert_eq!(k.preference_to_string(p), "(S1 ^color red -)");
    }
}
