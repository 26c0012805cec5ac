//! The decider: keeps working memory consistent with preference memory.
//!
//! Responsibilities, in the order a phase exercises them:
//!
//! - **Acceptable-preference WMEs** for context slots track the slot's
//!   acceptable and require preferences (this module).
//! - **Links** between identifiers drive promotion, demotion, and garbage
//!   collection of identifiers that lost their last link ([`links`]).
//! - **Preference semantics** turn a slot's preferences into winners or an
//!   impasse ([`semantics`]).
//! - **Context decisions** select operators, create and remove substates, and
//!   maintain `^item` WMEs ([`context`]).
//! - **Goal dependency sets** tear down substates whose o-supported results
//!   rest on supergoal WMEs that changed ([`gds`]).

pub mod context;
pub mod gds;
pub mod links;
pub mod semantics;

use std::collections::HashMap;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::memory::{PreferenceType, SlotId, WmeId};
use crate::symbol::{Level, SymbolId, TOP_GOAL_LEVEL};

pub use gds::Gds;

/// How `post_link_removal` treats an identifier whose link count changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkUpdateMode {
    #[default]
    Normal,
    /// Identifiers reaching zero links go straight to the disconnected list.
    UpdateDisconnectedIds,
    /// Only the counts change; used while garbage collecting.
    JustUpdateCount,
}

/// Goal stack cursor and link-tracking buffers.
#[derive(Debug)]
pub struct DeciderState {
    pub top_goal: Option<SymbolId>,
    pub bottom_goal: Option<SymbolId>,
    /// Goal whose matches the current elaboration pass fires.
    pub active_goal: Option<SymbolId>,
    pub active_level: Level,
    pub previous_active_goal: Option<SymbolId>,
    pub previous_active_level: Level,
    /// Shallowest goal with pending matches when the preference phase began.
    pub highest_active_goal: Option<SymbolId>,
    pub highest_active_level: Level,
    /// Waterfall bound for the current inner elaboration pass.
    pub change_level: Level,
    pub next_change_level: Level,
    pub(crate) context_slots_with_changed_acceptable_preferences: Vec<SlotId>,
    pub(crate) promoted_ids: Vec<SymbolId>,
    pub(crate) ids_with_unknown_level: Vec<SymbolId>,
    pub(crate) disconnected_ids: Vec<SymbolId>,
    pub(crate) link_update_mode: LinkUpdateMode,
}

impl Default for DeciderState {
    fn default() -> Self {
        Self {
            top_goal: None,
            bottom_goal: None,
            active_goal: None,
            active_level: TOP_GOAL_LEVEL,
            previous_active_goal: None,
            previous_active_level: TOP_GOAL_LEVEL,
            highest_active_goal: None,
            highest_active_level: TOP_GOAL_LEVEL,
            change_level: TOP_GOAL_LEVEL,
            next_change_level: TOP_GOAL_LEVEL,
            context_slots_with_changed_acceptable_preferences: Vec::new(),
            promoted_ids: Vec::new(),
            ids_with_unknown_level: Vec::new(),
            disconnected_ids: Vec::new(),
            link_update_mode: LinkUpdateMode::Normal,
        }
    }
}

impl DeciderState {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

impl Kernel {
    // -----------------------------------------------------------------------
    // Working-memory commit
    // -----------------------------------------------------------------------

    /// Put a WME into working memory. The matcher sees it at the next
    /// `do_buffered_wm_changes`.
    pub(crate) fn add_wme_to_wm(&mut self, w: WmeId) {
        self.wm.buffer_addition(w);
        let (id, attr, value) = {
            let wme = &self.wm[w];
            (wme.id, wme.attr, wme.value)
        };
        tracing::trace!(
            id = %self.symbols.display(id),
            attr = %self.symbols.display(attr),
            value = %self.symbols.display(value),
            "adding wme"
        );
        if self.symbols.is_identifier(value) {
            self.post_link_addition(Some(id), value);
            if attr == self.predefined.operator {
                if let Some(info) = self.symbols.ident_mut(value) {
                    info.isa_operator += 1;
                }
            }
        }
    }

    /// Take a WME out of working memory, dropping its support and its GDS
    /// membership.
    pub(crate) fn remove_wme_from_wm(&mut self, w: WmeId) {
        let Some(wme) = self.wm.get(w) else {
            return;
        };
        if !wme.in_wm {
            return;
        }
        let (id, attr, value, gds) = (wme.id, wme.attr, wme.value, wme.gds);
        self.wm.buffer_removal(w);
        if self.symbols.is_identifier(value) {
            self.post_link_removal(Some(id), value);
            if attr == self.predefined.operator {
                if let Some(info) = self.symbols.ident_mut(value) {
                    info.isa_operator = info.isa_operator.saturating_sub(1);
                }
            }
        }
        self.wm[w].preference = None;
        if gds.is_some() {
            self.remove_wme_from_gds(w);
        }
    }

    pub(crate) fn remove_wme_list_from_wm(&mut self, wmes: &[WmeId]) {
        for &w in wmes {
            self.remove_wme_from_wm(w);
        }
    }

    // -----------------------------------------------------------------------
    // Acceptable-preference WMEs
    // -----------------------------------------------------------------------

    /// Bring a context slot's acceptable-preference WMEs in line with its
    /// acceptable and require preferences.
    fn do_acceptable_preference_wme_changes_for_slot(&mut self, s: SlotId) {
        let Some(slot) = self.slots.get(s) else {
            return;
        };
        let (id, attr) = (slot.id, slot.attr);
        let supporting: Vec<_> = slot
            .preferences_of(PreferenceType::Require)
            .iter()
            .chain(slot.preferences_of(PreferenceType::Acceptable))
            .copied()
            .collect();
        let existing_wmes = slot.acceptable_preference_wmes.clone();

        let candidates: std::collections::HashSet<SymbolId> =
            supporting.iter().map(|&p| self.prefs[p].value).collect();
        let mut existing: HashMap<SymbolId, WmeId> = HashMap::new();
        for w in existing_wmes {
            let value = self.wm[w].value;
            if candidates.contains(&value) && !existing.contains_key(&value) {
                existing.insert(value, w);
                self.wm[w].preference = None;
            } else {
                self.slots[s].acceptable_preference_wmes.retain(|&x| x != w);
                self.remove_wme_from_wm(w);
            }
        }

        for p in supporting {
            let value = self.prefs[p].value;
            if let Some(&w) = existing.get(&value) {
                if self.wm[w].preference.is_none() {
                    self.wm[w].preference = Some(p);
                }
            } else {
                let w = self.wm.make_wme(id, attr, value, true);
                self.slots[s].acceptable_preference_wmes.insert(0, w);
                self.wm[w].preference = Some(p);
                self.add_wme_to_wm(w);
                existing.insert(value, w);
            }
        }
    }

    fn do_buffered_acceptable_preference_wme_changes(&mut self) {
        while !self
            .decider
            .context_slots_with_changed_acceptable_preferences
            .is_empty()
        {
            let s = self
                .decider
                .context_slots_with_changed_acceptable_preferences
                .remove(0);
            self.do_acceptable_preference_wme_changes_for_slot(s);
            if let Some(slot) = self.slots.get_mut(s) {
                slot.acceptable_preference_changed = false;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase entry points
    // -----------------------------------------------------------------------

    /// Flush everything a phase buffered: acceptable-preference WMEs, link
    /// changes, the WM delta to the matcher, and garbage slots.
    pub(crate) fn do_buffered_wm_and_ownership_changes(&mut self) -> KernelResult<()> {
        self.do_buffered_acceptable_preference_wme_changes();
        self.do_buffered_link_changes()?;
        self.do_buffered_wm_changes()?;
        self.remove_garbage_slots();
        Ok(())
    }

    /// Commit the changed non-context slots to working memory.
    pub(crate) fn do_working_memory_phase(&mut self) -> KernelResult<()> {
        tracing::trace!(firing_type = ?self.recmem.firing_type, "working memory phase");
        self.decide_non_context_slots()?;
        self.do_buffered_wm_and_ownership_changes()
    }

    /// Run the decision procedure on the goal stack's context slots.
    pub(crate) fn do_decision_phase(&mut self) -> KernelResult<()> {
        self.decide_context_slots()?;
        self.do_buffered_wm_and_ownership_changes()
    }

    /// Create the top state and its io link, and commit them.
    pub(crate) fn create_top_goal(&mut self) -> KernelResult<()> {
        self.create_new_context(None, crate::memory::ImpasseType::None);
        self.create_io_link()?;
        self.tempmem.highest_goal_whose_context_changed = None;
        self.do_buffered_wm_and_ownership_changes()
    }

    /// Remove every goal, top state included.
    pub(crate) fn clear_goal_stack(&mut self) -> KernelResult<()> {
        let Some(top) = self.decider.top_goal else {
            return Ok(());
        };
        self.remove_existing_context_and_descendents(top)?;
        self.tempmem.highest_goal_whose_context_changed = None;
        self.do_buffered_wm_and_ownership_changes()?;
        self.decider.active_goal = None;
        Ok(())
    }

    /// Goals from the top state down.
    pub fn goal_stack(&self) -> Vec<SymbolId> {
        let mut goals = Vec::new();
        let mut next = self.decider.top_goal;
        while let Some(g) = next {
            goals.push(g);
            next = self.symbols.lower_goal(g);
        }
        goals
    }

    pub fn bottom_goal(&self) -> Option<SymbolId> {
        self.decider.bottom_goal
    }

    /// The goal at a given depth, if the stack is that deep.
    pub fn find_goal_at_level(&self, level: Level) -> Option<SymbolId> {
        self.goal_stack()
            .into_iter()
            .find(|&g| self.symbols.level(g) == level)
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::{Kernel, KernelConfig};
    use crate::memory::{Preference, PreferenceType};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn top_goal_has_state_structure() {
        let k = kernel();
        let top = k.top_goal().unwrap();
        assert_eq!(k.goal_stack(), vec![top]);
        assert_eq!(k.bottom_goal(), Some(top));
        let p = &k.predefined;
        assert!(k.wm.find(top, p.type_, p.state).is_some());
        assert!(k.wm.find(top, p.superstate, p.nil).is_some());
        assert_eq!(k.find_goal_at_level(1), Some(top));
        assert_eq!(k.find_goal_at_level(2), None);
    }

    #[test]
    fn operator_wmes_count_on_the_value() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let op = k.symbols.new_identifier('O', 1);
        let w = k.wm.make_wme(top, k.predefined.operator, op, false);
        k.add_wme_to_wm(w);
        assert_eq!(k.symbols.ident(op).unwrap().isa_operator, 1);
        assert_eq!(k.symbols.ident(op).unwrap().link_count, 1);
        k.remove_wme_from_wm(w);
        assert_eq!(k.symbols.ident(op).unwrap().isa_operator, 0);
    }

    #[test]
    fn acceptable_wmes_follow_acceptable_preferences() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let op = k.symbols.new_identifier('O', 1);
        let operator = k.predefined.operator;
        let p = k.prefs.insert(Preference::new(
            PreferenceType::Acceptable,
            top,
            operator,
            op,
            None,
        ));
        k.add_preference_to_tm(p);
        k.do_buffered_wm_and_ownership_changes().unwrap();
        let s = k.find_slot(top, operator).unwrap();
        let acceptable = k.slots[s].acceptable_preference_wmes.clone();
        assert_eq!(acceptable.len(), 1);
        assert!(k.wm[acceptable[0]].acceptable);
        assert_eq!(k.wm[acceptable[0]].preference, Some(p));

        k.remove_preference_from_tm(p).unwrap();
        k.do_buffered_wm_and_ownership_changes().unwrap();
        assert!(k.slots.get(s).is_none_or(|x| x.acceptable_preference_wmes.is_empty()));
        assert!(k.wm.find(top, operator, op).is_none());
    }
}
