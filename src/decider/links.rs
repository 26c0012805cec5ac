//! Link counting, identifier promotion, demotion, and garbage collection.
//!
//! Every WME or preference whose value (or referent) is an identifier is a
//! link from its id to that identifier. Goals hold one extra "special" link
//! with no source. A link from a shallower identifier promotes the target
//! (and everything reachable from it) to the shallower level; promotions are
//! buffered and applied once per phase. Identifiers that lose links go on an
//! unknown-level list; demotion re-walks the goal stack from each affected
//! goal to assign fresh levels and collects whatever is no longer reachable.

use std::collections::HashSet;

use crate::decider::LinkUpdateMode;
use crate::error::{DeciderError, KernelResult};
use crate::kernel::Kernel;
use crate::symbol::{Level, SymbolId, LOWEST_POSSIBLE_GOAL_LEVEL};

/// Range of levels touched by one demotion pass.
struct Marking {
    highest_level_anything_could_fall_from: Level,
    lowest_level_anything_could_fall_to: Level,
}

impl Kernel {
    /// Identifiers one link away from `id`: values of input WMEs, slot WMEs,
    /// slot preferences (and binary referents), and slot impasse ids.
    fn linked_ids(&self, id: SymbolId) -> Vec<SymbolId> {
        let Some(info) = self.symbols.ident(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for wme in info.input_wmes.iter().filter_map(|&w| self.wm.get(w)) {
            out.push(wme.value);
        }
        for slot in info.slots.iter().filter_map(|&s| self.slots.get(s)) {
            for pref in slot.all_preferences.iter().filter_map(|&p| self.prefs.get(p)) {
                out.push(pref.value);
                if let Some(r) = pref.referent.filter(|_| pref.pref_type.is_binary()) {
                    out.push(r);
                }
            }
            out.extend(slot.impasse_id);
            for wme in slot.wmes.iter().filter_map(|&w| self.wm.get(w)) {
                out.push(wme.value);
            }
        }
        out.retain(|&s| self.symbols.is_identifier(s));
        out
    }

    /// Record a link from `from` (or a special link when `None`) to `to`.
    pub(crate) fn post_link_addition(&mut self, from: Option<SymbolId>, to: SymbolId) {
        let from_level = from
            .and_then(|f| self.symbols.ident(f))
            .map(|i| i.promotion_level);
        let Some(info) = self.symbols.ident_mut(to) else {
            return;
        };
        if info.is_goal() && from.is_some() {
            return;
        }
        info.link_count += 1;
        let count = info.link_count;
        tracing::trace!(to = %to, count, special = from.is_none(), "link added");

        let Some(from_level) = from_level else {
            return;
        };
        if from_level == info.promotion_level {
            return;
        }
        if from_level > info.promotion_level {
            info.could_be_a_link_from_below = true;
            return;
        }
        info.promotion_level = from_level;
        self.decider.promoted_ids.push(to);
    }

    /// Record the removal of a link. Identifiers that may have lost their
    /// level go on the unknown-level list for the next demotion pass.
    pub(crate) fn post_link_removal(&mut self, from: Option<SymbolId>, to: SymbolId) {
        let from_level = from.and_then(|f| self.symbols.ident(f)).map(|i| i.level);
        let mode = self.decider.link_update_mode;
        let Some(info) = self.symbols.ident_mut(to) else {
            return;
        };
        if info.is_goal() && from.is_some() {
            return;
        }
        info.link_count = info.link_count.saturating_sub(1);
        tracing::trace!(to = %to, count = info.link_count, "link removed");

        match mode {
            LinkUpdateMode::JustUpdateCount => return,
            LinkUpdateMode::UpdateDisconnectedIds if info.link_count == 0 => {
                let was_listed = std::mem::replace(&mut info.unknown_level, true);
                if was_listed {
                    self.decider.ids_with_unknown_level.retain(|&x| x != to);
                }
                if !self.decider.disconnected_ids.contains(&to) {
                    self.decider.disconnected_ids.push(to);
                }
                return;
            }
            _ => {}
        }
        if from_level.is_some_and(|l| l != info.level) {
            return;
        }
        if !info.unknown_level {
            info.unknown_level = true;
            self.decider.ids_with_unknown_level.push(to);
        }
    }

    /// Lower `root` and its transitive closure to `new_level`.
    fn promote_id_and_tc(&mut self, root: SymbolId, new_level: Level) -> KernelResult<()> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(info) = self.symbols.ident_mut(id) else {
                continue;
            };
            if info.level <= new_level || info.promotion_level < new_level {
                continue;
            }
            if info.is_goal() {
                return Err(DeciderError::GoalPromotion {
                    id: self.symbols.display(id),
                }
                .into());
            }
            info.level = new_level;
            info.promotion_level = new_level;
            info.could_be_a_link_from_below = true;
            stack.extend(self.linked_ids(id));
        }
        Ok(())
    }

    fn do_promotion(&mut self) -> KernelResult<()> {
        while let Some(to) = self.decider.promoted_ids.pop() {
            let level = self.symbols.ident(to).map(|i| i.promotion_level);
            if let Some(level) = level {
                self.promote_id_and_tc(to, level)?;
            }
        }
        Ok(())
    }

    /// Remove everything hanging off an identifier nothing links to anymore.
    fn garbage_collect_id(&mut self, id: SymbolId) -> KernelResult<()> {
        tracing::trace!(id = %self.symbols.display(id), "garbage collecting identifier");
        let Some(info) = self.symbols.ident_mut(id) else {
            return Ok(());
        };
        info.unknown_level = false;
        let input_wmes = std::mem::take(&mut info.input_wmes);
        let slots = info.slots.clone();
        if !input_wmes.is_empty() {
            tracing::debug!(
                id = %self.symbols.display(id),
                count = input_wmes.len(),
                "input wmes garbage collected"
            );
        }
        self.remove_wme_list_from_wm(&input_wmes);

        for s in slots {
            let Some(slot) = self.slots.get_mut(s) else {
                continue;
            };
            let wmes = std::mem::take(&mut slot.wmes);
            let prefs = slot.all_preferences.clone();
            self.remove_wme_list_from_wm(&wmes);
            for p in prefs {
                self.remove_preference_from_tm(p)?;
            }
            self.mark_slot_for_possible_removal(s);
        }
        Ok(())
    }

    fn mark_id_and_tc_as_unknown_level(
        &mut self,
        root: SymbolId,
        marked: &mut HashSet<SymbolId>,
        marking: &mut Marking,
    ) {
        let started = self.symbols.level(root);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if marked.contains(&id) {
                continue;
            }
            let Some(info) = self.symbols.ident_mut(id) else {
                continue;
            };
            if info.level < started {
                continue;
            }
            marked.insert(id);
            marking.highest_level_anything_could_fall_from =
                marking.highest_level_anything_could_fall_from.min(info.level);
            marking.lowest_level_anything_could_fall_to =
                marking.lowest_level_anything_could_fall_to.max(info.level);
            if info.could_be_a_link_from_below {
                marking.lowest_level_anything_could_fall_to = LOWEST_POSSIBLE_GOAL_LEVEL;
            }
            if !info.unknown_level {
                info.unknown_level = true;
                self.decider.ids_with_unknown_level.push(id);
            }
            stack.extend(self.linked_ids(id));
        }
    }

    /// Give every unknown-level identifier reachable from `goal` the goal's level.
    fn walk_and_update_levels(&mut self, goal: SymbolId) {
        let walk_level = self.symbols.level(goal);
        let mut visited = HashSet::new();
        let mut stack = vec![goal];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(info) = self.symbols.ident_mut(id) else {
                continue;
            };
            if !info.unknown_level && info.level < walk_level {
                continue;
            }
            if info.unknown_level {
                info.unknown_level = false;
                info.level = walk_level;
                info.promotion_level = walk_level;
                self.decider.ids_with_unknown_level.retain(|&x| x != id);
            }
            stack.extend(
                self.linked_ids(id)
                    .into_iter()
                    .filter(|c| !visited.contains(c)),
            );
        }
    }

    fn do_demotion(&mut self) -> KernelResult<()> {
        let unknown = std::mem::take(&mut self.decider.ids_with_unknown_level);
        for id in unknown {
            let links = self.symbols.ident(id).map_or(0, |i| i.link_count);
            if links == 0 {
                self.decider.disconnected_ids.push(id);
            } else {
                self.decider.ids_with_unknown_level.push(id);
            }
        }

        self.decider.link_update_mode = LinkUpdateMode::UpdateDisconnectedIds;
        while let Some(id) = self.decider.disconnected_ids.pop() {
            self.garbage_collect_id(id)?;
        }
        self.decider.link_update_mode = LinkUpdateMode::Normal;

        if self.decider.ids_with_unknown_level.is_empty() {
            return Ok(());
        }

        let mut marking = Marking {
            highest_level_anything_could_fall_from: LOWEST_POSSIBLE_GOAL_LEVEL,
            lowest_level_anything_could_fall_to: -1,
        };
        let mut marked = HashSet::new();
        for id in self.decider.ids_with_unknown_level.clone() {
            self.mark_id_and_tc_as_unknown_level(id, &mut marked, &mut marking);
        }

        let mut next = self.decider.top_goal;
        while let Some(goal) = next {
            let level = self.symbols.level(goal);
            if level > marking.lowest_level_anything_could_fall_to {
                break;
            }
            if level >= marking.highest_level_anything_could_fall_from {
                self.walk_and_update_levels(goal);
            }
            next = self.symbols.lower_goal(goal);
        }

        self.decider.link_update_mode = LinkUpdateMode::JustUpdateCount;
        while let Some(id) = self.decider.ids_with_unknown_level.pop() {
            self.garbage_collect_id(id)?;
        }
        self.decider.link_update_mode = LinkUpdateMode::Normal;
        Ok(())
    }

    /// Apply buffered promotions, then demote and collect.
    pub(crate) fn do_buffered_link_changes(&mut self) -> KernelResult<()> {
        if self.decider.promoted_ids.is_empty()
            && self.decider.ids_with_unknown_level.is_empty()
            && self.decider.disconnected_ids.is_empty()
        {
            return Ok(());
        }
        self.do_promotion()?;
        self.do_demotion()
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::{Kernel, KernelConfig};
    use crate::symbol::TOP_GOAL_LEVEL;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn link_from_shallower_identifier_promotes_closure() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let deep = k.symbols.new_identifier('X', 3);
        let deeper = k.symbols.new_identifier('Y', 3);
        let attr = k.symbols.intern_str("next");
        let inner = k.wm.make_wme(deep, attr, deeper, false);
        k.symbols.ident_mut(deep).unwrap().input_wmes.push(inner);
        k.add_wme_to_wm(inner);

        let outer = k.wm.make_wme(top, attr, deep, false);
        k.add_wme_to_wm(outer);
        k.do_buffered_link_changes().unwrap();

        assert_eq!(k.symbols.level(deep), TOP_GOAL_LEVEL);
        assert_eq!(k.symbols.level(deeper), TOP_GOAL_LEVEL);
    }

    #[test]
    fn promoting_a_goal_is_fatal() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let goal = k.symbols.new_identifier('S', 2);
        k.symbols.ident_mut(goal).unwrap().goal = Some(Box::default());
        let err = k.promote_id_and_tc(goal, TOP_GOAL_LEVEL).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("promote"));
        assert_eq!(k.symbols.level(top), TOP_GOAL_LEVEL);
    }

    #[test]
    fn links_to_goals_from_wmes_are_not_counted() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let before = k.symbols.ident(top).unwrap().link_count;
        let x = k.symbols.new_identifier('X', 1);
        k.post_link_addition(Some(x), top);
        assert_eq!(k.symbols.ident(top).unwrap().link_count, before);
    }

    #[test]
    fn disconnected_identifier_is_collected() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let attr = k.symbols.intern_str("thing");
        let color = k.symbols.intern_str("color");
        let red = k.symbols.intern_str("red");
        let x = k.symbols.new_identifier('X', 1);
        let link = k.wm.make_wme(top, attr, x, false);
        k.symbols.ident_mut(top).unwrap().input_wmes.push(link);
        k.add_wme_to_wm(link);
        let child = k.wm.make_wme(x, color, red, false);
        k.symbols.ident_mut(x).unwrap().input_wmes.push(child);
        k.add_wme_to_wm(child);
        k.do_buffered_wm_and_ownership_changes().unwrap();
        assert!(k.wm.find(x, color, red).is_some());

        k.symbols.ident_mut(top).unwrap().input_wmes.retain(|&w| w != link);
        k.remove_wme_from_wm(link);
        k.do_buffered_wm_and_ownership_changes().unwrap();

        assert_eq!(k.symbols.ident(x).unwrap().link_count, 0);
        assert!(k.symbols.ident(x).unwrap().input_wmes.is_empty());
        assert!(k.wm.find(x, color, red).is_none());
    }
}
