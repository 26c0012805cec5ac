//! Goal dependency sets.
//!
//! When a substate creates an o-supported WME, the supergoal WMEs its
//! creating instantiation (transitively, through local i-supported WMEs)
//! depended on are collected in the substate's GDS. Removing any of them
//! removes the substate: its persistent results were computed from a
//! context that no longer holds.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{DeciderError, KernelResult};
use crate::kernel::Kernel;
use crate::memory::{GdsId, InstCondition, InstId, PreferenceType, WmeId};
use crate::symbol::{Level, SymbolId, TOP_GOAL_LEVEL};

/// The WMEs a goal's o-supported results depend on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Gds {
    /// `None` once the goal has been removed from the stack.
    pub goal: Option<SymbolId>,
    pub wmes: Vec<WmeId>,
}

impl Kernel {
    pub(crate) fn create_gds_for_goal(&mut self, goal: SymbolId) -> GdsId {
        let gds = self.gds.insert(Gds {
            goal: Some(goal),
            wmes: Vec::new(),
        });
        if let Some(info) = self.symbols.goal_mut(goal) {
            info.gds = Some(gds);
        }
        tracing::debug!(goal = %self.symbols.display(goal), "created goal dependency set");
        gds
    }

    fn add_wme_to_gds(&mut self, gds: GdsId, w: WmeId) {
        self.gds[gds].wmes.insert(0, w);
        self.wm[w].gds = Some(gds);
        tracing::trace!(
            goal = ?self.gds[gds].goal.map(|g| self.symbols.display(g)),
            wme = %w,
            "adding to goal dependency set"
        );
    }

    /// Take `w` off its GDS, freeing the set when it becomes empty.
    pub(crate) fn remove_wme_from_gds(&mut self, w: WmeId) {
        let Some(gds) = self.wm.get_mut(w).and_then(|wme| wme.gds.take()) else {
            return;
        };
        let Some(set) = self.gds.get_mut(gds) else {
            return;
        };
        set.wmes.retain(|&x| x != w);
        if set.wmes.is_empty() {
            let goal = set.goal;
            self.gds.remove(gds);
            if let Some(info) = goal.and_then(|g| self.symbols.goal_mut(g)) {
                if info.gds == Some(gds) {
                    info.gds = None;
                }
            }
        }
    }

    /// Move `w` into `target` unless it already belongs to the GDS of a
    /// goal at or above `level`.
    fn move_wme_to_gds(&mut self, target: GdsId, w: WmeId, level: Level) {
        match self.wm[w].gds {
            Some(current) if current == target => {}
            Some(current) => {
                let owner = self.gds.get(current).and_then(|g| g.goal);
                let stale = match owner {
                    None => true,
                    Some(goal) => self.symbols.level(goal) > level,
                };
                if stale {
                    self.remove_wme_from_gds(w);
                    self.add_wme_to_gds(target, w);
                }
            }
            None => self.add_wme_to_gds(target, w),
        }
    }

    /// Called when a newly committed WME is supported by an o-supported
    /// preference from a substate instantiation.
    pub(crate) fn update_gds_for_new_wme(&mut self, w: WmeId) -> KernelResult<()> {
        let Some(p) = self.wm[w].preference else {
            return Ok(());
        };
        let Some(inst) = self.prefs[p].inst else {
            return Ok(());
        };
        let (match_goal, match_level) = {
            let i = &self.insts[inst];
            (i.match_goal, i.match_goal_level)
        };
        if !self.prefs[p].o_supported || match_level == TOP_GOAL_LEVEL {
            return Ok(());
        }
        let Some(match_goal) = match_goal else {
            return Ok(());
        };
        let id_level = self.symbols.level(self.prefs[p].id);

        if self.symbols.goal(match_goal).is_some_and(|g| g.gds.is_none()) {
            if match_level == id_level {
                self.create_gds_for_goal(match_goal);
            } else if !self.cycle.is_halted() {
                return Err(DeciderError::GdsLevelMismatch {
                    wme_level: id_level,
                    inst_level: match_level,
                }
                .into());
            }
        }
        if self.cycle.is_halted() {
            return Ok(());
        }

        // Instantiations behind this preference and the later ones of its type.
        let (s, ty) = {
            let pref = &self.prefs[p];
            (pref.slot, pref.pref_type)
        };
        let supporting: Vec<_> = match s.and_then(|s| self.slots.get(s)) {
            Some(slot) => {
                let list = slot.preferences_of(ty);
                let start = list.iter().position(|&q| q == p).unwrap_or(0);
                list[start..].to_vec()
            }
            None => vec![p],
        };
        let mut queue = VecDeque::new();
        for q in supporting {
            let Some(i) = self.prefs[q].inst else {
                continue;
            };
            let record = &mut self.insts[i];
            if record.gds_evaluated_already {
                continue;
            }
            if record.match_goal_level > id_level {
                continue;
            }
            record.gds_evaluated_already = true;
            queue.push_back(i);
        }
        self.elaborate_gds(queue);
        Ok(())
    }

    /// Walk the conditions of the queued instantiations, adding supergoal
    /// and architectural WMEs to the match goal's GDS and following local
    /// i-supported WMEs back to the instantiations that made them.
    fn elaborate_gds(&mut self, mut queue: VecDeque<InstId>) {
        while let Some(inst) = queue.pop_front() {
            let Some(record) = self.insts.get(inst) else {
                continue;
            };
            let inst_level = record.match_goal_level;
            let Some(target) = record
                .match_goal
                .and_then(|g| self.symbols.goal(g))
                .and_then(|g| g.gds)
            else {
                continue;
            };
            let tested: Vec<(WmeId, Level)> = record
                .conditions
                .iter()
                .filter_map(|c| match c {
                    InstCondition::Positive(bt) => Some((bt.wme, bt.level)),
                    _ => None,
                })
                .collect();

            for (w, wme_level) in tested {
                let Some(wme) = self.wm.get(w) else {
                    continue;
                };
                let (wme_value, wme_pref) = (wme.value, wme.preference);
                match wme_pref {
                    None => self.move_wme_to_gds(target, w, inst_level),
                    Some(_) if wme_level < inst_level => {
                        self.move_wme_to_gds(target, w, inst_level)
                    }
                    Some(p) => {
                        let Some(pref) = self.prefs.get(p) else {
                            continue;
                        };
                        if pref.o_supported || inst_level == TOP_GOAL_LEVEL {
                            continue;
                        }
                        match self.find_slot(pref.id, pref.attr) {
                            None => {
                                // Goal ^item preference: depend on the
                                // acceptable-preference WME it stands for.
                                let item_wme = pref
                                    .inst
                                    .and_then(|i| self.insts.get(i))
                                    .and_then(|i| i.conditions.first())
                                    .and_then(InstCondition::backtrace)
                                    .map(|bt| bt.wme);
                                if let Some(ap) = item_wme.filter(|&ap| self.wm.contains(ap)) {
                                    self.move_wme_to_gds(target, ap, inst_level);
                                }
                            }
                            Some(s) => {
                                let acceptables = self.slots[s]
                                    .preferences_of(PreferenceType::Acceptable)
                                    .to_vec();
                                for q in acceptables {
                                    if self.prefs[q].value != wme_value {
                                        continue;
                                    }
                                    let Some(i) = self.prefs[q].inst else {
                                        continue;
                                    };
                                    let producer = &mut self.insts[i];
                                    if producer.gds_evaluated_already {
                                        continue;
                                    }
                                    producer.gds_evaluated_already = true;
                                    if producer.match_goal_level <= inst_level {
                                        queue.push_back(i);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// A WME in a goal's GDS changed: remove the goal and everything below.
    pub(crate) fn gds_invalid_so_remove_goal(&mut self, w: WmeId) -> KernelResult<()> {
        let Some(goal) = self
            .wm
            .get(w)
            .and_then(|wme| wme.gds)
            .and_then(|g| self.gds.get(g))
            .and_then(|g| g.goal)
        else {
            return Ok(());
        };
        let higher = self.symbols.higher_goal(goal);
        match self.tempmem.highest_goal_whose_context_changed {
            Some(changed) => {
                if self.symbols.level(changed) >= self.symbols.level(goal) {
                    self.tempmem.highest_goal_whose_context_changed = higher;
                }
            }
            None => {
                self.tempmem.highest_goal_whose_context_changed = higher;
                let slots = higher
                    .and_then(|h| self.symbols.ident(h))
                    .map(|i| i.slots.clone())
                    .unwrap_or_default();
                for s in slots {
                    if let Some(slot) = self.slots.get_mut(s).filter(|x| x.isa_context_slot) {
                        slot.changed = true;
                    }
                }
            }
        }
        tracing::info!(
            goal = %self.symbols.display(goal),
            wme = %w,
            "removing state because an element of its goal dependency set changed"
        );
        self.remove_existing_context_and_descendents(goal)
    }
}
