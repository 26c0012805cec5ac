//! Recognition memory: turning matches into instantiations and preferences.
//!
//! One preference phase runs an inner elaboration loop per goal level, from
//! the highest active goal downwards. Each pass fires the pending matches of
//! the active goal, commits the preferences they made, and moves on to the
//! next lower goal that still has work. A match whose actions would touch a
//! goal at or above the current change level is held back until the levels
//! above it have settled (the waterfall rule).

use crate::cycle::{DiagnosticKind, Phase};
use crate::error::KernelResult;
use crate::kernel::{CycleMode, Kernel};
use crate::match_set::FiringType;
use crate::matcher::{MatchToken, MatchedCondition};
use crate::memory::{
    BacktraceInfo, InstCondition, InstId, Instantiation, PrefId, Preference, PreferenceType,
    ProdId,
};
use crate::production::{
    Action, ActionSupport, DeclaredSupport, MakeAction, ProductionKind, RhsValue,
};
use crate::rhs::{RhsBindings, RhsContext, RhsEffect};
use crate::symbol::{Level, SymbolId, ATTRIBUTE_IMPASSE_LEVEL, TOP_GOAL_LEVEL};

/// Per-kernel recognition-memory state.
#[derive(Debug, Default)]
pub struct RecMemState {
    /// Kind of productions the current elaboration fires.
    pub firing_type: FiringType,
    /// Instantiations created in the current inner elaboration pass.
    pub(crate) newly_created: Vec<InstId>,
    /// Text written by RHS functions, waiting to be collected.
    pub(crate) printed: String,
    /// Justifications built so far; numbers their names.
    pub(crate) justification_count: u64,
}

impl RecMemState {
    pub(crate) fn clear(&mut self) {
        self.firing_type = FiringType::Ie;
        self.newly_created.clear();
        self.printed.clear();
        self.justification_count = 0;
    }
}

/// Everything one firing's actions share.
struct Firing<'a> {
    production: &'a str,
    unbound_names: &'a [String],
    token: &'a MatchToken,
    match_goal_level: Level,
    bindings: RhsBindings,
    effects: Vec<RhsEffect>,
}

impl Kernel {
    // -----------------------------------------------------------------------
    // Instantiating RHS values
    // -----------------------------------------------------------------------

    /// Resolve a right-hand-side value. `None` means the value could not be
    /// produced and the enclosing action is abandoned.
    fn instantiate_rhs_value(
        &mut self,
        firing: &mut Firing<'_>,
        value: &RhsValue,
        new_id_level: Level,
    ) -> Option<SymbolId> {
        match value {
            RhsValue::Symbol(s) => Some(*s),
            RhsValue::Bound(v) => firing.token.binding(*v),
            RhsValue::Unbound(index) => {
                if let Some(sym) = firing.bindings.lookup(*index) {
                    return Some(sym);
                }
                let letter = firing
                    .unbound_names
                    .get(*index)
                    .and_then(|name| name.chars().next())
                    .unwrap_or('I');
                let sym = self.symbols.new_identifier(letter, new_id_level);
                firing.bindings.set(*index, sym);
                Some(sym)
            }
            RhsValue::Call { function, args } => {
                let mut values = Vec::with_capacity(args.len());
                let mut missing = false;
                for arg in args {
                    match self.instantiate_rhs_value(firing, arg, new_id_level) {
                        Some(v) => values.push(v),
                        None => missing = true,
                    }
                }
                if missing {
                    return None;
                }
                let result = {
                    let mut ctx =
                        RhsContext::new(&mut self.symbols, firing.production, &mut firing.effects);
                    self.rhs_functions.call(function, &mut ctx, &values)
                };
                match result {
                    Ok(v) => v,
                    Err(e) => {
                        let args: Vec<String> =
                            values.iter().map(|&v| self.symbols.display(v)).collect();
                        self.record_diagnostic(
                            DiagnosticKind::RhsFunctionFailed,
                            Some(firing.production),
                            format!(
                                "error executing RHS function '{function}' with args [{}]: {e}",
                                args.join(", ")
                            ),
                        );
                        None
                    }
                }
            }
        }
    }

    fn execute_make(&mut self, firing: &mut Firing<'_>, m: &MakeAction) -> Option<Preference> {
        let id = self.instantiate_rhs_value(firing, &m.id, firing.match_goal_level)?;
        if !self.symbols.is_identifier(id) {
            let shown = self.symbols.display(id);
            self.record_diagnostic(
                DiagnosticKind::NonIdentifierPreference,
                Some(firing.production),
                format!("RHS makes a preference for {shown} (not an identifier)"),
            );
            return None;
        }
        let id_level = self.symbols.level(id);
        let attr = self.instantiate_rhs_value(firing, &m.attr, id_level)?;
        let value = self.instantiate_rhs_value(firing, &m.value, id_level)?;
        let referent = match (&m.referent, m.pref_type.is_binary()) {
            (Some(r), true) => Some(self.instantiate_rhs_value(firing, r, id_level)?),
            (None, false) => None,
            (r, binary) => {
                let message = if binary {
                    format!("{} preference without a referent", m.pref_type)
                } else {
                    format!("{} preference given a referent {r:?}", m.pref_type)
                };
                self.record_diagnostic(
                    DiagnosticKind::MalformedPreference,
                    Some(firing.production),
                    message,
                );
                return None;
            }
        };

        if !matches!(m.pref_type, PreferenceType::Acceptable | PreferenceType::Reject)
            && !(self.symbols.is_goal(id) && attr == self.predefined.operator)
        {
            let message = format!(
                "attribute preference other than +/- for {} ^{} -- ignoring it.",
                self.symbols.display(id),
                self.symbols.display(attr)
            );
            self.record_diagnostic(
                DiagnosticKind::MalformedPreference,
                Some(firing.production),
                message,
            );
            return None;
        }

        let mut pref_type = m.pref_type;
        let numeric = referent.and_then(|r| self.symbols.as_f64(r));
        if pref_type == PreferenceType::BinaryIndifferent && numeric.is_some() {
            pref_type = PreferenceType::NumericIndifferent;
        }
        let mut pref = Preference::new(pref_type, id, attr, value, referent);
        if pref_type == PreferenceType::NumericIndifferent {
            pref.numeric_value = numeric.unwrap_or_default();
        }
        Some(pref)
    }

    /// Run one action. Function actions run for their side effects only.
    fn execute_action(&mut self, firing: &mut Firing<'_>, action: &Action) -> Vec<Preference> {
        let (mut made, pref_type): (Vec<Preference>, PreferenceType) = match action {
            Action::Call(call) => {
                self.instantiate_rhs_value(firing, call, firing.match_goal_level);
                (Vec::new(), PreferenceType::Acceptable)
            }
            Action::Make(m) => (self.execute_make(firing, m).into_iter().collect(), m.pref_type),
        };
        // Preferences queued by functions take the calling action's type.
        let mut kept = Vec::with_capacity(firing.effects.len());
        for effect in firing.effects.drain(..) {
            match effect {
                RhsEffect::AddWme { id, attr, value } => {
                    made.push(Preference::new(pref_type, id, attr, value, None));
                }
                other => kept.push(other),
            }
        }
        firing.effects = kept;
        made
    }

    // -----------------------------------------------------------------------
    // Instantiations
    // -----------------------------------------------------------------------

    /// Deepest goal among the positively matched WMEs, and its level.
    pub(crate) fn find_match_goal(
        &self,
        conditions: &[InstCondition],
    ) -> (Option<SymbolId>, Level) {
        let mut goal = None;
        let mut level = -1;
        for bt in conditions.iter().filter_map(InstCondition::backtrace) {
            let Some(w) = self.wm.get(bt.wme) else {
                continue;
            };
            if self.symbols.is_goal(w.id) && bt.level > level {
                goal = Some(w.id);
                level = bt.level;
            }
        }
        match goal {
            Some(g) => (Some(g), level),
            None => (None, ATTRIBUTE_IMPASSE_LEVEL),
        }
    }

    /// Fire one match.
    pub(crate) fn create_instantiation(
        &mut self,
        prod: ProdId,
        token: MatchToken,
    ) -> KernelResult<Option<InstId>> {
        let Some(record) = self.productions.get_mut(prod) else {
            tracing::trace!(%prod, "match for a released production ignored");
            return Ok(None);
        };
        record.firing_count += 1;
        let name = record.name.clone();
        let kind = record.kind;
        let declared = record.declared_support;
        let actions = record.actions.clone();
        let unbound_names = record.rhs_unbound.clone();
        self.cycle.stats.production_firings += 1;

        let mut inst = Instantiation::new(prod, name.clone(), token.clone());
        for cond in self.matcher.instantiate_conditions(prod, &token) {
            match cond {
                MatchedCondition::Positive(w) => {
                    let (level, trace) = self
                        .wm
                        .get(w)
                        .map(|x| (self.symbols.level(x.id), x.preference))
                        .unwrap_or((0, None));
                    self.wm.add_ref(w);
                    inst.conditions.push(InstCondition::Positive(BacktraceInfo {
                        wme: w,
                        level,
                        trace,
                        prohibits: Vec::new(),
                    }));
                }
                MatchedCondition::Negative {
                    id,
                    attr,
                    value,
                    acceptable,
                } => inst.conditions.push(InstCondition::Negative {
                    id,
                    attr,
                    value,
                    acceptable,
                }),
            }
        }
        let (match_goal, match_goal_level) = self.find_match_goal(&inst.conditions);
        inst.match_goal = match_goal;
        inst.match_goal_level = match_goal_level;
        let inst_id = self.insts.insert(inst);
        self.recmem.newly_created.push(inst_id);
        tracing::debug!(production = %name, level = match_goal_level, "firing");

        let mut firing = Firing {
            production: &name,
            unbound_names: &unbound_names,
            token: &token,
            match_goal_level,
            bindings: RhsBindings::new(unbound_names.len()),
            effects: Vec::new(),
        };
        let operand2 = self.config.cycle_mode == CycleMode::Operand2;
        let mut need_support_calculation = declared == DeclaredSupport::Undeclared && operand2;
        if kind != ProductionKind::Template {
            for action in &actions {
                let compiled = action.as_make().map_or(ActionSupport::Unknown, |m| m.support);
                for pref in self.execute_action(&mut firing, action) {
                    let o_supported = match declared {
                        DeclaredSupport::OSupport => true,
                        DeclaredSupport::ISupport => false,
                        DeclaredSupport::Undeclared if operand2 => {
                            self.recmem.firing_type == FiringType::Pe
                        }
                        DeclaredSupport::Undeclared => match compiled {
                            ActionSupport::O => true,
                            ActionSupport::I => false,
                            ActionSupport::Unknown => {
                                need_support_calculation = true;
                                false
                            }
                        },
                    };
                    let p = self.prefs.insert(pref);
                    self.prefs[p].inst = Some(inst_id);
                    self.prefs[p].o_supported = o_supported;
                    self.insts[inst_id].insert_generated_preference(p);
                }
            }
        }
        let effects = std::mem::take(&mut firing.effects);

        self.fill_in_new_instantiation_stuff(inst_id, need_support_calculation);
        self.build_prohibits_list(inst_id);

        let numeric: Vec<PrefId> = self.insts[inst_id]
            .preferences_generated
            .iter()
            .copied()
            .filter(|&p| self.prefs[p].pref_type == PreferenceType::NumericIndifferent)
            .collect();
        self.with_learning(|hooks, k| {
            if !numeric.is_empty() {
                hooks.on_numeric_preferences(k, inst_id, &numeric);
            }
            hooks.on_instantiation(k, inst_id);
        });
        self.build_justification(inst_id)?;

        for effect in effects {
            match effect {
                RhsEffect::Write(text) => {
                    tracing::info!(target: "akh_kernel::print", production = %name, "{text}");
                    self.recmem.printed.push_str(&text);
                }
                RhsEffect::Halt => self.halt(format!("halt requested by production {name}")),
                RhsEffect::Interrupt => self.interrupt(&name),
                RhsEffect::AddWme { .. } => {}
            }
        }
        Ok(Some(inst_id))
    }

    /// Take references, pick trace clones at the instantiation's level, file
    /// preferences on the match goal, and compute run-time support.
    pub(crate) fn fill_in_new_instantiation_stuff(
        &mut self,
        inst: InstId,
        need_support_calculation: bool,
    ) {
        let (prod, level, match_goal) = {
            let i = &self.insts[inst];
            (i.prod, i.match_goal_level, i.match_goal)
        };
        if let Some(prod) = prod {
            self.productions.add_ref(prod);
        }

        let count = self.insts[inst].conditions.len();
        for index in 0..count {
            let Some(trace) = self.insts[inst].conditions[index]
                .backtrace()
                .and_then(|bt| bt.trace)
            else {
                continue;
            };
            let mut resolved = Some(trace);
            if self.preference_level(trace).is_some_and(|l| l > level) {
                resolved = self.find_clone_for_level(trace, level);
                if resolved.is_none() {
                    tracing::trace!(
                        preference = %self.preference_to_string(trace),
                        level,
                        "no clone at match-goal level; backtrace stops here"
                    );
                }
            }
            if let Some(p) = resolved.filter(|_| level > TOP_GOAL_LEVEL) {
                self.preference_add_ref(p);
            }
            if let Some(bt) = self.insts[inst].conditions[index].backtrace_mut() {
                bt.trace = resolved;
            }
        }

        if let Some(goal) = match_goal {
            let prefs = self.insts[inst].preferences_generated.clone();
            if let Some(info) = self.symbols.goal_mut(goal) {
                info.preferences_from_goal.extend(prefs.iter().copied());
            }
            for p in prefs {
                self.prefs[p].on_goal_list = true;
            }
        }

        if need_support_calculation {
            self.calculate_support_for_instantiation(inst);
        }
    }

    /// Record, for each traced condition, the prohibit preferences in the
    /// traced preference's slot at this instantiation's level.
    pub(crate) fn build_prohibits_list(&mut self, inst: InstId) {
        let level = self.insts[inst].match_goal_level;
        let count = self.insts[inst].conditions.len();
        for index in 0..count {
            let Some(bt) = self.insts[inst].conditions[index].backtrace_mut() else {
                continue;
            };
            bt.prohibits.clear();
            let Some(slot) = bt.trace.and_then(|t| self.prefs.get(t)).and_then(|t| t.slot) else {
                continue;
            };
            let candidates: Vec<PrefId> = self
                .slots
                .get(slot)
                .map(|s| s.preferences_of(PreferenceType::Prohibit).to_vec())
                .unwrap_or_default();
            let mut prohibits = Vec::new();
            for p in candidates {
                let in_tm = |k: &Kernel, q: PrefId| k.prefs.get(q).is_some_and(Preference::in_tm);
                if self.preference_level(p) == Some(level) && in_tm(self, p) {
                    prohibits.push(p);
                } else if let Some(c) = self.find_clone_for_level(p, level) {
                    if in_tm(self, c) {
                        prohibits.push(c);
                    }
                }
            }
            if level > TOP_GOAL_LEVEL {
                for &p in &prohibits {
                    self.preference_add_ref(p);
                }
            }
            if let Some(bt) = self.insts[inst].conditions[index].backtrace_mut() {
                bt.prohibits = prohibits;
            }
        }
    }

    /// Withdraw an instantiation whose match went away. Its i-supported
    /// preferences leave temporary memory; o-supported ones stay.
    pub(crate) fn retract_instantiation(&mut self, inst: InstId) -> KernelResult<()> {
        let Some(record) = self.insts.get(inst) else {
            return Ok(());
        };
        let prod = record.prod;
        let retracting: Vec<PrefId> = record
            .preferences_generated
            .iter()
            .copied()
            .filter(|&p| self.prefs.get(p).is_some_and(|x| x.in_tm() && !x.o_supported))
            .collect();
        if !retracting.is_empty() {
            tracing::debug!(production = %record.prod_name, "retracting");
        }
        for p in retracting {
            tracing::trace!(preference = %self.preference_to_string(p), "retracting preference");
            self.remove_preference_from_tm(p)?;
        }

        let mut excise = None;
        if let Some(record) = prod.and_then(|p| self.productions.get_mut(p)) {
            record.instantiations.retain(|&i| i != inst);
            if record.kind == ProductionKind::Justification && record.reference_count > 1 {
                excise = Some(record.name.clone());
            }
        }
        if let Some(name) = excise {
            self.excise_production(&name)?;
        }

        if let Some(record) = self.insts.get_mut(inst) {
            record.in_ms = false;
        }
        self.possibly_deallocate_instantiation(inst)
    }

    /// Commit the preferences made in this inner pass. O-supported rejects
    /// go first and purge their value from the slot.
    fn assert_new_preferences(&mut self) -> KernelResult<()> {
        let newly = std::mem::take(&mut self.recmem.newly_created);

        let o_rejects: Vec<PrefId> = newly
            .iter()
            .filter_map(|&i| self.insts.get(i))
            .flat_map(|i| i.preferences_generated.iter().copied())
            .filter(|&p| {
                self.prefs
                    .get(p)
                    .is_some_and(|x| x.pref_type == PreferenceType::Reject && x.o_supported)
            })
            .collect();
        if !o_rejects.is_empty() {
            self.process_o_rejects(&o_rejects)?;
        }

        for &inst in &newly {
            let Some(record) = self.insts.get(inst) else {
                continue;
            };
            let (prod, in_ms) = (record.prod, record.in_ms);
            let prefs = record.preferences_generated.clone();
            if in_ms {
                if let Some(p) = prod.and_then(|p| self.productions.get_mut(p)) {
                    if !p.instantiations.contains(&inst) {
                        p.instantiations.insert(0, inst);
                    }
                }
            }
            for p in prefs {
                let Some(pref) = self.prefs.get(p) else {
                    continue;
                };
                let o_reject = pref.pref_type == PreferenceType::Reject && pref.o_supported;
                if !o_reject && (in_ms || pref.o_supported) {
                    self.add_preference_to_tm(p);
                } else {
                    if self.remove_preference_from_clones(p)? {
                        continue;
                    }
                    self.preference_add_ref(p);
                    self.preference_remove_ref(p)?;
                }
            }
        }
        Ok(())
    }

    fn process_o_rejects(&mut self, o_rejects: &[PrefId]) -> KernelResult<()> {
        for &p in o_rejects {
            self.preference_add_ref(p);
        }
        for &p in o_rejects {
            let (id, attr, value) = {
                let x = &self.prefs[p];
                (x.id, x.attr, x.value)
            };
            if let Some(slot) = self.find_slot(id, attr) {
                let same_value: Vec<PrefId> = self.slots[slot]
                    .all_preferences
                    .iter()
                    .copied()
                    .filter(|&q| self.prefs.get(q).is_some_and(|x| x.value == value))
                    .collect();
                for q in same_value {
                    self.remove_preference_from_tm(q)?;
                }
            }
            self.preference_remove_ref(p)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Preference phase
    // -----------------------------------------------------------------------

    /// Whether a held-back match may fire now.
    fn should_create_instantiation(&mut self, prod: ProdId, token: &MatchToken) -> bool {
        if self.decider.active_level == self.decider.highest_active_level {
            return true;
        }
        let Some(record) = self.productions.get(prod) else {
            return false;
        };
        if record.kind == ProductionKind::Template {
            return true;
        }
        for m in record.actions.iter().filter_map(Action::as_make) {
            let id = match &m.id {
                RhsValue::Symbol(s) => Some(*s),
                RhsValue::Bound(v) => token.binding(*v),
                RhsValue::Unbound(_) | RhsValue::Call { .. } => continue,
            };
            let Some(id) = id.filter(|&i| self.symbols.is_identifier(i)) else {
                continue;
            };
            let level = self.symbols.level(id);
            if level <= self.decider.change_level {
                tracing::trace!(
                    production = %record.name,
                    id = %self.symbols.display(id),
                    level,
                    change_level = self.decider.change_level,
                    "waterfall: holding back firing"
                );
                return false;
            }
        }
        true
    }

    /// Fire and retract everything pending, one goal level at a time.
    pub(crate) fn do_preference_phase(&mut self) -> KernelResult<()> {
        tracing::debug!(
            firing_type = ?self.recmem.firing_type,
            level = self.decider.active_level,
            "firing productions"
        );
        self.decider.highest_active_level = self.decider.active_level;
        self.decider.highest_active_goal = self.decider.active_goal;
        self.decider.change_level = self.decider.highest_active_level;
        self.decider.next_change_level = self.decider.highest_active_level;

        loop {
            self.decider.change_level = self.decider.next_change_level;
            tracing::trace!(level = self.decider.active_level, "inner elaboration pass");
            self.recmem.newly_created.clear();

            let mut assertions_exist = false;
            while let Some((prod, token)) = self.postpone_assertion() {
                assertions_exist = true;
                if self.learning.max_chunks_reached() {
                    self.consume_last_postponed_assertion();
                    self.halt("Max chunks reached");
                    return Ok(());
                }
                let kind = self.productions.get(prod).map(|p| p.kind);
                if kind == Some(ProductionKind::Justification) {
                    self.consume_last_postponed_assertion();
                    continue;
                }
                if self.should_create_instantiation(prod, &token) {
                    self.consume_last_postponed_assertion();
                    self.create_instantiation(prod, token)?;
                }
            }

            if assertions_exist && self.decider.active_level > self.decider.next_change_level {
                self.decider.next_change_level = self.decider.active_level;
            }

            self.restore_postponed_assertions();
            self.assert_new_preferences()?;
            self.cycle.stats.inner_elaboration_cycles += 1;

            if self.config.cycle_mode == CycleMode::Legacy {
                break;
            }
            let Some(active) = self.decider.active_goal else {
                tracing::trace!("inner elaboration loop has no active goal");
                break;
            };
            let Some(lower) = self.symbols.lower_goal(active) else {
                tracing::trace!("inner elaboration loop at bottom goal");
                break;
            };
            let next = if self.cycle.current_phase == Phase::Apply {
                self.highest_active_goal_apply(Some(lower))
            } else {
                self.highest_active_goal_propose(Some(lower))
            };
            match next {
                Some(goal) => {
                    self.decider.active_goal = Some(goal);
                    self.decider.active_level = self.symbols.level(goal);
                }
                None => {
                    tracing::trace!("inner elaboration loop finished below quiescence");
                    self.decider.active_goal = None;
                    break;
                }
            }
        }

        self.decider.active_level = self.decider.highest_active_level;
        self.decider.active_goal = self.decider.highest_active_goal;

        while let Some(inst) = self.get_next_retraction() {
            self.retract_instantiation(inst)?;
        }
        while let Some(inst) = self.get_next_nil_goal_retraction() {
            self.retract_instantiation(inst)?;
        }
        Ok(())
    }

    /// Text written by RHS functions since the last call.
    pub fn take_printed_output(&mut self) -> String {
        std::mem::take(&mut self.recmem.printed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::production::{ProductionBuilder, Term};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    fn fire_all(k: &mut Kernel, firing_type: FiringType) {
        k.do_buffered_wm_changes().unwrap();
        k.decider.active_goal = k.top_goal();
        k.decider.active_level = TOP_GOAL_LEVEL;
        k.recmem.firing_type = firing_type;
        k.cycle.current_phase = Phase::Propose;
        k.do_preference_phase().unwrap();
    }

    #[test]
    fn firing_creates_preferences_on_match_goal() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("elab")
                .state("<s>", "superstate", "nil")
                .make("<s>", "foo", 1, PreferenceType::Acceptable),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);

        let prod = k.production("elab").unwrap();
        assert_eq!(prod.firing_count, 1);
        assert_eq!(prod.instantiations.len(), 1);
        let inst = &k.insts[prod.instantiations[0]];
        let top = k.top_goal().unwrap();
        assert_eq!(inst.match_goal, Some(top));
        assert_eq!(inst.match_goal_level, TOP_GOAL_LEVEL);
        let pref = &k.prefs[inst.preferences_generated[0]];
        assert!(pref.in_tm());
        assert!(pref.on_goal_list);
        assert!(!pref.o_supported);
    }

    #[test]
    fn unbound_variables_share_one_identifier_per_firing() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("make-block")
                .state("<s>", "superstate", "nil")
                .make("<s>", "block", "<b>", PreferenceType::Acceptable)
                .make("<b>", "color", "red", PreferenceType::Acceptable),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);
        let prod = k.production("make-block").unwrap();
        let inst = &k.insts[prod.instantiations[0]];
        let prefs: Vec<&Preference> =
            inst.preferences_generated.iter().map(|&p| &k.prefs[p]).collect();
        let block = prefs.iter().find(|p| k.symbols.as_str(p.attr) == Some("block")).unwrap();
        let color = prefs.iter().find(|p| k.symbols.as_str(p.attr) == Some("color")).unwrap();
        assert_eq!(block.value, color.id);
        assert_eq!(k.symbols.display(block.value), "B1");
        assert_eq!(k.symbols.level(block.value), TOP_GOAL_LEVEL);
    }

    #[test]
    fn non_plus_minus_preference_on_plain_attribute_is_rejected() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("bad")
                .state("<s>", "superstate", "nil")
                .make("<s>", "foo", "bar", PreferenceType::Best),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);
        let prod = k.production("bad").unwrap();
        let inst = &k.insts[prod.instantiations[0]];
        assert!(inst.preferences_generated.is_empty());
        assert!(k
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::MalformedPreference));
    }

    #[test]
    fn failing_function_abandons_only_its_action() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("half-bad")
                .state("<s>", "superstate", "nil")
                .make(
                    "<s>",
                    "sum",
                    Term::call("+", vec!["word".into()]),
                    PreferenceType::Acceptable,
                )
                .make("<s>", "ok", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);
        let prod = k.production("half-bad").unwrap();
        let inst = &k.insts[prod.instantiations[0]];
        assert_eq!(inst.preferences_generated.len(), 1);
        assert!(k
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::RhsFunctionFailed));
    }

    #[test]
    fn write_goes_to_printed_output() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("hello")
                .state("<s>", "superstate", "nil")
                .call(Term::call("write", vec!["hello ".into(), "world".into()])),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);
        assert_eq!(k.take_printed_output(), "hello world");
        assert_eq!(k.take_printed_output(), "");
    }

    #[test]
    fn retraction_keeps_o_supported_preferences() {
        let mut k = kernel();
        let top = k.top_goal().unwrap();
        let trigger = k.symbols.intern_str("trigger");
        let on = k.symbols.intern_str("on");
        let w = k.add_input_wme(top, trigger, on).unwrap();
        k.add_production(
            ProductionBuilder::new("remember")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "trigger", "on")
                .make("<s>", "seen", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        k.add_production(
            ProductionBuilder::new("mirror")
                .state("<s>", "trigger", "on")
                .make("<s>", "mirror", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Pe);
        fire_all(&mut k, FiringType::Ie);
        let seen = k.symbols.find_str("seen").unwrap();
        let mirror = k.symbols.find_str("mirror").unwrap();
        let mirror_slot = k.find_slot(top, mirror).unwrap();
        assert_eq!(k.slots[mirror_slot].all_preferences.len(), 1);

        k.remove_input_wme(w).unwrap();
        fire_all(&mut k, FiringType::Ie);

        let seen_slot = k.find_slot(top, seen).unwrap();
        assert_eq!(k.slots[seen_slot].all_preferences.len(), 1);
        assert!(k
            .find_slot(top, mirror)
            .map_or(true, |s| k.slots[s].all_preferences.is_empty()));
        assert!(k.production("mirror").unwrap().instantiations.is_empty());
    }

    #[test]
    fn o_reject_purges_same_value_from_slot() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("add")
                .state("<s>", "superstate", "nil")
                .make("<s>", "color", "red", PreferenceType::Acceptable),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Ie);
        let top = k.top_goal().unwrap();
        let color = k.symbols.find_str("color").unwrap();
        let slot = k.find_slot(top, color).unwrap();
        assert_eq!(k.slots[slot].all_preferences.len(), 1);

        k.add_production(
            ProductionBuilder::new("scrub")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "superstate", "nil")
                .make("<s>", "color", "red", PreferenceType::Reject),
        )
        .unwrap();
        fire_all(&mut k, FiringType::Pe);
        let remaining: Vec<PreferenceType> = k
            .find_slot(top, color)
            .map(|s| {
                k.slots[s]
                    .all_preferences
                    .iter()
                    .map(|&p| k.prefs[p].pref_type)
                    .collect()
            })
            .unwrap_or_default();
        assert!(!remaining.contains(&PreferenceType::Acceptable));
    }
}
