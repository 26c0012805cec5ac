//! Justifications: how a result outlives the substate that made it.
//!
//! A preference made in a substate for an identifier of a shallower goal is a
//! result. Every firing with results gets a justification: a production whose
//! conditions are the supergoal WMEs the results were derived from and whose
//! actions remake the results. Its instantiation holds clones of the results
//! at the level of those WMEs, so they survive the substate and are retracted
//! when the supporting WMEs change.
//!
//! Justifications are built whether or not learning is enabled. Conditions
//! are positive constant tests only; negated conditions of the backtraced
//! instantiations are not carried over.

use std::collections::HashSet;

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::matcher::MatchToken;
use crate::memory::{
    BacktraceInfo, InstCondition, InstId, Instantiation, PrefId, Preference, ProdId, WmeId,
};
use crate::production::{
    Action, ActionSupport, Condition, ConditionPattern, DeclaredSupport, MakeAction, Production,
    ProductionKind, RhsValue, Test,
};
use crate::symbol::{Level, SymbolId};

/// Results of one instantiation, gathered level by level.
struct Results {
    level: Level,
    prefs: Vec<PrefId>,
    seen_ids: HashSet<SymbolId>,
    extra: Vec<PrefId>,
}

impl Kernel {
    /// Whether `a` and `b` would make the same preference.
    fn same_preference(&self, a: PrefId, b: PrefId) -> bool {
        let (Some(a), Some(b)) = (self.prefs.get(a), self.prefs.get(b)) else {
            return false;
        };
        a.id == b.id
            && a.attr == b.attr
            && a.value == b.value
            && a.pref_type == b.pref_type
            && (!a.pref_type.is_binary() || a.referent == b.referent)
    }

    fn add_pref_to_results(&self, results: &mut Results, pref: PrefId) {
        if results.prefs.iter().any(|&r| self.same_preference(r, pref)) {
            return;
        }
        let Some(pref) = self.find_clone_for_level(pref, results.level) else {
            return;
        };
        results.prefs.push(pref);
        let Some(p) = self.prefs.get(pref) else {
            return;
        };
        let (value, referent) = (p.value, p.referent.filter(|_| p.pref_type.is_binary()));
        self.add_results_if_needed(results, value);
        if let Some(r) = referent {
            self.add_results_if_needed(results, r);
        }
    }

    /// Follow a result's value into identifiers local to the substate.
    fn add_results_if_needed(&self, results: &mut Results, sym: SymbolId) {
        if self.symbols.is_identifier(sym)
            && self.symbols.level(sym) >= results.level
            && !results.seen_ids.contains(&sym)
        {
            self.add_results_for_id(results, sym);
        }
    }

    fn add_results_for_id(&self, results: &mut Results, id: SymbolId) {
        results.seen_ids.insert(id);
        let Some(info) = self.symbols.ident(id) else {
            return;
        };
        let input: Vec<SymbolId> = info
            .input_wmes
            .iter()
            .filter_map(|&w| self.wm.get(w))
            .map(|w| w.value)
            .collect();
        let slots = info.slots.clone();
        for value in input {
            self.add_results_if_needed(results, value);
        }
        for slot in slots.iter().filter_map(|&s| self.slots.get(s)) {
            for &p in &slot.all_preferences {
                self.add_pref_to_results(results, p);
            }
            for value in slot.wmes.iter().filter_map(|&w| self.wm.get(w)).map(|w| w.value) {
                self.add_results_if_needed(results, value);
            }
        }
        let extra: Vec<PrefId> = results
            .extra
            .iter()
            .copied()
            .filter(|&p| self.prefs.get(p).is_some_and(|x| x.id == id))
            .collect();
        for p in extra {
            self.add_pref_to_results(results, p);
        }
    }

    /// Preferences of `inst` that are results: their identifier belongs to a
    /// goal above the match goal, or is reached from one through the values
    /// of other results.
    fn results_of_instantiation(&self, inst: InstId) -> Vec<PrefId> {
        let Some(record) = self.insts.get(inst) else {
            return Vec::new();
        };
        let mut results = Results {
            level: record.match_goal_level,
            prefs: Vec::new(),
            seen_ids: HashSet::new(),
            extra: record.preferences_generated.clone(),
        };
        for &p in &record.preferences_generated {
            let Some(pref) = self.prefs.get(p) else {
                continue;
            };
            if self.symbols.level(pref.id) < results.level
                && !results.seen_ids.contains(&pref.id)
            {
                self.add_pref_to_results(&mut results, p);
            }
        }
        results.prefs
    }

    /// Collect the WMEs at or above `grounds_level` that `inst` was derived
    /// from, following local conditions back through the instantiations that
    /// made them.
    fn backtrace_grounds(
        &self,
        inst: InstId,
        grounds_level: Level,
        seen: &mut HashSet<InstId>,
        grounds: &mut Vec<WmeId>,
    ) {
        if !seen.insert(inst) {
            return;
        }
        let Some(record) = self.insts.get(inst) else {
            return;
        };
        for bt in record.conditions.iter().filter_map(InstCondition::backtrace) {
            if bt.level <= grounds_level {
                if !grounds.contains(&bt.wme) {
                    grounds.push(bt.wme);
                }
                continue;
            }
            let traced = bt.trace.into_iter().chain(bt.prohibits.iter().copied());
            for from in traced.filter_map(|p| self.prefs.get(p)).filter_map(|p| p.inst) {
                self.backtrace_grounds(from, grounds_level, seen, grounds);
            }
        }
    }

    fn next_justification_name(&mut self) -> String {
        loop {
            self.recmem.justification_count += 1;
            let name = format!("justification-{}", self.recmem.justification_count);
            if self.productions.find(&name).is_none() {
                return name;
            }
        }
    }

    /// Build a justification for the results of `inst`, if it has any. Its
    /// instantiation is queued with the firings of the current pass, and its
    /// own results get a justification in turn.
    pub(crate) fn build_justification(&mut self, inst: InstId) -> KernelResult<()> {
        let Some(record) = self.insts.get(inst) else {
            return Ok(());
        };
        if record.match_goal.is_none() {
            return Ok(());
        }
        let (source, grounds_level) = (record.prod_name.clone(), record.match_goal_level - 1);
        let results = self.results_of_instantiation(inst);
        if results.is_empty() {
            return Ok(());
        }

        let mut grounds = Vec::new();
        let mut seen = HashSet::new();
        let origins: Vec<InstId> = results
            .iter()
            .filter_map(|&r| self.prefs.get(r))
            .filter_map(|p| p.inst)
            .collect();
        for from in origins {
            self.backtrace_grounds(from, grounds_level, &mut seen, &mut grounds);
        }
        if grounds.is_empty() {
            tracing::warn!(
                production = %source,
                "result has no supergoal grounds; no justification"
            );
            return Ok(());
        }

        let name = self.next_justification_name();
        let prod = self.justification_production(&name, &grounds, &results);
        let conditions = prod.conditions.clone();
        let prod_id = self.productions.insert(prod);
        let chunk = self.instantiate_justification(prod_id, &name, &grounds, &results);
        tracing::debug!(
            justification = %name,
            from = %source,
            grounds = grounds.len(),
            results = results.len(),
            "built justification"
        );

        if self.insts[chunk].in_ms {
            self.matcher.add_production(prod_id, &conditions, 0);
            self.process_match_events();
        } else {
            // Some ground already left working memory: only o-supported
            // clones are asserted, and the production is not kept.
            self.productions.unlist(prod_id);
        }

        self.build_justification(chunk)
    }

    fn justification_production(
        &self,
        name: &str,
        grounds: &[WmeId],
        results: &[PrefId],
    ) -> Production {
        let conditions = grounds
            .iter()
            .filter_map(|&w| self.wm.get(w))
            .map(|w| {
                Condition::Positive(ConditionPattern {
                    id: Test::Constant(w.id),
                    attr: Test::Constant(w.attr),
                    value: Test::Constant(w.value),
                    acceptable: w.acceptable,
                    goal_test: false,
                })
            })
            .collect();
        let actions = results
            .iter()
            .filter_map(|&r| self.prefs.get(r))
            .map(|p| {
                Action::Make(MakeAction {
                    id: RhsValue::Symbol(p.id),
                    attr: RhsValue::Symbol(p.attr),
                    value: RhsValue::Symbol(p.value),
                    referent: p.referent.map(RhsValue::Symbol),
                    pref_type: p.pref_type,
                    support: ActionSupport::Unknown,
                })
            })
            .collect();
        Production {
            name: name.to_string(),
            kind: ProductionKind::Justification,
            declared_support: DeclaredSupport::Undeclared,
            conditions,
            actions,
            variables: Vec::new(),
            rhs_unbound: Vec::new(),
            interrupt: false,
            firing_count: 0,
            reference_count: 0,
            instantiations: Vec::new(),
            excised: false,
        }
    }

    /// The justification's instantiation: the grounds as its conditions and a
    /// clone of every result, linked into the result's clone chain.
    fn instantiate_justification(
        &mut self,
        prod: ProdId,
        name: &str,
        grounds: &[WmeId],
        results: &[PrefId],
    ) -> InstId {
        let token = MatchToken {
            wmes: grounds.iter().map(|&w| Some(w)).collect(),
            bindings: Vec::new(),
        };
        let mut chunk = Instantiation::new(prod, name, token);
        for &w in grounds {
            let (level, trace, in_wm) = match self.wm.get(w) {
                Some(x) => (self.symbols.level(x.id), x.preference, x.in_wm),
                None => continue,
            };
            chunk.in_ms &= in_wm;
            self.wm.add_ref(w);
            chunk.conditions.push(InstCondition::Positive(BacktraceInfo {
                wme: w,
                level,
                trace,
                prohibits: Vec::new(),
            }));
        }
        let (match_goal, match_goal_level) = self.find_match_goal(&chunk.conditions);
        chunk.match_goal = match_goal;
        chunk.match_goal_level = match_goal_level;
        let in_ms = chunk.in_ms;
        let chunk = self.insts.insert(chunk);

        for &r in results {
            let Some(result) = self.prefs.get(r) else {
                continue;
            };
            let mut clone = Preference::new(
                result.pref_type,
                result.id,
                result.attr,
                result.value,
                result.referent,
            );
            clone.numeric_value = result.numeric_value;
            clone.o_supported = result.o_supported;
            clone.inst = Some(chunk);
            clone.next_clone = Some(r);
            clone.prev_clone = result.prev_clone;
            let c = self.prefs.insert(clone);
            if let Some(prev) = self.prefs[c].prev_clone {
                self.prefs[prev].next_clone = Some(c);
            }
            self.prefs[r].prev_clone = Some(c);
            self.insts[chunk].insert_generated_preference(c);
        }

        if in_ms {
            if let Some(record) = self.productions.get_mut(prod) {
                record.instantiations.push(chunk);
            }
        }
        self.recmem.newly_created.push(chunk);
        self.fill_in_new_instantiation_stuff(chunk, true);
        self.build_prohibits_list(chunk);
        chunk
    }

    /// Drop every justification; they only describe the run being thrown
    /// away.
    pub(crate) fn excise_justifications(&mut self) {
        let justifications: Vec<ProdId> = self
            .productions
            .ids()
            .iter()
            .copied()
            .filter(|&id| {
                self.productions
                    .get(id)
                    .is_some_and(|p| p.kind == ProductionKind::Justification)
            })
            .collect();
        for id in justifications {
            self.matcher.remove_production(id);
            self.productions.unlist(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cycle::RunType;
    use crate::kernel::{Kernel, KernelConfig};
    use crate::memory::PreferenceType::{Acceptable, Best};
    use crate::production::{ProductionBuilder, ProductionKind};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    fn justifications(k: &Kernel) -> Vec<String> {
        k.productions
            .ids()
            .iter()
            .filter_map(|&id| k.productions.get(id))
            .filter(|p| p.kind == ProductionKind::Justification)
            .map(|p| p.name.clone())
            .collect()
    }

    fn load_tie(k: &mut Kernel) {
        for side in ["left", "right"] {
            k.add_production(
                ProductionBuilder::new(format!("propose*{side}"))
                    .state("<s>", "superstate", "nil")
                    .make("<s>", "operator", "<o>", Acceptable)
                    .make("<o>", "name", side, Acceptable),
            )
            .unwrap();
        }
        k.add_production(
            ProductionBuilder::new("prefer-left")
                .state("<s>", "impasse", "tie")
                .cond("<s>", "superstate", "<ss>")
                .cond("<s>", "item", "<o>")
                .cond("<o>", "name", "left")
                .make("<ss>", "operator", "<o>", Best),
        )
        .unwrap();
    }

    #[test]
    fn result_survives_its_substate() {
        let mut k = kernel();
        load_tie(&mut k);
        k.run(2, RunType::Decisions).unwrap();

        let top = k.top_goal().unwrap();
        assert_eq!(k.goal_stack(), vec![top]);
        let selected = k.selected_operator(top).unwrap();
        let name: Vec<String> = k
            .attribute_values(selected, "name")
            .into_iter()
            .map(|v| k.symbols().display(v))
            .collect();
        assert_eq!(name, vec!["left".to_string()]);

        let names = justifications(&k);
        assert_eq!(names, vec!["justification-1".to_string()]);
        let j = k.production("justification-1").unwrap();
        assert_eq!(j.instantiations.len(), 1);
        let inst = k.instantiation(j.instantiations[0]).unwrap();
        assert_eq!(inst.match_goal, Some(top));
        // Grounded on the acceptable preference for the item and its name.
        assert_eq!(j.conditions.len(), 2);
        assert!(j.conditions.iter().any(|c| c.pattern().acceptable));
    }

    #[test]
    fn result_clone_stays_in_temporary_memory() {
        let mut k = kernel();
        load_tie(&mut k);
        k.run(1, RunType::Decisions).unwrap();

        let top = k.top_goal().unwrap();
        assert_eq!(k.goal_stack(), vec![top]);
        let j = k.production("justification-1").unwrap();
        let inst = k.instantiation(j.instantiations[0]).unwrap();
        assert_eq!(inst.preferences_generated.len(), 1);
        let pref = k.preference(inst.preferences_generated[0]).unwrap();
        assert_eq!(pref.pref_type, Best);
        assert_eq!(pref.id, top);
        assert!(pref.in_tm());
        assert!(!pref.o_supported);
    }

    #[test]
    fn reinitialize_drops_justifications() {
        let mut k = kernel();
        load_tie(&mut k);
        k.run(2, RunType::Decisions).unwrap();
        assert!(!justifications(&k).is_empty());
        k.reinitialize().unwrap();
        assert!(justifications(&k).is_empty());
        assert!(k.production("prefer-left").is_some());
    }
}
