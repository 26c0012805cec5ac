//! O-support: whether a firing's preferences outlive the conditions that
//! produced them.
//!
//! Three calculations live here:
//!
//! - [`calculate_compile_time_o_support`] runs once per production at load
//!   time and classifies every make action as O, I, or unknown from the shape
//!   of the conditions and actions alone.
//! - The `Operand2` run-time rule: operator proposals are i-supported,
//!   firings that test the selected operator of their deepest goal are
//!   o-supported, and pure operator elaborations mixed with applications are
//!   downgraded to i-support. The same rule classifies pending matches into
//!   the PE and IE assertion lists.
//! - The `Legacy` run-time rule, which marks transitive closures over
//!   temporary memory and the firing's own preferences.

use std::collections::HashSet;

use crate::cycle::DiagnosticKind;
use crate::kernel::{CycleMode, Kernel};
use crate::match_set::FiringType;
use crate::matcher::MatchToken;
use crate::memory::{InstCondition, InstId, PrefId, PreferenceType, ProdId, WmeFacts};
use crate::production::{
    Action, ActionSupport, Condition, DeclaredSupport, MakeAction, Production, RhsValue, Test,
    VarId,
};
use crate::symbol::{Predefined, SymbolId};

// ---------------------------------------------------------------------------
// Compile-time analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YesNoMaybe {
    Yes,
    No,
    Maybe,
}

/// Something a compile-time closure can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TcItem {
    Var(VarId),
    Unbound(usize),
    Sym(SymbolId),
}

impl TcItem {
    fn is_variable(self) -> bool {
        !matches!(self, TcItem::Sym(_))
    }
}

fn test_item(test: Test) -> TcItem {
    match test {
        Test::Constant(s) => TcItem::Sym(s),
        Test::Variable(v) => TcItem::Var(v),
    }
}

fn rhs_item(value: &RhsValue) -> Option<TcItem> {
    match value {
        RhsValue::Symbol(s) => Some(TcItem::Sym(*s)),
        RhsValue::Bound(v) => Some(TcItem::Var(*v)),
        RhsValue::Unbound(u) => Some(TcItem::Unbound(*u)),
        RhsValue::Call { .. } => None,
    }
}

/// Whether `test` can only pass for `item`.
fn test_is_for(test: Test, item: TcItem) -> YesNoMaybe {
    let referent = test_item(test);
    if referent == item {
        YesNoMaybe::Yes
    } else if referent.is_variable() || item.is_variable() {
        YesNoMaybe::Maybe
    } else {
        YesNoMaybe::No
    }
}

fn makes(prod: &Production) -> impl Iterator<Item = (usize, &MakeAction)> {
    prod.actions
        .iter()
        .enumerate()
        .filter_map(|(i, a)| a.as_make().map(|m| (i, m)))
}

fn set_support(prod: &mut Production, index: usize, support: ActionSupport) {
    if let Some(Action::Make(m)) = prod.actions.get_mut(index) {
        m.support = support;
    }
}

fn support_of(prod: &Production, index: usize) -> ActionSupport {
    prod.actions
        .get(index)
        .and_then(Action::as_make)
        .map(|m| m.support)
        .unwrap_or_default()
}

fn find_known_goals(prod: &Production) -> Vec<VarId> {
    let mut goals = Vec::new();
    for c in &prod.conditions {
        if let Condition::Positive(p) = c {
            if let (true, Test::Variable(v)) = (p.goal_test, p.id) {
                if !goals.contains(&v) {
                    goals.push(v);
                }
            }
        }
    }
    goals
}

/// Variables tested as an id but never reached through a value.
fn collect_root_variables(prod: &Production) -> Vec<VarId> {
    let values: HashSet<VarId> = prod
        .conditions
        .iter()
        .filter_map(Condition::positive)
        .filter_map(|p| match p.value {
            Test::Variable(v) => Some(v),
            Test::Constant(_) => None,
        })
        .collect();
    let mut roots = Vec::new();
    for p in prod.conditions.iter().filter_map(Condition::positive) {
        if let Test::Variable(v) = p.id {
            if !values.contains(&v) && !roots.contains(&v) {
                roots.push(v);
            }
        }
    }
    roots
}

fn find_compile_time_match_goal(
    prod: &Production,
    known_goals: &[VarId],
    predefined: &Predefined,
) -> Option<VarId> {
    let mut root_goals: Vec<VarId> = collect_root_variables(prod)
        .into_iter()
        .filter(|v| known_goals.contains(v))
        .collect();
    if root_goals.len() > 1 {
        // Prefer the goal that is not the top state.
        'conds: for p in prod.conditions.iter().filter_map(Condition::positive) {
            if test_is_for(p.attr, TcItem::Sym(predefined.superstate)) != YesNoMaybe::Yes
                || test_is_for(p.value, TcItem::Sym(predefined.nil)) != YesNoMaybe::Yes
            {
                continue;
            }
            let mut i = 0;
            while i < root_goals.len() {
                if test_is_for(p.id, TcItem::Var(root_goals[i])) == YesNoMaybe::Yes {
                    root_goals.remove(i);
                    if root_goals.len() == 1 {
                        break 'conds;
                    }
                } else {
                    i += 1;
                }
            }
        }
    }
    match root_goals.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

fn find_thing_off_goal(prod: &Production, goal: VarId, attr: SymbolId) -> Option<VarId> {
    prod.conditions
        .iter()
        .filter_map(Condition::positive)
        .filter(|p| !p.acceptable)
        .filter(|p| test_is_for(p.id, TcItem::Var(goal)) == YesNoMaybe::Yes)
        .filter(|p| test_is_for(p.attr, TcItem::Sym(attr)) == YesNoMaybe::Yes)
        .find_map(|p| match p.value {
            Test::Variable(v) => Some(v),
            Test::Constant(_) => None,
        })
}

fn condition_list_has_id_test_for(prod: &Production, item: TcItem) -> bool {
    prod.conditions
        .iter()
        .any(|c| test_item(c.pattern().id) == item)
}

fn match_state_tests_non_operator_slot(
    prod: &Production,
    match_state: VarId,
    predefined: &Predefined,
) -> bool {
    prod.conditions.iter().any(|c| {
        let p = c.pattern();
        test_item(p.id) == TcItem::Var(match_state)
            && test_is_for(p.attr, TcItem::Sym(predefined.operator)) == YesNoMaybe::No
    })
}

fn add_tc_through_lhs_and_rhs(prod: &Production, tc: &mut HashSet<TcItem>) {
    let mut cond_done = vec![false; prod.conditions.len()];
    let mut action_done = vec![false; prod.actions.len()];
    loop {
        let mut changed = false;
        for (i, c) in prod.conditions.iter().enumerate() {
            if cond_done[i] || !tc.contains(&test_item(c.pattern().id)) {
                continue;
            }
            if let Condition::Positive(p) = c {
                tc.insert(test_item(p.id));
                tc.insert(test_item(p.value));
            }
            cond_done[i] = true;
            changed = true;
        }
        for (i, m) in makes(prod) {
            if action_done[i] || !action_in_tc(m, tc) {
                continue;
            }
            if let Some(v) = rhs_item(&m.value) {
                tc.insert(v);
            }
            if let Some(r) = m
                .referent
                .as_ref()
                .filter(|_| m.pref_type.is_binary())
                .and_then(rhs_item)
            {
                tc.insert(r);
            }
            action_done[i] = true;
            changed = true;
        }
        if !changed {
            break;
        }
    }
}

fn action_in_tc(m: &MakeAction, tc: &HashSet<TcItem>) -> bool {
    rhs_item(&m.id).is_some_and(|id| tc.contains(&id))
}

fn attr_is_operator(m: &MakeAction, predefined: &Predefined) -> bool {
    m.attr == RhsValue::Symbol(predefined.operator)
}

/// Classify every make action of `prod` as O, I, or unknown support.
pub fn calculate_compile_time_o_support(
    prod: &mut Production,
    predefined: &Predefined,
    operand2: bool,
) {
    let make_indices: Vec<usize> = makes(prod).map(|(i, _)| i).collect();
    for &i in &make_indices {
        set_support(prod, i, ActionSupport::Unknown);
    }
    let all_i = |prod: &mut Production| {
        for &i in &make_indices {
            set_support(prod, i, ActionSupport::I);
        }
    };
    let operator = TcItem::Sym(predefined.operator);

    // Without "operator" anywhere in an attribute, nothing gets support.
    let mut operator_found = false;
    let mut possible_operator_found = false;
    for p in prod.conditions.iter().filter_map(Condition::positive) {
        match test_is_for(p.attr, operator) {
            YesNoMaybe::Yes => {
                operator_found = true;
                possible_operator_found = true;
                break;
            }
            YesNoMaybe::Maybe => possible_operator_found = true,
            YesNoMaybe::No => {}
        }
    }
    if !operator_found {
        for (_, m) in makes(prod) {
            match &m.attr {
                RhsValue::Symbol(s) if *s == predefined.operator => {
                    operator_found = true;
                    possible_operator_found = true;
                    break;
                }
                RhsValue::Symbol(_) => {}
                _ => possible_operator_found = true,
            }
        }
    }
    if !possible_operator_found {
        all_i(prod);
        return;
    }

    // Operator preferences on known goals never get support.
    let known_goals = find_known_goals(prod);
    let goal_operator_actions: Vec<usize> = makes(prod)
        .filter(|(_, m)| {
            attr_is_operator(m, predefined)
                && matches!(m.id, RhsValue::Bound(v) if known_goals.contains(&v))
        })
        .map(|(i, _)| i)
        .collect();
    for i in goal_operator_actions {
        set_support(prod, i, ActionSupport::I);
    }

    let Some(match_state) = find_compile_time_match_goal(prod, &known_goals, predefined) else {
        return;
    };
    let match_operator = find_thing_off_goal(prod, match_state, predefined.operator);

    // A possible operator that is really the match state is not one.
    if possible_operator_found && !operator_found {
        possible_operator_found = prod
            .conditions
            .iter()
            .filter_map(Condition::positive)
            .any(|p| {
                test_is_for(p.attr, operator) != YesNoMaybe::No
                    && test_is_for(p.attr, TcItem::Var(match_state)) != YesNoMaybe::Yes
            });
        if !possible_operator_found {
            possible_operator_found = makes(prod)
                .filter(|(_, m)| m.id != RhsValue::Bound(match_state))
                .any(|(_, m)| match &m.attr {
                    RhsValue::Symbol(_) => false,
                    RhsValue::Bound(v) => *v != match_state,
                    RhsValue::Unbound(_) | RhsValue::Call { .. } => true,
                });
        }
        if !possible_operator_found {
            all_i(prod);
            return;
        }
    }

    let tests_non_operator_slot =
        match_state_tests_non_operator_slot(prod, match_state, predefined);
    let lhs_oa_support = match_operator.is_some_and(|op| {
        condition_list_has_id_test_for(prod, TcItem::Var(op)) && tests_non_operator_slot
    });
    let lhs_oc_support = tests_non_operator_slot;
    let lhs_om_support = tests_non_operator_slot
        && prod
            .conditions
            .iter()
            .filter_map(Condition::positive)
            .any(|p| {
                test_is_for(p.id, TcItem::Var(match_state)) == YesNoMaybe::Yes
                    && test_is_for(p.attr, operator) == YesNoMaybe::Yes
            });

    if lhs_oa_support {
        let mut tc = HashSet::from([TcItem::Var(match_state)]);
        add_tc_through_lhs_and_rhs(prod, &mut tc);
        let updates: Vec<(usize, ActionSupport)> = makes(prod)
            .filter(|(_, m)| action_in_tc(m, &tc) && m.support != ActionSupport::I)
            .map(|(i, m)| {
                // Operator augmentations can only be judged at run time.
                if attr_is_operator(m, predefined) {
                    (i, ActionSupport::Unknown)
                } else {
                    (i, ActionSupport::O)
                }
            })
            .collect();
        for (i, s) in updates {
            set_support(prod, i, s);
        }
    }

    if lhs_oc_support {
        let mut tc: HashSet<TcItem> = makes(prod)
            .filter(|(_, m)| {
                m.id == RhsValue::Bound(match_state)
                    && attr_is_operator(m, predefined)
                    && matches!(m.pref_type, PreferenceType::Acceptable | PreferenceType::Require)
            })
            .filter_map(|(_, m)| rhs_item(&m.value))
            .collect();
        add_tc_through_lhs_and_rhs(prod, &mut tc);
        let in_tc: Vec<usize> = makes(prod)
            .filter(|(_, m)| action_in_tc(m, &tc))
            .map(|(i, _)| i)
            .collect();
        for i in in_tc {
            if operand2 {
                // Operator proposals are only i-supported.
                set_support(prod, i, ActionSupport::I);
            } else if support_of(prod, i) != ActionSupport::I {
                set_support(prod, i, ActionSupport::O);
            }
        }
    }

    if lhs_om_support {
        let mut tc: HashSet<TcItem> = prod
            .conditions
            .iter()
            .filter_map(Condition::positive)
            .filter(|p| {
                test_is_for(p.id, TcItem::Var(match_state)) == YesNoMaybe::Yes
                    && test_is_for(p.attr, operator) == YesNoMaybe::Yes
            })
            .filter_map(|p| match p.value {
                Test::Variable(v) => Some(TcItem::Var(v)),
                Test::Constant(_) => None,
            })
            .collect();
        add_tc_through_lhs_and_rhs(prod, &mut tc);
        let in_tc: Vec<usize> = makes(prod)
            .filter(|(_, m)| action_in_tc(m, &tc) && m.support != ActionSupport::I)
            .map(|(i, _)| i)
            .collect();
        for i in in_tc {
            set_support(prod, i, ActionSupport::O);
        }
    }
}

// ---------------------------------------------------------------------------
// Run-time support
// ---------------------------------------------------------------------------

/// Outcome of scanning a match for a tested operator.
#[derive(Debug, Clone, Copy, Default)]
struct OperatorScan {
    o_support: bool,
    op_elab: bool,
}

fn resolve_rhs_id(value: &RhsValue, token: &MatchToken) -> Option<SymbolId> {
    match value {
        RhsValue::Symbol(s) => Some(*s),
        RhsValue::Bound(v) => token.binding(*v),
        RhsValue::Unbound(_) | RhsValue::Call { .. } => None,
    }
}

impl Kernel {
    fn is_operator_proposal(&self, prod: &Production) -> bool {
        makes(prod).any(|(_, m)| {
            attr_is_operator(m, &self.predefined) && m.pref_type == PreferenceType::Acceptable
        })
    }

    /// Find the deepest goal among `wmes`, then look for a selected operator
    /// on it. Each make action either elaborates that operator or applies it.
    fn scan_for_operator(
        &self,
        prod: &Production,
        wmes: &[WmeFacts],
        token: &MatchToken,
    ) -> OperatorScan {
        let mut scan = OperatorScan::default();
        let lowest_goal = wmes
            .iter()
            .filter(|w| self.symbols.is_goal(w.id))
            .fold(None::<SymbolId>, |best, w| match best {
                Some(b) if self.symbols.level(w.id) <= self.symbols.level(b) => Some(b),
                _ => Some(w.id),
            });
        let Some(goal) = lowest_goal else {
            return scan;
        };
        for w in wmes
            .iter()
            .filter(|w| w.attr == self.predefined.operator && !w.acceptable && w.id == goal)
        {
            for (_, m) in makes(prod) {
                if resolve_rhs_id(&m.id, token) == Some(w.value) {
                    scan.op_elab = true;
                } else {
                    scan.o_support = true;
                }
            }
        }
        scan
    }

    /// Decide which assertion list a new match belongs on.
    pub(crate) fn classify_match(&mut self, prod: ProdId, token: &MatchToken) -> FiringType {
        if let Some(declared) = self.declared_firing_type(prod) {
            return declared;
        }
        let Some(record) = self.productions.get(prod) else {
            return FiringType::Ie;
        };
        if self.is_operator_proposal(record) {
            return FiringType::Ie;
        }
        let wmes: Vec<WmeFacts> = token
            .matched_wmes()
            .filter_map(|w| self.wm.get(w))
            .map(|w| w.facts())
            .collect();
        let scan = self.scan_for_operator(record, &wmes, token);
        if scan.o_support && scan.op_elab {
            let name = record.name.clone();
            self.record_diagnostic(
                DiagnosticKind::OperatorElaborationDowngrade,
                Some(&name),
                format!(
                    "operator elaborations mixed with operator applications get i_support in prod {name}"
                ),
            );
            return FiringType::Ie;
        }
        if scan.o_support {
            FiringType::Pe
        } else {
            FiringType::Ie
        }
    }

    /// Run-time support for an instantiation's preferences.
    pub(crate) fn calculate_support_for_instantiation(&mut self, inst: InstId) {
        match self.config.cycle_mode {
            CycleMode::Operand2 => self.operand2_support(inst),
            CycleMode::Legacy => self.legacy_support(inst),
        }
    }

    fn set_all_support(&mut self, inst: InstId, o_supported: bool) {
        let prefs = self
            .insts
            .get(inst)
            .map(|i| i.preferences_generated.clone())
            .unwrap_or_default();
        for p in prefs {
            if let Some(pref) = self.prefs.get_mut(p) {
                pref.o_supported = o_supported;
            }
        }
    }

    fn operand2_support(&mut self, inst: InstId) {
        let Some(record) = self.insts.get(inst) else {
            return;
        };
        let Some(prod) = record.prod.and_then(|p| self.productions.get(p)) else {
            return;
        };
        let o_support = match prod.declared_support {
            DeclaredSupport::OSupport => true,
            DeclaredSupport::ISupport => false,
            DeclaredSupport::Undeclared if self.is_operator_proposal(prod) => false,
            DeclaredSupport::Undeclared => {
                let wmes: Vec<WmeFacts> = record
                    .backtrace_wmes()
                    .into_iter()
                    .filter_map(|w| self.wm.get(w))
                    .map(|w| w.facts())
                    .collect();
                let scan = self.scan_for_operator(prod, &wmes, &record.token);
                scan.o_support && !scan.op_elab
            }
        };
        self.set_all_support(inst, o_support);
    }

    // -----------------------------------------------------------------------
    // Legacy transitive-closure support
    // -----------------------------------------------------------------------

    /// Add `id` and everything reachable from it through temporary memory and
    /// the firing's own preferences. The operator slot of a state is skipped.
    fn add_to_os_tc(
        &self,
        id: SymbolId,
        isa_state: bool,
        rhs: &[PrefId],
        tc: &mut HashSet<SymbolId>,
    ) {
        let mut stack = vec![(id, isa_state)];
        while let Some((id, isa_state)) = stack.pop() {
            if !self.symbols.is_identifier(id) || !tc.insert(id) {
                continue;
            }
            let Some(info) = self.symbols.ident(id) else {
                continue;
            };
            let mut push = |sym: SymbolId| stack.push((sym, false));
            for w in info.input_wmes.iter().filter_map(|&w| self.wm.get(w)) {
                push(w.value);
            }
            for slot in info.slots.iter().filter_map(|&s| self.slots.get(s)) {
                if isa_state && slot.attr == self.predefined.operator {
                    continue;
                }
                for pref in slot.all_preferences.iter().filter_map(|&p| self.prefs.get(p)) {
                    push(pref.value);
                    if let Some(r) = pref.referent.filter(|_| pref.pref_type.is_binary()) {
                        push(r);
                    }
                }
                for w in slot.wmes.iter().filter_map(|&w| self.wm.get(w)) {
                    push(w.value);
                }
            }
            for pref in rhs.iter().filter_map(|&p| self.prefs.get(p)) {
                if pref.id != id || (isa_state && pref.attr == self.predefined.operator) {
                    continue;
                }
                push(pref.value);
                if let Some(r) = pref.referent.filter(|_| pref.pref_type.is_binary()) {
                    push(r);
                }
            }
        }
    }

    /// Whether any id, or any value other than `excluded_value`, of the
    /// instantiated conditions is in `tc`. Tests of `(state ^operator ...)`
    /// end the scan.
    fn conditions_touch_tc(
        &self,
        conditions: &[InstCondition],
        excluded_value: Option<SymbolId>,
        state_excluded: Option<SymbolId>,
        tc: &HashSet<SymbolId>,
    ) -> bool {
        for cond in conditions {
            let (id, attr, value) = match cond {
                InstCondition::Positive(bt) => match self.wm.get(bt.wme) {
                    Some(w) => (Some(w.id), Some(w.attr), Some(w.value)),
                    None => continue,
                },
                InstCondition::Negative {
                    id, attr, value, ..
                } => (*id, *attr, *value),
            };
            if state_excluded.is_some()
                && id == state_excluded
                && attr == Some(self.predefined.operator)
            {
                return false;
            }
            if id.is_some_and(|i| tc.contains(&i)) {
                return true;
            }
            if value.is_some_and(|v| tc.contains(&v) && Some(v) != excluded_value) {
                return true;
            }
        }
        false
    }

    fn is_state_id(&self, sym: SymbolId, match_state: SymbolId) -> bool {
        let mut goal = self.decider.top_goal;
        while let Some(g) = goal {
            if g == match_state {
                break;
            }
            if g == sym {
                return true;
            }
            goal = self.symbols.lower_goal(g);
        }
        sym == match_state
    }

    fn legacy_support(&mut self, inst: InstId) {
        self.set_all_support(inst, false);
        let Some(record) = self.insts.get(inst) else {
            return;
        };
        let Some(match_goal) = record.match_goal else {
            return;
        };
        let operator = self.predefined.operator;
        let match_state = match_goal;
        let match_operator_wme = self
            .symbols
            .operator_slot(match_goal)
            .and_then(|s| self.slots.get(s))
            .and_then(|s| s.wmes.first().copied());
        let match_operator = match_operator_wme
            .and_then(|w| self.wm.get(w))
            .map(|w| w.value)
            .filter(|&v| self.symbols.is_identifier(v));
        let rhs = record.preferences_generated.clone();
        let conditions = record.conditions.clone();

        let rhs_does_an_operator_creation = rhs.iter().filter_map(|&p| self.prefs.get(p)).any(|p| {
            p.id == match_goal
                && p.attr == operator
                && matches!(p.pref_type, PreferenceType::Acceptable | PreferenceType::Require)
        });

        let mut tests_off_state = false;
        let mut tests_off_operator = false;
        let mut tests_operator_installed = false;
        let mut tests_operator_acceptable_or_installed = false;
        for bt in conditions.iter().filter_map(InstCondition::backtrace) {
            let Some(w) = self.wm.get(bt.wme) else {
                continue;
            };
            if w.id == match_state && w.attr != operator {
                tests_off_state = true;
            }
            if Some(w.id) == match_operator {
                tests_off_operator = true;
            }
            if Some(bt.wme) == match_operator_wme {
                tests_operator_installed = true;
            }
            if w.id == match_goal && w.attr == operator {
                tests_operator_acceptable_or_installed = true;
            }
        }

        let mut oa_possible = tests_operator_installed;
        let mut oc_possible = rhs_does_an_operator_creation;
        let mut om_possible = tests_operator_acceptable_or_installed;
        if !oa_possible && !oc_possible && !om_possible {
            return;
        }

        if !tests_off_state {
            let mut tc = HashSet::new();
            self.add_to_os_tc(match_state, true, &[], &mut tc);
            if !self.conditions_touch_tc(&conditions, Some(match_state), Some(match_state), &tc) {
                oc_possible = false;
                om_possible = false;
            }
        }
        if oa_possible && !tests_off_operator {
            let mut tc = HashSet::new();
            if let Some(op) = match_operator {
                self.add_to_os_tc(op, false, &[], &mut tc);
            }
            if !self.conditions_touch_tc(&conditions, match_operator, None, &tc) {
                oa_possible = false;
            }
        }

        let mut supported: HashSet<PrefId> = HashSet::new();
        if oa_possible {
            let mut tc = HashSet::new();
            self.add_to_os_tc(match_state, true, &rhs, &mut tc);
            for &p in &rhs {
                let Some(pref) = self.prefs.get(p) else {
                    continue;
                };
                if tc.contains(&pref.id)
                    && !(pref.attr == operator && self.is_state_id(pref.id, match_state))
                {
                    supported.insert(p);
                }
            }
        }
        if oc_possible {
            let mut tc = HashSet::new();
            let seeds: Vec<SymbolId> = rhs
                .iter()
                .filter_map(|&p| self.prefs.get(p))
                .filter(|p| {
                    p.id == match_goal
                        && p.attr == operator
                        && matches!(
                            p.pref_type,
                            PreferenceType::Acceptable | PreferenceType::Require
                        )
                })
                .map(|p| p.value)
                .collect();
            for seed in seeds {
                self.add_to_os_tc(seed, false, &rhs, &mut tc);
            }
            for &p in &rhs {
                if self
                    .prefs
                    .get(p)
                    .is_some_and(|x| tc.contains(&x.id) && x.id != match_state)
                {
                    supported.insert(p);
                }
            }
        }
        if om_possible {
            let mut tc = HashSet::new();
            let seeds: Vec<SymbolId> = conditions
                .iter()
                .filter_map(InstCondition::backtrace)
                .filter_map(|bt| self.wm.get(bt.wme))
                .filter(|w| w.id == match_goal && w.attr == operator)
                .map(|w| w.value)
                .collect();
            for seed in seeds {
                self.add_to_os_tc(seed, false, &rhs, &mut tc);
            }
            for &p in &rhs {
                if self.prefs.get(p).is_some_and(|x| tc.contains(&x.id)) {
                    supported.insert(p);
                }
            }
        }
        for p in supported {
            if let Some(pref) = self.prefs.get_mut(p) {
                pref.o_supported = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::{ProductionBuilder, Term};
    use crate::symbol::SymbolTable;

    fn compile(builder: ProductionBuilder, operand2: bool) -> Production {
        let mut symbols = SymbolTable::new();
        let predefined = Predefined::new(&mut symbols);
        let mut prod = builder.compile(&mut symbols).unwrap();
        calculate_compile_time_o_support(&mut prod, &predefined, operand2);
        prod
    }

    fn supports(prod: &Production) -> Vec<ActionSupport> {
        makes(prod).map(|(_, m)| m.support).collect()
    }

    #[test]
    fn no_operator_anywhere_is_i_support() {
        let prod = compile(
            ProductionBuilder::new("elab")
                .state("<s>", "superstate", "nil")
                .make("<s>", "foo", 1, PreferenceType::Acceptable),
            true,
        );
        assert_eq!(supports(&prod), vec![ActionSupport::I]);
    }

    #[test]
    fn operator_application_gets_o_support() {
        let prod = compile(
            ProductionBuilder::new("apply")
                .state("<s>", "operator", "<o>")
                .cond("<o>", "name", "count")
                .cond("<s>", "count", "<c>")
                .make(
                    "<s>",
                    "count",
                    Term::call("+", vec!["<c>".into(), 1.into()]),
                    PreferenceType::Acceptable,
                )
                .make("<s>", "count", "<c>", PreferenceType::Reject),
            true,
        );
        assert_eq!(supports(&prod), vec![ActionSupport::O, ActionSupport::O]);
    }

    #[test]
    fn operator_proposal_on_state_is_i_support() {
        let prod = compile(
            ProductionBuilder::new("propose")
                .state("<s>", "superstate", "nil")
                .cond("<s>", "count", "<c>")
                .make("<s>", "operator", "<o>", PreferenceType::Acceptable)
                .make("<o>", "name", "count", PreferenceType::Acceptable),
            true,
        );
        let s = supports(&prod);
        assert_eq!(s[0], ActionSupport::I);
        assert_eq!(s[1], ActionSupport::I);
    }

    #[test]
    fn legacy_mode_gives_operator_creation_o_support() {
        let prod = compile(
            ProductionBuilder::new("propose")
                .state("<s>", "superstate", "nil")
                .cond("<s>", "count", "<c>")
                .make("<s>", "operator", "<o>", PreferenceType::Acceptable)
                .make("<o>", "name", "count", PreferenceType::Acceptable),
            false,
        );
        let s = supports(&prod);
        assert_eq!(s[0], ActionSupport::I);
        assert_eq!(s[1], ActionSupport::O);
    }

    #[test]
    fn root_variables_skip_linked_ids() {
        let mut symbols = SymbolTable::new();
        let prod = ProductionBuilder::new("p")
            .state("<s>", "block", "<b>")
            .cond("<b>", "color", "red")
            .compile(&mut symbols)
            .unwrap();
        assert_eq!(collect_root_variables(&prod), vec![0]);
    }

    #[test]
    fn test_is_for_yes_no_maybe() {
        let mut symbols = SymbolTable::new();
        let a = symbols.intern_str("a");
        let b = symbols.intern_str("b");
        assert_eq!(test_is_for(Test::Constant(a), TcItem::Sym(a)), YesNoMaybe::Yes);
        assert_eq!(test_is_for(Test::Constant(a), TcItem::Sym(b)), YesNoMaybe::No);
        assert_eq!(test_is_for(Test::Variable(0), TcItem::Sym(b)), YesNoMaybe::Maybe);
        assert_eq!(test_is_for(Test::Constant(a), TcItem::Var(2)), YesNoMaybe::Maybe);
    }

}
