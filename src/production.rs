//! Productions: condition/action rules and the builder used to write them.
//!
//! Rules are written with [`ProductionBuilder`] using [`Term`]s, where a string
//! of the form `"<x>"` is a variable and any other string is a symbolic
//! constant. `Kernel::add_production` compiles a builder into a [`Production`]
//! over interned symbols, computes compile-time o-support for every action, and
//! hands the conditions to the match feed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{KernelResult, ProductionError};
use crate::kernel::Kernel;
use crate::memory::{Arena, InstId, PreferenceType, ProdId};
use crate::symbol::{SymbolId, SymbolTable};

/// Index of a left-hand-side variable within its production.
pub type VarId = usize;

/// Where a production came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProductionKind {
    #[default]
    User,
    Default,
    Chunk,
    /// Never fired directly; created by the learning collaborator.
    Justification,
    /// Bypasses the waterfall rule and executes no actions.
    Template,
}

/// Support declared on a production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeclaredSupport {
    #[default]
    Undeclared,
    OSupport,
    ISupport,
}

/// Compile-time support classification of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActionSupport {
    #[default]
    Unknown,
    O,
    I,
}

/// A test on one field of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Test {
    Constant(SymbolId),
    Variable(VarId),
}

/// The three field tests of a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionPattern {
    pub id: Test,
    pub attr: Test,
    pub value: Test,
    /// Matches acceptable-preference WMEs instead of ordinary ones.
    pub acceptable: bool,
    /// The id must be a goal (`state` conditions).
    pub goal_test: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Positive(ConditionPattern),
    Negative(ConditionPattern),
}

impl Condition {
    pub fn pattern(&self) -> &ConditionPattern {
        match self {
            Condition::Positive(p) | Condition::Negative(p) => p,
        }
    }

    pub fn positive(&self) -> Option<&ConditionPattern> {
        match self {
            Condition::Positive(p) => Some(p),
            Condition::Negative(_) => None,
        }
    }
}

/// A right-hand-side value.
#[derive(Debug, Clone, PartialEq)]
pub enum RhsValue {
    Symbol(SymbolId),
    /// A variable bound on the left-hand side.
    Bound(VarId),
    /// A variable first mentioned on the right-hand side; bound to a fresh
    /// identifier once per firing.
    Unbound(usize),
    Call {
        function: String,
        args: Vec<RhsValue>,
    },
}

impl RhsValue {
    pub fn is_call(&self) -> bool {
        matches!(self, RhsValue::Call { .. })
    }
}

/// An action creating one preference.
#[derive(Debug, Clone, PartialEq)]
pub struct MakeAction {
    pub id: RhsValue,
    pub attr: RhsValue,
    pub value: RhsValue,
    pub referent: Option<RhsValue>,
    pub pref_type: PreferenceType,
    pub support: ActionSupport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Make(MakeAction),
    /// A function call executed for its side effects.
    Call(RhsValue),
}

impl Action {
    pub fn as_make(&self) -> Option<&MakeAction> {
        match self {
            Action::Make(m) => Some(m),
            Action::Call(_) => None,
        }
    }
}

/// A compiled production.
#[derive(Debug, Clone)]
pub struct Production {
    pub name: String,
    pub kind: ProductionKind,
    pub declared_support: DeclaredSupport,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Names of left-hand-side variables, by [`VarId`].
    pub variables: Vec<String>,
    /// Names of right-hand-side-only variables, by index.
    pub rhs_unbound: Vec<String>,
    /// Interrupt the run whenever this production matches.
    pub interrupt: bool,
    pub firing_count: u64,
    pub reference_count: u32,
    pub instantiations: Vec<InstId>,
    pub excised: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A term in a production being built.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Var(String),
    Str(String),
    Int(i64),
    Float(f64),
    Call { function: String, args: Vec<Term> },
}

impl Term {
    /// A right-hand-side function call.
    pub fn call(function: impl Into<String>, args: Vec<Term>) -> Self {
        Term::Call {
            function: function.into(),
            args,
        }
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        if s.len() > 2 && s.starts_with('<') && s.ends_with('>') {
            Term::Var(s[1..s.len() - 1].to_string())
        } else {
            Term::Str(s.to_string())
        }
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::from(s.as_str())
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

impl From<i32> for Term {
    fn from(v: i32) -> Self {
        Term::Int(v.into())
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Term::Float(v)
    }
}

#[derive(Debug, Clone)]
struct CondSpec {
    negated: bool,
    goal_test: bool,
    acceptable: bool,
    fields: [Term; 3],
}

#[derive(Debug, Clone)]
enum ActionSpec {
    Make {
        fields: [Term; 3],
        pref_type: PreferenceType,
        referent: Option<Term>,
    },
    Call(Term),
}

/// Fluent builder for productions.
///
/// ```
/// use akh_kernel::production::ProductionBuilder;
/// use akh_kernel::memory::PreferenceType;
///
/// let p = ProductionBuilder::new("elaborate*foo")
///     .state("<s>", "superstate", "nil")
///     .make("<s>", "foo", 1, PreferenceType::Acceptable);
/// assert_eq!(p.name(), "elaborate*foo");
/// ```
#[derive(Debug, Clone)]
pub struct ProductionBuilder {
    name: String,
    kind: ProductionKind,
    support: DeclaredSupport,
    interrupt: bool,
    conditions: Vec<CondSpec>,
    actions: Vec<ActionSpec>,
}

impl ProductionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProductionKind::User,
            support: DeclaredSupport::Undeclared,
            interrupt: false,
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ProductionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn support(mut self, support: DeclaredSupport) -> Self {
        self.support = support;
        self
    }

    /// Interrupt the run whenever this production matches.
    pub fn interrupt(mut self) -> Self {
        self.interrupt = true;
        self
    }

    fn push_cond(
        mut self,
        negated: bool,
        goal_test: bool,
        acceptable: bool,
        id: impl Into<Term>,
        attr: impl Into<Term>,
        value: impl Into<Term>,
    ) -> Self {
        self.conditions.push(CondSpec {
            negated,
            goal_test,
            acceptable,
            fields: [id.into(), attr.into(), value.into()],
        });
        self
    }

    /// A positive condition whose id must be a state.
    pub fn state(self, id: impl Into<Term>, attr: impl Into<Term>, value: impl Into<Term>) -> Self {
        self.push_cond(false, true, false, id, attr, value)
    }

    pub fn cond(self, id: impl Into<Term>, attr: impl Into<Term>, value: impl Into<Term>) -> Self {
        self.push_cond(false, false, false, id, attr, value)
    }

    /// A positive condition matching an acceptable-preference WME.
    pub fn cond_acceptable(
        self,
        id: impl Into<Term>,
        attr: impl Into<Term>,
        value: impl Into<Term>,
    ) -> Self {
        self.push_cond(false, false, true, id, attr, value)
    }

    /// A negated condition.
    pub fn not(self, id: impl Into<Term>, attr: impl Into<Term>, value: impl Into<Term>) -> Self {
        self.push_cond(true, false, false, id, attr, value)
    }

    /// Create a unary preference.
    pub fn make(
        mut self,
        id: impl Into<Term>,
        attr: impl Into<Term>,
        value: impl Into<Term>,
        pref_type: PreferenceType,
    ) -> Self {
        self.actions.push(ActionSpec::Make {
            fields: [id.into(), attr.into(), value.into()],
            pref_type,
            referent: None,
        });
        self
    }

    /// Create a binary preference relating `value` to `referent`.
    pub fn make_binary(
        mut self,
        id: impl Into<Term>,
        attr: impl Into<Term>,
        value: impl Into<Term>,
        pref_type: PreferenceType,
        referent: impl Into<Term>,
    ) -> Self {
        self.actions.push(ActionSpec::Make {
            fields: [id.into(), attr.into(), value.into()],
            pref_type,
            referent: Some(referent.into()),
        });
        self
    }

    /// Call a right-hand-side function for its side effects.
    pub fn call(mut self, call: Term) -> Self {
        self.actions.push(ActionSpec::Call(call));
        self
    }

    /// Validate and intern the production.
    pub(crate) fn compile(self, symbols: &mut SymbolTable) -> Result<Production, ProductionError> {
        if self.name.trim().is_empty() {
            return Err(ProductionError::EmptyName);
        }
        if !self.conditions.iter().any(|c| !c.negated) {
            return Err(ProductionError::NoConditions { name: self.name });
        }
        if !self.conditions.iter().any(|c| !c.negated && c.goal_test) {
            return Err(ProductionError::NoStateTest { name: self.name });
        }

        let mut vars: HashMap<String, VarId> = HashMap::new();
        let mut variables = Vec::new();
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for spec in &self.conditions {
            let mut test = |term: &Term| lhs_test(term, symbols, &mut vars, &mut variables);
            let pattern = ConditionPattern {
                id: test(&spec.fields[0]),
                attr: test(&spec.fields[1]),
                value: test(&spec.fields[2]),
                acceptable: spec.acceptable,
                goal_test: spec.goal_test,
            };
            conditions.push(if spec.negated {
                Condition::Negative(pattern)
            } else {
                Condition::Positive(pattern)
            });
        }

        let mut unbound: HashMap<String, usize> = HashMap::new();
        let mut rhs_unbound = Vec::new();
        let mut actions = Vec::with_capacity(self.actions.len());
        for spec in &self.actions {
            let mut value =
                |term: &Term| rhs_value(term, symbols, &vars, &mut unbound, &mut rhs_unbound);
            actions.push(match spec {
                ActionSpec::Make {
                    fields,
                    pref_type,
                    referent,
                } => Action::Make(MakeAction {
                    id: value(&fields[0]),
                    attr: value(&fields[1]),
                    value: value(&fields[2]),
                    referent: referent.as_ref().map(&mut value),
                    pref_type: *pref_type,
                    support: ActionSupport::Unknown,
                }),
                ActionSpec::Call(term) => Action::Call(value(term)),
            });
        }

        Ok(Production {
            name: self.name,
            kind: self.kind,
            declared_support: self.support,
            conditions,
            actions,
            variables,
            rhs_unbound,
            interrupt: self.interrupt,
            firing_count: 0,
            reference_count: 0,
            instantiations: Vec::new(),
            excised: false,
        })
    }
}

fn constant(term: &Term, symbols: &mut SymbolTable) -> Option<SymbolId> {
    match term {
        Term::Str(s) => Some(symbols.intern_str(s)),
        Term::Int(i) => Some(symbols.intern_int(*i)),
        Term::Float(x) => Some(symbols.intern_float(*x)),
        Term::Var(_) | Term::Call { .. } => None,
    }
}

fn lhs_test(
    term: &Term,
    symbols: &mut SymbolTable,
    vars: &mut HashMap<String, VarId>,
    variables: &mut Vec<String>,
) -> Test {
    match term {
        Term::Var(name) => {
            let next = variables.len();
            let id = *vars.entry(name.clone()).or_insert(next);
            if id == next {
                variables.push(name.clone());
            }
            Test::Variable(id)
        }
        // Calls are not meaningful on the left-hand side; match their name.
        Term::Call { function, .. } => Test::Constant(symbols.intern_str(function)),
        other => match constant(other, symbols) {
            Some(sym) => Test::Constant(sym),
            None => Test::Constant(symbols.intern_str("nil")),
        },
    }
}

fn rhs_value(
    term: &Term,
    symbols: &mut SymbolTable,
    vars: &HashMap<String, VarId>,
    unbound: &mut HashMap<String, usize>,
    rhs_unbound: &mut Vec<String>,
) -> RhsValue {
    match term {
        Term::Var(name) => match vars.get(name) {
            Some(&v) => RhsValue::Bound(v),
            None => {
                let next = rhs_unbound.len();
                let idx = *unbound.entry(name.clone()).or_insert(next);
                if idx == next {
                    rhs_unbound.push(name.clone());
                }
                RhsValue::Unbound(idx)
            }
        },
        Term::Call { function, args } => RhsValue::Call {
            function: function.clone(),
            args: args
                .iter()
                .map(|a| rhs_value(a, symbols, vars, unbound, rhs_unbound))
                .collect(),
        },
        other => match constant(other, symbols) {
            Some(sym) => RhsValue::Symbol(sym),
            None => RhsValue::Symbol(symbols.intern_str("nil")),
        },
    }
}

// ---------------------------------------------------------------------------
// Production table
// ---------------------------------------------------------------------------

/// All productions known to the kernel.
///
/// The table holds one reference on every production it lists; each live
/// instantiation holds another. An excised production is dropped once the
/// last reference goes.
#[derive(Debug, Default)]
pub struct ProductionTable {
    prods: Arena<ProdId, Production>,
    by_name: HashMap<String, ProdId>,
    order: Vec<ProdId>,
}

impl ProductionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, mut prod: Production) -> ProdId {
        prod.reference_count = 1;
        let name = prod.name.clone();
        let id = self.prods.insert(prod);
        self.by_name.insert(name, id);
        self.order.push(id);
        id
    }

    pub fn get(&self, id: ProdId) -> Option<&Production> {
        self.prods.get(id)
    }

    pub fn get_mut(&mut self, id: ProdId) -> Option<&mut Production> {
        self.prods.get_mut(id)
    }

    pub fn find(&self, name: &str) -> Option<ProdId> {
        self.by_name.get(name).copied()
    }

    /// Listed productions, in load order.
    pub fn ids(&self) -> &[ProdId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn add_ref(&mut self, id: ProdId) {
        if let Some(p) = self.prods.get_mut(id) {
            p.reference_count += 1;
        }
    }

    pub(crate) fn remove_ref(&mut self, id: ProdId) {
        let Some(p) = self.prods.get_mut(id) else {
            return;
        };
        p.reference_count = p.reference_count.saturating_sub(1);
        if p.reference_count == 0 {
            tracing::trace!(production = %p.name, "releasing production");
            self.prods.remove(id);
        }
    }

    /// Unlist a production and drop the table's reference.
    pub(crate) fn unlist(&mut self, id: ProdId) {
        if let Some(p) = self.prods.get_mut(id) {
            p.excised = true;
            self.by_name.remove(&p.name);
        }
        self.order.retain(|&x| x != id);
        self.remove_ref(id);
    }

    /// Forget instantiations and firing counts. Excised productions that were
    /// only kept alive by instantiations are released.
    pub(crate) fn reset_run_state(&mut self) {
        for id in self.prods.keys() {
            let Some(p) = self.prods.get_mut(id) else {
                continue;
            };
            if p.excised {
                self.prods.remove(id);
                continue;
            }
            p.instantiations.clear();
            p.firing_count = 0;
            p.reference_count = 1;
        }
    }
}

impl Kernel {
    /// Compile and load a production.
    pub fn add_production(&mut self, builder: ProductionBuilder) -> KernelResult<ProdId> {
        if self.productions.find(builder.name()).is_some() {
            return Err(ProductionError::Duplicate {
                name: builder.name().to_string(),
            }
            .into());
        }
        let mut prod = builder.compile(&mut self.symbols)?;
        crate::osupport::calculate_compile_time_o_support(
            &mut prod,
            &self.predefined,
            self.config.cycle_mode == crate::kernel::CycleMode::Operand2,
        );
        tracing::debug!(production = %prod.name, kind = ?prod.kind, "adding production");
        let conditions = prod.conditions.clone();
        let variable_count = prod.variables.len();
        let id = self.productions.insert(prod);
        self.matcher.add_production(id, &conditions, variable_count);
        self.process_match_events();
        Ok(id)
    }

    /// Remove a production: withdraw its pending matches, file retractions for
    /// its live instantiations, and drop it from the match feed. The
    /// retractions run in the next preference phase like any other, and the
    /// production record lives on until its last instantiation is released.
    pub fn excise_production(&mut self, name: &str) -> KernelResult<()> {
        let Some(id) = self.productions.find(name) else {
            return Err(ProductionError::NotFound {
                name: name.to_string(),
            }
            .into());
        };
        tracing::debug!(production = %name, "excising production");
        self.withdraw_production_matches(id);
        let insts = self
            .productions
            .get(id)
            .map(|p| p.instantiations.clone())
            .unwrap_or_default();
        for inst in insts {
            let Some(token) = self.insts.get(inst).map(|i| i.token.clone()) else {
                continue;
            };
            self.file_retraction(id, inst, token);
        }
        self.matcher.remove_production(id);
        self.productions.unlist(id);
        Ok(())
    }

    pub fn production(&self, name: &str) -> Option<&Production> {
        self.productions.find(name).and_then(|id| self.productions.get(id))
    }

    pub fn production_by_id(&self, id: ProdId) -> Option<&Production> {
        self.productions.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_parsing() {
        assert_eq!(Term::from("<s>"), Term::Var("s".into()));
        assert_eq!(Term::from("state"), Term::Str("state".into()));
        assert_eq!(Term::from("<>"), Term::Str("<>".into()));
        assert_eq!(Term::from(3), Term::Int(3));
    }

    #[test]
    fn compile_binds_variables() {
        let mut symbols = SymbolTable::new();
        let prod = ProductionBuilder::new("p")
            .state("<s>", "superstate", "nil")
            .cond("<s>", "thing", "<t>")
            .make("<s>", "copy", "<t>", PreferenceType::Acceptable)
            .make("<new>", "name", "fresh", PreferenceType::Acceptable)
            .compile(&mut symbols)
            .unwrap();
        assert_eq!(prod.variables, vec!["s".to_string(), "t".to_string()]);
        assert_eq!(prod.rhs_unbound, vec!["new".to_string()]);
        let Action::Make(first) = &prod.actions[0] else {
            panic!("expected make action");
        };
        assert_eq!(first.id, RhsValue::Bound(0));
        assert_eq!(first.value, RhsValue::Bound(1));
        let Action::Make(second) = &prod.actions[1] else {
            panic!("expected make action");
        };
        assert_eq!(second.id, RhsValue::Unbound(0));
    }

    #[test]
    fn compile_rejects_missing_state_test() {
        let mut symbols = SymbolTable::new();
        let err = ProductionBuilder::new("p")
            .cond("<s>", "a", "b")
            .make("<s>", "c", "d", PreferenceType::Acceptable)
            .compile(&mut symbols)
            .unwrap_err();
        assert!(matches!(err, ProductionError::NoStateTest { .. }));
    }

    #[test]
    fn compile_rejects_only_negations() {
        let mut symbols = SymbolTable::new();
        let err = ProductionBuilder::new("p")
            .not("<s>", "a", "b")
            .compile(&mut symbols)
            .unwrap_err();
        assert!(matches!(err, ProductionError::NoConditions { .. }));
    }

    #[test]
    fn compile_rejects_empty_name() {
        let mut symbols = SymbolTable::new();
        let err = ProductionBuilder::new("  ")
            .state("<s>", "a", "b")
            .compile(&mut symbols)
            .unwrap_err();
        assert!(matches!(err, ProductionError::EmptyName));
    }

    #[test]
    fn nested_calls_compile() {
        let mut symbols = SymbolTable::new();
        let prod = ProductionBuilder::new("p")
            .state("<s>", "count", "<c>")
            .make(
                "<s>",
                "count",
                Term::call("+", vec!["<c>".into(), 1.into()]),
                PreferenceType::Acceptable,
            )
            .compile(&mut symbols)
            .unwrap();
        let Action::Make(m) = &prod.actions[0] else {
            panic!("expected make action");
        };
        assert!(m.value.is_call());
    }

    #[test]
    fn table_releases_excised_production_after_last_reference() {
        let mut symbols = SymbolTable::new();
        let prod = ProductionBuilder::new("p")
            .state("<s>", "a", "b")
            .compile(&mut symbols)
            .unwrap();
        let mut table = ProductionTable::new();
        let id = table.insert(prod);
        table.add_ref(id);
        table.unlist(id);
        assert!(table.find("p").is_none());
        assert!(table.get(id).is_some());
        table.remove_ref(id);
        assert!(table.get(id).is_none());
    }
}
