//! The match feed: which productions match working memory, and how that
//! changes.
//!
//! The kernel only consumes the feed through [`MatchFeed`]. [`NaiveMatcher`]
//! is the implementation shipped with the crate: it keeps the complete match
//! set of every production and, whenever working memory or the production set
//! changed, recomputes it and reports the difference as [`MatchEvent`]s.

use std::collections::{BTreeMap, HashMap};

use crate::memory::{ProdId, WmeFacts, WmeId};
use crate::production::{Condition, ConditionPattern, Test, VarId};
use crate::symbol::{SymbolId, SymbolTable};

/// One match of a production: the WME that satisfied each condition (`None`
/// for negations) and the value bound to each left-hand-side variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchToken {
    pub wmes: Vec<Option<WmeId>>,
    pub bindings: Vec<Option<SymbolId>>,
}

impl MatchToken {
    pub fn binding(&self, var: VarId) -> Option<SymbolId> {
        self.bindings.get(var).copied().flatten()
    }

    /// The positively matched WMEs, in condition order.
    pub fn matched_wmes(&self) -> impl Iterator<Item = WmeId> + '_ {
        self.wmes.iter().filter_map(|w| *w)
    }
}

/// A change to the match set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchEvent {
    Assert { prod: ProdId, token: MatchToken },
    Retract { prod: ProdId, token: MatchToken },
}

/// A condition with the token's bindings substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchedCondition {
    Positive(WmeId),
    Negative {
        id: Option<SymbolId>,
        attr: Option<SymbolId>,
        value: Option<SymbolId>,
        acceptable: bool,
    },
}

/// The incremental matcher consumed by the kernel.
pub trait MatchFeed: std::fmt::Debug {
    fn add_production(&mut self, prod: ProdId, conditions: &[Condition], variable_count: usize);

    /// Forget a production. No retraction events are reported for its
    /// current matches.
    fn remove_production(&mut self, prod: ProdId);

    fn add_wme(&mut self, wme: WmeId, facts: WmeFacts);

    fn remove_wme(&mut self, wme: WmeId);

    /// Report match-set changes since the last call, retractions first.
    fn take_events(&mut self, symbols: &SymbolTable) -> Vec<MatchEvent>;

    /// Instantiate the conditions of `prod` against `token`.
    fn instantiate_conditions(&self, prod: ProdId, token: &MatchToken) -> Vec<MatchedCondition>;

    fn wme_count(&self) -> usize;

    /// Drop all WMEs and matches, keeping productions.
    fn clear_wmes(&mut self);
}

#[derive(Debug, Clone)]
struct CompiledProduction {
    conditions: Vec<Condition>,
    variable_count: usize,
    positives: Vec<usize>,
    negatives: Vec<usize>,
}

/// Match feed that recomputes complete match sets.
#[derive(Debug, Default)]
pub struct NaiveMatcher {
    productions: BTreeMap<ProdId, CompiledProduction>,
    /// WMEs by timetag.
    wmes: BTreeMap<u64, (WmeId, WmeFacts)>,
    timetags: HashMap<WmeId, u64>,
    current: BTreeMap<ProdId, Vec<MatchToken>>,
    dirty: bool,
}

impl NaiveMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn field_matches(
        test: Test,
        field: SymbolId,
        bindings: &mut [Option<SymbolId>],
        bound: &mut Vec<VarId>,
    ) -> bool {
        match test {
            Test::Constant(c) => c == field,
            Test::Variable(v) => match bindings[v] {
                Some(existing) => existing == field,
                None => {
                    bindings[v] = Some(field);
                    bound.push(v);
                    true
                }
            },
        }
    }

    /// Try to match `wme` against `pattern`, extending `bindings`. Returns
    /// the variables newly bound, or `None` (with `bindings` restored).
    fn match_pattern(
        symbols: &SymbolTable,
        pattern: &ConditionPattern,
        wme: &WmeFacts,
        bindings: &mut [Option<SymbolId>],
    ) -> Option<Vec<VarId>> {
        if pattern.acceptable != wme.acceptable {
            return None;
        }
        if pattern.goal_test && !symbols.is_goal(wme.id) {
            return None;
        }
        let mut bound = Vec::new();
        let ok = Self::field_matches(pattern.id, wme.id, bindings, &mut bound)
            && Self::field_matches(pattern.attr, wme.attr, bindings, &mut bound)
            && Self::field_matches(pattern.value, wme.value, bindings, &mut bound);
        if ok {
            Some(bound)
        } else {
            for v in bound {
                bindings[v] = None;
            }
            None
        }
    }

    fn negation_holds(
        &self,
        symbols: &SymbolTable,
        pattern: &ConditionPattern,
        bindings: &[Option<SymbolId>],
    ) -> bool {
        // Variables bound only inside the negation act as local wildcards.
        let mut scratch = bindings.to_vec();
        !self.wmes.values().any(|(_, facts)| {
            let matched = Self::match_pattern(symbols, pattern, facts, &mut scratch);
            if let Some(bound) = matched {
                for v in bound {
                    scratch[v] = None;
                }
                true
            } else {
                false
            }
        })
    }

    fn search(
        &self,
        symbols: &SymbolTable,
        prod: &CompiledProduction,
        depth: usize,
        token: &mut MatchToken,
        out: &mut Vec<MatchToken>,
    ) {
        if depth == prod.positives.len() {
            let negations_hold = prod.negatives.iter().all(|&i| {
                self.negation_holds(symbols, prod.conditions[i].pattern(), &token.bindings)
            });
            if negations_hold {
                out.push(token.clone());
            }
            return;
        }
        let index = prod.positives[depth];
        let pattern = prod.conditions[index].pattern();
        for (wme, facts) in self.wmes.values() {
            if let Some(bound) = Self::match_pattern(symbols, pattern, facts, &mut token.bindings) {
                token.wmes[index] = Some(*wme);
                self.search(symbols, prod, depth + 1, token, out);
                token.wmes[index] = None;
                for v in bound {
                    token.bindings[v] = None;
                }
            }
        }
    }

    fn matches_of(&self, symbols: &SymbolTable, prod: &CompiledProduction) -> Vec<MatchToken> {
        let mut token = MatchToken {
            wmes: vec![None; prod.conditions.len()],
            bindings: vec![None; prod.variable_count],
        };
        let mut out = Vec::new();
        self.search(symbols, prod, 0, &mut token, &mut out);
        out
    }
}

impl MatchFeed for NaiveMatcher {
    fn add_production(&mut self, prod: ProdId, conditions: &[Condition], variable_count: usize) {
        let (positives, negatives): (Vec<usize>, Vec<usize>) =
            (0..conditions.len()).partition(|&i| matches!(conditions[i], Condition::Positive(_)));
        self.productions.insert(
            prod,
            CompiledProduction {
                conditions: conditions.to_vec(),
                variable_count,
                positives,
                negatives,
            },
        );
        self.current.insert(prod, Vec::new());
        self.dirty = true;
    }

    fn remove_production(&mut self, prod: ProdId) {
        self.productions.remove(&prod);
        self.current.remove(&prod);
    }

    fn add_wme(&mut self, wme: WmeId, facts: WmeFacts) {
        self.timetags.insert(wme, facts.timetag);
        self.wmes.insert(facts.timetag, (wme, facts));
        self.dirty = true;
    }

    fn remove_wme(&mut self, wme: WmeId) {
        if let Some(tt) = self.timetags.remove(&wme) {
            self.wmes.remove(&tt);
            self.dirty = true;
        }
    }

    fn take_events(&mut self, symbols: &SymbolTable) -> Vec<MatchEvent> {
        if !self.dirty {
            return Vec::new();
        }
        self.dirty = false;
        let mut retractions = Vec::new();
        let mut assertions = Vec::new();
        let mut next = BTreeMap::new();
        for (&prod, compiled) in &self.productions {
            let fresh = self.matches_of(symbols, compiled);
            let old = self.current.get(&prod).map(Vec::as_slice).unwrap_or_default();
            for token in old.iter().filter(|t| !fresh.contains(t)) {
                retractions.push(MatchEvent::Retract {
                    prod,
                    token: token.clone(),
                });
            }
            for token in fresh.iter().filter(|t| !old.contains(t)) {
                assertions.push(MatchEvent::Assert {
                    prod,
                    token: token.clone(),
                });
            }
            next.insert(prod, fresh);
        }
        self.current = next;
        if !retractions.is_empty() || !assertions.is_empty() {
            tracing::trace!(
                retractions = retractions.len(),
                assertions = assertions.len(),
                "match set changed"
            );
        }
        retractions.extend(assertions);
        retractions
    }

    fn instantiate_conditions(&self, prod: ProdId, token: &MatchToken) -> Vec<MatchedCondition> {
        let Some(compiled) = self.productions.get(&prod) else {
            return Vec::new();
        };
        let resolve = |test: Test| match test {
            Test::Constant(c) => Some(c),
            Test::Variable(v) => token.binding(v),
        };
        compiled
            .conditions
            .iter()
            .enumerate()
            .filter_map(|(i, cond)| match cond {
                Condition::Positive(_) => token
                    .wmes
                    .get(i)
                    .copied()
                    .flatten()
                    .map(MatchedCondition::Positive),
                Condition::Negative(p) => Some(MatchedCondition::Negative {
                    id: resolve(p.id),
                    attr: resolve(p.attr),
                    value: resolve(p.value),
                    acceptable: p.acceptable,
                }),
            })
            .collect()
    }

    fn wme_count(&self) -> usize {
        self.wmes.len()
    }

    fn clear_wmes(&mut self) {
        self.wmes.clear();
        self.timetags.clear();
        for tokens in self.current.values_mut() {
            tokens.clear();
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Arena, ArenaKey, PreferenceType};
    use crate::production::ProductionBuilder;

    struct Fixture {
        symbols: SymbolTable,
        matcher: NaiveMatcher,
        wme_ids: Arena<WmeId, ()>,
        next_tt: u64,
        state: SymbolId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut symbols = SymbolTable::new();
            let state = symbols.new_identifier('S', 1);
            if let Some(info) = symbols.ident_mut(state) {
                info.goal = Some(Box::default());
            }
            Self {
                symbols,
                matcher: NaiveMatcher::new(),
                wme_ids: Arena::new(),
                next_tt: 1,
                state,
            }
        }

        fn add(&mut self, id: SymbolId, attr: &str, value: SymbolId, acceptable: bool) -> WmeId {
            let attr = self.symbols.intern_str(attr);
            let w = self.wme_ids.insert(());
            let facts = WmeFacts {
                id,
                attr,
                value,
                acceptable,
                timetag: self.next_tt,
            };
            self.next_tt += 1;
            self.matcher.add_wme(w, facts);
            w
        }

        fn load(&mut self, builder: ProductionBuilder) -> ProdId {
            let prod = builder.compile(&mut self.symbols).unwrap();
            let id = ProdId::from_parts(self.matcher.productions.len() as u32, 0);
            self.matcher
                .add_production(id, &prod.conditions, prod.variables.len());
            id
        }
    }

    fn asserts(events: &[MatchEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MatchEvent::Assert { .. }))
            .count()
    }

    #[test]
    fn joins_on_shared_variables() {
        let mut f = Fixture::new();
        let p = f.load(
            ProductionBuilder::new("join")
                .state("<s>", "block", "<b>")
                .cond("<b>", "color", "red")
                .make("<s>", "found", "<b>", PreferenceType::Acceptable),
        );
        let b1 = f.symbols.new_identifier('B', 1);
        let b2 = f.symbols.new_identifier('B', 1);
        let red = f.symbols.intern_str("red");
        let blue = f.symbols.intern_str("blue");
        let s = f.state;
        f.add(s, "block", b1, false);
        f.add(s, "block", b2, false);
        f.add(b1, "color", red, false);
        f.add(b2, "color", blue, false);

        let events = f.matcher.take_events(&f.symbols);
        assert_eq!(events.len(), 1);
        let MatchEvent::Assert { prod, token } = &events[0] else {
            panic!("expected assertion");
        };
        assert_eq!(*prod, p);
        assert_eq!(token.binding(1), Some(b1));
        assert!(f.matcher.take_events(&f.symbols).is_empty());
    }

    #[test]
    fn removal_produces_retraction() {
        let mut f = Fixture::new();
        f.load(ProductionBuilder::new("p").state("<s>", "flag", "on"));
        let on = f.symbols.intern_str("on");
        let s = f.state;
        let w = f.add(s, "flag", on, false);
        assert_eq!(asserts(&f.matcher.take_events(&f.symbols)), 1);
        f.matcher.remove_wme(w);
        let events = f.matcher.take_events(&f.symbols);
        assert!(matches!(events.as_slice(), [MatchEvent::Retract { .. }]));
    }

    #[test]
    fn negation_blocks_match() {
        let mut f = Fixture::new();
        f.load(
            ProductionBuilder::new("p")
                .state("<s>", "flag", "on")
                .not("<s>", "blocked", "<any>"),
        );
        let on = f.symbols.intern_str("on");
        let yes = f.symbols.intern_str("yes");
        let s = f.state;
        f.add(s, "flag", on, false);
        let blocker = f.add(s, "blocked", yes, false);
        assert!(f.matcher.take_events(&f.symbols).is_empty());
        f.matcher.remove_wme(blocker);
        assert_eq!(asserts(&f.matcher.take_events(&f.symbols)), 1);
    }

    #[test]
    fn acceptable_tests_only_match_acceptable_wmes() {
        let mut f = Fixture::new();
        f.load(ProductionBuilder::new("p").state("<s>", "operator", "<o>"));
        let o = f.symbols.new_identifier('O', 1);
        let s = f.state;
        f.add(s, "operator", o, true);
        assert!(f.matcher.take_events(&f.symbols).is_empty());
        f.add(s, "operator", o, false);
        assert_eq!(asserts(&f.matcher.take_events(&f.symbols)), 1);
    }

    #[test]
    fn goal_test_requires_goal_identifier() {
        let mut f = Fixture::new();
        f.load(ProductionBuilder::new("p").state("<s>", "name", "x"));
        let x = f.symbols.intern_str("x");
        let plain = f.symbols.new_identifier('X', 1);
        f.add(plain, "name", x, false);
        assert!(f.matcher.take_events(&f.symbols).is_empty());
    }

    #[test]
    fn instantiated_negation_carries_bindings() {
        let mut f = Fixture::new();
        let p = f.load(
            ProductionBuilder::new("p")
                .state("<s>", "flag", "on")
                .not("<s>", "blocked", "<any>"),
        );
        let on = f.symbols.intern_str("on");
        let s = f.state;
        let w = f.add(s, "flag", on, false);
        let events = f.matcher.take_events(&f.symbols);
        let MatchEvent::Assert { token, .. } = &events[0] else {
            panic!("expected assertion");
        };
        let conds = f.matcher.instantiate_conditions(p, token);
        assert_eq!(conds[0], MatchedCondition::Positive(w));
        let blocked = f.symbols.find_str("blocked");
        assert_eq!(
            conds[1],
            MatchedCondition::Negative {
                id: Some(s),
                attr: blocked,
                value: None,
                acceptable: false,
            }
        );
    }
}
