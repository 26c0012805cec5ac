//! End-to-end tests for the akh-kernel.
//!
//! These tests load small agents through the public API, run them through
//! whole decision cycles, and inspect working memory, preferences and
//! instantiations afterwards.

use std::sync::{Arc, Mutex};

use akh_kernel::cycle::{Phase, RunType};
use akh_kernel::demo::{self, Demo};
use akh_kernel::error::RhsError;
use akh_kernel::kernel::{CycleMode, Kernel, KernelConfig};
use akh_kernel::learning::LearningHooks;
use akh_kernel::memory::InstId;
use akh_kernel::memory::PreferenceType::{Acceptable, Reject};
use akh_kernel::production::{DeclaredSupport, ProductionBuilder, Term};
use akh_kernel::symbol::{SymbolId, TOP_GOAL_LEVEL};

fn test_kernel() -> Kernel {
    Kernel::new(KernelConfig::default()).unwrap()
}

fn names(k: &Kernel, values: Vec<SymbolId>) -> Vec<String> {
    values.into_iter().map(|v| k.symbols().display(v)).collect()
}

fn foo_wme_support(k: &Kernel) -> Option<bool> {
    let top = k.top_goal()?;
    let foo = k.symbols().find_str("foo")?;
    let wme = k.wmes_of(top).find(|w| w.attr == foo)?;
    let pref = k.preference(wme.preference?)?;
    Some(pref.o_supported)
}

/// Records production names in firing order.
#[derive(Default, Clone)]
struct Firings(Arc<Mutex<Vec<String>>>);

impl LearningHooks for Firings {
    fn on_instantiation(&mut self, kernel: &Kernel, inst: InstId) {
        if let Some(i) = kernel.instantiation(inst) {
            self.0.lock().unwrap().push(i.prod_name.clone());
        }
    }
}

fn propose_tie(k: &mut Kernel) {
    for name in ["a", "b"] {
        k.add_production(
            ProductionBuilder::new(format!("propose*{name}"))
                .state("<s>", "superstate", "nil")
                .make("<s>", "operator", "<o>", Acceptable)
                .make("<o>", "name", name, Acceptable),
        )
        .unwrap();
    }
}

#[test]
fn top_state_elaboration_fires_once_at_top_level() {
    let mut k = test_kernel();
    k.add_production(
        ProductionBuilder::new("P1")
            .state("<s>", "superstate", "nil")
            .make("<s>", "foo", 1, Acceptable),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();

    let top = k.top_goal().unwrap();
    assert_eq!(names(&k, k.attribute_values(top, "foo")), vec!["1"]);
    // Nothing tests an operator, so the elaboration is i-supported.
    assert_eq!(foo_wme_support(&k), Some(false));

    let p1 = k.production("P1").unwrap();
    assert_eq!(p1.firing_count, 1);
    assert_eq!(p1.instantiations.len(), 1);
    let inst = k.instantiation(p1.instantiations[0]).unwrap();
    assert_eq!(inst.match_goal, Some(top));
    assert_eq!(inst.match_goal_level, TOP_GOAL_LEVEL);
}

#[test]
fn declared_o_support_persists_the_elaboration() {
    let mut k = test_kernel();
    k.add_production(
        ProductionBuilder::new("P1")
            .support(DeclaredSupport::OSupport)
            .state("<s>", "superstate", "nil")
            .make("<s>", "foo", 1, Acceptable),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();
    assert_eq!(foo_wme_support(&k), Some(true));
}

#[test]
fn conflicting_proposals_create_a_tie_impasse() {
    let mut k = test_kernel();
    for name in ["a", "b"] {
        k.add_production(
            ProductionBuilder::new(format!("propose*{name}"))
                .state("<s>", "superstate", "nil")
                .make("<s>", "operator", "<o>", Acceptable)
                .make("<o>", "name", name, Acceptable),
        )
        .unwrap();
    }
    k.run(1, RunType::Decisions).unwrap();

    let top = k.top_goal().unwrap();
    assert!(k.selected_operator(top).is_none());
    let stack = k.goal_stack();
    assert_eq!(stack.len(), 2);
    let sub = stack[1];
    assert_eq!(k.symbols().level(sub), k.symbols().level(top) + 1);
    assert_eq!(names(&k, k.attribute_values(sub, "impasse")), vec!["tie"]);
    assert_eq!(names(&k, k.attribute_values(sub, "attribute")), vec!["operator"]);
    assert_eq!(k.attribute_values(sub, "item").len(), 2);
    assert_eq!(names(&k, k.attribute_values(sub, "item-count")), vec!["2"]);
}

#[test]
fn o_reject_removes_the_acceptable_value() {
    let mut k = test_kernel();
    k.add_production(
        ProductionBuilder::new("make-thing")
            .support(DeclaredSupport::OSupport)
            .state("<s>", "superstate", "nil")
            .not("<s>", "made", "yes")
            .make("<s>", "thing", "x", Acceptable)
            .make("<s>", "made", "yes", Acceptable),
    )
    .unwrap();
    k.add_production(
        ProductionBuilder::new("reject-thing")
            .support(DeclaredSupport::OSupport)
            .state("<s>", "thing", "x")
            .make("<s>", "thing", "x", Reject),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();

    let top = k.top_goal().unwrap();
    assert!(k.attribute_values(top, "thing").is_empty());
    assert_eq!(names(&k, k.attribute_values(top, "made")), vec!["yes"]);
    assert_eq!(k.production("reject-thing").unwrap().firing_count, 1);
}

#[test]
fn counter_demo_runs_to_its_limit() {
    let mut k = test_kernel();
    demo::load_counter(&mut k, Some(5)).unwrap();
    let outcome = k.run(100, RunType::Decisions).unwrap();
    assert!(outcome.halted);
    assert_eq!(k.take_printed_output(), "counted to 5");
    assert!(k.run(1, RunType::Decisions).is_err());
}

#[test]
fn legacy_mode_runs_the_counter() {
    let mut k = Kernel::new(KernelConfig {
        cycle_mode: CycleMode::Legacy,
        ..KernelConfig::default()
    })
    .unwrap();
    demo::load_counter(&mut k, Some(3)).unwrap();
    let outcome = k.run(50, RunType::Decisions).unwrap();
    assert!(outcome.halted);
    let top = k.top_goal().unwrap();
    let count: Vec<i64> = k
        .attribute_values(top, "count")
        .into_iter()
        .filter_map(|c| k.symbols().as_int(c))
        .collect();
    assert_eq!(count, vec![3]);
}

#[test]
fn tie_demo_resolves_and_applies() {
    let mut k = test_kernel();
    Demo::Tie.load(&mut k).unwrap();
    k.run(2, RunType::Decisions).unwrap();
    let top = k.top_goal().unwrap();
    assert_eq!(names(&k, k.attribute_values(top, "moved")), vec!["left"]);
    assert_eq!(k.take_printed_output(), "moved left");
}

#[test]
fn user_rhs_function_feeds_a_preference() {
    let mut k = test_kernel();
    k.register_rhs_function("double", 1, Some(1), |ctx, args| {
        let v = ctx
            .symbols
            .as_int(args[0])
            .ok_or_else(|| RhsError::FunctionFailed {
                name: "double".into(),
                message: "not an integer".into(),
            })?;
        Ok(Some(ctx.symbols.intern_int(v * 2)))
    });
    k.add_production(
        ProductionBuilder::new("double-it")
            .state("<s>", "superstate", "nil")
            .make("<s>", "answer", Term::call("double", vec![21.into()]), Acceptable),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();
    let top = k.top_goal().unwrap();
    assert_eq!(names(&k, k.attribute_values(top, "answer")), vec!["42"]);
}

#[test]
fn failing_rhs_function_is_a_diagnostic_not_an_error() {
    let mut k = test_kernel();
    k.add_production(
        ProductionBuilder::new("divide")
            .state("<s>", "superstate", "nil")
            .make("<s>", "ratio", Term::call("/", vec![1.into(), 0.into()]), Acceptable),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();
    let top = k.top_goal().unwrap();
    assert!(k.attribute_values(top, "ratio").is_empty());
    assert!(!k.diagnostics().is_empty());
    assert!(!k.is_halted());
}

#[test]
fn excising_retracts_i_supported_results() {
    let mut k = test_kernel();
    k.add_production(
        ProductionBuilder::new("P1")
            .state("<s>", "superstate", "nil")
            .make("<s>", "foo", 1, Acceptable),
    )
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();
    k.excise_production("P1").unwrap();
    k.run(1, RunType::Decisions).unwrap();
    let top = k.top_goal().unwrap();
    assert!(k.attribute_values(top, "foo").is_empty());
    assert!(k.production("P1").is_none());
}

#[test]
fn stop_phase_is_honoured() {
    let mut k = Kernel::new(KernelConfig {
        stop_phase: Phase::Apply,
        ..KernelConfig::default()
    })
    .unwrap();
    k.run(1, RunType::Decisions).unwrap();
    assert_eq!(k.current_phase(), Phase::Apply);
    assert_eq!(k.stats().decision_cycles, 1);
}

#[test]
fn substate_waits_while_the_superstate_settles() {
    let mut k = test_kernel();
    let firings = Firings::default();
    k.set_learning_hooks(Box::new(firings.clone()));
    propose_tie(&mut k);
    k.add_production(
        ProductionBuilder::new("sub*result")
            .state("<s>", "impasse", "tie")
            .cond("<s>", "superstate", "<ss>")
            .make("<ss>", "noted", "yes", Acceptable),
    )
    .unwrap();
    k.add_production(
        ProductionBuilder::new("top*step1")
            .state("<s>", "noted", "yes")
            .make("<s>", "step-one", "yes", Acceptable),
    )
    .unwrap();
    k.add_production(
        ProductionBuilder::new("top*step2")
            .state("<s>", "step-one", "yes")
            .make("<s>", "step-two", "yes", Acceptable),
    )
    .unwrap();
    k.add_production(
        ProductionBuilder::new("sub*second")
            .state("<s>", "impasse", "tie")
            .cond("<s>", "superstate", "<ss>")
            .cond("<ss>", "noted", "yes")
            .make("<ss>", "second", "yes", Acceptable),
    )
    .unwrap();
    k.run(2, RunType::Decisions).unwrap();

    let fired = firings.0.lock().unwrap().clone();
    let position = |name: &str| fired.iter().position(|f| f == name);
    assert!(position("sub*result") < position("top*step1"));
    assert!(position("top*step2").is_some());
    assert!(position("top*step2") < position("sub*second"));
    assert_eq!(fired.iter().filter(|f| *f == "sub*second").count(), 1);
    let top = k.top_goal().unwrap();
    assert_eq!(names(&k, k.attribute_values(top, "step-two")), vec!["yes"]);
}

#[test]
fn changed_dependency_removes_the_substate() {
    let mut k = test_kernel();
    propose_tie(&mut k);
    k.add_production(
        ProductionBuilder::new("top*flag")
            .state("<s>", "switch", "on")
            .make("<s>", "flag", "on", Acceptable),
    )
    .unwrap();
    k.add_production(
        ProductionBuilder::new("sub*mark")
            .support(DeclaredSupport::OSupport)
            .state("<s>", "impasse", "tie")
            .cond("<s>", "superstate", "<ss>")
            .cond("<ss>", "flag", "on")
            .make("<s>", "marked", "yes", Acceptable),
    )
    .unwrap();
    let top = k.top_goal().unwrap();
    let switch = k.symbols_mut().intern_str("switch");
    let on = k.symbols_mut().intern_str("on");
    let w = k.add_input_wme(top, switch, on).unwrap();
    k.run(1, RunType::Decisions).unwrap();

    let stack = k.goal_stack();
    assert_eq!(stack.len(), 2);
    assert_eq!(names(&k, k.attribute_values(stack[1], "marked")), vec!["yes"]);

    k.remove_input_wme(w).unwrap();
    // input, propose
    k.run(2, RunType::Phases).unwrap();
    assert_eq!(k.goal_stack(), vec![top]);
    assert!(k.attribute_values(top, "flag").is_empty());
}
