//! Small agents used by the command line and the benchmarks.

use serde::{Deserialize, Serialize};

use crate::error::KernelResult;
use crate::kernel::{CycleMode, Kernel};
use crate::memory::PreferenceType::{Acceptable, Best, Reconsider, Reject};
use crate::production::{ProductionBuilder, Term};

/// The built-in demonstration agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Demo {
    /// Counts upward, one operator application per decision.
    Counter,
    /// Proposes two operators, impasses on the tie and resolves it in the
    /// substate.
    Tie,
}

impl Demo {
    /// Load the agent's productions into `kernel`.
    pub fn load(self, kernel: &mut Kernel) -> KernelResult<()> {
        match self {
            Demo::Counter => load_counter(kernel, None),
            Demo::Tie => load_tie(kernel),
        }
    }
}

/// Counting agent: `init` puts `^count 0` on the top state, then each
/// `increment` replaces `^count n` with `^count n+1`. With a `limit` the
/// agent halts when the count reaches it. In `Legacy` mode a retired
/// operator, one whose proposal is gone, is reconsidered.
pub fn load_counter(kernel: &mut Kernel, limit: Option<i64>) -> KernelResult<()> {
    kernel.add_production(
        ProductionBuilder::new("counter*propose*init")
            .state("<s>", "superstate", "nil")
            .not("<s>", "count", "<any>")
            .make("<s>", "operator", "<o>", Acceptable)
            .make("<o>", "name", "init", Acceptable),
    )?;
    kernel.add_production(
        ProductionBuilder::new("counter*apply*init")
            .state("<s>", "operator", "<o>")
            .cond("<o>", "name", "init")
            .make("<s>", "count", 0, Acceptable),
    )?;
    kernel.add_production(
        ProductionBuilder::new("counter*propose*increment")
            .state("<s>", "count", "<c>")
            .make("<s>", "operator", "<o>", Acceptable)
            .make("<o>", "name", "increment", Acceptable),
    )?;
    kernel.add_production(
        ProductionBuilder::new("counter*apply*increment")
            .state("<s>", "operator", "<o>")
            .cond("<o>", "name", "increment")
            .cond("<s>", "count", "<c>")
            .make("<s>", "count", "<c>", Reject)
            .make(
                "<s>",
                "count",
                Term::call("+", vec!["<c>".into(), 1.into()]),
                Acceptable,
            ),
    )?;
    if kernel.config().cycle_mode == CycleMode::Legacy {
        // Legacy operators stay installed until reconsidered.
        kernel.add_production(
            ProductionBuilder::new("counter*reconsider")
                .state("<s>", "operator", "<o>")
                .not("<o>", "name", "<any>")
                .make("<s>", "operator", "<o>", Reconsider),
        )?;
    }
    if let Some(limit) = limit {
        kernel.add_production(
            ProductionBuilder::new("counter*done")
                .state("<s>", "count", limit)
                .call(Term::call(
                    "write",
                    vec!["counted to ".into(), limit.into()],
                ))
                .call(Term::call("halt", Vec::new())),
        )?;
    }
    Ok(())
}

/// Tie agent: `left` and `right` are both acceptable and nothing ranks them,
/// so the decision impasses. In the tie substate `prefer-left` makes `left`
/// best for the superstate; `left` is then selected and applied.
pub fn load_tie(kernel: &mut Kernel) -> KernelResult<()> {
    for side in ["left", "right"] {
        kernel.add_production(
            ProductionBuilder::new(format!("tie*propose*{side}"))
                .state("<s>", "superstate", "nil")
                .not("<s>", "moved", "<any>")
                .make("<s>", "operator", "<o>", Acceptable)
                .make("<o>", "name", side, Acceptable),
        )?;
    }
    kernel.add_production(
        ProductionBuilder::new("tie*prefer-left")
            .state("<s>", "impasse", "tie")
            .cond("<s>", "superstate", "<ss>")
            .cond("<s>", "item", "<o>")
            .cond("<o>", "name", "left")
            .make("<ss>", "operator", "<o>", Best),
    )?;
    kernel.add_production(
        ProductionBuilder::new("tie*apply")
            .state("<s>", "operator", "<o>")
            .cond("<o>", "name", "<side>")
            .make("<s>", "moved", "<side>", Acceptable)
            .call(Term::call("write", vec!["moved ".into(), "<side>".into()])),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::RunType;
    use crate::kernel::KernelConfig;

    fn count(k: &Kernel) -> Option<i64> {
        let top = k.top_goal()?;
        k.attribute_values(top, "count")
            .into_iter()
            .find_map(|c| k.symbols().as_int(c))
    }

    #[test]
    fn counter_counts_one_per_decision() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        load_counter(&mut k, None).unwrap();
        k.run(1, RunType::Decisions).unwrap();
        assert_eq!(count(&k), Some(0));
        k.run(3, RunType::Decisions).unwrap();
        assert_eq!(count(&k), Some(3));
        let top = k.top_goal().unwrap();
        assert_eq!(k.attribute_values(top, "count").len(), 1);
    }

    #[test]
    fn counter_halts_at_its_limit() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        load_counter(&mut k, Some(4)).unwrap();
        let outcome = k.run(50, RunType::Decisions).unwrap();
        assert!(outcome.halted);
        assert_eq!(count(&k), Some(4));
        assert_eq!(k.take_printed_output(), "counted to 4");
    }

    #[test]
    fn tie_is_resolved_in_the_substate() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        Demo::Tie.load(&mut k).unwrap();
        // input, propose, decision
        k.run(3, RunType::Phases).unwrap();
        let stack = k.goal_stack();
        assert_eq!(stack.len(), 2);
        let impasse: Vec<String> = k
            .attribute_values(stack[1], "impasse")
            .into_iter()
            .map(|v| k.symbols().display(v))
            .collect();
        assert_eq!(impasse, vec!["tie".to_string()]);

        k.run(2, RunType::Decisions).unwrap();
        let top = k.top_goal().unwrap();
        let moved: Vec<String> = k
            .attribute_values(top, "moved")
            .into_iter()
            .map(|v| k.symbols().display(v))
            .collect();
        assert_eq!(moved, vec!["left".to_string()]);
        assert_eq!(k.goal_stack().len(), 1);
    }
}
