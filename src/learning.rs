//! Hooks for learning mechanisms that watch the kernel.
//!
//! The kernel itself does not learn. Chunking, reinforcement learning and
//! similar mechanisms attach through [`LearningHooks`] and see each new
//! instantiation, the numeric preferences it produced, and goal removal.

use crate::kernel::Kernel;
use crate::memory::{InstId, PrefId};
use crate::symbol::{Level, SymbolId};

/// Callbacks invoked by the kernel at learning-relevant points.
///
/// Every method has a no-op default.
pub trait LearningHooks {
    /// A production fired and its instantiation is complete.
    fn on_instantiation(&mut self, _kernel: &Kernel, _inst: InstId) {}

    /// The instantiation produced numeric-indifferent preferences.
    fn on_numeric_preferences(&mut self, _kernel: &Kernel, _inst: InstId, _prefs: &[PrefId]) {}

    /// Elaboration halts the agent when this turns true.
    fn max_chunks_reached(&self) -> bool {
        false
    }

    /// Whether selections in a slot should keep the evaluation preferences
    /// that led to them, so learning can backtrace through the choice.
    fn chunk_through_evaluation_rules(&self) -> bool {
        false
    }

    /// A goal is going away (`terminal`) or its reward changed.
    fn on_goal_update(&mut self, _goal: SymbolId, _level: Level, _reward: f64, _terminal: bool) {}
}

/// No learning at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLearning;

impl LearningHooks for NoLearning {}

impl Kernel {
    /// Lend the learning hooks to `f` together with a shared view of the kernel.
    pub(crate) fn with_learning<R>(
        &mut self,
        f: impl FnOnce(&mut dyn LearningHooks, &Kernel) -> R,
    ) -> R {
        let mut hooks = std::mem::replace(&mut self.learning, Box::new(NoLearning));
        let result = f(hooks.as_mut(), self);
        self.learning = hooks;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::RunType;
    use crate::kernel::KernelConfig;
    use crate::memory::PreferenceType;
    use crate::production::ProductionBuilder;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        fired: Arc<Mutex<Vec<String>>>,
        numeric: Arc<Mutex<usize>>,
    }

    impl LearningHooks for Recorder {
        fn on_instantiation(&mut self, kernel: &Kernel, inst: InstId) {
            let name = kernel.insts[inst].prod_name.clone();
            self.fired.lock().unwrap().push(name);
        }

        fn on_numeric_preferences(&mut self, _kernel: &Kernel, _inst: InstId, prefs: &[PrefId]) {
            *self.numeric.lock().unwrap() += prefs.len();
        }
    }

    #[test]
    fn hooks_see_each_instantiation() {
        let recorder = Recorder::default();
        let fired = Arc::clone(&recorder.fired);
        let numeric = Arc::clone(&recorder.numeric);
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        k.set_learning_hooks(Box::new(recorder));
        k.add_production(
            ProductionBuilder::new("propose")
                .state("<s>", "superstate", "nil")
                .make("<s>", "operator", "<o>", PreferenceType::Acceptable)
                .make_binary("<s>", "operator", "<o>", PreferenceType::NumericIndifferent, 0.5),
        )
        .unwrap();
        k.run(1, RunType::Decisions).unwrap();
        assert_eq!(*fired.lock().unwrap(), vec!["propose".to_string()]);
        assert_eq!(*numeric.lock().unwrap(), 1);
    }

    struct Budget;

    impl LearningHooks for Budget {
        fn max_chunks_reached(&self) -> bool {
            true
        }
    }

    #[test]
    fn exhausted_chunk_budget_halts() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        k.set_learning_hooks(Box::new(Budget));
        k.add_production(
            ProductionBuilder::new("elaborate")
                .state("<s>", "superstate", "nil")
                .make("<s>", "seen", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        k.run(1, RunType::Decisions).unwrap();
        assert_eq!(k.halt_reason(), Some("Max chunks reached"));
    }
}
