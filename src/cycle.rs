//! The decision cycle: phase state machine, run control, and statistics.
//!
//! In `Operand2` mode a decision cycle is `Input → Propose → Decision →
//! Apply → Output`; proposal and application repeat elaboration cycles until
//! quiescence at their level of the goal stack. `Legacy` mode alternates
//! `Input → Preference → WorkingMemory → Output` until nothing is pending,
//! then runs `Decision`.
//!
//! Stopping and interrupting only take effect at phase boundaries. A halted
//! kernel refuses to run until [`Kernel::reinitialize`].

use serde::{Deserialize, Serialize};

use crate::error::{CycleError, KernelResult};
use crate::kernel::{CycleMode, Kernel};
use crate::match_set::FiringType;

/// Phases of the decision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Input,
    Propose,
    Decision,
    Apply,
    Output,
    /// Legacy mode only.
    Preference,
    /// Legacy mode only.
    WorkingMemory,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Input => "input",
            Phase::Propose => "propose",
            Phase::Decision => "decision",
            Phase::Apply => "apply",
            Phase::Output => "output",
            Phase::Preference => "preference",
            Phase::WorkingMemory => "working-memory",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Phase::Input),
            "propose" => Ok(Phase::Propose),
            "decision" => Ok(Phase::Decision),
            "apply" => Ok(Phase::Apply),
            "output" => Ok(Phase::Output),
            "preference" => Ok(Phase::Preference),
            "working-memory" => Ok(Phase::WorkingMemory),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// What a call to [`Kernel::run`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunType {
    Phases,
    Elaborations,
    Decisions,
    /// Output phases in which the output link changed.
    ModificationsOfOutput,
    Forever,
}

/// Cumulative counters, reset by `reinitialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStats {
    pub decision_cycles: u64,
    pub decision_phases: u64,
    pub elaboration_cycles: u64,
    pub pe_cycles: u64,
    pub inner_elaboration_cycles: u64,
    pub production_firings: u64,
    pub wme_additions: u64,
    pub wme_removals: u64,
    pub max_wm_size: usize,
    pub generated_output_count: u64,
}

/// Kinds of recoverable problems the kernel reports without stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticKind {
    RhsFunctionFailed,
    NonIdentifierPreference,
    MalformedPreference,
    OperatorElaborationDowngrade,
    ConstraintFailure,
    MaxElaborations,
}

/// A recoverable problem, kept for inspection after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub production: Option<String>,
    pub message: String,
    /// Decision cycle in which it happened.
    pub decision_cycle: u64,
}

/// Summary of one [`Kernel::run`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub phases: u64,
    pub elaborations: u64,
    pub decisions: u64,
    pub stop_reason: Option<String>,
    pub halted: bool,
}

/// Phase cursor and run-control flags.
#[derive(Debug, Default)]
pub struct CycleState {
    pub current_phase: Phase,
    pub stats: CycleStats,
    halted: bool,
    stopped: bool,
    reason_for_stopping: Option<String>,
    pub(crate) e_cycles_this_d_cycle: u64,
    pub(crate) pe_cycles_this_d_cycle: u64,
    run_phase_count: u64,
    run_elaboration_count: u64,
    run_last_output_count: u64,
    hit_max_elaborations: bool,
    /// Set while running by elaborations: proposal and application return
    /// after each elaboration cycle.
    stop_after_elaboration: bool,
}

impl CycleState {
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn reason_for_stopping(&self) -> Option<&str> {
        self.reason_for_stopping.as_deref()
    }

    pub fn hit_max_elaborations(&self) -> bool {
        self.hit_max_elaborations
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    fn start_run(&mut self) {
        self.stopped = false;
        self.reason_for_stopping = None;
        self.run_phase_count = 0;
        self.run_elaboration_count = 0;
    }
}

impl Kernel {
    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Stop the agent at the next phase boundary and refuse to run again.
    /// Every goal on the stack gets its terminal learning update, bottom up.
    pub fn halt(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.cycle.halted {
            tracing::debug!(%reason, "already halted");
            return;
        }
        tracing::info!(%reason, "halting");
        self.cycle.halted = true;
        self.cycle.stopped = true;
        self.cycle.reason_for_stopping = Some(reason);

        let mut goal = self.decider.bottom_goal;
        while let Some(g) = goal {
            let level = self.symbols.level(g);
            self.learning.on_goal_update(g, level, 0.0, true);
            goal = self.symbols.higher_goal(g);
        }
    }

    /// Stop the current run at the next phase boundary.
    pub fn stop(&mut self) {
        if !self.cycle.stopped {
            self.cycle.stopped = true;
            self.cycle.reason_for_stopping = Some("Stopped by user.".to_string());
        }
    }

    pub(crate) fn interrupt(&mut self, production: &str) {
        tracing::info!(%production, "interrupt");
        self.cycle.stopped = true;
        self.cycle.reason_for_stopping =
            Some(format!("*** Interrupt from production {production} ***"));
    }

    pub fn is_halted(&self) -> bool {
        self.cycle.is_halted()
    }

    pub fn is_stopped(&self) -> bool {
        self.cycle.is_stopped()
    }

    /// Why the agent halted, if it has.
    pub fn halt_reason(&self) -> Option<&str> {
        if self.cycle.halted {
            self.cycle.reason_for_stopping()
        } else {
            None
        }
    }

    /// Why the last run stopped.
    pub fn stop_reason(&self) -> Option<&str> {
        self.cycle.reason_for_stopping()
    }

    pub fn current_phase(&self) -> Phase {
        self.cycle.current_phase
    }

    /// Counters for the whole life of the agent, working-memory ones included.
    pub fn stats(&self) -> CycleStats {
        let wm = self.wm.stats();
        CycleStats {
            wme_additions: wm.additions,
            wme_removals: wm.removals,
            max_wm_size: wm.max_size,
            ..self.cycle.stats
        }
    }

    /// Record a recoverable problem and keep going.
    pub(crate) fn record_diagnostic(
        &mut self,
        kind: DiagnosticKind,
        production: Option<&str>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        tracing::warn!(?kind, production = production.unwrap_or("-"), "{message}");
        self.diagnostics.push(Diagnostic {
            kind,
            production: production.map(str::to_string),
            message,
            decision_cycle: self.cycle.stats.decision_cycles,
        });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Run the agent. `n` counts units of `run_type` and is ignored for
    /// [`RunType::Forever`].
    pub fn run(&mut self, n: u64, run_type: RunType) -> KernelResult<RunOutcome> {
        if let Some(reason) = self.halt_reason() {
            tracing::warn!("System halted. Use reinitialize before running again.");
            return Err(CycleError::Halted {
                reason: reason.to_string(),
            }
            .into());
        }
        if n == 0 && run_type != RunType::Forever {
            return Err(CycleError::InvalidRun {
                message: format!("cannot run for 0 {run_type:?}"),
            }
            .into());
        }
        self.cycle.start_run();
        self.cycle.hit_max_elaborations = false;
        let decisions_at_start = self.cycle.stats.decision_cycles;
        tracing::debug!(n, ?run_type, phase = %self.cycle.current_phase, "run");

        match run_type {
            RunType::Phases => {
                for _ in 0..n {
                    if self.cycle.stopped {
                        break;
                    }
                    self.do_one_top_level_phase()?;
                }
            }
            RunType::Elaborations => {
                self.cycle.stop_after_elaboration = true;
                let result = self.run_for_n_elaboration_cycles(n);
                self.cycle.stop_after_elaboration = false;
                result?;
            }
            RunType::Decisions => self.run_for_n_decision_cycles(n)?,
            RunType::ModificationsOfOutput => {
                for _ in 0..n {
                    if self.cycle.stopped {
                        break;
                    }
                    self.run_for_one_modification_of_output()?;
                }
            }
            RunType::Forever => {
                while !self.cycle.stopped {
                    self.do_one_top_level_phase()?;
                }
            }
        }

        Ok(RunOutcome {
            phases: self.cycle.run_phase_count,
            elaborations: self.cycle.run_elaboration_count,
            decisions: self.cycle.stats.decision_cycles - decisions_at_start,
            stop_reason: self.cycle.reason_for_stopping.clone(),
            halted: self.cycle.halted,
        })
    }

    fn run_for_n_elaboration_cycles(&mut self, n: u64) -> KernelResult<()> {
        let mut elapsed = 0;
        while !self.cycle.stopped && elapsed < n {
            self.do_one_top_level_phase()?;
            elapsed += 1;
        }
        Ok(())
    }

    fn run_for_n_decision_cycles(&mut self, n: u64) -> KernelResult<()> {
        let stop_phase = self.config.stop_phase;
        let start = self.cycle.stats.decision_cycles;
        while !self.cycle.stopped && self.cycle.stats.decision_cycles - start < n {
            self.do_one_top_level_phase()?;
        }
        while !self.cycle.stopped && self.cycle.current_phase != stop_phase {
            self.do_one_top_level_phase()?;
        }
        Ok(())
    }

    /// Run until an output phase changes the output link, giving up after
    /// `max_nil_output_cycles` output phases without a change.
    fn run_for_one_modification_of_output(&mut self) -> KernelResult<()> {
        let mut nil_outputs = 0;
        while !self.cycle.stopped {
            let was_output_phase = self.cycle.current_phase == Phase::Output;
            self.do_one_top_level_phase()?;
            if was_output_phase {
                if self.io_state.output_link_changed {
                    break;
                }
                nil_outputs += 1;
            }
            if nil_outputs >= self.config.max_nil_output_cycles {
                break;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Execute whatever phase the cycle is in and advance.
    pub fn do_one_top_level_phase(&mut self) -> KernelResult<()> {
        if self.cycle.halted {
            return Err(CycleError::Halted {
                reason: self.cycle.reason_for_stopping.clone().unwrap_or_default(),
            }
            .into());
        }
        let phase = self.cycle.current_phase;
        let result = match (phase, self.config.cycle_mode) {
            (Phase::Input, _) => self.do_input_phase(),
            (Phase::Propose, _) => self.do_propose_phase(),
            (Phase::Decision, _) => self.do_decision_top_level_phase(),
            (Phase::Apply, _) => self.do_apply_phase(),
            (Phase::Output, _) => self.do_output_phase(),
            (Phase::Preference, CycleMode::Legacy) => self.do_legacy_preference_phase(),
            (Phase::WorkingMemory, CycleMode::Legacy) => self.do_legacy_working_memory_phase(),
            (Phase::Preference | Phase::WorkingMemory, CycleMode::Operand2) => {
                self.cycle.current_phase = Phase::Output;
                Ok(())
            }
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::error!(%phase, error = %e, "fatal kernel error");
                self.halt(format!("fatal error in {phase} phase: {e}"));
            }
        }
        result?;
        if self.cycle.stopped {
            if let Some(reason) = &self.cycle.reason_for_stopping {
                tracing::info!(%reason, "stopped");
            }
        }
        Ok(())
    }

    /// Whether this decision cycle used up its elaborations. If so, move on
    /// to `next`.
    pub(crate) fn check_for_max_elaborations(&mut self, next: Phase) -> bool {
        let max = self.config.max_elaborations;
        if self.cycle.e_cycles_this_d_cycle < max {
            return false;
        }
        self.cycle.hit_max_elaborations = true;
        self.record_diagnostic(
            DiagnosticKind::MaxElaborations,
            None,
            format!("reached max-elaborations({max}); proceeding to {next} phase"),
        );
        self.cycle.current_phase = next;
        true
    }

    fn after_phase(&mut self, phase: Phase) {
        self.cycle.run_phase_count += 1;
        tracing::debug!(%phase, "phase complete");
    }

    fn count_elaboration(&mut self) {
        self.cycle.stats.elaboration_cycles += 1;
        self.cycle.e_cycles_this_d_cycle += 1;
        self.cycle.run_elaboration_count += 1;
    }

    fn do_input_phase(&mut self) -> KernelResult<()> {
        tracing::debug!(cycle = self.cycle.stats.decision_cycles + 1, "input phase");
        if self.config.cycle_mode == CycleMode::Operand2 {
            self.cycle.e_cycles_this_d_cycle = 0;
        }
        self.do_input_cycle()?;
        self.cycle.run_elaboration_count += 1;
        self.after_phase(Phase::Input);

        self.cycle.current_phase = match self.config.cycle_mode {
            CycleMode::Operand2 => Phase::Propose,
            CycleMode::Legacy if self.any_assertions_or_retractions_ready() => Phase::Preference,
            CycleMode::Legacy => Phase::Decision,
        };
        Ok(())
    }

    fn do_propose_phase(&mut self) -> KernelResult<()> {
        if self.cycle.e_cycles_this_d_cycle < 1 {
            tracing::debug!("propose phase");
            self.initialize_consistency_calculations_for_new_decision();
            self.recmem.firing_type = FiringType::Ie;
            self.determine_highest_active_production_level_in_stack_propose()?;
            if self.cycle.current_phase == Phase::Decision {
                self.cycle.run_elaboration_count += 1;
            }
        }
        while self.cycle.current_phase != Phase::Decision {
            self.do_preference_phase()?;
            self.do_working_memory_phase()?;
            self.count_elaboration();
            self.determine_highest_active_production_level_in_stack_propose()?;
            if self.cycle.stop_after_elaboration {
                break;
            }
        }
        if self.cycle.current_phase == Phase::Decision {
            self.after_phase(Phase::Propose);
        }
        Ok(())
    }

    fn do_apply_phase(&mut self) -> KernelResult<()> {
        if self.cycle.e_cycles_this_d_cycle < 1 {
            tracing::debug!("apply phase");
            self.initialize_consistency_calculations_for_new_decision();
            self.recmem.firing_type = FiringType::Pe;
            self.determine_highest_active_production_level_in_stack_apply()?;
            if self.cycle.current_phase == Phase::Output {
                self.cycle.run_elaboration_count += 1;
            }
        }
        while self.cycle.current_phase != Phase::Output {
            self.do_preference_phase()?;
            self.do_working_memory_phase()?;
            self.count_elaboration();
            if self.recmem.firing_type == FiringType::Pe {
                self.cycle.stats.pe_cycles += 1;
                self.cycle.pe_cycles_this_d_cycle += 1;
            }
            self.determine_highest_active_production_level_in_stack_apply()?;
            if self.cycle.stop_after_elaboration {
                break;
            }
        }
        if self.cycle.current_phase == Phase::Output {
            self.after_phase(Phase::Apply);
        }
        Ok(())
    }

    fn do_decision_top_level_phase(&mut self) -> KernelResult<()> {
        tracing::debug!("decision phase");
        if self.config.cycle_mode == CycleMode::Legacy {
            self.cycle.stats.decision_cycles += 1;
        }
        self.cycle.stats.decision_phases += 1;
        self.do_decision_phase()?;
        self.cycle.run_elaboration_count += 1;
        self.after_phase(Phase::Decision);

        if let Some(bottom) = self.decider.bottom_goal {
            let operator = self
                .symbols
                .operator_slot(bottom)
                .and_then(|s| self.slots.get(s))
                .and_then(|s| s.wmes.first())
                .map(|&w| self.symbols.display(self.wm[w].value));
            tracing::debug!(
                goal = %self.symbols.display(bottom),
                operator = operator.as_deref().unwrap_or("-"),
                "lowest context"
            );
        }

        self.cycle.e_cycles_this_d_cycle = 0;
        self.cycle.pe_cycles_this_d_cycle = 0;
        match self.config.cycle_mode {
            CycleMode::Operand2 => {
                self.recmem.firing_type = FiringType::Pe;
                self.cycle.current_phase = Phase::Apply;
            }
            CycleMode::Legacy => self.cycle.current_phase = Phase::Input,
        }
        Ok(())
    }

    fn do_output_phase(&mut self) -> KernelResult<()> {
        tracing::debug!("output phase");
        let changed = self.do_output_cycle()?;
        self.cycle.run_last_output_count += 1;
        if changed || self.cycle.run_last_output_count >= self.config.max_nil_output_cycles {
            self.cycle.run_last_output_count = 0;
            self.cycle.stats.generated_output_count += 1;
        }
        self.cycle.run_elaboration_count += 1;
        self.after_phase(Phase::Output);

        match self.config.cycle_mode {
            CycleMode::Operand2 => {
                self.cycle.current_phase = Phase::Input;
                self.cycle.stats.decision_cycles += 1;
            }
            CycleMode::Legacy => {
                self.cycle.stats.elaboration_cycles += 1;
                self.cycle.e_cycles_this_d_cycle += 1;
                self.cycle.current_phase = Phase::Input;
                self.check_for_max_elaborations(Phase::Decision);
            }
        }
        Ok(())
    }

    fn do_legacy_preference_phase(&mut self) -> KernelResult<()> {
        tracing::debug!("preference phase");
        self.decider.active_goal = self.decider.top_goal;
        self.decider.active_level = crate::symbol::TOP_GOAL_LEVEL;
        self.do_preference_phase()?;
        self.cycle.run_elaboration_count += 1;
        self.after_phase(Phase::Preference);
        self.cycle.current_phase = Phase::WorkingMemory;
        Ok(())
    }

    fn do_legacy_working_memory_phase(&mut self) -> KernelResult<()> {
        tracing::debug!("working memory phase");
        self.do_working_memory_phase()?;
        self.cycle.run_elaboration_count += 1;
        self.after_phase(Phase::WorkingMemory);
        self.cycle.current_phase = Phase::Output;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::memory::PreferenceType;
    use crate::production::ProductionBuilder;
    use crate::symbol::{Level, SymbolId};

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn phases_follow_operand2_order() {
        let mut k = kernel();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(k.current_phase());
            k.run(1, RunType::Phases).unwrap();
        }
        assert_eq!(
            seen,
            vec![Phase::Input, Phase::Propose, Phase::Decision, Phase::Apply, Phase::Output]
        );
        assert_eq!(k.current_phase(), Phase::Input);
        assert_eq!(k.stats().decision_cycles, 1);
    }

    #[test]
    fn legacy_cycle_skips_to_decision_when_nothing_matches() {
        let mut k = Kernel::new(KernelConfig {
            cycle_mode: CycleMode::Legacy,
            ..KernelConfig::default()
        })
        .unwrap();
        k.run(1, RunType::Phases).unwrap();
        assert_eq!(k.current_phase(), Phase::Decision);
        k.run(1, RunType::Phases).unwrap();
        assert_eq!(k.current_phase(), Phase::Input);
        assert_eq!(k.stats().decision_cycles, 1);
    }

    #[test]
    fn halted_kernel_refuses_to_run() {
        let mut k = kernel();
        k.halt("done");
        let err = k.run(1, RunType::Decisions).unwrap_err();
        assert!(err.to_string().contains("done"));
        assert_eq!(k.halt_reason(), Some("done"));
    }

    #[derive(Default)]
    struct GoalUpdates(std::sync::Arc<std::sync::Mutex<Vec<(Level, f64, bool)>>>);

    impl crate::learning::LearningHooks for GoalUpdates {
        fn on_goal_update(&mut self, _goal: SymbolId, level: Level, reward: f64, terminal: bool) {
            self.0.lock().unwrap().push((level, reward, terminal));
        }
    }

    #[test]
    fn host_halt_gives_each_goal_a_terminal_update() {
        let mut k = kernel();
        let hooks = GoalUpdates::default();
        let updates = std::sync::Arc::clone(&hooks.0);
        k.set_learning_hooks(Box::new(hooks));
        for name in ["a", "b"] {
            k.add_production(
                ProductionBuilder::new(format!("propose*{name}"))
                    .state("<s>", "superstate", "nil")
                    .make("<s>", "operator", "<o>", PreferenceType::Acceptable)
                    .make("<o>", "name", name, PreferenceType::Acceptable),
            )
            .unwrap();
        }
        k.run(1, RunType::Decisions).unwrap();
        assert_eq!(k.goal_stack().len(), 2);
        updates.lock().unwrap().clear();

        k.halt("host stop");
        assert_eq!(*updates.lock().unwrap(), vec![(2, 0.0, true), (1, 0.0, true)]);
        k.halt("again");
        assert_eq!(updates.lock().unwrap().len(), 2);
        assert_eq!(k.halt_reason(), Some("host stop"));
    }

    #[test]
    fn zero_count_is_rejected() {
        let mut k = kernel();
        assert!(k.run(0, RunType::Phases).is_err());
    }

    #[test]
    fn stop_is_reported_once() {
        let mut k = kernel();
        k.stop();
        k.stop();
        assert_eq!(k.stop_reason(), Some("Stopped by user."));
        assert!(!k.is_halted());
    }

    #[test]
    fn interrupting_production_stops_the_run() {
        let mut k = kernel();
        k.add_production(
            ProductionBuilder::new("ready")
                .state("<s>", "superstate", "nil")
                .make("<s>", "ready", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        k.add_production(
            ProductionBuilder::new("alarm")
                .interrupt()
                .state("<s>", "ready", "yes")
                .make("<s>", "alarm", "on", PreferenceType::Acceptable),
        )
        .unwrap();
        let outcome = k.run(3, RunType::Decisions).unwrap();
        assert_eq!(
            outcome.stop_reason.as_deref(),
            Some("*** Interrupt from production alarm ***")
        );
        assert!(!outcome.halted);
    }

    #[test]
    fn runaway_elaboration_hits_max_elaborations() {
        let mut k = Kernel::new(KernelConfig {
            max_elaborations: 5,
            ..KernelConfig::default()
        })
        .unwrap();
        k.add_production(
            ProductionBuilder::new("grow")
                .state("<s>", "superstate", "nil")
                .cond("<x>", "chain", "<c>")
                .make("<c>", "chain", "<n>", PreferenceType::Acceptable),
        )
        .unwrap();
        k.add_production(
            ProductionBuilder::new("seed")
                .state("<s>", "superstate", "nil")
                .make("<s>", "chain", "<c>", PreferenceType::Acceptable),
        )
        .unwrap();
        k.run(1, RunType::Decisions).unwrap();
        assert!(k.cycle.hit_max_elaborations());
        assert!(k
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::MaxElaborations));
    }

    #[test]
    fn phase_names_round_trip_through_strings() {
        for phase in [Phase::Input, Phase::Apply, Phase::WorkingMemory] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
    }
}
