//! Kernel facade: owns every subsystem and exposes the public API.
//!
//! A [`Kernel`] holds symbols, working memory, preference memory, the
//! production table with its match feed, the decider's goal stack, and the
//! decision-cycle state. All of them live in arenas owned here and refer to
//! each other through typed handles.

use std::fmt;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::cycle::{CycleState, Diagnostic, Phase};
use crate::decider::{DeciderState, Gds};
use crate::error::{ConfigError, KernelResult, RhsError};
use crate::exploration::ExplorationPolicy;
use crate::io::{IoHooks, IoState, NoIo};
use crate::learning::{LearningHooks, NoLearning};
use crate::match_set::MatchSet;
use crate::matcher::{MatchFeed, NaiveMatcher};
use crate::memory::{
    Arena, GdsId, InstId, Instantiation, PrefId, Preference, Slot, SlotId, TemporaryMemory, Wme,
    WmeFacts, WorkingMemory,
};
use crate::production::ProductionTable;
use crate::recmem::RecMemState;
use crate::rhs::{RhsContext, RhsFunctions};
use crate::symbol::{Level, Predefined, SymbolId, SymbolTable, TOP_GOAL_LEVEL};

/// Which decision-cycle structure the kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleMode {
    /// Separate proposal and application phases with o/i-support split
    /// by firing type.
    #[default]
    Operand2,
    /// Preference and working-memory phases repeated until quiescence.
    Legacy,
}

impl std::str::FromStr for CycleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operand2" => Ok(Self::Operand2),
            "legacy" => Ok(Self::Legacy),
            other => Err(format!("unknown cycle mode '{other}'")),
        }
    }
}

/// Configuration for the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub cycle_mode: CycleMode,
    /// Elaboration cycles allowed per decision (default: 100).
    pub max_elaborations: u64,
    /// Output phases without output change before a run-until-output
    /// gives up (default: 15).
    pub max_nil_output_cycles: u64,
    /// Deepest goal level before a no-change impasse halts (default: 100).
    pub max_goal_depth: Level,
    /// Phase at which decision-count runs stop (default: input).
    pub stop_phase: Phase,
    pub exploration: ExplorationPolicy,
    /// Seed for exploration. Drawn from entropy when absent.
    pub seed: Option<u64>,
    /// Do not create substates for state no-change impasses.
    pub wait_on_state_no_change: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cycle_mode: CycleMode::Operand2,
            max_elaborations: 100,
            max_nil_output_cycles: 15,
            max_goal_depth: 100,
            stop_phase: Phase::Input,
            exploration: ExplorationPolicy::First,
            seed: None,
            wait_on_state_no_change: false,
        }
    }
}

impl KernelConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        if self.max_elaborations == 0 {
            return invalid("max_elaborations must be > 0".into());
        }
        if self.max_nil_output_cycles == 0 {
            return invalid("max_nil_output_cycles must be > 0".into());
        }
        if self.max_goal_depth < TOP_GOAL_LEVEL {
            return invalid(format!("max_goal_depth must be >= {TOP_GOAL_LEVEL}"));
        }
        let phase_ok = match self.cycle_mode {
            CycleMode::Operand2 => {
                !matches!(self.stop_phase, Phase::Preference | Phase::WorkingMemory)
            }
            CycleMode::Legacy => !matches!(self.stop_phase, Phase::Propose | Phase::Apply),
        };
        if !phase_ok {
            return invalid(format!(
                "stop_phase {} does not exist in {:?} mode",
                self.stop_phase, self.cycle_mode
            ));
        }
        Ok(())
    }
}

/// A production-system agent.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) symbols: SymbolTable,
    pub(crate) predefined: Predefined,
    pub(crate) wm: WorkingMemory,
    pub(crate) prefs: Arena<PrefId, Preference>,
    pub(crate) slots: Arena<SlotId, Slot>,
    pub(crate) insts: Arena<InstId, Instantiation>,
    pub(crate) gds: Arena<GdsId, Gds>,
    pub(crate) productions: ProductionTable,
    pub(crate) matcher: Box<dyn MatchFeed>,
    pub(crate) match_set: MatchSet,
    pub(crate) decider: DeciderState,
    pub(crate) tempmem: TemporaryMemory,
    pub(crate) recmem: RecMemState,
    pub(crate) cycle: CycleState,
    pub(crate) io: Box<dyn IoHooks>,
    pub(crate) io_state: IoState,
    pub(crate) learning: Box<dyn LearningHooks>,
    pub(crate) rhs_functions: RhsFunctions,
    pub(crate) rng: StdRng,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("symbols", &self.symbols.len())
            .field("wmes", &self.wm.len())
            .field("preferences", &self.prefs.len())
            .field("productions", &self.productions.len())
            .field("phase", &self.cycle.current_phase)
            .field("halted", &self.cycle.is_halted())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Create a kernel with the given configuration and build its top state.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        tracing::info!(
            mode = ?config.cycle_mode,
            max_elaborations = config.max_elaborations,
            exploration = ?config.exploration,
            "initializing kernel"
        );

        let mut symbols = SymbolTable::new();
        let predefined = Predefined::new(&mut symbols);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut kernel = Self {
            config,
            symbols,
            predefined,
            wm: WorkingMemory::new(),
            prefs: Arena::new(),
            slots: Arena::new(),
            insts: Arena::new(),
            gds: Arena::new(),
            productions: ProductionTable::new(),
            matcher: Box::new(NaiveMatcher::new()),
            match_set: MatchSet::new(),
            decider: DeciderState::default(),
            tempmem: TemporaryMemory::default(),
            recmem: RecMemState::default(),
            cycle: CycleState::default(),
            io: Box::new(NoIo),
            io_state: IoState::default(),
            learning: Box::new(NoLearning),
            rhs_functions: RhsFunctions::with_builtins(),
            rng,
            diagnostics: Vec::new(),
        };
        kernel.create_top_goal()?;
        Ok(kernel)
    }

    /// Replace the match feed. Must happen before any production is loaded.
    pub fn with_matcher(mut self, matcher: Box<dyn MatchFeed>) -> Self {
        self.matcher = matcher;
        for (w, wme) in self.wm.iter() {
            self.matcher.add_wme(w, wme.facts());
        }
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn set_io_hooks(&mut self, hooks: Box<dyn IoHooks>) {
        self.io = hooks;
    }

    pub fn set_learning_hooks(&mut self, hooks: Box<dyn LearningHooks>) {
        self.learning = hooks;
    }

    /// Make a right-hand-side function available to productions loaded
    /// afterwards. Replaces a function of the same name.
    pub fn register_rhs_function<F>(
        &mut self,
        name: impl Into<String>,
        min_args: usize,
        max_args: Option<usize>,
        f: F,
    ) where
        F: Fn(&mut RhsContext<'_>, &[SymbolId]) -> Result<Option<SymbolId>, RhsError>
            + Send
            + Sync
            + 'static,
    {
        self.rhs_functions.register(name, min_args, max_args, f);
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn predefined(&self) -> &Predefined {
        &self.predefined
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.wm
    }

    pub fn productions(&self) -> &ProductionTable {
        &self.productions
    }

    pub fn preference(&self, p: PrefId) -> Option<&Preference> {
        self.prefs.get(p)
    }

    pub fn instantiation(&self, i: InstId) -> Option<&Instantiation> {
        self.insts.get(i)
    }

    pub fn top_goal(&self) -> Option<SymbolId> {
        self.decider.top_goal
    }

    pub fn input_link(&self) -> Option<SymbolId> {
        self.io_state.input_link
    }

    pub fn output_link(&self) -> Option<SymbolId> {
        self.io_state.output_link
    }

    /// WMEs in working memory whose identifier is `id`.
    pub fn wmes_of(&self, id: SymbolId) -> impl Iterator<Item = &Wme> + '_ {
        self.wm.iter().map(|(_, w)| w).filter(move |w| w.id == id)
    }

    /// Values of the non-acceptable `(id ^attr *)` WMEs.
    pub fn attribute_values(&self, id: SymbolId, attr: &str) -> Vec<SymbolId> {
        let Some(attr) = self.symbols.find_str(attr) else {
            return Vec::new();
        };
        self.wmes_of(id)
            .filter(|w| w.attr == attr && !w.acceptable)
            .map(|w| w.value)
            .collect()
    }

    /// The selected operator of `goal`, if any.
    pub fn selected_operator(&self, goal: SymbolId) -> Option<SymbolId> {
        self.attribute_values(goal, "operator").into_iter().next()
    }

    /// Hand the buffered working-memory changes to the match feed and pull
    /// the resulting match-set changes.
    pub(crate) fn do_buffered_wm_changes(&mut self) -> KernelResult<()> {
        let (adds, removes) = self.wm.take_buffers();
        if adds.is_empty() && removes.is_empty() {
            return Ok(());
        }

        let mut added: Vec<WmeFacts> = Vec::with_capacity(adds.len());
        for &w in &adds {
            let Some(wme) = self.wm.get(w) else {
                continue;
            };
            if wme.in_wm {
                let facts = wme.facts();
                self.matcher.add_wme(w, facts);
                added.push(facts);
            }
        }

        let mut removed: Vec<WmeFacts> = Vec::with_capacity(removes.len());
        for &w in &removes {
            let Some(wme) = self.wm.get_mut(w) else {
                continue;
            };
            wme.buffered_removal = false;
            let facts = wme.facts();
            self.matcher.remove_wme(w);
            if !adds.contains(&w) {
                removed.push(facts);
            }
        }

        tracing::trace!(added = added.len(), removed = removed.len(), "committing wm changes");
        self.wm.record_commit(added.len(), removed.len());
        self.io_state.record_commit(added, removed);
        self.process_match_events();

        for w in removes {
            self.wm.possibly_free(w);
        }
        Ok(())
    }

    /// Throw away all run state, keep productions, functions and hooks, and
    /// build a fresh top state.
    pub fn reinitialize(&mut self) -> KernelResult<()> {
        tracing::info!("reinitializing kernel");
        // Tear down what can be torn down properly; a halted or broken kernel
        // may fail here and is cleared by force below.
        if let Err(e) = self.clear_goal_stack() {
            tracing::warn!(error = %e, "goal stack teardown failed; clearing by force");
        }

        self.matcher.clear_wmes();
        self.match_set.clear();
        self.wm.clear();
        self.prefs.clear();
        self.insts.clear();
        self.slots.clear();
        self.gds.clear();
        self.excise_justifications();
        self.productions.reset_run_state();
        self.decider.clear();
        self.tempmem.clear();
        self.recmem.clear();
        self.io_state.clear();
        self.cycle.reset();
        self.diagnostics.clear();
        self.symbols.reset_identifier_counters();

        self.create_top_goal()
    }
}
