//! Rich diagnostic error types for the akh-kernel.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Errors returned through `Err` are the
//! unrecoverable ones: a kernel that hits one halts, since continuing would
//! corrupt shared state. Recoverable problems (RHS failures, malformed
//! preference requests) are logged and recorded as [`crate::cycle::Diagnostic`]s
//! instead.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the kernel.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Production(#[from] ProductionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rhs(#[from] RhsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Decider(#[from] DeciderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Whether this error leaves the kernel in a state that must not be run again
    /// without reinitialization.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::Memory(_) | KernelError::Decider(_))
    }
}

// ---------------------------------------------------------------------------
// Symbol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SymbolError {
    #[error("symbol {symbol} is not an identifier")]
    #[diagnostic(
        code(akh::symbol::not_identifier),
        help(
            "Only identifiers can carry attributes. Use `Kernel::new_identifier()` \
             or the id of an existing state to build working-memory triples."
        )
    )]
    NotAnIdentifier { symbol: String },

    #[error("unknown symbol id {raw}")]
    #[diagnostic(
        code(akh::symbol::unknown),
        help("The id was not produced by this kernel's symbol table.")
    )]
    Unknown { raw: u64 },

    #[error("symbol table exhausted: identifier counter overflowed for letter '{letter}'")]
    #[diagnostic(
        code(akh::symbol::exhausted),
        help("Reinitialize the kernel to reset identifier counters.")
    )]
    Exhausted { letter: char },
}

// ---------------------------------------------------------------------------
// Memory errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    #[error("stale {kind} handle {index}")]
    #[diagnostic(
        code(akh::memory::stale_handle),
        help(
            "A record was released while another structure still referred to it. \
             This is a reference-counting bug inside the kernel."
        )
    )]
    StaleHandle { kind: &'static str, index: u32 },

    #[error("reference count underflow on preference {preference}")]
    #[diagnostic(
        code(akh::memory::refcount_underflow),
        help(
            "A preference was released more times than it was acquired. \
             The agent has been halted; reinitialize it before running again."
        )
    )]
    RefcountUnderflow { preference: String },

    #[error("no clone of preference {preference} exists at level {level}")]
    #[diagnostic(
        code(akh::memory::missing_clone),
        help(
            "Backtracing expected a preference copy at the match-goal level of \
             instantiation of '{production}'. The goal stack and clone chains disagree."
        )
    )]
    MissingClone {
        preference: String,
        level: i32,
        production: String,
    },
}

// ---------------------------------------------------------------------------
// Production errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ProductionError {
    #[error("production name must not be empty")]
    #[diagnostic(
        code(akh::production::empty_name),
        help("Give every production a unique, non-empty name.")
    )]
    EmptyName,

    #[error("production '{name}' already exists")]
    #[diagnostic(
        code(akh::production::duplicate),
        help("Excise the existing production first, or pick a different name.")
    )]
    Duplicate { name: String },

    #[error("production '{name}' has no positive conditions")]
    #[diagnostic(
        code(akh::production::no_conditions),
        help("Add at least one positive condition, e.g. `.state(\"<s>\", \"superstate\", \"nil\")`.")
    )]
    NoConditions { name: String },

    #[error("production '{name}' does not test a state")]
    #[diagnostic(
        code(akh::production::no_state_test),
        help(
            "Every production must match a goal: use `.state(...)` for at least one \
             positive condition so its instantiations have a match goal."
        )
    )]
    NoStateTest { name: String },

    #[error("production '{name}' not found")]
    #[diagnostic(
        code(akh::production::not_found),
        help("Check the name passed to `excise_production` or `production()`.")
    )]
    NotFound { name: String },
}

// ---------------------------------------------------------------------------
// RHS errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RhsError {
    #[error("unknown RHS function '{name}'")]
    #[diagnostic(
        code(akh::rhs::unknown_function),
        help("Register the function with `Kernel::register_rhs_function` before running.")
    )]
    UnknownFunction { name: String },

    #[error("RHS function '{name}' failed: {message}")]
    #[diagnostic(
        code(akh::rhs::function_failed),
        help("The action depending on this call contributes no preference; other actions still run.")
    )]
    FunctionFailed { name: String, message: String },

    #[error("RHS function '{name}' expects {expected} argument(s), got {actual}")]
    #[diagnostic(
        code(akh::rhs::arity),
        help("Fix the call in the production's action list.")
    )]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("malformed preference in '{production}': {message}")]
    #[diagnostic(
        code(akh::rhs::malformed_preference),
        help(
            "Binary preferences (=, >, <) need a referent, unary ones must not have one, \
             and only `+`/`-` may be used for non-operator attributes."
        )
    )]
    MalformedPreference { production: String, message: String },
}

// ---------------------------------------------------------------------------
// Decider errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DeciderError {
    #[error("internal error: tried to promote goal or impasse identifier {id}")]
    #[diagnostic(
        code(akh::decider::goal_promotion),
        help(
            "Goal identifiers never change level. A link to a goal was recorded \
             where none should exist; the agent has been halted."
        )
    )]
    GoalPromotion { id: String },

    #[error("internal error: more than one winner for context slot ({id} ^{attr})")]
    #[diagnostic(
        code(akh::decider::multiple_winners),
        help("The decision procedure must yield exactly one operator or an impasse.")
    )]
    MultipleWinners { id: String, attr: String },

    #[error("internal error: GDS requested for a WME at level {wme_level} by an instantiation at level {inst_level}")]
    #[diagnostic(
        code(akh::decider::gds_level),
        help("A goal dependency set can only be created at the match goal's own level.")
    )]
    GdsLevelMismatch { wme_level: i32, inst_level: i32 },

    #[error("internal error: goal {goal} has no impasse type")]
    #[diagnostic(
        code(akh::decider::impasse_type),
        help("Every subgoal carries an ^impasse WME; the goal stack is corrupt.")
    )]
    MissingImpasseType { goal: String },

    #[error("internal error: no acceptable-preference WME backs impasse item {preference}")]
    #[diagnostic(
        code(akh::decider::missing_acceptable_wme),
        help(
            "Acceptable-preference WMEs are refreshed before every decision; \
             an impasse candidate without one means that refresh was skipped."
        )
    )]
    MissingAcceptableWme { preference: String },
}

// ---------------------------------------------------------------------------
// Cycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CycleError {
    #[error("System halted. Use reinitialize before running again. ({reason})")]
    #[diagnostic(
        code(akh::cycle::halted),
        help("Call `Kernel::reinitialize()` before running the agent again.")
    )]
    Halted { reason: String },

    #[error("invalid run request: {message}")]
    #[diagnostic(
        code(akh::cycle::invalid_run),
        help("Run counts must be positive.")
    )]
    InvalidRun { message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid kernel configuration: {message}")]
    #[diagnostic(
        code(akh::config::invalid),
        help("Check the documented defaults on `KernelConfig`.")
    )]
    Invalid { message: String },

    #[error("failed to read configuration file {path}")]
    #[diagnostic(
        code(akh::config::io),
        help("Ensure the file exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {message}")]
    #[diagnostic(
        code(akh::config::parse),
        help("The configuration must be TOML with the keys documented on `KernelConfig`.")
    )]
    Parse { message: String },
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = std::result::Result<T, KernelError>;
