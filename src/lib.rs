// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # akh-kernel
//!
//! The execution kernel of a production-rule cognitive architecture: match
//! productions against working memory, fire them into preferences, resolve
//! preferences into working-memory changes and operator selections, and
//! retract what no longer holds.
//!
//! ## Architecture
//!
//! - **Symbols** (`symbol`): interned constants and leveled identifiers
//! - **Memory** (`memory`): WMEs, preferences, slots and instantiations in
//!   generational arenas with explicit reference counts
//! - **Match** (`matcher`, `match_set`): the match feed and the pending
//!   assertions and retractions it produces
//! - **Recognition memory** (`recmem`, `osupport`, `rhs`, `justification`):
//!   firing, support calculation, right-hand-side functions, and the
//!   justifications that keep substate results alive
//! - **Decider** (`decider`, `exploration`): preference semantics, the goal
//!   stack, impasses, goal dependency sets
//! - **Cycle** (`cycle`, `consistency`): the phase state machine
//!
//! ## Library usage
//!
//! ```
//! use akh_kernel::cycle::RunType;
//! use akh_kernel::kernel::{Kernel, KernelConfig};
//! use akh_kernel::memory::PreferenceType;
//! use akh_kernel::production::ProductionBuilder;
//!
//! let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
//! kernel
//!     .add_production(
//!         ProductionBuilder::new("elaborate*foo")
//!             .state("<s>", "superstate", "nil")
//!             .make("<s>", "foo", 1, PreferenceType::Acceptable),
//!     )
//!     .unwrap();
//! kernel.run(1, RunType::Decisions).unwrap();
//! let top = kernel.top_goal().unwrap();
//! assert_eq!(kernel.attribute_values(top, "foo").len(), 1);
//! ```

pub mod consistency;
pub mod cycle;
pub mod decider;
pub mod demo;
pub mod error;
pub mod exploration;
pub mod io;
pub mod justification;
pub mod kernel;
pub mod learning;
pub mod match_set;
pub mod matcher;
pub mod memory;
pub mod osupport;
pub mod production;
pub mod recmem;
pub mod rhs;
pub mod symbol;

pub use cycle::{Phase, RunOutcome, RunType};
pub use error::{KernelError, KernelResult};
pub use kernel::{CycleMode, Kernel, KernelConfig};
pub use memory::PreferenceType;
pub use production::{ProductionBuilder, Term};
