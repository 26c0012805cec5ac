//! Kernel memory: WMEs, preferences, slots, and instantiations.
//!
//! All records live in generational arenas owned by the [`crate::kernel::Kernel`]
//! and refer to each other through typed handles. Lifetimes are managed by
//! explicit reference counts; the release operations in [`lifecycle`] cascade
//! from preference to instantiation to production.

pub mod arena;
pub mod instantiation;
pub mod lifecycle;
pub mod preference;
pub mod slot;
pub mod wme;

pub use arena::{Arena, ArenaKey, GdsId, InstId, MscId, PrefId, ProdId, SlotId, WmeId};
pub use instantiation::{BacktraceInfo, InstCondition, Instantiation};
pub use lifecycle::TemporaryMemory;
pub use preference::{Preference, PreferenceType};
pub use slot::{ImpasseType, Slot};
pub use wme::{WmStats, Wme, WmeFacts, WorkingMemory};
