//! Symbol table for the akh-kernel.
//!
//! Every field of a working-memory triple is a [`SymbolId`]. Constants are
//! interned, so two requests for the same value return the same id.
//! Identifiers are generated fresh (`S1`, `O4`, ...) and carry the goal-stack
//! bookkeeping the decider needs in [`IdentifierInfo`]. Symbols are never
//! destroyed while the kernel lives.

use std::collections::HashMap;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::match_set::FiringType;
use crate::memory::{GdsId, MscId, PrefId, SlotId, WmeId};

/// Unique, niche-optimized identifier for a symbol.
///
/// Uses `NonZeroU64` so that `Option<SymbolId>` is the same size as `SymbolId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SymbolId(NonZeroU64);

impl SymbolId {
    /// Create a `SymbolId` from a raw `u64`.
    ///
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(SymbolId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }

    fn from_index(index: usize) -> Self {
        SymbolId(NonZeroU64::MIN.saturating_add(index as u64))
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sym:{}", self.0)
    }
}

/// Depth of a goal in the goal stack. The top state is at [`TOP_GOAL_LEVEL`];
/// larger numbers are deeper.
pub type Level = i32;

/// Level of the top state.
pub const TOP_GOAL_LEVEL: Level = 1;
/// Match-goal level given to instantiations that tested no goal.
pub const ATTRIBUTE_IMPASSE_LEVEL: Level = 32767;
/// Sentinel used while re-levelling identifiers during demotion.
pub const LOWEST_POSSIBLE_GOAL_LEVEL: Level = 1 << 30;

/// The value carried by a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolValue {
    /// A generated identifier such as `S1`.
    Identifier { letter: char, number: u64 },
    /// A symbolic or string constant.
    Str(String),
    /// An integer constant.
    Int(i64),
    /// A floating-point constant.
    Float(f64),
}

impl std::fmt::Display for SymbolValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolValue::Identifier { letter, number } => write!(f, "{letter}{number}"),
            SymbolValue::Str(s) => write!(f, "{s}"),
            SymbolValue::Int(i) => write!(f, "{i}"),
            SymbolValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Per-goal state attached to goal identifiers.
#[derive(Debug, Clone, Default)]
pub struct GoalInfo {
    pub higher_goal: Option<SymbolId>,
    pub lower_goal: Option<SymbolId>,
    /// The goal's `^operator` context slot.
    pub operator_slot: Option<SlotId>,
    /// Preferences whose instantiation has this goal as match goal.
    pub preferences_from_goal: Vec<PrefId>,
    /// Architecture-created WMEs: `^type`, `^superstate`, `^impasse`, `^item`, ...
    pub impasse_wmes: Vec<WmeId>,
    pub gds: Option<GdsId>,
    /// Firing type interrupted when activity moved to a higher goal.
    pub saved_firing_type: Option<FiringType>,
    pub ms_o_assertions: Vec<MscId>,
    pub ms_i_assertions: Vec<MscId>,
    pub ms_retractions: Vec<MscId>,
}

/// Bookkeeping carried by identifier symbols.
#[derive(Debug, Clone)]
pub struct IdentifierInfo {
    pub level: Level,
    pub promotion_level: Level,
    /// Number of links (WMEs, preferences, the special goal link) pointing here.
    pub link_count: u32,
    pub could_be_a_link_from_below: bool,
    /// Number of `^operator` WMEs whose value is this identifier.
    pub isa_operator: u32,
    /// Set while the identifier sits on the unknown-level list.
    pub unknown_level: bool,
    pub slots: Vec<SlotId>,
    pub input_wmes: Vec<WmeId>,
    pub goal: Option<Box<GoalInfo>>,
}

impl IdentifierInfo {
    fn new(level: Level) -> Self {
        Self {
            level,
            promotion_level: level,
            link_count: 0,
            could_be_a_link_from_below: false,
            isa_operator: 0,
            unknown_level: false,
            slots: Vec::new(),
            input_wmes: Vec::new(),
            goal: None,
        }
    }

    pub fn is_goal(&self) -> bool {
        self.goal.is_some()
    }
}

/// A symbol record.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub value: SymbolValue,
    pub ident: Option<IdentifierInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Str(String),
    Int(i64),
    Float(u64),
}

/// Interning symbol table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    constants: HashMap<ConstantKey, SymbolId>,
    id_counters: HashMap<char, u64>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId::from_index(self.symbols.len());
        self.symbols.push(symbol);
        id
    }

    fn intern(&mut self, key: ConstantKey, value: SymbolValue) -> SymbolId {
        if let Some(&id) = self.constants.get(&key) {
            return id;
        }
        let id = self.push(Symbol { value, ident: None });
        self.constants.insert(key, id);
        id
    }

    /// Intern a symbolic constant.
    pub fn intern_str(&mut self, s: &str) -> SymbolId {
        self.intern(ConstantKey::Str(s.to_string()), SymbolValue::Str(s.to_string()))
    }

    pub fn intern_int(&mut self, v: i64) -> SymbolId {
        self.intern(ConstantKey::Int(v), SymbolValue::Int(v))
    }

    pub fn intern_float(&mut self, v: f64) -> SymbolId {
        self.intern(ConstantKey::Float(v.to_bits()), SymbolValue::Float(v))
    }

    /// Look up an already-interned symbolic constant.
    pub fn find_str(&self, s: &str) -> Option<SymbolId> {
        self.constants.get(&ConstantKey::Str(s.to_string())).copied()
    }

    /// Generate a fresh identifier at the given goal-stack level.
    pub fn new_identifier(&mut self, letter: char, level: Level) -> SymbolId {
        let letter = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            'I'
        };
        let counter = self.id_counters.entry(letter).or_insert(0);
        *counter += 1;
        let number = *counter;
        self.push(Symbol {
            value: SymbolValue::Identifier { letter, number },
            ident: Some(IdentifierInfo::new(level)),
        })
    }

    /// Restart identifier numbering, used when the kernel is reinitialized.
    pub fn reset_identifier_counters(&mut self) {
        self.id_counters.clear();
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.index())
    }

    pub fn value(&self, id: SymbolId) -> Option<&SymbolValue> {
        self.get(id).map(|s| &s.value)
    }

    pub fn is_identifier(&self, id: SymbolId) -> bool {
        self.ident(id).is_some()
    }

    pub fn ident(&self, id: SymbolId) -> Option<&IdentifierInfo> {
        self.symbols.get(id.index()).and_then(|s| s.ident.as_ref())
    }

    pub fn ident_mut(&mut self, id: SymbolId) -> Option<&mut IdentifierInfo> {
        self.symbols.get_mut(id.index()).and_then(|s| s.ident.as_mut())
    }

    pub fn goal(&self, id: SymbolId) -> Option<&GoalInfo> {
        self.ident(id).and_then(|i| i.goal.as_deref())
    }

    pub fn goal_mut(&mut self, id: SymbolId) -> Option<&mut GoalInfo> {
        self.ident_mut(id).and_then(|i| i.goal.as_deref_mut())
    }

    pub fn is_goal(&self, id: SymbolId) -> bool {
        self.ident(id).is_some_and(IdentifierInfo::is_goal)
    }

    /// Goal-stack level of an identifier; 0 for constants.
    pub fn level(&self, id: SymbolId) -> Level {
        self.ident(id).map_or(0, |i| i.level)
    }

    pub fn lower_goal(&self, goal: SymbolId) -> Option<SymbolId> {
        self.goal(goal).and_then(|g| g.lower_goal)
    }

    pub fn higher_goal(&self, goal: SymbolId) -> Option<SymbolId> {
        self.goal(goal).and_then(|g| g.higher_goal)
    }

    pub fn operator_slot(&self, goal: SymbolId) -> Option<SlotId> {
        self.goal(goal).and_then(|g| g.operator_slot)
    }

    /// Numeric value of an integer or float constant.
    pub fn as_f64(&self, id: SymbolId) -> Option<f64> {
        match self.value(id)? {
            SymbolValue::Int(i) => Some(*i as f64),
            SymbolValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self, id: SymbolId) -> Option<i64> {
        match self.value(id)? {
            SymbolValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self, id: SymbolId) -> Option<&str> {
        match self.value(id)? {
            SymbolValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self, id: SymbolId) -> bool {
        self.as_f64(id).is_some()
    }

    /// Letter to use for identifiers generated from this symbol.
    pub fn first_letter(&self, id: SymbolId) -> char {
        match self.value(id) {
            Some(SymbolValue::Identifier { letter, .. }) => *letter,
            Some(SymbolValue::Str(s)) => s
                .chars()
                .find(|c| c.is_ascii_alphabetic())
                .map_or('I', |c| c.to_ascii_uppercase()),
            _ => 'I',
        }
    }

    /// Render a symbol for traces and diagnostics.
    pub fn display(&self, id: SymbolId) -> String {
        self.value(id)
            .map_or_else(|| id.to_string(), |v| v.to_string())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl std::ops::Index<SymbolId> for SymbolTable {
    type Output = Symbol;

    fn index(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }
}

/// Symbols the architecture itself reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct Predefined {
    pub operator: SymbolId,
    pub state: SymbolId,
    pub superstate: SymbolId,
    pub nil: SymbolId,
    pub type_: SymbolId,
    pub impasse: SymbolId,
    pub attribute: SymbolId,
    pub choices: SymbolId,
    pub none: SymbolId,
    pub multiple: SymbolId,
    pub tie: SymbolId,
    pub conflict: SymbolId,
    pub constraint_failure: SymbolId,
    pub no_change: SymbolId,
    pub item: SymbolId,
    pub item_count: SymbolId,
    pub quiescence: SymbolId,
    pub t: SymbolId,
    pub io: SymbolId,
    pub input_link: SymbolId,
    pub output_link: SymbolId,
}

impl Predefined {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        Self {
            operator: symbols.intern_str("operator"),
            state: symbols.intern_str("state"),
            superstate: symbols.intern_str("superstate"),
            nil: symbols.intern_str("nil"),
            type_: symbols.intern_str("type"),
            impasse: symbols.intern_str("impasse"),
            attribute: symbols.intern_str("attribute"),
            choices: symbols.intern_str("choices"),
            none: symbols.intern_str("none"),
            multiple: symbols.intern_str("multiple"),
            tie: symbols.intern_str("tie"),
            conflict: symbols.intern_str("conflict"),
            constraint_failure: symbols.intern_str("constraint-failure"),
            no_change: symbols.intern_str("no-change"),
            item: symbols.intern_str("item"),
            item_count: symbols.intern_str("item-count"),
            quiescence: symbols.intern_str("quiescence"),
            t: symbols.intern_str("t"),
            io: symbols.intern_str("io"),
            input_link: symbols.intern_str("input-link"),
            output_link: symbols.intern_str("output-link"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_id_niche_optimization() {
        assert_eq!(
            std::mem::size_of::<Option<SymbolId>>(),
            std::mem::size_of::<SymbolId>()
        );
    }

    #[test]
    fn constants_are_interned() {
        let mut table = SymbolTable::new();
        let a = table.intern_str("foo");
        let b = table.intern_str("foo");
        let c = table.intern_str("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.intern_int(3), table.intern_int(3));
        assert_ne!(table.intern_int(3), table.intern_float(3.0));
        assert_eq!(table.find_str("bar"), Some(c));
        assert_eq!(table.find_str("baz"), None);
    }

    #[test]
    fn identifiers_are_fresh_and_numbered_per_letter() {
        let mut table = SymbolTable::new();
        let s1 = table.new_identifier('s', TOP_GOAL_LEVEL);
        let s2 = table.new_identifier('S', 2);
        let o1 = table.new_identifier('o', 2);
        assert_eq!(table.display(s1), "S1");
        assert_eq!(table.display(s2), "S2");
        assert_eq!(table.display(o1), "O1");
        assert_eq!(table.level(s2), 2);
        assert!(table.is_identifier(o1));
        assert!(!table.is_goal(o1));
    }

    #[test]
    fn constants_have_no_level() {
        let mut table = SymbolTable::new();
        let n = table.intern_int(7);
        assert_eq!(table.level(n), 0);
        assert!(table.ident(n).is_none());
        assert_eq!(table.as_f64(n), Some(7.0));
        assert!(table.is_numeric(n));
    }

    #[test]
    fn first_letter_for_generated_ids() {
        let mut table = SymbolTable::new();
        let name = table.intern_str("block");
        let num = table.intern_int(4);
        assert_eq!(table.first_letter(name), 'B');
        assert_eq!(table.first_letter(num), 'I');
    }

    #[test]
    fn predefined_symbols_resolve() {
        let mut table = SymbolTable::new();
        let p = Predefined::new(&mut table);
        assert_eq!(table.find_str("operator"), Some(p.operator));
        assert_eq!(table.as_str(p.constraint_failure), Some("constraint-failure"));
    }

    #[test]
    fn reset_restarts_numbering() {
        let mut table = SymbolTable::new();
        table.new_identifier('S', 1);
        table.reset_identifier_counters();
        let again = table.new_identifier('S', 1);
        assert_eq!(table.display(again), "S1");
    }
}
