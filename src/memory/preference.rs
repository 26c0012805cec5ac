//! Preferences: typed claims about the value of an (identifier, attribute) slot.

use serde::{Deserialize, Serialize};

use super::arena::{InstId, PrefId, SlotId};
use crate::symbol::SymbolId;

/// The kind of claim a preference makes.
///
/// Unary types constrain a single value; binary types relate the value to a
/// second `referent` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PreferenceType {
    Acceptable,
    Require,
    Reject,
    Prohibit,
    Reconsider,
    UnaryIndifferent,
    Best,
    Worst,
    BinaryIndifferent,
    Better,
    Worse,
    NumericIndifferent,
}

impl PreferenceType {
    /// Number of preference types; the length of a slot's per-type table.
    pub const COUNT: usize = 12;

    pub const ALL: [PreferenceType; Self::COUNT] = [
        PreferenceType::Acceptable,
        PreferenceType::Require,
        PreferenceType::Reject,
        PreferenceType::Prohibit,
        PreferenceType::Reconsider,
        PreferenceType::UnaryIndifferent,
        PreferenceType::Best,
        PreferenceType::Worst,
        PreferenceType::BinaryIndifferent,
        PreferenceType::Better,
        PreferenceType::Worse,
        PreferenceType::NumericIndifferent,
    ];

    /// Whether this type carries a referent.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PreferenceType::BinaryIndifferent
                | PreferenceType::Better
                | PreferenceType::Worse
                | PreferenceType::NumericIndifferent
        )
    }

    pub fn is_unary(self) -> bool {
        !self.is_binary()
    }

    /// Position of this type in a slot's per-type table.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The preference-language symbol for this type.
    pub fn symbol(self) -> &'static str {
        match self {
            PreferenceType::Acceptable => "+",
            PreferenceType::Require => "!",
            PreferenceType::Reject => "-",
            PreferenceType::Prohibit => "~",
            PreferenceType::Reconsider => "@",
            PreferenceType::UnaryIndifferent => "=",
            PreferenceType::Best => ">",
            PreferenceType::Worst => "<",
            PreferenceType::BinaryIndifferent => "=",
            PreferenceType::Better => ">",
            PreferenceType::Worse => "<",
            PreferenceType::NumericIndifferent => "=",
        }
    }
}

impl std::fmt::Display for PreferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PreferenceType::Acceptable => "acceptable",
            PreferenceType::Require => "require",
            PreferenceType::Reject => "reject",
            PreferenceType::Prohibit => "prohibit",
            PreferenceType::Reconsider => "reconsider",
            PreferenceType::UnaryIndifferent => "unary-indifferent",
            PreferenceType::Best => "best",
            PreferenceType::Worst => "worst",
            PreferenceType::BinaryIndifferent => "binary-indifferent",
            PreferenceType::Better => "better",
            PreferenceType::Worse => "worse",
            PreferenceType::NumericIndifferent => "numeric-indifferent",
        };
        f.write_str(name)
    }
}

/// A preference record.
///
/// A preference is in temporary memory exactly when `slot` is `Some`.
/// Clones are copies of a result made at shallower goal levels by the
/// learning collaborator; they are linked through `next_clone`/`prev_clone`.
#[derive(Debug, Clone)]
pub struct Preference {
    pub pref_type: PreferenceType,
    pub id: SymbolId,
    pub attr: SymbolId,
    pub value: SymbolId,
    pub referent: Option<SymbolId>,
    pub o_supported: bool,
    pub on_goal_list: bool,
    pub reference_count: u32,
    pub inst: Option<InstId>,
    pub slot: Option<SlotId>,
    pub next_clone: Option<PrefId>,
    pub prev_clone: Option<PrefId>,
    /// Numeric value of the referent, for numeric-indifferent preferences.
    pub numeric_value: f64,
}

impl Preference {
    pub fn new(
        pref_type: PreferenceType,
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
        referent: Option<SymbolId>,
    ) -> Self {
        Self {
            pref_type,
            id,
            attr,
            value,
            referent,
            o_supported: false,
            on_goal_list: false,
            reference_count: 0,
            inst: None,
            slot: None,
            next_clone: None,
            prev_clone: None,
            numeric_value: 0.0,
        }
    }

    /// Whether the preference is currently housed in a slot.
    pub fn in_tm(&self) -> bool {
        self.slot.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_types() {
        let binary: Vec<_> = PreferenceType::ALL
            .iter()
            .filter(|t| t.is_binary())
            .collect();
        assert_eq!(binary.len(), 4);
        assert!(PreferenceType::Better.is_binary());
        assert!(PreferenceType::Best.is_unary());
    }

    #[test]
    fn indices_are_dense() {
        for (i, t) in PreferenceType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
    }

    #[test]
    fn new_preference_is_not_in_tm() {
        let s = SymbolId::new(1).unwrap();
        let p = Preference::new(PreferenceType::Acceptable, s, s, s, None);
        assert!(!p.in_tm());
        assert_eq!(p.reference_count, 0);
        assert!(!p.o_supported);
    }
}
