//! Slots: the preferences and WMEs of one (identifier, attribute) pair.

use serde::{Deserialize, Serialize};

use super::arena::{Arena, PrefId, WmeId};
use super::preference::{Preference, PreferenceType};
use crate::symbol::{Level, SymbolId};

/// Kind of impasse a slot (or goal) is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImpasseType {
    #[default]
    None,
    ConstraintFailure,
    Conflict,
    Tie,
    NoChange,
}

/// One (identifier, attribute) slot.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SymbolId,
    pub attr: SymbolId,
    /// WMEs the decider committed for this slot.
    pub wmes: Vec<WmeId>,
    /// Acceptable-preference WMEs; context slots only.
    pub acceptable_preference_wmes: Vec<WmeId>,
    /// Every preference in the slot, newest first.
    pub all_preferences: Vec<PrefId>,
    by_type: [Vec<PrefId>; PreferenceType::COUNT],
    /// Context-dependent preference set used when backtracing through a
    /// selected operator.
    pub cdps: Vec<PrefId>,
    pub impasse_id: Option<SymbolId>,
    pub impasse_type: ImpasseType,
    pub isa_context_slot: bool,
    pub changed: bool,
    pub acceptable_preference_changed: bool,
    pub marked_for_possible_removal: bool,
}

impl Slot {
    pub fn new(id: SymbolId, attr: SymbolId, isa_context_slot: bool) -> Self {
        Self {
            id,
            attr,
            wmes: Vec::new(),
            acceptable_preference_wmes: Vec::new(),
            all_preferences: Vec::new(),
            by_type: Default::default(),
            cdps: Vec::new(),
            impasse_id: None,
            impasse_type: ImpasseType::None,
            isa_context_slot,
            changed: false,
            acceptable_preference_changed: false,
            marked_for_possible_removal: false,
        }
    }

    /// Preferences of one type, ordered by non-decreasing match-goal level.
    pub fn preferences_of(&self, ty: PreferenceType) -> &[PrefId] {
        &self.by_type[ty.index()]
    }

    pub fn has_preferences_of(&self, ty: PreferenceType) -> bool {
        !self.by_type[ty.index()].is_empty()
    }

    /// Add a preference to the slot.
    ///
    /// `level_of` yields the match-goal level of a preference's
    /// instantiation; the new preference goes before the first one of its
    /// type at the same or a deeper level.
    pub fn add_preference(
        &mut self,
        pref: PrefId,
        ty: PreferenceType,
        level: Level,
        level_of: impl Fn(PrefId) -> Level,
    ) {
        self.all_preferences.insert(0, pref);
        let list = &mut self.by_type[ty.index()];
        let at = list
            .iter()
            .position(|&p| level_of(p) >= level)
            .unwrap_or(list.len());
        list.insert(at, pref);
    }

    pub fn remove_preference(&mut self, pref: PrefId, ty: PreferenceType) {
        self.all_preferences.retain(|&p| p != pref);
        self.by_type[ty.index()].retain(|&p| p != pref);
    }

    pub fn has_no_preferences(&self) -> bool {
        self.all_preferences.is_empty()
    }

    /// Whether nothing keeps the slot alive.
    pub fn is_garbage(&self) -> bool {
        self.all_preferences.is_empty()
            && self.wmes.is_empty()
            && self.acceptable_preference_wmes.is_empty()
    }

    /// Add a preference to the CDPS unless it, or an equivalent one, is
    /// already there. Returns `true` when added; the caller takes a reference.
    pub fn add_to_cdps(
        &mut self,
        prefs: &Arena<PrefId, Preference>,
        pref: PrefId,
        unique_value: bool,
    ) -> bool {
        let new = &prefs[pref];
        let exists = self.cdps.iter().any(|&existing| {
            if existing == pref {
                return true;
            }
            if !unique_value {
                return false;
            }
            let p = &prefs[existing];
            let ordering =
                |t: PreferenceType| matches!(t, PreferenceType::Better | PreferenceType::Worse);
            if ordering(new.pref_type) && ordering(p.pref_type) {
                if new.pref_type == p.pref_type {
                    new.value == p.value && new.referent == p.referent
                } else {
                    Some(new.value) == p.referent && new.referent == Some(p.value)
                }
            } else if new.pref_type == PreferenceType::BinaryIndifferent
                && p.pref_type == PreferenceType::BinaryIndifferent
            {
                (new.value == p.value && new.referent == p.referent)
                    || (Some(new.value) == p.referent && new.referent == Some(p.value))
            } else {
                new.value == p.value && new.pref_type == p.pref_type
            }
        });
        if exists {
            tracing::trace!(%pref, "equivalent preference already in CDPS");
            return false;
        }
        self.cdps.insert(0, pref);
        true
    }

    /// Empty the CDPS, returning the preferences whose references the caller
    /// must release.
    pub fn take_cdps(&mut self) -> Vec<PrefId> {
        std::mem::take(&mut self.cdps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u64) -> SymbolId {
        SymbolId::new(id).unwrap()
    }

    #[test]
    fn type_lists_stay_sorted_by_level() {
        let mut arena: Arena<PrefId, Preference> = Arena::new();
        let mut levels = std::collections::HashMap::new();
        let mut slot = Slot::new(sym(1), sym(2), false);
        for level in [3, 1, 2, 1, 3, 2] {
            let p = arena.insert(Preference::new(
                PreferenceType::Acceptable,
                sym(1),
                sym(2),
                sym(3),
                None,
            ));
            levels.insert(p, level);
            slot.add_preference(p, PreferenceType::Acceptable, level, |q| levels[&q]);
        }
        let order: Vec<Level> = slot
            .preferences_of(PreferenceType::Acceptable)
            .iter()
            .map(|p| levels[p])
            .collect();
        assert_eq!(order, vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(slot.all_preferences.len(), 6);
    }

    #[test]
    fn remove_preference_unlinks_everywhere() {
        let mut arena: Arena<PrefId, Preference> = Arena::new();
        let mut slot = Slot::new(sym(1), sym(2), false);
        let p = arena.insert(Preference::new(PreferenceType::Reject, sym(1), sym(2), sym(3), None));
        slot.add_preference(p, PreferenceType::Reject, 1, |_| 1);
        assert!(slot.has_preferences_of(PreferenceType::Reject));
        slot.remove_preference(p, PreferenceType::Reject);
        assert!(slot.has_no_preferences());
        assert!(slot.is_garbage());
    }

    #[test]
    fn cdps_treats_mirrored_better_worse_as_equivalent() {
        let mut arena: Arena<PrefId, Preference> = Arena::new();
        let mut slot = Slot::new(sym(1), sym(2), true);
        let better = arena.insert(Preference::new(
            PreferenceType::Better,
            sym(1),
            sym(2),
            sym(5),
            Some(sym(6)),
        ));
        let worse = arena.insert(Preference::new(
            PreferenceType::Worse,
            sym(1),
            sym(2),
            sym(6),
            Some(sym(5)),
        ));
        assert!(slot.add_to_cdps(&arena, better, true));
        assert!(!slot.add_to_cdps(&arena, better, true));
        assert!(!slot.add_to_cdps(&arena, worse, true));
        assert!(slot.add_to_cdps(&arena, worse, false));
        assert_eq!(slot.take_cdps().len(), 2);
        assert!(slot.cdps.is_empty());
    }

    #[test]
    fn cdps_unary_uniqueness_is_by_value_and_type() {
        let mut arena: Arena<PrefId, Preference> = Arena::new();
        let mut slot = Slot::new(sym(1), sym(2), true);
        let a = arena.insert(Preference::new(PreferenceType::Best, sym(1), sym(2), sym(5), None));
        let b = arena.insert(Preference::new(PreferenceType::Best, sym(1), sym(2), sym(5), None));
        let c = arena.insert(Preference::new(PreferenceType::Worst, sym(1), sym(2), sym(5), None));
        assert!(slot.add_to_cdps(&arena, a, true));
        assert!(!slot.add_to_cdps(&arena, b, true));
        assert!(slot.add_to_cdps(&arena, c, true));
    }
}
