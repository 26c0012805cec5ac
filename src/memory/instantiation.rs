//! Instantiations: one firing of one production against one match token.

use super::arena::{PrefId, ProdId, WmeId};
use crate::matcher::MatchToken;
use crate::symbol::{Level, SymbolId};

/// Backtrace information recorded for each positive condition.
#[derive(Debug, Clone)]
pub struct BacktraceInfo {
    /// The WME that satisfied the condition.
    pub wme: WmeId,
    /// Goal-stack level of the WME's identifier when the instantiation fired.
    pub level: Level,
    /// Preference backing the WME, at the instantiation's level.
    pub trace: Option<PrefId>,
    /// Prohibit preferences relevant when the WME is a selected operator.
    pub prohibits: Vec<PrefId>,
}

/// An instantiated condition.
#[derive(Debug, Clone)]
pub enum InstCondition {
    Positive(BacktraceInfo),
    /// A negated condition with every field the token bound filled in.
    Negative {
        id: Option<SymbolId>,
        attr: Option<SymbolId>,
        value: Option<SymbolId>,
        acceptable: bool,
    },
}

impl InstCondition {
    pub fn backtrace(&self) -> Option<&BacktraceInfo> {
        match self {
            InstCondition::Positive(bt) => Some(bt),
            InstCondition::Negative { .. } => None,
        }
    }

    pub fn backtrace_mut(&mut self) -> Option<&mut BacktraceInfo> {
        match self {
            InstCondition::Positive(bt) => Some(bt),
            InstCondition::Negative { .. } => None,
        }
    }
}

/// One firing of a production.
///
/// Deallocatable only when it generated no live preferences and has left the
/// match set.
#[derive(Debug, Clone)]
pub struct Instantiation {
    /// `None` for instantiations the architecture makes for goal `^item`s.
    pub prod: Option<ProdId>,
    /// Kept so diagnostics can name the production after it is excised.
    pub prod_name: String,
    pub token: MatchToken,
    pub conditions: Vec<InstCondition>,
    pub preferences_generated: Vec<PrefId>,
    pub match_goal: Option<SymbolId>,
    pub match_goal_level: Level,
    pub reliable: bool,
    pub in_ms: bool,
    pub gds_evaluated_already: bool,
}

impl Instantiation {
    pub fn new(prod: ProdId, prod_name: impl Into<String>, token: MatchToken) -> Self {
        Self {
            prod: Some(prod),
            prod_name: prod_name.into(),
            token,
            conditions: Vec::new(),
            preferences_generated: Vec::new(),
            match_goal: None,
            match_goal_level: crate::symbol::ATTRIBUTE_IMPASSE_LEVEL,
            reliable: true,
            in_ms: true,
            gds_evaluated_already: false,
        }
    }

    /// An instantiation with no production, standing in for the architecture
    /// when it backs a goal's `^item` WME with a preference.
    pub fn architectural(goal: SymbolId, level: Level, condition: BacktraceInfo) -> Self {
        Self {
            prod: None,
            prod_name: String::from("*architecture*"),
            token: MatchToken::default(),
            conditions: vec![InstCondition::Positive(condition)],
            preferences_generated: Vec::new(),
            match_goal: Some(goal),
            match_goal_level: level,
            reliable: true,
            in_ms: false,
            gds_evaluated_already: false,
        }
    }

    /// The WMEs that satisfied the positive conditions, in condition order.
    pub fn backtrace_wmes(&self) -> Vec<WmeId> {
        self.conditions
            .iter()
            .filter_map(InstCondition::backtrace)
            .map(|bt| bt.wme)
            .collect()
    }

    pub fn insert_generated_preference(&mut self, pref: PrefId) {
        self.preferences_generated.insert(0, pref);
    }

    pub fn remove_generated_preference(&mut self, pref: PrefId) {
        self.preferences_generated.retain(|&p| p != pref);
    }

    pub fn is_deallocatable(&self) -> bool {
        self.preferences_generated.is_empty() && !self.in_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::arena::{Arena, ArenaKey};

    #[test]
    fn deallocatable_only_when_empty_and_out_of_match_set() {
        let mut prods: Arena<ProdId, ()> = Arena::new();
        let mut prefs: Arena<PrefId, ()> = Arena::new();
        let prod = prods.insert(());
        let pref = prefs.insert(());
        let mut inst = Instantiation::new(prod, "p1", MatchToken::default());
        assert!(!inst.is_deallocatable());
        inst.insert_generated_preference(pref);
        inst.in_ms = false;
        assert!(!inst.is_deallocatable());
        inst.remove_generated_preference(pref);
        assert!(inst.is_deallocatable());
    }

    #[test]
    fn backtrace_wmes_skip_negations() {
        let wme = WmeId::from_parts(4, 0);
        let prod = ProdId::from_parts(0, 0);
        let mut inst = Instantiation::new(prod, "p1", MatchToken::default());
        inst.conditions.push(InstCondition::Positive(BacktraceInfo {
            wme,
            level: 1,
            trace: None,
            prohibits: Vec::new(),
        }));
        inst.conditions.push(InstCondition::Negative {
            id: None,
            attr: None,
            value: None,
            acceptable: false,
        });
        assert_eq!(inst.backtrace_wmes(), vec![wme]);
    }
}
