//! Working-memory elements and the buffered working memory.
//!
//! A WME's triple and acceptable flag never change after creation. Additions
//! and removals are buffered during a phase and committed to the matcher in
//! one batch by `Kernel::do_buffered_wm_changes`.

use serde::{Deserialize, Serialize};

use super::arena::{Arena, GdsId, PrefId, WmeId};
use crate::symbol::SymbolId;

/// The immutable part of a WME, as seen by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WmeFacts {
    pub id: SymbolId,
    pub attr: SymbolId,
    pub value: SymbolId,
    pub acceptable: bool,
    pub timetag: u64,
}

/// A working-memory element.
#[derive(Debug, Clone)]
pub struct Wme {
    pub id: SymbolId,
    pub attr: SymbolId,
    pub value: SymbolId,
    pub acceptable: bool,
    pub timetag: u64,
    /// The preference supporting this WME; `None` for architecture and input WMEs.
    pub preference: Option<PrefId>,
    pub gds: Option<GdsId>,
    pub in_wm: bool,
    /// Holds from instantiations that tested this WME.
    pub reference_count: u32,
    /// Set between `remove_wme_from_wm` and the matcher seeing the removal.
    pub buffered_removal: bool,
}

impl Wme {
    pub fn facts(&self) -> WmeFacts {
        WmeFacts {
            id: self.id,
            attr: self.attr,
            value: self.value,
            acceptable: self.acceptable,
            timetag: self.timetag,
        }
    }
}

/// Counters kept by working memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WmStats {
    pub additions: u64,
    pub removals: u64,
    pub current_size: usize,
    pub max_size: usize,
}

/// Owner of all WME records plus the per-phase change buffers.
#[derive(Debug)]
pub struct WorkingMemory {
    wmes: Arena<WmeId, Wme>,
    next_timetag: u64,
    to_add: Vec<WmeId>,
    to_remove: Vec<WmeId>,
    stats: WmStats,
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self {
            wmes: Arena::new(),
            next_timetag: 1,
            to_add: Vec::new(),
            to_remove: Vec::new(),
            stats: WmStats::default(),
        }
    }

    /// Create a WME record with the next timetag. It is not yet in working
    /// memory; see `Kernel::add_wme_to_wm`.
    pub fn make_wme(
        &mut self,
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
        acceptable: bool,
    ) -> WmeId {
        let timetag = self.next_timetag;
        self.next_timetag += 1;
        self.wmes.insert(Wme {
            id,
            attr,
            value,
            acceptable,
            timetag,
            preference: None,
            gds: None,
            in_wm: false,
            reference_count: 0,
            buffered_removal: false,
        })
    }

    pub fn get(&self, w: WmeId) -> Option<&Wme> {
        self.wmes.get(w)
    }

    pub fn get_mut(&mut self, w: WmeId) -> Option<&mut Wme> {
        self.wmes.get_mut(w)
    }

    pub fn contains(&self, w: WmeId) -> bool {
        self.wmes.contains(w)
    }

    pub(crate) fn buffer_addition(&mut self, w: WmeId) {
        self.wmes[w].in_wm = true;
        self.to_add.push(w);
    }

    pub(crate) fn buffer_removal(&mut self, w: WmeId) {
        let wme = &mut self.wmes[w];
        wme.in_wm = false;
        wme.buffered_removal = true;
        self.to_remove.push(w);
    }

    /// Hand the pending additions and removals to the caller.
    pub(crate) fn take_buffers(&mut self) -> (Vec<WmeId>, Vec<WmeId>) {
        (
            std::mem::take(&mut self.to_add),
            std::mem::take(&mut self.to_remove),
        )
    }

    pub fn pending_additions(&self) -> &[WmeId] {
        &self.to_add
    }

    pub fn pending_removals(&self) -> &[WmeId] {
        &self.to_remove
    }

    pub(crate) fn record_commit(&mut self, added: usize, removed: usize) {
        self.stats.additions += added as u64;
        self.stats.removals += removed as u64;
        self.stats.current_size = (self.stats.current_size + added).saturating_sub(removed);
        self.stats.max_size = self.stats.max_size.max(self.stats.current_size);
    }

    pub(crate) fn add_ref(&mut self, w: WmeId) {
        if let Some(wme) = self.wmes.get_mut(w) {
            wme.reference_count += 1;
        }
    }

    /// Release a hold on a WME, freeing it when nothing refers to it anymore.
    pub(crate) fn remove_ref(&mut self, w: WmeId) {
        if let Some(wme) = self.wmes.get_mut(w) {
            wme.reference_count = wme.reference_count.saturating_sub(1);
        }
        self.possibly_free(w);
    }

    /// Free a WME that is out of working memory, committed, and unreferenced.
    pub(crate) fn possibly_free(&mut self, w: WmeId) -> bool {
        let free = self
            .wmes
            .get(w)
            .is_some_and(|wme| !wme.in_wm && !wme.buffered_removal && wme.reference_count == 0);
        if free {
            self.wmes.remove(w);
        }
        free
    }

    /// WMEs currently in working memory, in timetag order.
    pub fn iter(&self) -> impl Iterator<Item = (WmeId, &Wme)> {
        let mut live: Vec<_> = self.wmes.iter().filter(|(_, w)| w.in_wm).collect();
        live.sort_by_key(|(_, w)| w.timetag);
        live.into_iter()
    }

    /// Find a WME in working memory by its triple.
    pub fn find(&self, id: SymbolId, attr: SymbolId, value: SymbolId) -> Option<WmeId> {
        self.iter()
            .find(|(_, w)| w.id == id && w.attr == attr && w.value == value)
            .map(|(k, _)| k)
    }

    /// Number of WMEs in working memory.
    pub fn len(&self) -> usize {
        self.wmes.iter().filter(|(_, w)| w.in_wm).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of WME records still allocated, in or out of working memory.
    pub fn allocated(&self) -> usize {
        self.wmes.len()
    }

    pub fn stats(&self) -> WmStats {
        self.stats
    }

    /// Drop every WME and reset counters. Timetags keep increasing.
    pub fn clear(&mut self) {
        self.wmes.clear();
        self.to_add.clear();
        self.to_remove.clear();
        self.stats = WmStats::default();
    }
}

impl std::ops::Index<WmeId> for WorkingMemory {
    type Output = Wme;

    fn index(&self, w: WmeId) -> &Wme {
        &self.wmes[w]
    }
}

impl std::ops::IndexMut<WmeId> for WorkingMemory {
    fn index_mut(&mut self, w: WmeId) -> &mut Wme {
        &mut self.wmes[w]
    }
}
