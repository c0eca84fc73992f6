//! Per-source identity interning
//!
//! Data points store a small integer id instead of the full (block-state,
//! biome) identity pair. Each source owns its own ordered id table, so ids
//! are meaningless outside their source: combining two sources always goes
//! through [`IdMap::merge_from`] and the remap table it returns.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::datapoint::MAX_ID;

/// One interned identity: stable integer handles supplied by the host
/// object model for a block state and a biome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdEntry {
    pub block_state: u64,
    pub biome: u64,
}

impl IdEntry {
    /// The void identity, always interned at index 0.
    pub const VOID: IdEntry = IdEntry { block_state: 0, biome: 0 };
}

/// Ordered list of interned identities plus a reverse index.
#[derive(Debug, Clone)]
pub struct IdMap {
    entries: Vec<IdEntry>,
    lookup: FxHashMap<IdEntry, u32>,
}

impl IdMap {
    pub fn new() -> Self {
        let mut map = Self {
            entries: Vec::new(),
            lookup: FxHashMap::default(),
        };
        // Id 0 is reserved for void so the all-zero data point resolves.
        map.intern(IdEntry::VOID);
        map
    }

    /// Rebuild from a serialized entry list. Index 0 must be the void entry.
    pub fn from_entries(entries: Vec<IdEntry>) -> Self {
        debug_assert!(entries.first() == Some(&IdEntry::VOID), "id map missing void entry");
        let lookup = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (*e, i as u32))
            .collect();
        Self { entries, lookup }
    }

    /// Return the id for `entry`, interning it if unseen.
    pub fn intern(&mut self, entry: IdEntry) -> u32 {
        if let Some(&id) = self.lookup.get(&entry) {
            return id;
        }
        let id = self.entries.len() as u32;
        assert!(id <= MAX_ID, "id map exhausted the data point id space");
        self.entries.push(entry);
        self.lookup.insert(entry, id);
        id
    }

    pub fn get(&self, id: u32) -> Option<IdEntry> {
        self.entries.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IdEntry] {
        &self.entries
    }

    /// Intern every entry of `other` into this map and return the remap
    /// table, indexed by `other`'s ids. Every data point copied across from
    /// `other`'s source must be rewritten through this table; overwriting
    /// ids wholesale corrupts the copied data.
    pub fn merge_from(&mut self, other: &IdMap) -> Vec<u32> {
        other.entries.iter().map(|&e| self.intern(e)).collect()
    }
}

impl Default for IdMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for IdMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
