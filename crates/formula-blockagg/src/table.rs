#![forbid(unsafe_code)]

use crate::value::{MaterializedRow, Value};
use ahash::RandomState;
use hashbrown::hash_map::{EntryRef, IntoIter};
use hashbrown::HashMap;

/// Per-entry bookkeeping bytes on top of the key and accumulator rows.
pub(crate) const HASHMAP_ENTRY_OVERHEAD_BYTES: usize = 64;

/// Hash table from group-by key to one row of accumulator state.
///
/// Entries are created lazily the first time a key is seen and updated in place afterwards.
/// Lookups take the unowned key form (`&[Value]`); the key is only deep-copied when a new entry
/// is inserted.
#[derive(Debug, Clone)]
pub struct GroupTable {
    map: HashMap<MaterializedRow, MaterializedRow, RandomState>,
    accumulator_count: usize,
}

impl GroupTable {
    pub fn new(accumulator_count: usize) -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            accumulator_count,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &[Value]) -> Option<&MaterializedRow> {
        self.map.get(key)
    }

    /// Return the accumulator row for `key`, inserting a row of `Nothing` slots on a miss.
    ///
    /// Single hash computation per call.
    pub fn find_or_insert(&mut self, key: &[Value]) -> &mut MaterializedRow {
        match self.map.entry_ref(key) {
            EntryRef::Occupied(entry) => entry.into_mut(),
            EntryRef::Vacant(entry) => entry.insert(MaterializedRow::new(self.accumulator_count)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MaterializedRow, &MaterializedRow)> {
        self.map.iter()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Estimate the memory held by the table from a sample of at most `sample_size` entries.
    pub fn estimate_memory_bytes(&self, sample_size: usize) -> usize {
        let sample_size = sample_size.max(1);
        let mut sampled = 0usize;
        let mut sampled_bytes = 0usize;
        for (key, accs) in self.map.iter().take(sample_size) {
            sampled += 1;
            sampled_bytes = sampled_bytes
                .saturating_add(HASHMAP_ENTRY_OVERHEAD_BYTES)
                .saturating_add(key.approx_size_bytes())
                .saturating_add(accs.approx_size_bytes());
        }
        if sampled == 0 {
            return 0;
        }
        (sampled_bytes / sampled).saturating_mul(self.map.len())
    }
}

impl IntoIterator for GroupTable {
    type Item = (MaterializedRow, MaterializedRow);
    type IntoIter = IntoIter<MaterializedRow, MaterializedRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}
