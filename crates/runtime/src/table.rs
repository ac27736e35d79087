//! Open-addressing hash tables.
//!
//! Three specializations share one layout: linear probing, tombstone
//! deletion, growth at 75% load, power-of-two capacity so the slot index is
//! `hash & (cap - 1)`.
//!
//! - [`ValueHashTable`]: general `Value -> Value` map backing user tables
//!   and anything keyed by arbitrary values. Key equality can require
//!   interpreter dispatch (`__eq__`), so lookup is split in two: the table
//!   returns the hash-matching candidates in the probe run and the caller
//!   decides equality, then commits with the returned slot index.
//! - [`FieldIndex`]: interned-string keys mapping to dense `i32` slot
//!   offsets (`-1` tombstone, `-2` empty). Keys compare by identity, so
//!   lookups are self-contained.
//! - [`InternPool`]: the weak set of interned strings; content comparison
//!   goes through a caller-supplied resolver so the pool itself stays
//!   independent of the heap representation.

use crate::value::{GcRef, Value};

const MIN_CAP: usize = 8;

fn should_grow(filled: usize, cap: usize) -> bool {
    // 75% load including tombstones.
    (filled + 1) * 4 > cap * 3
}

// ---------------------------------------------------------------- values --

#[derive(Debug, Clone)]
enum VEntry {
    Empty,
    Tombstone,
    Used { hash: u32, key: Value, value: Value },
}

/// `Value -> Value` open-addressing table.
#[derive(Debug, Default)]
pub struct ValueHashTable {
    entries: Vec<VEntry>,
    /// Live entries.
    used: usize,
    /// Live entries plus tombstones; drives growth.
    filled: usize,
}

/// Result of a candidate probe: hash-equal entries for the caller to
/// equality-check, plus the slot where a new key would be inserted.
#[derive(Debug)]
pub struct Probe {
    pub candidates: Vec<(usize, Value)>,
    pub insert_slot: usize,
}

impl ValueHashTable {
    pub fn new() -> ValueHashTable {
        ValueHashTable::default()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Grow if an insertion now could exceed the load factor. Callers must
    /// invoke this before `probe` when they intend to insert, since growth
    /// invalidates slot indices.
    pub fn ensure_capacity(&mut self) {
        if self.entries.is_empty() {
            self.entries = vec![VEntry::Empty; MIN_CAP];
            return;
        }
        if !should_grow(self.filled, self.entries.len()) {
            return;
        }
        let new_cap = self.entries.len() * 2;
        let old = std::mem::replace(&mut self.entries, vec![VEntry::Empty; new_cap]);
        self.filled = self.used;
        let mask = new_cap - 1;
        for entry in old {
            if let VEntry::Used { hash, key, value } = entry {
                let mut idx = hash as usize & mask;
                loop {
                    if matches!(self.entries[idx], VEntry::Empty) {
                        self.entries[idx] = VEntry::Used { hash, key, value };
                        break;
                    }
                    idx = (idx + 1) & mask;
                }
            }
        }
    }

    /// Collect the probe run for `hash`: every used entry whose hash
    /// matches (the caller performs key equality on those), and the slot
    /// where an absent key would land.
    pub fn probe(&self, hash: u32) -> Probe {
        debug_assert!(!self.entries.is_empty(), "probe on unallocated table");
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        let mut candidates = Vec::new();
        let mut insert_slot = None;
        loop {
            match &self.entries[idx] {
                VEntry::Empty => {
                    return Probe {
                        candidates,
                        insert_slot: insert_slot.unwrap_or(idx),
                    };
                }
                VEntry::Tombstone => {
                    if insert_slot.is_none() {
                        insert_slot = Some(idx);
                    }
                }
                VEntry::Used { hash: h, key, .. } => {
                    if *h == hash {
                        candidates.push((idx, *key));
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn value_at(&self, idx: usize) -> Value {
        match self.entries.get(idx) {
            Some(VEntry::Used { value, .. }) => *value,
            _ => Value::Null,
        }
    }

    pub fn key_at(&self, idx: usize) -> Option<Value> {
        match self.entries.get(idx) {
            Some(VEntry::Used { key, .. }) => Some(*key),
            _ => None,
        }
    }

    pub fn set_value_at(&mut self, idx: usize, value: Value) {
        if let Some(VEntry::Used { value: v, .. }) = self.entries.get_mut(idx) {
            *v = value;
        }
    }

    /// Write a new key into a slot returned by `probe`. Returns true (it
    /// is always a new insertion; updates go through `set_value_at`).
    pub fn insert_at(&mut self, idx: usize, hash: u32, key: Value, value: Value) -> bool {
        if matches!(self.entries[idx], VEntry::Empty) {
            self.filled += 1;
        }
        self.entries[idx] = VEntry::Used { hash, key, value };
        self.used += 1;
        true
    }

    /// Delete by slot, leaving a tombstone.
    pub fn remove_at(&mut self, idx: usize) {
        if let Some(e) = self.entries.get_mut(idx) {
            if matches!(e, VEntry::Used { .. }) {
                *e = VEntry::Tombstone;
                self.used -= 1;
            }
        }
    }

    /// Iterate live `(slot, key, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Value, Value)> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, e)| match e {
            VEntry::Used { key, value, .. } => Some((i, *key, *value)),
            _ => None,
        })
    }

    /// First live slot at or after `from`; drives table iteration.
    pub fn next_used(&self, from: usize) -> Option<usize> {
        (from..self.entries.len()).find(|&i| matches!(self.entries[i], VEntry::Used { .. }))
    }
}

// ---------------------------------------------------------------- fields --

const SLOT_EMPTY: i32 = -2;
const SLOT_TOMBSTONE: i32 = -1;

#[derive(Debug, Clone, Copy)]
struct FEntry {
    key: GcRef,
    hash: u32,
    slot: i32,
}

const NO_KEY: GcRef = GcRef(u32::MAX);

impl FEntry {
    const EMPTY: FEntry = FEntry { key: NO_KEY, hash: 0, slot: SLOT_EMPTY };
}

/// Interned-string keyed index of dense slot offsets: class field layouts
/// and module global tables.
///
/// Keys are interned, so identity comparison suffices and every operation
/// is self-contained (no resolver needed).
#[derive(Debug, Default)]
pub struct FieldIndex {
    entries: Vec<FEntry>,
    used: usize,
    filled: usize,
}

impl FieldIndex {
    pub fn new() -> FieldIndex {
        FieldIndex::default()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { MIN_CAP } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![FEntry::EMPTY; new_cap]);
        self.filled = self.used;
        let mask = new_cap - 1;
        for entry in old {
            if entry.slot >= 0 {
                let mut idx = entry.hash as usize & mask;
                while self.entries[idx].slot != SLOT_EMPTY {
                    idx = (idx + 1) & mask;
                }
                self.entries[idx] = entry;
            }
        }
    }

    /// Find the entry slot for `key`, or the insertion point.
    fn find(&self, key: GcRef, hash: u32) -> (usize, bool) {
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        let mut tombstone = None;
        loop {
            let e = &self.entries[idx];
            if e.slot == SLOT_EMPTY {
                return (tombstone.unwrap_or(idx), false);
            }
            if e.slot == SLOT_TOMBSTONE {
                if tombstone.is_none() {
                    tombstone = Some(idx);
                }
            } else if e.key == key {
                return (idx, true);
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn get(&self, key: GcRef, hash: u32) -> Option<i32> {
        if self.entries.is_empty() {
            return None;
        }
        let (idx, found) = self.find(key, hash);
        found.then(|| self.entries[idx].slot)
    }

    pub fn contains(&self, key: GcRef, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    /// Insert or update; returns true when the key was new.
    pub fn put(&mut self, key: GcRef, hash: u32, slot: i32) -> bool {
        debug_assert!(slot >= 0, "negative slots are reserved sentinels");
        if self.entries.is_empty() || should_grow(self.filled, self.entries.len()) {
            self.grow();
        }
        let (idx, found) = self.find(key, hash);
        if found {
            self.entries[idx].slot = slot;
            return false;
        }
        if self.entries[idx].slot == SLOT_EMPTY {
            self.filled += 1;
        }
        self.entries[idx] = FEntry { key, hash, slot };
        self.used += 1;
        true
    }

    /// Delete, leaving a tombstone. Returns whether the key was present.
    pub fn del(&mut self, key: GcRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let (idx, found) = self.find(key, hash);
        if found {
            self.entries[idx] = FEntry { key: NO_KEY, hash: 0, slot: SLOT_TOMBSTONE };
            self.used -= 1;
        }
        found
    }

    /// Copy every entry of `src` into `self`, overwriting same-name keys.
    pub fn merge(&mut self, src: &FieldIndex) {
        for e in src.entries.iter().filter(|e| e.slot >= 0) {
            self.put(e.key, e.hash, e.slot);
        }
    }

    /// Iterate `(key, slot)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (GcRef, i32)> + '_ {
        self.entries.iter().filter(|e| e.slot >= 0).map(|e| (e.key, e.slot))
    }
}

// ----------------------------------------------------------- intern pool --

/// The weak set of interned strings. Lookups compare raw bytes through a
/// resolver closure so a candidate string never has to be materialized
/// first; the sweep hook drops entries whose string the collector did not
/// reach.
#[derive(Debug, Default)]
pub struct InternPool {
    entries: Vec<Option<(u32, GcRef)>>,
    used: usize,
    filled: usize,
}

impl InternPool {
    pub fn new() -> InternPool {
        InternPool::default()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    fn grow(&mut self) {
        let new_cap = if self.entries.is_empty() { MIN_CAP } else { self.entries.len() * 2 };
        let old = std::mem::replace(&mut self.entries, vec![None; new_cap]);
        self.filled = 0;
        self.used = 0;
        let mask = new_cap - 1;
        for entry in old.into_iter().flatten() {
            let mut idx = entry.0 as usize & mask;
            while self.entries[idx].is_some() {
                idx = (idx + 1) & mask;
            }
            self.entries[idx] = Some(entry);
            self.used += 1;
            self.filled += 1;
        }
    }

    /// Find an interned string equal to `bytes`.
    pub fn get_interned<'a>(
        &self,
        hash: u32,
        bytes: &[u8],
        resolve: impl Fn(GcRef) -> &'a [u8],
    ) -> Option<GcRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match &self.entries[idx] {
                None => return None,
                Some((h, r)) => {
                    if *h == hash && resolve(*r) == bytes {
                        return Some(*r);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Record a freshly interned string. The caller has already checked it
    /// is not present.
    pub fn insert(&mut self, hash: u32, string: GcRef) {
        if self.entries.is_empty() || should_grow(self.filled, self.entries.len()) {
            self.grow();
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        while self.entries[idx].is_some() {
            idx = (idx + 1) & mask;
        }
        self.entries[idx] = Some((hash, string));
        self.used += 1;
        self.filled += 1;
    }

    /// Weak sweep: drop entries whose string was not reached this cycle.
    ///
    /// Rebuilds in place (no tombstones needed since this runs rarely and
    /// compacts while it goes).
    pub fn retain_reached(&mut self, mut reached: impl FnMut(GcRef) -> bool) {
        let cap = self.entries.len();
        if cap == 0 {
            return;
        }
        let old = std::mem::replace(&mut self.entries, vec![None; cap]);
        self.used = 0;
        self.filled = 0;
        let mask = cap - 1;
        for (hash, r) in old.into_iter().flatten() {
            if reached(r) {
                let mut idx = hash as usize & mask;
                while self.entries[idx].is_some() {
                    idx = (idx + 1) & mask;
                }
                self.entries[idx] = Some((hash, r));
                self.used += 1;
                self.filled += 1;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = GcRef> + '_ {
        self.entries.iter().flatten().map(|(_, r)| *r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::hash_num;

    #[test]
    fn test_value_table_insert_get() {
        let mut t = ValueHashTable::new();
        for i in 0..20 {
            let key = Value::Num(i as f64);
            let hash = hash_num(i as f64);
            t.ensure_capacity();
            let probe = t.probe(hash);
            assert!(probe.candidates.iter().all(|(_, k)| !k.raw_eq(key)));
            t.insert_at(probe.insert_slot, hash, key, Value::Num((i * 10) as f64));
        }
        assert_eq!(t.len(), 20);
        for i in 0..20 {
            let hash = hash_num(i as f64);
            let probe = t.probe(hash);
            let hit = probe
                .candidates
                .iter()
                .find(|(_, k)| k.raw_eq(Value::Num(i as f64)))
                .expect("key present");
            assert!(t.value_at(hit.0).raw_eq(Value::Num((i * 10) as f64)));
        }
    }

    #[test]
    fn test_value_table_delete_leaves_probe_chain_intact() {
        let mut t = ValueHashTable::new();
        let mut slots = Vec::new();
        // Five same-hash keys stay under the load factor of the initial
        // capacity, so the recorded slots remain stable.
        for i in 0..5 {
            let hash = 7;
            t.ensure_capacity();
            let probe = t.probe(hash);
            slots.push(probe.insert_slot);
            t.insert_at(probe.insert_slot, hash, Value::Num(i as f64), Value::Bool(true));
        }
        // Delete an entry in the middle of the chain; later entries must
        // remain findable.
        t.remove_at(slots[2]);
        let probe = t.probe(7);
        assert!(probe.candidates.iter().any(|(_, k)| k.raw_eq(Value::Num(4.0))));
        // The tombstone is reused for the next insertion.
        assert_eq!(probe.insert_slot, slots[2]);
    }

    #[test]
    fn test_value_table_growth_keeps_entries() {
        let mut t = ValueHashTable::new();
        for i in 0..100 {
            let key = Value::Num(i as f64);
            let hash = hash_num(i as f64);
            t.ensure_capacity();
            let probe = t.probe(hash);
            t.insert_at(probe.insert_slot, hash, key, key);
        }
        assert_eq!(t.len(), 100);
        assert!(t.capacity().is_power_of_two());
        let probe = t.probe(hash_num(73.0));
        assert!(probe.candidates.iter().any(|(_, k)| k.raw_eq(Value::Num(73.0))));
    }

    #[test]
    fn test_field_index_basic() {
        let mut idx = FieldIndex::new();
        let a = GcRef(1);
        let b = GcRef(2);
        assert!(idx.put(a, 11, 0));
        assert!(idx.put(b, 22, 1));
        assert!(!idx.put(a, 11, 5), "update is not a new insertion");
        assert_eq!(idx.get(a, 11), Some(5));
        assert_eq!(idx.get(b, 22), Some(1));
        assert_eq!(idx.get(GcRef(3), 33), None);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_field_index_delete_and_reinsert() {
        let mut idx = FieldIndex::new();
        let a = GcRef(1);
        assert!(idx.put(a, 5, 0));
        assert!(idx.del(a, 5));
        assert!(!idx.del(a, 5));
        assert_eq!(idx.get(a, 5), None);
        assert!(idx.put(a, 5, 9));
        assert_eq!(idx.get(a, 5), Some(9));
    }

    #[test]
    fn test_field_index_same_hash_different_keys() {
        let mut idx = FieldIndex::new();
        // Interned strings can collide on hash; identity still separates.
        idx.put(GcRef(1), 42, 0);
        idx.put(GcRef(2), 42, 1);
        assert_eq!(idx.get(GcRef(1), 42), Some(0));
        assert_eq!(idx.get(GcRef(2), 42), Some(1));
    }

    #[test]
    fn test_field_index_merge_overwrites() {
        let mut dst = FieldIndex::new();
        dst.put(GcRef(1), 1, 0);
        let mut src = FieldIndex::new();
        src.put(GcRef(1), 1, 7);
        src.put(GcRef(2), 2, 1);
        dst.merge(&src);
        assert_eq!(dst.get(GcRef(1), 1), Some(7));
        assert_eq!(dst.get(GcRef(2), 2), Some(1));
    }

    #[test]
    fn test_field_index_growth() {
        let mut idx = FieldIndex::new();
        for i in 0..200u32 {
            idx.put(GcRef(i), i.wrapping_mul(2654435761), i as i32);
        }
        assert_eq!(idx.len(), 200);
        for i in 0..200u32 {
            assert_eq!(idx.get(GcRef(i), i.wrapping_mul(2654435761)), Some(i as i32));
        }
    }

    #[test]
    fn test_intern_pool_find_and_weak_sweep() {
        let strings = ["alpha", "beta", "gamma"];
        let resolve = |r: GcRef| strings[r.index()].as_bytes();
        let mut pool = InternPool::new();
        for (i, s) in strings.iter().enumerate() {
            let h = crate::value::hash_bytes(s.as_bytes());
            assert!(pool.get_interned(h, s.as_bytes(), resolve).is_none());
            pool.insert(h, GcRef(i as u32));
        }
        let h = crate::value::hash_bytes(b"beta");
        assert_eq!(pool.get_interned(h, b"beta", resolve), Some(GcRef(1)));

        // Weak sweep drops what the collector didn't reach.
        pool.retain_reached(|r| r != GcRef(1));
        assert_eq!(pool.get_interned(h, b"beta", resolve), None);
        assert_eq!(pool.len(), 2);
    }
}
