use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::slice;

use crate::key::Key;
use crate::key_range::KeyRange;
use crate::types::Direction;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Record<V> {
    pub key: Key,
    pub value: V,
}

/// Secondary ordering between records that share a key
pub trait RecordValue: Clone {
    fn order(&self, other: &Self) -> Ordering;
}

impl RecordValue for Value {
    // object store keys are unique, new records go last
    fn order(&self, _other: &Self) -> Ordering {
        Ordering::Equal
    }
}

impl RecordValue for Key {
    fn order(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// Sorted working set of one store or index.
///
/// Besides the records themselves it remembers every key that was written
/// and every range that was deleted, so a merge can tell which remote records
/// no longer reflect this transaction's view.
#[derive(Debug, Clone)]
pub struct RecordStore<V> {
    records: Vec<Record<V>>,
    modifications: BTreeSet<Key>,
    deleted_ranges: Vec<KeyRange>,
}

impl<V> Default for RecordStore<V> {
    fn default() -> Self {
        RecordStore {
            records: Vec::new(),
            modifications: BTreeSet::new(),
            deleted_ranges: Vec::new(),
        }
    }
}

/// Double-ended walk over a contiguous run of records
pub struct Values<'a, V> {
    inner: slice::Iter<'a, Record<V>>,
    forward: bool,
}

impl<'a, V> Iterator for Values<'a, V> {
    type Item = &'a Record<V>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.forward {
            self.inner.next()
        } else {
            self.inner.next_back()
        }
    }
}

impl<V: RecordValue> RecordStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn index_of_key(&self, key: &Key) -> Option<usize> {
        let i = self.index_of_key_at_least(key);
        match self.records.get(i) {
            Some(record) if record.key == *key => Some(i),
            _ => None,
        }
    }

    /// First position whose key is not below `key`
    pub fn index_of_key_at_least(&self, key: &Key) -> usize {
        self.records.partition_point(|r| r.key < *key)
    }

    fn start_of(&self, range: &KeyRange) -> usize {
        match range.lower() {
            Some(lower) if range.lower_open() => self.records.partition_point(|r| r.key <= *lower),
            Some(lower) => self.index_of_key_at_least(lower),
            None => 0,
        }
    }

    fn end_of(&self, range: &KeyRange) -> usize {
        match range.upper() {
            Some(upper) if range.upper_open() => self.index_of_key_at_least(upper),
            Some(upper) => self.records.partition_point(|r| r.key <= *upper),
            None => self.records.len(),
        }
    }

    /// First record inside `range`
    pub fn index_of_key_range(&self, range: &KeyRange) -> Option<usize> {
        let i = self.start_of(range);
        self.records
            .get(i)
            .filter(|r| range.includes(&r.key))
            .map(|_| i)
    }

    pub fn get(&self, range: &KeyRange) -> Option<&Record<V>> {
        self.index_of_key_range(range).map(|i| &self.records[i])
    }

    pub fn add(&mut self, record: Record<V>) {
        let i = self.records.partition_point(|r| match r.key.cmp(&record.key) {
            Ordering::Equal => r.value.order(&record.value) != Ordering::Greater,
            ord => ord == Ordering::Less,
        });
        self.modifications.insert(record.key.clone());
        self.records.insert(i, record);
    }

    /// Remove every record in `range` and remember the range as deleted
    pub fn delete(&mut self, range: &KeyRange) -> Vec<Record<V>> {
        let removed = self.take_range(range);
        self.deleted_ranges.push(range.clone());
        removed
    }

    /// Remove every record and mark the whole key space as deleted
    pub fn clear(&mut self) -> Vec<Record<V>> {
        for record in &self.records {
            self.modifications.insert(record.key.clone());
        }
        self.deleted_ranges.push(KeyRange::unbounded());
        std::mem::take(&mut self.records)
    }

    /// Remove a single record without leaving a trace; used by rollback
    pub fn remove(&mut self, key: &Key) -> Option<Record<V>> {
        self.index_of_key(key).map(|i| self.records.remove(i))
    }

    fn take_range(&mut self, range: &KeyRange) -> Vec<Record<V>> {
        let start = self.start_of(range);
        let end = self.end_of(range).max(start);
        self.records.drain(start..end).collect()
    }

    /// Whether the remote copy of `key` is outdated by local changes
    pub fn modified(&self, key: &Key) -> bool {
        self.modifications.contains(key) || self.deleted_ranges.iter().any(|r| r.includes(key))
    }

    pub fn has_local_state(&self) -> bool {
        !self.records.is_empty() || !self.modifications.is_empty() || !self.deleted_ranges.is_empty()
    }

    /// Records inside `range` in the given direction. Unique directions are
    /// treated like their plain counterparts here.
    pub fn values(&self, range: Option<&KeyRange>, direction: Direction) -> Values<'_, V> {
        let (start, end) = match range {
            Some(range) => {
                let start = self.start_of(range);
                (start, self.end_of(range).max(start))
            }
            None => (0, self.records.len()),
        };
        Values {
            inner: self.records[start..end].iter(),
            forward: direction.is_forward(),
        }
    }

    /// Forget records, modifications and tombstones
    pub fn reset(&mut self) {
        self.records.clear();
        self.modifications.clear();
        self.deleted_ranges.clear();
    }
}

impl RecordStore<Key> {
    /// Remove index entries whose primary key falls in `range`. Index stores
    /// never tombstone: staleness is judged on the owning store.
    pub fn delete_by_value(&mut self, range: &KeyRange) -> Vec<Record<Key>> {
        let mut removed = Vec::new();
        self.records.retain(|r| {
            if range.includes(&r.value) {
                removed.push(r.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop all entries without tombstones
    pub fn truncate(&mut self) {
        self.records.clear();
    }
}
