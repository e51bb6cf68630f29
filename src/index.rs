use log::debug;

use crate::constants::IndexFlags;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::keypath::KeyPath;
use crate::merge::RemoteMergeReader;
use crate::meta::IndexSchema;
use crate::object_store::ObjectStore;
use crate::record_store::{Record, RecordStore};
use crate::types::Direction;
use crate::value::Value;

/// Index keys a value contributes under `key_path`.
///
/// Values that do not yield a valid key contribute nothing. Multi-entry
/// arrays contribute each distinct valid element.
pub fn index_keys(key_path: &KeyPath, multi_entry: bool, value: &Value) -> Vec<Key> {
    let Some(resolved) = key_path.evaluate(value) else {
        return Vec::new();
    };
    match resolved {
        Value::Array(items) if multi_entry => {
            let mut keys: Vec<Key> = items.iter().filter_map(|v| Key::try_from(v).ok()).collect();
            keys.sort();
            keys.dedup();
            keys
        }
        other => Key::try_from(&other).map(|k| vec![k]).unwrap_or_default(),
    }
}

/// Secondary index over an object store
#[derive(Debug, Clone)]
pub struct Index {
    /// Index name
    pub(crate) name: String,
    /// Name the backing store knows this index by; `None` until committed
    pub(crate) remote_name: Option<String>,
    pub(crate) key_path: KeyPath,
    pub(crate) flags: IndexFlags,
    /// Back-filled from the owning store
    pub(crate) initialized: bool,
    /// Index key -> primary key
    pub(crate) records: RecordStore<Key>,
}

impl Index {
    pub(crate) fn new(name: &str, key_path: KeyPath, flags: IndexFlags) -> Self {
        Index {
            name: name.to_string(),
            remote_name: None,
            key_path,
            flags,
            initialized: false,
            records: RecordStore::new(),
        }
    }

    pub(crate) fn from_schema(schema: &IndexSchema) -> Self {
        let mut index = Index::new(&schema.name, schema.key_path.clone(), schema.flags());
        index.remote_name = Some(schema.name.clone());
        // nothing is cached locally yet, so there is nothing to back-fill
        index.initialized = true;
        index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    pub fn is_unique(&self) -> bool {
        self.flags.contains(IndexFlags::UNIQUE)
    }

    pub fn is_multi_entry(&self) -> bool {
        self.flags.contains(IndexFlags::MULTI_ENTRY)
    }

    pub(crate) fn keys_for(&self, value: &Value) -> Vec<Key> {
        index_keys(&self.key_path, self.is_multi_entry(), value)
    }

    pub(crate) fn convert_record_to_index_records(&self, record: &Record<Value>) -> Vec<Record<Key>> {
        self.keys_for(&record.value)
            .into_iter()
            .map(|key| Record {
                key,
                value: record.key.clone(),
            })
            .collect()
    }

    /// Whether a local entry other than `primary_key` already holds `key`
    pub(crate) fn holds_key_for_other(&self, key: &Key, primary_key: &Key) -> bool {
        let range = KeyRange::from(key.clone());
        self.records
            .values(Some(&range), Direction::Next)
            .any(|r| r.value != *primary_key)
    }

    pub(crate) fn store_record(&mut self, record: &Record<Value>) {
        for entry in self.convert_record_to_index_records(record) {
            self.records.add(entry);
        }
    }

    /// Back-fill a freshly created index from the merged contents of `store`
    pub(crate) fn initialize(&mut self, reader: &mut RemoteMergeReader<'_>, store: &ObjectStore) -> Result<()> {
        let entries = reader.records(store, None, None, None, true)?;
        debug!("index {} sees {} records", self.name, entries.len());
        for entry in entries {
            let Some(value) = entry.value else {
                continue;
            };
            for key in self.keys_for(&value) {
                if self.is_unique() && self.holds_key_for_other(&key, &entry.primary_key) {
                    return Err(Error::Constraint(format!(
                        "index {} would contain {:?} more than once",
                        self.name, key
                    )));
                }
                self.records.add(Record {
                    key,
                    value: entry.primary_key.clone(),
                });
            }
        }
        self.initialized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_entry_dedups_and_skips_invalid() {
        let value = Value::object([(
            "tags",
            Value::Array(vec![
                Value::from("b"),
                Value::from("a"),
                Value::from("b"),
                Value::Null,
            ]),
        )]);
        let path = KeyPath::from("tags");
        assert_eq!(index_keys(&path, true, &value), vec![Key::from("a"), Key::from("b")]);
        // without multiEntry the whole array is one key, which is invalid here
        assert!(index_keys(&path, false, &value).is_empty());
    }

    #[test]
    fn records_point_back_to_primary_key() {
        let index = Index::new("by_author", KeyPath::from("author"), IndexFlags::UNIQUE);
        let record = Record {
            key: Key::from(1),
            value: Value::object([("author", Value::from("Herbert"))]),
        };
        let entries = index.convert_record_to_index_records(&record);
        assert_eq!(entries, vec![Record { key: Key::from("Herbert"), value: Key::from(1) }]);

        let missing = Record { key: Key::from(2), value: Value::object([("title", Value::from("x"))]) };
        assert!(index.convert_record_to_index_records(&missing).is_empty());
    }
}
