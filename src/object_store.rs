use std::collections::BTreeMap;

use log::trace;

use crate::constants::MAX_GENERATED_KEY;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::keypath::KeyPath;
use crate::merge::RemoteMergeReader;
use crate::meta::StoreSchema;
use crate::record_store::{Record, RecordStore};
use crate::transaction::Undo;
use crate::value::Value;

/// Auto-increment counter of an object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyGenerator {
    /// Last value handed out
    current: u64,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn next(&mut self) -> Result<Key> {
        if self.current >= MAX_GENERATED_KEY {
            return Err(Error::constraint());
        }
        self.current += 1;
        Ok(Key::Number(self.current as f64))
    }

    /// Make sure later keys come after an explicitly supplied one
    pub fn set_if_larger(&mut self, n: f64) {
        if n > self.current as f64 {
            self.current = n.floor().min(MAX_GENERATED_KEY as f64) as u64;
        }
    }

    pub(crate) fn restore(&mut self, current: u64) {
        self.current = current;
    }
}

/// How a store request treats an existing record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail when the key exists
    Add,
    Put,
    /// Cursor update of the record under the cursor
    Replace,
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    pub(crate) name: String,
    /// Name the backing store knows this store by; `None` until committed
    pub(crate) remote_name: Option<String>,
    pub(crate) key_path: Option<KeyPath>,
    pub(crate) key_generator: Option<KeyGenerator>,
    pub(crate) records: RecordStore<Value>,
    pub(crate) indexes: BTreeMap<String, Index>,
}

impl ObjectStore {
    pub(crate) fn new(name: &str, key_path: Option<KeyPath>, auto_increment: bool) -> Self {
        ObjectStore {
            name: name.to_string(),
            remote_name: None,
            key_path,
            key_generator: auto_increment.then(KeyGenerator::new),
            records: RecordStore::new(),
            indexes: BTreeMap::new(),
        }
    }

    pub(crate) fn from_schema(schema: &StoreSchema) -> Self {
        let mut store = ObjectStore::new(&schema.name, schema.key_path.clone(), schema.auto_increment);
        store.sync(schema);
        store
    }

    /// Adopt what the backing store reports for this store
    pub(crate) fn sync(&mut self, schema: &StoreSchema) {
        self.remote_name = Some(schema.name.clone());
        if let (Some(generator), Some(current)) = (self.key_generator.as_mut(), schema.key_generator) {
            generator.set_if_larger(current as f64);
        }
        self.indexes
            .retain(|name, _| schema.indexes.iter().any(|i| i.name == *name));
        for index_schema in &schema.indexes {
            match self.indexes.get_mut(&index_schema.name) {
                Some(index) => {
                    index.remote_name = Some(index_schema.name.clone());
                    index.initialized = true;
                }
                None => {
                    self.indexes
                        .insert(index_schema.name.clone(), Index::from_schema(index_schema));
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_path(&self) -> Option<&KeyPath> {
        self.key_path.as_ref()
    }

    pub fn auto_increment(&self) -> bool {
        self.key_generator.is_some()
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Call-site validation of a put/add
    pub(crate) fn check_input(&self, value: &Value, key: Option<&Key>) -> Result<()> {
        match (&self.key_path, key) {
            (Some(_), Some(_)) => Err(Error::Data(
                "an explicit key was supplied to a store that uses in-line keys".into(),
            )),
            (None, Some(key)) => key.validate(),
            (None, None) if self.key_generator.is_none() => Err(Error::Data(
                "no key supplied to a store without key path or key generator".into(),
            )),
            (None, None) => Ok(()),
            (Some(path), None) => match path.extract_key(value)? {
                Some(_) => Ok(()),
                None if self.key_generator.is_some() && path.can_inject(value) => Ok(()),
                None => Err(Error::data()),
            },
        }
    }

    pub(crate) fn insert_record(&mut self, record: Record<Value>) {
        for index in self.indexes.values_mut().filter(|i| i.initialized) {
            index.store_record(&record);
        }
        self.records.add(record);
    }

    /// Drop the local record and every index entry pointing at it
    pub(crate) fn remove_record(&mut self, key: &Key) -> Option<Record<Value>> {
        let single = KeyRange::from(key.clone());
        for index in self.indexes.values_mut() {
            index.records.delete_by_value(&single);
        }
        self.records.remove(key)
    }

    pub(crate) fn delete_record(&mut self, range: &KeyRange, rollback: &mut Vec<Undo>) {
        let removed = self.records.delete(range);
        for index in self.indexes.values_mut() {
            index.records.delete_by_value(range);
        }
        for record in removed {
            rollback.push(Undo::RestoreRecord {
                store: self.name.clone(),
                record,
            });
        }
    }

    pub(crate) fn clear(&mut self, rollback: &mut Vec<Undo>) {
        let removed = self.records.clear();
        for index in self.indexes.values_mut() {
            index.records.truncate();
        }
        for record in removed {
            rollback.push(Undo::RestoreRecord {
                store: self.name.clone(),
                record,
            });
        }
    }

    /// Forget the working set once the owning transaction is over
    pub(crate) fn reset(&mut self) {
        self.records.reset();
        for index in self.indexes.values_mut() {
            index.records.reset();
        }
    }
}

/// Write `value` into `store`, generating or extracting its key, enforcing
/// existence and uniqueness against both the working set and the backing
/// store. Nothing is mutated when a constraint fails.
pub(crate) fn store_record(
    reader: &mut RemoteMergeReader<'_>,
    store: &mut ObjectStore,
    mut value: Value,
    key: Option<Key>,
    no_overwrite: bool,
    rollback: &mut Vec<Undo>,
) -> Result<Record<Value>> {
    let generator_before = store.key_generator.map(|g| g.current());

    let key = match (&store.key_path, key) {
        (Some(path), _) => match path.extract_key(&value)? {
            Some(key) => key,
            None => {
                let generator = store.key_generator.as_mut().ok_or_else(Error::data)?;
                let key = generator.next()?;
                path.inject_key(&mut value, &key)?;
                key
            }
        },
        (None, Some(key)) => key,
        (None, None) => store.key_generator.as_mut().ok_or_else(Error::data)?.next()?,
    };
    if let (Some(generator), Some(n)) = (store.key_generator.as_mut(), key.as_number()) {
        generator.set_if_larger(n);
    }
    if let (Some(before), Some(generator)) = (generator_before, store.key_generator) {
        if generator.current() != before {
            rollback.push(Undo::RestoreGenerator {
                store: store.name.clone(),
                current: before,
            });
        }
    }

    let cached = store.records.get(&KeyRange::from(key.clone())).is_some();
    let exists = cached || (!store.records.modified(&key) && reader.remote_exists(store, &key)?);
    if exists && no_overwrite {
        return Err(Error::Constraint(format!("key {:?} already exists in {}", key, store.name)));
    }

    for index in store.indexes.values().filter(|i| i.initialized && i.is_unique()) {
        for index_key in index.keys_for(&value) {
            if index.holds_key_for_other(&index_key, &key)
                || reader.index_key_taken(store, index, &index_key, &key)?
            {
                return Err(Error::Constraint(format!(
                    "index {} already contains {:?}",
                    index.name, index_key
                )));
            }
        }
    }

    if let Some(old) = store.remove_record(&key) {
        rollback.push(Undo::RestoreRecord {
            store: store.name.clone(),
            record: old,
        });
    }
    trace!("storing {:?} in {}", key, store.name);
    let record = Record { key, value };
    store.insert_record(record.clone());
    rollback.push(Undo::RemoveRecord {
        store: store.name.clone(),
        key: record.key.clone(),
    });
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_monotonic() {
        let mut generator = KeyGenerator::new();
        assert_eq!(generator.next().unwrap(), Key::from(1));
        generator.set_if_larger(10.5);
        assert_eq!(generator.next().unwrap(), Key::from(11));
        generator.set_if_larger(3.0);
        assert_eq!(generator.next().unwrap(), Key::from(12));
    }

    #[test]
    fn generator_stops_at_ceiling() {
        let mut generator = KeyGenerator::new();
        generator.set_if_larger(1.0e300);
        assert_eq!(generator.current(), MAX_GENERATED_KEY);
        assert!(matches!(generator.next(), Err(Error::Constraint(_))));
    }

    #[test]
    fn input_checks() {
        let inline = ObjectStore::new("s", Some(KeyPath::from("id")), false);
        let value = Value::object([("id", Value::from(1))]);
        assert!(inline.check_input(&value, None).is_ok());
        assert!(inline.check_input(&value, Some(&Key::from(1))).is_err());
        assert!(inline.check_input(&Value::object([("x", Value::from(1))]), None).is_err());

        let generated = ObjectStore::new("s", Some(KeyPath::from("id")), true);
        assert!(generated.check_input(&Value::object([("x", Value::from(1))]), None).is_ok());
        assert!(generated.check_input(&Value::from(1), None).is_err());

        let outline = ObjectStore::new("s", None, false);
        assert!(outline.check_input(&Value::from(1), None).is_err());
        assert!(outline.check_input(&Value::from(1), Some(&Key::Number(f64::NAN))).is_err());
    }

    #[test]
    fn delete_and_clear_feed_rollback() {
        let mut store = ObjectStore::new("s", None, false);
        for k in 1..=3 {
            store.insert_record(Record { key: Key::from(k), value: Value::from(k) });
        }
        let mut rollback = Vec::new();
        store.delete_record(&KeyRange::from(Key::from(2)), &mut rollback);
        assert_eq!(rollback.len(), 1);
        store.clear(&mut rollback);
        assert_eq!(rollback.len(), 3);
        assert!(store.records.is_empty());
        assert!(store.records.modified(&Key::from(99)));
    }
}
