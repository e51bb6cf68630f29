//! Borrowed handles that issue requests against one object store or index.

use crate::constants::IndexFlags;
use crate::cursor::Cursor;
use crate::env::EngineState;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::keypath::KeyPath;
use crate::object_store::{ObjectStore, WriteMode};
use crate::request::{Operation, ReadShape};
use crate::types::{CursorId, CursorKind, Direction, RequestId, TransactionId, TransactionMode, TransactionState};
use crate::value::Value;

/// Store (and optionally index) a request targets, after the common checks
fn checked_source<'a>(
    engine: &'a EngineState,
    txn: TransactionId,
    store: &str,
    index: Option<&str>,
    write: bool,
) -> Result<&'a ObjectStore> {
    let transaction = engine
        .transactions
        .get(&txn)
        .ok_or_else(Error::transaction_inactive)?;
    let object_store = engine
        .databases
        .get(&transaction.db_name)
        .and_then(|db| db.stores.get(store))
        .ok_or_else(|| Error::InvalidState(format!("object store {} was deleted", store)))?;
    if let Some(index) = index {
        if !object_store.indexes.contains_key(index) {
            return Err(Error::InvalidState(format!("index {} was deleted", index)));
        }
    }
    if transaction.state != TransactionState::Active {
        return Err(Error::transaction_inactive());
    }
    if write && transaction.mode == TransactionMode::ReadOnly {
        return Err(Error::read_only());
    }
    Ok(object_store)
}

fn checked_range(query: Option<KeyRange>) -> Result<Option<KeyRange>> {
    if let Some(range) = &query {
        range.validate()?;
    }
    Ok(query)
}

/// Zero means no limit
fn normalize_count(count: Option<u32>) -> Option<usize> {
    count.filter(|c| *c > 0).map(|c| c as usize)
}

fn read(
    engine: &mut EngineState,
    txn: TransactionId,
    store: &str,
    index: Option<&str>,
    range: Option<KeyRange>,
    shape: ReadShape,
) -> Result<RequestId> {
    checked_source(engine, txn, store, index, false)?;
    let range = checked_range(range)?;
    engine.enqueue(
        txn,
        Operation::Read {
            store: store.to_string(),
            index: index.map(str::to_string),
            range,
            shape,
        },
    )
}

fn open_cursor(
    engine: &mut EngineState,
    txn: TransactionId,
    store: &str,
    index: Option<&str>,
    range: Option<KeyRange>,
    direction: Direction,
    kind: CursorKind,
) -> Result<RequestId> {
    checked_source(engine, txn, store, index, false)?;
    let range = checked_range(range)?;
    let id = CursorId(engine.next_id());
    let request = RequestId(engine.next_id());
    engine.enqueue_as(
        txn,
        request,
        Operation::Iterate {
            cursor: id,
            key: None,
            primary_key: None,
            steps: 1,
        },
    )?;
    engine.cursors.insert(
        id,
        Cursor {
            id,
            txn,
            store: store.to_string(),
            index: index.map(str::to_string),
            range,
            direction,
            kind,
            request,
            key: None,
            primary_key: None,
            value: None,
            got_value: false,
        },
    );
    Ok(request)
}

pub struct ObjectStoreHandle<'e> {
    engine: &'e mut EngineState,
    txn: TransactionId,
    name: String,
}

impl<'e> ObjectStoreHandle<'e> {
    pub(crate) fn new(engine: &'e mut EngineState, txn: TransactionId, name: &str) -> Self {
        ObjectStoreHandle {
            engine,
            txn,
            name: name.to_string(),
        }
    }

    fn store(&self) -> Result<&ObjectStore> {
        let db_name = self
            .engine
            .transactions
            .get(&self.txn)
            .map(|t| t.db_name.as_str())
            .ok_or_else(Error::invalid_state)?;
        self.engine
            .databases
            .get(db_name)
            .and_then(|db| db.stores.get(&self.name))
            .ok_or_else(Error::invalid_state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction(&self) -> TransactionId {
        self.txn
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.store().ok().and_then(|s| s.key_path().cloned())
    }

    pub fn auto_increment(&self) -> bool {
        self.store().map_or(false, ObjectStore::auto_increment)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.store().map(ObjectStore::index_names).unwrap_or_default()
    }

    fn store_request(&mut self, value: Value, key: Option<Key>, mode: WriteMode) -> Result<RequestId> {
        let store = checked_source(self.engine, self.txn, &self.name, None, true)?;
        store.check_input(&value, key.as_ref())?;
        self.engine.enqueue(
            self.txn,
            Operation::Store {
                store: self.name.clone(),
                value,
                key,
                mode,
            },
        )
    }

    /// Insert or overwrite; settles with the record's key
    pub fn put(&mut self, value: Value, key: Option<Key>) -> Result<RequestId> {
        self.store_request(value, key, WriteMode::Put)
    }

    /// Insert; settles with ConstraintError when the key exists
    pub fn add(&mut self, value: Value, key: Option<Key>) -> Result<RequestId> {
        self.store_request(value, key, WriteMode::Add)
    }

    pub fn get(&mut self, query: impl Into<KeyRange>) -> Result<RequestId> {
        read(self.engine, self.txn, &self.name, None, Some(query.into()), ReadShape::Value)
    }

    pub fn get_key(&mut self, query: impl Into<KeyRange>) -> Result<RequestId> {
        read(self.engine, self.txn, &self.name, None, Some(query.into()), ReadShape::Key)
    }

    pub fn get_all(&mut self, query: Option<KeyRange>, count: Option<u32>) -> Result<RequestId> {
        let shape = ReadShape::AllValues(normalize_count(count));
        read(self.engine, self.txn, &self.name, None, query, shape)
    }

    pub fn get_all_keys(&mut self, query: Option<KeyRange>, count: Option<u32>) -> Result<RequestId> {
        let shape = ReadShape::AllKeys(normalize_count(count));
        read(self.engine, self.txn, &self.name, None, query, shape)
    }

    pub fn count(&mut self, query: Option<KeyRange>) -> Result<RequestId> {
        read(self.engine, self.txn, &self.name, None, query, ReadShape::Count)
    }

    pub fn delete(&mut self, query: impl Into<KeyRange>) -> Result<RequestId> {
        checked_source(self.engine, self.txn, &self.name, None, true)?;
        let range = query.into();
        range.validate()?;
        self.engine.enqueue(
            self.txn,
            Operation::Delete {
                store: self.name.clone(),
                range,
            },
        )
    }

    pub fn clear(&mut self) -> Result<RequestId> {
        checked_source(self.engine, self.txn, &self.name, None, true)?;
        self.engine.enqueue(
            self.txn,
            Operation::Clear {
                store: self.name.clone(),
            },
        )
    }

    /// Settles with the cursor once it lands on the first entry
    pub fn open_cursor(&mut self, query: Option<KeyRange>, direction: Direction) -> Result<RequestId> {
        open_cursor(self.engine, self.txn, &self.name, None, query, direction, CursorKind::WithValue)
    }

    pub fn open_key_cursor(&mut self, query: Option<KeyRange>, direction: Direction) -> Result<RequestId> {
        open_cursor(self.engine, self.txn, &self.name, None, query, direction, CursorKind::KeyOnly)
    }

    pub fn index(&mut self, name: &str) -> Result<IndexHandle<'_>> {
        let store = self.store()?;
        if !store.indexes.contains_key(name) {
            return Err(Error::NotFound(format!("no index named {}", name)));
        }
        Ok(IndexHandle {
            engine: &mut *self.engine,
            txn: self.txn,
            store: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Upgrade only
    pub fn create_index(&mut self, name: &str, key_path: impl Into<KeyPath>, flags: IndexFlags) -> Result<IndexHandle<'_>> {
        self.engine
            .create_index(self.txn, &self.name, name, key_path.into(), flags)?;
        Ok(IndexHandle {
            engine: &mut *self.engine,
            txn: self.txn,
            store: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Upgrade only
    pub fn delete_index(&mut self, name: &str) -> Result<()> {
        self.engine.delete_index(self.txn, &self.name, name)
    }

    /// Upgrade only
    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        self.engine
            .rename_object_store(self.txn, &self.name, new_name)?;
        self.name = new_name.to_string();
        Ok(())
    }
}

pub struct IndexHandle<'e> {
    engine: &'e mut EngineState,
    txn: TransactionId,
    store: String,
    name: String,
}

impl<'e> IndexHandle<'e> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_store_name(&self) -> &str {
        &self.store
    }

    fn flags(&self) -> Option<(KeyPath, bool, bool)> {
        let db_name = &self.engine.transactions.get(&self.txn)?.db_name;
        let index = self
            .engine
            .databases
            .get(db_name)?
            .stores
            .get(&self.store)?
            .indexes
            .get(&self.name)?;
        Some((index.key_path().clone(), index.is_unique(), index.is_multi_entry()))
    }

    pub fn key_path(&self) -> Option<KeyPath> {
        self.flags().map(|(path, _, _)| path)
    }

    pub fn unique(&self) -> bool {
        self.flags().map_or(false, |(_, unique, _)| unique)
    }

    pub fn multi_entry(&self) -> bool {
        self.flags().map_or(false, |(_, _, multi)| multi)
    }

    fn read(&mut self, range: Option<KeyRange>, shape: ReadShape) -> Result<RequestId> {
        read(self.engine, self.txn, &self.store, Some(&self.name), range, shape)
    }

    /// Value of the first record whose index key is in `query`
    pub fn get(&mut self, query: impl Into<KeyRange>) -> Result<RequestId> {
        self.read(Some(query.into()), ReadShape::Value)
    }

    /// Primary key of the first record whose index key is in `query`
    pub fn get_key(&mut self, query: impl Into<KeyRange>) -> Result<RequestId> {
        self.read(Some(query.into()), ReadShape::Key)
    }

    pub fn get_all(&mut self, query: Option<KeyRange>, count: Option<u32>) -> Result<RequestId> {
        self.read(query, ReadShape::AllValues(normalize_count(count)))
    }

    pub fn get_all_keys(&mut self, query: Option<KeyRange>, count: Option<u32>) -> Result<RequestId> {
        self.read(query, ReadShape::AllKeys(normalize_count(count)))
    }

    pub fn count(&mut self, query: Option<KeyRange>) -> Result<RequestId> {
        self.read(query, ReadShape::Count)
    }

    pub fn open_cursor(&mut self, query: Option<KeyRange>, direction: Direction) -> Result<RequestId> {
        open_cursor(
            self.engine,
            self.txn,
            &self.store,
            Some(&self.name),
            query,
            direction,
            CursorKind::WithValue,
        )
    }

    pub fn open_key_cursor(&mut self, query: Option<KeyRange>, direction: Direction) -> Result<RequestId> {
        open_cursor(
            self.engine,
            self.txn,
            &self.store,
            Some(&self.name),
            query,
            direction,
            CursorKind::KeyOnly,
        )
    }

    /// Upgrade only
    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        self.engine
            .rename_index(self.txn, &self.store, &self.name, new_name)?;
        self.name = new_name.to_string();
        Ok(())
    }
}
