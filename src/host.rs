use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;
use once_cell::unsync::OnceCell;
use serde_json::Value as Json;

use crate::constants::{
    MAX_GENERATED_KEY, METHOD_CLOSE_DATABASE, METHOD_DELETE_DATABASE, METHOD_EXECUTE_READ,
    METHOD_EXECUTE_TRANSACTION, METHOD_GET_DATABASE_INFO, METHOD_GET_DATABASE_STORES,
    METHOD_OPEN_DATABASE,
};
use crate::error::{Error, Result};
use crate::index::index_keys;
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::keypath::KeyPath;
use crate::meta::{DatabaseInfo, IndexSchema, StoreSchema};
use crate::protocol::{
    Entry, ExecuteReadParams, NameParams, OpenDatabaseParams, ReadCall, SchemaAction,
    StoreAction, UpgradeAction, WriteLog, WriteOp,
};
use crate::rpc::{LoopbackChannel, RpcServer};
use crate::value::Value;

#[derive(Debug, Clone)]
struct HostIndex {
    key_path: KeyPath,
    unique: bool,
    multi_entry: bool,
    /// (index key, primary key), built on first use after each write
    entries: OnceCell<Vec<(Key, Key)>>,
}

impl HostIndex {
    fn entries(&self, records: &BTreeMap<Key, Value>) -> &Vec<(Key, Key)> {
        self.entries.get_or_init(|| {
            let mut entries: Vec<(Key, Key)> = records
                .iter()
                .flat_map(|(pk, value)| {
                    index_keys(&self.key_path, self.multi_entry, value)
                        .into_iter()
                        .map(move |k| (k, pk.clone()))
                })
                .collect();
            entries.sort();
            entries
        })
    }

    fn has_duplicates(&self, records: &BTreeMap<Key, Value>) -> bool {
        self.entries(records)
            .windows(2)
            .any(|pair| pair[0].0 == pair[1].0 && pair[0].1 != pair[1].1)
    }
}

#[derive(Debug, Clone)]
struct HostStore {
    key_path: Option<KeyPath>,
    auto_increment: bool,
    generator: u64,
    records: BTreeMap<Key, Value>,
    indexes: BTreeMap<String, HostIndex>,
}

impl HostStore {
    fn new(key_path: Option<KeyPath>, auto_increment: bool) -> Self {
        HostStore {
            key_path,
            auto_increment,
            generator: 0,
            records: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    fn schema(&self, name: &str) -> StoreSchema {
        StoreSchema {
            name: name.to_string(),
            key_path: self.key_path.clone(),
            auto_increment: self.auto_increment,
            key_generator: self.auto_increment.then_some(self.generator),
            indexes: self
                .indexes
                .iter()
                .map(|(name, index)| IndexSchema {
                    name: name.clone(),
                    key_path: index.key_path.clone(),
                    unique: index.unique,
                    multi_entry: index.multi_entry,
                })
                .collect(),
        }
    }

    /// (key, primary key) pairs in ascending order
    fn rows(&self, index_name: Option<&str>, range: Option<&KeyRange>) -> Result<Vec<(Key, Key)>> {
        if let Some(range) = range {
            range.validate()?;
        }
        match index_name {
            Some(name) => {
                let index = self.indexes.get(name).ok_or_else(Error::not_found)?;
                Ok(index
                    .entries(&self.records)
                    .iter()
                    .filter(|(k, _)| range.map_or(true, |r| r.includes(k)))
                    .cloned()
                    .collect())
            }
            None => {
                let unbounded = KeyRange::unbounded();
                let range = range.unwrap_or(&unbounded);
                Ok(self
                    .records
                    .range(range.bounds())
                    .map(|(k, _)| (k.clone(), k.clone()))
                    .collect())
            }
        }
    }

    fn entry(&self, key: Key, primary_key: Key, values: bool) -> Entry {
        let value = if values {
            self.records.get(&primary_key).cloned()
        } else {
            None
        };
        Entry {
            key,
            primary_key,
            value,
        }
    }

    fn read(&self, call: ReadCall) -> Result<Json> {
        match call {
            ReadCall::GetAll {
                index_name,
                query,
                count,
                after,
                values,
            } => {
                let limit = count.map_or(usize::MAX, |c| c as usize);
                let entries: Vec<Entry> = self
                    .rows(index_name.as_deref(), query.as_ref())?
                    .into_iter()
                    .filter(|(k, pk)| {
                        after
                            .as_ref()
                            .map_or(true, |a| a.compare(k, pk) == std::cmp::Ordering::Greater)
                    })
                    .take(limit)
                    .map(|(k, pk)| self.entry(k, pk, values))
                    .collect();
                Ok(serde_json::to_value(entries)?)
            }
            ReadCall::Count { index_name, query } => {
                let count = self.rows(index_name.as_deref(), query.as_ref())?.len() as u64;
                Ok(serde_json::to_value(count)?)
            }
            ReadCall::GetNextFromCursor {
                index_name,
                seek,
                values,
            } => {
                let rows = self.rows(index_name.as_deref(), seek.range.as_ref())?;
                let found = if seek.direction.is_forward() {
                    rows.into_iter().find(|(k, pk)| seek.admits(k, pk))
                } else {
                    rows.into_iter().rev().find(|(k, pk)| seek.admits(k, pk))
                };
                let entry = found.map(|(k, pk)| self.entry(k, pk, values));
                Ok(serde_json::to_value(entry)?)
            }
        }
    }

    fn check_unique(&self, key: &Key, value: &Value) -> Result<()> {
        for index in self.indexes.values().filter(|i| i.unique) {
            let entries = index.entries(&self.records);
            for index_key in index_keys(&index.key_path, index.multi_entry, value) {
                let start = entries.partition_point(|(k, _)| *k < index_key);
                let taken = entries[start..]
                    .iter()
                    .take_while(|(k, _)| *k == index_key)
                    .any(|(_, pk)| pk != key);
                if taken {
                    return Err(Error::constraint());
                }
            }
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        for index in self.indexes.values_mut() {
            index.entries.take();
        }
    }

    fn bump_generator(&mut self, key: &Key) {
        if let (true, Some(n)) = (self.auto_increment, key.as_number()) {
            if n > self.generator as f64 {
                self.generator = n.floor().min(MAX_GENERATED_KEY as f64) as u64;
            }
        }
    }

    fn insert(&mut self, key: Key, value: Value) -> Result<()> {
        self.check_unique(&key, &value)?;
        self.bump_generator(&key);
        self.records.insert(key, value);
        self.invalidate();
        Ok(())
    }

    fn apply_write(&mut self, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::Add { key, value } => {
                if self.records.contains_key(&key) {
                    return Err(Error::constraint());
                }
                self.insert(key, value)
            }
            // a cursor update may land on a record the same transaction deleted
            WriteOp::Put { key, value } | WriteOp::Replace { key, value } => self.insert(key, value),
            WriteOp::Delete { query } => {
                query.validate()?;
                self.records.retain(|k, _| !query.includes(k));
                self.invalidate();
                Ok(())
            }
            WriteOp::Clear => {
                self.records.clear();
                self.invalidate();
                Ok(())
            }
        }
    }

    fn apply_schema(&mut self, action: SchemaAction) -> Result<()> {
        match action {
            SchemaAction::CreateIndex {
                name,
                key_path,
                unique,
                multi_entry,
            } => {
                if self.indexes.contains_key(&name) {
                    return Err(Error::constraint());
                }
                let index = HostIndex {
                    key_path,
                    unique,
                    multi_entry,
                    entries: OnceCell::new(),
                };
                if unique && index.has_duplicates(&self.records) {
                    return Err(Error::constraint());
                }
                self.indexes.insert(name, index);
                Ok(())
            }
            SchemaAction::DeleteIndex { name } => self
                .indexes
                .remove(&name)
                .map(|_| ())
                .ok_or_else(Error::not_found),
            SchemaAction::RenameIndex { name, new_name } => {
                if self.indexes.contains_key(&new_name) {
                    return Err(Error::constraint());
                }
                let index = self.indexes.remove(&name).ok_or_else(Error::not_found)?;
                self.indexes.insert(new_name, index);
                Ok(())
            }
            SchemaAction::RenameObjectStore { .. } => Err(Error::invalid_state()),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct HostDatabase {
    version: u64,
    stores: BTreeMap<String, HostStore>,
}

impl HostDatabase {
    fn schema(&self) -> Vec<StoreSchema> {
        self.stores
            .iter()
            .map(|(name, store)| store.schema(name))
            .collect()
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut HostStore> {
        self.stores.get_mut(name).ok_or_else(Error::not_found)
    }

    fn apply_store_actions(&mut self, mut name: String, actions: Vec<StoreAction>) -> Result<()> {
        for action in actions {
            match action {
                StoreAction::Schema(SchemaAction::RenameObjectStore { new_name }) => {
                    if self.stores.contains_key(&new_name) {
                        return Err(Error::constraint());
                    }
                    let store = self.stores.remove(&name).ok_or_else(Error::not_found)?;
                    self.stores.insert(new_name.clone(), store);
                    name = new_name;
                }
                StoreAction::Schema(schema) => self.store_mut(&name)?.apply_schema(schema)?,
                StoreAction::Write(op) => self.store_mut(&name)?.apply_write(op)?,
            }
        }
        Ok(())
    }

    fn apply_upgrade(&mut self, action: UpgradeAction) -> Result<()> {
        match action {
            UpgradeAction::CreateObjectStore {
                name,
                key_path,
                auto_increment,
                do_on_upgrade,
            } => {
                if self.stores.contains_key(&name) {
                    return Err(Error::constraint());
                }
                self.stores
                    .insert(name.clone(), HostStore::new(key_path, auto_increment));
                self.apply_store_actions(name, do_on_upgrade)
            }
            UpgradeAction::DeleteObjectStore { name } => self
                .stores
                .remove(&name)
                .map(|_| ())
                .ok_or_else(Error::not_found),
            UpgradeAction::ModifyObjectStore {
                name,
                do_on_upgrade,
            } => {
                self.store_mut(&name)?;
                self.apply_store_actions(name, do_on_upgrade)
            }
        }
    }
}

/// Reference backing store kept in memory.
///
/// Upgrades and write logs are applied to a copy of the database, which is
/// swapped in only when every action succeeded.
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    databases: BTreeMap<String, HostDatabase>,
    open_connections: BTreeMap<String, u32>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_database(&mut self, params: OpenDatabaseParams) -> Result<Vec<StoreSchema>> {
        let current = self.databases.get(&params.name);
        let current_version = current.map_or(0, |db| db.version);
        if params.version < current_version {
            return Err(Error::version());
        }
        if params.version > current_version || !params.do_on_upgrade.is_empty() {
            let mut next = current.cloned().unwrap_or_default();
            for action in params.do_on_upgrade {
                next.apply_upgrade(action)?;
            }
            next.version = params.version;
            debug!(
                "backing store upgraded {} from {} to {}",
                params.name, current_version, params.version
            );
            self.databases.insert(params.name.clone(), next);
        }
        *self.open_connections.entry(params.name.clone()).or_default() += 1;
        Ok(self
            .databases
            .get(&params.name)
            .map(HostDatabase::schema)
            .unwrap_or_default())
    }

    pub fn close_database(&mut self, name: &str) {
        if let Some(count) = self.open_connections.get_mut(name) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn delete_database(&mut self, name: &str) {
        debug!("backing store deleting {}", name);
        self.databases.remove(name);
        self.open_connections.remove(name);
    }

    pub fn database_info(&self) -> Vec<DatabaseInfo> {
        self.databases
            .iter()
            .map(|(name, db)| DatabaseInfo {
                name: name.clone(),
                version: db.version,
            })
            .collect()
    }

    pub fn database_stores(&self, name: &str) -> Vec<StoreSchema> {
        self.databases
            .get(name)
            .map(HostDatabase::schema)
            .unwrap_or_default()
    }

    pub fn execute_read(&self, params: ExecuteReadParams) -> Result<Json> {
        let db = self.databases.get(&params.db_name).ok_or_else(Error::not_found)?;
        let store = db.stores.get(&params.store).ok_or_else(Error::not_found)?;
        store.read(params.call)
    }

    pub fn execute_transaction(&mut self, log: WriteLog) -> Result<()> {
        let db = self.databases.get(&log.db_name).ok_or_else(Error::not_found)?;
        let mut next = db.clone();
        for (store, ops) in log.ops {
            let store = next.store_mut(&store)?;
            for op in ops {
                store.apply_write(op)?;
            }
        }
        self.databases.insert(log.db_name, next);
        Ok(())
    }

    pub fn version(&self, name: &str) -> Option<u64> {
        self.databases.get(name).map(|db| db.version)
    }

    pub fn open_connections(&self, name: &str) -> u32 {
        self.open_connections.get(name).copied().unwrap_or(0)
    }

    /// Committed record, if any
    pub fn get(&self, db: &str, store: &str, key: &Key) -> Option<Value> {
        self.databases.get(db)?.stores.get(store)?.records.get(key).cloned()
    }

    pub fn keys(&self, db: &str, store: &str) -> Vec<Key> {
        self.databases
            .get(db)
            .and_then(|db| db.stores.get(store))
            .map(|s| s.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Register every backing-store method on `server`
    pub fn install(host: &Rc<RefCell<Self>>, server: &mut RpcServer) {
        let h = Rc::clone(host);
        server.handle(METHOD_OPEN_DATABASE, move |p: OpenDatabaseParams| {
            h.borrow_mut().open_database(p)
        });
        let h = Rc::clone(host);
        server.handle(METHOD_CLOSE_DATABASE, move |p: NameParams| {
            h.borrow_mut().close_database(&p.name);
            Ok(())
        });
        let h = Rc::clone(host);
        server.handle(METHOD_DELETE_DATABASE, move |p: NameParams| {
            h.borrow_mut().delete_database(&p.name);
            Ok(())
        });
        let h = Rc::clone(host);
        server.handle(METHOD_GET_DATABASE_INFO, move |_: ()| Ok(h.borrow().database_info()));
        let h = Rc::clone(host);
        server.handle(METHOD_GET_DATABASE_STORES, move |p: NameParams| {
            Ok(h.borrow().database_stores(&p.name))
        });
        let h = Rc::clone(host);
        server.handle(METHOD_EXECUTE_READ, move |p: ExecuteReadParams| h.borrow().execute_read(p));
        let h = Rc::clone(host);
        server.handle(METHOD_EXECUTE_TRANSACTION, move |log: WriteLog| {
            h.borrow_mut().execute_transaction(log)
        });
    }

    /// Channel whose far end is served by `host`
    pub fn loopback(host: &Rc<RefCell<Self>>) -> LoopbackChannel {
        let mut server = RpcServer::new();
        Self::install(host, &mut server);
        LoopbackChannel::new(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{Position, Seek};
    use crate::types::Direction;

    fn library() -> MemoryBackingStore {
        let mut host = MemoryBackingStore::new();
        host.open_database(OpenDatabaseParams {
            name: "lib".into(),
            version: 1,
            do_on_upgrade: vec![UpgradeAction::CreateObjectStore {
                name: "books".into(),
                key_path: Some(KeyPath::from("id")),
                auto_increment: true,
                do_on_upgrade: vec![StoreAction::Schema(SchemaAction::CreateIndex {
                    name: "by_author".into(),
                    key_path: KeyPath::from("author"),
                    unique: false,
                    multi_entry: false,
                })],
            }],
        })
        .unwrap();
        let mut log = WriteLog::new("lib");
        log.ops.insert(
            "books".into(),
            [(1, "b"), (2, "a"), (3, "b")]
                .into_iter()
                .map(|(id, author)| WriteOp::Put {
                    key: Key::from(id),
                    value: Value::object([("id", Value::from(id)), ("author", Value::from(author))]),
                })
                .collect(),
        );
        host.execute_transaction(log).unwrap();
        host
    }

    fn read(host: &MemoryBackingStore, call: ReadCall) -> Json {
        host.execute_read(ExecuteReadParams {
            db_name: "lib".into(),
            store: "books".into(),
            call,
        })
        .unwrap()
    }

    #[test]
    fn index_reads_order_by_key_then_primary_key() {
        let host = library();
        let json = read(
            &host,
            ReadCall::GetAll {
                index_name: Some("by_author".into()),
                query: None,
                count: None,
                after: None,
                values: false,
            },
        );
        let entries: Vec<Entry> = serde_json::from_value(json).unwrap();
        let pks: Vec<Key> = entries.into_iter().map(|e| e.primary_key).collect();
        assert_eq!(pks, vec![Key::from(2), Key::from(1), Key::from(3)]);
    }

    #[test]
    fn get_all_resumes_after_position() {
        let host = library();
        let json = read(
            &host,
            ReadCall::GetAll {
                index_name: Some("by_author".into()),
                query: None,
                count: Some(1),
                after: Some(Position {
                    key: Key::from("b"),
                    primary_key: Some(Key::from(1)),
                }),
                values: true,
            },
        );
        let entries: Vec<Entry> = serde_json::from_value(json).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].primary_key, Key::from(3));
        assert!(entries[0].value.is_some());
    }

    #[test]
    fn cursor_seek_walks_backwards() {
        let host = library();
        let json = read(
            &host,
            ReadCall::GetNextFromCursor {
                index_name: None,
                seek: Seek {
                    range: None,
                    direction: Direction::Prev,
                    after: Some(Position {
                        key: Key::from(3),
                        primary_key: None,
                    }),
                    from: None,
                },
                values: false,
            },
        );
        let entry: Option<Entry> = serde_json::from_value(json).unwrap();
        assert_eq!(entry.map(|e| e.key), Some(Key::from(2)));
    }

    #[test]
    fn failed_write_log_leaves_store_untouched() {
        let mut host = library();
        let mut log = WriteLog::new("lib");
        log.ops.insert(
            "books".into(),
            vec![
                WriteOp::Delete {
                    query: KeyRange::from(Key::from(1)),
                },
                WriteOp::Add {
                    key: Key::from(2),
                    value: Value::object([("id", Value::from(2))]),
                },
            ],
        );
        assert!(matches!(host.execute_transaction(log), Err(Error::Constraint(_))));
        assert_eq!(host.keys("lib", "books").len(), 3);
    }

    #[test]
    fn lower_version_is_rejected_and_generator_tracks_keys() {
        let mut host = library();
        let err = host
            .open_database(OpenDatabaseParams {
                name: "lib".into(),
                version: 0,
                do_on_upgrade: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Version(_)));
        assert_eq!(host.database_stores("lib")[0].key_generator, Some(3));
    }

    #[test]
    fn unique_index_creation_fails_on_duplicates() {
        let mut host = library();
        let err = host
            .open_database(OpenDatabaseParams {
                name: "lib".into(),
                version: 2,
                do_on_upgrade: vec![UpgradeAction::ModifyObjectStore {
                    name: "books".into(),
                    do_on_upgrade: vec![StoreAction::Schema(SchemaAction::CreateIndex {
                        name: "author".into(),
                        key_path: KeyPath::from("author"),
                        unique: true,
                        multi_entry: false,
                    })],
                }],
            })
            .unwrap_err();
        assert!(matches!(err, Error::Constraint(_)));
        assert_eq!(host.version("lib"), Some(1));
    }
}
