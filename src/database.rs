use std::collections::BTreeMap;

use log::{debug, warn};

use crate::constants::{IndexFlags, METHOD_CLOSE_DATABASE};
use crate::env::{EngineState, Event, Task};
use crate::error::{Error, Result};
use crate::handle::ObjectStoreHandle;
use crate::index::Index;
use crate::keypath::KeyPath;
use crate::meta::StoreSchema;
use crate::object_store::ObjectStore;
use crate::protocol::{NameParams, SchemaAction, StoreAction, UpgradeAction};
use crate::request::Operation;
use crate::transaction::{Transaction, Undo};
use crate::types::{ConnectionId, TransactionId, TransactionMode, TransactionState};

/// Fired on other connections when a version change or delete is requested
pub type VersionChangeCallback = Box<dyn FnMut(&mut EngineState, ConnectionId, u64, Option<u64>)>;

/// Local view of one named database
#[derive(Debug)]
pub struct Database {
    /// Database name
    pub(crate) name: String,
    /// Current version, 0 until first upgraded
    pub(crate) version: u64,
    pub(crate) stores: BTreeMap<String, ObjectStore>,
    /// Live transactions in creation order
    pub(crate) transactions: Vec<TransactionId>,
    pub(crate) connections: Vec<ConnectionId>,
}

impl Database {
    pub(crate) fn new(name: &str, version: u64) -> Self {
        Database {
            name: name.to_string(),
            version,
            stores: BTreeMap::new(),
            transactions: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Bring stores and indexes in line with the backing store's layout
    pub(crate) fn apply_schema(&mut self, schema: &[StoreSchema]) {
        self.stores
            .retain(|name, _| schema.iter().any(|s| s.name == *name));
        for store_schema in schema {
            match self.stores.get_mut(&store_schema.name) {
                Some(store) => store.sync(store_schema),
                None => {
                    self.stores
                        .insert(store_schema.name.clone(), ObjectStore::from_schema(store_schema));
                }
            }
        }
        debug!("database {} now has stores {:?}", self.name, self.stores.keys());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) db_name: String,
    pub(crate) version: u64,
    pub(crate) closed: bool,
    /// Close requested; completes when its transactions finish
    pub(crate) close_pending: bool,
    /// The backing store counts this connection as open
    pub(crate) remote_open: bool,
    /// Upgrade transaction running on this connection
    pub(crate) upgrade: Option<TransactionId>,
    pub(crate) on_versionchange: Option<VersionChangeCallback>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, db_name: &str, version: u64) -> Self {
        Connection {
            id,
            db_name: db_name.to_string(),
            version,
            closed: false,
            close_pending: false,
            remote_open: false,
            upgrade: None,
            on_versionchange: None,
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.close_pending
    }
}

impl EngineState {
    pub fn connection_version(&self, connection: ConnectionId) -> Option<u64> {
        self.connections.get(&connection).map(|c| c.version)
    }

    pub fn connection_name(&self, connection: ConnectionId) -> Option<&str> {
        self.connections.get(&connection).map(|c| c.db_name.as_str())
    }

    /// Sorted names of the object stores visible through `connection`
    pub fn object_store_names(&self, connection: ConnectionId) -> Result<Vec<String>> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or_else(Error::invalid_state)?;
        let db = self
            .databases
            .get(&conn.db_name)
            .ok_or_else(Error::invalid_state)?;
        Ok(db.stores.keys().cloned().collect())
    }

    pub fn on_versionchange(&mut self, connection: ConnectionId, callback: VersionChangeCallback) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(Error::invalid_state)?;
        conn.on_versionchange = Some(callback);
        Ok(())
    }

    /// Close `connection` once its transactions have finished
    pub fn close(&mut self, connection: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .get_mut(&connection)
            .ok_or_else(Error::invalid_state)?;
        if conn.closed {
            return Ok(());
        }
        conn.close_pending = true;
        self.maybe_finish_close(connection);
        Ok(())
    }

    pub(crate) fn connection_is_open(&self, connection: ConnectionId) -> bool {
        self.connections.get(&connection).map_or(false, Connection::is_open)
    }

    /// Whether a connection to `db_name` other than `except` is still open
    pub(crate) fn others_open(&self, db_name: &str, except: Option<ConnectionId>) -> bool {
        self.databases.get(db_name).map_or(false, |db| {
            db.connections
                .iter()
                .any(|c| Some(*c) != except && self.connection_is_open(*c))
        })
    }

    pub(crate) fn maybe_finish_close(&mut self, connection: ConnectionId) {
        let pending = self
            .connections
            .get(&connection)
            .map_or(false, |c| c.close_pending && !c.closed);
        let busy = self.transactions.values().any(|t| t.connection == connection);
        if pending && !busy {
            self.drop_connection(connection);
        }
    }

    /// Mark `connection` closed and release it on the backing store
    pub(crate) fn drop_connection(&mut self, connection: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        if conn.closed {
            return;
        }
        conn.closed = true;
        conn.on_versionchange = None;
        let (db_name, remote_open) = (conn.db_name.clone(), conn.remote_open);
        if let Some(db) = self.databases.get_mut(&db_name) {
            db.connections.retain(|c| *c != connection);
        }
        debug!("connection {:?} to {} closed", connection, db_name);
        if remote_open {
            if let Err(err) = self
                .rpc
                .invoke::<_, ()>(METHOD_CLOSE_DATABASE, &NameParams { name: db_name })
            {
                warn!("closing connection {:?} remotely failed: {}", connection, err);
            }
        }
        self.schedule(Task::RunFactory);
    }

    /// Raise versionchange on `connection` and run its callback
    pub(crate) fn fire_versionchange(&mut self, connection: ConnectionId, old_version: u64, new_version: Option<u64>) {
        self.events.push(Event::VersionChange {
            connection,
            old_version,
            new_version,
        });
        let callback = self
            .connections
            .get_mut(&connection)
            .and_then(|c| c.on_versionchange.take());
        if let Some(mut callback) = callback {
            callback(self, connection, old_version, new_version);
            if let Some(conn) = self.connections.get_mut(&connection) {
                if conn.on_versionchange.is_none() && !conn.closed {
                    conn.on_versionchange = Some(callback);
                }
            }
        }
    }

    /// Active upgrade transaction `id`
    fn upgrade_transaction(&mut self, id: TransactionId) -> Result<&mut Transaction> {
        let txn = self.transactions.get_mut(&id).ok_or_else(|| {
            Error::InvalidState("not inside an upgrade transaction".into())
        })?;
        if txn.mode != TransactionMode::VersionChange {
            return Err(Error::InvalidState("not inside an upgrade transaction".into()));
        }
        Ok(txn)
    }

    fn upgrade_database(&mut self, id: TransactionId, store: Option<&str>) -> Result<(String, bool)> {
        let txn = self.upgrade_transaction(id)?;
        let (db_name, active) = (txn.db_name.clone(), txn.state == TransactionState::Active);
        if let Some(store) = store {
            let exists = self
                .databases
                .get(&db_name)
                .map_or(false, |db| db.stores.contains_key(store));
            if !exists {
                return Err(Error::invalid_state());
            }
        }
        Ok((db_name, active))
    }

    pub fn create_object_store(
        &mut self,
        txn: TransactionId,
        name: &str,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    ) -> Result<ObjectStoreHandle<'_>> {
        let (db_name, active) = self.upgrade_database(txn, None)?;
        if !active {
            return Err(Error::transaction_inactive());
        }
        if let Some(path) = &key_path {
            path.validate()?;
        }
        let db = self
            .databases
            .get_mut(&db_name)
            .ok_or_else(Error::invalid_state)?;
        if db.stores.contains_key(name) {
            return Err(Error::Constraint(format!("object store {} already exists", name)));
        }
        if auto_increment
            && key_path
                .as_ref()
                .map_or(false, |p| p.is_empty_path() || p.is_multiple())
        {
            return Err(Error::InvalidAccess(
                "auto-increment needs a non-empty, non-array key path".into(),
            ));
        }
        db.stores.insert(
            name.to_string(),
            ObjectStore::new(name, key_path.clone(), auto_increment),
        );
        debug!("created object store {} in {}", name, db_name);

        let transaction = self.upgrade_transaction(txn)?;
        transaction.scope.insert(name.to_string());
        transaction.rollback.push(Undo::RemoveStore {
            name: name.to_string(),
        });
        transaction.upgrade_actions.push(UpgradeAction::CreateObjectStore {
            name: name.to_string(),
            key_path,
            auto_increment,
            do_on_upgrade: Vec::new(),
        });
        Ok(ObjectStoreHandle::new(self, txn, name))
    }

    pub fn delete_object_store(&mut self, txn: TransactionId, name: &str) -> Result<()> {
        let (db_name, active) = self.upgrade_database(txn, None)?;
        if !active {
            return Err(Error::transaction_inactive());
        }
        let store = self
            .databases
            .get_mut(&db_name)
            .and_then(|db| db.stores.remove(name))
            .ok_or_else(|| Error::NotFound(format!("no object store named {}", name)))?;
        debug!("deleted object store {} from {}", name, db_name);
        self.cursors.retain(|_, c| !(c.txn == txn && c.store == name));

        let transaction = self.upgrade_transaction(txn)?;
        transaction.scope.remove(name);
        transaction.rollback.push(Undo::RestoreStore { store });
        transaction.upgrade_actions.push(UpgradeAction::DeleteObjectStore {
            name: name.to_string(),
        });
        Ok(())
    }

    pub(crate) fn rename_object_store(&mut self, txn: TransactionId, name: &str, new_name: &str) -> Result<()> {
        let (db_name, active) = self.upgrade_database(txn, Some(name))?;
        if !active {
            return Err(Error::transaction_inactive());
        }
        if name == new_name {
            return Ok(());
        }
        let db = self
            .databases
            .get_mut(&db_name)
            .ok_or_else(Error::invalid_state)?;
        if db.stores.contains_key(new_name) {
            return Err(Error::Constraint(format!("object store {} already exists", new_name)));
        }
        let Some(mut store) = db.stores.remove(name) else {
            return Err(Error::invalid_state());
        };
        store.name = new_name.to_string();
        db.stores.insert(new_name.to_string(), store);

        let transaction = self.upgrade_transaction(txn)?;
        transaction.scope.remove(name);
        transaction.scope.insert(new_name.to_string());
        transaction.rollback.push(Undo::RenameStore {
            from: new_name.to_string(),
            to: name.to_string(),
        });
        transaction.push_store_action(
            name,
            StoreAction::Schema(SchemaAction::RenameObjectStore {
                new_name: new_name.to_string(),
            }),
        );
        Ok(())
    }

    pub(crate) fn create_index(
        &mut self,
        txn: TransactionId,
        store: &str,
        name: &str,
        key_path: KeyPath,
        flags: IndexFlags,
    ) -> Result<()> {
        let (db_name, active) = self.upgrade_database(txn, Some(store))?;
        if !active {
            return Err(Error::transaction_inactive());
        }
        let object_store = self
            .databases
            .get_mut(&db_name)
            .and_then(|db| db.stores.get_mut(store))
            .ok_or_else(Error::invalid_state)?;
        if object_store.indexes.contains_key(name) {
            return Err(Error::Constraint(format!("index {} already exists", name)));
        }
        key_path.validate()?;
        let multi_entry = flags.contains(IndexFlags::MULTI_ENTRY);
        if multi_entry && key_path.is_multiple() {
            return Err(Error::InvalidAccess(
                "multi-entry indexes cannot use an array key path".into(),
            ));
        }
        object_store
            .indexes
            .insert(name.to_string(), Index::new(name, key_path.clone(), flags));
        debug!("created index {} on {}", name, store);

        let transaction = self.upgrade_transaction(txn)?;
        transaction.rollback.push(Undo::RemoveIndex {
            store: store.to_string(),
            name: name.to_string(),
        });
        transaction.push_store_action(
            store,
            StoreAction::Schema(SchemaAction::CreateIndex {
                name: name.to_string(),
                key_path,
                unique: flags.contains(IndexFlags::UNIQUE),
                multi_entry,
            }),
        );
        transaction.requests.push_back((
            None,
            Operation::InitializeIndex {
                store: store.to_string(),
                index: name.to_string(),
            },
        ));
        Ok(())
    }

    pub(crate) fn delete_index(&mut self, txn: TransactionId, store: &str, name: &str) -> Result<()> {
        let (db_name, active) = self.upgrade_database(txn, Some(store))?;
        if !active {
            return Err(Error::transaction_inactive());
        }
        let index = self
            .databases
            .get_mut(&db_name)
            .and_then(|db| db.stores.get_mut(store))
            .and_then(|s| s.indexes.remove(name))
            .ok_or_else(|| Error::NotFound(format!("no index named {}", name)))?;
        self.cursors
            .retain(|_, c| !(c.txn == txn && c.store == store && c.index.as_deref() == Some(name)));

        let transaction = self.upgrade_transaction(txn)?;
        transaction.rollback.push(Undo::RestoreIndex {
            store: store.to_string(),
            index,
        });
        transaction.push_store_action(
            store,
            StoreAction::Schema(SchemaAction::DeleteIndex {
                name: name.to_string(),
            }),
        );
        Ok(())
    }

    pub(crate) fn rename_index(&mut self, txn: TransactionId, store: &str, name: &str, new_name: &str) -> Result<()> {
        let (db_name, active) = self.upgrade_database(txn, Some(store))?;
        let object_store = self
            .databases
            .get_mut(&db_name)
            .and_then(|db| db.stores.get_mut(store))
            .ok_or_else(Error::invalid_state)?;
        if !object_store.indexes.contains_key(name) {
            return Err(Error::invalid_state());
        }
        if !active {
            return Err(Error::transaction_inactive());
        }
        if name == new_name {
            return Ok(());
        }
        if object_store.indexes.contains_key(new_name) {
            return Err(Error::Constraint(format!("index {} already exists", new_name)));
        }
        let Some(mut index) = object_store.indexes.remove(name) else {
            return Err(Error::invalid_state());
        };
        index.name = new_name.to_string();
        object_store.indexes.insert(new_name.to_string(), index);

        let transaction = self.upgrade_transaction(txn)?;
        transaction.rollback.push(Undo::RenameIndex {
            store: store.to_string(),
            from: new_name.to_string(),
            to: name.to_string(),
        });
        transaction.push_store_action(
            store,
            StoreAction::Schema(SchemaAction::RenameIndex {
                name: name.to_string(),
                new_name: new_name.to_string(),
            }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::IndexSchema;

    fn schema(name: &str, indexes: &[&str]) -> StoreSchema {
        StoreSchema {
            name: name.to_string(),
            key_path: Some(KeyPath::from("id")),
            auto_increment: true,
            key_generator: Some(7),
            indexes: indexes
                .iter()
                .map(|i| IndexSchema {
                    name: i.to_string(),
                    key_path: KeyPath::from(*i),
                    unique: false,
                    multi_entry: false,
                })
                .collect(),
        }
    }

    #[test]
    fn schema_sync_adds_and_removes() {
        let mut db = Database::new("db", 1);
        db.stores.insert("gone".into(), ObjectStore::new("gone", None, false));
        let mut local = ObjectStore::new("books", Some(KeyPath::from("id")), true);
        local
            .indexes
            .insert("draft".into(), Index::new("draft", KeyPath::from("draft"), IndexFlags::empty()));
        db.stores.insert("books".into(), local);

        db.apply_schema(&[schema("books", &["author"]), schema("authors", &[])]);

        let names: Vec<&String> = db.stores.keys().collect();
        assert_eq!(names, vec!["authors", "books"]);
        let books = &db.stores["books"];
        assert_eq!(books.remote_name.as_deref(), Some("books"));
        assert_eq!(books.index_names(), vec!["author".to_string()]);
        assert_eq!(books.key_generator.map(|g| g.current()), Some(7));
        assert!(books.indexes["author"].initialized);
    }
}
