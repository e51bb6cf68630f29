use std::collections::{BTreeSet, VecDeque};
use std::mem;

use log::{debug, warn};

use crate::constants::{TransactionFlags, METHOD_EXECUTE_TRANSACTION, METHOD_OPEN_DATABASE};
use crate::database::Database;
use crate::env::{EngineState, Event, Task};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::Key;
use crate::meta::StoreSchema;
use crate::object_store::ObjectStore;
use crate::protocol::{OpenDatabaseParams, StoreAction, UpgradeAction, WriteLog, WriteOp};
use crate::record_store::Record;
use crate::request::{Disposition, Operation};
use crate::types::{ConnectionId, RequestId, TransactionId, TransactionMode, TransactionState};
use crate::value::Value;

/// Inverse of one mutation, applied newest first on abort
#[derive(Debug, Clone)]
pub(crate) enum Undo {
    RemoveRecord { store: String, key: Key },
    RestoreRecord { store: String, record: Record<Value> },
    RestoreGenerator { store: String, current: u64 },
    RemoveStore { name: String },
    RestoreStore { store: ObjectStore },
    RenameStore { from: String, to: String },
    RemoveIndex { store: String, name: String },
    RestoreIndex { store: String, index: Index },
    RenameIndex { store: String, from: String, to: String },
    RestoreVersion { version: u64 },
}

impl Undo {
    pub(crate) fn apply(self, db: &mut Database) {
        match self {
            Undo::RemoveRecord { store, key } => {
                if let Some(store) = db.stores.get_mut(&store) {
                    store.remove_record(&key);
                }
            }
            Undo::RestoreRecord { store, record } => {
                if let Some(store) = db.stores.get_mut(&store) {
                    store.insert_record(record);
                }
            }
            Undo::RestoreGenerator { store, current } => {
                if let Some(generator) = db
                    .stores
                    .get_mut(&store)
                    .and_then(|s| s.key_generator.as_mut())
                {
                    generator.restore(current);
                }
            }
            Undo::RemoveStore { name } => {
                db.stores.remove(&name);
            }
            Undo::RestoreStore { store } => {
                db.stores.insert(store.name.clone(), store);
            }
            Undo::RenameStore { from, to } => {
                if let Some(mut store) = db.stores.remove(&from) {
                    store.name = to.clone();
                    db.stores.insert(to, store);
                }
            }
            Undo::RemoveIndex { store, name } => {
                if let Some(store) = db.stores.get_mut(&store) {
                    store.indexes.remove(&name);
                }
            }
            Undo::RestoreIndex { store, index } => {
                if let Some(store) = db.stores.get_mut(&store) {
                    store.indexes.insert(index.name.clone(), index);
                }
            }
            Undo::RenameIndex { store, from, to } => {
                if let Some(store) = db.stores.get_mut(&store) {
                    if let Some(mut index) = store.indexes.remove(&from) {
                        index.name = to.clone();
                        store.indexes.insert(to, index);
                    }
                }
            }
            Undo::RestoreVersion { version } => db.version = version,
        }
    }
}

/// Unit of work over a fixed set of object stores
pub struct Transaction {
    /// Transaction ID
    pub(crate) id: TransactionId,
    /// Connection that created the transaction
    pub(crate) connection: ConnectionId,
    pub(crate) db_name: String,
    pub(crate) mode: TransactionMode,
    /// Object stores the transaction may touch
    pub(crate) scope: BTreeSet<String>,
    pub(crate) state: TransactionState,
    pub(crate) flags: TransactionFlags,
    /// Queued operations, with the request each one settles
    pub(crate) requests: VecDeque<(Option<RequestId>, Operation)>,
    pub(crate) rollback: Vec<Undo>,
    /// Writes shipped on commit of an ordinary transaction
    pub(crate) write_log: WriteLog,
    /// Schema and write actions shipped on commit of an upgrade
    pub(crate) upgrade_actions: Vec<UpgradeAction>,
    pub(crate) error: Option<Error>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        connection: ConnectionId,
        db_name: &str,
        mode: TransactionMode,
        scope: BTreeSet<String>,
    ) -> Self {
        Transaction {
            id,
            connection,
            db_name: db_name.to_string(),
            mode,
            scope,
            state: TransactionState::Active,
            flags: TransactionFlags::empty(),
            requests: VecDeque::new(),
            rollback: Vec::new(),
            write_log: WriteLog::new(db_name),
            upgrade_actions: Vec::new(),
            error: None,
        }
    }

    /// Log a resolved write against `store`
    pub(crate) fn record_write(&mut self, store: &str, op: WriteOp) {
        self.flags.insert(TransactionFlags::DIRTY);
        if self.mode == TransactionMode::VersionChange {
            self.push_store_action(store, StoreAction::Write(op));
        } else {
            self.write_log.ops.entry(store.to_string()).or_default().push(op);
        }
    }

    /// Append to the upgrade action of `store`, opening a new one unless the
    /// latest action already targets it, so replay order matches call order
    pub(crate) fn push_store_action(&mut self, store: &str, action: StoreAction) {
        let reuse = matches!(
            self.upgrade_actions.last(),
            Some(UpgradeAction::CreateObjectStore { name, .. })
                | Some(UpgradeAction::ModifyObjectStore { name, .. }) if name == store
        );
        if !reuse {
            self.upgrade_actions.push(UpgradeAction::ModifyObjectStore {
                name: store.to_string(),
                do_on_upgrade: Vec::new(),
            });
        }
        if let Some(
            UpgradeAction::CreateObjectStore { do_on_upgrade, .. }
            | UpgradeAction::ModifyObjectStore { do_on_upgrade, .. },
        ) = self.upgrade_actions.last_mut()
        {
            do_on_upgrade.push(action);
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }
}

impl EngineState {
    pub(crate) fn create_transaction(
        &mut self,
        connection: ConnectionId,
        db_name: &str,
        scope: BTreeSet<String>,
        mode: TransactionMode,
    ) -> TransactionId {
        let id = TransactionId(self.next_id());
        debug!("transaction {:?} ({:?}) on {} over {:?}", id, mode, db_name, scope);
        self.transactions
            .insert(id, Transaction::new(id, connection, db_name, mode, scope));
        if let Some(db) = self.databases.get_mut(db_name) {
            db.transactions.push(id);
        }
        self.schedule(Task::ProcessTransactions(db_name.to_string()));
        id
    }

    /// Admit the oldest waiting transaction of `db_name` once none is running
    pub(crate) fn process_transactions(&mut self, db_name: &str) {
        let Some(db) = self.databases.get(db_name) else {
            return;
        };
        let mut waiting = None;
        for id in &db.transactions {
            let Some(txn) = self.transactions.get(id) else {
                continue;
            };
            if txn.flags.contains(TransactionFlags::STARTED) {
                return;
            }
            if waiting.is_none() {
                waiting = Some(*id);
            }
        }
        if let Some(id) = waiting {
            if let Some(txn) = self.transactions.get_mut(&id) {
                txn.flags.insert(TransactionFlags::STARTED);
                debug!("starting transaction {:?}", id);
            }
            self.schedule(Task::Step(id));
        }
    }

    /// Run one queued request, or commit once the queue has drained
    pub(crate) fn step_transaction(&mut self, id: TransactionId) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if matches!(txn.state, TransactionState::Aborting | TransactionState::Finished) {
            return;
        }
        let Some((request, operation)) = txn.requests.pop_front() else {
            self.commit_transaction(id);
            return;
        };

        let outcome = self.run_operation(id, operation);
        match request {
            None => {
                if let Err(err) = outcome {
                    self.abort_transaction(id, Some(err));
                }
            }
            Some(request) => {
                if let Some(txn) = self.transactions.get_mut(&id) {
                    if txn.state == TransactionState::Inactive {
                        txn.state = TransactionState::Active;
                    }
                }
                let failure = outcome.as_ref().err().cloned();
                let disposition = self.settle(request, outcome);
                if let (Some(err), Disposition::Default) = (failure, disposition) {
                    self.abort_transaction(id, Some(err));
                }
            }
        }
        if self.transactions.contains_key(&id) {
            self.schedule(Task::Step(id));
        }
    }

    fn commit_transaction(&mut self, id: TransactionId) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        txn.state = TransactionState::Committing;
        let connection = txn.connection;
        let db_name = txn.db_name.clone();

        let shipped: Result<Option<Vec<StoreSchema>>> = if txn.mode == TransactionMode::VersionChange {
            let version = self.databases.get(&db_name).map_or(0, |db| db.version);
            let params = OpenDatabaseParams {
                name: db_name.clone(),
                version,
                do_on_upgrade: mem::take(&mut txn.upgrade_actions),
            };
            self.rpc.invoke(METHOD_OPEN_DATABASE, &params).map(Some)
        } else if !txn.flags.contains(TransactionFlags::DIRTY) {
            Ok(None)
        } else {
            let log = mem::replace(&mut txn.write_log, WriteLog::new(&db_name));
            self.rpc
                .invoke::<_, ()>(METHOD_EXECUTE_TRANSACTION, &log)
                .map(|_| None)
        };

        match shipped {
            Err(err) => {
                warn!("commit of transaction {:?} failed: {}", id, err);
                self.abort_transaction(id, Some(err));
            }
            Ok(schema) => {
                if let Some(schema) = schema {
                    if let Some(db) = self.databases.get_mut(&db_name) {
                        db.apply_schema(&schema);
                    }
                    if let Some(conn) = self.connections.get_mut(&connection) {
                        conn.remote_open = true;
                    }
                }
                self.reset_scope(id);
                if let Some(txn) = self.transactions.get_mut(&id) {
                    txn.state = TransactionState::Finished;
                }
                debug!("transaction {:?} complete", id);
                self.events.push(Event::Complete { transaction: id });
                self.finish_transaction(id, true);
            }
        }
    }

    /// Undo every local effect of `id` and fail whatever is still queued
    pub(crate) fn abort_transaction(&mut self, id: TransactionId, error: Option<Error>) {
        let Some(txn) = self.transactions.get_mut(&id) else {
            return;
        };
        if matches!(txn.state, TransactionState::Aborting | TransactionState::Finished) {
            return;
        }
        debug!("aborting transaction {:?}: {:?}", id, error);
        txn.state = TransactionState::Aborting;
        if error.is_some() {
            txn.error = error.clone();
        }
        let rollback = mem::take(&mut txn.rollback);
        let pending: Vec<_> = txn.requests.drain(..).collect();
        txn.write_log.ops.clear();
        txn.upgrade_actions.clear();
        let db_name = txn.db_name.clone();

        if let Some(db) = self.databases.get_mut(&db_name) {
            for undo in rollback.into_iter().rev() {
                undo.apply(db);
            }
        }
        for (request, _) in pending {
            if let Some(request) = request {
                self.settle(request, Err(Error::abort()));
            }
        }
        self.reset_scope(id);
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.state = TransactionState::Finished;
        }
        self.events.push(Event::Abort {
            transaction: id,
            error,
        });
        self.finish_transaction(id, false);
    }

    /// Drop the working sets of every store the transaction could have touched
    fn reset_scope(&mut self, id: TransactionId) {
        let Some(txn) = self.transactions.get(&id) else {
            return;
        };
        let Some(db) = self.databases.get_mut(&txn.db_name) else {
            return;
        };
        for (name, store) in db.stores.iter_mut() {
            if txn.mode == TransactionMode::VersionChange || txn.scope.contains(name) {
                store.reset();
            }
        }
    }

    fn finish_transaction(&mut self, id: TransactionId, committed: bool) {
        let Some(txn) = self.transactions.remove(&id) else {
            return;
        };
        if let Some(db) = self.databases.get_mut(&txn.db_name) {
            db.transactions.retain(|t| *t != id);
        }
        self.cursors.retain(|_, cursor| cursor.txn != id);
        self.finished.insert(id, txn.error.clone());
        self.schedule(Task::ProcessTransactions(txn.db_name.clone()));
        if txn.mode == TransactionMode::VersionChange {
            self.complete_upgrade(id, committed);
        }
        self.maybe_finish_close(txn.connection);
    }

    /// Ask `id` to commit once its queued requests have run
    pub fn commit(&mut self, id: TransactionId) -> Result<()> {
        let txn = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState("the transaction has finished".into()))?;
        if txn.state != TransactionState::Active {
            return Err(Error::transaction_inactive());
        }
        txn.state = TransactionState::Committing;
        Ok(())
    }

    pub fn abort(&mut self, id: TransactionId) -> Result<()> {
        let state = self
            .transactions
            .get(&id)
            .map(|txn| txn.state)
            .ok_or_else(|| Error::InvalidState("the transaction has finished".into()))?;
        if matches!(
            state,
            TransactionState::Committing | TransactionState::Aborting | TransactionState::Finished
        ) {
            return Err(Error::InvalidState(format!(
                "cannot abort a transaction that is {:?}",
                state
            )));
        }
        self.abort_transaction(id, None);
        Ok(())
    }

    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        match self.transactions.get(&id) {
            Some(txn) => Some(txn.state),
            None if self.finished.contains_key(&id) => Some(TransactionState::Finished),
            None => None,
        }
    }

    /// Error that aborted `id`, if any
    pub fn transaction_error(&self, id: TransactionId) -> Option<&Error> {
        match self.transactions.get(&id) {
            Some(txn) => txn.error.as_ref(),
            None => self.finished.get(&id).and_then(Option::as_ref),
        }
    }

    pub fn transaction_mode(&self, id: TransactionId) -> Option<TransactionMode> {
        self.transactions.get(&id).map(|txn| txn.mode)
    }

    /// Object stores in the scope of `id`
    pub fn transaction_scope(&self, id: TransactionId) -> Vec<String> {
        self.transactions
            .get(&id)
            .map(|txn| txn.scope.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Flip every active transaction to inactive; runs after each task
    pub(crate) fn deactivate_transactions(&mut self) {
        for txn in self.transactions.values_mut() {
            if txn.state == TransactionState::Active {
                txn.state = TransactionState::Inactive;
            }
        }
    }
}
