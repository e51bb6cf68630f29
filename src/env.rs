use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use log::{debug, trace, warn};

use crate::constants::{
    DEFAULT_MAX_TASKS_PER_RUN, METHOD_DELETE_DATABASE, METHOD_GET_DATABASE_INFO,
    METHOD_GET_DATABASE_STORES, METHOD_OPEN_DATABASE,
};
use crate::cursor::Cursor;
use crate::database::{Connection, Database};
use crate::error::{Error, Result};
use crate::handle::ObjectStoreHandle;
use crate::key::compare_values;
use crate::meta::{DatabaseInfo, StoreSchema};
use crate::protocol::{NameParams, OpenDatabaseParams};
use crate::request::{Output, RequestSlot};
use crate::rpc::{Channel, RpcClient};
use crate::transaction::{Transaction, Undo};
use crate::types::{ConnectionId, CursorId, RequestId, TransactionId, TransactionMode};
use crate::value::Value;

/// Tunables of an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Tasks one `run_until_idle` may run before giving up
    max_tasks_per_run: usize,
    /// Minimum batch size of bounded remote reads
    remote_page_size: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_tasks_per_run: DEFAULT_MAX_TASKS_PER_RUN,
            remote_page_size: None,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of tasks a single run may execute
    pub fn set_max_tasks_per_run(&mut self, tasks: usize) -> Result<()> {
        if tasks == 0 {
            return Err(Error::Type("max_tasks_per_run must be positive".into()));
        }
        self.max_tasks_per_run = tasks;
        Ok(())
    }

    pub fn get_max_tasks_per_run(&self) -> usize {
        self.max_tasks_per_run
    }

    /// Set the minimum number of entries fetched per bounded remote read.
    ///
    /// Larger batches mean fewer round trips when many remote entries turn
    /// out to be stale.
    pub fn set_remote_page_size(&mut self, size: Option<usize>) -> Result<()> {
        if size == Some(0) {
            return Err(Error::Type("remote_page_size must be positive".into()));
        }
        self.remote_page_size = size;
        Ok(())
    }

    pub fn get_remote_page_size(&self) -> Option<usize> {
        self.remote_page_size
    }
}

/// Notification raised while the engine runs
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Success {
        request: RequestId,
    },
    Error {
        request: RequestId,
        error: Error,
    },
    Complete {
        transaction: TransactionId,
    },
    Abort {
        transaction: TransactionId,
        error: Option<Error>,
    },
    VersionChange {
        connection: ConnectionId,
        old_version: u64,
        new_version: Option<u64>,
    },
    /// Other connections stayed open after being asked to close
    Blocked {
        request: RequestId,
        old_version: u64,
        new_version: Option<u64>,
    },
    UpgradeNeeded {
        request: RequestId,
        old_version: u64,
        new_version: u64,
    },
}

/// Unit of scheduled work
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Task {
    ProcessTransactions(String),
    Step(TransactionId),
    RunFactory,
}

/// Arguments handed to an upgrade callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upgrade {
    pub connection: ConnectionId,
    pub transaction: TransactionId,
    pub old_version: u64,
    pub new_version: u64,
}

/// Runs inside the upgrade transaction; an error aborts it
pub type UpgradeCallback = Box<dyn FnOnce(&mut EngineState, &Upgrade) -> Result<()>>;

pub(crate) enum FactoryJob {
    Open {
        request: RequestId,
        name: String,
        version: Option<u64>,
        upgrade: Option<UpgradeCallback>,
    },
    Delete {
        request: RequestId,
        name: String,
    },
}

/// Factory job parked until something else happens
pub(crate) enum FactoryWait {
    /// Waiting for other connections to close before upgrading
    Upgrade {
        request: RequestId,
        connection: ConnectionId,
        version: u64,
        upgrade: Option<UpgradeCallback>,
    },
    /// Waiting for connections to close before deleting
    Delete { request: RequestId, name: String },
    /// Upgrade transaction running
    Upgrading {
        request: RequestId,
        connection: ConnectionId,
        transaction: TransactionId,
    },
}

/// Single-threaded engine: databases, connections, transactions and the
/// task queue that drives them
pub struct EngineState {
    pub(crate) options: EngineOptions,
    pub(crate) rpc: RpcClient,
    pub(crate) tasks: VecDeque<Task>,
    pub(crate) databases: BTreeMap<String, Database>,
    pub(crate) connections: BTreeMap<ConnectionId, Connection>,
    pub(crate) transactions: BTreeMap<TransactionId, Transaction>,
    /// Finished transactions and the error that ended them
    pub(crate) finished: BTreeMap<TransactionId, Option<Error>>,
    pub(crate) requests: BTreeMap<RequestId, RequestSlot>,
    pub(crate) cursors: BTreeMap<CursorId, Cursor>,
    pub(crate) factory_queue: VecDeque<FactoryJob>,
    pub(crate) factory: Option<FactoryWait>,
    pub(crate) events: Vec<Event>,
    next_id: u64,
    running: bool,
}

impl EngineState {
    pub fn new(channel: impl Channel + 'static) -> Self {
        Self::with_options(channel, EngineOptions::default())
    }

    pub fn with_options(channel: impl Channel + 'static, options: EngineOptions) -> Self {
        EngineState {
            options,
            rpc: RpcClient::new(Box::new(channel)),
            tasks: VecDeque::new(),
            databases: BTreeMap::new(),
            connections: BTreeMap::new(),
            transactions: BTreeMap::new(),
            finished: BTreeMap::new(),
            requests: BTreeMap::new(),
            cursors: BTreeMap::new(),
            factory_queue: VecDeque::new(),
            factory: None,
            events: Vec::new(),
            next_id: 1,
            running: false,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn schedule(&mut self, task: Task) {
        trace!("scheduling {:?}", task);
        self.tasks.push_back(task);
    }

    /// Drain the event log
    pub fn take_events(&mut self) -> Vec<Event> {
        mem::take(&mut self.events)
    }

    /// Run scheduled tasks until none are left
    pub fn run_until_idle(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::InvalidState("the engine is already running".into()));
        }
        self.running = true;
        self.deactivate_transactions();
        let mut ran = 0;
        let outcome = loop {
            if self.tasks.is_empty() {
                break Ok(());
            }
            if ran >= self.options.max_tasks_per_run {
                break Err(Error::InvalidState(format!(
                    "gave up after {} tasks; the task queue does not drain",
                    ran
                )));
            }
            self.run_task();
            ran += 1;
        };
        self.running = false;
        outcome
    }

    /// Run a single task. Returns whether there was one.
    pub fn tick(&mut self) -> Result<bool> {
        if self.running {
            return Err(Error::InvalidState("the engine is already running".into()));
        }
        self.running = true;
        self.deactivate_transactions();
        let ran = self.run_task();
        self.running = false;
        Ok(ran)
    }

    fn run_task(&mut self) -> bool {
        let Some(task) = self.tasks.pop_front() else {
            return false;
        };
        match task {
            Task::ProcessTransactions(db_name) => self.process_transactions(&db_name),
            Task::Step(id) => self.step_transaction(id),
            Task::RunFactory => self.run_factory(),
        }
        self.deactivate_transactions();
        true
    }

    /// Open a connection, upgrading to `version` when it is newer.
    /// Settles with `Output::Connection`.
    pub fn open(
        &mut self,
        name: &str,
        version: Option<u64>,
        upgrade: Option<UpgradeCallback>,
    ) -> Result<RequestId> {
        if version == Some(0) {
            return Err(Error::Type("database version must be positive".into()));
        }
        let request = RequestId(self.next_id());
        self.requests.insert(request, RequestSlot::new());
        self.factory_queue.push_back(FactoryJob::Open {
            request,
            name: name.to_string(),
            version,
            upgrade,
        });
        self.schedule(Task::RunFactory);
        Ok(request)
    }

    pub fn delete_database(&mut self, name: &str) -> Result<RequestId> {
        let request = RequestId(self.next_id());
        self.requests.insert(request, RequestSlot::new());
        self.factory_queue.push_back(FactoryJob::Delete {
            request,
            name: name.to_string(),
        });
        self.schedule(Task::RunFactory);
        Ok(request)
    }

    /// Databases known to the backing store
    pub fn databases(&mut self) -> Result<Vec<DatabaseInfo>> {
        self.rpc.invoke(METHOD_GET_DATABASE_INFO, &())
    }

    /// Compare two values as keys
    pub fn cmp(&self, a: Option<&Value>, b: Option<&Value>) -> Result<Ordering> {
        compare_values(a, b)
    }

    /// Start a transaction over `scope`
    pub fn transaction(
        &mut self,
        connection: ConnectionId,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<TransactionId> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or_else(Error::invalid_state)?;
        if conn.closed || conn.close_pending {
            return Err(Error::InvalidState("the connection is closing".into()));
        }
        if conn.upgrade.is_some() {
            return Err(Error::InvalidState("an upgrade is running on this connection".into()));
        }
        if mode == TransactionMode::VersionChange {
            return Err(Error::Type("upgrade transactions are only created by open".into()));
        }
        if scope.is_empty() {
            return Err(Error::InvalidAccess("the scope is empty".into()));
        }
        let db_name = conn.db_name.clone();
        let db = self
            .databases
            .get(&db_name)
            .ok_or_else(Error::invalid_state)?;
        if let Some(missing) = scope.iter().find(|s| !db.stores.contains_key(**s)) {
            return Err(Error::NotFound(format!("no object store named {}", missing)));
        }
        let scope: BTreeSet<String> = scope.iter().map(|s| s.to_string()).collect();
        Ok(self.create_transaction(connection, &db_name, scope, mode))
    }

    /// Handle on an object store in the scope of `txn`
    pub fn object_store(&mut self, txn: TransactionId, name: &str) -> Result<ObjectStoreHandle<'_>> {
        let transaction = self
            .transactions
            .get(&txn)
            .ok_or_else(|| Error::InvalidState("the transaction has finished".into()))?;
        let exists = self
            .databases
            .get(&transaction.db_name)
            .map_or(false, |db| db.stores.contains_key(name));
        if !transaction.scope.contains(name) || !exists {
            return Err(Error::NotFound(format!("no object store named {} in scope", name)));
        }
        Ok(ObjectStoreHandle::new(self, txn, name))
    }

    fn run_factory(&mut self) {
        match self.factory.take() {
            Some(FactoryWait::Upgrade {
                request,
                connection,
                version,
                upgrade,
            }) => {
                let db_name = self
                    .connections
                    .get(&connection)
                    .map(|c| c.db_name.clone())
                    .unwrap_or_default();
                if self.others_open(&db_name, Some(connection)) {
                    self.factory = Some(FactoryWait::Upgrade {
                        request,
                        connection,
                        version,
                        upgrade,
                    });
                    return;
                }
                self.start_upgrade(request, connection, version, upgrade);
            }
            Some(FactoryWait::Delete { request, name }) => {
                if self.others_open(&name, None) {
                    self.factory = Some(FactoryWait::Delete { request, name });
                    return;
                }
                self.finish_delete(request, &name);
            }
            Some(wait @ FactoryWait::Upgrading { .. }) => {
                self.factory = Some(wait);
                return;
            }
            None => match self.factory_queue.pop_front() {
                Some(FactoryJob::Open {
                    request,
                    name,
                    version,
                    upgrade,
                }) => self.open_job(request, &name, version, upgrade),
                Some(FactoryJob::Delete { request, name }) => self.delete_job(request, &name),
                None => return,
            },
        }
        if self.factory.is_none() && !self.factory_queue.is_empty() {
            self.schedule(Task::RunFactory);
        }
    }

    /// Make sure the local view of `name` exists and matches the backing
    /// store, then register a new connection
    fn prepare_open(&mut self, name: &str, version: Option<u64>) -> Result<(ConnectionId, u64)> {
        let info: Vec<DatabaseInfo> = self.rpc.invoke(METHOD_GET_DATABASE_INFO, &())?;
        let remote_version = info.iter().find(|d| d.name == name).map(|d| d.version);
        let idle_local = self
            .databases
            .get(name)
            .map(|db| db.connections.is_empty());
        match (remote_version, idle_local) {
            (None, None) | (None, Some(true)) => {
                self.databases
                    .insert(name.to_string(), Database::new(name, 0));
            }
            (Some(remote), None) => {
                let schema: Vec<StoreSchema> = self.rpc.invoke(
                    METHOD_GET_DATABASE_STORES,
                    &NameParams {
                        name: name.to_string(),
                    },
                )?;
                let mut db = Database::new(name, remote);
                db.apply_schema(&schema);
                self.databases.insert(name.to_string(), db);
            }
            (Some(remote), Some(true)) => {
                if let Some(db) = self.databases.get_mut(name) {
                    db.version = remote;
                }
            }
            (_, Some(false)) => {}
        }

        let id = ConnectionId(self.next_id());
        let db = self
            .databases
            .get_mut(name)
            .ok_or_else(Error::invalid_state)?;
        let requested = version.unwrap_or(if db.version == 0 { 1 } else { db.version });
        if db.version > requested {
            return Err(Error::Version(format!(
                "requested version {} is lower than the existing version {}",
                requested, db.version
            )));
        }
        db.connections.push(id);
        self.connections
            .insert(id, Connection::new(id, name, db.version));
        Ok((id, requested))
    }

    fn open_job(&mut self, request: RequestId, name: &str, version: Option<u64>, upgrade: Option<UpgradeCallback>) {
        debug!("opening {} at {:?}", name, version);
        let (connection, requested) = match self.prepare_open(name, version) {
            Ok(opened) => opened,
            Err(err) => {
                self.settle(request, Err(err));
                return;
            }
        };
        let current = self.databases.get(name).map_or(0, |db| db.version);
        if current < requested {
            self.begin_versionchange(request, connection, requested, upgrade);
            return;
        }
        let params = OpenDatabaseParams {
            name: name.to_string(),
            version: requested,
            do_on_upgrade: Vec::new(),
        };
        match self.rpc.invoke::<_, Vec<StoreSchema>>(METHOD_OPEN_DATABASE, &params) {
            Ok(schema) => {
                if let Some(db) = self.databases.get_mut(name) {
                    db.apply_schema(&schema);
                }
                if let Some(conn) = self.connections.get_mut(&connection) {
                    conn.remote_open = true;
                }
                self.settle(request, Ok(Output::Connection(connection)));
            }
            Err(err) => {
                self.drop_connection(connection);
                self.settle(request, Err(err));
            }
        }
    }

    fn begin_versionchange(
        &mut self,
        request: RequestId,
        connection: ConnectionId,
        version: u64,
        upgrade: Option<UpgradeCallback>,
    ) {
        let Some(db_name) = self.connections.get(&connection).map(|c| c.db_name.clone()) else {
            self.settle(request, Err(Error::abort()));
            return;
        };
        let (old_version, others) = match self.databases.get(&db_name) {
            Some(db) => (
                db.version,
                db.connections
                    .iter()
                    .copied()
                    .filter(|c| *c != connection)
                    .collect::<Vec<_>>(),
            ),
            None => (0, Vec::new()),
        };
        for other in others {
            if self.connection_is_open(other) {
                self.fire_versionchange(other, old_version, Some(version));
            }
        }
        if self.others_open(&db_name, Some(connection)) {
            debug!("upgrade of {} blocked by open connections", db_name);
            self.events.push(Event::Blocked {
                request,
                old_version,
                new_version: Some(version),
            });
            self.factory = Some(FactoryWait::Upgrade {
                request,
                connection,
                version,
                upgrade,
            });
            return;
        }
        self.start_upgrade(request, connection, version, upgrade);
    }

    fn start_upgrade(
        &mut self,
        request: RequestId,
        connection: ConnectionId,
        version: u64,
        upgrade: Option<UpgradeCallback>,
    ) {
        let Some(db_name) = self.connections.get(&connection).map(|c| c.db_name.clone()) else {
            self.settle(request, Err(Error::abort()));
            return;
        };
        let Some(db) = self.databases.get_mut(&db_name) else {
            self.drop_connection(connection);
            self.settle(request, Err(Error::abort()));
            return;
        };
        let old_version = db.version;
        db.version = version;
        let scope: BTreeSet<String> = db.stores.keys().cloned().collect();

        let txn = self.create_transaction(connection, &db_name, scope, TransactionMode::VersionChange);
        if let Some(transaction) = self.transactions.get_mut(&txn) {
            transaction.rollback.push(Undo::RestoreVersion {
                version: old_version,
            });
        }
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.version = version;
            conn.upgrade = Some(txn);
        }
        self.factory = Some(FactoryWait::Upgrading {
            request,
            connection,
            transaction: txn,
        });
        debug!("upgrading {} from {} to {}", db_name, old_version, version);
        self.events.push(Event::UpgradeNeeded {
            request,
            old_version,
            new_version: version,
        });

        if let Some(callback) = upgrade {
            let ctx = Upgrade {
                connection,
                transaction: txn,
                old_version,
                new_version: version,
            };
            if let Err(err) = callback(self, &ctx) {
                warn!("upgrade callback of {} failed: {}", db_name, err);
                self.abort_transaction(txn, Some(err));
            }
        }
    }

    /// Settle the open request waiting on upgrade transaction `transaction`
    pub(crate) fn complete_upgrade(&mut self, transaction: TransactionId, committed: bool) {
        let (request, connection) = match self.factory.take() {
            Some(FactoryWait::Upgrading {
                request,
                connection,
                transaction: running,
            }) if running == transaction => (request, connection),
            other => {
                self.factory = other;
                return;
            }
        };
        let close_pending = match self.connections.get_mut(&connection) {
            Some(conn) => {
                conn.upgrade = None;
                conn.close_pending
            }
            None => true,
        };
        if committed && !close_pending {
            self.settle(request, Ok(Output::Connection(connection)));
        } else {
            self.drop_connection(connection);
            self.settle(request, Err(Error::abort()));
        }
        self.schedule(Task::RunFactory);
    }

    fn delete_job(&mut self, request: RequestId, name: &str) {
        debug!("deleting {}", name);
        let Some(db) = self.databases.get(name) else {
            self.finish_delete(request, name);
            return;
        };
        let old_version = db.version;
        let connections = db.connections.clone();
        for connection in connections {
            if self.connection_is_open(connection) {
                self.fire_versionchange(connection, old_version, None);
            }
        }
        if self.others_open(name, None) {
            self.events.push(Event::Blocked {
                request,
                old_version,
                new_version: None,
            });
            self.factory = Some(FactoryWait::Delete {
                request,
                name: name.to_string(),
            });
            return;
        }
        self.finish_delete(request, name);
    }

    fn finish_delete(&mut self, request: RequestId, name: &str) {
        let params = NameParams {
            name: name.to_string(),
        };
        match self.rpc.invoke::<_, ()>(METHOD_DELETE_DATABASE, &params) {
            Ok(()) => {
                self.databases.remove(name);
                debug!("deleted {}", name);
                self.settle(request, Ok(Output::Unit));
            }
            Err(err) => {
                self.settle(request, Err(err));
            }
        }
    }
}
