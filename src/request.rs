use log::debug;

use crate::env::{EngineState, Event};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::merge::RemoteMergeReader;
use crate::object_store::{store_record, ObjectStore, WriteMode};
use crate::protocol::WriteOp;
use crate::transaction::Transaction;
use crate::types::{ConnectionId, CursorId, RequestId, TransactionId, TransactionState};
use crate::value::Value;

/// Result payload of a settled request
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Unit,
    Key(Key),
    MaybeKey(Option<Key>),
    Value(Option<Value>),
    Keys(Vec<Key>),
    Values(Vec<Value>),
    Count(u64),
    /// The cursor, or `None` once it ran off the end
    Cursor(Option<CursorId>),
    Connection(ConnectionId),
}

pub type Outcome = Result<Output>;

/// What a callback did with an error outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Errors abort the owning transaction
    #[default]
    Default,
    /// The error was dealt with; the transaction carries on
    Handled,
}

/// Invoked when a request settles, with the transaction active
pub type Callback = Box<dyn FnMut(&mut EngineState, RequestId, &Outcome) -> Disposition>;

pub(crate) struct RequestSlot {
    pub(crate) outcome: Option<Outcome>,
    pub(crate) callback: Option<Callback>,
}

impl RequestSlot {
    pub(crate) fn new() -> Self {
        RequestSlot {
            outcome: None,
            callback: None,
        }
    }
}

/// Shape of a read request's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadShape {
    Value,
    Key,
    AllValues(Option<usize>),
    AllKeys(Option<usize>),
    Count,
}

/// Deferred work queued on a transaction
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Store {
        store: String,
        value: Value,
        key: Option<Key>,
        mode: WriteMode,
    },
    Read {
        store: String,
        index: Option<String>,
        range: Option<KeyRange>,
        shape: ReadShape,
    },
    Delete {
        store: String,
        range: KeyRange,
    },
    Clear {
        store: String,
    },
    Iterate {
        cursor: CursorId,
        key: Option<Key>,
        primary_key: Option<Key>,
        steps: u32,
    },
    InitializeIndex {
        store: String,
        index: String,
    },
}

/// Mutable views needed to run one operation against one store
struct WorkingSet<'a> {
    txn: &'a mut Transaction,
    store: &'a mut ObjectStore,
    reader: RemoteMergeReader<'a>,
}

impl EngineState {
    fn working_set(&mut self, txn: TransactionId, store: &str) -> Result<WorkingSet<'_>> {
        let EngineState {
            rpc,
            options,
            databases,
            transactions,
            ..
        } = self;
        let txn = transactions
            .get_mut(&txn)
            .ok_or_else(Error::transaction_inactive)?;
        let db = databases.get_mut(&txn.db_name).ok_or_else(Error::invalid_state)?;
        let store = db.stores.get_mut(store).ok_or_else(Error::invalid_state)?;
        Ok(WorkingSet {
            txn,
            store,
            reader: RemoteMergeReader::new(rpc, &db.name, options.get_remote_page_size()),
        })
    }

    pub(crate) fn enqueue(&mut self, txn: TransactionId, operation: Operation) -> Result<RequestId> {
        let request = RequestId(self.next_id());
        self.enqueue_as(txn, request, operation)?;
        Ok(request)
    }

    /// Queue `operation` under an existing request id; cursors reuse theirs
    pub(crate) fn enqueue_as(
        &mut self,
        txn: TransactionId,
        request: RequestId,
        operation: Operation,
    ) -> Result<()> {
        let transaction = self
            .transactions
            .get_mut(&txn)
            .ok_or_else(Error::transaction_inactive)?;
        if transaction.state != TransactionState::Active {
            return Err(Error::transaction_inactive());
        }
        transaction.requests.push_back((Some(request), operation));
        self.requests.entry(request).or_insert_with(RequestSlot::new).outcome = None;
        Ok(())
    }

    /// Record the outcome of `request` and run its callback
    pub(crate) fn settle(&mut self, request: RequestId, outcome: Outcome) -> Disposition {
        self.events.push(match &outcome {
            Ok(_) => Event::Success { request },
            Err(error) => Event::Error {
                request,
                error: error.clone(),
            },
        });
        let callback = self.requests.get_mut(&request).and_then(|slot| {
            slot.outcome = Some(outcome.clone());
            slot.callback.take()
        });
        let Some(mut callback) = callback else {
            return Disposition::Default;
        };
        let disposition = callback(self, request, &outcome);
        if let Some(slot) = self.requests.get_mut(&request) {
            if slot.callback.is_none() {
                slot.callback = Some(callback);
            }
        }
        disposition
    }

    /// Run `callback` each time `request` settles
    pub fn set_callback(&mut self, request: RequestId, callback: Callback) -> Result<()> {
        let slot = self
            .requests
            .get_mut(&request)
            .ok_or_else(|| Error::InvalidState(format!("unknown request {:?}", request)))?;
        slot.callback = Some(callback);
        Ok(())
    }

    pub fn outcome(&self, request: RequestId) -> Option<&Outcome> {
        self.requests.get(&request).and_then(|slot| slot.outcome.as_ref())
    }

    pub fn is_settled(&self, request: RequestId) -> bool {
        self.outcome(request).is_some()
    }

    /// Collect the outcome of a settled request and release it
    pub fn take_outcome(&mut self, request: RequestId) -> Option<Outcome> {
        let settled = self.is_settled(request);
        if !settled {
            return None;
        }
        self.requests.remove(&request).and_then(|slot| slot.outcome)
    }

    pub(crate) fn run_operation(&mut self, txn: TransactionId, operation: Operation) -> Outcome {
        match operation {
            Operation::Store {
                store,
                value,
                key,
                mode,
            } => {
                let ws = self.working_set(txn, &store)?;
                let WorkingSet {
                    txn,
                    store: object_store,
                    mut reader,
                } = ws;
                let record = store_record(
                    &mut reader,
                    object_store,
                    value,
                    key,
                    mode == WriteMode::Add,
                    &mut txn.rollback,
                )?;
                let (key, value) = (record.key.clone(), record.value);
                let op = match mode {
                    WriteMode::Add => WriteOp::Add { key, value },
                    WriteMode::Put => WriteOp::Put { key, value },
                    WriteMode::Replace => WriteOp::Replace { key, value },
                };
                txn.record_write(&store, op);
                Ok(Output::Key(record.key))
            }
            Operation::Read {
                store,
                index,
                range,
                shape,
            } => {
                let WorkingSet {
                    store: object_store,
                    mut reader,
                    ..
                } = self.working_set(txn, &store)?;
                let object_store = &*object_store;
                let index = match &index {
                    Some(name) => Some(
                        object_store
                            .indexes
                            .get(name)
                            .ok_or_else(Error::invalid_state)?,
                    ),
                    None => None,
                };
                let range = range.as_ref();
                match shape {
                    ReadShape::Value => {
                        let first = reader.records(object_store, index, range, Some(1), true)?;
                        Ok(Output::Value(first.into_iter().next().and_then(|e| e.value)))
                    }
                    ReadShape::Key => {
                        let first = reader.records(object_store, index, range, Some(1), false)?;
                        Ok(Output::MaybeKey(first.into_iter().next().map(|e| e.primary_key)))
                    }
                    ReadShape::AllValues(count) => {
                        let entries = reader.records(object_store, index, range, count, true)?;
                        Ok(Output::Values(entries.into_iter().filter_map(|e| e.value).collect()))
                    }
                    ReadShape::AllKeys(count) => {
                        let entries = reader.records(object_store, index, range, count, false)?;
                        Ok(Output::Keys(entries.into_iter().map(|e| e.primary_key).collect()))
                    }
                    ReadShape::Count => Ok(Output::Count(reader.count(object_store, index, range)?)),
                }
            }
            Operation::Delete { store, range } => {
                let WorkingSet {
                    txn,
                    store: object_store,
                    ..
                } = self.working_set(txn, &store)?;
                object_store.delete_record(&range, &mut txn.rollback);
                txn.record_write(&store, WriteOp::Delete { query: range });
                Ok(Output::Unit)
            }
            Operation::Clear { store } => {
                let WorkingSet {
                    txn,
                    store: object_store,
                    ..
                } = self.working_set(txn, &store)?;
                object_store.clear(&mut txn.rollback);
                txn.record_write(&store, WriteOp::Clear);
                Ok(Output::Unit)
            }
            Operation::Iterate {
                cursor,
                key,
                primary_key,
                steps,
            } => self.iterate_cursor(cursor, key, primary_key, steps),
            Operation::InitializeIndex { store, index } => {
                let WorkingSet {
                    store: object_store,
                    mut reader,
                    ..
                } = self.working_set(txn, &store)?;
                let Some(mut target) = object_store.indexes.remove(&index) else {
                    return Ok(Output::Unit);
                };
                debug!("back-filling index {} of {}", index, store);
                let filled = target.initialize(&mut reader, object_store);
                object_store.indexes.insert(index, target);
                filled.map(|_| Output::Unit)
            }
        }
    }
}
