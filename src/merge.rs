//! Reads that combine the transaction's working set with the backing store.
//!
//! The remote request is always sent before the local side is scanned so
//! both halves overlap. Remote entries whose primary key has been touched
//! locally are stale and dropped; on equal (key, primary key) the local
//! entry wins.

use std::cmp::Ordering;

use log::trace;
use serde::de::DeserializeOwned;

use crate::constants::METHOD_EXECUTE_READ;
use crate::cursor::Seek;
use crate::error::Result;
use crate::index::Index;
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::object_store::ObjectStore;
use crate::protocol::{Entry, ExecuteReadParams, ReadCall};
use crate::rpc::{PendingCall, RpcClient};
use crate::types::Direction;
use crate::value::Value;

pub(crate) struct RemoteMergeReader<'a> {
    rpc: &'a mut RpcClient,
    db_name: &'a str,
    page_size: Option<usize>,
}

/// Remote (store, index) names, when the backing store knows the source
fn remote_source(store: &ObjectStore, index: Option<&Index>) -> Option<(String, Option<String>)> {
    let store_name = store.remote_name.clone()?;
    match index {
        Some(index) => Some((store_name, Some(index.remote_name.clone()?))),
        None => Some((store_name, None)),
    }
}

fn compare_entries(a: &Entry, b: &Entry) -> Ordering {
    a.key
        .cmp(&b.key)
        .then_with(|| a.primary_key.cmp(&b.primary_key))
}

/// Two-pointer merge of ascending runs; the local entry replaces an equal
/// remote one
pub(crate) fn merge_sorted(local: Vec<Entry>, remote: Vec<Entry>, count: Option<usize>) -> Vec<Entry> {
    let limit = count.unwrap_or(usize::MAX);
    let mut merged = Vec::with_capacity((local.len() + remote.len()).min(limit));
    let mut local = local.into_iter().peekable();
    let mut remote = remote.into_iter().peekable();

    while merged.len() < limit {
        let pick = match (local.peek(), remote.peek()) {
            (Some(l), Some(r)) => compare_entries(l, r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        let next = match pick {
            Ordering::Less => local.next(),
            Ordering::Greater => remote.next(),
            Ordering::Equal => {
                remote.next();
                local.next()
            }
        };
        match next {
            Some(entry) => merged.push(entry),
            None => break,
        }
    }
    merged
}

impl<'a> RemoteMergeReader<'a> {
    pub(crate) fn new(rpc: &'a mut RpcClient, db_name: &'a str, page_size: Option<usize>) -> Self {
        RemoteMergeReader {
            rpc,
            db_name,
            page_size,
        }
    }

    fn send<R>(&mut self, store: &str, call: ReadCall) -> Result<PendingCall<R>> {
        self.rpc.call(
            METHOD_EXECUTE_READ,
            &ExecuteReadParams {
                db_name: self.db_name.to_string(),
                store: store.to_string(),
                call,
            },
        )
    }

    fn read<R: DeserializeOwned>(&mut self, store: &str, call: ReadCall) -> Result<R> {
        let pending = self.send(store, call)?;
        self.rpc.wait(pending)
    }

    /// Up to `count` entries of the merged view inside `range`, ascending
    pub(crate) fn records(
        &mut self,
        store: &ObjectStore,
        index: Option<&Index>,
        range: Option<&KeyRange>,
        count: Option<usize>,
        values: bool,
    ) -> Result<Vec<Entry>> {
        let source = remote_source(store, index);
        let page = count.map(|c| self.page_size.map_or(c, |p| p.max(c)));
        let get_all = |after| ReadCall::GetAll {
            index_name: source.as_ref().and_then(|(_, i)| i.clone()),
            query: range.cloned(),
            count: page.map(|p| p.min(u32::MAX as usize) as u32),
            after,
            values,
        };

        let pending = match &source {
            Some((remote_store, _)) => Some(self.send::<Vec<Entry>>(remote_store, get_all(None))?),
            None => None,
        };
        let local = self.local_records(store, index, range, count, values)?;

        let mut remote = Vec::new();
        if let (Some(pending), Some((remote_store, _))) = (pending, &source) {
            let mut batch: Vec<Entry> = self.rpc.wait(pending)?;
            loop {
                let full = page.map_or(false, |p| batch.len() >= p);
                let last = batch.last().map(Entry::position);
                remote.extend(batch.into_iter().filter(|entry| {
                    let stale = store.records.modified(&entry.primary_key);
                    if stale {
                        trace!("dropping stale remote entry {:?}", entry.primary_key);
                    }
                    !stale
                }));
                match (count, last) {
                    (Some(c), Some(after)) if full && remote.len() < c => {
                        batch = self.read(remote_store, get_all(Some(after)))?;
                    }
                    _ => break,
                }
            }
        }
        Ok(merge_sorted(local, remote, count))
    }

    fn local_records(
        &mut self,
        store: &ObjectStore,
        index: Option<&Index>,
        range: Option<&KeyRange>,
        count: Option<usize>,
        values: bool,
    ) -> Result<Vec<Entry>> {
        let limit = count.unwrap_or(usize::MAX);
        match index {
            None => Ok(store
                .records
                .values(range, Direction::Next)
                .take(limit)
                .map(|r| Entry {
                    key: r.key.clone(),
                    primary_key: r.key.clone(),
                    value: values.then(|| r.value.clone()),
                })
                .collect()),
            Some(index) => index
                .records
                .values(range, Direction::Next)
                .take(limit)
                .map(|r| {
                    Ok(Entry {
                        key: r.key.clone(),
                        primary_key: r.value.clone(),
                        value: if values { self.value_of(store, &r.value)? } else { None },
                    })
                })
                .collect(),
        }
    }

    /// Current value of the record under `primary_key`
    pub(crate) fn value_of(&mut self, store: &ObjectStore, primary_key: &Key) -> Result<Option<Value>> {
        let single = KeyRange::from(primary_key.clone());
        if let Some(record) = store.records.get(&single) {
            return Ok(Some(record.value.clone()));
        }
        if store.records.modified(primary_key) {
            return Ok(None);
        }
        let Some(remote_store) = store.remote_name.as_deref() else {
            return Ok(None);
        };
        let entries: Vec<Entry> = self.read(
            remote_store,
            ReadCall::GetAll {
                index_name: None,
                query: Some(single),
                count: Some(1),
                after: None,
                values: true,
            },
        )?;
        Ok(entries.into_iter().next().and_then(|e| e.value))
    }

    /// Whether the backing store holds a record under `key`
    pub(crate) fn remote_exists(&mut self, store: &ObjectStore, key: &Key) -> Result<bool> {
        let Some(remote_store) = store.remote_name.as_deref() else {
            return Ok(false);
        };
        let entries: Vec<Entry> = self.read(
            remote_store,
            ReadCall::GetAll {
                index_name: None,
                query: Some(KeyRange::from(key.clone())),
                count: Some(1),
                after: None,
                values: false,
            },
        )?;
        Ok(!entries.is_empty())
    }

    /// Whether a live remote entry of a unique index already maps `key` to a
    /// record other than `primary_key`
    pub(crate) fn index_key_taken(
        &mut self,
        store: &ObjectStore,
        index: &Index,
        key: &Key,
        primary_key: &Key,
    ) -> Result<bool> {
        let Some((remote_store, index_name)) = remote_source(store, Some(index)) else {
            return Ok(false);
        };
        let entries: Vec<Entry> = self.read(
            &remote_store,
            ReadCall::GetAll {
                index_name,
                query: Some(KeyRange::from(key.clone())),
                count: None,
                after: None,
                values: false,
            },
        )?;
        Ok(entries
            .iter()
            .any(|e| e.primary_key != *primary_key && !store.records.modified(&e.primary_key)))
    }

    pub(crate) fn count(
        &mut self,
        store: &ObjectStore,
        index: Option<&Index>,
        range: Option<&KeyRange>,
    ) -> Result<u64> {
        let local_state = store.records.has_local_state()
            || index.map_or(false, |i| !i.records.is_empty());
        match remote_source(store, index) {
            Some((remote_store, index_name)) if !local_state => self.read(
                &remote_store,
                ReadCall::Count {
                    index_name,
                    query: range.cloned(),
                },
            ),
            _ => Ok(self.records(store, index, range, None, false)?.len() as u64),
        }
    }

    /// Next entry of the merged view admitted by `seek`
    pub(crate) fn seek(
        &mut self,
        store: &ObjectStore,
        index: Option<&Index>,
        seek: &Seek,
        values: bool,
    ) -> Result<Option<Entry>> {
        let source = remote_source(store, index);
        let next_from = |seek: Seek| ReadCall::GetNextFromCursor {
            index_name: source.as_ref().and_then(|(_, i)| i.clone()),
            seek,
            values,
        };

        let pending = match &source {
            Some((remote_store, _)) => {
                Some(self.send::<Option<Entry>>(remote_store, next_from(seek.clone()))?)
            }
            None => None,
        };
        let local = self.local_seek(store, index, seek, values)?;

        let mut remote = match pending {
            Some(pending) => self.rpc.wait(pending)?,
            None => None,
        };
        if let Some((remote_store, _)) = &source {
            while let Some(entry) = remote.as_ref().filter(|e| store.records.modified(&e.primary_key)) {
                trace!("skipping stale remote entry {:?}", entry.primary_key);
                let past = Seek {
                    after: Some(entry.position()),
                    ..seek.clone()
                };
                remote = self.read(remote_store, next_from(past))?;
            }
        }

        let forward = seek.direction.is_forward();
        let chosen = match (local, remote) {
            (Some(local), Some(remote)) => {
                let ord = compare_entries(&local, &remote);
                let remote_first = if forward {
                    ord == Ordering::Greater
                } else {
                    ord == Ordering::Less
                };
                Some(if remote_first { remote } else { local })
            }
            (local, remote) => local.or(remote),
        };

        // a backward unique walk lands on the last entry of a key but must
        // report its first one
        match chosen {
            Some(entry) if seek.direction == Direction::PrevUnique && index.is_some() => {
                let first = self
                    .records(store, index, Some(&KeyRange::from(entry.key.clone())), Some(1), values)?
                    .into_iter()
                    .next();
                Ok(first.or(Some(entry)))
            }
            other => Ok(other),
        }
    }

    fn local_seek(
        &mut self,
        store: &ObjectStore,
        index: Option<&Index>,
        seek: &Seek,
        values: bool,
    ) -> Result<Option<Entry>> {
        match index {
            None => Ok(store
                .records
                .values(seek.range.as_ref(), seek.direction)
                .find(|r| seek.admits(&r.key, &r.key))
                .map(|r| Entry {
                    key: r.key.clone(),
                    primary_key: r.key.clone(),
                    value: values.then(|| r.value.clone()),
                })),
            Some(index) => {
                let found = index
                    .records
                    .values(seek.range.as_ref(), seek.direction)
                    .find(|r| seek.admits(&r.key, &r.value))
                    .cloned();
                match found {
                    Some(record) => {
                        let value = if values { self.value_of(store, &record.value)? } else { None };
                        Ok(Some(Entry {
                            key: record.key,
                            primary_key: record.value,
                            value,
                        }))
                    }
                    None => Ok(None),
                }
            }
        }
    }
}
