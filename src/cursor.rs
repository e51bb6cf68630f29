use std::cmp::Ordering;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::env::EngineState;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::merge::RemoteMergeReader;
use crate::object_store::{ObjectStore, WriteMode};
use crate::protocol::Entry;
use crate::request::{Operation, Outcome, Output};
use crate::types::{CursorId, CursorKind, Direction, RequestId, TransactionId, TransactionMode, TransactionState};
use crate::value::Value;

/// A point in (key, primary key) order. Without a primary key the position
/// stands for every entry under `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Key>,
}

impl Position {
    /// Ordering of the entry `(key, primary_key)` relative to this position
    pub fn compare(&self, key: &Key, primary_key: &Key) -> Ordering {
        key.cmp(&self.key).then_with(|| match &self.primary_key {
            Some(pk) => primary_key.cmp(pk),
            None => Ordering::Equal,
        })
    }
}

/// Where the next step of a cursor may land
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seek {
    #[serde(default)]
    pub range: Option<KeyRange>,
    #[serde(default)]
    pub direction: Direction,
    /// Exclusive lower limit in the direction of travel
    #[serde(default)]
    pub after: Option<Position>,
    /// Inclusive lower limit in the direction of travel
    #[serde(default)]
    pub from: Option<Position>,
}

impl Seek {
    pub fn admits(&self, key: &Key, primary_key: &Key) -> bool {
        if let Some(range) = &self.range {
            if !range.includes(key) {
                return false;
            }
        }
        let forward = self.direction.is_forward();
        let beyond = |position: &Position, inclusive: bool| {
            let ord = position.compare(key, primary_key);
            match (forward, inclusive) {
                (true, false) => ord == Ordering::Greater,
                (true, true) => ord != Ordering::Less,
                (false, false) => ord == Ordering::Less,
                (false, true) => ord != Ordering::Greater,
            }
        };
        self.after.as_ref().map_or(true, |p| beyond(p, false))
            && self.from.as_ref().map_or(true, |p| beyond(p, true))
    }
}

/// Iteration state over an object store or an index
#[derive(Debug, Clone)]
pub struct Cursor {
    pub(crate) id: CursorId,
    pub(crate) txn: TransactionId,
    pub(crate) store: String,
    pub(crate) index: Option<String>,
    pub(crate) range: Option<KeyRange>,
    pub(crate) direction: Direction,
    pub(crate) kind: CursorKind,
    /// Request re-used by every step
    pub(crate) request: RequestId,
    pub(crate) key: Option<Key>,
    pub(crate) primary_key: Option<Key>,
    pub(crate) value: Option<Value>,
    pub(crate) got_value: bool,
}

impl Cursor {
    /// Seek for the next step, optionally jumping to `key` / `primary_key`
    fn seek(&self, key: Option<Key>, primary_key: Option<Key>) -> Seek {
        let after = self.key.clone().map(|key| Position {
            key,
            // unique walks and object stores move key by key
            primary_key: if self.index.is_some() && !self.direction.is_unique() {
                self.primary_key.clone()
            } else {
                None
            },
        });
        Seek {
            range: self.range.clone(),
            direction: self.direction,
            after,
            from: key.map(|key| Position { key, primary_key }),
        }
    }

    fn land(&mut self, entry: Option<Entry>) {
        match entry {
            Some(entry) => {
                self.key = Some(entry.key);
                self.primary_key = Some(entry.primary_key);
                self.value = entry.value;
                self.got_value = true;
            }
            None => {
                self.key = None;
                self.primary_key = None;
                self.value = None;
                self.got_value = false;
            }
        }
    }
}

impl EngineState {
    pub fn cursor_key(&self, cursor: CursorId) -> Option<&Key> {
        self.cursors.get(&cursor).and_then(|c| c.key.as_ref())
    }

    pub fn cursor_primary_key(&self, cursor: CursorId) -> Option<&Key> {
        self.cursors.get(&cursor).and_then(|c| c.primary_key.as_ref())
    }

    pub fn cursor_value(&self, cursor: CursorId) -> Option<&Value> {
        self.cursors.get(&cursor).and_then(|c| c.value.as_ref())
    }

    pub fn cursor_direction(&self, cursor: CursorId) -> Option<Direction> {
        self.cursors.get(&cursor).map(|c| c.direction)
    }

    /// Request that every step of `cursor` settles
    pub fn cursor_request(&self, cursor: CursorId) -> Option<RequestId> {
        self.cursors.get(&cursor).map(|c| c.request)
    }

    /// Cursor whose transaction is active and whose source still exists
    fn live_cursor(&self, id: CursorId, write: bool) -> Result<(&Cursor, &ObjectStore)> {
        let cursor = self.cursors.get(&id).ok_or_else(Error::transaction_inactive)?;
        let txn = self
            .transactions
            .get(&cursor.txn)
            .ok_or_else(Error::transaction_inactive)?;
        if txn.state != TransactionState::Active {
            return Err(Error::transaction_inactive());
        }
        if write && txn.mode == TransactionMode::ReadOnly {
            return Err(Error::read_only());
        }
        let store = self
            .databases
            .get(&txn.db_name)
            .and_then(|db| db.stores.get(&cursor.store))
            .ok_or_else(Error::invalid_state)?;
        if let Some(index) = &cursor.index {
            if !store.indexes.contains_key(index) {
                return Err(Error::invalid_state());
            }
        }
        Ok((cursor, store))
    }

    fn require_position(cursor: &Cursor) -> Result<()> {
        if cursor.got_value {
            Ok(())
        } else {
            Err(Error::InvalidState("the cursor is not positioned on a record".into()))
        }
    }

    fn schedule_steps(
        &mut self,
        id: CursorId,
        key: Option<Key>,
        primary_key: Option<Key>,
        steps: u32,
    ) -> Result<()> {
        let (txn, request) = match self.cursors.get(&id) {
            Some(cursor) => (cursor.txn, cursor.request),
            None => return Err(Error::transaction_inactive()),
        };
        self.enqueue_as(
            txn,
            request,
            Operation::Iterate {
                cursor: id,
                key,
                primary_key,
                steps,
            },
        )?;
        if let Some(cursor) = self.cursors.get_mut(&id) {
            cursor.got_value = false;
        }
        Ok(())
    }

    /// Move to the next entry, or to the first one at or beyond `key`
    pub fn continue_cursor(&mut self, id: CursorId, key: Option<Key>) -> Result<()> {
        let (cursor, _) = self.live_cursor(id, false)?;
        Self::require_position(cursor)?;
        if let Some(key) = &key {
            key.validate()?;
            if let Some(current) = &cursor.key {
                let ord = key.cmp(current);
                let backwards = if cursor.direction.is_forward() {
                    ord != Ordering::Greater
                } else {
                    ord != Ordering::Less
                };
                if backwards {
                    return Err(Error::Data(
                        "the key does not move the cursor in its direction".into(),
                    ));
                }
            }
        }
        self.schedule_steps(id, key, None, 1)
    }

    /// Move to the first entry at or beyond `(key, primary_key)`
    pub fn continue_primary_key(&mut self, id: CursorId, key: Key, primary_key: Key) -> Result<()> {
        let (cursor, _) = self.live_cursor(id, false)?;
        if cursor.index.is_none() {
            return Err(Error::InvalidAccess(
                "continuePrimaryKey needs an index cursor".into(),
            ));
        }
        if cursor.direction.is_unique() {
            return Err(Error::InvalidAccess(
                "continuePrimaryKey needs a next or prev cursor".into(),
            ));
        }
        Self::require_position(cursor)?;
        key.validate()?;
        primary_key.validate()?;
        if let (Some(current), Some(current_pk)) = (&cursor.key, &cursor.primary_key) {
            let ord = key.cmp(current).then_with(|| primary_key.cmp(current_pk));
            let backwards = if cursor.direction.is_forward() {
                ord != Ordering::Greater
            } else {
                ord != Ordering::Less
            };
            if backwards {
                return Err(Error::Data(
                    "the position does not move the cursor in its direction".into(),
                ));
            }
        }
        self.schedule_steps(id, Some(key), Some(primary_key), 1)
    }

    /// Skip `count` entries
    pub fn advance(&mut self, id: CursorId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::Type("advance count must be positive".into()));
        }
        let (cursor, _) = self.live_cursor(id, false)?;
        Self::require_position(cursor)?;
        self.schedule_steps(id, None, None, count)
    }

    /// Replace the record under the cursor
    pub fn cursor_update(&mut self, id: CursorId, value: Value) -> Result<RequestId> {
        let (cursor, store) = self.live_cursor(id, true)?;
        Self::require_position(cursor)?;
        if cursor.kind == CursorKind::KeyOnly {
            return Err(Error::InvalidState("key cursors cannot update records".into()));
        }
        let primary_key = cursor.primary_key.clone().ok_or_else(Error::invalid_state)?;
        let key = match &store.key_path {
            Some(path) => match path.extract_key(&value) {
                Ok(Some(key)) if key == primary_key => None,
                _ => {
                    return Err(Error::Data(
                        "the value's key does not match the cursor's primary key".into(),
                    ))
                }
            },
            None => Some(primary_key),
        };
        let (txn, store) = (cursor.txn, cursor.store.clone());
        self.enqueue(
            txn,
            Operation::Store {
                store,
                value,
                key,
                mode: WriteMode::Replace,
            },
        )
    }

    /// Delete the record under the cursor
    pub fn cursor_delete(&mut self, id: CursorId) -> Result<RequestId> {
        let (cursor, _) = self.live_cursor(id, true)?;
        Self::require_position(cursor)?;
        if cursor.kind == CursorKind::KeyOnly {
            return Err(Error::InvalidState("key cursors cannot delete records".into()));
        }
        let primary_key = cursor.primary_key.clone().ok_or_else(Error::invalid_state)?;
        let (txn, store) = (cursor.txn, cursor.store.clone());
        self.enqueue(
            txn,
            Operation::Delete {
                store,
                range: KeyRange::from(primary_key),
            },
        )
    }

    /// Run `steps` seeks of a cursor against the merged view
    pub(crate) fn iterate_cursor(
        &mut self,
        id: CursorId,
        mut key: Option<Key>,
        mut primary_key: Option<Key>,
        steps: u32,
    ) -> Outcome {
        let EngineState {
            rpc,
            options,
            databases,
            transactions,
            cursors,
            ..
        } = self;
        let cursor = cursors.get_mut(&id).ok_or_else(Error::transaction_inactive)?;
        let txn = transactions
            .get(&cursor.txn)
            .ok_or_else(Error::transaction_inactive)?;
        let db = databases.get(&txn.db_name).ok_or_else(Error::invalid_state)?;
        let store = db.stores.get(&cursor.store).ok_or_else(Error::invalid_state)?;
        let index = match &cursor.index {
            Some(name) => Some(store.indexes.get(name).ok_or_else(Error::invalid_state)?),
            None => None,
        };
        let mut reader = RemoteMergeReader::new(rpc, &db.name, options.get_remote_page_size());
        let values = cursor.kind == CursorKind::WithValue;

        for _ in 0..steps {
            let seek = cursor.seek(key.take(), primary_key.take());
            let found = reader.seek(store, index, &seek, values)?;
            let exhausted = found.is_none();
            cursor.land(found);
            if exhausted {
                break;
            }
        }
        trace!("cursor {:?} at {:?}", id, cursor.key);
        Ok(Output::Cursor(cursor.got_value.then_some(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(key: i32, primary_key: Option<i32>) -> Position {
        Position {
            key: Key::from(key),
            primary_key: primary_key.map(Key::from),
        }
    }

    #[test]
    fn after_is_exclusive_and_from_is_inclusive() {
        let seek = Seek {
            range: None,
            direction: Direction::Next,
            after: Some(position(2, Some(5))),
            from: None,
        };
        assert!(!seek.admits(&Key::from(2), &Key::from(5)));
        assert!(seek.admits(&Key::from(2), &Key::from(6)));
        assert!(!seek.admits(&Key::from(1), &Key::from(9)));

        let jump = Seek {
            from: Some(position(4, None)),
            ..seek
        };
        assert!(!seek_admits_key(&jump, 3));
        assert!(seek_admits_key(&jump, 4));
    }

    fn seek_admits_key(seek: &Seek, key: i32) -> bool {
        seek.admits(&Key::from(key), &Key::from(0))
    }

    #[test]
    fn backward_seek_mirrors_forward() {
        let seek = Seek {
            range: Some(KeyRange::bound(Key::from(1), Key::from(8), false, false).unwrap()),
            direction: Direction::PrevUnique,
            after: Some(position(5, None)),
            from: None,
        };
        assert!(seek_admits_key(&seek, 4));
        assert!(!seek_admits_key(&seek, 5));
        assert!(!seek_admits_key(&seek, 0));
    }

    #[test]
    fn unique_cursors_step_over_whole_keys() {
        let cursor = Cursor {
            id: CursorId(1),
            txn: TransactionId(1),
            store: "s".into(),
            index: Some("i".into()),
            range: None,
            direction: Direction::NextUnique,
            kind: CursorKind::KeyOnly,
            request: RequestId(1),
            key: Some(Key::from(3)),
            primary_key: Some(Key::from(10)),
            value: None,
            got_value: true,
        };
        let seek = cursor.seek(None, None);
        assert_eq!(seek.after, Some(position(3, None)));

        let plain = Cursor {
            direction: Direction::Next,
            ..cursor
        };
        assert_eq!(plain.seek(None, None).after, Some(position(3, Some(10))));
    }
}
