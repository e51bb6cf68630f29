//! Serializable surface between the engine and the backing store.
//!
//! Action logs use the same `{ "method", "params" }` shape as RPC
//! notifications so the remote side can replay them in order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cursor::{Position, Seek};
use crate::key::Key;
use crate::key_range::KeyRange;
use crate::keypath::KeyPath;
use crate::value::Value;

/// One row of a remote read: an object store record, or an index entry
/// together with the primary key it points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub key: Key,
    pub primary_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Entry {
    pub(crate) fn position(&self) -> Position {
        Position {
            key: self.key.clone(),
            primary_key: Some(self.primary_key.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ReadCall {
    /// Entries in ascending (key, primary key) order, resuming after `after`
    GetAll {
        #[serde(default)]
        index_name: Option<String>,
        #[serde(default)]
        query: Option<KeyRange>,
        #[serde(default)]
        count: Option<u32>,
        #[serde(default)]
        after: Option<Position>,
        values: bool,
    },
    Count {
        #[serde(default)]
        index_name: Option<String>,
        #[serde(default)]
        query: Option<KeyRange>,
    },
    /// First entry admitted by `seek` in its direction
    GetNextFromCursor {
        #[serde(default)]
        index_name: Option<String>,
        seek: Seek,
        values: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReadParams {
    pub db_name: String,
    pub store: String,
    pub call: ReadCall,
}

/// Write replayed against one object store. Keys are always resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WriteOp {
    Add { key: Key, value: Value },
    Put { key: Key, value: Value },
    Delete { query: KeyRange },
    Clear,
    /// Overwrite the record under a cursor, writing it back if it was deleted
    Replace { key: Key, value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SchemaAction {
    CreateIndex {
        name: String,
        key_path: KeyPath,
        #[serde(default)]
        unique: bool,
        #[serde(default)]
        multi_entry: bool,
    },
    DeleteIndex { name: String },
    RenameIndex { name: String, new_name: String },
    RenameObjectStore { new_name: String },
}

/// Step of an upgrade applied to one object store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreAction {
    Schema(SchemaAction),
    Write(WriteOp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum UpgradeAction {
    CreateObjectStore {
        name: String,
        #[serde(default)]
        key_path: Option<KeyPath>,
        #[serde(default)]
        auto_increment: bool,
        #[serde(default)]
        do_on_upgrade: Vec<StoreAction>,
    },
    DeleteObjectStore { name: String },
    ModifyObjectStore {
        name: String,
        #[serde(default)]
        do_on_upgrade: Vec<StoreAction>,
    },
}

/// Writes of one ordinary transaction, grouped per object store
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteLog {
    pub db_name: String,
    pub ops: BTreeMap<String, Vec<WriteOp>>,
}

impl WriteLog {
    pub fn new(db_name: &str) -> Self {
        WriteLog {
            db_name: db_name.to_string(),
            ops: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabaseParams {
    pub name: String,
    pub version: u64,
    #[serde(default)]
    pub do_on_upgrade: Vec<UpgradeAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}
