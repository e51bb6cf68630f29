use serde::{Deserialize, Serialize};

use crate::constants::IndexFlags;
use crate::keypath::KeyPath;

/// Name and version of a database held by the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSchema {
    pub fn flags(&self) -> IndexFlags {
        let mut flags = IndexFlags::empty();
        flags.set(IndexFlags::UNIQUE, self.unique);
        flags.set(IndexFlags::MULTI_ENTRY, self.multi_entry);
        flags
    }
}

/// Object store layout as reported by the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    #[serde(default)]
    pub key_path: Option<KeyPath>,
    #[serde(default)]
    pub auto_increment: bool,
    /// Last value handed out by the store's key generator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_generator: Option<u64>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}
