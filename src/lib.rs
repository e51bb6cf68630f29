// src/lib.rs
pub mod constants;
pub mod cursor;
pub mod database;
pub mod env;
pub mod error;
pub mod handle;
pub mod host;
pub mod index;
pub mod key;
pub mod key_range;
pub mod keypath;
mod merge;
pub mod meta;
pub mod object_store;
pub mod protocol;
pub mod record_store;
pub mod request;
pub mod rpc;
pub mod transaction;
pub mod types;
pub mod value;

pub use constants::IndexFlags;
pub use database::VersionChangeCallback;
pub use env::{EngineOptions, EngineState, Event, Upgrade, UpgradeCallback};
pub use error::{Error, Result};
pub use handle::{IndexHandle, ObjectStoreHandle};
pub use host::MemoryBackingStore;
pub use key::Key;
pub use key_range::KeyRange;
pub use keypath::KeyPath;
pub use request::{Callback, Disposition, Outcome, Output};
pub use rpc::{Channel, LoopbackChannel, RpcClient, RpcServer};
pub use types::{ConnectionId, CursorId, Direction, RequestId, TransactionId, TransactionMode, TransactionState};
pub use value::Value;
