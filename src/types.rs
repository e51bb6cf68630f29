use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

id_type!(
    /// Handle of a transaction owned by the engine
    TransactionId
);
id_type!(
    /// Handle of an open database connection
    ConnectionId
);
id_type!(
    /// Handle of a pending or settled request
    RequestId
);
id_type!(
    /// Handle of a cursor
    CursorId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Inactive,
    Committing,
    Aborting,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Next,
    NextUnique,
    Prev,
    PrevUnique,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        matches!(self, Direction::Next | Direction::NextUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, Direction::NextUnique | Direction::PrevUnique)
    }
}

/// Whether a cursor loads record values while iterating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    KeyOnly,
    WithValue,
}
