use bitflags::bitflags;

// Index flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IndexFlags: u32 {
        const UNIQUE = 0x01;
        const MULTI_ENTRY = 0x02;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// Admitted by the database scheduler
        const STARTED = 0x01;
        /// At least one write reached the working set
        const DIRTY = 0x02;
    }
}

/// Largest value a key generator will hand out (2^53 - 1)
pub const MAX_GENERATED_KEY: u64 = (1 << 53) - 1;

/// Default upper bound on tasks drained by a single `run_until_idle`
pub const DEFAULT_MAX_TASKS_PER_RUN: usize = 1_000_000;

// Backing store methods
pub const METHOD_OPEN_DATABASE: &str = "openDatabase";
pub const METHOD_CLOSE_DATABASE: &str = "closeDatabase";
pub const METHOD_DELETE_DATABASE: &str = "deleteDatabase";
pub const METHOD_GET_DATABASE_INFO: &str = "getDatabaseInfo";
pub const METHOD_GET_DATABASE_STORES: &str = "getDatabaseStores";
pub const METHOD_EXECUTE_READ: &str = "executeRead";
pub const METHOD_EXECUTE_TRANSACTION: &str = "executeTransaction";
