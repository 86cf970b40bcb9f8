// landscape-store-sqlite/src/config.rs
// ============================================================================
// Module: Store Configuration
// Description: Connection and pragma configuration for the audit trail.
// Purpose: Mirror the teacher's `SqliteStoreConfig` pragma knobs (journal
//          mode, sync mode, busy timeout) without the read-pool/writer-queue
//          machinery a high-throughput store needs; this store serves a
//          single orchestrator driving one run at a time.
// Dependencies: std
// ============================================================================

use std::path::PathBuf;

/// Default busy timeout, in milliseconds, for the underlying connection.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// `SQLite` journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl StoreJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl StoreSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for opening a [`crate::store::LandscapeStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Journal mode.
    pub journal_mode: StoreJournalMode,
    /// Sync mode.
    pub sync_mode: StoreSyncMode,
}

impl StoreConfig {
    /// Builds a configuration at `path` with the store's default pragmas.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: StoreJournalMode::Wal,
            sync_mode: StoreSyncMode::Full,
        }
    }
}
