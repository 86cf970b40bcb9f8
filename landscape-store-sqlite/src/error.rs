// landscape-store-sqlite/src/error.rs
// ============================================================================
// Module: Store Errors
// Description: Error types for the SQLite-backed audit trail.
// Purpose: Classify failures the way the audit trail's callers need to react
//          to them: transient I/O, a corrupt record, a schema that does not
//          match what this crate expects, or a plain programming mistake.
// Dependencies: landscape_core, thiserror
// ============================================================================

use landscape_core::RecorderError;
use thiserror::Error;

/// Errors raised by [`crate::store::LandscapeStore`] and
/// [`crate::export::LandscapeExporter`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening or creating the database file failed.
    #[error("landscape store io error: {0}")]
    Io(String),
    /// The `SQLite` engine rejected a statement.
    #[error("landscape store db error: {0}")]
    Db(String),
    /// A stored record's hash did not match its recomputed hash.
    #[error("landscape store corruption: {0}")]
    Corrupt(String),
    /// The database's schema does not match what this crate expects.
    #[error("landscape store schema mismatch: {0}")]
    SchemaCompatibility(String),
    /// A caller passed invalid arguments or the stored data could not be
    /// decoded into the expected shape.
    #[error("landscape store invalid data: {0}")]
    Invalid(String),
    /// The requested record does not exist.
    #[error("landscape store record not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<StoreError> for RecorderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => Self::NotFound(message),
            other => Self::Backend(other.to_string()),
        }
    }
}
