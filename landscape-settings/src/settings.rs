// landscape-settings/src/settings.rs
// ============================================================================
// Module: Settings
// Description: Process-environment configuration for a Landscape run.
// Purpose: Give every binary embedding this engine (CLI, service, test
//          harness) one place to read the audit trail's location, the
//          payload store's root, the export signing key, and the log
//          level, without pulling in a config-file loader.
// Dependencies: std
// ============================================================================

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::SettingsError;

const AUDIT_DB_PATH_VAR: &str = "LANDSCAPE_AUDIT_DB_PATH";
const PAYLOAD_ROOT_VAR: &str = "LANDSCAPE_PAYLOAD_ROOT";
const EXPORT_SIGNING_KEY_VAR: &str = "LANDSCAPE_EXPORT_SIGNING_KEY";
const LOG_LEVEL_VAR: &str = "LANDSCAPE_LOG_LEVEL";

/// Minimum accepted length, in bytes, of the export signing key. Short keys
/// defeat the point of HMAC-signing an export.
const MIN_SIGNING_KEY_BYTES: usize = 16;

/// Default log level used when [`LOG_LEVEL_VAR`] is unset.
const DEFAULT_LOG_LEVEL: &str = "info";

/// The HMAC key used to sign export records, held so it never prints in a
/// log line or a `{:?}`-formatted error by accident.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Returns the key's raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SigningKey").field(&"<redacted>").finish()
    }
}

/// Process-wide settings for running the Landscape engine, read from the
/// environment at process start.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the `SQLite` audit trail database.
    pub audit_db_path: PathBuf,
    /// Root directory of the content-addressed payload store.
    pub payload_store_root: PathBuf,
    /// Key used to sign export records.
    pub export_signing_key: SigningKey,
    /// `tracing` filter string (e.g. `"info"`, `"landscape_core=debug"`).
    pub log_level: String,
}

impl Settings {
    /// Loads settings from the process environment.
    ///
    /// # Errors
    /// Returns [`SettingsError::Missing`] if a required variable is unset,
    /// or [`SettingsError::Invalid`] if the signing key is too short.
    pub fn from_env() -> Result<Self, SettingsError> {
        let audit_db_path = PathBuf::from(required_var(AUDIT_DB_PATH_VAR)?);
        let payload_store_root = PathBuf::from(required_var(PAYLOAD_ROOT_VAR)?);
        let signing_key_raw = required_var(EXPORT_SIGNING_KEY_VAR)?;
        if signing_key_raw.len() < MIN_SIGNING_KEY_BYTES {
            return Err(SettingsError::Invalid {
                name: EXPORT_SIGNING_KEY_VAR,
                reason: format!("must be at least {MIN_SIGNING_KEY_BYTES} bytes"),
            });
        }
        let log_level =
            env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        Ok(Self {
            audit_db_path,
            payload_store_root,
            export_signing_key: SigningKey(signing_key_raw.into_bytes()),
            log_level,
        })
    }
}

fn required_var(name: &'static str) -> Result<String, SettingsError> {
    env::var(name).map_err(|_| SettingsError::Missing(name))
}
