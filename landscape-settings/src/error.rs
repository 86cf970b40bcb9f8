// landscape-settings/src/error.rs
// ============================================================================
// Module: Settings Errors
// Description: Error type for loading settings from the process environment.
// Purpose: Report exactly which setting was missing or malformed, rather
//          than a bare parse failure.
// Dependencies: thiserror
// ============================================================================

use thiserror::Error;

/// Errors raised while loading [`crate::Settings`] from the environment.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// A required environment variable was not set.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for environment variable {name}: {reason}")]
    Invalid {
        /// The offending variable's name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
