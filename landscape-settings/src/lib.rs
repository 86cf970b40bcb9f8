// landscape-settings/src/lib.rs
// ============================================================================
// Module: Landscape Settings
// Description: Process-environment configuration for the Landscape engine.
// Purpose: Give every binary embedding this engine one place to read the
//          audit trail's location, the payload store's root, the export
//          signing key, and the log level.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! This crate loads [`Settings`] from the process environment. It does not
//! read configuration files; orchestrators, CLIs, and test harnesses that
//! need file-based configuration are expected to layer that on top and call
//! [`Settings::from_env`] (or construct [`Settings`] directly) once the
//! values are resolved.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod error;
pub mod settings;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use error::SettingsError;
pub use settings::Settings;
pub use settings::SigningKey;
