// landscape-core/src/interfaces.rs
// ============================================================================
// Module: Plugin Interfaces
// Description: Backend-agnostic contracts for sources, transforms, gates,
//              and sinks.
// Purpose: Define the external interface boundary the orchestrator consumes
//          without embedding any concrete plugin implementation.
// Dependencies: crate::model
// ============================================================================

//! ## Overview
//! Concrete sources, transforms, and sinks are external collaborators, not
//! part of this crate. What belongs here is the contract: plain, blocking
//! trait methods returning typed `Result`s. There is no async runtime baked
//! into these contracts — suspension (I/O, external calls) happens inside a
//! method call, never across one, so the orchestrator never holds a database
//! transaction open across a plugin invocation.

use serde_json::Value;
use thiserror::Error;

use crate::model::entities::Determinism;
use crate::model::ids::NodeId;
use crate::model::ids::RouteLabel;
use crate::model::ids::RunId;

/// Context passed to every plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginContext {
    /// The run this invocation belongs to.
    pub run_id: RunId,
    /// The node this invocation is running as.
    pub node_id: NodeId,
}

/// Errors a plugin may report back to the orchestrator.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin failed in a way the orchestrator should record as a
    /// transform/validation error and recover from per `on_error` policy.
    #[error("plugin error: {0}")]
    Failed(String),
}

/// One row as produced by a source, including rows that already failed
/// validation at the point of ingestion.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRow {
    /// A row that parsed and validated successfully.
    Valid(Value),
    /// A row that failed validation; carries the raw payload and a message
    /// so it can still be recorded and quarantined rather than silently
    /// dropped.
    Invalid {
        /// The raw, unvalidated payload.
        payload: Value,
        /// Why the row failed validation.
        validation_error: String,
    },
}

/// Produces rows for a run.
pub trait Source {
    /// The schema this source declares for its output rows.
    fn output_schema(&self) -> Value;

    /// Loads all rows for this run.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the source cannot be read at all (a
    /// fatal, run-level failure — not a per-row concern).
    fn load(&mut self, ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError>;
}

/// Maps rows to rows. `is_batch_aware` transforms are also used to implement
/// aggregation and coalesce node bodies, where `process` receives the full
/// buffered or joined batch rather than a single row.
pub trait Transform {
    /// The schema this transform requires on its input rows.
    fn input_schema(&self) -> Value;

    /// The schema this transform declares for its output rows.
    fn output_schema(&self) -> Value;

    /// This transform's reproducibility class.
    fn determinism(&self) -> Determinism;

    /// Whether this transform must receive its full batch at once rather
    /// than being invoked per row. `false` for ordinary transforms.
    fn is_batch_aware(&self) -> bool {
        false
    }

    /// Processes a batch of rows (a single row, for non-batch-aware
    /// transforms) into zero or more output rows.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] on a row-level failure; the orchestrator
    /// routes it to the node's configured `on_error` sink or discards it.
    fn process(&mut self, rows: &[Value], ctx: &PluginContext) -> Result<Vec<Value>, PluginError>;
}

/// Routes a row to one of a gate's declared outgoing edges. Used only by
/// plugin-driven gates; expression-driven gates are evaluated directly by
/// `landscape-expr` and never call into a `Gate` plugin.
pub trait Gate {
    /// The set of route labels this gate may return.
    fn routes(&self) -> Vec<RouteLabel>;

    /// Route labels that, if selected, cause a fork rather than a move.
    fn fork_to(&self) -> Option<Vec<RouteLabel>> {
        None
    }

    /// Decides which route a row takes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the row cannot be routed.
    fn route(&mut self, row: &Value, ctx: &PluginContext) -> Result<RouteLabel, PluginError>;
}

/// Describes an artifact a sink wrote, as reported back to the orchestrator
/// for recording.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDescriptor {
    /// MIME-like type describing the artifact's content.
    pub artifact_type: String,
    /// `stable_hash` of the artifact's content, computed by the sink.
    pub content_hash: String,
    /// Where the artifact was written.
    pub path_or_uri: String,
    /// Size of the artifact in bytes, if known.
    pub size_bytes: Option<u64>,
    /// Sink-supplied metadata.
    pub metadata_json: Option<Value>,
}

/// Consumes rows and produces artifacts.
pub trait Sink {
    /// The schema this sink requires on its input rows.
    fn input_schema(&self) -> Value;

    /// Writes one row, returning a descriptor of what was written.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the write fails.
    fn write(&mut self, row: &Value, ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError>;
}
