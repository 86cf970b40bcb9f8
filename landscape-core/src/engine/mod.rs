// landscape-core/src/engine/mod.rs
// ============================================================================
// Module: Engine
// Description: The audit/payload backend contracts, the orchestrator that
//              drives a run, checkpointing, and retention.
// Purpose: Define the seams the orchestrator is built against so that
//          `landscape-store-sqlite` and `landscape-payload` can be swapped
//          or mocked independently of run logic.
// Dependencies: crate::model, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! `AuditRecorder` is the write/read contract against the 17-table audit
//! trail; `PayloadStore` is the contract against content-addressed blob
//! storage; `ExpressionEvaluator` is the contract against the whitelisted
//! gate-condition language implemented in `landscape-expr`. None of those
//! crates are a dependency of this one — `landscape-core` depends on
//! nothing but its own model, so the backends can depend on it instead of
//! the other way around.

pub mod checkpoint;
pub mod orchestrator;
pub mod retention;

use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::entities::Artifact;
use crate::model::entities::Batch;
use crate::model::entities::BatchMember;
use crate::model::entities::BatchOutput;
use crate::model::entities::Call;
use crate::model::entities::Checkpoint;
use crate::model::entities::Edge;
use crate::model::entities::Node;
use crate::model::entities::NodeStateStatus;
use crate::model::entities::NodeState;
use crate::model::entities::Row;
use crate::model::entities::RoutingEvent;
use crate::model::entities::Run;
use crate::model::entities::RunStatus;
use crate::model::entities::Token;
use crate::model::entities::TokenOutcome;
use crate::model::entities::TokenParent;
use crate::model::entities::TransformErrorRecord;
use crate::model::entities::ValidationErrorRecord;
use crate::model::ids::BatchId;
use crate::model::ids::NodeId;
use crate::model::ids::RunId;
use crate::model::ids::StateId;
use crate::model::ids::TokenId;

/// Errors surfaced by an [`AuditRecorder`] implementation.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// The backing store rejected or failed a write or read.
    #[error("audit backend error: {0}")]
    Backend(String),
    /// A record referenced by id could not be found.
    #[error("record not found: {0}")]
    NotFound(String),
}

/// The write/read contract against the audit trail. Implemented by
/// `landscape-store-sqlite`; the orchestrator is generic over this trait so
/// it never depends on a concrete storage engine.
pub trait AuditRecorder {
    /// Records a new run.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_run(&mut self, run: &Run) -> Result<(), RecorderError>;

    /// Updates a run's status and, if terminal, its completion time.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn update_run_status(
        &mut self,
        run_id: &RunId,
        status: RunStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> Result<(), RecorderError>;

    /// Records a node registered in a run's graph.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_node(&mut self, node: &Node) -> Result<(), RecorderError>;

    /// Records an edge registered in a run's graph.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_edge(&mut self, edge: &Edge) -> Result<(), RecorderError>;

    /// Records a row emitted by a source.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_row(&mut self, row: &Row) -> Result<(), RecorderError>;

    /// Records a token.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_token(&mut self, token: &Token) -> Result<(), RecorderError>;

    /// Records a parent/child token lineage edge.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_token_parent(&mut self, parent: &TokenParent) -> Result<(), RecorderError>;

    /// Records a new node-state attempt, in `Open` or `Pending` status.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_node_state(&mut self, state: &NodeState) -> Result<(), RecorderError>;

    /// Transitions an existing node-state attempt to a new status.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails or `state_id` is unknown.
    fn update_node_state_status(
        &mut self,
        state_id: &StateId,
        status: NodeStateStatus,
    ) -> Result<(), RecorderError>;

    /// Records a gate routing decision.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_routing_event(&mut self, event: &RoutingEvent) -> Result<(), RecorderError>;

    /// Records an external call made within a node-state attempt.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_call(&mut self, call: &Call) -> Result<(), RecorderError>;

    /// Records a sink write.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_artifact(&mut self, artifact: &Artifact) -> Result<(), RecorderError>;

    /// Records a token's (possibly non-terminal) outcome.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails, or if `outcome.is_terminal`
    /// and a terminal outcome already exists for this token.
    fn insert_token_outcome(&mut self, outcome: &TokenOutcome) -> Result<(), RecorderError>;

    /// Records a checkpoint.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), RecorderError>;

    /// Records a new aggregation batch.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_batch(&mut self, batch: &Batch) -> Result<(), RecorderError>;

    /// Records one token buffered into a batch.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_batch_member(&mut self, member: &BatchMember) -> Result<(), RecorderError>;

    /// Records one output token produced by a batch's trigger.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_batch_output(&mut self, output: &BatchOutput) -> Result<(), RecorderError>;

    /// Records a schema validation error.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_validation_error(
        &mut self,
        error: &ValidationErrorRecord,
    ) -> Result<(), RecorderError>;

    /// Records a transform-raised error.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn insert_transform_error(
        &mut self,
        error: &TransformErrorRecord,
    ) -> Result<(), RecorderError>;

    /// Returns the most recent checkpoint for a run, if any.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError>;

    /// Returns whether a token already has a terminal outcome recorded.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn has_terminal_outcome(&self, token_id: &TokenId) -> Result<bool, RecorderError>;

    /// Returns every row recorded for a run with `row_index` greater than
    /// `after_row_index` (or every row, if `None`), in ascending order.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn rows_after(
        &self,
        run_id: &RunId,
        after_row_index: Option<u64>,
    ) -> Result<Vec<Row>, RecorderError>;

    /// Returns every open (untriggered) batch for a node, if any.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn open_batches(&self, node_id: &NodeId) -> Result<Vec<Batch>, RecorderError>;

    /// Returns every member currently buffered into a batch.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMember>, RecorderError>;

    /// Returns every payload-store key a run's rows and calls reference
    /// (`source_data_ref`, `request_ref`, `response_ref`). Artifact content
    /// is deliberately excluded: artifacts are a run's output, not its
    /// working data, and are never purge-eligible through this path.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the read fails.
    fn referenced_payload_hashes(&self, run_id: &RunId) -> Result<Vec<String>, RecorderError>;

    /// Updates a run's reproducibility grade, recomputed after a purge.
    ///
    /// # Errors
    /// Returns [`RecorderError`] if the write fails.
    fn update_reproducibility_grade(
        &mut self,
        run_id: &RunId,
        grade: Option<String>,
    ) -> Result<(), RecorderError>;
}

/// Errors surfaced by a [`PayloadStore`] implementation.
#[derive(Debug, Error)]
pub enum PayloadStoreError {
    /// The backing store rejected or failed an operation.
    #[error("payload store error: {0}")]
    Backend(String),
    /// A stored payload's content did not hash to its key.
    #[error("payload integrity check failed: expected {expected}, got {actual}")]
    HashMismatch {
        /// The hash the payload was stored under.
        expected: String,
        /// The hash actually computed on read.
        actual: String,
    },
}

/// The content-addressed blob storage contract. Implemented by
/// `landscape-payload`.
pub trait PayloadStore {
    /// Stores `bytes`, returning its content hash.
    ///
    /// # Errors
    /// Returns [`PayloadStoreError`] if the write fails.
    fn put(&self, bytes: &[u8]) -> Result<String, PayloadStoreError>;

    /// Retrieves the bytes stored under `hash`, verifying integrity on read.
    ///
    /// # Errors
    /// Returns [`PayloadStoreError::HashMismatch`] if the stored content no
    /// longer hashes to `hash`, or [`PayloadStoreError::Backend`] if the
    /// read fails.
    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError>;

    /// Returns whether a payload is stored under `hash`.
    ///
    /// # Errors
    /// Returns [`PayloadStoreError`] if the check fails.
    fn exists(&self, hash: &str) -> Result<bool, PayloadStoreError>;

    /// Deletes the payload stored under `hash`, if any.
    ///
    /// # Errors
    /// Returns [`PayloadStoreError`] if the delete fails.
    fn delete(&self, hash: &str) -> Result<(), PayloadStoreError>;
}

/// Errors surfaced by an [`ExpressionEvaluator`] implementation.
#[derive(Debug, Error)]
#[error("expression evaluation failed: {0}")]
pub struct ExprEvalError(pub String);

/// The whitelisted gate-condition evaluation contract. Implemented by
/// `landscape-expr`.
pub trait ExpressionEvaluator {
    /// Evaluates a boolean expression against a row.
    ///
    /// # Errors
    /// Returns [`ExprEvalError`] if the expression fails to parse or
    /// evaluate (e.g. a referenced field is missing).
    fn evaluate(&self, expression: &str, row: &Value) -> Result<bool, ExprEvalError>;
}

/// A run-scoped, monotonically increasing id generator. Mirrors the
/// sequential `format!("call-{n}")` style identifiers are minted in; there
/// is no randomness in the id space, so two runs over identical input
/// produce identical identifiers, which keeps fixtures and golden-hash
/// tests reproducible.
#[derive(Debug, Clone)]
pub struct IdSequence {
    run_id: RunId,
    counters: std::collections::HashMap<&'static str, u64>,
}

impl IdSequence {
    /// Creates a new id sequence scoped to `run_id`.
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            counters: std::collections::HashMap::new(),
        }
    }

    /// Mints the next identifier of `kind` within this run, formatted as
    /// `"{run_id}-{kind}-{n}"`.
    pub fn next(&mut self, kind: &'static str) -> String {
        let counter = self.counters.entry(kind).or_insert(0);
        *counter += 1;
        format!("{}-{kind}-{counter}", self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sequence_is_deterministic_and_scoped_by_kind() {
        let mut seq = IdSequence::new(RunId::new("run-1"));
        assert_eq!(seq.next("row"), "run-1-row-1");
        assert_eq!(seq.next("row"), "run-1-row-2");
        assert_eq!(seq.next("token"), "run-1-token-1");
    }
}
