// landscape-core/src/model/entities.rs
// ============================================================================
// Module: Audit Entities
// Description: The Landscape's relational data model, expressed as plain
//              structs and tagged-union enums.
// Purpose: Give every recorder and reader a single shared definition of what
//          a run, node, row, token, state, event, call, artifact, outcome,
//          checkpoint, batch, and error record look like.
// Dependencies: serde, serde_json, time
// ============================================================================

//! ## Overview
//! These types mirror the 17 tables of the audit trail one-to-one. They carry
//! no storage-specific detail (no SQL types, no row-mapping code) — that
//! lives in the storage backend crates. `NodeState` and `NodeConfig` are
//! modeled as tagged `enum`s rather than base/subclass hierarchies, so an
//! exhaustive `match` at every read site is the only way to handle them.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::model::ids::ArtifactId;
use crate::model::ids::BatchId;
use crate::model::ids::BranchName;
use crate::model::ids::CallId;
use crate::model::ids::CheckpointId;
use crate::model::ids::EdgeId;
use crate::model::ids::NodeId;
use crate::model::ids::OutcomeId;
use crate::model::ids::PluginName;
use crate::model::ids::RouteLabel;
use crate::model::ids::RoutingEventId;
use crate::model::ids::RowId;
use crate::model::ids::RunId;
use crate::model::ids::StateId;
use crate::model::ids::TokenId;
use crate::model::ids::TransformErrorId;
use crate::model::ids::ValidationErrorId;

// ============================================================================
// SECTION: Run
// ============================================================================

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is actively processing rows.
    Running,
    /// Every row reached a terminal outcome and the run finished normally.
    Completed,
    /// The run stopped due to an unrecoverable error.
    Failed,
    /// The run was cancelled by an operator.
    Cancelled,
}

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Identifier for this run.
    pub run_id: RunId,
    /// When the run began.
    pub started_at: OffsetDateTime,
    /// When the run reached a terminal status, if it has.
    pub completed_at: Option<OffsetDateTime>,
    /// `stable_hash` of the run's configuration.
    pub config_hash: String,
    /// The settings the run was executed with, as canonical JSON.
    pub settings_json: Value,
    /// The canonicalizer version used to compute every hash in this run.
    pub canonical_version: String,
    /// Current run status.
    pub status: RunStatus,
    /// Export status, set once `export_run` has been invoked.
    pub export_status: Option<String>,
    /// Reproducibility grade, recomputed after any payload purge.
    pub reproducibility_grade: Option<String>,
}

// ============================================================================
// SECTION: Node
// ============================================================================

/// The kind of node a graph position plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces rows.
    Source,
    /// Maps rows to rows.
    Transform,
    /// Routes a row to one of several outgoing edges.
    Gate,
    /// Buffers rows and emits on a trigger.
    Aggregation,
    /// Merges rows from multiple upstream branches.
    Coalesce,
    /// Consumes rows and produces artifacts.
    Sink,
}

/// A node's declared reproducibility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    /// Guaranteed to produce identical output for identical input.
    Guaranteed,
    /// Usually reproducible, but not guaranteed (e.g. floating-point ops
    /// sensitive to hardware).
    BestEffort,
    /// Not reproducible at all (e.g. current time, randomness).
    None,
    /// Reads external state (files, databases) without mutating it.
    IoRead,
    /// Mutates external state.
    IoWrite,
    /// Calls an external service (LLM, HTTP API).
    ExternalCall,
}

/// A node registered in a run's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier for this node.
    pub node_id: NodeId,
    /// The run this node belongs to.
    pub run_id: RunId,
    /// Name of the plugin implementing this node.
    pub plugin_name: PluginName,
    /// The kind of node.
    pub node_type: NodeKind,
    /// Version string of the plugin implementation.
    pub plugin_version: String,
    /// Declared reproducibility class.
    pub determinism: Determinism,
    /// `stable_hash(config_to_dict(config))`.
    pub config_hash: String,
    /// The node's config, projected via `config_to_dict` (`None` fields
    /// omitted).
    pub config_json: Value,
    /// Topological position, assigned at construction time.
    pub sequence_in_pipeline: Option<u32>,
    /// `stable_hash` of the node's output schema, if it declares one.
    pub schema_hash: Option<String>,
    /// How the schema was derived: `declared`, `inherited`, or `computed`.
    pub schema_mode: Option<String>,
    /// The schema's field list, as canonical JSON.
    pub schema_fields: Option<Value>,
    /// When the node was registered.
    pub registered_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Edge
// ============================================================================

/// Whether traversing an edge moves the token or forks a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// The existing token continues along this edge.
    Move,
    /// A new child token is created for this edge.
    Fork,
}

/// A directed edge between two nodes in a run's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Identifier for this edge.
    pub edge_id: EdgeId,
    /// The run this edge belongs to.
    pub run_id: RunId,
    /// Upstream node.
    pub from_node_id: NodeId,
    /// Downstream node.
    pub to_node_id: NodeId,
    /// Route label; unique together with `(run_id, from_node_id)`.
    pub label: RouteLabel,
    /// Default traversal mode for this edge.
    pub default_mode: EdgeMode,
    /// When the edge was created.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Row / Token
// ============================================================================

/// One row emitted by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Identifier for this row.
    pub row_id: RowId,
    /// The run this row belongs to.
    pub run_id: RunId,
    /// The source node that produced this row.
    pub source_node_id: NodeId,
    /// Dense, strictly increasing emission order within the run.
    pub row_index: u64,
    /// `stable_hash` of the row's data.
    pub source_data_hash: String,
    /// Payload store key for the row's data, if stored.
    pub source_data_ref: Option<String>,
    /// When the row was recorded.
    pub created_at: OffsetDateTime,
}

/// A lineage identity flowing through the graph. A row may produce more than
/// one token via a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Identifier for this token.
    pub token_id: TokenId,
    /// The row this token (or its oldest ancestor) originated from.
    pub row_id: RowId,
    /// The branch this token is travelling on, if produced by a coalesce
    /// upstream gate.
    pub branch_name: Option<BranchName>,
    /// Shared identifier across all children produced by one fork.
    pub fork_group_id: Option<String>,
    /// Shared identifier across tokens a coalesce is waiting to join.
    pub join_group_id: Option<String>,
    /// Shared identifier across tokens produced by one expansion.
    pub expand_group_id: Option<String>,
    /// When the token was created.
    pub created_at: OffsetDateTime,
}

/// Explicit lineage edge from a child token to a parent token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenParent {
    /// The child token.
    pub token_id: TokenId,
    /// The parent token.
    pub parent_token_id: TokenId,
    /// Position of this parent among the child's parents (fork/join
    /// ordering).
    pub ordinal: u32,
}

// ============================================================================
// SECTION: Node state
// ============================================================================

/// The terminal detail recorded when a node-state attempt finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStateStatus {
    /// The attempt has been recorded but not yet started.
    Open,
    /// The attempt is in flight.
    Pending,
    /// The attempt finished successfully.
    Completed {
        /// When the attempt finished.
        completed_at: OffsetDateTime,
        /// Wall-clock duration of the attempt.
        duration_ms: u64,
        /// `stable_hash` of the node's output for this attempt.
        output_hash: String,
        /// Optional post-execution context, as canonical JSON.
        context_after_json: Option<Value>,
    },
    /// The attempt failed.
    Failed {
        /// When the attempt failed.
        completed_at: OffsetDateTime,
        /// Wall-clock duration of the attempt.
        duration_ms: u64,
        /// `stable_hash` of the recorded error.
        error_hash: String,
        /// Optional post-execution context, as canonical JSON.
        context_after_json: Option<Value>,
    },
}

/// One attempt of one node on one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Identifier for this attempt.
    pub state_id: StateId,
    /// The run this attempt belongs to.
    pub run_id: RunId,
    /// The token this attempt processed.
    pub token_id: TokenId,
    /// The node this attempt ran.
    pub node_id: NodeId,
    /// The token's position in topological order at the time of this
    /// attempt.
    pub step_index: u32,
    /// Retry counter; `0` for the first attempt.
    pub attempt: u32,
    /// When the attempt started.
    pub started_at: OffsetDateTime,
    /// `stable_hash` of the attempt's input.
    pub input_hash: String,
    /// Optional pre-execution context, as canonical JSON.
    pub context_before_json: Option<Value>,
    /// Terminal (or not-yet-terminal) status of the attempt.
    pub status: NodeStateStatus,
}

// ============================================================================
// SECTION: Routing
// ============================================================================

/// One gate routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEvent {
    /// Identifier for this event.
    pub event_id: RoutingEventId,
    /// The node-state attempt that produced this routing decision.
    pub state_id: StateId,
    /// Groups routing events produced by the same gate evaluation (a fork
    /// produces more than one).
    pub routing_group_id: String,
    /// Human-readable description of the decision.
    pub decision: String,
    /// The selected outgoing edge's label.
    pub route_label: RouteLabel,
    /// Whether this routing event produced a fork.
    pub is_fork: bool,
    /// When the event was recorded.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Calls
// ============================================================================

/// Outcome of an external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The call succeeded.
    Success,
    /// The call failed.
    Failed,
    /// The call did not complete within its deadline.
    Timeout,
}

/// One external call made within a node-state attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Identifier for this call.
    pub call_id: CallId,
    /// The node-state attempt this call was made within.
    pub state_id: StateId,
    /// Position of this call among the attempt's calls.
    pub call_index: u32,
    /// Free-form call kind (`llm`, `http`, `db`, …); plugins may extend this
    /// set, so it is not a closed enum.
    pub call_type: String,
    /// Outcome of the call.
    pub status: CallStatus,
    /// `stable_hash` of the request.
    pub request_hash: String,
    /// Payload store key for the request body, if stored.
    pub request_ref: Option<String>,
    /// `stable_hash` of the response, if one was received.
    pub response_hash: Option<String>,
    /// Payload store key for the response body, if stored.
    pub response_ref: Option<String>,
    /// Observed latency in milliseconds.
    pub latency_ms: Option<u64>,
    /// Structured error detail, if the call failed.
    pub error_json: Option<Value>,
    /// When the call was recorded.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Artifacts
// ============================================================================

/// One sink write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Identifier for this artifact.
    pub artifact_id: ArtifactId,
    /// The run this artifact belongs to.
    pub run_id: RunId,
    /// The sink node that produced this artifact.
    pub sink_node_id: NodeId,
    /// MIME-like type describing the artifact's content.
    pub artifact_type: String,
    /// `stable_hash` of the artifact's content.
    pub content_hash: String,
    /// Where the artifact was written.
    pub path_or_uri: String,
    /// Size of the artifact in bytes, if known.
    pub size_bytes: Option<u64>,
    /// Sink-supplied metadata, as canonical JSON.
    pub metadata_json: Option<Value>,
    /// When the artifact was recorded.
    pub created_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Token outcomes
// ============================================================================

/// The kind of disposition a token reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenOutcomeKind {
    /// Written to a sink.
    Completed,
    /// Routed onward (non-terminal, or terminal if the route is a dead end).
    Routed,
    /// Discarded by an `on_error: discard` transform.
    Discarded,
    /// Quarantined after an unrecoverable row-level error.
    Failed,
    /// Buffered inside an aggregation, awaiting its trigger.
    Buffered,
}

/// The terminal (or non-terminal, intermediate) disposition of a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenOutcome {
    /// Identifier for this outcome record.
    pub outcome_id: OutcomeId,
    /// The run this outcome belongs to.
    pub run_id: RunId,
    /// The token this outcome describes.
    pub token_id: TokenId,
    /// The kind of disposition.
    pub outcome: TokenOutcomeKind,
    /// Whether this is the token's final disposition. At most one terminal
    /// outcome may exist per token.
    pub is_terminal: bool,
    /// The sink that produced this outcome, if `outcome == Completed`.
    pub sink_name: Option<PluginName>,
    /// The aggregation batch this outcome belongs to, if any.
    pub batch_id: Option<BatchId>,
    /// Shared identifier across a fork's children, if produced by a fork.
    pub fork_group_id: Option<String>,
    /// `stable_hash` of the recorded error, if `outcome == Failed`.
    pub error_hash: Option<String>,
    /// Additional context, as canonical JSON.
    pub context_json: Option<Value>,
    /// When the outcome was recorded.
    pub recorded_at: OffsetDateTime,
}

// ============================================================================
// SECTION: Checkpoints
// ============================================================================

/// A resumable snapshot of run progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifier for this checkpoint.
    pub checkpoint_id: CheckpointId,
    /// The run this checkpoint belongs to.
    pub run_id: RunId,
    /// The token processed up to (and including) this checkpoint.
    pub token_id: TokenId,
    /// The node this checkpoint was taken at.
    pub node_id: NodeId,
    /// Monotonically increasing per-run sequence number.
    pub sequence_number: u64,
    /// When the checkpoint was created.
    pub created_at: OffsetDateTime,
    /// `upstream_topology_hash(node_id)` at checkpoint time.
    pub upstream_topology_hash: String,
    /// `stable_hash(config_to_dict(node.config))` at checkpoint time.
    pub checkpoint_node_config_hash: String,
    /// Serialized aggregation buffer state, if the checkpointed node is an
    /// aggregation.
    pub aggregation_state_json: Option<Value>,
}

// ============================================================================
// SECTION: Batches
// ============================================================================

/// A group of tokens buffered together by an aggregation node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Identifier for this batch.
    pub batch_id: BatchId,
    /// The run this batch belongs to.
    pub run_id: RunId,
    /// The aggregation node that owns this batch.
    pub node_id: NodeId,
    /// When the batch was opened.
    pub created_at: OffsetDateTime,
}

/// One input token buffered into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    /// The batch this member belongs to.
    pub batch_id: BatchId,
    /// The buffered token.
    pub token_id: TokenId,
    /// Position within the batch; unique together with `batch_id`.
    pub ordinal: u32,
}

/// One output token produced when a batch's trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutput {
    /// The batch that produced this output.
    pub batch_id: BatchId,
    /// The emitted token.
    pub output_token_id: TokenId,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// A row failed a transform's declared input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrorRecord {
    /// Identifier for this error record.
    pub error_id: ValidationErrorId,
    /// The run this error belongs to.
    pub run_id: RunId,
    /// The node that raised the error.
    pub node_id: NodeId,
    /// The token that triggered the error.
    pub token_id: TokenId,
    /// The offending field, if identifiable.
    pub field: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Structured detail, as canonical JSON.
    pub details_json: Option<Value>,
    /// When the error was recorded.
    pub created_at: OffsetDateTime,
}

/// A transform raised an exception while processing a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformErrorRecord {
    /// Identifier for this error record.
    pub error_id: TransformErrorId,
    /// The run this error belongs to.
    pub run_id: RunId,
    /// The node that raised the error.
    pub node_id: NodeId,
    /// The token that triggered the error.
    pub token_id: TokenId,
    /// Human-readable message.
    pub message: String,
    /// Structured detail, as canonical JSON.
    pub details_json: Option<Value>,
    /// When the error was recorded.
    pub created_at: OffsetDateTime,
}
