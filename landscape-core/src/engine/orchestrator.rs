// landscape-core/src/engine/orchestrator.rs
// ============================================================================
// Module: Orchestrator & Row Processor
// Description: Drives one run of the pipeline: source ingestion, node
//              traversal, gate routing, aggregation/coalesce buffering, and
//              sink writes, recording every step to the audit trail.
// Purpose: Enforce "no silent drops" and "exactly one terminal outcome per
//          token" while staying storage- and plugin-agnostic.
// Dependencies: crate::engine, crate::graph, crate::interfaces, crate::model,
//               serde_json, thiserror, time, tracing
// ============================================================================

//! ## Overview
//! The orchestrator is generic over [`AuditRecorder`], [`PayloadStore`], and
//! [`ExpressionEvaluator`] rather than hard-wired to a concrete backend.
//! Every token reaches exactly one terminal [`TokenOutcome`]: a sink write
//! (`Completed`), a dead end (`Discarded`, `Failed`), or absorption into a
//! batch or coalesce join (`Routed`). A token buffered inside an
//! aggregation or coalesce gets a non-terminal `Buffered` outcome while it
//! waits, so its current disposition is always queryable even mid-run.
//!
//! Aggregation and coalesce nodes do not have their own plugin trait: they
//! are framework-owned buffering behavior around a [`Transform`] plugin
//! flagged `is_batch_aware`, per [`crate::interfaces`].

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use time::OffsetDateTime;

use crate::engine::AuditRecorder;
use crate::engine::ExprEvalError;
use crate::engine::ExpressionEvaluator;
use crate::engine::IdSequence;
use crate::engine::PayloadStore;
use crate::engine::PayloadStoreError;
use crate::engine::RecorderError;
use crate::graph::ExecutionGraph;
use crate::graph::GraphError;
use crate::graph::NodeDefinition;
use crate::graph::config::CoalescePolicy;
use crate::graph::config::GateCondition;
use crate::graph::config::NodeConfig;
use crate::graph::config::OutputMode;
use crate::graph::config::config_to_dict;
use crate::interfaces::ArtifactDescriptor;
use crate::interfaces::Gate;
use crate::interfaces::PluginContext;
use crate::interfaces::PluginError;
use crate::interfaces::Sink;
use crate::interfaces::Source;
use crate::interfaces::SourceRow;
use crate::interfaces::Transform;
use crate::model::entities::Artifact;
use crate::model::entities::Batch;
use crate::model::entities::BatchMember;
use crate::model::entities::BatchOutput;
use crate::model::entities::Edge;
use crate::model::entities::Node;
use crate::model::entities::NodeKind;
use crate::model::entities::NodeState;
use crate::model::entities::NodeStateStatus;
use crate::model::entities::Row;
use crate::model::entities::RoutingEvent;
use crate::model::entities::Run;
use crate::model::entities::RunStatus;
use crate::model::entities::Token;
use crate::model::entities::TokenOutcome;
use crate::model::entities::TokenOutcomeKind;
use crate::model::entities::TokenParent;
use crate::model::entities::TransformErrorRecord;
use crate::model::entities::ValidationErrorRecord;
use crate::model::hashing::CANONICAL_VERSION;
use crate::model::hashing::CanonicalizationError;
use crate::model::hashing::canonical_json_bytes;
use crate::model::hashing::stable_hash;
use crate::model::ids::ArtifactId;
use crate::model::ids::BatchId;
use crate::model::ids::BranchName;
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

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Derives the identifier of the token a row starts life as. Pure and
/// deterministic so resume logic can recompute it without an index lookup.
#[must_use]
pub fn initial_token_id(row_id: &RowId) -> TokenId {
    TokenId::new(format!("{row_id}-initial"))
}

/// A registered plugin implementation for one node. Aggregation and
/// coalesce nodes register a batch-aware [`Transform`]; there is no
/// separate plugin kind for them.
pub enum NodePlugin {
    /// A source plugin.
    Source(Box<dyn Source>),
    /// A transform plugin (also used for aggregation and coalesce bodies).
    Transform(Box<dyn Transform>),
    /// A gate plugin (only for plugin-driven gates).
    Gate(Box<dyn Gate>),
    /// A sink plugin.
    Sink(Box<dyn Sink>),
}

/// Errors raised while running a pipeline.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The audit backend failed.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// The payload store failed.
    #[error(transparent)]
    Payload(#[from] PayloadStoreError),
    /// The graph rejected an operation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Canonicalization failed.
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
    /// A plugin call failed.
    #[error("plugin at node {0} failed: {1}")]
    Plugin(NodeId, String),
    /// No plugin was registered for a node that needed one.
    #[error("no plugin registered for node {0}")]
    MissingPlugin(NodeId),
    /// A registered plugin does not match its node's declared kind.
    #[error("registered plugin does not match the kind of node {0}")]
    WrongPluginKind(NodeId),
    /// A node with no outgoing edge was asked to forward a token.
    #[error("node {0} has no outgoing edge to continue processing on")]
    DeadEnd(NodeId),
    /// A gate selected a route label with no matching entry in its routes map.
    #[error("gate {0} selected unknown route {1}")]
    UnknownRoute(NodeId, RouteLabel),
    /// A transform's `on_error` named a sink that does not exist.
    #[error("no sink plugin named {0} is registered")]
    UnknownSink(String),
    /// A transform registered for an aggregation or coalesce is not batch-aware.
    #[error("transform at node {0} must be batch-aware to back an aggregation or coalesce")]
    NotBatchAware(NodeId),
    /// An `output_mode: single` aggregation produced other than one row.
    #[error("aggregation {0} in single output mode produced {1} rows")]
    BadOutputCount(NodeId, usize),
    /// A second terminal outcome was about to be recorded for one token.
    #[error("token {0} already has a terminal outcome")]
    DuplicateTerminalOutcome(TokenId),
}

/// Drives one run of the pipeline graph.
pub struct Orchestrator<'a, R, P, E>
where
    R: AuditRecorder,
    P: PayloadStore,
    E: ExpressionEvaluator,
{
    graph: &'a ExecutionGraph,
    recorder: &'a mut R,
    payload_store: &'a P,
    evaluator: &'a E,
    run_id: RunId,
    ids: IdSequence,
    plugins: HashMap<NodeId, NodePlugin>,
    open_batch_ids: HashMap<NodeId, BatchId>,
    batch_opened_at: HashMap<BatchId, Instant>,
    pending_batch_rows: HashMap<BatchId, Vec<(TokenId, RowId, Value)>>,
    coalesce_waiting: HashMap<(NodeId, RowId), Vec<(TokenId, Value)>>,
    state_started_at: HashMap<StateId, Instant>,
}

impl<'a, R, P, E> Orchestrator<'a, R, P, E>
where
    R: AuditRecorder,
    P: PayloadStore,
    E: ExpressionEvaluator,
{
    /// Creates a new orchestrator for `run_id` over `graph`.
    pub fn new(
        graph: &'a ExecutionGraph,
        recorder: &'a mut R,
        payload_store: &'a P,
        evaluator: &'a E,
        run_id: RunId,
    ) -> Self {
        Self {
            graph,
            recorder,
            payload_store,
            evaluator,
            ids: IdSequence::new(run_id.clone()),
            run_id,
            plugins: HashMap::new(),
            open_batch_ids: HashMap::new(),
            batch_opened_at: HashMap::new(),
            pending_batch_rows: HashMap::new(),
            coalesce_waiting: HashMap::new(),
            state_started_at: HashMap::new(),
        }
    }

    /// Registers a plugin implementation for a node.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::WrongPluginKind`] if `plugin`'s kind
    /// does not match the node's declared [`NodeKind`], or
    /// [`OrchestratorError::Graph`] if `node_id` is not in this graph.
    pub fn register_plugin(
        &mut self,
        node_id: NodeId,
        plugin: NodePlugin,
    ) -> Result<(), OrchestratorError> {
        let node = self
            .graph
            .node(&node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.clone()))?;
        let matches = match (node.node_type, &plugin) {
            (NodeKind::Source, NodePlugin::Source(_))
            | (NodeKind::Sink, NodePlugin::Sink(_))
            | (NodeKind::Transform, NodePlugin::Transform(_))
            | (NodeKind::Gate, NodePlugin::Gate(_)) => true,
            (NodeKind::Aggregation | NodeKind::Coalesce, NodePlugin::Transform(transform)) => {
                transform.is_batch_aware()
            }
            _ => false,
        };
        if !matches {
            return Err(OrchestratorError::WrongPluginKind(node_id));
        }
        self.plugins.insert(node_id, plugin);
        Ok(())
    }

    /// Runs the pipeline end to end: registers the graph, loads every
    /// source, traverses every row to a terminal outcome, flushes any
    /// batches left open at end of run, and marks the run `Completed` or
    /// `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError`] if the graph fails its preflight
    /// validation or the audit backend cannot be written to at all. Row-
    /// and plugin-level failures are recorded as `Failed` token outcomes
    /// and transform error records rather than propagated.
    pub fn run(&mut self, settings_json: Value) -> Result<(), OrchestratorError> {
        self.graph.validate_error_sink_references()?;
        let config_hash = self.run_config_hash()?;
        let run = Run {
            run_id: self.run_id.clone(),
            started_at: now(),
            completed_at: None,
            config_hash,
            settings_json,
            canonical_version: CANONICAL_VERSION.to_string(),
            status: RunStatus::Running,
            export_status: None,
            reproducibility_grade: None,
        };
        self.recorder.insert_run(&run)?;
        self.register_graph()?;

        let source_ids: Vec<NodeId> = self
            .graph
            .nodes_in_topological_order()
            .iter()
            .filter(|id| {
                self.graph
                    .node(id)
                    .is_some_and(|n| n.node_type == NodeKind::Source)
            })
            .cloned()
            .collect();

        let mut failed = false;
        for source_id in &source_ids {
            if let Err(err) = self.run_source(source_id) {
                tracing::error!(node_id = %source_id, error = %err, "source failed");
                failed = true;
            }
        }

        self.flush_remaining_batches()?;

        let status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.recorder
            .update_run_status(&self.run_id, status, Some(now()))?;
        Ok(())
    }

    fn run_config_hash(&self) -> Result<String, OrchestratorError> {
        let mut configs = Vec::new();
        for node_id in self.graph.nodes_in_topological_order() {
            if let Some(node) = self.graph.node(node_id) {
                configs.push((node_id.as_str().to_string(), config_to_dict(&node.config)?));
            }
        }
        Ok(stable_hash(&configs)?)
    }

    fn register_graph(&mut self) -> Result<(), OrchestratorError> {
        let node_ids: Vec<NodeId> = self.graph.nodes_in_topological_order().to_vec();
        for node_id in &node_ids {
            let Some(node) = self.graph.node(node_id) else {
                continue;
            };
            let node = node.clone();
            let schema = crate::graph::node_schema(&node.config).cloned();
            let schema_hash = match &schema {
                Some(s) => Some(stable_hash(s)?),
                None => None,
            };
            self.recorder.insert_node(&Node {
                node_id: node.node_id.clone(),
                run_id: self.run_id.clone(),
                plugin_name: node.plugin_name.clone(),
                node_type: node.node_type,
                plugin_version: node.plugin_version.clone(),
                determinism: node.determinism,
                config_hash: node.config_hash.clone(),
                config_json: config_to_dict(&node.config)?,
                sequence_in_pipeline: Some(node.sequence_in_pipeline),
                schema_hash,
                schema_mode: schema.as_ref().map(|_| "declared".to_string()),
                schema_fields: schema,
                registered_at: now(),
            })?;
            for edge in self.graph.outgoing_edges(node_id) {
                self.recorder.insert_edge(&Edge {
                    edge_id: EdgeId::new(edge.edge_id.clone()),
                    run_id: self.run_id.clone(),
                    from_node_id: edge.from_node_id.clone(),
                    to_node_id: edge.to_node_id.clone(),
                    label: edge.label.clone(),
                    default_mode: edge.default_mode,
                    created_at: now(),
                })?;
            }
        }
        Ok(())
    }

    fn run_source(&mut self, source_id: &NodeId) -> Result<(), OrchestratorError> {
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: source_id.clone(),
        };
        let rows = {
            let plugin = self
                .plugins
                .get_mut(source_id)
                .ok_or_else(|| OrchestratorError::MissingPlugin(source_id.clone()))?;
            let NodePlugin::Source(source) = plugin else {
                return Err(OrchestratorError::WrongPluginKind(source_id.clone()));
            };
            source
                .load(&ctx)
                .map_err(|e| OrchestratorError::Plugin(source_id.clone(), e.to_string()))?
        };
        for (index, source_row) in rows.into_iter().enumerate() {
            let row_index = u64::try_from(index).unwrap_or(u64::MAX);
            self.ingest_row(source_id, row_index, source_row)?;
        }
        Ok(())
    }

    fn ingest_row(
        &mut self,
        source_id: &NodeId,
        row_index: u64,
        source_row: SourceRow,
    ) -> Result<(), OrchestratorError> {
        let (payload, invalid_reason) = match source_row {
            SourceRow::Valid(value) => (value, None),
            SourceRow::Invalid {
                payload,
                validation_error,
            } => (payload, Some(validation_error)),
        };
        let source_data_hash = stable_hash(&payload)?;
        let bytes = canonical_json_bytes(&payload)?;
        let source_data_ref = Some(self.payload_store.put(&bytes)?);

        let row_id = RowId::new(self.ids.next("row"));
        let row = Row {
            row_id: row_id.clone(),
            run_id: self.run_id.clone(),
            source_node_id: source_id.clone(),
            row_index,
            source_data_hash,
            source_data_ref,
            created_at: now(),
        };
        self.recorder.insert_row(&row)?;

        let token_id = initial_token_id(&row_id);
        self.recorder.insert_token(&Token {
            token_id: token_id.clone(),
            row_id: row_id.clone(),
            branch_name: None,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            created_at: now(),
        })?;

        if let Some(validation_error) = invalid_reason {
            self.recorder.insert_validation_error(&ValidationErrorRecord {
                error_id: ValidationErrorId::new(self.ids.next("validation_error")),
                run_id: self.run_id.clone(),
                node_id: source_id.clone(),
                token_id: token_id.clone(),
                field: None,
                message: validation_error,
                details_json: None,
                created_at: now(),
            })?;
            let error_hash = stable_hash(&json!({"stage": "source_validation"}))?;
            self.record_terminal_outcome(
                &token_id,
                TokenOutcomeKind::Failed,
                None,
                None,
                Some(error_hash),
            )?;
            return Ok(());
        }

        let edges = self.graph.outgoing_edges(source_id);
        let Some(edge) = edges.first() else {
            return Err(OrchestratorError::DeadEnd(source_id.clone()));
        };
        let next_node_id = edge.to_node_id.clone();
        self.process_node(&next_node_id, &token_id, &row_id, payload)
    }

    fn process_node(
        &mut self,
        node_id: &NodeId,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
    ) -> Result<(), OrchestratorError> {
        let node = self
            .graph
            .node(node_id)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode(node_id.clone()))?;
        let state_id = self.open_node_state(&node, token_id, &value)?;
        match node.node_type {
            NodeKind::Transform => self.run_transform(&node, token_id, row_id, value, &state_id),
            NodeKind::Gate => self.run_gate(&node, token_id, row_id, value, &state_id),
            NodeKind::Sink => self.run_sink(&node, token_id, value, &state_id),
            NodeKind::Aggregation => self.run_aggregation(&node, token_id, row_id, value, &state_id),
            NodeKind::Coalesce => self.run_coalesce(&node, token_id, row_id, value, &state_id),
            NodeKind::Source => Err(OrchestratorError::DeadEnd(node_id.clone())),
        }
    }

    fn continue_token(
        &mut self,
        current_node_id: &NodeId,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
    ) -> Result<(), OrchestratorError> {
        let edges = self.graph.outgoing_edges(current_node_id);
        let Some(edge) = edges.first() else {
            return Err(OrchestratorError::DeadEnd(current_node_id.clone()));
        };
        let next_node_id = edge.to_node_id.clone();
        self.process_node(&next_node_id, token_id, row_id, value)
    }

    fn open_node_state(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        value: &Value,
    ) -> Result<StateId, OrchestratorError> {
        let state_id = StateId::new(self.ids.next("state"));
        let input_hash = stable_hash(value)?;
        self.recorder.insert_node_state(&NodeState {
            state_id: state_id.clone(),
            run_id: self.run_id.clone(),
            token_id: token_id.clone(),
            node_id: node.node_id.clone(),
            step_index: node.sequence_in_pipeline,
            attempt: 0,
            started_at: now(),
            input_hash,
            context_before_json: None,
            status: NodeStateStatus::Open,
        })?;
        self.state_started_at.insert(state_id.clone(), Instant::now());
        Ok(state_id)
    }

    fn state_duration_ms(&mut self, state_id: &StateId) -> u64 {
        self.state_started_at
            .remove(state_id)
            .map(|started| u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    fn complete_node_state(
        &mut self,
        state_id: &StateId,
        output_hash: String,
    ) -> Result<(), OrchestratorError> {
        let duration_ms = self.state_duration_ms(state_id);
        self.recorder.update_node_state_status(
            state_id,
            NodeStateStatus::Completed {
                completed_at: now(),
                duration_ms,
                output_hash,
                context_after_json: None,
            },
        )?;
        Ok(())
    }

    fn fail_node_state(
        &mut self,
        state_id: &StateId,
        error_hash: String,
    ) -> Result<(), OrchestratorError> {
        let duration_ms = self.state_duration_ms(state_id);
        self.recorder.update_node_state_status(
            state_id,
            NodeStateStatus::Failed {
                completed_at: now(),
                duration_ms,
                error_hash,
                context_after_json: None,
            },
        )?;
        Ok(())
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "a token outcome carries five independent optional facets"
    )]
    fn record_token_outcome(
        &mut self,
        token_id: &TokenId,
        kind: TokenOutcomeKind,
        sink_name: Option<PluginName>,
        fork_group_id: Option<String>,
        error_hash: Option<String>,
        is_terminal: bool,
        batch_id: Option<BatchId>,
    ) -> Result<(), OrchestratorError> {
        if is_terminal && self.recorder.has_terminal_outcome(token_id)? {
            return Err(OrchestratorError::DuplicateTerminalOutcome(token_id.clone()));
        }
        let outcome = TokenOutcome {
            outcome_id: OutcomeId::new(self.ids.next("outcome")),
            run_id: self.run_id.clone(),
            token_id: token_id.clone(),
            outcome: kind,
            is_terminal,
            sink_name,
            batch_id,
            fork_group_id,
            error_hash,
            context_json: None,
            recorded_at: now(),
        };
        self.recorder.insert_token_outcome(&outcome)?;
        Ok(())
    }

    fn record_terminal_outcome(
        &mut self,
        token_id: &TokenId,
        kind: TokenOutcomeKind,
        sink_name: Option<PluginName>,
        fork_group_id: Option<String>,
        error_hash: Option<String>,
    ) -> Result<(), OrchestratorError> {
        self.record_token_outcome(token_id, kind, sink_name, fork_group_id, error_hash, true, None)
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "spawning a child token always needs its full lineage context"
    )]
    fn spawn_child_token(
        &mut self,
        parent_id: &TokenId,
        child_id: &TokenId,
        row_id: &RowId,
        branch_name: Option<BranchName>,
        fork_group_id: Option<String>,
        expand_group_id: Option<String>,
        ordinal: u32,
    ) -> Result<(), OrchestratorError> {
        self.recorder.insert_token(&Token {
            token_id: child_id.clone(),
            row_id: row_id.clone(),
            branch_name,
            fork_group_id,
            join_group_id: None,
            expand_group_id,
            created_at: now(),
        })?;
        self.recorder.insert_token_parent(&TokenParent {
            token_id: child_id.clone(),
            parent_token_id: parent_id.clone(),
            ordinal,
        })?;
        Ok(())
    }

    fn run_transform(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
        state_id: &StateId,
    ) -> Result<(), OrchestratorError> {
        let NodeConfig::Transform(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let on_error = cfg.on_error.clone();
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
        };
        let result = {
            let plugin = self
                .plugins
                .get_mut(&node.node_id)
                .ok_or_else(|| OrchestratorError::MissingPlugin(node.node_id.clone()))?;
            let NodePlugin::Transform(transform) = plugin else {
                return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
            };
            transform.process(std::slice::from_ref(&value), &ctx)
        };

        match result {
            Ok(rows) => {
                let output_hash = stable_hash(&rows)?;
                self.complete_node_state(state_id, output_hash)?;
                match rows.len() {
                    0 => {
                        self.record_terminal_outcome(token_id, TokenOutcomeKind::Discarded, None, None, None)
                    }
                    1 => {
                        let out_value = rows.into_iter().next().unwrap_or(Value::Null);
                        self.continue_token(&node.node_id, token_id, row_id, out_value)
                    }
                    _ => {
                        let expand_group_id = self.ids.next("expand");
                        self.record_terminal_outcome(token_id, TokenOutcomeKind::Routed, None, None, None)?;
                        for (ordinal, out_value) in rows.into_iter().enumerate() {
                            let child_id = TokenId::new(self.ids.next("token"));
                            let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
                            self.spawn_child_token(
                                token_id,
                                &child_id,
                                row_id,
                                None,
                                None,
                                Some(expand_group_id.clone()),
                                ordinal,
                            )?;
                            self.continue_token(&node.node_id, &child_id, row_id, out_value)?;
                        }
                        Ok(())
                    }
                }
            }
            Err(plugin_err) => self.handle_transform_failure(
                node,
                token_id,
                row_id,
                value,
                state_id,
                &on_error,
                plugin_err,
            ),
        }
    }

    fn handle_transform_failure(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
        state_id: &StateId,
        on_error: &Option<String>,
        plugin_err: PluginError,
    ) -> Result<(), OrchestratorError> {
        let error_hash = stable_hash(&json!({"error": plugin_err.to_string()}))?;
        self.fail_node_state(state_id, error_hash.clone())?;
        self.recorder.insert_transform_error(&TransformErrorRecord {
            error_id: TransformErrorId::new(self.ids.next("transform_error")),
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
            token_id: token_id.clone(),
            message: plugin_err.to_string(),
            details_json: None,
            created_at: now(),
        })?;
        match on_error {
            Some(sink_name) if sink_name.as_str() != "discard" => {
                let sink_node_id = self.sink_node_id_by_plugin_name(sink_name)?;
                self.run_sink_direct(&sink_node_id, token_id, value)
            }
            _ => self.record_terminal_outcome(token_id, TokenOutcomeKind::Failed, None, None, Some(error_hash)),
        }
    }

    fn sink_node_id_by_plugin_name(&self, plugin_name: &str) -> Result<NodeId, OrchestratorError> {
        self.graph
            .nodes_in_topological_order()
            .iter()
            .find_map(|id| {
                self.graph
                    .node(id)
                    .filter(|n| n.node_type == NodeKind::Sink && n.plugin_name.as_str() == plugin_name)
                    .map(|n| n.node_id.clone())
            })
            .ok_or_else(|| OrchestratorError::UnknownSink(plugin_name.to_string()))
    }

    fn run_sink_direct(
        &mut self,
        sink_node_id: &NodeId,
        token_id: &TokenId,
        value: Value,
    ) -> Result<(), OrchestratorError> {
        let node = self
            .graph
            .node(sink_node_id)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode(sink_node_id.clone()))?;
        let state_id = self.open_node_state(&node, token_id, &value)?;
        self.run_sink(&node, token_id, value, &state_id)
    }

    /// Quarantines the single row behind `token_id` after its gate condition
    /// failed to evaluate (missing key, division by zero, etc). A condition
    /// that cannot be evaluated is never treated as false: it must not route
    /// silently, but it also must not abort the whole run over one bad row.
    fn quarantine_gate_evaluation_failure(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        state_id: &StateId,
        eval_err: ExprEvalError,
    ) -> Result<(), OrchestratorError> {
        let error_hash = stable_hash(&json!({"error": eval_err.to_string()}))?;
        self.fail_node_state(state_id, error_hash.clone())?;
        self.recorder.insert_transform_error(&TransformErrorRecord {
            error_id: TransformErrorId::new(self.ids.next("transform_error")),
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
            token_id: token_id.clone(),
            message: eval_err.to_string(),
            details_json: None,
            created_at: now(),
        })?;
        self.record_terminal_outcome(token_id, TokenOutcomeKind::Failed, None, None, Some(error_hash))
    }

    fn run_gate(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
        state_id: &StateId,
    ) -> Result<(), OrchestratorError> {
        let NodeConfig::Gate(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let route_label = match &cfg.condition {
            Some(GateCondition::Expression { expression }) => {
                match self.evaluator.evaluate(expression, &value) {
                    Ok(matched) => RouteLabel::new(if matched { "true" } else { "false" }),
                    Err(eval_err) => {
                        return self.quarantine_gate_evaluation_failure(node, token_id, state_id, eval_err);
                    }
                }
            }
            Some(GateCondition::Plugin { .. }) | None => {
                let ctx = PluginContext {
                    run_id: self.run_id.clone(),
                    node_id: node.node_id.clone(),
                };
                let plugin = self
                    .plugins
                    .get_mut(&node.node_id)
                    .ok_or_else(|| OrchestratorError::MissingPlugin(node.node_id.clone()))?;
                let NodePlugin::Gate(gate) = plugin else {
                    return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
                };
                gate.route(&value, &ctx)
                    .map_err(|e| OrchestratorError::Plugin(node.node_id.clone(), e.to_string()))?
            }
        };
        let fork_labels = cfg
            .fork_to
            .as_ref()
            .filter(|labels| labels.contains(&route_label))
            .cloned();

        let output_hash = stable_hash(&value)?;
        self.complete_node_state(state_id, output_hash)?;
        self.recorder.insert_routing_event(&RoutingEvent {
            event_id: RoutingEventId::new(self.ids.next("routing_event")),
            state_id: state_id.clone(),
            routing_group_id: self.ids.next("routing_group"),
            decision: format!("route={route_label}"),
            route_label: route_label.clone(),
            is_fork: fork_labels.is_some(),
            created_at: now(),
        })?;

        match fork_labels {
            Some(labels) => self.fork_gate_token(node, token_id, row_id, &value, &labels),
            None => {
                let Some(to_node_id) = cfg.routes.get(&route_label).cloned() else {
                    return Err(OrchestratorError::UnknownRoute(node.node_id.clone(), route_label));
                };
                self.process_node(&to_node_id, token_id, row_id, value)
            }
        }
    }

    /// Fans `token_id` out into one child per label in `labels`, each
    /// continuing down that label's route. The parent keeps a non-terminal
    /// outcome: it has been absorbed into its children, not terminated.
    fn fork_gate_token(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: &Value,
        labels: &[RouteLabel],
    ) -> Result<(), OrchestratorError> {
        let NodeConfig::Gate(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let fork_group_id = self.ids.next("fork");
        self.record_token_outcome(
            token_id,
            TokenOutcomeKind::Routed,
            None,
            Some(fork_group_id.clone()),
            None,
            false,
            None,
        )?;
        for (ordinal, label) in labels.iter().enumerate() {
            let Some(to_node_id) = cfg.routes.get(label).cloned() else {
                return Err(OrchestratorError::UnknownRoute(node.node_id.clone(), label.clone()));
            };
            let child_id = TokenId::new(self.ids.next("token"));
            let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
            self.spawn_child_token(
                token_id,
                &child_id,
                row_id,
                Some(BranchName::new(label.as_str())),
                Some(fork_group_id.clone()),
                None,
                ordinal,
            )?;
            self.process_node(&to_node_id, &child_id, row_id, value.clone())?;
        }
        Ok(())
    }

    fn run_sink(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        value: Value,
        state_id: &StateId,
    ) -> Result<(), OrchestratorError> {
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
        };
        let result = {
            let plugin = self
                .plugins
                .get_mut(&node.node_id)
                .ok_or_else(|| OrchestratorError::MissingPlugin(node.node_id.clone()))?;
            let NodePlugin::Sink(sink) = plugin else {
                return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
            };
            sink.write(&value, &ctx)
        };
        match result {
            Ok(descriptor) => {
                let output_hash = stable_hash(&value)?;
                self.complete_node_state(state_id, output_hash)?;
                self.insert_artifact_and_complete(node, token_id, descriptor)
            }
            Err(plugin_err) => {
                let error_hash = stable_hash(&json!({"error": plugin_err.to_string()}))?;
                self.fail_node_state(state_id, error_hash.clone())?;
                self.record_terminal_outcome(token_id, TokenOutcomeKind::Failed, None, None, Some(error_hash))
            }
        }
    }

    fn insert_artifact_and_complete(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        descriptor: ArtifactDescriptor,
    ) -> Result<(), OrchestratorError> {
        self.recorder.insert_artifact(&Artifact {
            artifact_id: ArtifactId::new(self.ids.next("artifact")),
            run_id: self.run_id.clone(),
            sink_node_id: node.node_id.clone(),
            artifact_type: descriptor.artifact_type,
            content_hash: descriptor.content_hash,
            path_or_uri: descriptor.path_or_uri,
            size_bytes: descriptor.size_bytes,
            metadata_json: descriptor.metadata_json,
            created_at: now(),
        })?;
        self.record_terminal_outcome(
            token_id,
            TokenOutcomeKind::Completed,
            Some(node.plugin_name.clone()),
            None,
            None,
        )
    }

    fn ensure_open_batch(&mut self, node_id: &NodeId) -> Result<BatchId, OrchestratorError> {
        if let Some(id) = self.open_batch_ids.get(node_id) {
            return Ok(id.clone());
        }
        let batch_id = BatchId::new(self.ids.next("batch"));
        self.recorder.insert_batch(&Batch {
            batch_id: batch_id.clone(),
            run_id: self.run_id.clone(),
            node_id: node_id.clone(),
            created_at: now(),
        })?;
        self.open_batch_ids.insert(node_id.clone(), batch_id.clone());
        self.batch_opened_at.insert(batch_id.clone(), Instant::now());
        Ok(batch_id)
    }

    fn run_aggregation(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
        state_id: &StateId,
    ) -> Result<(), OrchestratorError> {
        let NodeConfig::Aggregation(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let output_hash = stable_hash(&value)?;
        self.complete_node_state(state_id, output_hash)?;

        let batch_id = self.ensure_open_batch(&node.node_id)?;
        let existing = self.pending_batch_rows.entry(batch_id.clone()).or_default();
        let ordinal = u32::try_from(existing.len()).unwrap_or(u32::MAX);
        existing.push((token_id.clone(), row_id.clone(), value));
        self.recorder.insert_batch_member(&BatchMember {
            batch_id: batch_id.clone(),
            token_id: token_id.clone(),
            ordinal,
        })?;
        self.record_token_outcome(
            token_id,
            TokenOutcomeKind::Buffered,
            None,
            None,
            None,
            false,
            Some(batch_id.clone()),
        )?;

        let member_count = self
            .pending_batch_rows
            .get(&batch_id)
            .map_or(0, Vec::len);
        let should_trigger = match &cfg.trigger {
            crate::graph::config::AggregationTrigger::RowCount { count } => {
                member_count >= *count as usize
            }
            crate::graph::config::AggregationTrigger::TimeWindow { seconds } => self
                .batch_opened_at
                .get(&batch_id)
                .is_some_and(|started| started.elapsed().as_secs() >= *seconds),
            crate::graph::config::AggregationTrigger::ExplicitMarker => false,
        };

        if should_trigger {
            self.open_batch_ids.remove(&node.node_id);
            self.fire_batch(node, &batch_id)?;
        }
        Ok(())
    }

    fn fire_batch(&mut self, node: &NodeDefinition, batch_id: &BatchId) -> Result<(), OrchestratorError> {
        let NodeConfig::Aggregation(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let members = self.pending_batch_rows.remove(batch_id).unwrap_or_default();
        if members.is_empty() {
            return Ok(());
        }
        let rows: Vec<Value> = members.iter().map(|(_, _, v)| v.clone()).collect();
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
        };
        let outputs = {
            let plugin = self
                .plugins
                .get_mut(&node.node_id)
                .ok_or_else(|| OrchestratorError::MissingPlugin(node.node_id.clone()))?;
            let NodePlugin::Transform(transform) = plugin else {
                return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
            };
            if !transform.is_batch_aware() {
                return Err(OrchestratorError::NotBatchAware(node.node_id.clone()));
            }
            transform
                .process(&rows, &ctx)
                .map_err(|e| OrchestratorError::Plugin(node.node_id.clone(), e.to_string()))?
        };
        if cfg.output_mode == OutputMode::Single && outputs.len() != 1 {
            return Err(OrchestratorError::BadOutputCount(node.node_id.clone(), outputs.len()));
        }

        for (member_token_id, _, _) in &members {
            self.record_token_outcome(
                member_token_id,
                TokenOutcomeKind::Routed,
                None,
                None,
                None,
                true,
                Some(batch_id.clone()),
            )?;
        }

        let fallback_row_id = members.first().map(|(_, row_id, _)| row_id.clone());
        for output_value in outputs {
            let Some(row_id) = fallback_row_id.clone() else {
                break;
            };
            let output_token_id = TokenId::new(self.ids.next("token"));
            self.recorder.insert_token(&Token {
                token_id: output_token_id.clone(),
                row_id: row_id.clone(),
                branch_name: None,
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: None,
                created_at: now(),
            })?;
            for (ordinal, (member_token_id, _, _)) in members.iter().enumerate() {
                let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
                self.recorder.insert_token_parent(&TokenParent {
                    token_id: output_token_id.clone(),
                    parent_token_id: member_token_id.clone(),
                    ordinal,
                })?;
            }
            self.recorder.insert_batch_output(&BatchOutput {
                batch_id: batch_id.clone(),
                output_token_id: output_token_id.clone(),
            })?;
            self.continue_token(&node.node_id, &output_token_id, &row_id, output_value)?;
        }
        Ok(())
    }

    fn flush_remaining_batches(&mut self) -> Result<(), OrchestratorError> {
        let node_ids: Vec<NodeId> = self.open_batch_ids.keys().cloned().collect();
        for node_id in node_ids {
            if let Some(batch_id) = self.open_batch_ids.remove(&node_id) {
                if let Some(node) = self.graph.node(&node_id).cloned() {
                    self.fire_batch(&node, &batch_id)?;
                }
            }
        }
        Ok(())
    }

    fn run_coalesce(
        &mut self,
        node: &NodeDefinition,
        token_id: &TokenId,
        row_id: &RowId,
        value: Value,
        state_id: &StateId,
    ) -> Result<(), OrchestratorError> {
        let NodeConfig::Coalesce(cfg) = &node.config else {
            return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
        };
        let output_hash = stable_hash(&value)?;
        self.complete_node_state(state_id, output_hash)?;

        let key = (node.node_id.clone(), row_id.clone());
        let waiting = self.coalesce_waiting.entry(key.clone()).or_default();
        waiting.push((token_id.clone(), value));
        let arrived = waiting.len();

        let required = match cfg.policy {
            CoalescePolicy::WaitAll => cfg.branches.len(),
            CoalescePolicy::Quorum => cfg
                .quorum_count
                .map_or(cfg.branches.len(), |n| n as usize),
            CoalescePolicy::FirstWins => 1,
        };

        if arrived < required {
            self.record_token_outcome(
                token_id,
                TokenOutcomeKind::Buffered,
                None,
                None,
                None,
                false,
                None,
            )?;
            return Ok(());
        }

        let waiting = self.coalesce_waiting.remove(&key).unwrap_or_default();
        let first_wins = matches!(cfg.policy, CoalescePolicy::FirstWins);

        let input_rows: Vec<Value> = if first_wins {
            waiting.first().map(|(_, v)| v.clone()).into_iter().collect()
        } else {
            waiting.iter().map(|(_, v)| v.clone()).collect()
        };
        let ctx = PluginContext {
            run_id: self.run_id.clone(),
            node_id: node.node_id.clone(),
        };
        let outputs = {
            let plugin = self
                .plugins
                .get_mut(&node.node_id)
                .ok_or_else(|| OrchestratorError::MissingPlugin(node.node_id.clone()))?;
            let NodePlugin::Transform(transform) = plugin else {
                return Err(OrchestratorError::WrongPluginKind(node.node_id.clone()));
            };
            if !transform.is_batch_aware() {
                return Err(OrchestratorError::NotBatchAware(node.node_id.clone()));
            }
            transform
                .process(&input_rows, &ctx)
                .map_err(|e| OrchestratorError::Plugin(node.node_id.clone(), e.to_string()))?
        };

        for (idx, (member_token_id, _)) in waiting.iter().enumerate() {
            let kind = if first_wins && idx > 0 {
                TokenOutcomeKind::Discarded
            } else {
                TokenOutcomeKind::Routed
            };
            self.record_terminal_outcome(member_token_id, kind, None, None, None)?;
        }

        for output_value in outputs {
            let output_token_id = TokenId::new(self.ids.next("token"));
            self.recorder.insert_token(&Token {
                token_id: output_token_id.clone(),
                row_id: row_id.clone(),
                branch_name: None,
                fork_group_id: None,
                join_group_id: None,
                expand_group_id: None,
                created_at: now(),
            })?;
            for (ordinal, (member_token_id, _)) in waiting.iter().enumerate() {
                let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
                self.recorder.insert_token_parent(&TokenParent {
                    token_id: output_token_id.clone(),
                    parent_token_id: member_token_id.clone(),
                    ordinal,
                })?;
            }
            self.continue_token(&node.node_id, &output_token_id, row_id, output_value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use std::cell::RefCell;
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::graph::EdgeSpec;
    use crate::graph::GraphSpec;
    use crate::graph::NodeSpec;
    use crate::graph::config::SinkNodeConfig;
    use crate::graph::config::SourceNodeConfig;
    use crate::graph::config::TransformNodeConfig;
    use crate::model::entities::Determinism;
    use crate::model::entities::EdgeMode;

    #[derive(Default)]
    pub(crate) struct InMemoryRecorder {
        runs: HashMap<RunId, Run>,
        outcomes_by_token: HashMap<TokenId, Vec<TokenOutcome>>,
        checkpoints: HashMap<RunId, Vec<Checkpoint>>,
        rows: HashMap<RunId, Vec<Row>>,
        open_batches: HashMap<NodeId, Vec<Batch>>,
        batch_members: HashMap<BatchId, Vec<BatchMember>>,
        pub(crate) artifacts: Vec<Artifact>,
        pub(crate) transform_errors: Vec<TransformErrorRecord>,
        pub(crate) validation_errors: Vec<ValidationErrorRecord>,
        pub(crate) node_states: Vec<NodeState>,
        referenced_payload_hashes: HashMap<RunId, Vec<String>>,
    }

    use crate::model::entities::Checkpoint;

    impl InMemoryRecorder {
        /// Test-only hook for seeding which payload hashes a run still
        /// references, since a real recorder derives this from row/call
        /// data this fake never populates.
        pub(crate) fn set_referenced_payload_hashes(&mut self, run_id: &RunId, hashes: Vec<String>) {
            self.referenced_payload_hashes.insert(run_id.clone(), hashes);
        }

        /// All outcomes recorded across every token, for assertions that
        /// don't care which token a given outcome belongs to.
        pub(crate) fn all_outcomes(&self) -> impl Iterator<Item = &TokenOutcome> {
            self.outcomes_by_token.values().flatten()
        }
    }

    impl AuditRecorder for InMemoryRecorder {
        fn insert_run(&mut self, run: &Run) -> Result<(), RecorderError> {
            self.runs.insert(run.run_id.clone(), run.clone());
            Ok(())
        }

        fn update_run_status(
            &mut self,
            run_id: &RunId,
            status: RunStatus,
            completed_at: Option<OffsetDateTime>,
        ) -> Result<(), RecorderError> {
            if let Some(run) = self.runs.get_mut(run_id) {
                run.status = status;
                run.completed_at = completed_at;
            }
            Ok(())
        }

        fn insert_node(&mut self, _node: &Node) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_edge(&mut self, _edge: &Edge) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_row(&mut self, row: &Row) -> Result<(), RecorderError> {
            self.rows.entry(row.run_id.clone()).or_default().push(row.clone());
            Ok(())
        }

        fn insert_token(&mut self, _token: &Token) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_token_parent(&mut self, _parent: &TokenParent) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_node_state(&mut self, state: &NodeState) -> Result<(), RecorderError> {
            self.node_states.push(state.clone());
            Ok(())
        }

        fn update_node_state_status(
            &mut self,
            state_id: &StateId,
            status: NodeStateStatus,
        ) -> Result<(), RecorderError> {
            if let Some(state) = self.node_states.iter_mut().find(|s| &s.state_id == state_id) {
                state.status = status;
            }
            Ok(())
        }

        fn insert_routing_event(&mut self, _event: &RoutingEvent) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_call(&mut self, _call: &crate::model::entities::Call) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_artifact(&mut self, artifact: &Artifact) -> Result<(), RecorderError> {
            self.artifacts.push(artifact.clone());
            Ok(())
        }

        fn insert_token_outcome(&mut self, outcome: &TokenOutcome) -> Result<(), RecorderError> {
            self.outcomes_by_token
                .entry(outcome.token_id.clone())
                .or_default()
                .push(outcome.clone());
            Ok(())
        }

        fn insert_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), RecorderError> {
            self.checkpoints
                .entry(checkpoint.run_id.clone())
                .or_default()
                .push(checkpoint.clone());
            Ok(())
        }

        fn insert_batch(&mut self, batch: &Batch) -> Result<(), RecorderError> {
            self.open_batches.entry(batch.node_id.clone()).or_default().push(batch.clone());
            Ok(())
        }

        fn insert_batch_member(&mut self, member: &BatchMember) -> Result<(), RecorderError> {
            self.batch_members.entry(member.batch_id.clone()).or_default().push(*member);
            Ok(())
        }

        fn insert_batch_output(&mut self, _output: &BatchOutput) -> Result<(), RecorderError> {
            Ok(())
        }

        fn insert_validation_error(
            &mut self,
            error: &ValidationErrorRecord,
        ) -> Result<(), RecorderError> {
            self.validation_errors.push(error.clone());
            Ok(())
        }

        fn insert_transform_error(
            &mut self,
            error: &TransformErrorRecord,
        ) -> Result<(), RecorderError> {
            self.transform_errors.push(error.clone());
            Ok(())
        }

        fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError> {
            Ok(self.checkpoints.get(run_id).and_then(|c| c.last().cloned()))
        }

        fn has_terminal_outcome(&self, token_id: &TokenId) -> Result<bool, RecorderError> {
            Ok(self
                .outcomes_by_token
                .get(token_id)
                .is_some_and(|outcomes| outcomes.iter().any(|o| o.is_terminal)))
        }

        fn rows_after(
            &self,
            run_id: &RunId,
            after_row_index: Option<u64>,
        ) -> Result<Vec<Row>, RecorderError> {
            Ok(self
                .rows
                .get(run_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| after_row_index.is_none_or(|after| r.row_index > after))
                .collect())
        }

        fn open_batches(&self, node_id: &NodeId) -> Result<Vec<Batch>, RecorderError> {
            Ok(self.open_batches.get(node_id).cloned().unwrap_or_default())
        }

        fn batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMember>, RecorderError> {
            Ok(self.batch_members.get(batch_id).cloned().unwrap_or_default())
        }

        fn referenced_payload_hashes(&self, run_id: &RunId) -> Result<Vec<String>, RecorderError> {
            Ok(self.referenced_payload_hashes.get(run_id).cloned().unwrap_or_default())
        }

        fn update_reproducibility_grade(
            &mut self,
            run_id: &RunId,
            grade: Option<String>,
        ) -> Result<(), RecorderError> {
            if let Some(run) = self.runs.get_mut(run_id) {
                run.reproducibility_grade = grade;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct InMemoryPayloadStore {
        blobs: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl PayloadStore for InMemoryPayloadStore {
        fn put(&self, bytes: &[u8]) -> Result<String, PayloadStoreError> {
            let hash = crate::model::hashing::hash_bytes(bytes);
            self.blobs.borrow_mut().insert(hash.clone(), bytes.to_vec());
            Ok(hash)
        }

        fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, PayloadStoreError> {
            Ok(self.blobs.borrow().get(hash).cloned())
        }

        fn exists(&self, hash: &str) -> Result<bool, PayloadStoreError> {
            Ok(self.blobs.borrow().contains_key(hash))
        }

        fn delete(&self, hash: &str) -> Result<(), PayloadStoreError> {
            self.blobs.borrow_mut().remove(hash);
            Ok(())
        }
    }

    struct AlwaysTrueEvaluator;

    impl ExpressionEvaluator for AlwaysTrueEvaluator {
        fn evaluate(&self, _expression: &str, _row: &Value) -> Result<bool, ExprEvalError> {
            Ok(true)
        }
    }

    struct FailingEvaluator;

    impl ExpressionEvaluator for FailingEvaluator {
        fn evaluate(&self, expression: &str, _row: &Value) -> Result<bool, ExprEvalError> {
            Err(ExprEvalError(format!("missing key referenced by `{expression}`")))
        }
    }

    struct PassThroughTransform;

    impl Transform for PassThroughTransform {
        fn input_schema(&self) -> Value {
            json!({})
        }

        fn output_schema(&self) -> Value {
            json!({})
        }

        fn determinism(&self) -> Determinism {
            Determinism::Guaranteed
        }

        fn process(
            &mut self,
            rows: &[Value],
            _ctx: &PluginContext,
        ) -> Result<Vec<Value>, PluginError> {
            Ok(rows.to_vec())
        }
    }

    struct StaticSource {
        rows: Vec<SourceRow>,
    }

    impl Source for StaticSource {
        fn output_schema(&self) -> Value {
            json!({})
        }

        fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError> {
            Ok(std::mem::take(&mut self.rows))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        pub written: Vec<Value>,
    }

    impl Sink for RecordingSink {
        fn input_schema(&self) -> Value {
            json!({})
        }

        fn write(&mut self, row: &Value, _ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError> {
            self.written.push(row.clone());
            Ok(ArtifactDescriptor {
                artifact_type: "application/json".to_string(),
                content_hash: stable_hash(row).unwrap_or_default(),
                path_or_uri: "memory://sink".to_string(),
                size_bytes: None,
                metadata_json: None,
            })
        }
    }

    fn simple_graph() -> GraphSpec {
        GraphSpec {
            nodes: vec![
                NodeSpec {
                    node_id: NodeId::new("source"),
                    plugin_name: PluginName::new("source"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Source,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Source(SourceNodeConfig { plugin_config: json!({}) }),
                },
                NodeSpec {
                    node_id: NodeId::new("transform"),
                    plugin_name: PluginName::new("transform"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Transform,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Transform(TransformNodeConfig {
                        plugin_config: json!({}),
                        schema: json!({}),
                        required_input_fields: None,
                        on_error: None,
                    }),
                },
                NodeSpec {
                    node_id: NodeId::new("sink"),
                    plugin_name: PluginName::new("sink"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Sink,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Sink(SinkNodeConfig { plugin_config: json!({}) }),
                },
            ],
            edges: vec![
                EdgeSpec {
                    from_node_id: NodeId::new("source"),
                    to_node_id: NodeId::new("transform"),
                    label: RouteLabel::new("default"),
                    default_mode: EdgeMode::Move,
                },
                EdgeSpec {
                    from_node_id: NodeId::new("transform"),
                    to_node_id: NodeId::new("sink"),
                    label: RouteLabel::new("default"),
                    default_mode: EdgeMode::Move,
                },
            ],
        }
    }

    fn gate_graph() -> GraphSpec {
        use crate::graph::config::GateNodeConfig;
        use std::collections::BTreeMap;

        let mut routes = BTreeMap::new();
        routes.insert(RouteLabel::new("true"), NodeId::new("sink"));
        routes.insert(RouteLabel::new("false"), NodeId::new("sink"));

        GraphSpec {
            nodes: vec![
                NodeSpec {
                    node_id: NodeId::new("source"),
                    plugin_name: PluginName::new("source"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Source,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Source(SourceNodeConfig { plugin_config: json!({}) }),
                },
                NodeSpec {
                    node_id: NodeId::new("gate"),
                    plugin_name: PluginName::new("gate"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Gate,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Gate(GateNodeConfig {
                        routes,
                        schema: json!({}),
                        condition: Some(GateCondition::Expression {
                            expression: "row['score'] > 0".to_string(),
                        }),
                        fork_to: None,
                    }),
                },
                NodeSpec {
                    node_id: NodeId::new("sink"),
                    plugin_name: PluginName::new("sink"),
                    plugin_version: "1.0.0".to_string(),
                    node_type: NodeKind::Sink,
                    determinism: Determinism::Guaranteed,
                    config: NodeConfig::Sink(SinkNodeConfig { plugin_config: json!({}) }),
                },
            ],
            edges: vec![
                EdgeSpec {
                    from_node_id: NodeId::new("source"),
                    to_node_id: NodeId::new("gate"),
                    label: RouteLabel::new("default"),
                    default_mode: EdgeMode::Move,
                },
                EdgeSpec {
                    from_node_id: NodeId::new("gate"),
                    to_node_id: NodeId::new("sink"),
                    label: RouteLabel::new("true"),
                    default_mode: EdgeMode::Move,
                },
                EdgeSpec {
                    from_node_id: NodeId::new("gate"),
                    to_node_id: NodeId::new("sink"),
                    label: RouteLabel::new("false"),
                    default_mode: EdgeMode::Move,
                },
            ],
        }
    }

    #[test]
    fn a_gate_condition_that_fails_to_evaluate_quarantines_only_that_row() {
        let graph = ExecutionGraph::build(gate_graph()).unwrap();
        let mut recorder = InMemoryRecorder::default();
        let payload_store = InMemoryPayloadStore::default();
        let evaluator = FailingEvaluator;
        let mut orchestrator = Orchestrator::new(
            &graph,
            &mut recorder,
            &payload_store,
            &evaluator,
            RunId::new("run-1"),
        );
        orchestrator
            .register_plugin(
                NodeId::new("source"),
                NodePlugin::Source(Box::new(StaticSource {
                    rows: vec![
                        SourceRow::Valid(json!({"id": 1})),
                        SourceRow::Valid(json!({"id": 2})),
                    ],
                })),
            )
            .unwrap();
        orchestrator
            .register_plugin(
                NodeId::new("sink"),
                NodePlugin::Sink(Box::new(RecordingSink::default())),
            )
            .unwrap();

        orchestrator.run(json!({})).unwrap();

        // Both rows are quarantined (the condition fails for every row here),
        // but the run itself must not be marked failed: a bad gate key is a
        // per-row outcome, not a run-aborting error.
        assert_eq!(recorder.transform_errors.len(), 2);
        assert_eq!(recorder.artifacts.len(), 0);
        let failed_terminal_outcomes = recorder
            .all_outcomes()
            .filter(|o| o.is_terminal && o.outcome == TokenOutcomeKind::Failed)
            .count();
        assert_eq!(failed_terminal_outcomes, 2);
    }

    #[test]
    fn happy_path_row_reaches_a_completed_outcome() {
        let graph = ExecutionGraph::build(simple_graph()).unwrap();
        let mut recorder = InMemoryRecorder::default();
        let payload_store = InMemoryPayloadStore::default();
        let evaluator = AlwaysTrueEvaluator;
        let mut orchestrator = Orchestrator::new(
            &graph,
            &mut recorder,
            &payload_store,
            &evaluator,
            RunId::new("run-1"),
        );
        orchestrator
            .register_plugin(
                NodeId::new("source"),
                NodePlugin::Source(Box::new(StaticSource {
                    rows: vec![SourceRow::Valid(json!({"id": 1}))],
                })),
            )
            .unwrap();
        orchestrator
            .register_plugin(
                NodeId::new("transform"),
                NodePlugin::Transform(Box::new(PassThroughTransform)),
            )
            .unwrap();
        orchestrator
            .register_plugin(
                NodeId::new("sink"),
                NodePlugin::Sink(Box::new(RecordingSink::default())),
            )
            .unwrap();

        orchestrator.run(json!({})).unwrap();
        assert_eq!(recorder.artifacts.len(), 1);
        assert!(recorder.transform_errors.is_empty());
    }

    #[test]
    fn invalid_row_gets_a_terminal_failed_outcome_not_a_silent_drop() {
        let graph = ExecutionGraph::build(simple_graph()).unwrap();
        let mut recorder = InMemoryRecorder::default();
        let payload_store = InMemoryPayloadStore::default();
        let evaluator = AlwaysTrueEvaluator;
        let mut orchestrator = Orchestrator::new(
            &graph,
            &mut recorder,
            &payload_store,
            &evaluator,
            RunId::new("run-1"),
        );
        orchestrator
            .register_plugin(
                NodeId::new("source"),
                NodePlugin::Source(Box::new(StaticSource {
                    rows: vec![SourceRow::Invalid {
                        payload: json!({"bad": true}),
                        validation_error: "missing required field".to_string(),
                    }],
                })),
            )
            .unwrap();
        orchestrator
            .register_plugin(
                NodeId::new("transform"),
                NodePlugin::Transform(Box::new(PassThroughTransform)),
            )
            .unwrap();
        orchestrator
            .register_plugin(
                NodeId::new("sink"),
                NodePlugin::Sink(Box::new(RecordingSink::default())),
            )
            .unwrap();

        orchestrator.run(json!({})).unwrap();
        assert_eq!(recorder.validation_errors.len(), 1);
        assert_eq!(recorder.artifacts.len(), 0);
    }
}
