// landscape-store-sqlite/src/store.rs
// ============================================================================
// Module: Store
// Description: SQLite-backed implementation of the `AuditRecorder` contract,
//              plus reader and lineage-explain methods used outside the
//              orchestrator's hot path.
// Purpose: Give every recorder write and every reporting/export read a
//          single, durable, crash-consistent home.
// Dependencies: rusqlite, landscape_core, serde_json, time
// ============================================================================

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use landscape_core::AuditRecorder;
use landscape_core::RecorderError;
use landscape_core::model::entities::Artifact;
use landscape_core::model::entities::Batch;
use landscape_core::model::entities::BatchMember;
use landscape_core::model::entities::BatchOutput;
use landscape_core::model::entities::Call;
use landscape_core::model::entities::Checkpoint;
use landscape_core::model::entities::Edge;
use landscape_core::model::entities::Node;
use landscape_core::model::entities::NodeState;
use landscape_core::model::entities::NodeStateStatus;
use landscape_core::model::entities::Row as LandscapeRow;
use landscape_core::model::entities::RoutingEvent;
use landscape_core::model::entities::Run;
use landscape_core::model::entities::RunStatus;
use landscape_core::model::entities::Token;
use landscape_core::model::entities::TokenOutcome;
use landscape_core::model::entities::TokenParent;
use landscape_core::model::entities::TransformErrorRecord;
use landscape_core::model::entities::ValidationErrorRecord;
use landscape_core::model::ids::BatchId;
use landscape_core::model::ids::NodeId;
use landscape_core::model::ids::RowId;
use landscape_core::model::ids::RunId;
use landscape_core::model::ids::StateId;
use landscape_core::model::ids::TokenId;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::schema;

// ============================================================================
// SECTION: Encoding helpers
// ============================================================================

fn format_dt(dt: OffsetDateTime) -> Result<String, StoreError> {
    dt.format(&Rfc3339)
        .map_err(|error| StoreError::Invalid(error.to_string()))
}

fn parse_dt(text: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(text, &Rfc3339).map_err(|error| StoreError::Corrupt(error.to_string()))
}

fn parse_opt_dt(text: Option<String>) -> Result<Option<OffsetDateTime>, StoreError> {
    text.map(|text| parse_dt(&text)).transpose()
}

fn value_to_text(value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|error| StoreError::Invalid(error.to_string()))
}

fn opt_value_to_text(value: Option<&Value>) -> Result<Option<String>, StoreError> {
    value.map(value_to_text).transpose()
}

fn parse_json(text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text).map_err(|error| StoreError::Corrupt(error.to_string()))
}

fn parse_opt_json(text: Option<String>) -> Result<Option<Value>, StoreError> {
    text.map(|text| parse_json(&text)).transpose()
}

/// Encodes a unit-variant enum (every entity enum but [`NodeStateStatus`] is
/// one) as the `snake_case` text its own `Serialize` impl already produces.
fn enum_to_text<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value).map_err(|error| StoreError::Invalid(error.to_string()))? {
        Value::String(text) => Ok(text),
        other => Err(StoreError::Invalid(format!(
            "expected a string-encoded enum, got {other}"
        ))),
    }
}

fn text_to_enum<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(text.to_string()))
        .map_err(|error| StoreError::Corrupt(error.to_string()))
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// SQLite-backed implementation of the audit trail.
///
/// Implements [`AuditRecorder`] for the orchestrator's write path, plus a
/// set of inherent reader and [`LandscapeStore::explain`] methods the
/// orchestrator never calls but a reporting or export tool does.
#[derive(Clone)]
pub struct LandscapeStore {
    conn: Arc<Mutex<Connection>>,
    config: StoreConfig,
}

impl LandscapeStore {
    /// Opens (creating if absent) the audit trail at `config.path`.
    ///
    /// # Errors
    /// Returns [`StoreError::SchemaCompatibility`] if an existing database's
    /// schema does not match what this crate expects, or [`StoreError::Db`]
    /// if the connection cannot be opened or configured.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", config.journal_mode.pragma_value())?;
        conn.pragma_update(None, "synchronous", config.sync_mode.pragma_value())?;
        schema::initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Db("audit trail connection lock poisoned".to_string()))
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
        let run_id: String = row.get(0)?;
        let started_at: String = row.get(1)?;
        let completed_at: Option<String> = row.get(2)?;
        let config_hash: String = row.get(3)?;
        let settings_json: String = row.get(4)?;
        let canonical_version: String = row.get(5)?;
        let status: String = row.get(6)?;
        let export_status: Option<String> = row.get(7)?;
        let reproducibility_grade: Option<String> = row.get(8)?;
        Ok(Run {
            run_id: RunId::from(run_id),
            started_at: parse_dt(&started_at).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            completed_at: parse_opt_dt(completed_at).unwrap_or_default(),
            config_hash,
            settings_json: parse_json(&settings_json).unwrap_or(Value::Null),
            canonical_version,
            status: text_to_enum::<RunStatus>(&status).unwrap_or(RunStatus::Failed),
            export_status,
            reproducibility_grade,
        })
    }

    fn map_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
        Ok(Node {
            node_id: NodeId::from(row.get::<_, String>(0)?),
            run_id: RunId::from(row.get::<_, String>(1)?),
            plugin_name: row.get::<_, String>(2)?.into(),
            node_type: text_to_enum(&row.get::<_, String>(3)?).unwrap_or(
                landscape_core::model::entities::NodeKind::Transform,
            ),
            plugin_version: row.get(4)?,
            determinism: text_to_enum(&row.get::<_, String>(5)?)
                .unwrap_or(landscape_core::model::entities::Determinism::None),
            config_hash: row.get(6)?,
            config_json: parse_json(&row.get::<_, String>(7)?).unwrap_or(Value::Null),
            sequence_in_pipeline: row.get::<_, Option<i64>>(8)?.map(|value| value as u32),
            schema_hash: row.get(9)?,
            schema_mode: row.get(10)?,
            schema_fields: parse_opt_json(row.get::<_, Option<String>>(11)?).unwrap_or_default(),
            registered_at: parse_dt(&row.get::<_, String>(12)?)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LandscapeRow> {
        Ok(LandscapeRow {
            row_id: RowId::from(row.get::<_, String>(0)?),
            run_id: RunId::from(row.get::<_, String>(1)?),
            source_node_id: NodeId::from(row.get::<_, String>(2)?),
            row_index: row.get::<_, i64>(3)? as u64,
            source_data_hash: row.get(4)?,
            source_data_ref: row.get(5)?,
            created_at: parse_dt(&row.get::<_, String>(6)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
        Ok(Token {
            token_id: TokenId::from(row.get::<_, String>(0)?),
            row_id: RowId::from(row.get::<_, String>(1)?),
            branch_name: row.get::<_, Option<String>>(2)?.map(Into::into),
            fork_group_id: row.get(3)?,
            join_group_id: row.get(4)?,
            expand_group_id: row.get(5)?,
            created_at: parse_dt(&row.get::<_, String>(6)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_token_parent(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenParent> {
        Ok(TokenParent {
            token_id: TokenId::from(row.get::<_, String>(0)?),
            parent_token_id: TokenId::from(row.get::<_, String>(1)?),
            ordinal: row.get::<_, i64>(2)? as u32,
        })
    }

    fn map_node_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeState> {
        let status_tag: String = row.get(9)?;
        let completed_at: Option<String> = row.get(10)?;
        let duration_ms: Option<i64> = row.get(11)?;
        let output_hash: Option<String> = row.get(12)?;
        let error_hash: Option<String> = row.get(13)?;
        let context_after_json: Option<String> = row.get(14)?;
        let status = match status_tag.as_str() {
            "open" => NodeStateStatus::Open,
            "pending" => NodeStateStatus::Pending,
            "completed" => NodeStateStatus::Completed {
                completed_at: completed_at
                    .and_then(|text| parse_dt(&text).ok())
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                duration_ms: duration_ms.unwrap_or(0) as u64,
                output_hash: output_hash.unwrap_or_default(),
                context_after_json: context_after_json.and_then(|text| parse_json(&text).ok()),
            },
            _ => NodeStateStatus::Failed {
                completed_at: completed_at
                    .and_then(|text| parse_dt(&text).ok())
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                duration_ms: duration_ms.unwrap_or(0) as u64,
                error_hash: error_hash.unwrap_or_default(),
                context_after_json: context_after_json.and_then(|text| parse_json(&text).ok()),
            },
        };
        Ok(NodeState {
            state_id: StateId::from(row.get::<_, String>(0)?),
            run_id: RunId::from(row.get::<_, String>(1)?),
            token_id: TokenId::from(row.get::<_, String>(2)?),
            node_id: NodeId::from(row.get::<_, String>(3)?),
            step_index: row.get::<_, i64>(4)? as u32,
            attempt: row.get::<_, i64>(5)? as u32,
            started_at: parse_dt(&row.get::<_, String>(6)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            input_hash: row.get(7)?,
            context_before_json: parse_opt_json(row.get::<_, Option<String>>(8)?)
                .unwrap_or_default(),
            status,
        })
    }

    fn map_routing_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoutingEvent> {
        Ok(RoutingEvent {
            event_id: row.get::<_, String>(0)?.into(),
            state_id: StateId::from(row.get::<_, String>(1)?),
            routing_group_id: row.get(2)?,
            decision: row.get(3)?,
            route_label: row.get::<_, String>(4)?.into(),
            is_fork: row.get::<_, i64>(5)? != 0,
            created_at: parse_dt(&row.get::<_, String>(6)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<Call> {
        Ok(Call {
            call_id: row.get::<_, String>(0)?.into(),
            state_id: StateId::from(row.get::<_, String>(1)?),
            call_index: row.get::<_, i64>(2)? as u32,
            call_type: row.get(3)?,
            status: text_to_enum(&row.get::<_, String>(4)?)
                .unwrap_or(landscape_core::model::entities::CallStatus::Failed),
            request_hash: row.get(5)?,
            request_ref: row.get(6)?,
            response_hash: row.get(7)?,
            response_ref: row.get(8)?,
            latency_ms: row.get::<_, Option<i64>>(9)?.map(|value| value as u64),
            error_json: parse_opt_json(row.get::<_, Option<String>>(10)?).unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>(11)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
        Ok(Artifact {
            artifact_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            sink_node_id: NodeId::from(row.get::<_, String>(2)?),
            artifact_type: row.get(3)?,
            content_hash: row.get(4)?,
            path_or_uri: row.get(5)?,
            size_bytes: row.get::<_, Option<i64>>(6)?.map(|value| value as u64),
            metadata_json: parse_opt_json(row.get::<_, Option<String>>(7)?).unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>(8)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_token_outcome(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenOutcome> {
        Ok(TokenOutcome {
            outcome_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            token_id: TokenId::from(row.get::<_, String>(2)?),
            outcome: text_to_enum(&row.get::<_, String>(3)?)
                .unwrap_or(landscape_core::model::entities::TokenOutcomeKind::Failed),
            is_terminal: row.get::<_, i64>(4)? != 0,
            sink_name: row.get::<_, Option<String>>(5)?.map(Into::into),
            batch_id: row.get::<_, Option<String>>(6)?.map(BatchId::from),
            fork_group_id: row.get(7)?,
            error_hash: row.get(8)?,
            context_json: parse_opt_json(row.get::<_, Option<String>>(9)?).unwrap_or_default(),
            recorded_at: parse_dt(&row.get::<_, String>(10)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
        Ok(Checkpoint {
            checkpoint_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            token_id: TokenId::from(row.get::<_, String>(2)?),
            node_id: NodeId::from(row.get::<_, String>(3)?),
            sequence_number: row.get::<_, i64>(4)? as u64,
            created_at: parse_dt(&row.get::<_, String>(5)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            upstream_topology_hash: row.get(6)?,
            checkpoint_node_config_hash: row.get(7)?,
            aggregation_state_json: parse_opt_json(row.get::<_, Option<String>>(8)?)
                .unwrap_or_default(),
        })
    }

    fn map_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
        Ok(Batch {
            batch_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            node_id: NodeId::from(row.get::<_, String>(2)?),
            created_at: parse_dt(&row.get::<_, String>(3)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_batch_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchMember> {
        Ok(BatchMember {
            batch_id: row.get::<_, String>(0)?.into(),
            token_id: TokenId::from(row.get::<_, String>(1)?),
            ordinal: row.get::<_, i64>(2)? as u32,
        })
    }

    fn map_validation_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationErrorRecord> {
        Ok(ValidationErrorRecord {
            error_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            node_id: NodeId::from(row.get::<_, String>(2)?),
            token_id: TokenId::from(row.get::<_, String>(3)?),
            field: row.get(4)?,
            message: row.get(5)?,
            details_json: parse_opt_json(row.get::<_, Option<String>>(6)?).unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>(7)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    fn map_transform_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransformErrorRecord> {
        Ok(TransformErrorRecord {
            error_id: row.get::<_, String>(0)?.into(),
            run_id: RunId::from(row.get::<_, String>(1)?),
            node_id: NodeId::from(row.get::<_, String>(2)?),
            token_id: TokenId::from(row.get::<_, String>(3)?),
            message: row.get(4)?,
            details_json: parse_opt_json(row.get::<_, Option<String>>(5)?).unwrap_or_default(),
            created_at: parse_dt(&row.get::<_, String>(6)?).unwrap_or(OffsetDateTime::UNIX_EPOCH),
        })
    }

    // ------------------------------------------------------------------
    // Inherent readers
    // ------------------------------------------------------------------

    /// Returns a run by id.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] if no such run exists.
    pub fn get_run(&self, run_id: &RunId) -> Result<Run, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, started_at, completed_at, config_hash, settings_json, \
             canonical_version, status, export_status, reproducibility_grade \
             FROM runs WHERE run_id = ?1",
            [run_id.as_str()],
            Self::map_run,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    /// Returns every run, most recently started first.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, started_at, completed_at, config_hash, settings_json, \
             canonical_version, status, export_status, reproducibility_grade \
             FROM runs ORDER BY started_at DESC",
        )?;
        let runs = stmt
            .query_map([], Self::map_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Returns every node registered in a run, in registration order.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_nodes(&self, run_id: &RunId) -> Result<Vec<Node>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, run_id, plugin_name, node_type, plugin_version, determinism, \
             config_hash, config_json, sequence_in_pipeline, schema_hash, schema_mode, \
             schema_fields, registered_at FROM nodes WHERE run_id = ?1 ORDER BY registered_at",
        )?;
        let nodes = stmt
            .query_map([run_id.as_str()], Self::map_node)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(nodes)
    }

    /// Returns every edge registered in a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_edges(&self, run_id: &RunId) -> Result<Vec<Edge>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT edge_id, run_id, from_node_id, to_node_id, label, default_mode, created_at \
             FROM edges WHERE run_id = ?1 ORDER BY created_at",
        )?;
        let edges = stmt
            .query_map([run_id.as_str()], |row| {
                Ok(Edge {
                    edge_id: row.get::<_, String>(0)?.into(),
                    run_id: RunId::from(row.get::<_, String>(1)?),
                    from_node_id: NodeId::from(row.get::<_, String>(2)?),
                    to_node_id: NodeId::from(row.get::<_, String>(3)?),
                    label: row.get::<_, String>(4)?.into(),
                    default_mode: text_to_enum(&row.get::<_, String>(5)?)
                        .unwrap_or(landscape_core::model::entities::EdgeMode::Move),
                    created_at: parse_dt(&row.get::<_, String>(6)?)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// Returns every row recorded for a run, in emission order.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_rows(&self, run_id: &RunId) -> Result<Vec<LandscapeRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, created_at FROM rows WHERE run_id = ?1 ORDER BY row_index",
        )?;
        let rows = stmt
            .query_map([run_id.as_str()], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn load_token(conn: &Connection, token_id: &TokenId) -> Result<Token, StoreError> {
        conn.query_row(
            "SELECT token_id, row_id, branch_name, fork_group_id, join_group_id, \
             expand_group_id, created_at FROM tokens WHERE token_id = ?1",
            [token_id.as_str()],
            Self::map_token,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("token {token_id}")))
    }

    fn load_token_by_row(conn: &Connection, row_id: &RowId) -> Result<Token, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT token_id, row_id, branch_name, fork_group_id, join_group_id, \
             expand_group_id, created_at FROM tokens WHERE row_id = ?1 ORDER BY created_at",
        )?;
        let mut tokens = stmt
            .query_map([row_id.as_str()], Self::map_token)?
            .collect::<Result<Vec<_>, _>>()?;
        match tokens.len() {
            0 => Err(StoreError::NotFound(format!("token for row {row_id}"))),
            1 => Ok(tokens.remove(0)),
            _ => Err(StoreError::Invalid(format!(
                "row {row_id} produced more than one token; pass token_id instead"
            ))),
        }
    }

    fn load_row(conn: &Connection, row_id: &RowId) -> Result<LandscapeRow, StoreError> {
        conn.query_row(
            "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, created_at FROM rows WHERE row_id = ?1",
            [row_id.as_str()],
            Self::map_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("row {row_id}")))
    }

    fn load_node_states_for_token(
        conn: &Connection,
        token_id: &TokenId,
    ) -> Result<Vec<NodeState>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT state_id, run_id, token_id, node_id, step_index, attempt, started_at, \
             input_hash, context_before_json, status, completed_at, duration_ms, output_hash, \
             error_hash, context_after_json FROM node_states WHERE token_id = ?1 \
             ORDER BY step_index, attempt",
        )?;
        let states = stmt
            .query_map([token_id.as_str()], Self::map_node_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    fn load_routing_events(
        conn: &Connection,
        state_id: &StateId,
    ) -> Result<Vec<RoutingEvent>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT event_id, state_id, routing_group_id, decision, route_label, is_fork, \
             created_at FROM routing_events WHERE state_id = ?1 ORDER BY created_at",
        )?;
        let events = stmt
            .query_map([state_id.as_str()], Self::map_routing_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn load_calls(conn: &Connection, state_id: &StateId) -> Result<Vec<Call>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT call_id, state_id, call_index, call_type, status, request_hash, \
             request_ref, response_hash, response_ref, latency_ms, error_json, created_at \
             FROM calls WHERE state_id = ?1 ORDER BY call_index",
        )?;
        let calls = stmt
            .query_map([state_id.as_str()], Self::map_call)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    fn load_token_parents(
        conn: &Connection,
        token_id: &TokenId,
    ) -> Result<Vec<TokenParent>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT token_id, parent_token_id, ordinal FROM token_parents \
             WHERE token_id = ?1 ORDER BY ordinal",
        )?;
        let parents = stmt
            .query_map([token_id.as_str()], Self::map_token_parent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parents)
    }

    fn load_validation_errors(
        conn: &Connection,
        run_id: &RunId,
        token_id: &TokenId,
    ) -> Result<Vec<ValidationErrorRecord>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT error_id, run_id, node_id, token_id, field, message, details_json, \
             created_at FROM validation_errors WHERE run_id = ?1 AND token_id = ?2 \
             ORDER BY created_at",
        )?;
        let errors = stmt
            .query_map(params![run_id.as_str(), token_id.as_str()], Self::map_validation_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    fn load_transform_errors(
        conn: &Connection,
        run_id: &RunId,
        token_id: &TokenId,
    ) -> Result<Vec<TransformErrorRecord>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT error_id, run_id, node_id, token_id, message, details_json, created_at \
             FROM transform_errors WHERE run_id = ?1 AND token_id = ?2 ORDER BY created_at",
        )?;
        let errors = stmt
            .query_map(params![run_id.as_str(), token_id.as_str()], Self::map_transform_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    fn load_terminal_outcome(
        conn: &Connection,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, StoreError> {
        conn.query_row(
            "SELECT outcome_id, run_id, token_id, outcome, is_terminal, sink_name, batch_id, \
             fork_group_id, error_hash, context_json, recorded_at FROM token_outcomes \
             WHERE token_id = ?1 AND is_terminal = 1 \
             ORDER BY recorded_at DESC, outcome_id ASC LIMIT 1",
            [token_id.as_str()],
            Self::map_token_outcome,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Returns the recorded disposition of a token, terminal or not, if any.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_token_outcome(
        &self,
        token_id: &TokenId,
    ) -> Result<Option<TokenOutcome>, StoreError> {
        let conn = self.lock()?;
        Self::load_terminal_outcome(&conn, token_id)
    }

    /// Returns every checkpoint recorded for a run, in sequence order.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_checkpoints_for_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, created_at, \
             upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json \
             FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number",
        )?;
        let checkpoints = stmt
            .query_map([run_id.as_str()], Self::map_checkpoint)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checkpoints)
    }

    /// Returns every artifact a run's sinks produced, in write order.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_artifacts(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT artifact_id, run_id, sink_node_id, artifact_type, content_hash, \
             path_or_uri, size_bytes, metadata_json, created_at FROM artifacts \
             WHERE run_id = ?1 ORDER BY created_at",
        )?;
        let artifacts = stmt
            .query_map([run_id.as_str()], Self::map_artifact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// Returns every token outcome recorded for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_token_outcomes(&self, run_id: &RunId) -> Result<Vec<TokenOutcome>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT outcome_id, run_id, token_id, outcome, is_terminal, sink_name, batch_id, \
             fork_group_id, error_hash, context_json, recorded_at FROM token_outcomes \
             WHERE run_id = ?1 ORDER BY recorded_at",
        )?;
        let outcomes = stmt
            .query_map([run_id.as_str()], Self::map_token_outcome)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outcomes)
    }

    /// Returns every token whose row belongs to a run, oldest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_tokens_for_run(&self, run_id: &RunId) -> Result<Vec<Token>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT t.token_id, t.row_id, t.branch_name, t.fork_group_id, t.join_group_id, \
             t.expand_group_id, t.created_at FROM tokens t \
             JOIN rows r ON r.row_id = t.row_id WHERE r.run_id = ?1 ORDER BY t.created_at",
        )?;
        let tokens = stmt
            .query_map([run_id.as_str()], Self::map_token)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }

    /// Returns every parent/child token lineage edge for a run's tokens.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_token_parents_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TokenParent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT p.token_id, p.parent_token_id, p.ordinal FROM token_parents p \
             JOIN tokens t ON t.token_id = p.token_id \
             JOIN rows r ON r.row_id = t.row_id WHERE r.run_id = ?1 ORDER BY p.ordinal",
        )?;
        let parents = stmt
            .query_map([run_id.as_str()], Self::map_token_parent)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parents)
    }

    /// Returns every node-state attempt recorded for a run, in step order.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_node_states_for_run(&self, run_id: &RunId) -> Result<Vec<NodeState>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT state_id, run_id, token_id, node_id, step_index, attempt, started_at, \
             input_hash, context_before_json, status, completed_at, duration_ms, output_hash, \
             error_hash, context_after_json FROM node_states WHERE run_id = ?1 \
             ORDER BY step_index, attempt",
        )?;
        let states = stmt
            .query_map([run_id.as_str()], Self::map_node_state)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Returns every gate routing decision recorded for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_routing_events_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<RoutingEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.event_id, e.state_id, e.routing_group_id, e.decision, e.route_label, \
             e.is_fork, e.created_at FROM routing_events e \
             JOIN node_states s ON s.state_id = e.state_id \
             WHERE s.run_id = ?1 ORDER BY e.created_at",
        )?;
        let events = stmt
            .query_map([run_id.as_str()], Self::map_routing_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Returns every external call recorded for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_calls_for_run(&self, run_id: &RunId) -> Result<Vec<Call>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.call_id, c.state_id, c.call_index, c.call_type, c.status, \
             c.request_hash, c.request_ref, c.response_hash, c.response_ref, c.latency_ms, \
             c.error_json, c.created_at FROM calls c \
             JOIN node_states s ON s.state_id = c.state_id \
             WHERE s.run_id = ?1 ORDER BY c.created_at",
        )?;
        let calls = stmt
            .query_map([run_id.as_str()], Self::map_call)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    /// Returns every aggregation batch opened for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_batches_for_run(&self, run_id: &RunId) -> Result<Vec<Batch>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT batch_id, run_id, node_id, created_at FROM batches \
             WHERE run_id = ?1 ORDER BY created_at",
        )?;
        let batches = stmt
            .query_map([run_id.as_str()], Self::map_batch)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(batches)
    }

    /// Returns every batch membership recorded for a run's batches.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_batch_members_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<BatchMember>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT m.batch_id, m.token_id, m.ordinal FROM batch_members m \
             JOIN batches b ON b.batch_id = m.batch_id \
             WHERE b.run_id = ?1 ORDER BY m.ordinal",
        )?;
        let members = stmt
            .query_map([run_id.as_str()], Self::map_batch_member)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    /// Returns every batch output produced for a run's batches.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_batch_outputs_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<BatchOutput>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT o.batch_id, o.output_token_id FROM batch_outputs o \
             JOIN batches b ON b.batch_id = o.batch_id WHERE b.run_id = ?1",
        )?;
        let outputs = stmt
            .query_map([run_id.as_str()], |row| {
                Ok(BatchOutput {
                    batch_id: row.get::<_, String>(0)?.into(),
                    output_token_id: TokenId::from(row.get::<_, String>(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outputs)
    }

    /// Returns every schema validation error recorded for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_validation_errors_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<ValidationErrorRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT error_id, run_id, node_id, token_id, field, message, details_json, \
             created_at FROM validation_errors WHERE run_id = ?1 ORDER BY created_at",
        )?;
        let errors = stmt
            .query_map([run_id.as_str()], Self::map_validation_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    /// Returns every transform-raised error recorded for a run.
    ///
    /// # Errors
    /// Returns [`StoreError::Db`] if the read fails.
    pub fn get_transform_errors_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<TransformErrorRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT error_id, run_id, node_id, token_id, message, details_json, created_at \
             FROM transform_errors WHERE run_id = ?1 ORDER BY created_at",
        )?;
        let errors = stmt
            .query_map([run_id.as_str()], Self::map_transform_error)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    // ------------------------------------------------------------------
    // Explain / lineage
    // ------------------------------------------------------------------

    /// Explains one token's full lineage: its originating row, every node
    /// state attempt it went through, every routing decision and call made
    /// along the way, its parent tokens, any errors it raised, and its
    /// terminal outcome.
    ///
    /// Exactly one of `token_id` or `row_id` must be supplied. When `row_id`
    /// is given and the row produced more than one token (a fork or
    /// expansion), the caller must disambiguate with `token_id` instead.
    ///
    /// # Errors
    /// Returns [`StoreError::Invalid`] if both or neither selector is
    /// supplied, or if `row_id` resolves to more than one token.
    /// Returns [`StoreError::NotFound`] if the selector resolves to nothing.
    pub fn explain(
        &self,
        run_id: &RunId,
        token_id: Option<&TokenId>,
        row_id: Option<&RowId>,
    ) -> Result<LineageResult, StoreError> {
        let conn = self.lock()?;
        let token = match (token_id, row_id) {
            (Some(token_id), None) => Self::load_token(&conn, token_id)?,
            (None, Some(row_id)) => Self::load_token_by_row(&conn, row_id)?,
            _ => {
                return Err(StoreError::Invalid(
                    "explain requires exactly one of token_id or row_id".to_string(),
                ));
            }
        };
        let row = Self::load_row(&conn, &token.row_id)?;
        let node_states = Self::load_node_states_for_token(&conn, &token.token_id)?;
        let mut routing_events = Vec::new();
        let mut calls = Vec::new();
        for state in &node_states {
            routing_events.extend(Self::load_routing_events(&conn, &state.state_id)?);
            calls.extend(Self::load_calls(&conn, &state.state_id)?);
        }
        let token_parents = Self::load_token_parents(&conn, &token.token_id)?;
        let validation_errors = Self::load_validation_errors(&conn, run_id, &token.token_id)?;
        let transform_errors = Self::load_transform_errors(&conn, run_id, &token.token_id)?;
        let outcome = Self::load_terminal_outcome(&conn, &token.token_id)?;
        Ok(LineageResult {
            row,
            token,
            node_states,
            routing_events,
            calls,
            token_parents,
            validation_errors,
            transform_errors,
            outcome,
        })
    }
}

/// The full, explainable lineage of one token: its originating row, every
/// attempt it went through, and its final disposition.
#[derive(Debug, Clone)]
pub struct LineageResult {
    /// The row the explained token originated from.
    pub row: LandscapeRow,
    /// The explained token.
    pub token: Token,
    /// Every node-state attempt the token went through, in order.
    pub node_states: Vec<NodeState>,
    /// Every routing decision made for the token's attempts.
    pub routing_events: Vec<RoutingEvent>,
    /// Every external call made during the token's attempts.
    pub calls: Vec<Call>,
    /// The token's parent tokens, if any (fork/join ancestry).
    pub token_parents: Vec<TokenParent>,
    /// Validation errors raised against the token.
    pub validation_errors: Vec<ValidationErrorRecord>,
    /// Transform errors raised against the token.
    pub transform_errors: Vec<TransformErrorRecord>,
    /// The token's terminal outcome, if it has reached one.
    pub outcome: Option<TokenOutcome>,
}

// ============================================================================
// SECTION: AuditRecorder
// ============================================================================

impl AuditRecorder for LandscapeStore {
    fn insert_run(&mut self, run: &Run) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, started_at, completed_at, config_hash, settings_json, \
             canonical_version, status, export_status, reproducibility_grade) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_id.as_str(),
                format_dt(run.started_at)?,
                run.completed_at.map(format_dt).transpose()?,
                run.config_hash,
                value_to_text(&run.settings_json)?,
                run.canonical_version,
                enum_to_text(&run.status)?,
                run.export_status,
                run.reproducibility_grade,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn update_run_status(
        &mut self,
        run_id: &RunId,
        status: RunStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE runs SET status = ?1, completed_at = ?2 WHERE run_id = ?3",
                params![
                    enum_to_text(&status)?,
                    completed_at.map(format_dt).transpose()?,
                    run_id.as_str(),
                ],
            )
            .map_err(StoreError::from)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")).into());
        }
        Ok(())
    }

    fn insert_node(&mut self, node: &Node) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO nodes (node_id, run_id, plugin_name, node_type, plugin_version, \
             determinism, config_hash, config_json, sequence_in_pipeline, schema_hash, \
             schema_mode, schema_fields, registered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                node.node_id.as_str(),
                node.run_id.as_str(),
                node.plugin_name.as_str(),
                enum_to_text(&node.node_type)?,
                node.plugin_version,
                enum_to_text(&node.determinism)?,
                node.config_hash,
                value_to_text(&node.config_json)?,
                node.sequence_in_pipeline.map(i64::from),
                node.schema_hash,
                node.schema_mode,
                opt_value_to_text(node.schema_fields.as_ref())?,
                format_dt(node.registered_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_edge(&mut self, edge: &Edge) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO edges (edge_id, run_id, from_node_id, to_node_id, label, \
             default_mode, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.edge_id.as_str(),
                edge.run_id.as_str(),
                edge.from_node_id.as_str(),
                edge.to_node_id.as_str(),
                edge.label.as_str(),
                enum_to_text(&edge.default_mode)?,
                format_dt(edge.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_row(&mut self, row: &LandscapeRow) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rows (row_id, run_id, source_node_id, row_index, source_data_hash, \
             source_data_ref, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.row_id.as_str(),
                row.run_id.as_str(),
                row.source_node_id.as_str(),
                row.row_index as i64,
                row.source_data_hash,
                row.source_data_ref,
                format_dt(row.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_token(&mut self, token: &Token) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tokens (token_id, row_id, branch_name, fork_group_id, join_group_id, \
             expand_group_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.token_id.as_str(),
                token.row_id.as_str(),
                token.branch_name.as_ref().map(|name| name.as_str()),
                token.fork_group_id,
                token.join_group_id,
                token.expand_group_id,
                format_dt(token.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_token_parent(&mut self, parent: &TokenParent) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO token_parents (token_id, parent_token_id, ordinal) \
             VALUES (?1, ?2, ?3)",
            params![
                parent.token_id.as_str(),
                parent.parent_token_id.as_str(),
                parent.ordinal,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_node_state(&mut self, state: &NodeState) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        let status_tag = match &state.status {
            NodeStateStatus::Open => "open",
            NodeStateStatus::Pending => "pending",
            NodeStateStatus::Completed { .. } => "completed",
            NodeStateStatus::Failed { .. } => "failed",
        };
        conn.execute(
            "INSERT INTO node_states (state_id, run_id, token_id, node_id, step_index, \
             attempt, started_at, input_hash, context_before_json, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                state.state_id.as_str(),
                state.run_id.as_str(),
                state.token_id.as_str(),
                state.node_id.as_str(),
                state.step_index,
                state.attempt,
                format_dt(state.started_at)?,
                state.input_hash,
                opt_value_to_text(state.context_before_json.as_ref())?,
                status_tag,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn update_node_state_status(
        &mut self,
        state_id: &StateId,
        status: NodeStateStatus,
    ) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        let (tag, completed_at, duration_ms, output_hash, error_hash, context_after_json) =
            match status {
                NodeStateStatus::Open => ("open", None, None, None, None, None),
                NodeStateStatus::Pending => ("pending", None, None, None, None, None),
                NodeStateStatus::Completed {
                    completed_at,
                    duration_ms,
                    output_hash,
                    context_after_json,
                } => (
                    "completed",
                    Some(format_dt(completed_at)?),
                    Some(duration_ms as i64),
                    Some(output_hash),
                    None,
                    opt_value_to_text(context_after_json.as_ref())?,
                ),
                NodeStateStatus::Failed {
                    completed_at,
                    duration_ms,
                    error_hash,
                    context_after_json,
                } => (
                    "failed",
                    Some(format_dt(completed_at)?),
                    Some(duration_ms as i64),
                    None,
                    Some(error_hash),
                    opt_value_to_text(context_after_json.as_ref())?,
                ),
            };
        let affected = conn
            .execute(
                "UPDATE node_states SET status = ?1, completed_at = ?2, duration_ms = ?3, \
                 output_hash = ?4, error_hash = ?5, context_after_json = ?6 \
                 WHERE state_id = ?7",
                params![
                    tag,
                    completed_at,
                    duration_ms,
                    output_hash,
                    error_hash,
                    context_after_json,
                    state_id.as_str(),
                ],
            )
            .map_err(StoreError::from)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("node state {state_id}")).into());
        }
        Ok(())
    }

    fn insert_routing_event(&mut self, event: &RoutingEvent) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO routing_events (event_id, state_id, routing_group_id, decision, \
             route_label, is_fork, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.event_id.as_str(),
                event.state_id.as_str(),
                event.routing_group_id,
                event.decision,
                event.route_label.as_str(),
                event.is_fork,
                format_dt(event.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_call(&mut self, call: &Call) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO calls (call_id, state_id, call_index, call_type, status, \
             request_hash, request_ref, response_hash, response_ref, latency_ms, error_json, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                call.call_id.as_str(),
                call.state_id.as_str(),
                call.call_index,
                call.call_type,
                enum_to_text(&call.status)?,
                call.request_hash,
                call.request_ref,
                call.response_hash,
                call.response_ref,
                call.latency_ms.map(|value| value as i64),
                opt_value_to_text(call.error_json.as_ref())?,
                format_dt(call.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_artifact(&mut self, artifact: &Artifact) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO artifacts (artifact_id, run_id, sink_node_id, artifact_type, \
             content_hash, path_or_uri, size_bytes, metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                artifact.artifact_id.as_str(),
                artifact.run_id.as_str(),
                artifact.sink_node_id.as_str(),
                artifact.artifact_type,
                artifact.content_hash,
                artifact.path_or_uri,
                artifact.size_bytes.map(|value| value as i64),
                opt_value_to_text(artifact.metadata_json.as_ref())?,
                format_dt(artifact.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_token_outcome(&mut self, outcome: &TokenOutcome) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO token_outcomes (outcome_id, run_id, token_id, outcome, is_terminal, \
             sink_name, batch_id, fork_group_id, error_hash, context_json, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                outcome.outcome_id.as_str(),
                outcome.run_id.as_str(),
                outcome.token_id.as_str(),
                enum_to_text(&outcome.outcome)?,
                outcome.is_terminal,
                outcome.sink_name.as_ref().map(|name| name.as_str()),
                outcome.batch_id.as_ref().map(|id| id.as_str()),
                outcome.fork_group_id,
                outcome.error_hash,
                opt_value_to_text(outcome.context_json.as_ref())?,
                format_dt(outcome.recorded_at)?,
            ],
        )
        .map_err(|error| {
            if matches!(
                &error,
                rusqlite::Error::SqliteFailure(code, _)
                    if code.code == rusqlite::ErrorCode::ConstraintViolation
            ) {
                StoreError::Invalid(format!(
                    "token {} already has a terminal outcome",
                    outcome.token_id
                ))
            } else {
                StoreError::from(error)
            }
        })?;
        Ok(())
    }

    fn insert_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, run_id, token_id, node_id, \
             sequence_number, created_at, upstream_topology_hash, \
             checkpoint_node_config_hash, aggregation_state_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                checkpoint.checkpoint_id.as_str(),
                checkpoint.run_id.as_str(),
                checkpoint.token_id.as_str(),
                checkpoint.node_id.as_str(),
                checkpoint.sequence_number as i64,
                format_dt(checkpoint.created_at)?,
                checkpoint.upstream_topology_hash,
                checkpoint.checkpoint_node_config_hash,
                opt_value_to_text(checkpoint.aggregation_state_json.as_ref())?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_batch(&mut self, batch: &Batch) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO batches (batch_id, run_id, node_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                batch.batch_id.as_str(),
                batch.run_id.as_str(),
                batch.node_id.as_str(),
                format_dt(batch.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_batch_member(&mut self, member: &BatchMember) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO batch_members (batch_id, token_id, ordinal) VALUES (?1, ?2, ?3)",
            params![member.batch_id.as_str(), member.token_id.as_str(), member.ordinal],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_batch_output(&mut self, output: &BatchOutput) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO batch_outputs (batch_id, output_token_id) VALUES (?1, ?2)",
            params![output.batch_id.as_str(), output.output_token_id.as_str()],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_validation_error(
        &mut self,
        error: &ValidationErrorRecord,
    ) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO validation_errors (error_id, run_id, node_id, token_id, field, \
             message, details_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                error.error_id.as_str(),
                error.run_id.as_str(),
                error.node_id.as_str(),
                error.token_id.as_str(),
                error.field,
                error.message,
                opt_value_to_text(error.details_json.as_ref())?,
                format_dt(error.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn insert_transform_error(
        &mut self,
        error: &TransformErrorRecord,
    ) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO transform_errors (error_id, run_id, node_id, token_id, message, \
             details_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                error.error_id.as_str(),
                error.run_id.as_str(),
                error.node_id.as_str(),
                error.token_id.as_str(),
                error.message,
                opt_value_to_text(error.details_json.as_ref())?,
                format_dt(error.created_at)?,
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn latest_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>, RecorderError> {
        let conn = self.lock()?;
        let checkpoint = conn
            .query_row(
                "SELECT checkpoint_id, run_id, token_id, node_id, sequence_number, created_at, \
                 upstream_topology_hash, checkpoint_node_config_hash, aggregation_state_json \
                 FROM checkpoints WHERE run_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
                [run_id.as_str()],
                Self::map_checkpoint,
            )
            .optional()
            .map_err(StoreError::from)?;
        Ok(checkpoint)
    }

    fn has_terminal_outcome(&self, token_id: &TokenId) -> Result<bool, RecorderError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM token_outcomes WHERE token_id = ?1 AND is_terminal = 1",
                [token_id.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)?;
        Ok(count > 0)
    }

    fn rows_after(
        &self,
        run_id: &RunId,
        after_row_index: Option<u64>,
    ) -> Result<Vec<LandscapeRow>, RecorderError> {
        let conn = self.lock()?;
        let threshold = after_row_index.map_or(-1_i64, |value| value as i64);
        let mut stmt = conn
            .prepare(
                "SELECT row_id, run_id, source_node_id, row_index, source_data_hash, \
                 source_data_ref, created_at FROM rows \
                 WHERE run_id = ?1 AND row_index > ?2 ORDER BY row_index",
            )
            .map_err(StoreError::from)?;
        let rows = stmt
            .query_map(params![run_id.as_str(), threshold], Self::map_row)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(rows)
    }

    fn open_batches(&self, node_id: &NodeId) -> Result<Vec<Batch>, RecorderError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT b.batch_id, b.run_id, b.node_id, b.created_at FROM batches b \
                 WHERE b.node_id = ?1 AND NOT EXISTS ( \
                     SELECT 1 FROM batch_outputs o WHERE o.batch_id = b.batch_id \
                 ) ORDER BY b.created_at",
            )
            .map_err(StoreError::from)?;
        let batches = stmt
            .query_map([node_id.as_str()], Self::map_batch)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(batches)
    }

    fn batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMember>, RecorderError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT batch_id, token_id, ordinal FROM batch_members \
                 WHERE batch_id = ?1 ORDER BY ordinal",
            )
            .map_err(StoreError::from)?;
        let members = stmt
            .query_map([batch_id.as_str()], Self::map_batch_member)
            .map_err(StoreError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        Ok(members)
    }

    fn referenced_payload_hashes(&self, run_id: &RunId) -> Result<Vec<String>, RecorderError> {
        let conn = self.lock()?;
        let mut hashes = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT source_data_ref FROM rows \
                     WHERE run_id = ?1 AND source_data_ref IS NOT NULL",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([run_id.as_str()], |row| row.get::<_, String>(0))
                .map_err(StoreError::from)?;
            for row in rows {
                hashes.push(row.map_err(StoreError::from)?);
            }
        }
        {
            let mut stmt = conn
                .prepare(
                    "SELECT request_ref, response_ref FROM calls c \
                     JOIN node_states s ON s.state_id = c.state_id \
                     WHERE s.run_id = ?1",
                )
                .map_err(StoreError::from)?;
            let rows = stmt
                .query_map([run_id.as_str()], |row| {
                    Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .map_err(StoreError::from)?;
            for row in rows {
                let (request_ref, response_ref) = row.map_err(StoreError::from)?;
                hashes.extend(request_ref);
                hashes.extend(response_ref);
            }
        }
        Ok(hashes)
    }

    fn update_reproducibility_grade(
        &mut self,
        run_id: &RunId,
        grade: Option<String>,
    ) -> Result<(), RecorderError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE runs SET reproducibility_grade = ?1 WHERE run_id = ?2",
                params![grade, run_id.as_str()],
            )
            .map_err(StoreError::from)?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use landscape_core::model::ids::PluginName;
    use tempfile::tempdir;

    use super::*;

    fn open_store() -> (LandscapeStore, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = LandscapeStore::open(StoreConfig::new(dir.path().join("audit.db")))
            .expect("open store");
        (store, dir)
    }

    fn sample_run(run_id: &str) -> Run {
        Run {
            run_id: RunId::new(run_id),
            started_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: None,
            config_hash: "deadbeef".to_string(),
            settings_json: serde_json::json!({"mode": "test"}),
            canonical_version: "landscape-jcs-1".to_string(),
            status: RunStatus::Running,
            export_status: None,
            reproducibility_grade: None,
        }
    }

    #[test]
    fn round_trips_a_run() {
        let (mut store, _dir) = open_store();
        let run = sample_run("run-1");
        store.insert_run(&run).expect("insert run");
        let loaded = store.get_run(&run.run_id).expect("get run");
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.settings_json, run.settings_json);
    }

    #[test]
    fn update_run_status_requires_existing_run() {
        let (mut store, _dir) = open_store();
        let result = store.update_run_status(&RunId::new("missing"), RunStatus::Completed, None);
        assert!(result.is_err());
    }

    #[test]
    fn enforces_one_terminal_outcome_per_token() {
        let (mut store, _dir) = open_store();
        let run = sample_run("run-2");
        store.insert_run(&run).expect("insert run");
        let node = Node {
            node_id: NodeId::new("node-1"),
            run_id: run.run_id.clone(),
            plugin_name: PluginName::new("source"),
            node_type: landscape_core::model::entities::NodeKind::Source,
            plugin_version: "1.0.0".to_string(),
            determinism: landscape_core::model::entities::Determinism::Guaranteed,
            config_hash: "abc".to_string(),
            config_json: serde_json::json!({}),
            sequence_in_pipeline: Some(0),
            schema_hash: None,
            schema_mode: None,
            schema_fields: None,
            registered_at: OffsetDateTime::UNIX_EPOCH,
        };
        store.insert_node(&node).expect("insert node");
        let row = LandscapeRow {
            row_id: RowId::new("row-1"),
            run_id: run.run_id.clone(),
            source_node_id: node.node_id.clone(),
            row_index: 0,
            source_data_hash: "hash".to_string(),
            source_data_ref: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        store.insert_row(&row).expect("insert row");
        let token = Token {
            token_id: TokenId::new("token-1"),
            row_id: row.row_id.clone(),
            branch_name: None,
            fork_group_id: None,
            join_group_id: None,
            expand_group_id: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        store.insert_token(&token).expect("insert token");
        let first = TokenOutcome {
            outcome_id: "outcome-1".to_string().into(),
            run_id: run.run_id.clone(),
            token_id: token.token_id.clone(),
            outcome: landscape_core::model::entities::TokenOutcomeKind::Completed,
            is_terminal: true,
            sink_name: None,
            batch_id: None,
            fork_group_id: None,
            error_hash: None,
            context_json: None,
            recorded_at: OffsetDateTime::UNIX_EPOCH,
        };
        store.insert_token_outcome(&first).expect("first terminal outcome");
        let second = TokenOutcome {
            outcome_id: "outcome-2".to_string().into(),
            ..first
        };
        let result = store.insert_token_outcome(&second);
        assert!(result.is_err());
    }

    #[test]
    fn explain_requires_exactly_one_selector() {
        let (store, _dir) = open_store();
        let result = store.explain(&RunId::new("run-1"), None, None);
        assert!(result.is_err());
    }
}
