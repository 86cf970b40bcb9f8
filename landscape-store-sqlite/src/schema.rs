// landscape-store-sqlite/src/schema.rs
// ============================================================================
// Module: Schema
// Description: DDL for the 17-table audit trail and its compatibility check.
// Purpose: Create a fresh database on first open, and refuse to operate
//          against a database whose schema does not match what this crate
//          expects (a partial migration, or a foreign file at the same
//          path), rather than failing confusingly at the first write.
// Dependencies: rusqlite
// ============================================================================

use rusqlite::Connection;

use crate::error::StoreError;

/// Schema version written to `store_meta` on creation.
pub const SCHEMA_VERSION: i64 = 1;

/// Full DDL for a fresh database, executed inside one transaction.
const DDL: &str = r"
CREATE TABLE store_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE runs (
    run_id                 TEXT PRIMARY KEY,
    started_at             TEXT NOT NULL,
    completed_at           TEXT,
    config_hash            TEXT NOT NULL,
    settings_json          TEXT NOT NULL,
    canonical_version      TEXT NOT NULL,
    status                 TEXT NOT NULL,
    export_status          TEXT,
    reproducibility_grade  TEXT
);

CREATE TABLE nodes (
    node_id               TEXT PRIMARY KEY,
    run_id                TEXT NOT NULL REFERENCES runs(run_id),
    plugin_name           TEXT NOT NULL,
    node_type             TEXT NOT NULL,
    plugin_version        TEXT NOT NULL,
    determinism           TEXT NOT NULL,
    config_hash           TEXT NOT NULL,
    config_json           TEXT NOT NULL,
    sequence_in_pipeline  INTEGER,
    schema_hash           TEXT,
    schema_mode           TEXT,
    schema_fields         TEXT,
    registered_at         TEXT NOT NULL
);
CREATE INDEX idx_nodes_run ON nodes(run_id);

CREATE TABLE edges (
    edge_id       TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    from_node_id  TEXT NOT NULL REFERENCES nodes(node_id),
    to_node_id    TEXT NOT NULL REFERENCES nodes(node_id),
    label         TEXT NOT NULL,
    default_mode  TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE (run_id, from_node_id, label)
);
CREATE INDEX idx_edges_run ON edges(run_id);

CREATE TABLE rows (
    row_id            TEXT PRIMARY KEY,
    run_id            TEXT NOT NULL REFERENCES runs(run_id),
    source_node_id    TEXT NOT NULL REFERENCES nodes(node_id),
    row_index         INTEGER NOT NULL,
    source_data_hash  TEXT NOT NULL,
    source_data_ref   TEXT,
    created_at        TEXT NOT NULL,
    UNIQUE (run_id, row_index)
);
CREATE INDEX idx_rows_run ON rows(run_id);

CREATE TABLE tokens (
    token_id         TEXT PRIMARY KEY,
    row_id           TEXT NOT NULL REFERENCES rows(row_id),
    branch_name      TEXT,
    fork_group_id    TEXT,
    join_group_id    TEXT,
    expand_group_id  TEXT,
    created_at       TEXT NOT NULL
);
CREATE INDEX idx_tokens_row ON tokens(row_id);

CREATE TABLE token_parents (
    token_id         TEXT NOT NULL REFERENCES tokens(token_id),
    parent_token_id  TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal          INTEGER NOT NULL,
    PRIMARY KEY (token_id, parent_token_id)
);

CREATE TABLE node_states (
    state_id             TEXT PRIMARY KEY,
    run_id               TEXT NOT NULL REFERENCES runs(run_id),
    token_id             TEXT NOT NULL REFERENCES tokens(token_id),
    node_id              TEXT NOT NULL REFERENCES nodes(node_id),
    step_index           INTEGER NOT NULL,
    attempt              INTEGER NOT NULL,
    started_at           TEXT NOT NULL,
    input_hash           TEXT NOT NULL,
    context_before_json  TEXT,
    status               TEXT NOT NULL,
    completed_at         TEXT,
    duration_ms          INTEGER,
    output_hash          TEXT,
    error_hash           TEXT,
    context_after_json   TEXT
);
CREATE INDEX idx_node_states_token ON node_states(token_id);
CREATE INDEX idx_node_states_run ON node_states(run_id);

CREATE TABLE routing_events (
    event_id          TEXT PRIMARY KEY,
    state_id          TEXT NOT NULL REFERENCES node_states(state_id),
    routing_group_id  TEXT NOT NULL,
    decision          TEXT NOT NULL,
    route_label       TEXT NOT NULL,
    is_fork           INTEGER NOT NULL,
    created_at        TEXT NOT NULL
);
CREATE INDEX idx_routing_events_state ON routing_events(state_id);

CREATE TABLE calls (
    call_id        TEXT PRIMARY KEY,
    state_id       TEXT NOT NULL REFERENCES node_states(state_id),
    call_index     INTEGER NOT NULL,
    call_type      TEXT NOT NULL,
    status         TEXT NOT NULL,
    request_hash   TEXT NOT NULL,
    request_ref    TEXT,
    response_hash  TEXT,
    response_ref   TEXT,
    latency_ms     INTEGER,
    error_json     TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX idx_calls_state ON calls(state_id);

CREATE TABLE artifacts (
    artifact_id    TEXT PRIMARY KEY,
    run_id         TEXT NOT NULL REFERENCES runs(run_id),
    sink_node_id   TEXT NOT NULL REFERENCES nodes(node_id),
    artifact_type  TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    path_or_uri    TEXT NOT NULL,
    size_bytes     INTEGER,
    metadata_json  TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX idx_artifacts_run ON artifacts(run_id);

CREATE TABLE batches (
    batch_id    TEXT PRIMARY KEY,
    run_id      TEXT NOT NULL REFERENCES runs(run_id),
    node_id     TEXT NOT NULL REFERENCES nodes(node_id),
    created_at  TEXT NOT NULL
);
CREATE INDEX idx_batches_node ON batches(node_id);

CREATE TABLE batch_members (
    batch_id  TEXT NOT NULL REFERENCES batches(batch_id),
    token_id  TEXT NOT NULL REFERENCES tokens(token_id),
    ordinal   INTEGER NOT NULL,
    PRIMARY KEY (batch_id, token_id)
);

CREATE TABLE batch_outputs (
    batch_id         TEXT NOT NULL REFERENCES batches(batch_id),
    output_token_id  TEXT NOT NULL REFERENCES tokens(token_id),
    PRIMARY KEY (batch_id, output_token_id)
);

CREATE TABLE token_outcomes (
    outcome_id      TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL REFERENCES runs(run_id),
    token_id        TEXT NOT NULL REFERENCES tokens(token_id),
    outcome         TEXT NOT NULL,
    is_terminal     INTEGER NOT NULL,
    sink_name       TEXT,
    batch_id        TEXT REFERENCES batches(batch_id),
    fork_group_id   TEXT,
    error_hash      TEXT,
    context_json    TEXT,
    recorded_at     TEXT NOT NULL
);
CREATE INDEX idx_token_outcomes_run ON token_outcomes(run_id);
CREATE UNIQUE INDEX idx_token_outcomes_terminal
    ON token_outcomes(token_id)
    WHERE is_terminal = 1;

CREATE TABLE checkpoints (
    checkpoint_id                TEXT PRIMARY KEY,
    run_id                       TEXT NOT NULL REFERENCES runs(run_id),
    token_id                     TEXT NOT NULL REFERENCES tokens(token_id),
    node_id                      TEXT NOT NULL REFERENCES nodes(node_id),
    sequence_number              INTEGER NOT NULL,
    created_at                   TEXT NOT NULL,
    upstream_topology_hash       TEXT NOT NULL,
    checkpoint_node_config_hash  TEXT NOT NULL,
    aggregation_state_json       TEXT,
    UNIQUE (run_id, sequence_number)
);
CREATE INDEX idx_checkpoints_run ON checkpoints(run_id);

CREATE TABLE validation_errors (
    error_id      TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    node_id       TEXT NOT NULL REFERENCES nodes(node_id) ON DELETE RESTRICT,
    token_id      TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    field         TEXT,
    message       TEXT NOT NULL,
    details_json  TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX idx_validation_errors_run ON validation_errors(run_id);

CREATE TABLE transform_errors (
    error_id      TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    node_id       TEXT NOT NULL REFERENCES nodes(node_id) ON DELETE RESTRICT,
    token_id      TEXT NOT NULL REFERENCES tokens(token_id) ON DELETE RESTRICT,
    message       TEXT NOT NULL,
    details_json  TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX idx_transform_errors_run ON transform_errors(run_id);
";

/// Tables this crate expects to exist, each with the columns it considers
/// load-bearing (the ones every recorder/reader statement names directly)
/// and whether that column is declared `NOT NULL`.
const EXPECTED_SCHEMA: &[(&str, &[(&str, bool)])] = &[
    ("runs", &[("run_id", true), ("status", true)]),
    ("nodes", &[("node_id", true), ("run_id", true), ("node_type", true)]),
    ("edges", &[("edge_id", true), ("from_node_id", true), ("to_node_id", true)]),
    ("rows", &[("row_id", true), ("run_id", true), ("row_index", true)]),
    ("tokens", &[("token_id", true), ("row_id", true)]),
    ("token_parents", &[("token_id", true), ("parent_token_id", true)]),
    ("node_states", &[("state_id", true), ("token_id", true), ("node_id", true), ("status", true)]),
    ("routing_events", &[("event_id", true), ("state_id", true)]),
    ("calls", &[("call_id", true), ("state_id", true)]),
    ("artifacts", &[("artifact_id", true), ("run_id", true)]),
    ("batches", &[("batch_id", true), ("node_id", true)]),
    ("batch_members", &[("batch_id", true), ("token_id", true)]),
    ("batch_outputs", &[("batch_id", true), ("output_token_id", true)]),
    ("token_outcomes", &[("outcome_id", true), ("token_id", true), ("is_terminal", true)]),
    ("checkpoints", &[("checkpoint_id", true), ("run_id", true), ("sequence_number", true)]),
    ("validation_errors", &[("error_id", true), ("node_id", true), ("token_id", true)]),
    ("transform_errors", &[("error_id", true), ("node_id", true), ("token_id", true)]),
];

/// Opens (or creates) the schema in `conn`, verifying compatibility against
/// an existing database rather than trusting it blindly.
///
/// # Errors
/// Returns [`StoreError::SchemaCompatibility`] if an existing database is
/// missing a table or a load-bearing column, or declares it nullable when
/// this crate requires it `NOT NULL`. Returns [`StoreError::Db`] if a
/// statement fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let has_meta: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'store_meta'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)?;

    if !has_meta {
        let tx = conn.transaction()?;
        tx.execute_batch(DDL)?;
        tx.execute(
            "INSERT INTO store_meta (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;
        return Ok(());
    }

    check_compatibility(conn)
}

/// Verifies every expected table and load-bearing column is present with
/// the expected nullability.
fn check_compatibility(conn: &Connection) -> Result<(), StoreError> {
    for (table, columns) in EXPECTED_SCHEMA {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let mut found = std::collections::HashMap::new();
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(1)?;
            let notnull: i64 = row.get(3)?;
            Ok((name, notnull != 0))
        })?;
        for row in rows {
            let (name, notnull) = row?;
            found.insert(name, notnull);
        }
        if found.is_empty() {
            return Err(StoreError::SchemaCompatibility(format!(
                "expected table `{table}` is missing"
            )));
        }
        for (column, required_not_null) in *columns {
            match found.get(*column) {
                None => {
                    return Err(StoreError::SchemaCompatibility(format!(
                        "table `{table}` is missing expected column `{column}`"
                    )));
                }
                Some(notnull) if *required_not_null && !notnull => {
                    return Err(StoreError::SchemaCompatibility(format!(
                        "table `{table}` column `{column}` must be NOT NULL"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
