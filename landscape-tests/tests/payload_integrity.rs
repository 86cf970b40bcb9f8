// landscape-tests/tests/payload_integrity.rs
// ============================================================================
// Module: Payload Integrity Suite
// Description: End-to-end integrity checking of a run's stored source data,
//              through a real filesystem-backed payload store.
// Purpose: Confirm that a source row's bytes are retrievable by the hash
//          recorded against it in the audit trail, and that tampering with
//          the blob on disk is caught on the next read rather than silently
//          served.
// Dependencies: landscape-core, landscape-payload, landscape-store-sqlite
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod helpers;

use std::fs;

use landscape_core::ExecutionGraph;
use landscape_core::NodePlugin;
use landscape_core::Orchestrator;
use landscape_core::PayloadStore;
use landscape_core::PayloadStoreError;
use landscape_core::RunId;
use landscape_core::interfaces::ArtifactDescriptor;
use landscape_core::interfaces::PluginContext;
use landscape_core::interfaces::PluginError;
use landscape_core::interfaces::Sink;
use landscape_core::interfaces::Source;
use landscape_core::interfaces::SourceRow;
use landscape_core::model::ids::NodeId;
use landscape_expr::Evaluator;
use landscape_payload::FilesystemPayloadStore;
use serde_json::Value;
use serde_json::json;

struct StaticSource {
    rows: Vec<Value>,
}

impl Source for StaticSource {
    fn output_schema(&self) -> Value {
        json!({})
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError> {
        Ok(std::mem::take(&mut self.rows).into_iter().map(SourceRow::Valid).collect())
    }
}

#[derive(Default)]
struct RecordingSink;

impl Sink for RecordingSink {
    fn input_schema(&self) -> Value {
        json!({})
    }

    fn write(&mut self, row: &Value, _ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        Ok(ArtifactDescriptor {
            artifact_type: "application/json".to_string(),
            content_hash: landscape_core::stable_hash(row).unwrap_or_default(),
            path_or_uri: "memory://sink/0".to_string(),
            size_bytes: None,
            metadata_json: None,
        })
    }
}

/// Runs a one-source-one-sink pipeline against a real filesystem payload
/// store and returns the store's root directory, the audit store, and the
/// run id, so tests can inspect what actually landed on disk.
fn run_pipeline_with_filesystem_payloads(
    payload_root: &std::path::Path,
) -> (tempfile::TempDir, landscape_store_sqlite::LandscapeStore, RunId) {
    let (dir, mut store) = helpers::open_store();
    let payload_store = FilesystemPayloadStore::open(payload_root).expect("open payload store");
    let evaluator = Evaluator;

    let graph_spec = helpers::graph(
        vec![helpers::source_node("source"), helpers::sink_node("sink")],
        vec![helpers::edge("source", "sink")],
    );
    let graph = ExecutionGraph::build(graph_spec).expect("build graph");

    let run_id = RunId::new("payload-integrity-run");
    let mut orchestrator = Orchestrator::new(&graph, &mut store, &payload_store, &evaluator, run_id.clone());
    orchestrator
        .register_plugin(
            NodeId::new("source"),
            NodePlugin::Source(Box::new(StaticSource { rows: vec![json!({"score": 1})] })),
        )
        .expect("register source");
    orchestrator
        .register_plugin(NodeId::new("sink"), NodePlugin::Sink(Box::new(RecordingSink)))
        .expect("register sink");

    orchestrator.run(json!({})).expect("run pipeline");
    (dir, store, run_id)
}

#[test]
fn a_source_row_is_retrievable_from_the_payload_store_by_its_recorded_hash() {
    let payload_dir = tempfile::tempdir().expect("create payload dir");
    let (_store_dir, store, run_id) = run_pipeline_with_filesystem_payloads(payload_dir.path());
    let payload_store = FilesystemPayloadStore::open(payload_dir.path()).expect("reopen payload store");

    let rows = store.get_rows(&run_id).expect("list rows");
    assert_eq!(rows.len(), 1);
    let source_data_ref = rows[0].source_data_ref.clone().expect("row has a stored payload reference");

    let bytes = payload_store.get(&source_data_ref).expect("read payload").expect("payload present");
    let value: Value = serde_json::from_slice(&bytes).expect("payload is the row's JSON");
    assert_eq!(value, json!({"score": 1}));
}

#[test]
fn tampering_with_a_stored_payload_is_caught_as_a_hash_mismatch_on_read() {
    let payload_dir = tempfile::tempdir().expect("create payload dir");
    let (_store_dir, store, run_id) = run_pipeline_with_filesystem_payloads(payload_dir.path());
    let payload_store = FilesystemPayloadStore::open(payload_dir.path()).expect("reopen payload store");

    let rows = store.get_rows(&run_id).expect("list rows");
    let source_data_ref = rows[0].source_data_ref.clone().expect("row has a stored payload reference");

    // Locate the blob the same way the store shards it and overwrite its
    // bytes directly on disk, simulating corruption or tampering outside
    // the store's own write path.
    let shard = &source_data_ref[..2];
    let blob_path = payload_dir.path().join(shard).join(&source_data_ref);
    fs::write(&blob_path, b"tampered bytes").expect("overwrite blob");

    let result = payload_store.get(&source_data_ref);
    assert!(
        matches!(result, Err(PayloadStoreError::HashMismatch { .. })),
        "a tampered payload must never be served as if it were intact"
    );
}
