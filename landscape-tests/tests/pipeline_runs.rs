// landscape-tests/tests/pipeline_runs.rs
// ============================================================================
// Module: Pipeline Run Suite
// Description: End-to-end orchestrator scenarios against a real SQLite
//              audit trail: gate routing and fork-with-expansion.
// Purpose: Exercise the orchestrator, the execution graph, and the
//          whitelisted expression evaluator together the way a real run
//          would, rather than against the in-memory test double the
//          orchestrator's own unit tests use.
// Dependencies: landscape-core, landscape-expr, landscape-store-sqlite
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod helpers;

use landscape_core::ExecutionGraph;
use landscape_core::NodePlugin;
use landscape_core::Orchestrator;
use landscape_core::RunId;
use landscape_core::TokenOutcomeKind;
use landscape_core::interfaces::ArtifactDescriptor;
use landscape_core::interfaces::PluginContext;
use landscape_core::interfaces::PluginError;
use landscape_core::interfaces::Sink;
use landscape_core::interfaces::Source;
use landscape_core::interfaces::SourceRow;
use landscape_core::model::ids::NodeId;
use landscape_expr::Evaluator;
use serde_json::Value;

struct StaticSource {
    rows: Vec<Value>,
}

impl Source for StaticSource {
    fn output_schema(&self) -> Value {
        serde_json::json!({})
    }

    fn load(&mut self, _ctx: &PluginContext) -> Result<Vec<SourceRow>, PluginError> {
        Ok(std::mem::take(&mut self.rows).into_iter().map(SourceRow::Valid).collect())
    }
}

#[derive(Default)]
struct RecordingSink {
    written: Vec<Value>,
}

impl Sink for RecordingSink {
    fn input_schema(&self) -> Value {
        serde_json::json!({})
    }

    fn write(&mut self, row: &Value, _ctx: &PluginContext) -> Result<ArtifactDescriptor, PluginError> {
        self.written.push(row.clone());
        Ok(ArtifactDescriptor {
            artifact_type: "application/json".to_string(),
            content_hash: landscape_core::stable_hash(row).unwrap_or_default(),
            path_or_uri: format!("memory://sink/{}", self.written.len()),
            size_bytes: None,
            metadata_json: None,
        })
    }
}

#[test]
fn gate_routing_sends_each_row_to_its_declared_sink_with_a_completed_outcome() {
    let (_dir, mut store) = helpers::open_store();
    let evaluator = Evaluator;

    let graph_spec = helpers::graph(
        vec![
            helpers::source_node("source"),
            helpers::gate_node(
                "gate",
                "row['score'] > 50",
                &[("true", "sink_high"), ("false", "sink_low")],
                &[],
            ),
            helpers::sink_node("sink_high"),
            helpers::sink_node("sink_low"),
        ],
        vec![
            helpers::edge("source", "gate"),
            helpers::labeled_edge("gate", "sink_high", "true"),
            helpers::labeled_edge("gate", "sink_low", "false"),
        ],
    );
    let graph = ExecutionGraph::build(graph_spec).expect("build graph");

    let run_id = RunId::new("gate-routing-run");
    let mut orchestrator = Orchestrator::new(&graph, &mut store, &helpers_payload_store(), &evaluator, run_id.clone());
    orchestrator
        .register_plugin(
            NodeId::new("source"),
            NodePlugin::Source(Box::new(StaticSource {
                rows: vec![helpers::scored_row(75), helpers::scored_row(25)],
            })),
        )
        .expect("register source");
    orchestrator
        .register_plugin(NodeId::new("sink_high"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_high");
    orchestrator
        .register_plugin(NodeId::new("sink_low"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_low");

    orchestrator.run(serde_json::json!({})).expect("run pipeline");

    let rows = store.get_rows(&run_id).expect("list rows");
    assert_eq!(rows.len(), 2, "two rows created, one per input");

    let artifacts = store.get_artifacts(&run_id).expect("list artifacts");
    assert_eq!(artifacts.len(), 2, "one artifact per sink write");

    let outcomes = store.get_token_outcomes(&run_id).expect("list outcomes");
    let completed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.is_terminal && o.outcome == TokenOutcomeKind::Completed)
        .collect();
    assert_eq!(completed.len(), 2, "both rows reach a terminal completed outcome");

    let routing_events = store.get_routing_events_for_run(&run_id).expect("list routing events");
    assert_eq!(routing_events.len(), 2);
    let mut labels: Vec<String> = routing_events.iter().map(|e| e.route_label.as_str().to_string()).collect();
    labels.sort();
    assert_eq!(labels, vec!["false".to_string(), "true".to_string()]);
}

#[test]
fn forking_a_gate_on_a_single_label_spawns_one_child_and_leaves_the_parent_non_terminal() {
    let (_dir, mut store) = helpers::open_store();
    let evaluator = Evaluator;

    let graph_spec = helpers::graph(
        vec![
            helpers::source_node("source"),
            helpers::gate_node(
                "gate",
                "row['score'] > 0",
                &[("true", "sink_stats"), ("false", "sink_classifier")],
                &["true"],
            ),
            helpers::sink_node("sink_stats"),
            helpers::sink_node("sink_classifier"),
        ],
        vec![
            helpers::edge("source", "gate"),
            helpers::labeled_edge("gate", "sink_stats", "true"),
            helpers::labeled_edge("gate", "sink_classifier", "false"),
        ],
    );
    let graph = ExecutionGraph::build(graph_spec).expect("build graph");

    let run_id = RunId::new("fork-run");
    let mut orchestrator = Orchestrator::new(&graph, &mut store, &helpers_payload_store(), &evaluator, run_id.clone());
    orchestrator
        .register_plugin(
            NodeId::new("source"),
            NodePlugin::Source(Box::new(StaticSource { rows: vec![helpers::scored_row(10)] })),
        )
        .expect("register source");
    orchestrator
        .register_plugin(NodeId::new("sink_stats"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_stats");
    orchestrator
        .register_plugin(NodeId::new("sink_classifier"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_classifier");

    orchestrator.run(serde_json::json!({})).expect("run pipeline");

    let tokens = store.get_tokens_for_run(&run_id).expect("list tokens");
    // One initial token plus one forked child: fork_to names only the
    // "true" route, so a single fork event spawns exactly one child.
    assert_eq!(tokens.len(), 2);

    let parents = store.get_token_parents_for_run(&run_id).expect("list token parents");
    assert_eq!(parents.len(), 1);
    assert_eq!(parents[0].ordinal, 0);

    let outcomes = store.get_token_outcomes(&run_id).expect("list outcomes");
    // The forking token is absorbed into its child, not terminated: only
    // the child reaches a terminal outcome.
    let terminal_count = outcomes.iter().filter(|o| o.is_terminal).count();
    assert_eq!(terminal_count, 1, "only the child token reaches a terminal outcome");
    let non_terminal_routed = outcomes
        .iter()
        .filter(|o| !o.is_terminal && o.outcome == TokenOutcomeKind::Routed)
        .count();
    assert_eq!(non_terminal_routed, 1, "the forking parent gets a non-terminal routed outcome");
}

#[test]
fn forking_a_gate_on_two_labels_spawns_one_child_per_label() {
    let (_dir, mut store) = helpers::open_store();
    let evaluator = Evaluator;

    let graph_spec = helpers::graph(
        vec![
            helpers::source_node("source"),
            helpers::gate_node(
                "gate",
                "row['score'] > 0",
                &[("true", "sink_stats"), ("false", "sink_classifier")],
                &["true", "false"],
            ),
            helpers::sink_node("sink_stats"),
            helpers::sink_node("sink_classifier"),
        ],
        vec![
            helpers::edge("source", "gate"),
            helpers::labeled_edge("gate", "sink_stats", "true"),
            helpers::labeled_edge("gate", "sink_classifier", "false"),
        ],
    );
    let graph = ExecutionGraph::build(graph_spec).expect("build graph");

    let run_id = RunId::new("fork-two-labels-run");
    let mut orchestrator = Orchestrator::new(&graph, &mut store, &helpers_payload_store(), &evaluator, run_id.clone());
    orchestrator
        .register_plugin(
            NodeId::new("source"),
            NodePlugin::Source(Box::new(StaticSource { rows: vec![helpers::scored_row(10)] })),
        )
        .expect("register source");
    orchestrator
        .register_plugin(NodeId::new("sink_stats"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_stats");
    orchestrator
        .register_plugin(NodeId::new("sink_classifier"), NodePlugin::Sink(Box::new(RecordingSink::default())))
        .expect("register sink_classifier");

    orchestrator.run(serde_json::json!({})).expect("run pipeline");

    let tokens = store.get_tokens_for_run(&run_id).expect("list tokens");
    // One initial token plus two forked children, one per fork_to label.
    assert_eq!(tokens.len(), 3, "the gate fans the single input token out to both routes");

    let mut parents = store.get_token_parents_for_run(&run_id).expect("list token parents");
    parents.sort_by_key(|p| p.ordinal);
    assert_eq!(parents.len(), 2, "one parent-link row per forked child");
    assert_eq!(parents[0].ordinal, 0);
    assert_eq!(parents[1].ordinal, 1);

    let outcomes = store.get_token_outcomes(&run_id).expect("list outcomes");
    let terminal_count = outcomes.iter().filter(|o| o.is_terminal).count();
    assert_eq!(terminal_count, 2, "both children reach a terminal outcome, the parent does not");

    let artifacts = store.get_artifacts(&run_id).expect("list artifacts");
    assert_eq!(artifacts.len(), 2, "each child reaches its own sink");
}

fn helpers_payload_store() -> impl landscape_core::PayloadStore {
    InMemoryPayloadStore::default()
}

#[derive(Default)]
struct InMemoryPayloadStore {
    blobs: std::cell::RefCell<std::collections::HashMap<String, Vec<u8>>>,
}

impl landscape_core::PayloadStore for InMemoryPayloadStore {
    fn put(&self, bytes: &[u8]) -> Result<String, landscape_core::PayloadStoreError> {
        let hash = landscape_core::hash_bytes(bytes);
        self.blobs.borrow_mut().insert(hash.clone(), bytes.to_vec());
        Ok(hash)
    }

    fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, landscape_core::PayloadStoreError> {
        Ok(self.blobs.borrow().get(hash).cloned())
    }

    fn exists(&self, hash: &str) -> Result<bool, landscape_core::PayloadStoreError> {
        Ok(self.blobs.borrow().contains_key(hash))
    }

    fn delete(&self, hash: &str) -> Result<(), landscape_core::PayloadStoreError> {
        self.blobs.borrow_mut().remove(hash);
        Ok(())
    }
}
