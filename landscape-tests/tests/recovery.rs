// landscape-tests/tests/recovery.rs
// ============================================================================
// Module: Checkpoint & Recovery Suite
// Description: Resume-after-failure and topology-mismatch scenarios against
//              a real SQLite audit trail.
// Purpose: Confirm that unprocessed rows are correctly identified after a
//          simulated crash, and that a checkpoint refuses to resume once the
//          upstream graph it was taken against has changed shape.
// Dependencies: landscape-core, landscape-store-sqlite
// ============================================================================

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod helpers;

use landscape_core::AuditRecorder;
use landscape_core::ExecutionGraph;
use landscape_core::IdSequence;
use landscape_core::RowId;
use landscape_core::RunId;
use landscape_core::TokenOutcomeKind;
use landscape_core::check_resume;
use landscape_core::create_checkpoint;
use landscape_core::initial_token_id;
use landscape_core::model::entities::Row;
use landscape_core::model::entities::Token;
use landscape_core::model::entities::TokenOutcome;
use landscape_core::model::ids::NodeId;
use landscape_core::model::ids::OutcomeId;
use landscape_core::unprocessed_rows;
use time::OffsetDateTime;

fn insert_row(store: &mut landscape_store_sqlite::LandscapeStore, run_id: &RunId, index: u64) -> Row {
    let row = Row {
        row_id: RowId::new(format!("row-{index}")),
        run_id: run_id.clone(),
        source_node_id: NodeId::new("source"),
        row_index: index,
        source_data_hash: format!("hash-{index}"),
        source_data_ref: None,
        created_at: OffsetDateTime::now_utc(),
    };
    store.insert_row(&row).expect("insert row");
    let token = Token {
        token_id: initial_token_id(&row.row_id),
        row_id: row.row_id.clone(),
        branch_name: None,
        fork_group_id: None,
        join_group_id: None,
        expand_group_id: None,
        created_at: OffsetDateTime::now_utc(),
    };
    store.insert_token(&token).expect("insert token");
    row
}

fn complete_token(store: &mut landscape_store_sqlite::LandscapeStore, ids: &mut IdSequence, run_id: &RunId, row: &Row) {
    let outcome = TokenOutcome {
        outcome_id: OutcomeId::new(ids.next("outcome")),
        run_id: run_id.clone(),
        token_id: initial_token_id(&row.row_id),
        outcome: TokenOutcomeKind::Completed,
        is_terminal: true,
        sink_name: None,
        batch_id: None,
        fork_group_id: None,
        error_hash: None,
        context_json: None,
        recorded_at: OffsetDateTime::now_utc(),
    };
    store.insert_token_outcome(&outcome).expect("insert outcome");
}

#[test]
fn rows_without_a_terminal_outcome_survive_a_simulated_crash_and_resume() {
    let (_dir, mut store) = helpers::open_store();
    let run_id = RunId::new("resume-run");
    let mut ids = IdSequence::new(run_id.clone());

    let graph_spec = helpers::graph(
        vec![helpers::source_node("source"), helpers::sink_node("sink")],
        vec![helpers::edge("source", "sink")],
    );
    let graph = ExecutionGraph::build(graph_spec).expect("build graph");

    let row_done = insert_row(&mut store, &run_id, 0);
    let row_pending = insert_row(&mut store, &run_id, 1);
    complete_token(&mut store, &mut ids, &run_id, &row_done);

    let pending = unprocessed_rows(&store, &run_id).expect("compute unprocessed rows");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].row_id, row_pending.row_id);

    let checkpoint = create_checkpoint(
        &mut store,
        &mut ids,
        &graph,
        &run_id,
        &initial_token_id(&row_pending.row_id),
        &NodeId::new("sink"),
        row_pending.row_index,
        None,
    )
    .expect("create checkpoint");
    assert_eq!(checkpoint.node_id, NodeId::new("sink"));

    let resume = check_resume(&store, &graph, &run_id).expect("check resume");
    assert!(resume.can_resume, "resume should be allowed against an unchanged graph");
    assert!(resume.reason.is_none());
}

#[test]
fn a_checkpoint_refuses_to_resume_once_upstream_topology_has_changed() {
    let (_dir, mut store) = helpers::open_store();
    let run_id = RunId::new("topology-change-run");
    let mut ids = IdSequence::new(run_id.clone());

    let original_graph = ExecutionGraph::build(helpers::graph(
        vec![helpers::source_node("source"), helpers::sink_node("sink")],
        vec![helpers::edge("source", "sink")],
    ))
    .expect("build original graph");

    let row = insert_row(&mut store, &run_id, 0);
    create_checkpoint(
        &mut store,
        &mut ids,
        &original_graph,
        &run_id,
        &initial_token_id(&row.row_id),
        &NodeId::new("sink"),
        row.row_index,
        None,
    )
    .expect("create checkpoint");

    // A new upstream transform is spliced in between source and sink: the
    // sink's upstream topology hash changes even though the sink node
    // itself is untouched.
    let changed_graph = ExecutionGraph::build(helpers::graph(
        vec![
            helpers::source_node("source"),
            helpers::transform_node("extra_transform"),
            helpers::sink_node("sink"),
        ],
        vec![
            helpers::edge("source", "extra_transform"),
            helpers::edge("extra_transform", "sink"),
        ],
    ))
    .expect("build changed graph");

    let resume = check_resume(&store, &changed_graph, &run_id).expect("check resume");
    assert!(!resume.can_resume);
    assert!(resume.reason.expect("reason given").contains("topology"));
}
