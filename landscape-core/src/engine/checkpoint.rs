// landscape-core/src/engine/checkpoint.rs
// ============================================================================
// Module: Checkpoint & Recovery
// Description: Resumable-run checkpointing and compatibility checking.
// Purpose: Let a run that stopped (crash, cancellation, operator action)
//          resume from its last checkpoint instead of reprocessing from
//          scratch, while refusing to resume against a graph whose
//          upstream shape has changed underneath it.
// Dependencies: crate::engine, crate::graph, crate::model, thiserror
// ============================================================================

//! ## Overview
//! A checkpoint freezes three things at one token/node position: the
//! monotonic `sequence_number`, the `upstream_topology_hash` of everything
//! feeding that node, and the `stable_hash` of that node's own config.
//! Resume is additive: [`unprocessed_rows`] recomputes which rows still
//! lack a terminal outcome rather than trusting a stored cursor, so a
//! checkpoint is a fast path, not a correctness dependency.

use thiserror::Error;
use time::OffsetDateTime;

use crate::engine::AuditRecorder;
use crate::engine::IdSequence;
use crate::engine::RecorderError;
use crate::graph::ExecutionGraph;
use crate::graph::GraphError;
use crate::model::entities::Checkpoint;
use crate::model::entities::Row;
use crate::model::ids::NodeId;
use crate::model::ids::RunId;
use crate::model::ids::TokenId;
use serde_json::Value;

/// Errors raised while checkpointing or checking resumability.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The audit backend failed.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// The graph rejected a topology-hash lookup.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// The result of checking whether a run can resume from its latest
/// checkpoint.
#[derive(Debug, Clone)]
pub struct ResumeCheck {
    /// Whether resuming is safe.
    pub can_resume: bool,
    /// Why resuming was refused, if it was.
    pub reason: Option<String>,
    /// The checkpoint considered, if one existed.
    pub checkpoint: Option<Checkpoint>,
}

/// Records a new checkpoint at `node_id` for `token_id`.
///
/// # Errors
///
/// Returns [`CheckpointError`] if the node does not exist in `graph` or the
/// write fails.
#[allow(clippy::too_many_arguments, reason = "checkpoint identity has five independent fields")]
pub fn create_checkpoint<R: AuditRecorder>(
    recorder: &mut R,
    ids: &mut IdSequence,
    graph: &ExecutionGraph,
    run_id: &RunId,
    token_id: &TokenId,
    node_id: &NodeId,
    sequence_number: u64,
    aggregation_state_json: Option<Value>,
) -> Result<Checkpoint, CheckpointError> {
    let node = graph
        .node(node_id)
        .ok_or_else(|| GraphError::UnknownNode(node_id.clone()))?;
    let checkpoint = Checkpoint {
        checkpoint_id: ids.next("checkpoint").into(),
        run_id: run_id.clone(),
        token_id: token_id.clone(),
        node_id: node_id.clone(),
        sequence_number,
        created_at: OffsetDateTime::now_utc(),
        upstream_topology_hash: graph.upstream_topology_hash(node_id)?,
        checkpoint_node_config_hash: node.config_hash.clone(),
        aggregation_state_json,
    };
    recorder.insert_checkpoint(&checkpoint)?;
    Ok(checkpoint)
}

/// Checks whether `run_id` can resume from its latest checkpoint against
/// the current `graph`.
///
/// # Errors
///
/// Returns [`CheckpointError`] if the audit backend read fails.
pub fn check_resume<R: AuditRecorder>(
    recorder: &R,
    graph: &ExecutionGraph,
    run_id: &RunId,
) -> Result<ResumeCheck, CheckpointError> {
    let Some(checkpoint) = recorder.latest_checkpoint(run_id)? else {
        return Ok(ResumeCheck {
            can_resume: false,
            reason: Some("no checkpoint recorded for this run".to_string()),
            checkpoint: None,
        });
    };

    let Some(node) = graph.node(&checkpoint.node_id) else {
        return Ok(ResumeCheck {
            can_resume: false,
            reason: Some(format!(
                "checkpointed node {} no longer exists in this graph",
                checkpoint.node_id
            )),
            checkpoint: Some(checkpoint),
        });
    };

    let current_topology_hash = graph.upstream_topology_hash(&checkpoint.node_id)?;
    if current_topology_hash != checkpoint.upstream_topology_hash {
        return Ok(ResumeCheck {
            can_resume: false,
            reason: Some(
                "upstream topology has changed since this checkpoint was taken".to_string(),
            ),
            checkpoint: Some(checkpoint),
        });
    }

    if node.config_hash != checkpoint.checkpoint_node_config_hash {
        return Ok(ResumeCheck {
            can_resume: false,
            reason: Some(
                "the checkpointed node's own configuration has changed since this checkpoint was taken"
                    .to_string(),
            ),
            checkpoint: Some(checkpoint),
        });
    }

    Ok(ResumeCheck {
        can_resume: true,
        reason: None,
        checkpoint: Some(checkpoint),
    })
}

/// Returns every row in `run_id` whose initial token has not yet reached a
/// terminal outcome. Resume replays these rows from their source node
/// rather than trusting any single stored cursor.
///
/// # Errors
///
/// Returns [`CheckpointError`] if the audit backend read fails.
pub fn unprocessed_rows<R: AuditRecorder>(
    recorder: &R,
    run_id: &RunId,
) -> Result<Vec<Row>, CheckpointError> {
    let all_rows = recorder.rows_after(run_id, None)?;
    let mut pending = Vec::new();
    for row in all_rows {
        let token_id = crate::engine::orchestrator::initial_token_id(&row.row_id);
        if !recorder.has_terminal_outcome(&token_id)? {
            pending.push(row);
        }
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use super::*;

    #[test]
    fn resume_check_refuses_without_a_checkpoint() {
        use crate::engine::orchestrator::tests::InMemoryRecorder;
        use crate::graph::ExecutionGraph;
        use crate::graph::GraphSpec;

        let recorder = InMemoryRecorder::default();
        let graph = ExecutionGraph::build(GraphSpec::default()).unwrap();
        let result = check_resume(&recorder, &graph, &RunId::new("run-1")).unwrap();
        assert!(!result.can_resume);
    }
}
