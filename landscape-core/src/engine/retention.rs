// landscape-core/src/engine/retention.rs
// ============================================================================
// Module: Retention & Purge
// Description: Deletes payload-store blobs no longer referenced by a run's
//              working data, without touching the audit trail itself.
// Purpose: Let an operator reclaim storage for old runs while keeping every
//          row, token, decision, and outcome record intact forever — only
//          the raw payload bytes are reclaimable, never the audit trail.
// Dependencies: crate::engine, crate::model, thiserror
// ============================================================================

//! ## Overview
//! Purging is deliberately narrow: it deletes payload-store blobs, never
//! audit rows. A purged run's lineage, hashes, and decisions remain fully
//! queryable and explainable; only the ability to re-derive or re-display
//! the original raw bytes is lost, which is why a purge downgrades a run's
//! `reproducibility_grade` rather than leaving it untouched. Candidate hash
//! selection (which payloads are old enough, which runs are eligible) is
//! left to the caller — this module has no age or policy concept of its
//! own, so it never silently decides what counts as "old".

use thiserror::Error;

use crate::engine::AuditRecorder;
use crate::engine::PayloadStore;
use crate::engine::PayloadStoreError;
use crate::engine::RecorderError;
use crate::model::ids::RunId;

/// Errors raised while purging payloads.
#[derive(Debug, Error)]
pub enum RetentionError {
    /// The audit backend failed.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// The payload store failed.
    #[error(transparent)]
    Payload(#[from] PayloadStoreError),
}

/// What a purge actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeResult {
    /// Candidate hashes that were still referenced and were kept.
    pub retained_hashes: Vec<String>,
    /// Candidate hashes whose payload was deleted.
    pub deleted_hashes: Vec<String>,
}

impl PurgeResult {
    /// Number of payloads deleted.
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.deleted_hashes.len()
    }

    /// Number of candidate payloads kept because they are still referenced.
    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.retained_hashes.len()
    }
}

/// Deletes every hash in `candidate_hashes` that is not among `run_id`'s
/// currently-referenced payload hashes, then downgrades the run's
/// `reproducibility_grade` if anything was actually deleted.
///
/// A candidate hash still referenced by the run (or by any other run
/// sharing the same content-addressed blob) is retained rather than
/// deleted; content addressing means two runs can point at the same hash,
/// so this function only ever asks the recorder what `run_id` itself still
/// points to, not whether the blob is globally orphaned.
///
/// # Errors
///
/// Returns [`RetentionError`] if the audit backend read/write or the
/// payload delete fails.
pub fn purge_payloads<R, P>(
    recorder: &mut R,
    payload_store: &P,
    run_id: &RunId,
    candidate_hashes: &[String],
) -> Result<PurgeResult, RetentionError>
where
    R: AuditRecorder,
    P: PayloadStore,
{
    let referenced = recorder.referenced_payload_hashes(run_id)?;
    let mut retained_hashes = Vec::new();
    let mut deleted_hashes = Vec::new();

    for hash in candidate_hashes {
        if referenced.iter().any(|r| r == hash) {
            retained_hashes.push(hash.clone());
            continue;
        }
        payload_store.delete(hash)?;
        deleted_hashes.push(hash.clone());
    }

    if !deleted_hashes.is_empty() {
        recorder.update_reproducibility_grade(run_id, Some("degraded".to_string()))?;
    }

    Ok(PurgeResult {
        retained_hashes,
        deleted_hashes,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use super::*;
    use crate::engine::orchestrator::tests::InMemoryPayloadStore;
    use crate::engine::orchestrator::tests::InMemoryRecorder;

    #[test]
    fn purge_deletes_only_unreferenced_candidates() {
        let mut recorder = InMemoryRecorder::default();
        let payload_store = InMemoryPayloadStore::default();
        let run_id = RunId::new("run-1");

        let kept_hash = payload_store.put(b"still referenced").unwrap();
        let deletable_hash = payload_store.put(b"orphaned").unwrap();
        recorder.set_referenced_payload_hashes(&run_id, vec![kept_hash.clone()]);

        let result = purge_payloads(
            &mut recorder,
            &payload_store,
            &run_id,
            &[kept_hash.clone(), deletable_hash.clone()],
        )
        .unwrap();

        assert_eq!(result.retained_hashes, vec![kept_hash.clone()]);
        assert_eq!(result.deleted_hashes, vec![deletable_hash.clone()]);
        assert!(payload_store.get(&kept_hash).unwrap().is_some());
        assert!(payload_store.get(&deletable_hash).unwrap().is_none());
    }
}
