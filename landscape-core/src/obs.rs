// landscape-core/src/obs.rs
// ============================================================================
// Module: Observability
// Description: Structured logging setup and span helpers for runs, nodes,
//              and plugin calls.
// Purpose: Give the orchestrator a single, consistent way to emit
//          structured, queryable log output alongside the durable audit
//          trail. Logs are a debugging aid; the audit trail in
//          `landscape-store-sqlite` is the system of record.
// Dependencies: tracing, tracing-subscriber
// ============================================================================

//! ## Overview
//! The audit trail already records what happened; `tracing` spans here
//! exist so an operator can watch a run live and so failures surface in
//! whatever log aggregator ingests this process's output. Every span
//! carries the identifiers an operator would grep for: `run_id`, `node_id`,
//! `token_id`.

use tracing::Level;
use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

use crate::model::ids::NodeId;
use crate::model::ids::RunId;
use crate::model::ids::TokenId;

/// Installs a global `tracing` subscriber that writes structured,
/// level-filtered output to stderr.
///
/// `default_level` is used when the `RUST_LOG` environment variable is
/// unset. Call this once, near process start; calling it twice is harmless
/// but the second call's subscriber is silently ignored by `tracing`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    // A second call from within the same process (e.g. in tests that each
    // construct an Orchestrator) is expected and not an error condition.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Opens a span for an entire run.
#[must_use]
pub fn run_span(run_id: &RunId) -> Span {
    tracing::span!(Level::INFO, "run", run_id = %run_id)
}

/// Opens a span for a single node's processing of one token.
#[must_use]
pub fn node_span(run_id: &RunId, node_id: &NodeId, token_id: &TokenId) -> Span {
    tracing::span!(
        Level::DEBUG,
        "node_state",
        run_id = %run_id,
        node_id = %node_id,
        token_id = %token_id,
    )
}

/// Opens a span for a single external call recorded against a node state.
#[must_use]
pub fn call_span(node_id: &NodeId, call_type: &str) -> Span {
    tracing::span!(Level::DEBUG, "call", node_id = %node_id, call_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_helpers_do_not_panic() {
        let run_id = RunId::new("run-1");
        let node_id = NodeId::new("node-1");
        let token_id = TokenId::new("token-1");
        let _ = run_span(&run_id);
        let _ = node_span(&run_id, &node_id, &token_id);
        let _ = call_span(&node_id, "http");
    }
}
