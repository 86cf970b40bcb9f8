// landscape-core/src/lib.rs
// ============================================================================
// Module: Landscape Core
// Description: Data model, execution graph, plugin contracts, and
//              orchestrator for the Landscape audit pipeline engine.
// Purpose: Provide the execution and audit substrate shared by every
//          Landscape storage backend and plugin.
// Dependencies: serde, serde_json, serde_jcs, sha2, thiserror, tracing
// ============================================================================

//! ## Overview
//! Landscape runs a directed acyclic pipeline of sources, transforms, gates,
//! aggregations, coalesces, and sinks over rows, recording every
//! transformation, routing decision, external call, and sink write so that
//! any output row can be explained back to its originating input. This crate
//! defines the data model, the execution graph, the plugin contract traits,
//! and the orchestrator that drives a run; durable storage is implemented by
//! downstream crates (`landscape-store-sqlite`, `landscape-payload`) against
//! the traits defined here.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod engine;
pub mod graph;
pub mod interfaces;
pub mod model;
pub mod obs;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use model::entities::*;
pub use model::hashing::CANONICAL_VERSION;
pub use model::hashing::CanonicalizationError;
pub use model::hashing::canonical_json_bytes;
pub use model::hashing::hash_bytes;
pub use model::hashing::hash_canonical_json;
pub use model::hashing::stable_hash;
pub use model::ids::*;

pub use graph::ExecutionGraph;
pub use graph::GraphError;
pub use graph::NodeDefinition;
pub use graph::config::NodeConfig;
pub use graph::config::config_to_dict;

pub use engine::AuditRecorder;
pub use engine::ExprEvalError;
pub use engine::ExpressionEvaluator;
pub use engine::IdSequence;
pub use engine::PayloadStore;
pub use engine::PayloadStoreError;
pub use engine::RecorderError;
pub use engine::checkpoint::CheckpointError;
pub use engine::checkpoint::ResumeCheck;
pub use engine::checkpoint::check_resume;
pub use engine::checkpoint::create_checkpoint;
pub use engine::checkpoint::unprocessed_rows;
pub use engine::orchestrator::NodePlugin;
pub use engine::orchestrator::Orchestrator;
pub use engine::orchestrator::OrchestratorError;
pub use engine::orchestrator::initial_token_id;
pub use engine::retention::PurgeResult;
pub use engine::retention::RetentionError;
pub use engine::retention::purge_payloads;

pub use interfaces::ArtifactDescriptor;
pub use interfaces::Gate;
pub use interfaces::PluginContext;
pub use interfaces::PluginError;
pub use interfaces::Sink;
pub use interfaces::Source;
pub use interfaces::SourceRow;
pub use interfaces::Transform;
