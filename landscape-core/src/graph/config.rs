// landscape-core/src/graph/config.rs
// ============================================================================
// Module: Node Configuration
// Description: The six frozen node-config variants and their projection to
//              a hashable mapping.
// Purpose: Give every node kind a typed, immutable configuration and a
//          single definition of how that configuration hashes.
// Dependencies: crate::model::hashing, serde, serde_json
// ============================================================================

//! ## Overview
//! `NodeConfig` is a tagged union, not a base class with subclasses — the
//! six variants below are exhaustively matched everywhere a config is read.
//! `config_to_dict` projects a config to a JSON mapping with every `None`
//! field dropped entirely; an absent field is "not applicable", not "empty",
//! and the distinction matters because it feeds directly into
//! [`crate::model::hashing::stable_hash`] and therefore into topology
//! hashing and checkpoint compatibility.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::model::hashing::CanonicalizationError;
use crate::model::hashing::canonicalize_to_value;
use crate::model::ids::BranchName;
use crate::model::ids::NodeId;
use crate::model::ids::RouteLabel;

/// A gate's condition: either a whitelisted boolean expression evaluated by
/// `landscape-expr`, or delegation to a `Gate` plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateCondition {
    /// A parsed, whitelisted boolean expression over `row[...]`.
    Expression {
        /// The expression source text.
        expression: String,
    },
    /// A plugin-supplied routing decision.
    Plugin {
        /// Opaque, plugin-owned configuration.
        plugin_config: Value,
    },
}

/// How an aggregation decides when to emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationTrigger {
    /// Emit once `count` rows have been buffered.
    RowCount {
        /// Number of rows required to trigger emission.
        count: u32,
    },
    /// Emit once `seconds` have elapsed since the batch opened.
    TimeWindow {
        /// Window length in seconds.
        seconds: u64,
    },
    /// Emit only when the source explicitly marks a batch boundary.
    ExplicitMarker,
}

/// Whether an aggregation emits one merged row or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Exactly one output row per batch.
    Single,
    /// Zero or more output rows per batch.
    Multiple,
}

/// How a coalesce decides it has enough input branches to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Wait for every declared branch.
    WaitAll,
    /// Proceed once `quorum_count` branches have arrived.
    Quorum,
    /// Proceed on the first branch to arrive; the rest are discarded.
    FirstWins,
}

/// Config for a source node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNodeConfig {
    /// Opaque, plugin-owned configuration.
    pub plugin_config: Value,
}

/// Config for a sink node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkNodeConfig {
    /// Opaque, plugin-owned configuration. Deliberately never merged with
    /// framework-typed fields — see `TransformNodeConfig::schema` for the
    /// contrasting, framework-owned case.
    pub plugin_config: Value,
}

/// Config for a transform node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformNodeConfig {
    /// Opaque, plugin-owned configuration.
    pub plugin_config: Value,
    /// Framework-owned output schema, propagated during the schema phase.
    pub schema: Value,
    /// Fields the transform requires on its input row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_input_fields: Option<Vec<String>>,
    /// Sink to route a row to on error, or `None` to discard it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
}

/// Config for a gate node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateNodeConfig {
    /// Map from route label to the downstream node it targets.
    pub routes: BTreeMap<RouteLabel, NodeId>,
    /// Framework-owned schema, inherited from upstream.
    pub schema: Value,
    /// The gate's condition, if condition-driven.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<GateCondition>,
    /// Route labels that cause a fork rather than a move, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_to: Option<Vec<RouteLabel>>,
}

/// Config for an aggregation (batch-aware transform) node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationNodeConfig {
    /// What causes the buffered batch to emit.
    pub trigger: AggregationTrigger,
    /// Whether emission produces one row or many.
    pub output_mode: OutputMode,
    /// Plugin-owned tuning knobs that are not first-class framework fields.
    pub options: Value,
    /// Framework-owned output schema.
    pub schema: Value,
    /// Fields required on every input row. First-class: never looked up
    /// inside `options` as a fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_input_fields: Option<Vec<String>>,
}

/// Config for a coalesce node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceNodeConfig {
    /// The upstream branches this coalesce waits on.
    pub branches: Vec<BranchName>,
    /// How many arrived branches are required before merging.
    pub policy: CoalescePolicy,
    /// Plugin-owned merge-strategy configuration.
    pub merge: Value,
    /// Framework-owned output schema; must equal every branch's upstream
    /// schema.
    pub schema: Value,
    /// Deadline for waiting on branches, if the policy can time out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Required arrival count under `CoalescePolicy::Quorum`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum_count: Option<u32>,
    /// The branch actually selected under `CoalescePolicy::FirstWins`, once
    /// resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select_branch: Option<BranchName>,
}

/// A node's frozen, typed configuration. Exactly one of six variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Source node config.
    Source(SourceNodeConfig),
    /// Sink node config.
    Sink(SinkNodeConfig),
    /// Transform node config.
    Transform(TransformNodeConfig),
    /// Gate node config.
    Gate(GateNodeConfig),
    /// Aggregation node config.
    Aggregation(AggregationNodeConfig),
    /// Coalesce node config.
    Coalesce(CoalesceNodeConfig),
}

/// Projects a node config to a canonical JSON mapping with every `None`
/// field omitted, ready to feed into `stable_hash`.
///
/// # Errors
///
/// Returns [`CanonicalizationError`] if the config cannot be canonicalized
/// (practically unreachable for a well-formed `NodeConfig`, since every
/// field is already JSON-representable).
pub fn config_to_dict(config: &NodeConfig) -> Result<Value, CanonicalizationError> {
    canonicalize_to_value(config)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use super::*;
    use serde_json::json;

    #[test]
    fn omits_none_fields() {
        let config = NodeConfig::Transform(TransformNodeConfig {
            plugin_config: json!({}),
            schema: json!({"fields": []}),
            required_input_fields: None,
            on_error: None,
        });
        let dict = config_to_dict(&config).unwrap();
        assert!(dict.get("required_input_fields").is_none());
        assert!(dict.get("on_error").is_none());
    }

    #[test]
    fn includes_present_optional_fields() {
        let config = NodeConfig::Transform(TransformNodeConfig {
            plugin_config: json!({}),
            schema: json!({}),
            required_input_fields: Some(vec!["id".to_string()]),
            on_error: Some("quarantine_sink".to_string()),
        });
        let dict = config_to_dict(&config).unwrap();
        assert_eq!(dict["required_input_fields"], json!(["id"]));
        assert_eq!(dict["on_error"], json!("quarantine_sink"));
    }

    #[test]
    fn equal_configs_hash_equal_regardless_of_field_order_in_source() {
        let a = NodeConfig::Source(SourceNodeConfig {
            plugin_config: json!({"a": 1, "b": 2}),
        });
        let b = NodeConfig::Source(SourceNodeConfig {
            plugin_config: json!({"b": 2, "a": 1}),
        });
        let hash_a = crate::model::hashing::stable_hash(&config_to_dict(&a).unwrap()).unwrap();
        let hash_b = crate::model::hashing::stable_hash(&config_to_dict(&b).unwrap()).unwrap();
        assert_eq!(hash_a, hash_b);
    }
}
