// landscape-tests/tests/helpers/mod.rs
// ============================================================================
// Module: System Test Helpers
// Description: Shared fixtures for Landscape system-tests.
// Purpose: Build small execution graphs and an on-disk store once per test
//          so each suite can focus on the behavior it actually exercises.
// Dependencies: landscape-core, landscape-store-sqlite, tempfile
// ============================================================================

#![allow(dead_code, reason = "Shared helpers are reused across multiple test suites.")]

use std::collections::BTreeMap;

use landscape_core::Determinism;
use landscape_core::EdgeMode;
use landscape_core::PluginName;
use landscape_core::RouteLabel;
use landscape_core::graph::EdgeSpec;
use landscape_core::graph::GraphSpec;
use landscape_core::graph::NodeSpec;
use landscape_core::graph::config::GateCondition;
use landscape_core::graph::config::GateNodeConfig;
use landscape_core::graph::config::NodeConfig;
use landscape_core::graph::config::SinkNodeConfig;
use landscape_core::graph::config::SourceNodeConfig;
use landscape_core::graph::config::TransformNodeConfig;
use landscape_core::model::entities::NodeKind;
use landscape_core::model::ids::NodeId;
use landscape_store_sqlite::LandscapeStore;
use landscape_store_sqlite::StoreConfig;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

/// Opens a fresh `LandscapeStore` in a temp directory, returning the guard
/// alongside it so the directory outlives the store.
pub fn open_store() -> (TempDir, LandscapeStore) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = LandscapeStore::open(StoreConfig::new(dir.path().join("audit.db")))
        .expect("open landscape store");
    (dir, store)
}

/// A source node with no validation: every input row passes through
/// unchanged as `SourceRow::Valid`.
pub fn source_node(node_id: &str) -> NodeSpec {
    NodeSpec {
        node_id: NodeId::new(node_id),
        plugin_name: PluginName::new(node_id),
        plugin_version: "1.0.0".to_string(),
        node_type: NodeKind::Source,
        determinism: Determinism::Guaranteed,
        config: NodeConfig::Source(SourceNodeConfig { plugin_config: json!({}) }),
    }
}

/// A pass-through transform node.
pub fn transform_node(node_id: &str) -> NodeSpec {
    NodeSpec {
        node_id: NodeId::new(node_id),
        plugin_name: PluginName::new(node_id),
        plugin_version: "1.0.0".to_string(),
        node_type: NodeKind::Transform,
        determinism: Determinism::Guaranteed,
        config: NodeConfig::Transform(TransformNodeConfig {
            plugin_config: json!({}),
            schema: json!({}),
            required_input_fields: None,
            on_error: None,
        }),
    }
}

/// A sink node.
pub fn sink_node(node_id: &str) -> NodeSpec {
    NodeSpec {
        node_id: NodeId::new(node_id),
        plugin_name: PluginName::new(node_id),
        plugin_version: "1.0.0".to_string(),
        node_type: NodeKind::Sink,
        determinism: Determinism::Guaranteed,
        config: NodeConfig::Sink(SinkNodeConfig { plugin_config: json!({}) }),
    }
}

/// A condition-driven gate node routing `route_label -> target_node` pairs,
/// optionally forking on the labels in `fork_to`.
pub fn gate_node(node_id: &str, expression: &str, routes: &[(&str, &str)], fork_to: &[&str]) -> NodeSpec {
    let mut route_map = BTreeMap::new();
    for (label, target) in routes {
        route_map.insert(RouteLabel::new(*label), NodeId::new(*target));
    }
    let fork_to = if fork_to.is_empty() {
        None
    } else {
        Some(fork_to.iter().map(|label| RouteLabel::new(*label)).collect())
    };
    NodeSpec {
        node_id: NodeId::new(node_id),
        plugin_name: PluginName::new(node_id),
        plugin_version: "1.0.0".to_string(),
        node_type: NodeKind::Gate,
        determinism: Determinism::Guaranteed,
        config: NodeConfig::Gate(GateNodeConfig {
            routes: route_map,
            schema: json!({}),
            condition: Some(GateCondition::Expression { expression: expression.to_string() }),
            fork_to,
        }),
    }
}

/// A `default`-labeled move edge between two nodes.
pub fn edge(from: &str, to: &str) -> EdgeSpec {
    labeled_edge(from, to, "default")
}

/// An edge with an explicit route label.
pub fn labeled_edge(from: &str, to: &str, label: &str) -> EdgeSpec {
    EdgeSpec {
        from_node_id: NodeId::new(from),
        to_node_id: NodeId::new(to),
        label: RouteLabel::new(label),
        default_mode: EdgeMode::Move,
    }
}

/// Builds a `GraphSpec` from a flat node/edge list, for suites that do not
/// need the per-kind builder functions above.
pub fn graph(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>) -> GraphSpec {
    GraphSpec { nodes, edges }
}

/// A row value with a `score` field, used by the gate-routing scenario.
pub fn scored_row(score: i64) -> Value {
    json!({"score": score})
}
