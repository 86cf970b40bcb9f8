// landscape-core/src/graph/mod.rs
// ============================================================================
// Module: Execution Graph
// Description: Typed, validated DAG construction and topology hashing.
// Purpose: Turn a declarative node/edge spec into an immutable, validated
//          `ExecutionGraph` the orchestrator can drive.
// Dependencies: crate::model, crate::graph::config, serde_json
// ============================================================================

//! ## Overview
//! Construction is single-phase from the caller's perspective
//! ([`ExecutionGraph::build`]), but internally runs the topology, schema,
//! construction, and edge phases the spec separates: node/edge shape is
//! validated first, schemas are checked (coalesce branches must agree),
//! nodes are assigned their frozen config and a topological
//! `sequence_in_pipeline`, and finally adjacency is indexed for traversal.
//! Once built, a graph's nodes and edges do not change; "mutating" a graph
//! means building a new one.

pub mod config;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use serde::Serialize;
use thiserror::Error;

use crate::model::entities::Determinism;
use crate::model::entities::EdgeMode;
use crate::model::entities::NodeKind;
use crate::model::hashing::CanonicalizationError;
use crate::model::hashing::stable_hash;
use crate::model::ids::NodeId;
use crate::model::ids::PluginName;
use crate::model::ids::RouteLabel;
use config::NodeConfig;
use config::config_to_dict;

/// Errors raised while building or validating an [`ExecutionGraph`].
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two nodes were declared with the same identifier.
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),
    /// An edge referenced a node id that was never declared.
    #[error("edge references unknown node {0}")]
    UnknownNode(NodeId),
    /// Two edges left the same node with the same route label.
    #[error("duplicate edge label {label} from node {from}")]
    DuplicateEdge {
        /// The node the duplicate edges leave from.
        from: NodeId,
        /// The label shared by the duplicate edges.
        label: RouteLabel,
    },
    /// The edge set contains a cycle.
    #[error("cycle detected involving node {0}")]
    Cycle(NodeId),
    /// A node cannot be reached from any source node.
    #[error("node {0} is unreachable from any source")]
    Unreachable(NodeId),
    /// A coalesce node's declared schema disagreed with one of its branches.
    #[error("coalesce node {node} has a schema mismatch on branch {branch}")]
    SchemaMismatch {
        /// The coalesce node.
        node: NodeId,
        /// The offending branch label.
        branch: String,
    },
    /// A coalesce node named a branch with no corresponding incoming edge.
    #[error("coalesce node {node} declares branch {branch} with no incoming edge")]
    MissingBranch {
        /// The coalesce node.
        node: NodeId,
        /// The branch label with no matching edge.
        branch: String,
    },
    /// A transform's `on_error` sink does not exist in the graph.
    #[error("node {node} declares on_error sink {sink:?} which is not a sink in this graph")]
    RouteValidation {
        /// The node declaring the bad reference.
        node: NodeId,
        /// The sink name that could not be found.
        sink: String,
    },
    /// Canonicalizing a node's config failed.
    #[error("canonicalization failed: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

/// A node as the caller describes it, before construction assigns it a
/// topological position.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Identifier for this node.
    pub node_id: NodeId,
    /// Name of the plugin implementing this node.
    pub plugin_name: PluginName,
    /// Version string of the plugin implementation.
    pub plugin_version: String,
    /// The kind of node.
    pub node_type: NodeKind,
    /// Declared reproducibility class.
    pub determinism: Determinism,
    /// The node's frozen configuration.
    pub config: NodeConfig,
}

/// An edge as the caller describes it.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    /// Upstream node.
    pub from_node_id: NodeId,
    /// Downstream node.
    pub to_node_id: NodeId,
    /// Route label; unique together with `from_node_id`.
    pub label: RouteLabel,
    /// Default traversal mode for this edge.
    pub default_mode: EdgeMode,
}

/// The declarative description an [`ExecutionGraph`] is built from.
#[derive(Debug, Clone, Default)]
pub struct GraphSpec {
    /// Every node in the graph.
    pub nodes: Vec<NodeSpec>,
    /// Every edge in the graph.
    pub edges: Vec<EdgeSpec>,
}

/// A node after construction: frozen config plus its assigned topological
/// position.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    /// Identifier for this node.
    pub node_id: NodeId,
    /// Name of the plugin implementing this node.
    pub plugin_name: PluginName,
    /// Version string of the plugin implementation.
    pub plugin_version: String,
    /// The kind of node.
    pub node_type: NodeKind,
    /// Declared reproducibility class.
    pub determinism: Determinism,
    /// The node's frozen configuration.
    pub config: NodeConfig,
    /// `stable_hash(config_to_dict(config))`, computed once at construction.
    pub config_hash: String,
    /// Position in topological order, assigned at construction time.
    pub sequence_in_pipeline: u32,
}

/// An edge after construction.
#[derive(Debug, Clone)]
pub struct EdgeDefinition {
    /// Deterministic identifier derived from `(from_node_id, label)`, since
    /// edges are identified by their position in the graph, not by an
    /// externally issued id.
    pub edge_id: String,
    /// Upstream node.
    pub from_node_id: NodeId,
    /// Downstream node.
    pub to_node_id: NodeId,
    /// Route label.
    pub label: RouteLabel,
    /// Default traversal mode for this edge.
    pub default_mode: EdgeMode,
}

/// A validated, topologically ordered pipeline graph. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: BTreeMap<NodeId, NodeDefinition>,
    topo_order: Vec<NodeId>,
    outgoing: HashMap<NodeId, Vec<EdgeDefinition>>,
    incoming: HashMap<NodeId, Vec<EdgeDefinition>>,
}

impl ExecutionGraph {
    /// Builds and validates a graph from a declarative spec.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] if the spec contains duplicate nodes,
    /// dangling edges, duplicate edge labels, a cycle, an unreachable node,
    /// a coalesce schema mismatch, or a dangling `on_error` reference.
    pub fn build(spec: GraphSpec) -> Result<Self, GraphError> {
        let nodes_by_id = index_nodes(&spec.nodes)?;
        validate_edges(&spec.edges, &nodes_by_id)?;
        let (topo_order, rank) = topological_sort(&spec.nodes, &spec.edges)?;
        check_reachability(&spec.nodes, &spec.edges, &nodes_by_id)?;

        let mut nodes = BTreeMap::new();
        for spec_node in &spec.nodes {
            let config_hash = stable_hash(&config_to_dict(&spec_node.config)?)?;
            let sequence_in_pipeline = *rank
                .get(&spec_node.node_id)
                .unwrap_or_else(|| unreachable_rank());
            nodes.insert(
                spec_node.node_id.clone(),
                NodeDefinition {
                    node_id: spec_node.node_id.clone(),
                    plugin_name: spec_node.plugin_name.clone(),
                    plugin_version: spec_node.plugin_version.clone(),
                    node_type: spec_node.node_type,
                    determinism: spec_node.determinism,
                    config: spec_node.config.clone(),
                    config_hash,
                    sequence_in_pipeline,
                },
            );
        }

        let mut outgoing: HashMap<NodeId, Vec<EdgeDefinition>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<EdgeDefinition>> = HashMap::new();
        for edge in &spec.edges {
            let definition = EdgeDefinition {
                edge_id: format!("{}:{}", edge.from_node_id, edge.label),
                from_node_id: edge.from_node_id.clone(),
                to_node_id: edge.to_node_id.clone(),
                label: edge.label.clone(),
                default_mode: edge.default_mode,
            };
            outgoing
                .entry(edge.from_node_id.clone())
                .or_default()
                .push(definition.clone());
            incoming
                .entry(edge.to_node_id.clone())
                .or_default()
                .push(definition);
        }

        let graph = Self {
            nodes,
            topo_order,
            outgoing,
            incoming,
        };
        validate_coalesce_schemas(&graph)?;
        graph.validate_error_sink_references()?;
        Ok(graph)
    }

    /// Returns a node's definition, if it exists in this graph.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.get(node_id)
    }

    /// Returns every node, in topological order.
    #[must_use]
    pub fn nodes_in_topological_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    /// Returns the edges leaving a node.
    #[must_use]
    pub fn outgoing_edges(&self, node_id: &NodeId) -> &[EdgeDefinition] {
        self.outgoing.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Returns the edges entering a node.
    #[must_use]
    pub fn incoming_edges(&self, node_id: &NodeId) -> &[EdgeDefinition] {
        self.incoming.get(node_id).map_or(&[], Vec::as_slice)
    }

    /// Validates that every transform's `on_error` sink exists in the
    /// graph. Run once as part of [`ExecutionGraph::build`] and again,
    /// explicitly, by the orchestrator before it reads any source row.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::RouteValidation`] if a referenced sink does
    /// not exist.
    pub fn validate_error_sink_references(&self) -> Result<(), GraphError> {
        let sink_names: HashSet<&str> = self
            .nodes
            .values()
            .filter(|node| node.node_type == NodeKind::Sink)
            .map(|node| node.plugin_name.as_str())
            .collect();
        for node in self.nodes.values() {
            if let NodeConfig::Transform(transform) = &node.config {
                if let Some(on_error) = &transform.on_error {
                    if on_error != "discard" && !sink_names.contains(on_error.as_str()) {
                        return Err(GraphError::RouteValidation {
                            node: node.node_id.clone(),
                            sink: on_error.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Computes `stable_hash` of a canonical projection of `node_id` and
    /// every one of its ancestors: each ancestor's `config_to_dict`, the
    /// edges among them, and their identifiers normalized to topological
    /// rank rather than their (arbitrary) generated ids. This is the
    /// identity used for checkpoint compatibility: two graphs with the same
    /// upstream shape hash equal even if node ids were regenerated between
    /// runs.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] if `node_id` is not in this graph, or if
    /// canonicalizing the projection fails.
    pub fn upstream_topology_hash(&self, node_id: &NodeId) -> Result<String, GraphError> {
        let target = self
            .node(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.clone()))?;
        let ancestors = self.ancestor_closure(node_id);

        #[derive(Serialize)]
        struct ProjectedNode {
            rank: u32,
            node_type: NodeKind,
            config: serde_json::Value,
        }
        #[derive(Serialize)]
        struct ProjectedEdge {
            from_rank: u32,
            to_rank: u32,
            label: String,
            mode: EdgeMode,
        }
        #[derive(Serialize)]
        struct Projection {
            nodes: Vec<ProjectedNode>,
            edges: Vec<ProjectedEdge>,
        }

        let mut projected_nodes = Vec::with_capacity(ancestors.len() + 1);
        for id in ancestors.iter().chain(std::iter::once(node_id)) {
            let Some(node) = self.node(id) else {
                continue;
            };
            projected_nodes.push(ProjectedNode {
                rank: node.sequence_in_pipeline,
                node_type: node.node_type,
                config: config_to_dict(&node.config)?,
            });
        }
        projected_nodes.sort_by_key(|n| n.rank);

        let mut projected_edges = Vec::new();
        for id in ancestors.iter().chain(std::iter::once(node_id)) {
            for edge in self.outgoing_edges(id) {
                if ancestors.contains(&edge.to_node_id) || &edge.to_node_id == node_id {
                    let Some(from) = self.node(&edge.from_node_id) else {
                        continue;
                    };
                    let Some(to) = self.node(&edge.to_node_id) else {
                        continue;
                    };
                    projected_edges.push(ProjectedEdge {
                        from_rank: from.sequence_in_pipeline,
                        to_rank: to.sequence_in_pipeline,
                        label: edge.label.as_str().to_owned(),
                        mode: edge.default_mode,
                    });
                }
            }
        }
        projected_edges.sort_by_key(|e| (e.from_rank, e.to_rank, e.label.clone()));

        let _ = target;
        let projection = Projection {
            nodes: projected_nodes,
            edges: projected_edges,
        };
        Ok(stable_hash(&projection)?)
    }

    /// Returns the set of node ids from which `node_id` is reachable.
    fn ancestor_closure(&self, node_id: &NodeId) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(node_id.clone());
        while let Some(current) = queue.pop_front() {
            for edge in self.incoming_edges(&current) {
                if visited.insert(edge.from_node_id.clone()) {
                    queue.push_back(edge.from_node_id.clone());
                }
            }
        }
        visited
    }
}

/// `rank` lookup fallback; unreachable nodes are already rejected by
/// [`check_reachability`] before this is ever consulted.
fn unreachable_rank() -> &'static u32 {
    &u32::MAX
}

fn index_nodes(nodes: &[NodeSpec]) -> Result<HashMap<NodeId, &NodeSpec>, GraphError> {
    let mut by_id = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if by_id.insert(node.node_id.clone(), node).is_some() {
            return Err(GraphError::DuplicateNode(node.node_id.clone()));
        }
    }
    Ok(by_id)
}

fn validate_edges(
    edges: &[EdgeSpec],
    nodes_by_id: &HashMap<NodeId, &NodeSpec>,
) -> Result<(), GraphError> {
    let mut seen: HashSet<(NodeId, RouteLabel)> = HashSet::new();
    for edge in edges {
        if !nodes_by_id.contains_key(&edge.from_node_id) {
            return Err(GraphError::UnknownNode(edge.from_node_id.clone()));
        }
        if !nodes_by_id.contains_key(&edge.to_node_id) {
            return Err(GraphError::UnknownNode(edge.to_node_id.clone()));
        }
        if !seen.insert((edge.from_node_id.clone(), edge.label.clone())) {
            return Err(GraphError::DuplicateEdge {
                from: edge.from_node_id.clone(),
                label: edge.label.clone(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm: returns nodes in topological order plus each node's
/// rank, or a [`GraphError::Cycle`] naming one node on a remaining cycle.
fn topological_sort(
    nodes: &[NodeSpec],
    edges: &[EdgeSpec],
) -> Result<(Vec<NodeId>, HashMap<NodeId, u32>), GraphError> {
    let mut in_degree: HashMap<NodeId, u32> =
        nodes.iter().map(|n| (n.node_id.clone(), 0)).collect();
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from_node_id.clone())
            .or_default()
            .push(edge.to_node_id.clone());
        *in_degree.entry(edge.to_node_id.clone()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<NodeId> = nodes
        .iter()
        .map(|n| n.node_id.clone())
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    let mut rank = HashMap::with_capacity(nodes.len());

    while let Some(id) = queue.pop_front() {
        rank.insert(id.clone(), u32::try_from(order.len()).unwrap_or(u32::MAX));
        order.push(id.clone());
        if let Some(targets) = adjacency.get(&id) {
            for target in targets {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target.clone());
                    }
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let cyclic = nodes
            .iter()
            .map(|n| &n.node_id)
            .find(|id| !rank.contains_key(*id))
            .cloned()
            .unwrap_or_else(|| nodes[0].node_id.clone());
        return Err(GraphError::Cycle(cyclic));
    }

    Ok((order, rank))
}

fn check_reachability(
    nodes: &[NodeSpec],
    edges: &[EdgeSpec],
    nodes_by_id: &HashMap<NodeId, &NodeSpec>,
) -> Result<(), GraphError> {
    let roots: Vec<NodeId> = nodes
        .iter()
        .filter(|n| n.node_type == NodeKind::Source)
        .map(|n| n.node_id.clone())
        .collect();
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.from_node_id.clone())
            .or_default()
            .push(edge.to_node_id.clone());
    }
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = roots.into_iter().collect();
    while let Some(id) = queue.pop_front() {
        if visited.insert(id.clone()) {
            if let Some(targets) = adjacency.get(&id) {
                for target in targets {
                    queue.push_back(target.clone());
                }
            }
        }
    }
    for node in nodes {
        if !visited.contains(&node.node_id) {
            return Err(GraphError::Unreachable(node.node_id.clone()));
        }
    }
    let _ = nodes_by_id;
    Ok(())
}

fn validate_coalesce_schemas(graph: &ExecutionGraph) -> Result<(), GraphError> {
    for node in graph.nodes.values() {
        let NodeConfig::Coalesce(coalesce) = &node.config else {
            continue;
        };
        for branch in &coalesce.branches {
            let incoming = graph.incoming_edges(&node.node_id);
            let Some(edge) = incoming.iter().find(|e| e.label.as_str() == branch.as_str()) else {
                return Err(GraphError::MissingBranch {
                    node: node.node_id.clone(),
                    branch: branch.as_str().to_owned(),
                });
            };
            let Some(upstream) = graph.node(&edge.from_node_id) else {
                continue;
            };
            let upstream_schema = node_schema(&upstream.config);
            if let Some(upstream_schema) = upstream_schema {
                let upstream_hash = stable_hash(upstream_schema)?;
                let coalesce_hash = stable_hash(&coalesce.schema)?;
                if upstream_hash != coalesce_hash {
                    return Err(GraphError::SchemaMismatch {
                        node: node.node_id.clone(),
                        branch: branch.as_str().to_owned(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Returns the schema a node's config declares, if it has one. Source and
/// sink configs carry no framework-typed schema field.
pub(crate) fn node_schema(config: &NodeConfig) -> Option<&serde_json::Value> {
    match config {
        NodeConfig::Transform(c) => Some(&c.schema),
        NodeConfig::Gate(c) => Some(&c.schema),
        NodeConfig::Aggregation(c) => Some(&c.schema),
        NodeConfig::Coalesce(c) => Some(&c.schema),
        NodeConfig::Source(_) | NodeConfig::Sink(_) => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions only")]

    use super::*;
    use crate::graph::config::SinkNodeConfig;
    use crate::graph::config::SourceNodeConfig;
    use crate::graph::config::TransformNodeConfig;
    use serde_json::json;

    fn node(id: &str, node_type: NodeKind, config: NodeConfig) -> NodeSpec {
        NodeSpec {
            node_id: NodeId::new(id),
            plugin_name: PluginName::new(id),
            plugin_version: "1.0.0".to_string(),
            node_type,
            determinism: Determinism::Guaranteed,
            config,
        }
    }

    fn edge(from: &str, to: &str, label: &str) -> EdgeSpec {
        EdgeSpec {
            from_node_id: NodeId::new(from),
            to_node_id: NodeId::new(to),
            label: RouteLabel::new(label),
            default_mode: EdgeMode::Move,
        }
    }

    fn simple_spec() -> GraphSpec {
        GraphSpec {
            nodes: vec![
                node(
                    "source",
                    NodeKind::Source,
                    NodeConfig::Source(SourceNodeConfig {
                        plugin_config: json!({}),
                    }),
                ),
                node(
                    "sink",
                    NodeKind::Sink,
                    NodeConfig::Sink(SinkNodeConfig {
                        plugin_config: json!({}),
                    }),
                ),
            ],
            edges: vec![edge("source", "sink", "default")],
        }
    }

    #[test]
    fn builds_simple_two_node_graph() {
        let graph = ExecutionGraph::build(simple_spec()).unwrap();
        assert_eq!(graph.nodes_in_topological_order().len(), 2);
        let source = graph.node(&NodeId::new("source")).unwrap();
        let sink = graph.node(&NodeId::new("sink")).unwrap();
        assert!(source.sequence_in_pipeline < sink.sequence_in_pipeline);
    }

    #[test]
    fn detects_cycle() {
        let mut spec = simple_spec();
        spec.edges.push(edge("sink", "source", "back"));
        let result = ExecutionGraph::build(spec);
        assert!(matches!(result, Err(GraphError::Cycle(_))));
    }

    #[test]
    fn detects_unreachable_node() {
        let mut spec = simple_spec();
        spec.nodes.push(node(
            "orphan",
            NodeKind::Sink,
            NodeConfig::Sink(SinkNodeConfig {
                plugin_config: json!({}),
            }),
        ));
        let result = ExecutionGraph::build(spec);
        assert!(matches!(result, Err(GraphError::Unreachable(_))));
    }

    #[test]
    fn rejects_dangling_on_error_sink() {
        let mut spec = simple_spec();
        spec.nodes.push(node(
            "transform",
            NodeKind::Transform,
            NodeConfig::Transform(TransformNodeConfig {
                plugin_config: json!({}),
                schema: json!({}),
                required_input_fields: None,
                on_error: Some("nonexistent_sink".to_string()),
            }),
        ));
        spec.edges.push(edge("source", "transform", "to_transform"));
        spec.edges.push(edge("transform", "sink", "to_sink"));
        let result = ExecutionGraph::build(spec);
        assert!(matches!(result, Err(GraphError::RouteValidation { .. })));
    }

    #[test]
    fn upstream_topology_hash_is_stable_across_equivalent_node_ids() {
        let graph_a = ExecutionGraph::build(simple_spec()).unwrap();
        let hash_a = graph_a.upstream_topology_hash(&NodeId::new("sink")).unwrap();

        let mut spec_b = simple_spec();
        spec_b.nodes[0].node_id = NodeId::new("source-renamed");
        spec_b.edges[0].from_node_id = NodeId::new("source-renamed");
        let graph_b = ExecutionGraph::build(spec_b).unwrap();
        let hash_b = graph_b
            .upstream_topology_hash(&NodeId::new("sink"))
            .unwrap();

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn upstream_topology_hash_changes_when_config_changes() {
        let graph_a = ExecutionGraph::build(simple_spec()).unwrap();
        let hash_a = graph_a.upstream_topology_hash(&NodeId::new("sink")).unwrap();

        let mut spec_b = simple_spec();
        spec_b.nodes[0].config = NodeConfig::Source(SourceNodeConfig {
            plugin_config: json!({"changed": true}),
        });
        let graph_b = ExecutionGraph::build(spec_b).unwrap();
        let hash_b = graph_b
            .upstream_topology_hash(&NodeId::new("sink"))
            .unwrap();

        assert_ne!(hash_a, hash_b);
    }
}
