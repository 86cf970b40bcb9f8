// landscape-core/src/model/ids.rs
// ============================================================================
// Module: Landscape Identifiers
// Description: Opaque, serializable identifiers for every audited entity.
// Purpose: Give every row, token, node, and event a strongly typed, stable
//          string identity instead of passing raw `String`s around.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Identifiers are opaque and serialize as plain strings (`#[serde(transparent)]`).
//! Validation of format (ULID, UUID, or otherwise) is a concern of whatever
//! generates the identifier, not of the wrapper itself.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

macro_rules! define_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a new ", stringify!($name), ".")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

define_id!(RunId, "Identifier for one pipeline run.");
define_id!(NodeId, "Identifier for one node registered in a run's graph.");
define_id!(EdgeId, "Identifier for one edge between two nodes.");
define_id!(RowId, "Identifier for one row emitted by a source.");
define_id!(TokenId, "Identifier for one lineage token flowing through the graph.");
define_id!(StateId, "Identifier for one node-state attempt record.");
define_id!(RoutingEventId, "Identifier for one gate routing event.");
define_id!(CallId, "Identifier for one external call record.");
define_id!(ArtifactId, "Identifier for one sink artifact record.");
define_id!(OutcomeId, "Identifier for one token outcome record.");
define_id!(CheckpointId, "Identifier for one checkpoint record.");
define_id!(BatchId, "Identifier for one aggregation batch.");
define_id!(
    ValidationErrorId,
    "Identifier for one validation error record."
);
define_id!(
    TransformErrorId,
    "Identifier for one transform error record."
);
define_id!(PluginName, "Identifier naming a plugin implementation.");
define_id!(
    RouteLabel,
    "The label attached to a gate's outgoing edge, used as the routing key."
);
define_id!(BranchName, "The name of a branch feeding a coalesce node.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_plain_string() {
        let id = RunId::new("run-1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"run-1\"");
        let back: RunId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn display_matches_inner_string() {
        let id = NodeId::from("node-7".to_string());
        assert_eq!(id.to_string(), "node-7");
        assert_eq!(id.as_str(), "node-7");
    }
}
