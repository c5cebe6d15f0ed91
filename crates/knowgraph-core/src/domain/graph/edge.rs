//! Edge types for the knowledge graph
//!
//! Edges are typed, directed links between node ids. Endpoints are not
//! enforced at write time; an edge whose endpoint vanished is kept and
//! surfaced by the integrity validator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::Properties;
use crate::error::{Error, Result};

/// A directed, typed relationship between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
    /// Type tag (DEPENDS_ON, INSTANCE_OF, PARENT_OF, ...)
    pub edge_type: String,
    #[serde(default)]
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// Create a new edge
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type: edge_type.into(),
            properties: Properties::new(),
            created_at: Utc::now(),
        }
    }

    /// Set a single property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Replace the property bag
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// The upsert key of this edge
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(&self.source_id, &self.target_id, &self.edge_type)
    }

    /// The endpoint opposite to `node_id`
    pub fn other_end(&self, node_id: &str) -> &str {
        if self.source_id == node_id {
            &self.target_id
        } else {
            &self.source_id
        }
    }
}

/// Identity of an edge: `(source_id, target_id, edge_type)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
}

impl EdgeKey {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type: edge_type.into(),
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source_id == self.target_id
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source_id, self.edge_type, self.target_id)
    }
}

/// Loosely-typed edge input, validated per item during ingestion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeInput {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub edge_type: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl EdgeInput {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        edge_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: Some(source_id.into()),
            target_id: Some(target_id.into()),
            edge_type: Some(edge_type.into()),
            properties: Properties::new(),
        }
    }

    /// Set a single property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Best-effort description of the edge for error reporting
    pub fn describe(&self) -> String {
        format!(
            "{} -[{}]-> {}",
            self.source_id.as_deref().unwrap_or("?"),
            self.edge_type.as_deref().unwrap_or("?"),
            self.target_id.as_deref().unwrap_or("?"),
        )
    }

    /// Validate required fields and build an edge stamped with `now`
    pub fn into_edge(self, now: DateTime<Utc>) -> Result<Edge> {
        let field = |value: Option<String>, name: &str| -> Result<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::validation(format!("missing required field '{}'", name)))
        };

        Ok(Edge {
            source_id: field(self.source_id, "source_id")?,
            target_id: field(self.target_id, "target_id")?,
            edge_type: field(self.edge_type, "edge_type")?,
            properties: self.properties,
            created_at: now,
        })
    }
}

impl From<Edge> for EdgeInput {
    fn from(edge: Edge) -> Self {
        Self {
            source_id: Some(edge.source_id),
            target_id: Some(edge.target_id),
            edge_type: Some(edge.edge_type),
            properties: edge.properties,
        }
    }
}

/// Direction for graph traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow outgoing edges (source -> target)
    Outgoing,
    /// Follow incoming edges (target -> source)
    Incoming,
    /// Follow edges in both directions
    Both,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Both => "both",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
