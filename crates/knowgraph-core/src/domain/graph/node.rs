//! Node types for the knowledge graph
//!
//! A node is a typed, caller-identified unit of knowledge. Its property bag is
//! a `serde_json::Value` map, so values stay a closed sum type
//! (null/bool/number/string/list/map) that maps directly onto a JSON column.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Property bag carried by nodes and edges
pub type Properties = BTreeMap<String, Value>;

/// A node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique, caller-assigned identifier
    pub id: String,
    /// Type tag (Concept, Memory, File, Task, ...)
    pub node_type: String,
    /// Short display string
    pub label: String,
    /// Long-form text; embedded when non-empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with empty content and properties
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: label.into(),
            content: None,
            properties: Properties::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
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

    /// Text that should be embedded, if any
    pub fn embeddable_text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    /// Get a property value
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Get a property value as a string slice
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Loosely-typed node input
///
/// Every field is optional at the type level so that ingestion payloads can be
/// validated item by item; `id` and `node_type` are required, `label` falls
/// back to the id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl NodeInput {
    /// Create a complete input
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            node_type: Some(node_type.into()),
            label: Some(label.into()),
            ..Default::default()
        }
    }

    /// Set the content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
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

    /// The id as given, for error reporting
    pub fn id_hint(&self) -> Option<String> {
        self.id.clone().filter(|id| !id.trim().is_empty())
    }

    /// Validate required fields and build a node stamped with `now`
    pub fn into_node(self, now: DateTime<Utc>) -> Result<Node> {
        let id = required(self.id, "id")?;
        let node_type = required(self.node_type, "node_type")?;
        let label = self
            .label
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| id.clone());

        Ok(Node {
            id,
            node_type,
            label,
            content: self.content,
            properties: self.properties,
            embedding: None,
            created_at: now,
            updated_at: now,
        })
    }
}

impl From<Node> for NodeInput {
    fn from(node: Node) -> Self {
        Self {
            id: Some(node.id),
            node_type: Some(node.node_type),
            label: Some(node.label),
            content: node.content,
            properties: node.properties,
        }
    }
}

/// Partial update for an existing node
///
/// Only supplied fields change. An empty `content` string clears the content
/// (and with it the embedding).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub properties: Option<Properties>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Apply the patch to a node, returning whether the content changed
    pub fn apply_to(self, node: &mut Node) -> Result<bool> {
        if let Some(node_type) = self.node_type {
            node.node_type = non_empty(node_type, "node_type")?;
        }
        if let Some(label) = self.label {
            node.label = non_empty(label, "label")?;
        }

        let mut content_changed = false;
        if let Some(content) = self.content {
            let content = Some(content).filter(|c| !c.trim().is_empty());
            content_changed = content != node.content;
            node.content = content;
        }
        if let Some(properties) = self.properties {
            node.properties = properties;
        }

        node.updated_at = Utc::now();
        Ok(content_changed)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(value) => non_empty(value, field),
        None => Err(Error::validation(format!("missing required field '{}'", field))),
    }
}

fn non_empty(value: String, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::validation(format!("field '{}' must not be empty", field)));
    }
    Ok(trimmed.to_string())
}
