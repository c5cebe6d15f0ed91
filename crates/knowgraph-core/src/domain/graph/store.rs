//! Node/Edge store
//!
//! CRUD, upsert and bulk ingestion on top of a [`GraphRepository`]. Every
//! other component reaches the backend through a shared `GraphStore`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::edge::{Direction, Edge, EdgeInput, EdgeKey};
use super::embedding::EmbeddingProvider;
use super::node::{Node, NodeInput, NodePatch};
use super::repository::{GraphRepository, GraphStats, WriteOutcome};

/// Result of a single node write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeWrite {
    pub node: Node,
    pub outcome: WriteOutcome,
    /// Non-fatal problems, e.g. an embedding that could not be computed
    pub warnings: Vec<String>,
}

/// Result of a single edge write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeWrite {
    pub edge: Edge,
    pub outcome: WriteOutcome,
}

/// One rejected item of a bulk call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    /// Position of the item in the caller's list
    pub index: usize,
    /// Node id or edge key, when the item carried enough to name it
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of a bulk call: the call succeeds even when some items fail
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResult {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<BatchFailure>,
    pub warnings: Vec<String>,
}

impl BulkResult {
    /// Whether every item was written
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of items written
    pub fn written(&self) -> usize {
        self.added.len() + self.updated.len()
    }
}

/// Combined outcome of [`GraphStore::append_graph`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppendResult {
    pub nodes: BulkResult,
    pub edges: BulkResult,
}

impl AppendResult {
    pub fn total_added(&self) -> usize {
        self.nodes.added.len() + self.edges.added.len()
    }

    pub fn total_updated(&self) -> usize {
        self.nodes.updated.len() + self.edges.updated.len()
    }

    pub fn total_failed(&self) -> usize {
        self.nodes.failed.len() + self.edges.failed.len()
    }
}

/// Node/edge store with embedding maintenance
#[derive(Clone)]
pub struct GraphStore {
    repository: Arc<dyn GraphRepository>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl GraphStore {
    /// Create a store over a backend and an embedding provider
    pub fn new(repository: Arc<dyn GraphRepository>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { repository, embedder }
    }

    pub(crate) fn repository(&self) -> &dyn GraphRepository {
        self.repository.as_ref()
    }

    pub(crate) fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    // ========== Nodes ==========

    /// Upsert a node: create it if absent, overwrite every field if present
    ///
    /// The embedding is recomputed only when the content changed (or was never
    /// embedded). A provider failure leaves the embedding empty and is
    /// reported in `warnings`, the write itself still succeeds.
    pub async fn add_node(&self, input: NodeInput) -> Result<NodeWrite> {
        let node = input.into_node(Utc::now())?;
        let existing = self.repository.get_node(&node.id).await?;

        let mut warnings = Vec::new();
        let node = self.prepare_node(node, existing.as_ref(), &mut warnings).await;
        let outcome = self.repository.upsert_node(&node).await?;

        debug!(node_id = %node.id, node_type = %node.node_type, ?outcome, "Node saved");
        Ok(NodeWrite {
            node,
            outcome,
            warnings,
        })
    }

    /// Apply a partial update to an existing node
    pub async fn update_node(&self, id: &str, patch: NodePatch) -> Result<NodeWrite> {
        let mut node = self.require_node(id).await?;
        let content_changed = patch.apply_to(&mut node)?;

        let mut warnings = Vec::new();
        if content_changed {
            node.embedding = match node.embeddable_text().map(str::to_string) {
                Some(text) => self.embed_or_warn(&node.id, &text, &mut warnings).await,
                None => None,
            };
        }

        self.repository.upsert_node(&node).await?;
        debug!(node_id = %node.id, content_changed, "Node updated");
        Ok(NodeWrite {
            node,
            outcome: WriteOutcome::Updated,
            warnings,
        })
    }

    /// Get a node by id
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.repository.get_node(id).await
    }

    /// Get a node by id, failing with `NodeNotFound` when absent
    pub async fn require_node(&self, id: &str) -> Result<Node> {
        self.repository
            .get_node(id)
            .await?
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    /// Get several nodes at once; absent ids are skipped
    pub async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>> {
        self.repository.get_nodes(ids).await
    }

    /// List nodes, optionally of a single type
    pub async fn list_nodes(&self, node_type: Option<&str>) -> Result<Vec<Node>> {
        self.repository.list_nodes(node_type).await
    }

    /// Delete a node; edges that reference it are left in place
    pub async fn delete_node(&self, id: &str) -> Result<bool> {
        let deleted = self.repository.delete_nodes(&[id.to_string()], false).await? > 0;
        if deleted {
            info!(node_id = %id, "Node deleted");
        }
        Ok(deleted)
    }

    // ========== Edges ==========

    /// Upsert an edge on its `(source, target, type)` key
    ///
    /// Endpoints are not checked here; a dangling edge is stored and reported
    /// by the integrity validator.
    pub async fn add_edge(&self, input: EdgeInput) -> Result<EdgeWrite> {
        let edge = input.into_edge(Utc::now())?;
        let outcome = self.repository.upsert_edge(&edge).await?;

        debug!(edge = %edge.key(), ?outcome, "Edge saved");
        Ok(EdgeWrite { edge, outcome })
    }

    /// Get an edge by key
    pub async fn get_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        self.repository.get_edge(key).await
    }

    /// Delete an edge by key
    pub async fn delete_edge(&self, key: &EdgeKey) -> Result<bool> {
        let deleted = self.repository.delete_edge(key).await? > 0;
        if deleted {
            info!(edge = %key, "Edge deleted");
        }
        Ok(deleted)
    }

    /// Edges of a node in one or both directions
    pub async fn get_edges(&self, node_id: &str, direction: Direction) -> Result<Vec<Edge>> {
        self.repository.list_edges(node_id, direction, None).await
    }

    // ========== Bulk ==========

    /// Upsert many nodes in one transaction, isolating per-item failures
    pub async fn bulk_add_nodes(&self, inputs: Vec<NodeInput>) -> Result<BulkResult> {
        Ok(self.append_graph(inputs, Vec::new()).await?.nodes)
    }

    /// Upsert many edges in one transaction, isolating per-item failures
    ///
    /// Unlike [`add_edge`](Self::add_edge), each edge must reference existing nodes.
    pub async fn bulk_add_edges(&self, inputs: Vec<EdgeInput>) -> Result<BulkResult> {
        Ok(self.append_graph(Vec::new(), inputs).await?.edges)
    }

    /// Upsert nodes, then edges, in a single transaction
    ///
    /// Edges may reference nodes supplied in the same call.
    pub async fn append_graph(
        &self,
        node_inputs: Vec<NodeInput>,
        edge_inputs: Vec<EdgeInput>,
    ) -> Result<AppendResult> {
        let now = Utc::now();
        let mut result = AppendResult::default();

        let mut nodes = Vec::with_capacity(node_inputs.len());
        for (index, input) in node_inputs.into_iter().enumerate() {
            let id = input.id_hint();
            match input.into_node(now) {
                Ok(node) => nodes.push(node),
                Err(e) => result.nodes.failed.push(BatchFailure {
                    index,
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        let mut edges = Vec::with_capacity(edge_inputs.len());
        let mut edge_indexes = Vec::with_capacity(edge_inputs.len());
        for (index, input) in edge_inputs.into_iter().enumerate() {
            let described = input.describe();
            match input.into_edge(now) {
                Ok(edge) => {
                    edges.push(edge);
                    edge_indexes.push(index);
                }
                Err(e) => result.edges.failed.push(BatchFailure {
                    index,
                    id: Some(described),
                    reason: e.to_string(),
                }),
            }
        }

        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let existing: HashMap<String, Node> = self
            .repository
            .get_nodes(&ids)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let prepared = join_all(nodes.into_iter().map(|node| {
            let previous = existing.get(&node.id);
            async move {
                let mut warnings = Vec::new();
                let node = self.prepare_node(node, previous, &mut warnings).await;
                (node, warnings)
            }
        }))
        .await;

        let mut nodes = Vec::with_capacity(prepared.len());
        for (node, warnings) in prepared {
            result.nodes.warnings.extend(warnings);
            nodes.push(node);
        }

        let written = self.repository.write_batch(&nodes, &edges).await?;

        for (node, outcome) in nodes.iter().zip(written.nodes) {
            match outcome {
                WriteOutcome::Created => result.nodes.added.push(node.id.clone()),
                WriteOutcome::Updated => result.nodes.updated.push(node.id.clone()),
            }
        }

        for ((edge, index), outcome) in edges.iter().zip(edge_indexes).zip(written.edges) {
            let key = edge.key().to_string();
            match outcome {
                Ok(WriteOutcome::Created) => result.edges.added.push(key),
                Ok(WriteOutcome::Updated) => result.edges.updated.push(key),
                Err(reason) => result.edges.failed.push(BatchFailure {
                    index,
                    id: Some(key),
                    reason,
                }),
            }
        }

        result.nodes.failed.sort_by_key(|f| f.index);
        result.edges.failed.sort_by_key(|f| f.index);

        info!(
            nodes_written = result.nodes.written(),
            nodes_failed = result.nodes.failed.len(),
            edges_written = result.edges.written(),
            edges_failed = result.edges.failed.len(),
            complete = result.nodes.is_complete() && result.edges.is_complete(),
            "Graph batch written"
        );

        Ok(result)
    }

    /// Get graph statistics
    pub async fn stats(&self) -> Result<GraphStats> {
        self.repository.get_stats().await
    }

    // ========== Embeddings ==========

    /// Embed a node that is about to be created outside the regular write path
    pub(crate) async fn embed_new_node(&self, node: Node, warnings: &mut Vec<String>) -> Node {
        self.prepare_node(node, None, warnings).await
    }

    /// Carry over creation time and a still-valid embedding, or compute a new one
    async fn prepare_node(&self, mut node: Node, existing: Option<&Node>, warnings: &mut Vec<String>) -> Node {
        if let Some(existing) = existing {
            node.created_at = existing.created_at;
        }

        let Some(text) = node.embeddable_text().map(str::to_string) else {
            node.embedding = None;
            return node;
        };

        let reusable = existing
            .filter(|previous| previous.content == node.content)
            .and_then(|previous| previous.embedding.clone());

        node.embedding = match reusable {
            Some(embedding) => Some(embedding),
            None => self.embed_or_warn(&node.id, &text, warnings).await,
        };
        node
    }

    async fn embed_or_warn(&self, node_id: &str, text: &str, warnings: &mut Vec<String>) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                warn!(
                    node_id = %node_id,
                    provider = self.embedder.name(),
                    error = %e,
                    "Embedding failed, storing node without embedding"
                );
                warnings.push(format!("embedding for node '{}' failed: {}", node_id, e));
                None
            }
        }
    }
}
