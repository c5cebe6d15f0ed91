//! Repository trait for graph persistence
//!
//! This is the storage backend seam. Every method is one logical round trip
//! (one statement or one transaction); the higher components hold no state
//! between calls. Implementations must keep the documented transaction scopes:
//! `write_batch` and `merge_nodes` are single transactions, and
//! `claim_next_task` flips exactly one row from pending to in_progress.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tasks::TaskStatus;
use crate::error::Result;

use super::edge::{Direction, Edge, EdgeKey};
use super::node::{Node, Properties};

/// Repository trait for graph persistence
#[async_trait]
pub trait GraphRepository: Send + Sync {
    // ========== Node Operations ==========

    /// Get a node by ID
    async fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Get every node whose id is in `ids` (missing ids are skipped)
    async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Node>>;

    /// List nodes, optionally restricted to one type, oldest first
    async fn list_nodes(&self, node_type: Option<&str>) -> Result<Vec<Node>>;

    /// Insert or fully overwrite a node (created_at of an existing row is kept)
    async fn upsert_node(&self, node: &Node) -> Result<WriteOutcome>;

    /// Delete nodes; with `detach` their incident edges go in the same transaction
    async fn delete_nodes(&self, ids: &[String], detach: bool) -> Result<u64>;

    // ========== Edge Operations ==========

    /// Insert or update the edge with the same `(source, target, type)` key
    async fn upsert_edge(&self, edge: &Edge) -> Result<WriteOutcome>;

    /// Get an edge by key
    async fn get_edge(&self, key: &EdgeKey) -> Result<Option<Edge>>;

    /// Delete every row with this key
    async fn delete_edge(&self, key: &EdgeKey) -> Result<u64>;

    /// Edges of one node in the given direction, optionally of one type
    async fn list_edges(
        &self,
        node_id: &str,
        direction: Direction,
        edge_type: Option<&str>,
    ) -> Result<Vec<Edge>>;

    /// Every edge with at least one endpoint in `ids`
    async fn edges_touching(&self, ids: &[String]) -> Result<Vec<Edge>>;

    // ========== Batch Operations ==========

    /// Write nodes then edges in a single transaction
    ///
    /// Nodes are upserted unconditionally. Each edge is checked for existing
    /// endpoints (including nodes written earlier in the same batch) and
    /// reports its own failure without aborting the others. Outcomes are
    /// aligned with the input slices.
    async fn write_batch(&self, nodes: &[Node], edges: &[Edge]) -> Result<BatchWrite>;

    // ========== Similarity ==========

    /// Nearest neighbours of `query` among embedded nodes, best first
    async fn nearest_neighbors(&self, query: &[f32], filter: &NeighborQuery) -> Result<Vec<ScoredNode>>;

    /// Case-insensitive substring match over label and content, newest first
    async fn text_search(&self, text: &str, node_type: Option<&str>, limit: usize) -> Result<Vec<Node>>;

    // ========== Integrity Sweeps ==========

    /// Nodes with no incident edge in either direction
    async fn orphaned_nodes(&self) -> Result<Vec<Node>>;

    /// Edges whose source or target id does not resolve
    async fn dangling_edges(&self) -> Result<Vec<DanglingEdge>>;

    /// Nodes with non-empty content but no embedding
    async fn nodes_missing_embeddings(&self) -> Result<Vec<Node>>;

    /// Keys shared by more than one edge row
    async fn duplicate_edges(&self) -> Result<Vec<DuplicateEdgeGroup>>;

    /// Edges whose source equals their target
    async fn self_loops(&self) -> Result<Vec<Edge>>;

    // ========== Merge ==========

    /// Redirect edges, drop duplicates, delete merged nodes and update the
    /// kept node, all in one transaction
    async fn merge_nodes(&self, plan: &MergePlan) -> Result<MergeWrite>;

    // ========== Task Queue ==========

    /// Write a task node, its anchor (when absent) and its edges in one
    /// transaction
    ///
    /// An existing anchor is left untouched. If any edge endpoint is missing
    /// the call fails with `Error::TaskNotFound` and nothing is written.
    async fn insert_task(&self, task: &Node, anchor: &Node, edges: &[Edge]) -> Result<()>;

    /// A pending or in-progress task with this instruction (and chat id, if given)
    async fn find_active_task(&self, instruction: &str, chat_id: Option<&str>) -> Result<Option<Node>>;

    /// Atomically move the oldest pending task to in_progress
    ///
    /// Returns `Ok(None)` when nothing is pending and `Error::Conflict` when a
    /// pending row was seen but another writer claimed it first.
    async fn claim_next_task(&self, claimed_at: DateTime<Utc>) -> Result<Option<Node>>;

    /// Overwrite a task only if its stored status still equals `expected`
    ///
    /// Fails with `Error::Conflict` when the status moved underneath the caller.
    async fn transition_task(&self, task: &Node, expected: TaskStatus) -> Result<()>;

    /// Tasks filtered by status and chat id, oldest first
    async fn list_tasks(&self, status: Option<TaskStatus>, chat_id: Option<&str>) -> Result<Vec<Node>>;

    /// Task counts grouped by stored status
    async fn count_tasks_by_status(&self) -> Result<Vec<(String, u64)>>;

    /// Detach-delete every task with this status, returning how many went
    async fn delete_tasks_with_status(&self, status: TaskStatus) -> Result<u64>;

    // ========== Statistics ==========

    /// Get graph statistics
    async fn get_stats(&self) -> Result<GraphStats>;
}

/// Whether an upsert created a new row or replaced an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// Per-item outcomes of [`GraphRepository::write_batch`]
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    pub nodes: Vec<WriteOutcome>,
    /// `Err` carries the reason the edge was rejected
    pub edges: Vec<std::result::Result<WriteOutcome, String>>,
}

/// Parameters for a nearest-neighbour query
#[derive(Debug, Clone)]
pub struct NeighborQuery {
    pub node_type: Option<String>,
    pub exclude_id: Option<String>,
    pub min_similarity: f32,
    pub limit: usize,
}

/// A node with its similarity to a query vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredNode {
    pub node: Node,
    pub similarity: f32,
}

/// An edge with at least one unresolved endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanglingEdge {
    pub edge: Edge,
    pub missing_source: bool,
    pub missing_target: bool,
}

/// A key that more than one edge row shares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEdgeGroup {
    pub key: EdgeKey,
    pub count: u64,
}

/// Fully computed merge, ready to be applied in one transaction
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub keep_id: String,
    pub remove_ids: Vec<String>,
    pub merged_properties: Properties,
    pub updated_at: DateTime<Utc>,
}

/// What a merge transaction changed
#[derive(Debug, Clone)]
pub struct MergeWrite {
    pub edges_redirected: u64,
    pub edges_dropped: u64,
    pub merged_node: Node,
}

/// Statistics about the graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: u64,
    pub total_edges: u64,
    pub nodes_by_type: Vec<(String, u64)>,
    pub edges_by_type: Vec<(String, u64)>,
    pub nodes_with_embeddings: u64,
}
