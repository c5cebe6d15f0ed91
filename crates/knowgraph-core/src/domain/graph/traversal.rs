//! Traversal engine
//!
//! Breadth-first context retrieval over the stored graph. Every hop is one
//! indexed edge lookup for the whole frontier followed by one node fetch.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

use super::edge::{Direction, Edge};
use super::node::Node;
use super::store::GraphStore;

/// Nodes and edges gathered by a bounded BFS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphContext {
    /// Visited nodes in discovery order (seeds first)
    pub nodes: Vec<Node>,
    /// Edges whose endpoints were both visited
    pub edges: Vec<Edge>,
    /// Hop distance of every visited node from the nearest seed
    pub distances: BTreeMap<String, usize>,
}

impl GraphContext {
    pub fn contains(&self, node_id: &str) -> bool {
        self.distances.contains_key(node_id)
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn distance(&self, node_id: &str) -> Option<usize> {
        self.distances.get(node_id).copied()
    }

    /// Largest hop distance actually reached
    pub fn max_distance(&self) -> usize {
        self.distances.values().copied().max().unwrap_or(0)
    }
}

/// One hop away from a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub node: Node,
    pub edge: Edge,
    /// Outgoing when the queried node is the edge source
    pub direction: Direction,
}

/// Bounded-depth traversal over a [`GraphStore`]
#[derive(Clone)]
pub struct GraphTraversal {
    store: GraphStore,
}

impl GraphTraversal {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Expand from `node_ids` up to `depth` hops, following edges both ways
    ///
    /// Seeds that do not exist are skipped, as are edge endpoints that do not
    /// resolve. A node reachable by several paths is recorded once, at its
    /// shortest distance.
    pub async fn get_graph_context(&self, node_ids: &[String], depth: usize) -> Result<GraphContext> {
        let repository = self.store.repository();

        let mut seeds: Vec<String> = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            if !seeds.contains(id) {
                seeds.push(id.clone());
            }
        }

        let mut context = GraphContext::default();
        let mut frontier = Vec::new();
        for node in order_like(repository.get_nodes(&seeds).await?, &seeds) {
            context.distances.insert(node.id.clone(), 0);
            frontier.push(node.id.clone());
            context.nodes.push(node);
        }

        for distance in 1..=depth {
            if frontier.is_empty() {
                break;
            }

            let mut discovered = Vec::new();
            let mut seen = HashSet::new();
            for edge in repository.edges_touching(&frontier).await? {
                for endpoint in [&edge.source_id, &edge.target_id] {
                    if !context.distances.contains_key(endpoint) && seen.insert(endpoint.clone()) {
                        discovered.push(endpoint.clone());
                    }
                }
            }

            frontier.clear();
            for node in order_like(repository.get_nodes(&discovered).await?, &discovered) {
                context.distances.insert(node.id.clone(), distance);
                frontier.push(node.id.clone());
                context.nodes.push(node);
            }
        }

        let visited: Vec<String> = context.nodes.iter().map(|n| n.id.clone()).collect();
        if !visited.is_empty() {
            context.edges = repository
                .edges_touching(&visited)
                .await?
                .into_iter()
                .filter(|e| context.distances.contains_key(&e.source_id) && context.distances.contains_key(&e.target_id))
                .collect();
        }

        debug!(
            seeds = seeds.len(),
            depth,
            nodes = context.nodes.len(),
            edges = context.edges.len(),
            "Graph context collected"
        );
        Ok(context)
    }

    /// Direct neighbours of a node in both directions
    pub async fn get_neighbors(&self, node_id: &str) -> Result<Vec<Neighbor>> {
        self.neighbors(node_id, Direction::Both, None).await
    }

    /// Direct neighbours restricted by direction and edge type
    ///
    /// Fails with `NodeNotFound` for an unknown node; neighbours whose id does
    /// not resolve are skipped.
    pub async fn neighbors(
        &self,
        node_id: &str,
        direction: Direction,
        edge_type: Option<&str>,
    ) -> Result<Vec<Neighbor>> {
        self.store.require_node(node_id).await?;
        let repository = self.store.repository();

        let edges = repository.list_edges(node_id, direction, edge_type).await?;
        let other_ids: Vec<String> = edges.iter().map(|e| e.other_end(node_id).to_string()).collect();
        let nodes: HashMap<String, Node> = repository
            .get_nodes(&other_ids)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();

        let mut neighbors = Vec::with_capacity(edges.len());
        for edge in edges {
            let other = edge.other_end(node_id).to_string();
            let Some(node) = nodes.get(&other).cloned() else {
                continue;
            };
            let direction = if edge.source_id == node_id {
                Direction::Outgoing
            } else {
                Direction::Incoming
            };
            neighbors.push(Neighbor { node, edge, direction });
        }

        Ok(neighbors)
    }
}

/// Reorder fetched nodes to follow the order their ids were requested in
fn order_like(nodes: Vec<Node>, ids: &[String]) -> Vec<Node> {
    let mut by_id: HashMap<String, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}
