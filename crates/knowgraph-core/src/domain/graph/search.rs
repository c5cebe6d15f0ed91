//! Similarity search
//!
//! Nearest-neighbour ranking over node embeddings, and a hybrid search that
//! adds a substring-match boost on top of semantic similarity.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::error::{Error, Result};

use super::node::Node;
use super::repository::{NeighborQuery, ScoredNode};
use super::store::GraphStore;

/// Result ordering for [`SimilaritySearch::search_nodes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchOrder {
    /// Highest score first
    #[default]
    Relevance,
    /// Most recently updated first
    Recency,
}

impl SearchOrder {
    /// `"relevance"` selects relevance; any other value falls back to recency
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("relevance") {
            Self::Relevance
        } else {
            Self::Recency
        }
    }
}

/// How a search was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Semantic similarity plus text boost
    Hybrid,
    /// The provider failed; substring match only
    TextOnly,
}

/// One search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub node: Node,
    /// Combined ranking score
    pub score: f32,
    /// Cosine similarity to the query, when the node was ranked semantically
    pub similarity: Option<f32>,
    /// Whether the query text occurs in the label or content
    pub text_match: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub mode: SearchMode,
    pub warnings: Vec<String>,
}

/// Similarity search over a [`GraphStore`]
#[derive(Clone)]
pub struct SimilaritySearch {
    store: GraphStore,
    config: SearchConfig,
}

impl SimilaritySearch {
    pub fn new(store: GraphStore, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Nodes whose embedding is close to that of `node_id`, best first
    ///
    /// `threshold` and `limit` fall back to the configured defaults. The
    /// reference node must have an embedding. With `include_self` it is
    /// returned first with similarity 1.0.
    pub async fn find_similar_nodes(
        &self,
        node_id: &str,
        threshold: Option<f32>,
        limit: Option<usize>,
        include_self: bool,
    ) -> Result<Vec<ScoredNode>> {
        let threshold = threshold.unwrap_or(self.config.default_threshold);
        let limit = limit.unwrap_or(self.config.default_limit);

        let node = self.store.require_node(node_id).await?;
        let Some(embedding) = node.embedding.clone() else {
            return Err(Error::validation(format!(
                "node '{}' has no embedding to compare against",
                node_id
            )));
        };

        let query = NeighborQuery {
            node_type: None,
            exclude_id: Some(node.id.clone()),
            min_similarity: threshold,
            limit,
        };
        let mut results = self.store.repository().nearest_neighbors(&embedding, &query).await?;

        if include_self && threshold <= 1.0 {
            results.insert(0, ScoredNode { node, similarity: 1.0 });
            results.truncate(limit);
        }

        debug!(node_id = %node_id, threshold, results = results.len(), "Similar nodes found");
        Ok(results)
    }

    /// Free-text search over node content
    ///
    /// Semantic candidates come from embedding `query`; nodes whose label or
    /// content contains `query` get `text_match_boost` added to their score.
    /// When the provider fails the search falls back to substring matching.
    pub async fn search_nodes(
        &self,
        query: &str,
        node_type: Option<&str>,
        limit: Option<usize>,
        order_by: SearchOrder,
    ) -> Result<SearchResults> {
        let limit = limit.unwrap_or(self.config.default_limit);
        let candidate_limit = self.config.text_match_limit.max(limit);
        let repository = self.store.repository();

        let mut warnings = Vec::new();
        let mut hits: HashMap<String, SearchHit> = HashMap::new();

        let mode = match self.store.embedder().embed(query).await {
            Ok(vector) => {
                let neighbor_query = NeighborQuery {
                    node_type: node_type.map(str::to_string),
                    exclude_id: None,
                    min_similarity: f32::MIN_POSITIVE,
                    limit: candidate_limit,
                };
                for scored in repository.nearest_neighbors(&vector, &neighbor_query).await? {
                    hits.insert(
                        scored.node.id.clone(),
                        SearchHit {
                            node: scored.node,
                            score: scored.similarity,
                            similarity: Some(scored.similarity),
                            text_match: false,
                        },
                    );
                }
                SearchMode::Hybrid
            }
            Err(e) => {
                warn!(error = %e, "Query embedding failed, falling back to text search");
                warnings.push(format!("semantic ranking unavailable: {}", e));
                SearchMode::TextOnly
            }
        };

        for node in repository.text_search(query, node_type, candidate_limit).await? {
            let boost = self.config.text_match_boost;
            hits.entry(node.id.clone())
                .and_modify(|hit| {
                    hit.score += boost;
                    hit.text_match = true;
                })
                .or_insert(SearchHit {
                    node,
                    score: boost,
                    similarity: None,
                    text_match: true,
                });
        }

        let mut hits: Vec<SearchHit> = hits.into_values().collect();
        match order_by {
            SearchOrder::Relevance => hits.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then_with(|| b.node.updated_at.cmp(&a.node.updated_at))
                    .then_with(|| a.node.id.cmp(&b.node.id))
            }),
            SearchOrder::Recency => hits.sort_by(|a, b| {
                b.node
                    .updated_at
                    .cmp(&a.node.updated_at)
                    .then_with(|| b.score.total_cmp(&a.score))
                    .then_with(|| a.node.id.cmp(&b.node.id))
            }),
        }
        hits.truncate(limit);

        debug!(query_len = query.len(), ?mode, ?order_by, results = hits.len(), "Search completed");
        Ok(SearchResults { hits, mode, warnings })
    }
}
