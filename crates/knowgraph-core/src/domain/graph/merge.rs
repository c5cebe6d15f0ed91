//! Duplicate merger
//!
//! Folds duplicate nodes into one survivor. Property merging happens here;
//! the edge rewrite and node deletion run in a single backend transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

use super::node::{Node, Properties};
use super::repository::MergePlan;
use super::store::GraphStore;

/// How properties of merged nodes are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// All keys kept; later nodes win on collision
    #[default]
    Union,
    /// Only the survivor's own properties
    Keep,
    /// Per key, the value from the most recently updated node
    PreferNewer,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Union => "union",
            Self::Keep => "keep",
            Self::PreferNewer => "prefer_newer",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "union" => Ok(Self::Union),
            "keep" => Ok(Self::Keep),
            "prefer_newer" => Ok(Self::PreferNewer),
            other => Err(Error::validation(format!(
                "unknown merge strategy '{}', expected union, keep or prefer_newer",
                other
            ))),
        }
    }

    /// Combine property bags of `nodes` (in caller order) for the survivor `keep_id`
    pub fn merge_properties(&self, nodes: &[Node], keep_id: &str) -> Properties {
        match self {
            Self::Union => {
                let mut merged = Properties::new();
                for node in nodes {
                    merged.extend(node.properties.clone());
                }
                merged
            }
            Self::Keep => nodes
                .iter()
                .find(|n| n.id == keep_id)
                .map(|n| n.properties.clone())
                .unwrap_or_default(),
            Self::PreferNewer => {
                let mut by_age: Vec<&Node> = nodes.iter().collect();
                by_age.sort_by_key(|n| n.updated_at);
                let mut merged = Properties::new();
                for node in by_age {
                    merged.extend(node.properties.clone());
                }
                merged
            }
        }
    }
}

/// What a merge changed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Edges rewritten to point at the survivor
    pub edges_redirected: u64,
    /// Edges deleted because redirection would duplicate an existing edge or
    /// turn it into a self-loop
    pub edges_dropped: u64,
    pub merged_node: Node,
    pub removed_node_ids: Vec<String>,
}

/// Duplicate consolidation over a [`GraphStore`]
#[derive(Clone)]
pub struct DuplicateMerger {
    store: GraphStore,
}

impl DuplicateMerger {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Merge `node_ids` into `keep_id`
    ///
    /// Every id must exist and `keep_id` must be one of them. Destructive:
    /// the other nodes are deleted once their edges point at the survivor.
    pub async fn merge_duplicate_nodes(
        &self,
        node_ids: &[String],
        keep_id: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        let mut ids: Vec<String> = Vec::with_capacity(node_ids.len());
        for id in node_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        if !ids.iter().any(|id| id == keep_id) {
            return Err(Error::validation(format!(
                "keep node '{}' must be one of the merged node ids",
                keep_id
            )));
        }
        if ids.len() < 2 {
            return Err(Error::validation("at least two distinct node ids are required to merge"));
        }

        let fetched = self.store.get_nodes(&ids).await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in &ids {
            match fetched.iter().find(|n| &n.id == id) {
                Some(node) => nodes.push(node.clone()),
                None => return Err(Error::NodeNotFound(id.clone())),
            }
        }

        let remove_ids: Vec<String> = ids.iter().filter(|id| *id != keep_id).cloned().collect();
        let plan = MergePlan {
            keep_id: keep_id.to_string(),
            remove_ids: remove_ids.clone(),
            merged_properties: strategy.merge_properties(&nodes, keep_id),
            updated_at: Utc::now(),
        };

        let written = self.store.repository().merge_nodes(&plan).await?;

        info!(
            keep_id = %keep_id,
            removed = remove_ids.len(),
            strategy = strategy.as_str(),
            edges_redirected = written.edges_redirected,
            edges_dropped = written.edges_dropped,
            "Nodes merged"
        );

        Ok(MergeOutcome {
            edges_redirected: written.edges_redirected,
            edges_dropped: written.edges_dropped,
            merged_node: written.merged_node,
            removed_node_ids: remove_ids,
        })
    }
}
