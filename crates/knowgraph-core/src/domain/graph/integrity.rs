//! Integrity validator
//!
//! Read-only sweeps for structural defects. Nothing here mutates the graph;
//! defects are reported as [`IntegrityIssue`]s, never raised as errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::store::GraphStore;

/// A single integrity sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheck {
    OrphanedNodes,
    DanglingEdges,
    MissingEmbeddings,
    DuplicateEdges,
    SelfLoops,
}

impl IntegrityCheck {
    pub const ALL: [IntegrityCheck; 5] = [
        Self::OrphanedNodes,
        Self::DanglingEdges,
        Self::MissingEmbeddings,
        Self::DuplicateEdges,
        Self::SelfLoops,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrphanedNodes => "orphaned_nodes",
            Self::DanglingEdges => "dangling_edges",
            Self::MissingEmbeddings => "missing_embeddings",
            Self::DuplicateEdges => "duplicate_edges",
            Self::SelfLoops => "self_loops",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|check| check.as_str() == value.trim())
            .ok_or_else(|| {
                Error::validation(format!(
                    "unknown integrity check '{}', expected one of: {}",
                    value,
                    Self::ALL.map(|c| c.as_str()).join(", ")
                ))
            })
    }
}

impl std::fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One detected defect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    OrphanedNode {
        node_id: String,
        node_type: String,
        label: String,
    },
    DanglingEdge {
        source_id: String,
        target_id: String,
        edge_type: String,
        missing_source: bool,
        missing_target: bool,
    },
    MissingEmbedding {
        node_id: String,
        node_type: String,
    },
    DuplicateEdge {
        source_id: String,
        target_id: String,
        edge_type: String,
        count: u64,
    },
    SelfLoop {
        node_id: String,
        edge_type: String,
    },
}

/// Outcome of [`IntegrityValidator::validate_graph_integrity`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// Issues per check name; every check that ran has an entry
    pub issues_found: BTreeMap<String, Vec<IntegrityIssue>>,
    pub total_issues: usize,
    pub healthy: bool,
}

impl IntegrityReport {
    pub fn issues(&self, check: IntegrityCheck) -> &[IntegrityIssue] {
        self.issues_found.get(check.as_str()).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Structural sweeps over a [`GraphStore`]
#[derive(Clone)]
pub struct IntegrityValidator {
    store: GraphStore,
}

impl IntegrityValidator {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// Run the named checks; an empty list runs all of them
    ///
    /// Unknown names fail with a validation error before any sweep runs.
    pub async fn validate_graph_integrity<S: AsRef<str>>(&self, checks: &[S]) -> Result<IntegrityReport> {
        let checks = checks
            .iter()
            .map(|name| IntegrityCheck::parse(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        self.run(&checks).await
    }

    /// Run typed checks; an empty slice runs all of them
    pub async fn run(&self, checks: &[IntegrityCheck]) -> Result<IntegrityReport> {
        let mut selected: Vec<IntegrityCheck> = if checks.is_empty() {
            IntegrityCheck::ALL.to_vec()
        } else {
            checks.to_vec()
        };
        selected.sort();
        selected.dedup();

        let mut report = IntegrityReport::default();
        for check in selected {
            let issues = self.sweep(check).await?;
            report.total_issues += issues.len();
            report.issues_found.insert(check.as_str().to_string(), issues);
        }
        report.healthy = report.total_issues == 0;

        if report.healthy {
            info!(checks = report.issues_found.len(), "Graph integrity check passed");
        } else {
            warn!(
                checks = report.issues_found.len(),
                total_issues = report.total_issues,
                "Graph integrity issues found"
            );
        }
        Ok(report)
    }

    async fn sweep(&self, check: IntegrityCheck) -> Result<Vec<IntegrityIssue>> {
        let repository = self.store.repository();

        let issues = match check {
            IntegrityCheck::OrphanedNodes => repository
                .orphaned_nodes()
                .await?
                .into_iter()
                .map(|node| IntegrityIssue::OrphanedNode {
                    node_id: node.id,
                    node_type: node.node_type,
                    label: node.label,
                })
                .collect(),
            IntegrityCheck::DanglingEdges => repository
                .dangling_edges()
                .await?
                .into_iter()
                .map(|dangling| IntegrityIssue::DanglingEdge {
                    source_id: dangling.edge.source_id,
                    target_id: dangling.edge.target_id,
                    edge_type: dangling.edge.edge_type,
                    missing_source: dangling.missing_source,
                    missing_target: dangling.missing_target,
                })
                .collect(),
            IntegrityCheck::MissingEmbeddings => repository
                .nodes_missing_embeddings()
                .await?
                .into_iter()
                .map(|node| IntegrityIssue::MissingEmbedding {
                    node_id: node.id,
                    node_type: node.node_type,
                })
                .collect(),
            IntegrityCheck::DuplicateEdges => repository
                .duplicate_edges()
                .await?
                .into_iter()
                .map(|group| IntegrityIssue::DuplicateEdge {
                    source_id: group.key.source_id,
                    target_id: group.key.target_id,
                    edge_type: group.key.edge_type,
                    count: group.count,
                })
                .collect(),
            IntegrityCheck::SelfLoops => repository
                .self_loops()
                .await?
                .into_iter()
                .map(|edge| IntegrityIssue::SelfLoop {
                    node_id: edge.source_id,
                    edge_type: edge.edge_type,
                })
                .collect(),
        };
        Ok(issues)
    }
}
