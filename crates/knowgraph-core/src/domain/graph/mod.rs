//! Knowledge graph domain module
//!
//! Typed nodes and typed, directed edges with property bags, kept in a
//! pluggable backend behind [`GraphRepository`].
//!
//! ## Components
//!
//! ```text
//!   GraphTraversal  SimilaritySearch  IntegrityValidator  SubgraphExporter  DuplicateMerger
//!          \               |                  |                  |              /
//!           +--------------+------------------+------------------+-------------+
//!                                          |
//!                                     GraphStore  <-- EmbeddingProvider
//!                                          |
//!                                   GraphRepository (backend)
//! ```
//!
//! Every component is a cheap clone around a shared [`GraphStore`] and holds
//! no graph state between calls.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use knowgraph_core::domain::graph::{EdgeInput, GraphStore, GraphTraversal, NodeInput};
//!
//! let store = GraphStore::new(repository, embedder);
//! store.add_node(NodeInput::new("concept:rust", "Concept", "Rust")).await?;
//! store.add_edge(EdgeInput::new("concept:rust", "concept:tokio", "RELATED_TO")).await?;
//!
//! let context = GraphTraversal::new(store.clone())
//!     .get_graph_context(&["concept:rust".to_string()], 2)
//!     .await?;
//! ```

mod edge;
mod embedding;
mod export;
mod integrity;
mod merge;
mod node;
mod repository;
mod search;
mod store;
mod traversal;

pub use edge::{Direction, Edge, EdgeInput, EdgeKey};
pub use embedding::{EmbeddingProvider, HashingEmbedder, cosine_similarity};
pub use export::{ExportFormat, ExportStats, SubgraphDocument, SubgraphExport, SubgraphExporter, to_cypher, to_graphml};
pub use integrity::{IntegrityCheck, IntegrityIssue, IntegrityReport, IntegrityValidator};
pub use merge::{DuplicateMerger, MergeOutcome, MergeStrategy};
pub use node::{Node, NodeInput, NodePatch, Properties};
pub use repository::{
    BatchWrite, DanglingEdge, DuplicateEdgeGroup, GraphRepository, GraphStats, MergePlan, MergeWrite,
    NeighborQuery, ScoredNode, WriteOutcome,
};
pub use search::{SearchHit, SearchMode, SearchOrder, SearchResults, SimilaritySearch};
pub use store::{AppendResult, BatchFailure, BulkResult, EdgeWrite, GraphStore, NodeWrite};
pub use traversal::{GraphContext, GraphTraversal, Neighbor};
