//! Knowgraph Core Library
//!
//! A persistent knowledge graph for agent memory:
//! - Typed nodes and directed, typed edges with JSON property bags
//! - Bounded breadth-first context extraction
//! - Embedding similarity search with a text fallback
//! - Integrity checks, duplicate merging and subgraph export (JSON, Cypher, GraphML)
//! - A task queue stored in the graph itself, with an atomic claim
//!
//! Storage is SQLite via sqlx; see [`storage::Database`].

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::KnowledgeGraph;
    pub use crate::domain::graph::{
        Direction, Edge, EdgeInput, EmbeddingProvider, ExportFormat, GraphStore, HashingEmbedder,
        IntegrityCheck, MergeStrategy, Node, NodeInput, NodePatch, SearchOrder,
    };
    pub use crate::domain::tasks::{NewTask, Task, TaskRelation, TaskStatus};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{Database, DatabaseConfig};
}

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod error_tests;
