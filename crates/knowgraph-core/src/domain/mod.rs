//! Domain layer
//!
//! Graph model, the components built on it, and the task queue.

pub mod graph;
pub mod knowledge_graph;
pub mod tasks;

pub use knowledge_graph::KnowledgeGraph;
