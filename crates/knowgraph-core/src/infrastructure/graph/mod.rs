//! Graph infrastructure implementations
//!
//! Concrete [`GraphRepository`](crate::domain::graph::GraphRepository)
//! backends. SQLite is the only one shipped.

mod repository;

pub use repository::SqliteGraphRepository;
