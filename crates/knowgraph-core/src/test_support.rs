//! Shared fixtures for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::domain::graph::{EmbeddingProvider, GraphStore, HashingEmbedder};
use crate::error::{Error, Result};
use crate::infrastructure::graph::SqliteGraphRepository;
use crate::storage::Database;

/// In-memory database with migrations applied
pub(crate) async fn memory_db() -> Database {
    Database::in_memory().await.expect("in-memory database")
}

/// Store over a fresh in-memory database with the hashing embedder
pub(crate) async fn memory_store() -> GraphStore {
    memory_store_with(Arc::new(HashingEmbedder::new(64))).await
}

/// Store over a fresh in-memory database with a custom embedder
pub(crate) async fn memory_store_with(embedder: Arc<dyn EmbeddingProvider>) -> GraphStore {
    let db = memory_db().await;
    let repository = Arc::new(SqliteGraphRepository::new(db.pool().clone()));
    GraphStore::new(repository, embedder)
}

/// Store whose embedder always fails
pub(crate) async fn failing_store() -> GraphStore {
    memory_store_with(Arc::new(FailingEmbedder)).await
}

pub(crate) struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn dimensions(&self) -> usize {
        64
    }

    fn name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::EmbeddingFailed("provider offline".into()))
    }
}

/// Hashing embedder that counts its calls
#[derive(Default)]
pub(crate) struct CountingEmbedder {
    inner: HashingEmbedder,
    calls: AtomicUsize,
}

impl CountingEmbedder {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn name(&self) -> &str {
        "counting"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(text).await
    }
}
