//! Knowledge graph handle
//!
//! Wires every component around one shared [`GraphStore`]. The handle owns
//! no connection: the caller opens the [`Database`] and decides its lifetime.

use std::sync::Arc;

use crate::config::Config;
use crate::domain::graph::{
    DuplicateMerger, EmbeddingProvider, GraphRepository, GraphStore, GraphTraversal, IntegrityValidator,
    SimilaritySearch, SubgraphExporter,
};
use crate::domain::tasks::TaskQueue;
use crate::error::{Error, Result};
use crate::infrastructure::graph::SqliteGraphRepository;
use crate::storage::Database;

/// All graph components over one backend
#[derive(Clone)]
pub struct KnowledgeGraph {
    store: GraphStore,
    traversal: GraphTraversal,
    search: SimilaritySearch,
    validator: IntegrityValidator,
    exporter: SubgraphExporter,
    merger: DuplicateMerger,
    tasks: TaskQueue,
}

impl KnowledgeGraph {
    /// Build every component over `repository`
    ///
    /// Fails with `Error::ConfigError` when `config` does not validate.
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("{:#}", e)))?;

        let store = GraphStore::new(repository, embedder);
        Ok(Self {
            traversal: GraphTraversal::new(store.clone()),
            search: SimilaritySearch::new(store.clone(), config.search.clone()),
            validator: IntegrityValidator::new(store.clone()),
            exporter: SubgraphExporter::new(store.clone()),
            merger: DuplicateMerger::new(store.clone()),
            tasks: TaskQueue::new(store.clone(), config.tasks.clone()),
            store,
        })
    }

    /// Build over the SQLite backend of an open database
    pub fn from_database(
        database: &Database,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Self> {
        let repository = Arc::new(SqliteGraphRepository::new(database.pool().clone()));
        Self::new(repository, embedder, config)
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn traversal(&self) -> &GraphTraversal {
        &self.traversal
    }

    pub fn search(&self) -> &SimilaritySearch {
        &self.search
    }

    pub fn validator(&self) -> &IntegrityValidator {
        &self.validator
    }

    pub fn exporter(&self) -> &SubgraphExporter {
        &self.exporter
    }

    pub fn merger(&self) -> &DuplicateMerger {
        &self.merger
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }
}
