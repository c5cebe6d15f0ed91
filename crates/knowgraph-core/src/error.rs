//! Error types for Knowgraph

use thiserror::Error;

/// Result type alias using Knowgraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Knowgraph error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors (E001-E099)
    #[error("Node '{0}' not found.")]
    NodeNotFound(String),

    #[error("Task '{0}' not found. List tasks with `get_all_tasks` to see what exists.")]
    TaskNotFound(String),

    // Input errors (E100-E199)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Concurrency errors (E200-E299)
    #[error("Write conflict: {0}")]
    Conflict(String),

    // Embedding errors (E300-E399)
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "E001",
            Self::TaskNotFound(_) => "E002",
            Self::Validation(_) => "E100",
            Self::Conflict(_) => "E200",
            Self::EmbeddingFailed(_) => "E300",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::ConfigError(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NodeNotFound(_) => Some("add the node with add_node before referencing it".to_string()),
            Self::Conflict(_) => Some("retry the operation".to_string()),
            Self::EmbeddingFailed(_) => Some("check the embedding provider".to_string()),
            Self::ConfigError(_) => Some("check config.toml in the knowgraph config directory".to_string()),
            _ => None,
        }
    }

    /// Whether this error is one of the not-found family
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NodeNotFound(_) | Self::TaskNotFound(_))
    }

    /// Whether this error is a lost optimistic write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
