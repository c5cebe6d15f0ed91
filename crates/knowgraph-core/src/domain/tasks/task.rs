//! Task entities
//!
//! A task is a node of type [`TASK_NODE_TYPE`]; its queue fields live in the
//! node's property bag so that tasks compose with ordinary graph edges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::graph::{Direction, Node, Properties};
use crate::error::{Error, Result};

/// Node type reserved for tasks
pub const TASK_NODE_TYPE: &str = "Task";

/// Task -> anchor concept
pub const INSTANCE_OF: &str = "INSTANCE_OF";
/// Task -> task it waits on
pub const DEPENDS_ON: &str = "DEPENDS_ON";
pub const PARENT_OF: &str = "PARENT_OF";
pub const CHILD_OF: &str = "CHILD_OF";
pub const BLOCKS: &str = "BLOCKS";

/// Status of a queued task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed by a worker
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [Self::Pending, Self::InProgress, Self::Completed, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value.trim())
            .ok_or_else(|| Error::validation(format!("unknown task status '{}'", value)))
    }

    /// Completed and failed tasks accept no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::InProgress => next.is_terminal(),
            Self::Completed | Self::Failed => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relation between two tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRelation {
    ParentOf,
    ChildOf,
    Blocks,
    DependsOn,
}

impl TaskRelation {
    pub const ALL: [TaskRelation; 4] = [Self::ParentOf, Self::ChildOf, Self::Blocks, Self::DependsOn];

    /// Edge type carrying this relation
    pub fn edge_type(&self) -> &'static str {
        match self {
            Self::ParentOf => PARENT_OF,
            Self::ChildOf => CHILD_OF,
            Self::Blocks => BLOCKS,
            Self::DependsOn => DEPENDS_ON,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|relation| relation.edge_type() == normalized)
            .ok_or_else(|| {
                Error::validation(format!(
                    "unknown task relation '{}', expected PARENT_OF, CHILD_OF, BLOCKS or DEPENDS_ON",
                    value
                ))
            })
    }

    fn from_edge_type(edge_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|relation| relation.edge_type() == edge_type)
    }
}

/// A task as seen by queue callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instruction: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Read a task out of its node
    pub fn from_node(node: &Node) -> Result<Self> {
        if node.node_type != TASK_NODE_TYPE {
            return Err(Error::TaskNotFound(node.id.clone()));
        }

        let status = node
            .property_str("status")
            .ok_or_else(|| Error::validation(format!("task '{}' has no status", node.id)))
            .and_then(TaskStatus::parse)?;

        let metadata = match node.property("metadata") {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => Properties::new(),
        };

        Ok(Self {
            id: node.id.clone(),
            instruction: node
                .property_str("instruction")
                .or(node.content.as_deref())
                .unwrap_or_default()
                .to_string(),
            status,
            metadata,
            chat_id: node.property_str("chat_id").map(str::to_string),
            result: node.property("result").filter(|v| !v.is_null()).cloned(),
            error: node.property_str("error").map(str::to_string),
            created_at: node.created_at,
            updated_at: node.updated_at,
            started_at: timestamp(node, "started_at"),
            completed_at: timestamp(node, "completed_at"),
        })
    }

    /// The node this task is stored as
    pub fn to_node(&self) -> Node {
        let mut properties = Properties::new();
        properties.insert("status".into(), Value::from(self.status.as_str()));
        properties.insert("instruction".into(), Value::from(self.instruction.clone()));
        properties.insert(
            "metadata".into(),
            Value::Object(self.metadata.clone().into_iter().collect()),
        );
        if let Some(chat_id) = &self.chat_id {
            properties.insert("chat_id".into(), Value::from(chat_id.clone()));
        }
        if let Some(result) = &self.result {
            properties.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            properties.insert("error".into(), Value::from(error.clone()));
        }
        if let Some(started_at) = self.started_at {
            properties.insert("started_at".into(), Value::from(started_at.to_rfc3339()));
        }
        if let Some(completed_at) = self.completed_at {
            properties.insert("completed_at".into(), Value::from(completed_at.to_rfc3339()));
        }

        Node {
            id: self.id.clone(),
            node_type: TASK_NODE_TYPE.to_string(),
            label: task_label(&self.instruction),
            content: Some(self.instruction.clone()),
            properties,
            embedding: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Short label for a task node
pub(crate) fn task_label(instruction: &str) -> String {
    const MAX_CHARS: usize = 80;
    let first_line = instruction.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= MAX_CHARS {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(MAX_CHARS - 3).collect();
        format!("{}...", truncated)
    }
}

fn timestamp(node: &Node, key: &str) -> Option<DateTime<Utc>> {
    node.property_str(key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fields for a new task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub instruction: String,
    #[serde(default)]
    pub metadata: Properties,
    /// Existing task ids the new task depends on
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Skip the active-duplicate check
    #[serde(default)]
    pub allow_duplicates: bool,
    #[serde(default)]
    pub chat_id: Option<String>,
}

impl NewTask {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.push(task_id.into());
        self
    }

    pub fn allow_duplicates(mut self) -> Self {
        self.allow_duplicates = true;
        self
    }

    pub fn for_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }
}

/// Task counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl TaskStats {
    pub(crate) fn from_counts(counts: &[(String, u64)]) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            match TaskStatus::parse(status) {
                Ok(TaskStatus::Pending) => stats.pending += count,
                Ok(TaskStatus::InProgress) => stats.in_progress += count,
                Ok(TaskStatus::Completed) => stats.completed += count,
                Ok(TaskStatus::Failed) => stats.failed += count,
                Err(_) => {}
            }
            stats.total += count;
        }
        stats
    }
}

/// A task linked to another through a relation edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedTask {
    pub task: Task,
    pub relation: TaskRelation,
    /// Outgoing when the queried task is the edge source
    pub direction: Direction,
}

impl RelatedTask {
    pub(crate) fn from_edge_type(task: Task, edge_type: &str, direction: Direction) -> Option<Self> {
        TaskRelation::from_edge_type(edge_type).map(|relation| Self {
            task,
            relation,
            direction,
        })
    }
}
