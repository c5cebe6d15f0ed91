//! Task queue
//!
//! FIFO queue stored as graph data: every task is a `Task` node linked to the
//! anchor concept with INSTANCE_OF, dependencies are DEPENDS_ON edges. The
//! claim in [`TaskQueue::get_next_pending_task`] is a single conditional
//! update in the backend, so concurrent workers never receive the same task.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TaskQueueConfig;
use crate::domain::graph::{Direction, Edge, EdgeInput, GraphStore, GraphTraversal, Node};
use crate::error::{Error, Result};

use super::task::{
    DEPENDS_ON, INSTANCE_OF, NewTask, RelatedTask, TASK_NODE_TYPE, Task, TaskRelation, TaskStats, TaskStatus,
};

/// Task queue over a [`GraphStore`]
#[derive(Clone)]
pub struct TaskQueue {
    store: GraphStore,
    traversal: GraphTraversal,
    config: TaskQueueConfig,
}

impl TaskQueue {
    pub fn new(store: GraphStore, config: TaskQueueConfig) -> Self {
        Self {
            traversal: GraphTraversal::new(store.clone()),
            store,
            config,
        }
    }

    // ========== Lifecycle ==========

    /// Enqueue a task
    ///
    /// Unless `allow_duplicates` is set, an active (pending or in-progress)
    /// task with the same instruction, and the same chat id when one is given,
    /// is returned instead of creating a new one.
    pub async fn add_task(&self, new_task: NewTask) -> Result<Task> {
        let instruction = new_task.instruction.trim().to_string();
        if instruction.is_empty() {
            return Err(Error::validation("task instruction must not be empty"));
        }
        let chat_id = new_task.chat_id.filter(|c| !c.trim().is_empty());

        if !new_task.allow_duplicates {
            let existing = self
                .store
                .repository()
                .find_active_task(&instruction, chat_id.as_deref())
                .await?;
            if let Some(node) = existing {
                debug!(task_id = %node.id, "Returning existing active task");
                return Task::from_node(&node);
            }
        }

        let mut depends_on: Vec<String> = Vec::new();
        for id in new_task.depends_on {
            if !depends_on.contains(&id) {
                depends_on.push(id);
            }
        }
        for id in &depends_on {
            self.get_task(id).await?;
        }

        let now = Utc::now();
        let mut metadata = new_task.metadata;
        if !depends_on.is_empty() {
            metadata.insert("depends_on".into(), Value::from(depends_on.clone()));
        }
        let task = Task {
            id: format!("task:{}", Uuid::new_v4()),
            instruction,
            status: TaskStatus::Pending,
            metadata,
            chat_id,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let mut warnings = Vec::new();
        let node = self.store.embed_new_node(task.to_node(), &mut warnings).await;
        let anchor = Node::new(&self.config.anchor_id, "Concept", "Tasks");

        let mut edges = vec![Edge::new(&task.id, &self.config.anchor_id, INSTANCE_OF)];
        edges.extend(depends_on.iter().map(|dep| Edge::new(&task.id, dep, DEPENDS_ON)));

        self.store.repository().insert_task(&node, &anchor, &edges).await?;

        info!(
            task_id = %task.id,
            chat_id = ?task.chat_id,
            dependencies = depends_on.len(),
            "Task added"
        );
        self.get_task(&task.id).await
    }

    /// Get a task by id
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        match self.store.get_node(id).await? {
            Some(node) if node.node_type == TASK_NODE_TYPE => Task::from_node(&node),
            _ => Err(Error::TaskNotFound(id.to_string())),
        }
    }

    /// Tasks oldest first, optionally filtered by status and chat
    pub async fn get_all_tasks(&self, status: Option<TaskStatus>, chat_id: Option<&str>) -> Result<Vec<Task>> {
        self.store
            .repository()
            .list_tasks(status, chat_id)
            .await?
            .iter()
            .map(Task::from_node)
            .collect()
    }

    /// Claim the oldest pending task
    ///
    /// The task is already `in_progress` when returned. A claim that loses a
    /// race is retried up to `claim_retries` times before the queue is
    /// reported empty.
    pub async fn get_next_pending_task(&self) -> Result<Option<Task>> {
        let repository = self.store.repository();

        for attempt in 0..=self.config.claim_retries {
            match repository.claim_next_task(Utc::now()).await {
                Ok(Some(node)) => {
                    let task = Task::from_node(&node)?;
                    info!(task_id = %task.id, attempt, "Task claimed");
                    return Ok(Some(task));
                }
                Ok(None) => return Ok(None),
                Err(e) if e.is_conflict() => {
                    debug!(attempt, error = %e, "Task claim lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(retries = self.config.claim_retries, "Task claim contention persisted, reporting empty queue");
        Ok(None)
    }

    /// Move a task to `status`, recording `result` and `error`
    ///
    /// Only legal transitions are accepted. Fails with `Conflict` when another
    /// caller changed the status concurrently.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Task> {
        let mut task = self.get_task(id).await?;
        let current = task.status;
        if !current.can_transition_to(status) {
            return Err(Error::validation(format!(
                "task '{}' cannot move from {} to {}",
                id, current, status
            )));
        }

        let now = Utc::now();
        task.status = status;
        task.updated_at = now;
        if result.is_some() {
            task.result = result;
        }
        if error.is_some() {
            task.error = error;
        }
        if status == TaskStatus::InProgress {
            task.started_at = Some(now);
        }
        if status.is_terminal() {
            task.completed_at = Some(now);
        }

        self.store.repository().transition_task(&task.to_node(), current).await?;
        info!(task_id = %id, from = %current, to = %status, "Task status updated");
        Ok(task)
    }

    /// Delete a task together with its edges
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        self.get_task(id).await?;
        let deleted = self.store.repository().delete_nodes(&[id.to_string()], true).await? > 0;
        if deleted {
            info!(task_id = %id, "Task deleted");
        }
        Ok(deleted)
    }

    /// Delete every completed task, returning how many were removed
    pub async fn clear_completed_tasks(&self) -> Result<u64> {
        let removed = self
            .store
            .repository()
            .delete_tasks_with_status(TaskStatus::Completed)
            .await?;
        info!(removed, "Completed tasks cleared");
        Ok(removed)
    }

    /// Task counts by status, computed on each call
    pub async fn get_task_stats(&self) -> Result<TaskStats> {
        let counts = self.store.repository().count_tasks_by_status().await?;
        Ok(TaskStats::from_counts(&counts))
    }

    // ========== Relations ==========

    /// Record that `from_id` depends on `to_id`
    ///
    /// Ordering is left to the scheduler consuming the queue.
    pub async fn add_task_dependency(&self, from_id: &str, to_id: &str) -> Result<()> {
        self.add_related_task(from_id, to_id, TaskRelation::DependsOn).await
    }

    /// Tasks that `id` depends on
    pub async fn get_task_dependencies(&self, id: &str) -> Result<Vec<Task>> {
        self.linked_tasks(id, Direction::Outgoing, DEPENDS_ON).await
    }

    /// Tasks that depend on `id`
    pub async fn get_dependent_tasks(&self, id: &str) -> Result<Vec<Task>> {
        self.linked_tasks(id, Direction::Incoming, DEPENDS_ON).await
    }

    /// Link two tasks with a relation edge
    pub async fn add_related_task(&self, from_id: &str, to_id: &str, relation: TaskRelation) -> Result<()> {
        if from_id == to_id {
            return Err(Error::validation(format!("task '{}' cannot relate to itself", from_id)));
        }
        self.get_task(from_id).await?;
        self.get_task(to_id).await?;

        self.store
            .add_edge(EdgeInput::new(from_id, to_id, relation.edge_type()))
            .await?;
        debug!(from = %from_id, to = %to_id, relation = relation.edge_type(), "Task relation added");
        Ok(())
    }

    /// Tasks linked to `id` in either direction, optionally by one relation
    pub async fn get_related_tasks(&self, id: &str, relation: Option<TaskRelation>) -> Result<Vec<RelatedTask>> {
        self.get_task(id).await?;
        let edge_type = relation.map(|r| r.edge_type());

        let mut related = Vec::new();
        for neighbor in self.traversal.neighbors(id, Direction::Both, edge_type).await? {
            if !is_task(&neighbor.node) {
                continue;
            }
            let task = Task::from_node(&neighbor.node)?;
            if let Some(entry) = RelatedTask::from_edge_type(task, &neighbor.edge.edge_type, neighbor.direction) {
                related.push(entry);
            }
        }
        Ok(related)
    }

    async fn linked_tasks(&self, id: &str, direction: Direction, edge_type: &str) -> Result<Vec<Task>> {
        self.get_task(id).await?;
        self.traversal
            .neighbors(id, direction, Some(edge_type))
            .await?
            .iter()
            .filter(|n| is_task(&n.node))
            .map(|n| Task::from_node(&n.node))
            .collect()
    }
}

fn is_task(node: &Node) -> bool {
    node.node_type == TASK_NODE_TYPE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_store;
    use serde_json::json;

    async fn queue() -> TaskQueue {
        TaskQueue::new(memory_store().await, TaskQueueConfig::default())
    }

    #[tokio::test]
    async fn test_add_task_links_anchor() {
        let queue = queue().await;
        let task = queue
            .add_task(NewTask::new("index the repository").with_metadata("priority", 1))
            .await
            .unwrap();

        assert!(task.id.starts_with("task:"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.metadata.get("priority"), Some(&json!(1)));

        let anchor = queue.store.require_node("concept:tasks").await.unwrap();
        assert_eq!(anchor.node_type, "Concept");
        let edges = queue.store.get_edges(&task.id, Direction::Outgoing).await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, INSTANCE_OF);
        assert_eq!(edges[0].target_id, "concept:tasks");
    }

    #[tokio::test]
    async fn test_add_task_deduplicates_active_instructions() {
        let queue = queue().await;
        let first = queue.add_task(NewTask::new("summarize").for_chat("c1")).await.unwrap();
        let same = queue.add_task(NewTask::new("summarize").for_chat("c1")).await.unwrap();
        let other_chat = queue.add_task(NewTask::new("summarize").for_chat("c2")).await.unwrap();
        let forced = queue
            .add_task(NewTask::new("summarize").for_chat("c1").allow_duplicates())
            .await
            .unwrap();

        assert_eq!(first.id, same.id);
        assert_ne!(first.id, other_chat.id);
        assert_ne!(first.id, forced.id);
        assert_eq!(queue.get_all_tasks(None, None).await.unwrap().len(), 3);
        assert_eq!(queue.get_all_tasks(None, Some("c1")).await.unwrap().len(), 2);

        queue
            .update_task_status(&first.id, TaskStatus::Completed, None, None)
            .await
            .unwrap();
        queue.update_task_status(&forced.id, TaskStatus::Failed, None, None).await.unwrap();
        let fresh = queue.add_task(NewTask::new("summarize").for_chat("c1")).await.unwrap();
        assert_ne!(fresh.id, first.id);
        assert_ne!(fresh.id, forced.id);
    }

    #[tokio::test]
    async fn test_add_task_requires_existing_dependencies() {
        let queue = queue().await;
        let err = queue
            .add_task(NewTask::new("deploy").depends_on("task:missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(id) if id == "task:missing"));
        assert!(queue.get_all_tasks(None, None).await.unwrap().is_empty());
        assert!(queue.get_next_pending_task().await.unwrap().is_none());
        assert_eq!(queue.store.stats().await.unwrap().total_edges, 0);

        let err = queue.add_task(NewTask::new("   ")).await.unwrap_err();
        assert_eq!(err.code(), "E100");
    }

    #[tokio::test]
    async fn test_dependencies_are_edges() {
        let queue = queue().await;
        let build = queue.add_task(NewTask::new("build")).await.unwrap();
        let test = queue.add_task(NewTask::new("test")).await.unwrap();
        let deploy = queue
            .add_task(NewTask::new("deploy").depends_on(&build.id))
            .await
            .unwrap();
        queue.add_task_dependency(&deploy.id, &test.id).await.unwrap();

        assert_eq!(deploy.metadata.get("depends_on"), Some(&json!([build.id.clone()])));

        let mut deps: Vec<String> = queue
            .get_task_dependencies(&deploy.id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        deps.sort();
        let mut expected = vec![build.id.clone(), test.id.clone()];
        expected.sort();
        assert_eq!(deps, expected);

        let dependents = queue.get_dependent_tasks(&build.id).await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, deploy.id);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let queue = queue().await;
        let first = queue.add_task(NewTask::new("first")).await.unwrap();
        let second = queue.add_task(NewTask::new("second")).await.unwrap();

        let claimed = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::InProgress);
        assert!(claimed.started_at.is_some());

        let claimed = queue.get_next_pending_task().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(queue.get_next_pending_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_are_enforced() {
        let queue = queue().await;
        let task = queue.add_task(NewTask::new("analyze logs")).await.unwrap();
        queue.get_next_pending_task().await.unwrap();

        let err = queue
            .update_task_status(&task.id, TaskStatus::Pending, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E100");

        let done = queue
            .update_task_status(&task.id, TaskStatus::Completed, Some(json!("3 errors found")), None)
            .await
            .unwrap();
        assert_eq!(done.result, Some(json!("3 errors found")));
        assert!(done.completed_at.is_some());

        let stored = queue.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.started_at.is_some());

        let err = queue
            .update_task_status(&task.id, TaskStatus::Failed, None, Some("late".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E100");
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let queue = queue().await;
        let a = queue.add_task(NewTask::new("a")).await.unwrap();
        let b = queue.add_task(NewTask::new("b").depends_on(&a.id)).await.unwrap();
        let c = queue.add_task(NewTask::new("c")).await.unwrap();

        queue.update_task_status(&a.id, TaskStatus::Completed, None, None).await.unwrap();
        queue.update_task_status(&c.id, TaskStatus::Completed, None, None).await.unwrap();

        let stats = queue.get_task_stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total, 3);

        assert_eq!(queue.clear_completed_tasks().await.unwrap(), 2);
        assert!(queue.get_task_dependencies(&b.id).await.unwrap().is_empty());
        assert_eq!(queue.store.get_edges(&b.id, Direction::Outgoing).await.unwrap().len(), 1);

        assert!(queue.delete_task(&b.id).await.unwrap());
        assert!(queue.get_task(&b.id).await.unwrap_err().is_not_found());
        assert!(queue.store.get_edges("concept:tasks", Direction::Incoming).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_related_tasks() {
        let queue = queue().await;
        let parent = queue.add_task(NewTask::new("epic")).await.unwrap();
        let child = queue.add_task(NewTask::new("story")).await.unwrap();
        let blocker = queue.add_task(NewTask::new("blocker")).await.unwrap();

        queue.add_related_task(&parent.id, &child.id, TaskRelation::ParentOf).await.unwrap();
        queue.add_related_task(&blocker.id, &child.id, TaskRelation::Blocks).await.unwrap();

        let related = queue.get_related_tasks(&child.id, None).await.unwrap();
        assert_eq!(related.len(), 2);
        assert!(related.iter().all(|r| r.direction == Direction::Incoming));

        let blockers = queue.get_related_tasks(&child.id, Some(TaskRelation::Blocks)).await.unwrap();
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].task.id, blocker.id);
        assert_eq!(blockers[0].relation, TaskRelation::Blocks);

        let err = queue
            .add_related_task(&parent.id, &parent.id, TaskRelation::Blocks)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E100");
    }
}
