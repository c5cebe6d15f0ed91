//! Task queue stored as graph data

pub mod queue;
pub mod task;

pub use queue::TaskQueue;
pub use task::{
    BLOCKS, CHILD_OF, DEPENDS_ON, INSTANCE_OF, NewTask, PARENT_OF, RelatedTask, TASK_NODE_TYPE, Task,
    TaskRelation, TaskStats, TaskStatus,
};
