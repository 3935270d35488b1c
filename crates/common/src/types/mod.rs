mod messages;
mod node;
mod task;

pub use messages::{ControlAction, ControlMessage, PendingTaskEnvelope, TaskMessage};
pub use node::{NodeStatus, WorkerNode};
pub use task::{Task, TaskStatus};
