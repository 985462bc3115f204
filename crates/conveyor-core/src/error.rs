//! Error types for the Conveyor scheduler.

use crate::ids::{AgentId, PipelineId, TaskId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Admission errors
    #[error("Duplicate task id: {0}")]
    DuplicateId(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Cycle detected in task dependencies involving {0}")]
    CycleDetected(TaskId),

    // Lifecycle errors
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(PipelineId),

    #[error("Agent {agent} does not hold the claim on task {task}")]
    NotOwner { task: TaskId, agent: AgentId },

    #[error("Lease of agent {agent} on task {task} expired and was reclaimed")]
    Expired { task: TaskId, agent: AgentId },

    #[error("Cannot requeue task {task}: {reason}")]
    InvalidRequeue { task: TaskId, reason: String },

    // Agent errors
    #[error("Agent {agent} already holds {limit} tasks")]
    AgentAtCapacity { agent: AgentId, limit: usize },

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether an agent receiving this error must stop executing the task.
    pub fn is_lost_claim(&self) -> bool {
        matches!(
            self,
            Error::NotOwner { .. } | Error::Expired { .. } | Error::UnknownTask(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let agent = AgentId::new();
        let err = Error::NotOwner {
            task: TaskId::from("build"),
            agent,
        };
        assert_eq!(
            err.to_string(),
            format!("Agent {agent} does not hold the claim on task build")
        );
        assert!(err.is_lost_claim());
        assert!(!Error::CycleDetected(TaskId::from("a")).is_lost_claim());
    }
}
