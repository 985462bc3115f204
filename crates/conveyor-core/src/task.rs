//! Task types: the schedulable unit handed to agents.

use crate::ids::{AgentId, PipelineId, StepId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Agent-affinity labels, matched by exact key and value.
pub type Labels = HashMap<String, String>;

/// A step declared up front by the task graph builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    pub name: String,
    #[serde(default)]
    pub allow_failure: bool,
}

impl StepSpec {
    pub fn new(id: impl Into<StepId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            allow_failure: false,
        }
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }
}

/// A task as produced by the task graph builder, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Overwritten with the pipeline's id when submitted as part of one.
    #[serde(default)]
    pub pipeline_id: PipelineId,
    pub name: String,
    /// Handed verbatim to the executing agent.
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, pipeline_id: PipelineId) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            pipeline_id,
            payload: Vec::new(),
            labels: Labels::new(),
            dependencies: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    WaitingOnDependency,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::WaitingOnDependency => "waiting_on_dependency",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended without success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("agent lost after {requeues} requeues")]
    AgentLost { requeues: u32 },

    #[error("{message}")]
    Reported { message: String },

    #[error("step {step} failed")]
    StepFailed { step: StepId },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("dependency {dependency} did not succeed")]
    UpstreamFailed { dependency: TaskId },
}

/// Result reported by an agent for a task it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Success,
    Failure { message: String },
}

impl TaskResult {
    pub fn failure(message: impl Into<String>) -> Self {
        TaskResult::Failure {
            message: message.into(),
        }
    }
}

/// A task admitted to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub payload: Vec<u8>,
    pub labels: Labels,
    pub dependencies: Vec<TaskId>,
    pub steps: Vec<StepSpec>,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<AgentId>,
    /// Times the lease manager put this task back after an expired lease.
    pub requeues: u32,
    pub error: Option<TaskError>,
}

impl Task {
    pub fn from_spec(spec: TaskSpec, status: TaskStatus, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            pipeline_id: spec.pipeline_id,
            name: spec.name,
            payload: spec.payload,
            labels: spec.labels,
            dependencies: spec.dependencies,
            steps: spec.steps,
            status,
            enqueued_at,
            claimed_at: None,
            lease_expires_at: None,
            claimed_by: None,
            requeues: 0,
            error: None,
        }
    }

    pub fn is_claimed_by(&self, agent: AgentId) -> bool {
        self.status == TaskStatus::Running && self.claimed_by == Some(agent)
    }

    pub fn release_claim(&mut self) {
        self.claimed_at = None;
        self.lease_expires_at = None;
        self.claimed_by = None;
    }

    /// Drop claim fields and return the task to the pending set.
    pub fn reset_to_pending(&mut self) {
        self.release_claim();
        self.status = TaskStatus::Pending;
    }
}
