//! Pipeline, workflow, and step execution records.
//!
//! A pipeline run owns an ordered list of workflows; each workflow maps 1:1
//! to a scheduled [`Task`](crate::task::Task) and owns the steps its agent
//! reports while executing it.

use crate::ids::{AgentId, PipelineId, StepId, TaskId};
use crate::task::{StepSpec, TaskError, TaskSpec, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A whole pipeline run as emitted by the task graph builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub id: PipelineId,
    pub workflows: Vec<TaskSpec>,
}

/// Status shared by pipelines, workflows, and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Cancelled | RunStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Skipped => "skipped",
        }
    }

    /// The task status a terminal run status corresponds to.
    pub fn as_terminal_task_status(&self) -> Option<TaskStatus> {
        match self {
            RunStatus::Success => Some(TaskStatus::Success),
            RunStatus::Failure => Some(TaskStatus::Failure),
            RunStatus::Cancelled => Some(TaskStatus::Cancelled),
            RunStatus::Skipped => Some(TaskStatus::Skipped),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }
}

impl From<TaskStatus> for RunStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending | TaskStatus::WaitingOnDependency => RunStatus::Pending,
            TaskStatus::Running => RunStatus::Running,
            TaskStatus::Success => RunStatus::Success,
            TaskStatus::Failure => RunStatus::Failure,
            TaskStatus::Cancelled => RunStatus::Cancelled,
            TaskStatus::Skipped => RunStatus::Skipped,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub status: RunStatus,
    pub workflows: Vec<Workflow>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(id: PipelineId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            workflows: Vec::new(),
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn workflow(&self, task_id: &TaskId) -> Option<&Workflow> {
        self.workflows.iter().find(|w| &w.task_id == task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub task_id: TaskId,
    pub name: String,
    pub status: RunStatus,
    pub agent_id: Option<AgentId>,
    pub steps: Vec<Step>,
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        Self {
            task_id: spec.id.clone(),
            name: spec.name.clone(),
            status: RunStatus::Pending,
            agent_id: None,
            steps: spec.steps.iter().map(Step::from_spec).collect(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub allow_failure: bool,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn from_spec(spec: &StepSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            allow_failure: spec.allow_failure,
            status: RunStatus::Pending,
            exit_code: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A step status update streamed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: StepId,
    pub status: RunStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepReport {
    pub fn new(step_id: impl Into<StepId>, status: RunStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            exit_code: None,
            error: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }
}

/// One row of a pipeline step listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepListing {
    pub workflow: String,
    pub position: usize,
    pub step: String,
    pub status: RunStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_from_task_status() {
        assert_eq!(
            RunStatus::from(TaskStatus::WaitingOnDependency),
            RunStatus::Pending
        );
        assert_eq!(RunStatus::from(TaskStatus::Running), RunStatus::Running);
        assert_eq!(
            RunStatus::Skipped.as_terminal_task_status(),
            Some(TaskStatus::Skipped)
        );
        assert_eq!(RunStatus::Running.as_terminal_task_status(), None);
    }

    #[test]
    fn test_workflow_from_spec_declares_pending_steps() {
        let spec = TaskSpec::new("build", PipelineId::new())
            .with_step(StepSpec::new("clone", "clone"))
            .with_step(StepSpec::new("lint", "lint").allow_failure());
        let workflow = Workflow::from_spec(&spec);
        assert_eq!(workflow.steps.len(), 2);
        assert!(workflow.steps.iter().all(|s| s.status == RunStatus::Pending));
        assert!(workflow.steps[1].allow_failure);
    }
}
