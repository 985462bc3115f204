//! Status transition events handed to the status sink.

use crate::ids::{PipelineId, StepId, TaskId};
use crate::pipeline::RunStatus;
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Workflow,
    Step,
    Pipeline,
}

/// One status transition of a task, workflow, step, or pipeline.
///
/// `old_status` is `None` when the entity is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub pipeline_id: PipelineId,
    pub old_status: Option<String>,
    pub new_status: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn task(
        pipeline_id: PipelineId,
        task_id: &TaskId,
        old: Option<TaskStatus>,
        new: TaskStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: EntityType::Task,
            entity_id: task_id.to_string(),
            pipeline_id,
            old_status: old.map(|s| s.as_str().to_string()),
            new_status: new.as_str().to_string(),
            timestamp,
        }
    }

    pub fn workflow(
        pipeline_id: PipelineId,
        task_id: &TaskId,
        old: Option<RunStatus>,
        new: RunStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: EntityType::Workflow,
            entity_id: task_id.to_string(),
            pipeline_id,
            old_status: old.map(|s| s.as_str().to_string()),
            new_status: new.as_str().to_string(),
            timestamp,
        }
    }

    /// Step ids are only unique within their workflow, so the entity id is
    /// `<task>/<step>`.
    pub fn step(
        pipeline_id: PipelineId,
        task_id: &TaskId,
        step_id: &StepId,
        old: Option<RunStatus>,
        new: RunStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: EntityType::Step,
            entity_id: format!("{task_id}/{step_id}"),
            pipeline_id,
            old_status: old.map(|s| s.as_str().to_string()),
            new_status: new.as_str().to_string(),
            timestamp,
        }
    }

    pub fn pipeline(
        pipeline_id: PipelineId,
        old: Option<RunStatus>,
        new: RunStatus,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: EntityType::Pipeline,
            entity_id: pipeline_id.to_string(),
            pipeline_id,
            old_status: old.map(|s| s.as_str().to_string()),
            new_status: new.as_str().to_string(),
            timestamp,
        }
    }

    /// Returns the pub/sub subject for this event.
    pub fn subject(&self) -> String {
        match self.entity_type {
            EntityType::Pipeline => format!("pipeline.{}.{}", self.pipeline_id, self.new_status),
            EntityType::Task => format!(
                "pipeline.{}.task.{}.{}",
                self.pipeline_id, self.entity_id, self.new_status
            ),
            EntityType::Workflow => format!(
                "pipeline.{}.workflow.{}.{}",
                self.pipeline_id, self.entity_id, self.new_status
            ),
            EntityType::Step => format!(
                "pipeline.{}.step.{}.{}",
                self.pipeline_id, self.entity_id, self.new_status
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_event_roundtrip() {
        let pipeline_id = PipelineId::new();
        let event = StatusEvent::task(
            pipeline_id,
            &TaskId::from("build"),
            Some(TaskStatus::Pending),
            TaskStatus::Running,
            Utc::now(),
        );

        let json = serde_json::to_string(&event).expect("serialize");
        let parsed: StatusEvent = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(event, parsed);
        assert_eq!(parsed.old_status.as_deref(), Some("pending"));
        assert_eq!(
            parsed.subject(),
            format!("pipeline.{pipeline_id}.task.build.running")
        );
    }

    #[test]
    fn test_step_event_entity_id() {
        let event = StatusEvent::step(
            PipelineId::new(),
            &TaskId::from("build"),
            &StepId::from("compile"),
            None,
            RunStatus::Running,
            Utc::now(),
        );
        assert_eq!(event.entity_id, "build/compile");
        assert_eq!(event.old_status, None);
    }
}
