//! Scheduler facade: the agent RPC surface and administrative controls over
//! one task queue.

use crate::config::SchedulerConfig;
use crate::lease::LeaseManager;
use crate::matcher::LabelFilter;
use crate::queue::TaskQueue;
use crate::state::QueueInfo;
use chrono::{DateTime, Utc};
use conveyor_core::Result;
use conveyor_core::ids::{AgentId, PipelineId, TaskId};
use conveyor_core::pipeline::{Pipeline, PipelineSpec, StepListing, StepReport};
use conveyor_core::ports::StatusSink;
use conveyor_core::task::{Labels, Task, TaskResult, TaskStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The main scheduler service.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue: TaskQueue,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, sink: Arc<dyn StatusSink>) -> Result<Self> {
        let queue = TaskQueue::new(config.clone(), sink)?;
        Ok(Self { config, queue })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// A lease manager sweeping this scheduler's queue at the configured
    /// interval.
    pub fn lease_manager(&self) -> LeaseManager {
        LeaseManager::new(self.queue.clone(), self.config.sweep_interval())
    }

    /// Admit every workflow of a pipeline run, or none of them.
    pub fn submit_pipeline(&self, spec: PipelineSpec) -> Result<Vec<TaskStatus>> {
        let pipeline_id = spec.id;
        let workflows: Vec<_> = spec
            .workflows
            .into_iter()
            .map(|mut w| {
                w.pipeline_id = pipeline_id;
                w
            })
            .collect();
        let count = workflows.len();

        let statuses = self.queue.push_all(workflows)?;
        info!(pipeline_id = %pipeline_id, workflows = count, "Pipeline submitted");
        Ok(statuses)
    }

    /// Agent poll: wait for a task matching the agent's labels. Returns
    /// `None` when `cancel` fires or the agent is disconnected meanwhile.
    pub async fn poll(
        &self,
        agent: AgentId,
        labels: &Labels,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>> {
        let kicked = self.queue.connect(agent, labels, concurrency)?;
        let filter = LabelFilter::new(labels.clone());

        tokio::select! {
            claimed = self.queue.pop(agent, &filter, cancel) => claimed,
            _ = kicked.cancelled() => {
                info!(agent_id = %agent, "Poll released by disconnect");
                Ok(None)
            }
        }
    }

    pub fn extend(&self, agent: AgentId, task: &TaskId) -> Result<DateTime<Utc>> {
        self.queue.extend(task, agent)
    }

    /// Final report of a task together with the statuses of its steps.
    pub fn report_done(
        &self,
        agent: AgentId,
        task: &TaskId,
        result: TaskResult,
        steps: &[StepReport],
    ) -> Result<TaskStatus> {
        self.queue
            .done_with_steps(task, agent, result, steps)
            .inspect_err(|e| {
                if e.is_lost_claim() {
                    warn!(task_id = %task, agent_id = %agent, error = %e, "Rejected completion");
                }
            })
    }

    pub fn report_step_update(
        &self,
        agent: AgentId,
        task: &TaskId,
        report: &StepReport,
    ) -> Result<()> {
        self.queue.report_step(task, agent, report)
    }

    /// Drop the agent's session and release its outstanding polls.
    pub fn disconnect(&self, agent: &AgentId) -> Result<()> {
        self.queue.disconnect(agent)?;
        Ok(())
    }

    pub fn cancel_pipeline(&self, pipeline: &PipelineId, reason: &str) -> Result<()> {
        self.queue.cancel_pipeline(pipeline, reason)
    }

    pub fn requeue(&self, task: &TaskId) -> Result<TaskStatus> {
        self.queue.requeue(task)
    }

    pub fn pause(&self) -> Result<()> {
        self.queue.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.queue.resume()
    }

    pub fn info(&self) -> Result<QueueInfo> {
        self.queue.info()
    }

    pub fn pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        self.queue.pipeline(id)
    }

    /// Step listing of a pipeline ("ps").
    pub fn steps(&self, id: &PipelineId) -> Result<Vec<StepListing>> {
        self.queue.steps(id)
    }

    pub async fn wait(&self, task: &TaskId, cancel: &CancellationToken) -> Result<Option<TaskStatus>> {
        self.queue.wait(task, cancel).await
    }
}
