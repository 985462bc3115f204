//! Workflow state machine: maps task transitions onto the
//! pipeline/workflow/step hierarchy.

use crate::dag::DependencyGraph;
use chrono::{DateTime, Utc};
use conveyor_core::events::StatusEvent;
use conveyor_core::ids::{AgentId, PipelineId, StepId, TaskId};
use conveyor_core::pipeline::{Pipeline, RunStatus, Step, StepListing, StepReport, Workflow};
use conveyor_core::task::{TaskError, TaskSpec};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// One pipeline run and the admitted specs of its tasks.
#[derive(Debug)]
struct PipelineRecord {
    pipeline: Pipeline,
    specs: HashMap<TaskId, TaskSpec>,
    graph: DependencyGraph,
}

impl PipelineRecord {
    fn new(id: PipelineId, now: DateTime<Utc>) -> Self {
        Self {
            pipeline: Pipeline::new(id, now),
            specs: HashMap::new(),
            graph: DependencyGraph::new(),
        }
    }
}

/// Pipeline aggregate: pending until something starts, running while any
/// workflow is open, then the worst status among non-skipped workflows.
pub fn aggregate_status(workflows: &[Workflow]) -> RunStatus {
    if workflows.is_empty() {
        return RunStatus::Pending;
    }

    if workflows.iter().any(|w| !w.status.is_terminal()) {
        return if workflows.iter().any(|w| w.status != RunStatus::Pending) {
            RunStatus::Running
        } else {
            RunStatus::Pending
        };
    }

    workflows
        .iter()
        .map(|w| w.status)
        .filter(|s| *s != RunStatus::Skipped)
        .max_by_key(severity)
        .unwrap_or(RunStatus::Skipped)
}

fn severity(status: &RunStatus) -> u8 {
    match status {
        RunStatus::Cancelled => 3,
        RunStatus::Failure => 2,
        RunStatus::Success => 1,
        _ => 0,
    }
}

/// Every live or recently finished pipeline, indexed by task id.
#[derive(Debug)]
pub(crate) struct PipelineBook {
    records: HashMap<PipelineId, PipelineRecord>,
    owners: HashMap<TaskId, PipelineId>,
    finished: VecDeque<PipelineId>,
    history_limit: usize,
}

impl PipelineBook {
    pub fn new(history_limit: usize) -> Self {
        Self {
            records: HashMap::new(),
            owners: HashMap::new(),
            finished: VecDeque::new(),
            history_limit,
        }
    }

    pub fn contains_task(&self, task: &TaskId) -> bool {
        self.owners.contains_key(task)
    }

    pub fn owner(&self, task: &TaskId) -> Option<PipelineId> {
        self.owners.get(task).copied()
    }

    pub fn spec(&self, task: &TaskId) -> Option<&TaskSpec> {
        let pipeline = self.owners.get(task)?;
        self.records.get(pipeline)?.specs.get(task)
    }

    pub fn workflow_status(&self, task: &TaskId) -> Option<RunStatus> {
        let pipeline = self.owners.get(task)?;
        self.records
            .get(pipeline)?
            .pipeline
            .workflow(task)
            .map(|w| w.status)
    }

    pub fn pipeline(&self, id: &PipelineId) -> Option<&Pipeline> {
        self.records.get(id).map(|r| &r.pipeline)
    }

    /// Task ids of a pipeline in workflow order.
    pub fn pipeline_tasks(&self, id: &PipelineId) -> Option<Vec<TaskId>> {
        self.records.get(id).map(|r| {
            r.pipeline
                .workflows
                .iter()
                .map(|w| w.task_id.clone())
                .collect()
        })
    }

    /// Step listing of a pipeline, one row per step, positions starting at 1
    /// within each workflow.
    pub fn steps(&self, id: &PipelineId) -> Option<Vec<StepListing>> {
        let record = self.records.get(id)?;
        Some(
            record
                .pipeline
                .workflows
                .iter()
                .flat_map(|w| {
                    w.steps.iter().enumerate().map(move |(i, s)| StepListing {
                        workflow: w.name.clone(),
                        position: i + 1,
                        step: s.name.clone(),
                        status: s.status,
                    })
                })
                .collect(),
        )
    }

    pub fn dependents(&self, task: &TaskId) -> Vec<TaskId> {
        self.graph_of(task)
            .map(|g| g.dependents(task).to_vec())
            .unwrap_or_default()
    }

    pub fn transitive_dependents(&self, task: &TaskId) -> Vec<TaskId> {
        self.graph_of(task)
            .map(|g| g.transitive_dependents(task))
            .unwrap_or_default()
    }

    /// Order `ids` so every task comes before the tasks it depends on. Ids of
    /// different pipelines keep the order their pipelines first appear in.
    pub fn dependents_first(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let mut groups: Vec<(PipelineId, Vec<TaskId>)> = Vec::new();
        for id in ids {
            let Some(pipeline) = self.owner(id) else {
                continue;
            };
            match groups.iter_mut().find(|(p, _)| *p == pipeline) {
                Some((_, members)) => members.push(id.clone()),
                None => groups.push((pipeline, vec![id.clone()])),
            }
        }

        groups
            .into_iter()
            .flat_map(|(pipeline, members)| match self.records.get(&pipeline) {
                Some(record) => record.graph.dependents_first(&members),
                None => members,
            })
            .collect()
    }

    fn graph_of(&self, task: &TaskId) -> Option<&DependencyGraph> {
        let pipeline = self.owners.get(task)?;
        self.records.get(pipeline).map(|r| &r.graph)
    }

    /// Register an admitted task as a pending workflow of its pipeline,
    /// creating the pipeline on first use.
    pub fn admit(&mut self, spec: TaskSpec, now: DateTime<Utc>, events: &mut Vec<StatusEvent>) {
        let pipeline_id = spec.pipeline_id;
        let record = self.records.entry(pipeline_id).or_insert_with(|| {
            events.push(StatusEvent::pipeline(
                pipeline_id,
                None,
                RunStatus::Pending,
                now,
            ));
            PipelineRecord::new(pipeline_id, now)
        });

        record.graph.add(&spec.id, &spec.dependencies);
        record.pipeline.workflows.push(Workflow::from_spec(&spec));
        events.push(StatusEvent::workflow(
            pipeline_id,
            &spec.id,
            None,
            RunStatus::Pending,
            now,
        ));
        self.owners.insert(spec.id.clone(), pipeline_id);
        record.specs.insert(spec.id.clone(), spec);
    }

    /// Mark the workflow of a freshly claimed task as running.
    pub fn start(
        &mut self,
        task: &TaskId,
        agent: AgentId,
        now: DateTime<Utc>,
        events: &mut Vec<StatusEvent>,
    ) {
        let Some((pipeline_id, workflow)) = self.workflow_mut(task) else {
            return;
        };

        let old = workflow.status;
        workflow.status = RunStatus::Running;
        workflow.agent_id = Some(agent);
        workflow.started_at = Some(now);
        workflow.finished_at = None;
        events.push(StatusEvent::workflow(
            pipeline_id,
            task,
            Some(old),
            RunStatus::Running,
            now,
        ));

        self.refresh(pipeline_id, now, events);
    }

    /// Close a workflow. Steps that never started are skipped and steps still
    /// running take the workflow's final status.
    pub fn finish(
        &mut self,
        task: &TaskId,
        status: RunStatus,
        error: Option<TaskError>,
        now: DateTime<Utc>,
        events: &mut Vec<StatusEvent>,
    ) {
        let Some((pipeline_id, workflow)) = self.workflow_mut(task) else {
            return;
        };

        for step in &mut workflow.steps {
            let next = match step.status {
                RunStatus::Pending => RunStatus::Skipped,
                RunStatus::Running => status,
                _ => continue,
            };
            let old = step.status;
            step.status = next;
            step.finished_at = Some(now);
            events.push(StatusEvent::step(
                pipeline_id,
                task,
                &step.id,
                Some(old),
                next,
                now,
            ));
        }

        let old = workflow.status;
        workflow.status = status;
        workflow.error = error;
        workflow.finished_at = Some(now);
        events.push(StatusEvent::workflow(
            pipeline_id,
            task,
            Some(old),
            status,
            now,
        ));
        debug!(task_id = %task, status = %status, "Workflow finished");

        self.refresh(pipeline_id, now, events);
    }

    /// Put a workflow back to pending with all of its steps, after a lost
    /// lease or an administrative requeue. The caller refreshes the pipeline
    /// aggregate once all resets of a batch are applied.
    pub fn reset(&mut self, task: &TaskId, now: DateTime<Utc>, events: &mut Vec<StatusEvent>) {
        let Some((pipeline_id, workflow)) = self.workflow_mut(task) else {
            return;
        };

        for step in &mut workflow.steps {
            if step.status == RunStatus::Pending {
                continue;
            }
            let old = step.status;
            step.status = RunStatus::Pending;
            step.exit_code = None;
            step.error = None;
            step.started_at = None;
            step.finished_at = None;
            events.push(StatusEvent::step(
                pipeline_id,
                task,
                &step.id,
                Some(old),
                RunStatus::Pending,
                now,
            ));
        }

        workflow.agent_id = None;
        workflow.error = None;
        workflow.started_at = None;
        workflow.finished_at = None;
        if workflow.status != RunStatus::Pending {
            let old = workflow.status;
            workflow.status = RunStatus::Pending;
            events.push(StatusEvent::workflow(
                pipeline_id,
                task,
                Some(old),
                RunStatus::Pending,
                now,
            ));
        }
    }

    /// Apply a step update streamed by the agent. Steps not declared up front
    /// are appended in report order.
    pub fn report_step(
        &mut self,
        task: &TaskId,
        report: &StepReport,
        now: DateTime<Utc>,
        events: &mut Vec<StatusEvent>,
    ) {
        let Some((pipeline_id, workflow)) = self.workflow_mut(task) else {
            return;
        };

        let index = match workflow.steps.iter().position(|s| s.id == report.step_id) {
            Some(index) => index,
            None => {
                workflow.steps.push(Step {
                    id: report.step_id.clone(),
                    name: report.step_id.to_string(),
                    allow_failure: false,
                    status: RunStatus::Pending,
                    exit_code: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                });
                workflow.steps.len() - 1
            }
        };
        let step = &mut workflow.steps[index];

        if report.exit_code.is_some() {
            step.exit_code = report.exit_code;
        }
        if report.error.is_some() {
            step.error.clone_from(&report.error);
        }
        if step.status == report.status {
            return;
        }

        let old = step.status;
        step.status = report.status;
        if report.status == RunStatus::Running || report.status.is_terminal() {
            step.started_at.get_or_insert(now);
        }
        if report.status.is_terminal() {
            step.finished_at = Some(now);
        }
        events.push(StatusEvent::step(
            pipeline_id,
            task,
            &step.id,
            Some(old),
            report.status,
            now,
        ));
    }

    /// First step that failed without being allowed to.
    pub fn failed_step(&self, task: &TaskId) -> Option<StepId> {
        let pipeline = self.owners.get(task)?;
        self.records
            .get(pipeline)?
            .pipeline
            .workflow(task)?
            .steps
            .iter()
            .find(|s| s.status == RunStatus::Failure && !s.allow_failure)
            .map(|s| s.id.clone())
    }

    fn workflow_mut(&mut self, task: &TaskId) -> Option<(PipelineId, &mut Workflow)> {
        let pipeline_id = *self.owners.get(task)?;
        let workflow = self
            .records
            .get_mut(&pipeline_id)?
            .pipeline
            .workflows
            .iter_mut()
            .find(|w| &w.task_id == task)?;
        Some((pipeline_id, workflow))
    }

    /// Recompute a pipeline's aggregate status and emit the change, if any.
    pub fn refresh(
        &mut self,
        pipeline_id: PipelineId,
        now: DateTime<Utc>,
        events: &mut Vec<StatusEvent>,
    ) {
        let Some(record) = self.records.get_mut(&pipeline_id) else {
            return;
        };
        let pipeline = &mut record.pipeline;

        let next = aggregate_status(&pipeline.workflows);
        if next == pipeline.status {
            return;
        }

        let old = pipeline.status;
        pipeline.status = next;
        if next != RunStatus::Pending && pipeline.started_at.is_none() {
            pipeline.started_at = Some(now);
        }
        pipeline.finished_at = next.is_terminal().then_some(now);
        events.push(StatusEvent::pipeline(pipeline_id, Some(old), next, now));

        if next.is_terminal() {
            info!(pipeline_id = %pipeline_id, status = %next, "Pipeline finished");
            self.retire(pipeline_id);
        } else {
            debug!(pipeline_id = %pipeline_id, status = %next, "Pipeline status changed");
        }
    }

    /// Track a finished pipeline and drop the oldest ones beyond the history
    /// limit. Pipelines reopened by a requeue are kept.
    fn retire(&mut self, pipeline_id: PipelineId) {
        if !self.finished.contains(&pipeline_id) {
            self.finished.push_back(pipeline_id);
        }

        while self.finished.len() > self.history_limit {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            let still_finished = self
                .records
                .get(&oldest)
                .is_some_and(|r| r.pipeline.status.is_terminal());
            if !still_finished {
                continue;
            }
            if let Some(record) = self.records.remove(&oldest) {
                for task in record.specs.keys() {
                    self.owners.remove(task);
                }
                debug!(pipeline_id = %oldest, "Pipeline dropped from history");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::events::EntityType;
    use conveyor_core::task::StepSpec;
    use pretty_assertions::assert_eq;

    fn workflow(id: &str, status: RunStatus) -> Workflow {
        let mut w = Workflow::from_spec(&TaskSpec::new(id, PipelineId::new()));
        w.status = status;
        w
    }

    #[test]
    fn test_aggregate_status() {
        use RunStatus::*;
        let agg = |statuses: &[RunStatus]| {
            let ws: Vec<_> = statuses.iter().map(|s| workflow("w", *s)).collect();
            aggregate_status(&ws)
        };

        assert_eq!(agg(&[]), Pending);
        assert_eq!(agg(&[Pending, Pending]), Pending);
        assert_eq!(agg(&[Success, Pending]), Running);
        assert_eq!(agg(&[Success, Success]), Success);
        assert_eq!(agg(&[Success, Failure, Skipped]), Failure);
        assert_eq!(agg(&[Failure, Cancelled]), Cancelled);
        assert_eq!(agg(&[Success, Skipped]), Success);
        assert_eq!(agg(&[Skipped, Skipped]), Skipped);
    }

    #[test]
    fn test_finish_skips_unstarted_steps() {
        let pipeline = PipelineId::new();
        let mut book = PipelineBook::new(10);
        let mut events = Vec::new();
        let now = Utc::now();
        let spec = TaskSpec::new("build", pipeline)
            .with_step(StepSpec::new("clone", "clone"))
            .with_step(StepSpec::new("compile", "compile"))
            .with_step(StepSpec::new("publish", "publish"));
        let task = spec.id.clone();

        book.admit(spec, now, &mut events);
        book.start(&task, AgentId::new(), now, &mut events);
        book.report_step(
            &task,
            &StepReport::new("clone", RunStatus::Success).with_exit_code(0),
            now,
            &mut events,
        );
        book.report_step(&task, &StepReport::new("compile", RunStatus::Running), now, &mut events);
        events.clear();

        book.finish(
            &task,
            RunStatus::Cancelled,
            Some(TaskError::Cancelled {
                reason: "user".into(),
            }),
            now,
            &mut events,
        );

        let statuses: Vec<_> = book
            .steps(&pipeline)
            .unwrap()
            .into_iter()
            .map(|l| (l.step, l.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("clone".to_string(), RunStatus::Success),
                ("compile".to_string(), RunStatus::Cancelled),
                ("publish".to_string(), RunStatus::Skipped),
            ]
        );

        let kinds: Vec<_> = events.iter().map(|e| e.entity_type).collect();
        assert_eq!(
            kinds,
            vec![
                EntityType::Step,
                EntityType::Step,
                EntityType::Workflow,
                EntityType::Pipeline
            ]
        );
        assert_eq!(book.pipeline(&pipeline).unwrap().status, RunStatus::Cancelled);
    }

    #[test]
    fn test_unknown_step_is_appended() {
        let pipeline = PipelineId::new();
        let mut book = PipelineBook::new(10);
        let mut events = Vec::new();
        let now = Utc::now();
        book.admit(TaskSpec::new("lint", pipeline), now, &mut events);

        let task = TaskId::from("lint");
        book.report_step(&task, &StepReport::new("clippy", RunStatus::Failure), now, &mut events);

        assert_eq!(book.failed_step(&task), Some(StepId::from("clippy")));
        let listing = book.steps(&pipeline).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].position, 1);
        assert_eq!(listing[0].workflow, "lint");
    }

    #[test]
    fn test_allowed_failure_is_not_a_failed_step() {
        let pipeline = PipelineId::new();
        let mut book = PipelineBook::new(10);
        let mut events = Vec::new();
        let now = Utc::now();
        book.admit(
            TaskSpec::new("test", pipeline).with_step(StepSpec::new("flaky", "flaky").allow_failure()),
            now,
            &mut events,
        );

        let task = TaskId::from("test");
        book.report_step(&task, &StepReport::new("flaky", RunStatus::Failure), now, &mut events);
        assert_eq!(book.failed_step(&task), None);
    }

    #[test]
    fn test_history_limit_drops_oldest_finished_pipeline() {
        let mut book = PipelineBook::new(1);
        let mut events = Vec::new();
        let now = Utc::now();
        let first = PipelineId::new();
        let second = PipelineId::new();

        book.admit(TaskSpec::new("a", first), now, &mut events);
        book.admit(TaskSpec::new("b", second), now, &mut events);
        book.finish(&TaskId::from("a"), RunStatus::Success, None, now, &mut events);
        assert!(book.pipeline(&first).is_some());

        book.finish(&TaskId::from("b"), RunStatus::Success, None, now, &mut events);
        assert!(book.pipeline(&first).is_none());
        assert!(!book.contains_task(&TaskId::from("a")));
        assert!(book.pipeline(&second).is_some());
    }

    #[test]
    fn test_reset_reopens_pipeline() {
        let pipeline = PipelineId::new();
        let mut book = PipelineBook::new(10);
        let mut events = Vec::new();
        let now = Utc::now();
        let task = TaskId::from("deploy");

        book.admit(TaskSpec::new("deploy", pipeline), now, &mut events);
        book.finish(&task, RunStatus::Failure, None, now, &mut events);
        assert_eq!(book.pipeline(&pipeline).unwrap().status, RunStatus::Failure);

        book.reset(&task, now, &mut events);
        book.refresh(pipeline, now, &mut events);
        let snapshot = book.pipeline(&pipeline).unwrap();
        assert_eq!(snapshot.status, RunStatus::Pending);
        assert_eq!(snapshot.finished_at, None);
        assert_eq!(book.workflow_status(&task), Some(RunStatus::Pending));
    }
}
