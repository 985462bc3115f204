//! Queue state guarded by the task queue's lock.
//!
//! Every method here runs with the lock held and never awaits. Status events
//! are buffered in an outbox and handed to the sink before the lock is
//! released, so the sink observes transitions in the order they happened.

use crate::agents::{AgentSession, AgentSessions};
use crate::config::SchedulerConfig;
use crate::dag::admission_order;
use crate::lease::SweepReport;
use crate::matcher::LabelFilter;
use crate::workflow::PipelineBook;
use chrono::{DateTime, Duration, Utc};
use conveyor_core::events::StatusEvent;
use conveyor_core::ids::{AgentId, PipelineId, TaskId};
use conveyor_core::pipeline::{RunStatus, StepReport};
use conveyor_core::ports::StatusSink;
use conveyor_core::task::{Labels, Task, TaskError, TaskResult, TaskSpec, TaskStatus};
use conveyor_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot counts of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub pending: usize,
    pub waiting_on_dependency: usize,
    pub running: usize,
    pub agents: usize,
    pub paused: bool,
}

/// A non-terminal task and its bookkeeping.
#[derive(Debug)]
struct Entry {
    task: Task,
    /// Enqueue position; a requeued task keeps it.
    seq: u64,
    unresolved: HashSet<TaskId>,
    /// Agents whose claim on this task was reclaimed.
    lost_claims: HashSet<AgentId>,
}

pub(crate) struct QueueState {
    tasks: HashMap<TaskId, Entry>,
    pending: BTreeMap<u64, TaskId>,
    next_seq: u64,
    book: PipelineBook,
    agents: AgentSessions,
    paused: bool,
    config: SchedulerConfig,
    lease_duration: Duration,
    session_timeout: Duration,
    outbox: Vec<StatusEvent>,
    sink: Arc<dyn StatusSink>,
    /// First terminal status each registered waiter has yet to observe,
    /// kept even after history drops the task.
    watchers: HashMap<TaskId, HashMap<u64, Option<TaskStatus>>>,
    next_watcher: u64,
}

impl QueueState {
    pub fn new(config: SchedulerConfig, sink: Arc<dyn StatusSink>) -> Result<Self> {
        config.validate()?;
        let lease_duration = Duration::from_std(config.lease_duration())
            .map_err(|e| Error::Config(format!("lease_duration_ms: {e}")))?;
        let session_timeout = Duration::from_std(config.agent_session_timeout())
            .map_err(|e| Error::Config(format!("agent_session_timeout_secs: {e}")))?;

        Ok(Self {
            tasks: HashMap::new(),
            pending: BTreeMap::new(),
            next_seq: 0,
            book: PipelineBook::new(config.history_limit),
            agents: AgentSessions::default(),
            paused: false,
            config,
            lease_duration,
            session_timeout,
            outbox: Vec::new(),
            sink,
            watchers: HashMap::new(),
            next_watcher: 0,
        })
    }

    /// Hand buffered events to the sink.
    pub fn flush(&mut self) {
        for event in self.outbox.drain(..) {
            self.sink.emit(event);
        }
    }

    fn emit_task(&mut self, task: &Task, old: Option<TaskStatus>, now: DateTime<Utc>) {
        self.outbox.push(StatusEvent::task(
            task.pipeline_id,
            &task.id,
            old,
            task.status,
            now,
        ));
    }

    /// Admit a batch of tasks atomically. Returns the initial status of each
    /// task in input order.
    pub fn push_all(&mut self, mut specs: Vec<TaskSpec>, now: DateTime<Utc>) -> Result<Vec<TaskStatus>> {
        let mut batch: HashMap<&TaskId, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if batch.insert(&spec.id, i).is_some() || self.book.contains_task(&spec.id) {
                return Err(Error::DuplicateId(spec.id.clone()));
            }
        }

        for spec in &specs {
            for dependency in &spec.dependencies {
                let same_pipeline = match batch.get(dependency) {
                    Some(&i) => specs[i].pipeline_id == spec.pipeline_id,
                    None => self.book.owner(dependency) == Some(spec.pipeline_id),
                };
                if !same_pipeline {
                    return Err(Error::UnknownDependency {
                        task: spec.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let order = admission_order(&specs, |id| self.book.contains_task(id))?;
        drop(batch);

        // Resolve initial statuses in dependency order.
        let mut statuses: Vec<(TaskStatus, HashSet<TaskId>, Option<TaskId>)> =
            vec![(TaskStatus::Pending, HashSet::new(), None); specs.len()];
        let index: HashMap<TaskId, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        for &i in &order {
            let mut unresolved = HashSet::new();
            let mut failed_upstream = None;
            for dependency in &specs[i].dependencies {
                let resolved = match index.get(dependency) {
                    Some(&j) => match statuses[j].0 {
                        TaskStatus::Skipped => Some(false),
                        _ => None,
                    },
                    None if self.tasks.contains_key(dependency) => None,
                    None => match self.book.workflow_status(dependency) {
                        Some(RunStatus::Success) => Some(true),
                        _ => Some(false),
                    },
                };
                match resolved {
                    Some(true) => {}
                    Some(false) => {
                        failed_upstream.get_or_insert_with(|| dependency.clone());
                    }
                    None => {
                        unresolved.insert(dependency.clone());
                    }
                }
            }

            let status = if failed_upstream.is_some() {
                TaskStatus::Skipped
            } else if unresolved.is_empty() {
                TaskStatus::Pending
            } else {
                TaskStatus::WaitingOnDependency
            };
            statuses[i] = (status, unresolved, failed_upstream);
        }

        for spec in &mut specs {
            if spec.labels.is_empty() {
                spec.labels.clone_from(&self.config.default_labels);
            }
        }

        let mut touched: Vec<PipelineId> = Vec::new();
        let mut result = Vec::with_capacity(specs.len());
        for (spec, (status, unresolved, failed_upstream)) in specs.into_iter().zip(statuses) {
            if !touched.contains(&spec.pipeline_id) {
                touched.push(spec.pipeline_id);
            }
            result.push(status);
            self.book.admit(spec.clone(), now, &mut self.outbox);

            let seq = self.next_seq;
            self.next_seq += 1;
            let task = Task::from_spec(spec, status, now);
            self.emit_task(&task, None, now);
            debug!(task_id = %task.id, pipeline_id = %task.pipeline_id, status = %status, "Task pushed");

            if let Some(dependency) = failed_upstream {
                self.book.finish(
                    &task.id,
                    RunStatus::Skipped,
                    Some(TaskError::UpstreamFailed { dependency }),
                    now,
                    &mut self.outbox,
                );
                continue;
            }

            if status == TaskStatus::Pending {
                self.pending.insert(seq, task.id.clone());
            }
            self.tasks.insert(
                task.id.clone(),
                Entry {
                    task,
                    seq,
                    unresolved,
                    lost_claims: HashSet::new(),
                },
            );
        }

        for pipeline in touched {
            self.book.refresh(pipeline, now, &mut self.outbox);
        }

        Ok(result)
    }

    /// Claim the oldest pending task the filter accepts.
    pub fn pop(
        &mut self,
        agent: AgentId,
        filter: &LabelFilter,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        if self.paused {
            return Ok(None);
        }
        if let Some(session) = self.agents.get(&agent) {
            if !session.has_capacity() {
                return Err(Error::AgentAtCapacity {
                    agent,
                    limit: session.concurrency,
                });
            }
        }

        let Some((seq, id)) = self
            .pending
            .iter()
            .find(|(_, id)| {
                self.tasks
                    .get(*id)
                    .is_some_and(|e| filter.accepts(&e.task.labels))
            })
            .map(|(seq, id)| (*seq, id.clone()))
        else {
            return Ok(None);
        };
        self.pending.remove(&seq);

        let Some(entry) = self.tasks.get_mut(&id) else {
            return Err(Error::Internal(format!("pending task {id} has no entry")));
        };
        let task = &mut entry.task;
        task.status = TaskStatus::Running;
        task.claimed_at = Some(now);
        task.lease_expires_at = Some(now + self.lease_duration);
        task.claimed_by = Some(agent);
        let claimed = task.clone();

        self.emit_task(&claimed, Some(TaskStatus::Pending), now);
        self.book.start(&id, agent, now, &mut self.outbox);
        self.agents.attach(agent, &id);
        self.agents.touch(agent, now);

        info!(task_id = %id, agent_id = %agent, requeues = claimed.requeues, "Task claimed");
        Ok(Some(claimed))
    }

    fn check_claim(&self, id: &TaskId, agent: AgentId) -> Result<&Entry> {
        let entry = self
            .tasks
            .get(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        if entry.task.is_claimed_by(agent) {
            Ok(entry)
        } else if entry.lost_claims.contains(&agent) {
            Err(Error::Expired {
                task: id.clone(),
                agent,
            })
        } else {
            Err(Error::NotOwner {
                task: id.clone(),
                agent,
            })
        }
    }

    /// Completion reported by the claim holder.
    pub fn done(
        &mut self,
        id: &TaskId,
        agent: AgentId,
        result: TaskResult,
        steps: &[StepReport],
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        self.check_claim(id, agent)?;

        for report in steps {
            self.book.report_step(id, report, now, &mut self.outbox);
        }

        let (status, error) = match result {
            TaskResult::Failure { message } => {
                (TaskStatus::Failure, Some(TaskError::Reported { message }))
            }
            TaskResult::Success => match self.book.failed_step(id) {
                Some(step) => (TaskStatus::Failure, Some(TaskError::StepFailed { step })),
                None => (TaskStatus::Success, None),
            },
        };

        self.agents.touch(agent, now);
        self.settle(id, status, error, now);
        Ok(status)
    }

    /// Streamed step progress; does not touch the claim.
    pub fn report_step(
        &mut self,
        id: &TaskId,
        agent: AgentId,
        report: &StepReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_claim(id, agent)?;
        self.book.report_step(id, report, now, &mut self.outbox);
        self.agents.touch(agent, now);
        Ok(())
    }

    /// Move a task to a terminal status and propagate to its dependents.
    fn settle(
        &mut self,
        root: &TaskId,
        status: TaskStatus,
        error: Option<TaskError>,
        now: DateTime<Utc>,
    ) {
        let mut work = VecDeque::from([(root.clone(), status, error)]);

        while let Some((id, status, error)) = work.pop_front() {
            let Some(mut entry) = self.tasks.remove(&id) else {
                continue;
            };
            self.pending.remove(&entry.seq);
            if let Some(agent) = entry.task.claimed_by {
                self.agents.detach(agent, &id);
            }

            let old = entry.task.status;
            entry.task.status = status;
            if let Some(waiters) = self.watchers.get_mut(&id) {
                for seen in waiters.values_mut() {
                    seen.get_or_insert(status);
                }
            }
            entry.task.error.clone_from(&error);
            entry.task.release_claim();
            self.emit_task(&entry.task, Some(old), now);

            match &error {
                Some(err) if status != TaskStatus::Skipped => {
                    info!(task_id = %id, status = %status, error = %err, "Task finished")
                }
                _ => info!(task_id = %id, status = %status, "Task finished"),
            }

            self.book
                .finish(&id, RunStatus::from(status), error, now, &mut self.outbox);

            for dependent in self.book.dependents(&id) {
                if status != TaskStatus::Success {
                    if self.tasks.contains_key(&dependent) {
                        work.push_back((
                            dependent,
                            TaskStatus::Skipped,
                            Some(TaskError::UpstreamFailed {
                                dependency: id.clone(),
                            }),
                        ));
                    }
                    continue;
                }

                let Some(waiting) = self.tasks.get_mut(&dependent) else {
                    continue;
                };
                waiting.unresolved.remove(&id);
                if waiting.unresolved.is_empty()
                    && waiting.task.status == TaskStatus::WaitingOnDependency
                {
                    waiting.task.status = TaskStatus::Pending;
                    self.pending.insert(waiting.seq, dependent.clone());
                    let promoted = waiting.task.clone();
                    self.emit_task(&promoted, Some(TaskStatus::WaitingOnDependency), now);
                    debug!(task_id = %dependent, "Dependencies resolved");
                }
            }
        }
    }

    /// Administrative cancellation. Evicting a task that already finished is
    /// a no-op.
    pub fn evict(&mut self, id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.tasks.contains_key(id) {
            self.cancel(id, reason, now);
            Ok(())
        } else if self.book.contains_task(id) {
            Ok(())
        } else {
            Err(Error::UnknownTask(id.clone()))
        }
    }

    fn cancel(&mut self, id: &TaskId, reason: &str, now: DateTime<Utc>) {
        if self.tasks.contains_key(id) {
            self.settle(
                id,
                TaskStatus::Cancelled,
                Some(TaskError::Cancelled {
                    reason: reason.to_string(),
                }),
                now,
            );
        }
    }

    /// Cancel a set of tasks; dependents are cancelled before the tasks they
    /// depend on so that none of them ends up skipped.
    pub fn evict_all(&mut self, ids: &[TaskId], reason: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(unknown) = ids.iter().find(|id| !self.book.contains_task(id)) {
            return Err(Error::UnknownTask(unknown.clone()));
        }

        // Finishing one pipeline may drop an older one from history, so ids
        // are only checked up front.
        for id in self.book.dependents_first(ids) {
            self.cancel(&id, reason, now);
        }
        Ok(())
    }

    pub fn cancel_pipeline(
        &mut self,
        pipeline: &PipelineId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ids = self
            .book
            .pipeline_tasks(pipeline)
            .ok_or(Error::UnknownPipeline(*pipeline))?;
        info!(pipeline_id = %pipeline, reason, "Cancelling pipeline");
        self.evict_all(&ids, reason, now)
    }

    /// Refresh the lease of the claim holder. Returns the new deadline.
    pub fn extend(&mut self, id: &TaskId, agent: AgentId, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.check_claim(id, agent)?;
        let deadline = now + self.lease_duration;
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.task.lease_expires_at = Some(deadline);
        }
        self.agents.touch(agent, now);
        debug!(task_id = %id, agent_id = %agent, "Lease extended");
        Ok(deadline)
    }

    /// Reclaim expired leases and drop idle agent sessions.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut expired: Vec<(u64, TaskId)> = self
            .tasks
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Running
                    && e.task.lease_expires_at.is_some_and(|deadline| deadline <= now)
            })
            .map(|e| (e.seq, e.task.id.clone()))
            .collect();
        expired.sort();

        let mut report = SweepReport::default();
        for (seq, id) in expired {
            let Some(entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            let agent = entry.task.claimed_by;
            if let Some(agent) = agent {
                entry.lost_claims.insert(agent);
            }
            let requeues = entry.task.requeues;

            if requeues >= self.config.max_requeues {
                warn!(task_id = %id, requeues, "Lease expired, agent lost");
                self.settle(&id, TaskStatus::Failure, Some(TaskError::AgentLost { requeues }), now);
                report.lost.push(id);
                continue;
            }

            entry.task.requeues += 1;
            entry.task.reset_to_pending();
            let task = entry.task.clone();
            if let Some(agent) = agent {
                self.agents.detach(agent, &id);
            }
            self.pending.insert(seq, id.clone());
            self.emit_task(&task, Some(TaskStatus::Running), now);
            self.book.reset(&id, now, &mut self.outbox);
            self.book.refresh(task.pipeline_id, now, &mut self.outbox);
            warn!(task_id = %id, requeues = task.requeues, "Lease expired, task requeued");
            report.requeued.push(id);
        }

        report.dropped_agents = self.agents.expire(now, self.session_timeout);
        report
    }

    /// Administrative re-push. A running task loses its claim and goes back
    /// to pending; a failed, cancelled, or skipped task is revived together
    /// with the dependents that were skipped because of it.
    pub fn requeue(&mut self, id: &TaskId, now: DateTime<Utc>) -> Result<TaskStatus> {
        if let Some(entry) = self.tasks.get_mut(id) {
            if entry.task.status != TaskStatus::Running {
                return Ok(entry.task.status);
            }
            let agent = entry.task.claimed_by;
            if let Some(agent) = agent {
                entry.lost_claims.insert(agent);
            }
            entry.task.reset_to_pending();
            let task = entry.task.clone();
            let seq = entry.seq;
            if let Some(agent) = agent {
                self.agents.detach(agent, id);
            }
            self.pending.insert(seq, id.clone());
            self.emit_task(&task, Some(TaskStatus::Running), now);
            self.book.reset(id, now, &mut self.outbox);
            self.book.refresh(task.pipeline_id, now, &mut self.outbox);
            info!(task_id = %id, "Running task requeued");
            return Ok(TaskStatus::Pending);
        }

        let status = self
            .book
            .workflow_status(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        if status == RunStatus::Success {
            return Err(Error::InvalidRequeue {
                task: id.clone(),
                reason: "task already succeeded".into(),
            });
        }
        let unresolved = match self.revivable(id) {
            Ok(unresolved) => unresolved,
            Err(dependency) => {
                return Err(Error::InvalidRequeue {
                    task: id.clone(),
                    reason: format!("dependency {dependency} did not succeed"),
                });
            }
        };

        let revived = self.revive(id, unresolved, now)?;

        // Bring back dependents skipped by the earlier failure.
        let mut candidates: Vec<TaskId> = self
            .book
            .transitive_dependents(id)
            .into_iter()
            .filter(|d| self.book.workflow_status(d) == Some(RunStatus::Skipped))
            .collect();
        loop {
            let before = candidates.len();
            let mut remaining = Vec::with_capacity(candidates.len());
            for candidate in candidates {
                match self.revivable(&candidate) {
                    Ok(unresolved) => {
                        self.revive(&candidate, unresolved, now)?;
                    }
                    Err(_) => remaining.push(candidate),
                }
            }
            candidates = remaining;
            if candidates.len() == before {
                break;
            }
        }

        if let Some(pipeline) = self.book.owner(id) {
            self.book.refresh(pipeline, now, &mut self.outbox);
        }
        Ok(revived)
    }

    /// Dependencies still open, or the first one that finished without
    /// success.
    fn revivable(&self, id: &TaskId) -> std::result::Result<HashSet<TaskId>, TaskId> {
        let Some(spec) = self.book.spec(id) else {
            return Ok(HashSet::new());
        };
        let mut unresolved = HashSet::new();
        for dependency in &spec.dependencies {
            if self.tasks.contains_key(dependency) {
                unresolved.insert(dependency.clone());
            } else if self.book.workflow_status(dependency) != Some(RunStatus::Success) {
                return Err(dependency.clone());
            }
        }
        Ok(unresolved)
    }

    fn revive(
        &mut self,
        id: &TaskId,
        unresolved: HashSet<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus> {
        let spec = self
            .book
            .spec(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        let old = self
            .book
            .workflow_status(id)
            .and_then(|s| s.as_terminal_task_status());
        let status = if unresolved.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::WaitingOnDependency
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let task = Task::from_spec(spec, status, now);
        self.emit_task(&task, old, now);
        self.book.reset(id, now, &mut self.outbox);
        if status == TaskStatus::Pending {
            self.pending.insert(seq, id.clone());
        }
        self.tasks.insert(
            id.clone(),
            Entry {
                task,
                seq,
                unresolved,
                lost_claims: HashSet::new(),
            },
        );

        info!(task_id = %id, status = %status, "Task requeued");
        Ok(status)
    }

    /// Current status of a live or recently finished task.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        match self.tasks.get(id) {
            Some(entry) => Some(entry.task.status),
            None => self
                .book
                .workflow_status(id)
                .and_then(|s| s.as_terminal_task_status()),
        }
    }

    /// Register a waiter on `id`. Returns its key.
    pub fn watch(&mut self, id: &TaskId) -> Result<u64> {
        let status = self
            .status(id)
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;
        let key = self.next_watcher;
        self.next_watcher += 1;
        self.watchers
            .entry(id.clone())
            .or_default()
            .insert(key, status.is_terminal().then_some(status));
        Ok(key)
    }

    pub fn unwatch(&mut self, id: &TaskId, key: u64) {
        if let Some(waiters) = self.watchers.get_mut(id) {
            waiters.remove(&key);
            if waiters.is_empty() {
                self.watchers.remove(id);
            }
        }
    }

    /// Terminal status the waiter `key` should see, if the task finished
    /// since it registered.
    pub fn watched_status(&self, id: &TaskId, key: u64) -> Option<TaskStatus> {
        self.watchers
            .get(id)
            .and_then(|waiters| waiters.get(&key).copied().flatten())
            .or_else(|| self.status(id).filter(|s| s.is_terminal()))
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.get(id).map(|e| e.task.clone())
    }

    pub fn book(&self) -> &PipelineBook {
        &self.book
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            self.paused = paused;
            info!(paused, "Dispatch {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn info(&self) -> QueueInfo {
        let mut info = QueueInfo {
            agents: self.agents.len(),
            paused: self.paused,
            ..QueueInfo::default()
        };
        for entry in self.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending => info.pending += 1,
                TaskStatus::WaitingOnDependency => info.waiting_on_dependency += 1,
                TaskStatus::Running => info.running += 1,
                _ => {}
            }
        }
        info
    }

    /// Open or refresh an agent session; returns its kick token.
    pub fn connect(
        &mut self,
        agent: AgentId,
        labels: &Labels,
        concurrency: usize,
        now: DateTime<Utc>,
    ) -> CancellationToken {
        self.agents.connect(agent, labels, concurrency, now).kicked()
    }

    pub fn begin_poll(&mut self, agent: AgentId) {
        self.agents.begin_poll(agent);
    }

    pub fn end_poll(&mut self, agent: AgentId, now: DateTime<Utc>) {
        self.agents.end_poll(agent, now);
    }

    pub fn disconnect(&mut self, agent: &AgentId) -> Option<AgentSession> {
        self.agents.remove(agent)
    }

    pub fn agents(&self) -> Vec<AgentSession> {
        self.agents.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelStatusSink;
    use conveyor_core::events::EntityType;
    use pretty_assertions::assert_eq;

    fn state(config: SchedulerConfig) -> (QueueState, tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) {
        let (sink, rx) = ChannelStatusSink::new();
        (QueueState::new(config, Arc::new(sink)).unwrap(), rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_duplicate_id_rejects_whole_batch() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        state.push_all(vec![TaskSpec::new("a", p)], now).unwrap();

        let err = state
            .push_all(vec![TaskSpec::new("b", p), TaskSpec::new("a", p)], now)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateId(id) if id.as_str() == "a"));
        assert_eq!(state.status(&TaskId::from("b")), None);
    }

    #[test]
    fn test_cross_pipeline_dependency_is_unknown() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let now = Utc::now();
        let first = PipelineId::new();
        state.push_all(vec![TaskSpec::new("a", first)], now).unwrap();

        let err = state
            .push_all(vec![TaskSpec::new("b", PipelineId::new()).depends_on("a")], now)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn test_default_labels_apply_to_unlabelled_tasks() {
        let mut defaults = conveyor_core::task::Labels::new();
        defaults.insert("platform".into(), "linux/amd64".into());
        let (mut state, _rx) = state(SchedulerConfig::default().with_default_labels(defaults));
        let p = PipelineId::new();
        let now = Utc::now();

        state
            .push_all(
                vec![
                    TaskSpec::new("plain", p),
                    TaskSpec::new("arm", p).with_label("platform", "linux/arm64"),
                ],
                now,
            )
            .unwrap();

        assert_eq!(
            state.task(&TaskId::from("plain")).unwrap().labels["platform"],
            "linux/amd64"
        );
        assert_eq!(
            state.task(&TaskId::from("arm")).unwrap().labels["platform"],
            "linux/arm64"
        );
    }

    #[test]
    fn test_pop_respects_capacity() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        let agent = AgentId::new();
        state
            .push_all(vec![TaskSpec::new("a", p), TaskSpec::new("b", p)], now)
            .unwrap();

        state.connect(agent, &Default::default(), 1, now);
        assert!(state.pop(agent, &LabelFilter::default(), now).unwrap().is_some());
        let err = state.pop(agent, &LabelFilter::default(), now).unwrap_err();
        assert!(matches!(err, Error::AgentAtCapacity { limit: 1, .. }));
    }

    #[test]
    fn test_done_emits_task_workflow_and_pipeline_events() {
        let (mut state, mut rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        let agent = AgentId::new();
        state.push_all(vec![TaskSpec::new("a", p)], now).unwrap();
        state.pop(agent, &LabelFilter::default(), now).unwrap();
        state.flush();
        drain(&mut rx);

        state
            .done(&TaskId::from("a"), agent, TaskResult::Success, &[], now)
            .unwrap();
        state.flush();

        let seen: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|e| (e.entity_type, e.old_status, e.new_status))
            .collect();
        assert_eq!(
            seen,
            vec![
                (EntityType::Task, Some("running".to_string()), "success".to_string()),
                (EntityType::Workflow, Some("running".to_string()), "success".to_string()),
                (EntityType::Pipeline, Some("running".to_string()), "success".to_string()),
            ]
        );
    }

    #[test]
    fn test_requeue_revives_skipped_dependents() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        let agent = AgentId::new();
        state
            .push_all(
                vec![
                    TaskSpec::new("a", p),
                    TaskSpec::new("b", p).depends_on("a"),
                    TaskSpec::new("c", p).depends_on("b"),
                ],
                now,
            )
            .unwrap();
        state.pop(agent, &LabelFilter::default(), now).unwrap();
        state
            .done(&TaskId::from("a"), agent, TaskResult::failure("exit 1"), &[], now)
            .unwrap();
        assert_eq!(state.status(&TaskId::from("c")), Some(TaskStatus::Skipped));

        assert_eq!(state.requeue(&TaskId::from("a"), now).unwrap(), TaskStatus::Pending);
        assert_eq!(
            state.status(&TaskId::from("b")),
            Some(TaskStatus::WaitingOnDependency)
        );
        assert_eq!(
            state.status(&TaskId::from("c")),
            Some(TaskStatus::WaitingOnDependency)
        );
        assert_eq!(
            state.book().pipeline(&p).unwrap().status,
            RunStatus::Pending
        );
    }

    #[test]
    fn test_requeue_of_successful_task_is_invalid() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        let agent = AgentId::new();
        state.push_all(vec![TaskSpec::new("a", p)], now).unwrap();
        state.pop(agent, &LabelFilter::default(), now).unwrap();
        state
            .done(&TaskId::from("a"), agent, TaskResult::Success, &[], now)
            .unwrap();

        let err = state.requeue(&TaskId::from("a"), now).unwrap_err();
        assert!(matches!(err, Error::InvalidRequeue { .. }));
    }

    #[test]
    fn test_running_requeue_invalidates_old_claim() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        let agent = AgentId::new();
        state.push_all(vec![TaskSpec::new("a", p)], now).unwrap();
        state.pop(agent, &LabelFilter::default(), now).unwrap();

        state.requeue(&TaskId::from("a"), now).unwrap();
        let err = state.extend(&TaskId::from("a"), agent, now).unwrap_err();
        assert!(matches!(err, Error::Expired { .. }));
    }

    #[test]
    fn test_info_counts() {
        let (mut state, _rx) = state(SchedulerConfig::default());
        let p = PipelineId::new();
        let now = Utc::now();
        state
            .push_all(
                vec![
                    TaskSpec::new("a", p),
                    TaskSpec::new("b", p),
                    TaskSpec::new("c", p).depends_on("a"),
                ],
                now,
            )
            .unwrap();
        state.pop(AgentId::new(), &LabelFilter::default(), now).unwrap();
        state.set_paused(true);

        assert_eq!(
            state.info(),
            QueueInfo {
                pending: 1,
                waiting_on_dependency: 1,
                running: 1,
                agents: 0,
                paused: true,
            }
        );
    }
}
