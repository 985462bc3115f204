//! The shared task queue.
//!
//! [`TaskQueue`] is a cheap-to-clone handle over one lock-protected
//! [`QueueState`]. Blocking calls park on a [`Notify`] that every mutation
//! broadcasts to, and re-evaluate their own condition when woken.

use crate::agents::AgentSession;
use crate::config::SchedulerConfig;
use crate::lease::SweepReport;
use crate::matcher::LabelFilter;
use crate::state::{QueueInfo, QueueState};
use chrono::{DateTime, Utc};
use conveyor_core::ids::{AgentId, PipelineId, TaskId};
use conveyor_core::pipeline::{Pipeline, StepListing, StepReport};
use conveyor_core::ports::StatusSink;
use conveyor_core::task::{Labels, Task, TaskResult, TaskSpec, TaskStatus};
use conveyor_core::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Runs `release` under the lock when dropped, so a blocking call undoes its
/// registration whether it returns or is abandoned.
struct Registration<'a, F: FnMut(&mut QueueState)> {
    queue: &'a TaskQueue,
    release: F,
}

impl<F: FnMut(&mut QueueState)> Drop for Registration<'_, F> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.queue.lock() {
            (self.release)(&mut state);
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

impl TaskQueue {
    /// Build an isolated queue reporting to `sink`.
    pub fn new(config: SchedulerConfig, sink: Arc<dyn StatusSink>) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::new(config, sink)?),
                notify: Notify::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| Error::Internal("task queue lock poisoned".into()))
    }

    /// Run `f` under the lock and flush its events before releasing it.
    fn locked<R>(&self, f: impl FnOnce(&mut QueueState) -> Result<R>) -> Result<R> {
        let mut state = self.lock()?;
        let result = f(&mut state);
        state.flush();
        result
    }

    /// Like [`locked`](Self::locked), then wake every parked waiter.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState) -> Result<R>) -> Result<R> {
        let result = self.locked(f);
        self.inner.notify.notify_waiters();
        result
    }

    pub fn push(&self, spec: TaskSpec) -> Result<TaskStatus> {
        let mut statuses = self.push_all(vec![spec])?;
        statuses
            .pop()
            .ok_or_else(|| Error::Internal("push admitted nothing".into()))
    }

    /// Admit a set of tasks at once; on any error none of them is admitted.
    pub fn push_all(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskStatus>> {
        self.mutate(|state| state.push_all(specs, Utc::now()))
    }

    /// Claim a matching task without waiting.
    pub fn try_pop(&self, agent: AgentId, filter: &LabelFilter) -> Result<Option<Task>> {
        self.locked(|state| state.pop(agent, filter, Utc::now()))
    }

    /// Claim the oldest pending task `filter` accepts, waiting until one
    /// appears. Returns `None` once `cancel` fires. Dropping the returned
    /// future also abandons the wait.
    pub async fn pop(
        &self,
        agent: AgentId,
        filter: &LabelFilter,
        cancel: &CancellationToken,
    ) -> Result<Option<Task>> {
        self.locked(|state| {
            state.begin_poll(agent);
            Ok(())
        })?;
        let _poll = Registration {
            queue: self,
            release: move |state: &mut QueueState| state.end_poll(agent, Utc::now()),
        };

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the state so a concurrent push
            // between the check and the await is not missed.
            notified.as_mut().enable();

            if let Some(task) = self.try_pop(agent, filter)? {
                return Ok(Some(task));
            }

            tokio::select! {
                _ = &mut notified => {
                    debug!(agent_id = %agent, "Pop woken");
                }
                _ = cancel.cancelled() => {
                    debug!(agent_id = %agent, "Pop cancelled");
                    return Ok(None);
                }
            }
        }
    }

    pub fn done(&self, id: &TaskId, agent: AgentId, result: TaskResult) -> Result<TaskStatus> {
        self.done_with_steps(id, agent, result, &[])
    }

    /// Completion together with the final step statuses.
    pub fn done_with_steps(
        &self,
        id: &TaskId,
        agent: AgentId,
        result: TaskResult,
        steps: &[StepReport],
    ) -> Result<TaskStatus> {
        self.mutate(|state| state.done(id, agent, result, steps, Utc::now()))
    }

    pub fn report_step(&self, id: &TaskId, agent: AgentId, report: &StepReport) -> Result<()> {
        self.locked(|state| state.report_step(id, agent, report, Utc::now()))
    }

    pub fn evict(&self, id: &TaskId, reason: &str) -> Result<()> {
        self.mutate(|state| state.evict(id, reason, Utc::now()))
    }

    /// Cancel a set of tasks under one lock acquisition.
    pub fn evict_all(&self, ids: &[TaskId], reason: &str) -> Result<()> {
        self.mutate(|state| state.evict_all(ids, reason, Utc::now()))
    }

    pub fn cancel_pipeline(&self, pipeline: &PipelineId, reason: &str) -> Result<()> {
        self.mutate(|state| state.cancel_pipeline(pipeline, reason, Utc::now()))
    }

    pub fn extend(&self, id: &TaskId, agent: AgentId) -> Result<DateTime<Utc>> {
        self.locked(|state| state.extend(id, agent, Utc::now()))
    }

    /// Reclaim leases that expired before `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.mutate(|state| Ok(state.sweep_expired(now)))
    }

    pub fn requeue(&self, id: &TaskId) -> Result<TaskStatus> {
        self.mutate(|state| state.requeue(id, Utc::now()))
    }

    /// Wait until the task reaches a terminal status. Returns `None` once
    /// `cancel` fires. The outcome is reported even if the task's pipeline
    /// has left the history by the time the waiter wakes.
    pub async fn wait(&self, id: &TaskId, cancel: &CancellationToken) -> Result<Option<TaskStatus>> {
        let key = self.locked(|state| state.watch(id))?;
        let _watch = Registration {
            queue: self,
            release: move |state: &mut QueueState| state.unwatch(id, key),
        };

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = self.lock()?.watched_status(id, key);
            if finished.is_some() {
                return Ok(finished);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// Status of a live or retained task; `None` if unknown.
    pub fn status(&self, id: &TaskId) -> Result<Option<TaskStatus>> {
        Ok(self.lock()?.status(id))
    }

    /// Snapshot of a task that has not finished yet.
    pub fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.lock()?.task(id))
    }

    pub fn pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.lock()?.book().pipeline(id).cloned())
    }

    pub fn steps(&self, id: &PipelineId) -> Result<Vec<StepListing>> {
        self.lock()?
            .book()
            .steps(id)
            .ok_or(Error::UnknownPipeline(*id))
    }

    pub fn info(&self) -> Result<QueueInfo> {
        Ok(self.lock()?.info())
    }

    pub fn pause(&self) -> Result<()> {
        self.locked(|state| {
            state.set_paused(true);
            Ok(())
        })
    }

    pub fn resume(&self) -> Result<()> {
        self.mutate(|state| {
            state.set_paused(false);
            Ok(())
        })
    }

    /// Open or refresh an agent session. The returned token fires when the
    /// session is dropped.
    pub fn connect(
        &self,
        agent: AgentId,
        labels: &Labels,
        concurrency: usize,
    ) -> Result<CancellationToken> {
        self.locked(|state| Ok(state.connect(agent, labels, concurrency, Utc::now())))
    }

    /// Drop an agent session. Its claims stay until their leases expire.
    pub fn disconnect(&self, agent: &AgentId) -> Result<Option<AgentSession>> {
        self.locked(|state| Ok(state.disconnect(agent)))
    }

    pub fn agents(&self) -> Result<Vec<AgentSession>> {
        Ok(self.lock()?.agents())
    }
}
