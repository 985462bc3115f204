//! Lease manager: the background sweep that reclaims expired claims.

use crate::queue::TaskQueue;
use chrono::Utc;
use conveyor_core::Result;
use conveyor_core::ids::{AgentId, TaskId};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tasks put back to pending.
    pub requeued: Vec<TaskId>,
    /// Tasks failed with `AgentLost`.
    pub lost: Vec<TaskId>,
    /// Agent sessions dropped for inactivity.
    pub dropped_agents: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.lost.is_empty() && self.dropped_agents.is_empty()
    }
}

/// Periodically reclaims leases that were not extended in time.
pub struct LeaseManager {
    queue: TaskQueue,
    interval: Duration,
}

impl LeaseManager {
    pub fn new(queue: TaskQueue, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Run a single sweep against the current time.
    pub fn sweep(&self) -> Result<SweepReport> {
        self.queue.sweep_expired(Utc::now())
    }

    /// Sweep on every tick until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting lease manager"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep() {
                        Ok(report) if report.is_empty() => debug!("Lease sweep found nothing"),
                        Ok(report) => info!(
                            requeued = report.requeued.len(),
                            lost = report.lost.len(),
                            dropped_agents = report.dropped_agents.len(),
                            "Lease sweep reclaimed work"
                        ),
                        Err(e) => error!(error = %e, "Lease sweep failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Lease manager shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::matcher::LabelFilter;
    use crate::sink::NullStatusSink;
    use conveyor_core::ids::PipelineId;
    use conveyor_core::task::{TaskSpec, TaskStatus};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_run_reclaims_and_stops_on_shutdown() {
        let config = SchedulerConfig::default()
            .with_lease_duration(Duration::from_millis(50))
            .with_sweep_interval(Duration::from_millis(10));
        let queue = TaskQueue::new(config, Arc::new(NullStatusSink)).unwrap();
        let agent = AgentId::new();
        queue
            .push(TaskSpec::new("build", PipelineId::new()))
            .unwrap();
        queue.try_pop(agent, &LabelFilter::default()).unwrap().unwrap();

        let shutdown = CancellationToken::new();
        let handle = LeaseManager::new(queue.clone(), Duration::from_millis(10)).spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.status(&TaskId::from("build")).unwrap(), Some(TaskStatus::Pending));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
