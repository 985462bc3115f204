//! Ephemeral sessions of polling agents.

use chrono::{DateTime, Duration, Utc};
use conveyor_core::ids::{AgentId, TaskId};
use conveyor_core::task::Labels;
use std::collections::{BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A connected agent, created on its first poll.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: AgentId,
    pub labels: Labels,
    /// Tasks the agent may hold at once.
    pub concurrency: usize,
    pub current_task_ids: BTreeSet<TaskId>,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Polls currently parked for this agent.
    pub polls: usize,
    kick: CancellationToken,
}

impl AgentSession {
    fn new(id: AgentId, labels: Labels, concurrency: usize, now: DateTime<Utc>) -> Self {
        Self {
            id,
            labels,
            concurrency: concurrency.max(1),
            current_task_ids: BTreeSet::new(),
            connected_at: now,
            last_seen_at: now,
            polls: 0,
            kick: CancellationToken::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_task_ids.len() < self.concurrency
    }

    /// Fires when the session is dropped, releasing the agent's pending polls.
    pub fn kicked(&self) -> CancellationToken {
        self.kick.clone()
    }
}

#[derive(Debug, Default)]
pub(crate) struct AgentSessions {
    sessions: HashMap<AgentId, AgentSession>,
}

impl AgentSessions {
    /// Create the session on first contact, refresh it afterwards.
    pub fn connect(
        &mut self,
        agent: AgentId,
        labels: &Labels,
        concurrency: usize,
        now: DateTime<Utc>,
    ) -> &AgentSession {
        let session = self.sessions.entry(agent).or_insert_with(|| {
            info!(agent_id = %agent, concurrency, "Agent session opened");
            AgentSession::new(agent, labels.clone(), concurrency, now)
        });
        session.labels.clone_from(labels);
        session.concurrency = concurrency.max(1);
        session.last_seen_at = now;
        session
    }

    pub fn touch(&mut self, agent: AgentId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(&agent) {
            session.last_seen_at = now;
        }
    }

    pub fn begin_poll(&mut self, agent: AgentId) {
        if let Some(session) = self.sessions.get_mut(&agent) {
            session.polls += 1;
        }
    }

    /// A finished poll counts as contact.
    pub fn end_poll(&mut self, agent: AgentId, now: DateTime<Utc>) {
        if let Some(session) = self.sessions.get_mut(&agent) {
            session.polls = session.polls.saturating_sub(1);
            session.last_seen_at = now;
        }
    }

    pub fn get(&self, agent: &AgentId) -> Option<&AgentSession> {
        self.sessions.get(agent)
    }

    pub fn attach(&mut self, agent: AgentId, task: &TaskId) {
        if let Some(session) = self.sessions.get_mut(&agent) {
            session.current_task_ids.insert(task.clone());
        }
    }

    pub fn detach(&mut self, agent: AgentId, task: &TaskId) {
        if let Some(session) = self.sessions.get_mut(&agent) {
            session.current_task_ids.remove(task);
        }
    }

    /// Drop a session and cancel its outstanding polls. Claims it still holds
    /// become orphaned and are left to the lease sweep.
    pub fn remove(&mut self, agent: &AgentId) -> Option<AgentSession> {
        let session = self.sessions.remove(agent)?;
        session.kick.cancel();
        info!(
            agent_id = %agent,
            orphaned = session.current_task_ids.len(),
            "Agent session closed"
        );
        Some(session)
    }

    /// Remove sessions idle for longer than `timeout`. A session with a
    /// parked poll is not idle.
    pub fn expire(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<AgentId> {
        let stale: Vec<AgentId> = self
            .sessions
            .values()
            .filter(|s| s.polls == 0 && now - s.last_seen_at > timeout)
            .map(|s| s.id)
            .collect();

        for agent in &stale {
            debug!(agent_id = %agent, "Agent session timed out");
            self.remove(agent);
        }

        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<AgentSession> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }
}
