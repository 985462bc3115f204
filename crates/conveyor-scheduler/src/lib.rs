//! Task queue, lease manager, and workflow state machine for Conveyor CI.

pub mod agents;
pub mod config;
pub mod dag;
pub mod lease;
pub mod matcher;
pub mod queue;
pub mod scheduler;
pub mod sink;
mod state;
pub mod workflow;

pub use agents::AgentSession;
pub use config::{SchedulerConfig, parse_labels};
pub use lease::{LeaseManager, SweepReport};
pub use matcher::{LabelFilter, labels_match};
pub use queue::TaskQueue;
pub use scheduler::Scheduler;
pub use sink::{ChannelStatusSink, NullStatusSink, TracingStatusSink};
pub use state::QueueInfo;
