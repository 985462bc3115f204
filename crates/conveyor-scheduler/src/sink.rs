//! Status sink adapters.

use conveyor_core::events::StatusEvent;
use conveyor_core::ports::StatusSink;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Forwards events to an unbounded channel. Sending never blocks; events
/// emitted after the receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn emit(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            warn!("Status event receiver dropped");
        }
    }
}

/// Logs every transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn emit(&self, event: StatusEvent) {
        info!(
            subject = %event.subject(),
            entity_id = %event.entity_id,
            old_status = event.old_status.as_deref().unwrap_or("-"),
            new_status = %event.new_status,
            "Status changed"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn emit(&self, _event: StatusEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::ids::PipelineId;
    use conveyor_core::pipeline::RunStatus;

    #[test]
    fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelStatusSink::new();
        let pipeline = PipelineId::new();
        sink.emit(StatusEvent::pipeline(pipeline, None, RunStatus::Pending, Utc::now()));
        sink.emit(StatusEvent::pipeline(
            pipeline,
            Some(RunStatus::Pending),
            RunStatus::Running,
            Utc::now(),
        ));

        assert_eq!(rx.try_recv().unwrap().new_status, "pending");
        assert_eq!(rx.try_recv().unwrap().new_status, "running");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelStatusSink::new();
        drop(rx);
        sink.emit(StatusEvent::pipeline(
            PipelineId::new(),
            None,
            RunStatus::Pending,
            Utc::now(),
        ));
    }
}
