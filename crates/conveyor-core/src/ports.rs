//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler core and the
//! external adapters it reports to.

use crate::events::StatusEvent;

/// Consumer of status transitions (persistence, UI fan-out).
///
/// `emit` is called while the scheduler holds its state lock, in transition
/// order. Implementations must return without blocking: buffer, hand off to
/// a channel, or drop.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}
