//! Event dispatch.
//!
//! Events are enqueued inline with notification handling and handed to
//! subscribers by background workers, so the capture path never waits on
//! subscriber work.

/// Two-stage capture/delivery pipeline.
pub mod dispatcher;
/// Channel-backed subscriber and its stream handle.
pub mod subscriber;

pub use dispatcher::Dispatcher;
pub use subscriber::{ChannelSubscriber, EventStream};

use crate::error::DispatchError;
use crate::event::TraceEvent;
use crate::ids::ProducerId;

/// Receives ordered batches of trace events.
///
/// Called from the dispatcher's delivery worker. Implementations must not call
/// back into the engine that produced the batch.
pub trait Subscriber: Send + Sync {
    /// Handles one batch. Batches arrive in capture order.
    fn on_events(&self, producer: ProducerId, batch: &[TraceEvent]);
}

/// Where the event factory puts finished events.
pub trait EventSink: Send + Sync {
    /// Enqueues one event. May block when downstream queues are full.
    fn publish(&self, event: TraceEvent) -> Result<(), DispatchError>;
}
