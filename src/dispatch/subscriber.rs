use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::DispatchError;
use crate::event::TraceEvent;
use crate::ids::ProducerId;

use super::Subscriber;

/// A subscriber that forwards every event into a channel.
///
/// The channel is unbounded so a slow reader never stalls the delivery
/// worker.
#[derive(Debug)]
pub struct ChannelSubscriber {
    tx: Sender<TraceEvent>,
}

impl ChannelSubscriber {
    /// Creates a subscriber and the stream that reads from it.
    #[must_use]
    pub fn new() -> (Arc<Self>, EventStream) {
        let (tx, rx) = unbounded();
        (Arc::new(Self { tx }), EventStream { rx })
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_events(&self, _producer: ProducerId, batch: &[TraceEvent]) {
        for event in batch {
            // Reader gone; nothing to do.
            if self.tx.send(event.clone()).is_err() {
                return;
            }
        }
    }
}

/// Reading end of a [`ChannelSubscriber`].
#[derive(Debug)]
pub struct EventStream {
    rx: Receiver<TraceEvent>,
}

impl EventStream {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<TraceEvent, DispatchError> {
        self.rx.recv().map_err(|_| DispatchError::Disconnected {
            path: "event_stream".to_string(),
        })
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<TraceEvent, DispatchError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => DispatchError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => DispatchError::Disconnected {
                path: "event_stream".to_string(),
            },
        })
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.rx.try_iter().collect()
    }
}
