//! Two-stage dispatcher.
//!
//! Stage one is a small bounded capture queue fed inline by the event factory;
//! enqueue blocks when it is full, so no event is ever dropped. A batching
//! worker drains it in FIFO order into a bounded delivery queue, and a delivery
//! worker hands each batch to every subscriber.
//!
//! Every event carries the epoch it was captured in. [`Dispatcher::reset`]
//! takes the delivery gate, bumps the epoch and drains both queues; anything
//! from an older epoch that is still in flight is discarded by the delivery
//! worker, so no partially delivered batch survives a reset.
//!
//! A subscriber that panics is unsubscribed; the others keep receiving.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{lock_err, DispatchError, EngineResult};
use crate::event::TraceEvent;
use crate::ids::{ProducerId, SubscriptionId};

use super::{EventSink, Subscriber};

const CONTROL_QUEUE_CAPACITY: usize = 16;

#[derive(Debug)]
struct Stamped {
    epoch: u64,
    event: TraceEvent,
}

enum CaptureMsg {
    Event(Stamped),
    Flush(Sender<()>),
}

enum DeliveryMsg {
    Batch { epoch: u64, events: Vec<TraceEvent> },
    Flush(Sender<()>),
}

enum ControlMsg {
    Subscribe {
        id: SubscriptionId,
        subscriber: Arc<dyn Subscriber>,
        reply: Sender<()>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Sender<bool>,
    },
}

#[derive(Debug, Default)]
struct Shared {
    epoch: AtomicU64,
    delivered: AtomicU64,
    // Held by the delivery worker for the whole of a batch.
    gate: Mutex<()>,
}

/// Bounded capture/delivery pipeline with ordered, batched delivery.
pub struct Dispatcher {
    producer: ProducerId,
    capture_tx: Sender<CaptureMsg>,
    control_tx: Sender<ControlMsg>,
    capture_rx: Receiver<CaptureMsg>,
    delivery_rx: Receiver<DeliveryMsg>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("producer", &self.producer)
            .field("epoch", &self.shared.epoch.load(Ordering::Relaxed))
            .field("delivered", &self.shared.delivered.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts the batching and delivery workers.
    pub fn new(cfg: &DispatcherConfig, producer: ProducerId) -> Self {
        let (capture_tx, capture_rx) = bounded::<CaptureMsg>(cfg.capture_queue_capacity.max(1));
        let (delivery_tx, delivery_rx) = bounded::<DeliveryMsg>(cfg.delivery_queue_capacity.max(1));
        let (control_tx, control_rx) = bounded::<ControlMsg>(CONTROL_QUEUE_CAPACITY);
        let shared = Arc::new(Shared::default());

        let max_batch = cfg.max_batch_size.max(1);
        let batch_rx = capture_rx.clone();
        let batcher = thread::Builder::new()
            .name("stackmirror-batcher".to_string())
            .spawn(move || batch_loop(&batch_rx, &delivery_tx, max_batch))
            .expect("failed to spawn stackmirror batching worker");

        let worker_rx = delivery_rx.clone();
        let worker_shared = Arc::clone(&shared);
        let delivery = thread::Builder::new()
            .name("stackmirror-delivery".to_string())
            .spawn(move || delivery_loop(producer, &worker_shared, control_rx, worker_rx))
            .expect("failed to spawn stackmirror delivery worker");

        Self {
            producer,
            capture_tx,
            control_tx,
            capture_rx,
            delivery_rx,
            shared,
            workers: Mutex::new(vec![batcher, delivery]),
        }
    }

    /// Identifier passed to subscribers with every batch.
    #[must_use]
    pub const fn producer(&self) -> ProducerId {
        self.producer
    }

    /// Registers a subscriber. Returns once the delivery worker has
    /// acknowledged it; events captured after this call reach it.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Result<SubscriptionId, DispatchError> {
        let id = SubscriptionId::new();
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.control_tx
            .send(ControlMsg::Subscribe {
                id,
                subscriber,
                reply: reply_tx,
            })
            .map_err(|_| disconnected("dispatch_control"))?;

        // Wait for ack.
        reply_rx.recv().map_err(|_| disconnected("dispatch_control"))?;
        Ok(id)
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, DispatchError> {
        let (reply_tx, reply_rx) = bounded::<bool>(1);
        self.control_tx
            .send(ControlMsg::Unsubscribe { id, reply: reply_tx })
            .map_err(|_| disconnected("dispatch_control"))?;
        reply_rx.recv().map_err(|_| disconnected("dispatch_control"))
    }

    /// Waits until every event enqueued before this call has been delivered.
    pub fn flush(&self, timeout: Duration) -> Result<(), DispatchError> {
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.capture_tx
            .send_timeout(CaptureMsg::Flush(reply_tx), timeout)
            .map_err(|_| DispatchError::Timeout {
                duration_ms: millis(timeout),
            })?;
        reply_rx.recv_timeout(timeout).map_err(|_| DispatchError::Timeout {
            duration_ms: millis(timeout),
        })
    }

    /// Discards everything captured but not yet delivered.
    ///
    /// Exclusive with an in-flight batch: waits for the delivery worker to
    /// finish the batch it is handing out, then drains both queues.
    pub fn reset(&self) -> EngineResult<usize> {
        let _gate = self.shared.gate.lock().map_err(|_| lock_err("dispatcher.gate"))?;
        let epoch = self.shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;

        let mut discarded = 0;
        for msg in self.capture_rx.try_iter() {
            match msg {
                CaptureMsg::Event(_) => discarded += 1,
                CaptureMsg::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }
        for msg in self.delivery_rx.try_iter() {
            match msg {
                DeliveryMsg::Batch { events, .. } => discarded += events.len(),
                DeliveryMsg::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }

        debug!(epoch, discarded, "dispatcher reset");
        Ok(discarded)
    }

    /// Total events handed to subscribers so far.
    #[must_use]
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }
}

impl EventSink for Dispatcher {
    fn publish(&self, event: TraceEvent) -> Result<(), DispatchError> {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.capture_tx
            .send(CaptureMsg::Event(Stamped { epoch, event }))
            .map_err(|_| disconnected("dispatch_capture"))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Close the input channels first so both workers can run dry and exit.
        let (dummy_capture_tx, _) = bounded::<CaptureMsg>(1);
        drop(std::mem::replace(&mut self.capture_tx, dummy_capture_tx));
        let (dummy_control_tx, _) = bounded::<ControlMsg>(1);
        drop(std::mem::replace(&mut self.control_tx, dummy_control_tx));

        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn disconnected(path: &str) -> DispatchError {
    DispatchError::Disconnected { path: path.to_string() }
}

fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn batch_loop(capture_rx: &Receiver<CaptureMsg>, delivery_tx: &Sender<DeliveryMsg>, max_batch: usize) {
    let mut carry: Option<CaptureMsg> = None;
    loop {
        let first = match carry.take() {
            Some(msg) => msg,
            None => match capture_rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        let out = match first {
            CaptureMsg::Flush(reply) => DeliveryMsg::Flush(reply),
            CaptureMsg::Event(Stamped { epoch, event }) => {
                let mut events = vec![event];
                while events.len() < max_batch {
                    match capture_rx.try_recv() {
                        Ok(CaptureMsg::Event(next)) if next.epoch == epoch => events.push(next.event),
                        Ok(other) => {
                            // Epoch change or flush: close this batch.
                            carry = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                DeliveryMsg::Batch { epoch, events }
            }
        };

        if delivery_tx.send(out).is_err() {
            break;
        }
    }
}

fn delivery_loop(
    producer: ProducerId,
    shared: &Shared,
    mut control_rx: Receiver<ControlMsg>,
    mut delivery_rx: Receiver<DeliveryMsg>,
) {
    let mut subscribers: Vec<(SubscriptionId, Arc<dyn Subscriber>)> = Vec::new();

    let mut control_closed = false;
    let mut delivery_closed = false;

    loop {
        select! {
            recv(control_rx) -> msg => {
                match msg {
                    Ok(ControlMsg::Subscribe { id, subscriber, reply }) => {
                        subscribers.push((id, subscriber));
                        let _ = reply.send(());
                    }
                    Ok(ControlMsg::Unsubscribe { id, reply }) => {
                        let before = subscribers.len();
                        subscribers.retain(|(sid, _)| *sid != id);
                        let _ = reply.send(subscribers.len() != before);
                    }
                    Err(_) => {
                        control_closed = true;
                    }
                }
            }
            recv(delivery_rx) -> msg => {
                match msg {
                    Ok(DeliveryMsg::Batch { epoch, events }) => {
                        let _gate = shared.gate.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                        if epoch == shared.epoch.load(Ordering::Acquire) {
                            subscribers.retain(|(id, subscriber)| {
                                let handed = panic::catch_unwind(AssertUnwindSafe(|| {
                                    subscriber.on_events(producer, &events);
                                }));
                                if handed.is_err() {
                                    warn!(subscription = ?id, "subscriber panicked; unsubscribing");
                                }
                                handed.is_ok()
                            });
                            shared.delivered.fetch_add(events.len() as u64, Ordering::Relaxed);
                        } else {
                            trace!(epoch, dropped = events.len(), "discarding batch from before reset");
                        }
                    }
                    Ok(DeliveryMsg::Flush(reply)) => {
                        let _ = reply.send(());
                    }
                    Err(_) => {
                        delivery_closed = true;
                    }
                }
            }
        }

        if control_closed && delivery_closed {
            break;
        }
        // A closed receiver is always ready; park it so select blocks on the other.
        if control_closed {
            control_rx = never();
        }
        if delivery_closed {
            delivery_rx = never();
        }
    }
}
