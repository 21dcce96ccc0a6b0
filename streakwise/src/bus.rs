//! Delivers appended events to projection handlers.
//!
//! Handlers are registered explicitly on an [`EventBusBuilder`] before the bus
//! starts. Every handler gets its own set of worker lanes (`shards`), and an
//! event is routed to a lane by hashing its aggregate id. That gives:
//!
//! - in-order delivery within one stream, since a stream always maps to the
//!   same lane;
//! - parallel delivery across streams;
//! - isolation between handlers, since a slow or failing handler only backs up
//!   its own lanes.
//!
//! Delivery is at-least-once. A failing handler is retried with exponential
//! backoff up to `max_attempts` times; when the budget is exhausted the
//! failure is logged and broadcast as a [`DeliveryFailure`], and the lane
//! moves on. [`EventBus::publish`] never blocks and never fails, so nothing on
//! the read side can stall the command path.
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use futures::FutureExt;
use tokio::{
    sync::{Mutex, Notify, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, instrument, warn};

use crate::{Error, Event, Result, StoredEvent, config::BusSettings};

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// Receives every event published on the bus it is registered with.
///
/// Implementations must be idempotent: the same event can be delivered more
/// than once.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Stable name used in logs and failure reports.
    fn name(&self) -> &'static str;

    /// Processes one event.
    async fn handle(&self, event: &StoredEvent<E>) -> Result<()>;
}

/// A delivery that was abandoned after exhausting its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Handler that kept failing.
    pub handler: &'static str,
    /// Stream of the undelivered event.
    pub aggregate_id: String,
    /// Position of the undelivered event in its stream.
    pub version: i64,
    /// Type of the undelivered event.
    pub event_type: String,
    /// How many times delivery was tried.
    pub attempts: u32,
    /// The last error.
    pub reason: String,
}

impl From<DeliveryFailure> for Error {
    fn from(failure: DeliveryFailure) -> Self {
        Error::ProjectionHandlerFailure {
            handler: failure.handler.to_owned(),
            reason: failure.reason,
        }
    }
}

#[derive(Debug, Clone)]
struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl From<&BusSettings> for RetryPolicy {
    fn from(settings: &BusSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff(),
            max_backoff: settings.max_backoff(),
        }
    }
}

/// Bookkeeping shared by the bus handle and its workers.
struct Shared {
    pending: AtomicUsize,
    idle: Notify,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl Shared {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

type Lane<E> = Vec<mpsc::UnboundedSender<Arc<StoredEvent<E>>>>;

/// Collects handlers before the bus starts.
pub struct EventBusBuilder<E: Event> {
    handlers: Vec<Arc<dyn EventHandler<E>>>,
}

impl<E: Event> Default for EventBusBuilder<E> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }
}

impl<E: Event> EventBusBuilder<E> {
    /// Adds a handler.
    pub fn register<H: EventHandler<E> + 'static>(self, handler: H) -> Self {
        self.register_shared(Arc::new(handler))
    }

    /// Adds a handler that is also referenced elsewhere.
    pub fn register_shared(mut self, handler: Arc<dyn EventHandler<E>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Spawns the worker lanes and returns the running bus.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self, settings: &BusSettings) -> Result<EventBus<E>> {
        settings.validate()?;
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            failures,
        });
        let policy = RetryPolicy::from(settings);

        let mut lanes = Vec::with_capacity(self.handlers.len());
        let mut workers = Vec::with_capacity(self.handlers.len() * settings.shards);
        for handler in self.handlers {
            let mut lane = Vec::with_capacity(settings.shards);
            for shard in 0..settings.shards {
                let (sender, queue) = mpsc::unbounded_channel();
                lane.push(sender);
                workers.push(tokio::spawn(run_worker(
                    Arc::clone(&handler),
                    queue,
                    policy.clone(),
                    Arc::clone(&shared),
                    shard,
                )));
            }
            debug!(handler = handler.name(), shards = settings.shards, "registered handler");
            lanes.push(lane);
        }

        Ok(EventBus {
            inner: Arc::new(Inner {
                lanes: RwLock::new(lanes),
                shards: settings.shards,
                closed: AtomicBool::new(false),
                shared,
                workers: Mutex::new(workers),
            }),
        })
    }
}

struct Inner<E: Event> {
    lanes: RwLock<Vec<Lane<E>>>,
    shards: usize,
    closed: AtomicBool,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A running event bus. Cheap to clone; all clones feed the same workers.
pub struct EventBus<E: Event> {
    inner: Arc<Inner<E>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> EventBus<E> {
    /// Starts collecting handlers for a new bus.
    pub fn builder() -> EventBusBuilder<E> {
        EventBusBuilder::default()
    }

    /// Queues `event` for every registered handler and returns immediately.
    #[instrument(
        skip(self, event),
        fields(aggregate_id = event.aggregate_id(), version = event.version())
    )]
    pub fn publish(&self, event: StoredEvent<E>) {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!("event bus is shut down, event not delivered");
            return;
        }
        let shard = shard_for(event.aggregate_id(), self.inner.shards);
        let event = Arc::new(event);
        let lanes = self
            .inner
            .lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for lane in lanes.iter() {
            let Some(sender) = lane.get(shard) else {
                continue;
            };
            self.inner.shared.pending.fetch_add(1, Ordering::AcqRel);
            if sender.send(Arc::clone(&event)).is_err() {
                self.inner.shared.finish_one();
                warn!(shard, "event bus worker is gone, delivery dropped");
            }
        }
    }

    /// Resolves once every delivery accepted so far has finished, either
    /// successfully or by exhausting its retries.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.shared.idle.notified();
            if self.inner.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Subscribes to abandoned deliveries.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.inner.shared.failures.subscribe()
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner
            .lanes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops accepting events, lets every lane drain its queue and waits for
    /// the workers to exit.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // Dropping the senders ends each worker once its queue is empty.
        self.inner
            .lanes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "event bus worker did not exit cleanly");
            }
        }
    }
}

fn shard_for(aggregate_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    aggregate_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_worker<E: Event>(
    handler: Arc<dyn EventHandler<E>>,
    mut queue: mpsc::UnboundedReceiver<Arc<StoredEvent<E>>>,
    policy: RetryPolicy,
    shared: Arc<Shared>,
    shard: usize,
) {
    while let Some(event) = queue.recv().await {
        if let Err(failure) = deliver(handler.as_ref(), &event, &policy).await {
            error!(
                handler = failure.handler,
                aggregate_id = %failure.aggregate_id,
                version = failure.version,
                event_type = %failure.event_type,
                attempts = failure.attempts,
                reason = %failure.reason,
                "projection handler gave up on event"
            );
            // No subscriber is fine, the failure is already logged.
            let _ = shared.failures.send(failure);
        }
        shared.finish_one();
    }
    debug!(handler = handler.name(), shard, "event bus worker stopped");
}

async fn deliver<E: Event>(
    handler: &dyn EventHandler<E>,
    event: &StoredEvent<E>,
    policy: &RetryPolicy,
) -> std::result::Result<(), DeliveryFailure> {
    let mut schedule = policy.schedule();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let reason = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => "handler panicked".to_owned(),
        };
        if attempt >= policy.max_attempts {
            return Err(DeliveryFailure {
                handler: handler.name(),
                aggregate_id: event.aggregate_id().to_owned(),
                version: event.version(),
                event_type: event.event_type().to_owned(),
                attempts: attempt,
                reason,
            });
        }
        let delay = schedule.next_backoff().unwrap_or(policy.max_backoff);
        warn!(
            handler = handler.name(),
            aggregate_id = event.aggregate_id(),
            version = event.version(),
            attempt,
            ?delay,
            %reason,
            "projection handler failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
