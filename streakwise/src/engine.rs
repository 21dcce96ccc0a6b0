//! Command intake.
//!
//! [`AggregateEngine::submit`] is the only way state changes: it rehydrates
//! the target aggregate, lets it validate the command, appends the resulting
//! events conditioned on the version it read, and hands the appended events to
//! the [`EventBus`]. Losing the append race is not an error for the caller
//! until the retry budget is spent; each retry re-reads the stream and
//! re-validates the same command against the newer state.
//!
//! Publishing follows the log, not the order in which appends are
//! acknowledged. Each stream has a watermark of the last published version,
//! and whoever holds it publishes everything the log has beyond it.
use std::{marker::PhantomData, sync::Arc};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    Aggregate, Error, Result, StoredEvent,
    bus::EventBus,
    clock::{Clock, SystemClock},
    config::EngineSettings,
    repository::Repository,
};

/// Validates commands for one aggregate type and records their events.
pub struct AggregateEngine<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    repository: R,
    bus: EventBus<A::Event>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    published: DashMap<String, Arc<Mutex<i64>>>,
    _phantom: PhantomData<A>,
}

impl<A, R> AggregateEngine<A, R>
where
    A: Aggregate,
    R: Repository<A>,
{
    /// Creates an engine that timestamps events with the system clock.
    pub fn new(repository: R, bus: EventBus<A::Event>, settings: EngineSettings) -> Self {
        Self {
            repository,
            bus,
            settings,
            clock: Arc::new(SystemClock),
            published: DashMap::new(),
            _phantom: PhantomData,
        }
    }

    /// Replaces the clock used to timestamp new events.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The repository commands are validated against.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// The bus appended events are published on.
    pub fn bus(&self) -> &EventBus<A::Event> {
        &self.bus
    }

    /// Handles `command` for the aggregate `id` and returns the appended events.
    ///
    /// Domain rejections are returned as they are. A
    /// [`Error::ConcurrencyConflict`] is retried up to `max_conflict_retries`
    /// times before it is returned. Events are published only after they were
    /// appended, in stream version order; delivery problems never surface here.
    #[instrument(skip(self, command), fields(aggregate.id = %id, command = ?command))]
    pub async fn submit(
        &self,
        id: &A::Id,
        command: A::Command,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        let mut conflicts = 0;
        loop {
            match self.attempt(id, command.clone()).await {
                Ok(stored) => {
                    debug!(appended = stored.len(), "command accepted");
                    if !stored.is_empty() {
                        self.publish_pending(id).await;
                    }
                    return Ok(stored);
                }
                Err(err @ Error::ConcurrencyConflict { .. })
                    if conflicts < self.settings.max_conflict_retries =>
                {
                    conflicts += 1;
                    warn!(
                        error = %err,
                        retry = conflicts,
                        "lost append race, re-validating command"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads and validates under the command deadline, then appends.
    ///
    /// The deadline never cancels a started append, so [`Error::Timeout`]
    /// always means nothing was written.
    async fn attempt(
        &self,
        id: &A::Id,
        command: A::Command,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        let decided = self.decide(id, command);
        let (expected, events) = match self.settings.command_timeout() {
            Some(limit) => tokio::time::timeout(limit, decided)
                .await
                .map_err(|_| Error::Timeout)??,
            None => decided.await?,
        };
        self.repository.save(id, expected, events).await
    }

    async fn decide(&self, id: &A::Id, command: A::Command) -> Result<(i64, Vec<A::Event>)> {
        let aggregate = self.repository.rehydrate(id).await?;
        // Registered before any append of ours, so nothing we write sits below it.
        self.published
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(aggregate.version())));
        let events = aggregate
            .handle(id, command, self.clock.now())
            .await
            .map_err(Into::<Error>::into)?;
        Ok((aggregate.version(), events))
    }

    /// Publishes every logged event past the stream's watermark, in order.
    async fn publish_pending(&self, id: &A::Id) {
        let Some(watermark) = self
            .published
            .get(&id.to_string())
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        let mut last = watermark.lock().await;
        match self.repository.load_from(id, *last).await {
            Ok(pending) => {
                for event in pending {
                    *last = event.version();
                    self.bus.publish(event);
                }
            }
            Err(err) => {
                warn!(error = %err, from = *last, "could not read appended events for publishing");
            }
        }
    }
}
