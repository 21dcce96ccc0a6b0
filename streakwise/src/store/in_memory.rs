//! An in-memory event store, useful for testing and development.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use crate::{Aggregate, Error, EventStore, Result, StoredEvent};

use dashmap::DashMap;

// Type aliases to keep complex generic types readable and satisfy clippy::type-complexity.
type EventStream<E> = Vec<StoredEvent<E>>;

/// Thread-safe map keyed by aggregate_id
type StoreMap<E> = DashMap<String, EventStream<E>>;

/// An in-memory, thread-safe event store.
///
/// The version check and the push happen while holding the stream's map
/// entry, which makes each append atomic with respect to other writers of the
/// same stream. Writers of different streams rarely contend.
pub struct InMemoryEventStore<A: Aggregate> {
    events: Arc<StoreMap<A::Event>>,
}

impl<A: Aggregate> Default for InMemoryEventStore<A> {
    fn default() -> Self {
        Self {
            events: Arc::new(DashMap::new()),
        }
    }
}

impl<A: Aggregate> Clone for InMemoryEventStore<A> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<A: Aggregate> InMemoryEventStore<A> {
    /// Number of streams holding at least one event.
    pub fn stream_count(&self) -> usize {
        self.events.iter().filter(|s| !s.is_empty()).count()
    }
}

#[async_trait]
impl<A> EventStore<A> for InMemoryEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, events), fields(id = %id, expected_version))]
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let aggregate_id = id.to_string();

        let mut stream = self.events.entry(aggregate_id.clone()).or_default();

        let current_version = stream.last().map(|e| e.version()).unwrap_or(0);
        if current_version != expected_version {
            return Err(Error::ConcurrencyConflict {
                expected: expected_version,
                actual: current_version,
            });
        }

        let recorded_at = Utc::now();
        let mut stored_events = Vec::with_capacity(events.len());
        let mut version = current_version;
        for event in events {
            version += 1;
            let stored_event =
                StoredEvent::record(aggregate_id.clone(), version, recorded_at, event);
            stream.push(stored_event.clone());
            stored_events.push(stored_event);
        }
        debug!(new_version = version, "appended events");

        Ok(stored_events)
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();

        match self.events.get(&aggregate_id) {
            Some(stream) => Ok(stream.clone()),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self), fields(id = %id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        let aggregate_id = id.to_string();

        match self.events.get(&aggregate_id) {
            Some(stream) => Ok(stream
                .iter()
                .filter(|e| e.version() > version)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }
}
