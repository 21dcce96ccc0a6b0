//! Provides a generic repository for interacting with aggregates.
use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::{Aggregate, Error, EventStore, Result, StoredEvent};

/// Defines the standard interface for a repository.
#[async_trait]
pub trait Repository<A: Aggregate>: Send + Sync {
    /// Loads an existing aggregate; fails with [`Error::AggregateNotFound`]
    /// when its stream is empty.
    async fn load(&self, id: &A::Id) -> Result<A>;
    /// Rebuilds an aggregate from its stream, yielding the empty state at
    /// version 0 when the stream does not exist yet.
    async fn rehydrate(&self, id: &A::Id) -> Result<A>;
    /// Events of the stream with a version greater than `version`, in order.
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>>;
    /// Appends new events, conditioned on the stream still being at
    /// `expected_version`.
    async fn save(
        &self,
        id: &A::Id,
        expected_version: i64,
        new_events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>>;
}

/// A generic, high-level repository for loading and saving aggregates
/// through any [`EventStore`].
pub struct GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore<A>,
{
    store: Arc<S>,
    _phantom: PhantomData<A>,
}

impl<A, S> GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore<A>,
{
    /// Creates a new `GenericRepository`.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    /// The underlying event store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

#[async_trait]
impl<A, S> Repository<A> for GenericRepository<A, S>
where
    A: Aggregate,
    S: EventStore<A> + 'static,
{
    #[instrument(skip(self), fields(aggregate.id = %id))]
    async fn load(&self, id: &A::Id) -> Result<A> {
        let aggregate = self.rehydrate(id).await?;
        if aggregate.version() == 0 {
            return Err(Error::AggregateNotFound(id.to_string()));
        }
        Ok(aggregate)
    }

    #[instrument(skip(self), fields(aggregate.id = %id))]
    async fn rehydrate(&self, id: &A::Id) -> Result<A> {
        let events = self.store.load(id).await?;
        let aggregate = A::load(events.into_iter().map(StoredEvent::into_event));
        debug!(version = aggregate.version(), "rehydrated aggregate");
        Ok(aggregate)
    }

    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        self.store.load_from(id, version).await
    }

    #[instrument(skip(self, new_events), fields(aggregate.id = %id, expected_version))]
    async fn save(
        &self,
        id: &A::Id,
        expected_version: i64,
        new_events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        if new_events.is_empty() {
            return Ok(Vec::new());
        }
        self.store.append(id, expected_version, new_events).await
    }
}

#[async_trait]
impl<A, R> Repository<A> for Arc<R>
where
    A: Aggregate,
    R: Repository<A> + Send + Sync,
{
    async fn load(&self, aggregate_id: &A::Id) -> Result<A> {
        (**self).load(aggregate_id).await
    }

    async fn rehydrate(&self, aggregate_id: &A::Id) -> Result<A> {
        (**self).rehydrate(aggregate_id).await
    }

    async fn load_from(
        &self,
        aggregate_id: &A::Id,
        version: i64,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        (**self).load_from(aggregate_id, version).await
    }

    async fn save(
        &self,
        aggregate_id: &A::Id,
        expected_version: i64,
        events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>> {
        (**self).save(aggregate_id, expected_version, events).await
    }
}
