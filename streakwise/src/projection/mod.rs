//! Read models and the handlers that maintain them.
//!
//! Rows are eventually consistent copies of aggregate state. They can be
//! thrown away and rebuilt by replaying the event log through the projectors.
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{instrument, trace};

use crate::Result;

pub mod goal;
pub mod user;

/// Key-value storage for one kind of read-model row.
///
/// Consistency requirements are deliberately weak: reads may be stale and the
/// same row may be written more than once.
#[async_trait]
pub trait ProjectionStore<R>: Send + Sync
where
    R: Clone + Send + Sync + 'static,
{
    /// The row stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<R>>;

    /// Inserts or replaces the row stored under `key`.
    async fn upsert(&self, key: &str, row: R) -> Result<()>;

    /// Every row matching `filter`, in no particular order.
    async fn find_all(
        &self,
        filter: &(dyn for<'a> Fn(&'a R) -> bool + Send + Sync),
    ) -> Result<Vec<R>>;
}

/// A projection store shared between its projector and its queries.
pub type SharedProjectionStore<R> = Arc<dyn ProjectionStore<R>>;

/// A [`ProjectionStore`] kept in process memory.
pub struct InMemoryProjectionStore<R> {
    rows: DashMap<String, R>,
}

impl<R> Default for InMemoryProjectionStore<R> {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl<R> InMemoryProjectionStore<R> {
    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl<R> ProjectionStore<R> for InMemoryProjectionStore<R>
where
    R: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<R>> {
        Ok(self.rows.get(key).map(|row| row.value().clone()))
    }

    #[instrument(skip(self, row))]
    async fn upsert(&self, key: &str, row: R) -> Result<()> {
        self.rows.insert(key.to_owned(), row);
        trace!("row stored");
        Ok(())
    }

    async fn find_all(
        &self,
        filter: &(dyn for<'a> Fn(&'a R) -> bool + Send + Sync),
    ) -> Result<Vec<R>> {
        Ok(self
            .rows
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }
}
