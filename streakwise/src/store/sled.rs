//! A persistent `EventStore` implementation using `sled`.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionError, abort};
use tracing::{debug, instrument};

use crate::{Aggregate, Error, EventStore, Result, StoredEvent};

/// Holds the stream's current version as big-endian `i64`.
const HEAD_KEY: &[u8] = b"head";
/// Prefix of event entries; the rest of the key is the zero-padded version so
/// that lexical order is stream order.
const EVENT_PREFIX: &str = "e/";

fn event_key(version: i64) -> String {
    format!("{EVENT_PREFIX}{version:020}")
}

fn decode_head(raw: &[u8]) -> i64 {
    <[u8; 8]>::try_from(raw).map_or(0, i64::from_be_bytes)
}

/// A persistent, thread-safe event store using `sled`.
///
/// Each stream lives in its own `sled::Tree`. Appends check and advance the
/// stream head inside a single sled transaction, so two writers racing on the
/// same stream cannot both succeed.
#[derive(Clone)]
pub struct SledEventStore<A: Aggregate> {
    db: sled::Db,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> SledEventStore<A> {
    /// Creates a new `SledEventStore`.
    pub fn new(db: sled::Db) -> Self {
        Self {
            db,
            _phantom: PhantomData,
        }
    }

    fn tree(&self, id: &A::Id) -> Result<sled::Tree> {
        self.db
            .open_tree(id.to_string().as_bytes())
            .map_err(|e| Error::Store(e.to_string()))
    }

    fn scan(&self, id: &A::Id, after: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        let tree = self.tree(id)?;
        tree.scan_prefix(EVENT_PREFIX.as_bytes())
            .map(|res| {
                let (_, v) = res.map_err(|e| Error::Store(e.to_string()))?;
                serde_json::from_slice::<StoredEvent<A::Event>>(&v)
                    .map_err(|e| Error::Store(e.to_string()))
            })
            .filter(|res| res.as_ref().map_or(true, |e| e.version() > after))
            .collect()
    }
}

#[async_trait]
impl<A> EventStore<A> for SledEventStore<A>
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
        let tree = self.tree(id)?;
        let recorded_at = Utc::now();

        let stored_events: Vec<StoredEvent<A::Event>> = events
            .into_iter()
            .zip(1_i64..)
            .map(|(event, offset)| {
                StoredEvent::record(
                    aggregate_id.clone(),
                    expected_version + offset,
                    recorded_at,
                    event,
                )
            })
            .collect();
        let last_version = expected_version + stored_events.len() as i64;

        let entries = stored_events
            .iter()
            .map(|stored| {
                serde_json::to_vec(stored)
                    .map(|value| (event_key(stored.version()), value))
                    .map_err(|e| Error::Store(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let outcome: std::result::Result<(), TransactionError<i64>> =
            tree.transaction(|tx| -> ConflictableTransactionResult<(), i64> {
                let current = tx.get(HEAD_KEY)?.map_or(0, |raw| decode_head(&raw));
                if current != expected_version {
                    return abort(current);
                }
                for (key, value) in &entries {
                    tx.insert(key.as_bytes(), value.as_slice())?;
                }
                tx.insert(HEAD_KEY, &last_version.to_be_bytes()[..])?;
                Ok(())
            });

        match outcome {
            Ok(()) => {
                debug!(new_version = last_version, "appended events");
                Ok(stored_events)
            }
            Err(TransactionError::Abort(actual)) => Err(Error::ConcurrencyConflict {
                expected: expected_version,
                actual,
            }),
            Err(TransactionError::Storage(e)) => Err(Error::Store(e.to_string())),
        }
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>> {
        self.scan(id, 0)
    }

    #[instrument(skip(self), fields(id = %id, version))]
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>> {
        self.scan(id, version)
    }
}
