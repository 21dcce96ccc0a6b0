//! # Event-Sourced Goal Tracking
//!
//! `streakwise` tracks user goals and consistency points with an
//! event-sourced, command/query-separated model. Commands are validated
//! against state rebuilt from an aggregate's event stream, accepted commands
//! append events to an [`EventStore`], and an [`EventBus`](bus::EventBus)
//! fans appended events out to idempotent projection handlers that maintain
//! the read models queries are answered from.
//!
//! ## Core Concepts
//!
//! - **[`Aggregate`]**: A consistency boundary that validates commands and
//!   produces events. State only ever changes by applying events.
//! - **[`Event`]**: An immutable fact recorded in an aggregate's stream.
//! - **[`EventStore`]**: The append-only log, with compare-and-append by
//!   expected version.
//! - **[`AggregateEngine`](engine::AggregateEngine)**: The command intake.
//!   Rehydrates, validates, appends and publishes, retrying lost races.
//! - **[`ProjectionStore`](projection::ProjectionStore)**: Key-value storage
//!   for read models.
//! - **[`calculate_streak`](streak::calculate_streak)**: Pure streak metrics
//!   over a goal's progress history.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chrono::NaiveDate;
//! use streakwise::{
//!     AggregateId,
//!     bus::EventBus,
//!     config::Settings,
//!     domain::{Goal, UserId},
//!     engine::AggregateEngine,
//!     projection::{
//!         InMemoryProjectionStore,
//!         goal::{GoalProjector, GoalView, ProgressRecord},
//!     },
//!     query::GoalQueries,
//!     repository::GenericRepository,
//!     service::GoalService,
//!     store::in_memory::InMemoryEventStore,
//! };
//!
//! async fn track() -> streakwise::Result<()> {
//!     let settings = Settings::default();
//!     let goals = Arc::new(InMemoryProjectionStore::<GoalView>::default());
//!     let progress = Arc::new(InMemoryProjectionStore::<ProgressRecord>::default());
//!
//!     let bus = EventBus::builder()
//!         .register(GoalProjector::new(goals.clone(), progress.clone()))
//!         .start(&settings.bus)?;
//!     let repository = GenericRepository::new(Arc::new(InMemoryEventStore::<Goal>::default()));
//!     let engine = AggregateEngine::new(repository, bus.clone(), settings.engine.clone());
//!     let service = GoalService::new(Arc::new(engine), GoalQueries::new(goals, progress));
//!
//!     let target = NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid date");
//!     let goal_id = service
//!         .create_goal(UserId::new(), "Run a marathon".into(), target, None, vec![])
//!         .await?;
//!     service.update_progress(&goal_id, 40.0, Some("half way to half way".into())).await?;
//!
//!     bus.wait_idle().await;
//!     if let Some(view) = service.goal(&goal_id).await? {
//!         println!("{}: {}%", view.description, view.progress_percentage);
//!     }
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

extern crate self as streakwise;

use std::fmt::Debug;

pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
pub use streakwise_derive::Event;

pub mod bus;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod projection;
pub mod query;
pub mod repository;
pub mod service;
pub mod store;
pub mod streak;

/// The error type for this crate.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Error {
    /// The optimistic append lost a race: the stream moved on since it was
    /// read. Safe to retry after rehydrating.
    #[error("concurrency conflict: expected version {expected}, stream is at {actual}")]
    ConcurrencyConflict {
        /// The version the writer read before appending.
        expected: i64,
        /// The version the stream was actually at.
        actual: i64,
    },
    /// A command targeted an aggregate that has never been created.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),
    /// A command was rejected because the aggregate's current state forbids it.
    #[error("domain invariant violation: {0}")]
    DomainInvariantViolation(String),
    /// A projection handler failed to update its read model.
    #[error("projection handler `{handler}` failed: {reason}")]
    ProjectionHandlerFailure {
        /// Name of the handler.
        handler: String,
        /// What went wrong.
        reason: String,
    },
    /// Wraps an error from the underlying event or projection store.
    #[error("store error: {0}")]
    Store(String),
    /// Command handling did not reach the append before its deadline.
    #[error("command timed out before its events were appended")]
    Timeout,
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same command after rehydrating can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A marker trait for events.
///
/// Events must be serializable, deserializable, clonable, and debuggable.
/// The `Event` derive macro can be used to automatically implement this trait.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns a static string slice representing the type of the event.
    fn event_type(&self) -> &'static str;

    /// Returns the version of the event's schema.
    fn event_version(&self) -> u16;

    /// Returns the URI naming where this event originates.
    fn event_source(&self) -> &'static str;
}

/// Uniquely identifies an aggregate instance.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + ToString + Debug + std::fmt::Display + 'static
{
    /// Creates a new, unique aggregate ID.
    fn new() -> Self;
}

/// An aggregate is a consistency boundary. It is the fundamental building block
/// of the domain model.
#[async_trait]
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of events that this aggregate produces.
    type Event: Event;
    /// The type of commands that this aggregate can handle.
    ///
    /// Commands are cloned when a lost race forces them to be re-validated.
    type Command: Debug + Clone + Send + Sync;
    /// The type of error that this aggregate can produce.
    type Error: std::error::Error + Into<Error> + Send + Sync + 'static;

    /// Returns the identifier of the aggregate, or `None` before it was created.
    fn id(&self) -> Option<&Self::Id>;

    /// Returns the number of events applied so far.
    fn version(&self) -> i64;

    /// Applies an event to the aggregate, changing its state.
    ///
    /// Must be total: applying any event to any state never panics.
    fn apply(&mut self, event: &Self::Event);

    /// Validates a command against the current state and returns the events
    /// it produces. Never mutates the aggregate.
    async fn handle(
        &self,
        id: &Self::Id,
        command: Self::Command,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<Self::Event>, Self::Error>;

    /// Restores the aggregate's state from a sequence of events.
    fn load<E: Into<Self::Event>, I: IntoIterator<Item = E>>(events: I) -> Self {
        let mut aggregate = Self::default();
        for event in events {
            aggregate.apply(&event.into());
        }
        aggregate
    }
}

/// Represents a stored event, including metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "E: Serialize",
    deserialize = "E: serde::de::DeserializeOwned"
))]
pub struct StoredEvent<E: Event> {
    /// The ID of the aggregate this event belongs to.
    aggregate_id: String,
    /// The version of the aggregate after this event was applied.
    version: i64,
    /// The version of the event's schema.
    event_version: u16,
    /// The type of the event.
    event_type: String,
    /// When the log accepted the event.
    recorded_at: DateTime<Utc>,
    /// The event payload itself.
    event: E,
}

impl<E: Event> StoredEvent<E> {
    /// Creates a new stored event.
    pub fn new(
        aggregate_id: String,
        version: i64,
        event_version: u16,
        event_type: String,
        recorded_at: DateTime<Utc>,
        event: E,
    ) -> Self {
        Self {
            aggregate_id,
            version,
            event_version,
            event_type,
            recorded_at,
            event,
        }
    }

    /// Wraps `event` as the entry at `version` of `aggregate_id`'s stream,
    /// taking schema version and type from the event itself.
    pub fn record(
        aggregate_id: String,
        version: i64,
        recorded_at: DateTime<Utc>,
        event: E,
    ) -> Self {
        let event_version = event.event_version();
        let event_type = event.event_type().to_owned();
        Self::new(
            aggregate_id,
            version,
            event_version,
            event_type,
            recorded_at,
            event,
        )
    }

    /// Returns the ID of the aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
    /// Returns the version of the aggregate after this event was applied.
    pub fn version(&self) -> i64 {
        self.version
    }
    /// Returns the version of the event's schema.
    pub fn event_version(&self) -> u16 {
        self.event_version
    }
    /// Returns the type of the event.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
    /// Returns when the log accepted the event.
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
    /// Returns the event payload itself.
    pub fn event(&self) -> &E {
        &self.event
    }
    /// Consumes the stored event and returns the event payload.
    pub fn into_event(self) -> E {
        self.event
    }
}

/// The trait for event stores.
#[async_trait]
pub trait EventStore<A: Aggregate>: Send + Sync {
    /// Appends a list of events to the event store for a given aggregate.
    ///
    /// This operation must be atomic. It fails with
    /// [`Error::ConcurrencyConflict`] if `expected_version` does not match the
    /// current version of the stream.
    async fn append(
        &self,
        id: &A::Id,
        expected_version: i64,
        events: Vec<A::Event>,
    ) -> Result<Vec<StoredEvent<A::Event>>>;

    /// Loads the full event stream for a given aggregate, in append order.
    async fn load(&self, id: &A::Id) -> Result<Vec<StoredEvent<A::Event>>>;

    /// Loads the events of a stream strictly after `version`.
    async fn load_from(&self, id: &A::Id, version: i64) -> Result<Vec<StoredEvent<A::Event>>>;
}
