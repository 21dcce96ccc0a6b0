//! Goal read models.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    Result, StoredEvent,
    bus::EventHandler,
    domain::{GoalEvent, GoalId, GoalStatus, UserId, goal::settle},
    projection::SharedProjectionStore,
};

/// Current state of a goal as seen by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalView {
    /// The goal.
    pub goal_id: GoalId,
    /// Owner of the goal.
    pub user_id: UserId,
    /// What the user wants to achieve.
    pub description: String,
    /// When the user wants to achieve it.
    pub target_date: NaiveDate,
    /// Lifecycle status.
    pub status: GoalStatus,
    /// Progress, exactly 100 when completed.
    pub progress_percentage: f64,
    /// Free-form grouping.
    pub category: Option<String>,
    /// Labels.
    pub tags: Vec<String>,
    /// When the goal was created.
    pub created_at: DateTime<Utc>,
    /// When the goal last changed.
    pub updated_at: DateTime<Utc>,
    /// Stream version of the last event reflected in this row.
    pub version: i64,
}

/// One reported progress update. Streaks are derived from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// The goal.
    pub goal_id: GoalId,
    /// Stream version of the update.
    pub version: i64,
    /// Reported percentage.
    pub progress_percentage: f64,
    /// What was done.
    pub notes: Option<String>,
    /// When progress was reported.
    pub recorded_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Storage key. One record per event, so redelivery overwrites in place.
    pub fn key(&self) -> String {
        progress_key(&self.goal_id, self.version)
    }
}

/// Key of the progress record written for `version` of `goal_id`.
pub fn progress_key(goal_id: &GoalId, version: i64) -> String {
    format!("{goal_id}/{version:010}")
}

/// Computes the goal row after `event`.
///
/// Returns `None` when there is nothing to write: the event is a redelivery
/// of something the row already reflects, or it refers to a goal whose row
/// does not exist yet.
pub fn project_goal(current: Option<GoalView>, event: &StoredEvent<GoalEvent>) -> Option<GoalView> {
    let version = event.version();
    if current.as_ref().is_some_and(|row| row.version >= version) {
        return None;
    }
    match (event.event(), current) {
        (
            GoalEvent::GoalCreated {
                goal_id,
                user_id,
                description,
                target_date,
                category,
                tags,
                created_at,
            },
            None,
        ) => Some(GoalView {
            goal_id: *goal_id,
            user_id: *user_id,
            description: description.clone(),
            target_date: *target_date,
            status: GoalStatus::Pending,
            progress_percentage: 0.0,
            category: category.clone(),
            tags: tags.clone(),
            created_at: *created_at,
            updated_at: *created_at,
            version,
        }),
        (
            GoalEvent::GoalProgressUpdated {
                progress_percentage,
                updated_at,
                ..
            },
            Some(mut row),
        ) => {
            if row.status != GoalStatus::Completed {
                (row.progress_percentage, row.status) = settle(*progress_percentage);
            }
            row.updated_at = *updated_at;
            row.version = version;
            Some(row)
        }
        (GoalEvent::GoalCompleted { completed_at, .. }, Some(mut row)) => {
            (row.progress_percentage, row.status) = settle(100.0);
            row.updated_at = *completed_at;
            row.version = version;
            Some(row)
        }
        _ => None,
    }
}

/// The progress record an event produces, if it is a progress update.
pub fn progress_record(event: &StoredEvent<GoalEvent>) -> Option<ProgressRecord> {
    match event.event() {
        GoalEvent::GoalProgressUpdated {
            goal_id,
            progress_percentage,
            notes,
            updated_at,
        } => Some(ProgressRecord {
            goal_id: *goal_id,
            version: event.version(),
            progress_percentage: *progress_percentage,
            notes: notes.clone(),
            recorded_at: *updated_at,
        }),
        _ => None,
    }
}

/// Maintains [`GoalView`] rows and the [`ProgressRecord`] history.
pub struct GoalProjector {
    goals: SharedProjectionStore<GoalView>,
    progress: SharedProjectionStore<ProgressRecord>,
}

impl GoalProjector {
    /// Creates a projector writing to the given stores.
    pub fn new(
        goals: SharedProjectionStore<GoalView>,
        progress: SharedProjectionStore<ProgressRecord>,
    ) -> Self {
        Self { goals, progress }
    }
}

#[async_trait]
impl EventHandler<GoalEvent> for GoalProjector {
    fn name(&self) -> &'static str {
        "goal-projector"
    }

    #[instrument(
        skip(self, event),
        fields(goal.id = event.aggregate_id(), version = event.version())
    )]
    async fn handle(&self, event: &StoredEvent<GoalEvent>) -> Result<()> {
        let key = event.event().goal_id().to_string();
        let current = self.goals.get(&key).await?;
        if current.is_none() && !matches!(event.event(), GoalEvent::GoalCreated { .. }) {
            debug!(event_type = event.event_type(), "goal row missing, event skipped");
            return Ok(());
        }
        if let Some(row) = project_goal(current, event) {
            self.goals.upsert(&key, row).await?;
        }
        // Written even when the row was already current, so a delivery that
        // failed between the two writes is completed by its retry.
        if let Some(record) = progress_record(event) {
            self.progress.upsert(&record.key(), record).await?;
        }
        Ok(())
    }
}
