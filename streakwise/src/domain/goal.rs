//! The goal aggregate.
//!
//! A goal moves `Pending -> InProgress -> Completed`. Completion is terminal:
//! once a goal is completed, progress updates and completion are rejected.
//! Completion can be reached two ways, by reporting progress of at least 100%
//! or by an explicit complete command, and both go through [`settle`] when
//! events are applied, so `Completed` always means exactly 100%.
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Aggregate, AggregateId, Error, Event, async_trait, domain::user::UserId};

/// Identifies a goal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
)]
#[serde(transparent)]
pub struct GoalId(Uuid);

impl GoalId {
    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl AggregateId for GoalId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Lifecycle of a goal.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
pub enum GoalStatus {
    /// Created, no progress reported yet.
    #[default]
    Pending,
    /// Some progress reported, below 100%.
    InProgress,
    /// Done. Terminal.
    Completed,
}

/// Maps a reported progress percentage onto the stored percentage and status.
///
/// Anything at or above 100 completes the goal and is stored as exactly 100.
pub fn settle(progress_percentage: f64) -> (f64, GoalStatus) {
    if progress_percentage >= 100.0 {
        (100.0, GoalStatus::Completed)
    } else {
        (progress_percentage, GoalStatus::InProgress)
    }
}

/// Commands accepted by [`Goal`].
#[derive(Debug, Clone, PartialEq)]
pub enum GoalCommand {
    /// Create a new goal.
    Create {
        /// Owner of the goal.
        user_id: UserId,
        /// What the user wants to achieve.
        description: String,
        /// When the user wants to achieve it.
        target_date: NaiveDate,
        /// Free-form grouping.
        category: Option<String>,
        /// Labels, in the order given.
        tags: Vec<String>,
    },
    /// Report progress. 100 or more completes the goal.
    UpdateProgress {
        /// New progress percentage.
        progress_percentage: f64,
        /// What was done.
        notes: Option<String>,
    },
    /// Mark the goal as done regardless of reported progress.
    Complete,
}

/// Facts recorded in a goal's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Event)]
#[event(source = "urn:streakwise:goal")]
pub enum GoalEvent {
    /// A goal was created.
    GoalCreated {
        /// The goal.
        goal_id: GoalId,
        /// Owner of the goal.
        user_id: UserId,
        /// What the user wants to achieve.
        description: String,
        /// When the user wants to achieve it.
        target_date: NaiveDate,
        /// Free-form grouping.
        category: Option<String>,
        /// Labels, in the order given.
        tags: Vec<String>,
        /// When the goal was created.
        created_at: DateTime<Utc>,
    },
    /// Progress was reported.
    GoalProgressUpdated {
        /// The goal.
        goal_id: GoalId,
        /// Reported progress percentage.
        progress_percentage: f64,
        /// What was done.
        notes: Option<String>,
        /// When progress was reported.
        updated_at: DateTime<Utc>,
    },
    /// The goal was explicitly completed.
    GoalCompleted {
        /// The goal.
        goal_id: GoalId,
        /// Owner of the goal.
        user_id: UserId,
        /// When the goal was completed.
        completed_at: DateTime<Utc>,
    },
}

impl GoalEvent {
    /// The goal this event belongs to.
    pub fn goal_id(&self) -> GoalId {
        match self {
            Self::GoalCreated { goal_id, .. }
            | Self::GoalProgressUpdated { goal_id, .. }
            | Self::GoalCompleted { goal_id, .. } => *goal_id,
        }
    }

    /// When the fact occurred.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::GoalCreated { created_at, .. } => *created_at,
            Self::GoalProgressUpdated { updated_at, .. } => *updated_at,
            Self::GoalCompleted { completed_at, .. } => *completed_at,
        }
    }
}

/// Rejections produced by [`Goal`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GoalError {
    /// The command needs an existing goal.
    #[error("goal {0} does not exist")]
    NotFound(GoalId),
    /// A goal with this id was already created.
    #[error("goal {0} already exists")]
    AlreadyExists(GoalId),
    /// Completed goals accept no further progress or completion.
    #[error("goal {0} is already completed")]
    AlreadyCompleted(GoalId),
    /// Progress must be a finite, non-negative percentage.
    #[error("invalid progress percentage {0}")]
    InvalidProgress(f64),
}

impl From<GoalError> for Error {
    fn from(err: GoalError) -> Self {
        match err {
            GoalError::NotFound(id) => Error::AggregateNotFound(id.to_string()),
            other => Error::DomainInvariantViolation(other.to_string()),
        }
    }
}

/// State of a goal that has been created.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalState {
    /// The goal.
    pub goal_id: GoalId,
    /// Owner of the goal.
    pub user_id: UserId,
    /// What the user wants to achieve.
    pub description: String,
    /// When the user wants to achieve it.
    pub target_date: NaiveDate,
    /// Current lifecycle status.
    pub status: GoalStatus,
    /// Current progress, 100 exactly when completed.
    pub progress_percentage: f64,
    /// Free-form grouping.
    pub category: Option<String>,
    /// Labels, in the order given.
    pub tags: Vec<String>,
    /// When the goal was created.
    pub created_at: DateTime<Utc>,
    /// When the goal last changed.
    pub updated_at: DateTime<Utc>,
}

/// The goal aggregate. Empty until its `GoalCreated` event is applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Goal {
    state: Option<GoalState>,
    version: i64,
}

impl Goal {
    /// The goal's state, or `None` before creation.
    pub fn state(&self) -> Option<&GoalState> {
        self.state.as_ref()
    }

    fn existing(&self, id: &GoalId) -> Result<&GoalState, GoalError> {
        self.state.as_ref().ok_or(GoalError::NotFound(*id))
    }

    fn open(&self, id: &GoalId) -> Result<&GoalState, GoalError> {
        let state = self.existing(id)?;
        if state.status == GoalStatus::Completed {
            return Err(GoalError::AlreadyCompleted(*id));
        }
        Ok(state)
    }
}

#[async_trait]
impl Aggregate for Goal {
    type Id = GoalId;
    type Event = GoalEvent;
    type Command = GoalCommand;
    type Error = GoalError;

    fn id(&self) -> Option<&Self::Id> {
        self.state.as_ref().map(|s| &s.goal_id)
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            GoalEvent::GoalCreated {
                goal_id,
                user_id,
                description,
                target_date,
                category,
                tags,
                created_at,
            } => {
                self.state = Some(GoalState {
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
                });
            }
            // A stream never starts with anything but GoalCreated; a missing
            // state is tolerated rather than treated as a bug.
            GoalEvent::GoalProgressUpdated {
                progress_percentage,
                updated_at,
                ..
            } => {
                if let Some(state) = self.state.as_mut() {
                    // Nothing leaves Completed.
                    if state.status != GoalStatus::Completed {
                        let (progress, status) = settle(*progress_percentage);
                        state.progress_percentage = progress;
                        state.status = status;
                    }
                    state.updated_at = *updated_at;
                }
            }
            GoalEvent::GoalCompleted { completed_at, .. } => {
                if let Some(state) = self.state.as_mut() {
                    let (progress, status) = settle(100.0);
                    state.progress_percentage = progress;
                    state.status = status;
                    state.updated_at = *completed_at;
                }
            }
        }
        self.version += 1;
    }

    async fn handle(
        &self,
        id: &Self::Id,
        command: Self::Command,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            GoalCommand::Create {
                user_id,
                description,
                target_date,
                category,
                tags,
            } => {
                if self.state.is_some() {
                    return Err(GoalError::AlreadyExists(*id));
                }
                Ok(vec![GoalEvent::GoalCreated {
                    goal_id: *id,
                    user_id,
                    description,
                    target_date,
                    category,
                    tags,
                    created_at: now,
                }])
            }
            GoalCommand::UpdateProgress {
                progress_percentage,
                notes,
            } => {
                self.open(id)?;
                if !progress_percentage.is_finite() || progress_percentage < 0.0 {
                    return Err(GoalError::InvalidProgress(progress_percentage));
                }
                Ok(vec![GoalEvent::GoalProgressUpdated {
                    goal_id: *id,
                    progress_percentage,
                    notes,
                    updated_at: now,
                }])
            }
            GoalCommand::Complete => {
                let state = self.open(id)?;
                Ok(vec![GoalEvent::GoalCompleted {
                    goal_id: *id,
                    user_id: state.user_id,
                    completed_at: now,
                }])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn created(goal_id: GoalId) -> GoalEvent {
        GoalEvent::GoalCreated {
            goal_id,
            user_id: UserId::new(),
            description: "Read 12 books".into(),
            target_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
            category: Some("reading".into()),
            tags: vec!["books".into(), "habits".into()],
            created_at: at(8),
        }
    }

    fn progressed(goal_id: GoalId, progress_percentage: f64, hour: u32) -> GoalEvent {
        GoalEvent::GoalProgressUpdated {
            goal_id,
            progress_percentage,
            notes: None,
            updated_at: at(hour),
        }
    }

    #[test]
    fn created_goal_starts_pending() {
        let id = GoalId::new();
        let goal = Goal::load([created(id)]);
        let state = goal.state().unwrap();

        assert_eq!(goal.version(), 1);
        assert_eq!(goal.id(), Some(&id));
        assert_eq!(state.status, GoalStatus::Pending);
        assert_eq!(state.progress_percentage, 0.0);
        assert_eq!(state.tags, vec!["books".to_string(), "habits".to_string()]);
        assert_eq!(state.updated_at, state.created_at);
    }

    #[test]
    fn progress_below_hundred_is_in_progress() {
        let id = GoalId::new();
        let goal = Goal::load([created(id), progressed(id, 25.0, 9), progressed(id, 60.0, 10)]);
        let state = goal.state().unwrap();

        assert_eq!(state.status, GoalStatus::InProgress);
        assert_eq!(state.progress_percentage, 60.0);
        assert_eq!(state.updated_at, at(10));
    }

    #[test]
    fn progress_at_or_above_hundred_completes_at_exactly_hundred() {
        let id = GoalId::new();
        let goal = Goal::load([created(id), progressed(id, 130.0, 9)]);
        let state = goal.state().unwrap();

        assert_eq!(state.status, GoalStatus::Completed);
        assert_eq!(state.progress_percentage, 100.0);
    }

    #[test]
    fn explicit_completion_forces_hundred() {
        let id = GoalId::new();
        let user_id = UserId::new();
        let goal = Goal::load([
            created(id),
            progressed(id, 10.0, 9),
            GoalEvent::GoalCompleted {
                goal_id: id,
                user_id,
                completed_at: at(11),
            },
        ]);
        let state = goal.state().unwrap();

        assert_eq!(state.status, GoalStatus::Completed);
        assert_eq!(state.progress_percentage, 100.0);
        assert_eq!(state.updated_at, at(11));
    }

    #[test]
    fn completed_goal_never_regresses_during_replay() {
        let id = GoalId::new();
        let goal = Goal::load([created(id), progressed(id, 100.0, 9), progressed(id, 20.0, 10)]);
        let state = goal.state().unwrap();

        assert_eq!(state.status, GoalStatus::Completed);
        assert_eq!(state.progress_percentage, 100.0);
        assert_eq!(goal.version(), 3);
    }

    #[test]
    fn apply_without_creation_does_not_panic() {
        let id = GoalId::new();
        let goal = Goal::load([progressed(id, 50.0, 9)]);
        assert!(goal.state().is_none());
        assert_eq!(goal.version(), 1);
    }

    #[test]
    fn replay_is_deterministic() {
        let id = GoalId::new();
        let events = vec![created(id), progressed(id, 40.0, 9), progressed(id, 100.0, 10)];
        assert_eq!(Goal::load(events.clone()), Goal::load(events));
    }

    #[tokio::test]
    async fn create_on_existing_goal_is_rejected() {
        let id = GoalId::new();
        let goal = Goal::load([created(id)]);
        let err = goal
            .handle(
                &id,
                GoalCommand::Create {
                    user_id: UserId::new(),
                    description: "again".into(),
                    target_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                    category: None,
                    tags: vec![],
                },
                at(12),
            )
            .await
            .unwrap_err();
        assert_eq!(err, GoalError::AlreadyExists(id));
        assert!(matches!(Error::from(err), Error::DomainInvariantViolation(_)));
    }

    #[tokio::test]
    async fn update_on_missing_goal_is_not_found() {
        let id = GoalId::new();
        let err = Goal::default()
            .handle(
                &id,
                GoalCommand::UpdateProgress {
                    progress_percentage: 10.0,
                    notes: None,
                },
                at(12),
            )
            .await
            .unwrap_err();
        assert!(matches!(Error::from(err), Error::AggregateNotFound(_)));
    }

    #[tokio::test]
    async fn update_emits_event_with_supplied_values() {
        let id = GoalId::new();
        let goal = Goal::load([created(id)]);
        let events = goal
            .handle(
                &id,
                GoalCommand::UpdateProgress {
                    progress_percentage: 35.5,
                    notes: Some("chapter 4".into()),
                },
                at(13),
            )
            .await
            .unwrap();

        assert_eq!(
            events,
            vec![GoalEvent::GoalProgressUpdated {
                goal_id: id,
                progress_percentage: 35.5,
                notes: Some("chapter 4".into()),
                updated_at: at(13),
            }]
        );
    }

    #[tokio::test]
    async fn negative_or_nan_progress_is_rejected() {
        let id = GoalId::new();
        let goal = Goal::load([created(id)]);
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = goal
                .handle(
                    &id,
                    GoalCommand::UpdateProgress {
                        progress_percentage: bad,
                        notes: None,
                    },
                    at(13),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GoalError::InvalidProgress(_)));
        }
    }

    #[tokio::test]
    async fn completed_goal_rejects_progress_and_completion() {
        let id = GoalId::new();
        for history in [
            vec![created(id), progressed(id, 100.0, 9)],
            vec![
                created(id),
                progressed(id, 5.0, 9),
                GoalEvent::GoalCompleted {
                    goal_id: id,
                    user_id: UserId::new(),
                    completed_at: at(10),
                },
            ],
        ] {
            let goal = Goal::load(history);

            let err = goal.handle(&id, GoalCommand::Complete, at(14)).await.unwrap_err();
            assert_eq!(err, GoalError::AlreadyCompleted(id));

            let err = goal
                .handle(
                    &id,
                    GoalCommand::UpdateProgress {
                        progress_percentage: 50.0,
                        notes: None,
                    },
                    at(14),
                )
                .await
                .unwrap_err();
            assert!(matches!(Error::from(err), Error::DomainInvariantViolation(_)));
        }
    }

    #[tokio::test]
    async fn complete_carries_the_owner() {
        let id = GoalId::new();
        let goal = Goal::load([created(id)]);
        let owner = goal.state().unwrap().user_id;
        let events = goal.handle(&id, GoalCommand::Complete, at(15)).await.unwrap();
        assert_eq!(
            events,
            vec![GoalEvent::GoalCompleted {
                goal_id: id,
                user_id: owner,
                completed_at: at(15),
            }]
        );
    }

    #[test]
    fn derived_event_metadata() {
        let id = GoalId::new();
        let event = created(id);
        assert_eq!(event.event_type(), "GoalCreated");
        assert_eq!(event.event_version(), 1);
        assert_eq!(event.event_source(), "urn:streakwise:goal");
        assert_eq!(event.goal_id(), id);
    }
}
