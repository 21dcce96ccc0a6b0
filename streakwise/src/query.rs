//! Reads against the projection stores.
//!
//! Answers are eventually consistent: a command that just returned may not be
//! visible here until the bus has delivered its events.
use chrono::NaiveDate;
use tracing::instrument;

use crate::{
    Result,
    domain::{GoalId, UserId},
    projection::{
        SharedProjectionStore,
        goal::{GoalView, ProgressRecord},
        user::{ConsistencyPointsView, UserView},
    },
    streak::StreakSummary,
};

/// Goal lookups.
#[derive(Clone)]
pub struct GoalQueries {
    goals: SharedProjectionStore<GoalView>,
    progress: SharedProjectionStore<ProgressRecord>,
}

impl GoalQueries {
    /// Creates queries over the stores a [`GoalProjector`] writes to.
    ///
    /// [`GoalProjector`]: crate::projection::goal::GoalProjector
    pub fn new(
        goals: SharedProjectionStore<GoalView>,
        progress: SharedProjectionStore<ProgressRecord>,
    ) -> Self {
        Self { goals, progress }
    }

    /// The goal's row, if it has been projected.
    #[instrument(skip(self))]
    pub async fn goal(&self, goal_id: &GoalId) -> Result<Option<GoalView>> {
        self.goals.get(&goal_id.to_string()).await
    }

    /// All goals owned by `user_id`, oldest first.
    #[instrument(skip(self))]
    pub async fn goals_for_user(&self, user_id: &UserId) -> Result<Vec<GoalView>> {
        let owner = *user_id;
        let mut goals = self
            .goals
            .find_all(&move |row: &GoalView| row.user_id == owner)
            .await?;
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.goal_id.cmp(&b.goal_id)));
        Ok(goals)
    }

    /// Progress updates of a goal, most recent first.
    #[instrument(skip(self))]
    pub async fn progress_history(&self, goal_id: &GoalId) -> Result<Vec<ProgressRecord>> {
        let goal = *goal_id;
        let mut history = self
            .progress
            .find_all(&move |record: &ProgressRecord| record.goal_id == goal)
            .await?;
        history.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(history)
    }

    /// Streak metrics of a goal as seen on `today`.
    pub async fn streak(&self, goal_id: &GoalId, today: NaiveDate) -> Result<StreakSummary> {
        let history = self.progress_history(goal_id).await?;
        Ok(StreakSummary::from_progress(&history, today))
    }
}

/// User lookups.
#[derive(Clone)]
pub struct UserQueries {
    users: SharedProjectionStore<UserView>,
    points: SharedProjectionStore<ConsistencyPointsView>,
}

impl UserQueries {
    /// Creates queries over the stores a [`UserProjector`] writes to.
    ///
    /// [`UserProjector`]: crate::projection::user::UserProjector
    pub fn new(
        users: SharedProjectionStore<UserView>,
        points: SharedProjectionStore<ConsistencyPointsView>,
    ) -> Self {
        Self { users, points }
    }

    /// The user's profile, if it has been projected.
    #[instrument(skip(self))]
    pub async fn user(&self, user_id: &UserId) -> Result<Option<UserView>> {
        self.users.get(&user_id.to_string()).await
    }

    /// The user registered under `email`, compared ASCII case-insensitively.
    #[instrument(skip(self))]
    pub async fn user_by_email(&self, email: &str) -> Result<Option<UserView>> {
        let wanted = email.trim().to_owned();
        let found = self
            .users
            .find_all(&move |row: &UserView| row.email.eq_ignore_ascii_case(&wanted))
            .await?;
        Ok(found.into_iter().min_by_key(|row| row.created_at))
    }

    /// The user's consistency-point balance.
    #[instrument(skip(self))]
    pub async fn consistency_points(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ConsistencyPointsView>> {
        self.points.get(&user_id.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        AggregateId,
        domain::GoalStatus,
        projection::{InMemoryProjectionStore, ProjectionStore},
    };

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, day, 9, 0, 0).unwrap()
    }

    fn view(goal_id: GoalId, user_id: UserId, day: u32) -> GoalView {
        GoalView {
            goal_id,
            user_id,
            description: format!("goal from day {day}"),
            target_date: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
            status: GoalStatus::Pending,
            progress_percentage: 0.0,
            category: None,
            tags: Vec::new(),
            created_at: at(day),
            updated_at: at(day),
            version: 1,
        }
    }

    fn record(goal_id: GoalId, version: i64, day: u32) -> ProgressRecord {
        ProgressRecord {
            goal_id,
            version,
            progress_percentage: version as f64,
            notes: None,
            recorded_at: at(day),
        }
    }

    #[tokio::test]
    async fn goals_are_listed_per_owner_oldest_first() {
        let goals = Arc::new(InMemoryProjectionStore::<GoalView>::default());
        let progress = Arc::new(InMemoryProjectionStore::<ProgressRecord>::default());
        let queries = GoalQueries::new(goals.clone(), progress);
        let owner = UserId::new();
        let (newer, older, foreign) = (GoalId::new(), GoalId::new(), GoalId::new());
        goals.upsert(&newer.to_string(), view(newer, owner, 9)).await.unwrap();
        goals.upsert(&older.to_string(), view(older, owner, 2)).await.unwrap();
        goals
            .upsert(&foreign.to_string(), view(foreign, UserId::new(), 1))
            .await
            .unwrap();

        let ids: Vec<GoalId> = queries
            .goals_for_user(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|g| g.goal_id)
            .collect();

        assert_eq!(ids, vec![older, newer]);
        assert_eq!(queries.goal(&GoalId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_feeds_the_streak() {
        let goals = Arc::new(InMemoryProjectionStore::<GoalView>::default());
        let progress = Arc::new(InMemoryProjectionStore::<ProgressRecord>::default());
        let queries = GoalQueries::new(goals, progress.clone());
        let id = GoalId::new();
        for (version, day) in [(2, 10), (3, 11), (4, 12)] {
            let r = record(id, version, day);
            progress.upsert(&r.key(), r).await.unwrap();
        }
        let other = record(GoalId::new(), 2, 12);
        progress.upsert(&other.key(), other).await.unwrap();

        let versions: Vec<i64> = queries
            .progress_history(&id)
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![4, 3, 2]);

        let streak = queries
            .streak(&id, NaiveDate::from_ymd_opt(2024, 4, 13).unwrap())
            .await
            .unwrap();
        assert_eq!(streak.current_streak_days, 3);
        assert!(streak.is_active);
    }

    #[tokio::test]
    async fn users_are_found_by_email_ignoring_case() {
        let users = Arc::new(InMemoryProjectionStore::<UserView>::default());
        let points = Arc::new(InMemoryProjectionStore::<ConsistencyPointsView>::default());
        let queries = UserQueries::new(users.clone(), points);
        let id = UserId::new();
        users
            .upsert(
                &id.to_string(),
                UserView {
                    user_id: id,
                    name: "Lin".into(),
                    email: "lin@example.com".into(),
                    created_at: at(1),
                    updated_at: at(1),
                    version: 1,
                },
            )
            .await
            .unwrap();

        let found = queries.user_by_email("Lin@Example.com").await.unwrap();
        assert_eq!(found.map(|u| u.user_id), Some(id));
        assert_eq!(queries.user_by_email("nobody@example.com").await.unwrap(), None);
        assert_eq!(queries.consistency_points(&id).await.unwrap(), None);
    }
}
