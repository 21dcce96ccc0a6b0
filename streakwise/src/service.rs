//! Facades pairing the command side with the read side of each aggregate.
//!
//! A transport layer only needs these: commands go through the engine, reads
//! go to the projections.
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, instrument};

use crate::{
    AggregateId, Result,
    domain::{Goal, GoalCommand, GoalId, User, UserCommand, UserId},
    engine::AggregateEngine,
    projection::{
        goal::{GoalView, ProgressRecord},
        user::{ConsistencyPointsView, UserView},
    },
    query::{GoalQueries, UserQueries},
    repository::Repository,
    streak::StreakSummary,
};

/// Goal commands and queries.
pub struct GoalService<R: Repository<Goal>> {
    engine: Arc<AggregateEngine<Goal, R>>,
    queries: GoalQueries,
}

impl<R: Repository<Goal>> GoalService<R> {
    /// Creates a service over an engine and the matching queries.
    pub fn new(engine: Arc<AggregateEngine<Goal, R>>, queries: GoalQueries) -> Self {
        Self { engine, queries }
    }

    /// Creates a goal under a fresh id and returns the id.
    #[instrument(skip(self, description, tags))]
    pub async fn create_goal(
        &self,
        user_id: UserId,
        description: String,
        target_date: NaiveDate,
        category: Option<String>,
        tags: Vec<String>,
    ) -> Result<GoalId> {
        let goal_id = GoalId::new();
        self.engine
            .submit(
                &goal_id,
                GoalCommand::Create {
                    user_id,
                    description,
                    target_date,
                    category,
                    tags,
                },
            )
            .await?;
        info!(%goal_id, "goal created");
        Ok(goal_id)
    }

    /// Reports progress on a goal. 100 or more completes it.
    pub async fn update_progress(
        &self,
        goal_id: &GoalId,
        progress_percentage: f64,
        notes: Option<String>,
    ) -> Result<()> {
        self.engine
            .submit(
                goal_id,
                GoalCommand::UpdateProgress {
                    progress_percentage,
                    notes,
                },
            )
            .await?;
        Ok(())
    }

    /// Marks a goal as done.
    pub async fn complete_goal(&self, goal_id: &GoalId) -> Result<()> {
        self.engine.submit(goal_id, GoalCommand::Complete).await?;
        info!(%goal_id, "goal completed");
        Ok(())
    }

    /// See [`GoalQueries::goal`].
    pub async fn goal(&self, goal_id: &GoalId) -> Result<Option<GoalView>> {
        self.queries.goal(goal_id).await
    }

    /// See [`GoalQueries::goals_for_user`].
    pub async fn goals_for_user(&self, user_id: &UserId) -> Result<Vec<GoalView>> {
        self.queries.goals_for_user(user_id).await
    }

    /// See [`GoalQueries::progress_history`].
    pub async fn progress_history(&self, goal_id: &GoalId) -> Result<Vec<ProgressRecord>> {
        self.queries.progress_history(goal_id).await
    }

    /// See [`GoalQueries::streak`].
    pub async fn streak(&self, goal_id: &GoalId, today: NaiveDate) -> Result<StreakSummary> {
        self.queries.streak(goal_id, today).await
    }
}

/// User commands and queries.
pub struct UserService<R: Repository<User>> {
    engine: Arc<AggregateEngine<User, R>>,
    queries: UserQueries,
}

impl<R: Repository<User>> UserService<R> {
    /// Creates a service over an engine and the matching queries.
    pub fn new(engine: Arc<AggregateEngine<User, R>>, queries: UserQueries) -> Self {
        Self { engine, queries }
    }

    /// Registers a user under a fresh id and returns the id.
    ///
    /// `password_hash` is stored as given; hashing belongs to the caller.
    #[instrument(skip(self, password_hash))]
    pub async fn register_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
    ) -> Result<UserId> {
        let user_id = UserId::new();
        self.engine
            .submit(
                &user_id,
                UserCommand::Register {
                    name,
                    email,
                    password_hash,
                },
            )
            .await?;
        info!(%user_id, "user registered");
        Ok(user_id)
    }

    /// Replaces a user's name and email.
    pub async fn update_profile(
        &self,
        user_id: &UserId,
        name: String,
        email: String,
    ) -> Result<()> {
        self.engine
            .submit(user_id, UserCommand::UpdateProfile { name, email })
            .await?;
        Ok(())
    }

    /// Adds consistency points to a user's balance.
    pub async fn award_points(&self, user_id: &UserId, points: u32, reason: String) -> Result<()> {
        self.engine
            .submit(user_id, UserCommand::AwardPoints { points, reason })
            .await?;
        Ok(())
    }

    /// See [`UserQueries::user`].
    pub async fn user(&self, user_id: &UserId) -> Result<Option<UserView>> {
        self.queries.user(user_id).await
    }

    /// See [`UserQueries::user_by_email`].
    pub async fn user_by_email(&self, email: &str) -> Result<Option<UserView>> {
        self.queries.user_by_email(email).await
    }

    /// See [`UserQueries::consistency_points`].
    pub async fn consistency_points(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ConsistencyPointsView>> {
        self.queries.consistency_points(user_id).await
    }
}
