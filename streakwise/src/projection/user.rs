//! User read models.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    Result, StoredEvent,
    bus::EventHandler,
    domain::{UserEvent, UserId},
    projection::SharedProjectionStore,
};

/// Public profile of a user. The password hash never reaches this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    /// The user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Contact and login address.
    pub email: String,
    /// When the user registered.
    pub created_at: DateTime<Utc>,
    /// When the profile last changed.
    pub updated_at: DateTime<Utc>,
    /// Stream version of the last profile event reflected in this row.
    pub version: i64,
}

/// Running consistency-point balance of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyPointsView {
    /// The user.
    pub user_id: UserId,
    /// Balance, copied from the latest award.
    pub total_points: u64,
    /// Points added by the latest award.
    pub last_points: u32,
    /// Reason given for the latest award.
    pub last_reason: Option<String>,
    /// When the balance last changed.
    pub last_updated: DateTime<Utc>,
    /// Stream version of the last points event reflected in this row.
    pub version: i64,
}

/// Computes the profile row after `event`, or `None` if nothing changes.
pub fn project_user(current: Option<UserView>, event: &StoredEvent<UserEvent>) -> Option<UserView> {
    let version = event.version();
    if current.as_ref().is_some_and(|row| row.version >= version) {
        return None;
    }
    match (event.event(), current) {
        (
            UserEvent::UserCreated {
                user_id,
                name,
                email,
                created_at,
                ..
            },
            None,
        ) => Some(UserView {
            user_id: *user_id,
            name: name.clone(),
            email: email.clone(),
            created_at: *created_at,
            updated_at: *created_at,
            version,
        }),
        (
            UserEvent::UserProfileUpdated {
                name,
                email,
                updated_at,
                ..
            },
            Some(mut row),
        ) => {
            row.name.clone_from(name);
            row.email.clone_from(email);
            row.updated_at = *updated_at;
            row.version = version;
            Some(row)
        }
        _ => None,
    }
}

/// Computes the points row after `event`, or `None` if nothing changes.
///
/// Awards carry the running total, so the row replicates it instead of adding.
pub fn project_points(
    current: Option<ConsistencyPointsView>,
    event: &StoredEvent<UserEvent>,
) -> Option<ConsistencyPointsView> {
    let version = event.version();
    if current.as_ref().is_some_and(|row| row.version >= version) {
        return None;
    }
    match (event.event(), current) {
        (
            UserEvent::UserCreated {
                user_id,
                created_at,
                ..
            },
            None,
        ) => Some(ConsistencyPointsView {
            user_id: *user_id,
            total_points: 0,
            last_points: 0,
            last_reason: None,
            last_updated: *created_at,
            version,
        }),
        (
            UserEvent::ConsistencyPointsAwarded {
                points,
                total_points,
                reason,
                awarded_at,
                ..
            },
            Some(mut row),
        ) => {
            row.total_points = *total_points;
            row.last_points = *points;
            row.last_reason = Some(reason.clone());
            row.last_updated = *awarded_at;
            row.version = version;
            Some(row)
        }
        _ => None,
    }
}

/// Maintains [`UserView`] and [`ConsistencyPointsView`] rows.
pub struct UserProjector {
    users: SharedProjectionStore<UserView>,
    points: SharedProjectionStore<ConsistencyPointsView>,
}

impl UserProjector {
    /// Creates a projector writing to the given stores.
    pub fn new(
        users: SharedProjectionStore<UserView>,
        points: SharedProjectionStore<ConsistencyPointsView>,
    ) -> Self {
        Self { users, points }
    }
}

#[async_trait]
impl EventHandler<UserEvent> for UserProjector {
    fn name(&self) -> &'static str {
        "user-projector"
    }

    #[instrument(
        skip(self, event),
        fields(user.id = event.aggregate_id(), version = event.version())
    )]
    async fn handle(&self, event: &StoredEvent<UserEvent>) -> Result<()> {
        let key = event.event().user_id().to_string();
        match event.event() {
            UserEvent::UserCreated { .. } => {
                if let Some(row) = project_user(self.users.get(&key).await?, event) {
                    self.users.upsert(&key, row).await?;
                }
                if let Some(row) = project_points(self.points.get(&key).await?, event) {
                    self.points.upsert(&key, row).await?;
                }
            }
            UserEvent::UserProfileUpdated { .. } => {
                if let Some(row) = project_user(self.users.get(&key).await?, event) {
                    self.users.upsert(&key, row).await?;
                }
            }
            UserEvent::ConsistencyPointsAwarded { .. } => {
                if let Some(row) = project_points(self.points.get(&key).await?, event) {
                    self.points.upsert(&key, row).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        AggregateId,
        projection::{InMemoryProjectionStore, ProjectionStore},
    };

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 2, 10, minute, 0).unwrap()
    }

    fn stored(user_id: UserId, version: i64, event: UserEvent) -> StoredEvent<UserEvent> {
        StoredEvent::record(user_id.to_string(), version, at(59), event)
    }

    fn created(user_id: UserId) -> StoredEvent<UserEvent> {
        stored(
            user_id,
            1,
            UserEvent::UserCreated {
                user_id,
                name: "Ada".into(),
                email: "ada@example.com".into(),
                password_hash: "$argon2id$opaque".into(),
                created_at: at(0),
            },
        )
    }

    fn awarded(
        user_id: UserId,
        version: i64,
        points: u32,
        total_points: u64,
    ) -> StoredEvent<UserEvent> {
        stored(
            user_id,
            version,
            UserEvent::ConsistencyPointsAwarded {
                user_id,
                points,
                total_points,
                reason: "daily check-in".into(),
                awarded_at: at(version as u32),
            },
        )
    }

    fn projector() -> (
        Arc<InMemoryProjectionStore<UserView>>,
        Arc<InMemoryProjectionStore<ConsistencyPointsView>>,
        UserProjector,
    ) {
        let users = Arc::new(InMemoryProjectionStore::<UserView>::default());
        let points = Arc::new(InMemoryProjectionStore::<ConsistencyPointsView>::default());
        let projector = UserProjector::new(users.clone(), points.clone());
        (users, points, projector)
    }

    #[tokio::test]
    async fn registration_creates_profile_and_zero_balance() {
        let (users, points, projector) = projector();
        let id = UserId::new();

        projector.handle(&created(id)).await.unwrap();

        let profile = users.get(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(profile.name, "Ada");
        assert_eq!(profile.email, "ada@example.com");
        let balance = points.get(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(balance.total_points, 0);
        assert_eq!(balance.last_reason, None);
    }

    #[tokio::test]
    async fn balance_replicates_the_carried_total_without_double_counting() {
        let (_, points, projector) = projector();
        let id = UserId::new();
        projector.handle(&created(id)).await.unwrap();

        let first = awarded(id, 2, 10, 10);
        projector.handle(&first).await.unwrap();
        projector.handle(&awarded(id, 3, 5, 15)).await.unwrap();
        projector.handle(&first).await.unwrap();

        let balance = points.get(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(balance.total_points, 15);
        assert_eq!(balance.last_points, 5);
        assert_eq!(balance.version, 3);
        assert_eq!(balance.last_reason.as_deref(), Some("daily check-in"));
    }

    #[test]
    fn profile_update_without_a_row_is_a_no_op() {
        let id = UserId::new();
        let update = stored(
            id,
            2,
            UserEvent::UserProfileUpdated {
                user_id: id,
                name: "Grace".into(),
                email: "grace@example.com".into(),
                updated_at: at(5),
            },
        );
        assert_eq!(project_user(None, &update), None);
    }

    #[test]
    fn profile_rows_ignore_point_awards() {
        let id = UserId::new();
        let row = project_user(None, &created(id)).unwrap();
        assert_eq!(project_user(Some(row.clone()), &awarded(id, 2, 1, 1)), None);

        let update = stored(
            id,
            3,
            UserEvent::UserProfileUpdated {
                user_id: id,
                name: "Ada L.".into(),
                email: "ada@lovelace.dev".into(),
                updated_at: at(7),
            },
        );
        let row = project_user(Some(row), &update).unwrap();
        assert_eq!(row.name, "Ada L.");
        assert_eq!(row.version, 3);
        assert_eq!(row.updated_at, at(7));
    }
}
