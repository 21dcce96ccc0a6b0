//! The user aggregate.
//!
//! Users have no terminal state: profile updates and point awards are always
//! accepted once the user exists. The consistency-point total only grows; each
//! award event carries the running total computed when it was produced.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Aggregate, AggregateId, Error, Event, async_trait};

/// Identifies a user.
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
pub struct UserId(Uuid);

impl UserId {
    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl AggregateId for UserId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Commands accepted by [`User`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Register a new user.
    Register {
        /// Display name.
        name: String,
        /// Contact and login address.
        email: String,
        /// Opaque credential produced by the authentication layer.
        password_hash: String,
    },
    /// Change name and email.
    UpdateProfile {
        /// New display name.
        name: String,
        /// New email.
        email: String,
    },
    /// Add consistency points.
    AwardPoints {
        /// Points to add.
        points: u32,
        /// Why they were earned.
        reason: String,
    },
}

/// Facts recorded in a user's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Event)]
#[event(source = "urn:streakwise:user")]
pub enum UserEvent {
    /// A user registered.
    UserCreated {
        /// The user.
        user_id: UserId,
        /// Display name.
        name: String,
        /// Contact and login address.
        email: String,
        /// Opaque credential, never interpreted here.
        password_hash: String,
        /// When the user registered.
        created_at: DateTime<Utc>,
    },
    /// Name and email changed.
    UserProfileUpdated {
        /// The user.
        user_id: UserId,
        /// New display name.
        name: String,
        /// New email.
        email: String,
        /// When the profile changed.
        updated_at: DateTime<Utc>,
    },
    /// Points were awarded.
    ConsistencyPointsAwarded {
        /// The user.
        user_id: UserId,
        /// Points added by this award.
        points: u32,
        /// Running total after this award.
        total_points: u64,
        /// Why they were earned.
        reason: String,
        /// When they were awarded.
        awarded_at: DateTime<Utc>,
    },
}

impl UserEvent {
    /// The user this event belongs to.
    pub fn user_id(&self) -> UserId {
        match self {
            Self::UserCreated { user_id, .. }
            | Self::UserProfileUpdated { user_id, .. }
            | Self::ConsistencyPointsAwarded { user_id, .. } => *user_id,
        }
    }
}

/// Rejections produced by [`User`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UserError {
    /// The command needs an existing user.
    #[error("user {0} does not exist")]
    NotFound(UserId),
    /// A user with this id was already registered.
    #[error("user {0} already exists")]
    AlreadyExists(UserId),
}

impl From<UserError> for Error {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound(id) => Error::AggregateNotFound(id.to_string()),
            other => Error::DomainInvariantViolation(other.to_string()),
        }
    }
}

/// State of a registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserState {
    /// The user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Contact and login address.
    pub email: String,
    /// Opaque credential.
    pub password_hash: String,
    /// Running total of awarded points.
    pub total_consistency_points: u64,
    /// When the user registered.
    pub created_at: DateTime<Utc>,
    /// When the user last changed.
    pub updated_at: DateTime<Utc>,
}

/// The user aggregate. Empty until its `UserCreated` event is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    state: Option<UserState>,
    version: i64,
}

impl User {
    /// The user's state, or `None` before registration.
    pub fn state(&self) -> Option<&UserState> {
        self.state.as_ref()
    }

    fn existing(&self, id: &UserId) -> Result<&UserState, UserError> {
        self.state.as_ref().ok_or(UserError::NotFound(*id))
    }
}

#[async_trait]
impl Aggregate for User {
    type Id = UserId;
    type Event = UserEvent;
    type Command = UserCommand;
    type Error = UserError;

    fn id(&self) -> Option<&Self::Id> {
        self.state.as_ref().map(|s| &s.user_id)
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UserEvent::UserCreated {
                user_id,
                name,
                email,
                password_hash,
                created_at,
            } => {
                self.state = Some(UserState {
                    user_id: *user_id,
                    name: name.clone(),
                    email: email.clone(),
                    password_hash: password_hash.clone(),
                    total_consistency_points: 0,
                    created_at: *created_at,
                    updated_at: *created_at,
                });
            }
            UserEvent::UserProfileUpdated {
                name,
                email,
                updated_at,
                ..
            } => {
                if let Some(state) = self.state.as_mut() {
                    state.name = name.clone();
                    state.email = email.clone();
                    state.updated_at = *updated_at;
                }
            }
            UserEvent::ConsistencyPointsAwarded {
                total_points,
                awarded_at,
                ..
            } => {
                if let Some(state) = self.state.as_mut() {
                    state.total_consistency_points = *total_points;
                    state.updated_at = *awarded_at;
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
            UserCommand::Register {
                name,
                email,
                password_hash,
            } => {
                if self.state.is_some() {
                    return Err(UserError::AlreadyExists(*id));
                }
                Ok(vec![UserEvent::UserCreated {
                    user_id: *id,
                    name,
                    email,
                    password_hash,
                    created_at: now,
                }])
            }
            UserCommand::UpdateProfile { name, email } => {
                self.existing(id)?;
                Ok(vec![UserEvent::UserProfileUpdated {
                    user_id: *id,
                    name,
                    email,
                    updated_at: now,
                }])
            }
            UserCommand::AwardPoints { points, reason } => {
                let state = self.existing(id)?;
                Ok(vec![UserEvent::ConsistencyPointsAwarded {
                    user_id: *id,
                    points,
                    total_points: state
                        .total_consistency_points
                        .saturating_add(u64::from(points)),
                    reason,
                    awarded_at: now,
                }])
            }
        }
    }
}
