//! The goal and user aggregates, with their commands, events and errors.

pub mod goal;
pub mod user;

pub use goal::{Goal, GoalCommand, GoalError, GoalEvent, GoalId, GoalState, GoalStatus};
pub use user::{User, UserCommand, UserError, UserEvent, UserId, UserState};
