//! Sticky per-user experiment assignments with weighted random draws.

#![warn(clippy::unwrap_used)]

pub mod draw;
pub mod error;
pub mod persistence;
pub mod postback;
pub mod store;

pub use draw::choose_variant;
pub use error::AssignmentError;
pub use persistence::{
    AssignmentPersistence, ConfirmedAssignments, InMemoryAssignmentPersistence,
    JsonFileAssignmentPersistence,
};
pub use postback::{AssignmentPostback, EventSinkPostback, PostbackError};
pub use store::{AssignmentStore, ResolvedVariant};
