use paywall_core::PaywallError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssignmentError {
    #[error("experiment has no variants")]
    NoVariantsFound,

    #[error("variant draw reached an invalid state")]
    InvalidState,

    #[error("assignment persistence failed: {0}")]
    Persistence(String),
}

impl From<AssignmentError> for PaywallError {
    fn from(err: AssignmentError) -> Self {
        match err {
            AssignmentError::Persistence(msg) => PaywallError::Persistence(msg),
            other => PaywallError::Assignment(other.to_string()),
        }
    }
}
