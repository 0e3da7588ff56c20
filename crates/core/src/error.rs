use thiserror::Error;

pub type PaywallResult<T> = Result<T, PaywallError>;

#[derive(Error, Debug, Clone)]
pub enum PaywallError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config unavailable: no campaign model has been loaded")]
    ConfigUnavailable,

    #[error("Assignment error: {0}")]
    Assignment(String),

    #[error("Assignment persistence error: {0}")]
    Persistence(String),

    #[error("Paywall fetch failed for {hash}: {message}")]
    TransientFetch { hash: String, message: String },

    #[error("Paywall not found: {0}")]
    PaywallNotFound(String),

    #[error("Request abandoned: {0}")]
    Abandoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for PaywallError {
    fn from(err: serde_json::Error) -> Self {
        PaywallError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for PaywallError {
    fn from(err: std::io::Error) -> Self {
        PaywallError::Io(err.to_string())
    }
}
