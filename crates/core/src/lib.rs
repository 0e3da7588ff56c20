#![warn(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;
pub mod value;

pub use config::AppConfig;
pub use error::{PaywallError, PaywallResult};
pub use value::PassableValue;
