//! Presentation decision pipeline: turns a host event into a paywall, holdout
//! or no-op, wiring rule matching, variant assignment and the response cache.

#![warn(clippy::unwrap_used)]

pub mod config_manager;
pub mod context;
pub mod outcome;
pub mod pipeline;
pub mod preload;
pub mod request;
pub mod resource;

pub use config_manager::{
    removed_or_changed_paywalls, ConfigFetcher, ConfigManager, FileConfigFetcher, ModelHandle,
};
pub use context::{Collaborators, DecisionContext, PaywallCache, UserState};
pub use outcome::{PresentationOutcome, SkipReason};
pub use pipeline::PresentationPipeline;
pub use preload::{active_treatment_paywall_ids, treatment_paywall_ids};
pub use request::{PresentationOverrides, PresentationRequest, PresentationSubject};
pub use resource::{
    free_trial_available, FetchError, PaywallFetchRequest, PaywallFetcher, StaticPaywallFetcher,
};
