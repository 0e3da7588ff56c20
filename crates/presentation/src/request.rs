//! What the host asks the decision core to present.

use paywall_core::types::EventData;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresentationSubject {
    /// A host event evaluated against the campaign's triggers.
    Event { event: EventData },
    /// A specific paywall, bypassing rules and assignment.
    Paywall { identifier: String },
}

/// Per-request overrides of the default presentation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationOverrides {
    /// Present even when the user already has an active subscription.
    #[serde(default)]
    pub ignore_subscription_status: bool,
    /// When false the response cache is skipped and the paywall refetched.
    #[serde(default = "default_true")]
    pub allow_cache: bool,
    /// Forces free-trial availability either way.
    #[serde(default)]
    pub free_trial: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for PresentationOverrides {
    fn default() -> Self {
        Self {
            ignore_subscription_status: false,
            allow_cache: true,
            free_trial: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentationRequest {
    pub subject: PresentationSubject,
    #[serde(default)]
    pub overrides: PresentationOverrides,
    /// Debug preview: skips the subscription gate and the response cache.
    #[serde(default)]
    pub preview: bool,
    /// Runs every stage but never confirms assignments or records occurrences.
    #[serde(default)]
    pub speculative: bool,
}

impl PresentationRequest {
    pub fn for_event(event: EventData) -> Self {
        Self::new(PresentationSubject::Event { event })
    }

    pub fn for_paywall(identifier: impl Into<String>) -> Self {
        Self::new(PresentationSubject::Paywall {
            identifier: identifier.into(),
        })
    }

    fn new(subject: PresentationSubject) -> Self {
        Self {
            subject,
            overrides: PresentationOverrides::default(),
            preview: false,
            speculative: false,
        }
    }

    pub fn ignoring_subscription_status(mut self) -> Self {
        self.overrides.ignore_subscription_status = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.overrides.allow_cache = false;
        self
    }

    pub fn with_free_trial_override(mut self, available: bool) -> Self {
        self.overrides.free_trial = Some(available);
        self
    }

    pub fn preview(mut self) -> Self {
        self.preview = true;
        self
    }

    pub fn speculative(mut self) -> Self {
        self.speculative = true;
        self
    }

    pub fn event(&self) -> Option<&EventData> {
        match &self.subject {
            PresentationSubject::Event { event } => Some(event),
            PresentationSubject::Paywall { .. } => None,
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event().map(|e| e.name.as_str())
    }

    pub fn paywall_identifier(&self) -> Option<&str> {
        match &self.subject {
            PresentationSubject::Paywall { identifier } => Some(identifier),
            PresentationSubject::Event { .. } => None,
        }
    }
}
