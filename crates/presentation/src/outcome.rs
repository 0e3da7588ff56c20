use paywall_core::types::{AssignedExperiment, PaywallResource};
use paywall_core::PaywallError;
use paywall_rules::UnmatchedRule;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The user already holds an active subscription.
    Subscribed,
}

/// Terminal result of one presentation decision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PresentationOutcome {
    Paywall {
        resource: PaywallResource,
        experiment: Option<AssignedExperiment>,
    },
    Holdout {
        experiment: AssignedExperiment,
    },
    NoRuleMatch {
        unmatched: Vec<UnmatchedRule>,
    },
    EventNotFound,
    Skipped {
        reason: SkipReason,
    },
    Error {
        #[serde(serialize_with = "serialize_display")]
        cause: PaywallError,
    },
}

impl PresentationOutcome {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Paywall { .. } => "paywall",
            Self::Holdout { .. } => "holdout",
            Self::NoRuleMatch { .. } => "no_rule_match",
            Self::EventNotFound => "event_not_found",
            Self::Skipped { .. } => "skipped",
            Self::Error { .. } => "error",
        }
    }

    pub fn experiment(&self) -> Option<&AssignedExperiment> {
        match self {
            Self::Paywall { experiment, .. } => experiment.as_ref(),
            Self::Holdout { experiment } => Some(experiment),
            _ => None,
        }
    }
}

fn serialize_display<S: Serializer>(err: &PaywallError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}
