use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::value::PassableValue;

pub type ExperimentId = String;

/// Campaign model delivered wholesale by a config refresh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignModel {
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Paywalls shipped alongside the config, usable without a network fetch.
    #[serde(default)]
    pub paywalls: Vec<PaywallResource>,
    /// Assignments the server already knows about for this user.
    #[serde(default)]
    pub assignments: Vec<ServerAssignment>,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl CampaignModel {
    pub fn trigger(&self, event_name: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.event_name == event_name)
    }

    /// Index of triggers by event name. Later duplicates lose to earlier ones.
    pub fn triggers_by_event(&self) -> HashMap<&str, &Trigger> {
        let mut map = HashMap::with_capacity(self.triggers.len());
        for trigger in &self.triggers {
            map.entry(trigger.event_name.as_str()).or_insert(trigger);
        }
        map
    }

    pub fn paywall(&self, identifier: &str) -> Option<&PaywallResource> {
        self.paywalls.iter().find(|p| p.identifier == identifier)
    }
}

// ─── Triggers & Rules ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub event_name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Absent means the rule always passes its expression check.
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub occurrence: Option<Occurrence>,
    pub experiment: Experiment,
    #[serde(default)]
    pub computed_properties: Vec<ComputedPropertyRequest>,
    /// Overrides the paywall's own presentation condition when set.
    #[serde(default)]
    pub presentation_condition: Option<PresentationCondition>,
}

/// Bounded-count throttle on how often a rule may match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Occurrence {
    pub key: String,
    pub max_count: u32,
    pub window: OccurrenceWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OccurrenceWindow {
    #[serde(rename = "since_install")]
    SinceInstall,
    #[serde(rename = "last_30_days")]
    Last30Days,
    #[serde(rename = "last_7_days")]
    Last7Days,
    #[serde(rename = "last_24_hours")]
    Last24Hours,
    #[serde(rename = "current_session")]
    CurrentSession,
    #[serde(rename = "today")]
    Today,
}

impl OccurrenceWindow {
    /// Earliest timestamp that still falls inside the window. `None` means unbounded.
    pub fn start(
        &self,
        now: DateTime<Utc>,
        session_start: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            OccurrenceWindow::SinceInstall => None,
            OccurrenceWindow::Last30Days => Some(now - chrono::Duration::days(30)),
            OccurrenceWindow::Last7Days => Some(now - chrono::Duration::days(7)),
            OccurrenceWindow::Last24Hours => Some(now - chrono::Duration::hours(24)),
            OccurrenceWindow::CurrentSession => Some(session_start.unwrap_or(now)),
            OccurrenceWindow::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputedPropertyKind {
    MinutesSince,
    HoursSince,
    DaysSince,
    MonthsSince,
    YearsSince,
}

impl ComputedPropertyKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ComputedPropertyKind::MinutesSince => "minutesSince_",
            ComputedPropertyKind::HoursSince => "hoursSince_",
            ComputedPropertyKind::DaysSince => "daysSince_",
            ComputedPropertyKind::MonthsSince => "monthsSince_",
            ComputedPropertyKind::YearsSince => "yearsSince_",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputedPropertyRequest {
    #[serde(rename = "type")]
    pub kind: ComputedPropertyKind,
    pub event_name: String,
}

impl ComputedPropertyRequest {
    /// Variable name the computed value is exposed under, e.g. `daysSince_app_open`.
    pub fn variable_name(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.event_name)
    }
}

// ─── Experimentation ────────────────────────────────────────────────────────

/// A/B/n unit referenced by a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub group_id: String,
    #[serde(default)]
    pub variants: Vec<VariantOption>,
}

impl Experiment {
    pub fn has_variant(&self, variant_id: &str) -> bool {
        self.variants.iter().any(|v| v.id == variant_id)
    }
}

/// A variant as configured, with its selection weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantOption {
    pub id: String,
    pub weight: f64,
    pub kind: VariantKind,
    #[serde(default)]
    pub paywall_id: Option<String>,
}

impl VariantOption {
    pub fn to_variant(&self) -> Variant {
        Variant {
            id: self.id.clone(),
            kind: self.kind,
            paywall_id: self.paywall_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Treatment,
    Holdout,
}

/// A variant a user has been assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub kind: VariantKind,
    #[serde(default)]
    pub paywall_id: Option<String>,
}

/// An experiment together with the variant resolved for this user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedExperiment {
    pub id: ExperimentId,
    pub group_id: String,
    pub variant: Variant,
}

/// Assignment that still has to be promoted from unconfirmed to confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmableAssignment {
    pub experiment_id: ExperimentId,
    pub variant: Variant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAssignment {
    pub experiment_id: ExperimentId,
    pub variant_id: String,
}

// ─── Paywalls ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationCondition {
    Always,
    #[default]
    CheckUserSubscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Primary,
    Secondary,
    Tertiary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRef {
    pub id: String,
    pub kind: ProductKind,
    #[serde(default)]
    pub has_free_trial: bool,
}

/// Opaque paywall payload plus the product data the decision core derives from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaywallResource {
    pub identifier: String,
    #[serde(default)]
    pub products: Vec<ProductRef>,
    #[serde(default)]
    pub presentation_condition: PresentationCondition,
    #[serde(default)]
    pub is_free_trial_available: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub experiment: Option<AssignedExperiment>,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// A named host event that may trigger a paywall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, PassableValue>,
    pub created_at: DateTime<Utc>,
}

impl EventData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<PassableValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Device attributes exposed to rule expressions under `device`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceAttributes {
    pub locale: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, PassableValue>,
}
