//! Decision event bus: trait for emitting analytics events from any stage.
//!
//! Components accept an `Arc<dyn EventSink>`; transport and serialization of the
//! events belong to the host application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionEventType {
    TriggerFire,
    Holdout,
    NoRuleMatch,
    EventNotFound,
    PaywallResponseLoadStart,
    PaywallResponseLoadComplete,
    PaywallResponseLoadFail,
    AssignmentConfirmed,
    PresentationSkipped,
    ConfigRefreshed,
    PaywallPreloadStart,
    PaywallPreloadComplete,
}

/// Analytics event emitted by the decision core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub event_id: Uuid,
    pub event_type: DecisionEventType,
    pub event_name: Option<String>,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
    pub paywall_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DecisionEvent);
}

/// No-op sink for tests and hosts that don't collect analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DecisionEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DecisionEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DecisionEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn count_type(&self, event_type: DecisionEventType) -> usize {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DecisionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Convenience builder for creating a `DecisionEvent` with minimal boilerplate.
pub fn make_event(event_type: DecisionEventType, event_name: Option<&str>) -> DecisionEvent {
    DecisionEvent {
        event_id: Uuid::new_v4(),
        event_type,
        event_name: event_name.map(str::to_string),
        experiment_id: None,
        variant_id: None,
        paywall_id: None,
        timestamp: Utc::now(),
    }
}

impl DecisionEvent {
    pub fn with_experiment(mut self, experiment_id: &str, variant_id: &str) -> Self {
        self.experiment_id = Some(experiment_id.to_string());
        self.variant_id = Some(variant_id.to_string());
        self
    }

    pub fn with_paywall(mut self, paywall_id: Option<&str>) -> Self {
        self.paywall_id = paywall_id.map(str::to_string);
        self
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
