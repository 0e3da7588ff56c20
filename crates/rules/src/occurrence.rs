//! Occurrence counting: how often a rule fired inside its window, and when a
//! host event was last seen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use paywall_core::types::Occurrence;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OccurrenceError {
    #[error("occurrence store unavailable: {0}")]
    Unavailable(String),

    #[error("cannot compute window start for {0}")]
    Window(String),
}

#[async_trait]
pub trait OccurrenceCounter: Send + Sync {
    /// Prior firings of `occurrence.key` inside `occurrence.window`.
    async fn count(&self, occurrence: &Occurrence) -> Result<u32, OccurrenceError>;

    async fn record(&self, occurrence: &Occurrence) -> Result<(), OccurrenceError>;

    async fn record_event(&self, event_name: &str, at: DateTime<Utc>)
        -> Result<(), OccurrenceError>;

    async fn last_event(&self, event_name: &str) -> Result<Option<DateTime<Utc>>, OccurrenceError>;
}

/// Process-local counter. Rule occurrences and host events live in separate maps.
pub struct InMemoryOccurrenceCounter {
    occurrences: DashMap<String, Vec<DateTime<Utc>>>,
    events: DashMap<String, DateTime<Utc>>,
    session_start: DateTime<Utc>,
}

impl InMemoryOccurrenceCounter {
    pub fn new() -> Self {
        Self::with_session_start(Utc::now())
    }

    pub fn with_session_start(session_start: DateTime<Utc>) -> Self {
        Self {
            occurrences: DashMap::new(),
            events: DashMap::new(),
            session_start,
        }
    }

    pub fn record_at(&self, key: &str, at: DateTime<Utc>) {
        self.occurrences.entry(key.to_string()).or_default().push(at);
    }

    fn count_since(&self, key: &str, window_start: Option<DateTime<Utc>>) -> u32 {
        self.occurrences
            .get(key)
            .map(|history| {
                history
                    .iter()
                    .filter(|ts| window_start.map_or(true, |start| **ts >= start))
                    .count() as u32
            })
            .unwrap_or(0)
    }
}

impl Default for InMemoryOccurrenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OccurrenceCounter for InMemoryOccurrenceCounter {
    async fn count(&self, occurrence: &Occurrence) -> Result<u32, OccurrenceError> {
        let now = Utc::now();
        let start = occurrence.window.start(now, Some(self.session_start));
        if start.is_none() && occurrence.window != paywall_core::types::OccurrenceWindow::SinceInstall
        {
            return Err(OccurrenceError::Window(occurrence.key.clone()));
        }
        Ok(self.count_since(&occurrence.key, start))
    }

    async fn record(&self, occurrence: &Occurrence) -> Result<(), OccurrenceError> {
        self.record_at(&occurrence.key, Utc::now());
        Ok(())
    }

    async fn record_event(
        &self,
        event_name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), OccurrenceError> {
        self.events
            .entry(event_name.to_string())
            .and_modify(|last| {
                if at > *last {
                    *last = at;
                }
            })
            .or_insert(at);
        Ok(())
    }

    async fn last_event(&self, event_name: &str) -> Result<Option<DateTime<Utc>>, OccurrenceError> {
        Ok(self.events.get(event_name).map(|ts| *ts))
    }
}
