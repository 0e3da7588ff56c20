//! Durable storage for confirmed assignments. Unconfirmed assignments are never persisted.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use paywall_core::types::{ExperimentId, Variant};
use tracing::debug;

use crate::error::AssignmentError;

pub type ConfirmedAssignments = HashMap<ExperimentId, Variant>;

#[async_trait]
pub trait AssignmentPersistence: Send + Sync {
    async fn load(&self) -> Result<ConfirmedAssignments, AssignmentError>;

    /// Replaces the stored record with `confirmed`.
    async fn save(&self, confirmed: &ConfirmedAssignments) -> Result<(), AssignmentError>;
}

/// Process-local store, mainly for tests and hosts without disk access.
#[derive(Default)]
pub struct InMemoryAssignmentPersistence {
    record: Mutex<ConfirmedAssignments>,
    saves: AtomicUsize,
}

impl InMemoryAssignmentPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: ConfirmedAssignments) -> Self {
        Self {
            record: Mutex::new(record),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> ConfirmedAssignments {
        self.record.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AssignmentPersistence for InMemoryAssignmentPersistence {
    async fn load(&self) -> Result<ConfirmedAssignments, AssignmentError> {
        Ok(self.record.lock().clone())
    }

    async fn save(&self, confirmed: &ConfirmedAssignments) -> Result<(), AssignmentError> {
        *self.record.lock() = confirmed.clone();
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// JSON file keyed by experiment id. Writes go to a sibling temp file first.
pub struct JsonFileAssignmentPersistence {
    path: PathBuf,
}

impl JsonFileAssignmentPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AssignmentPersistence for JsonFileAssignmentPersistence {
    async fn load(&self) -> Result<ConfirmedAssignments, AssignmentError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<ConfirmedAssignments>(&bytes)
                .map_err(|e| AssignmentError::Persistence(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No stored assignments yet");
                Ok(ConfirmedAssignments::new())
            }
            Err(e) => Err(AssignmentError::Persistence(e.to_string())),
        }
    }

    async fn save(&self, confirmed: &ConfirmedAssignments) -> Result<(), AssignmentError> {
        let ordered: BTreeMap<_, _> = confirmed.iter().collect();
        let json = serde_json::to_vec_pretty(&ordered)
            .map_err(|e| AssignmentError::Persistence(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AssignmentError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AssignmentError::Persistence(e.to_string()))
    }
}
