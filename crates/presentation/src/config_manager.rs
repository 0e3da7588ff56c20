//! Campaign config loading and wholesale model replacement.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use paywall_assignments::AssignmentStore;
use paywall_cache::request_hash;
use paywall_core::event_bus::{make_event, DecisionEventType, EventSink};
use paywall_core::types::CampaignModel;
use paywall_core::{PaywallError, PaywallResult};
use tracing::{debug, info, warn};

use crate::context::PaywallCache;

#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch_config(&self) -> PaywallResult<CampaignModel>;
}

/// Reads a campaign model from a JSON file on every refresh.
pub struct FileConfigFetcher {
    path: PathBuf,
}

impl FileConfigFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigFetcher for FileConfigFetcher {
    async fn fetch_config(&self) -> PaywallResult<CampaignModel> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            PaywallError::Config(format!("cannot read {}: {e}", self.path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Shared pointer to the current campaign model. Readers take an `Arc`
/// snapshot and keep it for the whole decision.
#[derive(Clone, Default)]
pub struct ModelHandle(Arc<RwLock<Option<Arc<CampaignModel>>>>);

impl ModelHandle {
    pub fn current(&self) -> Option<Arc<CampaignModel>> {
        self.0.read().clone()
    }

    pub fn replace(&self, model: Arc<CampaignModel>) {
        *self.0.write() = Some(model);
    }
}

/// Identifiers of paywalls that `new` dropped or whose content differs from `old`.
pub fn removed_or_changed_paywalls(old: &CampaignModel, new: &CampaignModel) -> BTreeSet<String> {
    let current: HashMap<&str, _> = new
        .paywalls
        .iter()
        .map(|p| (p.identifier.as_str(), p))
        .collect();
    old.paywalls
        .iter()
        .filter(|p| {
            current
                .get(p.identifier.as_str())
                .map_or(true, |fresh| *fresh != *p)
        })
        .map(|p| p.identifier.clone())
        .collect()
}

pub struct ConfigManager {
    fetcher: Arc<dyn ConfigFetcher>,
    model: ModelHandle,
    assignments: Arc<AssignmentStore>,
    cache: Arc<PaywallCache>,
    /// Locale the cached paywall hashes were built with.
    locale: String,
    events: Arc<dyn EventSink>,
}

impl ConfigManager {
    pub fn new(
        fetcher: Arc<dyn ConfigFetcher>,
        model: ModelHandle,
        assignments: Arc<AssignmentStore>,
        cache: Arc<PaywallCache>,
        locale: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            fetcher,
            model,
            assignments,
            cache,
            locale: locale.into(),
            events,
        }
    }

    /// Fetches config, swaps the model in, evicts cached paywalls the new
    /// model removed or changed, then reconciles assignments.
    /// On fetch failure the previous model stays active.
    pub async fn refresh(&self) -> PaywallResult<Arc<CampaignModel>> {
        let model = match self.fetcher.fetch_config().await {
            Ok(model) => Arc::new(model),
            Err(e) => {
                warn!(error = %e, "Config refresh failed, keeping previous model");
                return Err(e);
            }
        };
        let previous = self.model.current();
        self.model.replace(model.clone());
        let evicted = match previous {
            Some(previous) => self.evict_stale_paywalls(&previous, &model),
            None => 0,
        };

        self.assignments.reconcile(&model.triggers).await?;
        let transferred = self
            .assignments
            .transfer_server_assignments(&model.assignments, &model.triggers)
            .await?;

        info!(
            triggers = model.triggers.len(),
            paywalls = model.paywalls.len(),
            transferred,
            evicted,
            request_id = model.request_id.as_deref().unwrap_or("-"),
            "Campaign config refreshed"
        );
        self.events
            .emit(make_event(DecisionEventType::ConfigRefreshed, None));
        Ok(model)
    }

    fn evict_stale_paywalls(&self, previous: &CampaignModel, model: &CampaignModel) -> usize {
        let stale = removed_or_changed_paywalls(previous, model);
        for identifier in &stale {
            debug!(paywall = %identifier, "Evicting stale paywall");
            self.cache
                .invalidate(&request_hash(Some(identifier.as_str()), None, &self.locale));
        }
        stale.len()
    }

    pub fn model(&self) -> Option<Arc<CampaignModel>> {
        self.model.current()
    }

    /// Correlation id returned with the last loaded config.
    pub fn request_id(&self) -> Option<String> {
        self.model.current().and_then(|m| m.request_id.clone())
    }
}
