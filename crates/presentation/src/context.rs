//! Dependency-injected state shared by every decision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use paywall_assignments::{
    AssignmentPersistence, AssignmentPostback, AssignmentStore, EventSinkPostback,
    InMemoryAssignmentPersistence,
};
use paywall_cache::ResponseCoalescer;
use paywall_core::event_bus::{noop_sink, EventSink};
use paywall_core::types::{CampaignModel, DeviceAttributes, PaywallResource};
use paywall_core::{AppConfig, PassableValue, PaywallError, PaywallResult};
use paywall_rules::{
    ComparisonEvaluator, ExpressionEvaluator, InMemoryOccurrenceCounter, OccurrenceCounter,
    RuleEvaluator,
};
use tracing::info;

use crate::config_manager::{ConfigFetcher, ConfigManager, ModelHandle};
use crate::resource::{PaywallFetcher, StaticPaywallFetcher};

pub type PaywallCache = ResponseCoalescer<PaywallResource, PaywallError>;

/// External collaborators the decision core is built from.
pub struct Collaborators {
    pub config_fetcher: Arc<dyn ConfigFetcher>,
    /// Defaults to serving paywalls embedded in the campaign model.
    pub paywall_fetcher: Option<Arc<dyn PaywallFetcher>>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub occurrences: Arc<dyn OccurrenceCounter>,
    pub persistence: Arc<dyn AssignmentPersistence>,
    pub postback: Arc<dyn AssignmentPostback>,
    pub events: Arc<dyn EventSink>,
}

impl Collaborators {
    /// Process-local collaborators around the given config source.
    pub fn in_memory(config_fetcher: Arc<dyn ConfigFetcher>) -> Self {
        let events = noop_sink();
        Self {
            config_fetcher,
            paywall_fetcher: None,
            evaluator: ComparisonEvaluator::shared(),
            occurrences: Arc::new(InMemoryOccurrenceCounter::new()),
            persistence: Arc::new(InMemoryAssignmentPersistence::new()),
            postback: Arc::new(EventSinkPostback::new(events.clone())),
            events,
        }
    }
}

/// Host-supplied facts about the current user.
#[derive(Debug, Clone, Default)]
pub struct UserState {
    pub attributes: HashMap<String, PassableValue>,
    pub subscribed: bool,
    pub purchased_products: HashSet<String>,
}

pub struct DecisionContext {
    pub settings: AppConfig,
    pub config: ConfigManager,
    pub assignments: Arc<AssignmentStore>,
    pub cache: Arc<PaywallCache>,
    pub rules: RuleEvaluator,
    pub occurrences: Arc<dyn OccurrenceCounter>,
    pub paywall_fetcher: Arc<dyn PaywallFetcher>,
    pub events: Arc<dyn EventSink>,
    user: RwLock<UserState>,
}

impl DecisionContext {
    /// Opens the assignment store and wires the collaborators together.
    /// No config is loaded until [`ConfigManager::refresh`] succeeds.
    pub async fn new(settings: AppConfig, collaborators: Collaborators) -> PaywallResult<Self> {
        let Collaborators {
            config_fetcher,
            paywall_fetcher,
            evaluator,
            occurrences,
            persistence,
            postback,
            events,
        } = collaborators;

        let assignments = Arc::new(match settings.assignments.seed {
            Some(seed) => AssignmentStore::open_seeded(persistence, postback, seed).await?,
            None => AssignmentStore::open(persistence, postback).await?,
        });

        let model = ModelHandle::default();
        let paywall_fetcher: Arc<dyn PaywallFetcher> = match paywall_fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(StaticPaywallFetcher::new(model.clone())),
        };
        let cache = Arc::new(PaywallCache::new());
        let config = ConfigManager::new(
            config_fetcher,
            model,
            assignments.clone(),
            cache.clone(),
            settings.device.locale.clone(),
            events.clone(),
        );

        info!(
            locale = %settings.device.locale,
            cache_enabled = settings.cache.enabled,
            preload = settings.cache.preload,
            preview = settings.debug.preview,
            "Decision context ready"
        );

        Ok(Self {
            rules: RuleEvaluator::new(evaluator, occurrences.clone()),
            cache,
            settings,
            config,
            assignments,
            occurrences,
            paywall_fetcher,
            events,
            user: RwLock::new(UserState::default()),
        })
    }

    /// Refreshes config and, when enabled in settings, preloads the active
    /// treatment paywalls into the response cache.
    pub async fn refresh(&self) -> PaywallResult<Arc<CampaignModel>> {
        let model = self.config.refresh().await?;
        if self.settings.cache.preload {
            self.preload_all_paywalls().await;
        }
        Ok(model)
    }

    pub fn device(&self) -> DeviceAttributes {
        DeviceAttributes {
            locale: self.settings.device.locale.clone(),
            app_version: self.settings.device.app_version.clone(),
            platform: Some(self.settings.device.platform.clone()),
            extra: HashMap::new(),
        }
    }

    pub fn user(&self) -> UserState {
        self.user.read().clone()
    }

    pub fn set_user_attribute(&self, key: impl Into<String>, value: impl Into<PassableValue>) {
        self.user.write().attributes.insert(key.into(), value.into());
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.user.write().subscribed = subscribed;
    }

    pub fn record_purchase(&self, product_id: impl Into<String>) {
        self.user.write().purchased_products.insert(product_id.into());
    }

    /// Identity reset: drops every assignment, memoized paywall and user attribute.
    pub async fn reset(&self) -> PaywallResult<()> {
        self.assignments.clear().await?;
        self.cache.clear();
        let mut user = self.user.write();
        user.attributes.clear();
        user.purchased_products.clear();
        info!("Decision context reset");
        Ok(())
    }
}
