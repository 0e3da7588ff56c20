//! Paywall preloading: warms the response cache with the treatment paywalls a
//! user is likely to see next.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use paywall_cache::request_hash;
use paywall_core::event_bus::{make_event, DecisionEventType};
use paywall_core::types::{ExperimentId, Trigger, Variant, VariantKind};
use paywall_core::PaywallError;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::DecisionContext;
use crate::resource::PaywallFetchRequest;

/// Paywalls of the treatment variants the user is assigned to in `triggers`.
///
/// Confirmed assignments for experiments no longer offered by any trigger are
/// ignored. A confirmed variant wins over an unconfirmed one.
pub fn active_treatment_paywall_ids(
    triggers: &[Trigger],
    confirmed: &HashMap<ExperimentId, Variant>,
    unconfirmed: &HashMap<ExperimentId, Variant>,
) -> BTreeSet<String> {
    let offered: HashSet<&str> = triggers
        .iter()
        .flat_map(|t| &t.rules)
        .map(|r| r.experiment.id.as_str())
        .collect();

    offered
        .into_iter()
        .filter_map(|id| confirmed.get(id).or_else(|| unconfirmed.get(id)))
        .filter(|variant| variant.kind == VariantKind::Treatment)
        .filter_map(|variant| variant.paywall_id.clone())
        .collect()
}

/// Every treatment paywall reachable from `triggers`, regardless of assignment.
pub fn treatment_paywall_ids<'a>(
    triggers: impl IntoIterator<Item = &'a Trigger>,
) -> BTreeSet<String> {
    triggers
        .into_iter()
        .flat_map(|t| &t.rules)
        .flat_map(|r| &r.experiment.variants)
        .filter(|v| v.kind == VariantKind::Treatment)
        .filter_map(|v| v.paywall_id.clone())
        .collect()
}

impl DecisionContext {
    /// Preloads the paywalls of the user's active treatment assignments.
    /// Returns how many were loaded.
    pub async fn preload_all_paywalls(&self) -> usize {
        let Some(model) = self.config.model() else {
            debug!("No config loaded, nothing to preload");
            return 0;
        };
        let confirmed = self.assignments.confirmed().await;
        let unconfirmed = self.assignments.unconfirmed().await;
        let ids = active_treatment_paywall_ids(&model.triggers, &confirmed, &unconfirmed);
        self.preload(ids).await
    }

    /// Preloads every treatment paywall of the triggers for `event_names`.
    pub async fn preload_paywalls(&self, event_names: &[&str]) -> usize {
        let Some(model) = self.config.model() else {
            debug!("No config loaded, nothing to preload");
            return 0;
        };
        let by_event = model.triggers_by_event();
        let triggers = event_names.iter().filter_map(|name| by_event.get(name).copied());
        let ids = treatment_paywall_ids(triggers);
        self.preload(ids).await
    }

    async fn preload(&self, identifiers: BTreeSet<String>) -> usize {
        if !self.settings.cache.enabled {
            debug!("Response cache disabled, skipping preload");
            return 0;
        }
        self.events
            .emit(make_event(DecisionEventType::PaywallPreloadStart, None));

        let locale = self.settings.device.locale.clone();
        let mut tasks = JoinSet::new();
        for identifier in identifiers {
            let cache = Arc::clone(&self.cache);
            let fetcher = Arc::clone(&self.paywall_fetcher);
            let hash = request_hash(Some(identifier.as_str()), None, &locale);
            let request = PaywallFetchRequest {
                identifier: Some(identifier),
                event_name: None,
                locale: locale.clone(),
                hash: hash.clone(),
            };
            tasks.spawn(async move {
                let result = cache
                    .resolve(&hash, false, move || async move {
                        fetcher.fetch(&request).await.map_err(PaywallError::from)
                    })
                    .await;
                result.map_err(|e| (hash, e))
            });
        }

        let mut loaded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => loaded += 1,
                Ok(Err((hash, e))) => {
                    warn!(hash = %hash, error = %e, "Paywall preload failed")
                }
                Err(e) => warn!(error = %e, "Paywall preload task panicked"),
            }
        }

        info!(loaded, "Paywalls preloaded");
        self.events
            .emit(make_event(DecisionEventType::PaywallPreloadComplete, None));
        loaded
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config_manager::ConfigFetcher;
    use crate::context::Collaborators;
    use crate::request::PresentationRequest;
    use crate::resource::{FetchError, PaywallFetcher};
    use crate::PresentationOutcome;
    use async_trait::async_trait;
    use paywall_core::event_bus::capture_sink;
    use paywall_core::types::{
        CampaignModel, EventData, Experiment, PaywallResource, Rule, VariantOption,
    };
    use paywall_core::{AppConfig, PaywallResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedConfig(CampaignModel);

    #[async_trait]
    impl ConfigFetcher for FixedConfig {
        async fn fetch_config(&self) -> PaywallResult<CampaignModel> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaywallFetcher for CountingFetcher {
        async fn fetch(&self, request: &PaywallFetchRequest) -> Result<PaywallResource, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let identifier = request
                .identifier
                .clone()
                .ok_or_else(|| FetchError::NotFound(request.hash.clone()))?;
            serde_json::from_value(serde_json::json!({ "identifier": identifier })).map_err(|e| {
                FetchError::Transient {
                    hash: request.hash.clone(),
                    message: e.to_string(),
                }
            })
        }
    }

    fn variant(id: &str, kind: VariantKind) -> Variant {
        Variant {
            id: id.into(),
            kind,
            paywall_id: (kind == VariantKind::Treatment).then(|| format!("pw-{id}")),
        }
    }

    fn option(id: &str, kind: VariantKind) -> VariantOption {
        VariantOption {
            id: id.into(),
            weight: 1.0,
            kind,
            paywall_id: (kind == VariantKind::Treatment).then(|| format!("pw-{id}")),
        }
    }

    fn trigger(event_name: &str, experiment_id: &str, variants: Vec<VariantOption>) -> Trigger {
        Trigger {
            event_name: event_name.into(),
            rules: vec![Rule {
                expression: None,
                occurrence: None,
                experiment: Experiment {
                    id: experiment_id.into(),
                    group_id: format!("{experiment_id}-group"),
                    variants,
                },
                computed_properties: vec![],
                presentation_condition: None,
            }],
        }
    }

    #[test]
    fn test_active_ids_skip_holdouts_and_retired_experiments() {
        let triggers = vec![
            trigger("purchase", "exp-a", vec![option("a", VariantKind::Treatment)]),
            trigger("onboarding", "exp-b", vec![option("b", VariantKind::Treatment)]),
            trigger("session", "exp-c", vec![option("c", VariantKind::Holdout)]),
        ];
        let confirmed = HashMap::from([
            ("exp-a".to_string(), variant("a", VariantKind::Treatment)),
            ("exp-retired".to_string(), variant("old", VariantKind::Treatment)),
        ]);
        let unconfirmed = HashMap::from([
            ("exp-a".to_string(), variant("ignored", VariantKind::Treatment)),
            ("exp-b".to_string(), variant("b", VariantKind::Treatment)),
            ("exp-c".to_string(), variant("c", VariantKind::Holdout)),
        ]);

        let ids: Vec<_> = active_treatment_paywall_ids(&triggers, &confirmed, &unconfirmed)
            .into_iter()
            .collect();
        assert_eq!(ids, vec!["pw-a".to_string(), "pw-b".to_string()]);
    }

    #[test]
    fn test_trigger_ids_cover_every_treatment() {
        let triggers = vec![trigger(
            "purchase",
            "exp-a",
            vec![
                option("a1", VariantKind::Treatment),
                option("a2", VariantKind::Treatment),
                option("hold", VariantKind::Holdout),
            ],
        )];
        let ids: Vec<_> = treatment_paywall_ids(&triggers).into_iter().collect();
        assert_eq!(ids, vec!["pw-a1".to_string(), "pw-a2".to_string()]);
    }

    async fn context(settings: AppConfig) -> (DecisionContext, Arc<CountingFetcher>) {
        let model = CampaignModel {
            triggers: vec![
                trigger("purchase", "exp-a", vec![option("a", VariantKind::Treatment)]),
                trigger("onboarding", "exp-b", vec![option("b", VariantKind::Treatment)]),
            ],
            ..Default::default()
        };
        let fetcher = Arc::new(CountingFetcher::default());
        let mut collaborators = Collaborators::in_memory(Arc::new(FixedConfig(model)));
        collaborators.paywall_fetcher = Some(fetcher.clone());
        collaborators.events = capture_sink();
        let ctx = DecisionContext::new(settings, collaborators).await.unwrap();
        (ctx, fetcher)
    }

    #[tokio::test]
    async fn test_preloaded_paywall_needs_no_fetch_on_presentation() {
        let (ctx, fetcher) = context(AppConfig::default()).await;
        ctx.refresh().await.unwrap();

        assert_eq!(ctx.preload_all_paywalls().await, 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let outcome = ctx
            .present(&PresentationRequest::for_event(EventData::new("purchase")))
            .await;
        assert!(matches!(outcome, PresentationOutcome::Paywall { .. }));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preload_for_events_and_on_refresh() {
        let (ctx, fetcher) = context(AppConfig::default()).await;
        ctx.refresh().await.unwrap();
        assert_eq!(ctx.preload_paywalls(&["onboarding", "unknown"]).await, 1);
        assert!(ctx.cache.cached("pw-b_en_US").is_some());
        assert!(ctx.cache.cached("pw-a_en_US").is_none());

        let mut settings = AppConfig::default();
        settings.cache.preload = true;
        let (eager, eager_fetcher) = context(settings).await;
        eager.refresh().await.unwrap();
        assert_eq!(eager.cache.len(), 2);
        assert_eq!(eager_fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preload_is_skipped_when_cache_disabled() {
        let mut settings = AppConfig::default();
        settings.cache.enabled = false;
        let (ctx, fetcher) = context(settings).await;
        ctx.refresh().await.unwrap();
        assert_eq!(ctx.preload_all_paywalls().await, 0);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }
}
