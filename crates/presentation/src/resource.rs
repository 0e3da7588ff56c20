//! Paywall resource fetching and the product-derived fields the core fills in.

use std::collections::HashSet;

use async_trait::async_trait;
use paywall_core::types::{AssignedExperiment, PaywallResource, ProductKind};
use paywall_core::PaywallError;
use thiserror::Error;
use tracing::debug;

use crate::config_manager::ModelHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("paywall {0} does not exist")]
    NotFound(String),

    #[error("no campaign config loaded")]
    ConfigUnavailable,

    #[error("transient failure fetching {hash}: {message}")]
    Transient { hash: String, message: String },
}

impl From<FetchError> for PaywallError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound(id) => PaywallError::PaywallNotFound(id),
            FetchError::ConfigUnavailable => PaywallError::ConfigUnavailable,
            FetchError::Transient { hash, message } => PaywallError::TransientFetch { hash, message },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaywallFetchRequest {
    pub identifier: Option<String>,
    pub event_name: Option<String>,
    pub locale: String,
    pub hash: String,
}

#[async_trait]
pub trait PaywallFetcher: Send + Sync {
    async fn fetch(&self, request: &PaywallFetchRequest) -> Result<PaywallResource, FetchError>;
}

/// Serves paywalls embedded in the current campaign model.
pub struct StaticPaywallFetcher {
    model: ModelHandle,
}

impl StaticPaywallFetcher {
    pub fn new(model: ModelHandle) -> Self {
        Self { model }
    }
}

#[async_trait]
impl PaywallFetcher for StaticPaywallFetcher {
    async fn fetch(&self, request: &PaywallFetchRequest) -> Result<PaywallResource, FetchError> {
        let model = self.model.current().ok_or(FetchError::ConfigUnavailable)?;
        let Some(identifier) = request.identifier.as_deref() else {
            return Err(FetchError::NotFound(request.hash.clone()));
        };
        debug!(identifier, locale = %request.locale, "Serving paywall from campaign config");
        model
            .paywall(identifier)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(identifier.to_string()))
    }
}

/// Free-trial eligibility follows the primary product. An already purchased
/// primary product is never eligible; `override_value` wins over both.
pub fn free_trial_available(
    resource: &PaywallResource,
    purchased_products: &HashSet<String>,
    override_value: Option<bool>,
) -> bool {
    if let Some(forced) = override_value {
        return forced;
    }
    resource
        .products
        .iter()
        .find(|p| p.kind == ProductKind::Primary)
        .is_some_and(|primary| primary.has_free_trial && !purchased_products.contains(&primary.id))
}

/// Attaches the experiment and computed free-trial flag to a fetched resource.
pub fn finalize(
    mut resource: PaywallResource,
    experiment: Option<AssignedExperiment>,
    purchased_products: &HashSet<String>,
    free_trial_override: Option<bool>,
) -> PaywallResource {
    resource.is_free_trial_available =
        free_trial_available(&resource, purchased_products, free_trial_override);
    resource.experiment = experiment;
    resource
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use paywall_core::types::{CampaignModel, PresentationCondition, ProductRef};
    use std::sync::Arc;

    fn resource(products: Vec<ProductRef>) -> PaywallResource {
        PaywallResource {
            identifier: "pw-annual".into(),
            products,
            presentation_condition: PresentationCondition::CheckUserSubscription,
            is_free_trial_available: false,
            payload: serde_json::Value::Null,
            experiment: None,
        }
    }

    fn product(id: &str, kind: ProductKind, has_free_trial: bool) -> ProductRef {
        ProductRef {
            id: id.into(),
            kind,
            has_free_trial,
        }
    }

    #[test]
    fn test_free_trial_from_primary_product() {
        let pw = resource(vec![
            product("monthly", ProductKind::Secondary, false),
            product("annual", ProductKind::Primary, true),
        ]);
        assert!(free_trial_available(&pw, &HashSet::new(), None));

        let purchased: HashSet<String> = ["annual".to_string()].into();
        assert!(!free_trial_available(&pw, &purchased, None));
        assert!(free_trial_available(&pw, &purchased, Some(true)));
    }

    #[test]
    fn test_no_primary_product_means_no_trial() {
        let pw = resource(vec![product("monthly", ProductKind::Secondary, true)]);
        assert!(!free_trial_available(&pw, &HashSet::new(), None));
    }

    #[tokio::test]
    async fn test_static_fetcher_reads_current_model() {
        let handle = ModelHandle::default();
        let fetcher = StaticPaywallFetcher::new(handle.clone());
        let request = PaywallFetchRequest {
            identifier: Some("pw-annual".into()),
            event_name: None,
            locale: "en_US".into(),
            hash: "pw-annual_en_US".into(),
        };
        assert_eq!(
            fetcher.fetch(&request).await.unwrap_err(),
            FetchError::ConfigUnavailable
        );

        handle.replace(Arc::new(CampaignModel {
            paywalls: vec![resource(vec![])],
            ..Default::default()
        }));
        assert_eq!(fetcher.fetch(&request).await.unwrap().identifier, "pw-annual");

        let missing = PaywallFetchRequest {
            identifier: Some("pw-gone".into()),
            ..request
        };
        assert_eq!(
            fetcher.fetch(&missing).await.unwrap_err(),
            FetchError::NotFound("pw-gone".into())
        );
    }
}
