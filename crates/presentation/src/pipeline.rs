//! Ordered presentation stages.
//!
//! Each stage either lets the decision continue or ends it with a terminal
//! [`PresentationOutcome`]. Side effects that commit the user to a variant
//! (assignment confirmation, occurrence recording) happen only in the final
//! stage or on holdout, and never for speculative requests.

use std::ops::ControlFlow;
use std::sync::Arc;

use paywall_cache::request_hash;
use paywall_core::event_bus::{make_event, DecisionEventType};
use paywall_core::types::{
    AssignedExperiment, CampaignModel, ConfirmableAssignment, DeviceAttributes, PaywallResource,
    PresentationCondition, VariantKind,
};
use paywall_core::PaywallError;
use paywall_rules::{MatchedRule, RuleInput, RuleOutcome};
use tracing::{debug, info, warn};

use crate::context::{DecisionContext, UserState};
use crate::outcome::{PresentationOutcome, SkipReason};
use crate::request::PresentationRequest;
use crate::resource::{finalize, PaywallFetchRequest};

type Stage = ControlFlow<PresentationOutcome>;

macro_rules! stage {
    ($stage:expr) => {
        if let ControlFlow::Break(outcome) = $stage {
            return outcome;
        }
    };
}

/// Request-scoped state threaded through the stages.
struct Decision<'r> {
    request: &'r PresentationRequest,
    model: Option<Arc<CampaignModel>>,
    user: UserState,
    device: DeviceAttributes,
    matched: Option<MatchedRule>,
    experiment: Option<AssignedExperiment>,
    confirmable: bool,
    resource: Option<PaywallResource>,
}

pub struct PresentationPipeline<'a> {
    ctx: &'a DecisionContext,
}

impl<'a> PresentationPipeline<'a> {
    pub fn new(ctx: &'a DecisionContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, request: &PresentationRequest) -> PresentationOutcome {
        let outcome = self.decide(request).await;
        metrics::counter!("paywall.presentation.outcomes", "outcome" => outcome.label())
            .increment(1);
        info!(
            event_name = request.event_name().unwrap_or("-"),
            paywall = request.paywall_identifier().unwrap_or("-"),
            outcome = outcome.label(),
            experiment_id = outcome.experiment().map(|e| e.id.as_str()).unwrap_or("-"),
            speculative = request.speculative,
            "Presentation decided"
        );
        outcome
    }

    async fn decide(&self, request: &PresentationRequest) -> PresentationOutcome {
        let mut decision = Decision {
            request,
            model: self.ctx.config.model(),
            user: self.ctx.user(),
            device: self.ctx.device(),
            matched: None,
            experiment: None,
            confirmable: false,
            resource: None,
        };

        self.record_event(&decision).await;
        stage!(self.match_rule(&mut decision).await);
        stage!(self.resolve_variant(&mut decision).await);
        stage!(self.fetch_paywall(&mut decision).await);
        stage!(self.check_subscription(&decision));
        self.commit(&decision).await;

        match decision.resource {
            Some(resource) => PresentationOutcome::Paywall {
                resource,
                experiment: decision.experiment,
            },
            None => PresentationOutcome::Error {
                cause: PaywallError::PaywallNotFound(
                    request.paywall_identifier().unwrap_or("-").to_string(),
                ),
            },
        }
    }

    async fn record_event(&self, decision: &Decision<'_>) {
        let Some(event) = decision.request.event() else {
            return;
        };
        if decision.request.speculative {
            return;
        }
        if let Err(e) = self
            .ctx
            .occurrences
            .record_event(&event.name, event.created_at)
            .await
        {
            warn!(event_name = %event.name, error = %e, "Failed to record event");
        }
    }

    async fn match_rule(&self, decision: &mut Decision<'_>) -> Stage {
        let Some(event) = decision.request.event() else {
            return ControlFlow::Continue(());
        };
        let input = RuleInput {
            event,
            device: &decision.device,
            user: &decision.user.attributes,
        };

        match self.ctx.rules.evaluate(input, decision.model.as_deref()).await {
            RuleOutcome::Matched(matched) => {
                decision.matched = Some(matched);
                ControlFlow::Continue(())
            }
            RuleOutcome::NoMatch(unmatched) => {
                self.ctx
                    .events
                    .emit(make_event(DecisionEventType::NoRuleMatch, Some(&event.name)));
                ControlFlow::Break(PresentationOutcome::NoRuleMatch { unmatched })
            }
            RuleOutcome::EventNotFound => {
                self.ctx
                    .events
                    .emit(make_event(DecisionEventType::EventNotFound, Some(&event.name)));
                ControlFlow::Break(PresentationOutcome::EventNotFound)
            }
        }
    }

    async fn resolve_variant(&self, decision: &mut Decision<'_>) -> Stage {
        let Some(experiment) = decision.matched.as_ref().map(|m| m.rule.experiment.clone()) else {
            return ControlFlow::Continue(());
        };
        let resolved = match self.ctx.assignments.resolve(&experiment).await {
            Ok(resolved) => resolved,
            Err(e) => {
                return ControlFlow::Break(PresentationOutcome::Error { cause: e.into() });
            }
        };

        let assigned = AssignedExperiment {
            id: experiment.id.clone(),
            group_id: experiment.group_id.clone(),
            variant: resolved.variant,
        };
        let request = decision.request;
        let event_name = request.event_name();
        self.ctx.events.emit(
            make_event(DecisionEventType::TriggerFire, event_name)
                .with_experiment(&assigned.id, &assigned.variant.id),
        );
        decision.confirmable = resolved.confirmable;
        decision.experiment = Some(assigned.clone());

        if assigned.variant.kind == VariantKind::Holdout {
            self.ctx.events.emit(
                make_event(DecisionEventType::Holdout, event_name)
                    .with_experiment(&assigned.id, &assigned.variant.id),
            );
            self.commit(decision).await;
            return ControlFlow::Break(PresentationOutcome::Holdout {
                experiment: assigned,
            });
        }
        ControlFlow::Continue(())
    }

    async fn fetch_paywall(&self, decision: &mut Decision<'_>) -> Stage {
        let request = decision.request;
        let identifier = request.paywall_identifier().map(str::to_string).or_else(|| {
            decision
                .experiment
                .as_ref()
                .and_then(|e| e.variant.paywall_id.clone())
        });
        let event_name = request.event_name().map(str::to_string);
        let locale = decision.device.locale.clone();
        let hash = request_hash(identifier.as_deref(), event_name.as_deref(), &locale);
        let bypass_cache = self.is_preview(request)
            || !request.overrides.allow_cache
            || !self.ctx.settings.cache.enabled;

        self.ctx.events.emit(
            make_event(DecisionEventType::PaywallResponseLoadStart, event_name.as_deref())
                .with_paywall(identifier.as_deref()),
        );
        debug!(hash = %hash, bypass_cache, "Resolving paywall");

        let fetcher = self.ctx.paywall_fetcher.clone();
        let fetch_request = PaywallFetchRequest {
            identifier: identifier.clone(),
            event_name: event_name.clone(),
            locale,
            hash: hash.clone(),
        };
        let result = self
            .ctx
            .cache
            .resolve(&hash, bypass_cache, move || async move {
                fetcher
                    .fetch(&fetch_request)
                    .await
                    .map_err(PaywallError::from)
            })
            .await;

        match result {
            Ok(resource) => {
                self.ctx.events.emit(
                    make_event(
                        DecisionEventType::PaywallResponseLoadComplete,
                        event_name.as_deref(),
                    )
                    .with_paywall(Some(&resource.identifier)),
                );
                decision.resource = Some(finalize(
                    resource,
                    decision.experiment.clone(),
                    &decision.user.purchased_products,
                    request.overrides.free_trial,
                ));
                ControlFlow::Continue(())
            }
            Err(cause) => {
                warn!(hash = %hash, error = %cause, "Paywall could not be resolved");
                self.ctx.events.emit(
                    make_event(DecisionEventType::PaywallResponseLoadFail, event_name.as_deref())
                        .with_paywall(identifier.as_deref()),
                );
                ControlFlow::Break(PresentationOutcome::Error { cause })
            }
        }
    }

    fn check_subscription(&self, decision: &Decision<'_>) -> Stage {
        let request = decision.request;
        if !decision.user.subscribed || self.is_preview(request) {
            return ControlFlow::Continue(());
        }

        // A rule's condition takes precedence over the paywall's own.
        let condition = decision
            .matched
            .as_ref()
            .and_then(|m| m.rule.presentation_condition)
            .or_else(|| decision.resource.as_ref().map(|r| r.presentation_condition))
            .unwrap_or_default();
        if request.overrides.ignore_subscription_status
            || condition == PresentationCondition::Always
        {
            return ControlFlow::Continue(());
        }

        self.ctx.events.emit(
            make_event(DecisionEventType::PresentationSkipped, request.event_name())
                .with_paywall(decision.resource.as_ref().map(|r| r.identifier.as_str())),
        );
        ControlFlow::Break(PresentationOutcome::Skipped {
            reason: SkipReason::Subscribed,
        })
    }

    /// Confirms the assignment and records the throttle occurrence.
    async fn commit(&self, decision: &Decision<'_>) {
        if decision.request.speculative {
            debug!("Speculative request, nothing committed");
            return;
        }

        if let (true, Some(experiment)) = (decision.confirmable, decision.experiment.as_ref()) {
            let assignment = ConfirmableAssignment {
                experiment_id: experiment.id.clone(),
                variant: experiment.variant.clone(),
            };
            if let Err(e) = self.ctx.assignments.confirm(&assignment).await {
                warn!(experiment_id = %experiment.id, error = %e, "Assignment confirmation failed");
            }
        }

        if let Some(occurrence) = decision
            .matched
            .as_ref()
            .and_then(|m| m.unsaved_occurrence.as_ref())
        {
            if let Err(e) = self.ctx.occurrences.record(occurrence).await {
                warn!(key = %occurrence.key, error = %e, "Failed to record occurrence");
            }
        }
    }

    fn is_preview(&self, request: &PresentationRequest) -> bool {
        request.preview || self.ctx.settings.debug.preview
    }
}

impl DecisionContext {
    /// Runs one request through the presentation pipeline.
    pub async fn present(&self, request: &PresentationRequest) -> PresentationOutcome {
        PresentationPipeline::new(self).run(request).await
    }
}
