use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use paywall_core::types::{CampaignModel, DeviceAttributes, EventData, Occurrence, Rule};
use paywall_core::PassableValue;
use serde::Serialize;
use tracing::{debug, warn};

use crate::computed::compute_properties;
use crate::expression::{EvaluationContext, ExpressionEvaluator};
use crate::occurrence::OccurrenceCounter;

/// Result of matching an event against the campaign model.
#[derive(Debug, Clone)]
pub enum RuleOutcome {
    Matched(MatchedRule),
    NoMatch(Vec<UnmatchedRule>),
    EventNotFound,
}

#[derive(Debug, Clone)]
pub struct MatchedRule {
    pub rule: Rule,
    /// Set when the rule is throttled; recorded only once the match is acted on.
    pub unsaved_occurrence: Option<Occurrence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedRule {
    pub experiment_id: String,
    pub source: UnmatchedSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedSource {
    Expression,
    Occurrence,
    EvaluatorError(String),
}

/// Per-request inputs that feed the expression context.
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub event: &'a EventData,
    pub device: &'a DeviceAttributes,
    pub user: &'a HashMap<String, PassableValue>,
}

/// Finds the first rule of an event's trigger that passes both its expression
/// and its occurrence throttle.
#[derive(Clone)]
pub struct RuleEvaluator {
    expressions: Arc<dyn ExpressionEvaluator>,
    occurrences: Arc<dyn OccurrenceCounter>,
}

impl std::fmt::Debug for RuleEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEvaluator").finish_non_exhaustive()
    }
}

impl RuleEvaluator {
    pub fn new(
        expressions: Arc<dyn ExpressionEvaluator>,
        occurrences: Arc<dyn OccurrenceCounter>,
    ) -> Self {
        Self {
            expressions,
            occurrences,
        }
    }

    /// A missing model behaves like a model without the trigger.
    pub async fn evaluate(&self, input: RuleInput<'_>, model: Option<&CampaignModel>) -> RuleOutcome {
        let Some(trigger) = model.and_then(|m| m.trigger(&input.event.name)) else {
            debug!(event_name = %input.event.name, "No trigger configured for event");
            return RuleOutcome::EventNotFound;
        };

        let mut unmatched = Vec::new();
        for rule in &trigger.rules {
            match self.evaluate_rule(rule, input).await {
                Ok(unsaved_occurrence) => {
                    debug!(
                        event_name = %input.event.name,
                        experiment_id = %rule.experiment.id,
                        "Rule matched"
                    );
                    return RuleOutcome::Matched(MatchedRule {
                        rule: rule.clone(),
                        unsaved_occurrence,
                    });
                }
                Err(source) => {
                    debug!(
                        event_name = %input.event.name,
                        experiment_id = %rule.experiment.id,
                        ?source,
                        "Rule disqualified"
                    );
                    unmatched.push(UnmatchedRule {
                        experiment_id: rule.experiment.id.clone(),
                        source,
                    });
                }
            }
        }
        RuleOutcome::NoMatch(unmatched)
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        input: RuleInput<'_>,
    ) -> Result<Option<Occurrence>, UnmatchedSource> {
        if let Some(expression) = &rule.expression {
            let computed = compute_properties(
                &rule.computed_properties,
                self.occurrences.as_ref(),
                Utc::now(),
            )
            .await;
            let context = EvaluationContext::build(input.event, input.device, input.user, computed);
            match self.expressions.evaluate(expression, &context).await {
                Ok(true) => {}
                Ok(false) => return Err(UnmatchedSource::Expression),
                Err(e) => {
                    warn!(
                        experiment_id = %rule.experiment.id,
                        expression = %expression,
                        error = %e,
                        "Expression evaluation failed, skipping rule"
                    );
                    return Err(UnmatchedSource::EvaluatorError(e.to_string()));
                }
            }
        }

        let Some(occurrence) = &rule.occurrence else {
            return Ok(None);
        };

        // +1 accounts for the firing about to happen.
        let count = match self.occurrences.count(occurrence).await {
            Ok(prior) => prior.saturating_add(1),
            Err(e) => {
                warn!(
                    key = %occurrence.key,
                    error = %e,
                    "Occurrence count failed, treating rule as exhausted"
                );
                return Err(UnmatchedSource::Occurrence);
            }
        };
        if count > occurrence.max_count {
            return Err(UnmatchedSource::Occurrence);
        }
        Ok(Some(occurrence.clone()))
    }
}
