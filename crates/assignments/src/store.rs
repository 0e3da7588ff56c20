//! Per-user experiment assignments.
//!
//! A variant is drawn the first time an experiment is resolved and held as
//! *unconfirmed* until the host commits to showing it. Confirmation moves it to
//! the durable record and fires a postback. A confirmed entry always wins over
//! an unconfirmed one, so once an experiment is confirmed the user stays in
//! that variant.

use std::collections::HashMap;
use std::sync::Arc;

use paywall_core::types::{
    ConfirmableAssignment, Experiment, ExperimentId, ServerAssignment, Trigger, Variant,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::draw::choose_variant;
use crate::error::AssignmentError;
use crate::persistence::{AssignmentPersistence, ConfirmedAssignments};
use crate::postback::AssignmentPostback;

/// Outcome of [`AssignmentStore::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVariant {
    pub variant: Variant,
    /// `true` while the variant still needs a confirmation before it sticks.
    pub confirmable: bool,
}

struct AssignmentState {
    confirmed: ConfirmedAssignments,
    unconfirmed: HashMap<ExperimentId, Variant>,
    rng: StdRng,
}

pub struct AssignmentStore {
    state: Mutex<AssignmentState>,
    persistence: Arc<dyn AssignmentPersistence>,
    postback: Arc<dyn AssignmentPostback>,
    postbacks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AssignmentStore {
    /// Loads the confirmed record and builds a store drawing from entropy.
    pub async fn open(
        persistence: Arc<dyn AssignmentPersistence>,
        postback: Arc<dyn AssignmentPostback>,
    ) -> Result<Self, AssignmentError> {
        Self::open_with_rng(persistence, postback, StdRng::from_entropy()).await
    }

    /// Same as [`open`](Self::open) with a deterministic draw sequence.
    pub async fn open_seeded(
        persistence: Arc<dyn AssignmentPersistence>,
        postback: Arc<dyn AssignmentPostback>,
        seed: u64,
    ) -> Result<Self, AssignmentError> {
        Self::open_with_rng(persistence, postback, StdRng::seed_from_u64(seed)).await
    }

    async fn open_with_rng(
        persistence: Arc<dyn AssignmentPersistence>,
        postback: Arc<dyn AssignmentPostback>,
        rng: StdRng,
    ) -> Result<Self, AssignmentError> {
        let confirmed = persistence.load().await?;
        info!(confirmed = confirmed.len(), "Assignment store opened");
        Ok(Self {
            state: Mutex::new(AssignmentState {
                confirmed,
                unconfirmed: HashMap::new(),
                rng,
            }),
            persistence,
            postback,
            postbacks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Returns the user's variant for `experiment`, drawing one if none exists yet.
    pub async fn resolve(&self, experiment: &Experiment) -> Result<ResolvedVariant, AssignmentError> {
        let mut state = self.state.lock().await;

        if let Some(variant) = state.confirmed.get(&experiment.id) {
            return Ok(ResolvedVariant {
                variant: variant.clone(),
                confirmable: false,
            });
        }
        if let Some(variant) = state.unconfirmed.get(&experiment.id) {
            return Ok(ResolvedVariant {
                variant: variant.clone(),
                confirmable: true,
            });
        }

        let variant = match choose_variant(&experiment.variants, &mut state.rng) {
            Ok(variant) => variant,
            Err(e) => {
                warn!(experiment_id = %experiment.id, error = %e, "Variant draw failed");
                return Err(e);
            }
        };
        debug!(
            experiment_id = %experiment.id,
            variant_id = %variant.id,
            "Drew unconfirmed variant"
        );
        metrics::counter!("paywall.assignments.drawn").increment(1);
        state
            .unconfirmed
            .insert(experiment.id.clone(), variant.clone());
        Ok(ResolvedVariant {
            variant,
            confirmable: true,
        })
    }

    /// Makes an assignment sticky.
    ///
    /// Returns `Ok(true)` when this call performed the confirmation. Repeated or
    /// conflicting confirmations are no-ops returning `Ok(false)`, and only the
    /// first one triggers a postback.
    pub async fn confirm(&self, assignment: &ConfirmableAssignment) -> Result<bool, AssignmentError> {
        let mut state = self.state.lock().await;

        let existing = state
            .confirmed
            .get(&assignment.experiment_id)
            .map(|v| v.id.clone());
        if let Some(existing_id) = existing {
            if existing_id != assignment.variant.id {
                warn!(
                    experiment_id = %assignment.experiment_id,
                    confirmed_variant = %existing_id,
                    requested_variant = %assignment.variant.id,
                    "Ignoring confirmation for an experiment already confirmed to another variant"
                );
            }
            state.unconfirmed.remove(&assignment.experiment_id);
            return Ok(false);
        }

        state
            .confirmed
            .insert(assignment.experiment_id.clone(), assignment.variant.clone());
        if let Err(e) = self.persistence.save(&state.confirmed).await {
            state.confirmed.remove(&assignment.experiment_id);
            warn!(
                experiment_id = %assignment.experiment_id,
                error = %e,
                "Failed to persist confirmed assignment"
            );
            return Err(e);
        }
        state.unconfirmed.remove(&assignment.experiment_id);
        drop(state);

        info!(
            experiment_id = %assignment.experiment_id,
            variant_id = %assignment.variant.id,
            "Assignment confirmed"
        );
        metrics::counter!("paywall.assignments.confirmed").increment(1);

        let postback = self.postback.clone();
        let assignment = assignment.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = postback.post(&assignment).await {
                warn!(
                    experiment_id = %assignment.experiment_id,
                    error = %e,
                    "Assignment postback failed"
                );
            }
        });
        let mut postbacks = self.postbacks.lock();
        postbacks.retain(|h| !h.is_finished());
        postbacks.push(handle);
        Ok(true)
    }

    /// Waits for every postback started so far. Confirmation never waits on
    /// these; hosts call this before shutting the runtime down.
    pub async fn flush_postbacks(&self) {
        let pending = std::mem::take(&mut *self.postbacks.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Assignment postback task failed");
            }
        }
    }

    /// Drops every assignment, confirmed and unconfirmed.
    pub async fn clear(&self) -> Result<(), AssignmentError> {
        let mut state = self.state.lock().await;
        state.confirmed.clear();
        state.unconfirmed.clear();
        self.persistence.save(&state.confirmed).await?;
        info!("Assignments cleared");
        Ok(())
    }

    /// Brings assignments in line with a freshly loaded trigger set.
    ///
    /// Experiments are visited once per group. A confirmed variant that no longer
    /// exists in the experiment is dropped and redrawn as unconfirmed, and
    /// experiments without any assignment get an unconfirmed draw up front.
    pub async fn reconcile(&self, triggers: &[Trigger]) -> Result<(), AssignmentError> {
        let mut state = self.state.lock().await;
        let mut confirmed_changed = false;
        let mut seen_groups: Vec<&str> = Vec::new();

        for trigger in triggers {
            let Some(group_id) = trigger.rules.first().map(|r| r.experiment.group_id.as_str())
            else {
                continue;
            };
            if seen_groups.contains(&group_id) {
                continue;
            }
            seen_groups.push(group_id);

            for rule in &trigger.rules {
                let experiment = &rule.experiment;
                let confirmed_id = state.confirmed.get(&experiment.id).map(|v| v.id.clone());
                let confirmed_still_valid = match confirmed_id {
                    Some(id) if experiment.has_variant(&id) => true,
                    Some(id) => {
                        warn!(
                            experiment_id = %experiment.id,
                            variant_id = %id,
                            "Confirmed variant no longer offered, rerolling"
                        );
                        state.confirmed.remove(&experiment.id);
                        confirmed_changed = true;
                        false
                    }
                    None => false,
                };
                if confirmed_still_valid {
                    state.unconfirmed.remove(&experiment.id);
                    continue;
                }

                let unconfirmed_still_valid = state
                    .unconfirmed
                    .get(&experiment.id)
                    .is_some_and(|v| experiment.has_variant(&v.id));
                if unconfirmed_still_valid {
                    continue;
                }

                match choose_variant(&experiment.variants, &mut state.rng) {
                    Ok(variant) => {
                        state.unconfirmed.insert(experiment.id.clone(), variant);
                    }
                    Err(e) => {
                        state.unconfirmed.remove(&experiment.id);
                        debug!(experiment_id = %experiment.id, error = %e, "Skipping experiment during reconcile");
                    }
                }
            }
        }

        if confirmed_changed {
            self.persistence.save(&state.confirmed).await?;
        }
        debug!(
            confirmed = state.confirmed.len(),
            unconfirmed = state.unconfirmed.len(),
            "Assignments reconciled"
        );
        Ok(())
    }

    /// Adopts server-side assignments as confirmed. The server already knows
    /// about them, so no postback is sent. Assignments naming an experiment or
    /// variant absent from `triggers` are skipped.
    pub async fn transfer_server_assignments(
        &self,
        assignments: &[ServerAssignment],
        triggers: &[Trigger],
    ) -> Result<usize, AssignmentError> {
        if assignments.is_empty() {
            return Ok(0);
        }

        let experiments: HashMap<&str, &Experiment> = triggers
            .iter()
            .flat_map(|t| t.rules.iter())
            .map(|r| (r.experiment.id.as_str(), &r.experiment))
            .collect();

        let mut state = self.state.lock().await;
        let mut transferred = 0;
        for assignment in assignments {
            let option = experiments
                .get(assignment.experiment_id.as_str())
                .and_then(|exp| exp.variants.iter().find(|v| v.id == assignment.variant_id));
            let Some(option) = option else {
                debug!(
                    experiment_id = %assignment.experiment_id,
                    variant_id = %assignment.variant_id,
                    "Server assignment does not match loaded config"
                );
                continue;
            };
            state
                .confirmed
                .insert(assignment.experiment_id.clone(), option.to_variant());
            state.unconfirmed.remove(&assignment.experiment_id);
            transferred += 1;
        }

        if transferred > 0 {
            self.persistence.save(&state.confirmed).await?;
            info!(transferred, "Server assignments adopted");
        }
        Ok(transferred)
    }

    pub async fn confirmed(&self) -> ConfirmedAssignments {
        self.state.lock().await.confirmed.clone()
    }

    pub async fn unconfirmed(&self) -> HashMap<ExperimentId, Variant> {
        self.state.lock().await.unconfirmed.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryAssignmentPersistence;
    use crate::postback::PostbackError;
    use async_trait::async_trait;
    use paywall_core::types::{Rule, VariantKind, VariantOption};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPostback {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl AssignmentPostback for CountingPostback {
        async fn post(&self, _assignment: &ConfirmableAssignment) -> Result<(), PostbackError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingPostback;

    #[async_trait]
    impl AssignmentPostback for FailingPostback {
        async fn post(&self, _assignment: &ConfirmableAssignment) -> Result<(), PostbackError> {
            Err(PostbackError::Transport("offline".into()))
        }
    }

    fn variant(id: &str) -> Variant {
        Variant {
            id: id.into(),
            kind: VariantKind::Treatment,
            paywall_id: Some(format!("pw-{id}")),
        }
    }

    fn experiment(id: &str, variants: &[(&str, f64)]) -> Experiment {
        Experiment {
            id: id.into(),
            group_id: format!("{id}-group"),
            variants: variants
                .iter()
                .map(|(vid, weight)| VariantOption {
                    id: (*vid).into(),
                    weight: *weight,
                    kind: VariantKind::Treatment,
                    paywall_id: Some(format!("pw-{vid}")),
                })
                .collect(),
        }
    }

    fn trigger(event: &str, experiment: Experiment) -> Trigger {
        Trigger {
            event_name: event.into(),
            rules: vec![Rule {
                expression: None,
                occurrence: None,
                experiment,
                computed_properties: vec![],
                presentation_condition: None,
            }],
        }
    }

    async fn store_with(
        persistence: Arc<InMemoryAssignmentPersistence>,
        postback: Arc<CountingPostback>,
    ) -> AssignmentStore {
        AssignmentStore::open_seeded(persistence, postback, 9).await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_draws_once_and_stays_unconfirmed() {
        let store = store_with(Default::default(), Default::default()).await;
        let exp = experiment("exp", &[("a", 50.0), ("b", 50.0)]);

        let first = store.resolve(&exp).await.unwrap();
        assert!(first.confirmable);
        for _ in 0..20 {
            assert_eq!(store.resolve(&exp).await.unwrap(), first);
        }
        assert_eq!(store.unconfirmed().await.len(), 1);
        assert!(store.confirmed().await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_without_variants_fails() {
        let store = store_with(Default::default(), Default::default()).await;
        let err = store.resolve(&experiment("empty", &[])).await.unwrap_err();
        assert_eq!(err, AssignmentError::NoVariantsFound);
        assert!(store.unconfirmed().await.is_empty());
    }

    #[tokio::test]
    async fn test_confirmed_wins_over_unconfirmed() {
        let mut record = ConfirmedAssignments::new();
        record.insert("exp".into(), variant("v1"));
        let persistence = Arc::new(InMemoryAssignmentPersistence::with_record(record));
        let store = store_with(persistence, Default::default()).await;
        store
            .state
            .lock()
            .await
            .unconfirmed
            .insert("exp".into(), variant("v2"));

        let resolved = store
            .resolve(&experiment("exp", &[("v1", 1.0), ("v2", 1.0)]))
            .await
            .unwrap();
        assert_eq!(resolved.variant.id, "v1");
        assert!(!resolved.confirmable);
    }

    #[tokio::test]
    async fn test_confirm_persists_and_posts_once() {
        let persistence = Arc::new(InMemoryAssignmentPersistence::new());
        let postback = Arc::new(CountingPostback::default());
        let store = Arc::new(store_with(persistence.clone(), postback.clone()).await);
        let exp = experiment("exp", &[("a", 1.0), ("b", 1.0)]);
        let resolved = store.resolve(&exp).await.unwrap();
        let assignment = ConfirmableAssignment {
            experiment_id: "exp".into(),
            variant: resolved.variant.clone(),
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let assignment = assignment.clone();
                tokio::spawn(async move { store.confirm(&assignment).await.unwrap() })
            })
            .collect();
        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }
        store.flush_postbacks().await;

        assert_eq!(performed, 1);
        assert_eq!(postback.posts.load(Ordering::SeqCst), 1);
        assert_eq!(persistence.save_count(), 1);
        assert_eq!(persistence.snapshot().get("exp"), Some(&resolved.variant));
        assert!(store.unconfirmed().await.is_empty());

        let again = store.resolve(&exp).await.unwrap();
        assert_eq!(again.variant, resolved.variant);
        assert!(!again.confirmable);
    }

    #[tokio::test]
    async fn test_conflicting_confirm_is_ignored() {
        let store = store_with(Default::default(), Default::default()).await;
        let first = ConfirmableAssignment {
            experiment_id: "exp".into(),
            variant: variant("a"),
        };
        let second = ConfirmableAssignment {
            experiment_id: "exp".into(),
            variant: variant("b"),
        };
        assert!(store.confirm(&first).await.unwrap());
        assert!(!store.confirm(&second).await.unwrap());
        assert_eq!(store.confirmed().await.get("exp"), Some(&variant("a")));
    }

    #[tokio::test]
    async fn test_postback_failure_keeps_confirmation() {
        let persistence = Arc::new(InMemoryAssignmentPersistence::new());
        let store = AssignmentStore::open_seeded(persistence.clone(), Arc::new(FailingPostback), 1)
            .await
            .unwrap();
        let assignment = ConfirmableAssignment {
            experiment_id: "exp".into(),
            variant: variant("a"),
        };
        assert!(store.confirm(&assignment).await.unwrap());
        store.flush_postbacks().await;
        assert_eq!(persistence.snapshot().get("exp"), Some(&variant("a")));
    }

    #[tokio::test]
    async fn test_confirmed_survives_reopen() {
        let persistence = Arc::new(InMemoryAssignmentPersistence::new());
        let store = store_with(persistence.clone(), Default::default()).await;
        store
            .confirm(&ConfirmableAssignment {
                experiment_id: "exp".into(),
                variant: variant("b"),
            })
            .await
            .unwrap();
        store.resolve(&experiment("other", &[("x", 1.0)])).await.unwrap();

        let reopened = store_with(persistence, Default::default()).await;
        assert_eq!(reopened.confirmed().await.get("exp"), Some(&variant("b")));
        assert!(reopened.unconfirmed().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_drops_everything() {
        let persistence = Arc::new(InMemoryAssignmentPersistence::new());
        let store = store_with(persistence.clone(), Default::default()).await;
        store.resolve(&experiment("a", &[("x", 1.0)])).await.unwrap();
        store
            .confirm(&ConfirmableAssignment {
                experiment_id: "b".into(),
                variant: variant("y"),
            })
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.confirmed().await.is_empty());
        assert!(store.unconfirmed().await.is_empty());
        assert!(persistence.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_rerolls_vanished_confirmed_variant() {
        let mut record = ConfirmedAssignments::new();
        record.insert("exp".into(), variant("gone"));
        record.insert("kept".into(), variant("k1"));
        let persistence = Arc::new(InMemoryAssignmentPersistence::with_record(record));
        let store = store_with(persistence.clone(), Default::default()).await;

        let triggers = vec![
            trigger("open", experiment("exp", &[("new", 1.0)])),
            trigger("close", experiment("kept", &[("k1", 1.0), ("k2", 1.0)])),
            trigger("launch", experiment("fresh", &[("f", 1.0)])),
        ];
        store.reconcile(&triggers).await.unwrap();

        let confirmed = store.confirmed().await;
        assert!(!confirmed.contains_key("exp"));
        assert_eq!(confirmed.get("kept"), Some(&variant("k1")));
        let unconfirmed = store.unconfirmed().await;
        assert_eq!(unconfirmed.get("exp").map(|v| v.id.as_str()), Some("new"));
        assert_eq!(unconfirmed.get("fresh").map(|v| v.id.as_str()), Some("f"));
        assert!(!unconfirmed.contains_key("kept"));
        assert!(!persistence.snapshot().contains_key("exp"));
    }

    #[tokio::test]
    async fn test_transfer_server_assignments() {
        let persistence = Arc::new(InMemoryAssignmentPersistence::new());
        let postback = Arc::new(CountingPostback::default());
        let store = store_with(persistence.clone(), postback.clone()).await;
        let triggers = vec![trigger("open", experiment("exp", &[("a", 1.0), ("b", 1.0)]))];

        let transferred = store
            .transfer_server_assignments(
                &[
                    ServerAssignment {
                        experiment_id: "exp".into(),
                        variant_id: "b".into(),
                    },
                    ServerAssignment {
                        experiment_id: "unknown".into(),
                        variant_id: "z".into(),
                    },
                ],
                &triggers,
            )
            .await
            .unwrap();
        store.flush_postbacks().await;

        assert_eq!(transferred, 1);
        assert_eq!(persistence.snapshot().get("exp"), Some(&variant("b")));
        assert_eq!(postback.posts.load(Ordering::SeqCst), 0);
    }
}
