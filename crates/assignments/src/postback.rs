//! Best-effort confirmation postback.

use std::sync::Arc;

use async_trait::async_trait;
use paywall_core::event_bus::{make_event, DecisionEventType, EventSink};
use paywall_core::types::ConfirmableAssignment;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PostbackError {
    #[error("postback transport failed: {0}")]
    Transport(String),
}

/// Reports `{experiment_id, variant_id}` after an assignment is confirmed.
#[async_trait]
pub trait AssignmentPostback: Send + Sync {
    async fn post(&self, assignment: &ConfirmableAssignment) -> Result<(), PostbackError>;
}

/// Routes confirmations into the analytics event sink.
pub struct EventSinkPostback {
    sink: Arc<dyn EventSink>,
}

impl EventSinkPostback {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl AssignmentPostback for EventSinkPostback {
    async fn post(&self, assignment: &ConfirmableAssignment) -> Result<(), PostbackError> {
        self.sink.emit(
            make_event(DecisionEventType::AssignmentConfirmed, None)
                .with_experiment(&assignment.experiment_id, &assignment.variant.id),
        );
        Ok(())
    }
}
