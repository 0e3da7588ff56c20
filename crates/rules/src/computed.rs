//! Computed properties: whole time units elapsed since a host event last fired.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Utc};
use paywall_core::types::{ComputedPropertyKind, ComputedPropertyRequest};
use paywall_core::PassableValue;
use tracing::warn;

use crate::occurrence::OccurrenceCounter;

/// Resolves each request against the counter. Events never seen are left out of
/// the map so expressions observe them as missing.
pub async fn compute_properties(
    requests: &[ComputedPropertyRequest],
    counter: &dyn OccurrenceCounter,
    now: DateTime<Utc>,
) -> HashMap<String, PassableValue> {
    let mut properties = HashMap::with_capacity(requests.len());
    for request in requests {
        match counter.last_event(&request.event_name).await {
            Ok(Some(last)) => {
                let elapsed = units_since(request.kind, last, now);
                properties.insert(request.variable_name(), PassableValue::Int(elapsed));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    event_name = %request.event_name,
                    error = %e,
                    "Failed to read last event occurrence for computed property"
                );
            }
        }
    }
    properties
}

pub fn units_since(kind: ComputedPropertyKind, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let elapsed = to - from;
    match kind {
        ComputedPropertyKind::MinutesSince => elapsed.num_minutes(),
        ComputedPropertyKind::HoursSince => elapsed.num_hours(),
        ComputedPropertyKind::DaysSince => elapsed.num_days(),
        ComputedPropertyKind::MonthsSince => months_between(from, to),
        ComputedPropertyKind::YearsSince => months_between(from, to) / 12,
    }
}

/// Calendar months between two instants, counting only fully elapsed months.
fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    if to < from {
        return -months_between(to, from);
    }
    let mut months = (to.year() as i64 - from.year() as i64) * 12
        + (to.month() as i64 - from.month() as i64);
    let from_rest = (from.day(), from.time());
    let to_rest = (to.day(), to.time());
    if months > 0 && to_rest < from_rest {
        months -= 1;
    }
    months
}
