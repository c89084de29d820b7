use serde_json::Value;
use thiserror::Error;

use crate::event::EventType;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload for {event_type} must be a JSON object")]
    NotAnObject { event_type: &'static str },
    #[error("payload for {event_type} is missing required field `{field}`")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
}

/// Required payload fields per event type. Validation runs at publish and
/// at handle; unknown fields always pass through so older consumers keep
/// working against newer producers.
fn required_fields(event_type: EventType) -> &'static [&'static str] {
    match event_type {
        EventType::ProjectCreated => &["global_spec"],
        EventType::BudgetAllocated => &["total"],
        EventType::StrategyUpdate => &["new_tier"],
        EventType::UserApprovalRequired
        | EventType::UserApproved
        | EventType::UserRevisionRequested
        | EventType::UserRejected => &["approval_id"],
        EventType::HumanGateTriggered => &["reason"],
        _ => &[],
    }
}

pub fn validate_payload(event_type: EventType, payload: &Value) -> Result<(), PayloadError> {
    let obj = payload.as_object().ok_or(PayloadError::NotAnObject {
        event_type: event_type.as_str(),
    })?;
    for field in required_fields(event_type) {
        if !obj.contains_key(*field) {
            return Err(PayloadError::MissingField {
                event_type: event_type.as_str(),
                field,
            });
        }
    }
    Ok(())
}
