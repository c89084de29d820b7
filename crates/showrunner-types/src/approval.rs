use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventType;

pub const APPROVAL_OPTIONS: [&str; 3] = ["approve", "revise", "reject"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Revision,
    Timeout,
}

impl ApprovalStatus {
    pub fn is_open(self) -> bool {
        self == ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Revise,
    Reject,
}

impl ApprovalAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalAction::Approve => "approve",
            ApprovalAction::Revise => "revise",
            ApprovalAction::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDecision {
    pub action: ApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub decided_by: String,
}

/// A record that parks a project awaiting a user decision, either at a
/// configured checkpoint or through a human-gate escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub project_id: String,
    /// The event type that triggered the request.
    pub stage: EventType,
    pub status: ApprovalStatus,
    /// Subset of the triggering payload chosen for user display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default = "default_options")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error context attached by the human-gate escalation path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub timeout_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_decision: Option<UserDecision>,
}

fn default_options() -> Vec<String> {
    APPROVAL_OPTIONS.iter().map(|s| s.to_string()).collect()
}

impl ApprovalRequest {
    pub fn new(project_id: impl Into<String>, stage: EventType, timeout_minutes: u64) -> Self {
        Self {
            approval_id: format!("APPR-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            project_id: project_id.into(),
            stage,
            status: ApprovalStatus::Pending,
            content: None,
            options: default_options(),
            reason: None,
            context: None,
            created_at: Utc::now(),
            timeout_minutes,
            user_decision: None,
        }
    }

    pub fn expired_at(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::minutes(self.timeout_minutes as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_is_pending_with_default_options() {
        let req = ApprovalRequest::new("PROJ-1", EventType::SceneWritten, 60);
        assert!(req.status.is_open());
        assert!(req.approval_id.starts_with("APPR-"));
        assert_eq!(req.options, vec!["approve", "revise", "reject"]);
    }

    #[test]
    fn expiry_tracks_timeout_minutes() {
        let req = ApprovalRequest::new("PROJ-1", EventType::ShotPlanned, 60);
        let delta = req.expired_at() - req.created_at;
        assert_eq!(delta.num_minutes(), 60);
    }
}
