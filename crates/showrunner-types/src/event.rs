use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Wire-level event vocabulary. Serialized names are the SCREAMING_SNAKE
/// strings used in topic names, stored rows, and payload routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    // Project lifecycle
    ProjectCreated,
    BudgetAllocated,
    ProjectFinalized,
    ProjectDelivered,
    ErrorOccurred,
    // Script / plan
    SceneWritten,
    ShotPlanned,
    PromptGenerated,
    RewriteScene,
    // Generation
    KeyframeRequested,
    ImageGenerated,
    PreviewVideoRequested,
    PreviewVideoReady,
    FinalVideoRequested,
    FinalVideoReady,
    MusicComposed,
    VoiceRendered,
    // Consistency / QA
    QaReport,
    ConsistencyFailed,
    DnaBankUpdated,
    // Budget / strategy
    CostOverrunWarning,
    BudgetExceeded,
    StrategyUpdate,
    // Human gate
    UserApprovalRequired,
    UserApproved,
    UserRevisionRequested,
    UserRejected,
    HumanGateTriggered,
    HumanClarificationRequired,
}

impl EventType {
    pub const ALL: [EventType; 29] = [
        EventType::ProjectCreated,
        EventType::BudgetAllocated,
        EventType::ProjectFinalized,
        EventType::ProjectDelivered,
        EventType::ErrorOccurred,
        EventType::SceneWritten,
        EventType::ShotPlanned,
        EventType::PromptGenerated,
        EventType::RewriteScene,
        EventType::KeyframeRequested,
        EventType::ImageGenerated,
        EventType::PreviewVideoRequested,
        EventType::PreviewVideoReady,
        EventType::FinalVideoRequested,
        EventType::FinalVideoReady,
        EventType::MusicComposed,
        EventType::VoiceRendered,
        EventType::QaReport,
        EventType::ConsistencyFailed,
        EventType::DnaBankUpdated,
        EventType::CostOverrunWarning,
        EventType::BudgetExceeded,
        EventType::StrategyUpdate,
        EventType::UserApprovalRequired,
        EventType::UserApproved,
        EventType::UserRevisionRequested,
        EventType::UserRejected,
        EventType::HumanGateTriggered,
        EventType::HumanClarificationRequired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ProjectCreated => "PROJECT_CREATED",
            EventType::BudgetAllocated => "BUDGET_ALLOCATED",
            EventType::ProjectFinalized => "PROJECT_FINALIZED",
            EventType::ProjectDelivered => "PROJECT_DELIVERED",
            EventType::ErrorOccurred => "ERROR_OCCURRED",
            EventType::SceneWritten => "SCENE_WRITTEN",
            EventType::ShotPlanned => "SHOT_PLANNED",
            EventType::PromptGenerated => "PROMPT_GENERATED",
            EventType::RewriteScene => "REWRITE_SCENE",
            EventType::KeyframeRequested => "KEYFRAME_REQUESTED",
            EventType::ImageGenerated => "IMAGE_GENERATED",
            EventType::PreviewVideoRequested => "PREVIEW_VIDEO_REQUESTED",
            EventType::PreviewVideoReady => "PREVIEW_VIDEO_READY",
            EventType::FinalVideoRequested => "FINAL_VIDEO_REQUESTED",
            EventType::FinalVideoReady => "FINAL_VIDEO_READY",
            EventType::MusicComposed => "MUSIC_COMPOSED",
            EventType::VoiceRendered => "VOICE_RENDERED",
            EventType::QaReport => "QA_REPORT",
            EventType::ConsistencyFailed => "CONSISTENCY_FAILED",
            EventType::DnaBankUpdated => "DNA_BANK_UPDATED",
            EventType::CostOverrunWarning => "COST_OVERRUN_WARNING",
            EventType::BudgetExceeded => "BUDGET_EXCEEDED",
            EventType::StrategyUpdate => "STRATEGY_UPDATE",
            EventType::UserApprovalRequired => "USER_APPROVAL_REQUIRED",
            EventType::UserApproved => "USER_APPROVED",
            EventType::UserRevisionRequested => "USER_REVISION_REQUESTED",
            EventType::UserRejected => "USER_REJECTED",
            EventType::HumanGateTriggered => "HUMAN_GATE_TRIGGERED",
            EventType::HumanClarificationRequired => "HUMAN_CLARIFICATION_REQUIRED",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Generation events whose metadata carries a billable cost.
    pub fn is_cost_bearing(self) -> bool {
        matches!(
            self,
            EventType::ImageGenerated
                | EventType::PreviewVideoReady
                | EventType::FinalVideoReady
                | EventType::MusicComposed
                | EventType::VoiceRendered
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Money {
    pub amount: f64,
    #[serde(default = "Money::default_currency")]
    pub currency: String,
}

impl Money {
    pub fn usd(amount: f64) -> Self {
        Self {
            amount,
            currency: Self::default_currency(),
        }
    }

    fn default_currency() -> String {
        "USD".to_string()
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::usd(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    // Newer producers may attach fields older consumers do not know about;
    // they round-trip unmodified.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Immutable record of something that happened. Once published it is owned
/// by the event log and never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub project_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blackboard_pointer: Option<String>,
}

impl Event {
    pub fn new(
        project_id: impl Into<String>,
        event_type: EventType,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            project_id: project_id.into(),
            event_type,
            actor: actor.into(),
            timestamp: Utc::now(),
            payload: Value::Object(Map::new()),
            metadata: EventMetadata::default(),
            causation_id: None,
            blackboard_pointer: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_cost(mut self, cost: Money) -> Self {
        self.metadata.cost = Some(cost);
        self
    }

    pub fn caused_by(mut self, cause: &Event) -> Self {
        self.causation_id = Some(cause.event_id);
        self
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.blackboard_pointer = Some(pointer.into());
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }

    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}
