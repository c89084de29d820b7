use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::{EventType, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Created,
    Active,
    Paused,
    Revision,
    Delivered,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProjectStatus::Delivered | ProjectStatus::Failed | ProjectStatus::Cancelled
        )
    }

    pub fn can_transition(self, target: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match self {
            Created => matches!(target, Active | Failed | Cancelled),
            Active => matches!(target, Paused | Revision | Delivered | Failed | Cancelled),
            Paused => matches!(target, Active | Revision | Failed | Cancelled),
            Revision => matches!(target, Active | Paused | Failed | Cancelled),
            Delivered | Failed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Created => "CREATED",
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Paused => "PAUSED",
            ProjectStatus::Revision => "REVISION",
            ProjectStatus::Delivered => "DELIVERED",
            ProjectStatus::Failed => "FAILED",
            ProjectStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    High,
    Balanced,
    Fast,
}

impl QualityTier {
    pub fn multiplier(self) -> f64 {
        match self {
            QualityTier::High => 1.5,
            QualityTier::Balanced => 1.0,
            QualityTier::Fast => 0.6,
        }
    }

    /// One step down the ladder; `fast` is the floor.
    pub fn lower(self) -> Option<QualityTier> {
        match self {
            QualityTier::High => Some(QualityTier::Balanced),
            QualityTier::Balanced => Some(QualityTier::Fast),
            QualityTier::Fast => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::High => "high",
            QualityTier::Balanced => "balanced",
            QualityTier::Fast => "fast",
        }
    }
}

impl Default for QualityTier {
    fn default() -> Self {
        QualityTier::Balanced
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserOptions {
    #[serde(default)]
    pub auto_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_checkpoints: Option<Vec<EventType>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSpec {
    pub title: String,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub quality_tier: QualityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<Value>,
    #[serde(default)]
    pub characters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default)]
    pub user_options: UserOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    #[serde(default)]
    pub total: Money,
    #[serde(default)]
    pub spent: Money,
    /// Per-category spend, keyed by the producing event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub breakdown: BTreeMap<String, Money>,
}

impl Budget {
    pub fn allocated(total: f64) -> Self {
        Self {
            total: Money::usd(total),
            spent: Money::usd(0.0),
            breakdown: BTreeMap::new(),
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.total.amount - self.spent.amount).max(0.0)
    }

    pub fn usage_rate(&self) -> f64 {
        if self.total.amount > 0.0 {
            self.spent.amount / self.total.amount
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShotStatus {
    Init,
    Planned,
    KeyframeGenerated,
    PreviewReady,
    FinalRendered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub shot_id: String,
    pub index: u32,
    pub status: ShotStatus,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<Money>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Authoritative project document. Owned by the blackboard; agents read
/// snapshots and submit optimistic-version writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub project_id: String,
    pub global_spec: GlobalSpec,
    pub status: ProjectStatus,
    pub version: u64,
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub shots: BTreeMap<String, Shot>,
    #[serde(default)]
    pub dna_bank: BTreeMap<String, Value>,
    #[serde(default)]
    pub artifact_index: BTreeMap<String, ArtifactMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectDoc {
    pub fn new(project_id: impl Into<String>, global_spec: GlobalSpec, budget: Budget) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            global_spec,
            status: ProjectStatus::Created,
            version: 1,
            budget,
            shots: BTreeMap::new(),
            dna_bank: BTreeMap::new(),
            artifact_index: BTreeMap::new(),
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_shots(&self) -> usize {
        self.shots.len()
    }

    pub fn completed_shots(&self) -> usize {
        self.shots
            .values()
            .filter(|s| s.status == ShotStatus::FinalRendered)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_project_states_have_no_exits() {
        for terminal in [
            ProjectStatus::Delivered,
            ProjectStatus::Failed,
            ProjectStatus::Cancelled,
        ] {
            for target in [
                ProjectStatus::Created,
                ProjectStatus::Active,
                ProjectStatus::Paused,
                ProjectStatus::Failed,
            ] {
                assert!(!terminal.can_transition(target));
            }
        }
        assert!(ProjectStatus::Created.can_transition(ProjectStatus::Active));
        assert!(ProjectStatus::Paused.can_transition(ProjectStatus::Active));
        assert!(!ProjectStatus::Created.can_transition(ProjectStatus::Delivered));
    }

    #[test]
    fn quality_ladder_stops_at_fast() {
        assert_eq!(QualityTier::High.lower(), Some(QualityTier::Balanced));
        assert_eq!(QualityTier::Balanced.lower(), Some(QualityTier::Fast));
        assert_eq!(QualityTier::Fast.lower(), None);
    }

    #[test]
    fn budget_rates() {
        let mut budget = Budget::allocated(90.0);
        budget.spent = Money::usd(60.0);
        assert!((budget.usage_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((budget.remaining() - 30.0).abs() < 1e-9);
        // Never negative once overspent.
        budget.spent = Money::usd(120.0);
        assert_eq!(budget.remaining(), 0.0);
    }

    #[test]
    fn global_spec_defaults_from_minimal_json() {
        let spec: GlobalSpec = serde_json::from_value(serde_json::json!({
            "title": "Rain and Warmth",
            "duration_seconds": 30
        }))
        .unwrap();
        assert_eq!(spec.quality_tier, QualityTier::Balanced);
        assert!(!spec.user_options.auto_mode);
    }
}
