use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use showrunner_types::EventType;
use tokio::fs;
use tracing::debug;

use crate::approval::TimeoutPolicy;

/// Runtime configuration. Layers merge in precedence order
/// file < environment < runtime overrides, then deserialize onto the
/// defaults, so a config file only needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub blackboard: BlackboardConfig,
    pub event_log: EventLogConfig,
    pub scheduler: SchedulerConfig,
    pub budget: BudgetConfig,
    pub approval: ApprovalConfig,
    pub agent: AgentConfig,
    pub causation_index: CausationIndexConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackboardConfig {
    pub db_path: PathBuf,
    pub cache_ttl_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub stream_prefix: String,
    pub consumer_group: String,
    pub redeliver_idle_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub task_timeout_s: u64,
    pub default_max_retries: u32,
    pub tick_interval_ms: u64,
    pub lock_lease_s: u64,
    pub max_concurrent_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub base_rate_per_second: f64,
    pub quality_multipliers: BTreeMap<String, f64>,
    pub warning_threshold: f64,
    pub prediction_overrun_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub default_checkpoints: Vec<EventType>,
    pub timeout_minutes: u64,
    pub auto_mode: bool,
    pub timeout_policy: TimeoutPolicy,
    pub sweep_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub retry_initial_delay_ms: u64,
    pub retry_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CausationIndexConfig {
    pub capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            blackboard: BlackboardConfig::default(),
            event_log: EventLogConfig::default(),
            scheduler: SchedulerConfig::default(),
            budget: BudgetConfig::default(),
            approval: ApprovalConfig::default(),
            agent: AgentConfig::default(),
            causation_index: CausationIndexConfig::default(),
        }
    }
}

impl Default for BlackboardConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("showrunner.db"),
            cache_ttl_s: 3600,
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "event_stream".to_string(),
            consumer_group: "agent_group".to_string(),
            redeliver_idle_s: 30,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout_s: 300,
            default_max_retries: 3,
            tick_interval_ms: 200,
            lock_lease_s: 300,
            max_concurrent_tasks: 8,
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        let mut quality_multipliers = BTreeMap::new();
        quality_multipliers.insert("high".to_string(), 1.5);
        quality_multipliers.insert("balanced".to_string(), 1.0);
        quality_multipliers.insert("fast".to_string(), 0.6);
        Self {
            base_rate_per_second: 3.0,
            quality_multipliers,
            warning_threshold: 0.80,
            prediction_overrun_factor: 1.10,
        }
    }
}

impl BudgetConfig {
    pub fn multiplier_for(&self, tier: showrunner_types::QualityTier) -> f64 {
        self.quality_multipliers
            .get(tier.as_str())
            .copied()
            .unwrap_or_else(|| tier.multiplier())
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_checkpoints: vec![
                EventType::SceneWritten,
                EventType::ShotPlanned,
                EventType::PreviewVideoReady,
                EventType::FinalVideoReady,
            ],
            timeout_minutes: 60,
            auto_mode: false,
            timeout_policy: TimeoutPolicy::Reject,
            sweep_interval_s: 30,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: 1000,
            retry_max_attempts: 3,
        }
    }
}

impl Default for CausationIndexConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

impl CoreConfig {
    /// Load from a JSON file, then apply environment overrides and the
    /// caller's runtime overrides. A missing file means defaults.
    pub async fn load(
        path: Option<&Path>,
        runtime_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let mut merged = serde_json::to_value(CoreConfig::default())?;

        if let Some(path) = path {
            match fs::read_to_string(path).await {
                Ok(raw) => {
                    let layer: Value = serde_json::from_str(&raw)?;
                    deep_merge(&mut merged, &layer);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "config file absent, using defaults");
                }
                Err(err) => return Err(err.into()),
            }
        }

        deep_merge(&mut merged, &env_layer());
        if let Some(overrides) = runtime_overrides {
            deep_merge(&mut merged, &overrides);
        }

        Ok(serde_json::from_value(merged)?)
    }
}

fn env_layer() -> Value {
    let mut layer = Map::new();
    if let Ok(db_path) = std::env::var("SHOWRUNNER_DB_PATH") {
        layer.insert(
            "blackboard".to_string(),
            serde_json::json!({ "db_path": db_path }),
        );
    }
    if let Ok(group) = std::env::var("SHOWRUNNER_CONSUMER_GROUP") {
        layer.insert(
            "event_log".to_string(),
            serde_json::json!({ "consumer_group": group }),
        );
    }
    if let Ok(auto) = std::env::var("SHOWRUNNER_AUTO_MODE") {
        layer.insert(
            "approval".to_string(),
            serde_json::json!({ "auto_mode": auto == "1" || auto.eq_ignore_ascii_case("true") }),
        );
    }
    Value::Object(layer)
}

fn deep_merge(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, layer) => *base = layer.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.scheduler.task_timeout_s, 300);
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert!((config.budget.warning_threshold - 0.80).abs() < 1e-9);
        assert!((config.budget.prediction_overrun_factor - 1.10).abs() < 1e-9);
        assert_eq!(config.approval.timeout_minutes, 60);
        assert_eq!(config.agent.retry_max_attempts, 3);
        assert_eq!(config.causation_index.capacity, 10_000);
        assert_eq!(config.event_log.consumer_group, "agent_group");
        assert_eq!(config.approval.default_checkpoints.len(), 4);
    }

    #[tokio::test]
    async fn partial_file_merges_over_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            serde_json::json!({
                "scheduler": { "task_timeout_s": 30 },
                "budget": { "quality_multipliers": { "high": 2.0 } }
            })
            .to_string(),
        )
        .await
        .unwrap();

        let config = CoreConfig::load(Some(&path), None).await.unwrap();
        assert_eq!(config.scheduler.task_timeout_s, 30);
        // Untouched keys keep their defaults.
        assert_eq!(config.scheduler.default_max_retries, 3);
        assert!((config.budget.quality_multipliers["high"] - 2.0).abs() < 1e-9);
        assert!((config.budget.quality_multipliers["fast"] - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn runtime_overrides_win() {
        let config = CoreConfig::load(
            None,
            Some(serde_json::json!({ "approval": { "auto_mode": true } })),
        )
        .await
        .unwrap();
        assert!(config.approval.auto_mode);
    }
}
