use async_trait::async_trait;
use serde_json::json;
use showrunner_bus::EventBus;
use showrunner_store::Blackboard;
use showrunner_types::{Event, EventType, QualityTier};
use tracing::{debug, info};

use crate::runtime::{Agent, AgentResult};

/// Reactive strategy: steps the project's quality tier down one notch per
/// overrun signal (high -> balanced -> fast, never below fast) and
/// publishes STRATEGY_UPDATE. Work already running is not retouched; the
/// next shot plan observes the new tier.
pub struct StrategyAdjuster {
    blackboard: Blackboard,
    bus: EventBus,
}

impl StrategyAdjuster {
    pub fn new(blackboard: Blackboard, bus: EventBus) -> Self {
        Self { blackboard, bus }
    }

    /// One step down the ladder. `None` means the project already runs at
    /// the lowest tier.
    pub async fn downgrade(
        &self,
        project_id: &str,
        cause: Option<&Event>,
    ) -> AgentResult<Option<QualityTier>> {
        let project = self.blackboard.get_project(project_id).await?;
        let current = project.global_spec.quality_tier;
        let Some(lower) = current.lower() else {
            debug!(project_id, tier = current.as_str(), "no lower tier available");
            return Ok(None);
        };

        self.blackboard.set_quality_tier(project_id, lower).await?;
        let mut event = Event::new(project_id, EventType::StrategyUpdate, "strategy_adjuster")
            .with_payload(json!({
                "old_tier": current.as_str(),
                "new_tier": lower.as_str(),
                "reason": "budget pressure",
            }));
        if let Some(cause) = cause {
            event = event.caused_by(cause);
        }
        self.bus.publish(event).await?;
        info!(
            project_id,
            old_tier = current.as_str(),
            new_tier = lower.as_str(),
            "quality tier downgraded"
        );
        Ok(Some(lower))
    }
}

#[async_trait]
impl Agent for StrategyAdjuster {
    fn name(&self) -> &'static str {
        "strategy_adjuster"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![EventType::CostOverrunWarning, EventType::BudgetExceeded]
    }

    async fn handle_event(&self, event: &Event) -> AgentResult<()> {
        self.downgrade(&event.project_id, Some(event)).await?;
        Ok(())
    }
}
