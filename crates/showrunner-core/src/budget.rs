use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use showrunner_bus::EventBus;
use showrunner_observability::metrics;
use showrunner_store::{Blackboard, CostReceipt, StoreError};
use showrunner_types::{
    ArtifactMeta, Budget, Event, EventType, GlobalSpec, Money, ProjectStatus, Shot, ShotStatus,
};
use tracing::{info, warn};

use crate::config::BudgetConfig;
use crate::runtime::{Agent, AgentError, AgentResult};

/// Tracks spend against allocation, predicts the final cost, and reacts on
/// threshold crossings. Also owns the project bookends: allocation on
/// PROJECT_CREATED and the delivery summary on PROJECT_FINALIZED.
pub struct BudgetController {
    blackboard: Blackboard,
    bus: EventBus,
    config: BudgetConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub total: f64,
    pub spent: f64,
    pub remaining: f64,
    pub usage_percent: f64,
    pub predicted_total: f64,
    pub predicted_overrun: f64,
    pub status: &'static str,
}

impl BudgetController {
    pub fn new(blackboard: Blackboard, bus: EventBus, config: BudgetConfig) -> Self {
        Self {
            blackboard,
            bus,
            config,
        }
    }

    /// `total = duration_seconds * base_rate * quality_multiplier`.
    fn allocation_for(&self, spec: &GlobalSpec) -> f64 {
        spec.duration_seconds
            * self.config.base_rate_per_second
            * self.config.multiplier_for(spec.quality_tier)
    }

    async fn on_project_created(&self, event: &Event) -> AgentResult<()> {
        let project = match self.blackboard.get_project(&event.project_id).await {
            Ok(project) => project,
            Err(StoreError::ProjectNotFound(_)) => {
                // The event is the creator when an external driver goes
                // straight through the log.
                let spec: GlobalSpec = serde_json::from_value(
                    event
                        .payload
                        .get("global_spec")
                        .cloned()
                        .unwrap_or(Value::Null),
                )
                .map_err(|err| AgentError::Validation(format!("bad global_spec: {err}")))?;
                self.blackboard
                    .create_project(&event.project_id, spec, Budget::default())
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        let total = if project.budget.total.amount > 0.0 {
            project.budget.total.amount
        } else {
            self.allocation_for(&project.global_spec)
        };
        let (doc, _) = self
            .blackboard
            .mutate(&event.project_id, |doc| {
                doc.budget.total = Money::usd(total);
                Ok(())
            })
            .await?;

        self.blackboard
            .update_project_status(&event.project_id, ProjectStatus::Active)
            .await?;

        self.bus
            .publish(
                Event::new(&event.project_id, EventType::BudgetAllocated, "budget_controller")
                    .with_payload(json!({
                        "total": total,
                        "currency": &doc.budget.total.currency,
                        "base_rate_per_second": self.config.base_rate_per_second,
                        "quality_tier": doc.global_spec.quality_tier.as_str(),
                        "quality_multiplier": self.config.multiplier_for(doc.global_spec.quality_tier),
                    }))
                    .caused_by(event),
            )
            .await?;
        info!(project_id = %event.project_id, total, "budget allocated");
        Ok(())
    }

    async fn on_cost_event(&self, event: &Event) -> AgentResult<()> {
        let Some(cost) = &event.metadata.cost else {
            return Ok(());
        };
        let amount = cost.amount;
        if amount <= 0.0 {
            return Ok(());
        }

        let receipt = self
            .blackboard
            .add_cost(&event.project_id, amount, event.event_type.as_str())
            .await?;
        metrics().cost_recorded(amount);

        self.check_thresholds(event, &receipt).await
    }

    /// Threshold checks compare the rate before and after the increment,
    /// so each crossing fires exactly once however many cost events
    /// follow it.
    async fn check_thresholds(&self, event: &Event, receipt: &CostReceipt) -> AgentResult<()> {
        let total = receipt.after.total.amount;
        if total <= 0.0 {
            return Ok(());
        }
        let threshold = self.config.warning_threshold;
        let rate_before = receipt.before.usage_rate();
        let rate_after = receipt.after.usage_rate();

        if rate_before < threshold && rate_after >= threshold {
            warn!(
                project_id = %event.project_id,
                usage_rate = rate_after,
                "budget warning threshold crossed"
            );
            self.bus
                .publish(
                    Event::new(&event.project_id, EventType::CostOverrunWarning, "budget_controller")
                        .with_payload(json!({
                            "trigger": "usage_threshold",
                            "usage_rate": rate_after,
                            "threshold": threshold,
                            "spent": receipt.after.spent.amount,
                            "total": total,
                        }))
                        .caused_by(event),
                )
                .await?;
        }

        if receipt.before.spent.amount <= total && receipt.after.spent.amount > total {
            warn!(project_id = %event.project_id, spent = receipt.after.spent.amount, total, "budget exceeded");
            self.bus
                .publish(
                    Event::new(&event.project_id, EventType::BudgetExceeded, "budget_controller")
                        .with_payload(json!({
                            "spent": receipt.after.spent.amount,
                            "total": total,
                            "overrun_amount": receipt.after.spent.amount - total,
                        }))
                        .caused_by(event),
                )
                .await?;
        }

        // Coarse prediction from shot progress; advisory only.
        let doc = self.blackboard.get_project(&event.project_id).await?;
        let progress = progress_ratio(doc.completed_shots(), doc.total_shots());
        if progress > 0.0 {
            let limit = total * self.config.prediction_overrun_factor;
            let predicted_before = receipt.before.spent.amount / progress;
            let predicted_after = receipt.after.spent.amount / progress;
            if predicted_before <= limit && predicted_after > limit {
                self.bus
                    .publish(
                        Event::new(
                            &event.project_id,
                            EventType::CostOverrunWarning,
                            "budget_controller",
                        )
                        .with_payload(json!({
                            "trigger": "prediction",
                            "predicted_total": predicted_after,
                            "progress": progress,
                            "spent": receipt.after.spent.amount,
                            "total": total,
                        }))
                        .caused_by(event),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_project_finalized(&self, event: &Event) -> AgentResult<()> {
        let project_id = &event.project_id;

        if let Some(shots) = event.payload.get("shots").and_then(Value::as_array) {
            for (index, entry) in shots.iter().enumerate() {
                let Some(shot_id) = entry.get("shot_id").and_then(Value::as_str) else {
                    continue;
                };
                let mut shot = match self.blackboard.get_shot(project_id, shot_id).await {
                    Ok(shot) => shot,
                    Err(StoreError::ShotNotFound { .. }) => Shot {
                        shot_id: shot_id.to_string(),
                        index: index as u32 + 1,
                        status: ShotStatus::Init,
                        duration_seconds: entry
                            .get("duration_seconds")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                        script: None,
                        prompt_config: None,
                        shot_plan: None,
                        preview_video_url: None,
                        final_video_url: None,
                        quality_metrics: None,
                    },
                    Err(err) => return Err(err.into()),
                };
                shot.status = ShotStatus::FinalRendered;
                if let Some(url) = entry.get("final_video_url").and_then(Value::as_str) {
                    shot.final_video_url = Some(url.to_string());
                }
                self.blackboard.update_shot(project_id, shot).await?;
            }
        }

        let mut artifact_cost = 0.0_f64;
        let mut artifact_count = 0usize;
        if let Some(artifacts) = event.payload.get("artifacts").and_then(Value::as_array) {
            for artifact in artifacts {
                let Some(url) = artifact.get("url").and_then(Value::as_str) else {
                    continue;
                };
                let cost = artifact.get("cost").and_then(Value::as_f64);
                let meta = ArtifactMeta {
                    cost: cost.map(Money::usd),
                    model: artifact
                        .get("model")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    registered_at: Utc::now(),
                    extra: Default::default(),
                };
                self.blackboard
                    .register_artifact(project_id, url, meta)
                    .await?;
                artifact_cost += cost.unwrap_or(0.0);
                artifact_count += 1;
            }
        }

        let doc = self.blackboard.get_project(project_id).await?;
        let budget = &doc.budget;
        let total_cost = if artifact_count > 0 {
            artifact_cost
        } else {
            budget.spent.amount
        };
        let compliant = budget.spent.amount <= budget.total.amount;
        let summary = json!({
            "project_id": project_id,
            "total_cost": total_cost,
            "budget_total": budget.total.amount,
            "spent": budget.spent.amount,
            "budget_compliant": compliant,
            "overrun_amount": (budget.spent.amount - budget.total.amount).max(0.0),
            "shots_count": doc.total_shots(),
            "quality_tier": doc.global_spec.quality_tier.as_str(),
            "duration_seconds": doc.global_spec.duration_seconds,
        });

        self.blackboard
            .update_project_status(project_id, ProjectStatus::Delivered)
            .await?;
        self.bus
            .publish(
                Event::new(project_id, EventType::ProjectDelivered, "budget_controller")
                    .with_payload(json!({ "summary": summary }))
                    .caused_by(event),
            )
            .await?;
        info!(project_id = %project_id, total_cost, compliant, "project delivered");
        Ok(())
    }

    /// Point-in-time budget report for the control surface.
    pub async fn status(&self, project_id: &str) -> AgentResult<BudgetStatus> {
        let doc = self.blackboard.get_project(project_id).await?;
        let budget = &doc.budget;
        let total = budget.total.amount;
        let spent = budget.spent.amount;
        let progress = progress_ratio(doc.completed_shots(), doc.total_shots());
        let predicted = if progress > 0.0 { spent / progress } else { total };
        let usage_percent = if total > 0.0 { spent / total * 100.0 } else { 0.0 };

        let status = if predicted > total * self.config.prediction_overrun_factor {
            "CRITICAL"
        } else if usage_percent > 90.0 {
            "WARNING"
        } else if usage_percent > 70.0 {
            "CAUTION"
        } else {
            "HEALTHY"
        };

        Ok(BudgetStatus {
            total,
            spent,
            remaining: budget.remaining(),
            usage_percent,
            predicted_total: predicted,
            predicted_overrun: (predicted - total).max(0.0),
            status,
        })
    }
}

fn progress_ratio(completed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64
    }
}

#[async_trait]
impl Agent for BudgetController {
    fn name(&self) -> &'static str {
        "budget_controller"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![
            EventType::ProjectCreated,
            EventType::ImageGenerated,
            EventType::PreviewVideoReady,
            EventType::FinalVideoReady,
            EventType::MusicComposed,
            EventType::VoiceRendered,
            EventType::ProjectFinalized,
        ]
    }

    async fn handle_event(&self, event: &Event) -> AgentResult<()> {
        match event.event_type {
            EventType::ProjectCreated => self.on_project_created(event).await,
            EventType::ProjectFinalized => self.on_project_finalized(event).await,
            ty if ty.is_cost_bearing() => self.on_cost_event(event).await,
            _ => Ok(()),
        }
    }
}
