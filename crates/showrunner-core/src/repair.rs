use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use showrunner_bus::EventBus;
use showrunner_store::{ApprovalRepo, TaskRepo};
use showrunner_types::{Event, EventType, TaskRecord};
use tracing::{debug, info};

use crate::approval::ApprovalManager;
use crate::runtime::{Agent, AgentResult};

const MAX_AUTO_RETRIES: u64 = 3;
const COST_IMPACT_LIMIT: f64 = 20.0;

/// Evaluates consistency and QA failures and decides between automatic
/// repair and the human gate. A failure escalates when its retry budget
/// is gone, its wasted cost exceeds the repair limit, or it is critical;
/// everything else re-enters the pipeline as a rewrite.
pub struct FailureEvaluator {
    bus: EventBus,
    approvals: Arc<ApprovalManager>,
}

impl FailureEvaluator {
    pub fn new(bus: EventBus, approvals: Arc<ApprovalManager>) -> Self {
        Self { bus, approvals }
    }

    fn escalation_reason(event: &Event) -> Option<String> {
        let retry_count = event.payload_u64("retry_count").unwrap_or(0);
        let cost_impact = event.payload_f64("cost_impact").unwrap_or(0.0);
        let severity = event.payload_str("severity").unwrap_or("medium");

        if retry_count >= MAX_AUTO_RETRIES {
            return Some(format!("max retries exceeded ({retry_count})"));
        }
        if cost_impact > COST_IMPACT_LIMIT {
            return Some(format!("cost impact ${cost_impact:.2} exceeds ${COST_IMPACT_LIMIT:.0}"));
        }
        if severity.eq_ignore_ascii_case("critical") {
            return Some("critical failure".to_string());
        }
        None
    }

    async fn evaluate(&self, event: &Event) -> AgentResult<()> {
        match Self::escalation_reason(event) {
            Some(reason) => {
                info!(
                    project_id = %event.project_id,
                    event_type = event.event_type.as_str(),
                    reason,
                    "failure escalated to human gate"
                );
                self.approvals
                    .escalate(
                        &event.project_id,
                        event.event_type,
                        reason,
                        json!({
                            "failure": &event.payload,
                            "event_id": event.event_id,
                        }),
                        Some(event),
                    )
                    .await?;
                Ok(())
            }
            None => {
                debug!(project_id = %event.project_id, "failure is auto-recoverable");
                self.bus
                    .publish(
                        Event::new(&event.project_id, EventType::RewriteScene, "failure_evaluator")
                            .with_payload(json!({
                                "reason": "auto_repair",
                                "shot_id": event.payload.get("shot_id"),
                                "errors": event.payload.get("errors"),
                            }))
                            .caused_by(event),
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Agent for FailureEvaluator {
    fn name(&self) -> &'static str {
        "failure_evaluator"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![EventType::ConsistencyFailed, EventType::QaReport]
    }

    async fn handle_event(&self, event: &Event) -> AgentResult<()> {
        match event.event_type {
            EventType::ConsistencyFailed => self.evaluate(event).await,
            EventType::QaReport => {
                // Reports only matter here when the checker flagged them.
                let passed = event
                    .payload
                    .get("passed")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if passed {
                    Ok(())
                } else {
                    self.evaluate(event).await
                }
            }
            _ => Ok(()),
        }
    }
}

/// Routes an accepted revision to the agent that owns the stage by
/// enqueueing a revision task assigned to it: script revisions go to the
/// script writer (with a REWRITE_SCENE signal), shot-plan revisions to
/// the shot director, preview/final video revisions to the video
/// pipeline (re-emitting the corresponding request event). The task id
/// carries the approval id, so the assignee reads the revision notes off
/// the approval record. Stages nobody owns need a human to clarify.
pub struct RevisionRouter {
    repo: ApprovalRepo,
    tasks: TaskRepo,
    bus: EventBus,
}

struct RevisionRoute {
    assigned_to: &'static str,
    signal: Option<EventType>,
}

impl RevisionRouter {
    pub fn new(repo: ApprovalRepo, tasks: TaskRepo, bus: EventBus) -> Self {
        Self { repo, tasks, bus }
    }

    fn route(stage: EventType) -> Option<RevisionRoute> {
        match stage {
            EventType::SceneWritten => Some(RevisionRoute {
                assigned_to: "script_writer",
                signal: Some(EventType::RewriteScene),
            }),
            // Re-planning starts from the existing scene; the task itself
            // is the re-request, there is no separate plan-request event.
            EventType::ShotPlanned => Some(RevisionRoute {
                assigned_to: "shot_director",
                signal: None,
            }),
            EventType::PreviewVideoReady => Some(RevisionRoute {
                assigned_to: "video_gen",
                signal: Some(EventType::PreviewVideoRequested),
            }),
            EventType::FinalVideoReady => Some(RevisionRoute {
                assigned_to: "video_gen",
                signal: Some(EventType::FinalVideoRequested),
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl Agent for RevisionRouter {
    fn name(&self) -> &'static str {
        "revision_router"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        vec![EventType::UserRevisionRequested]
    }

    async fn handle_event(&self, event: &Event) -> AgentResult<()> {
        let Some(approval_id) = event.payload_str("approval_id") else {
            return Ok(());
        };
        let request = self.repo.get(approval_id).await?;
        let notes = event.payload.get("revision_notes").cloned();

        match Self::route(request.stage) {
            Some(route) => {
                let task = TaskRecord::new(
                    format!("REV-{approval_id}"),
                    &event.project_id,
                    route.assigned_to,
                );
                self.tasks.create(&task).await?;
                info!(
                    approval_id,
                    stage = request.stage.as_str(),
                    assigned_to = route.assigned_to,
                    "revision task enqueued"
                );

                if let Some(target) = route.signal {
                    self.bus
                        .publish(
                            Event::new(&event.project_id, target, "revision_router")
                                .with_payload(json!({
                                    "approval_id": approval_id,
                                    "target_stage": request.stage.as_str(),
                                    "revision_task_id": &task.task_id,
                                    "revision_notes": notes,
                                }))
                                .caused_by(event),
                        )
                        .await?;
                }
            }
            None => {
                self.bus
                    .publish(
                        Event::new(
                            &event.project_id,
                            EventType::HumanClarificationRequired,
                            "revision_router",
                        )
                        .with_payload(json!({
                            "approval_id": approval_id,
                            "stage": request.stage.as_str(),
                            "revision_notes": notes,
                        }))
                        .caused_by(event),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
