use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use showrunner_bus::EventBus;
use showrunner_store::{ApprovalRepo, Blackboard};
use showrunner_types::{
    ApprovalAction, ApprovalRequest, ApprovalStatus, Event, EventType, ProjectStatus, UserDecision,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ApprovalConfig;
use crate::runtime::{Agent, AgentError, AgentResult};

/// What happens to a request nobody decided in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    Reject,
    Approve,
    Hold,
}

const TIMEOUT_REASON: &str = "approval timed out";

/// Pauses a project at configured checkpoints and resumes, branches, or
/// fails it on the user's decision. The in-process paused set answers the
/// scheduler's hot-path query; the approval rows on the blackboard are the
/// durable truth and rebuild the set at startup.
pub struct ApprovalManager {
    blackboard: Blackboard,
    repo: ApprovalRepo,
    bus: EventBus,
    config: ApprovalConfig,
    paused: RwLock<HashSet<String>>,
}

impl ApprovalManager {
    pub fn new(
        blackboard: Blackboard,
        repo: ApprovalRepo,
        bus: EventBus,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            blackboard,
            repo,
            bus,
            config,
            paused: RwLock::new(HashSet::new()),
        }
    }

    pub async fn is_paused(&self, project_id: &str) -> bool {
        self.paused.read().await.contains(project_id)
    }

    async fn pause(&self, project_id: &str) {
        if self.paused.write().await.insert(project_id.to_string()) {
            info!(project_id, "project paused for approval");
        }
    }

    async fn resume(&self, project_id: &str) {
        if self.paused.write().await.remove(project_id) {
            info!(project_id, "project resumed");
        }
    }

    /// Rebuild the paused set from PENDING approval rows; replicas call
    /// this at startup so pause state survives the process.
    pub async fn refresh_from_store(&self) -> AgentResult<()> {
        let pending = self.repo.list_pending().await?;
        let mut paused = self.paused.write().await;
        paused.clear();
        for request in pending {
            paused.insert(request.project_id);
        }
        Ok(())
    }

    pub async fn get(&self, approval_id: &str) -> AgentResult<ApprovalRequest> {
        Ok(self.repo.get(approval_id).await?)
    }

    pub async fn list_for_project(&self, project_id: &str) -> AgentResult<Vec<ApprovalRequest>> {
        Ok(self.repo.list_for_project(project_id).await?)
    }

    /// Checkpoint intercept: create the approval record, pause the
    /// project, announce the gate.
    async fn intercept(&self, event: &Event) -> AgentResult<()> {
        let project = match self.blackboard.get_project(&event.project_id).await {
            Ok(project) => project,
            Err(err) => {
                warn!(project_id = %event.project_id, %err, "checkpoint event for unknown project");
                return Ok(());
            }
        };

        let options = &project.global_spec.user_options;
        if self.config.auto_mode || options.auto_mode {
            debug!(project_id = %event.project_id, "auto mode, checkpoint skipped");
            return Ok(());
        }
        let gated = match &options.approval_checkpoints {
            Some(checkpoints) => checkpoints.contains(&event.event_type),
            None => self.config.default_checkpoints.contains(&event.event_type),
        };
        if !gated {
            return Ok(());
        }

        let mut request = ApprovalRequest::new(
            &event.project_id,
            event.event_type,
            self.config.timeout_minutes,
        );
        request.content = Some(extract_content(event));
        self.repo.create(&request).await?;

        self.pause(&event.project_id).await;
        self.set_status_logged(&event.project_id, ProjectStatus::Paused)
            .await;

        self.bus
            .publish(
                Event::new(&event.project_id, EventType::UserApprovalRequired, "approval_manager")
                    .with_payload(json!({
                        "approval_id": &request.approval_id,
                        "project_id": &request.project_id,
                        "stage": request.stage.as_str(),
                        "content": &request.content,
                        "options": &request.options,
                        "timeout_minutes": request.timeout_minutes,
                    }))
                    .caused_by(event),
            )
            .await?;
        info!(
            approval_id = %request.approval_id,
            project_id = %event.project_id,
            stage = event.event_type.as_str(),
            "approval requested"
        );
        Ok(())
    }

    /// Human-gate escalation from the recovery ladder or the scheduler:
    /// same record shape as a checkpoint, with the error context attached.
    pub async fn escalate(
        &self,
        project_id: &str,
        stage: EventType,
        reason: String,
        context: Value,
        cause: Option<&Event>,
    ) -> AgentResult<ApprovalRequest> {
        let mut request = ApprovalRequest::new(project_id, stage, self.config.timeout_minutes);
        request.reason = Some(reason.clone());
        request.context = Some(context.clone());
        self.repo.create(&request).await?;

        self.pause(project_id).await;
        self.set_status_logged(project_id, ProjectStatus::Paused).await;

        let mut event = Event::new(project_id, EventType::HumanGateTriggered, "approval_manager")
            .with_payload(json!({
                "reason": reason,
                "approval_id": &request.approval_id,
                "project_id": project_id,
                "stage": stage.as_str(),
                "context": context,
            }));
        if let Some(cause) = cause {
            event = event.caused_by(cause);
        }
        self.bus.publish(event).await?;
        Ok(request)
    }

    /// Apply a user decision to a PENDING request.
    pub async fn decide(
        &self,
        approval_id: &str,
        action: ApprovalAction,
        notes: Option<String>,
        decided_by: &str,
    ) -> AgentResult<ApprovalRequest> {
        let mut request = self.repo.get(approval_id).await?;
        if !request.status.is_open() {
            return Err(AgentError::Validation(format!(
                "approval {approval_id} already decided"
            )));
        }
        request.user_decision = Some(UserDecision {
            action,
            notes: notes.clone(),
            decided_at: Utc::now(),
            decided_by: decided_by.to_string(),
        });
        let project_id = request.project_id.clone();

        match action {
            ApprovalAction::Approve => {
                request.status = ApprovalStatus::Approved;
                self.repo.save(&request).await?;
                self.resume(&project_id).await;
                self.set_status_logged(&project_id, ProjectStatus::Active).await;
                self.bus
                    .publish(
                        Event::new(&project_id, EventType::UserApproved, "approval_manager")
                            .with_payload(json!({
                                "approval_id": approval_id,
                                "stage": request.stage.as_str(),
                            })),
                    )
                    .await?;
            }
            ApprovalAction::Revise => {
                request.status = ApprovalStatus::Revision;
                self.repo.save(&request).await?;
                // Stays paused until the revised artifact re-enters a
                // checkpoint and produces a fresh approval request.
                self.set_status_logged(&project_id, ProjectStatus::Revision).await;
                self.bus
                    .publish(
                        Event::new(&project_id, EventType::UserRevisionRequested, "approval_manager")
                            .with_payload(json!({
                                "approval_id": approval_id,
                                "stage": request.stage.as_str(),
                                "revision_notes": notes,
                            })),
                    )
                    .await?;
            }
            ApprovalAction::Reject => {
                request.status = ApprovalStatus::Rejected;
                self.repo.save(&request).await?;
                self.resume(&project_id).await;
                let reason = notes.unwrap_or_else(|| "rejected by user".to_string());
                self.blackboard
                    .set_failure_reason(&project_id, &reason)
                    .await?;
                self.set_status_logged(&project_id, ProjectStatus::Failed).await;
                self.bus
                    .publish(
                        Event::new(&project_id, EventType::UserRejected, "approval_manager")
                            .with_payload(json!({
                                "approval_id": approval_id,
                                "stage": request.stage.as_str(),
                                "notes": reason,
                            })),
                    )
                    .await?;
            }
        }
        info!(
            approval_id,
            action = action.as_str(),
            project_id = %project_id,
            "approval decided"
        );
        Ok(request)
    }

    /// Mark overdue PENDING requests TIMEOUT and apply the configured
    /// policy (default: treated as rejection).
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> AgentResult<usize> {
        let expired = self.repo.list_pending_expired(now).await?;
        let count = expired.len();
        for mut request in expired {
            request.status = ApprovalStatus::Timeout;
            self.repo.save(&request).await?;
            warn!(
                approval_id = %request.approval_id,
                project_id = %request.project_id,
                "approval timed out"
            );
            match self.config.timeout_policy {
                TimeoutPolicy::Reject => {
                    self.resume(&request.project_id).await;
                    self.blackboard
                        .set_failure_reason(&request.project_id, TIMEOUT_REASON)
                        .await?;
                    self.set_status_logged(&request.project_id, ProjectStatus::Failed)
                        .await;
                    self.bus
                        .publish(
                            Event::new(
                                &request.project_id,
                                EventType::UserRejected,
                                "approval_manager",
                            )
                            .with_payload(json!({
                                "approval_id": request.approval_id,
                                "notes": TIMEOUT_REASON,
                            })),
                        )
                        .await?;
                }
                TimeoutPolicy::Approve => {
                    self.resume(&request.project_id).await;
                    self.set_status_logged(&request.project_id, ProjectStatus::Active)
                        .await;
                    self.bus
                        .publish(
                            Event::new(
                                &request.project_id,
                                EventType::UserApproved,
                                "approval_manager",
                            )
                            .with_payload(json!({
                                "approval_id": request.approval_id,
                                "timed_out": true,
                            })),
                        )
                        .await?;
                }
                TimeoutPolicy::Hold => {}
            }
        }
        Ok(count)
    }

    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_s.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_timeouts(Utc::now()).await {
                        warn!(%err, "approval timeout sweep failed");
                    }
                }
            }
        }
    }

    async fn set_status_logged(&self, project_id: &str, status: ProjectStatus) {
        if let Err(err) = self.blackboard.update_project_status(project_id, status).await {
            debug!(project_id, status = status.as_str(), %err, "status change skipped");
        }
    }
}

/// Pick the display subset for the user per stage.
fn extract_content(event: &Event) -> Value {
    match event.event_type {
        EventType::SceneWritten => json!({
            "preview_type": "script",
            "script": event.payload.get("script"),
        }),
        EventType::ShotPlanned => json!({
            "preview_type": "shots",
            "shots": event.payload.get("shots"),
        }),
        EventType::PreviewVideoReady => json!({
            "preview_type": "preview_video",
            "preview_url": event.payload.get("artifact_url"),
        }),
        EventType::FinalVideoReady => json!({
            "preview_type": "final_video",
            "preview_url": event.payload.get("artifact_url"),
        }),
        _ => json!({
            "preview_type": "event",
            "data": &event.payload,
        }),
    }
}

#[async_trait]
impl Agent for ApprovalManager {
    fn name(&self) -> &'static str {
        "approval_manager"
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        // Projects may gate any event type via
        // `user_options.approval_checkpoints`, so the manager listens to
        // the whole vocabulary and `intercept` decides relevance per
        // project.
        EventType::ALL.to_vec()
    }

    async fn handle_event(&self, event: &Event) -> AgentResult<()> {
        self.intercept(event).await
    }
}
