use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use showrunner_bus::EventBus;
use showrunner_store::{
    ApprovalRepo, Blackboard, EventArchive, EventLog, EventTypeStats, LockManager, StoreDatabase,
    TaskRepo,
};
use showrunner_types::{
    ApprovalAction, ApprovalRequest, Budget, Event, EventType, GlobalSpec, ProjectDoc,
    ProjectStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::approval::ApprovalManager;
use crate::budget::{BudgetController, BudgetStatus};
use crate::config::CoreConfig;
use crate::repair::{FailureEvaluator, RevisionRouter};
use crate::runtime::{Agent, AgentError, AgentResult, AgentRuntime, RecoveryPolicy};
use crate::scheduler::Scheduler;
use crate::strategy::StrategyAdjuster;

/// Builds the substrate, registers the coordinator agents, runs the
/// background loops, and exposes the control surface.
pub struct Engine {
    config: CoreConfig,
    blackboard: Blackboard,
    bus: EventBus,
    scheduler: Scheduler,
    approvals: Arc<ApprovalManager>,
    budget: Arc<BudgetController>,
    strategy: Arc<StrategyAdjuster>,
    policy: RecoveryPolicy,
    cancel: CancellationToken,
}

impl Engine {
    pub async fn new(config: CoreConfig) -> anyhow::Result<Self> {
        let db = StoreDatabase::open(&config.blackboard.db_path).await?;
        let blackboard = Blackboard::new(
            db.clone(),
            Duration::from_secs(config.blackboard.cache_ttl_s),
        );
        let log = EventLog::with_redeliver_idle(
            db.clone(),
            Duration::from_secs(config.event_log.redeliver_idle_s),
        );
        let bus = EventBus::new(
            log,
            EventArchive::new(db.clone()),
            config.event_log.stream_prefix.clone(),
            config.event_log.consumer_group.clone(),
            config.causation_index.capacity,
        );
        let locks = LockManager::new(db.clone());
        let tasks = TaskRepo::new(db.clone());
        let approvals_repo = ApprovalRepo::new(db);

        let approvals = Arc::new(ApprovalManager::new(
            blackboard.clone(),
            approvals_repo.clone(),
            bus.clone(),
            config.approval.clone(),
        ));
        approvals.refresh_from_store().await?;

        let strategy = Arc::new(StrategyAdjuster::new(blackboard.clone(), bus.clone()));
        let budget = Arc::new(BudgetController::new(
            blackboard.clone(),
            bus.clone(),
            config.budget.clone(),
        ));
        let repair = Arc::new(FailureEvaluator::new(bus.clone(), approvals.clone()));
        let router = Arc::new(RevisionRouter::new(
            approvals_repo,
            tasks.clone(),
            bus.clone(),
        ));

        let scheduler = Scheduler::new(
            blackboard.clone(),
            tasks,
            locks,
            approvals.clone(),
            config.scheduler.clone(),
        );

        let policy = RecoveryPolicy {
            initial_delay: Duration::from_millis(config.agent.retry_initial_delay_ms),
            max_attempts: config.agent.retry_max_attempts,
        };
        let coordinators: Vec<Arc<dyn Agent>> = vec![
            budget.clone(),
            strategy.clone(),
            approvals.clone(),
            repair,
            router,
        ];
        for agent in coordinators {
            bus.subscribe(Arc::new(AgentRuntime::new(
                agent,
                blackboard.clone(),
                bus.clone(),
                strategy.clone(),
                approvals.clone(),
                policy,
            )))
            .await;
        }

        Ok(Self {
            config,
            blackboard,
            bus,
            scheduler,
            approvals,
            budget,
            strategy,
            policy,
            cancel: CancellationToken::new(),
        })
    }

    /// Subscribe an agent through the recovery-ladder wrapper. Capability
    /// agents (script, image, video) register here the same way the
    /// built-in coordinators do.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.bus
            .subscribe(Arc::new(AgentRuntime::new(
                agent,
                self.blackboard.clone(),
                self.bus.clone(),
                self.strategy.clone(),
                self.approvals.clone(),
                self.policy,
            )))
            .await;
    }

    /// Start consumer loops, the scheduler, and the approval sweeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.bus.start_consuming(self.cancel.child_token()).await?;
        {
            let scheduler = self.scheduler.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move { scheduler.run(cancel).await });
        }
        {
            let approvals = self.approvals.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move { approvals.run_sweeper(cancel).await });
        }
        info!("engine started");
        Ok(())
    }

    /// Cancel background loops and await the bus drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.bus.drain().await;
        info!("engine stopped");
    }

    // --- control surface (§ CLI / HTTP) ---

    pub async fn create_project(
        &self,
        global_spec: GlobalSpec,
        budget_total: Option<f64>,
    ) -> AgentResult<String> {
        if !(global_spec.duration_seconds > 0.0) {
            return Err(AgentError::Validation(
                "duration_seconds must be positive".to_string(),
            ));
        }
        let project_id = format!("PROJ-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let budget = Budget::allocated(budget_total.unwrap_or(0.0));
        self.blackboard
            .create_project(&project_id, global_spec.clone(), budget)
            .await?;

        self.bus
            .publish(
                Event::new(&project_id, EventType::ProjectCreated, "control_surface")
                    .with_payload(json!({
                        "global_spec": global_spec,
                        "budget_total": budget_total,
                    })),
            )
            .await?;
        Ok(project_id)
    }

    pub async fn submit_event(&self, event: Event) -> AgentResult<Uuid> {
        Ok(self.bus.publish(event).await?)
    }

    pub async fn get_project_state(&self, project_id: &str) -> AgentResult<ProjectDoc> {
        Ok(self.blackboard.get_project(project_id).await?)
    }

    pub async fn list_projects(&self) -> AgentResult<Vec<ProjectDoc>> {
        Ok(self.blackboard.list_projects().await?)
    }

    pub async fn replay_events(
        &self,
        project_id: &str,
        event_types: Option<&[EventType]>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> AgentResult<Vec<Event>> {
        Ok(self
            .bus
            .replay(project_id, event_types, since, until)
            .await?)
    }

    pub async fn decide_approval(
        &self,
        approval_id: &str,
        action: ApprovalAction,
        notes: Option<String>,
    ) -> AgentResult<ApprovalRequest> {
        self.approvals
            .decide(approval_id, action, notes, "user")
            .await
    }

    pub async fn cancel_project(&self, project_id: &str) -> AgentResult<()> {
        let project = self.blackboard.get_project(project_id).await?;
        if project.status.is_terminal() {
            return Ok(());
        }
        self.scheduler.cancel_project(project_id).await?;
        self.blackboard
            .update_project_status(project_id, ProjectStatus::Cancelled)
            .await?;
        info!(project_id, "project cancelled");
        Ok(())
    }

    pub async fn budget_status(&self, project_id: &str) -> AgentResult<BudgetStatus> {
        self.budget.status(project_id).await
    }

    pub async fn list_approvals(&self, project_id: &str) -> AgentResult<Vec<ApprovalRequest>> {
        self.approvals.list_for_project(project_id).await
    }

    pub async fn get_approval(&self, approval_id: &str) -> AgentResult<ApprovalRequest> {
        self.approvals.get(approval_id).await
    }

    pub async fn causation_chain(&self, event_id: &Uuid) -> AgentResult<Vec<Event>> {
        Ok(self.bus.causation_chain(event_id).await?)
    }

    /// Per-event-type count/cost/latency aggregates from the archive.
    pub async fn event_statistics(
        &self,
        project_id: &str,
    ) -> AgentResult<HashMap<String, EventTypeStats>> {
        Ok(self.bus.archive().statistics(project_id).await?)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn approvals(&self) -> &Arc<ApprovalManager> {
        &self.approvals
    }
}
