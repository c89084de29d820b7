//! End-to-end scenarios driving the engine through its control surface.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use showrunner_core::runtime::{AgentError, AgentResult};
use showrunner_core::{CoreConfig, Engine, TaskExecutor};
use showrunner_types::{
    ApprovalAction, ApprovalStatus, Event, EventType, GlobalSpec, Money, ProjectStatus,
    QualityTier, TaskRecord, TaskStatus,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn spec(duration: f64, tier: QualityTier) -> GlobalSpec {
    serde_json::from_value(json!({
        "title": "Rain and Warmth",
        "duration_seconds": duration,
        "aspect_ratio": "9:16",
        "quality_tier": tier.as_str(),
    }))
    .unwrap()
}

async fn engine() -> (Engine, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = CoreConfig::default();
    config.blackboard.db_path = dir.path().join("showrunner.db");
    config.scheduler.tick_interval_ms = 20;
    let engine = Engine::new(config).await.unwrap();
    (engine, dir)
}

fn cost_event(project_id: &str, amount: f64) -> Event {
    Event::new(project_id, EventType::ImageGenerated, "image_gen")
        .with_payload(json!({"artifact_url": "s3://artifacts/keyframe.png"}))
        .with_cost(Money::usd(amount))
}

async fn events_of(engine: &Engine, project_id: &str, ty: EventType) -> Vec<Event> {
    engine
        .replay_events(project_id, Some(&[ty]), None, None)
        .await
        .unwrap()
}

#[tokio::test]
async fn s1_happy_path_delivers_within_budget() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::Balanced), None)
        .await
        .unwrap();

    // 30 s * 3.0 USD/s * 1.0 (balanced)
    let allocated = events_of(&engine, &project_id, EventType::BudgetAllocated).await;
    assert_eq!(allocated.len(), 1);
    assert_eq!(allocated[0].payload_f64("total"), Some(90.0));
    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
    assert_eq!(project.budget.total.amount, 90.0);

    for _ in 0..6 {
        engine
            .submit_event(cost_event(&project_id, 10.0))
            .await
            .unwrap();
    }
    let project = engine.get_project_state(&project_id).await.unwrap();
    assert!((project.budget.spent.amount - 60.0).abs() < 1e-9);
    assert!(events_of(&engine, &project_id, EventType::CostOverrunWarning)
        .await
        .is_empty());

    engine
        .submit_event(
            Event::new(&project_id, EventType::ProjectFinalized, "director").with_payload(json!({
                "shots": [
                    {"shot_id": "S01", "status": "FINAL_RENDERED"},
                    {"shot_id": "S02", "status": "FINAL_RENDERED"},
                ],
                "artifacts": [
                    {"url": "s3://artifacts/final_a.mp4", "cost": 30.0},
                    {"url": "s3://artifacts/final_b.mp4", "cost": 20.0},
                ],
            })),
        )
        .await
        .unwrap();

    let delivered = events_of(&engine, &project_id, EventType::ProjectDelivered).await;
    assert_eq!(delivered.len(), 1);
    let summary = &delivered[0].payload["summary"];
    assert_eq!(summary["total_cost"], json!(50.0));
    assert_eq!(summary["budget_compliant"], json!(true));

    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Delivered);
    assert_eq!(project.total_shots(), 2);
    assert_eq!(project.completed_shots(), 2);
    assert_eq!(project.artifact_index.len(), 2);
}

#[tokio::test]
async fn s2_warning_then_downgrade() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::High), None)
        .await
        .unwrap();
    assert_eq!(
        engine
            .get_project_state(&project_id)
            .await
            .unwrap()
            .budget
            .total
            .amount,
        135.0
    );

    engine
        .submit_event(cost_event(&project_id, 115.0))
        .await
        .unwrap();

    let warnings = events_of(&engine, &project_id, EventType::CostOverrunWarning).await;
    assert_eq!(warnings.len(), 1);
    let updates = events_of(&engine, &project_id, EventType::StrategyUpdate).await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].payload_str("new_tier"), Some("balanced"));

    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.global_spec.quality_tier, QualityTier::Balanced);
}

#[tokio::test]
async fn s3_escalation_then_approval_resumes() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::Balanced), None)
        .await
        .unwrap();

    engine
        .submit_event(
            Event::new(&project_id, EventType::ConsistencyFailed, "consistency_guardian")
                .with_payload(json!({
                    "retry_count": 3,
                    "cost_impact": 5.0,
                    "severity": "medium",
                })),
        )
        .await
        .unwrap();

    assert_eq!(
        events_of(&engine, &project_id, EventType::HumanGateTriggered)
            .await
            .len(),
        1
    );
    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Paused);
    assert!(engine.approvals().is_paused(&project_id).await);

    let approvals = engine.list_approvals(&project_id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Pending);

    engine
        .decide_approval(&approvals[0].approval_id, ApprovalAction::Approve, None)
        .await
        .unwrap();

    assert_eq!(
        events_of(&engine, &project_id, EventType::UserApproved)
            .await
            .len(),
        1
    );
    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
    assert!(!engine.approvals().is_paused(&project_id).await);
}

#[tokio::test]
async fn s4_rejection_fails_the_project() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::Balanced), None)
        .await
        .unwrap();

    engine
        .submit_event(
            Event::new(&project_id, EventType::ConsistencyFailed, "consistency_guardian")
                .with_payload(json!({ "cost_impact": 25.0 })),
        )
        .await
        .unwrap();
    assert_eq!(
        events_of(&engine, &project_id, EventType::HumanGateTriggered)
            .await
            .len(),
        1
    );

    let approvals = engine.list_approvals(&project_id).await.unwrap();
    engine
        .decide_approval(
            &approvals[0].approval_id,
            ApprovalAction::Reject,
            Some("quality irreparable".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(
        events_of(&engine, &project_id, EventType::UserRejected)
            .await
            .len(),
        1
    );
    let project = engine.get_project_state(&project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Failed);
    assert_eq!(project.failure_reason.as_deref(), Some("quality irreparable"));
}

#[tokio::test]
async fn s5_budget_exceeded_shows_in_summary() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::Balanced), None)
        .await
        .unwrap();

    engine
        .submit_event(cost_event(&project_id, 120.0))
        .await
        .unwrap();
    assert_eq!(
        events_of(&engine, &project_id, EventType::BudgetExceeded)
            .await
            .len(),
        1
    );

    engine
        .submit_event(
            Event::new(&project_id, EventType::ProjectFinalized, "director")
                .with_payload(json!({})),
        )
        .await
        .unwrap();

    let delivered = events_of(&engine, &project_id, EventType::ProjectDelivered).await;
    let summary = &delivered[0].payload["summary"];
    assert_eq!(summary["budget_compliant"], json!(false));
    assert_eq!(summary["overrun_amount"], json!(30.0));
}

struct ParkedExecutor;

#[async_trait]
impl TaskExecutor for ParkedExecutor {
    async fn execute(&self, _task: &TaskRecord, cancel: CancellationToken) -> AgentResult<()> {
        cancel.cancelled().await;
        Err(AgentError::Transient("interrupted".to_string()))
    }
}

#[tokio::test]
async fn s6_cancellation_under_lock_releases_it() {
    let (engine, _dir) = engine().await;
    let project_id = engine
        .create_project(spec(30.0, QualityTier::Balanced), None)
        .await
        .unwrap();

    let scheduler = engine.scheduler();
    scheduler
        .register_executor("video_gen", Arc::new(ParkedExecutor))
        .await;
    scheduler
        .enqueue(TaskRecord::new("T1", &project_id, "video_gen").with_lock("L"))
        .await
        .unwrap();

    scheduler.tick(&project_id).await.unwrap(); // PENDING -> READY
    scheduler.tick(&project_id).await.unwrap(); // READY -> RUNNING under L
    assert_eq!(
        scheduler.get_task("T1").await.unwrap().status,
        TaskStatus::Running
    );
    assert!(scheduler.lock_held("L").await.unwrap());

    scheduler.cancel_task("T1").await.unwrap();

    let task = scheduler.get_task("T1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    // Another caller can take L immediately, without waiting out the lease.
    assert!(!scheduler.lock_held("L").await.unwrap());

    // Settle the parked executor task.
    tokio::time::sleep(Duration::from_millis(20)).await;
}
