use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use showrunner_observability::metrics;
use showrunner_store::{Blackboard, LockGuard, LockManager, StoreError, StoreResult, TaskRepo};
use showrunner_types::{TaskRecord, TaskStatus};
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::ApprovalManager;
use crate::config::SchedulerConfig;
use crate::runtime::AgentResult;
use crate::state_machine::TaskStateMachine;

/// Executes one dispatched task on behalf of the agent it is assigned to.
/// Implementations abort promptly when the token fires.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &TaskRecord, cancel: CancellationToken) -> AgentResult<()>;
}

struct RunningTask {
    cancel: CancellationToken,
    lock: Option<LockGuard>,
    _slot: OwnedSemaphorePermit,
    _handle: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    blackboard: Blackboard,
    tasks: TaskRepo,
    state: TaskStateMachine,
    locks: LockManager,
    approvals: Arc<ApprovalManager>,
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
    running: Mutex<HashMap<String, RunningTask>>,
    // Worker pool: bounds concurrent RUNNING tasks in this process.
    slots: Arc<Semaphore>,
    config: SchedulerConfig,
}

/// Per-project task scheduling: dependency resolution, non-blocking lock
/// acquisition, dispatch under a per-task cancellation token, timeout
/// detection, and the retry policy on FAILED tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        blackboard: Blackboard,
        tasks: TaskRepo,
        locks: LockManager,
        approvals: Arc<ApprovalManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                blackboard,
                state: TaskStateMachine::new(tasks.clone()),
                tasks,
                locks,
                approvals,
                executors: RwLock::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
                config,
            }),
        }
    }

    pub async fn register_executor(&self, agent_name: &str, executor: Arc<dyn TaskExecutor>) {
        self.inner
            .executors
            .write()
            .await
            .insert(agent_name.to_string(), executor);
    }

    pub async fn enqueue(&self, task: TaskRecord) -> StoreResult<()> {
        self.inner.tasks.create(&task).await
    }

    pub async fn get_task(&self, task_id: &str) -> StoreResult<TaskRecord> {
        self.inner.tasks.get(task_id).await
    }

    /// One pass over a project's tasks.
    pub async fn tick(&self, project_id: &str) -> AgentResult<()> {
        // A project that reached a terminal state takes its live tasks
        // with it (reject, timeout, cancel).
        match self.inner.blackboard.get_project(project_id).await {
            Ok(project) if project.status.is_terminal() => {
                self.cancel_project_tasks(project_id).await?;
                return Ok(());
            }
            Ok(_) => {}
            Err(StoreError::ProjectNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let paused = self.inner.approvals.is_paused(project_id).await;
        let snapshot = self.inner.tasks.list_for_project(project_id).await?;

        for task in snapshot {
            match task.status {
                TaskStatus::Running => self.check_timeout(&task).await?,
                TaskStatus::Failed => self.apply_retry_policy(&task).await?,
                TaskStatus::Pending => {
                    if self.dependencies_satisfied(&task).await? {
                        self.inner
                            .state
                            .transition(&task.task_id, TaskStatus::Ready, None)
                            .await?;
                    }
                }
                TaskStatus::Ready => {
                    if paused {
                        self.inner
                            .state
                            .transition(&task.task_id, TaskStatus::WaitingApproval, None)
                            .await?;
                    } else {
                        self.dispatch(task).await?;
                    }
                }
                TaskStatus::WaitingApproval => {
                    if !paused {
                        self.inner
                            .state
                            .transition(&task.task_id, TaskStatus::Ready, None)
                            .await?;
                    }
                }
                TaskStatus::Completed | TaskStatus::Cancelled => {}
            }
        }
        Ok(())
    }

    /// A dependency is satisfied iff it exists and is COMPLETED; a missing
    /// record counts as unsatisfied.
    async fn dependencies_satisfied(&self, task: &TaskRecord) -> AgentResult<bool> {
        for dep_id in &task.dependencies {
            match self.inner.tasks.get(dep_id).await {
                Ok(dep) if dep.status == TaskStatus::Completed => {}
                Ok(dep) => {
                    debug!(
                        task_id = %task.task_id,
                        dependency = %dep_id,
                        status = dep.status.as_str(),
                        "waiting on dependency"
                    );
                    return Ok(false);
                }
                Err(StoreError::TaskNotFound(_)) => {
                    warn!(task_id = %task.task_id, dependency = %dep_id, "dependency record missing");
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    async fn dispatch(&self, task: TaskRecord) -> AgentResult<()> {
        let Ok(slot) = self.inner.slots.clone().try_acquire_owned() else {
            // All workers busy; the task stays READY for the next tick.
            debug!(task_id = %task.task_id, "worker pool saturated, deferring dispatch");
            return Ok(());
        };
        let lock = if task.requires_lock {
            let Some(key) = task.lock_key.as_deref() else {
                self.inner
                    .state
                    .transition(&task.task_id, TaskStatus::Failed, Some("lock required but no lock_key".into()))
                    .await?;
                return Ok(());
            };
            match self
                .inner
                .locks
                .acquire(key, Duration::from_secs(self.inner.config.lock_lease_s))
                .await?
            {
                Some(guard) => Some(guard),
                None => {
                    // Lock held elsewhere; the task stays READY and the
                    // next tick retries.
                    debug!(task_id = %task.task_id, lock = key, "lock busy, deferring dispatch");
                    return Ok(());
                }
            }
        } else {
            None
        };

        let executor = {
            let executors = self.inner.executors.read().await;
            executors.get(&task.assigned_to).cloned()
        };
        let Some(executor) = executor else {
            if let Some(guard) = lock {
                guard.release().await?;
            }
            self.inner
                .state
                .transition(
                    &task.task_id,
                    TaskStatus::Failed,
                    Some(format!("no executor registered for {}", task.assigned_to)),
                )
                .await?;
            return Ok(());
        };

        let Some(running_record) = self
            .inner
            .state
            .transition(&task.task_id, TaskStatus::Running, None)
            .await?
        else {
            if let Some(guard) = lock {
                guard.release().await?;
            }
            return Ok(());
        };

        metrics().task_dispatched();
        let cancel = CancellationToken::new();
        // The entry must exist before the worker starts, or a fast worker
        // could finish and find nothing to release.
        self.inner.running.lock().await.insert(
            task.task_id.clone(),
            RunningTask {
                cancel: cancel.clone(),
                lock,
                _slot: slot,
                _handle: None,
            },
        );
        let handle = {
            let scheduler = self.clone();
            let task = running_record.clone();
            tokio::spawn(async move {
                scheduler.run_task(executor, task, cancel).await;
            })
        };
        if let Some(entry) = self.inner.running.lock().await.get_mut(&task.task_id) {
            entry._handle = Some(handle);
        }
        info!(task_id = %task.task_id, assigned_to = %task.assigned_to, "task dispatched");
        Ok(())
    }

    async fn run_task(
        &self,
        executor: Arc<dyn TaskExecutor>,
        task: TaskRecord,
        cancel: CancellationToken,
    ) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = executor.execute(&task, cancel.child_token()) => Some(result),
        };
        let Some(result) = outcome else {
            // Cancelled externally; cancel_task owns the transition and
            // the lock release.
            return;
        };

        let (target, message) = match result {
            Ok(()) => (TaskStatus::Completed, None),
            Err(err) => (TaskStatus::Failed, Some(err.to_string())),
        };
        if let Err(err) = self
            .inner
            .state
            .transition(&task.task_id, target, message)
            .await
        {
            warn!(task_id = %task.task_id, %err, "post-run transition failed");
        }
        self.release_running_entry(&task.task_id).await;
    }

    async fn release_running_entry(&self, task_id: &str) {
        let entry = self.inner.running.lock().await.remove(task_id);
        if let Some(entry) = entry {
            if let Some(guard) = entry.lock {
                if let Err(err) = guard.release().await {
                    warn!(task_id, %err, "lock release failed");
                }
            }
        }
    }

    async fn check_timeout(&self, task: &TaskRecord) -> AgentResult<()> {
        let Some(started_at) = task.started_at else {
            return Ok(());
        };
        let timeout = task
            .timeout_seconds
            .unwrap_or(self.inner.config.task_timeout_s);
        let elapsed = (Utc::now() - started_at).num_seconds();
        if elapsed <= timeout as i64 {
            return Ok(());
        }

        warn!(task_id = %task.task_id, elapsed, timeout, "task timed out");
        metrics().task_timed_out();
        if let Some(entry) = self.inner.running.lock().await.remove(&task.task_id) {
            entry.cancel.cancel();
            if let Some(guard) = entry.lock {
                guard.release().await?;
            }
        }
        self.inner
            .state
            .transition(&task.task_id, TaskStatus::Failed, Some("timeout".to_string()))
            .await?;
        Ok(())
    }

    /// FAILED tasks with retry budget left go back to PENDING; the rest
    /// surface to the human gate and settle as CANCELLED.
    async fn apply_retry_policy(&self, task: &TaskRecord) -> AgentResult<()> {
        if task.can_retry() {
            let mut retried = task.clone();
            retried.retry_count += 1;
            self.inner.tasks.save(&retried).await?;
            self.inner
                .state
                .transition(&task.task_id, TaskStatus::Pending, None)
                .await?;
            info!(
                task_id = %task.task_id,
                retry = retried.retry_count,
                max = retried.max_retries,
                "task re-queued for retry"
            );
            return Ok(());
        }

        warn!(task_id = %task.task_id, "task retries exhausted");
        self.inner
            .approvals
            .escalate(
                &task.project_id,
                showrunner_types::EventType::ErrorOccurred,
                format!(
                    "task {} failed after {} retries: {}",
                    task.task_id,
                    task.retry_count,
                    task.error_message.as_deref().unwrap_or("unknown error")
                ),
                json!({
                    "task_id": &task.task_id,
                    "assigned_to": &task.assigned_to,
                    "retry_count": task.retry_count,
                    "error_message": &task.error_message,
                }),
                None,
            )
            .await?;
        self.inner
            .state
            .transition(&task.task_id, TaskStatus::Cancelled, None)
            .await?;
        Ok(())
    }

    /// Cancel one task: fire its token, release its lock, settle the
    /// record, all within the caller's tick.
    pub async fn cancel_task(&self, task_id: &str) -> AgentResult<()> {
        if let Some(entry) = self.inner.running.lock().await.remove(task_id) {
            entry.cancel.cancel();
            if let Some(guard) = entry.lock {
                guard.release().await?;
            }
        }
        let task = self.inner.tasks.get(task_id).await?;
        if !task.status.is_terminal() {
            self.inner
                .state
                .transition(task_id, TaskStatus::Cancelled, None)
                .await?;
        }
        Ok(())
    }

    async fn cancel_project_tasks(&self, project_id: &str) -> AgentResult<()> {
        for task in self.inner.tasks.list_for_project(project_id).await? {
            if !task.status.is_terminal() {
                self.cancel_task(&task.task_id).await?;
            }
        }
        Ok(())
    }

    /// Cancel every live task of a project (the project itself is put in
    /// CANCELLED by the caller).
    pub async fn cancel_project(&self, project_id: &str) -> AgentResult<()> {
        self.cancel_project_tasks(project_id).await
    }

    /// Scheduler loop: tick every project that still has live tasks.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.inner.config.tick_interval_ms.max(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let projects = match self.inner.tasks.projects_with_live_tasks().await {
                        Ok(projects) => projects,
                        Err(err) => {
                            warn!(%err, "scheduler scan failed");
                            continue;
                        }
                    };
                    for project_id in projects {
                        if let Err(err) = self.tick(&project_id).await {
                            warn!(project_id = %project_id, %err, "scheduler tick failed");
                        }
                    }
                }
            }
        }
        debug!("scheduler loop stopped");
    }

    /// Whether the named lock currently has a live holder; used by the
    /// control surface and tests.
    pub async fn lock_held(&self, name: &str) -> AgentResult<bool> {
        Ok(self.inner.locks.is_held(name).await?)
    }
}
