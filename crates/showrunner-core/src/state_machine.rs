use chrono::Utc;
use showrunner_store::{StoreResult, TaskRepo};
use showrunner_types::{TaskRecord, TaskStatus};
use tracing::{info, warn};

/// Applies task transitions through the store. Only the moves in
/// [`TaskStatus::can_transition`] happen; an invalid request is rejected
/// with no state change and logged, returning `None`.
#[derive(Clone)]
pub struct TaskStateMachine {
    tasks: TaskRepo,
}

impl TaskStateMachine {
    pub fn new(tasks: TaskRepo) -> Self {
        Self { tasks }
    }

    pub async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        error_message: Option<String>,
    ) -> StoreResult<Option<TaskRecord>> {
        let mut task = self.tasks.get(task_id).await?;
        let from = task.status;
        if !from.can_transition(target) {
            warn!(
                task_id,
                from = from.as_str(),
                to = target.as_str(),
                "invalid task transition rejected"
            );
            return Ok(None);
        }

        task.status = target;
        match target {
            TaskStatus::Running => {
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                if task.completed_at.is_none() {
                    task.completed_at = Some(Utc::now());
                }
            }
            TaskStatus::Pending => {
                // Re-queued for retry; the next run stamps fresh times.
                task.started_at = None;
                task.completed_at = None;
            }
            _ => {}
        }
        if let Some(message) = error_message {
            task.error_message = Some(message);
        }

        self.tasks.save(&task).await?;
        info!(
            task_id,
            from = from.as_str(),
            to = target.as_str(),
            "task transitioned"
        );
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_store::StoreDatabase;
    use tempfile::TempDir;

    async fn machine() -> (TaskStateMachine, TaskRepo, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        let repo = TaskRepo::new(db);
        (TaskStateMachine::new(repo.clone()), repo, dir)
    }

    #[tokio::test]
    async fn legal_path_stamps_timestamps() {
        let (machine, repo, _dir) = machine().await;
        repo.create(&TaskRecord::new("T1", "PROJ-1", "image_gen"))
            .await
            .unwrap();

        machine
            .transition("T1", TaskStatus::Ready, None)
            .await
            .unwrap()
            .expect("pending -> ready");
        let running = machine
            .transition("T1", TaskStatus::Running, None)
            .await
            .unwrap()
            .expect("ready -> running");
        assert!(running.started_at.is_some());

        let done = machine
            .transition("T1", TaskStatus::Completed, None)
            .await
            .unwrap()
            .expect("running -> completed");
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_leaves_state_untouched() {
        let (machine, repo, _dir) = machine().await;
        repo.create(&TaskRecord::new("T1", "PROJ-1", "image_gen"))
            .await
            .unwrap();

        let refused = machine
            .transition("T1", TaskStatus::Completed, None)
            .await
            .unwrap();
        assert!(refused.is_none());
        assert_eq!(repo.get("T1").await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn retry_requeue_clears_run_stamps() {
        let (machine, repo, _dir) = machine().await;
        repo.create(&TaskRecord::new("T1", "PROJ-1", "image_gen"))
            .await
            .unwrap();
        machine.transition("T1", TaskStatus::Ready, None).await.unwrap();
        machine
            .transition("T1", TaskStatus::Running, None)
            .await
            .unwrap();
        machine
            .transition("T1", TaskStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();

        let requeued = machine
            .transition("T1", TaskStatus::Pending, None)
            .await
            .unwrap()
            .expect("failed -> pending");
        assert!(requeued.started_at.is_none());
        assert!(requeued.completed_at.is_none());
        assert_eq!(requeued.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn terminal_states_reject_everything() {
        let (machine, repo, _dir) = machine().await;
        let mut task = TaskRecord::new("T1", "PROJ-1", "image_gen");
        task.status = TaskStatus::Completed;
        repo.create(&task).await.unwrap();

        for target in [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Running,
            TaskStatus::Cancelled,
        ] {
            assert!(machine
                .transition("T1", target, None)
                .await
                .unwrap()
                .is_none());
        }
    }
}
