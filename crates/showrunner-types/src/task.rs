use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// The transition table; everything not listed is rejected.
    pub fn can_transition(self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Pending => matches!(target, Ready | Cancelled),
            Ready => matches!(target, Running | WaitingApproval | Cancelled),
            Running => matches!(target, Completed | Failed | Cancelled),
            WaitingApproval => matches!(target, Ready | Cancelled),
            Failed => matches!(target, Pending | Cancelled),
            Completed | Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::WaitingApproval => "WAITING_APPROVAL",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

/// A unit of scheduled work. Owned by its project's scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub project_id: String,
    pub assigned_to: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
    #[serde(default)]
    pub requires_lock: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "TaskRecord::default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        project_id: impl Into<String>,
        assigned_to: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            project_id: project_id.into(),
            assigned_to: assigned_to.into(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            lock_key: None,
            requires_lock: false,
            retry_count: 0,
            max_retries: Self::default_max_retries(),
            timeout_seconds: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_lock(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self.requires_lock = true;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn default_max_retries() -> u32 {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_design() {
        use TaskStatus::*;
        let legal = [
            (Pending, Ready),
            (Pending, Cancelled),
            (Ready, Running),
            (Ready, WaitingApproval),
            (Ready, Cancelled),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
            (WaitingApproval, Ready),
            (WaitingApproval, Cancelled),
            (Failed, Pending),
            (Failed, Cancelled),
        ];
        let all = [
            Pending,
            Ready,
            Running,
            WaitingApproval,
            Completed,
            Failed,
            Cancelled,
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn retry_budget_is_bounded() {
        let mut task = TaskRecord::new("T1", "PROJ-1", "image_gen");
        assert!(task.can_retry());
        task.retry_count = 3;
        assert!(!task.can_retry());
    }
}
