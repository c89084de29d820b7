pub mod approvals;
pub mod archive;
pub mod blackboard;
pub mod cache;
pub mod db;
pub mod event_log;
pub mod lock;
pub mod tasks;

use showrunner_types::{ErrorClass, PayloadError, ProjectStatus};
use thiserror::Error;

pub use approvals::ApprovalRepo;
pub use archive::{EventArchive, EventQuery, EventTypeStats};
pub use blackboard::{Blackboard, CostReceipt};
pub use cache::DocumentCache;
pub use db::StoreDatabase;
pub use event_log::EventLog;
pub use lock::{LockGuard, LockManager};
pub use tasks::TaskRepo;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} not found")]
    ProjectNotFound(String),
    #[error("project {0} already exists")]
    ProjectExists(String),
    #[error("shot {shot_id} not found in project {project_id}")]
    ShotNotFound { project_id: String, shot_id: String },
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("approval {0} not found")]
    ApprovalNotFound(String),
    #[error("event {0} not found")]
    EventNotFound(String),
    #[error("version conflict on project {project_id}: expected {expected}")]
    VersionConflict { project_id: String, expected: u64 },
    #[error("illegal project status transition {from:?} -> {to:?}")]
    IllegalStatusTransition {
        from: ProjectStatus,
        to: ProjectStatus,
    },
    #[error("invalid value: {0}")]
    Invalid(String),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::ProjectNotFound(_)
            | StoreError::ShotNotFound { .. }
            | StoreError::TaskNotFound(_)
            | StoreError::ApprovalNotFound(_)
            | StoreError::EventNotFound(_) => ErrorClass::NotFound,
            StoreError::VersionConflict { .. } => ErrorClass::Conflict,
            StoreError::ProjectExists(_)
            | StoreError::IllegalStatusTransition { .. }
            | StoreError::Invalid(_)
            | StoreError::Payload(_)
            | StoreError::Serialization(_) => ErrorClass::Validation,
            StoreError::Database(err) => match err {
                rusqlite::Error::SqliteFailure(code, _)
                    if matches!(
                        code.code,
                        rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                    ) =>
                {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Fatal,
            },
        }
    }
}
