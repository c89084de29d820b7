pub mod approval;
pub mod error;
pub mod event;
pub mod payload;
pub mod project;
pub mod task;

pub use approval::{
    ApprovalAction, ApprovalRequest, ApprovalStatus, UserDecision, APPROVAL_OPTIONS,
};
pub use error::ErrorClass;
pub use event::{Event, EventMetadata, EventType, Money};
pub use payload::{validate_payload, PayloadError};
pub use project::{
    ArtifactMeta, Budget, GlobalSpec, ProjectDoc, ProjectStatus, QualityTier, Shot, ShotStatus,
    UserOptions,
};
pub use task::{TaskRecord, TaskStatus};
