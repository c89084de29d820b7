use serde::{Deserialize, Serialize};

/// Behavioral error categories. The runtime decides between retry,
/// fallback, and escalation from the class, never from the concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Project, shot, task, or event missing. Surfaced, never retried.
    NotFound,
    /// Optimistic-version conflict. Retried locally, then surfaced.
    Conflict,
    /// Network, timeout, rate limit, storage unavailable.
    Transient,
    /// Budget exhausted; candidate for the quality-downgrade fallback.
    Budget,
    /// Schema or payload violation. Fatal, not retried.
    Validation,
    /// Handler or task deadline exceeded.
    Timeout,
    /// Lock held elsewhere; retried on the next scheduler tick.
    LockBusy,
    /// Everything else; goes straight to escalation.
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::Conflict | ErrorClass::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Budget => "budget",
            ErrorClass::Validation => "validation",
            ErrorClass::Timeout => "timeout",
            ErrorClass::LockBusy => "lock_busy",
            ErrorClass::Fatal => "fatal",
        }
    }
}
