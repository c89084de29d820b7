use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use showrunner_bus::{BusError, EventBus, Subscriber};
use showrunner_observability::metrics;
use showrunner_store::{Blackboard, StoreError};
use showrunner_types::{ErrorClass, Event, EventType};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalManager;
use crate::strategy::StrategyAdjuster;

pub type AgentResult<T> = Result<T, AgentError>;

/// Error surface of an agent handler, tagged by behavioral class so the
/// runtime can choose between retry, fallback, and escalation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("budget: {0}")]
    Budget(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Transient(_) => ErrorClass::Transient,
            AgentError::Budget(_) => ErrorClass::Budget,
            AgentError::Validation(_) => ErrorClass::Validation,
            AgentError::NotFound(_) => ErrorClass::NotFound,
            AgentError::Timeout(_) => ErrorClass::Timeout,
            AgentError::Fatal(_) => ErrorClass::Fatal,
            AgentError::Store(err) => err.class(),
            AgentError::Bus(err) => match err {
                BusError::Store(store) => store.class(),
                BusError::Payload(_) => ErrorClass::Validation,
            },
        }
    }
}

/// A long-lived participant: declares the event types it consumes and
/// handles them. Handlers may read/write the blackboard, publish further
/// events, or do nothing; the runtime supplies idempotency on event_id
/// and the recovery ladder.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    fn subscribed_events(&self) -> Vec<EventType>;
    async fn handle_event(&self, event: &Event) -> AgentResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_attempts: 3,
        }
    }
}

/// Subscriber adapter wrapping an [`Agent`] with three-level recovery:
///
/// 1. exponential-backoff retries on transient classes,
/// 2. budget fallback through a quality-tier downgrade,
/// 3. escalation to the human gate with full error context.
///
/// The ladder is a loop over explicit states, not nested error handling;
/// each pass either re-runs the handler or exits via escalation.
pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    blackboard: Blackboard,
    bus: EventBus,
    strategy: Arc<StrategyAdjuster>,
    approvals: Arc<ApprovalManager>,
    policy: RecoveryPolicy,
}

impl AgentRuntime {
    pub fn new(
        agent: Arc<dyn Agent>,
        blackboard: Blackboard,
        bus: EventBus,
        strategy: Arc<StrategyAdjuster>,
        approvals: Arc<ApprovalManager>,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            agent,
            blackboard,
            bus,
            strategy,
            approvals,
            policy,
        }
    }

    async fn process(&self, event: &Event) -> AgentResult<()> {
        let handler = self.agent.name();
        let event_key = event.event_id.to_string();
        if self.blackboard.is_processed(handler, &event_key).await? {
            debug!(handler, event_id = %event.event_id, "duplicate delivery ignored");
            return Ok(());
        }

        let mut attempt: u32 = 0;
        let mut fallback_used = false;
        loop {
            match self.agent.handle_event(event).await {
                Ok(()) => {
                    self.blackboard.mark_processed(handler, &event_key).await?;
                    metrics().event_handled();
                    return Ok(());
                }
                Err(err) => {
                    let class = err.class();
                    if class.is_retryable() && attempt < self.policy.max_attempts {
                        let delay = self.policy.initial_delay * 2u32.saturating_pow(attempt);
                        attempt += 1;
                        metrics().handler_retry();
                        warn!(
                            handler,
                            event_id = %event.event_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            class = class.as_str(),
                            %err,
                            "handler failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if class == ErrorClass::Budget && !fallback_used {
                        fallback_used = true;
                        metrics().fallback();
                        match self
                            .strategy
                            .downgrade(&event.project_id, Some(event))
                            .await
                        {
                            Ok(Some(tier)) => {
                                info!(
                                    handler,
                                    project_id = %event.project_id,
                                    new_tier = tier.as_str(),
                                    "budget fallback: re-running at lower tier"
                                );
                                continue;
                            }
                            Ok(None) => {
                                warn!(handler, project_id = %event.project_id,
                                      "budget fallback exhausted, already at lowest tier");
                            }
                            Err(fallback_err) => {
                                error!(handler, %fallback_err, "budget fallback failed");
                            }
                        }
                    }
                    metrics().handler_failure();
                    self.escalate(event, &err, attempt).await?;
                    // The event is resolved from the bus's point of view;
                    // redelivery must not re-run a handler a human now owns.
                    self.blackboard.mark_processed(handler, &event_key).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn escalate(&self, event: &Event, err: &AgentError, retry_count: u32) -> AgentResult<()> {
        metrics().escalation();
        let context = json!({
            "error_class": err.class().as_str(),
            "message": err.to_string(),
            "agent": self.agent.name(),
            "event_id": event.event_id,
            "event_type": event.event_type.as_str(),
            "retry_count": retry_count,
        });
        error!(
            handler = self.agent.name(),
            event_id = %event.event_id,
            class = err.class().as_str(),
            %err,
            "recovery exhausted, escalating to human gate"
        );

        self.bus
            .publish(
                Event::new(&event.project_id, EventType::ErrorOccurred, self.agent.name())
                    .with_payload(context.clone())
                    .caused_by(event),
            )
            .await?;

        self.approvals
            .escalate(
                &event.project_id,
                event.event_type,
                format!("{} failed handling {}: {err}", self.agent.name(), event.event_type),
                context,
                Some(event),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for AgentRuntime {
    fn name(&self) -> &str {
        self.agent.name()
    }

    fn subscribed_events(&self) -> Vec<EventType> {
        self.agent.subscribed_events()
    }

    async fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        self.process(event).await.map_err(Into::into)
    }
}
