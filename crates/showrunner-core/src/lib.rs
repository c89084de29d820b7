pub mod approval;
pub mod budget;
pub mod config;
pub mod engine;
pub mod repair;
pub mod runtime;
pub mod scheduler;
pub mod state_machine;
pub mod strategy;

pub use approval::{ApprovalManager, TimeoutPolicy};
pub use budget::{BudgetController, BudgetStatus};
pub use config::CoreConfig;
pub use engine::Engine;
pub use repair::{FailureEvaluator, RevisionRouter};
pub use runtime::{Agent, AgentError, AgentRuntime, RecoveryPolicy};
pub use scheduler::{Scheduler, TaskExecutor};
pub use state_machine::TaskStateMachine;
pub use strategy::StrategyAdjuster;
