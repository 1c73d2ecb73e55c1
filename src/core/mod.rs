//! Agent orchestration: the reason/act loop, approval, streaming, and delegation.

pub mod approval;
pub mod engine;
pub mod events;
pub mod spawner;
pub mod stream;

pub use approval::{ApprovalDecision, ApprovalRequest, Approver, ChannelApprover};
pub use engine::{AgentRole, Orchestrator, OrchestratorConfig};
pub use events::Event;
pub use spawner::{AgentFactory, DelegationReport, Spawner};
