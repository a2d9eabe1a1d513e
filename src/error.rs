//! Conclave error types

use thiserror::Error;

use crate::agent::AgentRole;
use crate::ids::{AgentId, PlanId};
use crate::plan::PlanStatus;

/// Errors that can occur at the orchestrator's API boundary.
///
/// Per-step and per-spawn failures never surface here during execution; they
/// are captured as [`crate::plan::StepOutcome`] records instead.
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Unknown plan id
    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    /// Plan generator output for an adaptation could not be used
    #[error("Failed to adapt plan {plan_id}: {reason}")]
    AdaptationFailed { plan_id: PlanId, reason: String },

    /// Operation not allowed in the plan's current state
    #[error("Plan {plan_id} cannot be used while {status:?}")]
    InvalidPlanState { plan_id: PlanId, status: PlanStatus },

    /// Hierarchy depth or fan-out exceeded
    #[error("Capacity exceeded: {0}")]
    Capacity(#[from] HierarchyError),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// A role already has an agent serving it
    #[error("Role already has an agent: {0}")]
    RoleTaken(AgentRole),

    /// Stream channel does not exist
    #[error("Stream channel not found: {0}")]
    ChannelAbsent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capacity and bookkeeping failures of the agent hierarchy.
///
/// Both direct registration and spawning report through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("level {level} exceeds max depth {max_depth}")]
    DepthExceeded { level: usize, max_depth: usize },

    #[error("agent {parent} already has {max_children} children")]
    FanOutExceeded { parent: AgentId, max_children: usize },

    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("agent {0} is already registered")]
    AlreadyRegistered(AgentId),

    #[error("child level must be {expected}, got {actual}")]
    LevelMismatch { expected: usize, actual: usize },
}

pub type Result<T, E = ConclaveError> = std::result::Result<T, E>;
