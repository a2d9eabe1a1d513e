//! # Conclave
//!
//! Plan orchestration substrate for agent swarms.
//!
//! A goal becomes a [`Plan`] of steps arranged in parallel groups. The
//! [`PlanExecutor`] runs the groups in order, dispatching every step of a
//! group concurrently to agents drawn from a bounded hierarchy, records each
//! action in a hash-chained [`AuditLog`], and can push progress onto a named
//! event stream for live observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            PLAN EXECUTOR                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │Plan Generator│  │ Policy Gate  │  │   Criteria   │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └──────┬──────────────────────┬──────────────────────────┬────────────┘
//!        │                      │                          │
//!        ▼                      ▼                          ▼
//! ┌─────────────┐        ┌─────────────┐            ┌─────────────┐
//! │  Agent Pool │        │  Audit Log  │            │   Streams   │
//! │ (hierarchy) │        │ (hash chain)│            │ (SSE feeds) │
//! └──────┬──────┘        └─────────────┘            └─────────────┘
//!        │
//!   ┌────┴─────────────┐
//!   ▼    ▼    ▼    ▼    ▼
//! ┌───┐┌───┐┌───┐┌───┐┌───┐
//! │Res││Cod││Ana││Str││Des│   level 1 specialists under the root
//! └───┘└───┘└───┘└───┘└───┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Plan**: Steps plus ordered parallel groups; group N finishes before group N+1 starts
//! - **Step**: A unit of work for one agent role, with optional success criteria and fallback
//! - **Agent**: Anything implementing [`Agent::execute`]; spawned per role on first use
//! - **Audit log**: Append-only ledger where each entry commits to its predecessor's hash
//! - **Stream**: Bounded FIFO of progress events drained as frames or server-sent events

pub mod agent;
pub mod audit;
pub mod channel;
pub mod config;
pub mod criteria;
pub mod error;
pub mod hierarchy;
pub mod ids;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod pool;

pub use agent::{Agent, AgentFactory, AgentHandle, AgentRole, AgentStatus, TaskContext};
pub use audit::{AuditEntry, AuditEventType, AuditLog, ChainExport, ChainVerification};
pub use channel::{SendOutcome, StreamEvent, StreamFrame, StreamHandle, StreamInfo, StreamManager};
pub use config::{BackpressurePolicy, ConclaveConfig, ExecutorConfig, HierarchyConfig, StreamConfig};
pub use criteria::{KeywordCriterion, SuccessCriterion};
pub use error::{ConclaveError, HierarchyError, Result};
pub use hierarchy::{AgentHierarchy, HierarchyStats};
pub use ids::{AgentId, PlanId, StepId};
pub use orchestrator::PlanExecutor;
pub use plan::{Plan, PlanDraft, PlanStatus, RiskLevel, Step, StepOutcome, StepStatus};
pub use planner::PlanGenerator;
pub use policy::{AllowAll, ContentFilterGate, PolicyDecision, PolicyGate, PolicyRequest};
pub use pool::AgentPool;
