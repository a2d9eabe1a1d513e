//! Agent capability abstraction - the workers a plan dispatches to

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;
use crate::plan::{Plan, Step};

/// Closed set of specialist roles a step can ask for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum AgentRole {
    Researcher,
    Coder,
    Analyst,
    Strategist,
    Designer,
    #[default]
    Generic,
}

impl AgentRole {
    pub const SPECIALISTS: [AgentRole; 5] = [
        AgentRole::Researcher,
        AgentRole::Coder,
        AgentRole::Analyst,
        AgentRole::Strategist,
        AgentRole::Designer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Researcher => "researcher",
            AgentRole::Coder => "coder",
            AgentRole::Analyst => "analyst",
            AgentRole::Strategist => "strategist",
            AgentRole::Designer => "designer",
            AgentRole::Generic => "generic",
        }
    }

    /// Map a free-form agent type onto a role. Anything unrecognised is generic.
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase();
        let name = normalized
            .strip_prefix("specialist_")
            .unwrap_or(&normalized);

        match name {
            "researcher" => AgentRole::Researcher,
            "coder" => AgentRole::Coder,
            "analyst" => AgentRole::Analyst,
            "strategist" => AgentRole::Strategist,
            "designer" => AgentRole::Designer,
            _ => AgentRole::Generic,
        }
    }
}

impl From<String> for AgentRole {
    fn from(value: String) -> Self {
        AgentRole::parse(&value)
    }
}

impl From<AgentRole> for &'static str {
    fn from(role: AgentRole) -> Self {
        role.as_str()
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context handed to an agent alongside its task text
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Snapshot of the plan taken when execution started
    pub plan: Arc<Plan>,
    pub step: Step,
    /// True when the agent is running the step's fallback task
    pub fallback: bool,
}

/// Something that can perform a step.
///
/// Implementations wrap the language-model round trip; the orchestrator only
/// sees the returned value or the error.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(&self, task: &str, context: &TaskContext) -> anyhow::Result<Value>;
}

/// Creates agents for roles the pool has not seen yet
pub trait AgentFactory: Send + Sync {
    fn create(&self, role: AgentRole) -> Arc<dyn Agent>;
}

impl<F> AgentFactory for F
where
    F: Fn(AgentRole) -> Arc<dyn Agent> + Send + Sync,
{
    fn create(&self, role: AgentRole) -> Arc<dyn Agent> {
        self(role)
    }
}

/// Lifecycle state of an agent handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Executing,
    Error,
}

struct AgentState {
    status: RwLock<AgentStatus>,
    invocations: AtomicU64,
}

/// Handle to a registered agent
#[derive(Clone)]
pub struct AgentHandle {
    id: AgentId,
    role: AgentRole,
    parent_id: Option<AgentId>,
    agent: Arc<dyn Agent>,
    state: Arc<AgentState>,
}

impl AgentHandle {
    pub fn new(
        id: AgentId,
        role: AgentRole,
        parent_id: Option<AgentId>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        Self {
            id,
            role,
            parent_id,
            agent,
            state: Arc::new(AgentState {
                status: RwLock::new(AgentStatus::Idle),
                invocations: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn parent_id(&self) -> Option<AgentId> {
        self.parent_id
    }

    pub fn status(&self) -> AgentStatus {
        *self.state.status.read()
    }

    /// Number of `execute` calls made through this handle
    pub fn invocations(&self) -> u64 {
        self.state.invocations.load(Ordering::Relaxed)
    }

    /// Run a task on the underlying agent, tracking status
    pub async fn execute(&self, task: &str, context: &TaskContext) -> anyhow::Result<Value> {
        self.state.invocations.fetch_add(1, Ordering::Relaxed);
        *self.state.status.write() = AgentStatus::Executing;

        let result = self.agent.execute(task, context).await;

        *self.state.status.write() = match &result {
            Ok(_) => AgentStatus::Idle,
            Err(_) => AgentStatus::Error,
        };
        result
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("parent_id", &self.parent_id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;

    struct Echo;

    #[async_trait]
    impl Agent for Echo {
        async fn execute(&self, task: &str, _context: &TaskContext) -> anyhow::Result<Value> {
            Ok(Value::String(task.to_string()))
        }
    }

    struct Broken;

    #[async_trait]
    impl Agent for Broken {
        async fn execute(&self, _task: &str, _context: &TaskContext) -> anyhow::Result<Value> {
            anyhow::bail!("model unavailable")
        }
    }

    fn context() -> TaskContext {
        let plan = Plan::fallback("write docs");
        let step = plan.steps[0].clone();
        TaskContext {
            plan: Arc::new(plan),
            step,
            fallback: false,
        }
    }

    // === Role Tests ===

    #[test]
    fn test_role_parse() {
        assert_eq!(AgentRole::parse("Researcher"), AgentRole::Researcher);
        assert_eq!(AgentRole::parse("specialist_coder"), AgentRole::Coder);
        assert_eq!(AgentRole::parse("generalist"), AgentRole::Generic);
        assert_eq!(AgentRole::parse("astrologer"), AgentRole::Generic);
    }

    #[test]
    fn test_role_default_is_generic() {
        assert_eq!(AgentRole::default(), AgentRole::Generic);
        assert!(!AgentRole::SPECIALISTS.contains(&AgentRole::default()));
    }

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&AgentRole::Analyst).unwrap();
        assert_eq!(json, "\"analyst\"");

        let role: AgentRole = serde_json::from_str("\"strategist\"").unwrap();
        assert_eq!(role, AgentRole::Strategist);

        let unknown: AgentRole = serde_json::from_str("\"whatever\"").unwrap();
        assert_eq!(unknown, AgentRole::Generic);
    }

    // === Handle Tests ===

    #[tokio::test]
    async fn test_handle_execute_tracks_status() {
        let handle = AgentHandle::new(AgentId::new(), AgentRole::Generic, None, Arc::new(Echo));
        assert_eq!(handle.status(), AgentStatus::Idle);

        let value = handle.execute("hello", &context()).await.unwrap();
        assert_eq!(value, Value::String("hello".into()));
        assert_eq!(handle.status(), AgentStatus::Idle);
        assert_eq!(handle.invocations(), 1);
    }

    #[tokio::test]
    async fn test_handle_execute_error_status() {
        let handle = AgentHandle::new(AgentId::new(), AgentRole::Coder, None, Arc::new(Broken));

        let err = handle.execute("compile", &context()).await.unwrap_err();
        assert!(err.to_string().contains("model unavailable"));
        assert_eq!(handle.status(), AgentStatus::Error);
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_role: AgentRole| -> Arc<dyn Agent> { Arc::new(Echo) };
        let _agent = AgentFactory::create(&factory, AgentRole::Designer);
    }
}
