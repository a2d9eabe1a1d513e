//! Plan generation collaborator

use async_trait::async_trait;
use serde_json::Value;

use crate::plan::Plan;

/// Produces plan drafts as JSON text.
///
/// Implementations usually wrap a language model, so the output may be
/// malformed; the executor parses it and degrades gracefully.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Draft a plan for a goal
    async fn generate_plan(&self, goal: &str, context: &Value) -> anyhow::Result<String>;

    /// Draft a replacement for an existing plan given feedback
    async fn adapt_plan(&self, plan: &Plan, feedback: &str) -> anyhow::Result<String>;
}
