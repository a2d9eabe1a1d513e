//! Plan data model
//!
//! A [`Plan`] is a goal decomposed into [`Step`]s plus an ordered list of
//! parallel groups. Group index is execution order. Steps carry their
//! `dependencies` as metadata; when a generator omits the groups they are
//! derived by layering those dependencies.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::agent::AgentRole;
use crate::ids::{AgentId, PlanId, StepId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl From<String> for RiskLevel {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" => RiskLevel::High,
            "medium" => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl From<RiskLevel> for &'static str {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Lifecycle of a plan: `Pending -> Executing -> Completed | Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Executing,
    Completed,
    Cancelled,
}

/// One unit of work assigned to an agent role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub description: String,
    #[serde(default)]
    pub agent_type: AgentRole,
    #[serde(default)]
    pub dependencies: Vec<StepId>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub success_criteria: Option<String>,
}

impl Step {
    pub fn new(id: u32, description: impl Into<String>, agent_type: AgentRole) -> Self {
        Self {
            id: StepId(id),
            description: description.into(),
            agent_type,
            dependencies: Vec::new(),
            resources: Vec::new(),
            risk_level: RiskLevel::Low,
            fallback: None,
            success_criteria: None,
        }
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.dependencies = ids.into_iter().map(StepId).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
}

/// Result of one executed step. Exactly one is produced per dispatched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: StepId,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub used_fallback: bool,
}

impl StepOutcome {
    pub fn success(step_id: StepId, result: Value) -> Self {
        Self {
            step_id,
            status: StepStatus::Success,
            result: Some(result),
            error: None,
            agent_id: None,
            used_fallback: false,
        }
    }

    pub fn failed(step_id: StepId, error: impl Into<String>) -> Self {
        Self {
            step_id,
            status: StepStatus::Failed,
            result: None,
            error: Some(error.into()),
            agent_id: None,
            used_fallback: false,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// A step ordering that contradicts a declared dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DependencyConflict {
    pub step: StepId,
    pub dependency: StepId,
}

/// A goal decomposed into ordered groups of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub goal: String,
    pub steps: Vec<Step>,
    pub parallel_groups: Vec<Vec<StepId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical_path: Option<Vec<StepId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_estimated_time: Option<String>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<StepOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptation_reason: Option<String>,
}

impl Plan {
    /// Build a pending plan from generator output
    pub fn from_draft(goal: impl Into<String>, draft: PlanDraft) -> Self {
        let mut plan = Self::empty(goal.into());
        plan.install_draft(draft);
        plan
    }

    /// Single-step plan whose only step is the goal itself, run by a generic agent
    pub fn fallback(goal: impl Into<String>) -> Self {
        let goal = goal.into();
        let mut plan = Self::empty(goal.clone());
        plan.steps = vec![Step::new(1, goal, AgentRole::Generic)];
        plan.parallel_groups = vec![vec![StepId(1)]];
        plan
    }

    fn empty(goal: String) -> Self {
        Self {
            id: PlanId::new(),
            goal,
            steps: Vec::new(),
            parallel_groups: Vec::new(),
            critical_path: None,
            total_estimated_time: None,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            results: None,
            adapted_at: None,
            adaptation_reason: None,
        }
    }

    /// Replace the step list under the same id, resetting execution state
    pub fn adapt(&mut self, draft: PlanDraft, reason: impl Into<String>) {
        self.install_draft(draft);
        self.status = PlanStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.results = None;
        self.adapted_at = Some(Utc::now());
        self.adaptation_reason = Some(reason.into());
    }

    fn install_draft(&mut self, draft: PlanDraft) {
        self.parallel_groups = match draft.parallel_groups {
            Some(groups) if !groups.is_empty() => groups,
            _ => layer_dependencies(&draft.steps),
        };
        self.steps = draft.steps;
        self.critical_path = draft.critical_path;
        self.total_estimated_time = draft.total_estimated_time;

        for conflict in self.dependency_conflicts() {
            warn!(
                plan_id = %self.id,
                step = %conflict.step,
                dependency = %conflict.dependency,
                "Parallel groups do not respect declared dependency"
            );
        }
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Group references with no matching step. These are skipped at execution.
    pub fn dangling_group_refs(&self) -> Vec<StepId> {
        self.parallel_groups
            .iter()
            .flatten()
            .filter(|id| self.step(**id).is_none())
            .copied()
            .collect()
    }

    /// Declared dependencies that the authored groups would run out of order.
    ///
    /// A dependency conflicts when it is scheduled in the same or a later
    /// group than its dependent, or not scheduled at all.
    pub fn dependency_conflicts(&self) -> Vec<DependencyConflict> {
        let mut group_of: HashMap<StepId, usize> = HashMap::new();
        for (index, group) in self.parallel_groups.iter().enumerate() {
            for id in group {
                group_of.entry(*id).or_insert(index);
            }
        }

        let mut conflicts = Vec::new();
        for step in &self.steps {
            let Some(&step_group) = group_of.get(&step.id) else {
                continue;
            };
            for dep in &step.dependencies {
                if self.step(*dep).is_none() {
                    continue;
                }
                let ordered = group_of.get(dep).is_some_and(|g| *g < step_group);
                if !ordered {
                    conflicts.push(DependencyConflict {
                        step: step.id,
                        dependency: *dep,
                    });
                }
            }
        }
        conflicts
    }
}

/// Layer steps into parallel groups with Kahn's algorithm.
///
/// Dependencies on unknown steps are ignored. Steps caught in a cycle cannot
/// be layered and are appended together as one final group.
pub fn layer_dependencies(steps: &[Step]) -> Vec<Vec<StepId>> {
    let order: HashMap<StepId, usize> = steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
    let mut indegree: HashMap<StepId, usize> = HashMap::new();
    let mut dependents: HashMap<StepId, Vec<StepId>> = HashMap::new();

    for step in steps {
        let deps: HashSet<StepId> = step
            .dependencies
            .iter()
            .filter(|d| order.contains_key(d))
            .copied()
            .collect();
        indegree.insert(step.id, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(step.id);
        }
    }

    let mut layers = Vec::new();
    let mut placed = HashSet::new();
    let mut current: Vec<StepId> = steps
        .iter()
        .filter(|s| indegree.get(&s.id) == Some(&0))
        .map(|s| s.id)
        .collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for id in &current {
            placed.insert(*id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        next.sort_by_key(|id| order[id]);
        next.dedup();
        layers.push(std::mem::replace(&mut current, next));
    }

    let stranded: Vec<StepId> = steps
        .iter()
        .map(|s| s.id)
        .filter(|id| !placed.contains(id))
        .collect();
    if !stranded.is_empty() {
        warn!(steps = ?stranded, "Dependency cycle detected, scheduling remaining steps last");
        layers.push(stranded);
    }

    layers
}

/// Plan as produced by a plan generator, before ids and timestamps are assigned
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlanDraft {
    #[serde(default)]
    pub goal: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parallel_groups: Option<Vec<Vec<StepId>>>,
    #[serde(default)]
    pub critical_path: Option<Vec<StepId>>,
    #[serde(default)]
    pub total_estimated_time: Option<String>,
}

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("malformed plan JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step id {0}")]
    DuplicateStep(StepId),
}

impl PlanDraft {
    /// Parse generator output. A surrounding markdown code fence is tolerated.
    pub fn parse(raw: &str) -> Result<Self, DraftError> {
        let draft: PlanDraft = serde_json::from_str(strip_code_fence(raw))?;

        if draft.steps.is_empty() {
            return Err(DraftError::Empty);
        }
        let mut seen = HashSet::new();
        for step in &draft.steps {
            if !seen.insert(step.id) {
                return Err(DraftError::DuplicateStep(step.id));
            }
        }
        Ok(draft)
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening fence line
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DRAFT: &str = r#"{
        "goal": "ship release",
        "steps": [
            {"id": 1, "description": "collect changes", "agent_type": "researcher", "risk_level": "low"},
            {"id": 2, "description": "write notes", "agent_type": "generalist", "dependencies": [1]},
            {"id": 3, "description": "tag build", "agent_type": "coder", "dependencies": [1],
             "fallback": "tag manually", "success_criteria": "tag exists", "risk_level": "high"}
        ],
        "parallel_groups": [[1], [2, 3]],
        "total_estimated_time": "2h",
        "critical_path": [1, 3]
    }"#;

    // === Draft Parsing Tests ===

    #[test]
    fn test_parse_draft() {
        let draft = PlanDraft::parse(DRAFT).unwrap();
        assert_eq!(draft.steps.len(), 3);
        assert_eq!(draft.steps[1].agent_type, AgentRole::Generic);
        assert_eq!(draft.steps[2].risk_level, RiskLevel::High);
        assert_eq!(draft.steps[2].fallback.as_deref(), Some("tag manually"));
        assert_eq!(draft.parallel_groups, Some(vec![vec![StepId(1)], vec![StepId(2), StepId(3)]]));
    }

    #[test]
    fn test_parse_fenced_draft() {
        let fenced = format!("```json\n{}\n```", DRAFT);
        assert!(PlanDraft::parse(&fenced).is_ok());
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = PlanDraft::parse("Here is my plan: do the thing").unwrap_err();
        assert!(matches!(err, DraftError::Malformed(_)));
    }

    #[test]
    fn test_parse_rejects_empty_steps() {
        let err = PlanDraft::parse(r#"{"steps": []}"#).unwrap_err();
        assert!(matches!(err, DraftError::Empty));
    }

    #[test]
    fn test_parse_rejects_duplicate_ids() {
        let raw = r#"{"steps": [{"id": 1, "description": "a"}, {"id": 1, "description": "b"}]}"#;
        let err = PlanDraft::parse(raw).unwrap_err();
        assert!(matches!(err, DraftError::DuplicateStep(StepId(1))));
    }

    // === Plan Construction Tests ===

    #[test]
    fn test_from_draft_keeps_authored_groups() {
        let plan = Plan::from_draft("ship release", PlanDraft::parse(DRAFT).unwrap());
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.parallel_groups.len(), 2);
        assert_eq!(plan.total_estimated_time.as_deref(), Some("2h"));
        assert!(plan.dependency_conflicts().is_empty());
    }

    #[test]
    fn test_from_draft_derives_missing_groups() {
        let raw = r#"{"steps": [
            {"id": 1, "description": "a"},
            {"id": 2, "description": "b", "dependencies": [1]},
            {"id": 3, "description": "c"},
            {"id": 4, "description": "d", "dependencies": [2, 3]}
        ]}"#;
        let plan = Plan::from_draft("goal", PlanDraft::parse(raw).unwrap());
        assert_eq!(
            plan.parallel_groups,
            vec![vec![StepId(1), StepId(3)], vec![StepId(2)], vec![StepId(4)]]
        );
    }

    #[test]
    fn test_fallback_plan() {
        let plan = Plan::fallback("plan a trip");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].description, "plan a trip");
        assert_eq!(plan.steps[0].agent_type, AgentRole::Generic);
        assert_eq!(plan.parallel_groups, vec![vec![StepId(1)]]);
    }

    #[test]
    fn test_adapt_resets_execution_state() {
        let mut plan = Plan::fallback("goal");
        let id = plan.id;
        plan.status = PlanStatus::Completed;
        plan.results = Some(vec![StepOutcome::success(StepId(1), Value::Null)]);

        plan.adapt(PlanDraft::parse(DRAFT).unwrap(), "too slow");

        assert_eq!(plan.id, id);
        assert_eq!(plan.status, PlanStatus::Pending);
        assert!(plan.results.is_none());
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.adaptation_reason.as_deref(), Some("too slow"));
        assert!(plan.adapted_at.is_some());
    }

    // === Consistency Tests ===

    #[test]
    fn test_dependency_conflicts_detected() {
        let raw = r#"{
            "steps": [
                {"id": 1, "description": "a"},
                {"id": 2, "description": "b", "dependencies": [1]}
            ],
            "parallel_groups": [[1, 2]]
        }"#;
        let plan = Plan::from_draft("goal", PlanDraft::parse(raw).unwrap());
        assert_eq!(
            plan.dependency_conflicts(),
            vec![DependencyConflict { step: StepId(2), dependency: StepId(1) }]
        );
    }

    #[test]
    fn test_dangling_group_refs() {
        let raw = r#"{"steps": [{"id": 1, "description": "a"}], "parallel_groups": [[1, 9]]}"#;
        let plan = Plan::from_draft("goal", PlanDraft::parse(raw).unwrap());
        assert_eq!(plan.dangling_group_refs(), vec![StepId(9)]);
    }

    // === Layering Tests ===

    #[test]
    fn test_layering_ignores_unknown_dependencies() {
        let steps = vec![Step::new(1, "a", AgentRole::Generic).depends_on([42])];
        assert_eq!(layer_dependencies(&steps), vec![vec![StepId(1)]]);
    }

    #[test]
    fn test_layering_cycle_goes_last() {
        let steps = vec![
            Step::new(1, "a", AgentRole::Generic),
            Step::new(2, "b", AgentRole::Generic).depends_on([3]),
            Step::new(3, "c", AgentRole::Generic).depends_on([2]),
        ];
        assert_eq!(
            layer_dependencies(&steps),
            vec![vec![StepId(1)], vec![StepId(2), StepId(3)]]
        );
    }

    #[test]
    fn test_outcome_serialization_skips_empty_fields() {
        let json = serde_json::to_value(StepOutcome::failed(StepId(2), "boom")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(json.get("result").is_none());
    }
}
