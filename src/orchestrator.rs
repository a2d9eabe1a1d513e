//! Plan executor - turns goals into plans and runs them group by group

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentFactory, TaskContext};
use crate::audit::{AuditEventType, AuditLog};
use crate::channel::StreamManager;
use crate::config::{ConclaveConfig, ExecutorConfig};
use crate::criteria::{KeywordCriterion, SuccessCriterion};
use crate::error::{ConclaveError, Result};
use crate::ids::{AgentId, PlanId};
use crate::plan::{Plan, PlanDraft, PlanStatus, Step, StepOutcome};
use crate::planner::PlanGenerator;
use crate::policy::{PolicyDecision, PolicyGate, PolicyRequest};
use crate::pool::AgentPool;

const ACTOR: &str = "orchestrator";

/// The plan executor
///
/// Holds every plan it has created, dispatches steps to pooled agents and
/// writes each state change to the audit log. Groups run strictly in order;
/// steps inside a group run concurrently and fail independently.
pub struct PlanExecutor {
    plans: RwLock<HashMap<PlanId, Plan>>,
    generator: Arc<dyn PlanGenerator>,
    pool: Arc<AgentPool>,
    audit: Arc<AuditLog>,
    streams: StreamManager,
    criterion: Arc<dyn SuccessCriterion>,
    gate: Option<Arc<dyn PolicyGate>>,
    config: ExecutorConfig,
    /// Tokens for plans currently executing
    cancellations: Mutex<HashMap<PlanId, CancellationToken>>,
}

impl PlanExecutor {
    /// Create an executor with default configuration
    pub fn new(generator: Arc<dyn PlanGenerator>, factory: Arc<dyn AgentFactory>) -> Self {
        Self::build(generator, factory, &ConclaveConfig::default())
    }

    /// Create an executor with its own audit log, pool and stream manager.
    ///
    /// The configuration is validated first.
    pub fn from_config(
        generator: Arc<dyn PlanGenerator>,
        factory: Arc<dyn AgentFactory>,
        config: &ConclaveConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(generator, factory, config))
    }

    fn build(
        generator: Arc<dyn PlanGenerator>,
        factory: Arc<dyn AgentFactory>,
        config: &ConclaveConfig,
    ) -> Self {
        let audit = Arc::new(AuditLog::new());
        let pool = Arc::new(AgentPool::new(factory, &config.hierarchy, Arc::clone(&audit)));

        Self::from_parts(generator, pool, audit)
            .with_streams(StreamManager::new(config.streams.clone()))
            .with_config(config.executor.clone())
    }

    /// Assemble an executor around an existing pool and audit log
    pub fn from_parts(
        generator: Arc<dyn PlanGenerator>,
        pool: Arc<AgentPool>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            generator,
            pool,
            audit,
            streams: StreamManager::default(),
            criterion: Arc::new(KeywordCriterion::default()),
            gate: None,
            config: ExecutorConfig::default(),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    /// Use a shared stream manager for progress events
    pub fn with_streams(mut self, streams: StreamManager) -> Self {
        self.streams = streams;
        self
    }

    /// Replace the executor settings. Resets the success criterion to a
    /// keyword check for `success_keyword`.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.criterion = Arc::new(KeywordCriterion::new(config.success_keyword.clone()));
        self.config = config;
        self
    }

    /// Replace the check applied to results of steps with success criteria
    pub fn with_success_criterion(mut self, criterion: Arc<dyn SuccessCriterion>) -> Self {
        self.criterion = criterion;
        self
    }

    /// Consult `gate` before every dispatch
    pub fn with_policy_gate(mut self, gate: Arc<dyn PolicyGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The audit log every action is written to
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The agent pool steps are dispatched to
    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    /// The stream manager used by streaming execution
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Snapshot of a plan by id
    pub fn get_plan(&self, plan_id: &PlanId) -> Option<Plan> {
        self.plans.read().get(plan_id).cloned()
    }

    /// All plans, oldest first
    pub fn list_plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.plans.read().values().cloned().collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Draft a plan for `goal`.
    ///
    /// Never fails: if the generator errors or its output cannot be parsed,
    /// the plan degrades to a single generic step carrying the goal itself.
    #[instrument(skip(self, context))]
    pub async fn create_plan(&self, goal: &str, context: &Value) -> Plan {
        let (plan, source) = match self.generator.generate_plan(goal, context).await {
            Ok(raw) => match PlanDraft::parse(&raw) {
                Ok(draft) => (Plan::from_draft(goal, draft), "generated"),
                Err(e) => {
                    warn!(error = %e, "Unusable plan draft, falling back to single step");
                    (Plan::fallback(goal), "fallback")
                }
            },
            Err(e) => {
                warn!(error = %e, "Plan generation failed, falling back to single step");
                (Plan::fallback(goal), "fallback")
            }
        };

        let dangling = plan.dangling_group_refs();
        if !dangling.is_empty() {
            warn!(plan_id = %plan.id, steps = ?dangling, "Parallel groups reference unknown steps");
        }

        self.audit.append(
            AuditEventType::AgentAction,
            ACTOR,
            plan.id.to_string(),
            "create_plan",
            json!({
                "goal": goal,
                "steps": plan.steps.len(),
                "groups": plan.parallel_groups.len(),
                "source": source,
            }),
        );

        info!(plan_id = %plan.id, steps = plan.steps.len(), source, "Plan created");
        self.plans.write().insert(plan.id, plan.clone());
        plan
    }

    /// Run every group of a pending plan in order and return the finished plan
    #[instrument(skip(self))]
    pub async fn execute_plan(&self, plan_id: PlanId) -> Result<Plan> {
        self.run_plan(plan_id, None).await
    }

    /// Same as [`execute_plan`](Self::execute_plan), pushing progress events
    /// to `stream_id`.
    ///
    /// The stream is opened if needed and closed after the final `complete`
    /// event. Under the blocking backpressure policy a full stream stalls
    /// execution until a consumer drains it.
    ///
    /// If the plan cannot run, an `error` event is sent and the stream is
    /// closed so attached consumers always see a terminal frame.
    #[instrument(skip(self))]
    pub async fn execute_plan_streaming(&self, plan_id: PlanId, stream_id: &str) -> Result<Plan> {
        let result = self.run_plan(plan_id, Some(stream_id)).await;
        if let Err(e) = &result {
            warn!(plan_id = %plan_id, stream_id, error = %e, "Streaming execution failed");
            self.emit(Some(stream_id), "error", json!({ "plan_id": plan_id, "error": e.to_string() }))
                .await;
            self.streams.close(stream_id);
        }
        result
    }

    async fn run_plan(&self, plan_id: PlanId, stream_id: Option<&str>) -> Result<Plan> {
        let (snapshot, token) = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or(ConclaveError::PlanNotFound(plan_id))?;
            if plan.status != PlanStatus::Pending {
                return Err(ConclaveError::InvalidPlanState {
                    plan_id,
                    status: plan.status,
                });
            }

            plan.status = PlanStatus::Executing;
            plan.started_at = Some(Utc::now());
            plan.results = Some(Vec::new());

            let token = CancellationToken::new();
            self.cancellations.lock().insert(plan_id, token.clone());
            (Arc::new(plan.clone()), token)
        };

        if let Some(stream_id) = stream_id {
            self.streams.open(stream_id);
        }

        self.audit.append(
            AuditEventType::AgentAction,
            ACTOR,
            plan_id.to_string(),
            "execute_plan",
            json!({ "groups": snapshot.parallel_groups.len(), "steps": snapshot.steps.len() }),
        );
        self.emit(
            stream_id,
            "plan_started",
            json!({ "plan_id": plan_id, "goal": snapshot.goal, "groups": snapshot.parallel_groups.len() }),
        )
        .await;
        info!(plan_id = %plan_id, groups = snapshot.parallel_groups.len(), "Executing plan");

        for (index, group) in snapshot.parallel_groups.iter().enumerate() {
            if token.is_cancelled() {
                info!(plan_id = %plan_id, group = index, "Plan cancelled, skipping remaining groups");
                break;
            }

            let steps: Vec<Step> = group
                .iter()
                .filter_map(|id| {
                    let step = snapshot.step(*id);
                    if step.is_none() {
                        debug!(plan_id = %plan_id, step_id = %id, "Skipping unknown step");
                    }
                    step.cloned()
                })
                .collect();

            self.emit(
                stream_id,
                "group_started",
                json!({ "group": index, "steps": steps.iter().map(|s| s.id).collect::<Vec<_>>() }),
            )
            .await;
            debug!(plan_id = %plan_id, group = index, steps = steps.len(), "Dispatching group");

            let deadline = self.config.group_timeout().map(|limit| Instant::now() + limit);
            let outcomes = join_all(
                steps
                    .into_iter()
                    .map(|step| self.run_step(step, Arc::clone(&snapshot), deadline, token.clone())),
            )
            .await;

            for outcome in &outcomes {
                let event_type = if outcome.is_success() {
                    "step_completed"
                } else {
                    "step_failed"
                };
                let data = serde_json::to_value(outcome).unwrap_or(Value::Null);
                self.emit(stream_id, event_type, data).await;
            }

            if let Some(plan) = self.plans.write().get_mut(&plan_id) {
                plan.results.get_or_insert_with(Vec::new).extend(outcomes);
            }
        }

        self.cancellations.lock().remove(&plan_id);
        let cancelled = token.is_cancelled();

        let finished = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or(ConclaveError::PlanNotFound(plan_id))?;
            plan.status = if cancelled {
                PlanStatus::Cancelled
            } else {
                PlanStatus::Completed
            };
            plan.completed_at = Some(Utc::now());
            plan.clone()
        };

        let results = finished.results.as_deref().unwrap_or_default();
        let failed = results.iter().filter(|o| !o.is_success()).count();
        self.audit.append(
            AuditEventType::AgentAction,
            ACTOR,
            plan_id.to_string(),
            "complete_plan",
            json!({ "status": finished.status, "steps": results.len(), "failed": failed }),
        );

        if let Some(stream_id) = stream_id {
            let snapshot = serde_json::to_value(&finished).unwrap_or(Value::Null);
            self.emit(Some(stream_id), "complete", snapshot).await;
            self.streams.close(stream_id);
        }

        info!(
            plan_id = %plan_id,
            status = ?finished.status,
            steps = results.len(),
            failed,
            "Plan finished"
        );
        Ok(finished)
    }

    /// One step under the group deadline and the plan's cancellation token.
    /// Panics, timeouts and cancellation all become failed outcomes.
    async fn run_step(
        &self,
        step: Step,
        plan: Arc<Plan>,
        deadline: Option<Instant>,
        token: CancellationToken,
    ) -> StepOutcome {
        let step_id = step.id;
        let resource = step_resource(&plan, &step);
        let dispatch = AssertUnwindSafe(self.dispatch_step(step, plan)).catch_unwind();

        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, dispatch).await.ok(),
                None => Some(dispatch.await),
            }
        };

        let interrupted = tokio::select! {
            _ = token.cancelled() => "cancelled".to_string(),
            finished = bounded => match finished {
                Some(Ok(outcome)) => return outcome,
                Some(Err(panic)) => format!("agent panicked: {}", panic_message(panic.as_ref())),
                None => "timed out".to_string(),
            },
        };

        warn!(step_id = %step_id, reason = %interrupted, "Step interrupted");
        self.audit.append_with(
            AuditEventType::AgentAction,
            ACTOR,
            resource,
            "execute",
            json!({ "error": interrupted }),
            "failed",
            Map::new(),
        );
        StepOutcome::failed(step_id, interrupted)
    }

    /// Run one step on the agent serving its role.
    ///
    /// Never returns an error: gate denials, spawn failures and agent errors
    /// all come back as a failed outcome. When the result misses the step's
    /// success criteria and a fallback is declared, the fallback runs once and
    /// its result is final.
    #[instrument(skip(self, step, plan), fields(plan_id = %plan.id, step_id = %step.id))]
    pub async fn dispatch_step(&self, step: Step, plan: Arc<Plan>) -> StepOutcome {
        let step_id = step.id;
        let resource = step_resource(&plan, &step);

        if let PolicyDecision::Denied(reason) = self.check_policy(&step, &plan, &resource) {
            warn!(reason = %reason, "Step blocked by policy");
            self.audit.append_with(
                AuditEventType::PolicyViolation,
                ACTOR,
                resource,
                "dispatch",
                json!({ "agent_type": step.agent_type, "reason": reason }),
                "blocked",
                Map::new(),
            );
            return StepOutcome::failed(step_id, reason);
        }

        let handle = match self.pool.resolve(step.agent_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "No agent available for step");
                self.audit.append_with(
                    AuditEventType::AgentAction,
                    ACTOR,
                    resource,
                    "dispatch",
                    json!({ "agent_type": step.agent_type, "error": e.to_string() }),
                    "failed",
                    Map::new(),
                );
                return StepOutcome::failed(step_id, e.to_string());
            }
        };
        let agent_id = handle.id();

        self.audit.append(
            AuditEventType::AgentAction,
            agent_id.to_string(),
            resource.clone(),
            "dispatch",
            json!({ "agent_type": step.agent_type, "description": step.description }),
        );

        let mut context = TaskContext {
            plan,
            step: step.clone(),
            fallback: false,
        };

        let result = match handle.execute(&step.description, &context).await {
            Ok(result) => result,
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Step failed");
                self.audit_step_error(&agent_id.to_string(), &resource, &e);
                return StepOutcome::failed(step_id, e.to_string()).with_agent(agent_id);
            }
        };

        let Some(criteria) = step.success_criteria.as_deref() else {
            return self.record_success(StepOutcome::success(step_id, result), agent_id, &resource);
        };
        if self.criterion.satisfied(criteria, &result) {
            return self.record_success(StepOutcome::success(step_id, result), agent_id, &resource);
        }

        self.audit.append_with(
            AuditEventType::AgentAction,
            agent_id.to_string(),
            resource.clone(),
            "check_criteria",
            json!({ "criteria": criteria, "fallback": step.fallback.is_some() }),
            "criteria_failed",
            Map::new(),
        );

        let Some(fallback) = step.fallback.as_deref() else {
            debug!("Success criteria unmet, no fallback declared");
            return self.record_success(StepOutcome::success(step_id, result), agent_id, &resource);
        };

        info!(agent_id = %agent_id, "Success criteria unmet, running fallback");
        self.audit.append(
            AuditEventType::AgentAction,
            agent_id.to_string(),
            resource.clone(),
            "fallback",
            json!({ "task": fallback }),
        );
        context.fallback = true;

        match handle.execute(fallback, &context).await {
            Ok(result) => {
                let mut outcome = StepOutcome::success(step_id, result);
                outcome.used_fallback = true;
                self.record_success(outcome, agent_id, &resource)
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Fallback failed");
                self.audit_step_error(&agent_id.to_string(), &resource, &e);
                let mut outcome = StepOutcome::failed(step_id, e.to_string());
                outcome.used_fallback = true;
                outcome.with_agent(agent_id)
            }
        }
    }

    fn record_success(&self, outcome: StepOutcome, agent_id: AgentId, resource: &str) -> StepOutcome {
        self.audit.append(
            AuditEventType::AgentAction,
            agent_id.to_string(),
            resource,
            "execute",
            json!({ "used_fallback": outcome.used_fallback }),
        );
        debug!(agent_id = %agent_id, used_fallback = outcome.used_fallback, "Step succeeded");
        outcome.with_agent(agent_id)
    }

    fn check_policy(&self, step: &Step, plan: &Plan, resource: &str) -> PolicyDecision {
        let Some(gate) = self.gate.as_ref().filter(|_| self.config.policy_gating) else {
            return PolicyDecision::Allowed;
        };
        let context = json!({ "plan_id": plan.id, "goal": plan.goal, "risk_level": step.risk_level });
        gate.check(&PolicyRequest {
            actor: step.agent_type.as_str(),
            action: "dispatch",
            resource,
            content: &step.description,
            context: &context,
        })
    }

    fn audit_step_error(&self, actor: &str, resource: &str, error: &anyhow::Error) {
        self.audit.append_with(
            AuditEventType::AgentAction,
            actor,
            resource,
            "execute",
            json!({ "error": error.to_string() }),
            "error",
            Map::new(),
        );
    }

    /// Replace a plan's steps from feedback, keeping its id.
    ///
    /// Unusable generator output is an [`ConclaveError::AdaptationFailed`];
    /// the existing plan is left untouched in that case.
    #[instrument(skip(self, feedback))]
    pub async fn adapt_plan(&self, plan_id: PlanId, feedback: &str) -> Result<Plan> {
        let original = self
            .get_plan(&plan_id)
            .ok_or(ConclaveError::PlanNotFound(plan_id))?;
        ensure_adaptable(&original)?;

        let draft = match self.generator.adapt_plan(&original, feedback).await {
            Ok(raw) => PlanDraft::parse(&raw).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let draft = match draft {
            Ok(draft) => draft,
            Err(reason) => {
                warn!(plan_id = %plan_id, reason = %reason, "Plan adaptation failed");
                self.audit.append_with(
                    AuditEventType::AgentAction,
                    ACTOR,
                    plan_id.to_string(),
                    "adapt_plan",
                    json!({ "feedback": feedback, "error": reason }),
                    "failed",
                    Map::new(),
                );
                return Err(ConclaveError::AdaptationFailed { plan_id, reason });
            }
        };

        let adapted = {
            let mut plans = self.plans.write();
            let plan = plans
                .get_mut(&plan_id)
                .ok_or(ConclaveError::PlanNotFound(plan_id))?;
            ensure_adaptable(plan)?;
            plan.adapt(draft, feedback);
            plan.clone()
        };

        self.audit.append(
            AuditEventType::AgentAction,
            ACTOR,
            plan_id.to_string(),
            "adapt_plan",
            json!({ "feedback": feedback, "steps": adapted.steps.len() }),
        );
        info!(plan_id = %plan_id, steps = adapted.steps.len(), "Plan adapted");
        Ok(adapted)
    }

    /// Cancel a pending or executing plan.
    ///
    /// An executing plan stops before its next group and its in-flight steps
    /// fail as cancelled. Returns false for unknown or finished plans.
    pub fn cancel_plan(&self, plan_id: &PlanId) -> bool {
        let mut plans = self.plans.write();
        let Some(plan) = plans.get_mut(plan_id) else {
            return false;
        };

        match plan.status {
            PlanStatus::Executing => match self.cancellations.lock().get(plan_id) {
                Some(token) => token.cancel(),
                None => return false,
            },
            PlanStatus::Pending => {
                plan.status = PlanStatus::Cancelled;
                plan.completed_at = Some(Utc::now());
            }
            PlanStatus::Completed | PlanStatus::Cancelled => return false,
        }
        let status = plan.status;
        drop(plans);

        self.audit.append(
            AuditEventType::AgentAction,
            ACTOR,
            plan_id.to_string(),
            "cancel_plan",
            json!({ "status": status }),
        );
        info!(plan_id = %plan_id, "Plan cancellation requested");
        true
    }

    async fn emit(&self, stream_id: Option<&str>, event_type: &str, data: Value) {
        if let Some(stream_id) = stream_id {
            self.streams.send(stream_id, event_type, data).await;
        }
    }
}

fn ensure_adaptable(plan: &Plan) -> Result<()> {
    if plan.status == PlanStatus::Executing {
        return Err(ConclaveError::InvalidPlanState {
            plan_id: plan.id,
            status: plan.status,
        });
    }
    Ok(())
}

fn step_resource(plan: &Plan, step: &Step) -> String {
    format!("{}/step/{}", plan.id, step.id)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
