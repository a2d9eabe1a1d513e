//! Agent pool - resolves roles to agent handles, spawning on miss

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::info;

use crate::agent::{Agent, AgentFactory, AgentHandle, AgentRole};
use crate::audit::{AuditEventType, AuditLog};
use crate::config::HierarchyConfig;
use crate::error::{ConclaveError, HierarchyError};
use crate::hierarchy::{AgentHierarchy, HierarchyStats};
use crate::ids::AgentId;

/// Registry of live agents keyed by id and by role.
///
/// The pool owns a root coordinator node at level 0; agents spawned on a
/// role miss become its children, subject to the hierarchy limits.
pub struct AgentPool {
    root_id: AgentId,
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    by_role: RwLock<HashMap<AgentRole, AgentId>>,
    hierarchy: Mutex<AgentHierarchy>,
    factory: Arc<dyn AgentFactory>,
    max_children: usize,
    audit: Arc<AuditLog>,
}

impl AgentPool {
    /// Create a pool with a fresh root coordinator at level 0
    pub fn new(
        factory: Arc<dyn AgentFactory>,
        config: &HierarchyConfig,
        audit: Arc<AuditLog>,
    ) -> Self {
        let root_id = AgentId::new();
        let mut hierarchy = AgentHierarchy::from_config(config);
        // Level 0 is always within max depth and the id is fresh
        let _ = hierarchy.register_agent(root_id, None, 0);

        Self {
            root_id,
            agents: RwLock::new(HashMap::new()),
            by_role: RwLock::new(HashMap::new()),
            hierarchy: Mutex::new(hierarchy),
            factory,
            max_children: config.max_children_per_parent,
            audit,
        }
    }

    /// Id of the coordinating root node
    pub fn root_id(&self) -> AgentId {
        self.root_id
    }

    /// Add a pre-built agent for a role as a direct child of the root.
    ///
    /// Fails with [`ConclaveError::RoleTaken`] if the role is already served,
    /// leaving the hierarchy untouched.
    pub fn register(
        &self,
        role: AgentRole,
        agent: Arc<dyn Agent>,
    ) -> Result<AgentHandle, ConclaveError> {
        let mut by_role = self.by_role.write();
        if by_role.contains_key(&role) {
            return Err(ConclaveError::RoleTaken(role));
        }
        let handle = self.spawn_with(self.root_id, role, agent)?;
        by_role.insert(role, handle.id());
        Ok(handle)
    }

    /// Look up the agent serving a role without spawning
    pub fn get(&self, role: AgentRole) -> Option<AgentHandle> {
        let id = *self.by_role.read().get(&role)?;
        self.agents.read().get(&id).cloned()
    }

    /// Look up an agent by id
    pub fn get_agent(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.read().get(id).cloned()
    }

    /// Return the agent for a role, spawning one under the root if none exists
    pub fn resolve(&self, role: AgentRole) -> Result<AgentHandle, ConclaveError> {
        // Held across the spawn so concurrent misses for one role spawn once
        let mut by_role = self.by_role.write();
        if let Some(handle) = by_role
            .get(&role)
            .and_then(|id| self.agents.read().get(id).cloned())
        {
            return Ok(handle);
        }

        let handle = self.spawn_with(self.root_id, role, self.factory.create(role))?;
        by_role.insert(role, handle.id());
        Ok(handle)
    }

    /// Spawn a fresh agent for `role` as a child of `parent`
    pub fn spawn_child(
        &self,
        parent: &AgentId,
        role: AgentRole,
    ) -> Result<AgentHandle, ConclaveError> {
        if *parent != self.root_id && !self.agents.read().contains_key(parent) {
            return Err(ConclaveError::AgentNotFound(*parent));
        }
        let agent = self.factory.create(role);
        self.spawn_with(*parent, role, agent)
    }

    fn spawn_with(
        &self,
        parent: AgentId,
        role: AgentRole,
        agent: Arc<dyn Agent>,
    ) -> Result<AgentHandle, ConclaveError> {
        let agent_id = AgentId::new();

        let spawned = self
            .hierarchy
            .lock()
            .spawn_child(&parent, agent_id, self.max_children);
        let level = match spawned {
            Ok(level) => level,
            Err(e) => {
                self.audit_spawn_denied(parent, role, &e);
                return Err(e.into());
            }
        };

        // Slot is reserved in the hierarchy; now make the agent reachable
        let handle = AgentHandle::new(agent_id, role, Some(parent), agent);
        self.agents.write().insert(agent_id, handle.clone());

        self.audit.append(
            AuditEventType::AgentSpawn,
            "orchestrator",
            agent_id.to_string(),
            "spawn",
            json!({ "agent_type": role, "parent_id": parent, "level": level }),
        );

        info!(agent_id = %agent_id, role = %role, parent = %parent, level, "Spawned agent");
        Ok(handle)
    }

    fn audit_spawn_denied(&self, parent: AgentId, role: AgentRole, error: &HierarchyError) {
        self.audit.append_with(
            AuditEventType::AgentSpawn,
            "orchestrator",
            parent.to_string(),
            "spawn",
            json!({ "agent_type": role, "error": error.to_string() }),
            "denied",
            Default::default(),
        );
    }

    /// Ids of every spawned agent, excluding the root
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.read().keys().copied().collect()
    }

    /// Number of spawned agents, excluding the root
    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// An agent and all of its descendants, breadth first
    pub fn subtree(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.hierarchy.lock().subtree(agent_id)
    }

    /// Move an agent one level up
    pub fn promote(&self, agent_id: &AgentId) {
        self.hierarchy.lock().promote(agent_id);
    }

    /// Move an agent one level down
    pub fn demote(&self, agent_id: &AgentId) {
        self.hierarchy.lock().demote(agent_id);
    }

    /// Current level of an agent in the hierarchy
    pub fn level(&self, agent_id: &AgentId) -> Option<usize> {
        self.hierarchy.lock().level(agent_id)
    }

    /// Snapshot of the hierarchy shape
    pub fn hierarchy_stats(&self) -> HierarchyStats {
        self.hierarchy.lock().stats()
    }
}
