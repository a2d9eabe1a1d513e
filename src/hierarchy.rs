//! Agent hierarchy allocation
//!
//! Bookkeeping for dynamically spawned agents: who spawned whom and at which
//! level. Depth and fan-out limits are enforced here, and both registration
//! paths report violations through [`HierarchyError`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::HierarchyConfig;
use crate::error::HierarchyError;
use crate::ids::AgentId;

/// Node in the agent hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyNode {
    pub agent_id: AgentId,
    pub level: usize,
    pub parent_id: Option<AgentId>,
    pub child_ids: Vec<AgentId>,
}

/// Summary of the hierarchy shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyStats {
    pub total_agents: usize,
    pub max_level: usize,
    pub level_distribution: BTreeMap<usize, usize>,
    pub total_relationships: usize,
}

/// Tracks the parent/child tree of spawned agents.
///
/// Nodes are never removed; a node is inserted once with exactly one parent,
/// so the tree stays acyclic.
#[derive(Debug)]
pub struct AgentHierarchy {
    nodes: HashMap<AgentId, HierarchyNode>,
    root: Option<AgentId>,
    max_depth: usize,
}

impl AgentHierarchy {
    /// Create an empty hierarchy with the given depth limit
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
            max_depth,
        }
    }

    /// Create an empty hierarchy using the configured depth limit
    pub fn from_config(config: &HierarchyConfig) -> Self {
        Self::new(config.max_depth)
    }

    /// Deepest level a node may occupy
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Record an agent at an explicit level.
    ///
    /// The first parentless agent becomes the root. With a parent, the level
    /// must be exactly one below the parent's.
    pub fn register_agent(
        &mut self,
        agent_id: AgentId,
        parent_id: Option<AgentId>,
        level: usize,
    ) -> Result<(), HierarchyError> {
        if level > self.max_depth {
            return Err(HierarchyError::DepthExceeded {
                level,
                max_depth: self.max_depth,
            });
        }
        if self.nodes.contains_key(&agent_id) {
            return Err(HierarchyError::AlreadyRegistered(agent_id));
        }

        if let Some(pid) = &parent_id {
            let parent = self
                .nodes
                .get_mut(pid)
                .ok_or(HierarchyError::UnknownAgent(*pid))?;
            let expected = parent.level + 1;
            if level != expected {
                return Err(HierarchyError::LevelMismatch {
                    expected,
                    actual: level,
                });
            }
            parent.child_ids.push(agent_id);
        } else if self.root.is_none() {
            // First parentless agent becomes the root
            self.root = Some(agent_id);
        }

        self.nodes.insert(
            agent_id,
            HierarchyNode {
                agent_id,
                level,
                parent_id,
                child_ids: Vec::new(),
            },
        );

        info!(agent_id = %agent_id, parent = ?parent_id, level, "Registered agent");
        Ok(())
    }

    /// Reserve a slot for a new child under `parent` and register it.
    ///
    /// Fails without changing anything if the child would be too deep or the
    /// parent already has `max_children` children.
    pub fn spawn_child(
        &mut self,
        parent: &AgentId,
        child: AgentId,
        max_children: usize,
    ) -> Result<usize, HierarchyError> {
        let node = self
            .nodes
            .get(parent)
            .ok_or(HierarchyError::UnknownAgent(*parent))?;

        // Check limits before touching anything
        let child_level = node.level + 1;
        if child_level > self.max_depth {
            warn!(parent = %parent, child_level, "Cannot spawn child: max depth reached");
            return Err(HierarchyError::DepthExceeded {
                level: child_level,
                max_depth: self.max_depth,
            });
        }
        if node.child_ids.len() >= max_children {
            warn!(parent = %parent, max_children, "Cannot spawn child: max children reached");
            return Err(HierarchyError::FanOutExceeded {
                parent: *parent,
                max_children,
            });
        }

        self.register_agent(child, Some(*parent), child_level)?;
        Ok(child_level)
    }

    /// Breadth-first listing of an agent and all its descendants
    pub fn subtree(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let mut subtree = Vec::new();
        if !self.nodes.contains_key(agent_id) {
            return subtree;
        }

        let mut queue = VecDeque::from([*agent_id]);
        while let Some(current) = queue.pop_front() {
            subtree.push(current);
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.child_ids.iter().copied());
            }
        }
        subtree
    }

    /// Move an agent one level up, stopping at 0. Unknown agents are ignored.
    pub fn promote(&mut self, agent_id: &AgentId) {
        if let Some(node) = self.nodes.get_mut(agent_id) {
            node.level = node.level.saturating_sub(1);
            debug!(agent_id = %agent_id, level = node.level, "Promoted agent");
        }
    }

    /// Move an agent one level down, stopping at max depth
    pub fn demote(&mut self, agent_id: &AgentId) {
        if let Some(node) = self.nodes.get_mut(agent_id) {
            node.level = (node.level + 1).min(self.max_depth);
            debug!(agent_id = %agent_id, level = node.level, "Demoted agent");
        }
    }

    /// The first parentless agent registered, if any
    pub fn root(&self) -> Option<AgentId> {
        self.root
    }

    /// Get a node by agent id
    pub fn node(&self, agent_id: &AgentId) -> Option<&HierarchyNode> {
        self.nodes.get(agent_id)
    }

    /// Parent of an agent; `None` for roots and unknown agents
    pub fn parent(&self, agent_id: &AgentId) -> Option<AgentId> {
        self.nodes.get(agent_id).and_then(|n| n.parent_id)
    }

    /// Direct children of an agent, in spawn order
    pub fn children(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.nodes
            .get(agent_id)
            .map(|n| n.child_ids.clone())
            .unwrap_or_default()
    }

    /// Current level of an agent
    pub fn level(&self, agent_id: &AgentId) -> Option<usize> {
        self.nodes.get(agent_id).map(|n| n.level)
    }

    /// All agents currently at `level`
    pub fn agents_at_level(&self, level: usize) -> Vec<AgentId> {
        self.nodes
            .values()
            .filter(|n| n.level == level)
            .map(|n| n.agent_id)
            .collect()
    }

    /// Count agents per level and parent/child links
    pub fn stats(&self) -> HierarchyStats {
        let mut level_distribution = BTreeMap::new();
        for node in self.nodes.values() {
            *level_distribution.entry(node.level).or_insert(0) += 1;
        }

        HierarchyStats {
            total_agents: self.nodes.len(),
            max_level: level_distribution.keys().next_back().copied().unwrap_or(0),
            level_distribution,
            total_relationships: self.nodes.values().map(|n| n.child_ids.len()).sum(),
        }
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if no agent has been registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for AgentHierarchy {
    fn default() -> Self {
        Self::from_config(&HierarchyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_root() -> (AgentHierarchy, AgentId) {
        let mut hierarchy = AgentHierarchy::default();
        let root = AgentId::new();
        hierarchy.register_agent(root, None, 0).unwrap();
        (hierarchy, root)
    }

    // === Creation Tests ===

    #[test]
    fn test_hierarchy_creation() {
        let hierarchy = AgentHierarchy::default();
        assert!(hierarchy.is_empty());
        assert!(hierarchy.root().is_none());
        assert_eq!(hierarchy.max_depth(), 10);
    }

    // === Registration Tests ===

    #[test]
    fn test_register_root() {
        let (hierarchy, root) = with_root();
        assert_eq!(hierarchy.len(), 1);
        assert_eq!(hierarchy.root(), Some(root));
        assert_eq!(hierarchy.level(&root), Some(0));
    }

    #[test]
    fn test_register_child_links_parent() {
        let (mut hierarchy, root) = with_root();
        let child = AgentId::new();

        hierarchy.register_agent(child, Some(root), 1).unwrap();

        assert_eq!(hierarchy.children(&root), vec![child]);
        assert_eq!(hierarchy.parent(&child), Some(root));
    }

    #[test]
    fn test_register_beyond_max_depth_rejected() {
        let mut hierarchy = AgentHierarchy::new(3);
        let agent = AgentId::new();

        let err = hierarchy.register_agent(agent, None, 4).unwrap_err();

        assert_eq!(err, HierarchyError::DepthExceeded { level: 4, max_depth: 3 });
        assert!(hierarchy.is_empty());
    }

    #[test]
    fn test_register_child_beyond_max_depth_rejected() {
        let (mut hierarchy, root) = with_root();
        let child = AgentId::new();

        let err = hierarchy.register_agent(child, Some(root), 11).unwrap_err();

        assert!(matches!(err, HierarchyError::DepthExceeded { .. }));
        assert!(hierarchy.children(&root).is_empty());
    }

    #[test]
    fn test_register_level_mismatch() {
        let (mut hierarchy, root) = with_root();

        let err = hierarchy.register_agent(AgentId::new(), Some(root), 3).unwrap_err();
        assert_eq!(err, HierarchyError::LevelMismatch { expected: 1, actual: 3 });
    }

    #[test]
    fn test_register_unknown_parent() {
        let mut hierarchy = AgentHierarchy::default();
        let ghost = AgentId::new();

        let err = hierarchy.register_agent(AgentId::new(), Some(ghost), 1).unwrap_err();
        assert_eq!(err, HierarchyError::UnknownAgent(ghost));
    }

    #[test]
    fn test_register_twice_rejected() {
        let (mut hierarchy, root) = with_root();
        let err = hierarchy.register_agent(root, None, 0).unwrap_err();
        assert_eq!(err, HierarchyError::AlreadyRegistered(root));
    }

    // === Spawn Tests ===

    #[test]
    fn test_spawn_child() {
        let (mut hierarchy, root) = with_root();
        let child = AgentId::new();

        let level = hierarchy.spawn_child(&root, child, 5).unwrap();

        assert_eq!(level, 1);
        assert_eq!(hierarchy.level(&child), Some(1));
        assert_eq!(hierarchy.children(&root).len(), 1);
    }

    #[test]
    fn test_spawn_child_fan_out_limit() {
        let (mut hierarchy, root) = with_root();
        for _ in 0..2 {
            hierarchy.spawn_child(&root, AgentId::new(), 2).unwrap();
        }

        let err = hierarchy.spawn_child(&root, AgentId::new(), 2).unwrap_err();

        assert!(matches!(err, HierarchyError::FanOutExceeded { max_children: 2, .. }));
        assert_eq!(hierarchy.children(&root).len(), 2);
        assert_eq!(hierarchy.len(), 3);
    }

    #[test]
    fn test_spawn_child_depth_limit() {
        let mut hierarchy = AgentHierarchy::new(1);
        let root = AgentId::new();
        let child = AgentId::new();
        hierarchy.register_agent(root, None, 0).unwrap();
        hierarchy.spawn_child(&root, child, 5).unwrap();

        let err = hierarchy.spawn_child(&child, AgentId::new(), 5).unwrap_err();

        assert_eq!(err, HierarchyError::DepthExceeded { level: 2, max_depth: 1 });
        assert!(hierarchy.children(&child).is_empty());
    }

    #[test]
    fn test_spawn_child_unknown_parent() {
        let mut hierarchy = AgentHierarchy::default();
        let ghost = AgentId::new();
        let err = hierarchy.spawn_child(&ghost, AgentId::new(), 5).unwrap_err();
        assert_eq!(err, HierarchyError::UnknownAgent(ghost));
    }

    // === Subtree Tests ===

    #[test]
    fn test_subtree_breadth_first() {
        let (mut hierarchy, root) = with_root();
        let lead1 = AgentId::new();
        let lead2 = AgentId::new();
        let worker = AgentId::new();

        hierarchy.spawn_child(&root, lead1, 5).unwrap();
        hierarchy.spawn_child(&root, lead2, 5).unwrap();
        hierarchy.spawn_child(&lead1, worker, 5).unwrap();

        assert_eq!(hierarchy.subtree(&root), vec![root, lead1, lead2, worker]);
        assert_eq!(hierarchy.subtree(&lead1), vec![lead1, worker]);
        assert_eq!(hierarchy.subtree(&worker), vec![worker]);
    }

    #[test]
    fn test_subtree_unknown() {
        let hierarchy = AgentHierarchy::default();
        assert!(hierarchy.subtree(&AgentId::new()).is_empty());
    }

    // === Promotion Tests ===

    #[test]
    fn test_promote_clamps_at_zero() {
        let (mut hierarchy, root) = with_root();
        hierarchy.promote(&root);
        assert_eq!(hierarchy.level(&root), Some(0));
    }

    #[test]
    fn test_demote_clamps_at_max_depth() {
        let mut hierarchy = AgentHierarchy::new(1);
        let agent = AgentId::new();
        hierarchy.register_agent(agent, None, 1).unwrap();

        hierarchy.demote(&agent);
        assert_eq!(hierarchy.level(&agent), Some(1));

        hierarchy.promote(&agent);
        assert_eq!(hierarchy.level(&agent), Some(0));
    }

    #[test]
    fn test_promote_unknown_is_noop() {
        let mut hierarchy = AgentHierarchy::default();
        hierarchy.promote(&AgentId::new());
        hierarchy.demote(&AgentId::new());
        assert!(hierarchy.is_empty());
    }

    // === Stats Tests ===

    #[test]
    fn test_stats() {
        let (mut hierarchy, root) = with_root();
        let lead = AgentId::new();
        hierarchy.spawn_child(&root, lead, 5).unwrap();
        hierarchy.spawn_child(&lead, AgentId::new(), 5).unwrap();
        hierarchy.spawn_child(&lead, AgentId::new(), 5).unwrap();

        let stats = hierarchy.stats();
        assert_eq!(stats.total_agents, 4);
        assert_eq!(stats.max_level, 2);
        assert_eq!(stats.level_distribution.get(&2), Some(&2));
        assert_eq!(stats.total_relationships, 3);
        assert_eq!(hierarchy.agents_at_level(1), vec![lead]);
    }
}
