//! Capability graph: tools as vertices, capabilities as hyperedges.
//!
//! A capability is a reusable tool sequence; a meta-capability composes other
//! capabilities and exposes the union of their descendants' tool sets. The
//! registry here is the single in-process owner of both tables; the store
//! mirrors them durably.

pub mod hypergraph;

use crate::error::{PmlError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

pub const CAPABILITY_PREFIX: &str = "cap__";
pub const MAX_HIERARCHY_DEPTH: usize = 8;

/// A registered tool (graph vertex). Immutable once registered except for
/// the derived fields (`community`, `pagerank`) the hypergraph refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    /// Stable id of the form `provider:name` (split on the first colon).
    pub id: String,
    pub provider: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub community: Option<usize>,
    pub pagerank: f64,
}

impl ToolRecord {
    /// Split a tool id on the first colon. Tool names may themselves contain
    /// colons; provider names may not.
    pub fn split_id(id: &str) -> Result<(&str, &str)> {
        id.split_once(':')
            .filter(|(provider, name)| !provider.is_empty() && !name.is_empty())
            .ok_or_else(|| {
                PmlError::invalid(format!("tool id '{id}' is not of the form provider:name"))
            })
    }
}

/// A capability (hyperedge). Leaves hold member tool ids; meta-capabilities
/// hold child capability ids instead and aggregate their tool sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Stable id, prefixed `cap__`.
    pub id: String,
    pub description: String,
    /// Member tool ids (leaves only; empty for meta-capabilities).
    pub members: Vec<String>,
    /// Child capability ids (meta-capabilities only; empty for leaves).
    pub children: Vec<String>,
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub successes: u32,
    pub attempts: u32,
}

impl Capability {
    pub fn leaf(id: impl Into<String>, description: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            members,
            children: Vec::new(),
            parents: Vec::new(),
            embedding: Vec::new(),
            successes: 0,
            attempts: 0,
        }
    }

    pub fn meta(id: impl Into<String>, description: impl Into<String>, children: Vec<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            members: Vec::new(),
            children,
            parents: Vec::new(),
            embedding: Vec::new(),
            successes: 0,
            attempts: 0,
        }
    }

    pub fn is_meta(&self) -> bool {
        !self.children.is_empty()
    }

    /// Smoothed success ratio with a Laplace prior, so fresh capabilities
    /// start at 0.5 instead of an extreme.
    pub fn success_rate(&self) -> f64 {
        f64::from(self.successes + 1) / f64::from(self.attempts + 2)
    }
}

/// One recorded selection outcome, the SHGAT training signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicTrace {
    pub ts: DateTime<Utc>,
    pub intent: String,
    /// Tool ids that were in context when the selection was made.
    pub context_tools: Vec<String>,
    pub capability_id: String,
    pub outcome: bool,
}

/// In-process registry of tools and capabilities. Owned by the runtime; all
/// mutation goes through it so the hierarchy invariants hold at every point.
#[derive(Default)]
pub struct CapabilityGraph {
    tools: DashMap<String, ToolRecord>,
    capabilities: DashMap<String, Capability>,
}

impl CapabilityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&self, tool: ToolRecord) -> Result<()> {
        ToolRecord::split_id(&tool.id)?;
        self.tools.insert(tool.id.clone(), tool);
        Ok(())
    }

    /// Register or replace a capability. Validates the `cap__` prefix,
    /// non-empty membership, that every referenced id exists, and that the
    /// hierarchy stays an acyclic DAG of depth ≤ [`MAX_HIERARCHY_DEPTH`].
    pub fn register_capability(&self, mut capability: Capability) -> Result<()> {
        if !capability.id.starts_with(CAPABILITY_PREFIX) {
            return Err(PmlError::invalid(format!(
                "capability id '{}' must start with '{CAPABILITY_PREFIX}'",
                capability.id
            )));
        }
        if capability.members.is_empty() && capability.children.is_empty() {
            return Err(PmlError::invalid(format!(
                "capability '{}' has no member tools",
                capability.id
            )));
        }
        if !capability.members.is_empty() && !capability.children.is_empty() {
            return Err(PmlError::invalid(format!(
                "capability '{}' mixes member tools and child capabilities",
                capability.id
            )));
        }
        for member in &capability.members {
            if !self.tools.contains_key(member) {
                return Err(PmlError::not_found("tool", member.clone()));
            }
        }
        for child in &capability.children {
            if !self.capabilities.contains_key(child) {
                return Err(PmlError::not_found("capability", child.clone()));
            }
        }

        capability.parents = self
            .capabilities
            .get(&capability.id)
            .map(|existing| existing.parents.clone())
            .unwrap_or_default();

        // Insert tentatively, then verify the DAG; roll back on violation.
        let previous = self
            .capabilities
            .insert(capability.id.clone(), capability.clone());
        if let Err(err) = self.check_hierarchy(&capability.id) {
            match previous {
                Some(old) => {
                    self.capabilities.insert(capability.id.clone(), old);
                }
                None => {
                    self.capabilities.remove(&capability.id);
                }
            }
            return Err(err);
        }

        for child in &capability.children {
            if let Some(mut entry) = self.capabilities.get_mut(child) {
                if !entry.parents.contains(&capability.id) {
                    entry.parents.push(capability.id.clone());
                }
            }
        }
        Ok(())
    }

    /// Remove a capability and unlink it from its children's parent lists.
    pub fn remove_capability(&self, id: &str) -> Result<Capability> {
        let (_, capability) = self
            .capabilities
            .remove(id)
            .ok_or_else(|| PmlError::not_found("capability", id))?;
        for child in &capability.children {
            if let Some(mut entry) = self.capabilities.get_mut(child) {
                entry.parents.retain(|p| p != id);
            }
        }
        for parent in &capability.parents {
            if let Some(mut entry) = self.capabilities.get_mut(parent) {
                entry.children.retain(|c| c != id);
            }
        }
        Ok(capability)
    }

    /// The union closure of descendant leaves' tool sets. For a leaf this is
    /// its member set; each tool appears once regardless of how many
    /// descendants contain it.
    pub fn aggregated_tools(&self, id: &str) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut visited = HashSet::new();
        self.collect_tools(id, &mut out, &mut visited)?;
        Ok(out)
    }

    fn collect_tools(
        &self,
        id: &str,
        out: &mut BTreeSet<String>,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        if !visited.insert(id.to_string()) {
            return Ok(());
        }
        let capability = self
            .capabilities
            .get(id)
            .ok_or_else(|| PmlError::not_found("capability", id))?;
        out.extend(capability.members.iter().cloned());
        let children = capability.children.clone();
        drop(capability);
        for child in children {
            self.collect_tools(&child, out, visited)?;
        }
        Ok(())
    }

    /// Depth-first cycle and depth check from `root` through `children`.
    /// Depth is measured over the whole chain: ancestors above `root` plus
    /// the subtree below it.
    fn check_hierarchy(&self, root: &str) -> Result<()> {
        let mut path = HashSet::new();
        self.dfs(root, 1 + self.ancestor_height(root, 0), &mut path)
    }

    fn ancestor_height(&self, id: &str, depth: usize) -> usize {
        if depth > MAX_HIERARCHY_DEPTH {
            return depth;
        }
        let parents = self
            .capabilities
            .get(id)
            .map(|c| c.parents.clone())
            .unwrap_or_default();
        parents
            .iter()
            .map(|p| 1 + self.ancestor_height(p, depth + 1))
            .max()
            .unwrap_or(0)
    }

    fn dfs(&self, id: &str, depth: usize, path: &mut HashSet<String>) -> Result<()> {
        if depth > MAX_HIERARCHY_DEPTH {
            return Err(PmlError::invalid(format!(
                "capability hierarchy under '{id}' exceeds depth {MAX_HIERARCHY_DEPTH}"
            )));
        }
        if !path.insert(id.to_string()) {
            return Err(PmlError::invalid(format!(
                "capability hierarchy contains a cycle through '{id}'"
            )));
        }
        let children = self
            .capabilities
            .get(id)
            .map(|c| c.children.clone())
            .unwrap_or_default();
        for child in children {
            self.dfs(&child, depth + 1, path)?;
        }
        path.remove(id);
        Ok(())
    }

    pub fn tool(&self, id: &str) -> Option<ToolRecord> {
        self.tools.get(id).map(|t| t.value().clone())
    }

    pub fn capability(&self, id: &str) -> Option<Capability> {
        self.capabilities.get(id).map(|c| c.value().clone())
    }

    pub fn contains_tool(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn contains_capability(&self, id: &str) -> bool {
        self.capabilities.contains_key(id)
    }

    /// Snapshot of all tools, sorted by id for deterministic iteration.
    pub fn tools_snapshot(&self) -> Vec<ToolRecord> {
        let mut tools: Vec<_> = self.tools.iter().map(|t| t.value().clone()).collect();
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools
    }

    /// Snapshot of all capabilities, sorted by id.
    pub fn capabilities_snapshot(&self) -> Vec<Capability> {
        let mut caps: Vec<_> = self
            .capabilities
            .iter()
            .map(|c| c.value().clone())
            .collect();
        caps.sort_by(|a, b| a.id.cmp(&b.id));
        caps
    }

    pub fn record_attempt(&self, id: &str, success: bool) -> Result<()> {
        let mut capability = self
            .capabilities
            .get_mut(id)
            .ok_or_else(|| PmlError::not_found("capability", id))?;
        capability.attempts = capability.attempts.saturating_add(1);
        if success {
            capability.successes = capability.successes.saturating_add(1);
        }
        Ok(())
    }

    /// Apply derived hypergraph fields back onto the tool records.
    pub fn set_tool_rankings(&self, pagerank: &[(String, f64)], clusters: &[(String, usize)]) {
        for (id, score) in pagerank {
            if let Some(mut tool) = self.tools.get_mut(id) {
                tool.pagerank = *score;
            }
        }
        for (id, cluster) in clusters {
            if let Some(mut tool) = self.tools.get_mut(id) {
                tool.community = Some(*cluster);
            }
        }
    }
}
