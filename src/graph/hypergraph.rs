//! Hypergraph index over the capability graph.
//!
//! Maintains the incidence structure (capabilities as hyperedges over tool
//! vertices), hypergraph PageRank and cluster assignments computed on the
//! star expansion, and the per-capability behavioral features (recency,
//! co-occurrence) the scorer consumes.

use crate::error::{PmlError, Result};
use crate::graph::{Capability, ToolRecord};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_ITERATIONS: usize = 30;
const LABEL_PROPAGATION_ROUNDS: usize = 20;
const MAX_CLUSTERS: usize = 8;

/// Behavioral + structural features tracked per hyperedge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeFeatures {
    pub spectral_cluster: usize,
    pub pagerank: f64,
    /// Share of the hottest capability's recent selection count, in [0,1].
    pub cooccurrence: f64,
    /// Exponentially decayed selection recency, in [0,1].
    pub recency: f64,
}

impl Default for EdgeFeatures {
    fn default() -> Self {
        Self {
            spectral_cluster: 0,
            pagerank: 0.0,
            cooccurrence: 0.0,
            recency: 0.0,
        }
    }
}

/// Partial feature map merged by [`HypergraphIndex::update_feature`].
#[derive(Debug, Clone, Default)]
pub struct PartialFeatures {
    pub spectral_cluster: Option<usize>,
    pub pagerank: Option<f64>,
    pub cooccurrence: Option<f64>,
    pub recency: Option<f64>,
}

pub struct HypergraphIndex {
    vertex_ids: Vec<String>,
    vertex_index: HashMap<String, usize>,
    edge_ids: Vec<String>,
    edge_index: HashMap<String, usize>,
    /// Per edge: sorted member vertex indices (aggregated tool set).
    members: Vec<Vec<usize>>,
    /// Per vertex: edge indices containing it.
    incident: Vec<Vec<usize>>,
    tool_pagerank: Vec<f64>,
    tool_cluster: Vec<usize>,
    features: HashMap<String, EdgeFeatures>,
    selection_counts: HashMap<String, f64>,
    last_decay: DateTime<Utc>,
}

impl Default for HypergraphIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HypergraphIndex {
    pub fn new() -> Self {
        Self {
            vertex_ids: Vec::new(),
            vertex_index: HashMap::new(),
            edge_ids: Vec::new(),
            edge_index: HashMap::new(),
            members: Vec::new(),
            incident: Vec::new(),
            tool_pagerank: Vec::new(),
            tool_cluster: Vec::new(),
            features: HashMap::new(),
            selection_counts: HashMap::new(),
            last_decay: Utc::now(),
        }
    }

    /// Rebuild the incidence structure from scratch. Behavioral features
    /// (recency, co-occurrence, selection counters) survive for edges that
    /// still exist; structural features are recomputed.
    pub fn rebuild(
        &mut self,
        tools: &[ToolRecord],
        capabilities: &[(Capability, BTreeSet<String>)],
    ) -> Result<()> {
        let mut vertex_ids: Vec<String> = tools.iter().map(|t| t.id.clone()).collect();
        vertex_ids.sort();
        vertex_ids.dedup();
        let vertex_index: HashMap<String, usize> = vertex_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut edge_ids: Vec<String> = capabilities.iter().map(|(c, _)| c.id.clone()).collect();
        edge_ids.sort();
        edge_ids.dedup();
        let edge_index: HashMap<String, usize> = edge_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let aggregated: HashMap<&str, &BTreeSet<String>> = capabilities
            .iter()
            .map(|(c, tools)| (c.id.as_str(), tools))
            .collect();

        let mut members = vec![Vec::new(); edge_ids.len()];
        let mut incident = vec![Vec::new(); vertex_ids.len()];
        for (e, edge_id) in edge_ids.iter().enumerate() {
            let tool_set = aggregated
                .get(edge_id.as_str())
                .ok_or_else(|| PmlError::not_found("capability", edge_id.clone()))?;
            for tool_id in tool_set.iter() {
                let v = *vertex_index.get(tool_id).ok_or_else(|| {
                    PmlError::not_found("tool", tool_id.clone())
                })?;
                members[e].push(v);
                incident[v].push(e);
            }
            members[e].sort_unstable();
        }

        self.vertex_ids = vertex_ids;
        self.vertex_index = vertex_index;
        self.edge_ids = edge_ids;
        self.edge_index = edge_index;
        self.members = members;
        self.incident = incident;

        let adjacency = self.star_expansion();
        self.tool_pagerank = self.compute_pagerank(&adjacency);
        self.tool_cluster = self.propagate_labels(&adjacency);

        // Merge recomputed structure with surviving behavioral features.
        let mut features = HashMap::with_capacity(self.edge_ids.len());
        for (e, edge_id) in self.edge_ids.iter().enumerate() {
            let previous = self.features.get(edge_id);
            features.insert(
                edge_id.clone(),
                EdgeFeatures {
                    spectral_cluster: self.edge_cluster(e),
                    pagerank: self.edge_pagerank(e),
                    cooccurrence: previous.map(|f| f.cooccurrence).unwrap_or(0.0),
                    recency: previous.map(|f| f.recency).unwrap_or(0.0),
                },
            );
        }
        self.features = features;
        let edge_index = &self.edge_index;
        self.selection_counts
            .retain(|id, _| edge_index.contains_key(id));

        debug!(
            vertices = self.vertex_ids.len(),
            edges = self.edge_ids.len(),
            nnz = self.incidence_nonzeros(),
            "hypergraph rebuilt"
        );
        Ok(())
    }

    /// Number of non-zeros in the incidence matrix: Σ_e |tools(e)|.
    pub fn incidence_nonzeros(&self) -> usize {
        self.members.iter().map(Vec::len).sum()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_ids.len()
    }

    pub fn edge_ids(&self) -> &[String] {
        &self.edge_ids
    }

    pub fn vertex_ids(&self) -> &[String] {
        &self.vertex_ids
    }

    /// Member vertex indices of an edge, sorted.
    pub fn edge_members(&self, edge_id: &str) -> Option<&[usize]> {
        self.edge_index
            .get(edge_id)
            .map(|&e| self.members[e].as_slice())
    }

    /// Per-edge member vertex indices, aligned with [`edge_ids`](Self::edge_ids).
    pub fn members(&self) -> &[Vec<usize>] {
        &self.members
    }

    /// Per-vertex incident edge indices, aligned with
    /// [`vertex_ids`](Self::vertex_ids).
    pub fn incident(&self) -> &[Vec<usize>] {
        &self.incident
    }

    /// All hyperedges containing the tool.
    pub fn neighbors(&self, tool_id: &str) -> Result<Vec<String>> {
        let &v = self
            .vertex_index
            .get(tool_id)
            .ok_or_else(|| PmlError::not_found("tool", tool_id))?;
        Ok(self.incident[v]
            .iter()
            .map(|&e| self.edge_ids[e].clone())
            .collect())
    }

    pub fn features(&self, cap_id: &str) -> Option<&EdgeFeatures> {
        self.features.get(cap_id)
    }

    pub fn update_feature(&mut self, cap_id: &str, partial: PartialFeatures) -> Result<()> {
        let entry = self
            .features
            .get_mut(cap_id)
            .ok_or_else(|| PmlError::not_found("capability", cap_id))?;
        if let Some(cluster) = partial.spectral_cluster {
            entry.spectral_cluster = cluster;
        }
        if let Some(pagerank) = partial.pagerank {
            entry.pagerank = pagerank;
        }
        if let Some(cooccurrence) = partial.cooccurrence {
            entry.cooccurrence = cooccurrence.clamp(0.0, 1.0);
        }
        if let Some(recency) = partial.recency {
            entry.recency = recency.clamp(0.0, 1.0);
        }
        Ok(())
    }

    pub fn batch_update_feature(&mut self, updates: HashMap<String, PartialFeatures>) -> Result<()> {
        for (cap_id, partial) in updates {
            self.update_feature(&cap_id, partial)?;
        }
        Ok(())
    }

    /// Multiply every recency by `exp(−Δt·ln2/half_life)` where Δt is the
    /// time elapsed since the previous decay pass.
    pub fn decay_recency(&mut self, half_life_s: f64) {
        self.decay_recency_at(half_life_s, Utc::now());
    }

    pub fn decay_recency_at(&mut self, half_life_s: f64, now: DateTime<Utc>) {
        let elapsed = (now - self.last_decay).num_milliseconds().max(0) as f64 / 1000.0;
        self.last_decay = now;
        if half_life_s <= 0.0 || elapsed <= 0.0 {
            return;
        }
        let factor = (-elapsed * std::f64::consts::LN_2 / half_life_s).exp();
        for feature in self.features.values_mut() {
            feature.recency *= factor;
        }
        for count in self.selection_counts.values_mut() {
            *count *= factor;
        }
    }

    /// Record that a capability was selected: bump its counter and reset its
    /// recency to 1.
    pub fn record_selection(&mut self, cap_id: &str) -> Result<()> {
        if !self.edge_index.contains_key(cap_id) {
            return Err(PmlError::not_found("capability", cap_id));
        }
        *self.selection_counts.entry(cap_id.to_string()).or_insert(0.0) += 1.0;
        if let Some(feature) = self.features.get_mut(cap_id) {
            feature.recency = 1.0;
        }
        Ok(())
    }

    /// Divide every counter by the observed max so `cooccurrence ∈ [0,1]`.
    pub fn normalize_cooccurrence(&mut self) {
        let max = self
            .selection_counts
            .values()
            .cloned()
            .fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return;
        }
        for (cap_id, count) in &self.selection_counts {
            if let Some(feature) = self.features.get_mut(cap_id) {
                feature.cooccurrence = (count / max).clamp(0.0, 1.0);
            }
        }
    }

    pub fn tool_pagerank(&self, tool_id: &str) -> Option<f64> {
        self.vertex_index
            .get(tool_id)
            .map(|&v| self.tool_pagerank[v])
    }

    pub fn tool_cluster(&self, tool_id: &str) -> Option<usize> {
        self.vertex_index.get(tool_id).map(|&v| self.tool_cluster[v])
    }

    /// Pagerank and cluster snapshots keyed by tool id, for writing back to
    /// the registry.
    pub fn tool_rankings(&self) -> (Vec<(String, f64)>, Vec<(String, usize)>) {
        let pagerank = self
            .vertex_ids
            .iter()
            .cloned()
            .zip(self.tool_pagerank.iter().cloned())
            .collect();
        let clusters = self
            .vertex_ids
            .iter()
            .cloned()
            .zip(self.tool_cluster.iter().cloned())
            .collect();
        (pagerank, clusters)
    }

    /// Most frequent cluster among the given tools; ties break toward the
    /// smallest cluster id. `None` when no tool is known.
    pub fn majority_cluster(&self, tool_ids: &[String]) -> Option<usize> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for id in tool_ids {
            if let Some(cluster) = self.tool_cluster(id) {
                *counts.entry(cluster).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(cluster, _)| cluster)
    }

    /// Star expansion: each hyperedge becomes pairwise links among its
    /// members, weighted 1/|e|.
    fn star_expansion(&self) -> Vec<HashMap<usize, f64>> {
        let mut adjacency: Vec<HashMap<usize, f64>> = vec![HashMap::new(); self.vertex_ids.len()];
        for members in &self.members {
            if members.len() < 2 {
                continue;
            }
            let weight = 1.0 / members.len() as f64;
            for (i, &a) in members.iter().enumerate() {
                for &b in &members[i + 1..] {
                    *adjacency[a].entry(b).or_insert(0.0) += weight;
                    *adjacency[b].entry(a).or_insert(0.0) += weight;
                }
            }
        }
        adjacency
    }

    fn compute_pagerank(&self, adjacency: &[HashMap<usize, f64>]) -> Vec<f64> {
        let n = self.vertex_ids.len();
        if n == 0 {
            return Vec::new();
        }
        let out_weight: Vec<f64> = adjacency
            .iter()
            .map(|edges| edges.values().sum::<f64>())
            .collect();
        let uniform = 1.0 / n as f64;
        let mut rank = vec![uniform; n];
        for _ in 0..PAGERANK_ITERATIONS {
            let mut next = vec![(1.0 - PAGERANK_DAMPING) * uniform; n];
            let mut dangling = 0.0;
            for v in 0..n {
                if out_weight[v] <= 0.0 {
                    dangling += rank[v];
                    continue;
                }
                let share = rank[v] / out_weight[v];
                for (&u, &w) in &adjacency[v] {
                    next[u] += PAGERANK_DAMPING * share * w;
                }
            }
            let dangling_share = PAGERANK_DAMPING * dangling * uniform;
            for value in &mut next {
                *value += dangling_share;
            }
            rank = next;
        }
        rank
    }

    /// Label propagation over the star expansion: ≤20 synchronous rounds,
    /// adopting the neighbor label with the highest total weight. Ties break
    /// toward the smallest label so the outcome is reproducible. Labels are
    /// then compacted and capped at [`MAX_CLUSTERS`].
    fn propagate_labels(&self, adjacency: &[HashMap<usize, f64>]) -> Vec<usize> {
        let n = self.vertex_ids.len();
        let mut labels: Vec<usize> = (0..n).collect();
        for _ in 0..LABEL_PROPAGATION_ROUNDS {
            let mut next = labels.clone();
            let mut changed = false;
            for v in 0..n {
                if adjacency[v].is_empty() {
                    continue;
                }
                let mut weights: HashMap<usize, f64> = HashMap::new();
                for (&u, &w) in &adjacency[v] {
                    *weights.entry(labels[u]).or_insert(0.0) += w;
                }
                let best = weights
                    .into_iter()
                    .max_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(b.0.cmp(&a.0))
                    })
                    .map(|(label, _)| label);
                if let Some(best) = best {
                    if best != labels[v] {
                        next[v] = best;
                        changed = true;
                    }
                }
            }
            labels = next;
            if !changed {
                break;
            }
        }
        self.compact_labels(labels)
    }

    /// Renumber labels to 0..k in order of first appearance over sorted
    /// vertex ids; groups beyond the cap merge into the last cluster.
    fn compact_labels(&self, labels: Vec<usize>) -> Vec<usize> {
        let mut group_sizes: HashMap<usize, usize> = HashMap::new();
        for &label in &labels {
            *group_sizes.entry(label).or_insert(0) += 1;
        }
        let mut groups: Vec<(usize, usize)> = group_sizes.into_iter().collect();
        // Rank by size desc, then by label asc for determinism.
        groups.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut remap: HashMap<usize, usize> = HashMap::new();
        for (rank, (label, _)) in groups.iter().enumerate() {
            let cluster = rank.min(MAX_CLUSTERS - 1);
            remap.insert(*label, cluster);
        }
        labels.into_iter().map(|l| remap[&l]).collect()
    }

    fn edge_pagerank(&self, e: usize) -> f64 {
        let members = &self.members[e];
        if members.is_empty() {
            return 0.0;
        }
        members.iter().map(|&v| self.tool_pagerank[v]).sum::<f64>() / members.len() as f64
    }

    fn edge_cluster(&self, e: usize) -> usize {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for &v in &self.members[e] {
            *counts.entry(self.tool_cluster[v]).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(cluster, _)| cluster)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Capability, CapabilityGraph, ToolRecord};
    use serde_json::json;

    fn build(tool_ids: &[&str], caps: &[(&str, &[&str])]) -> (CapabilityGraph, HypergraphIndex) {
        let graph = CapabilityGraph::new();
        for id in tool_ids {
            let (provider, name) = ToolRecord::split_id(id).unwrap();
            graph
                .register_tool(ToolRecord {
                    id: id.to_string(),
                    provider: provider.to_string(),
                    name: name.to_string(),
                    description: String::new(),
                    input_schema: json!({}),
                    embedding: Vec::new(),
                    community: None,
                    pagerank: 0.0,
                })
                .unwrap();
        }
        for (cap_id, members) in caps {
            graph
                .register_capability(Capability::leaf(
                    *cap_id,
                    *cap_id,
                    members.iter().map(|m| m.to_string()).collect(),
                ))
                .unwrap();
        }
        let mut index = HypergraphIndex::new();
        let tools = graph.tools_snapshot();
        let capabilities: Vec<_> = graph
            .capabilities_snapshot()
            .into_iter()
            .map(|c| {
                let agg = graph.aggregated_tools(&c.id).unwrap();
                (c, agg)
            })
            .collect();
        index.rebuild(&tools, &capabilities).unwrap();
        (graph, index)
    }

    #[test]
    fn incidence_nonzeros_match_membership() {
        let (_, index) = build(
            &["a:1", "a:2", "b:1", "b:2"],
            &[("cap__x", &["a:1", "a:2"]), ("cap__y", &["a:2", "b:1", "b:2"])],
        );
        assert_eq!(index.incidence_nonzeros(), 5);
        assert_eq!(index.vertex_count(), 4);
        assert_eq!(index.edge_count(), 2);
    }

    #[test]
    fn neighbors_returns_containing_edges() {
        let (_, index) = build(
            &["a:1", "a:2", "b:1"],
            &[("cap__x", &["a:1", "a:2"]), ("cap__y", &["a:2", "b:1"])],
        );
        let mut caps = index.neighbors("a:2").unwrap();
        caps.sort();
        assert_eq!(caps, vec!["cap__x".to_string(), "cap__y".to_string()]);
        assert!(index.neighbors("z:9").is_err());
    }

    #[test]
    fn pagerank_sums_to_one_and_favors_shared_tools() {
        let (_, index) = build(
            &["a:1", "a:2", "a:3", "b:1"],
            &[
                ("cap__x", &["a:1", "a:2"]),
                ("cap__y", &["a:2", "a:3"]),
                ("cap__z", &["a:2", "b:1"]),
            ],
        );
        let total: f64 = index
            .vertex_ids()
            .iter()
            .map(|id| index.tool_pagerank(id).unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-6);
        // a:2 sits in every edge and should outrank the leaf tools.
        let hub = index.tool_pagerank("a:2").unwrap();
        assert!(hub > index.tool_pagerank("b:1").unwrap());
    }

    #[test]
    fn clustering_is_deterministic() {
        let build_clusters = || {
            let (_, index) = build(
                &["a:1", "a:2", "a:3", "b:1", "b:2", "b:3"],
                &[
                    ("cap__left", &["a:1", "a:2", "a:3"]),
                    ("cap__right", &["b:1", "b:2", "b:3"]),
                ],
            );
            index
                .vertex_ids()
                .iter()
                .map(|id| index.tool_cluster(id).unwrap())
                .collect::<Vec<_>>()
        };
        let first = build_clusters();
        let second = build_clusters();
        assert_eq!(first, second);
        // the two cliques end up in different clusters
        let (_, index) = build(
            &["a:1", "a:2", "a:3", "b:1", "b:2", "b:3"],
            &[
                ("cap__left", &["a:1", "a:2", "a:3"]),
                ("cap__right", &["b:1", "b:2", "b:3"]),
            ],
        );
        assert_ne!(
            index.tool_cluster("a:1").unwrap(),
            index.tool_cluster("b:1").unwrap()
        );
        assert_eq!(
            index.tool_cluster("a:1").unwrap(),
            index.tool_cluster("a:3").unwrap()
        );
    }

    #[test]
    fn recency_decays_with_half_life() {
        let (_, mut index) = build(&["a:1", "a:2"], &[("cap__x", &["a:1", "a:2"])]);
        index.record_selection("cap__x").unwrap();
        assert!((index.features("cap__x").unwrap().recency - 1.0).abs() < 1e-9);

        let start = index.last_decay;
        index.decay_recency_at(60.0, start + chrono::Duration::seconds(60));
        let recency = index.features("cap__x").unwrap().recency;
        assert!((recency - 0.5).abs() < 1e-6, "one half-life → 0.5, got {recency}");
    }

    #[test]
    fn cooccurrence_normalizes_to_unit_max() {
        let (_, mut index) = build(
            &["a:1", "a:2", "b:1"],
            &[("cap__x", &["a:1", "a:2"]), ("cap__y", &["a:2", "b:1"])],
        );
        for _ in 0..4 {
            index.record_selection("cap__x").unwrap();
        }
        index.record_selection("cap__y").unwrap();
        index.normalize_cooccurrence();
        assert!((index.features("cap__x").unwrap().cooccurrence - 1.0).abs() < 1e-9);
        assert!((index.features("cap__y").unwrap().cooccurrence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn feature_updates_merge_partially() {
        let (_, mut index) = build(&["a:1", "a:2"], &[("cap__x", &["a:1", "a:2"])]);
        index
            .update_feature(
                "cap__x",
                PartialFeatures {
                    recency: Some(0.8),
                    ..PartialFeatures::default()
                },
            )
            .unwrap();
        let features = index.features("cap__x").unwrap();
        assert!((features.recency - 0.8).abs() < 1e-9);
        // untouched fields keep their values
        assert_eq!(features.cooccurrence, 0.0);

        let updates = HashMap::from([(
            "cap__x".to_string(),
            PartialFeatures {
                cooccurrence: Some(2.5), // clamped into [0,1]
                spectral_cluster: Some(3),
                ..PartialFeatures::default()
            },
        )]);
        index.batch_update_feature(updates).unwrap();
        let features = index.features("cap__x").unwrap();
        assert_eq!(features.cooccurrence, 1.0);
        assert_eq!(features.spectral_cluster, 3);
        assert!((features.recency - 0.8).abs() < 1e-9);

        let err = index
            .update_feature("cap__ghost", PartialFeatures::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn behavioral_features_survive_rebuild() {
        let (graph, mut index) = build(
            &["a:1", "a:2", "b:1"],
            &[("cap__x", &["a:1", "a:2"]), ("cap__y", &["a:2", "b:1"])],
        );
        index.record_selection("cap__x").unwrap();
        index.normalize_cooccurrence();
        let before = index.features("cap__x").unwrap().clone();

        let tools = graph.tools_snapshot();
        let capabilities: Vec<_> = graph
            .capabilities_snapshot()
            .into_iter()
            .map(|c| {
                let agg = graph.aggregated_tools(&c.id).unwrap();
                (c, agg)
            })
            .collect();
        index.rebuild(&tools, &capabilities).unwrap();

        let after = index.features("cap__x").unwrap();
        assert_eq!(before.recency, after.recency);
        assert_eq!(before.cooccurrence, after.cooccurrence);
    }

    #[test]
    fn majority_cluster_breaks_ties_low() {
        let (_, index) = build(
            &["a:1", "a:2", "a:3", "b:1", "b:2", "b:3"],
            &[
                ("cap__left", &["a:1", "a:2", "a:3"]),
                ("cap__right", &["b:1", "b:2", "b:3"]),
            ],
        );
        let left = index.tool_cluster("a:1").unwrap();
        let right = index.tool_cluster("b:1").unwrap();
        let tie = index
            .majority_cluster(&["a:1".to_string(), "b:1".to_string()])
            .unwrap();
        assert_eq!(tie, left.min(right));
    }
}
