//! Hybrid retrieval: dense cosine candidates re-ranked with the learned
//! SHGAT score. This is the engine behind `pml.discover`.

use crate::error::{PmlError, Result};
use crate::graph::CapabilityGraph;
use crate::shgat::{GraphView, Shgat};
use crate::store::Store;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Minimum cosine similarity for the candidate pool (pre-ranking cut).
const CANDIDATE_MIN_SIM: f32 = 0.3;
/// Candidate pool size floor.
const CANDIDATE_POOL_FLOOR: usize = 64;
/// Constant penalty applied to bare tools in the learned-score slot, so a
/// semantically-perfect tool still ranks competitively against capabilities.
const TOOL_PENALTY: f32 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiscoverOptions {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default)]
    pub include_explanation: bool,
}

fn default_top_k() -> usize {
    10
}

fn default_min_score() -> f32 {
    0.3
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            include_explanation: false,
        }
    }
}

/// Mixing weights for the hybrid score. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrieverWeights {
    pub cosine: f32,
    pub shgat: f32,
}

impl Default for RetrieverWeights {
    fn default() -> Self {
        Self {
            cosine: 0.35,
            shgat: 0.65,
        }
    }
}

impl RetrieverWeights {
    pub fn validate(&self) -> Result<()> {
        if (self.cosine + self.shgat - 1.0).abs() > 1e-6 {
            return Err(PmlError::invalid(format!(
                "retriever weights must sum to 1 (got {} + {})",
                self.cosine, self.shgat
            )));
        }
        if self.cosine < 0.0 || self.shgat < 0.0 {
            return Err(PmlError::invalid("retriever weights must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverKind {
    Tool,
    Capability,
    Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Explanation {
    /// [semantic, context, structure, reliability] head components.
    pub components: [f32; 4],
    /// Member tool attention weights.
    pub attention: Vec<(String, f32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiscoverResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: DiscoverKind,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
}

pub struct Retriever {
    weights: RetrieverWeights,
}

impl Retriever {
    pub fn new(weights: RetrieverWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    /// Rank tools and capabilities for an already-embedded intent.
    /// Deterministic: stable sort on (score desc, id asc).
    pub fn discover(
        &self,
        store: &Store,
        graph: &CapabilityGraph,
        shgat: &Shgat,
        view: &GraphView,
        query: &[f32],
        options: &DiscoverOptions,
    ) -> Result<Vec<DiscoverResult>> {
        let pool_size = (4 * options.top_k).max(CANDIDATE_POOL_FLOOR);
        let candidates = store.top_k_cosine(query, pool_size, CANDIDATE_MIN_SIM)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let capability_ids: Vec<String> = candidates
            .iter()
            .filter(|(id, _)| graph.contains_capability(id))
            .map(|(id, _)| id.clone())
            .collect();
        let shgat_scores = shgat.score_capabilities(
            view,
            query,
            &[],
            &capability_ids,
            options.include_explanation,
        )?;

        let mut results = Vec::with_capacity(candidates.len());
        for (id, cosine) in candidates {
            // Cosine lands in [-1,1]; normalize to [0,1] before mixing.
            let cosine_norm = ((cosine + 1.0) / 2.0).clamp(0.0, 1.0);
            if let Some(capability) = graph.capability(&id) {
                let Some(scored) = shgat_scores.get(&id) else {
                    continue;
                };
                let score = self.weights.cosine * cosine_norm + self.weights.shgat * scored.score;
                results.push(DiscoverResult {
                    id,
                    kind: if capability.is_meta() {
                        DiscoverKind::Meta
                    } else {
                        DiscoverKind::Capability
                    },
                    score,
                    explanation: options.include_explanation.then(|| Explanation {
                        components: scored.components,
                        attention: scored.attention.clone(),
                    }),
                });
            } else {
                // Bare tool: the penalized cosine fills the learned slot.
                let learned = (cosine_norm - TOOL_PENALTY).max(0.0);
                let score = self.weights.cosine * cosine_norm + self.weights.shgat * learned;
                results.push(DiscoverResult {
                    id,
                    kind: DiscoverKind::Tool,
                    score,
                    explanation: None,
                });
            }
        }

        results.retain(|r| r.score >= options.min_score);
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(options.top_k);
        Ok(results)
    }
}
