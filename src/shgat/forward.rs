//! Two-phase message passing and the four-head composite scorer.
//!
//! Phase A aggregates member tools into each capability hyperedge; phase B
//! aggregates incident hyperedges back into each tool. Heads are
//! concatenated and projected per layer. The query rides the same vertex
//! projection pipeline (it has no hypergraph neighborhood), so it lands in
//! the same final space as the nodes.

use super::{ShgatConfig, ShgatParams};
use crate::error::{PmlError, Result};
use ndarray::{s, Array1, Array2, ArrayView1};
use std::collections::HashMap;

const LEAKY_SLOPE: f32 = 0.2;
const LOGIT_CLAMP: f32 = 30.0;
const PAGERANK_SATURATION: f64 = 0.01;

/// Structural facts about one vertex, carried alongside its embedding.
#[derive(Debug, Clone, Default)]
pub struct VertexStats {
    pub cluster: usize,
}

/// Per-edge scoring inputs derived from the hypergraph index and the
/// capability registry.
#[derive(Debug, Clone, Default)]
pub struct EdgeStats {
    pub cluster: usize,
    pub pagerank: f64,
    pub success_rate: f64,
    pub recency: f64,
    pub cooccurrence: f64,
}

/// Dense, index-aligned view of the graph the scorer runs over. Built by the
/// runtime from the registry + hypergraph; immutable for the duration of a
/// scoring or training pass.
pub struct GraphView {
    pub vertex_ids: Vec<String>,
    pub vertex_index: HashMap<String, usize>,
    pub edge_ids: Vec<String>,
    pub edge_index: HashMap<String, usize>,
    /// |V| × D raw tool embeddings.
    pub x_v: Array2<f32>,
    /// |E| × D raw capability embeddings.
    pub x_e: Array2<f32>,
    /// Per edge: sorted member vertex indices.
    pub members: Vec<Vec<usize>>,
    /// Per vertex: incident edge indices.
    pub incident: Vec<Vec<usize>>,
    pub vertex_stats: Vec<VertexStats>,
    pub edge_stats: Vec<EdgeStats>,
}

impl GraphView {
    pub fn vertex_count(&self) -> usize {
        self.vertex_ids.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_ids.len()
    }
}

/// One scored capability, with the per-head components and member attention
/// weights used for explanations.
#[derive(Debug, Clone)]
pub struct CapabilityScore {
    pub capability_id: String,
    pub score: f32,
    /// [semantic, context, structure, reliability] head values.
    pub components: [f32; 4],
    /// Member tool id → aggregated phase-B attention weight, normalized.
    pub attention: Vec<(String, f32)>,
}

/// Cached intermediates for one layer of message passing; the trainer's
/// backward pass walks these in reverse.
pub(crate) struct LayerCache {
    pub v_in: Array2<f32>,
    pub e_in: Array2<f32>,
    /// Per head: |V| × d_h and |E| × d_h projections.
    pub p_v: Vec<Array2<f32>>,
    pub p_e: Vec<Array2<f32>>,
    /// Per head, per edge: softmax weights aligned with `members[e]`.
    pub att_ve: Vec<Vec<Vec<f32>>>,
    /// Per head, per vertex: softmax weights aligned with `incident[v]`.
    pub att_ev: Vec<Vec<Vec<f32>>>,
    /// Concatenated head messages before the output projection.
    pub raw_v: Array2<f32>,
    pub raw_e: Array2<f32>,
}

pub(crate) struct ForwardPass {
    pub layers: Vec<LayerCache>,
    /// |V| × H·d_h final vertex embeddings.
    pub v_final: Array2<f32>,
    /// |E| × H·d_h final hyperedge embeddings.
    pub e_final: Array2<f32>,
}

/// Cached intermediates of the query projection pipeline.
pub(crate) struct QueryPass {
    /// Input to each layer (layer 0 gets the raw query).
    pub inputs: Vec<Array1<f32>>,
    /// Concatenated head projection per layer, before `W_o`.
    pub raws: Vec<Array1<f32>>,
    pub q_final: Array1<f32>,
}

fn leaky_relu(x: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        LEAKY_SLOPE * x
    }
}

fn softmax_in_place(logits: &mut [f32]) {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for logit in logits.iter_mut() {
        *logit = (*logit - max).exp();
        sum += *logit;
    }
    if sum > 0.0 {
        for logit in logits.iter_mut() {
            *logit /= sum;
        }
    }
}

pub(crate) fn softmax4(alpha: &Array1<f32>) -> [f32; 4] {
    let mut out = [alpha[0], alpha[1], alpha[2], alpha[3]];
    softmax_in_place(&mut out);
    out
}

fn cosine(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    (a.dot(&b) / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Full two-phase message passing over the view. One pass serves every query
/// against the same parameter snapshot.
pub(crate) fn message_passing(params: &ShgatParams, view: &GraphView) -> Result<ForwardPass> {
    let config = &params.config;
    if view.x_v.ncols() != config.dim || view.x_e.ncols() != config.dim {
        return Err(PmlError::DimensionMismatch {
            expected: config.dim,
            actual: view.x_v.ncols().max(view.x_e.ncols()),
        });
    }

    let mut v_current = view.x_v.clone();
    let mut e_current = view.x_e.clone();
    let mut layers = Vec::with_capacity(config.layers);

    for layer_params in &params.layers {
        let cache = layer_forward(config, layer_params, &v_current, &e_current, view)?;
        v_current = cache.raw_v.dot(&layer_params.w_o.t());
        e_current = cache.raw_e.dot(&layer_params.w_o.t());
        layers.push(cache);
    }

    if v_current.iter().any(|x| !x.is_finite()) || e_current.iter().any(|x| !x.is_finite()) {
        return Err(PmlError::NumericalInstability {
            message: "non-finite values in message-passing output".into(),
        });
    }

    Ok(ForwardPass {
        layers,
        v_final: v_current,
        e_final: e_current,
    })
}

fn layer_forward(
    config: &ShgatConfig,
    layer: &super::LayerParams,
    v_in: &Array2<f32>,
    e_in: &Array2<f32>,
    view: &GraphView,
) -> Result<LayerCache> {
    let n_v = view.vertex_count();
    let n_e = view.edge_count();
    let d_h = config.head_dim;
    let hidden = config.hidden();

    let mut p_v_heads = Vec::with_capacity(config.heads);
    let mut p_e_heads = Vec::with_capacity(config.heads);
    let mut att_ve_heads = Vec::with_capacity(config.heads);
    let mut att_ev_heads = Vec::with_capacity(config.heads);
    let mut raw_v = Array2::<f32>::zeros((n_v, hidden));
    let mut raw_e = Array2::<f32>::zeros((n_e, hidden));

    for (h, head) in layer.heads.iter().enumerate() {
        let p_v = v_in.dot(&head.w_v.t());
        let p_e = e_in.dot(&head.w_e.t());
        let (a_ve_v, a_ve_e) = (
            head.a_ve.slice(s![..d_h]),
            head.a_ve.slice(s![d_h..]),
        );
        let (a_ev_e, a_ev_v) = (
            head.a_ev.slice(s![..d_h]),
            head.a_ev.slice(s![d_h..]),
        );

        // Phase A: vertex → hyperedge.
        let mut att_ve = Vec::with_capacity(n_e);
        for (e, members) in view.members.iter().enumerate() {
            let edge_term = a_ve_e.dot(&p_e.row(e));
            let mut logits: Vec<f32> = members
                .iter()
                .map(|&v| leaky_relu(a_ve_v.dot(&p_v.row(v)) + edge_term))
                .collect();
            softmax_in_place(&mut logits);
            let mut msg = Array1::<f32>::zeros(d_h);
            for (&v, &w) in members.iter().zip(&logits) {
                msg.scaled_add(w, &p_v.row(v));
            }
            raw_e.slice_mut(s![e, h * d_h..(h + 1) * d_h]).assign(&msg);
            att_ve.push(logits);
        }

        // Phase B: hyperedge → vertex.
        let mut att_ev = Vec::with_capacity(n_v);
        for (v, incident) in view.incident.iter().enumerate() {
            if incident.is_empty() {
                att_ev.push(Vec::new());
                continue;
            }
            let vertex_term = a_ev_v.dot(&p_v.row(v));
            let mut logits: Vec<f32> = incident
                .iter()
                .map(|&e| leaky_relu(a_ev_e.dot(&p_e.row(e)) + vertex_term))
                .collect();
            softmax_in_place(&mut logits);
            let mut msg = Array1::<f32>::zeros(d_h);
            for (&e, &w) in incident.iter().zip(&logits) {
                msg.scaled_add(w, &p_e.row(e));
            }
            raw_v.slice_mut(s![v, h * d_h..(h + 1) * d_h]).assign(&msg);
            att_ev.push(logits);
        }

        p_v_heads.push(p_v);
        p_e_heads.push(p_e);
        att_ve_heads.push(att_ve);
        att_ev_heads.push(att_ev);
    }

    Ok(LayerCache {
        v_in: v_in.clone(),
        e_in: e_in.clone(),
        p_v: p_v_heads,
        p_e: p_e_heads,
        att_ve: att_ve_heads,
        att_ev: att_ev_heads,
        raw_v,
        raw_e,
    })
}

/// Project the query through the per-layer vertex projections (it has no
/// neighborhood, so attention does not apply): concat over heads, then `W_o`.
pub(crate) fn project_query(params: &ShgatParams, query: &[f32]) -> Result<QueryPass> {
    let config = &params.config;
    if query.len() != config.dim {
        return Err(PmlError::DimensionMismatch {
            expected: config.dim,
            actual: query.len(),
        });
    }
    let mut current = Array1::from_vec(query.to_vec());
    let mut inputs = Vec::with_capacity(config.layers);
    let mut raws = Vec::with_capacity(config.layers);
    for layer in &params.layers {
        let mut raw = Array1::<f32>::zeros(config.hidden());
        for (h, head) in layer.heads.iter().enumerate() {
            let projected = head.w_v.dot(&current);
            raw.slice_mut(s![h * config.head_dim..(h + 1) * config.head_dim])
                .assign(&projected);
        }
        inputs.push(current);
        current = layer.w_o.dot(&raw);
        raws.push(raw);
    }
    Ok(QueryPass {
        inputs,
        raws,
        q_final: current,
    })
}

/// Saturating PageRank transform: 0 at 0, → 1 as the score grows.
fn pagerank_saturation(pagerank: f64) -> f64 {
    pagerank / (pagerank + PAGERANK_SATURATION)
}

/// Reliability tier of the smoothed success rate.
fn reliability_tier(success_rate: f64) -> f64 {
    if success_rate >= 0.95 {
        1.2
    } else if success_rate >= 0.75 {
        1.0
    } else {
        0.6
    }
}

pub(crate) struct HeadValues {
    pub h: [f32; 4],
}

/// The four composite heads for one edge. `majority` is the majority cluster
/// of the context tools, if any.
pub(crate) fn head_values(
    pass: &ForwardPass,
    query: &QueryPass,
    view: &GraphView,
    context: &[usize],
    majority: Option<usize>,
    edge: usize,
) -> HeadValues {
    let e_final = pass.e_final.row(edge);

    let semantic = cosine(query.q_final.view(), e_final);

    let context_head = if context.is_empty() {
        0.0
    } else {
        context
            .iter()
            .map(|&c| cosine(pass.v_final.row(c), e_final))
            .sum::<f32>()
            / context.len() as f32
    };

    let stats = &view.edge_stats[edge];
    let structure = match majority {
        Some(cluster) if cluster == stats.cluster => pagerank_saturation(stats.pagerank) as f32,
        _ => 0.0,
    };

    let reliability = (reliability_tier(stats.success_rate)
        * (1.0 + stats.recency + stats.cooccurrence)
        / 3.0) as f32;

    HeadValues {
        h: [semantic, context_head, structure, reliability],
    }
}

pub(crate) fn logistic(z: f32) -> f32 {
    let z = z.clamp(-LOGIT_CLAMP, LOGIT_CLAMP);
    1.0 / (1.0 + (-z).exp())
}

/// Resolve context tool ids to vertex indices; unknown ids are ignored.
fn resolve_context(view: &GraphView, context_tools: &[String]) -> Vec<usize> {
    context_tools
        .iter()
        .filter_map(|id| view.vertex_index.get(id).copied())
        .collect()
}

pub(crate) fn majority_cluster(view: &GraphView, context: &[usize]) -> Option<usize> {
    let mut counts: HashMap<usize, usize> = HashMap::new();
    for &v in context {
        *counts.entry(view.vertex_stats[v].cluster).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(cluster, _)| cluster)
}

/// Aggregated phase-B attention of edge `e` across its member tools,
/// averaged over layers and heads, normalized to sum 1.
fn member_attention(pass: &ForwardPass, view: &GraphView, edge: usize) -> Vec<(String, f32)> {
    let members = &view.members[edge];
    if members.is_empty() {
        return Vec::new();
    }
    let mut weights = vec![0.0_f32; members.len()];
    for layer in &pass.layers {
        for att_ev in &layer.att_ev {
            for (i, &v) in members.iter().enumerate() {
                if let Some(pos) = view.incident[v].iter().position(|&e| e == edge) {
                    if let Some(&w) = att_ev[v].get(pos) {
                        weights[i] += w;
                    }
                }
            }
        }
    }
    let total: f32 = weights.iter().sum();
    if total > 0.0 {
        for w in &mut weights {
            *w /= total;
        }
    } else {
        let uniform = 1.0 / members.len() as f32;
        weights.iter_mut().for_each(|w| *w = uniform);
    }
    members
        .iter()
        .zip(weights)
        .map(|(&v, w)| (view.vertex_ids[v].clone(), w))
        .collect()
}

pub(crate) fn score_edges(
    params: &ShgatParams,
    view: &GraphView,
    query: &[f32],
    context_tools: &[String],
    edges: &[usize],
    with_attention: bool,
) -> Result<Vec<CapabilityScore>> {
    let pass = message_passing(params, view)?;
    let query_pass = project_query(params, query)?;
    let context = resolve_context(view, context_tools);
    let majority = majority_cluster(view, &context);
    let alpha = softmax4(&params.alpha);

    let mut scores = Vec::with_capacity(edges.len());
    for &edge in edges {
        let heads = head_values(&pass, &query_pass, view, &context, majority, edge);
        let z: f32 = alpha.iter().zip(&heads.h).map(|(a, h)| a * h).sum();
        let score = logistic(z);
        if !score.is_finite() {
            return Err(PmlError::NumericalInstability {
                message: format!("non-finite score for '{}'", view.edge_ids[edge]),
            });
        }
        scores.push(CapabilityScore {
            capability_id: view.edge_ids[edge].clone(),
            score,
            components: heads.h,
            attention: if with_attention {
                member_attention(&pass, view, edge)
            } else {
                Vec::new()
            },
        });
    }
    Ok(scores)
}

pub(crate) fn score_all(
    params: &ShgatParams,
    view: &GraphView,
    query: &[f32],
    context_tools: &[String],
    with_attention: bool,
) -> Result<Vec<CapabilityScore>> {
    let edges: Vec<usize> = (0..view.edge_count()).collect();
    score_edges(params, view, query, context_tools, &edges, with_attention)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::shgat::{Shgat, ShgatConfig};

    const DIM: usize = 16;

    pub(crate) fn small_config() -> ShgatConfig {
        ShgatConfig {
            dim: DIM,
            heads: 2,
            head_dim: 4,
            layers: 2,
        }
    }

    pub(crate) fn unit(seed: u64) -> Vec<f32> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(1);
        let mut v: Vec<f32> = (0..DIM)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                ((state >> 11) as f32 / (1u64 << 53) as f32) - 0.5
            })
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    /// 4 tools, 2 capabilities sharing tool 1.
    pub(crate) fn toy_view() -> GraphView {
        let vertex_ids: Vec<String> =
            ["fs:read", "fs:write", "json:parse", "net:get"].iter().map(|s| s.to_string()).collect();
        let edge_ids: Vec<String> = ["cap__read_json", "cap__fetch"].iter().map(|s| s.to_string()).collect();
        let members = vec![vec![0, 2], vec![0, 3]];
        let mut incident = vec![Vec::new(); 4];
        for (e, m) in members.iter().enumerate() {
            for &v in m {
                incident[v].push(e);
            }
        }
        let mut x_v = Array2::zeros((4, DIM));
        for (i, seed) in [3u64, 5, 7, 11].iter().enumerate() {
            x_v.row_mut(i).assign(&Array1::from_vec(unit(*seed)));
        }
        let mut x_e = Array2::zeros((2, DIM));
        for (i, seed) in [13u64, 17].iter().enumerate() {
            x_e.row_mut(i).assign(&Array1::from_vec(unit(*seed)));
        }
        GraphView {
            vertex_index: vertex_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect(),
            edge_index: edge_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), i))
                .collect(),
            vertex_ids,
            edge_ids,
            x_v,
            x_e,
            members,
            incident,
            vertex_stats: vec![
                VertexStats { cluster: 0 },
                VertexStats { cluster: 0 },
                VertexStats { cluster: 0 },
                VertexStats { cluster: 1 },
            ],
            edge_stats: vec![
                EdgeStats {
                    cluster: 0,
                    pagerank: 0.3,
                    success_rate: 0.96,
                    recency: 0.5,
                    cooccurrence: 0.5,
                },
                EdgeStats {
                    cluster: 1,
                    pagerank: 0.1,
                    success_rate: 0.5,
                    recency: 0.0,
                    cooccurrence: 0.0,
                },
            ],
        }
    }

    #[test]
    fn scores_are_strictly_in_unit_interval() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        let scores = shgat
            .score_all(&view, &unit(99), &["fs:read".to_string()], false)
            .unwrap();
        assert_eq!(scores.len(), 2);
        for s in &scores {
            assert!(s.score > 0.0 && s.score < 1.0, "score {}", s.score);
        }
    }

    #[test]
    fn empty_context_zeroes_context_and_structure_heads() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        let scores = shgat.score_all(&view, &unit(99), &[], false).unwrap();
        for s in &scores {
            assert_eq!(s.components[1], 0.0);
            assert_eq!(s.components[2], 0.0);
            assert!(s.score > 0.0 && s.score < 1.0);
        }
    }

    #[test]
    fn member_order_does_not_change_the_score() {
        let shgat = Shgat::new(small_config());
        let mut view = toy_view();
        let query = unit(42);
        let context = vec!["fs:read".to_string()];
        let baseline = shgat.score_all(&view, &query, &context, false).unwrap();

        // Permute the member list of edge 0.
        view.members[0].reverse();
        let permuted = shgat.score_all(&view, &query, &context, false).unwrap();
        for (a, b) in baseline.iter().zip(&permuted) {
            assert!((a.score - b.score).abs() < 1e-5);
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        let query = unit(123);
        let a = shgat.score_all(&view, &query, &[], false).unwrap();
        let b = shgat.score_all(&view, &query, &[], false).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.score, y.score);
        }
    }

    #[test]
    fn structure_head_requires_cluster_match() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        // Context entirely in cluster 0: edge 0 (cluster 0) gets a structure
        // bonus, edge 1 (cluster 1) does not.
        let scores = shgat
            .score_all(
                &view,
                &unit(7),
                &["fs:read".to_string(), "json:parse".to_string()],
                false,
            )
            .unwrap();
        assert!(scores[0].components[2] > 0.0);
        assert_eq!(scores[1].components[2], 0.0);
    }

    #[test]
    fn attention_weights_cover_members_and_sum_to_one() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        let scores = shgat.score_all(&view, &unit(7), &[], true).unwrap();
        let attention = &scores[0].attention;
        assert_eq!(attention.len(), 2);
        let total: f32 = attention.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(attention.iter().any(|(id, _)| id == "fs:read"));
    }

    #[test]
    fn reliability_tiers_are_piecewise() {
        assert_eq!(reliability_tier(0.99), 1.2);
        assert_eq!(reliability_tier(0.80), 1.0);
        assert_eq!(reliability_tier(0.10), 0.6);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let shgat = Shgat::new(small_config());
        let view = toy_view();
        let err = shgat.score_all(&view, &[0.5; 8], &[], false).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }
}
