//! SHGAT: Structured Hypergraph Attention Network.
//!
//! A learnable ranker over the capability hypergraph: given a query
//! embedding and the tools currently in context, it scores every registered
//! capability in (0,1). Two-phase attention message passing produces final
//! vertex/hyperedge embeddings; four composite heads (semantic, context,
//! structure, reliability) are mixed by a learned softmax vector through a
//! logistic. Training is online, from episodic success/failure traces.

mod forward;
mod train;

pub use forward::{CapabilityScore, EdgeStats, GraphView, VertexStats};
pub use train::{TrainOptions, TrainReport, TrainSample};

use crate::error::{PmlError, Result};
use ndarray::{Array1, Array2};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub const PARAMS_VERSION: u32 = 1;
const DEFAULT_SEED: u64 = 0x5eed_cafe;

/// Hyperparameters fixed at module init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShgatConfig {
    /// Embedding dimension D of the raw tool/capability vectors.
    pub dim: usize,
    /// Attention heads H per layer.
    pub heads: usize,
    /// Per-head hidden dimension d_h.
    pub head_dim: usize,
    /// Message-passing layers L.
    pub layers: usize,
}

impl Default for ShgatConfig {
    fn default() -> Self {
        Self {
            dim: 1024,
            heads: 4,
            head_dim: 32,
            layers: 2,
        }
    }
}

impl ShgatConfig {
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim,
            ..Self::default()
        }
    }

    /// Concatenated head width H·d_h, the node dimension after layer 0.
    pub fn hidden(&self) -> usize {
        self.heads * self.head_dim
    }

    fn input_dim(&self, layer: usize) -> usize {
        if layer == 0 {
            self.dim
        } else {
            self.hidden()
        }
    }
}

/// Per-head learned matrices for one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadParams {
    /// Vertex projection, d_h × D_in.
    pub w_v: Array2<f32>,
    /// Hyperedge projection, d_h × D_in.
    pub w_e: Array2<f32>,
    /// Vertex→hyperedge attention vector, 2·d_h.
    pub a_ve: Array1<f32>,
    /// Hyperedge→vertex attention vector, 2·d_h.
    pub a_ev: Array1<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerParams {
    pub heads: Vec<HeadParams>,
    /// Output projection, H·d_h × H·d_h.
    pub w_o: Array2<f32>,
}

/// The full learned parameter set, including the head-mixer `α`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShgatParams {
    pub config: ShgatConfig,
    pub layers: Vec<LayerParams>,
    /// Mixer over the four scoring heads, softmaxed at scoring time.
    pub alpha: Array1<f32>,
}

impl ShgatParams {
    /// Xavier-uniform init for the matrices, `α = [1,1,1,1]`.
    pub fn init(config: ShgatConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = (0..config.layers)
            .map(|layer| {
                let d_in = config.input_dim(layer);
                let heads = (0..config.heads)
                    .map(|_| HeadParams {
                        w_v: xavier(&mut rng, config.head_dim, d_in),
                        w_e: xavier(&mut rng, config.head_dim, d_in),
                        a_ve: xavier_vec(&mut rng, 2 * config.head_dim),
                        a_ev: xavier_vec(&mut rng, 2 * config.head_dim),
                    })
                    .collect();
                LayerParams {
                    heads,
                    w_o: xavier(&mut rng, config.hidden(), config.hidden()),
                }
            })
            .collect();
        Self {
            config,
            layers,
            alpha: Array1::ones(4),
        }
    }

    fn shapes_are_consistent(&self) -> bool {
        if self.layers.len() != self.config.layers || self.alpha.len() != 4 {
            return false;
        }
        self.layers.iter().enumerate().all(|(l, layer)| {
            let d_in = self.config.input_dim(l);
            layer.heads.len() == self.config.heads
                && layer.w_o.dim() == (self.config.hidden(), self.config.hidden())
                && layer.heads.iter().all(|head| {
                    head.w_v.dim() == (self.config.head_dim, d_in)
                        && head.w_e.dim() == (self.config.head_dim, d_in)
                        && head.a_ve.len() == 2 * self.config.head_dim
                        && head.a_ev.len() == 2 * self.config.head_dim
                })
        })
    }
}

fn xavier(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-limit..limit))
}

fn xavier_vec(rng: &mut StdRng, len: usize) -> Array1<f32> {
    let limit = (6.0 / len as f32).sqrt();
    Array1::from_shape_fn(len, |_| rng.gen_range(-limit..limit))
}

/// Versioned on-disk envelope for `export_params`/`import_params`.
#[derive(Serialize, Deserialize)]
struct ParamsBlob {
    version: u32,
    params: ShgatParams,
}

/// Training state machine: `Idle → Running → {Completed, Failed}`.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingStatus {
    Idle,
    Running { epoch: usize, epochs_max: usize },
    Completed { epochs_run: usize, final_loss: f32 },
    Failed { message: String },
}

/// The scorer. Reads go through an immutable parameter snapshot that is
/// swapped atomically at epoch commit, so scoring is always consistent with
/// the last completed epoch.
pub struct Shgat {
    config: ShgatConfig,
    snapshot: RwLock<Arc<ShgatParams>>,
    status: Mutex<TrainingStatus>,
    cancel: AtomicBool,
    /// Bumped on every snapshot swap (epoch commit or import); lets callers
    /// tell which parameters produced a ranking.
    generation: std::sync::atomic::AtomicU64,
}

impl Shgat {
    pub fn new(config: ShgatConfig) -> Self {
        let params = ShgatParams::init(config.clone(), DEFAULT_SEED);
        Self {
            config,
            snapshot: RwLock::new(Arc::new(params)),
            status: Mutex::new(TrainingStatus::Idle),
            cancel: AtomicBool::new(false),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Monotonic counter identifying the live parameter snapshot.
    pub fn model_version(&self) -> u64 {
        self.generation.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn config(&self) -> &ShgatConfig {
        &self.config
    }

    /// Borrow the current parameter snapshot.
    pub fn params(&self) -> Arc<ShgatParams> {
        self.snapshot.read().clone()
    }

    pub fn training_status(&self) -> TrainingStatus {
        self.status.lock().clone()
    }

    /// Score every capability in the view for a query and context.
    /// All scores are strictly in (0,1).
    pub fn score_all(
        &self,
        view: &GraphView,
        query: &[f32],
        context_tools: &[String],
        with_attention: bool,
    ) -> Result<Vec<CapabilityScore>> {
        let params = self.params();
        forward::score_all(&params, view, query, context_tools, with_attention)
    }

    /// Score a single capability; `None` when the id is not in the view.
    pub fn score_one(
        &self,
        view: &GraphView,
        query: &[f32],
        context_tools: &[String],
        capability_id: &str,
        with_attention: bool,
    ) -> Result<Option<CapabilityScore>> {
        let Some(&edge) = view.edge_index.get(capability_id) else {
            return Ok(None);
        };
        let params = self.params();
        forward::score_edges(&params, view, query, context_tools, &[edge], with_attention)
            .map(|mut scores| scores.pop())
    }

    /// Score a subset of capabilities in one message-passing pass. Ids not
    /// present in the view are absent from the result map.
    pub fn score_capabilities(
        &self,
        view: &GraphView,
        query: &[f32],
        context_tools: &[String],
        capability_ids: &[String],
        with_attention: bool,
    ) -> Result<std::collections::HashMap<String, CapabilityScore>> {
        let edges: Vec<usize> = capability_ids
            .iter()
            .filter_map(|id| view.edge_index.get(id).copied())
            .collect();
        if edges.is_empty() {
            return Ok(std::collections::HashMap::new());
        }
        let params = self.params();
        let scores =
            forward::score_edges(&params, view, query, context_tools, &edges, with_attention)?;
        Ok(scores
            .into_iter()
            .map(|score| (score.capability_id.clone(), score))
            .collect())
    }

    /// Serialize all learned matrices + hyperparameters into a versioned blob.
    pub fn export_params(&self) -> Result<Vec<u8>> {
        let blob = ParamsBlob {
            version: PARAMS_VERSION,
            params: (*self.params()).clone(),
        };
        bincode::serialize(&blob)
            .map_err(|e| PmlError::internal(format!("parameter serialization failed: {e}")))
    }

    /// Validate and install a previously exported parameter blob.
    pub fn import_params(&self, blob: &[u8]) -> Result<()> {
        let decoded: ParamsBlob = bincode::deserialize(blob)
            .map_err(|e| PmlError::invalid(format!("parameter blob is malformed: {e}")))?;
        if decoded.version != PARAMS_VERSION {
            return Err(PmlError::invalid(format!(
                "unsupported parameter blob version {} (expected {PARAMS_VERSION})",
                decoded.version
            )));
        }
        if decoded.params.config.dim != self.config.dim {
            return Err(PmlError::DimensionMismatch {
                expected: self.config.dim,
                actual: decoded.params.config.dim,
            });
        }
        if decoded.params.config != self.config || !decoded.params.shapes_are_consistent() {
            return Err(PmlError::invalid(
                "parameter blob shapes do not match the configured model",
            ));
        }
        *self.snapshot.write() = Arc::new(decoded.params);
        self.generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Request cooperative cancellation of an in-flight training run; checked
    /// between minibatches.
    pub fn cancel_training(&self) {
        self.cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Train on episodic samples. CPU-bound and synchronous; callers run it
    /// on a blocking pool. A second call while one is running is rejected
    /// with `Overloaded`.
    pub fn train(
        &self,
        view: &GraphView,
        samples: Vec<TrainSample>,
        options: TrainOptions,
    ) -> Result<TrainReport> {
        {
            let mut status = self.status.lock();
            if matches!(*status, TrainingStatus::Running { .. }) {
                return Err(PmlError::overloaded("a training run is already active"));
            }
            *status = TrainingStatus::Running {
                epoch: 0,
                epochs_max: options.epochs_max,
            };
        }
        self.cancel.store(false, std::sync::atomic::Ordering::SeqCst);

        let result = train::run(self, view, samples, &options);
        let mut status = self.status.lock();
        match &result {
            Ok(report) => {
                *status = TrainingStatus::Completed {
                    epochs_run: report.epochs_run,
                    final_loss: report.train_loss.last().copied().unwrap_or(f32::NAN),
                };
            }
            Err(err) => {
                *status = TrainingStatus::Failed {
                    message: err.to_string(),
                };
            }
        }
        result
    }

    pub(crate) fn commit_epoch(&self, params: &ShgatParams, epoch: usize, epochs_max: usize) {
        *self.snapshot.write() = Arc::new(params.clone());
        self.generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut status = self.status.lock();
        if let TrainingStatus::Running { epoch: e, .. } = &mut *status {
            *e = epoch;
        } else {
            *status = TrainingStatus::Running {
                epoch,
                epochs_max,
            };
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_shapes_match_config() {
        let config = ShgatConfig {
            dim: 32,
            heads: 4,
            head_dim: 8,
            layers: 2,
        };
        let params = ShgatParams::init(config.clone(), 7);
        assert!(params.shapes_are_consistent());
        assert_eq!(params.layers[0].heads[0].w_v.dim(), (8, 32));
        assert_eq!(params.layers[1].heads[0].w_v.dim(), (8, config.hidden()));
        assert_eq!(params.alpha.len(), 4);
        assert!(params.alpha.iter().all(|&a| (a - 1.0).abs() < 1e-9));
    }

    #[test]
    fn init_is_deterministic_per_seed() {
        let config = ShgatConfig::with_dim(16);
        let a = ShgatParams::init(config.clone(), 42);
        let b = ShgatParams::init(config, 42);
        assert_eq!(a.layers[0].heads[0].w_v, b.layers[0].heads[0].w_v);
    }

    #[test]
    fn import_rejects_wrong_dimension() {
        let shgat = Shgat::new(ShgatConfig::with_dim(16));
        let other = Shgat::new(ShgatConfig::with_dim(32));
        let blob = other.export_params().unwrap();
        let err = shgat.import_params(&blob).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn import_rejects_garbage() {
        let shgat = Shgat::new(ShgatConfig::with_dim(16));
        assert!(shgat.import_params(b"not a blob").is_err());
    }

    #[test]
    fn export_import_round_trips() {
        let shgat = Shgat::new(ShgatConfig::with_dim(16));
        let blob = shgat.export_params().unwrap();
        let other = Shgat::new(ShgatConfig::with_dim(16));
        other.import_params(&blob).unwrap();
        assert_eq!(
            shgat.params().layers[0].heads[0].w_v,
            other.params().layers[0].heads[0].w_v
        );
    }
}
