//! The PML runtime: one registry object owning the store, graph, scorer,
//! gateway, and executor. The server instance holds exactly one of these;
//! its lifetime is the process.

use crate::config::{
    PmlConfig, DEFAULT_DECAY_INTERVAL_S, DEFAULT_EMBED_TIMEOUT_MS,
    DEFAULT_EPISODE_RING_CAPACITY, DEFAULT_RECENCY_HALF_LIFE_S,
};
use crate::embedding::EmbeddingBackend;
use crate::error::{PmlError, Result};
use crate::gateway::Gateway;
use crate::graph::hypergraph::HypergraphIndex;
use crate::graph::{Capability, CapabilityGraph, EpisodicTrace, ToolRecord};
use crate::retriever::{DiscoverOptions, DiscoverResult, Retriever, RetrieverWeights};
use crate::shgat::{
    GraphView, Shgat, ShgatConfig, TrainOptions, TrainReport, TrainSample, VertexStats,
};
use crate::store::Store;
use crate::workflow::executor::{ExecuteOptions, ToolInvoker, WorkflowExecutor};
use crate::workflow::plan::{expand_capability, WorkflowPlanner};
use crate::workflow::{ResultBundle, Workflow};
use chrono::Utc;
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Episodes between lazy background training runs.
const LAZY_TRAIN_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiscoverRequest {
    pub intent: String,
    #[serde(flatten)]
    pub options: DiscoverOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DiscoverResponse {
    pub results: Vec<DiscoverResult>,
    pub model_version: u64,
}

/// `pml.execute` input: either a natural-language intent the planner
/// expands, or an explicit workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ExecuteInput {
    Workflow { workflow: Workflow },
    Intent { intent: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    #[serde(flatten)]
    pub input: ExecuteInput,
    #[serde(flatten)]
    pub options: ExecuteOptions,
}

pub struct PmlRuntime {
    store: Arc<Store>,
    backend: Arc<dyn EmbeddingBackend>,
    graph: Arc<CapabilityGraph>,
    hypergraph: RwLock<HypergraphIndex>,
    view: RwLock<Arc<GraphView>>,
    shgat: Arc<Shgat>,
    gateway: Option<Arc<Gateway>>,
    retriever: Retriever,
    executor: WorkflowExecutor,
    planner: Option<Arc<dyn WorkflowPlanner>>,
    cancel: watch::Sender<bool>,
    decay_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    recency_half_life_s: f64,
}

impl PmlRuntime {
    /// Production bootstrap: open the store, connect the gateway, hydrate
    /// the graph, and restore SHGAT parameters when a snapshot exists.
    pub async fn bootstrap(
        config: Arc<PmlConfig>,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Result<Arc<Self>> {
        let gateway = Arc::new(Gateway::new(config.clone()));
        let runtime = Self::assemble(config, backend, Some(gateway.clone()), gateway, None).await?;
        runtime.refresh().await?;
        runtime.start_decay_task(Duration::from_secs(DEFAULT_DECAY_INTERVAL_S));
        Ok(runtime)
    }

    /// Assembly seam used by tests: any invoker, no provider processes.
    pub async fn with_invoker(
        config: Arc<PmlConfig>,
        backend: Arc<dyn EmbeddingBackend>,
        invoker: Arc<dyn ToolInvoker>,
        planner: Option<Arc<dyn WorkflowPlanner>>,
    ) -> Result<Arc<Self>> {
        Self::assemble(config, backend, None, invoker, planner).await
    }

    async fn assemble(
        config: Arc<PmlConfig>,
        backend: Arc<dyn EmbeddingBackend>,
        gateway: Option<Arc<Gateway>>,
        invoker: Arc<dyn ToolInvoker>,
        planner: Option<Arc<dyn WorkflowPlanner>>,
    ) -> Result<Arc<Self>> {
        let dim = config.settings.embedding_dim;
        if backend.dimension() != dim {
            return Err(PmlError::DimensionMismatch {
                expected: dim,
                actual: backend.dimension(),
            });
        }
        let store = Arc::new(Store::open(
            &config.settings.db_path,
            dim,
            DEFAULT_EPISODE_RING_CAPACITY,
        )?);

        let shgat = Arc::new(Shgat::new(ShgatConfig::with_dim(dim)));
        if let Some((_, blob)) = store.load_params()? {
            match shgat.import_params(&blob) {
                Ok(()) => info!("restored SHGAT parameters from store"),
                Err(e) => warn!(error = %e, "stored SHGAT parameters rejected; starting fresh"),
            }
        }

        let graph = Arc::new(CapabilityGraph::new());
        for tool in store.load_tools()? {
            graph.register_tool(tool)?;
        }
        // Children before parents: register in passes until the hierarchy
        // stops making progress (depth is small, so a handful suffice).
        let mut pending = store.load_capabilities()?;
        loop {
            let before = pending.len();
            pending.retain(|capability| graph.register_capability(capability.clone()).is_err());
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for capability in &pending {
            warn!(capability = %capability.id, "stored capability rejected during hydration");
        }

        let executor = WorkflowExecutor::new(invoker, config.settings.max_concurrency.max(1));
        let (cancel, _) = watch::channel(false);

        let runtime = Arc::new(Self {
            store,
            backend,
            graph,
            hypergraph: RwLock::new(HypergraphIndex::new()),
            view: RwLock::new(Arc::new(empty_view(dim))),
            shgat,
            gateway,
            retriever: Retriever::new(RetrieverWeights::default())?,
            executor,
            planner,
            cancel,
            decay_task: Mutex::new(None),
            recency_half_life_s: DEFAULT_RECENCY_HALF_LIFE_S,
        });
        runtime.rebuild_index()?;
        Ok(runtime)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn graph(&self) -> &CapabilityGraph {
        &self.graph
    }

    pub fn shgat(&self) -> &Shgat {
        &self.shgat
    }

    pub fn gateway(&self) -> Option<&Arc<Gateway>> {
        self.gateway.as_ref()
    }

    /// Discover + upsert the provider tool catalog, then rebuild the
    /// hypergraph and the scoring view.
    pub async fn refresh(&self) -> Result<()> {
        let Some(gateway) = &self.gateway else {
            self.rebuild_index()?;
            return Ok(());
        };
        gateway.warm_up().await?;
        let mut records = gateway.tool_records();

        // Embed only tools that are new or whose schema changed.
        let mut to_embed: Vec<usize> = Vec::new();
        for (i, record) in records.iter_mut().enumerate() {
            match self.store.get_embedding(&record.id)? {
                Some(embedding) => record.embedding = embedding,
                None => to_embed.push(i),
            }
        }
        if !to_embed.is_empty() {
            let docs: Vec<String> = to_embed
                .iter()
                .map(|&i| {
                    format!(
                        "{}\nDescription: {}",
                        records[i].name, records[i].description
                    )
                })
                .collect();
            let vectors = self.backend.embed_batch(&docs)?;
            for (&i, vector) in to_embed.iter().zip(vectors) {
                records[i].embedding = vector;
            }
        }

        for record in records {
            self.store.upsert_tool(&record)?;
            self.graph.register_tool(record)?;
        }
        self.rebuild_index()?;
        info!(tools = gateway.tool_count(), "catalog refreshed");
        Ok(())
    }

    /// Register a tool directly (providers normally feed the catalog via
    /// `refresh`; this is the seam for embedded catalogs and tests). Call
    /// `rebuild_index` after a batch.
    pub fn register_tool(&self, mut record: ToolRecord) -> Result<()> {
        if record.embedding.is_empty() {
            record.embedding = self.backend.embed_one(&format!(
                "{}\nDescription: {}",
                record.name, record.description
            ))?;
        }
        self.store.upsert_tool(&record)?;
        self.graph.register_tool(record)?;
        Ok(())
    }

    /// Register (or replace) a user-defined capability.
    pub fn register_capability(&self, mut capability: Capability) -> Result<()> {
        self.graph.register_capability(capability.clone())?;
        self.store
            .upsert_capability(&mut capability, self.backend.as_ref())?;
        // The embedding may have been filled in by the store.
        self.graph.register_capability(capability)?;
        self.rebuild_index()
    }

    pub fn unregister_capability(&self, id: &str) -> Result<Capability> {
        let capability = self.graph.remove_capability(id)?;
        self.store.remove_capability(id)?;
        self.rebuild_index()?;
        Ok(capability)
    }

    /// Rank tools and capabilities for an intent.
    pub async fn discover(&self, request: &DiscoverRequest) -> Result<DiscoverResponse> {
        if request.intent.trim().is_empty() {
            return Err(PmlError::invalid("intent must not be empty"));
        }
        let query = self.embed_intent(&request.intent).await?;
        let view = self.view.read().clone();
        let results = self.retriever.discover(
            &self.store,
            &self.graph,
            &self.shgat,
            &view,
            &query,
            &request.options,
        )?;
        Ok(DiscoverResponse {
            results,
            model_version: self.shgat.model_version(),
        })
    }

    /// Execute an explicit workflow or plan one from an intent.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ResultBundle> {
        let (workflow, capability_id, intent) = match &request.input {
            ExecuteInput::Workflow { workflow } => (workflow.clone(), None, None),
            ExecuteInput::Intent { intent } => {
                let (workflow, capability_id) = self.plan_intent(intent).await?;
                (workflow, capability_id, Some(intent.clone()))
            }
        };

        let bundle = self
            .executor
            .execute(&workflow, &request.options, self.cancel.subscribe())
            .await?;

        if let Some(capability_id) = capability_id {
            self.record_outcome(&capability_id, intent.as_deref().unwrap_or(""), &workflow, &bundle);
        }
        Ok(bundle)
    }

    /// Expand an intent into a workflow: the configured planner when one is
    /// present, otherwise the capability-template fallback.
    async fn plan_intent(&self, intent: &str) -> Result<(Workflow, Option<String>)> {
        if let Some(planner) = &self.planner {
            return Ok((planner.plan(intent).await?, None));
        }

        let discovered = self
            .discover(&DiscoverRequest {
                intent: intent.to_string(),
                options: DiscoverOptions {
                    top_k: 5,
                    min_score: 0.0,
                    include_explanation: false,
                },
            })
            .await?;
        let best_capability = discovered
            .results
            .iter()
            .find(|r| r.kind != crate::retriever::DiscoverKind::Tool)
            .ok_or_else(|| PmlError::not_found("capability", intent))?;
        let capability = self
            .graph
            .capability(&best_capability.id)
            .ok_or_else(|| PmlError::not_found("capability", best_capability.id.clone()))?;

        let leaf_chain = self.flatten_leaves(&capability)?;
        let workflow = expand_capability(&leaf_chain, intent)?;
        Ok((workflow, Some(capability.id)))
    }

    /// Flatten a (possibly meta) capability into a single leaf whose member
    /// list is its descendant leaves' members in depth-first order.
    fn flatten_leaves(&self, capability: &Capability) -> Result<Capability> {
        if !capability.is_meta() {
            return Ok(capability.clone());
        }
        let mut members = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<String> = capability.children.iter().rev().cloned().collect();
        while let Some(id) = stack.pop() {
            let child = self
                .graph
                .capability(&id)
                .ok_or_else(|| PmlError::not_found("capability", id.clone()))?;
            if child.is_meta() {
                stack.extend(child.children.iter().rev().cloned());
            } else {
                for member in &child.members {
                    if seen.insert(member.clone()) {
                        members.push(member.clone());
                    }
                }
            }
        }
        let mut flattened = capability.clone();
        flattened.children = Vec::new();
        flattened.members = members;
        Ok(flattened)
    }

    /// Book-keeping after a planned execution: episode trace, success
    /// counters, recency/co-occurrence.
    fn record_outcome(
        &self,
        capability_id: &str,
        intent: &str,
        workflow: &Workflow,
        bundle: &ResultBundle,
    ) {
        let outcome = bundle.all_succeeded();
        let context_tools: Vec<String> = workflow.tasks.iter().map(|t| t.tool.clone()).collect();
        if let Err(e) = self.store.append_episode(EpisodicTrace {
            ts: Utc::now(),
            intent: intent.to_string(),
            context_tools,
            capability_id: capability_id.to_string(),
            outcome,
        }) {
            warn!(error = %e, "failed to append episode");
        }
        if let Err(e) = self.graph.record_attempt(capability_id, outcome) {
            debug!(error = %e, "capability vanished before outcome recording");
        }
        {
            let mut hypergraph = self.hypergraph.write();
            if hypergraph.record_selection(capability_id).is_ok() {
                hypergraph.normalize_cooccurrence();
            }
        }
        if let Some(mut capability) = self.graph.capability(capability_id) {
            if let Err(e) = self
                .store
                .upsert_capability(&mut capability, self.backend.as_ref())
            {
                warn!(error = %e, "failed to persist capability counters");
            }
        }
        if let Err(e) = self.refresh_view() {
            warn!(error = %e, "failed to refresh scoring view");
        }

        // Lazy training trigger: enough fresh episodes, train in background.
        if self.store.episode_count() >= LAZY_TRAIN_THRESHOLD
            && self.store.episode_count() % LAZY_TRAIN_THRESHOLD == 0
        {
            self.spawn_background_training();
        }
    }

    fn spawn_background_training(&self) {
        let shgat = self.shgat.clone();
        let view = self.view.read().clone();
        let samples = match self.training_samples() {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "could not assemble training samples");
                return;
            }
        };
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                shgat
                    .train(&view, samples, TrainOptions::default())
                    .map(|report| (shgat, report))
            })
            .await;
            match result {
                Ok(Ok((shgat, report))) => {
                    info!(
                        epochs = report.epochs_run,
                        accuracy = report.final_accuracy,
                        "background training complete"
                    );
                    match shgat.export_params() {
                        Ok(blob) => {
                            if let Err(e) = store.save_params(crate::shgat::PARAMS_VERSION, &blob) {
                                warn!(error = %e, "failed to persist trained parameters");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to export trained parameters"),
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "background training failed"),
                Err(e) => warn!(error = %e, "training worker panicked"),
            }
        });
    }

    /// Assemble training samples from recent episodes (intents embedded in
    /// one batch).
    fn training_samples(&self) -> Result<Vec<TrainSample>> {
        let episodes = self.store.recent_episodes(usize::MAX);
        let intents: Vec<String> = episodes.iter().map(|e| e.intent.clone()).collect();
        if intents.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.backend.embed_batch(&intents)?;
        Ok(episodes
            .into_iter()
            .zip(vectors)
            .map(|(episode, query)| TrainSample {
                query,
                context_tools: episode.context_tools,
                capability_id: episode.capability_id,
                outcome: episode.outcome,
            })
            .collect())
    }

    /// On-demand training over the recorded episodes. Runs on the blocking
    /// pool; rejected with `Overloaded` while another run is active.
    pub async fn train(&self, options: TrainOptions) -> Result<TrainReport> {
        let samples = self.training_samples()?;
        let view = self.view.read().clone();
        let shgat = self.shgat.clone();
        let report = tokio::task::spawn_blocking(move || shgat.train(&view, samples, options))
            .await
            .map_err(|e| PmlError::internal(format!("training worker died: {e}")))??;
        let blob = self.shgat.export_params()?;
        self.store
            .save_params(crate::shgat::PARAMS_VERSION, &blob)?;
        Ok(report)
    }

    /// Recompute the hypergraph (incidence, PageRank, clusters) and swap in
    /// a fresh scoring view.
    pub fn rebuild_index(&self) -> Result<()> {
        let tools = self.graph.tools_snapshot();
        let mut capabilities = Vec::new();
        for capability in self.graph.capabilities_snapshot() {
            let aggregated = self.graph.aggregated_tools(&capability.id)?;
            capabilities.push((capability, aggregated));
        }
        {
            let mut hypergraph = self.hypergraph.write();
            hypergraph.rebuild(&tools, &capabilities)?;
            let (pagerank, clusters) = hypergraph.tool_rankings();
            self.graph.set_tool_rankings(&pagerank, &clusters);
        }
        self.refresh_view()
    }

    /// Rebuild only the dense scoring view from current graph + features.
    fn refresh_view(&self) -> Result<()> {
        let dim = self.store.dimension();
        let hypergraph = self.hypergraph.read();
        let vertex_ids = hypergraph.vertex_ids().to_vec();
        let edge_ids = hypergraph.edge_ids().to_vec();

        let mut x_v = Array2::zeros((vertex_ids.len(), dim));
        for (i, id) in vertex_ids.iter().enumerate() {
            if let Some(tool) = self.graph.tool(id) {
                if tool.embedding.len() == dim {
                    x_v.row_mut(i)
                        .assign(&ndarray::ArrayView1::from(&tool.embedding[..]));
                }
            }
        }
        let mut x_e = Array2::zeros((edge_ids.len(), dim));
        let mut edge_stats = Vec::with_capacity(edge_ids.len());
        for (i, id) in edge_ids.iter().enumerate() {
            let capability = self.graph.capability(id);
            if let Some(capability) = &capability {
                if capability.embedding.len() == dim {
                    x_e.row_mut(i)
                        .assign(&ndarray::ArrayView1::from(&capability.embedding[..]));
                }
            }
            let features = hypergraph.features(id).cloned().unwrap_or_default();
            edge_stats.push(crate::shgat::EdgeStats {
                cluster: features.spectral_cluster,
                pagerank: features.pagerank,
                success_rate: capability.map(|c| c.success_rate()).unwrap_or(0.5),
                recency: features.recency,
                cooccurrence: features.cooccurrence,
            });
        }

        let vertex_stats = vertex_ids
            .iter()
            .map(|id| VertexStats {
                cluster: hypergraph.tool_cluster(id).unwrap_or(0),
            })
            .collect();

        let view = GraphView {
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
            members: hypergraph.members().to_vec(),
            incident: hypergraph.incident().to_vec(),
            vertex_stats,
            edge_stats,
        };
        *self.view.write() = Arc::new(view);
        Ok(())
    }

    async fn embed_intent(&self, intent: &str) -> Result<Vec<f32>> {
        let backend = self.backend.clone();
        let intent = intent.to_string();
        // The embedding provider may block (model inference); keep it off
        // the async workers and bound the wait.
        let worker = tokio::task::spawn_blocking(move || backend.embed_one(&intent));
        tokio::time::timeout(Duration::from_millis(DEFAULT_EMBED_TIMEOUT_MS), worker)
            .await
            .map_err(|_| PmlError::Timeout {
                message: "embedding call".into(),
                timeout_ms: DEFAULT_EMBED_TIMEOUT_MS,
            })?
            .map_err(|e| PmlError::internal(format!("embedding worker died: {e}")))?
    }

    /// Periodic recency decay, owned by the runtime and cancelled on
    /// shutdown.
    fn start_decay_task(self: &Arc<Self>, interval: Duration) {
        let runtime = Arc::downgrade(self);
        let mut cancel = self.cancel.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                runtime
                    .hypergraph
                    .write()
                    .decay_recency(runtime.recency_half_life_s);
                if let Err(e) = runtime.refresh_view() {
                    warn!(error = %e, "recency decay view refresh failed");
                }
            }
        });
        *self.decay_task.lock() = Some(handle);
    }

    /// Cooperative shutdown: cancel in-flight workflows and the decay task.
    pub fn shutdown(&self) {
        self.cancel.send(true).ok();
        self.shgat.cancel_training();
        if let Some(handle) = self.decay_task.lock().take() {
            handle.abort();
        }
    }

    /// Current scoring view (index-aligned snapshot).
    pub fn view(&self) -> Arc<GraphView> {
        self.view.read().clone()
    }
}

impl Drop for PmlRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self.decay_task.lock().take() {
            handle.abort();
        }
    }
}

fn empty_view(dim: usize) -> GraphView {
    GraphView {
        vertex_ids: Vec::new(),
        vertex_index: Default::default(),
        edge_ids: Vec::new(),
        edge_index: Default::default(),
        x_v: Array2::zeros((0, dim)),
        x_e: Array2::zeros((0, dim)),
        members: Vec::new(),
        incident: Vec::new(),
        vertex_stats: Vec::new(),
        edge_stats: Vec::new(),
    }
}
