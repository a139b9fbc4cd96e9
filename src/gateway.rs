//! Tool gateway: routes `provider:name` calls to upstream MCP tool servers.
//!
//! Providers are child processes speaking MCP over stdio, spawned lazily and
//! kept alive for the life of the runtime. Each connection carries a
//! concurrency cap with a bounded wait queue; saturation surfaces as
//! `Overloaded` instead of unbounded memory growth.

use crate::config::{expand_env_var, PmlConfig, ProviderConfig};
use crate::error::{PmlError, Result};
use crate::graph::ToolRecord;
use crate::workflow::executor::ToolInvoker;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, ClientInfo, Tool},
    service::{Peer, RoleClient, RunningService, ServiceExt},
    transport::TokioChildProcess,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    process::Command,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{info, warn};

const TOOL_CACHE_TTL: Duration = Duration::from_secs(60);
/// Callers allowed to wait for a permit before `Overloaded` kicks in.
const MAX_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub provider: String,
    pub definition: Tool,
}

impl DiscoveredTool {
    pub fn tool_id(&self) -> String {
        format!("{}:{}", self.provider, self.definition.name)
    }
}

pub struct Gateway {
    config: RwLock<Arc<PmlConfig>>,
    /// Live connections by provider name. One lock guards lookup and
    /// establishment, so a provider is never spawned twice.
    connections: tokio::sync::Mutex<HashMap<String, Arc<ProviderHandle>>>,
    /// `provider:name` → schema, filled by `warm_up`.
    tool_registry: DashMap<String, Tool>,
    default_concurrency: usize,
}

/// Tool definitions as last listed from the provider, with their age.
struct ToolCache {
    defs: Vec<Tool>,
    listed_at: Instant,
}

struct ProviderHandle {
    name: String,
    /// Cloned once at connect time; calls never need the service lock.
    peer: Peer<RoleClient>,
    /// Owns the running client task and the child process (kill-on-drop);
    /// only ever touched by being dropped.
    _service: Mutex<RunningService<RoleClient, ClientInfo>>,
    tools: Mutex<ToolCache>,
    limiter: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl Gateway {
    pub fn new(config: Arc<PmlConfig>) -> Self {
        let default_concurrency = config.settings.max_concurrency.max(1);
        Self {
            config: RwLock::new(config),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            tool_registry: DashMap::new(),
            default_concurrency,
        }
    }

    pub async fn update_config(&self, new_config: Arc<PmlConfig>) {
        let old_config = {
            let mut guard = self.config.write();
            std::mem::replace(&mut *guard, new_config.clone())
        };

        // Keep only connections whose definition is unchanged and still
        // enabled; dropping a handle kills the child process.
        let mut connections = self.connections.lock().await;
        connections.retain(|name, _| {
            let keep = matches!(
                new_config.providers.get(name),
                Some(provider) if provider.is_enabled()
                    && old_config.providers.get(name) == Some(provider)
            );
            if !keep {
                info!(provider = %name, "dropping provider connection");
            }
            keep
        });
    }

    /// Connect to every enabled provider, list its tools, and refresh the
    /// registry. Providers that fail to connect are logged and skipped so a
    /// single bad upstream cannot take discovery down.
    pub async fn warm_up(&self) -> Result<Vec<DiscoveredTool>> {
        let config = self.config.read().clone();
        let mut discovered = Vec::new();
        for (name, provider) in &config.providers {
            if !provider.is_enabled() {
                continue;
            }
            let listed = match self.connection(name, provider).await {
                Ok(handle) => handle.tools().await,
                Err(err) => Err(err),
            };
            match listed {
                Ok(defs) => {
                    info!(provider = %name, tools = defs.len(), "provider connected");
                    discovered.extend(defs.into_iter().map(|definition| DiscoveredTool {
                        provider: name.clone(),
                        definition,
                    }));
                }
                Err(err) => warn!(provider = %name, error = %err, "provider unavailable"),
            }
        }

        self.tool_registry.clear();
        for tool in &discovered {
            self.tool_registry
                .insert(tool.tool_id(), tool.definition.clone());
        }
        Ok(discovered)
    }

    /// The discovered tool table as graph records (embeddings filled by the
    /// caller).
    pub fn tool_records(&self) -> Vec<ToolRecord> {
        let mut records: Vec<ToolRecord> = self
            .tool_registry
            .iter()
            .map(|entry| {
                let id = entry.key().clone();
                let (provider, name) = id.split_once(':').unwrap_or((id.as_str(), ""));
                ToolRecord {
                    provider: provider.to_string(),
                    name: name.to_string(),
                    description: entry
                        .value()
                        .description
                        .as_deref()
                        .unwrap_or("No description provided")
                        .to_string(),
                    input_schema: Value::Object((*entry.value().input_schema).clone()),
                    embedding: Vec::new(),
                    community: None,
                    pagerank: 0.0,
                    id,
                }
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn tool_definition(&self, tool_id: &str) -> Option<Tool> {
        self.tool_registry.get(tool_id).map(|t| t.value().clone())
    }

    pub fn tool_count(&self) -> usize {
        self.tool_registry.len()
    }

    /// Route one call. `tool_id` splits on the first colon; the provider
    /// part must be configured and enabled.
    pub async fn call(&self, tool_id: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let (provider_name, tool_name) = ToolRecord::split_id(tool_id)?;
        let provider = self.provider_config(provider_name)?;
        let handle = self.connection(provider_name, &provider).await?;
        handle.call(tool_name, arguments, timeout).await
    }

    fn provider_config(&self, name: &str) -> Result<ProviderConfig> {
        self.config
            .read()
            .providers
            .get(name)
            .filter(|provider| provider.is_enabled())
            .cloned()
            .ok_or_else(|| PmlError::not_found("provider", name))
    }

    /// Existing connection for the provider, or a freshly established one.
    async fn connection(
        &self,
        name: &str,
        provider: &ProviderConfig,
    ) -> Result<Arc<ProviderHandle>> {
        let mut connections = self.connections.lock().await;
        if let Some(handle) = connections.get(name) {
            return Ok(Arc::clone(handle));
        }
        let concurrency = provider
            .max_concurrency
            .unwrap_or(self.default_concurrency)
            .max(1);
        let handle = Arc::new(ProviderHandle::connect(name, provider, concurrency).await?);
        connections.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

#[async_trait]
impl ToolInvoker for Gateway {
    fn knows_tool(&self, tool_id: &str) -> bool {
        self.tool_registry.contains_key(tool_id)
    }

    async fn call(&self, tool_id: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        Gateway::call(self, tool_id, arguments, timeout).await
    }
}

impl ProviderHandle {
    /// Spawn the provider child process, finish the MCP handshake, and take
    /// the initial tool listing.
    async fn connect(name: &str, config: &ProviderConfig, concurrency: usize) -> Result<Self> {
        let transport =
            TokioChildProcess::new(provider_command(config)).map_err(|e| PmlError::Internal {
                message: format!("failed to spawn provider '{}'", config.command),
                source: Some(Box::new(e)),
            })?;

        let mut client_info = ClientInfo::default();
        client_info.client_info.name = "pml-gateway".into();
        let service = client_info
            .serve(transport)
            .await
            .map_err(|e| PmlError::Internal {
                message: format!("handshake with provider '{name}' failed"),
                source: Some(Box::new(e)),
            })?;

        let peer = service.peer().clone();
        let defs = peer
            .list_all_tools()
            .await
            .map_err(|e| upstream_error(name, e))?;

        Ok(Self {
            name: name.to_string(),
            peer,
            _service: Mutex::new(service),
            tools: Mutex::new(ToolCache {
                defs,
                listed_at: Instant::now(),
            }),
            limiter: Arc::new(Semaphore::new(concurrency)),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Tool definitions, re-listed from the provider once the cache ages
    /// past [`TOOL_CACHE_TTL`].
    async fn tools(&self) -> Result<Vec<Tool>> {
        {
            let cache = self.tools.lock();
            if cache.listed_at.elapsed() <= TOOL_CACHE_TTL {
                return Ok(cache.defs.clone());
            }
        }
        let defs = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| upstream_error(&self.name, e))?;
        let mut cache = self.tools.lock();
        cache.defs = defs.clone();
        cache.listed_at = Instant::now();
        Ok(defs)
    }

    async fn call(&self, tool_name: &str, arguments: Value, timeout: Duration) -> Result<Value> {
        let _permit = self.reserve_slot().await?;

        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(PmlError::invalid(format!(
                    "tool arguments must be an object, received {other}"
                )))
            }
        };
        let request = CallToolRequestParam {
            meta: None,
            name: tool_name.to_string().into(),
            arguments,
            task: None,
        };

        let result = tokio::time::timeout(timeout, self.peer.call_tool(request))
            .await
            .map_err(|_| PmlError::Timeout {
                message: format!("call to '{}:{}'", self.name, tool_name),
                timeout_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| upstream_error(&self.name, e))?;

        if result.is_error == Some(true) {
            let payload = serde_json::to_value(&result.content).unwrap_or(Value::Null);
            return Err(PmlError::UpstreamFailure {
                provider: self.name.clone(),
                message: format!("tool '{tool_name}' reported an error"),
                payload: Some(payload),
            });
        }
        Ok(flatten_tool_result(result))
    }

    /// Bounded admission: an immediate permit when one is free, a capped
    /// wait past that, `Overloaded` beyond the queue depth.
    async fn reserve_slot(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.limiter.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= MAX_QUEUE_DEPTH {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(PmlError::overloaded(format!(
                "provider '{}' is saturated",
                self.name
            )));
        }
        let waited = self.limiter.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        waited.map_err(|_| PmlError::internal(format!("provider '{}' limiter closed", self.name)))
    }
}

/// Build the child-process invocation for a provider, with `${VAR}`
/// placeholders in its env expanded against our own environment.
fn provider_command(config: &ProviderConfig) -> Command {
    let mut command = Command::new(&config.command);
    command.args(&config.args).kill_on_drop(true);
    for (key, value) in &config.env {
        command.env(key, expand_env_var(value));
    }
    command
}

/// Collapse an upstream tool result into one JSON value: structured output
/// wins, then text chunks joined by newlines, then null.
fn flatten_tool_result(result: CallToolResult) -> Value {
    match result.structured_content {
        Some(structured) => structured,
        None if result.content.is_empty() => Value::Null,
        None => {
            let text: Vec<String> = result
                .content
                .iter()
                .map(|part| {
                    serde_json::to_value(part)
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                })
                .collect();
            Value::String(text.join("\n"))
        }
    }
}

fn upstream_error(provider: &str, err: impl std::fmt::Display) -> PmlError {
    PmlError::UpstreamFailure {
        provider: provider.to_string(),
        message: err.to_string(),
        payload: None,
    }
}
