use crate::error::{PmlError, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const DEFAULT_CONFIG_FILE: &str = "providers.json";
const DEFAULT_VERSION: &str = "1.0";

pub const DEFAULT_EMBEDDING_DIM: usize = 1024;
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_EMBED_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECENCY_HALF_LIFE_S: f64 = 3_600.0;
pub const DEFAULT_DECAY_INTERVAL_S: u64 = 60;
pub const DEFAULT_EPISODE_RING_CAPACITY: usize = 4_096;

/// Top-level configuration: the provider table plus tunables resolved from
/// `PML_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmlConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "toolProviders", alias = "tool_providers", default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(skip)]
    pub settings: Settings,
}

/// One upstream tool provider, spawned as a child process speaking MCP over
/// stdio (same shape as common MCP client configs).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Per-connection concurrent call cap; falls back to the global setting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl ProviderConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Settings resolved from the environment at load time.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: PathBuf,
    pub embedding_dim: usize,
    pub model_cache: Option<PathBuf>,
    pub api_key: Option<String>,
    pub max_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            model_cache: None,
            api_key: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl PmlConfig {
    /// Load from the default path (`~/.pml/providers.json`), creating an empty
    /// provider table when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&resolve_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<PmlConfig>(&content).map_err(|e| {
                PmlError::invalid(format!("invalid JSON in {}: {e}", path.display()))
            })?
        } else {
            PmlConfig {
                version: DEFAULT_VERSION.to_string(),
                providers: HashMap::new(),
                settings: Settings::default(),
            }
        };

        config.settings = Settings::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            if name.contains(':') {
                return Err(PmlError::invalid(format!(
                    "provider name '{name}' must not contain ':'"
                )));
            }
            if provider.command.trim().is_empty() {
                return Err(PmlError::invalid(format!(
                    "provider '{name}' has an empty command"
                )));
            }
        }
        if self.settings.embedding_dim == 0 {
            return Err(PmlError::invalid("embedding dimension must be positive"));
        }
        Ok(())
    }
}

impl Settings {
    /// Resolve `PML_*` variables. Recognized: `PML_DB_PATH`,
    /// `PML_EMBEDDING_DIM`, `PML_MODEL_CACHE`, `PML_API_KEY`,
    /// `PML_MAX_CONCURRENCY`. Anything else prefixed `PML_` warns and is
    /// ignored.
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();

        for (key, value) in std::env::vars() {
            match key.as_str() {
                "PML_DB_PATH" => settings.db_path = PathBuf::from(value),
                "PML_EMBEDDING_DIM" => {
                    settings.embedding_dim = value.parse().map_err(|_| {
                        PmlError::invalid(format!("PML_EMBEDDING_DIM is not a number: '{value}'"))
                    })?;
                    debug!("embedding dimension overridden to {}", settings.embedding_dim);
                }
                "PML_MODEL_CACHE" => settings.model_cache = Some(PathBuf::from(value)),
                "PML_API_KEY" => settings.api_key = Some(value),
                "PML_MAX_CONCURRENCY" => {
                    settings.max_concurrency = value.parse().map_err(|_| {
                        PmlError::invalid(format!("PML_MAX_CONCURRENCY is not a number: '{value}'"))
                    })?;
                }
                other if other.starts_with("PML_") => {
                    warn!("ignoring unknown environment variable {other}");
                }
                _ => {}
            }
        }

        Ok(settings)
    }
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_db_path() -> PathBuf {
    pml_home().join("pml.db")
}

fn pml_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pml")
}

fn resolve_config_path() -> Result<PathBuf> {
    let dir = pml_home();
    fs::create_dir_all(&dir)?;
    Ok(dir.join(DEFAULT_CONFIG_FILE))
}

/// Expand `${VAR}` placeholders in provider env values against the parent
/// process environment. Unset variables expand to the empty string.
pub fn expand_env_var(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
