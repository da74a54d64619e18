//! Configuration file – reads/writes `~/.keepsake/config.toml`.

use keepsake_memory::MemoryConfig;
use keepsake_memory::consolidation::ConsolidationPolicy;
use keepsake_runtime::embedding::{DEFAULT_EMBEDDING_MODEL, DEFAULT_OLLAMA_URL};
use keepsake_runtime::scheduler::SchedulerConfig;
use keepsake_types::Importance;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which semantic index backs retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SemanticBackend {
    /// Keyword search only.
    Off,
    /// Local feature-hashing embeddings.
    #[default]
    Hashing,
    /// Embeddings from an Ollama server, falling back to hashing when it is
    /// unreachable.
    Ollama,
}

impl SemanticBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "false" => Some(SemanticBackend::Off),
            "hashing" | "local" => Some(SemanticBackend::Hashing),
            "ollama" => Some(SemanticBackend::Ollama),
            _ => None,
        }
    }
}

impl std::fmt::Display for SemanticBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SemanticBackend::Off => write!(f, "off"),
            SemanticBackend::Hashing => write!(f, "hashing"),
            SemanticBackend::Ollama => write!(f, "ollama"),
        }
    }
}

/// Persisted user configuration stored in `~/.keepsake/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Root data directory; databases live in `<data_path>/memory/`.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Capacity of each cached view.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Minimum importance for the cached "important" view.
    #[serde(default = "default_important_threshold")]
    pub important_threshold: u8,

    /// Seconds between consolidation passes.
    #[serde(default = "default_consolidation_secs")]
    pub consolidation_interval_secs: u64,

    /// Seconds before retrying a failed pass.
    #[serde(default = "default_retry_secs")]
    pub consolidation_retry_secs: u64,

    #[serde(default)]
    pub semantic: SemanticBackend,

    /// Base URL of the Ollama instance.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Ollama model used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_index_timeout_ms")]
    pub index_timeout_ms: u64,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub consolidation: ConsolidationPolicy,
}

fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

fn default_data_path() -> PathBuf {
    home_dir().join(".keepsake").join("data")
}
fn default_cache_size() -> usize {
    20
}
fn default_important_threshold() -> u8 {
    70
}
fn default_consolidation_secs() -> u64 {
    6 * 60 * 60
}
fn default_retry_secs() -> u64 {
    60 * 60
}
fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}
fn default_embedding_model() -> String {
    DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_index_timeout_ms() -> u64 {
    500
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            cache_size: default_cache_size(),
            important_threshold: default_important_threshold(),
            consolidation_interval_secs: default_consolidation_secs(),
            consolidation_retry_secs: default_retry_secs(),
            semantic: SemanticBackend::default(),
            ollama_url: default_ollama_url(),
            embedding_model: default_embedding_model(),
            index_timeout_ms: default_index_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            consolidation: ConsolidationPolicy::default(),
        }
    }
}

impl Config {
    /// Settings for opening the memory system.
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            data_path: self.data_path.clone(),
            cache_size: self.cache_size.max(1),
            important_threshold: Importance::new(i64::from(self.important_threshold)),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            index_timeout: Duration::from_millis(self.index_timeout_ms),
            policy: self.consolidation,
        }
    }

    /// Settings for the consolidation timer.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.consolidation_interval_secs.max(1)),
            retry_after: Duration::from_secs(self.consolidation_retry_secs.max(1)),
            run_at_start: false,
        }
    }
}

/// Return the path to `~/.keepsake/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".keepsake").join("config.toml")
}

/// Load the config from disk and apply `KEEPSAKE_*` overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut loaded = load_from(&config_path())?;
    if let Some(cfg) = loaded.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(loaded)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `KEEPSAKE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KEEPSAKE_DATA_PATH` | `data_path` |
/// | `KEEPSAKE_CACHE_SIZE` | `cache_size` |
/// | `KEEPSAKE_CONSOLIDATION_SECS` | `consolidation_interval_secs` |
/// | `KEEPSAKE_SEMANTIC` | `semantic` (`off`, `hashing`, `ollama`) |
/// | `KEEPSAKE_OLLAMA_URL` | `ollama_url` |
/// | `KEEPSAKE_EMBEDDING_MODEL` | `embedding_model` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("KEEPSAKE_DATA_PATH")
        && !v.trim().is_empty()
    {
        cfg.data_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KEEPSAKE_CACHE_SIZE")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.cache_size = n;
    }
    if let Ok(v) = std::env::var("KEEPSAKE_CONSOLIDATION_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.consolidation_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("KEEPSAKE_SEMANTIC")
        && let Some(backend) = SemanticBackend::parse(&v)
    {
        cfg.semantic = backend;
    }
    if let Ok(v) = std::env::var("KEEPSAKE_OLLAMA_URL") {
        cfg.ollama_url = v;
    }
    if let Ok(v) = std::env::var("KEEPSAKE_EMBEDDING_MODEL") {
        cfg.embedding_model = v;
    }
}

/// Save the config to disk, creating `~/.keepsake/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only file (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
