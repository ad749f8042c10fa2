use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MementoConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Write throttle in operations per second. `0` disables throttling.
    pub rate_limit_per_sec: u32,
    pub backup: BackupConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Number of rotated snapshots kept in `backups/`.
    pub retain: usize,
    /// Backups older than this are never used by `recover`.
    pub restore_horizon_hours: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    pub model_dir: String,
    pub idle_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
    /// When true, an unavailable encoder degrades to deterministic
    /// hash-derived vectors instead of surfacing an error.
    pub allow_fallback: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub db_path: String,
    pub lru_size: usize,
    pub bypass: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub default_timeout_ms: u64,
    /// Candidate over-fetch factor for filtered searches, clamped to [1, 20].
    pub filter_expansion: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    /// Row count at which the graph backend is built. `0` disables it.
    pub graph_threshold: usize,
}

impl Default for MementoConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_memento_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            rate_limit_per_sec: 0,
            backup: BackupConfig::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retain: 7,
            restore_horizon_hours: 168,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let model_dir = default_memento_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            model_dir,
            idle_timeout_ms: 1_800_000,
            warmup_timeout_ms: 30_000,
            allow_fallback: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let db_path = default_memento_dir()
            .join("cache.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            lru_size: 1000,
            bypass: false,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            filter_expansion: 3,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            graph_threshold: 10_000,
        }
    }
}

/// Returns `~/.openclaw/memento/`
pub fn default_memento_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".openclaw")
        .join("memento")
}

/// Returns the default config file path: `~/.openclaw/memento/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memento_dir().join("config.toml")
}

impl MementoConfig {
    /// Load config from the default TOML file (if it exists) then apply env
    /// var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| Error::Validation(format!("failed to read config file: {e}")))?;
            toml::from_str(&contents)
                .map_err(|e| Error::Validation(format!("failed to parse config TOML: {e}")))?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MementoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MEMENTO_DB_PATH,
    /// MEMENTO_MODEL_DIR, MEMENTO_CACHE_DB).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMENTO_DB_PATH") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMENTO_MODEL_DIR") {
            self.embedding.model_dir = val;
        }
        if let Ok(val) = std::env::var("MEMENTO_CACHE_DB") {
            self.cache.db_path = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Resolve the embed cache path, expanding `~` if needed.
    pub fn resolved_cache_path(&self) -> PathBuf {
        expand_tilde(&self.cache.db_path)
    }

    /// Directory where rotated backups live, next to the database file.
    pub fn backup_dir(&self) -> PathBuf {
        self.resolved_db_path()
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
