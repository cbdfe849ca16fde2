use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SiftError};
use crate::types::SearchMode;

/// Top-level configuration for sift.
///
/// Loaded from `~/.sift/config.toml` by default. Every section falls back to
/// its defaults when absent, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiftConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl SiftConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SiftConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.index.embedding_dim == 0 {
            return Err(SiftError::Config("index.embedding_dim must be > 0".into()));
        }
        if self.index.min_partitions == 0 {
            return Err(SiftError::Config("index.min_partitions must be > 0".into()));
        }
        if self.index.max_partitions < self.index.min_partitions {
            return Err(SiftError::Config(format!(
                "index.max_partitions ({}) is below index.min_partitions ({})",
                self.index.max_partitions, self.index.min_partitions
            )));
        }
        if !(self.index.imbalance_threshold >= 1.0) {
            return Err(SiftError::Config(
                "index.imbalance_threshold must be >= 1.0".into(),
            ));
        }
        if self.storage.shards == 0 {
            return Err(SiftError::Config("storage.shards must be > 0".into()));
        }
        if self.query.nprobe == 0 {
            return Err(SiftError::Config("query.nprobe must be > 0".into()));
        }
        if self.query.overshoot_factor == 0 {
            return Err(SiftError::Config("query.overshoot_factor must be > 0".into()));
        }
        if self.query.default_k == 0 || self.query.default_k > self.query.max_k {
            return Err(SiftError::Config(format!(
                "query.default_k ({}) must be in 1..={}",
                self.query.default_k, self.query.max_k
            )));
        }
        Ok(())
    }

    /// Absolute data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.storage.database_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir().join(&self.index.index_file)
    }
}

/// Expand `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the database and the persisted index.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.sift/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Durable medium backing the Embedding Store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Nothing survives a restart. Used by tests and scratch runs.
    Memory,
}

/// Embedding Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file name, relative to the data directory.
    pub database_file: String,
    /// Number of lock shards for the in-memory record map.
    pub shards: usize,
    /// Deadline applied to store reads and writes (0 disables).
    pub operation_timeout_ms: u64,
    /// Backoff hint returned with storage failures.
    pub retry_after_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_file: "sift.db".to_string(),
            shards: 16,
            operation_timeout_ms: 5_000,
            retry_after_ms: 250,
        }
    }
}

/// Vector Index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Embedding dimension D. Fixed per deployment.
    pub embedding_dim: usize,
    /// Lower bound on the partition count.
    pub min_partitions: usize,
    /// Upper bound on the partition count (k is about sqrt(N) in between).
    pub max_partitions: usize,
    /// Lloyd iterations per build.
    pub kmeans_iterations: usize,
    /// Largest-to-mean partition size ratio that marks the index as drifted.
    pub imbalance_threshold: f64,
    /// Insertions and deletions since the last build before a rebuild is scheduled.
    pub drift_budget: usize,
    /// Write centroids and membership after each build.
    pub persist: bool,
    /// Persisted index file name, relative to the data directory.
    pub index_file: String,
    /// Load or build the index when the engine opens.
    pub build_on_startup: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            min_partitions: 1,
            max_partitions: 4096,
            kmeans_iterations: 12,
            imbalance_threshold: 4.0,
            drift_budget: 1_000,
            persist: true,
            index_file: "index.json".to_string(),
            build_on_startup: true,
        }
    }
}

/// Query Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_k: usize,
    /// Requests above this are clamped.
    pub max_k: usize,
    /// Partitions probed per query.
    pub nprobe: usize,
    /// Approximate candidates requested per wanted result.
    pub overshoot_factor: usize,
    /// Corpus size at or below which `auto` mode scans exactly (0 disables).
    pub brute_force_threshold: usize,
    pub default_mode: SearchMode,
    /// Deadline applied to a whole query (0 disables).
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            max_k: 1_000,
            nprobe: 8,
            overshoot_factor: 4,
            brute_force_threshold: 0,
            default_mode: SearchMode::Approximate,
            timeout_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = SiftConfig::default();
        assert_eq!(config.general.data_dir, "~/.sift/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.shards, 16);
        assert_eq!(config.index.embedding_dim, 384);
        assert_eq!(config.index.drift_budget, 1_000);
        assert_eq!(config.query.default_k, 10);
        assert_eq!(config.query.overshoot_factor, 4);
        assert_eq!(config.query.default_mode, SearchMode::Approximate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[storage]
backend = "memory"
shards = 4

[index]
embedding_dim = 4
drift_budget = 50
imbalance_threshold = 3.0

[query]
nprobe = 2
default_mode = "auto"
brute_force_threshold = 1000
"#;
        let file = create_temp_config(content);
        let config = SiftConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.shards, 4);
        assert_eq!(config.index.embedding_dim, 4);
        assert_eq!(config.index.drift_budget, 50);
        assert_eq!(config.query.nprobe, 2);
        assert_eq!(config.query.default_mode, SearchMode::Auto);
        assert_eq!(config.query.brute_force_threshold, 1000);
        // Untouched fields keep their defaults.
        assert_eq!(config.query.default_k, 10);
        assert_eq!(config.index.index_file, "index.json");
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = SiftConfig::load(file.path()).unwrap();
        assert_eq!(config.index.embedding_dim, 384);
        assert_eq!(config.storage.database_file, "sift.db");
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(matches!(
            SiftConfig::load(file.path()),
            Err(SiftError::Config(_))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = create_temp_config("[index]\nembedding_dim = 0\n");
        assert!(matches!(
            SiftConfig::load(file.path()),
            Err(SiftError::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = SiftConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.sift/data");
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = SiftConfig::default();
        config.index.embedding_dim = 8;
        config.query.default_mode = SearchMode::Exact;
        config.save(&path).unwrap();

        let reloaded = SiftConfig::load(&path).unwrap();
        assert_eq!(reloaded.index.embedding_dim, 8);
        assert_eq!(reloaded.query.default_mode, SearchMode::Exact);
        assert_eq!(reloaded.storage.shards, config.storage.shards);
    }

    #[test]
    fn test_validate_catches_each_bound() {
        let mut c = SiftConfig::default();
        c.index.max_partitions = 0;
        assert!(c.validate().is_err());

        let mut c = SiftConfig::default();
        c.index.imbalance_threshold = 0.5;
        assert!(c.validate().is_err());

        let mut c = SiftConfig::default();
        c.query.overshoot_factor = 0;
        assert!(c.validate().is_err());

        let mut c = SiftConfig::default();
        c.query.nprobe = 0;
        assert!(c.validate().is_err());

        let mut c = SiftConfig::default();
        c.query.default_k = c.query.max_k + 1;
        assert!(c.validate().is_err());

        let mut c = SiftConfig::default();
        c.storage.shards = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_paths_join_data_dir() {
        let mut config = SiftConfig::default();
        config.general.data_dir = "/var/lib/sift".to_string();
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/sift/sift.db"));
        assert_eq!(config.index_path(), PathBuf::from("/var/lib/sift/index.json"));
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        assert!(!expand_home("~/x").starts_with("~"));
    }
}
