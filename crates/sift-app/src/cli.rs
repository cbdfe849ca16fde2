//! CLI argument definitions for the sift binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sift_core::config::SiftConfig;
use sift_core::types::SearchMode;
use sift_vector::transfer::DEFAULT_IMPORT_BATCH;

/// sift: a vector similarity search engine for embedded documents.
#[derive(Parser, Debug)]
#[command(name = "sift", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the database and the persisted index.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import documents from a JSONL file, one document per line.
    Ingest {
        file: PathBuf,
        /// Documents per ingestion batch.
        #[arg(long, default_value_t = DEFAULT_IMPORT_BATCH)]
        batch_size: usize,
    },
    /// Embed a piece of text and store it.
    Add {
        #[arg(long)]
        text: String,
        /// Document identifier; a random UUID when omitted.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Find the documents nearest to a vector or a piece of text.
    Query {
        /// Query embedding as a JSON array.
        #[arg(long, conflicts_with = "text", required_unless_present = "text")]
        vector: Option<String>,
        /// Text to embed and search for.
        #[arg(long)]
        text: Option<String>,
        /// Number of results (defaults to query.default_k).
        #[arg(short = 'k', long)]
        k: Option<usize>,
        /// approximate, exact or auto.
        #[arg(long)]
        mode: Option<SearchMode>,
    },
    /// Delete a document by identifier.
    Delete { id: String },
    /// Rebuild the index from the stored documents.
    Rebuild,
    /// Print store and index statistics.
    Stats,
    /// Write every stored document to a JSONL file.
    Export { file: PathBuf },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > SIFT_CONFIG env var > platform default (~/.sift/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("SIFT_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Apply --data-dir and --log-level on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut SiftConfig) {
        if let Some(ref dir) = self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(ref level) = self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".sift").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".sift").join("config.toml");
    }
    PathBuf::from("config.toml")
}
