//! On-disk form of the vector index.
//!
//! Only centroids and partition membership are written; embeddings stay in
//! the Embedding Store. The file can always be deleted, at the cost of a full
//! rebuild on the next start.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::error::Result;
use sift_core::types::{DocId, Generation};

pub const FORMAT_VERSION: u32 = 1;

/// Serialized index: centroids plus the identifiers assigned to each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub version: u32,
    pub generation: Generation,
    pub dimension: usize,
    pub centroids: Vec<Vec<f32>>,
    pub partitions: Vec<Vec<DocId>>,
    #[serde(default)]
    pub tombstones: Vec<DocId>,
}

impl PersistedIndex {
    /// Write to `path` through a temporary file and a rename, so readers
    /// never see a half-written index.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(path);
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), generation = self.generation, "Index persisted");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
