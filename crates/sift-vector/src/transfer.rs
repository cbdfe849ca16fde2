//! JSONL import and export.
//!
//! Import reads one [`IncomingDocument`] per line and feeds them to the
//! pipeline in chunks. A malformed line is reported with its line number and
//! skipped. Export writes every stored record, embedding and generation
//! included, in identifier order.

use std::io::{BufRead, Write};

use serde::Serialize;
use tracing::{info, warn};

use sift_core::error::Result;
use sift_core::types::IncomingDocument;

use crate::pipeline::{BatchSummary, IngestionPipeline, RejectedItem};
use crate::store::EmbeddingStore;

/// Documents handed to the pipeline per batch during import.
pub const DEFAULT_IMPORT_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineError {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Non-blank lines read.
    pub lines: usize,
    pub accepted: usize,
    pub changed: usize,
    pub rejected: usize,
    /// Lines that did not parse as a document.
    pub malformed: Vec<LineError>,
    /// Documents that parsed but were refused by the pipeline.
    pub errors: Vec<RejectedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
}

impl ImportReport {
    fn absorb(&mut self, summary: BatchSummary) {
        self.accepted += summary.accepted;
        self.changed += summary.inserted + summary.updated;
        self.rejected += summary.rejected;
        self.errors.extend(summary.errors);
        self.generation = self.generation.max(summary.generation);
    }
}

/// Import documents from a JSONL stream.
///
/// Only I/O errors on the reader abort the import.
pub fn import_jsonl<R: BufRead>(
    pipeline: &IngestionPipeline,
    reader: R,
    batch_size: usize,
) -> Result<ImportReport> {
    let batch_size = batch_size.max(1);
    let mut report = ImportReport::default();
    let mut batch = Vec::with_capacity(batch_size);

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        report.lines += 1;
        match serde_json::from_str::<IncomingDocument>(trimmed) {
            Ok(doc) => batch.push(doc),
            Err(e) => {
                warn!(line = n + 1, error = %e, "Skipping malformed line");
                report.malformed.push(LineError {
                    line: n + 1,
                    error: e.to_string(),
                });
            }
        }
        if batch.len() >= batch_size {
            let docs = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            report.absorb(pipeline.ingest_batch(docs).summary());
        }
    }
    if !batch.is_empty() {
        report.absorb(pipeline.ingest_batch(batch).summary());
    }

    info!(
        lines = report.lines,
        accepted = report.accepted,
        rejected = report.rejected,
        malformed = report.malformed.len(),
        "Import finished"
    );
    Ok(report)
}

/// Write every stored document as one JSON object per line. Returns the
/// number of documents written.
pub fn export_jsonl<W: Write>(store: &EmbeddingStore, mut writer: W) -> Result<usize> {
    let snapshot = store.snapshot();
    for record in &snapshot {
        serde_json::to_writer(&mut writer, record.as_ref())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    info!(
        documents = snapshot.len(),
        generation = snapshot.generation(),
        "Export finished"
    );
    Ok(snapshot.len())
}
