//! Document repository over the SQLite database.
//!
//! Each document is one row keyed by identifier: the embedding as fixed-width
//! little-endian f32 values, the metadata as JSON, and the generation in which
//! the row was written. The store generation lives in `store_meta` and is
//! advanced in the same transaction as every upsert or delete.

use std::sync::Arc;

use chrono::Utc;

use rusqlite::{params, OptionalExtension, Row};

use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError};
use sift_core::types::{DocId, DocumentMetadata, DocumentRecord, Generation};

use crate::db::Database;

/// Encode an embedding as little-endian f32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes written by [`encode_embedding`].
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SiftError::Serialization(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Repository for stored documents.
#[derive(Debug, Clone)]
pub struct DocumentRepository {
    db: Arc<Database>,
}

impl DocumentRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a document and advance the persisted generation.
    pub fn upsert(&self, record: &DocumentRecord, deadline: Deadline) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let embedding = encode_embedding(&record.embedding);

        self.db.with_conn_mut_until(deadline, |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| SiftError::storage(format!("Failed to begin transaction: {}", e)))?;
            tx.execute(
                "INSERT INTO documents (id, dimension, embedding, metadata, generation, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    dimension = excluded.dimension,
                    embedding = excluded.embedding,
                    metadata = excluded.metadata,
                    generation = excluded.generation,
                    updated_at = excluded.updated_at",
                params![
                    record.id.as_str(),
                    record.embedding.len() as i64,
                    embedding,
                    metadata,
                    record.generation as i64,
                    Utc::now().timestamp(),
                ],
            )
            .map_err(|e| SiftError::storage(format!("Failed to save document: {}", e)))?;
            bump_generation(&tx, record.generation)?;
            tx.commit()
                .map_err(|e| SiftError::storage(format!("Failed to commit document: {}", e)))?;
            Ok(())
        })
    }

    /// Delete a document, recording `generation` as the store generation.
    ///
    /// Returns whether a row existed.
    pub fn delete(&self, id: &DocId, generation: Generation, deadline: Deadline) -> Result<bool> {
        self.db.with_conn_mut_until(deadline, |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| SiftError::storage(format!("Failed to begin transaction: {}", e)))?;
            let removed = tx
                .execute("DELETE FROM documents WHERE id = ?1", params![id.as_str()])
                .map_err(|e| SiftError::storage(format!("Failed to delete document: {}", e)))?;
            if removed > 0 {
                bump_generation(&tx, generation)?;
            }
            tx.commit()
                .map_err(|e| SiftError::storage(format!("Failed to commit delete: {}", e)))?;
            Ok(removed > 0)
        })
    }

    /// Load every stored document, ordered by identifier.
    pub fn load_all(&self) -> Result<Vec<DocumentRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, embedding, metadata, generation
                     FROM documents ORDER BY id ASC",
                )
                .map_err(|e| SiftError::storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok(row_to_record(row)))
                .map_err(|e| SiftError::storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                let record = row.map_err(|e| SiftError::storage(e.to_string()))??;
                records.push(record);
            }
            Ok(records)
        })
    }

    /// The persisted store generation.
    pub fn generation(&self) -> Result<Generation> {
        self.db.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM store_meta WHERE key = 'generation'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| SiftError::storage(e.to_string()))?;
            Ok(value.unwrap_or(0).max(0) as Generation)
        })
    }
}

fn bump_generation(conn: &rusqlite::Connection, generation: Generation) -> Result<()> {
    conn.execute(
        "UPDATE store_meta SET value = MAX(value, ?1) WHERE key = 'generation'",
        params![generation as i64],
    )
    .map_err(|e| SiftError::storage(format!("Failed to record generation: {}", e)))?;
    Ok(())
}

/// Convert a documents row into a DocumentRecord.
fn row_to_record(row: &Row) -> Result<DocumentRecord> {
    let id: String = row.get(0).map_err(|e| SiftError::storage(e.to_string()))?;
    let blob: Vec<u8> = row.get(1).map_err(|e| SiftError::storage(e.to_string()))?;
    let metadata: String = row.get(2).map_err(|e| SiftError::storage(e.to_string()))?;
    let generation: i64 = row.get(3).map_err(|e| SiftError::storage(e.to_string()))?;

    let id = DocId::new(id).map_err(|e| SiftError::Serialization(e.to_string()))?;
    let metadata: DocumentMetadata = serde_json::from_str(&metadata)?;

    Ok(DocumentRecord {
        id,
        embedding: decode_embedding(&blob)?,
        metadata,
        generation: generation.max(0) as Generation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_repo() -> DocumentRepository {
        DocumentRepository::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn find(repo: &DocumentRepository, id: &DocId) -> Option<DocumentRecord> {
        repo.load_all().unwrap().into_iter().find(|r| &r.id == id)
    }

    fn count(repo: &DocumentRepository) -> usize {
        repo.load_all().unwrap().len()
    }

    fn make_record(id: &str, embedding: Vec<f32>, generation: Generation) -> DocumentRecord {
        DocumentRecord {
            id: DocId::new(id).unwrap(),
            embedding,
            metadata: DocumentMetadata::titled(format!("title {}", id)),
            generation,
        }
    }

    #[test]
    fn test_encode_decode_embedding() {
        let v = vec![1.0f32, -0.5, 0.25, f32::MIN_POSITIVE];
        let bytes = encode_embedding(&v);
        assert_eq!(bytes.len(), 16);
        assert_eq!(decode_embedding(&bytes).unwrap(), v);
    }

    #[test]
    fn test_decode_rejects_truncated_blob() {
        assert!(matches!(
            decode_embedding(&[0u8, 1, 2]),
            Err(SiftError::Serialization(_))
        ));
    }

    #[test]
    fn test_upsert_and_find() {
        let repo = make_repo();
        let record = make_record("a", vec![1.0, 0.0, 0.0], 1);
        repo.upsert(&record, Deadline::none()).unwrap();

        let found = find(&repo, &record.id).unwrap();
        assert_eq!(found, record);
        assert_eq!(count(&repo), 1);
        assert_eq!(repo.generation().unwrap(), 1);
    }

    #[test]
    fn test_upsert_stamps_updated_at() {
        let repo = make_repo();
        let before = Utc::now().timestamp();
        repo.upsert(&make_record("a", vec![1.0], 1), Deadline::none())
            .unwrap();
        let after = Utc::now().timestamp();

        let updated_at: i64 = repo
            .db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT updated_at FROM documents WHERE id = 'a'",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| SiftError::storage(e.to_string()))
            })
            .unwrap();
        assert!((before..=after).contains(&updated_at));
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let repo = make_repo();
        repo.upsert(&make_record("a", vec![1.0, 0.0], 1), Deadline::none())
            .unwrap();
        let newer = make_record("a", vec![0.0, 1.0], 2);
        repo.upsert(&newer, Deadline::none()).unwrap();

        assert_eq!(count(&repo), 1);
        assert_eq!(find(&repo, &newer.id).unwrap().embedding, vec![0.0, 1.0]);
        assert_eq!(repo.generation().unwrap(), 2);
    }

    #[test]
    fn test_generation_never_regresses() {
        let repo = make_repo();
        repo.upsert(&make_record("a", vec![1.0], 5), Deadline::none())
            .unwrap();
        repo.upsert(&make_record("b", vec![1.0], 3), Deadline::none())
            .unwrap();
        assert_eq!(repo.generation().unwrap(), 5);
    }

    #[test]
    fn test_delete() {
        let repo = make_repo();
        let record = make_record("a", vec![1.0], 1);
        repo.upsert(&record, Deadline::none()).unwrap();

        assert!(repo.delete(&record.id, 2, Deadline::none()).unwrap());
        assert!(find(&repo, &record.id).is_none());
        assert_eq!(repo.generation().unwrap(), 2);

        assert!(!repo.delete(&record.id, 3, Deadline::none()).unwrap());
        assert_eq!(repo.generation().unwrap(), 2);
    }

    #[test]
    fn test_load_all_ordered_by_id() {
        let repo = make_repo();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            repo.upsert(&make_record(id, vec![i as f32 + 1.0], i as u64 + 1), Deadline::none())
                .unwrap();
        }
        let ids: Vec<String> = repo
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_metadata_extra_fields_survive() {
        let repo = make_repo();
        let mut record = make_record("a", vec![1.0], 1);
        record
            .metadata
            .extra
            .insert("url".into(), serde_json::json!("https://example.org"));
        repo.upsert(&record, Deadline::none()).unwrap();
        let found = find(&repo, &record.id).unwrap();
        assert_eq!(found.metadata.extra["url"], "https://example.org");
    }

    #[test]
    fn test_find_missing_returns_none() {
        let repo = make_repo();
        assert!(find(&repo, &DocId::new("nope").unwrap()).is_none());
    }

    #[test]
    fn test_file_backed_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");
        {
            let repo = DocumentRepository::new(Arc::new(Database::new(&path).unwrap()));
            repo.upsert(&make_record("a", vec![0.5, 0.5], 4), Deadline::none())
                .unwrap();
        }
        let repo = DocumentRepository::new(Arc::new(Database::new(&path).unwrap()));
        assert_eq!(count(&repo), 1);
        assert_eq!(repo.generation().unwrap(), 4);
    }
}
