//! Database schema migrations.
//!
//! Applies the initial schema: the documents table, the store_meta table
//! holding the persisted generation, and schema_migrations.

use rusqlite::Connection;
use tracing::info;

use sift_core::error::{Result, SiftError};

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| SiftError::storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SiftError::storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: one row per document identifier.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            id          TEXT PRIMARY KEY NOT NULL,
            dimension   INTEGER NOT NULL,
            embedding   BLOB NOT NULL,
            metadata    TEXT NOT NULL DEFAULT '{}',
            generation  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_documents_generation
            ON documents (generation);

        CREATE TABLE IF NOT EXISTS store_meta (
            key     TEXT PRIMARY KEY NOT NULL,
            value   INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO store_meta (key, value) VALUES ('generation', 0);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| SiftError::storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
