//! sift storage crate - SQLite durable medium for the Embedding Store.
//!
//! Provides a WAL-mode SQLite database with migrations and a document
//! repository that persists one row per identifier together with the
//! store generation.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{decode_embedding, encode_embedding, DocumentRepository};
