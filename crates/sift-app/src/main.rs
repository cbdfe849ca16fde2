//! sift application binary - composition root.
//!
//! 1. Parse the command line and load configuration from TOML
//! 2. Install structured logging on stderr
//! 3. Open the engine (SQLite store, persisted or rebuilt index)
//! 4. Run one command and print its result as JSON on stdout

mod cli;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;

use sift_core::config::SiftConfig;
use sift_core::types::{DocId, DocumentMetadata, QueryRequest};
use sift_vector::embedding::{DynEmbeddingService, MockEmbedding};
use sift_vector::transfer::{export_jsonl, import_jsonl};
use sift_vector::SiftEngine;

use cli::{CliArgs, Command};

/// How long a write command waits for the index to acknowledge its writes.
const ACK_TIMEOUT: Duration = Duration::from_secs(60);

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait until the served index covers `generation`, if anything was written.
async fn await_index(engine: &SiftEngine, generation: Option<u64>) {
    let Some(generation) = generation else { return };
    if let Err(e) = engine
        .coordinator()
        .wait_for_generation(generation, ACK_TIMEOUT)
        .await
    {
        tracing::warn!(generation, error = %e, "Index did not acknowledge writes in time");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = SiftConfig::load_or_default(&config_file);
    args.apply_overrides(&mut config);

    // Tracing. Stdout carries command output, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.general.log_level)),
        )
        .init();

    tracing::debug!(path = %config_file.display(), "Configuration loaded");

    let embedder: Arc<dyn DynEmbeddingService> =
        Arc::new(MockEmbedding::new(config.index.embedding_dim));
    let default_k = config.query.default_k;
    let engine = SiftEngine::open(config)?.with_embedder(Arc::clone(&embedder));

    match args.command {
        Command::Ingest { file, batch_size } => {
            let reader = BufReader::new(File::open(&file)?);
            let report = import_jsonl(engine.pipeline(), reader, batch_size)?;
            await_index(&engine, report.generation).await;
            print_json(&report)?;
        }
        Command::Add {
            text,
            id,
            title,
            category,
        } => {
            let id = match id {
                Some(id) => DocId::new(id)?,
                None => DocId::new(uuid::Uuid::new_v4().to_string())?,
            };
            let metadata = DocumentMetadata {
                title: title.unwrap_or_default(),
                summary: text.clone(),
                category: category.unwrap_or_default(),
                timestamp: Some(chrono::Utc::now()),
                ..Default::default()
            };
            let put = engine.pipeline().ingest_text(id, &text, metadata).await?;
            if put.is_changed() {
                await_index(&engine, Some(put.generation())).await;
            }
            print_json(&json!({
                "id": put.record.id,
                "change": put.change,
                "generation": put.generation(),
            }))?;
        }
        Command::Query {
            vector,
            text,
            k,
            mode,
        } => {
            let embedding: Vec<f32> = match (vector, text) {
                (Some(vector), _) => serde_json::from_str(&vector)?,
                (None, Some(text)) => embedder.embed_boxed(&text).await?,
                (None, None) => return Err("either --vector or --text is required".into()),
            };
            let mut request = QueryRequest::new(embedding, k.unwrap_or(default_k));
            request.mode = mode;
            let results = engine.query(&request)?;
            print_json(&results)?;
        }
        Command::Delete { id } => {
            let id = DocId::new(id)?;
            let generation = engine.delete(&id)?;
            await_index(&engine, generation).await;
            print_json(&json!({
                "id": id,
                "deleted": generation.is_some(),
                "generation": generation,
            }))?;
        }
        Command::Rebuild => {
            let index = engine.rebuild().await?;
            print_json(&index.stats())?;
        }
        Command::Stats => {
            print_json(&engine.stats())?;
        }
        Command::Export { file } => {
            let writer = BufWriter::new(File::create(&file)?);
            let count = export_jsonl(engine.store(), writer)?;
            print_json(&json!({
                "path": file.display().to_string(),
                "documents": count,
            }))?;
        }
    }

    Ok(())
}
