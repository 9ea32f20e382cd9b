use anyhow::{Context, Result};
use facegate_core::{Decision, EmbeddingStore, FrameRecord, Gallery, Pipeline};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use engine::{EngineError, EngineHandle};

/// One line of daemon output.
#[derive(Serialize)]
struct FrameOutcome {
    timestamp: f64,
    decisions: Vec<Decision>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the decision stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = config::Config::from_env();
    tracing::info!(db = %config.db_path.display(), "facegated starting");

    let pipeline_config = config
        .pipeline_config()
        .context("failed to load pipeline configuration")?;

    let store = EmbeddingStore::open(&config.db_path, pipeline_config.matching.embedding_dim)
        .with_context(|| format!("failed to open store {}", config.db_path.display()))?;
    let gallery = Arc::new(Gallery::new(store).context("failed to index enrolled identities")?);
    tracing::info!(
        identities = gallery.len(),
        dim = gallery.dim(),
        threshold = pipeline_config.matching.threshold,
        "gallery loaded"
    );

    let pipeline = Pipeline::new(pipeline_config, Arc::clone(&gallery))?;
    let engine = engine::spawn_engine(pipeline, config.frame_dir.clone(), config.queue_depth)?;

    let bus = if config.dbus_enabled {
        let service = dbus_interface::ControlService::new(Arc::clone(&gallery), engine.clone());
        let conn = zbus::connection::Builder::session()?
            .name(dbus_interface::BUS_NAME)?
            .serve_at(dbus_interface::OBJECT_PATH, service)?
            .build()
            .await
            .context("failed to register control service on the session bus")?;
        tracing::info!(name = dbus_interface::BUS_NAME, "control service registered");
        Some(conn)
    } else {
        tracing::info!("control service disabled via FACEGATE_DBUS=0");
        None
    };

    tracing::info!("facegated ready");

    tokio::select! {
        res = run_stream(engine) => {
            res?;
            if bus.is_some() {
                tracing::info!("frame input closed; control service stays up until signalled");
                tokio::signal::ctrl_c().await?;
            }
        }
        res = tokio::signal::ctrl_c() => res?,
    }
    tracing::info!("facegated shutting down");

    Ok(())
}

/// Read JSON frame records from stdin and write one decision line per frame.
///
/// Malformed lines and undecodable frames are logged and skipped.
async fn run_stream(engine: EngineHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record: FrameRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed frame record");
                continue;
            }
        };
        let timestamp = record.timestamp;
        let decisions = match engine.process(record).await {
            Ok(decisions) => decisions,
            Err(EngineError::Frame(_)) => continue,
            Err(err) => return Err(err.into()),
        };

        let mut out = serde_json::to_vec(&FrameOutcome {
            timestamp,
            decisions,
        })?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    tracing::info!("frame input closed");
    Ok(())
}
