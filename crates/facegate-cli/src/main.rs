use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{Decision, Embedding, EmbeddingStore, FrameRecord, Gallery, Pipeline, PipelineConfig};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const BUS_NAME: &str = "org.facegate.Control1";
const OBJECT_PATH: &str = "/org/facegate/Control1";

#[derive(Parser)]
#[command(name = "facegate", about = "facegate identity verification CLI")]
struct Cli {
    /// Enrolled-face database (default: $XDG_DATA_HOME/facegate/faces.db)
    #[arg(long, global = true, env = "FACEGATE_DB_PATH")]
    db: Option<PathBuf>,

    /// Pipeline configuration TOML
    #[arg(long, global = true, env = "FACEGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll or re-enroll an identity from an embedding file
    Enroll {
        /// Identity name
        name: String,
        /// JSON file holding the embedding as an array of numbers
        embedding: PathBuf,
    },
    /// Remove an enrolled identity
    Remove {
        /// Identity name
        name: String,
    },
    /// List enrolled identities
    List,
    /// Find the nearest enrolled identity for an embedding file
    Match {
        /// JSON file holding the embedding as an array of numbers
        embedding: PathBuf,
        /// Override the configured match threshold
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Run a recorded JSON-lines frame log through a fresh pipeline
    Replay {
        /// Frame log, one JSON frame record per line
        frames: PathBuf,
        /// Directory for relative image paths (default: the log's directory)
        #[arg(long)]
        frame_dir: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = cli.db.clone().unwrap_or_else(facegate_core::default_db_path);
    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Enroll { name, embedding } => {
            let embedding = read_embedding(&embedding)?;
            let gallery = open_gallery(&db, &config)?;
            let identity = gallery.enroll(&name, embedding)?;
            println!(
                "Enrolled {} ({} values) at {}",
                identity.name,
                identity.embedding.dim(),
                identity.created_at.to_rfc3339()
            );
        }
        Commands::Remove { name } => {
            let gallery = open_gallery(&db, &config)?;
            match gallery.remove(&name) {
                Ok(removed) => println!("Removed {}", removed.name),
                Err(e) if e.is_not_found() => bail!("no enrolled identity named {name:?}"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::List => {
            let gallery = open_gallery(&db, &config)?;
            let identities = gallery.identities();
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}\t{}\t{}",
                    identity.name,
                    identity.embedding.dim(),
                    identity.created_at.to_rfc3339()
                );
            }
        }
        Commands::Match {
            embedding,
            threshold,
        } => {
            let embedding = read_embedding(&embedding)?;
            let gallery = open_gallery(&db, &config)?;
            let threshold = threshold.unwrap_or(config.matching.threshold);
            match gallery.match_one(&embedding, threshold) {
                Some(hit) => println!("{}\t{:.4}", hit.name, hit.distance),
                None => println!("No match within {threshold}"),
            }
        }
        Commands::Replay { frames, frame_dir } => {
            let gallery = Arc::new(open_gallery(&db, &config)?);
            let mut pipeline = Pipeline::new(config, gallery)?;
            let base = frame_dir.or_else(|| frames.parent().map(Path::to_path_buf));
            let file = std::fs::File::open(&frames)
                .with_context(|| format!("failed to open frame log {}", frames.display()))?;
            let stdout = std::io::stdout();
            let summary = replay(
                &mut pipeline,
                BufReader::new(file),
                base.as_deref(),
                &mut stdout.lock(),
            )?;
            eprintln!(
                "{} frames, {} skipped, {} confirmed decisions",
                summary.frames, summary.skipped, summary.confirmed
            );
        }
        Commands::Status => {
            let conn = zbus::Connection::session()
                .await
                .context("failed to connect to the session bus")?;
            let reply = conn
                .call_method(Some(BUS_NAME), OBJECT_PATH, Some(BUS_NAME), "Status", &())
                .await
                .context("facegated is not reachable")?;
            let status: String = reply.body().deserialize()?;
            println!("{status}");
        }
    }

    Ok(())
}

fn open_gallery(db: &Path, config: &PipelineConfig) -> Result<Gallery> {
    let store = EmbeddingStore::open(db, config.matching.embedding_dim)
        .with_context(|| format!("failed to open store {}", db.display()))?;
    Ok(Gallery::new(store)?)
}

fn read_embedding(path: &Path) -> Result<Embedding> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read embedding {}", path.display()))?;
    let embedding: Embedding = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    if embedding.dim() == 0 {
        bail!("{} holds an empty embedding", path.display());
    }
    Ok(embedding)
}

#[derive(Debug, Default, PartialEq)]
struct ReplaySummary {
    frames: usize,
    skipped: usize,
    confirmed: usize,
}

/// Feed every record of a frame log through `pipeline`, writing one JSON
/// line of decisions per frame. Frames whose image cannot be read are
/// skipped; a malformed record aborts the replay.
fn replay(
    pipeline: &mut Pipeline,
    input: impl BufRead,
    base: Option<&Path>,
    out: &mut impl Write,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    for (n, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FrameRecord = serde_json::from_str(&line)
            .with_context(|| format!("malformed frame record on line {}", n + 1))?;
        let decisions = match pipeline.process_record(&record, base) {
            Ok(decisions) => decisions,
            Err(err) => {
                tracing::warn!(line = n + 1, error = %err, "frame skipped");
                summary.skipped += 1;
                continue;
            }
        };
        summary.frames += 1;
        summary.confirmed += decisions
            .iter()
            .filter(|d| matches!(d, Decision::Confirmed { .. }))
            .count();
        let json = serde_json::json!({
            "timestamp": record.timestamp,
            "decisions": decisions,
        });
        writeln!(out, "{json}")?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.matching.embedding_dim = 3;
        config.tracking.confirm_frames = 2;
        config.liveness.threshold = 0.0;
        config
    }

    #[test]
    fn test_read_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("alice.json");
        std::fs::write(&good, "[1.0, 0.0, 0.5]").unwrap();
        assert_eq!(read_embedding(&good).unwrap().values, vec![1.0, 0.0, 0.5]);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "[]").unwrap();
        assert!(read_embedding(&empty).is_err());

        let junk = dir.path().join("junk.json");
        std::fs::write(&junk, "{\"a\": 1}").unwrap();
        assert!(read_embedding(&junk).is_err());
    }

    #[test]
    fn test_enrollment_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested/faces.db");
        open_gallery(&db, &config())
            .unwrap()
            .enroll("Alice", Embedding::new(vec![1.0, 0.0, 0.0]))
            .unwrap();

        let reopened = open_gallery(&db, &config()).unwrap();
        let hit = reopened.match_one(&Embedding::new(vec![1.0, 0.0, 0.0]), 0.6).unwrap();
        assert_eq!(hit.name, "Alice");
    }

    #[test]
    fn test_replay_writes_one_line_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_fn(128, 128, |x, y| {
            if ((x / 2) + (y / 2)) % 2 == 0 {
                Luma([60])
            } else {
                Luma([200])
            }
        })
        .save(dir.path().join("frame.png"))
        .unwrap();

        let gallery = open_gallery(&dir.path().join("faces.db"), &config()).unwrap();
        gallery.enroll("Alice", Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        let mut pipeline = Pipeline::new(config(), Arc::new(gallery)).unwrap();

        let frame = |t: f64, image: &str| {
            serde_json::json!({
                "timestamp": t,
                "image": image,
                "detections": [{
                    "bbox": {"x": 10.0, "y": 10.0, "width": 100.0, "height": 100.0},
                    "embedding": [1.0, 0.0, 0.0]
                }]
            })
            .to_string()
        };
        let log = [
            frame(0.0, "frame.png"),
            String::new(),
            frame(0.1, "missing.png"),
            frame(0.2, "frame.png"),
        ]
        .join("\n");

        let mut out = Vec::new();
        let summary = replay(&mut pipeline, log.as_bytes(), Some(dir.path()), &mut out).unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                frames: 2,
                skipped: 1,
                confirmed: 1
            }
        );

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["decisions"][0]["decision"], "unknown");
        assert_eq!(lines[1]["decisions"][0]["decision"], "confirmed");
        assert_eq!(lines[1]["decisions"][0]["name"], "Alice");
    }

    #[test]
    fn test_replay_rejects_malformed_record() {
        let gallery = Gallery::new(EmbeddingStore::open_in_memory(3).unwrap()).unwrap();
        let mut pipeline = Pipeline::new(config(), Arc::new(gallery)).unwrap();
        let mut out = Vec::new();
        let err = replay(&mut pipeline, "{not json".as_bytes(), None, &mut out).unwrap_err();
        assert!(err.to_string().contains("line 1"), "got {err}");
    }
}
