use facegate_core::{Decision, FrameError, FrameRecord, Pipeline};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Running counters for the status call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub frames: u64,
    pub detections: u64,
    pub confirmed: u64,
    pub rejected: u64,
    pub active_tracks: usize,
}

impl EngineStats {
    fn record(&mut self, decisions: &[Decision]) {
        self.frames += 1;
        self.detections += decisions.len() as u64;
        for d in decisions {
            match d {
                Decision::Confirmed { .. } => self.confirmed += 1,
                Decision::Rejected { .. } => self.rejected += 1,
                Decision::Unknown => {}
            }
        }
    }
}

/// Messages sent from the frame reader and D-Bus handlers to the engine thread.
enum EngineRequest {
    Process {
        record: FrameRecord,
        reply: oneshot::Sender<Result<Vec<Decision>, EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Decode one frame and run it through the pipeline.
    pub async fn process(&self, record: FrameRecord) -> Result<Vec<Decision>, EngineError> {
        self.request(|reply| EngineRequest::Process { record, reply })
            .await?
    }

    /// Drop all liveness and confirmation state.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Reset { reply }).await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.request(|reply| EngineRequest::Stats { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline and handles requests one at a time, so
/// frames are decided strictly in arrival order. It exits once every
/// handle has been dropped.
pub fn spawn_engine(
    mut pipeline: Pipeline,
    frame_dir: Option<PathBuf>,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut stats = EngineStats::default();
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Process { record, reply } => {
                        let result = pipeline
                            .process_record(&record, frame_dir.as_deref())
                            .map_err(EngineError::from);
                        match &result {
                            Ok(decisions) => {
                                stats.record(decisions);
                                tracing::debug!(
                                    timestamp = record.timestamp,
                                    detections = decisions.len(),
                                    "frame processed"
                                );
                            }
                            Err(err) => {
                                tracing::warn!(timestamp = record.timestamp, error = %err, "frame skipped");
                            }
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reset { reply } => {
                        pipeline.reset();
                        tracing::info!("pipeline state reset");
                        let _ = reply.send(());
                    }
                    EngineRequest::Stats { reply } => {
                        let _ = reply.send(EngineStats {
                            active_tracks: pipeline.active_tracks(),
                            ..stats.clone()
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{BoundingBox, Detection, Embedding, EmbeddingStore, Gallery, PipelineConfig};
    use image::{GrayImage, Luma};
    use std::sync::Arc;

    fn pipeline() -> Pipeline {
        let gallery = Gallery::new(EmbeddingStore::open_in_memory(2).unwrap()).unwrap();
        gallery.enroll("Alice", Embedding::new(vec![1.0, 0.0])).unwrap();
        let mut config = PipelineConfig::default();
        config.matching.embedding_dim = 2;
        config.tracking.confirm_frames = 2;
        config.liveness.threshold = 0.0;
        Pipeline::new(config, Arc::new(gallery)).unwrap()
    }

    fn record(timestamp: f64) -> FrameRecord {
        FrameRecord {
            timestamp,
            image: PathBuf::from("frame.png"),
            detections: vec![Detection {
                bounding_box: BoundingBox::new(10.0, 10.0, 100.0, 100.0),
                landmarks: Vec::new(),
                embedding: Embedding::new(vec![1.0, 0.0]),
                track_id: Some(1),
            }],
        }
    }

    fn write_frame(dir: &std::path::Path) {
        GrayImage::from_fn(128, 128, |x, y| {
            if ((x / 2) + (y / 2)) % 2 == 0 {
                Luma([60])
            } else {
                Luma([200])
            }
        })
        .save(dir.join("frame.png"))
        .unwrap();
    }

    #[tokio::test]
    async fn test_engine_confirms_across_requests() {
        let dir = tempfile::tempdir().unwrap();
        write_frame(dir.path());
        let engine = spawn_engine(pipeline(), Some(dir.path().to_path_buf()), 4).unwrap();

        assert_eq!(engine.process(record(0.0)).await.unwrap(), vec![Decision::Unknown]);
        assert_eq!(
            engine.process(record(0.1)).await.unwrap(),
            vec![Decision::Confirmed {
                name: "Alice".into()
            }]
        );

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.active_tracks, 1);

        engine.reset().await.unwrap();
        assert_eq!(engine.stats().await.unwrap().active_tracks, 0);
    }

    #[tokio::test]
    async fn test_missing_image_is_frame_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(pipeline(), Some(dir.path().to_path_buf()), 4).unwrap();
        let err = engine.process(record(0.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Frame(FrameError::Decode { .. })), "got {err}");
        assert_eq!(engine.stats().await.unwrap().frames, 0);
    }
}
