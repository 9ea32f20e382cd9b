//! Per-frame orchestration: quality gate, batch match, liveness, confirmation.
//!
//! Every detection in a frame gets exactly one [`Decision`], in input order.
//! A detection is rejected as soon as one stage turns it away; the stages
//! after it never see it.

use crate::config::{ConfigError, PipelineConfig};
use crate::frame::{FrameError, FrameRecord};
use crate::gallery::Gallery;
use crate::liveness::{LivenessScorer, TrackKey};
use crate::quality::QualityGate;
use crate::tracker::{ConfirmationTracker, TrackStatus};
use crate::types::{Decision, Detection, Embedding, RejectReason};
use image::GrayImage;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct Pipeline {
    config: PipelineConfig,
    gallery: Arc<Gallery>,
    quality: QualityGate,
    liveness: LivenessScorer,
    tracker: ConfirmationTracker,
    /// Gallery generation the tracker's evidence was gathered against.
    generation: Option<u64>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, gallery: Arc<Gallery>) -> Result<Self, ConfigError> {
        config.validate()?;
        if gallery.dim() != config.matching.embedding_dim {
            return Err(ConfigError::Invalid {
                field: "matching.embedding_dim",
                message: format!(
                    "gallery stores {}-dimensional embeddings, config expects {}",
                    gallery.dim(),
                    config.matching.embedding_dim
                ),
            });
        }
        Ok(Self {
            quality: QualityGate::new(config.quality.clone()),
            liveness: LivenessScorer::new(config.liveness.clone()),
            tracker: ConfirmationTracker::new(config.tracking.clone()),
            config,
            gallery,
            generation: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Number of names currently holding a confirmation window.
    pub fn active_tracks(&self) -> usize {
        self.tracker.len()
    }

    /// Drop all liveness and confirmation state, as on a stream restart.
    pub fn reset(&mut self) {
        self.tracker.clear();
        self.liveness.clear();
        self.generation = None;
    }

    fn comparable(&self, embedding: &Embedding) -> bool {
        embedding.dim() == self.config.matching.embedding_dim && embedding.is_finite()
    }

    /// Decode the record's image and run it through [`Pipeline::process_frame`].
    pub fn process_record(
        &mut self,
        record: &FrameRecord,
        base: Option<&Path>,
    ) -> Result<Vec<Decision>, FrameError> {
        let timestamp = record.stream_time()?;
        let frame = record.load_image(base)?;
        Ok(self.process_frame(timestamp, &frame, &record.detections))
    }

    /// Decide every detection of one frame, in input order.
    pub fn process_frame(
        &mut self,
        timestamp: Duration,
        frame: &GrayImage,
        detections: &[Detection],
    ) -> Vec<Decision> {
        let mut decisions: Vec<Option<Decision>> = vec![None; detections.len()];

        let mut survivors = Vec::with_capacity(detections.len());
        for (i, det) in detections.iter().enumerate() {
            let report = self.quality.assess(frame, &det.bounding_box);
            if !report.passed {
                tracing::debug!(detection = i, scores = ?report.scores, "low quality face");
                decisions[i] = Some(Decision::Rejected {
                    reason: RejectReason::LowQuality,
                });
            } else if !self.comparable(&det.embedding) {
                tracing::debug!(detection = i, dim = det.embedding.dim(), "embedding not comparable");
                decisions[i] = Some(Decision::Rejected {
                    reason: RejectReason::Unmatched,
                });
            } else {
                survivors.push(i);
            }
        }

        let queries: Vec<&Embedding> = survivors.iter().map(|&i| &detections[i].embedding).collect();
        let (generation, matches) = self
            .gallery
            .match_batch_versioned(&queries, self.config.matching.threshold);
        if self.generation != Some(generation) {
            if self.generation.is_some() {
                tracing::info!(generation, "gallery changed, confirmation windows reset");
            }
            self.tracker.clear();
            self.generation = Some(generation);
        }

        // Closest live detection per name, so one face cannot feed a window twice.
        let mut candidates: BTreeMap<String, (usize, f32)> = BTreeMap::new();
        for (&i, hit) in survivors.iter().zip(matches) {
            let Some(hit) = hit else {
                decisions[i] = Some(Decision::Unknown);
                continue;
            };
            let det = &detections[i];
            let key = TrackKey::for_detection(det, &hit.name);
            let verdict = self.liveness.check(key, timestamp, frame, &det.landmarks);
            if !verdict.is_live {
                tracing::warn!(name = %hit.name, score = verdict.score, "spoof suspected");
                decisions[i] = Some(Decision::Rejected {
                    reason: RejectReason::SpoofSuspected,
                });
                continue;
            }
            match candidates.get(&hit.name).copied() {
                Some((_, best)) if best <= hit.distance => {
                    decisions[i] = Some(Decision::Unknown);
                }
                Some((other, _)) => {
                    decisions[other] = Some(Decision::Unknown);
                    candidates.insert(hit.name, (i, hit.distance));
                }
                None => {
                    candidates.insert(hit.name, (i, hit.distance));
                }
            }
        }

        for (name, (i, distance)) in candidates {
            let update = self.tracker.update(&name, timestamp, distance);
            decisions[i] = Some(match update.status {
                TrackStatus::Confirmed => Decision::Confirmed { name },
                TrackStatus::Candidate => Decision::Unknown,
            });
        }

        self.tracker.advance();
        self.liveness.advance();

        decisions
            .into_iter()
            .map(|d| d.unwrap_or(Decision::Unknown))
            .collect()
    }
}
