//! Multi-frame identity confirmation.
//!
//! Each candidate name owns a sliding window of its most recent
//! `(timestamp, distance)` samples. A name is promoted to confirmed once the
//! window is full and its mean distance is within the tracking threshold; it
//! falls back to candidate when the windowed mean drifts above it. Tracks that
//! go without an update for longer than the missing-frames budget are
//! evicted, and a later update starts a fresh window.

use crate::config::TrackingConfig;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Lifecycle of a tracked name. Absent names have no track at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Candidate,
    Confirmed,
}

/// Result of feeding one sample into the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    pub status: TrackStatus,
    /// Mean distance over the window, once the window is full.
    pub mean_distance: Option<f32>,
    /// True only on the update that promoted the name.
    pub promoted: bool,
}

#[derive(Debug, Clone)]
struct TrackState {
    samples: VecDeque<(Duration, f32)>,
    last_seen_frame: u64,
    confirmed: bool,
}

impl TrackState {
    fn new(capacity: usize, frame: u64) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            last_seen_frame: frame,
            confirmed: false,
        }
    }

    fn mean_distance(&self) -> f32 {
        self.samples.iter().map(|(_, d)| d).sum::<f32>() / self.samples.len() as f32
    }
}

#[derive(Debug)]
pub struct ConfirmationTracker {
    config: TrackingConfig,
    tracks: HashMap<String, TrackState>,
    frame: u64,
}

impl ConfirmationTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            frame: 0,
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    fn is_stale(&self, track: &TrackState) -> bool {
        self.frame.saturating_sub(track.last_seen_frame) > self.config.max_frames_missing as u64
    }

    /// Append one `(timestamp, distance)` sample for `name`.
    pub fn update(&mut self, name: &str, timestamp: Duration, distance: f32) -> TrackUpdate {
        if self.tracks.get(name).is_some_and(|t| self.is_stale(t)) {
            tracing::debug!(name, "stale track replaced by a fresh window");
            self.tracks.remove(name);
        }

        let window = self.config.confirm_frames;
        let frame = self.frame;
        let track = self.tracks.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(name, "candidate track opened");
            TrackState::new(window, frame)
        });

        track.samples.push_back((timestamp, distance));
        while track.samples.len() > window {
            track.samples.pop_front();
        }
        track.last_seen_frame = frame;

        let full = track.samples.len() == window;
        let mean_distance = full.then(|| track.mean_distance());
        let agreeing = mean_distance.is_some_and(|m| m <= self.config.tracking_threshold);

        let mut promoted = false;
        if agreeing && !track.confirmed {
            track.confirmed = true;
            promoted = true;
            tracing::info!(name, mean_distance = ?mean_distance, "identity confirmed");
        } else if !agreeing && track.confirmed {
            track.confirmed = false;
            tracing::debug!(name, mean_distance = ?mean_distance, "confirmation lapsed");
        }

        let status = if track.confirmed {
            TrackStatus::Confirmed
        } else {
            TrackStatus::Candidate
        };

        if promoted && self.config.reset_on_confirm {
            self.tracks.remove(name);
        }

        TrackUpdate {
            status,
            mean_distance,
            promoted,
        }
    }

    /// Close the current frame and evict tracks that have gone stale.
    pub fn advance(&mut self) {
        self.frame += 1;
        let budget = self.config.max_frames_missing as u64;
        let frame = self.frame;
        self.tracks.retain(|name, track| {
            let keep = frame.saturating_sub(track.last_seen_frame) <= budget;
            if !keep {
                tracing::debug!(name = %name, "track evicted after missing frames");
            }
            keep
        });
    }

    pub fn status(&self, name: &str) -> Option<TrackStatus> {
        self.tracks.get(name).map(|t| {
            if t.confirmed {
                TrackStatus::Confirmed
            } else {
                TrackStatus::Candidate
            }
        })
    }

    /// Distances currently held in `name`'s window, oldest first.
    pub fn window(&self, name: &str) -> Option<Vec<f32>> {
        self.tracks
            .get(name)
            .map(|t| t.samples.iter().map(|(_, d)| *d).collect())
    }

    pub fn forget(&mut self, name: &str) -> bool {
        self.tracks.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
