//! Per-track liveness scoring from landmarks and face texture.
//!
//! A printed photo or a still screen keeps its landmarks frozen, never
//! blinks, holds one mouth shape and tends to show a flat, low-gradient
//! surface. Each real check measures four signals against that profile:
//!
//! - **blink**: eye-aspect-ratio crossing below the closed threshold
//! - **movement**: mean landmark displacement over a trailing window
//! - **expression**: change of the normalised mouth outline between checks
//! - **texture**: mean Sobel magnitude inside the landmark convex hull
//!
//! The weighted sum of the satisfied signals is the liveness score. Checks on
//! one track are throttled to the configured interval; calls in between
//! replay the last verdict.
//!
//! Blink and expression need the 68-point iBUG layout (eyes at 36..48, mouth
//! at 48..68). Shorter landmark sets leave those signals unsatisfied.

use crate::config::{LivenessConfig, LivenessWeights};
use crate::frame::sobel_magnitude;
use crate::types::{Detection, Point};
use image::GrayImage;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const LEFT_EYE: std::ops::Range<usize> = 36..42;
const RIGHT_EYE: std::ops::Range<usize> = 42..48;
const MOUTH: std::ops::Range<usize> = 48..68;
const FULL_LAYOUT: usize = 68;

/// Trailing samples required before the movement signal can fire.
const MIN_MOVEMENT_SAMPLES: usize = 3;

/// Identity of a face across frames for liveness bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackKey {
    /// Detector-assigned track id.
    Id(u64),
    /// Fallback when the detector does not track faces: the candidate name.
    Name(String),
}

impl TrackKey {
    pub fn for_detection(detection: &Detection, candidate: &str) -> Self {
        match detection.track_id {
            Some(id) => TrackKey::Id(id),
            None => TrackKey::Name(candidate.to_string()),
        }
    }
}

/// Which liveness signals were satisfied by a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LivenessSignals {
    pub blink: bool,
    pub movement: bool,
    pub expression: bool,
    pub texture: bool,
}

impl LivenessSignals {
    /// Weighted fraction of satisfied signals, in [0, 1].
    pub fn score(&self, weights: &LivenessWeights) -> f32 {
        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        let mut sum = 0.0;
        if self.blink {
            sum += weights.blink;
        }
        if self.movement {
            sum += weights.movement;
        }
        if self.expression {
            sum += weights.expression;
        }
        if self.texture {
            sum += weights.texture;
        }
        (sum / total).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub score: f32,
    pub signals: LivenessSignals,
    /// False when the call was throttled and the verdict replayed.
    pub evaluated: bool,
}

#[derive(Debug, Default)]
struct LivenessState {
    /// Eye state from the previous check; `None` until first observed.
    eyes_closed: Option<bool>,
    blink_count: u32,
    last_landmarks: Option<Vec<Point>>,
    movement_history: VecDeque<f32>,
    last_mouth: Option<Vec<f32>>,
    expression_history: VecDeque<f32>,
    /// Time and outcome of the most recent real check.
    last_check: Option<(Duration, LivenessVerdict)>,
    last_seen_frame: u64,
}

fn push_bounded(history: &mut VecDeque<f32>, value: f32, window: usize) {
    history.push_back(value);
    while history.len() > window {
        history.pop_front();
    }
}

fn mean(values: &VecDeque<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[derive(Debug)]
pub struct LivenessScorer {
    config: LivenessConfig,
    interval: Duration,
    tracks: HashMap<TrackKey, LivenessState>,
    frame: u64,
}

impl LivenessScorer {
    pub fn new(config: LivenessConfig) -> Self {
        let interval =
            Duration::try_from_secs_f64(config.check_interval_secs).unwrap_or(Duration::MAX);
        Self {
            config,
            interval,
            tracks: HashMap::new(),
            frame: 0,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Score one observation of `key` at stream time `now`.
    pub fn check(
        &mut self,
        key: TrackKey,
        now: Duration,
        frame: &GrayImage,
        landmarks: &[Point],
    ) -> LivenessVerdict {
        let config = &self.config;
        let state = self.tracks.entry(key).or_default();
        state.last_seen_frame = self.frame;

        if let Some((last, verdict)) = &state.last_check {
            if now.saturating_sub(*last) < self.interval {
                return LivenessVerdict {
                    evaluated: false,
                    ..verdict.clone()
                };
            }
        }

        let signals = LivenessSignals {
            blink: observe_blink(state, landmarks, config.blink_ear_threshold),
            movement: observe_movement(state, landmarks, config),
            expression: observe_expression(state, landmarks, config),
            texture: hull_texture(frame, landmarks) > config.texture_threshold,
        };
        let score = signals.score(&config.weights);
        let verdict = LivenessVerdict {
            is_live: score >= config.threshold,
            score,
            signals,
            evaluated: true,
        };

        tracing::debug!(
            score,
            blinks = state.blink_count,
            movement = mean(&state.movement_history),
            expression = mean(&state.expression_history),
            live = verdict.is_live,
            "liveness check"
        );

        state.last_check = Some((now, verdict.clone()));
        verdict
    }

    /// Close the current frame and drop tracks not seen within the expiry budget.
    pub fn advance(&mut self) {
        self.frame += 1;
        let frame = self.frame;
        let budget = self.config.track_expiry_frames as u64;
        self.tracks.retain(|key, state| {
            let keep = frame.saturating_sub(state.last_seen_frame) <= budget;
            if !keep {
                tracing::debug!(track = ?key, "liveness track lost");
            }
            keep
        });
    }

    pub fn blink_count(&self, key: &TrackKey) -> Option<u32> {
        self.tracks.get(key).map(|s| s.blink_count)
    }

    pub fn forget(&mut self, key: &TrackKey) -> bool {
        self.tracks.remove(key).is_some()
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

fn observe_blink(state: &mut LivenessState, landmarks: &[Point], ear_threshold: f32) -> bool {
    if let Some(ear) = both_eyes_aspect_ratio(landmarks) {
        let closed = ear < ear_threshold;
        if closed && state.eyes_closed == Some(false) {
            state.blink_count += 1;
        }
        state.eyes_closed = Some(closed);
    }
    state.blink_count > 0
}

fn observe_movement(state: &mut LivenessState, landmarks: &[Point], config: &LivenessConfig) -> bool {
    if let Some(prev) = &state.last_landmarks {
        if let Some(d) = mean_displacement(prev, landmarks) {
            push_bounded(&mut state.movement_history, d, config.history_window);
        }
    }
    if !landmarks.is_empty() {
        state.last_landmarks = Some(landmarks.to_vec());
    }
    state.movement_history.len() >= MIN_MOVEMENT_SAMPLES
        && mean(&state.movement_history) > config.movement_threshold
}

fn observe_expression(
    state: &mut LivenessState,
    landmarks: &[Point],
    config: &LivenessConfig,
) -> bool {
    let Some(mouth) = landmarks.get(MOUTH).and_then(shape_descriptor) else {
        return false;
    };
    let changed = match &state.last_mouth {
        Some(prev) => {
            let diff = prev
                .iter()
                .zip(&mouth)
                .map(|(a, b)| (a - b).abs())
                .sum::<f32>()
                / mouth.len() as f32;
            push_bounded(&mut state.expression_history, diff, config.history_window);
            diff > config.expression_threshold
        }
        None => false,
    };
    state.last_mouth = Some(mouth);
    changed
}

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye aspect ratio over six eye-contour points `p0..p5`.
///
/// `p0`/`p3` are the corners; `p1`,`p2` the upper lid and `p5`,`p4` the lower.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    let [p0, p1, p2, p3, p4, p5] = <[Point; 6]>::try_from(eye).ok()?;
    let width = distance(p0, p3);
    if width <= f32::EPSILON {
        return None;
    }
    Some((distance(p1, p5) + distance(p2, p4)) / (2.0 * width))
}

/// Mean EAR of both eyes, if the landmarks carry the full layout.
pub fn both_eyes_aspect_ratio(landmarks: &[Point]) -> Option<f32> {
    if landmarks.len() < FULL_LAYOUT {
        return None;
    }
    let left = eye_aspect_ratio(&landmarks[LEFT_EYE])?;
    let right = eye_aspect_ratio(&landmarks[RIGHT_EYE])?;
    Some((left + right) / 2.0)
}

/// Mean absolute per-coordinate displacement between matching landmarks,
/// averaged over both axes of every point.
fn mean_displacement(prev: &[Point], curr: &[Point]) -> Option<f32> {
    if prev.is_empty() || prev.len() != curr.len() {
        return None;
    }
    let total: f32 = prev
        .iter()
        .zip(curr)
        .map(|(a, b)| (a.0 - b.0).abs() + (a.1 - b.1).abs())
        .sum();
    Some(total / (2 * prev.len()) as f32)
}

/// Outline translated to its centroid and scaled by its mean radius,
/// flattened to `[x0, y0, x1, y1, ...]`.
fn shape_descriptor(points: &[Point]) -> Option<Vec<f32>> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let cx = points.iter().map(|p| p.0).sum::<f32>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f32>() / n;
    let radius = points.iter().map(|&p| distance(p, (cx, cy))).sum::<f32>() / n;
    if radius <= f32::EPSILON {
        return None;
    }
    Some(
        points
            .iter()
            .flat_map(|p| [(p.0 - cx) / radius, (p.1 - cy) / radius])
            .collect(),
    )
}

fn cross(o: Point, a: Point, b: Point) -> f32 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Counter-clockwise convex hull (monotone chain), without collinear points.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    let mut pts: Vec<Point> = points
        .iter()
        .copied()
        .filter(|p| p.0.is_finite() && p.1.is_finite())
        .collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let chain = |iter: &mut dyn Iterator<Item = Point>| {
        let mut half: Vec<Point> = Vec::new();
        for p in iter {
            while half.len() >= 2 && cross(half[half.len() - 2], half[half.len() - 1], p) <= 0.0 {
                half.pop();
            }
            half.push(p);
        }
        half.pop();
        half
    };
    let mut hull = chain(&mut pts.iter().copied());
    hull.extend(chain(&mut pts.iter().rev().copied()));
    hull
}

fn inside_convex(hull: &[Point], p: Point) -> bool {
    (0..hull.len()).all(|i| cross(hull[i], hull[(i + 1) % hull.len()], p) >= 0.0)
}

/// Mean Sobel magnitude over frame pixels inside the landmark hull.
///
/// Zero when the hull is degenerate or covers no interior pixel.
pub fn hull_texture(frame: &GrayImage, landmarks: &[Point]) -> f32 {
    let hull = convex_hull(landmarks);
    if hull.len() < 3 {
        return 0.0;
    }
    let (w, h) = frame.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let min_x = hull.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = hull.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = hull.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = hull.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
    let x0 = min_x.floor().clamp(1.0, (w - 2) as f32) as u32;
    let x1 = max_x.ceil().clamp(1.0, (w - 2) as f32) as u32;
    let y0 = min_y.floor().clamp(1.0, (h - 2) as f32) as u32;
    let y1 = max_y.ceil().clamp(1.0, (h - 2) as f32) as u32;

    let mut sum = 0.0f64;
    let mut n = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if !inside_convex(&hull, (x as f32, y as f32)) {
                continue;
            }
            if let Some(m) = sobel_magnitude(frame, x, y) {
                sum += m as f64;
                n += 1;
            }
        }
    }
    if n == 0 {
        0.0
    } else {
        (sum / n as f64) as f32
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::types::Point;

    /// Synthetic 68-point face centred on `(cx, cy)`.
    ///
    /// `eye_open` is the lid half-opening in pixels (eye width is 12, so the
    /// EAR equals `eye_open / 3`). `mouth_open` is the mouth's vertical
    /// semi-axis.
    pub fn face(cx: f32, cy: f32, eye_open: f32, mouth_open: f32) -> Vec<Point> {
        let mut pts = Vec::with_capacity(68);
        // Jaw, brows and nose on a ring around the face.
        for i in 0..36 {
            let a = i as f32 / 36.0 * std::f32::consts::TAU;
            pts.push((cx + 40.0 * a.cos(), cy + 40.0 * a.sin()));
        }
        for ex in [cx - 15.0, cx + 15.0] {
            let ey = cy - 10.0;
            pts.extend([
                (ex - 6.0, ey),
                (ex - 2.0, ey - eye_open),
                (ex + 2.0, ey - eye_open),
                (ex + 6.0, ey),
                (ex + 2.0, ey + eye_open),
                (ex - 2.0, ey + eye_open),
            ]);
        }
        for i in 0..20 {
            let a = i as f32 / 20.0 * std::f32::consts::TAU;
            pts.push((cx + 12.0 * a.cos(), cy + 20.0 + mouth_open * a.sin()));
        }
        pts
    }
}
