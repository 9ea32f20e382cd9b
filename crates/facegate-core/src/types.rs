use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2D image-space point `(x, y)` in pixels.
pub type Point = (f32, f32);

/// Axis-aligned bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// True when the box covers no pixels or carries non-finite coordinates.
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite());
        !finite || self.width < 1.0 || self.height < 1.0
    }
}

/// Face embedding vector (128-dimensional for the default recognition model).
///
/// Serialized as a bare JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        squared_distance(&self.values, &other.values).sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// One detected face in one frame, as handed over by the detection stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "bbox")]
    pub bounding_box: BoundingBox,
    /// Ordered landmark points. The liveness signals expect the 68-point
    /// iBUG layout; shorter sets simply disable the signals that need them.
    #[serde(default)]
    pub landmarks: Vec<Point>,
    pub embedding: Embedding,
    /// Detector-assigned track identifier, stable while the same face stays in view.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<u64>,
}

/// A stored identity with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub name: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Nearest enrolled identity within the match threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityMatch {
    pub name: String,
    /// Euclidean distance to the enrolled embedding. Smaller = more similar.
    pub distance: f32,
}

/// Why a detection was turned away before it could be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Face too small, too dark or too blurry to match reliably.
    LowQuality,
    /// Named candidate failed the liveness check.
    SpoofSuspected,
    /// Embedding could not be compared against the gallery (wrong
    /// dimensionality or non-finite components).
    Unmatched,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::LowQuality => "low_quality",
            RejectReason::SpoofSuspected => "spoof_suspected",
            RejectReason::Unmatched => "unmatched",
        };
        f.write_str(s)
    }
}

/// Per-detection outcome of one pipeline frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Confirmed { name: String },
    Unknown,
    Rejected { reason: RejectReason },
}

impl Decision {
    pub fn confirmed_name(&self) -> Option<&str> {
        match self {
            Decision::Confirmed { name } => Some(name),
            _ => None,
        }
    }
}
