//! Pipeline tuning knobs, loadable from TOML.
//!
//! Every section falls back to its defaults, so a config file only needs to
//! name the values it changes:
//!
//! ```toml
//! [matching]
//! threshold = 0.55
//!
//! [tracking]
//! confirm_frames = 3
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Full configuration surface of the identity pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub matching: MatchConfig,
    pub tracking: TrackingConfig,
    pub liveness: LivenessConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quality.validate()?;
        self.matching.validate()?;
        self.tracking.validate()?;
        self.liveness.validate()?;
        if self.tracking.tracking_threshold > self.matching.threshold {
            return Err(invalid(
                "tracking.tracking_threshold",
                format!(
                    "must not exceed matching.threshold ({}), got {}",
                    self.matching.threshold, self.tracking.tracking_threshold
                ),
            ));
        }
        Ok(())
    }
}

/// Quality gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum of face width and height, in pixels.
    pub min_face_size: f32,
    /// Minimum mean grayscale intensity (0–255).
    pub min_brightness: f32,
    /// Minimum variance of the Laplacian.
    pub min_sharpness: f32,
    /// Fraction of metrics that must pass. 1.0 requires all three.
    pub min_pass_fraction: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_face_size: 80.0,
            min_brightness: 40.0,
            min_sharpness: 100.0,
            min_pass_fraction: 0.6,
        }
    }
}

impl QualityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_pass_fraction > 0.0 && self.min_pass_fraction <= 1.0) {
            return Err(invalid(
                "quality.min_pass_fraction",
                format!("must be in (0, 1], got {}", self.min_pass_fraction),
            ));
        }
        for (field, v) in [
            ("quality.min_face_size", self.min_face_size),
            ("quality.min_brightness", self.min_brightness),
            ("quality.min_sharpness", self.min_sharpness),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(field, format!("must be a non-negative number, got {v}")));
            }
        }
        Ok(())
    }
}

/// Identity matching parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Maximum Euclidean distance for a raw match.
    pub threshold: f32,
    /// Expected embedding length.
    pub embedding_dim: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            embedding_dim: 128,
        }
    }
}

impl MatchConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(invalid(
                "matching.threshold",
                format!("must be positive, got {}", self.threshold),
            ));
        }
        if self.embedding_dim == 0 {
            return Err(invalid("matching.embedding_dim", "must be at least 1"));
        }
        Ok(())
    }
}

/// Confirmation tracker parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Maximum mean distance over a full window for promotion.
    pub tracking_threshold: f32,
    /// Window size; consecutive agreeing updates required for confirmation.
    pub confirm_frames: usize,
    /// Frames without an update after which a track is evicted.
    pub max_frames_missing: u32,
    /// Drop the track immediately after it is promoted, so the next
    /// confirmation needs a fresh full window.
    pub reset_on_confirm: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_threshold: 0.5,
            confirm_frames: 5,
            max_frames_missing: 10,
            reset_on_confirm: false,
        }
    }
}

impl TrackingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.confirm_frames < 2 {
            return Err(invalid(
                "tracking.confirm_frames",
                format!("must be at least 2, got {}", self.confirm_frames),
            ));
        }
        if !self.tracking_threshold.is_finite() || self.tracking_threshold <= 0.0 {
            return Err(invalid(
                "tracking.tracking_threshold",
                format!("must be positive, got {}", self.tracking_threshold),
            ));
        }
        Ok(())
    }
}

/// Relative weight of each liveness signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessWeights {
    pub blink: f32,
    pub movement: f32,
    pub expression: f32,
    pub texture: f32,
}

impl Default for LivenessWeights {
    fn default() -> Self {
        Self {
            blink: 0.3,
            movement: 0.3,
            expression: 0.2,
            texture: 0.2,
        }
    }
}

impl LivenessWeights {
    pub fn total(&self) -> f32 {
        self.blink + self.movement + self.expression + self.texture
    }
}

/// Liveness scorer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Minimum seconds between two real checks on the same track.
    pub check_interval_secs: f64,
    /// Eye-aspect-ratio below which the eyes count as closed.
    pub blink_ear_threshold: f32,
    /// Mean landmark displacement (pixels) that counts as head movement.
    pub movement_threshold: f32,
    /// Mouth shape change that counts as an expression change.
    pub expression_threshold: f32,
    /// Mean gradient magnitude inside the face hull that counts as real texture.
    pub texture_threshold: f32,
    /// Score at or above which the face is considered live.
    pub threshold: f32,
    /// Length of the movement and expression history windows.
    pub history_window: usize,
    /// Frames a track may go unseen before its state is discarded.
    pub track_expiry_frames: u32,
    pub weights: LivenessWeights,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 0.5,
            blink_ear_threshold: 0.21,
            movement_threshold: 2.0,
            expression_threshold: 0.05,
            texture_threshold: 30.0,
            threshold: 0.5,
            history_window: 10,
            track_expiry_frames: 10,
            weights: LivenessWeights::default(),
        }
    }
}

impl LivenessConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.check_interval_secs.is_finite() || self.check_interval_secs < 0.0 {
            return Err(invalid(
                "liveness.check_interval_secs",
                format!("must be non-negative, got {}", self.check_interval_secs),
            ));
        }
        if self.history_window < 3 {
            return Err(invalid(
                "liveness.history_window",
                format!("must be at least 3, got {}", self.history_window),
            ));
        }
        let w = &self.weights;
        if [w.blink, w.movement, w.expression, w.texture]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(invalid("liveness.weights", "weights must be non-negative"));
        }
        if w.total() <= 0.0 {
            return Err(invalid("liveness.weights", "at least one weight must be positive"));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid(
                "liveness.threshold",
                format!("must be in [0, 1], got {}", self.threshold),
            ));
        }
        Ok(())
    }
}
