//! Per-face quality gate.
//!
//! Rejects faces that are too small, too dark or too blurry to match
//! reliably. The gate is stateless and may be shared across threads.

use crate::config::QualityConfig;
use crate::frame;
use crate::types::BoundingBox;
use image::GrayImage;
use serde::Serialize;

/// Raw metric values for one face crop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QualityScores {
    /// min(width, height) of the crop, in pixels.
    pub size: f32,
    /// Mean grayscale intensity.
    pub brightness: f32,
    /// Variance of the Laplacian.
    pub sharpness: f32,
}

/// Outcome of one quality assessment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityReport {
    pub passed: bool,
    pub scores: QualityScores,
    pub size_ok: bool,
    pub brightness_ok: bool,
    pub sharpness_ok: bool,
}

impl QualityReport {
    fn failed_degenerate() -> Self {
        Self {
            passed: false,
            scores: QualityScores::default(),
            size_ok: false,
            brightness_ok: false,
            sharpness_ok: false,
        }
    }

    /// Fraction of the three metrics that met their minimum.
    pub fn pass_fraction(&self) -> f32 {
        let passed = [self.size_ok, self.brightness_ok, self.sharpness_ok]
            .iter()
            .filter(|&&ok| ok)
            .count();
        passed as f32 / 3.0
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Assess the face covered by `bbox` within a full grayscale frame.
    ///
    /// Zero-area boxes and boxes outside the frame fail automatically.
    pub fn assess(&self, frame_gray: &GrayImage, bbox: &BoundingBox) -> QualityReport {
        match frame::crop_face(frame_gray, bbox) {
            Some(crop) => self.assess_crop(&crop),
            None => QualityReport::failed_degenerate(),
        }
    }

    /// Assess an already-cropped face region.
    pub fn assess_crop(&self, crop: &GrayImage) -> QualityReport {
        let (w, h) = crop.dimensions();
        if w == 0 || h == 0 {
            return QualityReport::failed_degenerate();
        }

        let scores = QualityScores {
            size: w.min(h) as f32,
            brightness: frame::avg_brightness(crop),
            sharpness: frame::laplacian_variance(crop),
        };

        let mut report = QualityReport {
            passed: false,
            scores,
            size_ok: scores.size >= self.config.min_face_size,
            brightness_ok: scores.brightness >= self.config.min_brightness,
            sharpness_ok: scores.sharpness >= self.config.min_sharpness,
        };
        // Tolerate float rounding of 2/3 against a configured 0.666...
        report.passed = report.pass_fraction() + 1e-6 >= self.config.min_pass_fraction;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::fixtures::{checkerboard, flat};

    fn strict() -> QualityGate {
        QualityGate::new(QualityConfig {
            min_pass_fraction: 1.0,
            ..QualityConfig::default()
        })
    }

    #[test]
    fn test_good_face_passes() {
        let crop = checkerboard(120, 120, 2, 40, 220);
        let report = strict().assess_crop(&crop);
        assert!(report.passed, "{report:?}");
        assert_eq!(report.scores.size, 120.0);
        assert!((report.scores.brightness - 130.0).abs() < 1.0);
    }

    #[test]
    fn test_blurry_face_fails_when_all_metrics_required() {
        // Large and bright but perfectly flat: no Laplacian response.
        let crop = flat(120, 120, 150);
        let report = strict().assess_crop(&crop);
        assert!(report.size_ok);
        assert!(report.brightness_ok);
        assert!(!report.sharpness_ok);
        assert_eq!(report.scores.sharpness, 0.0);
        assert!(!report.passed);
    }

    #[test]
    fn test_blurry_face_passes_under_majority_policy() {
        let gate = QualityGate::new(QualityConfig::default());
        let report = gate.assess_crop(&flat(120, 120, 150));
        assert!(!report.sharpness_ok);
        assert!((report.pass_fraction() - 2.0 / 3.0).abs() < 1e-6);
        assert!(report.passed, "two of three metrics pass the 0.6 default");
    }

    #[test]
    fn test_single_metric_fails_majority() {
        let gate = QualityGate::new(QualityConfig::default());
        // Small, dark, flat.
        let report = gate.assess_crop(&flat(20, 20, 5));
        assert_eq!(report.pass_fraction(), 0.0);
        assert!(!report.passed);

        // Small and dark but sharp: one of three.
        let report = gate.assess_crop(&checkerboard(20, 20, 1, 0, 40));
        assert!(report.sharpness_ok);
        assert!(!report.size_ok);
        assert!(!report.brightness_ok);
        assert!(!report.passed);
    }

    #[test]
    fn test_two_thirds_fraction_boundary() {
        let gate = QualityGate::new(QualityConfig {
            min_pass_fraction: 2.0 / 3.0,
            ..QualityConfig::default()
        });
        assert!(gate.assess_crop(&flat(120, 120, 150)).passed);
    }

    #[test]
    fn test_too_dark_fails_strict() {
        let report = strict().assess_crop(&checkerboard(120, 120, 1, 0, 20));
        assert!(report.sharpness_ok);
        assert!(!report.brightness_ok);
        assert!(!report.passed);
    }

    #[test]
    fn test_zero_area_box_fails() {
        let frame = checkerboard(200, 200, 2, 40, 220);
        let report = strict().assess(&frame, &BoundingBox::new(50.0, 50.0, 0.0, 0.0));
        assert!(!report.passed);
        assert_eq!(report.scores, QualityScores::default());
    }

    #[test]
    fn test_box_outside_frame_fails() {
        let frame = checkerboard(200, 200, 2, 40, 220);
        let report = QualityGate::new(QualityConfig::default())
            .assess(&frame, &BoundingBox::new(500.0, 500.0, 100.0, 100.0));
        assert!(!report.passed);
    }

    #[test]
    fn test_assess_uses_clipped_region() {
        let frame = checkerboard(200, 200, 2, 40, 220);
        // Box hangs off the right edge; only 60 px of width remain.
        let report = strict().assess(&frame, &BoundingBox::new(140.0, 10.0, 120.0, 120.0));
        assert_eq!(report.scores.size, 60.0);
        assert!(!report.size_ok);
    }
}
