//! Grayscale frame helpers (cropping, brightness, Laplacian and Sobel
//! responses) plus the JSON frame record exchanged with the detection stage.

use crate::types::{BoundingBox, Detection};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One camera frame as handed over by the detection stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Seconds since the start of the stream.
    pub timestamp: f64,
    /// Path to the frame image; any format `image` can decode, converted to grayscale.
    pub image: PathBuf,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl FrameRecord {
    /// Decode the referenced frame, resolving relative paths against `base`.
    pub fn load_image(&self, base: Option<&Path>) -> Result<GrayImage, FrameError> {
        let path = match base {
            Some(dir) if self.image.is_relative() => dir.join(&self.image),
            _ => self.image.clone(),
        };
        let decoded = image::open(&path).map_err(|source| FrameError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        Ok(decoded.to_luma8())
    }

    /// Stream-relative capture time.
    pub fn stream_time(&self) -> Result<Duration, FrameError> {
        Duration::try_from_secs_f64(self.timestamp).map_err(|_| FrameError::Timestamp(self.timestamp))
    }
}

/// Average pixel brightness (0.0–255.0).
pub fn avg_brightness(gray: &GrayImage) -> f32 {
    let data = gray.as_raw();
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
}

/// Copy the part of `frame` covered by `bbox`, clipped to the frame bounds.
///
/// Returns `None` when the box is degenerate or lies entirely outside the frame.
pub fn crop_face(frame: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    if bbox.is_degenerate() {
        return None;
    }
    let (fw, fh) = frame.dimensions();
    let x0 = bbox.x.floor().clamp(0.0, fw as f32) as u32;
    let y0 = bbox.y.floor().clamp(0.0, fh as f32) as u32;
    let x1 = (bbox.x + bbox.width).ceil().clamp(0.0, fw as f32) as u32;
    let y1 = (bbox.y + bbox.height).ceil().clamp(0.0, fh as f32) as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image::imageops::crop_imm(frame, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
///
/// Low values indicate a blurred or flat surface. Images smaller than 3×3
/// have no interior and score 0.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let r = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += r;
            sum_sq += r * r;
            n += 1;
        }
    }
    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0) as f32
}

/// 3×3 Sobel gradient magnitude at an interior pixel.
///
/// Border pixels have no full neighbourhood and return `None`.
pub fn sobel_magnitude(gray: &GrayImage, x: u32, y: u32) -> Option<f32> {
    let (w, h) = gray.dimensions();
    if x == 0 || y == 0 || x + 1 >= w || y + 1 >= h {
        return None;
    }
    let px = |dx: i32, dy: i32| {
        gray.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as f32
    };
    let gx = (px(1, -1) + 2.0 * px(1, 0) + px(1, 1)) - (px(-1, -1) + 2.0 * px(-1, 0) + px(-1, 1));
    let gy = (px(-1, 1) + 2.0 * px(0, 1) + px(1, 1)) - (px(-1, -1) + 2.0 * px(0, -1) + px(1, -1));
    Some((gx * gx + gy * gy).sqrt())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to decode frame image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid frame timestamp {0}")]
    Timestamp(f64),
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image::{GrayImage, Luma};

    pub fn flat(w: u32, h: u32, value: u8) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([value]))
    }

    /// Checkerboard with `cell`-pixel squares alternating between `lo` and `hi`.
    pub fn checkerboard(w: u32, h: u32, cell: u32, lo: u8, hi: u8) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Luma([lo])
            } else {
                Luma([hi])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{checkerboard, flat};
    use super::*;
    use image::Luma;

    #[test]
    fn test_avg_brightness() {
        assert_eq!(avg_brightness(&flat(4, 4, 100)), 100.0);
        let mut img = flat(2, 1, 0);
        img.put_pixel(1, 0, Luma([200]));
        assert_eq!(avg_brightness(&img), 100.0);
    }

    #[test]
    fn test_avg_brightness_empty() {
        assert_eq!(avg_brightness(&GrayImage::new(0, 0)), 0.0);
    }

    #[test]
    fn test_crop_inside_frame() {
        let frame = flat(100, 80, 50);
        let crop = crop_face(&frame, &BoundingBox::new(10.0, 20.0, 30.0, 40.0)).unwrap();
        assert_eq!(crop.dimensions(), (30, 40));
    }

    #[test]
    fn test_crop_clipped_to_frame() {
        let frame = flat(100, 80, 50);
        let crop = crop_face(&frame, &BoundingBox::new(-10.0, 60.0, 40.0, 40.0)).unwrap();
        assert_eq!(crop.dimensions(), (30, 20));
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = flat(100, 80, 50);
        assert!(crop_face(&frame, &BoundingBox::new(200.0, 10.0, 40.0, 40.0)).is_none());
        assert!(crop_face(&frame, &BoundingBox::new(10.0, 10.0, 0.0, 40.0)).is_none());
    }

    #[test]
    fn test_laplacian_flat_is_zero() {
        assert_eq!(laplacian_variance(&flat(32, 32, 128)), 0.0);
    }

    #[test]
    fn test_laplacian_checkerboard_is_sharp() {
        let sharp = laplacian_variance(&checkerboard(32, 32, 1, 0, 255));
        let soft = laplacian_variance(&checkerboard(32, 32, 8, 120, 136));
        assert!(sharp > 10_000.0, "sharp = {sharp}");
        assert!(sharp > soft * 10.0, "sharp = {sharp}, soft = {soft}");
    }

    #[test]
    fn test_laplacian_tiny_image() {
        assert_eq!(laplacian_variance(&checkerboard(2, 2, 1, 0, 255)), 0.0);
    }

    #[test]
    fn test_sobel_flat_and_edge() {
        let img = flat(8, 8, 90);
        assert_eq!(sobel_magnitude(&img, 4, 4), Some(0.0));

        // Vertical step edge between columns 3 and 4.
        let edge = GrayImage::from_fn(8, 8, |x, _| if x < 4 { Luma([0]) } else { Luma([100]) });
        let mag = sobel_magnitude(&edge, 4, 4).unwrap();
        assert!((mag - 400.0).abs() < 1e-3, "mag = {mag}");
    }

    #[test]
    fn test_sobel_border_has_no_response() {
        let img = flat(8, 8, 90);
        assert_eq!(sobel_magnitude(&img, 0, 4), None);
        assert_eq!(sobel_magnitude(&img, 7, 4), None);
    }

    #[test]
    fn test_frame_record_loads_relative_image() {
        let dir = tempfile::tempdir().unwrap();
        checkerboard(16, 16, 4, 10, 200)
            .save(dir.path().join("f0001.png"))
            .unwrap();

        let record: FrameRecord =
            serde_json::from_str(r#"{"timestamp": 0.25, "image": "f0001.png"}"#).unwrap();
        assert!(record.detections.is_empty());
        let gray = record.load_image(Some(dir.path())).unwrap();
        assert_eq!(gray.dimensions(), (16, 16));
    }

    #[test]
    fn test_stream_time() {
        let mut record: FrameRecord =
            serde_json::from_str(r#"{"timestamp": 1.5, "image": "a.png"}"#).unwrap();
        assert_eq!(record.stream_time().unwrap(), Duration::from_millis(1500));
        record.timestamp = -1.0;
        assert!(matches!(record.stream_time(), Err(FrameError::Timestamp(_))));
    }

    #[test]
    fn test_frame_record_missing_image() {
        let record = FrameRecord {
            timestamp: 0.0,
            image: PathBuf::from("/nonexistent/frame.png"),
            detections: Vec::new(),
        };
        assert!(matches!(record.load_image(None), Err(FrameError::Decode { .. })));
    }
}
