//! facegate-core — Identity verification pipeline over detected faces.
//!
//! Takes per-frame face detections (box, landmarks, embedding) and turns
//! them into per-face decisions: quality gate, k-d tree match against the
//! enrolled gallery, liveness scoring and multi-frame confirmation.

pub mod config;
pub mod frame;
pub mod gallery;
pub mod liveness;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod store;
pub mod tracker;
pub mod types;

use std::path::PathBuf;

pub use config::{ConfigError, PipelineConfig};
pub use frame::{FrameError, FrameRecord};
pub use gallery::{Gallery, GalleryError};
pub use pipeline::Pipeline;
pub use store::{EmbeddingStore, StoreError};
pub use types::{BoundingBox, Decision, Detection, Embedding, EnrolledIdentity, IdentityMatch, RejectReason};

/// Default location of the enrolled-face database:
/// `$XDG_DATA_HOME/facegate/faces.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
        .join("faces.db")
}
