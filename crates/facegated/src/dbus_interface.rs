use crate::engine::EngineHandle;
use facegate_core::{Embedding, EnrolledIdentity, Gallery, GalleryError, StoreError};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Control1";
pub const OBJECT_PATH: &str = "/org/facegate/Control1";

/// D-Bus control interface for the facegate daemon.
///
/// Bus name: org.facegate.Control1
/// Object path: /org/facegate/Control1
///
/// Gallery mutations run on the blocking pool; frame processing keeps going
/// on the engine thread and picks up the new index on its next frame.
pub struct ControlService {
    gallery: Arc<Gallery>,
    engine: EngineHandle,
}

impl ControlService {
    pub fn new(gallery: Arc<Gallery>, engine: EngineHandle) -> Self {
        Self { gallery, engine }
    }
}

#[interface(name = "org.facegate.Control1")]
impl ControlService {
    /// Enroll (or re-enroll) an identity from a raw embedding vector.
    async fn enroll(&self, name: &str, embedding: Vec<f64>) -> zbus::fdo::Result<String> {
        tracing::info!(name, dim = embedding.len(), "enroll requested");
        let gallery = Arc::clone(&self.gallery);
        let name = name.to_string();
        let embedding = Embedding::new(embedding.into_iter().map(|v| v as f32).collect());
        let identity = tokio::task::spawn_blocking(move || gallery.enroll(&name, embedding))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("enroll task failed: {e}")))?
            .map_err(to_fdo)?;
        Ok(identity_json(&identity).to_string())
    }

    /// Remove an identity. Returns false when the name was not enrolled.
    async fn remove(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        let gallery = Arc::clone(&self.gallery);
        let owned = name.to_string();
        let result = tokio::task::spawn_blocking(move || gallery.remove(&owned))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("remove task failed: {e}")))?;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => {
                tracing::info!(name, "remove: identity not enrolled");
                Ok(false)
            }
            Err(e) => Err(to_fdo(e)),
        }
    }

    /// List enrolled identities as a JSON array.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        Ok(identities_json(&self.gallery.identities()).to_string())
    }

    /// Drop all per-stream liveness and confirmation state.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        self.engine
            .reset()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let stats = self
            .engine
            .stats()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": self.gallery.len(),
            "embedding_dim": self.gallery.dim(),
            "gallery_generation": self.gallery.generation(),
            "engine": stats,
        })
        .to_string())
    }
}

/// Caller mistakes become `InvalidArgs`; storage failures become `Failed`.
fn to_fdo(err: GalleryError) -> zbus::fdo::Error {
    match &err {
        GalleryError::Store(
            StoreError::InvalidName
            | StoreError::InvalidEmbedding
            | StoreError::DimensionMismatch { .. },
        ) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        _ => {
            tracing::warn!(error = %err, "gallery update failed");
            zbus::fdo::Error::Failed(err.to_string())
        }
    }
}

fn identity_json(identity: &EnrolledIdentity) -> serde_json::Value {
    serde_json::json!({
        "name": identity.name,
        "dim": identity.embedding.dim(),
        "created_at": identity.created_at.to_rfc3339(),
    })
}

fn identities_json(identities: &[EnrolledIdentity]) -> serde_json::Value {
    serde_json::Value::Array(identities.iter().map(identity_json).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::EmbeddingStore;

    fn gallery() -> Gallery {
        Gallery::new(EmbeddingStore::open_in_memory(3).unwrap()).unwrap()
    }

    #[test]
    fn test_identities_json_lists_names_in_order() {
        let g = gallery();
        g.enroll("Bob", Embedding::new(vec![0.0, 1.0, 0.0])).unwrap();
        g.enroll("Alice", Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        let json = identities_json(&g.identities());
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
        assert_eq!(json[0]["dim"], 3);
    }

    #[test]
    fn test_caller_errors_map_to_invalid_args() {
        let g = gallery();
        let err = g.enroll("Alice", Embedding::new(vec![1.0])).unwrap_err();
        assert!(matches!(to_fdo(err), zbus::fdo::Error::InvalidArgs(_)));

        let err = g.enroll("  ", Embedding::new(vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(to_fdo(err), zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_missing_identity_is_failed() {
        let g = gallery();
        let err = g.remove("nobody").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(to_fdo(err), zbus::fdo::Error::Failed(_)));
    }
}
