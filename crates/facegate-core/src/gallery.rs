//! Shared gallery: the embedding store and its match index behind one lock.
//!
//! Matching takes the read side; enroll, remove and rebuild take the write
//! side and refresh the index before releasing it. A matcher therefore always
//! sees the index that corresponds to the store's latest committed state.

use crate::matcher::{IdentityMatcher, IndexError};
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{EnrolledIdentity, Embedding, IdentityMatch};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("index rebuild failed: {0}")]
    Index(#[from] IndexError),
}

impl GalleryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GalleryError::Store(StoreError::NotFound(_)))
    }
}

struct GalleryState {
    store: EmbeddingStore,
    matcher: IdentityMatcher,
    /// Bumped on every successful mutation.
    generation: u64,
}

pub struct Gallery {
    state: RwLock<GalleryState>,
}

impl Gallery {
    /// Wrap `store` and build its initial index.
    pub fn new(store: EmbeddingStore) -> Result<Self, GalleryError> {
        let mut matcher = IdentityMatcher::new(store.dim());
        matcher.rebuild(store.all())?;
        Ok(Self {
            state: RwLock::new(GalleryState {
                store,
                matcher,
                generation: 0,
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, GalleryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GalleryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enroll or re-enroll `name`. Blocks for the duration of the durable write.
    pub fn enroll(&self, name: &str, embedding: Embedding) -> Result<EnrolledIdentity, GalleryError> {
        let mut state = self.write();
        let state = &mut *state;
        let identity = state.store.enroll(name, embedding)?.clone();
        state.matcher.rebuild(state.store.all())?;
        state.generation += 1;
        Ok(identity)
    }

    pub fn remove(&self, name: &str) -> Result<EnrolledIdentity, GalleryError> {
        let mut state = self.write();
        let state = &mut *state;
        let removed = state.store.remove(name)?;
        state.matcher.rebuild(state.store.all())?;
        state.generation += 1;
        Ok(removed)
    }

    /// Re-read durable storage and rebuild the index from it.
    pub fn reload(&self) -> Result<(), GalleryError> {
        let mut state = self.write();
        let state = &mut *state;
        state.store.load()?;
        state.matcher.rebuild(state.store.all())?;
        state.generation += 1;
        Ok(())
    }

    pub fn match_one(&self, embedding: &Embedding, threshold: f32) -> Option<IdentityMatch> {
        self.read().matcher.match_one(embedding, threshold)
    }

    pub fn match_batch(&self, embeddings: &[&Embedding], threshold: f32) -> Vec<Option<IdentityMatch>> {
        self.read().matcher.match_batch(embeddings, threshold)
    }

    /// Match a batch and report the generation the results were computed against.
    pub fn match_batch_versioned(
        &self,
        embeddings: &[&Embedding],
        threshold: f32,
    ) -> (u64, Vec<Option<IdentityMatch>>) {
        let state = self.read();
        (state.generation, state.matcher.match_batch(embeddings, threshold))
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Snapshot of all enrolled identities, ordered by name.
    pub fn identities(&self) -> Vec<EnrolledIdentity> {
        self.read().store.all().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().store.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.read().store.dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DIM: usize = 8;

    fn axis(axis: usize) -> Embedding {
        let mut v = vec![0.0; DIM];
        v[axis] = 1.0;
        Embedding::new(v)
    }

    fn gallery() -> Gallery {
        Gallery::new(EmbeddingStore::open_in_memory(DIM).unwrap()).unwrap()
    }

    #[test]
    fn test_enroll_is_immediately_matchable() {
        let g = gallery();
        g.enroll("Alice", axis(0)).unwrap();
        let hit = g.match_one(&axis(0), 0.6).unwrap();
        assert_eq!(hit.name, "Alice");
        assert_eq!(hit.distance, 0.0);
    }

    #[test]
    fn test_enroll_then_remove_no_longer_matches() {
        let g = gallery();
        g.enroll("Alice", axis(0)).unwrap();
        g.enroll("Bob", axis(1)).unwrap();
        g.remove("Alice").unwrap();
        assert!(g.match_one(&axis(0), 0.6).is_none());
        assert_eq!(g.match_one(&axis(1), 0.6).unwrap().name, "Bob");
    }

    #[test]
    fn test_empty_gallery_batch() {
        let g = gallery();
        let a = axis(0);
        let b = axis(3);
        assert_eq!(g.match_batch(&[&a, &b, &a], 0.6), vec![None, None, None]);
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let g = gallery();
        assert_eq!(g.generation(), 0);
        g.enroll("Alice", axis(0)).unwrap();
        assert_eq!(g.generation(), 1);
        assert!(g.remove("nobody").unwrap_err().is_not_found());
        assert_eq!(g.generation(), 1, "failed mutations do not bump the generation");
        g.remove("Alice").unwrap();
        let (generation, results) = g.match_batch_versioned(&[&axis(0)], 0.6);
        assert_eq!(generation, 2);
        assert_eq!(results, vec![None]);
    }

    #[test]
    fn test_reenroll_moves_identity() {
        let g = gallery();
        g.enroll("Alice", axis(0)).unwrap();
        g.enroll("Alice", axis(5)).unwrap();
        assert_eq!(g.len(), 1);
        assert!(g.match_one(&axis(0), 0.6).is_none());
        assert_eq!(g.match_one(&axis(5), 0.6).unwrap().name, "Alice");
    }

    #[test]
    fn test_reload_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.db");
        let g = Gallery::new(EmbeddingStore::open(&path, DIM).unwrap()).unwrap();

        {
            let mut other = EmbeddingStore::open(&path, DIM).unwrap();
            other.enroll("Carol", axis(2)).unwrap();
        }
        assert!(g.match_one(&axis(2), 0.6).is_none());
        g.reload().unwrap();
        assert_eq!(g.match_one(&axis(2), 0.6).unwrap().name, "Carol");
    }

    #[test]
    fn test_concurrent_enroll_and_match() {
        let g = Arc::new(gallery());
        g.enroll("anchor", axis(7)).unwrap();

        let writer = {
            let g = Arc::clone(&g);
            std::thread::spawn(move || {
                for i in 0..50 {
                    let name = format!("p{}", i % 5);
                    g.enroll(&name, axis(i % 5)).unwrap();
                }
            })
        };

        let query = axis(7);
        for _ in 0..200 {
            let hit = g.match_one(&query, 0.1).expect("anchor must stay matchable");
            assert_eq!(hit.name, "anchor");
        }
        writer.join().unwrap();
        assert_eq!(g.len(), 6);
    }
}
