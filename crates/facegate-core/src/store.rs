//! Durable name → embedding store backed by SQLite.
//!
//! Every mutation is written to the database first and only applied to the
//! in-memory map once the write has committed, so a failed enroll or remove
//! leaves no trace.

use crate::types::{EnrolledIdentity, Embedding};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    name        TEXT PRIMARY KEY NOT NULL,
    dim         INTEGER NOT NULL,
    embedding   BLOB NOT NULL,
    created_at  TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("persistence failed: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("failed to prepare store directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no enrolled identity named {0:?}")]
    NotFound(String),
    #[error("identity name must not be empty")]
    InvalidName,
    #[error("embedding has {actual} values, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    InvalidEmbedding,
    #[error("stored record for {name:?} is corrupt: {message}")]
    Corrupt { name: String, message: String },
}

/// Enrolled identities, persisted on every mutation.
pub struct EmbeddingStore {
    conn: Mutex<Connection>,
    dim: usize,
    entries: BTreeMap<String, EnrolledIdentity>,
}

impl EmbeddingStore {
    /// Open (or create) the store at `path` and load its contents.
    pub fn open(path: &Path, dim: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, dim)?;
        tracing::info!(
            path = %path.display(),
            identities = store.len(),
            "embedding store opened"
        );
        Ok(store)
    }

    /// Volatile store, used for tests and dry runs.
    pub fn open_in_memory(dim: usize) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, dim)
    }

    fn with_connection(conn: Connection, dim: usize) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let mut store = Self {
            conn: Mutex::new(conn),
            dim,
            entries: BTreeMap::new(),
        };
        store.load()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-read every identity from durable storage.
    ///
    /// The in-memory map is replaced only if the whole read succeeds.
    pub fn load(&mut self) -> Result<(), StoreError> {
        let loaded = {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT name, dim, embedding, created_at FROM faces ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut loaded = BTreeMap::new();
            for row in rows {
                let (name, dim, blob, created_at) = row?;
                let identity = decode_row(name, dim, &blob, &created_at, self.dim)?;
                loaded.insert(identity.name.clone(), identity);
            }
            loaded
        };
        self.entries = loaded;
        Ok(())
    }

    /// Insert or overwrite `name`, persisting before the map changes.
    pub fn enroll(&mut self, name: &str, embedding: Embedding) -> Result<&EnrolledIdentity, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        if embedding.dim() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(StoreError::InvalidEmbedding);
        }

        let identity = EnrolledIdentity {
            name: name.to_string(),
            embedding,
            created_at: Utc::now(),
        };
        let replaced = self.entries.contains_key(name);

        self.persist_upsert(&identity).map_err(|err| {
            tracing::warn!(name, error = %err, "enroll not persisted; store unchanged");
            err
        })?;

        tracing::info!(name, replaced, dim = self.dim, "identity enrolled");
        self.entries.insert(identity.name.clone(), identity);
        Ok(&self.entries[name])
    }

    /// Delete `name`, persisting before the map changes.
    pub fn remove(&mut self, name: &str) -> Result<EnrolledIdentity, StoreError> {
        let name = name.trim();
        if !self.entries.contains_key(name) {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let deleted = {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let n = tx.execute("DELETE FROM faces WHERE name = ?1", params![name])?;
            tx.commit()?;
            n
        };
        if deleted == 0 {
            // Row vanished underneath us (e.g. an external edit); the map
            // entry is stale either way.
            tracing::warn!(name, "identity missing from storage during remove");
        }

        tracing::info!(name, "identity removed");
        self.entries
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn persist_upsert(&self, identity: &EnrolledIdentity) -> Result<(), StoreError> {
        let blob = encode_embedding(&identity.embedding);
        let created_at = identity.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO faces (name, dim, embedding, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                dim = excluded.dim,
                embedding = excluded.embedding,
                created_at = excluded.created_at",
            params![identity.name, identity.embedding.dim() as i64, blob, created_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EnrolledIdentity> {
        self.entries.get(name.trim())
    }

    /// All identities, ordered by name.
    pub fn all(&self) -> impl Iterator<Item = &EnrolledIdentity> {
        self.entries.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[cfg(test)]
    fn make_read_only(&self) {
        self.conn().execute_batch("PRAGMA query_only = ON;").unwrap();
    }
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_row(
    name: String,
    dim: i64,
    blob: &[u8],
    created_at: &str,
    expected_dim: usize,
) -> Result<EnrolledIdentity, StoreError> {
    if blob.len() % 4 != 0 || blob.len() / 4 != dim as usize {
        return Err(StoreError::Corrupt {
            name,
            message: format!("{} blob bytes for declared dimension {dim}", blob.len()),
        });
    }
    if dim as usize != expected_dim {
        return Err(StoreError::DimensionMismatch {
            expected: expected_dim,
            actual: dim as usize,
        });
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| StoreError::Corrupt {
            name: name.clone(),
            message: format!("bad created_at {created_at:?}: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(EnrolledIdentity {
        name,
        embedding: Embedding::new(values),
        created_at,
    })
}
