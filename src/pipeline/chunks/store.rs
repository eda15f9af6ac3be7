//! Persistence for parsed chunk lists and synthesized section structures.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::types::Chunk;
use super::ChunkError;
use crate::pipeline::extraction::FieldStructure;

/// Keyed storage for parse results. One entry per document key.
pub trait ChunkStore: Send + Sync {
    fn load_chunks(&self, doc_key: &str) -> Result<Option<Vec<Chunk>>, ChunkError>;
    fn save_chunks(&self, doc_key: &str, chunks: &[Chunk]) -> Result<(), ChunkError>;
}

/// Stage-1 structures keyed by layout (document key) and section chunk set.
pub trait StructureStore: Send + Sync {
    fn load_structure(
        &self,
        layout_key: &str,
        section_key: &str,
    ) -> Result<Option<FieldStructure>, ChunkError>;

    fn save_structure(
        &self,
        layout_key: &str,
        section_key: &str,
        structure: &FieldStructure,
    ) -> Result<(), ChunkError>;
}

/// Stable key for a section's chunk set, e.g. `"3,4,7"`.
pub fn section_key(chunk_indices: &[usize]) -> String {
    chunk_indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS chunk_cache (
        doc_key TEXT PRIMARY KEY,
        chunks_json TEXT NOT NULL,
        chunk_count INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS section_structures (
        layout_key TEXT NOT NULL,
        section_key TEXT NOT NULL,
        structure_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (layout_key, section_key)
    );
";

// ═══════════════════════════════════════════════════════════
// SQLite
// ═══════════════════════════════════════════════════════════

/// SQLite-backed cache. The connection is serialized behind a mutex so the
/// store can be shared by the section workers.
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
}

impl SqliteCacheStore {
    /// Open (or create) the cache file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, ChunkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory cache (for testing).
    pub fn open_in_memory() -> Result<Self, ChunkError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ChunkError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, ChunkError>,
    ) -> Result<T, ChunkError> {
        let conn = self.conn.lock().map_err(|_| ChunkError::StoreLock)?;
        f(&*conn)
    }
}

impl ChunkStore for SqliteCacheStore {
    fn load_chunks(&self, doc_key: &str) -> Result<Option<Vec<Chunk>>, ChunkError> {
        let json: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT chunks_json FROM chunk_cache WHERE doc_key = ?1",
                    params![doc_key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        json.map(|j| {
            serde_json::from_str::<Vec<Chunk>>(&j)
                .map_err(|e| ChunkError::Serialization(e.to_string()))
        })
        .transpose()
    }

    fn save_chunks(&self, doc_key: &str, chunks: &[Chunk]) -> Result<(), ChunkError> {
        let json =
            serde_json::to_string(chunks).map_err(|e| ChunkError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO chunk_cache (doc_key, chunks_json, chunk_count, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![doc_key, json, chunks.len() as i64, now],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

impl StructureStore for SqliteCacheStore {
    fn load_structure(
        &self,
        layout_key: &str,
        section_key: &str,
    ) -> Result<Option<FieldStructure>, ChunkError> {
        let json: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT structure_json FROM section_structures
                     WHERE layout_key = ?1 AND section_key = ?2",
                    params![layout_key, section_key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        json.map(|j| {
            serde_json::from_str::<FieldStructure>(&j)
                .map_err(|e| ChunkError::Serialization(e.to_string()))
        })
        .transpose()
    }

    fn save_structure(
        &self,
        layout_key: &str,
        section_key: &str,
        structure: &FieldStructure,
    ) -> Result<(), ChunkError> {
        let json = serde_json::to_string(structure)
            .map_err(|e| ChunkError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO section_structures
                 (layout_key, section_key, structure_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![layout_key, section_key, json, now],
            )?;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════
// In-memory
// ═══════════════════════════════════════════════════════════

/// Process-local store with no persistence.
#[derive(Default)]
pub struct MemoryStore {
    chunks: Mutex<HashMap<String, Vec<Chunk>>>,
    structures: Mutex<HashMap<(String, String), FieldStructure>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryStore {
    fn load_chunks(&self, doc_key: &str) -> Result<Option<Vec<Chunk>>, ChunkError> {
        let map = self.chunks.lock().map_err(|_| ChunkError::StoreLock)?;
        Ok(map.get(doc_key).cloned())
    }

    fn save_chunks(&self, doc_key: &str, chunks: &[Chunk]) -> Result<(), ChunkError> {
        let mut map = self.chunks.lock().map_err(|_| ChunkError::StoreLock)?;
        map.insert(doc_key.to_string(), chunks.to_vec());
        Ok(())
    }
}

impl StructureStore for MemoryStore {
    fn load_structure(
        &self,
        layout_key: &str,
        section_key: &str,
    ) -> Result<Option<FieldStructure>, ChunkError> {
        let map = self.structures.lock().map_err(|_| ChunkError::StoreLock)?;
        Ok(map
            .get(&(layout_key.to_string(), section_key.to_string()))
            .cloned())
    }

    fn save_structure(
        &self,
        layout_key: &str,
        section_key: &str,
        structure: &FieldStructure,
    ) -> Result<(), ChunkError> {
        let mut map = self.structures.lock().map_err(|_| ChunkError::StoreLock)?;
        map.insert(
            (layout_key.to_string(), section_key.to_string()),
            structure.clone(),
        );
        Ok(())
    }
}
