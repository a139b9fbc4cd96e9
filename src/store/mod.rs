//! Durable store: tools, capabilities, embeddings, episodic traces, and
//! SHGAT parameter snapshots in a single SQLite file, with an in-memory
//! cosine index over the embedding table.

mod vector;

pub use vector::VectorIndex;

use crate::embedding::EmbeddingBackend;
use crate::error::{PmlError, Result};
use crate::graph::{Capability, EpisodicTrace, ToolRecord};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of a tool upsert. `SchemaChanged` carries the previous schema
/// hash so the caller can decide whether to re-embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolUpsert {
    Inserted,
    Unchanged,
    SchemaChanged { old_schema_hash: String },
}

#[derive(Debug)]
pub struct Store {
    db_path: PathBuf,
    dimension: usize,
    vectors: RwLock<VectorIndex>,
    episodes: Mutex<VecDeque<EpisodicTrace>>,
    ring_capacity: usize,
}

impl Store {
    /// Open (or create) the store. Fails with `DimensionMismatch` when the
    /// configured embedding dimension disagrees with already-stored vectors.
    pub fn open(db_path: impl AsRef<Path>, dimension: usize, ring_capacity: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            db_path,
            dimension,
            vectors: RwLock::new(VectorIndex::new(dimension)?),
            episodes: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
        };
        store.ensure_schema()?;
        store.check_dimension()?;
        store.hydrate()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tool_schema (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                schema_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS embedding (
                id TEXT PRIMARY KEY,
                dim INTEGER NOT NULL,
                vector BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS capability (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                members_json TEXT NOT NULL,
                children_json TEXT NOT NULL,
                parents_json TEXT NOT NULL,
                successes INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS episode (
                ts TEXT NOT NULL,
                intent TEXT NOT NULL,
                context_json TEXT NOT NULL,
                cap_id TEXT NOT NULL,
                outcome INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS shgat_params (
                version INTEGER NOT NULL,
                blob BLOB NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn check_dimension(&self) -> Result<()> {
        let conn = self.connect()?;
        let stored: Option<i64> = conn
            .query_row(
                "SELECT dim FROM embedding WHERE dim != ?1 LIMIT 1",
                params![self.dimension as i64],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(dim) => Err(PmlError::DimensionMismatch {
                expected: self.dimension,
                actual: dim as usize,
            }),
            None => Ok(()),
        }
    }

    /// Load the embedding table into the cosine index and the episode tail
    /// into the ring.
    fn hydrate(&self) -> Result<()> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id, vector FROM embedding")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;
        let mut batch = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            batch.push((id, blob_to_vec(&blob)));
        }
        if !batch.is_empty() {
            self.vectors.write().upsert_batch(batch)?;
        }

        let mut stmt = conn.prepare(
            "SELECT ts, intent, context_json, cap_id, outcome FROM episode
             ORDER BY rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![self.ring_capacity as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut ring = self.episodes.lock();
        let mut loaded = Vec::new();
        for row in rows {
            let (ts, intent, context_json, cap_id, outcome) = row?;
            loaded.push(EpisodicTrace {
                ts: ts
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
                intent,
                context_tools: serde_json::from_str(&context_json)?,
                capability_id: cap_id,
                outcome: outcome != 0,
            });
        }
        // Rows came newest-first; the ring is oldest-first.
        for trace in loaded.into_iter().rev() {
            ring.push_back(trace);
        }
        debug!(
            vectors = self.vectors.read().len(),
            episodes = ring.len(),
            "store hydrated"
        );
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or refresh a tool schema + embedding in one transaction.
    pub fn upsert_tool(&self, tool: &ToolRecord) -> Result<ToolUpsert> {
        if tool.embedding.len() != self.dimension {
            return Err(PmlError::DimensionMismatch {
                expected: self.dimension,
                actual: tool.embedding.len(),
            });
        }
        let schema_json = serde_json::to_string(&tool.input_schema)?;
        let schema_hash = hash_schema(&schema_json);

        let mut conn = self.connect()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT schema_hash FROM tool_schema WHERE id = ?1",
                params![tool.id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match &existing {
            None => ToolUpsert::Inserted,
            Some(old) if *old == schema_hash => ToolUpsert::Unchanged,
            Some(old) => ToolUpsert::SchemaChanged {
                old_schema_hash: old.clone(),
            },
        };

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO tool_schema (id, provider, name, description, schema_json, schema_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                schema_json = excluded.schema_json,
                schema_hash = excluded.schema_hash",
            params![
                tool.id,
                tool.provider,
                tool.name,
                tool.description,
                schema_json,
                schema_hash,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.execute(
            "INSERT INTO embedding (id, dim, vector) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector",
            params![tool.id, self.dimension as i64, vec_to_blob(&tool.embedding)],
        )?;
        tx.commit()?;

        self.vectors.write().upsert(&tool.id, tool.embedding.clone())?;
        Ok(outcome)
    }

    /// Insert or refresh a capability. Embeds the description through the
    /// backend when the record carries no vector yet.
    pub fn upsert_capability(
        &self,
        capability: &mut Capability,
        backend: &dyn EmbeddingBackend,
    ) -> Result<()> {
        if capability.embedding.is_empty() {
            capability.embedding = backend.embed_one(&capability.description)?;
        }
        if capability.embedding.len() != self.dimension {
            return Err(PmlError::DimensionMismatch {
                expected: self.dimension,
                actual: capability.embedding.len(),
            });
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO capability (id, description, members_json, children_json, parents_json, successes, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                members_json = excluded.members_json,
                children_json = excluded.children_json,
                parents_json = excluded.parents_json,
                successes = excluded.successes,
                attempts = excluded.attempts",
            params![
                capability.id,
                capability.description,
                serde_json::to_string(&capability.members)?,
                serde_json::to_string(&capability.children)?,
                serde_json::to_string(&capability.parents)?,
                capability.successes,
                capability.attempts
            ],
        )?;
        tx.execute(
            "INSERT INTO embedding (id, dim, vector) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET dim = excluded.dim, vector = excluded.vector",
            params![
                capability.id,
                self.dimension as i64,
                vec_to_blob(&capability.embedding)
            ],
        )?;
        tx.commit()?;

        self.vectors
            .write()
            .upsert(&capability.id, capability.embedding.clone())?;
        Ok(())
    }

    pub fn remove_capability(&self, id: &str) -> Result<()> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM capability WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(PmlError::not_found("capability", id));
        }
        conn.execute("DELETE FROM embedding WHERE id = ?1", params![id])?;
        self.vectors.write().remove(id)?;
        Ok(())
    }

    pub fn remove_tool(&self, id: &str) -> Result<()> {
        let conn = self.connect()?;
        let removed = conn.execute("DELETE FROM tool_schema WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(PmlError::not_found("tool", id));
        }
        conn.execute("DELETE FROM embedding WHERE id = ?1", params![id])?;
        self.vectors.write().remove(id)?;
        Ok(())
    }

    pub fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        if let Some(vector) = self.vectors.read().get(id) {
            return Ok(Some(vector.clone()));
        }
        let conn = self.connect()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embedding WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| blob_to_vec(&b)))
    }

    /// Dense nearest neighbors over every stored vector.
    pub fn top_k_cosine(&self, query: &[f32], k: usize, min_sim: f32) -> Result<Vec<(String, f32)>> {
        self.vectors.read().top_k(query, k, min_sim)
    }

    pub fn append_episode(&self, trace: EpisodicTrace) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO episode (ts, intent, context_json, cap_id, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                trace.ts.to_rfc3339(),
                trace.intent,
                serde_json::to_string(&trace.context_tools)?,
                trace.capability_id,
                i64::from(trace.outcome)
            ],
        )?;
        // Keep the table bounded to the ring size.
        conn.execute(
            "DELETE FROM episode WHERE rowid NOT IN
                (SELECT rowid FROM episode ORDER BY rowid DESC LIMIT ?1)",
            params![self.ring_capacity as i64],
        )?;

        let mut ring = self.episodes.lock();
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(trace);
        Ok(())
    }

    /// The most recent `n` traces, oldest first.
    pub fn recent_episodes(&self, n: usize) -> Vec<EpisodicTrace> {
        let ring = self.episodes.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.lock().len()
    }

    pub fn save_params(&self, version: u32, blob: &[u8]) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO shgat_params (version, blob, created_at) VALUES (?1, ?2, ?3)",
            params![version, blob, Utc::now().to_rfc3339()],
        )?;
        // Only the latest snapshot matters.
        conn.execute(
            "DELETE FROM shgat_params WHERE rowid NOT IN
                (SELECT rowid FROM shgat_params ORDER BY rowid DESC LIMIT 4)",
            [],
        )?;
        Ok(())
    }

    pub fn load_params(&self) -> Result<Option<(u32, Vec<u8>)>> {
        let conn = self.connect()?;
        let row: Option<(u32, Vec<u8>)> = conn
            .query_row(
                "SELECT version, blob FROM shgat_params ORDER BY rowid DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Rehydrate all tool records (embeddings included) for registry rebuild.
    pub fn load_tools(&self) -> Result<Vec<ToolRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, provider, name, description, schema_json FROM tool_schema ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let vectors = self.vectors.read();
        let mut tools = Vec::new();
        for row in rows {
            let (id, provider, name, description, schema_json) = row?;
            tools.push(ToolRecord {
                embedding: vectors.get(&id).cloned().unwrap_or_default(),
                id,
                provider,
                name,
                description,
                input_schema: serde_json::from_str(&schema_json)?,
                community: None,
                pagerank: 0.0,
            });
        }
        Ok(tools)
    }

    pub fn load_capabilities(&self) -> Result<Vec<Capability>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, description, members_json, children_json, parents_json, successes, attempts
             FROM capability ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
            ))
        })?;
        let vectors = self.vectors.read();
        let mut capabilities = Vec::new();
        for row in rows {
            let (id, description, members_json, children_json, parents_json, successes, attempts) =
                row?;
            capabilities.push(Capability {
                embedding: vectors.get(&id).cloned().unwrap_or_default(),
                id,
                description,
                members: serde_json::from_str(&members_json)?,
                children: serde_json::from_str(&children_json)?,
                parents: serde_json::from_str(&parents_json)?,
                successes,
                attempts,
            });
        }
        Ok(capabilities)
    }
}

fn hash_schema(schema_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbeddingBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    const DIM: usize = 16;

    fn tool(id: &str, backend: &MockEmbeddingBackend) -> ToolRecord {
        let (provider, name) = ToolRecord::split_id(id).unwrap();
        ToolRecord {
            id: id.to_string(),
            provider: provider.to_string(),
            name: name.to_string(),
            description: format!("tool {id}"),
            input_schema: json!({"type": "object"}),
            embedding: backend.embed_one(&format!("tool {id}")).unwrap(),
            community: None,
            pagerank: 0.0,
        }
    }

    fn open(dir: &TempDir) -> Store {
        Store::open(dir.path().join("pml.db"), DIM, 64).unwrap()
    }

    #[test]
    fn upsert_tool_reports_schema_drift() {
        let dir = TempDir::new().unwrap();
        let backend = MockEmbeddingBackend::hashed(DIM);
        let store = open(&dir);

        let mut record = tool("fs:read", &backend);
        assert_eq!(store.upsert_tool(&record).unwrap(), ToolUpsert::Inserted);
        assert_eq!(store.upsert_tool(&record).unwrap(), ToolUpsert::Unchanged);

        record.input_schema = json!({"type": "object", "properties": {"path": {"type": "string"}}});
        match store.upsert_tool(&record).unwrap() {
            ToolUpsert::SchemaChanged { old_schema_hash } => {
                assert_eq!(old_schema_hash.len(), 64);
            }
            other => panic!("expected SchemaChanged, got {other:?}"),
        }
    }

    #[test]
    fn reopen_preserves_vectors_and_rejects_dim_change() {
        let dir = TempDir::new().unwrap();
        let backend = MockEmbeddingBackend::hashed(DIM);
        {
            let store = open(&dir);
            store.upsert_tool(&tool("fs:read", &backend)).unwrap();
        }
        let store = open(&dir);
        assert!(store.get_embedding("fs:read").unwrap().is_some());
        let hits = store
            .top_k_cosine(&backend.embed_one("tool fs:read").unwrap(), 1, 0.3)
            .unwrap();
        assert_eq!(hits[0].0, "fs:read");

        let err = Store::open(dir.path().join("pml.db"), DIM * 2, 64).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn capability_is_embedded_when_missing() {
        let dir = TempDir::new().unwrap();
        let backend = MockEmbeddingBackend::hashed(DIM);
        let store = open(&dir);
        let mut capability =
            Capability::leaf("cap__read_json", "read a file then parse json", vec!["fs:read".into()]);
        store.upsert_capability(&mut capability, &backend).unwrap();
        assert_eq!(capability.embedding.len(), DIM);
        assert_eq!(
            store.get_embedding("cap__read_json").unwrap().unwrap(),
            capability.embedding
        );
    }

    #[test]
    fn episode_ring_is_bounded_and_ordered() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("pml.db"), DIM, 4).unwrap();
        for i in 0..6 {
            store
                .append_episode(EpisodicTrace {
                    ts: Utc::now(),
                    intent: format!("intent {i}"),
                    context_tools: vec![],
                    capability_id: "cap__x".into(),
                    outcome: i % 2 == 0,
                })
                .unwrap();
        }
        let recent = store.recent_episodes(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent.first().unwrap().intent, "intent 2");
        assert_eq!(recent.last().unwrap().intent, "intent 5");
        assert_eq!(store.recent_episodes(2).len(), 2);
    }

    #[test]
    fn episodes_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path().join("pml.db"), DIM, 8).unwrap();
            store
                .append_episode(EpisodicTrace {
                    ts: Utc::now(),
                    intent: "persisted".into(),
                    context_tools: vec!["fs:read".into()],
                    capability_id: "cap__x".into(),
                    outcome: true,
                })
                .unwrap();
        }
        let store = Store::open(dir.path().join("pml.db"), DIM, 8).unwrap();
        let recent = store.recent_episodes(8);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].intent, "persisted");
        assert!(recent[0].outcome);
    }

    #[test]
    fn params_round_trip_latest_wins() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert!(store.load_params().unwrap().is_none());
        store.save_params(1, b"first").unwrap();
        store.save_params(1, b"second").unwrap();
        let (version, blob) = store.load_params().unwrap().unwrap();
        assert_eq!(version, 1);
        assert_eq!(blob, b"second");
    }

    #[test]
    fn load_capabilities_round_trips() {
        let dir = TempDir::new().unwrap();
        let backend = MockEmbeddingBackend::hashed(DIM);
        let store = open(&dir);
        let mut capability = Capability::leaf(
            "cap__pipeline",
            "read then parse",
            vec!["fs:read".into(), "json:parse".into()],
        );
        capability.successes = 3;
        capability.attempts = 4;
        store.upsert_capability(&mut capability, &backend).unwrap();

        let loaded = store.load_capabilities().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].members, capability.members);
        assert_eq!(loaded[0].successes, 3);
        assert_eq!(loaded[0].embedding, capability.embedding);
    }
}
