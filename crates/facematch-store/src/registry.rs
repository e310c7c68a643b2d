//! Face registry: durable rows in SQLite, nearest-neighbour search over an
//! in-memory index.
//!
//! Inserts are durable as soon as `insert` returns but only become visible to
//! `search` after `flush`, which loads pending enrolled rows into the index.
//! Updates and deletes take effect on the index immediately.

use chrono::Utc;
use facematch_core::matching;
use facematch_core::{Match, Metadata};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("embedding dimension mismatch: registry holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("record {0} not found")]
    NotFound(u64),
    #[error("enrolled record must carry an identity id")]
    MissingIdentity,
    #[error("metadata is not valid JSON: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("registry directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry lock poisoned")]
    Poisoned,
}

/// Record selector shared by delete, query and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Id(u64),
    Identity(i64),
    /// Every enrolled (searchable) record.
    Enrolled,
    /// Every search query record.
    Queries,
    All,
}

impl Predicate {
    /// SQL condition and its single optional parameter.
    ///
    /// Ids beyond `i64::MAX` cannot exist in SQLite and select nothing.
    fn condition(&self) -> (&'static str, Option<i64>) {
        match *self {
            Predicate::Id(id) => match i64::try_from(id) {
                Ok(id) => ("id = ?1", Some(id)),
                Err(_) => ("0", None),
            },
            Predicate::Identity(identity) => ("identity_id = ?1", Some(identity)),
            Predicate::Enrolled => ("is_query = 0", None),
            Predicate::Queries => ("is_query = 1", None),
            Predicate::All => ("1", None),
        }
    }
}

/// A persisted face vector. The embedding is never serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceRecord {
    pub id: u64,
    pub identity_id: Option<i64>,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub is_query: bool,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
    pub metadata: Metadata,
    pub source_uri: Option<String>,
}

/// Insert request.
#[derive(Debug, Clone)]
pub struct NewFace {
    pub identity_id: Option<i64>,
    pub embedding: Vec<f32>,
    pub is_query: bool,
    pub metadata: Metadata,
    pub source_uri: Option<String>,
}

impl NewFace {
    pub fn enrolled(identity_id: i64, embedding: Vec<f32>) -> Self {
        Self {
            identity_id: Some(identity_id),
            embedding,
            is_query: false,
            metadata: Metadata::new(),
            source_uri: None,
        }
    }

    pub fn query(embedding: Vec<f32>) -> Self {
        Self {
            identity_id: None,
            embedding,
            is_query: true,
            metadata: Metadata::new(),
            source_uri: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_source(mut self, source_uri: Option<String>) -> Self {
        self.source_uri = source_uri;
        self
    }
}

/// Partial update: replaces the identity if given, merges metadata (new keys win).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordPatch {
    pub identity_id: Option<i64>,
    pub metadata: Option<Metadata>,
}

/// Registry operations used by the service layer.
pub trait FaceRegistry: Send + Sync {
    fn insert(&self, face: NewFace) -> Result<u64, RegistryError>;
    /// Barrier: everything inserted before this call is searchable after it.
    fn flush(&self) -> Result<(), RegistryError>;
    /// Enrolled records only, ascending distance, ties by smaller id.
    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Match>, RegistryError>;
    /// Delete matching records, returning their ids in ascending order.
    ///
    /// The ids are selected in the same transaction as the delete.
    fn delete(&self, predicate: &Predicate) -> Result<Vec<u64>, RegistryError>;
    fn query(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<FaceRecord>, RegistryError>;
    fn update(&self, id: u64, patch: &RecordPatch) -> Result<FaceRecord, RegistryError>;
    fn count(&self, predicate: &Predicate) -> Result<u64, RegistryError>;
    /// Embedding length fixed by the first insert, if any.
    fn dimension(&self) -> Result<Option<usize>, RegistryError>;
}

struct IndexedFace {
    id: u64,
    identity_id: i64,
    embedding: Vec<f32>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS faces (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        identity_id INTEGER,
        embedding   BLOB NOT NULL,
        is_query    INTEGER NOT NULL DEFAULT 0,
        created_at  INTEGER NOT NULL,
        metadata    TEXT NOT NULL DEFAULT '{}',
        source_uri  TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_faces_identity ON faces(identity_id);
    CREATE TABLE IF NOT EXISTS registry_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const RECORD_COLUMNS: &str = "id, identity_id, embedding, is_query, created_at, metadata, source_uri";

/// SQLite face registry.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    index: RwLock<Vec<IndexedFace>>,
    /// Enrolled ids inserted since the last flush.
    pending: Mutex<Vec<u64>>,
}

impl SqliteRegistry {
    /// Open (or create) the registry database and load enrolled rows into the index.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        crate::ensure_parent_dir(path)?;
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let registry = Self::with_connection(conn)?;
        tracing::info!(
            path = %path.display(),
            indexed = registry.indexed_len(),
            "face registry opened"
        );
        Ok(registry)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;

        let mut stmt = conn.prepare("SELECT id, identity_id, embedding FROM faces WHERE is_query = 0 ORDER BY id")?;
        let index = stmt
            .query_map([], |row| {
                Ok(IndexedFace {
                    id: row.get::<_, i64>(0)? as u64,
                    identity_id: row.get(1)?,
                    embedding: decode_embedding(&row.get::<_, Vec<u8>>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        Ok(Self {
            conn: Mutex::new(conn),
            index: RwLock::new(index),
            pending: Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    fn indexed_len(&self) -> usize {
        self.index.read().map(|idx| idx.len()).unwrap_or(0)
    }

    fn drop_from_index(&self, ids: &[u64]) -> Result<(), RegistryError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.pending
            .lock()
            .map_err(|_| RegistryError::Poisoned)?
            .retain(|id| !ids.contains(id));
        self.index
            .write()
            .map_err(|_| RegistryError::Poisoned)?
            .retain(|face| !ids.contains(&face.id));
        Ok(())
    }
}

impl FaceRegistry for SqliteRegistry {
    fn insert(&self, face: NewFace) -> Result<u64, RegistryError> {
        if face.embedding.is_empty() {
            return Err(RegistryError::EmptyEmbedding);
        }
        if !face.is_query && face.identity_id.is_none() {
            return Err(RegistryError::MissingIdentity);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        match stored_dimension(&tx)? {
            Some(expected) if expected != face.embedding.len() => {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: face.embedding.len(),
                });
            }
            Some(_) => {}
            None => {
                tx.execute(
                    "INSERT INTO registry_meta (key, value) VALUES ('dimension', ?1)",
                    params![face.embedding.len().to_string()],
                )?;
            }
        }

        tx.execute(
            "INSERT INTO faces (identity_id, embedding, is_query, created_at, metadata, source_uri)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                face.identity_id,
                encode_embedding(&face.embedding),
                face.is_query,
                Utc::now().timestamp(),
                serde_json::to_string(&face.metadata)?,
                face.source_uri,
            ],
        )?;
        let id = tx.last_insert_rowid() as u64;
        tx.commit()?;

        if !face.is_query {
            self.pending.lock().map_err(|_| RegistryError::Poisoned)?.push(id);
        }

        tracing::debug!(record_id = id, identity_id = ?face.identity_id, is_query = face.is_query, "face inserted");
        Ok(id)
    }

    fn flush(&self) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        let mut pending = self.pending.lock().map_err(|_| RegistryError::Poisoned)?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut loaded = Vec::with_capacity(pending.len());
        {
            let mut stmt =
                conn.prepare("SELECT identity_id, embedding FROM faces WHERE id = ?1 AND is_query = 0")?;
            for &id in pending.iter() {
                let row = stmt
                    .query_row(params![id as i64], |row| {
                        Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Vec<u8>>(1)?))
                    })
                    .optional()?;
                if let Some((Some(identity_id), blob)) = row {
                    loaded.push(IndexedFace {
                        id,
                        identity_id,
                        embedding: decode_embedding(&blob),
                    });
                }
            }
        }

        let count = loaded.len();
        let mut index = self.index.write().map_err(|_| RegistryError::Poisoned)?;
        index.retain(|face| !pending.contains(&face.id));
        index.extend(loaded);
        pending.clear();

        tracing::debug!(loaded = count, indexed = index.len(), "registry flushed");
        Ok(())
    }

    fn search(&self, embedding: &[f32], top_k: usize) -> Result<Vec<Match>, RegistryError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension()? {
            if expected != embedding.len() {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }

        let index = self.index.read().map_err(|_| RegistryError::Poisoned)?;
        let mut hits: Vec<Match> = index
            .iter()
            .map(|face| Match {
                record_id: face.id,
                identity_id: face.identity_id,
                distance: matching::distance(&face.embedding, embedding),
            })
            .collect();
        hits.sort_by(matching::rank);
        hits.truncate(top_k);
        Ok(hits)
    }

    fn delete(&self, predicate: &Predicate) -> Result<Vec<u64>, RegistryError> {
        let (condition, arg) = predicate.condition();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<u64> = {
            let mut stmt = tx.prepare(&format!("SELECT id FROM faces WHERE {condition} ORDER BY id"))?;
            let rows = stmt.query_map(params_from_iter(arg), |row| row.get::<_, i64>(0))?;
            rows.map(|r| r.map(|id| id as u64)).collect::<Result<_, _>>()?
        };
        tx.execute(&format!("DELETE FROM faces WHERE {condition}"), params_from_iter(arg))?;
        tx.commit()?;

        self.drop_from_index(&ids)?;
        tracing::debug!(?predicate, deleted = ids.len(), "faces deleted");
        Ok(ids)
    }

    fn query(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<FaceRecord>, RegistryError> {
        let (condition, arg) = predicate.condition();
        let limit = limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM faces WHERE {condition} ORDER BY id LIMIT {limit}"
        ))?;
        let rows = stmt.query_map(params_from_iter(arg), read_record_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    fn update(&self, id: u64, patch: &RecordPatch) -> Result<FaceRecord, RegistryError> {
        let Ok(sql_id) = i64::try_from(id) else {
            return Err(RegistryError::NotFound(id));
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM faces WHERE id = ?1"),
                params![sql_id],
                read_record_row,
            )
            .optional()?
            .ok_or(RegistryError::NotFound(id))??;

        let mut updated = current.clone();
        if let Some(identity_id) = patch.identity_id {
            updated.identity_id = Some(identity_id);
        }
        if let Some(metadata) = &patch.metadata {
            for (key, value) in metadata {
                updated.metadata.insert(key.clone(), value.clone());
            }
        }

        tx.execute("DELETE FROM faces WHERE id = ?1", params![sql_id])?;
        tx.execute(
            &format!("INSERT INTO faces ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                sql_id,
                updated.identity_id,
                encode_embedding(&updated.embedding),
                updated.is_query,
                updated.created_at,
                serde_json::to_string(&updated.metadata)?,
                updated.source_uri,
            ],
        )?;
        tx.commit()?;

        // Replace the index entry directly so the update is searchable without a flush.
        self.drop_from_index(&[id])?;
        if let (false, Some(identity_id)) = (updated.is_query, updated.identity_id) {
            self.index.write().map_err(|_| RegistryError::Poisoned)?.push(IndexedFace {
                id,
                identity_id,
                embedding: updated.embedding.clone(),
            });
        }

        tracing::debug!(record_id = id, identity_id = ?updated.identity_id, "face updated");
        Ok(updated)
    }

    fn count(&self, predicate: &Predicate) -> Result<u64, RegistryError> {
        let (condition, arg) = predicate.condition();
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM faces WHERE {condition}"),
            params_from_iter(arg),
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn dimension(&self) -> Result<Option<usize>, RegistryError> {
        let conn = self.conn()?;
        stored_dimension(&conn)
    }
}

fn stored_dimension(conn: &Connection) -> Result<Option<usize>, RegistryError> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM registry_meta WHERE key = 'dimension'", [], |row| row.get(0))
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()))
}

/// Row → record. Metadata decoding errors surface as the inner result.
fn read_record_row(row: &Row<'_>) -> rusqlite::Result<Result<FaceRecord, RegistryError>> {
    let metadata: String = row.get(5)?;
    let record = serde_json::from_str::<Metadata>(&metadata).map_err(RegistryError::from);
    Ok(match record {
        Ok(metadata) => Ok(FaceRecord {
            id: row.get::<_, i64>(0)? as u64,
            identity_id: row.get(1)?,
            embedding: decode_embedding(&row.get::<_, Vec<u8>>(2)?),
            is_query: row.get(3)?,
            created_at: row.get(4)?,
            metadata,
            source_uri: row.get(6)?,
        }),
        Err(e) => Err(e),
    })
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> SqliteRegistry {
        SqliteRegistry::open_in_memory().unwrap()
    }

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_insert_flush_search_round_trip() {
        let reg = registry();
        let id = reg.insert(NewFace::enrolled(42, vec![0.1, 0.2, 0.3])).unwrap();
        reg.flush().unwrap();

        let hits = reg.search(&[0.1, 0.2, 0.3], 5).unwrap();
        assert_eq!(hits[0].record_id, id);
        assert_eq!(hits[0].identity_id, 42);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_unflushed_insert_not_searchable() {
        let reg = registry();
        reg.insert(NewFace::enrolled(1, vec![1.0, 0.0])).unwrap();
        assert!(reg.search(&[1.0, 0.0], 5).unwrap().is_empty());
        // Durable before the flush.
        assert_eq!(reg.count(&Predicate::Enrolled).unwrap(), 1);
    }

    #[test]
    fn test_ids_monotonic_and_never_reused() {
        let reg = registry();
        let a = reg.insert(NewFace::enrolled(1, vec![1.0])).unwrap();
        let b = reg.insert(NewFace::enrolled(2, vec![2.0])).unwrap();
        assert!(b > a);
        reg.delete(&Predicate::Id(b)).unwrap();
        let c = reg.insert(NewFace::enrolled(3, vec![3.0])).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_concurrent_inserts_get_distinct_ids() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 25;
        let reg = Arc::new(registry());

        let ids: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let reg = Arc::clone(&reg);
                    scope.spawn(move || {
                        (0..PER_THREAD)
                            .map(|i| {
                                let face = if i % 2 == 0 {
                                    NewFace::enrolled(t as i64, vec![t as f32, i as f32])
                                } else {
                                    NewFace::query(vec![t as f32, i as f32])
                                };
                                reg.insert(face).unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let distinct: std::collections::HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(ids.len(), THREADS * PER_THREAD);
        assert_eq!(distinct.len(), ids.len());
        assert_eq!(reg.count(&Predicate::All).unwrap(), (THREADS * PER_THREAD) as u64);

        reg.flush().unwrap();
        let enrolled = reg.count(&Predicate::Enrolled).unwrap();
        assert_eq!(reg.search(&[0.0, 0.0], 1000).unwrap().len() as u64, enrolled);
    }

    #[test]
    fn test_query_records_never_searchable() {
        let reg = registry();
        reg.insert(NewFace::query(vec![0.5, 0.5])).unwrap();
        let enrolled = reg.insert(NewFace::enrolled(7, vec![0.9, 0.9])).unwrap();
        reg.flush().unwrap();

        let hits = reg.search(&[0.5, 0.5], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, enrolled);
    }

    #[test]
    fn test_search_ordering_and_top_k() {
        let reg = registry();
        let far = reg.insert(NewFace::enrolled(1, vec![3.0, 0.0])).unwrap();
        let near = reg.insert(NewFace::enrolled(2, vec![1.0, 0.0])).unwrap();
        let tie = reg.insert(NewFace::enrolled(3, vec![-1.0, 0.0])).unwrap();
        reg.flush().unwrap();

        let hits = reg.search(&[0.0, 0.0], 2).unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.record_id).collect();
        assert_eq!(ids, vec![near, tie]);
        assert!(!ids.contains(&far));
    }

    #[test]
    fn test_search_zero_top_k_and_empty_registry() {
        let reg = registry();
        assert!(reg.search(&[1.0], 5).unwrap().is_empty());
        reg.insert(NewFace::enrolled(1, vec![1.0])).unwrap();
        reg.flush().unwrap();
        assert!(reg.search(&[1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_fixed_by_first_insert() {
        let reg = registry();
        assert_eq!(reg.dimension().unwrap(), None);
        reg.insert(NewFace::enrolled(1, vec![0.0; 4])).unwrap();
        assert_eq!(reg.dimension().unwrap(), Some(4));

        let err = reg.insert(NewFace::enrolled(2, vec![0.0; 3])).unwrap_err();
        assert!(matches!(err, RegistryError::DimensionMismatch { expected: 4, actual: 3 }));
        let err = reg.search(&[0.0; 5], 1).unwrap_err();
        assert!(matches!(err, RegistryError::DimensionMismatch { expected: 4, actual: 5 }));
        assert_eq!(reg.count(&Predicate::All).unwrap(), 1);
    }

    #[test]
    fn test_enrolled_requires_identity() {
        let reg = registry();
        let mut face = NewFace::query(vec![1.0]);
        face.is_query = false;
        assert!(matches!(reg.insert(face), Err(RegistryError::MissingIdentity)));
        assert!(matches!(reg.insert(NewFace::enrolled(1, vec![])), Err(RegistryError::EmptyEmbedding)));
    }

    #[test]
    fn test_delete_idempotent() {
        let reg = registry();
        let id = reg.insert(NewFace::enrolled(1, vec![1.0])).unwrap();
        reg.flush().unwrap();

        assert_eq!(reg.delete(&Predicate::Id(id)).unwrap(), vec![id]);
        assert!(reg.delete(&Predicate::Id(id)).unwrap().is_empty());
        assert!(reg.delete(&Predicate::Id(9999)).unwrap().is_empty());
        assert!(reg.delete(&Predicate::Id(u64::MAX)).unwrap().is_empty());
        assert!(reg.search(&[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_delete_pending_record_never_surfaces() {
        let reg = registry();
        let id = reg.insert(NewFace::enrolled(1, vec![1.0])).unwrap();
        reg.delete(&Predicate::Id(id)).unwrap();
        reg.flush().unwrap();
        assert!(reg.search(&[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_delete_by_identity_and_partition() {
        let reg = registry();
        let a = reg.insert(NewFace::enrolled(5, vec![1.0])).unwrap();
        let b = reg.insert(NewFace::enrolled(5, vec![2.0])).unwrap();
        reg.insert(NewFace::enrolled(6, vec![3.0])).unwrap();
        let q = reg.insert(NewFace::query(vec![4.0])).unwrap();
        reg.flush().unwrap();

        assert_eq!(reg.delete(&Predicate::Identity(5)).unwrap(), vec![a, b]);
        assert_eq!(reg.delete(&Predicate::Queries).unwrap(), vec![q]);
        assert_eq!(reg.count(&Predicate::All).unwrap(), 1);
        let hits = reg.search(&[1.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_id, 6);
    }

    #[test]
    fn test_query_ordered_with_limit() {
        let reg = registry();
        let ids: Vec<u64> = (0..4)
            .map(|i| reg.insert(NewFace::enrolled(42, vec![i as f32])).unwrap())
            .collect();

        let records = reg.query(&Predicate::Identity(42), None).unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), ids);

        let limited = reg.query(&Predicate::All, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, ids[0]);
    }

    #[test]
    fn test_record_serialization_omits_embedding() {
        let reg = registry();
        let id = reg
            .insert(
                NewFace::query(vec![1.0, 2.0])
                    .with_metadata(meta(json!({"source_uri": "s3://b/k.jpg"})))
                    .with_source(Some("s3://b/k.jpg".into())),
            )
            .unwrap();
        let record = reg.query(&Predicate::Id(id), None).unwrap().remove(0);
        assert_eq!(record.embedding, vec![1.0, 2.0]);

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("embedding").is_none());
        assert_eq!(value["source_uri"], "s3://b/k.jpg");
        assert_eq!(value["is_query"], true);
    }

    #[test]
    fn test_update_preserves_fields_and_merges_metadata() {
        let reg = registry();
        let id = reg
            .insert(NewFace::enrolled(1, vec![0.5, 0.5]).with_metadata(meta(json!({"a": 1, "b": 2}))))
            .unwrap();
        let before = reg.query(&Predicate::Id(id), None).unwrap().remove(0);

        let patch = RecordPatch {
            identity_id: Some(9),
            metadata: Some(meta(json!({"b": 3, "c": 4}))),
        };
        let after = reg.update(id, &patch).unwrap();

        assert_eq!(after.id, id);
        assert_eq!(after.identity_id, Some(9));
        assert_eq!(after.embedding, before.embedding);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.is_query, before.is_query);
        assert_eq!(after.metadata, meta(json!({"a": 1, "b": 3, "c": 4})));

        // Searchable immediately under the new identity, without a flush.
        let hits = reg.search(&[0.5, 0.5], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].identity_id, 9);
        assert_eq!(reg.query(&Predicate::Id(id), None).unwrap()[0], after);
    }

    #[test]
    fn test_update_unknown_id() {
        let reg = registry();
        assert!(matches!(
            reg.update(77, &RecordPatch::default()),
            Err(RegistryError::NotFound(77))
        ));
    }

    #[test]
    fn test_reopen_loads_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/faces.db");
        let id = {
            let reg = SqliteRegistry::open(&path).unwrap();
            let id = reg.insert(NewFace::enrolled(3, vec![0.2, 0.4])).unwrap();
            reg.flush().unwrap();
            id
        };

        let reg = SqliteRegistry::open(&path).unwrap();
        let hits = reg.search(&[0.2, 0.4], 1).unwrap();
        assert_eq!(hits[0].record_id, id);
        assert_eq!(reg.dimension().unwrap(), Some(2));
    }

    #[test]
    fn test_patch_rejects_unknown_fields() {
        assert!(serde_json::from_str::<RecordPatch>(r#"{"embedding": [1.0]}"#).is_err());
        let patch: RecordPatch = serde_json::from_str(r#"{"identity_id": 4}"#).unwrap();
        assert_eq!(patch.identity_id, Some(4));
    }
}
