//! Default persistent backend: sqlite-vec.
//!
//! Dual-table design: `vec_meta` holds the message id, document, and
//! metadata columns; the `vec0` virtual table holds the embeddings keyed
//! by the meta rowid. KNN queries run against the virtual table, then the
//! matching meta rows are fetched by rowid.

use std::path::Path;
use std::sync::{Mutex, Once};

use rusqlite::{params, Connection};
use tracing::info;

use crate::backend::{QueryHit, VectorBackend, VectorMetadata};
use crate::error::{Result, VectorError};

static SQLITE_VEC_INIT: Once = Once::new();

/// Candidates fetched beyond `k` when a role filter is applied post-KNN.
const FILTER_OVERFETCH: usize = 4;

/// sqlite-vec backed vector storage. All operations serialize through one
/// connection mutex.
pub struct SqliteVecBackend {
    db: Mutex<Connection>,
    dimension: usize,
}

impl SqliteVecBackend {
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vec_meta (
                rowid           INTEGER PRIMARY KEY,
                id              TEXT NOT NULL UNIQUE,
                document        TEXT NOT NULL,
                conversation_id TEXT NOT NULL DEFAULT '',
                role            TEXT NOT NULL DEFAULT '',
                model           TEXT NOT NULL DEFAULT '',
                timestamp       TEXT NOT NULL DEFAULT ''
            );",
        )?;
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vec_embeddings
                 USING vec0(embedding float[{dimension}] distance_metric=cosine)"
            ),
            [],
        )?;

        info!(path = %path.display(), dimension, "sqlite-vec backend initialised");
        Ok(Self { db: Mutex::new(conn), dimension })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                got: vector.len(),
                expected: self.dimension,
            });
        }
        Ok(())
    }
}

impl VectorBackend for SqliteVecBackend {
    fn upsert(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        documents: &[String],
        metadatas: &[VectorMetadata],
    ) -> Result<()> {
        let db = self.db.lock().expect("vector backend poisoned");
        for (((id, vector), document), meta) in
            ids.iter().zip(vectors).zip(documents).zip(metadatas)
        {
            self.check_dimension(vector)?;

            // Existing entry: replace both rows keyed by the same rowid
            let existing: Option<i64> = db
                .query_row("SELECT rowid FROM vec_meta WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .ok();
            if let Some(rowid) = existing {
                db.execute("DELETE FROM vec_embeddings WHERE rowid = ?1", params![rowid])?;
                db.execute(
                    "UPDATE vec_meta
                     SET document = ?1, conversation_id = ?2, role = ?3, model = ?4, timestamp = ?5
                     WHERE rowid = ?6",
                    params![document, meta.conversation_id, meta.role, meta.model, meta.timestamp, rowid],
                )?;
                db.execute(
                    "INSERT INTO vec_embeddings (rowid, embedding) VALUES (?1, ?2)",
                    params![rowid, vector_json(vector)],
                )?;
            } else {
                db.execute(
                    "INSERT INTO vec_meta (id, document, conversation_id, role, model, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, document, meta.conversation_id, meta.role, meta.model, meta.timestamp],
                )?;
                let rowid = db.last_insert_rowid();
                db.execute(
                    "INSERT INTO vec_embeddings (rowid, embedding) VALUES (?1, ?2)",
                    params![rowid, vector_json(vector)],
                )?;
            }
        }
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize, role_filter: Option<&str>) -> Result<Vec<QueryHit>> {
        self.check_dimension(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        // Role filtering happens after KNN, so fetch extra candidates
        let fetch_k = if role_filter.is_some() { k * FILTER_OVERFETCH } else { k };

        let db = self.db.lock().expect("vector backend poisoned");
        let mut stmt = db.prepare(
            "SELECT rowid, distance FROM vec_embeddings
             WHERE embedding MATCH ?1 AND k = ?2
             ORDER BY distance",
        )?;
        let knn: Vec<(i64, f32)> = stmt
            .query_map(params![vector_json(vector), fetch_k as i64], |row| {
                Ok((row.get(0)?, row.get::<_, f64>(1)? as f32))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut meta_stmt = db.prepare(
            "SELECT id, document, conversation_id, role, model, timestamp
             FROM vec_meta WHERE rowid = ?1",
        )?;

        let mut hits = Vec::with_capacity(k);
        for (rowid, distance) in knn {
            let row = meta_stmt.query_row(params![rowid], |row| {
                Ok(QueryHit {
                    id: row.get(0)?,
                    document: row.get(1)?,
                    metadata: VectorMetadata {
                        conversation_id: row.get(2)?,
                        role: row.get(3)?,
                        model: row.get(4)?,
                        timestamp: row.get(5)?,
                    },
                    distance,
                })
            });
            let hit = match row {
                Ok(h) => h,
                Err(_) => continue,
            };
            if let Some(role) = role_filter {
                if hit.metadata.role != role {
                    continue;
                }
            }
            hits.push(hit);
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    fn count(&self) -> Result<u64> {
        let db = self.db.lock().expect("vector backend poisoned");
        let n: i64 = db.query_row("SELECT COUNT(*) FROM vec_meta", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

/// sqlite-vec accepts vectors as JSON text (e.g. "[0.1,0.2,0.3]").
fn vector_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::l2_normalize;

    fn meta(conv: &str, role: &str) -> VectorMetadata {
        VectorMetadata {
            conversation_id: conv.to_string(),
            role: role.to_string(),
            model: "m".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    fn backend() -> (tempfile::TempDir, SqliteVecBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteVecBackend::open(dir.path().join("vectors.db"), 3).unwrap();
        (dir, backend)
    }

    #[test]
    fn upsert_query_count_round_trip() {
        let (_dir, b) = backend();
        b.upsert(
            &["a".to_string(), "b".to_string()],
            &[
                l2_normalize(vec![1.0, 0.0, 0.0]),
                l2_normalize(vec![0.0, 1.0, 0.0]),
            ],
            &["doc a".to_string(), "doc b".to_string()],
            &[meta("c1", "user"), meta("c2", "assistant")],
        )
        .unwrap();
        assert_eq!(b.count().unwrap(), 2);

        let hits = b.query(&l2_normalize(vec![0.9, 0.1, 0.0]), 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[test]
    fn upsert_replaces_existing_id() {
        let (_dir, b) = backend();
        b.upsert(
            &["a".to_string()],
            &[l2_normalize(vec![1.0, 0.0, 0.0])],
            &["old".to_string()],
            &[meta("c1", "user")],
        )
        .unwrap();
        b.upsert(
            &["a".to_string()],
            &[l2_normalize(vec![0.0, 0.0, 1.0])],
            &["new".to_string()],
            &[meta("c1", "user")],
        )
        .unwrap();

        assert_eq!(b.count().unwrap(), 1);
        let hits = b.query(&l2_normalize(vec![0.0, 0.0, 1.0]), 1, None).unwrap();
        assert_eq!(hits[0].document, "new");
    }

    #[test]
    fn role_filter_drops_other_roles() {
        let (_dir, b) = backend();
        b.upsert(
            &["a".to_string(), "b".to_string()],
            &[
                l2_normalize(vec![1.0, 0.0, 0.0]),
                l2_normalize(vec![1.0, 0.1, 0.0]),
            ],
            &["user doc".to_string(), "assistant doc".to_string()],
            &[meta("c1", "user"), meta("c1", "assistant")],
        )
        .unwrap();

        let hits = b.query(&l2_normalize(vec![1.0, 0.0, 0.0]), 5, Some("assistant")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.role, "assistant");
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let (_dir, b) = backend();
        let err = b.query(&[1.0, 0.0], 1, None).unwrap_err();
        assert!(matches!(err, VectorError::DimensionMismatch { got: 2, expected: 3 }));
    }
}
