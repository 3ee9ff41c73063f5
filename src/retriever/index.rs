//! SQLite-backed similarity index of retrieved web documents.
//!
//! Two tables: `documents` (one row per fetched page, with its embedding) and
//! `queries` (one row per answered retrieval query, pointing at the documents
//! it produced). A fresh index is seeded with a single empty placeholder
//! document; it never surfaces in results because its body is empty.

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::embed::cosine_similarity;

pub const DEFAULT_INDEX_PATH: &str = ".crossprompt_index.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedDocument {
    pub doc_hash: String,
    pub url: String,
    pub title: String,
    pub body: String,
}

impl IndexedDocument {
    pub fn new(url: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        let url = url.into();
        let body = body.into();
        let doc_hash = if url.is_empty() {
            hash_text(&body)
        } else {
            hash_text(&url)
        };
        Self {
            doc_hash,
            url,
            title: title.into(),
            body,
        }
    }
}

/// A previously answered query close enough to reuse.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    pub query: String,
    pub similarity: f32,
    pub doc_hashes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub queries: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[derive(Clone)]
pub struct SimilarityIndex {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SimilarityIndex {
    /// Open the snapshot at `path`, creating and seeding it if absent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let existed = path.exists();
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn, !existed)?;
        tracing::debug!(path = %path.display(), from_snapshot = existed, "similarity index opened");

        Ok(Self {
            path: Some(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Process-local index with no snapshot.
    pub fn in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn, true)?;
        Ok(Self {
            path: None,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Advisory lock against other processes writing the same snapshot.
    pub fn lock_exclusive(&self) -> Result<Option<IndexLock>, IndexError> {
        match &self.path {
            Some(path) => IndexLock::new(path).map(Some),
            None => Ok(None),
        }
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, IndexError>
    where
        F: FnOnce(&Connection) -> Result<R, IndexError>,
    {
        let guard = self.conn.lock().map_err(|_| IndexError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, IndexError>
    where
        F: FnOnce(&Connection) -> Result<R, IndexError> + Send + 'static,
        R: Send + 'static,
    {
        let index = self.clone();
        tokio::task::spawn_blocking(move || index.with_conn(f))
            .await
            .map_err(|e| IndexError::Join(e.to_string()))?
    }

    /// Best previously answered query with similarity >= `min_similarity`.
    pub async fn nearest_query(
        &self,
        embedding: Vec<f32>,
        min_similarity: f32,
    ) -> Result<Option<CachedQuery>, IndexError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT query, embedding, doc_hashes FROM queries")?;
            let mut rows = stmt.query([])?;
            let mut best: Option<CachedQuery> = None;
            while let Some(row) = rows.next()? {
                let blob: Vec<u8> = row.get(1)?;
                let similarity = cosine_similarity(&embedding, &decode_embedding(&blob));
                if similarity < min_similarity {
                    continue;
                }
                if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                    let doc_hashes: String = row.get(2)?;
                    best = Some(CachedQuery {
                        query: row.get(0)?,
                        similarity,
                        doc_hashes: serde_json::from_str(&doc_hashes)
                            .map_err(|e| IndexError::Serde(e.to_string()))?,
                    });
                }
            }

            if let Some(found) = &best {
                conn.execute(
                    "UPDATE queries SET hit_count = hit_count + 1, updated_at = ?1 WHERE query_hash = ?2",
                    params![now_epoch(), hash_text(&found.query)],
                )?;
            }
            Ok(best)
        })
        .await
    }

    /// Documents for `hashes`, in the given order; unknown hashes are skipped.
    pub async fn documents(&self, hashes: Vec<String>) -> Result<Vec<IndexedDocument>, IndexError> {
        self.blocking(move |conn| {
            let mut out = Vec::with_capacity(hashes.len());
            for hash in &hashes {
                if let Some(doc) = select_document(conn, "doc_hash", hash)? {
                    touch_document(conn, &doc.doc_hash)?;
                    out.push(doc);
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn document_for_url(&self, url: String) -> Result<Option<IndexedDocument>, IndexError> {
        self.blocking(move |conn| {
            let doc = select_document(conn, "url", &url)?;
            if let Some(doc) = &doc {
                touch_document(conn, &doc.doc_hash)?;
            }
            Ok(doc)
        })
        .await
    }

    pub async fn insert_document(
        &self,
        doc: IndexedDocument,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO documents (doc_hash, url, title, body, embedding, created_at, updated_at)\
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)\
                 ON CONFLICT(doc_hash) DO UPDATE SET \
                    title = excluded.title,\
                    body = excluded.body,\
                    embedding = excluded.embedding,\
                    updated_at = excluded.updated_at",
                params![
                    doc.doc_hash,
                    doc.url,
                    doc.title,
                    doc.body,
                    encode_embedding(&embedding),
                    now,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn record_query(
        &self,
        query: String,
        embedding: Vec<f32>,
        doc_hashes: Vec<String>,
    ) -> Result<(), IndexError> {
        self.blocking(move |conn| {
            let now = now_epoch();
            let hashes =
                serde_json::to_string(&doc_hashes).map_err(|e| IndexError::Serde(e.to_string()))?;
            conn.execute(
                "INSERT INTO queries (query_hash, query, embedding, doc_hashes, created_at, updated_at)\
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)\
                 ON CONFLICT(query_hash) DO UPDATE SET \
                    embedding = excluded.embedding,\
                    doc_hashes = excluded.doc_hashes,\
                    updated_at = excluded.updated_at",
                params![
                    hash_text(&query),
                    query,
                    encode_embedding(&embedding),
                    hashes,
                    now,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        self.blocking(|conn| {
            let documents: i64 =
                conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
            let queries: i64 = conn.query_row("SELECT COUNT(*) FROM queries", [], |row| row.get(0))?;
            Ok(IndexStats {
                documents: documents.max(0) as usize,
                queries: queries.max(0) as usize,
            })
        })
        .await
    }

    /// Dump every document (without embeddings) as JSON lines. Returns the row count.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, IndexError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT doc_hash, url, title, body, created_at, updated_at, hit_count \
                 FROM documents ORDER BY updated_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::fs::File::create(path)?;
            let mut count = 0usize;
            while let Some(row) = rows.next()? {
                let record = DocumentExportRow {
                    doc_hash: row.get(0)?,
                    url: row.get(1)?,
                    title: row.get(2)?,
                    body: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    hit_count: row.get(6)?,
                };
                let line =
                    serde_json::to_string(&record).map_err(|e| IndexError::Serde(e.to_string()))?;
                use std::io::Write;
                writeln!(file, "{line}")?;
                count += 1;
            }
            Ok(count)
        })
        .await
    }
}

#[derive(Debug, Serialize)]
struct DocumentExportRow {
    doc_hash: String,
    url: String,
    title: String,
    body: String,
    created_at: i64,
    updated_at: i64,
    hit_count: i64,
}

fn init_schema(conn: &Connection, seed_placeholder: bool) -> Result<(), IndexError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS documents (\
           doc_hash TEXT PRIMARY KEY,\
           url TEXT NOT NULL,\
           title TEXT NOT NULL,\
           body TEXT NOT NULL,\
           embedding BLOB NOT NULL,\
           created_at INTEGER NOT NULL,\
           updated_at INTEGER NOT NULL,\
           hit_count INTEGER NOT NULL DEFAULT 0\
         );\
         CREATE INDEX IF NOT EXISTS documents_url ON documents(url);\
         CREATE TABLE IF NOT EXISTS queries (\
           query_hash TEXT PRIMARY KEY,\
           query TEXT NOT NULL,\
           embedding BLOB NOT NULL,\
           doc_hashes TEXT NOT NULL,\
           created_at INTEGER NOT NULL,\
           updated_at INTEGER NOT NULL,\
           hit_count INTEGER NOT NULL DEFAULT 0\
         );",
    )?;

    if seed_placeholder {
        let placeholder = IndexedDocument::new("", "", "");
        let now = now_epoch();
        conn.execute(
            "INSERT OR IGNORE INTO documents (doc_hash, url, title, body, embedding, created_at, updated_at)\
             VALUES (?1, '', '', '', ?2, ?3, ?3)",
            params![placeholder.doc_hash, Vec::<u8>::new(), now],
        )?;
    }
    Ok(())
}

fn select_document(
    conn: &Connection,
    column: &'static str,
    value: &str,
) -> Result<Option<IndexedDocument>, IndexError> {
    let sql = format!("SELECT doc_hash, url, title, body FROM documents WHERE {column} = ?1 LIMIT 1");
    let doc = conn
        .query_row(&sql, params![value], |row| {
            Ok(IndexedDocument {
                doc_hash: row.get(0)?,
                url: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
            })
        })
        .optional()?;
    Ok(doc)
}

fn touch_document(conn: &Connection, doc_hash: &str) -> Result<(), IndexError> {
    conn.execute(
        "UPDATE documents SET hit_count = hit_count + 1, updated_at = ?1 WHERE doc_hash = ?2",
        params![now_epoch(), doc_hash],
    )?;
    Ok(())
}

#[derive(Debug)]
pub struct IndexLock {
    _file: std::fs::File,
}

impl IndexLock {
    fn new(db_path: &Path) -> Result<Self, IndexError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
