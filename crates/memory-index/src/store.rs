use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MemoryError;

pub(crate) const META_KEY: &str = "memory_index_meta_v1";
const CACHE_QUERY_BATCH: usize = 400;
const VEC_TABLE: &str = "chunks_vec";
const FTS_TABLE: &str = "chunks_fts";

/// Register sqlite-vec for every connection opened by this process.
pub(crate) fn register_vector_extension() -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| unsafe {
        use rusqlite::ffi::{sqlite3_auto_extension, SQLITE_OK};
        let rc = sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
        if rc == SQLITE_OK {
            Ok(())
        } else {
            Err(format!(
                "Failed to register sqlite-vec auto extension (sqlite rc={})",
                rc
            ))
        }
    });

    match result {
        Ok(()) => Ok(()),
        Err(message) => Err(anyhow!(message.clone())),
    }
}

/// Description of the parameters that produced every current chunk row.
/// Any disagreement with the active configuration forces a full reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFingerprint {
    pub model: String,
    pub provider: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_dims: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileRecord {
    pub source: String,
    pub hash: String,
    pub mtime_ms: i64,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct PreparedChunk {
    pub id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub hash: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// Cache entries are only valid for the exact deployment that wrote them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CacheScope {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
}

#[derive(Debug, Clone)]
pub(crate) struct SearchHit {
    pub id: String,
    pub path: String,
    pub source: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub score: f32,
}

pub(crate) struct Store {
    conn: Connection,
    path: PathBuf,
    pub fts_available: bool,
    pub vector_available: bool,
    pub vector_dims: Option<usize>,
}

impl Store {
    pub(crate) fn open(path: &Path, vector_enabled: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory at {}", parent.display())
            })?;
        }

        let mut vector_available = false;
        if vector_enabled {
            match register_vector_extension() {
                Ok(()) => vector_available = true,
                Err(error) => warn!("vector extension unavailable: {error:#}"),
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory store at {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))
            .context("Failed to enable WAL for memory store")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout for memory store")?;

        let mut store = Self {
            conn,
            path: path.to_path_buf(),
            fts_available: false,
            vector_available,
            vector_dims: None,
        };

        store.ensure_base_schema()?;

        if store.vector_available {
            // The extension registered, but only a live probe proves it is
            // actually usable on this connection.
            let probe: rusqlite::Result<String> =
                store
                    .conn
                    .query_row("SELECT vec_version()", [], |row| row.get(0));
            if let Err(error) = probe {
                warn!("sqlite-vec probe failed, vector search disabled: {error}");
                store.vector_available = false;
            }
        }

        match store.ensure_fts_table() {
            Ok(()) => store.fts_available = true,
            Err(error) => warn!("FTS unavailable, keyword search disabled: {error:#}"),
        }

        if store.vector_available && store.table_exists(VEC_TABLE)? {
            store.vector_dims = store.read_meta()?.and_then(|meta| meta.vector_dims);
        }

        Ok(store)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_base_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS files (
                    path TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    hash TEXT NOT NULL,
                    mtime INTEGER NOT NULL,
                    size INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS chunks (
                    id TEXT PRIMARY KEY,
                    path TEXT NOT NULL,
                    source TEXT NOT NULL,
                    start_line INTEGER NOT NULL,
                    end_line INTEGER NOT NULL,
                    hash TEXT NOT NULL,
                    model TEXT NOT NULL,
                    text TEXT NOT NULL,
                    embedding TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path);
                CREATE TABLE IF NOT EXISTS meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS embedding_cache (
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    provider_key TEXT NOT NULL,
                    hash TEXT NOT NULL,
                    embedding TEXT NOT NULL,
                    dims INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (provider, model, provider_key, hash)
                );",
            )
            .context("Failed to create memory store schema")
    }

    fn ensure_fts_table(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {FTS_TABLE} USING fts5(
                    text,
                    id UNINDEXED,
                    path UNINDEXED,
                    source UNINDEXED,
                    model UNINDEXED,
                    start_line UNINDEXED,
                    end_line UNINDEXED
                )"
            ))
            .context("Failed to create full-text table")
    }

    /// Create (or re-create, when dimensionality changed) the vector table.
    pub(crate) fn ensure_vector_table(&mut self, dims: usize) -> Result<()> {
        if !self.vector_available || dims == 0 {
            return Ok(());
        }
        if self.vector_dims == Some(dims) && self.table_exists(VEC_TABLE)? {
            return Ok(());
        }

        let result = self.conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {VEC_TABLE};
             CREATE VIRTUAL TABLE {VEC_TABLE} USING vec0(
                 id TEXT PRIMARY KEY,
                 embedding FLOAT[{dims}] distance_metric=cosine
             );"
        ));

        match result {
            Ok(()) => {
                self.vector_dims = Some(dims);
                Ok(())
            }
            Err(error) => {
                warn!("vector table creation failed, vector search disabled: {error}");
                self.vector_available = false;
                self.vector_dims = None;
                Ok(())
            }
        }
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let exists: i64 = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .with_context(|| format!("Failed to check {name} table existence"))?;
        Ok(exists != 0)
    }

    pub(crate) fn read_meta(&self) -> Result<Option<IndexFingerprint>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![META_KEY],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to read index meta")?;

        match value {
            Some(raw) => {
                // A fingerprint we cannot parse is treated as absent, which
                // forces a full reindex rather than an error.
                Ok(serde_json::from_str(&raw).ok())
            }
            None => Ok(None),
        }
    }

    pub(crate) fn write_meta(&self, fingerprint: &IndexFingerprint) -> Result<()> {
        let value =
            serde_json::to_string(fingerprint).context("Failed to serialize index meta")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![META_KEY, value],
            )
            .context("Failed to write index meta")?;
        Ok(())
    }

    pub(crate) fn list_files(&self) -> Result<HashMap<String, FileRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, source, hash, mtime, size FROM files")
            .context("Failed to prepare file listing")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    FileRecord {
                        source: row.get(1)?,
                        hash: row.get(2)?,
                        mtime_ms: row.get(3)?,
                        size: row.get(4)?,
                    },
                ))
            })
            .context("Failed to read file rows")?;

        let mut files = HashMap::new();
        for row in rows {
            let (path, record) = row?;
            files.insert(path, record);
        }
        Ok(files)
    }

    pub(crate) fn delete_file(&mut self, path: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("Failed to start delete transaction for {path}"))?;

        if self.vector_available {
            tx.execute(
                &format!(
                    "DELETE FROM {VEC_TABLE} WHERE id IN (SELECT id FROM chunks WHERE path = ?1)"
                ),
                params![path],
            )
            .with_context(|| format!("Failed to delete vectors for {path}"))?;
        }
        if self.fts_available {
            tx.execute(
                &format!("DELETE FROM {FTS_TABLE} WHERE path = ?1"),
                params![path],
            )
            .with_context(|| format!("Failed to delete FTS rows for {path}"))?;
        }
        tx.execute("DELETE FROM chunks WHERE path = ?1", params![path])
            .with_context(|| format!("Failed to delete chunks for {path}"))?;
        tx.execute("DELETE FROM files WHERE path = ?1", params![path])
            .with_context(|| format!("Failed to delete file row for {path}"))?;

        tx.commit()
            .with_context(|| format!("Failed to commit delete for {path}"))
    }

    /// Replace everything stored for one file in a single transaction:
    /// stale chunk/vector/FTS rows go out, fresh rows come in, and the
    /// `files` row is upserted last.
    pub(crate) fn replace_file_chunks(
        &mut self,
        path: &str,
        record: &FileRecord,
        model: &str,
        chunks: &[PreparedChunk],
    ) -> Result<()> {
        let now = now_ms();
        let vector_ready = self.vector_available && self.vector_dims.is_some();
        let fts_ready = self.fts_available;
        let expected_dims = self.vector_dims;

        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("Failed to start index transaction for {path}"))?;

        if vector_ready {
            tx.execute(
                &format!(
                    "DELETE FROM {VEC_TABLE} WHERE id IN (SELECT id FROM chunks WHERE path = ?1)"
                ),
                params![path],
            )
            .with_context(|| format!("Failed to clear vectors for {path}"))?;
        }
        if fts_ready {
            tx.execute(
                &format!("DELETE FROM {FTS_TABLE} WHERE path = ?1"),
                params![path],
            )
            .with_context(|| format!("Failed to clear FTS rows for {path}"))?;
        }
        tx.execute("DELETE FROM chunks WHERE path = ?1", params![path])
            .with_context(|| format!("Failed to clear chunks for {path}"))?;

        for chunk in chunks {
            let embedding_json = serde_json::to_string(
                chunk.embedding.as_deref().unwrap_or(&[]),
            )
            .context("Failed to serialize chunk embedding")?;

            tx.execute(
                "INSERT OR REPLACE INTO chunks
                     (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    chunk.id,
                    path,
                    record.source,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                    chunk.hash,
                    model,
                    chunk.text,
                    embedding_json,
                    now
                ],
            )
            .with_context(|| format!("Failed to insert chunk {} for {path}", chunk.id))?;

            if vector_ready {
                if let Some(embedding) = chunk.embedding.as_deref() {
                    if Some(embedding.len()) == expected_dims {
                        tx.execute(
                            &format!(
                                "INSERT OR REPLACE INTO {VEC_TABLE} (id, embedding) VALUES (?1, ?2)"
                            ),
                            params![chunk.id, embedding_json],
                        )
                        .with_context(|| {
                            format!("Failed to insert vector for chunk {}", chunk.id)
                        })?;
                    }
                }
            }

            if fts_ready {
                tx.execute(
                    &format!(
                        "INSERT INTO {FTS_TABLE}
                             (text, id, path, source, model, start_line, end_line)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                    ),
                    params![
                        chunk.text,
                        chunk.id,
                        path,
                        record.source,
                        model,
                        chunk.start_line as i64,
                        chunk.end_line as i64
                    ],
                )
                .with_context(|| format!("Failed to insert FTS row for chunk {}", chunk.id))?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO files (path, source, hash, mtime, size)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, record.source, record.hash, record.mtime_ms, record.size],
        )
        .with_context(|| format!("Failed to upsert file row for {path}"))?;

        tx.commit()
            .with_context(|| format!("Failed to commit index transaction for {path}"))
    }

    pub(crate) fn count_files(&self, source: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM files WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .context("Failed to count files")?;
        Ok(count as usize)
    }

    pub(crate) fn count_chunks(&self, source: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .context("Failed to count chunks")?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Embedding cache
    // ------------------------------------------------------------------

    pub(crate) fn cache_load(
        &self,
        scope: &CacheScope,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();

        for batch in hashes.chunks(CACHE_QUERY_BATCH) {
            let placeholders = std::iter::repeat("?")
                .take(batch.len())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT hash, embedding FROM embedding_cache
                 WHERE provider = ? AND model = ? AND provider_key = ? AND hash IN ({placeholders})"
            );

            let mut stmt = self
                .conn
                .prepare(&sql)
                .context("Failed to prepare cache lookup")?;

            let mut bindings: Vec<&str> =
                vec![&scope.provider, &scope.model, &scope.provider_key];
            bindings.extend(batch.iter().map(|hash| hash.as_str()));

            let rows = stmt
                .query_map(params_from_iter(bindings), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .context("Failed to run cache lookup")?;

            for row in rows {
                let (hash, embedding_json) = row?;
                if let Ok(vector) = serde_json::from_str::<Vec<f32>>(&embedding_json) {
                    found.insert(hash, vector);
                }
            }
        }

        Ok(found)
    }

    pub(crate) fn cache_upsert(
        &mut self,
        scope: &CacheScope,
        entries: &[(String, Vec<f32>)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let now = now_ms();
        let tx = self
            .conn
            .transaction()
            .context("Failed to start cache upsert transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO embedding_cache
                         (provider, model, provider_key, hash, embedding, dims, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .context("Failed to prepare cache upsert")?;

            for (hash, vector) in entries {
                let embedding_json =
                    serde_json::to_string(vector).context("Failed to serialize cache entry")?;
                stmt.execute(params![
                    scope.provider,
                    scope.model,
                    scope.provider_key,
                    hash,
                    embedding_json,
                    vector.len() as i64,
                    now
                ])
                .context("Failed to upsert cache entry")?;
            }
        }
        tx.commit().context("Failed to commit cache upsert")
    }

    /// Drop oldest entries (by update time) until the cache fits.
    pub(crate) fn cache_prune(&self, max_entries: usize) -> Result<()> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))
            .context("Failed to count cache entries")?;

        let excess = (count as usize).saturating_sub(max_entries);
        if excess == 0 {
            return Ok(());
        }

        self.conn
            .execute(
                "DELETE FROM embedding_cache WHERE rowid IN (
                     SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?1
                 )",
                params![excess as i64],
            )
            .context("Failed to prune cache entries")?;
        Ok(())
    }

    /// Carry the cache across a full reindex so a rebuilt index does not
    /// re-embed unchanged content.
    pub(crate) fn cache_seed_from(&self, live_store: &Path) -> Result<()> {
        if !live_store.exists() {
            return Ok(());
        }

        self.conn
            .execute(
                "ATTACH DATABASE ?1 AS live",
                params![live_store.to_string_lossy()],
            )
            .context("Failed to attach live store for cache seed")?;

        let result = self
            .conn
            .execute_batch(
                "INSERT OR REPLACE INTO embedding_cache SELECT * FROM live.embedding_cache",
            )
            .context("Failed to seed embedding cache from live store");

        self.conn
            .execute_batch("DETACH DATABASE live")
            .context("Failed to detach live store")?;

        result
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub(crate) fn vector_search(
        &self,
        query: &[f32],
        model: &str,
        sources: &[&str],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if !self.vector_available || self.vector_dims != Some(query.len()) || k == 0 {
            return Ok(Vec::new());
        }

        let query_json =
            serde_json::to_string(query).context("Failed to serialize query vector")?;

        // kNN runs over every stored vector; over-fetch so post-filtering by
        // source and model still fills the candidate budget.
        let fetch = (k * 4).min(4096);

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, distance FROM {VEC_TABLE}
                 WHERE embedding MATCH ?1 AND k = ?2
                 ORDER BY distance"
            ))
            .context("Failed to prepare vector query")?;

        let rows = stmt
            .query_map(params![query_json, fetch as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .context("Failed to run vector query")?;

        let mut ordered_ids = Vec::new();
        let mut scores = HashMap::new();
        for row in rows {
            let (id, distance) = row?;
            let score = 1.0 - distance as f32;
            if score.is_finite() {
                ordered_ids.push(id.clone());
                scores.insert(id, score);
            }
        }

        if ordered_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_rows = self.load_chunks_by_id(&ordered_ids, model, sources)?;
        let mut hits = Vec::new();
        for id in ordered_ids {
            if hits.len() >= k {
                break;
            }
            if let Some(row) = chunk_rows.get(&id) {
                hits.push(SearchHit {
                    id: id.clone(),
                    path: row.0.clone(),
                    source: row.1.clone(),
                    start_line: row.2,
                    end_line: row.3,
                    text: row.4.clone(),
                    score: scores[&id],
                });
            }
        }
        Ok(hits)
    }

    #[allow(clippy::type_complexity)]
    fn load_chunks_by_id(
        &self,
        ids: &[String],
        model: &str,
        sources: &[&str],
    ) -> Result<HashMap<String, (String, String, usize, usize, String)>> {
        let source_set: HashSet<&str> = sources.iter().copied().collect();
        let mut out = HashMap::new();

        for batch in ids.chunks(CACHE_QUERY_BATCH) {
            let placeholders = std::iter::repeat("?")
                .take(batch.len())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT id, path, source, start_line, end_line, text FROM chunks
                 WHERE model = ? AND id IN ({placeholders})"
            );

            let mut stmt = self
                .conn
                .prepare(&sql)
                .context("Failed to prepare chunk lookup")?;

            let mut bindings: Vec<&str> = vec![model];
            bindings.extend(batch.iter().map(|id| id.as_str()));

            let rows = stmt
                .query_map(params_from_iter(bindings), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .context("Failed to run chunk lookup")?;

            for row in rows {
                let (id, path, source, start_line, end_line, text) = row?;
                if !source_set.contains(source.as_str()) {
                    continue;
                }
                out.insert(
                    id,
                    (path, source, start_line as usize, end_line as usize, text),
                );
            }
        }

        Ok(out)
    }

    pub(crate) fn keyword_search(
        &self,
        match_expr: &str,
        model: &str,
        sources: &[&str],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        if !self.fts_available || k == 0 || sources.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = std::iter::repeat("?")
            .take(sources.len())
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, path, source, start_line, end_line, text, bm25({FTS_TABLE})
                 FROM {FTS_TABLE}
                 WHERE {FTS_TABLE} MATCH ? AND model = ? AND source IN ({placeholders})
                 ORDER BY bm25({FTS_TABLE})
                 LIMIT ?"
            ))
            .context("Failed to prepare keyword query")?;

        let mut bindings: Vec<rusqlite::types::Value> = vec![
            rusqlite::types::Value::Text(match_expr.to_string()),
            rusqlite::types::Value::Text(model.to_string()),
        ];
        bindings.extend(
            sources
                .iter()
                .map(|source| rusqlite::types::Value::Text(source.to_string())),
        );
        bindings.push(rusqlite::types::Value::Integer(k as i64));

        let rows = stmt
            .query_map(params_from_iter(bindings), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })
            .context("Failed to run keyword query")?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, path, source, start_line, end_line, text, bm25_raw) = row?;
            let bm25 = bm25_raw as f32;
            if !bm25.is_finite() {
                continue;
            }
            hits.push(SearchHit {
                id,
                path,
                source,
                start_line: start_line as usize,
                end_line: end_line as usize,
                text,
                // Lower BM25 values are better; invert so larger means more
                // relevant.
                score: -bm25,
            });
        }
        Ok(hits)
    }

    pub(crate) fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_conn, error)| error)
            .context("Failed to close memory store")
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

// ----------------------------------------------------------------------
// Atomic store swap
// ----------------------------------------------------------------------

const STORE_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        path.to_path_buf()
    } else {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        path.with_file_name(name)
    }
}

fn backup_path(primary: &Path, suffix: &str) -> PathBuf {
    let mut name = primary.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    name.push(suffix);
    primary.with_file_name(name)
}

/// Promote a fully-built temporary store over the primary one.
///
/// Primary files move aside to `.backup` first; only then does the
/// temporary set take their place. A failure mid-promotion restores the
/// backup so the prior state stays usable.
pub(crate) fn promote_temp_store(primary: &Path, temp: &Path) -> Result<()> {
    if !temp.exists() {
        return Err(MemoryError::SwapFailure(format!(
            "temporary store missing at {}",
            temp.display()
        ))
        .into());
    }

    let mut moved_to_backup = Vec::new();
    for suffix in STORE_SUFFIXES {
        let from = suffixed(primary, suffix);
        if from.exists() {
            let to = backup_path(primary, suffix);
            fs::rename(&from, &to).map_err(|error| {
                restore_backups(primary, &moved_to_backup);
                MemoryError::SwapFailure(format!(
                    "failed to move {} aside: {error}",
                    from.display()
                ))
            })?;
            moved_to_backup.push(suffix);
        }
    }

    let mut promoted: Vec<&str> = Vec::new();
    for suffix in STORE_SUFFIXES {
        let from = suffixed(temp, suffix);
        if !from.exists() {
            continue;
        }
        let to = suffixed(primary, suffix);
        if let Err(error) = fs::rename(&from, &to) {
            // Undo whatever got promoted, then bring the backup back.
            for done in &promoted {
                let _ = fs::remove_file(suffixed(primary, done));
            }
            restore_backups(primary, &moved_to_backup);
            remove_store_files(temp);
            return Err(MemoryError::SwapFailure(format!(
                "failed to promote {}: {error}",
                from.display()
            ))
            .into());
        }
        promoted.push(suffix);
    }

    for suffix in moved_to_backup {
        let _ = fs::remove_file(backup_path(primary, suffix));
    }
    Ok(())
}

fn restore_backups(primary: &Path, moved: &[&str]) {
    for suffix in moved {
        let _ = fs::rename(backup_path(primary, suffix), suffixed(primary, suffix));
    }
}

pub(crate) fn remove_store_files(path: &Path) {
    for suffix in STORE_SUFFIXES {
        let _ = fs::remove_file(suffixed(path, suffix));
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{
        promote_temp_store, CacheScope, FileRecord, IndexFingerprint, PreparedChunk, Store,
    };

    fn open_store(dir: &tempfile::TempDir) -> Store {
        Store::open(&dir.path().join("index.sqlite3"), true).expect("store should open")
    }

    fn prepared(id: &str, text: &str, embedding: Option<Vec<f32>>) -> PreparedChunk {
        PreparedChunk {
            id: id.to_string(),
            start_line: 1,
            end_line: 1,
            hash: crate::chunking::hash_content(text),
            text: text.to_string(),
            embedding,
        }
    }

    fn record(hash: &str) -> FileRecord {
        FileRecord {
            source: "memory".to_string(),
            hash: hash.to_string(),
            mtime_ms: 1,
            size: 10,
        }
    }

    #[test]
    fn replace_file_chunks_mirrors_rows_into_fts_and_vec() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        store.ensure_vector_table(4).expect("vector table");
        assert!(store.vector_available);
        assert!(store.fts_available);

        let chunks = vec![
            prepared("a", "the quick brown fox", Some(vec![1.0, 0.0, 0.0, 0.0])),
            prepared("b", "a sleeping dog", Some(vec![0.0, 1.0, 0.0, 0.0])),
        ];
        store
            .replace_file_chunks("MEMORY.md", &record("h1"), "test-model", &chunks)
            .expect("index file");

        let files = store.list_files().expect("list files");
        assert_eq!(files.len(), 1);
        assert_eq!(files["MEMORY.md"].hash, "h1");
        assert_eq!(store.count_chunks("memory").expect("count"), 2);

        let vector_hits = store
            .vector_search(&[1.0, 0.0, 0.0, 0.0], "test-model", &["memory"], 5)
            .expect("vector search");
        assert_eq!(vector_hits[0].id, "a");
        assert!(vector_hits[0].score > vector_hits.last().unwrap().score - 1e-6);

        let keyword_hits = store
            .keyword_search("\"fox\"", "test-model", &["memory"], 5)
            .expect("keyword search");
        assert_eq!(keyword_hits.len(), 1);
        assert_eq!(keyword_hits[0].id, "a");
    }

    #[test]
    fn delete_file_removes_all_mirrors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);
        store.ensure_vector_table(4).expect("vector table");

        let chunks = vec![prepared("a", "hello world", Some(vec![1.0, 0.0, 0.0, 0.0]))];
        store
            .replace_file_chunks("notes.md", &record("h"), "m", &chunks)
            .expect("index");
        store.delete_file("notes.md").expect("delete");

        assert!(store.list_files().expect("list").is_empty());
        assert_eq!(store.count_chunks("memory").expect("count"), 0);
        assert!(store
            .keyword_search("\"hello\"", "m", &["memory"], 5)
            .expect("keyword")
            .is_empty());
        assert!(store
            .vector_search(&[1.0, 0.0, 0.0, 0.0], "m", &["memory"], 5)
            .expect("vector")
            .is_empty());
    }

    #[test]
    fn meta_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_store(&dir);
        assert!(store.read_meta().expect("read").is_none());

        let fingerprint = IndexFingerprint {
            model: "m".into(),
            provider: "openai".into(),
            provider_key: "k".into(),
            chunk_tokens: 1024,
            chunk_overlap: 2,
            vector_dims: Some(4),
        };
        store.write_meta(&fingerprint).expect("write");
        assert_eq!(store.read_meta().expect("read"), Some(fingerprint));
    }

    #[test]
    fn cache_is_scoped_and_prunable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = open_store(&dir);

        let scope = CacheScope {
            provider: "openai".into(),
            model: "m".into(),
            provider_key: "k1".into(),
        };
        let entries: Vec<(String, Vec<f32>)> = (0..5)
            .map(|i| (format!("hash-{i}"), vec![i as f32, 0.0]))
            .collect();
        store.cache_upsert(&scope, &entries).expect("upsert");

        let hashes: Vec<String> = entries.iter().map(|(hash, _)| hash.clone()).collect();
        let found = store.cache_load(&scope, &hashes).expect("load");
        assert_eq!(found.len(), 5);
        assert_eq!(found["hash-3"], vec![3.0, 0.0]);

        // A different deployment of the "same" provider sees nothing.
        let other_scope = CacheScope {
            provider_key: "k2".into(),
            ..scope.clone()
        };
        assert!(store
            .cache_load(&other_scope, &hashes)
            .expect("load other")
            .is_empty());

        store.cache_prune(2).expect("prune");
        let after = store.cache_load(&scope, &hashes).expect("load pruned");
        assert!(after.len() <= 2);
    }

    #[test]
    fn promote_swaps_and_clears_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = dir.path().join("index.sqlite3");
        let temp = dir.path().join("index.sqlite3.tmp-x");
        fs::write(&primary, "old").expect("write primary");
        fs::write(dir.path().join("index.sqlite3-wal"), "old-wal").expect("write wal");
        fs::write(&temp, "new").expect("write temp");

        promote_temp_store(&primary, &temp).expect("promote");

        assert_eq!(fs::read_to_string(&primary).expect("read"), "new");
        assert!(!dir.path().join("index.sqlite3.backup").exists());
        assert!(
            !dir.path().join("index.sqlite3-wal").exists(),
            "stale wal from the old generation must not survive the swap"
        );
        assert!(!temp.exists());
    }

    #[test]
    fn failed_promotion_restores_the_primary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let primary = dir.path().join("index.sqlite3");
        let temp = dir.path().join("index.sqlite3.tmp-x");
        fs::write(&primary, "old").expect("write primary");

        let error = promote_temp_store(&primary, &temp).expect_err("missing temp must fail");
        assert!(error.to_string().contains("store swap failed"));
        assert_eq!(fs::read_to_string(&primary).expect("read"), "old");
    }
}
