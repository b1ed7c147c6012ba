use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    batch::BatchManager,
    chunking::{chunk_id, chunk_markdown, hash_content},
    config::{MemoryConfig, MemorySource},
    provider::{BatchItem, Provider},
    session::{transcript_text, SESSIONS_PREFIX},
    store::{
        promote_temp_store, remove_store_files, CacheScope, FileRecord, IndexFingerprint,
        PreparedChunk, Store,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    SessionStart,
    Search,
    Watch,
    Interval,
    SessionDelta,
    Fallback,
    Manual,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session-start",
            Self::Search => "search",
            Self::Watch => "watch",
            Self::Interval => "interval",
            Self::SessionDelta => "session-delta",
            Self::Fallback => "fallback",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncProgress {
    pub files_total: usize,
    pub files_done: usize,
}

#[derive(Clone, Default)]
pub struct SyncOptions {
    pub reason: Option<SyncReason>,
    pub force: bool,
    pub progress: Option<Arc<dyn Fn(SyncProgress) + Send + Sync>>,
}

impl SyncOptions {
    pub(crate) fn reason(&self) -> SyncReason {
        self.reason.unwrap_or(SyncReason::Manual)
    }
}

/// What one sync run actually did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub reason: String,
    pub full_reindex: bool,
    pub files_indexed: usize,
    pub files_deleted: usize,
    pub chunks_written: usize,
    pub embeddings_computed: usize,
    pub cache_hits: usize,
    /// Per-file errors that did not abort the run.
    pub skipped_files: Vec<String>,
    pub elapsed_ms: u64,
}

/// Which sources an incremental run should look at.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirtySnapshot {
    pub memory: bool,
    /// Re-scan the whole sessions directory.
    pub sessions_all: bool,
    /// Individual transcript files flagged by the delta tracker.
    pub session_files: HashSet<PathBuf>,
}

impl DirtySnapshot {
    pub(crate) fn is_empty(&self) -> bool {
        !self.memory && !self.sessions_all && self.session_files.is_empty()
    }

    pub(crate) fn merge(&mut self, other: DirtySnapshot) {
        self.memory |= other.memory;
        self.sessions_all |= other.sessions_all;
        self.session_files.extend(other.session_files);
    }

    pub(crate) fn everything() -> Self {
        Self {
            memory: true,
            sessions_all: true,
            session_files: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct SourceFile {
    rel_path: String,
    abs_path: PathBuf,
    mtime_ms: i64,
    size: i64,
}

pub(crate) struct SyncEngine<'a> {
    pub config: &'a MemoryConfig,
    pub store: &'a Mutex<Option<Store>>,
    pub provider: &'a Provider,
    pub batch: &'a BatchManager,
}

impl SyncEngine<'_> {
    fn cache_scope(&self) -> CacheScope {
        CacheScope {
            provider: self.provider.id.as_str().to_string(),
            model: self.provider.model.clone(),
            provider_key: self.provider.provider_key().to_string(),
        }
    }

    fn fingerprint(&self, vector_dims: Option<usize>) -> IndexFingerprint {
        IndexFingerprint {
            model: self.provider.model.clone(),
            provider: self.provider.id.as_str().to_string(),
            provider_key: self.provider.provider_key().to_string(),
            chunk_tokens: self.config.chunking.tokens,
            chunk_overlap: self.config.chunking.overlap,
            vector_dims,
        }
    }

    fn fingerprint_matches(&self, stored: &IndexFingerprint) -> bool {
        let current = self.fingerprint(stored.vector_dims);
        stored.model == current.model
            && stored.provider == current.provider
            && stored.provider_key == current.provider_key
            && stored.chunk_tokens == current.chunk_tokens
            && stored.chunk_overlap == current.chunk_overlap
    }

    /// Entry point for one serialized run. Reads the stored fingerprint to
    /// decide between incremental work and a full shadow-store rebuild.
    pub(crate) async fn run(
        &self,
        options: &SyncOptions,
        dirty: &DirtySnapshot,
    ) -> Result<SyncReport> {
        let started = Instant::now();

        let needs_full = {
            let guard = self.store.lock().await;
            let store = guard.as_ref().context("memory store is closed")?;
            let meta = store.read_meta()?;

            let mismatch = meta
                .as_ref()
                .map_or(true, |stored| !self.fingerprint_matches(stored));
            let vector_gap = store.vector_available
                && meta.as_ref().is_some_and(|stored| stored.vector_dims.is_none())
                && store.count_chunks("memory")? + store.count_chunks("sessions")? > 0;

            options.force || mismatch || vector_gap
        };

        let mut report = if needs_full {
            self.run_full(options).await?
        } else {
            self.run_incremental(options, dirty).await?
        };

        report.reason = options.reason().as_str().to_string();
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            reason = %report.reason,
            full = report.full_reindex,
            indexed = report.files_indexed,
            deleted = report.files_deleted,
            chunks = report.chunks_written,
            embedded = report.embeddings_computed,
            "memory sync finished"
        );
        Ok(report)
    }

    async fn run_incremental(
        &self,
        options: &SyncOptions,
        dirty: &DirtySnapshot,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let stored = {
            let guard = self.store.lock().await;
            guard
                .as_ref()
                .context("memory store is closed")?
                .list_files()?
        };

        let mut work: Vec<(SourceFile, MemorySource)> = Vec::new();

        if self.config.source_enabled(MemorySource::Memory) && dirty.memory {
            let found = collect_memory_files(self.config)?;
            let found_paths: HashSet<&str> =
                found.iter().map(|file| file.rel_path.as_str()).collect();

            for (path, record) in &stored {
                if record.source == "memory" && !found_paths.contains(path.as_str()) {
                    self.delete_path(path).await?;
                    report.files_deleted += 1;
                }
            }

            for file in found {
                work.push((file, MemorySource::Memory));
            }
        }

        if self.config.source_enabled(MemorySource::Sessions)
            && (dirty.sessions_all || !dirty.session_files.is_empty())
        {
            let found = if dirty.sessions_all {
                collect_session_files(self.config)?
            } else {
                dirty
                    .session_files
                    .iter()
                    .filter_map(|path| session_file_entry(path))
                    .collect()
            };

            // Deletions are detected against disk regardless of which
            // files triggered the run.
            for (path, record) in &stored {
                if record.source != "sessions" {
                    continue;
                }
                let missing = self
                    .config
                    .sessions_dir
                    .as_ref()
                    .map(|dir| !dir.join(path.trim_start_matches(SESSIONS_PREFIX)).exists())
                    .unwrap_or(true);
                if missing {
                    self.delete_path(path).await?;
                    report.files_deleted += 1;
                }
            }

            for file in found {
                work.push((file, MemorySource::Sessions));
            }
        }

        let files_total = work.len();
        let mut files_done = 0usize;
        for (file, source) in work {
            match self
                .index_if_changed(&file, source, stored.get(&file.rel_path), &mut report)
                .await
            {
                Ok(()) => {}
                Err(error) if is_file_local_error(&error) => {
                    report
                        .skipped_files
                        .push(format!("{}: {error:#}", file.abs_path.display()));
                }
                Err(error) => return Err(error),
            }

            files_done += 1;
            if let Some(progress) = &options.progress {
                progress(SyncProgress {
                    files_total,
                    files_done,
                });
            }
        }

        self.finish(&mut report).await?;
        Ok(report)
    }

    /// Read, hash, and (when the hash moved) chunk + embed + store a file.
    async fn index_if_changed(
        &self,
        file: &SourceFile,
        source: MemorySource,
        stored: Option<&FileRecord>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let content = read_source_content(&file.abs_path, source)?;
        let hash = hash_content(&content);

        if stored.is_some_and(|record| record.hash == hash) {
            return Ok(());
        }

        let record = FileRecord {
            source: source.as_str().to_string(),
            hash,
            mtime_ms: file.mtime_ms,
            size: file.size,
        };
        self.index_content(&file.rel_path, source, &content, &record, report)
            .await
    }

    async fn index_content(
        &self,
        rel_path: &str,
        source: MemorySource,
        content: &str,
        record: &FileRecord,
        report: &mut SyncReport,
    ) -> Result<()> {
        let chunks = chunk_markdown(
            content,
            self.config.chunking.tokens,
            self.config.chunking.overlap,
        );
        let model = &self.provider.model;
        let scope = self.cache_scope();

        let mut unique_hashes = Vec::new();
        let mut seen_hashes = HashSet::new();
        for chunk in &chunks {
            if seen_hashes.insert(chunk.hash.clone()) {
                unique_hashes.push(chunk.hash.clone());
            }
        }

        let mut by_hash: HashMap<String, Vec<f32>> = if self.config.cache.enabled {
            let guard = self.store.lock().await;
            guard
                .as_ref()
                .context("memory store is closed")?
                .cache_load(&scope, &unique_hashes)?
        } else {
            HashMap::new()
        };
        report.cache_hits += chunks
            .iter()
            .filter(|chunk| by_hash.contains_key(&chunk.hash))
            .count();

        let mut items = Vec::new();
        let mut item_hashes = Vec::new();
        for chunk in &chunks {
            if by_hash.contains_key(&chunk.hash) || item_hashes.contains(&chunk.hash) {
                continue;
            }
            let custom_id = hash_content(&format!(
                "{}:{}:{}:{}:{}:{}",
                source.as_str(),
                rel_path,
                chunk.start_line,
                chunk.end_line,
                chunk.hash,
                items.len(),
            ));
            items.push(BatchItem {
                custom_id,
                text: chunk.text.clone(),
            });
            item_hashes.push(chunk.hash.clone());
        }

        if !items.is_empty() {
            let vectors = self.batch.embed_items(self.provider, items).await?;
            report.embeddings_computed += vectors.len();

            let computed: Vec<(String, Vec<f32>)> = item_hashes
                .iter()
                .cloned()
                .zip(vectors)
                .collect();

            if self.config.cache.enabled {
                let mut guard = self.store.lock().await;
                guard
                    .as_mut()
                    .context("memory store is closed")?
                    .cache_upsert(&scope, &computed)?;
            }
            by_hash.extend(computed);
        }

        let mut prepared = Vec::new();
        let mut seen_ids = HashSet::new();
        for chunk in &chunks {
            let id = chunk_id(
                source.as_str(),
                rel_path,
                chunk.start_line,
                chunk.end_line,
                &chunk.hash,
                model,
            );
            if !seen_ids.insert(id.clone()) {
                continue;
            }
            prepared.push(PreparedChunk {
                id,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                hash: chunk.hash.clone(),
                text: chunk.text.clone(),
                embedding: by_hash.get(&chunk.hash).cloned(),
            });
        }

        let mut guard = self.store.lock().await;
        let store = guard.as_mut().context("memory store is closed")?;
        if let Some(dims) = prepared
            .iter()
            .find_map(|chunk| chunk.embedding.as_ref().map(|vector| vector.len()))
        {
            store.ensure_vector_table(dims)?;
        }
        store.replace_file_chunks(rel_path, record, model, &prepared)?;

        report.files_indexed += 1;
        report.chunks_written += prepared.len();
        debug!(path = rel_path, chunks = prepared.len(), "indexed file");
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let mut guard = self.store.lock().await;
        guard
            .as_mut()
            .context("memory store is closed")?
            .delete_file(path)
    }

    /// Meta and cache bookkeeping shared by both sync shapes.
    async fn finish(&self, _report: &mut SyncReport) -> Result<()> {
        let mut guard = self.store.lock().await;
        let store = guard.as_mut().context("memory store is closed")?;
        let fingerprint = self.fingerprint(store.vector_dims);
        store.write_meta(&fingerprint)?;
        if self.config.cache.enabled {
            store.cache_prune(self.config.cache.max_entries)?;
        }
        Ok(())
    }

    /// Full reindex: rebuild into a shadow store, then atomically swap the
    /// files underneath the primary handle.
    async fn run_full(&self, options: &SyncOptions) -> Result<SyncReport> {
        let primary_path = {
            let guard = self.store.lock().await;
            guard
                .as_ref()
                .context("memory store is closed")?
                .path()
                .to_path_buf()
        };
        let temp_path = temp_store_path(&primary_path);

        info!(
            reason = options.reason().as_str(),
            "starting full reindex into shadow store"
        );

        let build = self
            .build_shadow_store(&primary_path, &temp_path, options)
            .await;
        let mut report = match build {
            Ok(report) => report,
            Err(error) => {
                remove_store_files(&temp_path);
                return Err(error);
            }
        };

        // Swap under the live handle: close, rename the file sets, reopen.
        let mut guard = self.store.lock().await;
        let live = guard.take().context("memory store is closed")?;
        if let Err(error) = live.close() {
            *guard = Some(Store::open(&primary_path, self.config.store.vector.enabled)?);
            remove_store_files(&temp_path);
            return Err(error);
        }

        match promote_temp_store(&primary_path, &temp_path) {
            Ok(()) => {
                *guard = Some(Store::open(&primary_path, self.config.store.vector.enabled)?);
                report.full_reindex = true;
                Ok(report)
            }
            Err(error) => {
                remove_store_files(&temp_path);
                // The backup dance restored the previous files; reopening
                // them leaves the pre-sync index fully usable.
                *guard = Some(Store::open(&primary_path, self.config.store.vector.enabled)?);
                warn!("full reindex rolled back: {error:#}");
                Err(error)
            }
        }
    }

    async fn build_shadow_store(
        &self,
        primary_path: &Path,
        temp_path: &Path,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        let temp = Store::open(temp_path, self.config.store.vector.enabled)?;
        if self.config.cache.enabled {
            temp.cache_seed_from(primary_path)?;
        }

        let temp_slot = Mutex::new(Some(temp));
        let shadow = SyncEngine {
            config: self.config,
            store: &temp_slot,
            provider: self.provider,
            batch: self.batch,
        };

        let result = shadow
            .run_incremental(options, &DirtySnapshot::everything())
            .await;

        let temp = temp_slot
            .lock()
            .await
            .take()
            .context("shadow store vanished during reindex")?;

        match result {
            Ok(report) => {
                temp.close()?;
                Ok(report)
            }
            Err(error) => {
                let _ = temp.close();
                Err(error)
            }
        }
    }
}

/// Errors local to one file (unreadable, vanished mid-run) are recorded in
/// the report; anything else aborts the sync so provider problems can
/// trigger fallback.
fn is_file_local_error(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<std::io::Error>().is_some())
}

fn read_source_content(path: &Path, source: MemorySource) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(match source {
        MemorySource::Memory => raw,
        MemorySource::Sessions => transcript_text(&raw),
    })
}

fn temp_store_path(primary: &Path) -> PathBuf {
    let mut name = primary.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    primary.with_file_name(name)
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn stat_entry(abs_path: &Path, rel_path: String) -> Option<SourceFile> {
    let metadata = fs::symlink_metadata(abs_path).ok()?;
    if metadata.file_type().is_symlink() || !metadata.is_file() {
        return None;
    }
    Some(SourceFile {
        rel_path,
        abs_path: abs_path.to_path_buf(),
        mtime_ms: metadata
            .modified()
            .ok()
            .map(system_time_to_millis)
            .unwrap_or(0),
        size: metadata.len() as i64,
    })
}

fn is_markdown(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("md")
    )
}

fn rel_path_for(workspace: &Path, abs: &Path) -> String {
    abs.strip_prefix(workspace)
        .unwrap_or(abs)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Enumerate memory documents: the workspace conventions plus every extra
/// path, never following symlinks.
fn collect_memory_files(config: &MemoryConfig) -> Result<Vec<SourceFile>> {
    let workspace = &config.workspace_dir;
    let mut files = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |file: SourceFile| {
        if seen.insert(file.rel_path.clone()) {
            files.push(file);
        }
    };

    for name in ["MEMORY.md", "memory.md"] {
        let abs = workspace.join(name);
        if let Some(file) = stat_entry(&abs, rel_path_for(workspace, &abs)) {
            push(file);
        }
    }

    let mut roots: Vec<PathBuf> = vec![workspace.join("memory")];
    roots.extend(config.extra_paths.iter().cloned());

    for root in roots {
        let Ok(metadata) = fs::symlink_metadata(&root) else {
            continue;
        };
        if metadata.file_type().is_symlink() {
            continue;
        }

        if metadata.is_file() {
            if is_markdown(&root) {
                if let Some(file) = stat_entry(&root, rel_path_for(workspace, &root)) {
                    push(file);
                }
            }
            continue;
        }

        let walker = WalkDir::new(&root).follow_links(false).into_iter();
        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if entry.file_type().is_symlink() || !entry.file_type().is_file() {
                continue;
            }
            if !is_markdown(entry.path()) {
                continue;
            }
            if let Some(file) = stat_entry(entry.path(), rel_path_for(workspace, entry.path())) {
                push(file);
            }
        }
    }

    Ok(files)
}

/// Transcripts live flat in the agent's sessions directory, one `.jsonl`
/// per session, stored under the reserved `sessions/` path prefix.
fn collect_session_files(config: &MemoryConfig) -> Result<Vec<SourceFile>> {
    let Some(dir) = &config.sessions_dir else {
        return Ok(Vec::new());
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(Vec::new());
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        if let Some(file) = session_file_entry(&path) {
            files.push(file);
        }
    }
    Ok(files)
}

fn session_file_entry(path: &Path) -> Option<SourceFile> {
    let name = path.file_name()?.to_string_lossy().into_owned();
    stat_entry(path, format!("{SESSIONS_PREFIX}{name}"))
}
