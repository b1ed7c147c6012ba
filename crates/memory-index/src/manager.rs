use std::{
    collections::{HashMap, HashSet},
    fs,
    future::Future,
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, OnceLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use futures_util::future::{FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    batch::BatchManager,
    config::{MemoryConfig, MemorySource},
    error::{is_embedding_failure_message, MemoryError},
    provider::{build_provider, create_provider, selection_to_id, FallbackInfo, Provider},
    search::{run_search, SearchOptions, SearchResult},
    session::SessionDeltaTracker,
    store::{IndexFingerprint, Store},
    sync::{DirtySnapshot, SyncEngine, SyncOptions, SyncReason, SyncReport},
};

const SESSION_EVENT_DEBOUNCE: Duration = Duration::from_secs(5);

type SharedSync =
    Shared<Pin<Box<dyn Future<Output = Result<SyncReport, Arc<anyhow::Error>>> + Send>>>;

struct ProviderState {
    provider: Arc<Provider>,
    fallback: Option<FallbackInfo>,
    /// The mid-sync provider switch happens at most once per manager.
    fallback_applied: bool,
}

struct Inner {
    config: MemoryConfig,
    registry_key: String,
    store: Mutex<Option<Store>>,
    provider: RwLock<ProviderState>,
    batch: BatchManager,
    dirty: StdMutex<DirtySnapshot>,
    in_flight: StdMutex<Option<SharedSync>>,
    warmed_sessions: StdMutex<HashSet<String>>,
    delta: StdMutex<SessionDeltaTracker>,
    pending_session_events: StdMutex<HashSet<PathBuf>>,
    session_debounce_armed: AtomicBool,
    watchers: StdMutex<Vec<memory_watch::WatchHandle>>,
    interval_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Status snapshot for hosts and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    pub fallback: Option<FallbackInfo>,
    pub memory_files: usize,
    pub session_files: usize,
    pub memory_chunks: usize,
    pub session_chunks: usize,
    pub vector_available: bool,
    pub fts_available: bool,
    pub dirty: bool,
    pub store_path: String,
    pub fingerprint: Option<IndexFingerprint>,
}

#[derive(Debug, Clone, Default)]
pub struct ReadFileOptions {
    pub rel_path: String,
    /// 1-based first line of an optional slice.
    pub from: Option<usize>,
    pub lines: Option<usize>,
}

/// Per-agent facade over the whole memory subsystem. One instance per
/// `(agent, workspace, settings)` via a process-wide registry; everything
/// mutable is owned here and background work only ever schedules syncs.
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager").finish_non_exhaustive()
    }
}

fn registry() -> &'static StdMutex<HashMap<String, Arc<MemoryManager>>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<String, Arc<MemoryManager>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

impl MemoryManager {
    /// Fetch or build the singleton for this agent + workspace + settings
    /// combination.
    pub async fn get_or_create(config: MemoryConfig) -> Result<Arc<Self>> {
        let key = format!(
            "{}|{}|{}",
            config.agent_id,
            config.workspace_dir.display(),
            config.fingerprint()
        );

        if let Some(existing) = registry().lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }

        let manager = Arc::new(Self::build(config, key.clone())?);
        let mut entries = registry().lock().unwrap();
        Ok(entries.entry(key).or_insert(manager).clone())
    }

    fn build(config: MemoryConfig, registry_key: String) -> Result<Self> {
        let selected = create_provider(&config.provider)?;
        if let Some(fallback) = &selected.fallback {
            warn!(
                from = %fallback.from,
                reason = %fallback.reason,
                "primary embedding provider unavailable, constructed fallback"
            );
        }

        let store = Store::open(&config.store_path(), config.store.vector.enabled)?;
        let batch = BatchManager::new(config.batch.clone());
        let delta = SessionDeltaTracker::new(
            config.sync.session_delta_bytes,
            config.sync.session_delta_messages,
        );

        let inner = Arc::new(Inner {
            batch,
            registry_key,
            store: Mutex::new(Some(store)),
            provider: RwLock::new(ProviderState {
                provider: Arc::new(selected.provider),
                fallback: selected.fallback,
                fallback_applied: false,
            }),
            dirty: StdMutex::new(DirtySnapshot::everything()),
            in_flight: StdMutex::new(None),
            warmed_sessions: StdMutex::new(HashSet::new()),
            delta: StdMutex::new(delta),
            pending_session_events: StdMutex::new(HashSet::new()),
            session_debounce_armed: AtomicBool::new(false),
            watchers: StdMutex::new(Vec::new()),
            interval_task: StdMutex::new(None),
            config,
        });

        if inner.config.sync.watch {
            start_watchers(&inner);
        }
        start_interval(&inner);

        info!(
            agent = %inner.config.agent_id,
            workspace = %inner.config.workspace_dir.display(),
            "memory manager ready"
        );
        Ok(Self { inner })
    }

    /// Ranked hybrid search. Optionally warms the session index first and
    /// kicks a background sync when anything is marked dirty.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if options.session_key.is_some() {
            self.warm_session(options.session_key.clone());
        }

        if self.inner.config.sync.on_search && !self.inner.dirty.lock().unwrap().is_empty() {
            spawn_sync(&self.inner, SyncReason::Search);
        }

        let max_results = options
            .max_results
            .unwrap_or(self.inner.config.query.max_results);
        let min_score = options.min_score.unwrap_or(self.inner.config.query.min_score);

        let provider = self.inner.provider.read().await.provider.clone();
        run_search(
            &self.inner.store,
            &provider,
            &self.inner.batch,
            &self.inner.config,
            query,
            max_results,
            min_score,
        )
        .await
    }

    /// Serialized sync: a caller arriving while a run is in flight awaits
    /// that run and shares its outcome.
    pub async fn sync(&self, options: SyncOptions) -> Result<SyncReport> {
        self.inner
            .shared_sync(options)
            .await
            .map_err(|error| anyhow!("{error:#}"))
    }

    /// Fire one background warm-up sync per unique session key.
    pub fn warm_session(&self, session_key: Option<String>) {
        if !self.inner.config.sync.on_session_start {
            return;
        }
        let key = session_key.unwrap_or_else(|| "default".to_string());
        if !self.inner.warmed_sessions.lock().unwrap().insert(key) {
            return;
        }
        spawn_sync(&self.inner, SyncReason::SessionStart);
    }

    /// Record a transcript update event for the session delta tracker, as
    /// an alternative to filesystem watching.
    pub fn note_session_update(&self, path: &Path) {
        queue_session_event(&self.inner, path.to_path_buf());
    }

    /// Read an indexable `.md` document, confined to the workspace and the
    /// configured extra paths. Optionally slices 1-based lines.
    pub fn read_file(&self, options: &ReadFileOptions) -> Result<String> {
        let resolved = self.resolve_readable_path(&options.rel_path)?;
        let content = fs::read_to_string(&resolved)
            .with_context(|| format!("Failed to read {}", resolved.display()))?;

        let from = options.from.unwrap_or(1).max(1);
        if options.from.is_none() && options.lines.is_none() {
            return Ok(content);
        }

        let selected: Vec<&str> = content
            .lines()
            .skip(from - 1)
            .take(options.lines.unwrap_or(usize::MAX))
            .collect();
        Ok(selected.join("\n"))
    }

    fn resolve_readable_path(&self, rel_path: &str) -> Result<PathBuf> {
        let denied = |reason: &str| -> anyhow::Error {
            MemoryError::PathDenied(format!("{rel_path}: {reason}")).into()
        };

        if !rel_path.to_lowercase().ends_with(".md") {
            return Err(denied("only .md files are readable"));
        }

        let requested = Path::new(rel_path);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.inner.config.workspace_dir.join(requested)
        };
        let normalized =
            lexical_normalize(&candidate).ok_or_else(|| denied("path escapes its root"))?;

        let workspace = lexical_normalize(&self.inner.config.workspace_dir)
            .unwrap_or_else(|| self.inner.config.workspace_dir.clone());

        let mut allowed_root = None;
        if normalized.starts_with(&workspace) {
            allowed_root = Some(workspace.clone());
        } else {
            for extra in &self.inner.config.extra_paths {
                let Some(extra) = lexical_normalize(extra) else {
                    continue;
                };
                if normalized == extra || normalized.starts_with(&extra) {
                    allowed_root = Some(extra);
                    break;
                }
            }
        }
        let allowed_root = allowed_root.ok_or_else(|| denied("outside the allowed roots"))?;

        match fs::symlink_metadata(&normalized) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(denied("symlinks are not readable"));
            }
            _ => {}
        }

        // A symlinked ancestor could still smuggle the real file outside
        // the root; canonical paths catch that.
        if let (Ok(canonical_parent), Ok(canonical_root)) = (
            normalized
                .parent()
                .unwrap_or(Path::new("/"))
                .canonicalize(),
            allowed_root.canonicalize(),
        ) {
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(denied("resolves outside the allowed roots"));
            }
        }

        Ok(normalized)
    }

    pub async fn status(&self) -> Result<MemoryStatus> {
        let provider_state = self.inner.provider.read().await;
        let guard = self.inner.store.lock().await;
        let store = guard.as_ref().context("memory store is closed")?;

        Ok(MemoryStatus {
            agent_id: self.inner.config.agent_id.clone(),
            provider: provider_state.provider.id.as_str().to_string(),
            model: provider_state.provider.model.clone(),
            fallback: provider_state.fallback.clone(),
            memory_files: store.count_files("memory")?,
            session_files: store.count_files("sessions")?,
            memory_chunks: store.count_chunks("memory")?,
            session_chunks: store.count_chunks("sessions")?,
            vector_available: store.vector_available,
            fts_available: store.fts_available,
            dirty: !self.inner.dirty.lock().unwrap().is_empty(),
            store_path: store.path().display().to_string(),
            fingerprint: store.read_meta()?,
        })
    }

    pub async fn probe_vector_availability(&self) -> bool {
        let guard = self.inner.store.lock().await;
        guard
            .as_ref()
            .map(|store| store.vector_available)
            .unwrap_or(false)
    }

    /// Exercise the per-request embedding path once; batch mode is never
    /// probed.
    pub async fn probe_embedding_availability(&self) -> bool {
        let provider = self.inner.provider.read().await.provider.clone();
        match self
            .inner
            .batch
            .embed_query(&provider, "availability probe")
            .await
        {
            Ok(vector) => !vector.is_empty(),
            Err(error) => {
                debug!("embedding availability probe failed: {error:#}");
                false
            }
        }
    }

    /// Tear the manager down: stop background work, close the store, and
    /// drop the registry entry.
    pub async fn close(&self) -> Result<()> {
        registry().lock().unwrap().remove(&self.inner.registry_key);

        for handle in self.inner.watchers.lock().unwrap().drain(..) {
            handle.stop();
        }
        if let Some(task) = self.inner.interval_task.lock().unwrap().take() {
            task.abort();
        }

        let store = self.inner.store.lock().await.take();
        if let Some(store) = store {
            store.close()?;
        }
        info!(agent = %self.inner.config.agent_id, "memory manager closed");
        Ok(())
    }
}

impl Inner {
    /// Create or join the single in-flight sync future.
    fn shared_sync(self: &Arc<Self>, options: SyncOptions) -> SharedSync {
        let mut guard = self.in_flight.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }

        let inner = self.clone();
        let future = async move {
            let result = Inner::sync_with_fallback(&inner, options)
                .await
                .map_err(Arc::new);
            inner.in_flight.lock().unwrap().take();
            result
        }
        .boxed()
        .shared();

        *guard = Some(future.clone());
        future
    }

    async fn sync_once(
        inner: &Arc<Inner>,
        options: &SyncOptions,
        dirty: &DirtySnapshot,
    ) -> Result<SyncReport> {
        let provider = inner.provider.read().await.provider.clone();
        let engine = SyncEngine {
            config: &inner.config,
            store: &inner.store,
            provider: &provider,
            batch: &inner.batch,
        };
        engine.run(options, dirty).await
    }

    async fn sync_with_fallback(inner: &Arc<Inner>, options: SyncOptions) -> Result<SyncReport> {
        let mut dirty = std::mem::take(&mut *inner.dirty.lock().unwrap());
        // Event-driven reasons stay delta-scoped; explicit and scheduled
        // syncs look at everything.
        match options.reason() {
            SyncReason::Manual | SyncReason::Interval | SyncReason::SessionStart => {
                dirty.merge(DirtySnapshot::everything());
            }
            _ => {}
        }

        let error = match Self::sync_once(inner, &options, &dirty).await {
            Ok(report) => return Ok(report),
            Err(error) => error,
        };

        let message = format!("{error:#}");
        let fallback_kind = {
            let state = inner.provider.read().await;
            let configured = inner.config.provider.fallback.and_then(selection_to_id);
            match configured {
                Some(kind)
                    if kind != state.provider.id
                        && !state.fallback_applied
                        && is_embedding_failure_message(&message) =>
                {
                    Some((kind, state.provider.id))
                }
                _ => None,
            }
        };

        let Some((kind, previous)) = fallback_kind else {
            inner.dirty.lock().unwrap().merge(dirty);
            return Err(error);
        };

        let replacement = match build_provider(kind, &inner.config.provider) {
            Ok(provider) => provider,
            Err(build_error) => {
                inner.dirty.lock().unwrap().merge(dirty);
                return Err(error.context(format!(
                    "fallback provider {kind} also failed: {build_error:#}"
                )));
            }
        };

        warn!(
            from = previous.as_str(),
            to = kind.as_str(),
            "embedding failures during sync, switching provider"
        );
        {
            let mut state = inner.provider.write().await;
            state.provider = Arc::new(replacement);
            state.fallback = Some(FallbackInfo {
                from: previous.as_str().to_string(),
                reason: message,
            });
            state.fallback_applied = true;
        }

        let retry_options = SyncOptions {
            reason: Some(SyncReason::Fallback),
            force: true,
            progress: options.progress.clone(),
        };
        match Self::sync_once(inner, &retry_options, &DirtySnapshot::everything()).await {
            Ok(report) => Ok(report),
            Err(retry_error) => {
                inner.dirty.lock().unwrap().merge(dirty);
                Err(retry_error)
            }
        }
    }
}

/// Background syncs log and swallow failures; they never poison a caller.
fn spawn_sync(inner: &Arc<Inner>, reason: SyncReason) {
    let shared = inner.shared_sync(SyncOptions {
        reason: Some(reason),
        ..SyncOptions::default()
    });
    tokio::spawn(async move {
        if let Err(error) = shared.await {
            warn!(
                reason = reason.as_str(),
                "background memory sync failed: {error:#}"
            );
        }
    });
}

fn start_watchers(inner: &Arc<Inner>) {
    let handle = tokio::runtime::Handle::current();

    // Memory documents: existing conventional roots plus extra paths.
    let mut memory_roots = Vec::new();
    for candidate in [
        inner.config.workspace_dir.join("MEMORY.md"),
        inner.config.workspace_dir.join("memory.md"),
        inner.config.workspace_dir.join("memory"),
    ] {
        if candidate.exists() {
            memory_roots.push(candidate);
        }
    }
    for extra in &inner.config.extra_paths {
        let is_symlink = fs::symlink_metadata(extra)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(true);
        if !is_symlink && extra.exists() {
            memory_roots.push(extra.clone());
        }
    }

    if inner.config.source_enabled(MemorySource::Memory) && !memory_roots.is_empty() {
        let weak = Arc::downgrade(inner);
        let rt = handle.clone();
        let result = memory_watch::start_watch(
            &memory_roots,
            memory_watch::WatchSettings {
                debounce_ms: inner.config.sync.watch_debounce_ms,
                ..Default::default()
            },
            move |_batch| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.dirty.lock().unwrap().merge(DirtySnapshot {
                    memory: true,
                    ..DirtySnapshot::default()
                });
                rt.spawn(async move {
                    spawn_sync(&inner, SyncReason::Watch);
                });
            },
        );
        match result {
            Ok(watch_handle) => inner.watchers.lock().unwrap().push(watch_handle),
            Err(error) => warn!("memory watch unavailable: {error}"),
        }
    }

    // Session transcripts feed the delta tracker instead of marking dirty
    // directly.
    if inner.config.source_enabled(MemorySource::Sessions) {
        if let Some(sessions_dir) = inner.config.sessions_dir.clone() {
            if sessions_dir.is_dir() {
                let weak = Arc::downgrade(inner);
                let rt = handle;
                let result = memory_watch::start_watch(
                    &[sessions_dir],
                    memory_watch::WatchSettings::default(),
                    move |batch| {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        for path in batch {
                            if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
                                let inner = inner.clone();
                                let path = path.clone();
                                rt.spawn(async move {
                                    queue_session_event(&inner, path);
                                });
                            }
                        }
                    },
                );
                match result {
                    Ok(watch_handle) => inner.watchers.lock().unwrap().push(watch_handle),
                    Err(error) => warn!("session watch unavailable: {error}"),
                }
            }
        }
    }
}

fn start_interval(inner: &Arc<Inner>) {
    let minutes = inner.config.sync.interval_minutes;
    if minutes == 0 {
        return;
    }

    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            spawn_sync(&inner, SyncReason::Interval);
        }
    });
    *inner.interval_task.lock().unwrap() = Some(task);
}

/// Enqueue a transcript event and arm the shared five-second debounce.
fn queue_session_event(inner: &Arc<Inner>, path: PathBuf) {
    inner.pending_session_events.lock().unwrap().insert(path);

    if inner.session_debounce_armed.swap(true, Ordering::SeqCst) {
        return;
    }

    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(SESSION_EVENT_DEBOUNCE).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.session_debounce_armed.store(false, Ordering::SeqCst);

        let pending: Vec<PathBuf> = inner
            .pending_session_events
            .lock()
            .unwrap()
            .drain()
            .collect();

        let mut dirty_files = HashSet::new();
        {
            let mut delta = inner.delta.lock().unwrap();
            for path in pending {
                match delta.observe(&path) {
                    Ok(true) => {
                        dirty_files.insert(path);
                    }
                    Ok(false) => {}
                    Err(error) => {
                        delta.forget(&path);
                        warn!("session delta tracking failed for {}: {error:#}", path.display());
                    }
                }
            }
        }

        if dirty_files.is_empty() {
            return;
        }

        inner.dirty.lock().unwrap().merge(DirtySnapshot {
            session_files: dirty_files,
            ..DirtySnapshot::default()
        });
        spawn_sync(&inner, SyncReason::SessionDelta);
    });
}

/// Resolve `.` and `..` without touching the filesystem; `None` when the
/// path climbs out of its own root.
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::lexical_normalize;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/./c/../d")),
            Some(PathBuf::from("/a/b/d"))
        );
    }

    #[test]
    fn normalize_rejects_climbing_out() {
        assert_eq!(lexical_normalize(Path::new("../escape")), None);
    }
}
