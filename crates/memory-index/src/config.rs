use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Which document sources feed the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Memory,
    Sessions,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderSelection {
    Auto,
    Local,
    Openai,
    Gemini,
}

impl Default for ProviderSelection {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkingConfig {
    /// Window budget in approximate tokens.
    pub tokens: usize,
    /// Overlap carried into the head of each subsequent window, in lines.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: 1024,
            overlap: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    pub max_results: usize,
    pub min_score: f32,
    pub hybrid: bool,
    pub vector_weight: f32,
    pub text_weight: f32,
    pub candidate_multiplier: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 8,
            min_score: 0.05,
            hybrid: true,
            vector_weight: 0.7,
            text_weight: 0.3,
            candidate_multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalProviderConfig {
    /// Path to the embedding model file; tokenizer files are resolved from
    /// its parent directory.
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub selection: ProviderSelection,
    /// Tried once when the primary cannot be constructed, or mid-sync when
    /// embedding calls keep failing.
    pub fallback: Option<ProviderSelection>,
    /// Model identifier; each backend supplies its own default when unset.
    pub model: Option<String>,
    pub local: LocalProviderConfig,
    pub openai: RemoteProviderConfig,
    pub gemini: RemoteProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    /// Allow provider-side batch jobs at all.
    pub enabled: bool,
    /// Wait for job completion; when false, work runs per-request instead.
    pub wait: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub timeout_minutes: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait: true,
            concurrency: 2,
            poll_interval_ms: 2_000,
            timeout_minutes: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorConfig {
    pub enabled: bool,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Store file path; defaults to `.memory/index.sqlite3` under the
    /// workspace.
    pub path: Option<PathBuf>,
    pub vector: VectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub on_search: bool,
    pub on_session_start: bool,
    pub watch: bool,
    pub watch_debounce_ms: u64,
    /// Repeating background sync; `0` disables the timer.
    pub interval_minutes: u64,
    /// Appended transcript bytes before a session file is marked dirty.
    /// `<= 0` means any positive delta triggers.
    pub session_delta_bytes: i64,
    /// Appended transcript lines before a session file is marked dirty.
    /// `<= 0` means any positive delta triggers.
    pub session_delta_messages: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            on_search: true,
            on_session_start: true,
            watch: true,
            watch_debounce_ms: 1_500,
            interval_minutes: 0,
            session_delta_bytes: 16_384,
            session_delta_messages: 10,
        }
    }
}

/// Everything one agent's memory index needs; plain data so a host config
/// layer can deserialize it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    /// Directory holding this agent's session transcripts; sessions are
    /// skipped entirely when unset.
    pub sessions_dir: Option<PathBuf>,
    pub sources: Vec<MemorySource>,
    /// Additional memory documents outside the workspace conventions:
    /// individual `.md` files or directories of them.
    pub extra_paths: Vec<PathBuf>,
    pub chunking: ChunkingConfig,
    pub query: QueryConfig,
    pub provider: ProviderConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            agent_id: "default".to_string(),
            workspace_dir: PathBuf::from("."),
            sessions_dir: None,
            sources: vec![MemorySource::Memory, MemorySource::Sessions],
            extra_paths: Vec::new(),
            chunking: ChunkingConfig::default(),
            query: QueryConfig::default(),
            provider: ProviderConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join(".memory").join("index.sqlite3"))
    }

    pub fn source_enabled(&self, source: MemorySource) -> bool {
        self.sources.contains(&source)
            && (source != MemorySource::Sessions || self.sessions_dir.is_some())
    }

    /// Stable digest over the whole config; two managers share state only
    /// when this matches.
    pub fn fingerprint(&self) -> String {
        let serialized = serde_json::to_string(self).unwrap_or_default();
        let hash = blake3::hash(serialized.as_bytes()).to_hex().to_string();
        hash[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryConfig, MemorySource};

    #[test]
    fn fingerprint_changes_with_settings() {
        let base = MemoryConfig::default();
        let mut other = MemoryConfig::default();
        other.chunking.tokens = 256;

        assert_ne!(base.fingerprint(), other.fingerprint());
        assert_eq!(base.fingerprint(), MemoryConfig::default().fingerprint());
    }

    #[test]
    fn sessions_source_requires_a_directory() {
        let mut config = MemoryConfig::default();
        assert!(config.source_enabled(MemorySource::Memory));
        assert!(!config.source_enabled(MemorySource::Sessions));

        config.sessions_dir = Some("/tmp/sessions".into());
        assert!(config.source_enabled(MemorySource::Sessions));
    }
}
