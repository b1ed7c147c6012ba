use thiserror::Error;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    /// Quiet period after the last event before a batch is delivered.
    pub debounce_ms: u64,
    pub recursive: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            recursive: true,
        }
    }
}

impl WatchSettings {
    pub(crate) fn normalized(&self) -> Self {
        Self {
            debounce_ms: self.debounce_ms.max(1),
            recursive: self.recursive,
        }
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("no watchable roots were supplied")]
    NoRoots,
    #[error("watch root does not exist: {0}")]
    RootNotFound(String),
    #[error("failed to initialize watcher: {0}")]
    WatcherInit(#[from] notify::Error),
    #[error("failed to watch path {path}: {source}")]
    WatchPath {
        path: String,
        source: notify::Error,
    },
}
