use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tracing::warn;

use crate::types::{WatchError, WatchSettings};

pub struct WatchHandle {
    debouncer: Option<Debouncer<RecommendedWatcher, RecommendedCache>>,
    stopped: bool,
}

impl WatchHandle {
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if self.stopped {
            return;
        }

        // Dropping the debouncer detaches the notify backend and joins its
        // internal flush thread, so no batch can be delivered afterwards.
        self.debouncer.take();
        self.stopped = true;
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

/// Watch a set of roots (files or directories) and deliver deduplicated
/// batches of changed paths once events settle for the debounce window.
///
/// Roots that do not exist are rejected up front; callers filter their
/// candidate list first.
pub fn start_watch(
    roots: &[PathBuf],
    settings: WatchSettings,
    mut on_batch: impl FnMut(Vec<PathBuf>) + Send + 'static,
) -> Result<WatchHandle, WatchError> {
    if roots.is_empty() {
        return Err(WatchError::NoRoots);
    }

    for root in roots {
        if !root.exists() {
            return Err(WatchError::RootNotFound(root.display().to_string()));
        }
    }

    let settings = settings.normalized();

    let mut debouncer = new_debouncer(
        Duration::from_millis(settings.debounce_ms),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let mut changed = BTreeSet::new();
                for event in &events {
                    if !is_change(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        changed.insert(path.clone());
                    }
                }

                if !changed.is_empty() {
                    on_batch(changed.into_iter().collect());
                }
            }
            Err(errors) => {
                for error in errors {
                    warn!("file watcher error: {error:?}");
                }
            }
        },
    )?;

    let mode = if settings.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };

    for root in roots {
        let root_mode = if root.is_dir() {
            mode
        } else {
            RecursiveMode::NonRecursive
        };
        if let Err(source) = debouncer.watch(root.as_path(), root_mode) {
            return Err(WatchError::WatchPath {
                path: root.display().to_string(),
                source,
            });
        }
    }

    Ok(WatchHandle {
        debouncer: Some(debouncer),
        stopped: false,
    })
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
