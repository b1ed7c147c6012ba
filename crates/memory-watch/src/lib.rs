//! Debounced filesystem watching for memory documents and transcripts.
//!
//! Wraps `notify` behind a debouncer so rapid editor save sequences and
//! partial writes collapse into a single batch of changed paths.

mod engine;
mod types;

pub use engine::{start_watch, WatchHandle};
pub use types::{WatchError, WatchSettings};
