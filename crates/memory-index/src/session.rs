use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Prefix keeping session paths from ever colliding with memory paths.
pub(crate) const SESSIONS_PREFIX: &str = "sessions/";

#[derive(Debug, Deserialize)]
struct TranscriptRecord {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

/// Render a line-delimited transcript into indexable text: one
/// `"Role: text"` line per kept message. Malformed lines are skipped
/// silently; only user and assistant messages are kept.
pub(crate) fn transcript_text(raw: &str) -> String {
    let mut out = String::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(record) = serde_json::from_str::<TranscriptRecord>(line) else {
            continue;
        };
        if record.kind.as_deref() != Some("message") {
            continue;
        }
        let Some(message) = record.message else {
            continue;
        };

        let label = match message.role.as_deref() {
            Some("user") => "User",
            Some("assistant") => "Assistant",
            _ => continue,
        };

        let Some(content) = message.content else {
            continue;
        };
        let text = extract_text(&content);
        if text.is_empty() {
            continue;
        }

        out.push_str(label);
        out.push_str(": ");
        out.push_str(&text);
        out.push('\n');
    }

    out
}

fn extract_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(text) => collapse_whitespace(text),
        serde_json::Value::Array(blocks) => {
            let mut segments = Vec::new();
            for block in blocks {
                if block.get("type").and_then(|value| value.as_str()) != Some("text") {
                    continue;
                }
                if let Some(text) = block.get("text").and_then(|value| value.as_str()) {
                    let collapsed = collapse_whitespace(text);
                    if !collapsed.is_empty() {
                        segments.push(collapsed);
                    }
                }
            }
            segments.join(" ")
        }
        _ => String::new(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Default, Clone, Copy)]
struct FileDelta {
    last_size: u64,
    pending_bytes: u64,
    pending_messages: u64,
}

/// Tiny per-file state machine over append-only transcripts. Tracks how
/// much has been appended since the last sync and fires once a byte or
/// message threshold is crossed, without ever re-reading the whole file.
#[derive(Debug)]
pub(crate) struct SessionDeltaTracker {
    delta_bytes: i64,
    delta_messages: i64,
    files: HashMap<PathBuf, FileDelta>,
}

impl SessionDeltaTracker {
    pub(crate) fn new(delta_bytes: i64, delta_messages: i64) -> Self {
        Self {
            delta_bytes,
            delta_messages,
            files: HashMap::new(),
        }
    }

    /// Fold the file's current size into pending counters; returns whether
    /// a threshold fired (the file should be marked dirty).
    pub(crate) fn observe(&mut self, path: &Path) -> Result<bool> {
        let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        let entry = self.files.entry(path.to_path_buf()).or_default();

        let region_start = if size < entry.last_size {
            // Shrank: treat the whole file as fresh content.
            entry.pending_bytes = entry.pending_bytes.saturating_add(size);
            0
        } else {
            let appended = size - entry.last_size;
            entry.pending_bytes = entry.pending_bytes.saturating_add(appended);
            entry.last_size
        };

        if self.delta_messages > 0 && size > region_start {
            entry.pending_messages = entry
                .pending_messages
                .saturating_add(count_newlines(path, region_start, size)?);
        }

        entry.last_size = size;

        let bytes_hit = threshold_hit(entry.pending_bytes, self.delta_bytes);
        let messages_hit = threshold_hit(entry.pending_messages, self.delta_messages);
        if !(bytes_hit || messages_hit) {
            return Ok(false);
        }

        entry.pending_bytes = subtract_threshold(entry.pending_bytes, self.delta_bytes);
        entry.pending_messages = subtract_threshold(entry.pending_messages, self.delta_messages);
        Ok(true)
    }

    pub(crate) fn forget(&mut self, path: &Path) {
        self.files.remove(path);
    }
}

fn threshold_hit(pending: u64, threshold: i64) -> bool {
    if threshold <= 0 {
        pending > 0
    } else {
        pending >= threshold as u64
    }
}

/// Decrement, not reset: leftover delta keeps accumulating toward the next
/// trigger.
fn subtract_threshold(pending: u64, threshold: i64) -> u64 {
    if threshold <= 0 {
        0
    } else {
        pending.saturating_sub(threshold as u64)
    }
}

fn count_newlines(path: &Path, from: u64, to: u64) -> Result<u64> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open transcript {}", path.display()))?;
    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(from))
        .with_context(|| format!("Failed to seek transcript {}", path.display()))?;

    let mut remaining = to - from;
    let mut buffer = [0u8; 8192];
    let mut newlines = 0u64;

    while remaining > 0 {
        let want = buffer.len().min(remaining as usize);
        let read = reader
            .read(&mut buffer[..want])
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        if read == 0 {
            break;
        }
        newlines += buffer[..read].iter().filter(|byte| **byte == b'\n').count() as u64;
        remaining -= read as u64;
    }

    Ok(newlines)
}
