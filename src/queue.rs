use crate::config::RuleAction;
use crate::store;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PENDING_EXT: &str = "json";
const DONE_EXT: &str = "done";

/// Work item handed to the downstream automation consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub email_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Raw `Date` header as sent.
    pub date: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    pub classification: String,
    pub action: RuleAction,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub model: String,
    pub body: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DoneMarker {
    email_id: String,
    done_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub auto_resolved: usize,
    pub markers_removed: usize,
}

/// Directory-backed idempotent work queue.
///
/// Each identity is either pending (`<stem>.json`), done (`<stem>.done`) or
/// unknown. Once a done-marker exists the identity is never enqueued again.
pub struct ActionQueue {
    dir: PathBuf,
    stale_after: Duration,
    done_retention: Duration,
}

impl ActionQueue {
    pub fn open(dir: impl AsRef<Path>, stale_after: Duration, done_retention: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create queue directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            stale_after,
            done_retention,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pending_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{PENDING_EXT}", file_stem(id)))
    }

    fn done_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{DONE_EXT}", file_stem(id)))
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_path(id).exists()
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done_path(id).exists()
    }

    /// Persist `item` unless its identity is already pending or done.
    pub fn enqueue(&self, item: &QueueItem) -> Result<bool> {
        if self.is_pending(&item.email_id) || self.is_done(&item.email_id) {
            log::debug!("Queue already holds {}, not re-enqueuing", item.email_id);
            return Ok(false);
        }
        store::write_json_atomic(&self.pending_path(&item.email_id), item)
            .with_context(|| format!("Failed to enqueue {}", item.email_id))?;
        Ok(true)
    }

    pub fn mark_done(&self, id: &str) {
        self.mark_done_at(id, Utc::now())
    }

    /// Write the done-marker, then drop the pending item. Failures are
    /// logged only: the marker is what keeps the identity from coming back.
    pub fn mark_done_at(&self, id: &str, now: DateTime<Utc>) {
        let marker = DoneMarker {
            email_id: id.to_string(),
            done_at: now,
        };
        if let Err(e) = store::write_json_atomic(&self.done_path(id), &marker) {
            log::warn!("Failed to write done-marker for {id}: {e:#}");
        }
        match std::fs::remove_file(self.pending_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove pending item {id}: {e}"),
        }
    }

    /// Pending items, oldest first. Unreadable files are skipped.
    pub fn pending_items(&self) -> Result<Vec<QueueItem>> {
        let mut items = Vec::new();
        for path in self.files_with_extension(PENDING_EXT)? {
            match store::read_json::<Option<QueueItem>>(&path) {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable queue item: {e:#}"),
            }
        }
        items.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(items)
    }

    pub fn cleanup(&self) -> Result<CleanupReport> {
        self.cleanup_at(Utc::now())
    }

    /// Two independent housekeeping passes: auto-resolve pending items older
    /// than the staleness window, then delete expired done-markers.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        for path in self.files_with_extension(PENDING_EXT)? {
            let (id, queued_at) = match store::read_json::<Option<QueueItem>>(&path) {
                Ok(Some(item)) => (item.email_id, item.queued_at),
                _ => {
                    log::warn!("Skipping unreadable queue item {}", path.display());
                    continue;
                }
            };
            if now - queued_at > self.stale_after {
                log::info!(
                    "Auto-resolving queue item {id}, pending since {}",
                    queued_at.to_rfc3339()
                );
                self.mark_done_at(&id, now);
                report.auto_resolved += 1;
            }
        }

        for path in self.files_with_extension(DONE_EXT)? {
            let done_at = match store::read_json::<Option<DoneMarker>>(&path) {
                Ok(Some(marker)) => Some(marker.done_at),
                _ => modified_at(&path),
            };
            let Some(done_at) = done_at else {
                continue;
            };
            if now - done_at > self.done_retention {
                match std::fs::remove_file(&path) {
                    Ok(()) => report.markers_removed += 1,
                    Err(e) => log::warn!("Failed to remove done-marker {}: {e}", path.display()),
                }
            }
        }

        Ok(report)
    }

    fn files_with_extension(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list queue directory: {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'));
            if !hidden && path.extension().and_then(|e| e.to_str()) == Some(ext) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// File-name-safe, collision-free encoding of an identity.
fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Truncate `body` to at most `max_chars` characters.
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}
