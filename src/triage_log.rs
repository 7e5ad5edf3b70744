use crate::config::RuleAction;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One classification decision, one JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageLogEntry {
    pub timestamp: DateTime<Utc>,
    pub email_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Raw `Date` header.
    pub received_at: String,
    pub classification: String,
    pub action: RuleAction,
    #[serde(default)]
    pub assigned_to: Option<String>,
    pub model: String,
    pub escalated: bool,
    #[serde(default)]
    pub shadow: bool,
    pub processed_at: DateTime<Utc>,
}

/// Append-only decision log with a single rotated generation.
pub struct TriageLog {
    path: PathBuf,
    max_bytes: u64,
}

impl TriageLog {
    pub fn new(path: impl AsRef<Path>, max_bytes: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    pub fn append(&self, entry: &TriageLogEntry) -> Result<()> {
        self.rotate_if_full()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open triage log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to triage log: {}", self.path.display()))?;
        Ok(())
    }

    fn rotate_if_full(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Ok(());
        }
        let size = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size >= self.max_bytes {
            let rotated = self.rotated_path();
            std::fs::rename(&self.path, &rotated)
                .with_context(|| format!("Failed to rotate triage log to {}", rotated.display()))?;
            log::info!("Rotated triage log ({size} bytes) to {}", rotated.display());
        }
        Ok(())
    }

    /// Every readable entry, rotated generation first.
    pub fn read_entries(&self) -> Result<Vec<TriageLogEntry>> {
        let mut entries = Vec::new();
        for path in [self.rotated_path(), self.path.clone()] {
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to open {}", path.display()))
                }
            };
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TriageLogEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => log::warn!("{}:{}: skipping bad log line: {e}", path.display(), n + 1),
                }
            }
        }
        Ok(entries)
    }
}

/// Totals derived from the triage log, used by `--stats`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub total: usize,
    pub shadow: usize,
    pub by_action: BTreeMap<String, usize>,
    pub by_classification: BTreeMap<String, usize>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl LogSummary {
    pub fn from_entries(entries: &[TriageLogEntry]) -> Self {
        let mut summary = LogSummary::default();
        for entry in entries {
            summary.total += 1;
            if entry.shadow {
                summary.shadow += 1;
            }
            *summary
                .by_action
                .entry(entry.action.to_string())
                .or_default() += 1;
            *summary
                .by_classification
                .entry(entry.classification.clone())
                .or_default() += 1;
            summary.first = Some(summary.first.map_or(entry.timestamp, |t| t.min(entry.timestamp)));
            summary.last = Some(summary.last.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }
        summary
    }
}
