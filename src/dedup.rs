use crate::store;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Outcome action recorded for senders rejected by the whitelist.
pub const NOT_WHITELISTED: &str = "skipped-not-whitelisted";

/// What happened to a message, as remembered by the dedup store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub from: String,
    pub subject: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRecord {
    #[serde(flatten)]
    pub outcome: Outcome,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DedupFile {
    #[serde(default)]
    emails: HashMap<String, DedupRecord>,
    #[serde(default)]
    last_cleanup: Option<DateTime<Utc>>,
}

/// Message-identity cache with TTL eviction.
///
/// An identity present here is never queued or logged again. Eviction is
/// opportunistic: it only runs inside a write, at most once per cleanup
/// interval.
pub struct DedupStore {
    path: PathBuf,
    ttl: Duration,
    cleanup_interval: Duration,
    state: DedupFile,
}

impl DedupStore {
    pub fn open(path: impl AsRef<Path>, ttl: Duration, cleanup_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match store::read_json::<DedupFile>(&path) {
            Ok(state) => state,
            Err(e) => {
                let mut aside = path.as_os_str().to_owned();
                aside.push(".corrupt");
                let aside = PathBuf::from(aside);
                log::warn!(
                    "Dedup store unreadable ({e:#}), moving it to {} and starting empty",
                    aside.display()
                );
                std::fs::rename(&path, &aside)?;
                DedupFile::default()
            }
        };
        log::debug!("Dedup store {} holds {} records", path.display(), state.emails.len());
        Ok(Self {
            path,
            ttl,
            cleanup_interval,
            state,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.emails.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&DedupRecord> {
        self.state.emails.get(id)
    }

    pub fn len(&self) -> usize {
        self.state.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.emails.is_empty()
    }

    pub fn record(&mut self, id: &str, outcome: Outcome) -> Result<()> {
        self.record_at(id, outcome, Utc::now())
    }

    /// Insert or replace the record for `id` and persist the store.
    ///
    /// On a failed write the in-memory record is rolled back so the message
    /// stays eligible for reprocessing.
    pub fn record_at(&mut self, id: &str, outcome: Outcome, now: DateTime<Utc>) -> Result<()> {
        let previous = self.state.emails.insert(
            id.to_string(),
            DedupRecord {
                outcome,
                processed_at: now,
            },
        );
        let evicted = self.evict_if_due(now);
        if evicted > 0 {
            log::info!("Dedup store evicted {evicted} records older than {}h", self.ttl.num_hours());
        }

        if let Err(e) = store::write_json_atomic(&self.path, &self.state) {
            match previous {
                Some(record) => self.state.emails.insert(id.to_string(), record),
                None => self.state.emails.remove(id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn evict_if_due(&mut self, now: DateTime<Utc>) -> usize {
        let due = match self.state.last_cleanup {
            Some(last) => now - last > self.cleanup_interval,
            None => true,
        };
        if !due {
            return 0;
        }

        let before = self.state.emails.len();
        let ttl = self.ttl;
        self.state
            .emails
            .retain(|_, record| now - record.processed_at <= ttl);
        self.state.last_cleanup = Some(now);
        before - self.state.emails.len()
    }
}
