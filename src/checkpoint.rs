use crate::store;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Epoch-seconds boundary before which every message has been attempted.
///
/// The stored value never decreases.
pub struct CheckpointStore {
    path: PathBuf,
    current: Option<i64>,
}

impl CheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let current = match std::fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse::<i64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    log::warn!(
                        "Ignoring unreadable checkpoint in {}: {:?}",
                        path.display(),
                        content.trim()
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(Self { path, current })
    }

    pub fn get(&self) -> Option<i64> {
        self.current
    }

    /// Move the checkpoint forward to `timestamp`. Returns whether it moved.
    pub fn advance(&mut self, timestamp: i64) -> Result<bool> {
        if self.current.is_some_and(|current| timestamp <= current) {
            return Ok(false);
        }
        store::write_atomic(&self.path, timestamp.to_string().as_bytes())?;
        self.current = Some(timestamp);
        Ok(true)
    }
}
