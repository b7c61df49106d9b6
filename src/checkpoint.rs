//! Checkpoints, acknowledgment tracking and checkpoint persistence.
//!
//! A [`Checkpoint`] names a resumable position in the write-ahead log. The
//! fetch loop attaches one to every [`Change`] it emits; the consumer hands
//! processed checkpoints back through [`CheckpointTracker::commit`] so the
//! loop can report them to the server.
//!
//! Persisting acknowledged checkpoints across restarts is the host's job.
//! [`CheckpointManager`] is a small helper for doing that with a JSON file.
//!
//! # Example
//!
//! ```rust,no_run
//! use pglogical_capture::checkpoint::{Checkpoint, CheckpointManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("checkpoint.json");
//!
//!     // Load existing checkpoint
//!     let resume = manager.load().await?.unwrap_or_default();
//!     println!("Resuming from LSN: {}", resume.lsn);
//!
//!     // Save new checkpoint
//!     manager.save(&Checkpoint::new(0x1234_5678, Default::default())).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::lsn::Lsn;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// A resumable position in the replication stream.
///
/// `lsn` is the WAL offset just past the record that produced the
/// checkpoint, so resuming from it starts strictly after that record.
/// A zero `lsn` means "start from the server's current position".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// WAL byte offset
    pub lsn: u64,
    /// Commit time of the transaction that produced this position
    pub time: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint at `lsn` with the given commit time.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pglogical_capture::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new(0x16_B374_D848, Default::default());
    /// assert_eq!(checkpoint.lsn, 0x16_B374_D848);
    /// ```
    pub fn new(lsn: u64, time: DateTime<Utc>) -> Self {
        Self { lsn, time }
    }

    pub fn lsn(&self) -> Lsn {
        Lsn(self.lsn)
    }
}

/// One unit of decoded replication data handed downstream.
#[derive(Debug, Clone)]
pub struct Change<M> {
    pub checkpoint: Checkpoint,
    pub message: M,
}

/// The highest LSN the consumer has confirmed as fully processed.
///
/// Written by the consumer through [`commit`](Self::commit), read by the
/// fetch loop when it sends a status report. The tracker does not enforce
/// monotonicity: callers must commit checkpoints in the order they were
/// received, and only once they are fully processed.
#[derive(Debug, Default)]
pub struct CheckpointTracker {
    ack_lsn: AtomicU64,
}

impl CheckpointTracker {
    pub fn new(initial: u64) -> Self {
        Self {
            ack_lsn: AtomicU64::new(initial),
        }
    }

    pub fn commit(&self, checkpoint: &Checkpoint) {
        self.ack_lsn.store(checkpoint.lsn, Ordering::Release);
    }

    pub fn committed_lsn(&self) -> Lsn {
        Lsn(self.ack_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn reset(&self, lsn: u64) {
        self.ack_lsn.store(lsn, Ordering::Release);
    }
}

/// Manages checkpoint persistence to disk.
///
/// The `CheckpointManager` handles atomic writes to ensure that checkpoints
/// are never corrupted, even if the process crashes during a write operation.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager with the specified file path.
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads checkpoint from disk if it exists.
    ///
    /// Returns `None` if the checkpoint file doesn't exist, which typically
    /// means this is the first run or the checkpoint was deleted.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - The file exists but cannot be read
    /// - The file contains invalid JSON
    /// - The JSON doesn't match the `Checkpoint` structure
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint: LSN={}, time={}",
                    checkpoint.lsn(),
                    checkpoint.time
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Config(format!("Invalid checkpoint file: {}", e)))
            }
        }
    }

    /// Saves checkpoint to disk atomically.
    ///
    /// This method ensures that the checkpoint is written atomically by:
    /// 1. Writing to a temporary file
    /// 2. Syncing the file to ensure data is on disk
    /// 3. Atomically renaming the temp file to the final location
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!("Saving checkpoint: LSN={}", checkpoint.lsn());

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists, so the next capture starts
    /// from the server's current position.
    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted checkpoint file");
        }
        Ok(())
    }
}
