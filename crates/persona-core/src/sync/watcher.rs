//! Polling watcher for a file
//!
//! Samples the file's signature on an interval and emits a [`WatchEvent`] whenever it
//! changes, including when the file appears or disappears. Events go into the receiver's
//! channel; debouncing and the feedback-loop guard live on the receiving side. Read
//! errors never stop the loop.
//!
//! The signature is `(modified, len)` plus the inode on unix. Filesystems with coarse
//! timestamps (FAT, HFS+, some network mounts) can hide a same-length rewrite inside one
//! mtime tick, so while the mtime is recent the content digest is part of it too.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::types::Fingerprint;

/// Files modified this recently are also compared by content
const COARSE_MTIME_WINDOW: Duration = Duration::from_secs(5);

/// Change detector for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSignature {
    pub modified: Option<SystemTime>,
    pub len: u64,
    /// Inode number; rename-based writes always change it
    pub inode: Option<u64>,
    /// Content digest, only taken while `modified` is within the coarse window
    pub digest: Option<Fingerprint>,
}

impl FileSignature {
    /// `None` when the file does not exist or cannot be stat'ed
    pub async fn probe(path: &Path) -> Option<Self> {
        let metadata = tokio::fs::metadata(path).await.ok()?;
        let modified = metadata.modified().ok();
        let digest = if is_recent(modified) {
            tokio::fs::read(path).await.ok().map(|bytes| Fingerprint::of(&bytes))
        } else {
            None
        };
        Some(Self {
            modified,
            len: metadata.len(),
            inode: inode(&metadata),
            digest,
        })
    }

    /// True when `self` describes different content than `earlier`. Digests are only
    /// compared when both samples carry one.
    pub fn differs_from(&self, earlier: &Self) -> bool {
        if self.modified != earlier.modified || self.len != earlier.len || self.inode != earlier.inode {
            return true;
        }
        matches!((self.digest, earlier.digest), (Some(now), Some(then)) if now != then)
    }
}

fn is_recent(modified: Option<SystemTime>) -> bool {
    match modified {
        // A timestamp in the future counts as recent
        Some(modified) => SystemTime::now()
            .duration_since(modified)
            .map_or(true, |age| age <= COARSE_MTIME_WINDOW),
        None => true,
    }
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

fn changed(last: &Option<FileSignature>, current: &Option<FileSignature>) -> bool {
    match (last, current) {
        (Some(last), Some(current)) => current.differs_from(last),
        (None, None) => false,
        _ => true,
    }
}

/// Notification sent to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The document at `path` changed (or appeared)
    Changed { path: PathBuf },
    /// The document at `path` was removed
    Removed { path: PathBuf },
}

/// Running watcher task; dropping the handle does not stop it, call [`WatcherHandle::stop`]
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Start polling `path` every `interval`
    pub fn spawn(path: PathBuf, interval: Duration, events: mpsc::Sender<WatchEvent>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let watched = path;

        let task = tokio::spawn(async move {
            let mut last = FileSignature::probe(&watched).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::debug!(path = %watched.display(), "Sync watcher started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = FileSignature::probe(&watched).await;
                        if !changed(&last, &current) {
                            continue;
                        }
                        let event = match current {
                            Some(_) => WatchEvent::Changed { path: watched.clone() },
                            None => WatchEvent::Removed { path: watched.clone() },
                        };
                        last = current;
                        if events.send(event).await.is_err() {
                            tracing::debug!("Sync watcher receiver closed");
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(path = %watched.display(), "Sync watcher stopped");
        });

        Self { shutdown_tx, task }
    }

    /// Signal the task to stop and wait for it
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync watcher task ended abnormally");
        }
    }
}
