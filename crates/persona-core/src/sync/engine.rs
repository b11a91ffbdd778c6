//! Sync state machine
//!
//! ```text
//!            enable                 export / import / merge
//! Disabled ─────────▶ Idle ─────────────────────────────────▶ Exporting | Importing | Merging
//!    ▲                 ▲  ▲                                          │          │
//!    │ disable         │  └──────────────── success ─────────────────┘          │ failure
//!    └─────────────────┤                                                        ▼
//!                      └──────────────── retry / next success ─────────────── Error
//! ```
//!
//! One engine instance owns its enabled flag, its watcher and its busy flag. It is driven
//! by the dispatcher in [`super::service`], which guarantees that at most one operation
//! runs at a time. Failures are caught here: they move the phase to `Error`, are recorded
//! as `last_error` and leave the watcher armed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use super::document::{self, DocumentFormat};
use super::merge::{merge_configs, MergeReport};
use super::watcher::{WatchEvent, WatcherHandle};
use super::SyncSettings;
use crate::error::SyncError;
use crate::evolution::enforce_topic_cap;
use crate::fsutil::atomic_write_async;
use crate::profile::{ChangeOrigin, ProfileStore, ProfilesConfig};
use crate::types::{now, Fingerprint, Timestamp};

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Disabled,
    Idle,
    Exporting,
    Importing,
    Merging,
    Error,
}

impl SyncPhase {
    /// An operation is in flight
    pub fn is_working(self) -> bool {
        matches!(self, SyncPhase::Exporting | SyncPhase::Importing | SyncPhase::Merging)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncPhase::Disabled => "disabled",
            SyncPhase::Idle => "idle",
            SyncPhase::Exporting => "exporting",
            SyncPhase::Importing => "importing",
            SyncPhase::Merging => "merging",
            SyncPhase::Error => "error",
        };
        f.write_str(label)
    }
}

/// Operations the engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOp {
    Export,
    /// Operator import, always applied when valid
    Import,
    /// Watcher-triggered import, skipped for content this engine already knows
    AutoImport,
    Merge,
}

impl SyncOp {
    fn phase(self) -> SyncPhase {
        match self {
            SyncOp::Export => SyncPhase::Exporting,
            SyncOp::Import | SyncOp::AutoImport => SyncPhase::Importing,
            SyncOp::Merge => SyncPhase::Merging,
        }
    }
}

/// Result of a successful operation
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Exported {
        fingerprint: Fingerprint,
        profiles: usize,
    },
    Imported {
        format: DocumentFormat,
        profiles: usize,
    },
    Merged {
        report: MergeReport,
        exported: bool,
    },
    /// Nothing to do: the document matches what this engine last wrote or read
    Unchanged,
    /// Local state moved on while the operation was in flight; its result was dropped
    Stale,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Exported {
                fingerprint,
                profiles,
            } => write!(f, "exported {} profiles ({})", profiles, fingerprint.short()),
            SyncOutcome::Imported { format, profiles } => {
                write!(f, "imported {} profiles from {:?} document", profiles, format)
            }
            SyncOutcome::Merged { report, exported } => write!(
                f,
                "merged: {} added, {} updated, {} kept local{}",
                report.added,
                report.updated,
                report.kept_local,
                if *exported { ", exported" } else { "" }
            ),
            SyncOutcome::Unchanged => f.write_str("already in sync"),
            SyncOutcome::Stale => f.write_str("discarded stale result"),
        }
    }
}

/// Published on every phase change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTransition {
    pub from: SyncPhase,
    pub to: SyncPhase,
    pub at: Timestamp,
    pub detail: Option<String>,
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub enabled: bool,
    pub path: PathBuf,
    pub phase: SyncPhase,
    pub busy: bool,
    pub last_error: Option<String>,
    pub last_sync_at: Option<Timestamp>,
    pub last_export: Option<Fingerprint>,
}

/// The sync state machine
#[derive(Debug)]
pub struct SyncEngine {
    store: Arc<ProfileStore>,
    settings: SyncSettings,

    enabled: bool,
    phase: SyncPhase,

    /// Set while an export/import/merge is in flight
    busy: bool,

    last_error: Option<String>,
    last_failed: Option<SyncOp>,
    last_sync_at: Option<Timestamp>,

    /// Fingerprint of the last document this engine wrote
    last_export: Option<Fingerprint>,
    /// Fingerprint of the last document this engine read and accepted
    last_import: Option<Fingerprint>,

    watcher: Option<WatcherHandle>,
    watch_tx: mpsc::Sender<WatchEvent>,

    transitions: broadcast::Sender<SyncTransition>,
    status_tx: watch::Sender<SyncStatus>,
}

impl SyncEngine {
    /// Create a disabled engine. The returned receiver carries watcher events and
    /// belongs to whoever drives the engine (normally [`super::SyncService`]).
    pub fn new(
        store: Arc<ProfileStore>,
        settings: SyncSettings,
    ) -> (Self, mpsc::Receiver<WatchEvent>) {
        let (watch_tx, watch_rx) = mpsc::channel(64);
        let (transitions, _) = broadcast::channel(64);
        let initial = SyncStatus {
            enabled: false,
            path: settings.path.clone(),
            phase: SyncPhase::Disabled,
            busy: false,
            last_error: None,
            last_sync_at: None,
            last_export: None,
        };
        let (status_tx, _) = watch::channel(initial);

        let engine = Self {
            store,
            settings,
            enabled: false,
            phase: SyncPhase::Disabled,
            busy: false,
            last_error: None,
            last_failed: None,
            last_sync_at: None,
            last_export: None,
            last_import: None,
            watcher: None,
            watch_tx,
            transitions,
            status_tx,
        };
        (engine, watch_rx)
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            enabled: self.enabled,
            path: self.settings.path.clone(),
            phase: self.phase,
            busy: self.busy,
            last_error: self.last_error.clone(),
            last_sync_at: self.last_sync_at,
            last_export: self.last_export,
        }
    }

    /// Phase-change feed for status displays
    pub fn subscribe(&self) -> broadcast::Receiver<SyncTransition> {
        self.transitions.subscribe()
    }

    pub(crate) fn transition_sender(&self) -> broadcast::Sender<SyncTransition> {
        self.transitions.clone()
    }

    pub(crate) fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn transition(&mut self, to: SyncPhase, detail: Option<String>) {
        if self.phase == to {
            self.publish_status();
            return;
        }
        let transition = SyncTransition {
            from: self.phase,
            to,
            at: now(),
            detail,
        };
        tracing::debug!(from = %transition.from, to = %transition.to, "Sync phase change");
        self.phase = to;
        self.publish_status();
        let _ = self.transitions.send(transition);
    }

    /// Where the machine settles after an operation
    fn rest_phase(&self) -> SyncPhase {
        if self.enabled {
            SyncPhase::Idle
        } else {
            SyncPhase::Disabled
        }
    }

    fn spawn_watcher(&mut self) {
        self.watcher = Some(WatcherHandle::spawn(
            self.settings.path.clone(),
            self.settings.poll_interval(),
            self.watch_tx.clone(),
        ));
    }

    async fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
    }

    /// Arm the watcher and run the initial sync: merge when a document exists, export
    /// otherwise. A failed initial sync leaves the engine enabled in `Error`.
    pub async fn enable(&mut self) -> Result<SyncOutcome, SyncError> {
        if self.enabled {
            return Ok(SyncOutcome::Unchanged);
        }
        self.enabled = true;
        self.transition(SyncPhase::Idle, Some("sync enabled".to_string()));
        self.spawn_watcher();
        tracing::info!(path = %self.settings.path.display(), "Profile sync enabled");

        // A document we cannot even stat must not be exported over
        let exists = match tokio::fs::try_exists(&self.settings.path).await {
            Ok(exists) => exists,
            Err(e) => {
                let err = SyncError::io(&self.settings.path, e);
                self.record_failure(SyncOp::Merge, &err);
                return Err(err);
            }
        };
        if exists {
            self.run(SyncOp::Merge).await
        } else {
            self.run(SyncOp::Export).await
        }
    }

    /// Tear down the watcher and stop reacting to triggers
    pub async fn disable(&mut self) {
        self.stop_watcher().await;
        if self.enabled {
            tracing::info!(path = %self.settings.path.display(), "Profile sync disabled");
        }
        self.enabled = false;
        self.transition(SyncPhase::Disabled, Some("sync disabled".to_string()));
    }

    /// Point the engine at another document
    pub async fn set_sync_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path == self.settings.path {
            return;
        }
        self.settings.path = path;
        self.last_export = None;
        self.last_import = None;
        if self.enabled {
            self.stop_watcher().await;
            self.spawn_watcher();
        }
        tracing::info!(path = %self.settings.path.display(), "Sync path changed");
        self.publish_status();
    }

    pub async fn export_now(&mut self) -> Result<SyncOutcome, SyncError> {
        self.run(SyncOp::Export).await
    }

    pub async fn import_now(&mut self) -> Result<SyncOutcome, SyncError> {
        self.run(SyncOp::Import).await
    }

    pub async fn merge_now(&mut self) -> Result<SyncOutcome, SyncError> {
        self.run(SyncOp::Merge).await
    }

    /// Re-attempt the last failed operation
    pub async fn retry(&mut self) -> Result<SyncOutcome, SyncError> {
        match self.last_failed {
            Some(op) => self.run(op).await,
            None => Err(SyncError::NothingToRetry),
        }
    }

    /// Auto-export after a local mutation; ignored while disabled
    pub async fn handle_local_change(&mut self) -> Option<Result<SyncOutcome, SyncError>> {
        if !self.enabled {
            return None;
        }
        Some(self.run(SyncOp::Export).await)
    }

    /// Auto-import after a (debounced) document change; ignored while disabled
    pub async fn handle_external_change(&mut self) -> Option<Result<SyncOutcome, SyncError>> {
        if !self.enabled {
            return None;
        }
        Some(self.run(SyncOp::AutoImport).await)
    }

    /// Local and external changes pending together: reconcile instead of overwriting.
    /// When the document turns out to be content this engine already knows, a plain
    /// export is enough (and keeps local deletions deleted).
    pub async fn handle_conflicting_changes(&mut self) -> Option<Result<SyncOutcome, SyncError>> {
        if !self.enabled {
            return None;
        }
        let known = match self.read_document(&self.settings.path).await {
            Ok(bytes) => self.is_known(Fingerprint::of(&bytes)),
            Err(_) => false,
        };
        let op = if known { SyncOp::Export } else { SyncOp::Merge };
        Some(self.run(op).await)
    }

    /// Write the versioned envelope to `path` for manual transfer. Does not touch the
    /// sync state.
    pub async fn export_bundle(&self, path: &Path) -> Result<Fingerprint, SyncError> {
        let bytes = document::encode_bundle(&self.store.snapshot(), now())?;
        self.write_document(path, &bytes).await?;
        tracing::info!(path = %path.display(), "Exported profile bundle");
        Ok(Fingerprint::of(&bytes))
    }

    /// Busy guard, phase bookkeeping and error capture around one operation
    async fn run(&mut self, op: SyncOp) -> Result<SyncOutcome, SyncError> {
        if self.busy {
            return Err(SyncError::Busy);
        }
        self.busy = true;
        self.transition(op.phase(), None);

        let path = self.settings.path.clone();
        let result = match op {
            SyncOp::Export => self.export(&path).await,
            SyncOp::Import => self.import(&path, false).await,
            SyncOp::AutoImport => self.import(&path, true).await,
            SyncOp::Merge => self.merge(&path).await,
        };
        self.busy = false;

        match &result {
            Ok(outcome) => {
                self.last_error = None;
                self.last_failed = None;
                if !matches!(outcome, SyncOutcome::Stale) {
                    self.last_sync_at = Some(now());
                }
                match outcome {
                    SyncOutcome::Unchanged | SyncOutcome::Stale => {
                        tracing::debug!(op = ?op, outcome = %outcome, "Sync operation skipped")
                    }
                    _ => tracing::info!(op = ?op, outcome = %outcome, "Sync operation completed"),
                }
                let rest = self.rest_phase();
                self.transition(rest, Some(outcome.to_string()));
            }
            Err(e) => self.record_failure(op, e),
        }
        result
    }

    fn record_failure(&mut self, op: SyncOp, error: &SyncError) {
        let message = format!("{:?} failed: {}", op, error);
        tracing::warn!(op = ?op, path = %self.settings.path.display(), error = %error, "Sync operation failed");
        self.last_error = Some(message.clone());
        self.last_failed = Some(op);
        self.transition(SyncPhase::Error, Some(message));
    }

    /// Pick up edits another process made to the store file
    fn refresh_store(&self) -> Result<(), SyncError> {
        self.store.refresh_from_disk().map_err(SyncError::store)?;
        Ok(())
    }

    /// Foreign documents may carry more topics than this client keeps
    fn limit_topics(&self, config: &mut ProfilesConfig) {
        let at = now();
        for profile in &mut config.list {
            enforce_topic_cap(&mut profile.evolving_profile, self.settings.topic_cap, at);
        }
    }

    fn timeout_error(&self, operation: &str, path: &Path) -> SyncError {
        SyncError::Timeout {
            operation: format!("{} {}", operation, path.display()),
            millis: self.settings.io_timeout_ms,
        }
    }

    async fn read_document(&self, path: &Path) -> Result<Vec<u8>, SyncError> {
        match tokio::time::timeout(self.settings.io_timeout(), tokio::fs::read(path)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(SyncError::io(path, e)),
            Err(_) => Err(self.timeout_error("reading", path)),
        }
    }

    async fn write_document(&self, path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
        match tokio::time::timeout(self.settings.io_timeout(), atomic_write_async(path, bytes)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SyncError::io(path, e)),
            Err(_) => Err(self.timeout_error("writing", path)),
        }
    }

    async fn export(&mut self, path: &Path) -> Result<SyncOutcome, SyncError> {
        self.refresh_store()?;
        let config = self.store.snapshot();
        let bytes = document::encode(&config)?;
        self.write_document(path, &bytes).await?;

        let fingerprint = Fingerprint::of(&bytes);
        self.last_export = Some(fingerprint);
        Ok(SyncOutcome::Exported {
            fingerprint,
            profiles: config.list.len(),
        })
    }

    /// True when `fingerprint` is content this engine produced or already applied
    fn is_known(&self, fingerprint: Fingerprint) -> bool {
        self.last_export == Some(fingerprint) || self.last_import == Some(fingerprint)
    }

    async fn import(&mut self, path: &Path, guarded: bool) -> Result<SyncOutcome, SyncError> {
        let revision = self.store.revision();
        let bytes = self.read_document(path).await?;
        let fingerprint = Fingerprint::of(&bytes);

        if guarded && self.is_known(fingerprint) {
            return Ok(SyncOutcome::Unchanged);
        }

        let mut decoded = document::decode(&bytes)?;
        self.limit_topics(&mut decoded.config);
        let profiles = decoded.config.list.len();

        // A foreign edit to the store file moves the revision and turns this into Stale
        self.refresh_store()?;
        if decoded.config == self.store.snapshot() {
            self.last_import = Some(fingerprint);
            return Ok(SyncOutcome::Unchanged);
        }

        let applied = self
            .store
            .replace_if_revision(decoded.config, revision, ChangeOrigin::Sync)
            .map_err(SyncError::store)?;
        if !applied {
            return Ok(SyncOutcome::Stale);
        }

        self.last_import = Some(fingerprint);
        Ok(SyncOutcome::Imported {
            format: decoded.format,
            profiles,
        })
    }

    async fn merge(&mut self, path: &Path) -> Result<SyncOutcome, SyncError> {
        let (local, revision) = self.store.snapshot_with_revision();
        let bytes = self.read_document(path).await?;
        let mut remote = document::decode(&bytes)?.config;
        self.limit_topics(&mut remote);
        let remote_fingerprint = Fingerprint::of(&bytes);

        self.refresh_store()?;
        let outcome = merge_configs(&local, &remote);

        let applied = if outcome.config != local {
            self.store
                .replace_if_revision(outcome.config.clone(), revision, ChangeOrigin::Sync)
                .map_err(SyncError::store)?
        } else {
            self.store.revision() == revision
        };
        if !applied {
            return Ok(SyncOutcome::Stale);
        }
        self.last_import = Some(remote_fingerprint);

        let exported = outcome.config != remote;
        if exported {
            let merged_bytes = document::encode(&outcome.config)?;
            self.write_document(path, &merged_bytes).await?;
            self.last_export = Some(Fingerprint::of(&merged_bytes));
        }

        Ok(SyncOutcome::Merged {
            report: outcome.report,
            exported,
        })
    }
}

/// Debounce window helper shared with the dispatcher
pub(crate) fn debounce_deadline(window: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + window
}
