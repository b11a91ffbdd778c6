//! Single-consumer dispatcher around a [`SyncEngine`]
//!
//! Every trigger (store mutation, watcher event, operator command) funnels into one task,
//! so engine operations never overlap. Watcher events are coalesced with a trailing
//! debounce: each event pushes the deadline back, and the import runs once the window
//! stays quiet.

use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::engine::{debounce_deadline, SyncEngine, SyncOutcome, SyncStatus, SyncTransition};
use super::watcher::WatchEvent;
use crate::error::SyncError;
use crate::profile::{ChangeOrigin, StoreChange};
use crate::types::Fingerprint;

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

enum Command {
    Enable(Reply<SyncOutcome>),
    Disable(Reply<()>),
    ExportNow(Reply<SyncOutcome>),
    ImportNow(Reply<SyncOutcome>),
    MergeNow(Reply<SyncOutcome>),
    Retry(Reply<SyncOutcome>),
    SetPath(PathBuf, Reply<()>),
    ExportBundle(PathBuf, Reply<Fingerprint>),
    Shutdown(oneshot::Sender<()>),
}

/// Work collected between engine operations
#[derive(Debug, Default)]
struct Pending {
    export: bool,
    import: bool,
    deadline: Option<Instant>,
}

/// Spawns the dispatcher task
#[derive(Debug)]
pub struct SyncService;

impl SyncService {
    /// Take ownership of `engine` and its watcher channel and start dispatching.
    /// When the engine's settings say `enabled`, sync is switched on right away.
    pub fn spawn(engine: SyncEngine, watch_rx: mpsc::Receiver<WatchEvent>) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let status_rx = engine.status_receiver();
        let transitions = engine.transition_sender();

        let task = tokio::spawn(dispatch(engine, watch_rx, command_rx));

        SyncHandle {
            command_tx,
            status_rx,
            transitions,
            task,
        }
    }
}

/// Client side of the dispatcher
#[derive(Debug)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SyncStatus>,
    transitions: broadcast::Sender<SyncTransition>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Enable(_) => "Enable",
            Command::Disable(_) => "Disable",
            Command::ExportNow(_) => "ExportNow",
            Command::ImportNow(_) => "ImportNow",
            Command::MergeNow(_) => "MergeNow",
            Command::Retry(_) => "Retry",
            Command::SetPath(..) => "SetPath",
            Command::ExportBundle(..) => "ExportBundle",
            Command::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SyncHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    pub async fn enable(&self) -> Result<SyncOutcome, SyncError> {
        self.request(Command::Enable).await
    }

    pub async fn disable(&self) -> Result<(), SyncError> {
        self.request(Command::Disable).await
    }

    pub async fn export_now(&self) -> Result<SyncOutcome, SyncError> {
        self.request(Command::ExportNow).await
    }

    pub async fn import_now(&self) -> Result<SyncOutcome, SyncError> {
        self.request(Command::ImportNow).await
    }

    pub async fn merge_now(&self) -> Result<SyncOutcome, SyncError> {
        self.request(Command::MergeNow).await
    }

    pub async fn retry(&self) -> Result<SyncOutcome, SyncError> {
        self.request(Command::Retry).await
    }

    pub async fn set_sync_path(&self, path: impl Into<PathBuf>) -> Result<(), SyncError> {
        let path = path.into();
        self.request(|reply| Command::SetPath(path, reply)).await
    }

    pub async fn export_bundle(&self, path: impl Into<PathBuf>) -> Result<Fingerprint, SyncError> {
        let path = path.into();
        self.request(|reply| Command::ExportBundle(path, reply)).await
    }

    /// Latest published status
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }

    /// Status feed that wakes on every change
    pub fn status_watch(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncTransition> {
        self.transitions.subscribe()
    }

    /// Disable sync and wait for the dispatcher to exit
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sync dispatcher ended abnormally");
        }
    }
}

async fn dispatch(
    mut engine: SyncEngine,
    mut watch_rx: mpsc::Receiver<WatchEvent>,
    mut command_rx: mpsc::Receiver<Command>,
) {
    let mut store_rx = engine.store().subscribe();
    let mut pending = Pending::default();

    if engine.settings().enabled {
        if let Err(e) = engine.enable().await {
            tracing::warn!(error = %e, "Initial sync failed");
        }
    }

    tracing::debug!("Sync dispatcher started");

    loop {
        let deadline = pending.deadline;
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                tracing::debug!(command = ?command, "Sync command");
                if handle_command(&mut engine, command, &mut pending).await {
                    break;
                }
            }
            change = store_rx.recv() => {
                match change {
                    Ok(StoreChange { origin: ChangeOrigin::Local, .. }) => pending.export = true,
                    Ok(StoreChange { origin: ChangeOrigin::Sync, .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Store change feed lagged");
                        pending.export = true;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = watch_rx.recv() => {
                match event {
                    Some(WatchEvent::Changed { .. }) => {
                        pending.deadline = Some(debounce_deadline(engine.settings().debounce()));
                    }
                    Some(WatchEvent::Removed { path }) => {
                        tracing::debug!(path = %path.display(), "Sync document removed");
                    }
                    None => break,
                }
            }
            _ = sleep_until_deadline(deadline) => {
                pending.deadline = None;
                pending.import = true;
            }
        }

        if pending.export || pending.import {
            run_pending(&mut engine, &mut pending).await;
        }
    }

    engine.disable().await;
    tracing::debug!("Sync dispatcher stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_pending(engine: &mut SyncEngine, pending: &mut Pending) {
    // A local edit while a document change is still settling would overwrite the peer's
    // write; fold both into one merge instead
    if pending.export && pending.deadline.take().is_some() {
        pending.import = true;
    }
    let export = std::mem::take(&mut pending.export);
    let import = std::mem::take(&mut pending.import);

    let result = match (export, import) {
        (true, true) => engine.handle_conflicting_changes().await,
        (true, false) => engine.handle_local_change().await,
        (false, true) => engine.handle_external_change().await,
        (false, false) => None,
    };

    match result {
        Some(Ok(SyncOutcome::Stale)) => {
            // Local state moved mid-operation; reconcile both sides with a merge
            pending.export = true;
            pending.import = true;
        }
        Some(Ok(_)) | Some(Err(_)) | None => {}
    }
}

/// Returns true when the dispatcher should exit
async fn handle_command(engine: &mut SyncEngine, command: Command, pending: &mut Pending) -> bool {
    match command {
        Command::Enable(reply) => {
            let _ = reply.send(engine.enable().await);
        }
        Command::Disable(reply) => {
            engine.disable().await;
            *pending = Pending::default();
            let _ = reply.send(Ok(()));
        }
        Command::ExportNow(reply) => {
            let result = engine.export_now().await;
            if result.is_ok() {
                pending.export = false;
            }
            let _ = reply.send(result);
        }
        Command::ImportNow(reply) => {
            let _ = reply.send(engine.import_now().await);
        }
        Command::MergeNow(reply) => {
            let _ = reply.send(engine.merge_now().await);
        }
        Command::Retry(reply) => {
            let _ = reply.send(engine.retry().await);
        }
        Command::SetPath(path, reply) => {
            engine.set_sync_path(path).await;
            pending.deadline = None;
            pending.import = false;
            let _ = reply.send(Ok(()));
        }
        Command::ExportBundle(path, reply) => {
            let _ = reply.send(engine.export_bundle(&path).await);
        }
        Command::Shutdown(done) => {
            engine.disable().await;
            let _ = done.send(());
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileSpec, ProfileStore, ProfilesConfig};
    use crate::sync::{SyncPhase, SyncSettings};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn(dir: &tempfile::TempDir) -> (Arc<ProfileStore>, SyncHandle) {
        let store = Arc::new(ProfileStore::from_config(ProfilesConfig::default()).unwrap());
        let settings = SyncSettings::new(dir.path().join("sync.json"))
            .with_debounce_ms(50)
            .with_poll_interval_ms(20);
        let (engine, rx) = SyncEngine::new(store.clone(), settings);
        (store, SyncService::spawn(engine, rx))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_local_change_is_exported_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = spawn(&dir);
        handle.enable().await.unwrap();
        let first = handle.status().last_export;

        store.add(ProfileSpec::new("Writer", "a writer", "warm")).unwrap();

        wait_for(|| handle.status().last_export != first).await;
        let on_disk = crate::sync::decode(&std::fs::read(dir.path().join("sync.json")).unwrap())
            .unwrap();
        assert_eq!(on_disk.config, store.snapshot());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_service_ignores_local_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, handle) = spawn(&dir);

        store.add(ProfileSpec::new("Writer", "a writer", "warm")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!dir.path().join("sync.json").exists());
        assert_eq!(handle.status().phase, SyncPhase::Disabled);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, handle) = spawn(&dir);
        let command_tx = handle.command_tx.clone();
        handle.shutdown().await;

        let (tx, _rx) = oneshot::channel();
        assert!(command_tx.send(Command::ExportNow(tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_without_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, handle) = spawn(&dir);

        let err = handle.retry().await.unwrap_err();

        assert!(matches!(err, SyncError::NothingToRetry));
        handle.shutdown().await;
    }
}
