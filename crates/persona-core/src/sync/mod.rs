//! # Sync Engine
//!
//! Keeps this client's [`ProfilesConfig`](crate::profile::ProfilesConfig) eventually
//! consistent with a peer's through one shared JSON document. No network, no shared
//! process.
//!
//! ## Architecture
//!
//! ```text
//!  ProfileStore ──StoreChange──┐
//!                              ▼
//!  WatcherHandle ─WatchEvent─▶ dispatcher task ──▶ SyncEngine ──▶ sync document
//!                              ▲   (single consumer)   │
//!  SyncHandle ───Command───────┘                       └─▶ SyncTransition (broadcast)
//! ```
//!
//! - [`document`]: shape detection, validation, canonical encoding
//! - [`merge`]: id-keyed reconciliation by usage count
//! - [`watcher`]: polling change detector for the document
//! - [`engine`]: the state machine (`Disabled`, `Idle`, `Exporting`, `Importing`,
//!   `Merging`, `Error`)
//! - [`service`]: the dispatcher that serializes every trigger through one engine
//!
//! ## Triggers
//!
//! | Source | Action |
//! |---|---|
//! | local store mutation | export |
//! | document change (debounced) | import, skipped when the content is our own |
//! | both pending at once | merge, then export |
//! | operator command | export / import / merge / retry |
//!
//! ## Example
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use persona_core::profile::{ProfileSpec, ProfileStore};
//! use persona_core::sync::{SyncEngine, SyncService, SyncSettings};
//!
//! let store = Arc::new(ProfileStore::open("/home/me/.persona/profiles.json")?);
//! let settings = SyncSettings::new("/mnt/shared/persona-sync.json");
//! let (engine, events) = SyncEngine::new(store.clone(), settings);
//! let handle = SyncService::spawn(engine, events);
//!
//! // Merge with whatever the peer already wrote, then follow both sides
//! println!("{}", handle.enable().await?);
//! store.add(ProfileSpec::new("Support", "a patient support agent", "warm"))?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod document;
pub mod engine;
pub mod merge;
pub mod service;
pub mod watcher;

pub use document::{decode, encode, DecodedDocument, DocumentFormat, DocumentShape, ExportBundle};
pub use engine::{SyncEngine, SyncOp, SyncOutcome, SyncPhase, SyncStatus, SyncTransition};
pub use merge::{merge_configs, MergeOutcome, MergeReport};
pub use service::{SyncHandle, SyncService};
pub use watcher::{WatchEvent, WatcherHandle};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Start syncing as soon as the service is spawned
    pub enabled: bool,

    /// Location of the shared document
    pub path: PathBuf,

    /// Quiet window before acting on a burst of change notifications
    pub debounce_ms: u64,

    /// How often the watcher samples the document
    pub poll_interval_ms: u64,

    /// Upper bound for one read or write of the document
    pub io_timeout_ms: u64,

    /// Topics kept per incoming profile; follows the evolution settings
    #[serde(skip)]
    pub topic_cap: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: crate::config::default_sync_path(),
            debounce_ms: 300,
            poll_interval_ms: 500,
            io_timeout_ms: 5_000,
            topic_cap: crate::evolution::DEFAULT_TOPIC_CAP,
        }
    }
}

impl SyncSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_debounce_ms(mut self, millis: u64) -> Self {
        self.debounce_ms = millis;
        self
    }

    pub fn with_poll_interval_ms(mut self, millis: u64) -> Self {
        self.poll_interval_ms = millis;
        self
    }

    pub fn with_io_timeout_ms(mut self, millis: u64) -> Self {
        self.io_timeout_ms = millis;
        self
    }

    pub fn with_topic_cap(mut self, cap: usize) -> Self {
        self.topic_cap = cap;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}
