//! Persona Core - evolving style profiles kept in sync through a shared file
//!
//! Persona Core stores named persona/style presets, learns which topics each one is
//! used for, and keeps the whole profile set eventually consistent with a peer client
//! through a single JSON document on disk.
//!
//! # Architecture
//!
//! Three cooperating parts:
//!
//! 1. **Profile Store** (`profile`): the authoritative, persisted profile set with
//!    change notifications
//! 2. **Evolution Tracker** (`evolution`): per-profile topic statistics with bounded,
//!    recency-weighted eviction
//! 3. **Sync Engine** (`sync`): export, import and merge against the shared document,
//!    driven by a file watcher and local mutations
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use persona_core::evolution::{EvolutionSettings, EvolutionTracker};
//! use persona_core::profile::{ProfileSpec, ProfileStore};
//!
//! // An in-memory store seeded with the default profiles
//! let store = Arc::new(ProfileStore::in_memory());
//!
//! let writer = store
//!     .add(ProfileSpec::new("Release notes", "A product manager", "upbeat")
//!         .with_guideline("Lead with user impact"))
//!     .unwrap();
//! store.set_active(Some(writer.id.as_str())).unwrap();
//!
//! // Record a few generations
//! let tracker = EvolutionTracker::new(store.clone(), EvolutionSettings::default());
//! tracker.evolve(&writer.id, "Summarize the Rust upgrade", &["Rust", "upgrades"]);
//! tracker.evolve(&writer.id, "Announce the rust toolchain bump", &["rust"]);
//!
//! let top = tracker.top_k_topics(&writer.id, 1);
//! assert_eq!(top[0].name, "rust");
//! assert_eq!(top[0].count, 2);
//! assert_eq!(store.get_active().unwrap().usage_count(), 2);
//! ```
//!
//! # Design Principles
//!
//! 1. **One writer per concern**: the store serializes mutations, the sync dispatcher
//!    serializes sync operations
//! 2. **Validate at the boundary**: foreign documents are fully checked before anything
//!    is applied
//! 3. **Fail soft**: evolution never breaks generation, sync failures park the engine in
//!    `Error` until the next trigger or a retry

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod config;
pub mod error;
pub mod evolution;
pub mod fsutil;
pub mod profile;
pub mod sync;
pub mod types;

// Re-export commonly used types for convenience
pub use config::PersonaConfig;
pub use error::{PersonaError, ProfileError, Result, ResultExt, SyncError};
pub use evolution::{EvolutionSettings, EvolutionTracker};
pub use profile::{
    ChangeOrigin, EvolvingProfile, Profile, ProfilePatch, ProfileSpec, ProfileStore,
    ProfilesConfig, Topic,
};
pub use sync::{
    MergeReport, SyncEngine, SyncHandle, SyncOutcome, SyncPhase, SyncService, SyncSettings,
    SyncStatus,
};
pub use types::{Fingerprint, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_evolution_survives_store_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");

        let store = Arc::new(ProfileStore::open(&path).unwrap());
        let tracker = EvolutionTracker::new(store.clone(), EvolutionSettings::default());
        tracker.evolve("default-technical", "Explain the borrow checker", &["Rust"]);
        drop(tracker);
        drop(store);

        let reopened = ProfileStore::open(&path).unwrap();
        let profile = reopened.get("default-technical").unwrap();
        assert_eq!(profile.usage_count(), 1);
        assert_eq!(profile.evolving_profile.topic("rust").unwrap().count, 1);
    }

    #[test]
    fn test_version_constants() {
        assert_eq!(NAME, "persona-core");
        assert!(!VERSION.is_empty());
    }
}
