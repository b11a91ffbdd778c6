//! Durable profile set with an active pointer
//!
//! Every mutation is read-modify-write:
//! 1. clone the current [`ProfilesConfig`]
//! 2. apply the change and check the set invariants
//! 3. persist the candidate with temp-file-then-rename
//! 4. swap it in, bump the revision and broadcast a [`StoreChange`]
//!
//! A failure at any step leaves both the file and the in-memory state untouched.
//!
//! Another process may edit the backing file (a one-shot CLI command next to a running
//! sync watcher). [`ProfileStore::refresh_from_disk`] picks such edits up; the sync
//! engine calls it before applying anything so a foreign edit is never overwritten from
//! stale memory.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

use super::{Profile, ProfilePatch, ProfileSpec, ProfilesConfig};
use crate::error::{PersonaError, ProfileError, Result, ResultExt};
use crate::fsutil::atomic_write;
use crate::types::Fingerprint;

/// Who caused a store mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Local edit, evolution or reset
    Local,
    /// Replacement applied by the sync engine
    Sync,
}

/// Notification published after each committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreChange {
    pub revision: u64,
    pub origin: ChangeOrigin,
}

#[derive(Debug)]
struct StoreInner {
    config: ProfilesConfig,
    revision: u64,
    /// Fingerprint of the file content this store last read or wrote
    on_disk: Option<Fingerprint>,
}

/// Persisted profile collection
#[derive(Debug)]
pub struct ProfileStore {
    /// Backing file; `None` keeps everything in memory
    path: Option<PathBuf>,

    inner: RwLock<StoreInner>,

    changes: broadcast::Sender<StoreChange>,
}

impl ProfileStore {
    fn with_config(
        path: Option<PathBuf>,
        config: ProfilesConfig,
        on_disk: Option<Fingerprint>,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            path,
            inner: RwLock::new(StoreInner {
                config,
                revision: 0,
                on_disk,
            }),
            changes,
        }
    }

    /// Store without a backing file, seeded with the default profiles
    pub fn in_memory() -> Self {
        Self::with_config(None, ProfilesConfig::defaults(), None)
    }

    /// Store without a backing file holding `config`
    pub fn from_config(config: ProfilesConfig) -> Result<Self> {
        config.check_invariants()?;
        Ok(Self::with_config(None, config, None))
    }

    /// Open (or create) the store file. A missing file is seeded with the defaults.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            let content = std::fs::read(&path)
                .with_context(|| format!("Reading profile store '{}'", path.display()))?;
            let config = Self::parse_file(&path, &content)?;
            tracing::debug!(path = %path.display(), profiles = config.list.len(), "Loaded profile store");
            let fingerprint = Fingerprint::of(&content);
            return Ok(Self::with_config(Some(path), config, Some(fingerprint)));
        }

        let config = ProfilesConfig::defaults();
        let fingerprint = Self::write_file(&path, &config)?;
        tracing::info!(path = %path.display(), "Seeded profile store with defaults");
        Ok(Self::with_config(Some(path), config, Some(fingerprint)))
    }

    fn parse_file(path: &Path, content: &[u8]) -> Result<ProfilesConfig> {
        let config: ProfilesConfig = serde_json::from_slice(content)
            .with_context(|| format!("Parsing profile store '{}'", path.display()))?;
        config.check_invariants()?;
        Ok(config)
    }

    fn write_file(path: &Path, config: &ProfilesConfig) -> Result<Fingerprint> {
        let data = serde_json::to_vec_pretty(config)?;
        atomic_write(path, &data)
            .map_err(PersonaError::from)
            .with_context(|| format!("Writing profile store '{}'", path.display()))?;
        Ok(Fingerprint::of(&data))
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Subscribe to committed mutations
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Monotonic mutation counter
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Full copy of the current configuration
    pub fn snapshot(&self) -> ProfilesConfig {
        self.inner.read().config.clone()
    }

    /// Configuration together with the revision it was read at
    pub fn snapshot_with_revision(&self) -> (ProfilesConfig, u64) {
        let inner = self.inner.read();
        (inner.config.clone(), inner.revision)
    }

    pub fn list(&self) -> Vec<Profile> {
        self.inner.read().config.list.clone()
    }

    pub fn get(&self, id: &str) -> Option<Profile> {
        self.inner.read().config.get(id).cloned()
    }

    pub fn active_id(&self) -> Option<String> {
        self.inner.read().config.active_profile_id.clone()
    }

    pub fn get_active(&self) -> Option<Profile> {
        self.inner.read().config.active().cloned()
    }

    /// Read-modify-write core shared by every mutation
    fn commit<T>(
        &self,
        origin: ChangeOrigin,
        f: impl FnOnce(&mut ProfilesConfig) -> std::result::Result<T, ProfileError>,
    ) -> Result<T> {
        let mut inner = self.inner.write();
        let mut next = inner.config.clone();
        let out = f(&mut next)?;
        let change = self.install(&mut inner, next, origin)?;
        drop(inner);

        // No subscribers is fine
        let _ = self.changes.send(change);
        Ok(out)
    }

    /// Check, persist and swap in `next` while the write lock is held
    fn install(
        &self,
        inner: &mut StoreInner,
        next: ProfilesConfig,
        origin: ChangeOrigin,
    ) -> Result<StoreChange> {
        next.check_invariants()?;

        if let Some(path) = &self.path {
            inner.on_disk = Some(Self::write_file(path, &next)?);
        }

        inner.config = next;
        inner.revision += 1;
        Ok(StoreChange {
            revision: inner.revision,
            origin,
        })
    }

    /// Add a profile with a fresh id and empty statistics
    pub fn add(&self, spec: ProfileSpec) -> Result<Profile> {
        let profile = Profile::new(spec);
        profile.validate()?;
        let created = profile.clone();
        self.commit(ChangeOrigin::Local, move |config| {
            config.list.push(profile);
            Ok(())
        })?;
        tracing::info!(id = %created.id, name = %created.name, "Added profile");
        Ok(created)
    }

    /// Merge the provided fields into an existing profile
    pub fn update(&self, id: &str, patch: ProfilePatch) -> Result<Profile> {
        self.commit(ChangeOrigin::Local, |config| {
            let profile = config
                .get_mut(id)
                .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
            profile.apply(patch);
            profile.validate()?;
            Ok(profile.clone())
        })
    }

    /// Run `f` against one profile as a single committed mutation
    pub fn mutate_profile(&self, id: &str, f: impl FnOnce(&mut Profile)) -> Result<Profile> {
        self.commit(ChangeOrigin::Local, |config| {
            let profile = config
                .get_mut(id)
                .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
            f(profile);
            Ok(profile.clone())
        })
    }

    /// Remove a profile, clearing the active pointer if it pointed here
    pub fn delete(&self, id: &str) -> Result<Profile> {
        let removed = self.commit(ChangeOrigin::Local, |config| {
            let index = config
                .list
                .iter()
                .position(|p| p.id == id)
                .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
            let removed = config.list.remove(index);
            if config.active_profile_id.as_deref() == Some(id) {
                config.active_profile_id = None;
            }
            Ok(removed)
        })?;
        tracing::info!(id = %removed.id, "Deleted profile");
        Ok(removed)
    }

    /// Point the active profile at `id`, or clear it with `None`
    pub fn set_active(&self, id: Option<&str>) -> Result<()> {
        self.commit(ChangeOrigin::Local, |config| {
            if let Some(id) = id {
                if !config.contains(id) {
                    return Err(ProfileError::NotFound(id.to_string()));
                }
            }
            config.active_profile_id = id.map(str::to_string);
            Ok(())
        })
    }

    /// Replace everything with the seed set and clear the active pointer
    pub fn reset_to_defaults(&self) -> Result<()> {
        self.commit(ChangeOrigin::Local, |config| {
            *config = ProfilesConfig::defaults();
            Ok(())
        })?;
        tracing::info!("Profiles reset to defaults");
        Ok(())
    }

    /// Wholesale replacement
    pub fn replace(&self, config: ProfilesConfig, origin: ChangeOrigin) -> Result<()> {
        self.commit(origin, move |current| {
            *current = config;
            Ok(())
        })
    }

    /// Wholesale replacement that refuses when the store moved past `expected_revision`.
    ///
    /// Returns `Ok(false)` without touching anything when the revision no longer matches.
    pub fn replace_if_revision(
        &self,
        config: ProfilesConfig,
        expected_revision: u64,
        origin: ChangeOrigin,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.revision != expected_revision {
            return Ok(false);
        }
        let change = self.install(&mut inner, config, origin)?;
        drop(inner);

        let _ = self.changes.send(change);
        Ok(true)
    }

    /// Reload the backing file when another process changed it.
    ///
    /// Returns `Ok(true)` when different profiles were installed; that counts as a local
    /// change and is broadcast as one. A missing file or an in-memory store is a no-op.
    pub fn refresh_from_disk(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        // Read under the lock so a concurrent commit cannot slip between read and compare
        let mut inner = self.inner.write();
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(PersonaError::from(e)
                    .context(format!("Reading profile store '{}'", path.display())))
            }
        };
        let fingerprint = Fingerprint::of(&content);
        if inner.on_disk == Some(fingerprint) {
            return Ok(false);
        }

        let config = Self::parse_file(path, &content)?;
        inner.on_disk = Some(fingerprint);
        if config == inner.config {
            return Ok(false);
        }
        inner.config = config;
        inner.revision += 1;
        let change = StoreChange {
            revision: inner.revision,
            origin: ChangeOrigin::Local,
        };
        drop(inner);

        tracing::info!(path = %path.display(), "Reloaded profile store changed by another process");
        let _ = self.changes.send(change);
        Ok(true)
    }
}
