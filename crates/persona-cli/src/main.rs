//! Persona CLI
//!
//! Manage style profiles and keep them in sync with another client through a shared file.
//!
//! # Usage
//! ```bash
//! persona [--config FILE] [--verbose] <command>
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use persona_core::config::default_config_path;
use persona_core::evolution::extract_topics;
use persona_core::sync::{WatchEvent, WatcherHandle};
use persona_core::{
    EvolutionTracker, PersonaConfig, ProfilePatch, ProfileSpec, ProfileStore, SyncEngine,
    SyncService,
};

mod output;

/// Persona - evolving style profiles with file-based sync
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ~/.persona/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List all profiles
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one profile in full
    Show {
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a profile
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        persona: String,

        #[arg(long)]
        tone: String,

        /// Style guideline (repeatable)
        #[arg(long = "guideline", value_name = "TEXT")]
        guidelines: Vec<String>,
    },

    /// Edit profile fields; given guidelines replace the existing list
    Edit {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        persona: Option<String>,

        #[arg(long)]
        tone: Option<String>,

        /// Style guideline (repeatable)
        #[arg(long = "guideline", value_name = "TEXT")]
        guidelines: Vec<String>,
    },

    /// Delete a profile
    Delete { id: String },

    /// Select the active profile
    Use {
        /// Profile to activate
        #[arg(required_unless_present = "clear", conflicts_with = "clear")]
        id: Option<String>,

        /// Clear the active profile
        #[arg(long)]
        clear: bool,
    },

    /// Replace all profiles with the built-in defaults
    Reset,

    /// Record a use of a profile
    Evolve {
        id: String,

        prompt: String,

        /// Topic keyword (repeatable); extracted from the prompt when omitted
        #[arg(long = "topic", value_name = "NAME")]
        topics: Vec<String>,
    },

    /// Show a profile's strongest topics
    Topics {
        id: String,

        #[arg(short, default_value = "5")]
        k: usize,
    },

    /// One-shot sync operations
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Enable sync and follow its transitions until Ctrl+C
    Watch,
}

impl Commands {
    /// Commands that change the store and are published when sync is on
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Commands::Add { .. }
                | Commands::Edit { .. }
                | Commands::Delete { .. }
                | Commands::Use { .. }
                | Commands::Reset
                | Commands::Evolve { .. }
        )
    }
}

#[derive(Subcommand)]
enum SyncAction {
    /// Write local profiles to the sync document
    Export,
    /// Replace local profiles with the sync document
    Import,
    /// Reconcile local profiles with the sync document
    Merge,
    /// Show sync configuration and document state
    Status,
    /// Write a versioned backup bundle
    Bundle { path: PathBuf },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = PersonaConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    tracing::debug!(
        config = %config_path.display(),
        store = %config.storage_path.display(),
        sync = %config.sync.path.display(),
        "Configuration loaded"
    );

    let store = Arc::new(
        ProfileStore::open(&config.storage_path)
            .with_context(|| format!("Failed to open {}", config.storage_path.display()))?,
    );

    // With sync switched on, a one-shot edit pulls the peer's document first and
    // publishes the result afterwards
    let mut publisher = (config.sync.enabled && cli.command.is_mutating())
        .then(|| SyncEngine::new(store.clone(), config.sync_settings()).0);
    if let Some(engine) = publisher.as_mut() {
        pull(engine).await;
    }

    match cli.command {
        Commands::List { json } => {
            let snapshot = store.snapshot();
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                output::print_profile_list(&snapshot);
            }
        }
        Commands::Show { id, json } => {
            let Some(profile) = store.get(&id) else {
                bail!("Profile '{}' not found", id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            } else {
                let active = store.active_id().as_deref() == Some(profile.id.as_str());
                output::print_profile(&profile, active);
            }
        }
        Commands::Add {
            name,
            persona,
            tone,
            guidelines,
        } => {
            let spec = guidelines
                .into_iter()
                .fold(ProfileSpec::new(name, persona, tone), |spec, g| {
                    spec.with_guideline(g)
                });
            let profile = store.add(spec)?;
            output::success(&format!("Created profile {} ({})", profile.name, profile.id));
        }
        Commands::Edit {
            id,
            name,
            persona,
            tone,
            guidelines,
        } => {
            let patch = ProfilePatch {
                name,
                persona,
                tone,
                style_guidelines: (!guidelines.is_empty()).then_some(guidelines),
                evolving_profile: None,
            };
            if patch.is_empty() {
                bail!("Nothing to change; pass at least one field");
            }
            let profile = store.update(&id, patch)?;
            output::success(&format!("Updated profile {}", profile.id));
        }
        Commands::Delete { id } => {
            let profile = store.delete(&id)?;
            output::success(&format!("Deleted profile {} ({})", profile.name, profile.id));
        }
        Commands::Use { id, clear } => {
            if clear {
                store.set_active(None)?;
                output::success("Cleared active profile");
            } else if let Some(id) = id {
                store.set_active(Some(id.as_str()))?;
                output::success(&format!("Active profile: {}", id));
            }
        }
        Commands::Reset => {
            store.reset_to_defaults()?;
            output::success("Restored default profiles");
        }
        Commands::Evolve { id, prompt, topics } => {
            if store.get(&id).is_none() {
                bail!("Profile '{}' not found", id);
            }
            let topics = if topics.is_empty() {
                extract_topics(&prompt, 3)
            } else {
                topics
            };
            let tracker = EvolutionTracker::new(store.clone(), config.evolution.clone());
            tracker.evolve(&id, &prompt, topics.as_slice());
            output::success(&format!("Recorded use of {} with topics: {}", id, topics.join(", ")));
        }
        Commands::Topics { id, k } => {
            let Some(profile) = store.get(&id) else {
                bail!("Profile '{}' not found", id);
            };
            output::print_topics(&profile, k);
        }
        Commands::Sync { action } => run_sync(action, store, config).await?,
        Commands::Watch => watch(store, config).await?,
    }

    if let Some(engine) = publisher.as_mut() {
        match engine.export_now().await {
            Ok(outcome) => tracing::debug!(%outcome, "Published local change"),
            Err(e) => output::failure(&format!("Saved locally but sync export failed: {}", e)),
        }
    }

    Ok(())
}

/// Merge the sync document into the store before a local edit
async fn pull(engine: &mut SyncEngine) {
    let exists = tokio::fs::try_exists(engine.path()).await;
    match exists {
        Ok(false) => {}
        Ok(true) => match engine.merge_now().await {
            Ok(outcome) => tracing::debug!(%outcome, "Pulled sync document"),
            Err(e) => output::failure(&format!("Could not pull sync document: {}", e)),
        },
        Err(e) => output::failure(&format!(
            "Could not inspect {}: {}",
            engine.path().display(),
            e
        )),
    }
}

async fn run_sync(
    action: SyncAction,
    store: Arc<ProfileStore>,
    config: PersonaConfig,
) -> anyhow::Result<()> {
    let (mut engine, _events) = SyncEngine::new(store, config.sync_settings());

    match action {
        SyncAction::Export => {
            let outcome = engine.export_now().await?;
            output::success(&outcome.to_string());
        }
        SyncAction::Import => {
            let outcome = engine.import_now().await?;
            output::success(&outcome.to_string());
        }
        SyncAction::Merge => {
            let outcome = engine.merge_now().await?;
            output::success(&outcome.to_string());
        }
        SyncAction::Status => {
            output::print_sync_status(&config.sync, &engine.status()).await;
        }
        SyncAction::Bundle { path } => {
            let fingerprint = engine.export_bundle(&path).await?;
            output::success(&format!(
                "Wrote bundle {} ({})",
                path.display(),
                fingerprint.short()
            ));
        }
    }
    Ok(())
}

async fn watch(store: Arc<ProfileStore>, config: PersonaConfig) -> anyhow::Result<()> {
    let (engine, events) = SyncEngine::new(store.clone(), config.sync_settings());
    let handle = SyncService::spawn(engine, events);
    let mut transitions = handle.subscribe();

    // Other invocations of this CLI write the store file directly
    let (store_tx, mut store_events) = tokio::sync::mpsc::channel(16);
    let store_watcher = WatcherHandle::spawn(
        config.storage_path.clone(),
        config.sync.poll_interval(),
        store_tx,
    );

    match handle.enable().await {
        Ok(outcome) => output::success(&outcome.to_string()),
        Err(e) => output::failure(&format!("Initial sync failed: {}", e)),
    }
    println!("Watching {} (Ctrl+C to stop)", config.sync.path.display());

    loop {
        tokio::select! {
            transition = transitions.recv() => match transition {
                Ok(transition) => output::print_transition(&transition),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            event = store_events.recv() => match event {
                Some(WatchEvent::Changed { .. }) => match store.refresh_from_disk() {
                    Ok(true) => output::success("Picked up profile changes from another process"),
                    Ok(false) => {}
                    Err(e) => output::failure(&format!("Could not reload profiles: {}", e)),
                },
                Some(WatchEvent::Removed { .. }) => {}
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    store_watcher.stop().await;
    handle.shutdown().await;
    println!("Sync stopped");
    Ok(())
}
