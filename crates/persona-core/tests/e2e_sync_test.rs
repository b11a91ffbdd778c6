//! E2E Test: File Sync
//!
//! Runs real dispatchers against a shared document in a temp directory and checks the
//! behavior a user would see: convergence between two clients, debounced imports,
//! rejection of broken documents and recovery afterwards.

use persona_core::profile::{ChangeOrigin, Profile, ProfileSpec, ProfileStore, ProfilesConfig};
use persona_core::sync::{
    encode, DocumentFormat, SyncEngine, SyncHandle, SyncOutcome, SyncPhase, SyncService,
    SyncSettings,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn settings(path: &Path) -> SyncSettings {
    SyncSettings::new(path)
        .with_debounce_ms(60)
        .with_poll_interval_ms(15)
        .with_io_timeout_ms(2_000)
}

fn profile(id: &str, usage: u64) -> Profile {
    let mut p = Profile::new(ProfileSpec::new(format!("Profile {id}"), "a writer", "neutral"));
    p.id = id.to_string();
    p.evolving_profile.usage_count = usage;
    p
}

fn client(config: ProfilesConfig, settings: SyncSettings) -> (Arc<ProfileStore>, SyncHandle) {
    let store = Arc::new(ProfileStore::from_config(config).expect("valid config"));
    let (engine, events) = SyncEngine::new(store.clone(), settings);
    (store, SyncService::spawn(engine, events))
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Two clients converge on the union of their profiles and then follow each other's edits
#[tokio::test]
async fn e2e_two_clients_converge() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");

    // 1. Client A starts alone and publishes its set
    let (store_a, handle_a) = client(
        ProfilesConfig::new(vec![profile("A", 5), profile("B", 3)], Some("A".into())),
        settings(&shared),
    );
    let outcome = handle_a.enable().await.expect("enable A");
    assert!(matches!(outcome, SyncOutcome::Exported { profiles: 2, .. }));

    // 2. Client B joins with an overlapping set and merges
    let (store_b, handle_b) = client(
        ProfilesConfig::new(vec![profile("A", 8), profile("C", 1)], None),
        settings(&shared),
    );
    let outcome = handle_b.enable().await.expect("enable B");
    match outcome {
        SyncOutcome::Merged { report, exported } => {
            assert_eq!((report.added, report.updated, report.kept_local), (1, 0, 2));
            assert!(exported);
        }
        other => panic!("expected merge, got {:?}", other),
    }

    // 3. A picks up B's merged document through its watcher
    wait_for("A to import B's merge", || store_a.snapshot() == store_b.snapshot()).await;
    let merged = store_a.snapshot();
    assert_eq!(merged.get("A").map(|p| p.usage_count()), Some(8));
    assert!(merged.contains("B") && merged.contains("C"));
    assert_eq!(merged.active_profile_id.as_deref(), Some("A"));

    // 4. A local edit on B reaches A
    let added = store_b
        .add(ProfileSpec::new("Reviewer", "a strict code reviewer", "blunt"))
        .expect("add on B");
    wait_for("A to see B's new profile", || store_a.get(&added.id).is_some()).await;

    // 5. Nobody is left in an error state
    assert_eq!(handle_a.status().phase, SyncPhase::Idle);
    assert_eq!(handle_b.status().phase, SyncPhase::Idle);
    assert!(handle_a.status().last_error.is_none());

    handle_a.shutdown().await;
    handle_b.shutdown().await;
}

/// A client must not re-import the document it just wrote
#[tokio::test]
async fn e2e_own_export_is_not_reimported() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");
    let (store, handle) = client(ProfilesConfig::new(vec![profile("A", 1)], None), settings(&shared));
    handle.enable().await.expect("enable");

    store
        .add(ProfileSpec::new("Poet", "a poet", "lyrical"))
        .expect("add");
    let exported_after = store.revision();
    wait_for("export of the new profile", || {
        std::fs::read(&shared)
            .ok()
            .and_then(|bytes| persona_core::sync::decode(&bytes).ok())
            .map(|doc| doc.config.list.len() == 2)
            .unwrap_or(false)
    })
    .await;

    // Several poll and debounce windows
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(store.revision(), exported_after);
    handle.shutdown().await;
}

/// A burst of external writes produces one import
#[tokio::test]
async fn e2e_burst_of_changes_is_debounced() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");
    let (store, handle) = client(
        ProfilesConfig::default(),
        settings(&shared).with_debounce_ms(250),
    );
    handle.enable().await.expect("enable");

    // Let the initial export's own change notification settle
    tokio::time::sleep(Duration::from_millis(500)).await;
    let mut transitions = handle.subscribe();

    for round in 1..=5u64 {
        let config = ProfilesConfig::new(vec![profile("X", round)], None);
        std::fs::write(&shared, encode(&config).expect("encode")).expect("write");
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    wait_for("the final write to be imported", || {
        store.get("X").map(|p| p.usage_count()) == Some(5)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut imports = 0;
    while let Ok(transition) = transitions.try_recv() {
        if transition.to == SyncPhase::Importing {
            imports += 1;
        }
    }
    assert_eq!(imports, 1);
    handle.shutdown().await;
}

/// A broken document is rejected without touching local state; the next good one recovers
#[tokio::test]
async fn e2e_partial_document_rejected_then_recovered() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");
    let original = ProfilesConfig::new(vec![profile("A", 2)], Some("A".into()));
    let (store, handle) = client(original.clone(), settings(&shared));
    handle.enable().await.expect("enable");
    let revision = store.revision();

    // 1. Third profile lacks a tone
    let mut broken = serde_json::to_value(profile("Z", 1)).expect("to value");
    broken.as_object_mut().expect("object").remove("tone");
    let doc = json!({
        "list": [profile("X", 1), profile("Y", 1), broken],
        "activeProfileId": null
    });
    std::fs::write(&shared, serde_json::to_vec(&doc).expect("json")).expect("write");

    wait_for("the engine to report the failure", || {
        handle.status().phase == SyncPhase::Error
    })
    .await;
    let status = handle.status();
    let message = status.last_error.expect("last error recorded");
    assert!(message.contains("profile[2].tone"), "unexpected error: {}", message);
    assert_eq!(store.snapshot(), original);
    assert_eq!(store.revision(), revision);

    // 2. The watcher is still armed: a valid legacy array is picked up
    let replacement = vec![profile("N", 4)];
    std::fs::write(&shared, serde_json::to_vec(&replacement).expect("json")).expect("write");

    wait_for("the valid document to be imported", || store.get("N").is_some()).await;
    wait_for("the engine to settle", || handle.status().phase == SyncPhase::Idle).await;
    assert!(handle.status().last_error.is_none());
    assert_eq!(store.snapshot().ids(), vec!["N"]);
    assert!(store.active_id().is_none());

    handle.shutdown().await;
}

/// Operator commands work while auto sync is off
#[tokio::test]
async fn e2e_manual_commands_while_disabled() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");
    let bundle = dir.path().join("backup.json");
    let config = ProfilesConfig::new(vec![profile("A", 3), profile("B", 1)], Some("B".into()));
    let (store, handle) = client(config.clone(), settings(&shared));

    // 1. Bundle export and re-import through the versioned envelope
    handle.export_bundle(&bundle).await.expect("bundle");
    store
        .replace(ProfilesConfig::default(), ChangeOrigin::Local)
        .expect("clear");
    handle.set_sync_path(&bundle).await.expect("set path");
    let outcome = handle.import_now().await.expect("import bundle");
    assert_eq!(
        outcome,
        SyncOutcome::Imported {
            format: DocumentFormat::Versioned { schema_version: 1 },
            profiles: 2
        }
    );
    assert_eq!(store.snapshot(), config);

    // 2. Importing the same document again changes nothing
    let revision = store.revision();
    assert_eq!(handle.import_now().await.expect("reimport"), SyncOutcome::Unchanged);
    assert_eq!(store.revision(), revision);

    // 3. Local edits are not exported automatically while disabled
    handle.set_sync_path(&shared).await.expect("set path");
    store
        .add(ProfileSpec::new("Late", "a latecomer", "shy"))
        .expect("add");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!shared.exists());
    assert_eq!(handle.status().phase, SyncPhase::Disabled);

    // 4. An explicit export does
    handle.export_now().await.expect("export");
    assert!(shared.exists());

    handle.shutdown().await;
}

/// Imports land in the persisted store file
#[tokio::test]
async fn e2e_import_persists_store() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store_path = dir.path().join("profiles.json");
    let shared = dir.path().join("shared.json");

    let remote = ProfilesConfig::new(vec![profile("R", 7)], Some("R".into()));
    std::fs::write(&shared, encode(&remote).expect("encode")).expect("write");

    let store = Arc::new(ProfileStore::open(&store_path).expect("open store"));
    let (engine, events) = SyncEngine::new(store.clone(), settings(&shared));
    let handle = SyncService::spawn(engine, events);
    handle.import_now().await.expect("import");
    handle.shutdown().await;
    drop(store);

    let reopened = ProfileStore::open(&store_path).expect("reopen");
    assert_eq!(reopened.snapshot(), remote);
}

/// An edit another process writes to the store file survives the next peer document
#[tokio::test]
async fn e2e_store_edit_from_another_process_survives_peer_write() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store_path = dir.path().join("profiles.json");
    let shared = dir.path().join("shared.json");

    let store = Arc::new(ProfileStore::open(&store_path).expect("open store"));
    store
        .replace(ProfilesConfig::new(vec![profile("A", 1)], None), ChangeOrigin::Local)
        .expect("seed");
    let (engine, events) = SyncEngine::new(store.clone(), settings(&shared));
    let handle = SyncService::spawn(engine, events);
    handle.enable().await.expect("enable");

    // 1. A one-shot command in another process adds a profile; nobody tells the dispatcher
    let other = ProfileStore::open(&store_path).expect("second opener");
    let added = other
        .add(ProfileSpec::new("Elsewhere", "added by another process", "plain"))
        .expect("add elsewhere");

    // 2. The peer publishes its own set
    let peer = ProfilesConfig::new(vec![profile("A", 1), profile("P", 2)], None);
    std::fs::write(&shared, encode(&peer).expect("encode")).expect("write");

    // 3. Both edits end up in memory, in the store file and in the shared document
    wait_for("both edits in the store", || {
        store.get(&added.id).is_some() && store.get("P").is_some()
    })
    .await;
    wait_for("the merged document", || {
        std::fs::read(&shared)
            .ok()
            .and_then(|bytes| persona_core::sync::decode(&bytes).ok())
            .map(|doc| doc.config == store.snapshot())
            .unwrap_or(false)
    })
    .await;
    let reopened = ProfileStore::open(&store_path).expect("reopen");
    assert_eq!(reopened.snapshot(), store.snapshot());
    assert_eq!(handle.status().phase, SyncPhase::Idle);

    handle.shutdown().await;
}

/// Foreign documents cannot smuggle in unfolded or excess topics
#[tokio::test]
async fn e2e_imported_topics_respect_folding_and_cap() {
    let dir = tempfile::tempdir().expect("temp dir");
    let shared = dir.path().join("shared.json");
    let (store, handle) = client(ProfilesConfig::default(), settings(&shared).with_topic_cap(2));

    let mut raw = serde_json::to_value(profile("p", u64::MAX)).expect("to value");
    raw["evolvingProfile"]["topics"] = json!([
        { "name": "TypeScript", "count": 1, "lastUsed": "2024-05-01T10:00:00Z" },
        { "name": "Rust", "count": 3, "lastUsed": "2024-05-01T10:00:00Z" },
        { "name": "rust", "count": 2, "lastUsed": "2024-05-02T10:00:00Z" },
        { "name": "SQL", "count": 1, "lastUsed": "2024-04-01T10:00:00Z" }
    ]);
    std::fs::write(&shared, serde_json::to_vec(&json!([raw])).expect("json")).expect("write");
    handle.import_now().await.expect("import");

    let tracker = persona_core::EvolutionTracker::new(
        store.clone(),
        persona_core::EvolutionSettings {
            topic_cap: 2,
            ..Default::default()
        },
    );
    tracker.evolve("p", "more typescript", &["TYPESCRIPT"]);

    let evolved = store.get("p").expect("imported profile");
    let names: Vec<&str> = evolved
        .evolving_profile
        .topics
        .iter()
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(names, vec!["typescript", "rust"]);
    assert_eq!(evolved.evolving_profile.topic("rust").map(|t| t.count), Some(5));
    assert_eq!(evolved.evolving_profile.topic("typescript").map(|t| t.count), Some(2));
    assert_eq!(evolved.usage_count(), u64::MAX);

    handle.shutdown().await;
}
