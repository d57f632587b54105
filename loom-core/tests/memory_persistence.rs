//! Persistence tests for project memory.
//!
//! Exercises field-level merging, foreshadowing bookkeeping, the event log
//! and reload from disk through the public store and registry API.

use loom_core::memory::MemoryError;
use loom_core::testing::{
    assert_character_field, assert_resolved_at, assert_steps, assert_unresolved, MemoryHarness,
};
use loom_core::{EntityRecord, MemoryRegistry, WorldStateDelta};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn tagged(kind: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("type".to_string(), Value::from(kind));
    metadata
}

#[tokio::test]
async fn test_partial_updates_accumulate_and_persist() {
    let mut harness = MemoryHarness::new("mira").await.unwrap();
    let store = harness.store_mut();

    let receipt = store.record_event("A", Map::new()).await;
    assert_eq!(receipt.step, 0);
    assert!(receipt.durability.is_durable());

    let _ = store
        .merge_world_state(
            &WorldStateDelta::new().character("Mira", EntityRecord::default().with_status("alive")),
        )
        .await;
    let _ = store
        .merge_world_state(
            &WorldStateDelta::new()
                .character("Mira", EntityRecord::default().with_location("mill")),
        )
        .await;

    assert_character_field(harness.state(), "Mira", "status", "alive");
    assert_character_field(harness.state(), "Mira", "location", "mill");
    assert_steps(harness.state(), 1);

    let state = harness.reopen().await.unwrap().world_state().clone();
    assert_character_field(&state, "Mira", "status", "alive");
    assert_character_field(&state, "Mira", "location", "mill");
    assert_steps(&state, 1);
    assert_eq!(state.plot_points[0].text, "A");
    assert_eq!(state.plot_points[0].metadata["step"], 0);
}

#[tokio::test]
async fn test_foreshadowing_lifecycle() {
    let mut harness = MemoryHarness::new("threads").await.unwrap();
    let store = harness.store_mut();

    let first = store
        .merge_world_state(&WorldStateDelta::new().foreshadow("The locked cellar"))
        .await;
    assert_eq!(first.outcome.foreshadowing_added, 1);

    // Same description again is not a second thread
    let again = store
        .merge_world_state(&WorldStateDelta::new().foreshadow("The locked cellar"))
        .await;
    assert_eq!(again.outcome.foreshadowing_added, 0);
    assert_eq!(store.world_state().foreshadowing.len(), 1);
    let id = store.world_state().foreshadowing[0].id;

    let _ = store.record_event("Mira hears knocking below", Map::new()).await;
    let _ = store.record_event("Mira finds the key", Map::new()).await;

    let resolved = store
        .merge_world_state(&WorldStateDelta::new().resolve("The locked cellar").resolve("A ghost"))
        .await;
    assert_eq!(resolved.outcome.foreshadowing_resolved, 1);
    assert_eq!(resolved.outcome.unknown_resolutions, vec!["A ghost".to_string()]);

    let state = harness.reopen().await.unwrap().world_state().clone();
    assert_resolved_at(&state, "The locked cellar", 2);
    assert_eq!(state.foreshadowing[0].id, id);
    assert_eq!(state.foreshadowing[0].created_at_step, 0);
    assert_eq!(state.unresolved_foreshadowing().count(), 0);
}

#[tokio::test]
async fn test_direct_resolution_names_existing_thread() {
    let mut harness = MemoryHarness::new("direct").await.unwrap();
    let store = harness.store_mut();
    let _ = store
        .merge_world_state(&WorldStateDelta::new().foreshadow("The broken compass"))
        .await;

    assert!(matches!(
        store.resolve_foreshadowing("A compass").await,
        Err(MemoryError::UnknownForeshadowing(_))
    ));
    assert_unresolved(store.world_state(), "The broken compass");

    let durability = store.resolve_foreshadowing("The broken compass").await.unwrap();
    assert!(durability.is_durable());
    // Resolving twice is a no-op
    assert!(store.resolve_foreshadowing("The broken compass").await.is_ok());
    assert_resolved_at(store.world_state(), "The broken compass", 0);
}

#[tokio::test]
async fn test_relevant_events_survive_reopen() {
    let mut harness = MemoryHarness::new("recall").await.unwrap();
    let store = harness.store_mut();
    let _ = store.record_event("Mira hides the ledger under the millstone", tagged("scene")).await;
    let _ = store.record_event("The harbor master counts his coins", tagged("scene")).await;
    let _ = store.record_event("Rain floods the harbor road", tagged("scene")).await;

    let store = harness.reopen().await.unwrap();
    let hits = store.query_relevant("where is the ledger hidden", 2);
    assert_eq!(hits[0], "Mira hides the ledger under the millstone");
    assert!(store.query_relevant("dragons", 2).is_empty());
}

#[tokio::test]
async fn test_reset_is_durable() {
    let mut harness = MemoryHarness::new("reset").await.unwrap();
    let store = harness.store_mut();
    let _ = store.record_event("Something happened", Map::new()).await;
    let _ = store
        .merge_world_state(
            &WorldStateDelta::new()
                .character("Mira", EntityRecord::default().with_status("alive"))
                .foreshadow("A debt unpaid"),
        )
        .await;

    assert!(store.reset().await.is_durable());

    let store = harness.reopen().await.unwrap();
    assert_steps(store.world_state(), 0);
    assert!(store.world_state().characters.is_empty());
    assert!(store.world_state().foreshadowing.is_empty());
    assert!(store.query_relevant("Something happened", 3).is_empty());
}

#[tokio::test]
async fn test_registry_isolates_projects() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = MemoryRegistry::new(dir.path());

    let north = registry.create("north").await.unwrap();
    let south = registry.create("south").await.unwrap();
    assert!(!Arc::ptr_eq(&north, &south));

    let _ = north.lock().await.record_event("Snow on the pass", Map::new()).await;
    assert_steps(south.lock().await.world_state(), 0);

    assert!(matches!(
        registry.create("north").await,
        Err(MemoryError::ProjectExists(_))
    ));
    assert!(matches!(
        registry.open("../escape").await,
        Err(MemoryError::InvalidProjectId(_))
    ));

    let mut projects = registry.list().await.unwrap();
    projects.sort();
    assert_eq!(projects, vec!["north".to_string(), "south".to_string()]);

    let snapshot: Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("north").join("world_state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(snapshot["project_id"], json!("north"));
}
