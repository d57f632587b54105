//! Integration tests that call the real Claude API.
//!
//! These tests require ANTHROPIC_API_KEY to be set (via .env file or environment).
//! Run with: `cargo test -p loom-core --test api_integration -- --ignored`
//!
//! These are marked #[ignore] by default to avoid API costs and slow runs.

use loom_core::llm::{CallPolicy, ClaudeGenerator, Generator, ResilientGenerator};
use loom_core::memory::MemoryStore;
use loom_core::{
    EntityRecord, PlannerStrategy, SceneStrategy, SearchConfig, SearchEngine, WorldState,
    WorldStateDelta,
};
use std::time::Duration;

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

fn has_api_key() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok()
}

fn generator() -> ResilientGenerator<ClaudeGenerator> {
    let claude = ClaudeGenerator::from_env()
        .expect("Failed to create client")
        .with_max_tokens(2048);
    let policy = CallPolicy {
        timeout: Duration::from_secs(90),
        ..CallPolicy::default()
    };
    ResilientGenerator::new(claude, policy)
}

#[tokio::test]
#[ignore] // Run with: cargo test -p loom-core --test api_integration -- --ignored
async fn test_structured_reply_parses() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let value = generator()
        .generate_structured("Return JSON: {\"score\": 0.5}", "You are terse.")
        .await
        .expect("structured call should succeed");
    assert!(value.get("score").is_some(), "Expected a score, got {value}");
}

#[tokio::test]
#[ignore]
async fn test_plan_search_produces_a_plan() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let memory = MemoryStore::in_memory("live-plan");
    let planner = PlannerStrategy::new(generator()).with_genre("mystery");
    let mut engine = SearchEngine::new(planner, SearchConfig::new(2, 2));

    let decision = engine
        .run_single(
            "A lighthouse keeper finds letters from a drowned town",
            WorldState::new(),
            &memory,
        )
        .await
        .expect("search should run");

    println!("Report: {:?}", decision.report);
    assert!(decision.label.is_some(), "Expected a chosen plan");
    assert!(decision.state.has_plan());
}

#[tokio::test]
#[ignore]
async fn test_scene_search_commits_beats() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let mut memory = MemoryStore::in_memory("live-scene");
    let _ = memory
        .merge_world_state(
            &WorldStateDelta::new()
                .character(
                    "Mira",
                    EntityRecord::default().with_status("alive").with_location("mill"),
                )
                .with_summary("Mira has found a ledger proving the harbor master's fraud."),
        )
        .await;

    let mut engine = SearchEngine::new(SceneStrategy::new(generator()), SearchConfig::new(2, 2));
    let outcome = engine
        .run_sequential("Mira hides the ledger before the harbor master arrives", 2, &mut memory)
        .await
        .expect("search should run");

    for beat in &outcome.labels {
        println!("- {beat}");
    }
    assert_eq!(memory.current_step() as usize, outcome.labels.len());
    assert!(memory.world_state().characters.contains_key("Mira"));
}
