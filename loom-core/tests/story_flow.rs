//! End-to-end story flow against scripted generation.
//!
//! Plans, writes a chapter, searches scene beats and exports the manuscript,
//! then reopens the project from disk and checks nothing was lost.

use loom_core::testing::{
    assert_character_field, assert_steps, assert_unresolved, Reply, ScriptedGenerator,
};
use loom_core::{MemoryRegistry, StoryConfig, StorySession};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn plan_reply() -> Reply {
    Reply::Json(json!({
        "options": [{
            "title": "The Drowned Ledger",
            "outline": "Mira uncovers the harbor master's fraud.",
            "world_setting": {
                "characters": {
                    "Mira": {
                        "description": "A miller's daughter",
                        "status": "alive",
                        "location": "mill",
                        "role": "protagonist"
                    }
                },
                "locations": { "Mill": { "description": "A creaking watermill" } },
                "items": {},
                "rules": "The tide never lies."
            },
            "foreshadowing": ["The ledger's missing page"],
            "chapter_list": [
                { "title": "The Mill", "summary": "Mira finds the ledger." },
                { "title": "The Harbor", "summary": "Mira confronts the harbor master." }
            ]
        }]
    }))
}

fn beat_reply() -> Reply {
    Reply::Json(json!({
        "options": [{
            "beat": "Mira climbs the wheel",
            "summary": "She hides the ledger in the wheel housing.",
            "character_updates": {
                "Mira": { "location": "wheel" },
                "Harbor Master": { "status": "watching" }
            }
        }]
    }))
}

fn scripted() -> ScriptedGenerator {
    ScriptedGenerator::new()
        .with_rule("comprehensive story plans", plan_reply())
        .with_rule("Critique this story plan", Reply::Json(json!({ "score": 0.8 })))
        .with_rule("distinct next beats", beat_reply())
        .with_rule("Proposed beat:", Reply::Json(json!({ "score": "0.7" })))
        .with_rule("Title: The Mill", Reply::Text("Mira pushed open the mill door.".to_string()))
        .with_rule(
            "Turn these beats",
            Reply::Text("The wheel groaned under her weight.".to_string()),
        )
        .with_rule("Rewrite this chapter", Reply::Text("Rain hammered the mill door.".to_string()))
}

async fn open_session(dir: &TempDir) -> StorySession {
    let registry = MemoryRegistry::new(dir.path());
    let config = StoryConfig::new(dir.path())
        .with_iterations(2)
        .with_branch_factor(1)
        .with_seed(11);
    StorySession::attach(&registry, config, Arc::new(scripted()), "ledger")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_plan_write_and_export() {
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir).await;

    let plan = session.plan("A miller's daughter and a stolen ledger").await.unwrap();
    assert_eq!(plan.label.as_deref(), Some("The Drowned Ledger"));
    assert!(plan.durability.is_durable());
    assert!(!plan.report.is_degraded());
    assert_eq!(plan.report.rollouts, 2);

    let state = &plan.state;
    assert_character_field(state, "Mira", "location", "mill");
    assert_character_field(state, "Mira", "role", "protagonist");
    assert_unresolved(state, "The ledger's missing page");
    assert_eq!(state.chapters.len(), 2);
    assert!(state.summary.ends_with("World Rules: The tide never lies."));
    assert_steps(state, 0);

    let chapter = session.write_chapter(1).await.unwrap();
    assert_eq!(chapter.content, "Mira pushed open the mill door.");
    assert_eq!(chapter.step, 0);

    let scenes = session.write_scenes("Mira hides the ledger", 2).await.unwrap();
    assert_eq!(scenes.labels, vec!["Mira climbs the wheel", "Mira climbs the wheel"]);
    assert!(!scenes.stopped_early);
    assert_eq!(scenes.content.as_deref(), Some("The wheel groaned under her weight."));
    assert!(scenes.durability.is_durable());

    let state = session.world_state().await;
    // chapter, two beats, scene prose
    assert_steps(&state, 4);
    assert_character_field(&state, "Mira", "location", "wheel");
    assert_character_field(&state, "Mira", "status", "alive");
    assert!(!state.characters.contains_key("Harbor Master"));
    assert_eq!(state.plot_points[1].metadata["type"], "scene");
    assert_eq!(state.plot_points[2].metadata["search_step"], 1);

    let export = session.export_log().await;
    assert!(export.starts_with("## Chapter 1: The Mill\n\nMira pushed open the mill door.\n\n"));
    assert!(export.contains("[step 1] Mira climbs the wheel\n\n"));
    assert!(export.ends_with("[step 3] The wheel groaned under her weight.\n\n"));
}

#[tokio::test]
async fn test_project_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let session = open_session(&dir).await;
        session.plan("A miller's daughter and a stolen ledger").await.unwrap();
        session.write_chapter(1).await.unwrap();
    }

    let session = open_session(&dir).await;
    let state = session.world_state().await;
    assert_steps(&state, 1);
    assert_character_field(&state, "Mira", "description", "A miller's daughter");
    assert_unresolved(&state, "The ledger's missing page");

    let related = session.query_context("mill door", 3).await;
    assert_eq!(related, vec!["Mira pushed open the mill door.".to_string()]);

    // Continuing after a reopen keeps stepping from where it left off
    let receipt = session.record_event("Night falls", Default::default()).await;
    assert_eq!(receipt.step, 1);
}

#[tokio::test]
async fn test_rewrite_records_revision() {
    let dir = TempDir::new().unwrap();
    let session = open_session(&dir).await;
    session.plan("A miller's daughter and a stolen ledger").await.unwrap();
    session.write_chapter(1).await.unwrap();

    let outcome = session.rewrite_chapter(1, "More rain").await.unwrap();
    assert_eq!(outcome.content, "Rain hammered the mill door.");
    assert_eq!(outcome.step, 1);

    let state = session.world_state().await;
    assert_steps(&state, 2);
    assert_eq!(state.plot_points[1].metadata["revision"], true);
    assert_eq!(state.plot_points[1].chapter(), Some(1));

    // Both drafts stay in the log under the same chapter header
    let export = session.export_log().await;
    assert_eq!(export.matches("## Chapter 1: The Mill").count(), 2);

    assert!(session.rewrite_chapter(2, "More rain").await.is_err());
}
