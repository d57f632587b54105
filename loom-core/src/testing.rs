//! Testing utilities for search and memory.
//!
//! This module provides tools for deterministic tests without API calls:
//! - `ScriptedGenerator` replays queued replies and answers by prompt rules
//! - `FailingGenerator` simulates a dead generation service
//! - `CannedResearcher` returns a fixed research summary
//! - `MemoryHarness` keeps a disk-backed store in a temporary directory
//! - Assertion helpers for verifying world state

use crate::llm::{parse_structured, Generator, LlmError};
use crate::memory::{MemoryError, MemoryStore};
use crate::research::{ResearchError, Researcher};
use crate::world::WorldState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Json(Value),
    Fail(String),
}

impl Reply {
    fn into_text(self) -> Result<String, LlmError> {
        match self {
            Reply::Text(text) => Ok(text),
            Reply::Json(value) => Ok(value.to_string()),
            Reply::Fail(message) => Err(LlmError::Api(claude::Error::Network(message))),
        }
    }

    fn into_json(self) -> Result<Value, LlmError> {
        match self {
            Reply::Text(text) => parse_structured(&text),
            Reply::Json(value) => Ok(value),
            Reply::Fail(message) => Err(LlmError::Api(claude::Error::Network(message))),
        }
    }
}

/// A generator that returns scripted replies.
///
/// Queued replies are used first, in order. Once the queue is empty, the
/// first rule whose pattern appears in the prompt answers. With no queue
/// and no matching rule the call fails.
#[derive(Default)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<Reply>>,
    rules: Vec<(String, Reply)>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a free-text reply.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_reply(Reply::Text(text.into()))
    }

    /// Queue a structured reply.
    pub fn with_json(self, value: Value) -> Self {
        self.with_reply(Reply::Json(value))
    }

    pub fn with_reply(self, reply: Reply) -> Self {
        self.lock_queue().push_back(reply);
        self
    }

    /// Answer every prompt containing `pattern` with `reply` once the queue is empty.
    pub fn with_rule(mut self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.rules.push((pattern.into(), reply));
        self
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Reply>> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.to_string());

        if let Some(reply) = self.lock_queue().pop_front() {
            return reply;
        }
        self.rules
            .iter()
            .find(|(pattern, _)| prompt.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Fail("no scripted reply".to_string()))
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _system: &str,
        _temperature: f32,
    ) -> Result<String, LlmError> {
        self.next_reply(prompt).into_text()
    }

    async fn generate_structured(&self, prompt: &str, _system: &str) -> Result<Value, LlmError> {
        self.next_reply(prompt).into_json()
    }
}

/// A generator whose every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _: &str, _: &str, _: f32) -> Result<String, LlmError> {
        Err(LlmError::Api(claude::Error::Network("service unreachable".to_string())))
    }

    async fn generate_structured(&self, _: &str, _: &str) -> Result<Value, LlmError> {
        Err(LlmError::Api(claude::Error::Network("service unreachable".to_string())))
    }
}

/// A researcher that always returns the same summary.
#[derive(Debug, Clone)]
pub struct CannedResearcher {
    summary: String,
}

impl CannedResearcher {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
        }
    }
}

#[async_trait]
impl Researcher for CannedResearcher {
    async fn fetch_summary(&self, _query: &str) -> Result<String, ResearchError> {
        Ok(self.summary.clone())
    }
}

/// A disk-backed memory store living in a temporary directory.
pub struct MemoryHarness {
    dir: TempDir,
    project_id: String,
    store: MemoryStore,
}

impl MemoryHarness {
    pub async fn new(project_id: &str) -> Result<Self, MemoryError> {
        let dir = TempDir::new()?;
        let store = MemoryStore::open(dir.path(), project_id).await?;
        Ok(Self {
            dir,
            project_id: project_id.to_string(),
            store,
        })
    }

    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MemoryStore {
        &mut self.store
    }

    /// Drop the handle and open the project again from disk.
    pub async fn reopen(&mut self) -> Result<&MemoryStore, MemoryError> {
        self.store = MemoryStore::open(self.dir.path(), &self.project_id).await?;
        Ok(&self.store)
    }

    pub fn state(&self) -> &WorldState {
        self.store.world_state()
    }
}

// =============================================================================
// Assertion helpers
// =============================================================================

/// Assert a character field (`description`, `status`, `location`, or an attribute) has a value.
#[track_caller]
pub fn assert_character_field(state: &WorldState, name: &str, field: &str, expected: &str) {
    let record = state
        .characters
        .get(name)
        .unwrap_or_else(|| panic!("Expected character '{name}' to exist"));

    let actual = match field {
        "description" => record.description.clone(),
        "status" => record.status.clone(),
        "location" => record.location.clone(),
        other => record
            .attributes
            .get(other)
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    assert_eq!(
        actual.as_deref(),
        Some(expected),
        "Character '{name}' field '{field}' mismatch"
    );
}

/// Assert a foreshadowing item exists and is still open.
#[track_caller]
pub fn assert_unresolved(state: &WorldState, description: &str) {
    let item = state
        .find_foreshadowing(description)
        .unwrap_or_else(|| panic!("Expected foreshadowing '{description}'"));
    assert!(item.is_unresolved(), "Expected '{description}' to be unresolved");
}

/// Assert a foreshadowing item was resolved at `step`.
#[track_caller]
pub fn assert_resolved_at(state: &WorldState, description: &str, step: u64) {
    let item = state
        .find_foreshadowing(description)
        .unwrap_or_else(|| panic!("Expected foreshadowing '{description}'"));
    assert!(!item.is_unresolved(), "Expected '{description}' to be resolved");
    assert_eq!(item.resolved_at_step, Some(step));
}

/// Assert the step counter matches the event log length.
#[track_caller]
pub fn assert_steps(state: &WorldState, expected: u64) {
    assert_eq!(state.current_step, expected, "Step counter mismatch");
    assert_eq!(
        state.plot_points.len() as u64,
        expected,
        "Event log length mismatch"
    );
}
