//! Pluggable expansion and scoring policies.

use crate::llm::LlmError;
use crate::memory::MemoryStore;
use crate::world::{WorldState, WorldStateDelta};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure of one expansion or simulation. The engine absorbs these.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Unusable response: {0}")]
    Malformed(String),
}

/// What a strategy sees of the node it is asked about.
pub struct NodeContext<'a> {
    /// The caller's premise or instruction for this run.
    pub premise: &'a str,
    /// Label of the node being expanded or scored.
    pub label: &'a str,
    /// World state at that node.
    pub state: &'a WorldState,
    /// Distance from the root of the current tree.
    pub depth: usize,
    /// Labels already committed by earlier sequential steps.
    pub history: &'a [String],
    /// Read access to project memory.
    pub memory: &'a MemoryStore,
}

/// A proposed continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub delta: WorldStateDelta,
}

impl Candidate {
    pub fn new(label: impl Into<String>, delta: WorldStateDelta) -> Self {
        Self {
            label: label.into(),
            delta,
        }
    }
}

/// Expansion and simulation capability used by the search engine.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Propose up to `branch_factor` continuations of the node.
    async fn expand(
        &self,
        ctx: &NodeContext<'_>,
        branch_factor: usize,
    ) -> Result<Vec<Candidate>, StrategyError>;

    /// Score the node in `[0, 1]`.
    async fn simulate(&self, ctx: &NodeContext<'_>) -> Result<f64, StrategyError>;
}

/// The `options` array of an expansion response.
pub(crate) fn options(payload: &Value) -> Result<&[Value], StrategyError> {
    payload
        .get("options")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| StrategyError::Malformed("missing 'options' array".to_string()))
}

/// The `score` of a critique response. Numeric strings are accepted.
pub(crate) fn score(payload: &Value) -> Result<f64, StrategyError> {
    match payload.get("score") {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| StrategyError::Malformed(format!("score {n} is not a float"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| StrategyError::Malformed(format!("score '{s}' is not a number"))),
        Some(other) => Err(StrategyError::Malformed(format!("score has type {other}"))),
        None => Err(StrategyError::Malformed("missing 'score'".to_string())),
    }
}

/// A non-empty string field, trimmed.
pub(crate) fn text_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
