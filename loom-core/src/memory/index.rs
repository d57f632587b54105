//! Similarity index over narrative event text.

use crate::persist::{write_json_atomic, PersistError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Unique identifier for an indexed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability contract for the event index.
///
/// Inserts and queries are in-memory; `flush` makes the current contents
/// durable. Backends that talk to a remote vector store can flush on every
/// call and treat the in-memory side as a cache.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// Add a text with its tags and return its id.
    fn index(&mut self, text: &str, tags: Map<String, Value>) -> EventId;

    /// Up to `k` stored texts, closest to `text` first.
    fn query_by_similarity(&self, text: &str, k: usize) -> Vec<String>;

    /// Drop every entry.
    fn clear(&mut self);

    /// Number of indexed entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current contents to durable storage.
    async fn flush(&self) -> Result<(), PersistError>;
}

/// A stored event with its tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub id: EventId,
    pub text: String,
    #[serde(default)]
    pub tags: Map<String, Value>,
    #[serde(skip)]
    vector: TermVector,
}

/// Term-frequency cosine index persisted as a JSON file.
///
/// Approximate by nature: it ranks by shared vocabulary, not meaning, which
/// is enough to surface earlier events about the same characters and places.
#[derive(Debug, Default)]
pub struct TermIndex {
    path: Option<PathBuf>,
    events: Vec<IndexedEvent>,
}

impl TermIndex {
    /// An index that lives only in memory; `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) the index stored at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        let mut events: Vec<IndexedEvent> = if fs::try_exists(&path).await? {
            serde_json::from_str(&fs::read_to_string(&path).await?)?
        } else {
            Vec::new()
        };

        for event in &mut events {
            event.vector = TermVector::from_text(&event.text);
        }

        Ok(Self {
            path: Some(path),
            events,
        })
    }

    pub fn events(&self) -> &[IndexedEvent] {
        &self.events
    }
}

#[async_trait]
impl SemanticIndex for TermIndex {
    fn index(&mut self, text: &str, tags: Map<String, Value>) -> EventId {
        let id = EventId::new();
        self.events.push(IndexedEvent {
            id,
            text: text.to_string(),
            tags,
            vector: TermVector::from_text(text),
        });
        id
    }

    fn query_by_similarity(&self, text: &str, k: usize) -> Vec<String> {
        let query = TermVector::from_text(text);
        if k == 0 || query.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (i, query.cosine(&e.vector)))
            .filter(|(_, score)| *score > 0.0)
            .collect();

        // Highest score first; among equals the newer event wins.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(b.0.cmp(&a.0))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(i, _)| self.events[i].text.clone())
            .collect()
    }

    fn clear(&mut self) {
        self.events.clear();
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    async fn flush(&self) -> Result<(), PersistError> {
        match &self.path {
            Some(path) => write_json_atomic(path, &self.events).await,
            None => Ok(()),
        }
    }
}

/// Sparse term-frequency vector with a cached norm.
#[derive(Debug, Clone, Default)]
struct TermVector {
    weights: HashMap<String, f32>,
    norm: f32,
}

impl TermVector {
    fn from_text(text: &str) -> Self {
        let mut weights: HashMap<String, f32> = HashMap::new();
        for token in tokenize(text) {
            *weights.entry(token).or_default() += 1.0;
        }
        let norm = weights.values().map(|w| w * w).sum::<f32>().sqrt();
        Self { weights, norm }
    }

    fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    fn cosine(&self, other: &TermVector) -> f32 {
        if self.norm == 0.0 || other.norm == 0.0 {
            return 0.0;
        }
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (self, other)
        } else {
            (other, self)
        };
        let dot: f32 = small
            .weights
            .iter()
            .filter_map(|(term, w)| large.weights.get(term).map(|o| w * o))
            .sum();
        dot / (self.norm * other.norm)
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "in", "into", "is", "it", "its", "of", "on", "or", "she", "that", "the",
    "their", "they", "this", "to", "was", "were", "with",
];

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_query_ranks_by_overlap() {
        let mut index = TermIndex::in_memory();
        index.index("Mira crosses the frozen river at dawn", Map::new());
        index.index("The baker sells bread in the market", Map::new());
        index.index("Mira hides the river map under the floorboards", Map::new());

        let results = index.query_by_similarity("Where is Mira's river map?", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], "Mira hides the river map under the floorboards");
        assert!(!results.iter().any(|r| r.contains("baker")));
    }

    #[test]
    fn test_query_without_overlap_is_empty() {
        let mut index = TermIndex::in_memory();
        index.index("Storm over the harbor", Map::new());
        assert!(index.query_by_similarity("quiet library", 5).is_empty());
        assert!(index.query_by_similarity("the of and", 5).is_empty());
        assert!(index.query_by_similarity("harbor", 0).is_empty());
    }

    #[test]
    fn test_equal_scores_prefer_newer() {
        let mut index = TermIndex::in_memory();
        index.index("lantern", Map::new());
        index.index("lantern", Map::new());
        let mut tags = Map::new();
        tags.insert("step".into(), 2.into());
        index.index("Lantern", tags);

        let results = index.query_by_similarity("lantern", 1);
        assert_eq!(results, vec!["Lantern".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_and_reopen() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("event_index.json");

        let mut index = TermIndex::open(&path).await.expect("Open should succeed");
        let mut tags = Map::new();
        tags.insert("step".into(), 0.into());
        index.index("The lighthouse keeper vanished", tags);
        index.flush().await.expect("Flush should succeed");

        let reopened = TermIndex::open(&path).await.expect("Reopen should succeed");
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.events()[0].tags["step"], 0);
        assert_eq!(
            reopened.query_by_similarity("lighthouse", 3),
            vec!["The lighthouse keeper vanished".to_string()]
        );
    }

    #[test]
    fn test_clear() {
        let mut index = TermIndex::in_memory();
        index.index("anything", Map::new());
        index.clear();
        assert!(index.is_empty());
    }
}
