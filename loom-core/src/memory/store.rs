//! Per-project memory store.

use super::index::{EventId, SemanticIndex, TermIndex};
use super::{validate_project_id, Durability, MemoryError};
use crate::persist::{load_snapshot, save_snapshot};
use crate::world::{MergeOutcome, PlotPoint, Resolution, WorldState, WorldStateDelta};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WORLD_STATE_FILE: &str = "world_state.json";
const EVENT_INDEX_FILE: &str = "event_index.json";

/// Result of recording an event.
#[derive(Debug, Clone)]
pub struct EventReceipt {
    /// Step the event was stamped with.
    pub step: u64,
    pub event_id: EventId,
    pub durability: Durability,
}

/// Result of merging a delta.
#[derive(Debug, Clone)]
pub struct MergeReceipt {
    pub outcome: MergeOutcome,
    pub durability: Durability,
}

/// Single source of truth for one project's world state and event history.
///
/// Every mutation writes the full snapshot before returning. The event
/// index is flushed on each recorded event. Once closed by its registry the
/// store stops writing, so a stale handle cannot clobber a newer store for
/// the same project.
pub struct MemoryStore {
    project_id: String,
    dir: Option<PathBuf>,
    state: WorldState,
    index: Box<dyn SemanticIndex>,
    closed: bool,
}

impl MemoryStore {
    /// Open the store for `project_id` under `data_dir`, loading any saved state.
    ///
    /// A snapshot that exists but cannot be read is an error, so a later
    /// write can never silently replace history with an empty state.
    pub async fn open(data_dir: impl AsRef<Path>, project_id: &str) -> Result<Self, MemoryError> {
        validate_project_id(project_id)?;
        let dir = data_dir.as_ref().join(project_id);

        let index = TermIndex::open(dir.join(EVENT_INDEX_FILE))
            .await
            .map_err(|source| MemoryError::Corrupt {
                project: project_id.to_string(),
                source,
            })?;

        Self::open_with_index(dir, project_id, Box::new(index)).await
    }

    /// Open with a caller-supplied index backend stored alongside `dir`.
    pub async fn open_with_index(
        dir: impl AsRef<Path>,
        project_id: &str,
        index: Box<dyn SemanticIndex>,
    ) -> Result<Self, MemoryError> {
        validate_project_id(project_id)?;
        let dir = dir.as_ref().to_path_buf();

        let state = load_snapshot(dir.join(WORLD_STATE_FILE))
            .await
            .map_err(|source| MemoryError::Corrupt {
                project: project_id.to_string(),
                source,
            })?
            .unwrap_or_default();

        debug!(
            project = project_id,
            step = state.current_step,
            events = index.len(),
            "Opened memory store"
        );

        Ok(Self {
            project_id: project_id.to_string(),
            dir: Some(dir),
            state,
            index,
            closed: false,
        })
    }

    /// A store that never touches disk.
    ///
    /// With no persistence configured there is nothing to lose on restart,
    /// so its writes report [`Durability::Durable`]. Use
    /// [`is_persistent`](Self::is_persistent) to tell the two kinds apart.
    pub fn in_memory(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dir: None,
            state: WorldState::new(),
            index: Box::new(TermIndex::in_memory()),
            closed: false,
        }
    }

    /// Whether mutations are written to disk.
    pub fn is_persistent(&self) -> bool {
        self.dir.is_some() && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop writing. Later mutations only change this handle's in-memory copy.
    pub(crate) fn mark_closed(&mut self) {
        if !self.closed {
            debug!(project = %self.project_id, "Closed memory store");
        }
        self.closed = true;
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn world_state(&self) -> &WorldState {
        &self.state
    }

    pub fn current_step(&self) -> u64 {
        self.state.current_step
    }

    pub fn plot_points(&self) -> &[PlotPoint] {
        &self.state.plot_points
    }

    /// Append an event to the log, stamping the current step, and index its text.
    pub async fn record_event(&mut self, text: &str, metadata: Map<String, Value>) -> EventReceipt {
        let point = self.state.push_event(text, metadata);
        let step = point.step;
        let tags = point.metadata.clone();

        let event_id = self.index.index(text, tags);
        let durability = self.persist_state().await.and(self.persist_index().await);

        debug!(project = %self.project_id, step, %event_id, "Recorded event");
        EventReceipt {
            step,
            event_id,
            durability,
        }
    }

    /// Field-level merge of `delta` into the world state.
    pub async fn merge_world_state(&mut self, delta: &WorldStateDelta) -> MergeReceipt {
        let outcome = self.state.apply(delta);
        for description in &outcome.unknown_resolutions {
            warn!(
                project = %self.project_id,
                description = %description,
                "Ignoring resolution of unknown foreshadowing"
            );
        }

        let durability = self.persist_state().await;
        MergeReceipt {
            outcome,
            durability,
        }
    }

    /// Replace every planned field wholesale, keeping the event log and step counter.
    pub async fn replace_world_state(&mut self, state: WorldState) -> Durability {
        let plot_points = std::mem::take(&mut self.state.plot_points);
        let current_step = self.state.current_step;
        self.state = WorldState {
            plot_points,
            current_step,
            ..state
        };
        self.persist_state().await
    }

    /// Resolve one foreshadowing item by description.
    ///
    /// Unlike a merged delta, a direct resolution must name an existing item.
    pub async fn resolve_foreshadowing(
        &mut self,
        description: &str,
    ) -> Result<Durability, MemoryError> {
        match self.state.resolve_foreshadowing(description) {
            Resolution::Unknown => Err(MemoryError::UnknownForeshadowing(description.to_string())),
            Resolution::AlreadyResolved => Ok(Durability::Durable),
            Resolution::Resolved => Ok(self.persist_state().await),
        }
    }

    /// Up to `k` earlier event texts closest to `query`.
    pub fn query_relevant(&self, query: &str, k: usize) -> Vec<String> {
        self.index.query_by_similarity(query, k)
    }

    pub fn render_context_digest(&self) -> String {
        self.state.render_digest()
    }

    /// Return to the zero state: no entities, no events, empty index.
    pub async fn reset(&mut self) -> Durability {
        self.state = WorldState::new();
        self.index.clear();
        debug!(project = %self.project_id, "Reset memory store");
        self.persist_state().await.and(self.persist_index().await)
    }

    /// The full event log as text, chapter events under chapter headers.
    pub fn export_log(&self) -> String {
        let mut out = String::new();
        for point in &self.state.plot_points {
            match point.chapter() {
                Some(number) => {
                    let title = point
                        .metadata
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| {
                            let idx = usize::try_from(number).ok()?.checked_sub(1)?;
                            self.state.chapters.get(idx).map(|c| c.title.clone())
                        })
                        .unwrap_or_default();
                    out.push_str(&format!("## Chapter {number}: {title}\n\n{}\n\n", point.text));
                }
                None => out.push_str(&format!("[step {}] {}\n\n", point.step, point.text)),
            }
        }
        out
    }

    fn closed_write(&self) -> Durability {
        warn!(project = %self.project_id, "Write to a closed project was not persisted");
        Durability::Volatile {
            reason: "project closed".to_string(),
        }
    }

    async fn persist_state(&self) -> Durability {
        if self.closed {
            return self.closed_write();
        }
        let Some(dir) = &self.dir else {
            return Durability::Durable;
        };
        let path = dir.join(WORLD_STATE_FILE);
        match save_snapshot(&path, &self.project_id, &self.state).await {
            Ok(()) => Durability::Durable,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "World state not persisted");
                Durability::Volatile {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn persist_index(&self) -> Durability {
        if self.closed {
            return self.closed_write();
        }
        match self.index.flush().await {
            Ok(()) => Durability::Durable,
            Err(e) => {
                warn!(project = %self.project_id, error = %e, "Event index not persisted");
                Durability::Volatile {
                    reason: e.to_string(),
                }
            }
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("project_id", &self.project_id)
            .field("dir", &self.dir)
            .field("current_step", &self.state.current_step)
            .field("indexed_events", &self.index.len())
            .field("closed", &self.closed)
            .finish()
    }
}
