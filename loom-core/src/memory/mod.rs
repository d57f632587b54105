//! Project memory: the canonical world state, its event log, and a
//! similarity index over event text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   MemoryRegistry                         │
//! │   project id → Arc<Mutex<MemoryStore>> (single writer)   │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ MemoryStore                                        │  │
//! │  │  WorldState ──────────► world_state.json           │  │
//! │  │  SemanticIndex ───────► event_index.json           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod index;
mod registry;
mod store;

pub use index::{EventId, IndexedEvent, SemanticIndex, TermIndex};
pub use registry::{MemoryRegistry, SharedMemory};
pub use store::{EventReceipt, MemoryStore, MergeReceipt};

use crate::persist::PersistError;
use thiserror::Error;

/// Errors from memory operations.
///
/// Write failures are not errors: they come back as [`Durability::Volatile`].
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Invalid project id '{0}': use letters, digits, '-' or '_'")]
    InvalidProjectId(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Project already exists: {0}")]
    ProjectExists(String),

    #[error("Stored memory for project '{project}' is unreadable: {source}")]
    Corrupt {
        project: String,
        #[source]
        source: PersistError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No foreshadowing item matches '{0}'")]
    UnknownForeshadowing(String),
}

/// Whether a mutation reached durable storage.
///
/// The in-memory state is authoritative either way; a volatile write only
/// means the change will not survive a restart unless a later write succeeds.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    Durable,
    Volatile { reason: String },
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Durable)
    }

    /// Keep the first failure when two writes are reported together.
    pub fn and(self, other: Durability) -> Durability {
        match self {
            Durability::Durable => other,
            volatile => volatile,
        }
    }
}

/// Project ids become directory names, so they are restricted to a safe alphabet.
pub(crate) fn validate_project_id(project_id: &str) -> Result<(), MemoryError> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 128
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(MemoryError::InvalidProjectId(project_id.to_string()))
    }
}
