//! Narrative search engine with a persistent world-state memory.
//!
//! This crate provides:
//! - Monte Carlo tree search over story plans and scene beats
//! - A per-project world state (cast, places, items, open threads, events)
//!   with a similarity index over past events
//! - A linear prose writer fed by that memory
//! - Optional web research
//!
//! # Quick Start
//!
//! ```ignore
//! use loom_core::{StoryConfig, StorySession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoryConfig::from_env().with_iterations(5);
//!     let session = StorySession::open(config, "lighthouse").await?;
//!
//!     let plan = session.plan("A lighthouse keeper hides a drowned city").await?;
//!     println!("{}", plan.state.summary);
//!
//!     let chapter = session.write_chapter(1).await?;
//!     println!("{}", chapter.content);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod llm;
pub mod memory;
pub mod persist;
pub mod research;
pub mod search;
pub mod session;
pub mod testing;
pub mod world;
pub mod writer;

// Primary public API
pub use config::StoryConfig;
pub use llm::{ClaudeGenerator, Generator, LlmError, ResilientGenerator};
pub use memory::{Durability, MemoryError, MemoryRegistry, MemoryStore, SharedMemory};
pub use search::{
    CancellationFlag, PlannerStrategy, SceneStrategy, SearchConfig, SearchEngine, SearchError,
    SearchReport,
};
pub use session::{SessionError, StorySession};
pub use world::{ChapterOutline, EntityRecord, WorldState, WorldStateDelta};
pub use writer::LinearWriter;
