//! StorySession - the primary public API for story generation.
//!
//! This module wraps the search engine, the writer, research and one
//! project's memory into a single interface. Every operation the command
//! line (or any request layer) needs goes through here.

use crate::config::StoryConfig;
use crate::llm::{ClaudeGenerator, Generator, LlmError, ResilientGenerator};
use crate::memory::{
    Durability, EventReceipt, MemoryError, MemoryRegistry, MemoryStore, MergeReceipt, SharedMemory,
};
use crate::research::{ResearchError, Researcher, ScrapingDogResearcher};
use crate::search::{
    CancellationFlag, PlannerStrategy, SceneStrategy, SearchEngine, SearchError, SearchReport,
};
use crate::world::{WorldState, WorldStateDelta};
use crate::writer::{LinearWriter, WriterError};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from StorySession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Generator error: {0}")]
    Llm(#[from] LlmError),

    #[error("No plan yet - run `plan` first")]
    MissingPlan,

    #[error("Chapter {number} is out of range (the plan has {available} chapters)")]
    ChapterOutOfRange { number: usize, available: usize },

    #[error("Chapter {0} has not been written yet")]
    ChapterNotWritten(usize),

    #[error("Feedback must not be empty")]
    EmptyFeedback,
}

/// Result of planning.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Title of the chosen plan, or `None` if the plan was left unchanged.
    pub label: Option<String>,
    pub state: WorldState,
    pub report: SearchReport,
    pub durability: Durability,
}

/// Result of refining the plan.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub state: WorldState,
    /// False when refinement failed and the plan was kept as it was.
    pub changed: bool,
    pub durability: Durability,
}

/// Result of a sequential scene search.
#[derive(Debug, Clone)]
pub struct SceneOutcome {
    pub labels: Vec<String>,
    /// Prose for the committed beats, if it could be written.
    pub content: Option<String>,
    pub stopped_early: bool,
    pub report: SearchReport,
    pub durability: Durability,
}

/// Result of writing a chapter.
#[derive(Debug, Clone)]
pub struct ChapterOutcome {
    pub number: usize,
    pub content: String,
    pub step: u64,
    pub durability: Durability,
}

/// A story project session.
///
/// This is the main entry point for story work. It manages:
/// - The project's memory store (shared, one writer at a time)
/// - The generation collaborator and its retry policy
/// - Optional web research
pub struct StorySession {
    config: StoryConfig,
    generator: Arc<dyn Generator>,
    researcher: Option<Arc<dyn Researcher>>,
    memory: SharedMemory,
    cancel: CancellationFlag,
}

impl StorySession {
    /// Open (or create) a project under the configured data directory.
    ///
    /// Sessions opened in the same process share one store per project.
    /// Requires `ANTHROPIC_API_KEY`. Research is enabled when a ScrapingDog
    /// key is configured.
    pub async fn open(config: StoryConfig, project_id: &str) -> Result<Self, SessionError> {
        let registry = MemoryRegistry::shared(config.data_dir.clone());
        Self::open_in(registry, config, project_id).await
    }

    /// Like [`open`](Self::open), with the project taken from `registry`.
    pub async fn open_in(
        registry: Arc<MemoryRegistry>,
        config: StoryConfig,
        project_id: &str,
    ) -> Result<Self, SessionError> {
        let mut claude = ClaudeGenerator::from_env()?;
        if let Some(model) = &config.model {
            claude = claude.with_model(model.as_str());
        }
        let generator: Arc<dyn Generator> =
            Arc::new(ResilientGenerator::new(claude, config.call_policy()));

        Self::attach(&registry, config, generator, project_id).await
    }

    /// Open (or create) `project_id` in `registry` and drive it with `generator`.
    pub async fn attach(
        registry: &MemoryRegistry,
        config: StoryConfig,
        generator: Arc<dyn Generator>,
        project_id: &str,
    ) -> Result<Self, SessionError> {
        let memory = registry.open_or_create(project_id).await?;

        let researcher = config
            .scrapingdog_api_key
            .as_deref()
            .map(|key| Arc::new(ScrapingDogResearcher::new(key)) as Arc<dyn Researcher>);

        info!(project = project_id, "Opened story session");
        Ok(Self {
            config,
            generator,
            researcher,
            memory,
            cancel: CancellationFlag::new(),
        })
    }

    /// Build a session from explicit parts.
    pub fn new(config: StoryConfig, generator: Arc<dyn Generator>, memory: SharedMemory) -> Self {
        Self {
            config,
            generator,
            researcher: None,
            memory,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_researcher(mut self, researcher: Arc<dyn Researcher>) -> Self {
        self.researcher = Some(researcher);
        self
    }

    pub fn config(&self) -> &StoryConfig {
        &self.config
    }

    /// Shared handle to the project's memory.
    pub fn memory(&self) -> SharedMemory {
        Arc::clone(&self.memory)
    }

    /// Flag that stops any running search before its next rollout.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub async fn world_state(&self) -> WorldState {
        self.memory.lock().await.world_state().clone()
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Search for the best story plan for `premise` and commit it.
    pub async fn plan(&self, premise: &str) -> Result<PlanOutcome, SessionError> {
        let planner = PlannerStrategy::new(Arc::clone(&self.generator))
            .with_language(self.config.language.as_str())
            .with_genre(self.config.genre.as_str());
        let mut engine = SearchEngine::new(planner, self.config.search())
            .with_cancellation(self.cancel.clone());

        let mut memory = self.memory.lock().await;
        let root = memory.world_state().clone();
        let decision = engine.run_single(premise, root, &memory).await?;

        let durability = match &decision.delta {
            Some(delta) => memory.merge_world_state(delta).await.durability,
            None => {
                warn!("Planning produced no plan; memory unchanged");
                Durability::Durable
            }
        };

        Ok(PlanOutcome {
            label: decision.label,
            state: memory.world_state().clone(),
            report: decision.report,
            durability,
        })
    }

    /// Rewrite the current plan to address `feedback`.
    ///
    /// A failed rewrite keeps the plan as it was.
    pub async fn refine(&self, feedback: &str) -> Result<RefineOutcome, SessionError> {
        if feedback.trim().is_empty() {
            return Err(SessionError::EmptyFeedback);
        }

        let mut memory = self.memory.lock().await;
        let current = memory.world_state().clone();
        if !current.has_plan() {
            return Err(SessionError::MissingPlan);
        }

        let planner = PlannerStrategy::new(Arc::clone(&self.generator))
            .with_language(self.config.language.as_str())
            .with_genre(self.config.genre.as_str());
        let refined = planner.refine(&current, feedback).await;

        if refined == current {
            return Ok(RefineOutcome {
                state: current,
                changed: false,
                durability: Durability::Durable,
            });
        }

        let durability = memory.replace_world_state(refined).await;
        Ok(RefineOutcome {
            state: memory.world_state().clone(),
            changed: true,
            durability,
        })
    }

    /// Search `steps` scene beats one at a time, committing each, then write them as prose.
    pub async fn write_scenes(
        &self,
        instruction: &str,
        steps: usize,
    ) -> Result<SceneOutcome, SessionError> {
        let scene = SceneStrategy::new(Arc::clone(&self.generator))
            .with_language(self.config.language.as_str());
        let mut engine = SearchEngine::new(scene, self.config.search())
            .with_cancellation(self.cancel.clone());

        let mut memory = self.memory.lock().await;
        let outcome = engine.run_sequential(instruction, steps, &mut memory).await?;
        let mut durability = outcome.durability;

        let content = if outcome.labels.is_empty() {
            None
        } else {
            let writer = LinearWriter::new(Arc::clone(&self.generator));
            match writer
                .write_sequence(&outcome.labels, &memory, &self.config.genre)
                .await
            {
                Ok(text) => {
                    let receipt = memory.record_event(&text, event_type("chapter_content")).await;
                    durability = durability.and(receipt.durability);
                    Some(text)
                }
                Err(e) => {
                    warn!(error = %e, "Beats committed but prose could not be written");
                    None
                }
            }
        };

        Ok(SceneOutcome {
            labels: outcome.labels,
            content,
            stopped_early: outcome.stopped_early,
            report: outcome.report,
            durability,
        })
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Write planned chapter `number` (1-based) and record it.
    pub async fn write_chapter(&self, number: usize) -> Result<ChapterOutcome, SessionError> {
        let mut memory = self.memory.lock().await;
        let chapter = chapter_outline(&memory, number)?;

        let writer = LinearWriter::new(Arc::clone(&self.generator));
        let content = writer
            .write_chapter(&chapter, &memory, &self.config.language)
            .await?;

        let mut metadata = event_type("chapter_content");
        metadata.insert("chapter".to_string(), Value::from(number));
        metadata.insert("title".to_string(), Value::from(chapter.title.as_str()));
        let receipt = memory.record_event(&content, metadata).await;

        info!(chapter = number, step = receipt.step, "Chapter written");
        Ok(ChapterOutcome {
            number,
            content,
            step: receipt.step,
            durability: receipt.durability,
        })
    }

    /// Rewrite the latest draft of chapter `number` and record the revision.
    pub async fn rewrite_chapter(
        &self,
        number: usize,
        feedback: &str,
    ) -> Result<ChapterOutcome, SessionError> {
        if feedback.trim().is_empty() {
            return Err(SessionError::EmptyFeedback);
        }

        let mut memory = self.memory.lock().await;
        let chapter = chapter_outline(&memory, number)?;
        let draft = memory
            .plot_points()
            .iter()
            .rev()
            .find(|p| p.chapter() == u64::try_from(number).ok())
            .map(|p| p.text.clone())
            .ok_or(SessionError::ChapterNotWritten(number))?;

        let writer = LinearWriter::new(Arc::clone(&self.generator));
        let content = writer
            .rewrite_chapter(&draft, feedback, &memory, &self.config.language)
            .await?;

        let mut metadata = event_type("chapter_content");
        metadata.insert("chapter".to_string(), Value::from(number));
        metadata.insert("title".to_string(), Value::from(chapter.title.as_str()));
        metadata.insert("revision".to_string(), Value::from(true));
        let receipt = memory.record_event(&content, metadata).await;

        Ok(ChapterOutcome {
            number,
            content,
            step: receipt.step,
            durability: receipt.durability,
        })
    }

    // =========================================================================
    // Research
    // =========================================================================

    /// Look `query` up and record the findings as an event.
    pub async fn research(&self, query: &str) -> Result<String, SessionError> {
        let researcher = self
            .researcher
            .as_ref()
            .ok_or(SessionError::Research(ResearchError::NotConfigured))?;
        let summary = researcher.fetch_summary(query).await?;

        let mut memory = self.memory.lock().await;
        let receipt = memory
            .record_event(&format!("Research Findings: {summary}"), event_type("research"))
            .await;
        if !receipt.durability.is_durable() {
            warn!(query, "Research findings kept in memory only");
        }
        Ok(summary)
    }

    // =========================================================================
    // Memory
    // =========================================================================

    pub async fn record_event(&self, text: &str, metadata: Map<String, Value>) -> EventReceipt {
        self.memory.lock().await.record_event(text, metadata).await
    }

    pub async fn merge_state(&self, delta: &WorldStateDelta) -> MergeReceipt {
        self.memory.lock().await.merge_world_state(delta).await
    }

    pub async fn query_context(&self, query: &str, k: usize) -> Vec<String> {
        self.memory.lock().await.query_relevant(query, k)
    }

    pub async fn digest(&self) -> String {
        self.memory.lock().await.render_context_digest()
    }

    pub async fn export_log(&self) -> String {
        self.memory.lock().await.export_log()
    }

    pub async fn reset(&self) -> Durability {
        self.memory.lock().await.reset().await
    }
}

fn event_type(kind: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("type".to_string(), Value::from(kind));
    metadata
}

fn chapter_outline(
    memory: &MemoryStore,
    number: usize,
) -> Result<crate::world::ChapterOutline, SessionError> {
    let chapters = &memory.world_state().chapters;
    if chapters.is_empty() && !memory.world_state().has_plan() {
        return Err(SessionError::MissingPlan);
    }
    number
        .checked_sub(1)
        .and_then(|idx| chapters.get(idx))
        .cloned()
        .ok_or(SessionError::ChapterOutOfRange {
            number,
            available: chapters.len(),
        })
}
