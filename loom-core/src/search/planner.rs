//! Story-arc planning: outline, cast, locations, open threads and chapter list.

use super::strategy::{options, score, text_field, Candidate, NodeContext, Strategy, StrategyError};
use crate::llm::Generator;
use crate::world::{ChapterOutline, EntityMap, WorldState, WorldStateDelta};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

const PLANNER_SYSTEM: &str = "You are a master novelist planning a best-selling book. \
You think in story arcs: premise, cast, setting, open mysteries and chapter structure.";

const CRITIC_SYSTEM: &str =
    "You are a demanding acquisitions editor. You score story plans honestly.";

/// Expands a premise into whole story plans and scores them as a book editor would.
pub struct PlannerStrategy<G> {
    generator: G,
    language: String,
    genre: Option<String>,
}

impl<G: Generator> PlannerStrategy<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            language: "English".to_string(),
            genre: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    /// Rewrite a whole plan to address `feedback`.
    ///
    /// Any failure returns `current` unchanged.
    pub async fn refine(&self, current: &WorldState, feedback: &str) -> WorldState {
        match self.try_refine(current, feedback).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Refinement failed, keeping current plan");
                current.clone()
            }
        }
    }

    /// Rewrite a whole plan, reporting failure instead of falling back.
    ///
    /// The event log and step counter are carried over untouched; everything
    /// the planner owns is replaced by the rewritten plan.
    pub async fn try_refine(
        &self,
        current: &WorldState,
        feedback: &str,
    ) -> Result<WorldState, StrategyError> {
        let prompt = format!(
            "Refine this story plan based on editor feedback.\n\n\
             Current Plan:\n{plan}\n\n\
             Feedback: {feedback}\n\
             Target Language: {language}\n\n\
             Modify the plan to address the feedback. Keep everything else consistent.\n\n\
             Return JSON with the same shape as a single plan:\n{shape}",
            plan = describe_plan(current),
            language = self.language,
            shape = PLAN_SHAPE,
        );

        let payload = self.generator.generate_structured(&prompt, PLANNER_SYSTEM).await?;
        let (_, delta) = plan_from_value(&payload)?;

        let mut refined = WorldState {
            plot_points: current.plot_points.clone(),
            current_step: current.current_step,
            ..WorldState::default()
        };
        refined.apply(&delta);

        // Threads the rewrite kept keep their identity and resolution status.
        for item in &mut refined.foreshadowing {
            if let Some(previous) = current.find_foreshadowing(&item.description) {
                *item = previous.clone();
            }
        }
        Ok(refined)
    }

    fn genre_line(&self) -> String {
        self.genre
            .as_deref()
            .map(|g| format!("Genre: {g}\n"))
            .unwrap_or_default()
    }
}

#[async_trait]
impl<G: Generator> Strategy for PlannerStrategy<G> {
    fn name(&self) -> &'static str {
        "planner"
    }

    async fn expand(
        &self,
        ctx: &NodeContext<'_>,
        branch_factor: usize,
    ) -> Result<Vec<Candidate>, StrategyError> {
        let basis = if ctx.depth == 0 && !ctx.state.has_plan() {
            format!("Premise: {}", ctx.premise)
        } else {
            format!(
                "Premise: {}\n\n\
                Build on this plan, keeping what works and sharpening what doesn't:\n{}",
                ctx.premise,
                describe_plan(ctx.state)
            )
        };

        let known = ctx.memory.render_context_digest();
        let prompt = format!(
            "{basis}\n\n{known}\n{genre}Target Language: {language}\n\n\
             Generate {branch_factor} distinct, comprehensive story plans.\n\
             Each plan must include:\n\
             1. A short title for the plan.\n\
             2. Story outline (the main plot arc).\n\
             3. World setting (characters, locations, notable items, rules).\n\
             4. Foreshadowing: mysteries planted early and paid off later.\n\
             5. Chapter list (titles and brief summaries).\n\n\
             Return JSON: {{\"options\": [<plan>, ...]}} where each plan is:\n{shape}",
            genre = self.genre_line(),
            language = self.language,
            shape = PLAN_SHAPE,
        );

        let payload = self.generator.generate_structured(&prompt, PLANNER_SYSTEM).await?;
        let raw = options(&payload)?;

        let mut candidates = Vec::new();
        for (i, option) in raw.iter().enumerate() {
            match plan_from_value(option) {
                Ok((title, delta)) => {
                    let label = title.unwrap_or_else(|| format!("Plan option {}", i + 1));
                    candidates.push(Candidate::new(label, delta));
                }
                Err(e) => debug!(option = i, error = %e, "Skipping unusable plan option"),
            }
        }

        if candidates.is_empty() && !raw.is_empty() {
            return Err(StrategyError::Malformed("no usable plan options".to_string()));
        }
        Ok(candidates)
    }

    async fn simulate(&self, ctx: &NodeContext<'_>) -> Result<f64, StrategyError> {
        let characters = serde_json::to_string(&ctx.state.characters)
            .map_err(|e| StrategyError::Malformed(e.to_string()))?;
        let prompt = format!(
            "Critique this story plan for a bestseller.\n\
             Target Language: {language}\n\n\
             Outline: {outline}\n\
             Characters: {characters}\n\
             Chapters planned: {chapters}\n\n\
             Score 0.0-1.0 on:\n\
             1. Marketability\n\
             2. Character depth\n\
             3. Plot logic\n\n\
             Return JSON: {{\"score\": 0.8}}",
            language = self.language,
            outline = ctx.state.summary,
            chapters = ctx.state.chapters.len(),
        );

        let payload = self.generator.generate_structured(&prompt, CRITIC_SYSTEM).await?;
        score(&payload)
    }
}

const PLAN_SHAPE: &str = r#"{
  "title": "Short name for this plan",
  "outline": "Detailed outline...",
  "world_setting": {
    "characters": { "Name": { "description": "...", "role": "...", "traits": ["..."] } },
    "locations": { "Name": { "description": "..." } },
    "items": { "Name": { "description": "..." } },
    "rules": "World rules..."
  },
  "foreshadowing": ["A mystery planted early..."],
  "chapter_list": [
    { "title": "Chapter 1", "summary": "..." }
  ]
}"#;

/// Turn one plan object into an optional title and the delta it describes.
fn plan_from_value(plan: &Value) -> Result<(Option<String>, WorldStateDelta), StrategyError> {
    if !plan.is_object() {
        return Err(StrategyError::Malformed("plan is not an object".to_string()));
    }

    let setting = plan.get("world_setting").unwrap_or(&Value::Null);
    let mut delta = WorldStateDelta {
        characters: entities(setting, "characters")?,
        locations: entities(setting, "locations")?,
        items: entities(setting, "items")?,
        ..WorldStateDelta::default()
    };

    let outline = text_field(plan, "outline").unwrap_or_default();
    let summary = match text_field(setting, "rules") {
        Some(rules) if !outline.is_empty() => format!("{outline}\n\nWorld Rules: {rules}"),
        Some(rules) => format!("World Rules: {rules}"),
        None => outline.to_string(),
    };
    if !summary.is_empty() {
        delta.summary = Some(summary);
    }

    if let Some(items) = plan.get("foreshadowing").and_then(Value::as_array) {
        delta.foreshadowing = items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    if let Some(list) = plan.get("chapter_list") {
        let chapters: Vec<ChapterOutline> = serde_json::from_value(list.clone())
            .map_err(|e| StrategyError::Malformed(format!("chapter_list: {e}")))?;
        delta.chapters = Some(chapters);
    }

    if delta.is_empty() {
        return Err(StrategyError::Malformed("plan has no content".to_string()));
    }

    let title = text_field(plan, "title").map(str::to_string);
    Ok((title, delta))
}

fn entities(setting: &Value, key: &str) -> Result<EntityMap, StrategyError> {
    match setting.get(key) {
        None | Some(Value::Null) => Ok(EntityMap::new()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| StrategyError::Malformed(format!("{key}: {e}"))),
    }
}

/// Plan fields as prompt text.
fn describe_plan(state: &WorldState) -> String {
    let world = serde_json::json!({
        "characters": state.characters,
        "locations": state.locations,
        "items": state.items,
    });
    let chapters = serde_json::to_string(&state.chapters).unwrap_or_default();
    let threads: Vec<&str> = state
        .foreshadowing
        .iter()
        .map(|f| f.description.as_str())
        .collect();

    format!(
        "Outline: {}\nWorld: {}\nForeshadowing: {}\nChapters: {}",
        state.summary,
        world,
        threads.join("; "),
        chapters
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::{FailingGenerator, ScriptedGenerator};
    use crate::world::EntityRecord;
    use serde_json::json;

    fn ctx<'a>(
        premise: &'a str,
        state: &'a WorldState,
        memory: &'a MemoryStore,
    ) -> NodeContext<'a> {
        NodeContext {
            premise,
            label: premise,
            state,
            depth: 0,
            history: &[],
            memory,
        }
    }

    fn plan_json(title: &str) -> Value {
        json!({
            "title": title,
            "outline": "A cartographer maps a city that rearranges itself.",
            "world_setting": {
                "characters": { "Mira": { "desc": "Cartographer", "role": "protagonist" } },
                "locations": { "Shifting Quarter": { "description": "Streets move at night" } },
                "rules": "Maps drawn in ink become true."
            },
            "foreshadowing": ["The map with no edges"],
            "chapter_list": [{ "title": "Ink", "summary": "Mira draws the first street." }]
        })
    }

    #[tokio::test]
    async fn test_expand_parses_plans() {
        let generator = ScriptedGenerator::new()
            .with_json(json!({
                "options": [plan_json("Living Maps"), { "outline": "Untitled arc" }]
            }));
        let planner = PlannerStrategy::new(generator).with_language("French");
        let memory = MemoryStore::in_memory("t");
        let state = WorldState::new();

        let candidates = planner.expand(&ctx("A city of maps", &state, &memory), 3).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].label, "Living Maps");
        assert_eq!(candidates[1].label, "Plan option 2");

        let delta = &candidates[0].delta;
        assert_eq!(delta.characters["Mira"].description.as_deref(), Some("Cartographer"));
        assert_eq!(delta.characters["Mira"].attributes["role"], "protagonist");
        assert_eq!(delta.foreshadowing, vec!["The map with no edges".to_string()]);
        assert!(delta
            .summary
            .as_deref()
            .unwrap()
            .ends_with("World Rules: Maps drawn in ink become true."));
        assert_eq!(delta.chapters.as_ref().unwrap()[0].title, "Ink");

        let prompt = &planner.generator.prompts()[0];
        assert!(prompt.contains("Target Language: French"));
        assert!(prompt.contains("Generate 3 distinct"));
    }

    #[tokio::test]
    async fn test_expand_rejects_missing_options() {
        let planner =
            PlannerStrategy::new(ScriptedGenerator::new().with_json(json!({ "plans": [] })));
        let memory = MemoryStore::in_memory("t");
        let state = WorldState::new();
        assert!(planner.expand(&ctx("p", &state, &memory), 2).await.is_err());
    }

    #[tokio::test]
    async fn test_simulate_reads_score() {
        let planner =
            PlannerStrategy::new(ScriptedGenerator::new().with_json(json!({ "score": 0.7 })));
        let memory = MemoryStore::in_memory("t");
        let state = WorldState::new();
        assert_eq!(planner.simulate(&ctx("p", &state, &memory)).await.unwrap(), 0.7);
    }

    #[tokio::test]
    async fn test_refine_replaces_plan_and_keeps_events() {
        let mut current = WorldState::new();
        current.apply(
            &WorldStateDelta::new()
                .character("Old Hero", EntityRecord::default().with_status("alive"))
                .foreshadow("The map with no edges")
                .with_summary("Old outline"),
        );
        current.push_event("Something already happened", Default::default());
        let original_thread = current.foreshadowing[0].clone();

        let planner =
            PlannerStrategy::new(ScriptedGenerator::new().with_json(plan_json("Rewritten")));
        let refined = planner.refine(&current, "Make Mira the hero").await;

        assert!(!refined.characters.contains_key("Old Hero"));
        assert!(refined.characters.contains_key("Mira"));
        assert_eq!(refined.current_step, 1);
        assert_eq!(refined.plot_points, current.plot_points);
        assert_eq!(refined.foreshadowing, vec![original_thread]);
        assert!(planner.generator.prompts()[0].contains("Old outline"));
    }

    #[tokio::test]
    async fn test_refine_failure_is_noop() {
        let mut current = WorldState::new();
        current.summary = "Keep me".into();

        let planner = PlannerStrategy::new(FailingGenerator);
        assert_eq!(planner.refine(&current, "anything").await, current);

        let planner = PlannerStrategy::new(ScriptedGenerator::new().with_json(json!("not a plan")));
        assert_eq!(planner.refine(&current, "anything").await, current);
    }
}
