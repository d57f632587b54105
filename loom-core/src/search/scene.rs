//! Beat-level scene search.

use super::strategy::{options, score, text_field, Candidate, NodeContext, Strategy, StrategyError};
use crate::llm::Generator;
use crate::world::{EntityMap, EntityRecord, WorldState, WorldStateDelta};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

const SCENE_SYSTEM: &str = "You are a novelist drafting a scene beat by beat. \
Each beat is one concrete piece of dialogue or action.";

const CRITIC_SYSTEM: &str = "You are a line editor judging whether a scene beat earns its place.";

/// Earlier events pulled into each prompt.
const RELEVANT_EVENTS: usize = 3;

/// Recent committed beats shown for continuity.
const RECENT_BEATS: usize = 5;

/// Proposes the next dialogue or action beat.
///
/// A beat may only touch characters that already exist and may extend the
/// summary; it never introduces cast or threads.
pub struct SceneStrategy<G> {
    generator: G,
    language: String,
}

impl<G: Generator> SceneStrategy<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            language: "English".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

#[async_trait]
impl<G: Generator> Strategy for SceneStrategy<G> {
    fn name(&self) -> &'static str {
        "scene"
    }

    async fn expand(
        &self,
        ctx: &NodeContext<'_>,
        branch_factor: usize,
    ) -> Result<Vec<Candidate>, StrategyError> {
        let relevant = ctx.memory.query_relevant(ctx.label, RELEVANT_EVENTS);
        let prompt = format!(
            "Scene goal: {premise}\n\n{digest}\n\
             Story so far: {summary}\n\n\
             Recent beats:\n{recent}\n\
             Relevant past events:\n{relevant}\n\
             The latest beat: {label}\n\n\
             Target Language: {language}\n\n\
             Propose {branch_factor} distinct next beats (dialogue or action).\n\
             Only update characters listed above; do not invent new ones.\n\n\
             Return JSON:\n\
             {{\"options\": [{{\"beat\": \"One-line beat\", \
             \"summary\": \"What this adds to the story so far\", \
             \"character_updates\": \
             {{\"Name\": {{\"status\": \"...\", \"location\": \"...\"}}}}}}]}}",
            premise = ctx.premise,
            digest = ctx.state.render_digest(),
            summary = ctx.state.summary,
            recent = bullet_list(recent_beats(ctx.history)),
            relevant = bullet_list(relevant.iter().map(String::as_str)),
            label = ctx.label,
            language = self.language,
        );

        let payload = self.generator.generate_structured(&prompt, SCENE_SYSTEM).await?;
        let raw = options(&payload)?;

        let mut candidates = Vec::new();
        for (i, option) in raw.iter().enumerate() {
            let Some(beat) = text_field(option, "beat") else {
                debug!(option = i, "Skipping beat without text");
                continue;
            };
            candidates.push(Candidate::new(beat, beat_delta(ctx.state, option)));
        }

        if candidates.is_empty() && !raw.is_empty() {
            return Err(StrategyError::Malformed("no usable beats".to_string()));
        }
        Ok(candidates)
    }

    async fn simulate(&self, ctx: &NodeContext<'_>) -> Result<f64, StrategyError> {
        let prompt = format!(
            "Scene goal: {premise}\n\n\
             Recent beats:\n{recent}\n\
             Proposed beat: {label}\n\
             Story so far: {summary}\n\n\
             Score 0.0-1.0 on tension, character consistency and progress toward the scene goal.\n\
             Target Language: {language}\n\n\
             Return JSON: {{\"score\": 0.8}}",
            premise = ctx.premise,
            recent = bullet_list(recent_beats(ctx.history)),
            label = ctx.label,
            summary = ctx.state.summary,
            language = self.language,
        );

        let payload = self.generator.generate_structured(&prompt, CRITIC_SYSTEM).await?;
        score(&payload)
    }
}

/// Delta for one beat: per-field updates to existing characters plus summary extension.
fn beat_delta(state: &WorldState, option: &Value) -> WorldStateDelta {
    let mut delta = WorldStateDelta::new();

    if let Some(updates) = option.get("character_updates").and_then(Value::as_object) {
        let mut characters = EntityMap::new();
        for (name, update) in updates {
            if !state.characters.contains_key(name) {
                debug!(character = %name, "Ignoring update for unknown character");
                continue;
            }
            match serde_json::from_value::<EntityRecord>(update.clone()) {
                Ok(record) if !record.is_empty() => {
                    characters.insert(name.clone(), record);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(character = %name, error = %e, "Ignoring malformed character update")
                }
            }
        }
        delta.characters = characters;
    }

    if let Some(addition) = text_field(option, "summary") {
        let extended = if state.summary.trim().is_empty() {
            addition.to_string()
        } else {
            format!("{}\n{addition}", state.summary.trim_end())
        };
        delta.summary = Some(extended);
    }

    delta
}

fn recent_beats(history: &[String]) -> impl Iterator<Item = &str> {
    let start = history.len().saturating_sub(RECENT_BEATS);
    history[start..].iter().map(String::as_str)
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    let lines: Vec<String> = items.map(|item| format!("- {item}\n")).collect();
    if lines.is_empty() {
        "- (none)\n".to_string()
    } else {
        lines.concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::testing::ScriptedGenerator;
    use serde_json::json;

    fn state_with_mira() -> WorldState {
        let mut state = WorldState::new();
        state.apply(
            &WorldStateDelta::new()
                .character(
                    "Mira",
                    EntityRecord::default().with_status("alive").with_location("mill"),
                )
                .with_summary("Mira reached the mill."),
        );
        state
    }

    #[test]
    fn test_beat_delta_only_touches_existing_characters() {
        let state = state_with_mira();
        let option = json!({
            "beat": "Mira climbs the wheel",
            "summary": "She finds the ledger.",
            "character_updates": {
                "Mira": { "location": "wheel" },
                "Stranger": { "status": "lurking" }
            }
        });

        let delta = beat_delta(&state, &option);
        assert_eq!(delta.characters.len(), 1);
        assert_eq!(delta.characters["Mira"].location.as_deref(), Some("wheel"));
        assert_eq!(
            delta.summary.as_deref(),
            Some("Mira reached the mill.\nShe finds the ledger.")
        );
        assert!(delta.foreshadowing.is_empty());

        let mut next = state.clone();
        next.apply(&delta);
        assert_eq!(next.characters["Mira"].status.as_deref(), Some("alive"));
        assert!(!next.characters.contains_key("Stranger"));
    }

    #[tokio::test]
    async fn test_expand_uses_history_and_memory() {
        let state = state_with_mira();
        let mut memory = MemoryStore::in_memory("t");
        let _ = memory.record_event("The mill wheel stopped at midnight", Default::default()).await;

        let generator = ScriptedGenerator::new().with_json(json!({
            "options": [
                { "beat": "Mira listens at the door" },
                { "summary": "no beat text" },
                { "beat": "Mira pries open the wheel housing" }
            ]
        }));
        let strategy = SceneStrategy::new(generator);
        let history = vec!["Mira enters the mill".to_string()];
        let ctx = NodeContext {
            premise: "Mira searches the mill",
            label: "Mira enters the mill wheel room",
            state: &state,
            depth: 0,
            history: &history,
            memory: &memory,
        };

        let candidates = strategy.expand(&ctx, 2).await.unwrap();
        let labels: Vec<&str> = candidates.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Mira listens at the door", "Mira pries open the wheel housing"]);

        let prompt = &strategy.generator.prompts()[0];
        assert!(prompt.contains("- Mira enters the mill\n"));
        assert!(prompt.contains("The mill wheel stopped at midnight"));
        assert!(prompt.contains("Propose 2 distinct"));
    }

    #[test]
    fn test_recent_beats_window() {
        let history: Vec<String> = (0..8).map(|i| format!("beat {i}")).collect();
        let recent: Vec<&str> = recent_beats(&history).collect();
        assert_eq!(recent.first(), Some(&"beat 3"));
        assert_eq!(recent.len(), RECENT_BEATS);
    }
}
