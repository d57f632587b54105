//! Prose generation from committed decisions.
//!
//! The writer does not search. It turns a planned chapter or a committed
//! beat sequence into full text, pulling continuity context from memory.

use crate::llm::{Generator, LlmError};
use crate::memory::MemoryStore;
use crate::world::ChapterOutline;
use thiserror::Error;
use tracing::debug;

const WRITER_SYSTEM: &str = "You are a best-selling novelist. Output only story content.";
const EDITOR_SYSTEM: &str = "You are an editor rewriting a chapter. Output only story content.";

/// Earlier events retrieved for a chapter.
const RELEVANT_EVENTS: usize = 5;

/// Errors from the writer.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Generator returned no text")]
    EmptyOutput,
}

/// Linear, non-search prose writer.
pub struct LinearWriter<G> {
    generator: G,
    temperature: f32,
}

impl<G: Generator> LinearWriter<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            temperature: 0.7,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Write a full chapter from its outline.
    pub async fn write_chapter(
        &self,
        chapter: &ChapterOutline,
        memory: &MemoryStore,
        language: &str,
    ) -> Result<String, WriterError> {
        let state = memory.world_state();
        let relevant = memory.query_relevant(
            &format!("{}: {}", chapter.title, chapter.summary),
            RELEVANT_EVENTS,
        );

        let prompt = format!(
            "Write a chapter.\n\n\
             Target Language: {language}\n\n\
             Title: {title}\n\
             Summary: {summary}\n\n\
             {digest}\n\
             Previous Context:\n{previous}\n\n\
             Relevant Past Events:\n{relevant}\n\n\
             Task:\n\
             Write the full content of this chapter.\n\
             - Focus on pacing, dialogue, and sensory details.\n\
             - Maintain character consistency with the world state.\n\
             - Ensure logical continuity with the previous context.\n\n\
             Output only the story content.",
            title = chapter.title,
            summary = chapter.summary,
            digest = memory.render_context_digest(),
            previous = state.summary,
            relevant = relevant.join("\n---\n"),
        );

        debug!(chapter = %chapter.title, relevant = relevant.len(), "Writing chapter");
        self.complete(&prompt, WRITER_SYSTEM).await
    }

    /// Rewrite an existing draft to address `feedback`.
    pub async fn rewrite_chapter(
        &self,
        content: &str,
        feedback: &str,
        memory: &MemoryStore,
        language: &str,
    ) -> Result<String, WriterError> {
        let prompt = format!(
            "Rewrite this chapter based on feedback.\n\n\
             Target Language: {language}\n\n\
             Current Draft:\n{content}\n\n\
             World Context:\n{digest}\n\
             Feedback: {feedback}\n\n\
             Task:\n\
             Rewrite the chapter to address the feedback \
             while maintaining quality and consistency.\n\
             Output only the new story content.",
            digest = memory.render_context_digest(),
        );

        self.complete(&prompt, EDITOR_SYSTEM).await
    }

    /// Expand a committed beat sequence into continuous prose.
    pub async fn write_sequence(
        &self,
        labels: &[String],
        memory: &MemoryStore,
        genre: &str,
    ) -> Result<String, WriterError> {
        let beats: String = labels
            .iter()
            .enumerate()
            .map(|(i, label)| format!("{}. {label}\n", i + 1))
            .collect();

        let prompt = format!(
            "Genre: {genre}\n\n\
             {digest}\n\
             Story so far:\n{summary}\n\n\
             Turn these beats into one continuous scene, in order:\n{beats}\n\
             Output only the story content.",
            digest = memory.render_context_digest(),
            summary = memory.world_state().summary,
        );

        self.complete(&prompt, WRITER_SYSTEM).await
    }

    async fn complete(&self, prompt: &str, system: &str) -> Result<String, WriterError> {
        let text = self
            .generator
            .generate(prompt, system, self.temperature)
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(WriterError::EmptyOutput);
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingGenerator, ScriptedGenerator};
    use crate::world::{EntityRecord, WorldStateDelta};
    use serde_json::Map;

    #[tokio::test]
    async fn test_write_chapter_includes_continuity() {
        let mut memory = MemoryStore::in_memory("w");
        let _ = memory
            .merge_world_state(
                &WorldStateDelta::new()
                    .character("Mira", EntityRecord::default().with_status("alive"))
                    .with_summary("Mira found the ledger."),
            )
            .await;
        let _ = memory.record_event("The ledger names the harbor master", Map::new()).await;

        let writer = LinearWriter::new(ScriptedGenerator::new().with_text("  Chapter text.  "));
        let chapter = ChapterOutline::new("The Harbor", "Mira confronts the harbor master");
        let text = writer.write_chapter(&chapter, &memory, "English").await.unwrap();

        assert_eq!(text, "Chapter text.");
        let prompt = &writer.generator.prompts()[0];
        assert!(prompt.contains("Title: The Harbor"));
        assert!(prompt.contains("Mira found the ledger."));
        assert!(prompt.contains("The ledger names the harbor master"));
        assert!(prompt.contains("Mira (alive)"));
    }

    #[tokio::test]
    async fn test_rewrite_passes_feedback() {
        let memory = MemoryStore::in_memory("w");
        let writer = LinearWriter::new(ScriptedGenerator::new().with_text("Better."));
        let text = writer
            .rewrite_chapter("Draft.", "More rain", &memory, "English")
            .await
            .unwrap();

        assert_eq!(text, "Better.");
        assert!(writer.generator.prompts()[0].contains("Feedback: More rain"));
    }

    #[tokio::test]
    async fn test_write_sequence_numbers_beats() {
        let memory = MemoryStore::in_memory("w");
        let writer = LinearWriter::new(ScriptedGenerator::new().with_text("Scene."));
        let labels = vec!["Door creaks".to_string(), "Lamp dies".to_string()];
        writer.write_sequence(&labels, &memory, "gothic").await.unwrap();

        let prompt = &writer.generator.prompts()[0];
        assert!(prompt.contains("1. Door creaks\n2. Lamp dies\n"));
        assert!(prompt.contains("Genre: gothic"));
    }

    #[tokio::test]
    async fn test_empty_and_failed_generation() {
        let memory = MemoryStore::in_memory("w");
        let chapter = ChapterOutline::new("t", "s");

        let writer = LinearWriter::new(ScriptedGenerator::new().with_text("   "));
        assert!(matches!(
            writer.write_chapter(&chapter, &memory, "English").await,
            Err(WriterError::EmptyOutput)
        ));

        let writer = LinearWriter::new(FailingGenerator);
        assert!(matches!(
            writer.write_chapter(&chapter, &memory, "English").await,
            Err(WriterError::Llm(_))
        ));
    }
}
