//! World state: the structured snapshot of narrative facts at one point in the story.
//!
//! The same merge rules apply whether a delta is folded into the canonical
//! state held by [`MemoryStore`](crate::memory::MemoryStore) or into a
//! search node's copy-on-branch snapshot, so they live here as pure
//! functions over [`WorldState`].

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Entity maps keep insertion order so rendered prompts are reproducible.
pub type EntityMap = IndexMap<String, EntityRecord>;

/// A character, location or item.
///
/// Every field is optional: records accumulate fields across merges, so a
/// freshly introduced entity may only know its status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    #[serde(default, alias = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        default,
        deserialize_with = "traits_from_string_or_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub traits: Option<Vec<String>>,
    /// Anything else a generator attached (role, relations, atmosphere...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl EntityRecord {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_traits<I, S>(mut self, traits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.traits = Some(traits.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Overwrite only the fields present in `patch`.
    pub fn merge(&mut self, patch: &EntityRecord) {
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(status) = &patch.status {
            self.status = Some(status.clone());
        }
        if let Some(location) = &patch.location {
            self.location = Some(location.clone());
        }
        if let Some(traits) = &patch.traits {
            self.traits = Some(traits.clone());
        }
        for (key, value) in &patch.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// True when no field carries information.
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.status.is_none()
            && self.location.is_none()
            && self.traits.is_none()
            && self.attributes.is_empty()
    }
}

/// Generators return traits either as `"brave, curious"` or `["brave", "curious"]`.
fn traits_from_string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Traits {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Traits>::deserialize(deserializer)? {
        None => None,
        Some(Traits::Many(list)) => Some(list),
        Some(Traits::One(text)) => Some(
            text.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        ),
    })
}

/// Status of a tracked narrative promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeshadowingStatus {
    Unresolved,
    Resolved,
}

/// A narrative promise, identified by its description text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Foreshadowing {
    pub id: Uuid,
    pub description: String,
    pub status: ForeshadowingStatus,
    pub created_at_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_step: Option<u64>,
}

impl Foreshadowing {
    fn new(description: impl Into<String>, step: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: ForeshadowingStatus::Unresolved,
            created_at_step: step,
            resolved_at_step: None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.status == ForeshadowingStatus::Unresolved
    }
}

/// A committed event in the permanent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    pub step: u64,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PlotPoint {
    /// The chapter number this event belongs to, if it was tagged with one.
    pub fn chapter(&self) -> Option<u64> {
        self.metadata.get("chapter").and_then(Value::as_u64)
    }
}

/// One entry of a planned chapter list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterOutline {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

impl ChapterOutline {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            summary: summary.into(),
        }
    }
}

/// The authoritative narrative snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub characters: EntityMap,
    #[serde(default)]
    pub locations: EntityMap,
    #[serde(default)]
    pub items: EntityMap,
    #[serde(default)]
    pub foreshadowing: Vec<Foreshadowing>,
    #[serde(default)]
    pub plot_points: Vec<PlotPoint>,
    #[serde(default)]
    pub current_step: u64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub chapters: Vec<ChapterOutline>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a delta into this state.
    ///
    /// Entities are merged field by field and created on demand, foreshadowing
    /// is inserted only when its description is new and resolved by exact
    /// description match, `summary` and `chapters` are replaced when present.
    /// Applying the same delta twice leaves the state unchanged the second time.
    pub fn apply(&mut self, delta: &WorldStateDelta) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        merge_entities(&mut self.characters, &delta.characters);
        merge_entities(&mut self.locations, &delta.locations);
        merge_entities(&mut self.items, &delta.items);

        for description in &delta.foreshadowing {
            if self.insert_foreshadowing(description) {
                outcome.foreshadowing_added += 1;
            }
        }

        for description in &delta.resolved_foreshadowing {
            match self.resolve_foreshadowing(description) {
                Resolution::Resolved => outcome.foreshadowing_resolved += 1,
                Resolution::AlreadyResolved => {}
                Resolution::Unknown => outcome.unknown_resolutions.push(description.clone()),
            }
        }

        if let Some(summary) = &delta.summary {
            self.summary = summary.clone();
        }
        if let Some(chapters) = &delta.chapters {
            self.chapters = chapters.clone();
        }

        outcome
    }

    /// Insert a foreshadowing item unless one with the same description exists.
    ///
    /// Returns whether a new item was added.
    pub fn insert_foreshadowing(&mut self, description: &str) -> bool {
        let description = description.trim();
        if description.is_empty() || self.find_foreshadowing(description).is_some() {
            return false;
        }
        self.foreshadowing
            .push(Foreshadowing::new(description, self.current_step));
        true
    }

    /// Resolve the item with a matching description.
    pub fn resolve_foreshadowing(&mut self, description: &str) -> Resolution {
        let step = self.current_step;
        let Some(item) = self
            .foreshadowing
            .iter_mut()
            .find(|f| f.description == description.trim())
        else {
            return Resolution::Unknown;
        };

        if !item.is_unresolved() {
            return Resolution::AlreadyResolved;
        }
        item.status = ForeshadowingStatus::Resolved;
        item.resolved_at_step = Some(step);
        Resolution::Resolved
    }

    pub fn find_foreshadowing(&self, description: &str) -> Option<&Foreshadowing> {
        self.foreshadowing
            .iter()
            .find(|f| f.description == description.trim())
    }

    pub fn unresolved_foreshadowing(&self) -> impl Iterator<Item = &Foreshadowing> {
        self.foreshadowing.iter().filter(|f| f.is_unresolved())
    }

    /// Append an event, stamping it with the current step and advancing the counter.
    ///
    /// Step assignment and the append happen in one call so the log never
    /// has a gap or a duplicate step.
    pub fn push_event(
        &mut self,
        text: impl Into<String>,
        mut metadata: Map<String, Value>,
    ) -> &PlotPoint {
        let step = self.current_step;
        metadata.insert("step".to_string(), Value::from(step));
        metadata
            .entry("type")
            .or_insert_with(|| Value::from("event"));

        self.plot_points.push(PlotPoint {
            step,
            text: text.into(),
            metadata,
        });
        self.current_step += 1;
        &self.plot_points[self.plot_points.len() - 1]
    }

    /// Whether the planner has produced anything worth refining.
    pub fn has_plan(&self) -> bool {
        !self.summary.trim().is_empty() || !self.chapters.is_empty() || !self.characters.is_empty()
    }

    /// Compact textual projection of characters, locations and open threads.
    ///
    /// Iteration follows insertion order, so the same state always renders
    /// the same text.
    pub fn render_digest(&self) -> String {
        let mut digest = String::from("Current World State:\n");

        if !self.characters.is_empty() {
            digest.push_str("Characters:\n");
            for (name, info) in &self.characters {
                let status = info.status.as_deref().unwrap_or("Unknown");
                let traits = info
                    .traits
                    .as_ref()
                    .filter(|t| !t.is_empty())
                    .map(|t| t.join(", "))
                    .unwrap_or_else(|| "N/A".to_string());
                digest.push_str(&format!(
                    "  - {name} ({status}): {} [Traits: {traits}]",
                    info.description.as_deref().unwrap_or("")
                ));
                if let Some(location) = &info.location {
                    digest.push_str(&format!(" @ {location}"));
                }
                digest.push('\n');
            }
        }

        if !self.locations.is_empty() {
            digest.push_str("Locations:\n");
            for (name, info) in &self.locations {
                digest.push_str(&format!(
                    "  - {name}: {}\n",
                    info.description.as_deref().unwrap_or("")
                ));
            }
        }

        let mut unresolved = self.unresolved_foreshadowing().peekable();
        if unresolved.peek().is_some() {
            digest.push_str("Unresolved Mysteries/Foreshadowing:\n");
            for item in unresolved {
                digest.push_str(&format!("  - {}\n", item.description));
            }
        }

        digest
    }
}

fn merge_entities(target: &mut EntityMap, patches: &EntityMap) {
    for (name, patch) in patches {
        target.entry(name.clone()).or_default().merge(patch);
    }
}

/// Result of resolving a foreshadowing item by description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The item flipped from unresolved to resolved.
    Resolved,
    AlreadyResolved,
    /// No item carries that description.
    Unknown,
}

/// What a merge changed, beyond the plain field overwrites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub foreshadowing_added: usize,
    pub foreshadowing_resolved: usize,
    /// Resolutions that named no existing item.
    pub unknown_resolutions: Vec<String>,
}

/// A partial update to a [`WorldState`].
///
/// Event history (`plot_points`, `current_step`) is deliberately absent:
/// events enter only through `record_event`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldStateDelta {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub characters: EntityMap,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub locations: EntityMap,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub items: EntityMap,
    /// Descriptions of new foreshadowing items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreshadowing: Vec<String>,
    /// Descriptions of items to mark resolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved_foreshadowing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Vec<ChapterOutline>>,
}

impl WorldStateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn character(mut self, name: impl Into<String>, record: EntityRecord) -> Self {
        self.characters.insert(name.into(), record);
        self
    }

    pub fn location(mut self, name: impl Into<String>, record: EntityRecord) -> Self {
        self.locations.insert(name.into(), record);
        self
    }

    pub fn item(mut self, name: impl Into<String>, record: EntityRecord) -> Self {
        self.items.insert(name.into(), record);
        self
    }

    pub fn foreshadow(mut self, description: impl Into<String>) -> Self {
        self.foreshadowing.push(description.into());
        self
    }

    pub fn resolve(mut self, description: impl Into<String>) -> Self {
        self.resolved_foreshadowing.push(description.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_chapters(mut self, chapters: Vec<ChapterOutline>) -> Self {
        self.chapters = Some(chapters);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
            && self.locations.is_empty()
            && self.items.is_empty()
            && self.foreshadowing.is_empty()
            && self.resolved_foreshadowing.is_empty()
            && self.summary.is_none()
            && self.chapters.is_none()
    }

    /// A delta that reproduces every non-event field of `state` when merged.
    pub fn from_state(state: &WorldState) -> Self {
        Self {
            characters: state.characters.clone(),
            locations: state.locations.clone(),
            items: state.items.clone(),
            foreshadowing: state
                .foreshadowing
                .iter()
                .map(|f| f.description.clone())
                .collect(),
            resolved_foreshadowing: state
                .foreshadowing
                .iter()
                .filter(|f| !f.is_unresolved())
                .map(|f| f.description.clone())
                .collect(),
            summary: Some(state.summary.clone()),
            chapters: Some(state.chapters.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fields_accumulate_across_merges() {
        let mut state = WorldState::new();
        state.apply(
            &WorldStateDelta::new().character("Mira", EntityRecord::default().with_status("alive")),
        );
        state.apply(
            &WorldStateDelta::new()
                .character("Mira", EntityRecord::default().with_location("forest")),
        );

        let mira = &state.characters["Mira"];
        assert_eq!(
            *mira,
            EntityRecord::default().with_status("alive").with_location("forest")
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let delta = WorldStateDelta::new()
            .character("Mira", EntityRecord::default().with_status("alive").with_traits(["wry"]))
            .location("Old Mill", EntityRecord::default().with_description("Creaking wheel"))
            .foreshadow("The locked door")
            .resolve("The locked door")
            .with_summary("Mira arrives.");

        let mut once = WorldState::new();
        once.apply(&delta);
        let mut twice = once.clone();
        let outcome = twice.apply(&delta);

        assert_eq!(once, twice);
        assert_eq!(outcome, MergeOutcome::default());
    }

    #[test]
    fn test_duplicate_foreshadowing_rejected() {
        let mut state = WorldState::new();
        state.apply(&WorldStateDelta::new().foreshadow("A raven watches"));
        state.apply(&WorldStateDelta::new().foreshadow("A raven watches"));
        assert_eq!(state.foreshadowing.len(), 1);
        assert!(!state.insert_foreshadowing("  A raven watches "));
    }

    #[test]
    fn test_resolve_flips_once_and_stamps_step() {
        let mut state = WorldState::new();
        state.insert_foreshadowing("The missing key");
        state.push_event("Mira searches", Map::new());
        state.push_event("Mira finds it", Map::new());

        assert_eq!(state.resolve_foreshadowing("The missing key"), Resolution::Resolved);
        assert_eq!(
            state.resolve_foreshadowing("The missing key"),
            Resolution::AlreadyResolved
        );
        assert_eq!(state.resolve_foreshadowing("Never mentioned"), Resolution::Unknown);

        let item = &state.foreshadowing[0];
        assert_eq!(item.status, ForeshadowingStatus::Resolved);
        assert_eq!(item.created_at_step, 0);
        assert_eq!(item.resolved_at_step, Some(2));
    }

    #[test]
    fn test_unknown_resolution_reported() {
        let mut state = WorldState::new();
        let outcome = state.apply(&WorldStateDelta::new().resolve("ghost"));
        assert_eq!(outcome.unknown_resolutions, vec!["ghost".to_string()]);
    }

    #[test]
    fn test_push_event_keeps_caller_type() {
        let mut state = WorldState::new();
        let mut meta = Map::new();
        meta.insert("type".into(), json!("chapter_content"));
        let point = state.push_event("Text", meta).clone();

        assert_eq!(point.step, 0);
        assert_eq!(point.metadata["type"], "chapter_content");
        assert_eq!(point.metadata["step"], 0);
        assert_eq!(state.current_step, 1);
    }

    #[test]
    fn test_entity_parsing_tolerates_generator_shapes() {
        let record: EntityRecord = serde_json::from_value(json!({
            "desc": "A tired cartographer",
            "traits": "patient, exacting",
            "role": "mentor"
        }))
        .unwrap();

        assert_eq!(record.description.as_deref(), Some("A tired cartographer"));
        assert_eq!(
            record.traits,
            Some(vec!["patient".to_string(), "exacting".to_string()])
        );
        assert_eq!(record.attributes["role"], "mentor");
    }

    #[test]
    fn test_digest_is_insertion_ordered() {
        let mut state = WorldState::new();
        state.apply(
            &WorldStateDelta::new()
                .character("Zed", EntityRecord::default().with_status("alive"))
                .character("Ana", EntityRecord::default().with_description("A pilot"))
                .location("Port", EntityRecord::default().with_description("Busy docks"))
                .foreshadow("The storm"),
        );
        state.apply(&WorldStateDelta::new().foreshadow("The letter").resolve("The storm"));

        let digest = state.render_digest();
        let zed = digest.find("Zed").unwrap();
        let ana = digest.find("Ana").unwrap();
        assert!(zed < ana);
        assert!(digest.contains("  - Ana (Unknown): A pilot [Traits: N/A]"));
        assert!(digest.contains("  - Port: Busy docks"));
        assert!(digest.contains("  - The letter"));
        assert!(!digest.contains("The storm"));
        assert_eq!(digest, state.clone().render_digest());
    }

    #[test]
    fn test_from_state_round_trips_fields() {
        let mut source = WorldState::new();
        source.apply(
            &WorldStateDelta::new()
                .character("Mira", EntityRecord::default().with_status("alive"))
                .foreshadow("The well")
                .foreshadow("The bell")
                .resolve("The bell")
                .with_summary("Outline")
                .with_chapters(vec![ChapterOutline::new("One", "Start")]),
        );

        let mut target = WorldState::new();
        target.apply(&WorldStateDelta::from_state(&source));

        assert_eq!(target.characters, source.characters);
        assert_eq!(target.summary, "Outline");
        assert_eq!(target.chapters.len(), 1);
        assert_eq!(target.unresolved_foreshadowing().count(), 1);
    }
}
