//! Story configuration.

use crate::llm::CallPolicy;
use crate::search::SearchConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a story session.
#[derive(Debug, Clone)]
pub struct StoryConfig {
    /// Root directory holding one subdirectory per project.
    pub data_dir: PathBuf,

    /// Model to use for generation. The client default applies when unset.
    pub model: Option<String>,

    /// Language the prose and plans are written in.
    pub language: String,

    /// Genre hint for plans and scene prose.
    pub genre: String,

    /// Rollouts per decision point.
    pub max_iterations: usize,

    /// Candidates requested per expansion.
    pub branch_factor: usize,

    pub exploration_weight: f64,

    /// Per-attempt timeout for external calls.
    pub call_timeout: Duration,

    /// Retries after the first failed attempt.
    pub max_retries: usize,

    /// Key for the ScrapingDog research service.
    pub scrapingdog_api_key: Option<String>,

    /// Fixes random choices during search.
    pub seed: Option<u64>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/projects"),
            model: None,
            language: "English".to_string(),
            genre: "literary fiction".to_string(),
            max_iterations: 5,
            branch_factor: 3,
            exploration_weight: std::f64::consts::SQRT_2,
            call_timeout: Duration::from_secs(120),
            max_retries: 2,
            scrapingdog_api_key: None,
            seed: None,
        }
    }
}

impl StoryConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `LOOM_DATA_DIR`, `LOOM_MODEL`, `LOOM_LANGUAGE`
    /// and `SCRAPINGDOG_API_KEY`. Empty variables are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("LOOM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.model = get("LOOM_MODEL");
        if let Some(language) = get("LOOM_LANGUAGE") {
            config.language = language;
        }
        config.scrapingdog_api_key = get("SCRAPINGDOG_API_KEY");
        config
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    pub fn with_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_branch_factor(mut self, branch_factor: usize) -> Self {
        self.branch_factor = branch_factor;
        self
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_scrapingdog_key(mut self, key: impl Into<String>) -> Self {
        self.scrapingdog_api_key = Some(key.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The engine-level subset.
    pub fn search(&self) -> SearchConfig {
        let config = SearchConfig::new(self.max_iterations, self.branch_factor)
            .with_exploration_weight(self.exploration_weight);
        match self.seed {
            Some(seed) => config.with_seed(seed),
            None => config,
        }
    }

    /// Timeout and retry policy for generation calls.
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            timeout: self.call_timeout,
            max_retries: self.max_retries,
            ..CallPolicy::default()
        }
    }
}
