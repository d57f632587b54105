//! The rollout loop and its two operating modes.

use super::node::{NodeId, SearchTree};
use super::strategy::{NodeContext, Strategy};
use crate::memory::{Durability, MemoryStore};
use crate::world::{WorldState, WorldStateDelta};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Score used when a critique fails or returns something unusable.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Precondition violations. Nothing else makes a search fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("max_iterations must be at least 1")]
    ZeroIterations,

    #[error("branch_factor must be at least 1")]
    ZeroBranchFactor,
}

/// Engine parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// Rollouts per decision point.
    pub max_iterations: usize,
    /// Candidates requested per expansion.
    pub branch_factor: usize,
    pub exploration_weight: f64,
    /// Fixes the random child choice during rollouts.
    pub seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            branch_factor: 3,
            exploration_weight: std::f64::consts::SQRT_2,
            seed: None,
        }
    }
}

impl SearchConfig {
    pub fn new(max_iterations: usize, branch_factor: usize) -> Self {
        Self {
            max_iterations,
            branch_factor,
            ..Self::default()
        }
    }

    pub fn with_exploration_weight(mut self, weight: f64) -> Self {
        self.exploration_weight = weight;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), SearchError> {
        if self.max_iterations == 0 {
            return Err(SearchError::ZeroIterations);
        }
        if self.branch_factor == 0 {
            return Err(SearchError::ZeroBranchFactor);
        }
        Ok(())
    }
}

/// Shared flag for stopping a run.
///
/// Checked before every rollout, and raced against in-flight strategy calls
/// so a slow generator cannot hold a cancelled run open.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        // Registered before the check so a concurrent cancel is not missed.
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// How a run went, including every silently absorbed failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchReport {
    pub rollouts: usize,
    pub failed_expansions: usize,
    pub defaulted_scores: usize,
    pub cancelled: bool,
}

impl SearchReport {
    /// True if any rollout ran on a fallback.
    pub fn is_degraded(&self) -> bool {
        self.failed_expansions > 0 || self.defaulted_scores > 0
    }

    fn absorb(&mut self, other: &SearchReport) {
        self.rollouts += other.rollouts;
        self.failed_expansions += other.failed_expansions;
        self.defaulted_scores += other.defaulted_scores;
        self.cancelled |= other.cancelled;
    }
}

/// Outcome of a single-decision search.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Label of the chosen child, or `None` when the root's state came back.
    pub label: Option<String>,
    /// The chosen child's delta against the root.
    pub delta: Option<WorldStateDelta>,
    pub state: WorldState,
    pub visits: u32,
    pub report: SearchReport,
}

/// Outcome of a sequential search.
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    /// Committed labels, in order.
    pub labels: Vec<String>,
    /// A step produced no candidates before all steps ran.
    pub stopped_early: bool,
    pub durability: Durability,
    pub report: SearchReport,
}

/// Monte Carlo tree search over narrative continuations.
pub struct SearchEngine<S> {
    strategy: S,
    config: SearchConfig,
    rng: StdRng,
    cancel: CancellationFlag,
}

impl<S: Strategy> SearchEngine<S> {
    pub fn new(strategy: S, config: SearchConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            strategy,
            config,
            rng,
            cancel: CancellationFlag::new(),
        }
    }

    /// Stop when `flag` is cancelled, abandoning any in-flight strategy call.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = flag;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run all rollouts from one root and return the most-visited child.
    ///
    /// The root's own state comes back unchanged when no expansion ever
    /// succeeded or when the run is cancelled.
    pub async fn run_single(
        &mut self,
        premise: &str,
        root_state: WorldState,
        memory: &MemoryStore,
    ) -> Result<Decision, SearchError> {
        self.config.validate()?;
        info!(
            strategy = self.strategy.name(),
            iterations = self.config.max_iterations,
            "Starting search"
        );

        let mut tree = SearchTree::new(premise, root_state);
        let root = tree.root();
        let report = self.rollouts(&mut tree, root, premise, &[], memory).await;

        let chosen = if report.cancelled {
            None
        } else {
            tree.best_child_by_visits(root)
        };

        let decision = match chosen {
            Some(id) => {
                let node = tree.get(id);
                Decision {
                    label: Some(node.label.clone()),
                    delta: Some(node.delta.clone()),
                    state: node.state.clone(),
                    visits: node.visits,
                    report,
                }
            }
            None => {
                let node = tree.get(root);
                Decision {
                    label: None,
                    delta: None,
                    state: node.state.clone(),
                    visits: node.visits,
                    report,
                }
            }
        };

        if decision.report.is_degraded() {
            warn!(report = ?decision.report, "Search finished degraded");
        }
        Ok(decision)
    }

    /// Search, commit the best child, and continue from it for up to `steps` steps.
    ///
    /// Each step starts a fresh tree rooted at the last committed node.
    pub async fn run_sequential(
        &mut self,
        premise: &str,
        steps: usize,
        memory: &mut MemoryStore,
    ) -> Result<SequenceOutcome, SearchError> {
        self.config.validate()?;

        let mut labels: Vec<String> = Vec::new();
        let mut report = SearchReport::default();
        let mut durability = Durability::Durable;
        let mut stopped_early = false;
        let mut current_label = premise.to_string();

        for step in 0..steps {
            let mut tree = SearchTree::new(current_label.as_str(), memory.world_state().clone());
            let root = tree.root();
            let step_report = self.rollouts(&mut tree, root, premise, &labels, memory).await;
            report.absorb(&step_report);

            if step_report.cancelled {
                break;
            }

            let Some(best) = tree.best_child_by_visits(root) else {
                info!(step, "No candidates produced, stopping sequence");
                stopped_early = true;
                break;
            };

            let node = tree.get(best);
            let receipt = memory
                .merge_world_state(&WorldStateDelta::from_state(&node.state))
                .await;
            durability = durability.and(receipt.durability);

            let mut metadata = Map::new();
            metadata.insert("type".to_string(), Value::from("scene"));
            metadata.insert("search_step".to_string(), Value::from(step));
            let event = memory.record_event(&node.label, metadata).await;
            durability = durability.and(event.durability);

            info!(step, label = %node.label, visits = node.visits, "Committed step");
            current_label = node.label.clone();
            labels.push(node.label.clone());
        }

        Ok(SequenceOutcome {
            labels,
            stopped_early,
            durability,
            report,
        })
    }

    async fn rollouts(
        &mut self,
        tree: &mut SearchTree,
        root: NodeId,
        premise: &str,
        history: &[String],
        memory: &MemoryStore,
    ) -> SearchReport {
        let mut report = SearchReport::default();

        for _ in 0..self.config.max_iterations {
            if self.cancel.is_cancelled() {
                info!(completed = report.rollouts, "Search cancelled");
                report.cancelled = true;
                break;
            }

            let node = tree.select(root, self.config.exploration_weight);
            if tree.get(node).visits == 0 && tree.get(node).is_leaf() {
                self.expand(tree, node, premise, history, memory, &mut report)
                    .await;
            }

            let target = match tree.children(node).choose(&mut self.rng) {
                Some(&child) => child,
                None => node,
            };

            let score = self
                .simulate(tree, target, premise, history, memory, &mut report)
                .await;
            tree.backpropagate(target, score);
            report.rollouts += 1;
        }

        report
    }

    async fn expand(
        &self,
        tree: &mut SearchTree,
        node: NodeId,
        premise: &str,
        history: &[String],
        memory: &MemoryStore,
        report: &mut SearchReport,
    ) {
        let result = {
            let n = tree.get(node);
            let ctx = NodeContext {
                premise,
                label: &n.label,
                state: &n.state,
                depth: n.depth,
                history,
                memory,
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.strategy.expand(&ctx, self.config.branch_factor) => Some(result),
            }
        };

        let Some(result) = result else {
            debug!(node = node.index(), "Expansion abandoned on cancellation");
            return;
        };

        match result {
            Ok(candidates) => {
                if candidates.is_empty() {
                    debug!(node = node.index(), "Expansion returned no candidates");
                }
                for candidate in candidates.into_iter().take(self.config.branch_factor) {
                    tree.add_child(node, candidate.label, candidate.delta);
                }
            }
            Err(e) => {
                warn!(
                    strategy = self.strategy.name(),
                    node = node.index(),
                    error = %e,
                    "Expansion failed"
                );
                report.failed_expansions += 1;
            }
        }
    }

    async fn simulate(
        &self,
        tree: &SearchTree,
        node: NodeId,
        premise: &str,
        history: &[String],
        memory: &MemoryStore,
        report: &mut SearchReport,
    ) -> f64 {
        let n = tree.get(node);
        let ctx = NodeContext {
            premise,
            label: &n.label,
            state: &n.state,
            depth: n.depth,
            history,
            memory,
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(node = node.index(), "Simulation abandoned on cancellation");
                return NEUTRAL_SCORE;
            }
            result = self.strategy.simulate(&ctx) => result,
        };

        match result {
            Ok(score) if score.is_finite() && (0.0..=1.0).contains(&score) => score,
            Ok(score) => {
                warn!(score, "Score out of range, using neutral score");
                report.defaulted_scores += 1;
                NEUTRAL_SCORE
            }
            Err(e) => {
                warn!(
                    strategy = self.strategy.name(),
                    error = %e,
                    "Simulation failed, using neutral score"
                );
                report.defaulted_scores += 1;
                NEUTRAL_SCORE
            }
        }
    }
}
