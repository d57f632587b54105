//! Monte Carlo tree search over narrative branches.
//!
//! A [`SearchEngine`] runs select, expand, simulate and backpropagate
//! rollouts over a [`SearchTree`], delegating expansion and scoring to a
//! [`Strategy`]. Two strategies ship with the crate:
//!
//! - [`PlannerStrategy`] proposes whole story plans (cast, threads, chapters).
//! - [`SceneStrategy`] proposes the next beat of a scene.
//!
//! Rollouts run one at a time against a single tree, so visit counts are
//! always exact.

mod engine;
mod node;
mod planner;
mod scene;
mod strategy;

pub use engine::{
    CancellationFlag, Decision, SearchConfig, SearchEngine, SearchError, SearchReport,
    SequenceOutcome, NEUTRAL_SCORE,
};
pub use node::{NodeId, SearchNode, SearchTree};
pub use planner::PlannerStrategy;
pub use scene::SceneStrategy;
pub use strategy::{Candidate, NodeContext, Strategy, StrategyError};
