//! Arena-backed search tree.

use crate::world::{WorldState, WorldStateDelta};

/// Index of a node within its [`SearchTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One candidate narrative decision and the world it leads to.
#[derive(Debug, Clone)]
pub struct SearchNode {
    /// Short text naming the decision.
    pub label: String,
    /// The delta this decision applied to its parent's state. Empty at the root.
    pub delta: WorldStateDelta,
    /// State after every decision from the root to here.
    pub state: WorldState,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub visits: u32,
    pub value: f64,
    /// Distance from the root.
    pub depth: usize,
}

impl SearchNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Mean simulation score, or zero before the first visit.
    pub fn mean_value(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.value / f64::from(self.visits)
        }
    }

    /// Upper confidence bound given the parent's visit count.
    ///
    /// Unvisited nodes score `+inf`, so every child is tried once before
    /// any sibling is revisited.
    pub fn uct_score(&self, parent_visits: u32, exploration_weight: f64) -> f64 {
        if self.visits == 0 {
            return f64::INFINITY;
        }
        let visits = f64::from(self.visits);
        self.value / visits
            + exploration_weight * (f64::from(parent_visits).ln() / visits).sqrt()
    }
}

/// Nodes of one search run, addressed by [`NodeId`].
///
/// Children are owned through the arena; `parent` is only an index, so the
/// tree never forms an ownership cycle.
#[derive(Debug, Clone)]
pub struct SearchTree {
    nodes: Vec<SearchNode>,
}

impl SearchTree {
    /// A tree holding only the root.
    pub fn new(label: impl Into<String>, state: WorldState) -> Self {
        Self {
            nodes: vec![SearchNode {
                label: label.into(),
                delta: WorldStateDelta::default(),
                state,
                parent: None,
                children: Vec::new(),
                visits: 0,
                value: 0.0,
                depth: 0,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &SearchNode {
        &self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Append a child whose state is the parent's state with `delta` merged in.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        label: impl Into<String>,
        delta: WorldStateDelta,
    ) -> NodeId {
        let mut state = self.nodes[parent.0].state.clone();
        state.apply(&delta);
        let id = NodeId(self.nodes.len());
        let depth = self.nodes[parent.0].depth + 1;

        self.nodes.push(SearchNode {
            label: label.into(),
            delta,
            state,
            parent: Some(parent),
            children: Vec::new(),
            visits: 0,
            value: 0.0,
            depth,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Descend from `from` by maximal UCT until reaching a node without children.
    ///
    /// Ties go to the first child encountered.
    pub fn select(&self, from: NodeId, exploration_weight: f64) -> NodeId {
        let mut current = from;
        loop {
            let node = &self.nodes[current.0];
            let mut best: Option<(NodeId, f64)> = None;
            for &child in &node.children {
                let score = self.nodes[child.0].uct_score(node.visits, exploration_weight);
                if best.map_or(true, |(_, top)| score > top) {
                    best = Some((child, score));
                }
            }
            match best {
                Some((child, _)) => current = child,
                None => return current,
            }
        }
    }

    /// Add one visit and `score` to `from` and every ancestor up to the root.
    pub fn backpropagate(&mut self, from: NodeId, score: f64) {
        let mut current = Some(from);
        while let Some(id) = current {
            let node = &mut self.nodes[id.0];
            node.visits += 1;
            node.value += score;
            current = node.parent;
        }
    }

    /// The most-visited child of `id`, first one on ties.
    pub fn best_child_by_visits(&self, id: NodeId) -> Option<NodeId> {
        let mut best: Option<NodeId> = None;
        for &child in &self.nodes[id.0].children {
            let better = match best {
                Some(current) => self.nodes[child.0].visits > self.nodes[current.0].visits,
                None => true,
            };
            if better {
                best = Some(child);
            }
        }
        best
    }
}
