//! Per-job progress accounting.
//!
//! Each node that declares a numeric `steps` input owns a share of the
//! job's step budget. Progress events report a node's current step; the
//! aggregate percentage is the sum of the latest reported values over
//! the total budget.

use std::collections::HashMap;

use crate::builder::SubmittedJob;
use crate::types::{NodeId, Percent};

/// Progress bookkeeping for exactly one job.
///
/// Created from the resolved graph at build time and dropped with the
/// job. Never shared between jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    step_budget: HashMap<NodeId, f64>,
    accumulated: HashMap<NodeId, f64>,
    budget_sum: f64,
    percentage: Percent,
}

impl ProgressState {
    /// Scan `job` for numeric `steps` inputs.
    pub fn init(job: &SubmittedJob) -> Self {
        Self::from_budget(
            job.nodes()
                .filter_map(|(id, node)| node.declared_steps().map(|steps| (id.clone(), steps))),
        )
    }

    pub fn from_budget(budget: impl IntoIterator<Item = (NodeId, f64)>) -> Self {
        let step_budget: HashMap<NodeId, f64> = budget.into_iter().collect();
        let budget_sum = step_budget.values().sum();
        Self {
            step_budget,
            accumulated: HashMap::new(),
            budget_sum,
            percentage: 0.0,
        }
    }

    /// Record the latest step value for `node` and return the aggregate.
    ///
    /// A later value for the same node replaces its earlier one. Nodes
    /// outside the budget are ignored and the previous percentage is
    /// returned unchanged.
    pub fn update(&mut self, node: &str, raw_value: f64) -> Percent {
        if !self.step_budget.contains_key(node) {
            tracing::debug!(node, "Ignoring progress for node without a step budget");
            return self.percentage;
        }
        self.accumulated.insert(node.to_string(), raw_value);
        self.percentage = if self.budget_sum == 0.0 {
            0.0
        } else {
            self.accumulated.values().sum::<f64>() * 100.0 / self.budget_sum
        };
        self.percentage
    }

    pub fn percentage(&self) -> Percent {
        self.percentage
    }

    pub fn budget_sum(&self) -> f64 {
        self.budget_sum
    }

    pub fn budget_for(&self, node: &str) -> Option<f64> {
        self.step_budget.get(node).copied()
    }

    pub fn is_tracked(&self, node: &str) -> bool {
        self.step_budget.contains_key(node)
    }
}
