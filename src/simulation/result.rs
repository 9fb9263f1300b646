//! Simulation result data structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::error::StopReason;

/// Completion status of a simulation run.
///
/// Truncated runs are first-class results: the curves cover everything up to
/// the stop point, and the status says why the run ended early.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    Completed,
    Truncated { reason: StopReason, reached: f64 },
}

impl SimulationStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, SimulationStatus::Completed)
    }
}

/// Time-course output of one simulation run.
///
/// `species` holds one curve per integrated entity (species governed by
/// reactions or by an explicit rate expression, plus rate-rule quantities);
/// `assignments` holds the recomputed assignment curves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationResult {
    pub time: Vec<f64>,
    pub species: HashMap<String, Vec<f64>>,
    pub assignments: HashMap<String, Vec<f64>>,
    pub status: SimulationStatus,
}

impl SimulationResult {
    /// Creates an empty result over the given time grid.
    pub fn new(time: Vec<f64>) -> Self {
        Self {
            time,
            species: HashMap::new(),
            assignments: HashMap::new(),
            status: SimulationStatus::Completed,
        }
    }

    pub fn add_species(&mut self, id: impl Into<String>, values: Vec<f64>) {
        self.species.insert(id.into(), values);
    }

    pub fn add_assignment(&mut self, id: impl Into<String>, values: Vec<f64>) {
        self.assignments.insert(id.into(), values);
    }

    /// Curve of an integrated entity or assignment, whichever matches.
    pub fn get_curve(&self, id: &str) -> Option<&Vec<f64>> {
        self.species.get(id).or_else(|| self.assignments.get(id))
    }

    /// Final value of an entity's curve.
    pub fn final_value(&self, id: &str) -> Option<f64> {
        self.get_curve(id).and_then(|curve| curve.last().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curves_are_reachable_by_id() {
        let mut result = SimulationResult::new(vec![0.0, 1.0]);
        result.add_species("A", vec![1.0, 0.5]);
        result.add_assignment("kappa", vec![0.0, 0.25]);

        assert_eq!(result.get_curve("A"), Some(&vec![1.0, 0.5]));
        assert_eq!(result.get_curve("kappa"), Some(&vec![0.0, 0.25]));
        assert_eq!(result.final_value("A"), Some(0.5));
        assert!(result.get_curve("missing").is_none());
    }
}
