//! Estimation results and their write-back into models.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use ndarray::Array1;
use serde::Serialize;

use crate::model::{KineticModel, StructureError};
use crate::simulation::result::SimulationResult;

use super::error::OptimizeError;
use super::hooke::DriverState;
use super::problem::EstimationProblem;

/// Outcome of one estimation run.
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    /// Parameter name → best value found.
    pub best_params: BTreeMap<String, f64>,
    /// Objective value at the best parameters.
    pub best_objective: f64,
    /// Total candidate evaluations spent.
    pub evaluations: usize,
    /// Driver iterations spent.
    pub iterations: u64,
    /// Why the driver stopped.
    pub termination: DriverState,
    /// Simulated fits at the best parameters, keyed by experiment id.
    pub fits: HashMap<String, SimulationResult>,
}

impl FitReport {
    /// Assembles a report for the best candidate of a finished run.
    pub(crate) fn new(
        problem: &EstimationProblem,
        best: Array1<f64>,
        best_objective: f64,
        iterations: u64,
        termination: DriverState,
    ) -> Result<Self, OptimizeError> {
        let best_params: BTreeMap<String, f64> = problem
            .param_names()
            .into_iter()
            .zip(best.iter().copied())
            .collect();

        let fits = problem.fits(&best)?;

        Ok(Self {
            best_params,
            best_objective,
            evaluations: problem.evaluations(),
            iterations,
            termination,
            fits,
        })
    }

    /// True when the driver stopped by its own convergence criterion.
    pub fn converged(&self) -> bool {
        self.termination == DriverState::Converged
    }

    /// Writes the fitted values back into the model as a new named
    /// parameter set and makes it active.
    pub fn apply_to_model(
        &self,
        model: &mut KineticModel,
        set_id: impl Into<String>,
        set_name: impl Into<String>,
    ) -> Result<(), StructureError> {
        model.apply_fitted_values(&self.best_params, set_id, set_name)
    }

    /// Writes a tab-separated summary: objective, evaluation count, and one
    /// row per parameter.
    pub fn write_tsv(&self, path: impl AsRef<Path>) -> Result<(), OptimizeError> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "objective\t{:e}", self.best_objective)?;
        writeln!(file, "evaluations\t{}", self.evaluations)?;
        writeln!(file, "iterations\t{}", self.iterations)?;
        writeln!(file, "termination\t{:?}", self.termination)?;
        writeln!(file)?;
        writeln!(file, "parameter\tvalue")?;
        for (name, value) in &self.best_params {
            writeln!(file, "{name}\t{value:e}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsv_report_lists_parameters() {
        let report = FitReport {
            best_params: BTreeMap::from([("k".to_string(), 0.5)]),
            best_objective: 1.25e-3,
            evaluations: 321,
            iterations: 17,
            termination: DriverState::Converged,
            fits: HashMap::new(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.tsv");
        report.write_tsv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("objective\t"));
        assert!(content.contains("k\t"));
        assert!(content.contains("parameter\tvalue"));
    }
}
