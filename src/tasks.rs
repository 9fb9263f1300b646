//! Named computation tasks.
//!
//! A [`Task`] binds a problem definition to a method configuration, the way
//! model documents carry a task list: a time course with its integration
//! settings, a steady-state search with its strategy flags, or a parameter
//! estimation with fit items and an algorithm choice. [`run_task`] validates
//! the model structurally (fatal before any numerics), dispatches to the
//! matching engine, and optionally writes a tab-separated report file.
//!
//! Numerical and convergence failures never escape as errors here; they are
//! encoded in the outcome's status so callers can report best-effort
//! results.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::Experiment;
use crate::model::KineticModel;
use crate::optim::error::OptimizeError;
use crate::optim::hooke::HookeJeevesBuilder;
use crate::optim::objective::LossFunction;
use crate::optim::optimizer::Optimizer;
use crate::optim::problem::{EstimationProblem, FitItem};
use crate::optim::pso::PSOBuilder;
use crate::optim::report::FitReport;
use crate::simulation::error::SimulationError;
use crate::simulation::integrator::CancelToken;
use crate::simulation::result::SimulationResult;
use crate::simulation::setup::SimulationSetup;
use crate::simulation::system::OdeSystem;
use crate::steady_state::{solve_steady_state, SteadyStateResult, SteadyStateSettings};
use crate::validation::{check_model, Report};

/// Estimation algorithm selection with its tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    HookeJeeves {
        #[serde(default = "default_rho")]
        rho: f64,
        #[serde(default = "default_step_tolerance")]
        step_tolerance: f64,
        #[serde(default = "default_hj_iterations")]
        max_iterations: u64,
    },
    ParticleSwarm {
        #[serde(default = "default_pop_size")]
        pop_size: usize,
        #[serde(default = "default_pso_iterations")]
        max_iters: u64,
    },
}

fn default_rho() -> f64 {
    0.1
}
fn default_step_tolerance() -> f64 {
    1e-6
}
fn default_hj_iterations() -> u64 {
    500
}
fn default_pop_size() -> usize {
    40
}
fn default_pso_iterations() -> u64 {
    200
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::HookeJeeves {
            rho: default_rho(),
            step_tolerance: default_step_tolerance(),
            max_iterations: default_hj_iterations(),
        }
    }
}

/// Problem definition of an estimation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationSettings {
    pub items: Vec<FitItem>,
    #[serde(default)]
    pub objective: LossFunction,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Numerical settings applied to every candidate simulation.
    #[serde(default)]
    pub setup: SimulationSetup,
    /// Write fitted values back into the model as a new active set.
    #[serde(default)]
    pub update_model: bool,
}

/// The computation a task performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TimeCourse(SimulationSetup),
    SteadyState(SteadyStateSettings),
    ParameterEstimation(EstimationSettings),
}

/// A named computation with an optional report file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

/// What a task produced.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    TimeCourse(SimulationResult),
    SteadyState(SteadyStateResult),
    Estimation(FitReport),
}

impl TaskOutcome {
    /// True when the computation ran to its own completion criterion;
    /// false for best-effort outcomes (truncated trajectory, no
    /// convergence, iteration limit).
    pub fn is_complete(&self) -> bool {
        match self {
            TaskOutcome::TimeCourse(result) => result.status.is_complete(),
            TaskOutcome::SteadyState(result) => matches!(
                result.status,
                crate::steady_state::SteadyStateStatus::Converged { .. }
            ),
            TaskOutcome::Estimation(report) => report.converged(),
        }
    }
}

/// Errors raised while running a task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("model failed structural validation with {} finding(s)", .0.results.len())]
    InvalidModel(Report),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Optimize(#[from] OptimizeError),

    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
}

/// Runs one task against a model.
///
/// Structural validation always runs first and is fatal. The model is only
/// mutated by estimation tasks with `update_model` set.
pub fn run_task(
    model: &mut KineticModel,
    task: &Task,
    experiments: &[Experiment],
    cancel: Option<&CancelToken>,
) -> Result<TaskOutcome, TaskError> {
    let report = check_model(model);
    if !report.is_valid {
        return Err(TaskError::InvalidModel(report));
    }

    info!("running task '{}'", task.name);
    let outcome = match &task.kind {
        TaskKind::TimeCourse(setup) => {
            let system = OdeSystem::new(model, None)?;
            let result = system.integrate(setup, None, None, cancel)?;
            if !result.status.is_complete() {
                warn!(
                    "task '{}' produced a truncated trajectory ({:?})",
                    task.name, result.status
                );
            }
            TaskOutcome::TimeCourse(result)
        }
        TaskKind::SteadyState(settings) => {
            let system = OdeSystem::new(model, None)?;
            let result = solve_steady_state(&system, settings, None, cancel)?;
            TaskOutcome::SteadyState(result)
        }
        TaskKind::ParameterEstimation(settings) => {
            let mut problem = EstimationProblem::new(
                model,
                experiments.to_vec(),
                settings.items.clone(),
                settings.objective,
                settings.setup.clone(),
            )?;
            if let Some(token) = cancel {
                problem = problem.with_cancel(token.clone());
            }

            let report = match &settings.algorithm {
                Algorithm::HookeJeeves {
                    rho,
                    step_tolerance,
                    max_iterations,
                } => HookeJeevesBuilder::default()
                    .rho(*rho)
                    .step_tolerance(*step_tolerance)
                    .max_iterations(*max_iterations)
                    .build()
                    .optimize::<ndarray::Array1<f64>>(&problem, None)?,
                Algorithm::ParticleSwarm {
                    pop_size,
                    max_iters,
                } => PSOBuilder::default()
                    .pop_size(*pop_size)
                    .max_iters(*max_iters)
                    .build()
                    .optimize::<ndarray::Array1<f64>>(&problem, None)?,
            };

            if settings.update_model {
                let set_id = format!("fit_{}", task.name);
                report
                    .apply_to_model(model, set_id, format!("Fitted values ({})", task.name))
                    .map_err(OptimizeError::Structure)?;
            }

            TaskOutcome::Estimation(report)
        }
    };

    if let Some(path) = &task.report_path {
        write_report(path, &outcome)?;
    }

    Ok(outcome)
}

/// Writes a tab-separated report for any outcome kind.
fn write_report(path: &Path, outcome: &TaskOutcome) -> Result<(), TaskError> {
    match outcome {
        TaskOutcome::TimeCourse(result) => {
            let mut file = std::fs::File::create(path)?;
            let mut ids: Vec<&String> = result.species.keys().collect();
            ids.sort();
            let mut assignment_ids: Vec<&String> = result.assignments.keys().collect();
            assignment_ids.sort();

            write!(file, "time")?;
            for id in ids.iter().chain(&assignment_ids) {
                write!(file, "\t{id}")?;
            }
            writeln!(file)?;

            for (i, t) in result.time.iter().enumerate() {
                write!(file, "{t:e}")?;
                for id in ids.iter().chain(&assignment_ids) {
                    let value = result
                        .get_curve(id.as_str())
                        .and_then(|c| c.get(i))
                        .copied()
                        .unwrap_or(f64::NAN);
                    write!(file, "\t{value:e}")?;
                }
                writeln!(file)?;
            }
        }
        TaskOutcome::SteadyState(result) => {
            let mut file = std::fs::File::create(path)?;
            writeln!(file, "status\t{:?}", result.status)?;
            writeln!(file, "residual_norm\t{:e}", result.residual_norm)?;
            writeln!(file, "iterations\t{}", result.iterations)?;
            if let Some(stability) = result.stability {
                writeln!(file, "stability\t{stability:?}")?;
            }
            writeln!(file)?;
            writeln!(file, "entity\tvalue")?;
            let state: BTreeMap<&String, &f64> = result.state.iter().collect();
            for (id, value) in state {
                writeln!(file, "{id}\t{value:e}")?;
            }
            if !result.eigenvalues.is_empty() {
                writeln!(file)?;
                writeln!(file, "eigenvalue_re\teigenvalue_im")?;
                for (re, im) in &result.eigenvalues {
                    writeln!(file, "{re:e}\t{im:e}")?;
                }
            }
        }
        TaskOutcome::Estimation(report) => {
            report.write_tsv(path).map_err(|e| match e {
                OptimizeError::Report(io) => TaskError::Report(io),
                other => TaskError::Optimize(other),
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::simulation::setup::SimulationSetupBuilder;

    #[test]
    fn time_course_task_writes_tsv() {
        let mut model = demo::phospho_network();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("course.tsv");

        let task = Task {
            name: "course".to_string(),
            kind: TaskKind::TimeCourse(
                SimulationSetupBuilder::default()
                    .t1(2.0)
                    .dt(1.0)
                    .build()
                    .unwrap(),
            ),
            report_path: Some(path.clone()),
        };

        let outcome = run_task(&mut model, &task, &[], None).unwrap();
        assert!(outcome.is_complete());

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert!(header.starts_with("time"));
        assert!(header.contains("P0"));
        assert_eq!(content.lines().count(), 4); // header + 3 time points
    }

    #[test]
    fn invalid_model_is_rejected_before_numerics() {
        let mut model = demo::phospho_network();
        model.compartments[0].volume = -1.0;
        let task = Task {
            name: "course".to_string(),
            kind: TaskKind::TimeCourse(SimulationSetup::default()),
            report_path: None,
        };

        assert!(matches!(
            run_task(&mut model, &task, &[], None),
            Err(TaskError::InvalidModel(_))
        ));
    }

    #[test]
    fn steady_state_task_runs() {
        let mut model = demo::phospho_network();
        let task = Task {
            name: "ss".to_string(),
            kind: TaskKind::SteadyState(SteadyStateSettings::default()),
            report_path: None,
        };

        let outcome = run_task(&mut model, &task, &[], None).unwrap();
        if let TaskOutcome::SteadyState(result) = outcome {
            assert!(result.residual_norm.is_finite());
        } else {
            panic!("expected steady-state outcome");
        }
    }
}
