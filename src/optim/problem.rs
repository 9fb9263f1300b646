//! The parameter-estimation problem.
//!
//! An [`EstimationProblem`] binds a compiled model to a set of experiments
//! and box-constrained fit parameters. Evaluating a candidate vector means
//! one simulation per experiment (in parallel; the experiments only share
//! the read-only candidate), comparing the simulated curves against the
//! measured columns, and reducing the weighted residuals through the chosen
//! loss function.
//!
//! A candidate whose simulation is truncated (step budget, underflow) gets
//! an infinite cost instead of aborting the fit; structural failures abort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use argmin::core::{CostFunction, Gradient};
use finitediff::FiniteDiff;
use log::warn;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::experiment::Experiment;
use crate::model::KineticModel;
use crate::optim::objective::{LossFunction, ObjectiveFunction, ResidualBlock};
use crate::simulation::integrator::CancelToken;
use crate::simulation::result::SimulationResult;
use crate::simulation::setup::SimulationSetup;
use crate::simulation::system::OdeSystem;

use super::error::OptimizeError;

/// One fit parameter with box constraints and a start value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitItem {
    /// Entity id whose initial value is fitted.
    pub entity: String,
    pub lower: f64,
    pub upper: f64,
    pub start: f64,
}

impl FitItem {
    pub fn new(entity: impl Into<String>, lower: f64, upper: f64, start: f64) -> Self {
        Self {
            entity: entity.into(),
            lower,
            upper,
            start,
        }
    }
}

/// A ready-to-evaluate estimation problem.
#[derive(Debug, Clone)]
pub struct EstimationProblem {
    system: OdeSystem,
    experiments: Vec<Experiment>,
    /// Fit items, sorted by entity id; defines the parameter vector order.
    items: Vec<FitItem>,
    objective: LossFunction,
    /// One setup per experiment, window matching the experiment's time axis.
    setups: Vec<SimulationSetup>,
    /// One evaluation-time grid per experiment.
    eval_times: Vec<Vec<f64>>,
    /// Measured data per experiment: points × dependent columns.
    measurements: Vec<Array2<f64>>,
    /// Per-experiment column weights.
    weights: Vec<Array1<f64>>,
    /// Per-experiment contribution multipliers.
    normalizations: Vec<f64>,
    /// Target entity ids per experiment, one per measured column.
    targets: Vec<Vec<String>>,
    /// Initial-condition overrides from independent columns.
    base_overrides: Vec<HashMap<String, f64>>,
    evaluations: Arc<AtomicUsize>,
    cancel: Option<CancelToken>,
}

impl EstimationProblem {
    /// Builds a problem from a model, experiments and fit items.
    ///
    /// `base_setup` supplies the numerical settings (tolerances, step
    /// budget, undefined-value policy); each experiment's time axis defines
    /// its own window and evaluation grid.
    pub fn new(
        model: &KineticModel,
        experiments: Vec<Experiment>,
        items: Vec<FitItem>,
        objective: LossFunction,
        base_setup: SimulationSetup,
    ) -> Result<Self, OptimizeError> {
        if experiments.is_empty() {
            return Err(OptimizeError::NoExperiments);
        }
        if items.is_empty() {
            return Err(OptimizeError::NoFitItems);
        }

        let mut items = items;
        items.sort_by(|a, b| a.entity.cmp(&b.entity));
        for item in &items {
            if !model.has_entity(&item.entity) {
                return Err(OptimizeError::UnknownParameter(item.entity.clone()));
            }
            if !item.lower.is_finite() || !item.upper.is_finite() || item.lower > item.upper {
                return Err(OptimizeError::InvalidBounds {
                    param: item.entity.clone(),
                    lower: item.lower,
                    upper: item.upper,
                });
            }
            if item.start < item.lower || item.start > item.upper {
                return Err(OptimizeError::StartOutOfBounds {
                    param: item.entity.clone(),
                    start: item.start,
                    lower: item.lower,
                    upper: item.upper,
                });
            }
        }

        let system = OdeSystem::new(model, None)?;

        let mut setups = Vec::with_capacity(experiments.len());
        let mut eval_times = Vec::with_capacity(experiments.len());
        let mut measurements = Vec::with_capacity(experiments.len());
        let mut weights = Vec::with_capacity(experiments.len());
        let mut normalizations = Vec::with_capacity(experiments.len());
        let mut targets = Vec::with_capacity(experiments.len());
        let mut base_overrides = Vec::with_capacity(experiments.len());

        for experiment in &experiments {
            experiment.validate(model)?;

            let dependent = experiment.dependent_columns();
            if dependent.is_empty() {
                return Err(OptimizeError::NoDependentColumns(experiment.id.clone()));
            }

            let mut setup: SimulationSetup = experiment.try_into()?;
            setup.merge(&base_setup);
            setups.push(setup);
            eval_times.push(experiment.time.clone());

            let n_rows = experiment.time.len();
            let mut data = Array2::zeros((n_rows, dependent.len()));
            let mut column_targets = Vec::with_capacity(dependent.len());
            let column_weights = experiment.weights();
            let mut weight_vec = Vec::with_capacity(dependent.len());

            for (j, (mapping, values)) in dependent.iter().enumerate() {
                for (i, value) in values.iter().enumerate().take(n_rows) {
                    data[(i, j)] = *value;
                }
                column_targets.push(
                    mapping
                        .target
                        .clone()
                        .expect("dependent mappings are validated"),
                );
                weight_vec.push(column_weights[&mapping.column]);
            }

            measurements.push(data);
            weights.push(Array1::from_vec(weight_vec));
            normalizations.push(if experiment.normalize {
                1.0 / experiment.n_points().max(1) as f64
            } else {
                1.0
            });
            targets.push(column_targets);
            base_overrides.push(experiment.initial_overrides());
        }

        Ok(Self {
            system,
            experiments,
            items,
            objective,
            setups,
            eval_times,
            measurements,
            weights,
            normalizations,
            targets,
            base_overrides,
            evaluations: Arc::new(AtomicUsize::new(0)),
            cancel: None,
        })
    }

    /// Installs a cancellation token checked between candidate evaluations
    /// and at integration step boundaries.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn n_params(&self) -> usize {
        self.items.len()
    }

    /// Parameter names in vector order.
    pub fn param_names(&self) -> Vec<String> {
        self.items.iter().map(|i| i.entity.clone()).collect()
    }

    pub fn starts(&self) -> Array1<f64> {
        Array1::from_iter(self.items.iter().map(|i| i.start))
    }

    pub fn lower_bounds(&self) -> Array1<f64> {
        Array1::from_iter(self.items.iter().map(|i| i.lower))
    }

    pub fn upper_bounds(&self) -> Array1<f64> {
        Array1::from_iter(self.items.iter().map(|i| i.upper))
    }

    /// Clamps a candidate into the box, component-wise.
    pub fn clamp(&self, candidate: &mut Array1<f64>) {
        for (value, item) in candidate.iter_mut().zip(&self.items) {
            *value = value.clamp(item.lower, item.upper);
        }
    }

    /// True when every component lies inside its bounds.
    pub fn within_bounds(&self, candidate: &Array1<f64>) -> bool {
        candidate
            .iter()
            .zip(&self.items)
            .all(|(v, item)| *v >= item.lower && *v <= item.upper)
    }

    /// Number of candidate evaluations performed so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn items(&self) -> &[FitItem] {
        &self.items
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    /// Entity overrides for one experiment under a candidate vector: the
    /// experiment's measured initial conditions plus the candidate values.
    fn candidate_overrides(&self, experiment_idx: usize, candidate: &Array1<f64>) -> HashMap<String, f64> {
        let mut overrides = self.base_overrides[experiment_idx].clone();
        for (item, value) in self.items.iter().zip(candidate.iter()) {
            overrides.insert(item.entity.clone(), *value);
        }
        overrides
    }

    /// Evaluates the objective for one candidate vector.
    ///
    /// Truncated simulations yield `f64::INFINITY` (the candidate is simply
    /// never an improvement); hard failures propagate.
    pub fn evaluate(&self, candidate: &Array1<f64>) -> Result<f64, OptimizeError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        let blocks: Result<Vec<Option<ResidualBlock>>, OptimizeError> = (0..self.experiments.len())
            .into_par_iter()
            .map(|idx| {
                let overrides = self.candidate_overrides(idx, candidate);
                let result = self.system.integrate(
                    &self.setups[idx],
                    Some(&overrides),
                    Some(&self.eval_times[idx]),
                    self.cancel.as_ref(),
                )?;

                if !result.status.is_complete() {
                    warn!(
                        "candidate simulation for experiment '{}' truncated ({:?})",
                        self.experiments[idx].id, result.status
                    );
                    return Ok(None);
                }

                Ok(Some(self.residual_block(idx, &result)))
            })
            .collect();

        let blocks = blocks?;
        if blocks.iter().any(|b| b.is_none()) {
            return Ok(f64::INFINITY);
        }

        let blocks: Vec<ResidualBlock> = blocks.into_iter().flatten().collect();
        self.objective.cost(&blocks)
    }

    /// Residuals of one simulated experiment against its measurements.
    /// Missing measured values (NaN) contribute zero residual.
    fn residual_block(&self, idx: usize, result: &SimulationResult) -> ResidualBlock {
        let measured = &self.measurements[idx];
        let (n_rows, n_cols) = measured.dim();
        let mut residuals = Array2::zeros((n_rows, n_cols));

        for (j, target) in self.targets[idx].iter().enumerate() {
            if let Some(curve) = result.get_curve(target) {
                for i in 0..n_rows.min(curve.len()) {
                    let measured_value = measured[(i, j)];
                    if measured_value.is_finite() {
                        residuals[(i, j)] = measured_value - curve[i];
                    }
                }
            }
        }

        ResidualBlock {
            residuals,
            weights: self.weights[idx].clone(),
            normalization: self.normalizations[idx],
        }
    }

    /// Simulates every experiment under a candidate, keyed by experiment id.
    pub fn fits(
        &self,
        candidate: &Array1<f64>,
    ) -> Result<HashMap<String, SimulationResult>, OptimizeError> {
        let mut fits = HashMap::new();
        for idx in 0..self.experiments.len() {
            let overrides = self.candidate_overrides(idx, candidate);
            let result = self.system.integrate(
                &self.setups[idx],
                Some(&overrides),
                Some(&self.eval_times[idx]),
                None,
            )?;
            fits.insert(self.experiments[idx].id.clone(), result);
        }
        Ok(fits)
    }
}

/// Cost interface used by both the built-in drivers and external solvers.
impl CostFunction for EstimationProblem {
    type Param = Array1<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.evaluate(param).map_err(argmin::core::Error::from)
    }
}

/// Numeric gradient by central differences, for gradient-based solvers.
impl Gradient for EstimationProblem {
    type Param = Array1<f64>;
    type Gradient = Array1<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let cost_fn = |x: &Array1<f64>| self.evaluate(x).unwrap_or(f64::INFINITY);
        Ok(param.central_diff(&cost_fn))
    }
}
