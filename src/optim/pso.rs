//! Particle swarm optimization via `argmin`.
//!
//! A population-based global search useful when the start values are far
//! from the optimum or the objective has several basins; the swarm explores
//! the whole parameter box, at the price of many more candidate
//! evaluations than the pattern search.

use argmin::core::observers::ObserverMode;
use argmin::core::{Executor, State};
use argmin::solver::particleswarm::ParticleSwarm;
use argmin_observer_slog::SlogLogger;
use ndarray::Array1;

use super::error::OptimizeError;
use super::hooke::DriverState;
use super::optimizer::{InitialGuesses, Optimizer};
use super::problem::EstimationProblem;
use super::report::FitReport;

/// Particle swarm configuration.
pub struct ParticleSwarmOpt {
    /// Swarm size.
    pub pop_size: usize,
    /// Iteration budget.
    pub max_iters: u64,
    /// Log iteration progress to the terminal.
    pub verbose: bool,
}

impl Optimizer for ParticleSwarmOpt {
    /// Runs the swarm over the problem's parameter box.
    ///
    /// The initial guess is ignored; the swarm seeds itself from the
    /// bounds.
    fn optimize<T>(
        &self,
        problem: &EstimationProblem,
        _: Option<T>,
    ) -> Result<FitReport, OptimizeError>
    where
        T: Into<InitialGuesses>,
    {
        let bounds = (problem.lower_bounds(), problem.upper_bounds());
        let solver = ParticleSwarm::new(bounds, self.pop_size);

        let mut executor = Executor::new(problem.clone(), solver)
            .configure(|state| state.max_iters(self.max_iters));
        if self.verbose {
            executor = executor.add_observer(SlogLogger::term(), ObserverMode::Always);
        }

        let mut res = executor.run().map_err(OptimizeError::ArgMinError)?;

        let best = res
            .state
            .take_best_individual()
            .ok_or(OptimizeError::NoSolution)?;

        let best_params: Array1<f64> = best.position;
        let best_cost = best.cost;
        let iterations = res.state.get_iter();

        FitReport::new(
            problem,
            best_params,
            best_cost,
            iterations,
            DriverState::IterationLimitReached,
        )
    }
}

/// Builder for [`ParticleSwarmOpt`] instances.
pub struct PSOBuilder {
    pop_size: usize,
    max_iters: u64,
    verbose: bool,
}

impl Default for PSOBuilder {
    /// Default values:
    /// - pop_size: 40
    /// - max_iters: 200
    fn default() -> Self {
        Self {
            pop_size: 40,
            max_iters: 200,
            verbose: false,
        }
    }
}

impl PSOBuilder {
    pub fn pop_size(mut self, pop_size: usize) -> Self {
        self.pop_size = pop_size;
        self
    }

    pub fn max_iters(mut self, max_iters: u64) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn build(self) -> ParticleSwarmOpt {
        ParticleSwarmOpt {
            pop_size: self.pop_size,
            max_iters: self.max_iters,
            verbose: self.verbose,
        }
    }
}
