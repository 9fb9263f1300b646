//! Hooke–Jeeves direct pattern search.
//!
//! A derivative-free minimizer well suited to objectives backed by
//! numerical integration, where gradients are noisy and expensive.
//! Exploratory moves probe each parameter axis with a per-parameter step
//! (a fraction of the box width); a successful exploration triggers pattern
//! moves along the improvement direction; failures halve the steps. The
//! search terminates when the largest relative step falls below the
//! tolerance or the iteration budget is exhausted.
//!
//! Probes outside the parameter box are rejected outright; pattern bases
//! are clamped back into the box. Out-of-box candidates are never
//! evaluated.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::error::OptimizeError;
use super::optimizer::{resolve_initial_guess, InitialGuesses, Optimizer};
use super::problem::EstimationProblem;
use super::report::FitReport;

/// Driver progression of an estimation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Initializing,
    Evaluating,
    /// Step size fell below the tolerance.
    Converged,
    IterationLimitReached,
    /// Cancelled cooperatively between candidate evaluations.
    Aborted,
}

/// Hooke–Jeeves configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HookeJeeves {
    /// Initial step as a fraction of each parameter's box width.
    pub rho: f64,
    /// Relative step size below which the search terminates.
    pub step_tolerance: f64,
    /// Iteration budget (one iteration = one exploration round).
    pub max_iterations: u64,
    /// Render a progress bar while running.
    pub show_progress: bool,
}

impl Default for HookeJeeves {
    fn default() -> Self {
        HookeJeevesBuilder::default().build()
    }
}

/// Builder for [`HookeJeeves`] instances.
pub struct HookeJeevesBuilder {
    rho: f64,
    step_tolerance: f64,
    max_iterations: u64,
    show_progress: bool,
}

impl Default for HookeJeevesBuilder {
    /// Default values:
    /// - rho: 0.1
    /// - step_tolerance: 1e-6
    /// - max_iterations: 500
    fn default() -> Self {
        Self {
            rho: 0.1,
            step_tolerance: 1e-6,
            max_iterations: 500,
            show_progress: false,
        }
    }
}

impl HookeJeevesBuilder {
    pub fn rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn step_tolerance(mut self, step_tolerance: f64) -> Self {
        self.step_tolerance = step_tolerance;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn build(self) -> HookeJeeves {
        HookeJeeves {
            rho: self.rho,
            step_tolerance: self.step_tolerance,
            max_iterations: self.max_iterations,
            show_progress: self.show_progress,
        }
    }
}

impl Optimizer for HookeJeeves {
    fn optimize<T>(
        &self,
        problem: &EstimationProblem,
        initial_guess: Option<T>,
    ) -> Result<FitReport, OptimizeError>
    where
        T: Into<InitialGuesses>,
    {
        let mut base = resolve_initial_guess(problem, initial_guess)?;
        problem.clamp(&mut base);

        let lower = problem.lower_bounds();
        let upper = problem.upper_bounds();
        let ranges: Vec<f64> = lower
            .iter()
            .zip(upper.iter())
            .map(|(l, u)| u - l)
            .collect();
        let mut steps: Vec<f64> = ranges.iter().map(|r| self.rho * r).collect();

        let mut f_base = problem.evaluate(&base)?;
        let mut iterations = 0u64;

        let progress = self.show_progress.then(|| {
            let bar = ProgressBar::new(self.max_iterations);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {pos}/{len} iterations, best {msg}",
                )
                .unwrap(),
            );
            bar
        });

        let termination = loop {
            if iterations >= self.max_iterations {
                break DriverState::IterationLimitReached;
            }
            if let Some(token) = problem.cancel_token() {
                if token.is_cancelled() {
                    break DriverState::Aborted;
                }
            }

            let (candidate, f_candidate) = self.explore(problem, &base, f_base, &steps)?;

            if f_candidate < f_base {
                // pattern moves: keep marching along the improvement vector
                let mut previous = base.clone();
                base = candidate;
                f_base = f_candidate;

                loop {
                    let mut pattern = &base * 2.0 - &previous;
                    problem.clamp(&mut pattern);
                    let f_pattern = problem.evaluate(&pattern)?;
                    let (next, f_next) = self.explore(problem, &pattern, f_pattern, &steps)?;

                    if f_next < f_base {
                        previous = std::mem::replace(&mut base, next);
                        f_base = f_next;
                    } else {
                        break;
                    }
                }
            } else {
                for step in steps.iter_mut() {
                    *step *= 0.5;
                }

                let largest_relative = steps
                    .iter()
                    .zip(&ranges)
                    .filter(|(_, r)| **r > 0.0)
                    .map(|(s, r)| s / r)
                    .fold(0.0f64, f64::max);
                if largest_relative < self.step_tolerance {
                    break DriverState::Converged;
                }
            }

            iterations += 1;
            if let Some(bar) = &progress {
                bar.set_position(iterations);
                bar.set_message(format!("{f_base:.6e}"));
            }
            debug!("iteration {iterations}: objective {f_base:.6e}");
        };

        if let Some(bar) = &progress {
            bar.finish_and_clear();
        }
        info!(
            "pattern search finished: {termination:?} after {iterations} iterations, objective {f_base:.6e}"
        );

        FitReport::new(problem, base, f_base, iterations, termination)
    }
}

impl HookeJeeves {
    /// One exploratory sweep: probe each axis in both directions, keeping
    /// improvements. Probes leaving the box are rejected, not clamped.
    fn explore(
        &self,
        problem: &EstimationProblem,
        origin: &Array1<f64>,
        f_origin: f64,
        steps: &[f64],
    ) -> Result<(Array1<f64>, f64), OptimizeError> {
        let mut best = origin.clone();
        let mut f_best = f_origin;

        for (i, step) in steps.iter().enumerate() {
            if *step <= 0.0 {
                continue;
            }

            for direction in [1.0, -1.0] {
                let mut probe = best.clone();
                probe[i] += direction * step;
                if !problem.within_bounds(&probe) {
                    continue;
                }
                let f_probe = problem.evaluate(&probe)?;
                if f_probe < f_best {
                    best = probe;
                    f_best = f_probe;
                    break;
                }
            }
        }

        Ok((best, f_best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let solver = HookeJeevesBuilder::default()
            .rho(0.25)
            .max_iterations(42)
            .build();
        assert_eq!(solver.rho, 0.25);
        assert_eq!(solver.max_iterations, 42);
        assert_eq!(solver.step_tolerance, 1e-6);
    }
}
