//! The optimizer interface and initial-guess handling.

use ndarray::Array1;

use super::error::OptimizeError;
use super::problem::EstimationProblem;
use super::report::FitReport;

/// Interface all fitting algorithms implement.
pub trait Optimizer {
    /// Runs the algorithm on a problem, starting from `initial_guess` (or
    /// the problem's declared start values when `None`).
    fn optimize<T>(
        &self,
        problem: &EstimationProblem,
        initial_guess: Option<T>,
    ) -> Result<FitReport, OptimizeError>
    where
        T: Into<InitialGuesses>;
}

/// Wrapper for an initial parameter vector in problem order.
#[derive(Debug, Clone)]
pub struct InitialGuesses(pub Array1<f64>);

impl InitialGuesses {
    pub fn get_values(self) -> Array1<f64> {
        self.0
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks the guess length against the problem's parameter count.
    pub fn validate(&self, problem: &EstimationProblem) -> Result<(), OptimizeError> {
        if self.0.len() != problem.n_params() {
            return Err(OptimizeError::InitialGuessLength {
                expected: problem.n_params(),
                found: self.0.len(),
            });
        }
        Ok(())
    }
}

impl From<Array1<f64>> for InitialGuesses {
    fn from(values: Array1<f64>) -> Self {
        InitialGuesses(values)
    }
}

impl From<Vec<f64>> for InitialGuesses {
    fn from(values: Vec<f64>) -> Self {
        InitialGuesses(Array1::from_vec(values))
    }
}

impl From<&EstimationProblem> for InitialGuesses {
    /// The problem's declared start values.
    fn from(problem: &EstimationProblem) -> Self {
        InitialGuesses(problem.starts())
    }
}

/// Resolves an optional guess to a concrete, validated vector.
pub(crate) fn resolve_initial_guess<T>(
    problem: &EstimationProblem,
    initial_guess: Option<T>,
) -> Result<Array1<f64>, OptimizeError>
where
    T: Into<InitialGuesses>,
{
    let guesses = initial_guess
        .map(Into::into)
        .unwrap_or_else(|| InitialGuesses::from(problem));
    guesses.validate(problem)?;
    Ok(guesses.get_values())
}
