//! Steady-state resolution and stability analysis.
//!
//! Finds a state with `f(y) = 0` using a chain of independently toggleable
//! strategies, tried in order: damped Newton iteration, forward integration
//! over geometrically growing horizons, and backward integration (negated
//! right-hand side). When the model carries conserved moieties the search
//! runs in the conservation-reduced coordinates, where the Jacobian is not
//! structurally singular.
//!
//! Failing to converge is a reportable outcome, not an error: the result
//! carries the last iterate and its residual norm together with a
//! `NotConverged` status.

use std::collections::HashMap;

use derive_builder::Builder;
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::simulation::error::SimulationError;
use crate::simulation::integrator::{CancelToken, DormandPrince45, RhsSystem};
use crate::simulation::rates::UndefinedPolicy;
use crate::simulation::system::{OdeSystem, PreparedRun, ReducedRhs};

/// Configuration of the steady-state search.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct SteadyStateSettings {
    /// Attempt damped Newton iteration.
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub use_newton: bool,

    /// Fall back to forward integration.
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub use_integration: bool,

    /// Fall back to backward integration (unstable states).
    #[serde(default)]
    #[builder(default)]
    pub use_back_integration: bool,

    /// Residual norm below which a state counts as steady.
    #[serde(default = "default_tolerance")]
    #[builder(default = "1e-9")]
    pub tolerance: f64,

    /// Newton iteration budget per attempt.
    #[serde(default = "default_max_iterations")]
    #[builder(default = "50")]
    pub max_iterations: usize,

    /// Newton step damping factor.
    #[serde(default = "default_damping")]
    #[builder(default = "1.0")]
    pub damping: f64,

    /// Longest integration horizon tried by the fallbacks.
    #[serde(default = "default_max_duration")]
    #[builder(default = "1e9")]
    pub max_duration: f64,

    /// Search in conservation-reduced coordinates when possible.
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub reduced: bool,

    /// Relative tolerance for the fallback integrations.
    #[serde(default = "default_rtol")]
    #[builder(default = "1e-6")]
    pub rtol: f64,

    /// Absolute tolerance for the fallback integrations.
    #[serde(default = "default_atol")]
    #[builder(default = "1e-12")]
    pub atol: f64,

    /// How undefined operands in rate laws behave.
    #[serde(default)]
    #[builder(default)]
    pub undefined_policy: UndefinedPolicy,
}

fn default_true() -> bool {
    true
}
fn default_tolerance() -> f64 {
    1e-9
}
fn default_max_iterations() -> usize {
    50
}
fn default_damping() -> f64 {
    1.0
}
fn default_max_duration() -> f64 {
    1e9
}
fn default_rtol() -> f64 {
    1e-6
}
fn default_atol() -> f64 {
    1e-12
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        SteadyStateSettingsBuilder::default().build().unwrap()
    }
}

/// Which strategy produced the converged state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteadyStateMethod {
    Newton,
    ForwardIntegration,
    BackwardIntegration,
}

/// Outcome of the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteadyStateStatus {
    Converged { method: SteadyStateMethod },
    NotConverged,
    Cancelled,
}

/// Linear stability classification from the Jacobian eigenvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityClass {
    /// All eigenvalues have negative real part.
    Stable,
    /// All eigenvalues have positive real part.
    Unstable,
    /// Mixed signs.
    Saddle,
    /// At least one real part too close to zero to call.
    Undetermined,
}

/// Result of a steady-state search.
#[derive(Debug, Clone, Serialize)]
pub struct SteadyStateResult {
    /// Entity id → value at the final iterate.
    pub state: HashMap<String, f64>,
    /// Residual norm ‖f(y)‖ at the final iterate.
    pub residual_norm: f64,
    /// Newton iterations spent (0 when the start was already steady).
    pub iterations: usize,
    pub status: SteadyStateStatus,
    /// Stability classification; only present after convergence.
    pub stability: Option<StabilityClass>,
    /// Jacobian eigenvalues as `(re, im)` pairs; only present after
    /// convergence.
    pub eigenvalues: Vec<(f64, f64)>,
}

/// Classifies stability from eigenvalues, with a relative dead band around
/// zero real parts.
pub fn classify_stability(eigenvalues: &[(f64, f64)]) -> StabilityClass {
    if eigenvalues.is_empty() {
        return StabilityClass::Undetermined;
    }

    let magnitude = eigenvalues
        .iter()
        .map(|(re, im)| re.hypot(*im))
        .fold(0.0f64, f64::max);
    let dead_band = 1e-9 * magnitude.max(1.0);

    let mut negative = 0;
    let mut positive = 0;
    for (re, _) in eigenvalues {
        if re.abs() <= dead_band {
            return StabilityClass::Undetermined;
        }
        if *re < 0.0 {
            negative += 1;
        } else {
            positive += 1;
        }
    }

    match (negative, positive) {
        (_, 0) => StabilityClass::Stable,
        (0, _) => StabilityClass::Unstable,
        _ => StabilityClass::Saddle,
    }
}

/// Searches for a steady state of the prepared system.
///
/// Strategies run in the order Newton → forward integration → backward
/// integration, each only if enabled. Integration fallbacks re-attempt
/// Newton from the integrated state when Newton is enabled.
pub fn solve_steady_state(
    system: &OdeSystem,
    settings: &SteadyStateSettings,
    overrides: Option<&HashMap<String, f64>>,
    cancel: Option<&CancelToken>,
) -> Result<SteadyStateResult, SimulationError> {
    let run = system.prepare(overrides, 0.0, settings.undefined_policy)?;

    let reduced = (settings.reduced && !system.conservation().is_trivial())
        .then(|| ReducedRhs::new(&run));
    let full_search = FullSearch { run: &run };

    let search: &dyn RhsSystem = match &reduced {
        Some(reduced) => reduced,
        None => &full_search,
    };
    let y_start = match &reduced {
        Some(reduced) => reduced.project(&run.y0),
        None => run.y0.clone(),
    };

    let mut best = y_start.clone();
    let mut best_norm = residual_norm(search, &best)?;
    let mut iterations = 0;
    let mut method = None;

    if best_norm <= settings.tolerance {
        method = Some(SteadyStateMethod::Newton);
    }

    if method.is_none() && settings.use_newton {
        match newton(search, &best, settings, cancel)? {
            NewtonOutcome::Converged { state, norm, iters } => {
                best = state;
                best_norm = norm;
                iterations = iters;
                method = Some(SteadyStateMethod::Newton);
            }
            NewtonOutcome::Cancelled => {
                return Ok(finish_cancelled(system, &reduced, best, best_norm, iterations));
            }
            NewtonOutcome::Failed { state, norm, iters } => {
                debug!("newton did not converge (residual {norm:.3e} after {iters} iterations)");
                if norm < best_norm {
                    best = state;
                    best_norm = norm;
                }
                iterations = iters;
            }
        }
    }

    if method.is_none() && settings.use_integration {
        if let Some(outcome) =
            integrate_towards(search, &best, settings, false, cancel)?
        {
            match outcome {
                IntegrationOutcome::Cancelled => {
                    return Ok(finish_cancelled(system, &reduced, best, best_norm, iterations));
                }
                IntegrationOutcome::Reached { state, norm } => {
                    best = state;
                    best_norm = norm;
                    method = Some(SteadyStateMethod::ForwardIntegration);
                }
                IntegrationOutcome::NewtonPolished { state, norm, iters } => {
                    best = state;
                    best_norm = norm;
                    iterations += iters;
                    method = Some(SteadyStateMethod::Newton);
                }
                IntegrationOutcome::Closer { state, norm } => {
                    if norm < best_norm {
                        best = state;
                        best_norm = norm;
                    }
                }
            }
        }
    }

    if method.is_none() && settings.use_back_integration {
        if let Some(outcome) = integrate_towards(search, &best, settings, true, cancel)? {
            match outcome {
                IntegrationOutcome::Cancelled => {
                    return Ok(finish_cancelled(system, &reduced, best, best_norm, iterations));
                }
                IntegrationOutcome::Reached { state, norm } => {
                    best = state;
                    best_norm = norm;
                    method = Some(SteadyStateMethod::BackwardIntegration);
                }
                IntegrationOutcome::NewtonPolished { state, norm, iters } => {
                    best = state;
                    best_norm = norm;
                    iterations += iters;
                    method = Some(SteadyStateMethod::Newton);
                }
                IntegrationOutcome::Closer { state, norm } => {
                    if norm < best_norm {
                        best = state;
                        best_norm = norm;
                    }
                }
            }
        }
    }

    let full_state = expand_state(&reduced, &best);
    let state_map = state_map(system, &full_state);

    match method {
        Some(method) => {
            let jacobian = search_jacobian(search, &best)?;
            let eigenvalues: Vec<(f64, f64)> = jacobian
                .complex_eigenvalues()
                .iter()
                .map(|c| (c.re, c.im))
                .collect();
            let stability = classify_stability(&eigenvalues);

            Ok(SteadyStateResult {
                state: state_map,
                residual_norm: best_norm,
                iterations,
                status: SteadyStateStatus::Converged { method },
                stability: Some(stability),
                eigenvalues,
            })
        }
        None => Ok(SteadyStateResult {
            state: state_map,
            residual_norm: best_norm,
            iterations,
            status: SteadyStateStatus::NotConverged,
            stability: None,
            eigenvalues: Vec::new(),
        }),
    }
}

struct FullSearch<'a, 'b> {
    run: &'b PreparedRun<'a>,
}

impl RhsSystem for FullSearch<'_, '_> {
    fn dim(&self) -> usize {
        self.run.dim()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        self.run.rhs(t, y, dydt)
    }
}

/// Negated right-hand side, for backward integration.
struct Reversed<'a> {
    inner: &'a dyn RhsSystem,
}

impl RhsSystem for Reversed<'_> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        self.inner.rhs(t, y, dydt)?;
        for v in dydt.iter_mut() {
            *v = -*v;
        }
        Ok(())
    }
}

fn residual_norm(system: &dyn RhsSystem, y: &[f64]) -> Result<f64, SimulationError> {
    let mut f = vec![0.0; system.dim()];
    system.rhs(0.0, y, &mut f)?;
    Ok(f.iter().map(|v| v * v).sum::<f64>().sqrt())
}

fn search_jacobian(system: &dyn RhsSystem, y: &[f64]) -> Result<DMatrix<f64>, SimulationError> {
    let n = system.dim();
    let mut jac = DMatrix::zeros(n, n);
    let mut probe = y.to_vec();
    let mut f_plus = vec![0.0; n];
    let mut f_minus = vec![0.0; n];

    for j in 0..n {
        let orig = probe[j];
        let h = 1e-8 * (1.0 + orig.abs());
        probe[j] = orig + h;
        system.rhs(0.0, &probe, &mut f_plus)?;
        probe[j] = orig - h;
        system.rhs(0.0, &probe, &mut f_minus)?;
        probe[j] = orig;

        for i in 0..n {
            jac[(i, j)] = (f_plus[i] - f_minus[i]) / (2.0 * h);
        }
    }

    Ok(jac)
}

enum NewtonOutcome {
    Converged {
        state: Vec<f64>,
        norm: f64,
        iters: usize,
    },
    Failed {
        state: Vec<f64>,
        norm: f64,
        iters: usize,
    },
    Cancelled,
}

fn newton(
    system: &dyn RhsSystem,
    y_start: &[f64],
    settings: &SteadyStateSettings,
    cancel: Option<&CancelToken>,
) -> Result<NewtonOutcome, SimulationError> {
    let n = system.dim();
    let mut state = y_start.to_vec();
    let mut residual = vec![0.0; n];
    system.rhs(0.0, &state, &mut residual)?;
    let mut norm = l2(&residual);
    let start_norm = norm;
    let mut iters = 0;

    loop {
        if norm <= settings.tolerance {
            return Ok(NewtonOutcome::Converged { state, norm, iters });
        }
        if iters >= settings.max_iterations {
            return Ok(NewtonOutcome::Failed { state, norm, iters });
        }
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Ok(NewtonOutcome::Cancelled);
            }
        }
        // divergence guard
        if norm > 1e6 * start_norm.max(settings.tolerance) || !norm.is_finite() {
            return Ok(NewtonOutcome::Failed { state, norm, iters });
        }

        let jacobian = search_jacobian(system, &state)?;
        let rhs = DVector::from_column_slice(&residual);
        let delta = match jacobian.lu().solve(&rhs) {
            Some(delta) => delta,
            None => {
                debug!("newton: singular jacobian, giving up");
                return Ok(NewtonOutcome::Failed { state, norm, iters });
            }
        };

        for (value, d) in state.iter_mut().zip(delta.iter()) {
            *value -= settings.damping * d;
        }

        iters += 1;
        system.rhs(0.0, &state, &mut residual)?;
        norm = l2(&residual);
    }
}

enum IntegrationOutcome {
    /// Residual dropped below tolerance at the end of a horizon.
    Reached { state: Vec<f64>, norm: f64 },
    /// A Newton polish from the integrated state converged.
    NewtonPolished {
        state: Vec<f64>,
        norm: f64,
        iters: usize,
    },
    /// Ran out of horizons; this is the closest state seen.
    Closer { state: Vec<f64>, norm: f64 },
    Cancelled,
}

fn integrate_towards(
    system: &dyn RhsSystem,
    y_start: &[f64],
    settings: &SteadyStateSettings,
    backwards: bool,
    cancel: Option<&CancelToken>,
) -> Result<Option<IntegrationOutcome>, SimulationError> {
    let stepper = DormandPrince45 {
        rtol: settings.rtol,
        atol: settings.atol,
        ..Default::default()
    };
    let reversed = Reversed { inner: system };
    let target: &dyn RhsSystem = if backwards { &reversed } else { system };

    let mut state = y_start.to_vec();
    let mut best: Option<(Vec<f64>, f64)> = None;
    let mut horizon = 1.0;

    while horizon <= settings.max_duration {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Ok(Some(IntegrationOutcome::Cancelled));
            }
        }

        let times = [0.0, horizon];
        let out = stepper.integrate(&DynRhs(target), &state, 0.0, &times, cancel)?;
        if let Some(last) = out.trajectory.states.last() {
            state = last.clone();
        }
        if out.truncated.is_some() {
            debug!("steady-state integration truncated at horizon {horizon:.1e}");
            break;
        }

        let norm = residual_norm(system, &state)?;
        if norm <= settings.tolerance {
            return Ok(Some(IntegrationOutcome::Reached { state, norm }));
        }

        if settings.use_newton {
            if let NewtonOutcome::Converged {
                state: polished,
                norm,
                iters,
            } = newton(system, &state, settings, cancel)?
            {
                return Ok(Some(IntegrationOutcome::NewtonPolished {
                    state: polished,
                    norm,
                    iters,
                }));
            }
        }

        if best.as_ref().map(|(_, b)| norm < *b).unwrap_or(true) {
            best = Some((state.clone(), norm));
        }
        horizon *= 10.0;
    }

    Ok(best.map(|(state, norm)| IntegrationOutcome::Closer { state, norm }))
}

/// Object-safe wrapper so a `&dyn RhsSystem` can drive the generic stepper.
struct DynRhs<'a>(&'a dyn RhsSystem);

impl RhsSystem for DynRhs<'_> {
    fn dim(&self) -> usize {
        self.0.dim()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        self.0.rhs(t, y, dydt)
    }
}

fn l2(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn expand_state(reduced: &Option<ReducedRhs>, y: &[f64]) -> Vec<f64> {
    match reduced {
        Some(reduced) => reduced.expand(y),
        None => y.to_vec(),
    }
}

fn state_map(system: &OdeSystem, full_state: &[f64]) -> HashMap<String, f64> {
    system
        .state_ids()
        .iter()
        .cloned()
        .zip(full_state.iter().copied())
        .collect()
}

fn finish_cancelled(
    system: &OdeSystem,
    reduced: &Option<ReducedRhs>,
    best: Vec<f64>,
    best_norm: f64,
    iterations: usize,
) -> SteadyStateResult {
    let full_state = expand_state(reduced, &best);
    SteadyStateResult {
        state: state_map(system, &full_state),
        residual_norm: best_norm,
        iterations,
        status: SteadyStateStatus::Cancelled,
        stability: None,
        eigenvalues: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_eigenvalue_patterns() {
        assert_eq!(
            classify_stability(&[(-1.0, 0.0), (-0.5, 0.2)]),
            StabilityClass::Stable
        );
        assert_eq!(
            classify_stability(&[(1.0, 0.0), (0.5, 0.0)]),
            StabilityClass::Unstable
        );
        assert_eq!(
            classify_stability(&[(-1.0, 0.0), (0.5, 0.0)]),
            StabilityClass::Saddle
        );
        assert_eq!(
            classify_stability(&[(-1.0, 0.0), (1e-15, 0.0)]),
            StabilityClass::Undetermined
        );
    }
}
