//! Configuration of ODE simulations.
//!
//! [`SimulationSetup`] collects everything that controls a numerical
//! integration run: the time window, the output grid spacing, error
//! tolerances, the internal step budget, whether to integrate the
//! conservation-reduced system, and how undefined operands in rate laws are
//! treated.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use super::error::SimulationError;
use super::integrator::DormandPrince45;
use super::rates::UndefinedPolicy;

/// Configuration for numerical integration of an ODE system.
///
/// # Examples
///
/// ```
/// use kinfit::simulation::setup::SimulationSetupBuilder;
///
/// let setup = SimulationSetupBuilder::default()
///     .t0(0.0)
///     .t1(100.0)
///     .dt(0.5)
///     .rtol(1e-8)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
pub struct SimulationSetup {
    /// Start time.
    #[serde(default)]
    #[builder(default = "0.0")]
    pub t0: f64,

    /// End time.
    #[serde(default = "default_t1")]
    #[builder(default = "10.0")]
    pub t1: f64,

    /// Output grid spacing.
    #[serde(default = "default_dt")]
    #[builder(default = "1.0")]
    pub dt: f64,

    /// Relative error tolerance.
    #[serde(default = "default_rtol")]
    #[builder(default = "1e-6")]
    pub rtol: f64,

    /// Absolute error tolerance.
    #[serde(default = "default_atol")]
    #[builder(default = "1e-12")]
    pub atol: f64,

    /// Internal step budget before the run is truncated.
    #[serde(default = "default_max_steps")]
    #[builder(default = "100_000")]
    pub max_steps: usize,

    /// Fixed internal step width; disables adaptive error control when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub fixed_step: Option<f64>,

    /// Integrate the moiety-conservation-reduced system.
    #[serde(default)]
    #[builder(default)]
    pub reduced: bool,

    /// How undefined operands in rate laws behave.
    #[serde(default)]
    #[builder(default)]
    pub undefined_policy: UndefinedPolicy,
}

fn default_t1() -> f64 {
    10.0
}

fn default_dt() -> f64 {
    1.0
}

fn default_rtol() -> f64 {
    1e-6
}

fn default_atol() -> f64 {
    1e-12
}

fn default_max_steps() -> usize {
    100_000
}

impl Default for SimulationSetup {
    fn default() -> Self {
        SimulationSetupBuilder::default().build().unwrap()
    }
}

impl SimulationSetup {
    /// Validates the time window and tolerances.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !self.t0.is_finite() || !self.t1.is_finite() || self.t1 < self.t0 {
            return Err(SimulationError::InvalidSetup(format!(
                "invalid time window [{}, {}]",
                self.t0, self.t1
            )));
        }
        if self.dt <= 0.0 {
            return Err(SimulationError::InvalidSetup(format!(
                "output spacing must be positive, got {}",
                self.dt
            )));
        }
        if self.rtol <= 0.0 || self.atol <= 0.0 {
            return Err(SimulationError::InvalidSetup(format!(
                "tolerances must be positive, got rtol = {}, atol = {}",
                self.rtol, self.atol
            )));
        }
        if let Some(h) = self.fixed_step {
            if h <= 0.0 {
                return Err(SimulationError::InvalidSetup(format!(
                    "fixed step must be positive, got {h}"
                )));
            }
        }
        Ok(())
    }

    /// The output time grid `t0, t0 + dt, ..., t1` (always ending at `t1`).
    pub fn output_times(&self) -> Vec<f64> {
        let span = self.t1 - self.t0;
        if span <= 0.0 {
            return vec![self.t0];
        }
        let n = (span / self.dt).round().max(1.0) as usize;
        let mut times: Vec<f64> = (0..n).map(|i| self.t0 + i as f64 * self.dt).collect();
        // guard against accumulation drift on the final point
        times.retain(|t| *t < self.t1);
        times.push(self.t1);
        times
    }

    /// The stepper configured by this setup.
    pub(crate) fn stepper(&self) -> DormandPrince45 {
        DormandPrince45 {
            rtol: self.rtol,
            atol: self.atol,
            max_steps: self.max_steps,
            fixed_step: self.fixed_step,
            ..DormandPrince45::default()
        }
    }

    /// Copies the numerical settings (spacing, tolerances, budget) from
    /// another setup while keeping this time window.
    pub fn merge(&mut self, other: &SimulationSetup) {
        self.dt = other.dt;
        self.rtol = other.rtol;
        self.atol = other.atol;
        self.max_steps = other.max_steps;
        self.fixed_step = other.fixed_step;
        self.reduced = other.reduced;
        self.undefined_policy = other.undefined_policy;
    }
}
