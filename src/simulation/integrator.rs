//! Adaptive explicit Runge–Kutta integration.
//!
//! The integrator advances `dy/dt = f(t, y)` with the Dormand–Prince 4(5)
//! embedded pair: the 5th-order solution propagates, the difference to the
//! 4th-order solution drives step-size control. Output values are produced at
//! caller-requested times by cubic Hermite interpolation between accepted
//! steps, so the internal step sequence is independent of the output grid.
//!
//! Truncation (step budget exhausted, step-size underflow, cancellation) is
//! reported alongside the partial trajectory instead of discarding the work
//! done so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{SimulationError, StopReason};

/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait RhsSystem {
    /// Number of state variables.
    fn dim(&self) -> usize;

    /// Evaluates `f(t, y)` into `dydt`. Both slices have length [`Self::dim`].
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError>;
}

/// Cooperative cancellation flag shared between a driver and a running
/// integration. Checked at step boundaries only; no work is interrupted
/// mid-step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The running computation stops at its next
    /// checkpoint and reports a partial result.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Raw integration output: states sampled at the requested output times.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub time: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

/// Why and where an integration stopped early.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Truncation {
    pub reason: StopReason,
    pub reached: f64,
    pub steps: usize,
}

/// Integration output together with an optional truncation record.
#[derive(Debug, Clone)]
pub struct IntegrationOutput {
    pub trajectory: Trajectory,
    pub truncated: Option<Truncation>,
}

/// Dormand–Prince 4(5) stepper configuration.
#[derive(Debug, Clone, Copy)]
pub struct DormandPrince45 {
    /// Relative error tolerance.
    pub rtol: f64,
    /// Absolute error tolerance.
    pub atol: f64,
    /// Smallest step the controller may take.
    pub h_min: f64,
    /// Internal step budget; exceeding it truncates the run.
    pub max_steps: usize,
    /// When set, disables error control and steps with this fixed width.
    pub fixed_step: Option<f64>,
}

impl Default for DormandPrince45 {
    fn default() -> Self {
        Self {
            rtol: 1e-6,
            atol: 1e-12,
            h_min: 1e-14,
            max_steps: 100_000,
            fixed_step: None,
        }
    }
}

// Dormand–Prince tableau
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights (propagated solution)
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 4th-order weights (error estimate)
const BH1: f64 = 5179.0 / 57600.0;
const BH3: f64 = 7571.0 / 16695.0;
const BH4: f64 = 393.0 / 640.0;
const BH5: f64 = -92097.0 / 339200.0;
const BH6: f64 = 187.0 / 2100.0;
const BH7: f64 = 1.0 / 40.0;

const E1: f64 = B1 - BH1;
const E3: f64 = B3 - BH3;
const E4: f64 = B4 - BH4;
const E5: f64 = B5 - BH5;
const E6: f64 = B6 - BH6;
const E7: f64 = -BH7;

impl DormandPrince45 {
    /// Integrates `sys` from `t0`, emitting states at `output_times`
    /// (ascending, all ≥ `t0`).
    ///
    /// Returns the trajectory and, when the run stopped early, a
    /// [`Truncation`] record; the trajectory then covers the output times
    /// reached before the stop. Hard evaluation failures (expression errors,
    /// domain errors) abort with `Err`.
    pub fn integrate<S: RhsSystem>(
        &self,
        sys: &S,
        y0: &[f64],
        t0: f64,
        output_times: &[f64],
        cancel: Option<&CancelToken>,
    ) -> Result<IntegrationOutput, SimulationError> {
        let n = sys.dim();
        let mut trajectory = Trajectory::default();

        let t1 = match output_times.last() {
            Some(t1) => *t1,
            None => {
                return Ok(IntegrationOutput {
                    trajectory,
                    truncated: None,
                })
            }
        };

        // Nothing to integrate: the state is empty at every time point.
        if n == 0 {
            for &t in output_times {
                trajectory.time.push(t);
                trajectory.states.push(Vec::new());
            }
            return Ok(IntegrationOutput {
                trajectory,
                truncated: None,
            });
        }

        let span = t1 - t0;
        let fuzz = 1e-12 * span.abs().max(1.0);
        let mut cursor = 0;

        // Output times at or before t0 take the initial state.
        while cursor < output_times.len() && output_times[cursor] <= t0 + fuzz {
            trajectory.time.push(output_times[cursor]);
            trajectory.states.push(y0.to_vec());
            cursor += 1;
        }

        if span <= 0.0 || cursor >= output_times.len() {
            return Ok(IntegrationOutput {
                trajectory,
                truncated: None,
            });
        }

        let mut t = t0;
        let mut y = y0.to_vec();
        let mut h = match self.fixed_step {
            Some(h) => h,
            None => (span * 1e-3).max(self.h_min).min(span),
        };

        let mut k1 = vec![0.0; n];
        let mut k2 = vec![0.0; n];
        let mut k3 = vec![0.0; n];
        let mut k4 = vec![0.0; n];
        let mut k5 = vec![0.0; n];
        let mut k6 = vec![0.0; n];
        let mut k7 = vec![0.0; n];
        let mut y_tmp = vec![0.0; n];
        let mut y_new = vec![0.0; n];

        sys.rhs(t, &y, &mut k1)?;

        let mut steps = 0;
        loop {
            if t >= t1 - fuzz {
                break;
            }

            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Ok(self.truncate(trajectory, StopReason::Cancelled, t, steps));
                }
            }

            if steps >= self.max_steps {
                return Ok(self.truncate(trajectory, StopReason::MaxStepsExceeded, t, steps));
            }

            h = h.min(t1 - t);

            for i in 0..n {
                y_tmp[i] = y[i] + h * A21 * k1[i];
            }
            sys.rhs(t + h / 5.0, &y_tmp, &mut k2)?;

            for i in 0..n {
                y_tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
            }
            sys.rhs(t + 3.0 * h / 10.0, &y_tmp, &mut k3)?;

            for i in 0..n {
                y_tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
            }
            sys.rhs(t + 4.0 * h / 5.0, &y_tmp, &mut k4)?;

            for i in 0..n {
                y_tmp[i] =
                    y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
            }
            sys.rhs(t + 8.0 * h / 9.0, &y_tmp, &mut k5)?;

            for i in 0..n {
                y_tmp[i] = y[i]
                    + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
            }
            sys.rhs(t + h, &y_tmp, &mut k6)?;

            for i in 0..n {
                y_new[i] = y[i]
                    + h * (B1 * k1[i] + B3 * k3[i] + B4 * k4[i] + B5 * k5[i] + B6 * k6[i]);
            }

            // FSAL stage, also the error-estimate tail
            sys.rhs(t + h, &y_new, &mut k7)?;

            steps += 1;

            let (accept, factor) = if self.fixed_step.is_some() {
                (true, 1.0)
            } else {
                let mut err_norm = 0.0;
                for i in 0..n {
                    let ei = h
                        * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i]
                            + E7 * k7[i]);
                    let scale = self.atol + self.rtol * y[i].abs().max(y_new[i].abs());
                    err_norm += (ei / scale) * (ei / scale);
                }
                err_norm = (err_norm / n as f64).sqrt();

                let factor = if err_norm == 0.0 {
                    5.0
                } else {
                    (0.9 * err_norm.powf(-0.2)).clamp(0.2, 5.0)
                };

                if err_norm <= 1.0 {
                    (true, factor)
                } else {
                    let h_next = h * factor;
                    if h_next < self.h_min {
                        return Ok(self.truncate(
                            trajectory,
                            StopReason::StepSizeUnderflow,
                            t,
                            steps,
                        ));
                    }
                    h = h_next;
                    (false, factor)
                }
            };

            if accept {
                // Hermite dense output over the accepted interval
                while cursor < output_times.len() && output_times[cursor] <= t + h + fuzz {
                    let tau = output_times[cursor];
                    let theta = ((tau - t) / h).clamp(0.0, 1.0);
                    trajectory.time.push(tau);
                    trajectory
                        .states
                        .push(hermite(theta, h, &y, &k1, &y_new, &k7));
                    cursor += 1;
                }

                t += h;
                if !y_new.iter().all(|v| v.is_finite()) {
                    return Err(super::error::NumericsError::NonFiniteState { time: t }.into());
                }
                y.copy_from_slice(&y_new);
                k1.copy_from_slice(&k7);

                if self.fixed_step.is_none() {
                    h = (h * factor).min(span);
                }
            }
        }

        // Floating-point fuzz can leave the final grid point unemitted.
        while cursor < output_times.len() {
            trajectory.time.push(output_times[cursor]);
            trajectory.states.push(y.clone());
            cursor += 1;
        }

        Ok(IntegrationOutput {
            trajectory,
            truncated: None,
        })
    }

    fn truncate(
        &self,
        trajectory: Trajectory,
        reason: StopReason,
        reached: f64,
        steps: usize,
    ) -> IntegrationOutput {
        IntegrationOutput {
            trajectory,
            truncated: Some(Truncation {
                reason,
                reached,
                steps,
            }),
        }
    }
}

/// Cubic Hermite interpolation on an accepted step `[t, t + h]` using the
/// state and derivative at both ends.
fn hermite(theta: f64, h: f64, y0: &[f64], f0: &[f64], y1: &[f64], f1: &[f64]) -> Vec<f64> {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + theta;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;

    y0.iter()
        .zip(f0)
        .zip(y1.iter().zip(f1))
        .map(|((y0, f0), (y1, f1))| h00 * y0 + h10 * h * f0 + h01 * y1 + h11 * h * f1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// dy/dt = -k y, solution y0 * exp(-k t)
    struct Decay {
        k: f64,
    }

    impl RhsSystem for Decay {
        fn dim(&self) -> usize {
            1
        }

        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
            dydt[0] = -self.k * y[0];
            Ok(())
        }
    }

    #[test]
    fn integrates_exponential_decay() {
        let stepper = DormandPrince45 {
            rtol: 1e-8,
            atol: 1e-12,
            ..Default::default()
        };
        let times: Vec<f64> = (0..=10).map(|i| i as f64).collect();
        let out = stepper
            .integrate(&Decay { k: 0.3 }, &[2.0], 0.0, &times, None)
            .unwrap();

        assert!(out.truncated.is_none());
        assert_eq!(out.trajectory.time.len(), times.len());
        for (t, y) in out.trajectory.time.iter().zip(&out.trajectory.states) {
            let exact = 2.0 * (-0.3 * t).exp();
            assert!((y[0] - exact).abs() < 1e-6, "t = {t}: {} vs {exact}", y[0]);
        }
    }

    #[test]
    fn fixed_step_matches_adaptive_on_smooth_problem() {
        let adaptive = DormandPrince45::default();
        let fixed = DormandPrince45 {
            fixed_step: Some(0.01),
            ..Default::default()
        };
        let times = vec![0.0, 1.0];
        let sys = Decay { k: 1.0 };

        let a = adaptive.integrate(&sys, &[1.0], 0.0, &times, None).unwrap();
        let f = fixed.integrate(&sys, &[1.0], 0.0, &times, None).unwrap();
        assert!((a.trajectory.states[1][0] - f.trajectory.states[1][0]).abs() < 1e-6);
    }

    #[test]
    fn exhausted_step_budget_returns_partial_trajectory() {
        let stepper = DormandPrince45 {
            fixed_step: Some(0.001),
            max_steps: 50,
            ..Default::default()
        };
        let times: Vec<f64> = (0..=10).map(|i| i as f64 * 0.01).collect();
        let out = stepper
            .integrate(&Decay { k: 1.0 }, &[1.0], 0.0, &times, None)
            .unwrap();

        let truncation = out.truncated.expect("run must be truncated");
        assert_eq!(truncation.reason, StopReason::MaxStepsExceeded);
        assert!(truncation.reached < 0.06);
        // everything before the stop is still there
        assert!(!out.trajectory.time.is_empty());
        assert!(out.trajectory.time.len() < times.len() + 1);
    }

    #[test]
    fn cancellation_stops_at_step_boundary() {
        let token = CancelToken::new();
        token.cancel();
        let stepper = DormandPrince45::default();
        let times = vec![0.0, 1.0];
        let out = stepper
            .integrate(&Decay { k: 1.0 }, &[1.0], 0.0, &times, Some(&token))
            .unwrap();

        let truncation = out.truncated.expect("cancelled run");
        assert_eq!(truncation.reason, StopReason::Cancelled);
    }

    #[test]
    fn empty_system_reproduces_grid() {
        struct Nothing;
        impl RhsSystem for Nothing {
            fn dim(&self) -> usize {
                0
            }
            fn rhs(&self, _: f64, _: &[f64], _: &mut [f64]) -> Result<(), SimulationError> {
                Ok(())
            }
        }

        let out = DormandPrince45::default()
            .integrate(&Nothing, &[], 0.0, &[0.0, 1.0, 2.0], None)
            .unwrap();
        assert_eq!(out.trajectory.time, vec![0.0, 1.0, 2.0]);
    }
}
