//! Error types for the simulation layer.
//!
//! Two families of failures are kept apart on purpose:
//!
//! - Structural and numerical-domain defects ([`crate::model::StructureError`],
//!   [`NumericsError`]) abort an evaluation; they indicate the model itself
//!   cannot be computed.
//! - Integration truncation (step budget exhausted, step-size underflow,
//!   cooperative cancellation) is *data*, not an error: the integrator hands
//!   back the partial trajectory and the simulation result carries a status
//!   flag, so tasks can report best-effort results.

use thiserror::Error;

use crate::model::StructureError;

/// Why an integration stopped before reaching the requested end time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The internal step budget was exhausted.
    MaxStepsExceeded,
    /// The controller pushed the step size below the configured minimum.
    StepSizeUnderflow,
    /// A cancellation token was triggered at a step boundary.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::MaxStepsExceeded => write!(f, "maximum number of internal steps exceeded"),
            StopReason::StepSizeUnderflow => write!(f, "step size underflow"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Numerical-domain failures raised while evaluating rate laws or assembling
/// a state vector.
#[derive(Error, Debug)]
pub enum NumericsError {
    #[error("rate law of reaction '{reaction}' evaluated to {value} with finite inputs (non-physical denominator?)")]
    NonPhysicalDenominator { reaction: String, value: f64 },

    #[error("undefined operand feeding the rate law of reaction '{reaction}'")]
    UndefinedOperand { reaction: String },

    #[error("initial value of integrated entity '{entity}' is undefined")]
    UndefinedInitialValue { entity: String },

    #[error("state became non-finite at t = {time}")]
    NonFiniteState { time: f64 },
}

/// Errors raised while building or evaluating an ODE system.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Numerics(#[from] NumericsError),

    #[error("error evaluating expression: {0}")]
    Expression(#[from] evalexpr::EvalexprError),

    #[error("simulation setup is invalid: {0}")]
    InvalidSetup(String),
}
