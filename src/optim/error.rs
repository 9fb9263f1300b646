use thiserror::Error;

use crate::experiment::ExperimentError;
use crate::model::StructureError;
use crate::simulation::error::SimulationError;

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("no parameters to fit")]
    NoFitItems,

    #[error("fit item '{0}' does not name a model entity")]
    UnknownParameter(String),

    #[error("invalid bounds for '{param}': [{lower}, {upper}]")]
    InvalidBounds {
        param: String,
        lower: f64,
        upper: f64,
    },

    #[error("start value {start} of '{param}' lies outside [{lower}, {upper}]")]
    StartOutOfBounds {
        param: String,
        start: f64,
        lower: f64,
        upper: f64,
    },

    #[error("initial guess has length {found}, expected {expected}")]
    InitialGuessLength { expected: usize, found: usize },

    #[error("no experiments to fit against")]
    NoExperiments,

    #[error("experiment '{0}' has no dependent columns")]
    NoDependentColumns(String),

    #[error("cost is NaN")]
    CostNaN,

    #[error("no solution found")]
    NoSolution,

    #[error("optimizer error")]
    ArgMinError(argmin::core::Error),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error("failed to simulate with candidate parameters: {0}")]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),
}
