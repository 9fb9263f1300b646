//! kinfit: a deterministic chemical-kinetics engine.
//!
//! This library provides functionality for working with kinetic reaction
//! network models, including:
//! - A serializable model document (species, compartments, global
//!   quantities, symbolic rate-law templates, reactions, parameter sets)
//! - Simulation of the derived ODE system with adaptive integration and
//!   moiety-conservation reduction
//! - Steady-state resolution with stability analysis
//! - Parameter estimation against experimental CSV time courses
//! - Structural validation of model documents

#![warn(unused_imports)]

/// Commonly used types re-exported for convenience
pub mod prelude {
    pub use crate::experiment::*;
    pub use crate::io::*;
    pub use crate::model::*;

    pub use crate::simulation::error::{NumericsError, SimulationError, StopReason};
    pub use crate::simulation::integrator::{CancelToken, DormandPrince45, RhsSystem};
    pub use crate::simulation::rates::UndefinedPolicy;
    pub use crate::simulation::result::*;
    pub use crate::simulation::setup::*;
    pub use crate::simulation::system::{OdeSystem, PreparedRun};

    pub use crate::steady_state::*;

    pub use crate::optim::error::OptimizeError;
    pub use crate::optim::hooke::*;
    pub use crate::optim::objective::*;
    pub use crate::optim::optimizer::*;
    pub use crate::optim::problem::*;
    pub use crate::optim::pso::*;
    pub use crate::optim::report::FitReport;

    pub use crate::tasks::*;
    pub use crate::validation::{check_model, Report, Severity, ValidationResult};
}

/// Core model document and structural errors
pub mod model;

/// Expression compilation and evaluation
pub mod expr;

/// Assignment dependency resolution
pub mod graph;

/// Simulation of the derived ODE system
pub mod simulation {
    /// Error types for simulation failures
    pub mod error;
    /// Adaptive Runge–Kutta integration
    pub mod integrator;
    /// Kinetic law compilation and flux evaluation
    pub mod rates;
    /// Simulation result data structures
    pub mod result;
    /// Simulation setup and configuration
    pub mod setup;
    /// Stoichiometry and moiety conservation
    pub mod stoich;
    /// Core ODE system implementation
    pub mod system;
}

/// Steady-state resolution and stability analysis
pub mod steady_state;

/// Parameter estimation
pub mod optim {
    pub use crate::optim::error::OptimizeError;
    pub use crate::optim::optimizer::{InitialGuesses, Optimizer};
    pub use argmin::core::CostFunction;
    pub use argmin::core::Gradient;

    pub mod error;
    /// Hooke–Jeeves direct pattern search
    pub mod hooke;
    /// Objective functions over weighted residuals
    pub mod objective;
    /// The optimizer interface
    pub mod optimizer;
    /// The estimation problem
    pub mod problem;
    /// Particle swarm optimization
    pub mod pso;
    /// Estimation reports and write-back
    pub mod report;
}

/// Experimental time-course data
pub mod experiment;

/// Named computation tasks
pub mod tasks;

/// Validation of model documents
pub mod validation;

/// Model file I/O
pub mod io;

/// Built-in example model
pub mod demo;
