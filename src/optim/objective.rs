//! Objective functions over weighted residual blocks.
//!
//! Each experiment contributes one [`ResidualBlock`]: a points × columns
//! residual matrix, per-column weights, and a normalization factor. The loss
//! functions reduce the blocks to a single scalar cost. The enum delegates
//! to the individual implementations so the loss can be chosen at runtime
//! (and serialized as part of a task configuration).

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::error::OptimizeError;

/// Weighted residuals of one experiment.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    /// `measured − simulated`, rows are time points, columns are observables.
    pub residuals: Array2<f64>,
    /// One weight per column.
    pub weights: Array1<f64>,
    /// Multiplier applied to this block's contribution (1 when the
    /// experiment is not normalized).
    pub normalization: f64,
}

impl ResidualBlock {
    /// Weighted sum of squared residuals of this block.
    fn weighted_sum_of_squares(&self) -> f64 {
        let mut sum = 0.0;
        for (j, column) in self.residuals.columns().into_iter().enumerate() {
            let weight = self.weights[j];
            sum += weight * column.iter().map(|r| r * r).sum::<f64>();
        }
        self.normalization * sum
    }

    fn n_points(&self) -> usize {
        self.residuals.len()
    }
}

/// Scalar objective over a set of residual blocks.
pub trait ObjectiveFunction {
    fn cost(&self, blocks: &[ResidualBlock]) -> Result<f64, OptimizeError>;
}

/// Selectable loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFunction {
    /// Weighted sum of squared residuals.
    #[default]
    SumOfSquares,
    /// Weighted mean of squared residuals.
    MeanSquares,
    /// Square root of the weighted mean of squares.
    RootMeanSquares,
}

impl ObjectiveFunction for LossFunction {
    fn cost(&self, blocks: &[ResidualBlock]) -> Result<f64, OptimizeError> {
        match self {
            LossFunction::SumOfSquares => SumOfSquares.cost(blocks),
            LossFunction::MeanSquares => MeanSquares.cost(blocks),
            LossFunction::RootMeanSquares => RootMeanSquares.cost(blocks),
        }
    }
}

pub struct SumOfSquares;

impl ObjectiveFunction for SumOfSquares {
    fn cost(&self, blocks: &[ResidualBlock]) -> Result<f64, OptimizeError> {
        let cost = blocks.iter().map(|b| b.weighted_sum_of_squares()).sum();
        finite(cost)
    }
}

pub struct MeanSquares;

impl ObjectiveFunction for MeanSquares {
    fn cost(&self, blocks: &[ResidualBlock]) -> Result<f64, OptimizeError> {
        let n: usize = blocks.iter().map(|b| b.n_points()).sum();
        if n == 0 {
            return Err(OptimizeError::NoExperiments);
        }
        let sum: f64 = blocks.iter().map(|b| b.weighted_sum_of_squares()).sum();
        finite(sum / n as f64)
    }
}

pub struct RootMeanSquares;

impl ObjectiveFunction for RootMeanSquares {
    fn cost(&self, blocks: &[ResidualBlock]) -> Result<f64, OptimizeError> {
        MeanSquares.cost(blocks).map(f64::sqrt)
    }
}

/// Infinite costs are legal (failed candidate evaluations); NaN is not.
fn finite(cost: f64) -> Result<f64, OptimizeError> {
    if cost.is_nan() {
        Err(OptimizeError::CostNaN)
    } else {
        Ok(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn block(residuals: Array2<f64>, weights: Vec<f64>, normalization: f64) -> ResidualBlock {
        ResidualBlock {
            residuals,
            weights: Array1::from_vec(weights),
            normalization,
        }
    }

    #[test]
    fn weighted_sse_sums_blocks() {
        let blocks = vec![
            block(arr2(&[[1.0, 2.0], [0.0, 1.0]]), vec![1.0, 0.5], 1.0),
            block(arr2(&[[3.0]]), vec![2.0], 1.0),
        ];
        // block 1: 1*(1+0) + 0.5*(4+1) = 3.5; block 2: 2*9 = 18
        let cost = LossFunction::SumOfSquares.cost(&blocks).unwrap();
        assert!((cost - 21.5).abs() < 1e-12);
    }

    #[test]
    fn normalization_scales_block_contribution() {
        let blocks = vec![block(arr2(&[[2.0]]), vec![1.0], 0.25)];
        let cost = LossFunction::SumOfSquares.cost(&blocks).unwrap();
        assert!((cost - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mean_squares_divides_by_point_count() {
        let blocks = vec![block(arr2(&[[1.0], [1.0], [1.0], [1.0]]), vec![1.0], 1.0)];
        let cost = LossFunction::MeanSquares.cost(&blocks).unwrap();
        assert!((cost - 1.0).abs() < 1e-12);
    }

    #[test]
    fn nan_cost_is_an_error() {
        let blocks = vec![block(arr2(&[[f64::NAN]]), vec![1.0], 1.0)];
        assert!(matches!(
            LossFunction::SumOfSquares.cost(&blocks),
            Err(OptimizeError::CostNaN)
        ));
    }
}
