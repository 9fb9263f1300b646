//! Experimental time-course data for parameter estimation.
//!
//! An [`Experiment`] wraps one CSV table: a header row naming columns, one
//! time column, and data columns bound to model entities through
//! [`ColumnMapping`] roles. Dependent columns are fit targets; independent
//! columns set per-experiment initial conditions; ignored columns are
//! carried but unused. Weights come from the user or from intra-experiment
//! statistics, and experiments can be normalized so differently scaled data
//! sets contribute comparably to a combined objective.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use ordered_float::OrderedFloat;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;

use crate::model::KineticModel;
use crate::simulation::setup::{SimulationSetup, SimulationSetupBuilder};

/// Role of one CSV column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// The time axis. Exactly one column per experiment.
    Time,
    /// A fit target compared against the simulated curve of its entity.
    Dependent,
    /// A per-experiment initial condition; the first row's value overrides
    /// the model's initial value of the target entity.
    Independent,
    /// Present in the file but not used.
    Ignore,
}

/// Binds one CSV column to a model entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Column name as it appears in the CSV header.
    pub column: String,
    pub role: ColumnRole,
    /// Target entity id; required for dependent and independent columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Explicit weight; overrides the experiment's weight method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl ColumnMapping {
    pub fn new(column: impl Into<String>, role: ColumnRole) -> Self {
        Self {
            column: column.into(),
            role,
            target: None,
            weight: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// How automatic per-column weights are computed from the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightMethod {
    /// `1 / <x²>`, so large-amplitude columns weigh less.
    #[default]
    MeanSquare,
    /// `1 / sd²`, scaling columns by their intra-experiment variance.
    StandardDeviation,
    /// `1 / <x>²`.
    Mean,
}

/// Errors raised while loading or validating experimental data.
#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("experiment '{0}' declares no time column")]
    MissingTimeColumn(String),

    #[error("experiment '{0}' declares more than one time column")]
    MultipleTimeColumns(String),

    #[error("column '{column}' not found in experiment '{experiment}'")]
    ColumnNotFound {
        experiment: String,
        column: String,
    },

    #[error("column '{column}' in experiment '{experiment}' has no target entity")]
    MissingTarget {
        experiment: String,
        column: String,
    },

    #[error("target '{target}' of column '{column}' is not a model entity")]
    UnknownTarget { column: String, target: String },

    #[error("time values of experiment '{0}' are not strictly increasing")]
    NonMonotonicTime(String),

    #[error("experiment '{0}' contains no data rows")]
    EmptyData(String),

    #[error("failed to read experiment data: {0}")]
    Table(#[from] PolarsError),
}

/// One experimental time course with its column bindings.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub id: String,
    pub mappings: Vec<ColumnMapping>,
    pub weight_method: WeightMethod,
    /// Scale this experiment's contribution by `1 / n_points` so several
    /// experiments of different lengths contribute comparably.
    pub normalize: bool,
    /// The time axis.
    pub time: Vec<f64>,
    /// Column name → values, one entry per non-time mapping.
    pub columns: HashMap<String, Vec<f64>>,
}

impl Experiment {
    /// Loads an experiment from a CSV file with a header row.
    pub fn from_csv(
        path: impl AsRef<Path>,
        id: impl Into<String>,
        mappings: Vec<ColumnMapping>,
        weight_method: WeightMethod,
        normalize: bool,
    ) -> Result<Self, ExperimentError> {
        let id = id.into();
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))?
            .finish()?;

        Self::from_dataframe(&df, id, mappings, weight_method, normalize)
    }

    /// Builds an experiment from an already-loaded data frame.
    pub fn from_dataframe(
        df: &DataFrame,
        id: String,
        mappings: Vec<ColumnMapping>,
        weight_method: WeightMethod,
        normalize: bool,
    ) -> Result<Self, ExperimentError> {
        let time_columns: Vec<&ColumnMapping> = mappings
            .iter()
            .filter(|m| m.role == ColumnRole::Time)
            .collect();
        let time_mapping = match time_columns.as_slice() {
            [] => return Err(ExperimentError::MissingTimeColumn(id)),
            [single] => *single,
            _ => return Err(ExperimentError::MultipleTimeColumns(id)),
        };

        let time = column_values(df, &id, &time_mapping.column)?;
        if time.is_empty() {
            return Err(ExperimentError::EmptyData(id));
        }
        if time.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ExperimentError::NonMonotonicTime(id));
        }

        let mut columns = HashMap::new();
        for mapping in &mappings {
            if mapping.role == ColumnRole::Time {
                continue;
            }
            columns.insert(
                mapping.column.clone(),
                column_values(df, &id, &mapping.column)?,
            );
        }

        Ok(Self {
            id,
            mappings,
            weight_method,
            normalize,
            time,
            columns,
        })
    }

    /// Checks targets against a model: dependent and independent columns
    /// must name existing entities.
    pub fn validate(&self, model: &KineticModel) -> Result<(), ExperimentError> {
        for mapping in &self.mappings {
            match mapping.role {
                ColumnRole::Dependent | ColumnRole::Independent => {
                    let target =
                        mapping
                            .target
                            .as_ref()
                            .ok_or_else(|| ExperimentError::MissingTarget {
                                experiment: self.id.clone(),
                                column: mapping.column.clone(),
                            })?;
                    if !model.has_entity(target) {
                        return Err(ExperimentError::UnknownTarget {
                            column: mapping.column.clone(),
                            target: target.clone(),
                        });
                    }
                }
                ColumnRole::Time | ColumnRole::Ignore => {}
            }
        }
        Ok(())
    }

    /// Dependent mappings in declaration order, paired with their data.
    pub fn dependent_columns(&self) -> Vec<(&ColumnMapping, &Vec<f64>)> {
        self.mappings
            .iter()
            .filter(|m| m.role == ColumnRole::Dependent)
            .map(|m| (m, &self.columns[&m.column]))
            .collect()
    }

    /// Initial-condition overrides from the first row of the independent
    /// columns.
    pub fn initial_overrides(&self) -> HashMap<String, f64> {
        self.mappings
            .iter()
            .filter(|m| m.role == ColumnRole::Independent)
            .filter_map(|m| {
                let target = m.target.clone()?;
                let value = self.columns.get(&m.column)?.first().copied()?;
                Some((target, value))
            })
            .collect()
    }

    /// Per-column weights for the dependent columns, explicit or computed by
    /// the weight method. Degenerate statistics (zero variance or mean) fall
    /// back to weight 1.
    pub fn weights(&self) -> HashMap<String, f64> {
        self.mappings
            .iter()
            .filter(|m| m.role == ColumnRole::Dependent)
            .map(|m| {
                let weight = m
                    .weight
                    .unwrap_or_else(|| auto_weight(&self.columns[&m.column], self.weight_method));
                (m.column.clone(), weight)
            })
            .collect()
    }

    /// Number of data points across the dependent columns.
    pub fn n_points(&self) -> usize {
        self.dependent_columns()
            .iter()
            .map(|(_, values)| values.len())
            .sum()
    }
}

fn auto_weight(values: &[f64], method: WeightMethod) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 1.0;
    }

    let denominator = match method {
        WeightMethod::MeanSquare => finite.iter().map(|v| v * v).sum::<f64>() / finite.len() as f64,
        WeightMethod::StandardDeviation => finite.iter().copied().variance(),
        WeightMethod::Mean => {
            let mean = finite.iter().copied().mean();
            mean * mean
        }
    };

    if denominator.is_finite() && denominator > 0.0 {
        1.0 / denominator
    } else {
        log::warn!("degenerate statistics for weighting, falling back to weight 1");
        1.0
    }
}

fn column_values(df: &DataFrame, experiment: &str, column: &str) -> Result<Vec<f64>, ExperimentError> {
    let series = df
        .column(column)
        .map_err(|_| ExperimentError::ColumnNotFound {
            experiment: experiment.to_string(),
            column: column.to_string(),
        })?;

    let values = series
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    Ok(values)
}

/// Derives a simulation window covering a set of experiments, using the
/// earliest and latest time points across all of them.
pub fn covering_setup(experiments: &[Experiment]) -> Option<SimulationSetup> {
    let mut times: BTreeSet<OrderedFloat<f64>> = BTreeSet::new();
    for experiment in experiments {
        for t in &experiment.time {
            times.insert(OrderedFloat(*t));
        }
    }

    let t0 = times.iter().next()?.into_inner();
    let t1 = times.iter().next_back()?.into_inner();
    Some(
        SimulationSetupBuilder::default()
            .t0(t0)
            .t1(t1.max(t0))
            .build()
            .unwrap(),
    )
}

impl TryFrom<&Experiment> for SimulationSetup {
    type Error = ExperimentError;

    /// A setup spanning exactly this experiment's time axis.
    fn try_from(experiment: &Experiment) -> Result<Self, Self::Error> {
        let t0 = *experiment
            .time
            .first()
            .ok_or_else(|| ExperimentError::EmptyData(experiment.id.clone()))?;
        let t1 = *experiment.time.last().unwrap();
        Ok(SimulationSetupBuilder::default()
            .t0(t0)
            .t1(t1.max(t0))
            .build()
            .unwrap())
    }
}
