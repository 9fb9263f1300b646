//! Command-line interface for the kinfit library
//!
//! This binary exposes the engine's tasks over model JSON files:
//! - Validating model documents
//! - Simulating time courses
//! - Resolving steady states with stability analysis
//! - Fitting parameters against experimental CSV data
//!
//! # Usage
//!
//! ```bash
//! # Write the built-in example model
//! kinfit demo --output model.json
//!
//! # Check a model document
//! kinfit validate --model model.json
//!
//! # Simulate a time course and write a TSV report
//! kinfit simulate --model model.json --t1 100 --dt 0.5 --output course.tsv
//!
//! # Resolve a steady state
//! kinfit steady-state --model model.json
//!
//! # Fit parameters against experimental data
//! kinfit fit --model model.json --config fit.json --output fit.tsv
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use tabled::{Table, Tabled};

use kinfit::experiment::{ColumnMapping, Experiment, WeightMethod};
use kinfit::io::{load_model, save_model};
use kinfit::simulation::setup::{SimulationSetup, SimulationSetupBuilder};
use kinfit::steady_state::SteadyStateSettings;
use kinfit::tasks::{run_task, EstimationSettings, Task, TaskKind, TaskOutcome};
use kinfit::validation::check_model;

/// Main CLI configuration struct
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Check a model document for structural consistency
    Validate {
        /// Path to the model JSON file
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Simulate a time course
    Simulate {
        /// Path to the model JSON file
        #[arg(short, long)]
        model: PathBuf,

        /// End time of the simulation
        #[arg(long, default_value_t = 10.0)]
        t1: f64,

        /// Output grid spacing
        #[arg(long, default_value_t = 1.0)]
        dt: f64,

        /// Integrate the conservation-reduced system
        #[arg(long)]
        reduced: bool,

        /// Path of the TSV report to write
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Resolve a steady state and classify its stability
    SteadyState {
        /// Path to the model JSON file
        #[arg(short, long)]
        model: PathBuf,

        /// Path of the TSV report to write
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit model parameters against experimental data
    Fit {
        /// Path to the model JSON file
        #[arg(short, long)]
        model: PathBuf,

        /// Path to the fit configuration JSON file
        #[arg(short, long)]
        config: PathBuf,

        /// Path of the TSV report to write
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the fitted model back to this path
        #[arg(long)]
        save_model: Option<PathBuf>,
    },

    /// Write the built-in example model
    Demo {
        /// Path of the model JSON file to write
        #[arg(short, long, default_value = "demo_model.json")]
        output: PathBuf,
    },
}

/// One experiment entry of a fit configuration file.
#[derive(Debug, Deserialize)]
struct ExperimentConfig {
    id: String,
    /// CSV file with a header row.
    path: PathBuf,
    mappings: Vec<ColumnMapping>,
    #[serde(default)]
    weight_method: WeightMethod,
    #[serde(default)]
    normalize: bool,
}

/// Schema of the `--config` file of the `fit` subcommand.
#[derive(Debug, Deserialize)]
struct FitConfig {
    experiments: Vec<ExperimentConfig>,
    #[serde(flatten)]
    settings: EstimationSettings,
}

#[derive(Tabled)]
struct ParameterRow {
    parameter: String,
    value: f64,
}

#[derive(Tabled)]
struct StateRow {
    entity: String,
    value: f64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("{} {message}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, String> {
    match cli.command {
        Commands::Validate { model } => {
            let model = load_model(model).map_err(|e| e.to_string())?;
            let report = check_model(&model);
            print!("{report}");
            if report.is_valid {
                println!("{}", "model is valid".green().bold());
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }

        Commands::Simulate {
            model,
            t1,
            dt,
            reduced,
            output,
        } => {
            let mut model = load_model(model).map_err(|e| e.to_string())?;
            let mut setup: SimulationSetup = SimulationSetupBuilder::default()
                .t1(t1)
                .dt(dt)
                .build()
                .map_err(|e| e.to_string())?;
            setup.reduced = reduced;

            let task = Task {
                name: "time course".to_string(),
                kind: TaskKind::TimeCourse(setup),
                report_path: output,
            };
            let outcome = run_task(&mut model, &task, &[], None).map_err(|e| e.to_string())?;

            if let TaskOutcome::TimeCourse(result) = outcome {
                if !result.status.is_complete() {
                    eprintln!(
                        "{} trajectory truncated ({:?})",
                        "warning:".yellow().bold(),
                        result.status
                    );
                }
                let mut rows: Vec<StateRow> = result
                    .species
                    .iter()
                    .map(|(id, curve)| StateRow {
                        entity: id.clone(),
                        value: *curve.last().unwrap_or(&f64::NAN),
                    })
                    .collect();
                rows.sort_by(|a, b| a.entity.cmp(&b.entity));
                println!("final state at t = {}:", result.time.last().unwrap_or(&0.0));
                println!("{}", Table::new(rows));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::SteadyState { model, output } => {
            let mut model = load_model(model).map_err(|e| e.to_string())?;
            let task = Task {
                name: "steady state".to_string(),
                kind: TaskKind::SteadyState(SteadyStateSettings::default()),
                report_path: output,
            };
            let outcome = run_task(&mut model, &task, &[], None).map_err(|e| e.to_string())?;

            if let TaskOutcome::SteadyState(result) = outcome {
                println!("status: {:?}", result.status);
                println!("residual norm: {:e}", result.residual_norm);
                if let Some(stability) = result.stability {
                    println!("stability: {stability:?}");
                }
                let mut rows: Vec<StateRow> = result
                    .state
                    .iter()
                    .map(|(id, value)| StateRow {
                        entity: id.clone(),
                        value: *value,
                    })
                    .collect();
                rows.sort_by(|a, b| a.entity.cmp(&b.entity));
                println!("{}", Table::new(rows));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Fit {
            model,
            config,
            output,
            save_model: save_path,
        } => {
            let mut model = load_model(model).map_err(|e| e.to_string())?;
            let config: FitConfig = {
                let file = std::fs::File::open(&config).map_err(|e| e.to_string())?;
                serde_json::from_reader(file).map_err(|e| e.to_string())?
            };

            let mut experiments = Vec::with_capacity(config.experiments.len());
            for entry in config.experiments {
                let experiment = Experiment::from_csv(
                    &entry.path,
                    entry.id,
                    entry.mappings,
                    entry.weight_method,
                    entry.normalize,
                )
                .map_err(|e| e.to_string())?;
                experiments.push(experiment);
            }

            let task = Task {
                name: "parameter estimation".to_string(),
                kind: TaskKind::ParameterEstimation(config.settings),
                report_path: output,
            };
            let outcome =
                run_task(&mut model, &task, &experiments, None).map_err(|e| e.to_string())?;

            if let TaskOutcome::Estimation(report) = outcome {
                println!(
                    "objective {:e} after {} evaluations ({:?})",
                    report.best_objective, report.evaluations, report.termination
                );
                let rows: Vec<ParameterRow> = report
                    .best_params
                    .iter()
                    .map(|(name, value)| ParameterRow {
                        parameter: name.clone(),
                        value: *value,
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }

            if let Some(path) = save_path {
                save_model(path, &model).map_err(|e| e.to_string())?;
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Demo { output } => {
            let model = kinfit::demo::phospho_network();
            save_model(&output, &model).map_err(|e| e.to_string())?;
            println!("wrote {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
