//! Structural consistency checking.
//!
//! [`check_model`] runs every structural check over a model and returns a
//! [`Report`] of individual findings with severities. Unlike the hard
//! [`crate::model::StructureError`]s raised when compiling a system, the
//! report collects *all* findings, so a model author sees every defect at
//! once. A model is valid when no finding has `Error` severity; simulation
//! tasks refuse invalid models up front.

use std::fmt;

use colored::Colorize;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::graph::AssignmentGraph;
use crate::model::{KineticModel, SimulationKind};
use crate::simulation::rates::compile_rates;

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One finding produced by the checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Where the issue was found, e.g. `reactions/r1`.
    pub location: String,
    /// Human-readable description.
    pub message: String,
    pub severity: Severity,
    /// Identifier of the offending object, when there is one.
    pub identifier: Option<String>,
}

impl ValidationResult {
    pub fn new(
        location: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        identifier: Option<String>,
    ) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
            severity,
            identifier,
        }
    }
}

/// Collected results of all consistency checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// False as soon as any finding has `Error` severity.
    pub is_valid: bool,
    pub results: Vec<ValidationResult>,
}

impl Report {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            results: Vec::new(),
        }
    }

    pub fn add(&mut self, result: ValidationResult) {
        if result.severity == Severity::Error {
            self.is_valid = false;
        }
        self.results.push(result);
    }

    fn error(&mut self, location: impl Into<String>, message: impl Into<String>, id: Option<String>) {
        self.add(ValidationResult::new(location, message, Severity::Error, id));
    }

    fn warning(
        &mut self,
        location: impl Into<String>,
        message: impl Into<String>,
        id: Option<String>,
    ) {
        self.add(ValidationResult::new(
            location,
            message,
            Severity::Warning,
            id,
        ));
    }

    /// Findings attached to a given identifier.
    pub fn filter_results(&self, identifier: &str) -> Vec<&ValidationResult> {
        self.results
            .iter()
            .filter(|r| r.identifier.as_deref() == Some(identifier))
            .collect()
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.results.is_empty() {
            return writeln!(f, "{}", "model is consistent".green());
        }

        for result in &self.results {
            let tag = match result.severity {
                Severity::Error => "error".red().bold(),
                Severity::Warning => "warning".yellow().bold(),
                Severity::Info => "info".blue(),
            };
            writeln!(f, "{tag} [{}] {}", result.location, result.message)?;
        }
        Ok(())
    }
}

/// Runs all structural checks over a model.
pub fn check_model(model: &KineticModel) -> Report {
    let mut report = Report::new();

    check_duplicate_ids(model, &mut report);
    check_compartments(model, &mut report);
    check_species(model, &mut report);
    check_quantities(model, &mut report);
    check_assignments(model, &mut report);
    check_reactions(model, &mut report);
    check_parameter_sets(model, &mut report);

    report
}

fn check_duplicate_ids(model: &KineticModel, report: &mut Report) {
    for id in model.entity_ids().duplicates() {
        report.error(
            "model",
            format!("entity id '{id}' is declared more than once"),
            Some(id.to_string()),
        );
    }
}

fn check_compartments(model: &KineticModel, report: &mut Report) {
    for compartment in &model.compartments {
        if compartment.volume <= 0.0 {
            report.error(
                format!("compartments/{}", compartment.id),
                format!("volume must be positive, got {}", compartment.volume),
                Some(compartment.id.clone()),
            );
        }
    }
}

fn check_species(model: &KineticModel, report: &mut Report) {
    for species in &model.species {
        let location = format!("species/{}", species.id);
        if model.get_compartment(&species.compartment).is_none() {
            report.error(
                location.clone(),
                format!("compartment '{}' does not exist", species.compartment),
                Some(species.id.clone()),
            );
        }
        if species.initial_concentration < 0.0 {
            report.warning(
                location,
                format!(
                    "negative initial concentration {}",
                    species.initial_concentration
                ),
                Some(species.id.clone()),
            );
        }
    }
}

fn check_quantities(model: &KineticModel, report: &mut Report) {
    for quantity in &model.quantities {
        let location = format!("quantities/{}", quantity.id);
        if quantity.simulation_kind == SimulationKind::Reactions {
            report.error(
                location.clone(),
                "global quantities cannot be governed by reactions",
                Some(quantity.id.clone()),
            );
        }
        if quantity.simulation_kind == SimulationKind::Fixed
            && !quantity.initial_value.is_defined()
        {
            report.warning(
                location,
                "fixed quantity has an undefined initial value",
                Some(quantity.id.clone()),
            );
        }
    }
}

fn check_assignments(model: &KineticModel, report: &mut Report) {
    if let Err(e) = AssignmentGraph::from_model(model) {
        report.error("assignments", e.to_string(), None);
    }
}

fn check_reactions(model: &KineticModel, report: &mut Report) {
    for reaction in &model.reactions {
        let location = format!("reactions/{}", reaction.id);

        for element in reaction.substrates.iter().chain(&reaction.products) {
            if model.get_species(&element.species_id).is_none() {
                report.error(
                    location.clone(),
                    format!("species '{}' does not exist", element.species_id),
                    Some(reaction.id.clone()),
                );
            }
        }
        for modifier in &reaction.modifiers {
            if model.get_species(modifier).is_none() {
                report.error(
                    location.clone(),
                    format!("modifier species '{modifier}' does not exist"),
                    Some(reaction.id.clone()),
                );
            }
        }

        // compile each law in isolation so one broken reaction does not
        // mask findings in the others
        let mut single = model.clone();
        single.reactions = vec![reaction.clone()];
        if let Err(e) = compile_rates(&single) {
            report.error(location, e.to_string(), Some(reaction.id.clone()));
        }
    }
}

fn check_parameter_sets(model: &KineticModel, report: &mut Report) {
    for set in &model.parameter_sets {
        for id in set.values.keys() {
            if !model.has_entity(id) {
                report.warning(
                    format!("parameter_sets/{}", set.id),
                    format!("value for unknown entity '{id}'"),
                    Some(set.id.clone()),
                );
            }
        }
    }

    if let Some(active) = &model.active_set {
        if model.get_parameter_set(active).is_none() {
            report.error(
                "model",
                format!("active parameter set '{active}' does not exist"),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CompartmentBuilder, GlobalQuantityBuilder, KineticModelBuilder, SpeciesBuilder,
    };

    fn base_model() -> KineticModel {
        KineticModelBuilder::default()
            .name("valid")
            .to_compartments(
                CompartmentBuilder::default()
                    .id("c")
                    .name("c")
                    .build()
                    .unwrap(),
            )
            .to_species(
                SpeciesBuilder::default()
                    .id("A")
                    .name("A")
                    .compartment("c")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn valid_model_passes() {
        let report = check_model(&base_model());
        assert!(report.is_valid, "{report}");
    }

    #[test]
    fn unknown_compartment_is_an_error() {
        let mut model = base_model();
        model.species[0].compartment = "nowhere".to_string();
        let report = check_model(&model);
        assert!(!report.is_valid);
        assert!(!report.filter_results("A").is_empty());
    }

    #[test]
    fn cyclic_assignments_are_reported() {
        let mut model = base_model();
        model.quantities.push(
            GlobalQuantityBuilder::default()
                .id("x")
                .name("x")
                .simulation_kind(SimulationKind::Assignment)
                .expression(Some("y + 1".to_string()))
                .build()
                .unwrap(),
        );
        model.quantities.push(
            GlobalQuantityBuilder::default()
                .id("y")
                .name("y")
                .simulation_kind(SimulationKind::Assignment)
                .expression(Some("x + 1".to_string()))
                .build()
                .unwrap(),
        );

        let report = check_model(&model);
        assert!(!report.is_valid);
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut model = base_model();
        model.quantities.push(
            GlobalQuantityBuilder::default()
                .id("A")
                .name("shadowing id")
                .build()
                .unwrap(),
        );
        let report = check_model(&model);
        assert!(!report.is_valid);
    }

    #[test]
    fn nonpositive_volume_is_an_error() {
        let mut model = base_model();
        model.compartments[0].volume = 0.0;
        let report = check_model(&model);
        assert!(!report.is_valid);
    }
}
