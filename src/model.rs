//! Core data model for kinetic reaction networks.
//!
//! A [`KineticModel`] is a self-contained document describing a deterministic
//! reaction network: compartments, species, global quantities, symbolic
//! rate-law templates ([`RateFunction`]), reactions binding those templates to
//! concrete entities, and named [`ParameterSet`] snapshots of initial values.
//!
//! All structs serialize with `serde` and carry `derive_builder` builders so
//! models can be assembled programmatically or loaded from JSON (see the
//! [`crate::io`] module). Simulation and fitting never mutate a model in
//! place; they operate on explicit value snapshots resolved through
//! [`KineticModel::resolve_initial_state`].

use std::collections::BTreeMap;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the value of a species or global quantity evolves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimulationKind {
    /// Determined by the stoichiometry-weighted sum of reaction fluxes.
    #[default]
    Reactions,
    /// Integrated directly from an explicit rate expression.
    Ode,
    /// Recomputed algebraically from other quantities at every evaluation.
    Assignment,
    /// Held constant at its initial value.
    Fixed,
}

/// A numeric value that may be explicitly undefined.
///
/// Exported model data uses non-finite sentinels (`-nan(ind)`, `INF`) to mark
/// quantities whose value has not been computed yet, e.g. enzyme-competition
/// terms before the first state resolution. These are kept as an explicit
/// variant rather than guessed numeric defaults; how an `Undefined` operand
/// behaves during flux evaluation is governed by
/// [`crate::simulation::rates::UndefinedPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityValue {
    Defined(f64),
    Undefined,
}

impl Default for QuantityValue {
    fn default() -> Self {
        QuantityValue::Undefined
    }
}

impl QuantityValue {
    /// Returns the value as `f64`, mapping `Undefined` to NaN.
    pub fn as_f64(&self) -> f64 {
        match self {
            QuantityValue::Defined(v) => *v,
            QuantityValue::Undefined => f64::NAN,
        }
    }

    /// Returns the defined value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            QuantityValue::Defined(v) => Some(*v),
            QuantityValue::Undefined => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, QuantityValue::Defined(_))
    }
}

impl From<f64> for QuantityValue {
    /// Non-finite floats collapse to `Undefined`; everything else is kept.
    fn from(v: f64) -> Self {
        if v.is_finite() {
            QuantityValue::Defined(v)
        } else {
            QuantityValue::Undefined
        }
    }
}

/// A reaction vessel with a (possibly fixed) volume.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct Compartment {
    /// Unique identifier of the compartment.
    #[builder(setter(into))]
    pub id: String,

    /// Human-readable name.
    #[builder(setter(into))]
    pub name: String,

    /// Volume of the compartment.
    #[serde(default = "default_volume")]
    #[builder(default = "1.0")]
    pub volume: f64,

    /// Whether the volume stays constant over the course of a simulation.
    #[serde(default = "default_true")]
    #[builder(default = "true")]
    pub constant: bool,
}

fn default_volume() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// A chemical species living in a compartment.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct Species {
    /// Unique identifier of the species.
    #[builder(setter(into))]
    pub id: String,

    /// Human-readable name.
    #[builder(setter(into))]
    pub name: String,

    /// Identifier of the compartment this species lives in.
    #[builder(setter(into))]
    pub compartment: String,

    /// Initial concentration.
    #[serde(default)]
    #[builder(default)]
    pub initial_concentration: f64,

    /// How the species evolves over time.
    #[serde(default)]
    #[builder(default)]
    pub simulation_kind: SimulationKind,

    /// Rate or assignment expression, depending on `simulation_kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub expression: Option<String>,

    /// Expression evaluated only when resolving the initial state. Falls back
    /// to `expression` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub initial_expression: Option<String>,
}

/// A scalar model quantity that is not a species, e.g. a rate constant, an
/// enzyme concentration, or a derived competition term.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct GlobalQuantity {
    /// Unique identifier of the quantity.
    #[builder(setter(into))]
    pub id: String,

    /// Human-readable name.
    #[builder(setter(into))]
    pub name: String,

    /// How the quantity evolves over time. `Reactions` is not valid here and
    /// is rejected during validation.
    #[serde(default = "default_fixed")]
    #[builder(default = "SimulationKind::Fixed")]
    pub simulation_kind: SimulationKind,

    /// Initial value, possibly explicitly undefined.
    #[serde(default)]
    #[builder(default)]
    pub initial_value: QuantityValue,

    /// Rate or assignment expression, depending on `simulation_kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub expression: Option<String>,

    /// Expression evaluated only when resolving the initial state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub initial_expression: Option<String>,
}

fn default_fixed() -> SimulationKind {
    SimulationKind::Fixed
}

/// Role a rate-function parameter plays inside a kinetic law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRole {
    Substrate,
    Product,
    Modifier,
    Constant,
    Volume,
}

/// One declared parameter of a rate-law template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameter {
    pub name: String,
    pub role: ParameterRole,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, role: ParameterRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

/// A named symbolic rate-law template with ordered parameter roles.
///
/// The formula is an infix expression over the declared parameter names, e.g.
/// `kcat * E * S / (Km * (1 + kappa - S / Km) + S)` for a Michaelis–Menten
/// law with a competition correction term.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct RateFunction {
    /// Unique identifier of the function.
    #[builder(setter(into))]
    pub id: String,

    /// Human-readable name.
    #[builder(setter(into))]
    pub name: String,

    /// Infix formula over the declared parameter names.
    #[builder(setter(into))]
    pub formula: String,

    /// Ordered parameter declarations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_parameters")))]
    pub parameters: Vec<FunctionParameter>,
}

/// Binds one rate-function parameter to a concrete model entity or a
/// reaction-local constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Species(String),
    Quantity(String),
    Compartment(String),
    Value(f64),
}

/// A rate-law instance: a function reference plus one binding per declared
/// parameter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KineticLaw {
    /// Identifier of the [`RateFunction`] template.
    pub function_id: String,

    /// Parameter name → bound entity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bindings: BTreeMap<String, Binding>,
}

impl KineticLaw {
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            bindings: BTreeMap::new(),
        }
    }

    /// Adds a binding and returns `self` for chaining.
    pub fn bind(mut self, parameter: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(parameter.into(), binding);
        self
    }
}

/// One species participating in a reaction with a stoichiometric coefficient.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct ReactionElement {
    #[builder(setter(into))]
    pub species_id: String,

    #[serde(default = "default_stoichiometry")]
    #[builder(default = "1.0")]
    pub stoichiometry: f64,
}

fn default_stoichiometry() -> f64 {
    1.0
}

impl ReactionElement {
    pub fn new(species_id: impl Into<String>, stoichiometry: f64) -> Self {
        Self {
            species_id: species_id.into(),
            stoichiometry,
        }
    }
}

/// A reaction with substrates, products, modifiers and a kinetic law.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct Reaction {
    /// Unique identifier of the reaction.
    #[builder(setter(into))]
    pub id: String,

    /// Human-readable name.
    #[builder(setter(into))]
    pub name: String,

    /// Whether the law describes net forward and backward conversion.
    #[serde(default)]
    #[builder(default)]
    pub reversible: bool,

    /// Consumed species.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_substrates")))]
    pub substrates: Vec<ReactionElement>,

    /// Produced species.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_products")))]
    pub products: Vec<ReactionElement>,

    /// Species that influence the rate without being consumed or produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_modifiers")))]
    pub modifiers: Vec<String>,

    /// The rate law computing this reaction's flux.
    #[builder(default)]
    pub kinetic_law: KineticLaw,
}

/// A named, immutable snapshot of initial and fixed values keyed by entity id.
///
/// Models carry several of these ("Initial State", fitted sets written back by
/// an estimation run, ...). A simulation always resolves against one explicit
/// snapshot; there is no ambient mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParameterSet {
    pub id: String,
    pub name: String,

    /// Entity id → stored value.
    #[serde(default)]
    pub values: BTreeMap<String, QuantityValue>,
}

impl ParameterSet {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            values: BTreeMap::new(),
        }
    }
}

/// Structural defects that make a model unusable for simulation.
///
/// These are fatal and reported before any numerical work starts, as opposed
/// to numerical or convergence failures which are recoverable per task.
#[derive(Error, Debug)]
pub enum StructureError {
    #[error("cyclic dependency among assignment expressions: {entities:?}")]
    CyclicDependency { entities: Vec<String> },

    #[error("unknown entity '{0}' referenced")]
    UnknownEntity(String),

    #[error("reaction '{reaction}' references unknown rate function '{function}'")]
    UnknownFunction { reaction: String, function: String },

    #[error("parameter '{parameter}' of function '{function}' is not bound in reaction '{reaction}'")]
    UnresolvedBinding {
        reaction: String,
        function: String,
        parameter: String,
    },

    #[error("binding '{parameter}' in reaction '{reaction}' does not name a parameter of function '{function}'")]
    ExtraBinding {
        reaction: String,
        function: String,
        parameter: String,
    },

    #[error("binding for '{parameter}' in reaction '{reaction}' does not match its declared role {role:?}")]
    RoleMismatch {
        reaction: String,
        parameter: String,
        role: ParameterRole,
    },

    #[error("entity '{entity}' of kind {kind:?} has no expression")]
    MissingExpression {
        entity: String,
        kind: SimulationKind,
    },

    #[error("failed to parse expression of '{entity}': {message}")]
    BadExpression { entity: String, message: String },

    #[error("symbol '{symbol}' in formula of function '{function}' is not a declared parameter")]
    UnboundFunctionSymbol { function: String, symbol: String },

    #[error("duplicate entity id '{0}'")]
    DuplicateId(String),

    #[error("parameter set '{0}' not found")]
    UnknownParameterSet(String),
}

/// Root document describing a kinetic reaction network.
#[derive(Debug, Clone, Serialize, Deserialize, Builder, Default)]
pub struct KineticModel {
    /// Name of the model.
    #[builder(setter(into))]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_compartments")))]
    pub compartments: Vec<Compartment>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_species")))]
    pub species: Vec<Species>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_quantities")))]
    pub quantities: Vec<GlobalQuantity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_functions")))]
    pub functions: Vec<RateFunction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_reactions")))]
    pub reactions: Vec<Reaction>,

    /// Named value snapshots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default, setter(into, each(name = "to_parameter_sets")))]
    pub parameter_sets: Vec<ParameterSet>,

    /// Identifier of the snapshot used when none is requested explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(into))]
    pub active_set: Option<String>,
}

impl KineticModel {
    pub fn get_compartment(&self, id: &str) -> Option<&Compartment> {
        self.compartments.iter().find(|c| c.id == id)
    }

    pub fn get_species(&self, id: &str) -> Option<&Species> {
        self.species.iter().find(|s| s.id == id)
    }

    pub fn get_quantity(&self, id: &str) -> Option<&GlobalQuantity> {
        self.quantities.iter().find(|q| q.id == id)
    }

    pub fn get_function(&self, id: &str) -> Option<&RateFunction> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn get_parameter_set(&self, id: &str) -> Option<&ParameterSet> {
        self.parameter_sets.iter().find(|p| p.id == id)
    }

    /// True if `id` names any compartment, species or global quantity.
    pub fn has_entity(&self, id: &str) -> bool {
        self.get_compartment(id).is_some()
            || self.get_species(id).is_some()
            || self.get_quantity(id).is_some()
    }

    /// Iterates over all entity ids in the model.
    pub fn entity_ids(&self) -> impl Iterator<Item = &str> {
        self.compartments
            .iter()
            .map(|c| c.id.as_str())
            .chain(self.species.iter().map(|s| s.id.as_str()))
            .chain(self.quantities.iter().map(|q| q.id.as_str()))
    }

    /// Resolves the initial value of every entity against an optional named
    /// snapshot.
    ///
    /// The base values declared on the entities themselves are overlaid with
    /// the requested parameter set (or the model's active set when `set` is
    /// `None`). Initial-assignment expressions are *not* applied here; that
    /// is the job of the simulation layer, which owns expression evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`StructureError::UnknownParameterSet`] if the requested set
    /// does not exist, or [`StructureError::UnknownEntity`] if a snapshot
    /// entry references an id the model does not declare.
    pub fn resolve_initial_state(
        &self,
        set: Option<&str>,
    ) -> Result<BTreeMap<String, QuantityValue>, StructureError> {
        let mut state: BTreeMap<String, QuantityValue> = BTreeMap::new();

        for compartment in &self.compartments {
            state.insert(compartment.id.clone(), compartment.volume.into());
        }
        for species in &self.species {
            state.insert(species.id.clone(), species.initial_concentration.into());
        }
        for quantity in &self.quantities {
            state.insert(quantity.id.clone(), quantity.initial_value);
        }

        let set_id = set.map(String::from).or_else(|| self.active_set.clone());
        if let Some(set_id) = set_id {
            let snapshot = self
                .get_parameter_set(&set_id)
                .ok_or(StructureError::UnknownParameterSet(set_id))?;

            for (id, value) in &snapshot.values {
                if !state.contains_key(id) {
                    return Err(StructureError::UnknownEntity(id.clone()));
                }
                state.insert(id.clone(), *value);
            }
        }

        Ok(state)
    }

    /// Captures the current initial values as a named snapshot.
    pub fn snapshot(&self, id: impl Into<String>, name: impl Into<String>) -> ParameterSet {
        let mut set = ParameterSet::new(id, name);
        for compartment in &self.compartments {
            set.values
                .insert(compartment.id.clone(), compartment.volume.into());
        }
        for species in &self.species {
            set.values
                .insert(species.id.clone(), species.initial_concentration.into());
        }
        for quantity in &self.quantities {
            set.values.insert(quantity.id.clone(), quantity.initial_value);
        }
        set
    }

    /// Writes fitted values back into the model's initial values and records
    /// them as a new named parameter set, which becomes the active set.
    ///
    /// Unknown ids are rejected before anything is mutated.
    pub fn apply_fitted_values(
        &mut self,
        values: &BTreeMap<String, f64>,
        set_id: impl Into<String>,
        set_name: impl Into<String>,
    ) -> Result<(), StructureError> {
        for id in values.keys() {
            if !self.has_entity(id) {
                return Err(StructureError::UnknownEntity(id.clone()));
            }
        }

        for (id, value) in values {
            if let Some(compartment) = self.compartments.iter_mut().find(|c| &c.id == id) {
                compartment.volume = *value;
            } else if let Some(species) = self.species.iter_mut().find(|s| &s.id == id) {
                species.initial_concentration = *value;
            } else if let Some(quantity) = self.quantities.iter_mut().find(|q| &q.id == id) {
                quantity.initial_value = (*value).into();
            }
        }

        let set_id = set_id.into();
        let snapshot = self.snapshot(set_id.clone(), set_name);
        self.parameter_sets.retain(|p| p.id != set_id);
        self.parameter_sets.push(snapshot);
        self.active_set = Some(set_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_state_model() -> KineticModel {
        KineticModelBuilder::default()
            .name("two-state")
            .to_compartments(
                CompartmentBuilder::default()
                    .id("cell")
                    .name("cell")
                    .build()
                    .unwrap(),
            )
            .to_species(
                SpeciesBuilder::default()
                    .id("A")
                    .name("A")
                    .compartment("cell")
                    .initial_concentration(2.0)
                    .build()
                    .unwrap(),
            )
            .to_quantities(
                GlobalQuantityBuilder::default()
                    .id("k1")
                    .name("k1")
                    .initial_value(QuantityValue::Defined(0.5))
                    .build()
                    .unwrap(),
            )
            .to_quantities(
                GlobalQuantityBuilder::default()
                    .id("kappa")
                    .name("kappa")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn resolve_initial_state_uses_declared_values() {
        let model = two_state_model();
        let state = model.resolve_initial_state(None).unwrap();

        assert_eq!(state["cell"], QuantityValue::Defined(1.0));
        assert_eq!(state["A"], QuantityValue::Defined(2.0));
        assert_eq!(state["k1"], QuantityValue::Defined(0.5));
        assert_eq!(state["kappa"], QuantityValue::Undefined);
    }

    #[test]
    fn resolve_initial_state_overlays_named_set() {
        let mut model = two_state_model();
        let mut set = ParameterSet::new("fitted", "Fitted values");
        set.values
            .insert("k1".to_string(), QuantityValue::Defined(0.75));
        model.parameter_sets.push(set);

        let state = model.resolve_initial_state(Some("fitted")).unwrap();
        assert_eq!(state["k1"], QuantityValue::Defined(0.75));
        // values not named by the set stay at their declared defaults
        assert_eq!(state["A"], QuantityValue::Defined(2.0));
    }

    #[test]
    fn resolve_initial_state_rejects_unknown_set() {
        let model = two_state_model();
        let err = model.resolve_initial_state(Some("nope")).unwrap_err();
        assert!(matches!(err, StructureError::UnknownParameterSet(_)));
    }

    #[test]
    fn undefined_values_survive_serde_round_trip() {
        let model = two_state_model();
        let json = serde_json::to_string(&model).unwrap();
        let restored: KineticModel = serde_json::from_str(&json).unwrap();

        assert_eq!(
            restored.get_quantity("kappa").unwrap().initial_value,
            QuantityValue::Undefined
        );
        assert_eq!(
            restored.get_quantity("k1").unwrap().initial_value,
            QuantityValue::Defined(0.5)
        );
    }

    #[test]
    fn apply_fitted_values_records_new_active_set() {
        let mut model = two_state_model();
        let mut fitted = BTreeMap::new();
        fitted.insert("k1".to_string(), 1.25);

        model
            .apply_fitted_values(&fitted, "fit_1", "Fit 1")
            .unwrap();

        assert_eq!(
            model.get_quantity("k1").unwrap().initial_value,
            QuantityValue::Defined(1.25)
        );
        assert_eq!(model.active_set.as_deref(), Some("fit_1"));
        let set = model.get_parameter_set("fit_1").unwrap();
        assert_eq!(set.values["k1"], QuantityValue::Defined(1.25));
    }

    #[test]
    fn non_finite_floats_collapse_to_undefined() {
        assert_eq!(QuantityValue::from(f64::NAN), QuantityValue::Undefined);
        assert_eq!(
            QuantityValue::from(f64::INFINITY),
            QuantityValue::Undefined
        );
        assert_eq!(QuantityValue::from(3.0), QuantityValue::Defined(3.0));
    }
}
