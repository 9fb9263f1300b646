//! Compilation of a [`KineticModel`] into an integrable ODE system.
//!
//! [`OdeSystem::new`] resolves everything that can fail structurally
//! (kinetic-law bindings, assignment ordering, stoichiometry, conservation
//! analysis) once, so the hot evaluation path only deals with numbers.
//!
//! The state vector covers species governed by reactions, species with
//! explicit rate expressions, and rate-rule quantities, in sorted id order.
//! Fixed entities live in a constant value map; assignment entities are
//! recomputed from the dependency-ordered passes of the
//! [`crate::graph::AssignmentGraph`].

use std::collections::{BTreeMap, HashMap};

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::expr::{numeric_context, set_numeric, CompiledExpression};
use crate::graph::{AssignmentGraph, AssignmentStep};
use crate::model::{KineticModel, SimulationKind, StructureError};

use super::error::{NumericsError, SimulationError};
use super::integrator::{CancelToken, IntegrationOutput, RhsSystem, Trajectory};
use super::rates::{compile_rates, CompiledRate, UndefinedPolicy};
use super::result::{SimulationResult, SimulationStatus};
use super::setup::SimulationSetup;
use super::stoich::{derive_stoichiometry, ConservationAnalysis, Stoichiometry};

/// A kinetic model compiled for numerical evaluation.
#[derive(Debug, Clone)]
pub struct OdeSystem {
    /// Integrated entity ids, sorted.
    state_ids: Vec<String>,
    /// Base values of every entity after resolving the chosen parameter set.
    initial_values: BTreeMap<String, f64>,
    /// Stoichiometry over the reaction-governed subset of the state.
    stoich: Stoichiometry,
    /// Stoichiometry row → state index.
    stoich_state_rows: Vec<usize>,
    /// Compartment id per stoichiometry row, for concentration scaling.
    row_compartments: Vec<String>,
    /// Moiety conservation analysis over the stoichiometry rows.
    conservation: ConservationAnalysis,
    /// Compiled kinetic laws, one per reaction.
    rates: Vec<CompiledRate>,
    /// Explicit rate expressions: state index → compiled expression.
    ode_exprs: Vec<(usize, CompiledExpression)>,
    /// Dependency-ordered assignment passes.
    graph: AssignmentGraph,
}

/// A system bound to one concrete set of initial values, ready to integrate.
///
/// Produced by [`OdeSystem::prepare`]; estimation prepares one run per
/// candidate parameter vector, simulations one per invocation.
#[derive(Debug, Clone)]
pub struct PreparedRun<'a> {
    system: &'a OdeSystem,
    /// Entity id → value, after overrides and the initial assignment pass.
    base: HashMap<String, f64>,
    /// Initial state vector over the system's state ids.
    pub y0: Vec<f64>,
    policy: UndefinedPolicy,
}

impl OdeSystem {
    /// Compiles a model against an optional named parameter set.
    ///
    /// All structural validation happens here; the returned system cannot
    /// fail structurally during evaluation.
    pub fn new(model: &KineticModel, set: Option<&str>) -> Result<Self, SimulationError> {
        let graph = AssignmentGraph::from_model(model)?;
        let rates = compile_rates(model)?;

        // reaction species must exist and live in known compartments
        for reaction in &model.reactions {
            for element in reaction.substrates.iter().chain(&reaction.products) {
                if model.get_species(&element.species_id).is_none() {
                    return Err(StructureError::UnknownEntity(element.species_id.clone()).into());
                }
            }
        }

        let mut reaction_species: Vec<String> = model
            .species
            .iter()
            .filter(|s| s.simulation_kind == SimulationKind::Reactions)
            .map(|s| s.id.clone())
            .collect();
        reaction_species.sort();

        let mut state_ids = reaction_species.clone();
        let mut ode_entities: Vec<(String, Option<String>)> = Vec::new();
        for species in &model.species {
            if species.simulation_kind == SimulationKind::Ode {
                state_ids.push(species.id.clone());
                ode_entities.push((species.id.clone(), species.expression.clone()));
            }
        }
        for quantity in &model.quantities {
            if quantity.simulation_kind == SimulationKind::Ode {
                state_ids.push(quantity.id.clone());
                ode_entities.push((quantity.id.clone(), quantity.expression.clone()));
            }
        }
        state_ids.sort();

        let state_index: HashMap<&str, usize> = state_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut ode_exprs = Vec::with_capacity(ode_entities.len());
        for (id, raw) in ode_entities {
            let raw = raw.ok_or_else(|| StructureError::MissingExpression {
                entity: id.clone(),
                kind: SimulationKind::Ode,
            })?;
            let expr =
                CompiledExpression::compile(&raw).map_err(|e| StructureError::BadExpression {
                    entity: id.clone(),
                    message: e.to_string(),
                })?;
            ode_exprs.push((state_index[id.as_str()], expr));
        }

        let stoich = derive_stoichiometry(&model.reactions, &reaction_species);
        let stoich_state_rows: Vec<usize> = stoich
            .species
            .iter()
            .map(|id| state_index[id.as_str()])
            .collect();

        let mut row_compartments = Vec::with_capacity(stoich.species.len());
        for id in &stoich.species {
            let species = model.get_species(id).expect("row species exist");
            if model.get_compartment(&species.compartment).is_none() {
                return Err(StructureError::UnknownEntity(species.compartment.clone()).into());
            }
            row_compartments.push(species.compartment.clone());
        }

        let conservation = ConservationAnalysis::analyze(&stoich);

        let initial_values = model
            .resolve_initial_state(set)?
            .into_iter()
            .map(|(id, value)| (id, value.as_f64()))
            .collect();

        Ok(Self {
            state_ids,
            initial_values,
            stoich,
            stoich_state_rows,
            row_compartments,
            conservation,
            rates,
            ode_exprs,
            graph,
        })
    }

    /// Ids of the integrated entities, in state-vector order.
    pub fn state_ids(&self) -> &[String] {
        &self.state_ids
    }

    /// Ids of the assignment entities recomputed during evaluation.
    pub fn assignment_ids(&self) -> Vec<String> {
        self.graph
            .transient
            .iter()
            .map(|step| step.entity.clone())
            .collect()
    }

    /// The conservation analysis over the reaction-governed species.
    pub fn conservation(&self) -> &ConservationAnalysis {
        &self.conservation
    }

    /// Conserved-moiety descriptions as `(dependent species, total)` for a
    /// prepared run, mainly for reporting.
    pub fn conserved_totals(&self, run: &PreparedRun) -> Vec<(String, f64)> {
        let y_rows: Vec<f64> = self
            .stoich_state_rows
            .iter()
            .map(|&si| run.y0[si])
            .collect();
        let totals = self.conservation.totals(&y_rows);
        self.conservation
            .dependent
            .iter()
            .zip(totals)
            .map(|(&row, total)| (self.stoich.species[row].clone(), total))
            .collect()
    }

    /// Binds the system to concrete initial values.
    ///
    /// `overrides` replace resolved values by entity id before the initial
    /// assignment pass runs; this is how experiments impose their measured
    /// starting concentrations and how estimation injects candidate
    /// parameter values.
    pub fn prepare(
        &self,
        overrides: Option<&HashMap<String, f64>>,
        t0: f64,
        policy: UndefinedPolicy,
    ) -> Result<PreparedRun<'_>, SimulationError> {
        let mut base: HashMap<String, f64> = self
            .initial_values
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        if let Some(overrides) = overrides {
            for (id, value) in overrides {
                if !base.contains_key(id) {
                    return Err(StructureError::UnknownEntity(id.clone()).into());
                }
                base.insert(id.clone(), *value);
            }
        }

        base.insert("t".to_string(), t0);
        assignment_pass(&mut base, &self.graph.initial)?;

        let mut y0 = Vec::with_capacity(self.state_ids.len());
        for id in &self.state_ids {
            let value = base[id];
            if !value.is_finite() {
                return Err(NumericsError::UndefinedInitialValue { entity: id.clone() }.into());
            }
            y0.push(value);
        }

        Ok(PreparedRun {
            system: self,
            base,
            y0,
            policy,
        })
    }

    /// Right-hand side over the full state vector.
    fn eval_rhs(
        &self,
        base: &HashMap<String, f64>,
        t: f64,
        y: &[f64],
        dydt: &mut [f64],
        policy: UndefinedPolicy,
    ) -> Result<(), SimulationError> {
        let values = self.transient_values(base, t, y)?;

        let mut fluxes = Vec::with_capacity(self.rates.len());
        for rate in &self.rates {
            fluxes.push(rate.flux(&values, policy)?);
        }

        for v in dydt.iter_mut() {
            *v = 0.0;
        }

        for (row, &state_idx) in self.stoich_state_rows.iter().enumerate() {
            let mut sum = 0.0;
            for (j, flux) in fluxes.iter().enumerate() {
                let coefficient = self.stoich.matrix[(row, j)];
                if coefficient != 0.0 {
                    sum += coefficient * flux;
                }
            }
            let volume = values
                .get(&self.row_compartments[row])
                .copied()
                .unwrap_or(1.0);
            dydt[state_idx] = sum / volume;
        }

        if !self.ode_exprs.is_empty() {
            let context = numeric_context(values.iter().map(|(k, v)| (k.as_str(), *v)))?;
            for (state_idx, expr) in &self.ode_exprs {
                dydt[*state_idx] = expr.eval(&context)?;
            }
        }

        Ok(())
    }

    /// Current values of every entity at `(t, y)`, with assignments
    /// recomputed.
    fn transient_values(
        &self,
        base: &HashMap<String, f64>,
        t: f64,
        y: &[f64],
    ) -> Result<HashMap<String, f64>, SimulationError> {
        let mut values = base.clone();
        for (i, id) in self.state_ids.iter().enumerate() {
            values.insert(id.clone(), y[i]);
        }
        values.insert("t".to_string(), t);
        assignment_pass(&mut values, &self.graph.transient)?;
        Ok(values)
    }

    /// Integrates one prepared run over the setup's time window.
    pub fn integrate(
        &self,
        setup: &SimulationSetup,
        overrides: Option<&HashMap<String, f64>>,
        output_times: Option<&[f64]>,
        cancel: Option<&CancelToken>,
    ) -> Result<SimulationResult, SimulationError> {
        setup.validate()?;
        let run = self.prepare(overrides, setup.t0, setup.undefined_policy)?;

        let times = match output_times {
            Some(times) => times.to_vec(),
            None => setup.output_times(),
        };
        let stepper = setup.stepper();

        let output = if setup.reduced && !self.conservation.is_trivial() {
            let reduced = ReducedRhs::new(&run);
            let y0_reduced = reduced.project(&run.y0);
            let mut out =
                stepper.integrate(&reduced, &y0_reduced, setup.t0, &times, cancel)?;
            out.trajectory = reduced.expand_trajectory(out.trajectory);
            out
        } else {
            let rhs = FullRhs { run: &run };
            stepper.integrate(&rhs, &run.y0, setup.t0, &times, cancel)?
        };

        self.collect_results(&run, output)
    }

    /// Runs several configurations in parallel, one result per entry.
    ///
    /// `overrides` must have the same length as `setups`; use an empty map
    /// for runs without overrides.
    pub fn bulk_integrate(
        &self,
        setups: &[SimulationSetup],
        overrides: &[HashMap<String, f64>],
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<SimulationResult>, SimulationError> {
        setups
            .par_iter()
            .zip(overrides.par_iter())
            .map(|(setup, over)| {
                let over = (!over.is_empty()).then_some(over);
                self.integrate(setup, over, None, cancel)
            })
            .collect()
    }

    /// Converts raw integrator output into a result with assignment curves.
    fn collect_results(
        &self,
        run: &PreparedRun,
        output: IntegrationOutput,
    ) -> Result<SimulationResult, SimulationError> {
        let IntegrationOutput {
            trajectory,
            truncated,
        } = output;

        let mut result = SimulationResult::new(trajectory.time.clone());
        if let Some(truncation) = truncated {
            result.status = SimulationStatus::Truncated {
                reason: truncation.reason,
                reached: truncation.reached,
            };
        }

        for (i, id) in self.state_ids.iter().enumerate() {
            let curve: Vec<f64> = trajectory.states.iter().map(|y| y[i]).collect();
            result.add_species(id.clone(), curve);
        }

        let assignment_ids = self.assignment_ids();
        if !assignment_ids.is_empty() {
            let mut curves: HashMap<String, Vec<f64>> = assignment_ids
                .iter()
                .map(|id| (id.clone(), Vec::with_capacity(trajectory.time.len())))
                .collect();

            for (t, y) in trajectory.time.iter().zip(&trajectory.states) {
                let values = self.transient_values(&run.base, *t, y)?;
                for id in &assignment_ids {
                    curves.get_mut(id).unwrap().push(values[id]);
                }
            }

            for (id, curve) in curves {
                result.add_assignment(id, curve);
            }
        }

        Ok(result)
    }
}

impl TryFrom<&KineticModel> for OdeSystem {
    type Error = SimulationError;

    fn try_from(model: &KineticModel) -> Result<Self, Self::Error> {
        OdeSystem::new(model, None)
    }
}

impl<'a> PreparedRun<'a> {
    /// Number of integrated entities.
    pub fn dim(&self) -> usize {
        self.system.state_ids.len()
    }

    /// Right-hand side at `(t, y)` over the full state vector.
    pub fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        self.system.eval_rhs(&self.base, t, y, dydt, self.policy)
    }

    /// Jacobian ∂f/∂y at `(t, y)` by central finite differences.
    pub fn jacobian(&self, t: f64, y: &[f64]) -> Result<DMatrix<f64>, SimulationError> {
        let n = self.dim();
        let mut jac = DMatrix::zeros(n, n);
        let mut y_probe = y.to_vec();
        let mut f_plus = vec![0.0; n];
        let mut f_minus = vec![0.0; n];

        for j in 0..n {
            let orig = y_probe[j];
            let h = 1e-8 * (1.0 + orig.abs());
            y_probe[j] = orig + h;
            self.rhs(t, &y_probe, &mut f_plus)?;
            y_probe[j] = orig - h;
            self.rhs(t, &y_probe, &mut f_minus)?;
            y_probe[j] = orig;

            for i in 0..n {
                jac[(i, j)] = (f_plus[i] - f_minus[i]) / (2.0 * h);
            }
        }

        Ok(jac)
    }

    /// The underlying compiled system.
    pub fn system(&self) -> &OdeSystem {
        self.system
    }
}

/// Full-state right-hand side adapter for the integrator.
struct FullRhs<'a, 'b> {
    run: &'b PreparedRun<'a>,
}

impl RhsSystem for FullRhs<'_, '_> {
    fn dim(&self) -> usize {
        self.run.dim()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        self.run.rhs(t, y, dydt)
    }
}

/// Conservation-reduced right-hand side: integrates only independent
/// entities, reconstructing dependent species from conserved totals.
pub(crate) struct ReducedRhs<'a, 'b> {
    run: &'b PreparedRun<'a>,
    /// State indices that remain integrated, in state order.
    kept: Vec<usize>,
    /// Conserved totals for the dependent stoichiometry rows.
    totals: Vec<f64>,
}

impl<'a, 'b> ReducedRhs<'a, 'b> {
    pub(crate) fn new(run: &'b PreparedRun<'a>) -> Self {
        let system = run.system;
        let dependent_states: Vec<usize> = system
            .conservation
            .dependent
            .iter()
            .map(|&row| system.stoich_state_rows[row])
            .collect();

        let kept: Vec<usize> = (0..system.state_ids.len())
            .filter(|i| !dependent_states.contains(i))
            .collect();

        let y_rows: Vec<f64> = system
            .stoich_state_rows
            .iter()
            .map(|&si| run.y0[si])
            .collect();
        let totals = system.conservation.totals(&y_rows);

        Self { run, kept, totals }
    }

    /// Projects a full state vector onto the reduced coordinates.
    pub(crate) fn project(&self, y_full: &[f64]) -> Vec<f64> {
        self.kept.iter().map(|&i| y_full[i]).collect()
    }

    /// Expands a reduced state vector back to the full state.
    pub(crate) fn expand(&self, y_reduced: &[f64]) -> Vec<f64> {
        let system = self.run.system;
        let mut y_full = vec![0.0; system.state_ids.len()];
        for (k, &i) in self.kept.iter().enumerate() {
            y_full[i] = y_reduced[k];
        }

        let conservation = &system.conservation;
        let y_independent: Vec<f64> = conservation
            .independent
            .iter()
            .map(|&row| y_full[system.stoich_state_rows[row]])
            .collect();

        let mut rows_full = vec![0.0; system.stoich.species.len()];
        conservation.reconstruct(&y_independent, &self.totals, &mut rows_full);
        for &row in &conservation.dependent {
            y_full[system.stoich_state_rows[row]] = rows_full[row];
        }

        y_full
    }

    /// Expands every state of a reduced trajectory.
    pub(crate) fn expand_trajectory(&self, trajectory: Trajectory) -> Trajectory {
        Trajectory {
            time: trajectory.time,
            states: trajectory
                .states
                .iter()
                .map(|y| self.expand(y))
                .collect(),
        }
    }
}

impl RhsSystem for ReducedRhs<'_, '_> {
    fn dim(&self) -> usize {
        self.kept.len()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) -> Result<(), SimulationError> {
        let y_full = self.expand(y);
        let mut dydt_full = vec![0.0; y_full.len()];
        self.run.rhs(t, &y_full, &mut dydt_full)?;
        for (k, &i) in self.kept.iter().enumerate() {
            dydt[k] = dydt_full[i];
        }
        Ok(())
    }
}

/// Evaluates an ordered assignment pass, updating the value map in place.
fn assignment_pass(
    values: &mut HashMap<String, f64>,
    steps: &[AssignmentStep],
) -> Result<(), SimulationError> {
    if steps.is_empty() {
        return Ok(());
    }

    let mut context = numeric_context(values.iter().map(|(k, v)| (k.as_str(), *v)))?;
    for step in steps {
        let value = step.expr.eval(&context)?;
        set_numeric(&mut context, &step.entity, value)?;
        values.insert(step.entity.clone(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::model::{
        Binding, CompartmentBuilder, FunctionParameter, GlobalQuantityBuilder, KineticLaw,
        KineticModelBuilder, ParameterRole, QuantityValue, RateFunctionBuilder, ReactionBuilder,
        ReactionElement, SpeciesBuilder,
    };
    use crate::simulation::setup::SimulationSetupBuilder;

    /// A' <-> A with mass-action rates k1, k2.
    fn isomerization_model(k1: f64, k2: f64) -> KineticModel {
        KineticModelBuilder::default()
            .name("isomerization")
            .to_compartments(
                CompartmentBuilder::default()
                    .id("cell")
                    .name("cell")
                    .build()
                    .unwrap(),
            )
            .to_species(
                SpeciesBuilder::default()
                    .id("A_tr")
                    .name("transient alpha")
                    .compartment("cell")
                    .initial_concentration(1.0)
                    .build()
                    .unwrap(),
            )
            .to_species(
                SpeciesBuilder::default()
                    .id("A")
                    .name("alpha")
                    .compartment("cell")
                    .initial_concentration(0.5)
                    .build()
                    .unwrap(),
            )
            .to_quantities(
                GlobalQuantityBuilder::default()
                    .id("k1")
                    .name("k1")
                    .initial_value(QuantityValue::Defined(k1))
                    .build()
                    .unwrap(),
            )
            .to_quantities(
                GlobalQuantityBuilder::default()
                    .id("k2")
                    .name("k2")
                    .initial_value(QuantityValue::Defined(k2))
                    .build()
                    .unwrap(),
            )
            .to_functions(
                RateFunctionBuilder::default()
                    .id("mass_action_rev")
                    .name("reversible mass action")
                    .formula("kf * S - kr * P")
                    .to_parameters(FunctionParameter::new("kf", ParameterRole::Constant))
                    .to_parameters(FunctionParameter::new("S", ParameterRole::Substrate))
                    .to_parameters(FunctionParameter::new("kr", ParameterRole::Constant))
                    .to_parameters(FunctionParameter::new("P", ParameterRole::Product))
                    .build()
                    .unwrap(),
            )
            .to_reactions(
                ReactionBuilder::default()
                    .id("iso")
                    .name("isomerization")
                    .reversible(true)
                    .to_substrates(ReactionElement::new("A_tr", 1.0))
                    .to_products(ReactionElement::new("A", 1.0))
                    .kinetic_law(
                        KineticLaw::new("mass_action_rev")
                            .bind("kf", Binding::Quantity("k1".to_string()))
                            .bind("S", Binding::Species("A_tr".to_string()))
                            .bind("kr", Binding::Quantity("k2".to_string()))
                            .bind("P", Binding::Species("A".to_string())),
                    )
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn zero_rate_constants_freeze_the_state() {
        let model = isomerization_model(0.0, 0.0);
        let system = OdeSystem::try_from(&model).unwrap();
        let setup = SimulationSetupBuilder::default()
            .t1(5.0)
            .dt(1.0)
            .build()
            .unwrap();

        let result = system.integrate(&setup, None, None, None).unwrap();
        assert!(result.status.is_complete());
        for value in result.species.get("A_tr").unwrap() {
            assert!((value - 1.0).abs() < 1e-12);
        }
        for value in result.species.get("A").unwrap() {
            assert!((value - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn reduced_and_full_integration_agree() {
        let model = isomerization_model(0.8, 0.3);
        let system = OdeSystem::try_from(&model).unwrap();
        assert!(!system.conservation().is_trivial());

        let full = SimulationSetupBuilder::default()
            .t1(4.0)
            .dt(0.5)
            .rtol(1e-9)
            .build()
            .unwrap();
        let mut reduced = full.clone();
        reduced.reduced = true;

        let a = system.integrate(&full, None, None, None).unwrap();
        let b = system.integrate(&reduced, None, None, None).unwrap();

        for id in ["A", "A_tr"] {
            let ya = a.species.get(id).unwrap();
            let yb = b.species.get(id).unwrap();
            for (va, vb) in ya.iter().zip(yb) {
                assert!((va - vb).abs() < 1e-6, "{id}: {va} vs {vb}");
            }
        }

        // the reduced run conserves total mass exactly
        let a_tr = b.species.get("A_tr").unwrap();
        let a_curve = b.species.get("A").unwrap();
        for (x, y) in a_tr.iter().zip(a_curve) {
            assert!((x + y - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn overrides_replace_initial_values() {
        let model = isomerization_model(0.0, 0.0);
        let system = OdeSystem::try_from(&model).unwrap();
        let setup = SimulationSetupBuilder::default().t1(1.0).build().unwrap();

        let overrides = HashMap::from([("A".to_string(), 7.0)]);
        let result = system
            .integrate(&setup, Some(&overrides), None, None)
            .unwrap();
        assert!((result.species.get("A").unwrap()[0] - 7.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_override_is_rejected() {
        let model = isomerization_model(0.0, 0.0);
        let system = OdeSystem::try_from(&model).unwrap();
        let setup = SimulationSetup::default();
        let overrides = HashMap::from([("nope".to_string(), 1.0)]);

        assert!(system
            .integrate(&setup, Some(&overrides), None, None)
            .is_err());
    }

    #[test]
    fn demo_model_simulates_with_assignment_curves() {
        let model = demo::phospho_network();
        let system = OdeSystem::try_from(&model).unwrap();
        let setup = SimulationSetupBuilder::default()
            .t1(10.0)
            .dt(1.0)
            .build()
            .unwrap();

        let result = system.integrate(&setup, None, None, None).unwrap();
        assert!(result.status.is_complete());
        assert!(result.assignments.contains_key("kappa_pka"));
        // competition terms are non-negative along the trajectory
        for value in result.assignments.get("kappa_pka").unwrap() {
            assert!(*value >= 0.0);
        }
    }
}
