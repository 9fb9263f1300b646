//! Integration tests for the steady-state solver.

use approx::assert_relative_eq;
use kinfit::prelude::*;

/// A <-> B with mass-action rates kf, kr. Analytic steady state:
/// B/A = kf/kr under the conserved total A + B.
fn exchange_model(kf: f64, kr: f64, a0: f64, b0: f64) -> KineticModel {
    KineticModelBuilder::default()
        .name("exchange")
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
                .initial_concentration(a0)
                .build()
                .unwrap(),
        )
        .to_species(
            SpeciesBuilder::default()
                .id("B")
                .name("B")
                .compartment("c")
                .initial_concentration(b0)
                .build()
                .unwrap(),
        )
        .to_quantities(
            GlobalQuantityBuilder::default()
                .id("kf")
                .name("kf")
                .initial_value(QuantityValue::Defined(kf))
                .build()
                .unwrap(),
        )
        .to_quantities(
            GlobalQuantityBuilder::default()
                .id("kr")
                .name("kr")
                .initial_value(QuantityValue::Defined(kr))
                .build()
                .unwrap(),
        )
        .to_functions(
            RateFunctionBuilder::default()
                .id("ma_rev")
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
                .id("x")
                .name("exchange")
                .reversible(true)
                .to_substrates(ReactionElement::new("A", 1.0))
                .to_products(ReactionElement::new("B", 1.0))
                .kinetic_law(
                    KineticLaw::new("ma_rev")
                        .bind("kf", Binding::Quantity("kf".to_string()))
                        .bind("S", Binding::Species("A".to_string()))
                        .bind("kr", Binding::Quantity("kr".to_string()))
                        .bind("P", Binding::Species("B".to_string())),
                )
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

/// A 1D model with an explicit rate expression; `rate` is the full dx/dt.
fn rate_rule_model(id: &str, rate: &str, x0: f64) -> KineticModel {
    KineticModelBuilder::default()
        .name("rate rule")
        .to_quantities(
            GlobalQuantityBuilder::default()
                .id(id)
                .name(id)
                .simulation_kind(SimulationKind::Ode)
                .initial_value(QuantityValue::Defined(x0))
                .expression(Some(rate.to_string()))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[test]
fn newton_finds_exchange_equilibrium() {
    let model = exchange_model(2.0, 1.0, 3.0, 0.0);
    let system = OdeSystem::try_from(&model).unwrap();

    let result = solve_steady_state(&system, &SteadyStateSettings::default(), None, None).unwrap();

    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged { .. }
    ));
    // total 3.0, ratio B/A = 2 => A = 1, B = 2
    assert_relative_eq!(result.state["A"], 1.0, epsilon = 1e-6);
    assert_relative_eq!(result.state["B"], 2.0, epsilon = 1e-6);
    assert!(result.residual_norm <= 1e-9);
    assert_eq!(result.stability, Some(StabilityClass::Stable));
}

#[test]
fn exact_equilibrium_converges_immediately() {
    // start exactly at the analytic equilibrium
    let model = exchange_model(2.0, 1.0, 1.0, 2.0);
    let system = OdeSystem::try_from(&model).unwrap();

    let result = solve_steady_state(&system, &SteadyStateSettings::default(), None, None).unwrap();

    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged {
            method: SteadyStateMethod::Newton
        }
    ));
    assert_eq!(result.iterations, 0);
    assert!(result.residual_norm <= 1e-12);
}

#[test]
fn unstable_state_is_classified() {
    // dx/dt = x: the origin is an unstable equilibrium
    let model = rate_rule_model("x", "1.0 * x", 0.0);
    let system = OdeSystem::try_from(&model).unwrap();

    let result = solve_steady_state(&system, &SteadyStateSettings::default(), None, None).unwrap();

    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged { .. }
    ));
    assert_eq!(result.stability, Some(StabilityClass::Unstable));
}

#[test]
fn saddle_is_classified() {
    // dx/dt = x, dy/dt = -y around the origin
    let mut model = rate_rule_model("x", "1.0 * x", 0.1);
    model.quantities.push(
        GlobalQuantityBuilder::default()
            .id("y")
            .name("y")
            .simulation_kind(SimulationKind::Ode)
            .initial_value(QuantityValue::Defined(0.1))
            .expression(Some("0.0 - y".to_string()))
            .build()
            .unwrap(),
    );
    let system = OdeSystem::try_from(&model).unwrap();

    let result = solve_steady_state(&system, &SteadyStateSettings::default(), None, None).unwrap();

    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged { .. }
    ));
    assert_eq!(result.stability, Some(StabilityClass::Saddle));
    assert_eq!(result.eigenvalues.len(), 2);
}

#[test]
fn constant_drift_does_not_converge() {
    // dx/dt = 1 has no steady state anywhere
    let model = rate_rule_model("x", "1.0 + 0.0 * x", 0.0);
    let system = OdeSystem::try_from(&model).unwrap();

    let settings = SteadyStateSettingsBuilder::default()
        .use_integration(false)
        .use_back_integration(false)
        .max_duration(1e3)
        .build()
        .unwrap();

    let result = solve_steady_state(&system, &settings, None, None).unwrap();

    assert_eq!(result.status, SteadyStateStatus::NotConverged);
    assert_relative_eq!(result.residual_norm, 1.0, epsilon = 1e-12);
    assert!(result.stability.is_none());
}

#[test]
fn integration_fallback_rescues_bad_newton_start() {
    // dx/dt = -x^3: Jacobian vanishes at the solution, Newton from far away
    // creeps; the integration fallback still lands on x = 0
    let model = rate_rule_model("x", "0.0 - x * x * x", 10.0);
    let system = OdeSystem::try_from(&model).unwrap();

    let settings = SteadyStateSettingsBuilder::default()
        .max_iterations(5)
        .tolerance(1e-8)
        .build()
        .unwrap();

    let result = solve_steady_state(&system, &settings, None, None).unwrap();
    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged { .. }
    ));
    assert!(result.state["x"].abs() < 5e-3);
}

#[test]
fn phospho_network_reaches_a_stable_state() {
    let model = kinfit::demo::phospho_network();
    let system = OdeSystem::try_from(&model).unwrap();

    let result = solve_steady_state(&system, &SteadyStateSettings::default(), None, None).unwrap();

    assert!(matches!(
        result.status,
        SteadyStateStatus::Converged { .. }
    ));
    // concentrations stay physical
    for (id, value) in &result.state {
        assert!(*value >= -1e-12, "{id} went negative: {value}");
    }
    // total substrate is preserved by the reduced search
    let total = result.state["P0"] + result.state["A"] + result.state["AB"];
    assert_relative_eq!(total, 1e-5, epsilon = 1e-9);
    assert_eq!(result.stability, Some(StabilityClass::Stable));
}
