//! A small built-in example model.
//!
//! Three phosphorylation states of a substrate protein (`P0` → `A` → `AB`)
//! are interconverted by a kinase (`PKA`) and a phosphatase (`PP1`). All four
//! reactions share the same saturating rate law with a competition
//! correction: each enzyme's substrates compete for the same enzyme pool, so
//! every law carries a `kappa` term summing the competing substrate
//! saturations. The competition terms are assignment quantities recomputed at
//! every evaluation.
//!
//! The model doubles as a compact integration-test fixture and as the output
//! of the CLI's `demo` subcommand.

use crate::model::{
    Binding, CompartmentBuilder, FunctionParameter, GlobalQuantityBuilder, KineticLaw,
    KineticModel, KineticModelBuilder, ParameterRole, QuantityValue, RateFunctionBuilder,
    ReactionBuilder, ReactionElement, SimulationKind, SpeciesBuilder,
};

/// Saturating rate law with enzyme-pool competition.
fn menten_competing() -> crate::model::RateFunction {
    RateFunctionBuilder::default()
        .id("mm_multi")
        .name("Michaelis-Menten (competing substrates)")
        .formula("kcat * E * S / (Km * (1 + kappa - S / Km) + S)")
        .to_parameters(FunctionParameter::new("kcat", ParameterRole::Constant))
        .to_parameters(FunctionParameter::new("E", ParameterRole::Modifier))
        .to_parameters(FunctionParameter::new("S", ParameterRole::Substrate))
        .to_parameters(FunctionParameter::new("Km", ParameterRole::Constant))
        .to_parameters(FunctionParameter::new("kappa", ParameterRole::Constant))
        .build()
        .unwrap()
}

fn fixed_species(id: &str, name: &str, concentration: f64) -> crate::model::Species {
    SpeciesBuilder::default()
        .id(id)
        .name(name)
        .compartment("cytosol")
        .simulation_kind(SimulationKind::Fixed)
        .initial_concentration(concentration)
        .build()
        .unwrap()
}

fn state_species(id: &str, name: &str, concentration: f64) -> crate::model::Species {
    SpeciesBuilder::default()
        .id(id)
        .name(name)
        .compartment("cytosol")
        .initial_concentration(concentration)
        .build()
        .unwrap()
}

fn constant(id: &str, value: f64) -> crate::model::GlobalQuantity {
    GlobalQuantityBuilder::default()
        .id(id)
        .name(id)
        .initial_value(QuantityValue::Defined(value))
        .build()
        .unwrap()
}

fn competition_term(id: &str, expression: &str) -> crate::model::GlobalQuantity {
    GlobalQuantityBuilder::default()
        .id(id)
        .name(id)
        .simulation_kind(SimulationKind::Assignment)
        .expression(Some(expression.to_string()))
        .build()
        .unwrap()
}

fn menten_reaction(
    id: &str,
    name: &str,
    substrate: &str,
    product: &str,
    enzyme: &str,
    kcat: &str,
    km: &str,
    kappa: &str,
) -> crate::model::Reaction {
    ReactionBuilder::default()
        .id(id)
        .name(name)
        .to_substrates(ReactionElement::new(substrate, 1.0))
        .to_products(ReactionElement::new(product, 1.0))
        .to_modifiers(enzyme.to_string())
        .kinetic_law(
            KineticLaw::new("mm_multi")
                .bind("kcat", Binding::Quantity(kcat.to_string()))
                .bind("E", Binding::Species(enzyme.to_string()))
                .bind("S", Binding::Species(substrate.to_string()))
                .bind("Km", Binding::Quantity(km.to_string()))
                .bind("kappa", Binding::Quantity(kappa.to_string())),
        )
        .build()
        .unwrap()
}

/// Builds the three-state phosphorylation demo model.
pub fn phospho_network() -> KineticModel {
    KineticModelBuilder::default()
        .name("Substrate phosphorylation cycle")
        .to_compartments(
            CompartmentBuilder::default()
                .id("cytosol")
                .name("cytosol")
                .build()
                .unwrap(),
        )
        .to_species(state_species("P0", "unphosphorylated substrate", 1e-5))
        .to_species(state_species("A", "mono-phosphorylated substrate", 0.0))
        .to_species(state_species("AB", "bis-phosphorylated substrate", 0.0))
        .to_species(fixed_species("PKA", "protein kinase A", 5e-7))
        .to_species(fixed_species("PP1", "protein phosphatase 1", 5e-7))
        .to_quantities(constant("k1", 0.34))
        .to_quantities(constant("k2", 0.08))
        .to_quantities(constant("k4", 0.62))
        .to_quantities(constant("k5", 0.11))
        .to_quantities(constant("K1", 4.8e-5))
        .to_quantities(constant("K2", 5.0e-5))
        .to_quantities(constant("K4", 7.5e-5))
        .to_quantities(constant("K5", 6.1e-5))
        .to_quantities(competition_term("kappa_pka", "P0 / K1 + A / K4"))
        .to_quantities(competition_term("kappa_pp1", "A / K2 + AB / K5"))
        .to_functions(menten_competing())
        .to_reactions(menten_reaction(
            "r1",
            "P0 phosphorylation",
            "P0",
            "A",
            "PKA",
            "k1",
            "K1",
            "kappa_pka",
        ))
        .to_reactions(menten_reaction(
            "r2",
            "A dephosphorylation",
            "A",
            "P0",
            "PP1",
            "k2",
            "K2",
            "kappa_pp1",
        ))
        .to_reactions(menten_reaction(
            "r4",
            "A phosphorylation",
            "A",
            "AB",
            "PKA",
            "k4",
            "K4",
            "kappa_pka",
        ))
        .to_reactions(menten_reaction(
            "r5",
            "AB dephosphorylation",
            "AB",
            "A",
            "PP1",
            "k5",
            "K5",
            "kappa_pp1",
        ))
        .build()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::check_model;

    #[test]
    fn demo_model_is_structurally_valid() {
        let report = check_model(&phospho_network());
        assert!(report.is_valid, "{report}");
    }

    #[test]
    fn total_substrate_is_conserved_by_stoichiometry() {
        let model = phospho_network();
        let system = crate::simulation::system::OdeSystem::try_from(&model).unwrap();
        // P0 + A + AB is a conserved moiety
        assert!(!system.conservation().is_trivial());
    }
}
