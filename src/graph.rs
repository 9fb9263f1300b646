//! Dependency resolution for assignment expressions.
//!
//! Assignment-type species and global quantities are recomputed algebraically
//! at every evaluation. Their expressions may reference each other, so each
//! recomputation pass needs a dependency-first order. Two independent passes
//! exist: one for resolving the initial state (using `initial_expression`
//! where present) and one for transient recomputation during integration.
//! Cyclic dependencies are a structural defect and reject the model.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::expr::CompiledExpression;
use crate::model::{KineticModel, SimulationKind, StructureError};

/// One assignment in evaluation order: the target entity and its compiled
/// expression.
#[derive(Debug, Clone)]
pub struct AssignmentStep {
    pub entity: String,
    pub expr: CompiledExpression,
}

/// Dependency-ordered assignment passes derived from a model.
#[derive(Debug, Clone, Default)]
pub struct AssignmentGraph {
    /// Pass used when resolving the initial state at t0.
    pub initial: Vec<AssignmentStep>,
    /// Pass used during integration and steady-state evaluation.
    pub transient: Vec<AssignmentStep>,
}

impl AssignmentGraph {
    /// Builds both assignment passes for a model.
    ///
    /// # Errors
    ///
    /// * [`StructureError::MissingExpression`] for an assignment entity
    ///   without an expression.
    /// * [`StructureError::BadExpression`] when parsing fails.
    /// * [`StructureError::CyclicDependency`] when the assignments cannot be
    ///   ordered.
    pub fn from_model(model: &KineticModel) -> Result<Self, StructureError> {
        let mut transient_sources: Vec<(String, String)> = Vec::new();
        let mut initial_sources: Vec<(String, String)> = Vec::new();

        for species in &model.species {
            if species.simulation_kind != SimulationKind::Assignment {
                continue;
            }
            let expr = species.expression.as_deref().ok_or_else(|| {
                StructureError::MissingExpression {
                    entity: species.id.clone(),
                    kind: SimulationKind::Assignment,
                }
            })?;
            transient_sources.push((species.id.clone(), expr.to_string()));
            let initial = species.initial_expression.as_deref().unwrap_or(expr);
            initial_sources.push((species.id.clone(), initial.to_string()));
        }

        for quantity in &model.quantities {
            if quantity.simulation_kind != SimulationKind::Assignment {
                continue;
            }
            let expr = quantity.expression.as_deref().ok_or_else(|| {
                StructureError::MissingExpression {
                    entity: quantity.id.clone(),
                    kind: SimulationKind::Assignment,
                }
            })?;
            transient_sources.push((quantity.id.clone(), expr.to_string()));
            let initial = quantity.initial_expression.as_deref().unwrap_or(expr);
            initial_sources.push((quantity.id.clone(), initial.to_string()));
        }

        Ok(Self {
            initial: ordered_pass(&initial_sources)?,
            transient: ordered_pass(&transient_sources)?,
        })
    }

    /// True if the model contains no assignment entities at all.
    pub fn is_empty(&self) -> bool {
        self.initial.is_empty() && self.transient.is_empty()
    }
}

/// Compiles the given `(entity, expression)` pairs and sorts them so every
/// assignment is evaluated after the assignments it reads.
fn ordered_pass(sources: &[(String, String)]) -> Result<Vec<AssignmentStep>, StructureError> {
    let mut compiled: HashMap<String, CompiledExpression> = HashMap::new();
    for (entity, raw) in sources {
        let expr =
            CompiledExpression::compile(raw).map_err(|e| StructureError::BadExpression {
                entity: entity.clone(),
                message: e.to_string(),
            })?;
        compiled.insert(entity.clone(), expr);
    }

    let targets: HashSet<&str> = sources.iter().map(|(entity, _)| entity.as_str()).collect();

    // edges: dependency -> dependents; indegree counts unmet dependencies
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for (entity, _) in sources {
        indegree.insert(entity.as_str(), 0);
    }

    for (entity, _) in sources {
        for symbol in compiled[entity.as_str()].variables() {
            if symbol != *entity && targets.contains(symbol.as_str()) {
                let dependency = *targets.get(symbol.as_str()).unwrap();
                dependents.entry(dependency).or_default().push(entity.as_str());
                *indegree.get_mut(entity.as_str()).unwrap() += 1;
            }
        }
    }

    // Kahn's algorithm; BTreeSet keeps the order deterministic across runs
    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(entity, _)| *entity)
        .collect();

    let mut order: Vec<AssignmentStep> = Vec::with_capacity(sources.len());
    while let Some(&entity) = ready.iter().next() {
        ready.remove(entity);
        order.push(AssignmentStep {
            entity: entity.to_string(),
            expr: compiled[entity].clone(),
        });

        if let Some(next) = dependents.get(entity) {
            for dependent in next {
                let deg = indegree.get_mut(*dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() != sources.len() {
        let resolved: HashSet<&str> = order.iter().map(|s| s.entity.as_str()).collect();
        let mut entities: Vec<String> = indegree
            .keys()
            .filter(|entity| !resolved.contains(**entity))
            .map(|entity| entity.to_string())
            .collect();
        entities.sort();
        return Err(StructureError::CyclicDependency { entities });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GlobalQuantityBuilder, KineticModelBuilder};

    fn assignment(id: &str, expr: &str) -> crate::model::GlobalQuantity {
        GlobalQuantityBuilder::default()
            .id(id)
            .name(id)
            .simulation_kind(SimulationKind::Assignment)
            .expression(Some(expr.to_string()))
            .build()
            .unwrap()
    }

    #[test]
    fn orders_chained_assignments() {
        let model = KineticModelBuilder::default()
            .name("chain")
            .to_quantities(assignment("c", "b + 1"))
            .to_quantities(assignment("b", "a * 2"))
            .to_quantities(assignment("a", "k0"))
            .build()
            .unwrap();

        let graph = AssignmentGraph::from_model(&model).unwrap();
        let order: Vec<&str> = graph.transient.iter().map(|s| s.entity.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn detects_cycles() {
        let model = KineticModelBuilder::default()
            .name("cycle")
            .to_quantities(assignment("a", "b + 1"))
            .to_quantities(assignment("b", "a + 1"))
            .build()
            .unwrap();

        let err = AssignmentGraph::from_model(&model).unwrap_err();
        match err {
            StructureError::CyclicDependency { entities } => {
                assert_eq!(entities, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn initial_pass_uses_initial_expression() {
        let mut quantity = assignment("kappa", "S / Km");
        quantity.initial_expression = Some("0".to_string());
        let model = KineticModelBuilder::default()
            .name("initial")
            .to_quantities(quantity)
            .build()
            .unwrap();

        let graph = AssignmentGraph::from_model(&model).unwrap();
        assert_eq!(graph.initial[0].expr.source(), "0");
        assert_eq!(graph.transient[0].expr.source(), "S / Km");
    }

    #[test]
    fn missing_expression_is_rejected() {
        let quantity = GlobalQuantityBuilder::default()
            .id("a")
            .name("a")
            .simulation_kind(SimulationKind::Assignment)
            .build()
            .unwrap();
        let model = KineticModelBuilder::default()
            .name("broken")
            .to_quantities(quantity)
            .build()
            .unwrap();

        assert!(matches!(
            AssignmentGraph::from_model(&model),
            Err(StructureError::MissingExpression { .. })
        ));
    }
}
