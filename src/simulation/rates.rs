//! Kinetic law compilation and flux evaluation.
//!
//! A reaction's kinetic law references a [`crate::model::RateFunction`]
//! template and binds each declared parameter to a model entity. Compilation
//! checks the bindings once (completeness, role compatibility, no stray
//! symbols in the formula); evaluation then resolves each parameter against
//! the current value map and computes the instantaneous flux.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::expr::{numeric_context, CompiledExpression};
use crate::model::{Binding, KineticModel, ParameterRole, Reaction, StructureError};

use super::error::NumericsError;

/// How an explicitly undefined operand behaves during flux evaluation.
///
/// Exported models use undefined competition terms to mean "capacity not yet
/// computed"; under `Propagate` the resulting NaN flux is passed through as
/// that convention. Under `Fail` (the default) an undefined operand aborts
/// the evaluation with a domain error instead of poisoning the state
/// silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedPolicy {
    #[default]
    Fail,
    Propagate,
}

/// A reaction's kinetic law with its formula compiled and bindings resolved
/// against the declaring function.
#[derive(Debug, Clone)]
pub struct CompiledRate {
    pub reaction_id: String,
    pub(crate) expr: CompiledExpression,
    /// Parameter name → binding, in the function's declaration order.
    pub(crate) arguments: Vec<(String, Binding)>,
}

/// Compiles the kinetic laws of every reaction in the model.
///
/// # Errors
///
/// Any unresolved or role-incompatible binding, unknown function reference,
/// stray formula symbol, or unknown bound entity is a fatal
/// [`StructureError`]; nothing is evaluated before all laws compile.
pub fn compile_rates(model: &KineticModel) -> Result<Vec<CompiledRate>, StructureError> {
    model
        .reactions
        .iter()
        .map(|reaction| compile_rate(model, reaction))
        .collect()
}

fn compile_rate(model: &KineticModel, reaction: &Reaction) -> Result<CompiledRate, StructureError> {
    let law = &reaction.kinetic_law;
    let function =
        model
            .get_function(&law.function_id)
            .ok_or_else(|| StructureError::UnknownFunction {
                reaction: reaction.id.clone(),
                function: law.function_id.clone(),
            })?;

    let expr = CompiledExpression::compile(&function.formula).map_err(|e| {
        StructureError::BadExpression {
            entity: function.id.clone(),
            message: e.to_string(),
        }
    })?;

    // every symbol the formula reads must be a declared parameter
    for symbol in expr.variables() {
        if !function.parameters.iter().any(|p| p.name == symbol) {
            return Err(StructureError::UnboundFunctionSymbol {
                function: function.id.clone(),
                symbol,
            });
        }
    }

    // every declared parameter must be bound exactly once, with a matching role
    let mut arguments = Vec::with_capacity(function.parameters.len());
    for parameter in &function.parameters {
        let binding = law.bindings.get(&parameter.name).ok_or_else(|| {
            StructureError::UnresolvedBinding {
                reaction: reaction.id.clone(),
                function: function.id.clone(),
                parameter: parameter.name.clone(),
            }
        })?;

        check_binding(model, reaction, parameter.name.as_str(), parameter.role, binding)?;
        arguments.push((parameter.name.clone(), binding.clone()));
    }

    // bindings that do not name any declared parameter are defects too
    for name in law.bindings.keys() {
        if !function.parameters.iter().any(|p| &p.name == name) {
            return Err(StructureError::ExtraBinding {
                reaction: reaction.id.clone(),
                function: function.id.clone(),
                parameter: name.clone(),
            });
        }
    }

    Ok(CompiledRate {
        reaction_id: reaction.id.clone(),
        expr,
        arguments,
    })
}

fn check_binding(
    model: &KineticModel,
    reaction: &Reaction,
    parameter: &str,
    role: ParameterRole,
    binding: &Binding,
) -> Result<(), StructureError> {
    let mismatch = || StructureError::RoleMismatch {
        reaction: reaction.id.clone(),
        parameter: parameter.to_string(),
        role,
    };

    match binding {
        Binding::Species(id) => {
            if model.get_species(id).is_none() {
                return Err(StructureError::UnknownEntity(id.clone()));
            }
            if !matches!(
                role,
                ParameterRole::Substrate | ParameterRole::Product | ParameterRole::Modifier
            ) {
                return Err(mismatch());
            }
        }
        Binding::Quantity(id) => {
            if model.get_quantity(id).is_none() {
                return Err(StructureError::UnknownEntity(id.clone()));
            }
            if role != ParameterRole::Constant {
                return Err(mismatch());
            }
        }
        Binding::Compartment(id) => {
            if model.get_compartment(id).is_none() {
                return Err(StructureError::UnknownEntity(id.clone()));
            }
            if role != ParameterRole::Volume {
                return Err(mismatch());
            }
        }
        Binding::Value(_) => {
            if role != ParameterRole::Constant {
                return Err(mismatch());
            }
        }
    }

    Ok(())
}

impl CompiledRate {
    /// Resolves the argument values of this law against the current value
    /// map.
    fn resolve_arguments(&self, values: &HashMap<String, f64>) -> Vec<(&str, f64)> {
        self.arguments
            .iter()
            .map(|(name, binding)| {
                let value = match binding {
                    Binding::Species(id) | Binding::Quantity(id) | Binding::Compartment(id) => {
                        values.get(id).copied().unwrap_or(f64::NAN)
                    }
                    Binding::Value(v) => *v,
                };
                (name.as_str(), value)
            })
            .collect()
    }

    /// Evaluates the instantaneous flux of this reaction.
    ///
    /// A non-finite result with finite inputs is a non-physical denominator
    /// (rational saturating laws can cancel to zero) and always an error. A
    /// non-finite result fed by an undefined operand follows `policy`.
    pub fn flux(
        &self,
        values: &HashMap<String, f64>,
        policy: UndefinedPolicy,
    ) -> Result<f64, NumericsError> {
        let arguments = self.resolve_arguments(values);
        let has_undefined = arguments.iter().any(|(_, v)| v.is_nan());

        if has_undefined && policy == UndefinedPolicy::Fail {
            return Err(NumericsError::UndefinedOperand {
                reaction: self.reaction_id.clone(),
            });
        }

        let context = numeric_context(arguments).map_err(|_| NumericsError::UndefinedOperand {
            reaction: self.reaction_id.clone(),
        })?;

        let value = self
            .expr
            .eval(&context)
            .map_err(|_| NumericsError::NonPhysicalDenominator {
                reaction: self.reaction_id.clone(),
                value: f64::NAN,
            })?;

        if value.is_finite() {
            return Ok(value);
        }

        if has_undefined {
            // policy is Propagate here; NaN flux is the documented convention
            Ok(f64::NAN)
        } else {
            Err(NumericsError::NonPhysicalDenominator {
                reaction: self.reaction_id.clone(),
                value,
            })
        }
    }
}
