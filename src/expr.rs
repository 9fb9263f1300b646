//! Expression compilation and evaluation.
//!
//! Rate-law formulas and assignment expressions are infix strings. They are
//! compiled once into `evalexpr` operator trees and evaluated against a
//! [`HashMapContext`] holding the current values. Plain math function names
//! (`exp`, `ln`, ...) are rewritten to the `math::` builtins `evalexpr`
//! provides before parsing.

use std::collections::HashSet;

use evalexpr::{
    build_operator_tree, Context, ContextWithMutableVariables, EvalexprError, HashMapContext, Node,
};

/// Math functions rewritten to their `math::` builtin counterparts.
const MATH_FUNCTIONS: [&str; 11] = [
    "exp", "ln", "log", "log2", "log10", "sin", "cos", "tan", "sqrt", "abs", "pow",
];

/// Rewrites bare math function calls to `evalexpr`'s `math::` builtins.
///
/// Only identifiers immediately followed by `(` are rewritten, so variables
/// that merely contain a function name (e.g. `kexp`) are left untouched.
pub fn prepare_expression(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let mut j = i;
            while j < chars.len() && chars[j].is_ascii_whitespace() {
                j += 1;
            }
            let is_call = j < chars.len() && chars[j] == '(';
            let preceded_by_scope = start >= 2 && chars[start - 2] == ':' && chars[start - 1] == ':';

            if is_call && !preceded_by_scope && MATH_FUNCTIONS.contains(&ident.as_str()) {
                out.push_str("math::");
            }
            out.push_str(&ident);
        } else {
            out.push(c);
            i += 1;
        }
    }

    out
}

/// An infix expression compiled to an operator tree, keeping the original
/// source for error messages and serialization.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: String,
    ast: Node,
}

impl CompiledExpression {
    /// Compiles an infix expression.
    ///
    /// # Errors
    ///
    /// Returns the underlying parse error for malformed input; callers map
    /// this to a structure error naming the offending entity.
    pub fn compile(raw: &str) -> Result<Self, EvalexprError> {
        let prepared = prepare_expression(raw);
        Ok(Self {
            source: raw.to_string(),
            ast: build_operator_tree(&prepared)?,
        })
    }

    /// The original (unrewritten) source of the expression.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// All distinct variable identifiers the expression reads.
    pub fn variables(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut vars = Vec::new();
        for ident in self.ast.iter_read_variable_identifiers() {
            if seen.insert(ident) {
                vars.push(ident.to_string());
            }
        }
        vars
    }

    /// Evaluates the expression to a number against the given context.
    pub fn eval(&self, context: &HashMapContext) -> Result<f64, EvalexprError> {
        self.ast.eval_with_context(context)?.as_number()
    }
}

/// Builds an evaluation context from `(identifier, value)` pairs with the
/// builtin math functions enabled.
pub fn numeric_context<'a>(
    values: impl IntoIterator<Item = (&'a str, f64)>,
) -> Result<HashMapContext, EvalexprError> {
    let mut context = HashMapContext::new();
    context.set_builtin_functions_disabled(false)?;
    for (key, value) in values {
        context.set_value(key.into(), value.into())?;
    }
    Ok(context)
}

/// Inserts or replaces a single value in an existing context.
pub fn set_numeric(
    context: &mut HashMapContext,
    key: &str,
    value: f64,
) -> Result<(), EvalexprError> {
    context.set_value(key.into(), value.into())
}
