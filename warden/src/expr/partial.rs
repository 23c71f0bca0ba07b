//! Partial evaluation of a flattened matcher against a request binding.
//!
//! Substitutes request-bound identifiers with constants, leaving a residual
//! tree that depends only on policy-side identifiers. Function calls are
//! preserved untouched — this pass never executes anything — so the residual
//! is exactly what the SQL lowering over-approximates.

use std::collections::HashMap;

use crate::error::ExprError;

use super::ast::{Expr, ExprKind, Value};

/// Substitute `binding` into `expr`. The input must be flattened; a surviving
/// select node is an upstream invariant violation.
pub fn partial_eval(expr: &Expr, binding: &HashMap<String, Value>) -> Result<Expr, ExprError> {
    match &expr.kind {
        ExprKind::Const(_) => Ok(expr.clone()),
        ExprKind::Ident(name) => match binding.get(name) {
            Some(value) => Ok(Expr::new(expr.id, ExprKind::Const(value.clone()))),
            None => Ok(expr.clone()),
        },
        ExprKind::Call {
            function,
            target,
            args,
        } => {
            let new_args = args
                .iter()
                .map(|arg| partial_eval(arg, binding))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::new(
                expr.id,
                ExprKind::Call {
                    function: function.clone(),
                    target: target.clone(),
                    args: new_args,
                },
            ))
        }
        ExprKind::List(elems) => {
            let new_elems = elems
                .iter()
                .map(|elem| partial_eval(elem, binding))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::new(expr.id, ExprKind::List(new_elems)))
        }
        ExprKind::Select { .. } => Err(ExprError::SelectUnsupported),
    }
}
