//! Identifier flattening.
//!
//! Nested attribute access (`r.obj.Owner`) is rewritten into flat scalar
//! identifiers (`r_obj_Owner`) so the evaluator binds plain names and the SQL
//! lowering sees rule-store column names. The same escape is applied to model
//! tokens and to request bindings, so all three sides line up.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, ExprError};

use super::ast::{Expr, ExprKind, Value};

/// The canonical identifier escape.
///
/// Doubles every `_`, doubles every run of two or more consecutive `.`, then
/// replaces each remaining `.` with `_`. The escape is injective: two distinct
/// inputs can never collapse to the same output.
pub fn dots_replaced(s: &str) -> String {
    static UNDERSCORES: OnceLock<Regex> = OnceLock::new();
    static DOT_RUNS: OnceLock<Regex> = OnceLock::new();

    let underscores = UNDERSCORES.get_or_init(|| Regex::new("(_)").unwrap());
    let dot_runs = DOT_RUNS.get_or_init(|| Regex::new(r"(\.{2,})").unwrap());

    let s = underscores.replace_all(s, "$1$1");
    let s = dot_runs.replace_all(&s, "$1$1");
    s.replace('.', "_")
}

/// Flatten an expression tree, collecting the set of identifier names used.
///
/// Select chains over identifiers collapse into a single flat identifier; any
/// other select operand (a call result, a literal) is unsupported. Method
/// calls never survive this pass.
pub fn flatten_expr(expr: &Expr) -> Result<(Expr, BTreeSet<String>), ExprError> {
    let mut identifiers = BTreeSet::new();
    let flat = flatten(expr, &mut identifiers)?;
    Ok((flat, identifiers))
}

fn flatten(expr: &Expr, identifiers: &mut BTreeSet<String>) -> Result<Expr, ExprError> {
    match &expr.kind {
        ExprKind::Const(_) => Ok(expr.clone()),
        ExprKind::Ident(name) => {
            let flat = dots_replaced(name);
            identifiers.insert(flat.clone());
            Ok(Expr::new(expr.id, ExprKind::Ident(flat)))
        }
        ExprKind::Select { .. } => {
            let name = flatten_select(expr)?;
            identifiers.insert(name.clone());
            Ok(Expr::new(expr.id, ExprKind::Ident(name)))
        }
        ExprKind::Call {
            function,
            target,
            args,
        } => {
            if target.is_some() {
                return Err(ExprError::MethodCallUnsupported);
            }
            let flat_args = args
                .iter()
                .map(|arg| flatten(arg, identifiers))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::new(
                expr.id,
                ExprKind::Call {
                    function: function.clone(),
                    target: None,
                    args: flat_args,
                },
            ))
        }
        ExprKind::List(elems) => {
            let flat_elems = elems
                .iter()
                .map(|elem| flatten(elem, identifiers))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::new(expr.id, ExprKind::List(flat_elems)))
        }
    }
}

fn flatten_select(expr: &Expr) -> Result<String, ExprError> {
    match &expr.kind {
        ExprKind::Ident(name) => Ok(dots_replaced(name)),
        ExprKind::Select { operand, field } => {
            let base = flatten_select(operand)?;
            Ok(format!("{}_{}", base, dots_replaced(field)))
        }
        _ => Err(ExprError::SelectUnsupported),
    }
}

/// Flatten a request binding: pair each (already flattened) request token
/// with its value, exploding nested JSON objects into scalar identifiers with
/// the same escape the matcher side uses.
///
/// Scalar leaves map onto the constant kinds; arrays and any other shape are
/// unsupported literals.
pub fn flatten_request(
    tokens: &[String],
    rvals: &[serde_json::Value],
) -> Result<HashMap<String, Value>, Error> {
    let mut binding = HashMap::new();
    for (token, rval) in tokens.iter().zip(rvals) {
        flatten_value(token, rval, &mut binding)?;
    }
    Ok(binding)
}

fn flatten_value(
    key: &str,
    value: &serde_json::Value,
    binding: &mut HashMap<String, Value>,
) -> Result<(), Error> {
    match value {
        serde_json::Value::Object(fields) => {
            for (subkey, subval) in fields {
                let key = format!("{}_{}", key, dots_replaced(subkey));
                flatten_value(&key, subval, binding)?;
            }
            Ok(())
        }
        serde_json::Value::Null => {
            binding.insert(key.to_string(), Value::Null);
            Ok(())
        }
        serde_json::Value::Bool(b) => {
            binding.insert(key.to_string(), Value::Bool(*b));
            Ok(())
        }
        serde_json::Value::Number(n) => {
            let v = if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::Uint(u)
            } else if let Some(d) = n.as_f64() {
                Value::Double(d)
            } else {
                return Err(ExprError::LiteralUnsupported(key.to_string()).into());
            };
            binding.insert(key.to_string(), v);
            Ok(())
        }
        serde_json::Value::String(s) => {
            binding.insert(key.to_string(), Value::Str(s.clone()));
            Ok(())
        }
        serde_json::Value::Array(_) => Err(ExprError::LiteralUnsupported(key.to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::parse::parse;
    use super::*;

    #[test]
    fn escape_basics() {
        assert_eq!(dots_replaced("a.b"), "a_b");
        assert_eq!(dots_replaced("a.b.c"), "a_b_c");
        assert_eq!(dots_replaced("a_b"), "a__b");
        assert_eq!(dots_replaced("a_b.c.d_e"), "a__b_c_d__e");
        // a run of n >= 2 dots doubles in length before replacement
        assert_eq!(dots_replaced("a..b"), "a____b");
        assert_eq!(dots_replaced("plain"), "plain");
    }

    #[test]
    fn escape_is_injective_over_identifier_names() {
        // pairs that would collide under a naive dot-to-underscore rewrite
        let inputs = [
            "a.b", "a_b", "a.b.c", "a_b.c", "a.b_c", "a_b_c", "a_b_c.d", "a_b.c_d",
            "r.obj.Owner", "r.obj_Owner", "r_obj.Owner", "sub", "_x", ".x", "x_", "x.",
        ];
        let mut seen = std::collections::HashMap::new();
        for input in inputs {
            let escaped = dots_replaced(input);
            if let Some(prev) = seen.insert(escaped.clone(), input) {
                panic!("'{prev}' and '{input}' both escape to '{escaped}'");
            }
        }
    }

    #[test]
    fn flattens_select_chains() {
        let expr = parse("r.obj.Owner.Name == p.sub && r.act == p.act").unwrap();
        let (flat, identifiers) = flatten_expr(&expr).unwrap();
        assert_eq!(
            flat.to_string(),
            "((r_obj_Owner_Name == p_sub) && (r_act == p_act))"
        );
        let names: Vec<_> = identifiers.iter().cloned().collect();
        assert_eq!(names, vec!["p_act", "p_sub", "r_act", "r_obj_Owner_Name"]);
    }

    #[test]
    fn flattens_call_arguments() {
        let expr = parse("keyMatch(r.obj, p.obj)").unwrap();
        let (flat, identifiers) = flatten_expr(&expr).unwrap();
        assert_eq!(flat.to_string(), "keyMatch(r_obj, p_obj)");
        assert!(identifiers.contains("r_obj") && identifiers.contains("p_obj"));
    }

    #[test]
    fn rejects_method_calls() {
        let expr = parse("r.obj.startsWith(\"/x\")").unwrap();
        assert!(matches!(
            flatten_expr(&expr),
            Err(ExprError::MethodCallUnsupported)
        ));
    }

    #[test]
    fn rejects_select_on_call_result() {
        let expr = parse("f(a).b == 1").unwrap();
        assert!(matches!(
            flatten_expr(&expr),
            Err(ExprError::SelectUnsupported)
        ));
    }

    #[test]
    fn request_binding_explodes_objects() {
        let tokens = vec!["r_sub".to_string(), "r_obj".to_string()];
        let rvals = vec![
            json!("alice"),
            json!({"Owner": {"Name": "owner47"}, "kind": "doc"}),
        ];
        let binding = flatten_request(&tokens, &rvals).unwrap();
        assert_eq!(binding["r_sub"], Value::Str("alice".into()));
        assert_eq!(binding["r_obj_Owner_Name"], Value::Str("owner47".into()));
        assert_eq!(binding["r_obj_kind"], Value::Str("doc".into()));
    }

    #[test]
    fn request_binding_escapes_subkeys() {
        let tokens = vec!["r_obj".to_string()];
        let rvals = vec![json!({"a.b": 1, "a_b": 2})];
        let binding = flatten_request(&tokens, &rvals).unwrap();
        assert_eq!(binding["r_obj_a_b"], Value::Int(1));
        assert_eq!(binding["r_obj_a__b"], Value::Int(2));
    }

    #[test]
    fn request_binding_rejects_arrays() {
        let tokens = vec!["r_obj".to_string()];
        let rvals = vec![json!([1, 2, 3])];
        assert!(flatten_request(&tokens, &rvals).is_err());
    }
}
