//! Lowering of a residual matcher into a SQL WHERE clause.
//!
//! The clause pre-filters rule-store candidates, so the translation must be a
//! sound over-approximation: any node that cannot be expressed faithfully
//! (function calls, `in`, negation, relational operators) lowers to the
//! neutral predicate `1=1`. The candidate set is therefore always a superset
//! of the rules the matcher accepts; exact evaluation filters the rest.

use crate::error::ExprError;

use super::ast::{ops, Expr, ExprKind, Value};

/// The neutral predicate: matches every row.
pub const ALL_CONDITION: &str = "1=1";

/// Lower a residual expression to a WHERE clause over the rule-store columns.
pub fn expr_to_sql(expr: &Expr) -> Result<String, ExprError> {
    match &expr.kind {
        ExprKind::Const(value) => const_to_sql(value),
        ExprKind::Ident(name) => Ok(name.clone()),
        ExprKind::Select { .. } => Err(ExprError::UnsupportedKind("select")),
        ExprKind::List(_) => Err(ExprError::UnsupportedKind("list")),
        ExprKind::Call { function, args, .. } => match function.as_str() {
            f if f == ops::AND => {
                let left = expr_to_sql(&args[0])?;
                let right = expr_to_sql(&args[1])?;
                // 1=1 AND X ≡ X
                if left == ALL_CONDITION {
                    return Ok(right);
                }
                if right == ALL_CONDITION {
                    return Ok(left);
                }
                Ok(format!("({left}) AND ({right})"))
            }
            f if f == ops::OR => {
                let left = expr_to_sql(&args[0])?;
                let right = expr_to_sql(&args[1])?;
                // 1=1 OR X ≡ 1=1
                if left == ALL_CONDITION || right == ALL_CONDITION {
                    return Ok(ALL_CONDITION.to_string());
                }
                Ok(format!("({left}) OR ({right})"))
            }
            f if f == ops::EQ => {
                let left = expr_to_sql(&args[0])?;
                let right = expr_to_sql(&args[1])?;
                Ok(format!("{left} = {right}"))
            }
            // everything else — in, !, relational comparisons, named
            // functions — over-approximates
            _ => Ok(ALL_CONDITION.to_string()),
        },
    }
}

fn const_to_sql(value: &Value) -> Result<String, ExprError> {
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Uint(u) => Ok(u.to_string()),
        Value::Double(d) => Ok(d.to_string()),
        Value::Null => Ok("null".to_string()),
        // double-quoted with backslash escapes; SQLite reads a double-quoted
        // token as a string literal when it names no column
        Value::Str(s) => Ok(format!("{s:?}")),
        Value::Bytes(_) => Err(ExprError::UnsupportedKind("bytes")),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::super::flatten::flatten_expr;
    use super::super::parse::parse;
    use super::super::partial::partial_eval;
    use super::*;

    fn lower(matcher: &str, binding: &[(&str, Value)]) -> String {
        let (flat, _) = flatten_expr(&parse(matcher).unwrap()).unwrap();
        let binding: HashMap<String, Value> = binding
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let residual = partial_eval(&flat, &binding).unwrap();
        expr_to_sql(&residual).unwrap()
    }

    #[test]
    fn equality_triple_becomes_conjunction() {
        let sql = lower(
            "r.sub == p.sub && r.obj == p.obj && r.act == p.act",
            &[
                ("r_sub", Value::Str("alice".into())),
                ("r_obj", Value::Str("data1".into())),
                ("r_act", Value::Str("read".into())),
            ],
        );
        assert_eq!(
            sql,
            "((\"alice\" = p_sub) AND (\"data1\" = p_obj)) AND (\"read\" = p_act)"
        );
    }

    #[test]
    fn calls_collapse_to_neutral_and_simplify_away() {
        let sql = lower(
            "r.sub == p.sub && keyMatch(r.obj, p.obj) && r.act == p.act",
            &[
                ("r_sub", Value::Str("alice".into())),
                ("r_obj", Value::Str("/foo/bar".into())),
                ("r_act", Value::Str("GET".into())),
            ],
        );
        assert_eq!(sql, "(\"alice\" = p_sub) AND (\"GET\" = p_act)");
    }

    #[test]
    fn all_call_matcher_lowers_to_neutral() {
        let sql = lower(
            "g(r.sub, p.sub)",
            &[("r_sub", Value::Str("alice".into()))],
        );
        assert_eq!(sql, ALL_CONDITION);
    }

    #[test]
    fn or_with_neutral_side_absorbs() {
        let sql = lower(
            "keyMatch(r.obj, p.obj) || r.act == p.act",
            &[
                ("r_obj", Value::Str("/x".into())),
                ("r_act", Value::Str("GET".into())),
            ],
        );
        assert_eq!(sql, ALL_CONDITION);

        let sql = lower(
            "r.sub == p.sub || r.act == p.act",
            &[
                ("r_sub", Value::Str("alice".into())),
                ("r_act", Value::Str("GET".into())),
            ],
        );
        assert_eq!(sql, "(\"alice\" = p_sub) OR (\"GET\" = p_act)");
    }

    #[test]
    fn negation_and_relations_over_approximate() {
        let sql = lower(
            "!(r.sub == p.sub)",
            &[("r_sub", Value::Str("alice".into()))],
        );
        assert_eq!(sql, ALL_CONDITION);

        let sql = lower("r.age >= p.age", &[("r_age", Value::Int(30))]);
        assert_eq!(sql, ALL_CONDITION);
    }

    #[test]
    fn scalar_literal_spellings() {
        assert_eq!(lower("r.a == p.a", &[("r_a", Value::Bool(true))]), "true = p_a");
        assert_eq!(lower("r.a == p.a", &[("r_a", Value::Int(-3))]), "-3 = p_a");
        assert_eq!(lower("r.a == p.a", &[("r_a", Value::Uint(7))]), "7 = p_a");
        assert_eq!(
            lower("r.a == p.a", &[("r_a", Value::Double(1.5))]),
            "1.5 = p_a"
        );
        assert_eq!(lower("r.a == p.a", &[("r_a", Value::Null)]), "null = p_a");
        assert_eq!(
            lower("r.a == p.a", &[("r_a", Value::Str("O\"Brien".into()))]),
            "\"O\\\"Brien\" = p_a"
        );
    }

    #[test]
    fn bytes_literal_is_rejected() {
        let expr = Expr::new(0, ExprKind::Const(Value::Bytes(vec![1, 2])));
        assert!(expr_to_sql(&expr).is_err());
    }

    #[test]
    fn list_is_rejected_but_in_over_approximates() {
        // the `in` call itself lowers to 1=1 before its list operand is visited
        let sql = lower("r.act in [\"read\", \"write\"]", &[("r_act", Value::Str("read".into()))]);
        assert_eq!(sql, ALL_CONDITION);

        let bare = Expr::new(0, ExprKind::List(vec![]));
        assert!(expr_to_sql(&bare).is_err());
    }
}
