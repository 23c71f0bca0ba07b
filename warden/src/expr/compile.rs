//! Matcher compilation: parse → flatten → check → evaluator.
//!
//! The checker validates the flattened tree against the declared identifier
//! set and the function registry before any request is evaluated, so matcher
//! typos surface once at compile time instead of per request. All value
//! typing stays dynamic; the declarations carry names and arities only.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, instrument};

use crate::error::{suggest_closest, CompileError, EvalError};
use crate::functions::FunctionRegistry;

use super::ast::{ops, Expr, ExprKind, Value};
use super::flatten::flatten_expr;
use super::parse::parse;

/// A compiled matcher: the flattened tree (reused by partial evaluation), the
/// identifiers it mentions, and the evaluator.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    /// The matcher source text this was compiled from.
    pub source: String,
    /// The flattened expression tree.
    pub flat: Expr,
    /// Identifiers collected during flattening.
    pub identifiers: BTreeSet<String>,
    /// The reusable evaluator.
    pub evaluator: Evaluator,
}

/// Compile matcher text against a set of declared identifiers (request and
/// policy tokens) and a function registry.
#[instrument(level = "debug", skip(declared, registry))]
pub fn compile(
    matcher: &str,
    declared: &BTreeSet<String>,
    registry: &FunctionRegistry,
) -> Result<CompiledMatcher, CompileError> {
    let raw = parse(matcher)?;
    let (flat, identifiers) = flatten_expr(&raw)?;

    // declarations: request tokens ∪ policy tokens ∪ collected identifiers,
    // all dynamically typed
    let mut declarations = declared.clone();
    declarations.extend(identifiers.iter().cloned());

    check(&flat, &declarations, registry)?;
    debug!(
        identifiers = identifiers.len(),
        "matcher compiled: {flat}"
    );

    Ok(CompiledMatcher {
        source: matcher.to_string(),
        flat: flat.clone(),
        identifiers,
        evaluator: Evaluator {
            ast: flat,
            functions: registry.clone(),
        },
    })
}

fn check(
    expr: &Expr,
    declarations: &BTreeSet<String>,
    registry: &FunctionRegistry,
) -> Result<(), CompileError> {
    match &expr.kind {
        ExprKind::Const(_) => Ok(()),
        ExprKind::Ident(name) => {
            if declarations.contains(name) {
                Ok(())
            } else {
                Err(CompileError::UndeclaredIdentifier(name.clone()))
            }
        }
        ExprKind::Select { .. } => Err(crate::error::ExprError::SelectUnsupported.into()),
        ExprKind::Call { function, args, .. } => {
            if ops::is_operator(function) {
                let expected = if function == ops::NOT { 1 } else { 2 };
                if args.len() != expected {
                    return Err(CompileError::WrongArity {
                        function: function.clone(),
                        expected: expected.to_string(),
                        got: args.len(),
                    });
                }
            } else {
                let Some(f) = registry.get(function) else {
                    return Err(CompileError::UnknownFunction {
                        name: function.clone(),
                        suggestion: suggest_closest(function, &registry.names()),
                    });
                };
                if !f.accepts_arity(args.len()) {
                    let arities: Vec<String> =
                        f.arities().iter().map(|a| a.to_string()).collect();
                    return Err(CompileError::WrongArity {
                        function: function.clone(),
                        expected: arities.join(" or "),
                        got: args.len(),
                    });
                }
            }
            args.iter().try_for_each(|arg| check(arg, declarations, registry))
        }
        ExprKind::List(elems) => elems
            .iter()
            .try_for_each(|elem| check(elem, declarations, registry)),
    }
}

/// A reusable evaluator over a flattened expression tree.
#[derive(Debug, Clone)]
pub struct Evaluator {
    ast: Expr,
    functions: FunctionRegistry,
}

impl Evaluator {
    /// Evaluate against a binding of flat identifiers to values.
    pub fn eval(&self, binding: &HashMap<String, Value>) -> Result<Value, EvalError> {
        eval_expr(&self.ast, binding, &self.functions)
    }
}

fn eval_expr(
    expr: &Expr,
    binding: &HashMap<String, Value>,
    functions: &FunctionRegistry,
) -> Result<Value, EvalError> {
    match &expr.kind {
        ExprKind::Const(v) => Ok(v.clone()),
        ExprKind::Ident(name) => binding
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnboundIdentifier(name.clone())),
        ExprKind::Select { .. } => Err(EvalError::UnsupportedExpr("select")),
        ExprKind::List(_) => Err(EvalError::ListValue),
        ExprKind::Call { function, args, .. } => {
            eval_call(function, args, binding, functions)
        }
    }
}

fn eval_call(
    function: &str,
    args: &[Expr],
    binding: &HashMap<String, Value>,
    functions: &FunctionRegistry,
) -> Result<Value, EvalError> {
    match function {
        // boolean connectives short-circuit
        f if f == ops::AND => {
            if !as_bool(ops::AND, eval_expr(&args[0], binding, functions)?)? {
                return Ok(Value::Bool(false));
            }
            let rhs = as_bool(ops::AND, eval_expr(&args[1], binding, functions)?)?;
            Ok(Value::Bool(rhs))
        }
        f if f == ops::OR => {
            if as_bool(ops::OR, eval_expr(&args[0], binding, functions)?)? {
                return Ok(Value::Bool(true));
            }
            let rhs = as_bool(ops::OR, eval_expr(&args[1], binding, functions)?)?;
            Ok(Value::Bool(rhs))
        }
        f if f == ops::NOT => {
            let v = as_bool(ops::NOT, eval_expr(&args[0], binding, functions)?)?;
            Ok(Value::Bool(!v))
        }
        f if f == ops::EQ => {
            let lhs = eval_expr(&args[0], binding, functions)?;
            let rhs = eval_expr(&args[1], binding, functions)?;
            Ok(Value::Bool(lhs.loose_eq(&rhs)))
        }
        f if f == ops::NE => {
            let lhs = eval_expr(&args[0], binding, functions)?;
            let rhs = eval_expr(&args[1], binding, functions)?;
            Ok(Value::Bool(!lhs.loose_eq(&rhs)))
        }
        f if f == ops::LT || f == ops::LE || f == ops::GT || f == ops::GE => {
            let lhs = eval_expr(&args[0], binding, functions)?;
            let rhs = eval_expr(&args[1], binding, functions)?;
            let op = if f == ops::LT {
                ops::LT
            } else if f == ops::LE {
                ops::LE
            } else if f == ops::GT {
                ops::GT
            } else {
                ops::GE
            };
            compare(op, &lhs, &rhs)
        }
        f if f == ops::IN => {
            let lhs = eval_expr(&args[0], binding, functions)?;
            let ExprKind::List(elems) = &args[1].kind else {
                return Err(EvalError::BadOperand {
                    operator: ops::IN,
                    expected: "list",
                    got: "expression",
                });
            };
            for elem in elems {
                let v = eval_expr(elem, binding, functions)?;
                if lhs.loose_eq(&v) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        f if f == ops::ADD || f == ops::SUB || f == ops::MUL || f == ops::DIV || f == ops::REM => {
            let lhs = eval_expr(&args[0], binding, functions)?;
            let rhs = eval_expr(&args[1], binding, functions)?;
            let op = if f == ops::ADD {
                ops::ADD
            } else if f == ops::SUB {
                ops::SUB
            } else if f == ops::MUL {
                ops::MUL
            } else if f == ops::DIV {
                ops::DIV
            } else {
                ops::REM
            };
            arithmetic(op, &lhs, &rhs)
        }
        name => {
            let values = args
                .iter()
                .map(|arg| eval_expr(arg, binding, functions))
                .collect::<Result<Vec<_>, _>>()?;
            let Some(function) = functions.get(name) else {
                return Err(EvalError::Function {
                    function: name.to_string(),
                    message: "not registered".to_string(),
                });
            };
            function.call(&values)
        }
    }
}

fn as_bool(operator: &'static str, v: Value) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::BadOperand {
            operator,
            expected: "bool",
            got: other.kind(),
        }),
    }
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Uint(u) => Some(*u as f64),
        Value::Double(d) => Some(*d),
        _ => None,
    }
}

fn compare(op: &'static str, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
        (Value::Uint(a), Value::Uint(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => match (numeric(lhs), numeric(rhs)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => {
                return Err(EvalError::BadOperands {
                    operator: op,
                    lhs: lhs.kind(),
                    rhs: rhs.kind(),
                });
            }
        },
    };
    // incomparable (NaN) orders as false for every relation
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let result = match op {
        _ if op == ops::LT => ordering == Ordering::Less,
        _ if op == ops::LE => ordering != Ordering::Greater,
        _ if op == ops::GT => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    };
    Ok(Value::Bool(result))
}

fn arithmetic(op: &'static str, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    // string concatenation rides on '+'
    if op == ops::ADD {
        if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }

    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let result = match op {
            _ if op == ops::ADD => a.checked_add(*b),
            _ if op == ops::SUB => a.checked_sub(*b),
            _ if op == ops::MUL => a.checked_mul(*b),
            _ if op == ops::DIV => {
                if *b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a.checked_div(*b)
            }
            _ => {
                if *b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a.checked_rem(*b)
            }
        };
        return result
            .map(Value::Int)
            .ok_or(EvalError::ArithmeticOverflow(op));
    }

    match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => {
            let result = match op {
                _ if op == ops::ADD => a + b,
                _ if op == ops::SUB => a - b,
                _ if op == ops::MUL => a * b,
                _ if op == ops::DIV => {
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a / b
                }
                _ => {
                    if b == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    a % b
                }
            };
            Ok(Value::Double(result))
        }
        _ => Err(EvalError::BadOperands {
            operator: op,
            lhs: lhs.kind(),
            rhs: rhs.kind(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decls(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn bind(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn compiles_and_evaluates_equality_triple() {
        let registry = FunctionRegistry::with_builtins();
        let declared = decls(&["r_sub", "r_obj", "r_act", "p_sub", "p_obj", "p_act"]);
        let compiled = compile(
            "r.sub == p.sub && r.obj == p.obj && r.act == p.act",
            &declared,
            &registry,
        )
        .unwrap();

        let binding = bind(&[
            ("r_sub", Value::Str("alice".into())),
            ("r_obj", Value::Str("data1".into())),
            ("r_act", Value::Str("read".into())),
            ("p_sub", Value::Str("alice".into())),
            ("p_obj", Value::Str("data1".into())),
            ("p_act", Value::Str("read".into())),
        ]);
        assert_eq!(compiled.evaluator.eval(&binding).unwrap(), Value::Bool(true));

        let mut binding = binding;
        binding.insert("r_act".into(), Value::Str("write".into()));
        assert_eq!(
            compiled.evaluator.eval(&binding).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn unknown_function_gets_a_suggestion() {
        let registry = FunctionRegistry::with_builtins();
        let err = compile("keyMatc(r.obj, p.obj)", &decls(&[]), &registry).unwrap_err();
        match err {
            CompileError::UnknownFunction { name, suggestion } => {
                assert_eq!(name, "keyMatc");
                assert_eq!(suggestion.as_deref(), Some("keyMatch"));
            }
            other => panic!("expected UnknownFunction, got {other}"),
        }
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let registry = FunctionRegistry::with_builtins();
        let err = compile("keyMatch(r.obj)", &decls(&[]), &registry).unwrap_err();
        assert!(matches!(err, CompileError::WrongArity { .. }));
    }

    #[test]
    fn parse_errors_are_compile_errors() {
        let registry = FunctionRegistry::with_builtins();
        assert!(matches!(
            compile("r.sub ==", &decls(&[]), &registry),
            Err(CompileError::Parse(_))
        ));
    }

    #[test]
    fn short_circuit_skips_unbound_rhs() {
        let registry = FunctionRegistry::new();
        let compiled = compile("false && missing == 1", &decls(&[]), &registry).unwrap();
        assert_eq!(
            compiled.evaluator.eval(&HashMap::new()).unwrap(),
            Value::Bool(false)
        );

        let compiled = compile("true || missing == 1", &decls(&[]), &registry).unwrap();
        assert_eq!(
            compiled.evaluator.eval(&HashMap::new()).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn unbound_identifier_errors_at_eval() {
        let registry = FunctionRegistry::new();
        let compiled = compile("missing == 1", &decls(&[]), &registry).unwrap();
        assert!(matches!(
            compiled.evaluator.eval(&HashMap::new()),
            Err(EvalError::UnboundIdentifier(name)) if name == "missing"
        ));
    }

    #[test]
    fn in_membership() {
        let registry = FunctionRegistry::new();
        let compiled = compile("r.act in [\"read\", \"write\"]", &decls(&[]), &registry).unwrap();

        let binding = bind(&[("r_act", Value::Str("read".into()))]);
        assert_eq!(compiled.evaluator.eval(&binding).unwrap(), Value::Bool(true));

        let binding = bind(&[("r_act", Value::Str("delete".into()))]);
        assert_eq!(
            compiled.evaluator.eval(&binding).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn relational_and_arithmetic() {
        let registry = FunctionRegistry::new();
        let compiled = compile("r.age >= 18 && r.age < 60", &decls(&[]), &registry).unwrap();
        let binding = bind(&[("r_age", Value::Int(42))]);
        assert_eq!(compiled.evaluator.eval(&binding).unwrap(), Value::Bool(true));

        let compiled = compile("r.a + r.b == 5", &decls(&[]), &registry).unwrap();
        let binding = bind(&[("r_a", Value::Int(2)), ("r_b", Value::Int(3))]);
        assert_eq!(compiled.evaluator.eval(&binding).unwrap(), Value::Bool(true));

        let compiled = compile("r.a / r.b == 2", &decls(&[]), &registry).unwrap();
        let binding = bind(&[("r_a", Value::Int(4)), ("r_b", Value::Int(0))]);
        assert!(matches!(
            compiled.evaluator.eval(&binding),
            Err(EvalError::DivisionByZero)
        ));
    }

    #[test]
    fn non_bool_connective_operand_is_an_error() {
        let registry = FunctionRegistry::new();
        let compiled = compile("r.sub && true", &decls(&[]), &registry).unwrap();
        let binding = bind(&[("r_sub", Value::Str("alice".into()))]);
        assert!(matches!(
            compiled.evaluator.eval(&binding),
            Err(EvalError::BadOperand { .. })
        ));
    }

    #[test]
    fn numeric_matcher_result_passes_through() {
        let registry = FunctionRegistry::new();
        let compiled = compile("r.score * 2", &decls(&[]), &registry).unwrap();
        let binding = bind(&[("r_score", Value::Int(21))]);
        assert_eq!(compiled.evaluator.eval(&binding).unwrap(), Value::Int(42));
    }
}
