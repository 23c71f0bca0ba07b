//! Matcher expression AST.
//!
//! Every node implements `Display` so the tree round-trips to valid matcher
//! source, which keeps compile diagnostics readable.
//!
//! Select nodes exist only between parsing and flattening; every later stage
//! (partial evaluation, SQL lowering, the evaluator) rejects them.

use std::fmt;

/// A dynamically typed constant value.
///
/// Identifiers carry no declared type; every binding resolves to one of
/// these kinds at evaluation time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    Null,
}

impl Value {
    /// Short kind name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Null => "null",
        }
    }

    /// Equality with numeric cross-kind coercion (int/uint/double compare by
    /// value); all other kinds compare only within their own kind.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Uint(b)) => u64::try_from(*a).map(|a| a == *b).unwrap_or(false),
            (Value::Uint(a), Value::Int(b)) => u64::try_from(*b).map(|b| *a == b).unwrap_or(false),
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Uint(a), Value::Double(b)) | (Value::Double(b), Value::Uint(a)) => {
                *a as f64 == *b
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}u"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "b\"{}\"", b.escape_ascii()),
            Value::Null => write!(f, "null"),
        }
    }
}

/// Operator function names used in [`ExprKind::Call`] nodes.
///
/// Operators are ordinary calls in the tree; the evaluator and the SQL
/// lowering dispatch on these names.
pub mod ops {
    pub const NOT: &str = "!";
    pub const AND: &str = "&&";
    pub const OR: &str = "||";
    pub const EQ: &str = "==";
    pub const NE: &str = "!=";
    pub const LT: &str = "<";
    pub const LE: &str = "<=";
    pub const GT: &str = ">";
    pub const GE: &str = ">=";
    pub const IN: &str = "in";
    pub const ADD: &str = "+";
    pub const SUB: &str = "-";
    pub const MUL: &str = "*";
    pub const DIV: &str = "/";
    pub const REM: &str = "%";

    /// True for names the parser emits for operators (as opposed to named
    /// function calls that must resolve through the registry).
    pub fn is_operator(name: &str) -> bool {
        matches!(
            name,
            NOT | AND | OR | EQ | NE | LT | LE | GT | GE | IN | ADD | SUB | MUL | DIV | REM
        )
    }
}

/// An expression node with a stable id for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Assigned sequentially by the parser; rewrites preserve the id of the
    /// node they replace.
    pub id: u32,
    pub kind: ExprKind,
}

/// The expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A literal constant.
    Const(Value),
    /// A scalar identifier, e.g. `r_sub` after flattening.
    Ident(String),
    /// Attribute access `operand.field`. Transient: eliminated by flattening.
    Select { operand: Box<Expr>, field: String },
    /// A function or operator application. `target` is only ever set for
    /// method-call syntax, which flattening rejects.
    Call {
        function: String,
        target: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    /// A list literal `[a, b, c]`.
    List(Vec<Expr>),
}

impl Expr {
    pub fn new(id: u32, kind: ExprKind) -> Self {
        Expr { id, kind }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Const(v) => write!(f, "{v}"),
            ExprKind::Ident(name) => write!(f, "{name}"),
            ExprKind::Select { operand, field } => write!(f, "{operand}.{field}"),
            ExprKind::Call {
                function,
                target,
                args,
            } => {
                if let Some(t) = target {
                    write!(f, "{t}.")?;
                }
                if ops::is_operator(function) {
                    match args.len() {
                        1 => write!(f, "{function}{}", args[0]),
                        2 => write!(f, "({} {function} {})", args[0], args[1]),
                        _ => write!(f, "{function}(...)"),
                    }
                } else {
                    write!(f, "{function}(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ")")
                }
            }
            ExprKind::List(elems) => {
                write!(f, "[")?;
                for (i, elem) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{elem}")?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_operators() {
        let e = Expr::new(
            2,
            ExprKind::Call {
                function: ops::AND.into(),
                target: None,
                args: vec![
                    Expr::new(0, ExprKind::Ident("r_sub".into())),
                    Expr::new(1, ExprKind::Const(Value::Bool(true))),
                ],
            },
        );
        assert_eq!(e.to_string(), "(r_sub && true)");
    }

    #[test]
    fn display_call_and_list() {
        let e = Expr::new(
            3,
            ExprKind::Call {
                function: "keyMatch".into(),
                target: None,
                args: vec![
                    Expr::new(0, ExprKind::Ident("r_obj".into())),
                    Expr::new(1, ExprKind::Const(Value::Str("/foo/*".into()))),
                ],
            },
        );
        assert_eq!(e.to_string(), "keyMatch(r_obj, \"/foo/*\")");

        let l = Expr::new(
            6,
            ExprKind::List(vec![
                Expr::new(4, ExprKind::Const(Value::Int(1))),
                Expr::new(5, ExprKind::Const(Value::Int(2))),
            ]),
        );
        assert_eq!(l.to_string(), "[1, 2]");
    }

    #[test]
    fn loose_eq_coerces_numerics() {
        assert!(Value::Int(3).loose_eq(&Value::Uint(3)));
        assert!(Value::Int(3).loose_eq(&Value::Double(3.0)));
        assert!(!Value::Int(-1).loose_eq(&Value::Uint(u64::MAX)));
        assert!(!Value::Str("3".into()).loose_eq(&Value::Int(3)));
    }
}
