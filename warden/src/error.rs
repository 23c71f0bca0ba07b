//! Unified error types for the enforcement engine.
//!
//! Each subsystem has its own error enum; the crate-level [`Error`] wraps
//! them transparently so callers can match on the layer they care about.

use crate::expr::parse::ParseError;

/// Error while reading or interpreting a model CONF file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read model file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("line {line_no}: expected 'key = value', got '{line}'")]
    BadLine { line_no: usize, line: String },

    #[error("missing '{sec}' assertion '{key}' in model")]
    MissingAssertion { sec: String, key: String },

    #[error("no model path recorded; the enforcer was built from model text")]
    NoModelPath,
}

/// Error while compiling a matcher expression.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("unknown function '{name}'{}", .suggestion.as_ref().map(|s| format!("; did you mean '{}'?", s)).unwrap_or_default())]
    UnknownFunction {
        name: String,
        suggestion: Option<String>,
    },

    #[error("function '{function}' takes {expected} argument(s), got {got}")]
    WrongArity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("undeclared identifier '{0}'")]
    UndeclaredIdentifier(String),
}

/// Error raised while rewriting or lowering an expression tree.
#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("select expressions must be nested select/ident chains")]
    SelectUnsupported,

    #[error("method call expressions are not supported")]
    MethodCallUnsupported,

    #[error("{0} expressions are not supported here")]
    UnsupportedKind(&'static str),

    #[error("unsupported literal for identifier '{0}'")]
    LiteralUnsupported(String),
}

/// Runtime error from the matcher evaluator.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("no value bound for identifier '{0}'")]
    UnboundIdentifier(String),

    #[error("operator '{operator}' cannot be applied to {lhs} and {rhs}")]
    BadOperands {
        operator: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("'{operator}' expects a {expected} operand, got {got}")]
    BadOperand {
        operator: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in '{0}'")]
    ArithmeticOverflow(&'static str),

    #[error("{0} expressions cannot be evaluated")]
    UnsupportedExpr(&'static str),

    #[error("list expressions are only supported as the right-hand side of 'in'")]
    ListValue,

    #[error("function '{function}': {message}")]
    Function { function: String, message: String },
}

/// Internal invariant violation of the rule store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid column name '{0}'")]
    ColumnName(String),

    #[error("row arity {got} does not match column count {expected}")]
    Arity { expected: usize, got: usize },

    #[error("rule id {0} is in the store but not in the model")]
    MissingRule(i64),

    #[error("policy definition has no rule store")]
    MissingStore,
}

/// Error from the role-inheritance graph.
#[derive(Debug, thiserror::Error)]
pub enum RbacError {
    #[error("the default role manager supports at most one domain, got {0}")]
    DomainArity(usize),
}

/// Error propagated from a policy adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid file path, file path cannot be empty")]
    EmptyPath,

    #[error("cannot access policy file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("no adapter configured")]
    Missing,

    #[error("operation not implemented by this adapter")]
    NotImplemented,

    #[error("filtered policies are not supported by this adapter")]
    FilterUnsupported,

    #[error("cannot save a filtered policy")]
    SaveFiltered,
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rbac(#[from] RbacError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("invalid request size: expected {expected}, got {got}")]
    RequestArity { expected: usize, got: usize },

    #[error("invalid policy size: expected {expected}, got {got}")]
    PolicyArity { expected: usize, got: usize },

    #[error("unknown policy-effect combinator '{0}'")]
    UnknownEffector(String),

    #[error("matcher result should be bool, int or float, got {0}")]
    MatcherResult(&'static str),

    #[error("the number of '_' in a role definition should be at least 2, got {0}")]
    RoleDefinitionArity(usize),

    #[error("grouping policy rule {got} elements do not meet role definition arity {expected}")]
    GroupingPolicyArity { expected: usize, got: usize },
}

impl Error {
    /// The empty-path sentinel an adapter returns when it has nowhere to
    /// load from. The enforcer absorbs this one case during policy load.
    pub(crate) fn is_empty_path(&self) -> bool {
        matches!(self, Error::Adapter(AdapterError::EmptyPath))
    }
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Compute Levenshtein edit distance between two strings.
pub(crate) fn levenshtein(a: &str, b: &str) -> usize {
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Find the closest match to `name` from a set of `candidates`.
/// Returns `None` if no candidate is within a reasonable edit distance (max 3).
pub(crate) fn suggest_closest(name: &str, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(|c| (c, levenshtein(name, c)))
        .filter(|(_, dist)| *dist <= 3 && *dist > 0)
        .min_by_key(|(_, dist)| *dist)
        .map(|(c, _)| (*c).to_string())
}
