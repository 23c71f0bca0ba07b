//! The matcher-evaluation pipeline.
//!
//! Matcher text flows through four stages:
//!
//! 1. [`parse`] — text → expression tree (transient select nodes allowed).
//! 2. [`flatten`] — nested attribute access collapses into flat scalar
//!    identifiers via the canonical escape; the identifier set is collected.
//! 3. [`compile`] — the flat tree is checked against declared identifiers and
//!    the function registry and wrapped in a reusable evaluator.
//! 4. Per request, [`partial`] substitutes the request binding and [`sql`]
//!    lowers the residual into the rule store's WHERE clause.

pub mod ast;
pub mod compile;
pub mod flatten;
pub mod parse;
pub mod partial;
pub mod sql;

pub use ast::{Expr, ExprKind, Value};
pub use compile::{compile, CompiledMatcher, Evaluator};
pub use flatten::{dots_replaced, flatten_expr, flatten_request};
pub use parse::ParseError;
pub use partial::partial_eval;
pub use sql::{expr_to_sql, ALL_CONDITION};
