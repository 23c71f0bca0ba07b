//! Warden — an authorization enforcement engine.
//!
//! A declarative *model* describes how requests, policies, roles, matcher
//! expressions, and effect combination are shaped; a body of *policy rules*
//! fills it in. At runtime the [`Enforcer`] answers one question: does this
//! request satisfy the model?
//!
//! The matcher expression compiles once into a reusable evaluator. Per
//! request, the engine partially evaluates the matcher against the request
//! binding, lowers the residual skeleton into a SQL WHERE clause, and uses
//! it to pre-filter candidate rules out of an indexed in-memory store before
//! evaluating each candidate exactly.
//!
//! # Modules
//!
//! - [`expr`] — matcher parsing, identifier flattening, compilation,
//!   partial evaluation, and SQL lowering.
//! - [`functions`] — builtin match functions and the function registry.
//! - [`model`] — model sections, assertions, rule collections, and the
//!   indexed rule store.
//! - [`rbac`] — the role-inheritance graph.
//! - [`effect`] — per-rule effects and the effect combinator.
//! - [`persist`] — adapter and watcher seams plus the CSV file adapter.
//! - [`enforcer`] — the orchestrator.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use warden::{Enforcer, EnforcerConfig, FileAdapter};
//!
//! let config = EnforcerConfig::from_file("model.conf")
//!     .with_adapter(Box::new(FileAdapter::new("policy.csv")));
//! let mut enforcer = Enforcer::new(config).unwrap();
//!
//! let allowed = enforcer
//!     .enforce(&[json!("alice"), json!("data1"), json!("read")])
//!     .unwrap();
//! ```

pub mod effect;
pub mod enforcer;
pub mod error;
pub mod expr;
pub mod functions;
pub mod model;
pub mod persist;
pub mod rbac;

pub use effect::{DefaultEffector, Effect, Effector};
pub use enforcer::{Enforcer, EnforcerConfig, ModelSource};
pub use error::{Error, Result};
pub use expr::Value;
pub use functions::FunctionRegistry;
pub use model::{Model, RuleStore};
pub use persist::{Adapter, FileAdapter, Filter, FilteredAdapter, Watcher};
pub use rbac::{DefaultRoleManager, RoleManager, SharedRoleManager};
