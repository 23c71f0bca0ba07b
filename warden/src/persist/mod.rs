//! Policy persistence seams: adapters load and save rules, watchers signal
//! external change.
//!
//! Adapters are deliberately dumb — they move lines in and out of the model;
//! the model keeps its own store synchronized.

pub mod file_adapter;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Model;

pub use file_adapter::FileAdapter;

/// Storage backend for policy rules.
pub trait Adapter: Send {
    /// Load all policy rules into the model.
    fn load_policy(&self, model: &mut Model) -> Result<()>;

    /// Save all policy rules from the model.
    fn save_policy(&self, model: &Model) -> Result<()>;

    /// Persist one added rule (the auto-save path).
    fn add_policy(&mut self, sec: &str, ptype: &str, rule: &[String]) -> Result<()>;

    /// Remove one rule (the auto-save path).
    fn remove_policy(&mut self, sec: &str, ptype: &str, rule: &[String]) -> Result<()>;

    /// Remove rules matching a field filter (the auto-save path).
    fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: &[String],
    ) -> Result<()>;

    /// The filtered view of this adapter, when it supports one.
    fn as_filtered(&self) -> Option<&dyn FilteredAdapter> {
        None
    }

    /// Mutable filtered view; the filtered-load path needs it.
    fn as_filtered_mut(&mut self) -> Option<&mut dyn FilteredAdapter> {
        None
    }
}

/// A per-ptype prefix filter: empty fields are wildcards.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub p: Vec<String>,
    pub g: Vec<String>,
}

/// An adapter that can load a subset of the policy.
pub trait FilteredAdapter: Adapter {
    fn load_filtered_policy(&mut self, model: &mut Model, filter: &Filter) -> Result<()>;

    /// Whether the last load was filtered.
    fn is_filtered(&self) -> bool;
}

/// External change notification.
pub trait Watcher: Send {
    /// Register the callback invoked when another writer updates the policy.
    fn set_update_callback(&mut self, callback: Box<dyn FnMut() + Send>);

    /// Announce that this process changed the policy.
    fn update(&mut self) -> Result<()>;
}

/// Load one CSV policy line (`ptype, v1, v2, …`) into the model. Comments
/// (`#`) and blank lines are skipped; the first token selects the assertion.
pub fn load_policy_line(line: &str, model: &mut Model) -> Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }

    let mut tokens = line.split(',').map(|t| t.trim().to_string());
    let Some(key) = tokens.next().filter(|k| !k.is_empty()) else {
        return Ok(());
    };
    let sec = key[..1].to_string();
    let rule: Vec<String> = tokens.collect();

    model.append_policy(&sec, &key, rule)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p_eft == allow))

[matchers]
m = g(r.sub, p.sub) && r.obj == p.obj && r.act == p.act
"#;

    #[test]
    fn lines_route_to_their_assertion() {
        let mut model = Model::from_text(BASIC).unwrap();
        load_policy_line("p, alice, data1, read", &mut model).unwrap();
        load_policy_line("g, alice, admin", &mut model).unwrap();
        load_policy_line("# p, commented, out, act", &mut model).unwrap();
        load_policy_line("", &mut model).unwrap();

        assert_eq!(
            model.get_policy("p", "p"),
            vec![vec!["alice", "data1", "read"]]
        );
        assert_eq!(model.get_policy("g", "g"), vec![vec!["alice", "admin"]]);
    }

    #[test]
    fn values_are_trimmed_verbatim() {
        let mut model = Model::from_text(BASIC).unwrap();
        load_policy_line("p,  alice ,data1,  read", &mut model).unwrap();
        assert_eq!(
            model.get_policy("p", "p"),
            vec![vec!["alice", "data1", "read"]]
        );
    }

    #[test]
    fn wrong_arity_line_is_rejected() {
        let mut model = Model::from_text(BASIC).unwrap();
        assert!(load_policy_line("p, alice, data1", &mut model).is_err());
    }
}
