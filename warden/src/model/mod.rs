//! The access-control model: sections, assertions, and rule collections.
//!
//! A model maps section keys (`r`, `p`, `g`, `e`, `m`) to assertions. Each
//! `p` assertion owns a [`RuleStore`]; every policy mutation goes through
//! [`Model`] so the store and the in-memory rule collection stay
//! synchronized. Rule ids are assigned here and never reused within a model
//! lifecycle — deletion leaves a tombstoned id.

pub mod conf;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::error::{ConfigError, Error, Result};
use crate::expr::dots_replaced;
use crate::rbac::{RoleManager as _, SharedRoleManager};

use conf::{remove_comments, Config};
pub use store::RuleStore;

/// Section key → human section name in the CONF format.
fn section_name(sec: &str) -> &'static str {
    match sec {
        "r" => "request_definition",
        "p" => "policy_definition",
        "g" => "role_definition",
        "e" => "policy_effect",
        _ => "matchers",
    }
}

/// An ordered rule collection with dense-monotonic id assignment.
#[derive(Debug, Default)]
pub struct Policy {
    rules: BTreeMap<i64, Vec<String>>,
    next_id: i64,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule under the next id.
    pub fn put(&mut self, rule: Vec<String>) -> i64 {
        let id = self.next_id;
        self.rules.insert(id, rule);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: i64) -> Option<&[String]> {
        self.rules.get(&id).map(|r| r.as_slice())
    }

    pub fn remove(&mut self, id: i64) -> bool {
        self.rules.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate `(id, rule)` in insertion (id) order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[String])> {
        self.rules.iter().map(|(id, rule)| (*id, rule.as_slice()))
    }

    pub fn rules(&self) -> Vec<Vec<String>> {
        self.rules.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.rules.keys().copied().collect()
    }
}

/// A declaration within a model section: key, raw value, and, for `r`/`p`,
/// the expanded token list.
pub struct Assertion {
    pub key: String,
    pub value: String,
    /// Tokens expanded as `key + "_" + dots_replaced(token)`; empty outside
    /// `r`/`p` sections.
    pub tokens: Vec<String>,
    pub policy: Policy,
    /// The indexed store; present iff this is a `p` assertion.
    pub store: Option<RuleStore>,
    /// Bound by `build_role_links`; present only on `g` assertions.
    pub role_manager: Option<SharedRoleManager>,
}

impl fmt::Debug for Assertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assertion")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("tokens", &self.tokens)
            .field("rules", &self.policy.len())
            .finish()
    }
}

/// The whole access-control model.
#[derive(Debug, Default)]
pub struct Model {
    sections: HashMap<String, HashMap<String, Assertion>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let cfg = Config::from_file(path)?;
        Self::from_config(&cfg)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        let cfg = Config::from_text(text)?;
        Self::from_config(&cfg)
    }

    fn from_config(cfg: &Config) -> Result<Self> {
        let mut model = Model::new();
        for sec in ["r", "p", "e", "m", "g"] {
            model.load_section(cfg, sec)?;
        }
        Ok(model)
    }

    fn load_section(&mut self, cfg: &Config, sec: &str) -> Result<()> {
        // keys run r, r2, r3, …; the first missing one stops the section
        for i in 1.. {
            let key = if i == 1 {
                sec.to_string()
            } else {
                format!("{sec}{i}")
            };
            match cfg.get(section_name(sec), &key) {
                Some(value) => {
                    self.add_def(sec, &key, value)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Add an assertion. For `r`/`p` the value expands into a token list; for
    /// `p` an empty rule store is (re)initialized with the derived columns.
    pub fn add_def(&mut self, sec: &str, key: &str, value: &str) -> Result<bool> {
        if value.is_empty() {
            return Ok(false);
        }

        let mut assertion = Assertion {
            key: key.to_string(),
            value: value.to_string(),
            tokens: Vec::new(),
            policy: Policy::new(),
            store: None,
            role_manager: None,
        };

        if sec == "r" || sec == "p" {
            assertion.tokens = value
                .split(',')
                .map(|token| format!("{key}_{}", dots_replaced(token.trim())))
                .collect();
            if sec == "p" {
                // release any previous store before the replacement is built
                if let Some(existing) = self
                    .sections
                    .get_mut(sec)
                    .and_then(|keys| keys.get_mut(key))
                {
                    existing.store = None;
                }
                assertion.store = Some(RuleStore::create(&assertion.tokens)?);
            }
        } else {
            assertion.value = remove_comments(value);
        }

        self.sections
            .entry(sec.to_string())
            .or_default()
            .insert(key.to_string(), assertion);
        Ok(true)
    }

    pub fn assertion(&self, sec: &str, key: &str) -> Option<&Assertion> {
        self.sections.get(sec).and_then(|keys| keys.get(key))
    }

    fn assertion_mut(&mut self, sec: &str, key: &str) -> Option<&mut Assertion> {
        self.sections.get_mut(sec).and_then(|keys| keys.get_mut(key))
    }

    /// Like [`assertion`](Self::assertion), but missing is an error.
    pub fn require(&self, sec: &str, key: &str) -> Result<&Assertion> {
        self.assertion(sec, key).ok_or_else(|| {
            ConfigError::MissingAssertion {
                sec: sec.to_string(),
                key: key.to_string(),
            }
            .into()
        })
    }

    fn require_mut(&mut self, sec: &str, key: &str) -> Result<&mut Assertion> {
        self.assertion_mut(sec, key).ok_or_else(|| {
            Error::from(ConfigError::MissingAssertion {
                sec: sec.to_string(),
                key: key.to_string(),
            })
        })
    }

    /// Assertions of a section, in key order.
    pub fn section(&self, sec: &str) -> Vec<&Assertion> {
        let Some(keys) = self.sections.get(sec) else {
            return Vec::new();
        };
        let mut assertions: Vec<_> = keys.values().collect();
        assertions.sort_by(|a, b| a.key.cmp(&b.key));
        assertions
    }

    /// Whether the model has any assertion under `sec`.
    pub fn has_section(&self, sec: &str) -> bool {
        self.sections
            .get(sec)
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// Add a rule. Duplicates are a no-op reported as `None`; otherwise the
    /// assigned id comes back.
    pub fn add_policy(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<Option<i64>> {
        if self.has_policy(sec, ptype, &rule)? {
            return Ok(None);
        }
        let assertion = self.require_mut(sec, ptype)?;
        if sec == "p" && rule.len() != assertion.tokens.len() {
            return Err(Error::PolicyArity {
                expected: assertion.tokens.len(),
                got: rule.len(),
            });
        }
        let id = assertion.policy.put(rule);
        if let Some(store) = &assertion.store {
            let rule = assertion.policy.get(id).unwrap_or(&[]);
            store.insert(id, rule)?;
        }
        Ok(Some(id))
    }

    /// Append a rule without the duplicate check or store write; bulk loads
    /// use this and then [`rebuild_stores`](Self::rebuild_stores).
    pub(crate) fn append_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: Vec<String>,
    ) -> Result<i64> {
        let assertion = self.require_mut(sec, ptype)?;
        if sec == "p" && rule.len() != assertion.tokens.len() {
            return Err(Error::PolicyArity {
                expected: assertion.tokens.len(),
                got: rule.len(),
            });
        }
        Ok(assertion.policy.put(rule))
    }

    /// Repopulate every `p` store from its rule collection in one batched
    /// pass.
    pub(crate) fn rebuild_stores(&mut self) -> Result<()> {
        let Some(keys) = self.sections.get_mut("p") else {
            return Ok(());
        };
        for assertion in keys.values_mut() {
            if let Some(store) = &assertion.store {
                store.clear()?;
                store.bulk_insert(assertion.policy.iter())?;
            }
        }
        Ok(())
    }

    /// Remove a rule by value. Returns the tombstoned id when found.
    pub fn remove_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        rule: &[String],
    ) -> Result<Option<i64>> {
        let assertion = self.require_mut(sec, ptype)?;
        let found = assertion
            .policy
            .iter()
            .find(|(_, r)| *r == rule)
            .map(|(id, _)| id);
        let Some(id) = found else {
            return Ok(None);
        };
        assertion.policy.remove(id);
        if let Some(store) = &assertion.store {
            store.delete_by_ids(&[id])?;
        }
        Ok(Some(id))
    }

    /// Remove every rule whose fields from `field_index` on match the given
    /// values (empty strings are wildcards). Returns the tombstoned ids.
    pub fn remove_filtered_policy(
        &mut self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: &[String],
    ) -> Result<Vec<i64>> {
        let assertion = self.require_mut(sec, ptype)?;
        let matched: Vec<i64> = assertion
            .policy
            .iter()
            .filter(|(_, rule)| rule_matches(rule, field_index, field_values))
            .map(|(id, _)| id)
            .collect();
        for id in &matched {
            assertion.policy.remove(*id);
        }
        if let Some(store) = &assertion.store {
            store.delete_by_ids(&matched)?;
        }
        Ok(matched)
    }

    /// Whether the rule exists. `p` sections answer through the indexed
    /// store; everything else scans.
    pub fn has_policy(&self, sec: &str, ptype: &str, rule: &[String]) -> Result<bool> {
        let assertion = self.require(sec, ptype)?;
        if let Some(store) = &assertion.store {
            if rule.len() != assertion.tokens.len() {
                return Ok(false);
            }
            return Ok(store.count(rule)? >= 1);
        }
        Ok(assertion.policy.iter().any(|(_, r)| r == rule))
    }

    pub fn get_policy(&self, sec: &str, ptype: &str) -> Vec<Vec<String>> {
        self.assertion(sec, ptype)
            .map(|a| a.policy.rules())
            .unwrap_or_default()
    }

    pub fn get_filtered_policy(
        &self,
        sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: &[String],
    ) -> Vec<Vec<String>> {
        self.assertion(sec, ptype)
            .map(|a| {
                a.policy
                    .iter()
                    .filter(|(_, rule)| rule_matches(rule, field_index, field_values))
                    .map(|(_, rule)| rule.to_vec())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct values of one field across a policy, in first-seen order.
    pub fn get_values_for_field_in_policy(
        &self,
        sec: &str,
        ptype: &str,
        field_index: usize,
    ) -> Vec<String> {
        let mut values = Vec::new();
        if let Some(assertion) = self.assertion(sec, ptype) {
            for (_, rule) in assertion.policy.iter() {
                if let Some(value) = rule.get(field_index) {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
        }
        values
    }

    /// Distinct values of one field across every ptype of a section.
    pub fn get_values_for_field_in_policy_all_types(
        &self,
        sec: &str,
        field_index: usize,
    ) -> Vec<String> {
        let mut values = Vec::new();
        for assertion in self.section(sec) {
            for value in self.get_values_for_field_in_policy(sec, &assertion.key, field_index) {
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }
        values
    }

    /// Clear every rule collection and store.
    pub fn clear_policy(&mut self) -> Result<()> {
        for sec in ["p", "g"] {
            if let Some(keys) = self.sections.get_mut(sec) {
                for assertion in keys.values_mut() {
                    assertion.policy = Policy::new();
                    if let Some(store) = &assertion.store {
                        store.clear()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Feed every `g` rule into the role manager. The number of `_` in the
    /// role definition decides the link arity; later fields are domains.
    pub fn build_role_links(&mut self, rm: &SharedRoleManager) -> Result<()> {
        let Some(keys) = self.sections.get_mut("g") else {
            return Ok(());
        };
        let mut sorted: Vec<&mut Assertion> = keys.values_mut().collect();
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        for assertion in sorted {
            assertion.role_manager = Some(rm.clone());
            let arity = assertion.value.matches('_').count();
            if arity < 2 {
                return Err(Error::RoleDefinitionArity(arity));
            }
            let mut manager = rm.write().unwrap_or_else(|e| e.into_inner());
            for (_, rule) in assertion.policy.iter() {
                if rule.len() < arity {
                    return Err(Error::GroupingPolicyArity {
                        expected: arity,
                        got: rule.len(),
                    });
                }
                let domains: Vec<&str> = rule[2..arity].iter().map(|s| s.as_str()).collect();
                manager.add_link(&rule[0], &rule[1], &domains)?;
            }
            debug!(key = %assertion.key, "role links built");
            manager.print_roles();
        }
        Ok(())
    }

    /// Emit the model's assertions as debug events.
    pub fn print_model(&self) {
        for sec in ["r", "p", "g", "e", "m"] {
            for assertion in self.section(sec) {
                debug!(sec, key = %assertion.key, value = %assertion.value, "model");
            }
        }
    }

    /// Emit the current policy as debug events.
    pub fn print_policy(&self) {
        for sec in ["p", "g"] {
            for assertion in self.section(sec) {
                for (id, rule) in assertion.policy.iter() {
                    debug!(sec, key = %assertion.key, id, rule = %rule.join(", "), "policy");
                }
            }
        }
    }
}

fn rule_matches(rule: &[String], field_index: usize, field_values: &[String]) -> bool {
    field_values.iter().enumerate().all(|(i, value)| {
        value.is_empty()
            || rule
                .get(field_index + i)
                .map(|field| field == value)
                .unwrap_or(false)
    })
}
