//! The enforcer: request → candidate rules → per-rule evaluation → verdict.
//!
//! An enforcer owns one unit of exclusive state — the model, its rule
//! stores, the role manager, the function registry, and the lazily compiled
//! matcher. Mutations take `&mut self`; cross-thread callers wrap the whole
//! enforcer in their own lock or actor.
//!
//! The matcher compiles on first use and is invalidated whenever the model,
//! the role-manager set, or the role links change.

use std::collections::BTreeSet;
use std::path::PathBuf;

use tracing::{debug, info, instrument};

use crate::effect::{DefaultEffector, Effect, Effector, PRIORITY};
use crate::error::{AdapterError, ConfigError, Error, Result, StoreError};
use crate::expr::{
    compile, expr_to_sql, flatten_request, partial_eval, CompiledMatcher, Value,
};
use crate::functions::FunctionRegistry;
use crate::model::Model;
use crate::persist::{Adapter, Filter, Watcher};
use crate::rbac::{shared, DefaultRoleManager, RoleManager, SharedRoleManager};

/// Where the model text comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    File(PathBuf),
    Text(String),
}

/// Enforcer construction parameters.
pub struct EnforcerConfig {
    pub model: ModelSource,
    pub adapter: Option<Box<dyn Adapter>>,
    pub enable_log: bool,
}

impl EnforcerConfig {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        EnforcerConfig {
            model: ModelSource::File(path.into()),
            adapter: None,
            enable_log: false,
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        EnforcerConfig {
            model: ModelSource::Text(text.into()),
            adapter: None,
            enable_log: false,
        }
    }

    pub fn with_adapter(mut self, adapter: Box<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_log(mut self, enable: bool) -> Self {
        self.enable_log = enable;
        self
    }
}

/// The authorization enforcement engine.
pub struct Enforcer {
    model: Model,
    model_path: Option<PathBuf>,
    functions: FunctionRegistry,
    effector: Box<dyn Effector>,
    role_manager: SharedRoleManager,
    adapter: Option<Box<dyn Adapter>>,
    watcher: Option<Box<dyn Watcher>>,
    matcher: Option<CompiledMatcher>,
    enabled: bool,
    auto_save: bool,
    auto_build_role_links: bool,
    log_enabled: bool,
}

/// Classification of a matcher result.
enum Truth {
    Bool(bool),
    Num(f64),
}

fn classify(value: &Value) -> Result<Truth> {
    match value {
        Value::Bool(b) => Ok(Truth::Bool(*b)),
        Value::Int(i) => Ok(Truth::Num(*i as f64)),
        Value::Uint(u) => Ok(Truth::Num(*u as f64)),
        Value::Double(d) => Ok(Truth::Num(*d)),
        other => Err(Error::MatcherResult(other.kind())),
    }
}

impl Enforcer {
    /// Build an enforcer from a model source and an optional adapter. The
    /// policy loads immediately unless the adapter reports an already
    /// filtered state.
    pub fn new(config: EnforcerConfig) -> Result<Self> {
        let (model, model_path) = match &config.model {
            ModelSource::File(path) => (Model::from_file(path)?, Some(path.clone())),
            ModelSource::Text(text) => (Model::from_text(text)?, None),
        };
        model.print_model();

        let mut enforcer = Enforcer {
            model,
            model_path,
            functions: FunctionRegistry::with_builtins(),
            effector: Box::new(DefaultEffector),
            role_manager: shared(DefaultRoleManager::new()),
            adapter: config.adapter,
            watcher: None,
            matcher: None,
            enabled: true,
            auto_save: true,
            auto_build_role_links: true,
            log_enabled: config.enable_log,
        };

        let should_load = match &enforcer.adapter {
            Some(adapter) => !adapter
                .as_filtered()
                .map(|f| f.is_filtered())
                .unwrap_or(false),
            None => false,
        };
        if should_load {
            enforcer.load_policy()?;
        }
        Ok(enforcer)
    }

    // ------------------------------------------------------------------
    // Enforcement
    // ------------------------------------------------------------------

    /// Decide whether the request satisfies the model. Request values pair
    /// positionally with the request-definition tokens; nested objects
    /// flatten into scalar identifiers.
    #[instrument(level = "debug", skip_all)]
    pub fn enforce(&mut self, rvals: &[serde_json::Value]) -> Result<bool> {
        self.enforce_internal(None, rvals)
    }

    /// Enforce with a matcher override. When the override differs from the
    /// compiled matcher, the rule-store pre-filter is skipped and every rule
    /// in the `p` store is evaluated in id order.
    #[instrument(level = "debug", skip_all)]
    pub fn enforce_with_matcher(
        &mut self,
        matcher: &str,
        rvals: &[serde_json::Value],
    ) -> Result<bool> {
        self.enforce_internal(Some(matcher), rvals)
    }

    fn enforce_internal(
        &mut self,
        matcher_override: Option<&str>,
        rvals: &[serde_json::Value],
    ) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }

        if self.matcher.is_none() {
            self.matcher = Some(self.compile_matcher(None)?);
        }

        let override_storage;
        let (matcher, prefilter) = match (matcher_override, &self.matcher) {
            (Some(text), Some(cached)) if text != cached.source => {
                override_storage = self.compile_matcher(Some(text))?;
                (&override_storage, false)
            }
            (_, Some(cached)) => (cached, true),
            // unreachable: compiled two lines up, and compile errors returned
            (_, None) => return Err(Error::MatcherResult("uncompiled")),
        };

        let request_tokens = &self.model.require("r", "r")?.tokens;
        if rvals.len() != request_tokens.len() {
            return Err(Error::RequestArity {
                expected: request_tokens.len(),
                got: rvals.len(),
            });
        }
        let mut binding = flatten_request(request_tokens, rvals)?;

        let p = self.model.require("p", "p")?;
        let policy_tokens = &p.tokens;
        let effect_index = policy_tokens.iter().position(|t| t == "p_eft");
        let combinator = self.model.require("e", "e")?.value.as_str();

        let mut effects: Vec<Effect>;
        let mut results: Vec<f64>;

        if !p.policy.is_empty() {
            let candidates: Vec<i64> = if prefilter {
                let residual = partial_eval(&matcher.flat, &binding)?;
                let clause = expr_to_sql(&residual)?;
                debug!(%clause, "candidate pre-filter");
                let store = p
                    .store
                    .as_ref()
                    .ok_or(Error::Store(StoreError::MissingStore))?;
                store.query(&clause)?
            } else {
                p.policy.ids()
            };

            // the trailing slot stays Indeterminate and lets the effector
            // tell "no rule matched" apart from an explicit deny
            effects = vec![Effect::Indeterminate; candidates.len() + 1];
            results = vec![0.0; candidates.len() + 1];

            for (i, id) in candidates.iter().enumerate() {
                let rule = p
                    .policy
                    .get(*id)
                    .ok_or(Error::Store(StoreError::MissingRule(*id)))?;
                if rule.len() != policy_tokens.len() {
                    return Err(Error::PolicyArity {
                        expected: policy_tokens.len(),
                        got: rule.len(),
                    });
                }
                for (token, value) in policy_tokens.iter().zip(rule) {
                    binding.insert(token.clone(), Value::Str(value.clone()));
                }

                match classify(&matcher.evaluator.eval(&binding)?)? {
                    Truth::Bool(false) => continue,
                    Truth::Num(n) if n == 0.0 => continue,
                    Truth::Bool(true) => {}
                    Truth::Num(n) => results[i] = n,
                }

                effects[i] = match effect_index {
                    Some(index) => match rule[index].as_str() {
                        "allow" => Effect::Allow,
                        "deny" => Effect::Deny,
                        _ => Effect::Indeterminate,
                    },
                    None => Effect::Allow,
                };

                if combinator == PRIORITY && effects[i] != Effect::Indeterminate {
                    break;
                }
            }
        } else {
            // zero-rule policy: evaluate once with empty policy values
            effects = vec![Effect::Indeterminate];
            results = vec![0.0];
            for token in policy_tokens {
                binding.insert(token.clone(), Value::Str(String::new()));
            }
            if matches!(
                classify(&matcher.evaluator.eval(&binding)?)?,
                Truth::Bool(true)
            ) {
                effects[0] = Effect::Allow;
            }
        }

        let verdict = self.effector.merge_effects(combinator, &effects, &results)?;

        if self.log_enabled {
            let request: Vec<String> = rvals.iter().map(|v| v.to_string()).collect();
            info!(request = %request.join(", "), verdict, "request enforced");
        }
        Ok(verdict)
    }

    /// Compile the model matcher (or an override) against the current
    /// declarations and function registry.
    fn compile_matcher(&self, override_text: Option<&str>) -> Result<CompiledMatcher> {
        let text = match override_text {
            Some(text) => text.to_string(),
            None => self.model.require("m", "m")?.value.clone(),
        };

        let mut declared = BTreeSet::new();
        for sec in ["r", "p"] {
            for assertion in self.model.section(sec) {
                declared.extend(assertion.tokens.iter().cloned());
            }
        }

        let mut registry = self.functions.clone();
        for assertion in self.model.section("g") {
            registry.add_role_function(&assertion.key, assertion.role_manager.clone());
        }

        Ok(compile(&text, &declared, &registry)?)
    }

    fn invalidate_matcher(&mut self) {
        self.matcher = None;
    }

    // ------------------------------------------------------------------
    // Model lifecycle
    // ------------------------------------------------------------------

    pub fn get_model(&self) -> &Model {
        &self.model
    }

    /// Replace the model. The previous rule stores are torn down with it and
    /// the policy must be reloaded.
    pub fn set_model(&mut self, model: Model) -> Result<()> {
        self.model = model;
        self.model.print_model();
        self.role_manager
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.invalidate_matcher();
        Ok(())
    }

    /// Re-read the model from the recorded path; the policy is invalidated
    /// and must be reloaded.
    pub fn load_model(&mut self) -> Result<()> {
        let path = self
            .model_path
            .clone()
            .ok_or(Error::Config(ConfigError::NoModelPath))?;
        self.set_model(Model::from_file(&path)?)
    }

    // ------------------------------------------------------------------
    // Policy lifecycle
    // ------------------------------------------------------------------

    /// Clear and reload the policy through the adapter, rebuilding role
    /// links and rule stores. An adapter with nowhere to load from (the
    /// empty-path sentinel) leaves the policy empty.
    pub fn load_policy(&mut self) -> Result<()> {
        self.model.clear_policy()?;
        if let Some(adapter) = &self.adapter {
            match adapter.load_policy(&mut self.model) {
                Ok(()) => {}
                Err(err) if err.is_empty_path() => {}
                Err(err) => return Err(err),
            }
        }
        self.model.print_policy();
        if self.auto_build_role_links {
            self.build_role_links()?;
        }
        self.model.rebuild_stores()?;
        self.invalidate_matcher();
        Ok(())
    }

    /// Reload a filtered subset of the policy; requires a filtered adapter.
    pub fn load_filtered_policy(&mut self, filter: &Filter) -> Result<()> {
        self.model.clear_policy()?;
        let Some(adapter) = self.adapter.as_mut() else {
            return Err(AdapterError::FilterUnsupported.into());
        };
        let Some(filtered) = adapter.as_filtered_mut() else {
            return Err(AdapterError::FilterUnsupported.into());
        };
        match filtered.load_filtered_policy(&mut self.model, filter) {
            Ok(()) => {}
            Err(err) if err.is_empty_path() => {}
            Err(err) => return Err(err),
        }
        self.model.print_policy();
        if self.auto_build_role_links {
            self.build_role_links()?;
        }
        self.model.rebuild_stores()?;
        self.invalidate_matcher();
        Ok(())
    }

    /// Whether the currently loaded policy is a filtered subset.
    pub fn is_filtered(&self) -> bool {
        self.adapter
            .as_ref()
            .and_then(|a| a.as_filtered())
            .map(|f| f.is_filtered())
            .unwrap_or(false)
    }

    /// Save the current policy through the adapter and notify the watcher.
    pub fn save_policy(&mut self) -> Result<()> {
        if self.is_filtered() {
            return Err(AdapterError::SaveFiltered.into());
        }
        let Some(adapter) = &self.adapter else {
            return Err(AdapterError::Missing.into());
        };
        adapter.save_policy(&self.model)?;
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.update()?;
        }
        Ok(())
    }

    /// Drop every policy rule, keeping the model definitions.
    pub fn clear_policy(&mut self) -> Result<()> {
        self.model.clear_policy()
    }

    // ------------------------------------------------------------------
    // Policy management
    // ------------------------------------------------------------------

    pub fn add_policy(&mut self, rule: Vec<String>) -> Result<bool> {
        self.add_named_policy("p", rule)
    }

    pub fn add_named_policy(&mut self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.add_policy_internal("p", ptype, rule)
    }

    pub fn add_grouping_policy(&mut self, rule: Vec<String>) -> Result<bool> {
        self.add_named_grouping_policy("g", rule)
    }

    pub fn add_named_grouping_policy(&mut self, ptype: &str, rule: Vec<String>) -> Result<bool> {
        self.add_policy_internal("g", ptype, rule)
    }

    fn add_policy_internal(&mut self, sec: &str, ptype: &str, rule: Vec<String>) -> Result<bool> {
        if self.model.add_policy(sec, ptype, rule.clone())?.is_none() {
            return Ok(false);
        }
        if sec == "g" && self.auto_build_role_links {
            self.build_role_links()?;
        }
        self.mirror_to_adapter(|adapter| adapter.add_policy(sec, ptype, &rule))?;
        Ok(true)
    }

    pub fn remove_policy(&mut self, rule: &[String]) -> Result<bool> {
        self.remove_named_policy("p", rule)
    }

    pub fn remove_named_policy(&mut self, ptype: &str, rule: &[String]) -> Result<bool> {
        self.remove_policy_internal("p", ptype, rule)
    }

    pub fn remove_grouping_policy(&mut self, rule: &[String]) -> Result<bool> {
        self.remove_named_grouping_policy("g", rule)
    }

    pub fn remove_named_grouping_policy(&mut self, ptype: &str, rule: &[String]) -> Result<bool> {
        self.remove_policy_internal("g", ptype, rule)
    }

    fn remove_policy_internal(&mut self, sec: &str, ptype: &str, rule: &[String]) -> Result<bool> {
        if self.model.remove_policy(sec, ptype, rule)?.is_none() {
            return Ok(false);
        }
        if sec == "g" && self.auto_build_role_links {
            self.build_role_links()?;
        }
        self.mirror_to_adapter(|adapter| adapter.remove_policy(sec, ptype, rule))?;
        Ok(true)
    }

    /// Remove every rule matching the field filter; returns whether any rule
    /// was removed.
    pub fn remove_filtered_policy(
        &mut self,
        field_index: usize,
        field_values: &[String],
    ) -> Result<bool> {
        let removed = self
            .model
            .remove_filtered_policy("p", "p", field_index, field_values)?;
        if removed.is_empty() {
            return Ok(false);
        }
        self.mirror_to_adapter(|adapter| {
            adapter.remove_filtered_policy("p", "p", field_index, field_values)
        })?;
        Ok(true)
    }

    /// The auto-save path: mirror one mutation into the adapter.
    fn mirror_to_adapter(
        &mut self,
        op: impl FnOnce(&mut dyn Adapter) -> Result<()>,
    ) -> Result<()> {
        if !self.auto_save {
            return Ok(());
        }
        let Some(adapter) = self.adapter.as_mut() else {
            return Ok(());
        };
        match op(adapter.as_mut()) {
            Ok(()) => Ok(()),
            // flat-file adapters only persist whole policies
            Err(Error::Adapter(AdapterError::NotImplemented)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn has_policy(&self, rule: &[String]) -> Result<bool> {
        self.model.has_policy("p", "p", rule)
    }

    pub fn has_grouping_policy(&self, rule: &[String]) -> Result<bool> {
        self.model.has_policy("g", "g", rule)
    }

    pub fn get_policy(&self) -> Vec<Vec<String>> {
        self.model.get_policy("p", "p")
    }

    pub fn get_grouping_policy(&self) -> Vec<Vec<String>> {
        self.model.get_policy("g", "g")
    }

    pub fn get_filtered_policy(
        &self,
        field_index: usize,
        field_values: &[String],
    ) -> Vec<Vec<String>> {
        self.model
            .get_filtered_policy("p", "p", field_index, field_values)
    }

    // ------------------------------------------------------------------
    // Collaborators and switches
    // ------------------------------------------------------------------

    pub fn set_adapter(&mut self, adapter: Box<dyn Adapter>) {
        self.adapter = Some(adapter);
    }

    /// Register a watcher. Its update callback fires when another writer
    /// announces a policy change; reloading is left to the owner of the
    /// enforcer so mutation stays serialized with enforcement.
    pub fn set_watcher(&mut self, mut watcher: Box<dyn Watcher>) {
        watcher.set_update_callback(Box::new(|| {
            debug!("policy updated externally, reload required");
        }));
        self.watcher = Some(watcher);
    }

    pub fn get_role_manager(&self) -> SharedRoleManager {
        self.role_manager.clone()
    }

    /// Swap the role manager implementation and rebuild the role links.
    pub fn set_role_manager(&mut self, rm: SharedRoleManager) -> Result<()> {
        self.role_manager = rm;
        if self.auto_build_role_links {
            self.build_role_links()?;
        } else {
            self.invalidate_matcher();
        }
        Ok(())
    }

    pub fn set_effector(&mut self, effector: Box<dyn Effector>) {
        self.effector = effector;
    }

    /// Rebuild the role-inheritance graph from the `g` policies.
    pub fn build_role_links(&mut self) -> Result<()> {
        self.role_manager
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.model.build_role_links(&self.role_manager)?;
        // generated role functions capture the manager at compile time
        self.invalidate_matcher();
        Ok(())
    }

    /// When disabled, every request is allowed without evaluation.
    pub fn enable_enforce(&mut self, enable: bool) {
        self.enabled = enable;
    }

    pub fn enable_log(&mut self, enable: bool) {
        self.log_enabled = enable;
    }

    /// Mirror policy mutations into the adapter as they happen.
    pub fn enable_auto_save(&mut self, auto_save: bool) {
        self.auto_save = auto_save;
    }

    /// Rebuild role links automatically when grouping policies change.
    pub fn enable_auto_build_role_links(&mut self, auto_build: bool) {
        self.auto_build_role_links = auto_build;
    }
}
