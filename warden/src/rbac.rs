//! Role-inheritance graph.
//!
//! The engine consumes role managers through the [`RoleManager`] trait;
//! [`DefaultRoleManager`] is a directed graph with optional domain scoping
//! and breadth-first reachability. Custom implementations plug in via
//! [`Enforcer::set_role_manager`](crate::Enforcer::set_role_manager).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::RbacError;

/// A role manager shared between the policy model and the generated matcher
/// functions. Mutations and reads are serialized by the lock; the enforcer
/// holds the writer side.
pub type SharedRoleManager = Arc<RwLock<dyn RoleManager>>;

/// The role-graph contract consumed by the engine.
///
/// `domain` carries the optional scope arguments of a role link; the default
/// implementation accepts zero or one.
pub trait RoleManager: Send + Sync {
    /// Declare that `name1` inherits from `name2`.
    fn add_link(&mut self, name1: &str, name2: &str, domain: &[&str]) -> Result<(), RbacError>;

    /// Transitive reachability from `name1` to `name2`.
    fn has_link(&self, name1: &str, name2: &str, domain: &[&str]) -> Result<bool, RbacError>;

    /// Empty the graph.
    fn clear(&mut self);

    /// Emit the current links as debug events.
    fn print_roles(&self);
}

/// Wrap a role manager for sharing with the enforcer.
pub fn shared<R: RoleManager + 'static>(rm: R) -> SharedRoleManager {
    Arc::new(RwLock::new(rm))
}

/// Default role manager: a string-keyed digraph, domain-qualified names,
/// BFS reachability with a visited set so cycles terminate.
#[derive(Debug, Default)]
pub struct DefaultRoleManager {
    links: HashMap<String, HashSet<String>>,
}

impl DefaultRoleManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn qualified(name: &str, domain: &[&str]) -> Result<String, RbacError> {
        match domain {
            [] => Ok(name.to_string()),
            [d] => Ok(format!("{d}::{name}")),
            more => Err(RbacError::DomainArity(more.len())),
        }
    }
}

impl RoleManager for DefaultRoleManager {
    fn add_link(&mut self, name1: &str, name2: &str, domain: &[&str]) -> Result<(), RbacError> {
        let from = Self::qualified(name1, domain)?;
        let to = Self::qualified(name2, domain)?;
        self.links.entry(from).or_default().insert(to);
        Ok(())
    }

    fn has_link(&self, name1: &str, name2: &str, domain: &[&str]) -> Result<bool, RbacError> {
        let from = Self::qualified(name1, domain)?;
        let to = Self::qualified(name2, domain)?;
        if from == to {
            return Ok(true);
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(from.clone());
        queue.push_back(from);

        while let Some(current) = queue.pop_front() {
            let Some(nexts) = self.links.get(&current) else {
                continue;
            };
            for next in nexts {
                if *next == to {
                    return Ok(true);
                }
                if visited.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        Ok(false)
    }

    fn clear(&mut self) {
        self.links.clear();
    }

    fn print_roles(&self) {
        let mut names: Vec<_> = self.links.keys().collect();
        names.sort();
        for name in names {
            let mut targets: Vec<_> = self.links[name].iter().cloned().collect();
            targets.sort();
            debug!(role = %name, inherits = %targets.join(", "), "role link");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_transitive_links() {
        let mut rm = DefaultRoleManager::new();
        rm.add_link("alice", "admin", &[]).unwrap();
        rm.add_link("admin", "root", &[]).unwrap();

        assert!(rm.has_link("alice", "admin", &[]).unwrap());
        assert!(rm.has_link("alice", "root", &[]).unwrap());
        assert!(!rm.has_link("admin", "alice", &[]).unwrap());
        assert!(!rm.has_link("bob", "admin", &[]).unwrap());
    }

    #[test]
    fn self_link_is_reachable() {
        let rm = DefaultRoleManager::new();
        assert!(rm.has_link("alice", "alice", &[]).unwrap());
    }

    #[test]
    fn domains_partition_the_graph() {
        let mut rm = DefaultRoleManager::new();
        rm.add_link("alice", "admin", &["tenant1"]).unwrap();

        assert!(rm.has_link("alice", "admin", &["tenant1"]).unwrap());
        assert!(!rm.has_link("alice", "admin", &["tenant2"]).unwrap());
        assert!(!rm.has_link("alice", "admin", &[]).unwrap());
    }

    #[test]
    fn cycles_terminate() {
        let mut rm = DefaultRoleManager::new();
        rm.add_link("a", "b", &[]).unwrap();
        rm.add_link("b", "c", &[]).unwrap();
        rm.add_link("c", "a", &[]).unwrap();

        assert!(rm.has_link("a", "c", &[]).unwrap());
        assert!(!rm.has_link("a", "z", &[]).unwrap());
    }

    #[test]
    fn clear_empties_the_graph() {
        let mut rm = DefaultRoleManager::new();
        rm.add_link("alice", "admin", &[]).unwrap();
        rm.clear();
        assert!(!rm.has_link("alice", "admin", &[]).unwrap());
    }

    #[test]
    fn two_domains_rejected() {
        let mut rm = DefaultRoleManager::new();
        assert!(matches!(
            rm.add_link("a", "b", &["d1", "d2"]),
            Err(RbacError::DomainArity(2))
        ));
    }
}
