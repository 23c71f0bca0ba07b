//! Matcher function registry.
//!
//! Maps function names to a declaration (signatures checked at compile time)
//! and an implementation closure over dynamic values. Ships the builtin
//! match functions; role-lookup functions are generated per `g` assertion
//! and delegate to that assertion's role manager.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use regex::Regex;

use crate::error::EvalError;
use crate::expr::ast::Value;
use crate::rbac::{RoleManager as _, SharedRoleManager};

/// Implementation closure: dynamic values in, dynamic value out.
pub type FunctionImpl = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Parameter and return kinds carried by declarations. Everything is dynamic
/// at evaluation time; declarations exist for arity checking and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Bool,
}

/// One accepted call shape.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: Vec<ParamKind>,
    pub ret: ParamKind,
}

/// A function declaration: name plus one or more signatures.
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub signatures: Vec<Signature>,
}

/// A registered function.
#[derive(Clone)]
pub struct Function {
    pub decl: FunctionDecl,
    imp: FunctionImpl,
}

impl Function {
    pub fn new(decl: FunctionDecl, imp: FunctionImpl) -> Self {
        Function { decl, imp }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, EvalError> {
        (self.imp)(args)
    }

    /// Whether any signature accepts `n` arguments.
    pub fn accepts_arity(&self, n: usize) -> bool {
        self.decl.signatures.iter().any(|s| s.params.len() == n)
    }

    /// Accepted argument counts, for diagnostics.
    pub fn arities(&self) -> Vec<usize> {
        self.decl.signatures.iter().map(|s| s.params.len()).collect()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function").field("decl", &self.decl).finish()
    }
}

/// The function registry bound into a compiled matcher.
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    map: HashMap<String, Function>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the builtin match functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.add_binary_str("keyMatch", key_match);
        registry.add_binary_str("keyMatch2", key_match2);
        registry.add_binary_str("keyMatch3", key_match3);
        registry.add_binary_str("keyMatch4", key_match4);
        registry.add_binary_str("regexMatch", regex_match);
        registry.add("ipMatch", ip_match_function());
        registry
    }

    pub fn add(&mut self, name: &str, function: Function) {
        self.map.insert(name.to_string(), function);
    }

    /// Register a `(string, string) -> bool` function.
    pub fn add_binary_str(&mut self, name: &str, f: fn(&str, &str) -> bool) {
        let decl = binary_str_decl(name);
        let fname = name.to_string();
        let imp: FunctionImpl = Arc::new(move |args| {
            let (a, b) = two_strings(&fname, args)?;
            Ok(Value::Bool(f(a, b)))
        });
        self.add(name, Function::new(decl, imp));
    }

    /// Register the role-lookup function for a `g` assertion.
    ///
    /// Overloads `(string, string) -> bool` and `(string, string, string) ->
    /// bool` delegate to the role manager; with no manager bound the 2-arg
    /// form reduces to string equality.
    pub fn add_role_function(&mut self, key: &str, rm: Option<SharedRoleManager>) {
        let decl = FunctionDecl {
            name: key.to_string(),
            signatures: vec![
                Signature {
                    params: vec![ParamKind::Str, ParamKind::Str],
                    ret: ParamKind::Bool,
                },
                Signature {
                    params: vec![ParamKind::Str, ParamKind::Str, ParamKind::Str],
                    ret: ParamKind::Bool,
                },
            ],
        };
        let fname = key.to_string();
        let imp: FunctionImpl = Arc::new(move |args| {
            let name1 = string_arg(&fname, args, 0)?;
            let name2 = string_arg(&fname, args, 1)?;

            let Some(rm) = &rm else {
                return Ok(Value::Bool(name1 == name2));
            };

            let guard = rm.read().unwrap_or_else(|e| e.into_inner());
            let linked = if args.len() >= 3 {
                let domain = string_arg(&fname, args, 2)?;
                guard.has_link(name1, name2, &[domain])
            } else {
                guard.has_link(name1, name2, &[])
            };
            let linked = linked.map_err(|e| EvalError::Function {
                function: fname.clone(),
                message: e.to_string(),
            })?;
            Ok(Value::Bool(linked))
        });
        self.add(key, Function::new(decl, imp));
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.map.get(name)
    }

    /// Registered names, for did-you-mean diagnostics.
    pub fn names(&self) -> Vec<&str> {
        self.map.keys().map(|s| s.as_str()).collect()
    }
}

fn binary_str_decl(name: &str) -> FunctionDecl {
    FunctionDecl {
        name: name.to_string(),
        signatures: vec![Signature {
            params: vec![ParamKind::Str, ParamKind::Str],
            ret: ParamKind::Bool,
        }],
    }
}

fn string_arg<'a>(function: &str, args: &'a [Value], index: usize) -> Result<&'a str, EvalError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(EvalError::Function {
            function: function.to_string(),
            message: format!("argument {} must be a string, got {}", index + 1, other.kind()),
        }),
        None => Err(EvalError::Function {
            function: function.to_string(),
            message: format!("missing argument {}", index + 1),
        }),
    }
}

fn two_strings<'a>(function: &str, args: &'a [Value]) -> Result<(&'a str, &'a str), EvalError> {
    Ok((string_arg(function, args, 0)?, string_arg(function, args, 1)?))
}

/// `key1` matches `key2` in the RESTful-path sense; `key2` may end in a `*`.
/// "/foo/bar" matches "/foo/*".
pub fn key_match(key1: &str, key2: &str) -> bool {
    let Some(i) = key2.find('*') else {
        return key1 == key2;
    };
    if key1.len() > i {
        return key1[..i] == key2[..i];
    }
    key1 == &key2[..i]
}

/// Like [`key_match`], plus `:name` path segments: "/resource1" matches
/// "/:resource".
pub fn key_match2(key1: &str, key2: &str) -> bool {
    let mut key2 = key2.replace("/*", "/.*");
    let re = Regex::new(r"(.*):[^/]+(.*)").unwrap();
    while key2.contains("/:") {
        // a bare trailing "/:" can never be rewritten; bail instead of spinning
        let replaced = re.replace_all(&key2, "$1[^/]+$2").into_owned();
        if replaced == key2 {
            break;
        }
        key2 = replaced;
    }
    regex_match(key1, &format!("^{key2}$"))
}

/// Like [`key_match`], plus `{name}` path segments: "/resource1" matches
/// "/{resource}".
pub fn key_match3(key1: &str, key2: &str) -> bool {
    let mut key2 = key2.replace("/*", "/.*");
    let re = Regex::new(r"(.*)\{[^/]+\}(.*)").unwrap();
    while key2.contains("/{") {
        let replaced = re.replace_all(&key2, "$1[^/]+$2").into_owned();
        if replaced == key2 {
            break;
        }
        key2 = replaced;
    }
    regex_match(key1, &format!("^{key2}$"))
}

/// Like [`key_match3`], but repeated `{name}` segments must capture the same
/// value: "/parent/123/child/123" matches "/parent/{id}/child/{id}",
/// "/parent/123/child/456" does not.
pub fn key_match4(key1: &str, key2: &str) -> bool {
    let mut key2 = key2.replace("/*", "/.*");

    let mut tokens = Vec::new();
    let mut token_start = None;
    for (i, c) in key2.char_indices() {
        match c {
            '{' => token_start = Some(i),
            '}' => {
                if let Some(start) = token_start.take() {
                    tokens.push(key2[start..=i].to_string());
                }
            }
            _ => {}
        }
    }

    let re = Regex::new(r"(.*)\{[^/]+\}(.*)").unwrap();
    while key2.contains("/{") {
        let replaced = re.replace_all(&key2, "$1([^/]+)$2").into_owned();
        if replaced == key2 {
            break;
        }
        key2 = replaced;
    }

    let Ok(re) = Regex::new(&format!("^{key2}$")) else {
        return false;
    };
    let Some(captures) = re.captures(key1) else {
        return false;
    };
    let values: Vec<&str> = captures
        .iter()
        .skip(1)
        .map(|m| m.map(|m| m.as_str()).unwrap_or(""))
        .collect();
    if tokens.len() != values.len() {
        return false;
    }

    let mut groups: HashMap<&str, &str> = HashMap::new();
    for (token, value) in tokens.iter().zip(&values) {
        match groups.get(token.as_str()) {
            Some(first) if first != value => return false,
            Some(_) => {}
            None => {
                groups.insert(token, value);
            }
        }
    }
    true
}

/// `key1` matches the regular expression `key2`. An invalid pattern matches
/// nothing.
pub fn regex_match(key1: &str, key2: &str) -> bool {
    match Regex::new(key2) {
        Ok(re) => re.is_match(key1),
        Err(_) => false,
    }
}

/// `ip1` matches `ip2`, where `ip2` is either a plain address or a CIDR
/// pattern: "192.168.2.123" matches "192.168.2.0/24".
pub fn ip_match(ip1: &str, ip2: &str) -> Result<bool, String> {
    let addr: IpAddr = ip1
        .parse()
        .map_err(|_| format!("'{ip1}' is not an IP address"))?;

    if let Some((net, prefix)) = ip2.split_once('/') {
        let net: IpAddr = net
            .parse()
            .map_err(|_| format!("'{ip2}' is not a CIDR pattern"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("'{ip2}' has an invalid prefix length"))?;
        return cidr_contains(addr, net, prefix).ok_or_else(|| format!("'{ip2}' is out of range"));
    }

    let other: IpAddr = ip2
        .parse()
        .map_err(|_| format!("'{ip2}' is neither an IP address nor a CIDR"))?;
    Ok(addr == other)
}

/// Prefix containment; `None` when the prefix length exceeds the address
/// width or the families differ.
fn cidr_contains(addr: IpAddr, net: IpAddr, prefix: u8) -> Option<bool> {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            if prefix > 32 {
                return None;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            Some(u32::from(a) & mask == u32::from(n) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            if prefix > 128 {
                return None;
            }
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            Some(u128::from(a) & mask == u128::from(n) & mask)
        }
        _ => Some(false),
    }
}

fn ip_match_function() -> Function {
    let imp: FunctionImpl = Arc::new(|args| {
        let (a, b) = two_strings("ipMatch", args)?;
        ip_match(a, b)
            .map(Value::Bool)
            .map_err(|message| EvalError::Function {
                function: "ipMatch".to_string(),
                message,
            })
    });
    Function::new(binary_str_decl("ipMatch"), imp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rbac::{shared, DefaultRoleManager, RoleManager};

    #[test]
    fn key_match_star() {
        assert!(key_match("/foo/bar", "/foo/*"));
        assert!(key_match("/foo", "/foo"));
        assert!(key_match("/foo", "/foo/*"));
        assert!(!key_match("/bar/foo", "/foo/*"));
    }

    #[test]
    fn key_match2_named_segments() {
        assert!(key_match2("/resource1", "/:resource"));
        assert!(key_match2("/foo/resource1", "/foo/:resource"));
        assert!(!key_match2("/foo/bar/extra", "/foo/:resource"));
        assert!(key_match2("/foo/bar", "/foo/*"));
    }

    #[test]
    fn key_match3_braced_segments() {
        assert!(key_match3("/foo/resource1", "/foo/{resource}"));
        assert!(!key_match3("/foo/res/sub", "/foo/{resource}"));
    }

    #[test]
    fn key_match4_repeated_segments_must_agree() {
        assert!(key_match4(
            "/parent/123/child/123",
            "/parent/{id}/child/{id}"
        ));
        assert!(!key_match4(
            "/parent/123/child/456",
            "/parent/{id}/child/{id}"
        ));
        assert!(key_match4(
            "/parent/123/child/456",
            "/parent/{id}/child/{id2}"
        ));
    }

    #[test]
    fn regex_match_anchoring_is_callers_business() {
        assert!(regex_match("/topic/create", "/topic/create"));
        assert!(regex_match("/topic/create/x", "/topic/create"));
        assert!(!regex_match("/topic/delete", "^/topic/create$"));
        assert!(!regex_match("anything", "("));
    }

    #[test]
    fn ip_match_cidr_and_literal() {
        assert!(ip_match("192.168.2.123", "192.168.2.0/24").unwrap());
        assert!(!ip_match("192.168.3.1", "192.168.2.0/24").unwrap());
        assert!(ip_match("10.0.0.1", "10.0.0.1").unwrap());
        assert!(!ip_match("10.0.0.1", "::1").unwrap());
        assert!(ip_match("not-an-ip", "10.0.0.1").is_err());
        assert!(ip_match("10.0.0.1", "10.0.0.0/99").is_err());
    }

    #[test]
    fn builtin_registry_calls_through_values() {
        let registry = FunctionRegistry::with_builtins();
        let f = registry.get("keyMatch").unwrap();
        let out = f
            .call(&[
                Value::Str("/foo/bar".into()),
                Value::Str("/foo/*".into()),
            ])
            .unwrap();
        assert_eq!(out, Value::Bool(true));

        let err = f.call(&[Value::Int(1), Value::Str("x".into())]);
        assert!(err.is_err());
    }

    #[test]
    fn role_function_without_manager_is_equality() {
        let mut registry = FunctionRegistry::new();
        registry.add_role_function("g", None);
        let g = registry.get("g").unwrap();
        assert_eq!(
            g.call(&[Value::Str("a".into()), Value::Str("a".into())])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            g.call(&[Value::Str("a".into()), Value::Str("b".into())])
                .unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn role_function_delegates_to_manager() {
        let rm = shared(DefaultRoleManager::new());
        rm.write()
            .unwrap()
            .add_link("alice", "admin", &[])
            .unwrap();
        rm.write()
            .unwrap()
            .add_link("bob", "editor", &["tenant1"])
            .unwrap();

        let mut registry = FunctionRegistry::new();
        registry.add_role_function("g", Some(rm));
        let g = registry.get("g").unwrap();

        assert_eq!(
            g.call(&[Value::Str("alice".into()), Value::Str("admin".into())])
                .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            g.call(&[
                Value::Str("bob".into()),
                Value::Str("editor".into()),
                Value::Str("tenant1".into()),
            ])
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            g.call(&[
                Value::Str("bob".into()),
                Value::Str("editor".into()),
                Value::Str("tenant2".into()),
            ])
            .unwrap(),
            Value::Bool(false)
        );
    }
}
