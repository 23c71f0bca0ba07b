//! INI-shaped model CONF parser.
//!
//! Sections like `[request_definition]` hold `key = value` assertions. `#`
//! starts a line comment, blank lines are skipped, and a trailing `\`
//! continues the value on the next line.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

/// Parsed CONF text: section name → key → raw value.
#[derive(Debug, Default)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_text(&text)
    }

    pub fn from_text(text: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();

        let mut lines = text.lines().enumerate();
        while let Some((index, raw)) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::BadLine {
                    line_no: index + 1,
                    line: line.to_string(),
                });
            };

            let mut value = value.trim().to_string();
            while let Some(stripped) = value.strip_suffix('\\') {
                let Some((_, next)) = lines.next() else {
                    value = stripped.trim_end().to_string();
                    break;
                };
                value = format!("{} {}", stripped.trim_end(), next.trim());
            }

            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value);
        }

        Ok(Config { sections })
    }

    /// The raw value of `section::key`, if present.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(|s| s.as_str())
    }
}

/// Strip a `#` line comment and trailing whitespace from a value.
pub fn remove_comments(value: &str) -> String {
    match value.split_once('#') {
        Some((head, _)) => head.trim_end().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[policy_effect]
e = some(where (p_eft == allow))

[matchers]
m = r.sub == p.sub && r.obj == p.obj && r.act == p.act
"#;

    #[test]
    fn parses_sections_and_keys() {
        let cfg = Config::from_text(BASIC).unwrap();
        assert_eq!(cfg.get("request_definition", "r"), Some("sub, obj, act"));
        assert_eq!(
            cfg.get("matchers", "m"),
            Some("r.sub == p.sub && r.obj == p.obj && r.act == p.act")
        );
        assert_eq!(cfg.get("matchers", "m2"), None);
        assert_eq!(cfg.get("nope", "r"), None);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let cfg = Config::from_text(
            "# leading comment\n\n[matchers]\n# another\nm = r.sub == p.sub\n",
        )
        .unwrap();
        assert_eq!(cfg.get("matchers", "m"), Some("r.sub == p.sub"));
    }

    #[test]
    fn joins_continuation_lines() {
        let cfg = Config::from_text(
            "[matchers]\nm = r.sub == p.sub && \\\n    r.act == p.act\n",
        )
        .unwrap();
        assert_eq!(cfg.get("matchers", "m"), Some("r.sub == p.sub && r.act == p.act"));
    }

    #[test]
    fn multiple_keys_per_section() {
        let cfg = Config::from_text("[role_definition]\ng = _, _\ng2 = _, _, _\n").unwrap();
        assert_eq!(cfg.get("role_definition", "g"), Some("_, _"));
        assert_eq!(cfg.get("role_definition", "g2"), Some("_, _, _"));
    }

    #[test]
    fn malformed_line_is_an_error() {
        let err = Config::from_text("[matchers]\nnot a key value\n").unwrap_err();
        assert!(matches!(err, ConfigError::BadLine { line_no: 2, .. }));
    }

    #[test]
    fn remove_comments_strips_trailing() {
        assert_eq!(
            remove_comments("some(where (p_eft == allow)) # default"),
            "some(where (p_eft == allow))"
        );
        assert_eq!(remove_comments("priority(p_eft) || deny"), "priority(p_eft) || deny");
    }
}
