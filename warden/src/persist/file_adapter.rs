//! CSV file adapter.
//!
//! Lines are `ptype, v1, v2, …`. The adapter is read/write at whole-file
//! granularity; the per-rule auto-save hooks are unsupported, matching the
//! storage model of a flat file.

use std::io::Write;
use std::path::PathBuf;

use crate::error::{AdapterError, Result};
use crate::model::Model;

use super::{load_policy_line, Adapter, Filter, FilteredAdapter};

/// Loads and saves policy rules in a CSV file.
#[derive(Debug)]
pub struct FileAdapter {
    path: PathBuf,
    filtered: bool,
}

impl FileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAdapter {
            path: path.into(),
            filtered: false,
        }
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if self.path.as_os_str().is_empty() {
            return Err(AdapterError::EmptyPath.into());
        }
        let text =
            std::fs::read_to_string(&self.path).map_err(|source| AdapterError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(text.lines().map(|l| l.to_string()).collect())
    }
}

impl Adapter for FileAdapter {
    fn load_policy(&self, model: &mut Model) -> Result<()> {
        for line in self.read_lines()? {
            load_policy_line(&line, model)?;
        }
        Ok(())
    }

    fn save_policy(&self, model: &Model) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(AdapterError::EmptyPath.into());
        }
        let mut out = Vec::new();
        for sec in ["p", "g"] {
            for assertion in model.section(sec) {
                for rule in model.get_policy(sec, &assertion.key) {
                    let _ = writeln!(out, "{}, {}", assertion.key, rule.join(", "));
                }
            }
        }
        std::fs::write(&self.path, out).map_err(|source| {
            AdapterError::Io {
                path: self.path.display().to_string(),
                source,
            }
            .into()
        })
    }

    fn add_policy(&mut self, _sec: &str, _ptype: &str, _rule: &[String]) -> Result<()> {
        Err(AdapterError::NotImplemented.into())
    }

    fn remove_policy(&mut self, _sec: &str, _ptype: &str, _rule: &[String]) -> Result<()> {
        Err(AdapterError::NotImplemented.into())
    }

    fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        _ptype: &str,
        _field_index: usize,
        _field_values: &[String],
    ) -> Result<()> {
        Err(AdapterError::NotImplemented.into())
    }

    fn as_filtered(&self) -> Option<&dyn FilteredAdapter> {
        Some(self)
    }

    fn as_filtered_mut(&mut self) -> Option<&mut dyn FilteredAdapter> {
        Some(self)
    }
}

impl FilteredAdapter for FileAdapter {
    fn load_filtered_policy(&mut self, model: &mut Model, filter: &Filter) -> Result<()> {
        let no_filter = Vec::new();
        let mut any_filtered = false;
        for line in self.read_lines()? {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split(',').map(|t| t.trim()).collect();
            let pattern = match fields.first() {
                Some(key) if key.starts_with('p') => &filter.p,
                Some(key) if key.starts_with('g') => &filter.g,
                _ => &no_filter,
            };
            if line_filtered(&fields[1..], pattern) {
                any_filtered = true;
                continue;
            }
            load_policy_line(trimmed, model)?;
        }
        self.filtered = any_filtered;
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        self.filtered
    }
}

/// True when the rule fails the filter: some non-empty filter field differs
/// from the rule field at the same position.
fn line_filtered(rule: &[&str], filter: &[String]) -> bool {
    filter.iter().enumerate().any(|(i, pattern)| {
        !pattern.is_empty() && rule.get(i).map(|field| *field != pattern).unwrap_or(true)
    })
}
