//! Analyzer configuration.
//!
//! The configuration surface is semantic: which imports may suspend, the
//! ADD/REMOVE/ONLY override lists (by function name), the indirect-call
//! policy, and the advisory flag. Loadable from a JSON file or built in
//! code, then resolved against a program into id form.

use crate::program::{FuncId, ImportId, Program};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// How indirect calls are treated by the reachability analysis.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndirectCallPolicy {
    /// Any call class containing a suspending target taints its callers.
    #[default]
    Conservative,
    /// Indirect calls never carry suspension. Cheaper, and a correctness
    /// hazard if an indirect target does suspend.
    Ignore,
}

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File was not valid JSON for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// User-facing analyzer configuration, by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Imports that may trigger suspension. An import omitted here is
    /// assumed to never suspend; that omission is a silent correctness
    /// risk, not an error.
    pub suspending_imports: Vec<String>,
    /// Functions forced into the instrumentation set.
    pub add: Vec<String>,
    /// Functions forced out of the instrumentation set.
    pub remove: Vec<String>,
    /// When present, the instrumentation set is exactly this list and the
    /// computed closure is discarded. The caller takes full responsibility
    /// for correctness.
    pub only: Option<Vec<String>>,
    /// Indirect-call handling.
    pub indirect_calls: IndirectCallPolicy,
    /// Emit per-function witness chains.
    pub advise: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            suspending_imports: Vec::new(),
            add: Vec::new(),
            remove: Vec::new(),
            only: None,
            indirect_calls: IndirectCallPolicy::default(),
            advise: false,
        }
    }
}

impl AnalyzerConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Resolve names against a program. Unknown names are skipped and
    /// recorded as notes; the analysis itself never fails.
    pub fn resolve(&self, program: &Program) -> ResolvedConfig {
        let mut unknown_names = Vec::new();
        let mut imports = FxHashSet::default();
        for name in &self.suspending_imports {
            match program.import_by_name(name) {
                Some(id) => {
                    imports.insert(id);
                }
                None => unknown_names.push(format!("unknown import `{}`", name)),
            }
        }
        let mut resolve_funcs = |names: &[String], unknown: &mut Vec<String>| {
            let mut set = FxHashSet::default();
            for name in names {
                match program.func_by_name(name) {
                    Some(id) => {
                        set.insert(id);
                    }
                    None => unknown.push(format!("unknown function `{}`", name)),
                }
            }
            set
        };
        let add = resolve_funcs(&self.add, &mut unknown_names);
        let remove = resolve_funcs(&self.remove, &mut unknown_names);
        let only = self
            .only
            .as_ref()
            .map(|names| resolve_funcs(names, &mut unknown_names));
        ResolvedConfig {
            suspending: imports,
            add,
            remove,
            only,
            policy: self.indirect_calls,
            advise: self.advise,
            unknown_names,
        }
    }
}

/// Configuration with names resolved to ids, ready for the analyzer.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Suspending import ids
    pub suspending: FxHashSet<ImportId>,
    /// ADD override
    pub add: FxHashSet<FuncId>,
    /// REMOVE override
    pub remove: FxHashSet<FuncId>,
    /// ONLY override
    pub only: Option<FxHashSet<FuncId>>,
    /// Indirect-call policy
    pub policy: IndirectCallPolicy,
    /// Advisory flag
    pub advise: bool,
    /// Names that did not resolve, for the advisory report
    pub unknown_names: Vec<String>,
}

impl ResolvedConfig {
    /// Convenience constructor: the given imports suspend, no overrides,
    /// conservative indirect handling.
    pub fn suspending_imports<I: IntoIterator<Item = ImportId>>(imports: I) -> Self {
        Self {
            suspending: imports.into_iter().collect(),
            ..Default::default()
        }
    }
}
