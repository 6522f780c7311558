//! Action scripts: a small DSL of primitives, named includes and `${VAR}` templates.
//!
//! Scripts are registered by name in a JSON registry and expanded into a flat list
//! of primitive actions before anything is executed.

mod expand;
mod parser;
mod recorder;
mod registry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::actions::{Action, ActionError};

pub use expand::{substitute, Expander, DEFAULT_MAX_DEPTH};
pub use parser::{parse_script, ActionTemplate, Script, ScriptEntry, MAX_REPEAT};
pub use recorder::{
    record_from_events, GestureThresholds, InputEvent, Modifier, PointerButton, Region,
};
pub use registry::ScriptRegistry;

/// Script errors.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Syntax error in statement {statement}: {message}")]
    Syntax { statement: usize, message: String },
    #[error("Unknown script: {0}")]
    UnknownScript(String),
    #[error("Script {name} points to missing file {}", path.display())]
    MissingScriptFile { name: String, path: PathBuf },
    #[error("Cyclic script include: {}", .0.join(" -> "))]
    CyclicScript(Vec<String>),
    #[error("Script includes nest deeper than {0}")]
    TooDeep(usize),
    #[error("Unbound variable: ${{{0}}}")]
    UnboundVariable(String),
    #[error("Invalid action in script: {0}")]
    InvalidAction(#[from] ActionError),
    #[error("Invalid script registry: {0}")]
    Registry(String),
    #[error("Script I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expands script invocations against the registry on disk.
///
/// The registry is re-read for every invocation so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    registry_path: PathBuf,
    max_depth: usize,
}

impl ScriptEngine {
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub fn registry(&self) -> Result<ScriptRegistry, ScriptError> {
        ScriptRegistry::load(&self.registry_path)
    }

    /// Expand a named script into primitives. Nothing is returned on any failure.
    pub fn expand_invocation(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<Action>, ScriptError> {
        let registry = self.registry()?;
        Expander::new(&registry)
            .with_max_depth(self.max_depth)
            .expand_named(name, vars)
    }

    /// Expand inline script text, resolving any includes through the registry.
    pub fn expand_source(
        &self,
        source: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<Action>, ScriptError> {
        let script = parse_script(source)?;
        let registry = self.registry()?;
        Expander::new(&registry)
            .with_max_depth(self.max_depth)
            .expand(&script, vars)
    }

    /// Primitives for one decided action: script invocations expand, anything else
    /// passes through.
    pub fn expand_action(&self, action: &Action) -> Result<Vec<Action>, ScriptError> {
        match action {
            Action::RunScript { name, vars } => self.expand_invocation(name, vars),
            other => Ok(vec![other.clone()]),
        }
    }
}
