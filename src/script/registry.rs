//! Script registry: a JSON object mapping script names to file paths.
//!
//! Relative paths resolve against the registry file's directory. Only listed names
//! resolve; a missing registry file is an empty registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{parse_script, Script, ScriptError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRegistry {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ScriptRegistry {
    /// An empty registry that will be saved to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::empty(path));
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::empty(path));
        }
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| ScriptError::Registry(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| ScriptError::Registry("registry must be a JSON object".to_string()))?;

        let mut entries = BTreeMap::new();
        for (name, target) in object {
            match target.as_str().map(str::trim) {
                Some(target) if !name.trim().is_empty() && !target.is_empty() => {
                    entries.insert(name.trim().to_string(), target.to_string());
                }
                _ => warn!("Ignoring registry entry {}: expected a non-empty path", name),
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a registered name to an existing script file.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, ScriptError> {
        let name = name.trim();
        let target = self
            .entries
            .get(name)
            .ok_or_else(|| ScriptError::UnknownScript(name.to_string()))?;
        let target = Path::new(target);
        let path = if target.is_absolute() {
            target.to_path_buf()
        } else {
            self.base_dir().join(target)
        };
        if !path.is_file() {
            return Err(ScriptError::MissingScriptFile {
                name: name.to_string(),
                path,
            });
        }
        Ok(path)
    }

    pub fn read_script(path: &Path) -> Result<Script, ScriptError> {
        let source = fs::read_to_string(path)?;
        parse_script(&source)
    }

    /// Resolve and parse a registered script.
    pub fn load_script(&self, name: &str) -> Result<Script, ScriptError> {
        Self::read_script(&self.resolve(name)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name.trim())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `name`, replacing any previous path.
    pub fn insert(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.entries.insert(name.into(), path.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name.trim())
    }

    /// Write a script file next to the registry and register it.
    pub fn add_script(&mut self, name: &str, script: &Script) -> Result<PathBuf, ScriptError> {
        let file = format!("{}.txt", name.trim());
        let path = self.base_dir().join(&file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, script.to_source())?;
        self.insert(name.trim(), file);
        Ok(path)
    }

    pub fn save(&self) -> Result<(), ScriptError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| ScriptError::Registry(e.to_string()))?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
