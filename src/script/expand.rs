//! Expansion of scripts into flat primitive action lists.

use std::collections::BTreeMap;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{Script, ScriptEntry, ScriptError, ScriptRegistry};
use crate::actions::Action;

/// Include nesting limit.
pub const DEFAULT_MAX_DEPTH: usize = 8;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid regex"));

/// Replace `${VAR}` from `vars`, falling back to the process environment.
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> Result<String, ScriptError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(text) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let name = &caps[1];
        let value = match vars.get(name) {
            Some(value) => value.clone(),
            None => std::env::var(name)
                .map_err(|_| ScriptError::UnboundVariable(name.to_string()))?,
        };
        out.push_str(&text[last..whole.start]);
        out.push_str(&value);
        last = whole.end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

struct IncludeFrame {
    name: String,
    path: PathBuf,
}

/// Expands scripts against a registry.
pub struct Expander<'a> {
    registry: &'a ScriptRegistry,
    max_depth: usize,
}

impl<'a> Expander<'a> {
    pub fn new(registry: &'a ScriptRegistry) -> Self {
        Self {
            registry,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Expand an in-memory script.
    pub fn expand(
        &self,
        script: &Script,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<Action>, ScriptError> {
        let mut out = Vec::new();
        self.expand_into(script, vars, &mut Vec::new(), &mut out)?;
        Ok(out)
    }

    /// Expand a registered script by name.
    pub fn expand_named(
        &self,
        name: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<Vec<Action>, ScriptError> {
        let path = self.registry.resolve(name)?;
        let script = ScriptRegistry::read_script(&path)?;
        let mut stack = vec![IncludeFrame {
            name: name.trim().to_string(),
            path,
        }];
        let mut out = Vec::new();
        self.expand_into(&script, vars, &mut stack, &mut out)?;
        debug!("Expanded script {} into {} actions", name, out.len());
        Ok(out)
    }

    fn expand_into(
        &self,
        script: &Script,
        vars: &BTreeMap<String, String>,
        stack: &mut Vec<IncludeFrame>,
        out: &mut Vec<Action>,
    ) -> Result<(), ScriptError> {
        for entry in &script.entries {
            match entry {
                ScriptEntry::Action(template) => out.push(template.instantiate(vars)?),
                ScriptEntry::Include { target, bindings } => {
                    let target = substitute(target, vars)?;
                    let child_vars = bindings
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), substitute(v, vars)?)))
                        .collect::<Result<BTreeMap<_, _>, ScriptError>>()?;

                    let path = self.registry.resolve(&target)?;
                    if stack.iter().any(|frame| frame.path == path) {
                        let mut chain: Vec<String> =
                            stack.iter().map(|frame| frame.name.clone()).collect();
                        chain.push(target);
                        return Err(ScriptError::CyclicScript(chain));
                    }
                    if stack.len() >= self.max_depth {
                        return Err(ScriptError::TooDeep(self.max_depth));
                    }

                    let child = ScriptRegistry::read_script(&path)?;
                    stack.push(IncludeFrame {
                        name: target,
                        path,
                    });
                    self.expand_into(&child, &child_vars, stack, out)?;
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Direction, Point};
    use std::fs;
    use std::path::Path;

    fn registry_with(dir: &Path, scripts: &[(&str, &str)]) -> ScriptRegistry {
        let mut registry = ScriptRegistry::empty(dir.join("registry.json"));
        for (name, source) in scripts {
            let file = format!("{}.txt", name);
            fs::write(dir.join(&file), source).unwrap();
            registry.insert(*name, file);
        }
        registry
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute() {
        let bound = vars(&[("APP", "notes")]);
        assert_eq!(substitute("open ${APP}!", &bound).unwrap(), "open notes!");
        assert_eq!(substitute("no vars", &bound).unwrap(), "no vars");
        assert!(matches!(
            substitute("${SCREEN_PILOT_SURELY_UNSET_VAR}", &bound),
            Err(ScriptError::UnboundVariable(name)) if name == "SCREEN_PILOT_SURELY_UNSET_VAR"
        ));
    }

    #[test]
    fn test_substitute_falls_back_to_environment() {
        std::env::set_var("SCREEN_PILOT_TEST_EXPAND_ENV", "from-env");
        assert_eq!(
            substitute("${SCREEN_PILOT_TEST_EXPAND_ENV}", &BTreeMap::new()).unwrap(),
            "from-env"
        );
    }

    #[test]
    fn test_nested_include_with_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            dir.path(),
            &[
                ("outer", "home\ninclude inner TEXT=${WHO}\nswipe up"),
                ("inner", "type hello ${TEXT}"),
            ],
        );
        let actions = Expander::new(&registry)
            .expand_named("outer", &vars(&[("WHO", "bob")]))
            .unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Home,
                Action::Type {
                    text: "hello bob".to_string()
                },
                Action::Swipe {
                    direction: Direction::Up,
                    start: None
                },
            ]
        );
    }

    #[test]
    fn test_child_does_not_inherit_parent_vars() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            dir.path(),
            &[
                ("outer", "include inner"),
                ("inner", "type ${SCREEN_PILOT_TEST_PARENT_ONLY}"),
            ],
        );
        let result = Expander::new(&registry)
            .expand_named("outer", &vars(&[("SCREEN_PILOT_TEST_PARENT_ONLY", "x")]));
        assert!(matches!(result, Err(ScriptError::UnboundVariable(_))));
    }

    #[test]
    fn test_cycle_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            dir.path(),
            &[("a", "home\ninclude b"), ("b", "wait\ninclude a")],
        );
        match Expander::new(&registry).expand_named("a", &BTreeMap::new()) {
            Err(ScriptError::CyclicScript(chain)) => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            dir.path(),
            &[("l1", "include l2"), ("l2", "include l3"), ("l3", "home")],
        );
        let expander = Expander::new(&registry).with_max_depth(2);
        assert!(matches!(
            expander.expand_named("l1", &BTreeMap::new()),
            Err(ScriptError::TooDeep(2))
        ));
        let actions = Expander::new(&registry)
            .expand_named("l1", &BTreeMap::new())
            .unwrap();
        assert_eq!(actions, vec![Action::Home]);
    }

    #[test]
    fn test_failure_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(
            dir.path(),
            &[("partial", "click(start_box='(1,1)')\ninclude missing")],
        );
        assert!(matches!(
            Expander::new(&registry).expand_named("partial", &BTreeMap::new()),
            Err(ScriptError::UnknownScript(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_expand_in_memory_script() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with(dir.path(), &[]);
        let script = crate::script::parse_script("click(start_box='(3,4)')\nwait").unwrap();
        let actions = Expander::new(&registry)
            .expand(&script, &BTreeMap::new())
            .unwrap();
        assert_eq!(
            actions,
            vec![
                Action::Click {
                    point: Point::new(3, 4)
                },
                Action::Wait
            ]
        );
    }
}
