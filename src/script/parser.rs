//! Script DSL parser.
//!
//! Statements are separated by newlines, `;` or `,` at top level. Each statement is
//! either a raw action call (`click(start_box='(10,20)')`) or a DSL command:
//!
//! ```text
//! # open the app and scroll its feed
//! open_app ${APP}
//! sleep 1.5s
//! swipe up x 3
//! include close_popups
//! ```

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::ScriptError;
use crate::actions::parser::{
    is_known_action, is_terminal_name, parse_call, parse_duration_ms, run_script_parts,
    split_top_level, unescape,
};
use crate::actions::{build_action, render_call, Action, CallArgs, Direction};

static VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid regex"));
static LEADING_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^[A-Za-z_]\w*\s*\(").expect("valid regex"));

/// Words that start a new DSL statement when several are written on one line.
const KEYWORDS: &[&str] = &[
    "home",
    "iphone_home",
    "app_switcher",
    "iphone_app_switcher",
    "sleep",
    "wait",
    "swipe",
    "fswipe",
    "scroll",
    "hotkey",
    "type",
    "open_app",
    "include",
    "run_script",
];

/// Commands whose argument is free text running to the end of the statement.
const FREE_TEXT: &[&str] = &["type", "open_app"];

/// Upper bound for the `x N` repeat suffix.
pub const MAX_REPEAT: usize = 1000;

/// An action call whose argument values may contain `${VAR}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionTemplate {
    pub name: String,
    pub args: CallArgs,
}

impl ActionTemplate {
    pub fn new(name: impl Into<String>, args: CallArgs) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Template for a concrete action.
    pub fn literal(action: &Action) -> Self {
        let (name, args) = action.call_parts();
        Self::new(name, args)
    }

    pub fn is_literal(&self) -> bool {
        self.args.iter().all(|arg| !VARIABLE.is_match(&arg.value))
    }

    /// Substitute variables and build the action.
    pub fn instantiate(&self, vars: &BTreeMap<String, String>) -> Result<Action, ScriptError> {
        let mut args = self.args.clone();
        for arg in args.iter_mut() {
            arg.value = super::substitute(&arg.value, vars)?;
        }
        Ok(build_action(&self.name, &args)?)
    }

    pub fn to_call(&self) -> String {
        render_call(&self.name, &self.args)
    }
}

/// One parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEntry {
    Action(ActionTemplate),
    /// Another registered script, expanded in place with its own bindings.
    Include {
        target: String,
        bindings: BTreeMap<String, String>,
    },
}

/// A parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub entries: Vec<ScriptEntry>,
    /// Every `${VAR}` name referenced anywhere in the source.
    pub variables: BTreeSet<String>,
}

impl Script {
    /// A script that replays `actions` literally.
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a Action>) -> Self {
        let entries = actions
            .into_iter()
            .map(|action| match action {
                Action::RunScript { name, vars } => ScriptEntry::Include {
                    target: name.clone(),
                    bindings: vars.clone(),
                },
                other => ScriptEntry::Action(ActionTemplate::literal(other)),
            })
            .collect();
        Self {
            entries,
            variables: BTreeSet::new(),
        }
    }

    /// Render back to source, one call per line. The output parses to the same script.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                ScriptEntry::Action(template) => out.push_str(&template.to_call()),
                ScriptEntry::Include { target, bindings } => {
                    let mut args = CallArgs::default();
                    args.push_named("name", target.clone());
                    if !bindings.is_empty() {
                        let encoded =
                            serde_json::to_string(bindings).unwrap_or_else(|_| "{}".to_string());
                        args.push_named("vars", encoded);
                    }
                    out.push_str(&render_call("run_script", &args));
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Parse script source.
pub fn parse_script(source: &str) -> Result<Script, ScriptError> {
    let variables = VARIABLE
        .captures_iter(source)
        .map(|c| c[1].to_string())
        .collect();

    let without_comments: Vec<&str> = source
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with('#') || trimmed.starts_with("//"))
        })
        .collect();
    let joined = without_comments.join("\n");

    let top = split_top_level(&joined, &['\n', ';', ',']).map_err(|e| ScriptError::Syntax {
        statement: 0,
        message: e.to_string(),
    })?;

    let mut statements = Vec::new();
    for stmt in top.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        for piece in explode_call_prefix(stmt) {
            if piece.contains(['(', ')', '=']) {
                statements.push(piece);
            } else {
                statements.extend(split_compound(&piece));
            }
        }
    }

    let mut entries = Vec::new();
    for (index, stmt) in statements.iter().enumerate() {
        entries.extend(parse_statement(index + 1, stmt)?);
    }
    Ok(Script { entries, variables })
}

/// `home() sleep swipe left` -> [`home()`, `sleep swipe left`].
fn explode_call_prefix(stmt: &str) -> Vec<String> {
    if !LEADING_CALL.is_match(stmt) {
        return vec![stmt.to_string()];
    }
    let mut in_string = false;
    let mut string_char = '\'';
    let mut escaped = false;
    let mut depth = 0i32;
    for (i, c) in stmt.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == string_char {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_string = true;
                string_char = c;
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    let head = stmt[..=i].trim();
                    let tail = stmt[i + 1..].trim();
                    if tail.is_empty() {
                        return vec![head.to_string()];
                    }
                    let mut out = vec![head.to_string()];
                    out.extend(explode_call_prefix(tail));
                    return out;
                }
            }
            _ => {}
        }
    }
    vec![stmt.to_string()]
}

/// Split `home sleep swipe left x 3` at keyword boundaries.
fn split_compound(stmt: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for token in stmt.split_whitespace() {
        let lower = token.to_ascii_lowercase();
        let in_free_text = current
            .first()
            .map(|first| FREE_TEXT.contains(&first.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if KEYWORDS.contains(&lower.as_str()) && !current.is_empty() && !in_free_text {
            out.push(current.join(" "));
            current.clear();
        }
        current.push(token);
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}

fn syntax(statement: usize, message: impl Into<String>) -> ScriptError {
    ScriptError::Syntax {
        statement,
        message: message.into(),
    }
}

fn parse_statement(index: usize, stmt: &str) -> Result<Vec<ScriptEntry>, ScriptError> {
    if LEADING_CALL.is_match(stmt) {
        return parse_raw_call(index, stmt).map(|entry| vec![entry]);
    }

    let trimmed = stmt.trim();
    let (head, remainder) = match trimmed.split_once(char::is_whitespace) {
        Some((head, remainder)) => (head, remainder.trim_start()),
        None => (trimmed, ""),
    };
    if head.is_empty() {
        return Ok(Vec::new());
    }
    let command = head.to_ascii_lowercase();
    // free text keeps the raw remainder, untokenized
    let mut rest = if FREE_TEXT.contains(&command.as_str()) {
        Vec::new()
    } else {
        tokenize(remainder).map_err(|message| syntax(index, message))?
    };

    let mut repeat = 1usize;
    if rest.len() >= 2 && rest[rest.len() - 2].eq_ignore_ascii_case("x") {
        let count = &rest[rest.len() - 1];
        repeat = count.parse().map_err(|_| {
            syntax(index, format!("repeat count must be an integer, got {}", count))
        })?;
        if repeat > MAX_REPEAT {
            return Err(syntax(
                index,
                format!("repeat count {} exceeds the limit of {}", repeat, MAX_REPEAT),
            ));
        }
        rest.truncate(rest.len() - 2);
    }

    let templates: Vec<ScriptEntry> = match command.as_str() {
        "home" | "iphone_home" => vec![literal(Action::Home)],
        "app_switcher" | "iphone_app_switcher" => vec![literal(Action::AppSwitcher)],
        "wait" => vec![literal(Action::Wait)],
        "finished" | "call_user" => {
            return Err(syntax(index, format!("{} is not allowed in scripts", command)))
        }
        "sleep" => {
            let mut args = CallArgs::default();
            if let Some(duration) = rest.first() {
                if !VARIABLE.is_match(duration) {
                    parse_duration_ms(duration).map_err(|e| syntax(index, e.to_string()))?;
                }
                args.push_positional(duration.clone());
            }
            vec![template(index, "sleep", args)?]
        }
        "swipe" | "fswipe" | "scroll" => {
            let direction = rest
                .first()
                .ok_or_else(|| syntax(index, format!("{} requires a direction", command)))?;
            if !VARIABLE.is_match(direction) {
                direction
                    .parse::<Direction>()
                    .map_err(|_| {
                        syntax(
                            index,
                            format!("{} direction must be up|down|left|right", command),
                        )
                    })?;
            }
            let mut args = CallArgs::default();
            args.push_named("direction", direction.clone());
            let name = if command == "scroll" { "scroll" } else { "swipe" };
            vec![template(index, name, args)?]
        }
        "hotkey" => {
            if rest.is_empty() {
                return Err(syntax(index, "hotkey requires keys, e.g. 'hotkey cmd 1'"));
            }
            let mut args = CallArgs::default();
            args.push_named("key", rest.join(" "));
            vec![template(index, "hotkey", args)?]
        }
        "type" => {
            let mut args = CallArgs::default();
            args.push_named("content", unescape(remainder));
            vec![template(index, "type", args)?]
        }
        "open_app" => {
            if remainder.is_empty() {
                return Err(syntax(index, "open_app requires an app name"));
            }
            open_app_macro(index, remainder)?
        }
        "include" | "run_script" => {
            let target = rest
                .first()
                .ok_or_else(|| syntax(index, format!("{} requires a script name", command)))?;
            let mut bindings = BTreeMap::new();
            for pair in &rest[1..] {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| {
                        syntax(index, format!("bindings must be KEY=VALUE, got {}", pair))
                    })?;
                if key.trim().is_empty() {
                    return Err(syntax(index, format!("binding has an empty key: {}", pair)));
                }
                bindings.insert(key.trim().to_string(), value.to_string());
            }
            vec![ScriptEntry::Include {
                target: target.clone(),
                bindings,
            }]
        }
        other => return Err(syntax(index, format!("unknown command: {}", other))),
    };

    let capacity = templates
        .len()
        .checked_mul(repeat)
        .ok_or_else(|| syntax(index, "repeated statement is too large"))?;
    let mut out = Vec::with_capacity(capacity);
    for _ in 0..repeat {
        out.extend(templates.iter().cloned());
    }
    Ok(out)
}

fn parse_raw_call(index: usize, stmt: &str) -> Result<ScriptEntry, ScriptError> {
    let (name, args) = parse_call(stmt).map_err(|e| syntax(index, e.to_string()))?;
    if !is_known_action(&name) {
        return Err(syntax(index, format!("unknown action: {}", name)));
    }
    if is_terminal_name(&name) {
        return Err(syntax(index, format!("{} is not allowed in scripts", name)));
    }
    if name == "run_script" {
        let (target, bindings) = run_script_parts(&args).map_err(|e| syntax(index, e.to_string()))?;
        return Ok(ScriptEntry::Include { target, bindings });
    }
    template(index, &name, args)
}

/// Build a template, validating it right away when it has no placeholders.
fn template(index: usize, name: &str, args: CallArgs) -> Result<ScriptEntry, ScriptError> {
    let template = ActionTemplate::new(name, args);
    if template.is_literal() {
        build_action(&template.name, &template.args).map_err(|e| syntax(index, e.to_string()))?;
    }
    Ok(ScriptEntry::Action(template))
}

fn literal(action: Action) -> ScriptEntry {
    ScriptEntry::Action(ActionTemplate::literal(&action))
}

/// Spotlight launch: home, pull down search, type the name and confirm.
fn open_app_macro(index: usize, app: &str) -> Result<Vec<ScriptEntry>, ScriptError> {
    let mut swipe = CallArgs::default();
    swipe.push_named("direction", "down");
    let mut short = CallArgs::default();
    short.push_named("ms", "120");
    let mut content = CallArgs::default();
    content.push_named("content", format!("{}\n", unescape(app)));
    let mut settle = CallArgs::default();
    settle.push_named("ms", "350");
    Ok(vec![
        literal(Action::Home),
        template(index, "swipe", swipe)?,
        template(index, "sleep", short)?,
        template(index, "type", content)?,
        template(index, "sleep", settle)?,
    ])
}

/// Whitespace split that keeps quoted runs together.
fn tokenize(stmt: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote_char: Option<char> = None;
    let mut has_token = false;

    for c in stmt.chars() {
        match quote_char {
            Some(q) if c == q => quote_char = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote_char = Some(c);
                has_token = true;
            }
            None if c.is_whitespace() => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            None => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if quote_char.is_some() {
        return Err(format!("unterminated quote in: {}", stmt));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}
