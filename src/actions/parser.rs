//! Parsing of model replies and call-syntax actions.
//!
//! Two reply layouts are understood:
//! - `Thought: ... Action: click(start_box='(120,640)')`
//! - `<think>...</think><answer>click(...)</answer>`
//!
//! Call arguments are split with a small quote/bracket aware state machine so that
//! commas inside `'(10,20)'` or `{"A":"b"}` do not terminate an argument.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::types::{Action, Point, DEFAULT_SLEEP_MS};
use super::ActionError;

static THOUGHT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)Thought\s*[:：]\s*(.*?)\s*(?:Action\s*[:：]|\z)").expect("valid regex")
});
static ACTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Action\s*[:：]").expect("valid regex"));
static CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^([A-Za-z_]\w*)\s*\((.*)\)$").expect("valid regex"));
static BARE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("valid regex"));
static POINT_ALIAS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(start_point|end_point|point)\s*=").expect("valid regex"));
static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"));

/// Every call name the parser accepts, aliases included.
const KNOWN_ACTIONS: &[&str] = &[
    "click",
    "left_single",
    "tap",
    "double_click",
    "left_double",
    "right_click",
    "right_single",
    "drag",
    "scroll",
    "swipe",
    "fswipe",
    "type",
    "hotkey",
    "home",
    "iphone_home",
    "app_switcher",
    "iphone_app_switcher",
    "wait",
    "sleep",
    "finished",
    "call_user",
    "run_script",
];

/// Whether `name` is an action the parser can build.
pub fn is_known_action(name: &str) -> bool {
    KNOWN_ACTIONS.contains(&name.to_ascii_lowercase().as_str())
}

/// Whether `name` is `finished` or `call_user`.
pub fn is_terminal_name(name: &str) -> bool {
    matches!(name.to_ascii_lowercase().as_str(), "finished" | "call_user")
}

/// One call argument: `key=value` or a bare positional value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArg {
    pub key: Option<String>,
    pub value: String,
}

/// Ordered call arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs(Vec<CallArg>);

impl CallArgs {
    pub fn push_named(&mut self, key: &str, value: impl Into<String>) {
        self.0.push(CallArg {
            key: Some(key.to_string()),
            value: value.into(),
        });
    }

    pub fn push_positional(&mut self, value: impl Into<String>) {
        self.0.push(CallArg {
            key: None,
            value: value.into(),
        });
    }

    /// First named value matching any of `keys`.
    pub fn get(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|wanted| {
            self.0
                .iter()
                .find(|arg| arg.key.as_deref() == Some(*wanted))
                .map(|arg| arg.value.as_str())
        })
    }

    pub fn positional(&self, index: usize) -> Option<&str> {
        self.0
            .iter()
            .filter(|arg| arg.key.is_none())
            .nth(index)
            .map(|arg| arg.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallArg> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CallArg> {
        self.0.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A reply reduced to its reasoning and the single action it chose.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub thought: String,
    pub action: Action,
    /// The call text the action was parsed from.
    pub raw_action: String,
}

/// Parse a model reply into a thought and exactly one action.
///
/// When a reply lists several actions only the first is kept.
pub fn parse_reply(reply: &str) -> Result<ParsedReply, ActionError> {
    let reply = reply.trim();
    let (thought, action_text) = split_reply(reply);

    let calls = split_top_level(&action_text, &['\n', ';'])?;
    let first = calls
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .ok_or(ActionError::MissingAction)?;
    if calls.iter().filter(|c| !c.trim().is_empty()).count() > 1 {
        warn!("Reply contains several actions, executing only the first: {}", first);
    }

    let (name, args) = parse_call(first)?;
    let action = build_action(&name, &args)?;
    Ok(ParsedReply {
        thought,
        action,
        raw_action: first.to_string(),
    })
}

fn split_reply(reply: &str) -> (String, String) {
    if reply.contains("<answer>") {
        let thinking = reply
            .split("<answer>")
            .next()
            .unwrap_or_default()
            .replace("<think>", "")
            .replace("</think>", "")
            .trim()
            .to_string();
        let action = reply
            .split("<answer>")
            .nth(1)
            .unwrap_or_default()
            .replace("</answer>", "")
            .trim()
            .to_string();
        return (thinking, action);
    }

    let thought = THOUGHT
        .captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let action = match ACTION_MARKER.find_iter(reply).last() {
        Some(marker) => reply[marker.end()..].trim().to_string(),
        None => reply.to_string(),
    };
    (thought, action)
}

/// Parse `name(args...)` or a bare `name` into its parts.
pub fn parse_call(text: &str) -> Result<(String, CallArgs), ActionError> {
    let cleaned = text
        .replace("<|box_start|>", "")
        .replace("<|box_end|>", "");
    let cleaned = POINT_ALIAS.replace_all(&cleaned, |caps: &regex::Captures| {
        if &caps[1] == "end_point" {
            "end_box=".to_string()
        } else {
            "start_box=".to_string()
        }
    });
    let cleaned = cleaned.trim().trim_end_matches('.').trim();

    if BARE_NAME.is_match(cleaned) {
        return Ok((cleaned.to_ascii_lowercase(), CallArgs::default()));
    }

    let caps = CALL
        .captures(cleaned)
        .ok_or_else(|| ActionError::ParseError(format!("Not a call: {}", cleaned)))?;
    let name = caps[1].to_ascii_lowercase();
    let mut args = CallArgs::default();
    for raw in split_top_level(&caps[2], &[','])? {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match split_key(raw) {
            Some((key, value)) => args.push_named(&key, parse_value(value)?),
            None => args.push_positional(parse_value(raw)?),
        }
    }
    Ok((name, args))
}

/// Split at any of `separators` occurring outside quotes and brackets.
pub fn split_top_level(text: &str, separators: &[char]) -> Result<Vec<String>, ActionError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut string_char = '\'';
    let mut escaped = false;
    let mut depth: i32 = 0;

    for c in text.chars() {
        if in_string {
            current.push(c);
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
            '"' | '\'' => {
                in_string = true;
                string_char = c;
                current.push(c);
            }
            '(' | '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ActionError::ParseError(format!(
                        "Unbalanced brackets in: {}",
                        text
                    )));
                }
                current.push(c);
            }
            _ if depth == 0 && separators.contains(&c) => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if in_string {
        return Err(ActionError::ParseError(format!("Unterminated quote in: {}", text)));
    }
    if depth != 0 {
        return Err(ActionError::ParseError(format!(
            "Unbalanced brackets in: {}",
            text
        )));
    }
    parts.push(current);
    Ok(parts)
}

/// Split `key=value` when the `=` precedes any quote or bracket.
fn split_key(raw: &str) -> Option<(String, &str)> {
    let eq = raw.find('=')?;
    let head = &raw[..eq];
    if head.contains(['\'', '"', '(', '[', '{']) {
        return None;
    }
    let key = head.trim();
    if !BARE_NAME.is_match(key) {
        return None;
    }
    Some((key.to_ascii_lowercase(), raw[eq + 1..].trim()))
}

/// Strip quotes and resolve escapes. Unquoted values are returned trimmed.
fn parse_value(raw: &str) -> Result<String, ActionError> {
    let raw = raw.trim();
    let mut chars = raw.chars();
    let quote = match chars.next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Ok(raw.to_string()),
    };
    if raw.len() < 2 || !raw.ends_with(quote) {
        return Err(ActionError::ParseError(format!("Malformed quoted value: {}", raw)));
    }
    Ok(unescape(&raw[1..raw.len() - 1]))
}

/// Resolve `\n`, `\t`, `\r`, `\\` and escaped quotes.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Extract a point from `(x,y)`, `[x, y]` or a four-number box (its center).
pub fn parse_point(text: &str) -> Option<Point> {
    let numbers: Vec<f64> = NUMBER
        .find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    let (x, y) = match numbers.as_slice() {
        [x1, y1, x2, y2, ..] => ((x1 + x2) / 2.0, (y1 + y2) / 2.0),
        [x, y, ..] => (*x, *y),
        _ => return None,
    };
    Some(Point::new(x.round() as i32, y.round() as i32))
}

fn required<'a>(args: &'a CallArgs, keys: &[&str]) -> Result<&'a str, ActionError> {
    args.get(keys)
        .or_else(|| args.positional(0))
        .ok_or_else(|| ActionError::MissingParameter(keys[0].to_string()))
}

fn required_point(args: &CallArgs, keys: &[&str]) -> Result<Point, ActionError> {
    let raw = args
        .get(keys)
        .ok_or_else(|| ActionError::MissingParameter(keys[0].to_string()))?;
    parse_point(raw).ok_or_else(|| ActionError::InvalidParameter {
        param: keys[0].to_string(),
        value: raw.to_string(),
    })
}

fn optional_point(args: &CallArgs, keys: &[&str]) -> Result<Option<Point>, ActionError> {
    match args.get(keys) {
        Some(raw) => parse_point(raw)
            .map(Some)
            .ok_or_else(|| ActionError::InvalidParameter {
                param: keys[0].to_string(),
                value: raw.to_string(),
            }),
        None => Ok(None),
    }
}

/// Sleep duration from `ms=`, `seconds=` or a positional value with an optional unit.
fn sleep_ms(args: &CallArgs) -> Result<u64, ActionError> {
    if let Some(ms) = args.get(&["ms", "duration_ms"]) {
        return parse_duration_ms(&format!("{}ms", ms.trim()));
    }
    if let Some(secs) = args.get(&["seconds", "secs", "s"]) {
        return parse_duration_ms(&format!("{}s", secs.trim()));
    }
    match args.positional(0) {
        Some(raw) => parse_duration_ms(raw),
        None => Ok(DEFAULT_SLEEP_MS),
    }
}

/// `250ms`, `1.5s`, a bare integer (milliseconds) or a bare float (seconds).
pub fn parse_duration_ms(raw: &str) -> Result<u64, ActionError> {
    let raw = raw.trim().to_ascii_lowercase();
    let invalid = || ActionError::InvalidParameter {
        param: "duration".to_string(),
        value: raw.clone(),
    };
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v >= 0.0)
            .map(|v| v.round() as u64)
            .ok_or_else(invalid);
    }
    if let Some(secs) = raw.strip_suffix('s') {
        return secs
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| *v >= 0.0)
            .map(|v| (v * 1000.0).round() as u64)
            .ok_or_else(invalid);
    }
    if let Ok(ms) = raw.parse::<u64>() {
        return Ok(ms);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| *v >= 0.0)
        .map(|v| (v * 1000.0).round() as u64)
        .ok_or_else(invalid)
}

/// Target name and variables of a `run_script` call.
///
/// Variables come from a `vars={...}` JSON object plus any other named argument.
pub fn run_script_parts(
    args: &CallArgs,
) -> Result<(String, BTreeMap<String, String>), ActionError> {
    if args.get(&["path", "file"]).is_some() {
        return Err(ActionError::InvalidParameter {
            param: "path".to_string(),
            value: "run_script resolves registry names only".to_string(),
        });
    }
    let name = args
        .get(&["name", "script"])
        .or_else(|| args.positional(0))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ActionError::MissingParameter("name".to_string()))?
        .to_string();

    let mut vars = BTreeMap::new();
    if let Some(raw) = args.get(&["vars"]) {
        vars.extend(parse_vars_object(raw)?);
    }
    for arg in args.iter() {
        if let Some(key) = &arg.key {
            if !matches!(key.as_str(), "name" | "script" | "vars") {
                vars.insert(key.to_ascii_uppercase(), arg.value.clone());
            }
        }
    }
    Ok((name, vars))
}

fn parse_vars_object(raw: &str) -> Result<BTreeMap<String, String>, ActionError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&raw.replace('\'', "\"")))
        .map_err(|_| ActionError::InvalidParameter {
            param: "vars".to_string(),
            value: raw.to_string(),
        })?;
    let object = value.as_object().ok_or_else(|| ActionError::InvalidParameter {
        param: "vars".to_string(),
        value: raw.to_string(),
    })?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect())
}

/// Build an [`Action`] from a parsed call.
pub fn build_action(name: &str, args: &CallArgs) -> Result<Action, ActionError> {
    let name = name.to_ascii_lowercase();
    let action = match name.as_str() {
        "click" | "left_single" | "tap" => Action::Click {
            point: required_point(args, &["start_box"])?,
        },
        "double_click" | "left_double" => Action::DoubleClick {
            point: required_point(args, &["start_box"])?,
        },
        "right_click" | "right_single" => Action::RightClick {
            point: required_point(args, &["start_box"])?,
        },
        "drag" => Action::Drag {
            start: required_point(args, &["start_box"])?,
            end: required_point(args, &["end_box"])?,
        },
        "scroll" => Action::Scroll {
            direction: required(args, &["direction"])?.parse()?,
            point: optional_point(args, &["start_box"])?,
        },
        "swipe" | "fswipe" => Action::Swipe {
            direction: required(args, &["direction"])?.parse()?,
            start: optional_point(args, &["start_box"])?,
        },
        "type" => Action::Type {
            text: required(args, &["content", "text"])?.to_string(),
        },
        "hotkey" => Action::hotkey(required(args, &["key", "hotkey", "keys"])?),
        "home" | "iphone_home" => Action::Home,
        "app_switcher" | "iphone_app_switcher" => Action::AppSwitcher,
        "wait" => Action::Wait,
        "sleep" => Action::Sleep {
            ms: sleep_ms(args)?,
        },
        "finished" => Action::Finished {
            message: args
                .get(&["content", "message"])
                .or_else(|| args.positional(0))
                .map(str::to_string),
        },
        "call_user" => Action::CallUser {
            message: args
                .get(&["content", "message"])
                .or_else(|| args.positional(0))
                .map(str::to_string),
        },
        "run_script" => {
            let (name, vars) = run_script_parts(args)?;
            Action::RunScript { name, vars }
        }
        other => return Err(ActionError::UnknownAction(other.to_string())),
    };
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Direction;

    #[test]
    fn test_parse_thought_action_reply() {
        let reply = "Thought: The search box is at the top.\nAction: click(start_box='(120,640)')";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.thought, "The search box is at the top.");
        assert_eq!(
            parsed.action,
            Action::Click {
                point: Point::new(120, 640)
            }
        );
    }

    #[test]
    fn test_parse_answer_tag_reply() {
        let reply = "<think>need to go home</think><answer>home()</answer>";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.thought, "need to go home");
        assert_eq!(parsed.action, Action::Home);
    }

    #[test]
    fn test_multiple_actions_keep_first() {
        let reply = "Thought: x\nAction: click(start_box='(1,2)')\ntype(content='abc')";
        let parsed = parse_reply(reply).unwrap();
        assert_eq!(parsed.action.name(), "click");
    }

    #[test]
    fn test_box_center_and_tokens() {
        let parsed =
            parse_reply("Action: click(start_box='<|box_start|>(100,200,300,400)<|box_end|>')")
                .unwrap();
        assert_eq!(
            parsed.action,
            Action::Click {
                point: Point::new(200, 300)
            }
        );
    }

    #[test]
    fn test_point_alias() {
        let parsed = parse_reply("Action: drag(point='(1,1)', end_point='(5,6)')").unwrap();
        assert_eq!(
            parsed.action,
            Action::Drag {
                start: Point::new(1, 1),
                end: Point::new(5, 6)
            }
        );
    }

    #[test]
    fn test_type_with_text_alias_and_escapes() {
        let parsed = parse_reply(r"Action: type(text='hello, world\n')").unwrap();
        assert_eq!(
            parsed.action,
            Action::Type {
                text: "hello, world\n".to_string()
            }
        );
    }

    #[test]
    fn test_hotkey_rewrite() {
        let parsed = parse_reply("Action: hotkey(key='cmd 1')").unwrap();
        assert_eq!(parsed.action, Action::Home);
    }

    #[test]
    fn test_scroll_direction() {
        let parsed = parse_reply("Action: scroll(direction='down')").unwrap();
        assert_eq!(
            parsed.action,
            Action::Scroll {
                direction: Direction::Down,
                point: None
            }
        );
    }

    #[test]
    fn test_run_script_with_vars() {
        let parsed =
            parse_reply(r#"Action: run_script(name='open', vars={"APP": "bilibili"})"#).unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("APP".to_string(), "bilibili".to_string());
        assert_eq!(
            parsed.action,
            Action::RunScript {
                name: "open".to_string(),
                vars
            }
        );
    }

    #[test]
    fn test_run_script_rejects_paths() {
        assert!(parse_reply("Action: run_script(path='/tmp/x.txt')").is_err());
    }

    #[test]
    fn test_finished_message() {
        let parsed = parse_reply("Thought: done\nAction: finished(content='all set')").unwrap();
        assert!(parsed.action.is_terminal());
        assert_eq!(
            parsed.action,
            Action::Finished {
                message: Some("all set".to_string())
            }
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            parse_reply("garbage"),
            Err(ActionError::UnknownAction(_))
        ));
        assert!(parse_reply("???").is_err());
        assert!(matches!(parse_reply("   "), Err(ActionError::MissingAction)));
        assert!(parse_reply("Action: click(start_box='(1,2)").is_err());
    }

    #[test]
    fn test_missing_parameter() {
        assert!(matches!(
            parse_reply("Action: click()"),
            Err(ActionError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_sleep_durations() {
        assert_eq!(parse_duration_ms("250ms").unwrap(), 250);
        assert_eq!(parse_duration_ms("1.5s").unwrap(), 1500);
        assert_eq!(parse_duration_ms("120").unwrap(), 120);
        assert_eq!(parse_duration_ms("0.5").unwrap(), 500);
        assert!(parse_duration_ms("soon").is_err());
        let parsed = parse_reply("Action: sleep()").unwrap();
        assert_eq!(parsed.action, Action::Sleep { ms: DEFAULT_SLEEP_MS });
    }

    #[test]
    fn test_to_call_parses_back() {
        let actions = vec![
            Action::DoubleClick {
                point: Point::new(3, 4),
            },
            Action::Swipe {
                direction: Direction::Left,
                start: Some(Point::new(500, 500)),
            },
            Action::Type {
                text: "it's a 'test', ok".to_string(),
            },
            Action::Sleep { ms: 180 },
            Action::CallUser {
                message: Some("need login".to_string()),
            },
        ];
        for action in actions {
            let parsed = parse_reply(&action.to_call()).unwrap();
            assert_eq!(parsed.action, action);
        }
    }
}
