//! Action vocabulary shared by the model reply parser, the script engine and executors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::parser::{CallArg, CallArgs};
use super::ActionError;

/// Upper bound of the model coordinate space on each axis.
pub const MODEL_COORD_MAX: i32 = 1000;

/// Sleep length used when a `sleep` carries no duration.
pub const DEFAULT_SLEEP_MS: u64 = 50;

/// A point in model coordinates (`0..=MODEL_COORD_MAX` on both axes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Gesture direction for scrolls and swipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(ActionError::InvalidParameter {
                param: "direction".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// What the screen should look like after an action has been performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// The frame must differ noticeably from the pre-action frame.
    ScreenChanged,
    /// Only a small region (typed text) may change.
    MinorChange,
    /// No visual outcome is implied.
    Unverifiable,
}

/// A single decision: a primitive input action, a terminal marker or a script invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        point: Point,
    },
    DoubleClick {
        point: Point,
    },
    RightClick {
        point: Point,
    },
    Drag {
        start: Point,
        end: Point,
    },
    Scroll {
        direction: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        point: Option<Point>,
    },
    Swipe {
        direction: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<Point>,
    },
    Type {
        text: String,
    },
    Hotkey {
        keys: String,
    },
    Home,
    AppSwitcher,
    Wait,
    Sleep {
        ms: u64,
    },
    Finished {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    CallUser {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RunScript {
        name: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        vars: BTreeMap<String, String>,
    },
}

impl Action {
    /// Build a hotkey action, mapping the device-level chords onto their dedicated actions.
    pub fn hotkey(keys: &str) -> Action {
        let normalized = keys
            .split_whitespace()
            .map(|k| k.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        match normalized.as_str() {
            "cmd 1" | "command 1" => Action::Home,
            "cmd 2" | "command 2" => Action::AppSwitcher,
            _ => Action::Hotkey { keys: normalized },
        }
    }

    /// Canonical action name, as accepted by the reply parser and the script DSL.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::RightClick { .. } => "right_click",
            Action::Drag { .. } => "drag",
            Action::Scroll { .. } => "scroll",
            Action::Swipe { .. } => "swipe",
            Action::Type { .. } => "type",
            Action::Hotkey { .. } => "hotkey",
            Action::Home => "home",
            Action::AppSwitcher => "app_switcher",
            Action::Wait => "wait",
            Action::Sleep { .. } => "sleep",
            Action::Finished { .. } => "finished",
            Action::CallUser { .. } => "call_user",
            Action::RunScript { .. } => "run_script",
        }
    }

    /// `finished` and `call_user` end the autonomous run and are never executed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finished { .. } | Action::CallUser { .. })
    }

    /// Sleep and wait are handled by the loop itself, not by an executor.
    pub fn is_pause(&self) -> bool {
        matches!(self, Action::Sleep { .. } | Action::Wait)
    }

    pub fn expectation(&self) -> Expectation {
        match self {
            Action::Type { .. } => Expectation::MinorChange,
            Action::Sleep { .. }
            | Action::Wait
            | Action::Finished { .. }
            | Action::CallUser { .. } => Expectation::Unverifiable,
            _ => Expectation::ScreenChanged,
        }
    }

    /// Decompose into a call name and named arguments.
    pub fn call_parts(&self) -> (&'static str, CallArgs) {
        let mut args = CallArgs::default();
        match self {
            Action::Click { point }
            | Action::DoubleClick { point }
            | Action::RightClick { point } => {
                args.push_named("start_box", point.to_string());
            }
            Action::Drag { start, end } => {
                args.push_named("start_box", start.to_string());
                args.push_named("end_box", end.to_string());
            }
            Action::Scroll { direction, point } => {
                if let Some(point) = point {
                    args.push_named("start_box", point.to_string());
                }
                args.push_named("direction", direction.as_str());
            }
            Action::Swipe { direction, start } => {
                if let Some(start) = start {
                    args.push_named("start_box", start.to_string());
                }
                args.push_named("direction", direction.as_str());
            }
            Action::Type { text } => args.push_named("content", text.clone()),
            Action::Hotkey { keys } => args.push_named("key", keys.clone()),
            Action::Sleep { ms } => args.push_named("ms", ms.to_string()),
            Action::Finished { message } | Action::CallUser { message } => {
                if let Some(message) = message {
                    args.push_named("content", message.clone());
                }
            }
            Action::RunScript { name, vars } => {
                args.push_named("name", name.clone());
                if !vars.is_empty() {
                    // BTreeMap<String, String> always serializes
                    let encoded = serde_json::to_string(vars).unwrap_or_else(|_| "{}".to_string());
                    args.push_named("vars", encoded);
                }
            }
            Action::Home | Action::AppSwitcher | Action::Wait => {}
        }
        (self.name(), args)
    }

    /// Render as call syntax, e.g. `click(start_box='(120,640)')`.
    pub fn to_call(&self) -> String {
        let (name, args) = self.call_parts();
        render_call(name, &args)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_call())
    }
}

/// Render a call name with its arguments. Every value is single-quoted.
pub fn render_call(name: &str, args: &CallArgs) -> String {
    let rendered: Vec<String> = args
        .iter()
        .map(|CallArg { key, value }| match key {
            Some(key) => format!("{}={}", key, quote(value)),
            None => quote(value),
        })
        .collect();
    format!("{}({})", name, rendered.join(", "))
}

/// Single-quote a value, escaping what the parser unescapes.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hotkey_maps_device_chords() {
        assert_eq!(Action::hotkey("cmd 1"), Action::Home);
        assert_eq!(Action::hotkey("Command  2"), Action::AppSwitcher);
        assert_eq!(
            Action::hotkey("CMD Shift P"),
            Action::Hotkey {
                keys: "cmd shift p".to_string()
            }
        );
    }

    #[test]
    fn test_expectations() {
        let click = Action::Click {
            point: Point::new(1, 2),
        };
        assert_eq!(click.expectation(), Expectation::ScreenChanged);
        let typed = Action::Type {
            text: "hi".to_string(),
        };
        assert_eq!(typed.expectation(), Expectation::MinorChange);
        assert_eq!(Action::Sleep { ms: 10 }.expectation(), Expectation::Unverifiable);
        assert_eq!(Action::Wait.expectation(), Expectation::Unverifiable);
    }

    #[test]
    fn test_terminal_markers() {
        assert!(Action::Finished { message: None }.is_terminal());
        assert!(Action::CallUser { message: None }.is_terminal());
        assert!(!Action::Home.is_terminal());
    }

    #[test]
    fn test_to_call_escapes_text() {
        let typed = Action::Type {
            text: "it's\nhere".to_string(),
        };
        assert_eq!(typed.to_call(), r"type(content='it\'s\nhere')");
    }

    #[test]
    fn test_to_call_points() {
        let drag = Action::Drag {
            start: Point::new(10, 20),
            end: Point::new(30, 40),
        };
        assert_eq!(drag.to_call(), "drag(start_box='(10,20)', end_box='(30,40)')");
        assert_eq!(Action::Home.to_call(), "home()");
    }

    #[test]
    fn test_direction_from_str() {
        assert_eq!("Down".parse::<Direction>().unwrap(), Direction::Down);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_serde_shape() {
        let action = Action::Scroll {
            direction: Direction::Up,
            point: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "scroll");
        assert_eq!(json["direction"], "up");
        assert!(json.get("point").is_none());
    }
}
