//! Builds literal scripts from recorded input events.
//!
//! This is a pure transformation: the caller captures pointer/keyboard events from
//! whatever source it has and hands them over in order. Classification thresholds
//! live in [`GestureThresholds`].

use serde::{Deserialize, Serialize};

use super::Script;
use crate::actions::{Action, Direction, Point, MODEL_COORD_MAX};

/// Minimum pointer travel (px) before a press counts as a drag or swipe.
pub const DRAG_THRESHOLD_PX: f64 = 18.0;
/// A press released this soon after passing the drag threshold is a swipe.
pub const SWIPE_MAX_HOLD_MS: u64 = 120;
/// Whole press-to-release budget for a swipe.
pub const SWIPE_MAX_DURATION_MS: u64 = 400;
/// Two clicks on the same spot within this window become a double click.
pub const DOUBLE_CLICK_WINDOW_MS: u64 = 300;
/// Gaps shorter than this are not recorded as sleeps.
pub const MIN_SLEEP_MS: u64 = 180;
/// Recorded sleeps are capped at this length.
pub const MAX_SLEEP_MS: u64 = 2000;
/// Key chords count only this soon after pointer activity inside the region.
pub const KEYBOARD_FOCUS_WINDOW_MS: u64 = 2000;
/// Identical chords repeated within this window are dropped.
pub const HOTKEY_DEBOUNCE_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GestureThresholds {
    pub drag_threshold_px: f64,
    pub swipe_max_hold_ms: u64,
    pub swipe_max_duration_ms: u64,
    pub double_click_window_ms: u64,
    pub min_sleep_ms: u64,
    pub max_sleep_ms: u64,
    pub keyboard_focus_window_ms: u64,
    pub hotkey_debounce_ms: u64,
}

impl Default for GestureThresholds {
    fn default() -> Self {
        Self {
            drag_threshold_px: DRAG_THRESHOLD_PX,
            swipe_max_hold_ms: SWIPE_MAX_HOLD_MS,
            swipe_max_duration_ms: SWIPE_MAX_DURATION_MS,
            double_click_window_ms: DOUBLE_CLICK_WINDOW_MS,
            min_sleep_ms: MIN_SLEEP_MS,
            max_sleep_ms: MAX_SLEEP_MS,
            keyboard_focus_window_ms: KEYBOARD_FOCUS_WINDOW_MS,
            hotkey_debounce_ms: HOTKEY_DEBOUNCE_MS,
        }
    }
}

/// The target region in source (screen) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }

    /// Map a source position into model coordinates, clamped to the region.
    pub fn to_model(&self, x: f64, y: f64) -> Point {
        let scale = |offset: f64, extent: f64| -> i32 {
            if extent <= 0.0 {
                return 0;
            }
            let v = (offset / extent * MODEL_COORD_MAX as f64).round() as i32;
            v.clamp(0, MODEL_COORD_MAX)
        };
        Point::new(scale(x - self.x, self.width), scale(y - self.y, self.height))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Cmd,
    Ctrl,
    Alt,
    Shift,
}

impl Modifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Modifier::Cmd => "cmd",
            Modifier::Ctrl => "ctrl",
            Modifier::Alt => "alt",
            Modifier::Shift => "shift",
        }
    }
}

/// One raw input event. Timestamps are milliseconds on any monotonic clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    PointerDown {
        at_ms: u64,
        x: f64,
        y: f64,
        button: PointerButton,
    },
    PointerMove {
        at_ms: u64,
        x: f64,
        y: f64,
    },
    PointerUp {
        at_ms: u64,
        x: f64,
        y: f64,
        button: PointerButton,
    },
    Scroll {
        at_ms: u64,
        x: f64,
        y: f64,
        dx: f64,
        dy: f64,
    },
    KeyChord {
        at_ms: u64,
        modifiers: Vec<Modifier>,
        key: String,
    },
}

struct Press {
    x: f64,
    y: f64,
    at_ms: u64,
    /// When the pointer first travelled past the drag threshold.
    crossed_at_ms: Option<u64>,
}

struct LastClick {
    index: usize,
    at_ms: u64,
    x: f64,
    y: f64,
    point: Point,
}

struct Recorder<'a> {
    region: Region,
    thresholds: &'a GestureThresholds,
    actions: Vec<Action>,
    last_action_ms: Option<u64>,
    last_inside_ms: Option<u64>,
    press: Option<Press>,
    last_click: Option<LastClick>,
    last_chord: Option<(String, u64)>,
}

impl<'a> Recorder<'a> {
    fn new(region: Region, thresholds: &'a GestureThresholds) -> Self {
        Self {
            region,
            thresholds,
            actions: Vec::new(),
            last_action_ms: None,
            last_inside_ms: None,
            press: None,
            last_click: None,
            last_chord: None,
        }
    }

    fn emit(&mut self, action: Action, at_ms: u64) {
        // repeated identical scroll ticks collapse into one
        if matches!(action, Action::Scroll { .. }) && self.actions.last() == Some(&action) {
            self.last_action_ms = Some(at_ms);
            return;
        }
        if let Some(previous) = self.last_action_ms {
            let gap = at_ms.saturating_sub(previous);
            if gap >= self.thresholds.min_sleep_ms {
                self.actions.push(Action::Sleep {
                    ms: gap.min(self.thresholds.max_sleep_ms),
                });
            }
        }
        self.actions.push(action);
        self.last_action_ms = Some(at_ms);
    }

    fn travelled(&self, press: &Press, x: f64, y: f64) -> bool {
        let (dx, dy) = (x - press.x, y - press.y);
        (dx * dx + dy * dy).sqrt() >= self.thresholds.drag_threshold_px
    }

    fn handle(&mut self, event: &InputEvent) {
        match event {
            InputEvent::PointerDown { at_ms, x, y, button } => {
                if !self.region.contains(*x, *y) {
                    self.press = None;
                    return;
                }
                self.last_inside_ms = Some(*at_ms);
                match button {
                    PointerButton::Left => {
                        self.press = Some(Press {
                            x: *x,
                            y: *y,
                            at_ms: *at_ms,
                            crossed_at_ms: None,
                        })
                    }
                    PointerButton::Right => {
                        let point = self.region.to_model(*x, *y);
                        self.last_click = None;
                        self.emit(Action::RightClick { point }, *at_ms);
                    }
                }
            }
            InputEvent::PointerMove { at_ms, x, y } => {
                if self.region.contains(*x, *y) {
                    self.last_inside_ms = Some(*at_ms);
                }
                let crossed = match &self.press {
                    Some(press) if press.crossed_at_ms.is_none() => self.travelled(press, *x, *y),
                    _ => false,
                };
                if crossed {
                    if let Some(press) = self.press.as_mut() {
                        press.crossed_at_ms = Some(*at_ms);
                    }
                }
            }
            InputEvent::PointerUp {
                at_ms,
                x,
                y,
                button: PointerButton::Left,
            } => {
                let Some(mut press) = self.press.take() else {
                    return;
                };
                if self.region.contains(*x, *y) {
                    self.last_inside_ms = Some(*at_ms);
                }
                if press.crossed_at_ms.is_none() && self.travelled(&press, *x, *y) {
                    press.crossed_at_ms = Some(*at_ms);
                }
                match press.crossed_at_ms {
                    Some(crossed_at) => self.finish_gesture(&press, crossed_at, *at_ms, *x, *y),
                    None => self.finish_click(&press, *at_ms),
                }
            }
            InputEvent::PointerUp { .. } => {}
            InputEvent::Scroll { at_ms, x, y, dx, dy } => {
                if !self.region.contains(*x, *y) {
                    return;
                }
                self.last_inside_ms = Some(*at_ms);
                let direction = if dx.abs() > dy.abs() {
                    if *dx > 0.0 {
                        Direction::Right
                    } else {
                        Direction::Left
                    }
                } else if *dy > 0.0 {
                    Direction::Up
                } else if *dy < 0.0 {
                    Direction::Down
                } else {
                    return;
                };
                let point = Some(self.region.to_model(*x, *y));
                self.last_click = None;
                self.emit(Action::Scroll { direction, point }, *at_ms);
            }
            InputEvent::KeyChord {
                at_ms,
                modifiers,
                key,
            } => self.handle_chord(*at_ms, modifiers, key),
        }
    }

    fn finish_gesture(&mut self, press: &Press, crossed_at: u64, at_ms: u64, x: f64, y: f64) {
        let hold = crossed_at.saturating_sub(press.at_ms);
        let duration = at_ms.saturating_sub(press.at_ms);
        let start = self.region.to_model(press.x, press.y);
        let action = if hold <= self.thresholds.swipe_max_hold_ms
            && duration <= self.thresholds.swipe_max_duration_ms
        {
            let (dx, dy) = (x - press.x, y - press.y);
            let direction = if dx.abs() > dy.abs() {
                if dx > 0.0 {
                    Direction::Right
                } else {
                    Direction::Left
                }
            } else if dy > 0.0 {
                Direction::Down
            } else {
                Direction::Up
            };
            Action::Swipe {
                direction,
                start: Some(start),
            }
        } else {
            Action::Drag {
                start,
                end: self.region.to_model(x, y),
            }
        };
        self.last_click = None;
        self.emit(action, at_ms);
    }

    fn finish_click(&mut self, press: &Press, at_ms: u64) {
        let point = self.region.to_model(press.x, press.y);
        if let Some(last) = self.last_click.take() {
            let (dx, dy) = (press.x - last.x, press.y - last.y);
            let close = (dx * dx + dy * dy).sqrt() < self.thresholds.drag_threshold_px;
            let quick = press.at_ms.saturating_sub(last.at_ms)
                <= self.thresholds.double_click_window_ms;
            if close && quick {
                self.actions.truncate(last.index);
                self.actions.push(Action::DoubleClick { point: last.point });
                self.last_action_ms = Some(at_ms);
                return;
            }
        }
        self.emit(Action::Click { point }, at_ms);
        self.last_click = Some(LastClick {
            index: self.actions.len() - 1,
            at_ms: press.at_ms,
            x: press.x,
            y: press.y,
            point,
        });
    }

    fn handle_chord(&mut self, at_ms: u64, modifiers: &[Modifier], key: &str) {
        let focused = self
            .last_inside_ms
            .map(|inside| at_ms.saturating_sub(inside) <= self.thresholds.keyboard_focus_window_ms)
            .unwrap_or(false);
        let key = key.trim().to_ascii_lowercase();
        if !focused || modifiers.is_empty() || key.is_empty() {
            return;
        }
        let mut modifiers = modifiers.to_vec();
        modifiers.sort();
        modifiers.dedup();
        let mut parts: Vec<&str> = modifiers.iter().map(|m| m.as_str()).collect();
        parts.push(&key);
        let chord = parts.join(" ");

        if let Some((last, last_at)) = &self.last_chord {
            let bounced = at_ms.saturating_sub(*last_at) < self.thresholds.hotkey_debounce_ms;
            if *last == chord && bounced {
                return;
            }
        }
        self.last_chord = Some((chord.clone(), at_ms));
        self.last_click = None;
        self.emit(Action::hotkey(&chord), at_ms);
    }
}

/// Classify an ordered event stream into a literal script.
pub fn record_from_events(
    events: &[InputEvent],
    region: Region,
    thresholds: &GestureThresholds,
) -> Script {
    let mut recorder = Recorder::new(region, thresholds);
    for event in events {
        recorder.handle(event);
    }
    Script::from_actions(&recorder.actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptEntry;
    use std::collections::BTreeMap;

    fn region() -> Region {
        // 1 px == 2 model units on both axes
        Region::new(100.0, 100.0, 500.0, 500.0)
    }

    fn actions(events: &[InputEvent]) -> Vec<Action> {
        record_from_events(events, region(), &GestureThresholds::default())
            .entries
            .iter()
            .map(|entry| match entry {
                ScriptEntry::Action(t) => t.instantiate(&BTreeMap::new()).unwrap(),
                ScriptEntry::Include { .. } => panic!("recorded scripts are literal"),
            })
            .collect()
    }

    fn down(at_ms: u64, x: f64, y: f64) -> InputEvent {
        InputEvent::PointerDown {
            at_ms,
            x,
            y,
            button: PointerButton::Left,
        }
    }

    fn up(at_ms: u64, x: f64, y: f64) -> InputEvent {
        InputEvent::PointerUp {
            at_ms,
            x,
            y,
            button: PointerButton::Left,
        }
    }

    fn mv(at_ms: u64, x: f64, y: f64) -> InputEvent {
        InputEvent::PointerMove { at_ms, x, y }
    }

    #[test]
    fn test_click_maps_to_model_coordinates() {
        assert_eq!(
            actions(&[down(0, 350.0, 225.0), up(40, 351.0, 225.0)]),
            vec![Action::Click {
                point: Point::new(500, 250)
            }]
        );
    }

    #[test]
    fn test_quick_two_point_drag_is_a_swipe() {
        let recorded = actions(&[down(0, 350.0, 500.0), up(80, 350.0, 200.0)]);
        assert_eq!(
            recorded,
            vec![Action::Swipe {
                direction: Direction::Up,
                start: Some(Point::new(500, 800))
            }]
        );
    }

    #[test]
    fn test_held_drag_stays_a_drag() {
        let recorded = actions(&[
            down(0, 150.0, 150.0),
            mv(400, 160.0, 150.0),
            mv(600, 300.0, 150.0),
            up(900, 350.0, 150.0),
        ]);
        assert_eq!(
            recorded,
            vec![Action::Drag {
                start: Point::new(100, 100),
                end: Point::new(500, 100)
            }]
        );
    }

    #[test]
    fn test_double_click_and_sleeps() {
        let recorded = actions(&[
            down(0, 200.0, 200.0),
            up(30, 200.0, 200.0),
            down(150, 201.0, 200.0),
            up(180, 201.0, 200.0),
            InputEvent::PointerDown {
                at_ms: 5000,
                x: 200.0,
                y: 200.0,
                button: PointerButton::Right,
            },
        ]);
        assert_eq!(
            recorded,
            vec![
                Action::DoubleClick {
                    point: Point::new(200, 200)
                },
                Action::Sleep { ms: MAX_SLEEP_MS },
                Action::RightClick {
                    point: Point::new(200, 200)
                },
            ]
        );
    }

    #[test]
    fn test_events_outside_region_are_dropped() {
        let recorded = actions(&[
            down(0, 10.0, 10.0),
            up(20, 10.0, 10.0),
            InputEvent::Scroll {
                at_ms: 30,
                x: 10.0,
                y: 10.0,
                dx: 0.0,
                dy: -3.0,
            },
        ]);
        assert!(recorded.is_empty());
    }

    #[test]
    fn test_scroll_direction_and_compaction() {
        let tick = |at_ms| InputEvent::Scroll {
            at_ms,
            x: 350.0,
            y: 350.0,
            dx: 0.0,
            dy: -2.0,
        };
        let recorded = actions(&[tick(0), tick(20), tick(40)]);
        assert_eq!(
            recorded,
            vec![Action::Scroll {
                direction: Direction::Down,
                point: Some(Point::new(500, 500))
            }]
        );
    }

    #[test]
    fn test_chords_need_focus_and_map_aliases() {
        let chord = |at_ms, key: &str| InputEvent::KeyChord {
            at_ms,
            modifiers: vec![Modifier::Shift, Modifier::Cmd],
            key: key.to_string(),
        };
        let home = InputEvent::KeyChord {
            at_ms: 100,
            modifiers: vec![Modifier::Cmd],
            key: "1".to_string(),
        };

        // no pointer activity inside the region yet
        assert!(actions(&[chord(0, "P")]).is_empty());

        let recorded = actions(&[
            mv(0, 300.0, 300.0),
            home,
            chord(150, "P"),
            chord(250, "P"),
        ]);
        assert_eq!(
            recorded,
            vec![
                Action::Home,
                Action::Hotkey {
                    keys: "cmd shift p".to_string()
                }
            ]
        );
    }
}
