use rdev::{simulate, Button, EventType, Key};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::InputDevice;
use crate::errors::{FlowError, Result};

/// A key chord such as `ctrl+shift+tab`, validated when parsed.
#[derive(Clone, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct Hotkey {
    label: String,
    keys: Vec<Key>,
}

impl Hotkey {
    /// Built-in chord whose `label` is already in canonical form.
    pub(crate) fn preset(label: &str, keys: &[Key]) -> Self {
        Self {
            label: label.to_string(),
            keys: keys.to_vec(),
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hotkey({})", self.label)
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl FromStr for Hotkey {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let names: Vec<String> = s
            .split('+')
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        if names.is_empty() {
            return Err(FlowError::Configuration(format!("empty hotkey '{s}'")));
        }
        let keys = names
            .iter()
            .map(|name| {
                key_from_name(name).ok_or_else(|| {
                    FlowError::Configuration(format!("unknown key '{name}' in hotkey '{s}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            label: names.join("+"),
            keys,
        })
    }
}

impl TryFrom<String> for Hotkey {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

fn key_from_name(name: &str) -> Option<Key> {
    let key = match name {
        "ctrl" | "control" => Key::ControlLeft,
        "shift" => Key::ShiftLeft,
        "alt" | "option" => Key::Alt,
        "cmd" | "command" | "win" | "super" | "meta" => Key::MetaLeft,
        "tab" => Key::Tab,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "insert" => Key::Insert,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "pgup" => Key::PageUp,
        "pagedown" | "pgdn" => Key::PageDown,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "printscreen" | "prtsc" => Key::PrintScreen,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        "0" => Key::Num0,
        "1" => Key::Num1,
        "2" => Key::Num2,
        "3" => Key::Num3,
        "4" => Key::Num4,
        "5" => Key::Num5,
        "6" => Key::Num6,
        "7" => Key::Num7,
        "8" => Key::Num8,
        "9" => Key::Num9,
        "-" | "minus" => Key::Minus,
        "=" | "equal" => Key::Equal,
        "," | "comma" => Key::Comma,
        "." | "dot" => Key::Dot,
        "/" | "slash" => Key::Slash,
        other => return letter_key(other),
    };
    Some(key)
}

fn letter_key(name: &str) -> Option<Key> {
    let mut chars = name.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return None;
    };
    let key = match c {
        'a' => Key::KeyA,
        'b' => Key::KeyB,
        'c' => Key::KeyC,
        'd' => Key::KeyD,
        'e' => Key::KeyE,
        'f' => Key::KeyF,
        'g' => Key::KeyG,
        'h' => Key::KeyH,
        'i' => Key::KeyI,
        'j' => Key::KeyJ,
        'k' => Key::KeyK,
        'l' => Key::KeyL,
        'm' => Key::KeyM,
        'n' => Key::KeyN,
        'o' => Key::KeyO,
        'p' => Key::KeyP,
        'q' => Key::KeyQ,
        'r' => Key::KeyR,
        's' => Key::KeyS,
        't' => Key::KeyT,
        'u' => Key::KeyU,
        'v' => Key::KeyV,
        'w' => Key::KeyW,
        'x' => Key::KeyX,
        'y' => Key::KeyY,
        'z' => Key::KeyZ,
        _ => return None,
    };
    Some(key)
}

/// Injects input with `rdev::simulate`.
///
/// Some platforms drop events sent back to back, so every event is followed
/// by `event_delay`.
#[derive(Debug, Clone)]
pub struct RdevInput {
    event_delay: Duration,
}

impl Default for RdevInput {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl RdevInput {
    pub fn new(event_delay: Duration) -> Self {
        Self { event_delay }
    }

    fn send(&self, event: &EventType) -> Result<()> {
        simulate(event).map_err(|_| FlowError::Input(format!("could not send {event:?}")))?;
        thread::sleep(self.event_delay);
        Ok(())
    }
}

impl InputDevice for RdevInput {
    fn click(&self, x: i32, y: i32) -> Result<()> {
        debug!("Clicking at ({}, {})", x, y);
        self.send(&EventType::MouseMove {
            x: x as f64,
            y: y as f64,
        })?;
        self.send(&EventType::ButtonPress(Button::Left))?;
        self.send(&EventType::ButtonRelease(Button::Left))
    }

    fn scroll(&self, delta: i64) -> Result<()> {
        self.send(&EventType::Wheel {
            delta_x: 0,
            delta_y: delta,
        })
    }

    fn hotkey(&self, hotkey: &Hotkey) -> Result<()> {
        debug!("Sending hotkey {}", hotkey);
        for key in hotkey.keys() {
            self.send(&EventType::KeyPress(*key))?;
        }
        for key in hotkey.keys().iter().rev() {
            self.send(&EventType::KeyRelease(*key))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chords_case_insensitively() {
        let hotkey: Hotkey = "Ctrl + Shift + Tab".parse().unwrap();
        assert_eq!(hotkey.keys(), &[Key::ControlLeft, Key::ShiftLeft, Key::Tab]);
        assert_eq!(hotkey.label(), "ctrl+shift+tab");

        let hotkey: Hotkey = "ctrl+w".parse().unwrap();
        assert_eq!(hotkey.keys(), &[Key::ControlLeft, Key::KeyW]);
    }

    #[test]
    fn rejects_unknown_and_empty_keys() {
        assert!(matches!(
            "ctrl+banana".parse::<Hotkey>(),
            Err(FlowError::Configuration(_))
        ));
        assert!("  + ".parse::<Hotkey>().is_err());
    }

    #[test]
    fn deserializes_from_yaml_string() {
        let hotkey: Hotkey = serde_yaml::from_str("\"alt+f4\"").unwrap();
        assert_eq!(hotkey.keys(), &[Key::Alt, Key::F4]);
        assert!(serde_yaml::from_str::<Hotkey>("\"hyper+x\"").is_err());
    }
}
