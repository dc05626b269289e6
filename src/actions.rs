use std::{fmt, io::Write, str::FromStr};

use anyhow::{Result, anyhow};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl FromStr for MouseButton {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(MouseButton::Left),
            "right" => Ok(MouseButton::Right),
            "middle" => Ok(MouseButton::Middle),
            other => Err(anyhow!("unknown mouse button: {other}")),
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        })
    }
}

/// One command for the screen-control side. Serialized as a JSON object
/// tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionCommand {
    MoveCursor { x: f32, y: f32 },
    MouseDown { button: MouseButton },
    MouseUp { button: MouseButton },
    Click { button: MouseButton },
    ScrollBy { delta: i32 },
    KeyCombo { keys: Vec<String> },
    JutsuTriggered,
    NoOp,
}

impl ActionCommand {
    /// Parse a chord like "CTRL+EQUAL" into a `KeyCombo`.
    pub fn chord(chord: &str) -> Self {
        ActionCommand::KeyCombo {
            keys: chord
                .split('+')
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        !matches!(self, ActionCommand::MoveCursor { .. } | ActionCommand::NoOp)
    }
}

#[derive(Debug, Error)]
pub enum ActError {
    #[error("failed to act on {command}: {reason}")]
    FailedToAct { command: String, reason: String },
}

impl ActError {
    pub fn failed(cmd: &ActionCommand, reason: impl fmt::Display) -> Self {
        ActError::FailedToAct {
            command: format!("{cmd:?}"),
            reason: reason.to_string(),
        }
    }
}

/// Screen-control collaborator. Each call performs one command.
pub trait ActionSink {
    fn execute(&mut self, cmd: &ActionCommand) -> Result<(), ActError>;
}

impl<S: ActionSink + ?Sized> ActionSink for Box<S> {
    fn execute(&mut self, cmd: &ActionCommand) -> Result<(), ActError> {
        (**self).execute(cmd)
    }
}

/// Writes each command as one JSON line.
pub struct JsonSink<W> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ActionSink for JsonSink<W> {
    fn execute(&mut self, cmd: &ActionCommand) -> Result<(), ActError> {
        let line = serde_json::to_string(cmd).map_err(|e| ActError::failed(cmd, e))?;
        writeln!(self.out, "{line}").map_err(|e| ActError::failed(cmd, e))?;
        self.out.flush().map_err(|e| ActError::failed(cmd, e))
    }
}

/// Keeps every command in memory; used by the dry-run tooling and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub executed: Vec<ActionCommand>,
    /// When set, commands matching this predicate fail instead of recording.
    pub fail_when: Option<fn(&ActionCommand) -> bool>,
}

impl ActionSink for RecordingSink {
    fn execute(&mut self, cmd: &ActionCommand) -> Result<(), ActError> {
        if self.fail_when.is_some_and(|f| f(cmd)) {
            return Err(ActError::failed(cmd, "rejected"));
        }
        self.executed.push(cmd.clone());
        Ok(())
    }
}

/// Virtual pointer and keyboard via `/dev/uinput`.
///
/// Screen positions are absolute while the device is relative, so the sink
/// remembers where it last put the cursor. The first move drives the pointer
/// into the top-left corner to establish a reference.
pub struct UinputSink {
    cursor: Option<(i32, i32)>,
    #[allow(dead_code)]
    linux: Option<Box<LinuxUinput>>,
}

/// Relative travel used to pin the pointer into the top-left corner.
const HOME_TRAVEL: i32 = 16_384;

impl UinputSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                cursor: None,
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; running in NO-OP mode");
            Ok(Self::noop())
        }
    }

    pub fn noop() -> Self {
        Self {
            cursor: None,
            linux: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.linux.is_none()
    }

    /// Forget the cursor reference; the next move re-homes.
    pub fn rehome(&mut self) {
        self.cursor = None;
    }

    #[cfg(target_os = "linux")]
    fn perform(&mut self, cmd: &ActionCommand) -> Result<()> {
        let Some(dev) = self.linux.as_mut() else {
            return Ok(());
        };
        match cmd {
            ActionCommand::MoveCursor { x, y } => {
                let target = (x.round() as i32, y.round() as i32);
                let (cx, cy) = match self.cursor {
                    Some(c) => c,
                    None => {
                        dev.move_relative(-HOME_TRAVEL, -HOME_TRAVEL)?;
                        (0, 0)
                    }
                };
                dev.move_relative(target.0 - cx, target.1 - cy)?;
                self.cursor = Some(target);
            }
            ActionCommand::MouseDown { button } => dev.button(*button, 1)?,
            ActionCommand::MouseUp { button } => dev.button(*button, 0)?,
            ActionCommand::Click { button } => {
                dev.button(*button, 1)?;
                dev.button(*button, 0)?;
            }
            ActionCommand::ScrollBy { delta } => dev.scroll_vertical(*delta)?,
            ActionCommand::KeyCombo { keys } => {
                let mut codes = Vec::with_capacity(keys.len());
                for k in keys {
                    codes.push(map_key(k)?);
                }
                send_chord(&mut **dev, &codes)?;
            }
            ActionCommand::JutsuTriggered | ActionCommand::NoOp => {}
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn perform(&mut self, _cmd: &ActionCommand) -> Result<()> {
        Ok(())
    }
}

impl ActionSink for UinputSink {
    fn execute(&mut self, cmd: &ActionCommand) -> Result<(), ActError> {
        self.perform(cmd).map_err(|e| {
            // position is unknown after a failed move
            self.cursor = None;
            ActError::failed(cmd, e)
        })
    }
}

/// Key-level access to an output device.
trait KeyDevice<K> {
    fn key(&mut self, key: K, val: i32) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Press `keys` in order, then release them in reverse. Keys that went down
/// are released even when a later press fails; the first error is returned.
fn send_chord<K: Copy, D: KeyDevice<K> + ?Sized>(dev: &mut D, keys: &[K]) -> Result<()> {
    let mut pressed = 0;
    let mut result = Ok(());
    for &k in keys {
        if let Err(e) = dev.key(k, 1) {
            result = Err(e);
            break;
        }
        pressed += 1;
    }
    if result.is_ok() {
        result = dev.flush();
    }
    for &k in keys[..pressed].iter().rev() {
        if let Err(e) = dev.key(k, 0) {
            warn!("key release failed: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    let flushed = dev.flush();
    result.and(flushed)
}

#[cfg(target_os = "linux")]
fn map_key(tok: &str) -> Result<uinput::event::keyboard::Key> {
    use uinput::event::keyboard::Key as K;
    let k = match tok.trim().to_ascii_uppercase().as_str() {
        "CTRL" | "CONTROL" => K::LeftControl,
        "ALT" => K::LeftAlt,
        "SHIFT" => K::LeftShift,
        "SUPER" | "META" | "WIN" => K::LeftMeta,
        "TAB" => K::Tab,
        "MINUS" | "-" => K::Minus,
        "EQUAL" | "PLUS" | "=" => K::Equal,
        "SPACE" => K::Space,
        "ENTER" => K::Enter,
        "ESC" | "ESCAPE" => K::Esc,
        other => return Err(anyhow!("unsupported key token: {other}")),
    };
    Ok(k)
}

#[cfg(target_os = "linux")]
struct LinuxUinput {
    dev: uinput::device::Device,
}

#[cfg(target_os = "linux")]
impl LinuxUinput {
    fn create() -> Result<Self> {
        use uinput::event::{controller::Mouse, keyboard, relative};

        let dev = uinput::default()?
            .name("handctl virtual pointer")?
            .event(relative::Position::X)?
            .event(relative::Position::Y)?
            .event(relative::Wheel::Vertical)?
            .event(Mouse::Left)?
            .event(Mouse::Right)?
            .event(Mouse::Middle)?
            // keys reachable from bindings
            .event(keyboard::Key::LeftControl)?
            .event(keyboard::Key::LeftAlt)?
            .event(keyboard::Key::LeftShift)?
            .event(keyboard::Key::LeftMeta)?
            .event(keyboard::Key::Tab)?
            .event(keyboard::Key::Minus)?
            .event(keyboard::Key::Equal)?
            .event(keyboard::Key::Space)?
            .event(keyboard::Key::Enter)?
            .event(keyboard::Key::Esc)?
            .create()?;

        info!("uinput: created virtual device");
        Ok(Self { dev })
    }

    fn sync(&mut self) -> Result<()> {
        self.dev.synchronize()?;
        Ok(())
    }

    fn button(&mut self, button: MouseButton, val: i32) -> Result<()> {
        use uinput::event::controller::Mouse;
        let b = match button {
            MouseButton::Left => Mouse::Left,
            MouseButton::Right => Mouse::Right,
            MouseButton::Middle => Mouse::Middle,
        };
        self.dev.send(b, val)?;
        self.sync()
    }

    fn move_relative(&mut self, dx: i32, dy: i32) -> Result<()> {
        use uinput::event::relative::Position;
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        if dx != 0 {
            self.dev.send(Position::X, dx)?;
        }
        if dy != 0 {
            self.dev.send(Position::Y, dy)?;
        }
        self.sync()
    }

    fn scroll_vertical(&mut self, steps: i32) -> Result<()> {
        use uinput::event::relative::Wheel;
        self.dev.send(Wheel::Vertical, steps)?;
        self.sync()
    }
}

#[cfg(target_os = "linux")]
impl KeyDevice<uinput::event::keyboard::Key> for LinuxUinput {
    fn key(&mut self, key: uinput::event::keyboard::Key, val: i32) -> Result<()> {
        self.dev.send(key, val)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records key events; presses of `fail_on` fail.
    #[derive(Default)]
    struct FakeKeys {
        events: Vec<(&'static str, i32)>,
        fail_on: Option<&'static str>,
    }

    impl KeyDevice<&'static str> for FakeKeys {
        fn key(&mut self, key: &'static str, val: i32) -> Result<()> {
            if val == 1 && self.fail_on == Some(key) {
                return Err(anyhow!("write failed"));
            }
            self.events.push((key, val));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_chord_press_and_release_order() {
        let mut dev = FakeKeys::default();
        send_chord(&mut dev, &["CTRL", "SHIFT", "TAB"]).unwrap();
        assert_eq!(
            dev.events,
            vec![("CTRL", 1), ("SHIFT", 1), ("TAB", 1), ("TAB", 0), ("SHIFT", 0), ("CTRL", 0)]
        );
    }

    #[test]
    fn test_failed_chord_releases_pressed_keys() {
        let mut dev = FakeKeys {
            fail_on: Some("TAB"),
            ..FakeKeys::default()
        };
        assert!(send_chord(&mut dev, &["CTRL", "SHIFT", "TAB"]).is_err());
        assert_eq!(
            dev.events,
            vec![("CTRL", 1), ("SHIFT", 1), ("SHIFT", 0), ("CTRL", 0)]
        );
    }

    #[test]
    fn test_command_wire_format() {
        let v = serde_json::to_value(ActionCommand::Click {
            button: MouseButton::Left,
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"action": "click", "button": "left"}));
        let v = serde_json::to_value(ActionCommand::JutsuTriggered).unwrap();
        assert_eq!(v, serde_json::json!({"action": "jutsu_triggered"}));
    }

    #[test]
    fn test_chord_parsing() {
        assert_eq!(
            ActionCommand::chord("ctrl + equal"),
            ActionCommand::KeyCombo {
                keys: vec!["CTRL".into(), "EQUAL".into()]
            }
        );
    }

    #[test]
    fn test_mouse_button_from_str() {
        assert_eq!("Right".parse::<MouseButton>().unwrap(), MouseButton::Right);
        assert!("thumb".parse::<MouseButton>().is_err());
    }

    #[test]
    fn test_json_sink_writes_lines() {
        let mut sink = JsonSink::new(Vec::new());
        sink.execute(&ActionCommand::ScrollBy { delta: -2 }).unwrap();
        sink.execute(&ActionCommand::NoOp).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"action":"scroll_by","delta":-2}"#);
        assert_eq!(lines[1], r#"{"action":"no_op"}"#);
    }

    #[test]
    fn test_noop_uinput_accepts_everything() {
        let mut sink = UinputSink::noop();
        assert!(sink.is_noop());
        assert!(sink.execute(&ActionCommand::MoveCursor { x: 10.0, y: 5.0 }).is_ok());
        assert!(sink.execute(&ActionCommand::chord("CTRL+NOPE")).is_ok());
    }
}
