//! OS input injection
//!
//! Every mouse and keyboard action goes through an [`InputSink`]. Sinks are
//! opened per thread from a shared [`SinkFactory`] so the cursor loop, the
//! vision loop and command workers never contend for one device handle.
//! - **log**: records actions through `tracing` (default, no OS access)
//! - **enigo**: real injection, behind the `enigo` cargo feature
//! - **recording**: in-memory event log, used by tests and dry runs

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::config::InputBackend;

/// Hold time between down and up of a synthetic click
pub const CLICK_PULSE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum InputError {
    #[error("input backend unavailable: {0}")]
    Unavailable(String),
    #[error("input action failed: {0}")]
    Action(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

/// Keys the control system can press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyToken {
    VolumeUp,
    VolumeDown,
    PlayPause,
    Enter,
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyToken::VolumeUp => "volume-up",
            KeyToken::VolumeDown => "volume-down",
            KeyToken::PlayPause => "play-pause",
            KeyToken::Enter => "enter",
        };
        f.write_str(name)
    }
}

/// Best-effort output primitives. Positive scroll moves content up.
pub trait InputSink {
    fn move_to(&mut self, x: i32, y: i32) -> Result<(), InputError>;
    fn button_down(&mut self, button: MouseButton) -> Result<(), InputError>;
    fn button_up(&mut self, button: MouseButton) -> Result<(), InputError>;
    fn key_press(&mut self, key: KeyToken) -> Result<(), InputError>;
    fn scroll(&mut self, lines: i32) -> Result<(), InputError>;
    fn type_text(&mut self, text: &str) -> Result<(), InputError>;

    /// Full click pulse. The button is released even if holding fails.
    fn click(&mut self, button: MouseButton) -> Result<(), InputError> {
        let down = self.button_down(button);
        thread::sleep(CLICK_PULSE);
        let up = self.button_up(button);
        down.and(up)
    }

    /// Primary display size in pixels, if the backend knows it
    fn display_size(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Opens a fresh sink for the calling thread
pub trait SinkFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn InputSink>, InputError>;
}

/// Factory for the configured backend
pub fn open_factory(backend: InputBackend) -> Result<Arc<dyn SinkFactory>, InputError> {
    match backend {
        InputBackend::Log => Ok(Arc::new(LogFactory)),
        #[cfg(feature = "enigo")]
        InputBackend::Enigo => Ok(Arc::new(enigo_backend::EnigoFactory)),
        #[cfg(not(feature = "enigo"))]
        InputBackend::Enigo => Err(InputError::Unavailable(
            "built without the `enigo` feature".to_string(),
        )),
    }
}

// ============================================================================
// Log backend
// ============================================================================

pub struct LogFactory;

impl SinkFactory for LogFactory {
    fn open(&self) -> Result<Box<dyn InputSink>, InputError> {
        Ok(Box::new(LogSink))
    }
}

/// Logs every action instead of performing it
pub struct LogSink;

impl InputSink for LogSink {
    fn move_to(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        trace!(x, y, "move");
        Ok(())
    }

    fn button_down(&mut self, button: MouseButton) -> Result<(), InputError> {
        debug!(?button, "button down");
        Ok(())
    }

    fn button_up(&mut self, button: MouseButton) -> Result<(), InputError> {
        debug!(?button, "button up");
        Ok(())
    }

    fn key_press(&mut self, key: KeyToken) -> Result<(), InputError> {
        info!(%key, "key press");
        Ok(())
    }

    fn scroll(&mut self, lines: i32) -> Result<(), InputError> {
        debug!(lines, "scroll");
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<(), InputError> {
        info!(text, "type");
        Ok(())
    }
}

// ============================================================================
// Recording backend
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Move(i32, i32),
    Down(MouseButton),
    Up(MouseButton),
    Key(KeyToken),
    Scroll(i32),
    Text(String),
}

/// Shared in-memory event log. Every clone (and every sink it opens)
/// appends to the same list.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<InputEvent>>>,
    display: Option<(u32, u32)>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display(width: u32, height: u32) -> Self {
        Self {
            display: Some((width, height)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.lock().clone()
    }

    pub fn take(&self) -> Vec<InputEvent> {
        std::mem::take(&mut *self.lock())
    }

    pub fn count(&self, event: &InputEvent) -> usize {
        self.lock().iter().filter(|e| *e == event).count()
    }

    fn push(&self, event: InputEvent) -> Result<(), InputError> {
        self.lock().push(event);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<InputEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl InputSink for Recorder {
    fn move_to(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        self.push(InputEvent::Move(x, y))
    }

    fn button_down(&mut self, button: MouseButton) -> Result<(), InputError> {
        self.push(InputEvent::Down(button))
    }

    fn button_up(&mut self, button: MouseButton) -> Result<(), InputError> {
        self.push(InputEvent::Up(button))
    }

    fn key_press(&mut self, key: KeyToken) -> Result<(), InputError> {
        self.push(InputEvent::Key(key))
    }

    fn scroll(&mut self, lines: i32) -> Result<(), InputError> {
        self.push(InputEvent::Scroll(lines))
    }

    fn type_text(&mut self, text: &str) -> Result<(), InputError> {
        self.push(InputEvent::Text(text.to_string()))
    }

    fn click(&mut self, button: MouseButton) -> Result<(), InputError> {
        self.push(InputEvent::Down(button))?;
        self.push(InputEvent::Up(button))
    }

    fn display_size(&self) -> Option<(u32, u32)> {
        self.display
    }
}

impl SinkFactory for Recorder {
    fn open(&self) -> Result<Box<dyn InputSink>, InputError> {
        Ok(Box::new(self.clone()))
    }
}

// ============================================================================
// Enigo backend
// ============================================================================

#[cfg(feature = "enigo")]
mod enigo_backend {
    use super::{InputError, InputSink, KeyToken, MouseButton, SinkFactory};
    use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

    pub struct EnigoFactory;

    impl SinkFactory for EnigoFactory {
        fn open(&self) -> Result<Box<dyn InputSink>, InputError> {
            let enigo = Enigo::new(&Settings::default()).map_err(|e| {
                InputError::Unavailable(format!("failed to initialize enigo: {}", e))
            })?;
            Ok(Box::new(EnigoSink { enigo }))
        }
    }

    pub struct EnigoSink {
        enigo: Enigo,
    }

    fn button(button: MouseButton) -> Button {
        match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
        }
    }

    fn failed(what: &str, e: impl std::fmt::Display) -> InputError {
        InputError::Action(format!("{}: {}", what, e))
    }

    impl InputSink for EnigoSink {
        fn move_to(&mut self, x: i32, y: i32) -> Result<(), InputError> {
            self.enigo
                .move_mouse(x, y, Coordinate::Abs)
                .map_err(|e| failed("move", e))
        }

        fn button_down(&mut self, b: MouseButton) -> Result<(), InputError> {
            self.enigo
                .button(button(b), Direction::Press)
                .map_err(|e| failed("button down", e))
        }

        fn button_up(&mut self, b: MouseButton) -> Result<(), InputError> {
            self.enigo
                .button(button(b), Direction::Release)
                .map_err(|e| failed("button up", e))
        }

        fn key_press(&mut self, key: KeyToken) -> Result<(), InputError> {
            let key = match key {
                KeyToken::VolumeUp => Key::VolumeUp,
                KeyToken::VolumeDown => Key::VolumeDown,
                KeyToken::PlayPause => Key::MediaPlayPause,
                KeyToken::Enter => Key::Return,
            };
            self.enigo
                .key(key, Direction::Click)
                .map_err(|e| failed("key", e))
        }

        fn scroll(&mut self, lines: i32) -> Result<(), InputError> {
            // enigo scrolls down for positive lengths
            self.enigo
                .scroll(-lines, Axis::Vertical)
                .map_err(|e| failed("scroll", e))
        }

        fn type_text(&mut self, text: &str) -> Result<(), InputError> {
            if text.is_empty() {
                return Ok(());
            }
            self.enigo.text(text).map_err(|e| failed("type", e))
        }

        fn display_size(&self) -> Option<(u32, u32)> {
            let (w, h) = self.enigo.main_display().ok()?;
            Some((u32::try_from(w).ok()?, u32::try_from(h).ok()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_clones_share_events() {
        let recorder = Recorder::new();
        let mut sink = recorder.open().unwrap();
        sink.move_to(10, 20).unwrap();
        sink.click(MouseButton::Right).unwrap();

        assert_eq!(
            recorder.events(),
            vec![
                InputEvent::Move(10, 20),
                InputEvent::Down(MouseButton::Right),
                InputEvent::Up(MouseButton::Right),
            ]
        );
        assert_eq!(recorder.take().len(), 3);
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_default_click_always_releases() {
        struct FailingDown(Vec<&'static str>);
        impl InputSink for FailingDown {
            fn move_to(&mut self, _: i32, _: i32) -> Result<(), InputError> {
                Ok(())
            }
            fn button_down(&mut self, _: MouseButton) -> Result<(), InputError> {
                Err(InputError::Action("down".into()))
            }
            fn button_up(&mut self, _: MouseButton) -> Result<(), InputError> {
                self.0.push("up");
                Ok(())
            }
            fn key_press(&mut self, _: KeyToken) -> Result<(), InputError> {
                Ok(())
            }
            fn scroll(&mut self, _: i32) -> Result<(), InputError> {
                Ok(())
            }
            fn type_text(&mut self, _: &str) -> Result<(), InputError> {
                Ok(())
            }
        }

        let mut sink = FailingDown(Vec::new());
        assert!(sink.click(MouseButton::Left).is_err());
        assert_eq!(sink.0, vec!["up"]);
    }

    #[test]
    fn test_log_factory_opens() {
        let factory = open_factory(InputBackend::Log).unwrap();
        let mut sink = factory.open().unwrap();
        assert!(sink.scroll(3).is_ok());
        assert!(sink.display_size().is_none());
    }

    #[cfg(not(feature = "enigo"))]
    #[test]
    fn test_enigo_requires_feature() {
        assert!(matches!(
            open_factory(InputBackend::Enigo),
            Err(InputError::Unavailable(_))
        ));
    }
}
