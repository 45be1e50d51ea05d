//! Command bus - the contract between the voice producer and the control loops
//!
//! Three independently synchronized fields, no lock spans more than one:
//! - [`ShutdownFlag`]: process-wide active flag, any component may clear it,
//!   every long-running loop polls it once per iteration
//! - command queue: unbounded FIFO, many producers ([`CommandBus`] clones),
//!   exactly one consumer ([`CommandDrain`], not `Clone`)
//! - [`ContextCell`]: bounded string, last write wins

use flume::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Maximum stored context length in bytes
pub const MAX_CONTEXT_LEN: usize = 49;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("command bus is shut down")]
    Closed,
}

/// Fixed command vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    OpenApp,
    CloseApp,
    PlayMedia,
    SearchWeb,
    Type,
    Scroll,
    SystemShutdown,
    Call,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Intent::OpenApp => "OPEN_APP",
            Intent::CloseApp => "CLOSE_APP",
            Intent::PlayMedia => "PLAY_MEDIA",
            Intent::SearchWeb => "SEARCH_WEB",
            Intent::Type => "TYPE",
            Intent::Scroll => "SCROLL",
            Intent::SystemShutdown => "SYSTEM_SHUTDOWN",
            Intent::Call => "CALL",
        };
        f.write_str(name)
    }
}

/// Command argument. Media and search commands carry a target platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Media {
        song: String,
        #[serde(default)]
        platform: Option<String>,
    },
    Search {
        query: String,
        #[serde(default)]
        platform: Option<String>,
    },
    Text(String),
}

impl Payload {
    /// Primary text of the payload, regardless of shape
    pub fn text(&self) -> &str {
        match self {
            Payload::Media { song, .. } => song,
            Payload::Search { query, .. } => query,
            Payload::Text(text) => text,
        }
    }

    pub fn platform(&self) -> Option<&str> {
        match self {
            Payload::Media { platform, .. } | Payload::Search { platform, .. } => {
                platform.as_deref()
            }
            Payload::Text(_) => None,
        }
    }
}

/// An intent with its payload. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub intent: Intent,
    pub payload: Payload,
}

impl Command {
    pub fn new(intent: Intent, payload: impl Into<String>) -> Self {
        Self {
            intent,
            payload: Payload::Text(payload.into()),
        }
    }
}

/// Process-wide shutdown signal
#[derive(Clone, Debug)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse "active application" tag, single mutable cell
#[derive(Clone, Debug)]
pub struct ContextCell(Arc<Mutex<String>>);

impl ContextCell {
    pub fn new(initial: &str) -> Self {
        let cell = Self(Arc::new(Mutex::new(String::new())));
        cell.set(initial);
        cell
    }

    /// Overwrite the tag, truncated to [`MAX_CONTEXT_LEN`] bytes on a char boundary
    pub fn set(&self, context: &str) {
        let mut end = context.len().min(MAX_CONTEXT_LEN);
        while !context.is_char_boundary(end) {
            end -= 1;
        }
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
        guard.push_str(&context[..end]);
    }

    pub fn get(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Producer side of the bus. Cheap to clone, one per producer.
#[derive(Clone, Debug)]
pub struct CommandBus {
    active: ShutdownFlag,
    context: ContextCell,
    tx: Sender<Command>,
}

/// Single consumer of the command queue, owned by the vision loop
#[derive(Debug)]
pub struct CommandDrain {
    rx: Receiver<Command>,
}

impl CommandBus {
    /// Create the bus and its only drain
    pub fn new() -> (Self, CommandDrain) {
        let (tx, rx) = flume::unbounded();
        let bus = Self {
            active: ShutdownFlag::new(),
            context: ContextCell::new("desktop"),
            tx,
        };
        (bus, CommandDrain { rx })
    }

    /// Enqueue a command. Fails only once shutdown has been requested.
    pub fn push(&self, command: Command) -> Result<(), BusError> {
        if !self.active.is_active() {
            return Err(BusError::Closed);
        }
        self.tx.send(command).map_err(|_| BusError::Closed)
    }

    pub fn context(&self) -> String {
        self.context.get()
    }

    pub fn context_cell(&self) -> &ContextCell {
        &self.context
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.active
    }

    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }
}

impl CommandDrain {
    /// Take every command queued right now, in FIFO order. Never blocks.
    pub fn drain(&self) -> Vec<Command> {
        let mut commands = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        commands
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_fifo_order() {
        let (bus, drain) = CommandBus::new();
        let producer = bus.clone();

        bus.push(Command::new(Intent::OpenApp, "firefox")).unwrap();
        producer.push(Command::new(Intent::Type, "hello")).unwrap();
        bus.push(Command::new(Intent::Scroll, "down")).unwrap();

        let drained = drain.drain();
        let intents: Vec<Intent> = drained.iter().map(|c| c.intent).collect();
        assert_eq!(intents, vec![Intent::OpenApp, Intent::Type, Intent::Scroll]);
        assert!(drain.drain().is_empty());
    }

    #[test]
    fn test_empty_drain_is_not_an_error() {
        let (_bus, drain) = CommandBus::new();
        assert!(drain.drain().is_empty());
        assert_eq!(drain.pending(), 0);
    }

    #[test]
    fn test_push_after_shutdown_fails() {
        let (bus, _drain) = CommandBus::new();
        bus.shutdown_flag().request_shutdown();
        assert!(!bus.is_active());
        assert!(matches!(
            bus.push(Command::new(Intent::Type, "x")),
            Err(BusError::Closed)
        ));
    }

    #[test]
    fn test_context_last_write_wins_and_truncates() {
        let (bus, _drain) = CommandBus::new();
        assert_eq!(bus.context(), "desktop");

        bus.context_cell().set("browser");
        bus.context_cell().set("media");
        assert_eq!(bus.context(), "media");

        let long = "x".repeat(80);
        bus.context_cell().set(&long);
        assert_eq!(bus.context().len(), MAX_CONTEXT_LEN);
    }

    #[test]
    fn test_context_truncation_respects_char_boundary() {
        let cell = ContextCell::new("");
        let text = "é".repeat(30); // 60 bytes, 2 per char
        cell.set(&text);
        let stored = cell.get();
        assert!(stored.len() <= MAX_CONTEXT_LEN);
        assert_eq!(stored.chars().count(), 24);
    }

    #[test]
    fn test_command_json_shapes() {
        let open: Command =
            serde_json::from_str(r#"{"intent":"OPEN_APP","payload":"notepad"}"#).unwrap();
        assert_eq!(open, Command::new(Intent::OpenApp, "notepad"));

        let play: Command = serde_json::from_str(
            r#"{"intent":"PLAY_MEDIA","payload":{"song":"lofi","platform":"spotify"}}"#,
        )
        .unwrap();
        assert_eq!(play.payload.text(), "lofi");
        assert_eq!(play.payload.platform(), Some("spotify"));

        let search: Command =
            serde_json::from_str(r#"{"intent":"SEARCH_WEB","payload":{"query":"rust"}}"#).unwrap();
        assert_eq!(search.payload.text(), "rust");
        assert_eq!(search.payload.platform(), None);
    }
}
