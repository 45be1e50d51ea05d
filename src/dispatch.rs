//! Command execution off the hot loop
//!
//! The vision loop hands every drained [`Command`] to the [`Dispatcher`],
//! which runs it on tokio's blocking pool and observes the result on the
//! async side. A failing or panicking command is logged and forgotten; it
//! never reaches the loop that queued it and never delays the next one.

use std::io;
use std::process::{Command as Process, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Command, ContextCell, Intent, ShutdownFlag};
use crate::config::ActionsConfig;
use crate::input::{InputError, SinkFactory};

/// Lines scrolled by a spoken scroll command
pub const VOICE_SCROLL_LINES: i32 = 8;

/// Time given to the chat client to come up before typing the callee
const CALL_SETTLE: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("failed to launch {program}: {source}")]
    Launch { program: String, source: io::Error },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
    #[error("no command configured for {0}")]
    NoTemplate(&'static str),
    #[error("empty payload for {0}")]
    EmptyPayload(Intent),
}

/// Performs one command. Runs on a worker thread, may block.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &Command, context: &str) -> Result<(), ActionError>;
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Hands commands to short-lived workers
#[derive(Clone)]
pub struct Dispatcher {
    runtime: Handle,
    executor: Arc<dyn CommandExecutor>,
    context: ContextCell,
}

impl Dispatcher {
    pub fn new(runtime: Handle, executor: Arc<dyn CommandExecutor>, context: ContextCell) -> Self {
        Self {
            runtime,
            executor,
            context,
        }
    }

    /// Start `command` in the background. Never blocks the caller.
    pub fn dispatch(&self, command: Command) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let context = self.context.get();
        info!(intent = %command.intent, payload = command.payload.text(), %context, "dispatching");

        self.runtime.spawn(async move {
            let intent = command.intent;
            let result =
                tokio::task::spawn_blocking(move || executor.execute(&command, &context)).await;
            match result {
                Ok(Ok(())) => debug!(%intent, "command finished"),
                Ok(Err(e)) => warn!(%intent, error = %e, "command failed"),
                Err(e) => error!(%intent, error = %e, "command worker panicked"),
            }
        })
    }
}

// ============================================================================
// System executor
// ============================================================================

/// Executes the fixed vocabulary against the OS
pub struct SystemExecutor {
    actions: ActionsConfig,
    sinks: Arc<dyn SinkFactory>,
    shutdown: ShutdownFlag,
}

impl SystemExecutor {
    pub fn new(actions: ActionsConfig, sinks: Arc<dyn SinkFactory>, shutdown: ShutdownFlag) -> Self {
        Self {
            actions,
            sinks,
            shutdown,
        }
    }

    fn open_url(&self, url: &str) -> Result<(), ActionError> {
        run_template(&self.actions.open_url, url, "open_url")
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, command: &Command, context: &str) -> Result<(), ActionError> {
        let text = command.payload.text().trim();
        let platform = command.payload.platform();
        debug!(intent = %command.intent, context, "executing");

        match command.intent {
            Intent::OpenApp => {
                require(text, command.intent)?;
                if looks_like_url(text) {
                    self.open_url(&with_scheme(text))
                } else {
                    run_template(&self.actions.open_app, text, "open_app")
                }
            }
            Intent::CloseApp => {
                require(text, command.intent)?;
                run_template(&self.actions.close_app, text, "close_app")
            }
            Intent::PlayMedia => {
                require(text, command.intent)?;
                self.open_url(&media_url(text, platform))
            }
            Intent::SearchWeb => {
                require(text, command.intent)?;
                self.open_url(&search_url(text, platform))
            }
            Intent::Type => {
                let mut sink = self.sinks.open()?;
                sink.type_text(&format!("{} ", text))?;
                Ok(())
            }
            Intent::Scroll => {
                let lines = if text.eq_ignore_ascii_case("down") {
                    -VOICE_SCROLL_LINES
                } else {
                    VOICE_SCROLL_LINES
                };
                self.sinks.open()?.scroll(lines)?;
                Ok(())
            }
            Intent::SystemShutdown => {
                if !self.actions.shutdown.is_empty() {
                    run_template(&self.actions.shutdown, text, "shutdown")?;
                }
                info!("shutdown requested by voice command");
                self.shutdown.request_shutdown();
                Ok(())
            }
            Intent::Call => {
                self.open_url("discord://")?;
                if !text.is_empty() {
                    thread::sleep(CALL_SETTLE);
                    self.sinks.open()?.type_text(text)?;
                }
                Ok(())
            }
        }
    }
}

fn require(text: &str, intent: Intent) -> Result<(), ActionError> {
    if text.is_empty() {
        Err(ActionError::EmptyPayload(intent))
    } else {
        Ok(())
    }
}

/// Substitute `{}` in every template part and run it to completion
pub fn run_template(template: &[String], arg: &str, name: &'static str) -> Result<(), ActionError> {
    let Some((program, args)) = template.split_first() else {
        return Err(ActionError::NoTemplate(name));
    };
    let program = program.replace("{}", arg);
    let args: Vec<String> = args.iter().map(|a| a.replace("{}", arg)).collect();
    debug!(%program, ?args, "running");

    let status = Process::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| ActionError::Launch {
            program: program.clone(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ActionError::Failed { program, status })
    }
}

pub fn looks_like_url(text: &str) -> bool {
    text.contains("://")
        || text.starts_with("www.")
        || (!text.contains(char::is_whitespace)
            && [".com", ".org", ".net", ".io", ".dev"]
                .iter()
                .any(|tld| text.ends_with(tld) || text.contains(&format!("{}/", tld))))
}

fn with_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Query-string encoding: spaces become `+`, everything else outside the
/// unreserved set is percent-encoded
pub fn encode_query(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

pub fn media_url(song: &str, platform: Option<&str>) -> String {
    let platform = platform.unwrap_or("youtube").to_lowercase();
    if platform.contains("spotify") {
        format!("spotify:search:{}", encode_query(song))
    } else if platform.contains("apple") {
        format!("https://music.apple.com/us/search?term={}", encode_query(song))
    } else {
        format!("https://music.youtube.com/search?q={}", encode_query(song))
    }
}

pub fn search_url(query: &str, platform: Option<&str>) -> String {
    let platform = platform.unwrap_or("google").to_lowercase();
    if platform == "google" {
        format!("https://www.google.com/search?q={}", encode_query(query))
    } else if platform.contains("youtube") {
        format!(
            "https://www.youtube.com/results?search_query={}",
            encode_query(query)
        )
    } else {
        let domain: String = platform.split_whitespace().collect();
        let domain = if domain.contains('.') {
            domain
        } else {
            format!("{}.com", domain)
        };
        format!(
            "https://www.google.com/search?q=site:{}+{}",
            domain,
            encode_query(query)
        )
    }
}
