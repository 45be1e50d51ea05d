//! Bridge from the external voice-recognition process to the command bus
//!
//! The recognizer writes one JSON [`Command`] per line on stdout (or into a
//! file / named pipe given with `--commands`). A reader thread pushes every
//! parsed command onto the bus in arrival order.
//!
//! A recognizer process also gets a line protocol on its stdin:
//!
//! ```text
//! {"context":"browser"}    current foreground context, sent at start and on change
//! <EOF>                    the control system is stopping; exit now
//! ```
//!
//! Stdin is closed as soon as the shutdown flag clears or the bridge is shut
//! down. A child still running at the deadline is killed.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command as Process, Stdio};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::{Command, CommandBus};

const FEED_INTERVAL: Duration = Duration::from_millis(50);

/// One stdin line announcing the foreground context
pub fn context_line(context: &str) -> String {
    format!("{}\n", serde_json::json!({ "context": context }))
}

/// Child stdin shared between the feeder and `shutdown`; `None` once closed
type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

fn close_stdin(stdin: &SharedStdin) {
    let mut guard = stdin.lock().unwrap_or_else(|e| e.into_inner());
    if guard.take().is_some() {
        debug!("voice process stdin closed");
    }
}

/// Mirror context changes onto the child's stdin until shutdown, then close it
fn feed(stdin: SharedStdin, bus: CommandBus) {
    let mut sent: Option<String> = None;
    while bus.is_active() {
        let context = bus.context();
        if sent.as_deref() != Some(context.as_str()) {
            let mut guard = stdin.lock().unwrap_or_else(|e| e.into_inner());
            let Some(pipe) = guard.as_mut() else {
                return;
            };
            let written = pipe
                .write_all(context_line(&context).as_bytes())
                .and_then(|_| pipe.flush());
            if let Err(e) = written {
                // The recognizer does not read stdin or has exited
                debug!(error = %e, "voice process stdin unavailable");
                guard.take();
                return;
            }
            sent = Some(context);
        }
        thread::sleep(FEED_INTERVAL);
    }
    close_stdin(&stdin);
}

/// Parse one line. Blank lines are skipped.
pub fn parse_line(line: &str) -> Result<Option<Command>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Forward commands until end of input or shutdown. Returns how many were queued.
pub fn pump<R: BufRead>(reader: R, bus: &CommandBus) -> usize {
    let mut queued = 0;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "voice stream read failed");
                break;
            }
        };
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, line = %line, "skipping malformed voice command");
                continue;
            }
        };
        debug!(intent = %command.intent, "voice command received");
        if bus.push(command).is_err() {
            break;
        }
        queued += 1;
    }
    queued
}

fn spawn_reader<R: BufRead + Send + 'static>(
    reader: R,
    bus: CommandBus,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("aura-voice".to_string())
        .spawn(move || {
            let queued = pump(reader, &bus);
            info!(commands = queued, "voice stream ended");
        })
}

/// Owns the recognizer child (if any) and its reader thread
pub struct VoiceBridge {
    child: Option<Child>,
    stdin: Option<SharedStdin>,
    feeder: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl VoiceBridge {
    /// Launch `argv` and read commands from its stdout
    pub fn spawn_process(argv: &[String], bus: CommandBus) -> io::Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty voice command"));
        };
        let mut child = Process::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("voice process has no stdout"))?;
        let stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));

        let threads = spawn_reader(BufReader::new(stdout), bus.clone()).and_then(|reader| {
            let feeder = {
                let stdin = stdin.clone();
                thread::Builder::new()
                    .name("aura-voice-feed".to_string())
                    .spawn(move || feed(stdin, bus))
            };
            Ok((reader, feeder?))
        });
        let (reader, feeder) = match threads {
            Ok(threads) => threads,
            Err(e) => {
                close_stdin(&stdin);
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        info!(program = %program, pid = child.id(), "voice process started");

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            feeder: Some(feeder),
            reader: Some(reader),
        })
    }

    /// Read commands from a file or named pipe
    pub fn open_file(path: &Path, bus: CommandBus) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = spawn_reader(BufReader::new(file), bus)?;
        Ok(Self {
            child: None,
            stdin: None,
            feeder: None,
            reader: Some(reader),
        })
    }

    /// Close the child's stdin and give it until `deadline` to exit on its
    /// own, then kill it. Helper threads are joined only if already finished.
    pub fn shutdown(&mut self, deadline: Instant) {
        if let Some(stdin) = self.stdin.take() {
            match stdin.try_lock() {
                Ok(mut guard) => drop(guard.take()),
                Err(TryLockError::Poisoned(e)) => drop(e.into_inner().take()),
                // Feeder blocked on a full pipe; killing the child unblocks it
                Err(TryLockError::WouldBlock) => {}
            }
        }

        if let Some(mut child) = self.child.take() {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(%status, "voice process exited");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => {
                        thread::sleep(Duration::from_millis(20))
                    }
                    Ok(None) | Err(_) => {
                        warn!("voice process still running after grace period, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }

        if let Some(reader) = self.reader.take() {
            // Killing the child closes its stdout, so the reader finishes shortly
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                warn!("voice reader still blocked, detaching");
            }
        }

        if let Some(feeder) = self.feeder.take() {
            // Sleeps at most one feed interval once stdin is closed
            while !feeder.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if feeder.is_finished() {
                let _ = feeder.join();
            }
        }
    }
}
