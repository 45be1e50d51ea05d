//! Foreground application tag, polled at low frequency

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::bus::{ContextCell, ShutdownFlag};

/// Longest a probe command may run before it is killed
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const PROBE_POLL: Duration = Duration::from_millis(10);

/// Reports the title of the focused window
pub trait ForegroundProbe: Send {
    /// Empty when nothing can be determined
    fn title(&mut self) -> String;
}

/// Runs a platform command and reads its stdout as the title
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: PROBE_TIMEOUT,
        }
    }

    #[cfg(target_os = "macos")]
    pub fn platform_default() -> Self {
        Self::new(
            "osascript",
            &[
                "-e",
                "tell application \"System Events\" to get name of first application process whose frontmost is true",
            ],
        )
    }

    #[cfg(not(target_os = "macos"))]
    pub fn platform_default() -> Self {
        Self::new("xdotool", &["getactivewindow", "getwindowname"])
    }

    fn run(&self) -> Option<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| debug!(program = %self.program, error = %e, "probe unavailable"))
            .ok()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => break,
                Ok(Some(_)) | Err(_) => return None,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(program = %self.program, "probe timed out");
                    return None;
                }
                Ok(None) => thread::sleep(PROBE_POLL),
            }
        }

        let mut title = String::new();
        child.stdout.take()?.read_to_string(&mut title).ok()?;
        Some(title.trim().to_string())
    }
}

impl ForegroundProbe for CommandProbe {
    fn title(&mut self) -> String {
        self.run().unwrap_or_default()
    }
}

/// Coarse tag for a window title. Site names win over the browser hosting them.
pub fn classify_title(title: &str) -> &'static str {
    let title = title.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| title.contains(n));

    if has(&["discord", "slack", "telegram", "whatsapp"]) {
        "chat"
    } else if has(&["youtube"]) {
        "media"
    } else if has(&["chrome", "firefox", "edge", "brave"]) {
        "browser"
    } else if has(&["spotify", "vlc", "player"]) {
        "media"
    } else if has(&["code", "pycharm", "terminal"]) {
        "coding"
    } else {
        "desktop"
    }
}

pub struct ContextMonitor<P: ForegroundProbe> {
    probe: P,
    cell: ContextCell,
    interval: Duration,
    running: ShutdownFlag,
    current: &'static str,
}

impl<P: ForegroundProbe> ContextMonitor<P> {
    pub fn new(probe: P, cell: ContextCell, interval: Duration, running: ShutdownFlag) -> Self {
        Self {
            probe,
            cell,
            interval,
            running,
            current: "desktop",
        }
    }

    /// Probe once and publish the tag. Returns the tag.
    pub fn poll_once(&mut self) -> &'static str {
        let tag = classify_title(&self.probe.title());
        if tag != self.current {
            info!(from = self.current, to = tag, "context changed");
            self.current = tag;
        }
        self.cell.set(tag);
        tag
    }

    pub fn run(mut self) {
        // Short sleep slices keep shutdown latency well under the poll interval
        let slice = Duration::from_millis(50).min(self.interval);
        while self.running.is_active() {
            self.poll_once();
            let next = Instant::now() + self.interval;
            while self.running.is_active() && Instant::now() < next {
                thread::sleep(slice);
            }
        }
        debug!("context monitor stopped");
    }
}
