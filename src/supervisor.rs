//! Startup preflight, thread orchestration and bounded-grace shutdown
//!
//! Every resource is acquired before the first loop thread starts, so a
//! missing backend or landmark source is reported without ever running a
//! half-initialized control loop. Shutdown is cooperative through the one
//! shared flag; anything still running when the grace period ends is
//! reported and detached.

use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::io::{self, BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bus::{CommandBus, ShutdownFlag};
use crate::config::{Config, ConfigError};
use crate::context::{CommandProbe, ContextMonitor};
use crate::cursor::{CursorLoop, resolve_screen};
use crate::dispatch::{Dispatcher, SystemExecutor};
use crate::frames::{self, FrameError};
use crate::hand::SharedHandState;
use crate::input::{self, InputError, SinkFactory};
use crate::stats::{LoopGauges, LoopStats};
use crate::vision::VisionLoop;
use crate::voice::VoiceBridge;

const WATCH_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Frames(#[from] FrameError),
    #[error("failed to start voice source {source_name}: {source}")]
    Voice {
        source_name: String,
        source: io::Error,
    },
    #[error("failed to start worker runtime: {0}")]
    Runtime(io::Error),
    #[error("failed to spawn {name} thread: {source}")]
    Thread { name: &'static str, source: io::Error },
}

/// Where the voice commands come from
#[derive(Debug, Clone)]
pub enum VoiceSource {
    None,
    Process(Vec<String>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Options {
    pub config: Config,
    /// Landmark stream path, `-` for stdin
    pub landmarks: String,
    pub voice: VoiceSource,
    /// Listen for Esc / q on the terminal
    pub exit_keys: bool,
}

/// Clears the shutdown flag when dropped, including on panic unwind
struct ShutdownOnExit(ShutdownFlag);

impl Drop for ShutdownOnExit {
    fn drop(&mut self) {
        self.0.request_shutdown();
    }
}

/// Acquired resources, nothing running yet
struct Preflight {
    sinks: Arc<dyn SinkFactory>,
    screen: (u32, u32),
    landmarks: Box<dyn BufRead + Send>,
    runtime: tokio::runtime::Runtime,
}

fn preflight(options: &Options) -> Result<Preflight, StartupError> {
    options.config.validate()?;

    let sinks = input::open_factory(options.config.input.backend)?;
    let probe_sink = sinks.open()?;
    let screen = resolve_screen(&options.config, probe_sink.as_ref());
    drop(probe_sink);

    let landmarks = frames::open_source(&options.landmarks)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("aura-worker")
        .enable_all()
        .build()
        .map_err(StartupError::Runtime)?;

    Ok(Preflight {
        sinks,
        screen,
        landmarks,
        runtime,
    })
}

fn spawn<T: Send + 'static>(
    name: &'static str,
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<JoinHandle<T>, StartupError> {
    thread::Builder::new()
        .name(format!("aura-{}", name))
        .spawn(f)
        .map_err(|source| StartupError::Thread { name, source })
}

/// Whether the terminal exit-key listener can run alongside the landmark source
pub fn exit_keys_available(landmarks: &str) -> bool {
    landmarks != "-" && io::stdin().is_terminal()
}

fn listen_for_exit_keys(running: ShutdownFlag) {
    while running.is_active() {
        if !event::poll(Duration::from_millis(100)).unwrap_or(false) {
            continue;
        }
        if let Ok(Event::Key(key)) = event::read() {
            if key.kind == KeyEventKind::Press
                && matches!(key.code, KeyCode::Esc | KeyCode::Char('q'))
            {
                info!("exit key pressed");
                running.request_shutdown();
            }
        }
    }
}

/// Wait for `handle` until `deadline`; `None` when it had to be detached
fn join_until<T>(name: &str, handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if !handle.is_finished() {
        warn!(thread = name, "still running after grace period, detaching");
        return None;
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(thread = name, "thread panicked");
            None
        }
    }
}

/// Run the whole control system until shutdown
pub fn run(options: Options) -> Result<(), StartupError> {
    let Preflight {
        sinks,
        screen,
        landmarks,
        runtime,
    } = preflight(&options)?;
    let config = Arc::new(options.config);

    let (bus, drain) = CommandBus::new();
    let running = bus.shutdown_flag().clone();

    let mut voice = match &options.voice {
        VoiceSource::None => None,
        VoiceSource::Process(argv) => Some(
            VoiceBridge::spawn_process(argv, bus.clone()).map_err(|source| {
                StartupError::Voice {
                    source_name: argv.join(" "),
                    source,
                }
            })?,
        ),
        VoiceSource::File(path) => Some(VoiceBridge::open_file(path, bus.clone()).map_err(
            |source| StartupError::Voice {
                source_name: path.display().to_string(),
                source,
            },
        )?),
    };

    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("interrupt received");
            running.request_shutdown();
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler");
        }
    }

    let started = spawn_loops(
        &config,
        screen,
        &sinks,
        landmarks,
        &runtime,
        &bus,
        drain,
        options.exit_keys,
    );
    let loops = match started {
        Ok(loops) => loops,
        Err(e) => {
            running.request_shutdown();
            if let Some(voice) = voice.as_mut() {
                voice.shutdown(Instant::now() + config.timing.shutdown_grace());
            }
            return Err(e);
        }
    };

    info!(
        backend = ?config.input.backend,
        screen = ?screen,
        smoothing = ?config.smoothing.strategy,
        "control system running"
    );

    // Watchdog: a dead vision loop takes the system down
    let mut last_report = Instant::now();
    while running.is_active() {
        if loops.vision.is_finished() {
            warn!("vision loop exited, shutting down");
            running.request_shutdown();
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            debug!(
                vision_fps = loops.gauges.vision_fps.load(Ordering::Relaxed),
                cursor_fps = loops.gauges.cursor_fps.load(Ordering::Relaxed),
                "loop rates"
            );
            last_report = Instant::now();
        }
        thread::sleep(WATCH_INTERVAL);
    }

    info!("shutting down");
    let deadline = Instant::now() + config.timing.shutdown_grace();
    if let Some(voice) = voice.as_mut() {
        voice.shutdown(deadline);
    }

    let mut summaries: Vec<LoopStats> = Vec::new();
    summaries.extend(join_until("vision", loops.vision, deadline));
    summaries.extend(join_until("cursor", loops.cursor, deadline));
    join_until("context", loops.context, deadline);
    // Blocked on a read of the landmark stream until its writer closes
    join_until("capture", loops.capture, deadline);
    if let Some(keys) = loops.keys {
        join_until("keys", keys, deadline);
    }
    runtime.shutdown_timeout(deadline.saturating_duration_since(Instant::now()));

    for stats in &summaries {
        info!("{}", stats.summary());
    }
    Ok(())
}

struct Loops {
    capture: JoinHandle<()>,
    vision: JoinHandle<LoopStats>,
    cursor: JoinHandle<LoopStats>,
    context: JoinHandle<()>,
    keys: Option<JoinHandle<()>>,
    gauges: Arc<LoopGauges>,
}

#[allow(clippy::too_many_arguments)]
fn spawn_loops(
    config: &Arc<Config>,
    screen: (u32, u32),
    sinks: &Arc<dyn SinkFactory>,
    landmarks: Box<dyn BufRead + Send>,
    runtime: &tokio::runtime::Runtime,
    bus: &CommandBus,
    drain: crate::bus::CommandDrain,
    exit_keys: bool,
) -> Result<Loops, StartupError> {
    let running = bus.shutdown_flag().clone();
    let gauges = LoopGauges::new();
    let state = SharedHandState::new(config.timing.staleness_timeout(), Instant::now());

    let (frames_rx, capture) =
        frames::spawn_capture(landmarks, config.screen.mirror_x, running.clone())?;

    let executor = Arc::new(SystemExecutor::new(
        config.actions.clone(),
        Arc::clone(sinks),
        running.clone(),
    ));
    let dispatcher = Dispatcher::new(runtime.handle().clone(), executor, bus.context_cell().clone());

    let vision = {
        let config = Arc::clone(config);
        let sinks = Arc::clone(sinks);
        let state = state.clone();
        let running = running.clone();
        let gauges = Arc::clone(&gauges);
        spawn("vision", move || {
            let _guard = ShutdownOnExit(running.clone());
            let sink = match sinks.open() {
                Ok(sink) => sink,
                Err(e) => {
                    error!(error = %e, "vision loop could not open input");
                    return LoopStats::new("vision");
                }
            };
            VisionLoop::new(&config, state, drain, dispatcher, sink, running)
                .with_gauges(gauges)
                .run(frames_rx)
        })?
    };

    let cursor = {
        let mut config = (**config).clone();
        config.screen.width = Some(screen.0);
        config.screen.height = Some(screen.1);
        let sinks = Arc::clone(sinks);
        let running = running.clone();
        let gauges = Arc::clone(&gauges);
        spawn("cursor", move || {
            let sink = match sinks.open() {
                Ok(sink) => sink,
                Err(e) => {
                    error!(error = %e, "cursor loop could not open input");
                    running.request_shutdown();
                    return LoopStats::new("cursor");
                }
            };
            CursorLoop::new(&config, state, sink, running)
                .with_gauges(gauges)
                .run()
        })?
    };

    let context = {
        let monitor = ContextMonitor::new(
            CommandProbe::platform_default(),
            bus.context_cell().clone(),
            config.timing.context_poll(),
            running.clone(),
        );
        spawn("context", move || monitor.run())?
    };

    let keys = if exit_keys {
        let running = running.clone();
        Some(spawn("keys", move || listen_for_exit_keys(running))?)
    } else {
        None
    };

    Ok(Loops {
        capture,
        vision,
        cursor,
        context,
        keys,
        gauges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputBackend;

    fn options(landmarks: &str) -> Options {
        Options {
            config: Config::default(),
            landmarks: landmarks.to_string(),
            voice: VoiceSource::None,
            exit_keys: false,
        }
    }

    #[test]
    fn test_shutdown_guard_fires_on_panic() {
        let flag = ShutdownFlag::new();
        let guard_flag = flag.clone();
        let handle = thread::spawn(move || {
            let _guard = ShutdownOnExit(guard_flag);
            panic!("loop died");
        });
        assert!(handle.join().is_err());
        assert!(!flag.is_active());
    }

    #[test]
    fn test_missing_landmark_source_fails_before_start() {
        let result = preflight(&options("/no/such/landmarks.jsonl"));
        assert!(matches!(result, Err(StartupError::Frames(FrameError::Open { .. }))));
    }

    #[test]
    fn test_invalid_config_fails_preflight() {
        let mut opts = options("-");
        opts.config.gesture.release_threshold = 10.0;
        assert!(matches!(preflight(&opts), Err(StartupError::Config(_))));
    }

    #[cfg(not(feature = "enigo"))]
    #[test]
    fn test_unavailable_backend_fails_preflight() {
        let mut opts = options("-");
        opts.config.input.backend = InputBackend::Enigo;
        assert!(matches!(preflight(&opts), Err(StartupError::Input(_))));
    }

    #[test]
    fn test_join_until_detaches_stragglers() {
        let running = ShutdownFlag::new();
        let flag = running.clone();
        let handle = thread::spawn(move || {
            while flag.is_active() {
                thread::sleep(Duration::from_millis(5));
            }
            7
        });

        let deadline = Instant::now() + Duration::from_millis(30);
        let straggler = thread::spawn(move || join_until("busy", handle, deadline));
        assert_eq!(straggler.join().unwrap(), None);
        running.request_shutdown();

        let quick = thread::spawn(|| 3);
        assert_eq!(join_until("quick", quick, Instant::now() + Duration::from_secs(1)), Some(3));
    }

    #[test]
    fn test_stdin_source_disables_exit_keys() {
        assert!(!exit_keys_available("-"));
    }
}
