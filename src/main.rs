use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use aura::config::{Config, DEFAULT_CONFIG_PATH, InputBackend};
use aura::context::{CommandProbe, ForegroundProbe, classify_title};
use aura::cursor::resolve_screen;
use aura::input;
use aura::supervisor::{self, Options, VoiceSource};

#[derive(Parser)]
#[command(name = "aura", version, about = "Hand-gesture and voice control for mouse and keyboard")]
struct Cli {
    /// Configuration file (defaults apply when it does not exist)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Landmark stream, one JSON frame per line; `-` reads stdin
    #[arg(long, default_value = "-")]
    landmarks: String,

    /// Voice recognizer command line; it must print one JSON command per line
    #[arg(long, conflicts_with = "commands")]
    voice_cmd: Option<String>,

    /// File or named pipe with JSON commands, instead of a recognizer process
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Input backend override: log | enigo
    #[arg(long)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and input backend, print them and exit
    Check,
}

#[hotpath::main]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aura=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(name) = &cli.backend {
        config.input.backend = InputBackend::from_str(name)
            .with_context(|| format!("unknown input backend `{}`", name))?;
    }

    if matches!(cli.command, Some(Command::Check)) {
        return check(&config);
    }

    let voice = match (cli.voice_cmd, cli.commands) {
        (Some(cmd), _) => VoiceSource::Process(cmd.split_whitespace().map(String::from).collect()),
        (None, Some(path)) => VoiceSource::File(path),
        (None, None) => VoiceSource::None,
    };
    let exit_keys = supervisor::exit_keys_available(&cli.landmarks);

    supervisor::run(Options {
        config,
        landmarks: cli.landmarks,
        voice,
        exit_keys,
    })?;
    Ok(())
}

/// Pre-flight diagnostics
fn check(config: &Config) -> Result<()> {
    config.validate()?;
    let sinks = input::open_factory(config.input.backend)?;
    let sink = sinks.open()?;
    let screen = resolve_screen(config, sink.as_ref());

    let title = CommandProbe::platform_default().title();

    println!("Configuration OK");
    println!("  backend:    {:?}", config.input.backend);
    println!("  screen:     {}x{}", screen.0, screen.1);
    println!("  smoothing:  {:?}", config.smoothing.strategy);
    println!(
        "  thresholds: click<{} release>{} sniper<{} px",
        config.gesture.click_threshold,
        config.gesture.release_threshold,
        config.gesture.sniper_threshold
    );
    println!(
        "  rates:      vision {} Hz, cursor {} Hz, context every {} ms",
        config.timing.vision_hz, config.timing.cursor_hz, config.timing.context_poll_ms
    );
    println!("  foreground: {:?} -> {}", title, classify_title(&title));
    Ok(())
}
