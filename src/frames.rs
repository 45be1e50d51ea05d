//! Landmark frame capture
//!
//! The detector runs out of process and writes one JSON object per line:
//! `{"width":640,"height":480,"landmarks":[[x,y], ...]}` with normalized
//! coordinates, `null` or `[]` landmarks meaning "no hand". A capture thread
//! parses lines and hands them over through a single-slot channel: when the
//! consumer falls behind, the pending frame is replaced, never queued.

use flume::{Receiver, Sender, TrySendError};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::ShutdownFlag;
use crate::gesture::LandmarkFrame;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("failed to open landmark source {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("malformed landmark frame: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to start capture thread: {0}")]
    Spawn(io::Error),
}

/// Open the landmark stream: `-` is stdin, anything else a file or FIFO
pub fn open_source(path: &str) -> Result<Box<dyn BufRead + Send>, FrameError> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).map_err(|source| FrameError::Open {
        path: path.to_string(),
        source,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

/// Parse one line. Blank lines are skipped.
pub fn parse_line(line: &str) -> Result<Option<LandmarkFrame>, FrameError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

/// Replace whatever is pending with `frame`
fn offer(tx: &Sender<LandmarkFrame>, stale: &Receiver<LandmarkFrame>, frame: LandmarkFrame) -> bool {
    let mut frame = frame;
    loop {
        match tx.try_send(frame) {
            Ok(()) => return true,
            Err(TrySendError::Full(returned)) => {
                let _ = stale.try_recv();
                frame = returned;
            }
            Err(TrySendError::Disconnected(_)) => return false,
        }
    }
}

/// Read frames until end of input, shutdown, or the consumer goes away
pub fn pump<R: BufRead>(
    reader: R,
    mirror_x: bool,
    running: &ShutdownFlag,
    tx: &Sender<LandmarkFrame>,
    stale: &Receiver<LandmarkFrame>,
) -> u64 {
    let mut forwarded = 0;
    for line in reader.lines() {
        if !running.is_active() {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "landmark stream read failed");
                break;
            }
        };
        match parse_line(&line) {
            Ok(Some(mut frame)) => {
                if mirror_x {
                    frame.mirror_x();
                }
                if !offer(tx, stale, frame) {
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "skipping landmark line"),
        }
    }
    forwarded
}

/// Spawn the capture thread. The returned receiver always holds at most the
/// freshest frame.
pub fn spawn_capture(
    reader: Box<dyn BufRead + Send>,
    mirror_x: bool,
    running: ShutdownFlag,
) -> Result<(Receiver<LandmarkFrame>, JoinHandle<()>), FrameError> {
    let (tx, rx) = flume::bounded(1);
    let stale = rx.clone();

    let handle = thread::Builder::new()
        .name("aura-capture".to_string())
        .spawn(move || {
            let forwarded = pump(reader, mirror_x, &running, &tx, &stale);
            info!(frames = forwarded, "landmark stream ended");
        })
        .map_err(FrameError::Spawn)?;

    Ok((rx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn line(x: f32) -> String {
        let points: Vec<[f32; 2]> = vec![[x, 0.5]; 21];
        serde_json::json!({"width": 640, "height": 480, "landmarks": points}).to_string()
    }

    #[test]
    fn test_parse_no_hand_variants() {
        let null = parse_line(r#"{"width":640,"height":480,"landmarks":null}"#).unwrap().unwrap();
        assert!(null.hand().is_none());

        let empty = parse_line(r#"{"width":640,"height":480,"landmarks":[]}"#).unwrap().unwrap();
        assert!(empty.hand().is_none());

        let missing = parse_line(r#"{"width":640,"height":480}"#).unwrap().unwrap();
        assert!(missing.hand().is_none());

        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("{not json").is_err());
    }

    #[test]
    fn test_pump_keeps_only_freshest_frame() {
        let input = [line(0.1), "garbage".to_string(), line(0.2), line(0.3)].join("\n");
        let (tx, rx) = flume::bounded(1);
        let stale = rx.clone();

        let forwarded = pump(Cursor::new(input), false, &ShutdownFlag::new(), &tx, &stale);

        assert_eq!(forwarded, 3);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.hand().unwrap().normalized(0), [0.3, 0.5]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pump_mirrors_and_stops_on_shutdown() {
        let (tx, rx) = flume::bounded(1);
        let stale = rx.clone();
        let running = ShutdownFlag::new();

        pump(Cursor::new(line(0.25)), true, &running, &tx, &stale);
        assert_eq!(rx.try_recv().unwrap().hand().unwrap().normalized(0), [0.75, 0.5]);

        running.request_shutdown();
        assert_eq!(pump(Cursor::new(line(0.25)), false, &running, &tx, &stale), 0);
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(matches!(
            open_source("/definitely/not/here.jsonl"),
            Err(FrameError::Open { .. })
        ));
    }
}
