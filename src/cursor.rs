//! Cursor loop (~120 Hz): the single reader of the shared hand state
//!
//! Each tick reads a snapshot, and only when a fresh hand drives the cursor
//! maps it to the screen, smooths it and moves the pointer. The loop paces
//! itself: a tick that overruns its period simply waits zero, it never tries
//! to catch up.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::ShutdownFlag;
use crate::config::Config;
use crate::hand::SharedHandState;
use crate::input::InputSink;
use crate::smoothing::{Point, PositionSmoother, SmoothHint};
use crate::stats::{LoopGauges, LoopStats, RateMeter};

/// Used when neither the config nor the input backend knows the display
pub const FALLBACK_SCREEN: (u32, u32) = (1920, 1080);

/// Time left in the period after `elapsed` of work, never negative
pub fn remaining_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

/// Camera pixels to screen pixels, with an inactive band at the camera edges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenMapper {
    margin: f32,
    screen: [f32; 2],
}

impl ScreenMapper {
    pub fn new(margin: f32, screen: (u32, u32)) -> Self {
        Self {
            margin,
            screen: [screen.0 as f32, screen.1 as f32],
        }
    }

    pub fn screen(&self) -> (u32, u32) {
        (self.screen[0] as u32, self.screen[1] as u32)
    }

    /// `norm = (s - margin) / (cam - 2*margin)`, scaled and clamped to the screen
    pub fn map(&self, point: [f32; 2], frame: [f32; 2]) -> Point {
        let axis = |s: f32, cam: f32, screen: f32| {
            let span = cam - 2.0 * self.margin;
            let norm = if span > 0.0 {
                (s - self.margin) / span
            } else {
                s / cam.max(1.0)
            };
            self.clamp_axis(norm * screen, screen)
        };
        [
            axis(point[0], frame[0], self.screen[0]),
            axis(point[1], frame[1], self.screen[1]),
        ]
    }

    pub fn clamp(&self, point: Point) -> (i32, i32) {
        (
            self.clamp_axis(point[0], self.screen[0]).round() as i32,
            self.clamp_axis(point[1], self.screen[1]).round() as i32,
        )
    }

    fn clamp_axis(&self, value: f32, screen: f32) -> f32 {
        value.clamp(0.0, (screen - 1.0).max(0.0))
    }
}

/// Screen size from config, else the backend, else [`FALLBACK_SCREEN`]
pub fn resolve_screen(config: &Config, sink: &dyn InputSink) -> (u32, u32) {
    match (config.screen.width, config.screen.height) {
        (Some(w), Some(h)) => (w, h),
        _ => sink.display_size().unwrap_or(FALLBACK_SCREEN),
    }
}

pub struct CursorLoop {
    state: SharedHandState,
    smoother: PositionSmoother,
    mapper: ScreenMapper,
    sink: Box<dyn InputSink>,
    running: ShutdownFlag,
    period: Duration,
    freeze_updates: u32,
    was_active: bool,
    last_epoch: u64,
    last_tick: Option<Instant>,
    last_position: Option<(i32, i32)>,
    gauges: Option<Arc<LoopGauges>>,
    stats: LoopStats,
    rate: RateMeter,
}

impl CursorLoop {
    pub fn new(
        config: &Config,
        state: SharedHandState,
        sink: Box<dyn InputSink>,
        running: ShutdownFlag,
    ) -> Self {
        let now = Instant::now();
        let screen = resolve_screen(config, sink.as_ref());
        let last_epoch = state.snapshot(now).click_epoch;
        Self {
            smoother: PositionSmoother::from_config(
                &config.smoothing,
                config.gesture.sniper_threshold,
            ),
            mapper: ScreenMapper::new(config.screen.camera_margin, screen),
            state,
            sink,
            running,
            period: config.timing.cursor_period(),
            freeze_updates: config.gesture.click_freeze_updates,
            was_active: false,
            last_epoch,
            last_tick: None,
            last_position: None,
            gauges: None,
            stats: LoopStats::new("cursor"),
            rate: RateMeter::new(now),
        }
    }

    pub fn with_gauges(mut self, gauges: Arc<LoopGauges>) -> Self {
        self.gauges = Some(gauges);
        self
    }

    pub fn mapper(&self) -> &ScreenMapper {
        &self.mapper
    }

    /// One tick. Returns the position moved to, `None` for a no-op tick.
    pub fn tick(&mut self, now: Instant) -> Option<(i32, i32)> {
        let snapshot = self.state.snapshot(now);

        if snapshot.click_epoch != self.last_epoch {
            self.last_epoch = snapshot.click_epoch;
            self.smoother.freeze(self.freeze_updates);
        }

        let observation = match snapshot.observation {
            Some(observation) if snapshot.drives_cursor() => observation,
            _ => {
                if self.was_active {
                    debug!("cursor released, smoother reset");
                    self.smoother.reset();
                    self.was_active = false;
                    self.last_tick = None;
                }
                return None;
            }
        };

        let dt = self
            .last_tick
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(self.period)
            .as_secs_f32();
        self.last_tick = Some(now);
        self.was_active = true;

        let raw = self.mapper.map(observation.index, observation.frame);
        let smoothed = self
            .smoother
            .update(raw, SmoothHint::new(observation.pinch_distance, dt));
        let position = self.mapper.clamp(smoothed);

        if self.last_position != Some(position) {
            if let Err(e) = self.sink.move_to(position.0, position.1) {
                warn!(error = %e, "cursor move failed");
            }
            self.last_position = Some(position);
        }
        Some(position)
    }

    pub fn run(mut self) -> LoopStats {
        info!(
            strategy = ?self.smoother.strategy(),
            screen = ?self.mapper.screen(),
            "cursor loop started"
        );

        while self.running.is_active() {
            let started = Instant::now();
            self.tick(started);

            let busy = started.elapsed();
            self.stats.record(busy, self.period);
            if let Some(fps) = self.rate.tick(started) {
                if let Some(gauges) = &self.gauges {
                    gauges.cursor_fps.store(fps, Ordering::Relaxed);
                }
            }
            thread::sleep(remaining_sleep(self.period, busy));
        }

        info!("cursor loop stopped");
        self.stats
    }
}
