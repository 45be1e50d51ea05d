//! Loop timing stats and live rate gauges

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Atomic f32 wrapper using bit-casting
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, v: f32, order: Ordering) {
        self.0.store(v.to_bits(), order);
    }
}

/// Measured loop rates, readable from any thread
pub struct LoopGauges {
    pub vision_fps: AtomicF32,
    pub cursor_fps: AtomicF32,
}

impl LoopGauges {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            vision_fps: AtomicF32::new(0.0),
            cursor_fps: AtomicF32::new(0.0),
        })
    }
}

/// Counts ticks and reports a rate once per window
pub struct RateMeter {
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window: Duration::from_secs(1),
            window_start: now,
            count: 0,
        }
    }

    /// Returns the rate when a window closes
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let rate = self.count as f32 / elapsed.as_secs_f32();
        self.count = 0;
        self.window_start = now;
        Some(rate)
    }
}

/// Per-loop tick timing. Overruns are counted, never caught up on.
#[derive(Clone, Debug)]
pub struct LoopStats {
    name: &'static str,
    ticks: u64,
    overruns: u64,
    busy_total: Duration,
    busy_max: Duration,
}

impl LoopStats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ticks: 0,
            overruns: 0,
            busy_total: Duration::ZERO,
            busy_max: Duration::ZERO,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Record one tick's busy time against its budget. Returns true on overrun.
    pub fn record(&mut self, busy: Duration, budget: Duration) -> bool {
        self.ticks += 1;
        self.busy_total += busy;
        self.busy_max = self.busy_max.max(busy);

        let overrun = busy > budget;
        if overrun {
            self.overruns += 1;
            debug!(
                loop_name = self.name,
                busy_us = busy.as_micros() as u64,
                budget_us = budget.as_micros() as u64,
                "tick overran its budget"
            );
        }
        overrun
    }

    pub fn summary(&self) -> String {
        if self.ticks == 0 {
            return format!("{}: no ticks recorded", self.name);
        }
        let avg = self.busy_total / self.ticks.min(u32::MAX as u64) as u32;
        format!(
            "{} (n={}): avg={:.2}ms max={:.2}ms overruns={} ({:.1}%)",
            self.name,
            self.ticks,
            avg.as_secs_f64() * 1000.0,
            self.busy_max.as_secs_f64() * 1000.0,
            self.overruns,
            self.overruns as f64 * 100.0 / self.ticks as f64
        )
    }
}
