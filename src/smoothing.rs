//! Cursor position smoothing
//!
//! Three interchangeable strategies behind [`PositionSmoother`], chosen once
//! from config:
//! - **Exponential**: pinch-adaptive EMA, cheapest, the default
//! - **OneEuro**: cutoff rises with filtered speed (smooth at rest, quick in motion)
//! - **Predictive**: constant-velocity Kalman filter per axis, least apparent lag
//!
//! All of them enter precision ("sniper") mode when the pinch distance drops
//! below the configured threshold, and all share the click-freeze behavior.

use nalgebra::{Matrix2, RowVector2, Vector2};
use std::f32::consts::PI;

use crate::config::{SmoothingConfig, SmoothingStrategy};

pub type Point = [f32; 2];

/// Per-update context passed alongside the raw position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothHint {
    pub pinch_distance: f32,
    /// Seconds since the previous update
    pub dt: f32,
}

impl SmoothHint {
    pub fn new(pinch_distance: f32, dt: f32) -> Self {
        Self { pinch_distance, dt }
    }
}

// ============================================================================
// Exponential
// ============================================================================

pub struct ExponentialSmoother {
    alpha_normal: f32,
    alpha_sniper: f32,
    sniper_threshold: f32,
    last: Option<Point>,
}

impl ExponentialSmoother {
    pub fn new(alpha_normal: f32, alpha_sniper: f32, sniper_threshold: f32) -> Self {
        Self {
            alpha_normal,
            alpha_sniper,
            sniper_threshold,
            last: None,
        }
    }

    pub fn update(&mut self, raw: Point, hint: SmoothHint) -> Point {
        let alpha = if hint.pinch_distance < self.sniper_threshold {
            self.alpha_sniper
        } else {
            self.alpha_normal
        };

        let next = match self.last {
            None => raw,
            Some([x, y]) => [
                alpha * raw[0] + (1.0 - alpha) * x,
                alpha * raw[1] + (1.0 - alpha) * y,
            ],
        };
        self.last = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

// ============================================================================
// One Euro
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct LowPass {
    prev: Option<f32>,
}

impl LowPass {
    fn filter(&mut self, value: f32, alpha: f32) -> f32 {
        let out = match self.prev {
            None => value,
            Some(prev) => alpha * value + (1.0 - alpha) * prev,
        };
        self.prev = Some(out);
        out
    }
}

#[derive(Debug, Clone, Copy)]
struct CutoffParams {
    min_cutoff: f32,
    beta: f32,
}

pub struct OneEuroSmoother {
    normal: CutoffParams,
    sniper: CutoffParams,
    d_cutoff: f32,
    sniper_threshold: f32,
    x: LowPass,
    y: LowPass,
    dx: LowPass,
    dy: LowPass,
    last_raw: Option<Point>,
    last_out: Option<Point>,
}

impl OneEuroSmoother {
    pub fn new(config: &SmoothingConfig, sniper_threshold: f32) -> Self {
        Self {
            normal: CutoffParams {
                min_cutoff: config.min_cutoff,
                beta: config.beta,
            },
            sniper: CutoffParams {
                min_cutoff: config.sniper_min_cutoff,
                beta: config.sniper_beta,
            },
            d_cutoff: config.d_cutoff,
            sniper_threshold,
            x: LowPass::default(),
            y: LowPass::default(),
            dx: LowPass::default(),
            dy: LowPass::default(),
            last_raw: None,
            last_out: None,
        }
    }

    /// `tau = 1/(2π·cutoff)`, `alpha = 1/(1 + tau/dt)`
    fn alpha(dt: f32, cutoff: f32) -> f32 {
        let tau = 1.0 / (2.0 * PI * cutoff);
        1.0 / (1.0 + tau / dt)
    }

    pub fn update(&mut self, raw: Point, hint: SmoothHint) -> Point {
        let (Some(prev_raw), Some(prev_out)) = (self.last_raw, self.last_out) else {
            self.x.filter(raw[0], 1.0);
            self.y.filter(raw[1], 1.0);
            self.last_raw = Some(raw);
            self.last_out = Some(raw);
            return raw;
        };

        // Zero or huge gaps give a meaningless velocity
        if hint.dt <= 0.0 || hint.dt > 1.0 {
            return prev_out;
        }

        let params = if hint.pinch_distance < self.sniper_threshold {
            self.sniper
        } else {
            self.normal
        };

        let alpha_d = Self::alpha(hint.dt, self.d_cutoff);
        let vx = self.dx.filter((raw[0] - prev_raw[0]) / hint.dt, alpha_d);
        let vy = self.dy.filter((raw[1] - prev_raw[1]) / hint.dt, alpha_d);

        let cutoff = params.min_cutoff + params.beta * vx.hypot(vy);
        let alpha = Self::alpha(hint.dt, cutoff);
        let out = [self.x.filter(raw[0], alpha), self.y.filter(raw[1], alpha)];

        self.last_raw = Some(raw);
        self.last_out = Some(out);
        out
    }

    pub fn reset(&mut self) {
        self.x = LowPass::default();
        self.y = LowPass::default();
        self.dx = LowPass::default();
        self.dy = LowPass::default();
        self.last_raw = None;
        self.last_out = None;
    }
}

// ============================================================================
// Predictive (constant-velocity Kalman)
// ============================================================================

/// State `[position, velocity]` in pixels and pixels per update
#[derive(Debug, Clone, Copy)]
struct AxisFilter {
    state: Vector2<f32>,
    covariance: Matrix2<f32>,
}

impl AxisFilter {
    fn new(position: f32) -> Self {
        Self {
            state: Vector2::new(position, 0.0),
            covariance: Matrix2::identity(),
        }
    }

    fn step(&mut self, measured: f32, process_noise: f32, measurement_noise: f32) -> f32 {
        let transition = Matrix2::new(1.0, 1.0, 0.0, 1.0);
        let observation = RowVector2::new(1.0, 0.0);

        // Predict
        self.state = transition * self.state;
        self.covariance = transition * self.covariance * transition.transpose()
            + Matrix2::identity() * process_noise;

        // Correct
        let residual = measured - self.state[0];
        let innovation = self.covariance[(0, 0)] + measurement_noise;
        let gain = Vector2::new(
            self.covariance[(0, 0)] / innovation,
            self.covariance[(1, 0)] / innovation,
        );
        self.state += gain * residual;
        self.covariance = (Matrix2::identity() - gain * observation) * self.covariance;

        self.state[0]
    }
}

pub struct PredictiveSmoother {
    process_noise: f32,
    measurement_noise: f32,
    /// Extra measurement distrust in precision mode
    sniper_scale: f32,
    sniper_threshold: f32,
    axes: Option<[AxisFilter; 2]>,
}

impl PredictiveSmoother {
    pub fn new(config: &SmoothingConfig, sniper_threshold: f32) -> Self {
        Self {
            process_noise: config.process_noise,
            measurement_noise: config.measurement_noise,
            sniper_scale: config.alpha_normal / config.alpha_sniper,
            sniper_threshold,
            axes: None,
        }
    }

    pub fn update(&mut self, raw: Point, hint: SmoothHint) -> Point {
        let Some(axes) = self.axes.as_mut() else {
            self.axes = Some([AxisFilter::new(raw[0]), AxisFilter::new(raw[1])]);
            return raw;
        };

        let r = if hint.pinch_distance < self.sniper_threshold {
            self.measurement_noise * self.sniper_scale
        } else {
            self.measurement_noise
        };

        [
            axes[0].step(raw[0], self.process_noise, r),
            axes[1].step(raw[1], self.process_noise, r),
        ]
    }

    pub fn reset(&mut self) {
        self.axes = None;
    }
}

// ============================================================================
// Strategy wrapper
// ============================================================================

enum Filter {
    Exponential(ExponentialSmoother),
    OneEuro(OneEuroSmoother),
    Predictive(PredictiveSmoother),
}

/// Selected smoothing strategy plus click-freeze countdown
pub struct PositionSmoother {
    filter: Filter,
    sniper_threshold: f32,
    frozen_remaining: u32,
    last_output: Option<Point>,
}

impl PositionSmoother {
    pub fn from_config(config: &SmoothingConfig, sniper_threshold: f32) -> Self {
        let filter = match config.strategy {
            SmoothingStrategy::Exponential => Filter::Exponential(ExponentialSmoother::new(
                config.alpha_normal,
                config.alpha_sniper,
                sniper_threshold,
            )),
            SmoothingStrategy::OneEuro => {
                Filter::OneEuro(OneEuroSmoother::new(config, sniper_threshold))
            }
            SmoothingStrategy::Predictive => {
                Filter::Predictive(PredictiveSmoother::new(config, sniper_threshold))
            }
        };
        Self {
            filter,
            sniper_threshold,
            frozen_remaining: 0,
            last_output: None,
        }
    }

    pub fn strategy(&self) -> SmoothingStrategy {
        match self.filter {
            Filter::Exponential(_) => SmoothingStrategy::Exponential,
            Filter::OneEuro(_) => SmoothingStrategy::OneEuro,
            Filter::Predictive(_) => SmoothingStrategy::Predictive,
        }
    }

    pub fn is_sniper(&self, hint: SmoothHint) -> bool {
        hint.pinch_distance < self.sniper_threshold
    }

    pub fn update(&mut self, raw: Point, hint: SmoothHint) -> Point {
        if self.frozen_remaining > 0 {
            if let Some(held) = self.last_output {
                self.frozen_remaining -= 1;
                return held;
            }
        }

        let out = match &mut self.filter {
            Filter::Exponential(f) => f.update(raw, hint),
            Filter::OneEuro(f) => f.update(raw, hint),
            Filter::Predictive(f) => f.update(raw, hint),
        };
        self.last_output = Some(out);
        out
    }

    /// Hold the current output for the next `updates` calls
    pub fn freeze(&mut self, updates: u32) {
        self.frozen_remaining = updates;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen_remaining > 0 && self.last_output.is_some()
    }

    pub fn reset(&mut self) {
        match &mut self.filter {
            Filter::Exponential(f) => f.reset(),
            Filter::OneEuro(f) => f.reset(),
            Filter::Predictive(f) => f.reset(),
        }
        self.frozen_remaining = 0;
        self.last_output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: f32 = 100.0;
    const DT: f32 = 1.0 / 120.0;

    fn smoother(strategy: SmoothingStrategy) -> PositionSmoother {
        let config = SmoothingConfig {
            strategy,
            ..SmoothingConfig::default()
        };
        PositionSmoother::from_config(&config, 45.0)
    }

    fn close(a: Point, b: Point, eps: f32) -> bool {
        (a[0] - b[0]).abs() < eps && (a[1] - b[1]).abs() < eps
    }

    #[test]
    fn test_cold_start_has_no_lag() {
        for strategy in [
            SmoothingStrategy::Exponential,
            SmoothingStrategy::OneEuro,
            SmoothingStrategy::Predictive,
        ] {
            let mut s = smoother(strategy);
            assert_eq!(s.update([320.0, 240.0], SmoothHint::new(OPEN, DT)), [320.0, 240.0]);
        }
    }

    #[test]
    fn test_exponential_converges() {
        let mut s = smoother(SmoothingStrategy::Exponential);
        s.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        let mut out = [0.0, 0.0];
        for _ in 0..50 {
            out = s.update([100.0, 100.0], SmoothHint::new(OPEN, DT));
        }
        assert!(close(out, [100.0, 100.0], 1e-3));
    }

    #[test]
    fn test_sniper_mode_reacts_slower() {
        let mut normal = smoother(SmoothingStrategy::Exponential);
        normal.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        let fast = normal.update([100.0, 0.0], SmoothHint::new(OPEN, DT));

        let mut precise = smoother(SmoothingStrategy::Exponential);
        precise.update([0.0, 0.0], SmoothHint::new(20.0, DT));
        let slow = precise.update([100.0, 0.0], SmoothHint::new(20.0, DT));

        assert!((fast[0] - 40.0).abs() < 1e-4);
        assert!((slow[0] - 15.0).abs() < 1e-4);
        assert!(precise.is_sniper(SmoothHint::new(20.0, DT)));
    }

    #[test]
    fn test_freeze_holds_output_then_resumes() {
        let mut s = smoother(SmoothingStrategy::Exponential);
        let held = s.update([10.0, 10.0], SmoothHint::new(OPEN, DT));
        s.freeze(3);

        for _ in 0..3 {
            assert!(s.is_frozen());
            assert_eq!(s.update([90.0, 90.0], SmoothHint::new(OPEN, DT)), held);
        }
        assert!(!s.is_frozen());
        assert_ne!(s.update([90.0, 90.0], SmoothHint::new(OPEN, DT)), held);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut s = smoother(SmoothingStrategy::Exponential);
        s.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        s.update([50.0, 50.0], SmoothHint::new(OPEN, DT));
        s.freeze(5);
        s.reset();

        assert!(!s.is_frozen());
        assert_eq!(s.update([500.0, 400.0], SmoothHint::new(OPEN, DT)), [500.0, 400.0]);
    }

    #[test]
    fn test_one_euro_converges_and_guards_dt() {
        let mut s = smoother(SmoothingStrategy::OneEuro);
        s.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        let before = s.update([10.0, 10.0], SmoothHint::new(OPEN, DT));

        // Non-positive dt returns the previous output untouched
        assert_eq!(s.update([999.0, 999.0], SmoothHint::new(OPEN, 0.0)), before);

        let mut out = before;
        for _ in 0..2000 {
            out = s.update([100.0, 100.0], SmoothHint::new(OPEN, DT));
        }
        assert!(close(out, [100.0, 100.0], 1e-2));
    }

    #[test]
    fn test_one_euro_fast_motion_tracks_closer() {
        // Same step size, once after a slow approach and once mid-swipe
        let mut slow = smoother(SmoothingStrategy::OneEuro);
        slow.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        let slow_out = slow.update([1.0, 0.0], SmoothHint::new(OPEN, DT));

        let mut fast = smoother(SmoothingStrategy::OneEuro);
        fast.update([0.0, 0.0], SmoothHint::new(OPEN, DT));
        let fast_out = fast.update([200.0, 0.0], SmoothHint::new(OPEN, DT));

        let slow_ratio = slow_out[0] / 1.0;
        let fast_ratio = fast_out[0] / 200.0;
        assert!(fast_ratio > slow_ratio);
    }

    #[test]
    fn test_predictive_tracks_ramp_without_lag() {
        let mut predictive = smoother(SmoothingStrategy::Predictive);
        let mut exponential = smoother(SmoothingStrategy::Exponential);

        let mut p_out = [0.0, 0.0];
        let mut e_out = [0.0, 0.0];
        let mut target = 0.0;
        for i in 0..300 {
            target = i as f32 * 10.0;
            p_out = predictive.update([target, 0.0], SmoothHint::new(OPEN, DT));
            e_out = exponential.update([target, 0.0], SmoothHint::new(OPEN, DT));
        }

        assert!((target - p_out[0]).abs() < 1.0);
        assert!((target - e_out[0]).abs() > 10.0);
    }

    #[test]
    fn test_strategy_reported() {
        assert_eq!(
            smoother(SmoothingStrategy::Predictive).strategy(),
            SmoothingStrategy::Predictive
        );
    }
}
