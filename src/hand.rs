//! Shared hand state - the only resource shared between the vision and cursor loops
//!
//! Single writer (vision loop), single reader (cursor loop). Every read
//! returns a complete copy taken under the lock, so a reader never sees x
//! from one publish and y from the next.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::gesture::GestureMode;

/// One processed frame, in camera pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandObservation {
    pub index: [f32; 2],
    pub thumb: [f32; 2],
    pub pinch_distance: f32,
    /// Camera frame size the pixel coordinates refer to
    pub frame: [f32; 2],
    pub captured_at: Instant,
}

impl HandObservation {
    pub fn new(index: [f32; 2], thumb: [f32; 2], frame: [f32; 2], captured_at: Instant) -> Self {
        let pinch_distance = (index[0] - thumb[0]).hypot(index[1] - thumb[1]);
        Self {
            index,
            thumb,
            pinch_distance,
            frame,
            captured_at,
        }
    }
}

/// Copy of the shared state as seen by a reader
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandSnapshot {
    pub observation: Option<HandObservation>,
    pub detected: bool,
    pub cursor_active: bool,
    pub mode: GestureMode,
    /// Incremented on every left press; readers freeze their smoother on change
    pub click_epoch: u64,
    pub last_update: Instant,
}

impl HandSnapshot {
    /// True when the cursor should follow this snapshot
    pub fn drives_cursor(&self) -> bool {
        self.detected && self.cursor_active && self.observation.is_some()
    }
}

#[derive(Debug)]
struct Inner {
    observation: Option<HandObservation>,
    detected: bool,
    cursor_active: bool,
    mode: GestureMode,
    click_epoch: u64,
    last_update: Instant,
}

/// Latest published hand observation plus staleness policy
#[derive(Debug, Clone)]
pub struct SharedHandState {
    inner: Arc<Mutex<Inner>>,
    staleness_timeout: Duration,
}

impl SharedHandState {
    pub fn new(staleness_timeout: Duration, now: Instant) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                observation: None,
                detected: false,
                cursor_active: false,
                mode: GestureMode::Idle,
                click_epoch: 0,
                last_update: now,
            })),
            staleness_timeout,
        }
    }

    pub fn staleness_timeout(&self) -> Duration {
        self.staleness_timeout
    }

    /// Publish a detected hand. `last_update` never moves backwards.
    pub fn publish(
        &self,
        observation: HandObservation,
        mode: GestureMode,
        cursor_active: bool,
        now: Instant,
    ) {
        let mut inner = self.lock();
        inner.observation = Some(observation);
        inner.detected = true;
        inner.cursor_active = cursor_active;
        inner.mode = mode;
        inner.last_update = inner.last_update.max(now);
    }

    /// Publish "no hand"
    pub fn clear(&self, now: Instant) {
        let mut inner = self.lock();
        inner.detected = false;
        inner.cursor_active = false;
        inner.mode = GestureMode::Idle;
        inner.last_update = inner.last_update.max(now);
    }

    pub fn bump_click_epoch(&self) {
        self.lock().click_epoch += 1;
    }

    /// Read a snapshot. Past the staleness timeout the returned copy reports
    /// no hand, no cursor and `Idle`, whatever is stored.
    pub fn snapshot(&self, now: Instant) -> HandSnapshot {
        let inner = self.lock();
        let stale = now.saturating_duration_since(inner.last_update) > self.staleness_timeout;

        HandSnapshot {
            observation: inner.observation,
            detected: inner.detected && !stale,
            cursor_active: inner.cursor_active && !stale,
            mode: if stale { GestureMode::Idle } else { inner.mode },
            click_epoch: inner.click_epoch,
            last_update: inner.last_update,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicked writer leaves plain data behind; keep serving it
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(x: f32, y: f32, at: Instant) -> HandObservation {
        HandObservation::new([x, y], [x + 40.0, y], [640.0, 480.0], at)
    }

    #[test]
    fn test_fresh_snapshot_reflects_publish() {
        let t0 = Instant::now();
        let state = SharedHandState::new(Duration::from_millis(100), t0);
        state.publish(observation(100.0, 200.0, t0), GestureMode::Cursor, true, t0);

        let snap = state.snapshot(t0 + Duration::from_millis(50));
        assert!(snap.detected);
        assert!(snap.cursor_active);
        assert!(snap.drives_cursor());
        assert_eq!(snap.mode, GestureMode::Cursor);
        assert_eq!(snap.observation.unwrap().index, [100.0, 200.0]);
        assert!((snap.observation.unwrap().pinch_distance - 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_stale_snapshot_forces_no_hand() {
        let t0 = Instant::now();
        let state = SharedHandState::new(Duration::from_millis(100), t0);
        state.publish(observation(100.0, 200.0, t0), GestureMode::Cursor, true, t0);

        let snap = state.snapshot(t0 + Duration::from_millis(200));
        assert!(!snap.detected);
        assert!(!snap.cursor_active);
        assert_eq!(snap.mode, GestureMode::Idle);
        assert!(!snap.drives_cursor());
    }

    #[test]
    fn test_last_update_never_decreases() {
        let t0 = Instant::now();
        let state = SharedHandState::new(Duration::from_millis(100), t0);
        let later = t0 + Duration::from_millis(80);
        state.publish(observation(1.0, 1.0, later), GestureMode::Cursor, true, later);
        state.publish(observation(2.0, 2.0, t0), GestureMode::Cursor, true, t0);

        assert_eq!(state.snapshot(later).last_update, later);
    }

    #[test]
    fn test_clear_drops_detection() {
        let t0 = Instant::now();
        let state = SharedHandState::new(Duration::from_millis(100), t0);
        state.publish(observation(1.0, 1.0, t0), GestureMode::Cursor, true, t0);
        state.clear(t0);

        let snap = state.snapshot(t0);
        assert!(!snap.detected);
        assert_eq!(snap.mode, GestureMode::Idle);
    }

    #[test]
    fn test_click_epoch_visible_to_reader() {
        let t0 = Instant::now();
        let state = SharedHandState::new(Duration::from_millis(100), t0);
        let reader = state.clone();
        state.bump_click_epoch();
        state.bump_click_epoch();
        assert_eq!(reader.snapshot(t0).click_epoch, 2);
    }
}
