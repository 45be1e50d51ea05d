//! Pinch-driven click, drag and right-click state machine
//!
//! ```text
//! Idle --pinch < click, debounced--> Pressed --held >= hold--> RightClickUpgraded
//!                                      |   \--click <= pinch <= release--> Dragging
//!                                      \--pinch > release--> Idle <--pinch > release--/
//! ```
//!
//! Press and release use different thresholds so a distance hovering near
//! one boundary cannot chatter. Losing the hand forces every button up.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::GestureConfig;
use crate::input::{InputError, InputSink, MouseButton};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickPhase {
    Idle,
    /// Left button down, pinch still below the press threshold
    Pressed,
    /// Left button down, pinch opened between the two thresholds
    Dragging,
    /// Right click already fired; waiting for the pinch to open
    RightClickUpgraded,
}

/// What a single update did to the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickEvent {
    None,
    LeftDown,
    LeftUp,
    RightClick,
}

pub struct ClickStateMachine {
    click_threshold: f32,
    release_threshold: f32,
    right_click_hold: Duration,
    debounce: Duration,
    phase: ClickPhase,
    left_down: bool,
    right_down: bool,
    pinch_start: Option<Instant>,
    last_click: Option<Instant>,
}

impl ClickStateMachine {
    pub fn new(config: &GestureConfig) -> Self {
        Self {
            click_threshold: config.click_threshold,
            release_threshold: config.release_threshold,
            right_click_hold: config.right_click_hold(),
            debounce: config.click_debounce(),
            phase: ClickPhase::Idle,
            left_down: false,
            right_down: false,
            pinch_start: None,
            last_click: None,
        }
    }

    pub fn phase(&self) -> ClickPhase {
        self.phase
    }

    pub fn is_left_down(&self) -> bool {
        self.left_down
    }

    pub fn is_right_down(&self) -> bool {
        self.right_down
    }

    pub fn is_engaged(&self) -> bool {
        self.phase != ClickPhase::Idle
    }

    /// Feed one pinch reading
    pub fn update(&mut self, pinch: f32, now: Instant, sink: &mut dyn InputSink) -> ClickEvent {
        match self.phase {
            ClickPhase::Idle => {
                if pinch < self.click_threshold && self.debounced(now) {
                    self.press(now, sink);
                    ClickEvent::LeftDown
                } else {
                    ClickEvent::None
                }
            }
            ClickPhase::Pressed => {
                if pinch > self.release_threshold {
                    self.release(now, sink);
                    ClickEvent::LeftUp
                } else if pinch < self.click_threshold {
                    let held = self
                        .pinch_start
                        .map(|start| now.saturating_duration_since(start))
                        .unwrap_or_default();
                    if held >= self.right_click_hold {
                        self.upgrade(now, sink);
                        ClickEvent::RightClick
                    } else {
                        ClickEvent::None
                    }
                } else {
                    self.phase = ClickPhase::Dragging;
                    ClickEvent::None
                }
            }
            ClickPhase::Dragging => {
                if pinch > self.release_threshold {
                    self.release(now, sink);
                    ClickEvent::LeftUp
                } else {
                    ClickEvent::None
                }
            }
            ClickPhase::RightClickUpgraded => {
                if pinch > self.release_threshold {
                    self.phase = ClickPhase::Idle;
                    self.pinch_start = None;
                }
                ClickEvent::None
            }
        }
    }

    /// Apply only the release transition. Used outside cursor mode, where a
    /// new press must not start but an opened pinch still lets go.
    pub fn release_if_open(
        &mut self,
        pinch: f32,
        now: Instant,
        sink: &mut dyn InputSink,
    ) -> ClickEvent {
        match self.phase {
            ClickPhase::Idle => ClickEvent::None,
            _ if pinch <= self.release_threshold => ClickEvent::None,
            ClickPhase::RightClickUpgraded => {
                self.phase = ClickPhase::Idle;
                self.pinch_start = None;
                ClickEvent::None
            }
            ClickPhase::Pressed | ClickPhase::Dragging => {
                self.release(now, sink);
                ClickEvent::LeftUp
            }
        }
    }

    /// Force every button up and return to `Idle`. Returns whether anything
    /// was actually held.
    pub fn emergency_release(&mut self, sink: &mut dyn InputSink) -> bool {
        let was_held = self.left_down || self.right_down;
        if self.left_down {
            report(sink.button_up(MouseButton::Left), "emergency left release");
            self.left_down = false;
        }
        if self.right_down {
            report(sink.button_up(MouseButton::Right), "emergency right release");
            self.right_down = false;
        }
        if was_held {
            info!("hand lost, buttons released");
        }
        self.phase = ClickPhase::Idle;
        self.pinch_start = None;
        was_held
    }

    fn debounced(&self, now: Instant) -> bool {
        self.last_click
            .is_none_or(|last| now.saturating_duration_since(last) > self.debounce)
    }

    fn press(&mut self, now: Instant, sink: &mut dyn InputSink) {
        report(sink.button_down(MouseButton::Left), "left press");
        // Marked down even on failure so the release is always attempted
        self.left_down = true;
        self.pinch_start = Some(now);
        self.phase = ClickPhase::Pressed;
        debug!("left down");
    }

    fn release(&mut self, now: Instant, sink: &mut dyn InputSink) {
        report(sink.button_up(MouseButton::Left), "left release");
        self.left_down = false;
        self.pinch_start = None;
        self.last_click = Some(now);
        self.phase = ClickPhase::Idle;
        debug!("left up");
    }

    fn upgrade(&mut self, now: Instant, sink: &mut dyn InputSink) {
        report(sink.button_up(MouseButton::Left), "left release before right click");
        self.left_down = false;

        self.right_down = true;
        report(sink.click(MouseButton::Right), "right click");
        self.right_down = false;

        self.last_click = Some(now);
        self.phase = ClickPhase::RightClickUpgraded;
        info!("right click");
    }
}

fn report(result: Result<(), InputError>, action: &str) {
    if let Err(e) = result {
        warn!(action, error = %e, "input action failed");
    }
}
