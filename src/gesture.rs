//! Hand landmark frames and stateless gesture classification
//!
//! Landmarks follow the 21-point hand topology (wrist = 0, thumb 1-4,
//! index 5-8, middle 9-12, ring 13-16, pinky 17-20) with coordinates
//! normalized to the frame.

use serde::Deserialize;
use std::fmt;

pub const LANDMARK_COUNT: usize = 21;

pub const THUMB_IP: usize = 3;
pub const THUMB_TIP: usize = 4;
pub const INDEX_PIP: usize = 6;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_PIP: usize = 10;
pub const MIDDLE_TIP: usize = 12;
pub const RING_PIP: usize = 14;
pub const RING_TIP: usize = 16;
pub const PINKY_PIP: usize = 18;
pub const PINKY_TIP: usize = 20;

/// One detector output: frame size plus the keypoints of at most one hand
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LandmarkFrame {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub landmarks: Option<Vec<[f32; 2]>>,
}

impl LandmarkFrame {
    pub fn new(width: u32, height: u32, landmarks: Vec<[f32; 2]>) -> Self {
        Self {
            width,
            height,
            landmarks: Some(landmarks),
        }
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            landmarks: None,
        }
    }

    /// The tracked hand, if the frame carries a complete skeleton
    pub fn hand(&self) -> Option<Hand<'_>> {
        match &self.landmarks {
            Some(points) if points.len() >= LANDMARK_COUNT => Some(Hand {
                points,
                width: self.width as f32,
                height: self.height as f32,
            }),
            _ => None,
        }
    }

    /// Flip horizontally, for camera feeds that are not already mirrored
    pub fn mirror_x(&mut self) {
        if let Some(points) = self.landmarks.as_mut() {
            for p in points.iter_mut() {
                p[0] = 1.0 - p[0];
            }
        }
    }
}

/// Borrowed view over a complete skeleton
#[derive(Debug, Clone, Copy)]
pub struct Hand<'a> {
    points: &'a [[f32; 2]],
    width: f32,
    height: f32,
}

impl Hand<'_> {
    /// Normalized coordinates of a landmark
    pub fn normalized(&self, index: usize) -> [f32; 2] {
        self.points[index]
    }

    /// Pixel coordinates of a landmark
    pub fn pixel(&self, index: usize) -> [f32; 2] {
        let [x, y] = self.points[index];
        [x * self.width, y * self.height]
    }

    /// Frame width and height in pixels
    pub fn frame_size(&self) -> [f32; 2] {
        [self.width, self.height]
    }

    /// Thumb tip to index tip distance in pixels
    pub fn pinch_distance(&self) -> f32 {
        let [tx, ty] = self.pixel(THUMB_TIP);
        let [ix, iy] = self.pixel(INDEX_TIP);
        (tx - ix).hypot(ty - iy)
    }

    pub fn fingers(&self) -> FingerStates {
        let extended_up =
            |tip: usize, pip: usize| self.points[tip][1] < self.points[pip][1];
        FingerStates {
            // Thumb folds across the palm, so it is judged on the x axis
            thumb: self.points[THUMB_TIP][0] < self.points[THUMB_IP][0],
            index: extended_up(INDEX_TIP, INDEX_PIP),
            middle: extended_up(MIDDLE_TIP, MIDDLE_PIP),
            ring: extended_up(RING_TIP, RING_PIP),
            pinky: extended_up(PINKY_TIP, PINKY_PIP),
        }
    }
}

/// Extended (true) / retracted (false) per finger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerStates {
    pub thumb: bool,
    pub index: bool,
    pub middle: bool,
    pub ring: bool,
    pub pinky: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GestureMode {
    #[default]
    Idle,
    Cursor,
    Scrolling,
    Volume,
    MediaControl,
}

impl GestureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GestureMode::Idle => "idle",
            GestureMode::Cursor => "cursor",
            GestureMode::Scrolling => "scrolling",
            GestureMode::Volume => "volume",
            GestureMode::MediaControl => "media",
        }
    }
}

impl fmt::Display for GestureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First matching rule wins; the order resolves overlapping finger sets.
pub fn classify(fingers: FingerStates) -> GestureMode {
    let FingerStates {
        thumb,
        index,
        middle,
        ring,
        pinky,
    } = fingers;

    if index && !middle && !ring {
        GestureMode::Cursor
    } else if index && middle && ring && !pinky {
        GestureMode::Scrolling
    } else if thumb && pinky && !index {
        GestureMode::Volume
    } else if !index && !middle && !ring {
        GestureMode::MediaControl
    } else {
        GestureMode::Idle
    }
}

/// Everything the control loop needs from one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureReading {
    pub fingers: FingerStates,
    pub pinch_distance: f32,
    pub mode: GestureMode,
}

impl GestureReading {
    pub fn from_hand(hand: &Hand<'_>) -> Self {
        let fingers = hand.fingers();
        Self {
            fingers,
            pinch_distance: hand.pinch_distance(),
            mode: classify(fingers),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn fingers(thumb: bool, index: bool, middle: bool, ring: bool, pinky: bool) -> FingerStates {
        FingerStates {
            thumb,
            index,
            middle,
            ring,
            pinky,
        }
    }

    #[test]
    fn test_cursor_rule() {
        assert_eq!(classify(fingers(false, true, false, false, false)), GestureMode::Cursor);
        // Thumb and pinky do not matter once the index rule matches
        assert_eq!(classify(fingers(true, true, false, false, true)), GestureMode::Cursor);
    }

    #[test]
    fn test_scroll_rule() {
        assert_eq!(classify(fingers(false, true, true, true, false)), GestureMode::Scrolling);
        assert_eq!(classify(fingers(false, true, true, true, true)), GestureMode::Idle);
    }

    #[test]
    fn test_volume_beats_media_control() {
        // Shaka: thumb + pinky, index/middle/ring down would also be a fist
        assert_eq!(classify(fingers(true, false, false, false, true)), GestureMode::Volume);
    }

    #[test]
    fn test_fist_is_media_control() {
        assert_eq!(classify(fingers(false, false, false, false, false)), GestureMode::MediaControl);
        assert_eq!(classify(fingers(true, false, false, false, false)), GestureMode::MediaControl);
    }

    #[test]
    fn test_unmatched_is_idle() {
        assert_eq!(classify(fingers(false, true, true, false, false)), GestureMode::Idle);
        assert_eq!(classify(fingers(false, false, true, false, false)), GestureMode::Idle);
    }

    #[test]
    fn test_reading_from_frame() {
        let frame = hand_frame(pointing(), [320.0, 240.0], 42.0);
        let hand = frame.hand().unwrap();
        let reading = GestureReading::from_hand(&hand);

        assert_eq!(reading.mode, GestureMode::Cursor);
        assert!((reading.pinch_distance - 42.0).abs() < 1e-3);
        let [x, y] = hand.pixel(INDEX_TIP);
        assert!((x - 320.0).abs() < 1e-3 && (y - 240.0).abs() < 1e-3);
    }

    #[test]
    fn test_incomplete_skeleton_is_no_hand() {
        let frame = LandmarkFrame::new(640, 480, vec![[0.5, 0.5]; 5]);
        assert!(frame.hand().is_none());
        assert!(LandmarkFrame::empty(640, 480).hand().is_none());
    }

    #[test]
    fn test_mirror_flips_x() {
        let mut frame = LandmarkFrame::new(640, 480, vec![[0.25, 0.5]; LANDMARK_COUNT]);
        frame.mirror_x();
        assert_eq!(frame.hand().unwrap().normalized(0), [0.75, 0.5]);
    }
}
