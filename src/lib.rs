//! Hand-gesture and voice control for mouse and keyboard
//!
//! Landmark frames feed a ~30 Hz vision loop that classifies gestures and
//! drives clicks; a decoupled ~120 Hz cursor loop smooths the published hand
//! position onto the screen. An external voice recognizer queues commands on
//! the [`bus::CommandBus`], which the vision loop drains and dispatches to
//! worker threads.

pub mod bus;
pub mod click;
pub mod config;
pub mod context;
pub mod cursor;
pub mod dispatch;
pub mod frames;
pub mod gesture;
pub mod hand;
pub mod input;
pub mod smoothing;
pub mod stats;
pub mod supervisor;
pub mod vision;
pub mod voice;
