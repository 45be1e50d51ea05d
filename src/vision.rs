//! Vision loop (~30 Hz): the single writer of the shared hand state
//!
//! Per processed frame: classify the gesture, run the click state machine in
//! cursor mode (elsewhere only its release transition), publish the
//! observation, perform mode actions (scroll, volume, media). Every
//! iteration, frame or not, drains the command bus and hands each command to
//! the dispatcher.

use flume::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bus::{CommandDrain, ShutdownFlag};
use crate::click::{ClickEvent, ClickStateMachine};
use crate::config::{Config, GestureConfig};
use crate::dispatch::Dispatcher;
use crate::gesture::{
    GestureMode, GestureReading, Hand, INDEX_TIP, LandmarkFrame, MIDDLE_TIP, PINKY_TIP, THUMB_TIP,
};
use crate::hand::{HandObservation, SharedHandState};
use crate::input::{InputError, InputSink, KeyToken};
use crate::stats::{LoopGauges, LoopStats, RateMeter};

/// Normalized pinky heights that select volume up / down
const VOLUME_UP_BELOW: f32 = 0.3;
const VOLUME_DOWN_ABOVE: f32 = 0.7;

/// Scroll lines for a middle-finger offset from the frame centre (px).
/// Positive scrolls up, i.e. when the finger is above centre.
pub fn scroll_lines(delta: f32, deadzone: f32) -> i32 {
    let excess = delta.abs() - deadzone;
    if excess <= 0.0 {
        return 0;
    }
    let lines = (excess / 10.0).powf(1.5).floor() as i32;
    if delta > 0.0 { -lines } else { lines }
}

fn cooled(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.is_none_or(|t| now.saturating_duration_since(t) >= cooldown)
}

fn report(result: Result<(), InputError>, action: &str) {
    if let Err(e) = result {
        warn!(action, error = %e, "input action failed");
    }
}

pub struct VisionLoop {
    gesture: GestureConfig,
    volume_cooldown: Duration,
    media_cooldown: Duration,
    frame_skip: u64,
    staleness_timeout: Duration,
    period: Duration,
    state: SharedHandState,
    drain: CommandDrain,
    dispatcher: Dispatcher,
    sink: Box<dyn InputSink>,
    click: ClickStateMachine,
    running: ShutdownFlag,
    gauges: Option<Arc<LoopGauges>>,
    received: u64,
    scroll_ticks: u32,
    last_frame_at: Instant,
    frames_missing: bool,
    last_volume: Option<Instant>,
    last_media: Option<Instant>,
    stats: LoopStats,
    rate: RateMeter,
}

impl VisionLoop {
    pub fn new(
        config: &Config,
        state: SharedHandState,
        drain: CommandDrain,
        dispatcher: Dispatcher,
        sink: Box<dyn InputSink>,
        running: ShutdownFlag,
    ) -> Self {
        let now = Instant::now();
        Self {
            gesture: config.gesture.clone(),
            volume_cooldown: config.gesture.volume_cooldown(),
            media_cooldown: config.gesture.media_cooldown(),
            frame_skip: config.timing.frame_skip.max(1) as u64,
            staleness_timeout: config.timing.staleness_timeout(),
            period: config.timing.vision_period(),
            state,
            drain,
            dispatcher,
            sink,
            click: ClickStateMachine::new(&config.gesture),
            running,
            gauges: None,
            received: 0,
            scroll_ticks: 0,
            last_frame_at: now,
            frames_missing: false,
            last_volume: None,
            last_media: None,
            stats: LoopStats::new("vision"),
            rate: RateMeter::new(now),
        }
    }

    pub fn with_gauges(mut self, gauges: Arc<LoopGauges>) -> Self {
        self.gauges = Some(gauges);
        self
    }

    pub fn click(&self) -> &ClickStateMachine {
        &self.click
    }

    /// Handle one received frame. Returns the mode if the frame was processed,
    /// `None` if it was skipped.
    pub fn on_frame(&mut self, frame: &LandmarkFrame, now: Instant) -> Option<GestureMode> {
        self.received += 1;
        self.last_frame_at = now;
        if self.frames_missing {
            info!("landmark frames resumed");
            self.frames_missing = false;
        }
        if (self.received - 1) % self.frame_skip != 0 {
            return None;
        }
        Some(self.process(frame, now))
    }

    /// No frame arrived. Past the staleness timeout this counts as losing the hand.
    pub fn on_idle(&mut self, now: Instant) {
        let silent = now.saturating_duration_since(self.last_frame_at);
        if silent > self.staleness_timeout && !self.frames_missing {
            warn!(silent_ms = silent.as_millis() as u64, "no landmark frames, releasing input");
            self.frames_missing = true;
            self.hand_lost(now);
        }
    }

    /// Dispatch every queued command. Returns how many were dispatched.
    pub fn dispatch_pending(&mut self) -> usize {
        let commands = self.drain.drain();
        let count = commands.len();
        for command in commands {
            // Handle dropped: the worker reports its own outcome
            drop(self.dispatcher.dispatch(command));
        }
        count
    }

    fn process(&mut self, frame: &LandmarkFrame, now: Instant) -> GestureMode {
        let Some(hand) = frame.hand() else {
            self.hand_lost(now);
            return GestureMode::Idle;
        };

        let reading = GestureReading::from_hand(&hand);
        let observation = HandObservation::new(
            hand.pixel(INDEX_TIP),
            hand.pixel(THUMB_TIP),
            hand.frame_size(),
            now,
        );

        let cursor_active = reading.mode == GestureMode::Cursor;
        if cursor_active {
            let event = self.click.update(reading.pinch_distance, now, self.sink.as_mut());
            if event == ClickEvent::LeftDown {
                self.state.bump_click_epoch();
            }
        } else if self.click.is_engaged() {
            // A finger curling mid-drag changes the mode; opening still releases
            self.click.release_if_open(reading.pinch_distance, now, self.sink.as_mut());
        }
        self.state.publish(observation, reading.mode, cursor_active, now);

        if reading.mode != GestureMode::Scrolling {
            self.scroll_ticks = 0;
        }
        // A held button owns the hand until it is released
        if !self.click.is_engaged() {
            self.gesture_action(reading.mode, &hand, now);
        }

        reading.mode
    }

    fn gesture_action(&mut self, mode: GestureMode, hand: &Hand<'_>, now: Instant) {
        match mode {
            GestureMode::Scrolling => {
                self.scroll_ticks += 1;
                if self.scroll_ticks % self.gesture.scroll_every.max(1) != 0 {
                    return;
                }
                let delta = hand.pixel(MIDDLE_TIP)[1] - hand.frame_size()[1] / 2.0;
                let lines = scroll_lines(delta, self.gesture.scroll_deadzone);
                if lines != 0 {
                    report(self.sink.scroll(lines), "scroll");
                }
            }
            GestureMode::Volume => {
                if !cooled(self.last_volume, self.volume_cooldown, now) {
                    return;
                }
                let pinky_y = hand.normalized(PINKY_TIP)[1];
                let key = if pinky_y < VOLUME_UP_BELOW {
                    KeyToken::VolumeUp
                } else if pinky_y > VOLUME_DOWN_ABOVE {
                    KeyToken::VolumeDown
                } else {
                    return;
                };
                report(self.sink.key_press(key), "volume");
                self.last_volume = Some(now);
            }
            GestureMode::MediaControl => {
                if cooled(self.last_media, self.media_cooldown, now) {
                    report(self.sink.key_press(KeyToken::PlayPause), "play/pause");
                    self.last_media = Some(now);
                }
            }
            GestureMode::Cursor | GestureMode::Idle => {}
        }
    }

    fn hand_lost(&mut self, now: Instant) {
        self.click.emergency_release(self.sink.as_mut());
        self.state.clear(now);
        self.scroll_ticks = 0;
    }

    /// Run until shutdown or until the frame source goes away and shutdown
    /// follows. Returns the loop's timing stats.
    pub fn run(mut self, frames: Receiver<LandmarkFrame>) -> LoopStats {
        let poll = self.staleness_timeout.clamp(Duration::from_millis(1), Duration::from_millis(100));
        let mut source_open = true;
        info!(frame_skip = self.frame_skip, "vision loop started");

        while self.running.is_active() {
            let received = if source_open {
                match frames.recv_timeout(poll) {
                    Ok(frame) => Some(frame),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("landmark source closed");
                        source_open = false;
                        None
                    }
                }
            } else {
                // Keep serving commands at the nominal rate
                thread::sleep(self.period);
                None
            };

            let started = Instant::now();
            let processed = match received {
                Some(frame) => self.on_frame(&frame, started).is_some(),
                None => {
                    self.on_idle(started);
                    false
                }
            };
            self.dispatch_pending();

            if processed {
                self.stats.record(started.elapsed(), self.period);
                if let Some(fps) = self.rate.tick(started) {
                    debug!(fps, "vision rate");
                    if let Some(gauges) = &self.gauges {
                        gauges.vision_fps.store(fps, Ordering::Relaxed);
                    }
                }
            }
        }

        self.hand_lost(Instant::now());
        info!("vision loop stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Command, CommandBus, Intent};
    use crate::dispatch::{ActionError, CommandExecutor};
    use crate::gesture::FingerStates;
    use crate::gesture::fixtures::{hand_frame, pointing};
    use crate::input::{InputEvent, MouseButton, Recorder};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Command>>);

    impl CommandExecutor for Collect {
        fn execute(&self, command: &Command, _context: &str) -> Result<(), ActionError> {
            self.0.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    struct Harness {
        vision: VisionLoop,
        recorder: Recorder,
        bus: CommandBus,
        state: SharedHandState,
        executed: Arc<Collect>,
        _rt: tokio::runtime::Runtime,
    }

    fn harness(frame_skip: u32) -> Harness {
        let mut config = Config::default();
        config.timing.frame_skip = frame_skip;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (bus, drain) = CommandBus::new();
        let state = SharedHandState::new(config.timing.staleness_timeout(), Instant::now());
        let executed = Arc::new(Collect::default());
        let dispatcher = Dispatcher::new(
            rt.handle().clone(),
            executed.clone(),
            bus.context_cell().clone(),
        );
        let recorder = Recorder::new();
        let vision = VisionLoop::new(
            &config,
            state.clone(),
            drain,
            dispatcher,
            Box::new(recorder.clone()),
            bus.shutdown_flag().clone(),
        );
        Harness {
            vision,
            recorder,
            bus,
            state,
            executed,
            _rt: rt,
        }
    }

    fn scrolling() -> FingerStates {
        FingerStates {
            index: true,
            middle: true,
            ring: true,
            ..Default::default()
        }
    }

    fn ms(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn test_scroll_lines_curve() {
        assert_eq!(scroll_lines(30.0, 40.0), 0);
        assert_eq!(scroll_lines(-40.0, 40.0), 0);
        // (60 - 40) / 10 = 2, 2^1.5 = 2.83
        assert_eq!(scroll_lines(-60.0, 40.0), 2);
        assert_eq!(scroll_lines(60.0, 40.0), -2);
    }

    #[test]
    fn test_frame_skip_processes_every_other_frame() {
        let mut h = harness(2);
        let t0 = Instant::now();
        let frame = hand_frame(pointing(), [320.0, 240.0], 80.0);

        let processed: Vec<bool> = (0..4)
            .map(|i| h.vision.on_frame(&frame, ms(t0, i * 16)).is_some())
            .collect();
        assert_eq!(processed, vec![true, false, true, false]);
    }

    #[test]
    fn test_cursor_frame_publishes_state() {
        let mut h = harness(1);
        let t0 = Instant::now();
        let frame = hand_frame(pointing(), [320.0, 240.0], 80.0);

        assert_eq!(h.vision.on_frame(&frame, t0), Some(GestureMode::Cursor));
        let snap = h.state.snapshot(t0);
        assert!(snap.drives_cursor());
        assert_eq!(snap.observation.unwrap().frame, [640.0, 480.0]);
    }

    #[test]
    fn test_press_bumps_click_epoch_and_loss_releases() {
        let mut h = harness(1);
        let t0 = Instant::now();

        h.vision.on_frame(&hand_frame(pointing(), [320.0, 240.0], 20.0), t0);
        assert!(h.vision.click().is_left_down());
        assert_eq!(h.state.snapshot(t0).click_epoch, 1);

        h.vision.on_frame(&LandmarkFrame::empty(640, 480), ms(t0, 33));
        assert!(!h.vision.click().is_left_down());
        assert!(!h.state.snapshot(ms(t0, 33)).detected);
        assert_eq!(
            h.recorder.events(),
            vec![InputEvent::Down(MouseButton::Left), InputEvent::Up(MouseButton::Left)]
        );
    }

    #[test]
    fn test_open_pinch_releases_outside_cursor_mode() {
        let mut h = harness(1);
        let t0 = Instant::now();
        let fist = FingerStates::default();

        h.vision.on_frame(&hand_frame(pointing(), [320.0, 240.0], 20.0), t0);
        h.vision.on_frame(&hand_frame(pointing(), [330.0, 240.0], 40.0), ms(t0, 33));
        assert!(h.vision.click().is_left_down());

        // Index curls mid-drag: still held, and no media action fires
        let mode = h.vision.on_frame(&hand_frame(fist, [330.0, 240.0], 40.0), ms(t0, 66));
        assert_eq!(mode, Some(GestureMode::MediaControl));
        assert!(h.vision.click().is_left_down());
        assert_eq!(h.recorder.count(&InputEvent::Key(KeyToken::PlayPause)), 0);

        // A curled hand cannot press, but opening the pinch releases
        h.vision.on_frame(&hand_frame(fist, [330.0, 240.0], 60.0), ms(t0, 99));
        assert!(!h.vision.click().is_left_down());
        assert_eq!(h.recorder.count(&InputEvent::Down(MouseButton::Left)), 1);
        assert_eq!(h.recorder.count(&InputEvent::Up(MouseButton::Left)), 1);
    }

    #[test]
    fn test_missing_frames_count_as_sensor_loss() {
        let mut h = harness(1);
        let t0 = Instant::now();
        h.vision.on_frame(&hand_frame(pointing(), [320.0, 240.0], 20.0), t0);

        h.vision.on_idle(ms(t0, 50));
        assert!(h.vision.click().is_left_down());

        h.vision.on_idle(ms(t0, 150));
        assert!(!h.vision.click().is_left_down());
        assert_eq!(h.recorder.count(&InputEvent::Up(MouseButton::Left)), 1);

        // Reported once, not on every idle poll
        h.vision.on_idle(ms(t0, 250));
        assert_eq!(h.recorder.count(&InputEvent::Up(MouseButton::Left)), 1);
    }

    #[test]
    fn test_scrolling_every_fourth_frame() {
        let mut h = harness(1);
        let t0 = Instant::now();
        // Middle tip sits at y = 0.3 * 480 = 144, 96 px above centre
        let frame = hand_frame(scrolling(), [320.0, 140.0], 80.0);

        for i in 0..8 {
            assert_eq!(h.vision.on_frame(&frame, ms(t0, i * 33)), Some(GestureMode::Scrolling));
        }
        assert_eq!(h.recorder.events(), vec![InputEvent::Scroll(13), InputEvent::Scroll(13)]);
    }

    #[test]
    fn test_volume_respects_cooldown() {
        let mut h = harness(1);
        let t0 = Instant::now();
        let shaka = FingerStates {
            thumb: true,
            pinky: true,
            ..Default::default()
        };
        let mut frame = hand_frame(shaka, [320.0, 300.0], 80.0);
        if let Some(points) = frame.landmarks.as_mut() {
            points[PINKY_TIP] = [0.65, 0.2];
        }

        assert_eq!(h.vision.on_frame(&frame, t0), Some(GestureMode::Volume));
        h.vision.on_frame(&frame, ms(t0, 33));
        h.vision.on_frame(&frame, ms(t0, 200));

        assert_eq!(h.recorder.count(&InputEvent::Key(KeyToken::VolumeUp)), 2);
    }

    #[test]
    fn test_fist_toggles_media_once_per_cooldown() {
        let mut h = harness(1);
        let t0 = Instant::now();
        let fist = hand_frame(FingerStates::default(), [320.0, 300.0], 80.0);

        for i in 0..10 {
            assert_eq!(h.vision.on_frame(&fist, ms(t0, i * 33)), Some(GestureMode::MediaControl));
        }
        h.vision.on_frame(&fist, ms(t0, 1600));

        assert_eq!(h.recorder.count(&InputEvent::Key(KeyToken::PlayPause)), 2);
    }

    #[test]
    fn test_commands_drained_and_executed_off_loop() {
        let mut h = harness(1);
        h.bus.push(Command::new(Intent::OpenApp, "firefox")).unwrap();
        h.bus.push(Command::new(Intent::Type, "hello")).unwrap();

        assert_eq!(h.vision.dispatch_pending(), 2);
        assert_eq!(h.vision.dispatch_pending(), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.executed.0.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let mut payloads: Vec<String> = h
            .executed
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.payload.text().to_string())
            .collect();
        payloads.sort();
        assert_eq!(payloads, vec!["firefox".to_string(), "hello".to_string()]);
    }

    #[test]
    fn test_run_exits_and_releases_on_shutdown() {
        let h = harness(1);
        let (tx, rx) = flume::bounded(1);
        let running = h.bus.shutdown_flag().clone();
        let recorder = h.recorder.clone();
        let vision = h.vision;

        tx.send(hand_frame(pointing(), [320.0, 240.0], 20.0)).unwrap();
        let handle = thread::spawn(move || vision.run(rx));
        thread::sleep(Duration::from_millis(100));
        running.request_shutdown();

        let stats = handle.join().unwrap();
        assert!(stats.ticks() >= 1);
        assert_eq!(
            recorder.count(&InputEvent::Down(MouseButton::Left)),
            recorder.count(&InputEvent::Up(MouseButton::Left))
        );
        drop(tx);
    }
}
