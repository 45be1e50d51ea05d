use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "aura.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gesture: GestureConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub input: InputConfig,
}

// ============================================================================
// Gesture Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GestureConfig {
    /// Pinch distance (px) below which the left button goes down
    #[serde(default = "default_click_threshold")]
    pub click_threshold: f32,
    /// Pinch distance (px) above which a held button is released
    #[serde(default = "default_release_threshold")]
    pub release_threshold: f32,
    /// Pinch distance (px) below which the smoother switches to precision mode
    #[serde(default = "default_sniper_threshold")]
    pub sniper_threshold: f32,
    /// Continuous pinch duration that upgrades a press to a right-click
    #[serde(default = "default_right_click_hold")]
    pub right_click_hold_secs: f32,
    /// Minimum time between a release and the next press
    #[serde(default = "default_click_debounce")]
    pub click_debounce_secs: f32,
    /// Smoother updates held frozen after a press
    #[serde(default = "default_click_freeze_updates")]
    pub click_freeze_updates: u32,
    #[serde(default = "default_scroll_deadzone")]
    pub scroll_deadzone: f32,
    /// Scroll only on every Nth processed frame
    #[serde(default = "default_scroll_every")]
    pub scroll_every: u32,
    #[serde(default = "default_volume_cooldown")]
    pub volume_cooldown_secs: f32,
    #[serde(default = "default_media_cooldown")]
    pub media_cooldown_secs: f32,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            click_threshold: default_click_threshold(),
            release_threshold: default_release_threshold(),
            sniper_threshold: default_sniper_threshold(),
            right_click_hold_secs: default_right_click_hold(),
            click_debounce_secs: default_click_debounce(),
            click_freeze_updates: default_click_freeze_updates(),
            scroll_deadzone: default_scroll_deadzone(),
            scroll_every: default_scroll_every(),
            volume_cooldown_secs: default_volume_cooldown(),
            media_cooldown_secs: default_media_cooldown(),
        }
    }
}

impl GestureConfig {
    pub fn right_click_hold(&self) -> Duration {
        secs(self.right_click_hold_secs)
    }

    pub fn click_debounce(&self) -> Duration {
        secs(self.click_debounce_secs)
    }

    pub fn volume_cooldown(&self) -> Duration {
        secs(self.volume_cooldown_secs)
    }

    pub fn media_cooldown(&self) -> Duration {
        secs(self.media_cooldown_secs)
    }

    fn durations(&self) -> [(&'static str, f32); 4] {
        [
            ("right_click_hold_secs", self.right_click_hold_secs),
            ("click_debounce_secs", self.click_debounce_secs),
            ("volume_cooldown_secs", self.volume_cooldown_secs),
            ("media_cooldown_secs", self.media_cooldown_secs),
        ]
    }
}

/// Zero for values `validate` rejects
fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or_default()
}

fn default_click_threshold() -> f32 {
    30.0
}
fn default_release_threshold() -> f32 {
    50.0
}
fn default_sniper_threshold() -> f32 {
    45.0
}
fn default_right_click_hold() -> f32 {
    0.5
}
fn default_click_debounce() -> f32 {
    0.15
}
fn default_click_freeze_updates() -> u32 {
    3
}
fn default_scroll_deadzone() -> f32 {
    40.0
}
fn default_scroll_every() -> u32 {
    4
}
fn default_volume_cooldown() -> f32 {
    0.15
}
fn default_media_cooldown() -> f32 {
    1.5
}

// ============================================================================
// Timing Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_vision_hz")]
    pub vision_hz: u32,
    #[serde(default = "default_cursor_hz")]
    pub cursor_hz: u32,
    /// Process every Nth raw capture frame
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default = "default_staleness_timeout_ms")]
    pub staleness_timeout_ms: u64,
    #[serde(default = "default_context_poll_ms")]
    pub context_poll_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            vision_hz: default_vision_hz(),
            cursor_hz: default_cursor_hz(),
            frame_skip: default_frame_skip(),
            staleness_timeout_ms: default_staleness_timeout_ms(),
            context_poll_ms: default_context_poll_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimingConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms)
    }

    pub fn cursor_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.cursor_hz.max(1) as f64)
    }

    pub fn vision_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.vision_hz.max(1) as f64)
    }

    pub fn context_poll(&self) -> Duration {
        Duration::from_millis(self.context_poll_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_vision_hz() -> u32 {
    30
}
fn default_cursor_hz() -> u32 {
    120
}
fn default_frame_skip() -> u32 {
    2
}
fn default_staleness_timeout_ms() -> u64 {
    100
}
fn default_context_poll_ms() -> u64 {
    500
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}

// ============================================================================
// Smoothing Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SmoothingStrategy {
    /// Pinch-adaptive exponential moving average (default)
    #[default]
    Exponential,
    /// Velocity-adaptive cutoff (1€ filter)
    OneEuro,
    /// Constant-velocity Kalman predictor
    Predictive,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmoothingConfig {
    #[serde(default)]
    pub strategy: SmoothingStrategy,
    #[serde(default = "default_alpha_normal")]
    pub alpha_normal: f32,
    #[serde(default = "default_alpha_sniper")]
    pub alpha_sniper: f32,
    #[serde(default = "default_min_cutoff")]
    pub min_cutoff: f32,
    #[serde(default = "default_beta")]
    pub beta: f32,
    #[serde(default = "default_d_cutoff")]
    pub d_cutoff: f32,
    #[serde(default = "default_sniper_min_cutoff")]
    pub sniper_min_cutoff: f32,
    #[serde(default = "default_sniper_beta")]
    pub sniper_beta: f32,
    #[serde(default = "default_process_noise")]
    pub process_noise: f32,
    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            strategy: SmoothingStrategy::default(),
            alpha_normal: default_alpha_normal(),
            alpha_sniper: default_alpha_sniper(),
            min_cutoff: default_min_cutoff(),
            beta: default_beta(),
            d_cutoff: default_d_cutoff(),
            sniper_min_cutoff: default_sniper_min_cutoff(),
            sniper_beta: default_sniper_beta(),
            process_noise: default_process_noise(),
            measurement_noise: default_measurement_noise(),
        }
    }
}

fn default_alpha_normal() -> f32 {
    0.4
}
fn default_alpha_sniper() -> f32 {
    0.15
}
fn default_min_cutoff() -> f32 {
    1.5
}
fn default_beta() -> f32 {
    0.007
}
fn default_d_cutoff() -> f32 {
    1.0
}
fn default_sniper_min_cutoff() -> f32 {
    0.5
}
fn default_sniper_beta() -> f32 {
    0.001
}
fn default_process_noise() -> f32 {
    0.005
}
fn default_measurement_noise() -> f32 {
    0.5
}

// ============================================================================
// Screen Config
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenConfig {
    /// Overrides the display size reported by the input backend
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Camera-edge band (px) that maps outside the screen
    #[serde(default = "default_camera_margin")]
    pub camera_margin: f32,
    /// Flip landmarks horizontally (unmirrored camera feeds)
    #[serde(default)]
    pub mirror_x: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            camera_margin: default_camera_margin(),
            mirror_x: false,
        }
    }
}

fn default_camera_margin() -> f32 {
    70.0
}

// ============================================================================
// Input Config
// ============================================================================

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputBackend {
    /// Log every action instead of injecting it
    #[default]
    Log,
    /// Inject through enigo (requires the `enigo` feature)
    Enigo,
}

impl InputBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "log" => Some(InputBackend::Log),
            "enigo" => Some(InputBackend::Enigo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct InputConfig {
    #[serde(default)]
    pub backend: InputBackend,
}

// ============================================================================
// Actions Config
// ============================================================================

/// Launcher command templates; `{}` is replaced with the payload
#[derive(Debug, Clone, Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_open_app")]
    pub open_app: Vec<String>,
    #[serde(default = "default_close_app")]
    pub close_app: Vec<String>,
    #[serde(default = "default_open_url")]
    pub open_url: Vec<String>,
    /// Empty means "stop the control system only"
    #[serde(default)]
    pub shutdown: Vec<String>,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            open_app: default_open_app(),
            close_app: default_close_app(),
            open_url: default_open_url(),
            shutdown: Vec::new(),
        }
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(target_os = "macos")]
fn default_open_app() -> Vec<String> {
    strings(&["open", "-a", "{}"])
}
#[cfg(not(target_os = "macos"))]
fn default_open_app() -> Vec<String> {
    strings(&["gtk-launch", "{}"])
}

fn default_close_app() -> Vec<String> {
    strings(&["pkill", "-i", "-f", "{}"])
}

#[cfg(target_os = "macos")]
fn default_open_url() -> Vec<String> {
    strings(&["open", "{}"])
}
#[cfg(not(target_os = "macos"))]
fn default_open_url() -> Vec<String> {
    strings(&["xdg-open", "{}"])
}

impl Config {
    /// Load from `path`. A missing file yields defaults; an unreadable or
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.gesture;
        let positive = g.click_threshold.is_finite() && g.click_threshold > 0.0;
        if !positive || !g.release_threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "click_threshold ({}) must be positive and release_threshold ({}) finite",
                g.click_threshold, g.release_threshold
            )));
        }
        if g.release_threshold <= g.click_threshold {
            return Err(ConfigError::Invalid(format!(
                "release_threshold ({}) must exceed click_threshold ({})",
                g.release_threshold, g.click_threshold
            )));
        }

        for (name, value) in g.durations() {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({value}) must be a non-negative number of seconds"
                )));
            }
        }

        let s = &self.smoothing;
        let in_range = |a: f32| a > 0.0 && a <= 1.0;
        if !in_range(s.alpha_normal) || !in_range(s.alpha_sniper) {
            return Err(ConfigError::Invalid(
                "smoothing alphas must be in (0, 1]".to_string(),
            ));
        }
        if s.alpha_normal <= s.alpha_sniper {
            return Err(ConfigError::Invalid(format!(
                "alpha_normal ({}) must exceed alpha_sniper ({})",
                s.alpha_normal, s.alpha_sniper
            )));
        }

        let t = &self.timing;
        if t.vision_hz == 0 || t.cursor_hz == 0 || t.frame_skip == 0 {
            return Err(ConfigError::Invalid(
                "loop rates and frame_skip must be positive".to_string(),
            ));
        }
        if t.staleness_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "staleness_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
