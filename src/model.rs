use serde::{Deserialize, Serialize};

pub const MIN_REPEAT_COUNT: u32 = 1;
pub const MAX_REPEAT_COUNT: u32 = 5;
pub const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub language: String,
    pub volume: f32,
    pub rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            volume: 1.0,
            rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    /// 0 disables scheduled announcements.
    pub interval_minutes: u32,
    pub repeat_count: u32,
    pub voice: VoiceSettings,
    pub vibration_enabled: bool,
    /// `None` follows the locale.
    pub use_24_hour: Option<bool>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 0,
            repeat_count: 2,
            voice: VoiceSettings::default(),
            vibration_enabled: false,
            use_24_hour: None,
        }
    }
}

impl ScheduleConfig {
    pub fn is_enabled(&self) -> bool {
        self.interval_minutes > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self {
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    pub fn minutes(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietWindow {
    pub enabled: bool,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Default for QuietWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            start: TimeOfDay::new(22, 0),
            end: TimeOfDay::new(7, 0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub next_announcement_ms: Option<i64>,
    pub last_announcement_ms: Option<i64>,
    pub running: bool,
    pub last_heartbeat_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Armed,
    Disabled,
}

impl LoopState {
    pub fn of(config: &ScheduleConfig, state: &ScheduleState) -> Self {
        if config.is_enabled() && state.running {
            Self::Armed
        } else {
            Self::Disabled
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Armed => write!(f, "ARMED"),
            Self::Disabled => write!(f, "DISABLED"),
        }
    }
}
