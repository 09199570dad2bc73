//! Persisted key-value preferences shared between the foreground settings
//! commands and the background loop.
//!
//! Each process keeps its own in-memory copy; `reload()` re-reads the
//! durable file. Writes merge only the touched keys into the current file
//! contents while holding an exclusive lock on a `.lock` sidecar, so
//! concurrent writers of disjoint keys never clobber each other, even across
//! processes (last write wins per key).

use crate::model::{
    MAX_REPEAT_COUNT, MIN_REPEAT_COUNT, MINUTES_PER_DAY, QuietWindow, ScheduleConfig,
    ScheduleState, TimeOfDay, VoiceSettings,
};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefKey {
    IntervalMinutes,
    QuietModeEnabled,
    QuietStartHour,
    QuietStartMinute,
    QuietEndHour,
    QuietEndMinute,
    Language,
    Volume,
    Rate,
    RepeatCount,
    VibrationEnabled,
    Use24HourFormat,
    ServiceRunning,
    NextAnnouncementTime,
    LastAnnouncementTime,
    LastHeartbeat,
    LastSpokenText,
    BootCompleted,
    BootCompletedAt,
    BackupAlarmArmed,
    BackupAlarmIntervalMinutes,
}

impl PrefKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IntervalMinutes => "intervalMinutes",
            Self::QuietModeEnabled => "quietModeEnabled",
            Self::QuietStartHour => "quietStartHour",
            Self::QuietStartMinute => "quietStartMinute",
            Self::QuietEndHour => "quietEndHour",
            Self::QuietEndMinute => "quietEndMinute",
            Self::Language => "language",
            Self::Volume => "volume",
            Self::Rate => "rate",
            Self::RepeatCount => "repeatCount",
            Self::VibrationEnabled => "vibrationEnabled",
            Self::Use24HourFormat => "use24HourFormat",
            Self::ServiceRunning => "serviceRunning",
            Self::NextAnnouncementTime => "nextAnnouncementTimeEpochMillis",
            Self::LastAnnouncementTime => "lastAnnouncementTimeEpochMillis",
            Self::LastHeartbeat => "lastHeartbeatEpochMillis",
            Self::LastSpokenText => "lastSpokenText",
            Self::BootCompleted => "bootCompleted",
            Self::BootCompletedAt => "bootCompletedAtEpochMillis",
            Self::BackupAlarmArmed => "backupAlarmArmed",
            Self::BackupAlarmIntervalMinutes => "backupAlarmIntervalMinutes",
        }
    }
}

/// Durable storage with explicit re-read semantics.
///
/// `Value::Null` is treated the same as an absent key.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: PrefKey) -> Option<Value>;
    fn set_many(&self, entries: &[(PrefKey, Value)]) -> Result<()>;
    fn reload(&self) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Self {
        let cache = match read_map(&path) {
            Ok(map) => map,
            Err(err) => {
                warn!("Preferences at {} unreadable, using defaults: {err:#}", path.display());
                Map::new()
            }
        };
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    /// Exclusive advisory lock over the read-merge-write cycle. Released
    /// when the returned handle is dropped.
    fn lock_writers(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = sidecar_lock_path(&self.path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;
        file.lock()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;
        Ok(file)
    }
}

fn sidecar_lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn read_map(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read preferences: {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow::anyhow!(
            "preferences root is not an object: {}",
            path.display()
        )),
    }
}

fn write_map_atomic(path: &Path, map: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let text = serde_json::to_string_pretty(map)?;
    std::fs::write(&tmp, text)
        .with_context(|| format!("failed to write preferences: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace preferences: {}", path.display()))?;
    Ok(())
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: PrefKey) -> Option<Value> {
        lock(&self.cache)
            .get(key.as_str())
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn set_many(&self, entries: &[(PrefKey, Value)]) -> Result<()> {
        let mut cache = lock(&self.cache);
        let _writer = self.lock_writers()?;
        let mut on_disk = read_map(&self.path).unwrap_or_else(|_| cache.clone());
        for (key, value) in entries {
            on_disk.insert(key.as_str().to_string(), value.clone());
        }
        write_map_atomic(&self.path, &on_disk)?;
        *cache = on_disk;
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        match read_map(&self.path) {
            Ok(map) => {
                *lock(&self.cache) = map;
                Ok(())
            }
            Err(err) => {
                lock(&self.cache).clear();
                Err(err)
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: PrefKey) -> Option<Value> {
        lock(&self.map)
            .get(key.as_str())
            .filter(|v| !v.is_null())
            .cloned()
    }

    fn set_many(&self, entries: &[(PrefKey, Value)]) -> Result<()> {
        let mut map = lock(&self.map);
        for (key, value) in entries {
            map.insert(key.as_str().to_string(), value.clone());
        }
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }
}

fn opt_ms(value: Option<i64>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

/// Typed view over a [`KeyValueStore`]. Invalid or missing values fall back
/// to the first-launch defaults.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Re-reads durable storage. On failure the view resets to defaults.
    pub fn reload(&self) -> bool {
        match self.store.reload() {
            Ok(()) => true,
            Err(err) => {
                warn!("Preference reload failed, falling back to defaults: {err:#}");
                false
            }
        }
    }

    pub fn write(&self, entries: &[(PrefKey, Value)]) -> Result<()> {
        self.store.set_many(entries)
    }

    fn read_bool(&self, key: PrefKey, default: bool) -> bool {
        match self.store.get(key) {
            None => default,
            Some(Value::Bool(v)) => v,
            Some(other) => {
                warn!("Ignoring {}={other}: expected a boolean", key.as_str());
                default
            }
        }
    }

    fn read_u32(&self, key: PrefKey, default: u32, max: u32) -> u32 {
        match self.store.get(key) {
            None => default,
            Some(value) => match value.as_u64() {
                Some(v) if v <= u64::from(max) => v as u32,
                _ => {
                    warn!("Ignoring {}={value}: expected 0..={max}", key.as_str());
                    default
                }
            },
        }
    }

    fn read_unit_f32(&self, key: PrefKey, default: f32) -> f32 {
        match self.store.get(key) {
            None => default,
            Some(value) => match value.as_f64() {
                Some(v) if (0.0..=1.0).contains(&v) => v as f32,
                _ => {
                    warn!("Ignoring {}={value}: expected 0.0..=1.0", key.as_str());
                    default
                }
            },
        }
    }

    fn read_ms(&self, key: PrefKey) -> Option<i64> {
        let value = self.store.get(key)?;
        let ms = value.as_i64();
        if ms.is_none() {
            warn!("Ignoring {}={value}: expected epoch millis", key.as_str());
        }
        ms
    }

    fn read_string(&self, key: PrefKey) -> Option<String> {
        match self.store.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s),
            Value::String(_) => None,
            other => {
                warn!("Ignoring {}={other}: expected a string", key.as_str());
                None
            }
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        let defaults = ScheduleConfig::default();
        let repeat_count = match self.store.get(PrefKey::RepeatCount) {
            None => defaults.repeat_count,
            Some(value) => match value.as_u64() {
                Some(v) if (u64::from(MIN_REPEAT_COUNT)..=u64::from(MAX_REPEAT_COUNT))
                    .contains(&v) =>
                {
                    v as u32
                }
                _ => {
                    warn!("Ignoring repeatCount={value}: expected 1..=5");
                    defaults.repeat_count
                }
            },
        };
        let use_24_hour = match self.store.get(PrefKey::Use24HourFormat) {
            Some(Value::Bool(v)) => Some(v),
            _ => None,
        };
        ScheduleConfig {
            interval_minutes: self.read_u32(
                PrefKey::IntervalMinutes,
                defaults.interval_minutes,
                MINUTES_PER_DAY,
            ),
            repeat_count,
            voice: VoiceSettings {
                language: self
                    .read_string(PrefKey::Language)
                    .unwrap_or(defaults.voice.language),
                volume: self.read_unit_f32(PrefKey::Volume, defaults.voice.volume),
                rate: self.read_unit_f32(PrefKey::Rate, defaults.voice.rate),
            },
            vibration_enabled: self
                .read_bool(PrefKey::VibrationEnabled, defaults.vibration_enabled),
            use_24_hour,
        }
    }

    pub fn save_schedule_config(&self, config: &ScheduleConfig) -> Result<()> {
        self.write(&[
            (PrefKey::IntervalMinutes, Value::from(config.interval_minutes)),
            (PrefKey::RepeatCount, Value::from(config.repeat_count)),
            (PrefKey::Language, Value::from(config.voice.language.clone())),
            (PrefKey::Volume, Value::from(f64::from(config.voice.volume))),
            (PrefKey::Rate, Value::from(f64::from(config.voice.rate))),
            (PrefKey::VibrationEnabled, Value::from(config.vibration_enabled)),
            (
                PrefKey::Use24HourFormat,
                config.use_24_hour.map(Value::from).unwrap_or(Value::Null),
            ),
        ])
    }

    pub fn quiet_window(&self) -> QuietWindow {
        let defaults = QuietWindow::default();
        QuietWindow {
            enabled: self.read_bool(PrefKey::QuietModeEnabled, defaults.enabled),
            start: TimeOfDay::new(
                self.read_u32(PrefKey::QuietStartHour, defaults.start.hour, 23),
                self.read_u32(PrefKey::QuietStartMinute, defaults.start.minute, 59),
            ),
            end: TimeOfDay::new(
                self.read_u32(PrefKey::QuietEndHour, defaults.end.hour, 23),
                self.read_u32(PrefKey::QuietEndMinute, defaults.end.minute, 59),
            ),
        }
    }

    pub fn save_quiet_window(&self, window: &QuietWindow) -> Result<()> {
        self.write(&[
            (PrefKey::QuietModeEnabled, Value::from(window.enabled)),
            (PrefKey::QuietStartHour, Value::from(window.start.hour)),
            (PrefKey::QuietStartMinute, Value::from(window.start.minute)),
            (PrefKey::QuietEndHour, Value::from(window.end.hour)),
            (PrefKey::QuietEndMinute, Value::from(window.end.minute)),
        ])
    }

    pub fn schedule_state(&self) -> ScheduleState {
        ScheduleState {
            next_announcement_ms: self.read_ms(PrefKey::NextAnnouncementTime),
            last_announcement_ms: self.read_ms(PrefKey::LastAnnouncementTime),
            running: self.read_bool(PrefKey::ServiceRunning, false),
            last_heartbeat_ms: self.read_ms(PrefKey::LastHeartbeat),
        }
    }

    pub fn set_next_announcement(&self, next_ms: Option<i64>) -> Result<()> {
        self.write(&[(PrefKey::NextAnnouncementTime, opt_ms(next_ms))])
    }

    pub fn record_heartbeat(&self, now_ms: i64) -> Result<()> {
        self.write(&[(PrefKey::LastHeartbeat, Value::from(now_ms))])
    }

    pub fn last_spoken_text(&self) -> Option<String> {
        self.read_string(PrefKey::LastSpokenText)
    }

    pub fn boot_completed_at(&self) -> Option<i64> {
        if self.read_bool(PrefKey::BootCompleted, false) {
            self.read_ms(PrefKey::BootCompletedAt)
        } else {
            None
        }
    }

    /// Interval registered with the backup alarm, if armed.
    pub fn backup_alarm(&self) -> Option<u32> {
        if self.read_bool(PrefKey::BackupAlarmArmed, false) {
            Some(self.read_u32(PrefKey::BackupAlarmIntervalMinutes, 0, MINUTES_PER_DAY))
        } else {
            None
        }
    }
}
