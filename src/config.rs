use crate::utils::{get_data_path, secs_to_ms};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub poll_interval_secs: u64,
    pub double_fire_guard_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_grace_secs: u64,
    pub control_queue_capacity: usize,
    /// How long a foreground command waits on the running loop's control
    /// socket before applying the change itself.
    pub control_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            double_fire_guard_secs: 30,
            health_check_interval_secs: 5 * 60,
            health_grace_secs: 60,
            control_queue_capacity: 64,
            control_timeout_secs: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs.max(1))
    }

    /// Heartbeats older than this mean the primary loop is gone.
    pub fn liveness_window_ms(&self) -> i64 {
        secs_to_ms(
            self.health_check_interval_secs
                .saturating_add(self.health_grace_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnouncerConfig {
    pub repeat_delay_ms: u64,
    pub vibration_ms: u64,
    pub notification_title: String,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            repeat_delay_ms: 2500,
            vibration_ms: 200,
            notification_title: "Speaking Clock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpeechConfig {
    /// Program to run per utterance. Empty or `log` writes to the log instead.
    pub command: String,
    /// Supports `{text}`, `{language}`, `{volume}`, `{rate}`, `{amplitude}`, `{wpm}`.
    pub args: Vec<String>,
    pub fallback_language: String,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            command: "espeak-ng".to_string(),
            args: ["-v", "{language}", "-a", "{amplitude}", "-s", "{wpm}", "{text}"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            fallback_language: "en".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationConfig {
    pub desktop: bool,
    pub status_file: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            desktop: false,
            status_file: "notification.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub announcer: AnnouncerConfig,
    pub speech: SpeechConfig,
    pub notification: NotificationConfig,
}

impl Config {
    pub fn prefs_path(&self) -> Result<PathBuf> {
        Ok(get_data_path()?.join("prefs.json"))
    }

    /// Held by the running primary loop, see [`crate::survival::PrimaryLock`].
    pub fn primary_lock_path(&self) -> Result<PathBuf> {
        Ok(get_data_path()?.join("primary.lock"))
    }

    /// Port and pid of the running loop's control socket.
    pub fn control_endpoint_path(&self) -> Result<PathBuf> {
        Ok(get_data_path()?.join("control.json"))
    }

    pub fn notification_path(&self) -> Result<PathBuf> {
        Ok(get_data_path()?.join(&self.notification.status_file))
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_path()?.join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    migrate_config(&mut value);
    let config = serde_json::from_value(value).context("failed to parse config structure")?;
    Ok(config)
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, text)?;
    Ok(())
}

// Early configs kept the poll and repeat settings at the top level.
fn migrate_config(value: &mut Value) {
    let Some(root) = value.as_object_mut() else {
        return;
    };
    for (legacy, section, field) in [
        ("pollIntervalSecs", "runtime", "pollIntervalSecs"),
        ("repeatDelayMs", "announcer", "repeatDelayMs"),
    ] {
        let Some(v) = root.remove(legacy) else {
            continue;
        };
        let target = root
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(obj) = target.as_object_mut() {
            obj.entry(field.to_string()).or_insert(v);
        }
    }
}
