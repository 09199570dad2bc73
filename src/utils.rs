use chrono::{DateTime, Local, TimeZone, Utc};
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "SPEAKING_CLOCK_HOME";

pub fn ensure_dir(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Resolves `$SPEAKING_CLOCK_HOME`, falling back to `~/.speaking-clock`.
pub fn get_data_path() -> std::io::Result<PathBuf> {
    if let Ok(custom) = std::env::var(DATA_DIR_ENV)
        && !custom.trim().is_empty()
    {
        return ensure_dir(&expand_tilde(custom.trim()));
    }
    let home =
        dirs::home_dir().ok_or_else(|| std::io::Error::other("cannot resolve home directory"))?;
    ensure_dir(&home.join(".speaking-clock"))
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Seconds from config as epoch-millis arithmetic, saturating at `i64::MAX`.
pub fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

pub fn local_from_ms(ms: i64) -> Option<DateTime<Local>> {
    Local.timestamp_millis_opt(ms).single()
}

pub fn describe_ms(ms: Option<i64>) -> String {
    match ms.and_then(local_from_ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".to_string(),
    }
}

/// Parses `HH:MM` into an hour/minute pair.
pub fn parse_hh_mm(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (h, m) = raw
        .trim()
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected HH:MM, got {raw:?}"))?;
    let hour: u32 = h.trim().parse()?;
    let minute: u32 = m.trim().parse()?;
    if hour > 23 || minute > 59 {
        return Err(anyhow::anyhow!("time of day out of range: {raw}"));
    }
    Ok((hour, minute))
}
