use crate::model::{QuietWindow, TimeOfDay};
use chrono::{DateTime, TimeZone, Timelike};

/// Whether `now` falls inside `[start, end)`.
///
/// `start > end` spans midnight. `start == end` covers the whole day.
pub fn is_quiet<Tz: TimeZone>(now: &DateTime<Tz>, start: TimeOfDay, end: TimeOfDay) -> bool {
    let local = now.naive_local();
    is_quiet_minutes(local.hour() * 60 + local.minute(), start.minutes(), end.minutes())
}

pub fn is_quiet_minutes(now: u32, start: u32, end: u32) -> bool {
    if start == end {
        true
    } else if start < end {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

impl QuietWindow {
    /// Disabled windows never suppress anything.
    pub fn contains<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.enabled && is_quiet(now, self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, 0).unwrap()
    }

    #[test]
    fn overnight_window() {
        let start = TimeOfDay::new(22, 0);
        let end = TimeOfDay::new(7, 0);
        assert!(is_quiet(&at(23, 30), start, end));
        assert!(is_quiet(&at(6, 59), start, end));
        assert!(is_quiet(&at(22, 0), start, end));
        assert!(!is_quiet(&at(7, 0), start, end));
        assert!(!is_quiet(&at(21, 59), start, end));
    }

    #[test]
    fn same_day_window() {
        let start = TimeOfDay::new(12, 0);
        let end = TimeOfDay::new(13, 30);
        assert!(is_quiet(&at(12, 0), start, end));
        assert!(is_quiet(&at(13, 29), start, end));
        assert!(!is_quiet(&at(13, 30), start, end));
        assert!(!is_quiet(&at(11, 59), start, end));
    }

    #[test]
    fn equal_start_and_end_is_quiet_all_day() {
        let t = TimeOfDay::new(8, 0);
        assert!(is_quiet(&at(8, 0), t, t));
        assert!(is_quiet(&at(3, 12), t, t));
        assert!(is_quiet(&at(23, 59), t, t));
    }

    #[test]
    fn total_and_stable_over_every_minute() {
        for start in (0..1440).step_by(45) {
            for end in (0..1440).step_by(45) {
                for now in 0..1440 {
                    let first = is_quiet_minutes(now, start, end);
                    assert_eq!(first, is_quiet_minutes(now, start, end));
                }
            }
        }
    }

    #[test]
    fn disabled_window_never_quiet() {
        let window = QuietWindow {
            enabled: false,
            ..QuietWindow::default()
        };
        assert!(!window.contains(&at(23, 30)));
        let enabled = QuietWindow {
            enabled: true,
            ..window
        };
        assert!(enabled.contains(&at(23, 30)));
    }
}
