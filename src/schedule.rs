//! Wall-clock aligned boundary computation.
//!
//! Boundaries are multiples of the interval counted from local midnight, so
//! an interval of 15 always lands on :00/:15/:30/:45 no matter when the
//! schedule was configured. Intervals that do not divide 1440 are accepted;
//! their boundaries restart at every midnight and drift relative to the hour.

use crate::model::MINUTES_PER_DAY;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike};

/// Next boundary strictly after `from`, with seconds truncated to zero.
///
/// `interval_minutes` is clamped to `1..=1440`.
pub fn next_boundary<Tz: TimeZone>(interval_minutes: u32, from: &DateTime<Tz>) -> DateTime<Tz> {
    let interval = interval_minutes.clamp(1, MINUTES_PER_DAY);
    aligned_boundary(interval, from)
        .filter(|next| next > from)
        .unwrap_or_else(|| from.clone() + Duration::minutes(i64::from(interval)))
}

/// The next `count` boundaries after `from`.
pub fn upcoming<Tz: TimeZone>(
    interval_minutes: u32,
    from: &DateTime<Tz>,
    count: usize,
) -> Vec<DateTime<Tz>> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = from.clone();
    for _ in 0..count {
        cursor = next_boundary(interval_minutes, &cursor);
        out.push(cursor.clone());
    }
    out
}

fn aligned_boundary<Tz: TimeZone>(interval: u32, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let local = from.naive_local();
    let minutes_today = local.hour() * 60 + local.minute();
    let total = (minutes_today / interval + 1) * interval;

    let (date, minute_of_day) = if total >= MINUTES_PER_DAY {
        (local.date().succ_opt()?, total % MINUTES_PER_DAY)
    } else {
        (local.date(), total)
    };
    let time = NaiveTime::from_num_seconds_from_midnight_opt(minute_of_day * 60, 0)?;
    resolve_local(&from.timezone(), date.and_time(time), from)
}

// DST gaps push the boundary past the missing hour; repeated hours pick the
// first instant that is still ahead of `after`.
fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    naive: NaiveDateTime,
    after: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let mut candidate = naive;
    for _ in 0..3 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Some(dt),
            LocalResult::Ambiguous(a, b) => return earliest_after([a, b], after),
            LocalResult::None => candidate += Duration::hours(1),
        }
    }
    None
}

fn earliest_after<T: PartialOrd>(candidates: [T; 2], after: &T) -> Option<T> {
    candidates
        .into_iter()
        .filter(|c| c > after)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}
