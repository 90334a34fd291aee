use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// Upper bound on minute-by-minute search steps. Four years of day-skips plus
/// hour/minute refinement fits comfortably; impossible dates (`0 0 30 2 *`)
/// give up instead of spinning.
const MAX_SEARCH_STEPS: usize = 50_000;

/// When a job should run. Evaluated locally by every runner, always in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronSchedule {
    /// Standard five-field cron expression.
    Cron(CronFields),
    /// Fixed interval anchored at the Unix epoch, so all runners agree on slots.
    Every(Duration),
}

/// Bitsets of the allowed values per cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronFields {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DOM: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"],
};
// 7 is accepted as Sunday and folded onto 0 after parsing.
const DOW: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

impl CronSchedule {
    /// Parse a cron expression, an `@alias`, or `@every <N>{s|m|h}`.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        let expanded = match expr {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => {
                if let Some(rest) = other.strip_prefix("@every") {
                    return parse_every(rest.trim()).map(CronSchedule::Every);
                }
                if other.starts_with('@') {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "unknown alias: {other}"
                    )));
                }
                other
            }
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "expected 5 fields, got {}: {expr}",
                parts.len()
            )));
        }

        let minutes = parse_field(parts[0], &MINUTE)?;
        let hours = parse_field(parts[1], &HOUR)?;
        let days_of_month = parse_field(parts[2], &DOM)?;
        let months = parse_field(parts[3], &MONTH)?;
        let mut days_of_week = parse_field(parts[4], &DOW)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(CronSchedule::Cron(CronFields {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        }))
    }

    /// First slot strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronSchedule::Every(period) => {
                let period_ms = period.as_millis() as i64;
                let t = after.timestamp_millis();
                let next = (t.div_euclid(period_ms) + 1) * period_ms;
                DateTime::from_timestamp_millis(next)
            }
            CronSchedule::Cron(fields) => fields.next_after(after),
        }
    }

    /// Latest slot in `(since, now]`, if any. Several missed slots coalesce
    /// into the most recent one.
    pub fn due_slot(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= since {
            return None;
        }
        match self {
            CronSchedule::Every(period) => {
                let period_ms = period.as_millis() as i64;
                let latest = now.timestamp_millis().div_euclid(period_ms) * period_ms;
                let latest = DateTime::from_timestamp_millis(latest)?;
                (latest > since).then_some(latest)
            }
            CronSchedule::Cron(_) => {
                let mut slot = self.next_after(since).filter(|s| *s <= now)?;
                while let Some(next) = self.next_after(slot).filter(|s| *s <= now) {
                    slot = next;
                }
                Some(slot)
            }
        }
    }

    /// Gap between `slot` and the following one; used to size tolerance windows.
    pub fn spacing_after(&self, slot: DateTime<Utc>) -> Option<Duration> {
        let next = self.next_after(slot)?;
        (next - slot).to_std().ok()
    }
}

impl CronFields {
    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom_ok = self.days_of_month & (1 << t.day()) != 0;
        let dow_ok = self.days_of_week & (1 << t.weekday().num_days_from_sunday()) != 0;
        // Classic cron: when both day fields are restricted, either may match.
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Start at the top of the following minute.
        let mut t = after
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(ChronoDuration::minutes(1))?;

        for _ in 0..MAX_SEARCH_STEPS {
            if self.months & (1 << t.month()) == 0 {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = start_of_day(t)?.checked_add_signed(ChronoDuration::days(1))?;
                continue;
            }
            if self.hours & (1 << t.hour()) == 0 {
                t = t.with_minute(0)?.checked_add_signed(ChronoDuration::hours(1))?;
                continue;
            }
            if self.minutes & (1 << t.minute()) == 0 {
                t = t.checked_add_signed(ChronoDuration::minutes(1))?;
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0).single()
}

fn parse_every(spec: &str) -> Result<Duration> {
    let invalid = || SchedulerError::InvalidSchedule(format!("bad @every interval: {spec:?}"));
    let split = spec.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (num, unit) = spec.split_at(split);
    let n: u64 = num.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(invalid()),
    };
    if secs == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

fn parse_value(token: &str, spec: &FieldSpec) -> Result<u32> {
    let upper = token.to_ascii_uppercase();
    if let Some(pos) = spec.names.iter().position(|n| *n == upper) {
        // Month names start at 1, weekday names at 0.
        return Ok(pos as u32 + spec.min);
    }
    let v: u32 = token.parse().map_err(|_| {
        SchedulerError::InvalidSchedule(format!("bad {} value: {token:?}", spec.name))
    })?;
    if v < spec.min || v > spec.max {
        return Err(SchedulerError::InvalidSchedule(format!(
            "{} value {v} out of range {}-{}",
            spec.name, spec.min, spec.max
        )));
    }
    Ok(v)
}

/// Parse one comma-separated field into a bitset (bit N = value N allowed).
fn parse_field(field: &str, spec: &FieldSpec) -> Result<u64> {
    let mut bits = 0u64;
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| {
                    SchedulerError::InvalidSchedule(format!("bad step in {} field: {item:?}", spec.name))
                })?;
                if step == 0 {
                    return Err(SchedulerError::InvalidSchedule(format!(
                        "zero step in {} field",
                        spec.name
                    )));
                }
                (r, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, if spec.name == "day-of-week" { 6 } else { spec.max })
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "reversed range in {} field: {item:?}",
                    spec.name
                )));
            }
            (a, b)
        } else {
            let v = parse_value(range, spec)?;
            // `5/15` means "from 5 to the end, every 15".
            (v, if step.is_some() { spec.max } else { v })
        };

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            bits |= 1 << v;
            v += step;
        }
    }
    if bits == 0 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "empty {} field",
            spec.name
        )));
    }
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn every_six_hours() {
        let s = CronSchedule::parse("0 */6 * * *").unwrap();
        assert_eq!(
            s.next_after(at("2025-03-01T05:59:00Z")),
            Some(at("2025-03-01T06:00:00Z"))
        );
        assert_eq!(
            s.next_after(at("2025-03-01T06:00:00Z")),
            Some(at("2025-03-01T12:00:00Z"))
        );
        assert_eq!(
            s.next_after(at("2025-03-01T18:30:00Z")),
            Some(at("2025-03-02T00:00:00Z"))
        );
    }

    #[test]
    fn next_after_is_strict() {
        let s = CronSchedule::parse("30 2 * * *").unwrap();
        let slot = at("2025-06-10T02:30:00Z");
        assert_eq!(s.next_after(slot), Some(at("2025-06-11T02:30:00Z")));
        assert_eq!(s.next_after(at("2025-06-10T02:29:59Z")), Some(slot));
    }

    #[test]
    fn weekday_names_and_sunday_as_seven() {
        let named = CronSchedule::parse("0 9 * * MON-FRI").unwrap();
        let numeric = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(named, numeric);

        let sunday = CronSchedule::parse("0 0 * * 7").unwrap();
        // 2025-03-01 is a Saturday.
        assert_eq!(
            sunday.next_after(at("2025-03-01T12:00:00Z")),
            Some(at("2025-03-02T00:00:00Z"))
        );
    }

    #[test]
    fn month_names_map_to_calendar_months() {
        let s = CronSchedule::parse("0 0 1 MAR *").unwrap();
        assert_eq!(
            s.next_after(at("2025-01-15T00:00:00Z")),
            Some(at("2025-03-01T00:00:00Z"))
        );
    }

    #[test]
    fn dom_and_dow_both_restricted_use_or() {
        // The 15th, or any Monday.
        let s = CronSchedule::parse("0 0 15 * 1").unwrap();
        // 2025-03-10 is a Monday, before the 15th.
        assert_eq!(
            s.next_after(at("2025-03-09T00:00:00Z")),
            Some(at("2025-03-10T00:00:00Z"))
        );
        assert_eq!(
            s.next_after(at("2025-03-11T00:00:00Z")),
            Some(at("2025-03-15T00:00:00Z"))
        );
    }

    #[test]
    fn aliases_expand() {
        assert_eq!(
            CronSchedule::parse("@daily").unwrap(),
            CronSchedule::parse("0 0 * * *").unwrap()
        );
        assert_eq!(
            CronSchedule::parse("@hourly").unwrap(),
            CronSchedule::parse("0 * * * *").unwrap()
        );
    }

    #[test]
    fn every_interval_is_epoch_anchored() {
        let s = CronSchedule::parse("@every 10m").unwrap();
        assert_eq!(s, CronSchedule::Every(Duration::from_secs(600)));
        assert_eq!(
            s.next_after(at("2025-03-01T00:04:59Z")),
            Some(at("2025-03-01T00:10:00Z"))
        );
        assert_eq!(
            s.next_after(at("2025-03-01T00:10:00Z")),
            Some(at("2025-03-01T00:20:00Z"))
        );
    }

    #[test]
    fn due_slot_coalesces_missed_slots() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let since = at("2025-03-01T00:01:00Z");
        assert_eq!(
            s.due_slot(since, at("2025-03-01T00:17:30Z")),
            Some(at("2025-03-01T00:15:00Z"))
        );
        assert_eq!(s.due_slot(since, at("2025-03-01T00:04:59Z")), None);
        assert_eq!(s.due_slot(since, since), None);

        let every = CronSchedule::parse("@every 30s").unwrap();
        assert_eq!(
            every.due_slot(at("2025-03-01T00:00:00Z"), at("2025-03-01T00:01:10Z")),
            Some(at("2025-03-01T00:01:00Z"))
        );
        assert_eq!(
            every.due_slot(at("2025-03-01T00:01:00Z"), at("2025-03-01T00:01:10Z")),
            None
        );
    }

    #[test]
    fn impossible_date_yields_none() {
        let s = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(s.next_after(at("2025-01-01T00:00:00Z")), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "* * * *",
            "60 * * * *",
            "* 24 * * *",
            "*/0 * * * *",
            "5-1 * * * *",
            "@fortnightly",
            "@every 0s",
            "@every 5d",
            "0 0 0 * *",
        ] {
            assert!(CronSchedule::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}
