//! 时间表达式归一化：把调用方传入的各种时间写法统一成纳秒级 Unix 时间戳。
//!
//! Accepted forms, first match wins:
//!
//! 1. `now`
//! 2. `now` followed by a signed offset, e.g. `now-1h`, `now+30m`, `now-7d`
//!    (units `s`, `m`, `h`, `d`, `w`)
//! 3. ISO-8601 / RFC3339, e.g. `2024-01-01T00:00:00Z`, `2024-01-01T08:00:00.5+08:00`
//! 4. Unix seconds as a decimal string, e.g. `1700000000` or `1700000000.25`
//!
//! Anything else resolves to the evaluation instant and is reported as
//! [`TimeKind::Fallback`] instead of an error, so one bad bound never aborts a
//! query.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use tracing::warn;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Integers with at least this many digits are read as epoch nanoseconds.
const NANO_EPOCH_DIGITS: usize = 19;

/// 表达式被识别成了哪种形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Now,
    Relative,
    Absolute,
    Epoch,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalized {
    pub nanos: i64,
    pub kind: TimeKind,
}

impl Normalized {
    pub fn is_fallback(&self) -> bool {
        self.kind == TimeKind::Fallback
    }
}

/// Source of the evaluation instant used to resolve `now`-relative expressions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_nanos(&self) -> i64 {
        datetime_to_nanos(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 固定时钟，测试和回放场景使用
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Converts to epoch nanoseconds, saturating outside the years 1677..2262.
pub fn datetime_to_nanos(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt().unwrap_or(if dt.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub fn nanos_to_rfc3339(nanos: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(nanos).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Normalizes `expr` against the evaluation instant `now_nanos`.
///
/// Never fails: unrecognized input yields `now_nanos` with
/// [`TimeKind::Fallback`] and a `warn!` record.
pub fn normalize(expr: &str, now_nanos: i64) -> Normalized {
    let expr = expr.trim();

    if expr == "now" {
        return Normalized {
            nanos: now_nanos,
            kind: TimeKind::Now,
        };
    }
    if let Some(nanos) = parse_relative(expr, now_nanos) {
        return Normalized {
            nanos,
            kind: TimeKind::Relative,
        };
    }
    if let Some(nanos) = parse_iso8601(expr) {
        return Normalized {
            nanos,
            kind: TimeKind::Absolute,
        };
    }
    if let Some(nanos) = parse_epoch(expr) {
        return Normalized {
            nanos,
            kind: TimeKind::Epoch,
        };
    }

    warn!(expression = expr, "unrecognized time expression, using evaluation instant");
    Normalized {
        nanos: now_nanos,
        kind: TimeKind::Fallback,
    }
}

fn relative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^now([+-])(\d+)([smhdw])$").expect("relative time regex"))
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit {
        "s" => Some(1),
        "m" => Some(60),
        "h" => Some(3_600),
        "d" => Some(86_400),
        "w" => Some(604_800),
        _ => None,
    }
}

fn parse_relative(expr: &str, now_nanos: i64) -> Option<i64> {
    let caps = relative_re().captures(expr)?;
    let amount: i64 = caps[2].parse().ok()?;
    let offset = amount
        .checked_mul(unit_seconds(&caps[3])?)?
        .checked_mul(NANOS_PER_SEC)?;
    if &caps[1] == "-" {
        now_nanos.checked_sub(offset)
    } else {
        now_nanos.checked_add(offset)
    }
}

fn parse_iso8601(expr: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(expr) {
        return dt.timestamp_nanos_opt();
    }
    // 无时区信息时按 UTC 处理
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(expr, fmt) {
            return naive.and_utc().timestamp_nanos_opt();
        }
    }
    NaiveDate::parse_from_str(expr, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| naive.and_utc().timestamp_nanos_opt())
}

fn parse_epoch(expr: &str) -> Option<i64> {
    let (int_part, frac_part) = expr.split_once('.').unwrap_or((expr, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }

    let secs: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };

    match secs
        .checked_mul(NANOS_PER_SEC)
        .and_then(|n| n.checked_add(fraction_nanos(frac_part)))
    {
        Some(nanos) => Some(nanos),
        // Loki's native nanosecond form; shorter overflows (ms, us) are not guessed at.
        None if frac_part.is_empty() && int_part.len() >= NANO_EPOCH_DIGITS => Some(secs),
        None => None,
    }
}

/// Scales decimal fraction digits to nanoseconds, rounding half-up on the
/// tenth digit. May return exactly `NANOS_PER_SEC` when rounding carries.
fn fraction_nanos(digits: &str) -> i64 {
    let bytes = digits.as_bytes();
    let mut nanos: i64 = 0;
    for i in 0..9 {
        let digit = bytes.get(i).map_or(0, |b| i64::from(b - b'0'));
        nanos = nanos * 10 + digit;
    }
    if bytes.get(9).is_some_and(|b| *b >= b'5') {
        nanos += 1;
    }
    nanos
}
