//! Wall-clock and monotonic time primitives plus the timezone engine.
//!
//! Calendar math is done in pure integer arithmetic (proleptic Gregorian) so
//! conversions behave identically on every platform and for the full
//! `[1970, 2099]` range the runtime cares about. The system timezone is only
//! consulted when no [`Tz`] is supplied.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

mod mtzfile;
mod olson;
mod posix;
mod tz;
mod tzs;

pub use self::mtzfile::{tzs_add_mtzfile_str, MtzfileError};
pub use self::olson::{load_zoneinfo, parse_tzfile};
pub use self::posix::parse_posix_str;
pub use self::tz::{DstChange, DstRule, OlsonTransition, Tz, TzOlson, TzRule};
pub use self::tzs::{LoadSource, TzAliases, TzDb, TzFlags, TzZones};

/// Seconds since the Unix epoch, signed.
pub type Time = i64;

/// Overflow-safe extremes for a `Time`, derived by bit-splitting so the
/// constant expression never overflows an intermediate.
pub const TIME_MAX: Time = (((1 as Time) << (Time::BITS - 2)) - 1) + ((1 as Time) << (Time::BITS - 2));
pub const TIME_MIN: Time = !TIME_MAX;

/// Second/microsecond pair as returned by `gettimeofday(2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeVal {
    pub sec: i64,
    pub usec: i64,
}

/// A broken-down local (or UTC) time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalTime {
    pub year: i64,
    /// Two-digit year, kept in sync with `year`.
    pub year2: i64,
    /// 1..=12
    pub month: i64,
    /// 1..=31
    pub day: i64,
    pub hour: i64,
    pub min: i64,
    pub sec: i64,
    /// Day of week, 0 = Sunday.
    pub wday: i64,
    /// Day of year, 0-based.
    pub yday: i64,
    /// 1 = DST, 0 = standard, -1 = unknown.
    pub isdst: i8,
    /// Seconds east of UTC in effect for this local time.
    pub gmtoff: i64,
    /// Zone abbreviation, empty when unknown.
    pub abbr: String,
}

/// Current wall-clock time in whole seconds.
pub fn now() -> Time {
    gettimeofday().sec
}

/// Current wall-clock time with microsecond precision.
pub fn gettimeofday() -> TimeVal {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => TimeVal {
            sec: d.as_secs() as i64,
            usec: i64::from(d.subsec_micros()),
        },
        // Clock is before the epoch; count backwards.
        Err(e) => {
            let d = e.duration();
            TimeVal {
                sec: -(d.as_secs() as i64),
                usec: -i64::from(d.subsec_micros()),
            }
        }
    }
}

/// Start a monotonic elapsed-time measurement.
pub fn elapsed_start() -> Instant {
    Instant::now()
}

/// Milliseconds elapsed since `start` on the monotonic clock.
pub fn elapsed_ms(start: &Instant) -> u64 {
    let d = start.elapsed();
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Millisecond difference `end - start`, clamped at zero.
pub fn timeval_diff_ms(start: &TimeVal, end: &TimeVal) -> i64 {
    (end.sec - start.sec) * 1000 + (end.usec / 1000 - start.usec / 1000)
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

const DAYS_PER_MONTH: [i64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

pub fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1..=12) of `year`; 0 for a bad month.
pub fn days_in_month(year: i64, month: i64) -> i64 {
    if !(1..=12).contains(&month) {
        return 0;
    }
    if month == 2 && is_leap_year(year) {
        29
    } else {
        DAYS_PER_MONTH[(month - 1) as usize]
    }
}

pub fn is_valid_day(year: i64, month: i64, day: i64) -> bool {
    day >= 1 && day <= days_in_month(year, month)
}

/// Days since 1970-01-01 for a civil date (proleptic Gregorian).
fn days_from_civil(mut y: i64, m: i64, d: i64) -> i64 {
    if m <= 2 {
        y -= 1;
    }
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Day of week for a day count since the epoch; 0 = Sunday.
fn weekday_from_days(z: i64) -> i64 {
    (z + 4).rem_euclid(7)
}

/// Convert a broken-down UTC time to seconds since the epoch.
///
/// Out-of-range fields are normalized arithmetically (a month of 13 rolls
/// into January). `wday`, `yday` and `year2` are recomputed in place.
pub fn fromgm(lt: &mut LocalTime) -> Time {
    // Roll months into years first so days_from_civil sees 1..=12.
    let mut year = lt.year;
    let mut month = lt.month;
    if month < 1 || month > 12 {
        year += (month - 1).div_euclid(12);
        month = (month - 1).rem_euclid(12) + 1;
    }

    let days = days_from_civil(year, month, lt.day);
    let t = days * 86_400 + lt.hour * 3600 + lt.min * 60 + lt.sec;

    // Re-derive every field in normalized form.
    let norm = togm(t);
    lt.year = norm.year;
    lt.year2 = norm.year2;
    lt.month = norm.month;
    lt.day = norm.day;
    lt.hour = norm.hour;
    lt.min = norm.min;
    lt.sec = norm.sec;
    lt.wday = norm.wday;
    lt.yday = norm.yday;
    t
}

/// Convert seconds since the epoch to a broken-down UTC time.
pub fn togm(t: Time) -> LocalTime {
    let days = t.div_euclid(86_400);
    let secs = t.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let jan1 = days_from_civil(year, 1, 1);

    LocalTime {
        year,
        year2: year.rem_euclid(100),
        month,
        day,
        hour: secs / 3600,
        min: (secs % 3600) / 60,
        sec: secs % 60,
        wday: weekday_from_days(days),
        yday: days - jan1,
        isdst: -1,
        gmtoff: 0,
        abbr: String::new(),
    }
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

/// Convert a UTC timestamp to local time in `tz`, or in the system zone when
/// `tz` is `None`.
pub fn to_local(t: Time, tz: Option<&Tz>) -> LocalTime {
    match tz {
        Some(tz) => {
            let (offset, isdst, abbr) = tz.adjust_tolocal(t);
            let mut lt = togm(t + offset);
            lt.isdst = if isdst { 1 } else { 0 };
            lt.gmtoff = offset;
            lt.abbr = abbr.unwrap_or("").to_string();
            lt
        }
        None => to_local_sys(t),
    }
}

/// Convert a broken-down local time to a UTC timestamp.
///
/// In the DST fall-back window the same wall clock occurs twice; the
/// caller's `isdst` hint (1/0) picks the interpretation, -1 leaves it to the
/// zone rules. On return `lt` is rewritten to the normalized local fields
/// for the produced timestamp.
pub fn from_local(lt: &mut LocalTime, tz: Option<&Tz>) -> Time {
    let t = match tz {
        Some(tz) => {
            let isdst = lt.isdst;
            let mut scratch = lt.clone();
            let as_utc = fromgm(&mut scratch);
            scratch.isdst = isdst;
            as_utc + tz.adjust_fromlocal(&scratch)
        }
        None => from_local_sys(lt),
    };
    *lt = to_local(t, tz);
    t
}

#[cfg(unix)]
fn to_local_sys(t: Time) -> LocalTime {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let st = t as libc::time_t;
    let ok = unsafe { !libc::localtime_r(&st, &mut tm).is_null() };
    if !ok {
        return togm(t);
    }

    let mut lt = LocalTime {
        year: i64::from(tm.tm_year) + 1900,
        year2: (i64::from(tm.tm_year) + 1900).rem_euclid(100),
        month: i64::from(tm.tm_mon) + 1,
        day: i64::from(tm.tm_mday),
        hour: i64::from(tm.tm_hour),
        min: i64::from(tm.tm_min),
        sec: i64::from(tm.tm_sec),
        wday: i64::from(tm.tm_wday),
        yday: i64::from(tm.tm_yday),
        isdst: if tm.tm_isdst > 0 { 1 } else { 0 },
        gmtoff: tm.tm_gmtoff,
        abbr: String::new(),
    };
    if !tm.tm_zone.is_null() {
        let zone = unsafe { std::ffi::CStr::from_ptr(tm.tm_zone) };
        lt.abbr = zone.to_string_lossy().into_owned();
    }
    lt
}

#[cfg(unix)]
fn from_local_sys(lt: &LocalTime) -> Time {
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    tm.tm_sec = lt.sec as libc::c_int;
    tm.tm_min = lt.min as libc::c_int;
    tm.tm_hour = lt.hour as libc::c_int;
    tm.tm_mday = lt.day as libc::c_int;
    tm.tm_mon = (lt.month - 1) as libc::c_int;
    tm.tm_year = (lt.year - 1900) as libc::c_int;
    tm.tm_isdst = i32::from(lt.isdst);
    (unsafe { libc::mktime(&mut tm) }) as Time
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gm_round_trip() {
        for &t in &[0i64, 1, 86_399, 86_400, 951_827_696, 1_362_900_611, 4_102_444_799] {
            let mut lt = togm(t);
            assert_eq!(fromgm(&mut lt), t, "round trip of {}", t);
        }
    }

    #[test]
    fn gm_known_fields() {
        let lt = togm(1_464_900_596);
        assert_eq!(
            (lt.year, lt.month, lt.day, lt.hour, lt.min, lt.sec),
            (2016, 6, 2, 20, 49, 56)
        );
        assert_eq!(lt.wday, 4); // Thursday
    }

    #[test]
    fn epoch_is_thursday() {
        let lt = togm(0);
        assert_eq!((lt.year, lt.month, lt.day), (1970, 1, 1));
        assert_eq!(lt.wday, 4);
        assert_eq!(lt.yday, 0);
    }

    #[test]
    fn month_lengths() {
        assert_eq!(days_in_month(2013, 2), 28);
        assert_eq!(days_in_month(2012, 2), 29);
        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
        assert_eq!(days_in_month(2013, 13), 0);
        assert!(is_valid_day(2013, 11, 3));
        assert!(!is_valid_day(2013, 11, 31));
    }

    #[test]
    fn fromgm_normalizes() {
        let mut lt = LocalTime {
            year: 2013,
            month: 13,
            day: 1,
            ..Default::default()
        };
        let t = fromgm(&mut lt);
        assert_eq!((lt.year, lt.month, lt.day), (2014, 1, 1));
        assert_eq!(togm(t).year, 2014);
    }

    #[test]
    fn time_extremes() {
        assert_eq!(TIME_MAX, i64::MAX);
        assert_eq!(TIME_MIN, i64::MIN);
    }
}
