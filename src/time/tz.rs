//! Timezone rule representations and UTC↔local adjustment.
//!
//! Two encodings cover every supported source: [`TzRule`] carries a base
//! offset plus symbolic per-year DST rules (POSIX-TZ strings, the INI
//! format), while [`TzOlson`] carries an explicit transition list compiled
//! from a tzfile. Offsets are stored as seconds to *add* to UTC to obtain
//! local time (negative in the Americas), regardless of the sign convention
//! of the source syntax.

use super::{days_in_month, fromgm, is_valid_day, togm, LocalTime, Time};

/// When a DST change happens within a year: the `occur`-th `wday` of
/// `month` at the given wall-clock time. Negative `occur` counts from the
/// end of the month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DstChange {
    pub month: i32,
    pub wday: i32,
    pub occur: i32,
    pub hour: i32,
    pub min: i32,
    pub sec: i32,
}

/// DST schedule for one year (and, by extension, every earlier year not
/// covered by an older rule).
#[derive(Debug, Clone, Default)]
pub struct DstRule {
    pub year: i64,
    /// Standard offset from UTC, seconds east.
    pub offset: i64,
    /// Offset while DST is in effect, seconds east.
    pub offset_dst: i64,
    pub start: DstChange,
    pub end: DstChange,
}

/// A rule-based timezone: standard offset, abbreviations, and a list of
/// [`DstRule`]s held sorted descending by year.
#[derive(Debug, Clone, Default)]
pub struct TzRule {
    pub name: String,
    pub abbr: String,
    pub abbr_dst: Option<String>,
    /// Standard offset from UTC, seconds east.
    pub offset: i64,
    adjusts: Vec<DstRule>,
}

impl TzRule {
    pub fn new() -> TzRule {
        TzRule::default()
    }

    /// Add a DST rule. Only one rule per year is allowed.
    pub fn add_dst_adjust(&mut self, adjust: DstRule) -> bool {
        if self.adjusts.iter().any(|a| a.year == adjust.year) {
            return false;
        }
        let pos = self
            .adjusts
            .partition_point(|a| a.year > adjust.year);
        self.adjusts.insert(pos, adjust);
        true
    }

    /// Newest rule at or before `year`; times before the oldest rule fall
    /// back to the oldest rule.
    fn get_rule(&self, year: i64) -> Option<&DstRule> {
        self.adjusts
            .iter()
            .find(|a| a.year <= year)
            .or_else(|| self.adjusts.last())
    }

    /// Offset and DST flag for a broken-down local time.
    fn get_offset(&self, lt: &LocalTime) -> (i64, bool) {
        let adjust = match self.get_rule(lt.year) {
            Some(a) => a,
            None => return (self.offset, false),
        };

        if adjust.start.month == 0 || !rule_isdst(adjust, lt) {
            (adjust.offset, false)
        } else {
            (adjust.offset_dst, true)
        }
    }

    pub(crate) fn adjust_tolocal(&self, gmt: Time) -> (i64, bool, Option<&str>) {
        if self.adjusts.is_empty() {
            return (self.offset, false, Some(self.abbr.as_str()));
        }

        // The adjustment may push the local time across a year boundary, so
        // resolve the year twice.
        let year = togm(gmt).year;
        let adjust = match self.get_rule(year) {
            Some(a) => a,
            None => return (self.offset, false, Some(self.abbr.as_str())),
        };
        let lt = togm(gmt + adjust.offset);

        let (offset, isdst) = self.get_offset(&lt);
        let abbr = if isdst {
            self.abbr_dst.as_deref().or(Some(self.abbr.as_str()))
        } else {
            Some(self.abbr.as_str())
        };
        (offset, isdst, abbr)
    }

    fn adjust_fromlocal(&self, lt: &LocalTime) -> i64 {
        let (offset, _) = self.get_offset(lt);
        -offset
    }
}

/// UTC timestamp of a [`DstChange`] in `year`, interpreting the change's
/// wall-clock fields as-is.
fn change_to_time(change: &DstChange, year: i64) -> Option<Time> {
    if change.occur == 0 {
        return None;
    }

    let mut atime = LocalTime {
        year,
        month: i64::from(change.month),
        hour: i64::from(change.hour),
        min: i64::from(change.min),
        sec: i64::from(change.sec),
        ..Default::default()
    };

    let start_day = if change.occur > 0 {
        1
    } else {
        let d = days_in_month(year, i64::from(change.month));
        if d == 0 {
            return None;
        }
        d
    };
    atime.day = start_day;

    // Weekday of the anchor day.
    fromgm(&mut atime);

    let wday = i64::from(change.wday);
    let occur = i64::from(change.occur);
    let day = if occur > 0 {
        1 + (wday - atime.wday).rem_euclid(7) + 7 * (occur - 1)
    } else {
        start_day - (atime.wday - wday).rem_euclid(7) + 7 * (occur + 1)
    };

    if !is_valid_day(year, i64::from(change.month), day) {
        return None;
    }
    atime.day = day;
    Some(fromgm(&mut atime))
}

fn rule_isdst_mid(cur: Time, dststart: Time, dstend: Time, offset_diff: i64, isdst: bool) -> bool {
    // A wall clock in the fall-back window occurs twice; the isdst hint
    // selects the second (standard-time) occurrence.
    if !isdst && cur <= dstend && cur >= dstend - offset_diff {
        return false;
    }
    cur >= dststart && cur <= dstend
}

fn rule_isdst_ends(cur: Time, dststart: Time, dstend: Time, offset_diff: i64, isdst: bool) -> bool {
    // Southern-hemisphere style: DST spans the year boundary.
    if !isdst && cur <= dststart && cur >= dststart - offset_diff {
        return false;
    }
    cur >= dststart || cur <= dstend
}

fn rule_isdst(adjust: &DstRule, lt: &LocalTime) -> bool {
    let dststart = match change_to_time(&adjust.start, lt.year) {
        Some(t) => t,
        None => return false,
    };
    let dstend = match change_to_time(&adjust.end, lt.year) {
        Some(t) => t,
        None => return false,
    };

    let mut scratch = lt.clone();
    let cur = fromgm(&mut scratch);
    let offset_diff = adjust.offset.abs() - adjust.offset_dst.abs();
    let isdst = lt.isdst == 1;

    if dststart < dstend {
        rule_isdst_mid(cur, dststart, dstend, offset_diff, isdst)
    } else if dststart > dstend {
        rule_isdst_ends(cur, dststart, dstend, offset_diff, isdst)
    } else {
        cur == dststart
    }
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

const ONE_DAY: i64 = 86_400;

/// One compiled tzfile transition.
#[derive(Debug, Clone)]
pub struct OlsonTransition {
    /// UTC time the transition takes effect.
    pub start: Time,
    /// Seconds east of UTC from this transition on.
    pub offset: i64,
    pub isdst: bool,
    /// Index into [`TzOlson`]'s abbreviation table.
    pub abbr_idx: usize,
}

/// A timezone compiled from an Olson tzfile: interned abbreviations plus a
/// transition list held sorted descending by start time (newest first).
#[derive(Debug, Clone, Default)]
pub struct TzOlson {
    abbrs: Vec<String>,
    transitions: Vec<OlsonTransition>,
}

impl TzOlson {
    pub fn new() -> TzOlson {
        TzOlson::default()
    }

    pub fn intern_abbr(&mut self, abbr: &str) -> usize {
        match self.abbrs.iter().position(|a| a == abbr) {
            Some(idx) => idx,
            None => {
                self.abbrs.push(abbr.to_string());
                self.abbrs.len() - 1
            }
        }
    }

    pub fn abbr(&self, idx: usize) -> Option<&str> {
        self.abbrs.get(idx).map(|s| s.as_str())
    }

    pub fn insert_transition(&mut self, transition: OlsonTransition) {
        let pos = self
            .transitions
            .partition_point(|t| t.start > transition.start);
        self.transitions.insert(pos, transition);
    }

    pub fn num_transitions(&self) -> usize {
        self.transitions.len()
    }

    /// Latest transition at or before `gmt`. A time before the first
    /// transition maps to the earliest non-DST transition (or the earliest
    /// overall when the zone has never seen standard time).
    fn get_transition(&self, gmt: Time) -> Option<&OlsonTransition> {
        let idx = self.transitions.partition_point(|t| t.start > gmt);
        if let Some(t) = self.transitions.get(idx) {
            return Some(t);
        }
        self.transitions
            .iter()
            .rev()
            .find(|t| !t.isdst)
            .or_else(|| self.transitions.last())
    }

    pub(crate) fn adjust_tolocal(&self, gmt: Time) -> (i64, bool, Option<&str>) {
        match self.get_transition(gmt) {
            Some(t) => (t.offset, t.isdst, self.abbr(t.abbr_idx)),
            None => (0, false, None),
        }
    }

    /// Resolve a local wall-clock time to its UTC offset.
    ///
    /// One day of slack on each side is more than any real offset and less
    /// than the minimum spacing between transitions, so at most two
    /// transitions can cover the local time. A transition is valid when
    /// reversing its offset still lands at-or-after its start. In the
    /// fall-back window both are valid and the isdst hint picks one; if the
    /// ambiguity is not a DST distinction at all (e.g. Warsaw 1915) the
    /// later transition wins.
    fn adjust_fromlocal(&self, lt: &LocalTime) -> i64 {
        let mut scratch = lt.clone();
        let tstamp = fromgm(&mut scratch);

        let prev = self.get_transition(tstamp - ONE_DAY);
        let next = self.get_transition(tstamp + ONE_DAY);

        let (prev, next) = match (prev, next) {
            (None, None) => return 0,
            (Some(p), None) => return -p.offset,
            (None, Some(n)) => return -n.offset,
            (Some(p), Some(n)) => (p, n),
        };

        if std::ptr::eq(prev, next) {
            return -prev.offset;
        }

        let prev_valid = tstamp - prev.offset >= prev.start;
        let next_valid = tstamp - next.offset >= next.start;

        match (prev_valid, next_valid) {
            (true, false) => return -prev.offset,
            (false, true) => return -next.offset,
            (false, false) => return 0,
            (true, true) => {}
        }

        if prev.isdst && !next.isdst {
            return if lt.isdst == 1 { -prev.offset } else { -next.offset };
        }
        if !prev.isdst && next.isdst {
            return if lt.isdst == 1 { -next.offset } else { -prev.offset };
        }

        -next.offset
    }
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

/// A loaded timezone, either rule-based or transition-based.
#[derive(Debug, Clone)]
pub enum Tz {
    Rule(TzRule),
    Olson(TzOlson),
}

impl Tz {
    /// `(offset_east, isdst, abbr)` in effect at UTC time `t`.
    pub fn adjust_tolocal(&self, t: Time) -> (i64, bool, Option<&str>) {
        match self {
            Tz::Rule(r) => r.adjust_tolocal(t),
            Tz::Olson(o) => o.adjust_tolocal(t),
        }
    }

    /// Seconds to add to a local-time-interpreted-as-UTC stamp to obtain
    /// real UTC.
    pub fn adjust_fromlocal(&self, lt: &LocalTime) -> i64 {
        match self {
            Tz::Rule(r) => r.adjust_fromlocal(lt),
            Tz::Olson(o) => o.adjust_fromlocal(lt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn est5edt_2007() -> TzRule {
        let mut tz = TzRule {
            name: "EST5EDT".into(),
            abbr: "EST".into(),
            abbr_dst: Some("EDT".into()),
            offset: -18_000,
            ..Default::default()
        };
        tz.add_dst_adjust(DstRule {
            year: 0,
            offset: -18_000,
            offset_dst: -14_400,
            start: DstChange { month: 3, wday: 0, occur: 2, hour: 2, min: 0, sec: 0 },
            end: DstChange { month: 11, wday: 0, occur: 1, hour: 2, min: 0, sec: 0 },
        });
        tz
    }

    #[test]
    fn change_day_second_sunday_march_2013() {
        let change = DstChange { month: 3, wday: 0, occur: 2, hour: 2, min: 0, sec: 0 };
        let t = change_to_time(&change, 2013).unwrap();
        let lt = togm(t);
        assert_eq!((lt.month, lt.day, lt.hour), (3, 10, 2));
    }

    #[test]
    fn change_day_last_sunday() {
        let change = DstChange { month: 10, wday: 0, occur: -1, hour: 2, min: 0, sec: 0 };
        let t = change_to_time(&change, 2013).unwrap();
        let lt = togm(t);
        assert_eq!((lt.month, lt.day), (10, 27));
    }

    #[test]
    fn rule_fallback_hint() {
        let tz = Tz::Rule(est5edt_2007());

        // 2013-11-03 01:00:11 happens twice in America/New_York.
        let mut lt = LocalTime {
            year: 2013,
            month: 11,
            day: 3,
            hour: 1,
            min: 0,
            sec: 11,
            isdst: 1,
            ..Default::default()
        };
        let mut scratch = lt.clone();
        let as_utc = fromgm(&mut scratch);
        scratch.isdst = 1;
        assert_eq!(as_utc + tz.adjust_fromlocal(&scratch), 1_383_454_811);
        scratch.isdst = 0;
        assert_eq!(as_utc + tz.adjust_fromlocal(&scratch), 1_383_458_411);
        lt.isdst = 0;
        let t = crate::time::from_local(&mut lt, Some(&tz));
        assert_eq!(t, 1_383_458_411);
        assert_eq!(lt.gmtoff, -18_000);
        assert_eq!(lt.isdst, 0);
    }

    #[test]
    fn rule_tolocal_summer() {
        let tz = est5edt_2007();
        let (offset, isdst, abbr) = tz.adjust_tolocal(1_464_900_596);
        assert_eq!(offset, -14_400);
        assert!(isdst);
        assert_eq!(abbr, Some("EDT"));
    }

    #[test]
    fn rule_tolocal_winter() {
        let tz = est5edt_2007();
        let (offset, isdst, abbr) = tz.adjust_tolocal(1_359_638_780);
        assert_eq!(offset, -18_000);
        assert!(!isdst);
        assert_eq!(abbr, Some("EST"));
    }

    #[test]
    fn olson_before_first_transition_uses_std() {
        let mut tz = TzOlson::new();
        let std_idx = tz.intern_abbr("XST");
        let dst_idx = tz.intern_abbr("XDT");
        tz.insert_transition(OlsonTransition { start: 1_000, offset: -3600, isdst: false, abbr_idx: std_idx });
        tz.insert_transition(OlsonTransition { start: 2_000, offset: 0, isdst: true, abbr_idx: dst_idx });

        let (offset, isdst, abbr) = tz.adjust_tolocal(10);
        assert_eq!(offset, -3600);
        assert!(!isdst);
        assert_eq!(abbr, Some("XST"));

        let (offset, isdst, _) = tz.adjust_tolocal(2_500);
        assert_eq!(offset, 0);
        assert!(isdst);
    }
}
