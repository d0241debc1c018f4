//! POSIX-TZ string parsing.
//!
//! Grammar (no whitespace): `std offset [dst [offset][,start[/time],end[/time]]]`
//! where `std`/`dst` are alphabetic abbreviations, `offset` is
//! `[+-]H[:M[:S]]` with positive meaning west of UTC, and `start`/`end` are
//! `Mm.w.d` dates. As an extension `w` may be negative to count occurrences
//! backwards from the end of the month.

use crate::error::TzError;

use super::tz::{DstChange, DstRule, TzRule};

struct Cursor<'a> {
    s: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Cursor<'a> {
        Cursor { s }
    }

    fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    fn peek(&self) -> Option<char> {
        self.s.chars().next()
    }

    fn take_while<F: Fn(char) -> bool>(&mut self, pred: F) -> &'a str {
        let end = self
            .s
            .char_indices()
            .find(|&(_, c)| !pred(c))
            .map(|(i, _)| i)
            .unwrap_or(self.s.len());
        let (head, rest) = self.s.split_at(end);
        self.s = rest;
        head
    }

    fn consume(&mut self, n: usize) {
        self.s = &self.s[n.min(self.s.len())..];
    }
}

/// Read the leading alphabetic abbreviation.
fn parse_abbr(cur: &mut Cursor<'_>) -> Result<String, TzError> {
    let abbr = cur.take_while(|c| c.is_ascii_alphabetic());
    if abbr.len() < 3 {
        return Err(TzError::Abbr);
    }
    Ok(abbr.to_string())
}

/// Parse `[+-]H[:M[:S]]`. When `isoffset`, an unprefixed value is negative
/// (the POSIX west-of-UTC convention) and the result is hours:minutes:secs
/// with a uniform sign; otherwise the value is a plain time of day
/// defaulting to 02:00:00.
fn parse_time(cur: &mut Cursor<'_>, isoffset: bool) -> Result<(i32, i32, i32), TzError> {
    let mut hour: i32 = if isoffset { -1 } else { 2 };
    let mut min = 0;
    let mut sec = 0;

    if cur.is_empty() {
        return Ok((hour, min, sec));
    }

    let raw = cur.take_while(|c| c.is_ascii_digit() || c == ':' || c == '-' || c == '+');
    if raw.is_empty() {
        return Ok((hour, min, sec));
    }
    if raw.len() > 11 {
        return Err(TzError::Time);
    }

    let (explicit_pos, body) = match raw.as_bytes()[0] {
        b'+' => (true, &raw[1..]),
        b'-' => (false, &raw[1..]),
        _ => (false, raw),
    };

    let mut parts = body.split(':');
    let mut next_num = |err| -> Result<Option<i32>, TzError> {
        match parts.next() {
            None => Ok(None),
            Some(p) => p.parse::<i32>().map(Some).map_err(|_| err),
        }
    };

    if let Some(v) = next_num(TzError::Time)? {
        hour = v;
    }
    if let Some(v) = next_num(TzError::Time)? {
        min = v;
    }
    if let Some(v) = next_num(TzError::Time)? {
        sec = v;
    }
    if parts.next().is_some() {
        return Err(TzError::Time);
    }

    if isoffset && !explicit_pos {
        hour = -hour;
        min = -min;
        sec = -sec;
    }

    Ok((hour, min, sec))
}

/// Parse an offset expression into seconds east of UTC.
fn parse_time_offset(cur: &mut Cursor<'_>) -> Result<i64, TzError> {
    let (h, m, s) = parse_time(cur, true).map_err(|_| TzError::Offset)?;
    Ok(i64::from(h) * 3600 + i64::from(m) * 60 + i64::from(s))
}

pub(super) fn parse_offset_str(s: &str) -> Result<i64, TzError> {
    let mut cur = Cursor::new(s);
    let offset = parse_time_offset(&mut cur)?;
    if !cur.is_empty() {
        return Err(TzError::Offset);
    }
    Ok(offset)
}

/// Parse an `Mm.w.d` date.
fn parse_date(cur: &mut Cursor<'_>) -> Result<(i32, i32, i32), TzError> {
    if cur.peek() != Some('M') {
        return Err(TzError::Date);
    }
    cur.consume(1);

    let raw = cur.take_while(|c| c.is_ascii_digit() || c == '.' || c == '-');
    if raw.len() < 5 || raw.len() > 8 {
        return Err(TzError::Date);
    }

    let mut parts = raw.split('.');
    let m: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(TzError::Date)?;
    let w: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(TzError::Date)?;
    let d: i32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or(TzError::Date)?;
    if parts.next().is_some() {
        return Err(TzError::Date);
    }

    if !(1..=12).contains(&m) || !(-5..=5).contains(&w) || !(0..=6).contains(&d) {
        return Err(TzError::Date);
    }
    Ok((m, w, d))
}

/// Parse `date[/time]` into a change descriptor.
fn parse_date_time(s: &str) -> Result<DstChange, TzError> {
    let (date_part, time_part) = match s.split_once('/') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    if time_part.map(|t| t.contains('/')).unwrap_or(false) {
        return Err(TzError::Datetime);
    }

    let mut cur = Cursor::new(date_part);
    let (month, occur, wday) = parse_date(&mut cur)?;
    if !cur.is_empty() {
        return Err(TzError::Date);
    }

    let (hour, min, sec) = match time_part {
        Some(t) => {
            let mut cur = Cursor::new(t);
            let parsed = parse_time(&mut cur, false)?;
            if !cur.is_empty() {
                return Err(TzError::Time);
            }
            parsed
        }
        None => (2, 0, 0),
    };

    Ok(DstChange { month, wday, occur, hour, min, sec })
}

/// Parse a `start[/time]` + `end[/time]` pair into a [`DstRule`].
pub(super) fn parse_dst_adjust_rule(
    start: &str,
    end: &str,
    year: i64,
    offset: i64,
    offset_dst: i64,
) -> Result<DstRule, TzError> {
    Ok(DstRule {
        year,
        offset,
        offset_dst,
        start: parse_date_time(start)?,
        end: parse_date_time(end)?,
    })
}

/// Parse a full POSIX-TZ string into a rule-based timezone. The returned
/// name is the complete source string, which doubles as the zone's lookup
/// name.
pub fn parse_posix_str(s: &str) -> Result<(TzRule, String), TzError> {
    if s.is_empty() {
        return Err(TzError::Invalid);
    }

    let mut parts = s.split(',');
    let head = parts.next().unwrap_or("");
    let start = parts.next();
    let end = parts.next();
    if parts.next().is_some() || (start.is_some() != end.is_some()) {
        return Err(TzError::Error);
    }

    let mut tz = TzRule::new();
    tz.name = s.to_string();

    let mut cur = Cursor::new(head);
    tz.abbr = parse_abbr(&mut cur)?;
    tz.offset = parse_time_offset(&mut cur)?;

    // Form 1: no DST at all.
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        _ => return Ok((tz, s.to_string())),
    };

    if cur.is_empty() {
        return Err(TzError::DstAbbr);
    }
    tz.abbr_dst = Some(parse_abbr(&mut cur).map_err(|_| TzError::DstAbbr)?);

    let offset_dst = if cur.is_empty() {
        // One hour ahead of standard by default.
        tz.offset + 3600
    } else {
        parse_time_offset(&mut cur).map_err(|_| TzError::DstOffset)?
    };

    if start.is_empty() || end.is_empty() {
        return Err(TzError::Date);
    }
    let adjust = parse_dst_adjust_rule(start, end, 0, tz.offset, offset_dst)?;
    tz.add_dst_adjust(adjust);

    Ok((tz, s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_est5edt() {
        let (tz, name) = parse_posix_str("EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00").unwrap();
        assert_eq!(name, "EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00");
        assert_eq!(tz.abbr, "EST");
        assert_eq!(tz.abbr_dst.as_deref(), Some("EDT"));
        assert_eq!(tz.offset, -18_000);
    }

    #[test]
    fn parse_utc_only() {
        let (tz, _) = parse_posix_str("UTC0").unwrap();
        assert_eq!(tz.abbr, "UTC");
        assert_eq!(tz.offset, 0);
        assert!(tz.abbr_dst.is_none());
    }

    #[test]
    fn parse_default_dst_offset() {
        // No explicit DST offset: one hour ahead of standard.
        let (tz, _) = parse_posix_str("CST6CDT,M3.2.0,M11.1.0").unwrap();
        assert_eq!(tz.offset, -21_600);
        let (offset, isdst, _) = tz.adjust_tolocal(1_375_277_153);
        assert_eq!(offset, -18_000);
        assert!(isdst);
    }

    #[test]
    fn offset_sign_convention() {
        // An unprefixed offset is west of UTC; only an explicit '+' flips
        // it east.
        let (tz, _) = parse_posix_str("EST5").unwrap();
        assert_eq!(tz.offset, -18_000);
        let (tz, _) = parse_posix_str("XYZ+9").unwrap();
        assert_eq!(tz.offset, 32_400);
    }

    #[test]
    fn reject_bad_strings() {
        assert!(parse_posix_str("").is_err());
        assert!(parse_posix_str("E5").is_err());
        assert!(parse_posix_str("EST5EDT,M3.2.0").is_err());
        assert!(parse_posix_str("EST5EDT,M13.2.0,M11.1.0").is_err());
        assert!(parse_posix_str("EST5EDT,M3.2.9,M11.1.0").is_err());
    }
}
