//! INI-style timezone description format.
//!
//! Each section names a zone; recognized keys are `offset` (required,
//! POSIX-TZ offset syntax), `abbr` (required), `abbr_dst`, `offset_dst`,
//! multi-valued `dst` (each `year;start[/time],end[/time]`) and
//! multi-valued `alias`. Example:
//!
//! ```text
//! [America/New_York]
//! alias=US/Eastern
//! offset=5
//! offset_dst=4
//! abbr=EST
//! abbr_dst=EDT
//! dst=2007;M3.2.0/02:00:00,M11.1.0/02:00:00
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::TzError;

use super::posix::{parse_dst_adjust_rule, parse_offset_str};
use super::tz::TzRule;
use super::tzs::TzDb;

/// A failed load, with as much context as the parser had.
#[derive(Debug, Clone)]
pub struct MtzfileError {
    pub err: TzError,
    /// 1-based line of an INI syntax error.
    pub line: Option<usize>,
    /// Section (zone) being parsed when the error occurred.
    pub section: Option<String>,
    /// Offending value.
    pub data: Option<String>,
}

impl MtzfileError {
    fn new(err: TzError) -> MtzfileError {
        MtzfileError { err, line: None, section: None, data: None }
    }

    fn with_section(mut self, section: &str) -> MtzfileError {
        self.section = Some(section.to_string());
        self
    }

    fn with_data(mut self, data: &str) -> MtzfileError {
        self.data = Some(data.to_string());
        self
    }
}

impl fmt::Display for MtzfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)?;
        if let Some(line) = self.line {
            write!(f, " at line {}", line)?;
        }
        if let Some(section) = &self.section {
            write!(f, " in [{}]", section)?;
        }
        if let Some(data) = &self.data {
            write!(f, " ({:?})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for MtzfileError {}

/// Parsed INI content: section order plus per-section multi-valued keys.
struct Ini {
    sections: Vec<String>,
    // (section, key) → values in file order.
    values: HashMap<(String, String), Vec<String>>,
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

fn parse_ini(data: &str) -> Result<Ini, MtzfileError> {
    let mut ini = Ini { sections: Vec::new(), values: HashMap::new() };
    let mut section = String::new();

    for (lineno, raw_line) in data.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with('[') {
            if !line.ends_with(']') || line.len() < 3 {
                return Err(MtzfileError {
                    line: Some(lineno + 1),
                    ..MtzfileError::new(TzError::Ini)
                });
            }
            section = line[1..line.len() - 1].trim().to_string();
            if !ini.sections.iter().any(|s| s == &section) {
                ini.sections.push(section.clone());
            }
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim().to_lowercase(), unquote(v)),
            None => {
                return Err(MtzfileError {
                    line: Some(lineno + 1),
                    ..MtzfileError::new(TzError::Ini)
                })
            }
        };

        ini.values
            .entry((section.clone(), key))
            .or_default()
            .push(value);
    }

    Ok(ini)
}

impl Ini {
    fn get_first(&self, section: &str, key: &str) -> Option<&str> {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    fn get_all(&self, section: &str, key: &str) -> &[String] {
        self.values
            .get(&(section.to_string(), key.to_string()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Parse one `year;start[/time],end[/time]` DST rule value.
fn parse_dst_value(
    rule: &str,
    offset: i64,
    offset_dst: i64,
) -> Result<super::tz::DstRule, TzError> {
    let (year_s, adjust_s) = rule.split_once(';').ok_or(TzError::Year)?;
    let year: i64 = year_s.trim().parse().map_err(|_| TzError::Year)?;
    let (start, end) = adjust_s.split_once(',').ok_or(TzError::Invalid)?;
    parse_dst_adjust_rule(start, end, year, offset, offset_dst)
}

fn load_section(db: &mut TzDb, ini: &Ini, section: &str) -> Result<(), MtzfileError> {
    let mut rtz = TzRule::new();
    rtz.name = section.to_string();

    let offset_raw = ini
        .get_first(section, "offset")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MtzfileError::new(TzError::Offset).with_section(section))?;
    rtz.offset = parse_offset_str(offset_raw).map_err(|_| {
        MtzfileError::new(TzError::Offset)
            .with_section(section)
            .with_data(offset_raw)
    })?;

    let abbr = ini
        .get_first(section, "abbr")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MtzfileError::new(TzError::Abbr).with_section(section))?;
    rtz.abbr = abbr.to_string();

    if let Some(abbr_dst) = ini.get_first(section, "abbr_dst").filter(|s| !s.is_empty()) {
        rtz.abbr_dst = Some(abbr_dst.to_string());
    }

    let mut offset_dst = 0;
    if let Some(raw) = ini.get_first(section, "offset_dst").filter(|s| !s.is_empty()) {
        offset_dst = parse_offset_str(raw).map_err(|_| {
            MtzfileError::new(TzError::DstOffset)
                .with_section(section)
                .with_data(raw)
        })?;
    }

    for raw in ini.get_all(section, "dst") {
        let adjust = parse_dst_value(raw, rtz.offset, offset_dst).map_err(|err| {
            MtzfileError::new(err).with_section(section).with_data(raw)
        })?;
        rtz.add_dst_adjust(adjust);
    }

    let mut aliases: Vec<String> = ini.get_all(section, "alias").to_vec();
    aliases.push(section.to_string());

    db.load_rule(rtz, section, &aliases)
        .map_err(|err| MtzfileError::new(err).with_section(section))
}

/// Parse INI timezone data and merge it into `db`.
///
/// All sections load into a scratch database first so a failure (including
/// a duplicate against `db`) leaves `db` untouched.
pub fn tzs_add_mtzfile_str(db: &mut TzDb, data: &str) -> Result<(), MtzfileError> {
    if data.is_empty() {
        return Err(MtzfileError::new(TzError::Invalid));
    }

    let ini = parse_ini(data)?;

    let mut temp = TzDb::new();
    for section in &ini.sections {
        load_section(&mut temp, &ini, section)?;
    }

    let mut err_name = None;
    if !db.merge(temp, &mut err_name) {
        let mut err = MtzfileError::new(TzError::Dup);
        err.section = err_name;
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::to_local;

    const LA: &str = "[US/Pacific]\n\
        alias=America/Los_Angeles\n\
        offset=8\n\
        offset_dst=7\n\
        abbr=PST\n\
        abbr_dst=PDT\n\
        dst=2007;M3.2.0/02:00:00,M11.1.0/02:00:00\n";

    #[test]
    fn load_and_convert() {
        let mut db = TzDb::new();
        tzs_add_mtzfile_str(&mut db, LA).unwrap();

        let tz = db.get("America/Los_Angeles").expect("alias resolves");
        let lt = to_local(1_375_277_153, Some(&*tz));
        assert_eq!(lt.gmtoff, -25_200);
        assert_eq!(lt.isdst, 1);
        assert_eq!(lt.abbr, "PDT");
        assert_eq!((lt.month, lt.day, lt.hour, lt.min, lt.sec), (7, 31, 6, 25, 53));

        let lt = to_local(1_359_638_780, Some(&*tz));
        assert_eq!(lt.gmtoff, -28_800);
        assert_eq!(lt.isdst, 0);
        assert_eq!(lt.abbr, "PST");
    }

    #[test]
    fn comments_and_quotes() {
        let data = "# zones\n[X/Test]\noffset=\"5\"\nabbr=TST\n";
        let mut db = TzDb::new();
        tzs_add_mtzfile_str(&mut db, data).unwrap();
        let tz = db.get("X/Test").unwrap();
        let (offset, isdst, _) = tz.adjust_tolocal(0);
        assert_eq!(offset, -18_000);
        assert!(!isdst);
    }

    #[test]
    fn bad_offset_reports_context() {
        let data = "[X/Bad]\noffset=whoops\nabbr=BAD\n";
        let mut db = TzDb::new();
        let err = tzs_add_mtzfile_str(&mut db, data).unwrap_err();
        assert_eq!(err.err, TzError::Offset);
        assert_eq!(err.section.as_deref(), Some("X/Bad"));
    }

    #[test]
    fn duplicate_leaves_db_untouched() {
        let mut db = TzDb::new();
        tzs_add_mtzfile_str(&mut db, LA).unwrap();
        let err = tzs_add_mtzfile_str(&mut db, LA).unwrap_err();
        assert_eq!(err.err, TzError::Dup);
        assert!(db.get("US/Pacific").is_some());
    }
}
