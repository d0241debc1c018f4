//! Olson/zoneinfo tzfile parsing and database loading.
//!
//! Files are parsed bit-exactly per `man 5 tzfile`: a `TZif` magic, a
//! version byte (`\0` or `2`), 15 reserved bytes, six big-endian 32-bit
//! section counts, then the data sections. Version 2 files repeat the whole
//! structure with 64-bit transition times; we skip the 32-bit block and
//! parse the second one.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::trace;

use super::tz::{OlsonTransition, Tz, TzOlson};
use super::tzs::{TzAliases, TzDb, TzFlags, TzZones};
use super::Time;

const TZFILE_MAGIC: &[u8; 4] = b"TZif";

struct TzfileReader {
    file: File,
}

impl TzfileReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }

    fn skip(&mut self, n: i64) -> io::Result<()> {
        self.file.seek(SeekFrom::Current(n)).map(|_| ())
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_i32(&mut self) -> io::Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    /// Transition times are 32-bit in version 1 data and 64-bit in the
    /// second block of version 2 files, always big-endian.
    fn read_long(&mut self, is64: bool) -> io::Result<i64> {
        if is64 {
            let mut b = [0u8; 8];
            self.read_exact(&mut b)?;
            Ok(i64::from_be_bytes(b))
        } else {
            self.read_i32().map(i64::from)
        }
    }
}

struct Ttinfo {
    gmtoff: i64,
    isdst: bool,
    abbrind: usize,
}

fn parse_tzfile_data(rd: &mut TzfileReader, skip_first: bool, timet64: bool) -> io::Result<TzOlson> {
    let mut magic = [0u8; 4];
    rd.read_exact(&mut magic)?;
    if &magic != TZFILE_MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad tzfile magic"));
    }

    let ver = rd.read_u8()?;
    if ver != 0 && ver != b'2' {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unsupported tzfile version"));
    }

    rd.skip(15)?;

    let ttisgmtcnt = rd.read_i32()? as u32;
    let ttisstdcnt = rd.read_i32()? as u32;
    let leapcnt = rd.read_i32()? as u32;
    let timecnt = rd.read_i32()? as u32;
    let typecnt = rd.read_i32()? as u32;
    let charcnt = rd.read_i32()? as u32;

    // These sections are interrelated; the type count can never be zero.
    if typecnt != ttisstdcnt || typecnt != ttisgmtcnt || typecnt == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "inconsistent tzfile counts"));
    }

    if skip_first && ver == b'2' {
        // The 64-bit data is a complete second copy following the 32-bit
        // copy; skip the remainder of this block and re-parse.
        let skip = i64::from(timecnt) * 5
            + i64::from(typecnt) * 6
            + i64::from(charcnt)
            + i64::from(leapcnt) * 8
            + i64::from(ttisstdcnt)
            + i64::from(ttisgmtcnt);
        rd.skip(skip)?;
        return parse_tzfile_data(rd, false, true);
    }

    let mut transition_times = Vec::with_capacity(timecnt as usize);
    for _ in 0..timecnt {
        transition_times.push(rd.read_long(timet64)? as Time);
    }

    let mut info_idxs = Vec::with_capacity(timecnt as usize);
    for _ in 0..timecnt {
        let idx = rd.read_u8()?;
        if u32::from(idx) >= typecnt {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ttinfo index out of range"));
        }
        info_idxs.push(idx as usize);
    }

    let mut ttinfos = Vec::with_capacity(typecnt as usize);
    for _ in 0..typecnt {
        let gmtoff = rd.read_long(false)?;
        let isdst = rd.read_u8()? != 0;
        let abbrind = rd.read_u8()? as usize;
        if abbrind as u32 >= charcnt && charcnt != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "abbreviation index out of range"));
        }
        ttinfos.push(Ttinfo { gmtoff, isdst, abbrind });
    }

    // The abbreviation block is NUL-separated strings; tt_abbrind is a byte
    // offset of the string's start within the block.
    let mut abbrs = vec![0u8; charcnt as usize];
    rd.read_exact(&mut abbrs)?;

    // Leap seconds: not supported. std/wall and ut/local indicators: used
    // only with POSIX-TZ environment handling, which this engine does not
    // do.
    rd.skip(i64::from(leapcnt) * (8 + if timet64 { 4 } else { 0 }))?;
    rd.skip(i64::from(ttisstdcnt) + i64::from(ttisgmtcnt))?;

    let mut tz = TzOlson::new();
    for (i, &start) in transition_times.iter().enumerate() {
        let info = &ttinfos[info_idxs[i]];
        let abbr_end = abbrs[info.abbrind..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| info.abbrind + p)
            .unwrap_or(abbrs.len());
        let abbr = String::from_utf8_lossy(&abbrs[info.abbrind..abbr_end]).into_owned();
        let abbr_idx = tz.intern_abbr(&abbr);

        tz.insert_transition(OlsonTransition {
            start,
            offset: info.gmtoff,
            isdst: info.isdst,
            abbr_idx,
        });
    }

    Ok(tz)
}

/// Parse a single tzfile from disk.
pub fn parse_tzfile<P: AsRef<Path>>(path: P) -> io::Result<TzOlson> {
    let file = File::open(path.as_ref())?;
    let mut rd = TzfileReader { file };
    parse_tzfile_data(&mut rd, true, false)
}

pub(super) fn load_tzfile(path: &Path) -> Option<Tz> {
    match parse_tzfile(path) {
        Ok(olson) => Some(Tz::Olson(olson)),
        Err(err) => {
            trace!("failed to parse tzfile {:?}: {}", path, err);
            None
        }
    }
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

const ZONE_DIRS: &[(&str, TzZones)] = &[
    ("Africa", TzZones::AFRICA),
    ("America", TzZones::AMERICA),
    ("Antarctica", TzZones::ANTARCTICA),
    ("Arctic", TzZones::ARCTIC),
    ("Asia", TzZones::ASIA),
    ("Atlantic", TzZones::ATLANTIC),
    ("Australia", TzZones::AUSTRALIA),
    ("Europe", TzZones::EUROPE),
    ("Indian", TzZones::INDIAN),
    ("Pacific", TzZones::PACIFIC),
    ("Etc", TzZones::ETC),
];

const SYS_PATHS: &[&str] = &["/usr/share/zoneinfo", "/usr/lib/zoneinfo"];

fn walk_zone_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        // Resolve symlinks so the same data never loads twice under two
        // real paths.
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            walk_zone_files(&path, out);
        } else if meta.is_file() {
            out.push(path);
        }
    }
}

/// Load (or lazily index) a zoneinfo directory tree into a database.
///
/// `path` of `None` probes the standard system locations. Zone names are the
/// Olson names (`America/New_York`); the stored canonical name is the
/// resolved absolute file path so symlinked aliases share one entry.
pub fn load_zoneinfo(
    path: Option<&Path>,
    zones: TzZones,
    _aliases: TzAliases,
    flags: TzFlags,
) -> Option<TzDb> {
    let base: PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let found = SYS_PATHS
                .iter()
                .map(Path::new)
                .find(|p| p.is_dir())?;
            found.to_path_buf()
        }
    };
    let base = std::fs::canonicalize(&base).ok()?;

    let mut db = TzDb::new();
    if flags.contains(TzFlags::LAZY) {
        // The loader closure confines lazy loads to the base path so an
        // alias can never escape the zoneinfo tree.
        let confine = base.clone();
        db.set_lazy_loader(move |real_name| {
            let p = Path::new(real_name);
            if !p.starts_with(&confine) {
                return None;
            }
            load_tzfile(p)
        });
    }

    for &(dirname, flag) in ZONE_DIRS {
        if !zones.contains(flag) {
            continue;
        }
        let mut files = Vec::new();
        walk_zone_files(&base.join(dirname), &mut files);
        for file in files {
            let real = match std::fs::canonicalize(&file) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !real.starts_with(&base) {
                continue;
            }
            let olson_name = match file.strip_prefix(&base) {
                Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            let real_name = real.to_string_lossy().into_owned();

            if flags.contains(TzFlags::LAZY) {
                db.add_placeholder(&real_name);
            } else if db.get(&olson_name).is_none() {
                if let Some(tz) = load_tzfile(&real) {
                    let _ = db.add_tz(tz, &real_name);
                }
            }
            db.add_alias(&olson_name, &real_name);
        }
    }

    Some(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn la_path() -> Option<&'static Path> {
        let p = Path::new("/usr/share/zoneinfo/America/Los_Angeles");
        p.exists().then_some(p)
    }

    #[test]
    fn parse_system_tzfile() {
        let path = match la_path() {
            Some(p) => p,
            None => return,
        };
        let tz = parse_tzfile(path).unwrap();
        assert!(tz.num_transitions() > 100);

        let tz = Tz::Olson(tz);
        let (offset, isdst, abbr) = tz.adjust_tolocal(1_375_277_153);
        assert_eq!(offset, -25_200);
        assert!(isdst);
        assert_eq!(abbr, Some("PDT"));
    }

    #[test]
    fn reject_garbage() {
        let dir = std::env::temp_dir().join("evio-tzfile-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("bogus");
        std::fs::write(&path, b"definitely not a tzfile").unwrap();
        assert!(parse_tzfile(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
