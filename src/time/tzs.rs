//! The timezone database: named zones, aliases, and lazy loading.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;

use crate::error::TzError;

use super::olson::load_zoneinfo;
use super::posix::parse_posix_str;
use super::tz::{Tz, TzRule};

/// Continent selection mask for [`TzDb::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzZones(u32);

impl TzZones {
    pub const AFRICA: TzZones = TzZones(1 << 0);
    pub const AMERICA: TzZones = TzZones(1 << 1);
    pub const ANTARCTICA: TzZones = TzZones(1 << 2);
    pub const ARCTIC: TzZones = TzZones(1 << 3);
    pub const ASIA: TzZones = TzZones(1 << 4);
    pub const ATLANTIC: TzZones = TzZones(1 << 5);
    pub const AUSTRALIA: TzZones = TzZones(1 << 6);
    pub const EUROPE: TzZones = TzZones(1 << 7);
    pub const INDIAN: TzZones = TzZones(1 << 8);
    pub const PACIFIC: TzZones = TzZones(1 << 9);
    pub const ETC: TzZones = TzZones(1 << 10);
    pub const ALL: TzZones = TzZones(0x7FF);

    pub fn contains(self, other: TzZones) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TzZones {
    type Output = TzZones;
    fn bitor(self, rhs: TzZones) -> TzZones {
        TzZones(self.0 | rhs.0)
    }
}

/// Alias-generation selection for [`TzDb::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzAliases(u32);

impl TzAliases {
    pub const OLSON_MAIN: TzAliases = TzAliases(1 << 0);
    pub const OLSON_ALL: TzAliases = TzAliases(1 << 1);
    pub const ALL: TzAliases = TzAliases(0x3);

    pub fn contains(self, other: TzAliases) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TzAliases {
    type Output = TzAliases;
    fn bitor(self, rhs: TzAliases) -> TzAliases {
        TzAliases(self.0 | rhs.0)
    }
}

/// Behavior flags for [`TzDb::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzFlags(u32);

impl TzFlags {
    pub const NONE: TzFlags = TzFlags(0);
    /// Index zone names now, parse tzfiles on first lookup.
    pub const LAZY: TzFlags = TzFlags(1 << 0);

    pub fn contains(self, other: TzFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TzFlags {
    type Output = TzFlags;
    fn bitor(self, rhs: TzFlags) -> TzFlags {
        TzFlags(self.0 | rhs.0)
    }
}

/// Where [`TzDb::load`] got its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The system zoneinfo database.
    System,
    /// The built-in North-American POSIX rules.
    Fallback,
    Fail,
}

type LazyLoader = dyn Fn(&str) -> Option<Tz> + Send + Sync;

/// A timezone database: case-insensitive canonical `name → zone` map plus a
/// case-insensitive `alias → name` map. Lookups resolve the alias first; a
/// missing zone behind a known alias triggers the lazy loader.
#[derive(Default)]
pub struct TzDb {
    /// Keyed by lowercased canonical name. `None` marks a lazily loadable
    /// placeholder.
    tzs: HashMap<String, Option<Arc<Tz>>>,
    /// Lowercased alias → canonical name (original case).
    alias: HashMap<String, String>,
    lazy_load: Option<Box<LazyLoader>>,
}

impl fmt::Debug for TzDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TzDb")
            .field("zones", &self.tzs.len())
            .field("aliases", &self.alias.len())
            .field("lazy", &self.lazy_load.is_some())
            .finish()
    }
}

impl TzDb {
    pub fn new() -> TzDb {
        TzDb::default()
    }

    /// Load timezone data, trying system sources first and falling back to
    /// the four main US POSIX rules (DST schedule in effect since 2007)
    /// when no system database exists.
    pub fn load(zones: TzZones, aliases: TzAliases, flags: TzFlags) -> (TzDb, LoadSource) {
        if let Some(db) = load_zoneinfo(None, zones, aliases, flags) {
            if !db.tzs.is_empty() {
                return (db, LoadSource::System);
            }
        }

        // A fallback only makes sense if the caller wanted the Americas.
        if zones != TzZones::ALL && !zones.contains(TzZones::AMERICA) {
            return (TzDb::new(), LoadSource::Fail);
        }

        let mut db = TzDb::new();
        for s in [
            "EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00",
            "CST6CDT,M3.2.0/02:00:00,M11.1.0/02:00:00",
            "MST7MDT,M3.2.0/02:00:00,M11.1.0/02:00:00",
            "PST8PDT,M3.2.0/02:00:00,M11.1.0/02:00:00",
        ] {
            let _ = db.add_posix_str(s);
        }
        (db, LoadSource::Fallback)
    }

    /// Load a zoneinfo tree from an explicit path.
    pub fn load_zoneinfo_path(
        path: &Path,
        zones: TzZones,
        aliases: TzAliases,
        flags: TzFlags,
    ) -> Option<TzDb> {
        load_zoneinfo(Some(path), zones, aliases, flags)
    }

    pub(super) fn set_lazy_loader<F>(&mut self, f: F)
    where
        F: Fn(&str) -> Option<Tz> + Send + Sync + 'static,
    {
        self.lazy_load = Some(Box::new(f));
    }

    /// Register a zone. Fails when a real (non-placeholder) zone already
    /// owns the name.
    pub fn add_tz(&mut self, tz: Tz, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let key = name.to_lowercase();
        if matches!(self.tzs.get(&key), Some(Some(_))) {
            return false;
        }
        self.tzs.insert(key, Some(Arc::new(tz)));
        true
    }

    /// Register a name that the lazy loader can populate later.
    pub(super) fn add_placeholder(&mut self, name: &str) {
        self.tzs.entry(name.to_lowercase()).or_insert(None);
    }

    /// Register an alias for an existing zone name.
    pub fn add_alias(&mut self, alias: &str, name: &str) -> bool {
        if !self.tzs.contains_key(&name.to_lowercase()) {
            return false;
        }
        self.alias.insert(alias.to_lowercase(), name.to_string());
        true
    }

    /// Look up a zone by name or alias, lazily loading when needed.
    pub fn get(&mut self, name: &str) -> Option<Arc<Tz>> {
        let real_name = self.alias.get(&name.to_lowercase())?.clone();
        let key = real_name.to_lowercase();

        if let Some(Some(tz)) = self.tzs.get(&key) {
            return Some(Arc::clone(tz));
        }

        // Placeholder or unknown entry behind a valid alias: lazy load.
        let loader = self.lazy_load.as_ref()?;
        let tz = loader(&real_name)?;
        let tz = Arc::new(tz);
        self.tzs.insert(key, Some(Arc::clone(&tz)));
        Some(tz)
    }

    /// Parse and register a POSIX-TZ string; the string itself becomes the
    /// zone name and sole alias.
    pub fn add_posix_str(&mut self, s: &str) -> Result<(), TzError> {
        let (tz, name) = parse_posix_str(s)?;
        self.load_rule(tz, &name, &[name.clone()])
    }

    /// Register a parsed rule with its aliases.
    pub(super) fn load_rule(
        &mut self,
        rule: TzRule,
        name: &str,
        aliases: &[String],
    ) -> Result<(), TzError> {
        if name.is_empty() || aliases.is_empty() {
            return Err(TzError::Error);
        }
        if !self.add_tz(Tz::Rule(rule), name) {
            return Err(TzError::Dup);
        }
        for alias in aliases {
            self.add_alias(alias, name);
        }
        Ok(())
    }

    /// Parse a single tzfile and register it under `name`.
    pub fn add_tzfile(&mut self, path: &Path, name: &str) -> Result<(), TzError> {
        if name.is_empty() {
            return Err(TzError::Invalid);
        }
        let tz = super::olson::load_tzfile(path).ok_or(TzError::Error)?;
        if !self.add_tz(tz, name) {
            return Err(TzError::Dup);
        }
        self.add_alias(name, name);
        Ok(())
    }

    /// Windows-registry zones are not available on this platform.
    pub fn add_win_zone(&mut self, _name: &str) -> Result<(), TzError> {
        Err(TzError::Invalid)
    }

    /// Alphabetical list of every known zone alias.
    pub fn loaded_zones(&self) -> Vec<String> {
        let mut names: Vec<String> = self.alias.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn num_zones(&self) -> usize {
        self.tzs.len()
    }

    /// Merge `src` into `self`. Fails without modification when any zone
    /// name collides, reporting the offending name. Alias collisions
    /// overwrite.
    pub fn merge(&mut self, src: TzDb, err_name: &mut Option<String>) -> bool {
        for key in src.tzs.keys() {
            if self.tzs.contains_key(key) {
                *err_name = Some(key.clone());
                return false;
            }
        }
        self.tzs.extend(src.tzs);
        self.alias.extend(src.alias);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_resolution_is_case_insensitive() {
        let mut db = TzDb::new();
        db.add_posix_str("EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00")
            .unwrap();
        assert!(db.get("est5edt,m3.2.0/02:00:00,m11.1.0/02:00:00").is_some());
        assert!(db.get("EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00").is_some());
        assert!(db.get("missing").is_none());
    }

    #[test]
    fn duplicate_zone_refused() {
        let mut db = TzDb::new();
        db.add_posix_str("UTC0").unwrap();
        assert_eq!(db.add_posix_str("UTC0"), Err(TzError::Dup));
    }

    #[test]
    fn merge_detects_collision() {
        let mut a = TzDb::new();
        a.add_posix_str("UTC0").unwrap();
        let mut b = TzDb::new();
        b.add_posix_str("UTC0").unwrap();

        let mut err = None;
        assert!(!a.merge(b, &mut err));
        assert_eq!(err.as_deref(), Some("utc0"));

        let mut c = TzDb::new();
        c.add_posix_str("EST5").unwrap();
        let mut err = None;
        assert!(a.merge(c, &mut err));
        assert!(a.get("EST5").is_some());
    }

    #[test]
    fn fallback_zones_present() {
        // Force the fallback by loading from an empty path.
        let (mut db, source) = match TzDb::load_zoneinfo_path(
            Path::new("/nonexistent/zoneinfo"),
            TzZones::ALL,
            TzAliases::ALL,
            TzFlags::NONE,
        ) {
            Some(db) if db.num_zones() > 0 => (db, LoadSource::System),
            _ => TzDb::load(TzZones::AMERICA, TzAliases::ALL, TzFlags::NONE),
        };
        if source == LoadSource::Fallback {
            assert!(db
                .get("EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00")
                .is_some());
        }
    }
}
