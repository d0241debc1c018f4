//! Timezone conversion checks against known-good conversions for
//! America/New_York and America/Los_Angeles, via both POSIX rules and the
//! system zoneinfo database.

use std::path::Path;

use evio::time::{from_local, to_local, LocalTime, Tz, TzAliases, TzDb, TzFlags, TzZones};

const EST5EDT: &str = "EST5EDT,M3.2.0/02:00:00,M11.1.0/02:00:00";
const PST8PDT: &str = "PST8PDT,M3.2.0/02:00:00,M11.1.0/02:00:00";

struct TzCheck {
    utc: i64,
    gmtoff: i64,
    isdst: bool,
    local: (i64, i64, i64, i64, i64, i64),
}

const CHECKS_NY: &[TzCheck] = &[
    // DST on/off.
    TzCheck { utc: 1464900596, gmtoff: -14400, isdst: true, local: (2016, 6, 2, 16, 49, 56) },
    TzCheck { utc: 1375277153, gmtoff: -14400, isdst: true, local: (2013, 7, 31, 9, 25, 53) },
    TzCheck { utc: 1359638780, gmtoff: -18000, isdst: false, local: (2013, 1, 31, 8, 26, 20) },
    TzCheck { utc: 1362900611, gmtoff: -14400, isdst: true, local: (2013, 3, 10, 3, 30, 11) },
    // DST fall-back: every half hour across the repeated 1 AM.
    TzCheck { utc: 1383451211, gmtoff: -14400, isdst: true, local: (2013, 11, 3, 0, 0, 11) },
    TzCheck { utc: 1383453011, gmtoff: -14400, isdst: true, local: (2013, 11, 3, 0, 30, 11) },
    TzCheck { utc: 1383454811, gmtoff: -14400, isdst: true, local: (2013, 11, 3, 1, 0, 11) },
    TzCheck { utc: 1383456611, gmtoff: -14400, isdst: true, local: (2013, 11, 3, 1, 30, 11) },
    TzCheck { utc: 1383458411, gmtoff: -18000, isdst: false, local: (2013, 11, 3, 1, 0, 11) },
    TzCheck { utc: 1383460211, gmtoff: -18000, isdst: false, local: (2013, 11, 3, 1, 30, 11) },
    TzCheck { utc: 1383462011, gmtoff: -18000, isdst: false, local: (2013, 11, 3, 2, 0, 11) },
    TzCheck { utc: 1383463811, gmtoff: -18000, isdst: false, local: (2013, 11, 3, 2, 30, 11) },
];

const CHECKS_LA: &[TzCheck] = &[
    TzCheck { utc: 1375277153, gmtoff: -25200, isdst: true, local: (2013, 7, 31, 6, 25, 53) },
    TzCheck { utc: 1359638780, gmtoff: -28800, isdst: false, local: (2013, 1, 31, 5, 26, 20) },
    TzCheck { utc: 1362911411, gmtoff: -25200, isdst: true, local: (2013, 3, 10, 3, 30, 11) },
    TzCheck { utc: 1383462011, gmtoff: -25200, isdst: true, local: (2013, 11, 3, 0, 0, 11) },
    TzCheck { utc: 1383463811, gmtoff: -25200, isdst: true, local: (2013, 11, 3, 0, 30, 11) },
    TzCheck { utc: 1383465611, gmtoff: -25200, isdst: true, local: (2013, 11, 3, 1, 0, 11) },
    TzCheck { utc: 1383467411, gmtoff: -25200, isdst: true, local: (2013, 11, 3, 1, 30, 11) },
    TzCheck { utc: 1383469211, gmtoff: -28800, isdst: false, local: (2013, 11, 3, 1, 0, 11) },
    TzCheck { utc: 1383471011, gmtoff: -28800, isdst: false, local: (2013, 11, 3, 1, 30, 11) },
    TzCheck { utc: 1383472811, gmtoff: -28800, isdst: false, local: (2013, 11, 3, 2, 0, 11) },
    TzCheck { utc: 1383474611, gmtoff: -28800, isdst: false, local: (2013, 11, 3, 2, 30, 11) },
];

fn run_checks(tz: &Tz, prefix: &str, checks: &[TzCheck]) {
    for (i, check) in checks.iter().enumerate() {
        let mut lt = to_local(check.utc, Some(tz));

        assert_eq!(lt.gmtoff, check.gmtoff, "{} check {}: offset", prefix, i);
        assert_eq!(lt.isdst == 1, check.isdst, "{} check {}: isdst", prefix, i);
        assert_eq!(
            (lt.year, lt.month, lt.day, lt.hour, lt.min, lt.sec),
            check.local,
            "{} check {}: local fields",
            prefix,
            i
        );

        // The round trip back to UTC must be exact, including the
        // ambiguous fall-back hours (isdst was filled in by to_local).
        let t = from_local(&mut lt, Some(tz));
        assert_eq!(t, check.utc, "{} check {}: round trip", prefix, i);
    }
}

#[test]
fn posix_rules_ny_la() {
    let mut db = TzDb::new();
    db.add_posix_str(EST5EDT).unwrap();
    db.add_posix_str(PST8PDT).unwrap();

    let tz = db.get(EST5EDT).expect("EST5EDT registered");
    run_checks(&tz, "posix-ny", CHECKS_NY);

    let tz = db.get(PST8PDT).expect("PST8PDT registered");
    run_checks(&tz, "posix-la", CHECKS_LA);
}

#[test]
fn olson_zoneinfo_ny_la() {
    if !Path::new("/usr/share/zoneinfo/America/New_York").exists() {
        return;
    }

    let mut db = TzDb::load_zoneinfo_path(
        Path::new("/usr/share/zoneinfo"),
        TzZones::AMERICA,
        TzAliases::OLSON_MAIN,
        TzFlags::LAZY,
    )
    .expect("zoneinfo loads");

    let tz = db.get("America/New_York").expect("NY zone resolves");
    run_checks(&tz, "olson-ny", CHECKS_NY);

    let tz = db.get("America/Los_Angeles").expect("LA zone resolves");
    run_checks(&tz, "olson-la", CHECKS_LA);
}

#[test]
fn fallback_hint_selects_occurrence() {
    // 2013-11-03 01:00:11 and 01:30:11 happen twice in America/New_York;
    // the isdst hint picks which.
    let mut db = TzDb::new();
    db.add_posix_str(EST5EDT).unwrap();
    let tz = db.get(EST5EDT).unwrap();

    let cases = [
        ((1, 0, 11), 1, 1383454811),
        ((1, 30, 11), 1, 1383456611),
        ((1, 0, 11), 0, 1383458411),
        ((1, 30, 11), 0, 1383460211),
    ];
    for ((hour, min, sec), isdst, expect) in cases {
        let mut lt = LocalTime {
            year: 2013,
            month: 11,
            day: 3,
            hour,
            min,
            sec,
            isdst,
            ..Default::default()
        };
        assert_eq!(from_local(&mut lt, Some(&*tz)), expect);
    }
}

#[test]
fn round_trip_sampled_range() {
    let mut db = TzDb::new();
    db.add_posix_str(EST5EDT).unwrap();
    let tz = db.get(EST5EDT).unwrap();

    // Coarse sweep from 1970 through 2099, stepping a little under 11
    // days so the sample points drift through all times of day and both
    // DST phases.
    let mut t: i64 = 11;
    while t < 4_102_444_800 {
        let mut lt = to_local(t, Some(&*tz));
        let back = from_local(&mut lt, Some(&*tz));
        assert_eq!(back, t, "round trip at {}", t);
        t += 86_400 * 11 - 3_607;
    }
}

#[test]
fn load_reports_source() {
    let (mut db, source) = TzDb::load(TzZones::AMERICA, TzAliases::ALL, TzFlags::LAZY);
    match source {
        evio::time::LoadSource::System => {
            assert!(db.num_zones() > 0);
        }
        evio::time::LoadSource::Fallback => {
            // The four US rules with the 2007+ schedule.
            let tz = db.get(EST5EDT).expect("fallback zone");
            let lt = to_local(1464900596, Some(&*tz));
            assert_eq!(lt.gmtoff, -14400);
        }
        evio::time::LoadSource::Fail => panic!("tz load failed outright"),
    }
}
