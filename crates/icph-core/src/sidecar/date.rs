use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc, Weekday};

/// iCloud writes e.g. `Monday January 2,2023 3:45 PM GMT`.
const ICLOUD_FORMAT: &str = "%B %d,%Y %I:%M %p";

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y:%m:%d %H:%M:%S",
];

/// Zone abbreviations seen in exports, as offsets east of UTC in minutes.
const ZONES: &[(&str, i32)] = &[
    ("UTC", 0),
    ("GMT", 0),
    ("Z", 0),
    ("WET", 0),
    ("BST", 60),
    ("CET", 60),
    ("CEST", 120),
    ("EET", 120),
    ("EEST", 180),
    ("IST", 330),
    ("JST", 540),
    ("AEST", 600),
    ("AEDT", 660),
    ("HST", -600),
    ("AKST", -540),
    ("AKDT", -480),
    ("PST", -480),
    ("PDT", -420),
    ("MST", -420),
    ("MDT", -360),
    ("CST", -360),
    ("CDT", -300),
    ("EST", -300),
    ("EDT", -240),
];

fn zone_offset(abbrev: &str) -> Option<FixedOffset> {
    let upper = abbrev.to_ascii_uppercase();
    ZONES
        .iter()
        .find(|(name, _)| *name == upper)
        .and_then(|(_, minutes)| FixedOffset::east_opt(minutes * 60))
}

fn utc() -> FixedOffset {
    Utc.fix()
}

/// Parse a sidecar capture timestamp.
///
/// Accepts RFC 3339, offset-less ISO-8601 (read as UTC) and the iCloud text
/// form with an optional trailing zone abbreviation. Unknown abbreviations are
/// read as UTC. Returns `None` for empty or unrecognised input.
pub fn parse_capture_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return utc().from_local_datetime(&naive).single();
        }
    }

    parse_icloud(s)
}

fn parse_icloud(s: &str) -> Option<DateTime<FixedOffset>> {
    let mut parts: Vec<&str> = s.split_whitespace().collect();

    let mut offset = utc();
    if let Some(last) = parts.last() {
        let is_meridiem = last.eq_ignore_ascii_case("AM") || last.eq_ignore_ascii_case("PM");
        if !is_meridiem && last.len() <= 5 && last.chars().all(|c| c.is_ascii_alphabetic()) {
            offset = zone_offset(last).unwrap_or_else(utc);
            parts.pop();
        }
    }

    // Leading weekday is redundant and not checked against the date.
    if parts
        .first()
        .is_some_and(|w| w.trim_end_matches(',').parse::<Weekday>().is_ok())
    {
        parts.remove(0);
    }

    let text = parts.join(" ").replace(", ", ",");
    let naive = NaiveDateTime::parse_from_str(&text, ICLOUD_FORMAT).ok()?;
    offset.from_local_datetime(&naive).single()
}

/// Wall-clock value as ExifTool expects it (`YYYY:MM:DD HH:MM:SS`).
pub fn exif_datetime(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%Y:%m:%d %H:%M:%S").to_string()
}

/// Offset as ExifTool expects it for `OffsetTime*` tags (`+HH:MM`).
pub fn exif_offset(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%:z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_icloud_format() {
        assert_eq!(
            parse_capture_time("Monday January 2,2023 3:45 PM GMT"),
            Some(at("2023-01-02T15:45:00+00:00"))
        );
        assert_eq!(
            parse_capture_time("Saturday July 15,2017 12:05 AM"),
            Some(at("2017-07-15T00:05:00+00:00"))
        );
        assert_eq!(
            parse_capture_time("Friday, March 3, 2023 9:07 AM PST"),
            Some(at("2023-03-03T09:07:00-08:00"))
        );
    }

    #[test]
    fn test_unknown_zone_reads_as_utc() {
        assert_eq!(
            parse_capture_time("Monday January 2,2023 3:45 PM XYZ"),
            Some(at("2023-01-02T15:45:00+00:00"))
        );
    }

    #[test]
    fn test_iso_formats() {
        assert_eq!(
            parse_capture_time("2021-06-01T10:20:30+02:00"),
            Some(at("2021-06-01T10:20:30+02:00"))
        );
        assert_eq!(
            parse_capture_time("2021-06-01T10:20:30Z"),
            Some(at("2021-06-01T10:20:30+00:00"))
        );
        assert_eq!(
            parse_capture_time("2021-06-01 10:20:30"),
            Some(at("2021-06-01T10:20:30+00:00"))
        );
    }

    #[test]
    fn test_absent_values() {
        assert_eq!(parse_capture_time(""), None);
        assert_eq!(parse_capture_time("   "), None);
        assert_eq!(parse_capture_time("not a date"), None);
        assert_eq!(parse_capture_time("Monday Smarch 2,2023 3:45 PM"), None);
    }

    #[test]
    fn test_exif_strings() {
        let dt = at("2023-03-03T09:07:05-08:00");
        assert_eq!(exif_datetime(&dt), "2023:03:03 09:07:05");
        assert_eq!(exif_offset(&dt), "-08:00");
    }
}
