use std::time::Duration;

use serde::de::{self, Deserialize, Deserializer};

use crate::types::TimestampMillis;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}

/// Parses an ISO-8601 duration string, e.g. `PT1M`, `PT30S`, `P14D`,
/// `P1DT2H30M`. Calendar units use fixed lengths: a month is 30 days, a year
/// 365 days.
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let body = s
        .strip_prefix(['P', 'p'])
        .ok_or_else(|| anyhow::anyhow!("invalid ISO-8601 duration, missing 'P': {:?}", s))?;
    if body.is_empty() {
        return Err(anyhow::anyhow!("invalid ISO-8601 duration, empty: {:?}", s));
    }

    let mut secs = 0u64;
    let mut nanos = 0u32;
    let mut in_time = false;
    let mut num = String::new();

    for c in body.chars() {
        match c {
            'T' | 't' => {
                if in_time || !num.is_empty() {
                    return Err(anyhow::anyhow!("invalid ISO-8601 duration: {:?}", s));
                }
                in_time = true;
            }
            '0'..='9' | '.' => num.push(c),
            unit => {
                let value: f64 =
                    num.parse().map_err(|_| anyhow::anyhow!("invalid ISO-8601 duration: {:?}", s))?;
                num.clear();
                let unit_secs = match (unit.to_ascii_uppercase(), in_time) {
                    ('Y', false) => 365 * 86400,
                    ('M', false) => 30 * 86400,
                    ('W', false) => 7 * 86400,
                    ('D', false) => 86400,
                    ('H', true) => 3600,
                    ('M', true) => 60,
                    ('S', true) => 1,
                    _ => return Err(anyhow::anyhow!("invalid ISO-8601 duration unit {:?}: {:?}", unit, s)),
                };
                let total = value * unit_secs as f64;
                secs += total.trunc() as u64;
                nanos += (total.fract() * 1_000_000_000.0).round() as u32;
            }
        }
    }
    if !num.is_empty() {
        return Err(anyhow::anyhow!("invalid ISO-8601 duration, trailing number: {:?}", s));
    }

    Ok(Duration::new(secs + (nanos / 1_000_000_000) as u64, nanos % 1_000_000_000))
}

/// Serde helper for duration fields given as ISO-8601 strings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    parse_duration(&v).map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_units() {
        assert_eq!(parse_duration("PT1M").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("PT1H30M15S").unwrap(), Duration::from_secs(5415));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parse_date_units() {
        assert_eq!(parse_duration("P14D").unwrap(), Duration::from_secs(14 * 86400));
        assert_eq!(parse_duration("P1W").unwrap(), Duration::from_secs(7 * 86400));
        assert_eq!(parse_duration("P1DT2H").unwrap(), Duration::from_secs(86400 + 7200));
        assert_eq!(parse_duration("P1M").unwrap(), Duration::from_secs(30 * 86400));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("P").is_err());
        assert!(parse_duration("1M").is_err());
        assert!(parse_duration("PT1X").is_err());
        assert!(parse_duration("PT1").is_err());
        // date-position seconds are not a thing
        assert!(parse_duration("P1S").is_err());
    }
}
