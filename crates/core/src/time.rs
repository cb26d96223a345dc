//! Points in time as seen by scripts.
//!
//! A `Time` carries a UTC wall-clock date and, when taken with [`Time::now`],
//! a high-resolution offset from a monotonic clock. Differences between two
//! times prefer the monotonic component when both sides have it.

use crate::codec::{CodecError, ProtocolVersion, Reader, Result, Writer};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

const HAS_DATETIME: u8 = 0x01;
const HAS_HIGH_PERF: u8 = 0x02;

const TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn monotonic_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Time {
    date_time: Option<DateTime<Utc>>,
    /// Seconds since the process-wide monotonic origin.
    high_perf: Option<f64>,
}

impl Time {
    pub fn now() -> Self {
        let origin = monotonic_origin();
        Time {
            date_time: Some(Utc::now()),
            high_perf: Some(origin.elapsed().as_secs_f64()),
        }
    }

    pub fn from_date_time(date_time: DateTime<Utc>) -> Self {
        Time {
            date_time: Some(date_time),
            high_perf: None,
        }
    }

    /// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]`, `YYYY-MM-DDTHH:MM:SS[.fff]`
    /// or a bare `YYYY-MM-DD` date (midnight UTC).
    pub fn from_text(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Some(Self::from_date_time(parsed.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                return Some(Self::from_date_time(Utc.from_utc_datetime(&naive)));
            }
        }
        let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
        let naive = date.and_hms_opt(0, 0, 0)?;
        Some(Self::from_date_time(Utc.from_utc_datetime(&naive)))
    }

    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        self.date_time
    }

    pub fn high_perf(&self) -> Option<f64> {
        self.high_perf
    }

    pub fn is_valid(&self) -> bool {
        self.date_time.is_some() || self.high_perf.is_some()
    }

    pub fn as_text(&self) -> String {
        match self.date_time {
            Some(date_time) => date_time.format(TEXT_FORMAT).to_string(),
            None => match self.high_perf {
                Some(secs) => format!("{:.3}", secs),
                None => String::new(),
            },
        }
    }

    /// Seconds elapsed from `earlier` to `self`.
    pub fn seconds_since(&self, earlier: &Time) -> f64 {
        if let (Some(a), Some(b)) = (self.high_perf, earlier.high_perf) {
            return a - b;
        }
        match (self.date_time, earlier.date_time) {
            (Some(a), Some(b)) => {
                let delta = a - b;
                delta.num_microseconds().map_or_else(
                    || delta.num_milliseconds() as f64 / 1e3,
                    |micros| micros as f64 / 1e6,
                )
            }
            _ => 0.0,
        }
    }

    /// Shifts the time by a (possibly negative, possibly fractional) number
    /// of seconds. Out-of-range shifts leave the date component unchanged.
    pub fn add_seconds(&self, seconds: f64) -> Time {
        let micros = (seconds * 1e6).round() as i64;
        Time {
            date_time: self
                .date_time
                .map(|dt| dt.checked_add_signed(Duration::microseconds(micros)).unwrap_or(dt)),
            high_perf: self.high_perf.map(|hp| hp + seconds),
        }
    }

    pub fn compare(&self, other: &Time) -> Ordering {
        let delta = self.seconds_since(other);
        delta.partial_cmp(&0.0).unwrap_or(Ordering::Equal)
    }

    pub fn serialize(&self, to: &mut Writer) {
        let with_high_perf = to.version() >= ProtocolVersion::V2;
        let mut flags = 0u8;
        if self.date_time.is_some() {
            flags |= HAS_DATETIME;
        }
        if with_high_perf && self.high_perf.is_some() {
            flags |= HAS_HIGH_PERF;
        }
        to.write_u8(flags);
        if let Some(date_time) = self.date_time {
            to.write_i64(date_time.timestamp());
            to.write_u32(date_time.timestamp_subsec_nanos());
        }
        if let (true, Some(high_perf)) = (with_high_perf, self.high_perf) {
            to.write_f64(high_perf);
        }
    }

    pub fn deserialize(from: &mut Reader<'_>) -> Result<Time> {
        let flags = from.read_u8()?;
        if flags & !(HAS_DATETIME | HAS_HIGH_PERF) != 0 {
            return Err(CodecError::Invalid(format!("invalid time flags {:#04x}", flags)));
        }
        let date_time = if flags & HAS_DATETIME != 0 {
            let secs = from.read_i64()?;
            let nanos = from.read_u32()?;
            Some(DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
                CodecError::Invalid(format!("time stamp {}.{:09} out of range", secs, nanos))
            })?)
        } else {
            None
        };
        let high_perf = if flags & HAS_HIGH_PERF != 0 {
            if from.version() < ProtocolVersion::V2 {
                return Err(CodecError::Invalid(
                    "high-resolution time in a version 1 stream".to_string(),
                ));
            }
            Some(from.read_f64()?)
        } else {
            None
        };
        Ok(Time {
            date_time,
            high_perf,
        })
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        let a = Time::from_text("2024-03-01 12:30:05.250").unwrap();
        assert_eq!(a.as_text(), "2024-03-01 12:30:05.250");

        let b = Time::from_text("2024-03-01T12:30:05Z").unwrap();
        assert_eq!(b.as_text(), "2024-03-01 12:30:05.000");

        let c = Time::from_text("2024-03-01").unwrap();
        assert_eq!(c.as_text(), "2024-03-01 00:00:00.000");

        assert!(Time::from_text("yesterday").is_none());
    }

    #[test]
    fn test_difference_and_shift() {
        let a = Time::from_text("2024-03-01 00:00:00").unwrap();
        let b = a.add_seconds(90.5);
        assert_eq!(b.seconds_since(&a), 90.5);
        assert_eq!(b.compare(&a), Ordering::Greater);
        assert_eq!(b.add_seconds(-90.5), a);
    }

    #[test]
    fn test_now_uses_monotonic_component() {
        let a = Time::now();
        let b = Time::now();
        assert!(a.high_perf().is_some());
        assert!(b.seconds_since(&a) >= 0.0);
    }

    #[test]
    fn test_version_one_drops_high_resolution() {
        let time = Time::now();

        let mut v1 = Writer::with_version(ProtocolVersion::V1);
        time.serialize(&mut v1);
        let bytes = v1.into_bytes();
        let back = Time::deserialize(&mut Reader::with_version(&bytes, ProtocolVersion::V1))
            .unwrap();
        assert_eq!(back.date_time(), time.date_time());
        assert_eq!(back.high_perf(), None);

        let mut v2 = Writer::new();
        time.serialize(&mut v2);
        let bytes = v2.into_bytes();
        let back = Time::deserialize(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(back, time);
    }

    #[test]
    fn test_bad_flags_rejected() {
        let mut reader = Reader::new(&[0x80]);
        assert!(Time::deserialize(&mut reader).is_err());
    }
}
