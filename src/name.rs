//! Snapshot name grammar (C1): `<prefix>-YYYYMMDD.HHMM-<N><unit>[-<seq>]`.
//!
//! The wire-visible grammar (spec §6) is a regex; we compile it once and use
//! it for both validation and field extraction, then reassemble the name
//! from parsed fields for `format` (round-trip invariant 1/2 in spec §8).

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;

use crate::error::ReplicationError;

const DEFAULT_PREFIX: &str = "auto";

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<prefix>\w+)-(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})\.(?P<hour>\d{2})(?P<minute>\d{2})-(?P<lifetime>\d+[hdwmy])(-(?P<sequence>\d+))?$",
        )
        .expect("snapshot name grammar is a valid regex")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl LifetimeUnit {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'h' => Some(Self::Hour),
            'd' => Some(Self::Day),
            'w' => Some(Self::Week),
            'm' => Some(Self::Month),
            'y' => Some(Self::Year),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'm',
            Self::Year => 'y',
        }
    }
}

/// A lifetime tag embedded in a snapshot name, e.g. `7d` or `1y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lifetime {
    pub amount: u32,
    pub unit: LifetimeUnit,
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.as_char())
    }
}

impl Lifetime {
    pub fn parse(s: &str) -> Result<Self, ReplicationError> {
        let unit_char = s
            .chars()
            .last()
            .ok_or_else(|| ReplicationError::InvalidName(s.to_string()))?;
        let unit = LifetimeUnit::from_char(unit_char)
            .ok_or_else(|| ReplicationError::InvalidName(s.to_string()))?;
        let amount: u32 = s[..s.len() - 1]
            .parse()
            .map_err(|_| ReplicationError::InvalidName(s.to_string()))?;
        Ok(Self { amount, unit })
    }
}

/// A parsed snapshot name: `<prefix>-YYYYMMDD.HHMM-<lifetime>[-<seq>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub prefix: String,
    pub creation: DateTime<Utc>,
    pub lifetime: Lifetime,
    pub seq: Option<u32>,
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.prefix,
            self.creation.format("%Y%m%d.%H%M"),
            self.lifetime
        )?;
        if let Some(seq) = self.seq {
            write!(f, "-{seq}")?;
        }
        Ok(())
    }
}

impl SnapshotName {
    /// Build a canonical name for `now`, without a disambiguating sequence.
    pub fn new(prefix: &str, now: DateTime<Utc>, lifetime: Lifetime) -> Self {
        Self {
            prefix: prefix.to_string(),
            creation: now,
            lifetime,
            seq: None,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn parse(s: &str) -> Result<Self, ReplicationError> {
        let caps = pattern()
            .captures(s)
            .ok_or_else(|| ReplicationError::InvalidName(s.to_string()))?;

        let year: i32 = caps["year"].parse().unwrap();
        let month: u32 = caps["month"].parse().unwrap();
        let day: u32 = caps["day"].parse().unwrap();
        let hour: u32 = caps["hour"].parse().unwrap();
        let minute: u32 = caps["minute"].parse().unwrap();

        let creation = Utc
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .ok_or_else(|| ReplicationError::InvalidName(s.to_string()))?;

        let lifetime = Lifetime::parse(&caps["lifetime"])?;
        let seq = caps
            .name("sequence")
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map_err(|_| ReplicationError::InvalidName(s.to_string()))?;

        Ok(Self {
            prefix: caps["prefix"].to_string(),
            creation,
            lifetime,
            seq,
        })
    }
}

impl Default for SnapshotName {
    fn default() -> Self {
        Self::new(
            DEFAULT_PREFIX,
            Utc::now(),
            Lifetime {
                amount: 1,
                unit: LifetimeUnit::Year,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SnapshotName {
        SnapshotName::new(
            "auto",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Lifetime {
                amount: 7,
                unit: LifetimeUnit::Day,
            },
        )
    }

    #[test]
    fn round_trips_without_seq() {
        let name = sample();
        let formatted = name.to_string();
        assert_eq!(formatted, "auto-20240101.0000-7d");
        assert_eq!(SnapshotName::parse(&formatted).unwrap(), name);
    }

    #[test]
    fn round_trips_with_seq() {
        let name = sample().with_seq(3);
        let formatted = name.to_string();
        assert_eq!(formatted, "auto-20240101.0000-7d-3");
        assert_eq!(SnapshotName::parse(&formatted).unwrap(), name);
    }

    #[test]
    fn creation_survives_format_then_parse() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 13, 37, 0).unwrap();
        let lifetime = Lifetime {
            amount: 1,
            unit: LifetimeUnit::Month,
        };
        let formatted = SnapshotName::new("repl", now, lifetime).to_string();
        let parsed = SnapshotName::parse(&formatted).unwrap();
        assert_eq!(parsed.creation, now);
    }

    #[test]
    fn rejects_bad_unit() {
        let err = SnapshotName::parse("auto-20240101.0000-7x").unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidName(_)));
    }

    #[test]
    fn rejects_malformed_grammar() {
        assert!(SnapshotName::parse("not-a-snapshot-name").is_err());
        assert!(SnapshotName::parse("auto-2024-01-01-7d").is_err());
    }

    #[test]
    fn tolerates_and_preserves_sequence() {
        let parsed = SnapshotName::parse("auto-20240101.0000-7d-42").unwrap();
        assert_eq!(parsed.seq, Some(42));
    }
}
