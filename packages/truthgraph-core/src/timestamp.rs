//! Point-in-time values used for every validity interval in the graph.
//!
//! Timestamps are UTC, truncated to microseconds, and stored in the graph as
//! integer microseconds since the epoch. `Timestamp::now()` never returns the
//! same value twice within a process, so writes on one branch are totally
//! ordered by their `from` time.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{GraphError, Result};

static LAST_ISSUED: AtomicI64 = AtomicI64::new(i64::MIN);

/// Immutable UTC instant with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Current time, strictly greater than any value previously issued by this process
    pub fn now() -> Self {
        let wall = Utc::now().timestamp_micros();
        let mut prev = LAST_ISSUED.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match LAST_ISSUED.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Self { micros: next },
                Err(actual) => prev = actual,
            }
        }
    }

    /// `None` means "now"
    pub fn resolve(at: Option<Timestamp>) -> Self {
        at.unwrap_or_else(Self::now)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            micros: dt.timestamp_micros(),
        }
    }

    /// Parse any RFC 3339 string; offsets are normalized to UTC
    pub fn parse(value: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(value.trim())
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|e| GraphError::validation("timestamp", format!("'{}' is not a valid timestamp: {}", value, e)))
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.micros)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Canonical string form: `YYYY-MM-DDTHH:MM:SS.ffffffZ`
    pub fn to_canonical(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// A new timestamp shifted by `delta` microseconds
    pub fn add_micros(&self, delta: i64) -> Self {
        Self {
            micros: self.micros.saturating_add(delta),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical())
    }
}

impl FromStr for Timestamp {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Timestamp::parse(&raw).map_err(serde::de::Error::custom)
    }
}
