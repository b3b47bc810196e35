#![deny(unsafe_code)]

//! Small helpers shared by every fluxmq crate.
//!
//! - [`Bytesize`] parses `"1M"`, `"32K"`, `"2G512M"` style sizes from configuration.
//! - [`to_duration`] parses `"30s"`, `"5m"`, `"1h30m"`, `"100ms"` style durations.
//! - `timestamp_*` return wall-clock time as used by session and message expiry.

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

pub type Timestamp = i64;
pub type TimestampMillis = i64;

const KB: usize = 1024;
const MB: usize = 1024 * KB;
const GB: usize = 1024 * MB;

/// A byte count that (de)serializes from a human-readable string.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        u32::try_from(self.0).unwrap_or(u32::MAX)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn string(&self) -> String {
        let mut rest = self.0;
        let mut out = String::new();
        for (unit, suffix) in [(GB, 'G'), (MB, 'M'), (KB, 'K')] {
            let n = rest / unit;
            if n > 0 {
                out.push_str(&n.to_string());
                out.push(suffix);
                rest %= unit;
            }
        }
        if rest > 0 || out.is_empty() {
            out.push_str(&rest.to_string());
            out.push('B');
        }
        out
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;
        Ok(Bytesize::from(v.as_str()))
    }
}

/// Parses sizes such as `"512"`, `"64K"`, `"1M"` or `"2G512M"`. Unknown segments count as zero.
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase();
    let mut total = 0usize;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'G' => GB,
            'M' => MB,
            'K' => KB,
            'B' => 1,
            _ => 0,
        };
        total = total.saturating_add(digits.parse::<usize>().unwrap_or(0).saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        total = total.saturating_add(digits.parse::<usize>().unwrap_or(0));
    }
    total
}

/// Parses durations such as `"15s"`, `"1h30m"`, `"250ms"`. A bare number is read as seconds.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    let mut millis = 0u64;
    let mut digits = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n = digits.parse::<u64>().unwrap_or(0);
        digits.clear();
        let unit = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            'w' => 604_800_000,
            _ => 0,
        };
        millis = millis.saturating_add(n.saturating_mul(unit));
    }
    Duration::from_millis(millis)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(to_duration(&v)))
    }
}

#[inline]
pub fn deserialize_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer)?.parse::<SocketAddr>().map_err(de::Error::custom)
}

pub fn deserialize_addrs<'de, D>(deserializer: D) -> Result<Vec<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|addr| addr.parse::<SocketAddr>().map_err(de::Error::custom))
        .collect()
}

#[inline]
pub fn timestamp() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    timestamp().as_secs() as Timestamp
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    timestamp().as_millis() as TimestampMillis
}

pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    match chrono::DateTime::from_timestamp_millis(t) {
        Some(t) => t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => String::new(),
    }
}
