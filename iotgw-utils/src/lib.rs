//! Small helpers shared by the gateway crates.
//!
//! - [`Bytesize`]: `"1M"` / `"512K"` style sizes with serde support
//! - [`to_duration`]: `"1h30m15s"` / `"200ms"` style durations, plus serde adapters
//! - millisecond timestamps and their formatting
//!
//! ```
//! use iotgw_utils::{to_duration, Bytesize};
//!
//! assert_eq!(Bytesize::from("1M512K").as_usize(), 1_572_864);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("200ms").as_millis(), 200);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1024 * 1024;
const BYTESIZE_G: usize = 1024 * 1024 * 1024;

/// Human-readable byte size.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
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
        let mut v = self.0;
        let mut res = String::new();
        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            if v >= size {
                res.push_str(&format!("{}{}", v / size, unit));
                v %= size;
            }
        }
        if v > 0 || res.is_empty() {
            res.push_str(&format!("{v}B"));
        }
        res
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
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string())
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
        Ok(Bytesize::from(String::deserialize(deserializer)?.as_str()))
    }
}

/// Parses `2G512M`, `64KB`, `100B` or a bare number of bytes. Unparsable parts count as zero.
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(v) = text.parse::<usize>() {
        return v;
    }
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|part| {
            let mut chars = part.chars();
            let (Some(unit), Ok(v)) = (chars.next_back(), chars.as_str().parse::<usize>()) else {
                return 0;
            };
            match unit {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Parses `ms`, `s`, `m`, `h`, `d` and `w` units, e.g. `1h30m15s`. A bare number is seconds.
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    let text = text.replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|part| {
            let mut chars = part.chars();
            let (Some(unit), Ok(v)) = (chars.next_back(), chars.as_str().parse::<u64>()) else {
                return 0;
            };
            match unit {
                'Y' => v,
                's' => v * 1_000,
                'm' => v * 60_000,
                'h' => v * 3_600_000,
                'd' => v * 86_400_000,
                'w' => v * 604_800_000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Text(String),
    Secs(u64),
}

/// Deserialize a Duration from `"30s"` style text or a number of seconds.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match DurationValue::deserialize(deserializer)? {
        DurationValue::Text(v) => to_duration(&v),
        DurationValue::Secs(v) => Duration::from_secs(v),
    })
}

/// Deserialize a non-empty string, rejecting blank values.
pub fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    if v.trim().is_empty() {
        return Err(de::Error::custom("value must not be empty"));
    }
    Ok(v)
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    chrono::DateTime::from_timestamp_millis(t)
        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytesize() {
        assert_eq!(to_bytesize("1024"), 1024);
        assert_eq!(to_bytesize("1K"), 1024);
        assert_eq!(to_bytesize("64kb"), 64 * 1024);
        assert_eq!(to_bytesize("2G512M"), 2_684_354_560);
        assert_eq!(Bytesize(3 * BYTESIZE_M + 1).string(), "3M1B");
        assert_eq!(Bytesize(0).string(), "0B");
    }

    #[test]
    fn test_duration() {
        assert_eq!(to_duration("1h30m15s"), Duration::from_secs(5415));
        assert_eq!(to_duration("200ms"), Duration::from_millis(200));
        assert_eq!(to_duration("1m500ms"), Duration::from_millis(60_500));
        assert_eq!(to_duration("15"), Duration::from_secs(15));
        assert_eq!(to_duration("abc"), Duration::ZERO);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp_millis(timestamp_millis()).len(), 23);
    }
}
