//! Human-readable size parsing plus the speed/eta display formatting the
//! worker falls back to when the extractor omits its own display strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid size format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),
}

/// Byte count that deserializes from either an integer or a suffixed string
/// ("100MB", "5G"). Used for the free-space floor and the archive size floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }
        let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if digits_end == 0 {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }
        let num: u64 = s[..digits_end].parse()?;
        let multiplier = match s[digits_end..].trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => return Err(ParseError::InvalidUnit(other.to_string())),
        };
        Ok(ByteSize(num * multiplier))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, unit) = scale(self.0 as f64);
        if value.fract() == 0.0 {
            write!(f, "{}{}", value as u64, unit)
        } else {
            write!(f, "{value:.1}{unit}")
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte size as integer or string such as \"100MB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

fn scale(bytes: f64) -> (f64, &'static str) {
    if bytes >= TIB as f64 {
        (bytes / TIB as f64, "TiB")
    } else if bytes >= GIB as f64 {
        (bytes / GIB as f64, "GiB")
    } else if bytes >= MIB as f64 {
        (bytes / MIB as f64, "MiB")
    } else if bytes >= KIB as f64 {
        (bytes / KIB as f64, "KiB")
    } else {
        (bytes, "B")
    }
}

/// Format a numeric byte rate the way the extractor's own display strings
/// look ("1.25MiB/s").
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec <= 0.0 {
        return String::new();
    }
    let (value, unit) = scale(bytes_per_sec);
    format!("{value:.2}{unit}/s")
}

/// Format a seconds-remaining estimate as "mm:ss" or "hh:mm:ss".
pub fn format_eta(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed() {
        assert_eq!("2048".parse::<ByteSize>().unwrap().as_u64(), 2048);
        assert_eq!("100MB".parse::<ByteSize>().unwrap().as_u64(), 100 * MIB);
        assert_eq!("5 GiB".parse::<ByteSize>().unwrap().as_u64(), 5 * GIB);
        assert_eq!("1k".parse::<ByteSize>().unwrap().as_u64(), KIB);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("MB".parse::<ByteSize>().is_err());
        assert!("12QB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn deserializes_both_forms() {
        #[derive(Deserialize)]
        struct Wrap {
            floor: ByteSize,
        }
        let from_str: Wrap = serde_json::from_str(r#"{"floor": "5MB"}"#).unwrap();
        assert_eq!(from_str.floor.as_u64(), 5 * MIB);
        let from_num: Wrap = serde_json::from_str(r#"{"floor": 512}"#).unwrap();
        assert_eq!(from_num.floor.as_u64(), 512);
    }

    #[test]
    fn speed_formatting() {
        assert_eq!(format_speed(0.0), "");
        assert_eq!(format_speed(1536.0), "1.50KiB/s");
        assert_eq!(format_speed(2.5 * MIB as f64), "2.50MiB/s");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(59), "00:59");
        assert_eq!(format_eta(125), "02:05");
        assert_eq!(format_eta(3725), "01:02:05");
    }

    #[test]
    fn display_rounds_sensibly() {
        assert_eq!(ByteSize(1024).to_string(), "1KiB");
        assert_eq!(ByteSize(1536).to_string(), "1.5KiB");
    }
}
