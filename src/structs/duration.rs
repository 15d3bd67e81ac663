//! Go-style duration strings ("90s", "1h30m", "250ms") used on the wire.

use std::time::Duration;

use crate::error::{ControlError, Result};

/// Parse a duration such as `"5m"`, `"1h30m"`, `"250ms"` or a bare number of
/// seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ControlError::InvalidArgument("empty duration".to_string()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| invalid(input))?;
        if digits == 0 {
            return Err(invalid(input));
        }
        let value: f64 = rest[..digits].parse().map_err(|_| invalid(input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let nanos_per_unit: f64 = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid(input)),
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
    }
    Ok(total)
}

fn invalid(input: &str) -> ControlError {
    ControlError::InvalidArgument(format!("invalid duration {:?}", input))
}

/// Format a duration the way `parse_duration` reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d.subsec_nanos() != 0 && d.as_secs() == 0 {
        return format!("{}ms", d.as_millis());
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    let millis = d.subsec_millis();
    if secs > 0 || millis > 0 || out.is_empty() {
        if millis > 0 {
            out.push_str(&format!("{}.{:03}s", secs, millis));
        } else {
            out.push_str(&format!("{}s", secs));
        }
    }
    out
}

/// `#[serde(with = "go_duration")]` for `Duration` fields.
pub mod go_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
