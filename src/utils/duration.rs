//! Human-readable durations for task timeouts.
//!
//! Accepted units are `ms`, `s`, `m`, `h` and `d`, and they can be combined:
//! `"500ms"`, `"30s"`, `"1m30s"`, `"2h"`.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing durations.
#[derive(Debug, Error, PartialEq)]
pub enum DurationParseError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration format: {0}")]
    InvalidFormat(String),

    #[error("invalid numeric value: {0}")]
    InvalidNumber(String),

    #[error("unknown time unit: {0}")]
    UnknownUnit(String),
}

/// Parse a duration such as `"1s"`, `"250ms"` or `"1h30m"`.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total_ms = 0u64;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
            number.push(c);
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
            chars.next();
        }

        if number.is_empty() {
            return match chars.peek() {
                Some(c) if !c.is_whitespace() && unit.is_empty() => Err(
                    DurationParseError::InvalidFormat(format!("unexpected character: {}", c)),
                ),
                _ if unit.is_empty() => break,
                _ => Err(DurationParseError::InvalidFormat(
                    "unit without preceding number".into(),
                )),
            };
        }
        if unit.is_empty() {
            return Err(DurationParseError::InvalidFormat(
                "number without unit".into(),
            ));
        }

        let value: u64 = number
            .parse()
            .map_err(|_| DurationParseError::InvalidNumber(number.clone()))?;

        let multiplier = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => return Err(DurationParseError::UnknownUnit(other.to_string())),
        };

        total_ms = value
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| DurationParseError::InvalidNumber(format!("{}{}", number, unit)))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration for reports, e.g. `"1m05s"` or `"350ms"`.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    if total_ms < 1_000 {
        return format!("{}ms", total_ms);
    }

    let secs = duration.as_secs();
    if secs < 60 {
        return format!("{:.1}s", duration.as_secs_f64());
    }

    let (hours, rest) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else {
        format!("{}m{:02}s", minutes, seconds)
    }
}
