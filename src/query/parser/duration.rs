//! Duration literals such as `5m`, `1h30m`, `-2d` or `10i`.
//!
//! The `i` unit counts steps, so its value depends on the query step.
//! A bare number is interpreted as seconds.

use super::ast::ParseError;

const MSECS_PER_SECOND: f64 = 1e3;
const MSECS_PER_MINUTE: f64 = 60.0 * MSECS_PER_SECOND;
const MSECS_PER_HOUR: f64 = 60.0 * MSECS_PER_MINUTE;
const MSECS_PER_DAY: f64 = 24.0 * MSECS_PER_HOUR;
const MSECS_PER_WEEK: f64 = 7.0 * MSECS_PER_DAY;
const MSECS_PER_YEAR: f64 = 365.0 * MSECS_PER_DAY;

/// Parses a possibly negative duration and returns milliseconds
pub fn duration_value(s: &str, step: i64) -> Result<i64, ParseError> {
    let invalid = || ParseError::InvalidDuration(s.to_string());
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if body.is_empty() {
        return Err(invalid());
    }

    // Bare number of seconds
    if let Ok(secs) = body.parse::<f64>() {
        if !secs.is_finite() {
            return Err(invalid());
        }
        let ms = (secs * MSECS_PER_SECOND) as i64;
        return Ok(if negative { -ms } else { ms });
    }

    let mut total = 0.0;
    let mut rest = body;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let n: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "ms" => 1.0,
            "s" => MSECS_PER_SECOND,
            "m" => MSECS_PER_MINUTE,
            "h" => MSECS_PER_HOUR,
            "d" => MSECS_PER_DAY,
            "w" => MSECS_PER_WEEK,
            "y" => MSECS_PER_YEAR,
            "i" => step as f64,
            _ => return Err(invalid()),
        };
        total += n * unit_ms;
        rest = &rest[unit_len..];
    }

    let ms = total.round() as i64;
    Ok(if negative { -ms } else { ms })
}

/// Like `duration_value`, but rejects negative durations
pub fn positive_duration_value(s: &str, step: i64) -> Result<i64, ParseError> {
    let d = duration_value(s, step)?;
    if d < 0 {
        return Err(ParseError::NegativeDuration(s.to_string()));
    }
    Ok(d)
}
