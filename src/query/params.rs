//! Request parameters and the derivation of effective query bounds.
//!
//! Times are milliseconds since the Unix epoch. Request values for times and
//! durations are seconds (with an optional fraction) unless they use RFC3339 or
//! a duration literal.

use chrono::DateTime;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SelectConfig;
use crate::error::{SelectError, SelectResult};
use crate::query::parser::positive_duration_value;
use crate::storage::search::AuthToken;

/// Step used when a request doesn't set one
pub const DEFAULT_STEP: i64 = 5 * 60 * 1000;

/// Row limit used when a request doesn't set one
pub const DEFAULT_LIMIT: i64 = 1000;

/// Upper bound for request timestamps
const MAX_TIME_MSECS: i64 = i64::MAX / 1_000_000;

/// Upper bound for request durations
const MAX_DURATION_MSECS: i64 = 100 * 365 * 24 * 3600 * 1000;

/// Ranges shorter than this many points aren't aligned to the step
const MIN_POINTS_FOR_TIME_ROUNDING: i64 = 50;

/// Form values of a request. Keys may repeat, as with `match[]`.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pairs: Vec<(String, String)>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Appends a value, keeping earlier values of the same key
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value of `key`, or `""` when absent
    pub fn get(&self, key: &str) -> &str {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map_or("", |(_, v)| v.as_str())
    }

    /// All values of `key` in request order
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Reports whether `key` was passed at all, even with an empty value
    pub fn has(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// Parses `key` as unix seconds or RFC3339 and returns milliseconds
    /// clamped to the supported range.
    pub fn get_time(&self, key: &str, default_ms: i64) -> SelectResult<i64> {
        let s = self.get(key);
        if s.is_empty() {
            return Ok(default_ms);
        }
        let msecs = match s.parse::<f64>() {
            Ok(secs) if secs.is_finite() => (secs * 1e3) as i64,
            Ok(_) => return Err(SelectError::invalid_arg(key, s, "time must be finite")),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .map_err(|e| SelectError::invalid_arg(key, s, e))?
                .timestamp_millis(),
        };
        Ok(msecs.clamp(0, MAX_TIME_MSECS))
    }

    /// Parses `key` as seconds or a duration literal and returns milliseconds
    pub fn get_duration(&self, key: &str, default_ms: i64) -> SelectResult<i64> {
        let s = self.get(key);
        if s.is_empty() {
            return Ok(default_ms);
        }
        let msecs = match s.parse::<f64>() {
            Ok(secs) if secs.is_finite() => (secs * 1e3) as i64,
            Ok(_) => return Err(SelectError::invalid_arg(key, s, "duration must be finite")),
            Err(_) => positive_duration_value(s, 0).map_err(|e| SelectError::invalid_arg(key, s, e))?,
        };
        if msecs < 0 {
            return Err(SelectError::invalid_arg(key, s, "duration cannot be negative"));
        }
        if msecs > MAX_DURATION_MSECS {
            return Err(SelectError::invalid_arg(
                key,
                s,
                format!("duration cannot exceed {} ms", MAX_DURATION_MSECS),
            ));
        }
        Ok(msecs)
    }

    pub fn get_int64(&self, key: &str, default: i64) -> SelectResult<i64> {
        let s = self.get(key);
        if s.is_empty() {
            return Ok(default);
        }
        s.parse::<i64>()
            .map_err(|e| SelectError::invalid_arg(key, s, e))
    }

    /// Any value other than an empty one, `0`, `f`, `false` or `no` is true
    pub fn get_bool(&self, key: &str) -> bool {
        !matches!(
            self.get(key).to_ascii_lowercase().as_str(),
            "" | "0" | "f" | "false" | "no"
        )
    }

    pub fn get_string<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        let s = self.get(key);
        if s.is_empty() {
            default
        } else {
            s
        }
    }

    /// True when the request or the server forbids partial responses
    pub fn deny_partial_response(&self, config: &SelectConfig) -> bool {
        self.get_bool("deny_partial_response") || config.deny_partial_response
    }

    /// Deadline for regular queries, started at `started`
    pub fn deadline_for_query(&self, started: Instant, config: &SelectConfig) -> Deadline {
        self.deadline_with_max(started, config.max_query_duration(), "max_query_duration_ms")
    }

    /// Deadline for exports, started at `started`
    pub fn deadline_for_export(&self, started: Instant, config: &SelectConfig) -> Deadline {
        self.deadline_with_max(started, config.max_export_duration(), "max_export_duration_ms")
    }

    fn deadline_with_max(&self, started: Instant, max: Duration, setting: &'static str) -> Deadline {
        // An unparsable or non-positive `timeout` falls back to the maximum
        let requested = self
            .get("timeout")
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64);
        let timeout = match requested {
            Some(d) if d < max => d,
            _ => max,
        };
        Deadline::new(started, timeout, setting)
    }
}

/// Absolute point in time by which a request must complete
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    deadline: Instant,
    timeout: Duration,
    setting: &'static str,
}

impl Deadline {
    /// `setting` names the configuration value that caps the timeout
    pub fn new(started: Instant, timeout: Duration, setting: &'static str) -> Self {
        Self {
            deadline: started + timeout,
            timeout,
            setting,
        }
    }

    /// Time left until the deadline; zero once it passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn exceeded(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn instant(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3} seconds (elapsed {:.3} seconds); the timeout can be adjusted with `{}`",
            self.timeout.as_secs_f64(),
            (self.timeout.saturating_sub(self.remaining())).as_secs_f64(),
            self.setting
        )
    }
}

/// Per-request state shared by every handler
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// When the request arrived; deadlines and durations are measured from it
    pub started: Instant,
    /// Wall clock at arrival in milliseconds
    pub now_ms: i64,
    pub auth: AuthToken,
}

impl RequestContext {
    pub fn new(auth: AuthToken) -> Self {
        Self::at(auth, chrono::Utc::now().timestamp_millis())
    }

    /// Context with a fixed wall clock
    pub fn at(auth: AuthToken, now_ms: i64) -> Self {
        Self {
            started: Instant::now(),
            now_ms,
            auth,
        }
    }
}

/// Lookback window: the request's `max_lookback`, else the configured
/// maximum lookback, else the staleness interval. Zero leaves the choice to
/// the caller.
pub fn max_lookback(params: &RequestParams, config: &SelectConfig) -> SelectResult<i64> {
    let mut d = config.max_lookback_ms;
    if d == 0 {
        d = config.max_staleness_interval_ms;
    }
    params.get_duration("max_lookback", d)
}

/// Forces a non-empty range: `start >= end` yields `end = start + DEFAULT_STEP`
pub fn ensure_range(start: i64, end: i64) -> (i64, i64) {
    if start >= end {
        (start, start.saturating_add(DEFAULT_STEP))
    } else {
        (start, end)
    }
}

pub fn check_query_len(query: &str, config: &SelectConfig) -> SelectResult<()> {
    if query.len() > config.max_query_len {
        return Err(SelectError::QueryTooLong {
            len: query.len(),
            max: config.max_query_len,
        });
    }
    Ok(())
}

/// Fails when a single series would produce more than `max_points` points
pub fn validate_max_points_per_timeseries(
    start: i64,
    end: i64,
    step: i64,
    max_points: i64,
) -> SelectResult<()> {
    if step <= 0 {
        return Err(SelectError::invalid_arg("step", step.to_string(), "step must be positive"));
    }
    let points = (end - start) / step + 1;
    if points > max_points {
        return Err(SelectError::TooManyPoints {
            start,
            end,
            step,
            points,
            max: max_points,
        });
    }
    Ok(())
}

/// Aligns `start` down and `end` up to multiples of `step` without adding
/// points, so repeated queries hit the same cached range. Short ranges are
/// returned unchanged.
pub fn adjust_start_end(start: i64, end: i64, step: i64) -> (i64, i64) {
    if step <= 0 {
        return (start, end);
    }
    let points = (end - start) / step + 1;
    if points < MIN_POINTS_FOR_TIME_ROUNDING {
        return (start, end);
    }

    let start = start - start % step;
    let mut end = end;
    let adjust = end % step;
    if adjust > 0 {
        end += step - adjust;
    }

    let mut new_points = (end - start) / step + 1;
    while new_points > points {
        end -= step;
        new_points -= 1;
    }
    (start, end)
}
