//! Classification of instant queries into execution shapes.

use crate::error::{SelectError, SelectResult};
use crate::query::parser::{
    duration_value, parse_metric_selector, positive_duration_value, split_rollup_suffix,
};

/// How an instant query is executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape<'a> {
    /// `selector[window] offset d`: raw samples of the window are exported
    /// without evaluation
    SelectorWithRollup {
        selector: &'a str,
        window: String,
        offset: Option<String>,
    },
    /// `expr[window:step] offset d`: `expr` is evaluated as a range query over
    /// the window
    Rollup {
        expr: &'a str,
        window: String,
        step: Option<String>,
        offset: Option<String>,
    },
    /// Anything else goes to the evaluator unchanged
    Expression,
}

/// Returns the shape of `query`. Queries that don't lex are left to the
/// evaluator, which reports the syntax error.
pub fn classify(query: &str) -> QueryShape<'_> {
    let Ok(Some(suffix)) = split_rollup_suffix(query) else {
        return QueryShape::Expression;
    };
    if suffix.step.is_none() && parse_metric_selector(suffix.child).is_ok() {
        return QueryShape::SelectorWithRollup {
            selector: suffix.child,
            window: suffix.window,
            offset: suffix.offset,
        };
    }
    QueryShape::Rollup {
        expr: suffix.child,
        window: suffix.window,
        step: suffix.step,
        offset: suffix.offset,
    }
}

/// Step of a rollup: the explicit step when present and positive, else `step`
pub fn rollup_step(step: i64, explicit: Option<&str>) -> SelectResult<i64> {
    let new_step = match explicit {
        Some(s) if !s.is_empty() => positive_duration_value(s, step)
            .map_err(|e| SelectError::invalid_arg("step", s, e))?,
        _ => 0,
    };
    Ok(if new_step > 0 { new_step } else { step })
}

/// Window of a rollup evaluated at `time`: `[time - offset - window, time - offset]`
pub fn rollup_range(
    time: i64,
    step: i64,
    window: &str,
    offset: Option<&str>,
) -> SelectResult<(i64, i64)> {
    let window = if window.is_empty() {
        0
    } else {
        positive_duration_value(window, step)
            .map_err(|e| SelectError::invalid_arg("window", window, e))?
    };
    let offset = match offset {
        Some(s) if !s.is_empty() => {
            duration_value(s, step).map_err(|e| SelectError::invalid_arg("offset", s, e))?
        }
        _ => 0,
    };
    let end = time.saturating_sub(offset);
    Ok((end.saturating_sub(window), end))
}
