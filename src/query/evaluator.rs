//! Query evaluation.
//!
//! `Evaluator` is the seam between the handlers and the expression engine.
//! `SelectorEvaluator` evaluates bare metric selectors: numeric series are
//! sampled on the step grid, series carrying raw payloads are returned as
//! log streams limited to `limit` entries.

use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{SelectError, SelectResult};
use crate::query::params::Deadline;
use crate::query::parser::parse_metric_selector;
use crate::storage::data::SeriesResult;
use crate::storage::netstorage::Storage;
use crate::storage::search::{AuthToken, SearchQuery, TimeRange};

/// Everything an evaluation needs besides the query string
#[derive(Debug, Clone, Copy)]
pub struct EvalConfig {
    pub auth_token: AuthToken,
    pub start: i64,
    pub end: i64,
    pub step: i64,
    /// Maximum number of stream entries; zero or less means no limit
    pub limit: i64,
    /// Keep the oldest entries when `limit` cuts, instead of the newest
    pub forward: bool,
    pub deadline: Deadline,
    pub may_cache: bool,
    /// Lookback window; zero means one step
    pub lookback_delta: i64,
    pub deny_partial_response: bool,
}

/// Shape of an evaluation result, which selects the response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Raw log entries
    Streams,
    /// Numeric samples on the step grid
    Matrix,
}

#[derive(Debug)]
pub struct Evaluation {
    pub results: Vec<SeriesResult>,
    pub kind: ResultKind,
    pub is_partial: bool,
}

pub trait Evaluator: Send + Sync + 'static {
    fn exec(
        &self,
        ec: EvalConfig,
        query: &str,
        is_instant: bool,
    ) -> impl Future<Output = SelectResult<Evaluation>> + Send;
}

/// Evaluates `name{...}` selectors against the storage
pub struct SelectorEvaluator<S> {
    storage: Arc<S>,
}

impl<S: Storage> SelectorEvaluator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

impl<S: Storage> Evaluator for SelectorEvaluator<S> {
    async fn exec(&self, ec: EvalConfig, query: &str, is_instant: bool) -> SelectResult<Evaluation> {
        let filters = parse_metric_selector(query).map_err(|e| {
            SelectError::Evaluation(format!("unsupported expression {:?}: {}", query, e))
        })?;
        let window = if ec.lookback_delta > 0 {
            ec.lookback_delta
        } else {
            ec.step.max(1)
        };
        let tr = TimeRange::new(ec.start.saturating_sub(window), ec.end);
        let sq = SearchQuery::new(ec.auth_token, tr, vec![filters]);

        let rss = self
            .storage
            .process_search_query(&ec.auth_token, &sq, true, &ec.deadline)
            .await?;
        if rss.is_partial() && ec.deny_partial_response {
            rss.cancel();
            return Err(SelectError::IncompleteCluster);
        }
        let is_partial = rss.is_partial();
        let series = rss.into_results();

        let kind = if series.iter().any(|rs| rs.payloads.is_some()) {
            ResultKind::Streams
        } else {
            ResultKind::Matrix
        };
        let results = match kind {
            ResultKind::Streams => {
                let from = if is_instant {
                    ec.start.saturating_sub(window).saturating_add(1)
                } else {
                    ec.start
                };
                select_entries(series, from, ec.end, ec.limit, ec.forward)
            }
            ResultKind::Matrix => series
                .into_iter()
                .map(|rs| sample_on_grid(rs, ec.start, ec.end, ec.step.max(1), window))
                .collect(),
        };
        debug!(
            series = results.len(),
            is_partial,
            "evaluated {:?} on [{}, {}]", query, ec.start, ec.end
        );
        Ok(Evaluation {
            results,
            kind,
            is_partial,
        })
    }
}

/// Value of the last sample in `(t - window, t]` for every grid point
/// `start, start + step, ..., <= end`. Points without a sample are NaN.
fn sample_on_grid(rs: SeriesResult, start: i64, end: i64, step: i64, window: i64) -> SeriesResult {
    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    let mut t = start;
    while t <= end {
        let i = rs.timestamps.partition_point(|&ts| ts <= t);
        let v = match i.checked_sub(1) {
            Some(j) if rs.timestamps[j] > t - window => rs.values[j],
            _ => f64::NAN,
        };
        timestamps.push(t);
        values.push(v);
        t = match t.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    SeriesResult::new(rs.metric_name, timestamps, values)
}

/// Keeps entries in `[from, end]`, at most `limit` of them across all series:
/// the oldest when `forward`, the newest otherwise. Entry order within a
/// series is preserved.
fn select_entries(
    series: Vec<SeriesResult>,
    from: i64,
    end: i64,
    limit: i64,
    forward: bool,
) -> Vec<SeriesResult> {
    let mut keep: Vec<Vec<bool>> = series
        .iter()
        .map(|rs| rs.timestamps.iter().map(|&t| t >= from && t <= end).collect())
        .collect();

    if limit > 0 {
        let mut entries: Vec<(i64, usize, usize)> = keep
            .iter()
            .enumerate()
            .flat_map(|(i, mask)| {
                mask.iter()
                    .enumerate()
                    .filter(|(_, &k)| k)
                    .map(move |(j, _)| (i, j))
            })
            .map(|(i, j)| (series[i].timestamps[j], i, j))
            .collect();
        if entries.len() as i64 > limit {
            if forward {
                entries.sort_unstable();
            } else {
                entries.sort_unstable_by(|a, b| b.cmp(a));
            }
            for &(_, i, j) in &entries[limit as usize..] {
                keep[i][j] = false;
            }
        }
    }

    series
        .into_iter()
        .zip(keep)
        .filter_map(|(rs, mask)| {
            let mut timestamps = Vec::new();
            let mut values = Vec::new();
            let mut payloads = Vec::new();
            let mut src = rs.payloads.unwrap_or_default().into_iter();
            for (j, k) in mask.into_iter().enumerate() {
                let payload = src.next().unwrap_or_default();
                if k {
                    timestamps.push(rs.timestamps[j]);
                    values.push(rs.values[j]);
                    payloads.push(payload);
                }
            }
            if timestamps.is_empty() {
                return None;
            }
            Some(SeriesResult::new(rs.metric_name, timestamps, values).with_payloads(payloads))
        })
        .collect()
}
