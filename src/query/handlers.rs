//! Request handlers of the query front end.
//!
//! Every handler takes the form values of a request, the request context and
//! the response sink. Validation happens before any storage call; failures
//! after that are wrapped with the query and time range they happened for.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SelectConfig;
use crate::error::{SelectError, SelectResult};
use crate::metrics;
use crate::query::align::{adjust_last_points, remove_filtered_values_and_timeseries};
use crate::query::dispatcher::{classify, rollup_range, rollup_step, QueryShape};
use crate::query::evaluator::{EvalConfig, Evaluator, ResultKind};
use crate::query::executor::{
    export_in_memory, export_native, export_reduced_memory, stream_response, ExportFormat,
    ExportOptions, FragmentSink,
};
use crate::query::format::{self, ResponseFraming};
use crate::query::params::{
    adjust_start_end, check_query_len, ensure_range, max_lookback,
    validate_max_points_per_timeseries, Deadline, RequestContext, RequestParams, DEFAULT_LIMIT,
    DEFAULT_STEP,
};
use crate::query::parser::parse_metric_selector;
use crate::query::pool::Pools;
use crate::query::tail::{self, Clock, TailSession, TailSource, TAIL_STEP};
use crate::storage::data::{SeriesResult, NAME_LABEL};
use crate::storage::netstorage::Storage;
use crate::storage::search::{AuthToken, SearchQuery, TagFilter, TagFilterOp, TimeRange};

const MSECS_PER_DAY: i64 = 24 * 3600 * 1000;

/// Result of a served request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Some storage nodes didn't contribute to the response
    pub is_partial: bool,
}

/// Range query result before serialization
#[derive(Debug)]
struct RangeResult {
    results: Vec<SeriesResult>,
    kind: ResultKind,
    is_partial: bool,
}

/// The query front end
pub struct Select<S, E> {
    config: Arc<SelectConfig>,
    storage: Arc<S>,
    evaluator: Arc<E>,
    pools: Arc<Pools>,
    http: reqwest::Client,
}

impl<S: Storage, E: Evaluator> Select<S, E> {
    pub fn new(config: SelectConfig, storage: Arc<S>, evaluator: Arc<E>) -> SelectResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.reset_cache_timeout())
            .build()?;
        Ok(Self {
            config: Arc::new(config),
            storage,
            evaluator,
            pools: Arc::new(Pools::default()),
            http,
        })
    }

    pub fn config(&self) -> &SelectConfig {
        &self.config
    }

    /// `/federate`: the last sample of every matching series in the
    /// Prometheus text format
    pub async fn federate<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let matches = match_args(params, false)?;
        let mut lookback = max_lookback(params, &self.config)?;
        if lookback <= 0 {
            lookback = DEFAULT_STEP;
        }
        let mut start = params.get_time("start", ctx.now_ms - lookback)?;
        let end = params.get_time("end", ctx.now_ms)?;
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        if start >= end {
            start = end - DEFAULT_STEP;
        }
        let sq = SearchQuery::new(ctx.auth, TimeRange::new(start, end), tag_filterss(&matches)?);

        let rss = self
            .storage
            .process_search_query(&ctx.auth, &sq, true, &deadline)
            .await
            .map_err(|e| e.context(format!("cannot fetch data for {}", sq)))?;
        let is_partial = rss.is_partial();
        if is_partial && params.deny_partial_response(&self.config) {
            rss.cancel();
            return Err(SelectError::IncompleteCluster);
        }

        stream_response(w, ResponseFraming::STD, Arc::clone(&self.pools), move |sink| {
            rss.run_parallel(move |rs, _worker_id| {
                let sink = sink.clone();
                async move {
                    if sink.is_cancelled() {
                        return Err(SelectError::Cancelled);
                    }
                    let mut buf = sink.buffer();
                    format::write_federate(&mut buf, &rs);
                    sink.send(buf).await
                }
            })
        })
        .await?;
        Ok(finish("/federate", &ctx, is_partial))
    }

    /// `/api/v1/export/native`: raw blocks in the length-prefixed binary format
    pub async fn export_native<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let matches = match_args(params, true)?;
        let start = params.get_time("start", 0)?;
        let end = params.get_time("end", ctx.now_ms)?;
        let deadline = params.deadline_for_export(ctx.started, &self.config);
        let sq = SearchQuery::new(ctx.auth, TimeRange::new(start, end), tag_filterss(&matches)?);
        let deny = params.deny_partial_response(&self.config);

        let partial = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&partial);
        let storage = Arc::clone(&self.storage);
        let at = ctx.auth;
        stream_response(w, ResponseFraming::STD, Arc::clone(&self.pools), move |sink| async move {
            let is_partial = export_native(storage, at, sq, deadline, deny, sink).await?;
            flag.store(is_partial, Ordering::SeqCst);
            Ok(())
        })
        .await?;
        Ok(finish("/api/v1/export/native", &ctx, partial.load(Ordering::SeqCst)))
    }

    /// `/api/v1/export`: raw samples as JSON lines, Prometheus text or a
    /// query API matrix
    pub async fn export<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let matches = match_args(params, true)?;
        let start = params.get_time("start", 0)?;
        let end = params.get_time("end", ctx.now_ms)?;
        let opts = ExportOptions {
            format: ExportFormat::parse(params.get("format")),
            // Unparsable values disable the limit
            max_rows_per_line: params
                .get("max_rows_per_line")
                .parse::<i64>()
                .unwrap_or(0)
                .max(0) as usize,
        };
        let reduce_mem_usage = params.get_bool("reduce_mem_usage");
        let deadline = params.deadline_for_export(ctx.started, &self.config);
        let (start, end) = ensure_range(start, end);

        let is_partial = self
            .export_matches(ctx, params, &matches, start, end, opts, reduce_mem_usage, deadline, w)
            .await
            .map_err(|e| {
                e.context(format!(
                    "error when exporting data for queries={:?} on the time range (start={}, end={})",
                    matches, start, end
                ))
            })?;
        Ok(finish("/api/v1/export", &ctx, is_partial))
    }

    #[allow(clippy::too_many_arguments)]
    async fn export_matches<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        matches: &[String],
        start: i64,
        end: i64,
        opts: ExportOptions,
        reduce_mem_usage: bool,
        deadline: Deadline,
        w: &mut W,
    ) -> SelectResult<bool>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let sq = SearchQuery::new(ctx.auth, TimeRange::new(start, end), tag_filterss(matches)?);
        let deny = params.deny_partial_response(&self.config);
        let framing = opts.format.framing();

        if !reduce_mem_usage {
            let rss = self
                .storage
                .process_search_query(&ctx.auth, &sq, true, &deadline)
                .await
                .map_err(|e| e.context(format!("cannot fetch data for {}", sq)))?;
            let is_partial = rss.is_partial();
            if is_partial && deny {
                rss.cancel();
                return Err(SelectError::IncompleteCluster);
            }
            stream_response(w, framing, Arc::clone(&self.pools), move |sink| {
                export_in_memory(rss, opts, sink)
            })
            .await?;
            return Ok(is_partial);
        }

        let partial = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&partial);
        let storage = Arc::clone(&self.storage);
        let at = ctx.auth;
        let producer = move |sink: FragmentSink| async move {
            let is_partial =
                export_reduced_memory(storage, at, sq, deadline, deny, opts, sink).await?;
            flag.store(is_partial, Ordering::SeqCst);
            Ok(())
        };
        if deny {
            // Blocks stream before the partial flag is known, so the body is
            // held back until the export settles.
            let mut held = Vec::new();
            stream_response(&mut held, framing, Arc::clone(&self.pools), producer).await?;
            w.write_all(&held).await?;
            w.flush().await?;
        } else {
            stream_response(w, framing, Arc::clone(&self.pools), producer).await?;
        }
        Ok(partial.load(Ordering::SeqCst))
    }

    /// `/api/v1/admin/tsdb/delete_series`. Peers are told to drop their
    /// rollup caches once at least one series is gone.
    pub async fn delete_series(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
    ) -> SelectResult<Outcome> {
        for arg in ["start", "end"] {
            let v = params.get(arg);
            if !v.is_empty() {
                return Err(SelectError::invalid_arg(
                    arg,
                    v,
                    "start and end aren't supported; remove these args in order to delete all the matching series",
                ));
            }
        }
        let matches = match_args(params, false)?;
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let sq = SearchQuery::new(ctx.auth, TimeRange::all(), tag_filterss(&matches)?);

        let deleted = self
            .storage
            .delete_series(&ctx.auth, &sq, &deadline)
            .await
            .map_err(|e| e.context(format!("cannot delete time series matching {:?}", matches)))?;
        info!(deleted, "deleted series matching {:?}", matches);
        if deleted > 0 {
            self.reset_rollup_result_caches();
        }
        Ok(finish("/api/v1/admin/tsdb/delete_series", &ctx, false))
    }

    /// Asks every peer query node to drop its rollup result cache. Runs in
    /// the background; the handle yields the number of failed peers.
    pub fn reset_rollup_result_caches(&self) -> JoinHandle<usize> {
        let nodes = self.config.select_nodes.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            if nodes.is_empty() {
                warn!("no select_nodes configured; skipping rollup cache reset");
                return 0;
            }
            let mut failed = 0;
            for node in &nodes {
                let url = format!("http://{}/internal/resetRollupResultCache", node);
                match http.get(&url).send().await {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => {}
                    Ok(resp) => {
                        error!(
                            "unexpected status code at {:?}; got {}; want {}",
                            url,
                            resp.status().as_u16(),
                            reqwest::StatusCode::OK.as_u16()
                        );
                        metrics::record_cache_reset_error();
                        failed += 1;
                    }
                    Err(e) => {
                        error!("error when accessing {:?}: {}", url, e);
                        metrics::record_cache_reset_error();
                        failed += 1;
                    }
                }
            }
            metrics::record_cache_reset_call();
            failed
        })
    }

    /// `/api/v1/label/<name>/values`
    pub async fn label_values<W>(
        &self,
        ctx: RequestContext,
        label_name: &str,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let (values, is_partial) = if !filters_requested(params) {
            self.storage
                .get_label_values(&ctx.auth, label_name, &deadline)
                .await
                .map_err(|e| e.context(format!("cannot obtain label values for {:?}", label_name)))?
        } else {
            let mut matches = params.get_all("match[]");
            if matches.is_empty() {
                matches.push(format!("{{{}!=''}}", label_name));
            }
            let end = params.get_time("end", ctx.now_ms)?;
            let start = params.get_time("start", end - DEFAULT_STEP)?;
            self.label_values_with_matches(ctx.auth, label_name, &matches, start, end, &deadline)
                .await
                .map_err(|e| {
                    e.context(format!(
                        "cannot obtain label values for {:?}, match[]={:?}, start={}, end={}",
                        label_name, matches, start, end
                    ))
                })?
        };
        check_partial(is_partial, params, &self.config)?;
        write_json(w, &format::label_values_response(&values)).await?;
        Ok(finish("/api/v1/label/{}/values", &ctx, is_partial))
    }

    async fn label_values_with_matches(
        &self,
        at: AuthToken,
        label_name: &str,
        matches: &[String],
        start: i64,
        end: i64,
        deadline: &Deadline,
    ) -> SelectResult<(Vec<String>, bool)> {
        let mut tfss = tag_filterss(matches)?;
        // Series without the label don't contribute values. Every series has
        // a name, so `__name__` needs no extra filter.
        if label_name != NAME_LABEL {
            let tf = TagFilter::new(label_name, TagFilterOp::Neq, "")
                .map_err(|e| SelectError::invalid_arg("label", label_name, e))?;
            for tfs in tfss.iter_mut() {
                tfs.push(tf.clone());
            }
        }
        let (start, end) = ensure_range(start, end);
        let sq = SearchQuery::new(at, TimeRange::new(start, end), tfss);
        let rss = self
            .storage
            .process_search_query(&at, &sq, false, deadline)
            .await
            .map_err(|e| e.context(format!("cannot fetch data for {}", sq)))?;
        let is_partial = rss.is_partial();

        let set = Arc::new(Mutex::new(BTreeSet::new()));
        let collected = Arc::clone(&set);
        let label_name = label_name.to_string();
        rss.run_parallel(move |rs, _worker_id| {
            let collected = Arc::clone(&collected);
            let value = rs.metric_name.get_tag_value(&label_name).map(str::to_string);
            async move {
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    collected.lock().await.insert(v);
                }
                Ok(())
            }
        })
        .await
        .map_err(|e| e.context("error when data fetching"))?;

        let values = set.lock().await.iter().cloned().collect();
        Ok((values, is_partial))
    }

    /// `/api/v1/labels/count`
    pub async fn labels_count<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let (entries, is_partial) = self
            .storage
            .get_label_entries(&ctx.auth, &deadline)
            .await
            .map_err(|e| e.context("cannot obtain label entries"))?;
        check_partial(is_partial, params, &self.config)?;
        write_json(w, &format::labels_count_response(&entries)).await?;
        Ok(finish("/api/v1/labels/count", &ctx, is_partial))
    }

    /// `/api/v1/status/tsdb`: cardinality statistics for `date` (`YYYY-MM-DD`,
    /// today by default), `topN` entries per list
    pub async fn tsdb_status<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let date = match params.get("date") {
            "" => (ctx.now_ms / MSECS_PER_DAY).max(0) as u64,
            s => parse_date(s)?,
        };
        let top_n = match params.get("topN") {
            "" => 10,
            s => s
                .parse::<i64>()
                .map_err(|e| SelectError::invalid_arg("topN", s, e))?
                .clamp(1, 1000) as usize,
        };

        let (status, is_partial) = self
            .storage
            .get_tsdb_status_for_date(&ctx.auth, &deadline, date, top_n)
            .await
            .map_err(|e| {
                e.context(format!("cannot obtain tsdb status for date={}, topN={}", date, top_n))
            })?;
        check_partial(is_partial, params, &self.config)?;
        write_json(w, &format::tsdb_status_response(&status)).await?;
        Ok(finish("/api/v1/status/tsdb", &ctx, is_partial))
    }

    /// `/api/v1/labels`
    pub async fn labels<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let (labels, is_partial) = if !filters_requested(params) {
            self.storage
                .get_labels(&ctx.auth, &deadline)
                .await
                .map_err(|e| e.context("cannot obtain labels"))?
        } else {
            let mut matches = params.get_all("match[]");
            if matches.is_empty() {
                matches.push("{__name__!=''}".to_string());
            }
            let end = params.get_time("end", ctx.now_ms)?;
            let start = params.get_time("start", end - DEFAULT_STEP)?;
            self.labels_with_matches(ctx.auth, &matches, start, end, &deadline)
                .await
                .map_err(|e| {
                    e.context(format!(
                        "cannot obtain labels for match[]={:?}, start={}, end={}",
                        matches, start, end
                    ))
                })?
        };
        check_partial(is_partial, params, &self.config)?;
        write_json(w, &format::labels_response(&labels)).await?;
        Ok(finish("/api/v1/labels", &ctx, is_partial))
    }

    async fn labels_with_matches(
        &self,
        at: AuthToken,
        matches: &[String],
        start: i64,
        end: i64,
        deadline: &Deadline,
    ) -> SelectResult<(Vec<String>, bool)> {
        let (start, end) = ensure_range(start, end);
        let sq = SearchQuery::new(at, TimeRange::new(start, end), tag_filterss(matches)?);
        let rss = self
            .storage
            .process_search_query(&at, &sq, false, deadline)
            .await
            .map_err(|e| e.context(format!("cannot fetch data for {}", sq)))?;
        let is_partial = rss.is_partial();

        let set = Arc::new(Mutex::new(BTreeSet::new()));
        let collected = Arc::clone(&set);
        rss.run_parallel(move |rs, _worker_id| {
            let collected = Arc::clone(&collected);
            async move {
                let mut labels = collected.lock().await;
                for tag in rs.metric_name.tags {
                    labels.insert(tag.key);
                }
                labels.insert(NAME_LABEL.to_string());
                Ok(())
            }
        })
        .await
        .map_err(|e| e.context("error when data fetching"))?;

        let labels = set.lock().await.iter().cloned().collect();
        Ok((labels, is_partial))
    }

    /// `/api/v1/series/count`
    pub async fn series_count<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let (n, is_partial) = self
            .storage
            .get_series_count(&ctx.auth, &deadline)
            .await
            .map_err(|e| e.context("cannot obtain series count"))?;
        check_partial(is_partial, params, &self.config)?;
        write_json(w, &format::series_count_response(n)).await?;
        Ok(finish("/api/v1/series/count", &ctx, is_partial))
    }

    /// `/api/v1/series`: label sets of matching series, streamed
    pub async fn series<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let matches = match_args(params, false)?;
        let end = params.get_time("end", ctx.now_ms)?;
        // Scanning from the beginning of time is too expensive on big
        // storages, so the default range is one step.
        let start = params.get_time("start", end - DEFAULT_STEP)?;
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let tfss = tag_filterss(&matches)?;
        let (start, end) = ensure_range(start, end);
        let sq = SearchQuery::new(ctx.auth, TimeRange::new(start, end), tfss);

        let rss = self
            .storage
            .process_search_query(&ctx.auth, &sq, false, &deadline)
            .await
            .map_err(|e| e.context(format!("cannot fetch data for {}", sq)))?;
        let is_partial = rss.is_partial();
        if is_partial && params.deny_partial_response(&self.config) {
            rss.cancel();
            return Err(SelectError::IncompleteCluster);
        }

        stream_response(w, ResponseFraming::SERIES, Arc::clone(&self.pools), move |sink| {
            rss.run_parallel(move |rs, _worker_id| {
                let sink = sink.clone();
                async move {
                    if sink.is_cancelled() {
                        return Err(SelectError::Cancelled);
                    }
                    let mut buf = sink.buffer();
                    format::write_metric_name_object(&mut buf, &rs.metric_name)?;
                    sink.send(buf).await
                }
            })
        })
        .await?;
        Ok(finish("/api/v1/series", &ctx, is_partial))
    }

    /// `/api/v1/query`: instant query at `time`
    pub async fn query<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let query = required_query(params)?;
        let start = params.get_time("time", ctx.now_ms)?;
        let lookback = max_lookback(params, &self.config)?;
        let mut step = params.get_duration("step", lookback)?;
        if step <= 0 {
            step = DEFAULT_STEP;
        }
        let limit = params.get_int64("limit", DEFAULT_LIMIT)?;
        let forward = params.get_string("direction", "backward") == "forward";
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        check_query_len(query, &self.config)?;

        match classify(query) {
            QueryShape::SelectorWithRollup {
                selector,
                window,
                offset,
            } => {
                let (start, end) = rollup_range(start, step, &window, offset.as_deref())?;
                let opts = ExportOptions {
                    format: ExportFormat::PromApi,
                    max_rows_per_line: 0,
                };
                let matches = [selector.to_string()];
                let is_partial = self
                    .export_matches(ctx, params, &matches, start, end, opts, false, deadline, w)
                    .await
                    .map_err(|e| {
                        e.context(format!(
                            "error when exporting data for query={:?} on the time range (start={}, end={})",
                            selector, start, end
                        ))
                    })?;
                Ok(finish("/api/v1/query", &ctx, is_partial))
            }
            QueryShape::Rollup {
                expr,
                window,
                step: step_expr,
                offset,
            } => {
                let step = rollup_step(step, step_expr.as_deref())?;
                let (start, end) = rollup_range(start, step, &window, offset.as_deref())?;
                let range = self
                    .query_range_inner(ctx, expr, start, end, step, limit, forward, params, None)
                    .await
                    .map_err(|e| {
                        e.context(format!(
                            "error when executing query={:?} on the time range (start={}, end={}, step={})",
                            expr, start, end, step
                        ))
                    })?;
                write_range_response(w, &range, false).await?;
                Ok(finish("/api/v1/query", &ctx, range.is_partial))
            }
            QueryShape::Expression => {
                let outcome = self
                    .instant_query(ctx, params, query, start, step, lookback, deadline, w)
                    .await?;
                Ok(finish("/api/v1/query", &ctx, outcome.is_partial))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn instant_query<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        query: &str,
        start: i64,
        step: i64,
        lookback: i64,
        deadline: Deadline,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // Samples of the last `latency_offset` may be incomplete, so recent
        // instant queries are evaluated before that and shifted back.
        let latency_offset = self.config.latency_offset();
        let (start, shift) = if !params.get_bool("nocache")
            && ctx.now_ms - start < latency_offset
            && start - ctx.now_ms < latency_offset
        {
            let adjusted = ctx.now_ms - latency_offset;
            (adjusted, start - adjusted)
        } else {
            (start, 0)
        };

        let ec = EvalConfig {
            auth_token: ctx.auth,
            start,
            end: start,
            step,
            limit: 0,
            forward: false,
            deadline,
            may_cache: false,
            lookback_delta: lookback,
            deny_partial_response: params.deny_partial_response(&self.config),
        };
        let ev = self.evaluator.exec(ec, query, true).await.map_err(|e| {
            e.context(format!(
                "error when executing query={:?} for (time={}, step={})",
                query, start, step
            ))
        })?;

        let mut results = ev.results;
        if shift > 0 {
            for rs in results.iter_mut() {
                for ts in rs.timestamps.iter_mut() {
                    *ts += shift;
                }
            }
        }
        let body = match ev.kind {
            ResultKind::Streams => format::streams_query_response(&results, ev.is_partial),
            ResultKind::Matrix => {
                let results = remove_filtered_values_and_timeseries(results, None);
                format::vector_query_response(&results, ev.is_partial)
            }
        };
        write_json(w, &body).await?;
        Ok(Outcome {
            is_partial: ev.is_partial,
        })
    }

    /// `/api/v1/query_range`
    pub async fn query_range<W>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let query = required_query(params)?;
        let start = params.get_time("start", ctx.now_ms - DEFAULT_STEP)?;
        let end = params.get_time("end", ctx.now_ms)?;
        let step = params.get_duration("step", DEFAULT_STEP)?;
        let limit = params.get_int64("limit", DEFAULT_LIMIT)?;
        let forward = params.get_string("direction", "backward") == "forward";

        let range = self
            .query_range_inner(ctx, query, start, end, step, limit, forward, params, None)
            .await
            .map_err(|e| {
                e.context(format!(
                    "error when executing query={:?} on the time range (start={}, end={}, step={})",
                    query, start, end, step
                ))
            })?;
        write_range_response(w, &range, false).await?;
        Ok(finish("/api/v1/query_range", &ctx, range.is_partial))
    }

    /// Evaluates a range query and aligns its result. `filter` holds tail
    /// cursors; entries at or before them are dropped.
    #[allow(clippy::too_many_arguments)]
    async fn query_range_inner(
        &self,
        ctx: RequestContext,
        query: &str,
        start: i64,
        end: i64,
        step: i64,
        limit: i64,
        forward: bool,
        params: &RequestParams,
        filter: Option<&HashMap<u64, i64>>,
    ) -> SelectResult<RangeResult> {
        let deadline = params.deadline_for_query(ctx.started, &self.config);
        let may_cache = !params.get_bool("nocache");
        let lookback_delta = max_lookback(params, &self.config)?;

        check_query_len(query, &self.config)?;
        let (mut start, mut end) = ensure_range(start, end);
        validate_max_points_per_timeseries(start, end, step, self.config.max_points_per_timeseries)?;
        if may_cache {
            (start, end) = adjust_start_end(start, end, step);
        }

        let ec = EvalConfig {
            auth_token: ctx.auth,
            start,
            end,
            step,
            limit,
            forward,
            deadline,
            may_cache,
            lookback_delta,
            deny_partial_response: params.deny_partial_response(&self.config),
        };
        let ev = self.evaluator.exec(ec, query, false).await?;

        let results = match ev.kind {
            ResultKind::Streams => remove_filtered_values_and_timeseries(ev.results, filter),
            ResultKind::Matrix => {
                let visible = ctx.now_ms - self.config.latency_offset();
                let mut results = ev.results;
                if visible < end {
                    results = adjust_last_points(results, visible, ctx.now_ms + step);
                }
                remove_filtered_values_and_timeseries(results, filter)
            }
        };
        Ok(RangeResult {
            results,
            kind: ev.kind,
            is_partial: ev.is_partial,
        })
    }

    /// Live tail: polls the query every `tail_poll_interval_ms` and writes one
    /// JSON frame per line until `limit` entries were sent or `cancel` fires
    pub async fn tail<W, C>(
        &self,
        ctx: RequestContext,
        params: &RequestParams,
        w: &mut W,
        clock: &C,
        cancel: &CancellationToken,
    ) -> SelectResult<Outcome>
    where
        W: AsyncWrite + Unpin + Send,
        C: Clock,
    {
        let query = required_query(params)?;
        let start = params.get_time("start", ctx.now_ms - DEFAULT_STEP)?;
        let limit = params.get_int64("limit", DEFAULT_LIMIT)?;

        let mut session = TailSession::new(start, limit);
        let mut poller = TailPoller {
            select: self,
            query,
            params,
            auth: ctx.auth,
            w,
        };
        tail::run(
            &mut session,
            &mut poller,
            clock,
            self.config.tail_poll_interval(),
            cancel,
        )
        .await
        .map_err(|e| {
            e.context(format!(
                "error when executing query={:?} on the time range (start={}, limit={})",
                query,
                session.start(),
                session.remaining()
            ))
        })?;
        Ok(finish("/api/v1/tail", &ctx, false))
    }
}

/// Issues the range query of one tail poll and writes its frame
struct TailPoller<'a, S, E, W> {
    select: &'a Select<S, E>,
    query: &'a str,
    params: &'a RequestParams,
    auth: AuthToken,
    w: &'a mut W,
}

impl<S, E, W> TailSource for TailPoller<'_, S, E, W>
where
    S: Storage,
    E: Evaluator,
    W: AsyncWrite + Unpin + Send,
{
    async fn poll(
        &mut self,
        start: i64,
        end: i64,
        limit: i64,
        filter: &HashMap<u64, i64>,
    ) -> SelectResult<Vec<SeriesResult>> {
        let ctx = RequestContext {
            started: Instant::now(),
            now_ms: end,
            auth: self.auth,
        };
        let range = self
            .select
            .query_range_inner(
                ctx,
                self.query,
                start,
                end,
                TAIL_STEP,
                limit,
                false,
                self.params,
                Some(filter),
            )
            .await?;
        write_range_response(self.w, &range, true).await?;
        Ok(range.results)
    }
}

/// Serializes a range result. Tail frames are newline-terminated, and empty
/// stream frames are skipped.
async fn write_range_response<W>(w: &mut W, range: &RangeResult, tail: bool) -> SelectResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let body = match (range.kind, tail) {
        (ResultKind::Streams, true) if range.results.is_empty() => return Ok(()),
        (ResultKind::Streams, true) => format::tail_response(&range.results),
        (ResultKind::Streams, false) => {
            format::streams_query_range_response(&range.results, range.is_partial)
        }
        (ResultKind::Matrix, _) => {
            format::matrix_query_range_response(&range.results, range.is_partial)
        }
    };
    let mut buf = serde_json::to_vec(&body)?;
    if tail {
        buf.push(b'\n');
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

async fn write_json<W>(w: &mut W, body: &serde_json::Value) -> SelectResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let buf = serde_json::to_vec(body)?;
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

fn finish(path: &'static str, ctx: &RequestContext, is_partial: bool) -> Outcome {
    metrics::record_request(path, ctx.started);
    if is_partial {
        warn!("{} served a partial response", path);
        metrics::record_partial_response(path);
    }
    Outcome { is_partial }
}

fn check_partial(is_partial: bool, params: &RequestParams, config: &SelectConfig) -> SelectResult<()> {
    if is_partial && params.deny_partial_response(config) {
        return Err(SelectError::IncompleteCluster);
    }
    Ok(())
}

fn required_query(params: &RequestParams) -> SelectResult<&str> {
    let query = params.get("query");
    if query.is_empty() {
        return Err(SelectError::MissingArg("query".to_string()));
    }
    Ok(query)
}

/// `match[]` values; with `legacy` a single `match` is accepted too
fn match_args(params: &RequestParams, legacy: bool) -> SelectResult<Vec<String>> {
    let mut matches = params.get_all("match[]");
    if matches.is_empty() && legacy {
        let m = params.get("match");
        if !m.is_empty() {
            matches.push(m.to_string());
        }
    }
    if matches.is_empty() {
        return Err(SelectError::MissingArg("match[]".to_string()));
    }
    Ok(matches)
}

/// True when metadata lookups must go through a series search
fn filters_requested(params: &RequestParams) -> bool {
    params.has("match[]") || params.has("start") || params.has("end")
}

fn tag_filterss(matches: &[String]) -> SelectResult<Vec<Vec<TagFilter>>> {
    matches
        .iter()
        .map(|m| {
            parse_metric_selector(m)
                .map_err(|e| SelectError::from(e).context(format!("cannot parse match[]={:?}", m)))
        })
        .collect()
}

/// Days since the Unix epoch of a `YYYY-MM-DD` date
fn parse_date(s: &str) -> SelectResult<u64> {
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SelectError::invalid_arg("date", s, e))?;
    let epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
        .ok_or_else(|| SelectError::invalid_arg("date", s, "invalid epoch"))?;
    let days = date.signed_duration_since(epoch).num_days();
    if days < 0 {
        return Err(SelectError::invalid_arg("date", s, "date must not precede 1970-01-01"));
    }
    Ok(days as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::evaluator::SelectorEvaluator;
    use crate::storage::cluster::LocalCluster;
    use crate::storage::data::MetricName;
    use serde_json::Value;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    type TestSelect = Select<LocalCluster, SelectorEvaluator<LocalCluster>>;

    const NOW: i64 = 1_000_000_000;

    fn select(cluster: Arc<LocalCluster>, config: SelectConfig) -> TestSelect {
        let evaluator = Arc::new(SelectorEvaluator::new(Arc::clone(&cluster)));
        Select::new(config, cluster, evaluator).unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::at(AuthToken::default(), NOW)
    }

    fn params(pairs: &[(&str, &str)]) -> RequestParams {
        RequestParams::from_pairs(pairs.iter().copied())
    }

    /// `up{job="a"}` series on both nodes of a two-node cluster
    async fn two_node_cluster() -> Arc<LocalCluster> {
        let cluster = Arc::new(LocalCluster::new(2));
        for (node, instance) in [(0, "host-0"), (0, "host-1"), (1, "host-2")] {
            let mn = MetricName::new("up")
                .with_tag("job", "a")
                .with_tag("instance", instance);
            for ts in [1000, 2000, 3000, 4000, 5000] {
                cluster.nodes()[node]
                    .shard()
                    .insert(AuthToken::default(), &mn, ts, ts as f64 / 1000.0, None)
                    .await
                    .unwrap();
            }
        }
        cluster
    }

    fn json(buf: &[u8]) -> Value {
        serde_json::from_slice(buf).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_range_partial_allowed() {
        let cluster = two_node_cluster().await;
        cluster.nodes()[1].set_latency(Duration::from_secs(60));
        let select = select(cluster, SelectConfig::default());
        let p = params(&[
            ("query", r#"up{job="a"}"#),
            ("start", "1"),
            ("end", "5"),
            ("step", "1s"),
            ("timeout", "0.5"),
        ]);

        let mut out = Vec::new();
        let outcome = select.query_range(ctx(), &p, &mut out).await.unwrap();
        assert!(outcome.is_partial);

        let body = json(&out);
        assert_eq!(body["isPartial"], Value::Bool(true));
        assert_eq!(body["data"]["resultType"], "matrix");
        let result = body["data"]["result"].as_array().unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["values"].as_array().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_range_partial_denied() {
        let cluster = two_node_cluster().await;
        cluster.nodes()[1].set_latency(Duration::from_secs(60));
        let select = select(cluster, SelectConfig::default());
        let p = params(&[
            ("query", r#"up{job="a"}"#),
            ("start", "1"),
            ("end", "5"),
            ("step", "1s"),
            ("timeout", "0.5"),
            ("deny_partial_response", "1"),
        ]);

        let mut out = Vec::new();
        let err = select.query_range(ctx(), &p, &mut out).await.unwrap_err();
        assert!(err.is_incomplete_cluster());
        assert!(err.to_string().contains(r#"query="up{job=\"a\"}""#));
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_partial_denied_writes_nothing() {
        let cluster = two_node_cluster().await;
        cluster.nodes()[1].set_available(false);
        let mut config = SelectConfig::default();
        config.deny_partial_response = true;
        let select = select(cluster, config);

        let mut out = Vec::new();
        let err = select
            .export(ctx(), &params(&[("match[]", "up")]), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_incomplete_cluster());
        assert!(out.is_empty());

        let err = select
            .series(ctx(), &params(&[("match[]", "up"), ("start", "0")]), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_incomplete_cluster());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_reduced_memory_export_partial() {
        let cluster = two_node_cluster().await;
        cluster.nodes()[1].set_available(false);
        let select = select(cluster, SelectConfig::default());
        let args = [("match[]", "up"), ("reduce_mem_usage", "1")];

        let mut out = Vec::new();
        let err = select
            .export(ctx(), &params(&[args[0], args[1], ("deny_partial_response", "1")]), &mut out)
            .await
            .unwrap_err();
        assert!(err.is_incomplete_cluster());
        assert!(out.is_empty());

        // Tolerated: the rows of the answering node are written
        let mut out = Vec::new();
        let outcome = select.export(ctx(), &params(&args), &mut out).await.unwrap();
        assert!(outcome.is_partial);
        let lines = out.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count();
        assert_eq!(lines, 2);
    }

    #[tokio::test]
    async fn test_export_lines() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        let outcome = select
            .export(
                ctx(),
                &params(&[("match[]", r#"up{instance="host-2"}"#), ("max_rows_per_line", "2")]),
                &mut out,
            )
            .await
            .unwrap();
        assert!(!outcome.is_partial);
        let lines: Vec<Value> = out
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .map(json)
            .collect();
        let rows: Vec<usize> = lines
            .iter()
            .map(|l| l["timestamps"].as_array().unwrap().len())
            .collect();
        assert_eq!(rows, vec![2, 2, 1]);
        assert_eq!(lines[2]["timestamps"][0], 5000);
    }

    #[tokio::test]
    async fn test_export_reduced_memory() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .export(
                ctx(),
                &params(&[
                    ("match", r#"up{instance="host-0"}"#),
                    ("start", "2"),
                    ("end", "4"),
                    ("reduce_mem_usage", "1"),
                    ("format", "promapi"),
                ]),
                &mut out,
            )
            .await
            .unwrap();
        let body = json(&out);
        let result = body["data"]["result"].as_array().unwrap();
        assert_eq!(result.len(), 1);
        let values = result[0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0][1], "1");
    }

    #[tokio::test]
    async fn test_export_native_header() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .export_native(ctx(), &params(&[("match[]", "up"), ("end", "10")]), &mut out)
            .await
            .unwrap();
        assert!(out.len() > 16);
        assert_eq!(&out[..8], &0i64.to_be_bytes());
        assert_eq!(&out[8..16], &10_000i64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_missing_match() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        let err = select.federate(ctx(), &params(&[]), &mut out).await.unwrap_err();
        assert!(matches!(err, SelectError::MissingArg(_)));
        let err = select
            .query(ctx(), &params(&[("time", "5")]), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, SelectError::MissingArg(_)));
    }

    #[tokio::test]
    async fn test_federate() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .federate(
                ctx(),
                &params(&[("match[]", r#"up{instance="host-1"}"#), ("start", "0"), ("end", "10")]),
                &mut out,
            )
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("host-1"));
        assert!(text.trim_end().ends_with("5000"));
    }

    #[tokio::test]
    async fn test_series_stream() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .series(
                ctx(),
                &params(&[("match[]", "up"), ("start", "0"), ("end", "10")]),
                &mut out,
            )
            .await
            .unwrap();
        let body = json(&out);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_labels_and_values() {
        let select = select(two_node_cluster().await, SelectConfig::default());

        let mut out = Vec::new();
        select.labels(ctx(), &params(&[]), &mut out).await.unwrap();
        assert_eq!(json(&out)["data"], serde_json::json!(["__name__", "instance", "job"]));

        let mut out = Vec::new();
        select
            .labels(
                ctx(),
                &params(&[("match[]", r#"{instance="host-2"}"#), ("start", "0"), ("end", "10")]),
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(json(&out)["data"], serde_json::json!(["__name__", "instance", "job"]));

        let mut out = Vec::new();
        select
            .label_values(ctx(), "instance", &params(&[]), &mut out)
            .await
            .unwrap();
        assert_eq!(
            json(&out)["data"],
            serde_json::json!(["host-0", "host-1", "host-2"])
        );

        let mut out = Vec::new();
        select
            .label_values(
                ctx(),
                "instance",
                &params(&[("match[]", r#"up{instance=~"host-[01]"}"#), ("start", "0"), ("end", "10")]),
                &mut out,
            )
            .await
            .unwrap();
        assert_eq!(json(&out)["data"], serde_json::json!(["host-0", "host-1"]));
    }

    #[tokio::test]
    async fn test_counts_and_status() {
        let select = select(two_node_cluster().await, SelectConfig::default());

        let mut out = Vec::new();
        select.series_count(ctx(), &params(&[]), &mut out).await.unwrap();
        assert_eq!(json(&out)["data"], serde_json::json!([3]));

        let mut out = Vec::new();
        select.labels_count(ctx(), &params(&[]), &mut out).await.unwrap();
        assert_eq!(json(&out)["status"], "success");

        let mut out = Vec::new();
        select
            .tsdb_status(ctx(), &params(&[("date", "1970-01-01"), ("topN", "0")]), &mut out)
            .await
            .unwrap();
        let body = json(&out);
        assert_eq!(
            body["data"]["seriesCountByMetricName"],
            serde_json::json!([{"name": "up", "value": 3}])
        );

        let err = select
            .tsdb_status(ctx(), &params(&[("date", "01/02/2020")]), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectError::InvalidArg { .. }));
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("1970-01-01").unwrap(), 0);
        assert_eq!(parse_date("1970-01-11").unwrap(), 10);
        assert!(parse_date("1969-12-31").is_err());
    }

    #[tokio::test]
    async fn test_instant_query_shifts_recent_time() {
        let cluster = Arc::new(LocalCluster::new(1));
        let mn = MetricName::new("up");
        let now = 1_000_000;
        cluster
            .insert(AuthToken::default(), &mn, now - 60_000, 7.0, None)
            .await
            .unwrap();
        let select = select(cluster, SelectConfig::default());

        let mut out = Vec::new();
        select
            .query(
                RequestContext::at(AuthToken::default(), now),
                &params(&[("query", "up"), ("time", "1000")]),
                &mut out,
            )
            .await
            .unwrap();
        let body = json(&out);
        let value = &body["data"]["result"][0]["value"];
        // Evaluated 30s back, reported at the requested time
        assert_eq!(value[0], 1000.0);
        assert_eq!(value[1], "7");
    }

    #[tokio::test]
    async fn test_query_selector_with_rollup_exports() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .query(
                ctx(),
                &params(&[("query", r#"up{instance="host-0"}[2s] offset 1s"#), ("time", "5")]),
                &mut out,
            )
            .await
            .unwrap();
        let body = json(&out);
        assert_eq!(body["data"]["resultType"], "matrix");
        let values = body["data"]["result"][0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 3);
    }

    #[tokio::test]
    async fn test_query_rollup_runs_range_query() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let mut out = Vec::new();
        select
            .query(
                ctx(),
                &params(&[("query", r#"up{instance="host-0"}[4s:1s]"#), ("time", "5")]),
                &mut out,
            )
            .await
            .unwrap();
        let body = json(&out);
        assert_eq!(body["data"]["resultType"], "matrix");
        let values = body["data"]["result"][0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 5);
    }

    #[tokio::test]
    async fn test_too_many_points() {
        let mut config = SelectConfig::default();
        config.max_points_per_timeseries = 10;
        let select = select(two_node_cluster().await, config);
        let mut out = Vec::new();
        let err = select
            .query_range(
                ctx(),
                &params(&[("query", "up"), ("start", "0"), ("end", "100"), ("step", "1s")]),
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.root(), SelectError::TooManyPoints { .. }));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_delete_rejects_range() {
        let select = select(two_node_cluster().await, SelectConfig::default());
        let err = select
            .delete_series(ctx(), &params(&[("match[]", "up"), ("start", "1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SelectError::InvalidArg { .. }));

        select
            .delete_series(ctx(), &params(&[("match[]", r#"up{instance="host-0"}"#)]))
            .await
            .unwrap();
        let mut out = Vec::new();
        select.series_count(ctx(), &params(&[]), &mut out).await.unwrap();
        assert_eq!(json(&out)["data"], serde_json::json!([2]));
    }

    /// Answers every connection with the given status line
    async fn peer(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await;
                let resp = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
                let _ = conn.write_all(resp.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_reset_rollup_result_caches() {
        let ok = peer("200 OK").await;
        let failing = peer("500 Internal Server Error").await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let mut config = SelectConfig::default();
        config.select_nodes = vec![ok.clone()];
        let select_ok = select(two_node_cluster().await, config);
        assert_eq!(select_ok.reset_rollup_result_caches().await.unwrap(), 0);

        let mut config = SelectConfig::default();
        config.select_nodes = vec![ok, failing, closed];
        let select_mixed = select(two_node_cluster().await, config);
        assert_eq!(select_mixed.reset_rollup_result_caches().await.unwrap(), 2);

        // Without peers nothing is attempted
        let select_none = select(two_node_cluster().await, SelectConfig::default());
        assert_eq!(select_none.reset_rollup_result_caches().await.unwrap(), 0);
    }

    struct StepClock(AtomicI64);

    impl Clock for StepClock {
        fn now_ms(&self) -> i64 {
            self.0.fetch_add(1000, Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_streams_until_limit() {
        let cluster = Arc::new(LocalCluster::new(2));
        for app in ["api", "db", "web"] {
            let mn = MetricName::new("logs").with_tag("app", app);
            for i in 1..=20 {
                cluster
                    .insert(AuthToken::default(), &mn, i * 10, 1.0, Some(format!("{} {}", app, i).into_bytes()))
                    .await
                    .unwrap();
            }
        }
        let select = select(Arc::clone(&cluster), SelectConfig::default());

        // Rows arriving while the tail runs
        let writer = Arc::clone(&cluster);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let mn = MetricName::new("logs").with_tag("app", "api");
            for i in 21..=70 {
                writer
                    .insert(AuthToken::default(), &mn, i * 10, 1.0, Some(format!("api {}", i).into_bytes()))
                    .await
                    .unwrap();
            }
        });

        let clock = StepClock(AtomicI64::new(500));
        let mut out = Vec::new();
        select
            .tail(
                RequestContext::at(AuthToken::default(), 500),
                &params(&[("query", "logs"), ("start", "0"), ("limit", "110"), ("nocache", "1")]),
                &mut out,
                &clock,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let frames: Vec<Value> = out
            .split(|&b| b == b'\n')
            .filter(|l| !l.is_empty())
            .map(json)
            .collect();
        let rows: Vec<usize> = frames
            .iter()
            .map(|f| {
                f["streams"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|s| s["values"].as_array().unwrap().len())
                    .sum()
            })
            .collect();
        assert_eq!(rows, vec![60, 50]);
        // Entries come back as nanosecond strings
        assert_eq!(frames[1]["streams"][0]["values"][0][0], "210000000");
    }
}
