//! Streaming response pipeline.
//!
//! Fetch workers serialize series into fragments and hand them to a single
//! writer through a bounded channel sized to the number of CPUs. The writer
//! consumes every fragment, even after a write failure, so producers never
//! block forever; a write failure cancels the producers instead.

use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SelectError, SelectResult};
use crate::query::format::{self, ResponseFraming};
use crate::query::params::Deadline;
use crate::query::pool::{ExportBlock, Pools};
use crate::storage::netstorage::{ExportedBlock, SearchResults, Storage};
use crate::storage::search::{AuthToken, SearchQuery};

/// Value given to samples decoded from raw blocks
pub const REDUCED_MEMORY_PLACEHOLDER: f64 = 1.0;

/// Producer side of the pipeline
#[derive(Clone)]
pub struct FragmentSink {
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    pools: Arc<Pools>,
}

impl FragmentSink {
    /// Empty buffer for the next fragment
    pub fn buffer(&self) -> Vec<u8> {
        self.pools.buffers.get()
    }

    /// Hands a fragment to the writer, waiting while the queue is full
    pub async fn send(&self, fragment: Vec<u8>) -> SelectResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SelectError::Cancelled);
        }
        self.tx
            .send(fragment)
            .await
            .map_err(|_| SelectError::Cancelled)
    }

    /// Set once the writer failed; producers stop before encoding more data
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pools(&self) -> &Arc<Pools> {
        &self.pools
    }
}

/// Streams the fragments produced by `producer` into `w`, wrapped in `framing`.
///
/// The producer runs on its own task and closes the queue by returning. A
/// write error takes precedence over the producer's error; a producer error
/// is reported as a data fetching failure.
pub async fn stream_response<W, P, Fut>(
    w: &mut W,
    framing: ResponseFraming,
    pools: Arc<Pools>,
    producer: P,
) -> SelectResult<()>
where
    W: AsyncWrite + Unpin + Send,
    P: FnOnce(FragmentSink) -> Fut,
    Fut: Future<Output = SelectResult<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(num_cpus::get().max(1));
    let cancel = CancellationToken::new();
    let sink = FragmentSink {
        tx,
        cancel: cancel.clone(),
        pools: Arc::clone(&pools),
    };
    let handle = tokio::spawn(producer(sink));

    let mut bw = BufWriter::new(w);
    let mut write_err: Option<std::io::Error> = None;
    if let Err(e) = bw.write_all(framing.prefix.as_bytes()).await {
        cancel.cancel();
        write_err = Some(e);
    }

    let mut fragments = 0usize;
    while let Some(fragment) = rx.recv().await {
        if write_err.is_none() && !fragment.is_empty() {
            let mut result = Ok(());
            if fragments > 0 && !framing.separator.is_empty() {
                result = bw.write_all(framing.separator.as_bytes()).await;
            }
            if result.is_ok() {
                result = bw.write_all(&fragment).await;
            }
            match result {
                Ok(()) => fragments += 1,
                Err(e) => {
                    warn!("cannot write response fragment: {}", e);
                    cancel.cancel();
                    write_err = Some(e);
                }
            }
        }
        pools.buffers.put(fragment);
    }

    if write_err.is_none() {
        let mut result = bw.write_all(framing.suffix.as_bytes()).await;
        if result.is_ok() {
            result = bw.flush().await;
        }
        if let Err(e) = result {
            write_err = Some(e);
        }
    }

    let fetched = handle
        .await
        .map_err(|e| SelectError::Storage(format!("fetch task failed: {}", e)))
        .and_then(|r| r);
    debug!(fragments, "response stream finished");

    if let Some(e) = write_err {
        return Err(e.into());
    }
    fetched.map_err(|e| e.context("error during data fetching"))
}

/// Line format of the export API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON object per line
    JsonLine,
    /// Prometheus text exposition
    Prometheus,
    /// Matrix response of the Prometheus query API
    PromApi,
}

impl ExportFormat {
    /// Unknown names fall back to JSON lines
    pub fn parse(s: &str) -> Self {
        match s {
            "prometheus" => ExportFormat::Prometheus,
            "promapi" => ExportFormat::PromApi,
            _ => ExportFormat::JsonLine,
        }
    }

    pub fn framing(&self) -> ResponseFraming {
        match self {
            ExportFormat::PromApi => ResponseFraming::PROM_API,
            _ => ResponseFraming::STD,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Rows per output line; zero keeps each series on one line
    pub max_rows_per_line: usize,
}

/// Serializes `xb` and sends one fragment per row chunk
pub async fn send_export_lines(
    xb: &ExportBlock,
    opts: ExportOptions,
    sink: &FragmentSink,
) -> SelectResult<()> {
    for rows in xb.row_chunks(opts.max_rows_per_line) {
        let mut buf = sink.buffer();
        match opts.format {
            ExportFormat::JsonLine => format::write_export_json_line(&mut buf, &rows)?,
            ExportFormat::Prometheus => format::write_export_prometheus_line(&mut buf, &rows),
            ExportFormat::PromApi => format::write_export_promapi_line(&mut buf, &rows)?,
        }
        sink.send(buf).await?;
    }
    Ok(())
}

/// Exports fully materialized series on the fetch worker pool
pub async fn export_in_memory(
    rss: SearchResults,
    opts: ExportOptions,
    sink: FragmentSink,
) -> SelectResult<()> {
    rss.run_parallel(move |rs, _worker_id| {
        let sink = sink.clone();
        async move {
            if sink.is_cancelled() {
                return Err(SelectError::Cancelled);
            }
            let pools = Arc::clone(sink.pools());
            let mut xb = pools.export_blocks.get();
            xb.metric_name = rs.metric_name;
            xb.timestamps = rs.timestamps;
            xb.values = rs.values;
            xb.payloads = rs.payloads.unwrap_or_default();
            let result = send_export_lines(&xb, opts, &sink).await;
            pools.export_blocks.put(xb);
            result
        }
    })
    .await
}

/// Runs `storage.export_blocks` and processes the streamed blocks on a pool of
/// workers. Returns the partial flag reported by the storage.
async fn process_blocks<S, F, Fut>(
    storage: Arc<S>,
    at: AuthToken,
    sq: SearchQuery,
    deadline: Deadline,
    cancel: CancellationToken,
    f: F,
) -> SelectResult<bool>
where
    S: Storage,
    F: Fn(ExportedBlock) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SelectResult<()>> + Send + 'static,
{
    let workers = num_cpus::get().max(1);
    let (tx, rx) = mpsc::channel::<ExportedBlock>(workers);
    let rx = Arc::new(Mutex::new(rx));
    let f = Arc::new(f);

    let mut join_set = JoinSet::new();
    for _ in 0..workers {
        let rx = Arc::clone(&rx);
        let f = Arc::clone(&f);
        let cancel = cancel.clone();
        join_set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return Err(SelectError::Cancelled);
                }
                let next = rx.lock().await.recv().await;
                let Some(block) = next else {
                    return Ok(());
                };
                if let Err(e) = f(block).await {
                    cancel.cancel();
                    return Err(e);
                }
            }
        });
    }
    // Workers own the receiver now; it closes when the last one stops.
    drop(rx);

    let exported = storage.export_blocks(&at, &sq, &deadline, tx).await;

    let mut first_err: Option<SelectError> = None;
    while let Some(joined) = join_set.join_next().await {
        let result = joined
            .map_err(|e| SelectError::Storage(format!("export worker failed: {}", e)))
            .and_then(|r| r);
        if let Err(e) = result {
            let replace = match &first_err {
                None => true,
                Some(SelectError::Cancelled) => !matches!(e, SelectError::Cancelled),
                Some(_) => false,
            };
            if replace {
                first_err = Some(e);
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    exported
}

/// Exports raw blocks, decoding and filtering each block separately so only
/// one block per worker is held in memory. Decoded samples get the
/// `REDUCED_MEMORY_PLACEHOLDER` value. Returns the partial flag.
pub async fn export_reduced_memory<S: Storage>(
    storage: Arc<S>,
    at: AuthToken,
    sq: SearchQuery,
    deadline: Deadline,
    deny_partial_response: bool,
    opts: ExportOptions,
    sink: FragmentSink,
) -> SelectResult<bool> {
    let cancel = sink.cancel.child_token();
    let is_partial = process_blocks(storage, at, sq, deadline, cancel, move |mut eb| {
        let sink = sink.clone();
        async move {
            if sink.is_cancelled() {
                return Err(SelectError::Cancelled);
            }
            eb.block.unmarshal_data().map_err(|e| {
                SelectError::Storage(format!("cannot unmarshal block during export: {}", e))
            })?;
            let pools = Arc::clone(sink.pools());
            let mut xb = pools.export_blocks.get();
            xb.metric_name = eb.metric_name;
            eb.block
                .append_rows_with_time_range_filter(&mut xb.timestamps, &mut xb.payloads, eb.time_range);
            xb.values.resize(xb.timestamps.len(), REDUCED_MEMORY_PLACEHOLDER);
            if xb.payloads.iter().all(Vec::is_empty) {
                xb.payloads.clear();
            }
            let result = if xb.is_empty() {
                Ok(())
            } else {
                send_export_lines(&xb, opts, &sink).await
            };
            pools.export_blocks.put(xb);
            result
        }
    })
    .await?;

    if is_partial && deny_partial_response {
        return Err(SelectError::IncompleteCluster);
    }
    Ok(is_partial)
}

/// Streams the native export: the time range header, then one
/// `{metric name}{block}` record per raw block. Returns the partial flag.
pub async fn export_native<S: Storage>(
    storage: Arc<S>,
    at: AuthToken,
    sq: SearchQuery,
    deadline: Deadline,
    deny_partial_response: bool,
    sink: FragmentSink,
) -> SelectResult<bool> {
    let mut header = sink.buffer();
    format::write_native_header(
        &mut header,
        sq.time_range.min_timestamp,
        sq.time_range.max_timestamp,
    );
    sink.send(header).await?;

    let cancel = sink.cancel.child_token();
    let is_partial = process_blocks(storage, at, sq, deadline, cancel, move |eb| {
        let sink = sink.clone();
        async move {
            if sink.is_cancelled() {
                return Err(SelectError::Cancelled);
            }
            let mut tmp = sink.buffer();
            let mut dst = sink.buffer();
            eb.metric_name.marshal(&mut tmp);
            format::write_length_prefixed(&mut dst, &tmp);
            tmp.clear();
            eb.block.marshal_portable(&mut tmp);
            format::write_length_prefixed(&mut dst, &tmp);
            sink.pools().buffers.put(tmp);
            sink.send(dst).await
        }
    })
    .await?;

    if is_partial && deny_partial_response {
        return Err(SelectError::IncompleteCluster);
    }
    Ok(is_partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data::{MetricName, SeriesResult};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn series(name: &str, n: i64) -> SeriesResult {
        SeriesResult::new(
            MetricName::new(name),
            (1..=n).map(|i| i * 1000).collect(),
            (1..=n).map(|i| i as f64).collect(),
        )
    }

    /// Writer that fails after `limit` bytes
    struct FailingWriter {
        written: usize,
        limit: usize,
    }

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.written + buf.len() > self.limit {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "client went away",
                )));
            }
            self.written += buf.len();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_max_rows_per_line_slices_series() {
        let pools = Arc::new(Pools::default());
        let rss = SearchResults::new(vec![series("up", 5)], false);
        let opts = ExportOptions {
            format: ExportFormat::JsonLine,
            max_rows_per_line: 2,
        };
        let mut out = Vec::new();
        stream_response(&mut out, ResponseFraming::STD, pools, move |sink| {
            export_in_memory(rss, opts, sink)
        })
        .await
        .unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["timestamps"], serde_json::json!([1000, 2000]));
        assert_eq!(lines[1]["timestamps"], serde_json::json!([3000, 4000]));
        assert_eq!(lines[2]["timestamps"], serde_json::json!([5000]));
        assert_eq!(lines[2]["values"], serde_json::json!([5.0]));
    }

    #[tokio::test]
    async fn test_promapi_framing_is_valid_json() {
        let pools = Arc::new(Pools::default());
        let rss = SearchResults::new((0..20).map(|i| series(&format!("m{}", i), 3)).collect(), false);
        let opts = ExportOptions {
            format: ExportFormat::PromApi,
            max_rows_per_line: 0,
        };
        let mut out = Vec::new();
        stream_response(&mut out, opts.format.framing(), pools, move |sink| {
            export_in_memory(rss, opts, sink)
        })
        .await
        .unwrap();

        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["data"]["result"].as_array().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_empty_result_still_framed() {
        let pools = Arc::new(Pools::default());
        let mut out = Vec::new();
        stream_response(&mut out, ResponseFraming::SERIES, pools, |_sink| async { Ok::<(), SelectError>(()) })
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), r#"{"status":"success","data":[]}"#);
    }

    #[tokio::test]
    async fn test_write_error_drains_and_wins() {
        let pools = Arc::new(Pools::default());
        // Enough series to fill the queue several times over
        let rss = SearchResults::new((0..200).map(|i| series(&format!("m{}", i), 50)).collect(), false);
        let opts = ExportOptions {
            format: ExportFormat::Prometheus,
            max_rows_per_line: 1,
        };
        let mut w = FailingWriter {
            written: 0,
            limit: 100,
        };
        let err = stream_response(&mut w, ResponseFraming::STD, pools, move |sink| {
            export_in_memory(rss, opts, sink)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SelectError::Io(_)));
    }

    #[tokio::test]
    async fn test_fetch_error_gets_context() {
        let pools = Arc::new(Pools::default());
        let mut out = Vec::new();
        let err = stream_response(&mut out, ResponseFraming::STD, pools, |sink| async move {
            let mut buf = sink.buffer();
            buf.extend_from_slice(b"partial line\n");
            sink.send(buf).await?;
            Err::<(), SelectError>(SelectError::Storage("node down".to_string()))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("error during data fetching"));
        assert!(matches!(err.root(), SelectError::Storage(_)));
        // Fragments produced before the failure were still written
        assert_eq!(out, b"partial line\n");
    }
}
