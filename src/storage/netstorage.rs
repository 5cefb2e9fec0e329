//! Contract with the distributed storage fan-out.
//!
//! Every call reports whether the answer is partial, i.e. at least one storage
//! node failed or missed the deadline. The caller decides whether a partial
//! answer is acceptable.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{SelectError, SelectResult};
use crate::query::params::Deadline;
use crate::storage::block::Block;
use crate::storage::data::{MetricName, SeriesResult};
use crate::storage::search::{AuthToken, SearchQuery, TimeRange};

/// A raw block of one series, streamed by `Storage::export_blocks`
#[derive(Debug, Clone)]
pub struct ExportedBlock {
    pub metric_name: MetricName,
    pub block: Block,
    /// Range the receiver must filter decoded rows to
    pub time_range: TimeRange,
}

/// Label name with all its values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopHeapEntry {
    pub name: String,
    pub count: u64,
}

/// Cardinality statistics for a single day
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsdbStatus {
    pub series_count_by_metric_name: Vec<TopHeapEntry>,
    pub label_value_count_by_label_name: Vec<TopHeapEntry>,
    pub series_count_by_label_value_pair: Vec<TopHeapEntry>,
}

/// Series returned by a fan-out search, plus the partial flag
#[derive(Debug)]
pub struct SearchResults {
    results: Vec<SeriesResult>,
    is_partial: bool,
    cancel: CancellationToken,
}

impl SearchResults {
    pub fn new(results: Vec<SeriesResult>, is_partial: bool) -> Self {
        Self {
            results,
            is_partial,
            cancel: CancellationToken::new(),
        }
    }

    /// True when at least one storage node didn't answer
    pub fn is_partial(&self) -> bool {
        self.is_partial
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Stops any further processing of the results
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the workers of `run_parallel`
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consumes the results without the worker pool
    pub fn into_results(self) -> Vec<SeriesResult> {
        self.results
    }

    /// Applies `f` to every series on a pool of workers sized to the available
    /// parallelism. The first error cancels the remaining work and is returned
    /// once every worker has stopped.
    pub async fn run_parallel<F, Fut>(self, f: F) -> SelectResult<()>
    where
        F: Fn(SeriesResult, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SelectResult<()>> + Send + 'static,
    {
        let workers = num_cpus::get().min(self.results.len()).max(1);
        let queue = Arc::new(Mutex::new(VecDeque::from(self.results)));
        let f = Arc::new(f);
        let mut join_set = JoinSet::new();

        for worker_id in 0..workers {
            let queue = Arc::clone(&queue);
            let f = Arc::clone(&f);
            let cancel = self.cancel.clone();
            join_set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        return Err(SelectError::Cancelled);
                    }
                    let next = queue.lock().await.pop_front();
                    let Some(rs) = next else {
                        return Ok(());
                    };
                    if let Err(e) = f(rs, worker_id).await {
                        cancel.cancel();
                        return Err(e);
                    }
                }
            });
        }

        let mut first_err: Option<SelectError> = None;
        while let Some(joined) = join_set.join_next().await {
            let result = joined
                .map_err(|e| SelectError::Storage(format!("fetch worker failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                // A worker stopped by cancellation is less informative than the cause.
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
        debug!(workers, "parallel series processing finished");
        first_err.map_or(Ok(()), Err)
    }
}

/// Storage fan-out client
pub trait Storage: Send + Sync + 'static {
    /// Searches every storage node. With `fetch_data` unset only metric names
    /// are returned.
    fn process_search_query(
        &self,
        at: &AuthToken,
        sq: &SearchQuery,
        fetch_data: bool,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<SearchResults>> + Send;

    /// Streams raw blocks into `sink` and returns the partial flag. Sending
    /// stops as soon as the receiver is dropped.
    fn export_blocks(
        &self,
        at: &AuthToken,
        sq: &SearchQuery,
        deadline: &Deadline,
        sink: mpsc::Sender<ExportedBlock>,
    ) -> impl Future<Output = SelectResult<bool>> + Send;

    /// Deletes matching series and returns how many were deleted
    fn delete_series(
        &self,
        at: &AuthToken,
        sq: &SearchQuery,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<usize>> + Send;

    fn get_labels(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<(Vec<String>, bool)>> + Send;

    fn get_label_values(
        &self,
        at: &AuthToken,
        label_name: &str,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<(Vec<String>, bool)>> + Send;

    fn get_label_entries(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<(Vec<LabelEntry>, bool)>> + Send;

    fn get_series_count(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> impl Future<Output = SelectResult<(u64, bool)>> + Send;

    /// `date` is the number of days since the Unix epoch
    fn get_tsdb_status_for_date(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
        date: u64,
        top_n: usize,
    ) -> impl Future<Output = SelectResult<(TsdbStatus, bool)>> + Send;
}
