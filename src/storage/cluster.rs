//! In-process storage cluster.
//!
//! Every node holds one `Shard`. Calls fan out to all nodes concurrently and
//! are bounded by the request deadline; a node that fails or misses the
//! deadline makes the answer partial. Nodes can be switched off or slowed down
//! to exercise the partial-response handling.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{SelectError, SelectResult};
use crate::query::params::Deadline;
use crate::storage::data::MetricName;
use crate::storage::netstorage::{
    ExportedBlock, LabelEntry, SearchResults, Storage, TopHeapEntry, TsdbStatus,
};
use crate::storage::search::{AuthToken, SearchQuery};
use crate::storage::shard::{Shard, ShardError};

/// Rows per block handed out by `export_blocks`
const ROWS_PER_BLOCK: usize = 8 * 1024;

/// A storage node of the local cluster
pub struct StorageNode {
    name: String,
    shard: Shard,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl StorageNode {
    fn new(name: String, rows_per_block: usize) -> Self {
        Self {
            name,
            shard: Shard::new(rows_per_block),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    /// An unavailable node fails every call
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay added before the node answers
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn ready(&self) -> SelectResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(SelectError::Storage(format!(
                "storage node {} is unavailable",
                self.name
            )));
        }
        Ok(())
    }
}

/// Outcome of one node call
enum NodeOutcome<T> {
    Done(T),
    Failed(SelectError),
    TimedOut,
}

/// Storage backend made of in-memory nodes
pub struct LocalCluster {
    nodes: Vec<Arc<StorageNode>>,
}

impl LocalCluster {
    /// Creates a cluster of `n` empty nodes
    pub fn new(n: usize) -> Self {
        Self::with_rows_per_block(n, ROWS_PER_BLOCK)
    }

    pub fn with_rows_per_block(n: usize, rows_per_block: usize) -> Self {
        let nodes = (0..n.max(1))
            .map(|i| Arc::new(StorageNode::new(format!("storage-{}", i), rows_per_block)))
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[Arc<StorageNode>] {
        &self.nodes
    }

    pub fn node(&self, i: usize) -> Option<&Arc<StorageNode>> {
        self.nodes.get(i)
    }

    /// Stores a sample on the node owning the series
    pub async fn insert(
        &self,
        at: AuthToken,
        metric_name: &MetricName,
        timestamp: i64,
        value: f64,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ShardError> {
        let i = (metric_name.hash() % self.nodes.len() as u64) as usize;
        self.nodes[i]
            .shard
            .insert(at, metric_name, timestamp, value, payload)
            .await
    }

    /// Runs `f` on every node within the deadline and reports whether any
    /// node failed. Fails only when no node answered.
    async fn fan_out<T, F, Fut>(&self, deadline: &Deadline, f: F) -> SelectResult<(Vec<T>, bool)>
    where
        T: Send + 'static,
        F: Fn(Arc<StorageNode>) -> Fut,
        Fut: Future<Output = SelectResult<T>> + Send + 'static,
    {
        let mut join_set = JoinSet::new();
        for node in &self.nodes {
            let name = node.name.clone();
            let call = f(Arc::clone(node));
            let ready_node = Arc::clone(node);
            let timeout = deadline.remaining();
            join_set.spawn(async move {
                let outcome = tokio::time::timeout(timeout, async move {
                    ready_node.ready().await?;
                    call.await
                })
                .await;
                let outcome = match outcome {
                    Ok(Ok(v)) => NodeOutcome::Done(v),
                    Ok(Err(e)) => NodeOutcome::Failed(e),
                    Err(_) => NodeOutcome::TimedOut,
                };
                (name, outcome)
            });
        }

        let mut results = Vec::with_capacity(self.nodes.len());
        let mut first_err = None;
        let mut timed_out = false;
        while let Some(joined) = join_set.join_next().await {
            let (name, outcome) = joined
                .map_err(|e| SelectError::Storage(format!("storage call failed: {}", e)))?;
            match outcome {
                NodeOutcome::Done(v) => results.push(v),
                NodeOutcome::Failed(e) => {
                    warn!("storage node {} failed: {}", name, e);
                    first_err.get_or_insert(e);
                }
                NodeOutcome::TimedOut => {
                    warn!("storage node {} missed the deadline", name);
                    timed_out = true;
                }
            }
        }

        let failed = self.nodes.len() - results.len();
        if results.is_empty() {
            if timed_out {
                return Err(SelectError::Timeout(format!(
                    "cannot fetch query results from storage nodes in {}",
                    deadline
                )));
            }
            return Err(first_err.unwrap_or_else(|| {
                SelectError::Storage("no storage nodes answered".to_string())
            }));
        }
        debug!(
            nodes = self.nodes.len(),
            failed, "storage fan-out finished"
        );
        Ok((results, failed > 0))
    }
}

fn sorted_union(lists: Vec<Vec<String>>) -> Vec<String> {
    lists
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn merge_label_entries(per_node: Vec<Vec<LabelEntry>>) -> Vec<LabelEntry> {
    let mut m: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for entry in per_node.into_iter().flatten() {
        m.entry(entry.key).or_default().extend(entry.values);
    }
    m.into_iter()
        .map(|(key, values)| LabelEntry {
            key,
            values: values.into_iter().collect(),
        })
        .collect()
}

/// Sums counts per name and keeps the `top_n` largest
fn merge_top(per_node: Vec<Vec<TopHeapEntry>>, top_n: usize) -> Vec<TopHeapEntry> {
    let mut m: HashMap<String, u64> = HashMap::new();
    for e in per_node.into_iter().flatten() {
        *m.entry(e.name).or_default() += e.count;
    }
    let mut entries: Vec<TopHeapEntry> = m
        .into_iter()
        .map(|(name, count)| TopHeapEntry { name, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    entries.truncate(top_n);
    entries
}

impl Storage for LocalCluster {
    async fn process_search_query(
        &self,
        _at: &AuthToken,
        sq: &SearchQuery,
        fetch_data: bool,
        deadline: &Deadline,
    ) -> SelectResult<SearchResults> {
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| {
                let sq = sq.clone();
                async move { Ok(node.shard.search(&sq, fetch_data).await) }
            })
            .await?;
        let results: Vec<_> = per_node.into_iter().flatten().collect();
        debug!(series = results.len(), is_partial, "search for {} finished", sq);
        Ok(SearchResults::new(results, is_partial))
    }

    async fn export_blocks(
        &self,
        _at: &AuthToken,
        sq: &SearchQuery,
        deadline: &Deadline,
        sink: mpsc::Sender<ExportedBlock>,
    ) -> SelectResult<bool> {
        let (_, is_partial) = self
            .fan_out(deadline, |node| {
                let sq = sq.clone();
                let sink = sink.clone();
                async move {
                    for block in node.shard.blocks(&sq).await {
                        sink.send(block)
                            .await
                            .map_err(|_| SelectError::Cancelled)?;
                    }
                    Ok(())
                }
            })
            .await?;
        Ok(is_partial)
    }

    async fn delete_series(
        &self,
        _at: &AuthToken,
        sq: &SearchQuery,
        deadline: &Deadline,
    ) -> SelectResult<usize> {
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| {
                let sq = sq.clone();
                async move { Ok(node.shard.delete(&sq).await) }
            })
            .await?;
        if is_partial {
            return Err(SelectError::Storage(
                "cannot delete series on every storage node".to_string(),
            ));
        }
        Ok(per_node.into_iter().sum())
    }

    async fn get_labels(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> SelectResult<(Vec<String>, bool)> {
        let (entries, is_partial) = self.get_label_entries(at, deadline).await?;
        Ok((entries.into_iter().map(|e| e.key).collect(), is_partial))
    }

    async fn get_label_values(
        &self,
        at: &AuthToken,
        label_name: &str,
        deadline: &Deadline,
    ) -> SelectResult<(Vec<String>, bool)> {
        let at = *at;
        let label_name = label_name.to_string();
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| {
                let label_name = label_name.clone();
                async move {
                    Ok(node
                        .shard
                        .label_entries(&at)
                        .await
                        .into_iter()
                        .filter(|e| e.key == label_name)
                        .flat_map(|e| e.values)
                        .collect::<Vec<_>>())
                }
            })
            .await?;
        Ok((sorted_union(per_node), is_partial))
    }

    async fn get_label_entries(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> SelectResult<(Vec<LabelEntry>, bool)> {
        let at = *at;
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| async move {
                Ok(node.shard.label_entries(&at).await)
            })
            .await?;
        Ok((merge_label_entries(per_node), is_partial))
    }

    async fn get_series_count(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
    ) -> SelectResult<(u64, bool)> {
        let at = *at;
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| async move {
                Ok(node.shard.series_count(&at).await)
            })
            .await?;
        Ok((per_node.into_iter().sum(), is_partial))
    }

    async fn get_tsdb_status_for_date(
        &self,
        at: &AuthToken,
        deadline: &Deadline,
        date: u64,
        top_n: usize,
    ) -> SelectResult<(TsdbStatus, bool)> {
        let at = *at;
        let (per_node, is_partial) = self
            .fan_out(deadline, |node| async move {
                Ok(node.shard.tsdb_status(&at, date).await)
            })
            .await?;

        let mut by_name = Vec::with_capacity(per_node.len());
        let mut by_label = Vec::with_capacity(per_node.len());
        let mut by_pair = Vec::with_capacity(per_node.len());
        for status in per_node {
            by_name.push(status.series_count_by_metric_name);
            by_label.push(status.label_value_count_by_label_name);
            by_pair.push(status.series_count_by_label_value_pair);
        }
        let status = TsdbStatus {
            series_count_by_metric_name: merge_top(by_name, top_n),
            label_value_count_by_label_name: merge_top(by_label, top_n),
            series_count_by_label_value_pair: merge_top(by_pair, top_n),
        };
        Ok((status, is_partial))
    }
}
