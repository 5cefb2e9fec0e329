use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::storage::block::Block;
use crate::storage::data::{MetricName, SeriesResult, NAME_LABEL};
use crate::storage::netstorage::{ExportedBlock, LabelEntry, TopHeapEntry, TsdbStatus};
use crate::storage::search::{AuthToken, SearchQuery};

const MSECS_PER_DAY: i64 = 24 * 3600 * 1000;

/// Rows stored for one series
#[derive(Debug, Clone)]
struct StoredSeries {
    tenant: AuthToken,
    metric_name: MetricName,
    timestamps: Vec<i64>,
    values: Vec<f64>,
    payloads: Option<Vec<Vec<u8>>>,
}

/// In-memory partition of the series space held by one storage node
pub struct Shard {
    /// Series keyed by metric name hash
    data: Arc<RwLock<BTreeMap<u64, StoredSeries>>>,
    /// Maximum rows per block handed out by `export_blocks`
    rows_per_block: usize,
}

impl Shard {
    /// Creates an empty shard
    pub fn new(rows_per_block: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            rows_per_block: rows_per_block.max(1),
        }
    }

    /// Appends a sample. Samples of one series must arrive in timestamp order,
    /// and a series either always or never carries payloads.
    pub async fn insert(
        &self,
        tenant: AuthToken,
        metric_name: &MetricName,
        timestamp: i64,
        value: f64,
        payload: Option<Vec<u8>>,
    ) -> Result<(), ShardError> {
        let mut data = self.data.write().await;
        let series = data
            .entry(metric_name.hash())
            .or_insert_with(|| StoredSeries {
                tenant,
                metric_name: metric_name.clone(),
                timestamps: Vec::new(),
                values: Vec::new(),
                payloads: payload.as_ref().map(|_| Vec::new()),
            });

        // Validate timestamp ordering
        if let Some(&last) = series.timestamps.last() {
            if timestamp < last {
                return Err(ShardError::InvalidTimestampOrder);
            }
        }
        match (&mut series.payloads, payload) {
            (Some(payloads), Some(p)) => payloads.push(p),
            (None, None) => {}
            _ => return Err(ShardError::PayloadMismatch),
        }
        series.timestamps.push(timestamp);
        series.values.push(value);

        debug!(
            "Inserted sample into shard: series={}, timestamp={}, rows={}",
            metric_name,
            timestamp,
            series.timestamps.len()
        );
        Ok(())
    }

    /// Returns matching series restricted to the query time range.
    /// Series without samples in the range are skipped.
    pub async fn search(&self, sq: &SearchQuery, fetch_data: bool) -> Vec<SeriesResult> {
        let data = self.data.read().await;
        let tr = sq.time_range;
        let mut out = Vec::new();
        for series in data.values() {
            if series.tenant != sq.auth_token || !sq.matches(&series.metric_name) {
                continue;
            }
            let lo = series.timestamps.partition_point(|&ts| ts < tr.min_timestamp);
            let hi = series.timestamps.partition_point(|&ts| ts <= tr.max_timestamp);
            if lo >= hi {
                continue;
            }
            let (timestamps, values, payloads) = if fetch_data {
                (
                    series.timestamps[lo..hi].to_vec(),
                    series.values[lo..hi].to_vec(),
                    series.payloads.as_ref().map(|p| p[lo..hi].to_vec()),
                )
            } else {
                (Vec::new(), Vec::new(), None)
            };
            let mut rs = SeriesResult::new(series.metric_name.clone(), timestamps, values);
            rs.payloads = payloads;
            out.push(rs);
        }
        out
    }

    /// Encodes matching series into raw blocks. Blocks are cut by row count and
    /// may extend beyond the query range; receivers filter by `time_range`.
    pub async fn blocks(&self, sq: &SearchQuery) -> Vec<ExportedBlock> {
        let data = self.data.read().await;
        let tr = sq.time_range;
        let mut out = Vec::new();
        for series in data.values() {
            if series.tenant != sq.auth_token || !sq.matches(&series.metric_name) {
                continue;
            }
            let empty = Vec::new();
            let payloads = series.payloads.as_ref().unwrap_or(&empty);
            for (i, ts_chunk) in series.timestamps.chunks(self.rows_per_block).enumerate() {
                let first = ts_chunk[0];
                let last = ts_chunk[ts_chunk.len() - 1];
                if last < tr.min_timestamp || first > tr.max_timestamp {
                    continue;
                }
                let offset = i * self.rows_per_block;
                let payload_chunk = if payloads.is_empty() {
                    &[][..]
                } else {
                    &payloads[offset..offset + ts_chunk.len()]
                };
                out.push(ExportedBlock {
                    metric_name: series.metric_name.clone(),
                    block: Block::from_rows(ts_chunk, payload_chunk),
                    time_range: tr,
                });
            }
        }
        out
    }

    /// Removes matching series regardless of time range
    pub async fn delete(&self, sq: &SearchQuery) -> usize {
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, s| s.tenant != sq.auth_token || !sq.matches(&s.metric_name));
        before - data.len()
    }

    /// Label names with their values for a tenant
    pub async fn label_entries(&self, tenant: &AuthToken) -> Vec<LabelEntry> {
        let data = self.data.read().await;
        let mut m: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for series in data.values().filter(|s| s.tenant == *tenant) {
            m.entry(NAME_LABEL.to_string())
                .or_default()
                .insert(series.metric_name.metric_group.clone());
            for tag in &series.metric_name.tags {
                m.entry(tag.key.clone()).or_default().insert(tag.value.clone());
            }
        }
        m.into_iter()
            .map(|(key, values)| {
                let mut values: Vec<String> = values.into_iter().collect();
                values.sort();
                LabelEntry { key, values }
            })
            .collect()
    }

    pub async fn series_count(&self, tenant: &AuthToken) -> u64 {
        let data = self.data.read().await;
        data.values().filter(|s| s.tenant == *tenant).count() as u64
    }

    /// Unsorted, untruncated statistics for series with samples on `date`
    pub async fn tsdb_status(&self, tenant: &AuthToken, date: u64) -> TsdbStatus {
        let day_start = date as i64 * MSECS_PER_DAY;
        let day_end = day_start + MSECS_PER_DAY;
        let data = self.data.read().await;

        let mut by_name: HashMap<String, u64> = HashMap::new();
        let mut values_by_label: HashMap<String, HashSet<String>> = HashMap::new();
        let mut by_pair: HashMap<String, u64> = HashMap::new();
        for series in data.values().filter(|s| s.tenant == *tenant) {
            let seen_on_day = series
                .timestamps
                .iter()
                .any(|&ts| ts >= day_start && ts < day_end);
            if !seen_on_day {
                continue;
            }
            let mn = &series.metric_name;
            *by_name.entry(mn.metric_group.clone()).or_default() += 1;
            *by_pair
                .entry(format!("{}={}", NAME_LABEL, mn.metric_group))
                .or_default() += 1;
            values_by_label
                .entry(NAME_LABEL.to_string())
                .or_default()
                .insert(mn.metric_group.clone());
            for tag in &mn.tags {
                *by_pair.entry(format!("{}={}", tag.key, tag.value)).or_default() += 1;
                values_by_label
                    .entry(tag.key.clone())
                    .or_default()
                    .insert(tag.value.clone());
            }
        }

        let entries = |m: HashMap<String, u64>| {
            m.into_iter()
                .map(|(name, count)| TopHeapEntry { name, count })
                .collect()
        };
        TsdbStatus {
            series_count_by_metric_name: entries(by_name),
            label_value_count_by_label_name: entries(
                values_by_label
                    .into_iter()
                    .map(|(k, v)| (k, v.len() as u64))
                    .collect(),
            ),
            series_count_by_label_value_pair: entries(by_pair),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("Invalid timestamp order")]
    InvalidTimestampOrder,
    #[error("Series mixes samples with and without payloads")]
    PayloadMismatch,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::search::{TagFilter, TimeRange};
    use tokio::test;

    fn query(tr: TimeRange, filters: Vec<TagFilter>) -> SearchQuery {
        SearchQuery::new(AuthToken::default(), tr, vec![filters])
    }

    #[test]
    async fn test_shard_insert_and_search() {
        let shard = Shard::new(100);
        let tenant = AuthToken::default();
        let mn = MetricName::new("up").with_tag("job", "a");
        for (ts, v) in [(1000, 1.0), (2000, 2.0), (3000, 3.0)] {
            shard.insert(tenant, &mn, ts, v, None).await.unwrap();
        }

        let found = shard
            .search(&query(TimeRange::new(1500, 3000), vec![TagFilter::eq("job", "a")]), true)
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].timestamps, vec![2000, 3000]);
        assert_eq!(found[0].values, vec![2.0, 3.0]);

        // Names only
        let names = shard
            .search(&query(TimeRange::all(), vec![TagFilter::eq("job", "a")]), false)
            .await;
        assert_eq!(names.len(), 1);
        assert!(names[0].timestamps.is_empty());

        // Other tenants see nothing
        let other = SearchQuery::new(
            AuthToken::new(7, 0),
            TimeRange::all(),
            vec![vec![TagFilter::eq("job", "a")]],
        );
        assert!(shard.search(&other, true).await.is_empty());
    }

    #[test]
    async fn test_shard_rejects_out_of_order_samples() {
        let shard = Shard::new(100);
        let mn = MetricName::new("up");
        shard.insert(AuthToken::default(), &mn, 2000, 1.0, None).await.unwrap();
        assert!(matches!(
            shard.insert(AuthToken::default(), &mn, 1000, 1.0, None).await,
            Err(ShardError::InvalidTimestampOrder)
        ));
        assert!(matches!(
            shard
                .insert(AuthToken::default(), &mn, 3000, 1.0, Some(b"x".to_vec()))
                .await,
            Err(ShardError::PayloadMismatch)
        ));
    }

    #[test]
    async fn test_shard_blocks_are_cut_by_rows() {
        let shard = Shard::new(2);
        let mn = MetricName::new("logs").with_tag("app", "web");
        for ts in 1..=5 {
            shard
                .insert(AuthToken::default(), &mn, ts * 1000, 0.0, Some(format!("l{}", ts).into_bytes()))
                .await
                .unwrap();
        }
        let blocks = shard
            .blocks(&query(TimeRange::new(2500, 5000), vec![TagFilter::eq("app", "web")]))
            .await;
        // [1000,2000] is skipped, [3000,4000] and [5000] overlap the range
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    async fn test_shard_delete_and_labels() {
        let shard = Shard::new(100);
        let tenant = AuthToken::default();
        shard
            .insert(tenant, &MetricName::new("up").with_tag("job", "a"), 1000, 1.0, None)
            .await
            .unwrap();
        shard
            .insert(tenant, &MetricName::new("up").with_tag("job", "b"), 1000, 1.0, None)
            .await
            .unwrap();

        let entries = shard.label_entries(&tenant).await;
        assert_eq!(entries[0].key, NAME_LABEL);
        assert_eq!(entries[1].values, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(shard.series_count(&tenant).await, 2);

        let deleted = shard
            .delete(&query(TimeRange::all(), vec![TagFilter::eq("job", "a")]))
            .await;
        assert_eq!(deleted, 1);
        assert_eq!(shard.series_count(&tenant).await, 1);
    }

    #[test]
    async fn test_shard_tsdb_status_for_day() {
        let shard = Shard::new(100);
        let tenant = AuthToken::default();
        let day = 19_000u64;
        let ts = day as i64 * MSECS_PER_DAY + 1000;
        shard
            .insert(tenant, &MetricName::new("up").with_tag("job", "a"), ts, 1.0, None)
            .await
            .unwrap();
        shard
            .insert(tenant, &MetricName::new("old"), 1000, 1.0, None)
            .await
            .unwrap();

        let status = shard.tsdb_status(&tenant, day).await;
        assert_eq!(
            status.series_count_by_metric_name,
            vec![TopHeapEntry { name: "up".to_string(), count: 1 }]
        );
        assert_eq!(status.series_count_by_label_value_pair.len(), 2);
    }
}
