use std::fmt;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Label key that addresses the metric name itself
pub const NAME_LABEL: &str = "__name__";

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Invalid series name: {0}")]
    InvalidSeriesName(String),
    #[error("Invalid tag key: {0}")]
    InvalidTagKey(String),
    #[error("Timestamp not monotonically non-decreasing at index {0}")]
    NonIncreasingTimestamp(usize),
    #[error("Mismatched series lengths: {timestamps} timestamps, {values} values, {payloads} payloads")]
    MismatchedLengths {
        timestamps: usize,
        values: usize,
        payloads: usize,
    },
    #[error("Cannot unmarshal {what}: {reason}")]
    Corrupted { what: &'static str, reason: String },
}

/// One key/value pair of a metric identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Metric identity: a name plus a key-sorted set of tags
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetricName {
    /// The metric name, stored outside the tag list
    pub metric_group: String,
    /// Tags sorted by key
    pub tags: Vec<Tag>,
}

impl MetricName {
    /// Creates a metric name without tags
    pub fn new(metric_group: impl Into<String>) -> Self {
        Self {
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    /// Adds a tag, keeping tags sorted by key. An existing key is overwritten.
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key == NAME_LABEL {
            self.metric_group = value;
            return;
        }
        match self.tags.binary_search_by(|t| t.key.as_str().cmp(&key)) {
            Ok(i) => self.tags[i].value = value,
            Err(i) => self.tags.insert(i, Tag { key, value }),
        }
    }

    /// Builder-style `add_tag`
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_tag(key, value);
        self
    }

    /// Returns the value for `key`; `__name__` resolves to the metric name
    pub fn get_tag_value(&self, key: &str) -> Option<&str> {
        if key == NAME_LABEL {
            return if self.metric_group.is_empty() {
                None
            } else {
                Some(self.metric_group.as_str())
            };
        }
        self.tags
            .binary_search_by(|t| t.key.as_str().cmp(key))
            .ok()
            .map(|i| self.tags[i].value.as_str())
    }

    /// Validates the metric identity
    pub fn validate(&self) -> Result<(), DataError> {
        if self.metric_group.is_empty() && self.tags.is_empty() {
            return Err(DataError::InvalidSeriesName(
                "Metric name must have a name or at least one tag".to_string(),
            ));
        }
        for tag in &self.tags {
            if tag.key.is_empty() {
                return Err(DataError::InvalidTagKey("Tag key cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Appends the length-prefixed binary form of the metric name to `dst`.
    ///
    /// Layout: `{u32 len, name}` followed by `{u32 len, key}{u32 len, value}`
    /// for every tag, all integers big-endian. Tenant information is not included.
    pub fn marshal(&self, dst: &mut Vec<u8>) {
        put_bytes(dst, self.metric_group.as_bytes());
        for tag in &self.tags {
            put_bytes(dst, tag.key.as_bytes());
            put_bytes(dst, tag.value.as_bytes());
        }
    }

    /// Parses the output of `marshal`
    pub fn unmarshal(mut src: &[u8]) -> Result<Self, DataError> {
        let metric_group = take_string(&mut src, "metric name")?;
        let mut mn = MetricName::new(metric_group);
        while !src.is_empty() {
            let key = take_string(&mut src, "tag key")?;
            let value = take_string(&mut src, "tag value")?;
            mn.tags.push(Tag { key, value });
        }
        Ok(mn)
    }

    /// Stable hash of the identity, used as the tail cursor key
    pub fn hash(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        self.marshal(&mut buf);
        xxh3_64(&buf)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.metric_group)?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", tag.key, tag.value)?;
        }
        write!(f, "}}")
    }
}

fn put_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    dst.extend_from_slice(&(b.len() as u32).to_be_bytes());
    dst.extend_from_slice(b);
}

pub(crate) fn take_u32(src: &mut &[u8], what: &'static str) -> Result<u32, DataError> {
    if src.len() < 4 {
        return Err(DataError::Corrupted {
            what,
            reason: format!("need 4 bytes for length, got {}", src.len()),
        });
    }
    let (head, tail) = src.split_at(4);
    *src = tail;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}

pub(crate) fn take_bytes<'a>(src: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], DataError> {
    let n = take_u32(src, what)? as usize;
    if src.len() < n {
        return Err(DataError::Corrupted {
            what,
            reason: format!("need {} bytes, got {}", n, src.len()),
        });
    }
    let (head, tail) = src.split_at(n);
    *src = tail;
    Ok(head)
}

fn take_string(src: &mut &[u8], what: &'static str) -> Result<String, DataError> {
    let b = take_bytes(src, what)?;
    String::from_utf8(b.to_vec()).map_err(|e| DataError::Corrupted {
        what,
        reason: e.to_string(),
    })
}

/// One time series as returned by the storage fan-out
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesResult {
    pub metric_name: MetricName,
    /// Stable hash of `metric_name`
    pub metric_name_hash: u64,
    /// Timestamps in milliseconds, non-decreasing
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    /// Raw per-sample payloads, parallel to `timestamps` when present
    pub payloads: Option<Vec<Vec<u8>>>,
}

impl SeriesResult {
    /// Creates a numeric series
    pub fn new(metric_name: MetricName, timestamps: Vec<i64>, values: Vec<f64>) -> Self {
        let metric_name_hash = metric_name.hash();
        Self {
            metric_name,
            metric_name_hash,
            timestamps,
            values,
            payloads: None,
        }
    }

    /// Attaches raw payloads to the series
    pub fn with_payloads(mut self, payloads: Vec<Vec<u8>>) -> Self {
        self.payloads = Some(payloads);
        self
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Returns the last timestamp, if any
    pub fn last_timestamp(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    /// Checks the parallel-array and ordering invariants
    pub fn validate(&self) -> Result<(), DataError> {
        let payloads = self.payloads.as_ref().map_or(self.timestamps.len(), Vec::len);
        if self.values.len() != self.timestamps.len() || payloads != self.timestamps.len() {
            return Err(DataError::MismatchedLengths {
                timestamps: self.timestamps.len(),
                values: self.values.len(),
                payloads,
            });
        }
        if let Some(i) = self.timestamps.windows(2).position(|w| w[1] < w[0]) {
            return Err(DataError::NonIncreasingTimestamp(i + 1));
        }
        Ok(())
    }
}
