//! Reusable buffers for the export path.
//!
//! An `ExportBlock` holds one series (or a row-limited slice of it) while it
//! is serialized. Blocks are taken from the pool by a single worker, reset and
//! returned after use, so a returned block never carries data of a previous
//! series.

use std::sync::{Mutex, PoisonError};

use crate::storage::data::MetricName;

/// Upper bound on idle buffers kept by a pool
const MAX_POOLED: usize = 1024;

/// Working copy of one series being exported
#[derive(Debug, Default)]
pub struct ExportBlock {
    pub metric_name: MetricName,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
    pub payloads: Vec<Vec<u8>>,
}

impl ExportBlock {
    /// Clears the block while keeping its allocations
    pub fn reset(&mut self) {
        self.metric_name = MetricName::default();
        self.timestamps.clear();
        self.values.clear();
        self.payloads.clear();
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// View over all rows
    pub fn rows(&self) -> ExportRows<'_> {
        ExportRows {
            metric_name: &self.metric_name,
            timestamps: &self.timestamps,
            values: &self.values,
            payloads: &self.payloads,
        }
    }

    /// Splits the rows into consecutive views of at most `max_rows` rows.
    /// Zero means no limit.
    pub fn row_chunks(&self, max_rows: usize) -> Vec<ExportRows<'_>> {
        let n = self.len();
        if max_rows == 0 || n <= max_rows {
            return vec![self.rows()];
        }
        (0..n)
            .step_by(max_rows)
            .map(|lo| {
                let hi = (lo + max_rows).min(n);
                ExportRows {
                    metric_name: &self.metric_name,
                    timestamps: &self.timestamps[lo..hi],
                    values: &self.values[lo.min(self.values.len())..hi.min(self.values.len())],
                    payloads: if self.payloads.is_empty() {
                        &[]
                    } else {
                        &self.payloads[lo.min(self.payloads.len())..hi.min(self.payloads.len())]
                    },
                }
            })
            .collect()
    }
}

/// Borrowed rows of an `ExportBlock`, serialized as one output unit
#[derive(Debug, Clone, Copy)]
pub struct ExportRows<'a> {
    pub metric_name: &'a MetricName,
    pub timestamps: &'a [i64],
    pub values: &'a [f64],
    /// Empty for numeric series
    pub payloads: &'a [Vec<u8>],
}

impl ExportRows<'_> {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Free list of reusable values
#[derive(Debug)]
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    reset: fn(&mut T),
}

impl<T: Default> Pool<T> {
    pub fn new(reset: fn(&mut T)) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            reset,
        }
    }

    /// Returns an idle value or a fresh one
    pub fn get(&self) -> T {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default()
    }

    /// Resets `v` and keeps it for reuse
    pub fn put(&self, mut v: T) {
        (self.reset)(&mut v);
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < MAX_POOLED {
            free.push(v);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub type ExportBlockPool = Pool<ExportBlock>;
pub type BufferPool = Pool<Vec<u8>>;

/// Pools shared by the handlers of one server
#[derive(Debug)]
pub struct Pools {
    pub export_blocks: ExportBlockPool,
    pub buffers: BufferPool,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            export_blocks: Pool::new(ExportBlock::reset),
            buffers: Pool::new(Vec::clear),
        }
    }
}
