//! Live tailing.
//!
//! A tail session re-runs a range query on a fixed interval and only emits
//! entries newer than what every series already emitted. The session keeps a
//! cursor per series (metric name hash -> last emitted timestamp) and stops
//! once the row budget is spent.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SelectResult;
use crate::metrics;
use crate::query::params::DEFAULT_STEP;
use crate::storage::data::SeriesResult;

/// Step of the range query issued by each poll
pub const TAIL_STEP: i64 = 60;

/// Source of wall-clock time in milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Runs one poll of a tail session
pub trait TailSource {
    /// Queries `[start, end]` with at most `limit` entries, drops entries at or
    /// before the cursors in `filter`, writes the rest to the client and
    /// returns them.
    fn poll(
        &mut self,
        start: i64,
        end: i64,
        limit: i64,
        filter: &HashMap<u64, i64>,
    ) -> impl Future<Output = SelectResult<Vec<SeriesResult>>> + Send;
}

/// State of one tailing client
#[derive(Debug)]
pub struct TailSession {
    id: Uuid,
    start: i64,
    remaining: i64,
    cursors: HashMap<u64, i64>,
}

impl TailSession {
    pub fn new(start: i64, limit: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            start,
            remaining: limit,
            cursors: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start of the next poll
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Rows left before the session ends
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn cursors(&self) -> &HashMap<u64, i64> {
        &self.cursors
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }

    /// Records the entries emitted by a poll that ended at `end`. Cursors idle
    /// for more than `DEFAULT_STEP` are dropped. Returns false once the row
    /// budget is exhausted.
    pub fn advance(&mut self, emitted: &[SeriesResult], end: i64) -> bool {
        for rs in emitted {
            let Some(last) = rs.last_timestamp() else {
                continue;
            };
            if last > self.start {
                self.start = last;
            }
            self.cursors.insert(rs.metric_name_hash, last);
            self.remaining -= rs.len() as i64;
        }
        self.cursors.retain(|_, &mut last| end - last <= DEFAULT_STEP);
        !self.is_exhausted()
    }
}

/// Polls `source` every `interval` until the session's budget is spent or
/// `cancel` fires. The first poll runs immediately.
pub async fn run<S, C>(
    session: &mut TailSession,
    source: &mut S,
    clock: &C,
    interval: Duration,
    cancel: &CancellationToken,
) -> SelectResult<()>
where
    S: TailSource,
    C: Clock,
{
    info!(session = %session.id, start = session.start, limit = session.remaining, "tail session started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(session = %session.id, "tail session cancelled");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let end = clock.now_ms();
        let emitted = source
            .poll(session.start, end, session.remaining, &session.cursors)
            .await?;
        let rows: usize = emitted.iter().map(SeriesResult::len).sum();
        metrics::record_tail_rows(rows as u64);
        debug!(session = %session.id, rows, end, "tail poll finished");

        if !session.advance(&emitted, end) {
            break;
        }
    }
    info!(session = %session.id, "tail session finished");
    Ok(())
}
