//! Progress throttling and statistics collection

use ferrolift_io::ProgressSample;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::{Interval, MissedTickBehavior};

/// Keeps the most recent progress sample until the next window tick
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    window: Duration,
    pending: Option<ProgressSample>,
    last_persisted: Option<u64>,
}

impl ProgressThrottle {
    /// Create a throttle with the given window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            last_persisted: None,
        }
    }

    /// Ticker firing once per window
    pub fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.window.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Record a sample, replacing the one not yet persisted
    pub fn offer(&mut self, sample: ProgressSample) {
        self.pending = Some(sample);
    }

    /// Sample to persist at a tick; `None` when the count has not moved since the last one
    pub fn take_pending(&mut self) -> Option<ProgressSample> {
        let sample = self.pending.take()?;
        if self.last_persisted == Some(sample.bytes) {
            return None;
        }
        self.last_persisted = Some(sample.bytes);
        Some(sample)
    }
}

/// Engine counters
#[derive(Debug, Clone)]
pub struct Statistics {
    /// Transfers submitted
    pub transfers_submitted: u64,
    /// Cancellations accepted
    pub cancels_accepted: u64,
    /// Parents staged
    pub parents_staged: u64,
    /// Child copy attempts started
    pub child_attempts: u64,
    /// Child attempts retried after a transient error
    pub child_retries: u64,
    /// Children completed
    pub children_completed: u64,
    /// Children failed
    pub children_failed: u64,
    /// Children cancelled
    pub children_cancelled: u64,
    /// Bytes copied by completed children
    pub bytes_transferred: u64,
    /// Time spent in completed copies
    pub transfer_time: Duration,
    /// Engine uptime
    pub uptime: Duration,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            transfers_submitted: 0,
            cancels_accepted: 0,
            parents_staged: 0,
            child_attempts: 0,
            child_retries: 0,
            children_completed: 0,
            children_failed: 0,
            children_cancelled: 0,
            bytes_transferred: 0,
            transfer_time: Duration::ZERO,
            uptime: Duration::ZERO,
        }
    }
}

impl Statistics {
    /// Percentage of finished children that completed
    pub fn success_rate(&self) -> f64 {
        let finished = self.children_completed + self.children_failed + self.children_cancelled;
        if finished > 0 {
            (self.children_completed as f64 / finished as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Average copy throughput in bytes per second
    pub fn throughput(&self) -> f64 {
        if self.transfer_time.as_secs_f64() > 0.0 {
            self.bytes_transferred as f64 / self.transfer_time.as_secs_f64()
        } else {
            0.0
        }
    }
}

/// Shared statistics sink
#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    statistics: Arc<RwLock<Statistics>>,
    start_time: Instant,
}

impl StatisticsCollector {
    /// Create a collector
    pub fn new() -> Self {
        Self {
            statistics: Arc::new(RwLock::new(Statistics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record a transfer submission
    pub async fn record_transfer_submitted(&self) {
        self.statistics.write().await.transfers_submitted += 1;
    }

    /// Record an accepted cancellation
    pub async fn record_cancel_accepted(&self) {
        self.statistics.write().await.cancels_accepted += 1;
    }

    /// Record a parent reaching STAGED
    pub async fn record_parent_staged(&self) {
        self.statistics.write().await.parents_staged += 1;
    }

    /// Record the start of a child attempt
    pub async fn record_child_attempt(&self, retry: bool) {
        let mut stats = self.statistics.write().await;
        stats.child_attempts += 1;
        if retry {
            stats.child_retries += 1;
        }
    }

    /// Record a completed child
    pub async fn record_child_completed(&self, bytes: u64, elapsed: Duration) {
        let mut stats = self.statistics.write().await;
        stats.children_completed += 1;
        stats.bytes_transferred += bytes;
        stats.transfer_time += elapsed;
    }

    /// Record a failed child
    pub async fn record_child_failed(&self) {
        self.statistics.write().await.children_failed += 1;
    }

    /// Record a cancelled child
    pub async fn record_child_cancelled(&self) {
        self.statistics.write().await.children_cancelled += 1;
    }

    /// Current counters
    pub async fn snapshot(&self) -> Statistics {
        let mut stats = self.statistics.read().await.clone();
        stats.uptime = self.start_time.elapsed();
        stats
    }
}

impl Default for StatisticsCollector {
    fn default() -> Self {
        Self::new()
    }
}
