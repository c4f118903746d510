use std::time::{Duration, Instant};

use hashbrown::HashMap;
use rand::{thread_rng, Rng};
use tracing::{info, warn};

use crate::registry::Addr;

/// Tuning knobs for the per-address retry state machine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failures tolerated with immediate retries before backoff starts.
    pub max_host_retries: u32,
    /// First backoff interval.
    pub base_retry_interval: Duration,
    /// Multiplier applied to the interval on each failure beyond
    /// `max_host_retries`.
    pub retry_interval_mult: u32,
    /// Upper bound (exclusive) of the uniform jitter added per bump,
    /// de-synchronizing retry storms across clients.
    pub retry_slop: Duration,
    /// Ceiling for the backoff interval.
    pub max_retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_host_retries: 3,
            base_retry_interval: Duration::from_secs(10),
            retry_interval_mult: 2,
            retry_slop: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct HealthRecord {
    failures: u32,
    last_attempt: Instant,
    down_since: Instant,
    retry_interval: Duration,
}

/// Per-address failure bookkeeping.
///
/// An address is either up (no record) or down. While down, the first
/// `max_host_retries` failures keep it immediately retryable; beyond that
/// the retry interval grows geometrically with jitter until
/// `max_retry_interval`. A successful reply erases the record entirely.
pub struct HealthTracker {
    policy: RetryPolicy,
    records: HashMap<Addr, HealthRecord>,
}

impl HealthTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: HashMap::new(),
        }
    }

    pub fn is_down(&self, addr: &Addr) -> bool {
        self.records.contains_key(addr)
    }

    /// Record a failure against `addr`.
    pub fn mark_down(&mut self, addr: &Addr) {
        let now = Instant::now();
        match self.records.get_mut(addr) {
            None => {
                warn!(backend = %addr, "backend marked down");
                self.records.insert(
                    addr.clone(),
                    HealthRecord {
                        failures: 1,
                        last_attempt: now,
                        down_since: now,
                        retry_interval: self.policy.base_retry_interval,
                    },
                );
            }
            Some(record) => {
                record.failures += 1;
                record.last_attempt = now;
                if record.failures == self.policy.max_host_retries {
                    warn!(
                        backend = %addr,
                        failures = record.failures,
                        "backend entering retry backoff"
                    );
                }
                if record.failures > self.policy.max_host_retries
                    && record.retry_interval < self.policy.max_retry_interval
                {
                    let slop = self.policy.retry_slop.as_millis() as u64;
                    let jitter = if slop > 0 {
                        Duration::from_millis(thread_rng().gen_range(0..slop))
                    } else {
                        Duration::ZERO
                    };
                    let bumped = record.retry_interval * self.policy.retry_interval_mult + jitter;
                    record.retry_interval = bumped.min(self.policy.max_retry_interval);
                    warn!(
                        backend = %addr,
                        failures = record.failures,
                        retry_in = ?record.retry_interval,
                        "backend retry interval increased"
                    );
                }
            }
        }
    }

    /// Record a success, clearing any failure history.
    pub fn mark_up(&mut self, addr: &Addr) {
        if let Some(record) = self.records.remove(addr) {
            info!(
                backend = %addr,
                down_for = ?record.down_since.elapsed(),
                "backend back up"
            );
        }
    }

    /// Whether a dispatch to `addr` may be attempted now. Granting a
    /// backoff retry stamps the attempt time so concurrent dispatches do
    /// not pile onto the same window.
    pub fn needs_retry(&mut self, addr: &Addr) -> bool {
        let threshold = self.policy.max_host_retries;
        match self.records.get_mut(addr) {
            None => true,
            Some(record) if record.failures < threshold => true,
            Some(record) => {
                let now = Instant::now();
                if now.duration_since(record.last_attempt) >= record.retry_interval {
                    record.last_attempt = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Current backoff interval for a down address.
    pub fn retry_interval(&self, addr: &Addr) -> Option<Duration> {
        self.records.get(addr).map(|record| record.retry_interval)
    }

    pub fn failures(&self, addr: &Addr) -> u32 {
        self.records
            .get(addr)
            .map(|record| record.failures)
            .unwrap_or(0)
    }
}
