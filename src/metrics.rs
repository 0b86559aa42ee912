//! Call and connection metrics.
//!
//! Every registered method carries a [`MethodMetrics`] with permitted and
//! denied counters plus latency distributions. Distributions use a fixed
//! geometric (1-2-5) bucketing from 0.1 ms to 100 s. Server-wide counters
//! live in [`ServerMetrics`]; handler faults and open client connections are
//! counted process-wide.
//!
//! Nothing here is on the correctness path of a call.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

lazy_static! {
    /// Upper bucket bounds in milliseconds: 0.1, 0.2, 0.5, 1, ... 1e5.
    static ref BUCKET_BOUNDS_MS: Vec<f64> = geometric_bounds(0.1, 1e5);
}

static NUM_HANDLER_FAULTS: AtomicU64 = AtomicU64::new(0);
static NUM_OPEN_CLIENT_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

fn geometric_bounds(low: f64, high: f64) -> Vec<f64> {
    let mut bounds = Vec::new();
    let mut decade = low;
    'outer: loop {
        for step in [1.0, 2.0, 5.0] {
            let bound = decade * step;
            if bound > high * 1.000_001 {
                break 'outer;
            }
            bounds.push(bound);
        }
        decade *= 10.0;
    }
    bounds
}

/// Number of handler panics caught since process start.
pub fn num_handler_faults() -> u64 {
    NUM_HANDLER_FAULTS.load(Ordering::Relaxed)
}

pub(crate) fn record_handler_fault() {
    NUM_HANDLER_FAULTS.fetch_add(1, Ordering::Relaxed);
}

/// Number of client connections currently open in this process.
pub fn num_open_client_connections() -> u64 {
    NUM_OPEN_CLIENT_CONNECTIONS.load(Ordering::Relaxed)
}

pub(crate) fn client_connection_opened() {
    NUM_OPEN_CLIENT_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn client_connection_closed() {
    NUM_OPEN_CLIENT_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

#[derive(Debug)]
struct DistributionState {
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
    buckets: Vec<u64>,
}

/// Cumulative latency distribution.
#[derive(Debug)]
pub struct Distribution {
    state: Mutex<DistributionState>,
}

impl Default for Distribution {
    fn default() -> Self {
        Self::new()
    }
}

impl Distribution {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DistributionState {
                count: 0,
                sum_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
                // One bucket per bound plus the overflow bucket.
                buckets: vec![0; BUCKET_BOUNDS_MS.len() + 1],
            }),
        }
    }

    pub fn add(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let index = BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS_MS.len());
        let mut state = self.state.lock();
        if state.count == 0 || ms < state.min_ms {
            state.min_ms = ms;
        }
        if ms > state.max_ms {
            state.max_ms = ms;
        }
        state.count += 1;
        state.sum_ms += ms;
        state.buckets[index] += 1;
    }

    pub fn snapshot(&self) -> DistributionSnapshot {
        let state = self.state.lock();
        let buckets = state
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| BucketCount {
                upper_bound_ms: BUCKET_BOUNDS_MS.get(i).copied(),
                count: *count,
            })
            .collect();
        DistributionSnapshot {
            count: state.count,
            sum_ms: state.sum_ms,
            min_ms: state.min_ms,
            max_ms: state.max_ms,
            mean_ms: if state.count == 0 {
                0.0
            } else {
                state.sum_ms / state.count as f64
            },
            buckets,
        }
    }
}

/// Non-empty bucket of a distribution. `upper_bound_ms` is `None` for the
/// overflow bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    pub upper_bound_ms: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub buckets: Vec<BucketCount>,
}

/// Metrics for one registered method.
#[derive(Debug, Default)]
pub struct MethodMetrics {
    permitted_calls: AtomicU64,
    denied_calls: AtomicU64,
    successful_calls: Distribution,
    failed_calls: Distribution,
    /// Handler-only timings, kept for request/reply methods.
    request_reply: Option<RequestReplyMetrics>,
}

#[derive(Debug, Default)]
struct RequestReplyMetrics {
    successful: Distribution,
    failed: Distribution,
}

impl MethodMetrics {
    pub(crate) fn new(request_reply: bool) -> Self {
        Self {
            request_reply: request_reply.then(RequestReplyMetrics::default),
            ..Default::default()
        }
    }

    pub fn num_permitted_calls(&self) -> u64 {
        self.permitted_calls.load(Ordering::Relaxed)
    }

    pub fn num_denied_calls(&self) -> u64 {
        self.denied_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn record_permitted(&self) {
        self.permitted_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.denied_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call(&self, elapsed: Duration, ok: bool) {
        if ok {
            self.successful_calls.add(elapsed);
        } else {
            self.failed_calls.add(elapsed);
        }
    }

    pub(crate) fn record_handler(&self, elapsed: Duration, ok: bool) {
        if let Some(rr) = &self.request_reply {
            if ok {
                rr.successful.add(elapsed);
            } else {
                rr.failed.add(elapsed);
            }
        }
    }

    pub fn snapshot(&self) -> MethodMetricsSnapshot {
        MethodMetricsSnapshot {
            num_permitted_calls: self.num_permitted_calls(),
            num_denied_calls: self.num_denied_calls(),
            successful_call_durations: self.successful_calls.snapshot(),
            failed_call_durations: self.failed_calls.snapshot(),
            successful_request_reply_durations: self
                .request_reply
                .as_ref()
                .map(|rr| rr.successful.snapshot()),
            failed_request_reply_durations: self
                .request_reply
                .as_ref()
                .map(|rr| rr.failed.snapshot()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodMetricsSnapshot {
    pub num_permitted_calls: u64,
    pub num_denied_calls: u64,
    pub successful_call_durations: DistributionSnapshot,
    pub failed_call_durations: DistributionSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_request_reply_durations: Option<DistributionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_request_reply_durations: Option<DistributionSnapshot>,
}

/// Connection counters for one server.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections: AtomicU64,
    open_connections: AtomicU64,
    rejected_connections: AtomicU64,
}

impl ServerMetrics {
    pub fn num_connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn num_open_connections(&self) -> u64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn num_rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn record_attempt(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an open connection until the guard drops.
    pub(crate) fn open_connection(&self) -> OpenConnectionGuard<'_> {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        OpenConnectionGuard { metrics: self }
    }

    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            num_connections: self.num_connections(),
            num_open_connections: self.num_open_connections(),
            num_rejected_connections: self.num_rejected_connections(),
            num_handler_faults: num_handler_faults(),
        }
    }
}

pub(crate) struct OpenConnectionGuard<'a> {
    metrics: &'a ServerMetrics,
}

impl Drop for OpenConnectionGuard<'_> {
    fn drop(&mut self) {
        self.metrics.open_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMetricsSnapshot {
    pub num_connections: u64,
    pub num_open_connections: u64,
    pub num_rejected_connections: u64,
    pub num_handler_faults: u64,
}
