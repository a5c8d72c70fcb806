// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport metrics.
//!
//! All counters are [`SharedIncMetric`]s living in the [`METRICS`] static, so the socket
//! threads, the reconnection thread and the dispatcher can bump them without coordination.
//! Serializing a counter emits the delta since the previous serialization and resets it,
//! which is what a periodic flusher wants:
//!
//! ```json
//! {
//!   "transport": {
//!     "connections_accepted": 1,
//!     "connections_established": 1,
//!     ...
//!   },
//!   "logger": { "missed_log_count": 0 }
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// Static instance used for handling metrics.
pub static METRICS: TransportMetrics = TransportMetrics::new();

/// Describes the errors which may occur while handling metrics.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Failed to serialize metrics: {0}
    Serde(#[from] serde_json::Error),
}

/// Used for defining new types of metrics that act as a counter.
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
    /// Returns diff of current and last flushed value of the counter.
    fn fetch_diff(&self) -> u64;
}

/// Counter that can be incremented from more than one thread.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Serializing flushes: the emitted value is the delta since the last flush.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Connection lifecycle and fd-passing counters.
#[derive(Debug, Default, Serialize)]
pub struct ConnectionMetrics {
    /// Number of peers accepted on server sockets.
    pub connections_accepted: SharedIncMetric,
    /// Number of connections promoted into a socket's registry.
    pub connections_established: SharedIncMetric,
    /// Number of connections torn down, by handler failure or socket cleanup.
    pub connections_closed: SharedIncMetric,
    /// Number of peers dropped before becoming a connection.
    pub connection_setup_fails: SharedIncMetric,
    /// Number of failed client connect attempts.
    pub connect_fails: SharedIncMetric,
    /// Number of reconnection attempts made by the scheduler.
    pub reconnect_attempts: SharedIncMetric,
    /// Number of reconnection attempts that produced a connection.
    pub reconnect_successes: SharedIncMetric,
    /// Number of failed fd-message sends.
    pub send_fails: SharedIncMetric,
    /// Number of failed fd-message receives.
    pub recv_fails: SharedIncMetric,
    /// Number of received fd-messages rejected as truncated.
    pub truncated_messages: SharedIncMetric,
}

impl ConnectionMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            connections_accepted: SharedIncMetric::new(),
            connections_established: SharedIncMetric::new(),
            connections_closed: SharedIncMetric::new(),
            connection_setup_fails: SharedIncMetric::new(),
            connect_fails: SharedIncMetric::new(),
            reconnect_attempts: SharedIncMetric::new(),
            reconnect_successes: SharedIncMetric::new(),
            send_fails: SharedIncMetric::new(),
            recv_fails: SharedIncMetric::new(),
            truncated_messages: SharedIncMetric::new(),
        }
    }
}

/// Logger related metrics.
#[derive(Debug, Default, Serialize)]
pub struct LoggerMetrics {
    /// Number of log lines that could not be written.
    pub missed_log_count: SharedIncMetric,
}

impl LoggerMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_log_count: SharedIncMetric::new(),
        }
    }
}

/// All transport metrics.
#[derive(Debug, Default, Serialize)]
pub struct TransportMetrics {
    /// Connection lifecycle metrics.
    pub transport: ConnectionMetrics,
    /// Logger metrics.
    pub logger: LoggerMetrics,
}

impl TransportMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            transport: ConnectionMetrics::new(),
            logger: LoggerMetrics::new(),
        }
    }

    /// Serializes the metrics to JSON, flushing every counter.
    pub fn to_json(&self) -> Result<String, MetricsError> {
        Ok(serde_json::to_string(self)?)
    }
}
