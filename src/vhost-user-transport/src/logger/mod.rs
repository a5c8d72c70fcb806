// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics for the vhost-user transport.
//!
//! The transport logs through the `log` facade, so any `log::Log` implementation installed by
//! the embedding process receives its records. Processes that do not bring their own install
//! [`LOGGER`] through [`init_logger`].

mod logging;
mod metrics;
mod time;

use std::sync::LockResult;

pub use log::{debug, error, info, trace, warn};

pub use crate::logger::logging::{
    BACKEND_NAME, DEFAULT_BACKEND_NAME, DEFAULT_LEVEL, LOGGER, LevelFilter,
    LevelFilterFromStrError, Logger, LoggerConfig, LoggerConfigError, LoggerInitError,
    LoggerUpdateError, init_logger,
};
pub use crate::logger::metrics::{
    ConnectionMetrics, IncMetric, LoggerMetrics, METRICS, MetricsError, SharedIncMetric,
    TransportMetrics,
};
pub use crate::logger::time::LocalTime;

fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // A panicking writer leaves the target usable; at worst one line is incomplete.
        Err(poisoned) => poisoned.into_inner(),
    }
}
