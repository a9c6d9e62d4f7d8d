// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of usage and stability logs: recording into a current log,
//! durable unsent queues that survive restarts, and scheduled, compressed
//! uploads with backoff.
//!
//! Embedders build a [`ReportingService`], register their
//! [`MetricsProvider`]s, spawn [`ReportingService::run`] and drive it through
//! the returned [`ReportingHandle`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod histograms;
pub mod log;
pub mod log_store;
pub mod metrics_service;
pub mod persisted_logs;
pub mod prefs;
pub mod provider;
pub mod reporting_service;
pub mod scheduler;
pub mod session;
pub mod synthetic_trials;
pub mod uploader;

pub use config::{Compression, ServiceConfig};
pub use dispatcher::{MetricsServiceClient, Task, TaskDispatcher, TaskOutcome, TokioDispatcher};
pub use errors::{ConfigError, LogStoreError, ServiceError, StoreError, UploadError};
pub use histograms::{HistogramFlags, Histograms};
pub use log::{Environment, LogKind, MetricsLog};
pub use metrics_service::{MetricsService, ServiceSnapshot, ServiceState};
pub use prefs::{InMemoryPrefStore, LocalState, PrefStore, SledPrefStore};
pub use provider::MetricsProvider;
pub use reporting_service::{ReportingCommand, ReportingHandle, ReportingService};
pub use session::ExecutionPhase;
pub use uploader::{LogTransport, ReqwestTransport, UploadRequest, UploadResponse};
