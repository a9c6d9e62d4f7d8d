// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Collector endpoint receiving uploaded logs.
pub const DEFAULT_SERVER_URL: &str = "https://metrics-collector.datadoghq.com/v2/logs";

/// MIME type of an uploaded log body.
pub const LOG_MIME_TYPE: &str = "application/vnd.metrics.log";

/// Header carrying the hex SHA-1 of the uncompressed log body.
pub const LOG_HASH_HEADER: &str = "X-Metrics-Log-SHA1";

/// Delay between enabling recording and gathering slow environment facts.
pub const INITIALIZATION_DELAY: Duration = Duration::from_secs(30);

/// Delay before the first upload of a session.
pub const INITIAL_UPLOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Normal cadence of ongoing log uploads.
pub const STANDARD_UPLOAD_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Cadence used while unsent logs remain queued.
pub const UNSENT_LOGS_INTERVAL: Duration = Duration::from_secs(15);

/// Growth factor applied to the upload interval after an unhealthy upload.
pub const BACKOFF_MULTIPLIER: f64 = 1.1;

/// Upper bound of the backed-off interval, as a multiple of the standard interval.
pub const MAX_BACKOFF_MULTIPLIER: u32 = 10;

/// Maximum number of events in an uploaded log.
pub const EVENT_LIMIT: usize = 2400;

/// Logs larger than this are dropped on a failed upload instead of being retried,
/// and ongoing logs larger than this are never persisted.
pub const UPLOAD_LOG_AVOID_RETRANSMIT_SIZE: usize = 50_000;

/// Minimum number of initial logs kept when persisting.
pub const INITIAL_LOGS_PERSIST_LIMIT: usize = 20;

/// Minimum number of ongoing logs kept when persisting.
pub const ONGOING_LOGS_PERSIST_LIMIT: usize = 8;

/// Minimum number of compressed bytes kept per log queue when persisting.
pub const STORAGE_BYTE_LIMIT_PER_LOG_TYPE: usize = 300_000;

/// Interval between periodic saves of local state.
pub const SAVE_STATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Timeout of a single upload request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default compression level for zstd encoded uploads.
pub const DEFAULT_ZSTD_LEVEL: i32 = 6;

/// Name of the sled tree holding local state.
pub const LOCAL_STATE_TREE: &str = "local_state";
