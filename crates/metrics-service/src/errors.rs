// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the metrics service.

use thiserror::Error;

/// Failures of the durable key/value store backing local state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures while moving logs through the log store.
#[derive(Debug, Error)]
pub enum LogStoreError {
    #[error("a current log is already being recorded")]
    CurrentLogPresent,
    #[error("no current log to finish")]
    NoCurrentLog,
    #[error("failed to serialize log: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to compress log: {0}")]
    Compression(#[source] std::io::Error),
}

/// Failures building an upload request out of a staged log.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to compress log for upload: {0}")]
    Compression(#[source] std::io::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// Invalid service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced to callers driving the reporting service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reporting service is not running: {0}")]
    ChannelClosed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::Invalid("event limit must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: event limit must be positive"
        );

        let error = ServiceError::from(error);
        assert_eq!(
            error.to_string(),
            "Invalid configuration: event limit must be positive"
        );
    }

    #[test]
    fn test_log_store_error_debug() {
        let error = LogStoreError::CurrentLogPresent;
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("CurrentLogPresent"));
    }
}
