// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants;
use crate::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Compression applied to log bodies before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd(i32),
}

impl Compression {
    fn parse(value: &str, level: Option<i32>) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "gzip" => Some(Compression::Gzip),
            "zstd" => Some(Compression::Zstd(
                level.unwrap_or(constants::DEFAULT_ZSTD_LEVEL),
            )),
            _ => None,
        }
    }
}

/// Configuration of the metrics reporting service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Collector endpoint receiving uploaded logs
    pub server_url: String,
    /// Content-Type of uploaded logs
    pub mime_type: String,
    /// Whether the user has consented to uploads
    pub reporting_enabled: bool,
    /// Delay before gathering initial environment facts
    pub initialization_delay: Duration,
    /// First upload delay of a session
    pub initial_upload_interval: Duration,
    /// Steady-state upload cadence
    pub standard_upload_interval: Duration,
    /// Upload cadence while unsent logs are queued
    pub unsent_logs_interval: Duration,
    /// Factor applied to the interval after an unhealthy upload
    pub backoff_multiplier: f64,
    /// Cap of the backed-off interval, as a multiple of the standard interval
    pub max_backoff_multiplier: u32,
    /// Maximum events kept in an uploaded log
    pub event_limit: usize,
    /// Size above which a failed upload is dropped instead of retried
    pub upload_log_avoid_retransmit_size: usize,
    /// Minimum number of initial logs persisted
    pub initial_logs_persist_limit: usize,
    /// Minimum number of ongoing logs persisted
    pub ongoing_logs_persist_limit: usize,
    /// Minimum compressed bytes persisted per queue
    pub storage_byte_limit_per_log_type: usize,
    /// Interval of periodic local state saves
    pub save_state_interval: Duration,
    /// Timeout of one upload request
    pub request_timeout: Duration,
    /// Upload compression
    pub compression: Compression,
    /// Directory of the durable local state store, in-memory when unset
    pub store_path: Option<PathBuf>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_url: constants::DEFAULT_SERVER_URL.to_string(),
            mime_type: constants::LOG_MIME_TYPE.to_string(),
            reporting_enabled: true,
            initialization_delay: constants::INITIALIZATION_DELAY,
            initial_upload_interval: constants::INITIAL_UPLOAD_INTERVAL,
            standard_upload_interval: constants::STANDARD_UPLOAD_INTERVAL,
            unsent_logs_interval: constants::UNSENT_LOGS_INTERVAL,
            backoff_multiplier: constants::BACKOFF_MULTIPLIER,
            max_backoff_multiplier: constants::MAX_BACKOFF_MULTIPLIER,
            event_limit: constants::EVENT_LIMIT,
            upload_log_avoid_retransmit_size: constants::UPLOAD_LOG_AVOID_RETRANSMIT_SIZE,
            initial_logs_persist_limit: constants::INITIAL_LOGS_PERSIST_LIMIT,
            ongoing_logs_persist_limit: constants::ONGOING_LOGS_PERSIST_LIMIT,
            storage_byte_limit_per_log_type: constants::STORAGE_BYTE_LIMIT_PER_LOG_TYPE,
            save_state_interval: constants::SAVE_STATE_INTERVAL,
            request_timeout: constants::REQUEST_TIMEOUT,
            compression: Compression::Gzip,
            store_path: None,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|val| val.parse::<usize>().ok())
}

impl ServiceConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let server_url = env::var("METRICS_SERVER_URL").unwrap_or(defaults.server_url);
        let reporting_enabled = env::var("METRICS_REPORTING_ENABLED")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(defaults.reporting_enabled);
        let compression_level = env::var("METRICS_COMPRESSION_LEVEL")
            .ok()
            .and_then(|val| val.parse::<i32>().ok());
        let compression = match env::var("METRICS_COMPRESSION") {
            Ok(val) => Compression::parse(&val, compression_level).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "Unknown compression '{}'. Must be one of: gzip, zstd",
                    val
                ))
            })?,
            Err(_) => defaults.compression,
        };
        let store_path = env::var("METRICS_STORE_PATH").ok().map(PathBuf::from);
        let https_proxy = env::var("METRICS_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let log_level = env::var("METRICS_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            server_url,
            reporting_enabled,
            initialization_delay: env_secs("METRICS_INITIALIZATION_DELAY_SECS")
                .unwrap_or(defaults.initialization_delay),
            initial_upload_interval: env_secs("METRICS_INITIAL_UPLOAD_INTERVAL_SECS")
                .unwrap_or(defaults.initial_upload_interval),
            standard_upload_interval: env_secs("METRICS_UPLOAD_INTERVAL_SECS")
                .unwrap_or(defaults.standard_upload_interval),
            unsent_logs_interval: env_secs("METRICS_UNSENT_LOGS_INTERVAL_SECS")
                .unwrap_or(defaults.unsent_logs_interval),
            event_limit: env_usize("METRICS_EVENT_LIMIT").unwrap_or(defaults.event_limit),
            save_state_interval: env_secs("METRICS_SAVE_STATE_INTERVAL_SECS")
                .unwrap_or(defaults.save_state_interval),
            request_timeout: env_secs("METRICS_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            compression,
            store_path,
            https_proxy,
            log_level,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "Server URL '{}' must be an http(s) URL",
                self.server_url
            )));
        }

        if self.mime_type.trim().is_empty() {
            return Err(ConfigError::Invalid("MIME type cannot be empty".to_string()));
        }

        if self.event_limit == 0 {
            return Err(ConfigError::Invalid(
                "Event limit must be greater than 0".to_string(),
            ));
        }

        if self.standard_upload_interval.is_zero() || self.unsent_logs_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Upload intervals must be greater than 0".to_string(),
            ));
        }

        if self.backoff_multiplier.is_nan()
            || self.backoff_multiplier < 1.0
            || self.max_backoff_multiplier == 0
        {
            return Err(ConfigError::Invalid(
                "Backoff multiplier must be at least 1 and its cap positive".to_string(),
            ));
        }

        if let Compression::Zstd(level) = self.compression {
            if !(1..=22).contains(&level) {
                return Err(ConfigError::Invalid(format!(
                    "Invalid zstd level {}. Must be between 1 and 22",
                    level
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Largest interval the scheduler may back off to.
    pub fn max_backoff_interval(&self) -> Duration {
        self.standard_upload_interval * self.max_backoff_multiplier
    }
}
