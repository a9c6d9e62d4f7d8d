// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turning staged logs into HTTP requests and classifying the responses.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, warn};
use zstd::stream::write::Encoder;

use crate::config::{Compression, ServiceConfig};
use crate::constants::LOG_HASH_HEADER;
use crate::errors::UploadError;
use crate::histograms::{names, HistogramFlags, Histograms};

/// Compression applied to a log body before upload.
pub trait Compressor: Send + Sync {
    /// Value of the `content-encoding` header for compressed bodies.
    fn content_encoding(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn content_encoding(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Compressor for ZstdCompressor {
    fn content_encoding(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = Encoder::new(Vec::new(), self.level)?;
        encoder.write_all(data)?;
        encoder.finish()
    }
}

pub fn compressor_for(compression: Compression) -> Box<dyn Compressor> {
    match compression {
        Compression::Gzip => Box::new(GzipCompressor),
        Compression::Zstd(level) => Box::new(ZstdCompressor::new(level)),
    }
}

/// A fully built upload, ready for a [`LogTransport`].
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Status code of a finished upload; `None` when no response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: Option<u16>,
}

/// Response classes recorded into self-telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    UnknownFailure = 0,
    Success = 1,
    BadRequest = 2,
    NoResponse = 3,
}

impl ResponseStatus {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            None => ResponseStatus::NoResponse,
            Some(200) => ResponseStatus::Success,
            Some(400) => ResponseStatus::BadRequest,
            Some(_) => ResponseStatus::UnknownFailure,
        }
    }

    /// A rejected log says nothing about the server's health.
    pub fn server_is_healthy(self) -> bool {
        matches!(self, ResponseStatus::Success | ResponseStatus::BadRequest)
    }
}

/// What happened to a staged log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Delivered,
    /// The log could not be compressed this run.
    CompressionFailure,
    /// No response or an unexpected status; the log is kept for a retry.
    TransientNetworkFailure,
    /// The collector refused the log; retrying cannot succeed.
    PermanentRejection,
    /// The log failed and is too large to be worth retransmitting.
    OversizeRejection,
}

impl UploadOutcome {
    pub fn classify(status: ResponseStatus, log_size: usize, retransmit_limit: usize) -> Self {
        match status {
            ResponseStatus::Success => UploadOutcome::Delivered,
            _ if log_size > retransmit_limit => UploadOutcome::OversizeRejection,
            ResponseStatus::BadRequest => UploadOutcome::PermanentRejection,
            ResponseStatus::NoResponse | ResponseStatus::UnknownFailure => {
                UploadOutcome::TransientNetworkFailure
            }
        }
    }

    pub fn discards_log(self) -> bool {
        !matches!(self, UploadOutcome::TransientNetworkFailure)
    }
}

/// Builds upload requests out of staged log text.
pub struct Uploader {
    server_url: String,
    mime_type: String,
    compressor: Box<dyn Compressor>,
    histograms: Histograms,
}

impl Uploader {
    pub fn new(config: &ServiceConfig, histograms: Histograms) -> Self {
        Self {
            server_url: config.server_url.clone(),
            mime_type: config.mime_type.clone(),
            compressor: compressor_for(config.compression),
            histograms,
        }
    }

    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Compresses `text` and attaches the content headers plus the SHA-1 of
    /// the uncompressed text.
    pub fn prepare(&self, text: &[u8], hash: &str) -> Result<UploadRequest, UploadError> {
        let body = self
            .compressor
            .compress(text)
            .map_err(UploadError::Compression)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&self.mime_type)?);
        headers.insert(
            CONTENT_ENCODING,
            HeaderValue::from_static(self.compressor.content_encoding()),
        );
        headers.insert(
            HeaderName::from_static(LOG_HASH_HEADER_LOWER),
            HeaderValue::from_str(hash)?,
        );

        if !text.is_empty() {
            let ratio = 100 * body.len() / text.len();
            self.histograms
                .record(names::COMPRESSION_RATIO, ratio as i64, HistogramFlags::UMA_TARGETED);
        }
        let kb_saved = text.len().saturating_sub(body.len()) / 1024;
        self.histograms.record(
            names::COMPRESSED_KB_SAVED,
            kb_saved as i64,
            HistogramFlags::UMA_TARGETED,
        );
        debug!(
            "Prepared upload of {} bytes ({} uncompressed, {})",
            body.len(),
            text.len(),
            self.compressor.content_encoding()
        );

        Ok(UploadRequest {
            url: self.server_url.clone(),
            headers,
            body,
        })
    }
}

// `HeaderName::from_static` only accepts lowercase names.
const LOG_HASH_HEADER_LOWER: &str = "x-metrics-log-sha1";

/// Delivers upload requests to the collector.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn send(&self, request: UploadRequest) -> UploadResponse;
}

/// HTTP transport. The client keeps no cookie store, so cookies are neither
/// sent nor saved.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &ServiceConfig) -> Result<Self, reqwest::Error> {
        Self::build(config.request_timeout, config.https_proxy.as_deref())
    }

    fn build(timeout: Duration, https_proxy: Option<&str>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(270)))
            .tcp_keepalive(Some(Duration::from_secs(120)));
        if let Some(proxy) = https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl LogTransport for ReqwestTransport {
    async fn send(&self, request: UploadRequest) -> UploadResponse {
        let UploadRequest {
            url,
            headers,
            body,
        } = request;

        match self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(response) => UploadResponse {
                status: Some(response.status().as_u16()),
            },
            Err(e) => {
                warn!("Failed to upload log to {}: {}", url, e);
                UploadResponse {
                    status: e.status().map(|status| status.as_u16()),
                }
            }
        }
    }
}
