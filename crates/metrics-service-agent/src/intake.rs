// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP intake for embedders that report activity from other processes.
//!
//! Each datagram holds newline separated messages:
//!
//! ```text
//! action:<name>
//! hist:<name>:<value>
//! trial:<name>:<group>
//! ```

use std::net::SocketAddr;

use metrics_service::{HistogramFlags, Histograms, ReportingHandle};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeMessage {
    UserAction(String),
    Histogram { name: String, sample: i64 },
    SyntheticTrial { name: String, group: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

pub fn parse(message: &str) -> Result<IntakeMessage, ParseError> {
    let message = message.trim();
    let (kind, rest) = message
        .split_once(':')
        .ok_or_else(|| ParseError::Malformed(message.to_string()))?;

    match kind {
        "action" if !rest.is_empty() => Ok(IntakeMessage::UserAction(rest.to_string())),
        "hist" => {
            let (name, sample) = rest
                .rsplit_once(':')
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| ParseError::Malformed(message.to_string()))?;
            let sample = sample
                .parse::<i64>()
                .map_err(|_| ParseError::Malformed(message.to_string()))?;
            Ok(IntakeMessage::Histogram {
                name: name.to_string(),
                sample,
            })
        }
        "trial" => {
            let (name, group) = rest
                .split_once(':')
                .filter(|(name, group)| !name.is_empty() && !group.is_empty())
                .ok_or_else(|| ParseError::Malformed(message.to_string()))?;
            Ok(IntakeMessage::SyntheticTrial {
                name: name.to_string(),
                group: group.to_string(),
            })
        }
        "action" => Err(ParseError::Malformed(message.to_string())),
        other => Err(ParseError::UnknownType(other.to_string())),
    }
}

pub struct Intake {
    socket: UdpSocket,
    handle: ReportingHandle,
    histograms: Histograms,
    cancel_token: CancellationToken,
}

impl Intake {
    pub async fn bind(
        addr: &str,
        handle: ReportingHandle,
        histograms: Histograms,
        cancel_token: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            handle,
            histograms,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn spin(self) {
        let mut buf = [0; BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Intake cancelled");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((amt, src)) => self.consume(&buf[..amt], src),
                    Err(e) => error!("Failed to receive intake datagram: {}", e),
                }
            }
        }
    }

    fn consume(&self, buf: &[u8], src: SocketAddr) {
        let messages = String::from_utf8_lossy(buf);
        trace!("Received intake message: {} from {}", messages, src);

        for message in messages.split('\n').filter(|m| !m.trim().is_empty()) {
            match parse(message) {
                Ok(message) => self.apply(message),
                Err(e) => error!("Failed to parse intake message from {}: {}", src, e),
            }
        }
    }

    fn apply(&self, message: IntakeMessage) {
        let sent = match message {
            IntakeMessage::UserAction(name) => self.handle.record_user_action(name),
            IntakeMessage::Histogram { name, sample } => {
                self.histograms
                    .record(&name, sample, HistogramFlags::UMA_TARGETED);
                Ok(())
            }
            IntakeMessage::SyntheticTrial { name, group } => {
                self.handle.register_synthetic_trial(name, group)
            }
        };
        if let Err(e) = sent {
            error!("Failed to forward intake message: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metrics_service::{
        InMemoryPrefStore, LocalState, LogTransport, MetricsServiceClient, ReportingService,
        ServiceConfig, UploadRequest, UploadResponse,
    };
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    struct NoopClient;

    #[async_trait]
    impl MetricsServiceClient for NoopClient {
        fn client_id(&self) -> String {
            "client".to_string()
        }

        fn version_string(&self) -> String {
            "0".to_string()
        }
    }

    struct NoopTransport;

    #[async_trait]
    impl LogTransport for NoopTransport {
        async fn send(&self, _request: UploadRequest) -> UploadResponse {
            UploadResponse { status: Some(200) }
        }
    }

    #[test]
    fn test_parse_messages() {
        assert_eq!(
            parse("action:Reload"),
            Ok(IntakeMessage::UserAction("Reload".to_string()))
        );
        assert_eq!(
            parse("hist:Net.Latency:-12\r"),
            Ok(IntakeMessage::Histogram {
                name: "Net.Latency".to_string(),
                sample: -12
            })
        );
        assert_eq!(
            parse("trial:Fast:Enabled"),
            Ok(IntakeMessage::SyntheticTrial {
                name: "Fast".to_string(),
                group: "Enabled".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejects_malformed_messages() {
        assert!(matches!(parse("action:"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("hist:Latency:abc"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("hist::3"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("trial:Fast"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse("noseparator"), Err(ParseError::Malformed(_))));
        assert_eq!(
            parse("gauge:x:1"),
            Err(ParseError::UnknownType("gauge".to_string()))
        );
    }

    #[tokio::test]
    async fn test_intake_records_histograms() {
        let histograms = Histograms::new();
        // The service is never run; commands only queue up.
        let (_service, handle) = ReportingService::new(
            ServiceConfig::default(),
            LocalState::new(Box::new(InMemoryPrefStore::new())),
            Arc::new(NoopClient),
            Arc::new(NoopTransport),
            histograms.clone(),
        );
        let cancel_token = CancellationToken::new();
        let intake = Intake::bind("127.0.0.1:0", handle, histograms.clone(), cancel_token.clone())
            .await
            .expect("unable to bind intake");
        let addr = intake.local_addr().expect("no local address");
        let intake_task = tokio::spawn(intake.spin());

        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("unable to bind UDP socket");
        socket
            .send_to(b"hist:Startup.Time:40\nbogus\naction:Reload\nhist:Startup.Time:40", addr)
            .await
            .expect("unable to send message");

        let recorded = async {
            while histograms.bucket_count("Startup.Time", 40) < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(2), recorded)
            .await
            .expect("timed out waiting for histogram samples");

        cancel_token.cancel();
        intake_task.await.expect("intake task failed");
    }
}
