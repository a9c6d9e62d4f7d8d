// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use metrics_service::{
    prefs::keys, Compression, Histograms, LocalState, MetricsServiceClient, ReportingService,
    ReqwestTransport, ServiceConfig, ServiceState, SledPrefStore,
};
use mockito::{Matcher, Server};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

struct TestClient;

#[async_trait]
impl MetricsServiceClient for TestClient {
    fn client_id(&self) -> String {
        "integration-client".to_string()
    }

    fn version_string(&self) -> String {
        "9.9.9".to_string()
    }

    async fn gather_initial_metrics(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("cpu_count".to_string(), "2".to_string())])
    }
}

fn config(server_url: String) -> ServiceConfig {
    ServiceConfig {
        server_url,
        compression: Compression::Gzip,
        initialization_delay: Duration::from_millis(50),
        initial_upload_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn start_service(config: ServiceConfig, local_state: LocalState) -> (
    tokio::task::JoinHandle<()>,
    metrics_service::ReportingHandle,
) {
    let transport = ReqwestTransport::new(&config).expect("failed to build transport");
    let (service, handle) = ReportingService::new(
        config,
        local_state,
        Arc::new(TestClient),
        Arc::new(transport),
        Histograms::new(),
    );
    (tokio::spawn(service.run()), handle)
}

#[tokio::test]
async fn reporting_service_ships_initial_metrics_log() {
    let mut mock_server = Server::new_async().await;

    let mock = mock_server
        .mock("POST", "/upload")
        .match_header("content-type", "application/vnd.metrics.log")
        .match_header("content-encoding", "gzip")
        .match_header("x-metrics-log-sha1", Matcher::Regex("^[0-9a-f]{40}$".to_string()))
        .with_status(200)
        .create_async()
        .await;

    let store = SledPrefStore::open_ephemeral().expect("failed to open store");
    let (service_task, handle) = start_service(
        config(format!("{}/upload", mock_server.url())),
        LocalState::new(Box::new(store)),
    );
    handle.start().expect("failed to start");

    let upload = async {
        while !mock.matched() {
            sleep(Duration::from_millis(50)).await;
        }
    };
    match timeout(Duration::from_secs(5), upload).await {
        Ok(_) => mock.assert(),
        Err(_) => panic!("timed out before server received the initial log"),
    }

    let settled = async {
        loop {
            let snapshot = handle.snapshot().await.expect("failed to get snapshot");
            if snapshot.state == ServiceState::SendingCurrentLogs {
                return snapshot;
            }
            sleep(Duration::from_millis(20)).await;
        }
    };
    let snapshot = timeout(Duration::from_secs(5), settled)
        .await
        .expect("timed out waiting for current logs");
    assert!(!snapshot.has_staged_log);
    assert_eq!(snapshot.initial_unsent_logs, 0);

    handle.shutdown().expect("failed to shutdown");
    service_task.await.expect("service task failed");
}

#[tokio::test]
async fn failed_upload_survives_restart() {
    let mut mock_server = Server::new_async().await;
    let mock = mock_server
        .mock("POST", "/upload")
        .with_status(500)
        .expect_at_least(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store_path = dir.path().join("local_state");
    let store = SledPrefStore::open(&store_path).expect("failed to open store");

    let (service_task, handle) = start_service(
        config(format!("{}/upload", mock_server.url())),
        LocalState::new(Box::new(store)),
    );
    handle.start().expect("failed to start");

    let upload = async {
        while !mock.matched() {
            sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(5), upload)
        .await
        .expect("timed out before server received the initial log");

    handle.stop().await.expect("failed to stop");
    handle.shutdown().expect("failed to shutdown");
    service_task.await.expect("service task failed");

    let reopened = SledPrefStore::open(&store_path).expect("failed to reopen store");
    let local_state = LocalState::new(Box::new(reopened));
    let initial_logs = local_state
        .get_list(keys::METRICS_INITIAL_LOGS)
        .expect("initial logs were not persisted");
    assert_eq!(initial_logs.len(), 1);
    let ongoing_logs = local_state
        .get_list(keys::METRICS_ONGOING_LOGS)
        .expect("ongoing logs were not persisted");
    assert_eq!(ongoing_logs.len(), 1);
}
