// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous work started by the service.
//!
//! The coordinator never awaits. It hands [`Task`]s to a [`TaskDispatcher`]
//! and later receives the matching [`TaskOutcome`] back on its own task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::uploader::{LogTransport, UploadRequest, UploadResponse};

/// Embedder hooks used by the service.
#[async_trait]
pub trait MetricsServiceClient: Send + Sync {
    fn client_id(&self) -> String;

    fn version_string(&self) -> String;

    /// User actions are not recorded while an off-the-record session is active.
    fn is_off_the_record_session_active(&self) -> bool {
        false
    }

    /// Called after every upload the server handled.
    fn on_log_upload_complete(&self) {}

    /// Gathers slow environment facts for the initial metrics log.
    async fn gather_initial_metrics(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Gives the embedder a chance to collect data before a log is cut.
    async fn collect_final_metrics(&self) {}
}

#[derive(Debug, Clone)]
pub enum Task {
    GatherInitialMetrics { delay: Duration },
    CollectFinalMetrics,
    Upload(UploadRequest),
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    InitialMetricsGathered(BTreeMap<String, String>),
    FinalMetricsCollected,
    UploadComplete(UploadResponse),
}

/// Runs tasks off the service task.
pub trait TaskDispatcher: Send {
    fn dispatch(&mut self, task: Task);

    /// Drops every outstanding task; their outcomes are never delivered.
    fn cancel_all(&mut self);
}

/// Dispatcher spawning each task on the tokio runtime.
pub struct TokioDispatcher {
    client: Arc<dyn MetricsServiceClient>,
    transport: Arc<dyn LogTransport>,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    cancel: CancellationToken,
}

impl TokioDispatcher {
    pub fn new(
        client: Arc<dyn MetricsServiceClient>,
        transport: Arc<dyn LogTransport>,
        outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    ) -> Self {
        Self {
            client,
            transport,
            outcome_tx,
            cancel: CancellationToken::new(),
        }
    }
}

impl TaskDispatcher for TokioDispatcher {
    fn dispatch(&mut self, task: Task) {
        let client = Arc::clone(&self.client);
        let transport = Arc::clone(&self.transport);
        let outcome_tx = self.outcome_tx.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let work = async move {
                match task {
                    Task::GatherInitialMetrics { delay } => {
                        tokio::time::sleep(delay).await;
                        TaskOutcome::InitialMetricsGathered(client.gather_initial_metrics().await)
                    }
                    Task::CollectFinalMetrics => {
                        client.collect_final_metrics().await;
                        TaskOutcome::FinalMetricsCollected
                    }
                    Task::Upload(request) => {
                        TaskOutcome::UploadComplete(transport.send(request).await)
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Dropping cancelled service task");
                }
                outcome = work => {
                    // The receiver is gone once the service stopped.
                    let _ = outcome_tx.send(outcome);
                }
            }
        });
    }

    fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
    }
}

/// Dispatcher that only records tasks; outcomes are fed back by hand.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct RecordingDispatcher {
    tasks: Arc<std::sync::Mutex<Vec<Task>>>,
    cancellations: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl RecordingDispatcher {
    pub(crate) fn take_tasks(&self) -> Vec<Task> {
        std::mem::take(&mut *self.tasks.lock().unwrap())
    }

    pub(crate) fn cancellations(&self) -> usize {
        self.cancellations
            .load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl TaskDispatcher for RecordingDispatcher {
    fn dispatch(&mut self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }

    fn cancel_all(&mut self) {
        self.cancellations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    struct FactsClient;

    #[async_trait]
    impl MetricsServiceClient for FactsClient {
        fn client_id(&self) -> String {
            "client".to_string()
        }

        fn version_string(&self) -> String {
            "1.0".to_string()
        }

        async fn gather_initial_metrics(&self) -> BTreeMap<String, String> {
            BTreeMap::from([("cpu_count".to_string(), "4".to_string())])
        }
    }

    struct StatusTransport(u16);

    #[async_trait]
    impl LogTransport for StatusTransport {
        async fn send(&self, _request: UploadRequest) -> UploadResponse {
            UploadResponse {
                status: Some(self.0),
            }
        }
    }

    fn dispatcher() -> (TokioDispatcher, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TokioDispatcher::new(Arc::new(FactsClient), Arc::new(StatusTransport(200)), tx),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn gather_waits_for_delay() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.dispatch(Task::GatherInitialMetrics {
            delay: Duration::from_secs(30),
        });

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        match rx.recv().await {
            Some(TaskOutcome::InitialMetricsGathered(facts)) => {
                assert_eq!(facts.get("cpu_count").map(String::as_str), Some("4"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn upload_reports_status() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.dispatch(Task::Upload(UploadRequest {
            url: "http://localhost/".to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }));
        match rx.recv().await {
            Some(TaskOutcome::UploadComplete(response)) => {
                assert_eq!(response.status, Some(200));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_deliver_nothing() {
        let (mut dispatcher, mut rx) = dispatcher();
        dispatcher.dispatch(Task::GatherInitialMetrics {
            delay: Duration::from_secs(30),
        });
        tokio::task::yield_now().await;
        dispatcher.cancel_all();

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // Tasks dispatched after cancellation still run.
        dispatcher.dispatch(Task::CollectFinalMetrics);
        assert!(matches!(
            rx.recv().await,
            Some(TaskOutcome::FinalMetricsCollected)
        ));
    }
}
