// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::config::ServiceConfig;
use crate::dispatcher::{MetricsServiceClient, TaskOutcome, TokioDispatcher};
use crate::errors::ServiceError;
use crate::histograms::Histograms;
use crate::metrics_service::{MetricsService, ServiceSnapshot};
use crate::prefs::LocalState;
use crate::provider::MetricsProvider;
use crate::session::ExecutionPhase;
use crate::uploader::LogTransport;

#[derive(Debug)]
pub enum ReportingCommand {
    Start,
    Stop(oneshot::Sender<()>),
    StartRecordingForTests,
    RecordUserAction(String),
    RegisterSyntheticTrial { name: String, group: String },
    ApplicationNotIdle,
    EnterBackground,
    EnterForeground,
    SetExecutionPhase(ExecutionPhase),
    LogNeedForCleanShutdown,
    LogCleanShutdown(oneshot::Sender<()>),
    RecordStartOfSessionEnd,
    RecordCompletedSessionEnd,
    RecordBreakpadRegistration(bool),
    RecordBreakpadHasDebugger(bool),
    Snapshot(oneshot::Sender<ServiceSnapshot>),
    Shutdown,
}

#[derive(Clone)]
pub struct ReportingHandle {
    tx: mpsc::UnboundedSender<ReportingCommand>,
}

type SendResult = Result<(), mpsc::error::SendError<ReportingCommand>>;

impl ReportingHandle {
    pub fn start(&self) -> SendResult {
        self.tx.send(ReportingCommand::Start)
    }

    /// Stops reporting and recording; returns once pending logs are persisted.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ReportingCommand::Stop(response_tx))
            .map_err(|e| ServiceError::ChannelClosed(format!("Failed to send stop command: {}", e)))?;

        response_rx
            .await
            .map_err(|e| ServiceError::ChannelClosed(format!("Failed to receive stop response: {}", e)))
    }

    pub fn start_recording_for_tests(&self) -> SendResult {
        self.tx.send(ReportingCommand::StartRecordingForTests)
    }

    pub fn record_user_action(&self, name: impl Into<String>) -> SendResult {
        self.tx.send(ReportingCommand::RecordUserAction(name.into()))
    }

    pub fn register_synthetic_trial(
        &self,
        name: impl Into<String>,
        group: impl Into<String>,
    ) -> SendResult {
        self.tx.send(ReportingCommand::RegisterSyntheticTrial {
            name: name.into(),
            group: group.into(),
        })
    }

    pub fn on_application_not_idle(&self) -> SendResult {
        self.tx.send(ReportingCommand::ApplicationNotIdle)
    }

    pub fn on_app_enter_background(&self) -> SendResult {
        self.tx.send(ReportingCommand::EnterBackground)
    }

    pub fn on_app_enter_foreground(&self) -> SendResult {
        self.tx.send(ReportingCommand::EnterForeground)
    }

    pub fn set_execution_phase(&self, phase: ExecutionPhase) -> SendResult {
        self.tx.send(ReportingCommand::SetExecutionPhase(phase))
    }

    pub fn log_need_for_clean_shutdown(&self) -> SendResult {
        self.tx.send(ReportingCommand::LogNeedForCleanShutdown)
    }

    /// Marks the session as cleanly shut down; returns once committed.
    pub async fn log_clean_shutdown(&self) -> Result<(), ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ReportingCommand::LogCleanShutdown(response_tx))
            .map_err(|e| {
                ServiceError::ChannelClosed(format!("Failed to send clean shutdown command: {}", e))
            })?;

        response_rx.await.map_err(|e| {
            ServiceError::ChannelClosed(format!("Failed to receive clean shutdown response: {}", e))
        })
    }

    pub fn record_start_of_session_end(&self) -> SendResult {
        self.tx.send(ReportingCommand::RecordStartOfSessionEnd)
    }

    pub fn record_completed_session_end(&self) -> SendResult {
        self.tx.send(ReportingCommand::RecordCompletedSessionEnd)
    }

    pub fn record_breakpad_registration(&self, success: bool) -> SendResult {
        self.tx
            .send(ReportingCommand::RecordBreakpadRegistration(success))
    }

    pub fn record_breakpad_has_debugger(&self, has_debugger: bool) -> SendResult {
        self.tx
            .send(ReportingCommand::RecordBreakpadHasDebugger(has_debugger))
    }

    pub async fn snapshot(&self) -> Result<ServiceSnapshot, ServiceError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ReportingCommand::Snapshot(response_tx))
            .map_err(|e| {
                ServiceError::ChannelClosed(format!("Failed to send snapshot command: {}", e))
            })?;

        response_rx.await.map_err(|e| {
            ServiceError::ChannelClosed(format!("Failed to receive snapshot response: {}", e))
        })
    }

    pub fn shutdown(&self) -> SendResult {
        self.tx.send(ReportingCommand::Shutdown)
    }
}

/// Task owning the [`MetricsService`]. Commands, task outcomes, the upload
/// timer and the periodic state save are all handled on this one task.
pub struct ReportingService {
    service: MetricsService,
    rx: mpsc::UnboundedReceiver<ReportingCommand>,
    outcome_rx: mpsc::UnboundedReceiver<TaskOutcome>,
    save_state_interval: std::time::Duration,
}

impl ReportingService {
    pub fn new(
        config: ServiceConfig,
        local_state: LocalState,
        client: Arc<dyn MetricsServiceClient>,
        transport: Arc<dyn LogTransport>,
        histograms: Histograms,
    ) -> (Self, ReportingHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let dispatcher = TokioDispatcher::new(Arc::clone(&client), transport, outcome_tx);
        let save_state_interval = config.save_state_interval;
        let service = MetricsService::new(
            config,
            local_state,
            client,
            Box::new(dispatcher),
            histograms,
        );

        let service = Self {
            service,
            rx,
            outcome_rx,
            save_state_interval,
        };

        let handle = ReportingHandle { tx };

        (service, handle)
    }

    /// Registers a provider; must happen before [`Self::run`].
    pub fn register_provider(&mut self, provider: Box<dyn MetricsProvider>) {
        self.service.register_provider(provider);
    }

    pub async fn run(mut self) {
        debug!("Reporting service started");
        self.service.initialize();

        let mut save_state = tokio::time::interval_at(
            Instant::now() + self.save_state_interval,
            self.save_state_interval,
        );
        save_state.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.service.scheduler_deadline();
            tokio::select! {
                biased;

                command = self.rx.recv() => {
                    match command {
                        Some(ReportingCommand::Shutdown) | None => {
                            debug!("Reporting service shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }

                Some(outcome) = self.outcome_rx.recv() => {
                    self.service.handle_outcome(outcome);
                }

                _ = sleep_until_deadline(deadline) => {
                    self.service.on_scheduler_timer_fired();
                }

                _ = save_state.tick() => {
                    self.service.save_local_state();
                }
            }
        }

        self.service.teardown();
        debug!("Reporting service stopped");
    }

    fn handle_command(&mut self, command: ReportingCommand) {
        match command {
            ReportingCommand::Start => self.service.start(),
            ReportingCommand::Stop(response_tx) => {
                self.service.stop();
                if response_tx.send(()).is_err() {
                    error!("Failed to send stop response - receiver dropped");
                }
            }
            ReportingCommand::StartRecordingForTests => self.service.start_recording_for_tests(),
            ReportingCommand::RecordUserAction(name) => self.service.record_user_action(&name),
            ReportingCommand::RegisterSyntheticTrial { name, group } => {
                self.service.register_synthetic_trial(&name, &group)
            }
            ReportingCommand::ApplicationNotIdle => self.service.on_application_not_idle(),
            ReportingCommand::EnterBackground => self.service.on_app_enter_background(),
            ReportingCommand::EnterForeground => self.service.on_app_enter_foreground(),
            ReportingCommand::SetExecutionPhase(phase) => self.service.set_execution_phase(phase),
            ReportingCommand::LogNeedForCleanShutdown => self.service.log_need_for_clean_shutdown(),
            ReportingCommand::LogCleanShutdown(response_tx) => {
                self.service.log_clean_shutdown();
                if response_tx.send(()).is_err() {
                    error!("Failed to send clean shutdown response - receiver dropped");
                }
            }
            ReportingCommand::RecordStartOfSessionEnd => self.service.record_start_of_session_end(),
            ReportingCommand::RecordCompletedSessionEnd => {
                self.service.record_completed_session_end()
            }
            ReportingCommand::RecordBreakpadRegistration(success) => {
                self.service.record_breakpad_registration(success)
            }
            ReportingCommand::RecordBreakpadHasDebugger(has_debugger) => {
                self.service.record_breakpad_has_debugger(has_debugger)
            }
            ReportingCommand::Snapshot(response_tx) => {
                if response_tx.send(self.service.snapshot()).is_err() {
                    error!("Failed to send snapshot response - receiver dropped");
                }
            }
            // Handled by the run loop.
            ReportingCommand::Shutdown => {}
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
