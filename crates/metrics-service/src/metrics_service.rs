// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The coordinator driving logs from recording to upload.
//!
//! [`MetricsService`] is a synchronous state machine. It never awaits: slow
//! work goes out through the [`TaskDispatcher`] and comes back as a
//! [`TaskOutcome`] passed to [`MetricsService::handle_outcome`]. Whoever owns
//! the service (see [`crate::reporting_service`]) is the single sequence all
//! transitions happen on.
//!
//! States advance as follows, with `SendingCurrentLogs` regressing to
//! `SendingOldLogs` whenever pending logs are pushed to durable storage:
//!
//! ```text
//! Initialized -> InitTaskScheduled -> InitTaskDone
//!   -> [SendingInitialStabilityLog] -> SendingInitialMetricsLog
//!   -> SendingOldLogs -> SendingCurrentLogs
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::dispatcher::{MetricsServiceClient, Task, TaskDispatcher, TaskOutcome};
use crate::histograms::{names, HistogramFlags, HistogramSnapshotManager, Histograms};
use crate::log::{Environment, LogKind, MetricsLog};
use crate::log_store::LogStore;
use crate::persisted_logs::StoreType;
use crate::prefs::{keys, LocalState};
use crate::provider::MetricsProvider;
use crate::scheduler::UploadScheduler;
use crate::session::{ExecutionPhase, SessionState};
use crate::synthetic_trials::SyntheticTrials;
use crate::uploader::{Compressor, ResponseStatus, UploadOutcome, UploadResponse, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    /// Constructed; no log opened yet.
    Initialized,
    /// Slow initial facts are being gathered.
    InitTaskScheduled,
    /// Initial facts are in; the first upload may start.
    InitTaskDone,
    SendingInitialStabilityLog,
    SendingInitialMetricsLog,
    /// Draining logs left over from earlier sessions or pushes.
    SendingOldLogs,
    SendingCurrentLogs,
}

/// Read-only view of the service for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    pub state: ServiceState,
    pub recording_active: bool,
    pub reporting_active: bool,
    pub has_staged_log: bool,
    pub upload_in_flight: bool,
    pub initial_unsent_logs: usize,
    pub ongoing_unsent_logs: usize,
    pub session_id: i64,
    pub scheduler_running: bool,
    pub upload_interval: Duration,
}

pub struct MetricsService {
    config: ServiceConfig,
    state: ServiceState,
    local_state: LocalState,
    session: SessionState,
    log_store: LogStore,
    scheduler: UploadScheduler,
    uploader: Uploader,
    histograms: Histograms,
    snapshot_manager: HistogramSnapshotManager,
    synthetic_trials: SyntheticTrials,
    providers: Vec<Box<dyn MetricsProvider>>,
    client: Arc<dyn MetricsServiceClient>,
    dispatcher: Box<dyn TaskDispatcher>,
    client_id: String,
    recording_active: bool,
    reporting_active: bool,
    test_mode_active: bool,
    idle_since_last_transmission: bool,
    upload_in_flight: bool,
    has_initial_stability_log: bool,
    initial_metrics_log: Option<MetricsLog>,
}

impl MetricsService {
    pub fn new(
        config: ServiceConfig,
        local_state: LocalState,
        client: Arc<dyn MetricsServiceClient>,
        dispatcher: Box<dyn TaskDispatcher>,
        histograms: Histograms,
    ) -> Self {
        let client_id = client.client_id();
        Self {
            state: ServiceState::Initialized,
            local_state,
            session: SessionState::new(),
            log_store: LogStore::new(&config),
            scheduler: UploadScheduler::new(&config),
            uploader: Uploader::new(&config, histograms.clone()),
            histograms,
            snapshot_manager: HistogramSnapshotManager::new(),
            synthetic_trials: SyntheticTrials::new(),
            providers: Vec::new(),
            client,
            dispatcher,
            client_id,
            recording_active: false,
            reporting_active: false,
            test_mode_active: false,
            idle_since_last_transmission: false,
            upload_in_flight: false,
            has_initial_stability_log: false,
            initial_metrics_log: None,
            config,
        }
    }

    /// Replaces the compressor the uploader was configured with.
    pub fn with_compressor(mut self, compressor: Box<dyn Compressor>) -> Self {
        self.uploader =
            Uploader::new(&self.config, self.histograms.clone()).with_compressor(compressor);
        self
    }

    pub fn register_provider(&mut self, provider: Box<dyn MetricsProvider>) {
        if self.state != ServiceState::Initialized {
            warn!("Provider registered after the first log was opened");
        }
        self.providers.push(provider);
    }

    /// Reads what the previous session left behind and starts this one.
    /// Prepares the initial stability log when the previous session crashed.
    pub fn initialize(&mut self) {
        let version = self.client.version_string();
        let crashed =
            self.session
                .record_previous_session(&mut self.local_state, &version, &self.histograms);
        if crashed && self.config.reporting_enabled {
            self.prepare_initial_stability_log();
        }
        self.session.start_session(&mut self.local_state);
        self.local_state.commit();
    }

    pub fn start(&mut self) {
        self.handle_idle(false);
        self.enable_recording();
        self.enable_reporting();
    }

    /// Stops reporting and recording. Every pending log is in durable storage
    /// on return.
    pub fn stop(&mut self) {
        self.handle_idle(false);
        self.disable_reporting();
        self.disable_recording();
    }

    pub fn start_if_reporting_enabled(&mut self) -> bool {
        if self.config.reporting_enabled {
            self.start();
        }
        self.config.reporting_enabled
    }

    /// Records logs without ever scheduling an upload.
    pub fn start_recording_for_tests(&mut self) {
        self.test_mode_active = true;
        self.enable_recording();
        self.disable_reporting();
    }

    fn enable_recording(&mut self) {
        if self.recording_active {
            return;
        }
        self.recording_active = true;
        self.client_id = self.client.client_id();
        if self.log_store.current_log().is_none() {
            self.open_new_log();
        }
        for provider in self.providers.iter_mut() {
            provider.on_recording_enabled();
        }
        debug!("Recording enabled");
    }

    fn disable_recording(&mut self) {
        if !self.recording_active {
            return;
        }
        self.recording_active = false;
        for provider in self.providers.iter_mut() {
            provider.on_recording_disabled();
        }
        self.push_pending_logs_to_persistent_storage();
        debug!("Recording disabled");
    }

    fn enable_reporting(&mut self) {
        if self.reporting_active {
            return;
        }
        self.reporting_active = true;
        self.start_scheduler_if_necessary();
    }

    fn disable_reporting(&mut self) {
        self.reporting_active = false;
    }

    fn start_scheduler_if_necessary(&mut self) {
        if self.test_mode_active {
            return;
        }
        // The initial logs are composed even with reporting off so the
        // unsent queues get loaded.
        if self.recording_active
            && (self.reporting_active || self.state < ServiceState::SendingInitialStabilityLog)
        {
            self.scheduler.start();
        }
    }

    fn handle_idle(&mut self, in_idle: bool) {
        if !in_idle && self.idle_since_last_transmission {
            self.start_scheduler_if_necessary();
        }
        self.idle_since_last_transmission = in_idle;
    }

    pub fn on_application_not_idle(&mut self) {
        if self.recording_active {
            self.handle_idle(false);
        }
    }

    pub fn record_user_action(&mut self, name: &str) {
        if !self.recording_active || self.client.is_off_the_record_session_active() {
            return;
        }
        if let Some(log) = self.log_store.current_log_mut() {
            log.record_user_action(name);
        }
        self.handle_idle(false);
    }

    pub fn register_synthetic_trial(&mut self, name: &str, group: &str) {
        self.synthetic_trials.register(name, group);
    }

    pub fn histograms(&self) -> &Histograms {
        &self.histograms
    }

    /// Instant at which the scheduler wants [`Self::on_scheduler_timer_fired`].
    pub fn scheduler_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    pub fn on_scheduler_timer_fired(&mut self) {
        if self.scheduler.on_timer_fired() {
            self.start_scheduled_upload();
        }
    }

    pub fn handle_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::InitialMetricsGathered(facts) => self.on_initial_metrics_gathered(facts),
            TaskOutcome::FinalMetricsCollected => self.on_final_metrics_collected(),
            TaskOutcome::UploadComplete(response) => self.on_upload_complete(response),
        }
    }

    fn open_new_log(&mut self) {
        let log = MetricsLog::new(LogKind::Ongoing, &self.client_id, self.session.session_id());
        if let Err(e) = self.log_store.begin_logging_with_log(log) {
            error!("Failed to open a new log: {}", e);
            return;
        }
        for provider in self.providers.iter_mut() {
            provider.on_log_created();
        }

        if self.state == ServiceState::Initialized {
            self.state = ServiceState::InitTaskScheduled;
            self.dispatcher.dispatch(Task::GatherInitialMetrics {
                delay: self.config.initialization_delay,
            });
        }
    }

    fn on_initial_metrics_gathered(&mut self, facts: BTreeMap<String, String>) {
        if self.state != ServiceState::InitTaskScheduled {
            warn!("Initial metrics gathered in state {:?}", self.state);
            return;
        }
        let mut log = MetricsLog::new(
            LogKind::InitialMetrics,
            &self.client_id,
            self.session.session_id(),
        );
        for provider in self.providers.iter_mut() {
            provider.on_log_created();
        }
        log.record_deferred_facts(facts);
        self.initial_metrics_log = Some(log);

        self.state = ServiceState::InitTaskDone;
        debug!("Init task done");
        if self.scheduler.init_task_complete() {
            self.start_scheduled_upload();
        }
    }

    fn start_scheduled_upload(&mut self) {
        if self.idle_since_last_transmission
            || !self.recording_active
            || (!self.reporting_active && self.state >= ServiceState::SendingInitialStabilityLog)
        {
            debug!(
                "Skipping upload (idle: {}, recording: {}, reporting: {})",
                self.idle_since_last_transmission, self.recording_active, self.reporting_active
            );
            self.scheduler.stop();
            self.scheduler.upload_cancelled();
            return;
        }

        if self.state == ServiceState::SendingOldLogs
            && !self.log_store.has_staged_log()
            && !self.log_store.has_unsent_logs()
        {
            self.state = ServiceState::SendingCurrentLogs;
            self.scheduler.upload_finished(true, false);
            return;
        }

        if self.state > ServiceState::InitTaskDone
            && (self.log_store.has_staged_log() || self.log_store.has_unsent_logs())
        {
            self.log_store.stage_next_log_for_upload();
            if !self.send_staged_log() {
                self.scheduler.upload_cancelled();
            }
            return;
        }

        self.dispatcher.dispatch(Task::CollectFinalMetrics);
    }

    fn on_final_metrics_collected(&mut self) {
        if self.upload_in_flight {
            return;
        }
        if !self.recording_active {
            self.scheduler.stop();
            self.scheduler.upload_cancelled();
            return;
        }

        // Pending logs may have been pushed while final metrics were collected.
        if self.state == ServiceState::SendingOldLogs {
            self.log_store.stage_next_log_for_upload();
        } else {
            self.stage_new_log();
        }

        if !self.reporting_active {
            self.scheduler.stop();
            self.scheduler.upload_cancelled();
            return;
        }
        if !self.send_staged_log() {
            self.scheduler.upload_cancelled();
        }
    }

    fn stage_new_log(&mut self) {
        if self.log_store.has_staged_log() {
            return;
        }

        match self.state {
            ServiceState::Initialized
            | ServiceState::InitTaskScheduled
            | ServiceState::SendingOldLogs => {
                unreachable!("cannot stage a new log in state {:?}", self.state)
            }
            ServiceState::InitTaskDone => {
                if self.has_initial_stability_log {
                    self.log_store.stage_next_log_for_upload();
                    self.has_initial_stability_log = false;
                    self.state = ServiceState::SendingInitialStabilityLog;
                } else {
                    self.prepare_initial_metrics_log();
                    self.load_persisted_unsent_logs();
                    self.state = ServiceState::SendingInitialMetricsLog;
                }
            }
            ServiceState::SendingInitialStabilityLog
            | ServiceState::SendingInitialMetricsLog
            | ServiceState::SendingCurrentLogs => {
                self.close_current_log();
                self.open_new_log();
                self.log_store.stage_next_log_for_upload();
            }
        }
    }

    /// Starts the upload of the staged log. Returns whether an upload is in
    /// flight afterwards.
    fn send_staged_log(&mut self) -> bool {
        let prepared = match (
            self.log_store.staged_log_text(),
            self.log_store.staged_log_hash(),
        ) {
            (Some(text), Some(hash)) => self.uploader.prepare(text, hash),
            _ => return self.upload_in_flight,
        };

        match prepared {
            Ok(request) => {
                self.histograms
                    .record(names::UPLOAD_CREATION, 1, HistogramFlags::UMA_TARGETED);
                self.upload_in_flight = true;
                self.dispatcher.dispatch(Task::Upload(request));
                self.handle_idle(true);
            }
            Err(e) => {
                warn!(
                    "Discarding staged log of {} bytes that cannot be uploaded: {}",
                    self.log_store.staged_log_len(),
                    e
                );
                self.histograms
                    .record(names::UPLOAD_CREATION, 0, HistogramFlags::UMA_TARGETED);
                self.log_store.discard_staged_log();
                self.advance_after_staged_log_removed();
            }
        }
        self.upload_in_flight
    }

    fn on_upload_complete(&mut self, response: UploadResponse) {
        if !self.upload_in_flight {
            warn!("Upload completed while none was in flight");
            return;
        }
        self.upload_in_flight = false;

        let status = ResponseStatus::from_code(response.status);
        self.histograms.record(
            names::UPLOAD_RESPONSE_STATUS,
            status as i64,
            HistogramFlags::UMA_TARGETED,
        );
        let server_is_healthy = status.server_is_healthy();
        let mut retry_initial_stability_log = false;

        if self.log_store.has_staged_log() {
            let log_size = self.log_store.staged_log_len();
            let outcome =
                UploadOutcome::classify(status, log_size, self.config.upload_log_avoid_retransmit_size);
            if outcome == UploadOutcome::OversizeRejection {
                self.histograms.record(
                    names::LARGE_REJECTED_LOG_DISCARDED,
                    (log_size / 1024) as i64,
                    HistogramFlags::UMA_TARGETED,
                );
            }
            info!(
                "Upload of {} byte log finished with {:?} ({:?})",
                log_size, response.status, outcome
            );
            // Any provisional store belongs to an earlier, already resolved log.
            self.log_store.keep_last_provisional_store();
            if outcome.discards_log() {
                self.log_store.discard_staged_log();
            } else {
                self.log_store.store_staged_log_as_unsent(StoreType::Normal);
                retry_initial_stability_log =
                    self.state == ServiceState::SendingInitialStabilityLog;
            }
        } else {
            // The log was pushed to storage while its upload was in flight.
            info!(
                "Upload of provisionally stored log finished with {:?}",
                response.status
            );
            match status {
                ResponseStatus::Success | ResponseStatus::BadRequest => {
                    self.log_store.discard_last_provisional_store()
                }
                _ => self.log_store.keep_last_provisional_store(),
            }
        }

        if retry_initial_stability_log {
            // The initial metrics log waits until the stability log is delivered.
            self.persist_unsent_logs();
        } else {
            self.advance_after_staged_log_removed();
        }

        // Initial stability and initial metrics uploads are one unit of work.
        if !self.upload_in_flight {
            self.scheduler
                .upload_finished(server_is_healthy, self.log_store.has_unsent_logs());
        }
        if server_is_healthy {
            self.client.on_log_upload_complete();
        }
    }

    fn advance_after_staged_log_removed(&mut self) {
        match self.state {
            ServiceState::SendingInitialStabilityLog => {
                self.persist_unsent_logs();
                self.state = ServiceState::SendingInitialMetricsLog;
                self.prepare_initial_metrics_log();
                self.send_staged_log();
            }
            ServiceState::SendingInitialMetricsLog => {
                self.state = if self.log_store.has_unsent_logs() {
                    ServiceState::SendingOldLogs
                } else {
                    ServiceState::SendingCurrentLogs
                };
            }
            ServiceState::SendingOldLogs => {
                self.persist_unsent_logs();
                if !self.log_store.has_unsent_logs() {
                    self.state = ServiceState::SendingCurrentLogs;
                }
            }
            ServiceState::SendingCurrentLogs => {}
            state => warn!("Staged log removed in state {:?}", state),
        }
        debug!("Service state is now {:?}", self.state);
    }

    fn prepare_initial_stability_log(&mut self) {
        let Some(environment) = Environment::load_saved(&self.local_state) else {
            info!("No usable saved environment; skipping the initial stability log");
            return;
        };
        let mut log = MetricsLog::new(
            LogKind::InitialStability,
            &self.client_id,
            self.session.session_id(),
        );
        log.record_environment(environment);

        self.load_persisted_unsent_logs();

        self.log_store.pause_current_log();
        if let Err(e) = self.log_store.begin_logging_with_log(log) {
            error!("Failed to begin the initial stability log: {}", e);
            self.log_store.resume_paused_log();
            return;
        }
        self.record_stability_metrics(true, Duration::ZERO, Duration::ZERO);
        self.record_histograms(HistogramFlags::STABILITY);
        self.finish_current_log();
        self.log_store.resume_paused_log();

        self.persist_unsent_logs();
        self.has_initial_stability_log = true;
        info!("Prepared the initial stability log of the previous session");
    }

    fn prepare_initial_metrics_log(&mut self) {
        let log = self.initial_metrics_log.take().unwrap_or_else(|| {
            MetricsLog::new(
                LogKind::InitialMetrics,
                &self.client_id,
                self.session.session_id(),
            )
        });
        // Moves the uptime anchor; the initial log reports zero uptimes.
        self.session.uptimes(&mut self.local_state);

        self.log_store.pause_current_log();
        if let Err(e) = self.log_store.begin_logging_with_log(log) {
            error!("Failed to begin the initial metrics log: {}", e);
            self.log_store.resume_paused_log();
            return;
        }
        self.record_environment();
        self.record_stability_metrics(false, Duration::ZERO, Duration::ZERO);
        self.record_histograms(HistogramFlags::UMA_TARGETED);
        self.record_general_metrics();
        self.finish_current_log();
        self.log_store.resume_paused_log();

        self.log_store.stage_next_log_for_upload();
    }

    fn close_current_log(&mut self) {
        if self.log_store.current_log().is_none() {
            return;
        }
        self.record_environment();
        let (incremental_uptime, uptime) = self.session.uptimes(&mut self.local_state);
        self.record_stability_metrics(false, incremental_uptime, uptime);
        self.record_histograms(HistogramFlags::UMA_TARGETED);
        self.record_general_metrics();
        self.finish_current_log();
    }

    fn finish_current_log(&mut self) {
        match self.log_store.finish_current_log() {
            Ok(0) => {}
            Ok(discarded) => self.histograms.record(
                names::DISCARDED_LOG_EVENTS,
                discarded as i64,
                HistogramFlags::UMA_TARGETED,
            ),
            Err(e) => error!("Failed to finish the current log: {}", e),
        }
    }

    /// Writes pending logs to durable storage. Afterwards the next uploads
    /// drain the unsent queues first.
    fn push_pending_logs_to_persistent_storage(&mut self) {
        if self.state < ServiceState::SendingInitialStabilityLog {
            return;
        }
        if self.log_store.has_staged_log() {
            let store_type = if self.upload_in_flight {
                StoreType::Provisional
            } else {
                StoreType::Normal
            };
            self.log_store.store_staged_log_as_unsent(store_type);
        }
        self.close_current_log();
        self.persist_unsent_logs();

        if self.log_store.has_unsent_logs() {
            self.state = ServiceState::SendingOldLogs;
        }
    }

    fn persist_unsent_logs(&mut self) {
        let dropped = self.log_store.persist_unsent_logs(&mut self.local_state);
        if dropped > 0 {
            self.histograms.record_count(
                names::LARGE_LOG_NOT_PERSISTED,
                1,
                dropped as u64,
                HistogramFlags::UMA_TARGETED,
            );
        }
        self.local_state.commit();
    }

    fn load_persisted_unsent_logs(&mut self) {
        let (initial, ongoing) = self.log_store.load_persisted_unsent_logs(&self.local_state);
        for status in [initial, ongoing] {
            self.histograms.record(
                names::UNSENT_LOGS_READ_STATUS,
                status.code(),
                HistogramFlags::UMA_TARGETED,
            );
        }
    }

    fn record_environment(&mut self) {
        let Some(log) = self.log_store.current_log_mut() else {
            return;
        };
        let mut environment = Environment::default();
        environment.set("client_version", self.client.version_string());
        environment.synthetic_trials = self.synthetic_trials.active_groups(log.creation_time());
        for provider in self.providers.iter_mut() {
            provider.provide_environment(&mut environment);
        }

        if let Err(e) = environment.save(&mut self.local_state) {
            warn!("Failed to save the environment: {}", e);
        }
        log.record_environment(environment);
    }

    fn record_stability_metrics(
        &mut self,
        initial_stability: bool,
        incremental_uptime: Duration,
        uptime: Duration,
    ) {
        let report = self.session.take_stability_report(
            &mut self.local_state,
            initial_stability,
            incremental_uptime,
            uptime,
        );
        let Some(log) = self.log_store.current_log_mut() else {
            return;
        };
        log.record_stability(report);
        for provider in self.providers.iter_mut() {
            provider.provide_stability_metrics(log, incremental_uptime, uptime);
        }
    }

    fn record_histograms(&mut self, required: HistogramFlags) {
        let deltas = self
            .snapshot_manager
            .prepare_deltas(&self.histograms, required);
        if let Some(log) = self.log_store.current_log_mut() {
            log.record_histogram_deltas(deltas);
        }
    }

    fn record_general_metrics(&mut self) {
        let Some(log) = self.log_store.current_log_mut() else {
            return;
        };
        log.set_general_metric(
            "install_uptime_sec",
            self.local_state
                .get_i64(keys::UNINSTALL_METRICS_UPTIME_SEC, 0),
        );
        for provider in self.providers.iter_mut() {
            provider.provide_general_metrics(log);
        }
    }

    /// The process may be killed while in the background; everything pending
    /// is persisted and the session is marked clean until foregrounded.
    pub fn on_app_enter_background(&mut self) {
        self.scheduler.stop();
        self.local_state
            .set_bool(keys::STABILITY_EXITED_CLEANLY, true);
        self.local_state.commit();

        if self.recording_active && self.state >= ServiceState::SendingInitialStabilityLog {
            self.push_pending_logs_to_persistent_storage();
            self.open_new_log();
        }
    }

    pub fn on_app_enter_foreground(&mut self) {
        self.local_state
            .set_bool(keys::STABILITY_EXITED_CLEANLY, false);
        self.local_state.commit();
        self.start_scheduler_if_necessary();
    }

    pub fn set_execution_phase(&mut self, phase: ExecutionPhase) {
        self.session.set_execution_phase(phase, &mut self.local_state);
    }

    pub fn log_need_for_clean_shutdown(&mut self) {
        self.session.log_need_for_clean_shutdown(&mut self.local_state);
    }

    pub fn log_clean_shutdown(&mut self) {
        self.session.log_clean_shutdown(&mut self.local_state);
    }

    pub fn record_start_of_session_end(&mut self) {
        self.session.record_start_of_session_end(&mut self.local_state);
    }

    pub fn record_completed_session_end(&mut self) {
        self.session.record_completed_session_end(&mut self.local_state);
    }

    pub fn record_breakpad_registration(&mut self, success: bool) {
        self.session
            .record_breakpad_registration(&mut self.local_state, success);
    }

    pub fn record_breakpad_has_debugger(&mut self, has_debugger: bool) {
        self.session
            .record_breakpad_has_debugger(&mut self.local_state, has_debugger);
    }

    pub fn save_local_state(&mut self) {
        self.session.save_local_state(&mut self.local_state);
    }

    pub fn properly_shut_down(&self) -> bool {
        self.session.properly_shut_down()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            state: self.state,
            recording_active: self.recording_active,
            reporting_active: self.reporting_active,
            has_staged_log: self.log_store.has_staged_log(),
            upload_in_flight: self.upload_in_flight,
            initial_unsent_logs: self.log_store.unsent_initial_log_count(),
            ongoing_unsent_logs: self.log_store.unsent_ongoing_log_count(),
            session_id: self.session.session_id(),
            scheduler_running: self.scheduler.is_running(),
            upload_interval: self.scheduler.upload_interval(),
        }
    }

    /// Cancels outstanding tasks and flushes local state.
    pub fn teardown(&mut self) {
        self.dispatcher.cancel_all();
        self.scheduler.stop();
        self.local_state.commit();
        debug!("Metrics service torn down in state {:?}", self.state);
    }
}
