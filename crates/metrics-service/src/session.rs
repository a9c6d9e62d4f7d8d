// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash detection and stability bookkeeping for the current session.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::histograms::{names, HistogramFlags, Histograms};
use crate::log::StabilityReport;
use crate::prefs::{keys, LocalState};

/// Coarse checkpoints of the process lifetime. The last phase reached before a
/// crash is reported by the next session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionPhase {
    Uninitialized = 0,
    StartMetricsRecording = 100,
    CreateProfile = 200,
    StartupTimerArmed = 300,
    ThreadWatcherStart = 400,
    MainMessageLoopRun = 500,
    ShutdownTimebombArm = 600,
    ShutdownComplete = 700,
}

impl ExecutionPhase {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownStatus {
    Unknown,
    NeedToShutdown,
    CleanlyShutdown,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct SessionState {
    session_id: i64,
    execution_phase: ExecutionPhase,
    shutdown_status: ShutdownStatus,
    first_updated_time: Option<Instant>,
    last_updated_time: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            session_id: -1,
            execution_phase: ExecutionPhase::Uninitialized,
            shutdown_status: ShutdownStatus::Unknown,
            first_updated_time: None,
            last_updated_time: None,
        }
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn execution_phase(&self) -> ExecutionPhase {
        self.execution_phase
    }

    /// Inspects what the previous session left behind. Returns true when it
    /// did not exit cleanly, in which case the crash count was incremented.
    pub fn record_previous_session(
        &mut self,
        local_state: &mut LocalState,
        version: &str,
        histograms: &Histograms,
    ) -> bool {
        local_state.set_string(keys::STABILITY_STATS_VERSION, version);
        self.session_id = local_state.get_i64(keys::METRICS_SESSION_ID, -1);

        if local_state.get_bool(keys::STABILITY_EXITED_CLEANLY, true) {
            return false;
        }

        local_state.increment(keys::STABILITY_CRASH_COUNT);
        // Reset until log_need_for_clean_shutdown starts monitoring again.
        local_state.set_bool(keys::STABILITY_EXITED_CLEANLY, true);

        let phase = local_state.get_i64(keys::STABILITY_EXECUTION_PHASE, 0);
        histograms.record(names::CRASHED_EXECUTION_PHASE, phase, HistogramFlags::STABILITY);
        info!(
            "Previous session {} did not exit cleanly (execution phase {})",
            self.session_id, phase
        );
        true
    }

    /// Starts bookkeeping for this session.
    pub fn start_session(&mut self, local_state: &mut LocalState) {
        self.session_id += 1;
        local_state.set_i64(keys::METRICS_SESSION_ID, self.session_id);

        local_state.increment(keys::STABILITY_LAUNCH_COUNT);
        self.set_execution_phase(ExecutionPhase::StartMetricsRecording, local_state);

        if !local_state.get_bool(keys::STABILITY_SESSION_END_COMPLETED, true) {
            local_state.increment(keys::STABILITY_INCOMPLETE_SESSION_END_COUNT);
            local_state.set_bool(keys::STABILITY_SESSION_END_COMPLETED, true);
        }

        // The first sample only anchors later incremental uptimes.
        self.uptimes(local_state);
        local_state.set_i64(keys::STABILITY_LAUNCH_TIME_SEC, unix_now());
        local_state.increment(keys::UNINSTALL_LAUNCH_COUNT);
        debug!("Started metrics session {}", self.session_id);
    }

    /// Returns `(incremental_uptime, uptime)`: time since the previous call
    /// and time since the first call. Whole incremental seconds accumulate
    /// into the per-install uptime.
    pub fn uptimes(&mut self, local_state: &mut LocalState) -> (Duration, Duration) {
        let now = Instant::now();
        let first = *self.first_updated_time.get_or_insert(now);
        let last = self.last_updated_time.unwrap_or(now);
        self.last_updated_time = Some(now);

        let incremental = now.saturating_duration_since(last);
        let uptime = now.saturating_duration_since(first);

        let incremental_secs = incremental.as_secs() as i64;
        if incremental_secs > 0 {
            let total = local_state.get_i64(keys::UNINSTALL_METRICS_UPTIME_SEC, 0);
            local_state.set_i64(
                keys::UNINSTALL_METRICS_UPTIME_SEC,
                total.saturating_add(incremental_secs),
            );
        }
        (incremental, uptime)
    }

    /// Reads and zeroes the stability counters into a report. Counters that
    /// describe the previous session only are included in initial stability
    /// logs.
    pub fn take_stability_report(
        &self,
        local_state: &mut LocalState,
        initial_stability: bool,
        incremental_uptime: Duration,
        uptime: Duration,
    ) -> StabilityReport {
        let mut report = StabilityReport {
            launch_count: local_state.take_i64(keys::STABILITY_LAUNCH_COUNT),
            crash_count: local_state.take_i64(keys::STABILITY_CRASH_COUNT),
            incremental_uptime_sec: incremental_uptime.as_secs(),
            uptime_sec: uptime.as_secs(),
            ..Default::default()
        };
        if initial_stability {
            report.incomplete_session_end_count =
                Some(local_state.take_i64(keys::STABILITY_INCOMPLETE_SESSION_END_COUNT));
            report.breakpad_registration_success =
                Some(local_state.take_i64(keys::STABILITY_BREAKPAD_REGISTRATION_SUCCESS));
            report.breakpad_registration_fail =
                Some(local_state.take_i64(keys::STABILITY_BREAKPAD_REGISTRATION_FAIL));
            report.debugger_present = Some(local_state.take_i64(keys::STABILITY_DEBUGGER_PRESENT));
            report.debugger_not_present =
                Some(local_state.take_i64(keys::STABILITY_DEBUGGER_NOT_PRESENT));
        }
        report
    }

    pub fn set_execution_phase(&mut self, phase: ExecutionPhase, local_state: &mut LocalState) {
        self.execution_phase = phase;
        local_state.set_i64(keys::STABILITY_EXECUTION_PHASE, phase.as_i64());
        local_state.commit();
    }

    /// Marks the session as running; a crash before the next clean shutdown
    /// is detected by the next session.
    pub fn log_need_for_clean_shutdown(&mut self, local_state: &mut LocalState) {
        local_state.set_bool(keys::STABILITY_EXITED_CLEANLY, false);
        local_state.commit();
        self.shutdown_status = ShutdownStatus::NeedToShutdown;
    }

    pub fn log_clean_shutdown(&mut self, local_state: &mut LocalState) {
        self.shutdown_status = ShutdownStatus::CleanlyShutdown;
        local_state.set_bool(keys::STABILITY_EXITED_CLEANLY, true);
        local_state.set_i64(keys::STABILITY_LAST_TIMESTAMP_SEC, unix_now());
        self.execution_phase = ExecutionPhase::ShutdownComplete;
        local_state.set_i64(
            keys::STABILITY_EXECUTION_PHASE,
            ExecutionPhase::ShutdownComplete.as_i64(),
        );
        local_state.commit();
    }

    /// True once a clean shutdown was logged after the need for one.
    pub fn properly_shut_down(&self) -> bool {
        self.shutdown_status == ShutdownStatus::CleanlyShutdown
    }

    pub fn record_start_of_session_end(&mut self, local_state: &mut LocalState) {
        self.log_clean_shutdown(local_state);
        local_state.set_bool(keys::STABILITY_SESSION_END_COMPLETED, false);
        local_state.commit();
    }

    pub fn record_completed_session_end(&mut self, local_state: &mut LocalState) {
        self.log_clean_shutdown(local_state);
        local_state.set_bool(keys::STABILITY_SESSION_END_COMPLETED, true);
        local_state.commit();
    }

    pub fn record_breakpad_registration(&self, local_state: &mut LocalState, success: bool) {
        if success {
            local_state.increment(keys::STABILITY_BREAKPAD_REGISTRATION_SUCCESS);
        } else {
            local_state.increment(keys::STABILITY_BREAKPAD_REGISTRATION_FAIL);
        }
    }

    pub fn record_breakpad_has_debugger(&self, local_state: &mut LocalState, has_debugger: bool) {
        if has_debugger {
            local_state.increment(keys::STABILITY_DEBUGGER_PRESENT);
        } else {
            local_state.increment(keys::STABILITY_DEBUGGER_NOT_PRESENT);
        }
    }

    /// Periodic save keeping the last-alive timestamp fresh.
    pub fn save_local_state(&self, local_state: &mut LocalState) {
        local_state.set_i64(keys::STABILITY_LAST_TIMESTAMP_SEC, unix_now());
        local_state.commit();
    }
}

/// Returns the install's client id, creating and committing one on first use.
pub fn load_or_create_client_id(local_state: &mut LocalState) -> String {
    if let Some(client_id) = local_state.get_string(keys::METRICS_CLIENT_ID) {
        return client_id;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha1::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let mut client_id = hex::encode(hasher.finalize());
    client_id.truncate(32);

    local_state.set_string(keys::METRICS_CLIENT_ID, &client_id);
    local_state.commit();
    info!("Created client id {}", client_id);
    client_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::InMemoryPrefStore;

    fn local_state() -> (InMemoryPrefStore, LocalState) {
        let store = InMemoryPrefStore::new();
        (store.clone(), LocalState::new(Box::new(store)))
    }

    #[test]
    fn clean_previous_session_is_not_a_crash() {
        let (_, mut state) = local_state();
        let histograms = Histograms::new();
        let mut session = SessionState::new();

        assert!(!session.record_previous_session(&mut state, "1.0", &histograms));
        session.start_session(&mut state);

        assert_eq!(session.session_id(), 0);
        assert_eq!(state.get_i64(keys::STABILITY_CRASH_COUNT, 0), 0);
        assert_eq!(state.get_i64(keys::STABILITY_LAUNCH_COUNT, 0), 1);
        assert_eq!(
            state.get_i64(keys::STABILITY_EXECUTION_PHASE, 0),
            ExecutionPhase::StartMetricsRecording.as_i64()
        );
        assert_eq!(state.get_string(keys::STABILITY_STATS_VERSION).as_deref(), Some("1.0"));
    }

    #[test]
    fn unclean_exit_counts_crash_and_phase() {
        let (_, mut state) = local_state();
        let histograms = Histograms::new();
        state.set_bool(keys::STABILITY_EXITED_CLEANLY, false);
        state.set_i64(
            keys::STABILITY_EXECUTION_PHASE,
            ExecutionPhase::MainMessageLoopRun.as_i64(),
        );
        state.set_i64(keys::METRICS_SESSION_ID, 4);

        let mut session = SessionState::new();
        assert!(session.record_previous_session(&mut state, "1.0", &histograms));
        assert_eq!(state.get_i64(keys::STABILITY_CRASH_COUNT, 0), 1);
        assert!(state.get_bool(keys::STABILITY_EXITED_CLEANLY, false));
        assert_eq!(histograms.bucket_count(names::CRASHED_EXECUTION_PHASE, 500), 1);

        session.start_session(&mut state);
        assert_eq!(session.session_id(), 5);
        assert_eq!(state.get_i64(keys::METRICS_SESSION_ID, 0), 5);
    }

    #[test]
    fn incomplete_session_end_is_counted_once() {
        let (_, mut state) = local_state();
        let mut session = SessionState::new();
        session.record_start_of_session_end(&mut state);
        assert!(session.properly_shut_down());

        session.start_session(&mut state);
        assert_eq!(
            state.get_i64(keys::STABILITY_INCOMPLETE_SESSION_END_COUNT, 0),
            1
        );
        assert!(state.get_bool(keys::STABILITY_SESSION_END_COMPLETED, false));
    }

    #[test]
    fn stability_report_zeroes_counters() {
        let (_, mut state) = local_state();
        let session = SessionState::new();
        state.set_i64(keys::STABILITY_LAUNCH_COUNT, 3);
        state.set_i64(keys::STABILITY_CRASH_COUNT, 2);
        session.record_breakpad_registration(&mut state, false);
        session.record_breakpad_has_debugger(&mut state, true);

        let ongoing = session.take_stability_report(
            &mut state,
            false,
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        assert_eq!(ongoing.launch_count, 3);
        assert_eq!(ongoing.crash_count, 2);
        assert_eq!(ongoing.breakpad_registration_fail, None);

        let initial = session.take_stability_report(
            &mut state,
            true,
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(initial.launch_count, 0);
        assert_eq!(initial.breakpad_registration_fail, Some(1));
        assert_eq!(initial.debugger_present, Some(1));
        assert_eq!(initial.debugger_not_present, Some(0));
        assert_eq!(state.get_i64(keys::STABILITY_DEBUGGER_PRESENT, -1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uptimes_accumulate_whole_seconds() {
        let (_, mut state) = local_state();
        let mut session = SessionState::new();
        assert_eq!(session.uptimes(&mut state), (Duration::ZERO, Duration::ZERO));

        tokio::time::advance(Duration::from_millis(2500)).await;
        let (incremental, uptime) = session.uptimes(&mut state);
        assert_eq!(incremental, Duration::from_millis(2500));
        assert_eq!(uptime, Duration::from_millis(2500));

        tokio::time::advance(Duration::from_secs(1)).await;
        let (incremental, uptime) = session.uptimes(&mut state);
        assert_eq!(incremental, Duration::from_secs(1));
        assert_eq!(uptime, Duration::from_millis(3500));
        assert_eq!(state.get_i64(keys::UNINSTALL_METRICS_UPTIME_SEC, 0), 3);
    }

    #[test]
    fn clean_shutdown_commits_phase() {
        let (store, mut state) = local_state();
        let mut session = SessionState::new();
        session.log_need_for_clean_shutdown(&mut state);
        assert!(!state.get_bool(keys::STABILITY_EXITED_CLEANLY, true));
        assert!(!session.properly_shut_down());

        let commits = store.commit_count();
        session.log_clean_shutdown(&mut state);
        assert!(store.commit_count() > commits);
        assert!(state.get_bool(keys::STABILITY_EXITED_CLEANLY, false));
        assert_eq!(session.execution_phase(), ExecutionPhase::ShutdownComplete);
        assert_eq!(state.get_i64(keys::STABILITY_EXECUTION_PHASE, 0), 700);
    }

    #[test]
    fn client_id_is_created_once() {
        let (_, mut local_state) = local_state();
        let client_id = load_or_create_client_id(&mut local_state);
        assert_eq!(client_id.len(), 32);
        assert_eq!(load_or_create_client_id(&mut local_state), client_id);
    }
}
