// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::histograms::HistogramDelta;
use crate::prefs::{keys, LocalState};
use crate::synthetic_trials::ActiveTrial;

/// Role of a log in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Ongoing,
    InitialStability,
    InitialMetrics,
}

impl LogKind {
    /// Initial logs are queued and persisted separately from ongoing logs.
    pub fn is_initial(self) -> bool {
        !matches!(self, LogKind::Ongoing)
    }
}

/// A user action recorded while the log was current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserActionEvent {
    pub name: String,
    /// Milliseconds since the log was created.
    pub offset_ms: u64,
}

/// Stability counters and uptimes attached to a log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StabilityReport {
    pub launch_count: i64,
    pub crash_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incomplete_session_end_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpad_registration_success: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpad_registration_fail: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debugger_present: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debugger_not_present: Option<i64>,
    pub incremental_uptime_sec: u64,
    pub uptime_sec: u64,
}

/// Description of the system the log was recorded on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub fields: BTreeMap<String, String>,
    pub synthetic_trials: Vec<ActiveTrial>,
}

impl Environment {
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Saves the environment so that a stability log describing this session
    /// can be built after a crash.
    pub fn save(&self, local_state: &mut LocalState) -> Result<(), serde_json::Error> {
        let serialized = serde_json::to_vec(self)?;
        let hash = hex::encode(Sha1::digest(&serialized));
        local_state.set_string(keys::STABILITY_SAVED_ENVIRONMENT, &BASE64.encode(&serialized));
        local_state.set_string(keys::STABILITY_SAVED_ENVIRONMENT_HASH, &hash);
        Ok(())
    }

    /// Loads the environment saved by a previous session. Returns `None` when
    /// nothing was saved or the saved copy fails validation.
    pub fn load_saved(local_state: &LocalState) -> Option<Self> {
        let encoded = local_state.get_string(keys::STABILITY_SAVED_ENVIRONMENT)?;
        let expected_hash = local_state.get_string(keys::STABILITY_SAVED_ENVIRONMENT_HASH)?;

        let serialized = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Saved environment is not valid base64: {}", e);
                return None;
            }
        };
        if hex::encode(Sha1::digest(&serialized)) != expected_hash {
            warn!("Saved environment hash mismatch");
            return None;
        }
        match serde_json::from_slice(&serialized) {
            Ok(environment) => Some(environment),
            Err(e) => {
                warn!("Failed to parse saved environment: {}", e);
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn clear_saved(local_state: &mut LocalState) {
        local_state.clear(keys::STABILITY_SAVED_ENVIRONMENT);
        local_state.clear(keys::STABILITY_SAVED_ENVIRONMENT_HASH);
    }
}

/// A batch of telemetry destined for one upload.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsLog {
    kind: LogKind,
    client_id: String,
    session_id: i64,
    created_at_unix: u64,
    #[serde(skip)]
    creation_time: Instant,
    events: Vec<UserActionEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    histograms: Vec<HistogramDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<Environment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stability: Option<StabilityReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    general_metrics: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    deferred_facts: BTreeMap<String, String>,
}

impl MetricsLog {
    pub fn new(kind: LogKind, client_id: &str, session_id: i64) -> Self {
        let created_at_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            kind,
            client_id: client_id.to_string(),
            session_id,
            created_at_unix,
            creation_time: Instant::now(),
            events: Vec::new(),
            histograms: Vec::new(),
            environment: None,
            stability: None,
            general_metrics: BTreeMap::new(),
            deferred_facts: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[UserActionEvent] {
        &self.events
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn stability(&self) -> Option<&StabilityReport> {
        self.stability.as_ref()
    }

    pub fn histograms(&self) -> &[HistogramDelta] {
        &self.histograms
    }

    pub fn general_metric(&self, key: &str) -> Option<&serde_json::Value> {
        self.general_metrics.get(key)
    }

    pub fn record_user_action(&mut self, name: &str) {
        let offset_ms = self.creation_time.elapsed().as_millis() as u64;
        self.events.push(UserActionEvent {
            name: name.to_string(),
            offset_ms,
        });
    }

    pub fn record_environment(&mut self, environment: Environment) {
        self.environment = Some(environment);
    }

    pub fn record_stability(&mut self, report: StabilityReport) {
        self.stability = Some(report);
    }

    pub fn set_general_metric(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.general_metrics.insert(key.to_string(), value.into());
    }

    pub fn record_deferred_facts(&mut self, facts: BTreeMap<String, String>) {
        self.deferred_facts.extend(facts);
    }

    pub fn record_histogram_deltas(&mut self, deltas: Vec<HistogramDelta>) {
        self.histograms.extend(deltas);
    }

    /// Replaces this log with an event-free log of the same identity that keeps
    /// everything else recorded so far.
    pub fn into_trivial(self) -> Self {
        debug!(
            "Dropping {} events from {:?} log",
            self.events.len(),
            self.kind
        );
        Self {
            events: Vec::new(),
            ..self
        }
    }

    /// Serializes the log into its upload body.
    pub fn finish(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::InMemoryPrefStore;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn user_actions_carry_offsets() {
        let mut log = MetricsLog::new(LogKind::Ongoing, "client", 3);
        log.record_user_action("Back");
        tokio::time::advance(Duration::from_millis(250)).await;
        log.record_user_action("Reload");

        assert_eq!(log.num_events(), 2);
        assert_eq!(log.events()[0].offset_ms, 0);
        assert_eq!(log.events()[1].offset_ms, 250);
    }

    #[test]
    fn finish_serializes_sections() {
        let mut log = MetricsLog::new(LogKind::InitialMetrics, "client", 1);
        let mut environment = Environment::default();
        environment.set("os", "linux");
        log.record_environment(environment);
        log.set_general_metric("version", "1.2.3");
        log.record_user_action("Open");

        let body: serde_json::Value = serde_json::from_slice(&log.finish().unwrap()).unwrap();
        assert_eq!(body["kind"], "initial_metrics");
        assert_eq!(body["client_id"], "client");
        assert_eq!(body["environment"]["fields"]["os"], "linux");
        assert_eq!(body["general_metrics"]["version"], "1.2.3");
        assert_eq!(body["events"][0]["name"], "Open");
        assert!(body.get("stability").is_none());
    }

    #[test]
    fn trivial_log_keeps_identity_without_events() {
        let mut log = MetricsLog::new(LogKind::Ongoing, "client", 9);
        log.record_user_action("A");
        log.set_general_metric("uptime", 5);
        let trivial = log.into_trivial();
        assert_eq!(trivial.num_events(), 0);
        assert_eq!(trivial.session_id(), 9);
        assert_eq!(trivial.general_metric("uptime"), Some(&serde_json::Value::from(5)));
    }

    #[test]
    fn saved_environment_round_trips_and_validates_hash() {
        let mut state = LocalState::new(Box::new(InMemoryPrefStore::new()));
        assert!(Environment::load_saved(&state).is_none());

        let mut environment = Environment::default();
        environment.set("arch", "x86_64");
        environment.synthetic_trials.push(ActiveTrial {
            name: "T".to_string(),
            group: "G".to_string(),
        });
        environment.save(&mut state).unwrap();
        assert_eq!(Environment::load_saved(&state), Some(environment));

        state.set_string(keys::STABILITY_SAVED_ENVIRONMENT_HASH, "0000");
        assert!(Environment::load_saved(&state).is_none());

        Environment::clear_saved(&mut state);
        assert!(!state.has(keys::STABILITY_SAVED_ENVIRONMENT));
    }
}
