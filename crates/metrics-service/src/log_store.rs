// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ownership of logs from creation to upload.
//!
//! The store holds at most one current log (being recorded), one paused log
//! (set aside while an out-of-band log is recorded), one staged log (the next
//! or in-flight upload) and the two queues of finished, unsent logs.

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::errors::LogStoreError;
use crate::log::MetricsLog;
use crate::persisted_logs::{LogEntry, LogReadStatus, PersistedLogs, StoreType};
use crate::prefs::{keys, LocalState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Initial,
    Ongoing,
}

#[derive(Debug)]
struct StagedLog {
    entry: LogEntry,
    text: Vec<u8>,
    queue: Queue,
}

#[derive(Debug)]
pub struct LogStore {
    current: Option<MetricsLog>,
    paused: Option<MetricsLog>,
    staged: Option<StagedLog>,
    initial_logs: PersistedLogs,
    ongoing_logs: PersistedLogs,
    event_limit: usize,
    unsent_logs_loaded: bool,
}

impl LogStore {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            current: None,
            paused: None,
            staged: None,
            initial_logs: PersistedLogs::new(
                keys::METRICS_INITIAL_LOGS,
                config.initial_logs_persist_limit,
                config.storage_byte_limit_per_log_type,
                None,
            ),
            ongoing_logs: PersistedLogs::new(
                keys::METRICS_ONGOING_LOGS,
                config.ongoing_logs_persist_limit,
                config.storage_byte_limit_per_log_type,
                Some(config.upload_log_avoid_retransmit_size),
            ),
            event_limit: config.event_limit,
            unsent_logs_loaded: false,
        }
    }

    fn queue_mut(&mut self, queue: Queue) -> &mut PersistedLogs {
        match queue {
            Queue::Initial => &mut self.initial_logs,
            Queue::Ongoing => &mut self.ongoing_logs,
        }
    }

    /// Installs `log` as the current log.
    pub fn begin_logging_with_log(&mut self, log: MetricsLog) -> Result<(), LogStoreError> {
        if self.current.is_some() {
            return Err(LogStoreError::CurrentLogPresent);
        }
        self.current = Some(log);
        Ok(())
    }

    pub fn current_log(&self) -> Option<&MetricsLog> {
        self.current.as_ref()
    }

    pub fn current_log_mut(&mut self) -> Option<&mut MetricsLog> {
        self.current.as_mut()
    }

    #[cfg(test)]
    pub(crate) fn discard_current_log(&mut self) {
        self.current = None;
    }

    /// Sets the current log aside so another log can be recorded.
    pub fn pause_current_log(&mut self) {
        if self.paused.is_some() {
            warn!("Pausing a log while another one is paused");
        }
        self.paused = self.current.take();
    }

    pub fn resume_paused_log(&mut self) {
        if self.current.is_some() {
            warn!("Resuming a paused log over an unfinished current log");
        }
        self.current = self.paused.take();
    }

    /// Closes the current log and queues it for upload. A log with more
    /// events than the limit is replaced by an event-free log first. Returns
    /// the number of events dropped that way.
    pub fn finish_current_log(&mut self) -> Result<usize, LogStoreError> {
        let log = self.current.take().ok_or(LogStoreError::NoCurrentLog)?;

        let num_events = log.num_events();
        let (log, discarded) = if num_events > self.event_limit {
            warn!(
                "Log has {} events, over the limit of {}; dropping them",
                num_events, self.event_limit
            );
            (log.into_trivial(), num_events)
        } else {
            (log, 0)
        };

        let text = log.finish()?;
        let queue = if log.kind().is_initial() {
            Queue::Initial
        } else {
            Queue::Ongoing
        };
        self.queue_mut(queue).store_log(&text)?;
        debug!(
            "Finished {:?} log of {} bytes with {} events",
            log.kind(),
            text.len(),
            log.num_events()
        );
        Ok(discarded)
    }

    /// Stages the newest unsent log, preferring initial logs. Returns whether
    /// a log is staged afterwards.
    pub fn stage_next_log_for_upload(&mut self) -> bool {
        if self.staged.is_some() {
            return true;
        }
        for queue in [Queue::Initial, Queue::Ongoing] {
            while let Some(entry) = self.queue_mut(queue).stage_log() {
                match entry.decompress() {
                    Ok(text) => {
                        self.staged = Some(StagedLog { entry, text, queue });
                        return true;
                    }
                    Err(e) => warn!("Dropping unreadable unsent log: {}", e),
                }
            }
        }
        false
    }

    pub fn has_staged_log(&self) -> bool {
        self.staged.is_some()
    }

    /// Uncompressed text of the staged log.
    pub fn staged_log_text(&self) -> Option<&[u8]> {
        self.staged.as_ref().map(|staged| staged.text.as_slice())
    }

    /// Hex SHA-1 of the staged log's uncompressed text.
    pub fn staged_log_hash(&self) -> Option<&str> {
        self.staged.as_ref().map(|staged| staged.entry.hash())
    }

    pub fn staged_log_len(&self) -> usize {
        self.staged.as_ref().map_or(0, |staged| staged.text.len())
    }

    pub fn discard_staged_log(&mut self) {
        self.staged = None;
    }

    /// Returns the staged log to the head of its queue.
    pub fn store_staged_log_as_unsent(&mut self, store_type: StoreType) {
        if let Some(staged) = self.staged.take() {
            self.queue_mut(staged.queue)
                .store_staged_log(staged.entry, store_type);
        }
    }

    /// Drops the log stored provisionally while its upload was in flight.
    pub fn discard_last_provisional_store(&mut self) {
        // Only one queue holds the provisional entry.
        if !self.initial_logs.discard_last_provisional_store() {
            self.ongoing_logs.discard_last_provisional_store();
        }
    }

    /// Keeps a provisionally stored log as a regular unsent log.
    pub fn keep_last_provisional_store(&mut self) {
        self.initial_logs.forget_provisional_store();
        self.ongoing_logs.forget_provisional_store();
    }

    pub fn has_unsent_logs(&self) -> bool {
        self.unsent_log_count() > 0
    }

    pub fn unsent_log_count(&self) -> usize {
        self.initial_logs.len() + self.ongoing_logs.len()
    }

    pub fn unsent_initial_log_count(&self) -> usize {
        self.initial_logs.len()
    }

    pub fn unsent_ongoing_log_count(&self) -> usize {
        self.ongoing_logs.len()
    }

    /// Writes both queues to local state. Nothing is written before the
    /// persisted queues were loaded, so they are never overwritten with a
    /// partial view. Returns the number of oversized logs dropped.
    pub fn persist_unsent_logs(&mut self, local_state: &mut LocalState) -> usize {
        if !self.unsent_logs_loaded {
            debug!("Not persisting unsent logs before they were loaded");
            return 0;
        }
        let mut dropped = 0;
        for logs in [&mut self.initial_logs, &mut self.ongoing_logs] {
            let (values, oversized) = logs.serialize_logs();
            dropped += oversized;
            local_state.set_list(logs.pref_key(), values);
        }
        dropped
    }

    /// Reads both queues from local state, replacing their contents.
    pub fn load_persisted_unsent_logs(
        &mut self,
        local_state: &LocalState,
    ) -> (LogReadStatus, LogReadStatus) {
        let mut read = |logs: &mut PersistedLogs| {
            let values: Vec<Value> = local_state.get_list(logs.pref_key()).unwrap_or_default();
            logs.deserialize_logs(&values)
        };
        let initial = read(&mut self.initial_logs);
        let ongoing = read(&mut self.ongoing_logs);
        self.unsent_logs_loaded = true;
        debug!(
            "Loaded {} initial and {} ongoing unsent logs",
            self.initial_logs.len(),
            self.ongoing_logs.len()
        );
        (initial, ongoing)
    }

    pub fn unsent_logs_loaded(&self) -> bool {
        self.unsent_logs_loaded
    }
}
