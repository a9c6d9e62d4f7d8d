// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide sample registry and delta snapshots.
//!
//! Histograms are sparse: each bucket is keyed by the recorded sample value.
//! The snapshot manager remembers how many samples it already reported per
//! histogram so every log only carries what was recorded since the previous
//! one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

/// Names of the histograms the service records about itself.
pub mod names {
    pub const UPLOAD_RESPONSE_STATUS: &str = "Metrics.UploadResponseStatus";
    pub const UPLOAD_CREATION: &str = "Metrics.UploadCreation";
    pub const COMPRESSION_RATIO: &str = "Metrics.CompressionRatio";
    pub const COMPRESSED_KB_SAVED: &str = "Metrics.CompressedKBSaved";
    pub const DISCARDED_LOG_EVENTS: &str = "Metrics.DiscardedLogEvents";
    pub const LARGE_REJECTED_LOG_DISCARDED: &str = "Metrics.LargeRejectedLogDiscarded";
    pub const LARGE_LOG_NOT_PERSISTED: &str = "Metrics.LargeLogNotPersisted";
    pub const CRASHED_EXECUTION_PHASE: &str = "Metrics.CrashedExecutionPhase";
    pub const UNSENT_LOGS_READ_STATUS: &str = "Metrics.UnsentLogsReadStatus";
    pub const HISTOGRAM_INCONSISTENCIES: &str = "Metrics.HistogramInconsistencies";
}

/// Which logs a histogram is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HistogramFlags {
    /// Uploaded with regular logs.
    pub uma_targeted: bool,
    /// Also uploaded with the initial stability log.
    pub stability: bool,
}

impl HistogramFlags {
    pub const NONE: Self = Self {
        uma_targeted: false,
        stability: false,
    };
    pub const UMA_TARGETED: Self = Self {
        uma_targeted: true,
        stability: false,
    };
    pub const STABILITY: Self = Self {
        uma_targeted: true,
        stability: true,
    };

    fn satisfies(self, required: Self) -> bool {
        (!required.uma_targeted || self.uma_targeted) && (!required.stability || self.stability)
    }
}

#[derive(Debug, Clone, Default)]
struct HistogramData {
    flags: HistogramFlags,
    buckets: BTreeMap<i64, u64>,
}

/// Shared histogram registry. Clones record into the same histograms.
#[derive(Debug, Clone, Default)]
pub struct Histograms {
    inner: Arc<Mutex<BTreeMap<String, HistogramData>>>,
}

impl Histograms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample.
    pub fn record(&self, name: &str, sample: i64, flags: HistogramFlags) {
        self.record_count(name, sample, 1, flags);
    }

    /// Records `count` occurrences of `sample`. Flags are merged into the
    /// histogram's existing flags.
    pub fn record_count(&self, name: &str, sample: i64, count: u64, flags: HistogramFlags) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let data = inner.entry(name.to_string()).or_default();
        data.flags.uma_targeted |= flags.uma_targeted;
        data.flags.stability |= flags.stability;
        *data.buckets.entry(sample).or_insert(0) += count;
    }

    /// Clears every bucket of a histogram. A snapshot taken afterwards sees
    /// fewer samples than were previously reported and flags it as inconsistent.
    #[cfg(test)]
    pub(crate) fn reset(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(data) = inner.get_mut(name) {
            data.buckets.clear();
        }
    }

    /// Total samples recorded into `name`.
    pub fn total_count(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(name)
            .map(|data| data.buckets.values().sum())
            .unwrap_or(0)
    }

    /// Number of samples recorded into `name` with value `sample`.
    pub fn bucket_count(&self, name: &str, sample: i64) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .get(name)
            .and_then(|data| data.buckets.get(&sample).copied())
            .unwrap_or(0)
    }

    fn snapshot(&self, required: HistogramFlags) -> Vec<(String, BTreeMap<i64, u64>)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .iter()
            .filter(|(_, data)| data.flags.satisfies(required))
            .map(|(name, data)| (name.clone(), data.buckets.clone()))
            .collect()
    }
}

/// Samples recorded into one histogram since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistogramDelta {
    pub name: String,
    pub buckets: BTreeMap<i64, u64>,
}

impl HistogramDelta {
    pub fn total_count(&self) -> u64 {
        self.buckets.values().sum()
    }
}

/// Computes per-log deltas out of the cumulative registry.
#[derive(Debug, Default)]
pub struct HistogramSnapshotManager {
    reported: BTreeMap<String, BTreeMap<i64, u64>>,
    inconsistencies: u64,
}

impl HistogramSnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the deltas of every histogram matching `required`, marking them
    /// as reported.
    pub fn prepare_deltas(
        &mut self,
        histograms: &Histograms,
        required: HistogramFlags,
    ) -> Vec<HistogramDelta> {
        let mut deltas = Vec::new();
        let mut inconsistent = 0;

        for (name, current) in histograms.snapshot(required) {
            let previous = self.reported.get(&name);
            let mut buckets = BTreeMap::new();
            let mut shrunk = false;

            for (sample, count) in &current {
                let before = previous.and_then(|p| p.get(sample)).copied().unwrap_or(0);
                match count.checked_sub(before) {
                    Some(0) => {}
                    Some(delta) => {
                        buckets.insert(*sample, delta);
                    }
                    None => shrunk = true,
                }
            }
            if let Some(previous) = previous {
                shrunk |= previous
                    .iter()
                    .any(|(sample, count)| *count > 0 && !current.contains_key(sample));
            }

            if shrunk {
                warn!("Histogram {} lost samples since the last snapshot", name);
                inconsistent += 1;
            } else if !buckets.is_empty() {
                deltas.push(HistogramDelta {
                    name: name.clone(),
                    buckets,
                });
            }
            self.reported.insert(name, current);
        }

        if inconsistent > 0 {
            self.inconsistencies += inconsistent;
            histograms.record_count(
                names::HISTOGRAM_INCONSISTENCIES,
                1,
                inconsistent,
                HistogramFlags::UMA_TARGETED,
            );
        }
        deltas
    }

    /// Histograms skipped so far because they shrank between snapshots.
    pub fn inconsistencies(&self) -> u64 {
        self.inconsistencies
    }
}
