// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An ordered queue of finished logs that survives restarts.
//!
//! Entries are kept gzip-compressed together with the hex SHA-1 of their
//! uncompressed text. The newest entry sits at the end of the list and is the
//! first one staged.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::errors::LogStoreError;

/// How a staged log is returned to its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Normal,
    /// The log is still being uploaded; a completing upload removes it again.
    Provisional,
}

/// Result of loading a queue from local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReadStatus {
    Success,
    ListEmpty,
    /// Some entries failed validation and were dropped.
    Corrupted { dropped: usize },
}

impl LogReadStatus {
    /// Stable numeric code recorded into self-telemetry.
    pub fn code(self) -> i64 {
        match self {
            LogReadStatus::Success => 0,
            LogReadStatus::ListEmpty => 1,
            LogReadStatus::Corrupted { .. } => 2,
        }
    }
}

/// A finished log waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    id: u64,
    compressed: Vec<u8>,
    hash: String,
}

impl LogEntry {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Returns the uncompressed log text.
    pub fn decompress(&self) -> Result<Vec<u8>, LogStoreError> {
        let mut decoder = GzDecoder::new(self.compressed.as_slice());
        let mut text = Vec::new();
        decoder
            .read_to_end(&mut text)
            .map_err(LogStoreError::Compression)?;
        Ok(text)
    }
}

#[derive(Deserialize)]
struct SerializedEntry {
    data: String,
    hash: String,
}

fn compress(text: &[u8]) -> Result<Vec<u8>, LogStoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(text)
        .map_err(LogStoreError::Compression)?;
    encoder.finish().map_err(LogStoreError::Compression)
}

pub fn hash_text(text: &[u8]) -> String {
    hex::encode(Sha1::digest(text))
}

#[derive(Debug)]
pub struct PersistedLogs {
    pref_key: &'static str,
    min_log_count: usize,
    min_log_bytes: usize,
    max_log_size: Option<usize>,
    list: Vec<LogEntry>,
    next_id: u64,
    last_provisional_store: Option<u64>,
}

impl PersistedLogs {
    /// `min_log_count` and `min_log_bytes` bound what is kept when persisting:
    /// the newest entries are kept until both minimums are met. Entries larger
    /// than `max_log_size` are never persisted.
    pub fn new(
        pref_key: &'static str,
        min_log_count: usize,
        min_log_bytes: usize,
        max_log_size: Option<usize>,
    ) -> Self {
        Self {
            pref_key,
            min_log_count,
            min_log_bytes,
            max_log_size,
            list: Vec::new(),
            next_id: 0,
            last_provisional_store: None,
        }
    }

    pub fn pref_key(&self) -> &'static str {
        self.pref_key
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Compresses and hashes `text`, appending it as the newest entry.
    pub fn store_log(&mut self, text: &[u8]) -> Result<(), LogStoreError> {
        let compressed = compress(text)?;
        let id = self.allocate_id();
        self.list.push(LogEntry {
            id,
            compressed,
            hash: hash_text(text),
        });
        Ok(())
    }

    /// Removes and returns the newest entry.
    pub fn stage_log(&mut self) -> Option<LogEntry> {
        self.list.pop()
    }

    /// Puts a previously staged entry back as the newest entry.
    pub fn store_staged_log(&mut self, entry: LogEntry, store_type: StoreType) {
        self.last_provisional_store = match store_type {
            StoreType::Provisional => Some(entry.id),
            StoreType::Normal => None,
        };
        self.list.push(entry);
    }

    /// Drops the entry stored by the last provisional store, if it is still
    /// queued.
    pub fn discard_last_provisional_store(&mut self) -> bool {
        let Some(id) = self.last_provisional_store.take() else {
            return false;
        };
        match self.list.iter().position(|entry| entry.id == id) {
            Some(index) => {
                self.list.remove(index);
                debug!("Discarded provisionally stored log from {}", self.pref_key);
                true
            }
            None => false,
        }
    }

    /// Keeps the provisionally stored entry as a regular entry.
    pub fn forget_provisional_store(&mut self) {
        self.last_provisional_store = None;
    }

    /// Serializes the queue for local state. Returns the serialized list and
    /// the number of oversized entries that were dropped instead.
    pub fn serialize_logs(&mut self) -> (Vec<Value>, usize) {
        let mut dropped = 0;
        if let Some(max) = self.max_log_size {
            let before = self.list.len();
            self.list.retain(|entry| entry.compressed.len() <= max);
            dropped = before - self.list.len();
            if dropped > 0 {
                warn!(
                    "Not persisting {} oversized logs from {}",
                    dropped, self.pref_key
                );
            }
        }

        let mut start = 0;
        if self.list.len() > self.min_log_count {
            start = self.list.len();
            let mut bytes_used = 0;
            for entry in self.list.iter().rev() {
                if bytes_used >= self.min_log_bytes && self.list.len() - start >= self.min_log_count
                {
                    break;
                }
                bytes_used += entry.compressed.len();
                start -= 1;
            }
        }

        let serialized = self.list[start..]
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "data": BASE64.encode(&entry.compressed),
                    "hash": entry.hash,
                })
            })
            .collect();
        (serialized, dropped)
    }

    /// Replaces the queue with the entries read from local state. Entries that
    /// fail to decode or whose hash does not match are dropped.
    pub fn deserialize_logs(&mut self, values: &[Value]) -> LogReadStatus {
        self.list.clear();
        self.last_provisional_store = None;
        if values.is_empty() {
            return LogReadStatus::ListEmpty;
        }

        let mut dropped = 0;
        for value in values {
            match self.decode_entry(value) {
                Some(entry) => self.list.push(entry),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(
                "Dropped {} corrupt logs while loading {}",
                dropped, self.pref_key
            );
            LogReadStatus::Corrupted { dropped }
        } else {
            LogReadStatus::Success
        }
    }

    fn decode_entry(&mut self, value: &Value) -> Option<LogEntry> {
        let serialized: SerializedEntry = serde_json::from_value(value.clone()).ok()?;
        let compressed = BASE64.decode(serialized.data).ok()?;
        let id = self.allocate_id();
        let entry = LogEntry {
            id,
            compressed,
            hash: serialized.hash,
        };
        let text = entry.decompress().ok()?;
        if hash_text(&text) != entry.hash {
            return None;
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(min_count: usize, min_bytes: usize, max: Option<usize>) -> PersistedLogs {
        PersistedLogs::new("test.logs", min_count, min_bytes, max)
    }

    #[test]
    fn stage_returns_newest_first() {
        let mut logs = queue(8, 1000, None);
        logs.store_log(b"first").unwrap();
        logs.store_log(b"second").unwrap();

        let staged = logs.stage_log().unwrap();
        assert_eq!(staged.decompress().unwrap(), b"second");
        assert_eq!(staged.hash(), hash_text(b"second"));
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn provisional_store_is_discarded_by_id() {
        let mut logs = queue(8, 1000, None);
        logs.store_log(b"old").unwrap();
        logs.store_log(b"in-flight").unwrap();
        let staged = logs.stage_log().unwrap();

        logs.store_staged_log(staged, StoreType::Provisional);
        logs.store_log(b"newer").unwrap();
        assert_eq!(logs.len(), 3);

        assert!(logs.discard_last_provisional_store());
        assert!(!logs.discard_last_provisional_store());
        let texts: Vec<_> = std::iter::from_fn(|| logs.stage_log())
            .map(|e| e.decompress().unwrap())
            .collect();
        assert_eq!(texts, vec![b"newer".to_vec(), b"old".to_vec()]);
    }

    #[test]
    fn normal_store_clears_provisional_marker() {
        let mut logs = queue(8, 1000, None);
        logs.store_log(b"a").unwrap();
        let staged = logs.stage_log().unwrap();
        logs.store_staged_log(staged, StoreType::Normal);
        assert!(!logs.discard_last_provisional_store());
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn serialize_keeps_newest_until_both_minimums_met() {
        // Every entry is bigger than one byte, so the byte minimum of 1 is met
        // after the first entry and the count minimum decides.
        let mut logs = queue(2, 1, None);
        for text in [b"one".as_slice(), b"two", b"three", b"four"] {
            logs.store_log(text).unwrap();
        }
        let (values, dropped) = logs.serialize_logs();
        assert_eq!(dropped, 0);
        assert_eq!(values.len(), 2);

        let mut reloaded = queue(2, 1, None);
        assert_eq!(reloaded.deserialize_logs(&values), LogReadStatus::Success);
        assert_eq!(reloaded.stage_log().unwrap().decompress().unwrap(), b"four");
        assert_eq!(reloaded.stage_log().unwrap().decompress().unwrap(), b"three");
    }

    #[test]
    fn serialize_keeps_more_entries_until_byte_minimum_met() {
        let mut logs = queue(1, usize::MAX, None);
        for text in [b"one".as_slice(), b"two", b"three"] {
            logs.store_log(text).unwrap();
        }
        let (values, _) = logs.serialize_logs();
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn oversized_entries_are_not_persisted() {
        let mut logs = queue(8, 1000, Some(64));
        logs.store_log(b"small").unwrap();
        let big: Vec<u8> = (0..4096u32).map(|i| (i * 7919 % 251) as u8).collect();
        logs.store_log(&big).unwrap();

        let (values, dropped) = logs.serialize_logs();
        assert_eq!(dropped, 1);
        assert_eq!(values.len(), 1);
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn corrupt_entries_are_dropped_on_load() {
        let mut logs = queue(8, 1000, None);
        logs.store_log(b"good").unwrap();
        let (mut values, _) = logs.serialize_logs();
        let good_data = values[0]["data"].clone();
        values.push(serde_json::json!({"data": "not base64!", "hash": "00"}));
        values.push(serde_json::json!({"data": good_data, "hash": "deadbeef"}));
        values.push(serde_json::json!(42));

        let mut reloaded = queue(8, 1000, None);
        assert_eq!(
            reloaded.deserialize_logs(&values),
            LogReadStatus::Corrupted { dropped: 3 }
        );
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.deserialize_logs(&[]), LogReadStatus::ListEmpty);
        assert!(reloaded.is_empty());
    }
}
