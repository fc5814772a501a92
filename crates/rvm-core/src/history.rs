//! Append-only, hash-chained history log
//!
//! Startup reports and rollback records are written here. The file is
//! newline-delimited JSON, one entry per line, and is only ever appended
//! to. Each entry carries the SHA-256 of its predecessor so tampering or
//! truncation in the middle of the file is detectable.
//!
//! The whole file is read on open; only the newest `max_entries` entries are
//! kept in memory (oldest evicted first). The file itself is never trimmed.
//!
//! A single `parking_lot::Mutex` serializes writers, so the startup
//! coordinator and the trigger monitor can share one log safely.

use crate::error::HistoryError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Hash used as `prev_hash` of the first entry
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One line of the history file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry<T> {
    pub sequence: u64,
    pub prev_hash: String,
    pub hash: String,
    pub record: T,
}

#[derive(Deserialize)]
struct RawEntry<'a> {
    sequence: u64,
    prev_hash: String,
    hash: String,
    #[serde(borrow)]
    record: &'a RawValue,
}

#[derive(Debug)]
struct HistoryState<T> {
    entries: VecDeque<HistoryEntry<T>>,
    last_hash: String,
    next_sequence: u64,
    /// Index (line) of the first entry that failed verification on load
    broken_at: Option<usize>,
}

/// Append-only history of `T` records
#[derive(Debug)]
pub struct HistoryLog<T> {
    path: Option<PathBuf>,
    max_entries: usize,
    inner: Mutex<HistoryState<T>>,
}

impl<T> HistoryLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open (or create) a history file and seed memory from it
    ///
    /// # Errors
    /// `HistoryError::Io` if the file or its directory cannot be accessed.
    pub fn open(path: impl Into<PathBuf>, max_entries: usize) -> Result<Self, HistoryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let state = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| HistoryError::Io {
                path: path.clone(),
                source,
            })?;
            load_state(&path, &text, max_entries)
        } else {
            empty_state()
        };

        tracing::debug!(
            path = %path.display(),
            loaded = state.entries.len(),
            next_sequence = state.next_sequence,
            "opened history log"
        );

        Ok(Self {
            path: Some(path),
            max_entries,
            inner: Mutex::new(state),
        })
    }

    /// History that is never persisted
    #[must_use]
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            path: None,
            max_entries,
            inner: Mutex::new(empty_state()),
        }
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append a record, returning its sequence number
    ///
    /// The line is written before memory is updated, so a failed write
    /// leaves both untouched.
    ///
    /// # Errors
    /// `HistoryError::Serialize` or `HistoryError::Io`.
    pub fn append(&self, record: T) -> Result<u64, HistoryError> {
        let mut state = self.inner.lock();

        let record_json = serde_json::to_string(&record)?;
        let sequence = state.next_sequence;
        let prev_hash = state.last_hash.clone();
        let hash = chain_hash(&prev_hash, sequence, record_json.as_bytes());

        if let Some(path) = &self.path {
            let raw = RawValue::from_string(record_json)?;
            let line = serde_json::to_string(&HistoryEntry {
                sequence,
                prev_hash: prev_hash.clone(),
                hash: hash.clone(),
                record: raw,
            })?;
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| HistoryError::Io {
                    path: path.clone(),
                    source,
                })?;
            writeln!(file, "{line}")
                .and_then(|()| file.flush())
                .map_err(|source| HistoryError::Io {
                    path: path.clone(),
                    source,
                })?;
        }

        state.entries.push_back(HistoryEntry {
            sequence,
            prev_hash,
            hash: hash.clone(),
            record,
        });
        while state.entries.len() > self.max_entries {
            state.entries.pop_front();
        }
        state.last_hash = hash;
        state.next_sequence += 1;
        Ok(sequence)
    }

    /// Records currently held in memory, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<T> {
        self.inner.lock().entries.iter().map(|e| e.record.clone()).collect()
    }

    /// Entries currently held in memory, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry<T>> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    /// Newest record
    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.inner.lock().entries.back().map(|e| e.record.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of entries ever written (including evicted ones)
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.inner.lock().next_sequence
    }

    /// Check the hash chain
    ///
    /// File entries are verified against their exact on-disk bytes when the
    /// log is opened; entries appended since are chained by construction.
    ///
    /// # Errors
    /// `HistoryError::IntegrityViolation` with the first bad line index.
    pub fn verify_integrity(&self) -> Result<(), HistoryError> {
        let state = self.inner.lock();
        if let Some(index) = state.broken_at {
            return Err(HistoryError::IntegrityViolation { index });
        }
        let first = state.entries.front().map_or(0, |e| e.sequence);
        for (pair_index, pair) in state.entries.iter().zip(state.entries.iter().skip(1)).enumerate() {
            let (prev, next) = pair;
            if next.prev_hash != prev.hash || next.sequence != prev.sequence + 1 {
                let index = usize::try_from(first).unwrap_or(usize::MAX).saturating_add(pair_index + 1);
                return Err(HistoryError::IntegrityViolation { index });
            }
        }
        Ok(())
    }
}

fn empty_state<T>() -> HistoryState<T> {
    HistoryState {
        entries: VecDeque::new(),
        last_hash: GENESIS_HASH.to_string(),
        next_sequence: 0,
        broken_at: None,
    }
}

fn load_state<T: DeserializeOwned>(path: &Path, text: &str, max_entries: usize) -> HistoryState<T> {
    let mut state = empty_state();

    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEntry<'_> = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(path = %path.display(), line = index + 1, error = %e, "skipping unreadable history line");
                state.broken_at.get_or_insert(index);
                continue;
            }
        };

        let expected = chain_hash(&raw.prev_hash, raw.sequence, raw.record.get().as_bytes());
        if raw.hash != expected || raw.prev_hash != state.last_hash {
            state.broken_at.get_or_insert(index);
        }

        match serde_json::from_str::<T>(raw.record.get()) {
            Ok(record) => {
                state.entries.push_back(HistoryEntry {
                    sequence: raw.sequence,
                    prev_hash: raw.prev_hash,
                    hash: raw.hash.clone(),
                    record,
                });
                while state.entries.len() > max_entries {
                    state.entries.pop_front();
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), line = index + 1, error = %e, "skipping history record with unknown shape");
            }
        }

        state.last_hash = raw.hash;
        state.next_sequence = raw.sequence + 1;
    }

    if let Some(index) = state.broken_at {
        tracing::error!(path = %path.display(), line = index + 1, "history hash chain is broken");
    }
    state
}

fn chain_hash(prev_hash: &str, sequence: u64, record: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(record);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        value: f64,
    }

    fn note(i: usize) -> Note {
        Note {
            text: format!("note-{i}"),
            value: i as f64 / 3.0,
        }
    }

    #[test]
    fn append_and_reload_keeps_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/history.jsonl");

        let log = HistoryLog::<Note>::open(&path, 100).unwrap();
        for i in 0..5 {
            assert_eq!(log.append(note(i)).unwrap(), i as u64);
        }
        assert!(log.verify_integrity().is_ok());
        drop(log);

        let reopened = HistoryLog::<Note>::open(&path, 100).unwrap();
        assert_eq!(reopened.len(), 5);
        assert_eq!(reopened.records()[4], note(4));
        assert!(reopened.verify_integrity().is_ok());

        reopened.append(note(5)).unwrap();
        assert!(reopened.verify_integrity().is_ok());
        assert_eq!(reopened.total_written(), 6);
    }

    #[test]
    fn reload_caps_memory_but_not_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let log = HistoryLog::<Note>::open(&path, 100).unwrap();
        for i in 0..10 {
            log.append(note(i)).unwrap();
        }
        drop(log);

        let capped = HistoryLog::<Note>::open(&path, 3).unwrap();
        let records = capped.records();
        assert_eq!(records, vec![note(7), note(8), note(9)]);
        assert_eq!(capped.total_written(), 10);

        let lines = std::fs::read_to_string(&path).unwrap().lines().count();
        assert_eq!(lines, 10);
    }

    #[test]
    fn tampered_line_breaks_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let log = HistoryLog::<Note>::open(&path, 100).unwrap();
        for i in 0..3 {
            log.append(note(i)).unwrap();
        }
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("note-1", "note-X")).unwrap();

        let reopened = HistoryLog::<Note>::open(&path, 100).unwrap();
        assert!(matches!(
            reopened.verify_integrity(),
            Err(HistoryError::IntegrityViolation { index: 1 })
        ));
    }

    #[test]
    fn in_memory_log_evicts_oldest() {
        let log = HistoryLog::<Note>::in_memory(2);
        for i in 0..4 {
            log.append(note(i)).unwrap();
        }
        assert_eq!(log.records(), vec![note(2), note(3)]);
        assert_eq!(log.last(), Some(note(3)));
        assert!(log.path().is_none());
    }
}
