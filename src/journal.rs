use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "harvest-journal.jsonl";
const BATCH_SIZE: usize = 32;

pub mod events {
    pub const RUN_STARTED: &str = "run_started";
    pub const DOCUMENT_REFRESHED: &str = "document_refreshed";
    pub const DOCUMENT_FAILED: &str = "document_failed";
    pub const RECORD_REJECTED: &str = "record_rejected";
    pub const SWEEP_SKIPPED: &str = "sweep_skipped";
    pub const PLACE_ID_CHANGED: &str = "place_id_changed";
    pub const RESTAURANTS_MERGED: &str = "restaurants_merged";
    pub const CUISINE_ADDED: &str = "cuisine_added";
}

/// Append-only JSONL record of what a run did, one event per line.
///
/// Events are buffered and written in batches; the file is rotated once it
/// would grow past `max_file_bytes`, keeping at most `max_file_count` files.
#[derive(Clone)]
pub struct RunJournal {
    queue: Arc<Mutex<Vec<JournalEvent>>>,
    path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEvent {
    pub event: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RunJournal {
    pub fn open<P: AsRef<Path>>(dir: P, max_file_bytes: u64, max_file_count: usize) -> AppResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
            batch_size: BATCH_SIZE,
            max_file_bytes,
            max_file_count: max_file_count.max(1),
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        Self::open(
            &config.journal_dir,
            config.journal_max_bytes,
            config.journal_max_files,
        )
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn record(&self, event: &str, payload: serde_json::Value) -> AppResult<()> {
        let mut queue = self.queue.lock();
        queue.push(JournalEvent {
            event: event.to_string(),
            ts: Utc::now(),
            payload,
        });
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    /// Records an event, logging instead of failing when the journal cannot
    /// be written. Journal trouble never aborts harvesting.
    pub fn note(&self, event: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(event, payload) {
            warn!(?err, event, "unable to write run journal");
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events in the current (unrotated) file, flushing pending ones first.
    pub fn read_current(&self) -> AppResult<Vec<JournalEvent>> {
        self.flush()?;
        let raw = fs::read_to_string(&self.path)?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    fn persist_locked(&self, queue: &mut Vec<JournalEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(queue.len());
        let mut bytes = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            bytes += (line.len() + 1) as u64;
            encoded.push(line);
        }

        self.rotate_if_needed(bytes)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.dir().join(format!(
                "{}-{}.jsonl",
                self.stem(),
                Utc::now().format("%Y%m%d%H%M%S%6f")
            ));
            fs::rename(&self.path, rotated)?;
            self.prune_rotations()?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotations: Vec<PathBuf> = fs::read_dir(self.dir())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".jsonl"))
            })
            .collect();

        // names embed the rotation time, so lexical order is age order
        rotations.sort();
        let allowed = self.max_file_count - 1;
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for path in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "harvest-journal".into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn rotated_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("harvest-journal-")
            })
            .count()
    }

    #[test]
    fn batches_until_flush() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::open(dir.path(), 1024 * 1024, 3).unwrap();
        journal
            .record(events::DOCUMENT_REFRESHED, json!({ "document_id": 1 }))
            .unwrap();
        assert_eq!(fs::read_to_string(journal.path()).unwrap(), "");

        let events = journal.read_current().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "document_refreshed");
        assert_eq!(events[0].payload["document_id"], 1);
    }

    #[test]
    fn appends_across_instances() {
        let dir = tempdir().unwrap();
        {
            let journal = RunJournal::open(dir.path(), 1024 * 1024, 3).unwrap();
            journal.record("first", json!({})).unwrap();
            journal.flush().unwrap();
        }
        let journal = RunJournal::open(dir.path(), 1024 * 1024, 3).unwrap();
        journal.record("second", json!({})).unwrap();
        let names: Vec<_> = journal
            .read_current()
            .unwrap()
            .into_iter()
            .map(|event| event.event)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn rotates_and_prunes_old_files() {
        let dir = tempdir().unwrap();
        let journal = RunJournal::open(dir.path(), 64, 3)
            .unwrap()
            .with_batch_size(1);
        for idx in 0..6 {
            journal
                .record(
                    "big",
                    json!({ "padding": "0123456789abcdef0123456789abcdef", "idx": idx }),
                )
                .unwrap();
        }
        assert_eq!(rotated_files(dir.path()), 2);
        let current = journal.read_current().unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].payload["idx"], 5);
    }
}
