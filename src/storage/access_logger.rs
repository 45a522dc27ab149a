use crate::common::StorageError;
use crate::storage::models::AccessEvent;
use crate::storage::store::PersistentStore;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Content-addressed store for captured frames.
pub struct ImageArchive {
    dir: PathBuf,
}

impl ImageArchive {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Writes `bytes` under `<timestamp>_<sha256 prefix>.jpg` and returns the final path.
    /// The file only appears under its final name once fully written and synced.
    pub fn persist(&self, event: &AccessEvent, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let digest = format!("{:x}", Sha256::digest(bytes));
        let name = format!(
            "{}_{}.jpg",
            event.timestamp.format("%Y%m%d_%H%M%S%.6f"),
            &digest[..16]
        );
        let final_path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{}.tmp", name));

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &final_path)
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        Ok(final_path)
    }
}

/// Writes every decision to the store, the image archive and the flat-text log.
pub struct AccessLogger {
    store: Arc<PersistentStore>,
    archive: ImageArchive,
    text_log: PathBuf,
    journal: PathBuf,
    file_lock: Mutex<()>,
}

impl AccessLogger {
    pub fn new(
        store: Arc<PersistentStore>,
        archive: ImageArchive,
        text_log: PathBuf,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = text_log.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let journal = degraded_journal_path(&text_log);

        Ok(Self {
            store,
            archive,
            text_log,
            journal,
            file_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    /// Persist one decision.
    ///
    /// The frame, if any, is archived before the row is written, so a stored path
    /// always names an existing file. A failed image write leaves the path empty
    /// and sets `image_persist_failed`. A store append is retried once; if it
    /// still fails the event goes to the degraded journal with `degraded` set,
    /// and only a journal failure is returned as an error.
    pub fn record(
        &self,
        mut event: AccessEvent,
        frame_image: Option<&[u8]>,
    ) -> Result<AccessEvent, StorageError> {
        if let Some(bytes) = frame_image {
            match self.archive.persist(&event, bytes) {
                Ok(path) => event.captured_image_path = Some(path),
                Err(e) => {
                    tracing::warn!("Failed to archive access image: {}", e);
                    event.captured_image_path = None;
                    event.image_persist_failed = true;
                }
            }
        }

        let appended = match self.store.append_access_event(&event) {
            Ok(id) => Ok(id),
            Err(first) => {
                tracing::warn!("Access log append failed, retrying once: {}", first);
                self.store.append_access_event(&event)
            }
        };

        match appended {
            Ok(id) => {
                event.id = Some(id);
                self.append_text_line(&event);
                Ok(event)
            }
            Err(e) => {
                tracing::error!("Access log append failed twice, journaling event: {}", e);
                event.degraded = true;
                self.append_journal(&event)?;
                self.append_text_line(&event);
                Ok(event)
            }
        }
    }

    /// Re-append journaled events. The journal is removed once every entry made it
    /// into the store; otherwise the entries that still fail are kept.
    pub fn replay_degraded(&self) -> Result<usize, StorageError> {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.journal.exists() {
            return Ok(0);
        }

        let reader = BufReader::new(File::open(&self.journal)?);
        let mut replayed = 0;
        let mut remaining = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AccessEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Skipping unreadable journal entry: {}", e);
                    continue;
                }
            };
            match self.store.append_access_event(&event) {
                Ok(_) => replayed += 1,
                Err(e) => {
                    tracing::warn!("Journal replay append failed: {}", e);
                    remaining.push(line);
                }
            }
        }

        if remaining.is_empty() {
            fs::remove_file(&self.journal)?;
        } else {
            let tmp = self.journal.with_extension("jsonl.tmp");
            let mut file = File::create(&tmp)?;
            for line in &remaining {
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
            fs::rename(&tmp, &self.journal)?;
        }

        if replayed > 0 {
            tracing::info!("Replayed {} degraded access events", replayed);
        }
        Ok(replayed)
    }

    fn append_journal(&self, event: &AccessEvent) -> Result<(), StorageError> {
        let line = serde_json::to_string(event)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)?;
        writeln!(file, "{}", line)?;
        file.sync_all()?;
        Ok(())
    }

    fn append_text_line(&self, event: &AccessEvent) {
        let _guard = self.file_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.text_log)
            .and_then(|mut file| writeln!(file, "{}", event.to_log_line()));

        if let Err(e) = result {
            tracing::warn!("Failed to write access log line to {}: {}", self.text_log.display(), e);
        }
    }
}

pub fn degraded_journal_path(text_log: &Path) -> PathBuf {
    let mut name = text_log
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "access_log".into());
    name.push(".degraded.jsonl");
    text_log.with_file_name(name)
}
