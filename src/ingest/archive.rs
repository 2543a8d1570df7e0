// src/ingest/archive.rs
//! Append-only JSON-lines archive, rotated by record count into dated directories.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::ingest::store::ResultSink;
use crate::ingest::types::ResultRecord;

const FLUSH_EVERY: usize = 100;
pub const DEFAULT_MAX_PER_FILE: usize = 10_000;

struct Current {
    path: PathBuf,
    writer: BufWriter<File>,
    lines: usize,
}

struct State {
    current: Option<Current>,
    seq: u32,
}

/// `<dir>/YYYY/MM/DD/YYYY-MM-DD_HH-MM-SS_NNNN.txt`, one record per line (UTC dates).
/// Every rotation creates a fresh file. Not deduplicated: replays are appended again.
pub struct RotatingArchive {
    dir: PathBuf,
    max_per_file: usize,
    state: Mutex<State>,
}

impl RotatingArchive {
    pub fn open(dir: &Path, max_per_file: usize) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("archive directory does not exist: {}", dir.display());
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_per_file: max_per_file.max(1),
            state: Mutex::new(State {
                current: None,
                seq: 0,
            }),
        })
    }

    pub fn file_path_for(&self, now: DateTime<Utc>, seq: u32) -> PathBuf {
        self.dir
            .join(now.format("%Y/%m/%d").to_string())
            .join(format!("{}_{seq:04}.txt", now.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// Path of the file currently written to, if any.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .expect("archive mutex poisoned")
            .current
            .as_ref()
            .map(|c| c.path.clone())
    }

    /// Opens a file that did not exist before; names taken by an earlier run are skipped.
    fn new_file(&self, seq: &mut u32) -> Result<Current> {
        let now = Utc::now();
        loop {
            let path = self.file_path_for(now, *seq);
            *seq = seq.wrapping_add(1);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "archive file opened");
                    return Ok(Current {
                        path,
                        writer: BufWriter::new(file),
                        lines: 0,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("opening archive file {}", path.display()))
                }
            }
        }
    }

    pub fn emit(&self, record: &ResultRecord) -> Result<()> {
        let mut line = serde_json::to_vec(&record.payload)?;
        line.push(b'\n');

        let mut guard = self.state.lock().expect("archive mutex poisoned");
        let state = &mut *guard;
        if state.current.is_none() {
            state.current = Some(self.new_file(&mut state.seq)?);
        }
        let cur = state.current.as_mut().context("archive file not open")?;
        cur.writer.write_all(&line)?;
        cur.lines += 1;
        if cur.lines % FLUSH_EVERY == 0 {
            cur.writer.flush()?;
        }
        if cur.lines >= self.max_per_file {
            cur.writer.flush()?;
            state.current = None;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(cur) = self
            .state
            .lock()
            .expect("archive mutex poisoned")
            .current
            .as_mut()
        {
            cur.writer.flush()?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultSink for RotatingArchive {
    async fn upsert(&self, record: &ResultRecord) -> Result<()> {
        self.emit(record)
    }
}

/// Upserts into `primary`, then mirrors the record into the archive.
pub struct TeeSink {
    primary: Arc<dyn ResultSink>,
    archive: Arc<RotatingArchive>,
}

impl TeeSink {
    pub fn new(primary: Arc<dyn ResultSink>, archive: Arc<RotatingArchive>) -> Self {
        Self { primary, archive }
    }
}

#[async_trait::async_trait]
impl ResultSink for TeeSink {
    async fn upsert(&self, record: &ResultRecord) -> Result<()> {
        self.primary.upsert(record).await?;
        if let Err(e) = self.archive.emit(record) {
            // never fails the primary upsert
            tracing::error!(error = ?e, id = %record.id, "archive write failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dated_layout() {
        let dir = tempfile::tempdir().unwrap();
        let a = RotatingArchive::open(dir.path(), 2).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            a.file_path_for(ts, 3),
            dir.path().join("2024/03/09").join("2024-03-09_07-05-01_0003.txt")
        );
    }

    #[test]
    fn taken_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let a = RotatingArchive::open(dir.path(), 10).unwrap();
        let now = Utc::now();
        for seq in 0..3 {
            let p = a.file_path_for(now, seq);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, "old\n").unwrap();
        }
        let mut seq = 0;
        let cur = a.new_file(&mut seq).unwrap();
        assert!(seq >= 1);
        assert!((0..3).all(|n| cur.path != a.file_path_for(now, n)));
        assert_eq!(std::fs::read_to_string(&cur.path).unwrap(), "");
    }

    #[test]
    fn missing_dir_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RotatingArchive::open(&dir.path().join("nope"), 10).is_err());
    }
}
