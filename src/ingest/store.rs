// src/ingest/store.rs
//! Watermark and result persistence.
//!
//! Both capabilities upsert: watermarks keyed by the exact filter, records keyed by
//! their external identifier. Every write is durable when the call returns.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ingest::types::{Filter, ResultId, ResultRecord};

#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, filter: &Filter) -> Result<Option<ResultId>>;
    /// Last write wins.
    async fn set(&self, filter: &Filter, id: ResultId) -> Result<()>;
}

#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert or overwrite the record with the same identifier.
    async fn upsert(&self, record: &ResultRecord) -> Result<()>;
}

// --- In-memory store (tests, dry runs) ---

#[derive(Debug, Default)]
pub struct MemoryStore {
    watermarks: Mutex<HashMap<Filter, ResultId>>,
    records: Mutex<BTreeMap<ResultId, ResultRecord>>,
    upserts: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self, filter: &Filter) -> Option<ResultId> {
        self.watermarks
            .lock()
            .expect("store mutex poisoned")
            .get(filter)
            .copied()
    }

    pub fn record(&self, id: ResultId) -> Option<ResultRecord> {
        self.records
            .lock()
            .expect("store mutex poisoned")
            .get(&id)
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().expect("store mutex poisoned").len()
    }

    /// Number of upsert calls, including overwrites.
    pub fn upsert_count(&self) -> usize {
        *self.upserts.lock().expect("store mutex poisoned")
    }
}

#[async_trait::async_trait]
impl WatermarkStore for MemoryStore {
    async fn get(&self, filter: &Filter) -> Result<Option<ResultId>> {
        Ok(self.watermark(filter))
    }

    async fn set(&self, filter: &Filter, id: ResultId) -> Result<()> {
        self.watermarks
            .lock()
            .expect("store mutex poisoned")
            .insert(filter.clone(), id);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultSink for MemoryStore {
    async fn upsert(&self, record: &ResultRecord) -> Result<()> {
        self.records
            .lock()
            .expect("store mutex poisoned")
            .insert(record.id, record.clone());
        *self.upserts.lock().expect("store mutex poisoned") += 1;
        Ok(())
    }
}

// --- Directory-backed store ---

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkRow {
    #[serde(flatten)]
    filter: Filter,
    since_id: ResultId,
}

/// `<root>/<watermarks>.json` holds one row per filter; `<root>/<records>/<id>.json`
/// holds one file per record, so the file name is the uniqueness constraint.
pub struct FileStore {
    watermarks_path: PathBuf,
    records_dir: PathBuf,
    watermarks: tokio::sync::Mutex<Vec<WatermarkRow>>,
}

impl FileStore {
    pub fn open(root: &Path, watermarks_name: &str, records_name: &str) -> Result<Self> {
        let records_dir = root.join(records_name);
        std::fs::create_dir_all(&records_dir)
            .with_context(|| format!("creating record directory {}", records_dir.display()))?;

        let watermarks_path = root.join(format!("{watermarks_name}.json"));
        let rows = match std::fs::read_to_string(&watermarks_path) {
            Ok(s) if s.trim().is_empty() => Vec::new(),
            Ok(s) => serde_json::from_str(&s)
                .with_context(|| format!("parsing watermarks {}", watermarks_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading watermarks {}", watermarks_path.display()))
            }
        };

        tracing::debug!(
            root = %root.display(),
            watermarks = rows.len(),
            "file store opened"
        );

        Ok(Self {
            watermarks_path,
            records_dir,
            watermarks: tokio::sync::Mutex::new(rows),
        })
    }

    pub fn record_path(&self, id: ResultId) -> PathBuf {
        self.records_dir.join(format!("{id}.json"))
    }

    /// Read a stored record back (timestamps already normalized).
    pub async fn load_record(&self, id: ResultId) -> Result<Option<ResultRecord>> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        let mut record = ResultRecord::from_value(value)?;
        record.normalize_timestamps();
        Ok(Some(record))
    }

    pub async fn record_count(&self) -> Result<usize> {
        let mut n = 0;
        let mut rd = tokio::fs::read_dir(&self.records_dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("json") {
                n += 1;
            }
        }
        Ok(n)
    }
}

#[async_trait::async_trait]
impl WatermarkStore for FileStore {
    async fn get(&self, filter: &Filter) -> Result<Option<ResultId>> {
        let rows = self.watermarks.lock().await;
        Ok(rows.iter().find(|r| &r.filter == filter).map(|r| r.since_id))
    }

    async fn set(&self, filter: &Filter, id: ResultId) -> Result<()> {
        let mut rows = self.watermarks.lock().await;
        let mut next = rows.clone();
        match next.iter_mut().find(|r| &r.filter == filter) {
            Some(row) => row.since_id = id,
            None => next.push(WatermarkRow {
                filter: filter.clone(),
                since_id: id,
            }),
        }
        let body = serde_json::to_vec_pretty(&next)?;
        write_atomic(&self.watermarks_path, body).await?;
        *rows = next;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResultSink for FileStore {
    async fn upsert(&self, record: &ResultRecord) -> Result<()> {
        let body = serde_json::to_vec(&record.payload)?;
        write_atomic(&self.record_path(record.id), body).await
    }
}

/// Write to a sibling temp file, fsync, rename over the target, then fsync the
/// directory so the rename itself is durable. Temp names are unique per write so
/// concurrent upserts of one id never share a temp file.
async fn write_atomic(path: &Path, body: Vec<u8>) -> Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let path = path.to_path_buf();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;
        let tmp = path.with_extension(format!("json.{}-{seq}.tmp", std::process::id()));
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(&body)?;
        f.sync_all()?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    })
    .await
    .context("store writer task panicked")?
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("syncing directory {}", dir.display()))
}

// Directory handles cannot be opened for sync here.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn atomic_write_leaves_only_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("1.json");
        write_atomic(&target, b"{\"a\":1}".to_vec()).await.unwrap();
        write_atomic(&target, b"{\"a\":2}".to_vec()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), r#"{"a":2}"#);
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("1.json")]);
        sync_dir(dir.path()).unwrap();
    }

    #[test]
    fn syncing_a_missing_directory_fails_on_unix() {
        let dir = tempfile::tempdir().unwrap();
        let res = sync_dir(&dir.path().join("gone"));
        assert_eq!(res.is_err(), cfg!(unix));
    }

    #[test]
    fn watermark_row_is_flat() {
        let row = WatermarkRow {
            filter: Filter::query("rust"),
            since_id: ResultId(42),
        };
        let v = serde_json::to_value(&row).unwrap();
        assert_eq!(v["query"], json!("rust"));
        assert_eq!(v["since_id"], json!("42"));
        assert_eq!(v["result_type"], json!("mixed"));
        let back: WatermarkRow = serde_json::from_value(v).unwrap();
        assert_eq!(back.filter, Filter::query("rust"));
    }

    #[tokio::test]
    async fn corrupt_watermark_file_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("queries.json"), "{not json").unwrap();
        assert!(FileStore::open(dir.path(), "queries", "tweets").is_err());
    }
}
