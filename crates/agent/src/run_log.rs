//! Per-invocation run log sinks.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use proto::RunRecord;
use uuid::Uuid;

/// Destination for finished [`RunRecord`]s.
pub trait RunLogger: Send + Sync {
    /// Persists `record` and returns the file name (or handle) it was written to.
    fn write(&self, record: &RunRecord) -> io::Result<String>;
}

/// Writes one pretty-printed JSON file per invocation.
///
/// Files are named `<UTC %Y%m%dT%H%M%SZ>-<agent>-<8 hex>.json`, so the stages
/// of one chain sort together by timestamp prefix.
#[derive(Debug, Clone)]
pub struct JsonRunLog {
    dir: PathBuf,
}

impl JsonRunLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(agent: &str) -> String {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let short_id = Uuid::new_v4().simple().to_string();
        let agent: String = agent
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{stamp}-{agent}-{}.json", &short_id[..8])
    }
}

impl RunLogger for JsonRunLog {
    fn write(&self, record: &RunRecord) -> io::Result<String> {
        std::fs::create_dir_all(&self.dir)?;
        let name = Self::file_name(&record.agent);
        let body = serde_json::to_string_pretty(record).map_err(io::Error::other)?;
        std::fs::write(self.dir.join(&name), body)?;
        Ok(name)
    }
}

/// Keeps records in memory; used when no log directory is configured.
#[derive(Debug, Default)]
pub struct InMemoryRunLog {
    records: Mutex<Vec<RunRecord>>,
}

impl InMemoryRunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RunLogger for InMemoryRunLog {
    fn write(&self, record: &RunRecord) -> io::Result<String> {
        let mut records = self.records.lock();
        records.push(record.clone());
        Ok(format!("memory-{}-{}", record.agent, records.len()))
    }
}
