//! Pending-operation ledger.
//!
//! While a model download or image distribution is running nothing is visible on the
//! cluster yet (no container, no VRAM in use), so a status query would report idle
//! hosts. Distribution commands therefore drop a small JSON record into
//! `<cache_dir>/pending/` for as long as they run.
//!
//! Records are advisory. Writing or removing one never fails the operation it
//! describes. A record is removed when its `PendingGuard` drops; records left behind by
//! a process that died without unwinding are pruned by `list_active`, which checks
//! whether the owning pid is still alive.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DistError, Result};
use crate::probe::{ProcessProbe, SystemProbe};

pub const PENDING_DIR_NAME: &str = "pending";

/// Display metadata attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingInfo {
    #[serde(default)]
    pub recipe: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// On-disk record of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub cluster_id: String,
    /// Short tag such as `model_download` or `image_distribute`.
    pub operation: String,
    pub pid: u32,
    /// Seconds since the Unix epoch.
    pub started_at: f64,
    #[serde(flatten)]
    pub info: PendingInfo,
}

/// A record whose owner is still running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveOp {
    #[serde(flatten)]
    pub record: PendingRecord,
    pub elapsed_seconds: f64,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Removes `path`, treating a missing file as success.
fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove pending-op record {}: {}", path.display(), e),
    }
}

pub struct PendingLedger {
    dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl PendingLedger {
    /// Ledger under `<cache_dir>/pending`, checking liveness with the OS.
    pub fn new(cache_dir: &Path) -> Self {
        Self::with_probe(cache_dir.join(PENDING_DIR_NAME), Arc::new(SystemProbe))
    }

    pub fn with_probe(dir: PathBuf, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { dir, probe }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, cluster_id: &str, operation: &str) -> PathBuf {
        let safe_cluster = cluster_id.replace('/', "_");
        self.dir.join(format!("{}_{}.json", safe_cluster, operation))
    }

    fn write_record(&self, path: &Path, record: &PendingRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        // Write-then-rename so a concurrent sweep never sees a half-written record
        // and deletes it as corrupt.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", file_name, std::process::id()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string(record)?.as_bytes())?;
        file.sync_all()?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, path) {
            remove_quietly(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Writes the record for `(cluster_id, operation)` owned by this process.
    /// Failures are logged, never returned.
    pub fn record(&self, cluster_id: &str, operation: &str, info: PendingInfo) -> PathBuf {
        let path = self.record_path(cluster_id, operation);
        let record = PendingRecord {
            cluster_id: cluster_id.to_owned(),
            operation: operation.to_owned(),
            pid: std::process::id(),
            started_at: now_epoch(),
            info,
        };
        match self.write_record(&path, &record) {
            Ok(()) => debug!("Recorded pending operation {}", path.display()),
            Err(e) => warn!("Could not write pending-op record {}: {}", path.display(), e),
        }
        path
    }

    /// Removes the record for `(cluster_id, operation)`, if any.
    pub fn end(&self, cluster_id: &str, operation: &str) {
        remove_quietly(&self.record_path(cluster_id, operation));
    }

    /// Records the operation and returns a guard that removes the record on drop.
    #[must_use = "the record is removed as soon as the guard is dropped"]
    pub fn begin(&self, cluster_id: &str, operation: &str, info: PendingInfo) -> PendingGuard {
        PendingGuard {
            path: self.record(cluster_id, operation, info),
        }
    }

    /// All operations whose owning process is alive, oldest first.
    ///
    /// Reading is also a sweep: records of dead processes and unparsable records are
    /// deleted.
    pub fn list_active(&self) -> Vec<ActiveOp> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let now = now_epoch();
        let mut ops = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let record: PendingRecord = match fs::read_to_string(&path)
                .map_err(DistError::from)
                .and_then(|text| serde_json::from_str(&text).map_err(DistError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    debug!("Removing corrupt pending-op record {}: {}", path.display(), e);
                    remove_quietly(&path);
                    continue;
                }
            };
            if !self.probe.is_alive(record.pid) {
                debug!(
                    "Pruning stale pending-op record {} (pid {})",
                    path.display(),
                    record.pid
                );
                remove_quietly(&path);
                continue;
            }
            let elapsed = ((now - record.started_at).max(0.0) * 10.0).round() / 10.0;
            ops.push(ActiveOp {
                record,
                elapsed_seconds: elapsed,
            });
        }
        ops.sort_by(|a, b| a.record.started_at.total_cmp(&b.record.started_at));
        ops
    }
}

/// Keeps a pending-op record alive; removes it when dropped.
#[derive(Debug)]
pub struct PendingGuard {
    path: PathBuf,
}

impl PendingGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        remove_quietly(&self.path);
    }
}
