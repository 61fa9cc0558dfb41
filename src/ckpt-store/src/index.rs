use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::task;

use ckpt_lib::{CkptError, CkptResult};

pub const INDEX_FILE_NAME: &str = "index.json";
pub const INDEX_LOCK_NAME: &str = "index.lock";
pub const CURRENT_LINK_NAME: &str = "current";

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One checkpoint known to the prefix directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub dataset_id: u64,
    /// Subdirectory under the prefix holding this checkpoint.
    pub dir: String,
    pub name: String,
    pub complete: bool,
    /// Time at which a fetch of this checkpoint failed, if one ever did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    /// Times at which a fetch of this checkpoint was attempted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetched: Vec<u64>,
}

/// Catalog of checkpoints persisted under the PFS prefix directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

impl IndexFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Read the catalog from the prefix directory. The blocking read runs
    /// on the blocking pool, off the async executor.
    pub async fn read(prefix: &Path) -> CkptResult<IndexFile> {
        let prefix = prefix.to_path_buf();
        task::spawn_blocking(move || Self::read_blocking(&prefix))
            .await
            .map_err(|e| CkptError::Internal(format!("index read task: {}", e)))?
    }

    fn read_blocking(prefix: &Path) -> CkptResult<IndexFile> {
        let path = prefix.join(INDEX_FILE_NAME);
        let data = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CkptError::NotFound(format!("index file {}", path.display()))
            } else {
                CkptError::IoError(format!("read index {}: {}", path.display(), e))
            }
        })?;
        serde_json::from_str(&data)
            .map_err(|e| CkptError::DecodeError(format!("index {}: {}", path.display(), e)))
    }

    /// The index is shared on the PFS, so writes take an advisory lock on a
    /// sibling lock file and go through a tmp + rename. The lock acquisition
    /// blocks, so the whole write runs on the blocking pool.
    pub async fn write(&self, prefix: &Path) -> CkptResult<()> {
        let index = self.clone();
        let prefix = prefix.to_path_buf();
        task::spawn_blocking(move || index.write_blocking(&prefix))
            .await
            .map_err(|e| CkptError::Internal(format!("index write task: {}", e)))?
    }

    fn write_blocking(&self, prefix: &Path) -> CkptResult<()> {
        let lock_path = prefix.join(INDEX_LOCK_NAME);
        let lock = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                CkptError::IoError(format!("open index lock {}: {}", lock_path.display(), e))
            })?;
        lock.lock_exclusive().map_err(|e| {
            CkptError::IoError(format!("lock index {}: {}", lock_path.display(), e))
        })?;

        let path = prefix.join(INDEX_FILE_NAME);
        let tmp = prefix.join(format!("{}.tmp", INDEX_FILE_NAME));
        let result = (|| -> CkptResult<()> {
            let data = serde_json::to_string_pretty(self)
                .map_err(|e| CkptError::Internal(e.to_string()))?;
            let mut file = fs::File::create(&tmp).map_err(|e| {
                CkptError::IoError(format!("create index {}: {}", tmp.display(), e))
            })?;
            file.write_all(data.as_bytes()).map_err(|e| {
                CkptError::IoError(format!("write index {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                CkptError::IoError(format!("rename index {}: {}", path.display(), e))
            })
        })();

        if let Err(e) = lock.unlock() {
            warn!("unlock index {}: {}", lock_path.display(), e);
        }
        result
    }

    pub fn get_id_by_dir(&self, dir: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.dir == dir)
            .map(|e| e.dataset_id)
    }

    /// Most recent complete checkpoint that has never failed a fetch, with
    /// `dataset_id` strictly below `older_than` when a bound is given.
    pub fn get_most_recent_complete(&self, older_than: Option<u64>) -> Option<(u64, String)> {
        self.entries
            .iter()
            .filter(|e| e.complete && e.failed.is_none())
            .filter(|e| older_than.map_or(true, |bound| e.dataset_id < bound))
            .max_by_key(|e| e.dataset_id)
            .map(|e| (e.dataset_id, e.dir.clone()))
    }

    pub fn mark_fetched(&mut self, dataset_id: u64, dir: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.dataset_id == dataset_id && e.dir == dir)
        {
            entry.fetched.push(unix_timestamp());
        }
    }

    pub fn mark_failed(&mut self, dataset_id: u64, dir: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.dataset_id == dataset_id && e.dir == dir)
        {
            entry.failed = Some(unix_timestamp());
        }
    }
}

/// Target of the `current` symlink, if it resolves.
pub async fn read_current(prefix: &Path) -> Option<String> {
    let link = prefix.join(CURRENT_LINK_NAME);
    task::spawn_blocking(move || {
        fs::read_link(&link)
            .ok()
            .map(|t| t.to_string_lossy().to_string())
    })
    .await
    .ok()
    .flatten()
}

/// Point `current` at `target` (a subdirectory name, kept relative).
pub async fn set_current(prefix: &Path, target: &str) -> CkptResult<()> {
    let link = prefix.join(CURRENT_LINK_NAME);
    let target = target.to_string();
    task::spawn_blocking(move || {
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link)
                .map_err(|e| CkptError::IoError(format!("unlink {}: {}", link.display(), e)))?;
        }
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|e| CkptError::IoError(format!("symlink {}: {}", link.display(), e)))
    })
    .await
    .map_err(|e| CkptError::Internal(format!("current link task: {}", e)))?
}

pub async fn unlink_current(prefix: &Path) {
    let link: PathBuf = prefix.join(CURRENT_LINK_NAME);
    let _ = task::spawn_blocking(move || {
        if let Err(e) = fs::remove_file(&link) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unlink {}: {}", link.display(), e);
            }
        }
    })
    .await;
}
