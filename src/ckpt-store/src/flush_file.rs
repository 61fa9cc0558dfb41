use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use ckpt_lib::{CkptError, CkptResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlushLocation {
    Cache,
    Pfs,
    Flushing,
}

/// Tracks where each dataset currently resides. The fetch core only mutates
/// locations; readers live on the flush side.
#[derive(Debug)]
pub struct FlushFile {
    path: PathBuf,
    datasets: BTreeMap<u64, BTreeSet<FlushLocation>>,
}

impl FlushFile {
    pub async fn load(path: &Path) -> CkptResult<FlushFile> {
        let datasets = match fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                CkptError::DecodeError(format!("flush file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CkptError::IoError(format!(
                    "read flush file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Ok(FlushFile {
            path: path.to_path_buf(),
            datasets,
        })
    }

    pub fn locations(&self, dataset_id: u64) -> Vec<FlushLocation> {
        self.datasets
            .get(&dataset_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn set_location(&mut self, dataset_id: u64, loc: FlushLocation) -> CkptResult<()> {
        self.datasets.entry(dataset_id).or_default().insert(loc);
        self.persist().await
    }

    pub async fn unset_location(&mut self, dataset_id: u64, loc: FlushLocation) -> CkptResult<()> {
        if let Some(set) = self.datasets.get_mut(&dataset_id) {
            set.remove(&loc);
            if set.is_empty() {
                self.datasets.remove(&dataset_id);
            }
        }
        self.persist().await
    }

    async fn persist(&self) -> CkptResult<()> {
        let data = serde_json::to_string_pretty(&self.datasets)
            .map_err(|e| CkptError::Internal(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data.as_bytes()).await.map_err(|e| {
            CkptError::IoError(format!("write flush file {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).await.map_err(|e| {
            CkptError::IoError(format!("rename flush file {}: {}", self.path.display(), e))
        })
    }
}
