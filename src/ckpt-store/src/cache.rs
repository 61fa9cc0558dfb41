use std::path::PathBuf;

use log::warn;
use tokio::fs;

use ckpt_lib::{CkptError, CkptResult};

use crate::{FileMap, RedDescriptor};

/// Per-dataset cache directories under a descriptor's base, and the cleanup
/// path that keeps the cache consistent with the file map.
pub struct CacheManager {
    rank: u32,
    map_path: PathBuf,
}

impl CacheManager {
    pub fn new(rank: u32, map_path: PathBuf) -> CacheManager {
        CacheManager { rank, map_path }
    }

    pub fn dir_for(&self, desc: &RedDescriptor, dataset_id: u64) -> PathBuf {
        desc.base.join(format!("ckpt.{}", dataset_id))
    }

    pub async fn dir_create(&self, desc: &RedDescriptor, dataset_id: u64) -> CkptResult<PathBuf> {
        let dir = self.dir_for(desc, dataset_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| CkptError::IoError(format!("create cache dir {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    /// Unlink every file the map records for this rank and dataset, drop the
    /// dataset from the map, persist it, and remove the dataset directory.
    pub async fn delete(
        &self,
        map: &mut FileMap,
        desc: &RedDescriptor,
        dataset_id: u64,
    ) -> CkptResult<()> {
        for path in map.file_paths(dataset_id, self.rank) {
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("remove cached file {}: {}", path, e);
                }
            }
        }
        map.remove_dataset(dataset_id);
        map.write(&self.map_path).await?;

        // Best effort; fails harmlessly when absent or still shared.
        let dir = self.dir_for(desc, dataset_id);
        let _ = fs::remove_dir(&dir).await;
        Ok(())
    }
}
