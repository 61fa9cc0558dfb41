use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use ckpt_lib::{AttrTree, CkptError, CkptResult};

use crate::FileMap;

const DESC_KEY_INDEX: &str = "INDEX";
const DESC_KEY_BASE: &str = "BASE";
const DESC_KEY_INTERVAL: &str = "INTERVAL";

/// Describes the redundancy scheme applied to checkpoints it covers and the
/// cache base those checkpoints live under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedDescriptor {
    pub index: u32,
    pub base: PathBuf,
    /// Covers every checkpoint whose id is a multiple of this interval.
    pub interval: u64,
}

impl RedDescriptor {
    /// Snapshot stored in the file map alongside the dataset it was used for.
    pub fn to_tree(&self) -> AttrTree {
        let mut tree = AttrTree::new();
        tree.set_unsigned(DESC_KEY_INDEX, self.index as u64);
        tree.set_str(DESC_KEY_BASE, &self.base.to_string_lossy());
        tree.set_unsigned(DESC_KEY_INTERVAL, self.interval);
        tree
    }

    pub fn from_tree(tree: &AttrTree) -> CkptResult<RedDescriptor> {
        Ok(RedDescriptor {
            index: tree.get_unsigned(DESC_KEY_INDEX)? as u32,
            base: PathBuf::from(tree.get_str(DESC_KEY_BASE)?),
            interval: tree.get_unsigned(DESC_KEY_INTERVAL)?,
        })
    }
}

/// Registry of descriptors, keyed by checkpoint id at lookup time.
#[derive(Debug, Clone)]
pub struct RedDescriptorSet {
    descs: Vec<RedDescriptor>,
}

impl RedDescriptorSet {
    pub fn new(descs: Vec<RedDescriptor>) -> CkptResult<RedDescriptorSet> {
        if descs.is_empty() {
            return Err(CkptError::InvalidParam(
                "at least one redundancy descriptor is required".to_string(),
            ));
        }
        if descs.iter().any(|d| d.interval == 0) {
            return Err(CkptError::InvalidParam(
                "descriptor interval must be positive".to_string(),
            ));
        }
        Ok(RedDescriptorSet { descs })
    }

    /// Highest-index descriptor whose interval divides the checkpoint id,
    /// falling back to descriptor 0.
    pub fn descriptor_for_checkpoint(&self, checkpoint_id: u64) -> &RedDescriptor {
        self.descs
            .iter()
            .rev()
            .find(|d| checkpoint_id % d.interval == 0)
            .unwrap_or(&self.descs[0])
    }
}

/// Applied after every file of a dataset has been fetched into cache.
/// Reports the number of bytes this rank holds for the dataset.
#[async_trait]
pub trait Redundancy: Send + Sync {
    async fn apply(
        &self,
        map: &FileMap,
        desc: &RedDescriptor,
        dataset_id: u64,
        rank: u32,
    ) -> CkptResult<u64>;
}

/// Single-copy scheme: verifies that every file recorded for the rank is
/// present, complete, and of the recorded size.
pub struct SingleRedundancy;

#[async_trait]
impl Redundancy for SingleRedundancy {
    async fn apply(
        &self,
        map: &FileMap,
        _desc: &RedDescriptor,
        dataset_id: u64,
        rank: u32,
    ) -> CkptResult<u64> {
        let metas = map.metas(dataset_id, rank);
        if let Some(expected) = map.expected_files(dataset_id, rank) {
            if expected != metas.len() as u64 {
                return Err(CkptError::InvalidState(format!(
                    "dataset {} rank {}: expected {} files, map lists {}",
                    dataset_id,
                    rank,
                    expected,
                    metas.len()
                )));
            }
        }

        let mut bytes = 0u64;
        for (path, meta) in metas {
            let meta = meta.ok_or_else(|| {
                CkptError::InvalidState(format!("no metadata recorded for {}", path))
            })?;
            if !meta.complete {
                return Err(CkptError::InvalidState(format!("{} is incomplete", path)));
            }
            let on_disk = fs::metadata(&path)
                .await
                .map_err(|e| CkptError::IoError(format!("stat {}: {}", path, e)))?;
            if on_disk.len() != meta.size {
                return Err(CkptError::InvalidState(format!(
                    "{}: size {} on disk, {} recorded",
                    path,
                    on_disk.len(),
                    meta.size
                )));
            }
            bytes += meta.size;
        }
        Ok(bytes)
    }
}
