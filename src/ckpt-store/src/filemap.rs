use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use ckpt_lib::{AttrTree, CkptError, CkptResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Full,
    Partner,
    Xor,
}

/// Metadata recorded for one fetched file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub filename: String,
    pub kind: FileKind,
    pub size: u64,
    pub complete: bool,
    pub ranks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankFiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_files: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red_desc: Option<AttrTree>,
    /// A path is registered here (with no meta yet) before any byte of the
    /// file hits disk, so a crashed fetch can be cleaned up on restart.
    #[serde(default)]
    pub files: BTreeMap<String, Option<FileMeta>>,
}

/// Persistent per-rank record of the files held in cache for each dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMap {
    #[serde(default)]
    datasets: BTreeMap<u64, BTreeMap<u32, RankFiles>>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn rank_entry(&mut self, dataset_id: u64, rank: u32) -> &mut RankFiles {
        self.datasets
            .entry(dataset_id)
            .or_default()
            .entry(rank)
            .or_default()
    }

    pub fn rank_files(&self, dataset_id: u64, rank: u32) -> Option<&RankFiles> {
        self.datasets.get(&dataset_id).and_then(|r| r.get(&rank))
    }

    /// Register a file path with no metadata yet.
    pub fn add_file(&mut self, dataset_id: u64, rank: u32, path: &Path) {
        self.rank_entry(dataset_id, rank)
            .files
            .entry(path.to_string_lossy().to_string())
            .or_insert(None);
    }

    pub fn set_meta(&mut self, dataset_id: u64, rank: u32, path: &Path, meta: FileMeta) {
        self.rank_entry(dataset_id, rank)
            .files
            .insert(path.to_string_lossy().to_string(), Some(meta));
    }

    pub fn get_meta(&self, dataset_id: u64, rank: u32, path: &Path) -> Option<&FileMeta> {
        self.rank_files(dataset_id, rank)
            .and_then(|rf| rf.files.get(path.to_string_lossy().as_ref()))
            .and_then(|m| m.as_ref())
    }

    pub fn set_expected_files(&mut self, dataset_id: u64, rank: u32, count: u64) {
        self.rank_entry(dataset_id, rank).expected_files = Some(count);
    }

    pub fn expected_files(&self, dataset_id: u64, rank: u32) -> Option<u64> {
        self.rank_files(dataset_id, rank)
            .and_then(|rf| rf.expected_files)
    }

    pub fn set_desc(&mut self, dataset_id: u64, rank: u32, desc: AttrTree) {
        self.rank_entry(dataset_id, rank).red_desc = Some(desc);
    }

    pub fn desc(&self, dataset_id: u64, rank: u32) -> Option<&AttrTree> {
        self.rank_files(dataset_id, rank)
            .and_then(|rf| rf.red_desc.as_ref())
    }

    pub fn file_paths(&self, dataset_id: u64, rank: u32) -> Vec<String> {
        self.rank_files(dataset_id, rank)
            .map(|rf| rf.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metas(&self, dataset_id: u64, rank: u32) -> Vec<(String, Option<FileMeta>)> {
        self.rank_files(dataset_id, rank)
            .map(|rf| {
                rf.files
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_dataset(&self, dataset_id: u64) -> bool {
        self.datasets.contains_key(&dataset_id)
    }

    pub fn dataset_ids(&self) -> Vec<u64> {
        self.datasets.keys().copied().collect()
    }

    /// Drop every record for `dataset_id`, all ranks.
    pub fn remove_dataset(&mut self, dataset_id: u64) {
        self.datasets.remove(&dataset_id);
    }

    /// Missing file reads back as an empty map.
    pub async fn read(path: &Path) -> CkptResult<FileMap> {
        match fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| CkptError::DecodeError(format!("file map {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileMap::new()),
            Err(e) => Err(CkptError::IoError(format!(
                "read file map {}: {}",
                path.display(),
                e
            ))),
        }
    }

    pub async fn write(&self, path: &Path) -> CkptResult<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| CkptError::Internal(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data.as_bytes()).await.map_err(|e| {
            CkptError::IoError(format!("write file map {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, path).await.map_err(|e| {
            CkptError::IoError(format!("rename file map {}: {}", path.display(), e))
        })
    }
}
