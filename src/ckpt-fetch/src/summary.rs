use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;
use tokio::fs;

use ckpt_lib::{
    AttrTree, CkptError, CkptResult, Fabric, DATASET_KEY_CKPT, DATASET_KEY_ID, DATASET_KEY_NAME,
    KEY_COMPLETE, KEY_CONTAINER, KEY_CRC, KEY_DATASET, KEY_FILE, KEY_ID, KEY_LENGTH, KEY_NAME,
    KEY_NOFETCH, KEY_OFFSET, KEY_PATH, KEY_RANK, KEY_RANK2FILE, KEY_RANKS, KEY_SEGMENT, KEY_SIZE,
    KEY_VERSION, SUMMARY_FILE_VERSION,
};

pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Typed view of the dataset header.
pub struct DatasetInfo<'a> {
    tree: &'a AttrTree,
}

impl<'a> DatasetInfo<'a> {
    pub fn id(&self) -> CkptResult<u64> {
        self.tree.get_unsigned(DATASET_KEY_ID)
    }

    /// Only checkpoint datasets can be fetched; a dataset without this id
    /// is rejected.
    pub fn checkpoint_id(&self) -> CkptResult<u64> {
        self.tree.get_unsigned(DATASET_KEY_CKPT)
    }

    pub fn name(&self) -> Option<&str> {
        self.tree.get_str(DATASET_KEY_NAME).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEntry {
    /// Absolute path of the packed file on the PFS.
    pub name: PathBuf,
    pub size: u64,
}

/// Container lookup by id.
#[derive(Debug, Clone, Default)]
pub struct ContainerTable {
    entries: HashMap<u64, ContainerEntry>,
}

impl ContainerTable {
    pub fn from_entries(entries: HashMap<u64, ContainerEntry>) -> ContainerTable {
        ContainerTable { entries }
    }

    pub fn from_tree(tree: &AttrTree) -> CkptResult<ContainerTable> {
        let mut entries = HashMap::new();
        for (key, sub) in tree.entries() {
            let id = key.parse::<u64>().map_err(|_| {
                CkptError::InvalidValue(format!("container id {} is not an integer", key))
            })?;
            entries.insert(
                id,
                ContainerEntry {
                    name: PathBuf::from(sub.get_str(KEY_NAME)?),
                    size: sub.get_bytecount(KEY_SIZE)?,
                },
            );
        }
        Ok(ContainerTable { entries })
    }

    pub fn get(&self, id: u64) -> CkptResult<&ContainerEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| CkptError::NotFound(format!("container {}", id)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One contiguous byte range of a container, reconstructing part of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSpec {
    pub index: u64,
    pub container_id: u64,
    pub offset: u64,
    pub length: u64,
}

/// Typed view of one file record in a rank's file list.
pub struct FileRecord<'a> {
    tree: &'a AttrTree,
}

impl<'a> FileRecord<'a> {
    pub fn size(&self) -> CkptResult<u64> {
        self.tree.get_unsigned(KEY_SIZE)
    }

    pub fn crc32(&self) -> Option<u32> {
        self.tree.get_crc32(KEY_CRC).ok()
    }

    /// Absence of the flag means the file is complete.
    pub fn complete(&self) -> bool {
        self.tree.get_int(KEY_COMPLETE).map(|v| v != 0).unwrap_or(true)
    }

    /// Source directory for the non-container layout.
    pub fn path(&self) -> Option<&str> {
        self.tree.get_str(KEY_PATH).ok()
    }

    pub fn nofetch(&self) -> bool {
        self.tree.get(KEY_NOFETCH).is_some()
    }

    pub fn segments(&self) -> CkptResult<Vec<SegmentSpec>> {
        let segs = self
            .tree
            .get(KEY_SEGMENT)
            .ok_or_else(|| CkptError::MissingKey(KEY_SEGMENT.to_string()))?;
        let mut out = Vec::new();
        for (key, seg) in segs.entries() {
            let index = key.parse::<u64>().map_err(|_| {
                CkptError::InvalidValue(format!("segment index {} is not an integer", key))
            })?;
            let length = seg.get_bytecount(KEY_LENGTH)?;
            let container = seg
                .get(KEY_CONTAINER)
                .ok_or_else(|| CkptError::MissingKey(KEY_CONTAINER.to_string()))?;
            out.push(SegmentSpec {
                index,
                container_id: container.get_unsigned(KEY_ID)?,
                offset: container.get_bytecount(KEY_OFFSET)?,
                length,
            });
        }
        Ok(out)
    }
}

/// Summary document of one checkpoint directory, version 6 layout.
#[derive(Debug)]
pub struct SummaryDoc {
    tree: AttrTree,
}

impl SummaryDoc {
    pub fn from_tree(tree: AttrTree) -> SummaryDoc {
        SummaryDoc { tree }
    }

    pub fn tree(&self) -> &AttrTree {
        &self.tree
    }

    pub async fn read(dir: &Path) -> CkptResult<SummaryDoc> {
        let path = dir.join(SUMMARY_FILE_NAME);
        let data = fs::read(&path)
            .await
            .map_err(|e| CkptError::IoError(format!("read summary {}: {}", path.display(), e)))?;
        let tree = AttrTree::from_bytes(&data)?;
        let version = tree.get_unsigned(KEY_VERSION)?;
        if version < SUMMARY_FILE_VERSION {
            return Err(CkptError::InvalidState(format!(
                "summary {} has version {}, need at least {}",
                path.display(),
                version,
                SUMMARY_FILE_VERSION
            )));
        }
        Ok(SummaryDoc { tree })
    }

    pub async fn write(&self, dir: &Path) -> CkptResult<()> {
        let path = dir.join(SUMMARY_FILE_NAME);
        let tmp = dir.join(format!("{}.tmp", SUMMARY_FILE_NAME));
        let data = serde_json::to_string_pretty(&self.tree)
            .map_err(|e| CkptError::Internal(e.to_string()))?;
        fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| CkptError::IoError(format!("write summary {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| CkptError::IoError(format!("rename summary {}: {}", path.display(), e)))
    }

    pub fn dataset_tree(&self) -> Option<&AttrTree> {
        self.tree.get(KEY_DATASET)
    }

    pub fn container_tree(&self) -> Option<&AttrTree> {
        self.tree.get(KEY_CONTAINER)
    }

    /// `RANK2FILE/RANK`: children keyed by target rank.
    pub fn rank_map(&self) -> Option<&AttrTree> {
        self.tree.get(KEY_RANK2FILE).and_then(|t| t.get(KEY_RANK))
    }
}

/// The per-rank result of the collective summary load: this rank's file
/// list, the dataset header, and the container table when one exists.
pub struct FileList {
    tree: AttrTree,
}

impl FileList {
    pub fn from_tree(tree: AttrTree) -> FileList {
        FileList { tree }
    }

    pub fn tree(&self) -> &AttrTree {
        &self.tree
    }

    pub fn dataset(&self) -> CkptResult<DatasetInfo<'_>> {
        self.tree
            .get(KEY_DATASET)
            .map(|tree| DatasetInfo { tree })
            .ok_or_else(|| CkptError::MissingKey(KEY_DATASET.to_string()))
    }

    pub fn containers(&self) -> CkptResult<Option<ContainerTable>> {
        match self.tree.get(KEY_CONTAINER) {
            Some(tree) => Ok(Some(ContainerTable::from_tree(tree)?)),
            None => Ok(None),
        }
    }

    pub fn files(&self) -> Vec<(&str, FileRecord<'_>)> {
        self.tree
            .get(KEY_FILE)
            .map(|files| {
                files
                    .entries()
                    .map(|(name, tree)| (name, FileRecord { tree }))
                    .collect()
            })
            .unwrap_or_default()
    }
}

async fn load_and_validate(dir: &Path, world: u32) -> CkptResult<SummaryDoc> {
    fs::metadata(dir)
        .await
        .map_err(|e| CkptError::IoError(format!("access {}: {}", dir.display(), e)))?;
    let doc = SummaryDoc::read(dir).await?;

    let dataset = doc
        .dataset_tree()
        .ok_or_else(|| CkptError::MissingKey(KEY_DATASET.to_string()))?;
    let info = DatasetInfo { tree: dataset };
    info.id()?;
    info.checkpoint_id()?;

    let rank2file = doc
        .tree
        .get(KEY_RANK2FILE)
        .ok_or_else(|| CkptError::MissingKey(KEY_RANK2FILE.to_string()))?;
    let ranks = rank2file.get_unsigned(KEY_RANKS)?;
    if ranks != world as u64 {
        return Err(CkptError::InvalidState(format!(
            "summary in {} was written by {} ranks, job has {}",
            dir.display(),
            ranks,
            world
        )));
    }
    Ok(doc)
}

/// Collective summary load.
///
/// Rank 0 parses and validates the summary document; the outcome is
/// broadcast as a single status word and on failure every rank abandons
/// the attempt. The dataset header and container table are broadcast, and
/// per-rank file lists are scattered through the exchange so each rank
/// only ever holds its own.
pub async fn fetch_summary(fabric: &dyn Fabric, dir: &Path) -> CkptResult<FileList> {
    let rank = fabric.rank();

    let doc = if rank == 0 {
        match load_and_validate(dir, fabric.world_size()).await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("summary load from {} failed: {}", dir.display(), e);
                fabric.broadcast(0, vec![0]).await?;
                return Err(e);
            }
        }
    } else {
        None
    };

    if rank == 0 {
        fabric.broadcast(0, vec![1]).await?;
    } else {
        let status = fabric.broadcast(0, Vec::new()).await?;
        if status.first().copied() != Some(1) {
            return Err(CkptError::InvalidState(format!(
                "summary load from {} failed on rank 0",
                dir.display()
            )));
        }
    }

    let mut list = AttrTree::new();

    let mut dataset = doc
        .as_ref()
        .and_then(|d| d.dataset_tree().cloned())
        .unwrap_or_default();
    dataset.broadcast(fabric, 0).await?;
    list.set(KEY_DATASET, dataset);

    let mut containers = doc
        .as_ref()
        .and_then(|d| d.container_tree().cloned())
        .unwrap_or_default();
    containers.broadcast(fabric, 0).await?;
    let have_containers = !containers.is_empty();
    if have_containers {
        list.set(KEY_CONTAINER, containers);
    }

    let send = doc
        .as_ref()
        .and_then(|d| d.rank_map().cloned())
        .unwrap_or_default();
    let recv = AttrTree::exchange(fabric, &send).await?;

    let mut files = AttrTree::new();
    for (_sender, sub) in recv.entries() {
        if let Some(f) = sub.get(KEY_FILE) {
            files.merge(f);
        }
    }
    if !have_containers {
        let dir_str = dir.to_string_lossy();
        for (_name, record) in files.entries_mut() {
            record.set_str(KEY_PATH, &dir_str);
        }
    }
    list.set(KEY_FILE, files);

    Ok(FileList::from_tree(list))
}
