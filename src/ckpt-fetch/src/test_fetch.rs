use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use crc32fast::Hasher;
use tempfile::TempDir;

use ckpt_lib::{
    AttrTree, CkptError, CkptResult, Fabric, LocalFabric, DATASET_KEY_CKPT, DATASET_KEY_ID,
    DATASET_KEY_NAME, KEY_CONTAINER, KEY_CRC, KEY_DATASET, KEY_FILE, KEY_ID, KEY_LENGTH, KEY_NAME,
    KEY_OFFSET, KEY_RANK, KEY_RANK2FILE, KEY_RANKS, KEY_SEGMENT, KEY_SIZE, KEY_VERSION,
    SUMMARY_FILE_VERSION,
};
use ckpt_store::{
    read_current, FileMap, FlushFile, FlushLocation, IndexEntry, IndexFile, RedDescriptor,
    RedDescriptorSet, Redundancy, SingleRedundancy,
};

use crate::{
    Coordinator, FetchConfig, FetchContext, FetchSyncOutcome, LogSink, Role, SummaryDoc,
};

fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn rank_payload(rank: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32 * 31 + rank * 7 + 3) % 256) as u8)
        .collect()
}

async fn write_index(prefix: &Path, checkpoints: &[(u64, &str)]) {
    let mut index = IndexFile::new();
    for (dataset_id, dir) in checkpoints {
        index.add_entry(IndexEntry {
            dataset_id: *dataset_id,
            dir: dir.to_string(),
            name: dir.to_string(),
            complete: true,
            failed: None,
            fetched: Vec::new(),
        });
    }
    index.write(prefix).await.unwrap();
}

/// Checkpoint with one native file per rank. `corrupt_rank` stores a wrong
/// CRC for that rank's file; `omit_ckpt_id` drops the checkpoint id from
/// the dataset header.
async fn write_native_checkpoint(
    prefix: &Path,
    dir_name: &str,
    dataset_id: u64,
    world: u32,
    len: usize,
    corrupt_rank: Option<u32>,
    omit_ckpt_id: bool,
) {
    let dir = prefix.join(dir_name);
    tokio::fs::create_dir_all(&dir).await.unwrap();

    let mut tree = AttrTree::new();
    tree.set_unsigned(KEY_VERSION, SUMMARY_FILE_VERSION);
    let dataset = tree.ensure(KEY_DATASET);
    dataset.set_unsigned(DATASET_KEY_ID, dataset_id);
    if !omit_ckpt_id {
        dataset.set_unsigned(DATASET_KEY_CKPT, dataset_id);
    }
    dataset.set_str(DATASET_KEY_NAME, dir_name);

    let rank2file = tree.ensure(KEY_RANK2FILE);
    rank2file.set_unsigned(KEY_RANKS, world as u64);
    for rank in 0..world {
        let name = format!("rank_{}.dat", rank);
        let data = rank_payload(rank, len);
        tokio::fs::write(dir.join(&name), &data).await.unwrap();

        let crc = if corrupt_rank == Some(rank) {
            !crc_of(&data)
        } else {
            crc_of(&data)
        };
        let file = rank2file
            .ensure(KEY_RANK)
            .ensure(&rank.to_string())
            .ensure(KEY_FILE)
            .ensure(&name);
        file.set_unsigned(KEY_SIZE, len as u64);
        file.set_crc32(KEY_CRC, crc);
    }
    SummaryDoc::from_tree(tree).write(&dir).await.unwrap();
}

/// Checkpoint packed into a single container. Each spec is
/// (rank, file name, offset, length) into `pack`.
async fn write_container_checkpoint(
    prefix: &Path,
    dir_name: &str,
    dataset_id: u64,
    world: u32,
    pack: &[u8],
    specs: &[(u32, &str, u64, u64)],
) {
    let dir = prefix.join(dir_name);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let pack_path = dir.join("pack.bin");
    tokio::fs::write(&pack_path, pack).await.unwrap();

    let mut tree = AttrTree::new();
    tree.set_unsigned(KEY_VERSION, SUMMARY_FILE_VERSION);
    let dataset = tree.ensure(KEY_DATASET);
    dataset.set_unsigned(DATASET_KEY_ID, dataset_id);
    dataset.set_unsigned(DATASET_KEY_CKPT, dataset_id);
    dataset.set_str(DATASET_KEY_NAME, dir_name);

    let container = tree.ensure(KEY_CONTAINER).ensure("0");
    container.set_str(KEY_NAME, &pack_path.to_string_lossy());
    container.set_bytecount(KEY_SIZE, pack.len() as u64);

    let rank2file = tree.ensure(KEY_RANK2FILE);
    rank2file.set_unsigned(KEY_RANKS, world as u64);
    for (rank, name, offset, length) in specs {
        let end = (offset + length) as usize;
        let crc = if end <= pack.len() {
            crc_of(&pack[*offset as usize..end])
        } else {
            0x1 // unreadable range, never compared
        };
        let file = rank2file
            .ensure(KEY_RANK)
            .ensure(&rank.to_string())
            .ensure(KEY_FILE)
            .ensure(name);
        file.set_unsigned(KEY_SIZE, *length);
        file.set_crc32(KEY_CRC, crc);
        let segment = file.ensure(KEY_SEGMENT).ensure("0");
        segment.set_bytecount(KEY_LENGTH, *length);
        segment.ensure(KEY_CONTAINER).set_unsigned(KEY_ID, 0);
        segment.ensure(KEY_CONTAINER).set_bytecount(KEY_OFFSET, *offset);
    }
    SummaryDoc::from_tree(tree).write(&dir).await.unwrap();
}

struct RankResult {
    outcome: FetchSyncOutcome,
    map: FileMap,
    cache_base: PathBuf,
}

async fn run_rank(
    fabric: LocalFabric,
    prefix: PathBuf,
    scratch: PathBuf,
    config: FetchConfig,
    redundancy: Arc<dyn Redundancy>,
) -> RankResult {
    let rank = fabric.rank();
    let rank_base = scratch.join(format!("rank_{}", rank));
    tokio::fs::create_dir_all(&rank_base).await.unwrap();
    let cache_base = rank_base.join("cache");
    let map_path = rank_base.join("filemap.json");

    let descriptors = RedDescriptorSet::new(vec![RedDescriptor {
        index: 0,
        base: cache_base.clone(),
        interval: 1,
    }])
    .unwrap();

    let role = if rank == 0 {
        Role::Coordinator(Coordinator {
            prefix: prefix.clone(),
            sink: Arc::new(LogSink),
            flush: FlushFile::load(&prefix.join("flush.json")).await.unwrap(),
        })
    } else {
        Role::Worker
    };

    let mut ctx = FetchContext {
        fabric: Arc::new(fabric),
        config,
        map_path: map_path.clone(),
        descriptors,
        redundancy,
        role,
    };
    let mut map = FileMap::read(&map_path).await.unwrap();
    let outcome = ctx.fetch_sync(&mut map).await.unwrap();
    RankResult {
        outcome,
        map,
        cache_base,
    }
}

async fn run_world(
    world: u32,
    prefix: &Path,
    scratch: &Path,
    config: FetchConfig,
) -> Vec<RankResult> {
    run_world_with(world, prefix, scratch, config, Arc::new(SingleRedundancy)).await
}

async fn run_world_with(
    world: u32,
    prefix: &Path,
    scratch: &Path,
    config: FetchConfig,
    redundancy: Arc<dyn Redundancy>,
) -> Vec<RankResult> {
    let mut handles = Vec::new();
    for fabric in LocalFabric::world(world) {
        handles.push(tokio::spawn(run_rank(
            fabric,
            prefix.to_path_buf(),
            scratch.to_path_buf(),
            config.clone(),
            redundancy.clone(),
        )));
    }
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test]
async fn test_fetch_native_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    write_native_checkpoint(&prefix, "ckpt.1", 1, 4, 1024, None, false).await;
    write_index(&prefix, &[(1, "ckpt.1")]).await;

    let results = run_world(4, &prefix, &scratch, FetchConfig::default()).await;
    for (rank, result) in results.iter().enumerate() {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Fetched {
                dataset_id: 1,
                checkpoint_id: 1,
                attempted: true,
            }
        );

        let cached = result.cache_base.join("ckpt.1").join(format!("rank_{}.dat", rank));
        assert_eq!(
            tokio::fs::read(&cached).await.unwrap(),
            rank_payload(rank as u32, 1024)
        );

        let meta = result.map.get_meta(1, rank as u32, &cached).unwrap();
        assert!(meta.complete);
        assert_eq!(meta.size, 1024);
        assert_eq!(meta.crc32, Some(crc_of(&rank_payload(rank as u32, 1024))));
        assert_eq!(result.map.expected_files(1, rank as u32), Some(1));
    }

    assert_eq!(read_current(&prefix).await, Some("ckpt.1".to_string()));

    let flush = FlushFile::load(&prefix.join("flush.json")).await.unwrap();
    assert_eq!(
        flush.locations(1),
        vec![FlushLocation::Cache, FlushLocation::Pfs]
    );

    // the index recorded the fetch attempt
    let index = IndexFile::read(&prefix).await.unwrap();
    assert_eq!(index.entries()[0].fetched.len(), 1);
    assert!(index.entries()[0].failed.is_none());
}

#[tokio::test]
async fn test_fetch_container_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    let pack: Vec<u8> = (0..4096u32).map(|i| (i * 13 % 256) as u8).collect();
    write_container_checkpoint(
        &prefix,
        "ckpt.1",
        1,
        2,
        &pack,
        &[(0, "a", 0, 1500), (1, "b", 1500, 2596)],
    )
    .await;
    write_index(&prefix, &[(1, "ckpt.1")]).await;

    let results = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    assert!(matches!(
        results[0].outcome,
        FetchSyncOutcome::Fetched { dataset_id: 1, .. }
    ));

    let a = results[0].cache_base.join("ckpt.1").join("a");
    assert_eq!(tokio::fs::read(&a).await.unwrap(), pack[0..1500].to_vec());
    let b = results[1].cache_base.join("ckpt.1").join("b");
    assert_eq!(tokio::fs::read(&b).await.unwrap(), pack[1500..4096].to_vec());

    assert!(results[0].map.get_meta(1, 0, &a).unwrap().complete);
    assert!(results[1].map.get_meta(1, 1, &b).unwrap().complete);
}

#[tokio::test]
async fn test_corrupt_checkpoint_falls_back_to_older() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    write_native_checkpoint(&prefix, "ckpt.1", 1, 2, 512, None, false).await;
    // newer checkpoint has a bad stored crc on rank 1
    write_native_checkpoint(&prefix, "ckpt.2", 2, 2, 512, Some(1), false).await;
    write_index(&prefix, &[(1, "ckpt.1"), (2, "ckpt.2")]).await;

    let results = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    for result in &results {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Fetched {
                dataset_id: 1,
                checkpoint_id: 1,
                attempted: true,
            }
        );
        // the failed dataset was purged from the map
        assert!(!result.map.has_dataset(2));
    }

    assert_eq!(read_current(&prefix).await, Some("ckpt.1".to_string()));

    let index = IndexFile::read(&prefix).await.unwrap();
    let ckpt2 = index.entries().iter().find(|e| e.dataset_id == 2).unwrap();
    assert!(ckpt2.failed.is_some());
    assert_eq!(ckpt2.fetched.len(), 1);
    let ckpt1 = index.entries().iter().find(|e| e.dataset_id == 1).unwrap();
    assert!(ckpt1.failed.is_none());
    assert_eq!(ckpt1.fetched.len(), 1);
}

#[tokio::test]
async fn test_missing_checkpoint_id_fails_fast() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    write_native_checkpoint(&prefix, "ckpt.1", 1, 2, 256, None, true).await;
    write_index(&prefix, &[(1, "ckpt.1")]).await;

    let results = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    for result in &results {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Exhausted { attempted: true }
        );
        // validation fails before any cache state is touched
        assert!(!result.cache_base.exists());
        assert!(result.map.dataset_ids().is_empty());
    }

    let index = IndexFile::read(&prefix).await.unwrap();
    assert!(index.entries()[0].failed.is_some());
    assert!(read_current(&prefix).await.is_none());
}

#[tokio::test]
async fn test_out_of_range_segment_fails_globally() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    let pack = vec![0x42u8; 1024];
    // rank 1's segment runs past the end of the container
    write_container_checkpoint(
        &prefix,
        "ckpt.1",
        1,
        2,
        &pack,
        &[(0, "a", 0, 512), (1, "b", 512, 1024)],
    )
    .await;
    write_index(&prefix, &[(1, "ckpt.1")]).await;

    let results = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    for result in &results {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Exhausted { attempted: true }
        );
        // the partial dataset was purged
        assert!(result.map.dataset_ids().is_empty());
        assert!(!result.cache_base.join("ckpt.1").exists());
    }

    let index = IndexFile::read(&prefix).await.unwrap();
    assert!(index.entries()[0].failed.is_some());
}

#[tokio::test]
async fn test_refetch_reselects_current() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    write_native_checkpoint(&prefix, "ckpt.3", 3, 2, 640, None, false).await;
    write_index(&prefix, &[(3, "ckpt.3")]).await;

    let first = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    assert!(matches!(
        first[0].outcome,
        FetchSyncOutcome::Fetched { dataset_id: 3, .. }
    ));

    // second run selects the same checkpoint through `current` and ends in
    // the same on-disk state
    let second = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    for (rank, result) in second.iter().enumerate() {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Fetched {
                dataset_id: 3,
                checkpoint_id: 3,
                attempted: true,
            }
        );
        let cached = result.cache_base.join("ckpt.3").join(format!("rank_{}.dat", rank));
        assert_eq!(
            tokio::fs::read(&cached).await.unwrap(),
            rank_payload(rank as u32, 640)
        );
    }
    assert_eq!(read_current(&prefix).await, Some("ckpt.3".to_string()));

    let index = IndexFile::read(&prefix).await.unwrap();
    assert_eq!(index.entries()[0].fetched.len(), 2);
}

#[tokio::test]
async fn test_window_width_extremes_agree() {
    let temp_dir = TempDir::new().unwrap();

    let mut states = Vec::new();
    for width in [1u32, 64] {
        let prefix = temp_dir.path().join(format!("prefix_{}", width));
        let scratch = temp_dir.path().join(format!("scratch_{}", width));
        tokio::fs::create_dir_all(&prefix).await.unwrap();
        write_native_checkpoint(&prefix, "ckpt.1", 1, 4, 2048, None, false).await;
        write_index(&prefix, &[(1, "ckpt.1")]).await;

        let config = FetchConfig {
            fetch_width: width,
            ..FetchConfig::default()
        };
        let results = run_world(4, &prefix, &scratch, config).await;

        let mut state = Vec::new();
        for (rank, result) in results.iter().enumerate() {
            assert!(matches!(
                result.outcome,
                FetchSyncOutcome::Fetched { dataset_id: 1, .. }
            ));
            let cached = result.cache_base.join("ckpt.1").join(format!("rank_{}.dat", rank));
            state.push(tokio::fs::read(&cached).await.unwrap());
        }
        states.push(state);
    }
    assert_eq!(states[0], states[1]);
}

#[tokio::test]
async fn test_empty_prefix_is_not_an_attempt() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    let results = run_world(2, &prefix, &scratch, FetchConfig::default()).await;
    for result in &results {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Exhausted { attempted: false }
        );
    }
}

struct FailingRedundancy;

#[async_trait]
impl Redundancy for FailingRedundancy {
    async fn apply(
        &self,
        _map: &FileMap,
        _desc: &RedDescriptor,
        _dataset_id: u64,
        _rank: u32,
    ) -> CkptResult<u64> {
        Err(CkptError::InvalidState("injected apply failure".to_string()))
    }
}

#[tokio::test]
async fn test_redundancy_failure_does_not_retry_older() {
    let temp_dir = TempDir::new().unwrap();
    let prefix = temp_dir.path().join("prefix");
    let scratch = temp_dir.path().join("scratch");
    tokio::fs::create_dir_all(&prefix).await.unwrap();

    write_native_checkpoint(&prefix, "ckpt.1", 1, 2, 128, None, false).await;
    write_native_checkpoint(&prefix, "ckpt.2", 2, 2, 128, None, false).await;
    write_index(&prefix, &[(1, "ckpt.1"), (2, "ckpt.2")]).await;

    let results = run_world_with(
        2,
        &prefix,
        &scratch,
        FetchConfig::default(),
        Arc::new(FailingRedundancy),
    )
    .await;
    for result in &results {
        assert_eq!(
            result.outcome,
            FetchSyncOutcome::Exhausted { attempted: true }
        );
        // cache was purged after the post-fetch failure
        assert!(result.map.dataset_ids().is_empty());
    }

    let index = IndexFile::read(&prefix).await.unwrap();
    // the checkpoint itself is fine on the PFS: not marked failed, and the
    // older checkpoint was never tried
    let ckpt2 = index.entries().iter().find(|e| e.dataset_id == 2).unwrap();
    assert!(ckpt2.failed.is_none());
    assert_eq!(ckpt2.fetched.len(), 1);
    let ckpt1 = index.entries().iter().find(|e| e.dataset_id == 1).unwrap();
    assert!(ckpt1.fetched.is_empty());
}
