use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, warn};

use ckpt_lib::{CkptError, CkptResult, Fabric};
use ckpt_store::{
    read_current, set_current, unlink_current, CacheManager, FileMap, FlushFile, FlushLocation,
    IndexFile, RedDescriptorSet, Redundancy,
};

use crate::{
    fetch_data, fetch_summary, AttemptTimer, EventSink, FetchConfig, FetchEvent, TransferRecord,
    EVENT_FETCH_FAILED, EVENT_FETCH_STARTED, EVENT_FETCH_SUCCEEDED,
};

/// Capabilities held by rank 0 only: the index catalog, the `current`
/// pointer, the flush file and the event log all live behind this so a
/// non-zero rank cannot touch them by accident.
pub struct Coordinator {
    pub prefix: PathBuf,
    pub sink: Arc<dyn EventSink>,
    pub flush: FlushFile,
}

impl Coordinator {
    fn emit(
        &self,
        name: &'static str,
        dir: &str,
        dataset_id: Option<u64>,
        elapsed: Option<Duration>,
    ) {
        self.sink.event(&FetchEvent {
            name,
            dir: dir.to_string(),
            dataset_id,
            timestamp: SystemTime::now(),
            elapsed,
        });
    }
}

pub enum Role {
    Coordinator(Coordinator),
    Worker,
}

/// Everything one rank needs to take part in `fetch_sync`.
pub struct FetchContext {
    pub fabric: Arc<dyn Fabric>,
    pub config: FetchConfig,
    /// Where this rank persists its file map.
    pub map_path: PathBuf,
    pub descriptors: RedDescriptorSet,
    pub redundancy: Arc<dyn Redundancy>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchSyncOutcome {
    Fetched {
        dataset_id: u64,
        checkpoint_id: u64,
        /// True from the first non-empty candidate selection.
        attempted: bool,
    },
    /// No candidate at all, every candidate failed, or a post-fetch step
    /// failed without another candidate being worth trying.
    Exhausted { attempted: bool },
}

enum AttemptOutcome {
    Fetched { dataset_id: u64, checkpoint_id: u64 },
    Failed { retry: bool },
}

impl FetchContext {
    fn coordinator(&self) -> Option<&Coordinator> {
        match &self.role {
            Role::Coordinator(co) => Some(co),
            Role::Worker => None,
        }
    }

    fn coordinator_mut(&mut self) -> Option<&mut Coordinator> {
        match &mut self.role {
            Role::Coordinator(co) => Some(co),
            Role::Worker => None,
        }
    }

    /// Fetch the most recent valid checkpoint from the prefix directory
    /// into cache, walking backwards through the index until one restores
    /// cleanly or the catalog is exhausted.
    pub async fn fetch_sync(&mut self, map: &mut FileMap) -> CkptResult<FetchSyncOutcome> {
        let fabric = self.fabric.clone();
        let timer = AttemptTimer::new();

        // Rank 0 reads the index once. If that fails we can still follow
        // the `current` link, but we never write an index we could not
        // read.
        let mut index: Option<IndexFile> = None;
        if let Some(co) = self.coordinator() {
            match IndexFile::read(&co.prefix).await {
                Ok(ix) => index = Some(ix),
                Err(e) => debug!("index unavailable: {}", e),
            }
        }

        let mut attempted = false;
        let mut last_checkpoint: Option<u64> = None;
        let outcome;

        loop {
            let mut target = String::new();
            let mut fetch_dir = String::new();
            let mut candidate: Option<u64> = None;

            if let Some(co) = self.coordinator() {
                if let Some(current) = read_current(&co.prefix).await {
                    target = current;
                }
                if let Some(ix) = index.as_ref() {
                    if !target.is_empty() {
                        candidate = ix.get_id_by_dir(&target);
                    } else if let Some((id, dir)) = ix.get_most_recent_complete(last_checkpoint) {
                        candidate = Some(id);
                        target = dir;
                    }
                }
                if candidate.is_some() {
                    last_checkpoint = candidate;
                }
                if !target.is_empty() {
                    attempted = true;
                    if let (Some(ix), Some(id)) = (index.as_mut(), candidate) {
                        ix.mark_fetched(id, &target);
                        if let Err(e) = ix.write(&co.prefix).await {
                            warn!("index write failed: {}", e);
                        }
                    }
                    fetch_dir = co.prefix.join(&target).to_string_lossy().to_string();
                }
            }

            match self.fetch_files(map, &mut fetch_dir).await? {
                AttemptOutcome::Fetched {
                    dataset_id,
                    checkpoint_id,
                } => {
                    if let Some(co) = self.coordinator() {
                        if let Err(e) = set_current(&co.prefix, &target).await {
                            warn!("set current link: {}", e);
                        }
                    }
                    outcome = FetchSyncOutcome::Fetched {
                        dataset_id,
                        checkpoint_id,
                        attempted,
                    };
                    break;
                }
                AttemptOutcome::Failed { retry } => {
                    if let Some(co) = self.coordinator() {
                        unlink_current(&co.prefix).await;
                        if retry && !target.is_empty() {
                            if let (Some(ix), Some(id)) = (index.as_mut(), candidate) {
                                ix.mark_failed(id, &target);
                                if let Err(e) = ix.write(&co.prefix).await {
                                    warn!("index write failed: {}", e);
                                }
                            }
                        }
                    }
                    // out of candidates, or a post-fetch failure that
                    // retrying an older checkpoint would not help
                    if fetch_dir.is_empty() || !retry {
                        outcome = FetchSyncOutcome::Exhausted { attempted };
                        break;
                    }
                }
            }
        }

        // only rank 0 knows whether a candidate was ever selected
        let flag = fabric.broadcast(0, vec![attempted as u8]).await?;
        let attempted = flag.first().copied() == Some(1);
        let outcome = match outcome {
            FetchSyncOutcome::Fetched {
                dataset_id,
                checkpoint_id,
                ..
            } => FetchSyncOutcome::Fetched {
                dataset_id,
                checkpoint_id,
                attempted,
            },
            FetchSyncOutcome::Exhausted { .. } => FetchSyncOutcome::Exhausted { attempted },
        };

        if self.coordinator().is_some() {
            debug!(
                "fetch_sync: {:?} after {:.3} secs",
                outcome,
                timer.elapsed().as_secs_f64()
            );
        }
        Ok(outcome)
    }

    /// One distributed fetch attempt against `fetch_dir`. Rank 0 passes the
    /// directory in; every other rank receives it through the broadcast and
    /// hands it back to the caller for the retry decision.
    async fn fetch_files(
        &mut self,
        map: &mut FileMap,
        fetch_dir: &mut String,
    ) -> CkptResult<AttemptOutcome> {
        let fabric = self.fabric.clone();
        let rank = fabric.rank();
        let world = fabric.world_size();

        if self.coordinator().is_some() {
            debug!("attempting fetch from {}", fetch_dir);
        }
        fabric.barrier().await?;
        let timer = AttemptTimer::new();

        let payload = fabric.broadcast(0, fetch_dir.clone().into_bytes()).await?;
        *fetch_dir = String::from_utf8(payload)
            .map_err(|e| CkptError::DecodeError(format!("fetch directory: {}", e)))?;
        if fetch_dir.is_empty() {
            return Ok(AttemptOutcome::Failed { retry: true });
        }
        let dir = PathBuf::from(fetch_dir.clone());

        if let Some(co) = self.coordinator() {
            co.emit(EVENT_FETCH_STARTED, fetch_dir, None, None);
        }

        let file_list = match fetch_summary(fabric.as_ref(), &dir).await {
            Ok(list) => list,
            Err(e) => {
                if let Some(co) = self.coordinator() {
                    debug!("failed to load summary from {}: {}", fetch_dir, e);
                    co.emit(EVENT_FETCH_FAILED, fetch_dir, None, Some(timer.elapsed()));
                }
                return Ok(AttemptOutcome::Failed { retry: true });
            }
        };

        // both ids were validated on rank 0 before the scatter
        let (dataset_id, checkpoint_id) = {
            let dataset = file_list.dataset()?;
            (dataset.id()?, dataset.checkpoint_id()?)
        };

        // Prepare cache and redundancy state. Local trouble here shows up
        // as per-file failures below, which keeps every rank in lockstep
        // for the collectives.
        let desc = self
            .descriptors
            .descriptor_for_checkpoint(checkpoint_id)
            .clone();
        let cache = CacheManager::new(rank, self.map_path.clone());
        if let Err(e) = cache.delete(map, &desc, dataset_id).await {
            warn!("cleanup of dataset {} failed: {}", dataset_id, e);
        }
        map.set_desc(dataset_id, rank, desc.to_tree());
        if let Err(e) = map.write(&self.map_path).await {
            warn!("file map write failed: {}", e);
        }
        let cache_dir = match cache.dir_create(&desc, dataset_id).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("cache dir create failed: {}", e);
                cache.dir_for(&desc, dataset_id)
            }
        };

        let ok = fetch_data(
            fabric.as_ref(),
            &file_list,
            &cache_dir,
            map,
            &self.map_path,
            &self.config,
        )
        .await?;
        if !ok {
            if let Err(e) = cache.delete(map, &desc, dataset_id).await {
                warn!("cleanup of dataset {} failed: {}", dataset_id, e);
            }
            if let Some(co) = self.coordinator() {
                debug!("one or more ranks failed to fetch from {}", fetch_dir);
                co.emit(
                    EVENT_FETCH_FAILED,
                    fetch_dir,
                    Some(dataset_id),
                    Some(timer.elapsed()),
                );
            }
            return Ok(AttemptOutcome::Failed { retry: true });
        }

        let applied = self.redundancy.apply(map, &desc, dataset_id, rank).await;
        let local_ok = match &applied {
            Ok(_) => true,
            Err(e) => {
                warn!("redundancy apply failed on rank {}: {}", rank, e);
                false
            }
        };
        let all_ok = fabric.all_and(local_ok).await?;
        if !all_ok {
            if let Err(e) = cache.delete(map, &desc, dataset_id).await {
                warn!("cleanup of dataset {} failed: {}", dataset_id, e);
            }
            if let Some(co) = self.coordinator() {
                co.emit(
                    EVENT_FETCH_FAILED,
                    fetch_dir,
                    Some(dataset_id),
                    Some(timer.elapsed()),
                );
            }
            // the checkpoint on the PFS is fine; an older one would not help
            return Ok(AttemptOutcome::Failed { retry: false });
        }

        // gather per-rank byte counts for the bandwidth record
        let local_bytes = applied.unwrap_or(0);
        let total_bytes = if rank == 0 {
            let mut total = local_bytes;
            for src in 1..world {
                let data = fabric.recv(src).await?;
                if data.len() == 8 {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&data);
                    total += u64::from_le_bytes(buf);
                }
            }
            total
        } else {
            fabric.send(0, local_bytes.to_le_bytes().to_vec()).await?;
            0
        };

        // dataset now lives in cache and still on the PFS; the PFS mark is
        // placed after redundancy-apply on purpose
        if let Some(co) = self.coordinator_mut() {
            if let Err(e) = co.flush.set_location(dataset_id, FlushLocation::Cache).await {
                warn!("flush file update failed: {}", e);
            }
            if let Err(e) = co.flush.set_location(dataset_id, FlushLocation::Pfs).await {
                warn!("flush file update failed: {}", e);
            }
            if let Err(e) = co
                .flush
                .unset_location(dataset_id, FlushLocation::Flushing)
                .await
            {
                warn!("flush file update failed: {}", e);
            }
        }

        if let Some(co) = self.coordinator() {
            let elapsed = timer.elapsed();
            let secs = elapsed.as_secs_f64().max(f64::EPSILON);
            let mb = total_bytes as f64 / (1024.0 * 1024.0);
            debug!(
                "fetch: {:.3} secs, {} bytes, {:.3} MB/s, {:.3} MB/s per rank",
                secs,
                total_bytes,
                mb / secs,
                mb / secs / world as f64
            );
            co.emit(
                EVENT_FETCH_SUCCEEDED,
                fetch_dir,
                Some(dataset_id),
                Some(elapsed),
            );
            co.sink.transfer(&TransferRecord {
                name: "FETCH",
                src: fetch_dir.clone(),
                dst: cache_dir.to_string_lossy().to_string(),
                dataset_id: Some(dataset_id),
                started: timer.started_at(),
                elapsed,
                bytes: total_bytes,
            });
        }

        Ok(AttemptOutcome::Fetched {
            dataset_id,
            checkpoint_id,
        })
    }
}
