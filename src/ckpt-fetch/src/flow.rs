use std::future::{poll_fn, Future};
use std::task::Poll;

use log::warn;

use ckpt_lib::{CkptResult, Fabric, PendingRecv};

use crate::{fetch_files_list, FetchConfig, FileList};
use ckpt_store::FileMap;

const FLOW_OK: u8 = 1;
const FLOW_FAIL: u8 = 0;

/// Wait for any posted receive to complete, like a wait-any over a request
/// array. Returns the slot index and the payload.
async fn wait_any(recvs: &mut [PendingRecv]) -> (usize, CkptResult<Vec<u8>>) {
    poll_fn(|cx| {
        for (idx, recv) in recvs.iter_mut().enumerate() {
            if let Poll::Ready(out) = recv.as_mut().poll(cx) {
                return Poll::Ready((idx, out));
            }
        }
        Poll::Pending
    })
    .await
}

/// Run `work` on every rank with rank 0 throttling read concurrency.
///
/// Rank 0 runs its own work first, then drives a sliding window of at most
/// `width` outstanding start/completion pairs in strict rank order. Each
/// start signal carries the aggregate success so far, so once anything has
/// failed the remaining ranks fast-fail without touching the file system.
/// Start signals cannot be rescinded; a late failure only poisons starts
/// that have not been issued yet.
///
/// Returns this rank's local view: on rank 0 that is the aggregate across
/// every completion received, on other ranks their own outcome.
pub async fn run_flow<F, Fut>(fabric: &dyn Fabric, width: u32, work: F) -> CkptResult<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = CkptResult<bool>>,
{
    let world = fabric.world_size();

    if fabric.rank() == 0 {
        // rank 0 owns its own file map mutations, so it fetches before
        // signalling anyone
        let mut success = work().await.unwrap_or_else(|e| {
            warn!("fetch failed on rank 0: {}", e);
            false
        });

        if world > 1 {
            let w = width.clamp(1, world - 1) as usize;
            let mut recvs: Vec<PendingRecv> = Vec::with_capacity(w);
            let mut sends = Vec::with_capacity(w);
            let mut next = 1u32;

            while next < world || !recvs.is_empty() {
                // issue matched pairs while the window has room
                while next < world && recvs.len() < w {
                    recvs.push(fabric.post_recv(next));
                    let flag = if success { FLOW_OK } else { FLOW_FAIL };
                    sends.push(fabric.post_send(next, vec![flag]));
                    next += 1;
                }

                let (idx, payload) = wait_any(&mut recvs).await;
                let payload = payload?;
                recvs.swap_remove(idx);
                // the matching send must drain before its slot is reused
                sends.swap_remove(idx).await?;

                if payload.first().copied() != Some(FLOW_OK) {
                    success = false;
                }
            }
        }
        Ok(success)
    } else {
        let signal = fabric.recv(0).await?;
        let mut success = signal.first().copied() == Some(FLOW_OK);
        if success {
            success = work().await.unwrap_or_else(|e| {
                warn!("fetch failed on rank {}: {}", fabric.rank(), e);
                false
            });
        }
        let flag = if success { FLOW_OK } else { FLOW_FAIL };
        fabric.send(0, vec![flag]).await?;
        Ok(success)
    }
}

/// Fetch the file lists on every rank under flow control, then agree on
/// the global outcome.
pub async fn fetch_data(
    fabric: &dyn Fabric,
    file_list: &FileList,
    cache_dir: &std::path::Path,
    map: &mut FileMap,
    map_path: &std::path::Path,
    config: &FetchConfig,
) -> CkptResult<bool> {
    let rank = fabric.rank();
    let world = fabric.world_size();
    let local = run_flow(fabric, config.fetch_width, move || {
        fetch_files_list(file_list, cache_dir, map, map_path, config, rank, world)
    })
    .await?;
    fabric.all_and(local).await
}
