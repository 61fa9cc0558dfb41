use std::path::Path;

use log::warn;

use ckpt_lib::CkptResult;
use ckpt_store::{FileKind, FileMap, FileMeta};

use crate::{copy_to, fetch_from_containers, FetchConfig, FileList};

/// Fetch this rank's file list into `cache_dir`, recording every file in
/// the file map. Each destination path is registered and the map flushed
/// to disk *before* any byte of that file is written.
///
/// Returns whether every non-skipped file was fetched intact. A failed
/// file is marked incomplete and the loop moves on to the next one.
pub async fn fetch_files_list(
    file_list: &FileList,
    cache_dir: &Path,
    map: &mut FileMap,
    map_path: &Path,
    config: &FetchConfig,
    rank: u32,
    world: u32,
) -> CkptResult<bool> {
    let dataset_id = file_list.dataset()?.id()?;

    let containers = match file_list.containers() {
        Ok(containers) => containers,
        Err(e) => {
            warn!("container table is unusable: {}", e);
            return Ok(false);
        }
    };

    let mut success = true;
    let mut my_num_files = 0u64;

    for (name, record) in file_list.files() {
        if record.nofetch() {
            continue;
        }
        my_num_files += 1;

        let base = match Path::new(name).file_name() {
            Some(base) => base.to_owned(),
            None => {
                warn!("file name {} has no basename", name);
                success = false;
                break;
            }
        };
        let dst = cache_dir.join(&base);

        // record the file before it exists so a crashed fetch leaves a trace
        map.add_file(dataset_id, rank, &dst);
        map.write(map_path).await?;

        let size = match record.size() {
            Ok(size) => size,
            Err(e) => {
                warn!("no size recorded for {}: {}", name, e);
                success = false;
                break;
            }
        };

        let mut meta = FileMeta {
            filename: dst.to_string_lossy().to_string(),
            kind: FileKind::Full,
            size,
            complete: record.complete(),
            ranks: world,
            crc32: record.crc32(),
        };

        if let Some(containers) = &containers {
            let stored = config.crc_on_flush.then_some(meta.crc32).flatten();
            let result = match record.segments() {
                Ok(segments) => {
                    fetch_from_containers(
                        &dst,
                        segments,
                        containers,
                        config.buf_size,
                        config.crc_on_flush,
                        stored,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("fetch of {} from containers failed: {}", name, e);
                meta.complete = false;
                success = false;
            }
        } else if let Some(src_dir) = record.path() {
            match copy_to(
                &Path::new(src_dir).join(&base),
                cache_dir,
                config.buf_size,
                config.crc_on_flush,
            )
            .await
            {
                Ok((_, computed)) => {
                    if let (Some(computed), Some(stored)) = (computed, meta.crc32) {
                        if computed != stored {
                            warn!(
                                "crc32 mismatch fetching {}: computed {:#010x}, summary has {:#010x}",
                                name, computed, stored
                            );
                            meta.complete = false;
                            success = false;
                        }
                    }
                }
                Err(e) => {
                    warn!("fetch of {} failed: {}", name, e);
                    meta.complete = false;
                    success = false;
                }
            }
        } else {
            warn!("{} has neither containers nor a source path", name);
            meta.complete = false;
            success = false;
        }

        map.set_meta(dataset_id, rank, &dst, meta);
    }

    map.set_expected_files(dataset_id, rank, my_num_files);
    map.write(map_path).await?;

    Ok(success)
}
