use std::path::Path;

use crc32fast::Hasher;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use ckpt_lib::{CkptError, CkptResult};

use crate::{ContainerTable, SegmentSpec};

/// Read up to `want` bytes, looping over short reads. Returns the number of
/// bytes obtained, which is less than `want` only at end of file.
async fn read_up_to(file: &mut File, path: &Path, buf: &mut [u8], want: usize) -> CkptResult<usize> {
    let mut got = 0;
    while got < want {
        let n = file
            .read(&mut buf[got..want])
            .await
            .map_err(|e| CkptError::IoError(format!("read {}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

/// Reconstruct `dst` from its segments, copying `length` bytes out of each
/// referenced container. A single CRC32 runs across all segments in index
/// order; when `stored_crc` is given the computed value must match it.
///
/// Output is streamed monotonically. A failure in any segment aborts the
/// file without rewinding bytes already written; the cache manager cleans
/// up afterwards.
pub async fn fetch_from_containers(
    dst: &Path,
    mut segments: Vec<SegmentSpec>,
    containers: &ContainerTable,
    buf_size: usize,
    want_crc: bool,
    stored_crc: Option<u32>,
) -> CkptResult<Option<u32>> {
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dst)
        .await
        .map_err(|e| CkptError::IoError(format!("open {}: {}", dst.display(), e)))?;

    let mut hasher = want_crc.then(Hasher::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    segments.sort_by_key(|s| s.index);

    for segment in &segments {
        let entry = containers.get(segment.container_id)?;
        if segment.offset + segment.length > entry.size {
            return Err(CkptError::InvalidParam(format!(
                "segment {} of {}: offset {} + length {} exceeds container {} size {}",
                segment.index,
                dst.display(),
                segment.offset,
                segment.length,
                segment.container_id,
                entry.size
            )));
        }

        let mut reader = File::open(&entry.name)
            .await
            .map_err(|e| CkptError::IoError(format!("open {}: {}", entry.name.display(), e)))?;
        reader
            .seek(SeekFrom::Start(segment.offset))
            .await
            .map_err(|e| {
                CkptError::IoError(format!(
                    "seek to {} in {}: {}",
                    segment.offset,
                    entry.name.display(),
                    e
                ))
            })?;

        let mut remaining = segment.length;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = read_up_to(&mut reader, &entry.name, &mut buf, want).await?;
            if got < want {
                return Err(CkptError::IoError(format!(
                    "unexpected end of {} with {} bytes left for {}",
                    entry.name.display(),
                    remaining,
                    dst.display()
                )));
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buf[..got]);
            }
            writer
                .write_all(&buf[..got])
                .await
                .map_err(|e| CkptError::IoError(format!("write {}: {}", dst.display(), e)))?;
            remaining -= got as u64;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| CkptError::IoError(format!("flush {}: {}", dst.display(), e)))?;

    let crc = hasher.map(|h| h.finalize());
    if let (Some(computed), Some(stored)) = (crc, stored_crc) {
        if computed != stored {
            return Err(CkptError::CrcMismatch(format!(
                "{}: computed {:#010x}, summary has {:#010x}",
                dst.display(),
                computed,
                stored
            )));
        }
    }
    Ok(crc)
}
