use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use ckpt_lib::{CkptError, CkptResult};

/// Copy `src` into `dst_dir` under its basename, reading in chunks of at
/// most `buf_size` bytes. Returns the destination path and, when requested,
/// the CRC32 of the bytes copied.
///
/// A short write is a hard failure. A short read at end of file is normal
/// termination; a short read before end of file is a failure.
pub async fn copy_to(
    src: &Path,
    dst_dir: &Path,
    buf_size: usize,
    want_crc: bool,
) -> CkptResult<(PathBuf, Option<u32>)> {
    let name = src
        .file_name()
        .ok_or_else(|| CkptError::InvalidParam(format!("{} has no basename", src.display())))?;
    let dst = dst_dir.join(name);

    let mut reader = File::open(src)
        .await
        .map_err(|e| CkptError::IoError(format!("open {}: {}", src.display(), e)))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&dst)
        .await
        .map_err(|e| CkptError::IoError(format!("open {}: {}", dst.display(), e)))?;

    let mut hasher = want_crc.then(Hasher::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    loop {
        let nread = reader
            .read(&mut buf)
            .await
            .map_err(|e| CkptError::IoError(format!("read {}: {}", src.display(), e)))?;
        if nread == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..nread]);
        }
        writer
            .write_all(&buf[..nread])
            .await
            .map_err(|e| CkptError::IoError(format!("write {}: {}", dst.display(), e)))?;
        if nread < buf.len() {
            // a short read is only legal at end of file; confirm with one
            // more read
            let followup = reader
                .read(&mut buf)
                .await
                .map_err(|e| CkptError::IoError(format!("read {}: {}", src.display(), e)))?;
            if followup > 0 {
                return Err(CkptError::IoError(format!(
                    "short read before end of {}",
                    src.display()
                )));
            }
            break;
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| CkptError::IoError(format!("flush {}: {}", dst.display(), e)))?;
    Ok((dst, hasher.map(|h| h.finalize())))
}
