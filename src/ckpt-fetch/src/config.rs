use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::fs;

use ckpt_lib::{CkptError, CkptResult};

pub const DEFAULT_BUF_SIZE: usize = 1024 * 1024;
pub const DEFAULT_FETCH_WIDTH: u32 = 4;

/// Knobs consumed by the fetch core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// I/O chunk size for copies and container reads.
    pub buf_size: usize,
    /// Compute CRC32 while fetching and enforce stored values.
    pub crc_on_flush: bool,
    /// Sliding-window size: number of non-zero ranks reading at once.
    pub fetch_width: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            buf_size: DEFAULT_BUF_SIZE,
            crc_on_flush: true,
            fetch_width: DEFAULT_FETCH_WIDTH,
        }
    }
}

impl FetchConfig {
    /// Load from a JSON config file, writing the default back when absent.
    pub async fn load(path: &Path) -> CkptResult<FetchConfig> {
        match fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| CkptError::DecodeError(format!("config {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("config {} not found, writing defaults", path.display());
                let config = FetchConfig::default();
                let data = serde_json::to_string_pretty(&config)
                    .map_err(|e| CkptError::Internal(e.to_string()))?;
                fs::write(path, data.as_bytes()).await.map_err(|e| {
                    CkptError::IoError(format!("write config {}: {}", path.display(), e))
                })?;
                Ok(config)
            }
            Err(e) => Err(CkptError::IoError(format!(
                "read config {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
