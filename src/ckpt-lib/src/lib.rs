mod attr_tree;
mod fabric;

pub use attr_tree::*;
pub use fabric::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CkptError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("missing key: {0}")]
    MissingKey(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("crc32 mismatch: {0}")]
    CrcMismatch(String),
    #[error("fabric error: {0}")]
    FabricError(String),
}

impl CkptError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CkptError::NotFound(_))
    }
}

pub type CkptResult<T> = std::result::Result<T, CkptError>;

impl From<std::io::Error> for CkptError {
    fn from(err: std::io::Error) -> Self {
        CkptError::IoError(err.to_string())
    }
}

// Summary document keys, version 6 layout.
pub const SUMMARY_FILE_VERSION: u64 = 6;
pub const KEY_VERSION: &str = "VERSION";
pub const KEY_DATASET: &str = "DATASET";
pub const KEY_CONTAINER: &str = "CONTAINER";
pub const KEY_RANK2FILE: &str = "RANK2FILE";
pub const KEY_RANK: &str = "RANK";
pub const KEY_RANKS: &str = "RANKS";
pub const KEY_FILE: &str = "FILE";
pub const KEY_SIZE: &str = "SIZE";
pub const KEY_CRC: &str = "CRC";
pub const KEY_COMPLETE: &str = "COMPLETE";
pub const KEY_PATH: &str = "PATH";
pub const KEY_NOFETCH: &str = "NOFETCH";
pub const KEY_SEGMENT: &str = "SEGMENT";
pub const KEY_LENGTH: &str = "LENGTH";
pub const KEY_ID: &str = "ID";
pub const KEY_OFFSET: &str = "OFFSET";
pub const KEY_NAME: &str = "NAME";

// Dataset header keys.
pub const DATASET_KEY_ID: &str = "ID";
pub const DATASET_KEY_CKPT: &str = "CKPT";
pub const DATASET_KEY_NAME: &str = "NAME";
