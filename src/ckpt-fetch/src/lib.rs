//! Checkpoint fetch core.
//!
//! Restores the most recent valid checkpoint from the parallel file system
//! into per-rank cache directories at job start:
//!
//!   1) Rank 0 reads the index catalog from the prefix directory.
//!   2) The most recent complete checkpoint not yet marked bad is selected.
//!   3) The summary document is read on rank 0 and scattered to all ranks.
//!   4) Every rank copies its files into cache, flow-controlled from rank 0
//!      via a sliding window. File data is either a native file on the PFS
//!      or packed into shared container files.
//!   5) On success the redundancy scheme is applied and `current` is moved;
//!      on failure the checkpoint is marked bad and an older one is tried.

mod config;
mod container;
mod copier;
mod driver;
mod event;
mod fetcher;
mod flow;
mod summary;

pub use config::*;
pub use container::*;
pub use copier::*;
pub use driver::*;
pub use event::*;
pub use fetcher::*;
pub use flow::*;
pub use summary::*;

#[cfg(test)]
mod test_fetch;
