mod cache;
mod filemap;
mod flush_file;
mod index;
mod reddesc;

pub use cache::*;
pub use filemap::*;
pub use flush_file::*;
pub use index::*;
pub use reddesc::*;
