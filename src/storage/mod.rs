//! Physical storage: slotted pages, page ranges, and the buffer pool

pub mod bufferpool;
pub mod page;

pub use bufferpool::BufferPool;
pub use page::{Page, PageId, PageKind, PageRange};
