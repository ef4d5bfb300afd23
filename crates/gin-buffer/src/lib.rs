//! Page cache, latching and relation storage for the GIN index engine.

pub mod disk;
pub mod frame;
pub mod freespace;
pub mod lock;
pub mod pool;

pub use disk::{DiskManager, DiskManagerConfig};
pub use frame::{BufferFrame, PageBuf, zeroed_page};
pub use freespace::FreeSpaceMap;
pub use lock::{PageLockGuard, PageLockTable};
pub use pool::{Buffer, BufferPool, BufferPoolStats, LockMode};
