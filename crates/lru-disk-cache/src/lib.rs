//! A space-bounded, least-recently-used blob cache on the local filesystem.
//!
//! Each entry is an opaque byte blob plus optional `extra_info` metadata,
//! stored under a string key. The total size of all entries never exceeds the
//! configured capacity; adding past it evicts the least recently used entries.
//! The index survives restarts.
//!
//! ## On-disk layout
//!
//! Everything lives under the cache directory:
//! - `cache.state`: the persisted index (see the `persist` module for the
//!   format), replaced atomically via a `cache.state.tmp.*` sibling
//! - `<bucket>/<name>.blob`: one backing file per entry, spread over 256
//!   two-hex-digit bucket directories
//!
//! ## Entry lifecycle
//!
//! [`DiskCache::add`] reserves space and returns a [`WriteSink`]; the entry
//! becomes visible to [`DiskCache::lookup`] once the sink is committed.
//! [`DiskCache::open_entry`] turns a lookup snapshot into a [`ReadStream`].
//! Backing files that cannot be deleted yet (still open, or locked by the
//! platform) are queued and retried on the next sweep, save, or restart.
//!
//! ```no_run
//! use lru_disk_cache::DiskCache;
//! use std::io::{Read, Write};
//!
//! # fn main() -> lru_disk_cache::Result<()> {
//! let cache = DiskCache::open("/tmp/blob-cache", 64 * 1024)?;
//!
//! let content = b"compiled output";
//! let mut sink = cache.add("unit:Main", content.len() as u64, Some(b"v1".as_slice()))?;
//! sink.write_all(content)?;
//! sink.commit()?;
//!
//! if let Some(entry) = cache.lookup("unit:Main") {
//!     let mut bytes = Vec::new();
//!     cache.open_entry(&entry)?.read_to_end(&mut bytes)?;
//!     assert_eq!(bytes, content);
//! }
//! cache.close();
//! # Ok(())
//! # }
//! ```

mod allocator;
mod cache;
mod config;
mod deferred;
mod entry;
mod error;
mod index;
mod persist;
mod scheduler;
mod util;

pub use cache::{CacheStats, DiskCache, ReadStream, WriteSink};
pub use config::{DiskCacheConfig, DEFAULT_CAPACITY_KB, DEFAULT_SAVE_INTERVAL};
pub use entry::DiskCacheEntry;
pub use error::{CacheError, Result};
pub use persist::{STATE_FILE_NAME, STATE_FORMAT_VERSION};
pub use util::{now_millis, BINCODE_PAYLOAD_LIMIT_BYTES};
