use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between background saves of dirty cache state.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default capacity (in KiB) used by [`DiskCacheConfig::from_env`].
pub const DEFAULT_CAPACITY_KB: u64 = 256 * 1024;

/// Configuration for opening a [`crate::DiskCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCacheConfig {
    /// Directory owned by the cache. Created if missing.
    pub directory: PathBuf,
    /// Maximum total size of retained entries, in KiB.
    pub capacity_kb: u64,
    /// Delay between a mutation and the background save that persists it.
    pub save_interval: Duration,
}

impl DiskCacheConfig {
    pub fn new(directory: impl Into<PathBuf>, capacity_kb: u64) -> Self {
        Self {
            directory: directory.into(),
            capacity_kb,
            save_interval: DEFAULT_SAVE_INTERVAL,
        }
    }

    pub fn with_save_interval(mut self, save_interval: Duration) -> Self {
        self.save_interval = save_interval;
        self
    }

    /// Builds a config from `LRU_DISK_CACHE_DIR`, `LRU_DISK_CACHE_CAPACITY_KB` and
    /// `LRU_DISK_CACHE_SAVE_INTERVAL_MS`, falling back to `default_directory` and
    /// the crate defaults. Unparseable values are logged and ignored.
    pub fn from_env(default_directory: impl AsRef<Path>) -> Self {
        let directory = std::env::var_os("LRU_DISK_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_directory.as_ref().to_path_buf());

        let capacity_kb = env_u64("LRU_DISK_CACHE_CAPACITY_KB").unwrap_or(DEFAULT_CAPACITY_KB);
        let save_interval = env_u64("LRU_DISK_CACHE_SAVE_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SAVE_INTERVAL);

        Self {
            directory,
            capacity_kb,
            save_interval,
        }
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_kb.saturating_mul(1024)
    }
}

fn env_u64(name: &'static str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                target = "lru_disk_cache",
                var = name,
                value = %raw,
                error = %err,
                "ignoring invalid cache configuration value"
            );
            None
        }
    }
}
