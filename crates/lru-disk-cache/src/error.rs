pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the disk cache.
///
/// Only allocation/write failures and caller mistakes surface from the public
/// API. Deletion failures are queued for retry instead, and load/background
/// save failures are logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {capacity} bytes")]
    CapacityExceeded { size: u64, capacity: u64 },

    #[error("cache entries must have a non-zero size")]
    InvalidSize,

    #[error("no current cache entry for key {key:?}")]
    NotFound { key: String },

    #[error("malformed cache state: {message}")]
    BadFormat { message: String },

    #[error("unsupported cache state version {found:?}")]
    UnsupportedVersion { found: String },

    #[error("could not allocate a backing file after {attempts} attempts")]
    AllocationExhausted { attempts: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl CacheError {
    pub(crate) fn bad_format(message: impl Into<String>) -> Self {
        Self::BadFormat {
            message: message.into(),
        }
    }

    /// Returns `true` for errors caused by corrupt or foreign persisted state.
    ///
    /// Callers recover from these by discarding the state and starting empty.
    pub fn is_bad_format(&self) -> bool {
        matches!(
            self,
            Self::BadFormat { .. } | Self::UnsupportedVersion { .. } | Self::Bincode(_)
        )
    }
}
