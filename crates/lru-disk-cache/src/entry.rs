/// Bit set in [`Entry`] flags when the writer committed the entry.
pub(crate) const FLAG_COMPLETE: u32 = 1 << 0;
/// Bit set in [`Entry`] flags when `extra_info` is present (possibly empty).
pub(crate) const FLAG_HAS_EXTRA_INFO: u32 = 1 << 1;

/// Index record for one cached blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) key: String,
    pub(crate) size: u64,
    /// Backing file, relative to the cache directory. Never reassigned.
    pub(crate) file_name: String,
    pub(crate) last_access_millis: u64,
    pub(crate) extra_info: Option<Vec<u8>>,
    /// `false` while the writer is still streaming content.
    pub(crate) complete: bool,
}

impl Entry {
    pub(crate) fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.complete {
            flags |= FLAG_COMPLETE;
        }
        if self.extra_info.is_some() {
            flags |= FLAG_HAS_EXTRA_INFO;
        }
        flags
    }

    pub(crate) fn snapshot(&self) -> DiskCacheEntry {
        DiskCacheEntry {
            key: self.key.clone(),
            size: self.size,
            file_name: self.file_name.clone(),
            last_access_millis: self.last_access_millis,
            extra_info: self.extra_info.clone(),
        }
    }

    /// Whether `handle` still refers to this entry's backing file.
    pub(crate) fn matches(&self, handle: &DiskCacheEntry) -> bool {
        self.key == handle.key && self.file_name == handle.file_name
    }
}

/// A point-in-time view of a complete cache entry.
///
/// Pass it to [`crate::DiskCache::open_entry`] to read the content. The handle
/// goes stale once the key is removed, evicted, or rewritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCacheEntry {
    pub key: String,
    pub size: u64,
    pub file_name: String,
    pub last_access_millis: u64,
    pub extra_info: Option<Vec<u8>>,
}
