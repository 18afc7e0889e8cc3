use crate::allocator::{is_bucket_name, FileAllocator};
use crate::config::DiskCacheConfig;
use crate::deferred::DeferredDeletionSet;
use crate::entry::{DiskCacheEntry, Entry};
use crate::error::{CacheError, Result};
use crate::index::RecencyIndex;
use crate::persist::{self, bytes_to_kb, CacheState, STATE_FILE_NAME};
use crate::scheduler::{BackgroundSave, SaveScheduler};
use crate::util::{lock, now_millis, remove_file_best_effort, TMP_INFIX};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A space-bounded LRU cache of opaque blobs stored as files in one directory.
///
/// Content is written through the [`WriteSink`] returned by
/// [`DiskCache::add`] and becomes visible to [`DiskCache::lookup`] once the
/// sink is committed. The index is kept in memory and saved to
/// `cache.state` by a background task shortly after each mutation, and once
/// more on [`DiskCache::close`].
///
/// The cache is `Send + Sync`; share it between threads with an `Arc`.
/// Failures to load or save state are logged and otherwise ignored: an
/// unusable cache behaves like an empty one.
pub struct DiskCache {
    inner: Arc<Inner>,
}

/// Point-in-time counters for a [`DiskCache`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub space_used: u64,
    pub space_limit: u64,
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped to make room, replaced, or cleared.
    pub evictions: u64,
    pub pending_deletions: usize,
}

struct Inner {
    weak_self: Weak<Inner>,
    root: PathBuf,
    state_path: PathBuf,
    index: Mutex<RecencyIndex>,
    allocator: FileAllocator,
    deferred: DeferredDeletionSet,
    scheduler: SaveScheduler,
    save_lock: Mutex<()>,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DiskCache {
    /// Opens (or creates) the cache in `directory` with a budget of
    /// `capacity_kb` KiB.
    pub fn open(directory: impl AsRef<Path>, capacity_kb: u64) -> Result<Self> {
        Self::with_config(DiskCacheConfig::new(directory.as_ref(), capacity_kb))
    }

    /// Opens (or creates) the cache described by `config`.
    ///
    /// Only a failure to create the directory is reported. Missing, corrupt,
    /// or foreign state is logged and replaced by an empty cache.
    pub fn with_config(config: DiskCacheConfig) -> Result<Self> {
        let root = config.directory.clone();
        fs::create_dir_all(&root)?;

        let inner = Arc::new_cyclic(|weak_self| Inner {
            weak_self: weak_self.clone(),
            state_path: root.join(STATE_FILE_NAME),
            index: Mutex::new(RecencyIndex::new(config.capacity_bytes())),
            allocator: FileAllocator::new(&root),
            deferred: DeferredDeletionSet::new(&root),
            scheduler: SaveScheduler::new(config.save_interval),
            save_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            root,
        });

        inner.load();
        inner.remove_orphans();
        let remaining = inner.deferred.sweep();

        let (entries, space_used) = {
            let index = inner.index();
            (index.len(), index.used())
        };
        tracing::debug!(
            target = "lru_disk_cache",
            dir = %inner.root.display(),
            entries,
            space_used,
            capacity = config.capacity_bytes(),
            pending_deletions = remaining,
            "opened disk cache"
        );
        Ok(Self { inner })
    }

    pub fn directory(&self) -> &Path {
        &self.inner.root
    }

    /// Creates an entry of `size` bytes and returns a sink for its content.
    ///
    /// The entry counts against the capacity right away (evicting LRU entries
    /// if needed) but is only served after [`WriteSink::commit`]. Adding an
    /// existing key replaces it.
    pub fn add(&self, key: &str, size: u64, extra_info: Option<&[u8]>) -> Result<WriteSink> {
        if size == 0 {
            return Err(CacheError::InvalidSize);
        }
        let capacity = self.inner.index().capacity();
        if size > capacity {
            return Err(CacheError::CapacityExceeded { size, capacity });
        }

        let allocated = self.inner.allocator.allocate()?;
        self.inner.deferred.pin(&allocated.file_name);

        let entry = Entry {
            key: key.to_string(),
            size,
            file_name: allocated.file_name.clone(),
            last_access_millis: now_millis(),
            extra_info: extra_info.map(<[u8]>::to_vec),
            complete: false,
        };
        let added = {
            let mut index = self.inner.index();
            index.add(entry, &mut |evicted: Entry| self.inner.discard(evicted, "add.evict"))
        };
        if let Err(err) = added {
            // The limit was lowered concurrently.
            drop(allocated.file);
            self.inner.deferred.unpin(&allocated.file_name);
            self.inner
                .deferred
                .delete_or_defer(&allocated.file_name, "add.rejected");
            return Err(err);
        }
        self.inner.mark_dirty();

        tracing::trace!(
            target = "lru_disk_cache",
            key,
            size,
            path = %allocated.path.display(),
            "added cache entry"
        );
        Ok(WriteSink {
            inner: self.inner.clone(),
            key: key.to_string(),
            file_name: allocated.file_name,
            writer: Some(BufWriter::new(allocated.file)),
            size,
            written: 0,
        })
    }

    /// Returns a snapshot of the committed entry under `key`.
    ///
    /// Any hit, including one on an entry that is still being written, moves
    /// the entry to the MRU position and marks the cache dirty so the new
    /// order survives a restart.
    pub fn lookup(&self, key: &str) -> Option<DiskCacheEntry> {
        let (touched, snapshot) = {
            let mut index = self.inner.index();
            match index.get(key) {
                Some(entry) => (true, entry.complete.then(|| entry.snapshot())),
                None => (false, None),
            }
        };
        if touched {
            self.inner.mark_dirty();
        }
        match snapshot {
            Some(_) => self.inner.hits.fetch_add(1, Ordering::Relaxed),
            None => self.inner.misses.fetch_add(1, Ordering::Relaxed),
        };
        snapshot
    }

    /// Opens the content of `entry` for reading.
    ///
    /// Fails with [`CacheError::NotFound`] if the key has been removed or
    /// rewritten since the snapshot was taken. The backing file stays on disk
    /// until the stream is released, even if the entry is removed meanwhile.
    pub fn open_entry(&self, entry: &DiskCacheEntry) -> Result<ReadStream> {
        {
            let index = self.inner.index();
            match index.peek(&entry.key) {
                Some(current) if current.complete && current.matches(entry) => {}
                _ => {
                    return Err(CacheError::NotFound {
                        key: entry.key.clone(),
                    })
                }
            }
            self.inner.deferred.pin(&entry.file_name);
        }

        let mut stream = ReadStream {
            inner: self.inner.clone(),
            key: entry.key.clone(),
            file_name: entry.file_name.clone(),
            reader: None,
            released: false,
        };
        match File::open(self.inner.root.join(&entry.file_name)) {
            Ok(file) => {
                stream.reader = Some(BufReader::new(file));
                Ok(stream)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                drop(stream);
                tracing::debug!(
                    target = "lru_disk_cache",
                    key = %entry.key,
                    file_name = %entry.file_name,
                    "backing file disappeared; dropping entry"
                );
                self.inner.remove_if_current(&entry.file_name);
                Err(CacheError::NotFound {
                    key: entry.key.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes `key`, deleting its backing file now or once it is released.
    pub fn remove(&self, key: &str) -> Option<DiskCacheEntry> {
        let removed = {
            let mut index = self.inner.index();
            let removed = index.remove(key)?;
            let snapshot = removed.snapshot();
            self.inner.discard_removed(removed, "remove");
            snapshot
        };
        self.inner.mark_dirty();
        Some(removed)
    }

    /// Removes every key in `keys` and returns how many were present.
    pub fn remove_all<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let removed = {
            let mut index = self.inner.index();
            let mut removed = 0;
            for key in keys {
                if let Some(entry) = index.remove(key.as_ref()) {
                    self.inner.discard_removed(entry, "remove_all");
                    removed += 1;
                }
            }
            removed
        };
        if removed > 0 {
            self.inner.mark_dirty();
        }
        removed
    }

    /// Moves the entry under `old_key` to `new_key`, replacing any entry
    /// already there. Returns `false` and changes nothing if `old_key` is
    /// absent.
    pub fn rename(&self, old_key: &str, new_key: &str) -> bool {
        let renamed = {
            let mut index = self.inner.index();
            index.rename(old_key, new_key, &mut |displaced: Entry| {
                self.inner.discard(displaced, "rename.displace")
            })
        };
        if renamed {
            self.inner.mark_dirty();
        }
        renamed
    }

    /// Evicts every entry.
    pub fn clear_cache(&self) {
        {
            let mut index = self.inner.index();
            index.clear(&mut |evicted: Entry| self.inner.discard(evicted, "clear"));
        }
        self.inner.mark_dirty();
    }

    /// Total size in bytes of all entries, including ones still being written.
    pub fn space_used(&self) -> u64 {
        self.inner.index().used()
    }

    /// Current capacity in KiB.
    pub fn space_limit_kb(&self) -> u64 {
        self.inner.index().capacity() / 1024
    }

    /// Changes the capacity, evicting LRU entries immediately if the cache is
    /// now over budget.
    pub fn set_space_limit_kb(&self, capacity_kb: u64) {
        {
            let mut index = self.inner.index();
            index.set_capacity(capacity_kb.saturating_mul(1024), &mut |evicted: Entry| {
                self.inner.discard(evicted, "set_space_limit.evict")
            });
        }
        self.inner.mark_dirty();
    }

    pub fn num_entries(&self) -> usize {
        self.inner.index().len()
    }

    /// Keys from most to least recently used, including entries still being
    /// written.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .index()
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Retries deferred deletions and returns how many files remain.
    pub fn sweep(&self) -> usize {
        self.inner.deferred.sweep()
    }

    /// Saves the index now instead of waiting for the background task.
    ///
    /// On failure the previous state file is untouched and the cache stays
    /// dirty.
    pub fn save(&self) -> Result<()> {
        self.inner.save()
    }

    /// Whether there are changes not yet written to the state file.
    pub fn is_dirty(&self) -> bool {
        self.inner.scheduler.is_dirty()
    }

    pub fn save_interval(&self) -> Duration {
        self.inner.scheduler.interval()
    }

    /// Changes the background save delay, starting with the next save.
    pub fn set_save_interval(&self, interval: Duration) {
        self.inner.scheduler.set_interval(interval);
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, space_used, space_limit) = {
            let index = self.inner.index();
            (index.len(), index.used(), index.capacity())
        };
        CacheStats {
            entries,
            space_used,
            space_limit,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            pending_deletions: self.inner.deferred.len(),
        }
    }

    /// Flushes the cache and stops its background task.
    ///
    /// Entries whose writers have not committed are discarded. Calling
    /// `close` more than once is a no-op; dropping the cache closes it too.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let discarded = {
            let mut index = self.inner.index();
            let incomplete = index.drain_incomplete();
            let discarded = incomplete.len();
            for entry in incomplete {
                self.inner
                    .deferred
                    .delete_or_defer(&entry.file_name, "close.incomplete");
            }
            discarded
        };
        if discarded > 0 {
            self.inner.scheduler.mark_dirty();
        }

        self.inner.scheduler.shutdown();
        if self.inner.scheduler.is_dirty() {
            if let Err(err) = self.inner.save() {
                tracing::warn!(
                    target = "lru_disk_cache",
                    dir = %self.inner.root.display(),
                    error = %err,
                    "failed to save cache state on close"
                );
            }
        }
        let remaining = self.inner.deferred.sweep();

        tracing::debug!(
            target = "lru_disk_cache",
            dir = %self.inner.root.display(),
            discarded_incomplete = discarded,
            pending_deletions = remaining,
            "closed disk cache"
        );
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn index(&self) -> std::sync::MutexGuard<'_, RecencyIndex> {
        lock(&self.index)
    }

    fn mark_dirty(&self) {
        let owner: Weak<dyn BackgroundSave> = self.weak_self.clone();
        self.scheduler.ensure_scheduled(owner);
    }

    /// Eviction hook: counts the entry and releases its backing file.
    fn discard(&self, entry: Entry, reason: &'static str) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.deferred.delete_or_defer(&entry.file_name, reason);
    }

    fn discard_removed(&self, entry: Entry, reason: &'static str) {
        self.deferred.delete_or_defer(&entry.file_name, reason);
    }

    /// Drops whichever entry is backed by `file_name`, under its current key,
    /// and releases the file.
    fn remove_if_current(&self, file_name: &str) {
        let removed = {
            let mut index = self.index();
            let removed = index.remove_file(file_name).is_some();
            self.deferred.delete_or_defer(file_name, "entry.abandoned");
            removed
        };
        if removed {
            self.mark_dirty();
        }
    }

    fn save(&self) -> Result<()> {
        let _guard = lock(&self.save_lock);
        self.scheduler.clear_dirty();
        self.deferred.sweep();

        let state = {
            let index = self.index();
            CacheState {
                capacity_kb: bytes_to_kb(index.capacity()),
                usage_kb: bytes_to_kb(index.used()),
                entries: index.iter().cloned().collect(),
                deletions: self.deferred.snapshot(),
            }
        };

        match persist::write_state(&self.state_path, &state) {
            Ok(()) => {
                tracing::trace!(
                    target = "lru_disk_cache",
                    path = %self.state_path.display(),
                    entries = state.entries.len(),
                    deletions = state.deletions.len(),
                    "saved cache state"
                );
                Ok(())
            }
            Err(err) => {
                self.scheduler.mark_dirty();
                Err(err)
            }
        }
    }

    fn load(&self) {
        let state = match persist::read_state(&self.state_path) {
            Ok(Some(state)) => state,
            Ok(None) => {
                tracing::debug!(
                    target = "lru_disk_cache",
                    path = %self.state_path.display(),
                    "no saved cache state; starting empty"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    target = "lru_disk_cache",
                    path = %self.state_path.display(),
                    bad_format = err.is_bad_format(),
                    error = %err,
                    "discarding unreadable cache state; starting empty"
                );
                self.mark_dirty();
                return;
            }
        };

        self.deferred.extend(state.deletions);

        let mut dropped = 0usize;
        {
            let mut index = self.index();
            // Stored MRU first; inserting LRU first at the MRU end rebuilds the
            // same order.
            for entry in state.entries.into_iter().rev() {
                if index.references_file(&entry.file_name) {
                    dropped += 1;
                    continue;
                }
                if !entry.complete || entry.size == 0 || entry.size > index.capacity() {
                    self.deferred.remember(&entry.file_name);
                    dropped += 1;
                    continue;
                }
                let added = index.add(entry, &mut |evicted: Entry| {
                    self.deferred.remember(&evicted.file_name);
                    dropped += 1;
                });
                if let Err(err) = added {
                    tracing::debug!(
                        target = "lru_disk_cache",
                        error = %err,
                        "skipping persisted entry"
                    );
                }
            }
        }

        if dropped > 0 {
            tracing::debug!(
                target = "lru_disk_cache",
                dropped,
                "dropped persisted entries that were incomplete or over budget"
            );
            self.mark_dirty();
        }
    }

    /// Deletes files in bucket directories that neither the index nor the
    /// deferred set knows about, plus temp files left by interrupted saves.
    fn remove_orphans(&self) {
        let known: HashSet<String> = self
            .index()
            .iter()
            .map(|entry| entry.file_name.clone())
            .collect();
        let tmp_prefix = format!("{STATE_FILE_NAME}{TMP_INFIX}");

        let walker = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(2)
            .follow_links(false)
            .into_iter()
            .filter_entry(|dent| {
                dent.depth() != 1
                    || !dent.file_type().is_dir()
                    || dent.file_name().to_str().is_some_and(is_bucket_name)
            });

        let mut removed = 0usize;
        for dent in walker {
            let dent = match dent {
                Ok(dent) => dent,
                Err(err) => {
                    tracing::debug!(
                        target = "lru_disk_cache",
                        error = %CacheError::from(err),
                        "failed to scan cache directory"
                    );
                    continue;
                }
            };
            if !dent.file_type().is_file() {
                continue;
            }
            let Some(name) = dent.file_name().to_str() else {
                continue;
            };

            let orphan = if dent.depth() == 1 {
                name.starts_with(&tmp_prefix)
            } else {
                let Some(bucket) = dent
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .and_then(|bucket| bucket.to_str())
                else {
                    continue;
                };
                let file_name = format!("{bucket}/{name}");
                !known.contains(&file_name) && !self.deferred.contains(&file_name)
            };
            if orphan && remove_file_best_effort(dent.path(), "open.orphan") {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(
                target = "lru_disk_cache",
                dir = %self.root.display(),
                removed,
                "removed orphaned cache files"
            );
        }
    }
}

impl BackgroundSave for Inner {
    fn save_in_background(&self) {
        if let Err(err) = self.save() {
            tracing::warn!(
                target = "lru_disk_cache",
                path = %self.state_path.display(),
                error = %err,
                "background cache save failed; will retry"
            );
        }
    }
}

/// Streams the content of a newly added entry to its backing file.
///
/// Call [`WriteSink::commit`] once all content is written. Dropping the sink
/// without committing abandons the entry.
pub struct WriteSink {
    inner: Arc<Inner>,
    key: String,
    file_name: String,
    writer: Option<BufWriter<File>>,
    size: u64,
    written: u64,
}

impl WriteSink {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes the content to disk and makes the entry visible to lookups.
    ///
    /// The entry is completed under whatever key it carries now, so a rename
    /// while writing is honored. If the entry was removed or replaced while it
    /// was being written, the content is discarded and `Ok(())` is still
    /// returned. On an IO error the entry is abandoned and the error returned.
    pub fn commit(mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let synced = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .and_then(|file| file.sync_all());

        let inner = self.inner.clone();
        inner.deferred.unpin(&self.file_name);
        if let Err(err) = synced {
            inner.remove_if_current(&self.file_name);
            return Err(err.into());
        }

        if self.written != self.size {
            tracing::debug!(
                target = "lru_disk_cache",
                key = %self.key,
                declared = self.size,
                written = self.written,
                "entry content is shorter than declared size"
            );
        }

        let completed = {
            let mut index = inner.index();
            let completed = index.mark_complete(&self.file_name);
            if !completed {
                inner
                    .deferred
                    .delete_or_defer(&self.file_name, "commit.stale");
            }
            completed
        };
        if completed {
            inner.mark_dirty();
        } else {
            tracing::trace!(
                target = "lru_disk_cache",
                key = %self.key,
                "entry replaced while writing; discarding content"
            );
        }
        Ok(())
    }
}

impl Write for WriteSink {
    /// Accepts at most the size declared to [`DiskCache::add`]; once it is
    /// reached, further non-empty writes fail with [`io::ErrorKind::WriteZero`].
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("write sink already finished"))?;
        let remaining = self.size - self.written;
        if remaining == 0 && !buf.is_empty() {
            tracing::debug!(
                target = "lru_disk_cache",
                key = %self.key,
                declared = self.size,
                rejected = buf.len(),
                "write past declared entry size"
            );
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write exceeds declared entry size",
            ));
        }
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let written = writer.write(&buf[..len])?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteSink {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        drop(writer);
        self.inner.deferred.unpin(&self.file_name);
        self.inner.remove_if_current(&self.file_name);
    }
}

impl std::fmt::Debug for WriteSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSink")
            .field("key", &self.key)
            .field("file_name", &self.file_name)
            .field("size", &self.size)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

/// Reads the content of a cache entry.
///
/// Release it with [`ReadStream::close`] (or by dropping it). If the entry was
/// removed or replaced while the stream was open, its backing file is deleted
/// on release. Renaming the entry keeps the file.
pub struct ReadStream {
    inner: Arc<Inner>,
    key: String,
    file_name: String,
    reader: Option<BufReader<File>>,
    released: bool,
}

impl ReadStream {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        drop(self.reader.take());
        let index = self.inner.index();
        self.inner.deferred.unpin(&self.file_name);
        if !index.references_file(&self.file_name) {
            self.inner
                .deferred
                .delete_or_defer(&self.file_name, "reader.released_stale");
        }
    }
}

impl Read for ReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("key", &self.key)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}
