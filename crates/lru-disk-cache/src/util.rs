use crate::error::CacheError;
use bincode::Options;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound for any single bincode value decoded from the state file.
///
/// A corrupted length prefix should degrade to `BadFormat`, not an
/// out-of-memory abort.
pub const BINCODE_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Infix used for temporary files created by [`atomic_write_with`].
pub(crate) const TMP_INFIX: &str = ".tmp.";

/// Wall-clock milliseconds since the unix epoch; 0 if the clock is earlier.
pub fn now_millis() -> u64 {
    static REPORTED: OnceLock<()> = OnceLock::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_else(|err| {
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "lru_disk_cache",
                    error = %err,
                    "system clock is before the unix epoch; recording access time 0"
                );
            }
            0
        })
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options + Copy {
    bincode_options().with_limit(BINCODE_PAYLOAD_LIMIT_BYTES as u64)
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes `path`, treating an already-missing file as success.
pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "lru_disk_cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}

/// Returns `true` if `file_name` is a relative path that stays inside the
/// cache directory once joined onto it.
pub(crate) fn is_contained_file_name(file_name: &str) -> bool {
    let path = Path::new(file_name);
    !file_name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes `path` by streaming into a sibling temp file and renaming it into
/// place. On any failure the previous contents of `path` are left untouched.
pub(crate) fn atomic_write_with(
    path: &Path,
    write: impl FnOnce(&mut io::BufWriter<fs::File>) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    let (pending, file) = PendingReplace::create(path)?;
    let mut writer = io::BufWriter::new(file);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    drop(file);
    pending.persist()?;
    Ok(())
}

/// A temp file next to its destination. Removed on drop unless persisted.
struct PendingReplace {
    tmp_path: PathBuf,
    dest: PathBuf,
    parent: PathBuf,
    persisted: bool,
}

impl PendingReplace {
    fn create(dest: &Path) -> io::Result<(Self, fs::File)> {
        let parent = match dest.parent() {
            Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
            Some(parent) => parent.to_path_buf(),
            None => return Err(io::Error::other("path has no parent")),
        };
        let file_name = dest
            .file_name()
            .ok_or_else(|| io::Error::other("destination path has no file name"))?;
        fs::create_dir_all(&parent)?;

        let pid = std::process::id();
        loop {
            let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
            let mut tmp_name = file_name.to_os_string();
            tmp_name.push(format!("{TMP_INFIX}{pid}.{counter}"));
            let tmp_path = parent.join(tmp_name);

            let opened = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path);
            match opened {
                Ok(file) => {
                    let pending = Self {
                        tmp_path,
                        dest: dest.to_path_buf(),
                        parent,
                        persisted: false,
                    };
                    return Ok((pending, file));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn persist(mut self) -> io::Result<()> {
        rename_replacing(&self.tmp_path, &self.dest)?;
        self.persisted = true;
        sync_dir_best_effort(&self.parent);
        Ok(())
    }
}

impl Drop for PendingReplace {
    fn drop(&mut self) {
        if !self.persisted {
            remove_file_best_effort(&self.tmp_path, "atomic_write.discard_tmp");
        }
    }
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 16;

    for _ in 1..MAX_RENAME_ATTEMPTS {
        match fs::rename(from, to) {
            // `rename` does not replace an existing file on Windows.
            Err(_) if cfg!(windows) && to.exists() => match fs::remove_file(to) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            },
            result => return result,
        }
    }
    fs::rename(from, to)
}

#[cfg(unix)]
fn sync_dir_best_effort(dir: &Path) {
    static LOGGED: OnceLock<()> = OnceLock::new();
    let Err(err) = fs::File::open(dir).and_then(|dir| dir.sync_all()) else {
        return;
    };
    if err.kind() != io::ErrorKind::NotFound && LOGGED.set(()).is_ok() {
        tracing::debug!(
            target = "lru_disk_cache",
            dir = %dir.display(),
            error = %err,
            "failed to sync cache directory; continuing"
        );
    }
}

#[cfg(not(unix))]
fn sync_dir_best_effort(_dir: &Path) {}
