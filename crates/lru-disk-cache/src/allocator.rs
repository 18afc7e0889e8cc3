use crate::error::{CacheError, Result};
use crate::util::{lock, now_millis};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Extension of every backing file the allocator hands out.
pub(crate) const BLOB_EXTENSION: &str = "blob";

const MAX_PROBE_ATTEMPTS: usize = 1024;

/// A freshly reserved backing file, already open for writing.
#[derive(Debug)]
pub(crate) struct AllocatedFile {
    /// Path relative to the cache directory (`<bucket>/<name>.blob`).
    pub(crate) file_name: String,
    pub(crate) path: PathBuf,
    pub(crate) file: File,
}

/// Hands out collision-free backing files spread over 256 bucket directories.
///
/// Names come from a sequence seeded with the wall clock, so a restarted
/// process rarely probes names an earlier run already used. The bucket is the
/// first byte of the SHA-256 of the name, which keeps every bucket about
/// equally full regardless of how the sequence advances.
#[derive(Debug)]
pub(crate) struct FileAllocator {
    root: PathBuf,
    next_seq: Mutex<u64>,
}

impl FileAllocator {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_seq: Mutex::new(now_millis() << 16),
        }
    }

    /// Reserves a backing file that did not exist at call time.
    pub(crate) fn allocate(&self) -> Result<AllocatedFile> {
        let mut next_seq = lock(&self.next_seq);
        for _ in 0..MAX_PROBE_ATTEMPTS {
            let seq = *next_seq;
            *next_seq = next_seq.wrapping_add(1);

            let name = format!("{seq:016x}.{BLOB_EXTENSION}");
            let bucket = bucket_for(&name);
            let file_name = format!("{bucket}/{name}");
            let path = self.root.join(&bucket).join(&name);

            match create_new(&path) {
                Ok(file) => {
                    return Ok(AllocatedFile {
                        file_name,
                        path,
                        file,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::trace!(
                        target = "lru_disk_cache",
                        file_name = %file_name,
                        "backing file name already taken; probing next"
                    );
                }
                Err(err) => return Err(CacheError::from(err)),
            }
        }
        Err(CacheError::AllocationExhausted {
            attempts: MAX_PROBE_ATTEMPTS,
        })
    }
}

/// Two lowercase hex digits naming the bucket directory for `name`.
pub(crate) fn bucket_for(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..1])
}

/// Returns `true` for directory names the allocator can produce.
pub(crate) fn is_bucket_name(name: &str) -> bool {
    name.len() == 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn create_new(path: &Path) -> io::Result<File> {
    let open = || OpenOptions::new().write(true).create_new(true).open(path);
    match open() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            open()
        }
        other => other,
    }
}
