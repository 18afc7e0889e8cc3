//! Versioned on-disk cache state.
//!
//! Layout (bincode, fixed-width little-endian integers, `u64` length prefixes
//! for strings and byte blobs):
//!
//! ```text
//! version: string
//! capacity_kb: u32, usage_kb: u32, entry_count: u32
//! entry_count × { key: string, size: u64, file_name: string,
//!                 last_access_millis: u64, flags: u32, extra_info: bytes }
//! [deletion_count: u32, deletion_count × file_name: string]
//! ```
//!
//! Entries are stored MRU first. The trailing deletion section was added
//! after the first release and is optional when reading. Capacity and usage
//! are informational; usage is recomputed from the entries on load.

use crate::entry::{Entry, FLAG_COMPLETE, FLAG_HAS_EXTRA_INFO};
use crate::error::{CacheError, Result};
use crate::util::{
    atomic_write_with, bincode_options, bincode_options_limited, is_contained_file_name,
};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Name of the live state file inside the cache directory.
pub const STATE_FILE_NAME: &str = "cache.state";

/// Version tag written at the start of the state file.
pub const STATE_FORMAT_VERSION: &str = "lru-disk-cache/1";

/// Upper bound on entries pre-allocated from an untrusted count.
const MAX_PREALLOCATED_ENTRIES: usize = 4096;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheState {
    pub(crate) capacity_kb: u32,
    pub(crate) usage_kb: u32,
    /// MRU first.
    pub(crate) entries: Vec<Entry>,
    pub(crate) deletions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateCounts {
    capacity_kb: u32,
    usage_kb: u32,
    entry_count: u32,
}

#[derive(Debug, Serialize)]
struct PersistedEntry<'a> {
    key: &'a str,
    size: u64,
    file_name: &'a str,
    last_access_millis: u64,
    flags: u32,
    extra_info: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct PersistedEntryOwned {
    key: String,
    size: u64,
    file_name: String,
    last_access_millis: u64,
    flags: u32,
    extra_info: Vec<u8>,
}

impl PersistedEntryOwned {
    fn into_entry(self) -> Result<Entry> {
        if !is_contained_file_name(&self.file_name) {
            return Err(CacheError::bad_format(format!(
                "entry file name {:?} escapes the cache directory",
                self.file_name
            )));
        }
        Ok(Entry {
            key: self.key,
            size: self.size,
            file_name: self.file_name,
            last_access_millis: self.last_access_millis,
            extra_info: (self.flags & FLAG_HAS_EXTRA_INFO != 0).then_some(self.extra_info),
            complete: self.flags & FLAG_COMPLETE != 0,
        })
    }
}

/// Converts a byte count to KiB, rounding up and saturating at `u32::MAX`.
pub(crate) fn bytes_to_kb(bytes: u64) -> u32 {
    u32::try_from(bytes.div_ceil(1024)).unwrap_or(u32::MAX)
}

/// Atomically replaces the state file at `path`.
pub(crate) fn write_state(path: &Path, state: &CacheState) -> Result<()> {
    atomic_write_with(path, |out| {
        write_sections(out, state, true)?;
        Ok(())
    })
}

fn write_sections(out: &mut impl Write, state: &CacheState, with_deletions: bool) -> Result<()> {
    let opts = bincode_options();
    let entry_count = u32::try_from(state.entries.len())
        .map_err(|_| CacheError::bad_format("too many entries to persist"))?;

    opts.serialize_into(&mut *out, STATE_FORMAT_VERSION)?;
    opts.serialize_into(
        &mut *out,
        &StateCounts {
            capacity_kb: state.capacity_kb,
            usage_kb: state.usage_kb,
            entry_count,
        },
    )?;
    for entry in &state.entries {
        opts.serialize_into(
            &mut *out,
            &PersistedEntry {
                key: &entry.key,
                size: entry.size,
                file_name: &entry.file_name,
                last_access_millis: entry.last_access_millis,
                flags: entry.flags(),
                extra_info: entry.extra_info.as_deref().unwrap_or_default(),
            },
        )?;
    }

    if with_deletions {
        let deletion_count = u32::try_from(state.deletions.len())
            .map_err(|_| CacheError::bad_format("too many deferred deletions to persist"))?;
        opts.serialize_into(&mut *out, &deletion_count)?;
        for file_name in &state.deletions {
            opts.serialize_into(&mut *out, file_name.as_str())?;
        }
    }
    Ok(())
}

/// Reads the state file at `path`.
///
/// Returns `Ok(None)` if there is no state file yet.
pub(crate) fn read_state(path: &Path) -> Result<Option<CacheState>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    read_sections(&mut reader).map(Some)
}

fn read_sections(reader: &mut impl BufRead) -> Result<CacheState> {
    let opts = bincode_options_limited();

    let version: String = opts
        .deserialize_from(&mut *reader)
        .map_err(|err| CacheError::bad_format(format!("unreadable version tag: {err}")))?;
    if version != STATE_FORMAT_VERSION {
        return Err(CacheError::UnsupportedVersion { found: version });
    }

    let counts: StateCounts = opts.deserialize_from(&mut *reader)?;
    let entry_count = counts.entry_count as usize;
    let mut entries = Vec::with_capacity(entry_count.min(MAX_PREALLOCATED_ENTRIES));
    for _ in 0..entry_count {
        let persisted: PersistedEntryOwned = opts.deserialize_from(&mut *reader)?;
        entries.push(persisted.into_entry()?);
    }

    let mut deletions = Vec::new();
    if !reader.fill_buf()?.is_empty() {
        let deletion_count: u32 = opts.deserialize_from(&mut *reader)?;
        for _ in 0..deletion_count {
            let file_name: String = opts.deserialize_from(&mut *reader)?;
            if !is_contained_file_name(&file_name) {
                return Err(CacheError::bad_format(format!(
                    "deferred file name {file_name:?} escapes the cache directory"
                )));
            }
            deletions.push(file_name);
        }
    }

    Ok(CacheState {
        capacity_kb: counts.capacity_kb,
        usage_kb: counts.usage_kb,
        entries,
        deletions,
    })
}
