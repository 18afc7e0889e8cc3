mod logging;
mod persistence;

use lru_disk_cache::{DiskCache, DiskCacheConfig};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Opens a cache whose background save never fires within a test run.
pub(crate) fn open_quiet(dir: &Path, capacity_kb: u64) -> DiskCache {
    let config =
        DiskCacheConfig::new(dir, capacity_kb).with_save_interval(Duration::from_secs(3600));
    DiskCache::with_config(config).unwrap()
}

pub(crate) fn put(cache: &DiskCache, key: &str, content: &[u8]) {
    put_with_info(cache, key, content, None);
}

pub(crate) fn put_with_info(cache: &DiskCache, key: &str, content: &[u8], info: Option<&[u8]>) {
    let mut sink = cache.add(key, content.len() as u64, info).unwrap();
    sink.write_all(content).unwrap();
    sink.commit().unwrap();
}

/// Looks `key` up and reads its whole content.
pub(crate) fn read(cache: &DiskCache, key: &str) -> Option<Vec<u8>> {
    let entry = cache.lookup(key)?;
    let mut stream = cache.open_entry(&entry).ok()?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();
    stream.close();
    Some(bytes)
}

/// Every backing file currently inside a bucket directory.
pub(crate) fn blob_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for bucket in std::fs::read_dir(dir).unwrap() {
        let bucket = bucket.unwrap();
        if !bucket.file_type().unwrap().is_dir() {
            continue;
        }
        for file in std::fs::read_dir(bucket.path()).unwrap() {
            let path = file.unwrap().path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("blob") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
