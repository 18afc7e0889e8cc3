use super::{blob_files, open_quiet, put, put_with_info, read, wait_until};
use lru_disk_cache::{DiskCache, DiskCacheConfig, STATE_FILE_NAME, STATE_FORMAT_VERSION};
use std::io::Write;
use std::time::Duration;

#[test]
fn index_survives_a_restart_in_recency_order() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put_with_info(&cache, "a", b"alpha", Some(b"info-a".as_slice()));
        put(&cache, "b", b"beta");
        put_with_info(&cache, "c", b"gamma", Some(b"".as_slice()));
        assert!(cache.lookup("a").is_some());
        assert_eq!(cache.keys(), ["a", "c", "b"]);
    }

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.keys(), ["a", "c", "b"]);
    assert_eq!(cache.space_used(), 14);

    let a = cache.lookup("a").unwrap();
    assert_eq!(a.extra_info.as_deref(), Some(b"info-a".as_slice()));
    assert!(a.last_access_millis > 0);
    assert_eq!(
        cache.lookup("c").unwrap().extra_info.as_deref(),
        Some(b"".as_slice())
    );
    assert_eq!(cache.lookup("b").unwrap().extra_info, None);

    assert_eq!(read(&cache, "a").unwrap(), b"alpha");
    assert_eq!(read(&cache, "b").unwrap(), b"beta");
    assert_eq!(read(&cache, "c").unwrap(), b"gamma");
}

#[test]
fn lookup_alone_is_persisted() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"1");
        put(&cache, "b", b"2");
        cache.save().unwrap();
        assert!(!cache.is_dirty());

        assert!(cache.lookup("a").is_some());
        assert!(cache.is_dirty());
    }

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.keys(), ["a", "b"]);
}

#[test]
fn reopening_with_a_smaller_capacity_drops_lru_entries() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 4);
        for key in ["a", "b", "c"] {
            put(&cache, key, &[0; 1000]);
        }
    }

    let cache = open_quiet(tmp.path(), 2);
    assert_eq!(cache.keys(), ["c", "b"]);
    assert_eq!(cache.space_used(), 2000);
    assert_eq!(blob_files(tmp.path()).len(), 2);
    assert!(cache.is_dirty());
}

#[test]
fn close_discards_entries_that_were_never_committed() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "keep", b"committed");
        let mut sink = cache.add("pending", 4, None).unwrap();
        sink.write_all(b"half").unwrap();

        cache.close();
        assert!(cache.lookup("pending").is_none());
        assert_eq!(cache.keys(), ["keep"]);
        drop(sink);

        cache.close();
    }

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.keys(), ["keep"]);
    assert_eq!(read(&cache, "keep").unwrap(), b"committed");
    assert_eq!(blob_files(tmp.path()).len(), 1);
    assert_eq!(cache.sweep(), 0);
}

#[test]
fn corrupt_state_starts_empty_and_cleans_up() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
        put(&cache, "b", b"beta");
    }
    assert_eq!(blob_files(tmp.path()).len(), 2);
    std::fs::write(tmp.path().join(STATE_FILE_NAME), b"\x07garbage").unwrap();

    {
        let cache = open_quiet(tmp.path(), 16);
        assert_eq!(cache.num_entries(), 0);
        assert_eq!(cache.space_used(), 0);
        assert!(blob_files(tmp.path()).is_empty());
        assert!(cache.is_dirty());

        put(&cache, "fresh", b"new");
    }

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.keys(), ["fresh"]);
}

#[test]
fn truncated_state_starts_empty() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
    }
    let path = tmp.path().join(STATE_FILE_NAME);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.num_entries(), 0);
}

#[test]
fn missing_state_removes_unknown_backing_files() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
    }
    std::fs::remove_file(tmp.path().join(STATE_FILE_NAME)).unwrap();

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.num_entries(), 0);
    assert!(blob_files(tmp.path()).is_empty());
}

#[test]
fn open_removes_orphans_but_not_unrelated_files() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    {
        let cache = open_quiet(root, 16);
        put(&cache, "a", b"alpha");
    }

    std::fs::create_dir_all(root.join("ab")).unwrap();
    std::fs::write(root.join("ab/ffffffffffffffff.blob"), b"orphan").unwrap();
    std::fs::write(root.join(format!("{STATE_FILE_NAME}.tmp.999.0")), b"torn").unwrap();
    std::fs::create_dir_all(root.join("notes")).unwrap();
    std::fs::write(root.join("notes/keep.blob"), b"unrelated").unwrap();
    std::fs::write(root.join("README"), b"unrelated").unwrap();

    let cache = open_quiet(root, 16);
    assert_eq!(read(&cache, "a").unwrap(), b"alpha");
    assert!(!root.join("ab/ffffffffffffffff.blob").exists());
    assert!(!root.join(format!("{STATE_FILE_NAME}.tmp.999.0")).exists());
    assert!(root.join("notes/keep.blob").exists());
    assert!(root.join("README").exists());
}

#[test]
fn state_file_starts_with_the_format_version() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = open_quiet(tmp.path(), 16);
    put(&cache, "a", b"alpha");
    cache.save().unwrap();

    let bytes = std::fs::read(tmp.path().join(STATE_FILE_NAME)).unwrap();
    let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
    assert_eq!(len, STATE_FORMAT_VERSION.len());
    assert_eq!(&bytes[8..8 + len], STATE_FORMAT_VERSION.as_bytes());

    let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[test]
fn failed_save_stays_dirty_and_keeps_the_previous_state() {
    let tmp = tempfile::tempdir().unwrap();
    let state_path = tmp.path().join(STATE_FILE_NAME);
    let saved_copy = tmp.path().join("saved-state.bak");
    {
        let cache = open_quiet(tmp.path(), 16);
        put(&cache, "a", b"alpha");
        put(&cache, "b", b"beta");
        cache.save().unwrap();
        assert_eq!(cache.keys(), ["b", "a"]);

        // A non-empty directory in place of the state file makes the final
        // rename fail.
        std::fs::rename(&state_path, &saved_copy).unwrap();
        std::fs::create_dir(&state_path).unwrap();
        std::fs::write(state_path.join("occupied"), b"x").unwrap();

        put(&cache, "c", b"gamma");
        assert!(cache.lookup("a").is_some());
        assert!(cache.save().is_err());
        assert!(cache.is_dirty());
        assert!(state_path.join("occupied").exists());

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    std::fs::remove_dir_all(&state_path).unwrap();
    std::fs::rename(&saved_copy, &state_path).unwrap();

    let cache = open_quiet(tmp.path(), 16);
    assert_eq!(cache.keys(), ["b", "a"]);
    assert_eq!(read(&cache, "a").unwrap(), b"alpha");
    assert_eq!(read(&cache, "b").unwrap(), b"beta");
    assert_eq!(blob_files(tmp.path()).len(), 2);
}

#[test]
fn background_task_saves_after_a_mutation() {
    let tmp = tempfile::tempdir().unwrap();
    let state_path = tmp.path().join(STATE_FILE_NAME);
    let config =
        DiskCacheConfig::new(tmp.path(), 16).with_save_interval(Duration::from_millis(20));
    let cache = DiskCache::with_config(config).unwrap();

    put(&cache, "background-key", b"content");
    assert!(wait_until(|| !cache.is_dirty() && state_path.exists()));

    let bytes = std::fs::read(&state_path).unwrap();
    assert!(bytes
        .windows(b"background-key".len())
        .any(|window| window == b"background-key"));
}

#[test]
fn save_interval_can_be_changed_at_runtime() {
    let tmp = tempfile::tempdir().unwrap();
    let state_path = tmp.path().join(STATE_FILE_NAME);
    let cache = open_quiet(tmp.path(), 16);

    assert_eq!(cache.save_interval(), Duration::from_secs(3600));
    cache.set_save_interval(Duration::from_millis(10));
    assert_eq!(cache.save_interval(), Duration::from_millis(10));
    put(&cache, "k", b"v");
    assert!(wait_until(|| !cache.is_dirty() && state_path.exists()));
}
