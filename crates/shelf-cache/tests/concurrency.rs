use shelf_cache::{CacheStore, CacheStoreConfig, CaptureStack, LockPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const HOUR: Duration = Duration::from_secs(3600);
const PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

fn generous_locks() -> LockPolicy {
    LockPolicy {
        timeout: Duration::from_secs(30),
        retry_interval: Duration::from_millis(1),
        require_lock: true,
    }
}

#[test]
fn concurrent_writers_never_interleave() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(
        CacheStore::open(CacheStoreConfig::new(tmp.path()).lock_policy(generous_locks())).unwrap(),
    );

    let payload_a = vec![b'a'; PAYLOAD_BYTES];
    let payload_b = vec![b'b'; PAYLOAD_BYTES / 2];
    let writers: Vec<_> = [payload_a.clone(), payload_b.clone()]
        .into_iter()
        .map(|payload| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..8 {
                    assert!(store.store_raw("shared", &payload).unwrap());
                }
            })
        })
        .collect();

    let reader = {
        let store = Arc::clone(&store);
        let (a, b) = (payload_a.clone(), payload_b.clone());
        thread::spawn(move || {
            for _ in 0..32 {
                if let Some(seen) = store.get_raw("shared", HOUR) {
                    assert!(
                        seen == a || seen == b,
                        "reader observed a torn entry of {} bytes",
                        seen.len()
                    );
                }
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    reader.join().unwrap();

    let final_contents = store.get_raw("shared", HOUR).unwrap();
    assert!(final_contents == payload_a || final_contents == payload_b);
}

#[test]
fn independent_instances_share_one_directory() {
    let tmp = TempDir::new().unwrap();
    let threads = 16;

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let root = tmp.path().to_path_buf();
            thread::spawn(move || {
                let store = CacheStore::open(CacheStoreConfig::new(root)).unwrap();
                let key = format!("entry-{i}");
                assert!(store.store(key.as_str(), &i).unwrap());
                key
            })
        })
        .collect();

    let reader = CacheStore::open(CacheStoreConfig::new(tmp.path())).unwrap();
    for (i, handle) in handles.into_iter().enumerate() {
        let key = handle.join().unwrap();
        assert_eq!(reader.get::<usize>(key.as_str(), HOUR).unwrap(), Some(i));
    }
}

#[test]
fn first_writes_race_readers_without_exposing_partial_entries() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(CacheStoreConfig::new(tmp.path())).unwrap());
    let keys: Arc<Vec<String>> = Arc::new((0..300).map(|i| format!("fresh-{i}")).collect());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let (store, keys, done) = (Arc::clone(&store), Arc::clone(&keys), Arc::clone(&done));
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    for (i, key) in keys.iter().enumerate() {
                        let value = store
                            .get::<u64>(key.as_str(), HOUR)
                            .unwrap_or_else(|err| panic!("{key}: {err}"));
                        assert!(value.is_none() || value == Some(i as u64 * 7));

                        let mut stack = CaptureStack::new(Arc::clone(&store), Vec::new());
                        let scope = stack.start_scoped(key.as_str(), HOUR);
                        if !scope.should_compute() {
                            let replayed = scope.finish(false).unwrap();
                            assert!(
                                !replayed.contents().is_empty(),
                                "{key}: replayed an empty fragment"
                            );
                        }
                    }
                }
            })
        })
        .collect();

    let writer = {
        let (store, keys) = (Arc::clone(&store), Arc::clone(&keys));
        thread::spawn(move || {
            for (i, key) in keys.iter().enumerate() {
                assert!(store.store(key.as_str(), &(i as u64 * 7)).unwrap());
            }
        })
    };

    writer.join().unwrap();
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    for (i, key) in keys.iter().enumerate() {
        assert_eq!(store.get::<u64>(key.as_str(), HOUR).unwrap(), Some(i as u64 * 7));
    }
}
