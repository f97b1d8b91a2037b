//! Manual-lock flags shared between control loops and operator commands.
//!
//! A lock flag freezes its control loop: while set, no degrade or recover
//! action fires. Setting or reading a flag never fails from the caller's
//! point of view; store errors are logged and the last known value is used.
//!
//! [`FileLockStore`] keeps the flags in a small JSON object file so that
//! several processes (the relay and `relayguard lock`) see the same state.
//! Every access holds an advisory `fs2` lock on that file. The lock is only
//! ever tried, a few times, never waited on: a contended file falls back to
//! the in-process mirror and a write that could not land is retried on the
//! next access.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

/// Tries at the advisory file lock per access, [`LOCK_RETRY`] apart.
const LOCK_ATTEMPTS: u32 = 5;
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Key-value store of boolean flags.
pub trait LockStore: Send + Sync {
    fn get(&self, key: &str, default: bool) -> bool;
    fn put(&self, key: &str, value: bool);
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Flags kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    values: Mutex<HashMap<String, bool>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn get(&self, key: &str, default: bool) -> bool {
        guard(&self.values).get(key).copied().unwrap_or(default)
    }

    fn put(&self, key: &str, value: bool) {
        guard(&self.values).insert(key.to_string(), value);
    }
}

/// Flags kept in a JSON file, shared across processes.
#[derive(Debug)]
pub struct FileLockStore {
    path: PathBuf,
    mirror: Mutex<Mirror>,
}

/// Last value seen or written per key, and keys whose write is still owed
/// to the file.
#[derive(Debug, Default)]
struct Mirror {
    values: HashMap<String, bool>,
    unflushed: HashSet<String>,
}

impl FileLockStore {
    /// Use `path`, creating it (and its parent directory) if missing.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        open_file(&path)?;
        Ok(Self {
            path,
            mirror: Mutex::new(Mirror::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All flags currently in the file.
    pub fn entries(&self) -> io::Result<HashMap<String, bool>> {
        let _mirror = guard(&self.mirror);
        self.read_all()
    }

    fn read_all(&self) -> io::Result<HashMap<String, bool>> {
        let mut file = open_file(&self.path)?;
        acquire(&file, false)?;
        let result = read_map(&mut file);
        let _ = FileExt::unlock(&file);
        result
    }

    fn write_entry(&self, key: &str, value: bool) -> io::Result<()> {
        let mut file = open_file(&self.path)?;
        acquire(&file, true)?;
        let result = (|| {
            let mut map = read_map(&mut file).unwrap_or_default();
            map.insert(key.to_string(), value);
            let bytes = serde_json::to_vec_pretty(&map)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&bytes)?;
            file.sync_data()
        })();
        let _ = FileExt::unlock(&file);
        result
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Take the advisory lock without ever blocking on it: [`LOCK_ATTEMPTS`]
/// non-blocking tries, then the contention error is returned.
fn acquire(file: &File, exclusive: bool) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(file)
        } else {
            FileExt::try_lock_shared(file)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(err) if is_contended(&err) && attempt < LOCK_ATTEMPTS => {
                attempt += 1;
                std::thread::sleep(LOCK_RETRY);
            }
            Err(err) => return Err(err),
        }
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn read_map(file: &mut File) -> io::Result<HashMap<String, bool>> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut text)?;
    if text.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

impl LockStore for FileLockStore {
    fn get(&self, key: &str, default: bool) -> bool {
        let mut mirror = guard(&self.mirror);

        if mirror.unflushed.contains(key) {
            let value = mirror.values.get(key).copied().unwrap_or(default);
            match self.write_entry(key, value) {
                Ok(()) => {
                    mirror.unflushed.remove(key);
                    debug!(path = %self.path.display(), key, value, "deferred lock write flushed");
                }
                Err(err) => {
                    debug!(path = %self.path.display(), key, error = %err, "lock store still unavailable");
                }
            }
            return value;
        }

        match self.read_all() {
            Ok(map) => {
                let value = map.get(key).copied().unwrap_or(default);
                mirror.values.insert(key.to_string(), value);
                value
            }
            Err(err) => {
                let value = mirror.values.get(key).copied().unwrap_or(default);
                warn!(
                    path = %self.path.display(),
                    key,
                    value,
                    error = %err,
                    "lock store unreadable; using last known value"
                );
                value
            }
        }
    }

    fn put(&self, key: &str, value: bool) {
        let mut mirror = guard(&self.mirror);
        mirror.values.insert(key.to_string(), value);
        match self.write_entry(key, value) {
            Ok(()) => {
                mirror.unflushed.remove(key);
            }
            Err(err) => {
                mirror.unflushed.insert(key.to_string());
                warn!(
                    path = %self.path.display(),
                    key,
                    value,
                    error = %err,
                    "lock store write failed; kept in memory and retried on next access"
                );
            }
        }
    }
}

/// One named flag in a [`LockStore`].
#[derive(Clone)]
pub struct SharedLockFlag {
    store: Arc<dyn LockStore>,
    key: String,
}

impl std::fmt::Debug for SharedLockFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLockFlag")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SharedLockFlag {
    pub fn new(store: Arc<dyn LockStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// A flag backed by its own in-memory store.
    pub fn in_memory(key: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryLockStore::new()), key)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value; unset reads as unlocked.
    pub fn get(&self) -> bool {
        self.store.get(&self.key, false)
    }

    pub fn put(&self, value: bool) {
        self.store.put(&self.key, value);
    }

    pub fn lock(&self) {
        self.put(true);
        info!(key = %self.key, "manual lock set");
    }

    pub fn unlock(&self) {
        self.put(false);
        info!(key = %self.key, "manual lock cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_defaults_and_overrides() {
        let store = MemoryLockStore::new();
        assert!(!store.get("scene_lock", false));
        assert!(store.get("scene_lock", true));
        store.put("scene_lock", true);
        assert!(store.get("scene_lock", false));
    }

    #[test]
    fn flags_share_a_store_by_key() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let scene = SharedLockFlag::new(Arc::clone(&store), "scene_lock");
        let scene_again = SharedLockFlag::new(Arc::clone(&store), "scene_lock");
        let bitrate = SharedLockFlag::new(store, "bitrate_lock");

        scene.lock();
        assert!(scene_again.get());
        assert!(!bitrate.get());
        scene_again.unlock();
        assert!(!scene.get());
    }

    #[test]
    fn file_store_is_visible_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("locks.json");
        let writer = FileLockStore::open(&path).unwrap();
        let reader = FileLockStore::open(&path).unwrap();

        assert!(!reader.get("scene_lock", false));
        writer.put("scene_lock", true);
        writer.put("bitrate_lock", false);
        assert!(reader.get("scene_lock", false));

        let entries = reader.entries().unwrap();
        assert_eq!(entries.get("scene_lock"), Some(&true));
        assert_eq!(entries.get("bitrate_lock"), Some(&false));
    }

    #[test]
    fn corrupt_file_falls_back_to_last_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.json");
        let store = FileLockStore::open(&path).unwrap();
        store.put("scene_lock", true);

        std::fs::write(&path, "{not json").unwrap();
        assert!(store.get("scene_lock", false));
        assert!(!store.get("other", false));

        store.put("scene_lock", false);
        let text = std::fs::read_to_string(&path).unwrap();
        let map: HashMap<String, bool> = serde_json::from_str(&text).unwrap();
        assert_eq!(map.get("scene_lock"), Some(&false));
    }

    #[test]
    fn held_file_lock_never_blocks_get_or_put() {
        use std::sync::mpsc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.json");
        let store = Arc::new(FileLockStore::open(&path).unwrap());
        store.put("scene_lock", true);

        // Another process (here: another open file description) holds the lock.
        let holder = open_file(&path).unwrap();
        FileExt::lock_exclusive(&holder).unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&store);
        std::thread::spawn(move || {
            let before = worker.get("scene_lock", false);
            worker.put("scene_lock", false);
            let after = worker.get("scene_lock", true);
            let _ = tx.send((before, after));
        });
        let (before, after) = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("lock store calls must not wait on a held file lock");
        assert!(before);
        assert!(!after);

        // The owed write lands once the file is free again.
        FileExt::unlock(&holder).unwrap();
        assert!(!store.get("scene_lock", true));
        let on_disk: HashMap<String, bool> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("scene_lock"), Some(&false));
        assert!(!store.get("scene_lock", true));
    }

    #[test]
    fn shorter_rewrite_leaves_no_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks.json");
        let store = FileLockStore::open(&path).unwrap();
        store.put("a_rather_long_key_name", true);
        std::fs::write(&path, "").unwrap();
        store.put("k", true);
        assert!(serde_json::from_str::<HashMap<String, bool>>(
            &std::fs::read_to_string(&path).unwrap()
        )
        .is_ok());
    }
}
