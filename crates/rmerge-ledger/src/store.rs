//! Document store with an explicit read-modify-write contract.
//!
//! Ledgers never write documents directly: every mutation goes through
//! [`DocumentStore::read_modify_write`], which runs the whole
//! read → mutate → write sequence while holding the key exclusively.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};

/// Lock files older than this are assumed to belong to a dead writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

/// Delay between attempts to take a held lock file.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// A mutation applied under the store's exclusive lock.
///
/// Receives the current document (if any) and returns the document to
/// store. Returning an error aborts the write.
pub type Mutation = Box<dyn FnOnce(Option<Value>) -> LedgerResult<Value> + Send>;

/// Persistent key/document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document.
    async fn get(&self, key: &str) -> LedgerResult<Option<Value>>;

    /// Replace a document unconditionally.
    async fn upsert(&self, key: &str, document: Value) -> LedgerResult<()>;

    /// Read, mutate and write a document as one exclusive step.
    async fn read_modify_write(&self, key: &str, mutate: Mutation) -> LedgerResult<Value>;
}

/// Load a typed document.
pub async fn load<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> LedgerResult<Option<T>> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| LedgerError::corrupt(key, e.to_string())),
        None => Ok(None),
    }
}

/// Run a typed read-modify-write, returning whatever the closure returns.
///
/// A missing document starts from `T::default()`.
pub async fn update<T, R, F>(store: &dyn DocumentStore, key: &str, f: F) -> LedgerResult<R>
where
    T: Serialize + DeserializeOwned + Default + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> LedgerResult<R> + Send + 'static,
{
    let slot: Arc<StdMutex<Option<R>>> = Arc::new(StdMutex::new(None));
    let out = Arc::clone(&slot);
    let owned_key = key.to_string();

    store
        .read_modify_write(
            key,
            Box::new(move |current| {
                let mut document: T = match current {
                    Some(value) => serde_json::from_value(value)
                        .map_err(|e| LedgerError::corrupt(&owned_key, e.to_string()))?,
                    None => T::default(),
                };
                let result = f(&mut document)?;
                let value = serde_json::to_value(&document)?;
                *out.lock().unwrap_or_else(|p| p.into_inner()) = Some(result);
                Ok(value)
            }),
        )
        .await?;

    let result = slot.lock().unwrap_or_else(|p| p.into_inner()).take();
    result.ok_or_else(|| LedgerError::corrupt(key, "mutation produced no result"))
}

/// Validate a document key: `/`-separated segments of `[A-Za-z0-9._-]`.
fn validate_key(key: &str) -> LedgerResult<()> {
    let valid = !key.is_empty()
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        });

    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidKey(key.to_string()))
    }
}

// ============================================================================
// JSON file store
// ============================================================================

/// Store keeping one pretty-printed JSON file per key under a root directory.
///
/// Writes go to a temporary file in the same directory and are renamed over
/// the target, so readers never observe a partial document. Writers are
/// serialized per key in-process by an async mutex and across processes by
/// an exclusive `<key>.json.lock` file.
pub struct JsonFileStore {
    root: PathBuf,
    lock_timeout: Duration,
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonFileStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(30),
            key_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Create a store from ledger configuration.
    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(&config.ledger_dir).with_lock_timeout(config.lock_timeout)
    }

    /// Set how long writers wait for the cross-process lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path backing a key.
    pub fn path_for(&self, key: &str) -> LedgerResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    async fn read_path(key: &str, path: &Path) -> LedgerResult<Option<Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LedgerError::corrupt(key, e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LedgerError::Io(e)),
        }
    }

    async fn write_path(path: &Path, document: Value) -> LedgerResult<()> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&parent).await?;

        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> LedgerResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            serde_json::to_writer_pretty(&mut tmp, &document)?;
            tmp.write_all(b"\n")?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| LedgerError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| LedgerError::Io(std::io::Error::other(e)))?
    }

    /// Run `f` while holding both the in-process and cross-process locks.
    async fn exclusive<F>(&self, key: &str, f: F) -> LedgerResult<Value>
    where
        F: FnOnce(Option<Value>) -> LedgerResult<Value>,
    {
        let path = self.path_for(key)?;
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;
        let _file_lock = LockFile::acquire(&lock_path_for(&path), key, self.lock_timeout).await?;

        let current = Self::read_path(key, &path).await?;
        let next = f(current)?;
        Self::write_path(&path, next.clone()).await?;
        debug!(key = key, "Wrote ledger document");
        Ok(next)
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, key: &str) -> LedgerResult<Option<Value>> {
        let path = self.path_for(key)?;
        Self::read_path(key, &path).await
    }

    async fn upsert(&self, key: &str, document: Value) -> LedgerResult<()> {
        self.exclusive(key, move |_| Ok(document)).await.map(|_| ())
    }

    async fn read_modify_write(&self, key: &str, mutate: Mutation) -> LedgerResult<Value> {
        self.exclusive(key, mutate).await
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Exclusive lock file, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    async fn acquire(path: &Path, key: &str, timeout: Duration) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::is_stale(path).await {
                        warn!(key = key, "Removing stale ledger lock {}", path.display());
                        let _ = tokio::fs::remove_file(path).await;
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(LedgerError::LockTimeout(key.to_string()));
                    }
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => return Err(LedgerError::Io(e)),
            }
        }
    }

    async fn is_stale(path: &Path) -> bool {
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > STALE_LOCK_AGE)
            .unwrap_or(false)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-process store, used for single-node runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> LedgerResult<Option<Value>> {
        validate_key(key)?;
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &str, document: Value) -> LedgerResult<()> {
        validate_key(key)?;
        self.documents.lock().await.insert(key.to_string(), document);
        Ok(())
    }

    async fn read_modify_write(&self, key: &str, mutate: Mutation) -> LedgerResult<Value> {
        validate_key(key)?;
        let mut documents = self.documents.lock().await;
        let next = mutate(documents.get(key).cloned())?;
        documents.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("dedup/acct").is_ok());
        assert!(validate_key("merges").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a b").is_err());
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.get("dedup/acct").await.unwrap().is_none());
        store
            .upsert("dedup/acct", serde_json::json!({"value": 3}))
            .await
            .unwrap();

        let doc: Counter = load(&store, "dedup/acct").await.unwrap().unwrap();
        assert_eq!(doc.value, 3);
        assert!(dir.path().join("dedup/acct.json").exists());
        assert!(!dir.path().join("dedup/acct.json.lock").exists());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        tokio::fs::write(dir.path().join("merges.json"), b"{not json")
            .await
            .unwrap();

        let err = store.get("merges").await.unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));

        // The corrupt file is left untouched.
        let err = update::<Counter, _, _>(&store, "merges", |c| {
            c.value += 1;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
        let raw = tokio::fs::read(dir.path().join("merges.json")).await.unwrap();
        assert_eq!(raw, b"{not json");
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let store = MemoryStore::new();
        let err = update::<Counter, (), _>(&store, "k", |c| {
            c.value = 9;
            Err(LedgerError::scan("boom"))
        })
        .await;
        assert!(err.is_err());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                update::<Counter, _, _>(store.as_ref(), "counter", |c| {
                    c.value += 1;
                    Ok(c.value)
                })
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc: Counter = load(store.as_ref(), "counter").await.unwrap().unwrap();
        assert_eq!(doc.value, 20);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).with_lock_timeout(Duration::from_millis(50));
        // Simulate another process holding the lock.
        tokio::fs::write(dir.path().join("held.json.lock"), b"")
            .await
            .unwrap();

        let err = store
            .upsert("held", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout(_)));
    }
}
