//! Byte-oriented key/value store backing consensus metadata and snapshots.
//!
//! Two backends share one contract: a directory on disk (one file per key, snapshots under
//! `snapshots/`) and a plain in-memory map. The store knows nothing about the fleet domain.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
};

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::RwLock,
};

pub const SNAPSHOT_DIR: &str = "snapshots";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const TMP_SUFFIX: &str = ".tmp";
/// Keys become file names, and the temp file adds [`TMP_SUFFIX`] within the usual 255-byte limit.
pub const MAX_KEY_LEN: usize = 255 - TMP_SUFFIX.len();
const BACKUP_SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum KvError {
    NotFound { key: String },
    InvalidKey { key: String, reason: &'static str },
    Io(io::Error),
    Backup(String),
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::InvalidKey { key, reason } => write!(f, "invalid key {key:?}: {reason}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Backup(reason) => write!(f, "invalid backup: {reason}"),
        }
    }
}

impl std::error::Error for KvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for KvError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

pub fn validate_key(key: &str) -> Result<(), KvError> {
    let reason = if key.is_empty() {
        "empty"
    } else if key.len() > MAX_KEY_LEN {
        "too long"
    } else if key.contains(['/', '\\']) {
        "contains a path separator"
    } else if key.contains('\0') {
        "contains NUL"
    } else if key.starts_with('.') {
        "starts with a dot"
    } else if key.ends_with(TMP_SUFFIX) {
        "ends with .tmp"
    } else if key == SNAPSHOT_DIR {
        "reserved"
    } else {
        return Ok(());
    };
    Err(KvError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

#[derive(Debug)]
enum Backend {
    Disk {
        dir: PathBuf,
        last_snapshot_ts: u64,
    },
    Memory {
        entries: BTreeMap<String, Vec<u8>>,
        snapshot: Option<(u64, Vec<u8>)>,
    },
}

#[derive(Debug)]
pub struct KvStore {
    backend: RwLock<Backend>,
}

impl KvStore {
    pub fn in_memory() -> Self {
        Self {
            backend: RwLock::new(Backend::Memory {
                entries: BTreeMap::new(),
                snapshot: None,
            }),
        }
    }

    /// Opens (creating if needed) a directory-backed store. The directory is owned exclusively.
    pub async fn open_dir(dir: impl AsRef<Path>) -> Result<Self, KvError> {
        let dir = dir.as_ref().to_path_buf();
        let snapshot_dir = dir.join(SNAPSHOT_DIR);
        let last_snapshot_ts = blocking(move || {
            std::fs::create_dir_all(&snapshot_dir)?;
            Ok(list_snapshot_timestamps(&snapshot_dir)?
                .last()
                .copied()
                .unwrap_or(0))
        })
        .await?;
        Ok(Self {
            backend: RwLock::new(Backend::Disk {
                dir,
                last_snapshot_ts,
            }),
        })
    }

    pub async fn is_durable(&self) -> bool {
        matches!(*self.backend.read().await, Backend::Disk { .. })
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        validate_key(key)?;
        let mut backend = self.backend.write().await;
        match &mut *backend {
            Backend::Disk { dir, .. } => write_bytes(dir.join(key), value.to_vec()).await?,
            Backend::Memory { entries, .. } => {
                entries.insert(key.to_string(), value.to_vec());
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, KvError> {
        validate_key(key)?;
        let backend = self.backend.read().await;
        let found = match &*backend {
            Backend::Disk { dir, .. } => read_bytes(dir.join(key)).await?,
            Backend::Memory { entries, .. } => entries.get(key).cloned(),
        };
        found.ok_or_else(|| KvError::NotFound {
            key: key.to_string(),
        })
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        let mut backend = self.backend.write().await;
        let existed = match &mut *backend {
            Backend::Disk { dir, .. } => remove_file(dir.join(key)).await?,
            Backend::Memory { entries, .. } => entries.remove(key).is_some(),
        };
        if existed {
            Ok(())
        } else {
            Err(KvError::NotFound {
                key: key.to_string(),
            })
        }
    }

    pub async fn list_keys(&self) -> Result<BTreeSet<String>, KvError> {
        let backend = self.backend.read().await;
        match &*backend {
            Backend::Disk { dir, .. } => {
                let dir = dir.clone();
                Ok(blocking(move || list_key_files(&dir)).await?)
            }
            Backend::Memory { entries, .. } => Ok(entries.keys().cloned().collect()),
        }
    }

    /// Stores a new snapshot payload and prunes the older ones. Timestamps are wall-clock
    /// milliseconds, bumped when needed so that they strictly increase.
    pub async fn store_snapshot(&self, bytes: &[u8]) -> Result<u64, KvError> {
        let mut backend = self.backend.write().await;
        match &mut *backend {
            Backend::Disk {
                dir,
                last_snapshot_ts,
            } => {
                let ts = next_snapshot_ts(*last_snapshot_ts);
                let snapshot_dir = dir.join(SNAPSHOT_DIR);
                write_bytes(snapshot_dir.join(snapshot_file_name(ts)), bytes.to_vec()).await?;
                *last_snapshot_ts = ts;
                blocking(move || prune_snapshots(&snapshot_dir, ts)).await?;
                Ok(ts)
            }
            Backend::Memory { snapshot, .. } => {
                let last = snapshot.as_ref().map(|(ts, _)| *ts).unwrap_or(0);
                let ts = next_snapshot_ts(last);
                *snapshot = Some((ts, bytes.to_vec()));
                Ok(ts)
            }
        }
    }

    pub async fn load_latest_snapshot(&self) -> Result<Vec<u8>, KvError> {
        let backend = self.backend.read().await;
        let found = match &*backend {
            Backend::Disk { dir, .. } => {
                let snapshot_dir = dir.join(SNAPSHOT_DIR);
                blocking(move || {
                    let Some(ts) = list_snapshot_timestamps(&snapshot_dir)?.last().copied() else {
                        return Ok(None);
                    };
                    read_optional(&snapshot_dir.join(snapshot_file_name(ts)))
                })
                .await?
            }
            Backend::Memory { snapshot, .. } => snapshot.as_ref().map(|(_, bytes)| bytes.clone()),
        };
        found.ok_or_else(|| KvError::NotFound {
            key: "snapshot".to_string(),
        })
    }

    /// Writes every key plus the latest snapshot as one JSON document. Mutations wait until the
    /// backup is complete.
    pub async fn backup<W: AsyncWrite + Unpin>(&self, mut writer: W) -> Result<(), KvError> {
        let backend = self.backend.read().await;
        let (entries, snapshot) = match &*backend {
            Backend::Disk { dir, .. } => {
                let dir = dir.clone();
                blocking(move || {
                    let mut entries = BTreeMap::new();
                    for key in list_key_files(&dir)? {
                        if let Some(bytes) = read_optional(&dir.join(&key))? {
                            entries.insert(key, bytes);
                        }
                    }
                    let snapshot_dir = dir.join(SNAPSHOT_DIR);
                    let snapshot = match list_snapshot_timestamps(&snapshot_dir)?.last().copied() {
                        Some(ts) => read_optional(&snapshot_dir.join(snapshot_file_name(ts)))?
                            .map(|bytes| (ts, bytes)),
                        None => None,
                    };
                    Ok((entries, snapshot))
                })
                .await?
            }
            Backend::Memory { entries, snapshot } => (entries.clone(), snapshot.clone()),
        };

        let doc = StoreBackup::encode(&entries, snapshot.as_ref());
        let bytes = serde_json::to_vec_pretty(&doc).map_err(io::Error::other)?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        drop(backend);
        Ok(())
    }

    /// Replaces the whole store with a backup. The document is fully decoded before anything
    /// is cleared; a malformed backup leaves the store untouched.
    pub async fn restore<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<(), KvError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        let doc: StoreBackup =
            serde_json::from_slice(&raw).map_err(|e| KvError::Backup(e.to_string()))?;
        let (entries, snapshot) = doc.decode()?;

        let mut backend = self.backend.write().await;
        match &mut *backend {
            Backend::Disk {
                dir,
                last_snapshot_ts,
            } => {
                let dir_for_task = dir.clone();
                let restored_snapshot = snapshot.clone();
                blocking(move || {
                    for key in list_key_files(&dir_for_task)? {
                        std::fs::remove_file(dir_for_task.join(key))?;
                    }
                    let snapshot_dir = dir_for_task.join(SNAPSHOT_DIR);
                    std::fs::create_dir_all(&snapshot_dir)?;
                    prune_snapshots(&snapshot_dir, u64::MAX)?;
                    for (key, bytes) in &entries {
                        write_atomic(&dir_for_task.join(key), bytes)?;
                    }
                    if let Some((ts, bytes)) = &restored_snapshot {
                        write_atomic(&snapshot_dir.join(snapshot_file_name(*ts)), bytes)?;
                    }
                    Ok(())
                })
                .await?;
                if let Some((ts, _)) = snapshot {
                    *last_snapshot_ts = (*last_snapshot_ts).max(ts);
                }
            }
            Backend::Memory {
                entries: current,
                snapshot: current_snapshot,
            } => {
                *current = entries;
                *current_snapshot = snapshot;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreBackup {
    schema_version: u32,
    #[serde(default)]
    entries: BTreeMap<String, String>,
    #[serde(default)]
    latest_snapshot: Option<BackupSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupSnapshot {
    timestamp: u64,
    data: String,
}

type DecodedBackup = (BTreeMap<String, Vec<u8>>, Option<(u64, Vec<u8>)>);

impl StoreBackup {
    fn encode(entries: &BTreeMap<String, Vec<u8>>, snapshot: Option<&(u64, Vec<u8>)>) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            schema_version: BACKUP_SCHEMA_VERSION,
            entries: entries
                .iter()
                .map(|(key, bytes)| (key.clone(), b64.encode(bytes)))
                .collect(),
            latest_snapshot: snapshot.map(|(ts, bytes)| BackupSnapshot {
                timestamp: *ts,
                data: b64.encode(bytes),
            }),
        }
    }

    fn decode(self) -> Result<DecodedBackup, KvError> {
        if self.schema_version != BACKUP_SCHEMA_VERSION {
            return Err(KvError::Backup(format!(
                "schema_version mismatch: expected {BACKUP_SCHEMA_VERSION}, got {}",
                self.schema_version
            )));
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut entries = BTreeMap::new();
        for (key, data) in self.entries {
            validate_key(&key)?;
            let bytes = b64
                .decode(data.as_bytes())
                .map_err(|e| KvError::Backup(format!("entry {key}: {e}")))?;
            entries.insert(key, bytes);
        }
        let snapshot = match self.latest_snapshot {
            Some(s) => {
                let bytes = b64
                    .decode(s.data.as_bytes())
                    .map_err(|e| KvError::Backup(format!("snapshot: {e}")))?;
                Some((s.timestamp, bytes))
            }
            None => None,
        };
        Ok((entries, snapshot))
    }
}

fn next_snapshot_ts(last: u64) -> u64 {
    let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
    now.max(last.saturating_add(1))
}

fn snapshot_file_name(ts: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{ts:020}")
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

async fn read_bytes(path: PathBuf) -> io::Result<Option<Vec<u8>>> {
    blocking(move || read_optional(&path)).await
}

async fn write_bytes(path: PathBuf, bytes: Vec<u8>) -> io::Result<()> {
    blocking(move || write_atomic(&path, &bytes)).await
}

async fn remove_file(path: PathBuf) -> io::Result<bool> {
    blocking(move || match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    })
    .await
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!("{}{TMP_SUFFIX}", file_name.to_string_lossy()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)
}

fn list_key_files(dir: &Path) -> io::Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if validate_key(&name).is_ok() {
            keys.insert(name);
        }
    }
    Ok(keys)
}

fn list_snapshot_timestamps(snapshot_dir: &Path) -> io::Result<Vec<u64>> {
    let mut timestamps = Vec::new();
    for entry in std::fs::read_dir(snapshot_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(ts) = name
            .to_str()
            .and_then(|n| n.strip_prefix(SNAPSHOT_PREFIX))
            .and_then(|n| n.parse::<u64>().ok())
        else {
            continue;
        };
        timestamps.push(ts);
    }
    timestamps.sort_unstable();
    Ok(timestamps)
}

/// Removes every snapshot older than `keep_ts`.
fn prune_snapshots(snapshot_dir: &Path, keep_ts: u64) -> io::Result<()> {
    for ts in list_snapshot_timestamps(snapshot_dir)? {
        if ts < keep_ts {
            std::fs::remove_file(snapshot_dir.join(snapshot_file_name(ts)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    async fn both_backends(tmp: &TempDir) -> Vec<(&'static str, KvStore)> {
        vec![
            ("disk", KvStore::open_dir(tmp.path()).await.unwrap()),
            ("memory", KvStore::in_memory()),
        ]
    }

    #[tokio::test]
    async fn set_get_delete_behave_the_same_on_both_backends() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, store) in both_backends(&tmp).await {
            store.set("raft_vote", b"v1").await.unwrap();
            store.set("raft_vote", b"v2").await.unwrap();
            store.set("log-1", b"entry").await.unwrap();
            assert_eq!(store.get("raft_vote").await.unwrap(), b"v2", "{name}");

            let keys: Vec<_> = store.list_keys().await.unwrap().into_iter().collect();
            assert_eq!(keys, vec!["log-1".to_string(), "raft_vote".to_string()], "{name}");

            store.delete("log-1").await.unwrap();
            assert!(store.get("log-1").await.unwrap_err().is_not_found(), "{name}");
            assert!(store.delete("log-1").await.unwrap_err().is_not_found(), "{name}");
        }
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let store = KvStore::in_memory();
        for key in ["", "../etc", "a/b", ".hidden", "x.tmp", SNAPSHOT_DIR] {
            let err = store.set(key, b"x").await.unwrap_err();
            assert!(matches!(err, KvError::InvalidKey { .. }), "{key}: {err}");
        }
    }

    #[tokio::test]
    async fn both_backends_reject_keys_the_filesystem_cannot_hold() {
        let tmp = tempfile::tempdir().unwrap();
        let longest = "k".repeat(MAX_KEY_LEN);
        let too_long = "k".repeat(MAX_KEY_LEN + 1);
        for (name, store) in both_backends(&tmp).await {
            for key in ["nul\0byte", too_long.as_str()] {
                let err = store.set(key, b"x").await.unwrap_err();
                assert!(matches!(err, KvError::InvalidKey { .. }), "{name}: {err}");
                let err = store.get(key).await.unwrap_err();
                assert!(matches!(err, KvError::InvalidKey { .. }), "{name}: {err}");
            }
            store.set(&longest, b"ok").await.unwrap();
            assert_eq!(store.get(&longest).await.unwrap(), b"ok", "{name}");
        }
    }

    #[tokio::test]
    async fn disk_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = KvStore::open_dir(tmp.path()).await.unwrap();
            store.set("raft_committed", b"42").await.unwrap();
            store.store_snapshot(b"snap").await.unwrap();
        }
        let store = KvStore::open_dir(tmp.path()).await.unwrap();
        assert!(store.is_durable().await);
        assert_eq!(store.get("raft_committed").await.unwrap(), b"42");
        assert_eq!(store.load_latest_snapshot().await.unwrap(), b"snap");
        assert_eq!(
            store.list_keys().await.unwrap(),
            BTreeSet::from(["raft_committed".to_string()])
        );
    }

    #[tokio::test]
    async fn latest_snapshot_wins_and_older_ones_are_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        for (name, store) in both_backends(&tmp).await {
            assert!(
                store.load_latest_snapshot().await.unwrap_err().is_not_found(),
                "{name}"
            );
            let first = store.store_snapshot(b"one").await.unwrap();
            let second = store.store_snapshot(b"two").await.unwrap();
            assert!(second > first, "{name}");
            assert_eq!(store.load_latest_snapshot().await.unwrap(), b"two", "{name}");
        }
        let remaining = list_snapshot_timestamps(&tmp.path().join(SNAPSHOT_DIR)).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn backup_restores_into_either_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let source = KvStore::open_dir(tmp.path().join("source")).await.unwrap();
        source.set("raft_vote", &[0, 159, 146, 150]).await.unwrap();
        source.set("log-00000000000000000001", b"{}").await.unwrap();
        source.store_snapshot(b"snapshot-bytes").await.unwrap();

        let mut doc = Vec::new();
        source.backup(&mut doc).await.unwrap();

        let disk_target = KvStore::open_dir(tmp.path().join("target")).await.unwrap();
        disk_target.set("stale", b"old").await.unwrap();
        for target in [disk_target, KvStore::in_memory()] {
            target.restore(doc.as_slice()).await.unwrap();
            assert_eq!(target.list_keys().await.unwrap(), source.list_keys().await.unwrap());
            assert_eq!(
                target.get("raft_vote").await.unwrap(),
                vec![0, 159, 146, 150]
            );
            assert_eq!(target.load_latest_snapshot().await.unwrap(), b"snapshot-bytes");
        }
    }

    #[tokio::test]
    async fn malformed_backup_leaves_store_untouched() {
        let store = KvStore::in_memory();
        store.set("keep", b"me").await.unwrap();

        let bad_base64 = serde_json::json!({
            "schema_version": BACKUP_SCHEMA_VERSION,
            "entries": {"k": "%%%"},
        })
        .to_string();
        for doc in [b"not json".to_vec(), bad_base64.into_bytes()] {
            let err = store.restore(doc.as_slice()).await.unwrap_err();
            assert!(matches!(err, KvError::Backup(_)), "{err}");
        }
        assert_eq!(store.get("keep").await.unwrap(), b"me");
    }
}
