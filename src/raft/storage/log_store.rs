use std::{collections::BTreeMap, fmt::Debug, ops::RangeBounds, sync::Arc};

use openraft::{
    ErrorSubject, ErrorVerb, LogId, LogState, RaftLogReader, Vote, storage::RaftLogStorage,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::debug;

use super::kv_err;
use crate::{
    kv::{KvError, KvStore},
    raft::types::{NodeId, TypeConfig},
};

type Entry = openraft::impls::Entry<TypeConfig>;

pub const VOTE_KEY: &str = "raft_vote";
pub const COMMITTED_KEY: &str = "raft_committed";
pub const LAST_PURGED_KEY: &str = "raft_last_purged";
const LOG_KEY_PREFIX: &str = "log-";

/// Zero-padded so that key order matches index order.
pub fn log_key(index: u64) -> String {
    format!("{LOG_KEY_PREFIX}{index:020}")
}

#[derive(Debug)]
struct LogInner {
    last_purged_log_id: Option<LogId<NodeId>>,
    entries: BTreeMap<u64, Entry>,
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

impl LogInner {
    fn last_log_id(&self) -> Option<LogId<NodeId>> {
        self.entries
            .values()
            .next_back()
            .map(|ent| ent.log_id)
            .or(self.last_purged_log_id)
    }
}

/// Raft log kept in memory and written through to the KV store, one key per entry.
#[derive(Debug, Clone)]
pub struct KvLogStore {
    kv: Arc<KvStore>,
    inner: Arc<Mutex<LogInner>>,
}

impl KvLogStore {
    pub async fn open(kv: Arc<KvStore>) -> Result<Self, openraft::StorageError<NodeId>> {
        let vote = read_json::<Vote<NodeId>>(&kv, VOTE_KEY)
            .await
            .map_err(|e| kv_err(ErrorSubject::Vote, ErrorVerb::Read, e))?;
        let committed = read_json::<LogId<NodeId>>(&kv, COMMITTED_KEY)
            .await
            .map_err(|e| kv_err(ErrorSubject::Store, ErrorVerb::Read, e))?;
        let last_purged_log_id = read_json::<LogId<NodeId>>(&kv, LAST_PURGED_KEY)
            .await
            .map_err(|e| kv_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;

        let keys = kv
            .list_keys()
            .await
            .map_err(|e| kv_err(ErrorSubject::Logs, ErrorVerb::Read, e))?;
        let mut entries = BTreeMap::new();
        for key in keys.iter().filter(|k| k.starts_with(LOG_KEY_PREFIX)) {
            let Some(ent) = read_json::<Entry>(&kv, key)
                .await
                .map_err(|e| kv_err(ErrorSubject::Logs, ErrorVerb::Read, e))?
            else {
                continue;
            };
            entries.insert(ent.log_id.index, ent);
        }
        debug!(
            entries = entries.len(),
            has_vote = vote.is_some(),
            "raft log loaded"
        );

        Ok(Self {
            kv,
            inner: Arc::new(Mutex::new(LogInner {
                last_purged_log_id,
                entries,
                vote,
                committed,
            })),
        })
    }

    async fn delete_entries(&self, indexes: Vec<u64>) -> Result<(), openraft::StorageError<NodeId>> {
        for index in indexes {
            match self.kv.delete(&log_key(index)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(kv_err(ErrorSubject::Logs, ErrorVerb::Delete, e)),
            }
        }
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for KvLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + openraft::OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.range(range).map(|(_, ent)| ent.clone()).collect())
    }
}

impl RaftLogStorage<TypeConfig> for KvLogStore {
    type LogReader = KvLogStore;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<TypeConfig>, openraft::StorageError<NodeId>> {
        let inner = self.inner.lock().await;
        Ok(LogState {
            last_purged_log_id: inner.last_purged_log_id,
            last_log_id: inner.last_log_id(),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        write_json(&self.kv, VOTE_KEY, vote)
            .await
            .map_err(|e| kv_err(ErrorSubject::Vote, ErrorVerb::Write, e))?;
        self.inner.lock().await.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.inner.lock().await.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let res = match &committed {
            Some(log_id) => write_json(&self.kv, COMMITTED_KEY, log_id).await,
            None => match self.kv.delete(COMMITTED_KEY).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
        };
        res.map_err(|e| kv_err(ErrorSubject::Store, ErrorVerb::Write, e))?;
        self.inner.lock().await.committed = committed;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.inner.lock().await.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: openraft::storage::LogFlushed<TypeConfig>,
    ) -> Result<(), openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        let mut inner = self.inner.lock().await;
        let mut res = Ok(());
        for ent in entries {
            if let Err(e) = write_json(&self.kv, &log_key(ent.log_id.index), &ent).await {
                res = Err(kv_err(ErrorSubject::Logs, ErrorVerb::Write, e));
                break;
            }
            inner.entries.insert(ent.log_id.index, ent);
        }
        drop(inner);

        callback.log_io_completed(
            res.as_ref()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        res
    }

    async fn truncate(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        let removed: Vec<u64> = {
            let mut inner = self.inner.lock().await;
            inner.entries.split_off(&log_id.index).into_keys().collect()
        };
        debug!(from = log_id.index, count = removed.len(), "raft log truncated");
        self.delete_entries(removed).await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), openraft::StorageError<NodeId>> {
        write_json(&self.kv, LAST_PURGED_KEY, &log_id)
            .await
            .map_err(|e| kv_err(ErrorSubject::Logs, ErrorVerb::Write, e))?;
        let removed: Vec<u64> = {
            let mut inner = self.inner.lock().await;
            let kept = inner.entries.split_off(&(log_id.index + 1));
            let removed = std::mem::replace(&mut inner.entries, kept);
            inner.last_purged_log_id = Some(log_id);
            removed.into_keys().collect()
        };
        self.delete_entries(removed).await
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    kv: &KvStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match kv.get(key).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| KvError::Io(std::io::Error::other(e))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) async fn write_json<T: Serialize>(
    kv: &KvStore,
    key: &str,
    value: &T,
) -> Result<(), KvError> {
    let bytes = serde_json::to_vec(value).map_err(|e| KvError::Io(std::io::Error::other(e)))?;
    kv.set(key, &bytes).await
}
