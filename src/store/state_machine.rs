use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership,
};
use parking_lot::RwLock;
use tracing::{info, warn};

use super::entry::{self, GET_OPERATION, SET_OPERATION};
use super::types::{ApplyError, ClusterNode, NodeId, Response, TypeConfig};
use crate::cache::Cache;

/// Raft state machine applying committed entries to the byte cache.
///
/// The cache is the entire replicated state: snapshots serialize every
/// entry as a SET record through the log-entry codec, and installing a
/// snapshot replays that stream. Apply is the only mutation path.
#[derive(Clone)]
pub struct StateMachineStore {
    raft_dir: PathBuf,
    state: Arc<RwLock<StateMachineState>>,
    cache: Arc<dyn Cache>,
}

#[derive(Debug, Clone, Default)]
struct StateMachineState {
    last_applied_log: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, ClusterNode>,
}

impl StateMachineStore {
    pub fn new(raft_dir: PathBuf, cache: Arc<dyn Cache>) -> Self {
        if let Err(e) = fs::create_dir_all(&raft_dir) {
            warn!(error = %e, dir = %raft_dir.display(), "could not create raft dir");
        }
        Self {
            raft_dir,
            state: Arc::new(RwLock::new(StateMachineState::default())),
            cache,
        }
    }

    fn apply_entry(&self, data: &[u8]) -> Response {
        let (op, key, value) = match entry::decode(data) {
            Ok(decoded) => decoded,
            Err(e) => return Response::fail(ApplyError::Malformed(e.to_string())),
        };

        match op {
            SET_OPERATION => match self.cache.set(key, value.to_vec()) {
                Ok(()) => Response::ok(None),
                Err(e) => Response::fail(ApplyError::Cache(e.to_string())),
            },
            GET_OPERATION => match self.cache.get(key) {
                Ok(value) => Response::ok(Some(value)),
                Err(e) => Response::fail(ApplyError::Cache(e.to_string())),
            },
            // decode only yields known tags
            other => Response::fail(ApplyError::Malformed(format!("operation tag {other}"))),
        }
    }

    /// Serializes the whole cache as concatenated SET records.
    fn persist(&self) -> Vec<u8> {
        let entries = self.cache.entries();
        let total: usize = entries
            .iter()
            .map(|(k, v)| entry::encoded_len(k, v))
            .sum();
        let mut buf = Vec::with_capacity(total);
        for (key, value) in entries {
            buf.extend_from_slice(&entry::encode(SET_OPERATION, &key, &value));
        }
        buf
    }

    /// Replays a [`persist`](Self::persist) stream into the cache.
    fn restore(&self, mut data: &[u8]) -> crate::error::Result<()> {
        while !data.is_empty() {
            let (op, key, value) = entry::decode(data)?;
            if op == SET_OPERATION {
                self.cache.set(key, value.to_vec())?;
            }
            let consumed = entry::encoded_len(key, value);
            data = &data[consumed..];
        }
        Ok(())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let (last_applied, last_membership) = {
            let state = self.state.read();
            (state.last_applied_log, state.last_membership.clone())
        };

        let data = self.persist();
        let snapshot_id = format!(
            "snapshot-{}",
            last_applied.map(|l| l.index).unwrap_or_default()
        );

        // keep the latest snapshot on disk under <data-dir>/raft/
        let path = self.raft_dir.join(format!("{snapshot_id}.bin"));
        if let Err(e) = fs::write(&path, &data) {
            warn!(error = %e, path = %path.display(), "failed to write snapshot file");
        }

        info!(id = %snapshot_id, bytes = data.len(), "built snapshot");

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, ClusterNode>), StorageError<NodeId>>
    {
        let state = self.state.read();
        Ok((state.last_applied_log, state.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();

        for ent in entries {
            {
                let mut state = self.state.write();
                state.last_applied_log = Some(ent.log_id);
                if let EntryPayload::Membership(ref membership) = ent.payload {
                    state.last_membership =
                        StoredMembership::new(Some(ent.log_id), membership.clone());
                }
            }

            match ent.payload {
                EntryPayload::Normal(ref request) => {
                    responses.push(self.apply_entry(&request.data));
                }
                EntryPayload::Membership(_) | EntryPayload::Blank => {
                    responses.push(Response::ok(None));
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, ClusterNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        self.restore(&data).map_err(|e| {
            StorageIOError::read_snapshot(
                None,
                &std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
            )
        })?;

        let mut state = self.state.write();
        state.last_applied_log = meta.last_log_id;
        state.last_membership = meta.last_membership.clone();

        info!(id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let snapshot = self.build_snapshot().await?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use tempfile::TempDir;

    fn machine(cache: Arc<dyn Cache>) -> (StateMachineStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (
            StateMachineStore::new(dir.path().join("raft"), cache),
            dir,
        )
    }

    #[test]
    fn set_entries_mutate_the_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let (sm, _dir) = machine(cache.clone());

        let response = sm.apply_entry(&entry::encode(SET_OPERATION, "k", b"v"));
        assert!(response.error.is_none());
        assert_eq!(cache.get("k").unwrap(), b"v");
    }

    #[test]
    fn get_entries_read_without_mutating() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        cache.set("k", b"v".to_vec()).unwrap();
        let (sm, _dir) = machine(cache.clone());

        let response = sm.apply_entry(&entry::encode(GET_OPERATION, "k", b""));
        assert_eq!(response.value.unwrap(), b"v");
        assert_eq!(cache.entries().len(), 1);
    }

    #[test]
    fn malformed_entries_surface_as_apply_errors() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let (sm, _dir) = machine(cache);

        let response = sm.apply_entry(&[0xff, 0x00]);
        assert!(matches!(response.error, Some(ApplyError::Malformed(_))));
    }

    #[test]
    fn restore_mirrors_persist() {
        let source: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        source.set("hello1", b"value1".to_vec()).unwrap();
        source.set("hello2", b"value2".to_vec()).unwrap();
        let (sm, _dir) = machine(source);
        let stream = sm.persist();

        let target: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let (sm2, _dir2) = machine(target.clone());
        sm2.restore(&stream).unwrap();

        assert_eq!(target.get("hello1").unwrap(), b"value1");
        assert_eq!(target.get("hello2").unwrap(), b"value2");
    }
}
